//! The observing side: watches one document, runs the change detector when
//! triggered, and forwards new candidates into the pipeline.
//!
//! Three trigger sources feed a single evaluation function:
//! - navigation settled and structural mutations go through the debouncer,
//! - the fixed-interval poll evaluates directly.
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use watch_common::event::EmissionKey;
use watch_common::health::HealthHandle;

use crate::api::{Ack, Message, PipelineHandle};
use crate::debounce::Debouncer;
use crate::detector::ChangeDetector;
use crate::document::Document;
use crate::time::TimeSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    NavigationSettled,
    Mutation,
    Poll,
}

/// Result of one evaluation of the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// No subject in the current document.
    Nothing,
    /// Same subject and content as the last forwarded candidate.
    Unchanged,
    /// Forwarded to the pipeline, with its acknowledgement.
    Forwarded(Ack),
}

impl Evaluation {
    fn label(&self) -> &'static str {
        match self {
            Evaluation::Nothing => "nothing",
            Evaluation::Unchanged => "unchanged",
            Evaluation::Forwarded(_) => "forwarded",
        }
    }
}

/// Thin adapters the host calls from its own callbacks.
#[derive(Clone)]
pub struct ObserverHandle {
    sender: mpsc::Sender<Trigger>,
}

impl ObserverHandle {
    pub async fn trigger(&self, trigger: Trigger) {
        if self.sender.send(trigger).await.is_err() {
            warn!(?trigger, "observer is not running, dropping trigger");
        }
    }

    pub async fn navigation_settled(&self) {
        self.trigger(Trigger::NavigationSettled).await
    }

    pub async fn mutation(&self) {
        self.trigger(Trigger::Mutation).await
    }

    pub async fn poll(&self) {
        self.trigger(Trigger::Poll).await
    }
}

pub struct Observer {
    document: Arc<dyn Document + Send + Sync>,
    detector: ChangeDetector,
    debouncer: Debouncer,
    poll_interval: Duration,
    timesource: Arc<dyn TimeSource + Send + Sync>,
    pipeline: PipelineHandle,
    last_forwarded: Option<EmissionKey>,
    liveness: Option<HealthHandle>,
}

impl Observer {
    pub fn new(
        document: Arc<dyn Document + Send + Sync>,
        detector: ChangeDetector,
        debounce_delay: Duration,
        poll_interval: Duration,
        timesource: Arc<dyn TimeSource + Send + Sync>,
        pipeline: PipelineHandle,
    ) -> Self {
        Self {
            document,
            detector,
            debouncer: Debouncer::new(debounce_delay),
            poll_interval,
            timesource,
            pipeline,
            last_forwarded: None,
            liveness: None,
        }
    }

    /// Report healthy on start and on every poll tick.
    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Evaluate the document now: detect, drop unchanged candidates, forward the rest.
    pub async fn evaluate(&mut self) -> Evaluation {
        let observed_at = self.timesource.now_millis();

        let evaluation = match self.detector.detect(self.document.as_ref(), observed_at) {
            None => Evaluation::Nothing,
            Some(candidate) => {
                let key = candidate.emission_key();
                if self.last_forwarded.as_ref() == Some(&key) {
                    Evaluation::Unchanged
                } else {
                    self.last_forwarded = Some(key);
                    debug!(subject_id = candidate.subject_id(), "forwarding candidate");

                    let ack = self.pipeline.send(Message::VideoEvent(candidate)).await;
                    if !ack.ok {
                        warn!(error = ?ack.error, "pipeline rejected candidate");
                    }
                    Evaluation::Forwarded(ack)
                }
            }
        };

        metrics::counter!("watch_observer_evaluations_total", "result" => evaluation.label())
            .increment(1);
        evaluation
    }

    fn report_healthy(&self) {
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy();
        }
    }

    /// Run on its own task, returning the handle the host feeds triggers into.
    pub fn spawn(self, buffer: usize) -> ObserverHandle {
        let (sender, receiver) = mpsc::channel(buffer);
        tokio::spawn(self.run(receiver));
        ObserverHandle { sender }
    }

    /// Process triggers until every `ObserverHandle` is dropped.
    pub async fn run(mut self, mut triggers: mpsc::Receiver<Trigger>) {
        let ack = self.pipeline.send(Message::Ping).await;
        info!(ok = ack.ok, "pipeline ping");
        self.report_healthy();

        // The document may already hold a subject before any trigger fires.
        self.debouncer.trigger();

        let mut poll = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                trigger = triggers.recv() => match trigger {
                    Some(Trigger::Poll) => {
                        self.evaluate().await;
                    }
                    Some(Trigger::NavigationSettled | Trigger::Mutation) => self.debouncer.trigger(),
                    None => break,
                },
                _ = self.debouncer.elapsed() => {
                    self.evaluate().await;
                }
                _ = poll.tick() => {
                    self.report_healthy();
                    self.evaluate().await;
                }
            }
        }

        info!("observer stopped");
    }
}
