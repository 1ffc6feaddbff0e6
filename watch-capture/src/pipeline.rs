use std::sync::Arc;

use tracing::{debug, info};
use watch_worker::queue::DeliveryQueue;

use crate::api::{self, Ack, Message, PipelineHandle, PipelineInbox};
use crate::filter::EmissionFilter;
use crate::time::TimeSource;

/// One pipeline instance: the emission filter and the delivery queue for a
/// single observed document context.
///
/// All state is in memory and owned here. Messages are handled one at a
/// time, so the filter and the enqueue are never interleaved.
pub struct Pipeline {
    filter: EmissionFilter,
    queue: DeliveryQueue,
    timesource: Arc<dyn TimeSource + Send + Sync>,
}

impl Pipeline {
    pub fn new(
        filter: EmissionFilter,
        queue: DeliveryQueue,
        timesource: Arc<dyn TimeSource + Send + Sync>,
    ) -> Self {
        Self {
            filter,
            queue,
            timesource,
        }
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    /// Handle one message and produce its acknowledgement.
    pub fn handle(&mut self, message: Message) -> Ack {
        let kind = message.kind();

        let ack = match message {
            Message::Ping => Ack::ok(),
            Message::VideoEvent(event) => {
                let now = self.timesource.now_millis();

                if self.filter.accept(&event, now) {
                    debug!(subject_id = event.subject_id(), "queueing event");
                    metrics::counter!("watch_events_queued_total").increment(1);
                    self.queue.enqueue(event);
                    Ack::queued()
                } else {
                    info!(subject_id = event.subject_id(), "skipping duplicate event");
                    metrics::counter!("watch_events_skipped_total").increment(1);
                    Ack::skipped()
                }
            }
        };

        let outcome = match (&ack.skipped, &ack.queued) {
            (Some(true), _) => "skipped",
            (_, Some(true)) => "queued",
            _ => "ok",
        };
        metrics::counter!("watch_messages_total", "type" => kind, "outcome" => outcome)
            .increment(1);

        ack
    }

    /// Handle messages until every `PipelineHandle` is dropped.
    pub async fn run(mut self, mut inbox: PipelineInbox) {
        while let Some((message, responder)) = inbox.recv().await {
            let ack = self.handle(message);
            responder.respond(ack);
        }

        info!("pipeline stopped, {} events left in queue", self.queue.len());
    }

    /// Run the pipeline on its own task and return a handle to message it.
    pub fn spawn(self, buffer: usize) -> PipelineHandle {
        let (handle, inbox) = api::channel(buffer);
        tokio::spawn(self.run(inbox));
        handle
    }
}
