use axum::extract;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::debug;
use watch_common::health::{HealthRegistry, HealthStatus};
use watch_common::metrics::track_metrics;
use watch_worker::sideload::{ResourceLoaded, ResourceSideloader};

use crate::api::{Ack, PipelineHandle};
use crate::document::{DocumentSnapshot, LiveDocument};
use crate::observer::{ObserverHandle, Trigger};

/// Everything the host bridge talks to.
#[derive(Clone)]
pub struct State {
    pub pipeline: PipelineHandle,
    pub observer: ObserverHandle,
    pub document: LiveDocument,
    pub sideloader: Option<ResourceSideloader>,
    pub liveness: HealthRegistry,
}

/// A document change pushed by the host, with what caused it.
#[derive(Debug, Deserialize)]
pub struct DocumentUpdate {
    pub trigger: Trigger,
    pub snapshot: DocumentSnapshot,
}

async fn index() -> &'static str {
    "watch-capture"
}

async fn liveness(extract::State(state): extract::State<State>) -> HealthStatus {
    state.liveness.get_status()
}

async fn message(extract::State(state): extract::State<State>, body: Bytes) -> Ack {
    state.pipeline.send_json(&body).await
}

async fn document(
    extract::State(state): extract::State<State>,
    Json(update): Json<DocumentUpdate>,
) -> StatusCode {
    debug!(url = %update.snapshot.url, trigger = ?update.trigger, "document update");

    state.document.replace(update.snapshot);
    state.observer.trigger(update.trigger).await;

    StatusCode::ACCEPTED
}

async fn resource(
    extract::State(state): extract::State<State>,
    Json(resource): Json<ResourceLoaded>,
) -> StatusCode {
    match &state.sideloader {
        // The upload task runs detached, its outcome is only logged.
        Some(sideloader) => drop(sideloader.on_resource_loaded(resource)),
        None => debug!(url = %resource.url, "sideloading disabled, ignoring resource"),
    }

    StatusCode::ACCEPTED
}

pub fn router(state: State) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_liveness", get(liveness))
        .route("/message", post(message))
        .route("/document", post(document))
        .route("/resource", post(resource))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state)
}
