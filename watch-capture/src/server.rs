use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use watch_common::health::{ComponentStatus, HealthRegistry};
use watch_common::metrics::with_metrics_route;
use watch_worker::error::{DeliveryError, SideloadError};
use watch_worker::queue::DeliveryQueue;
use watch_worker::sideload::ResourceSideloader;
use watch_worker::sink::{HttpSink, PrintSink, TransportSink};

use crate::config::Config;
use crate::detector::{ChangeDetector, ExtractionRules};
use crate::document::LiveDocument;
use crate::filter::EmissionFilter;
use crate::observer::Observer;
use crate::pipeline::Pipeline;
use crate::router;
use crate::time::{MonotonicTime, TimeSource};

const CHANNEL_BUFFER: usize = 64;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("invalid collector endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    Sideload(#[from] SideloadError),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
    #[error("server failed: {0}")]
    Io(#[from] std::io::Error),
}

fn create_sink(
    config: &Config,
    liveness: &HealthRegistry,
) -> Result<Arc<dyn TransportSink + Send + Sync>, ServerError> {
    if config.print_sink {
        // Nothing reaches a collector with the print sink, never report it as healthy.
        liveness
            .register("print_sink", config.poll_interval.0)
            .report_status(ComponentStatus::Unhealthy);

        Ok(Arc::new(PrintSink {}))
    } else {
        let endpoint = config.log_endpoint()?;
        tracing::info!(%endpoint, "delivering events to collector");

        Ok(Arc::new(HttpSink::new(endpoint, config.log_timeout.0)?))
    }
}

/// Wire up one pipeline, its observer and the sideloader, and return the
/// router state that reaches all of them.
pub fn build_state(config: &Config, liveness: HealthRegistry) -> Result<router::State, ServerError> {
    let timesource: Arc<dyn TimeSource + Send + Sync> = Arc::new(MonotonicTime::new());

    let queue = DeliveryQueue::new(
        create_sink(config, &liveness)?,
        config.retry_policy.policy(),
    );
    let pipeline = Pipeline::new(
        EmissionFilter::new(config.suppression_window.0),
        queue,
        timesource.clone(),
    )
    .spawn(CHANNEL_BUFFER);

    let document = LiveDocument::default();
    let observer_liveness = liveness.register("observer", config.poll_interval.0 * 3);
    let observer = Observer::new(
        Arc::new(document.clone()),
        ChangeDetector::new(ExtractionRules::watch_page()),
        config.debounce_delay.0,
        config.poll_interval.0,
        timesource,
        pipeline.clone(),
    )
    .with_liveness(observer_liveness)
    .spawn(CHANNEL_BUFFER);

    let sideloader = if config.sideload {
        Some(ResourceSideloader::new(
            config.resource_endpoint()?,
            config.resource_timeout.0,
        )?)
    } else {
        None
    };

    Ok(router::State {
        pipeline,
        observer,
        document,
        sideloader,
        liveness,
    })
}

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let liveness = HealthRegistry::new("liveness");
    let state = build_state(&config, liveness)?;

    let app = router::router(state);
    // Installing a global recorder when used as a library (during tests etc)
    // does not work well, so only the binary asks for it.
    let app = if config.export_prometheus {
        with_metrics_route(app)?
    } else {
        app
    };

    tracing::info!("listening on {:?}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
