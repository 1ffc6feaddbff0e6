use std::time;

use async_trait::async_trait;
use reqwest::header;
use watch_common::event::CandidateEvent;

use crate::error::DeliveryError;

/// Performs one delivery attempt of an event. Implementations keep no state
/// between calls and never retry on their own: the queue owns retries.
#[async_trait]
pub trait TransportSink {
    async fn deliver(&self, event: &CandidateEvent) -> Result<(), DeliveryError>;
}

/// Logs events instead of sending them. Used when no collector is running.
pub struct PrintSink {}

#[async_trait]
impl TransportSink for PrintSink {
    async fn deliver(&self, event: &CandidateEvent) -> Result<(), DeliveryError> {
        tracing::info!(subject_id = event.subject_id(), "event: {:?}", event);

        Ok(())
    }
}

/// POSTs events as JSON to a fixed collector endpoint.
#[derive(Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: reqwest::Url,
}

impl HttpSink {
    pub fn new(endpoint: reqwest::Url, request_timeout: time::Duration) -> Result<Self, DeliveryError> {
        let client = collector_client(request_timeout).map_err(DeliveryError::ClientError)?;

        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &reqwest::Url {
        &self.endpoint
    }
}

/// Build the HTTP client shared by both collector paths.
/// A request exceeding `request_timeout` fails like any other transport error.
pub(crate) fn collector_client(
    request_timeout: time::Duration,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );

    reqwest::Client::builder()
        .default_headers(headers)
        .user_agent("watch-logger")
        .timeout(request_timeout)
        .build()
}

#[async_trait]
impl TransportSink for HttpSink {
    async fn deliver(&self, event: &CandidateEvent) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(event)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::BadStatus(status));
        }

        tracing::debug!(subject_id = event.subject_id(), "sent event");

        Ok(())
    }
}
