//! Best-effort capture of document resources (PDFs) opened in the observed
//! context. Independent of the delivery queue: no retry, no dedup, failures
//! are logged and forgotten.
use std::time;

use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::SideloadError;
use crate::sink::collector_client;

const DOCUMENT_CONTENT_TYPE: &str = "application/pdf";
const DOCUMENT_SUFFIX: &str = ".pdf";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Loading,
    Complete,
}

/// Host notification that a resource finished (or started) loading.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ResourceLoaded {
    pub url: String,
    pub status: LoadStatus,
    #[serde(default)]
    pub content_type: Option<String>,
}

impl ResourceLoaded {
    /// A resource is worth capturing once it has completely loaded and is a
    /// PDF, either by reported content type or by URL path suffix.
    pub fn is_document(&self) -> bool {
        if self.status != LoadStatus::Complete {
            return false;
        }

        let by_content_type = self.content_type.as_deref().is_some_and(|content_type| {
            content_type
                .split(';')
                .next()
                .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(DOCUMENT_CONTENT_TYPE))
        });

        by_content_type || has_document_suffix(&self.url)
    }
}

fn has_document_suffix(raw_url: &str) -> bool {
    let path = match url::Url::parse(raw_url) {
        Ok(parsed) => parsed.path().to_owned(),
        Err(_) => raw_url.to_owned(),
    };

    path.to_ascii_lowercase().ends_with(DOCUMENT_SUFFIX)
}

#[derive(Serialize)]
struct ResourcePayload<'a> {
    content_base64: String,
    source_url: &'a str,
}

#[derive(Deserialize)]
struct ResourceResponse {
    #[serde(default)]
    text: Option<String>,
}

/// Fetches matching resources and posts them, base64 encoded, to the
/// collector's resource endpoint.
#[derive(Clone)]
pub struct ResourceSideloader {
    client: reqwest::Client,
    endpoint: reqwest::Url,
}

impl ResourceSideloader {
    pub fn new(endpoint: reqwest::Url, request_timeout: time::Duration) -> Result<Self, SideloadError> {
        let client = collector_client(request_timeout).map_err(SideloadError::ClientError)?;

        Ok(Self { client, endpoint })
    }

    /// Handle a resource notification. When the resource is relevant, a task
    /// is spawned to send it and its handle returned; the caller may ignore it.
    pub fn on_resource_loaded(&self, resource: ResourceLoaded) -> Option<JoinHandle<()>> {
        if !resource.is_document() {
            return None;
        }

        let sideloader = self.clone();
        Some(tokio::spawn(async move {
            match sideloader.send(&resource.url).await {
                Ok(text_len) => {
                    metrics::counter!("watch_sideload_total", "result" => "sent").increment(1);
                    info!(url = %resource.url, text_len, "sideloaded document");
                }
                Err(err) => {
                    metrics::counter!("watch_sideload_total", "result" => "failed").increment(1);
                    warn!(url = %resource.url, "failed to sideload document: {}", err);
                }
            }
        }))
    }

    /// Fetch `source_url` and post it to the collector. Returns the length of
    /// the text the collector extracted, if it reported any.
    pub async fn send(&self, source_url: &str) -> Result<usize, SideloadError> {
        let response = self
            .client
            .get(source_url)
            .send()
            .await
            .map_err(|error| SideloadError::FetchError {
                url: source_url.to_owned(),
                error,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SideloadError::FetchStatus {
                url: source_url.to_owned(),
                status,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|error| SideloadError::FetchError {
                url: source_url.to_owned(),
                error,
            })?;

        let payload = ResourcePayload {
            content_base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
            source_url,
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&payload)
            .send()
            .await
            .map_err(SideloadError::PostError)?;

        let status = response.status();
        if !status.is_success() {
            return Err(SideloadError::PostStatus(status));
        }

        // The response shape belongs to the collector; only the text length is logged.
        let text_len = response
            .json::<ResourceResponse>()
            .await
            .ok()
            .and_then(|body| body.text)
            .map_or(0, |text| text.len());

        Ok(text_len)
    }
}
