use reqwest::StatusCode;
use thiserror::Error;

/// Enumeration of errors related to delivering events to the collector.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("failed to construct http client: {0}")]
    ClientError(reqwest::Error),
    #[error("request to the collector failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("collector responded with non-success status {0}")]
    BadStatus(StatusCode),
}

/// Enumeration of errors on the document resource sideload path.
#[derive(Error, Debug)]
pub enum SideloadError {
    #[error("failed to construct http client: {0}")]
    ClientError(reqwest::Error),
    #[error("failed to fetch resource {url}: {error}")]
    FetchError { url: String, error: reqwest::Error },
    #[error("resource {url} responded with status {status}")]
    FetchStatus { url: String, status: StatusCode },
    #[error("failed to post resource to the collector: {0}")]
    PostError(reqwest::Error),
    #[error("collector responded with non-success status {0}")]
    PostStatus(StatusCode),
}
