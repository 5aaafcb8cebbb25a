use std::path::PathBuf;

use thiserror::Error;

/// Failures of the persisted key-value medium behind [`crate::api::store::EntityStore`].
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] std::io::Error),
    /// The stored value could not be decoded. Callers treat the collection as lost.
    #[error("stored {key} is corrupt: {source}")]
    CorruptState {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode {key}: {source}")]
    Serialize {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("no download directory configured")]
    NoDownloadDirectoryConfigured,
    #[error("cannot create {}: {source}", .path.display())]
    DestinationUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "transcoder failed ({}): {message}",
        .code.map_or_else(|| "no exit code".to_string(), |c| c.to_string())
    )]
    TranscoderFailure { code: Option<i32>, message: String },
    /// Downloading tasks must be stopped before they can be removed.
    #[error("task {id} is still downloading; stop it first")]
    StillDownloading { id: String },
    #[error("not a recording in the download directory: {0}")]
    InvalidRecordingName(String),
    #[error("cannot delete {}: {source}", .path.display())]
    DeleteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures talking to the catalog backend or the remote download service.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("remote download endpoint not configured")]
    NotConfigured,
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("network request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("request failed: HTTP {status}")]
    Http { status: u16 },
    #[error("unexpected response type: {0}")]
    UnexpectedContentType(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A catalog listing filtered through the store's block lists can fail on either side.
#[derive(Error, Debug)]
pub enum BrowseError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcoder_failure_message_includes_code() {
        let err = TaskError::TranscoderFailure {
            code: Some(1),
            message: "Connection refused".into(),
        };
        assert_eq!(err.to_string(), "transcoder failed (1): Connection refused");

        let err = TaskError::TranscoderFailure {
            code: None,
            message: "killed".into(),
        };
        assert_eq!(err.to_string(), "transcoder failed (no exit code): killed");
    }

    #[test]
    fn store_error_converts_into_task_error() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: TaskError = StoreError::from(io).into();
        assert!(matches!(err, TaskError::Store(StoreError::StorageUnavailable(_))));
    }
}
