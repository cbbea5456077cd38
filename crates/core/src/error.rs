use std::path::PathBuf;

/// Failure categories of a generation run.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    /// Missing or malformed settings. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A required acceleration feature or tool is absent. Fatal at startup.
    #[error("required device feature unavailable: {0}")]
    DeviceUnavailable(String),

    /// The generation service failed one sample.
    #[error("generation service failed on sample {index}: {source}")]
    Service {
        index: u32,
        #[source]
        source: ServiceError,
    },

    /// Directory creation or file write failed.
    #[error("filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The encoder could not turn frames into a video file.
    #[error("video encoding failed for {}: {message}", path.display())]
    Encode { path: PathBuf, message: String },

    /// The batch stopped at a failing sample under the abort policy.
    #[error("batch aborted at sample {index}: {source}")]
    Aborted {
        index: u32,
        #[source]
        source: ServiceError,
    },
}

impl GenerationError {
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// The sample the error belongs to, if it is tied to one.
    pub fn sample_index(&self) -> Option<u32> {
        match self {
            Self::Service { index, .. } | Self::Aborted { index, .. } => Some(*index),
            _ => None,
        }
    }
}

/// Errors from the generation service client.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The HTTP request itself failed (connect, timeout, body read).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service answered with a non-2xx status.
    #[error("service API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// The response could not be interpreted.
    #[error("invalid service payload: {0}")]
    InvalidPayload(String),

    /// The service accepted the request but reported a failure.
    #[error("service rejected request: {0}")]
    Rejected(String),
}
