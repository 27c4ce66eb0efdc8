use thiserror::Error;

#[derive(Error, Debug)]
pub enum DubError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid media: {0}")]
    InvalidMedia(String),

    #[error("Transcription error: {message}")]
    Transcription { message: String, retryable: bool },

    #[error("Malformed subtitle block {block}: {reason}")]
    MalformedSubtitle { block: usize, reason: String },

    #[error("Synthesis error: {message}")]
    Synthesis { message: String, retryable: bool },

    #[error("Merge error: {0}")]
    Merge(String),

    #[error("Media processing error: {0}")]
    Media(String),

    #[error("Audio codec error: {0}")]
    Audio(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported voice: {0}")]
    UnsupportedVoice(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Job cancelled")]
    Cancelled,
}

impl DubError {
    pub fn transcription<S: Into<String>>(message: S, retryable: bool) -> Self {
        DubError::Transcription { message: message.into(), retryable }
    }

    pub fn synthesis<S: Into<String>>(message: S, retryable: bool) -> Self {
        DubError::Synthesis { message: message.into(), retryable }
    }

    pub fn malformed<S: Into<String>>(block: usize, reason: S) -> Self {
        DubError::MalformedSubtitle { block, reason: reason.into() }
    }

    /// Whether a unit that failed with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            DubError::Transcription { retryable, .. } => *retryable,
            DubError::Synthesis { retryable, .. } => *retryable,
            DubError::Timeout(_) => true,
            DubError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map(is_retryable_status).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Structural failures abort the whole job instead of degrading one unit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DubError::InvalidMedia(_) | DubError::Merge(_) | DubError::Cancelled
        )
    }
}

/// 408, 429 and 5xx are worth retrying; everything else is the caller's fault.
pub fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

pub type Result<T> = std::result::Result<T, DubError>;
