use std::io;

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("network error: {0}")]
    Network(String),
    #[error("timeout")]
    Timeout,
    #[error("http error: {0}")]
    Http(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("db error: {0}")]
    Db(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unknown error")]
    Unknown,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PipelineError::Timeout
        } else if err.is_connect() {
            PipelineError::Network(err.to_string())
        } else if err.is_status() {
            PipelineError::Http(err.to_string())
        } else if err.is_decode() {
            PipelineError::Serde(err.to_string())
        } else {
            PipelineError::Unknown
        }
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Db(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serde(err.to_string())
    }
}

/// Failure taxonomy for a single classifier call.
///
/// The batch orchestrator routes on these variants: `NotConfigured` skips the
/// whole detection, `Internal` fails the task, everything else only loses the
/// batch it happened in.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ClassifierError {
    #[error("classifier not configured")]
    NotConfigured,
    #[error("classifier timed out")]
    Timeout,
    #[error("classifier transport error: {0}")]
    Transport(String),
    #[error("classifier error {status} ({code}): {message}")]
    Service {
        code: String,
        status: u16,
        message: String,
    },
    #[error("classifier returned malformed response: {0}")]
    Malformed(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ClassifierError {
    /// True for failures that only cost the batch they happened in.
    pub fn is_batch_level(&self) -> bool {
        matches!(
            self,
            ClassifierError::Timeout
                | ClassifierError::Transport(_)
                | ClassifierError::Service { .. }
                | ClassifierError::Malformed(_)
        )
    }

    pub fn code(&self) -> &str {
        match self {
            ClassifierError::NotConfigured => "not_configured",
            ClassifierError::Timeout => "timeout",
            ClassifierError::Transport(_) => "transport",
            ClassifierError::Service { code, .. } => code.as_str(),
            ClassifierError::Malformed(_) => "malformed_response",
            ClassifierError::Internal(_) => "internal",
        }
    }
}

impl From<reqwest::Error> for ClassifierError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClassifierError::Timeout
        } else if err.is_decode() {
            ClassifierError::Malformed(err.to_string())
        } else if err.is_builder() {
            ClassifierError::Internal(err.to_string())
        } else {
            ClassifierError::Transport(err.to_string())
        }
    }
}
