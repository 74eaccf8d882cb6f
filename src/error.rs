pub mod retry;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Timeout, refused connection or rejected credentials
    #[error("Connection error: {0}")]
    Connection(String),

    /// The remote cluster answered with a non-success status
    #[error("Store error: {0}")]
    Store(String),

    /// Response body too large or not parseable; callers shrink the page and retry
    #[error("Response parse error: {0}")]
    ResponseParse(String),

    #[error("Bulk write error: {0}")]
    BulkWrite(String),

    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transfer cancelled: {0}")]
    Cancelled(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Channel send error")]
    ChannelSend,
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            TransferError::Connection(err.to_string())
        } else if err.is_decode() || err.is_body() {
            TransferError::ResponseParse(err.to_string())
        } else if let Some(status) = err.status() {
            if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
                TransferError::Connection(format!("authentication rejected: {}", err))
            } else {
                TransferError::Store(err.to_string())
            }
        } else {
            TransferError::Store(err.to_string())
        }
    }
}

impl TransferError {
    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::Config(_) | TransferError::Validation(_) => "config",
            TransferError::Io(_) => "io",
            TransferError::Serialization(_) | TransferError::Yaml(_) => "serialization",
            TransferError::Connection(_) => "connection",
            TransferError::Store(_) => "store",
            TransferError::ResponseParse(_) => "response_parse",
            TransferError::BulkWrite(_) => "bulk_write",
            TransferError::CircuitOpen { .. } => "circuit_open",
            TransferError::Checkpoint(_) => "checkpoint",
            TransferError::NotFound(_) => "not_found",
            TransferError::Cancelled(_) => "cancelled",
            TransferError::ResourceExhausted(_) => "resource_exhausted",
            TransferError::Pipeline(_) => "pipeline",
            TransferError::ChannelSend => "channel",
        }
    }

    pub fn is_response_parse(&self) -> bool {
        matches!(self, TransferError::ResponseParse(_))
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
