use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogproxyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Too many consumers connected (max {max})")]
    TooManyConsumers { max: usize },

    #[error("Broadcaster is shutting down")]
    ShuttingDown,

    #[error("Event bus closed")]
    BusClosed,

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Upstream frontend error: {0}")]
    Upstream(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LogproxyError {
    /// Short error code string sent to clients in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            LogproxyError::Config(_) => "CONFIG_ERROR",
            LogproxyError::TooManyConsumers { .. } => "TOO_MANY_CONSUMERS",
            LogproxyError::ShuttingDown => "SHUTTING_DOWN",
            LogproxyError::BusClosed => "BUS_CLOSED",
            LogproxyError::Bind { .. } => "BIND_FAILED",
            LogproxyError::Upstream(_) => "UPSTREAM_ERROR",
            LogproxyError::Serialization(_) => "SERIALIZATION_ERROR",
            LogproxyError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, LogproxyError>;
