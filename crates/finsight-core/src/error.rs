use thiserror::Error;

#[derive(Debug, Error)]
pub enum FinsightError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Event queue overflow: {0}")]
    QueueOverflow(String),

    #[error("Event queue closed")]
    QueueClosed,

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FinsightError>;
