use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Event construction was given a source, level, or payload outside the
    /// closed model.
    #[error("invalid event kind: {0}")]
    InvalidKind(String),
    /// A session or config document failed schema validation.
    #[error("invalid format: {0}")]
    InvalidFormat(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
