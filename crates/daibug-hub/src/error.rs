use daibug_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("hub already started")]
    AlreadyStarted,
    #[error("hub not started")]
    NotStarted,
    /// No loopback port could be bound starting from the preferred one.
    #[error("no free loopback port starting from {0}")]
    PortExhausted(u16),
    #[error("command timed out after {0} ms")]
    CommandTimeout(u64),
    #[error("Sandbox violation: {0}")]
    SandboxViolation(String),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
