use thiserror::Error;

use kiln_core::KilnError;

/// Errors surfaced by the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] KilnError),

    #[error("worker transport error: {0}")]
    Transport(String),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    /// The dispatch loop died. The scheduler cannot make progress anymore.
    #[error("dispatch thread failed: {0}")]
    DispatchFailed(String),
}
