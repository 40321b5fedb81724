//! Central error type shared across the workspace.

/// Workspace-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong in the scheduling/execution subsystem.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unknown identity on a lookup. Benign for deletes, hard for gets.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Cron expression did not parse; the task stays unregistered.
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    /// Neither a usable script path nor inline source was provided.
    #[error("no script path or source provided")]
    NoScript,

    /// No interpreter binary could be located for the script kind.
    #[error("{kind} interpreter not found (tried: {tried})")]
    InterpreterNotFound { kind: String, tried: String },

    /// The process exceeded its wall-clock ceiling and was killed.
    #[error("execution timed out after {0} seconds")]
    Timeout(u64),

    /// `start()` called on a scheduler that is already running.
    #[error("scheduler already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("notification failed: {0}")]
    Notify(String),
}

impl Error {
    /// Shorthand for a typed not-found error.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}
