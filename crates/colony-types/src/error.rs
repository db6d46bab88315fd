use thiserror::Error;

/// Error taxonomy shared by every colony crate.
///
/// Variants name a *kind* of failure, not a call site — `Store`,
/// `TaskGraph`, `Messaging` and `Orchestrator` all raise the same enum so
/// callers can match on what went wrong rather than where.
#[derive(Error, Debug)]
pub enum ColonyError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cycle detected: {0}")]
    CycleDetected(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("send exhausted after retries: {0}")]
    SendExhausted(String),

    #[error("inference failure: {0}")]
    InferenceFailure(String),

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl serde::Serialize for ColonyError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type ColonyResult<T> = Result<T, ColonyError>;
