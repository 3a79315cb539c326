use ulid::Ulid;

use crate::model::Conflict;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed window, or an empty, duplicated, unknown or inactive instructor list.
    InvalidInput(String),
    /// Blocking conflicts; carries every conflict found, advisories included.
    Conflict(Vec<Conflict>),
    /// Commit locks not acquired within the configured timeout.
    Busy,
    /// The durable log could not be written.
    StoreUnavailable(String),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
}

impl EngineError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidInput(msg.into())
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::Conflict(conflicts) => {
                let blocking = conflicts.iter().filter(|c| c.is_blocking()).count();
                write!(f, "{blocking} blocking conflict(s)")?;
                for c in conflicts {
                    write!(f, "; {}", c.message)?;
                }
                Ok(())
            }
            EngineError::Busy => write!(f, "busy: commit locks not acquired in time, retry"),
            EngineError::StoreUnavailable(e) => write!(f, "store unavailable: {e}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}
