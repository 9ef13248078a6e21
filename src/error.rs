//! Error kinds surfaced by the pool scheduler.
//!
//! Most of the crate propagates `anyhow::Error` with context strings. The
//! variants here are the ones callers need to tell apart programmatically:
//! capacity exhaustion is retryable, a rejected create is not, and a timeout
//! carries a well-defined null result. Callers downcast with
//! `err.downcast_ref::<PoolError>()`.

use std::time::Duration;

/// Scheduler errors a caller may need to match on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The container runtime or the broker is not reachable.
    Unavailable(String),
    /// A per-agent or total container cap is exhausted. Retryable once a
    /// container is released.
    Capacity(String),
    /// The runtime rejected create or start. Never retried automatically
    /// within a single request.
    CreationFailed(String),
    /// No terminal result arrived within the request timeout.
    Timeout(Duration),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Unavailable(what) => write!(f, "unavailable: {what}"),
            PoolError::Capacity(what) => write!(f, "capacity exhausted: {what}"),
            PoolError::CreationFailed(what) => write!(f, "container creation failed: {what}"),
            PoolError::Timeout(after) => {
                write!(f, "no result within {}ms", after.as_millis())
            }
        }
    }
}

impl std::error::Error for PoolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_the_kind() {
        let err = PoolError::Capacity("max_total=4 reached".to_string());
        assert!(err.to_string().contains("capacity"));

        let err = PoolError::Timeout(Duration::from_millis(200));
        assert!(err.to_string().contains("200ms"));
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = PoolError::Capacity("agent cap".to_string()).into();
        match err.downcast_ref::<PoolError>() {
            Some(PoolError::Capacity(_)) => {}
            other => panic!("expected Capacity, got {other:?}"),
        }
    }
}
