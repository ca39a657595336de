//! Engine error taxonomy.
//!
//! Only `SnapshotUnavailable` and `ConfigInvalid` are allowed to escape the
//! engine. Everything else is recovered locally and reflected in metrics and
//! health.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed feed input. The offending message is dropped and counted.
    #[error("malformed input: {0}")]
    InputMalformed(String),

    /// Sequence gap in depth updates. Triggers a book resync.
    #[error("depth sequence gap: expected first_update_id <= {expected}, got {got}")]
    BookGap { expected: i64, got: i64 },

    /// The injected feed could not deliver a depth snapshot. Escalated to the
    /// supervisor; the engine must not serve stale data silently.
    #[error("depth snapshot unavailable for {symbol}: {reason}")]
    SnapshotUnavailable { symbol: String, reason: String },

    /// A detector failed internally. Caught at the fan-out boundary and
    /// counted toward that detector's circuit breaker.
    #[error("detector {detector_id} computation failed: {reason}")]
    DetectorComputation {
        detector_id: &'static str,
        reason: String,
    },

    /// A worker sink did not acknowledge within its deadline. Retried with
    /// backoff; counted toward the sink's breaker.
    #[error("sink {sink} timed out after {timeout_ms}ms")]
    DownstreamIoTimeout { sink: &'static str, timeout_ms: u64 },

    /// Startup-only: the configuration failed validation.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Cooperative shutdown in progress.
    #[error("engine is shutting down")]
    Shutdown,
}

impl EngineError {
    /// True for errors that are recovered inside the engine.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            EngineError::SnapshotUnavailable { .. } | EngineError::ConfigInvalid(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
