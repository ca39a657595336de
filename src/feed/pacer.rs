//! Pacing for snapshot fetches.
//!
//! GCRA rate limiter (governor) in front of the injected snapshot fetcher so
//! that a resync storm cannot hammer the REST-equivalent endpoint.

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

const DEFAULT_FETCHES_PER_MINUTE: u32 = 60;

#[derive(Debug, Error)]
pub enum PacerError {
    #[error("snapshot pacer queue timeout after {0:?}")]
    QueueTimeout(Duration),
}

/// Serializes snapshot fetches behind a GCRA quota.
pub struct SnapshotPacer {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    queue_timeout: Duration,
}

impl SnapshotPacer {
    pub fn new(queue_timeout: Duration) -> Self {
        Self::with_quota(DEFAULT_FETCHES_PER_MINUTE, queue_timeout)
    }

    pub fn with_quota(fetches_per_minute: u32, queue_timeout: Duration) -> Self {
        let per_minute = NonZeroU32::new(fetches_per_minute.max(1))
            .expect("fetches_per_minute clamped to >= 1");
        Self {
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
            queue_timeout,
        }
    }

    /// Wait for permission, bounded by the queue timeout.
    pub async fn acquire(&self) -> Result<(), PacerError> {
        match timeout(self.queue_timeout, async {
            loop {
                if self.limiter.check().is_ok() {
                    debug!("snapshot fetch permitted");
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!(
                    timeout_ms = self.queue_timeout.as_millis() as u64,
                    "snapshot pacer queue timeout"
                );
                Err(PacerError::QueueTimeout(self.queue_timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_acquire_is_immediate() {
        let pacer = SnapshotPacer::new(Duration::from_secs(1));
        assert!(pacer.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_exhausted_quota_times_out() {
        let pacer = SnapshotPacer::with_quota(1, Duration::from_millis(120));
        assert!(pacer.acquire().await.is_ok());
        // Quota of one per minute: the second acquire cannot succeed inside
        // the 120ms queue budget.
        assert!(pacer.acquire().await.is_err());
    }
}
