//! Message-passing worker sinks.
//!
//! Persistence (trade archive, signal log) runs on worker tasks fed over
//! bounded channels. The engine side enforces a send deadline, retries with
//! backoff, and trips a sink breaker on repeated timeouts so a wedged sink
//! cannot stall the ingress loop.

use crate::error::EngineError;
use crate::manager::breaker::CircuitBreaker;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, warn};

const SEND_RETRIES: u32 = 2;
const RETRY_BACKOFF: Duration = Duration::from_millis(25);

/// Engine-side proxy for one worker sink.
pub struct SinkHandle<T> {
    name: &'static str,
    tx: Option<mpsc::Sender<T>>,
    send_timeout: Duration,
    breaker: CircuitBreaker,
    pub timeouts: u64,
    pub dropped: u64,
}

impl<T: Send + 'static> SinkHandle<T> {
    pub fn new(name: &'static str, tx: mpsc::Sender<T>, send_timeout: Duration) -> Self {
        Self {
            name,
            tx: Some(tx),
            send_timeout,
            breaker: CircuitBreaker::new(5, 60_000, 30_000),
            timeouts: 0,
            dropped: 0,
        }
    }

    /// Deadline-bounded send with retry and backoff. Timeouts count toward
    /// the sink breaker; while it is open, writes are shed rather than
    /// awaited. Reserving a permit first keeps the item available for the
    /// retries.
    pub async fn send(&mut self, item: T, now_ms: i64) -> Result<(), EngineError> {
        let Some(tx) = &self.tx else {
            self.dropped += 1;
            return Ok(());
        };
        if !self.breaker.allow(now_ms) {
            self.dropped += 1;
            return Ok(());
        }

        for attempt in 0..=SEND_RETRIES {
            match timeout(self.send_timeout, tx.reserve()).await {
                Ok(Ok(permit)) => {
                    permit.send(item);
                    self.breaker.record_success();
                    return Ok(());
                }
                Ok(Err(_closed)) => {
                    // Worker gone; nothing will come back.
                    warn!(sink = self.name, "sink worker closed, shedding writes");
                    self.dropped += 1;
                    self.breaker.record_failure(now_ms);
                    return Ok(());
                }
                Err(_) => {
                    self.timeouts += 1;
                    self.breaker.record_failure(now_ms);
                    if attempt == SEND_RETRIES {
                        return Err(EngineError::DownstreamIoTimeout {
                            sink: self.name,
                            timeout_ms: self.send_timeout.as_millis() as u64,
                        });
                    }
                    tokio::time::sleep(RETRY_BACKOFF * (attempt + 1)).await;
                }
            }
        }
        Err(EngineError::DownstreamIoTimeout {
            sink: self.name,
            timeout_ms: self.send_timeout.as_millis() as u64,
        })
    }

    /// Close the channel so the worker drains and exits.
    pub fn close(&mut self) {
        self.tx = None;
    }
}

/// Spawn a worker writing one JSON line per item to `path`, append-only.
pub fn spawn_jsonl_sink<T>(
    name: &'static str,
    path: PathBuf,
    capacity: usize,
    send_timeout: Duration,
) -> (SinkHandle<T>, JoinHandle<()>)
where
    T: Serialize + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<T>(capacity.max(1));
    let handle = SinkHandle::new(name, tx, send_timeout);
    let worker = tokio::spawn(async move {
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(sink = name, path = %path.display(), error = %e, "sink open failed");
                // Drain and discard so senders never block on a dead sink.
                while rx.recv().await.is_some() {}
                return;
            }
        };
        let mut writer = tokio::io::BufWriter::new(file);
        while let Some(item) = rx.recv().await {
            match serde_json::to_vec(&item) {
                Ok(mut line) => {
                    line.push(b'\n');
                    if let Err(e) = writer.write_all(&line).await {
                        error!(sink = name, error = %e, "sink write failed");
                    }
                }
                Err(e) => error!(sink = name, error = %e, "sink serialization failed"),
            }
        }
        if let Err(e) = writer.flush().await {
            error!(sink = name, error = %e, "sink flush failed");
        }
        debug!(sink = name, "sink worker drained and exited");
    });
    (handle, worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::num::fixed::FixedPoint;

    #[derive(Serialize)]
    struct Row {
        price: FixedPoint,
        note: &'static str,
    }

    #[tokio::test]
    async fn test_jsonl_sink_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signals.jsonl");
        let (mut handle, worker) = spawn_jsonl_sink::<Row>(
            "signal-log",
            path.clone(),
            16,
            Duration::from_millis(500),
        );

        for i in 0..3 {
            handle
                .send(
                    Row {
                        price: FixedPoint::from_int(89 + i),
                        note: "ok",
                    },
                    0,
                )
                .await
                .unwrap();
        }
        handle.close();
        worker.await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("\"89\""));
        assert!(lines[2].contains("\"91\""));
    }

    #[tokio::test]
    async fn test_send_after_close_sheds_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let (mut handle, worker) = spawn_jsonl_sink::<Row>(
            "trade-archive",
            dir.path().join("trades.jsonl"),
            4,
            Duration::from_millis(100),
        );
        handle.close();
        worker.await.unwrap();
        assert!(handle
            .send(
                Row {
                    price: FixedPoint::ZERO,
                    note: "late",
                },
                0,
            )
            .await
            .is_ok());
        assert_eq!(handle.dropped, 1);
    }
}
