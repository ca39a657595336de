//! Deterministic market replay for the test suite.
//!
//! Replays archived trade and depth CSV files in chronological order into a
//! feed channel, maintaining its own authoritative book with the same
//! component the engine uses so a resync during replay serves exactly the
//! state a live snapshot would have. Compiled only with the `simulator`
//! feature; nothing in the production ingress references it.

use crate::book::OrderBookState;
use crate::config::OrderBookConfig;
use crate::error::EngineError;
use crate::feed::{DepthSnapshot, DepthUpdateEvent, FeedEvent, SnapshotFetcher, TradeEvent};
use crate::num::fixed::FixedPoint;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Replay pacing and filtering.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// 0.0 replays as fast as possible; 1.0 in real time; 10.0 at 10x.
    pub speed_multiplier: f64,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
    /// Progress callback cadence in events.
    pub progress_every: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            speed_multiplier: 0.0,
            start_ms: None,
            end_ms: None,
            progress_every: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub events_replayed: u64,
    pub current_ts_ms: i64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReplaySummary {
    pub events: u64,
    pub trades: u64,
    pub depth_updates: u64,
    pub filtered_out: u64,
}

enum SimEvent {
    Trade(TradeEvent),
    Depth(DepthUpdateEvent),
}

impl SimEvent {
    fn timestamp_ms(&self) -> i64 {
        match self {
            SimEvent::Trade(t) => t.trade_time,
            SimEvent::Depth(d) => d.event_time,
        }
    }
}

/// Serves the simulator's current book to the engine's resync path.
pub struct SimSnapshotFetcher {
    shared: Arc<Mutex<DepthSnapshot>>,
}

#[async_trait]
impl SnapshotFetcher for SimSnapshotFetcher {
    async fn fetch_depth_snapshot(&self, _symbol: &str) -> Result<DepthSnapshot, EngineError> {
        Ok(self.shared.lock().expect("sim snapshot lock").clone())
    }
}

pub struct MarketSimulator {
    symbol: String,
    events: Vec<SimEvent>,
    book: OrderBookState,
    shared_snapshot: Arc<Mutex<DepthSnapshot>>,
    cfg: SimulatorConfig,
}

impl MarketSimulator {
    /// Load trade and depth CSVs and seed the authoritative book.
    ///
    /// Trade rows: `timestamp,trade_id,price,quantity,buyer_is_maker`.
    /// Depth rows: `timestamp,first_update_id,final_update_id,side,price,quantity`.
    /// A leading header row is skipped in both files.
    pub fn from_csv_files(
        symbol: &str,
        trades_path: &Path,
        depth_path: &Path,
        seed: DepthSnapshot,
        tick_size: FixedPoint,
        cfg: SimulatorConfig,
    ) -> Result<Self> {
        let mut events = Vec::new();

        let trades_raw = std::fs::read_to_string(trades_path)
            .with_context(|| format!("reading {}", trades_path.display()))?;
        for (lineno, line) in trades_raw.lines().enumerate() {
            if line.trim().is_empty() || (lineno == 0 && line.starts_with("timestamp")) {
                continue;
            }
            events.push(SimEvent::Trade(parse_trade_row(symbol, line).with_context(
                || format!("{}:{}", trades_path.display(), lineno + 1),
            )?));
        }

        let depth_raw = std::fs::read_to_string(depth_path)
            .with_context(|| format!("reading {}", depth_path.display()))?;
        for (lineno, line) in depth_raw.lines().enumerate() {
            if line.trim().is_empty() || (lineno == 0 && line.starts_with("timestamp")) {
                continue;
            }
            events.push(SimEvent::Depth(parse_depth_row(line).with_context(
                || format!("{}:{}", depth_path.display(), lineno + 1),
            )?));
        }

        // Chronological, stable within a timestamp so depth updates keep
        // their sequence order ahead of identically stamped trades.
        events.sort_by_key(|e| (e.timestamp_ms(), matches!(e, SimEvent::Trade(_))));

        let mut book = OrderBookState::new(symbol, OrderBookConfig::default(), tick_size);
        book.apply_snapshot(&seed, seed_timestamp(&events))
            .map_err(|e| anyhow::anyhow!("seed snapshot rejected: {e}"))?;
        let shared_snapshot = Arc::new(Mutex::new(book.full_snapshot()));

        Ok(Self {
            symbol: symbol.to_uppercase(),
            events,
            book,
            shared_snapshot,
            cfg,
        })
    }

    /// Snapshot source for the engine under test.
    pub fn snapshot_fetcher(&self) -> Arc<SimSnapshotFetcher> {
        Arc::new(SimSnapshotFetcher {
            shared: Arc::clone(&self.shared_snapshot),
        })
    }

    pub fn seed_snapshot(&self) -> DepthSnapshot {
        self.shared_snapshot.lock().expect("sim snapshot lock").clone()
    }

    /// Replay everything into `feed_tx` in order, pacing by the speed
    /// multiplier and reporting progress every `progress_every` events.
    pub async fn replay_into(
        mut self,
        feed_tx: mpsc::Sender<FeedEvent>,
        mut on_progress: impl FnMut(Progress),
    ) -> Result<ReplaySummary> {
        let mut summary = ReplaySummary::default();
        let mut last_ts: Option<i64> = None;

        info!(symbol = %self.symbol, events = self.events.len(), "replay starting");
        for event in std::mem::take(&mut self.events) {
            let ts = event.timestamp_ms();
            if self.cfg.start_ms.is_some_and(|s| ts < s)
                || self.cfg.end_ms.is_some_and(|e| ts > e)
            {
                summary.filtered_out += 1;
                continue;
            }

            if self.cfg.speed_multiplier > 0.0 {
                if let Some(prev) = last_ts {
                    let gap_ms = (ts - prev).max(0) as f64 / self.cfg.speed_multiplier;
                    if gap_ms >= 1.0 {
                        tokio::time::sleep(Duration::from_millis(gap_ms as u64)).await;
                    }
                }
            }
            last_ts = Some(ts);

            let feed_event = match event {
                SimEvent::Trade(t) => {
                    summary.trades += 1;
                    FeedEvent::Trade(t)
                }
                SimEvent::Depth(d) => {
                    summary.depth_updates += 1;
                    // Keep the authoritative book and the resync snapshot in
                    // lockstep with what the engine is about to see.
                    self.book.apply(&d, ts);
                    *self.shared_snapshot.lock().expect("sim snapshot lock") =
                        self.book.full_snapshot();
                    FeedEvent::Depth(d)
                }
            };
            if feed_tx.send(feed_event).await.is_err() {
                bail!("feed receiver closed mid-replay");
            }

            summary.events += 1;
            if summary.events % self.cfg.progress_every == 0 {
                on_progress(Progress {
                    events_replayed: summary.events,
                    current_ts_ms: ts,
                });
            }
        }
        debug!(
            trades = summary.trades,
            depth = summary.depth_updates,
            filtered = summary.filtered_out,
            "replay complete"
        );
        Ok(summary)
    }
}

fn seed_timestamp(events: &[SimEvent]) -> i64 {
    events.first().map(|e| e.timestamp_ms()).unwrap_or(0)
}

fn parse_trade_row(symbol: &str, line: &str) -> Result<TradeEvent> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 5 {
        bail!("expected 5 trade fields, got {}", fields.len());
    }
    Ok(TradeEvent {
        trade_id: fields[1].parse().context("trade_id")?,
        symbol: symbol.to_uppercase(),
        price: fields[2].to_string(),
        quantity: fields[3].to_string(),
        trade_time: fields[0].parse().context("timestamp")?,
        buyer_is_maker: fields[4].parse().context("buyer_is_maker")?,
    })
}

fn parse_depth_row(line: &str) -> Result<DepthUpdateEvent> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 6 {
        bail!("expected 6 depth fields, got {}", fields.len());
    }
    let level = [fields[4].to_string(), fields[5].to_string()];
    let (bids, asks) = match fields[3] {
        "bid" => (vec![level], Vec::new()),
        "ask" => (Vec::new(), vec![level]),
        other => bail!("unknown side {other:?}"),
    };
    Ok(DepthUpdateEvent {
        event_time: fields[0].parse().context("timestamp")?,
        first_update_id: fields[1].parse().context("first_update_id")?,
        final_update_id: fields[2].parse().context("final_update_id")?,
        bids,
        asks,
    })
}
