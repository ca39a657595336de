//! Engine wiring: the single cooperative ingress loop.
//!
//! One task owns book -> enrichment -> detectors -> signal manager. A
//! trade's enrichment and every synchronous detector evaluation run without
//! suspension; awaits happen only between events (sink sends, batch yields,
//! snapshot fetches). Worker sinks and the publication channel live on
//! other tasks behind message passing.

pub mod sink;

use crate::book::passive::PassiveVolumeTracker;
use crate::book::{ApplyOutcome, BookHealthStatus, OrderBookState};
use crate::config::EngineConfig;
use crate::detectors::absorption::AbsorptionDetector;
use crate::detectors::anomaly::AnomalyDetector;
use crate::detectors::deltacvd::DeltaCvdDetector;
use crate::detectors::exhaustion::ExhaustionDetector;
use crate::detectors::iceberg::IcebergDetector;
use crate::detectors::spoofing::SpoofingDetector;
use crate::detectors::zones::ZoneDetector;
use crate::detectors::{MarketLens, SignalCandidate};
use crate::error::EngineError;
use crate::feed::pacer::SnapshotPacer;
use crate::feed::{parse_level, AggressiveTrade, DepthUpdateEvent, FeedEvent, SnapshotFetcher, TradeEvent};
use crate::manager::{ProcessedSignal, SignalManager};
use crate::num::fixed::FixedPoint;
use crate::pipeline::{EnrichmentFanout, OrderFlowPreprocessor};
use crate::types::EnhancementMode;
use sink::SinkHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Passive history capacity per price level.
const PASSIVE_SAMPLES: usize = 256;

/// Maintenance cadence for zone retirement, GC and health transitions.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Unread enrichments retained per slow consumer before drop-oldest.
const FANOUT_CAPACITY: usize = 1_024;

const ARCHIVE_CONSUMER: &str = "trade-archive";

#[derive(Debug, Default, Clone, Copy)]
pub struct EngineCounters {
    pub trades_processed: u64,
    pub malformed_inputs: u64,
    pub detector_failures: u64,
    pub resyncs_completed: u64,
    pub health_transitions: u64,
}

pub struct Engine {
    cfg: EngineConfig,
    clock_ms: i64,
    book: OrderBookState,
    passives: PassiveVolumeTracker,
    preprocessor: OrderFlowPreprocessor,
    spoofing: SpoofingDetector,
    iceberg: IcebergDetector,
    anomaly: AnomalyDetector,
    absorption: AbsorptionDetector,
    exhaustion: ExhaustionDetector,
    zones: ZoneDetector,
    deltacvd: DeltaCvdDetector,
    manager: SignalManager,
    fanout: EnrichmentFanout,
    fetcher: Arc<dyn SnapshotFetcher>,
    pacer: SnapshotPacer,
    signal_sink: Option<SinkHandle<ProcessedSignal>>,
    trade_archive: Option<SinkHandle<AggressiveTrade>>,
    book_stale: bool,
    counters: EngineCounters,
}

impl Engine {
    /// Build a full pipeline for one symbol. Fails only on invalid
    /// configuration.
    pub fn new(cfg: EngineConfig, fetcher: Arc<dyn SnapshotFetcher>) -> Result<Self, EngineError> {
        cfg.validate()?;
        let tick_size = FixedPoint::from_f64(cfg.tick_size);
        let primary_width = tick_size.mul_int(cfg.primary_zone_ticks as i64);

        let book = OrderBookState::new(&cfg.symbol, cfg.order_book.clone(), tick_size);
        let passives = PassiveVolumeTracker::new(PASSIVE_SAMPLES, cfg.window_ms);
        let preprocessor = OrderFlowPreprocessor::new(
            &cfg.zone_ticks,
            cfg.band_ticks,
            tick_size,
            cfg.order_book.max_levels / 4,
            cfg.window_ms,
        );
        let spoofing = SpoofingDetector::new(cfg.spoofing.clone(), tick_size);
        let iceberg = IcebergDetector::new(cfg.iceberg.clone());
        let anomaly = AnomalyDetector::new(cfg.anomaly.clone(), cfg.window_ms);
        let absorption = AbsorptionDetector::new(
            cfg.absorption.clone(),
            tick_size,
            cfg.primary_zone_ticks,
            cfg.window_ms,
        );
        let exhaustion =
            ExhaustionDetector::new(cfg.exhaustion.clone(), cfg.primary_zone_ticks, cfg.window_ms);
        let zones = ZoneDetector::new(
            cfg.zones.clone(),
            primary_width,
            FixedPoint::from_f64(cfg.absorption.institutional_volume_threshold),
        );
        let deltacvd = DeltaCvdDetector::new(cfg.delta_cvd.clone(), cfg.window_ms);
        let manager = SignalManager::new(cfg.signal_manager.clone());
        let pacer = SnapshotPacer::new(Duration::from_millis(cfg.order_book.snapshot_timeout_ms));

        Ok(Self {
            cfg,
            clock_ms: 0,
            book,
            passives,
            preprocessor,
            spoofing,
            iceberg,
            anomaly,
            absorption,
            exhaustion,
            zones,
            deltacvd,
            manager,
            fanout: EnrichmentFanout::new(),
            fetcher,
            pacer,
            signal_sink: None,
            trade_archive: None,
            book_stale: false,
            counters: EngineCounters::default(),
        })
    }

    pub fn with_signal_sink(mut self, handle: SinkHandle<ProcessedSignal>) -> Self {
        self.signal_sink = Some(handle);
        self
    }

    pub fn with_trade_archive(mut self, handle: SinkHandle<AggressiveTrade>) -> Self {
        self.fanout.register(ARCHIVE_CONSUMER, FANOUT_CAPACITY);
        self.trade_archive = Some(handle);
        self
    }

    /// Toggle enhanced scoring paths across detectors.
    pub fn set_enhancement_mode(&mut self, mode: EnhancementMode) {
        self.absorption.set_enhancement_mode(mode);
        self.exhaustion.set_enhancement_mode(mode);
        info!(mode = ?mode, "enhancement mode set");
    }

    pub fn counters(&self) -> EngineCounters {
        self.counters
    }

    pub fn manager(&self) -> &SignalManager {
        &self.manager
    }

    /// Run the ingress loop until the feed closes or `cancel` fires.
    ///
    /// Only `SnapshotUnavailable` (and startup `ConfigInvalid`) escape;
    /// everything else is absorbed into counters and health.
    pub async fn run(
        mut self,
        mut feed_rx: mpsc::Receiver<FeedEvent>,
        publication: mpsc::Sender<ProcessedSignal>,
        cancel: CancellationToken,
    ) -> Result<EngineCounters, EngineError> {
        // Wall time seeds only the book's internal timestamps; every
        // ordering, throttle and cooldown decision runs on event time so a
        // deterministic transcript replays identically.
        let now = chrono::Utc::now().timestamp_millis();
        self.book
            .initialize(self.fetcher.as_ref(), &self.pacer, now)
            .await?;

        let mut prune_tick =
            tokio::time::interval(Duration::from_millis(self.cfg.order_book.prune_interval_ms.max(1) as u64));
        let mut maintenance_tick = tokio::time::interval(MAINTENANCE_INTERVAL);
        let yield_ms = self.cfg.signal_manager.backpressure_yield_ms;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("cancellation requested, draining");
                    self.drain_and_flush(&publication).await;
                    return Ok(self.counters);
                }
                maybe_event = feed_rx.recv() => {
                    match maybe_event {
                        None => {
                            info!("feed closed, draining");
                            self.drain_and_flush(&publication).await;
                            return Ok(self.counters);
                        }
                        Some(event) => {
                            self.handle_event(event, &publication, yield_ms).await?;
                        }
                    }
                }
                _ = prune_tick.tick() => {
                    self.book.prune();
                }
                _ = maintenance_tick.tick() => {
                    self.maintenance().await;
                    self.publish_batches(&publication, yield_ms).await;
                }
            }
        }
    }

    async fn handle_event(
        &mut self,
        event: FeedEvent,
        publication: &mpsc::Sender<ProcessedSignal>,
        yield_ms: u64,
    ) -> Result<(), EngineError> {
        match event {
            FeedEvent::Trade(trade_event) => {
                self.handle_trade(&trade_event).await;
                self.publish_batches(publication, yield_ms).await;
            }
            FeedEvent::Depth(delta) => {
                self.handle_depth(&delta).await?;
            }
            FeedEvent::StreamConnected => self.book.on_stream_connected(),
            FeedEvent::StreamDisconnected(reason) => self.book.on_stream_disconnected(&reason),
        }
        Ok(())
    }

    async fn handle_trade(&mut self, trade_event: &TradeEvent) {
        let trade = match AggressiveTrade::try_from(trade_event) {
            Ok(t) => t,
            Err(e) => {
                self.counters.malformed_inputs += 1;
                warn!(error = %e, "dropping malformed trade");
                return;
            }
        };
        self.clock_ms = self.clock_ms.max(trade.timestamp_ms);
        self.refresh_health_flag();

        // Enrichment and every synchronous detector run without suspension.
        let candidates = self.run_detectors(trade);
        self.counters.trades_processed += 1;

        let now = self.clock_ms;
        for candidate in candidates {
            self.manager.submit(candidate, now);
        }
        self.drain_archive().await;
    }

    /// Hand queued enrichments to the archive worker. A wedged sink only
    /// costs enrichments (drop-oldest in the fanout); the book and the
    /// passive tracker stay authoritative.
    async fn drain_archive(&mut self) {
        if self.trade_archive.is_none() {
            return;
        }
        let now = self.clock_ms;
        let drained = self.fanout.drain(ARCHIVE_CONSUMER);
        if let Some(archive) = &mut self.trade_archive {
            for enrichment in drained {
                if let Err(e) = archive.send(enrichment.trade, now).await {
                    debug!(error = %e, "trade archive send failed");
                }
            }
        }
    }

    /// Synchronous fan-out: preprocessor, capability detectors, then the
    /// candidate-emitting detectors behind the market lens.
    fn run_detectors(&mut self, trade: AggressiveTrade) -> Vec<SignalCandidate> {
        let event = self
            .preprocessor
            .process(trade, &self.book, &mut self.passives);
        let now = event.trade.timestamp_ms;
        let mut candidates: Vec<SignalCandidate> = Vec::new();

        // Capability detectors first; their outputs feed the lens and the
        // anomaly sink.
        self.spoofing.on_trade(event, &self.book);
        candidates.extend(self.iceberg.on_trade(event));
        for anomaly_event in self.spoofing.take_anomaly_events() {
            self.anomaly.record(anomaly_event);
        }
        for anomaly_event in self.iceberg.take_anomaly_events() {
            self.anomaly.record(anomaly_event);
        }
        self.anomaly.on_trade(event);

        let lens = MarketLens {
            spoofing: &self.spoofing,
            icebergs: &self.iceberg,
            passives: &self.passives,
            book_stale: self.book_stale,
        };
        let mut failures: Vec<&'static str> = Vec::new();
        match self.absorption.on_trade(event, &lens) {
            Ok(out) => candidates.extend(out),
            Err(e) => {
                failures.push(AbsorptionDetector::ID);
                error!(error = %e, "absorption detector failed");
            }
        }
        match self.exhaustion.on_trade(event, &lens) {
            Ok(out) => candidates.extend(out),
            Err(e) => {
                failures.push(ExhaustionDetector::ID);
                error!(error = %e, "exhaustion detector failed");
            }
        }
        match self.zones.on_trade(event, &lens) {
            Ok(out) => candidates.extend(out),
            Err(e) => {
                failures.push(ZoneDetector::ID);
                error!(error = %e, "zone detector failed");
            }
        }
        match self.deltacvd.on_trade(event, &lens) {
            Ok(out) => candidates.extend(out),
            Err(e) => {
                failures.push(DeltaCvdDetector::ID);
                error!(error = %e, "delta-cvd detector failed");
            }
        }
        drop(lens);
        self.fanout.publish(event);

        for detector in failures {
            self.counters.detector_failures += 1;
            self.manager.record_detector_failure(detector, now);
        }
        candidates
    }

    async fn handle_depth(&mut self, delta: &DepthUpdateEvent) -> Result<(), EngineError> {
        self.clock_ms = self.clock_ms.max(delta.event_time);
        match self.book.apply(delta, self.clock_ms) {
            ApplyOutcome::Applied => {
                // Touched levels feed the passive history.
                for entry in delta.bids.iter().chain(delta.asks.iter()) {
                    if let Ok((price, _)) = parse_level(entry) {
                        let (bid, ask) = self
                            .book
                            .level(price)
                            .map(|l| (l.bid, l.ask))
                            .unwrap_or((FixedPoint::ZERO, FixedPoint::ZERO));
                        self.passives.push_sample(price, bid, ask, self.clock_ms);
                    }
                }
                if let (Some(bid), Some(ask)) = (self.book.best_bid(), self.book.best_ask()) {
                    self.anomaly.observe_quote(bid, ask, self.clock_ms);
                }
                self.refresh_health_flag();
            }
            ApplyOutcome::GapDetected => {
                info!("book gap, fetching fresh snapshot");
                self.book
                    .initialize(self.fetcher.as_ref(), &self.pacer, self.clock_ms)
                    .await?;
                self.counters.resyncs_completed += 1;
            }
            ApplyOutcome::Malformed => {
                self.counters.malformed_inputs += 1;
            }
            ApplyOutcome::DroppedStale | ApplyOutcome::DroppedUnsynced => {}
        }
        Ok(())
    }

    /// Book health transitions gate detectors and are reported once per
    /// flip.
    fn refresh_health_flag(&mut self) {
        let health = self.book.health(self.clock_ms);
        let stale = health.status == BookHealthStatus::Stale;
        if stale != self.book_stale {
            self.book_stale = stale;
            self.counters.health_transitions += 1;
            if stale {
                warn!(age_threshold_ms = health.timeout_threshold_ms, "book went stale, detectors short-circuited");
            } else {
                info!("book health recovered");
            }
        }
    }

    /// Drain the manager queue in batches, yielding between them.
    async fn publish_batches(
        &mut self,
        publication: &mpsc::Sender<ProcessedSignal>,
        yield_ms: u64,
    ) {
        loop {
            if self.manager.queue_is_empty() {
                return;
            }
            let health = self.anomaly.get_market_health(self.clock_ms);
            let regime = self.anomaly.regime();
            let published = self
                .manager
                .process_batch(&health, regime, self.clock_ms);
            for signal in published {
                if let Some(sink) = &mut self.signal_sink {
                    if let Err(e) = sink.send(signal.clone(), self.clock_ms).await {
                        debug!(error = %e, "signal sink send failed");
                    }
                }
                if publication.send(signal).await.is_err() {
                    warn!("publication channel closed, discarding signal");
                }
            }
            if self.manager.queue_is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(yield_ms)).await;
        }
    }

    /// Cooperative checkpoint work between events.
    async fn maintenance(&mut self) {
        let now = self.clock_ms;
        self.preprocessor.retire_stale_zones(now);
        self.passives.gc(now);
        self.spoofing.gc(now);
        self.iceberg.gc(now);
        self.absorption.gc(now);
        self.exhaustion.gc(now);
        self.deltacvd.gc(now);
        for candidate in self.zones.on_timer(now) {
            self.manager.submit(candidate, now);
        }
        self.drain_archive().await;
        self.refresh_health_flag();
    }

    /// Graceful shutdown: drain the queue up to the configured deadline,
    /// then flush sinks and release the book.
    async fn drain_and_flush(&mut self, publication: &mpsc::Sender<ProcessedSignal>) {
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.cfg.shutdown_drain_ms);
        while !self.manager.queue_is_empty() && tokio::time::Instant::now() < deadline {
            self.publish_batches(publication, 0).await;
        }
        self.drain_archive().await;
        if let Some(mut sink) = self.signal_sink.take() {
            sink.close();
        }
        if let Some(mut sink) = self.trade_archive.take() {
            sink.close();
        }
        info!(
            trades = self.counters.trades_processed,
            resyncs = self.counters.resyncs_completed,
            "engine drained and released"
        );
    }
}
