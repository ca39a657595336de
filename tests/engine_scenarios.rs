//! End-to-end scenarios: CSV transcripts replayed through the simulator
//! into a full engine, asserting on the published signal stream.

use orderflow_engine::engine::{Engine, EngineCounters};
use orderflow_engine::feed::DepthSnapshot;
use orderflow_engine::manager::ProcessedSignal;
use orderflow_engine::num::FixedPoint;
use orderflow_engine::sim::{MarketSimulator, SimulatorConfig};
use orderflow_engine::types::{Side, SignalType};
use orderflow_engine::EngineConfig;
use std::io::Write;
use std::path::Path;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn write_file(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(content.as_bytes()).unwrap();
    path
}

fn engine_config() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    // Scenario transcripts pin the expected-movement scaling so the small
    // absolute moves in the fixtures register as absorption.
    cfg.absorption.expected_movement_scaling_factor = 100.0;
    cfg
}

async fn run_transcript(
    seed: DepthSnapshot,
    trades_csv: &str,
    depth_csv: &str,
    cfg: EngineConfig,
) -> (Vec<ProcessedSignal>, EngineCounters) {
    let dir = tempfile::tempdir().unwrap();
    let trades = write_file(dir.path(), "trades.csv", trades_csv);
    let depth = write_file(dir.path(), "depth.csv", depth_csv);
    let sim = MarketSimulator::from_csv_files(
        "BTCUSDT",
        &trades,
        &depth,
        seed,
        FixedPoint::from_f64(cfg.tick_size),
        SimulatorConfig::default(),
    )
    .unwrap();
    let fetcher = sim.snapshot_fetcher();

    let engine = Engine::new(cfg, fetcher).unwrap();
    let (feed_tx, feed_rx) = mpsc::channel(256);
    let (pub_tx, mut pub_rx) = mpsc::channel(256);
    let engine_task = tokio::spawn(engine.run(feed_rx, pub_tx, CancellationToken::new()));

    sim.replay_into(feed_tx, |_| {}).await.unwrap();
    let counters = engine_task.await.unwrap().unwrap();

    let mut published = Vec::new();
    while let Ok(signal) = pub_rx.try_recv() {
        published.push(signal);
    }
    (published, counters)
}

fn absorption_signals(published: &[ProcessedSignal]) -> Vec<&ProcessedSignal> {
    published
        .iter()
        .filter(|s| s.signal_type == SignalType::Absorption)
        .collect()
}

/// Scenario 1: heavy bids absorb ten aggressive sells with almost no price
/// movement. Exactly one SELL absorption signal; the cooldown suppresses a
/// second one inside the window.
#[tokio::test]
async fn test_clear_bid_absorption_emits_sell() {
    let seed = DepthSnapshot {
        last_update_id: 100,
        bids: vec![["89.00".into(), "2000".into()]],
        asks: vec![["89.01".into(), "100".into()]],
    };
    let mut trades = String::from("timestamp,trade_id,price,quantity,buyer_is_maker\n");
    for i in 0..10 {
        let price = if i % 2 == 0 { "89.00" } else { "89.005" };
        trades.push_str(&format!("{},{},{},60,true\n", 1_000 + i * 800, i + 1, price));
    }
    let depth = "timestamp,first_update_id,final_update_id,side,price,quantity\n\
                 500,101,101,bid,89.00,2000\n";

    let (published, counters) = run_transcript(seed, &trades, depth, engine_config()).await;

    assert_eq!(counters.trades_processed, 10);
    let absorption = absorption_signals(&published);
    assert_eq!(absorption.len(), 1);
    let signal = absorption[0];
    assert_eq!(signal.side, Side::Sell);
    assert_eq!(signal.price, FixedPoint::parse("89.00").unwrap());
    assert!(signal.confidence >= FixedPoint::from_f64(0.6));
}

/// Scenario 2: mirror of scenario 1 on the ask side, expecting BUY.
#[tokio::test]
async fn test_clear_ask_absorption_emits_buy() {
    let seed = DepthSnapshot {
        last_update_id: 100,
        bids: vec![["89.00".into(), "100".into()]],
        asks: vec![["89.01".into(), "2000".into()]],
    };
    let mut trades = String::from("timestamp,trade_id,price,quantity,buyer_is_maker\n");
    for i in 0..10 {
        let price = if i % 2 == 0 { "89.01" } else { "89.005" };
        trades.push_str(&format!("{},{},{},60,false\n", 1_000 + i * 800, i + 1, price));
    }
    let depth = "timestamp,first_update_id,final_update_id,side,price,quantity\n\
                 500,101,101,ask,89.01,2000\n";

    let (published, _) = run_transcript(seed, &trades, depth, engine_config()).await;
    let absorption = absorption_signals(&published);
    assert_eq!(absorption.len(), 1);
    assert_eq!(absorption[0].side, Side::Buy);
}

/// Scenario 3: balanced passives produce no absorption signal at all.
#[tokio::test]
async fn test_balanced_passives_emit_nothing() {
    let seed = DepthSnapshot {
        last_update_id: 100,
        bids: vec![["89.00".into(), "500".into()]],
        asks: vec![["89.01".into(), "500".into()]],
    };
    let mut trades = String::from("timestamp,trade_id,price,quantity,buyer_is_maker\n");
    for i in 0..5 {
        trades.push_str(&format!("{},{},89.00,60,true\n", 1_000 + i * 800, i + 1));
    }
    let depth = "timestamp,first_update_id,final_update_id,side,price,quantity\n\
                 500,101,101,bid,89.00,500\n";

    let (published, counters) = run_transcript(seed, &trades, depth, engine_config()).await;
    assert_eq!(counters.trades_processed, 5);
    assert!(absorption_signals(&published).is_empty());
}

/// The signal log and trade archive sinks receive what the engine
/// publishes and ingests.
#[tokio::test]
async fn test_worker_sinks_record_the_run() {
    use orderflow_engine::engine::sink::spawn_jsonl_sink;
    use orderflow_engine::feed::AggressiveTrade;
    use std::time::Duration;

    let dir = tempfile::tempdir().unwrap();
    let trades_path = {
        let mut trades = String::from("timestamp,trade_id,price,quantity,buyer_is_maker\n");
        for i in 0..10 {
            let price = if i % 2 == 0 { "89.00" } else { "89.005" };
            trades.push_str(&format!("{},{},{},60,true\n", 1_000 + i * 800, i + 1, price));
        }
        write_file(dir.path(), "trades.csv", &trades)
    };
    let depth_path = write_file(
        dir.path(),
        "depth.csv",
        "timestamp,first_update_id,final_update_id,side,price,quantity\n\
         500,101,101,bid,89.00,2000\n",
    );
    let seed = DepthSnapshot {
        last_update_id: 100,
        bids: vec![["89.00".into(), "2000".into()]],
        asks: vec![["89.01".into(), "100".into()]],
    };
    let cfg = engine_config();
    let sim = MarketSimulator::from_csv_files(
        "BTCUSDT",
        &trades_path,
        &depth_path,
        seed,
        FixedPoint::from_f64(cfg.tick_size),
        SimulatorConfig::default(),
    )
    .unwrap();
    let fetcher = sim.snapshot_fetcher();

    let signal_log = dir.path().join("signals.jsonl");
    let archive_log = dir.path().join("trades.jsonl");
    let (signal_sink, signal_worker) = spawn_jsonl_sink::<ProcessedSignal>(
        "signal-log",
        signal_log.clone(),
        64,
        Duration::from_millis(500),
    );
    let (archive_sink, archive_worker) = spawn_jsonl_sink::<AggressiveTrade>(
        "trade-archive",
        archive_log.clone(),
        64,
        Duration::from_millis(500),
    );

    let engine = Engine::new(cfg, fetcher)
        .unwrap()
        .with_signal_sink(signal_sink)
        .with_trade_archive(archive_sink);
    let (feed_tx, feed_rx) = mpsc::channel(256);
    let (pub_tx, mut pub_rx) = mpsc::channel(256);
    let engine_task = tokio::spawn(engine.run(feed_rx, pub_tx, CancellationToken::new()));

    sim.replay_into(feed_tx, |_| {}).await.unwrap();
    engine_task.await.unwrap().unwrap();
    signal_worker.await.unwrap();
    archive_worker.await.unwrap();
    while pub_rx.try_recv().is_ok() {}

    let signal_lines = std::fs::read_to_string(&signal_log).unwrap();
    assert!(signal_lines.lines().count() >= 1);
    assert!(signal_lines.contains("\"absorption\""));

    let archive_lines = std::fs::read_to_string(&archive_log).unwrap();
    assert_eq!(archive_lines.lines().count(), 10);
}

/// Scenario 6: a skipped depth update id triggers exactly one resync and
/// normal operation resumes afterwards.
#[tokio::test]
async fn test_depth_gap_triggers_single_resync() {
    let seed = DepthSnapshot {
        last_update_id: 100,
        bids: vec![["89.00".into(), "2000".into()]],
        asks: vec![["89.01".into(), "100".into()]],
    };
    let trades = "timestamp,trade_id,price,quantity,buyer_is_maker\n\
                  5000,1,89.00,60,true\n";
    // 101 applies, 103 skips 102.
    let depth = "timestamp,first_update_id,final_update_id,side,price,quantity\n\
                 1000,101,101,bid,89.00,1900\n\
                 2000,103,103,bid,89.00,1800\n";

    let (_, counters) = run_transcript(seed, trades, depth, engine_config()).await;
    assert_eq!(counters.resyncs_completed, 1);
    assert_eq!(counters.trades_processed, 1);
}
