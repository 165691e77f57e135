//! End-to-end orchestration tests over the public API.

use conductor::config::AppConfig;
use conductor::coordinator::Coordinator;
use conductor::engine::{CycleOutcome, EngineHandle, PaperEngine, Regime, Signal};
use conductor::killswitch::{FileKillSwitch, KillSwitchSource, StaticKillSwitch};
use conductor::store::StateStore;
use conductor::train::{NullTrainRunner, TrainRunner};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Deterministic engine that always reports the same signal and regime
struct ScriptedEngine {
    signal: Signal,
    regime: Regime,
    cycles: AtomicU64,
    risk_off: AtomicBool,
    global_risk_off: AtomicBool,
}

impl ScriptedEngine {
    fn new(signal: Signal, regime: Regime) -> Self {
        Self {
            signal,
            regime,
            cycles: AtomicU64::new(0),
            risk_off: AtomicBool::new(false),
            global_risk_off: AtomicBool::new(false),
        }
    }

    fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }
}

impl EngineHandle for ScriptedEngine {
    fn run_once(&self) -> Result<CycleOutcome, String> {
        self.cycles.fetch_add(1, Ordering::SeqCst);
        let suppressed =
            self.risk_off.load(Ordering::SeqCst) || self.global_risk_off.load(Ordering::SeqCst);
        Ok(CycleOutcome {
            signal: if suppressed { Signal::Hold } else { self.signal },
            regime: self.regime,
        })
    }

    fn last_signal(&self) -> Signal {
        self.signal
    }

    fn last_regime(&self) -> Regime {
        self.regime
    }

    fn set_risk_off(&self, value: bool) {
        self.risk_off.store(value, Ordering::SeqCst);
    }

    fn set_global_risk_off(&self, value: bool) {
        self.global_risk_off.store(value, Ordering::SeqCst);
    }

    fn price_history(&self) -> Vec<Decimal> {
        vec![
            dec!(100),
            dec!(100.4),
            dec!(99.8),
            dec!(100.6),
            dec!(100.1),
            dec!(100.5),
        ]
    }

    fn positions(&self) -> HashMap<String, Decimal> {
        HashMap::new()
    }

    fn equity(&self) -> Decimal {
        dec!(10000)
    }
}

/// Trainer that fails a configured number of times before succeeding
struct FlakyTrainer {
    failures_left: AtomicU32,
    calls: AtomicU32,
}

impl FlakyTrainer {
    fn new(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }
}

impl TrainRunner for FlakyTrainer {
    fn run(&self, _job: &str, _notes: Option<&str>) -> Result<(), String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            Err("transient trainer failure".to_string())
        } else {
            Ok(())
        }
    }
}

fn fast_config(symbols: &[&str]) -> AppConfig {
    let symbols: Vec<String> = symbols.iter().map(|s| s.to_string()).collect();
    let mut config = AppConfig::default_config(&symbols);
    config.cadence.trend_secs = 0.01;
    config.cadence.normal_secs = 0.02;
    config.cadence.chop_secs = 0.03;
    config.cadence.panic_secs = 0.25;
    config.cadence.pause_poll_ms = 5;
    config.queue.manager_tick_ms = 10;
    config
}

async fn build(
    config: &AppConfig,
    engines: HashMap<String, Arc<dyn EngineHandle>>,
    kill_switch: Arc<dyn KillSwitchSource>,
    trainer: Arc<dyn TrainRunner>,
) -> (Arc<Coordinator>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StateStore::open(dir.path().join("state.json")).await);
    let coordinator = Coordinator::new(config, engines, store, kill_switch, trainer);
    (coordinator, dir)
}

#[tokio::test]
async fn full_lifecycle_with_paper_engines() {
    let config = fast_config(&["BTC/USDT", "ETH/USDT"]);
    let mut engines: HashMap<String, Arc<dyn EngineHandle>> = HashMap::new();
    for (i, symbol) in config.symbols.iter().enumerate() {
        engines.insert(
            symbol.clone(),
            Arc::new(PaperEngine::with_seed(symbol.clone(), 40 + i as u64)),
        );
    }
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    let store = Arc::new(StateStore::open(&state_path).await);
    let coordinator = Coordinator::new(
        &config,
        engines,
        store,
        Arc::new(StaticKillSwitch::new()),
        Arc::new(NullTrainRunner),
    );

    coordinator.clone().start_all().await;
    tokio::time::sleep(Duration::from_millis(250)).await;

    let telemetry = coordinator.telemetry().await;
    assert_eq!(telemetry.symbols.len(), 2);
    for symbol in &config.symbols {
        let view = &telemetry.symbols[symbol];
        assert!(view.scheduler.last_signal.is_some(), "{symbol} never cycled");
        assert!(view.risk.is_some(), "{symbol} has no risk telemetry");
    }
    assert!(telemetry.portfolio.portfolio_equity > dec!(0));

    coordinator.shutdown().await;
    // The snapshot survived on disk for the next start
    let recovered = StateStore::open(&state_path).await.snapshot().await;
    assert!(!recovered.per_symbol.is_empty());
}

#[tokio::test]
async fn start_stop_idempotence_over_public_api() {
    let config = fast_config(&["BTC/USDT"]);
    let engine = Arc::new(ScriptedEngine::new(Signal::Hold, Regime::Normal));
    let mut engines: HashMap<String, Arc<dyn EngineHandle>> = HashMap::new();
    engines.insert("BTC/USDT".to_string(), engine.clone());
    let (coordinator, _dir) = build(
        &config,
        engines,
        Arc::new(StaticKillSwitch::new()),
        Arc::new(NullTrainRunner),
    )
    .await;

    coordinator.clone().start_all().await;
    coordinator.clone().start_all().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let telemetry = coordinator.telemetry().await;
    assert_eq!(
        telemetry.symbols["BTC/USDT"].scheduler.phase.to_string(),
        "running"
    );

    coordinator.stop_all().await;
    coordinator.stop_all().await;
    let telemetry = coordinator.telemetry().await;
    assert!(telemetry.symbols["BTC/USDT"].scheduler.is_killed);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn panic_regime_slows_cadence() {
    let config = fast_config(&["FAST/USDT", "SLOW/USDT"]);
    let fast = Arc::new(ScriptedEngine::new(Signal::Hold, Regime::Trend));
    let slow = Arc::new(ScriptedEngine::new(Signal::Hold, Regime::Panic));
    let mut engines: HashMap<String, Arc<dyn EngineHandle>> = HashMap::new();
    engines.insert("FAST/USDT".to_string(), fast.clone());
    engines.insert("SLOW/USDT".to_string(), slow.clone());
    let (coordinator, _dir) = build(
        &config,
        engines,
        Arc::new(StaticKillSwitch::new()),
        Arc::new(NullTrainRunner),
    )
    .await;

    coordinator.clone().start_all().await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    coordinator.shutdown().await;

    // Trend cadence is 10ms, panic cadence 250ms: the panic symbol must
    // have completed far fewer cycles in the same window.
    assert!(fast.cycles() >= 8, "fast engine ran {} cycles", fast.cycles());
    assert!(slow.cycles() <= 3, "slow engine ran {} cycles", slow.cycles());
}

#[tokio::test]
async fn flaky_train_job_eventually_succeeds() {
    let config = fast_config(&["BTC/USDT"]);
    let trainer = Arc::new(FlakyTrainer::new(2));
    let mut engines: HashMap<String, Arc<dyn EngineHandle>> = HashMap::new();
    engines.insert(
        "BTC/USDT".to_string(),
        Arc::new(ScriptedEngine::new(Signal::Hold, Regime::Normal)),
    );
    let (coordinator, _dir) = build(
        &config,
        engines,
        Arc::new(StaticKillSwitch::new()),
        trainer.clone() as Arc<dyn TrainRunner>,
    )
    .await;

    coordinator.clone().start_all().await;
    let ticket = coordinator.enqueue_train("warmup", None).unwrap();
    assert!(ticket.starts_with("train-warmup-"));

    tokio::time::sleep(Duration::from_millis(300)).await;
    coordinator.shutdown().await;

    // Two failures then success: three runs, nothing dropped
    assert_eq!(trainer.calls.load(Ordering::SeqCst), 3);
    assert_eq!(coordinator.queue_stats().dropped_total, 0);
    assert_eq!(coordinator.in_flight_count(), 0);
}

#[tokio::test]
async fn file_kill_switch_halts_coordinator() {
    let config = fast_config(&["BTC/USDT"]);
    let flag_dir = tempfile::tempdir().unwrap();
    let flag_path = flag_dir.path().join("KILL");
    let kill_switch = Arc::new(FileKillSwitch::new(&flag_path));
    let mut engines: HashMap<String, Arc<dyn EngineHandle>> = HashMap::new();
    engines.insert(
        "BTC/USDT".to_string(),
        Arc::new(ScriptedEngine::new(Signal::Buy, Regime::Normal)),
    );
    let (coordinator, _dir) = build(
        &config,
        engines,
        kill_switch,
        Arc::new(NullTrainRunner),
    )
    .await;

    coordinator.clone().start_all().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!coordinator.is_killed());

    std::fs::write(&flag_path, b"halt").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(coordinator.is_killed());

    // Highest-priority stop condition: train intake is refused too
    assert!(coordinator.enqueue_train("late", None).is_err());
}

#[tokio::test]
async fn global_risk_off_suppresses_entries_without_stopping_loops() {
    let config = fast_config(&["BTC/USDT"]);
    let engine = Arc::new(ScriptedEngine::new(Signal::Buy, Regime::Normal));
    let mut engines: HashMap<String, Arc<dyn EngineHandle>> = HashMap::new();
    engines.insert("BTC/USDT".to_string(), engine.clone());
    let (coordinator, _dir) = build(
        &config,
        engines,
        Arc::new(StaticKillSwitch::new()),
        Arc::new(NullTrainRunner),
    )
    .await;

    coordinator.risk_off_all(true);
    coordinator.clone().start_all().await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let telemetry = coordinator.telemetry().await;
    let view = &telemetry.symbols["BTC/USDT"];
    // Loop kept monitoring but every cycle held
    assert!(engine.cycles() > 0);
    assert_eq!(view.scheduler.last_signal, Some(Signal::Hold));
    assert_eq!(view.scheduler.last_sized_notional, dec!(0));
    assert!(telemetry.portfolio.global_risk_off);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn breaker_activation_zeroes_sizing_through_the_gate() {
    // A panic regime trips the breaker on the first cycle; subsequent
    // entry signals must size to zero while the cooldown holds.
    let config = fast_config(&["BTC/USDT"]);
    let engine = Arc::new(ScriptedEngine::new(Signal::Buy, Regime::Panic));
    let mut engines: HashMap<String, Arc<dyn EngineHandle>> = HashMap::new();
    engines.insert("BTC/USDT".to_string(), engine.clone());
    let (coordinator, _dir) = build(
        &config,
        engines,
        Arc::new(StaticKillSwitch::new()),
        Arc::new(NullTrainRunner),
    )
    .await;

    coordinator.clone().start_all().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    coordinator.shutdown().await;

    let telemetry = coordinator.telemetry().await;
    assert!(telemetry.breaker.active);
    assert_eq!(telemetry.breaker.reason.map(|r| r.to_string()), Some("panic".to_string()));
    assert_eq!(
        telemetry.symbols["BTC/USDT"].scheduler.last_sized_notional,
        dec!(0)
    );
}
