//! Cadence Scheduler
//!
//! One scheduler per symbol. Runs the external engine's blocking
//! `run_once` through the runtime's blocking pool, feeds the outcome
//! through the risk gate and into the state store, then sleeps according
//! to the regime-keyed cadence table. Pause keeps the loop alive for a
//! cheap resume; kill is terminal and cancels the in-flight cycle.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CadenceConfig;
use crate::engine::{EngineHandle, Regime, Signal};
use crate::risk::{RiskGate, SizingRequest};
use crate::store::StateStore;

/// Lifecycle phase of a symbol scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerPhase {
    Stopped,
    Running,
    Paused,
    Killed,
}

impl SchedulerPhase {
    /// Killed is terminal: no further cycles will ever run
    pub fn is_terminal(&self) -> bool {
        matches!(self, SchedulerPhase::Killed)
    }
}

impl std::fmt::Display for SchedulerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerPhase::Stopped => write!(f, "stopped"),
            SchedulerPhase::Running => write!(f, "running"),
            SchedulerPhase::Paused => write!(f, "paused"),
            SchedulerPhase::Killed => write!(f, "killed"),
        }
    }
}

/// Telemetry snapshot of one scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub symbol: String,
    pub phase: SchedulerPhase,
    pub is_paused: bool,
    pub is_killed: bool,
    pub risk_off: bool,
    pub last_signal: Option<Signal>,
    pub last_regime: Option<Regime>,
    pub last_cycle_latency_ms: u64,
    pub last_sized_notional: Decimal,
    pub cycle_errors: u64,
}

#[derive(Debug, Default)]
struct CycleSnapshot {
    last_signal: Option<Signal>,
    last_regime: Option<Regime>,
    last_sized_notional: Decimal,
}

fn cadence_duration(cadence: &CadenceConfig, regime: Regime) -> Duration {
    let secs = match regime {
        Regime::Trend => cadence.trend_secs,
        Regime::Normal => cadence.normal_secs,
        Regime::Chop => cadence.chop_secs,
        Regime::Panic => cadence.panic_secs,
    };
    Duration::from_secs_f64(secs.max(0.0))
}

/// Per-symbol decision-cycle loop with adaptive cadence
pub struct CadenceScheduler {
    symbol: String,
    engine: Arc<dyn EngineHandle>,
    gate: Arc<RiskGate>,
    store: Arc<StateStore>,
    cadence: CadenceConfig,
    running: AtomicBool,
    paused: AtomicBool,
    killed: AtomicBool,
    risk_off: AtomicBool,
    global_risk_off: Arc<AtomicBool>,
    last_latency_ms: AtomicU64,
    cycle_errors: AtomicU64,
    snapshot: RwLock<CycleSnapshot>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CadenceScheduler {
    pub fn new(
        symbol: impl Into<String>,
        engine: Arc<dyn EngineHandle>,
        gate: Arc<RiskGate>,
        store: Arc<StateStore>,
        cadence: CadenceConfig,
        global_risk_off: Arc<AtomicBool>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            engine,
            gate,
            store,
            cadence,
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            risk_off: AtomicBool::new(false),
            global_risk_off,
            last_latency_ms: AtomicU64::new(0),
            cycle_errors: AtomicU64::new(0),
            snapshot: RwLock::new(CycleSnapshot::default()),
            handle: Mutex::new(None),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Handle of the engine collaborator this scheduler drives.
    pub fn engine(&self) -> &Arc<dyn EngineHandle> {
        &self.engine
    }

    /// Spawn the run loop. Idempotent: a live loop is left untouched, and a
    /// killed scheduler never restarts.
    pub async fn start(self: Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if let Some(h) = handle.as_ref() {
            if !h.is_finished() {
                debug!(symbol = %self.symbol, "scheduler already running");
                return;
            }
        }
        if self.killed.load(Ordering::SeqCst) {
            warn!(symbol = %self.symbol, "scheduler is killed, refusing start");
            return;
        }

        self.running.store(true, Ordering::SeqCst);
        info!(symbol = %self.symbol, "scheduler started");
        let this = Arc::clone(&self);
        *handle = Some(tokio::spawn(async move {
            this.run_loop().await;
        }));
    }

    /// Suspend cycle execution but keep the loop alive for cheap resume.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!(symbol = %self.symbol, "scheduler paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!(symbol = %self.symbol, "scheduler resumed");
    }

    /// Terminal stop: no new cycles, and the in-flight cycle task is
    /// cancelled at its next await point.
    pub async fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);

        let mut handle = self.handle.lock().await;
        if let Some(h) = handle.take() {
            h.abort();
            let _ = h.await;
        }
        info!(symbol = %self.symbol, "scheduler killed");
    }

    /// Alias for [`kill`](Self::kill); both transitions are terminal.
    pub async fn stop(&self) {
        self.kill().await;
    }

    /// Set the per-symbol risk-off flag and push it to the engine.
    pub fn set_risk_off(&self, value: bool) {
        self.risk_off.store(value, Ordering::SeqCst);
        self.engine.set_risk_off(value);
        info!(symbol = %self.symbol, risk_off = value, "risk-off updated");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn cycle_errors(&self) -> u64 {
        self.cycle_errors.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> SchedulerStatus {
        let snapshot = self.snapshot.read().await;
        let is_killed = self.killed.load(Ordering::SeqCst);
        let is_paused = self.paused.load(Ordering::SeqCst);
        let phase = if is_killed {
            SchedulerPhase::Killed
        } else if self.running.load(Ordering::SeqCst) {
            if is_paused {
                SchedulerPhase::Paused
            } else {
                SchedulerPhase::Running
            }
        } else {
            SchedulerPhase::Stopped
        };
        SchedulerStatus {
            symbol: self.symbol.clone(),
            phase,
            is_paused,
            is_killed,
            risk_off: self.risk_off.load(Ordering::SeqCst),
            last_signal: snapshot.last_signal,
            last_regime: snapshot.last_regime,
            last_cycle_latency_ms: self.last_latency_ms.load(Ordering::SeqCst),
            last_sized_notional: snapshot.last_sized_notional,
            cycle_errors: self.cycle_errors.load(Ordering::SeqCst),
        }
    }

    async fn run_loop(&self) {
        while self.running.load(Ordering::SeqCst) && !self.killed.load(Ordering::SeqCst) {
            if self.paused.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(self.cadence.pause_poll_ms)).await;
                continue;
            }

            let regime = self.run_cycle().await;
            tokio::time::sleep(cadence_duration(&self.cadence, regime)).await;
        }
        self.running.store(false, Ordering::SeqCst);
        debug!(symbol = %self.symbol, "scheduler loop exited");
    }

    /// Execute one decision cycle. Errors are counted and logged, never
    /// propagated; the loop continues on the next cadence tick.
    async fn run_cycle(&self) -> Regime {
        let cid = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let started = Instant::now();

        // Both flags propagate every cycle; the engine sees the OR of them
        // as its effective entry gate.
        self.engine.set_risk_off(self.risk_off.load(Ordering::SeqCst));
        self.engine
            .set_global_risk_off(self.global_risk_off.load(Ordering::SeqCst));

        let engine = Arc::clone(&self.engine);
        let outcome = match tokio::task::spawn_blocking(move || engine.run_once()).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                self.cycle_errors.fetch_add(1, Ordering::SeqCst);
                warn!(symbol = %self.symbol, %cid, error = %e, "engine cycle failed");
                return Regime::Normal;
            }
            Err(e) => {
                self.cycle_errors.fetch_add(1, Ordering::SeqCst);
                warn!(symbol = %self.symbol, %cid, error = %e, "engine cycle task aborted");
                return Regime::Normal;
            }
        };

        let prices = self.engine.price_history();
        let positions = self.engine.positions();
        let decision = self
            .gate
            .evaluate(
                &SizingRequest {
                    symbol: &self.symbol,
                    signal: outcome.signal,
                    prices: &prices,
                    positions: &positions,
                    equity: self.engine.equity(),
                },
                outcome.regime,
            )
            .await;

        let latency_ms = started.elapsed().as_millis() as u64;
        self.last_latency_ms.store(latency_ms, Ordering::SeqCst);
        {
            let mut snapshot = self.snapshot.write().await;
            snapshot.last_signal = Some(outcome.signal);
            snapshot.last_regime = Some(outcome.regime);
            snapshot.last_sized_notional = decision.notional;
        }

        if let Err(e) = self
            .store
            .mark_run(&self.symbol, outcome.signal, outcome.regime, latency_ms)
            .await
        {
            warn!(symbol = %self.symbol, %cid, error = %e, "state store write failed");
        }

        let budget = cadence_duration(&self.cadence, outcome.regime);
        if latency_ms as f64 > budget.as_secs_f64() * 1000.0 * 1.5 {
            warn!(symbol = %self.symbol, %cid, duration_ms = latency_ms, "slow cycle");
        }

        debug!(
            symbol = %self.symbol,
            %cid,
            signal = %outcome.signal,
            regime = %outcome.regime,
            duration_ms = latency_ms,
            notional = %decision.notional,
            breaker_active = decision.breaker.active,
            "cycle complete"
        );

        outcome.regime
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, RiskConfig};
    use crate::engine::{CycleOutcome, MockEngineHandle};
    use crate::risk::{CircuitBreaker, RiskEngine};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn test_gate() -> Arc<RiskGate> {
        Arc::new(RiskGate::new(
            Arc::new(CircuitBreaker::new(BreakerConfig::default())),
            Arc::new(RiskEngine::new(RiskConfig::default())),
        ))
    }

    fn fast_cadence() -> CadenceConfig {
        CadenceConfig {
            trend_secs: 0.01,
            normal_secs: 0.01,
            chop_secs: 0.01,
            panic_secs: 0.05,
            pause_poll_ms: 5,
        }
    }

    fn scripted_engine() -> MockEngineHandle {
        let mut engine = MockEngineHandle::new();
        engine.expect_run_once().returning(|| {
            Ok(CycleOutcome {
                signal: Signal::Hold,
                regime: Regime::Normal,
            })
        });
        engine.expect_set_risk_off().return_const(());
        engine.expect_set_global_risk_off().return_const(());
        engine.expect_price_history().returning(Vec::new);
        engine.expect_positions().returning(HashMap::new);
        engine.expect_equity().returning(|| dec!(10000));
        engine.expect_last_signal().returning(|| Signal::Hold);
        engine.expect_last_regime().returning(|| Regime::Normal);
        engine
    }

    async fn scheduler_with(engine: MockEngineHandle) -> (Arc<CadenceScheduler>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path().join("state.json")).await);
        let scheduler = Arc::new(CadenceScheduler::new(
            "BTC/USDT",
            Arc::new(engine),
            test_gate(),
            store,
            fast_cadence(),
            Arc::new(AtomicBool::new(false)),
        ));
        (scheduler, dir)
    }

    #[test]
    fn test_cadence_table() {
        let cadence = CadenceConfig::default();
        assert_eq!(cadence_duration(&cadence, Regime::Trend), Duration::from_secs(1));
        assert_eq!(cadence_duration(&cadence, Regime::Normal), Duration::from_secs(3));
        assert_eq!(cadence_duration(&cadence, Regime::Chop), Duration::from_secs(7));
        assert_eq!(cadence_duration(&cadence, Regime::Panic), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (scheduler, _dir) = scheduler_with(scripted_engine()).await;
        scheduler.clone().start().await;
        scheduler.clone().start().await;
        assert!(scheduler.is_running());
        scheduler.kill().await;
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_cycles_record_into_store() {
        let (scheduler, _dir) = scheduler_with(scripted_engine()).await;
        scheduler.clone().start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.kill().await;

        let status = scheduler.status().await;
        assert_eq!(status.last_signal, Some(Signal::Hold));
        assert_eq!(status.last_regime, Some(Regime::Normal));
        assert_eq!(status.cycle_errors, 0);
    }

    #[tokio::test]
    async fn test_kill_is_terminal() {
        let (scheduler, _dir) = scheduler_with(scripted_engine()).await;
        scheduler.clone().start().await;
        scheduler.kill().await;
        assert!(scheduler.is_killed());

        // A killed scheduler refuses to restart
        scheduler.clone().start().await;
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.status().await.phase, SchedulerPhase::Killed);
    }

    #[tokio::test]
    async fn test_pause_suspends_cycles() {
        let (scheduler, _dir) = scheduler_with(scripted_engine()).await;

        scheduler.pause();
        scheduler.clone().start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Paused from the start: loop alive, no cycles ran
        assert!(scheduler.is_running());
        assert_eq!(scheduler.status().await.phase, SchedulerPhase::Paused);
        assert!(scheduler.status().await.last_signal.is_none());

        scheduler.resume();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(scheduler.status().await.last_signal.is_some());
        scheduler.kill().await;
    }

    #[tokio::test]
    async fn test_engine_failure_keeps_loop_alive() {
        let mut engine = MockEngineHandle::new();
        engine.expect_set_risk_off().return_const(());
        engine.expect_set_global_risk_off().return_const(());
        engine
            .expect_run_once()
            .returning(|| Err("feed unavailable".to_string()));
        let (scheduler, _dir) = scheduler_with(engine).await;

        scheduler.clone().start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(scheduler.is_running());
        assert!(scheduler.cycle_errors() > 0);
        scheduler.kill().await;
    }

    #[tokio::test]
    async fn test_risk_off_propagates_to_engine() {
        let engine = Arc::new(crate::engine::PaperEngine::with_seed("BTC/USDT", 9));
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path().join("state.json")).await);
        let scheduler = Arc::new(CadenceScheduler::new(
            "BTC/USDT",
            engine.clone() as Arc<dyn EngineHandle>,
            test_gate(),
            store,
            fast_cadence(),
            Arc::new(AtomicBool::new(false)),
        ));

        scheduler.set_risk_off(true);
        scheduler.clone().start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.kill().await;

        // Entries stayed suppressed for every cycle
        assert_eq!(scheduler.status().await.last_signal, Some(Signal::Hold));
        assert!(scheduler.status().await.risk_off);
    }
}
