//! Multi-Symbol Coordinator
//!
//! Owns one cadence scheduler per symbol plus a manager loop that drains
//! the task queue, enforces visibility-timeout retries, polls the kill
//! switch, and aggregates a portfolio-level snapshot. Start/stop are
//! idempotent; shutdown flips the admission flag first, requeues in-flight
//! work, and only then cancels tasks.

mod telemetry;

pub use telemetry::{CoordinatorTelemetry, PortfolioTelemetry, SymbolTelemetry};

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::engine::{EngineHandle, NullEngine};
use crate::error::{ConductorError, Result};
use crate::killswitch::KillSwitchSource;
use crate::queue::{Task, TaskKind, TaskQueue};
use crate::risk::{CircuitBreaker, RiskEngine, RiskGate};
use crate::scheduler::CadenceScheduler;
use crate::store::{OrchestratorRecord, StateStore};
use crate::train::TrainRunner;

/// A dequeued task the manager loop has admitted but not yet finished
struct InflightEntry {
    admitted_at: Instant,
    task: Task,
}

/// Multi-symbol orchestration coordinator
pub struct Coordinator {
    schedulers: HashMap<String, Arc<CadenceScheduler>>,
    queue: Arc<TaskQueue>,
    store: Arc<StateStore>,
    gate: Arc<RiskGate>,
    kill_switch: Arc<dyn KillSwitchSource>,
    trainer: Arc<dyn TrainRunner>,
    global_risk_off: Arc<AtomicBool>,
    running: AtomicBool,
    killed: AtomicBool,
    /// Ticket → in-flight entry. Written only by the manager loop; drained
    /// once by shutdown. A ticket is never simultaneously here and queued.
    inflight: StdMutex<HashMap<String, InflightEntry>>,
    manager_handle: Mutex<Option<JoinHandle<()>>>,
    /// Highest portfolio equity seen this run, for the drawdown readout
    peak_equity: StdMutex<Decimal>,
    loop_latency_ms: AtomicU64,
    visibility_timeout: Duration,
    max_attempts: u32,
    manager_tick: Duration,
}

impl Coordinator {
    /// Build a coordinator from configuration and collaborator handles.
    ///
    /// Symbols without an engine entry get a [`NullEngine`], so a missing
    /// collaborator degrades to safe all-hold decisions instead of failing
    /// construction.
    pub fn new(
        config: &AppConfig,
        mut engines: HashMap<String, Arc<dyn EngineHandle>>,
        store: Arc<StateStore>,
        kill_switch: Arc<dyn KillSwitchSource>,
        trainer: Arc<dyn TrainRunner>,
    ) -> Arc<Self> {
        let gate = Arc::new(RiskGate::new(
            Arc::new(CircuitBreaker::new(config.breaker.clone())),
            Arc::new(RiskEngine::new(config.risk.clone())),
        ));
        let global_risk_off = Arc::new(AtomicBool::new(false));

        let mut schedulers = HashMap::new();
        for symbol in &config.symbols {
            let engine = engines
                .remove(symbol)
                .unwrap_or_else(|| Arc::new(NullEngine) as Arc<dyn EngineHandle>);
            let scheduler = Arc::new(CadenceScheduler::new(
                symbol.clone(),
                engine,
                Arc::clone(&gate),
                Arc::clone(&store),
                config.cadence.clone(),
                Arc::clone(&global_risk_off),
            ));
            schedulers.insert(symbol.clone(), scheduler);
        }

        Arc::new(Self {
            schedulers,
            queue: Arc::new(TaskQueue::new()),
            store,
            gate,
            kill_switch,
            trainer,
            global_risk_off,
            running: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            inflight: StdMutex::new(HashMap::new()),
            manager_handle: Mutex::new(None),
            peak_equity: StdMutex::new(Decimal::ZERO),
            loop_latency_ms: AtomicU64::new(0),
            visibility_timeout: Duration::from_secs(config.queue.visibility_timeout_secs),
            max_attempts: config.queue.max_attempts,
            manager_tick: Duration::from_millis(config.queue.manager_tick_ms),
        })
    }

    pub fn symbols(&self) -> Vec<String> {
        self.schedulers.keys().cloned().collect()
    }

    pub fn gate(&self) -> &Arc<RiskGate> {
        &self.gate
    }

    pub fn queue_stats(&self) -> crate::queue::QueueStats {
        self.queue.stats()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------

    /// Start every scheduler plus the manager loop. Idempotent.
    pub async fn start_all(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("start_all: already running");
            return;
        }
        if self.killed.load(Ordering::SeqCst) {
            warn!("start_all: coordinator is killed, refusing start");
            self.running.store(false, Ordering::SeqCst);
            return;
        }

        for scheduler in self.schedulers.values() {
            scheduler.clone().start().await;
        }

        let mut handle = self.manager_handle.lock().await;
        if handle.as_ref().map(|h| h.is_finished()).unwrap_or(true) {
            let this = Arc::clone(&self);
            *handle = Some(tokio::spawn(async move {
                this.manager_loop().await;
            }));
        }
        info!(symbols = self.schedulers.len(), "coordinator started");
    }

    /// Stop every scheduler. Idempotent; the manager loop keeps ticking so
    /// queued work and snapshots continue to be served until shutdown.
    pub async fn stop_all(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            info!("stop_all: not running");
            return;
        }
        for scheduler in self.schedulers.values() {
            scheduler.stop().await;
        }
        info!("all schedulers stopped");
    }

    /// Graceful shutdown: block new admissions, requeue in-flight work with
    /// incremented attempts, then cancel schedulers and the manager loop.
    pub async fn shutdown(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            debug!("shutdown already in progress");
            return;
        }
        info!("coordinator shutdown initiated");

        // 1. No new work admitted from this point on
        self.queue.begin_shutdown();

        // 2. In-flight tasks go back on the queue before anything is cancelled
        let drained: Vec<InflightEntry> = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            inflight.drain().map(|(_, entry)| entry).collect()
        };
        for mut entry in drained {
            entry.task.attempts += 1;
            debug!(ticket = %entry.task.ticket, attempts = entry.task.attempts, "requeueing in-flight task");
            self.queue.requeue(entry.task);
        }

        // 3. Cancel outstanding per-symbol tasks and the manager task
        self.running.store(false, Ordering::SeqCst);
        for scheduler in self.schedulers.values() {
            scheduler.kill().await;
        }
        let mut handle = self.manager_handle.lock().await;
        if let Some(h) = handle.take() {
            h.abort();
            let _ = h.await;
        }
        info!("coordinator shutdown complete");
    }

    // ------------------------------------------------------------
    // Per-symbol controls
    // ------------------------------------------------------------

    fn scheduler(&self, symbol: &str) -> Result<&Arc<CadenceScheduler>> {
        self.schedulers
            .get(symbol)
            .ok_or_else(|| ConductorError::UnknownSymbol(symbol.to_string()))
    }

    pub fn pause_symbol(&self, symbol: &str) -> Result<()> {
        self.scheduler(symbol)?.pause();
        Ok(())
    }

    pub fn resume_symbol(&self, symbol: &str) -> Result<()> {
        self.scheduler(symbol)?.resume();
        Ok(())
    }

    /// Pause every scheduler; loops stay alive for a cheap resume.
    pub fn pause_all(&self) {
        for scheduler in self.schedulers.values() {
            scheduler.pause();
        }
    }

    pub fn resume_all(&self) {
        for scheduler in self.schedulers.values() {
            scheduler.resume();
        }
    }

    /// Hard kill for one symbol; terminal for that scheduler only.
    pub async fn kill_symbol(&self, symbol: &str) -> Result<()> {
        self.scheduler(symbol)?.kill().await;
        Ok(())
    }

    pub fn set_risk_off(&self, symbol: &str, value: bool) -> Result<()> {
        self.scheduler(symbol)?.set_risk_off(value);
        Ok(())
    }

    /// Set the coordinator-wide risk-off flag and mirror it onto every
    /// engine handle. Per-symbol flags are independent; the effective gate
    /// at the point of use is their OR.
    pub fn risk_off_all(&self, value: bool) {
        self.global_risk_off.store(value, Ordering::SeqCst);
        for scheduler in self.schedulers.values() {
            scheduler.engine().set_global_risk_off(value);
        }
        info!(global_risk_off = value, "global risk-off updated");
    }

    // ------------------------------------------------------------
    // Task intake
    // ------------------------------------------------------------

    /// Enqueue a training job, returning its ticket id.
    pub fn enqueue_train(&self, job: &str, notes: Option<&str>) -> Result<String> {
        if self.kill_switch.is_engaged() {
            return Err(ConductorError::KillSwitchEngaged);
        }
        if self.killed.load(Ordering::SeqCst) || self.queue.is_shutting_down() {
            return Err(ConductorError::ShuttingDown);
        }
        let task = Task::train(job, notes);
        let ticket = task.ticket.clone();
        self.queue.enqueue(task)?;
        info!(%ticket, job, "train job enqueued");
        Ok(ticket)
    }

    // ------------------------------------------------------------
    // Manager loop
    // ------------------------------------------------------------

    async fn manager_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.manager_tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("manager loop started");

        loop {
            tick.tick().await;
            let loop_start = Instant::now();

            // (a) Kill flag beats everything, including pause and risk-off
            if self.kill_switch.is_engaged() || self.killed.load(Ordering::SeqCst) {
                if self.kill_switch.is_engaged() {
                    warn!("kill switch engaged, halting all schedulers");
                }
                self.halt_all().await;
                break;
            }

            // (b) Visibility-timeout scan over the in-flight map
            self.scan_inflight().await;

            // (c) At most one task per tick
            if let Some(task) = self.queue.dequeue_nonblocking() {
                let shutdown_requested = self.process_task(task).await;
                if shutdown_requested {
                    self.halt_all().await;
                    break;
                }
            }

            // (d) Unified snapshot for external consumers
            self.write_unified_snapshot().await;

            // (e) Loop latency for observability
            self.loop_latency_ms
                .store(loop_start.elapsed().as_millis() as u64, Ordering::SeqCst);
        }
        info!("manager loop exited");
    }

    async fn halt_all(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.queue.begin_shutdown();
        for scheduler in self.schedulers.values() {
            scheduler.kill().await;
        }
    }

    /// Treat in-flight entries older than the visibility timeout as
    /// abandoned: requeue while the attempt budget lasts, drop permanently
    /// and record a terminal failure once it is exhausted.
    async fn scan_inflight(&self) {
        let expired: Vec<Task> = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            let timeout = self.visibility_timeout;
            let expired_tickets: Vec<String> = inflight
                .iter()
                .filter(|(_, entry)| entry.admitted_at.elapsed() > timeout)
                .map(|(ticket, _)| ticket.clone())
                .collect();
            expired_tickets
                .into_iter()
                .filter_map(|ticket| inflight.remove(&ticket).map(|e| e.task))
                .collect()
        };

        for mut task in expired {
            task.attempts += 1;
            if task.attempts <= self.max_attempts {
                debug!(ticket = %task.ticket, attempts = task.attempts, "visibility timeout, requeueing");
                self.queue.requeue(task);
            } else {
                self.drop_task(&task, "visibility timeout").await;
            }
        }
    }

    /// Returns true when the task requests a full shutdown.
    async fn process_task(&self, task: Task) -> bool {
        let ticket = task.ticket.clone();
        {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            inflight.insert(
                ticket.clone(),
                InflightEntry {
                    admitted_at: Instant::now(),
                    task: task.clone(),
                },
            );
        }

        match task.kind {
            TaskKind::Shutdown => {
                info!(%ticket, "shutdown task received");
                self.remove_inflight(&ticket);
                true
            }
            TaskKind::Train => {
                self.handle_train(task).await;
                false
            }
            TaskKind::Custom => {
                debug!(%ticket, "custom task acknowledged");
                self.remove_inflight(&ticket);
                false
            }
        }
    }

    /// Delegate a train job to the external runner, retrying through the
    /// queue on failure up to the attempt budget.
    async fn handle_train(&self, task: Task) {
        let ticket = task.ticket.clone();
        let job = task.payload.get("job").cloned().unwrap_or_default();
        let notes = task.payload.get("notes").cloned();

        let trainer = Arc::clone(&self.trainer);
        let job_for_runner = job.clone();
        let result = tokio::task::spawn_blocking(move || {
            trainer.run(&job_for_runner, notes.as_deref())
        })
        .await;

        self.remove_inflight(&ticket);

        let failure = match result {
            Ok(Ok(())) => {
                debug!(%ticket, job, "train job completed");
                None
            }
            Ok(Err(e)) => Some(e),
            Err(e) => Some(format!("train task aborted: {e}")),
        };

        if let Some(reason) = failure {
            let mut task = task;
            task.attempts += 1;
            if task.attempts <= self.max_attempts {
                warn!(%ticket, job, attempts = task.attempts, %reason, "train job failed, requeueing");
                self.queue.requeue(task);
            } else {
                self.drop_task(&task, &reason).await;
            }
        }
    }

    fn remove_inflight(&self, ticket: &str) {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        inflight.remove(ticket);
    }

    async fn drop_task(&self, task: &Task, reason: &str) {
        self.queue.record_drop();
        let event = format!(
            "task {} dropped after {} attempts: {reason}",
            task.ticket, task.attempts
        );
        error!(ticket = %task.ticket, attempts = task.attempts, reason, "task dropped permanently");
        if let Err(e) = self.store.record_exception(&event).await {
            warn!(error = %e, "failed to record drop event");
        }
    }

    async fn write_unified_snapshot(&self) {
        let mut portfolio_equity = Decimal::ZERO;
        let mut symbols_active = Vec::new();
        for (symbol, scheduler) in &self.schedulers {
            portfolio_equity += scheduler.engine().equity();
            if scheduler.is_running() {
                symbols_active.push(symbol.clone());
            }
        }
        symbols_active.sort();

        let peak = {
            let mut peak = self.peak_equity.lock().unwrap_or_else(|e| e.into_inner());
            *peak = (*peak).max(portfolio_equity);
            *peak
        };
        let drawdown = if peak > Decimal::ZERO {
            (peak - portfolio_equity) / peak
        } else {
            Decimal::ZERO
        };

        let record = OrchestratorRecord {
            kill: self.kill_switch.is_engaged() || self.killed.load(Ordering::SeqCst),
            queue_length: self.queue.len(),
            in_flight: self.in_flight_count(),
            loop_latency_ms: self.loop_latency_ms.load(Ordering::SeqCst),
            symbols_active,
            portfolio_equity,
            portfolio_peak_equity: peak,
            portfolio_drawdown: drawdown,
            last_tick_ts: Some(chrono::Utc::now()),
        };
        if let Err(e) = self.store.update_orchestrator(record).await {
            warn!(error = %e, "unified snapshot write failed");
        }
    }

    // ------------------------------------------------------------
    // Telemetry
    // ------------------------------------------------------------

    /// Full telemetry snapshot; available even while subsystems are
    /// degraded or stopped.
    pub async fn telemetry(&self) -> CoordinatorTelemetry {
        let mut symbols = HashMap::new();
        let mut portfolio_equity = Decimal::ZERO;
        for (symbol, scheduler) in &self.schedulers {
            portfolio_equity += scheduler.engine().equity();
            symbols.insert(
                symbol.clone(),
                SymbolTelemetry {
                    scheduler: scheduler.status().await,
                    risk: self.gate.engine().telemetry(symbol).await,
                },
            );
        }

        CoordinatorTelemetry {
            symbols,
            portfolio: PortfolioTelemetry {
                queue: self.queue.stats(),
                in_flight_count: self.in_flight_count(),
                loop_latency_ms: self.loop_latency_ms.load(Ordering::SeqCst),
                portfolio_equity,
                kill_switch: self.kill_switch.is_engaged(),
                global_risk_off: self.global_risk_off.load(Ordering::SeqCst),
            },
            breaker: self.gate.breaker().status().await,
        }
    }
}
