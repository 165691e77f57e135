//! Task Queue
//!
//! FIFO queue of orchestrator work items (train jobs, shutdown signals)
//! with at-least-once delivery. The queue itself is a plain FIFO; the
//! visibility-timeout retry bookkeeping lives in the coordinator's manager
//! loop, which exclusively owns the in-flight map.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

use crate::error::{ConductorError, Result};

/// Kind of work carried by a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Train,
    Shutdown,
    Custom,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Train => write!(f, "train"),
            TaskKind::Shutdown => write!(f, "shutdown"),
            TaskKind::Custom => write!(f, "custom"),
        }
    }
}

/// Generic task envelope.
///
/// A ticket is unique per task and appears in at most one of the queue and
/// the coordinator's in-flight map at any time. `attempts` only increases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub kind: TaskKind,
    pub payload: HashMap<String, String>,
    pub ticket: String,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

impl Task {
    pub fn new(kind: TaskKind, payload: HashMap<String, String>) -> Self {
        Self {
            ticket: format!("{kind}-{}", short_id()),
            kind,
            payload,
            attempts: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// Train job envelope with its job name and optional operator notes
    pub fn train(job: &str, notes: Option<&str>) -> Self {
        let mut payload = HashMap::new();
        payload.insert("job".to_string(), job.to_string());
        if let Some(n) = notes {
            payload.insert("notes".to_string(), n.to_string());
        }
        let mut task = Self::new(TaskKind::Train, payload);
        task.ticket = format!("train-{job}-{}", short_id());
        task
    }

    pub fn shutdown() -> Self {
        Self::new(TaskKind::Shutdown, HashMap::new())
    }
}

/// FIFO task queue shared between control surfaces and the manager loop.
///
/// Operations never block and never panic; the only hard rejection is an
/// `enqueue` after shutdown has begun.
pub struct TaskQueue {
    inner: Mutex<VecDeque<Task>>,
    shutting_down: AtomicBool,
    enqueued_total: AtomicU64,
    dequeued_total: AtomicU64,
    dropped_total: AtomicU64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            shutting_down: AtomicBool::new(false),
            enqueued_total: AtomicU64::new(0),
            dequeued_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
        }
    }

    /// Append a task to the tail.
    ///
    /// Rejected only once [`begin_shutdown`](Self::begin_shutdown) has been
    /// called; internal requeues go through [`requeue`](Self::requeue).
    pub fn enqueue(&self, task: Task) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ConductorError::ShuttingDown);
        }
        self.push(task);
        Ok(())
    }

    /// Re-admit a task the manager loop owns (retry or shutdown drain).
    ///
    /// Bypasses the shutdown gate so in-flight work is never lost to it.
    pub fn requeue(&self, task: Task) {
        self.push(task);
    }

    fn push(&self, task: Task) {
        debug!(ticket = %task.ticket, kind = %task.kind, attempts = task.attempts, "task enqueued");
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.push_back(task);
        self.enqueued_total.fetch_add(1, Ordering::SeqCst);
    }

    /// Pop the head without blocking.
    pub fn dequeue_nonblocking(&self) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let task = inner.pop_front();
        if task.is_some() {
            self.dequeued_total.fetch_add(1, Ordering::SeqCst);
        }
        task
    }

    /// Remove and return every queued task. Used on shutdown.
    pub fn drain(&self) -> Vec<Task> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.drain(..).collect()
    }

    /// Record a permanent drop for stats purposes.
    pub fn record_drop(&self) {
        self.dropped_total.fetch_add(1, Ordering::SeqCst);
    }

    /// Atomically stop admitting new work.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            current_size: self.len(),
            enqueued_total: self.enqueued_total.load(Ordering::SeqCst),
            dequeued_total: self.dequeued_total.load(Ordering::SeqCst),
            dropped_total: self.dropped_total.load(Ordering::SeqCst),
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub current_size: usize,
    pub enqueued_total: u64,
    pub dequeued_total: u64,
    pub dropped_total: u64,
}

impl std::fmt::Display for QueueStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Queue[{}, enq={}, deq={}, dropped={}]",
            self.current_size, self.enqueued_total, self.dequeued_total, self.dropped_total
        )
    }
}
