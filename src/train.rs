//! Training Collaborator Boundary
//!
//! Train jobs arrive through the task queue and are delegated to an
//! external [`TrainRunner`]. The call is blocking by contract and runs on
//! the blocking pool; the coordinator wraps it with the queue's
//! requeue-on-failure policy up to `max_attempts`.

/// External training collaborator
pub trait TrainRunner: Send + Sync {
    /// Execute one training job. Blocking; failures are retried by the
    /// coordinator up to the configured attempt budget.
    fn run(&self, job: &str, notes: Option<&str>) -> Result<(), String>;
}

/// Null-object runner: accepts every job and does nothing.
#[derive(Debug, Default)]
pub struct NullTrainRunner;

impl TrainRunner for NullTrainRunner {
    fn run(&self, _job: &str, _notes: Option<&str>) -> Result<(), String> {
        Ok(())
    }
}
