//! Per-run time budget shared by every blocking step of a run.

use std::time::{Duration, Instant};

use crate::error::RunError;

/// Wall-clock budget for one run, fixed when the run is dequeued.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.elapsed() >= self.budget
    }

    /// Time left before the deadline, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    /// Remaining budget for `step`, or `TimedOut` if nothing is left.
    pub fn remaining_for(&self, step: &'static str) -> Result<Duration, RunError> {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return Err(self.timed_out(step));
        }
        Ok(remaining)
    }

    pub fn timed_out(&self, step: &'static str) -> RunError {
        RunError::TimedOut {
            step,
            budget_secs: self.budget.as_secs(),
        }
    }
}
