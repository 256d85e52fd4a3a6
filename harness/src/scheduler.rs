//! Bounded worker pool that drives runs to settled results.
//!
//! `C` scoped worker threads pull [`RunSpec`]s from a shared queue. Each
//! worker runs one spec at a time through a [`RunExecutor`], converts any
//! error or panic into a terminal result, writes it to the [`ResultStore`] and
//! only then reports it as settled. Completion order is unconstrained.
//!
//! A run identifier is executed at most once per store: specs repeating an
//! identifier, or naming one the store already holds, are refused before
//! dispatch so two workers never share an environment name.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, error, info, instrument, warn};

use crate::core::budget::Deadline;
use crate::core::result::{Outcome, RunResult};
use crate::core::types::{RunSpec, RunStatus};
use crate::error::StoreError;
use crate::isolation::{Execution, RunExecutor};
use crate::io::store::ResultStore;

/// Outcome of a full sweep.
#[derive(Debug, Default)]
pub struct SweepSummary {
    /// One result per dispatched spec, ordered by run identifier.
    pub results: Vec<RunResult>,
    /// Specs refused as duplicates and results the store failed to persist.
    pub store_errors: Vec<StoreError>,
}

impl SweepSummary {
    pub fn status_counts(&self) -> BTreeMap<RunStatus, usize> {
        let mut counts = BTreeMap::new();
        for result in &self.results {
            *counts.entry(result.status()).or_insert(0) += 1;
        }
        counts
    }

    /// Any run ended in `InfrastructureError` or `TimedOut`, or a result was not stored.
    pub fn has_harness_failures(&self) -> bool {
        !self.store_errors.is_empty()
            || self
                .results
                .iter()
                .any(|result| result.status().is_harness_failure())
    }
}

/// Per-invocation scheduler. Consumed by [`Scheduler::run`].
pub struct Scheduler<'a> {
    executor: &'a dyn RunExecutor,
    store: &'a ResultStore,
    max_parallel: usize,
    run_timeout: Duration,
    queue: Mutex<VecDeque<RunSpec>>,
    in_flight: AtomicUsize,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        executor: &'a dyn RunExecutor,
        store: &'a ResultStore,
        max_parallel: usize,
        run_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            store,
            max_parallel: max_parallel.max(1),
            run_timeout,
            queue: Mutex::new(VecDeque::new()),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Run every distinct spec exactly once and return one result per run.
    ///
    /// A spec whose run identifier repeats an earlier spec, or is already in
    /// the store, is not executed and shows up as
    /// [`StoreError::DuplicateRun`]. `on_settled` is called from worker
    /// threads after the result has been written to the store.
    #[instrument(skip_all, fields(runs = specs.len(), max_parallel = self.max_parallel))]
    pub fn run<F>(self, specs: Vec<RunSpec>, on_settled: F) -> SweepSummary
    where
        F: Fn(&RunResult) + Sync,
    {
        let mut summary = SweepSummary::default();
        let accepted = self.dedupe(specs, &mut summary.store_errors);
        let workers = self.max_parallel.min(accepted.len());
        lock(&self.queue).extend(accepted);
        info!(workers, "starting sweep");

        let settled = Mutex::new(summary);
        thread::scope(|scope| {
            for worker in 0..workers {
                let settled = &settled;
                let on_settled = &on_settled;
                let this = &self;
                scope.spawn(move || {
                    while let Some(spec) = this.next_spec() {
                        let result = this.run_one(worker, &spec);
                        match this.store.record(result.clone()) {
                            Ok(()) => on_settled(&result),
                            Err(err) => {
                                error!(run_id = %result.run_id, err = %err, "result not stored");
                                lock(settled).store_errors.push(err);
                            }
                        }
                        lock(settled).results.push(result);
                    }
                    debug!(worker, "worker drained");
                });
            }
        });

        let mut summary = settled.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        summary.results.sort_by(|left, right| left.run_id.cmp(&right.run_id));
        info!(results = summary.results.len(), counts = ?summary.status_counts(), "sweep finished");
        summary
    }

    fn dedupe(&self, specs: Vec<RunSpec>, refused: &mut Vec<StoreError>) -> Vec<RunSpec> {
        let mut seen = BTreeSet::new();
        let mut accepted = Vec::with_capacity(specs.len());
        for spec in specs {
            if self.store.contains(&spec.run_id) || !seen.insert(spec.run_id.clone()) {
                warn!(run_id = %spec.run_id, "duplicate run id not dispatched");
                refused.push(StoreError::DuplicateRun(spec.run_id));
                continue;
            }
            accepted.push(spec);
        }
        accepted
    }

    fn next_spec(&self) -> Option<RunSpec> {
        lock(&self.queue).pop_front()
    }

    fn run_one(&self, worker: usize, spec: &RunSpec) -> RunResult {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(worker, run_id = %spec.run_id, in_flight, "run dequeued");

        let started_at = Utc::now();
        let started = Instant::now();
        let deadline = Deadline::after(self.run_timeout);
        let execution = match catch_unwind(AssertUnwindSafe(|| {
            self.executor.execute(spec, &deadline)
        })) {
            Ok(Ok(execution)) => execution,
            Ok(Err(err)) => {
                let mut metadata = Map::new();
                metadata.insert("error_kind".to_string(), Value::from(err.kind()));
                Execution {
                    outcome: err.outcome(),
                    metadata,
                    logs: format!("{err:?}"),
                }
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(run_id = %spec.run_id, message = %message, "run panicked");
                let mut metadata = Map::new();
                metadata.insert("error_kind".to_string(), Value::from("panic"));
                Execution {
                    outcome: Outcome::InfrastructureError {
                        reason: format!("run panicked: {message}"),
                    },
                    metadata,
                    logs: String::new(),
                }
            }
        };
        let finished_at = Utc::now();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        RunResult {
            run_id: spec.run_id.clone(),
            agent: spec.agent.name.clone(),
            task: spec.task.name.clone(),
            trial: spec.trial,
            outcome: execution.outcome,
            metadata: execution.metadata,
            logs: execution.logs,
            started_at: started_at.to_rfc3339(),
            finished_at: finished_at.to_rfc3339(),
            duration_secs: started.elapsed().as_secs_f64(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::descriptor::Difficulty;
    use crate::core::result::Score;
    use crate::io::run_log::BatchPaths;
    use crate::test_support::{Behavior, ScriptedExecutor, agent, run_spec, task};

    fn store() -> (tempfile::TempDir, ResultStore) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ResultStore::create(BatchPaths::new(temp.path(), "batch")).expect("store");
        (temp, store)
    }

    fn specs(tasks: &[&str], agents: &[&str]) -> Vec<RunSpec> {
        let mut specs = Vec::new();
        for agent_name in agents {
            for task_name in tasks {
                specs.push(run_spec(agent(agent_name), task(task_name, Difficulty::Easy), 1));
            }
        }
        specs
    }

    #[test]
    fn every_spec_yields_exactly_one_result() {
        let (_temp, store) = store();
        let executor = ScriptedExecutor::new(Behavior::Score(100));
        let specs = specs(&["t1", "t2", "t3", "t4", "t5"], &["a", "b"]);
        let scheduler = Scheduler::new(&executor, &store, 3, Duration::from_secs(10));

        let summary = scheduler.run(specs, |_| {});
        assert_eq!(summary.results.len(), 10);
        assert_eq!(store.len(), 10);
        assert!(summary.store_errors.is_empty());
        assert!(!summary.has_harness_failures());
        assert!(executor.max_in_flight() <= 3);
        assert_eq!(executor.calls(), 10);
    }

    #[test]
    fn errors_and_panics_are_contained() {
        let (_temp, store) = store();
        let executor = ScriptedExecutor::new(Behavior::Score(90))
            .with_task("broken", Behavior::InfrastructureError)
            .with_task("crash", Behavior::Panic)
            .with_task("slow", Behavior::TimedOut);
        let specs = specs(&["ok", "broken", "crash", "slow"], &["a"]);
        let scheduler = Scheduler::new(&executor, &store, 2, Duration::from_secs(10));

        let summary = scheduler.run(specs, |_| {});
        let counts = summary.status_counts();
        assert_eq!(counts.get(&RunStatus::Completed), Some(&1));
        assert_eq!(counts.get(&RunStatus::InfrastructureError), Some(&2));
        assert_eq!(counts.get(&RunStatus::TimedOut), Some(&1));
        assert!(summary.has_harness_failures());

        let crash = summary
            .results
            .iter()
            .find(|result| result.task == "crash")
            .expect("crash result");
        assert_eq!(crash.metadata["error_kind"], "panic");
        assert!(crash.score().is_none());
    }

    #[test]
    fn settled_callback_sees_stored_results() {
        let (_temp, store) = store();
        let executor = ScriptedExecutor::new(Behavior::Score(87));
        let specs = specs(&["t1", "t2"], &["a"]);
        let seen = Mutex::new(Vec::new());
        let scheduler = Scheduler::new(&executor, &store, 2, Duration::from_secs(10));

        scheduler.run(specs, |result| {
            assert!(store.contains(&result.run_id));
            lock(&seen).push(result.score());
        });
        let seen = seen.into_inner().expect("seen");
        assert_eq!(seen, vec![Score::new(87), Score::new(87)]);
    }

    #[test]
    fn duplicate_run_id_is_reported_not_fatal() {
        let (_temp, store) = store();
        let executor = ScriptedExecutor::new(Behavior::Score(50));
        let spec = run_spec(agent("a"), task("t", Difficulty::Easy), 1);
        let scheduler = Scheduler::new(&executor, &store, 2, Duration::from_secs(10));

        let summary = scheduler.run(vec![spec.clone(), spec.clone()], |_| {});
        assert_eq!(executor.calls(), 1);
        assert_eq!(summary.results.len(), 1);
        assert!(matches!(
            summary.store_errors.as_slice(),
            [StoreError::DuplicateRun(run_id)] if run_id == &spec.run_id
        ));
        assert_eq!(store.len(), 1);
        assert!(summary.has_harness_failures());
    }

    #[test]
    fn stored_run_id_is_not_executed_again() {
        let (_temp, store) = store();
        let spec = run_spec(agent("a"), task("t", Difficulty::Easy), 1);
        let first = ScriptedExecutor::new(Behavior::Score(40));
        Scheduler::new(&first, &store, 1, Duration::from_secs(10)).run(vec![spec.clone()], |_| {});

        let second = ScriptedExecutor::new(Behavior::Score(100));
        let summary =
            Scheduler::new(&second, &store, 1, Duration::from_secs(10)).run(vec![spec.clone()], |_| {});
        assert_eq!(second.calls(), 0);
        assert!(summary.results.is_empty());
        assert_eq!(summary.store_errors.len(), 1);
        let stored = store.get(&spec.run_id).expect("stored");
        assert_eq!(stored.score(), Score::new(40));
    }

    #[test]
    fn test_failures_are_not_harness_failures() {
        let (_temp, store) = store();
        let executor = ScriptedExecutor::new(Behavior::Score(100)).with_task("strict", Behavior::TestFailed);
        let specs = specs(&["strict", "ok"], &["a"]);

        let summary = Scheduler::new(&executor, &store, 2, Duration::from_secs(10)).run(specs, |_| {});
        let counts = summary.status_counts();
        assert_eq!(counts.get(&RunStatus::TestFailed), Some(&1));
        assert_eq!(counts.get(&RunStatus::Completed), Some(&1));
        assert!(!summary.has_harness_failures());
        let strict = store
            .snapshot()
            .into_iter()
            .find(|result| result.task == "strict")
            .expect("strict result");
        assert!(strict.score().is_none());
    }

    #[test]
    fn hung_run_does_not_starve_the_pool() {
        let (_temp, store) = store();
        let executor = ScriptedExecutor::new(Behavior::Score(100))
            .with_task("hang", Behavior::SleepPastDeadline);
        let specs = specs(&["hang", "t1", "t2", "t3"], &["a"]);
        let scheduler = Scheduler::new(&executor, &store, 2, Duration::from_millis(200));

        let started = Instant::now();
        let summary = scheduler.run(specs, |_| {});
        assert!(started.elapsed() < Duration::from_secs(5));
        let hang = summary
            .results
            .iter()
            .find(|result| result.task == "hang")
            .expect("hang result");
        assert_eq!(hang.status(), RunStatus::TimedOut);
        assert_eq!(summary.results.len(), 4);
    }

    #[test]
    fn empty_sweep_is_fine() {
        let (_temp, store) = store();
        let executor = ScriptedExecutor::new(Behavior::Score(100));
        let summary = Scheduler::new(&executor, &store, 2, Duration::from_secs(1)).run(Vec::new(), |_| {});
        assert!(summary.results.is_empty());
        assert!(!summary.has_harness_failures());
    }
}
