//! Benchmark harness for coding agents.
//!
//! Every selected (agent, task) pair is run one or more times, each run in a
//! fresh single-use container, and scored by the task's own test script. The
//! crate keeps a strict split:
//!
//! - **[`core`]**: pure logic (descriptors, filtering, result classification,
//!   aggregation). No I/O.
//! - **[`io`]**: side effects (descriptor loading, subprocesses, the container
//!   runtime, the on-disk result store, analysis).
//!
//! Orchestration modules ([`plan`], [`isolation`], [`scheduler`], [`report`])
//! combine the two to implement the `bench` commands.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod isolation;
pub mod logging;
pub mod plan;
pub mod report;
pub mod scheduler;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
