//! Deterministic, pure logic shared by the harness.
//!
//! Core modules are free of I/O side effects. They operate on in-memory
//! descriptors and results and return deterministic outputs suitable for tests.

pub mod aggregate;
pub mod budget;
pub mod classifier;
pub mod descriptor;
pub mod filter;
pub mod result;
pub mod types;
