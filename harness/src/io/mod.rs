//! Side-effecting helpers: filesystem, child processes and the container runtime.

pub mod analysis;
pub mod config;
pub mod loader;
pub mod process;
pub mod render;
pub mod run_log;
pub mod runtime;
pub mod store;
