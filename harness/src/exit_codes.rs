//! Stable exit codes for `bench` commands.

/// Every run reached `completed` or `test_failed`, or there was nothing to run.
pub const OK: i32 = 0;
/// Failed before scheduling: bad filter, descriptor, config or batch directory.
pub const INVALID: i32 = 1;
/// At least one run ended `infrastructure_error` or `timed_out`, or a cleanup
/// removal failed.
pub const RUN_FAILURES: i32 = 2;
