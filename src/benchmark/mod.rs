//! Cold-start benchmark harness.

pub mod cold_start;
pub mod log_watchers;
pub mod providers;

pub use cold_start::{
    find_existing_deployment, mean_run, run_fresh_cold_start, run_warm_cold_start, RunResult,
};
