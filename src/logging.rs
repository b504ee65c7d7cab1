// src/logging.rs

//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the log filter:
//! 1. `SOLVEDAG_LOG` environment variable (full `EnvFilter` syntax, e.g.
//!    "debug" or "solvedag::engine=trace")
//! 2. default to `info`
//!
//! Dispatch-level scheduler events (per-turn unpark snapshots, pipe
//! creation) are emitted at `trace`; merges and lifecycle at `debug`.

use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the global logging subscriber.
///
/// Safe to call once at startup; a second call panics inside
/// `tracing-subscriber`, so embedders that install their own subscriber
/// should skip this.
pub fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_env("SOLVEDAG_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();

    Ok(())
}
