// src/errors.rs

//! Crate-wide error types.
//!
//! Internal propagation uses `anyhow` (re-exported here); the public build
//! entry returns the structured [`BuildError`] so callers can tell an
//! invalid request, a cooperative cancellation, and a real edge failure
//! apart. Invariant violations are not errors: they abort.

use std::sync::Arc;

pub use anyhow::{Error, Result};

use crate::graph::EdgeRef;

/// Terminal outcome of a failed [`build`](crate::Scheduler::build).
#[derive(Debug, Clone, thiserror::Error)]
pub enum BuildError {
    /// The edge factory does not recognize the requested descriptor.
    #[error("invalid request {0} for build")]
    InvalidRequest(EdgeRef),

    /// The caller canceled and the edge unwound cooperatively.
    #[error("build canceled")]
    Canceled,

    /// The edge produced an error; it traveled up the root pipe unchanged.
    #[error("edge failed: {0}")]
    Edge(Arc<anyhow::Error>),
}
