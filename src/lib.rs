// src/lib.rs

//! solvedag: a graph-rewriting job scheduler.
//!
//! The scheduler drives a directed acyclic computation of build *edges*
//! toward completion. Each edge is a unit of work; the scheduler progresses
//! it by requesting results from its dependencies, delivering updates to
//! upstream consumers, launching async work functions, and opportunistically
//! merging two edges that prove equivalent (same computed cache key) into
//! one.
//!
//! Layering:
//! - [`pipe`] holds the request/response fabric between edges and between
//!   an edge and its async work functions.
//! - [`graph`] holds the contracts the scheduler demands of edges: the
//!   [`EdgeLogic`](graph::EdgeLogic) advancement routine ("unpark"), the
//!   [`EdgeFactory`](graph::EdgeFactory) resolution capability, and the
//!   cache-key registry used for merging.
//! - [`engine`] holds the dispatcher queue, the run loop, the dispatch
//!   step, the merge protocol, and the public [`Scheduler`] API.
//!
//! Edge business logic (cache-key computation, execution, dependency
//! bookkeeping) lives outside this crate, behind the `graph` seams.

pub mod engine;
pub mod errors;
pub mod graph;
pub mod logging;
pub mod pipe;

pub use engine::{PipeFactory, Scheduler};
pub use errors::BuildError;
pub use graph::{
    CacheKey, CacheKeyWithSelector, DesiredState, Edge, EdgeFactory, EdgeId, EdgeLogic,
    EdgeOptions, EdgeReceiver, EdgeRef, EdgeRequest, EdgeSender, SecondaryExport, VertexId,
};
pub use pipe::{Pipe, PipeFunc, SharedValue, Status};
