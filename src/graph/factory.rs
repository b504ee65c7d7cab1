// src/graph/factory.rs

use std::sync::Arc;

use crate::graph::edge::{Edge, EdgeRef};

/// Access to the edges of a shared build graph.
///
/// The scheduler consumes this capability; it never owns edges. Resolution
/// must be stable while a build is in flight, except for redirects installed
/// through [`EdgeFactory::set_edge`] after a merge.
pub trait EdgeFactory: Send + Sync {
    /// Resolve a descriptor to its live edge, if the graph knows it.
    fn get_edge(&self, reference: &EdgeRef) -> Option<Arc<Edge>>;

    /// Install a merge redirect: future lookups of `reference` resolve to
    /// `edge` (the merge survivor).
    fn set_edge(&self, reference: EdgeRef, edge: Arc<Edge>);
}
