// src/engine/queue.rs

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::graph::{Edge, EdgeId};

/// FIFO of edges waiting for a dispatch turn, with presence-set
/// deduplication.
///
/// Semantics:
/// - An edge may be signaled arbitrarily many times while already queued;
///   all of those collapse into the single queued entry, so the edge gets
///   exactly one dispatch turn for the whole burst.
/// - Among distinct edges, dispatch order is arrival order. There is no
///   priority.
///
/// All operations are O(1). The queue carries no locking of its own; the
/// scheduler guards it with its queue mutex so `push` stays cheap and safe
/// from any thread (pipe callbacks fire from wherever the transition
/// happened).
#[derive(Default)]
pub struct DispatchQueue {
    queued: HashSet<EdgeId>,
    order: VecDeque<Arc<Edge>>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Enqueue `edge` unless it is already waiting. Returns whether the
    /// edge was newly added (callers only wake the run loop for fresh
    /// entries).
    pub fn push(&mut self, edge: &Arc<Edge>) -> bool {
        if !self.queued.insert(edge.id()) {
            return false;
        }
        self.order.push_back(edge.clone());
        true
    }

    /// Remove and return the edge that has waited longest.
    pub fn pop(&mut self) -> Option<Arc<Edge>> {
        let edge = self.order.pop_front()?;
        self.queued.remove(&edge.id());
        Some(edge)
    }
}
