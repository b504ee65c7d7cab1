// src/graph/edge.rs

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::engine::PipeFactory;
use crate::graph::keys::{CacheKey, SecondaryExport};
use crate::pipe::{Receiver, Sender};

/// Opaque vertex identity within the build graph.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct VertexId(Arc<str>);

impl VertexId {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        VertexId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Descriptor naming one edge of the graph: a vertex plus the index of the
/// output being requested. This is the currency callers and `unpark`
/// implementations use to refer to edges; the scheduler resolves it through
/// the [`EdgeFactory`](crate::graph::EdgeFactory).
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct EdgeRef {
    pub vertex: VertexId,
    pub output: u32,
}

impl EdgeRef {
    pub fn new(vertex: impl Into<Arc<str>>, output: u32) -> Self {
        EdgeRef {
            vertex: VertexId::new(vertex),
            output,
        }
    }
}

impl fmt::Display for EdgeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.vertex, self.output)
    }
}

/// How far a consumer wants the producing edge to advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum DesiredState {
    #[default]
    Initial,
    Complete,
}

/// Request payload carried by every inter-edge pipe.
#[derive(Debug, Clone, Copy, Default)]
pub struct EdgeRequest {
    pub desired: DesiredState,
}

impl EdgeRequest {
    /// Request full completion of the producing edge.
    pub fn complete() -> Self {
        EdgeRequest {
            desired: DesiredState::Complete,
        }
    }
}

/// Per-edge options the scheduler consults during merge.
#[derive(Debug, Clone, Copy, Default)]
pub struct EdgeOptions {
    /// The edge must re-execute regardless of cache state. A must-re-execute
    /// edge is never merged into a cache-honoring one.
    pub ignore_cache: bool,
}

/// Stable identity of a scheduled edge; key of the scheduler's pipe maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(u64);

static NEXT_EDGE_ID: AtomicU64 = AtomicU64::new(1);

pub type EdgeSender = Sender<EdgeRequest>;
pub type EdgeReceiver = Receiver<EdgeRequest>;

/// The advancement contract an edge implementation owes the scheduler.
///
/// The run loop is the sole caller of [`EdgeLogic::unpark`]; implementations
/// never see two concurrent invocations for the same edge. `unpark` must be
/// idempotent: re-invocation without new events yields no new outgoing
/// pipes and no new responses on incoming senders. It must also leave the
/// edge balanced: when it returns, the edge either has both pending incoming
/// and pending outgoing pipes or neither.
pub trait EdgeLogic: Send {
    /// Advance the edge state machine.
    ///
    /// - `edge` is the handle this logic is mounted on, for flag access. Do
    ///   not call back into the scheduler through it.
    /// - `inc` are the sender sides of all pending incoming requests.
    /// - `updates` are the outgoing receivers with fresh data this turn.
    /// - `all_out` are all outgoing receivers, fresh or not.
    /// - `pf` creates new input or function requests; pipes it creates take
    ///   effect in the next dispatch turn.
    fn unpark(
        &mut self,
        edge: &Edge,
        inc: &[EdgeSender],
        updates: &[EdgeReceiver],
        all_out: &[EdgeReceiver],
        pf: &mut PipeFactory<'_>,
    );

    /// The edge's current index key, once enough dependency keys are known
    /// for one to exist. Edges that can never merge return `None`.
    fn current_index_key(&self) -> Option<CacheKey> {
        None
    }

    /// Cache keys this edge would publish, collected when it is merged away
    /// so the survivor can publish them on its behalf.
    fn exported_keys(&self) -> Vec<SecondaryExport> {
        Vec::new()
    }

    /// Inherit export metadata from an edge merged into this one.
    fn absorb_exports(&mut self, _exports: Vec<SecondaryExport>) {}
}

/// Scheduler-facing handle of one edge: stable identity, descriptor,
/// options, the two scheduling flags, and the business logic behind the
/// [`EdgeLogic`] contract.
///
/// Edges are owned by the external edge factory and shared as `Arc<Edge>`;
/// the scheduler's maps key off [`EdgeId`].
pub struct Edge {
    id: EdgeId,
    reference: EdgeRef,
    options: EdgeOptions,
    // Flags are only written by the run loop and by `unpark` running on it,
    // so relaxed ordering is sufficient.
    has_active_outgoing: AtomicBool,
    keys_did_change: AtomicBool,
    pub(crate) logic: Mutex<Box<dyn EdgeLogic>>,
}

impl Edge {
    pub fn new(reference: EdgeRef, options: EdgeOptions, logic: Box<dyn EdgeLogic>) -> Arc<Self> {
        Arc::new(Edge {
            id: EdgeId(NEXT_EDGE_ID.fetch_add(1, Ordering::Relaxed)),
            reference,
            options,
            has_active_outgoing: AtomicBool::new(false),
            keys_did_change: AtomicBool::new(false),
            logic: Mutex::new(logic),
        })
    }

    pub fn id(&self) -> EdgeId {
        self.id
    }

    pub fn reference(&self) -> &EdgeRef {
        &self.reference
    }

    pub fn ignore_cache(&self) -> bool {
        self.options.ignore_cache
    }

    /// True while the edge had at least one non-completed outgoing pipe at
    /// the start of its latest dispatch turn.
    pub fn has_active_outgoing(&self) -> bool {
        self.has_active_outgoing.load(Ordering::Relaxed)
    }

    pub(crate) fn set_has_active_outgoing(&self, v: bool) {
        self.has_active_outgoing.store(v, Ordering::Relaxed);
    }

    /// Called by `unpark` implementations when the edge's key set changed;
    /// the scheduler re-checks the index for merge opportunities at the end
    /// of the dispatch turn, then clears the flag.
    pub fn mark_keys_changed(&self) {
        self.keys_did_change.store(true, Ordering::Relaxed);
    }

    pub fn keys_did_change(&self) -> bool {
        self.keys_did_change.load(Ordering::Relaxed)
    }

    pub(crate) fn clear_keys_changed(&self) {
        self.keys_did_change.store(false, Ordering::Relaxed);
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edge")
            .field("id", &self.id)
            .field("reference", &self.reference)
            .field("options", &self.options)
            .finish()
    }
}
