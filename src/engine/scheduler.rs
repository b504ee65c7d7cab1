// src/engine/scheduler.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::engine::queue::DispatchQueue;
use crate::errors::BuildError;
use crate::graph::{
    Edge, EdgeFactory, EdgeId, EdgeReceiver, EdgeRef, EdgeRequest, KeyIndex,
};
use crate::pipe::{Pipe, PipeFunc, SharedValue};

/// An inter-party pipe plus the edges on its two ends.
///
/// `target` is the producer (consumer-side requests flow towards it), `from`
/// the consumer. Either may be absent: root pipes synthesized by `build`
/// have no `from`; function pipes have no `target`. The ends mutex guards
/// rewrites during merges; completion callbacks read the current ends under
/// it before signaling.
pub(crate) struct EdgePipe {
    pipe: Pipe<EdgeRequest>,
    ends: Mutex<PipeEnds>,
}

struct PipeEnds {
    target: Option<Arc<Edge>>,
    from: Option<Arc<Edge>>,
}

#[derive(Default)]
struct GraphState {
    /// Pending pipes whose `target` is the keyed edge, in creation order.
    incoming: HashMap<EdgeId, Vec<Arc<EdgePipe>>>,
    /// Pending pipes whose `from` is the keyed edge, in creation order.
    outgoing: HashMap<EdgeId, Vec<Arc<EdgePipe>>>,
}

struct Inner {
    factory: Box<dyn EdgeFactory>,
    index: KeyIndex,

    /// Main mutex: guards the pipe maps and is held for entire dispatch
    /// turns. Never taken from pipe callbacks.
    graph: Mutex<GraphState>,
    /// Queue mutex: guards the dispatcher FIFO; cheap to take from any
    /// thread.
    queue: Mutex<DispatchQueue>,
    wake: Notify,

    stopped: CancellationToken,
    closed: CancellationToken,
}

/// The graph-rewriting job scheduler.
///
/// Owns a single run-loop task that serializes all `unpark` invocations and
/// all mutations of the pipe maps. Everything else (build callers, async
/// work functions, pipe completion callbacks) interacts with it only
/// through the signal path.
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler over the given edge factory and start its run
    /// loop. Must be called within a tokio runtime.
    pub fn new(factory: impl EdgeFactory + 'static) -> Self {
        let inner = Arc::new(Inner {
            factory: Box::new(factory),
            index: KeyIndex::new(),
            graph: Mutex::new(GraphState::default()),
            queue: Mutex::new(DispatchQueue::new()),
            wake: Notify::new(),
            stopped: CancellationToken::new(),
            closed: CancellationToken::new(),
        });
        tokio::spawn(Inner::run_loop(inner.clone()));
        Scheduler { inner }
    }

    /// Evaluate the edge named by `reference` into a result.
    ///
    /// Synthesizes a root request pipe into the edge and waits for its
    /// terminal state. `ctx` cancellation is forwarded as a receiver cancel;
    /// the edge is expected to unwind cooperatively, after which this
    /// returns [`BuildError::Canceled`].
    pub async fn build(
        &self,
        ctx: CancellationToken,
        reference: &EdgeRef,
    ) -> Result<SharedValue, BuildError> {
        self.inner.clone().build(ctx, reference).await
    }

    /// Request shutdown and wait for the run loop to exit. Idempotent;
    /// after this returns no further dispatch occurs.
    pub async fn stop(&self) {
        self.inner.stopped.cancel();
        self.inner.closed.cancelled().await;
    }

    /// Number of edges that currently have open incoming / outgoing pipes.
    /// Diagnostics surface; a quiescent scheduler reports `(0, 0)`.
    pub fn open_edge_counts(&self) -> (usize, usize) {
        let graph = self.inner.graph.lock().unwrap();
        (graph.incoming.len(), graph.outgoing.len())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Let the run-loop task exit; a dropped scheduler cannot be stopped
        // explicitly anymore.
        self.inner.stopped.cancel();
    }
}

impl Inner {
    async fn run_loop(this: Arc<Inner>) {
        debug!("scheduler run loop started");
        loop {
            if this.stopped.is_cancelled() {
                break;
            }
            let next = this.queue.lock().unwrap().pop();
            let edge = match next {
                Some(edge) => edge,
                None => {
                    tokio::select! {
                        _ = this.wake.notified() => {}
                        _ = this.stopped.cancelled() => break,
                    }
                    continue;
                }
            };
            let mut graph = this.graph.lock().unwrap();
            this.dispatch(&mut graph, &edge);
        }
        debug!("scheduler run loop exiting");
        this.closed.cancel();
    }

    /// Enqueue an edge for a dispatch turn. Cheap and safe from any
    /// context; signals for an already-queued edge coalesce.
    fn signal(&self, edge: &Arc<Edge>) {
        let fresh = self.queue.lock().unwrap().push(edge);
        if fresh {
            self.wake.notify_one();
        }
    }

    /// One dispatch turn for `edge`, under the main mutex.
    fn dispatch(self: &Arc<Self>, graph: &mut GraphState, edge: &Arc<Edge>) {
        let inc: Vec<_> = graph
            .incoming
            .get(&edge.id())
            .map(|pipes| pipes.iter().map(|p| p.pipe.sender.clone()).collect())
            .unwrap_or_default();
        let all_out: Vec<_> = graph
            .outgoing
            .get(&edge.id())
            .map(|pipes| pipes.iter().map(|p| p.pipe.receiver.clone()).collect())
            .unwrap_or_default();

        edge.set_has_active_outgoing(false);
        let mut updates = Vec::new();
        for receiver in &all_out {
            if receiver.receive() {
                updates.push(receiver.clone());
            }
            if !receiver.status().completed {
                edge.set_has_active_outgoing(true);
            }
        }

        trace!(
            edge = %edge.reference(),
            requests = inc.len(),
            updates = updates.len(),
            outgoing = all_out.len(),
            "unpark"
        );
        {
            let mut logic = edge.logic.lock().unwrap();
            let mut factory = PipeFactory {
                inner: self,
                graph: &mut *graph,
                edge,
            };
            logic.unpark(edge, &inc, &updates, &all_out, &mut factory);
        }
        trace!(edge = %edge.reference(), "unpark returned");

        // Keep only requests that didn't complete / were added by this turn.
        let open_incoming = prune(&mut graph.incoming, edge.id(), |pipe| {
            !pipe.pipe.sender.status().completed
        });
        let open_outgoing = prune(&mut graph.outgoing, edge.id(), |pipe| {
            !pipe.pipe.receiver.status().completed
        });

        // A changed key set may open a merge opportunity with another edge.
        if edge.keys_did_change() {
            let key = edge.logic.lock().unwrap().current_index_key();
            if let Some(key) = key {
                if let Some(orig) = self.index.load_or_store(&key, edge) {
                    debug!(
                        src = %edge.reference(),
                        target = %orig.reference(),
                        key = %key,
                        "merging edges with matching index key"
                    );
                    if self.merge_to(graph, &orig, edge) {
                        self.factory.set_edge(edge.reference().clone(), orig);
                    }
                }
            }
            edge.clear_keys_changed();
        }

        // Validation to avoid deadlocks and resource leaks. These can only
        // appear from algorithm bugs in unpark implementations, never from
        // external input.
        if open_incoming > 0 && open_outgoing == 0 {
            panic!(
                "invalid dispatch: edge {} returned leaving incoming open with no outgoing work",
                edge.reference()
            );
        }
        if open_incoming == 0 && open_outgoing > 0 {
            panic!(
                "invalid dispatch: edge {} returned leaving outgoing open with no incoming interest",
                edge.reference()
            );
        }
    }

    /// Create a request pipe between two edges (or from the outside world
    /// when `from` is absent) and register it in the pipe maps. Completion
    /// callbacks re-read the pipe's current ends, so merges rewiring them
    /// redirect future signals as well.
    fn new_pipe(
        self: &Arc<Self>,
        graph: &mut GraphState,
        target: &Arc<Edge>,
        from: Option<&Arc<Edge>>,
        request: EdgeRequest,
    ) -> Arc<EdgePipe> {
        let edge_pipe = Arc::new(EdgePipe {
            pipe: Pipe::new(request),
            ends: Mutex::new(PipeEnds {
                target: Some(target.clone()),
                from: from.cloned(),
            }),
        });

        self.signal(target);

        let weak_inner = Arc::downgrade(self);
        let weak_pipe = Arc::downgrade(&edge_pipe);
        if let Some(from) = from {
            edge_pipe.pipe.on_send_completion({
                let weak_inner = weak_inner.clone();
                let weak_pipe = weak_pipe.clone();
                move || {
                    if let (Some(inner), Some(pipe)) = (weak_inner.upgrade(), weak_pipe.upgrade()) {
                        let from = pipe.ends.lock().unwrap().from.clone();
                        if let Some(from) = from {
                            inner.signal(&from);
                        }
                    }
                }
            });
            graph
                .outgoing
                .entry(from.id())
                .or_default()
                .push(edge_pipe.clone());
        }
        graph
            .incoming
            .entry(target.id())
            .or_default()
            .push(edge_pipe.clone());
        edge_pipe.pipe.on_receive_completion(move || {
            if let (Some(inner), Some(pipe)) = (weak_inner.upgrade(), weak_pipe.upgrade()) {
                let target = pipe.ends.lock().unwrap().target.clone();
                if let Some(target) = target {
                    inner.signal(&target);
                }
            }
        });
        edge_pipe
    }

    /// Create a pipe wrapping an async work function owned by `edge` and
    /// launch the function on the runtime. Outgoing-only: the function is
    /// not another edge.
    fn new_func_request(
        self: &Arc<Self>,
        graph: &mut GraphState,
        edge: &Arc<Edge>,
        f: PipeFunc,
    ) -> EdgeReceiver {
        let (pipe, start) = Pipe::with_function(f);
        let edge_pipe = Arc::new(EdgePipe {
            pipe,
            ends: Mutex::new(PipeEnds {
                target: None,
                from: Some(edge.clone()),
            }),
        });
        let weak_inner = Arc::downgrade(self);
        let weak_pipe = Arc::downgrade(&edge_pipe);
        edge_pipe.pipe.on_send_completion(move || {
            if let (Some(inner), Some(pipe)) = (weak_inner.upgrade(), weak_pipe.upgrade()) {
                let from = pipe.ends.lock().unwrap().from.clone();
                if let Some(from) = from {
                    inner.signal(&from);
                }
            }
        });
        graph
            .outgoing
            .entry(edge.id())
            .or_default()
            .push(edge_pipe.clone());
        tokio::spawn(start);
        edge_pipe.pipe.receiver.clone()
    }

    /// Merge the state of `src` into `target`; `src` is retired. Returns
    /// false when the merge would weaken `target`'s contract.
    fn merge_to(&self, graph: &mut GraphState, target: &Arc<Edge>, src: &Arc<Edge>) -> bool {
        // Merging a must-re-execute edge into a cache-honoring one would
        // violate the stronger edge's contract.
        if !target.ignore_cache() && src.ignore_cache() {
            return false;
        }

        for pipe in graph.incoming.remove(&src.id()).unwrap_or_default() {
            pipe.ends.lock().unwrap().target = Some(target.clone());
            graph
                .incoming
                .entry(target.id())
                .or_default()
                .push(pipe);
        }

        for pipe in graph.outgoing.remove(&src.id()).unwrap_or_default() {
            pipe.ends.lock().unwrap().from = Some(target.clone());
            graph
                .outgoing
                .entry(target.id())
                .or_default()
                .push(pipe.clone());
            // Dependencies are satisfied through the survivor's state now;
            // the retired edge's outstanding requests are no longer needed.
            pipe.pipe.receiver.cancel();
        }

        self.signal(target);

        let exports = src.logic.lock().unwrap().exported_keys();
        if !exports.is_empty() {
            target.logic.lock().unwrap().absorb_exports(exports);
        }

        true
    }

    async fn build(
        self: Arc<Self>,
        ctx: CancellationToken,
        reference: &EdgeRef,
    ) -> Result<SharedValue, BuildError> {
        let done = Arc::new(Notify::new());
        let receiver = {
            let mut graph = self.graph.lock().unwrap();
            let edge = match self.factory.get_edge(reference) {
                Some(edge) => edge,
                None => return Err(BuildError::InvalidRequest(reference.clone())),
            };
            let root = self.new_pipe(&mut graph, &edge, None, EdgeRequest::complete());
            let receiver = root.pipe.receiver.clone();
            root.pipe.on_send_completion({
                let receiver = receiver.clone();
                let done = done.clone();
                move || {
                    receiver.receive();
                    if receiver.status().completed {
                        done.notify_one();
                    }
                }
            });
            receiver
        };

        let cancel_watch = tokio::spawn({
            let ctx = ctx.clone();
            let receiver = receiver.clone();
            async move {
                ctx.cancelled().await;
                receiver.cancel();
            }
        });

        loop {
            if receiver.status().completed {
                break;
            }
            done.notified().await;
        }
        cancel_watch.abort();

        let status = receiver.status();
        if status.canceled {
            return Err(BuildError::Canceled);
        }
        if let Some(err) = status.err {
            return Err(BuildError::Edge(err));
        }
        match status.value {
            Some(value) => Ok(value),
            None => Err(BuildError::Edge(Arc::new(anyhow::anyhow!(
                "edge completed without a result value"
            )))),
        }
    }
}

/// Rebuild one map entry keeping only pipes for which `keep` holds; drop
/// the entry entirely when nothing remains. Returns the number kept.
fn prune(
    map: &mut HashMap<EdgeId, Vec<Arc<EdgePipe>>>,
    id: EdgeId,
    keep: impl Fn(&Arc<EdgePipe>) -> bool,
) -> usize {
    let Some(pipes) = map.remove(&id) else {
        return 0;
    };
    let open: Vec<_> = pipes.into_iter().filter(keep).collect();
    let count = open.len();
    if count > 0 {
        map.insert(id, open);
    }
    count
}

/// Interface an edge uses during `unpark` to open new requests. Created
/// fresh for each dispatch turn; registrations are atomic with the turn
/// because the factory borrows the locked graph state.
pub struct PipeFactory<'a> {
    inner: &'a Arc<Inner>,
    graph: &'a mut GraphState,
    edge: &'a Arc<Edge>,
}

impl PipeFactory<'_> {
    /// Open a request pipe towards the edge named by `target`. The target
    /// is signaled; the returned receiver carries its responses starting
    /// with the next dispatch turn.
    ///
    /// Panics if the factory does not know `target`: descriptors supplied
    /// by `unpark` must come from the shared graph, so an unknown one is a
    /// bug in the edge implementation.
    pub fn new_input_request(&mut self, target: &EdgeRef, request: EdgeRequest) -> EdgeReceiver {
        let resolved = match self.inner.factory.get_edge(target) {
            Some(edge) => edge,
            None => panic!("edge factory returned no edge for {target}"),
        };
        trace!(from = %self.edge.reference(), to = %target, "new input request");
        let pipe = self
            .inner
            .new_pipe(self.graph, &resolved, Some(self.edge), request);
        pipe.pipe.receiver.clone()
    }

    /// Launch async work `f` on a worker task, wired back to this edge
    /// through a pipe. The edge is signaled when the function finishes.
    pub fn new_func_request(&mut self, f: PipeFunc) -> EdgeReceiver {
        trace!(edge = %self.edge.reference(), "new function request");
        self.inner.new_func_request(self.graph, self.edge, f)
    }
}
