#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{sleep, timeout};
use tracing_subscriber::{fmt, EnvFilter};

use solvedag::graph::{
    CacheKey, CacheKeyWithSelector, Edge, EdgeFactory, EdgeLogic, EdgeOptions, EdgeReceiver,
    EdgeRef, EdgeRequest, SecondaryExport,
};
use solvedag::pipe::SharedValue;
use solvedag::PipeFactory;

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - Enable levels with e.g. `RUST_LOG=trace cargo test -- --nocapture`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Poll `cond` until it holds or a 5s deadline passes.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        loop {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Downcast a build result to the `String` payload used by the test edges.
pub fn as_string(value: &SharedValue) -> String {
    value
        .clone()
        .downcast::<String>()
        .expect("test edges produce String values")
        .as_ref()
        .clone()
}

/// Shared in-memory edge graph backing the scheduler's `EdgeFactory`
/// capability in tests. Cloning shares the underlying map, so tests keep a
/// handle for registrations while the scheduler owns another.
#[derive(Clone, Default)]
pub struct TestGraph {
    edges: Arc<Mutex<HashMap<EdgeRef, Arc<Edge>>>>,
}

impl TestGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, edge: Arc<Edge>) {
        self.edges
            .lock()
            .unwrap()
            .insert(edge.reference().clone(), edge);
    }
}

impl EdgeFactory for TestGraph {
    fn get_edge(&self, reference: &EdgeRef) -> Option<Arc<Edge>> {
        self.edges.lock().unwrap().get(reference).cloned()
    }

    fn set_edge(&self, reference: EdgeRef, edge: Arc<Edge>) {
        self.edges.lock().unwrap().insert(reference, edge);
    }
}

/// Leaf edge: completes every incoming request immediately with a fixed
/// value (or a canceled status when the request was canceled).
pub struct LeafLogic {
    value: SharedValue,
    unparks: Arc<AtomicUsize>,
}

impl EdgeLogic for LeafLogic {
    fn unpark(
        &mut self,
        _edge: &Edge,
        inc: &[solvedag::EdgeSender],
        _updates: &[EdgeReceiver],
        _all_out: &[EdgeReceiver],
        _pf: &mut PipeFactory<'_>,
    ) {
        self.unparks.fetch_add(1, Ordering::SeqCst);
        for sender in inc {
            if sender.status().completed {
                continue;
            }
            if sender.request().canceled {
                sender.finalize_canceled();
            } else {
                sender.finalize(Ok(self.value.clone()));
            }
        }
    }
}

pub fn leaf_edge(name: &str, value: SharedValue) -> (Arc<Edge>, Arc<AtomicUsize>) {
    let unparks = Arc::new(AtomicUsize::new(0));
    let edge = Edge::new(
        EdgeRef::new(name, 0),
        EdgeOptions::default(),
        Box::new(LeafLogic {
            value,
            unparks: unparks.clone(),
        }),
    );
    (edge, unparks)
}

/// Leaf edge that fails every request.
pub struct FailingLogic {
    message: String,
}

impl EdgeLogic for FailingLogic {
    fn unpark(
        &mut self,
        _edge: &Edge,
        inc: &[solvedag::EdgeSender],
        _updates: &[EdgeReceiver],
        _all_out: &[EdgeReceiver],
        _pf: &mut PipeFactory<'_>,
    ) {
        for sender in inc {
            if !sender.status().completed {
                sender.finalize(Err(anyhow::anyhow!("{}", self.message)));
            }
        }
    }
}

pub fn failing_edge(name: &str, message: &str) -> Arc<Edge> {
    Edge::new(
        EdgeRef::new(name, 0),
        EdgeOptions::default(),
        Box::new(FailingLogic {
            message: message.to_string(),
        }),
    )
}

/// Edge with one dependency: requests it to completion and answers its own
/// consumers with `"<dep value>+<suffix>"`.
pub struct ChainLogic {
    dep: EdgeRef,
    suffix: String,
    req: Option<EdgeReceiver>,
    unparks: Arc<AtomicUsize>,
}

impl EdgeLogic for ChainLogic {
    fn unpark(
        &mut self,
        _edge: &Edge,
        inc: &[solvedag::EdgeSender],
        _updates: &[EdgeReceiver],
        _all_out: &[EdgeReceiver],
        pf: &mut PipeFactory<'_>,
    ) {
        self.unparks.fetch_add(1, Ordering::SeqCst);

        let pending: Vec<_> = inc.iter().filter(|s| !s.status().completed).collect();
        if pending.is_empty() {
            return;
        }
        let all_canceled = pending.iter().all(|s| s.request().canceled);

        let req = match &self.req {
            Some(req) => req.clone(),
            None => {
                if all_canceled {
                    for sender in &pending {
                        sender.finalize_canceled();
                    }
                    return;
                }
                let req = pf.new_input_request(&self.dep, EdgeRequest::complete());
                self.req = Some(req);
                return;
            }
        };

        let status = req.status();
        if !status.completed {
            if all_canceled {
                // Keep our own requests open until the dependency unwinds.
                req.cancel();
            }
            return;
        }

        for sender in pending {
            if all_canceled || status.canceled {
                sender.finalize_canceled();
            } else if let Some(err) = &status.err {
                sender.finalize(Err(anyhow::anyhow!("dependency failed: {err}")));
            } else {
                let dep_value = status
                    .value
                    .clone()
                    .and_then(|v| v.downcast::<String>().ok());
                match dep_value {
                    Some(v) => sender.finalize(Ok(
                        Arc::new(format!("{v}+{}", self.suffix)) as SharedValue
                    )),
                    None => sender.finalize(Err(anyhow::anyhow!("dependency produced no value"))),
                }
            }
        }
    }
}

pub fn chain_edge(name: &str, dep: &EdgeRef, suffix: &str) -> (Arc<Edge>, Arc<AtomicUsize>) {
    let unparks = Arc::new(AtomicUsize::new(0));
    let edge = Edge::new(
        EdgeRef::new(name, 0),
        EdgeOptions::default(),
        Box::new(ChainLogic {
            dep: dep.clone(),
            suffix: suffix.to_string(),
            req: None,
            unparks: unparks.clone(),
        }),
    );
    (edge, unparks)
}

/// Handles for controlling and observing a [`FuncWorkLogic`] edge.
pub struct FuncEdge {
    pub edge: Arc<Edge>,
    /// Lets the async work function complete with the edge's value.
    pub trigger: Arc<Notify>,
    /// Set when the work function observed cancellation.
    pub func_canceled: Arc<AtomicBool>,
    pub unparks: Arc<AtomicUsize>,
    /// Exports absorbed from edges merged into this one.
    pub absorbed: Arc<Mutex<Vec<SecondaryExport>>>,
}

/// Edge whose work is an async function that completes when its trigger is
/// notified. Optionally publishes an index key after starting work, which
/// makes it a merge candidate.
pub struct FuncWorkLogic {
    value: String,
    trigger: Arc<Notify>,
    key: Option<CacheKey>,
    func_canceled: Arc<AtomicBool>,
    req: Option<EdgeReceiver>,
    unparks: Arc<AtomicUsize>,
    absorbed: Arc<Mutex<Vec<SecondaryExport>>>,
}

impl EdgeLogic for FuncWorkLogic {
    fn unpark(
        &mut self,
        edge: &Edge,
        inc: &[solvedag::EdgeSender],
        _updates: &[EdgeReceiver],
        _all_out: &[EdgeReceiver],
        pf: &mut PipeFactory<'_>,
    ) {
        self.unparks.fetch_add(1, Ordering::SeqCst);

        let pending: Vec<_> = inc.iter().filter(|s| !s.status().completed).collect();
        if pending.is_empty() && self.req.is_none() {
            return;
        }

        if self.req.is_none() {
            // Canceled before any work started: answer without launching.
            if pending.iter().all(|s| s.request().canceled) {
                for sender in &pending {
                    sender.finalize_canceled();
                }
                return;
            }
            let trigger = self.trigger.clone();
            let value = self.value.clone();
            let canceled = self.func_canceled.clone();
            self.req = Some(pf.new_func_request(Box::new(move |token| {
                Box::pin(async move {
                    tokio::select! {
                        _ = trigger.notified() => Ok(Arc::new(value) as SharedValue),
                        _ = token.cancelled() => {
                            canceled.store(true, Ordering::SeqCst);
                            Err(anyhow::anyhow!("work canceled"))
                        }
                    }
                })
            })));
            if self.key.is_some() {
                edge.mark_keys_changed();
            }
            return;
        }

        let req = self.req.clone().expect("request created above");
        let status = req.status();
        let all_canceled = !pending.is_empty() && pending.iter().all(|s| s.request().canceled);

        if !status.completed {
            if all_canceled {
                req.cancel();
            }
            return;
        }

        for sender in pending {
            if status.canceled || all_canceled {
                sender.finalize_canceled();
            } else if let Some(err) = &status.err {
                sender.finalize(Err(anyhow::anyhow!("work failed: {err}")));
            } else {
                let value = status.value.clone().expect("completed work carries a value");
                sender.finalize(Ok(value));
            }
        }
    }

    fn current_index_key(&self) -> Option<CacheKey> {
        self.key.clone()
    }

    fn exported_keys(&self) -> Vec<SecondaryExport> {
        self.key
            .iter()
            .map(|key| SecondaryExport {
                dep_index: 0,
                key: CacheKeyWithSelector {
                    key: key.clone(),
                    selector: None,
                },
            })
            .collect()
    }

    fn absorb_exports(&mut self, exports: Vec<SecondaryExport>) {
        self.absorbed.lock().unwrap().extend(exports);
    }
}

pub fn func_edge(name: &str, value: &str, key: Option<&str>, ignore_cache: bool) -> FuncEdge {
    let trigger = Arc::new(Notify::new());
    let func_canceled = Arc::new(AtomicBool::new(false));
    let unparks = Arc::new(AtomicUsize::new(0));
    let absorbed = Arc::new(Mutex::new(Vec::new()));
    let edge = Edge::new(
        EdgeRef::new(name, 0),
        EdgeOptions { ignore_cache },
        Box::new(FuncWorkLogic {
            value: value.to_string(),
            trigger: trigger.clone(),
            key: key.map(CacheKey::new),
            func_canceled: func_canceled.clone(),
            req: None,
            unparks: unparks.clone(),
            absorbed: absorbed.clone(),
        }),
    );
    FuncEdge {
        edge,
        trigger,
        func_canceled,
        unparks,
        absorbed,
    }
}
