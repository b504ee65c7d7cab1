// src/pipe/channel.rs

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Value payload carried by a pipe once the producer side completes.
///
/// Results are shared immutable snapshots; consumers that need to decouple
/// from the producer clone the `Arc`, never the underlying value.
pub type SharedValue = Arc<dyn Any + Send + Sync>;

/// Completion callback installed on one side of a pipe.
///
/// Stored as `Arc` so it can be invoked without holding the slot lock (a
/// callback is allowed to perform pipe operations on *other* pipes, and on
/// the opposite side of this one).
pub type CompletionFn = Arc<dyn Fn() + Send + Sync>;

/// Future produced by an async work function attached to a pipe.
pub type FuncFuture = Pin<Box<dyn Future<Output = anyhow::Result<SharedValue>> + Send>>;

/// Async work function for [`Pipe::with_function`]. The token fires when the
/// receiver cancels the request; the function is expected to unwind promptly
/// but its result is discarded either way once the pipe is canceled.
pub type PipeFunc = Box<dyn FnOnce(CancellationToken) -> FuncFuture + Send>;

/// Terminal/progress state of a pipe, as seen from one side.
#[derive(Clone, Default)]
pub struct Status {
    /// The producer performed its single terminal transition.
    pub completed: bool,
    /// The terminal transition was a cancellation.
    pub canceled: bool,
    /// Latest value published by the producer (intermediate or final).
    pub value: Option<SharedValue>,
    /// Error carried by a failed terminal transition.
    pub err: Option<Arc<anyhow::Error>>,
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Status")
            .field("completed", &self.completed)
            .field("canceled", &self.canceled)
            .field("has_value", &self.value.is_some())
            .field("err", &self.err.as_ref().map(|e| e.to_string()))
            .finish()
    }
}

/// Snapshot of the request as seen by the producer side.
#[derive(Debug, Clone)]
pub struct RequestView<P> {
    pub payload: P,
    /// Set once the receiver has canceled; the producer is expected to
    /// unwind and finish the pipe with a canceled status.
    pub canceled: bool,
}

struct State {
    /// Receiver asked for cancellation.
    canceled: bool,
    /// Latest status written by the sender.
    sent: Status,
    /// `sent` has not yet been consumed by `Receiver::receive`.
    fresh: bool,
    /// Latest status acknowledged by the receiver.
    received: Status,
}

struct Core<P> {
    payload: P,
    state: Mutex<State>,
    on_send: Mutex<Option<CompletionFn>>,
    on_recv: Mutex<Option<CompletionFn>>,
    /// Present only on function pipes; canceled together with the request.
    func_token: Option<CancellationToken>,
}

impl<P> Core<P> {
    fn fire(slot: &Mutex<Option<CompletionFn>>) {
        // Clone out of the slot so the callback runs without any pipe lock
        // held; callbacks may re-enter the scheduler or the opposite side.
        let cb = slot.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb();
        }
    }
}

/// One-shot typed request/response channel between two parties.
///
/// The producer holds the [`Sender`], the consumer the [`Receiver`]. The
/// sender may publish any number of intermediate updates before exactly one
/// terminal transition (value, error, or canceled). Each side owns a
/// completion-callback slot:
///
/// - `on_send_completion` fires towards the receiver whenever the sender
///   publishes (update or terminal).
/// - `on_receive_completion` fires towards the sender whenever the receiver
///   acknowledges an update via [`Receiver::receive`] or cancels.
///
/// Callbacks fire at most once per observable transition and never while
/// the pipe's internal lock is held.
pub struct Pipe<P> {
    pub sender: Sender<P>,
    pub receiver: Receiver<P>,
}

pub struct Sender<P>(Arc<Core<P>>);

pub struct Receiver<P>(Arc<Core<P>>);

impl<P> Clone for Sender<P> {
    fn clone(&self) -> Self {
        Sender(self.0.clone())
    }
}

impl<P> Clone for Receiver<P> {
    fn clone(&self) -> Self {
        Receiver(self.0.clone())
    }
}

impl<P> Pipe<P> {
    /// New pipe with both sides pending.
    pub fn new(payload: P) -> Self {
        Self::with_token(payload, None)
    }

    fn with_token(payload: P, func_token: Option<CancellationToken>) -> Self {
        let core = Arc::new(Core {
            payload,
            state: Mutex::new(State {
                canceled: false,
                sent: Status::default(),
                fresh: false,
                received: Status::default(),
            }),
            on_send: Mutex::new(None),
            on_recv: Mutex::new(None),
            func_token,
        });
        Pipe {
            sender: Sender(core.clone()),
            receiver: Receiver(core),
        }
    }

    /// Install the send-completion callback (receiver-side wake-up).
    pub fn on_send_completion(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.sender.0.on_send.lock().unwrap() = Some(Arc::new(f));
    }

    /// Install the receive-completion callback (sender-side wake-up).
    pub fn on_receive_completion(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.sender.0.on_recv.lock().unwrap() = Some(Arc::new(f));
    }
}

impl<P: Default> Pipe<P> {
    /// Pipe wrapping an async work function.
    ///
    /// Returns the pipe and a start future; driving the future runs `f` and
    /// finalizes the sender side with the produced value or error. If the
    /// receiver cancels first, the pipe finishes canceled and whatever `f`
    /// returned is discarded.
    pub fn with_function(f: PipeFunc) -> (Self, impl Future<Output = ()> + Send)
    where
        P: Send + Sync + 'static,
    {
        let token = CancellationToken::new();
        let pipe = Self::with_token(P::default(), Some(token.clone()));
        let sender = pipe.sender.clone();
        let start = async move {
            let res = f(token.clone()).await;
            if token.is_cancelled() {
                sender.finalize_canceled();
            } else {
                sender.finalize(res);
            }
        };
        (pipe, start)
    }
}

impl<P: Clone> Sender<P> {
    /// The original request payload plus the receiver's cancel flag.
    pub fn request(&self) -> RequestView<P> {
        let state = self.0.state.lock().unwrap();
        RequestView {
            payload: self.0.payload.clone(),
            canceled: state.canceled,
        }
    }
}

impl<P> Sender<P> {
    /// Publish an intermediate value without completing the pipe.
    pub fn update(&self, value: SharedValue) {
        {
            let mut state = self.0.state.lock().unwrap();
            if state.sent.completed {
                warn!("pipe update after completion; dropping");
                return;
            }
            state.sent.value = Some(value);
            state.fresh = true;
        }
        Core::<P>::fire(&self.0.on_send);
    }

    /// Terminal transition with a value or an error.
    pub fn finalize(&self, res: anyhow::Result<SharedValue>) {
        {
            let mut state = self.0.state.lock().unwrap();
            if state.sent.completed {
                warn!("pipe finalized twice; keeping first terminal state");
                return;
            }
            state.sent.completed = true;
            match res {
                Ok(value) => state.sent.value = Some(value),
                Err(err) => state.sent.err = Some(Arc::new(err)),
            }
            state.fresh = true;
        }
        Core::<P>::fire(&self.0.on_send);
    }

    /// Terminal transition acknowledging the receiver's cancellation.
    pub fn finalize_canceled(&self) {
        {
            let mut state = self.0.state.lock().unwrap();
            if state.sent.completed {
                warn!("pipe finalized twice; keeping first terminal state");
                return;
            }
            state.sent.completed = true;
            state.sent.canceled = true;
            state.sent.value = None;
            state.fresh = true;
        }
        Core::<P>::fire(&self.0.on_send);
    }

    /// Latest status written by this side.
    pub fn status(&self) -> Status {
        self.0.state.lock().unwrap().sent.clone()
    }
}

impl<P> Receiver<P> {
    /// Consume any pending update. Returns whether a fresh status was
    /// observed since the last call; fires the receive-completion callback
    /// when it was.
    pub fn receive(&self) -> bool {
        let consumed = {
            let mut state = self.0.state.lock().unwrap();
            if !state.fresh {
                false
            } else {
                state.received = state.sent.clone();
                state.fresh = false;
                true
            }
        };
        if consumed {
            Core::<P>::fire(&self.0.on_recv);
        }
        consumed
    }

    /// Latest status acknowledged via [`Receiver::receive`].
    pub fn status(&self) -> Status {
        self.0.state.lock().unwrap().received.clone()
    }

    /// Ask the producer to stop. Idempotent; the first call fires the
    /// receive-completion callback so the producer side gets a turn to
    /// observe the flag, and cancels the work-function token if this is a
    /// function pipe.
    pub fn cancel(&self) {
        {
            let mut state = self.0.state.lock().unwrap();
            if state.canceled {
                return;
            }
            state.canceled = true;
        }
        if let Some(token) = &self.0.func_token {
            token.cancel();
        }
        Core::<P>::fire(&self.0.on_recv);
    }

    /// Whether `other` is a handle onto the same pipe. Consumers use this to
    /// match entries of an `updates` batch against requests they hold.
    pub fn same_pipe(&self, other: &Receiver<P>) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
