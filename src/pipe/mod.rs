// src/pipe/mod.rs

//! The pipe fabric: one-shot typed request/response channels used for all
//! inter-edge and edge-to-async-function communication.
//!
//! - [`channel`] holds the pipe itself: sender/receiver handles, the status
//!   model, completion callbacks, and the async-function wrapper.
//!
//! Control flow never travels through pipes directly; completion callbacks
//! re-enter the scheduler via its signal path, which takes its own lock.

pub mod channel;

pub use channel::{
    CompletionFn, FuncFuture, Pipe, PipeFunc, Receiver, RequestView, Sender, SharedValue, Status,
};
