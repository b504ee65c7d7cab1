// src/graph/mod.rs

//! Graph-facing contracts of the scheduler.
//!
//! - [`edge`] defines the edge handle, the descriptor types, and the
//!   [`EdgeLogic`] advancement contract ("unpark").
//! - [`factory`] defines the capability used to resolve descriptors to
//!   edges and to install merge redirects.
//! - [`keys`] holds cache-key types, merge export metadata, and the
//!   process-wide key registry used for edge merging.
//!
//! The business logic of an edge (cache-key computation, execution of work,
//! dependency bookkeeping) lives behind these seams; the scheduler only
//! depends on the contracts here.

pub mod edge;
pub mod factory;
pub mod keys;

pub use edge::{
    DesiredState, Edge, EdgeId, EdgeLogic, EdgeOptions, EdgeReceiver, EdgeRef, EdgeRequest,
    EdgeSender, VertexId,
};
pub use factory::EdgeFactory;
pub use keys::{CacheKey, CacheKeyWithSelector, KeyIndex, SecondaryExport};
