// src/graph/keys.rs

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::graph::edge::Edge;

/// Cache-key fingerprint identifying equivalent work. Two edges whose index
/// keys collide compute the same thing and are candidates for merging.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub fn new(digest: impl Into<Arc<str>>) -> Self {
        CacheKey(digest.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.0)
    }
}

/// A cache key scoped by the selector it was computed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeyWithSelector {
    pub key: CacheKey,
    pub selector: Option<String>,
}

/// Export metadata inherited from a merged-away edge: a key the retired edge
/// would have published for one of its dependencies, which the surviving
/// edge publishes on its behalf.
#[derive(Debug, Clone)]
pub struct SecondaryExport {
    pub dep_index: usize,
    pub key: CacheKeyWithSelector,
}

/// Process-wide registry mapping index keys to the edge first registered
/// under them. Compare-and-insert semantics: the slot for a key never
/// changes once written.
pub struct KeyIndex {
    entries: Mutex<HashMap<CacheKey, Arc<Edge>>>,
}

impl KeyIndex {
    pub(crate) fn new() -> Self {
        KeyIndex {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register `edge` under `key` if the key is vacant. Returns the
    /// already-registered edge when the key is taken by a *different* edge
    /// (the merge candidate); `None` when `edge` now owns the key or
    /// already did.
    pub fn load_or_store(&self, key: &CacheKey, edge: &Arc<Edge>) -> Option<Arc<Edge>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                if Arc::ptr_eq(occupied.get(), edge) {
                    None
                } else {
                    Some(occupied.get().clone())
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(edge.clone());
                None
            }
        }
    }
}
