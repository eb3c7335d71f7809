//! Process-wide source bookkeeping
//!
//! A [`SourceRuntime`] is created once at startup (empty) and passed to every
//! [`Source`](super::Source). It hands out per-type query ids and tracks live
//! sources so that [`SourceRuntime::cleanup_all`] can close whatever is still
//! running at shutdown.

use super::SourceCore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Query-id counters and the live-instance registry
#[derive(Default)]
pub struct SourceRuntime {
    counters: Mutex<HashMap<String, u64>>,
    live: Mutex<HashMap<u64, Weak<SourceCore>>>,
    next_key: AtomicU64,
}

impl SourceRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Next query id for an adapter type: `"{type}_{counter}"`, counting from 0
    pub fn next_query_id(&self, type_name: &str) -> String {
        let mut counters = self.counters.lock();
        let counter = counters.entry(type_name.to_string()).or_insert(0);
        let id = format!("{}_{}", type_name, counter);
        *counter += 1;
        id
    }

    pub(crate) fn allocate_key(&self) -> u64 {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, key: u64, core: Weak<SourceCore>) {
        self.live.lock().insert(key, core);
    }

    pub(crate) fn deregister(&self, key: u64) {
        self.live.lock().remove(&key);
    }

    /// Number of registered sources that are still alive
    pub fn live_count(&self) -> usize {
        self.live
            .lock()
            .values()
            .filter(|core| core.strong_count() > 0)
            .count()
    }

    /// Close every registered source (abort + join running queries)
    pub fn cleanup_all(&self) {
        let cores: Vec<Arc<SourceCore>> = {
            let mut live = self.live.lock();
            live.retain(|_, core| core.strong_count() > 0);
            live.values().filter_map(Weak::upgrade).collect()
        };

        if !cores.is_empty() {
            tracing::info!("Closing {} live source(s)", cores.len());
        }
        for core in cores {
            core.close();
        }
    }
}
