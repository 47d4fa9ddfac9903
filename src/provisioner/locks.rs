//! Per-node serialization
//!
//! Every mutating node operation runs under that node's async mutex, so a
//! bake and an unbake of the same node can never interleave. Different
//! nodes proceed independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Guard held for the duration of one node operation
pub type NodeGuard = OwnedMutexGuard<()>;

/// Lazily populated table of per-node locks
#[derive(Debug, Default)]
pub struct NodeLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl NodeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `node_id`, created on first use
    fn entry(&self, node_id: &str) -> Arc<AsyncMutex<()>> {
        // A poisoned map still holds valid entries
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };

        Arc::clone(
            locks
                .entry(node_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// Wait for exclusive access to `node_id`
    pub async fn acquire(&self, node_id: &str) -> NodeGuard {
        self.entry(node_id).lock_owned().await
    }

    /// Take the lock only if no other operation holds it
    pub fn try_acquire(&self, node_id: &str) -> Option<NodeGuard> {
        self.entry(node_id).try_lock_owned().ok()
    }

    /// Number of nodes that have been locked at least once
    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
