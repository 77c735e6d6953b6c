//! Per-node serialization: the orchestrator is a single instance owning
//! the whole fleet, so a `HashMap<NodeId, Arc<Mutex<()>>>` guarded by one
//! outer `Mutex` for insertion is enough — no distributed lock manager.
//! Cross-node operations still run concurrently up to a configurable
//! parallelism limit via `NodeLocks::semaphore`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};

pub struct NodeLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    semaphore: Arc<Semaphore>,
}

impl NodeLocks {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            locks: StdMutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(max_parallel)),
        }
    }

    fn lock_for(&self, node_id: &str) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().unwrap();
        map.entry(node_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Non-blocking: returns `None` if a deploy is already running for
    /// this node — the caller maps that to `409`. The returned guard
    /// holds the lock for as long as it's kept alive, spanning whatever
    /// awaits the caller performs.
    pub fn try_begin(&self, node_id: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = self.lock_for(node_id);
        lock.try_lock_owned().ok()
    }

    pub fn semaphore(&self) -> Arc<Semaphore> {
        self.semaphore.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_try_begin_on_same_node_fails_while_first_is_held() {
        let locks = NodeLocks::new(8);
        let first = locks.try_begin("node-1");
        assert!(first.is_some());
        let second = locks.try_begin("node-1");
        assert!(second.is_none());
        drop(first);
        let third = locks.try_begin("node-1");
        assert!(third.is_some());
    }

    #[test]
    fn different_nodes_do_not_contend() {
        let locks = NodeLocks::new(8);
        let a = locks.try_begin("node-a");
        let b = locks.try_begin("node-b");
        assert!(a.is_some());
        assert!(b.is_some());
    }
}
