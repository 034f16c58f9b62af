//! Priority registry of the bus server.
//!
//! Maps a call name to every handler registered for it, across all
//! connections. Dispatch takes a snapshot in dispatch order (descending
//! priority, earlier registration first on ties), so registrations that
//! change while a call is being routed never disturb it.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Where a registered handler lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    /// Connection that registered the handler.
    pub conn_id: u64,
    /// Id the connection assigned to the handler.
    pub handler_id: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    priority: i64,
    /// Registration order, breaks priority ties.
    seq: u64,
    target: Target,
}

/// Handlers by name, kept in dispatch order.
pub struct RpcRegistry {
    next_seq: AtomicU64,
    entries: RwLock<HashMap<String, Vec<Entry>>>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self {
            next_seq: AtomicU64::new(0),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Add a handler. The same target may be added under several names.
    pub fn insert(&self, name: &str, priority: i64, target: Target) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write();
        let list = entries.entry(name.to_string()).or_default();
        list.push(Entry {
            priority,
            seq,
            target,
        });
        list.sort_by_key(|e| (Reverse(e.priority), e.seq));
    }

    /// Remove one handler of a connection; returns whether it existed.
    pub fn remove(&self, target: Target) -> bool {
        let mut entries = self.entries.write();
        let mut removed = false;
        entries.retain(|_, list| {
            let before = list.len();
            list.retain(|e| e.target != target);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    /// Remove every handler of a connection; returns how many went.
    pub fn remove_connection(&self, conn_id: u64) -> usize {
        let mut entries = self.entries.write();
        let mut removed = 0;
        entries.retain(|_, list| {
            let before = list.len();
            list.retain(|e| e.target.conn_id != conn_id);
            removed += before - list.len();
            !list.is_empty()
        });
        removed
    }

    /// Snapshot of the handlers for `name`, in dispatch order.
    pub fn candidates(&self, name: &str) -> Vec<Target> {
        self.entries
            .read()
            .get(name)
            .map(|list| list.iter().map(|e| e.target).collect())
            .unwrap_or_default()
    }

    /// Name to priorities, in dispatch order.
    pub fn list(&self) -> BTreeMap<String, Vec<i64>> {
        self.entries
            .read()
            .iter()
            .map(|(name, list)| (name.clone(), list.iter().map(|e| e.priority).collect()))
            .collect()
    }

    /// Total number of registrations.
    pub fn len(&self) -> usize {
        self.entries.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    #[cfg(test)]
    fn sequence(&self, name: &str) -> Vec<u64> {
        self.entries
            .read()
            .get(name)
            .map(|list| list.iter().map(|e| e.seq).collect())
            .unwrap_or_default()
    }
}

impl Default for RpcRegistry {
    fn default() -> Self {
        Self::new()
    }
}
