use droidforge_core::{LockMode, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A held lock on one resource identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLock {
    /// Resource identifier (a claim glob)
    pub resource: String,
    /// Mode the lock was created in
    pub mode: LockMode,
    /// Nodes holding the lock; exactly one for `write`
    pub owners: BTreeSet<NodeId>,
}

/// Read-only view of the lock table, keyed by resource
pub type LockState = BTreeMap<String, ResourceLock>;

/// Tracks which resources are held by which nodes of one execution.
///
/// The table lives inside the execution record, so every call runs under the
/// record's mutex and acquire/release are atomic with the scheduling update.
#[derive(Debug, Default, Clone)]
pub struct ResourceLockManager {
    locks: LockState,
}

impl ResourceLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a table from persisted entries.
    pub fn from_entries(entries: impl IntoIterator<Item = ResourceLock>) -> Self {
        let locks = entries
            .into_iter()
            .filter(|lock| !lock.owners.is_empty())
            .map(|lock| (lock.resource.clone(), lock))
            .collect();
        Self { locks }
    }

    /// All-or-nothing, non-blocking acquisition of `resources` in `mode`.
    ///
    /// Resources are checked in canonical order; if any is incompatible no lock
    /// is taken and `false` is returned. Re-acquiring a resource the node
    /// already owns always succeeds.
    pub fn try_acquire(&mut self, resources: &[String], mode: LockMode, node_id: &NodeId) -> bool {
        let mut wanted: Vec<&String> = resources.iter().collect();
        wanted.sort();
        wanted.dedup();

        for resource in &wanted {
            if let Some(lock) = self.locks.get(resource.as_str())
                && !lock.owners.contains(node_id)
                && !lock.mode.admits(mode)
            {
                tracing::debug!(
                    "Lock on {resource} ({}) held by {:?} blocks {node_id} ({mode})",
                    lock.mode,
                    lock.owners
                );
                return false;
            }
        }

        for resource in wanted {
            self.locks
                .entry(resource.clone())
                .or_insert_with(|| ResourceLock {
                    resource: resource.clone(),
                    mode,
                    owners: BTreeSet::new(),
                })
                .owners
                .insert(node_id.clone());
        }
        true
    }

    /// Remove `node_id` from the owners of each resource, dropping emptied entries.
    pub fn release(&mut self, resources: &[String], node_id: &NodeId) {
        for resource in resources {
            if let Some(lock) = self.locks.get_mut(resource) {
                lock.owners.remove(node_id);
                if lock.owners.is_empty() {
                    self.locks.remove(resource);
                }
            }
        }
    }

    /// Remove every listed node from every lock it holds.
    pub fn release_all(&mut self, node_ids: &[NodeId]) {
        self.locks.retain(|_, lock| {
            for node_id in node_ids {
                lock.owners.remove(node_id);
            }
            !lock.owners.is_empty()
        });
    }

    pub fn lock_state(&self) -> &LockState {
        &self.locks
    }

    pub fn is_locked(&self, resource: &str) -> bool {
        self.locks.contains_key(resource)
    }

    pub fn owners(&self, resource: &str) -> Vec<NodeId> {
        self.locks
            .get(resource)
            .map(|lock| lock.owners.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn locked_resource_count(&self) -> usize {
        self.locks.len()
    }

    /// Snapshot of the entries for persistence.
    pub fn entries(&self) -> Vec<ResourceLock> {
        self.locks.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.locks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(items: &[&str]) -> Vec<String> {
        items.iter().map(|&item| item.to_owned()).collect()
    }

    #[test]
    fn test_write_lock_is_exclusive() {
        let mut manager = ResourceLockManager::new();
        let node_a = NodeId::from("a");
        let node_b = NodeId::from("b");

        assert!(manager.try_acquire(&claims(&["src/**"]), LockMode::Write, &node_a));
        assert!(!manager.try_acquire(&claims(&["src/**"]), LockMode::Write, &node_b));
        assert!(!manager.try_acquire(&claims(&["src/**"]), LockMode::Read, &node_b));
        assert_eq!(manager.owners("src/**"), vec![node_a]);
    }

    #[test]
    fn test_shared_modes_coexist() {
        let mut manager = ResourceLockManager::new();
        let reader = NodeId::from("reader");
        let analyst = NodeId::from("analyst");
        let writer = NodeId::from("writer");

        assert!(manager.try_acquire(&claims(&["docs/**"]), LockMode::Read, &reader));
        assert!(manager.try_acquire(&claims(&["docs/**"]), LockMode::Analysis, &analyst));
        assert!(!manager.try_acquire(&claims(&["docs/**"]), LockMode::Write, &writer));
        assert_eq!(manager.owners("docs/**").len(), 2);
    }

    #[test]
    fn test_acquire_is_all_or_nothing() {
        let mut manager = ResourceLockManager::new();
        let node_a = NodeId::from("a");
        let node_b = NodeId::from("b");

        assert!(manager.try_acquire(&claims(&["f2"]), LockMode::Write, &node_a));
        assert!(!manager.try_acquire(&claims(&["f1", "f2"]), LockMode::Write, &node_b));
        assert!(!manager.is_locked("f1"));
        assert_eq!(manager.locked_resource_count(), 1);
    }

    #[test]
    fn test_reacquire_is_idempotent() {
        let mut manager = ResourceLockManager::new();
        let node_a = NodeId::from("a");

        assert!(manager.try_acquire(&claims(&["f1", "f1"]), LockMode::Write, &node_a));
        assert!(manager.try_acquire(&claims(&["f1"]), LockMode::Write, &node_a));
        assert_eq!(manager.owners("f1"), vec![node_a]);
    }

    #[test]
    fn test_release_restores_prior_state() {
        let mut manager = ResourceLockManager::new();
        let node_a = NodeId::from("a");
        let node_b = NodeId::from("b");

        assert!(manager.try_acquire(&claims(&["shared"]), LockMode::Read, &node_a));
        let before = manager.lock_state().clone();

        assert!(manager.try_acquire(&claims(&["shared", "own"]), LockMode::Read, &node_b));
        manager.release(&claims(&["shared", "own"]), &node_b);

        assert_eq!(manager.lock_state(), &before);
    }

    #[test]
    fn test_release_all_and_restore() {
        let mut manager = ResourceLockManager::new();
        let node_a = NodeId::from("a");
        let node_b = NodeId::from("b");
        assert!(manager.try_acquire(&claims(&["x"]), LockMode::Read, &node_a));
        assert!(manager.try_acquire(&claims(&["x", "y"]), LockMode::Read, &node_b));

        let restored = ResourceLockManager::from_entries(manager.entries());
        assert_eq!(restored.lock_state(), manager.lock_state());

        manager.release_all(&[node_a, node_b]);
        assert_eq!(manager.locked_resource_count(), 0);

        let mut other = restored;
        other.clear();
        assert!(!other.is_locked("x"));
    }
}
