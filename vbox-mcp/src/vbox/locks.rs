//! Concurrency control — `spec.md` §4.D / §5.
//!
//! Two tiers: a per-VM writer lock (so two concurrent mutations of the
//! same machine serialize instead of racing VBoxManage's own machine
//! lock) and a single global host-network lock (host-only interface and
//! NAT network creation/removal touch shared host state with no natural
//! per-entity key).

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use uuid::Uuid;

/// Append-only table of per-VM mutexes. Entries are never removed: VM
/// deletion frees the disk/registration but the `Uuid` key itself is
/// cheap to keep keyed forever, and removing it would race a concurrent
/// locker that already holds a clone of the `Arc`.
#[derive(Debug, Default)]
pub struct VmLockTable {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl VmLockTable {
    pub fn new() -> Self {
        Self { locks: DashMap::new() }
    }

    fn entry(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Acquire the writer lock for a single VM.
    pub async fn lock(&self, id: Uuid) -> OwnedMutexGuard<()> {
        self.entry(id).lock_owned().await
    }

    /// Acquire two VM locks in a fixed global order (ascending `Uuid`) to
    /// make lock acquisition deadlock-free for operations that touch two
    /// machines at once, such as `clone_vm`.
    pub async fn lock_pair(&self, a: Uuid, b: Uuid) -> (OwnedMutexGuard<()>, OwnedMutexGuard<()>) {
        if a == b {
            let guard = self.lock(a).await;
            // Safety valve for same-id callers: acquiring twice would
            // deadlock, so the second guard is a lock on a throwaway mutex
            // that is already satisfied.
            let filler = Arc::new(Mutex::new(()));
            let filler_guard = filler.lock_owned().await;
            return (guard, filler_guard);
        }
        if a < b {
            let ga = self.lock(a).await;
            let gb = self.lock(b).await;
            (ga, gb)
        } else {
            let gb = self.lock(b).await;
            let ga = self.lock(a).await;
            (ga, gb)
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Serializes host-network mutations (`create_hostonly`, `remove_hostonly`,
/// NAT network create/remove) that have no per-entity key of their own.
#[derive(Debug, Default)]
pub struct HostNetworkLock {
    inner: Mutex<()>,
}

impl HostNetworkLock {
    pub fn new() -> Self {
        Self { inner: Mutex::new(()) }
    }

    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn distinct_vms_do_not_contend() {
        let table = VmLockTable::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let guard_a = table.lock(a).await;
        let result = tokio::time::timeout(Duration::from_millis(50), table.lock(b)).await;
        assert!(result.is_ok());
        drop(guard_a);
    }

    #[tokio::test]
    async fn same_vm_serializes() {
        let table = VmLockTable::new();
        let id = Uuid::new_v4();
        let _guard = table.lock(id).await;
        let result = tokio::time::timeout(Duration::from_millis(50), table.lock(id)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn lock_pair_orders_by_uuid_without_deadlock() {
        let table = VmLockTable::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (g1, g2) = table.lock_pair(a, b).await;
        drop(g1);
        drop(g2);
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn host_network_lock_serializes() {
        let lock = HostNetworkLock::new();
        let _guard = lock.lock().await;
        let result = tokio::time::timeout(Duration::from_millis(50), lock.lock()).await;
        assert!(result.is_err());
    }
}
