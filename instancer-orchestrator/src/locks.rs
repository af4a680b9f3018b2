use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

/// Per-instance async mutexes.
///
/// Workflows and the garbage collector take the lock of a record before a
/// read-decide-write sequence on it (e.g. "mark deleted, delete on provider,
/// mark triaged"), so two actors never interleave on the same instance.
/// Store guards still apply underneath; the lock only serializes.
#[derive(Clone, Default)]
pub struct InstanceLocks {
    inner: Arc<Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>>,
}

pub struct InstanceGuard {
    id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
    locks: InstanceLocks,
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, id: Uuid) -> InstanceGuard {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            map.entry(id).or_default().clone()
        };
        let guard = mutex.lock_owned().await;
        InstanceGuard {
            id,
            guard: Some(guard),
            locks: self.clone(),
        }
    }

    /// Number of ids with a live lock entry.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl InstanceGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self.locks.inner.lock().unwrap_or_else(|p| p.into_inner());
        // Only the map holds it: nobody is waiting, drop the entry.
        if map
            .get(&self.id)
            .is_some_and(|m| Arc::strong_count(m) == 1)
        {
            map.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_id_is_exclusive() {
        let locks = InstanceLocks::new();
        let id = Uuid::new_v4();
        let first = locks.lock(id).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(id).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn different_ids_do_not_contend() {
        let locks = InstanceLocks::new();
        let _a = locks.lock(Uuid::new_v4()).await;
        let _b = tokio::time::timeout(Duration::from_millis(100), locks.lock(Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(locks.len(), 2);
    }
}
