//! Per-resource async locks for the in-memory backend
//!
//! Each resource key maps to its own mutex. A scope is acquired key by key in global order under
//! a single deadline; if the deadline passes, every lock taken so far is released and the caller
//! gets `ResourceBusy`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::traits::{LockScope, ResourceKey};
use crate::{Error, Result};

type SlotMap = HashMap<ResourceKey, Arc<AsyncMutex<()>>>;

#[derive(Debug, Default)]
pub struct LockManager {
    slots: Arc<Mutex<SlotMap>>,
}

/// Held locks of one scope; dropping it releases them.
#[derive(Debug)]
pub struct ScopeGuard {
    // Declared first so the mutex guards drop before their slots are reclaimed
    _guards: Vec<OwnedMutexGuard<()>>,
    _slots: ScopeSlots,
}

/// Slots a scope has claimed, held or waited on.
///
/// On drop, every slot nobody else references is removed from the map. Slots are only cloned
/// under the map lock, so a count of one (the map itself) means no task holds or awaits it.
#[derive(Debug)]
struct ScopeSlots {
    map: Arc<Mutex<SlotMap>>,
    slots: Vec<(ResourceKey, Arc<AsyncMutex<()>>)>,
}

impl Drop for ScopeSlots {
    fn drop(&mut self) {
        let mut map = lock_map(&self.map);
        for (key, slot) in self.slots.drain(..) {
            drop(slot);
            if map.get(&key).is_some_and(|s| Arc::strong_count(s) == 1) {
                map.remove(&key);
            }
        }
    }
}

fn lock_map(map: &Mutex<SlotMap>) -> std::sync::MutexGuard<'_, SlotMap> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn claim(&self, scope: &LockScope) -> ScopeSlots {
        let mut map = lock_map(&self.slots);
        let slots = scope
            .iter()
            .map(|key| {
                let slot = map
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                    .clone();
                (key.clone(), slot)
            })
            .collect();
        ScopeSlots {
            map: self.slots.clone(),
            slots,
        }
    }

    /// Resources currently tracked, held or awaited
    #[cfg(test)]
    fn tracked(&self) -> usize {
        lock_map(&self.slots).len()
    }

    pub async fn acquire(&self, scope: &LockScope, timeout: Duration) -> Result<ScopeGuard> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let claimed = self.claim(scope);
        let mut guards = Vec::with_capacity(scope.len());

        for (key, slot) in &claimed.slots {
            match tokio::time::timeout_at(deadline, slot.clone().lock_owned()).await {
                Ok(guard) => guards.push(guard),
                Err(_) => {
                    let waited_ms = started.elapsed().as_millis() as u64;
                    tracing::debug!(resource = %key, waited_ms, "Lock acquisition timed out");
                    crate::metrics::LOCK_TIMEOUTS_TOTAL
                        .with_label_values(&["memory"])
                        .inc();
                    return Err(Error::ResourceBusy {
                        resource: key.to_string(),
                        waited_ms,
                    });
                }
            }
        }

        crate::metrics::LOCK_WAIT_SECONDS
            .with_label_values(&["memory"])
            .observe(started.elapsed().as_secs_f64());

        Ok(ScopeGuard {
            _guards: guards,
            _slots: claimed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BedId, PatientId, WardId};

    #[tokio::test]
    async fn disjoint_scopes_do_not_block() {
        let locks = LockManager::new();
        let a = LockScope::new().bed(BedId::new());
        let b = LockScope::new().bed(BedId::new());

        let _first = locks.acquire(&a, Duration::from_millis(50)).await.unwrap();
        let second = locks.acquire(&b, Duration::from_millis(50)).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn overlapping_scope_times_out_as_busy() {
        let locks = LockManager::new();
        let ward = WardId::new();
        let held = LockScope::new().ward(ward);
        let wanted = LockScope::new().ward(ward).bed(BedId::new());

        let _guard = locks.acquire(&held, Duration::from_millis(50)).await.unwrap();
        let err = locks
            .acquire(&wanted, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResourceBusy { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn released_scope_can_be_reacquired() {
        let locks = LockManager::new();
        let scope = LockScope::new().bed(BedId::new());

        let guard = locks.acquire(&scope, Duration::from_millis(50)).await.unwrap();
        drop(guard);
        tokio_test::assert_ok!(locks.acquire(&scope, Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn released_slots_are_reclaimed() {
        let locks = LockManager::new();
        for n in 0..1_000 {
            let scope = LockScope::new()
                .ward(WardId::new())
                .patient(&PatientId::new(format!("P{n}")));
            let guard = locks.acquire(&scope, Duration::from_millis(50)).await.unwrap();
            assert_eq!(locks.tracked(), 2);
            drop(guard);
        }
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn timed_out_waiter_leaves_held_slot_in_place() {
        let locks = LockManager::new();
        let ward = WardId::new();
        let held = LockScope::new().ward(ward);
        let wanted = LockScope::new().ward(ward).bed(BedId::new());

        let guard = locks.acquire(&held, Duration::from_millis(50)).await.unwrap();
        assert!(locks.acquire(&wanted, Duration::from_millis(20)).await.is_err());
        assert_eq!(locks.tracked(), 1, "only the held ward remains");

        drop(guard);
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn cancelled_acquire_releases_its_claims() {
        let locks = Arc::new(LockManager::new());
        let ward = WardId::new();
        let scope = LockScope::new().ward(ward);

        let guard = locks.acquire(&scope, Duration::from_millis(50)).await.unwrap();
        let waiter = {
            let locks = locks.clone();
            let scope = scope.clone();
            tokio::spawn(async move { locks.acquire(&scope, Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        waiter.abort();
        let _ = waiter.await;

        drop(guard);
        assert_eq!(locks.tracked(), 0);
        tokio_test::assert_ok!(locks.acquire(&scope, Duration::from_millis(50)).await);
    }
}
