//! Counting locks shared by concurrently running steps.
//!
//! A [`MasterLock`] has `max_count` slots. A shared claim takes one slot, an
//! exclusive claim takes all of them. Waiters are served first-come,
//! first-served, since tokio's semaphore queues acquirers fairly.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Result, StepError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
pub struct MasterLock {
    name: String,
    max_count: u32,
    semaphore: Arc<Semaphore>,
    acquisitions: AtomicU64,
    releases: AtomicU64,
}

impl MasterLock {
    pub fn new(name: impl Into<String>, max_count: u32) -> Arc<Self> {
        let max_count = max_count.max(1);
        Arc::new(Self {
            name: name.into(),
            max_count,
            semaphore: Arc::new(Semaphore::new(max_count as usize)),
            acquisitions: AtomicU64::new(0),
            releases: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    pub fn exclusive(self: &Arc<Self>) -> LockClaim {
        LockClaim {
            lock: self.clone(),
            mode: LockMode::Exclusive,
        }
    }

    pub fn shared(self: &Arc<Self>) -> LockClaim {
        LockClaim {
            lock: self.clone(),
            mode: LockMode::Shared,
        }
    }

    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn is_available(&self, mode: LockMode) -> bool {
        self.semaphore.available_permits() >= self.slots(mode) as usize
    }

    fn slots(&self, mode: LockMode) -> u32 {
        match mode {
            LockMode::Exclusive => self.max_count,
            LockMode::Shared => 1,
        }
    }

    pub async fn acquire(self: &Arc<Self>, mode: LockMode) -> Result<LockGuard> {
        let permit = self
            .semaphore
            .clone()
            .acquire_many_owned(self.slots(mode))
            .await
            .map_err(|_| StepError::InvalidState {
                expected: "open lock",
                found: format!("lock '{}' is closed", self.name),
            })?;
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(LockGuard {
            lock: self.clone(),
            mode,
            _permit: permit,
        })
    }
}

/// A step's request for a lock in a given mode.
#[derive(Debug, Clone)]
pub struct LockClaim {
    pub lock: Arc<MasterLock>,
    pub mode: LockMode,
}

/// A held lock. Dropping it releases the slots.
#[derive(Debug)]
pub struct LockGuard {
    lock: Arc<MasterLock>,
    mode: LockMode,
    _permit: OwnedSemaphorePermit,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.lock.name
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.lock.releases.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(lock = %self.lock.name, mode = ?self.mode, "lock released");
    }
}

/// Acquire every claim, in lock-name order, strongest mode per lock.
/// Distinct locks sharing a name are each acquired, ordered by address.
///
/// Dropping the returned future part-way releases whatever was already held.
pub async fn acquire_all(claims: &[LockClaim]) -> Result<Vec<LockGuard>> {
    let mut wanted: BTreeMap<(&str, usize), &LockClaim> = BTreeMap::new();
    for claim in claims {
        let key = (claim.lock.name(), Arc::as_ptr(&claim.lock) as usize);
        let entry = wanted.entry(key).or_insert(claim);
        if claim.mode > entry.mode {
            *entry = claim;
        }
    }

    let mut guards = Vec::with_capacity(wanted.len());
    for claim in wanted.into_values() {
        let started = Instant::now();
        if !claim.lock.is_available(claim.mode) {
            tracing::info!(lock = %claim.lock.name(), mode = ?claim.mode, "waiting for lock");
        }
        guards.push(claim.lock.acquire(claim.mode).await?);
        crate::metrics::lock_wait(claim.lock.name(), started.elapsed().as_millis() as u64);
    }
    Ok(guards)
}

/// Named locks shared by every build that uses this registry.
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<String, Arc<MasterLock>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock called `name`, created with `max_count` slots on first use.
    pub fn get_or_create(&self, name: &str, max_count: u32) -> Arc<MasterLock> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = locks
            .entry(name.to_string())
            .or_insert_with(|| MasterLock::new(name, max_count));
        if lock.max_count() != max_count.max(1) {
            tracing::warn!(
                lock = %name,
                existing = lock.max_count(),
                requested = max_count,
                "lock already registered with a different max_count"
            );
        }
        lock.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn exclusive_waits_for_shared_holders() {
        let lock = MasterLock::new("db", 2);
        let a = lock.acquire(LockMode::Shared).await.unwrap();
        let _b = lock.acquire(LockMode::Shared).await.unwrap();
        assert!(!lock.is_available(LockMode::Shared));

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire(LockMode::Exclusive).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(a);
        drop(_b);
        waiter.await.unwrap().unwrap();
        assert_eq!(lock.acquisitions(), 3);
        assert_eq!(lock.releases(), 3);
    }

    #[tokio::test]
    async fn cancelled_acquisition_releases_partial_holds() {
        let a = MasterLock::new("a", 1);
        let b = MasterLock::new("b", 1);
        let blocker = b.acquire(LockMode::Exclusive).await.unwrap();

        let claims = vec![b.exclusive(), a.exclusive()];
        let attempt = tokio::time::timeout(Duration::from_millis(20), acquire_all(&claims)).await;
        assert!(attempt.is_err());

        assert_eq!(a.acquisitions(), 1);
        assert_eq!(a.releases(), 1);
        assert!(a.is_available(LockMode::Exclusive));
        drop(blocker);
    }

    #[tokio::test]
    async fn duplicate_claims_collapse_to_strongest_mode() {
        let lock = MasterLock::new("cache", 3);
        let guards = acquire_all(&[lock.shared(), lock.exclusive()]).await.unwrap();
        assert_eq!(guards.len(), 1);
        assert_eq!(guards[0].mode(), LockMode::Exclusive);
    }

    #[tokio::test]
    async fn distinct_locks_with_one_name_are_all_acquired() {
        let first = MasterLock::new("deploy", 1);
        let second = MasterLock::new("deploy", 1);
        let guards = acquire_all(&[first.exclusive(), second.exclusive()]).await.unwrap();

        assert_eq!(guards.len(), 2);
        assert!(!first.is_available(LockMode::Shared));
        assert!(!second.is_available(LockMode::Shared));
        drop(guards);
        assert_eq!(first.releases(), 1);
        assert_eq!(second.releases(), 1);
    }

    #[test]
    fn registry_reuses_locks_by_name() {
        let registry = LockRegistry::new();
        let a = registry.get_or_create("deploy", 1);
        let b = registry.get_or_create("deploy", 1);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
