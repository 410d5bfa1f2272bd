//! Cluster membership table and the lock that serializes its structural changes.
//!
//! Readers never block: they load an immutable [`BrokerTable`] snapshot via
//! `ArcSwap`. Writers must hold the [`BrokerListLock`], proven by passing a
//! [`BrokerListGuard`] to every mutating method, so structural changes are
//! totally ordered across the listener, protocol and monitor tasks.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};
use tracing::info;

use super::types::{BrokerAddress, BrokerState, ClusteredBroker};

// ---------------------------------------------------------------------------
// BrokerListLock
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    holds: usize,
}

/// Reentrant mutual exclusion scoped to the membership table.
///
/// The owning thread may call [`lock`](Self::lock) again without deadlock;
/// the lock is released when every hold has been released. There is no
/// timeout: callers that need bounded waiting layer their own.
///
/// Holding a guard across an `.await` is a compile error, since the guard
/// is `!Send`.
#[derive(Debug, Default)]
pub struct BrokerListLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl BrokerListLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the calling thread holds the lock.
    pub fn lock(&self) -> BrokerListGuard<'_> {
        self.lock_raw();
        BrokerListGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Acquires one hold without a guard. Pair with [`unlock`](Self::unlock).
    pub fn lock_raw(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.holds = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    state.holds += 1;
                    return;
                }
                Some(_) => self.cond.wait(&mut state),
            }
        }
    }

    /// Releases one hold. When the last hold goes, one waiter is woken.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread does not hold the lock. This is checked
    /// in every build profile; unlocking a lock you do not hold is a bug in
    /// the caller and continuing would break mutual exclusion.
    pub fn unlock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        assert!(
            state.owner == Some(me) && state.holds > 0,
            "BrokerListLock released by a thread that does not hold it"
        );
        state.holds -= 1;
        if state.holds == 0 {
            state.owner = None;
            drop(state);
            self.cond.notify_one();
        }
    }

    #[must_use]
    pub fn is_held_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }
}

/// Proof that the current thread holds a [`BrokerListLock`].
///
/// Dropping the guard releases one hold.
pub struct BrokerListGuard<'a> {
    lock: &'a BrokerListLock,
    _not_send: PhantomData<*const ()>,
}

impl BrokerListGuard<'_> {
    fn belongs_to(&self, lock: &BrokerListLock) -> bool {
        std::ptr::eq(self.lock, lock)
    }
}

impl fmt::Debug for BrokerListGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerListGuard").finish_non_exhaustive()
    }
}

impl Drop for BrokerListGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

// ---------------------------------------------------------------------------
// BrokerTable
// ---------------------------------------------------------------------------

/// Immutable snapshot of cluster membership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerTable {
    pub version: u64,
    pub brokers: BTreeMap<String, ClusteredBroker>,
    /// Broker id holding authoritative cluster configuration.
    pub master: Option<String>,
}

impl BrokerTable {
    #[must_use]
    pub fn get(&self, broker_id: &str) -> Option<&ClusteredBroker> {
        self.brokers.get(broker_id)
    }

    /// Brokers other than `local_id` that currently have a live link.
    #[must_use]
    pub fn active_peers(&self, local_id: &str) -> Vec<BrokerAddress> {
        self.brokers
            .values()
            .filter(|b| b.is_up && b.broker_id() != local_id)
            .map(|b| b.address.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// BrokerList
// ---------------------------------------------------------------------------

/// Cluster membership table guarded by a [`BrokerListLock`].
#[derive(Debug)]
pub struct BrokerList {
    lock: BrokerListLock,
    table: ArcSwap<BrokerTable>,
}

impl Default for BrokerList {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerList {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lock: BrokerListLock::new(),
            table: ArcSwap::from_pointee(BrokerTable::default()),
        }
    }

    /// The lock that must be held to mutate this list.
    #[must_use]
    pub fn lock(&self) -> BrokerListGuard<'_> {
        self.lock.lock()
    }

    #[must_use]
    pub fn raw_lock(&self) -> &BrokerListLock {
        &self.lock
    }

    // -- Lock-free reads ----------------------------------------------------

    #[must_use]
    pub fn snapshot(&self) -> Arc<BrokerTable> {
        self.table.load_full()
    }

    #[must_use]
    pub fn get(&self, broker_id: &str) -> Option<ClusteredBroker> {
        self.table.load().get(broker_id).cloned()
    }

    #[must_use]
    pub fn master(&self) -> Option<String> {
        self.table.load().master.clone()
    }

    #[must_use]
    pub fn is_master(&self, broker_id: &str) -> bool {
        self.table.load().master.as_deref() == Some(broker_id)
    }

    #[must_use]
    pub fn active_peers(&self, local_id: &str) -> Vec<BrokerAddress> {
        self.table.load().active_peers(local_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.load().brokers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -- Guarded mutation ---------------------------------------------------

    fn mutate<R>(&self, guard: &BrokerListGuard<'_>, f: impl FnOnce(&mut BrokerTable) -> R) -> R {
        assert!(
            guard.belongs_to(&self.lock),
            "BrokerList mutated with a guard from another lock"
        );
        let mut next = BrokerTable::clone(&self.table.load());
        let result = f(&mut next);
        next.version += 1;
        self.table.store(Arc::new(next));
        result
    }

    /// Adds or replaces the entry for the broker's id.
    ///
    /// Returns the entry it replaced, if any.
    pub fn add_broker(
        &self,
        guard: &BrokerListGuard<'_>,
        broker: ClusteredBroker,
    ) -> Option<ClusteredBroker> {
        let id = broker.broker_id().to_string();
        let previous = self.mutate(guard, |t| t.brokers.insert(id.clone(), broker));
        if previous.is_none() {
            info!("broker {} added to cluster membership", id);
        }
        previous
    }

    pub fn remove_broker(
        &self,
        guard: &BrokerListGuard<'_>,
        broker_id: &str,
    ) -> Option<ClusteredBroker> {
        let removed = self.mutate(guard, |t| t.brokers.remove(broker_id));
        if removed.is_some() {
            info!("broker {} removed from cluster membership", broker_id);
        }
        removed
    }

    /// Applies `f` to an existing entry. Returns `false` if no such broker.
    pub fn update_entry(
        &self,
        guard: &BrokerListGuard<'_>,
        broker_id: &str,
        f: impl FnOnce(&mut ClusteredBroker),
    ) -> bool {
        self.mutate(guard, |t| match t.brokers.get_mut(broker_id) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        })
    }

    /// Records a state change, logging the transition.
    pub fn set_state(
        &self,
        guard: &BrokerListGuard<'_>,
        broker_id: &str,
        state: BrokerState,
    ) -> bool {
        let mut from = None;
        let found = self.update_entry(guard, broker_id, |b| {
            from = Some(b.state);
            b.state = state;
        });
        if let Some(from) = from.filter(|from| *from != state) {
            info!("broker {} state {} -> {}", broker_id, from, state);
        }
        found
    }

    pub fn set_master(&self, guard: &BrokerListGuard<'_>, broker_id: Option<String>) {
        self.mutate(guard, |t| t.master = broker_id);
    }
}
