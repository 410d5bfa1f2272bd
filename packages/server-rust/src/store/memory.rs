//! In-memory store implementations for tests and the standalone node.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use mqcluster_core::{BrokerSessionUid, StoreSessionUid, TransactionRecord, TransactionState};
use parking_lot::Mutex;

use super::config_store::ConfigChangeStore;
use super::ha_store::{BrokerRecord, HaStore, StoredDestination, TakenStore, TakeoverLock};
use crate::cluster::messages::ChangeRecord;
use crate::cluster::types::{BrokerAddress, BrokerState};
use crate::error::ClusterError;

// ---------------------------------------------------------------------------
// MemoryHaStore
// ---------------------------------------------------------------------------

/// Store operations that can be made to fail once, to exercise error paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    UpdateHeartbeat,
    ListStore,
    SwitchOwner,
    TakeOverStore,
    FailoverProcessed,
}

#[derive(Debug, Default)]
struct SessionData {
    owner: String,
    destinations: BTreeMap<String, bool>,
    messages: BTreeMap<String, String>,
    transactions: BTreeMap<u64, TransactionRecord>,
}

#[derive(Debug, Default)]
struct HaInner {
    brokers: HashMap<String, BrokerRecord>,
    sessions: HashMap<StoreSessionUid, SessionData>,
    /// Sessions moved away from a target by its takeover.
    moved: HashMap<String, Vec<StoreSessionUid>>,
    rolled_back: Vec<u64>,
}

impl HaInner {
    fn record_mut(&mut self, broker_id: &str) -> Result<&mut BrokerRecord, ClusterError> {
        self.brokers
            .get_mut(broker_id)
            .ok_or_else(|| ClusterError::UnknownBroker(broker_id.to_string()))
    }

    fn check_lock(&self, lock: &TakeoverLock) -> Result<&BrokerRecord, ClusterError> {
        let record = self
            .brokers
            .get(&lock.target)
            .ok_or_else(|| ClusterError::UnknownBroker(lock.target.clone()))?;
        if record.taker.as_deref() == Some(lock.taker.as_str()) {
            Ok(record)
        } else {
            Err(ClusterError::TakeoverLockLost {
                broker: lock.target.clone(),
            })
        }
    }

    fn contents(
        &self,
        sessions: &[StoreSessionUid],
        store_session: Option<StoreSessionUid>,
    ) -> TakenStore {
        let mut taken = TakenStore {
            store_session,
            sessions: sessions.to_vec(),
            ..TakenStore::default()
        };
        for ss in sessions {
            let Some(data) = self.sessions.get(ss) else {
                continue;
            };
            taken
                .destinations
                .extend(data.destinations.iter().map(|(name, is_queue)| StoredDestination {
                    name: name.clone(),
                    is_queue: *is_queue,
                }));
            taken
                .messages
                .extend(data.messages.iter().map(|(m, d)| (m.clone(), d.clone())));
            taken.transactions.extend(data.transactions.values().cloned());
        }
        taken
    }

    fn owned_by(&self, broker_id: &str) -> Vec<StoreSessionUid> {
        let mut owned: Vec<_> = self
            .sessions
            .iter()
            .filter(|(_, data)| data.owner == broker_id)
            .map(|(ss, _)| *ss)
            .collect();
        owned.sort_unstable();
        owned
    }

    fn switch_owner(&mut self, lock: &TakeoverLock) -> Result<Vec<StoreSessionUid>, ClusterError> {
        let record = self.check_lock(lock)?;
        if record.state != BrokerState::FailoverStarted {
            return Err(ClusterError::Store(anyhow!(
                "owner switch of {} expects FAILOVER_STARTED, found {}",
                lock.target,
                record.state
            )));
        }
        let moved = self.owned_by(&lock.target);
        for ss in &moved {
            if let Some(data) = self.sessions.get_mut(ss) {
                data.owner.clone_from(&lock.taker);
            }
        }
        self.moved.insert(lock.target.clone(), moved.clone());
        self.record_mut(&lock.target)?.state = BrokerState::FailoverComplete;
        Ok(moved)
    }
}

/// [`HaStore`] backed by a mutex-guarded map.
///
/// Every operation runs entirely under one lock, so compare-and-set
/// semantics hold across concurrent tasks.
#[derive(Debug, Default)]
pub struct MemoryHaStore {
    inner: Mutex<HaInner>,
    db_switch: bool,
    failures: Mutex<HashSet<StoreOp>>,
}

impl MemoryHaStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose ownership moves through a separate owner switch.
    #[must_use]
    pub fn with_db_switch() -> Self {
        Self {
            db_switch: true,
            ..Self::default()
        }
    }

    /// Makes the next call of `op` fail.
    pub fn fail_next(&self, op: StoreOp) {
        self.failures.lock().insert(op);
    }

    pub fn put_destination(&self, ss: StoreSessionUid, name: &str, is_queue: bool) {
        self.inner
            .lock()
            .sessions
            .entry(ss)
            .or_default()
            .destinations
            .insert(name.to_string(), is_queue);
    }

    pub fn put_message(&self, ss: StoreSessionUid, message_id: &str, destination: &str) {
        self.inner
            .lock()
            .sessions
            .entry(ss)
            .or_default()
            .messages
            .insert(message_id.to_string(), destination.to_string());
    }

    pub fn put_transaction(&self, ss: StoreSessionUid, record: TransactionRecord) {
        self.inner
            .lock()
            .sessions
            .entry(ss)
            .or_default()
            .transactions
            .insert(record.tid, record);
    }

    /// Broker id owning `ss`, if the session exists.
    #[must_use]
    pub fn owner_of(&self, ss: StoreSessionUid) -> Option<String> {
        self.inner.lock().sessions.get(&ss).map(|d| d.owner.clone())
    }

    #[must_use]
    pub fn rolled_back(&self) -> Vec<u64> {
        self.inner.lock().rolled_back.clone()
    }

    fn check_failure(&self, op: StoreOp) -> Result<(), ClusterError> {
        if self.failures.lock().remove(&op) {
            Err(ClusterError::Store(anyhow!("injected failure in {op:?}")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl HaStore for MemoryHaStore {
    async fn register_broker(
        &self,
        address: &BrokerAddress,
        store_session: Option<StoreSessionUid>,
        now_ms: u64,
    ) -> Result<BrokerRecord, ClusterError> {
        let mut inner = self.inner.lock();
        let record = BrokerRecord {
            address: address.clone(),
            state: BrokerState::Operating,
            heartbeat_ms: now_ms,
            store_session,
            taker: None,
        };
        if let Some(ss) = store_session {
            inner.sessions.entry(ss).or_default().owner = address.broker_id().to_string();
        }
        inner
            .brokers
            .insert(address.broker_id().to_string(), record.clone());
        Ok(record)
    }

    async fn update_heartbeat(
        &self,
        broker_id: &str,
        broker_session: BrokerSessionUid,
        now_ms: u64,
    ) -> Result<u64, ClusterError> {
        self.check_failure(StoreOp::UpdateHeartbeat)?;
        let mut inner = self.inner.lock();
        let record = inner.record_mut(broker_id)?;
        if record.broker_session() != broker_session {
            return Err(ClusterError::Store(anyhow!(
                "heartbeat of {broker_id} from superseded session {broker_session}"
            )));
        }
        record.heartbeat_ms = now_ms;
        Ok(now_ms)
    }

    async fn broker_record(&self, broker_id: &str) -> Result<Option<BrokerRecord>, ClusterError> {
        Ok(self.inner.lock().brokers.get(broker_id).cloned())
    }

    async fn all_brokers(&self) -> Result<Vec<BrokerRecord>, ClusterError> {
        let mut all: Vec<_> = self.inner.lock().brokers.values().cloned().collect();
        all.sort_by(|a, b| a.broker_id().cmp(b.broker_id()));
        Ok(all)
    }

    async fn update_state(&self, broker_id: &str, state: BrokerState) -> Result<(), ClusterError> {
        self.inner.lock().record_mut(broker_id)?.state = state;
        Ok(())
    }

    async fn acquire_takeover_lock(
        &self,
        target: &str,
        taker: &str,
        last_heartbeat_ms: u64,
        expected_state: BrokerState,
        now_ms: u64,
    ) -> Result<TakeoverLock, ClusterError> {
        let mut inner = self.inner.lock();
        let record = inner.record_mut(target)?;
        if target == taker {
            return Err(ClusterError::NotAllowed {
                broker: target.to_string(),
                state: record.state,
            });
        }
        if record.heartbeat_ms != last_heartbeat_ms
            || record.state != expected_state
            || record.taker.is_some()
        {
            return Err(ClusterError::TakeoverLockLost {
                broker: target.to_string(),
            });
        }
        let lock = TakeoverLock {
            target: target.to_string(),
            taker: taker.to_string(),
            store_session: record.store_session,
            broker_session: record.broker_session(),
            previous_state: record.state,
            previous_heartbeat_ms: record.heartbeat_ms,
        };
        record.state = BrokerState::FailoverPending;
        record.heartbeat_ms = now_ms;
        record.taker = Some(taker.to_string());
        Ok(lock)
    }

    async fn release_takeover_lock(&self, lock: &TakeoverLock) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock();
        let record = inner.record_mut(&lock.target)?;
        let held = record.taker.as_deref() == Some(lock.taker.as_str());
        if !held
            || !matches!(
                record.state,
                BrokerState::FailoverPending | BrokerState::FailoverStarted
            )
        {
            return Ok(());
        }
        record.state = lock.previous_state;
        record.heartbeat_ms = lock.previous_heartbeat_ms;
        record.taker = None;
        Ok(())
    }

    async fn list_store(&self, lock: &TakeoverLock) -> Result<TakenStore, ClusterError> {
        self.check_failure(StoreOp::ListStore)?;
        let inner = self.inner.lock();
        inner.check_lock(lock)?;
        let sessions = inner.owned_by(&lock.target);
        Ok(inner.contents(&sessions, lock.store_session))
    }

    fn supports_db_switch(&self) -> bool {
        self.db_switch
    }

    async fn switch_db_owner(
        &self,
        lock: &TakeoverLock,
    ) -> Result<Vec<StoreSessionUid>, ClusterError> {
        self.check_failure(StoreOp::SwitchOwner)?;
        self.inner.lock().switch_owner(lock)
    }

    async fn take_over_store(&self, lock: &TakeoverLock) -> Result<TakenStore, ClusterError> {
        self.check_failure(StoreOp::TakeOverStore)?;
        let mut inner = self.inner.lock();
        let state = inner.check_lock(lock)?.state;
        if state == BrokerState::FailoverStarted {
            inner.switch_owner(lock)?;
        }
        let moved = inner.moved.get(&lock.target).cloned().unwrap_or_default();
        Ok(inner.contents(&moved, lock.store_session))
    }

    async fn set_state_failover_processed(
        &self,
        target: &str,
        store_session: StoreSessionUid,
    ) -> Result<(), ClusterError> {
        self.check_failure(StoreOp::FailoverProcessed)?;
        let mut inner = self.inner.lock();
        let record = inner.record_mut(target)?;
        if record.store_session != Some(store_session) {
            return Err(ClusterError::Store(anyhow!(
                "store session {store_session} is not the current session of {target}"
            )));
        }
        record.state = BrokerState::FailoverProcessed;
        record.taker = None;
        Ok(())
    }

    async fn set_state_failover_failed(
        &self,
        target: &str,
        broker_session: BrokerSessionUid,
    ) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock();
        let record = inner.record_mut(target)?;
        if record.broker_session() != broker_session {
            return Err(ClusterError::Store(anyhow!(
                "broker session {broker_session} is not the current session of {target}"
            )));
        }
        record.state = BrokerState::FailoverFailed;
        record.taker = None;
        Ok(())
    }

    async fn rollback_transaction(&self, tid: u64) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock();
        let found = inner
            .sessions
            .values_mut()
            .find_map(|data| data.transactions.get_mut(&tid));
        let Some(record) = found else {
            return Err(ClusterError::Store(anyhow!("transaction {tid} not found")));
        };
        if record.state == TransactionState::RolledBack {
            return Ok(());
        }
        record.state = TransactionState::RolledBack;
        inner.rolled_back.push(tid);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryConfigChangeStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ConfigInner {
    records: Vec<ChangeRecord>,
    staged: HashMap<String, Vec<ChangeRecord>>,
    master: Option<String>,
    next_seq: u64,
}

/// [`ConfigChangeStore`] backed by a mutex-guarded vector.
#[derive(Debug, Default)]
pub struct MemoryConfigChangeStore {
    inner: Mutex<ConfigInner>,
}

impl MemoryConfigChangeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already names `master`.
    #[must_use]
    pub fn with_master(master: &str) -> Self {
        let store = Self::default();
        store.inner.lock().master = Some(master.to_string());
        store
    }
}

#[async_trait]
impl ConfigChangeStore for MemoryConfigChangeStore {
    async fn records(&self) -> anyhow::Result<Vec<ChangeRecord>> {
        Ok(self.inner.lock().records.clone())
    }

    async fn append(&self, mut record: ChangeRecord) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock();
        inner.next_seq += 1;
        record.seq = inner.next_seq;
        inner.records.push(record);
        Ok(inner.next_seq)
    }

    async fn stage(&self, uuid: &str, records: Vec<ChangeRecord>) -> anyhow::Result<bool> {
        if !records.first().is_some_and(ChangeRecord::is_reset) {
            bail!("first record must be RESET");
        }
        let mut inner = self.inner.lock();
        if inner.staged.contains_key(uuid) {
            return Ok(false);
        }
        inner.staged.insert(uuid.to_string(), records);
        Ok(true)
    }

    async fn staged_count(&self, uuid: &str) -> anyhow::Result<usize> {
        Ok(self.inner.lock().staged.get(uuid).map_or(0, Vec::len))
    }

    async fn commit(&self, uuid: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let staged = inner
            .staged
            .remove(uuid)
            .ok_or_else(|| anyhow!("nothing staged under {uuid}"))?;
        inner.next_seq = staged.iter().map(|r| r.seq).max().unwrap_or(0);
        inner.records = staged;
        Ok(())
    }

    async fn discard(&self, uuid: &str) -> anyhow::Result<()> {
        self.inner.lock().staged.remove(uuid);
        Ok(())
    }

    async fn master(&self) -> anyhow::Result<Option<String>> {
        Ok(self.inner.lock().master.clone())
    }

    async fn set_master(&self, broker_id: &str) -> anyhow::Result<()> {
        self.inner.lock().master = Some(broker_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cluster::messages::ChangeKind;

    fn addr(id: &str, bs: u64) -> BrokerAddress {
        BrokerAddress::new(id, "127.0.0.1", 7676, BrokerSessionUid(bs))
    }

    async fn store_with_b1() -> MemoryHaStore {
        let store = MemoryHaStore::new();
        store
            .register_broker(&addr("b1", 1), Some(StoreSessionUid(100)), 1_000)
            .await
            .unwrap();
        store.put_destination(StoreSessionUid(100), "orders", true);
        store.put_message(StoreSessionUid(100), "m1", "orders");
        store
    }

    #[tokio::test]
    async fn exactly_one_concurrent_lock_attempt_wins() {
        let store = Arc::new(store_with_b1().await);
        let mut tasks = Vec::new();
        for taker in ["b2", "b3", "b4"] {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store
                    .acquire_takeover_lock("b1", taker, 1_000, BrokerState::Operating, 2_000)
                    .await
            }));
        }
        let mut won = 0;
        let mut lost = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => won += 1,
                Err(err) => {
                    assert!(err.is_race_loss());
                    lost += 1;
                }
            }
        }
        assert_eq!((won, lost), (1, 2));
        let record = store.broker_record("b1").await.unwrap().unwrap();
        assert_eq!(record.state, BrokerState::FailoverPending);
    }

    #[tokio::test]
    async fn stale_heartbeat_or_state_loses_the_race() {
        let store = store_with_b1().await;
        assert!(store
            .acquire_takeover_lock("b1", "b2", 999, BrokerState::Operating, 2_000)
            .await
            .unwrap_err()
            .is_race_loss());
        assert!(store
            .acquire_takeover_lock("b1", "b2", 1_000, BrokerState::ShutdownFailover, 2_000)
            .await
            .unwrap_err()
            .is_race_loss());
        assert!(matches!(
            store
                .acquire_takeover_lock("b1", "b1", 1_000, BrokerState::Operating, 2_000)
                .await,
            Err(ClusterError::NotAllowed { .. })
        ));
    }

    #[tokio::test]
    async fn release_restores_the_row() {
        let store = store_with_b1().await;
        let lock = store
            .acquire_takeover_lock("b1", "b2", 1_000, BrokerState::Operating, 2_000)
            .await
            .unwrap();
        store.release_takeover_lock(&lock).await.unwrap();
        let record = store.broker_record("b1").await.unwrap().unwrap();
        assert_eq!(record.state, BrokerState::Operating);
        assert_eq!(record.heartbeat_ms, 1_000);
        assert_eq!(record.taker, None);
        assert_eq!(store.owner_of(StoreSessionUid(100)).as_deref(), Some("b1"));
    }

    #[tokio::test]
    async fn owner_switch_moves_every_session() {
        let store = MemoryHaStore::with_db_switch();
        store
            .register_broker(&addr("b1", 1), Some(StoreSessionUid(100)), 1_000)
            .await
            .unwrap();
        store.put_message(StoreSessionUid(101), "m9", "t1");
        store.inner.lock().sessions.get_mut(&StoreSessionUid(101)).unwrap().owner = "b1".into();

        let lock = store
            .acquire_takeover_lock("b1", "b2", 1_000, BrokerState::Operating, 2_000)
            .await
            .unwrap();
        let listed = store.list_store(&lock).await.unwrap();
        assert_eq!(listed.messages.get("m9").map(String::as_str), Some("t1"));

        assert!(store.switch_db_owner(&lock).await.is_err());
        store.update_state("b1", BrokerState::FailoverStarted).await.unwrap();
        let moved = store.switch_db_owner(&lock).await.unwrap();
        assert_eq!(moved, vec![StoreSessionUid(100), StoreSessionUid(101)]);
        assert_eq!(store.owner_of(StoreSessionUid(101)).as_deref(), Some("b2"));

        let taken = store.take_over_store(&lock).await.unwrap();
        assert_eq!(taken.sessions.len(), 2);
        store.release_takeover_lock(&lock).await.unwrap();
        assert_eq!(store.owner_of(StoreSessionUid(100)).as_deref(), Some("b2"));
    }

    #[tokio::test]
    async fn failover_marks_check_sessions() {
        let store = store_with_b1().await;
        assert!(store
            .set_state_failover_processed("b1", StoreSessionUid(7))
            .await
            .is_err());
        store
            .set_state_failover_processed("b1", StoreSessionUid(100))
            .await
            .unwrap();
        assert!(store
            .set_state_failover_failed("b1", BrokerSessionUid(2))
            .await
            .is_err());
        store
            .set_state_failover_failed("b1", BrokerSessionUid(1))
            .await
            .unwrap();
        let record = store.broker_record("b1").await.unwrap().unwrap();
        assert_eq!(record.state, BrokerState::FailoverFailed);
    }

    #[tokio::test]
    async fn heartbeat_from_old_incarnation_is_refused() {
        let store = store_with_b1().await;
        assert_eq!(
            store.update_heartbeat("b1", BrokerSessionUid(1), 5).await.unwrap(),
            5
        );
        assert!(store.update_heartbeat("b1", BrokerSessionUid(0), 6).await.is_err());
        store.fail_next(StoreOp::UpdateHeartbeat);
        assert!(store.update_heartbeat("b1", BrokerSessionUid(1), 7).await.is_err());
        assert!(store.update_heartbeat("b1", BrokerSessionUid(1), 8).await.is_ok());
    }

    #[tokio::test]
    async fn rollback_updates_the_stored_transaction() {
        let store = store_with_b1().await;
        store.put_transaction(StoreSessionUid(100), TransactionRecord::new(42, "u", "c", 0));
        store.rollback_transaction(42).await.unwrap();
        assert_eq!(store.rolled_back(), vec![42]);
        assert!(store.rollback_transaction(43).await.is_err());
    }

    #[tokio::test]
    async fn repeated_rollback_is_recorded_once() {
        let store = store_with_b1().await;
        store.put_transaction(StoreSessionUid(100), TransactionRecord::new(42, "u", "c", 0));
        store.rollback_transaction(42).await.unwrap();
        store.rollback_transaction(42).await.unwrap();
        assert_eq!(store.rolled_back(), vec![42]);
    }

    #[tokio::test]
    async fn staging_is_idempotent_per_uuid() {
        let store = MemoryConfigChangeStore::new();
        let records = vec![
            ChangeRecord::reset("r1"),
            ChangeRecord {
                uuid: "c1".into(),
                seq: 1,
                kind: ChangeKind::AddDestination {
                    name: "q".into(),
                    is_queue: true,
                },
            },
        ];
        assert!(store.stage("h1", records.clone()).await.unwrap());
        assert!(!store.stage("h1", records).await.unwrap());
        assert_eq!(store.staged_count("h1").await.unwrap(), 2);

        store.commit("h1").await.unwrap();
        assert_eq!(store.records().await.unwrap().len(), 2);
        assert_eq!(store.staged_count("h1").await.unwrap(), 0);
        assert!(store.commit("h1").await.is_err());
    }

    #[tokio::test]
    async fn staging_requires_leading_reset() {
        let store = MemoryConfigChangeStore::new();
        let err = store
            .stage(
                "h1",
                vec![ChangeRecord {
                    uuid: "c".into(),
                    seq: 1,
                    kind: ChangeKind::AddDurable {
                        name: "d".into(),
                        client_id: "c".into(),
                    },
                }],
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("RESET"));
        assert!(store.stage("h2", Vec::new()).await.is_err());
    }
}
