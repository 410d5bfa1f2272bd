//! Shared-store capability used for heartbeats and store takeover.
//!
//! The store is the arbiter of every takeover race: the takeover lock is an
//! atomic compare-and-set on the target's heartbeat and state, so at most one
//! broker ever wins it for a given heartbeat.

use std::collections::HashMap;

use async_trait::async_trait;
use mqcluster_core::{BrokerSessionUid, StoreSessionUid, TransactionRecord};
use serde::{Deserialize, Serialize};

use crate::cluster::types::{BrokerAddress, BrokerState};
use crate::error::ClusterError;

/// A broker's row in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerRecord {
    pub address: BrokerAddress,
    pub state: BrokerState,
    pub heartbeat_ms: u64,
    /// Store session the broker currently owns.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub store_session: Option<StoreSessionUid>,
    /// Broker id holding the takeover lock on this row, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub taker: Option<String>,
}

impl BrokerRecord {
    #[must_use]
    pub fn broker_id(&self) -> &str {
        self.address.broker_id()
    }

    #[must_use]
    pub fn broker_session(&self) -> BrokerSessionUid {
        self.address.broker_session()
    }
}

/// Proof of a won takeover race, plus what is needed to undo it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakeoverLock {
    pub target: String,
    pub taker: String,
    pub store_session: Option<StoreSessionUid>,
    pub broker_session: BrokerSessionUid,
    pub previous_state: BrokerState,
    pub previous_heartbeat_ms: u64,
}

/// A persisted destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDestination {
    pub name: String,
    pub is_queue: bool,
}

/// Contents of a taken-over store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TakenStore {
    pub store_session: Option<StoreSessionUid>,
    pub destinations: Vec<StoredDestination>,
    /// Message id to destination name.
    pub messages: HashMap<String, String>,
    pub transactions: Vec<TransactionRecord>,
    /// Every store session moved to the taker, the target's own included.
    pub sessions: Vec<StoreSessionUid>,
}

/// Persistent store operations needed by the HA monitor.
///
/// Used as `Arc<dyn HaStore>`.
#[async_trait]
pub trait HaStore: Send + Sync {
    /// Inserts or replaces the row for a starting broker.
    async fn register_broker(
        &self,
        address: &BrokerAddress,
        store_session: Option<StoreSessionUid>,
        now_ms: u64,
    ) -> Result<BrokerRecord, ClusterError>;

    /// Writes `now_ms` as the heartbeat of the given incarnation.
    ///
    /// Fails if the row belongs to another broker session.
    async fn update_heartbeat(
        &self,
        broker_id: &str,
        broker_session: BrokerSessionUid,
        now_ms: u64,
    ) -> Result<u64, ClusterError>;

    async fn broker_record(&self, broker_id: &str) -> Result<Option<BrokerRecord>, ClusterError>;

    async fn all_brokers(&self) -> Result<Vec<BrokerRecord>, ClusterError>;

    async fn update_state(&self, broker_id: &str, state: BrokerState) -> Result<(), ClusterError>;

    /// Atomically moves `target` from (`last_heartbeat_ms`, `expected_state`)
    /// to `FailoverPending` owned by `taker`.
    ///
    /// Returns [`ClusterError::TakeoverLockLost`] if the row no longer matches.
    async fn acquire_takeover_lock(
        &self,
        target: &str,
        taker: &str,
        last_heartbeat_ms: u64,
        expected_state: BrokerState,
        now_ms: u64,
    ) -> Result<TakeoverLock, ClusterError>;

    /// Restores the row captured in `lock`. A no-op once ownership moved.
    async fn release_takeover_lock(&self, lock: &TakeoverLock) -> Result<(), ClusterError>;

    /// Reads the target's store without changing ownership.
    async fn list_store(&self, lock: &TakeoverLock) -> Result<TakenStore, ClusterError>;

    /// Whether ownership moves through [`switch_db_owner`](Self::switch_db_owner).
    fn supports_db_switch(&self) -> bool;

    /// Moves every store session of the target to the taker in one step and
    /// sets the target to `FailoverComplete`. Returns the moved sessions.
    async fn switch_db_owner(&self, lock: &TakeoverLock)
        -> Result<Vec<StoreSessionUid>, ClusterError>;

    /// Completes the takeover and returns what now belongs to the taker.
    ///
    /// Performs the ownership move itself when the store has no separate
    /// owner switch.
    async fn take_over_store(&self, lock: &TakeoverLock) -> Result<TakenStore, ClusterError>;

    /// Marks `target` processed, only while `store_session` is its session.
    async fn set_state_failover_processed(
        &self,
        target: &str,
        store_session: StoreSessionUid,
    ) -> Result<(), ClusterError>;

    /// Marks the `broker_session` incarnation of `target` as failed over.
    async fn set_state_failover_failed(
        &self,
        target: &str,
        broker_session: BrokerSessionUid,
    ) -> Result<(), ClusterError>;

    /// Marks `tid` rolled back. Rolling back an already rolled-back
    /// transaction is a no-op.
    async fn rollback_transaction(&self, tid: u64) -> Result<(), ClusterError>;
}
