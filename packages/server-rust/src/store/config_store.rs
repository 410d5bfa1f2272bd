//! Durable cluster configuration change records and the master designation.

use async_trait::async_trait;

use crate::cluster::messages::ChangeRecord;

/// Storage for the change records replicated during a master handover.
///
/// A staged change set is keyed by the handover UUID. Staging the same UUID
/// twice leaves the first staging untouched.
///
/// Used as `Arc<dyn ConfigChangeStore>`.
#[async_trait]
pub trait ConfigChangeStore: Send + Sync {
    /// Committed change records, oldest first.
    async fn records(&self) -> anyhow::Result<Vec<ChangeRecord>>;

    /// Appends a committed change record and returns its sequence number.
    async fn append(&self, record: ChangeRecord) -> anyhow::Result<u64>;

    /// Stages `records` under `uuid`. Returns `false` if `uuid` was already
    /// staged, in which case nothing changes.
    ///
    /// Fails unless the first record is a reset.
    async fn stage(&self, uuid: &str, records: Vec<ChangeRecord>) -> anyhow::Result<bool>;

    /// Number of records staged under `uuid`.
    async fn staged_count(&self, uuid: &str) -> anyhow::Result<usize>;

    /// Replaces the committed records with the set staged under `uuid`.
    async fn commit(&self, uuid: &str) -> anyhow::Result<()>;

    /// Drops whatever is staged under `uuid`.
    async fn discard(&self, uuid: &str) -> anyhow::Result<()>;

    async fn master(&self) -> anyhow::Result<Option<String>>;

    async fn set_master(&self, broker_id: &str) -> anyhow::Result<()>;
}
