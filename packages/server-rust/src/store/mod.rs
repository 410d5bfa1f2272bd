//! Persistent store capabilities consumed by the cluster core.
//!
//! - [`HaStore`]: heartbeats, broker states, and the store-mediated takeover
//!   lock and ownership switch
//! - [`ConfigChangeStore`]: change records and the master designation used
//!   by the master handover
//!
//! [`memory`] provides mutex-backed implementations of both.

pub mod config_store;
pub mod ha_store;
pub mod memory;

pub use config_store::ConfigChangeStore;
pub use ha_store::{BrokerRecord, HaStore, StoredDestination, TakenStore, TakeoverLock};
pub use memory::{MemoryConfigChangeStore, MemoryHaStore, StoreOp};
