//! `mqcluster` server: broker membership, master handover, HA takeover, and
//! the transaction event log for a clustered message broker.

pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod node;
pub mod shutdown;
pub mod store;
pub mod txnlog;

#[cfg(test)]
mod testing;

pub use config::ClusterConfig;
pub use context::BrokerContext;
pub use error::ClusterError;
pub use node::{ClusterNode, NodeServices};
