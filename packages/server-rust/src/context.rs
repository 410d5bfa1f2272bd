//! Shared dependencies of one cluster node, built once at startup.

use std::sync::Arc;

use mqcluster_core::{BrokerSessionUid, ClockSource, ClusterPacket, UidGenerator};
use tracing::debug;

use crate::cluster::broker_list::BrokerList;
use crate::cluster::connection::PeerSender;
use crate::cluster::reply::ReplyTracker;
use crate::cluster::types::BrokerAddress;
use crate::config::ClusterConfig;
use crate::shutdown::NodeLifecycle;
use crate::store::{ConfigChangeStore, HaStore};

/// Everything a cluster component needs, passed by `Arc`.
pub struct BrokerContext {
    pub config: Arc<ClusterConfig>,
    pub clock: Arc<dyn ClockSource>,
    pub uids: Arc<UidGenerator>,
    pub brokers: Arc<BrokerList>,
    pub store: Arc<dyn HaStore>,
    pub config_store: Arc<dyn ConfigChangeStore>,
    pub replies: Arc<ReplyTracker>,
    pub peers: Arc<dyn PeerSender>,
    pub lifecycle: Arc<NodeLifecycle>,
    /// This broker, with the port actually bound.
    pub local: BrokerAddress,
}

impl BrokerContext {
    /// Mints a fresh broker session and assembles the context.
    ///
    /// `port` is the bound cluster port, which differs from the configured
    /// one when that was 0.
    #[must_use]
    pub fn new(
        config: ClusterConfig,
        port: u16,
        clock: Arc<dyn ClockSource>,
        store: Arc<dyn HaStore>,
        config_store: Arc<dyn ConfigChangeStore>,
        peers: Arc<dyn PeerSender>,
    ) -> Arc<Self> {
        let uids = Arc::new(UidGenerator::new(Arc::clone(&clock)));
        let local = BrokerAddress::new(
            config.broker_id.clone(),
            config.host.clone(),
            port,
            uids.broker_session(),
        );
        Arc::new(Self {
            config: Arc::new(config),
            clock,
            uids,
            brokers: Arc::new(BrokerList::new()),
            store,
            config_store,
            replies: Arc::new(ReplyTracker::new()),
            peers,
            lifecycle: Arc::new(NodeLifecycle::new()),
            local,
        })
    }

    #[must_use]
    pub fn broker_id(&self) -> &str {
        self.local.broker_id()
    }

    #[must_use]
    pub fn broker_session(&self) -> BrokerSessionUid {
        self.local.broker_session()
    }

    #[must_use]
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Fresh reply correlation id.
    #[must_use]
    pub fn next_xid(&self) -> u64 {
        self.uids.next_id()
    }

    /// Live peers other than this broker.
    #[must_use]
    pub fn active_peers(&self) -> Vec<BrokerAddress> {
        self.brokers.active_peers(self.broker_id())
    }

    /// Sends `packet` to each of `to`. Returns the peers it could not reach.
    pub async fn send_all(
        &self,
        to: &[BrokerAddress],
        packet: &ClusterPacket,
    ) -> Vec<BrokerAddress> {
        let mut failed = Vec::new();
        for peer in to {
            if let Err(e) = self.peers.send(peer, packet.clone()).await {
                debug!("send to {peer} failed: {e}");
                failed.push(peer.clone());
            }
        }
        failed
    }
}
