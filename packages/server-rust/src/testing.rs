//! In-process stand-ins for peers and a ready-made node context, shared by
//! the protocol tests.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use mqcluster_core::{ClusterPacket, ManualClock};
use parking_lot::Mutex;

use crate::cluster::connection::{PeerSender, SendError};
use crate::cluster::messages::{prop, reply_to, status, PacketType};
use crate::cluster::reply::ReplyTracker;
use crate::cluster::types::{BrokerAddress, BrokerState, ClusteredBroker};
use crate::config::ClusterConfig;
use crate::context::BrokerContext;
use crate::store::{MemoryConfigChangeStore, MemoryHaStore};

pub(crate) type Responder =
    dyn Fn(&BrokerAddress, &ClusterPacket) -> Option<ClusterPacket> + Send + Sync;

/// Records every packet sent and, when a responder is set, feeds its answer
/// straight back into the reply tracker as if the peer had replied.
#[derive(Default)]
pub(crate) struct CapturingPeers {
    sent: Mutex<Vec<(BrokerAddress, ClusterPacket)>>,
    connected: Mutex<Vec<BrokerAddress>>,
    unreachable: Mutex<HashSet<String>>,
    responder: Mutex<Option<Arc<Responder>>>,
    replies: OnceLock<Arc<ReplyTracker>>,
}

impl CapturingPeers {
    pub(crate) fn attach(&self, replies: Arc<ReplyTracker>) {
        let _ = self.replies.set(replies);
    }

    pub(crate) fn connect(&self, peer: &BrokerAddress) {
        self.connected.lock().push(peer.clone());
    }

    pub(crate) fn set_unreachable(&self, broker_id: &str) {
        self.unreachable.lock().insert(broker_id.to_string());
    }

    pub(crate) fn respond_with(
        &self,
        responder: impl Fn(&BrokerAddress, &ClusterPacket) -> Option<ClusterPacket>
            + Send
            + Sync
            + 'static,
    ) {
        let responder: Arc<Responder> = Arc::new(responder);
        *self.responder.lock() = Some(responder);
    }

    /// Every peer answers every request with OK.
    pub(crate) fn always_ok(&self) {
        self.respond_with(|_, pkt| reply_to(pkt, status::OK, None));
    }

    pub(crate) fn sent(&self) -> Vec<(BrokerAddress, ClusterPacket)> {
        self.sent.lock().clone()
    }

    pub(crate) fn sent_of(&self, packet_type: PacketType) -> Vec<(BrokerAddress, ClusterPacket)> {
        self.sent()
            .into_iter()
            .filter(|(_, p)| p.packet_type() == packet_type.as_u16())
            .collect()
    }
}

#[async_trait]
impl PeerSender for CapturingPeers {
    async fn send(&self, to: &BrokerAddress, packet: ClusterPacket) -> Result<(), SendError> {
        if self.unreachable.lock().contains(to.broker_id()) {
            return Err(SendError::Disconnected);
        }
        self.sent.lock().push((to.clone(), packet.clone()));
        let responder = self.responder.lock().clone();
        if let (Some(responder), Some(replies)) = (responder, self.replies.get()) {
            if let Some(reply) = responder(to, &packet) {
                if let Ok(xid) = reply.require_u64(prop::XID) {
                    replies.on_reply(xid, to, reply);
                }
            }
        }
        Ok(())
    }

    fn connected_peers(&self) -> Vec<BrokerAddress> {
        self.connected.lock().clone()
    }
}

pub(crate) struct TestNode {
    pub ctx: Arc<BrokerContext>,
    pub peers: Arc<CapturingPeers>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryHaStore>,
    pub config_store: Arc<MemoryConfigChangeStore>,
}

pub(crate) fn test_config(broker_id: &str) -> ClusterConfig {
    ClusterConfig {
        broker_id: broker_id.to_string(),
        host: "127.0.0.1".to_string(),
        heartbeat_interval_ms: 1_000,
        monitor_interval_ms: 1_000,
        max_monitor_count: 3,
        reply_timeout_ms: 500,
        ..ClusterConfig::default()
    }
}

/// A node sharing `store` with its peers, its clock starting at `now`.
pub(crate) fn test_node(
    broker_id: &str,
    store: Arc<MemoryHaStore>,
    config_store: Arc<MemoryConfigChangeStore>,
    now: u64,
) -> TestNode {
    let clock = Arc::new(ManualClock::new(now));
    let peers = Arc::new(CapturingPeers::default());
    let ctx = BrokerContext::new(
        test_config(broker_id),
        7000,
        clock.clone(),
        store.clone(),
        config_store.clone(),
        peers.clone(),
    );
    peers.attach(Arc::clone(&ctx.replies));
    TestNode {
        ctx,
        peers,
        clock,
        store,
        config_store,
    }
}

/// Puts `peer` in the membership table as live and operating.
pub(crate) fn add_live_peer(ctx: &BrokerContext, peer: &BrokerAddress) {
    let mut entry = ClusteredBroker::new(peer.clone(), BrokerState::Operating);
    entry.is_up = true;
    let guard = ctx.brokers.lock();
    ctx.brokers.add_broker(&guard, entry);
}
