//! Inbound packet dispatch for one cluster node.
//!
//! [`ProtocolHandler`] is the [`LinkHandler`] every [`PeerLink`](super::connection::PeerLink)
//! reports to. Replies are routed to their waiters by xid; requests go to the
//! handover participant or the HA monitor and are answered with the status
//! code of the outcome.

use std::sync::Arc;

use async_trait::async_trait;
use mqcluster_core::{ClusterPacket, StoreSessionUid};
use tracing::{debug, info, warn};

use super::connection::LinkHandler;
use super::handover::HandoverParticipant;
use super::ha_monitor::HaMonitor;
use super::messages::{prop, reply_to, status, LinkInitPayload, PacketType};
use super::types::{BrokerAddress, BrokerState, ClusteredBroker};
use crate::context::BrokerContext;
use crate::error::ClusterError;

pub struct ProtocolHandler {
    ctx: Arc<BrokerContext>,
    participant: Arc<HandoverParticipant>,
    monitor: Arc<HaMonitor>,
}

impl ProtocolHandler {
    #[must_use]
    pub fn new(
        ctx: Arc<BrokerContext>,
        participant: Arc<HandoverParticipant>,
        monitor: Arc<HaMonitor>,
    ) -> Self {
        Self {
            ctx,
            participant,
            monitor,
        }
    }

    /// The `LINK_INIT` this node sends on every link.
    #[must_use]
    pub fn link_init(
        ctx: &BrokerContext,
        store_session: Option<StoreSessionUid>,
    ) -> LinkInitPayload {
        LinkInitPayload {
            address: ctx.local.clone(),
            ha: ctx.config.ha_enabled,
            store_session,
            master: ctx.brokers.master(),
        }
    }

    async fn dispatch(
        &self,
        from: &BrokerAddress,
        kind: PacketType,
        packet: &ClusterPacket,
    ) -> Result<(), ClusterError> {
        match kind {
            PacketType::NewMasterBrokerPrepare => self.participant.on_prepare(from, packet).await,
            PacketType::NewMasterBroker => self.participant.on_new_master(from, packet).await,
            PacketType::TakeoverPending => self.monitor.on_takeover_pending(from, packet),
            PacketType::TakeoverComplete => self.monitor.on_takeover_complete(from, packet),
            PacketType::TakeoverAbort => self.monitor.on_takeover_abort(from, packet),
            PacketType::Heartbeat => Ok(()),
            PacketType::LinkInit | PacketType::Goodbye => Err(ClusterError::rejected(
                status::BAD_REQUEST,
                format!("unexpected {} on an established link", kind.name()),
            )),
            PacketType::TakeoverPendingReply
            | PacketType::NewMasterBrokerPrepareReply
            | PacketType::NewMasterBrokerReply => Ok(()),
        }
    }

    fn route_reply(&self, from: &BrokerAddress, kind: PacketType, packet: ClusterPacket) {
        match packet.require_u64(prop::XID) {
            Ok(xid) => {
                if !self.ctx.replies.on_reply(xid, from, packet) {
                    debug!("{} {xid} from {from} arrived after its waiter ended", kind.name());
                }
            }
            Err(e) => warn!("dropping {} from {from}: {e}", kind.name()),
        }
    }
}

#[async_trait]
impl LinkHandler for ProtocolHandler {
    async fn on_link_up(&self, peer: &LinkInitPayload) {
        let brokers = &self.ctx.brokers;
        {
            let guard = brokers.lock();
            let found = brokers.update_entry(&guard, peer.address.broker_id(), |entry| {
                entry.address = peer.address.clone();
                entry.is_up = true;
                entry.in_doubt = false;
                if peer.store_session.is_some() {
                    entry.store_session = peer.store_session;
                }
            });
            if !found {
                let mut entry = ClusteredBroker::new(peer.address.clone(), BrokerState::Operating);
                entry.is_up = true;
                entry.store_session = peer.store_session;
                brokers.add_broker(&guard, entry);
            }
            match (brokers.master(), peer.master.as_ref()) {
                (None, Some(master)) => {
                    info!("Learned master broker {master} from {}", peer.address);
                    brokers.set_master(&guard, Some(master.clone()));
                }
                (Some(ours), Some(theirs)) if ours != *theirs => warn!(
                    "{} reports master {theirs}, this broker has {ours}",
                    peer.address
                ),
                _ => {}
            }
        }
        self.ctx.replies.add_broker(&peer.address);
        info!("Link to {} is up (ha={})", peer.address, peer.ha);
    }

    async fn on_packet(&self, from: &BrokerAddress, packet: ClusterPacket) {
        let Some(kind) = PacketType::from_u16(packet.packet_type()) else {
            warn!("unknown packet type {} from {from}", packet.packet_type());
            return;
        };
        if kind.is_reply() {
            self.route_reply(from, kind, packet);
            return;
        }

        let result = self.dispatch(from, kind, &packet).await;
        let (code, reason) = match &result {
            Ok(()) => (status::OK, None),
            Err(e) => {
                info!("{} from {from} refused: {e}", kind.name());
                (e.status_code(), Some(e.to_string()))
            }
        };
        let Some(reply) = reply_to(&packet, code, reason.as_deref()) else {
            return;
        };
        if let Err(e) = self.ctx.peers.send(from, reply).await {
            warn!("failed to answer {} from {from}: {e}", kind.name());
        }
    }

    async fn on_link_down(&self, peer: &BrokerAddress, goodbyed: bool) {
        self.ctx.replies.remove_broker(peer, goodbyed, false);
        {
            let guard = self.ctx.brokers.lock();
            self.ctx.brokers.update_entry(&guard, peer.broker_id(), |entry| {
                if entry.address == *peer {
                    entry.is_up = false;
                }
            });
        }
        self.participant.on_broker_down(peer).await;
        self.monitor.on_broker_down(peer);
        if goodbyed {
            info!("{peer} left the cluster");
        } else {
            warn!("Link to {peer} lost");
            if self.ctx.config.ha_enabled {
                self.monitor
                    .mark_in_doubt(peer.broker_id(), peer.broker_session());
            }
        }
    }
}
