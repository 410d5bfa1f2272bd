//! Master broker handover.
//!
//! The current master stages its change records on every live peer under a
//! fresh UUID (`NEW_MASTER_BROKER_PREPARE`), commits only on unanimous OK,
//! then confirms with `NEW_MASTER_BROKER`. Any refusal, departure or timeout
//! during prepare aborts the handover cluster-wide.

use std::collections::VecDeque;
use std::sync::Arc;

use mqcluster_core::ClusterPacket;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::messages::{
    notification, prop, request, status, ChangeRecord, NewMasterPayload, NewMasterPreparePayload,
    PacketType,
};
use super::reply::{AllOk, ReplyOutcome, ReplyWaiter};
use super::types::BrokerAddress;
use crate::context::BrokerContext;
use crate::error::ClusterError;

// ---------------------------------------------------------------------------
// Initiator
// ---------------------------------------------------------------------------

pub struct HandoverCoordinator {
    ctx: Arc<BrokerContext>,
    running: Mutex<()>,
}

impl HandoverCoordinator {
    #[must_use]
    pub fn new(ctx: Arc<BrokerContext>) -> Self {
        Self {
            ctx,
            running: Mutex::new(()),
        }
    }

    /// Hands master authority to `new_master`. One handover runs at a time.
    ///
    /// # Errors
    ///
    /// - [`ClusterError::Rejected`] if this broker is not master, a peer
    ///   refused to stage, or the node is shutting down
    /// - [`ClusterError::UnknownBroker`] if `new_master` has no live link
    /// - [`ClusterError::Gone`] / [`ClusterError::Timeout`] if a peer left or
    ///   went silent during prepare
    pub async fn handover(&self, new_master: &BrokerAddress) -> Result<(), ClusterError> {
        let ctx = &self.ctx;
        let _op = ctx
            .lifecycle
            .begin_operation("handover")
            .ok_or_else(|| ClusterError::rejected(status::UNAVAILABLE, "node is shutting down"))?;
        let _running = self.running.lock().await;

        if !ctx.brokers.is_master(ctx.broker_id()) {
            return Err(ClusterError::rejected(
                status::PRECONDITION_FAILED,
                format!("{} is not the master broker", ctx.broker_id()),
            ));
        }
        if new_master.broker_id() == ctx.broker_id() {
            return Err(ClusterError::rejected(
                status::BAD_REQUEST,
                "already the master broker",
            ));
        }
        let peers = ctx.active_peers();
        if !peers.contains(new_master) {
            return Err(ClusterError::UnknownBroker(new_master.to_string()));
        }

        let uuid = Uuid::new_v4().to_string();
        let mut records = vec![ChangeRecord::reset(uuid.clone())];
        records.extend(
            ctx.config_store
                .records()
                .await?
                .into_iter()
                .filter(|r| !r.is_reset()),
        );
        info!(
            "Master handover {uuid}: preparing {} with {} change record(s) on {} peer(s)",
            new_master,
            records.len(),
            peers.len()
        );

        let xid = ctx.next_xid();
        let mut prepare = request(PacketType::NewMasterBrokerPrepare, xid);
        prepare.set_str(prop::UUID, uuid.as_str());
        prepare.set_payload_value(&NewMasterPreparePayload {
            new_master: new_master.clone(),
            records,
        })?;
        if let Err(e) = self.round_trip(xid, &peers, &prepare).await {
            warn!("Master handover {uuid} aborted during prepare: {e}");
            self.broadcast_abort(&uuid, new_master, &peers).await;
            return Err(e);
        }

        if let Err(e) = ctx.config_store.set_master(new_master.broker_id()).await {
            warn!("Master handover {uuid} aborted: recording the new master failed: {e}");
            self.broadcast_abort(&uuid, new_master, &peers).await;
            return Err(ClusterError::Store(e));
        }
        {
            let guard = ctx.brokers.lock();
            ctx.brokers
                .set_master(&guard, Some(new_master.broker_id().to_string()));
        }
        info!("Master handover {uuid}: {new_master} is the new master broker");

        let xid = ctx.next_xid();
        let confirm = new_master_packet(
            request(PacketType::NewMasterBroker, xid),
            &uuid,
            &ctx.local,
            new_master,
            true,
        )?;
        if let Err(e) = self.round_trip(xid, &peers, &confirm).await {
            warn!("Master handover {uuid}: confirmation incomplete: {e}");
        }
        Ok(())
    }

    async fn round_trip(
        &self,
        xid: u64,
        peers: &[BrokerAddress],
        packet: &ClusterPacket,
    ) -> Result<ReplyOutcome, ClusterError> {
        let ctx = &self.ctx;
        let waiter = ctx
            .replies
            .add_waiter(xid, ReplyWaiter::new(peers.iter().cloned(), AllOk));
        for unreachable in ctx.send_all(peers, packet).await {
            waiter.remove_participant(&unreachable, false, false);
        }
        ctx.replies
            .wait_for_reply(xid, ctx.config.reply_timeout())
            .await
    }

    async fn broadcast_abort(
        &self,
        uuid: &str,
        new_master: &BrokerAddress,
        peers: &[BrokerAddress],
    ) {
        let abort = match new_master_packet(
            notification(PacketType::NewMasterBroker),
            uuid,
            &self.ctx.local,
            new_master,
            false,
        ) {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to encode handover abort: {e}");
                return;
            }
        };
        let missed = self.ctx.send_all(peers, &abort).await;
        if !missed.is_empty() {
            warn!(
                "Master handover {uuid}: abort not delivered to {} peer(s)",
                missed.len()
            );
        }
    }
}

fn new_master_packet(
    mut packet: ClusterPacket,
    uuid: &str,
    old_master: &BrokerAddress,
    new_master: &BrokerAddress,
    commit: bool,
) -> Result<ClusterPacket, ClusterError> {
    packet.set_str(prop::UUID, uuid);
    packet.set_payload_value(&NewMasterPayload {
        old_master: old_master.clone(),
        new_master: new_master.clone(),
        commit,
    })?;
    Ok(packet)
}

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PendingHandover {
    uuid: String,
    from: BrokerAddress,
    new_master: BrokerAddress,
}

/// Finished handover UUIDs remembered to absorb late duplicate prepares.
const FINISHED_MEMORY: usize = 64;

#[derive(Default)]
struct ParticipantState {
    pending: Option<PendingHandover>,
    /// Committed or discarded UUIDs, oldest first.
    finished: VecDeque<String>,
}

impl ParticipantState {
    fn finish(&mut self, uuid: &str) {
        self.pending = None;
        if self.finished.len() == FINISHED_MEMORY {
            self.finished.pop_front();
        }
        self.finished.push_back(uuid.to_string());
    }
}

/// Peer side of the handover. One handover may be staged at a time.
pub struct HandoverParticipant {
    ctx: Arc<BrokerContext>,
    state: Mutex<ParticipantState>,
}

impl HandoverParticipant {
    #[must_use]
    pub fn new(ctx: Arc<BrokerContext>) -> Self {
        Self {
            ctx,
            state: Mutex::new(ParticipantState::default()),
        }
    }

    /// UUID of the staged handover, if any.
    pub async fn pending_uuid(&self) -> Option<String> {
        self.state.lock().await.pending.as_ref().map(|p| p.uuid.clone())
    }

    /// Stages a prepare from the master. A repeat of the staged UUID, or of
    /// a recently committed or discarded one, is answered OK without
    /// staging again.
    ///
    /// # Errors
    ///
    /// [`ClusterError::Rejected`] when the sender is not master, another
    /// handover is staged, or the records can not be staged.
    pub async fn on_prepare(
        &self,
        from: &BrokerAddress,
        packet: &ClusterPacket,
    ) -> Result<(), ClusterError> {
        let uuid = packet.require_str(prop::UUID)?.to_string();
        if self.ctx.brokers.master().as_deref() != Some(from.broker_id()) {
            return Err(ClusterError::rejected(
                status::PRECONDITION_FAILED,
                format!("{} is not the master broker", from.broker_id()),
            ));
        }

        let mut state = self.state.lock().await;
        if state.finished.contains(&uuid) {
            info!("Handover {uuid} from {from} already finished; ignoring late prepare");
            return Ok(());
        }
        if let Some(current) = state.pending.as_ref() {
            if current.uuid == uuid {
                info!("Handover {uuid} from {from} already staged; ignoring duplicate prepare");
                return Ok(());
            }
            return Err(ClusterError::rejected(
                status::CONFLICT,
                format!(
                    "handover in progress: {} to {}",
                    current.uuid,
                    current.new_master.broker_id()
                ),
            ));
        }

        let payload: NewMasterPreparePayload = packet.payload_value()?;
        let count = payload.records.len();
        let staged = self
            .ctx
            .config_store
            .stage(&uuid, payload.records)
            .await
            .map_err(|e| ClusterError::rejected(status::BAD_REQUEST, e.to_string()))?;
        if !staged {
            info!("Handover {uuid} found already staged in the config store");
        }
        info!(
            "Staged handover {uuid} from {from}: {count} record(s), new master {}",
            payload.new_master
        );
        state.pending = Some(PendingHandover {
            uuid,
            from: from.clone(),
            new_master: payload.new_master,
        });
        Ok(())
    }

    /// Commits or discards the staged handover named by the packet.
    ///
    /// # Errors
    ///
    /// [`ClusterError::Rejected`] if nothing matching is staged or the
    /// sender is not the broker that staged it.
    pub async fn on_new_master(
        &self,
        from: &BrokerAddress,
        packet: &ClusterPacket,
    ) -> Result<(), ClusterError> {
        let uuid = packet.require_str(prop::UUID)?;
        let payload: NewMasterPayload = packet.payload_value()?;

        let mut state = self.state.lock().await;
        let current = match state.pending.as_ref() {
            Some(p) if p.uuid == uuid => p.clone(),
            _ => {
                return Err(ClusterError::rejected(
                    status::NOT_FOUND,
                    format!("no staged handover {uuid}"),
                ))
            }
        };
        if current.from != *from || payload.old_master != *from {
            return Err(ClusterError::rejected(
                status::PRECONDITION_FAILED,
                format!("{} did not stage handover {uuid}", from.broker_id()),
            ));
        }
        state.finish(uuid);

        let config_store = &self.ctx.config_store;
        if !payload.commit {
            config_store.discard(uuid).await?;
            info!("Handover {uuid} aborted by {}", from.broker_id());
            return Ok(());
        }

        config_store.commit(uuid).await?;
        let new_master = current.new_master.broker_id();
        config_store.set_master(new_master).await?;
        if !self.ctx.brokers.is_master(new_master) {
            let guard = self.ctx.brokers.lock();
            self.ctx
                .brokers
                .set_master(&guard, Some(new_master.to_string()));
        }
        info!("Handover {uuid} committed: {new_master} is the new master broker");
        Ok(())
    }

    /// Drops a staged handover whose initiator left before confirming.
    pub async fn on_broker_down(&self, addr: &BrokerAddress) {
        let mut state = self.state.lock().await;
        let Some(current) = state.pending.as_ref().filter(|p| p.from == *addr) else {
            return;
        };
        let uuid = current.uuid.clone();
        state.finish(&uuid);
        drop(state);
        warn!("Master {} left before confirming handover {uuid}; discarding it", addr);
        if let Err(e) = self.ctx.config_store.discard(&uuid).await {
            warn!("failed to discard handover {uuid}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::messages::{reply_to, ChangeKind};
    use crate::store::{ConfigChangeStore, MemoryConfigChangeStore, MemoryHaStore};
    use crate::testing::{add_live_peer, test_node, TestNode};
    use mqcluster_core::BrokerSessionUid;

    fn addr(id: &str) -> BrokerAddress {
        BrokerAddress::new(id, "127.0.0.1", 7000, BrokerSessionUid(1))
    }

    fn node(id: &str, master: &str) -> TestNode {
        let n = test_node(
            id,
            Arc::new(MemoryHaStore::new()),
            Arc::new(MemoryConfigChangeStore::with_master(master)),
            1_000,
        );
        let guard = n.ctx.brokers.lock();
        n.ctx.brokers.set_master(&guard, Some(master.to_string()));
        drop(guard);
        n
    }

    fn prepare_from(
        uuid: &str,
        new_master: &BrokerAddress,
        records: Vec<ChangeRecord>,
    ) -> ClusterPacket {
        let mut pkt = request(PacketType::NewMasterBrokerPrepare, 42);
        pkt.set_str(prop::UUID, uuid);
        pkt.set_payload_value(&NewMasterPreparePayload {
            new_master: new_master.clone(),
            records,
        })
        .unwrap();
        pkt
    }

    fn change_set(uuid: &str) -> Vec<ChangeRecord> {
        vec![
            ChangeRecord::reset(uuid),
            ChangeRecord {
                uuid: uuid.into(),
                seq: 1,
                kind: ChangeKind::AddDestination {
                    name: "orders".into(),
                    is_queue: true,
                },
            },
        ]
    }

    #[tokio::test]
    async fn unanimous_prepare_commits_and_confirms() {
        let n = node("b1", "b1");
        add_live_peer(&n.ctx, &addr("b2"));
        add_live_peer(&n.ctx, &addr("b3"));
        n.peers.always_ok();
        n.config_store
            .append(ChangeRecord {
                uuid: "u0".into(),
                seq: 0,
                kind: ChangeKind::AddDurable {
                    name: "sub".into(),
                    client_id: "c1".into(),
                },
            })
            .await
            .unwrap();

        let coordinator = HandoverCoordinator::new(Arc::clone(&n.ctx));
        coordinator.handover(&addr("b2")).await.unwrap();

        assert!(n.ctx.brokers.is_master("b2"));
        assert_eq!(n.config_store.master().await.unwrap().as_deref(), Some("b2"));
        let prepares = n.peers.sent_of(PacketType::NewMasterBrokerPrepare);
        assert_eq!(prepares.len(), 2);
        let body: NewMasterPreparePayload = prepares[0].1.payload_value().unwrap();
        assert!(body.records[0].is_reset());
        assert_eq!(body.records.len(), 2);

        let confirms = n.peers.sent_of(PacketType::NewMasterBroker);
        assert_eq!(confirms.len(), 2);
        let confirm: NewMasterPayload = confirms[0].1.payload_value().unwrap();
        assert!(confirm.commit);
        assert!(n.ctx.replies.is_empty());
    }

    #[tokio::test]
    async fn one_refusal_aborts_everywhere() {
        let n = node("b1", "b1");
        add_live_peer(&n.ctx, &addr("b2"));
        add_live_peer(&n.ctx, &addr("b3"));
        n.peers.respond_with(|to, pkt| {
            if to.broker_id() == "b3" {
                reply_to(pkt, status::CONFLICT, Some("handover in progress"))
            } else {
                reply_to(pkt, status::OK, None)
            }
        });

        let coordinator = HandoverCoordinator::new(Arc::clone(&n.ctx));
        let err = coordinator.handover(&addr("b2")).await.unwrap_err();
        assert!(matches!(
            err,
            ClusterError::Rejected { status: code, .. } if code == status::CONFLICT
        ));
        assert!(n.ctx.brokers.is_master("b1"));

        let aborts = n.peers.sent_of(PacketType::NewMasterBroker);
        assert_eq!(aborts.len(), 2);
        let body: NewMasterPayload = aborts[0].1.payload_value().unwrap();
        assert!(!body.commit);
    }

    #[tokio::test]
    async fn unreachable_peer_ends_prepare_as_gone() {
        let n = node("b1", "b1");
        add_live_peer(&n.ctx, &addr("b2"));
        add_live_peer(&n.ctx, &addr("b3"));
        n.peers.always_ok();
        n.peers.set_unreachable("b3");

        let coordinator = HandoverCoordinator::new(Arc::clone(&n.ctx));
        let err = coordinator.handover(&addr("b2")).await.unwrap_err();
        assert!(matches!(err, ClusterError::Gone { .. }));
        assert!(n.ctx.brokers.is_master("b1"));
    }

    #[tokio::test]
    async fn only_the_master_may_hand_over() {
        let n = node("b2", "b1");
        add_live_peer(&n.ctx, &addr("b3"));
        let coordinator = HandoverCoordinator::new(Arc::clone(&n.ctx));
        let err = coordinator.handover(&addr("b3")).await.unwrap_err();
        assert_eq!(err.status_code(), status::PRECONDITION_FAILED);
        assert!(n.peers.sent().is_empty());
    }

    #[tokio::test]
    async fn duplicate_prepare_is_staged_once() {
        let n = node("b2", "b1");
        let participant = HandoverParticipant::new(Arc::clone(&n.ctx));
        let prepare = prepare_from("u1", &addr("b2"), change_set("u1"));

        participant.on_prepare(&addr("b1"), &prepare).await.unwrap();
        participant.on_prepare(&addr("b1"), &prepare).await.unwrap();

        assert_eq!(n.config_store.staged_count("u1").await.unwrap(), 2);
        assert_eq!(participant.pending_uuid().await.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn late_prepare_of_a_finished_handover_is_not_restaged() {
        let n = node("b3", "b1");
        let participant = HandoverParticipant::new(Arc::clone(&n.ctx));
        let prepare = prepare_from("u1", &addr("b2"), change_set("u1"));
        participant.on_prepare(&addr("b1"), &prepare).await.unwrap();
        let abort = new_master_packet(
            notification(PacketType::NewMasterBroker),
            "u1",
            &addr("b1"),
            &addr("b2"),
            false,
        )
        .unwrap();
        participant.on_new_master(&addr("b1"), &abort).await.unwrap();

        // A retransmitted prepare arrives after the abort.
        participant.on_prepare(&addr("b1"), &prepare).await.unwrap();
        assert_eq!(participant.pending_uuid().await, None);
        assert_eq!(n.config_store.staged_count("u1").await.unwrap(), 0);

        // A fresh handover still stages.
        participant
            .on_prepare(&addr("b1"), &prepare_from("u2", &addr("b2"), change_set("u2")))
            .await
            .unwrap();
        assert_eq!(participant.pending_uuid().await.as_deref(), Some("u2"));
    }

    #[tokio::test]
    async fn second_handover_is_refused_while_one_is_staged() {
        let n = node("b3", "b1");
        let participant = HandoverParticipant::new(Arc::clone(&n.ctx));
        participant
            .on_prepare(&addr("b1"), &prepare_from("u1", &addr("b2"), change_set("u1")))
            .await
            .unwrap();

        let err = participant
            .on_prepare(&addr("b1"), &prepare_from("u2", &addr("b4"), change_set("u2")))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), status::CONFLICT);
        assert!(err.to_string().contains("handover in progress"));
        assert_eq!(n.config_store.staged_count("u2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn prepare_from_non_master_or_without_reset_is_refused() {
        let n = node("b3", "b1");
        let participant = HandoverParticipant::new(Arc::clone(&n.ctx));
        let err = participant
            .on_prepare(&addr("b2"), &prepare_from("u1", &addr("b2"), change_set("u1")))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), status::PRECONDITION_FAILED);

        let mut no_reset = change_set("u1");
        no_reset.remove(0);
        let err = participant
            .on_prepare(&addr("b1"), &prepare_from("u1", &addr("b2"), no_reset))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("first record must be RESET"));
        assert_eq!(participant.pending_uuid().await, None);
    }

    #[tokio::test]
    async fn confirmation_applies_the_new_master() {
        let n = node("b3", "b1");
        let participant = HandoverParticipant::new(Arc::clone(&n.ctx));
        participant
            .on_prepare(&addr("b1"), &prepare_from("u1", &addr("b2"), change_set("u1")))
            .await
            .unwrap();

        let commit = new_master_packet(
            request(PacketType::NewMasterBroker, 7),
            "u1",
            &addr("b1"),
            &addr("b2"),
            true,
        )
        .unwrap();
        // Only the broker that staged the handover may confirm it.
        assert!(participant.on_new_master(&addr("b4"), &commit).await.is_err());
        participant.on_new_master(&addr("b1"), &commit).await.unwrap();

        assert!(n.ctx.brokers.is_master("b2"));
        assert_eq!(n.config_store.records().await.unwrap().len(), 2);
        assert_eq!(participant.pending_uuid().await, None);
    }

    #[tokio::test]
    async fn abort_or_master_loss_discards_the_staged_set() {
        let n = node("b3", "b1");
        let participant = HandoverParticipant::new(Arc::clone(&n.ctx));
        participant
            .on_prepare(&addr("b1"), &prepare_from("u1", &addr("b2"), change_set("u1")))
            .await
            .unwrap();
        let abort = new_master_packet(
            notification(PacketType::NewMasterBroker),
            "u1",
            &addr("b1"),
            &addr("b2"),
            false,
        )
        .unwrap();
        participant.on_new_master(&addr("b1"), &abort).await.unwrap();
        assert_eq!(n.config_store.staged_count("u1").await.unwrap(), 0);
        assert!(n.ctx.brokers.is_master("b1"));

        participant
            .on_prepare(&addr("b1"), &prepare_from("u2", &addr("b2"), change_set("u2")))
            .await
            .unwrap();
        participant.on_broker_down(&addr("b1")).await;
        assert_eq!(participant.pending_uuid().await, None);
        assert_eq!(n.config_store.staged_count("u2").await.unwrap(), 0);
    }
}
