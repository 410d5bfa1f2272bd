//! Cluster inter-broker packet types, property names, and payloads.
//!
//! Every message is a [`ClusterPacket`] whose type tag is a [`PacketType`].
//! Scalars that protocols correlate on (xid, status, uuid) travel as packet
//! properties; structured bodies travel as a `MsgPack` payload
//! (`rmp_serde::to_vec_named()`).

use mqcluster_core::{BrokerSessionUid, ClusterPacket, StoreSessionUid, ACK_REQUESTED};
use serde::{Deserialize, Serialize};

use super::types::BrokerAddress;

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

/// Status codes carried in the `S` property of reply packets.
pub mod status {
    pub const OK: i32 = 200;
    pub const BAD_REQUEST: i32 = 400;
    pub const NOT_FOUND: i32 = 404;
    pub const NOT_ALLOWED: i32 = 405;
    pub const TIMEOUT: i32 = 408;
    pub const CONFLICT: i32 = 409;
    pub const GONE: i32 = 410;
    pub const PRECONDITION_FAILED: i32 = 412;
    pub const ERROR: i32 = 500;
    pub const UNAVAILABLE: i32 = 503;
}

/// Property names.
pub mod prop {
    /// Reply correlation id.
    pub const XID: &str = "X";
    pub const STATUS: &str = "S";
    pub const REASON: &str = "R";
    /// Idempotency key of a handover operation.
    pub const UUID: &str = "UUID";
}

// ---------------------------------------------------------------------------
// PacketType
// ---------------------------------------------------------------------------

/// Type tag of every inter-broker packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    // -- Link (3) -----------------------------------------------------------
    LinkInit = 1,
    Goodbye = 2,
    Heartbeat = 3,

    // -- Takeover (4) -------------------------------------------------------
    TakeoverPending = 10,
    TakeoverPendingReply = 11,
    TakeoverComplete = 12,
    TakeoverAbort = 13,

    // -- Master handover (4) ------------------------------------------------
    NewMasterBrokerPrepare = 20,
    NewMasterBrokerPrepareReply = 21,
    NewMasterBroker = 22,
    NewMasterBrokerReply = 23,
}

impl PacketType {
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            1 => Self::LinkInit,
            2 => Self::Goodbye,
            3 => Self::Heartbeat,
            10 => Self::TakeoverPending,
            11 => Self::TakeoverPendingReply,
            12 => Self::TakeoverComplete,
            13 => Self::TakeoverAbort,
            20 => Self::NewMasterBrokerPrepare,
            21 => Self::NewMasterBrokerPrepareReply,
            22 => Self::NewMasterBroker,
            23 => Self::NewMasterBrokerReply,
            _ => return None,
        })
    }

    #[must_use]
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// The reply type for a request type, if it has one.
    #[must_use]
    pub fn reply_type(self) -> Option<Self> {
        match self {
            Self::TakeoverPending => Some(Self::TakeoverPendingReply),
            Self::NewMasterBrokerPrepare => Some(Self::NewMasterBrokerPrepareReply),
            Self::NewMasterBroker => Some(Self::NewMasterBrokerReply),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            Self::TakeoverPendingReply
                | Self::NewMasterBrokerPrepareReply
                | Self::NewMasterBrokerReply
        )
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::LinkInit => "LINK_INIT",
            Self::Goodbye => "GOODBYE",
            Self::Heartbeat => "HEARTBEAT",
            Self::TakeoverPending => "TAKEOVER_PENDING",
            Self::TakeoverPendingReply => "TAKEOVER_PENDING_REPLY",
            Self::TakeoverComplete => "TAKEOVER_COMPLETE",
            Self::TakeoverAbort => "TAKEOVER_ABORT",
            Self::NewMasterBrokerPrepare => "NEW_MASTER_BROKER_PREPARE",
            Self::NewMasterBrokerPrepareReply => "NEW_MASTER_BROKER_PREPARE_REPLY",
            Self::NewMasterBroker => "NEW_MASTER_BROKER",
            Self::NewMasterBrokerReply => "NEW_MASTER_BROKER_REPLY",
        }
    }
}

// ---------------------------------------------------------------------------
// Packet helpers
// ---------------------------------------------------------------------------

/// Builds a request packet that expects a reply correlated by `xid`.
#[must_use]
pub fn request(packet_type: PacketType, xid: u64) -> ClusterPacket {
    let mut pkt = ClusterPacket::new(packet_type.as_u16());
    pkt.set_u64(prop::XID, xid);
    pkt.set_bit(ACK_REQUESTED, true);
    pkt
}

/// Builds a one-way packet.
#[must_use]
pub fn notification(packet_type: PacketType) -> ClusterPacket {
    ClusterPacket::new(packet_type.as_u16())
}

/// Builds the reply to `req`, echoing its xid.
///
/// Returns `None` if `req` has no reply type or did not request one.
#[must_use]
pub fn reply_to(
    req: &ClusterPacket,
    status_code: i32,
    reason: Option<&str>,
) -> Option<ClusterPacket> {
    let reply_type = PacketType::from_u16(req.packet_type())?.reply_type()?;
    if !req.ack_requested() {
        return None;
    }
    let mut pkt = ClusterPacket::new(reply_type.as_u16());
    if let Some(xid) = req.get_long(prop::XID) {
        pkt.set_long(prop::XID, xid);
    }
    pkt.set_int(prop::STATUS, status_code);
    if let Some(reason) = reason {
        pkt.set_str(prop::REASON, reason);
    }
    if let Some(uuid) = req.get_str(prop::UUID) {
        pkt.set_str(prop::UUID, uuid);
    }
    Some(pkt)
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// First packet on every link: who the sender is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkInitPayload {
    pub address: BrokerAddress,
    pub ha: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub store_session: Option<StoreSessionUid>,
    /// Broker id the sender believes is master, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub master: Option<String>,
}

/// Sent before leaving the cluster cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoodbyePayload {
    pub address: BrokerAddress,
}

/// Announces that `taker` is taking over the store of `target`.
///
/// Used for `TAKEOVER_PENDING`, `TAKEOVER_COMPLETE` and `TAKEOVER_ABORT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TakeoverPayload {
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub store_session: Option<StoreSessionUid>,
    pub broker_session: BrokerSessionUid,
    pub taker: BrokerAddress,
    pub timestamp_ms: u64,
}

/// A cluster configuration change, replicated to a new master before handover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub uuid: String,
    pub seq: u64,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    /// Discard everything before this record.
    Reset,
    AddDurable { name: String, client_id: String },
    AddDestination { name: String, is_queue: bool },
}

impl ChangeRecord {
    #[must_use]
    pub fn reset(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            seq: 0,
            kind: ChangeKind::Reset,
        }
    }

    #[must_use]
    pub fn is_reset(&self) -> bool {
        matches!(self.kind, ChangeKind::Reset)
    }
}

/// Body of `NEW_MASTER_BROKER_PREPARE`. The xid and uuid travel as properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMasterPreparePayload {
    pub new_master: BrokerAddress,
    pub records: Vec<ChangeRecord>,
}

/// Body of `NEW_MASTER_BROKER`: commit or abort of a prepared handover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMasterPayload {
    pub old_master: BrokerAddress,
    pub new_master: BrokerAddress,
    pub commit: bool,
}
