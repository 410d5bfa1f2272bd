//! Persisted transaction events.
//!
//! Every event is one variant of [`TransactionEvent`]. On disk an event is a
//! type byte, a subtype byte, then the `MsgPack` body of the variant:
//!
//! ```text
//! +--------+---------+---------------------------+
//! | type u8| sub u8  | body (rmp, named fields)  |
//! +--------+---------+---------------------------+
//! ```
//!
//! Reading an unknown type or subtype is an error. The event log is the
//! crash-recovery record, so a foreign or corrupt entry is never mapped to a
//! default variant.

use serde::{Deserialize, Serialize};

use crate::transaction::{TransactionRecord, TransactionState, Xid};

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

/// Which kind of transaction an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnType {
    /// Producer and consumers all on this broker.
    Local = 1,
    /// This broker coordinates a transaction spanning other brokers.
    Cluster = 2,
    /// Another broker coordinates; this broker holds acknowledged messages.
    Remote = 3,
}

impl TxnType {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Local),
            2 => Some(Self::Cluster),
            3 => Some(Self::Remote),
            _ => None,
        }
    }
}

/// Which step of the commit protocol an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnSubtype {
    OnePhaseCommit = 1,
    TwoPhasePrepare = 2,
    TwoPhaseComplete = 3,
}

// ---------------------------------------------------------------------------
// Bodies
// ---------------------------------------------------------------------------

/// Header common to every prepare and commit event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDetails {
    pub tid: u64,
    pub state: TransactionState,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub xid: Option<Xid>,
}

/// A message produced inside the transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkMessage {
    pub message_id: String,
    pub destination: String,
    /// Consumers that had registered interest when the message was stored.
    pub stored_interests: Vec<u64>,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

/// A message consumed inside the transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkAck {
    pub destination: String,
    pub message_id: String,
    pub consumer_id: u64,
}

/// All message work done by a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionWork {
    pub sent: Vec<WorkMessage>,
    pub acks: Vec<WorkAck>,
}

impl TransactionWork {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sent.is_empty() && self.acks.is_empty()
    }
}

/// A broker taking part in a cluster transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionBroker {
    pub broker_id: String,
    /// `host:port` of the broker's cluster service.
    pub address: String,
    /// Whether the broker has acknowledged the outcome.
    pub completed: bool,
}

/// Acknowledgements held on this broker for a remotely coordinated transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAck {
    pub destination: String,
    pub message_id: String,
    pub consumer_ids: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalTxnBody {
    pub details: TransactionDetails,
    pub work: TransactionWork,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTxnBody {
    pub details: TransactionDetails,
    pub work: TransactionWork,
    pub record: TransactionRecord,
    pub brokers: Vec<TransactionBroker>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTxnBody {
    pub details: TransactionDetails,
    pub acks: Vec<RemoteAck>,
    pub record: TransactionRecord,
    pub txn_home: TransactionBroker,
}

/// Final outcome of a two-phase transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionBody {
    pub tid: u64,
    pub outcome: TransactionState,
}

/// Outcome of a cluster transaction plus which brokers have acknowledged it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCompletionBody {
    pub tid: u64,
    pub outcome: TransactionState,
    pub brokers: Vec<TransactionBroker>,
}

// ---------------------------------------------------------------------------
// TransactionEvent
// ---------------------------------------------------------------------------

/// One persisted transaction event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionEvent {
    LocalOnePhaseCommit(LocalTxnBody),
    LocalPrepare(LocalTxnBody),
    LocalComplete(CompletionBody),
    ClusterOnePhaseCommit(ClusterTxnBody),
    ClusterPrepare(ClusterTxnBody),
    ClusterComplete(ClusterCompletionBody),
    RemotePrepare(RemoteTxnBody),
    RemoteComplete(CompletionBody),
}

/// Failure reading or writing a [`TransactionEvent`].
#[derive(Debug, thiserror::Error)]
pub enum EventCodecError {
    #[error("unsupported transaction event type {0}")]
    UnsupportedType(u8),
    #[error("unsupported subtype {subtype} for transaction event type {event_type}")]
    UnsupportedSubtype { event_type: u8, subtype: u8 },
    #[error("transaction event truncated")]
    Truncated,
    #[error("transaction event body encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("transaction event body decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

impl TransactionEvent {
    #[must_use]
    pub fn txn_type(&self) -> TxnType {
        match self {
            Self::LocalOnePhaseCommit(_) | Self::LocalPrepare(_) | Self::LocalComplete(_) => {
                TxnType::Local
            }
            Self::ClusterOnePhaseCommit(_) | Self::ClusterPrepare(_) | Self::ClusterComplete(_) => {
                TxnType::Cluster
            }
            Self::RemotePrepare(_) | Self::RemoteComplete(_) => TxnType::Remote,
        }
    }

    #[must_use]
    pub fn subtype(&self) -> TxnSubtype {
        match self {
            Self::LocalOnePhaseCommit(_) | Self::ClusterOnePhaseCommit(_) => {
                TxnSubtype::OnePhaseCommit
            }
            Self::LocalPrepare(_) | Self::ClusterPrepare(_) | Self::RemotePrepare(_) => {
                TxnSubtype::TwoPhasePrepare
            }
            Self::LocalComplete(_) | Self::ClusterComplete(_) | Self::RemoteComplete(_) => {
                TxnSubtype::TwoPhaseComplete
            }
        }
    }

    /// Transaction id the event belongs to.
    #[must_use]
    pub fn tid(&self) -> u64 {
        match self {
            Self::LocalOnePhaseCommit(b) | Self::LocalPrepare(b) => b.details.tid,
            Self::ClusterOnePhaseCommit(b) | Self::ClusterPrepare(b) => b.details.tid,
            Self::RemotePrepare(b) => b.details.tid,
            Self::LocalComplete(b) | Self::RemoteComplete(b) => b.tid,
            Self::ClusterComplete(b) => b.tid,
        }
    }

    /// Serializes the event: type byte, subtype byte, then the body.
    ///
    /// # Errors
    ///
    /// Returns [`EventCodecError::Encode`] if the body cannot be encoded.
    pub fn write_to_bytes(&self) -> Result<Vec<u8>, EventCodecError> {
        let mut out = vec![self.txn_type() as u8, self.subtype() as u8];
        let body = match self {
            Self::LocalOnePhaseCommit(b) | Self::LocalPrepare(b) => rmp_serde::to_vec_named(b)?,
            Self::ClusterOnePhaseCommit(b) | Self::ClusterPrepare(b) => {
                rmp_serde::to_vec_named(b)?
            }
            Self::RemotePrepare(b) => rmp_serde::to_vec_named(b)?,
            Self::LocalComplete(b) | Self::RemoteComplete(b) => rmp_serde::to_vec_named(b)?,
            Self::ClusterComplete(b) => rmp_serde::to_vec_named(b)?,
        };
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parses bytes produced by [`Self::write_to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`EventCodecError::UnsupportedType`] or
    /// [`EventCodecError::UnsupportedSubtype`] for unknown tags,
    /// [`EventCodecError::Truncated`] if the tag bytes are missing, and
    /// [`EventCodecError::Decode`] if the body is malformed.
    pub fn read_from_bytes(bytes: &[u8]) -> Result<Self, EventCodecError> {
        let [event_type, subtype, body @ ..] = bytes else {
            return Err(EventCodecError::Truncated);
        };
        let (event_type, subtype) = (*event_type, *subtype);
        let txn_type =
            TxnType::from_u8(event_type).ok_or(EventCodecError::UnsupportedType(event_type))?;

        let unsupported = || EventCodecError::UnsupportedSubtype {
            event_type,
            subtype,
        };

        let event = match (txn_type, subtype) {
            (TxnType::Local, 1) => Self::LocalOnePhaseCommit(rmp_serde::from_slice(body)?),
            (TxnType::Local, 2) => Self::LocalPrepare(rmp_serde::from_slice(body)?),
            (TxnType::Local, 3) => Self::LocalComplete(rmp_serde::from_slice(body)?),
            (TxnType::Cluster, 1) => Self::ClusterOnePhaseCommit(rmp_serde::from_slice(body)?),
            (TxnType::Cluster, 2) => Self::ClusterPrepare(rmp_serde::from_slice(body)?),
            (TxnType::Cluster, 3) => Self::ClusterComplete(rmp_serde::from_slice(body)?),
            (TxnType::Remote, 2) => Self::RemotePrepare(rmp_serde::from_slice(body)?),
            (TxnType::Remote, 3) => Self::RemoteComplete(rmp_serde::from_slice(body)?),
            _ => return Err(unsupported()),
        };
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn details(tid: u64, state: TransactionState) -> TransactionDetails {
        TransactionDetails {
            tid,
            state,
            xid: Some(Xid {
                format_id: 4,
                global_txn_id: vec![1, 2, 3],
                branch_qualifier: vec![9],
            }),
        }
    }

    fn work() -> TransactionWork {
        TransactionWork {
            sent: vec![WorkMessage {
                message_id: "m-1".into(),
                destination: "q.orders".into(),
                stored_interests: vec![11, 12],
                body: b"payload".to_vec(),
            }],
            acks: vec![WorkAck {
                destination: "q.audit".into(),
                message_id: "m-0".into(),
                consumer_id: 7,
            }],
        }
    }

    fn record(tid: u64, state: TransactionState) -> TransactionRecord {
        let mut rec = TransactionRecord::new(tid, "guest", "conn[127.0.0.1:5555]", 1_000);
        rec.client_id = "client-a".into();
        rec.state = state;
        rec
    }

    fn brokers() -> Vec<TransactionBroker> {
        vec![
            TransactionBroker {
                broker_id: "b1".into(),
                address: "10.0.0.1:7676".into(),
                completed: false,
            },
            TransactionBroker {
                broker_id: "b2".into(),
                address: "10.0.0.2:7676".into(),
                completed: true,
            },
        ]
    }

    fn samples() -> Vec<TransactionEvent> {
        let local = LocalTxnBody {
            details: details(1, TransactionState::Prepared),
            work: work(),
        };
        let cluster = ClusterTxnBody {
            details: details(2, TransactionState::Prepared),
            work: work(),
            record: record(2, TransactionState::Prepared),
            brokers: brokers(),
        };
        let remote = RemoteTxnBody {
            details: details(3, TransactionState::Prepared),
            acks: vec![RemoteAck {
                destination: "t.prices".into(),
                message_id: "m-9".into(),
                consumer_ids: vec![1, 2, 3],
            }],
            record: record(3, TransactionState::Prepared),
            txn_home: brokers().remove(0),
        };
        vec![
            TransactionEvent::LocalOnePhaseCommit(local.clone()),
            TransactionEvent::LocalPrepare(local),
            TransactionEvent::LocalComplete(CompletionBody {
                tid: 1,
                outcome: TransactionState::Committed,
            }),
            TransactionEvent::ClusterOnePhaseCommit(cluster.clone()),
            TransactionEvent::ClusterPrepare(cluster),
            TransactionEvent::ClusterComplete(ClusterCompletionBody {
                tid: 2,
                outcome: TransactionState::RolledBack,
                brokers: brokers(),
            }),
            TransactionEvent::RemotePrepare(remote),
            TransactionEvent::RemoteComplete(CompletionBody {
                tid: 3,
                outcome: TransactionState::Committed,
            }),
        ]
    }

    #[test]
    fn every_subtype_reads_back_equal() {
        for event in samples() {
            let bytes = event.write_to_bytes().unwrap();
            assert_eq!(bytes[0], event.txn_type() as u8);
            assert_eq!(bytes[1], event.subtype() as u8);
            let back = TransactionEvent::read_from_bytes(&bytes).unwrap();
            assert_eq!(back, event);
        }
    }

    #[test]
    fn unknown_subtype_is_unsupported() {
        let mut bytes = samples()[1].write_to_bytes().unwrap();
        bytes[1] = 9;
        assert!(matches!(
            TransactionEvent::read_from_bytes(&bytes),
            Err(EventCodecError::UnsupportedSubtype {
                event_type: 1,
                subtype: 9
            })
        ));
    }

    #[test]
    fn remote_one_phase_is_unsupported() {
        let mut bytes = samples()[6].write_to_bytes().unwrap();
        bytes[1] = TxnSubtype::OnePhaseCommit as u8;
        assert!(matches!(
            TransactionEvent::read_from_bytes(&bytes),
            Err(EventCodecError::UnsupportedSubtype {
                event_type: 3,
                subtype: 1
            })
        ));
    }

    #[test]
    fn unknown_type_is_unsupported() {
        assert!(matches!(
            TransactionEvent::read_from_bytes(&[0x7f, 1, 0x80]),
            Err(EventCodecError::UnsupportedType(0x7f))
        ));
    }

    #[test]
    fn missing_tag_bytes_is_truncated() {
        assert!(matches!(
            TransactionEvent::read_from_bytes(&[1]),
            Err(EventCodecError::Truncated)
        ));
    }

    #[test]
    fn body_of_wrong_shape_fails_to_decode() {
        // A completion body under a prepare tag.
        let mut bytes = samples()[2].write_to_bytes().unwrap();
        bytes[1] = TxnSubtype::TwoPhasePrepare as u8;
        assert!(matches!(
            TransactionEvent::read_from_bytes(&bytes),
            Err(EventCodecError::Decode(_))
        ));
    }

    #[test]
    fn tid_is_reported_for_each_variant() {
        let tids: Vec<u64> = samples().iter().map(TransactionEvent::tid).collect();
        assert_eq!(tids, vec![1, 1, 1, 2, 2, 2, 3, 3]);
    }

    proptest! {
        #[test]
        fn arbitrary_work_survives(
            tid in any::<u64>(),
            ids in proptest::collection::vec("[a-z0-9]{1,12}", 0..6),
            body in proptest::collection::vec(any::<u8>(), 0..64),
            consumer in any::<u64>(),
        ) {
            let work = TransactionWork {
                sent: ids.iter().map(|id| WorkMessage {
                    message_id: id.clone(),
                    destination: format!("q.{id}"),
                    stored_interests: vec![consumer],
                    body: body.clone(),
                }).collect(),
                acks: ids.iter().map(|id| WorkAck {
                    destination: format!("t.{id}"),
                    message_id: id.clone(),
                    consumer_id: consumer,
                }).collect(),
            };
            let event = TransactionEvent::LocalPrepare(LocalTxnBody {
                details: TransactionDetails { tid, state: TransactionState::Prepared, xid: None },
                work,
            });
            let bytes = event.write_to_bytes().unwrap();
            prop_assert_eq!(TransactionEvent::read_from_bytes(&bytes).unwrap(), event);
        }
    }
}
