//! Durable, append-only log of transaction events.
//!
//! The file starts with a fixed header followed by length-prefixed,
//! checksummed records. Each record body is a
//! [`TransactionEvent`] in its own wire form. A crash can leave at most one
//! partial record at the tail; replay detects and cuts it. Damage followed
//! by intact records is not a crash artifact and fails the replay.

mod file;

use std::collections::HashMap;
use std::path::PathBuf;

use mqcluster_core::{EventCodecError, TransactionEvent, TxnSubtype};

pub use file::TxnLog;

pub(crate) const FILE_MAGIC: u32 = 0x5555_AAAA;
pub(crate) const RECORD_MAGIC: u32 = 0xAAAA_5555;
pub(crate) const FILE_VERSION: u16 = 1;

/// `magic u32 | version u16 | status u16 | checkpoint_seq u64`
pub(crate) const HEADER_LEN: u64 = 16;
/// `magic u32 | seq u64 | timestamp u64 | len u32 | crc32c u32`
pub(crate) const RECORD_HEADER_LEN: usize = 28;

#[derive(Debug, thiserror::Error)]
pub enum TxnLogError {
    #[error("transaction log {}: bad header: {reason}", path.display())]
    BadHeader { path: PathBuf, reason: String },
    #[error("transaction log record {seq}: {source}")]
    Unsupported {
        seq: u64,
        #[source]
        source: EventCodecError,
    },
    #[error("transaction log record {seq} is corrupt: {source}")]
    Corrupt {
        seq: u64,
        #[source]
        source: EventCodecError,
    },
    #[error("transaction log damaged at offset {offset} ({reason}) before intact records")]
    Damaged { offset: u64, reason: &'static str },
    #[error("transaction event of {0} bytes does not fit in a record")]
    RecordTooLarge(usize),
    #[error(transparent)]
    Codec(#[from] EventCodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One event read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedEvent {
    pub seq: u64,
    pub timestamp_ms: u64,
    pub event: TransactionEvent,
}

/// Transactions that were prepared but never completed, in log order.
#[must_use]
pub fn unresolved(events: impl IntoIterator<Item = LoggedEvent>) -> Vec<LoggedEvent> {
    let mut open: HashMap<u64, LoggedEvent> = HashMap::new();
    for logged in events {
        match logged.event.subtype() {
            TxnSubtype::TwoPhasePrepare => {
                open.insert(logged.event.tid(), logged);
            }
            TxnSubtype::TwoPhaseComplete => {
                open.remove(&logged.event.tid());
            }
            TxnSubtype::OnePhaseCommit => {}
        }
    }
    let mut out: Vec<_> = open.into_values().collect();
    out.sort_by_key(|logged| logged.seq);
    out
}

#[cfg(test)]
pub(crate) mod test_events {
    use mqcluster_core::txn_event::{
        CompletionBody, LocalTxnBody, TransactionDetails, TransactionWork,
    };
    use mqcluster_core::{TransactionEvent, TransactionState};

    fn local(tid: u64, state: TransactionState) -> LocalTxnBody {
        LocalTxnBody {
            details: TransactionDetails {
                tid,
                state,
                xid: None,
            },
            work: TransactionWork::default(),
        }
    }

    pub(crate) fn prepare(tid: u64) -> TransactionEvent {
        TransactionEvent::LocalPrepare(local(tid, TransactionState::Prepared))
    }

    pub(crate) fn complete(tid: u64) -> TransactionEvent {
        TransactionEvent::LocalComplete(CompletionBody {
            tid,
            outcome: TransactionState::Committed,
        })
    }

    pub(crate) fn one_phase(tid: u64) -> TransactionEvent {
        TransactionEvent::LocalOnePhaseCommit(local(tid, TransactionState::Committed))
    }
}

#[cfg(test)]
mod tests {
    use super::test_events::{complete, one_phase, prepare};
    use super::*;

    fn logged(seq: u64, event: TransactionEvent) -> LoggedEvent {
        LoggedEvent {
            seq,
            timestamp_ms: seq * 10,
            event,
        }
    }

    #[test]
    fn prepared_without_complete_is_unresolved() {
        let events = vec![
            logged(1, prepare(10)),
            logged(2, prepare(11)),
            logged(3, one_phase(12)),
            logged(4, complete(10)),
            logged(5, prepare(13)),
        ];
        let open: Vec<u64> = unresolved(events).iter().map(|e| e.event.tid()).collect();
        assert_eq!(open, vec![11, 13]);
    }

    #[test]
    fn complete_before_any_prepare_is_ignored() {
        let events = vec![logged(1, complete(4)), logged(2, prepare(4))];
        let open = unresolved(events);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].seq, 2);
    }
}
