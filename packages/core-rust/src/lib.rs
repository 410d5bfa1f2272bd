//! `mqcluster` core: transaction state machine, persisted transaction events,
//! inter-broker packets, and session UIDs.

pub mod clock;
pub mod packet;
pub mod transaction;
pub mod txn_event;
pub mod uid;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use packet::{ClusterPacket, PacketError, PropValue, ACK_REQUESTED};
pub use transaction::{
    next_state, remote_next_state, TransactionError, TransactionOp, TransactionRecord,
    TransactionState, XaFlags, Xid,
};
pub use txn_event::{EventCodecError, TransactionEvent, TxnSubtype, TxnType};
pub use uid::{BrokerSessionUid, StoreSessionUid, UidGenerator};
