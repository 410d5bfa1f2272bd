//! Cluster coordination module.
//!
//! Provides broker membership and its lock, the cluster listener and peer
//! links, reply waiters, the master handover, and broker takeover driven by
//! the HA monitor.

pub mod broker_list;
pub mod connection;
pub mod discovery;
pub mod ha_monitor;
pub mod handover;
pub mod integration;
pub mod listener;
pub mod messages;
pub mod protocol;
pub mod reply;
pub mod takeover;
pub mod transport;
pub mod types;

// ---------------------------------------------------------------------------
// Re-exports: flat public API
// ---------------------------------------------------------------------------

// types
pub use types::{check_can_takeover, BrokerAddress, BrokerState, ClusteredBroker};

// broker_list
pub use broker_list::{BrokerList, BrokerListGuard, BrokerListLock, BrokerTable};

// messages
pub use messages::{
    ChangeKind, ChangeRecord, GoodbyePayload, LinkInitPayload, NewMasterPayload,
    NewMasterPreparePayload, PacketType, TakeoverPayload,
};

// reply
pub use reply::{
    AllOk, BroadcastAnyOk, ReplyOutcome, ReplyPolicy, ReplyStatus, ReplyTracker, ReplyWaiter,
    TakeoverPending, Unicast, WaitStatus, WaiterState,
};

// connection and listener
pub use connection::{LinkHandler, PeerLink, PeerRegistry, PeerSender, SendError};
pub use discovery::{InMemoryPortMapper, PortMapper};
pub use listener::{ClusterListener, ListenerHandle};
pub use transport::{build_transport, ClusterStream, TransportFactory};

// handover and takeover
pub use ha_monitor::{HaMonitor, MonitorReport, TakeoverCandidate};
pub use handover::{HandoverCoordinator, HandoverParticipant};
pub use integration::{MemoryIntegrator, TakeoverIntegrator};
pub use protocol::ProtocolHandler;
pub use takeover::{TakeoverStage, TakeoverTracker};
