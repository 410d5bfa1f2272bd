//! Cluster domain types: broker identity, broker state, and membership entries.

use std::fmt;

use mqcluster_core::{BrokerSessionUid, StoreSessionUid};
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

// ---------------------------------------------------------------------------
// BrokerAddress
// ---------------------------------------------------------------------------

/// Identifies one running incarnation of a cluster peer.
///
/// Two addresses with the same broker id but different sessions are
/// different incarnations: a restarted broker never matches its prior self.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerAddress {
    broker_id: String,
    host: String,
    port: u16,
    broker_session: BrokerSessionUid,
}

impl BrokerAddress {
    #[must_use]
    pub fn new(
        broker_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        broker_session: BrokerSessionUid,
    ) -> Self {
        Self {
            broker_id: broker_id.into(),
            host: host.into(),
            port,
            broker_session,
        }
    }

    #[must_use]
    pub fn broker_id(&self) -> &str {
        &self.broker_id
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn broker_session(&self) -> BrokerSessionUid {
        self.broker_session
    }

    /// `host:port` of the cluster service.
    #[must_use]
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}:{}](bs={})",
            self.broker_id, self.host, self.port, self.broker_session
        )
    }
}

// ---------------------------------------------------------------------------
// BrokerState
// ---------------------------------------------------------------------------

/// Operational state of a broker as recorded in the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerState {
    Initializing,
    Operating,
    QuiesceStarted,
    QuiesceCompleted,
    FailoverPending,
    FailoverStarted,
    FailoverComplete,
    FailoverProcessed,
    FailoverFailed,
    ShutdownStarted,
    ShutdownFailover,
    ShutdownComplete,
}

impl BrokerState {
    #[must_use]
    pub fn is_shutdown(self) -> bool {
        matches!(
            self,
            Self::ShutdownStarted | Self::ShutdownFailover | Self::ShutdownComplete
        )
    }

    /// States in which the local monitor has nothing to do.
    #[must_use]
    pub fn is_quiet(self) -> bool {
        matches!(
            self,
            Self::QuiesceStarted
                | Self::QuiesceCompleted
                | Self::FailoverPending
                | Self::FailoverFailed
        ) || self.is_shutdown()
    }
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "INITIALIZING",
            Self::Operating => "OPERATING",
            Self::QuiesceStarted => "QUIESCE_STARTED",
            Self::QuiesceCompleted => "QUIESCE_COMPLETED",
            Self::FailoverPending => "FAILOVER_PENDING",
            Self::FailoverStarted => "FAILOVER_STARTED",
            Self::FailoverComplete => "FAILOVER_COMPLETE",
            Self::FailoverProcessed => "FAILOVER_PROCESSED",
            Self::FailoverFailed => "FAILOVER_FAILED",
            Self::ShutdownStarted => "SHUTDOWN_STARTED",
            Self::ShutdownFailover => "SHUTDOWN_FAILOVER",
            Self::ShutdownComplete => "SHUTDOWN_COMPLETE",
        };
        f.write_str(name)
    }
}

/// Checks whether a broker in `state` may be taken over.
///
/// # Errors
///
/// [`ClusterError::NotAllowed`] while the broker initializes or shuts down;
/// [`ClusterError::Conflict`] when a failover is already under way or done.
pub fn check_can_takeover(broker_id: &str, state: BrokerState) -> Result<(), ClusterError> {
    match state {
        BrokerState::Initializing
        | BrokerState::ShutdownStarted
        | BrokerState::ShutdownComplete => Err(ClusterError::NotAllowed {
            broker: broker_id.to_string(),
            state,
        }),
        BrokerState::FailoverPending
        | BrokerState::FailoverStarted
        | BrokerState::FailoverComplete
        | BrokerState::FailoverProcessed => Err(ClusterError::Conflict {
            broker: broker_id.to_string(),
            state,
        }),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// ClusteredBroker
// ---------------------------------------------------------------------------

/// What this broker knows about one cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusteredBroker {
    pub address: BrokerAddress,
    pub state: BrokerState,
    /// Last heartbeat timestamp read from the shared store.
    pub heartbeat_ms: u64,
    /// Store session this broker currently owns (HA clusters only).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub store_session: Option<StoreSessionUid>,
    /// Whether a live link to the broker exists.
    pub is_up: bool,
    pub in_doubt: bool,
}

impl ClusteredBroker {
    #[must_use]
    pub fn new(address: BrokerAddress, state: BrokerState) -> Self {
        Self {
            address,
            state,
            heartbeat_ms: 0,
            store_session: None,
            is_up: false,
            in_doubt: false,
        }
    }

    #[must_use]
    pub fn broker_id(&self) -> &str {
        self.address.broker_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(id: &str, session: u64) -> BrokerAddress {
        BrokerAddress::new(id, "10.0.0.1", 7676, BrokerSessionUid(session))
    }

    #[test]
    fn restarted_broker_is_a_different_address() {
        assert_ne!(addr("b1", 1), addr("b1", 2));
        assert_eq!(addr("b1", 1), addr("b1", 1));
        assert_eq!(addr("b1", 1).host_port(), "10.0.0.1:7676");
    }

    #[test]
    fn takeover_check_by_state() {
        assert!(check_can_takeover("b", BrokerState::Operating).is_ok());
        assert!(check_can_takeover("b", BrokerState::FailoverFailed).is_ok());
        assert!(matches!(
            check_can_takeover("b", BrokerState::Initializing),
            Err(ClusterError::NotAllowed { .. })
        ));
        assert!(check_can_takeover("b", BrokerState::ShutdownFailover).is_ok());
        assert!(matches!(
            check_can_takeover("b", BrokerState::ShutdownComplete),
            Err(ClusterError::NotAllowed { .. })
        ));
        for state in [
            BrokerState::FailoverPending,
            BrokerState::FailoverStarted,
            BrokerState::FailoverComplete,
            BrokerState::FailoverProcessed,
        ] {
            assert!(matches!(
                check_can_takeover("b", state),
                Err(ClusterError::Conflict { .. })
            ));
        }
    }

    #[test]
    fn broker_state_serializes_screaming() {
        let json = serde_json::to_string(&BrokerState::FailoverProcessed).unwrap();
        assert_eq!(json, "\"FAILOVER_PROCESSED\"");
        assert_eq!(BrokerState::FailoverProcessed.to_string(), "FAILOVER_PROCESSED");
    }
}
