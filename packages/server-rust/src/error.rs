//! Error taxonomy for cluster coordination.

use mqcluster_core::{PacketError, TransactionError};

use crate::cluster::takeover::TakeoverStage;
use crate::cluster::types::BrokerState;

/// Errors surfaced by cluster protocols and the store capability.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// A concurrency-discipline bug in the caller. Never retried.
    #[error("internal error: {0}")]
    Internal(String),

    /// A participant shut down or left before the operation could complete.
    #[error("{waiter}: participant gone")]
    Gone { waiter: &'static str },

    #[error("{waiter}: timed out waiting for replies")]
    Timeout { waiter: &'static str },

    /// A peer answered with a non-OK status.
    #[error("rejected ({status}): {reason}")]
    Rejected { status: i32, reason: String },

    /// The target broker is already being failed over.
    #[error("broker {broker} is in state {state}; takeover conflicts with another failover")]
    Conflict { broker: String, state: BrokerState },

    /// The target broker is in a state that can not be taken over.
    #[error("broker {broker} is in state {state}; takeover not allowed")]
    NotAllowed { broker: String, state: BrokerState },

    /// Another broker won the store-mediated takeover lock. Expected outcome.
    #[error("takeover lock for {broker} held by another broker")]
    TakeoverLockLost { broker: String },

    #[error("takeover of {broker} failed at stage {stage}: {source}")]
    TakeoverFailed {
        broker: String,
        stage: TakeoverStage,
        #[source]
        source: Box<ClusterError>,
    },

    #[error("broker {0} is not known to the cluster")]
    UnknownBroker(String),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    /// True when the error only means another broker got there first.
    #[must_use]
    pub fn is_race_loss(&self) -> bool {
        matches!(self, Self::TakeoverLockLost { .. })
    }

    /// Status code carried in reply packets for this error.
    #[must_use]
    pub fn status_code(&self) -> i32 {
        use crate::cluster::messages::status;
        match self {
            Self::Gone { .. } => status::GONE,
            Self::Timeout { .. } => status::TIMEOUT,
            Self::Rejected { status, .. } => *status,
            Self::Conflict { .. } | Self::TakeoverLockLost { .. } => status::CONFLICT,
            Self::NotAllowed { .. } => status::NOT_ALLOWED,
            Self::UnknownBroker(_) => status::NOT_FOUND,
            Self::Packet(_) => status::BAD_REQUEST,
            _ => status::ERROR,
        }
    }

    pub(crate) fn rejected(status: i32, reason: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::messages::status;

    #[test]
    fn only_lock_loss_is_a_race_loss() {
        assert!(ClusterError::TakeoverLockLost { broker: "b1".into() }.is_race_loss());
        assert!(!ClusterError::Internal("x".into()).is_race_loss());
        assert!(!ClusterError::Gone { waiter: "w" }.is_race_loss());
    }

    #[test]
    fn takeover_failure_names_target_and_stage() {
        let err = ClusterError::TakeoverFailed {
            broker: "b1".into(),
            stage: TakeoverStage::BeforeTakeStore,
            source: Box::new(ClusterError::Internal("disk".into())),
        };
        let msg = err.to_string();
        assert!(msg.contains("b1"));
        assert!(msg.contains("BEFORE_TAKE_STORE"));
    }

    #[test]
    fn status_codes_follow_error_kind() {
        assert_eq!(ClusterError::Gone { waiter: "w" }.status_code(), status::GONE);
        assert_eq!(
            ClusterError::rejected(status::PRECONDITION_FAILED, "no").status_code(),
            status::PRECONDITION_FAILED
        );
        assert_eq!(ClusterError::Internal("x".into()).status_code(), status::ERROR);
    }
}
