//! Transaction completion state machine.
//!
//! Local client operations (start, end, prepare, commit, rollback) carry
//! XA-style flag bits and are validated by [`next_state`]. Transactions whose
//! state is propagated from another broker follow the narrower
//! [`remote_next_state`] rules, which only ever move a prepared transaction
//! to its final outcome.
//!
//! Both functions are pure: they compute the next state and never mutate.
//! [`TransactionRecord::transition`] applies the result in place.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// States and operations
// ---------------------------------------------------------------------------

/// Lifecycle state of a transaction.
///
/// The discriminant order is significant: auto-rollback after a takeover
/// compares states with `<` to find transactions that never reached
/// [`TransactionState::Prepared`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    Created = 0,
    Started = 1,
    Failed = 2,
    Incomplete = 3,
    Complete = 4,
    Prepared = 5,
    Committed = 6,
    #[serde(rename = "ROLLEDBACK")]
    RolledBack = 7,
    /// Terminal; no operation moves a timed-out transaction.
    TimedOut = 8,
}

impl TransactionState {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Created,
            1 => Self::Started,
            2 => Self::Failed,
            3 => Self::Incomplete,
            4 => Self::Complete,
            5 => Self::Prepared,
            6 => Self::Committed,
            7 => Self::RolledBack,
            8 => Self::TimedOut,
            _ => return None,
        })
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Started => "STARTED",
            Self::Failed => "FAILED",
            Self::Incomplete => "INCOMPLETE",
            Self::Complete => "COMPLETE",
            Self::Prepared => "PREPARED",
            Self::Committed => "COMMITTED",
            Self::RolledBack => "ROLLEDBACK",
            Self::TimedOut => "TIMED_OUT",
        }
    }

    /// All states, in discriminant order.
    pub const ALL: [Self; 9] = [
        Self::Created,
        Self::Started,
        Self::Failed,
        Self::Incomplete,
        Self::Complete,
        Self::Prepared,
        Self::Committed,
        Self::RolledBack,
        Self::TimedOut,
    ];
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.as_u8())
    }
}

/// Client operation that drives a transaction transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionOp {
    Start,
    End,
    Prepare,
    Commit,
    Rollback,
}

impl TransactionOp {
    pub const ALL: [Self; 5] = [
        Self::Start,
        Self::End,
        Self::Prepare,
        Self::Commit,
        Self::Rollback,
    ];
}

impl fmt::Display for TransactionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "START_TRANSACTION",
            Self::End => "END_TRANSACTION",
            Self::Prepare => "PREPARE_TRANSACTION",
            Self::Commit => "COMMIT_TRANSACTION",
            Self::Rollback => "ROLLBACK_TRANSACTION",
        })
    }
}

// ---------------------------------------------------------------------------
// XA flags
// ---------------------------------------------------------------------------

/// XA resource flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct XaFlags(pub u32);

impl XaFlags {
    pub const NO_FLAGS: Self = Self(0);
    pub const JOIN: Self = Self(0x0020_0000);
    pub const SUSPEND: Self = Self(0x0200_0000);
    pub const SUCCESS: Self = Self(0x0400_0000);
    pub const RESUME: Self = Self(0x0800_0000);
    pub const FAIL: Self = Self(0x2000_0000);
    pub const ONE_PHASE: Self = Self(0x4000_0000);

    const NAMED: [(Self, &'static str); 6] = [
        (Self::FAIL, "TMFAIL"),
        (Self::JOIN, "TMJOIN"),
        (Self::ONE_PHASE, "TMONEPHASE"),
        (Self::RESUME, "TMRESUME"),
        (Self::SUCCESS, "TMSUCCESS"),
        (Self::SUSPEND, "TMSUSPEND"),
    ];

    /// Reports whether `flag` is set.
    ///
    /// `NO_FLAGS` is not a bit: checking for it, or checking against an empty
    /// set, is an equality test. Otherwise every bit of `flag` must be present.
    #[must_use]
    pub fn is_set(self, flag: Self) -> bool {
        if flag == Self::NO_FLAGS || self == Self::NO_FLAGS {
            flag == self
        } else {
            self.0 & flag.0 == flag.0
        }
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl From<Option<u32>> for XaFlags {
    /// An absent flag field means no flags.
    fn from(value: Option<u32>) -> Self {
        Self(value.unwrap_or(0))
    }
}

impl fmt::Display for XaFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}:", self.0)?;
        if *self == Self::NO_FLAGS {
            return f.write_str("TMNOFLAGS");
        }
        let mut first = true;
        for (flag, name) in Self::NAMED {
            if self.is_set(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Rejected transaction transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    #[error("illegal transaction transition: {op} with flags {flags} in state {state}")]
    IllegalTransition {
        op: TransactionOp,
        flags: XaFlags,
        state: TransactionState,
    },
    /// A failed transaction was asked to do something other than roll back.
    ///
    /// `not_modified` is set for an END on a transaction that failed while
    /// started: the client already ended it and the call changes nothing.
    #[error("transaction failed from state {fail_from}; {op} with flags {flags} not allowed")]
    FromFailedState {
        op: TransactionOp,
        flags: XaFlags,
        fail_from: TransactionState,
        not_modified: bool,
    },
    #[error("transaction state {from} can not transit to state {to}")]
    IllegalRemoteTransition {
        from: TransactionState,
        to: TransactionState,
    },
}

// ---------------------------------------------------------------------------
// Transition functions
// ---------------------------------------------------------------------------

/// Computes the state a locally driven transaction moves to.
///
/// # Errors
///
/// Returns [`TransactionError::IllegalTransition`] for any combination of
/// state, operation and flags not in the transition table.
pub fn next_state(
    current: TransactionState,
    op: TransactionOp,
    flags: XaFlags,
) -> Result<TransactionState, TransactionError> {
    use TransactionState as S;

    let allowed = |from: &[S]| from.contains(&current);

    let next = match op {
        TransactionOp::Start => {
            if flags.is_set(XaFlags::NO_FLAGS) {
                allowed(&[S::Created, S::Complete, S::Started]).then_some(S::Started)
            } else if flags.is_set(XaFlags::JOIN) {
                allowed(&[S::Started, S::Complete]).then_some(S::Started)
            } else if flags.is_set(XaFlags::RESUME) {
                allowed(&[S::Incomplete, S::Started]).then_some(S::Started)
            } else {
                None
            }
        }
        TransactionOp::End => {
            if flags.is_set(XaFlags::SUSPEND) {
                allowed(&[S::Started, S::Incomplete]).then_some(S::Incomplete)
            } else if flags.is_set(XaFlags::FAIL) {
                allowed(&[S::Started, S::Incomplete, S::Failed]).then_some(S::Failed)
            } else if flags.is_set(XaFlags::SUCCESS) || flags.is_set(XaFlags::ONE_PHASE) {
                allowed(&[S::Started, S::Incomplete, S::Complete]).then_some(S::Complete)
            } else {
                None
            }
        }
        TransactionOp::Prepare => allowed(&[S::Complete, S::Prepared]).then_some(S::Prepared),
        TransactionOp::Commit => {
            if flags.is_set(XaFlags::ONE_PHASE) {
                allowed(&[S::Complete, S::Committed]).then_some(S::Committed)
            } else {
                allowed(&[S::Prepared, S::Committed]).then_some(S::Committed)
            }
        }
        TransactionOp::Rollback => allowed(&[
            S::Complete,
            S::Incomplete,
            S::Prepared,
            S::Failed,
            S::RolledBack,
        ])
        .then_some(S::RolledBack),
    };

    next.ok_or(TransactionError::IllegalTransition {
        op,
        flags,
        state: current,
    })
}

/// Computes the outcome of a state change propagated from another broker.
///
/// Only a prepared transaction may be resolved, and resolving to the same
/// outcome twice is accepted.
///
/// # Errors
///
/// Returns [`TransactionError::IllegalRemoteTransition`] for anything else.
pub fn remote_next_state(
    current: TransactionState,
    target: TransactionState,
) -> Result<TransactionState, TransactionError> {
    use TransactionState as S;

    match (current, target) {
        (S::Prepared | S::Committed, S::Committed) => Ok(S::Committed),
        (S::Prepared | S::RolledBack, S::RolledBack) => Ok(S::RolledBack),
        _ => Err(TransactionError::IllegalRemoteTransition {
            from: current,
            to: target,
        }),
    }
}

// ---------------------------------------------------------------------------
// TransactionRecord
// ---------------------------------------------------------------------------

/// XA global transaction id and branch qualifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Xid {
    pub format_id: i32,
    #[serde(with = "serde_bytes")]
    pub global_txn_id: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub branch_qualifier: Vec<u8>,
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.format_id)?;
        for b in &self.global_txn_id {
            write!(f, "{b:02x}")?;
        }
        f.write_str(":")?;
        for b in &self.branch_qualifier {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// The state of one transaction together with who owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub tid: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub xid: Option<Xid>,
    pub user: String,
    pub client_id: String,
    /// Human-readable description of the owning connection.
    pub connection: String,
    pub state: TransactionState,
    /// State the transaction was in when it moved to `Failed`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fail_from: Option<TransactionState>,
    pub created_ms: u64,
}

impl TransactionRecord {
    #[must_use]
    pub fn new(
        tid: u64,
        user: impl Into<String>,
        connection: impl Into<String>,
        now_ms: u64,
    ) -> Self {
        Self {
            tid,
            xid: None,
            user: user.into(),
            client_id: String::new(),
            connection: connection.into(),
            state: TransactionState::Created,
            fail_from: None,
            created_ms: now_ms,
        }
    }

    /// Applies a client operation, updating `state` on success.
    ///
    /// # Errors
    ///
    /// Returns the error from [`next_state`], except that a rejected
    /// operation on a failed transaction reports
    /// [`TransactionError::FromFailedState`] with the state it failed from.
    pub fn transition(
        &mut self,
        op: TransactionOp,
        flags: XaFlags,
    ) -> Result<TransactionState, TransactionError> {
        match next_state(self.state, op, flags) {
            Ok(next) => {
                if next == TransactionState::Failed && self.state != TransactionState::Failed {
                    self.fail_from = Some(self.state);
                }
                self.state = next;
                Ok(next)
            }
            Err(err) => match (self.state, self.fail_from) {
                (TransactionState::Failed, Some(fail_from)) => {
                    Err(TransactionError::FromFailedState {
                        op,
                        flags,
                        fail_from,
                        not_modified: fail_from == TransactionState::Started
                            && op == TransactionOp::End,
                    })
                }
                _ => Err(err),
            },
        }
    }

    /// Applies an outcome propagated from another broker.
    ///
    /// # Errors
    ///
    /// Returns the error from [`remote_next_state`].
    pub fn resolve_remote(
        &mut self,
        target: TransactionState,
    ) -> Result<TransactionState, TransactionError> {
        let next = remote_next_state(self.state, target)?;
        self.state = next;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use TransactionState as S;

    const FLAG_CHOICES: [XaFlags; 8] = [
        XaFlags::NO_FLAGS,
        XaFlags::JOIN,
        XaFlags::RESUME,
        XaFlags::SUSPEND,
        XaFlags::FAIL,
        XaFlags::SUCCESS,
        XaFlags::ONE_PHASE,
        XaFlags(0x0400_0000 | 0x4000_0000),
    ];

    /// Transition table written out row by row, independent of `next_state`.
    fn expected(state: S, op: TransactionOp, flags: XaFlags) -> Option<S> {
        let f = flags.0;
        let has = |bit: u32| f != 0 && f & bit == bit;
        match op {
            TransactionOp::Start if f == 0 => {
                matches!(state, S::Created | S::Complete | S::Started).then_some(S::Started)
            }
            TransactionOp::Start if has(0x0020_0000) => {
                matches!(state, S::Started | S::Complete).then_some(S::Started)
            }
            TransactionOp::Start if has(0x0800_0000) => {
                matches!(state, S::Incomplete | S::Started).then_some(S::Started)
            }
            TransactionOp::Start => None,
            TransactionOp::End if has(0x0200_0000) => {
                matches!(state, S::Started | S::Incomplete).then_some(S::Incomplete)
            }
            TransactionOp::End if has(0x2000_0000) => {
                matches!(state, S::Started | S::Incomplete | S::Failed).then_some(S::Failed)
            }
            TransactionOp::End if has(0x0400_0000) || has(0x4000_0000) => {
                matches!(state, S::Started | S::Incomplete | S::Complete).then_some(S::Complete)
            }
            TransactionOp::End => None,
            TransactionOp::Prepare => {
                matches!(state, S::Complete | S::Prepared).then_some(S::Prepared)
            }
            TransactionOp::Commit if has(0x4000_0000) => {
                matches!(state, S::Complete | S::Committed).then_some(S::Committed)
            }
            TransactionOp::Commit => {
                matches!(state, S::Prepared | S::Committed).then_some(S::Committed)
            }
            TransactionOp::Rollback => matches!(
                state,
                S::Complete | S::Incomplete | S::Prepared | S::Failed | S::RolledBack
            )
            .then_some(S::RolledBack),
        }
    }

    #[test]
    fn end_success_from_started_is_complete() {
        assert_eq!(
            next_state(S::Started, TransactionOp::End, XaFlags::SUCCESS),
            Ok(S::Complete)
        );
    }

    #[test]
    fn start_from_rolled_back_is_illegal() {
        let err = next_state(S::RolledBack, TransactionOp::Start, XaFlags::NO_FLAGS).unwrap_err();
        assert_eq!(
            err,
            TransactionError::IllegalTransition {
                op: TransactionOp::Start,
                flags: XaFlags::NO_FLAGS,
                state: S::RolledBack,
            }
        );
        let msg = err.to_string();
        assert!(msg.contains("START_TRANSACTION"));
        assert!(msg.contains("TMNOFLAGS"));
        assert!(msg.contains("ROLLEDBACK(7)"));
    }

    #[test]
    fn commit_without_one_phase_requires_prepare() {
        assert!(next_state(S::Complete, TransactionOp::Commit, XaFlags::NO_FLAGS).is_err());
        assert_eq!(
            next_state(S::Complete, TransactionOp::Commit, XaFlags::ONE_PHASE),
            Ok(S::Committed)
        );
        assert_eq!(
            next_state(S::Prepared, TransactionOp::Commit, XaFlags::NO_FLAGS),
            Ok(S::Committed)
        );
    }

    #[test]
    fn timed_out_is_terminal() {
        for op in TransactionOp::ALL {
            for flags in FLAG_CHOICES {
                assert!(next_state(S::TimedOut, op, flags).is_err());
            }
        }
    }

    #[test]
    fn full_table_matches_written_rules() {
        for state in S::ALL {
            for op in TransactionOp::ALL {
                for flags in FLAG_CHOICES {
                    let got = next_state(state, op, flags).ok();
                    assert_eq!(got, expected(state, op, flags), "{state} {op} {flags}");
                }
            }
        }
    }

    #[test]
    fn no_flags_matches_only_itself() {
        assert!(XaFlags::NO_FLAGS.is_set(XaFlags::NO_FLAGS));
        assert!(!XaFlags::SUCCESS.is_set(XaFlags::NO_FLAGS));
        assert!(!XaFlags::NO_FLAGS.is_set(XaFlags::SUCCESS));
        assert!(XaFlags::SUCCESS.union(XaFlags::ONE_PHASE).is_set(XaFlags::ONE_PHASE));
        assert_eq!(XaFlags::from(None), XaFlags::NO_FLAGS);
    }

    #[test]
    fn flags_display_lists_names() {
        assert_eq!(XaFlags::NO_FLAGS.to_string(), "0x0:TMNOFLAGS");
        assert_eq!(
            XaFlags::SUCCESS.union(XaFlags::ONE_PHASE).to_string(),
            "0x44000000:TMONEPHASE|TMSUCCESS"
        );
    }

    #[test]
    fn remote_rules_only_resolve_prepared() {
        assert_eq!(remote_next_state(S::Prepared, S::Committed), Ok(S::Committed));
        assert_eq!(remote_next_state(S::Committed, S::Committed), Ok(S::Committed));
        assert_eq!(remote_next_state(S::Prepared, S::RolledBack), Ok(S::RolledBack));
        assert_eq!(remote_next_state(S::RolledBack, S::RolledBack), Ok(S::RolledBack));

        // No FAILED or INCOMPLETE path for remote transactions.
        assert!(remote_next_state(S::Failed, S::RolledBack).is_err());
        assert!(remote_next_state(S::Incomplete, S::RolledBack).is_err());
        assert!(remote_next_state(S::Committed, S::RolledBack).is_err());
        assert!(remote_next_state(S::Prepared, S::Started).is_err());

        let msg = remote_next_state(S::Complete, S::Committed)
            .unwrap_err()
            .to_string();
        assert_eq!(
            msg,
            "transaction state COMPLETE(4) can not transit to state COMMITTED(6)"
        );
    }

    #[test]
    fn record_tracks_failure_origin() {
        let mut rec = TransactionRecord::new(1, "guest", "conn-1", 0);
        rec.transition(TransactionOp::Start, XaFlags::NO_FLAGS).unwrap();
        rec.transition(TransactionOp::End, XaFlags::FAIL).unwrap();
        assert_eq!(rec.state, S::Failed);
        assert_eq!(rec.fail_from, Some(S::Started));

        let err = rec
            .transition(TransactionOp::End, XaFlags::SUCCESS)
            .unwrap_err();
        assert_eq!(
            err,
            TransactionError::FromFailedState {
                op: TransactionOp::End,
                flags: XaFlags::SUCCESS,
                fail_from: S::Started,
                not_modified: true,
            }
        );
        // State untouched by the rejected call.
        assert_eq!(rec.state, S::Failed);

        rec.transition(TransactionOp::Rollback, XaFlags::NO_FLAGS).unwrap();
        assert_eq!(rec.state, S::RolledBack);
    }

    #[test]
    fn record_two_phase_lifecycle() {
        let mut rec = TransactionRecord::new(9, "guest", "conn-9", 100);
        rec.transition(TransactionOp::Start, XaFlags::NO_FLAGS).unwrap();
        rec.transition(TransactionOp::End, XaFlags::SUSPEND).unwrap();
        rec.transition(TransactionOp::Start, XaFlags::RESUME).unwrap();
        rec.transition(TransactionOp::End, XaFlags::SUCCESS).unwrap();
        rec.transition(TransactionOp::Prepare, XaFlags::NO_FLAGS).unwrap();
        assert_eq!(rec.resolve_remote(S::Committed), Ok(S::Committed));
    }

    #[test]
    fn state_numbering_round_trips() {
        for state in S::ALL {
            assert_eq!(S::from_u8(state.as_u8()), Some(state));
        }
        assert_eq!(S::from_u8(9), None);
        assert!(S::Complete < S::Prepared);
    }

    proptest! {
        #[test]
        fn arbitrary_flag_bits_follow_written_rules(
            state_idx in 0usize..9,
            op_idx in 0usize..5,
            bits in any::<u32>(),
        ) {
            let state = S::ALL[state_idx];
            let op = TransactionOp::ALL[op_idx];
            let flags = XaFlags(bits);
            prop_assert_eq!(next_state(state, op, flags).ok(), expected(state, op, flags));
        }
    }
}
