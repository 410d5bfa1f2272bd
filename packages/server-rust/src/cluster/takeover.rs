//! Progress tracking for one in-flight takeover of a failed broker's store.
//!
//! A [`TakeoverTracker`] is written by exactly one runner, the task holding
//! its [`RunnerToken`], and read by anyone. Stage values only move forward.
//! While the store owner switch runs, [`TakeoverTracker::stage`] reports the
//! switch sub-stage in place of the main stage.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use mqcluster_core::{BrokerSessionUid, StoreSessionUid};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::error::ClusterError;

// ---------------------------------------------------------------------------
// TakeoverStage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum TakeoverStage {
    BeforeGetLock = 0,
    AfterGetLock = 1,
    BeforeTakeStore = 2,
    /// Sub-stage of `BeforeTakeStore`.
    BeforeDbSwitchOwner = 3,
    /// Sub-stage of `BeforeTakeStore`.
    AfterDbSwitchOwner = 4,
    AfterTakeStore = 5,
    BeforeProcessing = 6,
    AfterProcessing = 7,
}

const NO_SUBSTAGE: u8 = u8::MAX;

impl TakeoverStage {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::BeforeGetLock,
            1 => Self::AfterGetLock,
            2 => Self::BeforeTakeStore,
            3 => Self::BeforeDbSwitchOwner,
            4 => Self::AfterDbSwitchOwner,
            5 => Self::AfterTakeStore,
            6 => Self::BeforeProcessing,
            7 => Self::AfterProcessing,
            _ => return None,
        })
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn is_substage(self) -> bool {
        matches!(self, Self::BeforeDbSwitchOwner | Self::AfterDbSwitchOwner)
    }
}

impl fmt::Display for TakeoverStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BeforeGetLock => "BEFORE_GET_LOCK",
            Self::AfterGetLock => "AFTER_GET_LOCK",
            Self::BeforeTakeStore => "BEFORE_TAKE_STORE",
            Self::BeforeDbSwitchOwner => "BEFORE_DB_SWITCH_OWNER",
            Self::AfterDbSwitchOwner => "AFTER_DB_SWITCH_OWNER",
            Self::AfterTakeStore => "AFTER_TAKE_STORE",
            Self::BeforeProcessing => "BEFORE_PROCESSING",
            Self::AfterProcessing => "AFTER_PROCESSING",
        })
    }
}

// ---------------------------------------------------------------------------
// MessageMap
// ---------------------------------------------------------------------------

/// Immutable snapshot of the taken-over messages: message id to destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMap {
    by_message: HashMap<String, String>,
    destinations: HashSet<String>,
}

impl MessageMap {
    #[must_use]
    pub fn new(by_message: HashMap<String, String>) -> Self {
        let destinations = by_message.values().cloned().collect();
        Self {
            by_message,
            destinations,
        }
    }

    #[must_use]
    pub fn contains_message(&self, message_id: &str) -> bool {
        self.by_message.contains_key(message_id)
    }

    #[must_use]
    pub fn contains_destination(&self, destination: &str) -> bool {
        self.destinations.contains(destination)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_message.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_message.is_empty()
    }
}

// ---------------------------------------------------------------------------
// TakeoverTracker
// ---------------------------------------------------------------------------

/// Write capability for one tracker. Not `Clone`.
#[derive(Debug)]
pub struct RunnerToken {
    id: Uuid,
}

#[derive(Debug)]
pub struct TakeoverTracker {
    target: String,
    broker_session: BrokerSessionUid,
    last_heartbeat_ms: u64,
    runner: Uuid,
    stage: AtomicU8,
    substage: AtomicU8,
    store_session: RwLock<Option<StoreSessionUid>>,
    down_store_session: RwLock<Option<StoreSessionUid>>,
    absorbed_sessions: RwLock<Vec<StoreSessionUid>>,
    message_map: ArcSwapOption<MessageMap>,
    needs_reintegration: AtomicBool,
}

impl TakeoverTracker {
    /// Creates a tracker at `BeforeGetLock` and the token that may advance it.
    #[must_use]
    pub fn new(
        target: impl Into<String>,
        store_session: Option<StoreSessionUid>,
        broker_session: BrokerSessionUid,
        last_heartbeat_ms: u64,
    ) -> (Arc<Self>, RunnerToken) {
        let runner = Uuid::new_v4();
        let tracker = Arc::new(Self {
            target: target.into(),
            broker_session,
            last_heartbeat_ms,
            runner,
            stage: AtomicU8::new(TakeoverStage::BeforeGetLock.as_u8()),
            substage: AtomicU8::new(NO_SUBSTAGE),
            store_session: RwLock::new(store_session),
            down_store_session: RwLock::new(None),
            absorbed_sessions: RwLock::new(Vec::new()),
            message_map: ArcSwapOption::empty(),
            needs_reintegration: AtomicBool::new(false),
        });
        (tracker, RunnerToken { id: runner })
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    #[must_use]
    pub fn broker_session(&self) -> BrokerSessionUid {
        self.broker_session
    }

    #[must_use]
    pub fn last_heartbeat_ms(&self) -> u64 {
        self.last_heartbeat_ms
    }

    #[must_use]
    pub fn store_session(&self) -> Option<StoreSessionUid> {
        *self.store_session.read()
    }

    #[must_use]
    pub fn down_store_session(&self) -> Option<StoreSessionUid> {
        *self.down_store_session.read()
    }

    /// Store sessions the target had absorbed from earlier takeovers.
    #[must_use]
    pub fn absorbed_sessions(&self) -> Vec<StoreSessionUid> {
        self.absorbed_sessions.read().clone()
    }

    /// Current stage; the owner-switch sub-stage while one is set.
    #[must_use]
    pub fn stage(&self) -> TakeoverStage {
        let sub = self.substage.load(Ordering::Acquire);
        if sub != NO_SUBSTAGE {
            if let Some(stage) = TakeoverStage::from_u8(sub) {
                return stage;
            }
        }
        self.main_stage()
    }

    #[must_use]
    pub fn main_stage(&self) -> TakeoverStage {
        TakeoverStage::from_u8(self.stage.load(Ordering::Acquire))
            .unwrap_or(TakeoverStage::BeforeGetLock)
    }

    #[must_use]
    pub fn needs_reintegration(&self) -> bool {
        self.needs_reintegration.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn message_map(&self) -> Option<Arc<MessageMap>> {
        self.message_map.load_full()
    }

    // -- Queries answerable from any thread ---------------------------------

    /// True if `(broker_id, store_session)` names the store being taken over.
    #[must_use]
    pub fn matches(&self, broker_id: &str, store_session: StoreSessionUid) -> bool {
        if self.target != broker_id {
            return false;
        }
        self.store_session() == Some(store_session)
            || self.down_store_session() == Some(store_session)
            || self.absorbed_sessions.read().contains(&store_session)
    }

    #[must_use]
    pub fn contains_message(&self, message_id: &str) -> bool {
        self.message_map
            .load()
            .as_ref()
            .is_some_and(|map| map.contains_message(message_id))
    }

    #[must_use]
    pub fn contains_destination(&self, destination: &str) -> bool {
        self.message_map
            .load()
            .as_ref()
            .is_some_and(|map| map.contains_destination(destination))
    }

    // -- Runner-only mutators -----------------------------------------------

    /// Advances the stage. Owner-switch stages are recorded as the sub-stage
    /// of `BeforeTakeStore`; reaching `AfterTakeStore` clears the sub-stage.
    ///
    /// # Errors
    ///
    /// [`ClusterError::Internal`] for a foreign token, a stage regression, or
    /// an owner-switch stage outside `BeforeTakeStore`.
    pub fn set_stage(&self, token: &RunnerToken, stage: TakeoverStage) -> Result<(), ClusterError> {
        self.check_runner(token, "set_stage")?;
        let current = self.stage();
        if stage < current {
            return Err(self.violation(format!("stage regression {current} -> {stage}")));
        }
        if stage.is_substage() {
            if self.main_stage() != TakeoverStage::BeforeTakeStore {
                return Err(self.violation(format!(
                    "sub-stage {stage} outside {}",
                    TakeoverStage::BeforeTakeStore
                )));
            }
            self.substage.store(stage.as_u8(), Ordering::Release);
            return Ok(());
        }
        self.stage.store(stage.as_u8(), Ordering::Release);
        if stage >= TakeoverStage::AfterTakeStore {
            self.substage.store(NO_SUBSTAGE, Ordering::Release);
        }
        Ok(())
    }

    /// Installs the taken-over message snapshot.
    ///
    /// # Errors
    ///
    /// [`ClusterError::Internal`] for a foreign token, or when the stage lies
    /// outside `AfterGetLock..=BeforeDbSwitchOwner`.
    pub fn set_message_map(
        &self,
        token: &RunnerToken,
        map: MessageMap,
    ) -> Result<(), ClusterError> {
        self.check_runner(token, "set_message_map")?;
        let stage = self.stage();
        if stage < TakeoverStage::AfterGetLock || stage > TakeoverStage::BeforeDbSwitchOwner {
            return Err(self.violation(format!("set_message_map at stage {stage}")));
        }
        self.message_map.store(Some(Arc::new(map)));
        Ok(())
    }

    /// # Errors
    ///
    /// [`ClusterError::Internal`] for a foreign token.
    pub fn set_store_session(
        &self,
        token: &RunnerToken,
        session: StoreSessionUid,
    ) -> Result<(), ClusterError> {
        self.check_runner(token, "set_store_session")?;
        *self.store_session.write() = Some(session);
        Ok(())
    }

    /// # Errors
    ///
    /// [`ClusterError::Internal`] for a foreign token.
    pub fn set_down_store_session(
        &self,
        token: &RunnerToken,
        session: StoreSessionUid,
    ) -> Result<(), ClusterError> {
        self.check_runner(token, "set_down_store_session")?;
        *self.down_store_session.write() = Some(session);
        Ok(())
    }

    /// # Errors
    ///
    /// [`ClusterError::Internal`] for a foreign token.
    pub fn add_store_session(
        &self,
        token: &RunnerToken,
        session: StoreSessionUid,
    ) -> Result<(), ClusterError> {
        self.check_runner(token, "add_store_session")?;
        let mut sessions = self.absorbed_sessions.write();
        if !sessions.contains(&session) {
            sessions.push(session);
        }
        Ok(())
    }

    /// # Errors
    ///
    /// [`ClusterError::Internal`] for a foreign token.
    pub fn set_needs_reintegration(
        &self,
        token: &RunnerToken,
        value: bool,
    ) -> Result<(), ClusterError> {
        self.check_runner(token, "set_needs_reintegration")?;
        self.needs_reintegration.store(value, Ordering::Release);
        Ok(())
    }

    fn check_runner(&self, token: &RunnerToken, op: &str) -> Result<(), ClusterError> {
        if token.id == self.runner {
            Ok(())
        } else {
            Err(self.violation(format!("{op} called without the runner token")))
        }
    }

    fn violation(&self, detail: String) -> ClusterError {
        error!("takeover tracker for {}: {detail}", self.target);
        ClusterError::Internal(format!("takeover tracker for {}: {detail}", self.target))
    }
}

impl fmt::Display for TakeoverTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "takeover[{}", self.target)?;
        if let Some(ss) = self.store_session() {
            write!(f, " ss={ss}")?;
        }
        write!(f, " bs={} stage={}]", self.broker_session, self.stage())
    }
}
