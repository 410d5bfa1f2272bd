//! HA monitor: local heartbeat upkeep, in-doubt tracking and store takeover.
//!
//! Every monitor pass writes this broker's heartbeat to the shared store,
//! mirrors the store's broker rows into the [`BrokerList`](super::broker_list::BrokerList)
//! and re-evaluates brokers whose heartbeat went stale. A broker that stays
//! in doubt for `max_monitor_count` passes becomes a takeover candidate.
//!
//! A takeover is arbitrated by the store's takeover lock. The loser of a
//! race touches nothing and reports [`ClusterError::TakeoverLockLost`].
//! Until a takeover reaches `AfterProcessing`, its target store is reported
//! by [`HaMonitor::is_takingover_target`] so that routing can hold off.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use dashmap::DashMap;
use mqcluster_core::{BrokerSessionUid, ClusterPacket, StoreSessionUid, TransactionState};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::integration::TakeoverIntegrator;
use super::messages::{notification, prop, request, status, PacketType, TakeoverPayload};
use super::reply::{ReplyWaiter, TakeoverPending};
use super::takeover::{MessageMap, RunnerToken, TakeoverStage, TakeoverTracker};
use super::types::{check_can_takeover, BrokerAddress, BrokerState, ClusteredBroker};
use crate::config::AutoRollback;
use crate::context::BrokerContext;
use crate::error::ClusterError;
use crate::store::{BrokerRecord, TakenStore, TakeoverLock};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A broker judged dead, as observed by the pass that judged it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakeoverCandidate {
    pub broker_id: String,
    pub broker_session: BrokerSessionUid,
    pub store_session: Option<StoreSessionUid>,
    /// Heartbeat the takeover lock is compared against.
    pub last_heartbeat_ms: u64,
    pub state: BrokerState,
}

impl From<&BrokerRecord> for TakeoverCandidate {
    fn from(record: &BrokerRecord) -> Self {
        Self {
            broker_id: record.broker_id().to_string(),
            broker_session: record.broker_session(),
            store_session: record.store_session,
            last_heartbeat_ms: record.heartbeat_ms,
            state: record.state,
        }
    }
}

/// Result of one monitor pass.
#[derive(Debug, Default)]
pub struct MonitorReport {
    pub heartbeat_ok: bool,
    /// Brokers still in doubt after the pass.
    pub in_doubt: usize,
    pub takeover_candidates: Vec<TakeoverCandidate>,
    /// Parked takeovers whose integration completed during the pass.
    pub reintegrated: Vec<String>,
}

/// A takeover of `broker_id` announced by peer `from`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakeoverEntry {
    pub broker_id: String,
    pub store_session: Option<StoreSessionUid>,
    pub broker_session: BrokerSessionUid,
    pub xid: Option<u64>,
    pub from: BrokerAddress,
}

#[derive(Debug, Clone, Copy)]
struct InDoubt {
    broker_session: BrokerSessionUid,
    heartbeat_ms: u64,
    count: u32,
}

/// A takeover that owns the target's store but has not finished processing.
struct Reintegration {
    tracker: Arc<TakeoverTracker>,
    token: RunnerToken,
    lock: TakeoverLock,
    /// `None` when the owner switch happened but the store was not read.
    taken: Option<TakenStore>,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn claim(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// HaMonitor
// ---------------------------------------------------------------------------

pub struct HaMonitor {
    ctx: Arc<BrokerContext>,
    integrator: Arc<dyn TakeoverIntegrator>,
    trackers: DashMap<String, Arc<TakeoverTracker>>,
    reintegration: Mutex<HashMap<String, Reintegration>>,
    remote_pending: DashMap<String, TakeoverEntry>,
    in_doubt: Mutex<HashMap<String, InDoubt>>,
    /// Set while a takeover runs. One takeover at a time.
    busy: AtomicBool,
    missed_heartbeats: AtomicU32,
}

impl HaMonitor {
    #[must_use]
    pub fn new(ctx: Arc<BrokerContext>, integrator: Arc<dyn TakeoverIntegrator>) -> Self {
        Self {
            ctx,
            integrator,
            trackers: DashMap::new(),
            reintegration: Mutex::new(HashMap::new()),
            remote_pending: DashMap::new(),
            in_doubt: Mutex::new(HashMap::new()),
            busy: AtomicBool::new(false),
            missed_heartbeats: AtomicU32::new(0),
        }
    }

    // -- Periodic monitoring --------------------------------------------------

    /// Runs monitor passes every `monitor_interval` until `shutdown_rx`
    /// flips. Takeover candidates are processed one after another on a
    /// spawned task.
    ///
    /// # Errors
    ///
    /// Returns the fatal error of [`monitor_once`](Self::monitor_once); the
    /// node is expected to restart.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), ClusterError> {
        let mut ticker = tokio::time::interval(self.ctx.config.monitor_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "HA monitor started for {} (interval {:?})",
            self.ctx.local,
            self.ctx.config.monitor_interval()
        );
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {}
            }
            if *shutdown_rx.borrow() {
                break;
            }
            let report = self.monitor_once().await?;
            if report.takeover_candidates.is_empty() {
                continue;
            }
            let monitor = Arc::clone(&self);
            tokio::spawn(async move {
                for candidate in report.takeover_candidates {
                    let target = candidate.broker_id.clone();
                    if let Err(e) = monitor.takeover_candidate(candidate).await {
                        debug!("takeover of {target} ended with {e}");
                    }
                }
            });
        }
        info!("HA monitor stopped");
        Ok(())
    }

    /// One monitor pass.
    ///
    /// # Errors
    ///
    /// [`ClusterError::Store`] once the local heartbeat could not be written
    /// `max_monitor_count` times in a row, or when the broker rows can not
    /// be read.
    pub async fn monitor_once(&self) -> Result<MonitorReport, ClusterError> {
        let ctx = &self.ctx;
        let max = ctx.config.max_monitor_count;
        let mut report = MonitorReport::default();

        match ctx
            .store
            .update_heartbeat(ctx.broker_id(), ctx.broker_session(), ctx.now())
            .await
        {
            Ok(_) => {
                self.missed_heartbeats.store(0, Ordering::Release);
                report.heartbeat_ok = true;
            }
            Err(e) => {
                let missed = self.missed_heartbeats.fetch_add(1, Ordering::AcqRel) + 1;
                if missed >= max {
                    error!("Heartbeat update failed {missed} times in a row: {e}");
                    return Err(ClusterError::Store(anyhow!(
                        "heartbeat update failed {missed} times in a row: {e}"
                    )));
                }
                warn!("Heartbeat update failed ({missed}/{max}): {e}");
            }
        }

        if ctx.lifecycle.is_shutting_down() {
            return Ok(report);
        }
        let records = ctx.store.all_brokers().await?;
        if let Some(local) = records.iter().find(|r| r.broker_id() == ctx.broker_id()) {
            if local.state.is_quiet() {
                debug!("local broker is {}; skipping monitor pass", local.state);
                return Ok(report);
            }
        }
        self.sync_brokers(&records);
        self.detect_stale(&records);

        let in_doubt = self.in_doubt.lock().len();
        if in_doubt > 0 {
            info!("{in_doubt} broker(s) in doubt");
        }
        report.takeover_candidates = self.evaluate_in_doubt(&records);
        report.in_doubt = self.in_doubt.lock().len();
        report.reintegrated = self.retry_parked().await;
        Ok(report)
    }

    /// Retries every takeover parked for reintegration. A failure leaves it
    /// parked for the next pass.
    async fn retry_parked(&self) -> Vec<String> {
        let targets: Vec<String> = self.reintegration.lock().keys().cloned().collect();
        let mut done = Vec::new();
        for target in targets {
            match self.retry_integration(&target).await {
                Ok(()) => done.push(target),
                Err(e) => warn!("Takeover of {target} still awaits reintegration: {e}"),
            }
        }
        done
    }

    /// Starts watching `broker_id` from its last known heartbeat.
    pub fn mark_in_doubt(&self, broker_id: &str, broker_session: BrokerSessionUid) {
        let heartbeat_ms = self
            .ctx
            .brokers
            .get(broker_id)
            .map_or(0, |entry| entry.heartbeat_ms);
        self.add_in_doubt(broker_id, broker_session, heartbeat_ms);
    }

    fn add_in_doubt(&self, broker_id: &str, broker_session: BrokerSessionUid, heartbeat_ms: u64) {
        if broker_id == self.ctx.broker_id() || self.trackers.contains_key(broker_id) {
            return;
        }
        {
            let mut in_doubt = self.in_doubt.lock();
            if in_doubt.contains_key(broker_id) {
                return;
            }
            in_doubt.insert(
                broker_id.to_string(),
                InDoubt {
                    broker_session,
                    heartbeat_ms,
                    count: 0,
                },
            );
        }
        info!("Broker {broker_id} is in doubt (last heartbeat {heartbeat_ms})");
        let guard = self.ctx.brokers.lock();
        self.ctx
            .brokers
            .update_entry(&guard, broker_id, |entry| entry.in_doubt = true);
    }

    fn sync_brokers(&self, records: &[BrokerRecord]) {
        let brokers = &self.ctx.brokers;
        let guard = brokers.lock();
        for record in records {
            let found = brokers.update_entry(&guard, record.broker_id(), |entry| {
                if !entry.is_up {
                    entry.address = record.address.clone();
                }
                entry.heartbeat_ms = record.heartbeat_ms;
                entry.store_session = record.store_session;
            });
            if found {
                brokers.set_state(&guard, record.broker_id(), record.state);
            } else {
                let mut entry = ClusteredBroker::new(record.address.clone(), record.state);
                entry.heartbeat_ms = record.heartbeat_ms;
                entry.store_session = record.store_session;
                brokers.add_broker(&guard, entry);
            }
        }
    }

    fn detect_stale(&self, records: &[BrokerRecord]) {
        let now = self.ctx.now();
        let stale_after = self.ctx.config.heartbeat_stale_after_ms();
        for record in records {
            let stale = now.saturating_sub(record.heartbeat_ms) > stale_after;
            let watch = record.state == BrokerState::ShutdownFailover
                || (stale && check_can_takeover(record.broker_id(), record.state).is_ok());
            if watch {
                self.add_in_doubt(record.broker_id(), record.broker_session(), record.heartbeat_ms);
            }
        }
    }

    fn evaluate_in_doubt(&self, records: &[BrokerRecord]) -> Vec<TakeoverCandidate> {
        let max = self.ctx.config.max_monitor_count;
        let ha_enabled = self.ctx.config.ha_enabled;
        let by_id: HashMap<&str, &BrokerRecord> =
            records.iter().map(|r| (r.broker_id(), r)).collect();
        let mut candidates = Vec::new();
        let mut down = Vec::new();
        let mut cleared = Vec::new();

        self.in_doubt.lock().retain(|id, entry| {
            let Some(record) = by_id
                .get(id.as_str())
                .filter(|r| r.broker_session() == entry.broker_session)
            else {
                debug!("broker {id} restarted or left; no longer in doubt");
                cleared.push(id.clone());
                return false;
            };
            match record.state {
                BrokerState::ShutdownComplete => {
                    info!("Broker {id} shut down cleanly; not taking over");
                    down.push(id.clone());
                    false
                }
                BrokerState::FailoverStarted
                | BrokerState::FailoverComplete
                | BrokerState::FailoverProcessed => {
                    info!("Broker {id} is taken over by another broker ({})", record.state);
                    down.push(id.clone());
                    false
                }
                state
                    if record.heartbeat_ms > entry.heartbeat_ms
                        && state != BrokerState::FailoverPending =>
                {
                    info!("Broker {id} is OK");
                    cleared.push(id.clone());
                    false
                }
                state => {
                    entry.count += 1;
                    if entry.count < max && state != BrokerState::ShutdownFailover {
                        info!("Broker {id} still in doubt ({}/{max})", entry.count);
                        return true;
                    }
                    if !ha_enabled {
                        debug!("broker {id} is not OK; HA disabled, not taking over");
                        return true;
                    }
                    if self.busy.load(Ordering::Acquire) || self.trackers.contains_key(id) {
                        info!("Broker {id} is not OK; a takeover is already running");
                        return true;
                    }
                    info!("Broker {id} is not OK; scheduling takeover");
                    candidates.push(TakeoverCandidate::from(*record));
                    down.push(id.clone());
                    false
                }
            }
        });

        if !down.is_empty() || !cleared.is_empty() {
            let guard = self.ctx.brokers.lock();
            for id in &down {
                self.ctx.brokers.update_entry(&guard, id, |entry| {
                    entry.is_up = false;
                    entry.in_doubt = false;
                });
            }
            for id in &cleared {
                self.ctx
                    .brokers
                    .update_entry(&guard, id, |entry| entry.in_doubt = false);
            }
        }
        candidates
    }

    // -- Takeover ---------------------------------------------------------------

    /// Takes over `target` as it is currently recorded in the store.
    ///
    /// # Errors
    ///
    /// See [`takeover_candidate`](Self::takeover_candidate).
    pub async fn takeover(&self, target: &str) -> Result<(), ClusterError> {
        let record = self
            .ctx
            .store
            .broker_record(target)
            .await?
            .ok_or_else(|| ClusterError::UnknownBroker(target.to_string()))?;
        self.takeover_candidate(TakeoverCandidate::from(&record)).await
    }

    /// Takes over the store of `candidate`, compare-and-setting against the
    /// heartbeat and state it was observed with.
    ///
    /// # Errors
    ///
    /// - [`ClusterError::TakeoverLockLost`] if another broker won the race
    /// - [`ClusterError::NotAllowed`] / [`ClusterError::Conflict`] if the
    ///   observed state forbids a takeover
    /// - [`ClusterError::Rejected`] if another takeover runs, HA is off or
    ///   the node is shutting down
    /// - [`ClusterError::TakeoverFailed`] for any failure after the lock was
    ///   won; see [`retry_integration`](Self::retry_integration)
    pub async fn takeover_candidate(
        &self,
        candidate: TakeoverCandidate,
    ) -> Result<(), ClusterError> {
        let ctx = &self.ctx;
        let target = candidate.broker_id.clone();
        if !ctx.config.ha_enabled {
            return Err(ClusterError::rejected(status::NOT_ALLOWED, "HA is disabled"));
        }
        let _op = ctx
            .lifecycle
            .begin_operation("takeover")
            .ok_or_else(|| ClusterError::rejected(status::UNAVAILABLE, "node is shutting down"))?;
        let _busy = BusyGuard::claim(&self.busy).ok_or_else(|| {
            ClusterError::rejected(status::CONFLICT, "another takeover is running")
        })?;
        if self.trackers.contains_key(&target) {
            return Err(ClusterError::Conflict {
                broker: target,
                state: candidate.state,
            });
        }

        let (tracker, token) = TakeoverTracker::new(
            target.clone(),
            candidate.store_session,
            candidate.broker_session,
            candidate.last_heartbeat_ms,
        );
        self.trackers.insert(target.clone(), Arc::clone(&tracker));
        info!("Starting takeover of {target}: {tracker}");

        self.announce_pending(&candidate).await;

        let lock = match self.lock_target(&candidate, &tracker, &token).await {
            Ok(lock) => lock,
            Err(e) => {
                self.trackers.remove(&target);
                self.broadcast(PacketType::TakeoverAbort, &candidate).await;
                if matches!(
                    e,
                    ClusterError::TakeoverLockLost { .. }
                        | ClusterError::Conflict { .. }
                        | ClusterError::NotAllowed { .. }
                ) {
                    info!("Takeover of {target} not performed: {e}");
                    return Err(e);
                }
                warn!("Takeover of {target} failed before locking its store: {e}");
                return Err(failed(&target, tracker.stage(), e));
            }
        };

        let taken = match self.take_store(&lock, &tracker, &token).await {
            Ok(taken) => taken,
            Err(e) => {
                let stage = tracker.stage();
                if stage < TakeoverStage::AfterDbSwitchOwner {
                    self.abandon(&candidate, &lock).await;
                    warn!("Takeover of {target} failed at {stage}, lock released: {e}");
                } else {
                    error!("Takeover of {target} failed at {stage} after its store moved: {e}");
                    self.keep_for_reintegration(tracker, token, lock, None);
                }
                return Err(failed(&target, stage, e));
            }
        };

        match self.process(&lock, &taken, &tracker, &token).await {
            Ok(()) => {
                self.finish(&candidate, &taken).await;
                Ok(())
            }
            Err(e) => {
                let stage = tracker.stage();
                error!("Takeover of {target} failed at {stage}; store kept for reintegration: {e}");
                self.keep_for_reintegration(tracker, token, lock, Some(taken));
                Err(failed(&target, stage, e))
            }
        }
    }

    /// Re-runs the processing steps of a takeover that failed after the
    /// target's store was moved.
    ///
    /// # Errors
    ///
    /// [`ClusterError::UnknownBroker`] if no takeover of `target` awaits
    /// reintegration; [`ClusterError::TakeoverFailed`] if it failed again.
    pub async fn retry_integration(&self, target: &str) -> Result<(), ClusterError> {
        let _busy = BusyGuard::claim(&self.busy).ok_or_else(|| {
            ClusterError::rejected(status::CONFLICT, "another takeover is running")
        })?;
        let Some(entry) = self.reintegration.lock().remove(target) else {
            return Err(ClusterError::UnknownBroker(target.to_string()));
        };
        let Reintegration {
            tracker,
            token,
            lock,
            taken,
        } = entry;
        info!("Retrying integration of taken-over broker {target}");

        let taken = match taken {
            Some(taken) => taken,
            None => match self.complete_take_store(&lock, &tracker, &token).await {
                Ok(taken) => taken,
                Err(e) => {
                    let stage = tracker.stage();
                    self.keep_for_reintegration(tracker, token, lock, None);
                    return Err(failed(target, stage, e));
                }
            },
        };
        match self.process(&lock, &taken, &tracker, &token).await {
            Ok(()) => {
                tracker.set_needs_reintegration(&token, false)?;
                let candidate = TakeoverCandidate {
                    broker_id: target.to_string(),
                    broker_session: tracker.broker_session(),
                    store_session: tracker.store_session(),
                    last_heartbeat_ms: tracker.last_heartbeat_ms(),
                    state: lock.previous_state,
                };
                self.finish(&candidate, &taken).await;
                Ok(())
            }
            Err(e) => {
                let stage = tracker.stage();
                error!("Reintegration of {target} failed at {stage}: {e}");
                self.keep_for_reintegration(tracker, token, lock, Some(taken));
                Err(failed(target, stage, e))
            }
        }
    }

    async fn announce_pending(&self, candidate: &TakeoverCandidate) {
        let ctx = &self.ctx;
        let peers = self.peers_except(&candidate.broker_id);
        let xid = ctx.next_xid();
        let pending = request(PacketType::TakeoverPending, xid);
        let packet = match takeover_packet(pending, candidate, ctx) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("failed to encode takeover announcement: {e}");
                return;
            }
        };
        let waiter = ctx
            .replies
            .add_waiter(xid, ReplyWaiter::new(peers.iter().cloned(), TakeoverPending));
        for unreachable in ctx.send_all(&peers, &packet).await {
            waiter.remove_participant(&unreachable, true, false);
        }
        if let Err(e) = ctx.replies.wait_for_reply(xid, ctx.config.reply_timeout()).await {
            warn!(
                "Takeover of {}: not every peer acknowledged the announcement: {e}",
                candidate.broker_id
            );
        }
    }

    async fn lock_target(
        &self,
        candidate: &TakeoverCandidate,
        tracker: &TakeoverTracker,
        token: &RunnerToken,
    ) -> Result<TakeoverLock, ClusterError> {
        let ctx = &self.ctx;
        check_can_takeover(&candidate.broker_id, candidate.state)?;
        tracker.set_stage(token, TakeoverStage::BeforeGetLock)?;
        let lock = ctx
            .store
            .acquire_takeover_lock(
                &candidate.broker_id,
                ctx.broker_id(),
                candidate.last_heartbeat_ms,
                candidate.state,
                ctx.now(),
            )
            .await?;
        tracker.set_stage(token, TakeoverStage::AfterGetLock)?;
        if let Some(ss) = lock.store_session {
            tracker.set_store_session(token, ss)?;
        }
        info!("Got takeover lock for {}", candidate.broker_id);
        Ok(lock)
    }

    async fn take_store(
        &self,
        lock: &TakeoverLock,
        tracker: &TakeoverTracker,
        token: &RunnerToken,
    ) -> Result<TakenStore, ClusterError> {
        let store = &self.ctx.store;
        store
            .update_state(&lock.target, BrokerState::FailoverStarted)
            .await?;
        tracker.set_stage(token, TakeoverStage::BeforeTakeStore)?;

        let listed = store.list_store(lock).await?;
        tracker.set_message_map(token, MessageMap::new(listed.messages))?;

        if store.supports_db_switch() {
            tracker.set_stage(token, TakeoverStage::BeforeDbSwitchOwner)?;
            let moved = store.switch_db_owner(lock).await?;
            for ss in moved {
                if Some(ss) != lock.store_session {
                    tracker.add_store_session(token, ss)?;
                }
            }
            tracker.set_stage(token, TakeoverStage::AfterDbSwitchOwner)?;
            info!("Switched store ownership of {} to {}", lock.target, lock.taker);
        }
        self.complete_take_store(lock, tracker, token).await
    }

    async fn complete_take_store(
        &self,
        lock: &TakeoverLock,
        tracker: &TakeoverTracker,
        token: &RunnerToken,
    ) -> Result<TakenStore, ClusterError> {
        let taken = self.ctx.store.take_over_store(lock).await?;
        if let Some(ss) = taken.store_session {
            tracker.set_down_store_session(token, ss)?;
        }
        for ss in &taken.sessions {
            if Some(*ss) != taken.store_session {
                tracker.add_store_session(token, *ss)?;
            }
        }
        tracker.set_stage(token, TakeoverStage::AfterTakeStore)?;
        info!(
            "Took over store of {}: {} destination(s), {} message(s), {} transaction(s)",
            lock.target,
            taken.destinations.len(),
            taken.messages.len(),
            taken.transactions.len()
        );
        Ok(taken)
    }

    /// Integration, transaction rollback and the final store state. Stages
    /// already passed are not repeated.
    async fn process(
        &self,
        lock: &TakeoverLock,
        taken: &TakenStore,
        tracker: &TakeoverTracker,
        token: &RunnerToken,
    ) -> Result<(), ClusterError> {
        let target = lock.target.as_str();
        if tracker.stage() < TakeoverStage::AfterProcessing {
            if tracker.stage() < TakeoverStage::BeforeProcessing {
                tracker.set_stage(token, TakeoverStage::BeforeProcessing)?;
            }
            self.integrator.integrate(target, taken).await?;
            self.roll_back_transactions(target, taken).await?;
            tracker.set_stage(token, TakeoverStage::AfterProcessing)?;
        }

        let store = &self.ctx.store;
        match taken.store_session.or(lock.store_session) {
            Some(ss) => store.set_state_failover_processed(target, ss).await?,
            None => store
                .update_state(target, BrokerState::FailoverProcessed)
                .await?,
        }
        let guard = self.ctx.brokers.lock();
        self.ctx.brokers.update_entry(&guard, target, |entry| {
            entry.is_up = false;
            entry.in_doubt = false;
        });
        self.ctx
            .brokers
            .set_state(&guard, target, BrokerState::FailoverProcessed);
        Ok(())
    }

    async fn roll_back_transactions(
        &self,
        target: &str,
        taken: &TakenStore,
    ) -> Result<(), ClusterError> {
        let policy = self.ctx.config.auto_rollback;
        let mut rolled_back = 0usize;
        for txn in &taken.transactions {
            let roll_back = match policy {
                AutoRollback::All => !matches!(
                    txn.state,
                    TransactionState::Committed
                        | TransactionState::RolledBack
                        | TransactionState::TimedOut
                ),
                AutoRollback::NotPrepared => txn.state < TransactionState::Prepared,
                AutoRollback::Never => false,
            };
            if roll_back {
                self.ctx.store.rollback_transaction(txn.tid).await?;
                rolled_back += 1;
            }
        }
        let left = taken.transactions.len() - rolled_back;
        if rolled_back > 0 || left > 0 {
            info!(
                "Takeover of {target}: rolled back {rolled_back} transaction(s), \
                 {left} left for resolution"
            );
        }
        Ok(())
    }

    async fn abandon(&self, candidate: &TakeoverCandidate, lock: &TakeoverLock) {
        let store = &self.ctx.store;
        let target = &candidate.broker_id;
        if let Err(e) = store.release_takeover_lock(lock).await {
            warn!("failed to release takeover lock of {target}: {e}");
        }
        if let Err(e) = store
            .set_state_failover_failed(target, candidate.broker_session)
            .await
        {
            warn!("failed to mark takeover of {target} failed: {e}");
        }
        self.trackers.remove(target);
        self.broadcast(PacketType::TakeoverAbort, candidate).await;
    }

    fn keep_for_reintegration(
        &self,
        tracker: Arc<TakeoverTracker>,
        token: RunnerToken,
        lock: TakeoverLock,
        taken: Option<TakenStore>,
    ) {
        if let Err(e) = tracker.set_needs_reintegration(&token, true) {
            warn!("{e}");
        }
        self.reintegration.lock().insert(
            lock.target.clone(),
            Reintegration {
                tracker,
                token,
                lock,
                taken,
            },
        );
    }

    async fn finish(&self, candidate: &TakeoverCandidate, taken: &TakenStore) {
        self.broadcast(PacketType::TakeoverComplete, candidate).await;
        self.trackers.remove(&candidate.broker_id);
        info!(
            "Takeover of {} complete: {} destination(s), {} message(s) adopted",
            candidate.broker_id,
            taken.destinations.len(),
            taken.messages.len()
        );
    }

    async fn broadcast(&self, packet_type: PacketType, candidate: &TakeoverCandidate) {
        let peers = self.peers_except(&candidate.broker_id);
        if peers.is_empty() {
            return;
        }
        match takeover_packet(notification(packet_type), candidate, &self.ctx) {
            Ok(packet) => {
                let missed = self.ctx.send_all(&peers, &packet).await;
                if !missed.is_empty() {
                    warn!(
                        "{} for {} not delivered to {} peer(s)",
                        packet_type.name(),
                        candidate.broker_id,
                        missed.len()
                    );
                }
            }
            Err(e) => warn!("failed to encode {}: {e}", packet_type.name()),
        }
    }

    fn peers_except(&self, broker_id: &str) -> Vec<BrokerAddress> {
        self.ctx
            .active_peers()
            .into_iter()
            .filter(|p| p.broker_id() != broker_id)
            .collect()
    }

    // -- Queries --------------------------------------------------------------

    /// True while the store `(broker_id, store_session)` is being taken over
    /// by this broker or, as announced, by a peer.
    #[must_use]
    pub fn is_takingover_target(&self, broker_id: &str, store_session: StoreSessionUid) -> bool {
        let local = self.trackers.get(broker_id).is_some_and(|t| {
            t.main_stage() < TakeoverStage::AfterProcessing && t.matches(broker_id, store_session)
        });
        local
            || self
                .remote_pending
                .get(broker_id)
                .is_some_and(|e| e.store_session == Some(store_session))
    }

    #[must_use]
    pub fn check_takingover_destination(&self, destination: &str) -> bool {
        self.trackers
            .iter()
            .any(|t| t.value().contains_destination(destination))
    }

    #[must_use]
    pub fn check_takingover_message(&self, message_id: &str) -> bool {
        self.trackers
            .iter()
            .any(|t| t.value().contains_message(message_id))
    }

    #[must_use]
    pub fn takeover_stage(&self, broker_id: &str) -> Option<TakeoverStage> {
        self.trackers.get(broker_id).map(|t| t.stage())
    }

    #[must_use]
    pub fn needs_reintegration(&self, broker_id: &str) -> bool {
        self.reintegration.lock().contains_key(broker_id)
    }

    #[must_use]
    pub fn is_in_doubt(&self, broker_id: &str) -> bool {
        self.in_doubt.lock().contains_key(broker_id)
    }

    // -- Takeovers announced by peers -----------------------------------------

    /// Records a peer's `TAKEOVER_PENDING`.
    ///
    /// # Errors
    ///
    /// [`ClusterError::Packet`] for a malformed announcement.
    pub fn on_takeover_pending(
        &self,
        from: &BrokerAddress,
        packet: &ClusterPacket,
    ) -> Result<(), ClusterError> {
        let payload: TakeoverPayload = packet.payload_value()?;
        if payload.target == self.ctx.broker_id() {
            error!("{from} announced a takeover of this broker");
        }
        info!("{from} is taking over {}", payload.target);
        self.in_doubt.lock().remove(&payload.target);
        self.remote_pending.insert(
            payload.target.clone(),
            TakeoverEntry {
                broker_id: payload.target,
                store_session: payload.store_session,
                broker_session: payload.broker_session,
                xid: packet.require_u64(prop::XID).ok(),
                from: from.clone(),
            },
        );
        Ok(())
    }

    /// Handles `TAKEOVER_COMPLETE`: the target is gone for good.
    ///
    /// # Errors
    ///
    /// [`ClusterError::Packet`] for a malformed notification.
    pub fn on_takeover_complete(
        &self,
        from: &BrokerAddress,
        packet: &ClusterPacket,
    ) -> Result<(), ClusterError> {
        let payload: TakeoverPayload = packet.payload_value()?;
        self.remote_pending
            .remove_if(&payload.target, |_, e| e.from == *from);
        info!("{from} completed takeover of {}", payload.target);
        let guard = self.ctx.brokers.lock();
        self.ctx.brokers.update_entry(&guard, &payload.target, |entry| {
            entry.is_up = false;
            entry.in_doubt = false;
        });
        self.ctx
            .brokers
            .set_state(&guard, &payload.target, BrokerState::FailoverProcessed);
        Ok(())
    }

    /// Handles `TAKEOVER_ABORT`.
    ///
    /// # Errors
    ///
    /// [`ClusterError::Packet`] for a malformed notification.
    pub fn on_takeover_abort(
        &self,
        from: &BrokerAddress,
        packet: &ClusterPacket,
    ) -> Result<(), ClusterError> {
        let payload: TakeoverPayload = packet.payload_value()?;
        if self
            .remote_pending
            .remove_if(&payload.target, |_, e| e.from == *from)
            .is_some()
        {
            info!("{from} aborted takeover of {}", payload.target);
        }
        Ok(())
    }

    /// Forgets takeovers announced by a peer that left.
    pub fn on_broker_down(&self, addr: &BrokerAddress) {
        self.remote_pending.retain(|target, entry| {
            let keep = entry.from != *addr;
            if !keep {
                info!("{addr} left while taking over {target}");
            }
            keep
        });
    }
}

fn takeover_packet(
    mut packet: ClusterPacket,
    candidate: &TakeoverCandidate,
    ctx: &BrokerContext,
) -> Result<ClusterPacket, ClusterError> {
    packet.set_payload_value(&TakeoverPayload {
        target: candidate.broker_id.clone(),
        store_session: candidate.store_session,
        broker_session: candidate.broker_session,
        taker: ctx.local.clone(),
        timestamp_ms: ctx.now(),
    })?;
    Ok(packet)
}

fn failed(target: &str, stage: TakeoverStage, source: ClusterError) -> ClusterError {
    ClusterError::TakeoverFailed {
        broker: target.to_string(),
        stage,
        source: Box::new(source),
    }
}
