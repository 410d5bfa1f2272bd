//! Reply waiters: wait for N peers to answer a broadcast request.
//!
//! A [`ReplyWaiter`] owns the set of peers still expected to reply and a
//! [`ReplyPolicy`] that decides, on every reply or membership change, whether
//! the wait has reached a terminal [`WaitStatus`]. All policy callbacks run
//! under the waiter's mutex, so policies never synchronize on their own.
//!
//! Waiting is available both as an async future ([`ReplyWaiter::wait`]) and
//! as a blocking call ([`ReplyWaiter::wait_blocking`]) for non-async callers.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use mqcluster_core::ClusterPacket;
use parking_lot::{Condvar, Mutex};
use tokio::sync::watch;
use tracing::debug;

use super::messages::{prop, status};
use super::types::BrokerAddress;
use crate::error::ClusterError;

// ---------------------------------------------------------------------------
// Status types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Waiting,
    Ok,
    Gone,
    Timeout,
    /// A peer replied with this non-OK status code.
    Error(i32),
}

impl WaitStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self != Self::Waiting
    }
}

/// One peer's answer.
#[derive(Debug, Clone)]
pub struct ReplyStatus {
    pub status: i32,
    pub reason: Option<String>,
    pub packet: Option<ClusterPacket>,
}

impl ReplyStatus {
    /// Reads status and reason from a reply packet.
    #[must_use]
    pub fn from_packet(packet: ClusterPacket) -> Self {
        Self {
            status: packet.get_int(prop::STATUS).unwrap_or(status::ERROR),
            reason: packet.get_str(prop::REASON).map(str::to_string),
            packet: Some(packet),
        }
    }

    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: status::OK,
            reason: None,
            packet: None,
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == status::OK
    }
}

/// Mutable state of one waiter, visible to its policy.
#[derive(Debug)]
pub struct WaiterState {
    participants: HashSet<BrokerAddress>,
    replies: HashMap<BrokerAddress, ReplyStatus>,
    status: WaitStatus,
    ok_from: Option<BrokerAddress>,
    aborted: bool,
}

impl WaiterState {
    fn new(participants: impl IntoIterator<Item = BrokerAddress>) -> Self {
        Self {
            participants: participants.into_iter().collect(),
            replies: HashMap::new(),
            status: WaitStatus::Waiting,
            ok_from: None,
            aborted: false,
        }
    }

    #[must_use]
    pub fn participants(&self) -> &HashSet<BrokerAddress> {
        &self.participants
    }

    pub fn remove_participant(&mut self, addr: &BrokerAddress) -> bool {
        self.participants.remove(addr)
    }

    #[must_use]
    pub fn status(&self) -> WaitStatus {
        self.status
    }

    pub fn set_status(&mut self, status: WaitStatus) {
        self.status = status;
    }

    pub fn set_ok_from(&mut self, addr: &BrokerAddress) {
        self.ok_from = Some(addr.clone());
    }

    #[must_use]
    pub fn replies(&self) -> &HashMap<BrokerAddress, ReplyStatus> {
        &self.replies
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Decides when a wait is over.
///
/// `on_reply` runs after the replying peer has been removed from the
/// participant set and its reply recorded. `on_remove_participant` runs only
/// while the status is still `Waiting`.
pub trait ReplyPolicy: Send + Sync + fmt::Debug {
    /// Short name used in errors and logs.
    fn name(&self) -> &'static str;

    fn on_reply(&self, state: &mut WaiterState, from: &BrokerAddress, reply: &ReplyStatus);

    fn on_add_participant(&self, _state: &mut WaiterState, _addr: &BrokerAddress) {}

    fn on_remove_participant(
        &self,
        state: &mut WaiterState,
        addr: &BrokerAddress,
        goodbyed: bool,
        shutdown: bool,
    );
}

/// Every participant must answer OK. Used by the master handover.
#[derive(Debug, Default)]
pub struct AllOk;

impl ReplyPolicy for AllOk {
    fn name(&self) -> &'static str {
        "all-ok"
    }

    fn on_reply(&self, state: &mut WaiterState, _from: &BrokerAddress, reply: &ReplyStatus) {
        if !reply.is_ok() {
            state.set_status(WaitStatus::Error(reply.status));
        } else if state.participants.is_empty() {
            state.set_status(WaitStatus::Ok);
        }
    }

    fn on_remove_participant(
        &self,
        state: &mut WaiterState,
        addr: &BrokerAddress,
        goodbyed: bool,
        shutdown: bool,
    ) {
        if !state.participants.contains(addr) && !shutdown {
            return;
        }
        if shutdown || !goodbyed {
            state.set_status(WaitStatus::Gone);
            return;
        }
        state.participants.remove(addr);
        if state.participants.is_empty() {
            state.set_status(WaitStatus::Ok);
        }
    }
}

/// Convergecast of a pending takeover announcement.
#[derive(Debug, Default)]
pub struct TakeoverPending;

impl ReplyPolicy for TakeoverPending {
    fn name(&self) -> &'static str {
        "takeover-pending"
    }

    fn on_reply(&self, state: &mut WaiterState, _from: &BrokerAddress, _reply: &ReplyStatus) {
        if state.participants.is_empty() {
            state.set_status(WaitStatus::Ok);
        }
    }

    fn on_remove_participant(
        &self,
        state: &mut WaiterState,
        addr: &BrokerAddress,
        goodbyed: bool,
        shutdown: bool,
    ) {
        if shutdown {
            state.set_status(WaitStatus::Gone);
            return;
        }
        if goodbyed {
            state.participants.remove(addr);
            if state.participants.is_empty() {
                state.set_status(WaitStatus::Ok);
            }
        }
    }
}

/// A request to exactly one peer.
#[derive(Debug)]
pub struct Unicast {
    target: BrokerAddress,
}

impl Unicast {
    #[must_use]
    pub fn new(target: BrokerAddress) -> Self {
        Self { target }
    }
}

impl ReplyPolicy for Unicast {
    fn name(&self) -> &'static str {
        "unicast"
    }

    fn on_reply(&self, state: &mut WaiterState, _from: &BrokerAddress, _reply: &ReplyStatus) {
        state.set_status(WaitStatus::Ok);
    }

    fn on_remove_participant(
        &self,
        state: &mut WaiterState,
        addr: &BrokerAddress,
        goodbyed: bool,
        shutdown: bool,
    ) {
        state.participants.remove(addr);
        if *addr != self.target && !shutdown {
            return;
        }
        state.set_status(if goodbyed {
            WaitStatus::Gone
        } else {
            WaitStatus::Timeout
        });
    }
}

/// The first OK reply wins.
#[derive(Debug, Default)]
pub struct BroadcastAnyOk;

impl ReplyPolicy for BroadcastAnyOk {
    fn name(&self) -> &'static str {
        "broadcast-any-ok"
    }

    fn on_reply(&self, state: &mut WaiterState, from: &BrokerAddress, reply: &ReplyStatus) {
        if reply.is_ok() {
            state.set_ok_from(from);
            state.set_status(WaitStatus::Ok);
        } else if state.participants.is_empty() {
            state.set_status(WaitStatus::Error(reply.status));
        }
    }

    fn on_remove_participant(
        &self,
        state: &mut WaiterState,
        addr: &BrokerAddress,
        _goodbyed: bool,
        shutdown: bool,
    ) {
        state.participants.remove(addr);
        if shutdown || state.participants.is_empty() {
            state.set_status(WaitStatus::Gone);
        }
    }
}

// ---------------------------------------------------------------------------
// ReplyWaiter
// ---------------------------------------------------------------------------

/// Result of a successful wait.
#[derive(Debug, Default)]
pub struct ReplyOutcome {
    pub replies: HashMap<BrokerAddress, ReplyStatus>,
    /// Peer whose reply ended a [`BroadcastAnyOk`] wait.
    pub ok_from: Option<BrokerAddress>,
    /// True when the wait ended through [`ReplyWaiter::abort`].
    pub aborted: bool,
}

pub struct ReplyWaiter {
    policy: Box<dyn ReplyPolicy>,
    state: Mutex<WaiterState>,
    cond: Condvar,
    status_tx: watch::Sender<WaitStatus>,
}

impl ReplyWaiter {
    #[must_use]
    pub fn new(
        participants: impl IntoIterator<Item = BrokerAddress>,
        policy: impl ReplyPolicy + 'static,
    ) -> Self {
        let mut state = WaiterState::new(participants);
        if state.participants.is_empty() {
            state.status = WaitStatus::Ok;
        }
        let (status_tx, _) = watch::channel(state.status);
        Self {
            policy: Box::new(policy),
            state: Mutex::new(state),
            cond: Condvar::new(),
            status_tx,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.policy.name()
    }

    #[must_use]
    pub fn status(&self) -> WaitStatus {
        self.state.lock().status
    }

    /// Peers that still owe a reply.
    #[must_use]
    pub fn pending(&self) -> Vec<BrokerAddress> {
        self.state.lock().participants.iter().cloned().collect()
    }

    /// Records `reply` from `from` if `from` is still expected to reply.
    pub fn notify_reply(&self, from: &BrokerAddress, reply: ReplyStatus) {
        let mut state = self.state.lock();
        if state.status.is_terminal() || !state.participants.remove(from) {
            return;
        }
        state.replies.insert(from.clone(), reply.clone());
        self.policy.on_reply(&mut state, from, &reply);
        self.publish(&state, WaitStatus::Waiting);
    }

    pub fn add_participant(&self, addr: &BrokerAddress) {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return;
        }
        self.policy.on_add_participant(&mut state, addr);
    }

    pub fn remove_participant(&self, addr: &BrokerAddress, goodbyed: bool, shutdown: bool) {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return;
        }
        self.policy
            .on_remove_participant(&mut state, addr, goodbyed, shutdown);
        self.publish(&state, WaitStatus::Waiting);
    }

    /// Ends the wait as `Ok` with the replies collected so far.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return;
        }
        state.aborted = true;
        state.status = WaitStatus::Ok;
        self.publish(&state, WaitStatus::Waiting);
    }

    /// Waits until the status leaves `Waiting`, at most `timeout`.
    ///
    /// # Errors
    ///
    /// [`ClusterError::Gone`], [`ClusterError::Timeout`] or
    /// [`ClusterError::Rejected`] for every terminal status except `Ok`.
    pub async fn wait(&self, timeout: Duration) -> Result<ReplyOutcome, ClusterError> {
        let mut rx = self.status_tx.subscribe();
        let reached = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| s.is_terminal()).await.map(|_| ())
        })
        .await;
        if reached.is_err() {
            self.expire();
        }
        self.outcome()
    }

    /// Blocking variant of [`wait`](Self::wait).
    ///
    /// # Errors
    ///
    /// Same as [`wait`](Self::wait).
    pub fn wait_blocking(&self, timeout: Duration) -> Result<ReplyOutcome, ClusterError> {
        let deadline = Instant::now() + timeout;
        {
            let mut state = self.state.lock();
            while !state.status.is_terminal() {
                if self.cond.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
        }
        self.expire();
        self.outcome()
    }

    fn expire(&self) {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return;
        }
        debug!(
            "{} waiter timed out; still waiting for {} peer(s)",
            self.policy.name(),
            state.participants.len()
        );
        state.status = WaitStatus::Timeout;
        self.publish(&state, WaitStatus::Waiting);
    }

    fn publish(&self, state: &WaiterState, before: WaitStatus) {
        if state.status.is_terminal() && !before.is_terminal() {
            self.cond.notify_all();
            self.status_tx.send_replace(state.status);
        }
    }

    fn outcome(&self) -> Result<ReplyOutcome, ClusterError> {
        let state = self.state.lock();
        let waiter = self.policy.name();
        match state.status {
            WaitStatus::Ok => Ok(ReplyOutcome {
                replies: state.replies.clone(),
                ok_from: state.ok_from.clone(),
                aborted: state.aborted,
            }),
            WaitStatus::Gone => Err(ClusterError::Gone { waiter }),
            WaitStatus::Timeout | WaitStatus::Waiting => Err(ClusterError::Timeout { waiter }),
            WaitStatus::Error(code) => {
                let reason = state
                    .replies
                    .iter()
                    .find(|(_, r)| r.status == code)
                    .map_or_else(
                        || format!("{waiter}: peer replied {code}"),
                        |(from, r)| {
                            format!(
                                "{} replied {code}: {}",
                                from.broker_id(),
                                r.reason.as_deref().unwrap_or("no reason given")
                            )
                        },
                    );
                Err(ClusterError::rejected(code, reason))
            }
        }
    }
}

impl fmt::Debug for ReplyWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyWaiter")
            .field("policy", &self.policy)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ReplyTracker
// ---------------------------------------------------------------------------

/// Routes replies to outstanding waiters by correlation xid.
#[derive(Debug, Default)]
pub struct ReplyTracker {
    waiters: DashMap<u64, Arc<ReplyWaiter>>,
}

impl ReplyTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_waiter(&self, xid: u64, waiter: ReplyWaiter) -> Arc<ReplyWaiter> {
        let waiter = Arc::new(waiter);
        self.waiters.insert(xid, Arc::clone(&waiter));
        waiter
    }

    /// Waits on the waiter registered under `xid`, then unregisters it.
    ///
    /// # Errors
    ///
    /// [`ClusterError::Internal`] if no waiter is registered under `xid`,
    /// otherwise whatever [`ReplyWaiter::wait`] returns.
    pub async fn wait_for_reply(
        &self,
        xid: u64,
        timeout: Duration,
    ) -> Result<ReplyOutcome, ClusterError> {
        let waiter = self
            .waiters
            .get(&xid)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ClusterError::Internal(format!("no reply waiter for xid {xid}")))?;
        let result = waiter.wait(timeout).await;
        self.waiters.remove(&xid);
        result
    }

    /// Delivers a reply packet. Returns false if nothing waits on `xid`.
    pub fn on_reply(&self, xid: u64, from: &BrokerAddress, packet: ClusterPacket) -> bool {
        let Some(waiter) = self.waiters.get(&xid).map(|e| Arc::clone(e.value())) else {
            return false;
        };
        waiter.notify_reply(from, ReplyStatus::from_packet(packet));
        true
    }

    /// Unregisters a waiter that will never be waited on.
    pub fn remove_waiter(&self, xid: u64) -> Option<Arc<ReplyWaiter>> {
        self.waiters.remove(&xid).map(|(_, w)| w)
    }

    pub fn abort_waiter(&self, xid: u64) {
        if let Some(waiter) = self.waiters.get(&xid).map(|e| Arc::clone(e.value())) {
            waiter.abort();
        }
    }

    pub fn add_broker(&self, addr: &BrokerAddress) {
        for waiter in self.all() {
            waiter.add_participant(addr);
        }
    }

    pub fn remove_broker(&self, addr: &BrokerAddress, goodbyed: bool, shutdown: bool) {
        for waiter in self.all() {
            waiter.remove_participant(addr, goodbyed, shutdown);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    fn all(&self) -> Vec<Arc<ReplyWaiter>> {
        self.waiters.iter().map(|e| Arc::clone(e.value())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqcluster_core::BrokerSessionUid;

    fn addr(id: &str) -> BrokerAddress {
        BrokerAddress::new(id, "127.0.0.1", 7676, BrokerSessionUid(1))
    }

    fn abc() -> Vec<BrokerAddress> {
        vec![addr("a"), addr("b"), addr("c")]
    }

    fn failed(code: i32, reason: &str) -> ReplyStatus {
        ReplyStatus {
            status: code,
            reason: Some(reason.to_string()),
            packet: None,
        }
    }

    #[test]
    fn all_ok_converges_once_every_peer_replied() {
        let w = ReplyWaiter::new(abc(), AllOk);
        w.notify_reply(&addr("a"), ReplyStatus::ok());
        w.notify_reply(&addr("b"), ReplyStatus::ok());
        assert_eq!(w.status(), WaitStatus::Waiting);
        w.notify_reply(&addr("c"), ReplyStatus::ok());
        assert_eq!(w.status(), WaitStatus::Ok);

        w.remove_participant(&addr("a"), false, true);
        w.notify_reply(&addr("a"), failed(status::ERROR, "late"));
        assert_eq!(w.status(), WaitStatus::Ok);
        assert_eq!(w.wait_blocking(Duration::from_millis(1)).unwrap().replies.len(), 3);
    }

    #[test]
    fn unclean_shutdown_ends_wait_as_gone_for_good() {
        let w = ReplyWaiter::new(abc(), AllOk);
        w.notify_reply(&addr("a"), ReplyStatus::ok());
        w.remove_participant(&addr("b"), false, true);
        assert_eq!(w.status(), WaitStatus::Gone);

        w.notify_reply(&addr("c"), ReplyStatus::ok());
        w.abort();
        assert_eq!(w.status(), WaitStatus::Gone);
        assert!(matches!(
            w.wait_blocking(Duration::from_millis(1)),
            Err(ClusterError::Gone { .. })
        ));
    }

    #[test]
    fn goodbye_of_last_pending_peer_completes_the_wait() {
        let w = ReplyWaiter::new(abc(), AllOk);
        w.notify_reply(&addr("a"), ReplyStatus::ok());
        w.notify_reply(&addr("b"), ReplyStatus::ok());
        w.remove_participant(&addr("c"), true, false);
        assert_eq!(w.status(), WaitStatus::Ok);
    }

    #[test]
    fn replies_from_strangers_and_duplicates_are_ignored() {
        let w = ReplyWaiter::new(vec![addr("a"), addr("b")], AllOk);
        w.notify_reply(&addr("z"), failed(status::ERROR, "stranger"));
        w.notify_reply(&addr("a"), ReplyStatus::ok());
        w.notify_reply(&addr("a"), failed(status::ERROR, "dup"));
        assert_eq!(w.status(), WaitStatus::Waiting);
        assert_eq!(w.pending(), vec![addr("b")]);
    }

    #[test]
    fn all_ok_rejects_on_first_failure_with_reason() {
        let w = ReplyWaiter::new(abc(), AllOk);
        w.notify_reply(&addr("b"), failed(status::CONFLICT, "handover in progress"));
        match w.wait_blocking(Duration::from_millis(1)) {
            Err(ClusterError::Rejected { status: code, reason }) => {
                assert_eq!(code, status::CONFLICT);
                assert!(reason.contains("handover in progress"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_participant_set_is_immediately_ok() {
        let w = ReplyWaiter::new(Vec::new(), TakeoverPending);
        assert_eq!(w.status(), WaitStatus::Ok);
    }

    #[test]
    fn takeover_pending_ignores_plain_link_loss() {
        let w = ReplyWaiter::new(vec![addr("a"), addr("b")], TakeoverPending);
        w.remove_participant(&addr("a"), false, false);
        assert_eq!(w.status(), WaitStatus::Waiting);
        w.remove_participant(&addr("a"), true, false);
        w.notify_reply(&addr("b"), failed(status::ERROR, "any status counts"));
        assert_eq!(w.status(), WaitStatus::Ok);
    }

    #[test]
    fn unicast_target_loss_depends_on_goodbye() {
        let w = ReplyWaiter::new(vec![addr("a")], Unicast::new(addr("a")));
        w.remove_participant(&addr("x"), false, false);
        assert_eq!(w.status(), WaitStatus::Waiting);
        w.remove_participant(&addr("a"), true, false);
        assert_eq!(w.status(), WaitStatus::Gone);

        let w = ReplyWaiter::new(vec![addr("a")], Unicast::new(addr("a")));
        w.remove_participant(&addr("a"), false, false);
        assert_eq!(w.status(), WaitStatus::Timeout);
    }

    #[test]
    fn broadcast_any_ok_remembers_the_winner() {
        let w = ReplyWaiter::new(abc(), BroadcastAnyOk);
        w.notify_reply(&addr("a"), failed(status::NOT_FOUND, "no"));
        w.notify_reply(&addr("b"), ReplyStatus::ok());
        let out = w.wait_blocking(Duration::from_millis(1)).unwrap();
        assert_eq!(out.ok_from, Some(addr("b")));

        let w = ReplyWaiter::new(vec![addr("a")], BroadcastAnyOk);
        w.notify_reply(&addr("a"), failed(status::NOT_FOUND, "no"));
        assert_eq!(w.status(), WaitStatus::Error(status::NOT_FOUND));
    }

    #[test]
    fn abort_reports_ok_with_partial_replies() {
        let w = ReplyWaiter::new(abc(), AllOk);
        w.notify_reply(&addr("a"), ReplyStatus::ok());
        w.abort();
        let out = w.wait_blocking(Duration::from_millis(1)).unwrap();
        assert!(out.aborted);
        assert_eq!(out.replies.len(), 1);
    }

    #[test]
    fn blocking_wait_wakes_on_reply_from_another_thread() {
        let w = Arc::new(ReplyWaiter::new(vec![addr("a")], AllOk));
        let replier = {
            let w = Arc::clone(&w);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                w.notify_reply(&addr("a"), ReplyStatus::ok());
            })
        };
        assert!(w.wait_blocking(Duration::from_secs(5)).is_ok());
        replier.join().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn async_wait_times_out() {
        let w = ReplyWaiter::new(abc(), AllOk);
        let err = w.wait(Duration::from_secs(3)).await.unwrap_err();
        assert!(matches!(err, ClusterError::Timeout { .. }));
        assert_eq!(w.status(), WaitStatus::Timeout);
    }

    #[tokio::test]
    async fn tracker_routes_replies_and_forgets_finished_waiters() {
        let tracker = Arc::new(ReplyTracker::new());
        tracker.add_waiter(7, ReplyWaiter::new(vec![addr("a"), addr("b")], AllOk));
        assert_eq!(tracker.len(), 1);

        let waiting = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait_for_reply(7, Duration::from_secs(5)).await })
        };
        let mut reply = ClusterPacket::new(21);
        reply.set_int(prop::STATUS, status::OK);
        assert!(tracker.on_reply(7, &addr("a"), reply.clone()));
        assert!(!tracker.on_reply(8, &addr("a"), reply.clone()));
        tracker.remove_broker(&addr("b"), true, false);

        let out = waiting.await.unwrap().unwrap();
        assert_eq!(out.replies.len(), 1);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn tracker_fans_removal_out_to_every_waiter() {
        let tracker = ReplyTracker::new();
        let w1 = tracker.add_waiter(1, ReplyWaiter::new(vec![addr("a")], AllOk));
        let w2 = tracker.add_waiter(2, ReplyWaiter::new(vec![addr("a")], TakeoverPending));
        tracker.remove_broker(&addr("a"), false, true);
        assert_eq!(w1.status(), WaitStatus::Gone);
        assert_eq!(w2.status(), WaitStatus::Gone);
        assert!(tracker.wait_for_reply(3, Duration::from_millis(1)).await.is_err());
    }
}
