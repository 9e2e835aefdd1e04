//! Per-channel election coordinator.
//!
//! One [`Flock`] exists per channel name within a process (enforced by
//! [`crate::registry::FlockRegistry`]); it owns election state, the
//! heartbeat/monitor timers, the local member registry, and dispatches
//! every inbound [`Envelope`] to the right transition or local callback.
//! All mutable state lives behind `tokio::sync::RwLock`/`Mutex` fields
//! rather than inside the dispatch task alone, since both the dispatch
//! loop and externally-invoked methods (`register`, `cede_leadership`, a
//! member's own sends) touch it.

use crate::config::FlockOptions;
use crate::envelope::{now_ts_millis, Envelope};
use crate::transport::{InboundReceiver, Transport};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

/// Election state of one [`Flock`] as observed locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionState {
    NoLeader,
    Follower { leader_id: String },
    LeaderLocal { leader_id: String },
}

impl ElectionState {
    pub fn leader_id(&self) -> Option<String> {
        match self {
            ElectionState::NoLeader => None,
            ElectionState::Follower { leader_id } | ElectionState::LeaderLocal { leader_id } => {
                Some(leader_id.clone())
            }
        }
    }

    pub fn is_leader_local(&self) -> bool {
        matches!(self, ElectionState::LeaderLocal { .. })
    }
}

/// What kind of fan-out a local member's `on_message` callback is being
/// told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingMessageKind {
    LeaderMessage,
    Broadcast,
    DirectMessage,
}

#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub sender_id: String,
    pub kind: IncomingMessageKind,
    pub payload: Value,
}

/// A single-use handle a leader's `on_request` callback uses to answer a
/// `request` envelope. Dropping it without calling `reply` leaves the
/// caller's request pending until its timeout fires.
pub struct ReplyHandle {
    flock: Arc<Flock>,
    sender_id: String,
    request_id: String,
}

impl ReplyHandle {
    pub fn reply(self, payload: Value) {
        self.flock.transport.post(Envelope::Response {
            target_id: self.sender_id,
            request_id: self.request_id,
            payload: Some(payload),
            ts: now_ts_millis(),
        });
    }
}

/// The owning Member's side of the dispatch relationship — implemented by
/// [`crate::member::Member`]. `Flock` depends only on this trait, never on
/// the concrete `Member` type, so the two modules don't form a cycle.
#[async_trait::async_trait]
pub trait MemberSink: Send + Sync {
    async fn resolve_pending(self: Arc<Self>, request_id: String, payload: Option<Value>);
    async fn on_leadership_changed(self: Arc<Self>, new_leader_id: Option<String>);
    fn on_message(&self, message: IncomingMessage);
    fn on_request(&self, reply: ReplyHandle, sender_id: String, payload: Value);
}

struct Exclusion {
    member_id: String,
    expiry: JoinHandle<()>,
}

pub struct Flock {
    channel_name: String,
    options: FlockOptions,
    transport: Arc<dyn Transport>,
    state: RwLock<ElectionState>,
    local_members: RwLock<Vec<(String, Arc<dyn MemberSink>)>>,
    remote_members: RwLock<HashMap<String, Instant>>,
    last_heartbeat_at: RwLock<Instant>,
    excluded_candidate: RwLock<Option<Exclusion>>,
    shutdown_tx: watch::Sender<bool>,
    shut_down: AtomicBool,
}

impl Flock {
    pub fn new(
        channel_name: String,
        options: FlockOptions,
        transport: Arc<dyn Transport>,
        inbound: InboundReceiver,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let flock = Arc::new(Self {
            channel_name,
            options,
            transport,
            state: RwLock::new(ElectionState::NoLeader),
            local_members: RwLock::new(Vec::new()),
            remote_members: RwLock::new(HashMap::new()),
            last_heartbeat_at: RwLock::new(Instant::now()),
            excluded_candidate: RwLock::new(None),
            shutdown_tx,
            shut_down: AtomicBool::new(false),
        });
        tokio::spawn(flock.clone().run(inbound, shutdown_rx));
        flock
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn options(&self) -> &FlockOptions {
        &self.options
    }

    pub fn post(&self, envelope: Envelope) {
        self.transport.post(envelope);
    }

    pub async fn leader_id(&self) -> Option<String> {
        self.state.read().await.leader_id()
    }

    pub async fn is_leader_local(&self) -> bool {
        self.state.read().await.is_leader_local()
    }

    /// Deduplicated union of local member IDs and non-stale remote member
    /// IDs, pruning stale remote entries lazily on read.
    pub async fn members_info(&self) -> std::collections::HashSet<String> {
        let mut set: std::collections::HashSet<String> = self
            .local_members
            .read()
            .await
            .iter()
            .map(|(id, _)| id.clone())
            .collect();
        let ttl = self.options.heartbeat_ttl();
        let mut remotes = self.remote_members.write().await;
        remotes.retain(|_, last_seen| last_seen.elapsed() <= ttl);
        set.extend(remotes.keys().cloned());
        set
    }

    /// Register a local member: schedule a next-turn
    /// `on_leadership_change` if a leader is already known, publish a
    /// `request-leader-sync`, and trigger an election if still leaderless
    /// after 500ms.
    pub async fn register(self: &Arc<Self>, member_id: String, sink: Arc<dyn MemberSink>) {
        {
            let mut locals = self.local_members.write().await;
            locals.push((member_id.clone(), sink.clone()));
        }
        tracing::info!(channel = %self.channel_name, member = %member_id, "member registered");

        if let Some(leader_id) = self.state.read().await.leader_id() {
            let sink = sink.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                sink.on_leadership_changed(Some(leader_id)).await;
            });
        }

        self.transport.post(Envelope::RequestLeaderSync {
            sender_id: member_id,
            ts: now_ts_millis(),
        });

        let flock = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            if flock.state.read().await.leader_id().is_none() {
                flock.trigger_election().await;
            }
        });
    }

    /// Remove a local member. If it held leadership, notify it directly
    /// (it will receive no further loopback once removed) and publish
    /// `resign` — the resign handler (triggered via loopback) owns the
    /// actual state transition.
    pub async fn unregister(self: &Arc<Self>, member_id: &str) {
        let removed = {
            let mut locals = self.local_members.write().await;
            let idx = locals.iter().position(|(id, _)| id == member_id);
            idx.map(|i| locals.remove(i))
        };

        let was_leader = self.state.read().await.leader_id().as_deref() == Some(member_id);
        if was_leader {
            if let Some((_, sink)) = removed.clone() {
                sink.on_leadership_changed(None).await;
            }
            self.transport.post(Envelope::Resign {
                sender_id: member_id.to_string(),
                ts: now_ts_millis(),
            });
        }
        tracing::info!(channel = %self.channel_name, member = %member_id, "member unregistered");
    }

    /// Bar `member_id` from candidate selection for `ttl`, then publish
    /// `resign`. A new exclusion cancels any still-running previous one.
    pub async fn cede_leadership(self: &Arc<Self>, member_id: &str) {
        self.set_exclusion(member_id.to_string(), Duration::from_millis(1500))
            .await;
        self.transport.post(Envelope::Resign {
            sender_id: member_id.to_string(),
            ts: now_ts_millis(),
        });
    }

    async fn set_exclusion(self: &Arc<Self>, member_id: String, ttl: Duration) {
        let mut slot = self.excluded_candidate.write().await;
        if let Some(previous) = slot.take() {
            previous.expiry.abort();
        }
        let flock = self.clone();
        let expiring_id = member_id.clone();
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut slot = flock.excluded_candidate.write().await;
            if matches!(&*slot, Some(e) if e.member_id == expiring_id) {
                *slot = None;
            }
        });
        *slot = Some(Exclusion { member_id, expiry });
    }

    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(exclusion) = self.excluded_candidate.write().await.take() {
            exclusion.expiry.abort();
        }
        let _ = self.shutdown_tx.send(true);
    }

    async fn touch_remote(&self, sender_id: &str) {
        self.remote_members
            .write()
            .await
            .insert(sender_id.to_string(), Instant::now());
    }

    async fn find_local(&self, id: &str) -> Option<Arc<dyn MemberSink>> {
        self.local_members
            .read()
            .await
            .iter()
            .find(|(mid, _)| mid == id)
            .map(|(_, sink)| sink.clone())
    }

    async fn is_local(&self, id: &str) -> bool {
        self.local_members.read().await.iter().any(|(mid, _)| mid == id)
    }

    async fn set_state(&self, new_state: ElectionState, notify: bool) {
        let old_leader = {
            let mut state = self.state.write().await;
            let old_leader = state.leader_id();
            *state = new_state.clone();
            old_leader
        };
        if notify && old_leader != new_state.leader_id() {
            self.notify_all_leadership_change(new_state.leader_id()).await;
        }
    }

    async fn notify_all_leadership_change(&self, new_leader_id: Option<String>) {
        let locals = self.local_members.read().await.clone();
        for (_, sink) in locals {
            let new_leader_id = new_leader_id.clone();
            tokio::spawn(async move {
                sink.on_leadership_changed(new_leader_id).await;
            });
        }
    }

    async fn publish_heartbeat_self(&self) {
        if let Some(leader_id) = self.state.read().await.leader_id() {
            self.transport.post(Envelope::Heartbeat {
                sender_id: leader_id,
                ts: now_ts_millis(),
            });
        }
    }

    async fn select_candidate(&self) -> Option<String> {
        let state = self.state.read().await.clone();
        let locals = self.local_members.read().await;
        if locals.is_empty() {
            return None;
        }
        if let ElectionState::LeaderLocal { leader_id } = &state {
            if locals.iter().any(|(id, _)| id == leader_id) {
                return Some(leader_id.clone());
            }
        }
        let excluded = self
            .excluded_candidate
            .read()
            .await
            .as_ref()
            .map(|e| e.member_id.clone());
        locals
            .iter()
            .find(|(id, _)| Some(id.clone()) != excluded)
            .map(|(id, _)| id.clone())
    }

    async fn trigger_election(self: &Arc<Self>) {
        if let Some(candidate_id) = self.select_candidate().await {
            self.transport.post(Envelope::Claim {
                sender_id: candidate_id,
                ts: now_ts_millis(),
            });
        }
    }

    async fn handle_claim(self: &Arc<Self>, candidate_id: String) {
        let state = self.state.read().await.clone();
        if let ElectionState::LeaderLocal { leader_id } = &state {
            if leader_id != &candidate_id {
                self.publish_heartbeat_self().await;
                return;
            }
        }

        let is_local = self.is_local(&candidate_id).await;
        let became_leader_local = is_local
            && !matches!(&state, ElectionState::LeaderLocal { leader_id } if leader_id == &candidate_id);
        let new_state = if is_local {
            ElectionState::LeaderLocal {
                leader_id: candidate_id,
            }
        } else {
            ElectionState::Follower {
                leader_id: candidate_id,
            }
        };
        self.set_state(new_state, true).await;
        if became_leader_local {
            self.publish_heartbeat_self().await;
        }
    }

    async fn handle_heartbeat(self: &Arc<Self>, sender_id: String) {
        *self.last_heartbeat_at.write().await = Instant::now();
        let current = self.state.read().await.leader_id();
        if current.as_deref() != Some(sender_id.as_str()) {
            let is_local = self.is_local(&sender_id).await;
            let new_state = if is_local {
                ElectionState::LeaderLocal { leader_id: sender_id }
            } else {
                ElectionState::Follower { leader_id: sender_id }
            };
            self.set_state(new_state, true).await;
        }
    }

    async fn handle_resign(self: &Arc<Self>, sender_id: String) {
        let current = self.state.read().await.leader_id();
        if current.as_deref() == Some(sender_id.as_str()) {
            self.set_state(ElectionState::NoLeader, false).await;
            self.trigger_election().await;
        }
    }

    async fn handle_monitor_tick(self: &Arc<Self>) {
        let state = self.state.read().await.clone();
        if state.is_leader_local() {
            return;
        }
        let stale = {
            let last = *self.last_heartbeat_at.read().await;
            state.leader_id().is_none() || last.elapsed() > self.options.heartbeat_ttl()
        };
        if stale {
            self.set_state(ElectionState::NoLeader, false).await;
            self.trigger_election().await;
        }
    }

    async fn dispatch_request(self: &Arc<Self>, sender_id: String, request_id: String, payload: Value) {
        if !self.state.read().await.is_leader_local() {
            return;
        }
        let Some(leader_id) = self.state.read().await.leader_id() else {
            return;
        };
        if let Some(sink) = self.find_local(&leader_id).await {
            let reply = ReplyHandle {
                flock: self.clone(),
                sender_id: sender_id.clone(),
                request_id,
            };
            sink.on_request(reply, sender_id, payload);
        }
    }

    async fn dispatch_message_to_leader(self: &Arc<Self>, sender_id: String, request_id: String, payload: Value) {
        if !self.state.read().await.is_leader_local() {
            return;
        }
        if let Some(leader_id) = self.state.read().await.leader_id() {
            if let Some(sink) = self.find_local(&leader_id).await {
                sink.on_message(IncomingMessage {
                    sender_id: sender_id.clone(),
                    kind: IncomingMessageKind::LeaderMessage,
                    payload,
                });
            }
        }
        self.transport.post(Envelope::Response {
            target_id: sender_id,
            request_id,
            payload: None,
            ts: now_ts_millis(),
        });
    }

    async fn dispatch_response(self: &Arc<Self>, target_id: String, request_id: String, payload: Option<Value>) {
        if let Some(sink) = self.find_local(&target_id).await {
            sink.resolve_pending(request_id, payload).await;
        }
    }

    async fn dispatch_broadcast(self: &Arc<Self>, sender_id: String, payload: Value) {
        let locals = self.local_members.read().await.clone();
        for (_, sink) in locals {
            sink.on_message(IncomingMessage {
                sender_id: sender_id.clone(),
                kind: IncomingMessageKind::Broadcast,
                payload: payload.clone(),
            });
        }
    }

    async fn dispatch_direct_message(self: &Arc<Self>, sender_id: String, target_id: String, payload: Value) {
        if let Some(sink) = self.find_local(&target_id).await {
            sink.on_message(IncomingMessage {
                sender_id,
                kind: IncomingMessageKind::DirectMessage,
                payload,
            });
        }
    }

    async fn handle_envelope(self: &Arc<Self>, envelope: Envelope) {
        if self.options.debug {
            tracing::trace!(channel = %self.channel_name, envelope = ?envelope, "dispatching envelope");
        }
        if let Some(sender_id) = envelope.sender_id() {
            self.touch_remote(sender_id).await;
        }
        match envelope {
            Envelope::Claim { sender_id, .. } => self.handle_claim(sender_id).await,
            Envelope::Heartbeat { sender_id, .. } => self.handle_heartbeat(sender_id).await,
            Envelope::Resign { sender_id, .. } => self.handle_resign(sender_id).await,
            Envelope::RequestLeaderSync { .. } => {
                if self.state.read().await.is_leader_local() {
                    self.publish_heartbeat_self().await;
                }
            }
            Envelope::Request {
                sender_id,
                request_id,
                payload,
                ..
            } => self.dispatch_request(sender_id, request_id, payload).await,
            Envelope::MessageToLeader {
                sender_id,
                request_id,
                payload,
                ..
            } => self.dispatch_message_to_leader(sender_id, request_id, payload).await,
            Envelope::Response {
                target_id,
                request_id,
                payload,
                ..
            } => self.dispatch_response(target_id, request_id, payload).await,
            Envelope::Broadcast { sender_id, payload, .. } => self.dispatch_broadcast(sender_id, payload).await,
            Envelope::DirectMessage {
                sender_id,
                target_id,
                payload,
                ..
            } => self.dispatch_direct_message(sender_id, target_id, payload).await,
        }
    }

    async fn run(self: Arc<Self>, mut inbound: InboundReceiver, mut shutdown_rx: watch::Receiver<bool>) {
        let mut monitor = tokio::time::interval(Duration::from_secs(1));
        monitor.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut heartbeat_ticker = tokio::time::interval(self.options.heartbeat_interval());
        heartbeat_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let is_leader = self.state.read().await.is_leader_local();
            tokio::select! {
                maybe_env = inbound.recv() => {
                    match maybe_env {
                        Some(envelope) => self.handle_envelope(envelope).await,
                        None => break,
                    }
                }
                _ = monitor.tick() => {
                    self.handle_monitor_tick().await;
                }
                _ = heartbeat_ticker.tick(), if is_leader => {
                    self.publish_heartbeat_self().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(channel = %self.channel_name, "dispatch loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        leadership_events: Arc<StdMutex<Vec<Option<String>>>>,
    }

    #[async_trait::async_trait]
    impl MemberSink for RecordingSink {
        async fn resolve_pending(self: Arc<Self>, _request_id: String, _payload: Option<Value>) {}
        async fn on_leadership_changed(self: Arc<Self>, new_leader_id: Option<String>) {
            self.leadership_events.lock().unwrap().push(new_leader_id);
        }
        fn on_message(&self, _message: IncomingMessage) {}
        fn on_request(&self, _reply: ReplyHandle, _sender_id: String, _payload: Value) {}
    }

    fn flock_with_loopback(options: FlockOptions) -> Arc<Flock> {
        let (transport, rx) = LoopbackTransport::new();
        Flock::new("test".into(), options, Arc::new(transport), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn solo_registration_elects_itself_leader() {
        let flock = flock_with_loopback(FlockOptions::default());
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::new(RecordingSink {
            leadership_events: events.clone(),
        });
        flock.register("m1".into(), sink).await;

        tokio::time::advance(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;

        assert_eq!(flock.leader_id().await.as_deref(), Some("m1"));
        assert!(flock.is_leader_local().await);
    }

    #[tokio::test(start_paused = true)]
    async fn candidate_selection_skips_excluded_member() {
        let flock = flock_with_loopback(FlockOptions::default());
        let sink_a = Arc::new(RecordingSink {
            leadership_events: Arc::new(StdMutex::new(Vec::new())),
        });
        let sink_b = Arc::new(RecordingSink {
            leadership_events: Arc::new(StdMutex::new(Vec::new())),
        });
        flock.register("a".into(), sink_a).await;
        flock.register("b".into(), sink_b).await;
        tokio::time::advance(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;

        flock.set_exclusion("a".to_string(), Duration::from_millis(1500)).await;
        let candidate = flock.select_candidate().await;
        assert_eq!(candidate.as_deref(), Some("b"));

        tokio::time::advance(Duration::from_millis(1600)).await;
        tokio::task::yield_now().await;
        let candidate_after_expiry = flock.select_candidate().await;
        assert_eq!(candidate_after_expiry.as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn resign_triggers_reelection_among_remaining_locals() {
        let flock = flock_with_loopback(FlockOptions::default());
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::new(RecordingSink {
            leadership_events: events.clone(),
        });
        flock.register("only".into(), sink).await;
        tokio::time::advance(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;
        assert!(flock.is_leader_local().await);

        flock.unregister("only").await;
        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(flock.leader_id().await, None);
    }
}
