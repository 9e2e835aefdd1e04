//! The user-facing participant in a flock.
//!
//! A `Member` holds the pending/retry bookkeeping for its own outbound
//! requests, generates request IDs, enforces per-request timeouts, and
//! dispatches inbound work to whichever user callbacks were registered at
//! construction (the "capability bag" — see [`MemberBuilder`]).

use crate::envelope::now_ts_millis;
use crate::error::{Error, Result};
use crate::flock::{Flock, IncomingMessage, MemberSink, ReplyHandle};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const MAX_RETRIES: u32 = 3;
const RETRY_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

enum PendingResolver {
    Request(oneshot::Sender<Result<Value>>),
    Message(oneshot::Sender<Result<()>>),
}

impl PendingResolver {
    fn reject(self, err: Error) {
        match self {
            PendingResolver::Request(tx) => {
                let _ = tx.send(Err(err));
            }
            PendingResolver::Message(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

struct PendingEntry {
    payload: Value,
    resolver: PendingResolver,
    timeout_handle: JoinHandle<()>,
}

struct RetryEntry {
    payload: Value,
    resolver: PendingResolver,
    attempts: u32,
}

/// A single cooperating participant on one channel.
///
/// Constructed via [`MemberBuilder`], never directly — construction also
/// performs registration with the owning [`Flock`], which must happen
/// exactly once and needs an `Arc<Member>` to hand the `Flock` a
/// [`MemberSink`] trait object.
pub struct Member {
    id: String,
    flock: Arc<Flock>,
    pending: Mutex<HashMap<String, PendingEntry>>,
    retry: Mutex<HashMap<String, RetryEntry>>,
    has_seen_leader: AtomicBool,
    last_known_leader_id: Mutex<Option<String>>,
    on_message: Option<Box<dyn Fn(IncomingMessage) + Send + Sync>>,
    on_request: Option<Box<dyn Fn(ReplyHandle, String, Value) + Send + Sync>>,
    on_leadership_change: Option<Box<dyn Fn(Option<String>) + Send + Sync>>,
    retry_sweep: Mutex<Option<JoinHandle<()>>>,
}

impl Member {
    pub fn builder(flock: Arc<Flock>) -> MemberBuilder {
        MemberBuilder::new(flock)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn is_leader(&self) -> bool {
        self.flock.leader_id().await.as_deref() == Some(self.id.as_str())
    }

    pub async fn get_members_info(&self) -> HashSet<String> {
        self.flock.members_info().await
    }

    /// Await a response from the current (or eventual) leader, retrying
    /// across leader transitions up to [`MAX_RETRIES`] times.
    pub async fn send_request(self: &Arc<Self>, payload: Value, timeout: Option<Duration>) -> Result<Value> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let timeout = timeout.unwrap_or_else(|| self.flock.options().default_request_timeout());
        let handle = self.spawn_timeout(request_id.clone(), timeout, 0);
        {
            let mut pending = self.pending.lock().await;
            pending.insert(
                request_id.clone(),
                PendingEntry {
                    payload: payload.clone(),
                    resolver: PendingResolver::Request(tx),
                    timeout_handle: handle,
                },
            );
        }
        self.flock.post(crate::envelope::Envelope::Request {
            sender_id: self.id.clone(),
            request_id,
            payload,
            ts: now_ts_millis(),
        });
        rx.await.unwrap_or(Err(Error::ShuttingDown))
    }

    /// Fire a one-way message to the leader; resolves once the leader's
    /// synthetic ack arrives, or errors after retry exhaustion.
    pub async fn send_message_to_leader(self: &Arc<Self>, payload: Value) -> Result<()> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let timeout = self.flock.options().default_request_timeout();
        let handle = self.spawn_timeout(request_id.clone(), timeout, 0);
        {
            let mut pending = self.pending.lock().await;
            pending.insert(
                request_id.clone(),
                PendingEntry {
                    payload: payload.clone(),
                    resolver: PendingResolver::Message(tx),
                    timeout_handle: handle,
                },
            );
        }
        self.flock.post(crate::envelope::Envelope::MessageToLeader {
            sender_id: self.id.clone(),
            request_id,
            payload,
            ts: now_ts_millis(),
        });
        rx.await.unwrap_or(Err(Error::ShuttingDown))
    }

    pub async fn send_to_member(&self, target_id: &str, payload: Value) {
        if !self.is_leader().await {
            return;
        }
        self.flock.post(crate::envelope::Envelope::DirectMessage {
            sender_id: self.id.clone(),
            target_id: target_id.to_string(),
            payload,
            ts: now_ts_millis(),
        });
    }

    pub async fn broadcast_to_members(&self, payload: Value) {
        if !self.is_leader().await {
            return;
        }
        self.flock.post(crate::envelope::Envelope::Broadcast {
            sender_id: self.id.clone(),
            payload,
            ts: now_ts_millis(),
        });
    }

    /// Relinquish leadership but keep participating. No-op for a
    /// non-leader member.
    pub async fn cede_leadership(self: &Arc<Self>) {
        if !self.is_leader().await {
            return;
        }
        self.flock.cede_leadership(&self.id).await;
    }

    /// Permanently leave the flock.
    pub async fn resign(self: &Arc<Self>) {
        if let Some(handle) = self.retry_sweep.lock().await.take() {
            handle.abort();
        }
        self.flock.unregister(&self.id).await;
    }

    fn spawn_timeout(self: &Arc<Self>, request_id: String, timeout: Duration, attempts: u32) -> JoinHandle<()> {
        let member = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            member.move_pending_to_retry(&request_id, attempts).await;
        })
    }

    async fn move_pending_to_retry(self: &Arc<Self>, request_id: &str, attempts: u32) {
        let entry = self.pending.lock().await.remove(request_id);
        if let Some(entry) = entry {
            self.retry.lock().await.insert(
                request_id.to_string(),
                RetryEntry {
                    payload: entry.payload,
                    resolver: entry.resolver,
                    attempts,
                },
            );
        }
    }

    /// Drop the retry queue if we're now the leader (self-addressed work
    /// is meaningless); otherwise resend or reject each entry.
    async fn process_retry(self: &Arc<Self>) {
        if self.is_leader().await {
            self.retry.lock().await.clear();
            return;
        }
        let snapshot: Vec<(String, RetryEntry)> = self.retry.lock().await.drain().collect();
        for (request_id, mut entry) in snapshot {
            entry.attempts += 1;
            if entry.attempts > MAX_RETRIES {
                entry.resolver.reject(Error::MaxRetriesReached {
                    request_id,
                    max_retries: MAX_RETRIES,
                });
                continue;
            }
            self.resend(request_id, entry).await;
        }
    }

    async fn resend(self: &Arc<Self>, request_id: String, entry: RetryEntry) {
        let timeout = self.flock.options().default_request_timeout();
        let handle = self.spawn_timeout(request_id.clone(), timeout, entry.attempts);
        let is_message = matches!(entry.resolver, PendingResolver::Message(_));
        let payload = entry.payload.clone();
        {
            self.pending.lock().await.insert(
                request_id.clone(),
                PendingEntry {
                    payload: entry.payload,
                    resolver: entry.resolver,
                    timeout_handle: handle,
                },
            );
        }
        if is_message {
            self.flock.post(crate::envelope::Envelope::MessageToLeader {
                sender_id: self.id.clone(),
                request_id,
                payload,
                ts: now_ts_millis(),
            });
        } else {
            self.flock.post(crate::envelope::Envelope::Request {
                sender_id: self.id.clone(),
                request_id,
                payload,
                ts: now_ts_millis(),
            });
        }
    }
}

#[async_trait::async_trait]
impl MemberSink for Member {
    async fn resolve_pending(self: Arc<Self>, request_id: String, payload: Option<Value>) {
        let entry = self.pending.lock().await.remove(&request_id);
        if let Some(entry) = entry {
            entry.timeout_handle.abort();
            match entry.resolver {
                PendingResolver::Request(tx) => {
                    let _ = tx.send(Ok(payload.unwrap_or(Value::Null)));
                }
                PendingResolver::Message(tx) => {
                    let _ = tx.send(Ok(()));
                }
            }
        }
    }

    async fn on_leadership_changed(self: Arc<Self>, new_leader_id: Option<String>) {
        let am_i_leader = new_leader_id.as_deref() == Some(self.id.as_str());
        let is_initial_discovery = !self.has_seen_leader.load(Ordering::SeqCst) && new_leader_id.is_some();

        if am_i_leader || !is_initial_discovery {
            let drained: Vec<(String, PendingEntry)> = self.pending.lock().await.drain().collect();
            {
                let mut retry = self.retry.lock().await;
                for (request_id, entry) in drained {
                    entry.timeout_handle.abort();
                    retry.insert(
                        request_id,
                        RetryEntry {
                            payload: entry.payload,
                            resolver: entry.resolver,
                            attempts: 0,
                        },
                    );
                }
            }
            self.process_retry().await;
        }

        if new_leader_id.is_some() {
            self.has_seen_leader.store(true, Ordering::SeqCst);
        }
        *self.last_known_leader_id.lock().await = new_leader_id.clone();

        if let Some(cb) = &self.on_leadership_change {
            cb(new_leader_id);
        }
    }

    fn on_message(&self, message: IncomingMessage) {
        if let Some(cb) = &self.on_message {
            cb(message);
        }
    }

    fn on_request(&self, reply: ReplyHandle, sender_id: String, payload: Value) {
        if let Some(cb) = &self.on_request {
            cb(reply, sender_id, payload);
        }
    }
}

/// Builds a [`Member`] with an optional capability bag of user callbacks,
/// then registers it with its `Flock`.
pub struct MemberBuilder {
    flock: Arc<Flock>,
    on_message: Option<Box<dyn Fn(IncomingMessage) + Send + Sync>>,
    on_request: Option<Box<dyn Fn(ReplyHandle, String, Value) + Send + Sync>>,
    on_leadership_change: Option<Box<dyn Fn(Option<String>) + Send + Sync>>,
}

impl MemberBuilder {
    pub fn new(flock: Arc<Flock>) -> Self {
        Self {
            flock,
            on_message: None,
            on_request: None,
            on_leadership_change: None,
        }
    }

    pub fn on_message(mut self, cb: impl Fn(IncomingMessage) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Box::new(cb));
        self
    }

    pub fn on_request(mut self, cb: impl Fn(ReplyHandle, String, Value) + Send + Sync + 'static) -> Self {
        self.on_request = Some(Box::new(cb));
        self
    }

    pub fn on_leadership_change(mut self, cb: impl Fn(Option<String>) + Send + Sync + 'static) -> Self {
        self.on_leadership_change = Some(Box::new(cb));
        self
    }

    pub async fn build(self) -> Arc<Member> {
        let member = Arc::new(Member {
            id: Uuid::new_v4().to_string(),
            flock: self.flock.clone(),
            pending: Mutex::new(HashMap::new()),
            retry: Mutex::new(HashMap::new()),
            has_seen_leader: AtomicBool::new(false),
            last_known_leader_id: Mutex::new(None),
            on_message: self.on_message,
            on_request: self.on_request,
            on_leadership_change: self.on_leadership_change,
            retry_sweep: Mutex::new(None),
        });

        member
            .flock
            .clone()
            .register(member.id.clone(), member.clone() as Arc<dyn MemberSink>)
            .await;

        let sweep_target = member.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(RETRY_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let has_leader = sweep_target.flock.leader_id().await.is_some();
                let queue_nonempty = !sweep_target.retry.lock().await.is_empty();
                if has_leader && queue_nonempty {
                    sweep_target.process_retry().await;
                }
            }
        });
        *member.retry_sweep.lock().await = Some(handle);

        member
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlockOptions;
    use crate::transport::LoopbackTransport;
    use std::time::Duration;

    fn new_flock() -> Arc<Flock> {
        let (transport, rx) = LoopbackTransport::new();
        Flock::new("member-tests".into(), FlockOptions::default(), Arc::new(transport), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn solo_member_round_trips_its_own_request() {
        let flock = new_flock();
        let member = Member::builder(flock)
            .on_request(|reply, _sender_id, payload| {
                reply.reply(payload);
            })
            .build()
            .await;

        tokio::time::advance(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;
        assert!(member.is_leader().await);

        let response = member.send_request(serde_json::json!({"x": 1}), None).await.unwrap();
        assert_eq!(response, serde_json::json!({"x": 1}));
    }

    #[tokio::test(start_paused = true)]
    async fn message_to_leader_acks() {
        let flock = new_flock();
        let member = Member::builder(flock)
            .on_message(|_msg| {})
            .build()
            .await;

        tokio::time::advance(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;

        member.send_message_to_leader(serde_json::json!("hi")).await.unwrap();
    }
}
