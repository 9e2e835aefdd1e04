//! Multi-member seed scenarios.
//!
//! Unlike the per-module `#[cfg(test)]` suites, these wire up several
//! `Member`s the way a real caller would — sharing one `Flock` via
//! loopback for single-process scenarios, or two independent `Flock`s
//! over a shared directory where a scenario calls for simulating
//! separate processes (a transport tier outliving the `Flock` that used
//! it, so "the leader's process crashed" means its `Flock`'s dispatch
//! loop stopped while its peers' did not).

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use flockrs::config::FlockOptions;
use flockrs::flock::Flock;
use flockrs::transport::{LoopbackTransport, SharedFileTransport, Transport};
use flockrs::MemberBuilder;

fn loopback_flock() -> Arc<Flock> {
    let (transport, rx) = LoopbackTransport::new();
    Flock::new("scenario-loopback".into(), FlockOptions::default(), Arc::new(transport), rx)
}

fn loopback_flock_named(channel: &str) -> Arc<Flock> {
    let (transport, rx) = LoopbackTransport::new();
    Flock::new(channel.into(), FlockOptions::default(), Arc::new(transport), rx)
}

async fn shared_file_flock(dir: &Path, channel: &str) -> Arc<Flock> {
    let (transport, rx) = SharedFileTransport::new(channel, Some(dir)).await.unwrap();
    Flock::new(channel.into(), FlockOptions::default(), transport as Arc<dyn Transport>, rx)
}

async fn settle() {
    tokio::time::advance(Duration::from_millis(600)).await;
    drain().await;
}

/// Leadership/response chains hop across several spawned tasks (dispatch
/// loop -> notify task -> retry resend -> dispatch loop again); a single
/// `yield_now` isn't guaranteed to drain all of them, so give the
/// scheduler several turns.
async fn drain() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// 1. Solo election: a single member converges to leadership within 600ms,
/// firing exactly one leadership-change notification.
#[tokio::test(start_paused = true)]
async fn solo_election() {
    let flock = loopback_flock();
    let events = Arc::new(StdMutex::new(Vec::new()));
    let recorded = events.clone();
    let m1 = MemberBuilder::new(flock)
        .on_leadership_change(move |leader_id| recorded.lock().unwrap().push(leader_id))
        .build()
        .await;

    settle().await;

    assert!(m1.is_leader().await);
    let seen = events.lock().unwrap().clone();
    assert_eq!(seen, vec![Some(m1.id().to_string())]);
}

/// 2. Two-member convergence: a second member joining an already-settled
/// channel observes the same leader, without triggering a re-election.
#[tokio::test(start_paused = true)]
async fn two_member_convergence() {
    let dir = tempfile::tempdir().unwrap();
    let flock_a = shared_file_flock(dir.path(), "convergence").await;
    let m1 = MemberBuilder::new(flock_a).build().await;
    settle().await;
    assert!(m1.is_leader().await);

    let flock_b = shared_file_flock(dir.path(), "convergence").await;
    let events = Arc::new(StdMutex::new(Vec::new()));
    let recorded = events.clone();
    let m2 = MemberBuilder::new(flock_b)
        .on_leadership_change(move |leader_id| recorded.lock().unwrap().push(leader_id))
        .build()
        .await;
    settle().await;

    assert!(!m2.is_leader().await);
    assert_eq!(events.lock().unwrap().last().cloned().flatten(), Some(m1.id().to_string()));
}

/// 3. Leader death: once the leader's process (here, its `Flock`) stops
/// running, the surviving follower notices the stale heartbeat and elects
/// itself within `heartbeat_ttl + monitor_interval`.
#[tokio::test(start_paused = true)]
async fn leader_death_triggers_reelection() {
    let dir = tempfile::tempdir().unwrap();
    let flock_a = shared_file_flock(dir.path(), "leader-death").await;
    let m1 = MemberBuilder::new(flock_a.clone()).build().await;
    settle().await;
    assert!(m1.is_leader().await);

    let flock_b = shared_file_flock(dir.path(), "leader-death").await;
    let m2 = MemberBuilder::new(flock_b.clone()).build().await;
    settle().await;
    assert!(!m2.is_leader().await);

    // Simulate M1's process crashing: its Flock stops dispatching (and so
    // stops heartbeating), though its transport keeps running.
    flock_a.shutdown().await;

    tokio::time::advance(Duration::from_millis(6000)).await;
    drain().await;

    assert!(m2.is_leader().await);
    assert_eq!(flock_b.leader_id().await.as_deref(), Some(m2.id()));
}

/// 4. Request across a leader transition: a follower's in-flight request
/// survives its leader disappearing and resolves once a new leader (not
/// the requester itself) takes over and replies.
#[tokio::test(start_paused = true)]
async fn request_survives_leader_transition() {
    let flock = loopback_flock();

    // m1 claims leadership first and never answers requests (standing in
    // for a leader that crashes mid-request).
    let m1 = MemberBuilder::new(flock.clone()).build().await;
    settle().await;
    assert!(m1.is_leader().await);

    // m3 registers next so it is the next candidate once m1 steps down,
    // and it actually answers requests.
    let m3 = MemberBuilder::new(flock.clone())
        .on_request(|reply, _sender_id, payload| reply.reply(payload))
        .build()
        .await;
    drain().await;

    // m2 is the requester.
    let m2 = MemberBuilder::new(flock.clone()).build().await;
    drain().await;

    let payload = serde_json::json!({"x": 1});
    let request = tokio::spawn({
        let m2 = m2.clone();
        let payload = payload.clone();
        async move { m2.send_request(payload, None).await }
    });
    drain().await;

    // m1's process crashes before it ever replies.
    m1.resign().await;
    drain().await;

    assert!(m3.is_leader().await);

    let response = tokio::time::timeout(Duration::from_secs(10), request)
        .await
        .expect("request task didn't finish")
        .expect("request task panicked")
        .expect("request should resolve, not error");
    assert_eq!(response, payload);
}

/// If no surviving member ever answers, the request eventually rejects
/// with `MaxRetriesReached` rather than hanging forever.
#[tokio::test(start_paused = true)]
async fn request_exhausts_retries_and_rejects() {
    let flock = loopback_flock();
    let m1 = MemberBuilder::new(flock.clone()).build().await;
    settle().await;
    assert!(m1.is_leader().await);

    let m2 = MemberBuilder::new(flock).build().await;
    drain().await;

    let timeout = m2.send_request(serde_json::json!("ping"), None);
    tokio::pin!(timeout);

    let err = loop {
        tokio::select! {
            biased;
            result = &mut timeout => break result.unwrap_err(),
            _ = tokio::time::sleep(Duration::from_millis(6000)) => {
                tokio::task::yield_now().await;
            }
        }
    };
    assert!(matches!(err, flockrs::Error::MaxRetriesReached { .. }));
}

/// 5. Cede leadership: the ceding member's peer takes over, and the
/// ceding member cannot immediately reclaim it.
#[tokio::test(start_paused = true)]
async fn cede_leadership_hands_off_to_peer() {
    let flock = loopback_flock();
    let m1 = MemberBuilder::new(flock.clone()).build().await;
    settle().await;
    assert!(m1.is_leader().await);

    let m2 = MemberBuilder::new(flock).build().await;
    drain().await;
    assert!(!m2.is_leader().await);

    m1.cede_leadership().await;
    drain().await;

    assert!(m2.is_leader().await);
    assert!(!m1.is_leader().await);
}

/// 6. Channel isolation: members on distinct channels never observe each
/// other's leadership, each converging independently.
#[tokio::test(start_paused = true)]
async fn channel_isolation() {
    let flock_a = loopback_flock_named("channel-a");
    let flock_b = loopback_flock_named("channel-b");

    let m1 = MemberBuilder::new(flock_a.clone()).build().await;
    let m2 = MemberBuilder::new(flock_b.clone()).build().await;
    settle().await;

    assert!(m1.is_leader().await);
    assert!(m2.is_leader().await);
    assert_eq!(flock_a.leader_id().await.as_deref(), Some(m1.id()));
    assert_eq!(flock_b.leader_id().await.as_deref(), Some(m2.id()));
    assert_ne!(flock_a.channel_name(), flock_b.channel_name());
}
