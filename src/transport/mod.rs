//! Transport Abstraction
//!
//! A `Transport` publishes an [`Envelope`] to every subscriber on a channel,
//! including a loopback copy to the local process, and delivers inbound
//! envelopes (from any source, local or not) to a single receiver.
//!
//! Three tiers are provided, probed in order by [`select`]: a UDP broadcast
//! transport (the "native broadcast channel" primitive), a shared-file
//! fallback (the "shared-storage" primitive), and a pure in-process
//! loopback transport used when neither capability is available. Selection
//! is one-shot, performed once at `Flock` construction.

mod loopback;
mod shared_file;
mod udp_broadcast;

pub use loopback::LoopbackTransport;
pub use shared_file::SharedFileTransport;
pub use udp_broadcast::UdpBroadcastTransport;

use crate::config::TransportKind;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Inbound envelopes, one per publish (local or remote), delivered in the
/// order the transport observed them.
pub type InboundReceiver = mpsc::UnboundedReceiver<Envelope>;
pub(crate) type InboundSender = mpsc::UnboundedSender<Envelope>;

/// A publish/subscribe capability over one named channel.
///
/// Implementations never propagate errors to callers: a serialization or
/// I/O failure is logged and the envelope is dropped.
pub trait Transport: Send + Sync {
    /// Publish `envelope` to every subscriber, including a loopback copy
    /// delivered to this process's own inbound receiver.
    fn post(&self, envelope: Envelope);

    /// A short tag identifying which tier this is, for logging.
    fn tier_name(&self) -> &'static str;
}

/// Probe transport capabilities in order and construct the first one that
/// succeeds: UDP broadcast, then shared-file, then loopback-only (which
/// never fails). This is the default, capability-auto-detecting path.
pub async fn select(channel_name: &str, shared_dir: Option<&Path>) -> (Arc<dyn Transport>, InboundReceiver) {
    if let Ok(pair) = UdpBroadcastTransport::bind(channel_name).await {
        tracing::debug!(channel = channel_name, "selected udp-broadcast transport");
        return (pair.0 as Arc<dyn Transport>, pair.1);
    }
    if let Ok(pair) = SharedFileTransport::new(channel_name, shared_dir).await {
        tracing::debug!(channel = channel_name, "selected shared-file transport");
        return (pair.0 as Arc<dyn Transport>, pair.1);
    }
    tracing::debug!(channel = channel_name, "selected loopback-only transport");
    let (transport, rx) = LoopbackTransport::new();
    (Arc::new(transport), rx)
}

/// Construct a specific transport tier, failing with
/// [`Error::TransportUnavailable`] if that tier cannot be established.
/// Only reachable via an explicit override; [`select`] never fails since
/// it always falls through to loopback.
pub async fn select_forced(
    kind: TransportKind,
    channel_name: &str,
    shared_dir: Option<&Path>,
) -> Result<(Arc<dyn Transport>, InboundReceiver)> {
    match kind {
        TransportKind::Auto => Ok(select(channel_name, shared_dir).await),
        TransportKind::UdpBroadcast => UdpBroadcastTransport::bind(channel_name)
            .await
            .map(|(t, rx)| (t as Arc<dyn Transport>, rx))
            .map_err(|_| Error::TransportUnavailable(channel_name.to_string())),
        TransportKind::SharedFile => SharedFileTransport::new(channel_name, shared_dir)
            .await
            .map(|(t, rx)| (t as Arc<dyn Transport>, rx))
            .map_err(|_| Error::TransportUnavailable(channel_name.to_string())),
        TransportKind::Loopback => {
            let (t, rx) = LoopbackTransport::new();
            Ok((Arc::new(t) as Arc<dyn Transport>, rx))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn select_always_produces_a_working_transport() {
        let (transport, mut rx) = select("test-select-channel", None).await;
        let env = Envelope::Heartbeat {
            sender_id: "m1".into(),
            ts: 0,
        };
        transport.post(env);
        let received = rx.recv().await.expect("loopback delivery");
        assert_eq!(received.type_name(), "heartbeat");
    }

    #[tokio::test]
    async fn forced_loopback_always_succeeds() {
        let result = select_forced(TransportKind::Loopback, "forced-loopback", None).await;
        assert!(result.is_ok());
    }
}
