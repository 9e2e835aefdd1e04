//! Pure in-process loopback transport.
//!
//! Used when neither the UDP broadcast tier nor the shared-file tier is
//! available (e.g. a sandboxed test harness), and as the default for
//! single-process demos and unit tests. Construction never fails: only
//! local members of this one [`crate::flock::Flock`] see published
//! envelopes.

use super::{InboundReceiver, InboundSender, Transport};
use crate::envelope::Envelope;
use tokio::sync::mpsc;

pub struct LoopbackTransport {
    inbound_tx: InboundSender,
}

impl LoopbackTransport {
    pub fn new() -> (Self, InboundReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { inbound_tx: tx }, rx)
    }
}

impl Transport for LoopbackTransport {
    fn post(&self, envelope: Envelope) {
        // No other contexts exist to deliver to; this is the loopback copy.
        if self.inbound_tx.send(envelope).is_err() {
            tracing::trace!("loopback transport: inbound receiver dropped, envelope discarded");
        }
    }

    fn tier_name(&self) -> &'static str {
        "loopback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_everything_it_posts() {
        let (transport, mut rx) = LoopbackTransport::new();
        for i in 0..3 {
            transport.post(Envelope::Heartbeat {
                sender_id: format!("m{i}"),
                ts: i,
            });
        }
        for i in 0..3 {
            let env = rx.recv().await.unwrap();
            match env {
                Envelope::Heartbeat { sender_id, .. } => assert_eq!(sender_id, format!("m{i}")),
                _ => panic!("unexpected variant"),
            }
        }
    }
}
