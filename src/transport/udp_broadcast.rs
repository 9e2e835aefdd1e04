//! UDP broadcast transport — the "native broadcast channel" tier.
//!
//! Publishes envelopes as UDP broadcast datagrams on a port derived from
//! the channel name, so any process on the same host broadcast domain
//! listening on that channel receives them. A dedicated send socket with
//! `SO_BROADCAST` plus a separate receive socket bound to a fixed port.
//!
//! UDP broadcast sockets do not deliver a sender's own datagrams back to
//! itself, so [`UdpBroadcastTransport::post`] performs the loopback
//! delivery explicitly.

use super::{InboundReceiver, InboundSender, Transport};
use crate::envelope::{Envelope, FrameHeader};
use crate::error::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Port range base; the channel name is hashed onto an offset within it so
/// distinct channels land on distinct ports and don't cross-talk.
const PORT_BASE: u16 = 47_000;
const PORT_RANGE: u16 = 1_000;

/// Datagrams larger than this are almost certainly not ours; bail out
/// before attempting to deserialize.
const MAX_DATAGRAM: usize = 64 * 1024;

fn port_for_channel(channel_name: &str) -> u16 {
    // FNV-1a: simple, dependency-free, stable across processes, which
    // matters here since independent processes must derive the same port
    // for the same channel name to hear each other.
    let mut hash: u32 = 0x811c_9dc5;
    for byte in channel_name.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    PORT_BASE + (hash % PORT_RANGE as u32) as u16
}

pub struct UdpBroadcastTransport {
    send_socket: Arc<UdpSocket>,
    broadcast_addr: SocketAddr,
    inbound_tx: InboundSender,
}

impl UdpBroadcastTransport {
    /// Bind the send and listen sockets for `channel_name`. Fails if the
    /// channel's fixed listen port is already bound on this host (by
    /// another flockrs process, or anything else) — that failure is what
    /// triggers the fallback to [`super::SharedFileTransport`].
    pub async fn bind(channel_name: &str) -> Result<(Arc<Self>, InboundReceiver)> {
        let port = port_for_channel(channel_name);

        let send_socket = UdpSocket::bind("0.0.0.0:0").await?;
        send_socket.set_broadcast(true)?;

        let listen_socket = UdpSocket::bind(("0.0.0.0", port)).await?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let transport = Arc::new(Self {
            send_socket: Arc::new(send_socket),
            broadcast_addr: format!("255.255.255.255:{port}").parse().unwrap(),
            inbound_tx,
        });

        transport.clone().spawn_listener(listen_socket);

        Ok((transport, inbound_rx))
    }

    fn spawn_listener(self: Arc<Self>, listen_socket: UdpSocket) {
        let inbound_tx = self.inbound_tx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (len, _src) = match listen_socket.recv_from(&mut buf).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::trace!("udp-broadcast listener recv error: {e}");
                        continue;
                    }
                };
                let Some(body) = FrameHeader::unframe(&buf[..len]) else {
                    tracing::trace!("udp-broadcast: dropped datagram with bad frame");
                    continue;
                };
                match Envelope::deserialize(body) {
                    Ok(envelope) => {
                        if inbound_tx.send(envelope).is_err() {
                            break; // receiver dropped, flock is shutting down
                        }
                    }
                    Err(e) => tracing::trace!("udp-broadcast: dropped malformed envelope: {e}"),
                }
            }
        });
    }
}

impl Transport for UdpBroadcastTransport {
    fn post(&self, envelope: Envelope) {
        // Explicit loopback: native broadcast sockets never self-deliver.
        if self.inbound_tx.send(envelope.clone()).is_err() {
            tracing::trace!("udp-broadcast transport: inbound receiver dropped");
        }

        let socket = self.send_socket.clone();
        let addr = self.broadcast_addr;
        tokio::spawn(async move {
            let body = match envelope.serialize() {
                Ok(body) => body,
                Err(e) => {
                    tracing::trace!("udp-broadcast: serialize failed, dropping: {e}");
                    return;
                }
            };
            let framed = FrameHeader::frame(&body);
            if let Err(e) = socket.send_to(&framed, addr).await {
                tracing::trace!("udp-broadcast send failed (network may not support broadcast): {e}");
            }
        });
    }

    fn tier_name(&self) -> &'static str {
        "udp-broadcast"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_derivation_is_stable_and_in_range() {
        let a = port_for_channel("flock_channel_v1");
        let b = port_for_channel("flock_channel_v1");
        assert_eq!(a, b);
        assert!((PORT_BASE..PORT_BASE + PORT_RANGE).contains(&a));
    }

    #[test]
    fn distinct_channels_usually_land_on_distinct_ports() {
        assert_ne!(port_for_channel("channel-a"), port_for_channel("channel-b"));
    }

    #[tokio::test]
    async fn post_loops_back_locally() {
        let channel = format!("test-udp-{}", uuid::Uuid::new_v4());
        let (transport, mut rx) = UdpBroadcastTransport::bind(&channel)
            .await
            .expect("bind should succeed in test sandbox");
        transport.post(Envelope::Claim {
            sender_id: "m1".into(),
            ts: 0,
        });
        let received = rx.recv().await.expect("loopback delivery");
        assert_eq!(received.type_name(), "claim");
    }
}
