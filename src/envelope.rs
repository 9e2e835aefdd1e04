//! Wire Protocol
//!
//! Defines the envelope types exchanged between flock members over a
//! [`crate::transport::Transport`]. Every variant carries the fields its
//! row in the wire-protocol table specifies, plus a `ts` (sender wall-clock,
//! millis since the Unix epoch) carried for debugging only — receivers
//! never validate it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol messages exchanged between flock members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Envelope {
    /// Candidacy assertion: "I propose myself as leader".
    Claim { sender_id: String, ts: i64 },

    /// Leader liveness + identity assertion.
    Heartbeat { sender_id: String, ts: i64 },

    /// Leadership relinquished by its departing holder.
    Resign { sender_id: String, ts: i64 },

    /// "Who is leader?" sent by a newly-registered member.
    RequestLeaderSync { sender_id: String, ts: i64 },

    /// RPC to the leader, awaiting a [`Envelope::Response`].
    Request {
        sender_id: String,
        request_id: String,
        payload: Value,
        ts: i64,
    },

    /// One-way message to the leader; acknowledged with a synthetic
    /// [`Envelope::Response`] carrying no payload.
    MessageToLeader {
        sender_id: String,
        request_id: String,
        payload: Value,
        ts: i64,
    },

    /// RPC reply / ack, routed to `target_id`.
    Response {
        target_id: String,
        request_id: String,
        payload: Option<Value>,
        ts: i64,
    },

    /// Leader fan-out to every member.
    Broadcast {
        sender_id: String,
        payload: Value,
        ts: i64,
    },

    /// Leader fan-out to exactly one member.
    DirectMessage {
        sender_id: String,
        target_id: String,
        payload: Value,
        ts: i64,
    },
}

impl Envelope {
    /// Serialize to bytes for transport.
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from transport bytes.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// The envelope's variant name, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Envelope::Claim { .. } => "claim",
            Envelope::Heartbeat { .. } => "heartbeat",
            Envelope::Resign { .. } => "resign",
            Envelope::RequestLeaderSync { .. } => "request-leader-sync",
            Envelope::Request { .. } => "request",
            Envelope::MessageToLeader { .. } => "message-to-leader",
            Envelope::Response { .. } => "response",
            Envelope::Broadcast { .. } => "broadcast",
            Envelope::DirectMessage { .. } => "direct-message",
        }
    }

    /// The sender's ID, when this variant carries one.
    pub fn sender_id(&self) -> Option<&str> {
        match self {
            Envelope::Claim { sender_id, .. }
            | Envelope::Heartbeat { sender_id, .. }
            | Envelope::Resign { sender_id, .. }
            | Envelope::RequestLeaderSync { sender_id, .. }
            | Envelope::Request { sender_id, .. }
            | Envelope::MessageToLeader { sender_id, .. }
            | Envelope::Broadcast { sender_id, .. }
            | Envelope::DirectMessage { sender_id, .. } => Some(sender_id),
            Envelope::Response { .. } => None,
        }
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch, for
/// stamping outgoing envelopes. Not used for any internal timing decision
/// (those all go through `tokio::time`) — purely a debugging aid.
pub fn now_ts_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A length+checksum frame header, used by [`crate::transport::UdpBroadcastTransport`]
/// and [`crate::transport::SharedFileTransport`] to validate envelope bytes
/// before attempting deserialization.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub length: u32,
    pub checksum: u32,
}

impl FrameHeader {
    pub const SIZE: usize = 8;

    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            checksum: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        }
    }

    /// Frame an envelope's serialized bytes as `header || body`.
    pub fn frame(body: &[u8]) -> Vec<u8> {
        let header = Self::new(body);
        let mut out = Vec::with_capacity(Self::SIZE + body.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(body);
        out
    }

    /// Validate and split a framed buffer back into its body, or `None` if
    /// the buffer is truncated or the checksum does not match.
    pub fn unframe(buf: &[u8]) -> Option<&[u8]> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let (header_bytes, rest) = buf.split_at(Self::SIZE);
        let header = Self::from_bytes(header_bytes.try_into().ok()?);
        let body = rest.get(..header.length as usize)?;
        if crc32fast::hash(body) != header.checksum {
            return None;
        }
        Some(body)
    }
}
