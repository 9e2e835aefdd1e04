//! flockrs - Leader-election and coordination fabric
//!
//! A library for coordinating a "flock" of cooperating members sharing a
//! broadcast medium. Exactly one member is the leader at any time; all
//! others are followers. The leader is the sole party authorized to
//! answer requests and fan out broadcast/direct messages; followers get
//! automatic request retry across leader transitions.
//!
//! # Architecture
//!
//! - [`transport`] — the pub/sub abstraction over a channel, with three
//!   selectable tiers (UDP broadcast, shared-file, in-process loopback).
//! - [`flock`] — the per-channel election coordinator: state machine,
//!   heartbeat/monitor timers, member registry, message dispatch.
//! - [`member`] — the user-facing participant: pending/retry queues,
//!   request IDs, leader-only actions.
//! - [`registry`] — the multiton mapping channel name to its `Flock`.

pub mod config;
pub mod envelope;
pub mod error;
pub mod flock;
pub mod member;
pub mod registry;
pub mod transport;

pub use config::FlockOptions;
pub use error::{Error, Result};
pub use flock::Flock;
pub use member::{Member, MemberBuilder};
pub use registry::FlockRegistry;

/// Re-export of the types most callers need to build a flock.
pub mod prelude {
    pub use crate::config::{FlockOptions, TransportKind};
    pub use crate::envelope::Envelope;
    pub use crate::error::{Error, Result};
    pub use crate::flock::{Flock, IncomingMessage, IncomingMessageKind, ReplyHandle};
    pub use crate::member::{Member, MemberBuilder};
    pub use crate::registry::FlockRegistry;
}
