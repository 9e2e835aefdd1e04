//! Multiton registry mapping channel name to its [`Flock`].
//!
//! Per channel, the *first* caller's [`FlockOptions`] win — later callers
//! joining an already-known channel get the existing coordinator
//! regardless of what timings they requested, since every participant on
//! one channel must share one set of timings.

use crate::config::FlockOptions;
use crate::flock::Flock;
use crate::transport;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;

/// A process-scoped `channel_name -> Flock` map. Most callers should use
/// [`FlockRegistry::global`] rather than constructing their own instance;
/// an explicit instance exists mainly so tests can isolate themselves
/// without touching global state.
pub struct FlockRegistry {
    flocks: Mutex<HashMap<String, Arc<Flock>>>,
}

impl FlockRegistry {
    pub fn new() -> Self {
        Self {
            flocks: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide default registry.
    pub fn global() -> &'static FlockRegistry {
        static GLOBAL: OnceLock<FlockRegistry> = OnceLock::new();
        GLOBAL.get_or_init(FlockRegistry::new)
    }

    /// Return the `Flock` for `options.channel_name`, constructing it (and
    /// selecting its transport) if this is the first request for that
    /// channel in this registry.
    pub async fn get(&self, options: FlockOptions) -> Arc<Flock> {
        let mut flocks = self.flocks.lock().await;
        if let Some(existing) = flocks.get(&options.channel_name) {
            return existing.clone();
        }

        let channel_name = options.channel_name.clone();
        let (transport, inbound) = match options.transport {
            crate::config::TransportKind::Auto => {
                transport::select(&channel_name, options.shared_dir.as_deref()).await
            }
            forced => transport::select_forced(forced, &channel_name, options.shared_dir.as_deref())
                .await
                .unwrap_or_else(|_| {
                    tracing::warn!(
                        channel = %channel_name,
                        "forced transport tier unavailable, falling back to loopback"
                    );
                    let (t, rx) = transport::LoopbackTransport::new();
                    (Arc::new(t) as Arc<dyn transport::Transport>, rx)
                }),
        };

        let flock = Flock::new(channel_name.clone(), options, transport, inbound);
        flocks.insert(channel_name, flock.clone());
        flock
    }

    /// Tear down and forget the `Flock` for `channel_name`, if any. Not
    /// part of the source design (which has no teardown path at all) —
    /// added because embedding hosts that outlive a single channel's
    /// lifetime (tests, long-running services cycling channels) need one.
    pub async fn drop_channel(&self, channel_name: &str) {
        let removed = self.flocks.lock().await.remove(channel_name);
        if let Some(flock) = removed {
            flock.shutdown().await;
        }
    }

    /// Remove every tracked `Flock`, shutting each down. For test
    /// isolation between cases that use [`FlockRegistry::global`].
    pub async fn reset(&self) {
        let drained: Vec<Arc<Flock>> = self.flocks.lock().await.drain().map(|(_, f)| f).collect();
        for flock in drained {
            flock.shutdown().await;
        }
    }
}

impl Default for FlockRegistry {
    fn default() -> Self {
        Self::new()
    }
}
