//! Shared-file transport — the "shared storage" fallback tier.
//!
//! Used when the UDP broadcast tier cannot be established (no broadcast
//! capability on the host network, or the channel's listen port is taken).
//! Every published envelope is framed and written as its own file under a
//! shared directory; a poller reads new files back and delivers them, and
//! the writer removes its own file a short interval later so that any
//! other process's poller has a window to observe it first. This mirrors
//! the UDP broadcast tier's "publish once, everyone subscribed observes it"
//! contract without requiring a real broadcast-capable network.

use super::{InboundReceiver, InboundSender, Transport};
use crate::envelope::{Envelope, FrameHeader};
use crate::error::Result;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// How long a poller waits between directory scans.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How long after writing a file its author removes it. Must exceed
/// `POLL_INTERVAL` by a comfortable margin so at least one full poll cycle
/// (ideally two) can observe it before it disappears.
const REMOVAL_DELAY: Duration = Duration::from_millis(50);

pub struct SharedFileTransport {
    dir: PathBuf,
    inbound_tx: InboundSender,
    seen: Arc<Mutex<HashSet<String>>>,
}

impl SharedFileTransport {
    /// Construct the transport, rooted at `shared_dir` (defaulting to a
    /// `flockrs` subdirectory of the OS temp directory) under a
    /// channel-named subdirectory. Fails only if that directory cannot be
    /// created.
    pub async fn new(channel_name: &str, shared_dir: Option<&std::path::Path>) -> Result<(Arc<Self>, InboundReceiver)> {
        let root = shared_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("flockrs"));
        let dir = root.join(sanitize(channel_name));
        tokio::fs::create_dir_all(&dir).await?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            dir,
            inbound_tx,
            seen: Arc::new(Mutex::new(HashSet::new())),
        });

        transport.clone().spawn_poller();

        Ok((transport, inbound_rx))
    }

    fn spawn_poller(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            loop {
                interval.tick().await;
                self.poll_once().await;
            }
        });
    }

    async fn poll_once(&self) {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::trace!("shared-file poll: read_dir failed: {e}");
                return;
            }
        };
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::trace!("shared-file poll: dir iteration error: {e}");
                    break;
                }
            };
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            {
                let mut seen = self.seen.lock().await;
                if !seen.insert(name.clone()) {
                    continue;
                }
            }
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::trace!("shared-file poll: read {name} failed: {e}");
                    continue;
                }
            };
            let Some(body) = FrameHeader::unframe(&bytes) else {
                tracing::trace!("shared-file poll: dropped {name}, bad frame");
                continue;
            };
            match Envelope::deserialize(body) {
                Ok(envelope) => {
                    let _ = self.inbound_tx.send(envelope);
                }
                Err(e) => tracing::trace!("shared-file poll: dropped malformed envelope {name}: {e}"),
            }
        }
    }
}

impl Transport for SharedFileTransport {
    fn post(&self, envelope: Envelope) {
        if self.inbound_tx.send(envelope.clone()).is_err() {
            tracing::trace!("shared-file transport: inbound receiver dropped");
        }

        let dir = self.dir.clone();
        let seen = self.seen.clone();
        tokio::spawn(async move {
            let body = match envelope.serialize() {
                Ok(body) => body,
                Err(e) => {
                    tracing::trace!("shared-file: serialize failed, dropping: {e}");
                    return;
                }
            };
            let framed = FrameHeader::frame(&body);
            let name = format!("{}.msg", uuid::Uuid::new_v4());
            let path = dir.join(&name);

            if let Err(e) = tokio::fs::write(&path, &framed).await {
                tracing::trace!("shared-file: write failed: {e}");
                return;
            }
            // Mark our own file as already delivered so the local poller
            // doesn't hand it back to us a second time.
            seen.lock().await.insert(name.clone());

            tokio::time::sleep(REMOVAL_DELAY).await;
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::trace!("shared-file: cleanup of {name} failed: {e}");
            }
            seen.lock().await.remove(&name);
        });
    }

    fn tier_name(&self) -> &'static str {
        "shared-file"
    }
}

fn sanitize(channel_name: &str) -> String {
    channel_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_its_own_post_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, mut rx) = SharedFileTransport::new("chan", Some(dir.path())).await.unwrap();
        transport.post(Envelope::Resign {
            sender_id: "m1".into(),
            ts: 0,
        });
        let env = rx.recv().await.unwrap();
        assert_eq!(env.type_name(), "resign");
    }

    #[tokio::test]
    async fn a_second_transport_on_the_same_directory_observes_the_post() {
        let dir = tempfile::tempdir().unwrap();
        let (a, _rx_a) = SharedFileTransport::new("chan", Some(dir.path())).await.unwrap();
        let (_b, mut rx_b) = SharedFileTransport::new("chan", Some(dir.path())).await.unwrap();

        a.post(Envelope::Heartbeat {
            sender_id: "m1".into(),
            ts: 0,
        });

        let env = tokio::time::timeout(Duration::from_millis(500), rx_b.recv())
            .await
            .expect("should be delivered before removal")
            .unwrap();
        assert_eq!(env.type_name(), "heartbeat");
    }

    #[tokio::test]
    async fn sanitizes_channel_names_with_path_separators() {
        let dir = tempfile::tempdir().unwrap();
        let (_t, _rx) = SharedFileTransport::new("a/b c", Some(dir.path())).await.unwrap();
        assert!(dir.path().join("a_b_c").is_dir());
    }
}
