use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::trace;
use parking_lot::Mutex;

use super::{Peer, REKEY_AFTER_MESSAGES, REKEY_AFTER_TIME};

/// Per-peer send-side timer state. The sequential sender feeds it; the
/// keepalive task and key-freshness policy read it.
#[derive(Default)]
pub struct PeerTimers {
    last_send: Mutex<Option<Instant>>,
    last_data_send: Mutex<Option<Instant>>,
    traversals: AtomicU64,
    data_sends: AtomicU64,
}

impl PeerTimers {
    /// An authenticated packet of any kind left for the peer.
    pub(crate) fn any_authenticated_packet_traversal(&self) {
        *self.last_send.lock() = Some(Instant::now());
        self.traversals.fetch_add(1, Ordering::Relaxed);
    }

    /// A data-bearing packet (anything but a keepalive) left for the peer.
    pub(crate) fn data_sent(&self) {
        *self.last_data_send.lock() = Some(Instant::now());
        self.data_sends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_send(&self) -> Option<Instant> {
        *self.last_send.lock()
    }

    pub fn last_data_send(&self) -> Option<Instant> {
        *self.last_data_send.lock()
    }

    pub fn traversal_count(&self) -> u64 {
        self.traversals.load(Ordering::Relaxed)
    }

    pub fn data_sent_count(&self) -> u64 {
        self.data_sends.load(Ordering::Relaxed)
    }
}

impl Peer {
    /// Request a handshake once the current key crosses the rekey
    /// thresholds, well before the reject limits stall the pipeline.
    pub(crate) async fn keep_key_fresh_sending(&self) {
        let Some(key) = self.sessions.read().await.current() else {
            return;
        };
        if key.sent_messages() >= REKEY_AFTER_MESSAGES || key.age() >= REKEY_AFTER_TIME {
            self.signals.handshake_begin.notify_one();
        }
    }

    /// Queue an empty element; it seals to exactly the keepalive size.
    pub async fn send_keepalive(&self) -> bool {
        let Some(device) = self.device.upgrade() else {
            return false;
        };
        trace!("queueing keepalive for peer {}", self.name);
        self.queue.nonce.push(device.new_element());
        true
    }
}

/// Keep an idle peer's session path warm: whenever nothing has been sent for
/// a full interval, queue a keepalive.
pub(crate) fn spawn_keepalive(peer: Arc<Peer>, interval: Duration) {
    let mut stop = peer.stop_rx();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.changed() => return,
                _ = ticker.tick() => {
                    let idle = peer
                        .timers
                        .last_send()
                        .map_or(true, |at| at.elapsed() >= interval);
                    if idle && !peer.send_keepalive().await {
                        return;
                    }
                }
            }
        }
    });
}
