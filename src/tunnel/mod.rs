pub mod device;
pub mod element;
pub mod queue;
pub mod routing;
pub(crate) mod send;
pub mod session;
pub mod timers;

// Re-exports for external usage
pub use device::{Device, DeviceOptions, DeviceSignals};
pub use element::{BufferPool, OutboundElement, PooledBuffer};
pub use queue::{BoundedQueue, Displaced};
pub use routing::RoutingTable;
pub use session::{SessionKey, SessionState};
pub use timers::PeerTimers;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::debug;
use tokio::sync::{watch, Notify, RwLock};

use element::OutboundHandle;

// Transport message layout and session limits. The numeric values follow
// the underlying tunnel protocol.
pub const MAX_MESSAGE_SIZE: usize = 4096;
pub const MESSAGE_TRANSPORT_HEADER_SIZE: usize = 16;
pub const AEAD_TAG_SIZE: usize = 16;
pub const MAX_CONTENT_SIZE: usize = MAX_MESSAGE_SIZE - MESSAGE_TRANSPORT_HEADER_SIZE - AEAD_TAG_SIZE;
pub const MESSAGE_TRANSPORT_TYPE: u32 = 4;
pub const MESSAGE_KEEPALIVE_SIZE: usize = MESSAGE_TRANSPORT_HEADER_SIZE + AEAD_TAG_SIZE;
pub const PADDING_MULTIPLE: usize = 16;

pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 13);
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);
pub const REKEY_AFTER_MESSAGES: u64 = 1 << 60;
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);

pub const SEND_FAILURE_BACKOFF: Duration = Duration::from_secs(2);

/// Out-of-band status published when the TUN reader dies on a read error.
pub const STATUS_TUN_READ_FAILED: i32 = 101;

/// Single-slot notifications between the pipeline and the peer's handshake
/// machinery. Raises before a wait coalesce into one wakeup.
#[derive(Default)]
pub struct PeerSignals {
    /// The pipeline wants a session key (none installed, or past its limits).
    pub handshake_begin: Notify,
    /// Outbound traffic is live; the session should be kept warm.
    pub handshake_reset: Notify,
    /// A new session key was installed.
    pub new_session: Notify,
    /// Discard everything waiting for a key.
    pub flush_queued: Notify,
}

#[derive(Debug, Default)]
pub struct PeerStats {
    pub bytes_sent: AtomicU64,
    pub packets_sent: AtomicU64,
}

impl PeerStats {
    pub(crate) fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) struct PeerQueues {
    /// Feeds the nonce assigner; packets wait here for a usable key.
    pub nonce: BoundedQueue<OutboundElement>,
    /// Feeds the sequential sender in publish order.
    pub outbound: BoundedQueue<OutboundHandle>,
}

/// The remote end of the tunnel: endpoint, session keys, per-peer queues and
/// the routines' signal set.
pub struct Peer {
    pub name: String,
    pub(crate) device: Weak<device::Device>,
    pub endpoint: RwLock<Option<SocketAddr>>,
    pub(crate) sessions: RwLock<SessionState>,
    pub(crate) queue: PeerQueues,
    pub signals: PeerSignals,
    pub timers: PeerTimers,
    pub stats: PeerStats,
    pub(crate) persistent_keepalive: Option<Duration>,
    stop: watch::Sender<bool>,
}

impl Peer {
    pub(crate) fn new(
        name: String,
        device: Weak<device::Device>,
        endpoint: Option<SocketAddr>,
        persistent_keepalive: Option<Duration>,
        nonce_capacity: usize,
        outbound_capacity: usize,
    ) -> Arc<Self> {
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            name,
            device,
            endpoint: RwLock::new(endpoint),
            sessions: RwLock::new(SessionState::default()),
            queue: PeerQueues {
                nonce: BoundedQueue::new(nonce_capacity),
                outbound: BoundedQueue::new(outbound_capacity),
            },
            signals: PeerSignals::default(),
            timers: PeerTimers::default(),
            stats: PeerStats::default(),
            persistent_keepalive,
            stop,
        })
    }

    /// Install a freshly negotiated session key and wake the nonce assigner.
    pub async fn install_session(&self, key: SessionKey) {
        self.sessions.write().await.install(Arc::new(key));
        self.signals.new_session.notify_one();
    }

    pub async fn current_session(&self) -> Option<Arc<SessionKey>> {
        self.sessions.read().await.current()
    }

    pub async fn set_endpoint(&self, endpoint: SocketAddr) {
        *self.endpoint.write().await = Some(endpoint);
    }

    /// Write one datagram to the peer's endpoint over the shared socket.
    /// Transmission holds the read side of the socket lock and of the peer's
    /// endpoint lock; reconfiguration takes the writers.
    pub async fn send_buffer(&self, packet: &[u8]) -> std::io::Result<usize> {
        use std::io::{Error, ErrorKind};

        let device = self
            .device
            .upgrade()
            .ok_or_else(|| Error::new(ErrorKind::NotConnected, "device is gone"))?;
        let sock = device.sock.read().await;
        let Some(sock) = sock.as_ref() else {
            return Err(Error::new(ErrorKind::NotConnected, "no udp socket for device"));
        };
        let endpoint = self.endpoint.read().await;
        let Some(endpoint) = *endpoint else {
            return Err(Error::new(ErrorKind::AddrNotAvailable, "peer has no endpoint"));
        };
        sock.send_to(packet, endpoint).await
    }

    pub(crate) fn stop_rx(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// Terminate the peer's routines. Queued elements are discarded and
    /// their buffers reclaimed as the queues drop them.
    pub(crate) fn stop(&self) {
        debug!("stopping peer {}", self.name);
        let _ = self.stop.send(true);
        self.queue.nonce.close();
        self.queue.outbound.close();
    }
}

#[cfg(test)]
pub(crate) fn test_peer(name: &str) -> Arc<Peer> {
    Peer::new(name.to_string(), Weak::new(), None, None, 8, 8)
}
