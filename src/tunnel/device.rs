use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use ipnetwork::IpNetwork;
use log::{error, info};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Notify, RwLock};

use crate::tun::TunDevice;

use super::element::{BufferPool, EncryptJob, OutboundElement};
use super::queue::BoundedQueue;
use super::routing::RoutingTable;
use super::{send, timers, Peer};

/// Tunables for a device's pipeline. Zero workers means one per CPU.
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub encryption_workers: usize,
    pub nonce_queue_capacity: usize,
    pub outbound_queue_capacity: usize,
    pub encryption_queue_capacity: usize,
    pub pool_idle_cap: usize,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            encryption_workers: 0,
            nonce_queue_capacity: 1024,
            outbound_queue_capacity: 1024,
            encryption_queue_capacity: 1024,
            pool_idle_cap: 512,
        }
    }
}

#[derive(Default)]
pub struct DeviceSignals {
    /// Raised by the sequential sender after a failed transmit. An external
    /// endpoint-roaming subsystem may rebind the socket in response.
    pub network_change: Notify,
}

/// One tunnel interface: the TUN handle, the shared transport socket, the
/// routing table, the device-wide encryption queue and the buffer pool.
pub struct Device {
    pub(crate) tun: Arc<dyn TunDevice>,
    pub(crate) sock: RwLock<Option<Arc<UdpSocket>>>,
    pub(crate) routing: RwLock<RoutingTable>,
    pub(crate) encryption: BoundedQueue<EncryptJob>,
    pool: Arc<BufferPool>,
    mtu: AtomicUsize,
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    pub signals: DeviceSignals,
    options: DeviceOptions,
    stop: watch::Sender<bool>,
    status: mpsc::UnboundedSender<i32>,
}

impl Device {
    /// Build a device around a TUN handle. The returned receiver carries
    /// out-of-band status codes from the pipeline (fatal TUN reads).
    pub fn new(
        tun: Arc<dyn TunDevice>,
        options: DeviceOptions,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<i32>) {
        let (status, status_rx) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);
        let mtu = tun.mtu();
        let device = Arc::new(Self {
            tun,
            sock: RwLock::new(None),
            routing: RwLock::new(RoutingTable::new()),
            encryption: BoundedQueue::new(options.encryption_queue_capacity),
            pool: BufferPool::new(options.pool_idle_cap),
            mtu: AtomicUsize::new(mtu),
            peers: RwLock::new(HashMap::new()),
            signals: DeviceSignals::default(),
            options,
            stop,
            status,
        });
        (device, status_rx)
    }

    /// Install (or replace) the transport socket. Reconfiguration holds the
    /// write side; in-flight transmits finish under their read guards first.
    pub async fn set_socket(&self, sock: UdpSocket) {
        *self.sock.write().await = Some(Arc::new(sock));
    }

    pub fn set_mtu(&self, mtu: usize) {
        self.mtu.store(mtu, Ordering::Relaxed);
    }

    pub(crate) fn mtu(&self) -> usize {
        self.mtu.load(Ordering::Relaxed)
    }

    pub(crate) fn new_element(&self) -> OutboundElement {
        OutboundElement::new(self.pool.checkout())
    }

    /// Buffers currently resting in the pool.
    pub fn idle_buffers(&self) -> usize {
        self.pool.idle()
    }

    pub(crate) fn send_status(&self, code: i32) {
        let _ = self.status.send(code);
    }

    /// Spawn the device-wide routines: the TUN reader and the encryption
    /// worker pool.
    pub fn start(self: &Arc<Self>) {
        let workers = if self.options.encryption_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.options.encryption_workers
        };
        info!(
            "starting outbound pipeline on {} with {workers} encryption workers",
            self.tun.name()
        );
        spawn_routine(
            "tun reader",
            send::run_tun_reader(self.clone(), self.stop.subscribe()),
        );
        for id in 0..workers {
            spawn_routine(
                "encryption worker",
                send::run_encryption_worker(self.clone(), id, self.stop.subscribe()),
            );
        }
    }

    /// Register a peer, extend the routing table with its allowed networks,
    /// and spawn its nonce assigner, sequential sender and keepalive task.
    pub async fn add_peer(
        self: &Arc<Self>,
        name: &str,
        endpoint: Option<SocketAddr>,
        allowed_ips: &[IpNetwork],
        persistent_keepalive: Option<Duration>,
    ) -> Result<Arc<Peer>> {
        let peer = Peer::new(
            name.to_string(),
            Arc::downgrade(self),
            endpoint,
            persistent_keepalive,
            self.options.nonce_queue_capacity,
            self.options.outbound_queue_capacity,
        );
        {
            let mut peers = self.peers.write().await;
            if peers.contains_key(name) {
                return Err(anyhow!("peer {name} already exists"));
            }
            peers.insert(name.to_string(), peer.clone());
        }
        {
            let mut routing = self.routing.write().await;
            for network in allowed_ips {
                routing.insert(*network, peer.clone());
            }
        }
        spawn_routine(
            "nonce assigner",
            send::run_nonce_assigner(self.clone(), peer.clone(), peer.stop_rx()),
        );
        spawn_routine(
            "sequential sender",
            send::run_sequential_sender(self.clone(), peer.clone(), peer.stop_rx()),
        );
        if let Some(interval) = peer.persistent_keepalive {
            timers::spawn_keepalive(peer.clone(), interval);
        }
        info!("added peer {name} ({} allowed networks)", allowed_ips.len());
        Ok(peer)
    }

    /// Retract a peer's routes and terminate its routines.
    pub async fn remove_peer(&self, name: &str) -> bool {
        let Some(peer) = self.peers.write().await.remove(name) else {
            return false;
        };
        self.routing.write().await.remove_peer(name);
        peer.stop();
        true
    }

    pub async fn peer(&self, name: &str) -> Option<Arc<Peer>> {
        self.peers.read().await.get(name).cloned()
    }

    /// Stop every routine. Queued elements are discarded; their buffers are
    /// reclaimed as the queues drop them.
    pub async fn shutdown(&self) {
        info!("shutting down outbound pipeline");
        let _ = self.stop.send(true);
        self.encryption.close();
        // displace anything still queued so no sender stays parked on a
        // completion handle whose worker already exited
        self.encryption.drain();
        for peer in self.peers.read().await.values() {
            peer.stop();
        }
    }
}

/// Run a stage routine, logging (rather than propagating) a panic.
fn spawn_routine(name: &'static str, routine: impl Future<Output = ()> + Send + 'static) {
    let task = tokio::spawn(routine);
    tokio::spawn(async move {
        if let Err(err) = task.await {
            if err.is_panic() {
                error!("{name} routine panicked: {err}");
            }
        }
    });
}
