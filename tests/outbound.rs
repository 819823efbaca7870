//! End-to-end tests for the outbound pipeline: a channel-backed TUN feeds
//! the device, a loopback UDP socket plays the peer's endpoint, and the
//! receiving side authenticates every datagram with the session key.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, Tag};
use ipnetwork::IpNetwork;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use burrow::tun::TunDevice;
use burrow::tunnel::{
    Device, DeviceOptions, Peer, SessionKey, MESSAGE_KEEPALIVE_SIZE, MESSAGE_TRANSPORT_TYPE,
    STATUS_TUN_READ_FAILED,
};

const TEST_KEY: [u8; 32] = [0x42; 32];
const KEY_INDEX: u32 = 7;
const MTU: usize = 1400;

struct MockTun {
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    mtu: usize,
}

#[async_trait]
impl TunDevice for MockTun {
    fn name(&self) -> &str {
        "tun-test"
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn recv(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let packet = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| anyhow!("tun closed"))?;
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }
}

struct Harness {
    device: Arc<Device>,
    peer: Arc<Peer>,
    tun_tx: mpsc::Sender<Vec<u8>>,
    rx_sock: Arc<UdpSocket>,
    status: mpsc::UnboundedReceiver<i32>,
}

async fn start_pipeline(options: DeviceOptions) -> Harness {
    let (tun_tx, tun_rx) = mpsc::channel(4096);
    let tun = Arc::new(MockTun {
        rx: Mutex::new(tun_rx),
        mtu: MTU,
    });
    let (device, status) = Device::new(tun, options);

    device
        .set_socket(UdpSocket::bind("127.0.0.1:0").await.unwrap())
        .await;
    let rx_sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let rx_addr = rx_sock.local_addr().unwrap();

    let allowed = [
        IpNetwork::from_str("10.0.0.0/24").unwrap(),
        IpNetwork::from_str("fd00::/64").unwrap(),
    ];
    let peer = device
        .add_peer("peer-a", Some(rx_addr), &allowed, None)
        .await
        .unwrap();
    device.start();

    Harness {
        device,
        peer,
        tun_tx,
        rx_sock,
        status,
    }
}

fn ipv4_packet(dst: [u8; 4], len: usize, marker: u8) -> Vec<u8> {
    assert!(len >= 20);
    let mut packet = vec![0u8; len];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(len as u16).to_be_bytes());
    packet[8] = 64; // ttl
    packet[9] = 17; // udp
    packet[12..16].copy_from_slice(&[10, 0, 0, 1]);
    packet[16..20].copy_from_slice(&dst);
    for (i, byte) in packet[20..].iter_mut().enumerate() {
        *byte = marker.wrapping_add(i as u8);
    }
    packet
}

fn ipv6_packet(dst: [u8; 16], payload_len: usize) -> Vec<u8> {
    let mut packet = vec![0u8; 40 + payload_len];
    packet[0] = 0x60;
    packet[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
    packet[6] = 17; // udp
    packet[7] = 64; // hop limit
    packet[8] = 0xfd; // src fd00::
    packet[24..40].copy_from_slice(&dst);
    packet
}

async fn collect_datagrams(sock: Arc<UdpSocket>, count: usize) -> Vec<Vec<u8>> {
    let mut out = Vec::with_capacity(count);
    let mut buf = vec![0u8; 4096];
    while out.len() < count {
        let (len, _) = timeout(Duration::from_secs(5), sock.recv_from(&mut buf))
            .await
            .expect("timed out waiting for datagrams")
            .expect("udp recv failed");
        out.push(buf[..len].to_vec());
    }
    out
}

async fn assert_quiet(sock: &UdpSocket, wait: Duration) {
    let mut buf = [0u8; 4096];
    assert!(
        timeout(wait, sock.recv_from(&mut buf)).await.is_err(),
        "unexpected datagram on the wire"
    );
}

/// Check the transport header, authenticate, and return (counter, plaintext).
fn open_datagram(datagram: &[u8], key: &[u8; 32], expect_index: u32) -> (u64, Vec<u8>) {
    assert!(datagram.len() >= 32, "datagram shorter than header + tag");
    assert_eq!(
        u32::from_le_bytes(datagram[0..4].try_into().unwrap()),
        MESSAGE_TRANSPORT_TYPE
    );
    assert_eq!(
        u32::from_le_bytes(datagram[4..8].try_into().unwrap()),
        expect_index
    );
    let counter = u64::from_le_bytes(datagram[8..16].try_into().unwrap());

    let mut body = datagram[16..datagram.len() - 16].to_vec();
    let tag = &datagram[datagram.len() - 16..];
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    ChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt_in_place_detached(Nonce::from_slice(&nonce), &[], &mut body, Tag::from_slice(tag))
        .expect("datagram failed authentication");
    (counter, body)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_transmits_in_order() {
    let h = start_pipeline(DeviceOptions::default()).await;
    h.peer
        .install_session(SessionKey::new(&TEST_KEY, KEY_INDEX))
        .await;

    let collector = tokio::spawn(collect_datagrams(h.rx_sock.clone(), 1000));
    for i in 0..1000u16 {
        let mut packet = ipv4_packet([10, 0, 0, 2], 200, i as u8);
        packet[4..6].copy_from_slice(&i.to_be_bytes()); // identification
        h.tun_tx.send(packet).await.unwrap();
    }
    let datagrams = timeout(Duration::from_secs(10), collector)
        .await
        .unwrap()
        .unwrap();

    for (i, datagram) in datagrams.iter().enumerate() {
        // 16 header + 208 padded + 16 tag
        assert_eq!(datagram.len(), 240);
        let (counter, plaintext) = open_datagram(datagram, &TEST_KEY, KEY_INDEX);
        assert_eq!(counter, i as u64);
        assert_eq!(plaintext.len(), 208);
        assert_eq!(
            u16::from_be_bytes(plaintext[4..6].try_into().unwrap()),
            i as u16
        );
        assert!(plaintext[200..].iter().all(|&b| b == 0), "non-zero padding");
    }

    h.device.shutdown().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.device.idle_buffers() > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn parallel_encryption_preserves_order() {
    let options = DeviceOptions {
        encryption_workers: 8,
        ..Default::default()
    };
    let h = start_pipeline(options).await;
    h.peer
        .install_session(SessionKey::new(&TEST_KEY, KEY_INDEX))
        .await;

    let collector = tokio::spawn(collect_datagrams(h.rx_sock.clone(), 2000));
    for i in 0..2000usize {
        // vary sizes so workers finish out of order
        let len = 20 + (i * 37) % 1200;
        h.tun_tx
            .send(ipv4_packet([10, 0, 0, 2], len, i as u8))
            .await
            .unwrap();
    }
    let datagrams = timeout(Duration::from_secs(15), collector)
        .await
        .unwrap()
        .unwrap();

    for (i, datagram) in datagrams.iter().enumerate() {
        let counter = u64::from_le_bytes(datagram[8..16].try_into().unwrap());
        assert_eq!(counter, i as u64, "datagram {i} out of order");
    }
    h.device.shutdown().await;
}

#[tokio::test]
async fn backpressure_drops_oldest_while_stalled() {
    let options = DeviceOptions {
        nonce_queue_capacity: 4,
        ..Default::default()
    };
    let h = start_pipeline(options).await;

    // no session key yet: the nonce assigner holds the first packet and
    // stalls, so the rest pile into the capacity-4 queue
    for i in 0..20u8 {
        h.tun_tx
            .send(ipv4_packet([10, 0, 0, 2], 64, i))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_quiet(&h.rx_sock, Duration::from_millis(200)).await;

    h.peer
        .install_session(SessionKey::new(&TEST_KEY, KEY_INDEX))
        .await;
    let datagrams = collect_datagrams(h.rx_sock.clone(), 5).await;
    let mut markers = Vec::new();
    for (i, datagram) in datagrams.iter().enumerate() {
        let (counter, plaintext) = open_datagram(datagram, &TEST_KEY, KEY_INDEX);
        assert_eq!(counter, i as u64);
        markers.push(plaintext[20]); // first payload byte is the marker
    }
    // the held packet plus the newest four; everything between was displaced
    assert_eq!(markers, vec![0, 16, 17, 18, 19]);
    assert_quiet(&h.rx_sock, Duration::from_millis(300)).await;

    h.device.shutdown().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    // every displaced or transmitted buffer found its way back
    assert!(h.device.idle_buffers() > 0);
}

#[tokio::test]
async fn stalled_pipeline_requests_handshake_then_drains() {
    let h = start_pipeline(DeviceOptions::default()).await;

    for i in 0..5u8 {
        h.tun_tx
            .send(ipv4_packet([10, 0, 0, 2], 100, i))
            .await
            .unwrap();
    }
    timeout(
        Duration::from_secs(1),
        h.peer.signals.handshake_begin.notified(),
    )
    .await
    .expect("no handshake requested");
    assert_quiet(&h.rx_sock, Duration::from_millis(300)).await;

    h.peer
        .install_session(SessionKey::new(&TEST_KEY, KEY_INDEX))
        .await;
    let datagrams = collect_datagrams(h.rx_sock.clone(), 5).await;
    for (i, datagram) in datagrams.iter().enumerate() {
        let (counter, _) = open_datagram(datagram, &TEST_KEY, KEY_INDEX);
        assert_eq!(counter, i as u64);
    }
    h.device.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn key_rotation_restarts_nonces() {
    let h = start_pipeline(DeviceOptions::default()).await;
    h.peer
        .install_session(SessionKey::new(&TEST_KEY, KEY_INDEX))
        .await;

    let collector = tokio::spawn(collect_datagrams(h.rx_sock.clone(), 100));
    for i in 0..100u8 {
        h.tun_tx
            .send(ipv4_packet([10, 0, 0, 2], 80, i))
            .await
            .unwrap();
    }
    let first = timeout(Duration::from_secs(5), collector)
        .await
        .unwrap()
        .unwrap();
    for (i, datagram) in first.iter().enumerate() {
        let (counter, _) = open_datagram(datagram, &TEST_KEY, KEY_INDEX);
        assert_eq!(counter, i as u64);
    }

    let second_key = [0x99u8; 32];
    h.peer.install_session(SessionKey::new(&second_key, 9)).await;

    let collector = tokio::spawn(collect_datagrams(h.rx_sock.clone(), 50));
    for i in 0..50u8 {
        h.tun_tx
            .send(ipv4_packet([10, 0, 0, 2], 80, i))
            .await
            .unwrap();
    }
    let second = timeout(Duration::from_secs(5), collector)
        .await
        .unwrap()
        .unwrap();
    for (i, datagram) in second.iter().enumerate() {
        let (counter, _) = open_datagram(datagram, &second_key, 9);
        assert_eq!(counter, i as u64);
    }
    h.device.shutdown().await;
}

#[tokio::test]
async fn keepalive_and_data_update_their_timers() {
    let h = start_pipeline(DeviceOptions::default()).await;
    h.peer
        .install_session(SessionKey::new(&TEST_KEY, KEY_INDEX))
        .await;

    assert!(h.peer.send_keepalive().await);
    let keepalive = collect_datagrams(h.rx_sock.clone(), 1).await.remove(0);
    assert_eq!(keepalive.len(), MESSAGE_KEEPALIVE_SIZE);
    let (counter, plaintext) = open_datagram(&keepalive, &TEST_KEY, KEY_INDEX);
    assert_eq!(counter, 0);
    assert!(plaintext.is_empty());

    h.tun_tx
        .send(ipv4_packet([10, 0, 0, 2], 100, 1))
        .await
        .unwrap();
    let data = collect_datagrams(h.rx_sock.clone(), 1).await.remove(0);
    assert!(data.len() > MESSAGE_KEEPALIVE_SIZE);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.peer.timers.traversal_count(), 2);
    assert_eq!(h.peer.timers.data_sent_count(), 1);
    h.device.shutdown().await;
}

#[tokio::test]
async fn ipv6_destinations_route_to_their_peer() {
    let h = start_pipeline(DeviceOptions::default()).await;
    h.peer
        .install_session(SessionKey::new(&TEST_KEY, KEY_INDEX))
        .await;

    let mut dst = [0u8; 16];
    dst[0] = 0xfd;
    dst[15] = 2;
    let packet = ipv6_packet(dst, 30);
    h.tun_tx.send(packet.clone()).await.unwrap();

    let datagram = collect_datagrams(h.rx_sock.clone(), 1).await.remove(0);
    let (counter, plaintext) = open_datagram(&datagram, &TEST_KEY, KEY_INDEX);
    assert_eq!(counter, 0);
    // 70 plaintext bytes padded to 80
    assert_eq!(plaintext.len(), 80);
    assert_eq!(&plaintext[..packet.len()], packet.as_slice());
    h.device.shutdown().await;
}

#[tokio::test]
async fn unroutable_and_malformed_packets_are_discarded() {
    let h = start_pipeline(DeviceOptions::default()).await;
    h.peer
        .install_session(SessionKey::new(&TEST_KEY, KEY_INDEX))
        .await;

    h.tun_tx
        .send(ipv4_packet([192, 168, 1, 1], 60, 0)) // no route
        .await
        .unwrap();
    h.tun_tx.send(vec![0xF0; 40]).await.unwrap(); // unknown version
    h.tun_tx.send(vec![0x45; 8]).await.unwrap(); // truncated header
    assert_quiet(&h.rx_sock, Duration::from_millis(300)).await;

    // the reader is still healthy afterwards
    h.tun_tx
        .send(ipv4_packet([10, 0, 0, 2], 60, 7))
        .await
        .unwrap();
    let datagram = collect_datagrams(h.rx_sock.clone(), 1).await.remove(0);
    open_datagram(&datagram, &TEST_KEY, KEY_INDEX);
    h.device.shutdown().await;
}

#[tokio::test]
async fn flush_discards_packets_waiting_for_a_key() {
    let h = start_pipeline(DeviceOptions::default()).await;

    for i in 0..3u8 {
        h.tun_tx
            .send(ipv4_packet([10, 0, 0, 2], 60, i))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.peer.signals.flush_queued.notify_one();
    tokio::time::sleep(Duration::from_millis(200)).await;

    h.peer
        .install_session(SessionKey::new(&TEST_KEY, KEY_INDEX))
        .await;
    for i in 10..12u8 {
        h.tun_tx
            .send(ipv4_packet([10, 0, 0, 2], 60, i))
            .await
            .unwrap();
    }
    let datagrams = collect_datagrams(h.rx_sock.clone(), 2).await;
    let mut markers = Vec::new();
    for (i, datagram) in datagrams.iter().enumerate() {
        let (counter, plaintext) = open_datagram(datagram, &TEST_KEY, KEY_INDEX);
        assert_eq!(counter, i as u64);
        markers.push(plaintext[20]);
    }
    // the flushed packets (and the one held in stage 2) never hit the wire
    assert_eq!(markers, vec![10, 11]);
    assert_quiet(&h.rx_sock, Duration::from_millis(300)).await;
    h.device.shutdown().await;
}

#[tokio::test]
async fn removing_a_peer_stops_forwarding() {
    let h = start_pipeline(DeviceOptions::default()).await;
    h.peer
        .install_session(SessionKey::new(&TEST_KEY, KEY_INDEX))
        .await;

    h.tun_tx
        .send(ipv4_packet([10, 0, 0, 2], 60, 0))
        .await
        .unwrap();
    collect_datagrams(h.rx_sock.clone(), 1).await;

    assert!(h.device.remove_peer("peer-a").await);
    h.tun_tx
        .send(ipv4_packet([10, 0, 0, 2], 60, 1))
        .await
        .unwrap();
    assert_quiet(&h.rx_sock, Duration::from_millis(300)).await;
    h.device.shutdown().await;
}

#[tokio::test]
async fn idle_peer_emits_persistent_keepalives() {
    let (tun_tx, tun_rx) = mpsc::channel(64);
    let tun = Arc::new(MockTun {
        rx: Mutex::new(tun_rx),
        mtu: MTU,
    });
    let (device, _status) = Device::new(tun, DeviceOptions::default());
    device
        .set_socket(UdpSocket::bind("127.0.0.1:0").await.unwrap())
        .await;
    let rx_sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let rx_addr = rx_sock.local_addr().unwrap();

    let allowed = [IpNetwork::from_str("10.0.0.0/24").unwrap()];
    let peer = device
        .add_peer(
            "peer-a",
            Some(rx_addr),
            &allowed,
            Some(Duration::from_millis(200)),
        )
        .await
        .unwrap();
    peer.install_session(SessionKey::new(&TEST_KEY, KEY_INDEX))
        .await;
    device.start();

    let datagram = collect_datagrams(rx_sock.clone(), 1).await.remove(0);
    assert_eq!(datagram.len(), MESSAGE_KEEPALIVE_SIZE);
    let (counter, plaintext) = open_datagram(&datagram, &TEST_KEY, KEY_INDEX);
    assert_eq!(counter, 0);
    assert!(plaintext.is_empty());

    drop(tun_tx);
    device.shutdown().await;
}

#[tokio::test]
async fn fatal_tun_read_reports_status() {
    let mut h = start_pipeline(DeviceOptions::default()).await;
    drop(h.tun_tx);
    let code = timeout(Duration::from_secs(1), h.status.recv())
        .await
        .expect("no status code published");
    assert_eq!(code, Some(STATUS_TUN_READ_FAILED));
}

#[tokio::test]
async fn send_failure_raises_network_change() {
    let (tun_tx, tun_rx) = mpsc::channel(64);
    let tun = Arc::new(MockTun {
        rx: Mutex::new(tun_rx),
        mtu: MTU,
    });
    let (device, _status) = Device::new(tun, DeviceOptions::default());
    device
        .set_socket(UdpSocket::bind("127.0.0.1:0").await.unwrap())
        .await;

    // a peer with no endpoint: every transmit fails
    let allowed = [IpNetwork::from_str("10.0.0.0/24").unwrap()];
    let peer = device.add_peer("peer-a", None, &allowed, None).await.unwrap();
    peer.install_session(SessionKey::new(&TEST_KEY, KEY_INDEX))
        .await;
    device.start();

    tun_tx
        .send(ipv4_packet([10, 0, 0, 2], 60, 0))
        .await
        .unwrap();
    // the sender backs off before raising the signal
    timeout(
        Duration::from_secs(4),
        device.signals.network_change.notified(),
    )
    .await
    .expect("network change not raised");
    device.shutdown().await;
}
