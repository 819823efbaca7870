use std::sync::atomic::Ordering;
use std::sync::Arc;

use etherparse::{Ipv4HeaderSlice, Ipv6HeaderSlice};
use log::{debug, error, warn};
use tokio::sync::watch;

use super::device::Device;
use super::element::{into_queued_pair, EncryptJob};
use super::{
    Peer, MAX_CONTENT_SIZE, MESSAGE_KEEPALIVE_SIZE, SEND_FAILURE_BACKOFF, STATUS_TUN_READ_FAILED,
};

/* Handles the outbound flow
 *
 * 1. TUN read + routing        (one routine per device)
 * 2. Nonce assignment          (one routine per peer)
 * 3. Encryption                (one routine per core)
 * 4. Transmission              (one routine per peer)
 *
 * Per-peer packet order is maintained: the sequential sender consumes in the
 * order the nonce assigner published, and waits on each element's completion
 * handle until its encryption worker is done with it.
 */

/// Read IP datagrams from the TUN, resolve the destination peer, and feed
/// the peer's nonce queue.
pub(crate) async fn run_tun_reader(device: Arc<Device>, mut stop: watch::Receiver<bool>) {
    let mut elem = device.new_element();
    debug!("tun reader started on {}", device.tun.name());
    loop {
        let read = tokio::select! {
            _ = stop.changed() => {
                debug!("tun reader stopped");
                return;
            }
            read = device.tun.recv(elem.read_buf()) => read,
        };
        let len = match read {
            Ok(len) => len,
            Err(err) => {
                error!("failed to read from tun device: {err}");
                device.send_status(STATUS_TUN_READ_FAILED);
                return;
            }
        };
        if len == 0 || len > MAX_CONTENT_SIZE {
            continue;
        }
        elem.set_payload_len(len);

        let peer = {
            let packet = elem.as_bytes();
            let routing = device.routing.read().await;
            match packet[0] >> 4 {
                4 => Ipv4HeaderSlice::from_slice(packet)
                    .ok()
                    .and_then(|header| routing.lookup_v4(header.destination())),
                6 => Ipv6HeaderSlice::from_slice(packet)
                    .ok()
                    .and_then(|header| routing.lookup_v6(header.destination())),
                version => {
                    debug!("discarding {len}-byte packet with unknown ip version {version}");
                    None
                }
            }
        };
        let Some(peer) = peer else { continue };

        peer.signals.handshake_reset.notify_one();
        peer.queue.nonce.push(elem);
        elem = device.new_element();
    }
}

/// Per-peer: wait for a usable session key, stamp each queued packet with
/// the key's next nonce, and publish it to the encryption and outbound
/// queues in that order.
pub(crate) async fn run_nonce_assigner(
    device: Arc<Device>,
    peer: Arc<Peer>,
    mut stop: watch::Receiver<bool>,
) {
    debug!("nonce assigner started for peer {}", peer.name);
    'next: loop {
        let elem = tokio::select! {
            _ = stop.changed() => break,
            elem = peer.queue.nonce.pop() => elem,
        };
        let Some(mut elem) = elem else { break };

        let session = loop {
            if let Some(key) = peer.sessions.read().await.current() {
                if key.usable_for_send() {
                    break key;
                }
            }
            peer.signals.handshake_begin.notify_one();
            debug!("awaiting session key for peer {}", peer.name);
            tokio::select! {
                _ = peer.signals.new_session.notified() => {}
                _ = peer.signals.flush_queued.notified() => {
                    let flushed = peer.queue.nonce.drain();
                    debug!("flushed {flushed} queued packets for peer {}", peer.name);
                    // the in-flight element drops here too, returning its buffer
                    continue 'next;
                }
                _ = stop.changed() => break 'next,
            }
        };

        elem.nonce = session.next_send_nonce();
        elem.session = Some(session);

        // The encryption queue must learn about the element before the
        // sequential sender can start waiting on it.
        let (job, handle) = into_queued_pair(elem);
        device.encryption.push(job);
        peer.queue.outbound.push(handle);
    }
    debug!("nonce assigner stopped for peer {}", peer.name);
}

/// Shared worker: seal elements from the device-wide encryption queue and
/// resolve each element's completion handle.
pub(crate) async fn run_encryption_worker(
    device: Arc<Device>,
    id: usize,
    mut stop: watch::Receiver<bool>,
) {
    debug!("encryption worker {id} started");
    loop {
        let job = tokio::select! {
            _ = stop.changed() => break,
            job = device.encryption.pop() => job,
        };
        let Some(job) = job else { break };

        if job.dropped.load(Ordering::Acquire) {
            // dropping the job resolves the handle the sender waits on
            continue;
        }
        let EncryptJob { mut elem, done, .. } = job;
        match elem.seal(device.mtu()) {
            Ok(()) => {
                let _ = done.send(elem);
            }
            Err(err) => warn!("encryption worker {id}: {err}"),
        }
    }
    debug!("encryption worker {id} stopped");
}

/// Per-peer: transmit sealed elements in publish order, updating the peer's
/// timers after every successful write.
pub(crate) async fn run_sequential_sender(
    device: Arc<Device>,
    peer: Arc<Peer>,
    mut stop: watch::Receiver<bool>,
) {
    debug!("sequential sender started for peer {}", peer.name);
    loop {
        let handle = tokio::select! {
            _ = stop.changed() => break,
            handle = peer.queue.outbound.pop() => handle,
        };
        let Some(handle) = handle else { break };

        // blocks until the encryption worker has sealed the element or a
        // drop path has let go of it
        let elem = match handle.done.await {
            Ok(elem) => elem,
            Err(_) => continue,
        };
        if handle.dropped.load(Ordering::Acquire) {
            continue;
        }

        let packet = elem.as_bytes();
        match peer.send_buffer(packet).await {
            Ok(sent) => {
                peer.stats.record_send(sent);
                peer.timers.any_authenticated_packet_traversal();
                if packet.len() != MESSAGE_KEEPALIVE_SIZE {
                    peer.timers.data_sent();
                }
                peer.keep_key_fresh_sending().await;
            }
            Err(err) => {
                warn!("failed to send packet to peer {}: {err}", peer.name);
                tokio::time::sleep(SEND_FAILURE_BACKOFF).await;
                device.signals.network_change.notify_one();
            }
        }
        // the element drops here either way, returning its buffer
    }
    debug!("sequential sender stopped for peer {}", peer.name);
}
