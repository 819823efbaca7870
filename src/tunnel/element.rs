use std::ops::{Deref, DerefMut, Range};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::queue::Displaced;
use super::session::SessionKey;
use super::{
    AEAD_TAG_SIZE, MAX_CONTENT_SIZE, MAX_MESSAGE_SIZE, MESSAGE_TRANSPORT_HEADER_SIZE,
    MESSAGE_TRANSPORT_TYPE, PADDING_MULTIPLE,
};

/// A pool of fixed-size message buffers. Checked-out buffers find their way
/// back on drop, whichever pipeline stage lets go of them last.
pub struct BufferPool {
    free: Mutex<Vec<Box<[u8; MAX_MESSAGE_SIZE]>>>,
    max_idle: usize,
}

impl BufferPool {
    pub fn new(max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            max_idle,
        })
    }

    pub fn checkout(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Box::new([0u8; MAX_MESSAGE_SIZE]));
        PooledBuffer {
            pool: self.clone(),
            buf: Some(buf),
        }
    }

    fn put(&self, buf: Box<[u8; MAX_MESSAGE_SIZE]>) {
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }

    /// Number of buffers currently resting in the pool.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

/// A message buffer on loan from a [`BufferPool`].
pub struct PooledBuffer {
    pool: Arc<BufferPool>,
    buf: Option<Box<[u8; MAX_MESSAGE_SIZE]>>,
}

impl Deref for PooledBuffer {
    type Target = [u8; MAX_MESSAGE_SIZE];
    fn deref(&self) -> &Self::Target {
        self.buf.as_ref().expect("pooled buffer already returned")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_mut().expect("pooled buffer already returned")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

/// A single packet's state as it moves through the outbound pipeline.
///
/// The buffer always reserves a header-sized prefix so the transport message
/// can be assembled in place; `packet` is the live view into it, the
/// plaintext payload before sealing and the full datagram after.
pub struct OutboundElement {
    pub(crate) buffer: PooledBuffer,
    pub(crate) packet: Range<usize>,
    pub(crate) nonce: u64,
    pub(crate) session: Option<Arc<SessionKey>>,
}

impl OutboundElement {
    pub(crate) fn new(buffer: PooledBuffer) -> Self {
        Self {
            buffer,
            packet: MESSAGE_TRANSPORT_HEADER_SIZE..MESSAGE_TRANSPORT_HEADER_SIZE,
            nonce: 0,
            session: None,
        }
    }

    /// The writable region the TUN reader fills, past the reserved header.
    pub(crate) fn read_buf(&mut self) -> &mut [u8] {
        &mut self.buffer[MESSAGE_TRANSPORT_HEADER_SIZE..]
    }

    pub(crate) fn set_payload_len(&mut self, len: usize) {
        self.packet = MESSAGE_TRANSPORT_HEADER_SIZE..MESSAGE_TRANSPORT_HEADER_SIZE + len;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[self.packet.clone()]
    }

    /// Assemble the transport message in place: write the header, zero-pad
    /// the plaintext to the padding granule (never past what `mtu` leaves
    /// for plaintext), seal, and append the tag. Afterwards `as_bytes` is
    /// the wire datagram.
    pub(crate) fn seal(&mut self, mtu: usize) -> Result<()> {
        let session = match &self.session {
            Some(session) => session.clone(),
            None => return Err(anyhow!("sealing an element with no session key")),
        };

        let header = &mut self.buffer[..MESSAGE_TRANSPORT_HEADER_SIZE];
        header[0..4].copy_from_slice(&MESSAGE_TRANSPORT_TYPE.to_le_bytes());
        header[4..8].copy_from_slice(&session.remote_index().to_le_bytes());
        header[8..16].copy_from_slice(&self.nonce.to_le_bytes());

        let len = self.packet.len();
        let padded = padded_len(len, mtu);
        let body = MESSAGE_TRANSPORT_HEADER_SIZE;
        self.buffer[body + len..body + padded].fill(0);

        let tag = session
            .seal(self.nonce, &mut self.buffer[body..body + padded])
            .map_err(|_| anyhow!("aead sealing failed"))?;
        self.buffer[body + padded..body + padded + AEAD_TAG_SIZE].copy_from_slice(tag.as_slice());

        self.packet = 0..body + padded + AEAD_TAG_SIZE;
        Ok(())
    }
}

/// Plaintext length after padding: the next multiple of the padding granule,
/// capped at what the interface MTU leaves for plaintext once the header and
/// tag are accounted for (and at the buffer's own content capacity), never
/// below the original length.
pub(crate) fn padded_len(len: usize, mtu: usize) -> usize {
    let cap = mtu
        .saturating_sub(MESSAGE_TRANSPORT_HEADER_SIZE + AEAD_TAG_SIZE)
        .min(MAX_CONTENT_SIZE);
    let rem = len % PADDING_MULTIPLE;
    if rem == 0 {
        return len;
    }
    (len + PADDING_MULTIPLE - rem).min(cap.max(len))
}

/// The encryption-queue half of a published element: the element itself plus
/// the completion handle the worker resolves.
pub(crate) struct EncryptJob {
    pub elem: OutboundElement,
    pub dropped: Arc<AtomicBool>,
    pub done: oneshot::Sender<OutboundElement>,
}

/// The outbound-queue half: what the sequential sender awaits.
pub(crate) struct OutboundHandle {
    pub dropped: Arc<AtomicBool>,
    pub done: oneshot::Receiver<OutboundElement>,
}

/// Split a nonce-assigned element into its two queue-resident halves.
pub(crate) fn into_queued_pair(elem: OutboundElement) -> (EncryptJob, OutboundHandle) {
    let dropped = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = oneshot::channel();
    (
        EncryptJob {
            elem,
            dropped: dropped.clone(),
            done: done_tx,
        },
        OutboundHandle {
            dropped,
            done: done_rx,
        },
    )
}

impl Displaced for OutboundElement {
    fn displaced(self) {
        // the buffer returns to the pool as the element drops
    }
}

impl Displaced for EncryptJob {
    fn displaced(self) {
        self.dropped.store(true, Ordering::Release);
        // dropping `done` resolves the handle the sequential sender waits on
    }
}

impl Displaced for OutboundHandle {
    fn displaced(self) {
        self.dropped.store(true, Ordering::Release);
    }
}
