use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, Tag};

use super::{REJECT_AFTER_MESSAGES, REJECT_AFTER_TIME};

/// A directional session key handed to the pipeline by the handshake
/// subsystem. Stage 2 draws nonces from it, stage 3 seals under it.
pub struct SessionKey {
    send: ChaCha20Poly1305,
    send_nonce: AtomicU64,
    remote_index: u32,
    created: Instant,
}

impl SessionKey {
    pub fn new(send_key: &[u8; 32], remote_index: u32) -> Self {
        Self {
            send: ChaCha20Poly1305::new(Key::from_slice(send_key)),
            send_nonce: AtomicU64::new(0),
            remote_index,
            created: Instant::now(),
        }
    }

    /// The receiver-side index echoed in every transport header.
    pub fn remote_index(&self) -> u32 {
        self.remote_index
    }

    pub fn sent_messages(&self) -> u64 {
        self.send_nonce.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// A key may seal new packets only while its nonce budget and lifetime
    /// both hold out.
    pub fn usable_for_send(&self) -> bool {
        self.sent_messages() < REJECT_AFTER_MESSAGES && self.age() < REJECT_AFTER_TIME
    }

    pub(crate) fn next_send_nonce(&self) -> u64 {
        self.send_nonce.fetch_add(1, Ordering::Relaxed)
    }

    /// Seal `buf` in place, returning the detached tag. The AEAD nonce is
    /// the counter in little-endian behind a zero four-byte prefix.
    pub(crate) fn seal(
        &self,
        counter: u64,
        buf: &mut [u8],
    ) -> Result<Tag, chacha20poly1305::aead::Error> {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&counter.to_le_bytes());
        self.send
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), &[], buf)
    }

    #[cfg(test)]
    pub(crate) fn aged(send_key: &[u8; 32], remote_index: u32, age: Duration) -> Self {
        let mut key = Self::new(send_key, remote_index);
        key.created = Instant::now()
            .checked_sub(age)
            .expect("test age predates the clock epoch");
        key
    }

    #[cfg(test)]
    pub(crate) fn set_sent_messages(&self, count: u64) {
        self.send_nonce.store(count, Ordering::Relaxed);
    }
}

/// The session keys currently installed for a peer. The pipeline only ever
/// reads the current one; installation comes from outside.
#[derive(Default)]
pub struct SessionState {
    current: Option<Arc<SessionKey>>,
}

impl SessionState {
    pub fn current(&self) -> Option<Arc<SessionKey>> {
        self.current.clone()
    }

    pub(crate) fn install(&mut self, key: Arc<SessionKey>) {
        self.current = Some(key);
    }
}
