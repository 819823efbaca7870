use anyhow::Result;
use async_trait::async_trait;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::LinuxTun;

/// A virtual L3 interface delivering IP datagrams to user space.
///
/// `recv` fills a caller-supplied buffer so the reader can target a pooled
/// message region directly.
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Interface name.
    fn name(&self) -> &str;

    /// Current interface MTU.
    fn mtu(&self) -> usize;

    /// Read one IP datagram into `buf`, returning its length.
    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;
}
