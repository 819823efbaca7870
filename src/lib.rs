//! burrow - a userspace point-to-point encrypted tunnel.
//!
//! The crate centres on the outbound data plane: IP datagrams read from a
//! TUN interface are routed to a peer, stamped with monotonically increasing
//! nonces under the peer's session key, sealed in parallel on a pool of
//! workers, and transmitted in nonce order over a shared UDP socket.

pub mod config;
pub mod logger;
pub mod tun;
pub mod tunnel;
