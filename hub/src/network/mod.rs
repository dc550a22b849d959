// FLOOD HUB — NETWORK MODULE
//   afpacket.rs  — AF_PACKET raw-socket NIC layer (one socket per port)
//   virt.rs      — in-memory NIC with programmable backpressure
//   datapath.rs  — the poll loop that drives receive → flood → transmit

pub mod afpacket;
pub mod virt;
pub mod datapath;

use std::fmt;

use arrayvec::ArrayVec;

use crate::engine::mbuf::{Mbuf, PacketPool, PoolError};

/// Packets per receive call and per transmit batch.
pub const BURST_SIZE: usize = 32;

/// Upper bound on ports one hub instance drives.
pub const MAX_PORTS: usize = 16;

pub type PortId = u16;

/// One receive or transmit batch. Lives inline, never reallocates.
pub type Burst = ArrayVec<Mbuf, BURST_SIZE>;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Parse "aa:bb:cc:dd:ee:ff" (sysfs `address` format).
    pub fn parse(s: &str) -> Option<Self> {
        let mut out = [0u8; 6];
        let mut parts = s.trim().split(':');
        for b in out.iter_mut() {
            *b = u8::from_str_radix(parts.next()?, 16).ok()?;
        }
        if parts.next().is_some() { return None; }
        Some(MacAddr(out))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", m[0], m[1], m[2], m[3], m[4], m[5])
    }
}

// ============================================================================
// NIC LAYER
// ============================================================================

/// Frames the NIC layer discarded on its own, per port.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkErrors {
    /// Received frames longer than a pool frame; dropped rather than cut.
    pub rx_oversize: u64,
    /// Frames the device refused for a reason other than a full queue.
    pub tx_errors: u64,
}

/// The driver boundary the datapath polls. All calls are non-blocking and
/// bounded: they do whatever work is immediately possible and return.
///
/// Ownership: `rx_burst` hands each received frame over as an `Mbuf` holding
/// one reference. `tx_burst` removes the consumed prefix of `pkts` and owns
/// the release of those references; a consumed packet was either sent or
/// discarded for a per-frame error (counted in `link_errors`). Whatever is
/// left in `pkts` afterwards hit a full queue and still belongs to the caller.
pub trait Nic {
    fn port_count(&self) -> u16;

    /// Append up to `out.remaining_capacity()` frames. Frames already pushed
    /// stay valid when the pool runs dry mid-burst.
    fn rx_burst(&mut self, port: PortId, pool: &mut PacketPool, out: &mut Burst) -> Result<usize, PoolError>;

    /// Returns the number of packets consumed.
    fn tx_burst(&mut self, port: PortId, pkts: &mut Burst, pool: &mut PacketPool) -> usize;

    /// NUMA node the port's device sits on, when known.
    fn affinity_hint(&self, port: PortId) -> Option<u32>;

    fn mac_addr(&self, port: PortId) -> MacAddr;

    fn port_name(&self, port: PortId) -> String { format!("port{}", port) }

    fn link_errors(&self, _port: PortId) -> LinkErrors { LinkErrors::default() }

    /// Hand back any pool frames the NIC layer keeps between calls.
    fn return_buffers(&mut self, _pool: &mut PacketPool) {}
}
