// FLOOD HUB — ENGINE: FLOOD FORWARDER
// Replicates one received frame onto every port except its ingress port by
// reference count, never by copying bytes.

use crate::engine::mbuf::{Mbuf, PacketPool};
use crate::engine::scheduler::TxScheduler;
use crate::network::{Nic, PortId};

/// Flood `m` (received on `rx_port`) to ports `0..nb_ports` minus `rx_port`.
///
/// The full fan-out is retained before the first enqueue, so a flush
/// triggered part-way through can never take the count to zero early. The
/// receive-time reference is released last. Returns the fan-out; 0 means the
/// frame was dropped.
#[inline(always)]
pub fn flood_forward<N: Nic>(
    m: Mbuf,
    rx_port: PortId,
    nb_ports: u16,
    sched: &mut TxScheduler,
    nic: &mut N,
    pool: &mut PacketPool,
) -> u16 {
    debug_assert!(rx_port < nb_ports, "ingress port {} out of range ({} ports)", rx_port, nb_ports);
    let fanout = nb_ports.saturating_sub(1);
    let mut shares = pool.retain(&m, fanout);

    for port in 0..nb_ports {
        if port == rx_port { continue; }
        match shares.next() {
            Some(share) => sched.append(port, share, nic, pool),
            None => break,
        }
    }
    debug_assert_eq!(shares.len(), 0, "unconsumed fan-out references");

    pool.release(m);
    fanout
}
