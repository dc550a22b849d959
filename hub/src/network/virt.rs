// FLOOD HUB — NETWORK: VIRTUAL NIC
// In-memory NIC layer. Frames are injected per port, transmitted frames are
// copied into a log, and each port can be given a per-call transmit budget to
// emulate a full hardware ring.

use std::collections::VecDeque;

use crate::engine::mbuf::{PacketPool, PoolError};
use crate::network::{Burst, MacAddr, Nic, PortId};

/// One frame accepted by `tx_burst`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRecord {
    pub port: PortId,
    pub frame_idx: u32,
    pub bytes: Vec<u8>,
}

/// One `tx_burst` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstRecord {
    pub port: PortId,
    pub offered: usize,
    pub sent: usize,
}

struct VirtPort {
    mac: MacAddr,
    node: Option<u32>,
    rx: VecDeque<Vec<u8>>,
    tx_budget: Option<usize>,
}

pub struct VirtualNic {
    ports: Vec<VirtPort>,
    transmitted: Vec<TxRecord>,
    bursts: Vec<BurstRecord>,
}

impl VirtualNic {
    /// Ports get locally administered MACs 02:00:00:00:00:<id>.
    pub fn new(ports: u16) -> Self {
        VirtualNic {
            ports: (0..ports).map(|p| VirtPort {
                mac: MacAddr([0x02, 0, 0, 0, (p >> 8) as u8, p as u8]),
                node: None,
                rx: VecDeque::new(),
                tx_budget: None,
            }).collect(),
            transmitted: Vec::new(),
            bursts: Vec::new(),
        }
    }

    pub fn with_numa_node(mut self, port: PortId, node: u32) -> Self {
        self.ports[port as usize].node = Some(node);
        self
    }

    /// Queue a frame to be returned by the next `rx_burst` on `port`.
    pub fn inject(&mut self, port: PortId, frame: &[u8]) {
        self.ports[port as usize].rx.push_back(frame.to_vec());
    }

    pub fn pending_rx(&self, port: PortId) -> usize { self.ports[port as usize].rx.len() }

    /// Accept at most `budget` packets per `tx_burst` call; `None` accepts all.
    pub fn set_tx_budget(&mut self, port: PortId, budget: Option<usize>) {
        self.ports[port as usize].tx_budget = budget;
    }

    pub fn transmitted(&self) -> &[TxRecord] { &self.transmitted }

    pub fn transmitted_on(&self, port: PortId) -> impl Iterator<Item = &TxRecord> + '_ {
        self.transmitted.iter().filter(move |r| r.port == port)
    }

    pub fn bursts(&self) -> &[BurstRecord] { &self.bursts }
}

impl Nic for VirtualNic {
    fn port_count(&self) -> u16 { self.ports.len() as u16 }

    fn rx_burst(&mut self, port: PortId, pool: &mut PacketPool, out: &mut Burst) -> Result<usize, PoolError> {
        let vp = &mut self.ports[port as usize];
        let mut n = 0;
        while !out.is_full() {
            let Some(frame) = vp.rx.front() else { break };
            // Leave the frame queued if the pool is dry.
            let m = pool.alloc_from(frame)?;
            vp.rx.pop_front();
            out.push(m);
            n += 1;
        }
        Ok(n)
    }

    fn tx_burst(&mut self, port: PortId, pkts: &mut Burst, pool: &mut PacketPool) -> usize {
        let offered = pkts.len();
        let sent = self.ports[port as usize].tx_budget.map_or(offered, |b| b.min(offered));
        for m in pkts.drain(..sent) {
            self.transmitted.push(TxRecord { port, frame_idx: m.frame_idx(), bytes: pool.data(&m).to_vec() });
            pool.release(m);
        }
        self.bursts.push(BurstRecord { port, offered, sent });
        sent
    }

    fn affinity_hint(&self, port: PortId) -> Option<u32> { self.ports[port as usize].node }

    fn mac_addr(&self, port: PortId) -> MacAddr { self.ports[port as usize].mac }

    fn port_name(&self, port: PortId) -> String { format!("virt{}", port) }
}
