// FLOOD HUB — NETWORK: DATAPATH
// The poll loop. One pinned context, no locks, no yielding:
//   for each port: rx burst → flood every frame
//   after the pass: one drain sweep
// The only per-iteration clock read feeds the drain timer.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::engine::forward::flood_forward;
use crate::engine::mbuf::{PacketPool, PoolCounters, PoolError};
use crate::engine::runtime::Clock;
use crate::engine::scheduler::TxScheduler;
use crate::network::{Burst, Nic, PortId, MAX_PORTS};

/// Counters for one port, merged from the receive and transmit sides.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PortStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub tx_dropped: u64,
    pub full_flushes: u64,
    pub drain_flushes: u64,
    /// Received frames too long for a pool frame.
    pub rx_oversize: u64,
    /// Frames the device refused one by one (not backpressure).
    pub tx_errors: u64,
}

pub struct PollLoop<N: Nic> {
    nic: N,
    pool: PacketPool,
    sched: TxScheduler,
    rx_buf: Burst,
    rx_packets: Vec<u64>,
    flood_drops: u64,
}

impl<N: Nic> PollLoop<N> {
    pub fn new(nic: N, pool: PacketPool, drain_interval_ns: u64, now_ns: u64) -> Self {
        let ports = nic.port_count();
        debug_assert!(ports as usize <= MAX_PORTS);
        PollLoop {
            sched: TxScheduler::new(ports, drain_interval_ns, now_ns),
            rx_packets: vec![0; ports as usize],
            rx_buf: Burst::new(),
            flood_drops: 0,
            nic,
            pool,
        }
    }

    pub fn nic(&self) -> &N { &self.nic }
    pub fn nic_mut(&mut self) -> &mut N { &mut self.nic }
    pub fn pool(&self) -> &PacketPool { &self.pool }
    pub fn scheduler(&self) -> &TxScheduler { &self.sched }

    /// Frames dropped because there was no egress port.
    pub fn flood_drops(&self) -> u64 { self.flood_drops }

    /// Warn for every port whose device sits on a NUMA node other than
    /// `local_node`. Diagnostic only. Returns the offending ports.
    pub fn check_port_affinity(&self, local_node: u32) -> Vec<PortId> {
        let mut remote = Vec::new();
        for port in 0..self.nic.port_count() {
            if let Some(node) = self.nic.affinity_hint(port) {
                if node != local_node {
                    warn!(target: "hub::dp",
                        "port {} is on remote NUMA node {} to polling thread (node {}). Performance will not be optimal.",
                        port, node, local_node);
                    remote.push(port);
                }
            }
        }
        remote
    }

    /// One pass over every port followed by one drain sweep.
    /// Returns the number of frames received in this pass.
    #[inline(always)]
    pub fn poll_once<C: Clock>(&mut self, clock: &C) -> Result<usize, PoolError> {
        let nb_ports = self.nic.port_count();
        let mut total = 0;
        for port in 0..nb_ports {
            let rx = self.nic.rx_burst(port, &mut self.pool, &mut self.rx_buf);
            let n = self.rx_buf.len();
            self.rx_packets[port as usize] += n as u64;
            total += n;
            // Frames received before an exhausted pool still get flooded.
            for m in self.rx_buf.drain(..) {
                if flood_forward(m, port, nb_ports, &mut self.sched, &mut self.nic, &mut self.pool) == 0 {
                    self.flood_drops += 1;
                }
            }
            rx?;
        }
        self.sched.drain_sweep(clock.now_ns(), &mut self.nic, &mut self.pool);
        Ok(total)
    }

    /// Busy-poll until `shutdown` is raised.
    pub fn run<C: Clock>(&mut self, clock: &C, shutdown: &AtomicBool) -> Result<(), PoolError> {
        info!(target: "hub::dp", "polling {} ports, drain every {}us",
            self.nic.port_count(), self.sched.timer().interval_ns() / 1000);
        while !shutdown.load(Ordering::Relaxed) {
            self.poll_once(clock)?;
        }
        Ok(())
    }

    /// Release everything still parked in transmit queues, plus any frames
    /// the NIC layer holds. Returns the number of parked packets.
    pub fn shutdown(&mut self) -> usize {
        let parked = self.sched.discard_all(&mut self.pool);
        self.nic.return_buffers(&mut self.pool);
        parked
    }

    pub fn port_stats(&self, port: PortId) -> PortStats {
        let tx = self.sched.stats(port);
        let link = self.nic.link_errors(port);
        PortStats {
            rx_packets: self.rx_packets[port as usize],
            // The scheduler counts everything the NIC consumed, refused frames included.
            tx_packets: tx.tx_packets.saturating_sub(link.tx_errors),
            tx_dropped: tx.tx_dropped,
            full_flushes: tx.full_flushes,
            drain_flushes: tx.drain_flushes,
            rx_oversize: link.rx_oversize,
            tx_errors: link.tx_errors,
        }
    }

    pub fn pool_counters(&self) -> PoolCounters { self.pool.counters() }

    /// Final per-port counters and pool accounting, logged once at stop.
    pub fn log_summary(&self) {
        for port in 0..self.nic.port_count() {
            let s = self.port_stats(port);
            info!(target: "hub::dp",
                "port {} ({}): rx={} tx={} tx_drop={} tx_err={} rx_oversize={} flush_full={} flush_drain={}",
                port, self.nic.port_name(port), s.rx_packets, s.tx_packets, s.tx_dropped,
                s.tx_errors, s.rx_oversize, s.full_flushes, s.drain_flushes);
        }
        let c = self.pool.counters();
        info!(target: "hub::dp", "pool: allocs={} frees={} in_use={}/{} flood_drops={}",
            c.allocs, c.frees, self.pool.in_use(), self.pool.capacity(), self.flood_drops);
    }
}
