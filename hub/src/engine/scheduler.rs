// FLOOD HUB — ENGINE: TRANSMIT SCHEDULER
// One bounded transmit batch per egress port. A batch leaves either the moment
// it reaches BURST_SIZE (inside the append that filled it) or on the next drain
// sweep after the drain interval, whichever comes first. Packets the NIC layer
// refuses are released on the spot: no retry, no requeue.

use crate::engine::mbuf::{Mbuf, PacketPool};
use crate::network::{Burst, Nic, PortId};

/// Default drain interval: 100 µs.
pub const DRAIN_INTERVAL_NS: u64 = 100_000;

/// Per-port transmit counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TxStats {
    /// Consumed by the NIC layer: sent, or refused for a per-frame error.
    pub tx_packets: u64,
    /// Refused by the NIC layer and released (backpressure).
    pub tx_dropped: u64,
    /// Flushes triggered by a batch reaching BURST_SIZE.
    pub full_flushes: u64,
    /// Flushes triggered by the drain timer or an explicit flush.
    pub drain_flushes: u64,
}

// ============================================================================
// DRAIN TIMER
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct DrainTimer {
    last_ns: u64,
    interval_ns: u64,
}

impl DrainTimer {
    pub fn new(interval_ns: u64, now_ns: u64) -> Self {
        DrainTimer { last_ns: now_ns, interval_ns }
    }

    #[inline(always)]
    pub fn expired(&self, now_ns: u64) -> bool {
        now_ns.saturating_sub(self.last_ns) >= self.interval_ns
    }

    #[inline(always)]
    pub fn reset(&mut self, now_ns: u64) { self.last_ns = now_ns; }

    pub fn interval_ns(&self) -> u64 { self.interval_ns }
}

// ============================================================================
// SCHEDULER
// ============================================================================

pub struct TxScheduler {
    queues: Vec<Burst>,
    stats: Vec<TxStats>,
    timer: DrainTimer,
}

impl TxScheduler {
    pub fn new(ports: u16, drain_interval_ns: u64, now_ns: u64) -> Self {
        TxScheduler {
            queues: (0..ports).map(|_| Burst::new()).collect(),
            stats: vec![TxStats::default(); ports as usize],
            timer: DrainTimer::new(drain_interval_ns, now_ns),
        }
    }

    #[inline(always)]
    pub fn port_count(&self) -> u16 { self.queues.len() as u16 }

    /// Packets currently parked for `port`.
    #[inline(always)]
    pub fn pending(&self, port: PortId) -> usize { self.queues[port as usize].len() }

    pub fn stats(&self, port: PortId) -> TxStats { self.stats[port as usize] }

    pub fn timer(&self) -> &DrainTimer { &self.timer }

    /// Queue one reference for `port`. Fills to BURST_SIZE flush synchronously,
    /// so afterwards the queue holds fewer than BURST_SIZE packets.
    #[inline(always)]
    pub fn append<N: Nic>(&mut self, port: PortId, m: Mbuf, nic: &mut N, pool: &mut PacketPool) {
        let q = &mut self.queues[port as usize];
        q.push(m);
        if q.is_full() {
            self.stats[port as usize].full_flushes += 1;
            self.transmit(port, nic, pool);
        }
    }

    /// Hand the whole batch for `port` to the NIC layer now.
    /// Returns the number of packets the NIC accepted.
    pub fn flush<N: Nic>(&mut self, port: PortId, nic: &mut N, pool: &mut PacketPool) -> usize {
        if self.queues[port as usize].is_empty() { return 0; }
        self.stats[port as usize].drain_flushes += 1;
        self.transmit(port, nic, pool)
    }

    /// Called once per pass over all ports. Within the interval this is a
    /// single comparison; past it, every nonempty queue is flushed and the
    /// timer restarts from `now_ns` even if nothing was pending.
    /// Returns the number of ports flushed.
    #[inline(always)]
    pub fn drain_sweep<N: Nic>(&mut self, now_ns: u64, nic: &mut N, pool: &mut PacketPool) -> usize {
        if !self.timer.expired(now_ns) { return 0; }
        let mut flushed = 0;
        for port in 0..self.port_count() {
            if self.queues[port as usize].is_empty() { continue; }
            self.flush(port, nic, pool);
            flushed += 1;
        }
        self.timer.reset(now_ns);
        flushed
    }

    /// Release every parked packet without transmitting. Shutdown only.
    pub fn discard_all(&mut self, pool: &mut PacketPool) -> usize {
        let mut released = 0;
        for q in self.queues.iter_mut() {
            released += q.len();
            for m in q.drain(..) { pool.release(m); }
        }
        released
    }

    #[inline(always)]
    fn transmit<N: Nic>(&mut self, port: PortId, nic: &mut N, pool: &mut PacketPool) -> usize {
        let q = &mut self.queues[port as usize];
        let offered = q.len();
        let accepted = nic.tx_burst(port, q, pool);
        // The NIC layer took the consumed prefix; the rest is ours to drop.
        let sent = offered - q.len();
        debug_assert_eq!(sent, accepted, "tx_burst on port {} removed {} packets but reported {}", port, sent, accepted);
        let stats = &mut self.stats[port as usize];
        stats.tx_packets += sent as u64;
        stats.tx_dropped += q.len() as u64;
        for m in q.drain(..) { pool.release(m); }
        sent
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::virt::VirtualNic;
    use crate::network::BURST_SIZE;

    fn setup(ports: u16) -> (TxScheduler, VirtualNic, PacketPool) {
        (TxScheduler::new(ports, DRAIN_INTERVAL_NS, 0), VirtualNic::new(ports), PacketPool::new(256, 64).unwrap())
    }

    #[test]
    fn queue_never_reaches_capacity_after_append() {
        let (mut sched, mut nic, mut pool) = setup(2);
        for i in 0..(3 * BURST_SIZE + 5) {
            let m = pool.alloc_from(&[i as u8]).unwrap();
            sched.append(1, m, &mut nic, &mut pool);
            let len = sched.pending(1);
            assert!(len < BURST_SIZE, "length {} after append {}", len, i);
        }
        assert_eq!(sched.pending(1), 5);
        assert_eq!(sched.stats(1).full_flushes, 3);
    }

    #[test]
    fn full_batch_flushes_immediately() {
        let (mut sched, mut nic, mut pool) = setup(2);
        for _ in 0..BURST_SIZE {
            let m = pool.alloc().unwrap();
            sched.append(0, m, &mut nic, &mut pool);
        }
        assert_eq!(sched.pending(0), 0);
        assert_eq!(nic.bursts(), &[crate::network::virt::BurstRecord { port: 0, offered: BURST_SIZE, sent: BURST_SIZE }]);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn drain_waits_for_interval() {
        let (mut sched, mut nic, mut pool) = setup(3);
        for _ in 0..5 {
            let m = pool.alloc().unwrap();
            sched.append(2, m, &mut nic, &mut pool);
        }
        assert_eq!(sched.drain_sweep(DRAIN_INTERVAL_NS - 1, &mut nic, &mut pool), 0);
        assert_eq!(sched.pending(2), 5);

        assert_eq!(sched.drain_sweep(150_000, &mut nic, &mut pool), 1);
        assert_eq!(sched.pending(2), 0);
        assert_eq!(nic.bursts().len(), 1);
        assert_eq!(nic.bursts()[0].sent, 5);
        assert_eq!(sched.stats(2).drain_flushes, 1);
    }

    #[test]
    fn drain_timer_resets_even_when_idle() {
        let (mut sched, mut nic, mut pool) = setup(2);
        assert_eq!(sched.drain_sweep(200_000, &mut nic, &mut pool), 0);
        let m = pool.alloc().unwrap();
        sched.append(1, m, &mut nic, &mut pool);
        // Interval counts from the idle sweep at 200us, not from 0.
        assert_eq!(sched.drain_sweep(250_000, &mut nic, &mut pool), 0);
        assert_eq!(sched.drain_sweep(300_000, &mut nic, &mut pool), 1);
        assert!(nic.bursts().iter().all(|b| b.offered > 0));
    }

    #[test]
    fn backpressure_releases_unsent_suffix() {
        let (mut sched, mut nic, mut pool) = setup(2);
        nic.set_tx_budget(1, Some(3));
        for i in 0..10u8 {
            let m = pool.alloc_from(&[i]).unwrap();
            sched.append(1, m, &mut nic, &mut pool);
        }
        assert_eq!(sched.flush(1, &mut nic, &mut pool), 3);
        let stats = sched.stats(1);
        assert_eq!((stats.tx_packets, stats.tx_dropped), (3, 7));
        let sent: Vec<u8> = nic.transmitted().iter().map(|r| r.bytes[0]).collect();
        assert_eq!(sent, vec![0, 1, 2]);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.counters().frees, 10);
    }

    #[test]
    fn flush_of_empty_queue_does_not_call_nic() {
        let (mut sched, mut nic, mut pool) = setup(2);
        assert_eq!(sched.flush(0, &mut nic, &mut pool), 0);
        assert!(nic.bursts().is_empty());
        assert_eq!(sched.stats(0), TxStats::default());
    }

    #[test]
    fn discard_all_returns_parked_frames() {
        let (mut sched, mut nic, mut pool) = setup(4);
        for port in 0..4 {
            let m = pool.alloc().unwrap();
            sched.append(port, m, &mut nic, &mut pool);
        }
        assert_eq!(sched.discard_all(&mut pool), 4);
        assert_eq!(pool.in_use(), 0);
        assert!(nic.bursts().is_empty());
    }
}
