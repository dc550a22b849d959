// FLOOD HUB — NETWORK: AF_PACKET NIC LAYER
// One non-blocking AF_PACKET/SOCK_RAW socket per port, bound to the interface
// with promiscuous membership. Receive copies a frame into a pool buffer;
// transmit hands each frame to the kernel, which copies it before send()
// returns, so consumed packets are released immediately.
//
// Each port keeps one spare pool frame between calls. An idle poll reads into
// the spare and gives nothing back to the pool; a new frame is taken only
// after the spare has been kept, and only when the socket has a frame queued.

use std::ffi::CString;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use anyhow::{bail, Context};
use libc::{c_void, sockaddr, sockaddr_ll, socklen_t};

use crate::engine::mbuf::{Mbuf, PacketPool, PoolError};
use crate::network::{Burst, LinkErrors, MacAddr, Nic, PortId, BURST_SIZE};

const ETH_P_ALL: u16 = 0x0003;
const SOL_PACKET: i32 = 263;
const PACKET_ADD_MEMBERSHIP: i32 = 1;
const PACKET_MR_PROMISC: u16 = 1;
/// sll_pkttype of frames this host sent; AF_PACKET loops them back to us.
const PACKET_OUTGOING: u8 = 4;
/// recv attempts per rx_burst, so a stream of skipped frames cannot stall the loop.
const RX_ATTEMPTS: usize = 2 * BURST_SIZE;

#[repr(C)]
#[derive(Default)]
struct PacketMreq { mr_ifindex: i32, mr_type: u16, mr_alen: u16, mr_address: [u8; 8] }

struct AfPacketPort {
    name: String,
    fd: OwnedFd,
    mac: MacAddr,
    numa_node: Option<u32>,
    spare: Option<Mbuf>,
    errors: LinkErrors,
}

pub struct AfPacketNic {
    ports: Vec<AfPacketPort>,
}

impl AfPacketNic {
    /// Open one port per interface, in order. Port ids follow `ifaces`.
    pub fn open(ifaces: &[String]) -> anyhow::Result<Self> {
        let ports = ifaces.iter()
            .map(|name| open_port(name).with_context(|| format!("cannot initialize port {}", name)))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(AfPacketNic { ports })
    }
}

fn open_port(name: &str) -> anyhow::Result<AfPacketPort> {
    let c_name = CString::new(name).context("interface name contains a null byte")?;
    // SAFETY: c_name is a valid null-terminated string.
    let ifindex = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if ifindex == 0 {
        bail!("interface {} not found", name);
    }

    let proto = ETH_P_ALL.to_be();
    // SAFETY: plain socket(2) call; the result is checked before use.
    let raw = unsafe {
        libc::socket(libc::AF_PACKET, libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, proto as i32)
    };
    if raw < 0 {
        return Err(std::io::Error::last_os_error()).context("socket(AF_PACKET) failed (needs CAP_NET_RAW)");
    }
    // SAFETY: raw is a fresh descriptor we own exclusively.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    // SAFETY: sockaddr_ll is repr(C); all-zeroes is valid.
    let mut sll: sockaddr_ll = unsafe { mem::zeroed() };
    sll.sll_family = libc::AF_PACKET as u16;
    sll.sll_protocol = proto;
    sll.sll_ifindex = ifindex as i32;
    // SAFETY: sll is a fully initialized sockaddr_ll and the length matches.
    let ret = unsafe {
        libc::bind(fd.as_raw_fd(), &sll as *const sockaddr_ll as *const sockaddr,
            mem::size_of::<sockaddr_ll>() as socklen_t)
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error()).context("bind(AF_PACKET) failed");
    }

    let mreq = PacketMreq { mr_ifindex: ifindex as i32, mr_type: PACKET_MR_PROMISC, ..Default::default() };
    // SAFETY: mreq matches struct packet_mreq from <linux/if_packet.h>.
    let ret = unsafe {
        libc::setsockopt(fd.as_raw_fd(), SOL_PACKET, PACKET_ADD_MEMBERSHIP,
            &mreq as *const PacketMreq as *const c_void, mem::size_of::<PacketMreq>() as socklen_t)
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error()).context("PACKET_ADD_MEMBERSHIP(PROMISC) failed");
    }

    let mac_path = format!("/sys/class/net/{}/address", name);
    let mac = std::fs::read_to_string(&mac_path).ok()
        .and_then(|s| MacAddr::parse(&s))
        .with_context(|| format!("cannot read link address from {}", mac_path))?;

    Ok(AfPacketPort {
        name: name.to_string(),
        fd,
        mac,
        numa_node: read_numa_node(name),
        spare: None,
        errors: LinkErrors::default(),
    })
}

/// `/sys/class/net/<if>/device/numa_node`; -1 or absent means unknown.
fn read_numa_node(name: &str) -> Option<u32> {
    let s = std::fs::read_to_string(format!("/sys/class/net/{}/device/numa_node", name)).ok()?;
    s.trim().parse::<i32>().ok().filter(|n| *n >= 0).map(|n| n as u32)
}

// ============================================================================
// FRAME I/O
// ============================================================================

/// Non-blocking frame I/O on one port.
trait FrameIo {
    /// At least one frame is queued for receive.
    fn frame_waiting(&mut self) -> bool;
    /// Copy the next frame into `buf`. Returns its full length on the wire
    /// (which may exceed `buf.len()`) and its packet type, or None when
    /// nothing is queued.
    fn recv(&mut self, buf: &mut [u8]) -> Option<(usize, u8)>;
    /// Err carries errno.
    fn send(&mut self, frame: &[u8]) -> Result<(), i32>;
}

struct RawSocket(RawFd);

impl FrameIo for RawSocket {
    fn frame_waiting(&mut self) -> bool {
        let mut peek = [0u8; 1];
        // SAFETY: peek is a writable 1-byte buffer; MSG_PEEK leaves the frame queued.
        let ret = unsafe {
            libc::recv(self.0, peek.as_mut_ptr() as *mut c_void, peek.len(),
                libc::MSG_DONTWAIT | libc::MSG_PEEK | libc::MSG_TRUNC)
        };
        ret >= 0
    }

    fn recv(&mut self, buf: &mut [u8]) -> Option<(usize, u8)> {
        // SAFETY: sockaddr_ll is repr(C); all-zeroes is valid.
        let mut from: sockaddr_ll = unsafe { mem::zeroed() };
        let mut from_len = mem::size_of::<sockaddr_ll>() as socklen_t;
        // MSG_TRUNC: return the real frame length even when it did not fit.
        // SAFETY: buf is a writable frame of buf.len() bytes; from/from_len are valid out-params.
        let ret = unsafe {
            libc::recvfrom(self.0, buf.as_mut_ptr() as *mut c_void, buf.len(),
                libc::MSG_DONTWAIT | libc::MSG_TRUNC,
                &mut from as *mut sockaddr_ll as *mut sockaddr, &mut from_len)
        };
        // EAGAIN is the common case; any other error is also "no work".
        if ret <= 0 { return None; }
        Some((ret as usize, from.sll_pkttype))
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), i32> {
        // SAFETY: frame is a readable slice of frame.len() bytes.
        let ret = unsafe { libc::send(self.0, frame.as_ptr() as *const c_void, frame.len(), libc::MSG_DONTWAIT) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        }
        Ok(())
    }
}

/// The socket send buffer or device queue is full: stop the batch.
fn is_queue_full(errno: i32) -> bool {
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK || errno == libc::ENOBUFS
}

fn receive_into<I: FrameIo>(
    io: &mut I,
    spare: &mut Option<Mbuf>,
    errors: &mut LinkErrors,
    pool: &mut PacketPool,
    out: &mut Burst,
) -> Result<usize, PoolError> {
    let mut n = 0;
    for _ in 0..RX_ATTEMPTS {
        if out.is_full() { break; }
        let m = match spare.take() {
            Some(m) => m,
            None if io.frame_waiting() => pool.alloc()?,
            None => break,
        };
        let buf = pool.buf_mut(&m);
        let cap = buf.len();
        match io.recv(buf) {
            None => {
                *spare = Some(m);
                break;
            }
            Some((_, PACKET_OUTGOING)) => *spare = Some(m),
            Some((len, _)) if len > cap => {
                errors.rx_oversize += 1;
                *spare = Some(m);
            }
            Some((len, _)) => {
                pool.set_len(&m, len);
                out.push(m);
                n += 1;
            }
        }
    }
    Ok(n)
}

fn send_burst<I: FrameIo>(io: &mut I, errors: &mut LinkErrors, pkts: &mut Burst, pool: &mut PacketPool) -> usize {
    let mut consumed = 0;
    for m in pkts.iter() {
        match io.send(pool.data(m)) {
            Ok(()) => {}
            Err(errno) if is_queue_full(errno) => break,
            // EMSGSIZE and friends condemn this frame only.
            Err(_) => errors.tx_errors += 1,
        }
        consumed += 1;
    }
    for m in pkts.drain(..consumed) { pool.release(m); }
    consumed
}

impl Nic for AfPacketNic {
    fn port_count(&self) -> u16 { self.ports.len() as u16 }

    fn rx_burst(&mut self, port: PortId, pool: &mut PacketPool, out: &mut Burst) -> Result<usize, PoolError> {
        let p = &mut self.ports[port as usize];
        receive_into(&mut RawSocket(p.fd.as_raw_fd()), &mut p.spare, &mut p.errors, pool, out)
    }

    fn tx_burst(&mut self, port: PortId, pkts: &mut Burst, pool: &mut PacketPool) -> usize {
        let p = &mut self.ports[port as usize];
        send_burst(&mut RawSocket(p.fd.as_raw_fd()), &mut p.errors, pkts, pool)
    }

    fn affinity_hint(&self, port: PortId) -> Option<u32> { self.ports[port as usize].numa_node }

    fn mac_addr(&self, port: PortId) -> MacAddr { self.ports[port as usize].mac }

    fn port_name(&self, port: PortId) -> String { self.ports[port as usize].name.clone() }

    fn link_errors(&self, port: PortId) -> LinkErrors { self.ports[port as usize].errors }

    fn return_buffers(&mut self, pool: &mut PacketPool) {
        for p in self.ports.iter_mut() {
            if let Some(m) = p.spare.take() { pool.release(m); }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Socket stand-in: queued rx frames with their packet type, and a
    /// per-send result script (Ok once the script runs out).
    #[derive(Default)]
    struct ScriptedIo {
        rx: VecDeque<(Vec<u8>, u8)>,
        tx_results: VecDeque<Result<(), i32>>,
        sent: Vec<Vec<u8>>,
    }

    impl FrameIo for ScriptedIo {
        fn frame_waiting(&mut self) -> bool { !self.rx.is_empty() }

        fn recv(&mut self, buf: &mut [u8]) -> Option<(usize, u8)> {
            let (frame, pkttype) = self.rx.pop_front()?;
            let n = frame.len().min(buf.len());
            buf[..n].copy_from_slice(&frame[..n]);
            Some((frame.len(), pkttype))
        }

        fn send(&mut self, frame: &[u8]) -> Result<(), i32> {
            let r = self.tx_results.pop_front().unwrap_or(Ok(()));
            if r.is_ok() { self.sent.push(frame.to_vec()); }
            r
        }
    }

    const PACKET_HOST: u8 = 0;

    fn burst_of(pool: &mut PacketPool, frames: &[&[u8]]) -> Burst {
        frames.iter().map(|f| pool.alloc_from(f).unwrap()).collect()
    }

    #[test]
    fn oversize_frames_are_dropped_not_cut() {
        let mut pool = PacketPool::new(8, 64).unwrap();
        let mut io = ScriptedIo::default();
        io.rx.push_back((vec![1; 60], PACKET_HOST));
        io.rx.push_back((vec![2; 100], PACKET_HOST));
        io.rx.push_back((vec![3; 30], PACKET_HOST));
        let (mut spare, mut errors, mut out) = (None, LinkErrors::default(), Burst::new());

        assert_eq!(receive_into(&mut io, &mut spare, &mut errors, &mut pool, &mut out), Ok(2));
        assert_eq!(pool.data(&out[0]), &[1u8; 60][..]);
        assert_eq!(pool.data(&out[1]), &[3u8; 30][..]);
        assert_eq!(errors.rx_oversize, 1);
        // The buffer used for the oversize frame was reused for the next one.
        assert_eq!(pool.counters().allocs, 2);

        for m in out.drain(..) { pool.release(m); }
        assert_eq!(pool.in_use(), 0);
        assert!(spare.is_none());
    }

    #[test]
    fn own_transmits_are_skipped() {
        let mut pool = PacketPool::new(8, 64).unwrap();
        let mut io = ScriptedIo::default();
        io.rx.push_back((vec![9; 20], PACKET_OUTGOING));
        io.rx.push_back((vec![7; 20], PACKET_HOST));
        let (mut spare, mut errors, mut out) = (None, LinkErrors::default(), Burst::new());

        assert_eq!(receive_into(&mut io, &mut spare, &mut errors, &mut pool, &mut out), Ok(1));
        assert_eq!(pool.data(&out[0]), &[7u8; 20][..]);
        assert_eq!(errors, LinkErrors::default());
        for m in out.drain(..) { pool.release(m); }
    }

    #[test]
    fn idle_polls_do_not_churn_the_pool() {
        let mut pool = PacketPool::new(8, 64).unwrap();
        let mut io = ScriptedIo::default();
        let (mut spare, mut errors, mut out) = (None, LinkErrors::default(), Burst::new());

        for _ in 0..100 {
            assert_eq!(receive_into(&mut io, &mut spare, &mut errors, &mut pool, &mut out), Ok(0));
        }
        assert_eq!(pool.counters().allocs, 0);

        // A skipped frame leaves a spare behind; later idle polls keep it.
        io.rx.push_back((vec![0; 20], PACKET_OUTGOING));
        for _ in 0..100 {
            assert_eq!(receive_into(&mut io, &mut spare, &mut errors, &mut pool, &mut out), Ok(0));
        }
        let c = pool.counters();
        assert_eq!((c.allocs, c.frees), (1, 0));
        assert!(spare.is_some());

        if let Some(m) = spare.take() { pool.release(m); }
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn dry_pool_only_fails_when_a_frame_is_waiting() {
        let mut pool = PacketPool::new(1, 64).unwrap();
        let held = pool.alloc().unwrap();
        let mut io = ScriptedIo::default();
        let (mut spare, mut errors, mut out) = (None, LinkErrors::default(), Burst::new());

        assert_eq!(receive_into(&mut io, &mut spare, &mut errors, &mut pool, &mut out), Ok(0));
        io.rx.push_back((vec![5; 20], PACKET_HOST));
        assert_eq!(
            receive_into(&mut io, &mut spare, &mut errors, &mut pool, &mut out),
            Err(PoolError::Exhausted { capacity: 1 }),
        );
        assert_eq!(io.rx.len(), 1);
        pool.release(held);
    }

    #[test]
    fn per_frame_send_error_does_not_stop_the_batch() {
        let mut pool = PacketPool::new(8, 64).unwrap();
        let mut pkts = burst_of(&mut pool, &[b"a", b"b", b"c", b"d"]);
        let mut io = ScriptedIo::default();
        io.tx_results.extend([Ok(()), Err(libc::EMSGSIZE), Ok(()), Ok(())]);
        let mut errors = LinkErrors::default();

        assert_eq!(send_burst(&mut io, &mut errors, &mut pkts, &mut pool), 4);
        assert!(pkts.is_empty());
        assert_eq!(errors.tx_errors, 1);
        assert_eq!(io.sent, vec![b"a".to_vec(), b"c".to_vec(), b"d".to_vec()]);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn full_queue_leaves_the_rest_to_the_caller() {
        let mut pool = PacketPool::new(8, 64).unwrap();
        let mut pkts = burst_of(&mut pool, &[b"a", b"b", b"c", b"d"]);
        let mut io = ScriptedIo::default();
        io.tx_results.extend([Ok(()), Err(libc::ENOBUFS)]);
        let mut errors = LinkErrors::default();

        assert_eq!(send_burst(&mut io, &mut errors, &mut pkts, &mut pool), 1);
        assert_eq!(pkts.len(), 3);
        assert_eq!(pool.data(&pkts[0]), b"b");
        assert_eq!(errors.tx_errors, 0);
        for m in pkts.drain(..) { pool.release(m); }
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn queue_full_errnos() {
        assert!(is_queue_full(libc::EAGAIN));
        assert!(is_queue_full(libc::ENOBUFS));
        assert!(!is_queue_full(libc::EMSGSIZE));
        assert!(!is_queue_full(libc::ENETDOWN));
    }

    #[test]
    fn missing_interface_is_reported() {
        let err = match AfPacketNic::open(&["flh-does-not-exist0".to_string()]) {
            Ok(_) => panic!("opened a nonexistent interface"),
            Err(e) => e,
        };
        let msg = format!("{:#}", err);
        assert!(msg.contains("flh-does-not-exist0"), "{}", msg);
    }

    #[test]
    fn mreq_matches_kernel_layout() {
        assert_eq!(mem::size_of::<PacketMreq>(), 16);
    }

    #[test]
    fn numa_node_of_unknown_interface_is_none() {
        assert_eq!(read_numa_node("flh-does-not-exist0"), None);
    }
}
