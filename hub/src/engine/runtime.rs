// FLOOD HUB — ENGINE: RUNTIME MODULE
// Infrastructure under the forwarding engine: fatal exit diagnostics,
// the TSC fast clock used by the drain timer, and CPU / NUMA placement.

use std::mem;
use std::ptr;
use std::time::Duration;

use tracing::warn;

// ============================================================================
// FATAL EXIT + DIAGNOSTIC ERROR CODES
// ============================================================================

// Convention: 0x10-0x1F = Boot, 0x20-0x2F = Runtime

pub const E_CONFIG: i32           = 0x10;
pub const E_PORT_COUNT: i32       = 0x11;
pub const E_PORT_INIT: i32        = 0x12;
pub const E_AFFINITY_FAIL: i32    = 0x13;
pub const E_POOL_ALLOC: i32       = 0x14;

pub const E_POOL_EXHAUSTED: i32   = 0x20;

/// Structured fatal exit. No subscriber, no formatting machinery.
/// Output: "[HUB FATAL 0xHH] msg\n", emitted with a single writev() so
/// concurrent writers cannot interleave the line.
#[inline(never)]
pub fn fatal(code: i32, msg: &str) -> ! {
    let prefix = b"[HUB FATAL 0x";
    let hex = [
        b"0123456789ABCDEF"[((code >> 4) & 0xF) as usize],
        b"0123456789ABCDEF"[(code & 0xF) as usize],
    ];
    let suffix = b"] ";
    let newline = b"\n";
    let iov = [
        libc::iovec { iov_base: prefix.as_ptr() as *mut _, iov_len: prefix.len() },
        libc::iovec { iov_base: hex.as_ptr() as *mut _, iov_len: 2 },
        libc::iovec { iov_base: suffix.as_ptr() as *mut _, iov_len: suffix.len() },
        libc::iovec { iov_base: msg.as_ptr() as *mut _, iov_len: msg.len() },
        libc::iovec { iov_base: newline.as_ptr() as *mut _, iov_len: 1 },
    ];
    // SAFETY: every iovec points at a live, immutable buffer of the stated length.
    unsafe {
        libc::writev(2, iov.as_ptr(), iov.len() as i32);
        libc::_exit(code);
    }
}

// ============================================================================
// TSC FAST CLOCK
// rdtsc in the poll loop instead of clock_gettime(MONOTONIC). Calibrated once
// at boot; conversion is a fixed-point multiply + shift.
// ============================================================================

#[inline(always)]
pub fn clock_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: FFI call with valid mutable reference to timespec.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// TSC-to-nanosecond calibration. Computed once at boot, immutable after.
/// ns = mono_base + ((rdtsc() - tsc_base) * mult) >> shift
#[derive(Clone, Copy, Debug)]
pub struct TscCal {
    tsc_base: u64,
    mono_base: u64,
    mult: u32,
    shift: u32,
    freq_khz: u64,
    valid: bool,
}

impl TscCal {
    /// rdtsc_ns() degrades to clock_ns().
    pub fn fallback() -> Self {
        TscCal { tsc_base: 0, mono_base: 0, mult: 0, shift: 0, freq_khz: 0, valid: false }
    }

    pub fn is_valid(&self) -> bool { self.valid }

    /// Measured TSC frequency, 0 on the fallback clock.
    pub fn freq_khz(&self) -> u64 { self.freq_khz }
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn read_tsc() -> u64 {
    let lo: u32;
    let hi: u32;
    // SAFETY: rdtsc only writes eax/edx.
    unsafe {
        core::arch::asm!(
            "rdtsc",
            out("eax") lo,
            out("edx") hi,
            options(nostack, nomem, preserves_flags)
        );
    }
    ((hi as u64) << 32) | (lo as u64)
}

/// CNTVCT_EL0: constant-rate, monotonic, unprivileged.
#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn read_tsc() -> u64 {
    let cnt: u64;
    // SAFETY: reading the virtual counter has no memory side effects.
    unsafe {
        core::arch::asm!(
            "mrs {cnt}, CNTVCT_EL0",
            cnt = out(reg) cnt,
            options(nostack, nomem, preserves_flags)
        );
    }
    cnt
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
pub fn read_tsc() -> u64 { clock_ns() }

#[inline(always)]
pub fn rdtsc_ns(cal: &TscCal) -> u64 {
    if !cal.valid { return clock_ns(); }
    let delta = read_tsc().wrapping_sub(cal.tsc_base);
    cal.mono_base.wrapping_add(
        ((delta as u128 * cal.mult as u128) >> cal.shift) as u64
    )
}

/// Time source for the datapath, in nanoseconds.
pub trait Clock {
    fn now_ns(&self) -> u64;
}

impl Clock for TscCal {
    #[inline(always)]
    fn now_ns(&self) -> u64 { rdtsc_ns(self) }
}

#[cfg(target_arch = "x86_64")]
fn has_invariant_tsc() -> bool {
    // CPUID leaf 0x80000007, EDX bit 8.
    // SAFETY: cpuid is side-effect free; rbx is saved around it.
    let edx: u32 = unsafe {
        let edx: u32;
        core::arch::asm!(
            "push rbx",
            "mov eax, 0x80000007",
            "cpuid",
            "pop rbx",
            out("edx") edx,
            out("eax") _,
            out("ecx") _,
            options(nomem)
        );
        edx
    };
    (edx >> 8) & 1 == 1
}

#[cfg(not(target_arch = "x86_64"))]
fn has_invariant_tsc() -> bool { true }

/// Derive the counter-to-ns ratio from one `window` against CLOCK_MONOTONIC.
/// The drain timer only needs microsecond resolution, so a single sample is
/// enough; an unusable counter yields TscCal::fallback().
pub fn calibrate_tsc(window: Duration) -> TscCal {
    if !has_invariant_tsc() {
        warn!(target: "hub::tsc", "no invariant TSC, drain timer uses clock_gettime");
        return TscCal::fallback();
    }

    let (tsc0, mono0) = (read_tsc(), clock_ns());
    std::thread::sleep(window);
    let (tsc1, mono1) = (read_tsc(), clock_ns());

    let ticks = tsc1.wrapping_sub(tsc0) as u128;
    let nanos = mono1.saturating_sub(mono0) as u128;
    const SHIFT: u32 = 32;
    let mult = match (nanos << SHIFT).checked_div(ticks).map(u32::try_from) {
        Some(Ok(m)) if nanos > 0 => m,
        _ => {
            warn!(target: "hub::tsc", "unusable counter ({} ticks in {}ns), drain timer uses clock_gettime",
                ticks, nanos);
            return TscCal::fallback();
        }
    };

    TscCal {
        tsc_base: read_tsc(),
        mono_base: clock_ns(),
        mult,
        shift: SHIFT,
        freq_khz: (ticks * 1_000_000 / nanos) as u64,
        valid: true,
    }
}

// ============================================================================
// CPU MANAGEMENT (core pinning, NUMA node lookup)
// ============================================================================

pub fn pin_to_core(core_id: usize) -> Result<(), std::io::Error> {
    // CPU_SET indexes the mask directly and panics past CPU_SETSIZE.
    if core_id >= libc::CPU_SETSIZE as usize {
        return Err(std::io::Error::from_raw_os_error(libc::EINVAL));
    }
    // SAFETY: cpu_set_t is repr(C) and all-zeroes is a valid (empty) set.
    unsafe {
        let mut cpuset: libc::cpu_set_t = mem::zeroed();
        libc::CPU_SET(core_id, &mut cpuset);
        if libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &cpuset) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Number of CPUs the calling thread may run on.
pub fn allowed_cpu_count() -> usize {
    // SAFETY: see pin_to_core.
    unsafe {
        let mut cpuset: libc::cpu_set_t = mem::zeroed();
        if libc::sched_getaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mut cpuset) != 0 {
            return 1;
        }
        libc::CPU_COUNT(&cpuset).max(1) as usize
    }
}

/// (cpu, numa node) of the calling thread, via getcpu(2).
pub fn current_cpu_node() -> (u32, u32) {
    let mut cpu: libc::c_uint = 0;
    let mut node: libc::c_uint = 0;
    // SAFETY: both out-pointers are valid; the tcache argument may be null.
    let ret = unsafe {
        libc::syscall(libc::SYS_getcpu, &mut cpu as *mut libc::c_uint,
            &mut node as *mut libc::c_uint, ptr::null_mut::<libc::c_void>())
    };
    if ret != 0 { return (0, 0); }
    (cpu, node)
}

// ============================================================================
// TESTS
// ============================================================================
