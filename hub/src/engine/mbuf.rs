// FLOOD HUB — ENGINE: PACKET BUFFERS
// Fixed-capacity frame pool with per-frame reference counts.
//
// A frame is handed out as an `Mbuf`: a move-only handle that owns exactly one
// reference. Fan-out is expressed by `retain(&m, n)`, which bumps the count by
// `n` up front and yields `n` further handles. Every handle is given back
// through `release(m)` by value, so one logical reference cannot be released
// twice. The last release returns the frame to the slab.
//
// Threading: single datapath context. Counts are plain u16; the pool is only
// reachable through `&mut`, and none of these types is Sync.

use std::fmt;

// ============================================================================
// SLAB ALLOCATOR
// ============================================================================

/// Fixed-size stack-based slab allocator. O(1) alloc/free, LIFO reuse.
#[repr(align(64))]
pub struct FixedSlab { stack: Box<[u32]>, top: usize, capacity: usize }
impl FixedSlab {
    pub fn new(capacity: usize) -> Self {
        FixedSlab { stack: (0..capacity as u32).collect(), top: capacity, capacity }
    }
    #[inline(always)] pub fn alloc(&mut self) -> Option<u32> {
        if self.top == 0 { return None; }
        self.top -= 1;
        Some(self.stack[self.top])
    }
    #[inline(always)] pub fn free(&mut self, idx: u32) {
        if self.top < self.capacity { self.stack[self.top] = idx; self.top += 1; }
    }
    #[inline(always)] pub fn available(&self) -> usize { self.top }
    #[inline(always)] pub fn capacity(&self) -> usize { self.capacity }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Every frame is referenced. The pool is sized so this never happens
    /// under expected load; callers treat it as fatal.
    Exhausted { capacity: usize },
    /// Backing storage could not be reserved at construction.
    Alloc { bytes: usize },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Exhausted { capacity } => write!(f, "packet pool exhausted ({} frames)", capacity),
            PoolError::Alloc { bytes } => write!(f, "cannot reserve {} bytes of frame storage", bytes),
        }
    }
}

impl std::error::Error for PoolError {}

// ============================================================================
// MBUF HANDLE
// ============================================================================

/// One reference to a pooled frame. Not Clone: extra references only come
/// from `PacketPool::retain`.
#[must_use = "an Mbuf owns a frame reference and must be released to its pool"]
#[derive(Debug, PartialEq, Eq)]
pub struct Mbuf { idx: u32 }

impl Mbuf {
    /// Frame index inside the pool. Two handles to the same frame share it.
    #[inline(always)]
    pub fn frame_idx(&self) -> u32 { self.idx }
}

/// The `n` handles produced by one `retain`. Dropping it with handles left
/// would leak those references, so the forwarder always exhausts it.
#[must_use]
pub struct Shares { idx: u32, remaining: u16 }

impl Iterator for Shares {
    type Item = Mbuf;
    #[inline(always)]
    fn next(&mut self) -> Option<Mbuf> {
        if self.remaining == 0 { return None; }
        self.remaining -= 1;
        Some(Mbuf { idx: self.idx })
    }
    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining as usize, Some(self.remaining as usize))
    }
}

impl ExactSizeIterator for Shares {}

// ============================================================================
// PACKET POOL
// ============================================================================

/// Cumulative pool accounting. `allocs - frees` is the number of frames in use.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolCounters {
    pub allocs: u64,
    pub frees: u64,
    pub retains: u64,
    pub releases: u64,
}

pub struct PacketPool {
    data: Box<[u8]>,
    lens: Box<[u32]>,
    refcnt: Box<[u16]>,
    slab: FixedSlab,
    frame_size: usize,
    counters: PoolCounters,
}

impl PacketPool {
    pub fn new(frames: usize, frame_size: usize) -> Result<Self, PoolError> {
        if frames == 0 || frames > u32::MAX as usize {
            return Err(PoolError::Alloc { bytes: 0 });
        }
        let bytes = frames.checked_mul(frame_size).ok_or(PoolError::Alloc { bytes: usize::MAX })?;
        let mut data = Vec::new();
        data.try_reserve_exact(bytes).map_err(|_| PoolError::Alloc { bytes })?;
        data.resize(bytes, 0u8);
        Ok(PacketPool {
            data: data.into_boxed_slice(),
            lens: vec![0u32; frames].into_boxed_slice(),
            refcnt: vec![0u16; frames].into_boxed_slice(),
            slab: FixedSlab::new(frames),
            frame_size,
            counters: PoolCounters::default(),
        })
    }

    #[inline(always)] pub fn capacity(&self) -> usize { self.slab.capacity() }
    #[inline(always)] pub fn frame_size(&self) -> usize { self.frame_size }
    #[inline(always)] pub fn available(&self) -> usize { self.slab.available() }
    #[inline(always)] pub fn in_use(&self) -> usize { self.capacity() - self.available() }
    #[inline(always)] pub fn counters(&self) -> PoolCounters { self.counters }

    /// Take a frame with refcount 1 and length 0.
    #[inline(always)]
    pub fn alloc(&mut self) -> Result<Mbuf, PoolError> {
        let idx = self.slab.alloc().ok_or(PoolError::Exhausted { capacity: self.capacity() })?;
        self.refcnt[idx as usize] = 1;
        self.lens[idx as usize] = 0;
        self.counters.allocs += 1;
        Ok(Mbuf { idx })
    }

    /// Allocate and fill from `bytes` (truncated to the frame size).
    pub fn alloc_from(&mut self, bytes: &[u8]) -> Result<Mbuf, PoolError> {
        let m = self.alloc()?;
        let n = bytes.len().min(self.frame_size);
        self.buf_mut(&m)[..n].copy_from_slice(&bytes[..n]);
        self.set_len(&m, n);
        Ok(m)
    }

    /// Add `n` references to the frame and hand them out as `n` handles.
    /// Called once with the full fan-out count, before any handle escapes.
    #[inline(always)]
    pub fn retain(&mut self, m: &Mbuf, n: u16) -> Shares {
        let rc = &mut self.refcnt[m.idx as usize];
        debug_assert!(*rc > 0, "retain on a free frame {}", m.idx);
        *rc = rc.checked_add(n).unwrap_or_else(|| {
            crate::engine::runtime::fatal(crate::engine::runtime::E_POOL_EXHAUSTED, "mbuf refcount overflow")
        });
        self.counters.retains += n as u64;
        Shares { idx: m.idx, remaining: n }
    }

    /// Drop one reference; the last one returns the frame to the slab.
    #[inline(always)]
    pub fn release(&mut self, m: Mbuf) {
        let rc = &mut self.refcnt[m.idx as usize];
        debug_assert!(*rc > 0, "release on a free frame {}", m.idx);
        *rc -= 1;
        self.counters.releases += 1;
        if *rc == 0 {
            self.slab.free(m.idx);
            self.counters.frees += 1;
        }
    }

    #[inline(always)]
    pub fn refcnt(&self, m: &Mbuf) -> u16 { self.refcnt[m.idx as usize] }

    #[inline(always)]
    pub fn data(&self, m: &Mbuf) -> &[u8] {
        let start = m.idx as usize * self.frame_size;
        &self.data[start..start + self.lens[m.idx as usize] as usize]
    }

    /// Whole frame capacity, for receive paths that write before they know the length.
    #[inline(always)]
    pub fn buf_mut(&mut self, m: &Mbuf) -> &mut [u8] {
        let start = m.idx as usize * self.frame_size;
        &mut self.data[start..start + self.frame_size]
    }

    #[inline(always)]
    pub fn set_len(&mut self, m: &Mbuf, len: usize) {
        debug_assert!(len <= self.frame_size);
        self.lens[m.idx as usize] = len.min(self.frame_size) as u32;
    }
}

// ============================================================================
// TESTS
// ============================================================================
