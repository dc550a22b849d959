// FLOOD HUB — CRATE ROOT (LIBRARY)
// Multi-port flooding hub: every frame received on one port is sent out of
// all the others, replicated by reference count.
//
// Module hierarchy:
//   engine/mbuf       — packet pool, refcounted frame handles, slab allocator
//   engine/forward    — flood forwarder (one retain per fan-out)
//   engine/scheduler  — per-port transmit batch queues and the drain timer
//   engine/runtime    — TSC clock, CPU pinning, NUMA lookup, fatal exit
//   engine/config     — command line and HUB_* environment
//   network/          — NIC trait, AF_PACKET and virtual NICs, poll loop

pub mod engine;
pub mod network;
