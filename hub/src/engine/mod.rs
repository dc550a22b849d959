// FLOOD HUB — ENGINE MODULE
// What the hub does to a frame: pool, forward, batch, schedule.
// Network owns the ports and the loop that polls them.

pub mod config;
pub mod forward;
pub mod mbuf;
pub mod runtime;
pub mod scheduler;
