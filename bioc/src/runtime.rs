//! Event loops and their building blocks.
//!
//! - `timing`: typed time, the clock seam and the per-loop timer wheel.
//! - `iomux`: readiness multiplexer driving a wheel, for loops that own
//!   sockets or other descriptors.
//! - `dispatch`: bounded request mailbox plus the worker loop that drains
//!   it, for loops fed by other threads.

pub mod dispatch;
pub mod iomux;
pub mod timing;
