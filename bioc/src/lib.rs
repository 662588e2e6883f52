//! Event and control core for a small device.
//!
//! - [`runtime::timing`]: timer wheel evaluated against an explicitly
//!   refreshed clock
//! - [`runtime::iomux`]: `poll(2)` loop bounded by the wheel's next expiry
//! - [`runtime::dispatch`]: bounded request mailbox with its own worker and
//!   wheel
//! - [`frame`]: CRC-checked frame recovery from noisy byte streams
//! - [`ctrl`]: LAN control plane with per-client and shared quotas

pub mod config;
pub mod ctrl;
pub mod frame;
pub mod mpsc;
pub mod net;
pub mod runtime;
mod trace;

pub use trace::{init_tracing, init_tracing_with};
