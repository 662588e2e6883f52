//! Socket setup helpers on top of `rustix`.
//!
//! The loops use plain `std::net` sockets for I/O; this module covers the
//! options `std` does not expose: listen backlog, keepalive probing and
//! non-blocking mode on arbitrary descriptors.

pub mod socket;

pub use socket::{bind_listener, set_keepalive, set_nonblocking};
