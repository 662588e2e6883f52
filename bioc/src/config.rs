//! Tunables for the loops.
//!
//! Defaults mirror the device firmware: 10 ms ticks, a five-slot request
//! pool in front of a ten-deep FIFO, and a LAN control plane that admits
//! four clients at sixty commands per minute each.
//!
//! All structs follow the same shape: `Default` gives the device profile,
//! named presets cover the other deployments, and `with_*` setters adjust
//! single fields.

use core::num::NonZeroUsize;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use crate::runtime::timing::{Millis, NonZeroDuration};

/// Device tick length.
pub const MS_PER_TICK: u64 = 10;

const fn nz(n: usize) -> NonZeroUsize {
    match NonZeroUsize::new(n) {
        Some(v) => v,
        None => NonZeroUsize::MIN,
    }
}

const fn tick_ms(ms: u64) -> NonZeroDuration<Millis> {
    match NonZeroDuration::from_millis(ms) {
        Some(t) => t,
        None => NonZeroDuration::new(core::num::NonZeroU64::MIN),
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be non-zero")]
    Zero { field: &'static str },
    #[error("{field} ({value}) exceeds {limit}")]
    TooLarge {
        field: &'static str,
        value: usize,
        limit: usize,
    },
}

/// Timer wheel sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WheelConfig {
    /// Length of one tick; delays passed to `add` are in ticks.
    ///
    /// **Default**: 10 ms
    pub tick: NonZeroDuration<Millis>,
    /// Maximum number of timers the loop may create.
    ///
    /// **Default**: 64
    pub capacity: NonZeroUsize,
}

impl WheelConfig {
    /// One-millisecond ticks, handy when delays are naturally milliseconds.
    #[must_use]
    pub const fn millisecond() -> Self {
        Self {
            tick: tick_ms(1),
            capacity: nz(64),
        }
    }

    #[must_use]
    pub const fn with_tick(mut self, tick: NonZeroDuration<Millis>) -> Self {
        self.tick = tick;
        self
    }

    #[must_use]
    pub const fn with_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.capacity = capacity;
        self
    }
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self {
            tick: tick_ms(MS_PER_TICK),
            capacity: nz(64),
        }
    }
}

/// Request dispatcher sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Maximum requests in flight (posted but not yet completed).
    ///
    /// **Default**: 5
    pub pool_capacity: NonZeroUsize,
    /// Depth of the FIFO between producers and the worker.
    ///
    /// **Default**: 10
    pub queue_depth: NonZeroUsize,
    pub wheel: WheelConfig,
}

impl DispatcherConfig {
    /// Larger pool for hosts that are not memory constrained.
    #[must_use]
    pub const fn host() -> Self {
        Self {
            pool_capacity: nz(64),
            queue_depth: nz(128),
            wheel: WheelConfig {
                tick: tick_ms(MS_PER_TICK),
                capacity: nz(256),
            },
        }
    }

    #[must_use]
    pub const fn with_pool_capacity(mut self, pool_capacity: NonZeroUsize) -> Self {
        self.pool_capacity = pool_capacity;
        self
    }

    #[must_use]
    pub const fn with_queue_depth(mut self, queue_depth: NonZeroUsize) -> Self {
        self.queue_depth = queue_depth;
        self
    }

    #[must_use]
    pub const fn with_wheel(mut self, wheel: WheelConfig) -> Self {
        self.wheel = wheel;
        self
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pool_capacity: nz(5),
            queue_depth: nz(10),
            wheel: WheelConfig::default(),
        }
    }
}

/// TCP keepalive probing applied to accepted LAN clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub idle: Duration,
    pub interval: Duration,
    pub count: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(10),
            interval: Duration::from_secs(2),
            count: 3,
        }
    }
}

/// LAN control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanConfig {
    /// TCP listen address for clients.
    ///
    /// **Default**: 0.0.0.0:55443
    pub server_addr: SocketAddr,
    /// Loopback UDP address of the internal command pipe.
    ///
    /// **Default**: 127.0.0.1:43210
    pub ctrl_addr: SocketAddr,
    pub listen_backlog: i32,
    /// **Default**: 4
    pub max_clients: usize,
    /// Commands a normal client may issue per refill interval.
    ///
    /// **Default**: 60
    pub quota_per_period: u32,
    /// **Default**: 60 s
    pub quota_refill_interval: Duration,
    /// Shared budget across all clients per refill interval.
    pub total_quota: u32,
    /// Per-client line reassembly buffer.
    ///
    /// **Default**: 1024 bytes
    pub message_capacity: usize,
    pub keepalive: KeepaliveConfig,
    /// Line terminator for both directions.
    pub delimiter: &'static [u8],
}

impl LanConfig {
    /// Global budget the device derives from the per-client limits:
    /// `max_clients * quota * 60 / 100`.
    #[must_use]
    pub const fn derived_total_quota(max_clients: usize, quota_per_period: u32) -> u32 {
        let product = (max_clients as u64) * (quota_per_period as u64) * 60 / 100;
        if product > u32::MAX as u64 {
            u32::MAX
        } else {
            product as u32
        }
    }

    /// Ephemeral loopback ports for tests and side-by-side instances.
    #[must_use]
    pub fn loopback() -> Self {
        Self {
            server_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)),
            ctrl_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_server_addr(mut self, addr: SocketAddr) -> Self {
        self.server_addr = addr;
        self
    }

    #[must_use]
    pub fn with_ctrl_addr(mut self, addr: SocketAddr) -> Self {
        self.ctrl_addr = addr;
        self
    }

    /// Also recomputes the global budget from the new limit.
    #[must_use]
    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self.total_quota = Self::derived_total_quota(max_clients, self.quota_per_period);
        self
    }

    /// Also recomputes the global budget from the new quota.
    #[must_use]
    pub fn with_quota(mut self, quota_per_period: u32, refill_interval: Duration) -> Self {
        self.quota_per_period = quota_per_period;
        self.quota_refill_interval = refill_interval;
        self.total_quota = Self::derived_total_quota(self.max_clients, quota_per_period);
        self
    }

    #[must_use]
    pub const fn with_total_quota(mut self, total_quota: u32) -> Self {
        self.total_quota = total_quota;
        self
    }

    #[must_use]
    pub const fn with_message_capacity(mut self, capacity: usize) -> Self {
        self.message_capacity = capacity;
        self
    }

    /// Checks the limits that would otherwise surface as odd runtime behavior.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_clients == 0 {
            return Err(ConfigError::Zero {
                field: "max_clients",
            });
        }
        if self.message_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "message_capacity",
            });
        }
        if self.quota_refill_interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "quota_refill_interval",
            });
        }
        if self.delimiter.is_empty() {
            return Err(ConfigError::Zero { field: "delimiter" });
        }
        if self.delimiter.len() >= self.message_capacity {
            return Err(ConfigError::TooLarge {
                field: "delimiter",
                value: self.delimiter.len(),
                limit: self.message_capacity,
            });
        }
        Ok(())
    }
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 55443)),
            ctrl_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 43210)),
            listen_backlog: 2,
            max_clients: 4,
            quota_per_period: 60,
            quota_refill_interval: Duration::from_secs(60),
            total_quota: Self::derived_total_quota(4, 60),
            message_capacity: 1024,
            keepalive: KeepaliveConfig::default(),
            delimiter: b"\r\n",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_defaults() {
        let d = DispatcherConfig::default();
        assert_eq!(d.pool_capacity.get(), 5);
        assert_eq!(d.queue_depth.get(), 10);
        assert_eq!(d.wheel.tick.get().as_u64(), MS_PER_TICK);

        let lan = LanConfig::default();
        assert_eq!(lan.server_addr.port(), 55443);
        assert_eq!(lan.ctrl_addr.port(), 43210);
        assert_eq!(lan.total_quota, 144);
        assert!(lan.validate().is_ok());
    }

    #[test]
    fn quota_setters_rederive_total() {
        let lan = LanConfig::default()
            .with_max_clients(2)
            .with_quota(10, Duration::from_secs(1));
        assert_eq!(lan.total_quota, 12);
        assert_eq!(lan.with_total_quota(500).total_quota, 500);
    }

    #[test]
    fn validate_rejects_degenerate_limits() {
        assert_eq!(
            LanConfig::default().with_max_clients(0).validate(),
            Err(ConfigError::Zero {
                field: "max_clients"
            })
        );
        assert!(matches!(
            LanConfig::default().with_message_capacity(2).validate(),
            Err(ConfigError::TooLarge { field: "delimiter", .. })
        ));
    }

    #[test]
    fn host_preset_is_roomier() {
        let host = DispatcherConfig::host();
        let dev = DispatcherConfig::default();
        assert!(host.pool_capacity > dev.pool_capacity);
        assert!(host.queue_depth > dev.queue_depth);
    }
}
