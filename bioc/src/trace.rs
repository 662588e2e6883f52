//! Logging facade for the event core.
//!
//! With the `tracing` feature (on by default) the crate logs through
//! [`tracing`]; without it every log macro expands to nothing, which is what
//! the constrained builds want.

/// Installs a stderr subscriber filtered by `RUST_LOG`, falling back to
/// `bioc=info`.
///
/// Safe to call more than once; later calls are ignored.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    init_tracing_with("bioc=info");
}

/// Like [`init_tracing`], with an explicit fallback directive used when
/// `RUST_LOG` is unset or unparsable.
#[cfg(feature = "tracing")]
pub fn init_tracing_with(default_directive: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(not(feature = "tracing"))]
pub fn init_tracing_with(_default_directive: &str) {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! noop {
    ($($arg:tt)*) => {{}};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use {noop as debug, noop as error, noop as info, noop as trace, noop as warn};
