//! bioc daemon.
//!
//! Runs the request dispatcher and the LAN control loop, and optionally
//! decodes frames from a serial or SPI byte source.
//!
//! # Usage
//!
//! ```sh
//! bioc-daemon --listen 0.0.0.0:55443 --source /dev/ttyUSB0 --link uart
//! ```
//!
//! Without `--source` the daemon serves LAN clients until killed. With a
//! source it stops once the source reaches end of file; `-` reads stdin.

use std::fs::File;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bioc::config::{ConfigError, DispatcherConfig, LanConfig};
use bioc::ctrl::{CtrlCommand, CtrlError, CtrlHandle, DefaultCommands, LanControl};
use bioc::frame::{self, opcode, Frame, FrameContext, FrameLayout, HandlerTable};
use bioc::runtime::dispatch::{
    self, DispatchError, Dispatcher, ErrorCode, PeripheralEvent, PeripheralSource,
    PeripheralTopic, Poster, Request, RequestKind, TemperatureReading,
};
use clap::{Parser, ValueEnum};

/// Bytes requested per read from the frame source.
const READ_CHUNK: usize = 128;

/// Offset of the temperature channels inside an SPI temperature payload.
const TEMPERATURE_OFFSET: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Link {
    Uart,
    Spi,
}

#[derive(Debug, Parser)]
#[command(name = "bioc-daemon", version, about = "Event and control core daemon")]
struct Args {
    /// Address the LAN control listener binds to.
    #[arg(long, default_value = "0.0.0.0:55443")]
    listen: SocketAddr,

    /// Loopback address of the internal control pipe.
    #[arg(long, default_value = "127.0.0.1:43210")]
    pipe: SocketAddr,

    /// Concurrent LAN clients.
    #[arg(long, default_value_t = 4)]
    max_clients: usize,

    /// Commands each client may send per refill period.
    #[arg(long, default_value_t = 60)]
    quota: u32,

    /// Quota refill period in seconds.
    #[arg(long, default_value_t = 60)]
    quota_period: u64,

    /// In-flight request slots.
    #[arg(long, default_value_t = 5)]
    pool: usize,

    /// Request FIFO depth.
    #[arg(long, default_value_t = 10)]
    queue: usize,

    /// Frame byte source: a device or file path, or `-` for stdin.
    #[arg(long)]
    source: Option<PathBuf>,

    /// Framing of the byte source.
    #[arg(long, value_enum, default_value_t = Link::Uart)]
    link: Link,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "bioc=info")]
    log: String,
}

#[derive(Debug, thiserror::Error)]
enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Ctrl(#[from] CtrlError),
    #[error("frame source: {0}")]
    Source(#[source] io::Error),
    #[error("lan control thread: {0}")]
    Spawn(#[source] io::Error),
}

fn main() {
    let args = Args::parse();
    bioc::init_tracing_with(&args.log);
    if let Err(e) = run(args) {
        eprintln!("bioc-daemon: {e}");
        std::process::exit(1);
    }
}

fn nonzero(field: &'static str, value: usize) -> Result<NonZeroUsize, ConfigError> {
    NonZeroUsize::new(value).ok_or(ConfigError::Zero { field })
}

fn run(args: Args) -> Result<(), DaemonError> {
    let lan_config = LanConfig::default()
        .with_server_addr(args.listen)
        .with_ctrl_addr(args.pipe)
        .with_max_clients(args.max_clients)
        .with_quota(args.quota, Duration::from_secs(args.quota_period));
    lan_config.validate()?;
    let dispatch_config = DispatcherConfig::default()
        .with_pool_capacity(nonzero("pool", args.pool)?)
        .with_queue_depth(nonzero("queue", args.queue)?);

    let mut lan = LanControl::start(lan_config, DefaultCommands::new())?;
    let ctrl = lan.handle()?;

    let dispatcher = Dispatcher::spawn(dispatch_config, request_handlers(ctrl.clone()))?;
    *lan.handler_mut() = DefaultCommands::forwarding_to(dispatcher.poster());

    eprintln!(
        "bioc-daemon: serving on {}",
        lan.server_addr().map_or_else(|| "-".to_owned(), |a| a.to_string())
    );

    let stop = Arc::new(AtomicBool::new(false));
    let lan_stop = Arc::clone(&stop);
    let lan_thread = thread::Builder::new()
        .name("bioc-lan".into())
        .spawn(move || lan.run_until(&lan_stop))
        .map_err(DaemonError::Spawn)?;

    let fed = match &args.source {
        Some(path) => feed_source(path, args.link, &dispatcher.poster()),
        None => {
            let _ = lan_thread.join();
            return Ok(());
        }
    };

    eprintln!("bioc-daemon: source finished, shutting down");
    if let Err(e) = ctrl.send(&CtrlCommand::Destroy) {
        eprintln!("bioc-daemon: {e}");
        stop.store(true, std::sync::atomic::Ordering::Release);
    }
    let _ = lan_thread.join();
    dispatcher.shutdown();
    fed
}

fn request_handlers(ctrl: CtrlHandle) -> dispatch::HandlerTable<()> {
    dispatch::HandlerTable::new()
        .on(RequestKind::Temperature, move |_, request, _| {
            let Request::Temperature(reading) = request else {
                return ErrorCode::Invalid;
            };
            match ctrl.report_temperature(reading) {
                Ok(()) => ErrorCode::Ok,
                Err(_) => ErrorCode::General,
            }
        })
        .on(RequestKind::Peripheral, |_, request, _| {
            eprintln!("bioc-daemon: {request:?}");
            ErrorCode::Ok
        })
        .on(RequestKind::RawFrame, |_, request, _| {
            eprintln!("bioc-daemon: {request:?}");
            ErrorCode::Ok
        })
}

fn frame_handlers(link: Link, poster: &Poster) -> HandlerTable {
    let mut table = HandlerTable::new();
    match link {
        Link::Uart => {
            table
                .register(opcode::STATE_REPORT, frame::forward_to(poster.clone()))
                .register(opcode::CONFIG_REPORT, frame::forward_to(poster.clone()));
        }
        Link::Spi => {
            let temps = poster.clone();
            let booting = poster.clone();
            table
                .register(opcode::spi::TEMPERATURE, move |f: Frame<'_>| {
                    let reading = f
                        .payload
                        .get(TEMPERATURE_OFFSET..)
                        .and_then(TemperatureReading::from_le_bytes);
                    if let Some(reading) = reading {
                        let _ = temps.post(Request::Temperature(reading), None);
                    }
                })
                .register(opcode::spi::CMD_BOOTING, move |f: Frame<'_>| {
                    let words: Vec<i32> = f.payload.iter().map(|&b| i32::from(b)).collect();
                    let event = PeripheralEvent::new(PeripheralSource::Lcd, PeripheralTopic::Booting)
                        .with_data(&words);
                    let _ = booting.post(Request::Peripheral(event), None);
                })
                .register(opcode::spi::DEV_STATUS, frame::forward_to(poster.clone()));
        }
    }
    table
}

fn feed_source(path: &PathBuf, link: Link, poster: &Poster) -> Result<(), DaemonError> {
    let mut reader: Box<dyn Read> = if path.as_os_str() == "-" {
        Box::new(io::stdin().lock())
    } else {
        Box::new(File::open(path).map_err(DaemonError::Source)?)
    };
    let layout = match link {
        Link::Uart => FrameLayout::UART,
        Link::Spi => FrameLayout::SPI,
    };
    let mut ctx = FrameContext::new(layout)?;
    let mut handlers = frame_handlers(link, poster);
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => {
                ctx.feed(&buf[..n], &mut handlers);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(DaemonError::Source(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;

    use super::*;

    #[test]
    fn only_wired_requests_have_handlers() {
        let pipe = UdpSocket::bind("127.0.0.1:0").unwrap();
        pipe.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let ctrl = CtrlHandle::connect(pipe.local_addr().unwrap()).unwrap();
        let (poster, mut worker) = dispatch::channel(DispatcherConfig::default(), request_handlers(ctrl));

        poster.post(Request::GotIp, None).unwrap();
        assert_eq!(worker.turn(Some(Duration::ZERO)), Some(ErrorCode::General));

        poster.post(Request::Temperature(TemperatureReading([1.0; 6])), None).unwrap();
        assert_eq!(worker.turn(Some(Duration::ZERO)), Some(ErrorCode::Ok));
        let mut buf = [0u8; 512];
        let n = pipe.recv(&mut buf).unwrap();
        assert!(matches!(CtrlCommand::decode(&buf[..n]).unwrap(), CtrlCommand::Data { client: 0, .. }));
    }
}
