//! LAN control plane.
//!
//! Remote controllers connect over TCP and send `\r\n`-terminated command
//! lines. Each line costs one unit of the client's per-period quota and one
//! unit of a pool shared by all clients; both refill on periodic timers.
//! Other threads steer the loop through a loopback UDP pipe
//! ([`CtrlHandle`]) and never touch its state directly.

mod client;
mod command;
mod server;

use std::io;

pub use client::{ClientId, ClientKind, ClientRegistry, ClientSession, MessageBuffer, QuotaExceeded};
pub use command::{
    error_reply, ok_reply, parse_command, temperature_line, CmdError, Command, CommandHandler,
    CtrlCommand, CtrlHandle, DefaultCommands, MAX_PIPE_COMMAND,
};
pub use server::{CtrlTimer, LanControl, Slot};

use crate::config::ConfigError;
use crate::runtime::timing::WheelError;

/// Start-up and pipe failures.
#[derive(Debug, thiserror::Error)]
pub enum CtrlError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("control pipe: {0}")]
    Pipe(#[source] io::Error),
    #[error("server socket: {0}")]
    Server(#[source] io::Error),
    #[error("client socket: {0}")]
    Client(#[source] io::Error),
    #[error("client limit reached")]
    Full,
    #[error(transparent)]
    Timers(#[from] WheelError),
    #[error("pipe command encoding: {0}")]
    Encode(#[from] postcard::Error),
    #[error("pipe command of {len} bytes exceeds {max}")]
    TooLarge { len: usize, max: usize },
}
