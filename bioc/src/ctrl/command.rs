//! Line commands from clients, replies to them, and the internal pipe.

use std::fmt::Write as _;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::client::{ClientId, ClientSession};
use super::CtrlError;
use crate::runtime::dispatch::{
    PeripheralEvent, PeripheralSource, PeripheralTopic, Poster, Request, TemperatureReading,
};
use crate::trace::{debug, info};

/// Largest encoded pipe command.
pub const MAX_PIPE_COMMAND: usize = 2048;

/// Failure reported back to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[repr(u8)]
pub enum CmdError {
    #[error("invalid command")]
    InvalidCommand = 1,
    #[error("method not supported")]
    MethodNotSupported,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("out of memory")]
    OutOfMemory,
    #[error("client quota exceeded")]
    QuotaExceeded,
    #[error("fail")]
    Fail,
}

impl CmdError {
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// A line that parsed as a command object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command<'a> {
    /// Request id echoed in the reply; 0 when absent.
    pub id: u32,
    pub method: Option<&'a str>,
    /// The whole line.
    pub raw: &'a [u8],
}

/// Accepts `{...}` lines, pulling out a leading `"id"` and a `"method"`
/// string if present.
///
/// # Errors
///
/// [`CmdError::InvalidCommand`] for anything that is not a braced object.
pub fn parse_command(line: &[u8]) -> Result<Command<'_>, CmdError> {
    let trimmed = line.trim_ascii();
    if trimmed.len() < 2 || trimmed[0] != b'{' || trimmed[trimmed.len() - 1] != b'}' {
        return Err(CmdError::InvalidCommand);
    }
    Ok(Command {
        id: leading_id(&trimmed[1..]).unwrap_or(0),
        method: string_field(trimmed, b"\"method\""),
        raw: line,
    })
}

fn leading_id(body: &[u8]) -> Option<u32> {
    let rest = body.trim_ascii_start().strip_prefix(b"\"id\"")?;
    let rest = rest.trim_ascii_start().strip_prefix(b":")?.trim_ascii_start();
    let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();
    core::str::from_utf8(&rest[..digits]).ok()?.parse().ok()
}

fn string_field<'a>(line: &'a [u8], key: &[u8]) -> Option<&'a str> {
    let at = line.windows(key.len()).position(|w| w == key)?;
    let rest = line[at + key.len()..].trim_ascii_start().strip_prefix(b":")?;
    let rest = rest.trim_ascii_start().strip_prefix(b"\"")?;
    let end = rest.iter().position(|&b| b == b'"')?;
    core::str::from_utf8(&rest[..end]).ok()
}

/// `{"id":N, "error":{"code":-1, "message":"..."}}` plus the delimiter.
#[must_use]
pub fn error_reply(id: u32, err: CmdError) -> String {
    format!("{{\"id\":{id}, \"error\":{{\"code\":-1, \"message\":\"{err}\"}}}}\r\n")
}

/// `{"id":N, "result":["ok"]}` plus the delimiter.
#[must_use]
pub fn ok_reply(id: u32) -> String {
    format!("{{\"id\":{id}, \"result\":[\"ok\"]}}\r\n")
}

/// `{"id":N, "temp":[c0, ..., c5]}` plus the delimiter.
#[must_use]
pub fn temperature_line(id: u32, reading: &TemperatureReading) -> String {
    let mut line = format!("{{\"id\":{id}, \"temp\":[");
    for (i, t) in reading.0.iter().enumerate() {
        if i > 0 {
            line.push_str(", ");
        }
        let _ = write!(line, "{t:.6}");
    }
    line.push_str("]}\r\n");
    line
}

/// Turns an admitted command into a reply line.
pub trait CommandHandler {
    /// Returns the complete reply (delimiter included), or `None` to stay
    /// silent.
    ///
    /// # Errors
    ///
    /// A [`CmdError`] is sent to the client as an error reply.
    fn handle(&mut self, client: &ClientSession, command: &Command<'_>) -> Result<Option<String>, CmdError>;
}

/// Acknowledges every command and, when wired to a dispatcher, forwards it
/// as an LCD network event carrying one byte per data word.
#[derive(Debug, Default, Clone)]
pub struct DefaultCommands {
    poster: Option<Poster>,
}

impl DefaultCommands {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn forwarding_to(poster: Poster) -> Self {
        Self { poster: Some(poster) }
    }
}

impl CommandHandler for DefaultCommands {
    fn handle(&mut self, client: &ClientSession, command: &Command<'_>) -> Result<Option<String>, CmdError> {
        debug!(client = %client.id, id = command.id, method = ?command.method, "command");
        if let Some(poster) = &self.poster {
            let words: Vec<i32> = command.raw.iter().map(|&b| i32::from(b)).collect();
            let event = PeripheralEvent::new(PeripheralSource::Lcd, PeripheralTopic::Net).with_data(&words);
            poster
                .post(Request::Peripheral(event), None)
                .map_err(|_| CmdError::Fail)?;
        }
        Ok(Some(ok_reply(command.id)))
    }
}

impl<F> CommandHandler for F
where
    F: FnMut(&ClientSession, &Command<'_>) -> Result<Option<String>, CmdError>,
{
    fn handle(&mut self, client: &ClientSession, command: &Command<'_>) -> Result<Option<String>, CmdError> {
        self(client, command)
    }
}

/// Messages accepted on the internal pipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CtrlCommand {
    /// Open the client listener.
    Start,
    /// Close the listener and drop every normal client.
    Stop,
    /// Stop, then leave the loop.
    Destroy,
    /// Send `contents` verbatim to one client, or to every normal client
    /// for id 0.
    Data { client: u32, contents: Vec<u8> },
}

impl CtrlCommand {
    /// # Errors
    ///
    /// [`CtrlError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, CtrlError> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// # Errors
    ///
    /// [`CtrlError::Encode`] for a malformed datagram.
    pub fn decode(bytes: &[u8]) -> Result<Self, CtrlError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Sending end of the pipe; usable from any thread.
#[derive(Debug, Clone)]
pub struct CtrlHandle {
    socket: Arc<UdpSocket>,
    reports: Arc<AtomicU32>,
}

impl CtrlHandle {
    /// Connects a fresh loopback socket to the pipe at `target`.
    ///
    /// # Errors
    ///
    /// [`CtrlError::Pipe`] if the socket cannot be created.
    pub fn connect(target: SocketAddr) -> Result<Self, CtrlError> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).map_err(CtrlError::Pipe)?;
        socket.connect(target).map_err(CtrlError::Pipe)?;
        Ok(Self {
            socket: Arc::new(socket),
            reports: Arc::new(AtomicU32::new(0)),
        })
    }

    /// # Errors
    ///
    /// [`CtrlError::TooLarge`] for oversized data, [`CtrlError::Pipe`] if
    /// the datagram cannot be sent.
    pub fn send(&self, command: &CtrlCommand) -> Result<(), CtrlError> {
        let bytes = command.encode()?;
        if bytes.len() > MAX_PIPE_COMMAND {
            return Err(CtrlError::TooLarge {
                len: bytes.len(),
                max: MAX_PIPE_COMMAND,
            });
        }
        info!(?command, "pipe command");
        self.socket.send(&bytes).map_err(CtrlError::Pipe)?;
        Ok(())
    }

    /// Sends `contents` to one client.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn send_to(&self, client: ClientId, contents: impl Into<Vec<u8>>) -> Result<(), CtrlError> {
        self.send(&CtrlCommand::Data {
            client: client.get(),
            contents: contents.into(),
        })
    }

    /// Broadcasts a temperature line to every normal client.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn report_temperature(&self, reading: &TemperatureReading) -> Result<(), CtrlError> {
        let id = self.reports.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        self.send_to(ClientId::BROADCAST, temperature_line(id, reading))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_reply_format() {
        assert_eq!(
            error_reply(7, CmdError::QuotaExceeded),
            "{\"id\":7, \"error\":{\"code\":-1, \"message\":\"client quota exceeded\"}}\r\n"
        );
        assert_eq!(CmdError::QuotaExceeded.code(), 5);
        assert_eq!(CmdError::Fail.to_string(), "fail");
    }

    #[test]
    fn ok_reply_format() {
        assert_eq!(ok_reply(3), "{\"id\":3, \"result\":[\"ok\"]}\r\n");
    }

    #[test]
    fn parses_id_and_method() {
        let cmd = parse_command(b"{\"id\": 42, \"method\":\"set_power\", \"params\":[\"on\"]}").unwrap();
        assert_eq!(cmd.id, 42);
        assert_eq!(cmd.method, Some("set_power"));

        let cmd = parse_command(b"  {\"method\" : \"toggle\"} ").unwrap();
        assert_eq!(cmd.id, 0);
        assert_eq!(cmd.method, Some("toggle"));
    }

    #[test]
    fn rejects_non_objects() {
        assert_eq!(parse_command(b"hello"), Err(CmdError::InvalidCommand));
        assert_eq!(parse_command(b""), Err(CmdError::InvalidCommand));
        assert_eq!(parse_command(b"{"), Err(CmdError::InvalidCommand));
    }

    #[test]
    fn temperature_line_lists_all_channels() {
        let line = temperature_line(1, &TemperatureReading([1.0, 2.5, 0.0, -3.0, 4.0, 5.0]));
        assert_eq!(
            line,
            "{\"id\":1, \"temp\":[1.000000, 2.500000, 0.000000, -3.000000, 4.000000, 5.000000]}\r\n"
        );
    }

    #[test]
    fn pipe_commands_survive_encoding() {
        let cmd = CtrlCommand::Data {
            client: 0,
            contents: b"hi\r\n".to_vec(),
        };
        assert_eq!(CtrlCommand::decode(&cmd.encode().unwrap()).unwrap(), cmd);
        assert!(CtrlCommand::decode(&[0xFF]).is_err());
    }

    #[test]
    fn handle_sends_datagrams() {
        let pipe = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let handle = CtrlHandle::connect(pipe.local_addr().unwrap()).unwrap();
        handle.send(&CtrlCommand::Start).unwrap();

        let mut buf = [0u8; 64];
        let n = pipe.recv(&mut buf).unwrap();
        assert_eq!(CtrlCommand::decode(&buf[..n]).unwrap(), CtrlCommand::Start);

        let big = CtrlCommand::Data {
            client: 1,
            contents: vec![0; MAX_PIPE_COMMAND],
        };
        assert!(matches!(handle.send(&big), Err(CtrlError::TooLarge { .. })));
    }
}
