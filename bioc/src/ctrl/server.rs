use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};

use super::client::{ClientId, ClientKind, ClientRegistry};
use super::command::{
    error_reply, parse_command, CmdError, CommandHandler, CtrlCommand, CtrlHandle, MAX_PIPE_COMMAND,
};
use super::CtrlError;
use crate::config::{LanConfig, WheelConfig};
use crate::net::{bind_listener, set_keepalive};
use crate::runtime::iomux::{IoHandler, IoInstance, IoKey, IoMux, IoSource};
use crate::runtime::timing::{Duration, Millis, NonZeroDuration, TimerId, TimerWheel};
use crate::trace::{debug, error, info, warn};

/// Upper bound on one readiness wait, so a stop request is noticed even
/// with no timer due.
const MAX_WAIT: Duration<Millis> = Duration::from_millis(100);

/// What a registered descriptor is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Pipe,
    Listener,
    Client(ClientId),
}

/// Timer events of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlTimer {
    ClientRefill(ClientId),
    TotalRefill,
}

/// The control loop: pipe, listener, clients and their refill timers.
pub struct LanControl<H> {
    mux: IoMux<Slot, CtrlTimer>,
    state: CtrlState<H>,
}

struct CtrlState<H> {
    config: LanConfig,
    registry: ClientRegistry,
    handler: H,
    listener: Option<IoKey>,
    server_addr: Option<SocketAddr>,
    pipe_addr: SocketAddr,
    refill_ticks: u64,
    line: Vec<u8>,
    pipe_buf: Box<[u8]>,
    destroyed: bool,
}

fn interval_ticks(interval: std::time::Duration, tick: NonZeroDuration<Millis>) -> u64 {
    let ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
    ms.div_ceil(tick.get().as_u64()).max(1)
}

impl<H: CommandHandler> LanControl<H> {
    /// Binds the pipe and the client listener and arms the shared quota
    /// refill.
    ///
    /// # Errors
    ///
    /// Any socket, configuration or timer failure; nothing keeps running.
    pub fn start(config: LanConfig, handler: H) -> Result<Self, CtrlError> {
        let wheel = WheelConfig::default().with_capacity(NonZeroUsize::MIN.saturating_add(config.max_clients));
        Self::start_with_timers(config, handler, TimerWheel::new(wheel))
    }

    /// Like [`start`](Self::start), around an existing wheel.
    ///
    /// # Errors
    ///
    /// See [`start`](Self::start).
    pub fn start_with_timers(
        config: LanConfig,
        handler: H,
        timers: TimerWheel<CtrlTimer>,
    ) -> Result<Self, CtrlError> {
        config.validate()?;
        let mut mux = IoMux::with_timers(timers);
        mux.set_max_wait(Some(MAX_WAIT));

        let pipe = UdpSocket::bind(config.ctrl_addr).map_err(CtrlError::Pipe)?;
        let pipe_addr = pipe.local_addr().map_err(CtrlError::Pipe)?;
        mux.add(IoInstance::readable(IoSource::Datagram(pipe), Slot::Pipe))
            .map_err(CtrlError::Pipe)?;
        debug!(%pipe_addr, "control pipe bound");

        let refill_ticks = interval_ticks(config.quota_refill_interval, mux.timers().tick());
        let total = mux.timers_mut().create(CtrlTimer::TotalRefill, true)?;
        mux.timers_mut().add(total, refill_ticks);

        let mut state = CtrlState {
            registry: ClientRegistry::new(config.max_clients, config.quota_per_period, config.total_quota),
            handler,
            listener: None,
            server_addr: None,
            pipe_addr,
            refill_ticks,
            line: Vec::with_capacity(config.message_capacity),
            pipe_buf: vec![0u8; MAX_PIPE_COMMAND].into_boxed_slice(),
            destroyed: false,
            config,
        };
        state.open_listener(&mut mux)?;
        Ok(Self { mux, state })
    }

    /// A new pipe sender for this loop.
    ///
    /// # Errors
    ///
    /// [`CtrlError::Pipe`] if the sending socket cannot be created.
    pub fn handle(&self) -> Result<CtrlHandle, CtrlError> {
        CtrlHandle::connect(self.state.pipe_addr)
    }

    #[must_use]
    pub fn pipe_addr(&self) -> SocketAddr {
        self.state.pipe_addr
    }

    /// Address the listener is bound to, `None` while stopped.
    #[must_use]
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.state.server_addr
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state.listener.is_some()
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state.destroyed
    }

    #[must_use]
    pub fn clients(&self) -> &ClientRegistry {
        &self.state.registry
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.state.handler
    }

    /// Adopts an already connected stream, e.g. a music peer.
    ///
    /// # Errors
    ///
    /// [`CtrlError::Full`] at the client limit, or the socket/timer error.
    pub fn add_client(&mut self, stream: TcpStream, kind: ClientKind) -> Result<ClientId, CtrlError> {
        let addr = stream.peer_addr().ok();
        self.state.admit(&mut self.mux, stream, addr, kind)
    }

    /// One wake of the loop.
    pub fn turn(&mut self) -> usize {
        self.mux.turn(&mut self.state)
    }

    /// Runs until `stop` is set or a `Destroy` command arrives.
    pub fn run_until(&mut self, stop: &AtomicBool) {
        info!(server = ?self.state.server_addr, "lan control running");
        while !stop.load(Ordering::Acquire) && !self.state.destroyed {
            self.mux.turn(&mut self.state);
        }
        info!("lan control finished");
    }
}

impl<H: CommandHandler> CtrlState<H> {
    fn open_listener(&mut self, mux: &mut IoMux<Slot, CtrlTimer>) -> Result<(), CtrlError> {
        let listener =
            bind_listener(self.config.server_addr, self.config.listen_backlog).map_err(CtrlError::Server)?;
        let local = listener.local_addr().map_err(CtrlError::Server)?;
        let key = mux
            .add(IoInstance::readable(IoSource::Listener(listener), Slot::Listener))
            .map_err(CtrlError::Server)?;
        self.listener = Some(key);
        self.server_addr = Some(local);
        info!(%local, "lan control started");
        Ok(())
    }

    fn stop(&mut self, mux: &mut IoMux<Slot, CtrlTimer>) {
        let Some(key) = self.listener.take() else {
            warn!("lan control is not started");
            return;
        };
        mux.del(key);
        self.server_addr = None;
        for id in self.registry.ids_of(ClientKind::Normal) {
            self.free_client(mux, id);
        }
        info!("lan control stopped");
    }

    fn admit(
        &mut self,
        mux: &mut IoMux<Slot, CtrlTimer>,
        stream: TcpStream,
        addr: Option<SocketAddr>,
        kind: ClientKind,
    ) -> Result<ClientId, CtrlError> {
        if self.registry.is_full() {
            return Err(CtrlError::Full);
        }
        set_keepalive(&stream, &self.config.keepalive).map_err(CtrlError::Client)?;

        let id = self.registry.next_id();
        let io = mux
            .add(IoInstance::readable(IoSource::Stream(stream), Slot::Client(id)))
            .map_err(CtrlError::Client)?;
        let refill = match kind {
            ClientKind::Music => None,
            ClientKind::Normal => match mux.timers_mut().create(CtrlTimer::ClientRefill(id), true) {
                Ok(timer) => {
                    mux.timers_mut().add(timer, self.refill_ticks);
                    Some(timer)
                }
                Err(e) => {
                    mux.del(io);
                    return Err(e.into());
                }
            },
        };
        self.registry
            .insert(id, addr, kind, io, refill, self.config.message_capacity);
        info!(%id, ?addr, ?kind, clients = self.registry.len(), "client admitted");
        Ok(id)
    }

    /// Writes a whole line or drops the client: a line cut short by a full
    /// socket buffer must never be followed by more data.
    fn deliver(&mut self, mux: &mut IoMux<Slot, CtrlTimer>, key: IoKey, id: ClientId, bytes: &[u8]) {
        if let Err(e) = send(mux, key, bytes) {
            warn!(%id, %e, "send failed, dropping client");
            self.free_client(mux, id);
        }
    }

    fn free_client(&mut self, mux: &mut IoMux<Slot, CtrlTimer>, id: ClientId) {
        let Some(session) = self.registry.remove(id) else {
            return;
        };
        mux.del(session.io);
        if let Some(timer) = session.refill {
            mux.timers_mut().destroy(timer);
        }
        info!(%id, clients = self.registry.len(), "client freed");
    }

    fn accept(&mut self, mux: &mut IoMux<Slot, CtrlTimer>, key: IoKey) {
        let accepted = match mux.get(key).map(|i| &i.source) {
            Some(IoSource::Listener(listener)) => listener.accept(),
            _ => return,
        };
        let (stream, addr) = match accepted {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!(%e, "accept failed");
                return;
            }
        };
        if self.registry.is_full() {
            warn!(%addr, "client limit reached, rejecting");
            return;
        }
        if let Err(e) = self.admit(mux, stream, Some(addr), ClientKind::Normal) {
            warn!(%addr, %e, "client not admitted");
        }
    }

    fn on_client(&mut self, mux: &mut IoMux<Slot, CtrlTimer>, key: IoKey, id: ClientId) {
        loop {
            let Some(session) = self.registry.get_mut(id) else {
                return;
            };
            let Some(IoSource::Stream(stream)) = mux.get(key).map(|i| &i.source) else {
                return;
            };
            let mut stream: &TcpStream = stream;
            match stream.read(session.messages.spare()) {
                Ok(0) => {
                    info!(%id, "peer closed");
                    self.free_client(mux, id);
                    return;
                }
                Ok(n) => session.messages.commit(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(%id, %e, "read failed");
                    self.free_client(mux, id);
                    return;
                }
            }
            self.drain_lines(mux, key, id);
        }
    }

    fn drain_lines(&mut self, mux: &mut IoMux<Slot, CtrlTimer>, key: IoKey, id: ClientId) {
        let delimiter = self.config.delimiter;
        let mut line = std::mem::take(&mut self.line);
        loop {
            let Some(session) = self.registry.get_mut(id) else {
                break;
            };
            if !session.messages.pop_line(delimiter, &mut line) {
                if session.messages.is_full() {
                    error!(%id, "message too long, discarding");
                    session.messages.clear();
                }
                break;
            }
            if let Some(reply) = self.handle_line(id, &line) {
                self.deliver(mux, key, id, reply.as_bytes());
            }
        }
        self.line = line;
    }

    fn handle_line(&mut self, id: ClientId, line: &[u8]) -> Option<String> {
        let command = match parse_command(line) {
            Ok(command) => command,
            Err(e) => {
                debug!(%id, "unparsable command");
                return Some(error_reply(0, e));
            }
        };
        if let Err(e) = self.registry.consume(id) {
            debug!(%id, %e, "dropping command");
            return Some(error_reply(command.id, CmdError::QuotaExceeded));
        }
        let session = self.registry.get(id)?;
        match self.handler.handle(session, &command) {
            Ok(reply) => reply,
            Err(e) => Some(error_reply(command.id, e)),
        }
    }

    fn on_pipe(&mut self, mux: &mut IoMux<Slot, CtrlTimer>, key: IoKey) {
        while !self.destroyed {
            let received = match mux.get(key).map(|i| &i.source) {
                Some(IoSource::Datagram(socket)) => socket.recv(&mut self.pipe_buf),
                _ => return,
            };
            let n = match received {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(%e, "pipe receive failed");
                    return;
                }
            };
            match CtrlCommand::decode(&self.pipe_buf[..n]) {
                Ok(command) => self.apply(mux, command),
                Err(e) => warn!(%e, "malformed pipe command"),
            }
        }
    }

    fn apply(&mut self, mux: &mut IoMux<Slot, CtrlTimer>, command: CtrlCommand) {
        match command {
            CtrlCommand::Start => {
                if self.listener.is_some() {
                    warn!("lan control already started");
                } else if let Err(e) = self.open_listener(mux) {
                    error!(%e, "lan control start failed");
                }
            }
            CtrlCommand::Stop => self.stop(mux),
            CtrlCommand::Destroy => {
                self.stop(mux);
                self.destroyed = true;
            }
            CtrlCommand::Data { client, contents } => {
                let target = ClientId::new(client);
                if target.is_broadcast() {
                    for id in self.registry.ids_of(ClientKind::Normal) {
                        if let Some(io) = self.registry.get(id).map(|s| s.io) {
                            self.deliver(mux, io, id, &contents);
                        }
                    }
                } else if let Some(io) = self.registry.get(target).map(|s| s.io) {
                    self.deliver(mux, io, target, &contents);
                } else {
                    info!(id = %target, "client gone");
                }
            }
        }
    }
}

fn send(mux: &IoMux<Slot, CtrlTimer>, key: IoKey, bytes: &[u8]) -> io::Result<()> {
    match mux.get(key).map(|i| &i.source) {
        Some(IoSource::Stream(stream)) => {
            let mut stream: &TcpStream = stream;
            stream.write_all(bytes)
        }
        _ => Ok(()),
    }
}

impl<H: CommandHandler> IoHandler<Slot, CtrlTimer> for CtrlState<H> {
    fn on_readable(&mut self, mux: &mut IoMux<Slot, CtrlTimer>, key: IoKey) {
        match mux.get(key).map(|i| i.data) {
            Some(Slot::Pipe) => self.on_pipe(mux, key),
            Some(Slot::Listener) => self.accept(mux, key),
            Some(Slot::Client(id)) => self.on_client(mux, key, id),
            None => {}
        }
    }

    fn on_error(&mut self, mux: &mut IoMux<Slot, CtrlTimer>, key: IoKey) {
        match mux.get(key).map(|i| i.data) {
            Some(Slot::Client(id)) => {
                warn!(%id, "socket error");
                self.free_client(mux, id);
            }
            Some(Slot::Listener) => {
                error!("listener failed");
                self.stop(mux);
            }
            Some(Slot::Pipe) => {
                error!("control pipe failed");
                mux.del(key);
            }
            None => {}
        }
    }

    fn on_timer(&mut self, _mux: &mut IoMux<Slot, CtrlTimer>, _id: TimerId, event: CtrlTimer) {
        match event {
            CtrlTimer::ClientRefill(id) => {
                debug!(%id, "quota refill");
                self.registry.refill(id);
            }
            CtrlTimer::TotalRefill => {
                debug!("shared quota refill");
                self.registry.refill_total();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader};
    use std::time::Duration as StdDuration;

    use super::*;
    use crate::ctrl::{ok_reply, Command, ClientSession, DefaultCommands};
    use crate::runtime::timing::ManualClock;

    fn control() -> LanControl<DefaultCommands> {
        LanControl::start(LanConfig::loopback(), DefaultCommands::new()).unwrap()
    }

    fn connect(
        ctrl: &mut LanControl<impl CommandHandler>,
        admitted: bool,
    ) -> (TcpStream, BufReader<TcpStream>) {
        let stream = TcpStream::connect(ctrl.server_addr().unwrap()).unwrap();
        stream.set_read_timeout(Some(StdDuration::from_secs(5))).unwrap();
        let before = ctrl.clients().len();
        let turns = if admitted { 50 } else { 3 };
        for _ in 0..turns {
            ctrl.turn();
            if ctrl.clients().len() > before {
                break;
            }
        }
        let reader = BufReader::new(stream.try_clone().unwrap());
        (stream, reader)
    }

    /// Turns the loop until `stream` has something to read.
    fn wait_readable(ctrl: &mut LanControl<impl CommandHandler>, stream: &TcpStream) {
        stream.set_nonblocking(true).unwrap();
        let mut probe = [0u8; 1];
        for _ in 0..100 {
            ctrl.turn();
            if stream.peek(&mut probe).is_ok() {
                break;
            }
        }
        stream.set_nonblocking(false).unwrap();
    }

    fn exchange(
        ctrl: &mut LanControl<impl CommandHandler>,
        stream: &mut TcpStream,
        reader: &mut BufReader<TcpStream>,
        line: &str,
    ) -> String {
        stream.write_all(line.as_bytes()).unwrap();
        wait_readable(ctrl, reader.get_ref());
        let mut reply = String::new();
        reader.read_line(&mut reply).unwrap();
        reply
    }

    #[test]
    fn interval_rounds_up_to_whole_ticks() {
        let tick = NonZeroDuration::from_millis(10).unwrap();
        assert_eq!(interval_ticks(StdDuration::from_secs(60), tick), 6000);
        assert_eq!(interval_ticks(StdDuration::from_millis(15), tick), 2);
        assert_eq!(interval_ticks(StdDuration::ZERO, tick), 1);
    }

    #[test]
    fn accepts_and_replies() {
        let mut ctrl = control();
        let (mut stream, mut reader) = connect(&mut ctrl, true);
        assert_eq!(ctrl.clients().len(), 1);

        let reply = exchange(&mut ctrl, &mut stream, &mut reader, "{\"id\":9, \"method\":\"ping\"}\r\n");
        assert_eq!(reply, ok_reply(9));

        let reply = exchange(&mut ctrl, &mut stream, &mut reader, "garbage\r\n");
        assert_eq!(reply, error_reply(0, CmdError::InvalidCommand));
    }

    #[test]
    fn handler_errors_become_error_replies() {
        let handler = |_: &ClientSession, _: &Command<'_>| -> Result<Option<String>, CmdError> {
            Err(CmdError::MethodNotSupported)
        };
        let mut ctrl = LanControl::start(LanConfig::loopback(), handler).unwrap();
        let (mut stream, mut reader) = connect(&mut ctrl, true);
        let reply = exchange(&mut ctrl, &mut stream, &mut reader, "{\"id\":4}\r\n");
        assert_eq!(reply, error_reply(4, CmdError::MethodNotSupported));
    }

    #[test]
    fn client_limit_rejects_extra_connections() {
        let mut ctrl = LanControl::start(LanConfig::loopback().with_max_clients(1), DefaultCommands::new()).unwrap();
        let (_a, _ra) = connect(&mut ctrl, true);
        let (_b, mut rb) = connect(&mut ctrl, false);
        assert_eq!(ctrl.clients().len(), 1);

        // The rejected socket is closed by the server.
        let mut buf = String::new();
        assert_eq!(rb.read_line(&mut buf).unwrap(), 0);
    }

    #[test]
    fn peer_close_frees_session() {
        let mut ctrl = control();
        let (stream, reader) = connect(&mut ctrl, true);
        drop(reader);
        drop(stream);
        for _ in 0..50 {
            ctrl.turn();
            if ctrl.clients().is_empty() {
                break;
            }
        }
        assert!(ctrl.clients().is_empty());
    }

    #[test]
    fn pipe_data_reaches_clients_and_stop_drops_them() {
        let mut ctrl = control();
        let handle = ctrl.handle().unwrap();
        let (_stream, mut reader) = connect(&mut ctrl, true);

        handle.send_to(ClientId::BROADCAST, "hello\r\n").unwrap();
        ctrl.turn();
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "hello\r\n");

        handle.send(&CtrlCommand::Stop).unwrap();
        ctrl.turn();
        assert!(!ctrl.is_started());
        assert!(ctrl.clients().is_empty());

        handle.send(&CtrlCommand::Start).unwrap();
        ctrl.turn();
        assert!(ctrl.is_started());

        handle.send(&CtrlCommand::Destroy).unwrap();
        ctrl.run_until(&AtomicBool::new(false));
        assert!(ctrl.is_destroyed());
    }

    #[test]
    fn quota_exhausts_and_refills_on_timer() {
        let clock = ManualClock::starting_at(0);
        let wheel = TimerWheel::with_clock(WheelConfig::default(), clock.clone());
        let config = LanConfig::loopback().with_quota(2, std::time::Duration::from_secs(1));
        let mut ctrl = LanControl::start_with_timers(config, DefaultCommands::new(), wheel).unwrap();
        let (mut stream, mut reader) = connect(&mut ctrl, true);

        for id in 1..=2 {
            let reply = exchange(&mut ctrl, &mut stream, &mut reader, &format!("{{\"id\":{id}}}\r\n"));
            assert_eq!(reply, ok_reply(id));
        }
        let reply = exchange(&mut ctrl, &mut stream, &mut reader, "{\"id\":3}\r\n");
        assert_eq!(reply, error_reply(3, CmdError::QuotaExceeded));

        clock.advance(Duration::from_millis(1000));
        ctrl.turn();
        let reply = exchange(&mut ctrl, &mut stream, &mut reader, "{\"id\":4}\r\n");
        assert_eq!(reply, ok_reply(4));
    }

    #[test]
    fn client_that_stops_reading_is_dropped_instead_of_truncated() {
        let mut ctrl = control();
        let handle = ctrl.handle().unwrap();
        let (stream, _reader) = connect(&mut ctrl, true);
        rustix::net::sockopt::set_socket_recv_buffer_size(&stream, 1024).unwrap();
        let io = ctrl.clients().iter().next().unwrap().io;
        if let Some(IoSource::Stream(server_side)) = ctrl.mux.get(io).map(|i| &i.source) {
            rustix::net::sockopt::set_socket_send_buffer_size(server_side, 1024).unwrap();
        }

        let chunk = vec![b'x'; MAX_PIPE_COMMAND / 2];
        for _ in 0..2000 {
            if ctrl.clients().is_empty() {
                break;
            }
            handle.send_to(ClientId::BROADCAST, chunk.clone()).unwrap();
            ctrl.turn();
        }
        assert!(ctrl.clients().is_empty());
    }
}
