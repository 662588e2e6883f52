//! Connected clients and their command budgets.

use core::fmt;
use std::net::SocketAddr;

use crate::runtime::iomux::IoKey;
use crate::runtime::timing::TimerId;

/// Client identifier; `0` addresses every client at once and is never
/// assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u32);

impl ClientId {
    pub const BROADCAST: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_broadcast(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// What a client is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    /// Remote controller: rate limited, receives broadcasts, removed on stop.
    Normal,
    /// Audio streaming peer: exempt from quota and broadcasts.
    Music,
}

/// Reassembly buffer for one client's byte stream.
#[derive(Debug)]
pub struct MessageBuffer {
    buf: Box<[u8]>,
    start: usize,
    len: usize,
}

impl MessageBuffer {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            len: 0,
        }
    }

    /// Free space to read into; commit what was written with
    /// [`commit`](Self::commit).
    pub fn spare(&mut self) -> &mut [u8] {
        &mut self.buf[self.len..]
    }

    pub fn commit(&mut self, n: usize) {
        self.len = (self.len + n).min(self.buf.len());
    }

    /// Buffered bytes not yet returned as lines.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.start..self.len]
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.start == 0 && self.len == self.buf.len()
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.len = 0;
    }

    /// Copies the next `delimiter`-terminated line (without the delimiter)
    /// into `out`. When no complete line is left the partial remainder is
    /// moved to the front and `false` is returned.
    pub fn pop_line(&mut self, delimiter: &[u8], out: &mut Vec<u8>) -> bool {
        let pending = &self.buf[self.start..self.len];
        match find(pending, delimiter) {
            Some(at) => {
                out.clear();
                out.extend_from_slice(&pending[..at]);
                self.start += at + delimiter.len();
                if self.start == self.len {
                    self.clear();
                }
                true
            }
            None => {
                if self.start > 0 {
                    self.buf.copy_within(self.start..self.len, 0);
                    self.len -= self.start;
                    self.start = 0;
                }
                false
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[derive(Debug)]
pub struct ClientSession {
    pub id: ClientId,
    pub addr: Option<SocketAddr>,
    pub kind: ClientKind,
    /// Registration of the client's socket.
    pub io: IoKey,
    /// Quota refill timer; `None` for exempt kinds.
    pub refill: Option<TimerId>,
    pub quota_remaining: u32,
    pub messages: MessageBuffer,
}

/// The command budget ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QuotaExceeded {
    #[error("client quota exhausted")]
    Client,
    #[error("shared quota exhausted")]
    Total,
}

/// Live sessions in accept order, plus the shared quota pool.
#[derive(Debug)]
pub struct ClientRegistry {
    sessions: Vec<ClientSession>,
    last_id: u32,
    max_clients: usize,
    quota_per_period: u32,
    total_quota: u32,
    total_remaining: u32,
}

impl ClientRegistry {
    #[must_use]
    pub fn new(max_clients: usize, quota_per_period: u32, total_quota: u32) -> Self {
        Self {
            sessions: Vec::with_capacity(max_clients),
            last_id: 0,
            max_clients,
            quota_per_period,
            total_quota,
            total_remaining: total_quota,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.sessions.len() >= self.max_clients
    }

    #[must_use]
    pub const fn quota_per_period(&self) -> u32 {
        self.quota_per_period
    }

    #[must_use]
    pub const fn total_remaining(&self) -> u32 {
        self.total_remaining
    }

    /// Hands out the next id, skipping the broadcast id on wrap-around.
    pub fn next_id(&mut self) -> ClientId {
        self.last_id = self.last_id.wrapping_add(1);
        if self.last_id == 0 {
            self.last_id = 1;
        }
        ClientId(self.last_id)
    }

    /// Adds a session with a full quota. The caller checks
    /// [`is_full`](Self::is_full) first.
    pub fn insert(
        &mut self,
        id: ClientId,
        addr: Option<SocketAddr>,
        kind: ClientKind,
        io: IoKey,
        refill: Option<TimerId>,
        message_capacity: usize,
    ) -> &mut ClientSession {
        debug_assert!(!self.is_full());
        self.sessions.push(ClientSession {
            id,
            addr,
            kind,
            io,
            refill,
            quota_remaining: self.quota_per_period,
            messages: MessageBuffer::with_capacity(message_capacity),
        });
        let last = self.sessions.len() - 1;
        &mut self.sessions[last]
    }

    pub fn remove(&mut self, id: ClientId) -> Option<ClientSession> {
        let at = self.sessions.iter().position(|s| s.id == id)?;
        Some(self.sessions.remove(at))
    }

    #[must_use]
    pub fn get(&self, id: ClientId) -> Option<&ClientSession> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut ClientSession> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientSession> {
        self.sessions.iter()
    }

    /// Ids of sessions of `kind`, in accept order.
    #[must_use]
    pub fn ids_of(&self, kind: ClientKind) -> Vec<ClientId> {
        self.sessions.iter().filter(|s| s.kind == kind).map(|s| s.id).collect()
    }

    /// Charges one command to `id` and to the shared pool. Exempt kinds and
    /// unknown ids are never charged.
    ///
    /// # Errors
    ///
    /// [`QuotaExceeded`] if either budget is already zero; nothing is
    /// charged then.
    pub fn consume(&mut self, id: ClientId) -> Result<(), QuotaExceeded> {
        let total = self.total_remaining;
        let Some(session) = self.sessions.iter_mut().find(|s| s.id == id) else {
            return Ok(());
        };
        if session.kind != ClientKind::Normal {
            return Ok(());
        }
        if session.quota_remaining == 0 {
            return Err(QuotaExceeded::Client);
        }
        if total == 0 {
            return Err(QuotaExceeded::Total);
        }
        session.quota_remaining -= 1;
        self.total_remaining -= 1;
        Ok(())
    }

    /// Restores a session's full per-period quota.
    pub fn refill(&mut self, id: ClientId) {
        let quota = self.quota_per_period;
        if let Some(session) = self.get_mut(id) {
            session.quota_remaining = quota;
        }
    }

    pub fn refill_total(&mut self) {
        self.total_remaining = self.total_quota;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WheelConfig;
    use crate::runtime::iomux::{IoInstance, IoMux, IoSource};

    fn io_key() -> IoKey {
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut mux: IoMux<(), ()> = IoMux::new(WheelConfig::default());
        mux.add(IoInstance::readable(IoSource::Unix(a), ())).unwrap()
    }

    fn registry_with(kind: ClientKind, quota: u32, total: u32) -> (ClientRegistry, ClientId) {
        let mut reg = ClientRegistry::new(4, quota, total);
        let id = reg.next_id();
        reg.insert(id, None, kind, io_key(), None, 64);
        (reg, id)
    }

    #[test]
    fn ids_skip_broadcast_on_wrap() {
        let mut reg = ClientRegistry::new(4, 1, 1);
        assert_eq!(reg.next_id(), ClientId::new(1));
        reg.last_id = u32::MAX;
        assert_eq!(reg.next_id(), ClientId::new(1));
        assert!(!ClientId::new(1).is_broadcast());
    }

    #[test]
    fn per_client_quota_rejects_then_refills() {
        let (mut reg, id) = registry_with(ClientKind::Normal, 3, 100);
        for _ in 0..3 {
            assert_eq!(reg.consume(id), Ok(()));
        }
        assert_eq!(reg.consume(id), Err(QuotaExceeded::Client));
        assert_eq!(reg.get(id).unwrap().quota_remaining, 0);
        assert_eq!(reg.total_remaining(), 97);

        reg.refill(id);
        assert_eq!(reg.consume(id), Ok(()));
    }

    #[test]
    fn shared_quota_limits_everyone() {
        let (mut reg, a) = registry_with(ClientKind::Normal, 10, 2);
        let b = reg.next_id();
        reg.insert(b, None, ClientKind::Normal, io_key(), None, 64);

        assert_eq!(reg.consume(a), Ok(()));
        assert_eq!(reg.consume(b), Ok(()));
        assert_eq!(reg.consume(a), Err(QuotaExceeded::Total));
        assert_eq!(reg.get(a).unwrap().quota_remaining, 9);

        reg.refill_total();
        assert_eq!(reg.consume(b), Ok(()));
    }

    #[test]
    fn music_clients_are_exempt() {
        let (mut reg, id) = registry_with(ClientKind::Music, 0, 0);
        assert_eq!(reg.consume(id), Ok(()));
        assert_eq!(reg.ids_of(ClientKind::Normal), vec![]);
        assert_eq!(reg.ids_of(ClientKind::Music), vec![id]);
    }

    #[test]
    fn registry_capacity_and_removal() {
        let mut reg = ClientRegistry::new(1, 1, 1);
        let id = reg.next_id();
        reg.insert(id, None, ClientKind::Normal, io_key(), None, 8);
        assert!(reg.is_full());
        assert!(reg.remove(id).is_some());
        assert!(reg.remove(id).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn lines_split_and_partial_kept() {
        let mut buf = MessageBuffer::with_capacity(32);
        let input = b"one\r\ntwo\r\nthr";
        buf.spare()[..input.len()].copy_from_slice(input);
        buf.commit(input.len());

        let mut line = Vec::new();
        assert!(buf.pop_line(b"\r\n", &mut line));
        assert_eq!(line, b"one");
        assert!(buf.pop_line(b"\r\n", &mut line));
        assert_eq!(line, b"two");
        assert!(!buf.pop_line(b"\r\n", &mut line));
        assert_eq!(buf.pending(), b"thr");

        buf.spare()[..4].copy_from_slice(b"ee\r\n");
        buf.commit(4);
        assert!(buf.pop_line(b"\r\n", &mut line));
        assert_eq!(line, b"three");
        assert!(buf.pending().is_empty());
    }

    #[test]
    fn delimiter_split_across_reads() {
        let mut buf = MessageBuffer::with_capacity(16);
        let mut line = Vec::new();
        buf.spare()[..3].copy_from_slice(b"ab\r");
        buf.commit(3);
        assert!(!buf.pop_line(b"\r\n", &mut line));
        buf.spare()[..1].copy_from_slice(b"\n");
        buf.commit(1);
        assert!(buf.pop_line(b"\r\n", &mut line));
        assert_eq!(line, b"ab");
    }

    #[test]
    fn full_without_delimiter_is_detected() {
        let mut buf = MessageBuffer::with_capacity(4);
        buf.spare().copy_from_slice(b"abcd");
        buf.commit(4);
        assert!(!buf.pop_line(b"\r\n", &mut Vec::new()));
        assert!(buf.is_full());
        buf.clear();
        assert_eq!(buf.spare().len(), 4);
    }
}
