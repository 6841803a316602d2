//! Per-link connection state and the table of live links
//!
//! A connection exists only for locally-attached entities. Fanout never
//! closes a link in place: overflow and errors set the dead flag, and the
//! post-tick reaper does the actual teardown.

use crate::buffer::{ConnectionTiming, MsgBuf, Priority, RecvQueue, SendQueue};
use crate::entity::EntityId;
use crate::pool::Reclaim;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use uuid::Uuid;

/// What a link speaks: the long client dialect or the tokenized server one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkKind {
    #[default]
    Client,
    Server,
}

/// Registration steps still outstanding on an unregistered link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeNeeds(u8);

impl HandshakeNeeds {
    pub const NICK: u8 = 0x1;
    pub const USER: u8 = 0x2;
    pub const AUTH: u8 = 0x4;

    pub fn for_client() -> Self {
        Self(Self::NICK | Self::USER)
    }

    pub fn none() -> Self {
        Self(0)
    }

    pub fn needs(&self, req: u8) -> bool {
        self.0 & req != 0
    }

    pub fn satisfy(&mut self, req: u8) {
        self.0 &= !req;
    }

    pub fn complete(&self) -> bool {
        self.0 == 0
    }
}

impl Default for HandshakeNeeds {
    fn default() -> Self {
        Self::for_client()
    }
}

/// State of one local link
#[derive(Debug)]
pub struct Connection {
    pub id: Uuid,
    pub peer_addr: Option<SocketAddr>,
    /// The single entity this connection belongs to
    pub entity: Option<EntityId>,
    pub kind: LinkKind,
    pub recvq: RecvQueue,
    pub sendq: SendQueue,
    pub timing: ConnectionTiming,
    pub needs: HandshakeNeeds,
    /// Password presented before registration completed
    pub password: Option<String>,
    /// Nick claimed during the handshake
    pub pending_nick: Option<String>,
    /// USER parameters received during the handshake
    pub pending_user: Option<(String, String)>,
    /// Resolved hostname, when the lookup answered in time
    pub host: Option<String>,
    /// Most recent nick change, for pacing
    pub last_nick_change: Option<std::time::Instant>,
    /// Whether our own SERVER introduction already went down this link
    pub sent_server_intro: bool,
    /// Set instead of closing; the reaper tears the link down
    pub dead: Option<String>,
    /// Kicks the writer task after an enqueue
    writer_wake: Option<mpsc::UnboundedSender<()>>,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            peer_addr: None,
            entity: None,
            kind: LinkKind::Client,
            recvq: RecvQueue::new(8192),
            sendq: SendQueue::new(40960),
            timing: ConnectionTiming::new(90, 60),
            needs: HandshakeNeeds::for_client(),
            password: None,
            pending_nick: None,
            pending_user: None,
            host: None,
            last_nick_change: None,
            sent_server_intro: false,
            dead: None,
            writer_wake: None,
        }
    }
}

impl Connection {
    /// Prepare a recycled cell for a freshly-accepted socket.
    pub fn open(
        &mut self,
        peer_addr: SocketAddr,
        sendq_limit: usize,
        ping_freq: u64,
        registration_timeout: u64,
        writer_wake: mpsc::UnboundedSender<()>,
    ) {
        self.id = Uuid::new_v4();
        self.peer_addr = Some(peer_addr);
        self.sendq = SendQueue::new(sendq_limit);
        self.recvq = RecvQueue::new(8192);
        self.timing = ConnectionTiming::new(ping_freq, registration_timeout);
        self.needs = HandshakeNeeds::for_client();
        self.writer_wake = Some(writer_wake);
    }

    /// Adopt the quotas of the connection class the attached policy item
    /// belongs to; until then the link runs on the blanket defaults.
    pub fn apply_class(&mut self, sendq_limit: usize, ping_freq: u64) {
        self.sendq.set_max_bytes(sendq_limit);
        self.timing.ping_frequency = ping_freq;
    }

    pub fn is_dead(&self) -> bool {
        self.dead.is_some()
    }

    pub fn mark_dead(&mut self, reason: &str) {
        if self.dead.is_none() {
            self.dead = Some(reason.to_string());
            // wake the writer so its task notices and exits
            if let Some(ref wake) = self.writer_wake {
                let _ = wake.send(());
            }
        }
    }

    /// Queue a formatted message; overflow marks the link dead.
    pub fn enqueue(&mut self, msg: MsgBuf, priority: Priority) {
        if self.is_dead() {
            return;
        }
        if !self.sendq.push(msg, priority) {
            tracing::debug!(conn = %self.id, "output queue exceeded limit");
            self.mark_dead("SendQ exceeded");
            return;
        }
        if let Some(ref wake) = self.writer_wake {
            let _ = wake.send(());
        }
    }

    /// Release queued output and detach collaborators. Idempotent; the
    /// caller removes the record from the table.
    pub fn close(&mut self, reason: &str) {
        if self.dead.is_none() {
            self.dead = Some(reason.to_string());
        }
        self.sendq.clear();
        self.recvq.clear();
        self.writer_wake = None;
    }
}

impl Reclaim for Connection {
    fn reset(&mut self) {
        *self = Connection::default();
    }

    fn ready_for_release(&self) -> bool {
        self.entity.is_none() && self.sendq.is_empty() && self.writer_wake.is_none()
    }
}

/// All live local links, keyed by connection id
#[derive(Debug, Default)]
pub struct ConnectionTable {
    conns: DashMap<Uuid, Mutex<Connection>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self { conns: DashMap::new() }
    }

    pub fn insert(&self, conn: Connection) -> Uuid {
        let id = conn.id;
        self.conns.insert(id, Mutex::new(conn));
        id
    }

    pub fn remove(&self, id: Uuid) -> Option<Connection> {
        self.conns.remove(&id).map(|(_, m)| m.into_inner())
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.conns.contains_key(&id)
    }

    pub fn with_conn<R>(&self, id: Uuid, f: impl FnOnce(&mut Connection) -> R) -> Option<R> {
        self.conns.get(&id).map(|m| f(&mut m.lock()))
    }

    pub fn enqueue(&self, id: Uuid, msg: MsgBuf, priority: Priority) {
        self.with_conn(id, |c| c.enqueue(msg, priority));
    }

    pub fn mark_dead(&self, id: Uuid, reason: &str) {
        self.with_conn(id, |c| c.mark_dead(reason));
    }

    /// Pull up to `budget` bytes of output for the writer task.
    pub fn drain(&self, id: Uuid, budget: usize) -> Option<(Vec<u8>, bool)> {
        self.with_conn(id, |c| {
            let mut out = Vec::new();
            let res = c.sendq.drain_into(&mut out, budget);
            (out, res.empty)
        })
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.conns.iter().map(|e| *e.key()).collect()
    }

    /// Links flagged for teardown since the last sweep.
    pub fn reap_candidates(&self) -> Vec<Uuid> {
        self.conns
            .iter()
            .filter(|e| e.value().lock().is_dead())
            .map(|e| *e.key())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_conn(limit: usize) -> Connection {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut c = Connection::default();
        c.open("127.0.0.1:1234".parse().unwrap(), limit, 90, 60, tx);
        c
    }

    #[test]
    fn test_handshake_needs() {
        let mut needs = HandshakeNeeds::for_client();
        assert!(needs.needs(HandshakeNeeds::NICK));
        needs.satisfy(HandshakeNeeds::NICK);
        assert!(!needs.complete());
        needs.satisfy(HandshakeNeeds::USER);
        assert!(needs.complete());
    }

    #[test]
    fn test_sendq_overflow_marks_dead() {
        let mut c = open_conn(16);
        c.enqueue(MsgBuf::new("A".repeat(64)), Priority::Normal);
        assert_eq!(c.dead.as_deref(), Some("SendQ exceeded"));
    }

    #[test]
    fn test_enqueue_after_death_is_dropped() {
        let mut c = open_conn(4096);
        c.mark_dead("test");
        c.enqueue(MsgBuf::new("hello\r\n".to_string()), Priority::Normal);
        assert!(c.sendq.is_empty());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut c = open_conn(4096);
        c.enqueue(MsgBuf::new("hello\r\n".to_string()), Priority::Normal);
        c.close("going away");
        assert!(c.sendq.is_empty());
        c.close("again");
        assert_eq!(c.dead.as_deref(), Some("going away"));
    }

    #[test]
    fn test_table_round_trip() {
        let table = ConnectionTable::new();
        let id = table.insert(open_conn(4096));
        assert!(table.contains(id));
        table.enqueue(id, MsgBuf::new("PING :x\r\n".to_string()), Priority::Normal);
        let (bytes, empty) = table.drain(id, 4096).unwrap();
        assert_eq!(bytes, b"PING :x\r\n");
        assert!(empty);
        assert!(table.remove(id).is_some());
        assert!(!table.contains(id));
    }

    #[test]
    fn test_reap_candidates() {
        let table = ConnectionTable::new();
        let a = table.insert(open_conn(4096));
        let b = table.insert(open_conn(4096));
        table.mark_dead(b, "SendQ exceeded");
        let dead = table.reap_candidates();
        assert_eq!(dead, vec![b]);
        assert!(!dead.contains(&a));
    }
}
