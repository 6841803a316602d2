//! Buffer management for send and receive queues
//!
//! Outgoing messages are refcounted immutable blobs ([`MsgBuf`]) so a line
//! formatted once can sit on many links' queues without copying. Each link
//! carries two queues; the urgent queue is always drained first.

use crate::message::MAX_LINE;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A fully-formatted, immutable wire message shared between output queues
#[derive(Debug, Clone)]
pub struct MsgBuf(Arc<[u8]>);

impl MsgBuf {
    pub fn new(line: String) -> Self {
        Self(Arc::from(line.into_bytes().into_boxed_slice()))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of queues (and callers) currently holding this message
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

/// Placement class for an outgoing message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    /// Overtakes all queued normal traffic on the next drain
    Urgent,
}

/// Outcome of a [`SendQueue::drain_into`] call
#[derive(Debug, PartialEq, Eq)]
pub struct DrainResult {
    pub bytes_written: usize,
    pub empty: bool,
}

/// Dual-priority outgoing queue with a byte high-water mark
#[derive(Debug)]
pub struct SendQueue {
    urgent: VecDeque<MsgBuf>,
    normal: VecDeque<MsgBuf>,
    /// Bytes of the current front message already written out
    front_offset: usize,
    /// Whether the partially-written front is on the normal queue
    front_is_normal: bool,
    queued_bytes: usize,
    max_bytes: usize,
}

impl SendQueue {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            urgent: VecDeque::new(),
            normal: VecDeque::new(),
            front_offset: 0,
            front_is_normal: false,
            queued_bytes: 0,
            max_bytes,
        }
    }

    /// Append a message. Returns false when the queue has exceeded its
    /// high-water mark; the caller is expected to mark the link dead.
    pub fn push(&mut self, msg: MsgBuf, priority: Priority) -> bool {
        self.queued_bytes += msg.len();
        match priority {
            Priority::Urgent => self.urgent.push_back(msg),
            Priority::Normal => self.normal.push_back(msg),
        }
        self.queued_bytes <= self.max_bytes
    }

    /// Write up to `budget` bytes into `out`. A partially-written line is
    /// finished before anything else so lines are never interleaved, then
    /// the urgent queue is drained ahead of the normal queue.
    pub fn drain_into(&mut self, out: &mut Vec<u8>, budget: usize) -> DrainResult {
        let mut written = 0;

        // Finish a half-sent normal line before letting urgent traffic out.
        if self.front_offset > 0 && self.front_is_normal {
            written += self.drain_queue_front(true, out, budget);
        }

        while written < budget && !self.urgent.is_empty() {
            self.front_is_normal = false;
            written += self.drain_queue_front(false, out, budget - written);
        }
        while written < budget && !self.normal.is_empty() && self.urgent.is_empty() {
            self.front_is_normal = true;
            written += self.drain_queue_front(true, out, budget - written);
        }

        DrainResult { bytes_written: written, empty: self.is_empty() }
    }

    fn drain_queue_front(&mut self, normal: bool, out: &mut Vec<u8>, budget: usize) -> usize {
        let queue = if normal { &mut self.normal } else { &mut self.urgent };
        let front = match queue.front() {
            Some(f) => f,
            None => return 0,
        };
        let remaining = &front.bytes()[self.front_offset..];
        let take = remaining.len().min(budget);
        out.extend_from_slice(&remaining[..take]);
        self.queued_bytes -= take;
        if take == remaining.len() {
            queue.pop_front();
            self.front_offset = 0;
        } else {
            self.front_offset += take;
        }
        take
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.urgent.is_empty() && self.normal.is_empty()
    }

    pub fn len(&self) -> usize {
        self.urgent.len() + self.normal.len()
    }

    pub fn over_limit(&self) -> bool {
        self.queued_bytes > self.max_bytes
    }

    pub fn clear(&mut self) {
        self.urgent.clear();
        self.normal.clear();
        self.front_offset = 0;
        self.queued_bytes = 0;
    }

    pub fn set_max_bytes(&mut self, max_bytes: usize) {
        self.max_bytes = max_bytes;
    }
}

/// Incoming byte buffer with CRLF framing
#[derive(Debug)]
pub struct RecvQueue {
    buffer: Vec<u8>,
    max_bytes: usize,
}

impl RecvQueue {
    pub fn new(max_bytes: usize) -> Self {
        Self { buffer: Vec::new(), max_bytes }
    }

    /// Append raw bytes read off the socket. Returns false when the buffer
    /// limit would be exceeded (flood; caller drops the connection).
    pub fn append(&mut self, data: &[u8]) -> bool {
        if self.buffer.len() + data.len() > self.max_bytes {
            return false;
        }
        self.buffer.extend_from_slice(data);
        true
    }

    /// Pop one complete line off the buffer, without its terminator.
    /// `Ok(None)` means no complete line yet. A line longer than the
    /// protocol maximum (terminator included) is rejected and discarded.
    pub fn consume_line(&mut self) -> crate::Result<Option<String>> {
        let nl = match self.buffer.iter().position(|&b| b == b'\n') {
            Some(i) => i,
            None => {
                if self.buffer.len() > MAX_LINE {
                    self.buffer.clear();
                    return Err(crate::Error::MessageParse("line too long".to_string()));
                }
                return Ok(None);
            }
        };
        let raw: Vec<u8> = self.buffer.drain(..=nl).collect();
        if raw.len() > MAX_LINE {
            return Err(crate::Error::MessageParse("line too long".to_string()));
        }
        let mut end = raw.len() - 1;
        if end > 0 && raw[end - 1] == b'\r' {
            end -= 1;
        }
        let line = String::from_utf8_lossy(&raw[..end]).into_owned();
        Ok(Some(line))
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Per-connection timing: activity, ping scheduling, registration deadline
#[derive(Debug, Clone)]
pub struct ConnectionTiming {
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub last_ping_sent: Option<Instant>,
    pub unanswered_pings: u32,
    pub ping_frequency: u64,
    pub registration_timeout: u64,
}

impl ConnectionTiming {
    pub fn new(ping_frequency: u64, registration_timeout: u64) -> Self {
        let now = Instant::now();
        Self {
            connected_at: now,
            last_activity: now,
            last_ping_sent: None,
            unanswered_pings: 0,
            ping_frequency,
            registration_timeout,
        }
    }

    pub fn update_activity(&mut self) {
        self.last_activity = Instant::now();
        self.unanswered_pings = 0;
        self.last_ping_sent = None;
    }

    pub fn record_ping_sent(&mut self) {
        self.last_ping_sent = Some(Instant::now());
        self.unanswered_pings += 1;
    }

    /// Quiet for a full ping interval and no ping outstanding
    pub fn should_send_ping(&self) -> bool {
        self.last_ping_sent.is_none()
            && self.last_activity.elapsed() >= Duration::from_secs(self.ping_frequency)
    }

    /// A ping went unanswered for another full interval
    pub fn ping_timed_out(&self) -> bool {
        match self.last_ping_sent {
            Some(sent) => sent.elapsed() >= Duration::from_secs(self.ping_frequency),
            None => false,
        }
    }

    /// An unregistered connection exceeded its handshake deadline
    pub fn registration_timed_out(&self) -> bool {
        self.connected_at.elapsed() >= Duration::from_secs(self.registration_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(s: &str) -> MsgBuf {
        MsgBuf::new(s.to_string())
    }

    #[test]
    fn test_fifo_within_class() {
        let mut q = SendQueue::new(1024);
        q.push(buf("one\r\n"), Priority::Normal);
        q.push(buf("two\r\n"), Priority::Normal);
        let mut out = Vec::new();
        let res = q.drain_into(&mut out, 1024);
        assert_eq!(out, b"one\r\ntwo\r\n");
        assert!(res.empty);
    }

    #[test]
    fn test_urgent_overtakes_queued_normal() {
        let mut q = SendQueue::new(64 * 1024);
        for i in 0..50 {
            q.push(buf(&format!("PRIVMSG #ops :line {}\r\n", i)), Priority::Normal);
        }
        q.push(buf("KILL victim :reason\r\n"), Priority::Urgent);
        let mut out = Vec::new();
        q.drain_into(&mut out, 22);
        assert!(out.starts_with(b"KILL victim :reason\r\n"));
    }

    #[test]
    fn test_partial_line_is_never_interleaved() {
        let mut q = SendQueue::new(1024);
        q.push(buf("AAAAAAAAAA\r\n"), Priority::Normal);
        let mut out = Vec::new();
        q.drain_into(&mut out, 4);
        assert_eq!(out, b"AAAA");
        q.push(buf("URGENT\r\n"), Priority::Urgent);
        let mut rest = Vec::new();
        q.drain_into(&mut rest, 1024);
        assert_eq!(rest, b"AAAAAA\r\nURGENT\r\n");
    }

    #[test]
    fn test_high_water_mark() {
        let mut q = SendQueue::new(10);
        assert!(q.push(buf("short\r\n"), Priority::Normal));
        assert!(!q.push(buf("overflowing\r\n"), Priority::Normal));
        assert!(q.over_limit());
    }

    #[test]
    fn test_msgbuf_sharing() {
        let m = buf("JOIN #ops\r\n");
        let mut a = SendQueue::new(1024);
        let mut b = SendQueue::new(1024);
        a.push(m.clone(), Priority::Normal);
        b.push(m.clone(), Priority::Normal);
        assert_eq!(m.refcount(), 3);
        a.clear();
        assert_eq!(m.refcount(), 2);
    }

    #[test]
    fn test_recvq_framing() {
        let mut r = RecvQueue::new(4096);
        assert!(r.append(b"NICK al"));
        assert_eq!(r.consume_line().unwrap(), None);
        assert!(r.append(b"ice\r\nUSER a 0 * :A\r\n"));
        assert_eq!(r.consume_line().unwrap(), Some("NICK alice".to_string()));
        assert_eq!(r.consume_line().unwrap(), Some("USER a 0 * :A".to_string()));
        assert_eq!(r.consume_line().unwrap(), None);
    }

    #[test]
    fn test_recvq_line_length_boundary() {
        // 510 payload + CRLF accepted
        let mut r = RecvQueue::new(4096);
        let mut line = "A".repeat(510);
        line.push_str("\r\n");
        assert!(r.append(line.as_bytes()));
        assert!(r.consume_line().unwrap().is_some());

        // 511 payload + CRLF rejected
        let mut r = RecvQueue::new(4096);
        let mut line = "A".repeat(511);
        line.push_str("\r\n");
        assert!(r.append(line.as_bytes()));
        assert!(r.consume_line().is_err());
    }

    #[test]
    fn test_timing_ping_cycle() {
        let mut t = ConnectionTiming::new(120, 60);
        assert!(!t.should_send_ping());
        t.record_ping_sent();
        assert_eq!(t.unanswered_pings, 1);
        assert!(!t.ping_timed_out());
        t.update_activity();
        assert_eq!(t.unanswered_pings, 0);
    }
}
