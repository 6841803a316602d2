//! Bounded history of recently-departed users for WHOWAS

use crate::utils::string::casefold;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::VecDeque;

/// What remains of a user once they are gone
#[derive(Debug, Clone)]
pub struct WhowasEntry {
    pub nick: String,
    pub username: String,
    pub host: String,
    pub realname: String,
    pub server: String,
    pub departed_at: DateTime<Utc>,
}

/// Fixed-size ring of departed users, evicted in insertion order
#[derive(Debug)]
pub struct Whowas {
    ring: RwLock<VecDeque<WhowasEntry>>,
    max_entries: usize,
}

impl Whowas {
    pub fn new(max_entries: usize) -> Self {
        Self {
            ring: RwLock::new(VecDeque::with_capacity(max_entries)),
            max_entries,
        }
    }

    pub fn add(&self, entry: WhowasEntry) {
        let mut ring = self.ring.write();
        if ring.len() == self.max_entries {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    /// Most-recent-first entries matching `nick`, at most `limit` of them
    /// (no limit when zero).
    pub fn query(&self, nick: &str, limit: usize) -> Vec<WhowasEntry> {
        let folded = casefold(nick);
        let ring = self.ring.read();
        let mut out: Vec<WhowasEntry> = ring
            .iter()
            .rev()
            .filter(|e| casefold(&e.nick) == folded)
            .cloned()
            .collect();
        if limit > 0 {
            out.truncate(limit);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.ring.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.read().is_empty()
    }
}
