//! Network participant records: users, servers, and the local server
//!
//! A single polymorphic record describes every named participant, local or
//! remote. The registry owns the records; everything else refers to them
//! by [`EntityId`].

use crate::config::ConfItem;
use crate::numnick::Numnick;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Stable identifier for an entity, valid for its lifetime in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

/// Where an entity is in its lifecycle, and what kind of thing it is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStatus {
    /// Freshly accepted, nothing received yet
    Unregistered,
    /// NICK and USER received, admission pending
    Unknown,
    /// A peer in the middle of the server handshake
    HandshakingServer,
    /// A user attached to some other server
    User,
    /// A user attached to this server
    LocalUser,
    /// A server elsewhere in the tree
    Server,
    /// A directly-linked peer server
    LocalServer,
    /// A network service
    Service,
    /// This server's own record
    Me,
    /// Killed; awaiting teardown
    Killed,
}

/// Server-notice categories operators may subscribe to
pub mod sno {
    pub const SNO_OLDSNO: u32 = 0x1;
    pub const SNO_SERVKILL: u32 = 0x2;
    pub const SNO_OPERKILL: u32 = 0x4;
    pub const SNO_NETWORK: u32 = 0x8;
    pub const SNO_REHASH: u32 = 0x10;
    pub const SNO_GLINE: u32 = 0x20;
    pub const SNO_CONNEXIT: u32 = 0x40;
    /// Default subscription handed to a fresh +s oper
    pub const SNO_DEFAULT_OPER: u32 = SNO_OLDSNO | SNO_SERVKILL | SNO_OPERKILL | SNO_NETWORK | SNO_REHASH;
}

/// User-specific state
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub username: String,
    pub realname: String,
    /// Display host, possibly cloaked; the literal IP until DNS resolves
    pub host: String,
    pub modes: HashSet<char>,
    pub channels: HashSet<String>,
    /// Server-notice subscription mask (meaningful with +s)
    pub snomask: u32,
    pub away: Option<String>,
    /// Earliest time another new message target is permitted
    pub next_target: DateTime<Utc>,
    /// Targets recently messaged; talking to these is never paced
    pub recent_targets: Vec<String>,
}

impl UserRecord {
    pub fn new(username: String, realname: String, host: String) -> Self {
        Self {
            username,
            realname,
            host,
            modes: HashSet::new(),
            channels: HashSet::new(),
            snomask: 0,
            away: None,
            next_target: Utc::now(),
            recent_targets: Vec::new(),
        }
    }
}

/// Server-specific state
#[derive(Debug, Clone, Default)]
pub struct ServerRecord {
    pub hop_count: u32,
    pub description: String,
    /// 'h' hub, 's' service
    pub flags: HashSet<char>,
    /// Name of the Connect block that authorized this link
    pub conf_name: Option<String>,
    /// Directly-downstream servers
    pub children: Vec<EntityId>,
}

/// One named participant in the network
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    pub status: EntityStatus,
    /// Nick or server name
    pub name: String,
    pub numnick: Option<Numnick>,
    /// The directly-attached neighbor this entity is reached through;
    /// self for local entities
    pub upstream: EntityId,
    pub first_seen: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub user: Option<UserRecord>,
    pub server: Option<ServerRecord>,
    /// Connection record key, present only for locally-attached entities
    pub connection: Option<Uuid>,
    /// Policy items this (local) entity is attached to
    pub confs: Vec<Arc<ConfItem>>,
    /// Fanout dedup epoch; see the send engine
    pub mark: u64,
}

impl Entity {
    pub fn new(status: EntityStatus, name: String) -> Self {
        let id = EntityId::new();
        let now = Utc::now();
        Self {
            id,
            status,
            name,
            numnick: None,
            upstream: id,
            first_seen: now,
            last_active: now,
            user: None,
            server: None,
            connection: None,
            confs: Vec::new(),
            mark: 0,
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self.status, EntityStatus::User | EntityStatus::LocalUser)
    }

    pub fn is_server(&self) -> bool {
        matches!(
            self.status,
            EntityStatus::Server | EntityStatus::LocalServer | EntityStatus::Me
        )
    }

    pub fn is_local(&self) -> bool {
        matches!(
            self.status,
            EntityStatus::LocalUser
                | EntityStatus::LocalServer
                | EntityStatus::Unregistered
                | EntityStatus::Unknown
                | EntityStatus::HandshakingServer
        )
    }

    pub fn is_registered(&self) -> bool {
        matches!(
            self.status,
            EntityStatus::User
                | EntityStatus::LocalUser
                | EntityStatus::Server
                | EntityStatus::LocalServer
                | EntityStatus::Service
                | EntityStatus::Me
        )
    }

    pub fn has_mode(&self, mode: char) -> bool {
        self.user.as_ref().map_or(false, |u| u.modes.contains(&mode))
    }

    /// Operator in either the global (+o) or local (+O) sense
    pub fn is_oper(&self) -> bool {
        self.has_mode('o') || self.has_mode('O')
    }

    pub fn is_deaf(&self) -> bool {
        self.has_mode('d')
    }

    pub fn is_invisible(&self) -> bool {
        self.has_mode('i')
    }

    /// The nick!user@host form used as a client-dialect prefix
    pub fn client_prefix(&self) -> crate::message::Prefix {
        match &self.user {
            Some(u) => crate::message::Prefix::User {
                nick: self.name.clone(),
                user: u.username.clone(),
                host: u.host.clone(),
            },
            None => crate::message::Prefix::Server(self.name.clone()),
        }
    }

    /// The compact numeric prefix used on server links; falls back to the
    /// textual name for entities introduced without one.
    pub fn server_prefix(&self) -> crate::message::Prefix {
        match self.numnick {
            Some(n) => crate::message::Prefix::Numeric(n.to_wire()),
            None => crate::message::Prefix::Server(self.name.clone()),
        }
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }
}

impl Default for Entity {
    fn default() -> Self {
        Entity::new(EntityStatus::Unregistered, String::new())
    }
}

impl crate::pool::Reclaim for Entity {
    fn reset(&mut self) {
        *self = Entity::default();
    }

    fn ready_for_release(&self) -> bool {
        self.connection.is_none() && self.confs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numnick::{ServerNumeric, UserNumeric};

    fn local_user(nick: &str) -> Entity {
        let mut e = Entity::new(EntityStatus::LocalUser, nick.to_string());
        e.user = Some(UserRecord::new(
            "u".to_string(),
            "Real Name".to_string(),
            "host.example".to_string(),
        ));
        e
    }

    #[test]
    fn test_status_predicates() {
        let u = local_user("alice");
        assert!(u.is_user());
        assert!(u.is_local());
        assert!(!u.is_server());

        let mut s = Entity::new(EntityStatus::Server, "hub.example".to_string());
        s.server = Some(ServerRecord::default());
        assert!(s.is_server());
        assert!(!s.is_local());
    }

    #[test]
    fn test_oper_covers_both_flavors() {
        let mut u = local_user("alice");
        assert!(!u.is_oper());
        u.user.as_mut().unwrap().modes.insert('O');
        assert!(u.is_oper());
        u.user.as_mut().unwrap().modes.remove(&'O');
        u.user.as_mut().unwrap().modes.insert('o');
        assert!(u.is_oper());
    }

    #[test]
    fn test_prefixes_per_dialect() {
        let mut u = local_user("alice");
        let numeric = UserNumeric::new(ServerNumeric::new(0).unwrap(), 0).unwrap();
        u.numnick = Some(Numnick::User(numeric));

        assert_eq!(u.client_prefix().to_string(), "alice!u@host.example");
        assert_eq!(u.server_prefix().to_string(), "AAAAA");
    }
}
