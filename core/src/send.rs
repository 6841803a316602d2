//! The dispatch engine: one format per dialect, fanout to many links
//!
//! Clients receive the long textual command with a `nick!user@host` or
//! server-name prefix; peer servers receive the token spelling with a
//! numeric prefix. A call formats each dialect at most once and shares the
//! resulting buffer across every recipient queue. Failed deliveries never
//! propagate: an overflowing link is marked dead for the reaper.

use crate::buffer::{MsgBuf, Priority};
use crate::channel::ChannelMap;
use crate::connection::ConnectionTable;
use crate::directory::Directory;
use crate::entity::{Entity, EntityId, EntityStatus};
use crate::message::{Command, Message};
use crate::numeric::{self, Numeric};
use crate::utils::mask;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Epoch source for fanout deduplication marks
static FANOUT_EPOCH: AtomicU64 = AtomicU64::new(1);

fn next_epoch() -> u64 {
    FANOUT_EPOCH.fetch_add(1, Ordering::Relaxed)
}

/// On-wire form required by a recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Textual command, textual prefix
    Client,
    /// Token command, numeric prefix
    Server,
}

/// A typed message argument, rendered per dialect
#[derive(Debug, Clone)]
pub enum Arg {
    /// Literal text
    S(String),
    /// Free text carried as the final `:`-prefixed parameter
    Trail(String),
    /// Integer
    Int(i64),
    /// An entity, rendered as nick toward clients and numeric toward servers
    Client(EntityId),
    /// A channel name
    Chan(String),
}

impl Arg {
    pub fn s(text: &str) -> Arg {
        Arg::S(text.to_string())
    }

    pub fn trail(text: &str) -> Arg {
        Arg::Trail(text.to_string())
    }
}

/// Member-visit filters for channel fanout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipFlags {
    /// Skip local members with the deaf user mode
    pub deaf: bool,
    /// Skip links mid-burst for this channel
    pub burst: bool,
    /// Only deliver to channel operators
    pub nonops: bool,
}

impl SkipFlags {
    pub const NONE: SkipFlags = SkipFlags { deaf: false, burst: false, nonops: false };
}

/// Which entity attribute [`SendContext::send_to_match_but_one`] matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchWho {
    Server,
    Host,
}

/// Borrowed view of the state the engine routes over
pub struct SendContext<'a> {
    pub directory: &'a Directory,
    pub channels: &'a ChannelMap,
    pub connections: &'a ConnectionTable,
}

/// Lazily-built per-call cache: at most one buffer per dialect
struct DialectCache {
    from: Option<EntityId>,
    command: Command,
    args: Vec<Arg>,
    client: Option<MsgBuf>,
    server: Option<MsgBuf>,
}

impl DialectCache {
    fn new(from: Option<EntityId>, command: Command, args: Vec<Arg>) -> Self {
        Self { from, command, args, client: None, server: None }
    }

    fn line(&mut self, ctx: &SendContext<'_>, dialect: Dialect) -> MsgBuf {
        let slot = match dialect {
            Dialect::Client => &mut self.client,
            Dialect::Server => &mut self.server,
        };
        if let Some(ref buf) = slot {
            return buf.clone();
        }
        let prefix = self.from.and_then(|id| ctx.directory.get(id)).map(|e| match dialect {
            Dialect::Client => e.client_prefix(),
            Dialect::Server => e.server_prefix(),
        });
        let params: Vec<String> =
            self.args.iter().map(|a| render_arg(ctx, a, dialect)).collect();
        let mut msg = match prefix {
            Some(p) => Message::with_prefix(p, self.command.clone(), params),
            None => Message::new(self.command.clone(), params),
        };
        msg.trailing = matches!(self.args.last(), Some(Arg::Trail(_)));
        let line = match dialect {
            Dialect::Client => msg.to_client_line(),
            Dialect::Server => msg.to_server_line(),
        };
        let buf = MsgBuf::new(line);
        *slot = Some(buf.clone());
        buf
    }
}

fn render_arg(ctx: &SendContext<'_>, arg: &Arg, dialect: Dialect) -> String {
    match arg {
        Arg::S(s) | Arg::Trail(s) => s.clone(),
        Arg::Int(i) => i.to_string(),
        Arg::Chan(c) => c.clone(),
        Arg::Client(id) => match ctx.directory.get(*id) {
            Some(e) => match dialect {
                Dialect::Client => e.name,
                Dialect::Server => e.server_prefix().to_string(),
            },
            None => "*".to_string(),
        },
    }
}

impl<'a> SendContext<'a> {
    /// The connection record carrying traffic for `id`: its own for local
    /// entities, the direct neighbor's for remote ones.
    pub fn link_of(&self, id: EntityId) -> Option<Uuid> {
        let entity = self.directory.get(id)?;
        if entity.is_local() {
            return entity.connection;
        }
        let neighbor = self.directory.route_to(id)?;
        self.directory.get(neighbor)?.connection
    }

    fn dialect_of(&self, entity: &Entity) -> Dialect {
        match entity.status {
            EntityStatus::LocalServer | EntityStatus::HandshakingServer | EntityStatus::Server => {
                Dialect::Server
            }
            _ if !entity.is_local() => Dialect::Server,
            _ => Dialect::Client,
        }
    }

    /// Transmit a pre-formatted line with no prefix.
    pub fn send_raw(&self, to: EntityId, line: &str) {
        let mut text = line.to_string();
        if !text.ends_with("\r\n") {
            text.push_str("\r\n");
        }
        if let Some(conn) = self.link_of(to) {
            self.connections.enqueue(conn, MsgBuf::new(text), Priority::Normal);
        }
    }

    pub fn send_to_one(&self, from: Option<EntityId>, command: Command, to: EntityId, args: Vec<Arg>) {
        self.send_one_with(from, command, to, args, Priority::Normal)
    }

    /// Like [`send_to_one`], placed on the urgent queue so it overtakes
    /// queued chatter.
    pub fn send_prio_to_one(&self, from: Option<EntityId>, command: Command, to: EntityId, args: Vec<Arg>) {
        self.send_one_with(from, command, to, args, Priority::Urgent)
    }

    fn send_one_with(
        &self,
        from: Option<EntityId>,
        command: Command,
        to: EntityId,
        args: Vec<Arg>,
        priority: Priority,
    ) {
        let entity = match self.directory.get(to) {
            Some(e) => e,
            None => return,
        };
        let mut cache = DialectCache::new(from, command, args);
        let dialect = self.dialect_of(&entity);
        let line = cache.line(self, dialect);
        if let Some(conn) = self.link_of(to) {
            self.connections.enqueue(conn, line, priority);
        }
    }

    /// Broadcast to every directly-linked server except `exclude`.
    pub fn send_to_servers_but(
        &self,
        from: Option<EntityId>,
        command: Command,
        exclude: Option<EntityId>,
        args: Vec<Arg>,
    ) {
        let mut cache = DialectCache::new(from, command, args);
        for link in self.directory.local_server_links() {
            if Some(link) == exclude {
                continue;
            }
            let line = cache.line(self, Dialect::Server);
            if let Some(conn) = self.directory.get(link).and_then(|e| e.connection) {
                self.connections.enqueue(conn, line, Priority::Normal);
            }
        }
    }

    /// Deliver to every local user sharing at least one channel with
    /// `from`, each at most once; `from` itself is skipped. Peers learn of
    /// the event from the parallel server broadcast, never from here.
    pub fn send_to_common_channels(&self, from: EntityId, command: Command, args: Vec<Arg>) {
        let channels = match self.directory.get(from).and_then(|e| e.user.map(|u| u.channels)) {
            Some(chans) => chans,
            None => return,
        };
        let epoch = next_epoch();
        let mut cache = DialectCache::new(Some(from), command, args);
        for chan in channels {
            for member in self.channels.member_ids(&chan) {
                if member == from {
                    continue;
                }
                let fresh = self
                    .directory
                    .with_entity_mut(member, |e| {
                        if e.status != EntityStatus::LocalUser || e.mark == epoch {
                            false
                        } else {
                            e.mark = epoch;
                            true
                        }
                    })
                    .unwrap_or(false);
                if !fresh {
                    continue;
                }
                let line = cache.line(self, Dialect::Client);
                if let Some(conn) = self.directory.get(member).and_then(|e| e.connection) {
                    self.connections.enqueue(conn, line, Priority::Normal);
                }
            }
        }
    }

    /// Deliver to all local members of a channel, never to server links.
    pub fn send_to_channel_but_servers(
        &self,
        from: Option<EntityId>,
        command: Command,
        channel: &str,
        args: Vec<Arg>,
    ) {
        let mut cache = DialectCache::new(from, command, args);
        for member in self.channels.member_ids(channel) {
            let entity = match self.directory.get(member) {
                Some(e) => e,
                None => continue,
            };
            if entity.status != EntityStatus::LocalUser {
                continue;
            }
            let line = cache.line(self, Dialect::Client);
            if let Some(conn) = entity.connection {
                self.connections.enqueue(conn, line, Priority::Normal);
            }
        }
    }

    /// Visit every member of a channel: local users get the client form,
    /// remote members are folded into one server-form delivery per
    /// upstream link.
    pub fn send_to_channel_but_one(
        &self,
        from: Option<EntityId>,
        command: Command,
        channel: &str,
        exclude: Option<EntityId>,
        skip: SkipFlags,
        args: Vec<Arg>,
    ) {
        let chan = match self.channels.get(channel) {
            Some(c) => c,
            None => return,
        };
        let mut cache = DialectCache::new(from, command, args);
        let mut upstream_links: HashSet<EntityId> = HashSet::new();

        for member in &chan.members {
            if Some(member.user) == exclude {
                continue;
            }
            if skip.nonops && !member.modes.op {
                continue;
            }
            let entity = match self.directory.get(member.user) {
                Some(e) => e,
                None => continue,
            };
            if entity.status == EntityStatus::LocalUser {
                if skip.deaf && entity.is_deaf() {
                    continue;
                }
                let line = cache.line(self, Dialect::Client);
                if let Some(conn) = entity.connection {
                    self.connections.enqueue(conn, line, Priority::Normal);
                }
            } else if entity.is_user() {
                if let Some(link) = self.directory.route_to(member.user) {
                    upstream_links.insert(link);
                }
            }
        }

        for link in upstream_links {
            if skip.burst && self.channels.is_bursting(channel, link) {
                continue;
            }
            let line = cache.line(self, Dialect::Server);
            if let Some(conn) = self.directory.get(link).and_then(|e| e.connection) {
                self.connections.enqueue(conn, line, Priority::Normal);
            }
        }
    }

    /// Deliver to every local user carrying a mode flag; `'o'` covers both
    /// operator flavors. Directly-linked servers receive an urgent copy.
    pub fn send_to_flag_but_one(
        &self,
        from: Option<EntityId>,
        command: Command,
        exclude: Option<EntityId>,
        flag: char,
        args: Vec<Arg>,
    ) {
        let mut cache = DialectCache::new(from, command, args);
        for id in self.directory.iterate_local_users() {
            if Some(id) == exclude {
                continue;
            }
            let entity = match self.directory.get(id) {
                Some(e) => e,
                None => continue,
            };
            let has = if flag == 'o' { entity.is_oper() } else { entity.has_mode(flag) };
            if !has {
                continue;
            }
            let line = cache.line(self, Dialect::Client);
            if let Some(conn) = entity.connection {
                self.connections.enqueue(conn, line, Priority::Normal);
            }
        }
        for link in self.directory.local_server_links() {
            if Some(link) == exclude {
                continue;
            }
            let line = cache.line(self, Dialect::Server);
            if let Some(conn) = self.directory.get(link).and_then(|e| e.connection) {
                self.connections.enqueue(conn, line, Priority::Urgent);
            }
        }
    }

    /// Deliver to local users whose server name or host matches
    /// `target_mask`, and forward once to each server link that may have
    /// matching descendants.
    pub fn send_to_match_but_one(
        &self,
        from: Option<EntityId>,
        command: Command,
        target_mask: &str,
        exclude: Option<EntityId>,
        who: MatchWho,
        args: Vec<Arg>,
    ) {
        let mut cache = DialectCache::new(from, command, args);
        let me_name = self.directory.me_name().to_string();
        for id in self.directory.iterate_local_users() {
            if Some(id) == exclude {
                continue;
            }
            let entity = match self.directory.get(id) {
                Some(e) => e,
                None => continue,
            };
            let matched = match who {
                MatchWho::Server => mask::matches(target_mask, &me_name),
                MatchWho::Host => entity
                    .user
                    .as_ref()
                    .map_or(false, |u| mask::matches(target_mask, &u.host)),
            };
            if !matched {
                continue;
            }
            let line = cache.line(self, Dialect::Client);
            if let Some(conn) = entity.connection {
                self.connections.enqueue(conn, line, Priority::Normal);
            }
        }
        for link in self.directory.local_server_links() {
            if Some(link) == exclude {
                continue;
            }
            let line = cache.line(self, Dialect::Server);
            if let Some(conn) = self.directory.get(link).and_then(|e| e.connection) {
                self.connections.enqueue(conn, line, Priority::Normal);
            }
        }
    }

    /// Server-notice fanout: local operators whose subscription intersects
    /// `mask`, minus `exclude`.
    pub fn send_opmask_notice(&self, exclude: Option<EntityId>, mask: u32, text: &str) {
        let me = self.directory.me_name().to_string();
        for id in self.directory.iterate_local_users() {
            if Some(id) == exclude {
                continue;
            }
            let entity = match self.directory.get(id) {
                Some(e) => e,
                None => continue,
            };
            let subscribed = entity.user.as_ref().map_or(0, |u| u.snomask);
            if subscribed & mask == 0 {
                continue;
            }
            let line = format!(":{} NOTICE {} :*** Notice -- {}\r\n", me, entity.name, text);
            if let Some(conn) = entity.connection {
                self.connections.enqueue(conn, MsgBuf::new(line), Priority::Normal);
            }
        }
    }

    /// Format and deliver a numeric reply. With the explicit flag set the
    /// first argument is the format template; otherwise the built-in table
    /// entry for the code is used.
    pub fn send_reply(&self, to: EntityId, numeric: Numeric, args: Vec<Arg>) {
        let entity = match self.directory.get(to) {
            Some(e) => e,
            None => return,
        };
        let dialect = self.dialect_of(&entity);
        let (template, args) = if numeric.is_explicit() {
            match args.split_first() {
                Some((Arg::S(t), rest)) => (t.clone(), rest.to_vec()),
                _ => return,
            }
        } else {
            match numeric::template(numeric.code()) {
                Some(t) => (t.to_string(), args),
                None => return,
            }
        };

        let target = match dialect {
            Dialect::Client => entity.name.clone(),
            Dialect::Server => entity.server_prefix().to_string(),
        };
        let body = format_template(self, &template, &args, dialect);
        let mut line = format!(":{} {:03} {} {}", self.directory.me_name(), numeric.code(), target, body);
        if line.len() > crate::message::MAX_LINE - 2 {
            let mut cut = crate::message::MAX_LINE - 2;
            while cut > 0 && !line.is_char_boundary(cut) {
                cut -= 1;
            }
            line.truncate(cut);
        }
        line.push_str("\r\n");
        if let Some(conn) = self.link_of(to) {
            self.connections.enqueue(conn, MsgBuf::new(line), Priority::Normal);
        }
    }
}

/// Render a reply template. `%s` and `%d`/`%u` consume the next argument,
/// `%C` renders an entity per dialect, `%H` a channel name, `%%` a literal
/// percent sign.
pub fn format_template(ctx: &SendContext<'_>, template: &str, args: &[Arg], dialect: Dialect) -> String {
    let mut out = String::with_capacity(template.len() + 32);
    let mut args = args.iter();
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('s') | Some('d') | Some('u') | Some('C') | Some('H') => {
                if let Some(arg) = args.next() {
                    out.push_str(&render_arg(ctx, arg, dialect));
                }
            }
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MemberModes, Membership};
    use crate::connection::Connection;
    use crate::entity::{ServerRecord, UserRecord};
    use crate::history::Whowas;
    use crate::numnick::{Numnick, ServerNumeric, UserNumeric};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Net {
        directory: Directory,
        channels: ChannelMap,
        connections: ConnectionTable,
    }

    impl Net {
        fn new() -> Self {
            let mut me = Entity::new(EntityStatus::Me, "irc.example".to_string());
            me.numnick = Some(Numnick::Server(ServerNumeric::new(0).unwrap()));
            Self {
                directory: Directory::new(me, Arc::new(Whowas::new(16))),
                channels: ChannelMap::new(),
                connections: ConnectionTable::new(),
            }
        }

        fn ctx(&self) -> SendContext<'_> {
            SendContext {
                directory: &self.directory,
                channels: &self.channels,
                connections: &self.connections,
            }
        }

        fn add_conn(&self) -> Uuid {
            let (tx, _rx) = mpsc::unbounded_channel();
            let mut conn = Connection::default();
            conn.open("127.0.0.1:6667".parse().unwrap(), 65536, 90, 60, tx);
            self.connections.insert(conn)
        }

        fn local_user(&self, nick: &str, index: u32) -> EntityId {
            let conn = self.add_conn();
            let mut e = Entity::new(EntityStatus::LocalUser, nick.to_string());
            e.user = Some(UserRecord::new("u".to_string(), "R".to_string(), "host.example".to_string()));
            e.numnick = Some(Numnick::User(
                UserNumeric::new(ServerNumeric::new(0).unwrap(), index).unwrap(),
            ));
            e.connection = Some(conn);
            let id = e.id;
            self.directory.register(e).unwrap();
            id
        }

        fn peer_server(&self, name: &str, numeric: u32) -> EntityId {
            let conn = self.add_conn();
            let mut e = Entity::new(EntityStatus::LocalServer, name.to_string());
            e.numnick = Some(Numnick::Server(ServerNumeric::new(numeric).unwrap()));
            e.server = Some(ServerRecord::default());
            e.connection = Some(conn);
            e.upstream = e.id;
            let id = e.id;
            self.directory.register(e).unwrap();
            id
        }

        fn remote_user(&self, nick: &str, via: EntityId, server_numeric: u32, index: u32) -> EntityId {
            let mut e = Entity::new(EntityStatus::User, nick.to_string());
            e.user = Some(UserRecord::new("u".to_string(), "R".to_string(), "far.example".to_string()));
            e.numnick = Some(Numnick::User(
                UserNumeric::new(ServerNumeric::new(server_numeric).unwrap(), index).unwrap(),
            ));
            e.upstream = via;
            let id = e.id;
            self.directory.register(e).unwrap();
            id
        }

        fn output_of(&self, id: EntityId) -> String {
            let conn = self.directory.get(id).unwrap().connection.unwrap();
            let (bytes, _) = self.connections.drain(conn, 1 << 20).unwrap();
            String::from_utf8(bytes).unwrap()
        }
    }

    fn seat(id: EntityId) -> Membership {
        Membership { user: id, modes: MemberModes::default() }
    }

    #[test]
    fn test_dialect_selection_per_recipient() {
        let net = Net::new();
        let alice = net.local_user("alice", 0);
        let bob = net.local_user("bob", 1);
        let hub = net.peer_server("hub.example", 1);
        let carol = net.remote_user("carol", hub, 1, 0);

        net.channels.join("#ops", seat(alice));
        net.channels.join("#ops", seat(bob));
        net.channels.join("#ops", seat(carol));

        net.ctx().send_to_channel_but_one(
            Some(alice),
            Command::PrivMsg,
            "#ops",
            Some(alice),
            SkipFlags::NONE,
            vec![Arg::Chan("#ops".to_string()), Arg::trail("hi")],
        );

        assert_eq!(net.output_of(bob), ":alice!u@host.example PRIVMSG #ops :hi\r\n");
        assert_eq!(net.output_of(hub), ":AAAAA P #ops :hi\r\n");
        assert!(net.output_of(alice).is_empty());
    }

    #[test]
    fn test_remote_members_fold_into_one_link_delivery() {
        let net = Net::new();
        let alice = net.local_user("alice", 0);
        let hub = net.peer_server("hub.example", 1);
        let c1 = net.remote_user("c1", hub, 1, 0);
        let c2 = net.remote_user("c2", hub, 1, 1);

        net.channels.join("#ops", seat(alice));
        net.channels.join("#ops", seat(c1));
        net.channels.join("#ops", seat(c2));

        net.ctx().send_to_channel_but_one(
            Some(alice),
            Command::PrivMsg,
            "#ops",
            Some(alice),
            SkipFlags::NONE,
            vec![Arg::Chan("#ops".to_string()), Arg::trail("hi")],
        );

        let out = net.output_of(hub);
        assert_eq!(out.matches("P #ops").count(), 1);
    }

    #[test]
    fn test_skip_deaf_and_nonops() {
        let net = Net::new();
        let alice = net.local_user("alice", 0);
        let deaf = net.local_user("deafguy", 1);
        net.directory.with_entity_mut(deaf, |e| {
            e.user.as_mut().unwrap().modes.insert('d');
        });
        let voiced = net.local_user("voiced", 2);

        net.channels.join("#ops", seat(alice));
        net.channels.join("#ops", seat(deaf));
        let mut v = seat(voiced);
        v.modes.voice = true;
        net.channels.join("#ops", v);

        let skip = SkipFlags { deaf: true, burst: false, nonops: true };
        net.ctx().send_to_channel_but_one(
            None,
            Command::Notice,
            "#ops",
            None,
            skip,
            vec![Arg::Chan("#ops".to_string()), Arg::trail("ops only")],
        );

        // only alice holds channel-op (creator); voice does not qualify
        assert!(!net.output_of(alice).is_empty());
        assert!(net.output_of(deaf).is_empty());
        assert!(net.output_of(voiced).is_empty());
    }

    #[test]
    fn test_burst_suppression_per_link() {
        let net = Net::new();
        let alice = net.local_user("alice", 0);
        let hub = net.peer_server("hub.example", 1);
        let carol = net.remote_user("carol", hub, 1, 0);

        net.channels.join("#ops", seat(alice));
        net.channels.join("#ops", seat(carol));
        net.channels.begin_burst("#ops", hub);

        let skip = SkipFlags { deaf: false, burst: true, nonops: false };
        net.ctx().send_to_channel_but_one(
            None,
            Command::PrivMsg,
            "#ops",
            None,
            skip,
            vec![Arg::Chan("#ops".to_string()), Arg::trail("hi")],
        );

        assert!(net.output_of(hub).is_empty());
        assert!(!net.output_of(alice).is_empty());
    }

    #[test]
    fn test_common_channels_dedup() {
        let net = Net::new();
        let alice = net.local_user("alice", 0);
        let bob = net.local_user("bob", 1);
        for chan in ["#one", "#two", "#three"] {
            net.channels.join(chan, seat(alice));
            net.channels.join(chan, seat(bob));
            net.directory.with_entity_mut(alice, |e| {
                e.user.as_mut().unwrap().channels.insert(chan.to_string());
            });
        }

        net.ctx().send_to_common_channels(alice, Command::Quit, vec![Arg::trail("bye")]);

        let out = net.output_of(bob);
        assert_eq!(out.matches("QUIT").count(), 1);
        assert!(net.output_of(alice).is_empty());
    }

    #[test]
    fn test_servers_but_excludes_origin() {
        let net = Net::new();
        let hub = net.peer_server("hub.example", 1);
        let leaf = net.peer_server("leaf.example", 2);

        net.ctx().send_to_servers_but(None, Command::Ping, Some(hub), vec![Arg::s("irc.example")]);

        assert!(net.output_of(hub).is_empty());
        assert_eq!(net.output_of(leaf), "G irc.example\r\n");
    }

    #[test]
    fn test_flag_fanout_reaches_opers_and_links_urgently() {
        let net = Net::new();
        let oper = net.local_user("oper1", 0);
        net.directory.with_entity_mut(oper, |e| {
            e.user.as_mut().unwrap().modes.insert('O');
        });
        let plain = net.local_user("plain", 1);
        let hub = net.peer_server("hub.example", 1);
        // pre-load the hub link with chatter; the wallops must overtake it
        let hub_conn = net.directory.get(hub).unwrap().connection.unwrap();
        net.connections.enqueue(hub_conn, MsgBuf::new("P #x :noise\r\n".to_string()), Priority::Normal);

        net.ctx().send_to_flag_but_one(None, Command::Wallops, None, 'o', vec![Arg::trail("hear ye")]);

        assert!(net.output_of(oper).contains("WALLOPS"));
        assert!(net.output_of(plain).is_empty());
        let hub_out = net.output_of(hub);
        assert!(hub_out.starts_with("WA :hear ye\r\n"));
    }

    #[test]
    fn test_opmask_notice_respects_subscription() {
        let net = Net::new();
        use crate::entity::sno;
        let sub = net.local_user("sub", 0);
        net.directory.with_entity_mut(sub, |e| {
            e.user.as_mut().unwrap().snomask = sno::SNO_OLDSNO;
        });
        let unsub = net.local_user("unsub", 1);

        net.ctx().send_opmask_notice(None, sno::SNO_OLDSNO, "rehash complete");

        assert!(net.output_of(sub).contains("*** Notice -- rehash complete"));
        assert!(net.output_of(unsub).is_empty());
    }

    #[test]
    fn test_send_reply_uses_table() {
        let net = Net::new();
        let alice = net.local_user("alice", 0);
        net.ctx().send_reply(alice, numeric::ERR_NICKNAMEINUSE, vec![Arg::s("taken")]);
        assert_eq!(
            net.output_of(alice),
            ":irc.example 433 alice taken :Nickname is already in use\r\n"
        );
    }

    #[test]
    fn test_send_reply_explicit_format() {
        let net = Net::new();
        let alice = net.local_user("alice", 0);
        net.ctx().send_reply(
            alice,
            numeric::RPL_STATSDEBUG.explicit(),
            vec![Arg::s(":Clients: inuse: %d"), Arg::Int(7)],
        );
        assert_eq!(net.output_of(alice), ":irc.example 249 alice :Clients: inuse: 7\r\n");
    }

    #[test]
    fn test_reply_truncated_at_line_limit() {
        let net = Net::new();
        let alice = net.local_user("alice", 0);
        net.ctx().send_reply(
            alice,
            numeric::RPL_MOTD,
            vec![Arg::S("x".repeat(600))],
        );
        let out = net.output_of(alice);
        assert!(out.len() <= crate::message::MAX_LINE);
        assert!(out.ends_with("\r\n"));
    }

    #[test]
    fn test_match_fanout_by_host() {
        let net = Net::new();
        let near = net.local_user("near", 0);
        let far = net.local_user("far", 1);
        net.directory.with_entity_mut(far, |e| {
            e.user.as_mut().unwrap().host = "other.net".to_string();
        });

        net.ctx().send_to_match_but_one(
            None,
            Command::Notice,
            "*.example",
            None,
            MatchWho::Host,
            vec![Arg::trail("attention")],
        );

        assert!(!net.output_of(near).is_empty());
        assert!(net.output_of(far).is_empty());
    }
}
