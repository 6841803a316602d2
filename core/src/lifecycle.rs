//! Entity teardown and the post-tick reaper
//!
//! Termination follows a fixed order: announce to peers, detach from
//! channels, unregister from the directory (which records users in the
//! whowas history), drop policy attachments, release records to the
//! pools. Fanout never tears a link down in place; it flags the link and
//! the reaper runs the teardown between ticks.

use crate::admission::AdmissionControl;
use crate::entity::{sno, Entity, EntityId, EntityStatus};
use crate::message::Command;
use crate::pool::Pools;
use crate::send::{Arg, SendContext};
use parking_lot::Mutex;
use tracing::debug;

/// Quit reason applied to every user lost behind a broken server link
pub const NETSPLIT_REASON: &str = "*.net *.split";

/// Teardown driver bundling the state it mutates
pub struct Lifecycle<'a> {
    pub ctx: &'a SendContext<'a>,
    pub admission: &'a AdmissionControl,
    pub pools: &'a Mutex<Pools>,
}

impl<'a> Lifecycle<'a> {
    /// Remove one entity from the network, announcing as appropriate.
    /// `announce` is false when the departure was already broadcast (e.g.
    /// each user lost in a netsplit).
    pub fn exit_client(&self, victim: EntityId, reason: &str, announce: bool) {
        let entity = match self.ctx.directory.get(victim) {
            Some(e) => e,
            None => return,
        };

        if entity.is_server() {
            self.exit_server(&entity, reason);
            return;
        }

        if announce && entity.is_registered() {
            self.ctx.send_to_common_channels(victim, Command::Quit, vec![Arg::trail(reason)]);
            self.ctx.send_to_servers_but(
                Some(victim),
                Command::Quit,
                self.incoming_link(&entity),
                vec![Arg::trail(reason)],
            );
        }

        self.detach_channels(&entity);
        self.finish_user(victim, reason);
    }

    /// A directly-attached server link went away: everything routed
    /// through it leaves the network in one pass.
    pub fn exit_server(&self, server: &Entity, reason: &str) {
        let exclude = self.incoming_link(server);
        self.ctx.send_to_servers_but(
            None,
            Command::SQuit,
            exclude,
            vec![Arg::s(&server.name), Arg::Int(0), Arg::trail(reason)],
        );
        self.ctx.send_opmask_notice(
            None,
            sno::SNO_NETWORK,
            &format!("Lost server link to {} ({})", server.name, reason),
        );

        let removed = self.ctx.directory.netsplit(server.id);
        let lost_users = removed.iter().filter(|e| e.is_user()).count();
        debug!(server = %server.name, users = lost_users, "processing netsplit");

        // drop the lost subtree's root from its parent's child list
        let parent = if server.status == EntityStatus::LocalServer {
            self.ctx.directory.me()
        } else {
            server.upstream
        };
        self.ctx.directory.with_entity_mut(parent, |e| {
            if let Some(s) = e.server.as_mut() {
                s.children.retain(|c| *c != server.id);
            }
        });

        // the subtree is already unregistered, so each casualty's QUIT is
        // built from its removed record; local users sharing several
        // channels with one casualty still see a single QUIT
        for entity in &removed {
            if !entity.is_user() {
                continue;
            }
            let line = crate::buffer::MsgBuf::new(format!(
                ":{} QUIT :{}\r\n",
                entity.client_prefix(),
                NETSPLIT_REASON
            ));
            let mut told: std::collections::HashSet<EntityId> = std::collections::HashSet::new();
            for chan in entity.user.as_ref().map(|u| u.channels.clone()).unwrap_or_default() {
                for member in self.ctx.channels.member_ids(&chan) {
                    if !told.insert(member) {
                        continue;
                    }
                    let local = self
                        .ctx
                        .directory
                        .get(member)
                        .map_or(false, |e| e.status == EntityStatus::LocalUser);
                    if !local {
                        continue;
                    }
                    if let Some(conn) = self.ctx.directory.get(member).and_then(|e| e.connection) {
                        self.ctx.connections.enqueue(conn, line.clone(), crate::buffer::Priority::Normal);
                    }
                }
                self.ctx.channels.part(&chan, entity.id);
            }
        }
        self.ctx.channels.sweep();

        let mut pools = self.pools.lock();
        for mut entity in removed {
            self.admission.detach_all(&mut entity);
            entity.connection = None;
            entity.user = None;
            entity.server = None;
            pools.clients.release(entity);
        }
        if let Some(conn_id) = server.connection {
            if let Some(mut conn) = self.ctx.connections.remove(conn_id) {
                conn.close(reason);
                conn.entity = None;
                pools.connections.release(conn);
            }
        }
    }

    /// Detach a user from every channel it sits in, destroying channels
    /// that empty out (unless permanent).
    fn detach_channels(&self, entity: &Entity) {
        let channels = entity.user.as_ref().map(|u| u.channels.clone()).unwrap_or_default();
        let mut pools = self.pools.lock();
        for chan in channels {
            if let Some(seat) = self.ctx.channels.part(&chan, entity.id) {
                pools.members.release(seat);
            }
        }
        drop(pools);
        self.ctx.channels.sweep();
    }

    /// The fixed tail of user teardown: directory, policy, pools.
    fn finish_user(&self, victim: EntityId, reason: &str) {
        let mut entity = match self.ctx.directory.unregister(victim) {
            Some(e) => e,
            None => return,
        };
        self.admission.detach_all(&mut entity);

        let mut pools = self.pools.lock();
        if let Some(conn_id) = entity.connection.take() {
            if let Some(mut conn) = self.ctx.connections.remove(conn_id) {
                if let Some(addr) = conn.peer_addr {
                    self.admission.note_disconnect(addr.ip());
                }
                conn.close(reason);
                conn.entity = None;
                pools.connections.release(conn);
            }
        }
        entity.user = None;
        entity.server = None;
        pools.clients.release(entity);
    }

    /// The link a message from this entity would arrive on; used to avoid
    /// echoing announcements back where they came from.
    fn incoming_link(&self, entity: &Entity) -> Option<EntityId> {
        if entity.is_local() {
            None
        } else {
            self.ctx.directory.route_to(entity.id)
        }
    }

    /// Close and tear down every link flagged dead since the last tick.
    pub fn reap(&self) {
        for conn_id in self.ctx.connections.reap_candidates() {
            let (entity, reason) = match self.ctx.connections.with_conn(conn_id, |c| {
                (c.entity, c.dead.clone().unwrap_or_else(|| "Closed".to_string()))
            }) {
                Some(pair) => pair,
                None => continue,
            };
            match entity {
                Some(id) => self.exit_client(id, &reason, true),
                None => {
                    // never registered; just drop the record
                    let mut pools = self.pools.lock();
                    if let Some(mut conn) = self.ctx.connections.remove(conn_id) {
                        if let Some(addr) = conn.peer_addr {
                            self.admission.note_disconnect(addr.ip());
                        }
                        conn.close(&reason);
                        pools.connections.release(conn);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelMap, MemberModes, Membership};
    use crate::connection::{Connection, ConnectionTable};
    use crate::directory::Directory;
    use crate::entity::UserRecord;
    use crate::history::Whowas;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct Fixture {
        directory: Directory,
        channels: ChannelMap,
        connections: ConnectionTable,
        admission: AdmissionControl,
        pools: Mutex<Pools>,
        whowas: Arc<Whowas>,
    }

    impl Fixture {
        fn new() -> Self {
            let whowas = Arc::new(Whowas::new(32));
            let me = Entity::new(EntityStatus::Me, "irc.example".to_string());
            Self {
                directory: Directory::new(me, whowas.clone()),
                channels: ChannelMap::new(),
                connections: ConnectionTable::new(),
                admission: AdmissionControl::new(),
                pools: Mutex::new(Pools::with_capacity(8)),
                whowas,
            }
        }

        fn add_conn(&self) -> Uuid {
            let (tx, _rx) = mpsc::unbounded_channel();
            let mut conn = Connection::default();
            conn.open("127.0.0.1:6667".parse().unwrap(), 65536, 90, 60, tx);
            self.connections.insert(conn)
        }

        fn local_user(&self, nick: &str) -> EntityId {
            let conn = self.add_conn();
            let mut e = Entity::new(EntityStatus::LocalUser, nick.to_string());
            e.user = Some(UserRecord::new("u".to_string(), "R".to_string(), "h.example".to_string()));
            e.connection = Some(conn);
            let id = e.id;
            self.connections.with_conn(conn, |c| c.entity = Some(id));
            self.directory.register(e).unwrap();
            id
        }

        fn remote_user(&self, nick: &str, via: EntityId) -> EntityId {
            let mut e = Entity::new(EntityStatus::User, nick.to_string());
            e.user = Some(UserRecord::new("u".to_string(), "R".to_string(), "far.example".to_string()));
            e.upstream = via;
            let id = e.id;
            self.directory.register(e).unwrap();
            id
        }

        fn peer_server(&self, name: &str) -> EntityId {
            let conn = self.add_conn();
            let mut e = Entity::new(EntityStatus::LocalServer, name.to_string());
            e.server = Some(Default::default());
            e.connection = Some(conn);
            let id = e.id;
            self.connections.with_conn(conn, |c| c.entity = Some(id));
            self.directory.register(e).unwrap();
            id
        }

        fn join(&self, chan: &str, user: EntityId) {
            self.channels.join(chan, Membership { user, modes: MemberModes::default() });
            self.directory.with_entity_mut(user, |e| {
                e.user.as_mut().unwrap().channels.insert(chan.to_string());
            });
        }

        fn ctx(&self) -> SendContext<'_> {
            SendContext {
                directory: &self.directory,
                channels: &self.channels,
                connections: &self.connections,
            }
        }

        fn output_of(&self, id: EntityId) -> String {
            let conn = self.directory.get(id).unwrap().connection.unwrap();
            let (bytes, _) = self.connections.drain(conn, 1 << 20).unwrap();
            String::from_utf8(bytes).unwrap()
        }
    }

    #[test]
    fn test_quit_announces_then_unregisters() {
        let fix = Fixture::new();
        let alice = fix.local_user("alice");
        let bob = fix.local_user("bob");
        fix.join("#ops", alice);
        fix.join("#ops", bob);

        let ctx = fix.ctx();
        let lc = Lifecycle { ctx: &ctx, admission: &fix.admission, pools: &fix.pools };
        lc.exit_client(alice, "bye", true);

        assert!(fix.output_of(bob).contains("QUIT :bye"));
        assert!(fix.directory.lookup_by_name("alice").is_none());
        // whowas becomes visible only after unregistration
        assert_eq!(fix.whowas.query("alice", 0).len(), 1);
        // seat is gone, channel survives with bob in it
        assert!(!fix.channels.get("#ops").unwrap().is_member(alice));
    }

    #[test]
    fn test_quit_of_last_member_destroys_channel() {
        let fix = Fixture::new();
        let alice = fix.local_user("alice");
        fix.join("#solo", alice);

        let ctx = fix.ctx();
        let lc = Lifecycle { ctx: &ctx, admission: &fix.admission, pools: &fix.pools };
        lc.exit_client(alice, "bye", true);

        assert!(!fix.channels.contains("#solo"));
    }

    #[test]
    fn test_netsplit_quits_downstream_users() {
        let fix = Fixture::new();
        let alice = fix.local_user("alice");
        let hub = fix.peer_server("hub.example");
        let mut lost = Vec::new();
        for i in 0..5 {
            let u = fix.remote_user(&format!("lost{}", i), hub);
            fix.join("#ops", u);
            lost.push(u);
        }
        fix.join("#ops", alice);

        let before = fix.directory.len();
        let ctx = fix.ctx();
        let lc = Lifecycle { ctx: &ctx, admission: &fix.admission, pools: &fix.pools };
        let server = fix.directory.get(hub).unwrap();
        lc.exit_server(&server, "read error");

        // 5 users + the server record
        assert_eq!(fix.directory.len(), before - 6);
        let out = fix.output_of(alice);
        assert_eq!(out.matches(NETSPLIT_REASON).count(), 5);
        assert!(fix.channels.get("#ops").unwrap().is_member(alice));
        for u in lost {
            assert!(!fix.channels.get("#ops").unwrap().is_member(u));
        }
    }

    #[test]
    fn test_reaper_closes_flagged_connections() {
        let fix = Fixture::new();
        let alice = fix.local_user("alice");
        let bob = fix.local_user("bob");
        fix.join("#ops", alice);
        fix.join("#ops", bob);

        let conn = fix.directory.get(alice).unwrap().connection.unwrap();
        fix.connections.mark_dead(conn, "SendQ exceeded");

        let ctx = fix.ctx();
        let lc = Lifecycle { ctx: &ctx, admission: &fix.admission, pools: &fix.pools };
        lc.reap();

        assert!(fix.directory.lookup_by_name("alice").is_none());
        assert!(!fix.connections.contains(conn));
        assert!(fix.output_of(bob).contains("QUIT :SendQ exceeded"));
    }

    #[test]
    fn test_pool_conservation_through_teardown() {
        let fix = Fixture::new();
        let stats_before = fix.pools.lock().connections.stats();
        let alice = fix.local_user("alice");

        let ctx = fix.ctx();
        let lc = Lifecycle { ctx: &ctx, admission: &fix.admission, pools: &fix.pools };
        lc.exit_client(alice, "bye", true);

        let stats_after = fix.pools.lock().connections.stats();
        // one fresh connection was built outside the pool and released into it
        assert_eq!(stats_after.free, stats_before.free + 1);
    }
}
