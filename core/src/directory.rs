//! The routing directory: every named participant, indexed and linked
//!
//! Owns all entity records. Lookups are by case-folded name or by numeric
//! identifier; each entity's `upstream` field forms the spanning tree used
//! for routing and netsplit handling.

use crate::entity::{Entity, EntityId, EntityStatus};
use crate::history::{Whowas, WhowasEntry};
use crate::utils::string::casefold;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;

/// Who dies when two entities claim the same nick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionVerdict {
    /// The newcomer loses; the existing entity stays
    KillNewcomer,
    /// The existing entity is younger and loses
    KillExisting,
    /// Identical timestamps: both are killed
    KillBoth,
}

/// Result of following an upstream chain
#[derive(Debug, PartialEq, Eq)]
pub struct UpstreamPath {
    pub hops: u32,
}

#[derive(Debug)]
pub struct Directory {
    entities: DashMap<EntityId, Entity>,
    by_name: DashMap<String, EntityId>,
    by_numnick: DashMap<String, EntityId>,
    me: EntityId,
    whowas: Arc<Whowas>,
    local_server_name: String,
}

impl Directory {
    /// Create the directory seeded with this server's own record.
    pub fn new(mut me: Entity, whowas: Arc<Whowas>) -> Self {
        me.status = EntityStatus::Me;
        me.upstream = me.id;
        let dir = Self {
            entities: DashMap::new(),
            by_name: DashMap::new(),
            by_numnick: DashMap::new(),
            me: me.id,
            whowas,
            local_server_name: me.name.clone(),
        };
        dir.by_name.insert(casefold(&me.name), me.id);
        if let Some(n) = me.numnick {
            dir.by_numnick.insert(n.to_wire(), me.id);
        }
        dir.entities.insert(me.id, me);
        dir
    }

    pub fn me(&self) -> EntityId {
        self.me
    }

    pub fn me_name(&self) -> &str {
        &self.local_server_name
    }

    /// Insert a registered entity into all indices. On a collision the
    /// record is handed back so the caller can release it cleanly.
    pub fn register(&self, entity: Entity) -> std::result::Result<(), (Entity, crate::Error)> {
        let folded = casefold(&entity.name);
        if self.by_name.contains_key(&folded) {
            let err = crate::Error::NickCollision(entity.name.clone());
            return Err((entity, err));
        }
        if let Some(n) = entity.numnick {
            let wire = n.to_wire();
            if self.by_numnick.contains_key(&wire) {
                let err = crate::Error::NumnickCollision(wire);
                return Err((entity, err));
            }
            self.by_numnick.insert(wire, entity.id);
        }
        self.by_name.insert(folded, entity.id);
        self.entities.insert(entity.id, entity);
        Ok(())
    }

    /// Remove an entity from all indices. Departed users are recorded in
    /// the whowas history.
    pub fn unregister(&self, id: EntityId) -> Option<Entity> {
        let (_, entity) = self.entities.remove(&id)?;
        self.by_name.remove(&casefold(&entity.name));
        if let Some(n) = entity.numnick {
            self.by_numnick.remove(&n.to_wire());
        }
        if entity.is_user() {
            if let Some(ref user) = entity.user {
                self.whowas.add(WhowasEntry {
                    nick: entity.name.clone(),
                    username: user.username.clone(),
                    host: user.host.clone(),
                    realname: user.realname.clone(),
                    server: self.server_name_of(&entity),
                    departed_at: Utc::now(),
                });
            }
        }
        Some(entity)
    }

    fn server_name_of(&self, entity: &Entity) -> String {
        if entity.is_local() {
            return self.local_server_name.clone();
        }
        self.get(entity.upstream)
            .map(|up| up.name)
            .unwrap_or_else(|| self.local_server_name.clone())
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<EntityId> {
        self.by_name.get(&casefold(name)).map(|e| *e)
    }

    pub fn lookup_by_numnick(&self, numnick: &str) -> Option<EntityId> {
        self.by_numnick.get(numnick).map(|e| *e)
    }

    pub fn get(&self, id: EntityId) -> Option<Entity> {
        self.entities.get(&id).map(|e| e.value().clone())
    }

    pub fn with_entity_mut<R>(&self, id: EntityId, f: impl FnOnce(&mut Entity) -> R) -> Option<R> {
        self.entities.get_mut(&id).map(|mut e| f(&mut e))
    }

    /// Change an entity's name, keeping the name index coherent.
    pub fn rename(&self, id: EntityId, new_name: &str) -> crate::Result<()> {
        let folded = casefold(new_name);
        if let Some(existing) = self.by_name.get(&folded) {
            if *existing != id {
                return Err(crate::Error::NickCollision(new_name.to_string()));
            }
        }
        let old = self
            .with_entity_mut(id, |e| {
                let old = casefold(&e.name);
                e.name = new_name.to_string();
                old
            })
            .ok_or_else(|| crate::Error::Generic("no such entity".to_string()))?;
        self.by_name.remove(&old);
        self.by_name.insert(folded, id);
        Ok(())
    }

    /// Stable snapshot of all server records, this server included.
    pub fn iterate_servers(&self) -> Vec<EntityId> {
        self.entities
            .iter()
            .filter(|e| e.is_server())
            .map(|e| e.id)
            .collect()
    }

    /// Stable snapshot of locally-attached registered users.
    pub fn iterate_local_users(&self) -> Vec<EntityId> {
        self.entities
            .iter()
            .filter(|e| e.status == EntityStatus::LocalUser)
            .map(|e| e.id)
            .collect()
    }

    /// Directly-linked peer servers.
    pub fn local_server_links(&self) -> Vec<EntityId> {
        self.entities
            .iter()
            .filter(|e| e.status == EntityStatus::LocalServer)
            .map(|e| e.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Walk `upstream` until this server's record, failing on cycles or
    /// chains longer than `max_hops`.
    pub fn path_to_me(&self, id: EntityId, max_hops: u32) -> crate::Result<UpstreamPath> {
        let mut current = id;
        let mut hops = 0;
        loop {
            if current == self.me {
                return Ok(UpstreamPath { hops });
            }
            if hops >= max_hops {
                return Err(crate::Error::Generic("upstream chain exceeds hop limit".to_string()));
            }
            let entity = self
                .get(current)
                .ok_or_else(|| crate::Error::Generic("dangling upstream reference".to_string()))?;
            if entity.upstream == current {
                // local entities root at themselves
                return Ok(UpstreamPath { hops });
            }
            current = entity.upstream;
            hops += 1;
        }
    }

    /// The direct neighbor through which `id` is reached, for routing.
    pub fn route_to(&self, id: EntityId) -> Option<EntityId> {
        const ROUTE_HOP_LIMIT: u32 = 64;
        let mut current = id;
        for _ in 0..ROUTE_HOP_LIMIT {
            let entity = self.get(current)?;
            if entity.upstream == self.me || entity.upstream == current {
                return Some(current);
            }
            current = entity.upstream;
        }
        None
    }

    /// Decide a nick collision by first-seen timestamps.
    pub fn collision_verdict(&self, existing: EntityId, newcomer_first_seen: chrono::DateTime<Utc>) -> CollisionVerdict {
        let existing_seen = match self.get(existing) {
            Some(e) => e.first_seen,
            None => return CollisionVerdict::KillNewcomer,
        };
        if existing_seen < newcomer_first_seen {
            CollisionVerdict::KillNewcomer
        } else if existing_seen > newcomer_first_seen {
            CollisionVerdict::KillExisting
        } else {
            CollisionVerdict::KillBoth
        }
    }

    /// Remove a lost server and everything routed through it in one pass.
    /// Returns the removed entities, users before servers.
    pub fn netsplit(&self, lost: EntityId) -> Vec<Entity> {
        let mut doomed = vec![lost];
        // Transitive closure over upstream chains; the tree is shallow so
        // repeated passes settle quickly.
        loop {
            let mut grew = false;
            for entry in self.entities.iter() {
                if doomed.contains(&entry.id) {
                    continue;
                }
                if doomed.contains(&entry.upstream) {
                    doomed.push(entry.id);
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }
        let mut removed: Vec<Entity> = Vec::with_capacity(doomed.len());
        for id in doomed {
            if let Some(entity) = self.unregister(id) {
                removed.push(entity);
            }
        }
        removed.sort_by_key(|e| e.is_server());
        removed
    }
}

impl crate::crule::NetworkView for Directory {
    fn connected(&self, mask: &str) -> bool {
        self.iterate_servers().into_iter().any(|id| {
            self.get(id)
                .map_or(false, |e| e.id != self.me && crate::utils::mask::matches(mask, &e.name))
        })
    }

    fn directcon(&self, mask: &str) -> bool {
        self.local_server_links()
            .into_iter()
            .any(|id| self.get(id).map_or(false, |e| crate::utils::mask::matches(mask, &e.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ServerRecord, UserRecord};

    fn new_directory() -> Directory {
        let me = Entity::new(EntityStatus::Me, "irc.example".to_string());
        Directory::new(me, Arc::new(Whowas::new(16)))
    }

    fn user(name: &str, upstream: EntityId, local: bool) -> Entity {
        let status = if local { EntityStatus::LocalUser } else { EntityStatus::User };
        let mut e = Entity::new(status, name.to_string());
        e.user = Some(UserRecord::new("u".to_string(), "R".to_string(), "h.example".to_string()));
        e.upstream = if local { e.id } else { upstream };
        e
    }

    fn server(name: &str, upstream: EntityId) -> Entity {
        let mut e = Entity::new(EntityStatus::Server, name.to_string());
        e.server = Some(ServerRecord::default());
        e.upstream = upstream;
        e
    }

    #[test]
    fn test_register_and_lookup() {
        let dir = new_directory();
        let alice = user("Alice", dir.me(), true);
        let id = alice.id;
        dir.register(alice).unwrap();
        assert_eq!(dir.lookup_by_name("alice"), Some(id));
        assert_eq!(dir.lookup_by_name("ALICE"), Some(id));
        assert!(dir.lookup_by_name("bob").is_none());
    }

    #[test]
    fn test_name_collision_rejected() {
        let dir = new_directory();
        dir.register(user("alice", dir.me(), true)).unwrap();
        let dup = user("Alice", dir.me(), true);
        match dir.register(dup) {
            Err((returned, crate::Error::NickCollision(_))) => {
                assert_eq!(returned.name, "Alice");
            }
            other => panic!("expected a collision, got {:?}", other),
        }
    }

    #[test]
    fn test_unregister_feeds_whowas() {
        let whowas = Arc::new(Whowas::new(16));
        let me = Entity::new(EntityStatus::Me, "irc.example".to_string());
        let dir = Directory::new(me, whowas.clone());
        let alice = user("alice", dir.me(), true);
        let id = alice.id;
        dir.register(alice).unwrap();
        dir.unregister(id);
        assert!(dir.lookup_by_name("alice").is_none());
        assert_eq!(whowas.query("alice", 0).len(), 1);
    }

    #[test]
    fn test_collision_verdicts() {
        let dir = new_directory();
        let alice = user("alice", dir.me(), true);
        let id = alice.id;
        let seen = alice.first_seen;
        dir.register(alice).unwrap();

        assert_eq!(
            dir.collision_verdict(id, seen + chrono::Duration::seconds(5)),
            CollisionVerdict::KillNewcomer
        );
        assert_eq!(
            dir.collision_verdict(id, seen - chrono::Duration::seconds(5)),
            CollisionVerdict::KillExisting
        );
        assert_eq!(dir.collision_verdict(id, seen), CollisionVerdict::KillBoth);
    }

    #[test]
    fn test_upstream_path() {
        let dir = new_directory();
        let hub = server("hub.example", dir.me());
        let hub_id = hub.id;
        dir.register(hub).unwrap();
        let remote = user("carol", hub_id, false);
        let remote_id = remote.id;
        dir.register(remote).unwrap();

        assert_eq!(dir.path_to_me(remote_id, 64).unwrap().hops, 2);
        assert!(dir.path_to_me(remote_id, 1).is_err());
        assert_eq!(dir.route_to(remote_id), Some(hub_id));
    }

    #[test]
    fn test_netsplit_removes_subtree() {
        let dir = new_directory();
        let hub = server("hub.example", dir.me());
        let hub_id = hub.id;
        dir.register(hub).unwrap();
        let leaf = server("leaf.example", hub_id);
        let leaf_id = leaf.id;
        dir.register(leaf).unwrap();

        let mut users = Vec::new();
        for i in 0..37 {
            let u = user(&format!("user{}", i), if i % 2 == 0 { hub_id } else { leaf_id }, false);
            users.push(u.id);
            dir.register(u).unwrap();
        }
        let local = user("alice", dir.me(), true);
        dir.register(local).unwrap();

        let before = dir.len();
        let removed = dir.netsplit(hub_id);
        assert_eq!(removed.len(), 39);
        assert_eq!(dir.len(), before - 39);
        assert!(dir.lookup_by_name("alice").is_some());
        assert!(dir.lookup_by_name("hub.example").is_none());
        // users are reported ahead of servers
        assert!(removed.first().unwrap().is_user());
        assert!(removed.last().unwrap().is_server());
    }

    #[test]
    fn test_network_view() {
        use crate::crule::NetworkView;
        let dir = new_directory();
        let hub = {
            let mut e = server("hub.example", dir.me());
            e.status = EntityStatus::LocalServer;
            e
        };
        let hub_id = hub.id;
        dir.register(hub).unwrap();
        dir.register(server("leaf.example", hub_id)).unwrap();

        assert!(dir.connected("*.example"));
        assert!(dir.directcon("hub.example"));
        assert!(!dir.directcon("leaf.example"));
    }
}
