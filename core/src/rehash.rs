//! Runtime policy reload
//!
//! A reload parses the file into a fresh snapshot and reconciles it with
//! the live one: structurally-identical items survive with their
//! attachments intact, vanished items are flagged illegal and detached
//! from every client, and operators whose Operator blocks disappeared are
//! deopered but stay connected. A parse failure leaves the old snapshot
//! in place.

use crate::admission::AdmissionControl;
use crate::config::{Config, ConfItem, CONF_OPERATOR};
use crate::entity::{sno, EntityId};
use crate::send::SendContext;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// What a completed reload did
#[derive(Debug, Default)]
pub struct RehashOutcome {
    /// Items carried over unchanged
    pub kept: usize,
    /// Items new in this snapshot
    pub added: usize,
    /// Old items flagged illegal
    pub retired: usize,
    /// Illegal items with no remaining attachments, dropped outright
    pub reclaimed: usize,
    /// Operators stripped of +o/+O because their block vanished
    pub deopered: Vec<EntityId>,
    /// Clients flagged for disconnect because a deny rule now matches
    pub killed: Vec<EntityId>,
}

/// Reload from a file path. On any error the caller keeps its snapshot.
pub fn rehash_file(
    ctx: &SendContext<'_>,
    admission: &AdmissionControl,
    old: &Config,
    path: &str,
) -> Result<(Config, RehashOutcome)> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {}", path, e)))?;
    rehash_from_toml(ctx, admission, old, &content)
}

/// Reload from already-read configuration text.
pub fn rehash_from_toml(
    ctx: &SendContext<'_>,
    admission: &AdmissionControl,
    old: &Config,
    content: &str,
) -> Result<(Config, RehashOutcome)> {
    let mut fresh = match Config::from_toml(content) {
        Ok(c) => c,
        Err(e) => {
            warn!("rehash aborted, keeping active policy: {}", e);
            return Err(e);
        }
    };

    let mut outcome = RehashOutcome::default();

    // Carry identical items over so their attachments survive untouched.
    let mut items: Vec<Arc<ConfItem>> = Vec::with_capacity(fresh.items.len());
    for new_item in fresh.items.drain(..) {
        match old.items.iter().find(|o| o.same_identity(&new_item)) {
            Some(kept) => {
                outcome.kept += 1;
                items.push(kept.clone());
            }
            None => {
                outcome.added += 1;
                items.push(new_item);
            }
        }
    }
    for old_item in &old.items {
        if !items.iter().any(|i| Arc::ptr_eq(i, old_item)) {
            old_item.mark_illegal();
            outcome.retired += 1;
        }
    }
    fresh.items = items;

    // Every attached client drops its illegal items and is re-evaluated
    // against the new snapshot.
    for id in ctx.directory.iterate_local_users() {
        reconcile_client(ctx, admission, &fresh, id, &mut outcome);
    }

    // Illegal items nobody holds any more are reclaimed with the old
    // snapshot; count them for the notice.
    outcome.reclaimed = old
        .items
        .iter()
        .filter(|i| i.is_illegal() && i.attach_count() == 0)
        .count();

    for &id in &outcome.deopered {
        if let Some(entity) = ctx.directory.get(id) {
            ctx.send_opmask_notice(
                None,
                sno::SNO_OLDSNO,
                &format!("{} is no longer an operator (block removed)", entity.name),
            );
        }
    }
    info!(
        kept = outcome.kept,
        added = outcome.added,
        retired = outcome.retired,
        reclaimed = outcome.reclaimed,
        "configuration reloaded"
    );
    ctx.send_opmask_notice(None, sno::SNO_REHASH, "Rehash completed");

    Ok((fresh, outcome))
}

fn reconcile_client(
    ctx: &SendContext<'_>,
    admission: &AdmissionControl,
    fresh: &Config,
    id: EntityId,
    outcome: &mut RehashOutcome,
) {
    let dropped_oper = ctx
        .directory
        .with_entity_mut(id, |entity| {
            let was_oper = entity.is_oper();
            admission.detach_illegal(entity);
            let has_oper_conf = entity.confs.iter().any(|c| c.status & CONF_OPERATOR != 0);
            if was_oper && !has_oper_conf {
                if let Some(user) = entity.user.as_mut() {
                    user.modes.remove(&'o');
                    user.modes.remove(&'O');
                    user.snomask = 0;
                }
                return true;
            }
            false
        })
        .unwrap_or(false);
    if dropped_oper {
        outcome.deopered.push(id);
    }

    // Reattach clients whose Client block vanished; a client no new block
    // accepts, or that a new deny rule matches, is flagged for the reaper.
    let needs_attach = ctx
        .directory
        .get(id)
        .map(|e| e.confs.is_empty())
        .unwrap_or(false);
    if needs_attach {
        let accepted = ctx
            .directory
            .with_entity_mut(id, |entity| {
                let check = admission.check_client(fresh, entity, None);
                check.result == crate::admission::AuthorizationCheckResult::Ok
            })
            .unwrap_or(false);
        if !accepted {
            outcome.killed.push(id);
            return;
        }
    }

    let denied = ctx.directory.get(id).map_or(false, |entity| {
        entity.user.as_ref().map_or(false, |u| {
            admission
                .find_kill(fresh, &u.username, &u.host, None, &u.realname)
                .is_some()
        })
    });
    if denied {
        outcome.killed.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelMap;
    use crate::config::{PasswordHasher, CONF_CLIENT};
    use crate::connection::ConnectionTable;
    use crate::directory::Directory;
    use crate::entity::{Entity, EntityStatus, UserRecord};
    use crate::history::Whowas;

    fn config_with_oper(include_oper: bool) -> String {
        let oper = if include_oper {
            format!(
                r#"
                [[operator]]
                name = "bob"
                host = "*"
                password_hash = "{}"
                class = "default"
                "#,
                PasswordHasher::hash_password("sesame")
            )
        } else {
            String::new()
        };
        format!(
            r#"
            [server]
            name = "irc.example"
            description = "test"
            numeric = 0

            [[class]]
            name = "default"
            max_links = 100

            [[client]]
            host = "*"
            class = "default"
            {}
            "#,
            oper
        )
    }

    struct Fixture {
        directory: Directory,
        channels: ChannelMap,
        connections: ConnectionTable,
        admission: AdmissionControl,
    }

    impl Fixture {
        fn new() -> Self {
            let me = Entity::new(EntityStatus::Me, "irc.example".to_string());
            Self {
                directory: Directory::new(me, std::sync::Arc::new(Whowas::new(16))),
                channels: ChannelMap::new(),
                connections: ConnectionTable::new(),
                admission: AdmissionControl::new(),
            }
        }

        fn ctx(&self) -> SendContext<'_> {
            SendContext {
                directory: &self.directory,
                channels: &self.channels,
                connections: &self.connections,
            }
        }

        fn admit_oper(&self, config: &Config) -> EntityId {
            let mut bob = Entity::new(EntityStatus::LocalUser, "bob".to_string());
            bob.user = Some(UserRecord::new("u".to_string(), "R".to_string(), "h.example".to_string()));
            let id = bob.id;
            self.admission.check_client(config, &mut bob, None);
            let oper = self
                .admission
                .check_oper(config, "bob", "sesame", "u", "h.example")
                .unwrap();
            self.admission.attach(config, &mut bob, &oper, None);
            bob.user.as_mut().unwrap().modes.insert('o');
            self.directory.register(bob).unwrap();
            id
        }
    }

    #[test]
    fn test_unchanged_reload_is_noop() {
        let fix = Fixture::new();
        let old = Config::from_toml(&config_with_oper(true)).unwrap();
        let bob = fix.admit_oper(&old);

        let (new_config, outcome) =
            rehash_from_toml(&fix.ctx(), &fix.admission, &old, &config_with_oper(true)).unwrap();

        assert_eq!(outcome.kept, old.items.len());
        assert_eq!(outcome.added, 0);
        assert_eq!(outcome.retired, 0);
        assert!(outcome.deopered.is_empty());
        // identical items are the same allocations, attachments intact
        for (a, b) in old.items.iter().zip(new_config.items.iter()) {
            assert!(Arc::ptr_eq(a, b));
        }
        let entity = fix.directory.get(bob).unwrap();
        assert_eq!(entity.confs.len(), 2);
        assert!(entity.is_oper());
    }

    #[test]
    fn test_removed_oper_block_deopers_but_keeps_client() {
        let fix = Fixture::new();
        let old = Config::from_toml(&config_with_oper(true)).unwrap();
        let bob = fix.admit_oper(&old);
        let oper_item = old
            .items
            .iter()
            .find(|i| i.status & CONF_OPERATOR != 0)
            .cloned()
            .unwrap();

        let (_new_config, outcome) =
            rehash_from_toml(&fix.ctx(), &fix.admission, &old, &config_with_oper(false)).unwrap();

        assert_eq!(outcome.deopered, vec![bob]);
        assert!(outcome.killed.is_empty());
        let entity = fix.directory.get(bob).unwrap();
        assert!(!entity.is_oper());
        assert_eq!(entity.confs.len(), 1);
        assert_eq!(entity.confs[0].status, CONF_CLIENT);
        assert!(oper_item.is_illegal());
        assert_eq!(oper_item.attach_count(), 0);
        assert_eq!(outcome.reclaimed, 1);
    }

    #[test]
    fn test_parse_failure_keeps_old_snapshot() {
        let fix = Fixture::new();
        let old = Config::from_toml(&config_with_oper(true)).unwrap();
        assert!(rehash_from_toml(&fix.ctx(), &fix.admission, &old, "not [valid").is_err());
        assert!(!old.items.iter().any(|i| i.is_illegal()));
    }

    #[test]
    fn test_new_deny_rule_flags_matching_clients() {
        let fix = Fixture::new();
        let old = Config::from_toml(&config_with_oper(false)).unwrap();
        let bob = fix.admit_oper_less(&old);

        let with_deny = format!(
            "{}\n[[deny]]\nusermask = \"*\"\nhostmask = \"*.example\"\nmessage = \"banned\"\n",
            config_with_oper(false)
        );
        let (_cfg, outcome) =
            rehash_from_toml(&fix.ctx(), &fix.admission, &old, &with_deny).unwrap();
        assert_eq!(outcome.killed, vec![bob]);
    }

    impl Fixture {
        fn admit_oper_less(&self, config: &Config) -> EntityId {
            let mut bob = Entity::new(EntityStatus::LocalUser, "bob".to_string());
            bob.user = Some(UserRecord::new("u".to_string(), "R".to_string(), "h.example".to_string()));
            let id = bob.id;
            self.admission.check_client(config, &mut bob, None);
            self.directory.register(bob).unwrap();
            id
        }
    }
}
