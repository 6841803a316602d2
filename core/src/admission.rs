//! Admission control: evaluating the policy snapshot for new links
//!
//! `check_client` runs the deny list and the Client-block walk for every
//! finished client handshake; `check_server` authenticates incoming peer
//! links. Attachments are refcounted on the policy items themselves so a
//! reload can tell which items are still in use.

use crate::config::{Config, ConfItem, CONF_CLIENT, CONF_OPERATOR, CONF_SERVER};
use crate::entity::Entity;
use crate::utils::mask;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Outcome of an authorization check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationCheckResult {
    Ok,
    NoAuthorization,
    TooManyInClass,
    TooManyFromIp,
    AlreadyAuthorized,
    BadSocket,
}

/// Check result plus the text owed to a rejected client
#[derive(Debug)]
pub struct ClientCheck {
    pub result: AuthorizationCheckResult,
    pub message: Option<String>,
}

impl ClientCheck {
    fn ok() -> Self {
        Self { result: AuthorizationCheckResult::Ok, message: None }
    }

    fn rejected(result: AuthorizationCheckResult, message: impl Into<String>) -> Self {
        Self { result, message: Some(message.into()) }
    }
}

/// Why a server link was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerCheckError {
    NoConnectBlock,
    BadPassword,
    HubLimited(String),
}

/// Live admission state: per-IP and per-class connection counts
#[derive(Debug, Default)]
pub struct AdmissionControl {
    per_ip: DashMap<IpAddr, u32>,
    per_class: DashMap<String, u32>,
}

impl AdmissionControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted socket before any policy runs.
    pub fn note_connect(&self, ip: IpAddr) {
        *self.per_ip.entry(ip).or_insert(0) += 1;
    }

    /// Forget a closed socket.
    pub fn note_disconnect(&self, ip: IpAddr) {
        if let Some(mut count) = self.per_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                drop(count);
                self.per_ip.remove(&ip);
            }
        }
    }

    pub fn connections_from(&self, ip: IpAddr) -> u32 {
        self.per_ip.get(&ip).map(|c| *c).unwrap_or(0)
    }

    pub fn class_usage(&self, class: &str) -> u32 {
        self.per_class.get(class).map(|c| *c).unwrap_or(0)
    }

    /// Full client admission: deny rules first, then the Client blocks in
    /// configuration order. The first matching block decides.
    pub fn check_client(
        &self,
        config: &Config,
        entity: &mut Entity,
        ip: Option<IpAddr>,
    ) -> ClientCheck {
        if !entity.confs.is_empty() {
            return ClientCheck {
                result: AuthorizationCheckResult::AlreadyAuthorized,
                message: None,
            };
        }
        let (username, host, realname) = match entity.user {
            Some(ref u) => (u.username.clone(), u.host.clone(), u.realname.clone()),
            None => {
                return ClientCheck {
                    result: AuthorizationCheckResult::BadSocket,
                    message: None,
                }
            }
        };

        if let Some(deny) = self.find_kill(config, &username, &host, ip, &realname) {
            return ClientCheck::rejected(
                AuthorizationCheckResult::NoAuthorization,
                deny.message.clone(),
            );
        }

        for item in &config.items {
            if item.status & CONF_CLIENT == 0 || item.is_illegal() {
                continue;
            }
            if !item.matches_host(&host, ip) {
                continue;
            }
            if !item.username.is_empty() && !mask::matches(&item.username, &username) {
                continue;
            }
            let result = self.attach(config, entity, item, ip);
            return match result {
                AuthorizationCheckResult::Ok => ClientCheck::ok(),
                AuthorizationCheckResult::TooManyInClass => ClientCheck::rejected(
                    result,
                    "Sorry, your connection class is full - try again later",
                ),
                AuthorizationCheckResult::TooManyFromIp => ClientCheck::rejected(
                    result,
                    "Too many connections from your host",
                ),
                other => ClientCheck { result: other, message: None },
            };
        }

        ClientCheck::rejected(AuthorizationCheckResult::NoAuthorization, "No authorization")
    }

    /// First deny rule matching the client, in configuration order.
    pub fn find_kill<'a>(
        &self,
        config: &'a Config,
        user: &str,
        host: &str,
        ip: Option<IpAddr>,
        realname: &str,
    ) -> Option<&'a crate::config::DenyConf> {
        config.denies.iter().find(|d| d.matches(user, host, ip, realname))
    }

    /// Attach an entity to a policy item, enforcing class and per-IP
    /// quotas. Bumps the item's refcount on success.
    pub fn attach(
        &self,
        config: &Config,
        entity: &mut Entity,
        item: &Arc<ConfItem>,
        ip: Option<IpAddr>,
    ) -> AuthorizationCheckResult {
        if entity.confs.iter().any(|c| Arc::ptr_eq(c, item)) {
            return AuthorizationCheckResult::AlreadyAuthorized;
        }
        let class = config.class_of(item);

        item.inc_clients();
        let mut usage = self.per_class.entry(class.name.clone()).or_insert(0);
        *usage += 1;
        if *usage > class.max_links {
            *usage -= 1;
            drop(usage);
            item.dec_clients();
            return AuthorizationCheckResult::TooManyInClass;
        }
        drop(usage);

        if item.status & CONF_CLIENT != 0 {
            let cap = if item.max_per_ip > 0 { item.max_per_ip } else { class.max_per_ip };
            if let Some(ip) = ip {
                if cap > 0 && self.connections_from(ip) > cap {
                    self.detach_one(item);
                    return AuthorizationCheckResult::TooManyFromIp;
                }
            }
        }

        entity.confs.push(item.clone());
        AuthorizationCheckResult::Ok
    }

    fn detach_one(&self, item: &Arc<ConfItem>) {
        item.dec_clients();
        if let Some(mut usage) = self.per_class.get_mut(&item.class_name) {
            *usage = usage.saturating_sub(1);
        }
    }

    /// Drop every attachment the entity holds.
    pub fn detach_all(&self, entity: &mut Entity) {
        for item in entity.confs.drain(..) {
            self.detach_one(&item);
        }
    }

    /// Drop attachments flagged illegal by a policy reload.
    pub fn detach_illegal(&self, entity: &mut Entity) {
        let keep: Vec<Arc<ConfItem>> = entity
            .confs
            .drain(..)
            .filter_map(|item| {
                if item.is_illegal() {
                    self.detach_one(&item);
                    None
                } else {
                    Some(item)
                }
            })
            .collect();
        entity.confs = keep;
    }

    /// Drop attachments whose status bits fall outside `mask`.
    pub fn det_confs_butmask(&self, entity: &mut Entity, mask: u32) {
        let keep: Vec<Arc<ConfItem>> = entity
            .confs
            .drain(..)
            .filter_map(|item| {
                if item.status & mask != 0 {
                    Some(item)
                } else {
                    self.detach_one(&item);
                    None
                }
            })
            .collect();
        entity.confs = keep;
    }

    /// Authenticate an incoming peer link against its Connect block.
    pub fn check_server(
        &self,
        config: &Config,
        name: &str,
        password: &str,
        host: &str,
        ip: Option<IpAddr>,
    ) -> Result<Arc<ConfItem>, ServerCheckError> {
        let item = config
            .items
            .iter()
            .find(|i| {
                i.status & CONF_SERVER != 0
                    && !i.is_illegal()
                    && mask::matches(&i.name, name)
                    && i.matches_host(host, ip)
            })
            .cloned()
            .ok_or(ServerCheckError::NoConnectBlock)?;
        match item.password {
            Some(ref expected) if expected == password => Ok(item),
            _ => Err(ServerCheckError::BadPassword),
        }
    }

    /// Whether a link's Connect block lets it introduce `child`.
    pub fn hub_allows(&self, item: &ConfItem, child: &str) -> Result<(), ServerCheckError> {
        match item.hub_limit {
            Some(ref limit) if !mask::matches(limit, child) => {
                Err(ServerCheckError::HubLimited(limit.clone()))
            }
            _ => Ok(()),
        }
    }

    /// Authenticate an OPER attempt; returns the Operator block on success.
    pub fn check_oper(
        &self,
        config: &Config,
        name: &str,
        password: &str,
        username: &str,
        host: &str,
    ) -> Option<Arc<ConfItem>> {
        let item = config.find_conf_exact(name, username, host, CONF_OPERATOR)?;
        let hash = item.password.as_deref()?;
        if crate::config::PasswordHasher::verify_password(password, hash) {
            Some(item)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PasswordHasher;
    use crate::entity::{EntityStatus, UserRecord};

    fn sample_config() -> Config {
        let toml = format!(
            r#"
            [server]
            name = "irc.example"
            description = "test"
            numeric = 0

            [[class]]
            name = "default"
            max_links = 2
            max_per_ip = 2

            [[client]]
            host = "*"
            class = "default"

            [[connect]]
            name = "hub.example"
            host = "10.0.0.*"
            port = 4400
            password = "linkpass"
            class = "default"
            hub_limit = "*.example"

            [[operator]]
            name = "bob"
            host = "*.admin.example"
            password_hash = "{}"
            class = "default"
            privileges = ["kill"]

            [[deny]]
            usermask = "*"
            hostmask = "*.spam.example"
            message = "banned"
            "#,
            PasswordHasher::hash_password("sesame")
        );
        Config::from_toml(&toml).unwrap()
    }

    fn local_user(nick: &str, host: &str) -> Entity {
        let mut e = Entity::new(EntityStatus::Unknown, nick.to_string());
        e.user = Some(UserRecord::new("u".to_string(), "Real".to_string(), host.to_string()));
        e
    }

    #[test]
    fn test_admission_ok_attaches() {
        let config = sample_config();
        let adm = AdmissionControl::new();
        let mut alice = local_user("alice", "host.example");
        let check = adm.check_client(&config, &mut alice, None);
        assert_eq!(check.result, AuthorizationCheckResult::Ok);
        assert_eq!(alice.confs.len(), 1);
        assert_eq!(alice.confs[0].attach_count(), 1);
    }

    #[test]
    fn test_deny_rule_wins_over_client_blocks() {
        let config = sample_config();
        let adm = AdmissionControl::new();
        let mut evil = local_user("evil", "host.spam.example");
        let check = adm.check_client(&config, &mut evil, None);
        assert_eq!(check.result, AuthorizationCheckResult::NoAuthorization);
        assert_eq!(check.message.as_deref(), Some("banned"));
        assert!(evil.confs.is_empty());
    }

    #[test]
    fn test_class_limit() {
        let config = sample_config();
        let adm = AdmissionControl::new();
        let mut a = local_user("a", "h1.example");
        let mut b = local_user("b", "h2.example");
        let mut c = local_user("c", "h3.example");
        assert_eq!(adm.check_client(&config, &mut a, None).result, AuthorizationCheckResult::Ok);
        assert_eq!(adm.check_client(&config, &mut b, None).result, AuthorizationCheckResult::Ok);
        let third = adm.check_client(&config, &mut c, None);
        assert_eq!(third.result, AuthorizationCheckResult::TooManyInClass);
        assert_eq!(config.items[0].attach_count(), 2);
    }

    #[test]
    fn test_per_ip_limit() {
        let config = sample_config();
        let adm = AdmissionControl::new();
        let ip: IpAddr = "192.0.2.7".parse().unwrap();
        adm.note_connect(ip);
        adm.note_connect(ip);
        adm.note_connect(ip);
        let mut c = local_user("c", "h.example");
        let check = adm.check_client(&config, &mut c, Some(ip));
        assert_eq!(check.result, AuthorizationCheckResult::TooManyFromIp);
        assert_eq!(config.items[0].attach_count(), 0);
    }

    #[test]
    fn test_detach_balances_counts() {
        let config = sample_config();
        let adm = AdmissionControl::new();
        let mut alice = local_user("alice", "h.example");
        adm.check_client(&config, &mut alice, None);
        assert_eq!(adm.class_usage("default"), 1);
        adm.detach_all(&mut alice);
        assert_eq!(config.items[0].attach_count(), 0);
        assert_eq!(adm.class_usage("default"), 0);
    }

    #[test]
    fn test_det_confs_butmask_keeps_matching() {
        let config = sample_config();
        let adm = AdmissionControl::new();
        let mut bob = local_user("bob", "ops.admin.example");
        adm.check_client(&config, &mut bob, None);
        let oper = config.find_conf_exact("bob", "u", "ops.admin.example", CONF_OPERATOR).unwrap();
        adm.attach(&config, &mut bob, &oper, None);
        assert_eq!(bob.confs.len(), 2);

        adm.det_confs_butmask(&mut bob, CONF_CLIENT);
        assert_eq!(bob.confs.len(), 1);
        assert_eq!(bob.confs[0].status, CONF_CLIENT);
        assert_eq!(oper.attach_count(), 0);
    }

    #[test]
    fn test_check_server() {
        let config = sample_config();
        let adm = AdmissionControl::new();
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        assert!(adm.check_server(&config, "hub.example", "linkpass", "10.0.0.5", Some(ip)).is_ok());
        assert!(matches!(
            adm.check_server(&config, "hub.example", "wrong", "10.0.0.5", Some(ip)),
            Err(ServerCheckError::BadPassword)
        ));
        assert!(matches!(
            adm.check_server(&config, "unknown.example", "x", "10.0.0.5", Some(ip)),
            Err(ServerCheckError::NoConnectBlock)
        ));
    }

    #[test]
    fn test_hub_limit() {
        let config = sample_config();
        let adm = AdmissionControl::new();
        let item = config.conf_find_server("hub.example").unwrap();
        assert!(adm.hub_allows(&item, "leaf.example").is_ok());
        assert!(matches!(
            adm.hub_allows(&item, "rogue.elsewhere"),
            Err(ServerCheckError::HubLimited(_))
        ));
    }

    #[test]
    fn test_oper_auth() {
        let config = sample_config();
        let adm = AdmissionControl::new();
        assert!(adm.check_oper(&config, "bob", "sesame", "u", "ops.admin.example").is_some());
        assert!(adm.check_oper(&config, "bob", "wrong", "u", "ops.admin.example").is_none());
        assert!(adm.check_oper(&config, "bob", "sesame", "u", "elsewhere.example").is_none());
    }
}
