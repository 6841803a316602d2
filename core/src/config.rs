//! Configuration: the operator-authored policy snapshot
//!
//! The policy file is TOML. Loading produces an immutable snapshot of
//! semantic objects; a rehash builds a fresh snapshot and reconciles it
//! against the live one rather than mutating in place.

use crate::crule::{self, CRuleKind, CRuleNode};
use crate::utils::mask;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Policy item kind bits
pub const CONF_CLIENT: u32 = 0x0002;
pub const CONF_SERVER: u32 = 0x0004;
pub const CONF_OPERATOR: u32 = 0x0020;
pub const CONF_UWORLD: u32 = 0x8000;

/// Item kinds that count attached clients
pub const CONF_CLIENT_MASK: u32 = CONF_CLIENT | CONF_OPERATOR | CONF_SERVER;

/// This server's own identity block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConf {
    pub name: String,
    pub description: String,
    /// Globally-assigned numeric, rendered as the 2-character link prefix
    pub numeric: u32,
    #[serde(default)]
    pub location1: String,
    #[serde(default)]
    pub location2: String,
    #[serde(default)]
    pub contact: String,
}

impl Default for LocalConf {
    fn default() -> Self {
        Self {
            name: "irc.example".to_string(),
            description: "An IRC server".to_string(),
            numeric: 0,
            location1: String::new(),
            location2: String::new(),
            contact: String::new(),
        }
    }
}

/// Tunable policy constants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Features {
    #[serde(default = "defaults::listen_address")]
    pub listen_address: String,
    #[serde(default = "defaults::listen_port")]
    pub listen_port: u16,
    #[serde(default = "defaults::max_connections")]
    pub max_connections: usize,
    #[serde(default = "defaults::max_hops")]
    pub max_hops: u32,
    #[serde(default = "defaults::whowas_size")]
    pub whowas_size: usize,
    #[serde(default = "defaults::default_sendq")]
    pub default_sendq: usize,
    #[serde(default = "defaults::ping_frequency")]
    pub ping_frequency: u64,
    #[serde(default = "defaults::registration_timeout")]
    pub registration_timeout: u64,
    #[serde(default = "defaults::nick_delay")]
    pub nick_delay: u64,
    #[serde(default = "defaults::target_delay")]
    pub target_delay: u64,
    #[serde(default = "defaults::start_targets")]
    pub start_targets: u32,
}

mod defaults {
    pub fn listen_address() -> String { "0.0.0.0".to_string() }
    pub fn listen_port() -> u16 { 6667 }
    pub fn max_connections() -> usize { 1024 }
    pub fn max_hops() -> u32 { 64 }
    pub fn whowas_size() -> usize { 1024 }
    pub fn default_sendq() -> usize { 40960 }
    pub fn ping_frequency() -> u64 { 90 }
    pub fn registration_timeout() -> u64 { 60 }
    pub fn nick_delay() -> u64 { 30 }
    pub fn target_delay() -> u64 { 120 }
    pub fn start_targets() -> u32 { 20 }
}

impl Default for Features {
    fn default() -> Self {
        Self {
            listen_address: defaults::listen_address(),
            listen_port: defaults::listen_port(),
            max_connections: defaults::max_connections(),
            max_hops: defaults::max_hops(),
            whowas_size: defaults::whowas_size(),
            default_sendq: defaults::default_sendq(),
            ping_frequency: defaults::ping_frequency(),
            registration_timeout: defaults::registration_timeout(),
            nick_delay: defaults::nick_delay(),
            target_delay: defaults::target_delay(),
            start_targets: defaults::start_targets(),
        }
    }
}

/// Connection class: shared quotas for the items that reference it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionClass {
    pub name: String,
    #[serde(default = "defaults_class::max_links")]
    pub max_links: u32,
    #[serde(default = "defaults::ping_frequency")]
    pub ping_freq: u64,
    #[serde(default = "defaults_class::connect_freq")]
    pub connect_freq: u64,
    #[serde(default = "defaults::default_sendq")]
    pub sendq_limit: usize,
    #[serde(default = "defaults_class::max_per_ip")]
    pub max_per_ip: u32,
}

mod defaults_class {
    pub fn max_links() -> u32 { 100 }
    pub fn connect_freq() -> u64 { 300 }
    pub fn max_per_ip() -> u32 { 5 }
}

/// One access-policy item: a Client, Connect, Operator, or Uworld block
#[derive(Debug)]
pub struct ConfItem {
    pub status: u32,
    /// Peer name (server or operator name); empty for Client blocks
    pub name: String,
    pub host: String,
    pub username: String,
    /// SHA-256 hex digest for operators, link password for servers
    pub password: Option<String>,
    pub class_name: String,
    pub address: Option<IpAddr>,
    pub port: Option<u16>,
    /// Mask limiting the servers this link may introduce
    pub hub_limit: Option<String>,
    /// Earliest time to attempt an outbound connect
    pub hold_until: Option<DateTime<Utc>>,
    /// CIDR width for address matches
    pub bits: u8,
    /// Per-IP cap for Client blocks
    pub max_per_ip: u32,
    pub privileges: HashSet<String>,
    clients: AtomicU32,
    illegal: AtomicBool,
}

impl ConfItem {
    pub fn attach_count(&self) -> u32 {
        self.clients.load(Ordering::Relaxed)
    }

    pub fn inc_clients(&self) {
        self.clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_clients(&self) {
        let prev = self.clients.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "detach without matching attach");
    }

    pub fn is_illegal(&self) -> bool {
        self.illegal.load(Ordering::Relaxed)
    }

    pub fn mark_illegal(&self) {
        self.illegal.store(true, Ordering::Relaxed);
    }

    /// Structural identity, ignoring runtime state; a reload keeps items
    /// that compare equal here.
    pub fn same_identity(&self, other: &ConfItem) -> bool {
        self.status == other.status
            && self.name == other.name
            && self.host == other.host
            && self.username == other.username
            && self.password == other.password
            && self.class_name == other.class_name
            && self.address == other.address
            && self.port == other.port
            && self.hub_limit == other.hub_limit
            && self.bits == other.bits
            && self.max_per_ip == other.max_per_ip
            && self.privileges == other.privileges
    }

    pub fn matches_host(&self, host: &str, ip: Option<IpAddr>) -> bool {
        if mask::matches(&self.host, host) {
            return true;
        }
        match (self.address, ip) {
            (Some(prefix), Some(addr)) if self.bits > 0 => mask::matches_cidr(prefix, self.bits, addr),
            _ => false,
        }
    }
}

/// Deny rule evaluated at client admission (a K-line)
#[derive(Debug, Clone)]
pub struct DenyConf {
    pub usermask: String,
    pub hostmask: String,
    pub message: String,
    pub address: Option<IpAddr>,
    pub bits: u8,
    pub realname: Option<String>,
}

impl DenyConf {
    pub fn matches(&self, user: &str, host: &str, ip: Option<IpAddr>, realname: &str) -> bool {
        if let Some(ref pattern) = self.realname {
            if mask::matches(pattern, realname) {
                return true;
            }
        }
        if let (Some(prefix), Some(addr)) = (self.address, ip) {
            if mask::matches_cidr(prefix, self.bits, addr)
                && (self.usermask.is_empty() || mask::matches(&self.usermask, user))
            {
                return true;
            }
        }
        !self.hostmask.is_empty() && mask::matches_user_host(&self.usermask, &self.hostmask, user, host)
    }
}

/// A parsed connection rule
#[derive(Debug, Clone)]
pub struct CRuleConf {
    pub mask: String,
    pub rule: String,
    pub kind: CRuleKind,
    pub node: CRuleNode,
}

/// Channel barred from use
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quarantine {
    pub channel: String,
    pub reason: String,
}

/// A service pseudo-command target, `nick@server`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NickHost {
    pub nick: String,
    pub server: String,
}

/// Mapping from a pseudo-command to a set of service targets
#[derive(Debug, Clone)]
pub struct ServiceMap {
    pub name: String,
    pub command: String,
    pub prepend: Option<String>,
    pub targets: Vec<NickHost>,
}

/// SHA-256 password digests, hex encoded
pub struct PasswordHasher;

impl PasswordHasher {
    pub fn hash_password(password: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn verify_password(password: &str, hash: &str) -> bool {
        Self::hash_password(password) == hash
    }
}

// ---------------------------------------------------------------------------
// Raw (on-disk) form

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawConfig {
    #[serde(default)]
    server: LocalConf,
    #[serde(default)]
    features: Features,
    #[serde(default)]
    class: Vec<ConnectionClass>,
    #[serde(default)]
    client: Vec<RawClient>,
    #[serde(default)]
    connect: Vec<RawConnect>,
    #[serde(default)]
    operator: Vec<RawOperator>,
    #[serde(default)]
    deny: Vec<RawDeny>,
    #[serde(default)]
    crule: Vec<RawCRule>,
    #[serde(default)]
    quarantine: Vec<Quarantine>,
    #[serde(default)]
    service: Vec<RawService>,
    #[serde(default)]
    uworld: Vec<RawUworld>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawClient {
    host: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: Option<String>,
    class: String,
    #[serde(default)]
    ip: Option<IpAddr>,
    #[serde(default)]
    bits: u8,
    #[serde(default)]
    max_per_ip: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawConnect {
    name: String,
    host: String,
    port: u16,
    password: String,
    class: String,
    #[serde(default)]
    hub_limit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawOperator {
    name: String,
    host: String,
    #[serde(default = "any_mask")]
    username: String,
    /// SHA-256 hex digest of the operator password
    password_hash: String,
    class: String,
    #[serde(default)]
    privileges: Vec<String>,
}

fn any_mask() -> String {
    "*".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawDeny {
    #[serde(default)]
    usermask: String,
    #[serde(default)]
    hostmask: String,
    message: String,
    #[serde(default)]
    ip: Option<IpAddr>,
    #[serde(default)]
    bits: u8,
    #[serde(default)]
    realname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawCRule {
    mask: String,
    rule: String,
    /// Apply to operator-requested connects as well as automatic ones
    #[serde(default)]
    all: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawService {
    name: String,
    #[serde(default = "privmsg_command")]
    command: String,
    #[serde(default)]
    prepend: Option<String>,
    targets: Vec<String>,
}

fn privmsg_command() -> String {
    "PRIVMSG".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawUworld {
    name: String,
}

// ---------------------------------------------------------------------------
// Snapshot

/// An immutable policy snapshot built from one parse of the file
#[derive(Debug, Default)]
pub struct Config {
    pub local: LocalConf,
    pub features: Features,
    pub classes: Vec<Arc<ConnectionClass>>,
    pub items: Vec<Arc<ConfItem>>,
    pub denies: Vec<DenyConf>,
    pub crules: Vec<CRuleConf>,
    pub quarantines: Vec<Quarantine>,
    pub services: Vec<ServiceMap>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.as_ref().display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let raw: RawConfig =
            toml::from_str(content).map_err(|e| Error::Config(format!("parse failure: {}", e)))?;
        Self::build(raw)
    }

    fn build(raw: RawConfig) -> Result<Self> {
        let mut config = Config {
            local: raw.server,
            features: raw.features,
            classes: raw.class.into_iter().map(Arc::new).collect(),
            ..Default::default()
        };

        for c in raw.client {
            config.items.push(Arc::new(ConfItem {
                status: CONF_CLIENT,
                name: String::new(),
                host: c.host,
                username: c.username,
                password: c.password,
                class_name: c.class,
                address: c.ip,
                port: None,
                hub_limit: None,
                hold_until: None,
                bits: c.bits,
                max_per_ip: c.max_per_ip.unwrap_or(0),
                privileges: HashSet::new(),
                clients: AtomicU32::new(0),
                illegal: AtomicBool::new(false),
            }));
        }
        for c in raw.connect {
            config.items.push(Arc::new(ConfItem {
                status: CONF_SERVER,
                name: c.name,
                host: c.host,
                username: String::new(),
                password: Some(c.password),
                class_name: c.class,
                address: None,
                port: Some(c.port),
                hub_limit: c.hub_limit,
                hold_until: None,
                bits: 0,
                max_per_ip: 0,
                privileges: HashSet::new(),
                clients: AtomicU32::new(0),
                illegal: AtomicBool::new(false),
            }));
        }
        for o in raw.operator {
            config.items.push(Arc::new(ConfItem {
                status: CONF_OPERATOR,
                name: o.name,
                host: o.host,
                username: o.username,
                password: Some(o.password_hash),
                class_name: o.class,
                address: None,
                port: None,
                hub_limit: None,
                hold_until: None,
                bits: 0,
                max_per_ip: 0,
                privileges: o.privileges.into_iter().collect(),
                clients: AtomicU32::new(0),
                illegal: AtomicBool::new(false),
            }));
        }
        for u in raw.uworld {
            config.items.push(Arc::new(ConfItem {
                status: CONF_UWORLD,
                name: u.name,
                host: "*".to_string(),
                username: String::new(),
                password: None,
                class_name: String::new(),
                address: None,
                port: None,
                hub_limit: None,
                hold_until: None,
                bits: 0,
                max_per_ip: 0,
                privileges: HashSet::new(),
                clients: AtomicU32::new(0),
                illegal: AtomicBool::new(false),
            }));
        }

        config.denies = raw
            .deny
            .into_iter()
            .map(|d| DenyConf {
                usermask: d.usermask,
                hostmask: d.hostmask,
                message: d.message,
                address: d.ip,
                bits: d.bits,
                realname: d.realname,
            })
            .collect();

        for r in raw.crule {
            let node = crule::parse(&r.rule)?;
            config.crules.push(CRuleConf {
                mask: r.mask,
                rule: r.rule,
                kind: if r.all { CRuleKind::All } else { CRuleKind::Auto },
                node,
            });
        }

        config.quarantines = raw.quarantine;

        for s in raw.service {
            let mut targets = Vec::with_capacity(s.targets.len());
            for t in &s.targets {
                let (nick, server) = t
                    .split_once('@')
                    .ok_or_else(|| Error::Config(format!("service target {:?} is not nick@server", t)))?;
                targets.push(NickHost { nick: nick.to_string(), server: server.to_string() });
            }
            config.services.push(ServiceMap {
                name: s.name,
                command: s.command,
                prepend: s.prepend,
                targets,
            });
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.local.name.is_empty() || !self.local.name.contains('.') {
            return Err(Error::Config(format!("bad server name {:?}", self.local.name)));
        }
        if self.local.numeric > crate::numnick::MAX_SERVER {
            return Err(Error::Config(format!("server numeric {} out of range", self.local.numeric)));
        }
        let mut seen = HashSet::new();
        for class in &self.classes {
            if !seen.insert(class.name.clone()) {
                return Err(Error::Config(format!("duplicate class {:?}", class.name)));
            }
        }
        for item in &self.items {
            if item.status != CONF_UWORLD && self.find_class(&item.class_name).is_none() {
                return Err(Error::Config(format!("unknown class {:?}", item.class_name)));
            }
        }
        Ok(())
    }

    pub fn find_class(&self, name: &str) -> Option<Arc<ConnectionClass>> {
        self.classes.iter().find(|c| c.name == name).cloned()
    }

    /// Class for an item, falling back to built-in defaults.
    pub fn class_of(&self, item: &ConfItem) -> ConnectionClass {
        self.find_class(&item.class_name)
            .map(|c| (*c).clone())
            .unwrap_or_else(|| ConnectionClass {
                name: "default".to_string(),
                max_links: defaults_class::max_links(),
                ping_freq: defaults::ping_frequency(),
                connect_freq: defaults_class::connect_freq(),
                sendq_limit: self.features.default_sendq,
                max_per_ip: defaults_class::max_per_ip(),
            })
    }

    /// First Connect block whose name matches, exactly or by mask.
    pub fn conf_find_server(&self, name: &str) -> Option<Arc<ConfItem>> {
        self.items
            .iter()
            .find(|i| i.status & CONF_SERVER != 0 && (i.name == name || mask::matches(&i.name, name)))
            .cloned()
    }

    /// Exact item match by name, user, and host for a status mask.
    pub fn find_conf_exact(
        &self,
        name: &str,
        user: &str,
        host: &str,
        statmask: u32,
    ) -> Option<Arc<ConfItem>> {
        self.items
            .iter()
            .find(|i| {
                i.status & statmask != 0
                    && !i.is_illegal()
                    && i.name == name
                    && mask::matches_user_host(&i.username, &i.host, user, host)
            })
            .cloned()
    }

    pub fn find_quarantine(&self, channel: &str) -> Option<&str> {
        use crate::utils::string::names_equal;
        self.quarantines
            .iter()
            .find(|q| names_equal(&q.channel, channel))
            .map(|q| q.reason.as_str())
    }

    pub fn find_service(&self, name: &str) -> Option<&ServiceMap> {
        self.services.iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn is_uworld(&self, server: &str) -> bool {
        self.items
            .iter()
            .any(|i| i.status & CONF_UWORLD != 0 && mask::matches(&i.name, server))
    }

    /// First matching fired rule's text for a server name.
    pub fn eval_crule(&self, name: &str, kind: CRuleKind, view: &dyn crule::NetworkView) -> Option<&str> {
        self.crules
            .iter()
            .filter(|r| r.kind == CRuleKind::All || kind == CRuleKind::Auto)
            .filter(|r| mask::matches(&r.mask, name))
            .find(|r| r.node.eval(view))
            .map(|r| r.rule.as_str())
    }
}
