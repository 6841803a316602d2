//! p10d core
//!
//! Core subsystems of a federated IRC server node: the routing directory,
//! the per-dialect send engine, and the configuration/admission pipeline,
//! together with the connection, channel, and lifecycle machinery that
//! ties them to the wire.

pub mod admission;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod connection;
pub mod crule;
pub mod directory;
pub mod entity;
pub mod error;
pub mod history;
pub mod lifecycle;
pub mod lookup;
pub mod message;
pub mod numeric;
pub mod numnick;
pub mod pool;
pub mod rehash;
pub mod send;
pub mod server;
pub mod utils;


pub use admission::{AdmissionControl, AuthorizationCheckResult, ClientCheck, ServerCheckError};
pub use buffer::{ConnectionTiming, MsgBuf, Priority, RecvQueue, SendQueue};
pub use channel::{Channel, ChannelMap, MemberModes, Membership};
pub use config::{Config, ConfItem, ConnectionClass, DenyConf, LocalConf, Quarantine, ServiceMap};
pub use connection::{Connection, ConnectionTable, HandshakeNeeds, LinkKind};
pub use crule::{CRuleKind, CRuleNode, NetworkView};
pub use directory::{CollisionVerdict, Directory};
pub use entity::{Entity, EntityId, EntityStatus, ServerRecord, UserRecord};
pub use error::{Error, Result};
pub use history::{Whowas, WhowasEntry};
pub use lifecycle::Lifecycle;
pub use lookup::LookupService;
pub use message::{Command, Message, Prefix};
pub use numeric::Numeric;
pub use numnick::{Numnick, NumnickAllocator, ServerNumeric, UserNumeric};
pub use pool::{Pool, Pools, Reclaim};
pub use send::{Arg, Dialect, MatchWho, SendContext, SkipFlags};
pub use server::Server;

/// Re-exports for convenience
pub use tracing::{debug, error, info, warn};
