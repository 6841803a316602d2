//! The daemon: listener loop, registration pipeline, command dispatch
//!
//! One current-thread runtime drives everything. Socket tasks only shuttle
//! bytes; every line is handed to `handle_line` in event-loop context, and
//! all shared structures are touched from there.

use crate::admission::{AdmissionControl, AuthorizationCheckResult};
use crate::buffer::Priority;
use crate::channel::{ChannelMap, MemberModes, Membership};
use crate::config::{Config, CONF_SERVER};
use crate::connection::{ConnectionTable, HandshakeNeeds, LinkKind};
use crate::directory::Directory;
use crate::entity::{sno, Entity, EntityId, EntityStatus, ServerRecord, UserRecord};
use crate::history::Whowas;
use crate::lifecycle::Lifecycle;
use crate::lookup::LookupService;
use crate::message::{Command, Message, Prefix};
use crate::numeric::*;
use crate::numnick::{Numnick, NumnickAllocator, ServerNumeric};
use crate::pool::Pools;
use crate::send::{Arg, SendContext, SkipFlags};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bytes a writer task pulls off a queue per wakeup
const DRAIN_BUDGET: usize = 16 * 1024;

pub struct Server {
    config: RwLock<Arc<Config>>,
    config_path: Option<String>,
    pub directory: Directory,
    pub channels: ChannelMap,
    pub connections: ConnectionTable,
    pub whowas: Arc<Whowas>,
    pub admission: AdmissionControl,
    pools: Mutex<Pools>,
    numnicks: Mutex<NumnickAllocator>,
    lookup: LookupService,
    /// Outbound links approved by CONNECT, awaiting a dial attempt
    pending_connects: Mutex<Vec<String>>,
}

impl Server {
    pub fn new(config: Config, config_path: Option<String>) -> Result<Self> {
        config.validate()?;
        let numeric = ServerNumeric::new(config.local.numeric)?;
        let whowas = Arc::new(Whowas::new(config.features.whowas_size));
        let mut me = Entity::new(EntityStatus::Me, config.local.name.clone());
        me.numnick = Some(Numnick::Server(numeric));
        me.server = Some(ServerRecord {
            description: config.local.description.clone(),
            ..Default::default()
        });
        let max_connections = config.features.max_connections;
        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            config_path,
            directory: Directory::new(me, whowas.clone()),
            channels: ChannelMap::new(),
            connections: ConnectionTable::new(),
            whowas,
            admission: AdmissionControl::new(),
            pools: Mutex::new(Pools::with_capacity(max_connections)),
            numnicks: Mutex::new(NumnickAllocator::new(numeric)),
            lookup: LookupService::default(),
            pending_connects: Mutex::new(Vec::new()),
        })
    }

    /// Drain the outbound links queued by CONNECT for the dial loop.
    pub fn take_pending_connects(&self) -> Vec<String> {
        std::mem::take(&mut *self.pending_connects.lock())
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    pub fn ctx(&self) -> SendContext<'_> {
        SendContext {
            directory: &self.directory,
            channels: &self.channels,
            connections: &self.connections,
        }
    }

    fn with_lifecycle<R>(&self, f: impl FnOnce(&Lifecycle<'_>) -> R) -> R {
        let ctx = self.ctx();
        let lc = Lifecycle { ctx: &ctx, admission: &self.admission, pools: &self.pools };
        f(&lc)
    }

    // -----------------------------------------------------------------
    // Socket plumbing

    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let (addr, port) = {
            let config = self.config();
            (config.features.listen_address.clone(), config.features.listen_port)
        };
        let listener = TcpListener::bind((addr.as_str(), port))
            .await
            .map_err(|e| Error::Connection(format!("cannot bind {}:{}: {}", addr, port, e)))?;
        info!("listening on {}:{}", addr, port);

        let ticker = self.clone();
        tokio::task::spawn_local(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                ticker.tick();
                for name in ticker.take_pending_connects() {
                    tokio::task::spawn_local(ticker.clone().dial_peer(name));
                }
            }
        });

        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::task::spawn_local(async move {
                let (read, write) = stream.into_split();
                server.handle_io(read, write, peer).await;
            });
        }
    }

    /// Drive one session over stdin/stdout, for console testing.
    pub async fn run_stdio(self: Arc<Self>) -> Result<()> {
        let peer: SocketAddr = "127.0.0.1:0".parse().map_err(|_| Error::Generic("bad addr".to_string()))?;
        self.handle_io(tokio::io::stdin(), tokio::io::stdout(), peer).await;
        Ok(())
    }

    async fn handle_io<R, W>(self: Arc<Self>, read: R, write: W, peer: SocketAddr)
    where
        R: tokio::io::AsyncRead + Unpin,
        W: tokio::io::AsyncWrite + Unpin,
    {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let conn_id = self.open_connection(peer, wake_tx).await;
        self.drive_connection(read, write, conn_id, wake_rx).await;
    }

    /// Dial a configured peer approved by CONNECT and run the link.
    async fn dial_peer(self: Arc<Self>, name: String) {
        let config = self.config();
        let item = match config.conf_find_server(&name) {
            Some(item) => item,
            None => return,
        };
        let port = item.port.unwrap_or(4400);
        let stream = match tokio::net::TcpStream::connect((item.host.as_str(), port)).await {
            Ok(s) => s,
            Err(e) => {
                self.ctx().send_opmask_notice(
                    None,
                    sno::SNO_NETWORK,
                    &format!("Connection to {} ({}:{}) failed: {}", name, item.host, port, e),
                );
                return;
            }
        };
        let peer = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let conn_id = self.open_connection(peer, wake_tx).await;

        // we initiate: present the shared link password and our own
        // introduction; the peer's SERVER is verified against the same
        // Connect block secret when it arrives
        let password = item.password.clone().unwrap_or_default();
        self.connections.with_conn(conn_id, |c| {
            c.password = Some(password.clone());
        });
        self.connections.enqueue(
            conn_id,
            crate::buffer::MsgBuf::new(format!("PASS :{}\r\n", password)),
            Priority::Normal,
        );
        self.send_server_intro(conn_id);

        let (read, write) = stream.into_split();
        self.drive_connection(read, write, conn_id, wake_rx).await;
    }

    async fn drive_connection<R, W>(
        self: Arc<Self>,
        mut read: R,
        mut write: W,
        conn_id: Uuid,
        mut wake_rx: mpsc::UnboundedReceiver<()>,
    ) where
        R: tokio::io::AsyncRead + Unpin,
        W: tokio::io::AsyncWrite + Unpin,
    {
        let writer = {
            let server = self.clone();
            async move {
                while wake_rx.recv().await.is_some() {
                    loop {
                        let (bytes, empty) = match server.connections.drain(conn_id, DRAIN_BUDGET) {
                            Some(out) => out,
                            None => return,
                        };
                        if !bytes.is_empty() && write.write_all(&bytes).await.is_err() {
                            server.connections.mark_dead(conn_id, "Write error");
                            return;
                        }
                        if empty {
                            break;
                        }
                    }
                    let _ = write.flush().await;
                }
            }
        };

        let reader = {
            let server = self.clone();
            async move {
                let mut buf = [0u8; 2048];
                loop {
                    let n = match read.read(&mut buf).await {
                        Ok(0) | Err(_) => {
                            server.connections.mark_dead(conn_id, "Connection reset");
                            break;
                        }
                        Ok(n) => n,
                    };
                    let mut lines = Vec::new();
                    let alive = server
                        .connections
                        .with_conn(conn_id, |c| {
                            if !c.recvq.append(&buf[..n]) {
                                c.mark_dead("Excess flood");
                                return false;
                            }
                            c.timing.update_activity();
                            loop {
                                match c.recvq.consume_line() {
                                    Ok(Some(line)) => lines.push(line),
                                    Ok(None) => break,
                                    Err(_) => {
                                        c.mark_dead("Excess flood");
                                        return false;
                                    }
                                }
                            }
                            true
                        })
                        .unwrap_or(false);
                    for line in lines {
                        server.handle_line(conn_id, &line);
                    }
                    server.with_lifecycle(|lc| lc.reap());
                    if !alive || !server.connections.contains(conn_id) {
                        break;
                    }
                }
                // tear the link down now so the writer's wake channel
                // closes and its task can end
                server.connections.mark_dead(conn_id, "Connection closed");
                server.with_lifecycle(|lc| lc.reap());
            }
        };

        tokio::join!(reader, writer);
    }

    async fn open_connection(&self, peer: SocketAddr, wake: mpsc::UnboundedSender<()>) -> Uuid {
        self.admission.note_connect(peer.ip());
        let config = self.config();
        let host = if peer.port() == 0 {
            None
        } else {
            self.lookup.reverse_dns(peer.ip()).await.hostname
        };
        let mut conn = self.pools.lock().connections.acquire();
        conn.open(
            peer,
            config.features.default_sendq,
            config.features.ping_frequency,
            config.features.registration_timeout,
            wake,
        );
        conn.host = host;
        debug!(peer = %peer, conn = %conn.id, "accepted connection");
        self.connections.insert(conn)
    }

    /// Periodic maintenance: pings, handshake deadlines, reaping, sweeps.
    pub fn tick(&self) {
        let me = self.directory.me_name().to_string();
        for conn_id in self.connections.ids() {
            enum Action {
                None,
                Ping,
            }
            let action = self
                .connections
                .with_conn(conn_id, |c| {
                    if c.is_dead() {
                        return Action::None;
                    }
                    if c.entity.is_none() {
                        if c.timing.registration_timed_out() {
                            c.mark_dead("Registration timeout");
                        }
                        return Action::None;
                    }
                    if c.timing.ping_timed_out() {
                        c.mark_dead("Ping timeout");
                        Action::None
                    } else if c.timing.should_send_ping() {
                        c.timing.record_ping_sent();
                        Action::Ping
                    } else {
                        Action::None
                    }
                })
                .unwrap_or(Action::None);
            if let Action::Ping = action {
                self.connections.enqueue(
                    conn_id,
                    crate::buffer::MsgBuf::new(format!("PING :{}\r\n", me)),
                    Priority::Normal,
                );
            }
        }
        self.with_lifecycle(|lc| lc.reap());
        self.channels.sweep();
    }

    // -----------------------------------------------------------------
    // Dispatch

    pub fn handle_line(&self, conn_id: Uuid, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let msg = match Message::parse(line) {
            Ok(m) => m,
            Err(e) => {
                debug!(conn = %conn_id, "unparseable line: {}", e);
                return;
            }
        };
        let (entity, kind) = match self.connections.with_conn(conn_id, |c| (c.entity, c.kind)) {
            Some(state) => state,
            None => return,
        };
        match entity {
            None => self.dispatch_unregistered(conn_id, msg),
            Some(id) if kind == LinkKind::Server => self.dispatch_server_link(conn_id, id, msg),
            Some(id) => self.dispatch_client(conn_id, id, msg),
        }
    }

    // -----------------------------------------------------------------
    // Handshake

    fn dispatch_unregistered(&self, conn_id: Uuid, msg: Message) {
        match msg.command {
            Command::Pass => {
                self.connections.with_conn(conn_id, |c| {
                    c.password = msg.params.first().cloned();
                });
            }
            Command::Nick => self.handshake_nick(conn_id, msg),
            Command::User => self.handshake_user(conn_id, msg),
            Command::Server => self.handshake_server(conn_id, msg),
            Command::Quit => {
                self.connections.mark_dead(conn_id, "Client quit");
            }
            Command::Ping => {
                if let Some(token) = msg.params.first() {
                    let me = self.directory.me_name();
                    self.connections.enqueue(
                        conn_id,
                        crate::buffer::MsgBuf::new(format!(":{} PONG {} :{}\r\n", me, me, token)),
                        Priority::Normal,
                    );
                }
            }
            _ => self.reply_unregistered(conn_id, ERR_NOTREGISTERED, ":You have not registered"),
        }
    }

    fn reply_unregistered(&self, conn_id: Uuid, numeric: crate::numeric::Numeric, text: &str) {
        let line = format!(":{} {:03} * {}\r\n", self.directory.me_name(), numeric.code(), text);
        self.connections.enqueue(conn_id, crate::buffer::MsgBuf::new(line), Priority::Normal);
    }

    fn handshake_nick(&self, conn_id: Uuid, msg: Message) {
        let config = self.config();
        let nick = match msg.params.first() {
            Some(n) => n.clone(),
            None => return self.reply_unregistered(conn_id, ERR_NONICKNAMEGIVEN, ":No nickname given"),
        };
        if !crate::utils::string::is_valid_nickname(&nick, 15) {
            return self.reply_unregistered(
                conn_id,
                ERR_ERRONEUSNICKNAME,
                &format!("{} :Erroneous nickname", nick),
            );
        }
        if self.directory.lookup_by_name(&nick).is_some() {
            return self.reply_unregistered(
                conn_id,
                ERR_NICKNAMEINUSE,
                &format!("{} :Nickname is already in use", nick),
            );
        }
        self.connections.with_conn(conn_id, |c| {
            c.pending_nick = Some(nick);
            c.needs.satisfy(HandshakeNeeds::NICK);
        });
        self.try_complete_registration(conn_id, &config);
    }

    fn handshake_user(&self, conn_id: Uuid, msg: Message) {
        let config = self.config();
        if msg.params.len() < 4 {
            return self.reply_unregistered(conn_id, ERR_NEEDMOREPARAMS, "USER :Not enough parameters");
        }
        let username = msg.params[0].clone();
        let realname = msg.params[3].clone();
        self.connections.with_conn(conn_id, |c| {
            c.pending_user = Some((username, realname));
            c.needs.satisfy(HandshakeNeeds::USER);
        });
        self.try_complete_registration(conn_id, &config);
    }

    fn try_complete_registration(&self, conn_id: Uuid, config: &Config) {
        let ready = self
            .connections
            .with_conn(conn_id, |c| c.needs.complete() && c.entity.is_none())
            .unwrap_or(false);
        if !ready {
            return;
        }
        let (nick, user, host, ip) = match self.connections.with_conn(conn_id, |c| {
            let (username, realname) = c.pending_user.clone().unwrap_or_default();
            let ip = c.peer_addr.map(|a| a.ip());
            let host = c
                .host
                .clone()
                .or_else(|| ip.map(|i| i.to_string()))
                .unwrap_or_else(|| "unknown".to_string());
            (c.pending_nick.clone().unwrap_or_default(), (username, realname), host, ip)
        }) {
            Some(state) => state,
            None => return,
        };

        let mut entity = self.pools.lock().clients.acquire();
        entity.status = EntityStatus::Unknown;
        entity.name = nick.clone();
        entity.user = Some(UserRecord::new(user.0.clone(), user.1, host.clone()));
        entity.connection = Some(conn_id);
        entity.upstream = entity.id;

        let check = self.admission.check_client(config, &mut entity, ip);
        if check.result != AuthorizationCheckResult::Ok {
            let reason = check.message.unwrap_or_else(|| "No authorization".to_string());
            let line = format!("ERROR :Closing Link: {}[{}] ({})\r\n", nick, host, reason);
            self.connections.enqueue(conn_id, crate::buffer::MsgBuf::new(line), Priority::Normal);
            self.connections.mark_dead(conn_id, &reason);
            self.admission.detach_all(&mut entity);
            entity.connection = None;
            self.pools.lock().clients.release(entity);
            return;
        }

        // swap the accept-time defaults for the admitted class's quotas
        if let Some(item) = entity.confs.first() {
            let class = config.class_of(item);
            self.connections.with_conn(conn_id, |c| {
                c.apply_class(class.sendq_limit, class.ping_freq);
            });
        }

        let numeric = match self.numnicks.lock().allocate() {
            Ok(n) => n,
            Err(e) => {
                warn!("cannot assign numeric: {}", e);
                self.connections.mark_dead(conn_id, "Server full");
                self.admission.detach_all(&mut entity);
                entity.connection = None;
                self.pools.lock().clients.release(entity);
                return;
            }
        };
        entity.numnick = Some(Numnick::User(numeric));
        entity.status = EntityStatus::LocalUser;
        let id = entity.id;
        let first_seen = entity.first_seen.timestamp();

        if let Err((mut entity, e)) = self.directory.register(entity) {
            debug!("registration raced a collision: {}", e);
            self.reply_unregistered(
                conn_id,
                ERR_NICKNAMEINUSE,
                &format!("{} :Nickname is already in use", nick),
            );
            self.numnicks.lock().release(numeric);
            self.admission.detach_all(&mut entity);
            entity.connection = None;
            self.pools.lock().clients.release(entity);
            return;
        }
        self.connections.with_conn(conn_id, |c| c.entity = Some(id));

        self.welcome(id, &nick, &user.0, &host);

        // introduce the new user to every peer link
        let ctx = self.ctx();
        let me = self.directory.me();
        ctx.send_to_servers_but(
            Some(me),
            Command::Nick,
            None,
            vec![
                Arg::s(&nick),
                Arg::Int(1),
                Arg::Int(first_seen),
                Arg::s(&user.0),
                Arg::s(&host),
                Arg::Client(id),
                Arg::trail(
                    &self
                        .directory
                        .get(id)
                        .and_then(|e| e.user.map(|u| u.realname))
                        .unwrap_or_default(),
                ),
            ],
        );
        info!(nick = %nick, host = %host, "client registered");
    }

    fn welcome(&self, id: EntityId, nick: &str, username: &str, host: &str) {
        let ctx = self.ctx();
        let me = self.directory.me_name().to_string();
        ctx.send_reply(
            id,
            RPL_WELCOME,
            vec![Arg::S(format!("{}!{}@{}", nick, username, host))],
        );
        ctx.send_reply(
            id,
            RPL_YOURHOST,
            vec![Arg::s(&me), Arg::s(env!("CARGO_PKG_VERSION"))],
        );
        ctx.send_reply(id, RPL_CREATED, vec![Arg::s("in the age of federation")]);
        ctx.send_reply(
            id,
            RPL_MYINFO,
            vec![Arg::s(&me), Arg::s(env!("CARGO_PKG_VERSION")), Arg::s("diwosgO"), Arg::s("bklmnopstv")],
        );
        ctx.send_reply(id, ERR_NOMOTD, vec![]);
    }

    // -----------------------------------------------------------------
    // Registered clients

    fn dispatch_client(&self, conn_id: Uuid, id: EntityId, msg: Message) {
        self.directory.with_entity_mut(id, |e| e.touch());
        match msg.command.clone() {
            Command::Ping => {
                let me = self.directory.me_name();
                let token = msg.params.first().cloned().unwrap_or_else(|| me.to_string());
                self.connections.enqueue(
                    conn_id,
                    crate::buffer::MsgBuf::new(format!(":{} PONG {} :{}\r\n", me, me, token)),
                    Priority::Normal,
                );
            }
            Command::Pong => {}
            Command::Join => self.cmd_join(id, msg),
            Command::Part => self.cmd_part(id, msg),
            Command::PrivMsg => self.cmd_message(id, msg, Command::PrivMsg),
            Command::Notice => self.cmd_message(id, msg, Command::Notice),
            Command::Quit => {
                let reason = msg.params.first().cloned().unwrap_or_else(|| "Client quit".to_string());
                self.with_lifecycle(|lc| lc.exit_client(id, &reason, true));
            }
            Command::Oper => self.cmd_oper(id, msg),
            Command::Mode => self.cmd_mode(id, msg),
            Command::Whowas => self.cmd_whowas(id, msg),
            Command::Kill => self.cmd_kill(id, msg),
            Command::SQuit => self.cmd_squit(id, msg),
            Command::Connect => self.cmd_connect(id, msg),
            Command::Rehash => self.cmd_rehash(id),
            Command::Wallops => {
                if self.is_oper(id) {
                    let text = msg.params.first().cloned().unwrap_or_default();
                    self.ctx().send_to_flag_but_one(
                        Some(id),
                        Command::Wallops,
                        Some(id),
                        'w',
                        vec![Arg::Trail(text)],
                    );
                }
            }
            Command::Nick => self.cmd_nick_change(conn_id, id, msg),
            other => {
                if let Command::Custom(ref name) = other {
                    let config = self.config();
                    if config.find_service(name).is_some() {
                        return self.relay_service(id, name, msg);
                    }
                }
                self.ctx().send_reply(
                    id,
                    ERR_UNKNOWNCOMMAND,
                    vec![Arg::S(other.to_string())],
                );
            }
        }
    }

    fn is_oper(&self, id: EntityId) -> bool {
        self.directory.get(id).map_or(false, |e| e.is_oper())
    }

    fn cmd_join(&self, id: EntityId, msg: Message) {
        let ctx = self.ctx();
        let name = match msg.params.first() {
            Some(n) => n.clone(),
            None => return ctx.send_reply(id, ERR_NEEDMOREPARAMS, vec![Arg::s("JOIN")]),
        };
        if !crate::utils::string::is_valid_channel_name(&name) {
            return ctx.send_reply(id, ERR_BADCHANNAME, vec![Arg::Chan(name)]);
        }
        let config = self.config();
        if let Some(reason) = config.find_quarantine(&name) {
            ctx.send_reply(
                id,
                ERR_BADCHANNAME.explicit(),
                vec![Arg::S(format!("%H :Channel is quarantined: {}", reason)), Arg::Chan(name.clone())],
            );
            return;
        }
        let seat = {
            let mut pools = self.pools.lock();
            let mut seat = pools.members.acquire();
            seat.user = id;
            seat.modes = MemberModes::default();
            seat
        };
        self.channels.join(&name, seat);
        self.directory.with_entity_mut(id, |e| {
            if let Some(u) = e.user.as_mut() {
                u.channels.insert(name.clone());
            }
        });

        ctx.send_to_channel_but_servers(Some(id), Command::Join, &name, vec![Arg::Chan(name.clone())]);
        ctx.send_to_servers_but(Some(id), Command::Join, None, vec![Arg::Chan(name.clone())]);

        if let Some(chan) = self.channels.get(&name) {
            if let Some(topic) = &chan.topic {
                ctx.send_reply(id, RPL_TOPIC, vec![Arg::Chan(name.clone()), Arg::s(&topic.text)]);
            }
            let nicks: Vec<String> = chan
                .members
                .iter()
                .filter_map(|m| {
                    self.directory.get(m.user).map(|e| {
                        if m.modes.op {
                            format!("@{}", e.name)
                        } else if m.modes.voice {
                            format!("+{}", e.name)
                        } else {
                            e.name
                        }
                    })
                })
                .collect();
            ctx.send_reply(
                id,
                RPL_NAMREPLY,
                vec![Arg::Chan(name.clone()), Arg::S(nicks.join(" "))],
            );
            ctx.send_reply(id, RPL_ENDOFNAMES, vec![Arg::Chan(name)]);
        }
    }

    fn cmd_part(&self, id: EntityId, msg: Message) {
        let ctx = self.ctx();
        let name = match msg.params.first() {
            Some(n) => n.clone(),
            None => return ctx.send_reply(id, ERR_NEEDMOREPARAMS, vec![Arg::s("PART")]),
        };
        let member = self.channels.get(&name).map_or(false, |c| c.is_member(id));
        if !member {
            return ctx.send_reply(id, ERR_NOTONCHANNEL, vec![Arg::Chan(name)]);
        }
        let reason = msg.params.get(1).cloned().unwrap_or_default();
        let mut args = vec![Arg::Chan(name.clone())];
        if !reason.is_empty() {
            args.push(Arg::Trail(reason));
        }
        ctx.send_to_channel_but_servers(Some(id), Command::Part, &name, args.clone());
        ctx.send_to_servers_but(Some(id), Command::Part, None, args);

        if let Some(seat) = self.channels.part(&name, id) {
            self.pools.lock().members.release(seat);
        }
        self.directory.with_entity_mut(id, |e| {
            if let Some(u) = e.user.as_mut() {
                u.channels.remove(&name);
            }
        });
        self.channels.sweep();
    }

    fn cmd_message(&self, id: EntityId, msg: Message, command: Command) {
        let ctx = self.ctx();
        let notice = command == Command::Notice;
        let (target, text) = match (msg.params.first(), msg.params.get(1)) {
            (Some(t), Some(x)) => (t.clone(), x.clone()),
            _ => {
                if !notice {
                    ctx.send_reply(id, ERR_NEEDMOREPARAMS, vec![Arg::S(command.to_string())]);
                }
                return;
            }
        };
        if target.starts_with(['#', '&', '+', '!']) {
            if !self.channels.contains(&target) {
                if !notice {
                    ctx.send_reply(id, ERR_NOSUCHCHANNEL, vec![Arg::Chan(target)]);
                }
                return;
            }
            let skip = SkipFlags { deaf: true, burst: true, nonops: false };
            ctx.send_to_channel_but_one(
                Some(id),
                command,
                &target,
                Some(id),
                skip,
                vec![Arg::Chan(target.clone()), Arg::Trail(text)],
            );
            return;
        }
        match self.directory.lookup_by_name(&target) {
            Some(victim) => {
                let config = self.config();
                // new private targets are paced; recent ones stay free.
                // the configured delay is spread over the initial allowance
                let pace = config.features.target_delay.max(1) / config.features.start_targets.max(1) as u64;
                let keep = config.features.start_targets as usize;
                let folded = crate::utils::string::casefold(&target);
                let now = chrono::Utc::now();
                let blocked = self
                    .directory
                    .with_entity_mut(id, |e| match e.user.as_mut() {
                        Some(u) => {
                            if u.recent_targets.contains(&folded) {
                                false
                            } else if u.next_target > now {
                                true
                            } else {
                                u.recent_targets.insert(0, folded.clone());
                                u.recent_targets.truncate(keep);
                                u.next_target = now + chrono::Duration::seconds(pace as i64);
                                false
                            }
                        }
                        None => false,
                    })
                    .unwrap_or(false);
                if blocked {
                    if !notice {
                        ctx.send_reply(
                            id,
                            ERR_TARGETTOOFAST,
                            vec![Arg::s(&target), Arg::Int(pace as i64)],
                        );
                    }
                    return;
                }
                ctx.send_to_one(Some(id), command, victim, vec![Arg::Client(victim), Arg::Trail(text)]);
            }
            None => {
                if !notice {
                    ctx.send_reply(id, ERR_NOSUCHNICK, vec![Arg::s(&target)]);
                }
            }
        }
    }

    fn cmd_oper(&self, id: EntityId, msg: Message) {
        let ctx = self.ctx();
        let config = self.config();
        let (name, password) = match (msg.params.first(), msg.params.get(1)) {
            (Some(n), Some(p)) => (n.clone(), p.clone()),
            _ => return ctx.send_reply(id, ERR_NEEDMOREPARAMS, vec![Arg::s("OPER")]),
        };
        let (username, host) = match self.directory.get(id).and_then(|e| e.user.clone()) {
            Some(u) => (u.username, u.host),
            None => return,
        };
        let item = match self.admission.check_oper(&config, &name, &password, &username, &host) {
            Some(item) => item,
            None => {
                if config.find_conf_exact(&name, &username, &host, crate::config::CONF_OPERATOR).is_none() {
                    return ctx.send_reply(id, ERR_NOOPERHOST, vec![]);
                }
                return ctx.send_reply(id, ERR_PASSWDMISMATCH, vec![]);
            }
        };
        let local_only = item.privileges.contains("local_only");
        self.directory.with_entity_mut(id, |e| {
            self.admission.attach(&config, e, &item, None);
            if let Some(u) = e.user.as_mut() {
                u.modes.insert(if local_only { 'O' } else { 'o' });
                u.modes.insert('s');
                u.snomask = sno::SNO_DEFAULT_OPER;
            }
        });
        ctx.send_reply(id, RPL_YOUREOPER, vec![]);
        let nick = self.directory.get(id).map(|e| e.name).unwrap_or_default();
        ctx.send_opmask_notice(Some(id), sno::SNO_OLDSNO, &format!("{} is now an operator", nick));
        let me = self.directory.me();
        ctx.send_to_servers_but(
            Some(me),
            Command::Mode,
            None,
            vec![Arg::Client(id), Arg::s(if local_only { "+O" } else { "+o" })],
        );
    }

    fn cmd_mode(&self, id: EntityId, msg: Message) {
        let ctx = self.ctx();
        let target = match msg.params.first() {
            Some(t) => t.clone(),
            None => return ctx.send_reply(id, ERR_NEEDMOREPARAMS, vec![Arg::s("MODE")]),
        };
        if target.starts_with(['#', '&', '+', '!']) {
            // channel modes are settled during burst; only membership
            // flags are interpreted here
            return;
        }
        let entity = match self.directory.get(id) {
            Some(e) => e,
            None => return,
        };
        if !crate::utils::string::names_equal(&entity.name, &target) {
            return ctx.send_reply(id, ERR_NOPRIVILEGES, vec![]);
        }
        match msg.params.get(1) {
            None => {
                let modes: String = entity
                    .user
                    .as_ref()
                    .map(|u| {
                        let mut m: Vec<char> = u.modes.iter().copied().collect();
                        m.sort_unstable();
                        m.into_iter().collect()
                    })
                    .unwrap_or_default();
                ctx.send_reply(id, RPL_UMODEIS, vec![Arg::S(format!("+{}", modes))]);
            }
            Some(changes) => {
                self.directory.with_entity_mut(id, |e| {
                    let user = match e.user.as_mut() {
                        Some(u) => u,
                        None => return,
                    };
                    let mut adding = true;
                    for c in changes.chars() {
                        match c {
                            '+' => adding = true,
                            '-' => adding = false,
                            'o' | 'O' if adding => {} // only OPER grants these
                            'i' | 'w' | 'd' | 's' | 'g' | 'o' | 'O' => {
                                if adding {
                                    user.modes.insert(c);
                                } else {
                                    user.modes.remove(&c);
                                    if c == 's' {
                                        user.snomask = 0;
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                });
                let me = self.directory.me();
                ctx.send_to_servers_but(
                    Some(me),
                    Command::Mode,
                    None,
                    vec![Arg::Client(id), Arg::s(changes)],
                );
            }
        }
    }

    fn cmd_whowas(&self, id: EntityId, msg: Message) {
        let ctx = self.ctx();
        let nick = match msg.params.first() {
            Some(n) => n.clone(),
            None => return ctx.send_reply(id, ERR_NONICKNAMEGIVEN, vec![]),
        };
        let limit = msg
            .params
            .get(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        let hits = self.whowas.query(&nick, limit);
        if hits.is_empty() {
            ctx.send_reply(id, ERR_WASNOSUCHNICK, vec![Arg::s(&nick)]);
        }
        for entry in &hits {
            ctx.send_reply(
                id,
                RPL_WHOWASUSER,
                vec![
                    Arg::s(&entry.nick),
                    Arg::s(&entry.username),
                    Arg::s(&entry.host),
                    Arg::s(&entry.realname),
                ],
            );
        }
        ctx.send_reply(id, RPL_ENDOFWHOWAS, vec![Arg::s(&nick)]);
    }

    fn cmd_kill(&self, id: EntityId, msg: Message) {
        let ctx = self.ctx();
        if !self.is_oper(id) {
            return ctx.send_reply(id, ERR_NOPRIVILEGES, vec![]);
        }
        let (target, reason) = match (msg.params.first(), msg.params.get(1)) {
            (Some(t), Some(r)) => (t.clone(), r.clone()),
            (Some(t), None) => (t.clone(), "No reason".to_string()),
            _ => return ctx.send_reply(id, ERR_NEEDMOREPARAMS, vec![Arg::s("KILL")]),
        };
        let victim = match self.directory.lookup_by_name(&target) {
            Some(v) => v,
            None => return ctx.send_reply(id, ERR_NOSUCHNICK, vec![Arg::s(&target)]),
        };
        let killer = self.directory.get(id).map(|e| e.name).unwrap_or_default();
        let full_reason = format!("Killed ({} ({}))", killer, reason);

        // the kill overtakes queued chatter on every server link
        for link in self.directory.local_server_links() {
            ctx.send_prio_to_one(
                Some(id),
                Command::Kill,
                link,
                vec![Arg::Client(victim), Arg::Trail(full_reason.clone())],
            );
        }
        ctx.send_opmask_notice(
            None,
            sno::SNO_OPERKILL,
            &format!("{} killed {} ({})", killer, target, reason),
        );
        let victim_is_local = self.directory.get(victim).map_or(false, |e| e.is_local());
        if victim_is_local {
            ctx.send_prio_to_one(
                Some(id),
                Command::Kill,
                victim,
                vec![Arg::s(&target), Arg::Trail(full_reason.clone())],
            );
        }
        self.with_lifecycle(|lc| lc.exit_client(victim, &full_reason, true));
    }

    fn cmd_squit(&self, id: EntityId, msg: Message) {
        let ctx = self.ctx();
        if !self.is_oper(id) {
            return ctx.send_reply(id, ERR_NOPRIVILEGES, vec![]);
        }
        let name = match msg.params.first() {
            Some(n) => n.clone(),
            None => return ctx.send_reply(id, ERR_NEEDMOREPARAMS, vec![Arg::s("SQUIT")]),
        };
        let reason = msg.params.get(2).or(msg.params.get(1)).cloned().unwrap_or_default();
        let target = self
            .directory
            .lookup_by_name(&name)
            .and_then(|t| self.directory.get(t))
            .filter(|e| e.is_server() && e.status != EntityStatus::Me);
        match target {
            Some(server) => self.with_lifecycle(|lc| lc.exit_server(&server, &reason)),
            None => ctx.send_reply(id, ERR_NOSUCHSERVER, vec![Arg::s(&name)]),
        }
    }

    /// Oper-requested outbound link. Connection rules are consulted here;
    /// an approved target is queued for the dial loop.
    fn cmd_connect(&self, id: EntityId, msg: Message) {
        let ctx = self.ctx();
        if !self.is_oper(id) {
            return ctx.send_reply(id, ERR_NOPRIVILEGES, vec![]);
        }
        let name = match msg.params.first() {
            Some(n) => n.clone(),
            None => return ctx.send_reply(id, ERR_NEEDMOREPARAMS, vec![Arg::s("CONNECT")]),
        };
        let me = self.directory.me_name().to_string();
        let nick = self.directory.get(id).map(|e| e.name).unwrap_or_default();
        if self.directory.lookup_by_name(&name).is_some() {
            ctx.send_raw(
                id,
                &format!(":{} NOTICE {} :*** Connect: {} is already linked", me, nick, name),
            );
            return;
        }
        match self.connect_allowed(&name, false) {
            Err(e) => {
                ctx.send_raw(id, &format!(":{} NOTICE {} :*** Connect: {}", me, nick, e));
            }
            Ok(()) => {
                self.pending_connects.lock().push(name.clone());
                ctx.send_raw(
                    id,
                    &format!(":{} NOTICE {} :*** Connecting to {}", me, nick, name),
                );
                ctx.send_opmask_notice(
                    Some(id),
                    sno::SNO_NETWORK,
                    &format!("{} requested CONNECT to {}", nick, name),
                );
            }
        }
    }

    fn cmd_rehash(&self, id: EntityId) {
        let ctx = self.ctx();
        if !self.is_oper(id) {
            return ctx.send_reply(id, ERR_NOPRIVILEGES, vec![]);
        }
        let path = match self.config_path.clone() {
            Some(p) => p,
            None => return ctx.send_reply(id, ERR_NOSUCHSERVER, vec![Arg::s("config")]),
        };
        ctx.send_reply(id, RPL_REHASHING, vec![Arg::s(&path)]);
        let old = self.config();
        match crate::rehash::rehash_file(&ctx, &self.admission, &old, &path) {
            Ok((new_config, outcome)) => {
                *self.config.write() = Arc::new(new_config);
                for victim in outcome.killed {
                    self.with_lifecycle(|lc| lc.exit_client(victim, "K-lined", true));
                }
            }
            Err(e) => {
                ctx.send_opmask_notice(None, sno::SNO_REHASH, &format!("Rehash failed: {}", e));
            }
        }
    }

    fn cmd_nick_change(&self, conn_id: Uuid, id: EntityId, msg: Message) {
        let ctx = self.ctx();
        let config = self.config();
        let nick = match msg.params.first() {
            Some(n) => n.clone(),
            None => return ctx.send_reply(id, ERR_NONICKNAMEGIVEN, vec![]),
        };
        if !crate::utils::string::is_valid_nickname(&nick, 15) {
            return ctx.send_reply(id, ERR_ERRONEUSNICKNAME, vec![Arg::s(&nick)]);
        }
        let delay = config.features.nick_delay;
        let paced = self
            .connections
            .with_conn(conn_id, |c| match c.last_nick_change {
                Some(prev) if prev.elapsed() < Duration::from_secs(delay) => true,
                _ => {
                    c.last_nick_change = Some(std::time::Instant::now());
                    false
                }
            })
            .unwrap_or(false);
        if paced {
            return ctx.send_reply(
                id,
                ERR_NICKTOOFAST,
                vec![Arg::s(&nick), Arg::Int(delay as i64)],
            );
        }
        if let Some(holder) = self.directory.lookup_by_name(&nick) {
            if holder != id {
                return ctx.send_reply(id, ERR_NICKNAMEINUSE, vec![Arg::s(&nick)]);
            }
        }
        // announce under the old identity before the directory moves it
        ctx.send_to_common_channels(id, Command::Nick, vec![Arg::s(&nick)]);
        ctx.send_to_one(Some(id), Command::Nick, id, vec![Arg::s(&nick)]);
        if self.directory.rename(id, &nick).is_ok() {
            ctx.send_to_servers_but(Some(id), Command::Nick, None, vec![Arg::s(&nick)]);
        }
    }

    /// Relay a configured pseudo-command to its service target.
    fn relay_service(&self, id: EntityId, name: &str, msg: Message) {
        let ctx = self.ctx();
        let config = self.config();
        let map = match config.find_service(name) {
            Some(m) => m,
            None => return,
        };
        let mut text = msg.params.join(" ");
        if let Some(ref prepend) = map.prepend {
            text = format!("{}{}", prepend, text);
        }
        let target = map
            .targets
            .iter()
            .find_map(|t| self.directory.lookup_by_name(&t.nick));
        match target {
            Some(victim) => {
                let command = Command::from(map.command.as_str());
                ctx.send_to_one(Some(id), command, victim, vec![Arg::Client(victim), Arg::Trail(text)]);
            }
            None => ctx.send_reply(id, ERR_SERVICESDOWN, vec![Arg::S(map.name.clone())]),
        }
    }

    // -----------------------------------------------------------------
    // Peer links

    fn handshake_server(&self, conn_id: Uuid, msg: Message) {
        let config = self.config();
        if msg.params.len() < 2 {
            return self.reply_unregistered(conn_id, ERR_NEEDMOREPARAMS, "SERVER :Not enough parameters");
        }
        let name = msg.params[0].clone();
        let description = msg.params.last().cloned().unwrap_or_default();
        let (password, host, ip) = match self.connections.with_conn(conn_id, |c| {
            (
                c.password.clone().unwrap_or_default(),
                c.host.clone().or_else(|| c.peer_addr.map(|a| a.ip().to_string())).unwrap_or_default(),
                c.peer_addr.map(|a| a.ip()),
            )
        }) {
            Some(state) => state,
            None => return,
        };

        let item = match self.admission.check_server(&config, &name, &password, &host, ip) {
            Ok(item) => item,
            Err(e) => {
                let line = format!("ERROR :Closing Link: {} ({:?})\r\n", name, e);
                self.connections.enqueue(conn_id, crate::buffer::MsgBuf::new(line), Priority::Normal);
                self.connections.mark_dead(conn_id, "Server authentication failed");
                self.ctx().send_opmask_notice(
                    None,
                    sno::SNO_NETWORK,
                    &format!("Rejected server link from {} ({:?})", name, e),
                );
                return;
            }
        };

        let numeric = msg
            .params
            .get(5)
            .and_then(|p| p.get(..2))
            .and_then(|s| ServerNumeric::parse(s).ok());

        let mut entity = self.pools.lock().clients.acquire();
        entity.status = EntityStatus::LocalServer;
        entity.name = name.clone();
        entity.numnick = numeric.map(Numnick::Server);
        entity.connection = Some(conn_id);
        entity.upstream = entity.id;
        entity.server = Some(ServerRecord {
            hop_count: 1,
            description,
            conf_name: Some(item.name.clone()),
            ..Default::default()
        });
        let id = entity.id;
        if let Err((mut entity, e)) = self.directory.register(entity) {
            warn!("duplicate server link {}: {}", name, e);
            self.connections.mark_dead(conn_id, "Server already linked");
            entity.connection = None;
            entity.server = None;
            self.pools.lock().clients.release(entity);
            return;
        }
        self.connections.with_conn(conn_id, |c| {
            c.entity = Some(id);
            c.kind = LinkKind::Server;
            c.needs = HandshakeNeeds::none();
        });
        self.directory.with_entity_mut(id, |e| {
            self.admission.attach(&config, e, &item, ip);
        });
        // the link now runs on its Connect block's class quotas instead
        // of the accept-time defaults
        let class = config.class_of(&item);
        self.connections.with_conn(conn_id, |c| {
            c.apply_class(class.sendq_limit, class.ping_freq);
        });
        let me = self.directory.me();
        self.directory.with_entity_mut(me, |e| {
            if let Some(s) = e.server.as_mut() {
                s.children.push(id);
            }
        });

        self.send_burst(conn_id, id);
        self.ctx().send_opmask_notice(
            None,
            sno::SNO_NETWORK,
            &format!("Link with {} established", name),
        );
        info!(server = %name, "peer link registered");
    }

    /// Our own SERVER line, sent at most once per link: when we dial we
    /// lead with it, and on inbound links it opens the burst.
    fn send_server_intro(&self, conn_id: Uuid) {
        let already = self
            .connections
            .with_conn(conn_id, |c| {
                let sent = c.sent_server_intro;
                c.sent_server_intro = true;
                sent
            })
            .unwrap_or(true);
        if already {
            return;
        }
        let config = self.config();
        let my_numeric = self
            .directory
            .get(self.directory.me())
            .map(|e| e.server_prefix().to_string())
            .unwrap_or_default();
        self.connections.enqueue(
            conn_id,
            crate::buffer::MsgBuf::new(format!(
                "SERVER {} 1 0 0 J10 {}]]] :{}\r\n",
                config.local.name, my_numeric, config.local.description
            )),
            Priority::Normal,
        );
    }

    /// Introduce ourselves and replay local state down a fresh link.
    fn send_burst(&self, conn_id: Uuid, _link: EntityId) {
        let me = self.directory.me();
        let me_entity = match self.directory.get(me) {
            Some(e) => e,
            None => return,
        };
        let my_numeric = me_entity.server_prefix().to_string();
        let enqueue = |line: String| {
            self.connections.enqueue(conn_id, crate::buffer::MsgBuf::new(line), Priority::Normal);
        };

        self.send_server_intro(conn_id);
        for user_id in self.directory.iterate_local_users() {
            if let Some(user) = self.directory.get(user_id) {
                if let (Some(u), Some(n)) = (&user.user, user.numnick) {
                    enqueue(format!(
                        ":{} N {} 1 {} {} {} +{} {} :{}\r\n",
                        my_numeric,
                        user.name,
                        user.first_seen.timestamp(),
                        u.username,
                        u.host,
                        u.modes.iter().collect::<String>(),
                        n.to_wire(),
                        u.realname
                    ));
                }
            }
        }
        for name in self.channels.names() {
            if let Some(chan) = self.channels.get(&name) {
                let members: Vec<String> = chan
                    .members
                    .iter()
                    .filter_map(|m| {
                        self.directory.get(m.user).and_then(|e| e.numnick).map(|n| {
                            if m.modes.op {
                                format!("{}:o", n.to_wire())
                            } else {
                                n.to_wire()
                            }
                        })
                    })
                    .collect();
                enqueue(format!(
                    ":{} B {} {} :{}\r\n",
                    my_numeric,
                    chan.name,
                    chan.created_at.timestamp(),
                    members.join(",")
                ));
            }
        }
        enqueue(format!(":{} EB\r\n", my_numeric));
    }

    fn link_sender(&self, link: EntityId, prefix: &Option<Prefix>) -> EntityId {
        match prefix {
            Some(Prefix::Numeric(n)) => self
                .directory
                .lookup_by_numnick(n)
                .or_else(|| self.directory.lookup_by_name(n))
                .unwrap_or(link),
            Some(Prefix::Server(name)) | Some(Prefix::User { nick: name, .. }) => {
                self.directory.lookup_by_name(name).unwrap_or(link)
            }
            None => link,
        }
    }

    fn dispatch_server_link(&self, conn_id: Uuid, link: EntityId, msg: Message) {
        let sender = self.link_sender(link, &msg.prefix);
        match msg.command.clone() {
            Command::Ping => {
                let me = self.directory.get(self.directory.me());
                let numeric = me.map(|e| e.server_prefix().to_string()).unwrap_or_default();
                let token = msg.params.first().cloned().unwrap_or_default();
                self.connections.enqueue(
                    conn_id,
                    crate::buffer::MsgBuf::new(format!(":{} Z :{}\r\n", numeric, token)),
                    Priority::Normal,
                );
            }
            Command::Pong => {}
            Command::Nick => self.link_introduce_user(link, sender, msg),
            Command::Quit => {
                let reason = msg.params.first().cloned().unwrap_or_default();
                if sender != link {
                    self.with_lifecycle(|lc| lc.exit_client(sender, &reason, true));
                }
            }
            Command::SQuit => {
                let name = msg.params.first().cloned().unwrap_or_default();
                let target = self
                    .directory
                    .lookup_by_name(&name)
                    .and_then(|t| self.directory.get(t))
                    .filter(|e| e.is_server() && e.status != EntityStatus::Me);
                if let Some(server) = target {
                    let reason = msg.params.last().cloned().unwrap_or_default();
                    self.with_lifecycle(|lc| lc.exit_server(&server, &reason));
                }
            }
            Command::Server => self.link_introduce_server(conn_id, link, sender, msg),
            Command::PrivMsg | Command::Notice => self.link_relay_message(link, sender, msg),
            Command::Join => self.link_join(link, sender, msg),
            Command::Part => {
                if let Some(name) = msg.params.first() {
                    let ctx = self.ctx();
                    let mut args = vec![Arg::Chan(name.clone())];
                    if let Some(reason) = msg.params.get(1) {
                        args.push(Arg::Trail(reason.clone()));
                    }
                    ctx.send_to_channel_but_servers(Some(sender), Command::Part, name, args.clone());
                    ctx.send_to_servers_but(Some(sender), Command::Part, Some(link), args);
                    self.channels.part(name, sender);
                    self.directory.with_entity_mut(sender, |e| {
                        if let Some(u) = e.user.as_mut() {
                            u.channels.remove(name);
                        }
                    });
                    self.channels.sweep();
                }
            }
            Command::Burst => self.link_channel_burst(link, msg),
            Command::EndOfBurst => {
                for name in self.channels.names() {
                    self.channels.end_burst(&name, link);
                }
                let me = self.directory.get(self.directory.me());
                let numeric = me.map(|e| e.server_prefix().to_string()).unwrap_or_default();
                self.connections.enqueue(
                    conn_id,
                    crate::buffer::MsgBuf::new(format!(":{} EA\r\n", numeric)),
                    Priority::Normal,
                );
            }
            Command::EndOfBurstAck => {}
            Command::Kill => {
                if let Some(target) = msg.params.first() {
                    let victim = self
                        .directory
                        .lookup_by_numnick(target)
                        .or_else(|| self.directory.lookup_by_name(target));
                    if let Some(victim) = victim {
                        let reason = msg.params.last().cloned().unwrap_or_default();
                        self.with_lifecycle(|lc| lc.exit_client(victim, &reason, true));
                    }
                }
            }
            Command::Error => {
                let text = msg.params.last().cloned().unwrap_or_default();
                self.ctx().send_opmask_notice(
                    None,
                    sno::SNO_NETWORK,
                    &format!("ERROR from peer link: {}", text),
                );
                self.connections.mark_dead(conn_id, "ERROR from peer");
            }
            other => {
                // a peer speaking nonsense is a protocol error: notify and
                // drop the link
                self.ctx().send_opmask_notice(
                    None,
                    sno::SNO_NETWORK,
                    &format!("Protocol violation from link: {}", other),
                );
            }
        }
    }

    fn link_introduce_user(&self, link: EntityId, sender: EntityId, msg: Message) {
        if msg.params.len() < 7 {
            return;
        }
        let nick = msg.params[0].clone();
        let username = msg.params[3].clone();
        let host = msg.params[4].clone();
        let numnick = msg.params[msg.params.len() - 2].clone();
        let realname = msg.params.last().cloned().unwrap_or_default();
        let first_seen = msg
            .params
            .get(2)
            .and_then(|p| p.parse::<i64>().ok())
            .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
            .unwrap_or_else(chrono::Utc::now);

        if let Some(existing) = self.directory.lookup_by_name(&nick) {
            // nick collision across the network: older entity survives
            use crate::directory::CollisionVerdict;
            let verdict = self.directory.collision_verdict(existing, first_seen);
            match verdict {
                CollisionVerdict::KillNewcomer => {
                    let ctx = self.ctx();
                    ctx.send_prio_to_one(
                        None,
                        Command::Kill,
                        link,
                        vec![Arg::s(&numnick), Arg::trail("Nick collision")],
                    );
                    return;
                }
                CollisionVerdict::KillExisting | CollisionVerdict::KillBoth => {
                    self.with_lifecycle(|lc| lc.exit_client(existing, "Nick collision", true));
                    if verdict == CollisionVerdict::KillBoth {
                        let ctx = self.ctx();
                        ctx.send_prio_to_one(
                            None,
                            Command::Kill,
                            link,
                            vec![Arg::s(&numnick), Arg::trail("Nick collision")],
                        );
                        return;
                    }
                }
            }
        }

        let mut entity = self.pools.lock().clients.acquire();
        entity.status = EntityStatus::User;
        entity.name = nick;
        entity.upstream = sender;
        entity.numnick = Numnick::parse(&numnick).ok();
        entity.first_seen = first_seen;
        entity.user = Some(UserRecord::new(username, realname, host));
        if let Err((mut entity, e)) = self.directory.register(entity) {
            debug!("dropping colliding introduction: {}", e);
            entity.user = None;
            self.pools.lock().clients.release(entity);
            return;
        }
        // pass the introduction along the rest of the tree
        let ctx = self.ctx();
        ctx.send_to_servers_but(Some(sender), Command::Nick, Some(link), {
            msg.params.iter().map(|p| Arg::s(p)).collect()
        });
    }

    /// A peer introduces a server behind it. The direct link's Connect
    /// block decides which downstream servers it may bring in.
    fn link_introduce_server(&self, conn_id: Uuid, link: EntityId, sender: EntityId, msg: Message) {
        if msg.params.len() < 2 {
            return;
        }
        let name = msg.params[0].clone();
        let hops = msg.params.get(1).and_then(|p| p.parse().ok()).unwrap_or(2);
        let description = msg.params.last().cloned().unwrap_or_default();
        let config = self.config();

        let link_name = self.directory.get(link).map(|e| e.name).unwrap_or_default();
        if let Some(item) = config.conf_find_server(&link_name) {
            if self.admission.hub_allows(&item, &name).is_err() {
                self.ctx().send_opmask_notice(
                    None,
                    sno::SNO_NETWORK,
                    &format!("{} tried to introduce {} beyond its hub mask", link_name, name),
                );
                self.connections.mark_dead(conn_id, "Hub limit violated");
                return;
            }
        }

        let numeric = msg
            .params
            .get(5)
            .and_then(|p| p.get(..2))
            .and_then(|s| ServerNumeric::parse(s).ok());
        let mut entity = self.pools.lock().clients.acquire();
        entity.status = EntityStatus::Server;
        entity.name = name.clone();
        entity.numnick = numeric.map(Numnick::Server);
        entity.upstream = sender;
        entity.server = Some(ServerRecord { hop_count: hops, description, ..Default::default() });
        let id = entity.id;
        if let Err((mut entity, e)) = self.directory.register(entity) {
            debug!("dropping colliding server introduction: {}", e);
            entity.server = None;
            self.pools.lock().clients.release(entity);
            return;
        }
        self.directory.with_entity_mut(sender, |e| {
            if let Some(s) = e.server.as_mut() {
                s.children.push(id);
            }
        });
        let ctx = self.ctx();
        ctx.send_to_servers_but(Some(sender), Command::Server, Some(link), {
            msg.params.iter().map(|p| Arg::s(p)).collect()
        });
    }

    fn link_relay_message(&self, _link: EntityId, sender: EntityId, msg: Message) {
        let command = msg.command.clone();
        let (target, text) = match (msg.params.first(), msg.params.get(1)) {
            (Some(t), Some(x)) => (t.clone(), x.clone()),
            _ => return,
        };
        let ctx = self.ctx();
        if target.starts_with(['#', '&', '+', '!']) {
            let skip = SkipFlags { deaf: true, burst: true, nonops: false };
            ctx.send_to_channel_but_one(
                Some(sender),
                command,
                &target,
                Some(sender),
                skip,
                vec![Arg::Chan(target.clone()), Arg::Trail(text)],
            );
            return;
        }
        let victim = self
            .directory
            .lookup_by_numnick(&target)
            .or_else(|| self.directory.lookup_by_name(&target));
        if let Some(victim) = victim {
            ctx.send_to_one(Some(sender), command, victim, vec![Arg::Client(victim), Arg::Trail(text)]);
        }
    }

    fn link_join(&self, link: EntityId, sender: EntityId, msg: Message) {
        let name = match msg.params.first() {
            Some(n) => n.clone(),
            None => return,
        };
        let seat = {
            let mut pools = self.pools.lock();
            let mut seat = pools.members.acquire();
            seat.user = sender;
            seat.modes = MemberModes::default();
            seat
        };
        self.channels.join(&name, seat);
        self.directory.with_entity_mut(sender, |e| {
            if let Some(u) = e.user.as_mut() {
                u.channels.insert(name.clone());
            }
        });
        let ctx = self.ctx();
        ctx.send_to_channel_but_servers(Some(sender), Command::Join, &name, vec![Arg::Chan(name.clone())]);
        ctx.send_to_servers_but(Some(sender), Command::Join, Some(link), vec![Arg::Chan(name)]);
    }

    fn link_channel_burst(&self, link: EntityId, msg: Message) {
        let name = match msg.params.first() {
            Some(n) => n.clone(),
            None => return,
        };
        self.channels.ensure(&name);
        self.channels.begin_burst(&name, link);
        let members = msg.params.last().cloned().unwrap_or_default();
        for spec in members.split(',').filter(|s| !s.is_empty()) {
            let (numnick, flags) = match spec.split_once(':') {
                Some((n, f)) => (n, f),
                None => (spec, ""),
            };
            if let Some(user) = self.directory.lookup_by_numnick(numnick) {
                let seat = Membership {
                    user,
                    modes: MemberModes { op: flags.contains('o'), voice: flags.contains('v') },
                };
                self.channels.join(&name, seat);
                self.directory.with_entity_mut(user, |e| {
                    if let Some(u) = e.user.as_mut() {
                        u.channels.insert(name.clone());
                    }
                });
            }
        }
    }

    /// Bring up a configured outbound link, honoring connection rules.
    pub fn connect_allowed(&self, name: &str, automatic: bool) -> Result<()> {
        use crate::crule::CRuleKind;
        let config = self.config();
        if config.items.iter().all(|i| i.status & CONF_SERVER == 0 || !crate::utils::mask::matches(&i.name, name)) {
            return Err(Error::Config(format!("no Connect block for {}", name)));
        }
        let kind = if automatic { CRuleKind::Auto } else { CRuleKind::All };
        if let Some(rule) = config.eval_crule(name, kind, &self.directory) {
            return Err(Error::CRule(format!("connection to {} forbidden by rule: {}", name, rule)));
        }
        Ok(())
    }
}
