#[cfg(test)]
mod channel_test;

pub mod proxy;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Duration};
use util::sync::Mutex as SyncMutex;

use crate::allocator::{AllocationConfig, PortAllocator};
use crate::candidate::*;
use crate::connection::{time_ms, Connection};
use crate::control::*;
use crate::error::*;
use crate::port::{Port, PortEvent};
use crate::priority::PriorityAttr;
use crate::rand::generate_cand_id;
use crate::use_candidate::UseCandidateAttr;

use stun::message::Getter;

// How often the channel re-evaluates connection state and ping pacing.
pub(crate) const TICK_INTERVAL: u64 = 250;

// Would-block error code surfaced through get_error.
pub(crate) const EWOULDBLOCK: i32 = 11;

/// Events a channel raises toward its Transport, tagged there by channel
/// name.
#[derive(Debug)]
pub enum ChannelEvent {
    ReadableState(bool),
    WritableState(bool),
    CandidateReady(Candidate),
    CandidatesAllocationDone,
    AllocationFailed(String),
    RouteChange(Candidate),
    ReadPacket(Vec<u8>),
    RoleConflict { was: Role },
}

enum ChannelCmd {
    Connect,
    AddRemoteCandidate(Candidate),
    Destroy { ack: oneshot::Sender<()> },
}

pub struct ChannelConfig {
    pub name: String,
    pub component: u16,
    pub mode: IceMode,
    pub role: Role,
    pub tiebreaker: u64,
    pub local_ufrag: String,
    pub local_pwd: String,
    pub allocator: Arc<dyn PortAllocator + Send + Sync>,
    pub events: mpsc::UnboundedSender<(String, ChannelEvent)>,
    /// Grace period override for empty-port teardown; 0 means the default.
    pub port_timeout_delay: u64,
}

/// The selection layer: owns the Ports of one component, the candidate-pair
/// Connections built on them, and the currently selected ("best")
/// Connection. Everything stateful runs on its worker loop.
pub struct TransportChannelImpl {
    name: String,
    component: u16,
    mode: AtomicU8,
    role: AtomicU8,
    tiebreaker: AtomicU64,

    local_ufrag: String,
    local_pwd: String,
    remote_creds: SyncMutex<(String, String)>,

    allocator: Arc<dyn PortAllocator + Send + Sync>,
    port_timeout_delay: u64,

    ports: SyncMutex<Vec<Arc<Port>>>,
    connections: SyncMutex<Vec<Arc<Connection>>>,
    remote_candidates: SyncMutex<Vec<Candidate>>,
    best_connection: ArcSwapOption<Connection>,

    readable: AtomicBool,
    writable: AtomicBool,
    connect_requested: AtomicBool,
    destroyed: AtomicBool,
    ports_ready: AtomicUsize,
    allocation_done_sent: AtomicBool,

    srtp_ciphers: SyncMutex<Vec<String>>,
    options: SyncMutex<HashMap<String, i64>>,
    last_error: AtomicI32,

    port_events_tx: mpsc::UnboundedSender<PortEvent>,
    cmd_tx: mpsc::UnboundedSender<ChannelCmd>,
    events: mpsc::UnboundedSender<(String, ChannelEvent)>,
}

impl TransportChannelImpl {
    pub fn new(config: ChannelConfig) -> Arc<Self> {
        let (port_events_tx, port_events_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let channel = Arc::new(TransportChannelImpl {
            name: config.name,
            component: config.component,
            mode: AtomicU8::new(config.mode.as_u8()),
            role: AtomicU8::new(config.role.as_u8()),
            tiebreaker: AtomicU64::new(config.tiebreaker),
            local_ufrag: config.local_ufrag,
            local_pwd: config.local_pwd,
            remote_creds: SyncMutex::new((String::new(), String::new())),
            allocator: config.allocator,
            port_timeout_delay: config.port_timeout_delay,
            ports: SyncMutex::new(vec![]),
            connections: SyncMutex::new(vec![]),
            remote_candidates: SyncMutex::new(vec![]),
            best_connection: ArcSwapOption::empty(),
            readable: AtomicBool::new(false),
            writable: AtomicBool::new(false),
            connect_requested: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            ports_ready: AtomicUsize::new(0),
            allocation_done_sent: AtomicBool::new(false),
            srtp_ciphers: SyncMutex::new(vec![]),
            options: SyncMutex::new(HashMap::new()),
            last_error: AtomicI32::new(0),
            port_events_tx,
            cmd_tx,
            events: config.events,
        });

        let loop_channel = Arc::clone(&channel);
        tokio::spawn(async move {
            loop_channel.run_loop(port_events_rx, cmd_rx).await;
        });

        channel
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn component(&self) -> u16 {
        self.component
    }

    pub fn readable(&self) -> bool {
        self.readable.load(Ordering::SeqCst)
    }

    pub fn writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    pub fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::SeqCst))
    }

    pub fn ice_mode(&self) -> IceMode {
        IceMode::from_u8(self.mode.load(Ordering::SeqCst))
    }

    pub fn tiebreaker(&self) -> u64 {
        self.tiebreaker.load(Ordering::SeqCst)
    }

    pub fn local_credentials(&self) -> (String, String) {
        (self.local_ufrag.clone(), self.local_pwd.clone())
    }

    pub fn best_connection(&self) -> Option<Arc<Connection>> {
        self.best_connection.load_full()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().clone()
    }

    pub fn ports(&self) -> Vec<Arc<Port>> {
        self.ports.lock().clone()
    }

    /// Role changes propagate to every port, and through them to every
    /// connection's next ping.
    pub fn set_role(&self, role: Role) {
        self.role.store(role.as_u8(), Ordering::SeqCst);
        for port in self.ports.lock().iter() {
            port.set_role(role);
        }
    }

    pub fn set_tiebreaker(&self, tiebreaker: u64) {
        self.tiebreaker.store(tiebreaker, Ordering::SeqCst);
        for port in self.ports.lock().iter() {
            port.set_tiebreaker(tiebreaker);
        }
    }

    pub fn set_ice_mode(&self, mode: IceMode) {
        self.mode.store(mode.as_u8(), Ordering::SeqCst);
        for port in self.ports.lock().iter() {
            port.set_ice_mode(mode);
        }
    }

    pub fn set_remote_credentials(&self, ufrag: String, pwd: String) {
        *self.remote_creds.lock() = (ufrag, pwd);
    }

    pub fn set_srtp_ciphers(&self, ciphers: Vec<String>) {
        *self.srtp_ciphers.lock() = ciphers;
    }

    pub fn srtp_ciphers(&self) -> Vec<String> {
        self.srtp_ciphers.lock().clone()
    }

    pub fn set_option(&self, name: String, value: i64) {
        self.options.lock().insert(name, value);
    }

    pub fn get_option(&self, name: &str) -> Option<i64> {
        self.options.lock().get(name).copied()
    }

    /// Last socket-level error code observed on a send.
    pub fn get_error(&self) -> i32 {
        self.last_error.load(Ordering::SeqCst)
    }

    /// Starts gathering and checking.
    pub fn connect(&self) {
        let _ = self.cmd_tx.send(ChannelCmd::Connect);
    }

    /// Hands a remote candidate received from signalling to the worker.
    pub fn add_remote_candidate(&self, candidate: Candidate) {
        let _ = self.cmd_tx.send(ChannelCmd::AddRemoteCandidate(candidate));
    }

    /// Quiesces the worker synchronously: pending work is dropped, sockets
    /// close, connections die.
    pub async fn destroy(&self) {
        let (ack, done) = oneshot::channel();
        if self.cmd_tx.send(ChannelCmd::Destroy { ack }).is_ok() {
            let _ = done.await;
        }
    }

    /// Sends user data over the selected connection; would-block when no
    /// writable selection exists.
    pub async fn send_packet(&self, data: &[u8]) -> Result<usize> {
        if !self.writable() {
            self.last_error.store(EWOULDBLOCK, Ordering::SeqCst);
            return Err(Error::ErrSendPacket);
        }
        let best = match self.best_connection() {
            Some(best) => best,
            None => {
                self.last_error.store(EWOULDBLOCK, Ordering::SeqCst);
                return Err(Error::ErrSendPacket);
            }
        };

        match best.send(data).await {
            Ok(n) => Ok(n),
            Err(Error::ErrSendPacket) => {
                self.last_error.store(EWOULDBLOCK, Ordering::SeqCst);
                Err(Error::ErrSendPacket)
            }
            Err(e) => {
                self.last_error.store(-1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn run_loop(
        self: Arc<Self>,
        mut port_events_rx: mpsc::UnboundedReceiver<PortEvent>,
        mut cmd_rx: mpsc::UnboundedReceiver<ChannelCmd>,
    ) {
        let mut tick = interval(Duration::from_millis(TICK_INTERVAL));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.on_tick().await;
                }
                Some(ev) = port_events_rx.recv() => {
                    self.handle_port_event(ev).await;
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ChannelCmd::Connect) => self.handle_connect().await,
                        Some(ChannelCmd::AddRemoteCandidate(c)) => self.handle_remote_candidate(c),
                        Some(ChannelCmd::Destroy { ack }) => {
                            self.teardown().await;
                            let _ = ack.send(());
                            return;
                        }
                        None => return,
                    }
                }
            }
        }
    }

    async fn handle_connect(&self) {
        if self.connect_requested.swap(true, Ordering::SeqCst) {
            return;
        }

        let config = AllocationConfig {
            component: self.component,
            ufrag: self.local_ufrag.clone(),
            pwd: self.local_pwd.clone(),
            mode: self.ice_mode(),
            role: self.role(),
            tiebreaker: self.tiebreaker(),
            generation: 0,
            timeout_delay: self.port_timeout_delay,
        };

        let ports = match self
            .allocator
            .allocate_ports(&config, self.port_events_tx.clone())
            .await
        {
            Ok(ports) => ports,
            Err(e) => {
                log::error!("[{}]: could not allocate any ports: {e}", self.name);
                self.send_event(ChannelEvent::AllocationFailed(e.to_string()));
                return;
            }
        };

        for port in ports {
            port.set_role(self.role());
            port.set_tiebreaker(self.tiebreaker());
            port.set_ice_mode(self.ice_mode());
            port.spawn_recv_loop();
            port.prepare_address().await;
            port.start();
            self.ports.lock().push(port);
        }

        // Remote candidates may have arrived before gathering.
        let known = self.remote_candidates.lock().clone();
        for candidate in known {
            self.create_connections_for_remote(&candidate);
        }
    }

    fn handle_remote_candidate(&self, mut candidate: Candidate) {
        // Standards-track signalling carries the credentials out of band.
        if self.ice_mode() == IceMode::Rfc5245 {
            let (remote_ufrag, remote_pwd) = self.remote_creds.lock().clone();
            if candidate.username.is_empty() {
                candidate.username = remote_ufrag;
            }
            if candidate.password.is_empty() {
                candidate.password = remote_pwd;
            }
        }

        {
            let mut known = self.remote_candidates.lock();
            if known.iter().any(|c| c.equivalent(&candidate)) {
                return;
            }
            known.push(candidate.clone());
        }

        self.create_connections_for_remote(&candidate);
    }

    fn create_connections_for_remote(&self, candidate: &Candidate) {
        let ports = self.ports.lock().clone();
        for port in ports {
            if port.get_connection(&candidate.address).is_some() {
                continue;
            }
            match port.create_connection(0, candidate.clone()) {
                Ok(conn) => {
                    self.connections.lock().push(conn);
                }
                Err(e) => {
                    log::warn!("[{}]: could not create connection: {e}", self.name);
                }
            }
        }
    }

    async fn handle_port_event(&self, ev: PortEvent) {
        match ev {
            PortEvent::CandidateReady(c) => {
                self.send_event(ChannelEvent::CandidateReady(c));
            }
            PortEvent::AddressReady => {
                let ready = self.ports_ready.fetch_add(1, Ordering::SeqCst) + 1;
                if ready >= self.ports.lock().len()
                    && !self.allocation_done_sent.swap(true, Ordering::SeqCst)
                {
                    self.send_event(ChannelEvent::CandidatesAllocationDone);
                }
            }
            PortEvent::AddressError(e) => {
                self.send_event(ChannelEvent::AllocationFailed(e));
            }
            PortEvent::UnknownAddress {
                port,
                addr,
                msg,
                remote_ufrag,
            } => {
                self.on_unknown_address(&port, addr, &msg, remote_ufrag).await;
            }
            PortEvent::RoleConflict { was } => {
                self.send_event(ChannelEvent::RoleConflict { was });
            }
            PortEvent::ConnectionStateChange(_) => {
                self.update_channel_state();
            }
            PortEvent::ConnectionDestroy(conn) => {
                self.connections.lock().retain(|c| !Arc::ptr_eq(c, &conn));
                if let Some(best) = self.best_connection() {
                    if Arc::ptr_eq(&best, &conn) {
                        self.best_connection.store(None);
                    }
                }
                if let Some(port) = conn.port() {
                    port.on_connection_destroyed(&conn);
                }
                self.update_channel_state();
            }
            PortEvent::UseCandidate(conn) => {
                conn.set_nominated(true);
                self.update_channel_state();
            }
            PortEvent::ReadPacket(data) => {
                self.send_event(ChannelEvent::ReadPacket(data));
            }
            PortEvent::PortDestroyed(port) => {
                self.ports.lock().retain(|p| !Arc::ptr_eq(p, &port));
                port.close().await;
            }
        }
    }

    // An authenticated binding request from an address we have not learned
    // through signalling: mint a one-shot peer-reflexive candidate and build
    // a Connection for it. Prflx candidates are never merged or promoted.
    async fn on_unknown_address(
        &self,
        port: &Arc<Port>,
        addr: SocketAddr,
        msg: &stun::message::Message,
        remote_ufrag: String,
    ) {
        let (_, remote_pwd) = self.remote_creds.lock().clone();

        let mut priority_attr = PriorityAttr::default();
        let priority = if priority_attr.get_from(msg).is_ok() {
            priority_attr.0
        } else {
            compute_priority(
                CandidateType::PeerReflexive.preference(),
                DEFAULT_LOCAL_PREFERENCE,
                self.component,
            )
        };

        let remote_candidate = Candidate {
            id: generate_cand_id(),
            component: self.component,
            protocol: ProtocolType::Udp,
            address: addr,
            priority,
            username: remote_ufrag,
            password: remote_pwd,
            typ: CandidateType::PeerReflexive,
            foundation: compute_foundation(
                CandidateType::PeerReflexive,
                &addr.ip(),
                ProtocolType::Udp,
            ),
            generation: 0,
            related_address: None,
            network_name: String::new(),
        };

        let conn = match port.create_connection(0, remote_candidate) {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("[{}]: unknown address race: {e}", self.name);
                return;
            }
        };
        self.connections.lock().push(Arc::clone(&conn));

        // The connection exists now, so the response can go out, and the
        // request that created it counts as its first ping.
        port.send_binding_response(msg, addr).await;
        conn.received_ping();

        if self.ice_mode() == IceMode::Rfc5245
            && self.role() == Role::Controlled
            && UseCandidateAttr::is_set(msg)
        {
            conn.set_nominated(true);
        }

        self.update_channel_state();
    }

    async fn on_tick(&self) {
        let now = time_ms();
        let connections = self.connections.lock().clone();
        for conn in &connections {
            conn.update_state(now);
        }
        for conn in &connections {
            if conn.should_ping(now) {
                if let Err(e) = conn.ping(now).await {
                    log::debug!("[{}]: failed to send STUN ping: {e}", self.name);
                }
            }
        }
    }

    /// Re-picks the selected connection: the writable one with the highest
    /// pair priority, ties to the larger remote priority. With no writable
    /// connection the previous selection is kept for outbound sends but the
    /// channel reports unwritable.
    fn update_channel_state(&self) {
        let controlling = self.role() == Role::Controlling;
        let connections = self.connections.lock().clone();

        let mut best: Option<Arc<Connection>> = None;
        for conn in connections.iter().filter(|c| c.writable()) {
            best = match best {
                None => Some(Arc::clone(conn)),
                Some(cur) => {
                    let a = conn.pair_priority(controlling);
                    let b = cur.pair_priority(controlling);
                    if a > b
                        || (a == b
                            && conn.remote_candidate().priority
                                > cur.remote_candidate().priority)
                    {
                        Some(Arc::clone(conn))
                    } else {
                        Some(cur)
                    }
                }
            };
        }

        if let Some(new_best) = best {
            let old = self.best_connection();
            let changed = match &old {
                Some(old) => !Arc::ptr_eq(old, &new_best),
                None => true,
            };
            if changed {
                log::info!("[{}]: new best connection {new_best}", self.name);
                self.best_connection.store(Some(Arc::clone(&new_best)));
                if controlling {
                    // The controlling side nominates its chosen pair; the
                    // next ping carries USE-CANDIDATE.
                    new_best.set_nominated(true);
                }
                self.send_event(ChannelEvent::RouteChange(
                    new_best.remote_candidate().clone(),
                ));
            }
        }

        let writable = self
            .best_connection()
            .map(|c| c.writable())
            .unwrap_or(false);
        let readable = connections.iter().any(|c| c.readable());

        if self.writable.swap(writable, Ordering::SeqCst) != writable {
            self.send_event(ChannelEvent::WritableState(writable));
        }
        if self.readable.swap(readable, Ordering::SeqCst) != readable {
            self.send_event(ChannelEvent::ReadableState(readable));
        }
    }

    async fn teardown(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        let ports = {
            let mut guard = self.ports.lock();
            std::mem::take(&mut *guard)
        };
        for port in ports {
            port.close().await;
        }
        self.connections.lock().clear();
        self.best_connection.store(None);
        if self.writable.swap(false, Ordering::SeqCst) {
            self.send_event(ChannelEvent::WritableState(false));
        }
        if self.readable.swap(false, Ordering::SeqCst) {
            self.send_event(ChannelEvent::ReadableState(false));
        }
    }

    fn send_event(&self, ev: ChannelEvent) {
        let _ = self.events.send((self.name.clone(), ev));
    }
}
