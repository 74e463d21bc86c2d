#[cfg(test)]
mod port_test;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use stun::attributes::*;
use stun::addr::{MappedAddress, XorMappedAddress};
use stun::error_code::*;
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::*;
use stun::textattrs::TextAttribute;
use tokio::sync::mpsc;
use util::sync::Mutex as SyncMutex;
use util::Conn;

use crate::candidate::*;
use crate::connection::Connection;
use crate::control::*;
use crate::error::*;
use crate::rand::{generate_cand_id, generate_pwd, generate_ufrag, rtcp_ufrag_from_rtp_ufrag};

// The delay before we begin checking if an empty port is useless.
pub const PORT_TIMEOUT_DELAY: u64 = 30 * 1000; // 30 seconds

/// What kind of transport address this port offers. The srflx and relay
/// variants carry the addresses the external allocator discovered; the
/// socket I/O is uniform across kinds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortKind {
    Host,
    ServerReflexive { mapped_addr: SocketAddr },
    Relay { relayed_addr: SocketAddr },
}

impl PortKind {
    pub fn candidate_type(&self) -> CandidateType {
        match self {
            PortKind::Host => CandidateType::Host,
            PortKind::ServerReflexive { .. } => CandidateType::ServerReflexive,
            PortKind::Relay { .. } => CandidateType::Relay,
        }
    }
}

// A port's lifetime: before Start, between Start and the timeout firing,
// and after the timeout fired (when empty means useless).
const LT_PRESTART: u8 = 0;
const LT_PRETIMEOUT: u8 = 1;
const LT_POSTTIMEOUT: u8 = 2;

/// Events a Port (and its Connections) raise toward the owning channel.
pub enum PortEvent {
    /// A local candidate is ready to be signalled.
    CandidateReady(Candidate),
    /// All candidates of this port have been produced.
    AddressReady,
    /// The port could not produce an address.
    AddressError(String),
    /// An authenticated binding request arrived from an address we have no
    /// connection for; the channel may mint a peer-reflexive candidate.
    UnknownAddress {
        port: Arc<Port>,
        addr: SocketAddr,
        msg: Box<Message>,
        remote_ufrag: String,
    },
    /// A same-role peer with the bigger tiebreaker pinged us; the transport
    /// must flip our role. `was` is the role held when the conflict fired.
    RoleConflict { was: Role },
    ConnectionStateChange(Arc<Connection>),
    /// Both directions of the connection timed out; tear it down.
    ConnectionDestroy(Arc<Connection>),
    /// The controlling peer nominated this pair.
    UseCandidate(Arc<Connection>),
    /// User data received on a readable connection.
    ReadPacket(Vec<u8>),
    /// The port outlived its grace period with no connections.
    PortDestroyed(Arc<Port>),
}

pub struct PortConfig {
    pub kind: PortKind,
    pub component: u16,
    pub mode: IceMode,
    pub conn: Arc<dyn Conn + Send + Sync>,
    pub ufrag: String,
    pub pwd: String,
    pub role: Role,
    pub tiebreaker: u64,
    pub generation: u32,
    pub network_name: String,
    /// Grace period before an empty port self-destroys; 0 picks the default.
    pub timeout_delay: u64,
    pub events: mpsc::UnboundedSender<PortEvent>,
}

/// Port is one local socket: it owns the candidates it produced and one
/// Connection per observed remote address, and it is the single place where
/// inbound STUN traffic is validated.
pub struct Port {
    kind: PortKind,
    component: u16,
    mode: AtomicU8,
    conn: Arc<dyn Conn + Send + Sync>,
    ice_ufrag: String,
    pwd: String,
    role: AtomicU8,
    tiebreaker: AtomicU64,
    generation: u32,
    network_name: String,
    timeout_delay: u64,

    candidates: SyncMutex<Vec<Candidate>>,
    connections: SyncMutex<HashMap<SocketAddr, Arc<Connection>>>,
    lifetime: AtomicU8,
    closed: AtomicBool,
    closed_tx: SyncMutex<Option<tokio::sync::broadcast::Sender<()>>>,

    events: mpsc::UnboundedSender<PortEvent>,
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Port[{}:{}:{}]",
            self.component,
            self.generation,
            self.kind.candidate_type(),
        )
    }
}

impl Port {
    pub fn new(config: PortConfig) -> Arc<Self> {
        let (ufrag, pwd) = if config.ufrag.is_empty() {
            (generate_ufrag(), generate_pwd())
        } else {
            (config.ufrag, config.pwd)
        };

        let timeout_delay = if config.timeout_delay == 0 {
            PORT_TIMEOUT_DELAY
        } else {
            config.timeout_delay
        };

        let port = Arc::new(Port {
            kind: config.kind,
            component: config.component,
            mode: AtomicU8::new(config.mode.as_u8()),
            conn: config.conn,
            ice_ufrag: ufrag,
            pwd,
            role: AtomicU8::new(config.role.as_u8()),
            tiebreaker: AtomicU64::new(config.tiebreaker),
            generation: config.generation,
            network_name: config.network_name,
            timeout_delay,
            candidates: SyncMutex::new(vec![]),
            connections: SyncMutex::new(HashMap::new()),
            lifetime: AtomicU8::new(LT_PRESTART),
            closed: AtomicBool::new(false),
            closed_tx: SyncMutex::new(Some(tokio::sync::broadcast::channel(1).0)),
            events: config.events,
        });
        log::info!("[{port}]: port created");
        port
    }

    pub fn component(&self) -> u16 {
        self.component
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn kind(&self) -> &PortKind {
        &self.kind
    }

    pub fn ice_mode(&self) -> IceMode {
        IceMode::from_u8(self.mode.load(Ordering::SeqCst))
    }

    pub fn set_ice_mode(&self, mode: IceMode) {
        self.mode.store(mode.as_u8(), Ordering::SeqCst);
    }

    pub fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::SeqCst))
    }

    pub fn set_role(&self, role: Role) {
        self.role.store(role.as_u8(), Ordering::SeqCst);
    }

    pub fn tiebreaker(&self) -> u64 {
        self.tiebreaker.load(Ordering::SeqCst)
    }

    pub fn set_tiebreaker(&self, tiebreaker: u64) {
        self.tiebreaker.store(tiebreaker, Ordering::SeqCst);
    }

    pub fn password(&self) -> &str {
        &self.pwd
    }

    /// The username fragment peers must present. Legacy mode expects a
    /// different username for the RTCP component, derived from the RTP one.
    pub fn username_fragment(&self) -> String {
        if self.ice_mode() == IceMode::Google && self.component == COMPONENT_RTCP {
            rtcp_ufrag_from_rtp_ufrag(&self.ice_ufrag)
        } else {
            self.ice_ufrag.clone()
        }
    }

    pub fn candidates(&self) -> Vec<Candidate> {
        self.candidates.lock().clone()
    }

    pub fn candidate(&self, index: usize) -> Option<Candidate> {
        self.candidates.lock().get(index).cloned()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().values().cloned().collect()
    }

    pub fn get_connection(&self, remote_addr: &SocketAddr) -> Option<Arc<Connection>> {
        self.connections.lock().get(remote_addr).cloned()
    }

    /// Produces this port's local candidate(s) and announces them. The
    /// socket must already be bound.
    pub async fn prepare_address(self: &Arc<Self>) {
        let base = match self.conn.local_addr().await {
            Ok(a) => a,
            Err(e) => {
                log::error!("[{self}]: could not resolve local address: {e}");
                let _ = self.events.send(PortEvent::AddressError(e.to_string()));
                return;
            }
        };

        let (address, related_address) = match &self.kind {
            PortKind::Host => (base, None),
            PortKind::ServerReflexive { mapped_addr } => (*mapped_addr, Some(base)),
            PortKind::Relay { relayed_addr } => (*relayed_addr, Some(base)),
        };

        let typ = self.kind.candidate_type();
        let candidate = Candidate {
            id: generate_cand_id(),
            component: self.component,
            protocol: ProtocolType::Udp,
            address,
            priority: compute_priority(typ.preference(), DEFAULT_LOCAL_PREFERENCE, self.component),
            username: self.username_fragment(),
            password: self.pwd.clone(),
            typ,
            foundation: compute_foundation(typ, &base.ip(), ProtocolType::Udp),
            generation: self.generation,
            related_address,
            network_name: self.network_name.clone(),
        };

        self.candidates.lock().push(candidate.clone());
        let _ = self.events.send(PortEvent::CandidateReady(candidate));
        let _ = self.events.send(PortEvent::AddressReady);
    }

    /// Constructs a Connection to the given remote candidate; fails if one
    /// already exists for that remote address.
    pub fn create_connection(
        self: &Arc<Self>,
        local_index: usize,
        remote: Candidate,
    ) -> Result<Arc<Connection>> {
        let mut connections = self.connections.lock();
        if connections.contains_key(&remote.address) {
            return Err(Error::ErrConnectionAddrAlreadyExist);
        }
        let conn = Connection::new(self, local_index, remote, self.events.clone());
        connections.insert(conn.remote_candidate().address, Arc::clone(&conn));
        Ok(conn)
    }

    /// Called by the channel when a connection it owned has been destroyed.
    pub fn on_connection_destroyed(self: &Arc<Self>, conn: &Arc<Connection>) {
        self.connections
            .lock()
            .remove(&conn.remote_candidate().address);
        self.check_timeout();
    }

    /// Indicates that the port's official use has begun: after the grace
    /// period it destroys itself whenever it holds no connections.
    pub fn start(self: &Arc<Self>) {
        if self.lifetime.compare_exchange(
            LT_PRESTART,
            LT_PRETIMEOUT,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) != Ok(LT_PRESTART)
        {
            log::warn!("[{self}]: port restart attempted");
            return;
        }

        let port = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(tokio::time::Duration::from_millis(port.timeout_delay)).await;
            port.lifetime.store(LT_POSTTIMEOUT, Ordering::SeqCst);
            port.check_timeout();
        });
    }

    // When the connections time out they delete themselves, so a port left
    // with none after the grace period has nothing to offer.
    pub(crate) fn check_timeout(self: &Arc<Self>) {
        if self.lifetime.load(Ordering::SeqCst) == LT_POSTTIMEOUT
            && self.connections.lock().is_empty()
            && !self.closed.load(Ordering::SeqCst)
        {
            log::info!("[{self}]: port deleted");
            let _ = self.events.send(PortEvent::PortDestroyed(Arc::clone(self)));
        }
    }

    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.closed_tx.lock().take();
            let _ = self.conn.close().await;
        }
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Raw socket send.
    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(self.conn.send_to(data, addr).await?)
    }

    /// Spawns the socket read loop. Exits when the port is closed.
    pub fn spawn_recv_loop(self: &Arc<Self>) {
        let mut closed_rx = match &*self.closed_tx.lock() {
            Some(tx) => tx.subscribe(),
            None => return,
        };

        let port = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; RECEIVE_MTU];
            loop {
                tokio::select! {
                    result = port.conn.recv_from(&mut buf) => {
                        match result {
                            Ok((n, addr)) => port.on_read(&buf[..n], addr).await,
                            Err(e) => {
                                log::debug!("[{port}]: read loop exited: {e}");
                                return;
                            }
                        }
                    }
                    _ = closed_rx.recv() => return,
                }
            }
        });
    }

    /// Demultiplexes one inbound packet by remote address.
    pub async fn on_read(self: &Arc<Self>, data: &[u8], addr: SocketAddr) {
        let conn = self.get_connection(&addr);
        match conn {
            Some(conn) => conn.on_read_packet(data).await,
            None => self.handle_unknown_address(data, addr).await,
        }
    }

    // A packet from an address we have no connection for. If it is an
    // authenticated STUN binding request, signal the channel so it can mint
    // a peer-reflexive candidate and build a Connection.
    async fn handle_unknown_address(self: &Arc<Self>, data: &[u8], addr: SocketAddr) {
        let parsed = match self.get_stun_message(data, addr).await {
            Ok(parsed) => parsed,
            Err(_) => {
                log::error!("[{self}]: non-STUN packet from unknown address {addr}");
                return;
            }
        };

        let (msg, remote_ufrag) = match parsed {
            Some(v) => v,
            // Handled (answered) internally.
            None => return,
        };

        if msg.typ == BINDING_REQUEST {
            if self.ice_mode() == IceMode::Rfc5245
                && !self.maybe_ice_role_conflict(addr, &msg).await
            {
                log::info!("[{self}]: received conflicting role from the peer");
                return;
            }

            let _ = self.events.send(PortEvent::UnknownAddress {
                port: Arc::clone(self),
                addr,
                msg: Box::new(msg),
                remote_ufrag,
            });
        } else if msg.typ != BINDING_SUCCESS {
            // A success response here is benign: it happens when a pruned
            // connection still had requests in flight.
            log::error!(
                "[{self}]: unexpected STUN message type ({}) from unknown address {addr}",
                msg.typ
            );
        }
    }

    /// Validates one inbound packet as STUN.
    ///
    /// Returns Err when the data is not a complete, correct STUN message for
    /// this port (the caller treats it as application data), Ok(None) when
    /// the message was STUN but failed a check and has been answered
    /// internally, and Ok(Some((msg, remote_ufrag))) for validated messages
    /// (the ufrag is empty for responses, which are linked by transaction id
    /// instead).
    pub(crate) async fn get_stun_message(
        &self,
        data: &[u8],
        addr: SocketAddr,
    ) -> Result<Option<(Message, String)>> {
        if !is_message(data) {
            return Err(Error::Other("not a STUN message".to_owned()));
        }

        let mut msg = Message::new();
        msg.write(data).map_err(Error::Stun)?;

        // In standards-track mode every STUN packet carries a valid
        // fingerprint; reject early when it doesn't.
        if self.ice_mode() == IceMode::Rfc5245 && FINGERPRINT.check(&msg).is_err() {
            return Err(Error::Other("bad STUN fingerprint".to_owned()));
        }

        if msg.typ == BINDING_REQUEST {
            // USERNAME (and MESSAGE-INTEGRITY when standards-track) must be
            // present, else 400.
            if !msg.contains(ATTR_USERNAME)
                || (self.ice_mode() == IceMode::Rfc5245
                    && !msg.contains(ATTR_MESSAGE_INTEGRITY))
            {
                log::error!("[{self}]: STUN request without username/M-I from {addr}");
                self.send_binding_error_response(&msg, addr, CODE_BAD_REQUEST, "Bad Request")
                    .await;
                return Ok(None);
            }

            // A bad or unknown local username fails with 401.
            let (local_ufrag, remote_ufrag) = match self.parse_stun_username(&msg) {
                Some(v) => v,
                None => {
                    self.send_binding_error_response(&msg, addr, CODE_UNAUTHORIZED, "Unauthorized")
                        .await;
                    return Ok(None);
                }
            };
            if local_ufrag != self.username_fragment() {
                log::error!(
                    "[{self}]: STUN request with bad local username {local_ufrag} from {addr}"
                );
                self.send_binding_error_response(&msg, addr, CODE_UNAUTHORIZED, "Unauthorized")
                    .await;
                return Ok(None);
            }

            // Standards-track: a bad MESSAGE-INTEGRITY also fails with 401.
            if self.ice_mode() == IceMode::Rfc5245 {
                let integrity = MessageIntegrity::new_short_term_integrity(self.pwd.clone());
                let mut check_msg = msg.clone();
                if integrity.check(&mut check_msg).is_err() {
                    log::error!("[{self}]: STUN request with bad M-I from {addr}");
                    self.send_binding_error_response(&msg, addr, CODE_UNAUTHORIZED, "Unauthorized")
                        .await;
                    return Ok(None);
                }
            }

            Ok(Some((msg, remote_ufrag)))
        } else if msg.typ == BINDING_SUCCESS || msg.typ == BINDING_ERROR {
            if msg.typ == BINDING_ERROR {
                let mut error_attr = ErrorCodeAttribute::default();
                match error_attr.get_from(&msg) {
                    Ok(()) => {
                        log::error!(
                            "[{self}]: STUN binding error: class={} number={} from {addr}",
                            error_attr.class,
                            error_attr.number
                        );
                    }
                    Err(_) => {
                        log::error!("[{self}]: STUN binding error without error code from {addr}");
                        return Ok(None);
                    }
                }
            }
            // Username is not used to verify responses; the transaction id
            // is the linkage.
            Ok(Some((msg, String::new())))
        } else {
            log::error!(
                "[{self}]: STUN packet with invalid type ({}) from {addr}",
                msg.typ
            );
            Ok(None)
        }
    }

    /// Splits the USERNAME attribute into (local_ufrag, remote_ufrag).
    /// Standards-track usernames are `LFRAG:RFRAG` from the receiver's view;
    /// legacy ones are a plain concatenation with the local fragment first.
    pub(crate) fn parse_stun_username(&self, msg: &Message) -> Option<(String, String)> {
        let username = match TextAttribute::get_from_as(msg, ATTR_USERNAME) {
            Ok(u) => u.text,
            Err(_) => return None,
        };

        if self.ice_mode() == IceMode::Rfc5245 {
            let colon = username.find(':')?;
            let (local, remote) = username.split_at(colon);
            Some((local.to_owned(), remote[1..].to_owned()))
        } else {
            let our = self.username_fragment();
            if username.len() < our.len() {
                return None;
            }
            let (local, remote) = username.split_at(our.len());
            Some((local.to_owned(), remote.to_owned()))
        }
    }

    /// Builds the USERNAME value for an outgoing check: the remote fragment,
    /// then ours, colon-separated in standards-track mode.
    pub(crate) fn create_stun_username(&self, remote_username: &str) -> String {
        if self.ice_mode() == IceMode::Rfc5245 {
            format!("{remote_username}:{}", self.username_fragment())
        } else {
            format!("{remote_username}{}", self.username_fragment())
        }
    }

    /// Checks ICE-CONTROLLING/ICE-CONTROLLED on an inbound request against
    /// our role. Returns false when the request must be dropped (we answered
    /// 487); emits a role-conflict event when we are the side that must
    /// switch.
    pub(crate) async fn maybe_ice_role_conflict(
        self: &Arc<Self>,
        addr: SocketAddr,
        msg: &Message,
    ) -> bool {
        let mut control = AttrControl::default();
        if control.get_from(msg).is_err() {
            // No control attribute; nothing to arbitrate.
            return true;
        }

        let our_role = self.role();
        if our_role == Role::Unspecified {
            log::warn!("[{self}]: role conflict check without a negotiated role");
            return true;
        }
        if control.role != our_role {
            return true;
        }

        // Same role on both sides: the larger tiebreaker stays, the other
        // switches.
        if control.tie_breaker.0 >= self.tiebreaker() {
            self.signal_role_conflict();
            true
        } else {
            self.send_binding_error_response(msg, addr, CODE_ROLE_CONFLICT, "Role Conflict")
                .await;
            false
        }
    }

    pub(crate) fn signal_role_conflict(&self) {
        let _ = self
            .events
            .send(PortEvent::RoleConflict { was: self.role() });
    }

    /// Sends a binding success response to the given request.
    pub(crate) async fn send_binding_response(&self, request: &Message, addr: SocketAddr) {
        let mut response = Message::new();
        response.set_type(BINDING_SUCCESS);
        response.transaction_id = request.transaction_id;
        response.write_header();

        let result = if self.ice_mode() == IceMode::Rfc5245 {
            // Standards-track responses carry XOR-MAPPED-ADDRESS and are
            // authenticated.
            XorMappedAddress {
                ip: addr.ip(),
                port: addr.port(),
            }
            .add_to(&mut response)
            .and_then(|_| {
                MessageIntegrity::new_short_term_integrity(self.pwd.clone()).add_to(&mut response)
            })
            .and_then(|_| FINGERPRINT.add_to(&mut response))
        } else {
            // Legacy responses echo the USERNAME and use MAPPED-ADDRESS.
            MappedAddress {
                ip: addr.ip(),
                port: addr.port(),
            }
            .add_to(&mut response)
            .and_then(|_| match request.get(ATTR_USERNAME) {
                Ok(username) => {
                    response.add(ATTR_USERNAME, &username);
                    Ok(())
                }
                Err(e) => Err(e),
            })
        };

        if let Err(e) = result {
            log::error!("[{self}]: failed to build STUN ping response: {e}");
            return;
        }

        if self.send_to(&response.raw, addr).await.is_err() {
            log::error!("[{self}]: failed to send STUN ping response to {addr}");
        }
    }

    /// Sends a binding error response to the given request. Legacy mode
    /// writes the class/number split incorrectly on purpose, for backwards
    /// compatibility.
    pub(crate) async fn send_binding_error_response(
        &self,
        request: &Message,
        addr: SocketAddr,
        code: ErrorCode,
        reason: &str,
    ) {
        let mut response = Message::new();
        response.set_type(BINDING_ERROR);
        response.transaction_id = request.transaction_id;
        response.write_header();

        let error_attr = if self.ice_mode() == IceMode::Rfc5245 {
            ErrorCodeAttribute::new(code, reason.as_bytes().to_vec())
        } else {
            ErrorCodeAttribute::new_legacy(code, reason.as_bytes().to_vec())
        };

        let mut result = error_attr.add_to(&mut response);

        if self.ice_mode() == IceMode::Rfc5245 {
            // Per RFC 5389 10.1.2, 400 and 401 are sent without
            // MESSAGE-INTEGRITY: we may not know the shared secret yet.
            if code != CODE_BAD_REQUEST && code != CODE_UNAUTHORIZED {
                result = result.and_then(|_| {
                    MessageIntegrity::new_short_term_integrity(self.pwd.clone())
                        .add_to(&mut response)
                });
            }
            result = result.and_then(|_| FINGERPRINT.add_to(&mut response));
        } else if let Ok(username) = request.get(ATTR_USERNAME) {
            response.add(ATTR_USERNAME, &username);
        }

        if let Err(e) = result {
            log::error!("[{self}]: failed to build STUN error response: {e}");
            return;
        }

        let _ = self.send_to(&response.raw, addr).await;
        log::info!("[{self}]: sent STUN binding error: reason={reason} to {addr}");
    }
}
