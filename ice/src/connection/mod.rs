
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use stun::attributes::*;
use stun::error_code::*;
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::*;
use stun::textattrs::TextAttribute;
use util::sync::Mutex as SyncMutex;

use crate::candidate::*;
use crate::control::*;
use crate::port::{Port, PortEvent};
use crate::priority::PriorityAttr;
use crate::use_candidate::UseCandidateAttr;

// The length of time we wait before timing out readability on a connection.
pub const CONNECTION_READ_TIMEOUT: u64 = 30 * 1000; // 30 seconds

// The length of time we wait before timing out writability on a connection.
pub const CONNECTION_WRITE_TIMEOUT: u64 = 15 * 1000; // 15 seconds

// The length of time we wait before we become unwritable.
pub const CONNECTION_WRITE_CONNECT_TIMEOUT: u64 = 5 * 1000; // 5 seconds

// The number of pings that must fail to respond before we become unwritable.
pub const CONNECTION_WRITE_CONNECT_FAILURES: usize = 5;

// This is the length of time that we wait for a ping response to come back.
pub const CONNECTION_RESPONSE_TIMEOUT: u64 = 5 * 1000; // 5 seconds

// RTT estimates used for state decisions are restricted to a sane range.
const MINIMUM_RTT: u64 = 100; // 0.1 seconds
const MAXIMUM_RTT: u64 = 3000; // 3 seconds

// When we don't have any RTT data we have to pick something reasonable; a
// large value, in case the path is really slow.
const DEFAULT_RTT: u64 = MAXIMUM_RTT;

// Weighting of the old rtt value against new samples.
const RTT_RATIO: u64 = 3; // 3 : 1

// How often to ping while the connection is still proving itself, and how
// often once it is writable.
pub(crate) const PING_INTERVAL: u64 = 500;
pub(crate) const KEEPALIVE_INTERVAL: u64 = 2500;

/// Milliseconds since the unix epoch; the time base for all connection
/// state decisions.
pub fn time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn conservative_rtt_estimate(rtt: u64) -> u64 {
    (2 * rtt).clamp(MINIMUM_RTT, MAXIMUM_RTT)
}

// Whether at least `maximum_failures` pings have gone long enough without a
// response that we would have expected one.
fn too_many_failures(
    pings_since_last_response: &[u64],
    maximum_failures: usize,
    rtt_estimate: u64,
    now: u64,
) -> bool {
    if pings_since_last_response.len() < maximum_failures {
        return false;
    }

    pings_since_last_response[maximum_failures - 1] + rtt_estimate < now
}

// Whether we have gone too long without seeing any response at all.
fn too_long_without_response(
    pings_since_last_response: &[u64],
    maximum_time: u64,
    now: u64,
) -> bool {
    match pings_since_last_response.first() {
        Some(first) => first + maximum_time < now,
        None => false,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadState {
    /// We have yet to receive a ping.
    ReadInit = 0,
    /// We have received pings recently.
    Readable = 1,
    /// We haven't received pings in a while.
    ReadTimeout = 2,
}

impl From<u8> for ReadState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Readable,
            2 => Self::ReadTimeout,
            _ => Self::ReadInit,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteState {
    /// We have received ping responses recently.
    Writable = 0,
    /// We have had a few ping failures.
    WriteUnreliable = 1,
    /// We have yet to receive a ping response.
    WriteInit = 2,
    /// We are re-proving writability after failures.
    WriteConnect = 3,
    /// We have had a large number of ping failures.
    WriteTimeout = 4,
}

impl From<u8> for WriteState {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Writable,
            1 => Self::WriteUnreliable,
            3 => Self::WriteConnect,
            4 => Self::WriteTimeout,
            _ => Self::WriteInit,
        }
    }
}

/// An in-flight STUN ping, kept until a response matches its transaction id
/// or the response timeout prunes it.
#[derive(Clone, Debug)]
pub(crate) struct BindingRequest {
    pub(crate) transaction_id: TransactionId,
    pub(crate) sent_at: u64,
    pub(crate) is_use_candidate: bool,
    /// The role we held when this ping went out; a 487 answering it is
    /// stale once the role has changed.
    pub(crate) role: Role,
}

/// Connection is a candidate pair: one local candidate (through its Port)
/// and one remote candidate. It runs the STUN ping state machine and carries
/// user data once writable.
#[derive(Debug)]
pub struct Connection {
    port: Weak<Port>,
    local_index: usize,
    remote: Candidate,

    read_state: AtomicU8,
    write_state: AtomicU8,
    connected: AtomicBool,
    pruned: AtomicBool,
    nominated: AtomicBool,

    rtt: AtomicU64,
    created_at: u64,
    last_ping_sent: AtomicU64,
    last_ping_received: AtomicU64,
    last_data_received: AtomicU64,
    last_response_received: AtomicU64,

    pings_since_last_response: SyncMutex<Vec<u64>>,
    requests: SyncMutex<Vec<BindingRequest>>,

    events: tokio::sync::mpsc::UnboundedSender<PortEvent>,
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Conn[{}->{}|{:?}|{:?}]",
            self.local_candidate()
                .map(|c| c.address.to_string())
                .unwrap_or_else(|| "?".to_owned()),
            self.remote.address,
            self.read_state(),
            self.write_state(),
        )
    }
}

impl Connection {
    pub(crate) fn new(
        port: &Arc<Port>,
        local_index: usize,
        remote: Candidate,
        events: tokio::sync::mpsc::UnboundedSender<PortEvent>,
    ) -> Arc<Self> {
        let conn = Arc::new(Connection {
            port: Arc::downgrade(port),
            local_index,
            remote,
            read_state: AtomicU8::new(ReadState::ReadInit as u8),
            write_state: AtomicU8::new(WriteState::WriteInit as u8),
            connected: AtomicBool::new(true),
            pruned: AtomicBool::new(false),
            nominated: AtomicBool::new(false),
            rtt: AtomicU64::new(DEFAULT_RTT),
            created_at: time_ms(),
            last_ping_sent: AtomicU64::new(0),
            last_ping_received: AtomicU64::new(0),
            last_data_received: AtomicU64::new(0),
            last_response_received: AtomicU64::new(0),
            pings_since_last_response: SyncMutex::new(vec![]),
            requests: SyncMutex::new(vec![]),
            events,
        });
        log::info!("[{conn}]: connection created");
        conn
    }

    pub fn port(&self) -> Option<Arc<Port>> {
        self.port.upgrade()
    }

    /// The local candidate of this pair, looked up through the Port.
    pub fn local_candidate(&self) -> Option<Candidate> {
        self.port.upgrade().and_then(|p| p.candidate(self.local_index))
    }

    /// The remote candidate of this pair.
    pub fn remote_candidate(&self) -> &Candidate {
        &self.remote
    }

    pub fn read_state(&self) -> ReadState {
        ReadState::from(self.read_state.load(Ordering::SeqCst))
    }

    pub fn write_state(&self) -> WriteState {
        WriteState::from(self.write_state.load(Ordering::SeqCst))
    }

    pub fn readable(&self) -> bool {
        self.read_state() == ReadState::Readable
    }

    pub fn writable(&self) -> bool {
        self.write_state() == WriteState::Writable
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn pruned(&self) -> bool {
        self.pruned.load(Ordering::SeqCst)
    }

    pub fn nominated(&self) -> bool {
        self.nominated.load(Ordering::SeqCst)
    }

    pub fn set_nominated(&self, nominated: bool) {
        self.nominated.store(nominated, Ordering::SeqCst);
    }

    /// Estimate of the round-trip time over this connection, in ms.
    pub fn rtt(&self) -> u64 {
        self.rtt.load(Ordering::SeqCst)
    }

    pub fn last_ping_received(&self) -> u64 {
        self.last_ping_received.load(Ordering::SeqCst)
    }

    pub fn last_ping_sent(&self) -> u64 {
        self.last_ping_sent.load(Ordering::SeqCst)
    }

    /// RFC 5245 pair priority, computed from the role this side plays.
    pub fn pair_priority(&self, controlling: bool) -> u64 {
        let local = self
            .local_candidate()
            .map(|c| c.priority)
            .unwrap_or_default();
        let remote = self.remote.priority;
        if controlling {
            pair_priority(local, remote)
        } else {
            pair_priority(remote, local)
        }
    }

    fn set_read_state(self: &Arc<Self>, value: ReadState) {
        let old = self.read_state.swap(value as u8, Ordering::SeqCst);
        if old != value as u8 {
            log::debug!("[{self}]: set_read_state {:?} -> {value:?}", ReadState::from(old));
            let _ = self
                .events
                .send(PortEvent::ConnectionStateChange(Arc::clone(self)));
            self.check_timeout();
        }
    }

    fn set_write_state(self: &Arc<Self>, value: WriteState) {
        let old = self.write_state.swap(value as u8, Ordering::SeqCst);
        if old != value as u8 {
            log::debug!(
                "[{self}]: set_write_state {:?} -> {value:?}",
                WriteState::from(old)
            );
            let _ = self
                .events
                .send(PortEvent::ConnectionStateChange(Arc::clone(self)));
            self.check_timeout();
        }
    }

    /// Called whenever a valid authenticated binding request arrives on this
    /// connection: the peer can reach us.
    pub(crate) fn received_ping(self: &Arc<Self>) {
        self.last_ping_received.store(time_ms(), Ordering::SeqCst);
        self.set_read_state(ReadState::Readable);
    }

    /// Marks the connection as no longer interesting: pinging stops, and the
    /// write state is parked in timeout so it can die once reads expire too.
    pub fn prune(self: &Arc<Self>) {
        if !self.pruned.swap(true, Ordering::SeqCst) {
            log::debug!("[{self}]: connection pruned");
            self.requests.lock().clear();
            self.set_write_state(WriteState::WriteTimeout);
        }
    }

    /// Makes the connection go away: both states jump to their timeout
    /// values, which schedules destruction.
    pub fn destroy(self: &Arc<Self>) {
        log::debug!("[{self}]: connection destroyed");
        self.set_read_state(ReadState::ReadTimeout);
        self.set_write_state(WriteState::WriteTimeout);
    }

    // Once both directions have timed out this connection cannot contribute
    // anything. Destruction is posted as an event, never run inline from a
    // state-change signal.
    fn check_timeout(self: &Arc<Self>) {
        if self.read_state() == ReadState::ReadTimeout
            && self.write_state() == WriteState::WriteTimeout
        {
            let _ = self
                .events
                .send(PortEvent::ConnectionDestroy(Arc::clone(self)));
        }
    }

    /// Whether the periodic driver should send a ping on this connection now.
    pub(crate) fn should_ping(&self, now: u64) -> bool {
        if !self.connected() || self.pruned() || self.write_state() == WriteState::WriteTimeout {
            return false;
        }
        let interval = if self.writable() {
            KEEPALIVE_INTERVAL
        } else {
            PING_INTERVAL
        };
        self.last_ping_sent() + interval <= now
    }

    /// Checks that the state of this connection is up-to-date against the
    /// various timeouts. `now` is in the time_ms() domain.
    pub fn update_state(self: &Arc<Self>, now: u64) {
        let rtt = conservative_rtt_estimate(self.rtt());

        // Readability: since we don't know how many pings the other side has
        // attempted, the best we can do is a simple window.
        let last_ping_received = self.last_ping_received();
        match self.read_state() {
            ReadState::Readable => {
                if last_ping_received + CONNECTION_READ_TIMEOUT <= now {
                    log::info!(
                        "[{self}]: unreadable after {} ms without a ping",
                        now - last_ping_received
                    );
                    self.set_read_state(ReadState::ReadTimeout);
                }
            }
            ReadState::ReadInit => {
                if self.created_at + CONNECTION_READ_TIMEOUT <= now {
                    self.set_read_state(ReadState::ReadTimeout);
                }
            }
            ReadState::ReadTimeout => {}
        }

        // Writability. Before becoming unwritable we allow a fixed number of
        // pings to fail and give responses a conservative window to return;
        // before timing out entirely we allow a fixed grace for network
        // conditions to change.
        let pings = self.pings_since_last_response.lock().clone();
        let write_state = self.write_state();

        if write_state == WriteState::Writable
            && too_many_failures(&pings, CONNECTION_WRITE_CONNECT_FAILURES, rtt, now)
            && too_long_without_response(&pings, CONNECTION_WRITE_CONNECT_TIMEOUT, now)
        {
            log::info!(
                "[{self}]: unwritable after {} ping failures and {} ms without a response",
                CONNECTION_WRITE_CONNECT_FAILURES,
                now - pings[0]
            );
            self.set_write_state(WriteState::WriteConnect);
        }

        if matches!(
            self.write_state(),
            WriteState::WriteConnect | WriteState::WriteInit | WriteState::WriteUnreliable
        ) && too_long_without_response(&pings, CONNECTION_WRITE_TIMEOUT, now)
        {
            log::info!(
                "[{self}]: timed out after {} ms without a response",
                now - pings[0]
            );
            self.set_write_state(WriteState::WriteTimeout);
        }

        // Prune requests that will never be answered.
        let mut requests = self.requests.lock();
        requests.retain(|r| {
            let alive = r.sent_at + CONNECTION_RESPONSE_TIMEOUT > now;
            if !alive {
                log::debug!(
                    "[{self}]: timing out STUN ping {:?} after {} ms",
                    r.transaction_id,
                    now - r.sent_at
                );
            }
            alive
        });
    }

    /// Sends a STUN binding request on this pair. Each request is sent only
    /// once; after the response timeout it is dropped, and the next tick
    /// schedules a fresh one.
    pub async fn ping(self: &Arc<Self>, now: u64) -> crate::error::Result<()> {
        let port = match self.port.upgrade() {
            Some(p) => p,
            None => return Err(crate::error::Error::ErrClosed),
        };

        let use_candidate = self.nominated() && port.role() == Role::Controlling;

        let mut msg = Message::new();
        let username = port.create_stun_username(&self.remote.username);
        {
            let mut setters: Vec<Box<dyn Setter>> = vec![
                Box::new(BINDING_REQUEST),
                Box::new(TransactionId::new()),
                Box::new(TextAttribute::new(ATTR_USERNAME, username)),
            ];

            if port.ice_mode() == IceMode::Rfc5245 {
                match port.role() {
                    Role::Controlling => {
                        setters.push(Box::new(AttrControlling(port.tiebreaker())));
                    }
                    Role::Controlled => {
                        setters.push(Box::new(AttrControlled(port.tiebreaker())));
                    }
                    Role::Unspecified => {
                        log::warn!("[{self}]: pinging without a negotiated role");
                    }
                }

                if use_candidate {
                    setters.push(Box::new(UseCandidateAttr::new()));
                }

                // The priority a peer-reflexive candidate minted from this check
                // would get: type preference swapped for prflx, the rest kept.
                let local_priority = self
                    .local_candidate()
                    .map(|c| c.priority)
                    .unwrap_or_default();
                let prflx_priority = ((CandidateType::PeerReflexive.preference() as u32) << 24)
                    | (local_priority & 0x00FF_FFFF);
                setters.push(Box::new(PriorityAttr(prflx_priority)));

                setters.push(Box::new(MessageIntegrity::new_short_term_integrity(
                    self.remote.password.clone(),
                )));
                setters.push(Box::new(FINGERPRINT));
            }

            msg.build(&setters)?;
        }

        self.last_ping_sent.store(now, Ordering::SeqCst);
        self.pings_since_last_response.lock().push(now);
        self.requests.lock().push(BindingRequest {
            transaction_id: msg.transaction_id,
            sent_at: now,
            is_use_candidate: use_candidate,
            role: port.role(),
        });

        log::trace!("[{self}]: sending STUN ping at {now}");
        port.send_to(&msg.raw, self.remote.address).await?;
        Ok(())
    }

    /// Sends user data over this pair; fails with would-block semantics
    /// unless writable.
    pub async fn send(&self, data: &[u8]) -> crate::error::Result<usize> {
        if self.write_state() != WriteState::Writable {
            return Err(crate::error::Error::ErrSendPacket);
        }
        let port = self
            .port
            .upgrade()
            .ok_or(crate::error::Error::ErrClosed)?;
        port.send_to(data, self.remote.address).await
    }

    /// Called for every packet the Port demultiplexes to this connection.
    pub(crate) async fn on_read_packet(self: &Arc<Self>, data: &[u8]) {
        let port = match self.port.upgrade() {
            Some(p) => p,
            None => return,
        };
        let addr = self.remote.address;

        let parsed = match port.get_stun_message(data, addr).await {
            Ok(parsed) => parsed,
            Err(_) => {
                // Not STUN. If this connection is readable then data from
                // this address is acceptable; pass it along.
                if self.readable() {
                    self.last_data_received.store(time_ms(), Ordering::SeqCst);
                    let _ = self.events.send(PortEvent::ReadPacket(data.to_vec()));

                    // If we timed out writability checks, start up again.
                    if !self.pruned() && self.write_state() == WriteState::WriteTimeout {
                        self.set_write_state(WriteState::WriteConnect);
                    }
                } else {
                    log::warn!("[{self}]: non-STUN packet from an unreadable connection");
                }
                return;
            }
        };

        let (msg, remote_ufrag) = match parsed {
            Some(v) => v,
            // STUN, but failed a check and was answered internally.
            None => return,
        };

        match msg.typ {
            BINDING_REQUEST => {
                if remote_ufrag != self.remote.username {
                    // Right local username, wrong remote username for this
                    // address.
                    log::error!(
                        "[{self}]: STUN request with bad remote username {remote_ufrag}"
                    );
                    port.send_binding_error_response(
                        &msg,
                        addr,
                        CODE_UNAUTHORIZED,
                        "Unauthorized",
                    )
                    .await;
                    return;
                }

                if port.ice_mode() == IceMode::Rfc5245
                    && !port.maybe_ice_role_conflict(addr, &msg).await
                {
                    log::info!("[{self}]: received conflicting role from the peer");
                    return;
                }

                // Incoming, validated request from the remote peer. The
                // response also marks this connection readable.
                port.send_binding_response(&msg, addr).await;
                self.received_ping();

                if !self.pruned() && self.write_state() == WriteState::WriteTimeout {
                    self.set_write_state(WriteState::WriteConnect);
                }

                if port.ice_mode() == IceMode::Rfc5245
                    && port.role() == Role::Controlled
                    && UseCandidateAttr::is_set(&msg)
                {
                    let _ = self
                        .events
                        .send(PortEvent::UseCandidate(Arc::clone(self)));
                }
            }
            BINDING_SUCCESS | BINDING_ERROR => {
                if msg.typ == BINDING_SUCCESS && port.ice_mode() == IceMode::Rfc5245 {
                    let mut msg = msg.clone();
                    let integrity =
                        MessageIntegrity::new_short_term_integrity(self.remote.password.clone());
                    if integrity.check(&mut msg).is_err() {
                        log::warn!("[{self}]: discarding response with bad message integrity");
                        return;
                    }
                }
                self.check_response(&msg).await;
                // USE-CANDIDATE is one-shot per answered ping.
                self.set_nominated(false);
            }
            _ => {
                log::error!("[{self}]: received STUN packet with invalid type {}", msg.typ);
            }
        }
    }

    // Matches a response against the outstanding-ping list by transaction id
    // and classifies it.
    async fn check_response(self: &Arc<Self>, msg: &Message) {
        let request = {
            let mut requests = self.requests.lock();
            match requests
                .iter()
                .position(|r| r.transaction_id == msg.transaction_id)
            {
                Some(pos) => requests.remove(pos),
                None => {
                    log::trace!("[{self}]: response for unknown transaction, ignoring");
                    return;
                }
            }
        };

        if msg.typ == BINDING_SUCCESS {
            self.on_request_response(&request);
        } else {
            self.on_request_error_response(msg, &request).await;
        }
    }

    // A success response: the pair is confirmed writable, whatever it was.
    // We may be bringing a pruned connection back to life, but if we don't
    // really want it, it can always be pruned again.
    fn on_request_response(self: &Arc<Self>, request: &BindingRequest) {
        let now = time_ms();
        let rtt_sample = now.saturating_sub(request.sent_at);
        log::trace!("[{self}]: received STUN ping response, rtt={rtt_sample}");

        self.set_write_state(WriteState::Writable);
        self.pings_since_last_response.lock().clear();
        self.last_response_received.store(now, Ordering::SeqCst);

        let rtt = self.rtt();
        self.rtt.store(
            (RTT_RATIO * rtt + rtt_sample) / (RTT_RATIO + 1),
            Ordering::SeqCst,
        );
    }

    async fn on_request_error_response(self: &Arc<Self>, msg: &Message, request: &BindingRequest) {
        let port = match self.port.upgrade() {
            Some(p) => p,
            None => return,
        };

        let mut error_attr = ErrorCodeAttribute::default();
        let error_code = match error_attr.get_from(msg) {
            Ok(()) => {
                if port.ice_mode() == IceMode::Google {
                    // Legacy peers write the code out with the wrong
                    // arithmetic; unmunge it here.
                    error_attr.legacy_code()
                } else {
                    error_attr.code()
                }
            }
            Err(_) => CODE_GLOBAL_FAILURE,
        };

        match error_code {
            CODE_BAD_REQUEST | CODE_UNAUTHORIZED | CODE_UNKNOWN_ATTRIBUTE
            | CODE_STALE_CREDENTIALS | CODE_SERVER_ERROR => {
                // Recoverable; retry on the next ping tick.
                log::debug!("[{self}]: recoverable STUN error {}", error_code.0);
            }
            CODE_ROLE_CONFLICT => {
                self.handle_role_conflict_from_peer(request);
            }
            _ => {
                log::error!(
                    "[{self}]: STUN error response, code={}; killing connection",
                    error_code.0
                );
                self.set_write_state(WriteState::WriteTimeout);
            }
        }
    }

    /// Invoked when the peer answered our ping with a 487: the peer won the
    /// tiebreak and we must change roles. The flip itself is coordinated by
    /// the Transport; a 487 for a ping sent under a role we no longer hold
    /// is stale and must not flip us back.
    fn handle_role_conflict_from_peer(self: &Arc<Self>, request: &BindingRequest) {
        if let Some(port) = self.port.upgrade() {
            if port.role() != request.role {
                log::debug!("[{self}]: stale role conflict, already switched");
                return;
            }
            if port.role() == Role::Controlling {
                // Role change will be done from the transport; drop our
                // nomination so the next controlling side decides afresh.
                self.set_nominated(false);
            }
            port.signal_role_conflict();
        }
    }

    #[cfg(test)]
    pub(crate) fn set_write_state_for_test(self: &Arc<Self>, s: WriteState) {
        self.set_write_state(s);
    }

    #[cfg(test)]
    pub(crate) fn push_ping_for_test(&self, sent_at: u64) {
        self.pings_since_last_response.lock().push(sent_at);
        self.last_ping_sent.store(sent_at, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn received_ping_for_test(self: &Arc<Self>) {
        self.received_ping();
    }
}
