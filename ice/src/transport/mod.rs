#[cfg(test)]
mod transport_test;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio::sync::{mpsc, Mutex};
use util::sync::Mutex as SyncMutex;

use crate::allocator::PortAllocator;
use crate::candidate::Candidate;
use crate::channel::proxy::TransportChannelProxy;
use crate::channel::{ChannelConfig, ChannelEvent, TransportChannelImpl};
use crate::control::{IceMode, Role};
use crate::description::TransportDescription;
use crate::error::*;
use crate::rand::{generate_pwd, generate_ufrag};

pub type OnStateChangeHdlrFn =
    Box<dyn (FnMut(bool) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync>;
pub type OnNotifyHdlrFn =
    Box<dyn (FnMut() -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync>;
pub type OnCandidateHdlrFn = Box<
    dyn (FnMut(String, Candidate) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>)
        + Send
        + Sync,
>;
pub type OnChannelNameHdlrFn = Box<
    dyn (FnMut(String) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync,
>;

type Hdlr<T> = ArcSwapOption<Mutex<T>>;

/// Transport aggregates several named channels (typically RTP and RTCP)
/// under one signalling identity: readable/writable are the OR of the
/// member channels, and role and tiebreaker are shared across all of them.
pub struct Transport {
    name: String,
    mode: AtomicU8,
    role: AtomicU8,
    tiebreaker: AtomicU64,
    local_ufrag: String,
    local_pwd: String,
    remote_creds: SyncMutex<(String, String)>,

    allocator: Arc<dyn PortAllocator + Send + Sync>,
    port_timeout_delay: u64,

    channels: SyncMutex<HashMap<String, Arc<TransportChannelProxy>>>,
    impls: SyncMutex<HashMap<String, Arc<TransportChannelImpl>>>,

    readable: AtomicBool,
    writable: AtomicBool,
    connect_requested: AtomicBool,
    connecting_signalled: AtomicBool,
    signalling_ready: AtomicBool,
    request_signalling_sent: AtomicBool,
    allocation_done_channels: SyncMutex<HashSet<String>>,
    allocation_done_sent: AtomicBool,
    destroyed: AtomicBool,

    // Outbound candidate messages held until the application reports that
    // signalling is available.
    pending_candidates: SyncMutex<Vec<(String, Candidate)>>,

    events_tx: mpsc::UnboundedSender<(String, ChannelEvent)>,
    done_tx: SyncMutex<Option<mpsc::Sender<()>>>,

    on_connecting_hdlr: Hdlr<OnNotifyHdlrFn>,
    on_readable_state_hdlr: Hdlr<OnStateChangeHdlrFn>,
    on_writable_state_hdlr: Hdlr<OnStateChangeHdlrFn>,
    on_request_signalling_hdlr: Hdlr<OnNotifyHdlrFn>,
    on_candidate_hdlr: Hdlr<OnCandidateHdlrFn>,
    on_candidates_allocation_done_hdlr: Hdlr<OnNotifyHdlrFn>,
    on_role_conflict_hdlr: Hdlr<OnNotifyHdlrFn>,
    on_route_change_hdlr: Hdlr<OnCandidateHdlrFn>,
    on_channel_gone_hdlr: Hdlr<OnChannelNameHdlrFn>,
    on_allocation_failed_hdlr: Hdlr<OnChannelNameHdlrFn>,
}

pub struct TransportConfig {
    pub name: String,
    pub mode: IceMode,
    pub role: Role,
    pub allocator: Arc<dyn PortAllocator + Send + Sync>,
    /// Overrides the empty-port grace period in tests; 0 means the default.
    pub port_timeout_delay: u64,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::channel(1);

        let transport = Arc::new(Transport {
            name: config.name,
            mode: AtomicU8::new(config.mode.as_u8()),
            role: AtomicU8::new(config.role.as_u8()),
            tiebreaker: AtomicU64::new(rand::random::<u64>()),
            local_ufrag: generate_ufrag(),
            local_pwd: generate_pwd(),
            remote_creds: SyncMutex::new((String::new(), String::new())),
            allocator: config.allocator,
            port_timeout_delay: config.port_timeout_delay,
            channels: SyncMutex::new(HashMap::new()),
            impls: SyncMutex::new(HashMap::new()),
            readable: AtomicBool::new(false),
            writable: AtomicBool::new(false),
            connect_requested: AtomicBool::new(false),
            connecting_signalled: AtomicBool::new(false),
            signalling_ready: AtomicBool::new(false),
            request_signalling_sent: AtomicBool::new(false),
            allocation_done_channels: SyncMutex::new(HashSet::new()),
            allocation_done_sent: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            pending_candidates: SyncMutex::new(vec![]),
            events_tx,
            done_tx: SyncMutex::new(Some(done_tx)),
            on_connecting_hdlr: ArcSwapOption::empty(),
            on_readable_state_hdlr: ArcSwapOption::empty(),
            on_writable_state_hdlr: ArcSwapOption::empty(),
            on_request_signalling_hdlr: ArcSwapOption::empty(),
            on_candidate_hdlr: ArcSwapOption::empty(),
            on_candidates_allocation_done_hdlr: ArcSwapOption::empty(),
            on_role_conflict_hdlr: ArcSwapOption::empty(),
            on_route_change_hdlr: ArcSwapOption::empty(),
            on_channel_gone_hdlr: ArcSwapOption::empty(),
            on_allocation_failed_hdlr: ArcSwapOption::empty(),
        });

        let loop_transport = Arc::clone(&transport);
        tokio::spawn(async move {
            loop_transport.run_loop(events_rx, done_rx).await;
        });

        transport
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn readable(&self) -> bool {
        self.readable.load(Ordering::SeqCst)
    }

    pub fn writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn connect_requested(&self) -> bool {
        self.connect_requested.load(Ordering::SeqCst)
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

    /// Role and tiebreaker updates reach every channel, port and connection.
    pub fn set_role(&self, role: Role) {
        self.role.store(role.as_u8(), Ordering::SeqCst);
        for chan in self.impls.lock().values() {
            chan.set_role(role);
        }
    }

    pub fn set_tiebreaker(&self, tiebreaker: u64) {
        self.tiebreaker.store(tiebreaker, Ordering::SeqCst);
        for chan in self.impls.lock().values() {
            chan.set_tiebreaker(tiebreaker);
        }
    }

    pub fn set_ice_mode(&self, mode: IceMode) {
        self.mode.store(mode.as_u8(), Ordering::SeqCst);
        for chan in self.impls.lock().values() {
            chan.set_ice_mode(mode);
        }
    }

    /// The candidate offer for outbound signalling: our credentials under
    /// the namespace of the negotiated dialect.
    pub fn local_description(&self) -> TransportDescription {
        TransportDescription::new(
            self.ice_mode(),
            self.local_ufrag.clone(),
            self.local_pwd.clone(),
        )
    }

    /// Consumes the peer's answer: adopts its dialect and stores the remote
    /// credentials for connectivity checks.
    pub fn set_remote_description(&self, desc: &TransportDescription) -> Result<()> {
        desc.validate()?;
        let mode = desc.mode()?;
        self.set_ice_mode(mode);
        *self.remote_creds.lock() = (desc.ice_ufrag.clone(), desc.ice_pwd.clone());
        for chan in self.impls.lock().values() {
            chan.set_remote_credentials(desc.ice_ufrag.clone(), desc.ice_pwd.clone());
        }
        Ok(())
    }

    /// Returns a proxy handle immediately; the real channel is allocated
    /// and wired in asynchronously.
    pub fn create_channel(
        self: &Arc<Self>,
        name: &str,
        component: u16,
    ) -> Result<Arc<TransportChannelProxy>> {
        let proxy = {
            let mut channels = self.channels.lock();
            if channels.contains_key(name) {
                return Err(Error::ErrChannelAlreadyExists);
            }
            let proxy = TransportChannelProxy::new(name.to_owned(), component);
            channels.insert(name.to_owned(), Arc::clone(&proxy));
            proxy
        };
        self.destroyed.store(false, Ordering::SeqCst);

        let transport = Arc::clone(self);
        let channel_name = name.to_owned();
        let bind_proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            let chan = TransportChannelImpl::new(ChannelConfig {
                name: channel_name.clone(),
                component,
                mode: transport.ice_mode(),
                role: transport.role(),
                tiebreaker: transport.tiebreaker(),
                local_ufrag: transport.local_ufrag.clone(),
                local_pwd: transport.local_pwd.clone(),
                allocator: Arc::clone(&transport.allocator),
                events: transport.events_tx.clone(),
                port_timeout_delay: transport.port_timeout_delay,
            });

            transport
                .impls
                .lock()
                .insert(channel_name, Arc::clone(&chan));

            // Registered first, so a concurrent set_remote_description can
            // no longer miss this channel.
            let (remote_ufrag, remote_pwd) = transport.remote_creds.lock().clone();
            if !remote_ufrag.is_empty() || !remote_pwd.is_empty() {
                chan.set_remote_credentials(remote_ufrag, remote_pwd);
            }

            bind_proxy.set_implementation(Arc::clone(&chan));

            if transport.connect_requested() {
                chan.connect();
                if !transport.connecting_signalled.swap(true, Ordering::SeqCst) {
                    transport.notify(&transport.on_connecting_hdlr).await;
                }
            }
        });

        Ok(proxy)
    }

    pub fn get_channel(&self, name: &str) -> Option<Arc<TransportChannelProxy>> {
        self.channels.lock().get(name).cloned()
    }

    pub fn has_channel(&self, name: &str) -> bool {
        self.channels.lock().contains_key(name)
    }

    pub fn has_channels(&self) -> bool {
        !self.channels.lock().is_empty()
    }

    /// Tells all current and future channels to start connecting.
    pub async fn connect_channels(&self) {
        if self.connect_requested.swap(true, Ordering::SeqCst) {
            return;
        }

        let impls: Vec<Arc<TransportChannelImpl>> =
            self.impls.lock().values().cloned().collect();
        for chan in &impls {
            chan.connect();
        }
        if !impls.is_empty() && !self.connecting_signalled.swap(true, Ordering::SeqCst) {
            self.notify(&self.on_connecting_hdlr).await;
        }
    }

    /// Destroys one channel by name, quiescing its worker first.
    pub async fn destroy_channel(&self, name: &str) -> Result<()> {
        let proxy = self
            .channels
            .lock()
            .remove(name)
            .ok_or(Error::ErrChannelNotFound)?;
        let chan = self.impls.lock().remove(name);
        proxy.unbind();
        if let Some(chan) = chan {
            chan.destroy().await;
        }
        self.update_transport_state().await;
        Ok(())
    }

    /// Tears down every channel; the synchronous quiesce per channel means
    /// no I/O survives this call.
    pub async fn destroy_all_channels(&self) {
        let impls: Vec<Arc<TransportChannelImpl>> = {
            let mut impls = self.impls.lock();
            let drained: Vec<_> = impls.values().cloned().collect();
            impls.clear();
            drained
        };
        for proxy in self.channels.lock().values() {
            proxy.unbind();
        }
        self.channels.lock().clear();

        for chan in impls {
            chan.destroy().await;
        }
        self.destroyed.store(true, Ordering::SeqCst);
        self.done_tx.lock().take();
    }

    /// Delivers a remote candidate description to the proper channel.
    pub fn on_remote_candidate(&self, channel_name: &str, candidate: Candidate) -> Result<()> {
        match self.impls.lock().get(channel_name) {
            Some(chan) => {
                chan.add_remote_candidate(candidate);
                Ok(())
            }
            None => Err(Error::ErrChannelNotFound),
        }
    }

    /// Reports that a candidate arrived for a channel the peer no longer
    /// has; the session should clean up its side.
    pub async fn on_unknown_channel(&self, channel_name: &str) {
        if self.has_channel(channel_name) {
            self.notify_name(&self.on_channel_gone_hdlr, channel_name.to_owned())
                .await;
        }
    }

    /// The application signals that the signalling path is available; the
    /// buffered candidate messages flush.
    pub async fn on_signalling_ready(&self) {
        self.signalling_ready.store(true, Ordering::SeqCst);
        self.request_signalling_sent.store(false, Ordering::SeqCst);

        let pending: Vec<(String, Candidate)> = {
            let mut queue = self.pending_candidates.lock();
            std::mem::take(&mut *queue)
        };
        for (name, candidate) in pending {
            self.notify_candidate(&self.on_candidate_hdlr, name, candidate)
                .await;
        }
    }

    pub fn on_connecting(&self, f: OnNotifyHdlrFn) {
        self.on_connecting_hdlr.store(Some(Arc::new(Mutex::new(f))));
    }

    pub fn on_readable_state(&self, f: OnStateChangeHdlrFn) {
        self.on_readable_state_hdlr
            .store(Some(Arc::new(Mutex::new(f))));
    }

    pub fn on_writable_state(&self, f: OnStateChangeHdlrFn) {
        self.on_writable_state_hdlr
            .store(Some(Arc::new(Mutex::new(f))));
    }

    pub fn on_request_signalling(&self, f: OnNotifyHdlrFn) {
        self.on_request_signalling_hdlr
            .store(Some(Arc::new(Mutex::new(f))));
    }

    pub fn on_candidate(&self, f: OnCandidateHdlrFn) {
        self.on_candidate_hdlr.store(Some(Arc::new(Mutex::new(f))));
    }

    pub fn on_candidates_allocation_done(&self, f: OnNotifyHdlrFn) {
        self.on_candidates_allocation_done_hdlr
            .store(Some(Arc::new(Mutex::new(f))));
    }

    pub fn on_role_conflict(&self, f: OnNotifyHdlrFn) {
        self.on_role_conflict_hdlr
            .store(Some(Arc::new(Mutex::new(f))));
    }

    pub fn on_route_change(&self, f: OnCandidateHdlrFn) {
        self.on_route_change_hdlr
            .store(Some(Arc::new(Mutex::new(f))));
    }

    pub fn on_channel_gone(&self, f: OnChannelNameHdlrFn) {
        self.on_channel_gone_hdlr
            .store(Some(Arc::new(Mutex::new(f))));
    }

    pub fn on_allocation_failed(&self, f: OnChannelNameHdlrFn) {
        self.on_allocation_failed_hdlr
            .store(Some(Arc::new(Mutex::new(f))));
    }

    async fn run_loop(
        self: Arc<Self>,
        mut events_rx: mpsc::UnboundedReceiver<(String, ChannelEvent)>,
        mut done_rx: mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                ev = events_rx.recv() => {
                    match ev {
                        Some((name, ev)) => self.handle_channel_event(name, ev).await,
                        None => return,
                    }
                }
                _ = done_rx.recv() => return,
            }
        }
    }

    async fn handle_channel_event(&self, name: String, ev: ChannelEvent) {
        match ev {
            ChannelEvent::ReadableState(state) => {
                if let Some(proxy) = self.get_channel(&name) {
                    if let Some(h) = proxy.readable_hdlr.load_full() {
                        let mut f = h.lock().await;
                        f(state).await;
                    }
                }
                self.update_transport_state().await;
            }
            ChannelEvent::WritableState(state) => {
                if let Some(proxy) = self.get_channel(&name) {
                    if let Some(h) = proxy.writable_hdlr.load_full() {
                        let mut f = h.lock().await;
                        f(state).await;
                    }
                }
                self.update_transport_state().await;
            }
            ChannelEvent::CandidateReady(candidate) => {
                if self.signalling_ready.load(Ordering::SeqCst) {
                    self.notify_candidate(&self.on_candidate_hdlr, name, candidate)
                        .await;
                } else {
                    self.pending_candidates.lock().push((name, candidate));
                    if !self.request_signalling_sent.swap(true, Ordering::SeqCst) {
                        self.notify(&self.on_request_signalling_hdlr).await;
                    }
                }
            }
            ChannelEvent::CandidatesAllocationDone => {
                let all_done = {
                    let mut done = self.allocation_done_channels.lock();
                    done.insert(name);
                    let impls = self.impls.lock();
                    impls.keys().all(|k| done.contains(k))
                };
                if all_done && !self.allocation_done_sent.swap(true, Ordering::SeqCst) {
                    self.notify(&self.on_candidates_allocation_done_hdlr).await;
                }
            }
            ChannelEvent::AllocationFailed(e) => {
                log::error!("[{}:{name}]: allocation failed: {e}", self.name);
                self.notify_name(&self.on_allocation_failed_hdlr, name).await;
            }
            ChannelEvent::RouteChange(candidate) => {
                if let Some(proxy) = self.get_channel(&name) {
                    if let Some(h) = proxy.route_change_hdlr.load_full() {
                        let mut f = h.lock().await;
                        f(candidate.clone()).await;
                    }
                }
                self.notify_candidate(&self.on_route_change_hdlr, name, candidate)
                    .await;
            }
            ChannelEvent::ReadPacket(data) => {
                if let Some(proxy) = self.get_channel(&name) {
                    if let Some(h) = proxy.read_packet_hdlr.load_full() {
                        let mut f = h.lock().await;
                        f(data).await;
                    }
                }
            }
            ChannelEvent::RoleConflict { was } => {
                // One atomic flip per conflict cycle: queued duplicates all
                // carry the role held when the conflict fired, so only the
                // first one still matches.
                if was != Role::Unspecified && self.role() == was {
                    let new_role = was.flipped();
                    log::info!(
                        "[{}]: role conflict lost, switching {was} -> {new_role}",
                        self.name
                    );
                    self.set_role(new_role);
                    self.notify(&self.on_role_conflict_hdlr).await;
                }
            }
        }
    }

    // Readable (writable) is the OR of the member channels' bits; handlers
    // fire exactly once per true change.
    async fn update_transport_state(&self) {
        let (any_readable, any_writable) = {
            let impls = self.impls.lock();
            (
                impls.values().any(|c| c.readable()),
                impls.values().any(|c| c.writable()),
            )
        };

        if self.readable.swap(any_readable, Ordering::SeqCst) != any_readable {
            if let Some(h) = self.on_readable_state_hdlr.load_full() {
                let mut f = h.lock().await;
                f(any_readable).await;
            }
        }
        if self.writable.swap(any_writable, Ordering::SeqCst) != any_writable {
            if let Some(h) = self.on_writable_state_hdlr.load_full() {
                let mut f = h.lock().await;
                f(any_writable).await;
            }
        }
    }

    async fn notify(&self, hdlr: &Hdlr<OnNotifyHdlrFn>) {
        if let Some(h) = hdlr.load_full() {
            let mut f = h.lock().await;
            f().await;
        }
    }

    async fn notify_name(&self, hdlr: &Hdlr<OnChannelNameHdlrFn>, name: String) {
        if let Some(h) = hdlr.load_full() {
            let mut f = h.lock().await;
            f(name).await;
        }
    }

    async fn notify_candidate(
        &self,
        hdlr: &Hdlr<OnCandidateHdlrFn>,
        name: String,
        candidate: Candidate,
    ) {
        if let Some(h) = hdlr.load_full() {
            let mut f = h.lock().await;
            f(name, candidate).await;
        }
    }
}
