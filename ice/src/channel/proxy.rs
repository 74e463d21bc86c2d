use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio::sync::Mutex;
use util::sync::Mutex as SyncMutex;

use super::TransportChannelImpl;
use crate::candidate::Candidate;
use crate::error::*;

pub type OnReadPacketHdlrFn = Box<
    dyn (FnMut(Vec<u8>) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync,
>;
pub type OnStateHdlrFn =
    Box<dyn (FnMut(bool) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync>;
pub type OnRouteChangeHdlrFn = Box<
    dyn (FnMut(Candidate) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync,
>;

// Operations that arrive before an implementation is bound are buffered
// here and replayed on bind.
#[derive(Default)]
struct PendingOps {
    srtp_ciphers: Option<Vec<String>>,
    options: Vec<(String, i64)>,
}

enum ChannelState {
    Unbound(PendingOps),
    Bound(Arc<TransportChannelImpl>),
}

/// The channel handle the application talks to. It exists from the moment a
/// channel is asked for; the ICE implementation underneath is attached only
/// once transport negotiation picks one, and until then configuration is
/// buffered and data operations fail gracefully.
pub struct TransportChannelProxy {
    name: String,
    component: u16,
    state: SyncMutex<ChannelState>,

    pub(crate) read_packet_hdlr: ArcSwapOption<Mutex<OnReadPacketHdlrFn>>,
    pub(crate) readable_hdlr: ArcSwapOption<Mutex<OnStateHdlrFn>>,
    pub(crate) writable_hdlr: ArcSwapOption<Mutex<OnStateHdlrFn>>,
    pub(crate) route_change_hdlr: ArcSwapOption<Mutex<OnRouteChangeHdlrFn>>,
}

impl fmt::Debug for TransportChannelProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportChannelProxy")
            .field("name", &self.name)
            .field("component", &self.component)
            .finish()
    }
}

impl TransportChannelProxy {
    pub fn new(name: String, component: u16) -> Arc<Self> {
        Arc::new(TransportChannelProxy {
            name,
            component,
            state: SyncMutex::new(ChannelState::Unbound(PendingOps::default())),
            read_packet_hdlr: ArcSwapOption::empty(),
            readable_hdlr: ArcSwapOption::empty(),
            writable_hdlr: ArcSwapOption::empty(),
            route_change_hdlr: ArcSwapOption::empty(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn component(&self) -> u16 {
        self.component
    }

    /// Binds the real channel and replays buffered configuration.
    pub(crate) fn set_implementation(&self, chan: Arc<TransportChannelImpl>) {
        let mut state = self.state.lock();
        if let ChannelState::Unbound(pending) = &mut *state {
            if let Some(ciphers) = pending.srtp_ciphers.take() {
                chan.set_srtp_ciphers(ciphers);
            }
            for (name, value) in pending.options.drain(..) {
                chan.set_option(name, value);
            }
        }
        *state = ChannelState::Bound(chan);
    }

    pub(crate) fn implementation(&self) -> Option<Arc<TransportChannelImpl>> {
        match &*self.state.lock() {
            ChannelState::Bound(chan) => Some(Arc::clone(chan)),
            ChannelState::Unbound(_) => None,
        }
    }

    pub(crate) fn unbind(&self) {
        *self.state.lock() = ChannelState::Unbound(PendingOps::default());
    }

    /// Sends media bytes. Fails with would-block semantics while unbound or
    /// while no writable connection is selected.
    pub async fn send_packet(&self, data: &[u8]) -> Result<usize> {
        let chan = match self.implementation() {
            Some(chan) => chan,
            None => return Err(Error::ErrSendPacket),
        };
        chan.send_packet(data).await
    }

    /// Configures SRTP ciphers; buffered when no implementation is bound.
    pub fn set_srtp_ciphers(&self, ciphers: Vec<String>) {
        let mut state = self.state.lock();
        match &mut *state {
            ChannelState::Bound(chan) => chan.set_srtp_ciphers(ciphers),
            ChannelState::Unbound(pending) => pending.srtp_ciphers = Some(ciphers),
        }
    }

    /// Sets a transport option; buffered when no implementation is bound.
    pub fn set_option(&self, name: String, value: i64) {
        let mut state = self.state.lock();
        match &mut *state {
            ChannelState::Bound(chan) => chan.set_option(name, value),
            ChannelState::Unbound(pending) => pending.options.push((name, value)),
        }
    }

    pub fn readable(&self) -> bool {
        self.implementation().map(|c| c.readable()).unwrap_or(false)
    }

    pub fn writable(&self) -> bool {
        self.implementation().map(|c| c.writable()).unwrap_or(false)
    }

    pub fn get_error(&self) -> i32 {
        self.implementation().map(|c| c.get_error()).unwrap_or(0)
    }

    pub fn on_read_packet(&self, f: OnReadPacketHdlrFn) {
        self.read_packet_hdlr.store(Some(Arc::new(Mutex::new(f))));
    }

    pub fn on_readable_state(&self, f: OnStateHdlrFn) {
        self.readable_hdlr.store(Some(Arc::new(Mutex::new(f))));
    }

    pub fn on_writable_state(&self, f: OnStateHdlrFn) {
        self.writable_hdlr.store(Some(Arc::new(Mutex::new(f))));
    }

    pub fn on_route_change(&self, f: OnRouteChangeHdlrFn) {
        self.route_change_hdlr.store(Some(Arc::new(Mutex::new(f))));
    }
}
