use crate::defs::BRIDGE_SERVER_PROTOCOL_VERSION;
use crate::errors::{BridgeError, TcpServerError};
use crate::fast_callback::{FastCallbackRendezvous, FastCallbackResult};
use crate::lock;
use crate::protocol::{Frame, ProtocolHandler};

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Process-unique identifier of a connection session.
pub type SessionId = u64;

/// Lifecycle of a connection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, peer version not received yet.
    Connecting,
    /// Both sides announced their protocol versions.
    Active,
    /// Socket error or stream end; teardown in progress.
    Closing,
    /// Torn down; no longer referenced by the dispatcher or directory.
    Destroyed,
}

/// Full address of a subscribed parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamKey {
    /// Class code, e.g. `TQBR`.
    pub class: String,
    /// Security code, e.g. `SBER`.
    pub security: String,
    /// Parameter name, e.g. `LAST`.
    pub param: String,
}

impl ParamKey {
    /// Builds a key from its three parts.
    pub fn new(class: &str, security: &str, param: &str) -> Self {
        Self {
            class: class.to_string(),
            security: security.to_string(),
            param: param.to_string(),
        }
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.class, self.security, self.param)
    }
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    peer_protocol_version: Option<i64>,
    version_sent: bool,
    object_refs: BTreeSet<u64>,
    callback_subscriptions: HashMap<String, i64>,
}

#[derive(Debug, Default)]
struct PendingSlot {
    closed: bool,
    rendezvous: Option<Arc<FastCallbackRendezvous>>,
}

/// Server-side state of one client connection.
///
/// The parameter subscription map doubles as the reverse index of the
/// [`SubscriptionDirectory`](crate::subscriptions::SubscriptionDirectory):
/// the directory is only ever modified while this map's lock is held, so
/// both sides stay consistent.
pub struct ConnectionSession {
    id: SessionId,
    peer: SocketAddr,
    proto: Arc<dyn ProtocolHandler>,
    out_msg_id: AtomicI64,
    inner: Mutex<SessionInner>,
    param_subscriptions: Mutex<HashMap<ParamKey, i64>>,
    pending: Mutex<PendingSlot>,
}

impl ConnectionSession {
    /// Creates a session in the [`SessionState::Connecting`] state.
    pub fn new(id: SessionId, peer: SocketAddr, proto: Arc<dyn ProtocolHandler>) -> Self {
        Self {
            id,
            peer,
            proto,
            out_msg_id: AtomicI64::new(0),
            inner: Mutex::new(SessionInner {
                state: SessionState::Connecting,
                peer_protocol_version: None,
                version_sent: false,
                object_refs: BTreeSet::new(),
                callback_subscriptions: HashMap::new(),
            }),
            param_subscriptions: Mutex::new(HashMap::new()),
            pending: Mutex::new(PendingSlot::default()),
        }
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Peer socket address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Peer IP as text, as matched against the allow-list.
    pub fn peer_ip(&self) -> String {
        self.peer.ip().to_string()
    }

    /// Allocates the next outbound message id. The first id is 1.
    pub fn next_msg_id(&self) -> i64 {
        self.out_msg_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Writes one frame through the session's transport.
    pub fn send(&self, frame: &Frame) -> Result<(), TcpServerError> {
        self.proto.send_frame(frame)
    }

    /// Closes the underlying transport.
    pub fn close_transport(&self) {
        self.proto.close();
    }

    /// Sends this server's protocol version, once.
    pub fn announce_version(&self) -> Result<(), TcpServerError> {
        let mut inner = lock(&self.inner);
        if inner.version_sent {
            return Ok(());
        }
        self.proto.send_frame(&Frame::Version {
            version: BRIDGE_SERVER_PROTOCOL_VERSION,
        })?;
        inner.version_sent = true;
        Ok(())
    }

    /// Records the peer's announced version. The first value wins.
    ///
    /// Returns `false` if a version had already been recorded.
    pub fn record_peer_version(&self, version: i64) -> bool {
        let mut inner = lock(&self.inner);
        if inner.peer_protocol_version.is_some() {
            return false;
        }
        inner.peer_protocol_version = Some(version);
        if inner.state == SessionState::Connecting {
            inner.state = SessionState::Active;
        }
        true
    }

    /// Peer protocol version, 0 until announced.
    pub fn peer_protocol_version(&self) -> i64 {
        lock(&self.inner).peer_protocol_version.unwrap_or(0)
    }

    /// Whether our version announcement went out.
    pub fn version_sent(&self) -> bool {
        lock(&self.inner).version_sent
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        lock(&self.inner).state
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        lock(&self.inner).state = state;
    }

    /// Grants an object handle to this session.
    pub fn grant_object(&self, handle: u64) {
        lock(&self.inner).object_refs.insert(handle);
    }

    /// Whether the session owns `handle`.
    pub fn owns_object(&self, handle: u64) -> bool {
        lock(&self.inner).object_refs.contains(&handle)
    }

    /// Drops one handle; `false` if it was not owned.
    pub fn revoke_object(&self, handle: u64) -> bool {
        lock(&self.inner).object_refs.remove(&handle)
    }

    pub(crate) fn take_objects(&self) -> Vec<u64> {
        std::mem::take(&mut lock(&self.inner).object_refs)
            .into_iter()
            .collect()
    }

    /// Subscribes to an engine callback name, replacing any previous id.
    pub fn subscribe_callback(&self, name: &str, id: i64) {
        lock(&self.inner)
            .callback_subscriptions
            .insert(name.to_string(), id);
    }

    /// Removes a callback subscription, returning its id.
    pub fn unsubscribe_callback(&self, name: &str) -> Option<i64> {
        lock(&self.inner).callback_subscriptions.remove(name)
    }

    /// Subscription id for an engine callback name.
    pub fn callback_subscription(&self, name: &str) -> Option<i64> {
        lock(&self.inner).callback_subscriptions.get(name).copied()
    }

    pub(crate) fn take_callbacks(&self) -> Vec<String> {
        lock(&self.inner)
            .callback_subscriptions
            .drain()
            .map(|(name, _)| name)
            .collect()
    }

    /// Locks the session's parameter subscription map.
    pub(crate) fn param_subscriptions(&self) -> MutexGuard<'_, HashMap<ParamKey, i64>> {
        lock(&self.param_subscriptions)
    }

    /// Subscription id the session holds for `key`.
    pub fn param_subscription(&self, key: &ParamKey) -> Option<i64> {
        self.param_subscriptions().get(key).copied()
    }

    /// Snapshot of all parameter subscriptions.
    pub fn param_subscription_list(&self) -> Vec<(ParamKey, i64)> {
        let mut list: Vec<_> = self
            .param_subscriptions()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        list.sort();
        list
    }

    /// Installs a new fast-callback rendezvous.
    ///
    /// Fails with [`BridgeError::FastCallbackBusy`] while another one is
    /// outstanding and with [`BridgeError::ConnectionLost`] once teardown
    /// has started.
    pub fn begin_fast_callback(
        &self,
        function: &str,
    ) -> Result<Arc<FastCallbackRendezvous>, BridgeError> {
        let mut slot = lock(&self.pending);
        if slot.closed {
            return Err(BridgeError::ConnectionLost);
        }
        if let Some(current) = &slot.rendezvous {
            if !current.is_resolved() {
                log::warn!(
                    "Session {} busy with fast callback {} (id {}), rejecting {}",
                    self.id,
                    current.function(),
                    current.id(),
                    function
                );
                return Err(BridgeError::FastCallbackBusy(function.to_string()));
            }
        }
        let rv = Arc::new(FastCallbackRendezvous::new(
            self.id,
            self.next_msg_id(),
            function,
        ));
        slot.rendezvous = Some(rv.clone());
        Ok(rv)
    }

    /// Clears the slot if it still holds `rv`.
    pub fn finish_fast_callback(&self, rv: &Arc<FastCallbackRendezvous>) {
        let mut slot = lock(&self.pending);
        if slot
            .rendezvous
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, rv))
        {
            slot.rendezvous = None;
        }
    }

    /// Resolves the pending rendezvous if its id matches.
    ///
    /// Returns `false` when no fast callback with this id is outstanding.
    pub fn resolve_fast_callback(&self, id: i64, outcome: FastCallbackResult) -> bool {
        let rv = {
            let mut slot = lock(&self.pending);
            match &slot.rendezvous {
                Some(current) if current.id() == id => slot.rendezvous.take(),
                _ => None,
            }
        };
        match rv {
            Some(rv) => rv.resolve(outcome),
            None => false,
        }
    }

    /// Whether a fast callback is currently outstanding.
    pub fn has_pending_fast_callback(&self) -> bool {
        lock(&self.pending)
            .rendezvous
            .as_ref()
            .is_some_and(|rv| !rv.is_resolved())
    }

    /// Refuses further fast callbacks and wakes the pending one with
    /// [`BridgeError::ConnectionLost`].
    pub(crate) fn cancel_fast_callbacks(&self) {
        let rv = {
            let mut slot = lock(&self.pending);
            slot.closed = true;
            slot.rendezvous.take()
        };
        if let Some(rv) = rv {
            log::info!(
                "Cancelling fast callback {} (id {}) on session {}",
                rv.function(),
                rv.id(),
                self.id
            );
            rv.resolve(Err(BridgeError::ConnectionLost));
        }
    }
}

impl fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("out_msg_id", &self.out_msg_id)
            .field("inner", &self.inner)
            .field("param_subscriptions", &self.param_subscriptions)
            // exclude proto
            .finish()
    }
}
