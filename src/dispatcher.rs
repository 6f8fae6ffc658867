//! Request routing between connected sessions and the engine.
//!
//! [`RequestDispatcher`] implements two narrow traits: [`TransportEvents`],
//! driven by the connection reader threads, and
//! [`EngineCallbacks`](crate::engine::EngineCallbacks), driven by the engine.

use crate::defs::{CALLBACK_METHOD, FAST_CALLBACK_METHOD, FAST_CALLBACK_TIMEOUT_SEC, STDERR_METHOD, STDOUT_METHOD};
use crate::engine::{CallbackHandler, EngineCallbacks};
use crate::errors::{BridgeError, codes};
use crate::lock;
use crate::protocol::{Frame, ProtocolEvent, ProtocolHandler, UNCORRELATED_ID, WireError};
use crate::session::{ConnectionSession, ParamKey, SessionId, SessionState};
use crate::subscriptions::{Consumer, SubscriptionDirectory};

use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Extended method: trading accounts.
pub const LOAD_ACCOUNTS: &str = "load-accounts";
/// Extended method: class codes.
pub const LOAD_CLASSES: &str = "load-classes";
/// Extended method: securities of one class.
pub const LOAD_CLASS_SECURITIES: &str = "load-class-securities";
/// Extended method: subscribe to a parameter.
pub const SUBSCRIBE_PARAM_CHANGES: &str = "subscribe-param-changes";
/// Extended method: unsubscribe from a parameter.
pub const UNSUBSCRIBE_PARAM_CHANGES: &str = "unsubscribe-param-changes";
/// Extended method: receive an engine callback by name.
pub const SUBSCRIBE_CALLBACK: &str = "subscribe-callback";
/// Extended method: stop receiving an engine callback.
pub const UNSUBSCRIBE_CALLBACK: &str = "unsubscribe-callback";
/// Extended method: expose a client function to the engine as a fast callback.
pub const REGISTER_FAST_CALLBACK: &str = "register-fast-callback";
/// Extended method: withdraw a fast callback.
pub const RELEASE_FAST_CALLBACK: &str = "release-fast-callback";

/// Observable dispatcher activity, mainly for diagnostics and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatcherEvent {
    /// A session was accepted.
    SessionOpened(SessionId),
    /// A session was torn down.
    SessionClosed(SessionId),
    /// A fast callback request frame was written.
    FastCallbackRequestSent {
        /// Target session.
        session: SessionId,
        /// Client function.
        function: String,
        /// Outbound message id.
        id: i64,
    },
    /// The answer to a pending fast callback arrived.
    FastCallbackReturnArrived {
        /// Answering session.
        session: SessionId,
        /// Message id of the answered request.
        id: i64,
        /// Decoded outcome.
        result: Result<Value, BridgeError>,
    },
}

/// Callbacks the transport raises for each connection.
pub trait TransportEvents: Send + Sync {
    /// A connection was accepted; returns the id of its new session.
    fn connection_established(
        &self,
        peer: SocketAddr,
        proto: Arc<dyn ProtocolHandler>,
    ) -> SessionId;

    /// A request frame arrived.
    fn request_arrived(&self, session: SessionId, id: i64, method: &str, params: Value);

    /// An answer frame arrived.
    fn answer_arrived(&self, session: SessionId, id: i64, result: Result<Value, WireError>);

    /// The peer announced its protocol version.
    fn version_arrived(&self, session: SessionId, version: i64);

    /// The peer ended the stream gracefully.
    fn stream_ended(&self, session: SessionId);

    /// A line could not be decoded.
    fn malformed_frame(&self, session: SessionId, id: Option<i64>, reason: &str);

    /// Socket error or EOF; the session must be torn down.
    fn connection_lost(&self, session: SessionId, reason: &str);

    /// Routes a decoded event to the matching handler method.
    fn protocol_event(&self, session: SessionId, event: ProtocolEvent) {
        match event {
            ProtocolEvent::Request { id, method, params } => {
                self.request_arrived(session, id, &method, params)
            }
            ProtocolEvent::Answer { id, result } => self.answer_arrived(session, id, result),
            ProtocolEvent::Version(version) => self.version_arrived(session, version),
            ProtocolEvent::StreamEnd => self.stream_ended(session),
            ProtocolEvent::Malformed { id, reason } => self.malformed_frame(session, id, &reason),
        }
    }
}

#[derive(Debug, Clone)]
struct FastCallbackTarget {
    session: SessionId,
    function: String,
}

/// The bridge server object: owns the sessions, the subscription directory,
/// the allow-list and the callback registries.
pub struct RequestDispatcher {
    engine: Arc<dyn CallbackHandler>,
    allowed_ips: RwLock<Vec<String>>,
    sessions: Mutex<HashMap<SessionId, Arc<ConnectionSession>>>,
    subscriptions: SubscriptionDirectory,
    active_callbacks: Mutex<HashMap<String, BTreeSet<SessionId>>>,
    fast_callbacks: Mutex<HashMap<u64, FastCallbackTarget>>,
    sec_classes: RwLock<Vec<String>>,
    next_session_id: AtomicU64,
    next_handle: AtomicU64,
    fast_callback_timeout: Duration,
    observers: Mutex<Vec<Sender<DispatcherEvent>>>,
}

impl RequestDispatcher {
    /// Creates a dispatcher in front of `engine` with an empty allow-list.
    pub fn new(engine: Arc<dyn CallbackHandler>) -> Self {
        Self {
            engine,
            allowed_ips: RwLock::new(Vec::new()),
            sessions: Mutex::new(HashMap::new()),
            subscriptions: SubscriptionDirectory::new(),
            active_callbacks: Mutex::new(HashMap::new()),
            fast_callbacks: Mutex::new(HashMap::new()),
            sec_classes: RwLock::new(Vec::new()),
            next_session_id: AtomicU64::new(1),
            next_handle: AtomicU64::new(1),
            fast_callback_timeout: Duration::from_secs(FAST_CALLBACK_TIMEOUT_SEC),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Overrides the fast callback bound.
    pub fn with_fast_callback_timeout(mut self, timeout: Duration) -> Self {
        self.fast_callback_timeout = timeout;
        self
    }

    /// Current fast callback bound.
    pub fn fast_callback_timeout(&self) -> Duration {
        self.fast_callback_timeout
    }

    /// Replaces the allow-list. An empty list allows every peer.
    pub fn set_allowed_ips(&self, ips: &[String]) {
        let mut allowed = self
            .allowed_ips
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *allowed = ips.iter().map(|ip| ip.trim().to_string()).collect();
        if allowed.is_empty() {
            log::warn!("Allowed IP list is empty, requests from any peer will be served");
        } else {
            log::info!("Allowed IPs: {:?}", *allowed);
        }
    }

    /// Whether requests from `ip` may be processed.
    pub fn ip_allowed(&self, ip: &str) -> bool {
        let allowed = self
            .allowed_ips
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        allowed.is_empty() || allowed.iter().any(|a| a == ip)
    }

    /// Returns a receiver of every future [`DispatcherEvent`].
    pub fn subscribe_events(&self) -> Receiver<DispatcherEvent> {
        let (tx, rx) = channel();
        lock(&self.observers).push(tx);
        rx
    }

    fn emit(&self, event: DispatcherEvent) {
        lock(&self.observers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Looks up a live session.
    pub fn session(&self, id: SessionId) -> Option<Arc<ConnectionSession>> {
        lock(&self.sessions).get(&id).cloned()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    fn live_sessions(&self) -> Vec<Arc<ConnectionSession>> {
        let mut sessions: Vec<_> = lock(&self.sessions).values().cloned().collect();
        sessions.sort_by_key(|s| s.id());
        sessions
    }

    /// The subscription directory.
    pub fn subscriptions(&self) -> &SubscriptionDirectory {
        &self.subscriptions
    }

    /// Class codes cached by the last `load-classes` request.
    pub fn cached_classes(&self) -> Vec<String> {
        self.sec_classes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of sessions subscribed to engine callback `name`.
    pub fn callback_subscriber_count(&self, name: &str) -> usize {
        lock(&self.active_callbacks)
            .get(name)
            .map_or(0, BTreeSet::len)
    }

    /// Writes an error answer. Never fails and never closes the connection.
    pub fn send_error(
        &self,
        session: &ConnectionSession,
        id: i64,
        code: i64,
        message: &str,
        log_error: bool,
    ) {
        if log_error {
            log::warn!(
                "Error {} for request {} from session {} ({}): {}",
                code,
                id,
                session.id(),
                session.peer(),
                message
            );
        }
        if let Err(e) = session.send(&Frame::error(id, code, message)) {
            log::debug!(
                "Failed to send error answer to session {}: {}",
                session.id(),
                e
            );
        }
    }

    fn reply(&self, session: &ConnectionSession, id: i64, result: Result<Value, BridgeError>) {
        match result {
            Ok(value) => {
                if let Err(e) = session.send(&Frame::result(id, value)) {
                    log::warn!(
                        "Failed to send answer {} to session {}: {}",
                        id,
                        session.id(),
                        e
                    );
                }
            }
            Err(err) => {
                let log_error = !matches!(err, BridgeError::SubscriptionNotFound(_));
                self.send_error(session, id, err.code(), &err.to_string(), log_error);
            }
        }
    }

    /// Tears a session down: cancels its pending fast callback, removes it
    /// from the directory and the callback registries, and releases its
    /// object handles. Idempotent.
    pub fn destroy_session(&self, id: SessionId) {
        let Some(session) = lock(&self.sessions).remove(&id) else {
            return;
        };
        session.set_state(SessionState::Closing);
        log::info!("Closing session {} ({})", id, session.peer());

        session.cancel_fast_callbacks();
        let cleared = self.subscriptions.clear_all(&session);

        {
            let mut callbacks = lock(&self.active_callbacks);
            for name in session.take_callbacks() {
                if let Some(subscribers) = callbacks.get_mut(&name) {
                    subscribers.remove(&id);
                    if subscribers.is_empty() {
                        callbacks.remove(&name);
                    }
                }
            }
        }

        let handles = session.take_objects();
        {
            let mut fast_callbacks = lock(&self.fast_callbacks);
            for handle in &handles {
                fast_callbacks.remove(handle);
            }
        }
        for handle in handles {
            self.engine.release_object(handle);
        }

        session.set_state(SessionState::Destroyed);
        log::debug!(
            "Session {} destroyed, {} subscriptions cleared",
            id,
            cleared
        );
        self.emit(DispatcherEvent::SessionClosed(id));
    }

    fn process_request(
        &self,
        session: &Arc<ConnectionSession>,
        id: i64,
        method: &str,
        params: &Value,
    ) -> Result<Value, BridgeError> {
        match method {
            LOAD_ACCOUNTS => Ok(self.engine.load_accounts()?),
            LOAD_CLASSES => self.process_load_classes(),
            LOAD_CLASS_SECURITIES => self.process_load_class_securities(params),
            SUBSCRIBE_PARAM_CHANGES => self.process_subscribe_param_changes(session, id, params),
            UNSUBSCRIBE_PARAM_CHANGES => self.process_unsubscribe_param_changes(session, params),
            SUBSCRIBE_CALLBACK => self.process_subscribe_callback(session, id, params),
            UNSUBSCRIBE_CALLBACK => self.process_unsubscribe_callback(session, params),
            REGISTER_FAST_CALLBACK => self.process_register_fast_callback(session, params),
            RELEASE_FAST_CALLBACK => self.process_release_fast_callback(session, params),
            _ => Ok(self.engine.process_request(method, params)?),
        }
    }

    fn process_load_classes(&self) -> Result<Value, BridgeError> {
        let classes = self.engine.load_classes()?;
        *self
            .sec_classes
            .write()
            .unwrap_or_else(PoisonError::into_inner) = classes.clone();
        Ok(json!(classes))
    }

    fn process_load_class_securities(&self, params: &Value) -> Result<Value, BridgeError> {
        let class = str_param(params, "class")?;
        let cached = self.cached_classes();
        if !cached.is_empty() && !cached.iter().any(|c| c == class) {
            return Err(BridgeError::MalformedRequest(format!(
                "unknown class '{}'",
                class
            )));
        }
        Ok(json!(self.engine.load_class_securities(class)?))
    }

    fn process_subscribe_param_changes(
        &self,
        session: &Arc<ConnectionSession>,
        id: i64,
        params: &Value,
    ) -> Result<Value, BridgeError> {
        let class = str_param(params, "class")?;
        let security = str_param(params, "security")?;
        let param = str_param(params, "param")?;

        let leaf = self.subscriptions.subscribe(session, class, security, param, id);
        let value = leaf
            .value()
            .or_else(|| self.engine.param_value(class, security, param));
        if let Some(v) = &value {
            leaf.seed_value(v.clone());
        }

        // Clients that never announced a version expect the bare id.
        if session.peer_protocol_version() < 1 {
            return Ok(json!(id));
        }
        Ok(json!({
            "subscriptionId": id,
            "value": value.unwrap_or(Value::Null),
        }))
    }

    fn process_unsubscribe_param_changes(
        &self,
        session: &ConnectionSession,
        params: &Value,
    ) -> Result<Value, BridgeError> {
        let class = str_param(params, "class")?;
        let security = str_param(params, "security")?;
        let param = str_param(params, "param")?;

        match self.subscriptions.unsubscribe(session, class, security, param) {
            Some(_) => Ok(json!(true)),
            None => Err(BridgeError::SubscriptionNotFound(
                ParamKey::new(class, security, param).to_string(),
            )),
        }
    }

    fn process_subscribe_callback(
        &self,
        session: &ConnectionSession,
        id: i64,
        params: &Value,
    ) -> Result<Value, BridgeError> {
        let name = str_param(params, "name")?;
        let mut callbacks = lock(&self.active_callbacks);
        session.subscribe_callback(name, id);
        callbacks
            .entry(name.to_string())
            .or_default()
            .insert(session.id());
        log::debug!("Session {} subscribed to callback {}", session.id(), name);
        Ok(json!({ "subscriptionId": id }))
    }

    fn process_unsubscribe_callback(
        &self,
        session: &ConnectionSession,
        params: &Value,
    ) -> Result<Value, BridgeError> {
        let name = str_param(params, "name")?;
        let mut callbacks = lock(&self.active_callbacks);
        if session.unsubscribe_callback(name).is_none() {
            return Err(BridgeError::SubscriptionNotFound(name.to_string()));
        }
        if let Some(subscribers) = callbacks.get_mut(name) {
            subscribers.remove(&session.id());
            if subscribers.is_empty() {
                callbacks.remove(name);
            }
        }
        Ok(json!(true))
    }

    fn process_register_fast_callback(
        &self,
        session: &ConnectionSession,
        params: &Value,
    ) -> Result<Value, BridgeError> {
        let function = str_param(params, "function")?;
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        lock(&self.fast_callbacks).insert(
            handle,
            FastCallbackTarget {
                session: session.id(),
                function: function.to_string(),
            },
        );
        session.grant_object(handle);
        self.engine.fast_callback_registered(handle, function);
        log::info!(
            "Session {} registered fast callback {} as handle {}",
            session.id(),
            function,
            handle
        );
        Ok(json!({ "handle": handle }))
    }

    fn process_release_fast_callback(
        &self,
        session: &ConnectionSession,
        params: &Value,
    ) -> Result<Value, BridgeError> {
        let handle = params
            .get("handle")
            .and_then(Value::as_u64)
            .ok_or_else(|| BridgeError::MalformedRequest("missing field 'handle'".into()))?;
        if !session.revoke_object(handle) {
            return Err(BridgeError::UnknownHandle(handle));
        }
        lock(&self.fast_callbacks).remove(&handle);
        self.engine.release_object(handle);
        Ok(json!(true))
    }

    fn process_answer(&self, session: &ConnectionSession, id: i64, result: &Result<Value, WireError>) {
        match result {
            Ok(value) => log::debug!(
                "Answer {} from session {}: {}",
                id,
                session.id(),
                value
            ),
            Err(err) => log::warn!(
                "Error answer {} from session {}: {} ({})",
                id,
                session.id(),
                err.message,
                err.code
            ),
        }
    }

    /// Calls `function` on `session` and blocks until the answer arrives,
    /// the timeout elapses or the session is torn down.
    ///
    /// At most one fast callback may be outstanding per session; a second
    /// one is rejected with [`BridgeError::FastCallbackBusy`].
    pub fn fast_callback(
        &self,
        session_id: SessionId,
        function: &str,
        args: &[Value],
    ) -> Result<Value, BridgeError> {
        let session = self.session(session_id).ok_or(BridgeError::ConnectionLost)?;
        let rv = session.begin_fast_callback(function)?;
        // Time spent writing the request counts against the bound.
        let started = Instant::now();

        let frame = Frame::request(
            rv.id(),
            FAST_CALLBACK_METHOD,
            json!({ "function": function, "args": args }),
        );
        if let Err(e) = session.send(&frame) {
            log::warn!(
                "Failed to send fast callback {} to session {}: {}",
                function,
                session_id,
                e
            );
            session.finish_fast_callback(&rv);
            return Err(BridgeError::ConnectionLost);
        }
        log::debug!(
            "Fast callback {} sent to session {} with id {}",
            function,
            session_id,
            rv.id()
        );
        self.emit(DispatcherEvent::FastCallbackRequestSent {
            session: session_id,
            function: function.to_string(),
            id: rv.id(),
        });

        let result = rv.wait(self.fast_callback_timeout.saturating_sub(started.elapsed()));
        session.finish_fast_callback(&rv);
        result
    }

    fn push(&self, consumers: Vec<Consumer>, value: &Value) -> usize {
        let mut delivered = 0;
        for consumer in consumers {
            let frame = Frame::Push {
                subscription_id: consumer.id,
                value: value.clone(),
            };
            match consumer.session.send(&frame) {
                Ok(()) => delivered += 1,
                Err(e) => log::warn!(
                    "Failed to push subscription {} to session {}: {}",
                    consumer.id,
                    consumer.session.id(),
                    e
                ),
            }
        }
        delivered
    }

    fn broadcast_line(&self, method: &str, line: &str) {
        for session in self.live_sessions() {
            if !self.ip_allowed(&session.peer_ip()) {
                continue;
            }
            let frame = Frame::request(session.next_msg_id(), method, json!({ "line": line }));
            if let Err(e) = session.send(&frame) {
                log::debug!("Failed to send {} to session {}: {}", method, session.id(), e);
            }
        }
    }
}

impl TransportEvents for RequestDispatcher {
    fn connection_established(
        &self,
        peer: SocketAddr,
        proto: Arc<dyn ProtocolHandler>,
    ) -> SessionId {
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(ConnectionSession::new(id, peer, proto));

        if !self.ip_allowed(&session.peer_ip()) {
            log::warn!(
                "Connection from {} is not on the allow-list, requests will be refused",
                peer
            );
        }
        if let Err(e) = session.announce_version() {
            log::warn!("Failed to announce version to {}: {}", peer, e);
        }
        lock(&self.sessions).insert(id, session);
        log::info!("Session {} established with {}", id, peer);

        self.emit(DispatcherEvent::SessionOpened(id));
        id
    }

    fn request_arrived(&self, session_id: SessionId, id: i64, method: &str, params: Value) {
        let Some(session) = self.session(session_id) else {
            log::debug!("Request {} for unknown session {}", id, session_id);
            return;
        };
        if !self.ip_allowed(&session.peer_ip()) {
            let err = BridgeError::Unauthorized(session.peer_ip());
            self.send_error(&session, id, err.code(), &err.to_string(), true);
            self.destroy_session(session_id);
            session.close_transport();
            return;
        }
        log::debug!(
            "Request {} '{}' from session {}: {}",
            id,
            method,
            session_id,
            params
        );
        let result = self.process_request(&session, id, method, &params);
        self.reply(&session, id, result);
    }

    fn answer_arrived(&self, session_id: SessionId, id: i64, result: Result<Value, WireError>) {
        let Some(session) = self.session(session_id) else {
            log::debug!("Answer {} for unknown session {}", id, session_id);
            return;
        };
        if !self.ip_allowed(&session.peer_ip()) {
            log::warn!("Ignoring answer {} from disallowed peer {}", id, session.peer());
            return;
        }
        let outcome = result.clone().map_err(|e| BridgeError::FastCallbackFailed {
            code: e.code,
            message: e.message,
        });
        if session.resolve_fast_callback(id, outcome.clone()) {
            log::debug!("Fast callback answer {} from session {}", id, session_id);
            self.emit(DispatcherEvent::FastCallbackReturnArrived {
                session: session_id,
                id,
                result: outcome,
            });
            return;
        }
        self.process_answer(&session, id, &result);
    }

    fn version_arrived(&self, session_id: SessionId, version: i64) {
        let Some(session) = self.session(session_id) else {
            return;
        };
        if session.record_peer_version(version) {
            log::info!("Session {} uses protocol version {}", session_id, version);
        } else {
            log::debug!(
                "Session {} announced version {} again, keeping {}",
                session_id,
                version,
                session.peer_protocol_version()
            );
        }
        if let Err(e) = session.announce_version() {
            log::warn!("Failed to announce version to session {}: {}", session_id, e);
        }
    }

    fn stream_ended(&self, session_id: SessionId) {
        let Some(session) = self.session(session_id) else {
            return;
        };
        log::info!("Session {} ended the stream", session_id);
        if let Err(e) = session.send(&Frame::End) {
            log::debug!("Failed to confirm stream end to session {}: {}", session_id, e);
        }
        self.destroy_session(session_id);
        session.close_transport();
    }

    fn malformed_frame(&self, session_id: SessionId, id: Option<i64>, reason: &str) {
        let Some(session) = self.session(session_id) else {
            return;
        };
        let err = BridgeError::MalformedRequest(reason.to_string());
        match id {
            Some(id) => {
                self.send_error(&session, id, codes::MALFORMED_REQUEST, &err.to_string(), true)
            }
            None => self.send_error(
                &session,
                UNCORRELATED_ID,
                codes::MALFORMED_REQUEST,
                &format!("{} (no request id recovered)", err),
                true,
            ),
        }
    }

    fn connection_lost(&self, session_id: SessionId, reason: &str) {
        log::debug!("Session {} connection ended: {}", session_id, reason);
        self.destroy_session(session_id);
    }
}

impl EngineCallbacks for RequestDispatcher {
    fn callback_request(&self, name: &str, args: &[Value]) -> usize {
        let targets: Vec<SessionId> = lock(&self.active_callbacks)
            .get(name)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for session in targets.into_iter().filter_map(|id| self.session(id)) {
            let params = json!({
                "name": name,
                "args": args,
                "subscriptionId": session.callback_subscription(name),
            });
            let frame = Frame::request(session.next_msg_id(), CALLBACK_METHOD, params);
            match session.send(&frame) {
                Ok(()) => delivered += 1,
                Err(e) => log::warn!(
                    "Failed to send callback {} to session {}: {}",
                    name,
                    session.id(),
                    e
                ),
            }
        }
        delivered
    }

    fn fast_callback_request(&self, handle: u64, args: &[Value]) -> Result<Value, BridgeError> {
        let target = lock(&self.fast_callbacks)
            .get(&handle)
            .cloned()
            .ok_or(BridgeError::UnknownHandle(handle))?;
        self.fast_callback(target.session, &target.function, args)
    }

    fn clear_fast_callback_data(&self, handle: u64) {
        let Some(target) = lock(&self.fast_callbacks).remove(&handle) else {
            return;
        };
        if let Some(session) = self.session(target.session) {
            session.revoke_object(handle);
        }
        log::debug!(
            "Fast callback handle {} ({}) cleared",
            handle,
            target.function
        );
    }

    fn sec_params_update(&self, class: &str, security: &str, param: &str, value: Value) -> usize {
        let Some(leaf) = self.subscriptions.find(class, security, param) else {
            return 0;
        };
        let consumers = leaf.update(value.clone());
        self.push(consumers, &value)
    }

    fn sec_params_changed(&self, class: &str, security: &str) -> usize {
        let Some(node) = self.subscriptions.find_security(class, security) else {
            return 0;
        };
        let mut delivered = 0;
        for leaf in node.params() {
            if leaf.is_empty() {
                continue;
            }
            let Some(value) = self.engine.param_value(class, security, leaf.param()) else {
                continue;
            };
            if let Some(consumers) = leaf.update_if_changed(value.clone()) {
                delivered += self.push(consumers, &value);
            }
        }
        delivered
    }

    fn send_stdout_line(&self, line: &str) {
        self.broadcast_line(STDOUT_METHOD, line);
    }

    fn send_stderr_line(&self, line: &str) {
        self.broadcast_line(STDERR_METHOD, line);
    }
}

fn str_param<'a>(params: &'a Value, name: &str) -> Result<&'a str, BridgeError> {
    params
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BridgeError::MalformedRequest(format!("missing field '{}'", name)))
}
