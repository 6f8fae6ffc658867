//! The two seams between the bridge and the quoting engine.
//!
//! [`CallbackHandler`] is implemented by the engine and called by the
//! dispatcher; [`EngineCallbacks`] is implemented by the dispatcher and
//! called from the engine's own threads.

use crate::errors::{BridgeError, EngineError};

use serde_json::Value;

/// The engine, as seen by the dispatcher.
pub trait CallbackHandler: Send + Sync {
    /// Trading accounts, answered to `load-accounts`.
    fn load_accounts(&self) -> Result<Value, EngineError>;

    /// Class codes, answered to `load-classes`.
    fn load_classes(&self) -> Result<Vec<String>, EngineError>;

    /// Security codes of `class`, answered to `load-class-securities`.
    fn load_class_securities(&self, class: &str) -> Result<Vec<String>, EngineError>;

    /// Current value of a security parameter, `None` if unknown.
    fn param_value(&self, class: &str, security: &str, param: &str) -> Option<Value>;

    /// Any request that is not one of the bridge's own methods.
    fn process_request(&self, method: &str, _params: &Value) -> Result<Value, EngineError> {
        Err(EngineError::UnknownMethod(method.to_string()))
    }

    /// A client registered `function` as a fast callback under `handle`.
    fn fast_callback_registered(&self, _handle: u64, _function: &str) {}

    /// `handle` is no longer valid (released by the client or its session ended).
    fn release_object(&self, _handle: u64) {}
}

/// The dispatcher, as seen by the engine.
pub trait EngineCallbacks: Send + Sync {
    /// Sends callback `name` to every session subscribed to it without
    /// waiting for answers. Returns how many sessions were reached.
    fn callback_request(&self, name: &str, args: &[Value]) -> usize;

    /// Calls the fast callback registered under `handle` and blocks until
    /// the client answers, the timeout elapses, or the session goes away.
    fn fast_callback_request(&self, handle: u64, args: &[Value]) -> Result<Value, BridgeError>;

    /// Forgets a fast-callback handle.
    fn clear_fast_callback_data(&self, handle: u64);

    /// A parameter changed; push `value` to its subscribers.
    /// Returns the number of frames delivered.
    fn sec_params_update(&self, class: &str, security: &str, param: &str, value: Value) -> usize;

    /// Some parameters of a security changed; re-read the subscribed ones
    /// and push those that differ from the cached value.
    fn sec_params_changed(&self, class: &str, security: &str) -> usize;

    /// Forwards a line of engine script output to all sessions.
    fn send_stdout_line(&self, line: &str);

    /// Forwards a line of engine script error output to all sessions.
    fn send_stderr_line(&self, line: &str);
}
