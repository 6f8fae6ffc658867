use rand_distr::NormalError;
use thiserror::Error;

/// Numeric error codes carried in `{"error": {"code": ..}}` answers.
pub mod codes {
    /// Unparseable frame or missing/invalid request fields.
    pub const MALFORMED_REQUEST: i64 = 1;
    /// Method not recognized by the bridge or the engine.
    pub const UNKNOWN_METHOD: i64 = 2;
    /// Peer address is not on the allow-list.
    pub const UNAUTHORIZED: i64 = 3;
    /// Unsubscribe for something the session never subscribed to.
    pub const SUBSCRIPTION_NOT_FOUND: i64 = 4;
    /// Fast callback answer did not arrive in time.
    pub const FAST_CALLBACK_TIMEOUT: i64 = 5;
    /// Another fast callback is already pending on the session.
    pub const FAST_CALLBACK_BUSY: i64 = 6;
    /// The connection went away.
    pub const CONNECTION_LOST: i64 = 7;
    /// The engine failed to serve the request.
    pub const ENGINE_FAILURE: i64 = 8;
    /// The client answered a fast callback with an error.
    pub const FAST_CALLBACK_FAILED: i64 = 9;
    /// Object handle is unknown or not owned by the session.
    pub const UNKNOWN_HANDLE: i64 = 10;
}

/// Errors produced by the bridge core.
///
/// Every variant maps to a wire error code (see [`BridgeError::code`]), so
/// any failure can be answered to the originating peer or handed back to
/// the engine as a plain result value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// Frame could not be parsed or a required field is missing.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// No handler for the requested method.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// Peer IP is not on the allow-list.
    #[error("peer {0} is not allowed")]
    Unauthorized(String),

    /// Unsubscribe targeted a subscription the session does not hold.
    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// No answer within the fast callback bound.
    #[error("fast callback {function} timed out after {millis}ms")]
    FastCallbackTimeout {
        /// Function the engine tried to call.
        function: String,
        /// Time since the call was issued, in milliseconds.
        millis: u64,
    },

    /// A fast callback is already outstanding on the target session.
    #[error("fast callback {0} rejected: session is busy")]
    FastCallbackBusy(String),

    /// The client answered the fast callback with an error.
    #[error("fast callback failed with code {code}: {message}")]
    FastCallbackFailed {
        /// Code sent by the client.
        code: i64,
        /// Message sent by the client.
        message: String,
    },

    /// Socket error or peer disconnect.
    #[error("connection lost")]
    ConnectionLost,

    /// Object handle unknown or owned by another session.
    #[error("unknown object handle {0}")]
    UnknownHandle(u64),

    /// The engine failed to serve a request.
    #[error("engine error: {0}")]
    Engine(String),
}

impl BridgeError {
    /// Wire code for this error.
    pub fn code(&self) -> i64 {
        match self {
            BridgeError::MalformedRequest(_) => codes::MALFORMED_REQUEST,
            BridgeError::UnknownMethod(_) => codes::UNKNOWN_METHOD,
            BridgeError::Unauthorized(_) => codes::UNAUTHORIZED,
            BridgeError::SubscriptionNotFound(_) => codes::SUBSCRIPTION_NOT_FOUND,
            BridgeError::FastCallbackTimeout { .. } => codes::FAST_CALLBACK_TIMEOUT,
            BridgeError::FastCallbackBusy(_) => codes::FAST_CALLBACK_BUSY,
            BridgeError::FastCallbackFailed { .. } => codes::FAST_CALLBACK_FAILED,
            BridgeError::ConnectionLost => codes::CONNECTION_LOST,
            BridgeError::UnknownHandle(_) => codes::UNKNOWN_HANDLE,
            BridgeError::Engine(_) => codes::ENGINE_FAILURE,
        }
    }
}

/// Errors returned by a [`CallbackHandler`](crate::engine::CallbackHandler).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The engine has no function with this name.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// Arguments were rejected by the engine.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Any other engine-side failure.
    #[error("{0}")]
    Failed(String),
}

impl From<EngineError> for BridgeError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::UnknownMethod(m) => BridgeError::UnknownMethod(m),
            EngineError::InvalidArguments(m) => BridgeError::MalformedRequest(m),
            EngineError::Failed(m) => BridgeError::Engine(m),
        }
    }
}

/// Errors produced by the TCP transport.
#[derive(Error, Debug)]
pub enum TcpServerError {
    /// The TCP listener failed to bind to the specified address/port.
    #[error("Failed to bind TCP listener: {0}")]
    BindError(String),

    /// Error while accepting an incoming TCP client connection.
    #[error("Failed to accept TCP connection: {0}")]
    AcceptError(String),

    /// I/O error during communication with a specific client.
    #[error("Client IO error: {0}")]
    ClientIoError(String),

    /// A frame could not be encoded.
    #[error("Failed to encode frame: {0}")]
    EncodeError(String),

    /// The connection was already closed locally.
    #[error("Connection closed")]
    Closed,
}

/// Errors produced by the simulated engine.
#[derive(Error, Debug)]
pub enum SimulationError {
    /// Configuration file is malformed or missing.
    #[error("Invalid engine config: {0}")]
    InvalidConfig(String),

    /// Supplied volatility parameter is outside `(0.0, 1.0]`.
    #[error("Invalid volatility: {0}")]
    InvalidVolatility(f64),

    /// Error constructing the log-normal distribution for price moves.
    #[error("Distribution error: {0}")]
    DistributionError(#[from] NormalError),

    /// Failure retrieving the current system time.
    #[error("System time error: {0}")]
    TimeError(#[from] std::time::SystemTimeError),

    /// Background thread could not be started or joined.
    #[error("Engine thread error: {0}")]
    ThreadError(String),
}

/// High-level errors returned by the server and client binaries.
#[derive(Error, Debug)]
pub enum CliError {
    /// General wrapper around any textual failure.
    #[error("Cli failed with error: {0}")]
    GeneralError(String),
}

impl From<SimulationError> for CliError {
    fn from(err: SimulationError) -> Self {
        CliError::GeneralError(err.to_string())
    }
}

impl From<TcpServerError> for CliError {
    fn from(err: TcpServerError) -> Self {
        CliError::GeneralError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_errors_map_to_bridge_codes() {
        let unknown: BridgeError = EngineError::UnknownMethod("foo".into()).into();
        assert_eq!(unknown.code(), codes::UNKNOWN_METHOD);

        let invalid: BridgeError = EngineError::InvalidArguments("bad".into()).into();
        assert_eq!(invalid.code(), codes::MALFORMED_REQUEST);

        let failed: BridgeError = EngineError::Failed("down".into()).into();
        assert_eq!(failed.code(), codes::ENGINE_FAILURE);
    }

    #[test]
    fn test_timeout_message_names_function() {
        let err = BridgeError::FastCallbackTimeout {
            function: "onOrderFilled".into(),
            millis: 300,
        };
        assert_eq!(err.code(), codes::FAST_CALLBACK_TIMEOUT);
        assert_eq!(
            err.to_string(),
            "fast callback onOrderFilled timed out after 300ms"
        );
    }
}
