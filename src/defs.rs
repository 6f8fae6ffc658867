/// Protocol version this server announces to every peer on connect.
///
/// Peers announce their own version back; the first value received is
/// recorded on the session and may be used by handlers to keep
/// backward compatibility with older clients.
pub const BRIDGE_SERVER_PROTOCOL_VERSION: i64 = 1;

/// Upper bound (in seconds) an engine thread may stay blocked inside a
/// fast callback waiting for the client's answer.
pub const FAST_CALLBACK_TIMEOUT_SEC: u64 = 5;

/// Polling interval (in milliseconds) used by connection reader threads.
///
/// Each reader wakes up at least this often to notice that its session
/// was closed from another thread (e.g. after an authorization failure).
pub const TCP_CONNECTION_TICK_PERIOD_MSEC: u64 = 200;

/// Upper bound (in milliseconds) for writing one frame to a client.
///
/// A client that stops reading is disconnected once a write exceeds this,
/// so pushes and fast callbacks never wait on it for longer.
pub const TCP_WRITE_TIMEOUT_MSEC: u64 = 1000;

/// Price volatility coefficient used by the simulated engine.
///
/// A small value produces smoother last-price movements.
pub const VOLATILITY: f64 = 0.000082;

/// Default tick period of the simulated engine in milliseconds.
///
/// Every tick the engine moves all last prices and pushes the new
/// values to subscribed sessions.
pub const ENGINE_TICK_PERIOD_MSEC: u64 = 500;

/// Method name used for engine-originated ordinary callbacks.
pub const CALLBACK_METHOD: &str = "callback";

/// Method name used for engine-originated fast callbacks.
pub const FAST_CALLBACK_METHOD: &str = "fastCallback";

/// Method names used to forward engine script output to clients.
pub const STDOUT_METHOD: &str = "stdout";
/// See [`STDOUT_METHOD`].
pub const STDERR_METHOD: &str = "stderr";
