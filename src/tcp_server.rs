use crate::defs::{TCP_CONNECTION_TICK_PERIOD_MSEC, TCP_WRITE_TIMEOUT_MSEC};
use crate::dispatcher::TransportEvents;
use crate::errors::TcpServerError;
use crate::lock;
use crate::protocol::{Frame, ProtocolHandler, decode_line};
use crate::session::SessionId;

use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Newline-delimited JSON transport over one TCP connection.
///
/// Writes from any thread are serialized by the writer mutex; `close`
/// shuts the socket down through a separate handle so it never waits for
/// a writer. A frame that cannot be written within the write bound closes
/// the connection.
pub struct JsonProtocolHandler {
    peer: SocketAddr,
    writer: Mutex<TcpStream>,
    control: TcpStream,
    closed: AtomicBool,
    write_timeout: Duration,
}

impl JsonProtocolHandler {
    /// Wraps the write side of `stream`.
    pub fn new(stream: &TcpStream) -> Result<Self, TcpServerError> {
        let peer = stream
            .peer_addr()
            .map_err(|e| TcpServerError::ClientIoError(e.to_string()))?;
        let writer = stream
            .try_clone()
            .map_err(|e| TcpServerError::ClientIoError(e.to_string()))?;
        let control = stream
            .try_clone()
            .map_err(|e| TcpServerError::ClientIoError(e.to_string()))?;
        Ok(Self {
            peer,
            writer: Mutex::new(writer),
            control,
            closed: AtomicBool::new(false),
            write_timeout: Duration::from_millis(TCP_WRITE_TIMEOUT_MSEC),
        })
    }
}

/// Writes all of `buf` within `bound`, however the peer drains its socket.
fn write_within(stream: &mut TcpStream, mut buf: &[u8], bound: Duration) -> io::Result<()> {
    let deadline = Instant::now() + bound;
    while !buf.is_empty() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(ErrorKind::TimedOut, "write deadline exceeded"));
        }
        stream.set_write_timeout(Some(remaining))?;
        match stream.write(buf) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    stream.flush()
}

impl ProtocolHandler for JsonProtocolHandler {
    fn send_frame(&self, frame: &Frame) -> Result<(), TcpServerError> {
        if self.is_closed() {
            return Err(TcpServerError::Closed);
        }
        let mut line = frame.encode()?;
        line.push('\n');

        let mut writer = lock(&self.writer);
        if let Err(e) = write_within(&mut writer, line.as_bytes(), self.write_timeout) {
            drop(writer);
            // A partly written frame leaves the stream unusable.
            log::warn!("Write to {} failed, dropping connection: {}", self.peer, e);
            self.close();
            return Err(TcpServerError::ClientIoError(e.to_string()));
        }
        log::trace!("Sent to {}: {}", self.peer, line.trim_end());
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("Closing connection to {}", self.peer);
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            log::debug!("Shutdown of {} failed: {}", self.peer, e);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// TCP server accepting bridge clients.
///
/// Every accepted connection gets its own reader thread, which decodes
/// lines into protocol events and hands them to the [`TransportEvents`]
/// implementation.
pub struct TcpServer {
    /// TCP listener socket
    listener: TcpListener,

    /// Receiver of connection events
    events: Arc<dyn TransportEvents>,

    /// Set by [`stop`](Self::stop) to leave the accept loop
    shutdown: Arc<AtomicBool>,
}

impl TcpServer {
    /// Creates a new TCP server bound to the given address.
    ///
    /// # Arguments
    /// * `addr` - Address to bind, e.g., `"127.0.0.1:62787"`.
    /// * `events` - Receiver of connection events, usually the dispatcher.
    ///
    /// # Returns
    /// * `Ok(TcpServer)` if binding succeeds.
    /// * `Err(TcpServerError::BindError)` if the port is unavailable.
    pub fn new(addr: &str, events: Arc<dyn TransportEvents>) -> Result<Self, TcpServerError> {
        log::info!("Binding TCP server to address: {}", addr);
        let listener =
            TcpListener::bind(addr).map_err(|e| TcpServerError::BindError(e.to_string()))?;
        log::info!("TCP server successfully bound to: {}", addr);

        Ok(Self {
            listener,
            events,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, TcpServerError> {
        self.listener
            .local_addr()
            .map_err(|e| TcpServerError::BindError(e.to_string()))
    }

    /// Makes [`start`](Self::start) return after its next tick.
    /// Established connections are not affected.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Runs the accept loop until [`stop`](Self::stop) is called.
    ///
    /// Accept failures are logged and the loop keeps going.
    pub fn start(&self) -> Result<(), TcpServerError> {
        log::info!("TCP server starting main loop");
        self.listener
            .set_nonblocking(true)
            .map_err(|e| TcpServerError::BindError(e.to_string()))?;
        let tick = Duration::from_millis(TCP_CONNECTION_TICK_PERIOD_MSEC);

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    log::info!("New TCP connection from: {}", addr);
                    let events = self.events.clone();
                    thread::spawn(move || {
                        log::debug!("Spawning handler thread for client: {}", addr);
                        if let Err(e) = handle_connection(stream, addr, events) {
                            log::warn!("Connection handler error for {}: {}", addr, e);
                        }
                        log::debug!("Handler thread finished for client: {}", addr);
                    });
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(tick),
                Err(e) => {
                    log::error!("Failed to accept TCP connection: {}", e);
                    thread::sleep(tick);
                }
            }
        }
        log::info!("TCP server main loop stopped");
        Ok(())
    }
}

/// Handles a single client TCP connection.
///
/// - Registers the connection and its transport with `events`.
/// - Decodes each line and raises the matching protocol event.
/// - Reports the end of the connection exactly once.
fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    events: Arc<dyn TransportEvents>,
) -> Result<(), TcpServerError> {
    stream
        .set_nonblocking(false)
        .map_err(|e| TcpServerError::ClientIoError(e.to_string()))?;
    stream
        .set_read_timeout(Some(Duration::from_millis(TCP_CONNECTION_TICK_PERIOD_MSEC)))
        .map_err(|e| TcpServerError::ClientIoError(e.to_string()))?;
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
    }

    let proto = Arc::new(JsonProtocolHandler::new(&stream)?);
    let session = events.connection_established(addr, proto.clone());

    let result = read_loop(BufReader::new(stream), session, &proto, &*events);
    let reason = match &result {
        Ok(()) => "connection closed".to_string(),
        Err(e) => e.to_string(),
    };
    proto.close();
    events.connection_lost(session, &reason);
    result
}

fn read_loop<R: BufRead>(
    mut reader: R,
    session: SessionId,
    proto: &JsonProtocolHandler,
    events: &dyn TransportEvents,
) -> Result<(), TcpServerError> {
    // Partial lines survive read timeouts.
    let mut buf = Vec::new();

    loop {
        if proto.is_closed() {
            log::debug!("Session {} closed locally, leaving reader", session);
            return Ok(());
        }

        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                log::info!("Client {} closed connection", proto.peer);
                return Ok(());
            }
            Ok(_) => {
                if buf.last() != Some(&b'\n') {
                    // EOF in the middle of a line; the next read reports it.
                    log::debug!("Unterminated line from {}", proto.peer);
                }
                let line = String::from_utf8_lossy(&buf).trim().to_string();
                buf.clear();

                if line.is_empty() {
                    continue;
                }

                log::debug!("Received from {}: '{}'", proto.peer, line);
                events.protocol_event(session, decode_line(&line));
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                continue;
            }
            Err(e) => {
                if proto.is_closed() {
                    return Ok(());
                }
                log::error!("Connection failed for {}: {}", proto.peer, e);
                return Err(TcpServerError::ClientIoError(e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::RequestDispatcher;
    use crate::engine::EngineCallbacks;
    use crate::errors::BridgeError;
    use crate::testing::MockEngine;
    use serde_json::{Value, json};
    use std::io::Read;
    use std::time::Instant;

    struct TestClient {
        reader: BufReader<TcpStream>,
        writer: TcpStream,
    }

    impl TestClient {
        fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let writer = stream.try_clone().unwrap();
            Self {
                reader: BufReader::new(stream),
                writer,
            }
        }

        fn send(&mut self, frame: Value) {
            self.send_raw(&frame.to_string());
        }

        fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).unwrap();
            self.writer.write_all(b"\n").unwrap();
        }

        fn recv(&mut self) -> Value {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    fn start_server() -> (Arc<RequestDispatcher>, SocketAddr) {
        let dispatcher = Arc::new(
            RequestDispatcher::new(Arc::new(MockEngine::default()))
                .with_fast_callback_timeout(Duration::from_secs(2)),
        );
        let server = TcpServer::new("127.0.0.1:0", dispatcher.clone()).unwrap();
        let addr = server.local_addr().unwrap();
        thread::spawn(move || {
            server.start().unwrap();
        });
        (dispatcher, addr)
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn handshake(addr: SocketAddr) -> TestClient {
        let mut client = TestClient::connect(addr);
        assert_eq!(client.recv(), json!({"type": "ver", "version": 1}));
        client.send(json!({"type": "ver", "version": 1}));
        client
    }

    #[test]
    fn test_version_and_request_round_trip() {
        let (_dispatcher, addr) = start_server();
        let mut client = handshake(addr);

        client.send(json!({"type": "req", "id": 1, "method": "load-classes", "params": {}}));
        assert_eq!(
            client.recv(),
            json!({"type": "ans", "id": 1, "result": ["TQBR", "SPBFUT"]})
        );
    }

    #[test]
    fn test_malformed_line_is_answered() {
        let (_dispatcher, addr) = start_server();
        let mut client = handshake(addr);

        client.send_raw("{not json");
        let answer = client.recv();
        assert_eq!(answer["type"], "ans");
        assert_eq!(answer["id"], 0);
        assert_eq!(answer["error"]["code"], 1);

        client.send(json!({"type": "req", "id": 2, "method": "load-accounts"}));
        assert_eq!(client.recv()["id"], 2);
    }

    #[test]
    fn test_push_reaches_socket() {
        let (dispatcher, addr) = start_server();
        let mut client = handshake(addr);

        client.send(json!({
            "type": "req",
            "id": 11,
            "method": "subscribe-param-changes",
            "params": {"class": "TQBR", "security": "SBER", "param": "LAST"}
        }));
        assert_eq!(client.recv()["result"]["subscriptionId"], 11);

        assert_eq!(dispatcher.sec_params_update("TQBR", "SBER", "LAST", json!(250.5)), 1);
        assert_eq!(
            client.recv(),
            json!({"type": "push", "subscriptionId": 11, "value": 250.5})
        );
    }

    #[test]
    fn test_fast_callback_over_socket() {
        let (dispatcher, addr) = start_server();
        let mut client = handshake(addr);
        let handle = register_fast_callback(&mut client, "onQuote");

        let engine_side = dispatcher.clone();
        let call = thread::spawn(move || engine_side.fast_callback_request(handle, &[json!("SBER")]));

        let request = client.recv();
        assert_eq!(request["method"], "fastCallback");
        assert_eq!(request["params"], json!({"function": "onQuote", "args": ["SBER"]}));
        client.send(json!({"type": "ans", "id": request["id"], "result": 17}));

        assert_eq!(call.join().unwrap(), Ok(json!(17)));
    }

    fn register_fast_callback(client: &mut TestClient, function: &str) -> u64 {
        client.send(json!({
            "type": "req",
            "id": 1,
            "method": "register-fast-callback",
            "params": {"function": function}
        }));
        client.recv()["result"]["handle"].as_u64().unwrap()
    }

    fn subscribe_last(client: &mut TestClient, id: i64) {
        client.send(json!({
            "type": "req",
            "id": id,
            "method": "subscribe-param-changes",
            "params": {"class": "TQBR", "security": "SBER", "param": "LAST"}
        }));
        assert_eq!(client.recv()["result"]["subscriptionId"], id);
    }

    /// Larger than any loopback socket buffer, so a peer that never reads
    /// stalls the writer.
    fn oversized_value() -> Value {
        Value::String("x".repeat(32 * 1024 * 1024))
    }

    #[test]
    fn test_fast_callback_to_stalled_client_is_bounded() {
        let (dispatcher, addr) = start_server();
        let mut client = handshake(addr);
        let handle = register_fast_callback(&mut client, "onQuote");

        // The client never reads again.
        let engine_side = dispatcher.clone();
        let start = Instant::now();
        let call = thread::spawn(move || {
            engine_side.fast_callback_request(handle, &[oversized_value()])
        });

        let result = call.join().unwrap();
        let elapsed = start.elapsed();
        assert_eq!(result, Err(BridgeError::ConnectionLost));
        assert!(elapsed < dispatcher.fast_callback_timeout() + Duration::from_secs(1));
        wait_until("teardown", || dispatcher.session_count() == 0);
        drop(client);
    }

    #[test]
    fn test_stalled_consumer_does_not_hold_back_others() {
        let (dispatcher, addr) = start_server();
        let mut stalled = handshake(addr);
        subscribe_last(&mut stalled, 1);
        let mut reader = handshake(addr);
        subscribe_last(&mut reader, 2);

        let engine_side = dispatcher.clone();
        let start = Instant::now();
        let push = thread::spawn(move || {
            engine_side.sec_params_update("TQBR", "SBER", "LAST", oversized_value())
        });

        let frame = reader.recv();
        let elapsed = start.elapsed();
        assert_eq!(frame["subscriptionId"], 2);
        assert!(elapsed < Duration::from_millis(TCP_WRITE_TIMEOUT_MSEC) + Duration::from_secs(2));

        assert_eq!(push.join().unwrap(), 1);
        wait_until("stalled teardown", || dispatcher.session_count() == 1);
        drop(stalled);
    }

    #[test]
    fn test_end_is_confirmed_and_connection_closed() {
        let (dispatcher, addr) = start_server();
        let mut client = handshake(addr);
        wait_until("session", || dispatcher.session_count() == 1);

        client.send(json!({"type": "end"}));
        assert_eq!(client.recv(), json!({"type": "end"}));

        let mut rest = Vec::new();
        assert_eq!(client.reader.read_to_end(&mut rest).unwrap(), 0);
        wait_until("teardown", || dispatcher.session_count() == 0);
    }

    #[test]
    fn test_disconnect_tears_session_down() {
        let (dispatcher, addr) = start_server();
        let mut client = handshake(addr);
        client.send(json!({
            "type": "req",
            "id": 3,
            "method": "subscribe-param-changes",
            "params": {"class": "TQBR", "security": "SBER", "param": "LAST"}
        }));
        client.recv();
        assert_eq!(dispatcher.subscriptions().consumer_count(), 1);

        drop(client);
        wait_until("teardown", || dispatcher.session_count() == 0);
        assert_eq!(dispatcher.subscriptions().consumer_count(), 0);
    }

    #[test]
    fn test_disallowed_peer_gets_unauthorized_and_is_disconnected() {
        let (dispatcher, addr) = start_server();
        dispatcher.set_allowed_ips(&["192.0.2.1".to_string()]);
        let mut client = handshake(addr);

        client.send(json!({"type": "req", "id": 5, "method": "load-classes"}));
        let answer = client.recv();
        assert_eq!(answer["id"], 5);
        assert_eq!(answer["error"]["code"], 3);

        let mut rest = Vec::new();
        assert_eq!(client.reader.read_to_end(&mut rest).unwrap(), 0);
        wait_until("teardown", || dispatcher.session_count() == 0);
    }
}
