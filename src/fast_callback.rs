use crate::errors::BridgeError;
use crate::lock;
use crate::session::SessionId;

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Outcome handed back to the engine thread blocked in a fast callback.
pub type FastCallbackResult = Result<Value, BridgeError>;

/// Rendezvous between an engine thread blocked in a fast callback and
/// whichever thread supplies the outcome.
///
/// Exactly one of three triggers resolves it: the client's answer, the
/// timeout elapsing in [`wait`](Self::wait), or session teardown. The
/// `resolved` flag decides the winner; every later attempt is a no-op.
#[derive(Debug)]
pub struct FastCallbackRendezvous {
    session_id: SessionId,
    id: i64,
    function: String,
    created: Instant,
    resolved: AtomicBool,
    outcome: Mutex<Option<FastCallbackResult>>,
    ready: Condvar,
}

impl FastCallbackRendezvous {
    /// Creates an unresolved rendezvous for request `id` sent to `session_id`.
    pub fn new(session_id: SessionId, id: i64, function: &str) -> Self {
        Self {
            session_id,
            id,
            function: function.to_string(),
            created: Instant::now(),
            resolved: AtomicBool::new(false),
            outcome: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// Outbound message id the answer must carry.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Session the request was sent to.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Client function being called.
    pub fn function(&self) -> &str {
        &self.function
    }

    /// Whether an outcome has already been claimed.
    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    /// Resolves the rendezvous and wakes the waiter.
    ///
    /// Returns `false` if it was already resolved; the new outcome is dropped.
    pub fn resolve(&self, outcome: FastCallbackResult) -> bool {
        if self.resolved.swap(true, Ordering::AcqRel) {
            log::debug!(
                "Late resolution of fast callback {} (id {}) ignored",
                self.function,
                self.id
            );
            return false;
        }
        let mut slot = lock(&self.outcome);
        *slot = Some(outcome);
        self.ready.notify_all();
        true
    }

    /// Blocks until resolved or until `timeout` elapses.
    ///
    /// On timeout the rendezvous resolves itself with
    /// [`BridgeError::FastCallbackTimeout`]. Meant to be called once, by the
    /// thread that issued the request.
    pub fn wait(&self, timeout: Duration) -> FastCallbackResult {
        let guard = lock(&self.outcome);
        let (mut guard, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |outcome| outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);

        if guard.is_none() {
            if !self.resolved.swap(true, Ordering::AcqRel) {
                log::warn!(
                    "Fast callback {} (id {}) on session {} timed out after {:?}",
                    self.function,
                    self.id,
                    self.session_id,
                    timeout
                );
                *guard = Some(Err(BridgeError::FastCallbackTimeout {
                    function: self.function.clone(),
                    millis: u64::try_from(self.created.elapsed().as_millis())
                        .unwrap_or(u64::MAX),
                }));
            } else {
                // A resolver claimed the flag and is about to store its outcome.
                guard = self
                    .ready
                    .wait_while(guard, |outcome| outcome.is_none())
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }

        guard.take().unwrap_or(Err(BridgeError::ConnectionLost))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_resolved_before_wait_returns_immediately() {
        let rv = FastCallbackRendezvous::new(1, 0, "onTrade");
        assert!(rv.resolve(Ok(json!(true))));
        assert_eq!(rv.wait(Duration::from_secs(5)), Ok(json!(true)));
    }

    #[test]
    fn test_answer_from_other_thread_wakes_waiter() {
        let rv = Arc::new(FastCallbackRendezvous::new(1, 4, "onQuote"));
        let resolver = rv.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            resolver.resolve(Ok(json!({"accepted": 1})))
        });

        let start = Instant::now();
        let res = rv.wait(Duration::from_secs(5));
        assert_eq!(res, Ok(json!({"accepted": 1})));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_timeout_resolves_with_timeout_error() {
        let rv = FastCallbackRendezvous::new(2, 9, "onOrderFilled");
        let start = Instant::now();
        let res = rv.wait(Duration::from_millis(100));
        assert!(start.elapsed() >= Duration::from_millis(100));
        match res {
            Err(BridgeError::FastCallbackTimeout { function, millis }) => {
                assert_eq!(function, "onOrderFilled");
                assert!(millis >= 100, "sub-second bound reported as {}ms", millis);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(rv.is_resolved());
    }

    #[test]
    fn test_late_answer_after_timeout_is_noop() {
        let rv = FastCallbackRendezvous::new(2, 9, "onOrderFilled");
        let _ = rv.wait(Duration::from_millis(10));
        assert!(!rv.resolve(Ok(json!(1))));
    }

    #[test]
    fn test_only_first_resolution_wins() {
        let rv = FastCallbackRendezvous::new(3, 1, "f");
        assert!(rv.resolve(Err(BridgeError::ConnectionLost)));
        assert!(!rv.resolve(Ok(json!(1))));
        assert_eq!(rv.wait(Duration::from_secs(1)), Err(BridgeError::ConnectionLost));
    }
}
