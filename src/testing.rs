//! Test doubles shared by the unit tests.

use crate::engine::CallbackHandler;
use crate::errors::{EngineError, TcpServerError};
use crate::lock;
use crate::protocol::{Frame, ProtocolHandler};
use crate::session::{ConnectionSession, ParamKey};

use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Transport that records every frame instead of writing it.
#[derive(Default)]
pub(crate) struct RecordingProtocol {
    frames: Mutex<Vec<Frame>>,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl RecordingProtocol {
    pub(crate) fn frames(&self) -> Vec<Frame> {
        lock(&self.frames).clone()
    }

    pub(crate) fn take_frames(&self) -> Vec<Frame> {
        std::mem::take(&mut *lock(&self.frames))
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl ProtocolHandler for RecordingProtocol {
    fn send_frame(&self, frame: &Frame) -> Result<(), TcpServerError> {
        if self.is_closed() {
            return Err(TcpServerError::Closed);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(TcpServerError::ClientIoError("broken pipe".into()));
        }
        lock(&self.frames).push(frame.clone());
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub(crate) fn test_session(id: u64) -> (Arc<ConnectionSession>, Arc<RecordingProtocol>) {
    let proto = Arc::new(RecordingProtocol::default());
    let session = ConnectionSession::new(id, "127.0.0.1:40000".parse().unwrap(), proto.clone());
    (Arc::new(session), proto)
}

/// Engine with fixed reference data and settable parameter values.
#[derive(Default)]
pub(crate) struct MockEngine {
    values: Mutex<HashMap<ParamKey, Value>>,
    registered: Mutex<Vec<(u64, String)>>,
    released: Mutex<Vec<u64>>,
}

impl MockEngine {
    pub(crate) fn set_value(&self, class: &str, security: &str, param: &str, value: Value) {
        lock(&self.values).insert(ParamKey::new(class, security, param), value);
    }

    pub(crate) fn registered(&self) -> Vec<(u64, String)> {
        lock(&self.registered).clone()
    }

    pub(crate) fn released(&self) -> Vec<u64> {
        lock(&self.released).clone()
    }
}

impl CallbackHandler for MockEngine {
    fn load_accounts(&self) -> Result<Value, EngineError> {
        Ok(json!([{"account": "L01-00000F00", "firm": "MC0002500000"}]))
    }

    fn load_classes(&self) -> Result<Vec<String>, EngineError> {
        Ok(vec!["TQBR".into(), "SPBFUT".into()])
    }

    fn load_class_securities(&self, class: &str) -> Result<Vec<String>, EngineError> {
        match class {
            "TQBR" => Ok(vec!["SBER".into(), "GAZP".into()]),
            "SPBFUT" => Ok(vec!["SiZ6".into()]),
            _ => Err(EngineError::InvalidArguments(format!("unknown class {}", class))),
        }
    }

    fn param_value(&self, class: &str, security: &str, param: &str) -> Option<Value> {
        lock(&self.values)
            .get(&ParamKey::new(class, security, param))
            .cloned()
    }

    fn process_request(&self, method: &str, params: &Value) -> Result<Value, EngineError> {
        match method {
            "echo" => Ok(params.clone()),
            _ => Err(EngineError::UnknownMethod(method.to_string())),
        }
    }

    fn fast_callback_registered(&self, handle: u64, function: &str) {
        lock(&self.registered).push((handle, function.to_string()));
    }

    fn release_object(&self, handle: u64) {
        lock(&self.released).push(handle);
    }
}
