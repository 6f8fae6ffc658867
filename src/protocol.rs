//! Wire frames and the transport seam.
//!
//! Every frame is one JSON object on its own line, tagged by `type`:
//!
//! ```text
//! {"type":"req","id":7,"method":"load-classes","params":{}}
//! {"type":"ans","id":7,"result":["TQBR"]}
//! {"type":"ans","id":7,"error":{"code":2,"message":"unknown method: x"}}
//! {"type":"ver","version":1}
//! {"type":"push","subscriptionId":3,"value":250.5}
//! {"type":"end"}
//! ```

use crate::errors::{BridgeError, TcpServerError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error body of an answer frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    /// Numeric error code, see [`codes`](crate::errors::codes).
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

impl From<&BridgeError> for WireError {
    fn from(err: &BridgeError) -> Self {
        WireError {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Request, in either direction.
    #[serde(rename = "req")]
    Request {
        /// Message id chosen by the sender.
        id: i64,
        /// Method name.
        method: String,
        /// Parameter object.
        #[serde(default)]
        params: Value,
    },

    /// Answer to a prior request with the same id.
    #[serde(rename = "ans")]
    Answer {
        /// Id of the request being answered.
        id: i64,
        /// Result value, absent on error.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Error body, absent on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },

    /// Protocol version announcement, once per direction.
    #[serde(rename = "ver")]
    Version {
        /// Announced version.
        version: i64,
    },

    /// Parameter update pushed to a subscriber.
    #[serde(rename = "push")]
    Push {
        /// Id the session used when subscribing.
        #[serde(rename = "subscriptionId")]
        subscription_id: i64,
        /// New parameter value.
        value: Value,
    },

    /// Graceful end of stream.
    #[serde(rename = "end")]
    End,
}

impl Frame {
    /// Builds a request frame.
    pub fn request(id: i64, method: &str, params: Value) -> Self {
        Frame::Request {
            id,
            method: method.to_string(),
            params,
        }
    }

    /// Builds a successful answer frame.
    pub fn result(id: i64, result: Value) -> Self {
        Frame::Answer {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Builds an error answer frame.
    pub fn error(id: i64, code: i64, message: &str) -> Self {
        Frame::Answer {
            id,
            result: None,
            error: Some(WireError {
                code,
                message: message.to_string(),
            }),
        }
    }

    /// Serializes the frame into a single JSON line (without the newline).
    pub fn encode(&self) -> Result<String, TcpServerError> {
        serde_json::to_string(self).map_err(|e| TcpServerError::EncodeError(e.to_string()))
    }
}

/// Id carried by an error answer to a frame whose own id could not be
/// recovered. Such answers also say so in their message, since a client
/// may use 0 as an ordinary request id.
pub const UNCORRELATED_ID: i64 = 0;

/// Structured event raised by the transport for each inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// A request arrived.
    Request {
        /// Sender-chosen message id.
        id: i64,
        /// Method name.
        method: String,
        /// Parameter object.
        params: Value,
    },
    /// An answer to one of our requests arrived.
    Answer {
        /// Id of our request.
        id: i64,
        /// Result or error sent by the peer.
        result: Result<Value, WireError>,
    },
    /// The peer announced its protocol version.
    Version(i64),
    /// The peer ended the stream.
    StreamEnd,
    /// The line could not be decoded into a frame.
    Malformed {
        /// Message id, when one could still be recovered.
        id: Option<i64>,
        /// What went wrong.
        reason: String,
    },
}

/// Decodes one inbound line into a [`ProtocolEvent`].
///
/// Never fails: undecodable input becomes [`ProtocolEvent::Malformed`] so
/// it can be answered with an error instead of dropping the connection.
pub fn decode_line(line: &str) -> ProtocolEvent {
    let raw: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            return ProtocolEvent::Malformed {
                id: None,
                reason: format!("invalid JSON: {}", e),
            };
        }
    };
    let id = raw.get("id").and_then(Value::as_i64);

    match serde_json::from_value::<Frame>(raw) {
        Ok(Frame::Request { id, method, params }) => ProtocolEvent::Request { id, method, params },
        Ok(Frame::Answer { id, result, error }) => ProtocolEvent::Answer {
            id,
            result: match error {
                Some(err) => Err(err),
                None => Ok(result.unwrap_or(Value::Null)),
            },
        },
        Ok(Frame::Version { version }) => ProtocolEvent::Version(version),
        Ok(Frame::End) => ProtocolEvent::StreamEnd,
        Ok(Frame::Push { .. }) => ProtocolEvent::Malformed {
            id,
            reason: "push frames are server-to-client only".to_string(),
        },
        Err(e) => ProtocolEvent::Malformed {
            id,
            reason: e.to_string(),
        },
    }
}

/// Per-connection framed transport.
///
/// The dispatcher only writes through this trait; reading is done by the
/// transport itself, which reports inbound frames as [`ProtocolEvent`]s.
pub trait ProtocolHandler: Send + Sync {
    /// Writes one frame to the peer.
    fn send_frame(&self, frame: &Frame) -> Result<(), TcpServerError>;

    /// Closes the connection. Further writes fail with [`TcpServerError::Closed`].
    fn close(&self);

    /// Whether [`close`](Self::close) was called or the socket failed.
    fn is_closed(&self) -> bool;
}
