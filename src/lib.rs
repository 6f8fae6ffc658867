//! # Quote Bridge
//!
//! This crate exposes a live quoting engine to remote clients over a
//! **newline-delimited JSON protocol on TCP**. Clients load reference data,
//! subscribe to security parameters, receive pushed updates, and can act
//! as synchronous callees of the engine through fast callbacks.
//!
//! ## Features
//!
//! - Per-connection sessions with protocol version negotiation.
//! - Three-level subscription directory (class → security → parameter)
//!   with fine-grained locking.
//! - Extended request set handled by the bridge itself, everything else
//!   forwarded to the engine.
//! - Fast callbacks: an engine thread blocks until the client answers,
//!   bounded by a timeout.
//! - Peer IP allow-list.
//! - A simulated engine with random-walk prices for local runs.
//!
//! ## Architecture Overview
//!
//! - [`protocol`](crate::protocol): Wire frames, line decoding, transport trait.
//! - [`session`](crate::session): Per-connection session state.
//! - [`subscriptions`](crate::subscriptions): The subscription directory.
//! - [`fast_callback`](crate::fast_callback): One-shot rendezvous for fast callbacks.
//! - [`engine`](crate::engine): Traits between the bridge and the engine.
//! - [`dispatcher`](crate::dispatcher): Request routing and engine callbacks.
//! - [`tcp_server`](crate::tcp_server): TCP listener and per-connection readers.
//! - [`simulated_engine`](crate::simulated_engine): Random-walk engine.
//! - [`defs`](crate::defs): Shared constants and timing parameters.
//! - [`errors`](crate::errors): Error types used across modules.
//!
//! ## Wire Protocol
//!
//! Each frame is a JSON object on its own line, tagged by `type`:
//!
//! - `req`: request with `id`, `method`, `params`, in either direction.
//! - `ans`: answer carrying `result` or `error`.
//! - `ver`: protocol version announcement.
//! - `push`: parameter update with `subscriptionId` and `value`.
//! - `end`: graceful end of stream.
//!
//! ## Example: Running the Server
//!
//! ```no_run
//! use std::sync::Arc;
//! use quote_bridge::dispatcher::RequestDispatcher;
//! use quote_bridge::simulated_engine::SimulatedEngine;
//! use quote_bridge::tcp_server::TcpServer;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Arc::new(SimulatedEngine::from_config("securities.txt")?);
//!     let dispatcher = Arc::new(RequestDispatcher::new(engine.clone()));
//!
//!     // Push price updates from a background thread
//!     engine.start_background(dispatcher.clone())?;
//!
//!     let tcp = TcpServer::new("127.0.0.1:62787", dispatcher)?;
//!     tcp.start()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![deny(unreachable_pub)]

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod defs;
pub mod dispatcher;
pub mod engine;
pub mod errors;
pub mod fast_callback;
pub mod protocol;
pub mod session;
pub mod simulated_engine;
pub mod subscriptions;
pub mod tcp_server;

#[cfg(test)]
mod testing;

/// Locks `mutex`, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
