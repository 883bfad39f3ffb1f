//! Text-message connection to the coordinating server.
//!
//! The orchestrator only needs a timed receive and a send, both callable
//! from different threads at once. `websocket` is the production transport;
//! `memory` is an in-process pair for loopback and tests.

pub mod memory;
pub mod websocket;

use std::time::Duration;

use thiserror::Error;

pub use memory::MemoryConnection;
pub use websocket::WsConnection;

#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Nothing arrived within the receive timeout. Expected while polling.
    #[error("Receive timed out")]
    Timeout,

    #[error("Connection closed")]
    Closed,

    #[error("Connection failed: {0}")]
    Transport(String),
}

/// One persistent bidirectional text-message connection.
pub trait Connection: Send + Sync {
    /// Wait up to `timeout` for the next text frame.
    fn receive(&self, timeout: Duration) -> Result<String, ConnectionError>;

    fn send(&self, text: &str) -> Result<(), ConnectionError>;
}
