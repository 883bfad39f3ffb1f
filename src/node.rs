//! Top-level node session: connect, register, serve tasks.

use std::time::{Duration, Instant};

use anyhow::Context;
use node_worker_config::WorkerConfig;
use serde::Serialize;
use thiserror::Error;

use crate::connection::{Connection, ConnectionError, WsConnection};
use crate::shutdown::install_shutdown_handler;
use crate::worker::{ProcessSpawner, TaskWorker};

/// Version announced to the server during the handshake.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Handshake reply has no worker_id: {0}")]
    MissingWorkerId(String),

    #[error("Handshake reply is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("No handshake reply within {0:?}")]
    Timeout(Duration),

    #[error("Handshake failed: {0}")]
    Connection(#[from] ConnectionError),
}

#[derive(Serialize)]
struct Hello<'a> {
    version: &'a str,
}

/// Announce `version` and wait up to `timeout` for the assigned worker id.
pub fn handshake(
    connection: &dyn Connection,
    version: &str,
    timeout: Duration,
) -> Result<String, HandshakeError> {
    let hello = serde_json::to_string(&Hello { version }).map_err(HandshakeError::InvalidJson)?;
    connection.send(&hello)?;
    log::info!("[NODE] Sent handshake (version {version})");

    let deadline = Instant::now() + timeout;
    let reply = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(HandshakeError::Timeout(timeout));
        }
        match connection.receive(remaining) {
            Ok(text) if text.trim().is_empty() => continue,
            Ok(text) => break text,
            Err(ConnectionError::Timeout) => continue,
            Err(e) => return Err(e.into()),
        }
    };

    let value: serde_json::Value =
        serde_json::from_str(&reply).map_err(HandshakeError::InvalidJson)?;
    match value.get("worker_id") {
        Some(serde_json::Value::String(id)) => Ok(id.clone()),
        Some(serde_json::Value::Null) | None => Err(HandshakeError::MissingWorkerId(reply)),
        Some(other) => Ok(other.to_string()),
    }
}

/// Connect to `config.node_url`, register, and serve tasks until a
/// termination signal arrives or the session fails. Does not reconnect.
pub fn run_node(config: &WorkerConfig) -> anyhow::Result<()> {
    log::info!("[NODE] Connecting to {}", config.node_url);
    let connection = WsConnection::connect(&config.node_url)
        .with_context(|| format!("Failed to connect to {}", config.node_url))?;

    let timeout = Duration::from_secs(config.runtime.handshake_timeout_secs);
    let worker_id = handshake(&connection, VERSION, timeout)?;
    log::info!("[NODE] Registered as worker {worker_id}");

    let worker = TaskWorker::new(config.clone(), ProcessSpawner::current_exe()?);
    install_shutdown_handler(worker.cancel_handle())
        .context("Failed to install signal handlers")?;

    let result = worker.run(&connection);
    connection.close();
    result?;

    log::info!("[NODE] Session finished");
    Ok(())
}
