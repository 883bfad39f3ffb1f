//! The two polling loops that bridge the connection and the task processes.
//!
//! Both run while the status is `running` and re-check it after every
//! bounded wait, so a cancel is observed within one poll interval.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use node_worker_types::{parse_envelope, TaskEnvelope, TaskResult};
use thiserror::Error;

use super::status::StatusHandle;
use crate::connection::{Connection, ConnectionError};

#[derive(Error, Debug)]
pub enum LoopError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Malformed task frame: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("Failed to encode task result: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("The {0} queue is closed")]
    QueueClosed(&'static str),
}

/// Inbound queues, one per task process.
pub struct TaskQueues<'a> {
    pub inference: &'a Sender<TaskEnvelope>,
    pub download: &'a Sender<TaskEnvelope>,
}

impl TaskQueues<'_> {
    fn route(&self, envelope: TaskEnvelope) -> Result<(), LoopError> {
        let (queue, name) = match envelope {
            TaskEnvelope::Inference(_) => (self.inference, "inference"),
            TaskEnvelope::Download(_) => (self.download, "download"),
        };
        queue.send(envelope).map_err(|_| LoopError::QueueClosed(name))
    }
}

/// Receive task frames and route them to the matching task process queue.
pub fn task_producer(
    status: &StatusHandle,
    connection: &dyn Connection,
    queues: &TaskQueues<'_>,
    poll: Duration,
) -> Result<(), LoopError> {
    while status.is_running() {
        let text = match connection.receive(poll) {
            Ok(text) => text,
            Err(ConnectionError::Timeout) => continue,
            Err(e) => {
                log::error!("[PRODUCER] Receive failed: {e}");
                return Err(e.into());
            }
        };
        if text.trim().is_empty() {
            continue;
        }

        let envelope = parse_envelope(&text).map_err(|e| {
            log::error!("[PRODUCER] Malformed task frame: {e}");
            LoopError::Parse(e)
        })?;
        log::info!(
            "[PRODUCER] Received {} task {}",
            envelope.task_name(),
            envelope.task_id()
        );
        queues.route(envelope)?;
    }

    log::info!("[PRODUCER] Stopped ({})", status.get());
    Ok(())
}

/// Forward task results from the task processes to the connection.
pub fn result_consumer(
    status: &StatusHandle,
    connection: &dyn Connection,
    results: &Receiver<TaskResult>,
    poll: Duration,
) -> Result<(), LoopError> {
    while status.is_running() {
        let result = match results.recv_timeout(poll) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                log::error!("[CONSUMER] Result queue closed");
                return Err(LoopError::QueueClosed("result"));
            }
        };

        let text = serde_json::to_string(&result).map_err(LoopError::Encode)?;
        connection.send(&text).map_err(|e| {
            log::error!(
                "[CONSUMER] Failed to send result for task {}: {e}",
                result.task_id_commitment
            );
            LoopError::from(e)
        })?;
        log::info!(
            "[CONSUMER] Sent {} result for task {} (success={})",
            result.task_name,
            result.task_id_commitment,
            result.is_success()
        );
    }

    log::info!("[CONSUMER] Stopped ({})", status.get());
    Ok(())
}
