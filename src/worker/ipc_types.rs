//! IPC protocol between the orchestrator and its task processes.
//!
//! JSON Lines (one JSON object per line) over the child's stdin/stdout.
//! The first request is always `Init`; the child answers `Ready` once its
//! runner is built, then one `Result` per `Task`.

use node_worker_config::WorkerConfig;
use node_worker_types::{TaskEnvelope, TaskResult};
use serde::{Deserialize, Serialize};

/// Request sent from the orchestrator to a task process via stdin.
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ProcessRequest {
    Init {
        config: WorkerConfig,
        /// Lock directory shared by both task processes of one run.
        mutex_dir: String,
    },
    Task {
        envelope: TaskEnvelope,
    },
}

/// Response sent from a task process to the orchestrator via stdout.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum ProcessResponse {
    Ready { pid: u32 },
    Result { result: TaskResult },
}
