//! Wire types exchanged with the coordinating server.
//!
//! Inbound frames are task envelopes discriminated by `task_name`;
//! outbound frames are task results tagged with the originating task's
//! commitment id so the server can correlate them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kind of workload a task runs. Encoded as an integer on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(try_from = "u8", into = "u8")]
pub enum TaskType {
    StableDiffusion,
    Llm,
    StableDiffusionFinetuneLora,
}

impl TryFrom<u8> for TaskType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::StableDiffusion),
            1 => Ok(Self::Llm),
            2 => Ok(Self::StableDiffusionFinetuneLora),
            other => Err(format!("unknown task type {other}")),
        }
    }
}

impl From<TaskType> for u8 {
    fn from(value: TaskType) -> Self {
        match value {
            TaskType::StableDiffusion => 0,
            TaskType::Llm => 1,
            TaskType::StableDiffusionFinetuneLora => 2,
        }
    }
}

/// Which slot of a pipeline a downloaded model fills.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Base,
    Vae,
    Controlnet,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub id: String,
    #[serde(default)]
    pub variant: Option<String>,
}

/// Run a model against backend-specific arguments.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InferenceTask {
    pub task_type: TaskType,
    #[serde(alias = "id")]
    pub task_id_commitment: String,
    pub model_id: String,
    /// Backend arguments, kept as raw JSON text.
    pub task_args: String,
    pub output_dir: String,
}

/// Fetch (or replace) model weights in the local model store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub task_type: TaskType,
    #[serde(alias = "id")]
    pub task_id_commitment: String,
    pub model_type: ModelType,
    pub model: ModelSpec,
}

/// Discriminant of a task envelope. Also names the task process kinds.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskName {
    Inference,
    Download,
}

impl TaskName {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskName::Inference => "inference",
            TaskName::Download => "download",
        }
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inference" => Ok(TaskName::Inference),
            "download" => Ok(TaskName::Download),
            other => Err(format!("unknown task name '{other}'")),
        }
    }
}

/// A unit of work received from the coordinating server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "task_name", rename_all = "lowercase")]
pub enum TaskEnvelope {
    Inference(InferenceTask),
    Download(DownloadTask),
}

impl TaskEnvelope {
    pub fn task_name(&self) -> TaskName {
        match self {
            TaskEnvelope::Inference(_) => TaskName::Inference,
            TaskEnvelope::Download(_) => TaskName::Download,
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            TaskEnvelope::Inference(task) => &task.task_id_commitment,
            TaskEnvelope::Download(task) => &task.task_id_commitment,
        }
    }

    /// The model the task reads or writes. Used as the model mutex key.
    pub fn model_id(&self) -> &str {
        match self {
            TaskEnvelope::Inference(task) => &task.model_id,
            TaskEnvelope::Download(task) => &task.model.id,
        }
    }
}

// Servers send either the bare envelope or one wrapped under `task`.
#[derive(Deserialize)]
#[serde(untagged)]
enum Frame {
    Wrapped { task: TaskEnvelope },
    Bare(TaskEnvelope),
}

/// Parse one inbound text frame into a task envelope.
pub fn parse_envelope(text: &str) -> Result<TaskEnvelope, serde_json::Error> {
    let frame: Frame = serde_json::from_str(text)?;
    Ok(match frame {
        Frame::Wrapped { task } => task,
        Frame::Bare(task) => task,
    })
}

/// Outcome of executing one task.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TaskOutcome {
    Success,
    Error { traceback: String },
}

/// Result frame sent back to the server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub task_name: TaskName,
    pub task_id_commitment: String,
    pub result: TaskOutcome,
}

impl TaskResult {
    pub fn success(envelope: &TaskEnvelope) -> Self {
        Self {
            task_name: envelope.task_name(),
            task_id_commitment: envelope.task_id().to_string(),
            result: TaskOutcome::Success,
        }
    }

    pub fn error(envelope: &TaskEnvelope, traceback: impl Into<String>) -> Self {
        Self {
            task_name: envelope.task_name(),
            task_id_commitment: envelope.task_id().to_string(),
            result: TaskOutcome::Error {
                traceback: traceback.into(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.result, TaskOutcome::Success)
    }
}
