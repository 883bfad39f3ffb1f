//! Task orchestration engine.
//!
//! The [`TaskWorker`] runs two polling loops against the connection and
//! supervises one inference and one download task process, which share a
//! [`ModelMutex`] so model weights are never read while being replaced.

pub mod ipc_types;
pub mod loops;
pub mod model_mutex;
pub mod orchestrator;
pub mod process_manager;
pub mod status;
pub mod task_process;

pub use loops::LoopError;
pub use model_mutex::{ModelGuard, ModelMutex};
pub use orchestrator::{OrchestratorError, ProcessIds, TaskWorker};
pub use process_manager::{ProcessError, ProcessSpawner, TaskProcess, TASK_PROCESS_FLAG};
pub use status::{StatusHandle, WorkerStatus};
pub use task_process::run_task_process;
#[cfg(unix)]
pub use process_manager::pid_is_alive;
