//! The task worker: run/cancel state machine and shutdown policy.
//!
//! One `run` owns, for its whole duration, the three queues, the model
//! lock directory and both task processes. Whatever way the loops end,
//! the processes are stopped and reaped and the status is back to
//! `stopped` before `run` returns.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Mutex;
use std::thread::{self, Scope};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use node_worker_config::WorkerConfig;
use node_worker_types::{TaskEnvelope, TaskName, TaskResult};
use thiserror::Error;

use super::ipc_types::ProcessRequest;
use super::loops::{result_consumer, task_producer, LoopError, TaskQueues};
use super::model_mutex::ModelMutex;
use super::process_manager::{ProcessError, ProcessSpawner, TaskProcess};
use super::status::{StatusHandle, StopOnDrop, WorkerStatus};
use crate::connection::Connection;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// A loop failed. Carries the first failure; both processes were killed.
    #[error("Task worker running error")]
    Running {
        #[source]
        cause: LoopError,
    },

    #[error("Task worker can only run when stopped, status is {0}")]
    NotStopped(WorkerStatus),

    #[error("Failed to start {kind} process")]
    Spawn {
        kind: TaskName,
        #[source]
        source: ProcessError,
    },

    #[error("Failed to create model lock directory: {0}")]
    LockDir(#[source] std::io::Error),
}

/// Pids of the task processes started by a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessIds {
    pub inference: u32,
    pub download: u32,
}

enum LoopExit {
    Finished,
    Failed(LoopError),
    Panicked(String),
}

enum Outcome {
    Clean,
    Fault(LoopError),
    Unexpected(String),
}

type Done = (&'static str, LoopExit);

pub struct TaskWorker {
    config: WorkerConfig,
    spawner: ProcessSpawner,
    status: StatusHandle,
    last_pids: Mutex<Option<ProcessIds>>,
}

impl TaskWorker {
    /// `config` is handed whole to each task process, which builds its
    /// runner from it. `spawner` names the executable for those processes.
    pub fn new(config: WorkerConfig, spawner: ProcessSpawner) -> Self {
        Self {
            config,
            spawner,
            status: StatusHandle::default(),
            last_pids: Mutex::new(None),
        }
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.get()
    }

    /// Stop a running worker after the loops' current poll. No-op otherwise.
    pub fn cancel(&self) {
        if self.status.cancel() {
            log::info!("[WORKER] Cancel requested");
        }
    }

    /// Handle for cancelling from signal listeners or other threads.
    pub fn cancel_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn last_process_ids(&self) -> Option<ProcessIds> {
        self.last_pids.lock().ok().and_then(|guard| *guard)
    }

    /// Serve tasks from `connection` until cancelled or a loop fails.
    pub fn run(&self, connection: &dyn Connection) -> Result<(), OrchestratorError> {
        match self.status.get() {
            WorkerStatus::Stopped => {}
            WorkerStatus::Cancelled => {
                log::info!("[WORKER] Cancelled before start, not running");
                return Ok(());
            }
            status => return Err(OrchestratorError::NotStopped(status)),
        }

        let poll = Duration::from_millis(self.config.runtime.poll_interval_ms.max(1));
        let grace = Duration::from_secs(self.config.runtime.terminate_grace_secs);

        let mutex = ModelMutex::create(Path::new(&self.config.runtime.lock_dir))
            .map_err(OrchestratorError::LockDir)?;
        let init = ProcessRequest::Init {
            config: self.config.clone(),
            mutex_dir: mutex.dir().to_string_lossy().into_owned(),
        };

        let (inference_tx, inference_rx) = unbounded::<TaskEnvelope>();
        let (download_tx, download_rx) = unbounded::<TaskEnvelope>();
        let (result_tx, result_rx) = unbounded::<TaskResult>();

        let mut inference = match TaskProcess::spawn(
            &self.spawner,
            TaskName::Inference,
            &init,
            inference_rx,
            result_tx.clone(),
        ) {
            Ok(process) => process,
            Err(source) => {
                remove_lock_dir(mutex);
                return Err(OrchestratorError::Spawn {
                    kind: TaskName::Inference,
                    source,
                });
            }
        };
        let mut download = match TaskProcess::spawn(
            &self.spawner,
            TaskName::Download,
            &init,
            download_rx,
            result_tx,
        ) {
            Ok(process) => process,
            Err(source) => {
                inference.kill();
                drop(inference_tx);
                inference.join_io();
                remove_lock_dir(mutex);
                return Err(OrchestratorError::Spawn {
                    kind: TaskName::Download,
                    source,
                });
            }
        };

        if let Ok(mut guard) = self.last_pids.lock() {
            *guard = Some(ProcessIds {
                inference: inference.pid(),
                download: download.pid(),
            });
        }

        let reset = StopOnDrop(&self.status);
        self.status.set(WorkerStatus::Running);
        log::info!(
            "[WORKER] Running (inference pid={}, download pid={})",
            inference.pid(),
            download.pid()
        );

        let queues = TaskQueues {
            inference: &inference_tx,
            download: &download_tx,
        };
        let outcome = self.supervise(connection, &queues, &result_rx, [&inference, &download], poll);

        // Final cleanup, whatever the outcome.
        drop(reset);
        drop(inference_tx);
        drop(download_tx);
        inference.join(grace);
        download.join(grace);
        drop(result_rx);
        inference.join_io();
        download.join_io();
        remove_lock_dir(mutex);
        log::info!("[WORKER] Stopped");

        match outcome {
            Outcome::Fault(cause) => Err(OrchestratorError::Running { cause }),
            Outcome::Clean | Outcome::Unexpected(_) => Ok(()),
        }
    }

    /// Run both loops until the first failure or until both finish, then
    /// stop the processes according to how they ended.
    fn supervise(
        &self,
        connection: &dyn Connection,
        queues: &TaskQueues<'_>,
        results: &Receiver<TaskResult>,
        processes: [&TaskProcess; 2],
        poll: Duration,
    ) -> Outcome {
        let status = &self.status;
        let (done_tx, done_rx) = unbounded::<Done>();

        let outcome = thread::scope(|scope| {
            let mut started = spawn_loop(scope, "task-producer", done_tx.clone(), move || {
                task_producer(status, connection, queues, poll)
            });
            if started.is_ok() {
                started = spawn_loop(scope, "result-consumer", done_tx.clone(), move || {
                    result_consumer(status, connection, results, poll)
                });
            }
            drop(done_tx);

            let outcome = match started {
                Ok(()) => wait_for_loops(&done_rx),
                Err(e) => Outcome::Unexpected(format!("Failed to start loop thread: {e}")),
            };

            match &outcome {
                Outcome::Fault(e) => {
                    log::error!("[WORKER] Task worker running error: {e}");
                    processes.iter().for_each(|p| stop_process(p, true));
                }
                Outcome::Unexpected(message) => {
                    log::error!("[WORKER] Task worker unexpected error: {message}");
                    processes.iter().for_each(|p| stop_process(p, true));
                }
                Outcome::Clean => {
                    log::info!("[WORKER] Loops finished, terminating task processes");
                    processes.iter().for_each(|p| stop_process(p, false));
                }
            }

            // Releases any loop still polling; the scope then joins it.
            status.set(WorkerStatus::Stopped);
            outcome
        });

        for (name, exit) in done_rx.try_iter() {
            match exit {
                LoopExit::Finished => {}
                LoopExit::Failed(e) => log::warn!("[WORKER] Discarding later {name} error: {e}"),
                LoopExit::Panicked(message) => {
                    log::warn!("[WORKER] Discarding later {name} panic: {message}")
                }
            }
        }
        outcome
    }
}

fn spawn_loop<'scope, F>(
    scope: &'scope Scope<'scope, '_>,
    name: &'static str,
    done: Sender<Done>,
    body: F,
) -> std::io::Result<()>
where
    F: FnOnce() -> Result<(), LoopError> + Send + 'scope,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn_scoped(scope, move || {
            let exit = match panic::catch_unwind(AssertUnwindSafe(body)) {
                Ok(Ok(())) => LoopExit::Finished,
                Ok(Err(e)) => LoopExit::Failed(e),
                Err(payload) => LoopExit::Panicked(panic_message(payload.as_ref())),
            };
            let _ = done.send((name, exit));
        })?;
    Ok(())
}

fn stop_process(process: &TaskProcess, force: bool) {
    if !process.is_alive() {
        log::warn!(
            "[WORKER] {} process (pid={}) already exited",
            process.kind(),
            process.pid()
        );
    }
    if force {
        process.kill();
    } else {
        process.terminate();
    }
}

fn wait_for_loops(done: &Receiver<Done>) -> Outcome {
    let mut finished = 0;
    while finished < 2 {
        match done.recv() {
            Ok((name, LoopExit::Finished)) => {
                log::info!("[WORKER] {name} finished");
                finished += 1;
            }
            Ok((name, LoopExit::Failed(e))) => {
                log::error!("[WORKER] {name} failed: {e}");
                return Outcome::Fault(e);
            }
            Ok((name, LoopExit::Panicked(message))) => {
                return Outcome::Unexpected(format!("{name} panicked: {message}"));
            }
            Err(_) => return Outcome::Unexpected("Loop threads exited without reporting".to_string()),
        }
    }
    Outcome::Clean
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

fn remove_lock_dir(mutex: ModelMutex) {
    let dir = mutex.dir().to_path_buf();
    if let Err(e) = mutex.remove() {
        log::warn!("[WORKER] Failed to remove lock directory {}: {e}", dir.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MemoryConnection;

    fn worker(program: &str) -> (tempfile::TempDir, TaskWorker) {
        let locks = tempfile::tempdir().unwrap();
        let mut config = WorkerConfig::new("ws://127.0.0.1:1");
        config.runtime.lock_dir = locks.path().to_string_lossy().into_owned();
        (locks, TaskWorker::new(config, ProcessSpawner::new(program)))
    }

    #[test]
    fn test_cancelled_run_is_a_no_op() {
        let (_locks, worker) = worker("/nonexistent/node-worker");
        worker.status.set(WorkerStatus::Cancelled);
        let (_server, conn) = MemoryConnection::pair();
        assert!(worker.run(&conn).is_ok());
        assert_eq!(worker.status(), WorkerStatus::Cancelled);
        assert!(worker.last_process_ids().is_none());
    }

    #[test]
    fn test_run_requires_stopped() {
        let (_locks, worker) = worker("/nonexistent/node-worker");
        worker.status.set(WorkerStatus::Running);
        let (_server, conn) = MemoryConnection::pair();
        assert!(matches!(
            worker.run(&conn),
            Err(OrchestratorError::NotStopped(WorkerStatus::Running))
        ));
    }

    #[test]
    fn test_spawn_failure_leaves_worker_stopped() {
        let (_locks, worker) = worker("/nonexistent/node-worker");
        let (_server, conn) = MemoryConnection::pair();
        match worker.run(&conn) {
            Err(OrchestratorError::Spawn { kind, .. }) => assert_eq!(kind, TaskName::Inference),
            other => panic!("expected spawn error, got {other:?}"),
        }
        assert_eq!(worker.status(), WorkerStatus::Stopped);
        let lock_root = Path::new(&worker.config.runtime.lock_dir);
        let leftover = std::fs::read_dir(lock_root).map(|d| d.count()).unwrap_or(0);
        assert_eq!(leftover, 0);
    }

    #[test]
    fn test_cancel_is_a_no_op_when_stopped() {
        let (_locks, worker) = worker("/nonexistent/node-worker");
        worker.cancel();
        worker.cancel_handle().cancel();
        assert_eq!(worker.status(), WorkerStatus::Stopped);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "Unknown panic");
    }
}
