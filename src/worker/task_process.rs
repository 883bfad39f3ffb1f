//! Task process entry point.
//!
//! Runs as a child process spawned by the orchestrator. Reads JSON requests
//! from stdin, executes tasks one at a time under the model mutex, and
//! writes JSON responses to stdout. Logs go to stderr and a per-kind file.
//! The download process first prefetches the configured preloaded models.
//!
//! Thread design:
//! - stdin reader: reads lines → channel; exits on EOF (parent gone)
//! - main loop: polls the channel, checks the stop flag between tasks

use std::io::{self, BufRead, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use node_worker_types::{DownloadTask, TaskEnvelope, TaskName, TaskResult};

use super::ipc_types::{ProcessRequest, ProcessResponse};
use super::model_mutex::ModelMutex;
use super::orchestrator::panic_message;
use crate::logging;
use crate::runner::{create_runner, prefetch_tasks, ModelCache, RunnerError, TaskRunner};

/// Set by SIGTERM/SIGINT; the main loop stops before taking the next task.
static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn request_stop(_signal: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_stop_handlers() {
    let handler = request_stop as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGTERM, handler);
        libc::signal(libc::SIGINT, handler);
    }
}

#[cfg(not(unix))]
fn install_stop_handlers() {}

/// Run a task process of the given kind until stopped or orphaned.
pub fn run_task_process(kind: TaskName) -> anyhow::Result<()> {
    install_stop_handlers();
    eprintln!("[TASK_PROCESS] Starting {kind} process (pid={})", std::process::id());

    let lines = spawn_stdin_reader()?;
    let init = lines
        .recv()
        .context("stdin closed before the init request")?;
    let request: ProcessRequest = serde_json::from_str(&init).context("invalid init request")?;
    let (config, mutex_dir) = match request {
        ProcessRequest::Init { config, mutex_dir } => (config, mutex_dir),
        ProcessRequest::Task { .. } => bail!("expected an init request, got a task"),
    };

    let log_file = logging::task_process_log_file(&config.log.filename, kind);
    if let Err(e) = logging::setup_logging(&config.log, &log_file) {
        eprintln!("[TASK_PROCESS] Failed to set up logging: {e}");
    }

    let mutex = ModelMutex::open(&mutex_dir)
        .with_context(|| format!("cannot open lock directory {mutex_dir}"))?;
    let mut runner = create_runner(&config);
    let mut model_cache = ModelCache::new();
    let poll = Duration::from_millis(config.runtime.poll_interval_ms.max(1));

    if kind == TaskName::Download {
        if let Some(ref preloaded) = config.preloaded_models {
            prefetch_models(&mut *runner, &mutex, &prefetch_tasks(preloaded), &STOP_REQUESTED);
        }
    }

    let stdout = io::stdout();
    let mut stdout = stdout.lock();
    write_response(
        &mut stdout,
        &ProcessResponse::Ready {
            pid: std::process::id(),
        },
    )?;
    log::info!("[TASK_PROCESS] {kind} process ready");

    while !STOP_REQUESTED.load(Ordering::SeqCst) {
        let line = match lines.recv_timeout(poll) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                log::info!("[TASK_PROCESS] stdin closed, shutting down");
                break;
            }
        };

        let envelope = match serde_json::from_str::<ProcessRequest>(&line) {
            Ok(ProcessRequest::Task { envelope }) => envelope,
            Ok(ProcessRequest::Init { .. }) => {
                log::warn!("[TASK_PROCESS] Ignoring repeated init request");
                continue;
            }
            Err(e) => {
                log::warn!("[TASK_PROCESS] Ignoring malformed request: {e}");
                continue;
            }
        };

        let result = execute_task(kind, &mut *runner, &mut model_cache, &mutex, &envelope);
        write_response(&mut stdout, &ProcessResponse::Result { result })?;
    }

    log::info!(
        "[TASK_PROCESS] {kind} process exiting (stop requested: {})",
        STOP_REQUESTED.load(Ordering::SeqCst)
    );
    Ok(())
}

/// Execute one envelope. Always produces exactly one result.
pub fn execute_task(
    kind: TaskName,
    runner: &mut dyn TaskRunner,
    model_cache: &mut ModelCache,
    mutex: &ModelMutex,
    envelope: &TaskEnvelope,
) -> TaskResult {
    if envelope.task_name() != kind {
        return TaskResult::error(
            envelope,
            format!("{} task sent to the {kind} process", envelope.task_name()),
        );
    }

    log::info!("[TASK_PROCESS] Running {kind} task {}", envelope.task_id());
    let outcome = run_locked(mutex, envelope.model_id(), || match envelope {
        TaskEnvelope::Inference(task) => runner.run_inference(task, model_cache),
        TaskEnvelope::Download(task) => runner.download_model(task),
    });

    match outcome {
        Ok(()) => {
            log::info!("[TASK_PROCESS] Task {} succeeded", envelope.task_id());
            TaskResult::success(envelope)
        }
        Err(message) => {
            log::error!("[TASK_PROCESS] Task {} failed: {message}", envelope.task_id());
            TaskResult::error(envelope, message)
        }
    }
}

/// Counts from one prefetch pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchSummary {
    pub fetched: usize,
    pub failed: usize,
}

/// Fetch preloaded models one at a time, each under its model lock.
///
/// A failed model is logged and skipped. Stops early once `stop` is set.
pub fn prefetch_models(
    runner: &mut dyn TaskRunner,
    mutex: &ModelMutex,
    tasks: &[DownloadTask],
    stop: &AtomicBool,
) -> PrefetchSummary {
    let mut summary = PrefetchSummary::default();
    if tasks.is_empty() {
        return summary;
    }
    log::info!("[TASK_PROCESS] Prefetching {} models", tasks.len());

    for (index, task) in tasks.iter().enumerate() {
        if stop.load(Ordering::SeqCst) {
            log::info!("[TASK_PROCESS] Prefetch interrupted after {index} models");
            break;
        }
        match run_locked(mutex, &task.model.id, || runner.prefetch_model(task)) {
            Ok(()) => {
                summary.fetched += 1;
                log::info!(
                    "[TASK_PROCESS] Prefetched {} ({}/{})",
                    task.model.id,
                    index + 1,
                    tasks.len()
                );
            }
            Err(message) => {
                summary.failed += 1;
                log::error!("[TASK_PROCESS] Prefetching {} failed: {message}", task.model.id);
            }
        }
    }

    log::info!(
        "[TASK_PROCESS] Prefetch done: {} fetched, {} failed",
        summary.fetched,
        summary.failed
    );
    summary
}

/// Run `work` while holding the lock for `model_id`. Runner errors and
/// panics come back as a message; the lock is released either way.
fn run_locked<F>(mutex: &ModelMutex, model_id: &str, work: F) -> Result<(), String>
where
    F: FnOnce() -> Result<(), RunnerError>,
{
    let guard = match mutex.acquire(model_id) {
        Ok(guard) => guard,
        Err(e) => {
            log::error!("[TASK_PROCESS] Failed to lock model {model_id}: {e}");
            return Err(format!("Failed to lock model: {e}"));
        }
    };
    log::debug!("[TASK_PROCESS] Holding lock for model {}", guard.model_id());

    let outcome = panic::catch_unwind(AssertUnwindSafe(work));
    guard.release();

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(format!("Task panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn spawn_stdin_reader() -> io::Result<Receiver<String>> {
    let (line_tx, line_rx) = crossbeam_channel::unbounded();
    thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            let reader = stdin.lock();
            for line in reader.lines() {
                match line {
                    Ok(l) if !l.trim().is_empty() => {
                        if line_tx.send(l).is_err() {
                            break; // Main loop exited
                        }
                    }
                    Ok(_) => {}      // Empty line, skip
                    Err(_) => break, // stdin closed (parent died)
                }
            }
        })?;
    Ok(line_rx)
}

fn write_response(stdout: &mut impl Write, response: &ProcessResponse) -> anyhow::Result<()> {
    let line = serde_json::to_string(response)?;
    writeln!(stdout, "{line}").context("failed to write to stdout")?;
    stdout.flush().context("failed to flush stdout")?;
    Ok(())
}
