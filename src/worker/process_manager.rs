//! Task process lifecycle management.
//!
//! Spawns a task process as a child (same binary with `--task-process
//! <kind>`), feeds it tasks over stdin and collects its results from
//! stdout on two IO threads, and stops it cooperatively or forcibly.
//!
//! On unix each task process leads its own process group. A forced kill
//! signals the whole group, so programs a backend started for the current
//! task die with it.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use node_worker_types::{TaskEnvelope, TaskName, TaskResult};
use thiserror::Error;

use super::ipc_types::{ProcessRequest, ProcessResponse};

pub const TASK_PROCESS_FLAG: &str = "--task-process";

const JOIN_POLL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Cannot find own executable: {0}")]
    CurrentExe(#[source] std::io::Error),

    #[error("Failed to spawn {kind} process: {source}")]
    Spawn {
        kind: TaskName,
        #[source]
        source: std::io::Error,
    },

    #[error("{kind} process has no {pipe} pipe")]
    MissingPipe { kind: TaskName, pipe: &'static str },

    #[error("Failed to encode init request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to start IO thread: {0}")]
    Thread(#[source] std::io::Error),
}

/// How task processes are launched. Defaults to re-executing this binary.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    extra_args: Vec<String>,
}

impl ProcessSpawner {
    pub fn current_exe() -> Result<Self, ProcessError> {
        let program = std::env::current_exe().map_err(ProcessError::CurrentExe)?;
        Ok(Self::new(program))
    }

    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
        }
    }

    fn spawn(&self, kind: TaskName) -> Result<Child, ProcessError> {
        log::info!(
            "[PROCESS_MGR] Spawning {kind} process: {} {TASK_PROCESS_FLAG} {kind}",
            self.program.display()
        );

        let mut command = Command::new(&self.program);
        command
            .args(&self.extra_args)
            .arg(TASK_PROCESS_FLAG)
            .arg(kind.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()); // Task process logs go to parent's stderr
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        command
            .spawn()
            .map_err(|source| ProcessError::Spawn { kind, source })
    }
}

/// One running task process and its IO threads.
pub struct TaskProcess {
    kind: TaskName,
    pid: u32,
    child: Mutex<Option<Child>>,
    io_threads: Vec<JoinHandle<()>>,
}

impl TaskProcess {
    /// Spawn a task process, send it `init`, and start forwarding `tasks`
    /// into it and its results into `results`.
    pub fn spawn(
        spawner: &ProcessSpawner,
        kind: TaskName,
        init: &ProcessRequest,
        tasks: Receiver<TaskEnvelope>,
        results: Sender<TaskResult>,
    ) -> Result<Self, ProcessError> {
        let init_line = serde_json::to_string(init)?;
        let mut child = spawner.spawn(kind)?;
        let pid = child.id();

        // From here on a failure must not leave the child running.
        let pipes = child
            .stdin
            .take()
            .ok_or(ProcessError::MissingPipe { kind, pipe: "stdin" })
            .and_then(|stdin| {
                child
                    .stdout
                    .take()
                    .map(|stdout| (stdin, stdout))
                    .ok_or(ProcessError::MissingPipe { kind, pipe: "stdout" })
            });
        let (stdin, stdout) = match pipes {
            Ok(pipes) => pipes,
            Err(e) => {
                abandon_spawn(kind, &mut child, None);
                return Err(e);
            }
        };

        // The reader goes first: it ends on EOF once the child is gone, so
        // it can always be joined. The writer only ends with the task queue.
        let reader = thread::Builder::new()
            .name(format!("{kind}-stdout"))
            .spawn({
                let results = results.clone();
                move || stdout_reader(kind, stdout, results)
            });
        let reader = match reader {
            Ok(handle) => handle,
            Err(e) => {
                abandon_spawn(kind, &mut child, None);
                return Err(ProcessError::Thread(e));
            }
        };

        let writer = thread::Builder::new()
            .name(format!("{kind}-stdin"))
            .spawn(move || stdin_writer(kind, stdin, init_line, tasks, results));
        let writer = match writer {
            Ok(handle) => handle,
            Err(e) => {
                abandon_spawn(kind, &mut child, Some(reader));
                return Err(ProcessError::Thread(e));
            }
        };

        log::info!("[PROCESS_MGR] {kind} process started (pid={pid})");
        Ok(Self {
            kind,
            pid,
            child: Mutex::new(Some(child)),
            io_threads: vec![writer, reader],
        })
    }

    pub fn kind(&self) -> TaskName {
        self.kind
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        match self.child.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(child) => matches!(child.try_wait(), Ok(None)),
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Ask the process to stop after its current task. Only the task
    /// process itself is signalled; its backend programs run to completion.
    pub fn terminate(&self) {
        if let Ok(mut guard) = self.child.lock() {
            if let Some(ref mut child) = *guard {
                log::info!("[PROCESS_MGR] Terminating {} process (pid={})", self.kind, self.pid);
                send_terminate(child);
            }
        }
    }

    /// Kill the process and its process group immediately. Any in-flight
    /// task is abandoned.
    pub fn kill(&self) {
        if let Ok(mut guard) = self.child.lock() {
            if let Some(ref mut child) = *guard {
                log::info!("[PROCESS_MGR] Killing {} process (pid={})", self.kind, self.pid);
                kill_and_reap(child);
            }
            *guard = None;
        }
    }

    /// Wait for the process to exit, killing it once `grace` has elapsed.
    pub fn join(&self, grace: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + grace;
        let mut guard = self.child.lock().ok()?;
        let child = guard.as_mut()?;

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) if Instant::now() < deadline => thread::sleep(JOIN_POLL),
                Ok(None) => {
                    log::warn!(
                        "[PROCESS_MGR] {} process (pid={}) did not exit within {grace:?}, killing",
                        self.kind,
                        self.pid
                    );
                    kill_group(child);
                    break child.wait().ok();
                }
                Err(e) => {
                    log::error!("[PROCESS_MGR] Failed to wait for {} process: {e}", self.kind);
                    kill_group(child);
                    break child.wait().ok();
                }
            }
        };
        *guard = None;
        log::info!("[PROCESS_MGR] {} process exited: {status:?}", self.kind);
        status
    }

    /// Join the IO threads. The task sender must already be dropped and the
    /// process must have exited, or this blocks.
    pub fn join_io(&mut self) {
        for handle in self.io_threads.drain(..) {
            if handle.join().is_err() {
                log::error!("[PROCESS_MGR] {} IO thread panicked", self.kind);
            }
        }
    }
}

impl Drop for TaskProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    // SIGTERM lets the task process finish its current task first
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        log::warn!(
            "[PROCESS_MGR] SIGTERM to pid {pid} failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    let _ = child.kill();
}

/// SIGKILL the process group led by `child`, falling back to the child alone.
#[cfg(unix)]
fn kill_group(child: &mut Child) {
    let group = libc::pid_t::try_from(child.id()).ok().filter(|pid| *pid > 0);
    match group {
        Some(pgid) if unsafe { libc::kill(-pgid, libc::SIGKILL) } == 0 => {}
        _ => {
            let _ = child.kill();
        }
    }
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) {
    let _ = child.kill();
}

fn kill_and_reap(child: &mut Child) {
    kill_group(child);
    let _ = child.wait();
}

// Undo a half-finished spawn. The reader sees EOF once the child is dead.
fn abandon_spawn(kind: TaskName, child: &mut Child, reader: Option<JoinHandle<()>>) {
    log::error!("[PROCESS_MGR] Abandoning {kind} process (pid={})", child.id());
    kill_and_reap(child);
    if let Some(handle) = reader {
        if handle.join().is_err() {
            log::error!("[PROCESS_MGR] {kind} IO thread panicked");
        }
    }
}

/// Whether a process with this pid currently exists.
#[cfg(unix)]
pub fn pid_is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid == 0 {
        return false;
    }
    // Signal 0 doesn't send a signal but checks if the process exists
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn stdin_writer(
    kind: TaskName,
    mut stdin: ChildStdin,
    init_line: String,
    tasks: Receiver<TaskEnvelope>,
    results: Sender<TaskResult>,
) {
    let mut broken = write_line(&mut stdin, &init_line).err();
    if let Some(ref e) = broken {
        log::error!("[PROCESS_MGR] Failed to initialize {kind} process: {e}");
    }

    // Runs until the orchestrator drops the task sender.
    for envelope in tasks.iter() {
        if broken.is_none() {
            let request = ProcessRequest::Task {
                envelope: envelope.clone(),
            };
            let written = serde_json::to_string(&request)
                .map_err(std::io::Error::from)
                .and_then(|line| write_line(&mut stdin, &line));
            match written {
                Ok(()) => continue,
                Err(e) => {
                    log::error!("[PROCESS_MGR] {kind} process stopped accepting tasks: {e}");
                    broken = Some(e);
                }
            }
        }
        reject(kind, &envelope, broken.as_ref(), &results);
    }

    log::debug!("[PROCESS_MGR] {kind} stdin writer exiting");
}

fn reject(
    kind: TaskName,
    envelope: &TaskEnvelope,
    cause: Option<&std::io::Error>,
    results: &Sender<TaskResult>,
) {
    let reason = cause.map(|e| e.to_string()).unwrap_or_default();
    let _ = results.send(TaskResult::error(
        envelope,
        format!("{kind} process is not accepting tasks: {reason}"),
    ));
}

fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes())?;
    stdin.write_all(b"\n")?;
    stdin.flush()
}

fn stdout_reader(kind: TaskName, stdout: ChildStdout, results: Sender<TaskResult>) {
    let reader = BufReader::new(stdout);
    for line in reader.lines() {
        let line = match line {
            Ok(l) if !l.trim().is_empty() => l,
            Ok(_) => continue,
            Err(e) => {
                log::warn!("[PROCESS_MGR] Failed to read from {kind} process: {e}");
                break;
            }
        };

        match serde_json::from_str::<ProcessResponse>(&line) {
            Ok(ProcessResponse::Ready { pid }) => {
                log::info!("[PROCESS_MGR] {kind} process ready (pid={pid})");
            }
            Ok(ProcessResponse::Result { result }) => {
                if results.send(result).is_err() {
                    break; // Orchestrator is gone
                }
            }
            Err(e) => {
                log::warn!("[PROCESS_MGR] Ignoring malformed line from {kind} process: {e}");
            }
        }
    }
    log::debug!("[PROCESS_MGR] {kind} stdout reader exiting");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use node_worker_config::WorkerConfig;
    use node_worker_types::parse_envelope;

    fn sh(script: &str) -> ProcessSpawner {
        // `$0` is "sh"; `--task-process <kind>` land in `$1 $2`.
        ProcessSpawner {
            program: PathBuf::from("sh"),
            extra_args: vec!["-c".to_string(), script.to_string(), "sh".to_string()],
        }
    }

    fn init() -> ProcessRequest {
        ProcessRequest::Init {
            config: WorkerConfig::new("ws://127.0.0.1:1"),
            mutex_dir: "/tmp".to_string(),
        }
    }

    fn envelope(id: &str) -> TaskEnvelope {
        parse_envelope(&format!(
            r#"{{"task_name":"inference","id":"{id}","task_type":1,"model_id":"m","task_args":"{{}}","output_dir":"o"}}"#
        ))
        .unwrap()
    }

    const ECHO_SUCCESS: &str = r#"read init; echo '{"type":"Ready","pid":1}'; while read line; do echo 'not json'; echo '{"type":"Result","result":{"task_name":"inference","task_id_commitment":"t1","result":{"status":"success"}}}'; done"#;

    #[test]
    fn test_results_flow_back() {
        let (task_tx, task_rx) = unbounded();
        let (result_tx, result_rx) = unbounded();
        let mut process = TaskProcess::spawn(
            &sh(ECHO_SUCCESS),
            TaskName::Inference,
            &init(),
            task_rx,
            result_tx,
        )
        .unwrap();
        assert!(process.is_alive());

        task_tx.send(envelope("t1")).unwrap();
        let result = result_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.task_id_commitment, "t1");
        assert!(result.is_success());

        // Closing the task queue closes stdin, which ends the script.
        drop(task_tx);
        assert!(process.join(Duration::from_secs(5)).is_some_and(|s| s.success()));
        process.join_io();
        assert!(!process.is_alive());
    }

    #[test]
    fn test_dead_process_yields_error_results() {
        let (task_tx, task_rx) = unbounded();
        let (result_tx, result_rx) = unbounded();
        let mut process =
            TaskProcess::spawn(&sh("exit 0"), TaskName::Inference, &init(), task_rx, result_tx)
                .unwrap();
        process.join(Duration::from_secs(5));

        task_tx.send(envelope("t2")).unwrap();
        let result = result_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.task_id_commitment, "t2");
        assert!(!result.is_success());

        drop(task_tx);
        process.join_io();
    }

    #[test]
    fn test_terminate_is_cooperative() {
        let (_task_tx, task_rx) = unbounded();
        let (result_tx, _result_rx) = unbounded();
        let process = TaskProcess::spawn(
            &sh("trap 'exit 7' TERM; while :; do sleep 0.05; done"),
            TaskName::Download,
            &init(),
            task_rx,
            result_tx,
        )
        .unwrap();
        thread::sleep(Duration::from_millis(100));
        process.terminate();
        let status = process.join(Duration::from_secs(5)).unwrap();
        assert_eq!(status.code(), Some(7));
    }

    #[test]
    fn test_join_kills_after_grace() {
        let (_task_tx, task_rx) = unbounded();
        let (result_tx, _result_rx) = unbounded();
        let process = TaskProcess::spawn(
            &sh("trap '' TERM; exec sleep 30"),
            TaskName::Download,
            &init(),
            task_rx,
            result_tx,
        )
        .unwrap();
        let pid = process.pid();
        thread::sleep(Duration::from_millis(100));
        process.terminate();

        let started = Instant::now();
        let status = process.join(Duration::from_millis(300)).unwrap();
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!pid_is_alive(pid));
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let (_task_tx, task_rx) = unbounded();
        let (result_tx, _result_rx) = unbounded();
        let err = TaskProcess::spawn(
            &ProcessSpawner::new("/nonexistent/node-worker"),
            TaskName::Inference,
            &init(),
            task_rx,
            result_tx,
        )
        .err()
        .unwrap();
        assert!(matches!(err, ProcessError::Spawn { kind: TaskName::Inference, .. }));
    }

    #[test]
    fn test_drop_kills_process() {
        let (_task_tx, task_rx) = unbounded();
        let (result_tx, _result_rx) = unbounded();
        let process = TaskProcess::spawn(
            &sh("exec sleep 30"),
            TaskName::Inference,
            &init(),
            task_rx,
            result_tx,
        )
        .unwrap();
        let pid = process.pid();
        drop(process);
        assert!(!pid_is_alive(pid));
    }

    #[test]
    fn test_kill_takes_down_the_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("sleeper.pid");
        // The background sleeper stands in for a backend program.
        let script = format!(
            "sleep 30 & echo $! > '{}'; wait",
            pid_file.display()
        );
        let (_task_tx, task_rx) = unbounded();
        let (result_tx, _result_rx) = unbounded();
        let process =
            TaskProcess::spawn(&sh(&script), TaskName::Inference, &init(), task_rx, result_tx)
                .unwrap();

        let sleeper = wait_for_pid_file(&pid_file);
        assert!(pid_is_alive(sleeper));
        process.kill();
        assert!(!process.is_alive());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !process_gone(sleeper) {
            assert!(Instant::now() < deadline, "sleeper {sleeper} outlived its group");
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_abandoned_spawn_reaps_child_and_joins_reader() {
        let mut child = sh("read init; exec sleep 30").spawn(TaskName::Download).unwrap();
        let pid = child.id();
        let stdout = child.stdout.take().unwrap();
        let (result_tx, _result_rx) = unbounded();
        let reader = thread::spawn(move || stdout_reader(TaskName::Download, stdout, result_tx));

        abandon_spawn(TaskName::Download, &mut child, Some(reader));
        assert!(!pid_is_alive(pid));
    }

    fn wait_for_pid_file(path: &std::path::Path) -> u32 {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(pid) = std::fs::read_to_string(path)
                .ok()
                .and_then(|s| s.trim().parse().ok())
            {
                return pid;
            }
            assert!(Instant::now() < deadline, "{} never written", path.display());
            thread::sleep(Duration::from_millis(10));
        }
    }

    // Orphans stay zombies until whoever adopted them reaps them.
    fn process_gone(pid: u32) -> bool {
        !pid_is_alive(pid)
            || std::fs::read_to_string(format!("/proc/{pid}/stat"))
                .map(|stat| {
                    stat.rsplit(')')
                        .next()
                        .is_some_and(|rest| rest.trim_start().starts_with('Z'))
                })
                .unwrap_or(false)
    }
}
