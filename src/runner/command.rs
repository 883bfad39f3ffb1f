//! Backend that delegates each task to an external program.
//!
//! The program receives the task envelope as one JSON line on stdin and
//! reports success through its exit status. Model directories and proxy
//! settings are passed through the environment.

use std::io::Write;
use std::process::{Command, Stdio};

use node_worker_config::{CommandSpec, DataDirConfig};
use node_worker_types::{DownloadTask, InferenceTask, TaskEnvelope, TaskName};

use super::{ModelCache, RunnerError, TaskRunner};

pub const ENV_TASK_NAME: &str = "NODE_WORKER_TASK_NAME";
pub const ENV_HF_MODELS_DIR: &str = "NODE_WORKER_HF_MODELS_DIR";
pub const ENV_EXTERNAL_MODELS_DIR: &str = "NODE_WORKER_EXTERNAL_MODELS_DIR";

pub struct CommandRunner {
    inference: CommandSpec,
    download: CommandSpec,
    data_dir: DataDirConfig,
    proxy_url: Option<String>,
}

impl CommandRunner {
    pub fn new(
        inference: CommandSpec,
        download: CommandSpec,
        data_dir: DataDirConfig,
        proxy_url: Option<String>,
    ) -> Self {
        Self {
            inference,
            download,
            data_dir,
            proxy_url,
        }
    }

    fn run(&self, spec: &CommandSpec, envelope: &TaskEnvelope) -> Result<(), RunnerError> {
        let input = serde_json::to_string(envelope)
            .map_err(|e| RunnerError::InvalidArgs(e.to_string()))?;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .env(ENV_TASK_NAME, envelope.task_name().as_str())
            .env(ENV_HF_MODELS_DIR, &self.data_dir.models.huggingface)
            .env(ENV_EXTERNAL_MODELS_DIR, &self.data_dir.models.external)
            .stdin(Stdio::piped())
            // The task process's own stdout carries the IPC protocol.
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref proxy) = self.proxy_url {
            command.env("HTTP_PROXY", proxy).env("HTTPS_PROXY", proxy);
        }

        log::info!(
            "[RUNNER] Running {} {:?} for task {}",
            spec.program,
            spec.args,
            envelope.task_id()
        );
        let mut child = command.spawn().map_err(|source| RunnerError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // The program may exit without reading its input; its status decides.
            if let Err(e) = writeln!(stdin, "{input}") {
                log::warn!("[RUNNER] Failed to write task to {}: {e}", spec.program);
            }
        }

        let output = child.wait_with_output().map_err(|source| RunnerError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            log::debug!("[RUNNER] {} output:\n{}", spec.program, stdout.trim_end());
        }
        if output.status.success() {
            Ok(())
        } else {
            Err(RunnerError::Failed {
                program: spec.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
            })
        }
    }
}

impl TaskRunner for CommandRunner {
    fn run_inference(
        &mut self,
        task: &InferenceTask,
        model_cache: &mut ModelCache,
    ) -> Result<(), RunnerError> {
        // The external program owns the weights; only remember which model it last ran.
        model_cache.load(&task.model_id, || Ok(TaskName::Inference))?;
        self.run(&self.inference, &TaskEnvelope::Inference(task.clone()))
    }

    fn download_model(&mut self, task: &DownloadTask) -> Result<(), RunnerError> {
        self.run(&self.download, &TaskEnvelope::Download(task.clone()))
    }
}
