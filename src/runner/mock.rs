//! Backend that simulates work without touching real models.
//!
//! Inference `task_args` may be a JSON object with test hooks:
//! - `mock_delay_ms`: sleep this long before finishing
//! - `mock_error`: fail the task with this message

use std::thread;
use std::time::{Duration, Instant};

use node_worker_types::{DownloadTask, InferenceTask};

use super::{ModelCache, RunnerError, TaskRunner};

struct MockModel {
    id: String,
    loaded_at: Instant,
}

pub struct MockRunner {
    delay: Duration,
}

impl MockRunner {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
        }
    }
}

impl TaskRunner for MockRunner {
    fn run_inference(
        &mut self,
        task: &InferenceTask,
        model_cache: &mut ModelCache,
    ) -> Result<(), RunnerError> {
        let args: serde_json::Value = if task.task_args.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&task.task_args)
                .map_err(|e| RunnerError::InvalidArgs(e.to_string()))?
        };

        let model = model_cache.load(&task.model_id, || {
            log::info!("[MOCK] Loading model {}", task.model_id);
            Ok(MockModel {
                id: task.model_id.clone(),
                loaded_at: Instant::now(),
            })
        })?;
        log::debug!(
            "[MOCK] Using model {} (loaded {:?} ago)",
            model.id,
            model.loaded_at.elapsed()
        );

        let delay = args
            .get("mock_delay_ms")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or(self.delay);
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        if let Some(message) = args.get("mock_error").and_then(|v| v.as_str()) {
            return Err(RunnerError::Task(message.to_string()));
        }
        Ok(())
    }

    fn download_model(&mut self, task: &DownloadTask) -> Result<(), RunnerError> {
        if task.model.id.is_empty() {
            return Err(RunnerError::InvalidArgs("model id is empty".to_string()));
        }
        log::info!(
            "[MOCK] Downloading {:?} model {} (variant {:?})",
            task.model_type,
            task.model.id,
            task.model.variant
        );
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        Ok(())
    }

    fn prefetch_model(&mut self, task: &DownloadTask) -> Result<(), RunnerError> {
        if task.model.id.is_empty() {
            return Err(RunnerError::InvalidArgs("model id is empty".to_string()));
        }
        log::info!("[MOCK] Preloading {:?} model: {}", task.model_type, task.model.id);
        log::info!("[MOCK] Successfully preloaded {:?} model: {}", task.model_type, task.model.id);
        Ok(())
    }
}
