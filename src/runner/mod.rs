//! Execution backends.
//!
//! A task process owns one `TaskRunner`, built by `create_runner` from the
//! configuration it received at spawn time.

pub mod command;
pub mod mock;
pub mod model_cache;

use node_worker_config::{BackendConfig, PreloadedModelsConfig, WorkerConfig};
use node_worker_types::{DownloadTask, InferenceTask, ModelSpec, ModelType, TaskType};
use thiserror::Error;

pub use command::CommandRunner;
pub use mock::MockRunner;
pub use model_cache::ModelCache;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Invalid task arguments: {0}")]
    InvalidArgs(String),

    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}:\n{stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{0}")]
    Task(String),
}

/// Executes tasks for one task process.
pub trait TaskRunner: Send {
    fn run_inference(
        &mut self,
        task: &InferenceTask,
        model_cache: &mut ModelCache,
    ) -> Result<(), RunnerError>;

    fn download_model(&mut self, task: &DownloadTask) -> Result<(), RunnerError>;

    /// Fetch one preloaded model ahead of any task. Same contract as a download.
    fn prefetch_model(&mut self, task: &DownloadTask) -> Result<(), RunnerError> {
        self.download_model(task)
    }
}

/// Download tasks for every model in `preloaded`, base models first.
pub fn prefetch_tasks(preloaded: &PreloadedModelsConfig) -> Vec<DownloadTask> {
    let groups = [
        (&preloaded.sd_base, TaskType::StableDiffusion, ModelType::Base),
        (&preloaded.gpt_base, TaskType::Llm, ModelType::Base),
        (&preloaded.controlnet, TaskType::StableDiffusion, ModelType::Controlnet),
        (&preloaded.vae, TaskType::StableDiffusion, ModelType::Vae),
    ];
    groups
        .into_iter()
        .flat_map(|(models, task_type, model_type)| {
            models
                .iter()
                .flatten()
                .map(move |model| prefetch_task(model, task_type, model_type))
        })
        .collect()
}

fn prefetch_task(model: &ModelSpec, task_type: TaskType, model_type: ModelType) -> DownloadTask {
    DownloadTask {
        task_type,
        task_id_commitment: format!("prefetch:{}", model.id),
        model_type,
        model: model.clone(),
    }
}

/// Build the backend named by `config.backend`.
pub fn create_runner(config: &WorkerConfig) -> Box<dyn TaskRunner> {
    match &config.backend {
        BackendConfig::Mock { delay_ms } => Box::new(MockRunner::new(*delay_ms)),
        BackendConfig::Command {
            inference,
            download,
        } => Box::new(CommandRunner::new(
            inference.clone(),
            download.clone(),
            config.data_dir.clone(),
            config.proxy.as_ref().and_then(|p| p.url()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str) -> ModelSpec {
        ModelSpec {
            id: id.to_string(),
            variant: None,
        }
    }

    #[test]
    fn test_prefetch_tasks_order_and_kinds() {
        let preloaded = PreloadedModelsConfig {
            vae: Some(vec![spec("stabilityai/sd-vae-ft-mse")]),
            gpt_base: Some(vec![spec("gpt2")]),
            sd_base: Some(vec![spec("runwayml/stable-diffusion-v1-5"), spec("stabilityai/sdxl")]),
            controlnet: None,
        };
        let tasks = prefetch_tasks(&preloaded);
        let summary: Vec<_> = tasks
            .iter()
            .map(|t| (t.model.id.as_str(), t.task_type, t.model_type))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("runwayml/stable-diffusion-v1-5", TaskType::StableDiffusion, ModelType::Base),
                ("stabilityai/sdxl", TaskType::StableDiffusion, ModelType::Base),
                ("gpt2", TaskType::Llm, ModelType::Base),
                ("stabilityai/sd-vae-ft-mse", TaskType::StableDiffusion, ModelType::Vae),
            ]
        );
        assert_eq!(tasks[2].task_id_commitment, "prefetch:gpt2");
    }

    #[test]
    fn test_no_preloaded_models() {
        assert!(prefetch_tasks(&PreloadedModelsConfig::default()).is_empty());
    }
}
