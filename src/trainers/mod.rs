pub mod checkpoint;
pub mod data_loader;
pub mod ddpm_scheduler;
pub mod errors;
pub mod guidance;
pub mod job;
pub mod loss;
pub mod noise_sampler;
pub mod prior;
pub mod sd_trainer;
pub mod snr_weighting;
pub mod training_helpers;

// Re-export key types
pub use data_loader::{BatchProvider, CachedLatentLoader, FileItem, TrainingBatch};
pub use ddpm_scheduler::DDPMScheduler;
pub use errors::{InstabilityStats, TrainingError};
pub use guidance::{GuidanceType, StepLoss};
pub use job::TrainJob;
pub use loss::{LossBundle, LossEngine};
pub use noise_sampler::{NoiseSampler, TimestepPolicy};
pub use sd_trainer::{SDTrainer, StepOutput, TrainSettings};

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    pub job: String,
    pub config: ConfigData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<MetaConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigData {
    pub name: Option<String>,
    pub process: Vec<ProcessConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    #[serde(rename = "type", default)]
    pub process_type: Option<String>,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default)]
    pub trigger_word: Option<String>,
    #[serde(default = "default_training_folder")]
    pub training_folder: PathBuf,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub network: Option<NetworkConfig>,
    #[serde(default)]
    pub adapter: Option<AdapterConfig>,
    #[serde(default)]
    pub assistant: Option<AssistantConfig>,
    #[serde(default)]
    pub embedding: Option<EmbeddingConfig>,
    #[serde(default)]
    pub save: SaveConfig,
    pub datasets: Vec<DatasetConfig>,
    #[serde(default)]
    pub train: TrainConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_training_folder() -> PathBuf {
    PathBuf::from("output")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub arch: String,
    pub latent_channels: usize,
    pub text_dim: usize,
    pub vocab_size: usize,
    pub max_tokens: usize,
    pub vae_scale_factor: usize,
    pub prediction_type: String,
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            arch: "linear".to_string(),
            latent_channels: 4,
            text_dim: 32,
            vocab_size: 1024,
            max_tokens: 16,
            vae_scale_factor: 8,
            prediction_type: "epsilon".to_string(),
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: "scaled_linear".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default = "default_rank")]
    pub linear: usize,
    #[serde(default = "default_alpha")]
    pub linear_alpha: f32,
}

fn default_rank() -> usize {
    4
}

fn default_alpha() -> f32 {
    4.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    #[serde(rename = "type")]
    pub adapter_type: String,
    pub trigger: String,
    pub num_tokens: usize,
    pub trigger_class_name: Option<String>,
    pub train_image_encoder: bool,
    pub additional_loss_weight: f64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            adapter_type: "none".to_string(),
            trigger: String::new(),
            num_tokens: 4,
            trigger_class_name: None,
            train_image_encoder: false,
            additional_loss_weight: 1.0,
        }
    }
}

/// Frozen helper adapter fed by the dataset control images
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
}

fn default_in_channels() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub trigger: String,
    #[serde(default = "default_tokens")]
    pub tokens: usize,
    #[serde(default)]
    pub trigger_class_name: Option<String>,
}

fn default_tokens() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveConfig {
    pub save_every: usize,
    pub max_step_saves_to_keep: usize,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self { save_every: 250, max_step_saves_to_keep: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub folder_path: PathBuf,
    pub caption_ext: String,
    pub default_caption: String,
    pub is_reg: bool,
    pub network_weight: f64,
    pub loss_multiplier: f64,
    pub guidance_type: Option<String>,
    pub mask_min_value: f64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            folder_path: PathBuf::new(),
            caption_ext: "txt".to_string(),
            default_caption: String::new(),
            is_reg: false,
            network_weight: 1.0,
            loss_multiplier: 1.0,
            guidance_type: None,
            mask_min_value: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub steps: usize,
    pub gradient_accumulation_steps: usize,
    pub lr: f64,
    pub optimizer: String,
    pub lr_scheduler: String,
    pub lr_warmup_steps: usize,
    pub max_grad_norm: f64,
    pub dtype: String,
    pub seed: Option<u64>,

    // timesteps and noise
    pub content_or_style: String,
    pub min_denoising_steps: usize,
    pub max_denoising_steps: usize,
    pub noise_offset: f64,
    pub noise_multiplier: f64,
    pub img_multiplier: f64,
    pub latent_multiplier: f64,

    // loss
    pub loss_target: String,
    pub loss_type: String,
    pub match_noise_norm: bool,
    pub pred_scaler: f64,
    pub correct_pred_norm: bool,
    pub correct_pred_norm_multiplier: f64,
    pub inverted_mask_prior: bool,
    pub inverted_mask_prior_multiplier: f64,
    pub do_prior_divergence: bool,
    pub learnable_snr_gos: bool,
    pub snr_gamma: Option<f64>,
    pub min_snr_gamma: Option<f64>,
    pub reg_weight: f64,

    // prompts and conditioning
    pub do_cfg: bool,
    pub cfg_scale: f64,
    pub cfg_rescale: Option<f64>,
    pub negative_prompt: Option<String>,
    pub max_negative_prompts: usize,
    pub prompt_dropout_prob: f64,
    pub train_text_encoder: bool,
    pub match_adapter_chance: f64,
    pub single_item_batching: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            steps: 1000,
            gradient_accumulation_steps: 1,
            lr: 1e-4,
            optimizer: "adamw".to_string(),
            lr_scheduler: "constant".to_string(),
            lr_warmup_steps: 0,
            max_grad_norm: 1.0,
            dtype: "fp32".to_string(),
            seed: None,
            content_or_style: "balanced".to_string(),
            min_denoising_steps: 0,
            max_denoising_steps: 1000,
            noise_offset: 0.0,
            noise_multiplier: 1.0,
            img_multiplier: 1.0,
            latent_multiplier: 1.0,
            loss_target: "noise".to_string(),
            loss_type: "mse".to_string(),
            match_noise_norm: false,
            pred_scaler: 1.0,
            correct_pred_norm: false,
            correct_pred_norm_multiplier: 1.0,
            inverted_mask_prior: false,
            inverted_mask_prior_multiplier: 0.5,
            do_prior_divergence: false,
            learnable_snr_gos: false,
            snr_gamma: None,
            min_snr_gamma: None,
            reg_weight: 1.0,
            do_cfg: false,
            cfg_scale: 1.0,
            cfg_rescale: None,
            negative_prompt: None,
            max_negative_prompts: 1,
            prompt_dropout_prob: 0.0,
            train_text_encoder: false,
            match_adapter_chance: 0.0,
            single_item_batching: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_every: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { log_every: 10 }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetaConfig {
    pub name: Option<String>,
    pub version: Option<String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = serde_yaml::from_str(&config_str)
        .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?;

    Ok(config)
}

/// Run every process of a job file in order. With `resume`, each process
/// continues from its newest checkpoint.
pub fn train_from_config(config_path: &Path, resume: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let name = config.config.name.clone().unwrap_or_else(|| "train".to_string());
    if let Some(meta) = &config.meta {
        info!("Job {} ({}), version {}", name, config.job, meta.version.as_deref().unwrap_or("unknown"));
    }

    for (idx, process) in config.config.process.iter().enumerate() {
        info!("Running process {}/{} of {}", idx + 1, config.config.process.len(), name);
        let mut job = TrainJob::from_process(&name, process)?;
        if resume {
            job.resume()?;
        }
        job.run()?;
    }
    Ok(())
}
