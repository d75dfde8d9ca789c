//! One `process` entry of a job file: builds the model, adapters, loaders and
//! trainer, then runs the step loop with logging and checkpoints.

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use log::{info, warn};
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

#[cfg(feature = "progress-bar")]
use indicatif::{ProgressBar, ProgressStyle};

use super::checkpoint::{self, CheckpointMeta};
use super::data_loader::{fetch_batch, BatchProvider, CachedLatentLoader};
use super::ddpm_scheduler::{BetaSchedule, DDPMScheduler, PredictionType};
use super::errors::TrainingError;
use super::sd_trainer::{SDTrainer, StepOutput, TrainSettings, TrainerParts};
use super::{LoggingConfig, ProcessConfig, SaveConfig};
use crate::models::{
    Adapter, AssistantAdapter, AssistantKind, ChannelResidualAssistant, DenoisingModel, LinearDenoiser,
    LinearDenoiserConfig, TrainableEmbedding,
};

pub fn parse_device(device: &str) -> Result<Device> {
    match device.to_lowercase().as_str() {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::new_cuda(0)?),
        other => match other.strip_prefix("cuda:").map(str::parse::<usize>) {
            Some(Ok(ordinal)) => Ok(Device::new_cuda(ordinal)?),
            _ => Err(TrainingError::config(format!("unknown device: {}", device)).into()),
        },
    }
}

pub fn parse_dtype(dtype: &str) -> Result<DType> {
    match dtype.to_lowercase().as_str() {
        "fp32" | "float32" => Ok(DType::F32),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        "fp16" | "float16" => Ok(DType::F16),
        other => Err(TrainingError::config(format!("unknown dtype: {}", other)).into()),
    }
}

/// Token ids of `trigger trigger_1 ...` in the model vocabulary
fn trigger_token_ids(model: &dyn DenoisingModel, trigger: &str, tokens: usize) -> Result<Vec<u32>> {
    let mut words = vec![trigger.to_string()];
    words.extend((1..tokens.max(1)).map(|i| format!("{}_{}", trigger, i)));
    words
        .iter()
        .map(|w| {
            model
                .token_id(w)
                .ok_or_else(|| anyhow::Error::from(TrainingError::config(format!("trigger word {:?} has no token id", w))))
        })
        .collect()
}

fn build_assistant(process: &ProcessConfig, device: &Device, dtype: DType) -> Result<Option<Box<dyn AssistantAdapter>>> {
    let Some(config) = &process.assistant else {
        return Ok(None);
    };
    let kind = match config.type_.as_str() {
        "t2i" => AssistantKind::T2I,
        "control_net" | "controlnet" => AssistantKind::ControlNet,
        other => return Err(TrainingError::config(format!("unknown assistant type: {}", other)).into()),
    };
    let assistant =
        ChannelResidualAssistant::new(kind, config.in_channels, process.model.latent_channels, device, dtype)?;
    Ok(Some(Box::new(assistant)))
}

pub struct TrainJob {
    name: String,
    trainer: SDTrainer,
    train_loader: Box<dyn BatchProvider>,
    reg_loader: Option<Box<dyn BatchProvider>>,
    output_dir: PathBuf,
    steps: usize,
    save: SaveConfig,
    logging: LoggingConfig,
    meta: CheckpointMeta,
    device: Device,
}

impl TrainJob {
    pub fn from_process(name: &str, process: &ProcessConfig) -> Result<Self> {
        let device = parse_device(&process.device)?;
        let dtype = parse_dtype(&process.train.dtype)?;
        info!("Building {} on {:?} ({:?})", name, device, dtype);

        let model_config = &process.model;
        if model_config.arch != "linear" {
            return Err(TrainingError::config(format!("unknown model arch: {}", model_config.arch)).into());
        }
        let scheduler = DDPMScheduler::new(
            model_config.num_train_timesteps,
            model_config.beta_start as f32,
            model_config.beta_end as f32,
            model_config.beta_schedule.parse::<BetaSchedule>()?,
            model_config.prediction_type.parse::<PredictionType>()?,
            &device,
        )?;

        let lora = match &process.network {
            Some(network) if network.type_.eq_ignore_ascii_case("lora") => Some((network.linear, network.linear_alpha)),
            Some(network) => {
                return Err(TrainingError::config(format!("unknown network type: {}", network.type_)).into());
            }
            None => None,
        };
        let model = LinearDenoiser::new(
            LinearDenoiserConfig {
                latent_channels: model_config.latent_channels,
                text_dim: model_config.text_dim,
                vocab_size: model_config.vocab_size,
                max_tokens: model_config.max_tokens,
                vae_scale_factor: model_config.vae_scale_factor,
                lora,
                train_text_encoder: process.train.train_text_encoder,
            },
            scheduler,
            &device,
            dtype,
        )?;

        let adapter = match &process.adapter {
            Some(config) if config.adapter_type != "none" => {
                let token_table = if config.adapter_type == "te_augmenter" {
                    let ids = trigger_token_ids(&model, &config.trigger, config.num_tokens)?;
                    model.token_table().map(|table| (table, ids))
                } else {
                    None
                };
                Some(Adapter::new(
                    config.clone(),
                    model_config.text_dim,
                    model_config.latent_channels,
                    token_table,
                    &device,
                    dtype,
                )?)
            }
            _ => None,
        };

        let embedding = match &process.embedding {
            Some(config) => {
                let ids = trigger_token_ids(&model, &config.trigger, config.tokens)?;
                let table = model
                    .token_table()
                    .ok_or_else(|| TrainingError::config("embedding training needs a model with a token table"))?;
                Some(TrainableEmbedding::new(table, &config.trigger, config.tokens, &ids, config.trigger_class_name.clone())?)
            }
            None => None,
        };

        let assistant = build_assistant(process, &device, dtype)?;
        let settings = TrainSettings::from_config(&process.train, process.trigger_word.clone())?;
        let steps = settings.steps;

        let mut train_loaders = Vec::new();
        let mut reg_loaders = Vec::new();
        for (idx, dataset) in process.datasets.iter().enumerate() {
            let seed = settings.seed.map(|s| s.wrapping_add(100 + idx as u64));
            let loader = CachedLatentLoader::new(dataset, process.train.batch_size, &device, dtype, seed)
                .with_context(|| format!("Failed to load dataset {}", dataset.folder_path.display()))?;
            if dataset.is_reg {
                reg_loaders.push(loader);
            } else {
                train_loaders.push(loader);
            }
        }
        if train_loaders.len() > 1 || reg_loaders.len() > 1 {
            warn!("Only the first training and the first regularization dataset are used");
        }
        let train_loader: Box<dyn BatchProvider> = match train_loaders.into_iter().next() {
            Some(loader) => Box::new(loader),
            None => return Err(TrainingError::config("no training dataset configured").into()),
        };
        let reg_loader = reg_loaders.into_iter().next().map(|l| Box::new(l) as Box<dyn BatchProvider>);
        info!(
            "Dataset: {} training items, {} regularization items",
            train_loader.num_items(),
            reg_loader.as_ref().map(|l| l.num_items()).unwrap_or(0)
        );

        let trainer = SDTrainer::new(
            TrainerParts { model: Box::new(model), has_network: lora.is_some(), adapter, embedding, assistant },
            settings,
        )?;

        Ok(Self {
            name: name.to_string(),
            trainer,
            train_loader,
            reg_loader,
            output_dir: process.training_folder.join(name),
            steps,
            save: process.save.clone(),
            logging: process.logging.clone(),
            meta: CheckpointMeta { rank: lora.map(|(r, _)| r), alpha: lora.map(|(_, a)| a) },
            device,
        })
    }

    pub fn trainer(&self) -> &SDTrainer {
        &self.trainer
    }

    /// Continue from the newest checkpoint in the output folder, if any
    pub fn resume(&mut self) -> Result<bool> {
        match checkpoint::latest_checkpoint(&self.output_dir, &self.name)? {
            Some((_, path)) => {
                let step = checkpoint::load_checkpoint(&path, self.trainer.named_vars(), &self.device)?;
                self.trainer.set_step(step);
                info!("Resuming {} at step {}", self.name, step);
                Ok(true)
            }
            None => {
                info!("No checkpoint found for {}, starting from scratch", self.name);
                Ok(false)
            }
        }
    }

    fn is_save_step(&self, step: usize) -> bool {
        self.save.save_every > 0 && step > 0 && step % self.save.save_every == 0
    }

    fn save(&self, step: usize, last: Option<&StepOutput>) -> Result<()> {
        checkpoint::save_checkpoint(&self.output_dir, &self.name, step, self.trainer.named_vars(), &self.meta)?;
        if self.save.max_step_saves_to_keep > 0 {
            checkpoint::prune_checkpoints(&self.output_dir, &self.name, self.save.max_step_saves_to_keep)?;
        }

        let stats = self.trainer.stats();
        let state = serde_json::json!({
            "name": self.name,
            "step": step,
            "learning_rate": self.trainer.lr(),
            "loss": last.map(|o| o.loss),
            "nan_losses": stats.nan_losses,
            "nan_prior_losses": stats.nan_prior_losses,
        });
        let state_path = self.output_dir.join("training_state.json");
        fs::write(&state_path, serde_json::to_string_pretty(&state)?)
            .with_context(|| format!("Failed to write {}", state_path.display()))?;
        Ok(())
    }

    pub fn run(&mut self) -> Result<()> {
        let start_step = self.trainer.step();
        info!("Training {} for {} steps (from step {})", self.name, self.steps, start_step);
        let started = Instant::now();

        #[cfg(feature = "progress-bar")]
        let progress = {
            let bar = ProgressBar::new(self.steps as u64);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ETA:{eta} {msg}")?
                    .progress_chars("=>-"),
            );
            bar.set_position(start_step as u64);
            bar
        };

        let mut last: Option<StepOutput> = None;
        let mut loss_window: Vec<f32> = Vec::new();
        for step in start_step..self.steps {
            let use_reg = step % 2 == 0 && !self.is_save_step(step);
            let provider = match self.reg_loader.as_mut() {
                Some(reg) if use_reg => reg.as_mut(),
                _ => self.train_loader.as_mut(),
            };
            let mut batch = fetch_batch(provider)?;
            let output = self.trainer.train_step(&mut batch)?;
            batch.cleanup();

            loss_window.push(output.loss);
            if self.logging.log_every > 0 && (step + 1) % self.logging.log_every == 0 {
                let mean = loss_window.iter().sum::<f32>() / loss_window.len() as f32;
                info!(
                    "step {}/{} loss {:.6} lr {:.2e} grad_norm {}",
                    step + 1,
                    self.steps,
                    mean,
                    output.lr,
                    output.grad_norm.map(|n| format!("{:.4}", n)).unwrap_or_else(|| "-".to_string())
                );
                loss_window.clear();
            }

            #[cfg(feature = "progress-bar")]
            {
                progress.set_message(format!("loss {:.4}", output.loss));
                progress.inc(1);
            }

            if self.is_save_step(step + 1) && step + 1 < self.steps {
                self.save(step + 1, Some(&output))?;
            }
            last = Some(output);
        }

        #[cfg(feature = "progress-bar")]
        progress.finish_with_message("done");

        let final_step = self.trainer.step().max(self.steps);
        self.save(final_step, last.as_ref())?;
        let stats = self.trainer.stats();
        if stats.total() > 0 {
            warn!("{} NaN losses were replaced during training", stats.total());
        }
        info!("Finished {} in {:.1}s", self.name, started.elapsed().as_secs_f64());
        Ok(())
    }
}
