//! Training step orchestration
//!
//! One call to [`SDTrainer::train_step`] runs
//! `preprocess -> encode -> prior? -> guidance | predict + loss -> backward -> clip -> optimizer? -> lr -> restore`.

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use super::data_loader::TrainingBatch;
use super::errors::{InstabilityStats, TrainingError};
use super::guidance::{guidance_loss, GuidanceInputs, GuidanceType, StepLoss};
use super::loss::{has_nan, LossBundle, LossConfig, LossEngine, LossType};
use super::noise_sampler::{LossTarget, NoiseSampler, NoiseSamplerConfig, TimestepPolicy};
use super::prior::{predict_prior, PriorInputs};
use super::snr_weighting::SnrWeighting;
use super::training_helpers::{clip_grad_norm, create_scheduler, value_map, GradientAccumulator, LrSchedule, LrSchedulerType};
use super::TrainConfig;
use crate::models::prompt::inject_trigger_into_prompt;
use crate::models::{
    Adapter, AdapterKind, AssistantAdapter, AssistantKind, DenoisingModel, EncodeOptions, ForwardContext, Multiplier,
    NetworkState, PredictionKwargs, PredictionRequest, StateGuard, TrainableEmbedding,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerType {
    AdamW,
    Adam,
}

impl FromStr for OptimizerType {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "adamw" => Ok(Self::AdamW),
            "adam" => Ok(Self::Adam),
            other => Err(TrainingError::config(format!("unknown optimizer: {}", other))),
        }
    }
}

impl OptimizerType {
    fn params(&self, lr: f64) -> ParamsAdamW {
        match self {
            OptimizerType::AdamW => ParamsAdamW { lr, ..Default::default() },
            OptimizerType::Adam => ParamsAdamW { lr, weight_decay: 0.0, ..Default::default() },
        }
    }
}

/// Typed training options, parsed once from the `train` section
#[derive(Debug, Clone)]
pub struct TrainSettings {
    pub sampler: NoiseSamplerConfig,
    pub loss: LossConfig,
    pub learnable_snr_gos: bool,
    pub snr_gamma: Option<f64>,
    pub min_snr_gamma: Option<f64>,
    pub optimizer: OptimizerType,
    pub lr: f64,
    pub lr_scheduler: LrSchedulerType,
    pub lr_warmup_steps: usize,
    pub steps: usize,
    pub gradient_accumulation_steps: usize,
    pub max_grad_norm: f64,
    pub reg_weight: f64,
    pub do_cfg: bool,
    pub cfg_scale: f64,
    pub cfg_rescale: Option<f64>,
    pub negative_prompt_pool: Option<Vec<String>>,
    pub max_negative_prompts: usize,
    pub prompt_dropout_prob: f64,
    pub train_text_encoder: bool,
    pub match_adapter_chance: f64,
    pub single_item_batching: bool,
    pub trigger_word: Option<String>,
    pub latent_multiplier: f64,
    pub seed: Option<u64>,
}

/// Lines of a negative prompt file, or the literal prompt
fn load_negative_prompts(negative_prompt: &str) -> Result<Vec<String>> {
    let path = Path::new(negative_prompt);
    if path.is_file() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read negative prompt file: {}", path.display()))?;
        let prompts: Vec<String> = content.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect();
        info!("Loaded {} negative prompts from {}", prompts.len(), path.display());
        return Ok(prompts);
    }
    Ok(vec![negative_prompt.to_string()])
}

impl TrainSettings {
    pub fn from_config(train: &TrainConfig, trigger_word: Option<String>) -> Result<Self> {
        let sampler = NoiseSamplerConfig {
            policy: train.content_or_style.parse::<TimestepPolicy>()?,
            min_denoising_steps: train.min_denoising_steps,
            max_denoising_steps: train.max_denoising_steps,
            noise_offset: train.noise_offset,
            noise_multiplier: train.noise_multiplier,
            img_multiplier: train.img_multiplier,
            loss_target: train.loss_target.parse::<LossTarget>()?,
        };
        let loss = LossConfig {
            loss_type: train.loss_type.parse::<LossType>()?,
            match_noise_norm: train.match_noise_norm,
            pred_scaler: train.pred_scaler,
            correct_pred_norm: train.correct_pred_norm,
            correct_pred_norm_multiplier: train.correct_pred_norm_multiplier,
            inverted_mask_prior: train.inverted_mask_prior,
            inverted_mask_prior_multiplier: train.inverted_mask_prior_multiplier,
            do_prior_divergence: train.do_prior_divergence,
            latent_multiplier: train.latent_multiplier,
        };
        let negative_prompt_pool = match &train.negative_prompt {
            Some(p) => Some(load_negative_prompts(p)?),
            None => None,
        };

        Ok(Self {
            sampler,
            loss,
            learnable_snr_gos: train.learnable_snr_gos,
            snr_gamma: train.snr_gamma,
            min_snr_gamma: train.min_snr_gamma,
            optimizer: train.optimizer.parse::<OptimizerType>()?,
            lr: train.lr,
            lr_scheduler: train.lr_scheduler.parse::<LrSchedulerType>()?,
            lr_warmup_steps: train.lr_warmup_steps,
            steps: train.steps,
            gradient_accumulation_steps: train.gradient_accumulation_steps.max(1),
            max_grad_norm: train.max_grad_norm,
            reg_weight: train.reg_weight,
            do_cfg: train.do_cfg,
            cfg_scale: train.cfg_scale,
            cfg_rescale: train.cfg_rescale,
            negative_prompt_pool,
            max_negative_prompts: train.max_negative_prompts.max(1),
            prompt_dropout_prob: train.prompt_dropout_prob,
            train_text_encoder: train.train_text_encoder,
            match_adapter_chance: train.match_adapter_chance,
            single_item_batching: train.single_item_batching,
            trigger_word: trigger_word.filter(|t| !t.is_empty()),
            latent_multiplier: train.latent_multiplier,
            seed: train.seed,
        })
    }
}

/// Components a trainer is assembled from
pub struct TrainerParts {
    pub model: Box<dyn DenoisingModel>,
    pub has_network: bool,
    pub adapter: Option<Adapter>,
    pub embedding: Option<TrainableEmbedding>,
    pub assistant: Option<Box<dyn AssistantAdapter>>,
}

/// Step-scoped tensors and prompts, rebuilt every step
pub struct TrainingStepContext {
    pub timesteps: Tensor,
    pub noise: Tensor,
    pub noisy_latents: Tensor,
    pub conditioned_prompts: Vec<String>,
    pub negative_prompts: Vec<String>,
    pub mask_multiplier: Option<Tensor>,
    pub adapter_images: Option<Tensor>,
    pub clip_images: Option<Tensor>,
    pub network_weights: Vec<f64>,
}

impl TrainingStepContext {
    /// Item `i` as a one-item context
    fn narrow(&self, i: usize) -> Result<Self> {
        let narrow = |t: &Option<Tensor>| -> Result<Option<Tensor>> {
            match t {
                Some(t) => Ok(Some(t.narrow(0, i, 1)?)),
                None => Ok(None),
            }
        };
        Ok(Self {
            timesteps: self.timesteps.narrow(0, i, 1)?,
            noise: self.noise.narrow(0, i, 1)?,
            noisy_latents: self.noisy_latents.narrow(0, i, 1)?,
            conditioned_prompts: self.conditioned_prompts[i..i + 1].to_vec(),
            negative_prompts: self.negative_prompts[i..i + 1].to_vec(),
            mask_multiplier: narrow(&self.mask_multiplier)?,
            adapter_images: narrow(&self.adapter_images)?,
            clip_images: narrow(&self.clip_images)?,
            network_weights: self.network_weights[i..i + 1].to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct StepFlags {
    is_reg: bool,
    match_adapter_assist: bool,
    guidance: Option<GuidanceType>,
}

/// Result of one training step
#[derive(Debug, Clone, Copy)]
pub struct StepOutput {
    pub loss: f32,
    pub lr: f64,
    pub grad_norm: Option<f64>,
    pub optimizer_stepped: bool,
}

/// Random assistant strength, narrower when the prior is matched against the assistant
fn adapter_strength(rng: &mut StdRng, match_adapter_assist: bool) -> f64 {
    let (lo, hi) = if match_adapter_assist { (0.9, 1.0) } else { (0.9, 1.1) };
    value_map(rng.gen::<f64>(), 0.0, 1.0, lo, hi)
}

fn assistant_residuals(
    assistant: &dyn AssistantAdapter,
    images: &Tensor,
    noisy_latents: &Tensor,
    timesteps: &Tensor,
    strength: f64,
    dtype: DType,
) -> Result<Vec<Tensor>> {
    assistant
        .residuals(images, noisy_latents, timesteps)?
        .into_iter()
        .map(|r| Ok((r.to_dtype(dtype)?.detach() * strength)?))
        .collect()
}

pub struct SDTrainer {
    model: Box<dyn DenoisingModel>,
    network: NetworkState,
    has_network: bool,
    adapter: Option<Adapter>,
    embedding: Option<TrainableEmbedding>,
    assistant: Option<Box<dyn AssistantAdapter>>,
    settings: TrainSettings,

    sampler: NoiseSampler,
    loss_engine: LossEngine,
    named_vars: Vec<(String, Var)>,
    optimizer: AdamW,
    accumulator: GradientAccumulator,
    lr_schedule: LrSchedule,
    rng: StdRng,
    step: usize,
}

impl SDTrainer {
    pub fn new(parts: TrainerParts, settings: TrainSettings) -> Result<Self> {
        if let Some(assistant) = &parts.assistant {
            if assistant.kind() == AssistantKind::ControlNet && settings.do_cfg {
                return Err(TrainingError::config("ControlNet assistant is not supported with CFG").into());
            }
        }

        let mut seen = HashSet::new();
        let mut named_vars = Vec::new();
        let mut candidates = parts.model.trainable_vars();
        if let Some(adapter) = &parts.adapter {
            candidates.extend(adapter.vars());
        }
        if let Some(embedding) = &parts.embedding {
            candidates.extend(embedding.vars());
        }
        for (name, var) in candidates {
            if seen.insert(var.as_tensor().id()) {
                named_vars.push((name, var));
            }
        }
        if named_vars.is_empty() {
            return Err(TrainingError::config("nothing to train: no network, adapter, embedding or text encoder").into());
        }
        let num_train_timesteps = parts.model.scheduler().num_train_timesteps();
        if settings.sampler.max_denoising_steps > num_train_timesteps {
            return Err(TrainingError::config(format!(
                "max_denoising_steps {} exceeds the scheduler's {} train timesteps",
                settings.sampler.max_denoising_steps, num_train_timesteps
            ))
            .into());
        }
        let vars: Vec<Var> = named_vars.iter().map(|(_, v)| v.clone()).collect();
        let num_params: usize = vars.iter().map(|v| v.elem_count()).sum();
        info!("Training {} tensors ({} parameters)", vars.len(), num_params);

        let scheduler = create_scheduler(settings.lr_scheduler, settings.lr, settings.lr_warmup_steps, settings.steps);
        let lr_schedule = LrSchedule::new(scheduler);
        let optimizer = AdamW::new(vars.clone(), settings.optimizer.params(lr_schedule.current_lr()))?;

        let device = parts.model.device().clone();
        let snr_weighting =
            SnrWeighting::from_config(settings.learnable_snr_gos, settings.snr_gamma, settings.min_snr_gamma, &device)?;
        let loss_engine = LossEngine::new(settings.loss.clone(), snr_weighting);
        let sampler = NoiseSampler::new(settings.sampler.clone(), settings.seed)?;
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_entropy(),
        };
        let network = if parts.has_network {
            NetworkState { is_active: false, multiplier: Multiplier::default() }
        } else {
            NetworkState::blank()
        };

        Ok(Self {
            model: parts.model,
            network,
            has_network: parts.has_network,
            adapter: parts.adapter,
            embedding: parts.embedding,
            assistant: parts.assistant,
            accumulator: GradientAccumulator::new(settings.gradient_accumulation_steps, vars),
            settings,
            sampler,
            loss_engine,
            named_vars,
            optimizer,
            lr_schedule,
            rng,
            step: 0,
        })
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn lr(&self) -> f64 {
        self.lr_schedule.current_lr()
    }

    pub fn stats(&self) -> &InstabilityStats {
        self.loss_engine.stats()
    }

    pub fn network(&self) -> &NetworkState {
        &self.network
    }

    pub fn model(&self) -> &dyn DenoisingModel {
        self.model.as_ref()
    }

    /// Trainable parameters by checkpoint name
    pub fn named_vars(&self) -> &[(String, Var)] {
        &self.named_vars
    }

    /// Resume bookkeeping after loading a checkpoint
    /// Move the step counter and the LR schedule to `step`
    pub fn set_step(&mut self, step: usize) {
        self.step = step;
        let lr = self.lr_schedule.set_step(step);
        self.optimizer.set_learning_rate(lr);
    }

    /// Captions with embedding tokens and the trigger word injected
    fn condition_prompts(&self, batch: &TrainingBatch) -> Vec<String> {
        let prompts = batch
            .file_items
            .iter()
            .map(|item| {
                let mut prompt = item.caption.clone();
                if let Some(embedding) = &self.embedding {
                    prompt = embedding.inject_embedding_to_prompt(&prompt, !item.is_reg);
                }
                inject_trigger_into_prompt(&prompt, self.settings.trigger_word.as_deref(), !item.is_reg)
            })
            .collect();
        match &self.adapter {
            Some(adapter) => adapter.condition_prompt(prompts),
            None => prompts,
        }
    }

    /// One negative prompt per item: 1..=max random picks from the pool joined with ", "
    fn negative_prompts(&mut self, n: usize) -> Vec<String> {
        let max = self.settings.max_negative_prompts;
        match &self.settings.negative_prompt_pool {
            Some(pool) if !pool.is_empty() => (0..n)
                .map(|_| {
                    let count = self.rng.gen_range(1..=max);
                    (0..count)
                        .filter_map(|_| pool.choose(&mut self.rng).cloned())
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .collect(),
            _ => vec![String::new(); n],
        }
    }

    /// Latents, guidance type, noise and per-step tensors
    fn prepare_step(&mut self, batch: &mut TrainingBatch) -> Result<(TrainingStepContext, StepFlags)> {
        let model = self.model.as_ref();
        let dtype = model.dtype();

        if batch.latents.is_none() {
            let pixels = batch
                .tensor
                .as_ref()
                .ok_or_else(|| TrainingError::data_contract("batch has neither latents nor pixels", batch.file_paths()))?;
            let latents = (model.encode_images(pixels)? * self.settings.latent_multiplier)?.detach();
            batch.latents = Some(latents);
        }
        batch.validate()?;

        let guidance = match batch.guidance_type()? {
            Some(g) => Some(g.parse::<GuidanceType>()?),
            None => None,
        };

        let loss_target = self.settings.sampler.loss_target;
        let unaugmented_pixels = match (&batch.unaugmented_tensor, loss_target.needs_unaugmented()) {
            (Some(pixels), true) => Some(pixels),
            (None, true) => {
                return Err(TrainingError::data_contract(
                    "loss target needs unaugmented images in the batch",
                    batch.file_paths(),
                )
                .into());
            }
            _ => None,
        };
        let unaugmented = match unaugmented_pixels {
            Some(pixels) if loss_target == LossTarget::DifferentialNoise => {
                Some((model.encode_images(pixels)? * self.settings.latent_multiplier)?.detach())
            }
            _ => None,
        };
        let latents = batch.latents_or_err()?.to_dtype(dtype)?;
        let sample = self.sampler.sample(model.scheduler(), &latents, unaugmented.as_ref())?;
        batch.latents = Some(sample.latents.clone());
        batch.sigmas = sample.sigmas.clone();

        let is_reg = batch.is_reg_list().iter().any(|r| *r);
        let has_clip_image = batch.clip_image_tensor.is_some();
        let has_adapter_img = batch.control_tensor.is_some();
        if let Some(adapter) = &self.adapter {
            if matches!(adapter.kind, AdapterKind::ImageConditioning(_)) && !has_clip_image && !is_reg && has_adapter_img {
                return Err(TrainingError::config(
                    "image conditioning adapters read clip images, not control images; set the clip image in the dataset",
                )
                .into());
            }
        }

        let match_adapter_assist = match &self.assistant {
            Some(_) if self.settings.match_adapter_chance >= 1.0 => true,
            Some(_) if self.settings.match_adapter_chance > 0.0 => self.rng.gen::<f64>() < self.settings.match_adapter_chance,
            _ => false,
        };

        let (_, _, h, w) = sample.noisy_latents.dims4()?;
        let mask_multiplier = match &batch.mask_tensor {
            Some(mask) => Some(mask.to_dtype(DType::F32)?.upsample_nearest2d(h, w)?.detach()),
            None => None,
        };
        let adapter_images = match &batch.control_tensor {
            Some(images) => {
                let images = images.to_dtype(dtype)?.detach();
                match &self.assistant {
                    Some(assistant) if images.dim(1)? != assistant.in_channels() => {
                        Some(images.narrow(1, 0, assistant.in_channels())?)
                    }
                    _ => Some(images),
                }
            }
            None => None,
        };
        let clip_images = match &batch.clip_image_tensor {
            Some(images) => Some(images.to_dtype(dtype)?.detach()),
            None => None,
        };

        let conditioned_prompts = self.condition_prompts(batch);
        let negative_prompts = if self.settings.do_cfg { self.negative_prompts(batch.len()) } else { vec![String::new(); batch.len()] };
        debug!("Conditioned prompts: {:?}", conditioned_prompts);

        let ctx = TrainingStepContext {
            timesteps: sample.timesteps,
            noise: sample.noise,
            noisy_latents: sample.noisy_latents,
            conditioned_prompts,
            negative_prompts,
            mask_multiplier,
            adapter_images,
            clip_images,
            network_weights: batch.network_weight_list(),
        };
        Ok((ctx, StepFlags { is_reg, match_adapter_assist, guidance }))
    }

    /// Encode, condition, run the prior if needed, then guidance or direct prediction and loss
    fn run_pass(&mut self, ctx: &TrainingStepContext, batch: &TrainingBatch, flags: StepFlags) -> Result<StepLoss> {
        let model = self.model.as_ref();
        let settings = &self.settings;
        let dtype = model.dtype();

        let mut network = StateGuard::new(&mut self.network);
        network.is_active = self.has_network;
        network.multiplier = Multiplier::PerItem(ctx.network_weights.clone());

        let grad_on_text_encoder = settings.train_text_encoder
            || self.embedding.is_some()
            || self.adapter.as_ref().map(|a| a.requires_trigger_substitution()).unwrap_or(false);
        let opts = EncodeOptions { dropout_prob: settings.prompt_dropout_prob, with_grad: grad_on_text_encoder };
        let mut conditional = model.encode_prompt(&ctx.conditioned_prompts, &opts)?.to_dtype(dtype)?;
        let mut unconditional = if settings.do_cfg {
            Some(model.encode_prompt(&ctx.negative_prompts, &opts)?.to_dtype(dtype)?)
        } else {
            None
        };

        let has_clip_image = ctx.clip_images.is_some() || flags.is_reg;
        let mut kwargs = PredictionKwargs::default();

        if let (Some(assistant), Some(images)) = (&self.assistant, &ctx.adapter_images) {
            if assistant.kind() == AssistantKind::T2I {
                let strength = adapter_strength(&mut self.rng, flags.match_adapter_assist);
                kwargs.down_intrablock_residuals = Some(assistant_residuals(
                    assistant.as_ref(),
                    images,
                    &ctx.noisy_latents,
                    &ctx.timesteps,
                    strength,
                    dtype,
                )?);
            }
        }

        if let Some(adapter) = self.adapter.as_mut() {
            if adapter.needs_clip_images() {
                let (images, drop) = if flags.is_reg {
                    (None, true)
                } else if let Some(images) = &ctx.clip_images {
                    (Some(images), false)
                } else {
                    return Err(TrainingError::data_contract("Could not find clip image", batch.file_paths()).into());
                };
                let base = if matches!(adapter.kind, AdapterKind::ImageConditioning(_)) { conditional.detach() } else { conditional };
                conditional = adapter.encode_conditioning(&base, images, drop)?;
                if let Some(u) = unconditional.take() {
                    unconditional = Some(adapter.encode_conditioning(&u.detach(), images, true)?);
                }
            } else if matches!(adapter.kind, AdapterKind::ReferenceConditioning(_)) {
                match ctx.clip_images.as_ref().or(ctx.adapter_images.as_ref()) {
                    Some(images) => adapter.set_reference_images(Some(images.affine(2.0, -1.0)?.detach())),
                    None if flags.is_reg => adapter.set_blank_reference_images(ctx.noisy_latents.dim(0)?, model.device(), dtype)?,
                    None => adapter.set_reference_images(None),
                }
            }
        }

        let do_prior = (ctx.adapter_images.is_some() && self.assistant.is_some() && flags.match_adapter_assist)
            || settings.loss.do_prior_divergence
            || flags.guidance.map(|g| g.requires_prior_baseline()).unwrap_or(false)
            || (flags.is_reg && (self.has_network || self.adapter.is_some()))
            || (settings.loss.inverted_mask_prior && batch.mask_tensor.is_some())
            || settings.loss.correct_pred_norm;

        let prior = if do_prior {
            let inputs = PriorInputs {
                noisy_latents: &ctx.noisy_latents,
                conditional: &conditional,
                unconditional: unconditional.as_ref(),
                timesteps: &ctx.timesteps,
                guidance_scale: settings.cfg_scale,
                rescale_cfg: settings.cfg_rescale,
                match_adapter_assist: flags.match_adapter_assist,
            };
            Some(predict_prior(
                model,
                &mut network,
                self.adapter.as_mut(),
                self.embedding.as_ref(),
                &mut kwargs,
                &inputs,
                batch,
            )?)
        } else {
            None
        };

        if let Some(adapter) = self.adapter.as_mut() {
            if matches!(adapter.kind, AdapterKind::CustomConditioning(_)) && has_clip_image {
                let images = ctx.clip_images.as_ref();
                conditional = adapter.encode_conditioning(&conditional, images, images.is_none())?;
                if let Some(u) = unconditional.take() {
                    unconditional = Some(adapter.encode_conditioning(&u, images, true)?);
                }
            }
        }

        if let (Some(assistant), Some(images)) = (&self.assistant, &ctx.adapter_images) {
            if assistant.kind() == AssistantKind::ControlNet {
                let strength = adapter_strength(&mut self.rng, flags.match_adapter_assist);
                let mut residuals = assistant_residuals(
                    assistant.as_ref(),
                    images,
                    &ctx.noisy_latents,
                    &ctx.timesteps,
                    strength,
                    dtype,
                )?;
                kwargs.mid_block_residual = residuals.pop();
                kwargs.down_block_residuals = Some(residuals);
            }
        }

        if batch.unconditional_latents.is_some() {
            // guidance losses ignore auxiliary adapter terms
            if let Some(adapter) = self.adapter.as_mut() {
                adapter.additional_loss();
            }
            let inputs = GuidanceInputs {
                conditional: &conditional,
                timesteps: &ctx.timesteps,
                noise: &ctx.noise,
                network_weights: &ctx.network_weights,
                kwargs: &kwargs,
            };
            let guidance_type = flags.guidance.unwrap_or(GuidanceType::Targeted);
            return guidance_loss(guidance_type, model, &mut network, self.adapter.as_ref(), &inputs, batch);
        }

        let forward = ForwardContext { network: &*network, adapter: self.adapter.as_ref(), training: true };
        let request = PredictionRequest {
            latents: &ctx.noisy_latents,
            conditional: &conditional,
            unconditional: unconditional.as_ref(),
            timesteps: &ctx.timesteps,
            guidance_scale: settings.cfg_scale,
            rescale_cfg: settings.cfg_rescale,
            kwargs: &kwargs,
        };
        let prediction = model.predict_noise(&forward, &request)?;

        let mut bundle = LossBundle::from_batch(batch, ctx.mask_multiplier.clone(), prior, settings.sampler.loss_target)?;
        bundle.additional_loss = self.adapter.as_mut().and_then(|a| a.additional_loss());
        let loss = self.loss_engine.compute_loss(
            model,
            &prediction,
            &ctx.noise,
            &ctx.noisy_latents,
            &ctx.timesteps,
            batch,
            &bundle,
        )?;
        Ok(StepLoss::Pending(loss))
    }

    /// NaN losses become a zero loss with an empty gradient; the event is counted
    fn finalize_loss(&mut self, loss: StepLoss, reg_multiplier: f64) -> Result<(f32, GradStore)> {
        let step = self.step;
        match loss {
            StepLoss::Pending(loss) => {
                let loss = if has_nan(&loss)? {
                    self.loss_engine.stats_mut().record_nan_loss(step);
                    loss.zeros_like()?
                } else {
                    loss
                };
                let loss = (loss * reg_multiplier)?;
                let grads = loss.backward()?;
                Ok((loss.to_dtype(DType::F32)?.to_scalar::<f32>()?, grads))
            }
            StepLoss::Backpropagated { value, grads } => {
                if value.is_nan() {
                    self.loss_engine.stats_mut().record_nan_loss(step);
                    let zero = Tensor::zeros((), DType::F32, self.model.device())?;
                    return Ok((0.0, zero.backward()?));
                }
                Ok((value * reg_multiplier as f32, grads))
            }
        }
    }

    fn restore_embeddings(&self) -> Result<()> {
        if let Some(embedding) = &self.embedding {
            embedding.restore_embeddings()?;
        }
        if let Some(adapter) = &self.adapter {
            adapter.restore_embeddings()?;
        }
        Ok(())
    }

    /// Run one training step on `batch`
    pub fn train_step(&mut self, batch: &mut TrainingBatch) -> Result<StepOutput> {
        let step = self.step;
        let (ctx, flags) = self.prepare_step(batch)?;

        let reg_weights: Vec<f64> = batch
            .is_reg_list()
            .iter()
            .map(|r| if *r { self.settings.reg_weight } else { 1.0 })
            .collect();
        let reg_multiplier = reg_weights.iter().sum::<f64>() / reg_weights.len().max(1) as f64;

        let mut losses = Vec::new();
        if self.settings.single_item_batching && batch.len() > 1 {
            for (i, sub_batch) in batch.split()?.iter().enumerate() {
                let sub_ctx = ctx.narrow(i)?;
                let loss = self.run_pass(&sub_ctx, sub_batch, flags)?;
                let (value, grads) = self.finalize_loss(loss, reg_multiplier)?;
                self.accumulator.accumulate(grads)?;
                losses.push(value);
            }
        } else {
            let loss = self.run_pass(&ctx, batch, flags)?;
            let (value, grads) = self.finalize_loss(loss, reg_multiplier)?;
            self.accumulator.accumulate(grads)?;
            losses.push(value);
        }

        let optimizer_stepped = !self.accumulator.is_accumulation_step(step);
        let mut grad_norm = None;
        if optimizer_stepped {
            if let Some(mut grads) = self.accumulator.take() {
                let norm = clip_grad_norm(&mut grads, self.accumulator.vars(), self.settings.max_grad_norm)?;
                self.optimizer.step(&grads)?;
                grad_norm = Some(norm);
            }
        }
        let lr = self.lr_schedule.step();
        self.optimizer.set_learning_rate(lr);
        self.restore_embeddings()?;

        self.step += 1;
        let loss = losses.iter().sum::<f32>() / losses.len().max(1) as f32;
        debug!("step {} loss {:.6} lr {:.2e} grad_norm {:?}", step, loss, lr, grad_norm);
        Ok(StepOutput { loss, lr, grad_norm, optimizer_stepped })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChannelResidualAssistant, LinearDenoiser, LinearDenoiserConfig};
    use crate::trainers::data_loader::FileItem;
    use crate::trainers::ddpm_scheduler::{BetaSchedule, DDPMScheduler, PredictionType};
    use crate::trainers::AdapterConfig;
    use candle_core::Device;

    fn settings(train: TrainConfig) -> Result<TrainSettings> {
        TrainSettings::from_config(&TrainConfig { seed: Some(3), ..train }, None)
    }

    fn trainer(
        settings: TrainSettings,
        adapter: Option<Adapter>,
        assistant: Option<Box<dyn AssistantAdapter>>,
    ) -> Result<SDTrainer> {
        let device = Device::Cpu;
        let scheduler = DDPMScheduler::new(1000, 0.00085, 0.012, BetaSchedule::ScaledLinear, PredictionType::Epsilon, &device)?;
        let model = LinearDenoiser::new(LinearDenoiserConfig::default(), scheduler, &device, DType::F32)?;
        SDTrainer::new(
            TrainerParts { model: Box::new(model), has_network: true, adapter, embedding: None, assistant },
            settings,
        )
    }

    fn batch(n: usize) -> Result<TrainingBatch> {
        let items = (0..n).map(|i| FileItem::new(format!("img_{}.png", i), format!("a photo {}", i))).collect();
        let mut batch = TrainingBatch::new(items);
        batch.latents = Some(Tensor::randn(0.0f32, 1.0, (n, 4, 8, 8), &Device::Cpu)?);
        Ok(batch)
    }

    fn lora_up(trainer: &SDTrainer) -> Result<Tensor> {
        trainer
            .named_vars()
            .iter()
            .find(|(name, _)| name.ends_with("lora_up.weight"))
            .map(|(_, v)| v.as_tensor().copy())
            .ok_or_else(|| anyhow::anyhow!("no lora_up"))?
            .map_err(Into::into)
    }

    #[test]
    fn test_nan_loss_is_replaced_by_zero() -> Result<()> {
        let mut trainer = trainer(settings(TrainConfig::default())?, None, None)?;
        let zero = Tensor::zeros(4, DType::F32, &Device::Cpu)?;
        let nan = (&zero / &zero)?.mean_all()?;
        let (value, _grads) = trainer.finalize_loss(StepLoss::Pending(nan), 1.0)?;
        assert_eq!(value, 0.0);
        assert_eq!(trainer.stats().nan_losses, 1);

        let mut batch = batch(2)?;
        let (ctx, _) = trainer.prepare_step(&mut batch)?;
        let zeros = ctx.noise.zeros_like()?;
        let nan_prediction = (&zeros / &zeros)?;
        let bundle = LossBundle::from_batch(&batch, None, None, LossTarget::Noise)?;
        let loss = trainer.loss_engine.compute_loss(
            trainer.model.as_ref(),
            &nan_prediction,
            &ctx.noise,
            &ctx.noisy_latents,
            &ctx.timesteps,
            &batch,
            &bundle,
        )?;
        let (value, _) = trainer.finalize_loss(StepLoss::Pending(loss), 1.0)?;
        assert_eq!(value, 0.0);
        assert_eq!(trainer.stats().nan_losses, 2);

        let grads = Tensor::zeros((), DType::F32, &Device::Cpu)?.backward()?;
        let (value, _) = trainer.finalize_loss(StepLoss::Backpropagated { value: f32::NAN, grads }, 1.0)?;
        assert_eq!(value, 0.0);
        assert_eq!(trainer.stats().nan_losses, 3);
        Ok(())
    }

    #[test]
    fn test_direct_loss_is_mse_of_prediction_and_noise() -> Result<()> {
        let mut trainer = trainer(settings(TrainConfig::default())?, None, None)?;
        let mut batch = batch(4)?;
        let (ctx, flags) = trainer.prepare_step(&mut batch)?;
        let loss = match trainer.run_pass(&ctx, &batch, flags)? {
            StepLoss::Pending(loss) => loss.to_scalar::<f32>()?,
            StepLoss::Backpropagated { .. } => anyhow::bail!("direct path must not backpropagate"),
        };
        assert!(!trainer.network().is_active);

        let model = trainer.model();
        let embeds = model.encode_prompt(&ctx.conditioned_prompts, &EncodeOptions::default())?;
        let active = NetworkState { is_active: true, multiplier: Multiplier::PerItem(ctx.network_weights.clone()) };
        let kwargs = PredictionKwargs::default();
        let prediction = model.predict_noise(
            &ForwardContext { network: &active, adapter: None, training: true },
            &PredictionRequest {
                latents: &ctx.noisy_latents,
                conditional: &embeds,
                unconditional: None,
                timesteps: &ctx.timesteps,
                guidance_scale: 1.0,
                rescale_cfg: None,
                kwargs: &kwargs,
            },
        )?;
        let expected = (prediction - &ctx.noise)?.sqr()?.mean_all()?.to_scalar::<f32>()?;
        assert!((loss - expected).abs() <= 1e-6 * expected.abs().max(1.0), "{} vs {}", loss, expected);
        Ok(())
    }

    #[test]
    fn test_all_zero_mask_gives_zero_loss() -> Result<()> {
        let mut trainer = trainer(settings(TrainConfig::default())?, None, None)?;
        let mut batch = batch(4)?;
        batch.mask_tensor = Some(Tensor::zeros((4, 1, 8, 8), DType::F32, &Device::Cpu)?);
        let output = trainer.train_step(&mut batch)?;
        assert_eq!(output.loss, 0.0);
        Ok(())
    }

    #[test]
    fn test_accumulation_delays_optimizer_step() -> Result<()> {
        let train = TrainConfig { gradient_accumulation_steps: 2, lr: 1e-2, ..Default::default() };
        let mut trainer = trainer(settings(train)?, None, None)?;
        let before = lora_up(&trainer)?;

        let first = trainer.train_step(&mut batch(2)?)?;
        assert!(!first.optimizer_stepped);
        let diff = (lora_up(&trainer)? - &before)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);

        let second = trainer.train_step(&mut batch(2)?)?;
        assert!(second.optimizer_stepped);
        assert!(second.grad_norm.is_some());
        let diff = (lora_up(&trainer)? - &before)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff > 0.0);
        assert_eq!(trainer.step(), 2);
        assert!(!trainer.network().is_active);
        Ok(())
    }

    #[test]
    fn test_set_step_moves_lr_schedule() -> Result<()> {
        let train = TrainConfig { lr: 1e-2, lr_scheduler: "linear".to_string(), steps: 10, ..Default::default() };
        let mut trainer = trainer(settings(train)?, None, None)?;
        assert!((trainer.lr() - 1e-2).abs() < 1e-12);

        trainer.set_step(5);
        assert_eq!(trainer.step(), 5);
        assert!((trainer.lr() - 5e-3).abs() < 1e-12);
        assert!((trainer.optimizer.learning_rate() - 5e-3).abs() < 1e-12);

        let output = trainer.train_step(&mut batch(2)?)?;
        assert_eq!(trainer.step(), 6);
        assert!((output.lr - 4e-3).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_max_denoising_steps_beyond_scheduler_is_rejected() -> Result<()> {
        let train = TrainConfig { max_denoising_steps: 2000, ..Default::default() };
        let err = match trainer(settings(train)?, None, None) {
            Ok(_) => anyhow::bail!("max_denoising_steps 2000 was accepted"),
            Err(e) => e,
        };
        assert!(matches!(err.downcast_ref::<TrainingError>(), Some(TrainingError::Configuration(_))));
        Ok(())
    }

    #[test]
    fn test_reg_items_weighted_by_reg_weight() -> Result<()> {
        let train = TrainConfig { reg_weight: 0.0, ..Default::default() };
        let mut trainer = trainer(settings(train)?, None, None)?;
        let mut batch = batch(2)?;
        for item in batch.file_items.iter_mut() {
            item.is_reg = true;
        }
        let output = trainer.train_step(&mut batch)?;
        assert_eq!(output.loss, 0.0);
        Ok(())
    }

    #[test]
    fn test_polarity_guidance_and_single_item_batching() -> Result<()> {
        let train = TrainConfig { single_item_batching: true, ..Default::default() };
        let mut trainer = trainer(settings(train)?, None, None)?;
        let mut batch = batch(2)?;
        batch.unconditional_latents = Some(Tensor::randn(0.0f32, 1.0, (2, 4, 8, 8), &Device::Cpu)?);
        for item in batch.file_items.iter_mut() {
            item.guidance_type = Some("polarity".to_string());
        }
        let output = trainer.train_step(&mut batch)?;
        assert!(output.loss.is_finite() && output.loss > 0.0);
        assert_eq!(trainer.network().multiplier, Multiplier::default());

        let mut bad = self::batch(1)?;
        bad.unconditional_latents = Some(Tensor::zeros((1, 4, 8, 8), DType::F32, &Device::Cpu)?);
        bad.file_items[0].guidance_type = Some("tnt".to_string());
        assert!(trainer.train_step(&mut bad).is_err());
        Ok(())
    }

    #[test]
    fn test_controlnet_with_cfg_is_rejected() -> Result<()> {
        let assistant = ChannelResidualAssistant::new(AssistantKind::ControlNet, 3, 4, &Device::Cpu, DType::F32)?;
        let train = TrainConfig { do_cfg: true, cfg_scale: 3.0, ..Default::default() };
        let err = trainer(settings(train)?, None, Some(Box::new(assistant))).err();
        assert!(err.map(|e| e.to_string().contains("ControlNet")).unwrap_or(false));
        Ok(())
    }

    #[test]
    fn test_t2i_assistant_with_cfg_and_negative_prompts() -> Result<()> {
        let assistant = ChannelResidualAssistant::new(AssistantKind::T2I, 3, 4, &Device::Cpu, DType::F32)?;
        let train = TrainConfig {
            do_cfg: true,
            cfg_scale: 2.0,
            negative_prompt: Some("blurry".to_string()),
            max_negative_prompts: 3,
            match_adapter_chance: 1.0,
            ..Default::default()
        };
        let mut trainer = trainer(settings(train)?, None, Some(Box::new(assistant)))?;
        let negatives = trainer.negative_prompts(8);
        assert!(negatives.iter().all(|n| {
            let parts: Vec<&str> = n.split(", ").collect();
            !parts.is_empty() && parts.len() <= 3 && parts.iter().all(|p| *p == "blurry")
        }));

        let mut batch = batch(2)?;
        batch.control_tensor = Some(Tensor::rand(0.0f32, 1.0, (2, 4, 64, 64), &Device::Cpu)?);
        let output = trainer.train_step(&mut batch)?;
        assert!(output.loss.is_finite());
        Ok(())
    }

    #[test]
    fn test_image_conditioning_without_clip_image_lists_files() -> Result<()> {
        let config = AdapterConfig { adapter_type: "ip".to_string(), num_tokens: 2, ..Default::default() };
        let adapter = Adapter::new(config, 32, 4, None, &Device::Cpu, DType::F32)?;
        let mut trainer = trainer(settings(TrainConfig::default())?, Some(adapter), None)?;
        let err = trainer.train_step(&mut batch(2)?).unwrap_err().to_string();
        assert!(err.contains("Could not find clip image"));
        assert!(err.contains("img_0.png") && err.contains("img_1.png"));

        let mut with_images = batch(2)?;
        with_images.clip_image_tensor = Some(Tensor::rand(0.0f32, 1.0, (2, 3, 32, 32), &Device::Cpu)?);
        assert!(trainer.train_step(&mut with_images)?.loss.is_finite());
        Ok(())
    }

    #[test]
    fn test_unknown_optimizer() {
        let train = TrainConfig { optimizer: "lion".to_string(), ..Default::default() };
        assert!(TrainSettings::from_config(&train, None).is_err());
    }
}
