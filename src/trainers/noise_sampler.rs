//! Timestep and noise sampling for one training step

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::str::FromStr;

use super::ddpm_scheduler::DDPMScheduler;
use super::errors::TrainingError;
use super::training_helpers::value_map;

/// How timesteps are distributed over `[min_denoising_steps, max_denoising_steps)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestepPolicy {
    /// Uniform
    Balanced,
    /// `u^3 * T`: small timesteps, the late low-noise end of sampling
    Style,
    /// `(1 - u^3) * T`: large timesteps, the early high-noise end of sampling
    Content,
}

impl FromStr for TimestepPolicy {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "balanced" => Ok(Self::Balanced),
            "style" => Ok(Self::Style),
            "content" => Ok(Self::Content),
            other => Err(TrainingError::config(format!("unknown content_or_style: {}", other))),
        }
    }
}

/// Space the loss is computed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossTarget {
    Noise,
    Velocity,
    Source,
    Unaugmented,
    DifferentialNoise,
}

impl FromStr for LossTarget {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "noise" => Ok(Self::Noise),
            "velocity" => Ok(Self::Velocity),
            "source" => Ok(Self::Source),
            "unaugmented" => Ok(Self::Unaugmented),
            "differential_noise" | "differential" => Ok(Self::DifferentialNoise),
            other => Err(TrainingError::config(format!("unknown loss_target: {}", other))),
        }
    }
}

impl LossTarget {
    /// Targets that reconstruct the denoised latent and need per-item sigmas
    pub fn needs_sigmas(&self) -> bool {
        matches!(self, Self::Source | Self::Unaugmented)
    }

    pub fn needs_unaugmented(&self) -> bool {
        matches!(self, Self::Unaugmented | Self::DifferentialNoise)
    }
}

#[derive(Debug, Clone)]
pub struct NoiseSamplerConfig {
    pub policy: TimestepPolicy,
    pub min_denoising_steps: usize,
    pub max_denoising_steps: usize,
    pub noise_offset: f64,
    pub noise_multiplier: f64,
    pub img_multiplier: f64,
    pub loss_target: LossTarget,
}

impl Default for NoiseSamplerConfig {
    fn default() -> Self {
        Self {
            policy: TimestepPolicy::Balanced,
            min_denoising_steps: 0,
            max_denoising_steps: 1000,
            noise_offset: 0.0,
            noise_multiplier: 1.0,
            img_multiplier: 1.0,
            loss_target: LossTarget::Noise,
        }
    }
}

/// Output of [`NoiseSampler::sample`]
pub struct NoisySample {
    pub noisy_latents: Tensor,
    pub noise: Tensor,
    /// `[batch]`, I64
    pub timesteps: Tensor,
    /// Clean latents after the image multiplier; unaugmented for `differential_noise`
    pub latents: Tensor,
    /// Present for `source` and `unaugmented` targets
    pub sigmas: Option<Tensor>,
}

pub struct NoiseSampler {
    config: NoiseSamplerConfig,
    rng: StdRng,
}

impl NoiseSampler {
    pub fn new(config: NoiseSamplerConfig, seed: Option<u64>) -> Result<Self> {
        if config.max_denoising_steps < config.min_denoising_steps + 3 {
            return Err(TrainingError::config(format!(
                "denoising step range [{}, {}) leaves no interior timestep",
                config.min_denoising_steps, config.max_denoising_steps
            ))
            .into());
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self { config, rng })
    }

    pub fn config(&self) -> &NoiseSamplerConfig {
        &self.config
    }

    /// Timesteps inside `[min + 1, max - 1]`
    pub fn sample_timesteps(&mut self, batch_size: usize, num_train_timesteps: usize) -> Vec<i64> {
        let min = self.config.min_denoising_steps as f64;
        let max = self.config.max_denoising_steps as f64;
        let total = num_train_timesteps as f64;
        let lo = self.config.min_denoising_steps as i64 + 1;
        let hi = self.config.max_denoising_steps as i64 - 1;

        (0..batch_size)
            .map(|_| {
                let t = match self.config.policy {
                    TimestepPolicy::Balanced => {
                        self.rng.gen_range(self.config.min_denoising_steps..self.config.max_denoising_steps) as i64
                    }
                    TimestepPolicy::Style | TimestepPolicy::Content => {
                        let u: f64 = self.rng.gen();
                        let warped = if self.config.policy == TimestepPolicy::Style {
                            u.powi(3) * total
                        } else {
                            (1.0 - u.powi(3)) * total
                        };
                        value_map(warped, 0.0, total - 1.0, min, max) as i64
                    }
                };
                t.clamp(lo, hi)
            })
            .collect()
    }

    /// Standard normal noise plus `noise_offset * randn(b, c, 1, 1)`
    pub fn sample_noise(&mut self, shape: (usize, usize, usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let (b, c, h, w) = shape;
        let values: Vec<f32> = (0..b * c * h * w).map(|_| self.rng.sample(StandardNormal)).collect();
        let mut noise = Tensor::from_vec(values, (b, c, h, w), device)?;
        if self.config.noise_offset != 0.0 {
            let offset: Vec<f32> = (0..b * c).map(|_| self.rng.sample(StandardNormal)).collect();
            let offset = (Tensor::from_vec(offset, (b, c, 1, 1), device)? * self.config.noise_offset)?;
            noise = noise.broadcast_add(&offset)?;
        }
        Ok(noise.to_dtype(dtype)?)
    }

    /// Draw timesteps and noise for `latents` and noise them with `scheduler`
    pub fn sample(&mut self, scheduler: &DDPMScheduler, latents: &Tensor, unaugmented_latents: Option<&Tensor>) -> Result<NoisySample> {
        let (b, c, h, w) = latents.dims4()?;
        let device = latents.device();
        let dtype = latents.dtype();

        let timesteps = self.sample_timesteps(b, scheduler.num_train_timesteps());
        let timesteps = Tensor::from_vec(timesteps, b, device)?;

        let mut noise = self.sample_noise((b, c, h, w), device, dtype)?;
        let mut latents = latents.clone();

        if self.config.loss_target == LossTarget::DifferentialNoise {
            let unaugmented = unaugmented_latents.ok_or_else(|| {
                TrainingError::data_contract("differential_noise needs unaugmented latents", Vec::new())
            })?;
            let unaugmented = unaugmented.to_dtype(dtype)?;
            let differential = (&latents - &unaugmented)?;
            noise = (noise + (differential * 0.5)?)?;
            latents = unaugmented;
        }

        let noise = (noise * self.config.noise_multiplier)?.detach();
        let latents = (latents * self.config.img_multiplier)?.detach();
        let noisy_latents = scheduler.add_noise(&latents, &noise, &timesteps)?.detach();

        let sigmas = if self.config.loss_target.needs_sigmas() {
            Some(scheduler.get_sigmas(&timesteps, noisy_latents.rank(), noisy_latents.dtype())?)
        } else {
            None
        };

        Ok(NoisySample { noisy_latents, noise, timesteps, latents, sigmas })
    }
}
