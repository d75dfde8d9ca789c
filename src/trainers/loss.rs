//! Loss pipeline: prediction adjustments, target selection, elementwise error,
//! prior terms, masking, SNR weighting and reduction.
//!
//! All arithmetic runs in F32 regardless of the model dtype.

use anyhow::Result;
use candle_core::{DType, Tensor};
use std::str::FromStr;

use super::data_loader::TrainingBatch;
use super::errors::{InstabilityStats, TrainingError};
use super::noise_sampler::LossTarget;
use super::snr_weighting::SnrWeighting;
use super::training_helpers::value_map_tensor;
use crate::models::DenoisingModel;

const NORM_EPS: f64 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossType {
    Mse,
    Mae,
}

impl FromStr for LossType {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mse" => Ok(Self::Mse),
            "mae" | "l1" => Ok(Self::Mae),
            other => Err(TrainingError::config(format!("unknown loss_type: {}", other))),
        }
    }
}

impl LossType {
    /// Unreduced error between `a` and `b`
    pub fn elementwise(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        let diff = (a - b)?;
        Ok(match self {
            LossType::Mse => diff.sqr()?,
            LossType::Mae => diff.abs()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LossConfig {
    pub loss_type: LossType,
    pub match_noise_norm: bool,
    pub pred_scaler: f64,
    pub correct_pred_norm: bool,
    pub correct_pred_norm_multiplier: f64,
    pub inverted_mask_prior: bool,
    pub inverted_mask_prior_multiplier: f64,
    pub do_prior_divergence: bool,
    pub latent_multiplier: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            loss_type: LossType::Mse,
            match_noise_norm: false,
            pred_scaler: 1.0,
            correct_pred_norm: false,
            correct_pred_norm_multiplier: 1.0,
            inverted_mask_prior: false,
            inverted_mask_prior_multiplier: 0.5,
            do_prior_divergence: false,
            latent_multiplier: 1.0,
        }
    }
}

/// Modifiers for one loss computation. Built fresh every step.
#[derive(Debug, Clone)]
pub struct LossBundle {
    /// Per-pixel weight, broadcastable to the prediction
    pub mask_multiplier: Option<Tensor>,
    /// `[batch]`
    pub loss_multiplier: Tensor,
    pub prior_prediction: Option<Tensor>,
    pub target_kind: LossTarget,
    /// Lower end of the mask range for the inverted mask prior
    pub mask_min_value: f64,
    /// Auxiliary adapter loss, added after reduction
    pub additional_loss: Option<Tensor>,
}

impl LossBundle {
    pub fn from_batch(
        batch: &TrainingBatch,
        mask_multiplier: Option<Tensor>,
        prior_prediction: Option<Tensor>,
        target_kind: LossTarget,
    ) -> Result<Self> {
        let device = batch.device()?;
        let multipliers: Vec<f32> = batch.loss_multiplier_list().into_iter().map(|m| m as f32).collect();
        let n = multipliers.len();
        Ok(Self {
            mask_multiplier,
            loss_multiplier: Tensor::from_vec(multipliers, n, &device)?,
            prior_prediction,
            target_kind,
            mask_min_value: batch.file_items.first().map(|f| f.mask_min_value).unwrap_or(0.0),
            additional_loss: None,
        })
    }
}

/// Per-item, per-channel spatial mean and unbiased std, each `[b, c, 1, 1]`
fn spatial_mean_std(t: &Tensor) -> Result<(Tensor, Tensor)> {
    let (b, c, h, w) = t.dims4()?;
    let flat = t.reshape((b, c, h * w))?;
    let mean = flat.mean_keepdim(2)?.reshape((b, c, 1, 1))?;
    let std = flat.var_keepdim(2)?.sqrt()?.reshape((b, c, 1, 1))?;
    Ok((mean, std))
}

/// Per-item L2 norm over every non-batch dim, `[b, 1, 1, 1]`
fn item_norm(t: &Tensor) -> Result<Tensor> {
    Ok(t.sqr()?.sum_keepdim((1, 2, 3))?.sqrt()?)
}

pub fn has_nan(t: &Tensor) -> Result<bool> {
    let nan_count = t.ne(t)?.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?;
    Ok(nan_count > 0.0)
}

pub struct LossEngine {
    config: LossConfig,
    snr_weighting: SnrWeighting,
    stats: InstabilityStats,
}

impl LossEngine {
    pub fn new(config: LossConfig, snr_weighting: SnrWeighting) -> Self {
        Self { config, snr_weighting, stats: InstabilityStats::default() }
    }

    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    pub fn stats(&self) -> &InstabilityStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut InstabilityStats {
        &mut self.stats
    }

    /// Noise renormalized toward the prior's spatial statistics
    fn correct_noise_norm(&self, noise: &Tensor, prediction: &Tensor, prior: &Tensor) -> Result<Tensor> {
        let (prior_mean, prior_std) = spatial_mean_std(&prior.detach())?;
        let (pred_mean, pred_std) = spatial_mean_std(&prediction.detach())?;
        let m = self.config.correct_pred_norm_multiplier;

        let target_mean = (&pred_mean + ((prior_mean - &pred_mean)? * m)?)?;
        let target_std = (&pred_std + ((prior_std - &pred_std)? * m)?)?;

        let normalized = noise.broadcast_sub(&pred_mean)?.broadcast_div(&(pred_std + NORM_EPS)?)?;
        let corrected = normalized.broadcast_mul(&(target_std + NORM_EPS)?)?.broadcast_add(&target_mean)?;
        Ok(corrected.detach())
    }

    /// Scalar F32 loss. May be NaN; the caller decides how to recover.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_loss(
        &mut self,
        model: &dyn DenoisingModel,
        prediction: &Tensor,
        noise: &Tensor,
        noisy_latents: &Tensor,
        timesteps: &Tensor,
        batch: &TrainingBatch,
        bundle: &LossBundle,
    ) -> Result<Tensor> {
        let scheduler = model.scheduler();
        let is_reg = batch.is_reg_list().iter().any(|r| *r);
        let has_mask = bundle.mask_multiplier.is_some();
        let prior = match &bundle.prior_prediction {
            Some(p) => Some(p.to_dtype(DType::F32)?.detach()),
            None => None,
        };

        let mut pred = prediction.to_dtype(DType::F32)?;
        let mut noise = noise.to_dtype(DType::F32)?.detach();
        let noisy_latents = noisy_latents.to_dtype(DType::F32)?;

        if self.config.match_noise_norm {
            let ratio = (item_norm(&noise)? / item_norm(&pred)?)?;
            pred = pred.broadcast_mul(&ratio)?;
        }

        if self.config.pred_scaler != 1.0 {
            pred = (pred * self.config.pred_scaler)?;
        }

        let inverted_prior_active = self.config.inverted_mask_prior && prior.is_some() && has_mask;
        let mut prior_mask: Option<Tensor> = None;
        let target = if self.config.correct_pred_norm || inverted_prior_active {
            if self.config.correct_pred_norm && !is_reg {
                if let Some(prior) = &prior {
                    noise = self.correct_noise_norm(&noise, &pred, prior)?;
                }
            }
            if let (true, Some(mask)) = (inverted_prior_active, &bundle.mask_multiplier) {
                if bundle.mask_min_value >= 1.0 {
                    return Err(TrainingError::config(format!(
                        "mask_min_value must be below 1.0 for the inverted mask prior, got {}",
                        bundle.mask_min_value
                    ))
                    .into());
                }
                let stretched = value_map_tensor(&mask.to_dtype(DType::F32)?, bundle.mask_min_value, 1.0, 0.0, 1.0)?;
                prior_mask = Some(stretched.affine(-1.0, 1.0)?.detach());
            }
            noise.clone()
        } else if let (Some(prior), false) = (&prior, self.config.do_prior_divergence) {
            prior.clone()
        } else if scheduler.is_v_prediction() || bundle.target_kind == LossTarget::Velocity {
            let latents = batch.latents_or_err()?.to_dtype(DType::F32)?;
            scheduler.get_velocity(&latents, &noise, timesteps)?
        } else {
            noise.clone()
        };

        let mut loss = if bundle.target_kind.needs_sigmas() {
            let sigmas = batch
                .sigmas
                .as_ref()
                .ok_or_else(|| TrainingError::data_contract("batch sigmas are missing for a source-space loss", batch.file_paths()))?
                .to_dtype(DType::F32)?;
            let denoised = (pred.broadcast_mul(&sigmas.neg()?)? + &noisy_latents)?;
            let weighting = sigmas.powf(-2.0)?;
            let target = if bundle.target_kind == LossTarget::Source {
                batch.latents_or_err()?.to_dtype(DType::F32)?
            } else {
                let pixels = batch.unaugmented_tensor.as_ref().ok_or_else(|| {
                    TrainingError::data_contract("unaugmented loss target needs unaugmented images", batch.file_paths())
                })?;
                let unaugmented = (model.encode_images(pixels)?.to_dtype(DType::F32)? * self.config.latent_multiplier)?.detach();
                if scheduler.is_v_prediction() {
                    scheduler.get_velocity(&unaugmented, &noise, timesteps)?
                } else {
                    unaugmented
                }
            };
            (denoised - target)?.sqr()?.broadcast_mul(&weighting)?
        } else {
            self.config.loss_type.elementwise(&pred, &target)?
        };

        // Rewards moving away from the base model; the negative sign is intended.
        if let (true, Some(prior)) = (self.config.do_prior_divergence, &prior) {
            loss = (loss - (&pred - prior)?.sqr()?)?;
        }

        if let Some(mask) = &bundle.mask_multiplier {
            loss = loss.broadcast_mul(&mask.to_dtype(DType::F32)?)?;
        }

        let mut prior_loss = None;
        if let (Some(prior), Some(prior_mask)) = (&prior, &prior_mask) {
            let term = self
                .config
                .loss_type
                .elementwise(&pred, prior)?
                .broadcast_mul(prior_mask)?
                .affine(self.config.inverted_mask_prior_multiplier, 0.0)?;
            if has_nan(&term)? {
                self.stats.record_nan_prior_loss();
            } else {
                prior_loss = Some(term.mean((1, 2, 3))?);
            }
        }

        let loss_multiplier = bundle.loss_multiplier.to_dtype(DType::F32)?;
        let mut loss = loss.mean((1, 2, 3))?.broadcast_mul(&loss_multiplier)?;
        if let Some(prior_loss) = prior_loss {
            loss = (loss + prior_loss)?;
        }

        let loss = self.snr_weighting.apply(&loss, timesteps, scheduler)?;
        let mut loss = loss.mean_all()?;

        if let Some(additional) = &bundle.additional_loss {
            loss = (loss + additional.to_dtype(DType::F32)?.mean_all()?)?;
        }

        Ok(loss)
    }
}
