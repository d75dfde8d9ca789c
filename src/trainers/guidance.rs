//! Contrastive guidance losses over paired conditional/unconditional latents
//!
//! Every strategy runs its own backward pass while the network state it needs is still in place
//! and hands the gradients back as [`StepLoss::Backpropagated`].

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor};
use log::debug;
use std::str::FromStr;

use super::data_loader::TrainingBatch;
use super::errors::TrainingError;
use crate::models::{
    concat_prompt_embeds, Adapter, DenoisingModel, ForwardContext, Multiplier, NetworkState, PredictionKwargs,
    PredictionRequest, PromptEmbeds, StateGuard,
};

/// Weight of the latent difference mixed into the targets of `targeted_polarity`
pub const DIFFERENTIAL_SCALER: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuidanceType {
    Targeted,
    Polarity,
    TargetedPolarity,
}

impl FromStr for GuidanceType {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "targeted" => Ok(Self::Targeted),
            "polarity" => Ok(Self::Polarity),
            "targeted_polarity" => Ok(Self::TargetedPolarity),
            other => Err(TrainingError::config(format!("unknown guidance_type: {}", other))),
        }
    }
}

impl GuidanceType {
    /// Each strategy computes its own baseline, none needs the prior oracle
    pub fn requires_prior_baseline(&self) -> bool {
        false
    }
}

/// Loss of one step or sub-step
pub enum StepLoss {
    /// Graph still attached; the caller runs backward
    Pending(Tensor),
    /// Backward already ran
    Backpropagated { value: f32, grads: GradStore },
}

impl StepLoss {
    pub fn value(&self) -> Result<f32> {
        match self {
            StepLoss::Pending(loss) => Ok(loss.to_dtype(DType::F32)?.to_scalar::<f32>()?),
            StepLoss::Backpropagated { value, .. } => Ok(*value),
        }
    }
}

pub struct GuidanceInputs<'a> {
    pub conditional: &'a PromptEmbeds,
    pub timesteps: &'a Tensor,
    pub noise: &'a Tensor,
    /// Per-item network weights of the batch
    pub network_weights: &'a [f64],
    pub kwargs: &'a PredictionKwargs,
}

fn per_item_mse(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    Ok((a.to_dtype(DType::F32)? - b.to_dtype(DType::F32)?)?.sqr()?.mean((1, 2, 3))?)
}

fn backpropagate(loss: Tensor) -> Result<StepLoss> {
    let grads = loss.backward()?;
    let value = loss.to_scalar::<f32>()?;
    Ok(StepLoss::Backpropagated { value, grads })
}

fn paired_latents(batch: &TrainingBatch, dtype: DType) -> Result<(Tensor, Tensor)> {
    let conditional = batch.latents_or_err()?.to_dtype(dtype)?.detach();
    let unconditional = batch
        .unconditional_latents
        .as_ref()
        .ok_or_else(|| TrainingError::data_contract("guidance needs unconditional latents", batch.file_paths()))?
        .to_dtype(dtype)?
        .detach();
    Ok((conditional, unconditional))
}

/// Dispatch on the batch guidance type, then backpropagate
pub fn guidance_loss(
    guidance_type: GuidanceType,
    model: &dyn DenoisingModel,
    network: &mut NetworkState,
    adapter: Option<&Adapter>,
    inputs: &GuidanceInputs<'_>,
    batch: &TrainingBatch,
) -> Result<StepLoss> {
    debug!("Guidance loss: {:?}", guidance_type);
    match guidance_type {
        GuidanceType::Targeted => targeted_loss(model, network, adapter, inputs, batch),
        GuidanceType::Polarity => polarity_loss(model, network, adapter, inputs, batch, false),
        GuidanceType::TargetedPolarity => polarity_loss(model, network, adapter, inputs, batch, true),
    }
}

/// Regress the prediction error onto the base model's error plus the latent difference, noised to the timestep
fn targeted_loss(
    model: &dyn DenoisingModel,
    network: &mut NetworkState,
    adapter: Option<&Adapter>,
    inputs: &GuidanceInputs<'_>,
    batch: &TrainingBatch,
) -> Result<StepLoss> {
    let dtype = model.dtype();
    let (conditional, unconditional) = paired_latents(batch, dtype)?;
    let noise = inputs.noise.to_dtype(dtype)?.detach();
    let embeds = inputs.conditional.detach();

    let diff = (&unconditional - &conditional)?;
    let diff_noise = model.add_noise(&diff.zeros_like()?, &diff, inputs.timesteps)?.detach();
    let target_noise = (&noise + &diff_noise)?;
    let noisy_latents = model.add_noise(&conditional, &target_noise, inputs.timesteps)?.detach();

    let mut network = StateGuard::new(network);
    network.is_active = false;
    let request = PredictionRequest {
        latents: &noisy_latents,
        conditional: &embeds,
        unconditional: None,
        timesteps: inputs.timesteps,
        guidance_scale: 1.0,
        rescale_cfg: None,
        kwargs: inputs.kwargs,
    };
    let baseline = model
        .predict_noise(&ForwardContext { network: &*network, adapter, training: false }, &request)?
        .detach();
    let target = ((baseline - &noise)? + &diff_noise)?.detach();

    network.is_active = true;
    network.multiplier = Multiplier::PerItem(inputs.network_weights.to_vec());
    let prediction = model.predict_noise(&ForwardContext { network: &*network, adapter, training: true }, &request)?;

    let loss = per_item_mse(&(prediction - &noise)?, &target)?.mean_all()?;
    backpropagate(loss)
}

/// One doubled forward pass at `+weights` for conditional latents and `-weights` for unconditional ones.
/// With `targeted`, each branch's noise carries the scaled latent difference toward the other side.
fn polarity_loss(
    model: &dyn DenoisingModel,
    network: &mut NetworkState,
    adapter: Option<&Adapter>,
    inputs: &GuidanceInputs<'_>,
    batch: &TrainingBatch,
    targeted: bool,
) -> Result<StepLoss> {
    let dtype = model.dtype();
    let (conditional, unconditional) = paired_latents(batch, dtype)?;
    let noise = inputs.noise.to_dtype(dtype)?.detach();

    let (conditional_noise, unconditional_noise) = if targeted {
        let toward_unconditional = ((&unconditional - &conditional)? * DIFFERENTIAL_SCALER)?;
        let toward_conditional = ((&conditional - &unconditional)? * DIFFERENTIAL_SCALER)?;
        ((&noise + toward_unconditional)?.detach(), (&noise + toward_conditional)?.detach())
    } else {
        (noise.clone(), noise.clone())
    };

    let conditional_noisy = model.add_noise(&conditional, &conditional_noise, inputs.timesteps)?;
    let unconditional_noisy = model.add_noise(&unconditional, &unconditional_noise, inputs.timesteps)?;
    let latents = Tensor::cat(&[&conditional_noisy, &unconditional_noisy], 0)?.detach();
    let embeds = concat_prompt_embeds(&[inputs.conditional, inputs.conditional])?.detach();
    let timesteps = Tensor::cat(&[inputs.timesteps, inputs.timesteps], 0)?;
    let kwargs = inputs.kwargs.repeat_batch(2)?;

    let mut network = StateGuard::new(network);
    network.is_active = true;
    network.multiplier = Multiplier::polarized(inputs.network_weights);

    let request = PredictionRequest {
        latents: &latents,
        conditional: &embeds,
        unconditional: None,
        timesteps: &timesteps,
        guidance_scale: 1.0,
        rescale_cfg: None,
        kwargs: &kwargs,
    };
    let prediction = model.predict_noise(&ForwardContext { network: &*network, adapter, training: true }, &request)?;

    let n = conditional.dim(0)?;
    let pred_pos = prediction.narrow(0, 0, n)?;
    let pred_neg = prediction.narrow(0, n, n)?;
    let loss = (per_item_mse(&pred_pos, &conditional_noise)? + per_item_mse(&pred_neg, &unconditional_noise)?)?.mean_all()?;
    backpropagate(loss)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EncodeOptions, LinearDenoiser, LinearDenoiserConfig};
    use crate::trainers::data_loader::FileItem;
    use crate::trainers::ddpm_scheduler::{BetaSchedule, DDPMScheduler, PredictionType};
    use candle_core::{Device, Var};
    use std::cell::RefCell;

    fn linear() -> Result<LinearDenoiser> {
        let device = Device::Cpu;
        let scheduler = DDPMScheduler::new(1000, 0.00085, 0.012, BetaSchedule::ScaledLinear, PredictionType::Epsilon, &device)?;
        LinearDenoiser::new(LinearDenoiserConfig::default(), scheduler, &device, DType::F32)
    }

    /// Records batch size, activation and multiplier of every forward pass
    struct RecordingModel {
        inner: LinearDenoiser,
        calls: RefCell<Vec<(usize, bool, Multiplier)>>,
    }

    impl DenoisingModel for RecordingModel {
        fn scheduler(&self) -> &DDPMScheduler {
            self.inner.scheduler()
        }
        fn device(&self) -> &Device {
            self.inner.device()
        }
        fn dtype(&self) -> DType {
            self.inner.dtype()
        }
        fn encode_prompt(&self, prompts: &[String], opts: &EncodeOptions) -> Result<PromptEmbeds> {
            self.inner.encode_prompt(prompts, opts)
        }
        fn encode_images(&self, pixels: &Tensor) -> Result<Tensor> {
            self.inner.encode_images(pixels)
        }
        fn predict_noise(&self, ctx: &ForwardContext<'_>, req: &PredictionRequest<'_>) -> Result<Tensor> {
            self.calls
                .borrow_mut()
                .push((req.latents.dim(0)?, ctx.network.is_active, ctx.network.multiplier.clone()));
            self.inner.predict_noise(ctx, req)
        }
        fn trainable_vars(&self) -> Vec<(String, Var)> {
            self.inner.trainable_vars()
        }
    }

    fn paired_batch(n: usize) -> Result<TrainingBatch> {
        let device = Device::Cpu;
        let items = (0..n).map(|i| FileItem::new(format!("{}.png", i), "a photo")).collect();
        let mut batch = TrainingBatch::new(items);
        batch.latents = Some(Tensor::randn(0.0f32, 1.0, (n, 4, 8, 8), &device)?);
        batch.unconditional_latents = Some(Tensor::randn(0.0f32, 1.0, (n, 4, 8, 8), &device)?);
        Ok(batch)
    }

    fn run(guidance_type: GuidanceType, model: &RecordingModel, network: &mut NetworkState, batch: &TrainingBatch) -> Result<StepLoss> {
        let n = batch.len();
        let embeds = model.encode_prompt(&batch.caption_list(), &EncodeOptions::default())?;
        let noise = Tensor::randn(0.0f32, 1.0, (n, 4, 8, 8), &Device::Cpu)?;
        let timesteps = Tensor::from_vec(vec![400i64; n], n, &Device::Cpu)?;
        let weights = vec![1.0; n];
        let kwargs = PredictionKwargs::default();
        let inputs = GuidanceInputs {
            conditional: &embeds,
            timesteps: &timesteps,
            noise: &noise,
            network_weights: &weights,
            kwargs: &kwargs,
        };
        guidance_loss(guidance_type, model, network, None, &inputs, batch)
    }

    #[test]
    fn test_polarity_runs_one_doubled_pass_and_restores_multiplier() -> Result<()> {
        let model = RecordingModel { inner: linear()?, calls: RefCell::new(Vec::new()) };
        let batch = paired_batch(3)?;
        let mut network = NetworkState { is_active: true, multiplier: Multiplier::Scalar(0.6) };

        let loss = run(GuidanceType::Polarity, &model, &mut network, &batch)?;
        let calls = model.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, 6);
        assert!(calls[0].1);
        assert_eq!(calls[0].2, Multiplier::PerItem(vec![1.0, 1.0, 1.0, -1.0, -1.0, -1.0]));
        assert_eq!(network.multiplier, Multiplier::Scalar(0.6));

        match loss {
            StepLoss::Backpropagated { value, grads } => {
                assert!(value.is_finite() && value > 0.0);
                let lora = model.inner.lora().ok_or_else(|| anyhow::anyhow!("no lora"))?;
                assert!(grads.get(lora.up.as_tensor()).is_some());
            }
            StepLoss::Pending(_) => anyhow::bail!("polarity must backpropagate itself"),
        }
        Ok(())
    }

    #[test]
    fn test_targeted_runs_baseline_then_network() -> Result<()> {
        let model = RecordingModel { inner: linear()?, calls: RefCell::new(Vec::new()) };
        let batch = paired_batch(2)?;
        let mut network = NetworkState::default();
        let loss = run(GuidanceType::Targeted, &model, &mut network, &batch)?;
        let calls = model.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!((calls[0].0, calls[0].1), (2, false));
        assert_eq!((calls[1].0, calls[1].1), (2, true));
        assert!(loss.value()?.is_finite());
        assert_eq!(network, NetworkState::default());
        Ok(())
    }

    #[test]
    fn test_targeted_polarity_needs_unconditional_latents() -> Result<()> {
        let model = RecordingModel { inner: linear()?, calls: RefCell::new(Vec::new()) };
        let mut batch = paired_batch(2)?;
        batch.unconditional_latents = None;
        let mut network = NetworkState::default();
        let err = run(GuidanceType::TargetedPolarity, &model, &mut network, &batch).err();
        assert!(err.map(|e| e.to_string().contains("unconditional")).unwrap_or(false));
        Ok(())
    }

    #[test]
    fn test_unknown_guidance_type() {
        assert!(matches!("contrastive".parse::<GuidanceType>(), Err(TrainingError::Configuration(_))));
        assert!(!GuidanceType::TargetedPolarity.requires_prior_baseline());
    }
}
