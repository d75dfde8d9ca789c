//! Baseline prediction of the unadapted model

use anyhow::Result;
use candle_core::Tensor;
use log::debug;

use super::data_loader::TrainingBatch;
use crate::models::prompt::{remove_embedding_tokens, substitute_triggers};
use crate::models::{
    Adapter, DenoisingModel, EncodeOptions, ForwardContext, NetworkState, PredictionKwargs, PredictionRequest,
    PromptEmbeds, StateGuard, TrainableEmbedding,
};

/// Tensors of the current step the baseline pass runs on
pub struct PriorInputs<'a> {
    pub noisy_latents: &'a Tensor,
    pub conditional: &'a PromptEmbeds,
    pub unconditional: Option<&'a PromptEmbeds>,
    pub timesteps: &'a Tensor,
    pub guidance_scale: f64,
    pub rescale_cfg: Option<f64>,
    /// Drop assistant residuals from `kwargs` once the baseline is computed
    pub match_adapter_assist: bool,
}

/// Captions with every trigger form replaced by the class name and the extra embedding tokens removed
fn baseline_prompts(batch: &TrainingBatch, embedding: Option<&TrainableEmbedding>, adapter: Option<&Adapter>) -> Vec<String> {
    let mut triggers: Vec<&str> = Vec::new();
    let mut class_name = "";

    if let Some(embedding) = embedding {
        triggers.push(&embedding.trigger);
        if let Some(name) = &embedding.trigger_class_name {
            class_name = name;
        }
    }
    if let Some(adapter) = adapter {
        triggers.extend(adapter.trigger());
        if let Some(name) = &adapter.config.trigger_class_name {
            class_name = name;
        }
    }

    batch
        .caption_list()
        .into_iter()
        .map(|caption| {
            // token words go first so `sks_1` never becomes `dog_1`
            let stripped = triggers.iter().fold(caption, |prompt, trigger| remove_embedding_tokens(&prompt, trigger));
            substitute_triggers(&stripped, &triggers, class_name).split_whitespace().collect::<Vec<_>>().join(" ")
        })
        .collect()
}

/// Predict what the model does with the trainable network and any disableable adapter switched off.
///
/// Both activation flags are restored before returning, on the error path too.
/// With `match_adapter_assist`, assistant residuals are removed from `kwargs` afterwards.
pub fn predict_prior(
    model: &dyn DenoisingModel,
    network: &mut NetworkState,
    adapter: Option<&mut Adapter>,
    embedding: Option<&TrainableEmbedding>,
    kwargs: &mut PredictionKwargs,
    inputs: &PriorInputs<'_>,
    batch: &TrainingBatch,
) -> Result<Tensor> {
    let mut network = StateGuard::new(network);
    network.is_active = false;

    let mut adapter = adapter.map(|a| a.activation_guard());
    if let Some(adapter) = adapter.as_mut() {
        if adapter.can_disable() {
            adapter.is_active = false;
        }
    }
    let adapter_ref: Option<&Adapter> = adapter.as_deref();

    let substitute = embedding.is_some() || adapter_ref.map(|a| a.requires_trigger_substitution()).unwrap_or(false);
    let (conditional, reencoded) = if substitute {
        let prompts = baseline_prompts(batch, embedding, adapter_ref);
        debug!("Prior prompts: {:?}", prompts);
        (model.encode_prompt(&prompts, &EncodeOptions::default())?, true)
    } else {
        (inputs.conditional.detach(), false)
    };

    let strip = adapter_ref.map(|a| a.appended_token_count()).unwrap_or(0);
    let conditional = if reencoded { conditional } else { conditional.strip_trailing_tokens(strip)? };
    let unconditional = match inputs.unconditional {
        Some(u) => Some(u.detach().strip_trailing_tokens(strip)?),
        None => None,
    };

    let ctx = ForwardContext { network: &*network, adapter: adapter_ref, training: false };
    let request = PredictionRequest {
        latents: &inputs.noisy_latents.detach(),
        conditional: &conditional.to_dtype(model.dtype())?,
        unconditional: unconditional.as_ref(),
        timesteps: inputs.timesteps,
        guidance_scale: inputs.guidance_scale,
        rescale_cfg: inputs.rescale_cfg,
        kwargs,
    };
    let prior = model.predict_noise(&ctx, &request)?.detach();

    if inputs.match_adapter_assist {
        kwargs.strip_assistant_residuals();
    }
    Ok(prior)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LinearDenoiser, LinearDenoiserConfig, Multiplier};
    use crate::trainers::data_loader::FileItem;
    use crate::trainers::ddpm_scheduler::{BetaSchedule, DDPMScheduler, PredictionType};
    use crate::trainers::AdapterConfig;
    use candle_core::{DType, Device, Var};
    use std::cell::RefCell;

    fn model() -> Result<LinearDenoiser> {
        let device = Device::Cpu;
        let scheduler = DDPMScheduler::new(1000, 0.00085, 0.012, BetaSchedule::ScaledLinear, PredictionType::Epsilon, &device)?;
        LinearDenoiser::new(LinearDenoiserConfig::default(), scheduler, &device, DType::F32)
    }

    /// Records the flags seen by the forward pass, then fails
    struct FailingModel {
        inner: LinearDenoiser,
        seen: RefCell<Option<(bool, Option<bool>, bool)>>,
    }

    impl DenoisingModel for FailingModel {
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
        fn predict_noise(&self, ctx: &ForwardContext<'_>, _req: &PredictionRequest<'_>) -> Result<Tensor> {
            *self.seen.borrow_mut() = Some((ctx.network.is_active, ctx.adapter.map(|a| a.is_active), ctx.training));
            anyhow::bail!("out of memory")
        }
        fn trainable_vars(&self) -> Vec<(String, Var)> {
            self.inner.trainable_vars()
        }
    }

    fn inputs_batch() -> Result<(TrainingBatch, Tensor, PromptEmbeds, Tensor)> {
        let device = Device::Cpu;
        let mut batch = TrainingBatch::new(vec![FileItem::new("a.png", "a photo of sks"), FileItem::new("b.png", "sks dog")]);
        batch.latents = Some(Tensor::randn(0.0f32, 1.0, (2, 4, 8, 8), &device)?);
        let noisy = Tensor::randn(0.0f32, 1.0, (2, 4, 8, 8), &device)?;
        let embeds = PromptEmbeds::new(Tensor::randn(0.0f32, 1.0, (2, 16, 32), &device)?, None);
        let t = Tensor::new(&[100i64, 900], &device)?;
        Ok((batch, noisy, embeds, t))
    }

    #[test]
    fn test_flags_restored_when_forward_fails() -> Result<()> {
        let model = FailingModel { inner: model()?, seen: RefCell::new(None) };
        let (batch, noisy, embeds, t) = inputs_batch()?;
        let mut network = NetworkState { is_active: true, multiplier: Multiplier::Scalar(0.75) };
        let config = AdapterConfig { adapter_type: "reference".to_string(), ..Default::default() };
        let mut adapter = Adapter::new(config, 32, 4, None, &Device::Cpu, DType::F32)?;
        let mut kwargs = PredictionKwargs::default();
        let inputs = PriorInputs {
            noisy_latents: &noisy,
            conditional: &embeds,
            unconditional: None,
            timesteps: &t,
            guidance_scale: 1.0,
            rescale_cfg: None,
            match_adapter_assist: false,
        };

        let result = predict_prior(&model, &mut network, Some(&mut adapter), None, &mut kwargs, &inputs, &batch);
        assert!(result.is_err());
        assert_eq!(*model.seen.borrow(), Some((false, Some(false), false)));
        assert!(network.is_active);
        assert_eq!(network.multiplier, Multiplier::Scalar(0.75));
        assert!(adapter.is_active);
        Ok(())
    }

    #[test]
    fn test_prior_matches_network_off_and_strips_residuals() -> Result<()> {
        let model = model()?;
        if let Some(lora) = model.lora() {
            lora.up.set(&Tensor::ones(lora.up.dims(), DType::F32, &Device::Cpu)?)?;
        }
        let (batch, noisy, embeds, t) = inputs_batch()?;
        let mut network = NetworkState::default();
        let residual = Tensor::ones((2, 4, 8, 8), DType::F32, &Device::Cpu)?;
        let mut kwargs = PredictionKwargs { down_intrablock_residuals: Some(vec![residual]), ..Default::default() };
        let inputs = PriorInputs {
            noisy_latents: &noisy,
            conditional: &embeds,
            unconditional: None,
            timesteps: &t,
            guidance_scale: 1.0,
            rescale_cfg: None,
            match_adapter_assist: true,
        };
        let prior = predict_prior(&model, &mut network, None, None, &mut kwargs, &inputs, &batch)?;
        assert!(kwargs.is_empty());
        assert!(network.is_active);

        let off = NetworkState { is_active: false, ..Default::default() };
        let with_residual = PredictionKwargs {
            down_intrablock_residuals: Some(vec![Tensor::ones((2, 4, 8, 8), DType::F32, &Device::Cpu)?]),
            ..Default::default()
        };
        let ctx = ForwardContext { network: &off, adapter: None, training: false };
        let req = PredictionRequest {
            latents: &noisy,
            conditional: &embeds,
            unconditional: None,
            timesteps: &t,
            guidance_scale: 1.0,
            rescale_cfg: None,
            kwargs: &with_residual,
        };
        let expected = model.predict_noise(&ctx, &req)?;
        let diff = (prior - expected)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn test_baseline_prompts_use_class_name() -> Result<()> {
        let table = Var::from_tensor(&Tensor::zeros((16, 4), DType::F32, &Device::Cpu)?)?;
        let embedding = TrainableEmbedding::new(table, "sks", 3, &[1, 2, 3], Some("dog".to_string()))?;
        let batch = TrainingBatch::new(vec![FileItem::new("a.png", "a photo of sks sks_1 sks_2, [trigger]")]);
        let prompts = baseline_prompts(&batch, Some(&embedding), None);
        assert_eq!(prompts, vec!["a photo of dog dog".to_string()]);
        Ok(())
    }
}
