//! Boundary between the training step and the denoising model

use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var};

use super::adapters::Adapter;
use super::network::NetworkState;
use super::prompt::PromptEmbeds;
use crate::trainers::ddpm_scheduler::DDPMScheduler;

/// Options for text encoding
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeOptions {
    /// Chance of replacing a caption with the empty prompt
    pub dropout_prob: f64,
    /// Keep the graph through the text encoder
    pub with_grad: bool,
}

/// Residuals injected by an assistant adapter
#[derive(Debug, Clone, Default)]
pub struct PredictionKwargs {
    /// T2I adapter features
    pub down_intrablock_residuals: Option<Vec<Tensor>>,
    /// ControlNet down block features
    pub down_block_residuals: Option<Vec<Tensor>>,
    /// ControlNet mid block feature
    pub mid_block_residual: Option<Tensor>,
}

impl PredictionKwargs {
    pub fn is_empty(&self) -> bool {
        self.down_intrablock_residuals.is_none()
            && self.down_block_residuals.is_none()
            && self.mid_block_residual.is_none()
    }

    /// Drop residuals that only apply while matching the assistant
    pub fn strip_assistant_residuals(&mut self) {
        self.down_intrablock_residuals = None;
        self.down_block_residuals = None;
        self.mid_block_residual = None;
    }

    /// Every residual tensor, in injection order
    pub fn residuals(&self) -> Vec<&Tensor> {
        let mut out: Vec<&Tensor> = Vec::new();
        if let Some(r) = &self.down_intrablock_residuals {
            out.extend(r.iter());
        }
        if let Some(r) = &self.down_block_residuals {
            out.extend(r.iter());
        }
        if let Some(r) = &self.mid_block_residual {
            out.push(r);
        }
        out
    }

    /// Residuals repeated along the batch axis, for doubled guidance batches
    pub fn repeat_batch(&self, times: usize) -> Result<Self> {
        let rep = |t: &Tensor| -> Result<Tensor> {
            let copies: Vec<&Tensor> = std::iter::repeat(t).take(times).collect();
            Ok(Tensor::cat(&copies, 0)?)
        };
        let rep_all = |v: &Option<Vec<Tensor>>| -> Result<Option<Vec<Tensor>>> {
            match v {
                Some(v) => Ok(Some(v.iter().map(rep).collect::<Result<Vec<_>>>()?)),
                None => Ok(None),
            }
        };
        Ok(Self {
            down_intrablock_residuals: rep_all(&self.down_intrablock_residuals)?,
            down_block_residuals: rep_all(&self.down_block_residuals)?,
            mid_block_residual: match &self.mid_block_residual {
                Some(t) => Some(rep(t)?),
                None => None,
            },
        })
    }
}

/// Mutable training state the model reads during a forward pass
#[derive(Clone, Copy)]
pub struct ForwardContext<'a> {
    pub network: &'a NetworkState,
    pub adapter: Option<&'a Adapter>,
    /// false = evaluation mode
    pub training: bool,
}

pub struct PredictionRequest<'a> {
    pub latents: &'a Tensor,
    pub conditional: &'a PromptEmbeds,
    pub unconditional: Option<&'a PromptEmbeds>,
    pub timesteps: &'a Tensor,
    pub guidance_scale: f64,
    pub rescale_cfg: Option<f64>,
    pub kwargs: &'a PredictionKwargs,
}

/// Denoising model service consumed by the trainer
pub trait DenoisingModel {
    fn scheduler(&self) -> &DDPMScheduler;

    fn device(&self) -> &Device;

    fn dtype(&self) -> DType;

    fn encode_prompt(&self, prompts: &[String], opts: &EncodeOptions) -> Result<PromptEmbeds>;

    /// Pixels in `[0, 1]`, `[batch, 3, H, W]`, to latents
    fn encode_images(&self, pixels: &Tensor) -> Result<Tensor>;

    fn predict_noise(&self, ctx: &ForwardContext<'_>, req: &PredictionRequest<'_>) -> Result<Tensor>;

    fn add_noise(&self, latents: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        self.scheduler().add_noise(latents, noise, timesteps)
    }

    /// Parameters of the trainable network
    fn trainable_vars(&self) -> Vec<(String, Var)>;

    /// Token embedding table of the text encoder, when it has one
    fn token_table(&self) -> Option<Var> {
        None
    }

    fn token_id(&self, _word: &str) -> Option<u32> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssistantKind {
    T2I,
    ControlNet,
}

/// Frozen adapter that helps training by injecting residuals
pub trait AssistantAdapter {
    fn kind(&self) -> AssistantKind;

    fn in_channels(&self) -> usize;

    /// Residuals for `images`, already sliced to `in_channels`
    fn residuals(&self, images: &Tensor, noisy_latents: &Tensor, timesteps: &Tensor) -> Result<Vec<Tensor>>;
}

/// uncond + scale * (cond - uncond), optionally rescaled toward the conditional std
pub fn apply_cfg(cond: &Tensor, uncond: &Tensor, guidance_scale: f64, rescale_cfg: Option<f64>) -> Result<Tensor> {
    let guided = (uncond + ((cond - uncond)? * guidance_scale)?)?;
    let rescale = match rescale_cfg {
        Some(r) if r > 0.0 => r,
        _ => return Ok(guided),
    };

    let batch = cond.dim(0)?;
    let std = |t: &Tensor| -> Result<Tensor> {
        let flat = t.reshape((batch, ()))?;
        let mean = flat.mean_keepdim(1)?;
        Ok(flat.broadcast_sub(&mean)?.sqr()?.mean_keepdim(1)?.sqrt()?)
    };
    let std_pos = std(cond)?;
    let std_cfg = (std(&guided)? + 1e-8)?;
    let factor = (std_pos / std_cfg)?;
    let mut shape = vec![batch];
    shape.extend(std::iter::repeat(1).take(cond.rank() - 1));
    let factor = factor.reshape(shape)?;

    let rescaled = guided.broadcast_mul(&factor)?;
    Ok(((rescaled * rescale)? + (guided * (1.0 - rescale))?)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cfg_scale_one_is_conditional() -> Result<()> {
        let device = Device::Cpu;
        let cond = Tensor::randn(0.0f32, 1.0, (2, 4, 3, 3), &device)?;
        let uncond = Tensor::randn(0.0f32, 1.0, (2, 4, 3, 3), &device)?;
        let out = apply_cfg(&cond, &uncond, 1.0, None)?;
        let diff = (out - &cond)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn test_strip_residuals() -> Result<()> {
        let device = Device::Cpu;
        let r = Tensor::zeros((1, 4, 2, 2), DType::F32, &device)?;
        let mut kwargs = PredictionKwargs {
            down_intrablock_residuals: Some(vec![r.clone()]),
            down_block_residuals: None,
            mid_block_residual: Some(r),
        };
        assert_eq!(kwargs.residuals().len(), 2);
        assert_eq!(kwargs.repeat_batch(2)?.residuals()[0].dims(), &[2, 4, 2, 2]);
        kwargs.strip_assistant_residuals();
        assert!(kwargs.is_empty());
        Ok(())
    }
}
