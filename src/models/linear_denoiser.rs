//! Small per-pixel channel-mixing denoiser
//!
//! Latents are treated as `[batch, h*w, channels]` tokens; the base layer is a frozen channel mix,
//! the trainable network a LoRA on that mix. Text conditioning is a hashed bag-of-words table
//! projected to a per-channel bias. Enough structure for every trainer path to run on CPU.

use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var};

use super::denoiser::{
    apply_cfg, AssistantAdapter, AssistantKind, DenoisingModel, EncodeOptions, ForwardContext, PredictionKwargs,
    PredictionRequest,
};
use super::network::LoRALinear;
use super::prompt::PromptEmbeds;
use crate::trainers::ddpm_scheduler::DDPMScheduler;

#[derive(Debug, Clone)]
pub struct LinearDenoiserConfig {
    pub latent_channels: usize,
    pub text_dim: usize,
    pub vocab_size: usize,
    pub max_tokens: usize,
    pub vae_scale_factor: usize,
    /// `(rank, alpha)` of the trainable network
    pub lora: Option<(usize, f32)>,
    pub train_text_encoder: bool,
}

impl Default for LinearDenoiserConfig {
    fn default() -> Self {
        Self {
            latent_channels: 4,
            text_dim: 32,
            vocab_size: 1024,
            max_tokens: 16,
            vae_scale_factor: 8,
            lora: Some((4, 4.0)),
            train_text_encoder: false,
        }
    }
}

pub struct LinearDenoiser {
    config: LinearDenoiserConfig,
    scheduler: DDPMScheduler,
    device: Device,
    dtype: DType,

    channel_mix: Tensor,
    text_proj: Tensor,
    time_proj: Tensor,
    image_proj: Tensor,
    token_table: Var,
    lora: Option<LoRALinear>,
}

/// FNV-1a
fn hash_word(word: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in word.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// `[b, c, h, w]` to `[b, h*w, c]`
fn to_tokens(x: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    Ok(x.permute((0, 2, 3, 1))?.reshape((b, h * w, c))?)
}

fn from_tokens(x: &Tensor, h: usize, w: usize) -> Result<Tensor> {
    let (b, _, c) = x.dims3()?;
    Ok(x.reshape((b, h, w, c))?.permute((0, 3, 1, 2))?.contiguous()?)
}

impl LinearDenoiser {
    pub fn new(config: LinearDenoiserConfig, scheduler: DDPMScheduler, device: &Device, dtype: DType) -> Result<Self> {
        let c = config.latent_channels;
        let d = config.text_dim;

        let diagonal: Vec<f32> = (0..c * c).map(|i| if i % (c + 1) == 0 { 0.5 } else { 0.0 }).collect();
        let channel_mix = (Tensor::from_vec(diagonal, (c, c), device)? + Tensor::randn(0.0f32, 0.1, (c, c), device)?)?
            .to_dtype(dtype)?;
        let text_proj = Tensor::randn(0.0f32, 0.1, (d, c), device)?.to_dtype(dtype)?;
        let time_proj = Tensor::randn(0.0f32, 0.1, c, device)?.to_dtype(dtype)?;
        let image_proj = Tensor::randn(0.0f32, 0.5, (3, c), device)?.to_dtype(dtype)?;
        let token_table = Var::from_tensor(&Tensor::randn(0.0f32, 0.1, (config.vocab_size, d), device)?.to_dtype(dtype)?)?;

        let lora = match config.lora {
            Some((rank, alpha)) => Some(LoRALinear::new(c, c, rank, alpha, device, dtype)?),
            None => None,
        };

        Ok(Self {
            config,
            scheduler,
            device: device.clone(),
            dtype,
            channel_mix,
            text_proj,
            time_proj,
            image_proj,
            token_table,
            lora,
        })
    }

    pub fn config(&self) -> &LinearDenoiserConfig {
        &self.config
    }

    pub fn lora(&self) -> Option<&LoRALinear> {
        self.lora.as_ref()
    }

    fn tokenize(&self, prompt: &str) -> Vec<u32> {
        let mut ids: Vec<u32> = prompt
            .split_whitespace()
            .filter_map(|w| self.token_id(w))
            .take(self.config.max_tokens)
            .collect();
        ids.resize(self.config.max_tokens, 0);
        ids
    }

    fn forward(&self, ctx: &ForwardContext<'_>, latents: &Tensor, embeds: &PromptEmbeds, timesteps: &Tensor, kwargs: &PredictionKwargs) -> Result<Tensor> {
        let (b, c, h, w) = latents.dims4()?;
        let latents = latents.to_dtype(self.dtype)?;
        let x = to_tokens(&latents)?;

        let mut out = x.broadcast_matmul(&self.channel_mix.t()?)?;

        if let Some(lora) = &self.lora {
            let multiplier = ctx.network.effective_multiplier(b)?;
            if multiplier.iter().any(|m| *m != 0.0) {
                let values: Vec<f32> = multiplier.iter().map(|m| *m as f32).collect();
                let multiplier = Tensor::from_vec(values, b, &self.device)?;
                out = (out + lora.forward_delta(&x, &multiplier)?)?;
            }
        }

        let text = embeds.text_embeds.to_dtype(self.dtype)?.mean(1)?.matmul(&self.text_proj)?;
        out = out.broadcast_add(&text.unsqueeze(1)?)?;

        let t = (timesteps.to_dtype(DType::F32)? / self.scheduler.num_train_timesteps() as f64)?
            .to_dtype(self.dtype)?
            .reshape((b, 1, 1))?;
        out = out.broadcast_add(&t.broadcast_mul(&self.time_proj.reshape((1, 1, c))?)?)?;

        let mut out = from_tokens(&out, h, w)?;

        if let Some(adapter) = ctx.adapter {
            if let Some(residual) = adapter.latent_residual(b, c)? {
                out = out.broadcast_add(&residual.to_dtype(self.dtype)?)?;
            }
        }

        for residual in kwargs.residuals() {
            let residual = residual.to_dtype(self.dtype)?;
            let (_, _, rh, rw) = residual.dims4()?;
            let residual = if (rh, rw) != (h, w) { residual.upsample_nearest2d(h, w)? } else { residual };
            out = out.broadcast_add(&residual)?;
        }

        Ok(out)
    }
}

impl DenoisingModel for LinearDenoiser {
    fn scheduler(&self) -> &DDPMScheduler {
        &self.scheduler
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn encode_prompt(&self, prompts: &[String], opts: &EncodeOptions) -> Result<PromptEmbeds> {
        let batch = prompts.len();
        let mut ids = Vec::with_capacity(batch * self.config.max_tokens);
        for prompt in prompts {
            let dropped = opts.dropout_prob > 0.0 && rand::random::<f64>() < opts.dropout_prob;
            if dropped {
                ids.extend(self.tokenize(""));
            } else {
                ids.extend(self.tokenize(prompt));
            }
        }
        let ids = Tensor::from_vec(ids, batch * self.config.max_tokens, &self.device)?;
        let text_embeds = self
            .token_table
            .as_tensor()
            .index_select(&ids, 0)?
            .reshape((batch, self.config.max_tokens, self.config.text_dim))?;
        let pooled = text_embeds.mean(1)?;

        let embeds = PromptEmbeds::new(text_embeds, Some(pooled));
        Ok(if opts.with_grad { embeds } else { embeds.detach() })
    }

    fn encode_images(&self, pixels: &Tensor) -> Result<Tensor> {
        let f = self.config.vae_scale_factor;
        let pooled = pixels.to_dtype(self.dtype)?.avg_pool2d(f)?;
        let (_, _, h, w) = pooled.dims4()?;
        let tokens = to_tokens(&pooled)?.broadcast_matmul(&self.image_proj)?;
        from_tokens(&tokens, h, w)
    }

    fn predict_noise(&self, ctx: &ForwardContext<'_>, req: &PredictionRequest<'_>) -> Result<Tensor> {
        let cond = self.forward(ctx, req.latents, req.conditional, req.timesteps, req.kwargs)?;
        match req.unconditional {
            Some(uncond) if (req.guidance_scale - 1.0).abs() > 1e-6 => {
                let uncond = self.forward(ctx, req.latents, uncond, req.timesteps, req.kwargs)?;
                apply_cfg(&cond, &uncond, req.guidance_scale, req.rescale_cfg)
            }
            _ => Ok(cond),
        }
    }

    fn trainable_vars(&self) -> Vec<(String, Var)> {
        let mut vars = Vec::new();
        if let Some(lora) = &self.lora {
            for (name, var) in lora.vars() {
                vars.push((format!("lora_unet_channel_mix.{}", name), var));
            }
        }
        if self.config.train_text_encoder {
            vars.push(("text_encoder.token_embedding.weight".to_string(), self.token_table.clone()));
        }
        vars
    }

    fn token_table(&self) -> Option<Var> {
        Some(self.token_table.clone())
    }

    fn token_id(&self, word: &str) -> Option<u32> {
        let word = word.trim_matches(|c: char| !c.is_alphanumeric() && c != '_').to_lowercase();
        if word.is_empty() {
            return None;
        }
        let slots = (self.config.vocab_size.max(2) - 1) as u64;
        Some(1 + (hash_word(&word) % slots) as u32)
    }
}

/// Frozen assistant producing latent-resolution residuals from control images
pub struct ChannelResidualAssistant {
    kind: AssistantKind,
    in_channels: usize,
    proj: Tensor,
}

impl ChannelResidualAssistant {
    pub fn new(kind: AssistantKind, in_channels: usize, latent_channels: usize, device: &Device, dtype: DType) -> Result<Self> {
        let proj = Tensor::randn(0.0f32, 0.1, (in_channels, latent_channels), device)?.to_dtype(dtype)?;
        Ok(Self { kind, in_channels, proj })
    }
}

impl AssistantAdapter for ChannelResidualAssistant {
    fn kind(&self) -> AssistantKind {
        self.kind
    }

    fn in_channels(&self) -> usize {
        self.in_channels
    }

    fn residuals(&self, images: &Tensor, noisy_latents: &Tensor, _timesteps: &Tensor) -> Result<Vec<Tensor>> {
        let (_, _, h, w) = noisy_latents.dims4()?;
        let (_, _, ih, iw) = images.dims4()?;
        let images = images.to_dtype(self.proj.dtype())?;
        let pooled = if ih >= h && iw >= w && ih % h == 0 && iw % w == 0 {
            images.avg_pool2d((ih / h, iw / w))?
        } else {
            images.upsample_nearest2d(h, w)?
        };
        let features = from_tokens(&to_tokens(&pooled)?.broadcast_matmul(&self.proj)?, h, w)?;
        Ok(match self.kind {
            AssistantKind::T2I => vec![features],
            // last entry is the mid block residual
            AssistantKind::ControlNet => vec![features.clone(), (features * 0.5)?],
        })
    }
}
