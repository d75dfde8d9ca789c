//! Trainable conditioning adapters as one closed variant

use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var};
use log::debug;
use std::ops::{Deref, DerefMut};

use super::embedding::TrainableEmbedding;
use super::prompt::{inject_trigger_into_prompt, PromptEmbeds};
use crate::trainers::errors::TrainingError;
use crate::trainers::AdapterConfig;

/// Image features appended to the text tokens
pub struct ImageConditioning {
    projection: Var,
    num_tokens: usize,
    text_dim: usize,
    train_image_encoder: bool,
}

/// Reference images added to the latent stream
pub struct ReferenceConditioning {
    projection: Var,
    reference: Option<Tensor>,
}

/// Image features mixed into the prompt embeddings, with an auxiliary loss
pub struct CustomConditioning {
    projection: Var,
    trigger: String,
    additional_loss_weight: f64,
}

/// Augments the text encoder token rows of its trigger
pub struct TextEncoderAugmenting {
    projection: Var,
    embedding: TrainableEmbedding,
}

pub enum AdapterKind {
    ImageConditioning(ImageConditioning),
    ReferenceConditioning(ReferenceConditioning),
    CustomConditioning(CustomConditioning),
    TextEncoderAugmenting(TextEncoderAugmenting),
    None,
}

pub struct Adapter {
    pub kind: AdapterKind,
    pub is_active: bool,
    pub config: AdapterConfig,
    additional_loss: Option<Tensor>,
}

/// Mean RGB per item, `[batch, 3]`
fn pooled_pixels(images: &Tensor) -> Result<Tensor> {
    let (b, c, _, _) = images.dims4()?;
    let pooled = images.mean_keepdim((2, 3))?.reshape((b, c))?;
    if c >= 3 {
        return Ok(pooled.narrow(1, 0, 3)?);
    }
    let pad = Tensor::zeros((b, 3 - c), pooled.dtype(), pooled.device())?;
    Ok(Tensor::cat(&[&pooled, &pad], 1)?)
}

fn projection(rows: usize, cols: usize, device: &Device, dtype: DType) -> Result<Var> {
    let init = Tensor::randn(0.0f32, 0.02, (rows, cols), device)?.to_dtype(dtype)?;
    Ok(Var::from_tensor(&init)?)
}

impl Adapter {
    pub fn new(
        config: AdapterConfig,
        text_dim: usize,
        latent_channels: usize,
        token_table: Option<(Var, Vec<u32>)>,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let kind = match config.adapter_type.as_str() {
            "ip" => AdapterKind::ImageConditioning(ImageConditioning {
                projection: projection(3, config.num_tokens * text_dim, device, dtype)?,
                num_tokens: config.num_tokens,
                text_dim,
                train_image_encoder: config.train_image_encoder,
            }),
            "reference" => AdapterKind::ReferenceConditioning(ReferenceConditioning {
                projection: projection(3, latent_channels, device, dtype)?,
                reference: None,
            }),
            "custom" => AdapterKind::CustomConditioning(CustomConditioning {
                projection: projection(3, text_dim, device, dtype)?,
                trigger: config.trigger.clone(),
                additional_loss_weight: config.additional_loss_weight,
            }),
            "te_augmenter" => {
                let (table, ids) = token_table.ok_or_else(|| {
                    TrainingError::config("te_augmenter adapter needs a model with a token table")
                })?;
                let embedding = TrainableEmbedding::new(
                    table,
                    &config.trigger,
                    config.num_tokens,
                    &ids,
                    config.trigger_class_name.clone(),
                )?;
                AdapterKind::TextEncoderAugmenting(TextEncoderAugmenting {
                    projection: projection(3, text_dim, device, dtype)?,
                    embedding,
                })
            }
            "none" => AdapterKind::None,
            other => return Err(TrainingError::config(format!("unknown adapter type: {}", other)).into()),
        };
        debug!("Created {} adapter", config.adapter_type);

        Ok(Self { kind, is_active: true, config, additional_loss: None })
    }

    /// Image, reference and custom adapters can be switched off for a baseline pass
    pub fn can_disable(&self) -> bool {
        matches!(
            self.kind,
            AdapterKind::ImageConditioning(_) | AdapterKind::ReferenceConditioning(_) | AdapterKind::CustomConditioning(_)
        )
    }

    /// Baseline prompts must have the adapter trigger replaced by the class name
    pub fn requires_trigger_substitution(&self) -> bool {
        matches!(self.kind, AdapterKind::TextEncoderAugmenting(_))
    }

    /// Tokens appended to the text embeddings by this adapter
    pub fn appended_token_count(&self) -> usize {
        match &self.kind {
            AdapterKind::ImageConditioning(a) => a.num_tokens,
            _ => 0,
        }
    }

    pub fn needs_clip_images(&self) -> bool {
        matches!(
            self.kind,
            AdapterKind::ImageConditioning(_) | AdapterKind::TextEncoderAugmenting(_)
        )
    }

    /// Rewrite captions before text encoding
    pub fn condition_prompt(&self, prompts: Vec<String>) -> Vec<String> {
        match &self.kind {
            AdapterKind::CustomConditioning(a) => prompts
                .into_iter()
                .map(|p| inject_trigger_into_prompt(&p, Some(&a.trigger), false))
                .collect(),
            AdapterKind::TextEncoderAugmenting(a) => prompts
                .into_iter()
                .map(|p| a.embedding.inject_embedding_to_prompt(&p, false))
                .collect(),
            _ => prompts,
        }
    }

    /// Mix conditioning images into encoded prompts. `drop` conditions on a blank image.
    pub fn encode_conditioning(&mut self, embeds: &PromptEmbeds, images: Option<&Tensor>, drop: bool) -> Result<PromptEmbeds> {
        let batch = embeds.batch_size();
        let features = match images {
            Some(images) if !drop => pooled_pixels(images)?,
            _ => Tensor::zeros((batch, 3), embeds.text_embeds.dtype(), embeds.text_embeds.device())?,
        };
        let features = features.to_dtype(embeds.text_embeds.dtype())?;

        match &self.kind {
            AdapterKind::ImageConditioning(a) => {
                let features = if a.train_image_encoder { features } else { features.detach() };
                let tokens = features
                    .matmul(a.projection.as_tensor())?
                    .reshape((batch, a.num_tokens, a.text_dim))?;
                let text_embeds = Tensor::cat(&[&embeds.text_embeds, &tokens], 1)?;
                Ok(PromptEmbeds::new(text_embeds, embeds.pooled_embeds.clone()))
            }
            AdapterKind::CustomConditioning(a) => {
                let mix = features.matmul(a.projection.as_tensor())?;
                let text_embeds = embeds.text_embeds.broadcast_add(&mix.unsqueeze(1)?)?;
                let aux = (mix.to_dtype(DType::F32)?.sqr()?.mean_keepdim(1)? * a.additional_loss_weight)?;
                self.additional_loss = Some(match self.additional_loss.take() {
                    Some(prev) => (prev + aux.squeeze(1)?)?,
                    None => aux.squeeze(1)?,
                });
                Ok(PromptEmbeds::new(text_embeds, embeds.pooled_embeds.clone()))
            }
            AdapterKind::TextEncoderAugmenting(a) => {
                let mix = features.matmul(a.projection.as_tensor())?;
                let text_embeds = embeds.text_embeds.broadcast_add(&mix.unsqueeze(1)?)?;
                Ok(PromptEmbeds::new(text_embeds, embeds.pooled_embeds.clone()))
            }
            AdapterKind::ReferenceConditioning(_) | AdapterKind::None => Ok(embeds.clone()),
        }
    }

    /// Reference images in `[-1, 1]`, or `None` to clear
    pub fn set_reference_images(&mut self, images: Option<Tensor>) {
        if let AdapterKind::ReferenceConditioning(a) = &mut self.kind {
            a.reference = images;
        }
    }

    pub fn set_blank_reference_images(&mut self, batch_size: usize, device: &Device, dtype: DType) -> Result<()> {
        if let AdapterKind::ReferenceConditioning(a) = &mut self.kind {
            a.reference = Some(Tensor::zeros((batch_size, 3, 1, 1), dtype, device)?);
        }
        Ok(())
    }

    /// Additive latent-space term for a forward pass of `batch` items with `channels` channels
    pub fn latent_residual(&self, batch: usize, channels: usize) -> Result<Option<Tensor>> {
        let a = match &self.kind {
            AdapterKind::ReferenceConditioning(a) if self.is_active => a,
            _ => return Ok(None),
        };
        let reference = match &a.reference {
            Some(r) => r,
            None => return Ok(None),
        };
        let features = pooled_pixels(reference)?.to_dtype(a.projection.dtype())?;
        let residual = features.matmul(a.projection.as_tensor())?;
        let ref_batch = residual.dim(0)?;
        // Doubled guidance batches reuse the same references
        let residual = if ref_batch != batch && ref_batch > 0 && batch % ref_batch == 0 {
            let copies: Vec<&Tensor> = std::iter::repeat(&residual).take(batch / ref_batch).collect();
            Tensor::cat(&copies, 0)?
        } else {
            residual
        };
        Ok(Some(residual.reshape((batch, channels, 1, 1))?))
    }

    /// Take the auxiliary loss accumulated since the last call
    pub fn additional_loss(&mut self) -> Option<Tensor> {
        self.additional_loss.take()
    }

    /// Undo optimizer updates on token rows the adapter does not own
    pub fn restore_embeddings(&self) -> Result<()> {
        if let AdapterKind::TextEncoderAugmenting(a) = &self.kind {
            a.embedding.restore_embeddings()?;
        }
        Ok(())
    }

    /// Trigger to swap for the class name in baseline prompts
    pub fn trigger(&self) -> Option<&str> {
        Some(self.config.trigger.as_str()).filter(|t| !t.is_empty())
    }

    pub fn vars(&self) -> Vec<(String, Var)> {
        match &self.kind {
            AdapterKind::ImageConditioning(a) => vec![("adapter.image_proj".to_string(), a.projection.clone())],
            AdapterKind::ReferenceConditioning(a) => vec![("adapter.reference_proj".to_string(), a.projection.clone())],
            AdapterKind::CustomConditioning(a) => vec![("adapter.condition_proj".to_string(), a.projection.clone())],
            AdapterKind::TextEncoderAugmenting(a) => {
                let mut vars = vec![("adapter.te_proj".to_string(), a.projection.clone())];
                vars.extend(a.embedding.vars());
                vars
            }
            AdapterKind::None => Vec::new(),
        }
    }
}

/// Holds an adapter with its activation flag snapshotted; the flag is written back on drop
pub struct AdapterActivation<'a> {
    adapter: &'a mut Adapter,
    saved: bool,
}

impl Adapter {
    pub fn activation_guard(&mut self) -> AdapterActivation<'_> {
        let saved = self.is_active;
        AdapterActivation { adapter: self, saved }
    }
}

impl Deref for AdapterActivation<'_> {
    type Target = Adapter;

    fn deref(&self) -> &Adapter {
        self.adapter
    }
}

impl DerefMut for AdapterActivation<'_> {
    fn deref_mut(&mut self) -> &mut Adapter {
        self.adapter
    }
}

impl Drop for AdapterActivation<'_> {
    fn drop(&mut self) {
        self.adapter.is_active = self.saved;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_guard_restores_flag() -> Result<()> {
        let mut adapter = Adapter::new(config("reference"), 8, 4, None, &Device::Cpu, DType::F32)?;
        {
            let mut guard = adapter.activation_guard();
            guard.is_active = false;
            assert!(!guard.is_active);
        }
        assert!(adapter.is_active);
        Ok(())
    }

    fn config(adapter_type: &str) -> AdapterConfig {
        AdapterConfig {
            adapter_type: adapter_type.to_string(),
            trigger: "zxc".to_string(),
            num_tokens: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_image_conditioning_appends_tokens() -> Result<()> {
        let device = Device::Cpu;
        let mut adapter = Adapter::new(config("ip"), 8, 4, None, &device, DType::F32)?;
        let embeds = PromptEmbeds::new(Tensor::zeros((2, 5, 8), DType::F32, &device)?, None);
        let images = Tensor::rand(0.0f32, 1.0, (2, 3, 16, 16), &device)?;
        let out = adapter.encode_conditioning(&embeds, Some(&images), false)?;
        assert_eq!(out.text_embeds.dims(), &[2, 7, 8]);
        assert_eq!(adapter.appended_token_count(), 2);
        assert!(adapter.can_disable());
        assert!(!adapter.requires_trigger_substitution());
        Ok(())
    }

    #[test]
    fn test_custom_conditioning_additional_loss_is_taken_once() -> Result<()> {
        let device = Device::Cpu;
        let mut adapter = Adapter::new(config("custom"), 8, 4, None, &device, DType::F32)?;
        let embeds = PromptEmbeds::new(Tensor::zeros((2, 5, 8), DType::F32, &device)?, None);
        let images = Tensor::rand(0.0f32, 1.0, (2, 3, 4, 4), &device)?;
        adapter.encode_conditioning(&embeds, Some(&images), false)?;
        let loss = adapter.additional_loss();
        assert_eq!(loss.map(|l| l.dims().to_vec()), Some(vec![2]));
        assert!(adapter.additional_loss().is_none());
        assert_eq!(adapter.condition_prompt(vec!["a [trigger]".to_string()]), vec!["a zxc".to_string()]);
        Ok(())
    }

    #[test]
    fn test_reference_residual_only_when_active() -> Result<()> {
        let device = Device::Cpu;
        let mut adapter = Adapter::new(config("reference"), 8, 4, None, &device, DType::F32)?;
        assert!(adapter.latent_residual(2, 4)?.is_none());
        adapter.set_reference_images(Some(Tensor::ones((2, 3, 8, 8), DType::F32, &device)?));
        assert_eq!(adapter.latent_residual(4, 4)?.map(|r| r.dims().to_vec()), Some(vec![4, 4, 1, 1]));
        adapter.is_active = false;
        assert!(adapter.latent_residual(2, 4)?.is_none());
        Ok(())
    }

    #[test]
    fn test_unknown_adapter_type() {
        let err = Adapter::new(config("lycoris"), 8, 4, None, &Device::Cpu, DType::F32).err();
        assert!(err.is_some());
    }
}
