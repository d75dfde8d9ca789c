//! Trainable low-rank network, its activation state, and scoped state toggling

use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var};
use std::ops::{Deref, DerefMut};

use crate::trainers::errors::TrainingError;

/// Network strength; negative inverts
#[derive(Debug, Clone, PartialEq)]
pub enum Multiplier {
    Scalar(f64),
    PerItem(Vec<f64>),
}

impl Default for Multiplier {
    fn default() -> Self {
        Multiplier::Scalar(1.0)
    }
}

impl Multiplier {
    pub fn polarized(weights: &[f64]) -> Self {
        let mut values = weights.to_vec();
        values.extend(weights.iter().map(|w| -w));
        Multiplier::PerItem(values)
    }

    pub fn per_item(&self, batch_size: usize) -> Result<Vec<f64>> {
        match self {
            Multiplier::Scalar(m) => Ok(vec![*m; batch_size]),
            Multiplier::PerItem(values) if values.len() == batch_size => Ok(values.clone()),
            Multiplier::PerItem(values) => Err(TrainingError::config(format!(
                "network multiplier has {} entries for a batch of {}",
                values.len(),
                batch_size
            ))
            .into()),
        }
    }
}

/// Activation state of the trainable network
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkState {
    pub is_active: bool,
    pub multiplier: Multiplier,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self { is_active: true, multiplier: Multiplier::default() }
    }
}

impl NetworkState {
    /// State for a job without a trainable network
    pub fn blank() -> Self {
        Self { is_active: false, multiplier: Multiplier::Scalar(0.0) }
    }

    /// Effective per-item multiplier, zero when inactive
    pub fn effective_multiplier(&self, batch_size: usize) -> Result<Vec<f64>> {
        if !self.is_active {
            return Ok(vec![0.0; batch_size]);
        }
        self.multiplier.per_item(batch_size)
    }
}

/// Restores the guarded value on drop
pub struct StateGuard<'a, T: Clone> {
    slot: &'a mut T,
    saved: Option<T>,
}

impl<'a, T: Clone> StateGuard<'a, T> {
    pub fn new(slot: &'a mut T) -> Self {
        let saved = Some(slot.clone());
        Self { slot, saved }
    }
}

impl<T: Clone> Deref for StateGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.slot
    }
}

impl<T: Clone> DerefMut for StateGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.slot
    }
}

impl<T: Clone> Drop for StateGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            *self.slot = saved;
        }
    }
}

/// Low-rank update `scale * up(down(x))` for one linear layer
pub struct LoRALinear {
    pub down: Var,
    pub up: Var,
    pub scale: f64,
}

impl LoRALinear {
    pub fn new(in_features: usize, out_features: usize, rank: usize, alpha: f32, device: &Device, dtype: DType) -> Result<Self> {
        let down_tensor = Tensor::randn(0.0f32, 0.02, (rank, in_features), device)?.to_dtype(dtype)?;
        let up_tensor = Tensor::zeros((out_features, rank), dtype, device)?;

        Ok(Self {
            down: Var::from_tensor(&down_tensor)?,
            up: Var::from_tensor(&up_tensor)?,
            scale: (alpha / rank as f32) as f64,
        })
    }

    pub fn rank(&self) -> usize {
        self.down.dims()[0]
    }

    /// Delta for `input` of shape `[batch, seq, in]`, weighted per item by `multiplier` (`[batch]`)
    pub fn forward_delta(&self, input: &Tensor, multiplier: &Tensor) -> Result<Tensor> {
        let (b, s, d) = input.dims3()?;
        let input_2d = input.reshape((b * s, d))?;
        let down_out = input_2d.matmul(&self.down.as_tensor().t()?)?;
        let lora_out = down_out.matmul(&self.up.as_tensor().t()?)?;
        let out_d = lora_out.dim(1)?;
        let lora_out = (lora_out.reshape((b, s, out_d))? * self.scale)?;

        let multiplier = multiplier.to_dtype(lora_out.dtype())?.reshape((b, 1, 1))?;
        Ok(lora_out.broadcast_mul(&multiplier)?)
    }

    pub fn vars(&self) -> Vec<(String, Var)> {
        vec![
            ("lora_down.weight".to_string(), self.down.clone()),
            ("lora_up.weight".to_string(), self.up.clone()),
        ]
    }
}
