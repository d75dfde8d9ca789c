//! SNR (Signal-to-Noise Ratio) weighting for diffusion training

use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use log::debug;
use std::collections::VecDeque;

use super::ddpm_scheduler::DDPMScheduler;

/// Gammas at or below this count as disabled
const MIN_ENABLED_GAMMA: f64 = 1e-6;
const LEARNABLE_BUFFER_SIZE: usize = 20;
const LEARNABLE_LR: f64 = 0.01;

/// `gamma / snr`, clamped to at most 1 unless `fixed`
pub fn snr_weight(snr: &Tensor, gamma: f64, fixed: bool) -> Result<Tensor> {
    let gamma_over_snr = (snr.to_dtype(DType::F32)?.recip()? * gamma)?;
    if fixed {
        Ok(gamma_over_snr)
    } else {
        Ok(gamma_over_snr.clamp(f32::MIN, 1.0f32)?)
    }
}

/// Learnable SNR gamma: four scalars fitted online so that weighted per-item losses
/// track the running mean of recent losses.
pub struct LearnableSnrGamma {
    offset_1: Var,
    offset_2: Var,
    scale: Var,
    gamma: Var,
    optimizer: AdamW,
    buffer: VecDeque<f32>,
}

impl LearnableSnrGamma {
    pub fn new(device: &Device) -> Result<Self> {
        let offset_1 = Var::new(0.0f32, device)?;
        let offset_2 = Var::new(0.777f32, device)?;
        let scale = Var::new(4.14f32, device)?;
        let gamma = Var::new(2.03f32, device)?;
        let optimizer = AdamW::new(
            vec![offset_1.clone(), offset_2.clone(), gamma.clone(), scale.clone()],
            ParamsAdamW { lr: LEARNABLE_LR, ..Default::default() },
        )?;
        Ok(Self { offset_1, offset_2, scale, gamma, optimizer, buffer: VecDeque::with_capacity(LEARNABLE_BUFFER_SIZE + 1) })
    }

    fn weight_from(snr: &Tensor, offset_1: &Tensor, offset_2: &Tensor, scale: &Tensor, gamma: &Tensor) -> Result<Tensor> {
        let adjusted = snr.broadcast_add(offset_1)?.broadcast_mul(scale)?.broadcast_add(offset_2)?;
        Ok(adjusted.recip()?.broadcast_mul(gamma)?.abs()?)
    }

    /// One optimizer step on the parameters, then the weights from the updated, detached parameters
    pub fn fit_and_weight(&mut self, loss: &Tensor, snr: &Tensor) -> Result<Tensor> {
        let loss = loss.detach().to_dtype(DType::F32)?;
        for value in loss.to_vec1::<f32>()? {
            self.buffer.push_back(value);
            if self.buffer.len() > LEARNABLE_BUFFER_SIZE {
                self.buffer.pop_front();
            }
        }
        let target = self.buffer.iter().sum::<f32>() / self.buffer.len().max(1) as f32;

        let snr = snr.detach().to_dtype(DType::F32)?;
        let weight = Self::weight_from(
            &snr,
            self.offset_1.as_tensor(),
            self.offset_2.as_tensor(),
            self.scale.as_tensor(),
            self.gamma.as_tensor(),
        )?;
        let local = ((loss * weight)? - target as f64)?.sqr()?.mean_all()?;
        let grads = local.backward()?;
        self.optimizer.step(&grads)?;
        debug!(
            "learnable snr: gamma {:.4} scale {:.4}",
            self.gamma.as_tensor().to_scalar::<f32>()?,
            self.scale.as_tensor().to_scalar::<f32>()?
        );

        Self::weight_from(
            &snr,
            &self.offset_1.as_tensor().detach(),
            &self.offset_2.as_tensor().detach(),
            &self.scale.as_tensor().detach(),
            &self.gamma.as_tensor().detach(),
        )
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}

/// At most one per-item loss reweighting
pub enum SnrWeighting {
    Disabled,
    Learnable(LearnableSnrGamma),
    Fixed(f64),
    Min(f64),
}

impl SnrWeighting {
    /// Learnable first, then fixed gamma, then min gamma
    pub fn from_config(learnable: bool, snr_gamma: Option<f64>, min_snr_gamma: Option<f64>, device: &Device) -> Result<Self> {
        if learnable {
            return Ok(Self::Learnable(LearnableSnrGamma::new(device)?));
        }
        match (snr_gamma, min_snr_gamma) {
            (Some(g), _) if g > MIN_ENABLED_GAMMA => Ok(Self::Fixed(g)),
            (_, Some(g)) if g > MIN_ENABLED_GAMMA => Ok(Self::Min(g)),
            _ => Ok(Self::Disabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// Scale per-item `loss` (`[batch]`) by the weight for each timestep
    pub fn apply(&mut self, loss: &Tensor, timesteps: &Tensor, scheduler: &DDPMScheduler) -> Result<Tensor> {
        let weight = match self {
            Self::Disabled => return Ok(loss.clone()),
            Self::Learnable(learnable) => {
                let snr = scheduler.get_snr(timesteps)?;
                learnable.fit_and_weight(loss, &snr)?
            }
            Self::Fixed(gamma) => snr_weight(&scheduler.get_snr(timesteps)?, *gamma, true)?,
            Self::Min(gamma) => snr_weight(&scheduler.get_snr(timesteps)?, *gamma, false)?,
        };
        Ok((loss.to_dtype(DType::F32)? * weight)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainers::ddpm_scheduler::{BetaSchedule, PredictionType};

    fn scheduler() -> Result<DDPMScheduler> {
        DDPMScheduler::new(1000, 0.00085, 0.012, BetaSchedule::ScaledLinear, PredictionType::Epsilon, &Device::Cpu)
    }

    #[test]
    fn test_priority_and_disabled_gammas() -> Result<()> {
        let device = Device::Cpu;
        assert!(matches!(SnrWeighting::from_config(true, Some(5.0), None, &device)?, SnrWeighting::Learnable(_)));
        assert!(matches!(SnrWeighting::from_config(false, Some(5.0), Some(1.0), &device)?, SnrWeighting::Fixed(_)));
        assert!(matches!(SnrWeighting::from_config(false, Some(1e-7), Some(1.0), &device)?, SnrWeighting::Min(_)));
        assert!(!SnrWeighting::from_config(false, Some(0.0), Some(1e-7), &device)?.is_enabled());
        Ok(())
    }

    #[test]
    fn test_min_snr_never_upweights() -> Result<()> {
        let sched = scheduler()?;
        let mut weighting = SnrWeighting::Min(5.0);
        let loss = Tensor::ones(3, DType::F32, &Device::Cpu)?;
        let t = Tensor::new(&[1i64, 500, 998], &Device::Cpu)?;
        let weighted: Vec<f32> = weighting.apply(&loss, &t, &sched)?.to_vec1()?;
        assert!(weighted.iter().all(|w| *w <= 1.0 && *w > 0.0));
        // high noise, low snr: clamp reached
        assert_eq!(weighted[2], 1.0);

        let mut fixed = SnrWeighting::Fixed(5.0);
        let weighted: Vec<f32> = fixed.apply(&loss, &t, &sched)?.to_vec1()?;
        assert!(weighted[2] > 1.0);
        Ok(())
    }

    #[test]
    fn test_learnable_fills_buffer_and_returns_finite() -> Result<()> {
        let sched = scheduler()?;
        let mut weighting = SnrWeighting::from_config(true, None, None, &Device::Cpu)?;
        let t = Tensor::new(&[10i64, 400, 800, 990], &Device::Cpu)?;
        for _ in 0..8 {
            let loss = Tensor::new(&[0.1f32, 0.2, 0.3, 0.4], &Device::Cpu)?;
            let out: Vec<f32> = weighting.apply(&loss, &t, &sched)?.to_vec1()?;
            assert!(out.iter().all(|v| v.is_finite()));
        }
        if let SnrWeighting::Learnable(l) = &weighting {
            assert_eq!(l.buffer_len(), 20);
        }
        Ok(())
    }
}
