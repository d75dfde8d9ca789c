//! DDPM noise scheduler used by the training step
//! Beta schedules, forward noising, velocity targets, SNR and sigma lookups

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use std::str::FromStr;

use super::errors::TrainingError;

/// What the denoiser is trained to output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionType {
    Epsilon,
    VPrediction,
}

impl FromStr for PredictionType {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "epsilon" => Ok(Self::Epsilon),
            "v_prediction" => Ok(Self::VPrediction),
            other => Err(TrainingError::config(format!("unknown prediction type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetaSchedule {
    Linear,
    ScaledLinear,
    SquaredCosCapV2,
}

impl FromStr for BetaSchedule {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(Self::Linear),
            "scaled_linear" => Ok(Self::ScaledLinear),
            "squaredcos_cap_v2" => Ok(Self::SquaredCosCapV2),
            other => Err(TrainingError::config(format!("unknown beta schedule: {}", other))),
        }
    }
}

pub struct DDPMScheduler {
    num_timesteps: usize,
    prediction_type: PredictionType,
    alphas_cumprod: Vec<f32>,

    // Lookup tables indexed by timestep
    sqrt_alphas_cumprod: Tensor,
    sqrt_one_minus_alphas_cumprod: Tensor,
    snr: Tensor,
    sigmas: Tensor,
}

impl DDPMScheduler {
    pub fn new(
        num_timesteps: usize,
        beta_start: f32,
        beta_end: f32,
        beta_schedule: BetaSchedule,
        prediction_type: PredictionType,
        device: &Device,
    ) -> Result<Self> {
        if num_timesteps < 4 {
            return Err(TrainingError::config(format!(
                "num_train_timesteps must be at least 4, got {}",
                num_timesteps
            ))
            .into());
        }

        let betas = match beta_schedule {
            BetaSchedule::Linear => Self::linear_betas(num_timesteps, beta_start, beta_end),
            BetaSchedule::ScaledLinear => Self::scaled_linear_betas(num_timesteps, beta_start, beta_end),
            BetaSchedule::SquaredCosCapV2 => Self::cosine_betas(num_timesteps),
        };

        let mut alphas_cumprod = Vec::with_capacity(num_timesteps);
        let mut running = 1.0f32;
        for beta in &betas {
            running *= 1.0 - beta;
            alphas_cumprod.push(running);
        }

        let sqrt_a: Vec<f32> = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_a: Vec<f32> = alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect();
        let snr: Vec<f32> = alphas_cumprod.iter().map(|a| a / (1.0 - a)).collect();
        // Euler sigmas
        let sigmas: Vec<f32> = alphas_cumprod.iter().map(|a| ((1.0 - a) / a).sqrt()).collect();

        Ok(Self {
            num_timesteps,
            prediction_type,
            sqrt_alphas_cumprod: Tensor::from_vec(sqrt_a, num_timesteps, device)?,
            sqrt_one_minus_alphas_cumprod: Tensor::from_vec(sqrt_one_minus_a, num_timesteps, device)?,
            snr: Tensor::from_vec(snr, num_timesteps, device)?,
            sigmas: Tensor::from_vec(sigmas, num_timesteps, device)?,
            alphas_cumprod,
        })
    }

    /// Pick per-item values from `table` and shape them to broadcast against `like`
    fn gather(table: &Tensor, timesteps: &Tensor, rank: usize, dtype: DType) -> Result<Tensor> {
        let batch_size = timesteps.dims()[0];
        // index_select expects timesteps to be i64
        let timesteps_i64 = timesteps.to_dtype(DType::I64)?;
        let values = table.index_select(&timesteps_i64, 0)?;
        let mut shape = vec![batch_size];
        shape.extend(std::iter::repeat(1).take(rank.saturating_sub(1)));
        Ok(values.reshape(shape)?.to_dtype(dtype)?)
    }

    /// noisy = sqrt(a_t) * original + sqrt(1 - a_t) * noise
    pub fn add_noise(&self, original_samples: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        let rank = original_samples.rank();
        let dtype = original_samples.dtype();
        let sqrt_alpha_prod = Self::gather(&self.sqrt_alphas_cumprod, timesteps, rank, dtype)?;
        let sqrt_one_minus_alpha_prod = Self::gather(&self.sqrt_one_minus_alphas_cumprod, timesteps, rank, dtype)?;

        let scaled_original = sqrt_alpha_prod.broadcast_mul(original_samples)?;
        let scaled_noise = sqrt_one_minus_alpha_prod.broadcast_mul(noise)?;
        Ok((scaled_original + scaled_noise)?)
    }

    /// v = sqrt(a_t) * noise - sqrt(1 - a_t) * sample
    pub fn get_velocity(&self, sample: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        let rank = sample.rank();
        let dtype = sample.dtype();
        let sqrt_alpha_prod = Self::gather(&self.sqrt_alphas_cumprod, timesteps, rank, dtype)?;
        let sqrt_one_minus_alpha_prod = Self::gather(&self.sqrt_one_minus_alphas_cumprod, timesteps, rank, dtype)?;

        let velocity = (sqrt_alpha_prod.broadcast_mul(noise)? - sqrt_one_minus_alpha_prod.broadcast_mul(sample)?)?;
        Ok(velocity)
    }

    /// Per-item SNR, shape `[batch]`, F32
    pub fn get_snr(&self, timesteps: &Tensor) -> Result<Tensor> {
        let timesteps_i64 = timesteps.to_dtype(DType::I64)?;
        Ok(self.snr.index_select(&timesteps_i64, 0)?)
    }

    /// Euler sigmas for `timesteps`, shaped `[batch, 1, ...]` to `n_dim` dims
    pub fn get_sigmas(&self, timesteps: &Tensor, n_dim: usize, dtype: DType) -> Result<Tensor> {
        Self::gather(&self.sigmas, timesteps, n_dim, dtype)
    }

    pub fn prediction_type(&self) -> PredictionType {
        self.prediction_type
    }

    pub fn is_v_prediction(&self) -> bool {
        self.prediction_type == PredictionType::VPrediction
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.num_timesteps
    }

    pub fn alphas_cumprod(&self) -> &[f32] {
        &self.alphas_cumprod
    }

    fn linear_betas(num_timesteps: usize, beta_start: f32, beta_end: f32) -> Vec<f32> {
        (0..num_timesteps)
            .map(|i| beta_start + (beta_end - beta_start) * (i as f32) / (num_timesteps as f32 - 1.0))
            .collect()
    }

    fn scaled_linear_betas(num_timesteps: usize, beta_start: f32, beta_end: f32) -> Vec<f32> {
        let start = beta_start.sqrt();
        let end = beta_end.sqrt();
        (0..num_timesteps)
            .map(|i| {
                let t = start + (end - start) * (i as f32) / (num_timesteps as f32 - 1.0);
                t * t
            })
            .collect()
    }

    fn cosine_betas(num_timesteps: usize) -> Vec<f32> {
        let s = 0.008f32;
        let alpha_bar = |t: f32| ((t + s) / (1.0 + s) * std::f32::consts::PI / 2.0).cos().powi(2);
        (0..num_timesteps)
            .map(|i| {
                let t1 = i as f32 / num_timesteps as f32;
                let t2 = (i + 1) as f32 / num_timesteps as f32;
                (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(prediction_type: PredictionType) -> Result<DDPMScheduler> {
        DDPMScheduler::new(1000, 0.00085, 0.012, BetaSchedule::ScaledLinear, prediction_type, &Device::Cpu)
    }

    #[test]
    fn test_alphas_cumprod_decreasing() -> Result<()> {
        let sched = scheduler(PredictionType::Epsilon)?;
        let a = sched.alphas_cumprod();
        assert_eq!(a.len(), 1000);
        assert!(a.windows(2).all(|w| w[1] < w[0]));
        assert!(a[0] < 1.0 && a[999] > 0.0);
        Ok(())
    }

    #[test]
    fn test_add_noise_at_first_step_keeps_signal() -> Result<()> {
        let sched = scheduler(PredictionType::Epsilon)?;
        let latents = Tensor::ones((2, 4, 8, 8), DType::F32, &Device::Cpu)?;
        let noise = Tensor::zeros((2, 4, 8, 8), DType::F32, &Device::Cpu)?;
        let t = Tensor::new(&[0i64, 0], &Device::Cpu)?;
        let noisy = sched.add_noise(&latents, &noise, &t)?;
        let expected = sched.alphas_cumprod()[0].sqrt();
        for value in noisy.flatten_all()?.to_vec1::<f32>()? {
            assert!((value - expected).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_sigmas_match_snr() -> Result<()> {
        let sched = scheduler(PredictionType::VPrediction)?;
        let t = Tensor::new(&[10i64, 500, 990], &Device::Cpu)?;
        let sigmas = sched.get_sigmas(&t, 4, DType::F32)?;
        assert_eq!(sigmas.dims(), &[3, 1, 1, 1]);
        let sigmas: Vec<f32> = sigmas.flatten_all()?.to_vec1()?;
        let snr: Vec<f32> = sched.get_snr(&t)?.to_vec1()?;
        for (sigma, snr) in sigmas.iter().zip(snr.iter()) {
            // sigma^2 = 1 / snr
            assert!((sigma * sigma * snr - 1.0).abs() < 1e-3);
        }
        assert!(sched.is_v_prediction());
        Ok(())
    }

    #[test]
    fn test_unknown_schedule_is_config_error() {
        let err = "cubic".parse::<BetaSchedule>().unwrap_err();
        assert!(matches!(err, TrainingError::Configuration(_)));
        assert!("sample".parse::<PredictionType>().is_err());
    }
}
