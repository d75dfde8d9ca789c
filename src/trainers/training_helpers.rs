//! Training helper structs and utilities

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use std::str::FromStr;

use super::errors::TrainingError;

/// Linear remap of `x` from `[in_min, in_max]` to `[out_min, out_max]`
pub fn value_map(x: f64, in_min: f64, in_max: f64, out_min: f64, out_max: f64) -> f64 {
    (x - in_min) * (out_max - out_min) / (in_max - in_min) + out_min
}

/// Tensor version of [`value_map`]
pub fn value_map_tensor(x: &Tensor, in_min: f64, in_max: f64, out_min: f64, out_max: f64) -> Result<Tensor> {
    Ok(x.affine((out_max - out_min) / (in_max - in_min), out_min - in_min * (out_max - out_min) / (in_max - in_min))?)
}

/// Gradient accumulation over several micro-steps
pub struct GradientAccumulator {
    steps: usize,
    vars: Vec<Var>,
    accumulated: Option<GradStore>,
}

impl GradientAccumulator {
    pub fn new(steps: usize, vars: Vec<Var>) -> Self {
        Self { steps: steps.max(1), vars, accumulated: None }
    }

    /// True when `step` only accumulates and must not step the optimizer
    pub fn is_accumulation_step(&self, step: usize) -> bool {
        (step + 1) % self.steps != 0
    }

    pub fn accumulate(&mut self, grads: GradStore) -> Result<()> {
        let mut acc = match self.accumulated.take() {
            None => {
                self.accumulated = Some(grads);
                return Ok(());
            }
            Some(acc) => acc,
        };
        for var in &self.vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let summed = match acc.get(var.as_tensor()) {
                    Some(prev) => (prev + grad)?,
                    None => grad.clone(),
                };
                acc.insert(var.as_tensor(), summed);
            }
        }
        self.accumulated = Some(acc);
        Ok(())
    }

    /// Accumulated gradients, leaving the accumulator empty
    pub fn take(&mut self) -> Option<GradStore> {
        self.accumulated.take()
    }

    pub fn has_grads(&self) -> bool {
        self.accumulated.is_some()
    }

    pub fn vars(&self) -> &[Var] {
        &self.vars
    }
}

/// Scale gradients so their global L2 norm is at most `max_norm`. Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut total = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            total += grad.to_dtype(candle_core::DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    let norm = total.sqrt();
    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let clipped = (grad * scale)?;
                grads.insert(var.as_tensor(), clipped);
            }
        }
    }
    Ok(norm)
}

/// Learning rate scheduler trait
pub trait LRScheduler {
    fn get_lr(&self, step: usize) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LrSchedulerType {
    Constant,
    Linear,
    Cosine,
}

impl FromStr for LrSchedulerType {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "constant" => Ok(Self::Constant),
            "linear" => Ok(Self::Linear),
            "cosine" => Ok(Self::Cosine),
            other => Err(TrainingError::config(format!("unknown lr_scheduler: {}", other))),
        }
    }
}

/// Create a learning rate scheduler
pub fn create_scheduler(
    scheduler_type: LrSchedulerType,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
) -> Box<dyn LRScheduler> {
    match scheduler_type {
        LrSchedulerType::Constant => Box::new(ConstantScheduler { base_lr, warmup_steps }),
        LrSchedulerType::Linear => Box::new(LinearScheduler { base_lr, warmup_steps, total_steps }),
        LrSchedulerType::Cosine => Box::new(CosineScheduler { base_lr, warmup_steps, total_steps }),
    }
}

fn warmup(base_lr: f64, step: usize, warmup_steps: usize) -> Option<f64> {
    if step < warmup_steps {
        Some(base_lr * (step + 1) as f64 / warmup_steps as f64)
    } else {
        None
    }
}

fn progress(step: usize, warmup_steps: usize, total_steps: usize) -> f64 {
    let span = total_steps.saturating_sub(warmup_steps).max(1);
    ((step - warmup_steps) as f64 / span as f64).min(1.0)
}

struct ConstantScheduler {
    base_lr: f64,
    warmup_steps: usize,
}

impl LRScheduler for ConstantScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        warmup(self.base_lr, step, self.warmup_steps).unwrap_or(self.base_lr)
    }
}

struct LinearScheduler {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl LRScheduler for LinearScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        warmup(self.base_lr, step, self.warmup_steps)
            .unwrap_or_else(|| self.base_lr * (1.0 - progress(step, self.warmup_steps, self.total_steps)))
    }
}

struct CosineScheduler {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl LRScheduler for CosineScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        warmup(self.base_lr, step, self.warmup_steps).unwrap_or_else(|| {
            let p = progress(step, self.warmup_steps, self.total_steps);
            self.base_lr * ((p * std::f64::consts::PI).cos() + 1.0) / 2.0
        })
    }
}

/// Scheduler plus the number of times it has been stepped
pub struct LrSchedule {
    scheduler: Box<dyn LRScheduler>,
    step: usize,
}

impl LrSchedule {
    pub fn new(scheduler: Box<dyn LRScheduler>) -> Self {
        Self { scheduler, step: 0 }
    }

    pub fn current_lr(&self) -> f64 {
        self.scheduler.get_lr(self.step)
    }

    /// Advance one step and return the new learning rate
    pub fn step(&mut self) -> f64 {
        self.step += 1;
        self.current_lr()
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    /// Jump to `step`, e.g. when resuming from a checkpoint
    pub fn set_step(&mut self, step: usize) -> f64 {
        self.step = step;
        self.current_lr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_value_map() -> Result<()> {
        assert!((value_map(0.5, 0.0, 1.0, 0.9, 1.1) - 1.0).abs() < 1e-12);
        assert_eq!(value_map(0.0, 0.0, 999.0, 100.0, 900.0), 100.0);
        let t = Tensor::new(&[0.0f32, 0.5, 1.0], &Device::Cpu)?;
        let mapped: Vec<f32> = value_map_tensor(&t, 0.5, 1.0, 0.0, 1.0)?.to_vec1()?;
        assert_eq!(mapped, vec![-1.0, 0.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_accumulation_steps() {
        let acc = GradientAccumulator::new(2, Vec::new());
        assert!(acc.is_accumulation_step(0));
        assert!(!acc.is_accumulation_step(1));
        let single = GradientAccumulator::new(1, Vec::new());
        assert!(!single.is_accumulation_step(0));
    }

    #[test]
    fn test_accumulate_sums_grads() -> Result<()> {
        let device = Device::Cpu;
        let w = Var::from_tensor(&Tensor::ones(3, DType::F32, &device)?)?;
        let mut acc = GradientAccumulator::new(2, vec![w.clone()]);

        let loss = (w.as_tensor() * 2.0)?.sum_all()?;
        acc.accumulate(loss.backward()?)?;
        let loss = (w.as_tensor() * 3.0)?.sum_all()?;
        acc.accumulate(loss.backward()?)?;

        let grads = acc.take().ok_or_else(|| anyhow::anyhow!("no grads"))?;
        let g: Vec<f32> = grads.get(w.as_tensor()).ok_or_else(|| anyhow::anyhow!("no grad"))?.to_vec1()?;
        assert_eq!(g, vec![5.0, 5.0, 5.0]);
        assert!(!acc.has_grads());
        Ok(())
    }

    #[test]
    fn test_clip_grad_norm() -> Result<()> {
        let device = Device::Cpu;
        let w = Var::from_tensor(&Tensor::ones(4, DType::F32, &device)?)?;
        let loss = (w.as_tensor() * 10.0)?.sum_all()?;
        let mut grads = loss.backward()?;
        let norm = clip_grad_norm(&mut grads, &[w.clone()], 1.0)?;
        assert!((norm - 20.0).abs() < 1e-4);
        let g = grads.get(w.as_tensor()).ok_or_else(|| anyhow::anyhow!("no grad"))?;
        let clipped = g.sqr()?.sum_all()?.to_scalar::<f32>()?.sqrt();
        assert!((clipped - 1.0).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn test_schedulers() {
        let cosine = create_scheduler(LrSchedulerType::Cosine, 1.0, 0, 100);
        assert!((cosine.get_lr(0) - 1.0).abs() < 1e-9);
        assert!(cosine.get_lr(100).abs() < 1e-9);
        let linear = create_scheduler(LrSchedulerType::Linear, 1.0, 10, 110);
        assert!((linear.get_lr(4) - 0.5).abs() < 1e-9);
        assert!((linear.get_lr(60) - 0.5).abs() < 1e-9);
        let mut schedule = LrSchedule::new(create_scheduler(LrSchedulerType::Constant, 1e-4, 0, 10));
        assert_eq!(schedule.step(), 1e-4);
        assert_eq!(schedule.steps_taken(), 1);
        assert!("polynomial".parse::<LrSchedulerType>().is_err());
    }
}
