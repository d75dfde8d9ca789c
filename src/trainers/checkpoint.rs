//! Step checkpoints of the trainable parameters
//!
//! Files are `{name}_{step:09}.safetensors` in the training folder, carrying
//! `format`, `rank`, `alpha` and `step` as safetensors metadata.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use log::{info, warn};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::{serialize, SafeTensors};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const FORMAT: &str = "eridiffusion-tuner";

/// Metadata written next to the tensors
#[derive(Debug, Clone, Default)]
pub struct CheckpointMeta {
    pub rank: Option<usize>,
    pub alpha: Option<f32>,
}

pub fn checkpoint_path(dir: &Path, name: &str, step: usize) -> PathBuf {
    dir.join(format!("{}_{:09}.safetensors", name, step))
}

/// Step encoded in a checkpoint file name of job `name`
fn parse_step(path: &Path, name: &str) -> Option<usize> {
    let stem = path.file_name()?.to_str()?.strip_suffix(".safetensors")?;
    let digits = stem.strip_prefix(name)?.strip_prefix('_')?;
    if digits.len() != 9 {
        return None;
    }
    digits.parse().ok()
}

/// Checkpoints of job `name`, oldest first
pub fn list_checkpoints(dir: &Path, name: &str) -> Result<Vec<(usize, PathBuf)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let path = entry?.path();
        if let Some(step) = parse_step(&path, name) {
            found.push((step, path));
        }
    }
    found.sort();
    Ok(found)
}

pub fn latest_checkpoint(dir: &Path, name: &str) -> Result<Option<(usize, PathBuf)>> {
    Ok(list_checkpoints(dir, name)?.pop())
}

fn tensor_bytes(tensor: &Tensor) -> Result<Vec<u8>> {
    let values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    Ok(values.iter().flat_map(|v| v.to_le_bytes()).collect())
}

/// Write all named vars as F32 and return the file path
pub fn save_checkpoint(
    dir: &Path,
    name: &str,
    step: usize,
    vars: &[(String, Var)],
    meta: &CheckpointMeta,
) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = checkpoint_path(dir, name, step);

    let mut data = Vec::with_capacity(vars.len());
    for (_, var) in vars {
        data.push(tensor_bytes(var.as_tensor())?);
    }
    let mut views = HashMap::new();
    for ((key, var), bytes) in vars.iter().zip(data.iter()) {
        views.insert(key.clone(), TensorView::new(Dtype::F32, var.dims().to_vec(), bytes)?);
    }

    let mut metadata = HashMap::new();
    metadata.insert("format".to_string(), FORMAT.to_string());
    metadata.insert("step".to_string(), step.to_string());
    if let Some(rank) = meta.rank {
        metadata.insert("rank".to_string(), rank.to_string());
    }
    if let Some(alpha) = meta.alpha {
        metadata.insert("alpha".to_string(), alpha.to_string());
    }

    let serialized = serialize(&views, &Some(metadata))?;
    fs::write(&path, serialized).with_context(|| format!("Failed to write checkpoint {}", path.display()))?;
    info!("Saved checkpoint to {}", path.display());
    Ok(path)
}

/// Load tensors into the matching vars and return the stored step
pub fn load_checkpoint(path: &Path, vars: &[(String, Var)], device: &Device) -> Result<usize> {
    let buffer = fs::read(path).with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
    let (_, metadata) = SafeTensors::read_metadata(&buffer)?;
    let step = metadata
        .metadata()
        .as_ref()
        .and_then(|m| m.get("step"))
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(0);

    let tensors = candle_core::safetensors::load_buffer(&buffer, device)?;
    for (key, var) in vars {
        match tensors.get(key) {
            Some(tensor) => var.set(&tensor.to_dtype(var.dtype())?)?,
            None => warn!("Checkpoint {} has no tensor {}, keeping current values", path.display(), key),
        }
    }
    info!("Loaded checkpoint {} (step {})", path.display(), step);
    Ok(step)
}

/// Delete the oldest checkpoints until at most `keep` remain
pub fn prune_checkpoints(dir: &Path, name: &str, keep: usize) -> Result<Vec<PathBuf>> {
    let found = list_checkpoints(dir, name)?;
    let excess = found.len().saturating_sub(keep);
    let mut removed = Vec::new();
    for (_, path) in found.into_iter().take(excess) {
        fs::remove_file(&path).with_context(|| format!("Failed to remove {}", path.display()))?;
        removed.push(path);
    }
    if !removed.is_empty() {
        info!("Removed {} old checkpoint(s)", removed.len());
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vars() -> Result<Vec<(String, Var)>> {
        let device = Device::Cpu;
        Ok(vec![
            ("lora_down.weight".to_string(), Var::from_tensor(&Tensor::randn(0.0f32, 1.0, (4, 8), &device)?)?),
            ("lora_up.weight".to_string(), Var::from_tensor(&Tensor::randn(0.0f32, 1.0, (8, 4), &device)?)?),
        ])
    }

    #[test]
    fn test_save_and_load_restores_values() -> Result<()> {
        let dir = TempDir::new()?;
        let saved = vars()?;
        let meta = CheckpointMeta { rank: Some(4), alpha: Some(4.0) };
        let path = save_checkpoint(dir.path(), "sks", 120, &saved, &meta)?;
        assert!(path.ends_with("sks_000000120.safetensors"));

        let loaded = vars()?;
        let step = load_checkpoint(&path, &loaded, &Device::Cpu)?;
        assert_eq!(step, 120);
        for ((_, a), (_, b)) in saved.iter().zip(loaded.iter()) {
            let diff = (a.as_tensor() - b.as_tensor())?.abs()?.max_all()?.to_scalar::<f32>()?;
            assert_eq!(diff, 0.0);
        }
        Ok(())
    }

    #[test]
    fn test_prune_keeps_newest() -> Result<()> {
        let dir = TempDir::new()?;
        let vars = vars()?;
        for step in [10, 20, 30, 40] {
            save_checkpoint(dir.path(), "sks", step, &vars, &CheckpointMeta::default())?;
        }
        fs::write(dir.path().join("other_000000001.safetensors"), b"x")?;

        let removed = prune_checkpoints(dir.path(), "sks", 2)?;
        assert_eq!(removed.len(), 2);
        let steps: Vec<usize> = list_checkpoints(dir.path(), "sks")?.into_iter().map(|(s, _)| s).collect();
        assert_eq!(steps, vec![30, 40]);
        assert_eq!(latest_checkpoint(dir.path(), "sks")?.map(|(s, _)| s), Some(40));
        assert!(dir.path().join("other_000000001.safetensors").exists());
        Ok(())
    }
}
