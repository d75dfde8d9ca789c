//! Training batches and the cached-latent batch provider
//!
//! A dataset folder holds one `*.safetensors` latent cache per image plus a caption file
//! with the same stem. Cache keys:
//! - `latents` (required), `[c, h, w]`
//! - `unconditional_latents`, `[c, h, w]`
//! - `mask`, `[1, h, w]`
//! - `unaugmented`, `control`, `clip_image`: pixels in `[0, 1]`, `[3, H, W]`

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::errors::TrainingError;
use super::DatasetConfig;

/// Per-image metadata
#[derive(Debug, Clone)]
pub struct FileItem {
    pub path: PathBuf,
    pub caption: String,
    pub is_reg: bool,
    pub network_weight: f64,
    pub loss_multiplier: f64,
    pub guidance_type: Option<String>,
    pub mask_min_value: f64,
}

impl FileItem {
    pub fn new(path: impl Into<PathBuf>, caption: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            caption: caption.into(),
            is_reg: false,
            network_weight: 1.0,
            loss_multiplier: 1.0,
            guidance_type: None,
            mask_min_value: 0.0,
        }
    }

    pub fn from_dataset(path: PathBuf, caption: String, config: &DatasetConfig) -> Self {
        Self {
            path,
            caption,
            is_reg: config.is_reg,
            network_weight: config.network_weight,
            loss_multiplier: config.loss_multiplier,
            guidance_type: config.guidance_type.clone(),
            mask_min_value: config.mask_min_value,
        }
    }
}

/// One step's worth of data. Every tensor shares the leading batch dimension.
#[derive(Debug, Default)]
pub struct TrainingBatch {
    pub file_items: Vec<FileItem>,
    pub latents: Option<Tensor>,
    /// Pixels, used when latents are not cached
    pub tensor: Option<Tensor>,
    pub unconditional_latents: Option<Tensor>,
    pub mask_tensor: Option<Tensor>,
    pub unaugmented_tensor: Option<Tensor>,
    pub control_tensor: Option<Tensor>,
    pub clip_image_tensor: Option<Tensor>,
    /// Filled by the sampler for source-space targets
    pub sigmas: Option<Tensor>,
}

impl TrainingBatch {
    pub fn new(file_items: Vec<FileItem>) -> Self {
        Self {
            file_items,
            latents: None,
            tensor: None,
            unconditional_latents: None,
            mask_tensor: None,
            unaugmented_tensor: None,
            control_tensor: None,
            clip_image_tensor: None,
            sigmas: None,
        }
    }

    pub fn len(&self) -> usize {
        self.file_items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.file_items.is_empty()
    }

    fn tensors(&self) -> [(&'static str, Option<&Tensor>); 8] {
        [
            ("latents", self.latents.as_ref()),
            ("tensor", self.tensor.as_ref()),
            ("unconditional_latents", self.unconditional_latents.as_ref()),
            ("mask", self.mask_tensor.as_ref()),
            ("unaugmented", self.unaugmented_tensor.as_ref()),
            ("control", self.control_tensor.as_ref()),
            ("clip_image", self.clip_image_tensor.as_ref()),
            ("sigmas", self.sigmas.as_ref()),
        ]
    }

    /// Check every tensor against the number of file items
    pub fn validate(&self) -> Result<()> {
        let n = self.len();
        if self.latents.is_none() && self.tensor.is_none() {
            return Err(TrainingError::data_contract("batch has neither latents nor pixels", self.file_paths()).into());
        }
        for (name, tensor) in self.tensors() {
            if let Some(t) = tensor {
                let lead = t.dims().first().copied().unwrap_or(0);
                if lead != n {
                    return Err(TrainingError::data_contract(
                        format!("{} has batch dimension {} but the batch holds {} items", name, lead, n),
                        self.file_paths(),
                    )
                    .into());
                }
            }
        }
        Ok(())
    }

    pub fn device(&self) -> Result<Device> {
        self.tensors()
            .iter()
            .find_map(|(_, t)| t.map(|t| t.device().clone()))
            .ok_or_else(|| TrainingError::data_contract("batch holds no tensors", self.file_paths()).into())
    }

    pub fn latents_or_err(&self) -> Result<&Tensor> {
        self.latents
            .as_ref()
            .ok_or_else(|| TrainingError::data_contract("batch latents are missing", self.file_paths()).into())
    }

    pub fn caption_list(&self) -> Vec<String> {
        self.file_items.iter().map(|f| f.caption.clone()).collect()
    }

    pub fn is_reg_list(&self) -> Vec<bool> {
        self.file_items.iter().map(|f| f.is_reg).collect()
    }

    pub fn network_weight_list(&self) -> Vec<f64> {
        self.file_items.iter().map(|f| f.network_weight).collect()
    }

    pub fn loss_multiplier_list(&self) -> Vec<f64> {
        self.file_items.iter().map(|f| f.loss_multiplier).collect()
    }

    pub fn file_paths(&self) -> Vec<PathBuf> {
        self.file_items.iter().map(|f| f.path.clone()).collect()
    }

    /// Guidance type shared by every item. Mixed types are rejected.
    pub fn guidance_type(&self) -> Result<Option<String>> {
        let first = match self.file_items.first() {
            Some(f) => f.guidance_type.clone(),
            None => return Ok(None),
        };
        if self.file_items.iter().any(|f| f.guidance_type != first) {
            return Err(TrainingError::config(format!(
                "batch mixes guidance types: {:?}",
                self.file_items.iter().map(|f| f.guidance_type.clone()).collect::<Vec<_>>()
            ))
            .into());
        }
        Ok(first)
    }

    /// One-item sub-batches
    pub fn split(&self) -> Result<Vec<TrainingBatch>> {
        let narrow = |t: &Option<Tensor>, i: usize| -> Result<Option<Tensor>> {
            match t {
                Some(t) => Ok(Some(t.narrow(0, i, 1)?)),
                None => Ok(None),
            }
        };
        (0..self.len())
            .map(|i| {
                Ok(TrainingBatch {
                    file_items: vec![self.file_items[i].clone()],
                    latents: narrow(&self.latents, i)?,
                    tensor: narrow(&self.tensor, i)?,
                    unconditional_latents: narrow(&self.unconditional_latents, i)?,
                    mask_tensor: narrow(&self.mask_tensor, i)?,
                    unaugmented_tensor: narrow(&self.unaugmented_tensor, i)?,
                    control_tensor: narrow(&self.control_tensor, i)?,
                    clip_image_tensor: narrow(&self.clip_image_tensor, i)?,
                    sigmas: narrow(&self.sigmas, i)?,
                })
            })
            .collect()
    }

    /// Release every tensor held by the batch
    pub fn cleanup(&mut self) {
        self.latents = None;
        self.tensor = None;
        self.unconditional_latents = None;
        self.mask_tensor = None;
        self.unaugmented_tensor = None;
        self.control_tensor = None;
        self.clip_image_tensor = None;
        self.sigmas = None;
    }
}

impl Drop for TrainingBatch {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Source of training batches, epoch by epoch
pub trait BatchProvider {
    /// Next batch of the current epoch, `None` once it is exhausted
    fn next_batch(&mut self) -> Result<Option<TrainingBatch>>;

    /// Start a new epoch
    fn reset(&mut self) -> Result<()>;

    /// Number of items per epoch
    fn num_items(&self) -> usize;
}

/// Next batch, starting a new epoch and retrying once when the current one is exhausted
pub fn fetch_batch(provider: &mut dyn BatchProvider) -> Result<TrainingBatch> {
    if let Some(batch) = provider.next_batch()? {
        return Ok(batch);
    }
    debug!("Epoch exhausted, resetting data loader");
    provider.reset()?;
    provider
        .next_batch()?
        .ok_or_else(|| anyhow::anyhow!("data loader produced no batch after reset"))
}

struct CacheEntry {
    cache_path: PathBuf,
    caption: String,
}

/// Batches from a folder of latent caches
pub struct CachedLatentLoader {
    config: DatasetConfig,
    entries: Vec<CacheEntry>,
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    device: Device,
    dtype: DType,
    rng: StdRng,
}

impl CachedLatentLoader {
    pub fn new(config: &DatasetConfig, batch_size: usize, device: &Device, dtype: DType, seed: Option<u64>) -> Result<Self> {
        let entries = Self::scan_dataset(config)?;
        if entries.is_empty() {
            return Err(anyhow::anyhow!("No latent caches found in {}", config.folder_path.display()));
        }
        info!(
            "Dataset {}: {} cached items{}",
            config.folder_path.display(),
            entries.len(),
            if config.is_reg { " (regularization)" } else { "" }
        );

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut loader = Self {
            config: config.clone(),
            order: (0..entries.len()).collect(),
            entries,
            cursor: 0,
            batch_size: batch_size.max(1),
            device: device.clone(),
            dtype,
            rng,
        };
        loader.reset()?;
        Ok(loader)
    }

    fn scan_dataset(config: &DatasetConfig) -> Result<Vec<CacheEntry>> {
        let dir = fs::read_dir(&config.folder_path)
            .with_context(|| format!("Failed to read dataset directory: {}", config.folder_path.display()))?;

        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in dir {
            let path = entry?.path();
            if path.extension().map(|e| e == "safetensors").unwrap_or(false) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut entries = Vec::with_capacity(paths.len());
        for cache_path in paths {
            let caption_path = cache_path.with_extension(&config.caption_ext);
            let caption = if caption_path.exists() {
                fs::read_to_string(&caption_path)
                    .with_context(|| format!("Failed to read caption: {}", caption_path.display()))?
                    .trim()
                    .to_string()
            } else {
                warn!("No caption file for {}, using default caption", cache_path.display());
                config.default_caption.clone()
            };
            entries.push(CacheEntry { cache_path, caption });
        }
        Ok(entries)
    }

    fn load_item(&self, path: &Path) -> Result<HashMap<String, Tensor>> {
        let tensors = candle_core::safetensors::load(path, &self.device)
            .with_context(|| format!("Failed to load latent cache: {}", path.display()))?;
        let mut out = HashMap::with_capacity(tensors.len());
        for (key, tensor) in tensors {
            let tensor = if tensor.rank() == 3 { tensor.unsqueeze(0)? } else { tensor };
            out.insert(key, tensor.to_dtype(self.dtype)?);
        }
        if !out.contains_key("latents") {
            return Err(TrainingError::data_contract("latent cache has no `latents` entry", vec![path.to_path_buf()]).into());
        }
        Ok(out)
    }

    fn stack(items: &[HashMap<String, Tensor>], key: &str, paths: &[PathBuf]) -> Result<Option<Tensor>> {
        let present: Vec<&Tensor> = items.iter().filter_map(|m| m.get(key)).collect();
        if present.is_empty() {
            return Ok(None);
        }
        if present.len() != items.len() {
            return Err(TrainingError::data_contract(
                format!("`{}` is present for some items of the batch but not all", key),
                paths.to_vec(),
            )
            .into());
        }
        let stacked = Tensor::cat(&present, 0).with_context(|| format!("Failed to batch `{}`", key))?;
        Ok(Some(stacked))
    }
}

impl BatchProvider for CachedLatentLoader {
    fn next_batch(&mut self) -> Result<Option<TrainingBatch>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices: Vec<usize> = self.order[self.cursor..end].to_vec();
        self.cursor = end;

        let mut file_items = Vec::with_capacity(indices.len());
        let mut loaded = Vec::with_capacity(indices.len());
        for idx in indices {
            let entry = &self.entries[idx];
            loaded.push(self.load_item(&entry.cache_path)?);
            file_items.push(FileItem::from_dataset(entry.cache_path.clone(), entry.caption.clone(), &self.config));
        }
        let paths: Vec<PathBuf> = file_items.iter().map(|f| f.path.clone()).collect();

        let mut batch = TrainingBatch::new(file_items);
        batch.latents = Self::stack(&loaded, "latents", &paths)?;
        batch.unconditional_latents = Self::stack(&loaded, "unconditional_latents", &paths)?;
        batch.mask_tensor = Self::stack(&loaded, "mask", &paths)?;
        batch.unaugmented_tensor = Self::stack(&loaded, "unaugmented", &paths)?;
        batch.control_tensor = Self::stack(&loaded, "control", &paths)?;
        batch.clip_image_tensor = Self::stack(&loaded, "clip_image", &paths)?;
        batch.validate()?;
        Ok(Some(batch))
    }

    fn reset(&mut self) -> Result<()> {
        self.order.shuffle(&mut self.rng);
        self.cursor = 0;
        Ok(())
    }

    fn num_items(&self) -> usize {
        self.entries.len()
    }
}

/// Write a latent cache file in the layout [`CachedLatentLoader`] reads
pub fn save_latent_cache(path: &Path, tensors: &HashMap<String, Tensor>) -> Result<()> {
    candle_core::safetensors::save(tensors, path)
        .with_context(|| format!("Failed to write latent cache: {}", path.display()))?;
    Ok(())
}
