//! Error taxonomy for the training step engine

use log::warn;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal training errors. Both variants abort the current job.
#[derive(Debug, Error)]
pub enum TrainingError {
    /// Unknown enum value or invalid option combination in the job config.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A batch is missing a field the active adapter or strategy needs.
    #[error("data contract error: {message}{}", PathList(paths))]
    DataContract {
        message: String,
        paths: Vec<PathBuf>,
    },
}

impl TrainingError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn data_contract(message: impl Into<String>, paths: Vec<PathBuf>) -> Self {
        Self::DataContract { message: message.into(), paths }
    }
}

struct PathList<'a>(&'a [PathBuf]);

impl fmt::Display for PathList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return Ok(());
        }
        write!(f, " (files:")?;
        for path in self.0 {
            write!(f, " {}", path.display())?;
        }
        write!(f, ")")
    }
}

/// Counts recoverable numeric events. NaN losses never abort a step.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InstabilityStats {
    pub nan_losses: usize,
    pub nan_prior_losses: usize,
}

impl InstabilityStats {
    pub fn record_nan_loss(&mut self, step: usize) {
        self.nan_losses += 1;
        warn!("Loss is NaN at step {} (total {}), substituting zero loss", step, self.nan_losses);
    }

    pub fn record_nan_prior_loss(&mut self) {
        self.nan_prior_losses += 1;
        warn!("Prior loss is NaN (total {}), discarding the term", self.nan_prior_losses);
    }

    pub fn total(&self) -> usize {
        self.nan_losses + self.nan_prior_losses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_contract_lists_paths() {
        let err = TrainingError::data_contract(
            "could not find clip image",
            vec![PathBuf::from("a.png"), PathBuf::from("b.png")],
        );
        let msg = err.to_string();
        assert!(msg.contains("could not find clip image"));
        assert!(msg.contains("a.png"));
        assert!(msg.contains("b.png"));
    }

    #[test]
    fn test_instability_counts() {
        let mut stats = InstabilityStats::default();
        stats.record_nan_loss(3);
        stats.record_nan_prior_loss();
        stats.record_nan_prior_loss();
        assert_eq!(stats.nan_losses, 1);
        assert_eq!(stats.nan_prior_losses, 2);
        assert_eq!(stats.total(), 3);
    }
}
