//! Trainable token embedding (textual inversion)

use anyhow::Result;
use candle_core::{Tensor, Var};

/// Rows of the token table that belong to a trigger word.
/// The whole table is handed to the optimizer; every other row is put back after each step.
pub struct TrainableEmbedding {
    table: Var,
    snapshot: Tensor,
    keep_mask: Tensor,
    pub trigger: String,
    pub tokens: usize,
    pub trigger_class_name: Option<String>,
}

impl TrainableEmbedding {
    pub fn new(
        table: Var,
        trigger: &str,
        tokens: usize,
        token_ids: &[u32],
        trigger_class_name: Option<String>,
    ) -> Result<Self> {
        let vocab = table.dims()[0];
        let mut mask = vec![0f32; vocab];
        for &id in token_ids {
            if let Some(m) = mask.get_mut(id as usize) {
                *m = 1.0;
            }
        }
        let keep_mask = Tensor::from_vec(mask, (vocab, 1), table.device())?.to_dtype(table.dtype())?;
        let snapshot = table.as_tensor().copy()?.detach();

        Ok(Self {
            table,
            snapshot,
            keep_mask,
            trigger: trigger.to_string(),
            tokens: tokens.max(1),
            trigger_class_name,
        })
    }

    /// `trigger trigger_1 ... trigger_{n-1}`
    pub fn expanded_trigger(&self) -> String {
        let mut words = vec![self.trigger.clone()];
        words.extend((1..self.tokens).map(|i| format!("{}_{}", self.trigger, i)));
        words.join(" ")
    }

    /// Swap `[name]`/`[trigger]`/the bare trigger for the expanded token list
    pub fn inject_embedding_to_prompt(&self, prompt: &str, add_if_not_present: bool) -> String {
        let expanded = self.expanded_trigger();
        let mut output = prompt.replace("[name]", &self.trigger).replace("[trigger]", &self.trigger);
        if output.contains(&self.trigger) && !output.contains(&expanded) {
            output = output.replacen(&self.trigger, &expanded, 1);
        }
        if add_if_not_present && !output.contains(&self.trigger) {
            output = if output.trim().is_empty() { expanded } else { format!("{} {}", expanded, output) };
        }
        output
    }

    /// Put every non-trigger row back to its snapshot value
    pub fn restore_embeddings(&self) -> Result<()> {
        let current = self.table.as_tensor();
        let keep = current.broadcast_mul(&self.keep_mask)?;
        let inverse = (self.keep_mask.ones_like()? - &self.keep_mask)?;
        let restored = (keep + self.snapshot.broadcast_mul(&inverse)?)?;
        self.table.set(&restored)?;
        Ok(())
    }

    pub fn vars(&self) -> Vec<(String, Var)> {
        vec![(format!("emb_params.{}", self.trigger), self.table.clone())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_inject_embedding() -> Result<()> {
        let table = Var::from_tensor(&Tensor::zeros((8, 4), DType::F32, &Device::Cpu)?)?;
        let emb = TrainableEmbedding::new(table, "zxc", 3, &[2, 3, 4], None)?;
        assert_eq!(emb.expanded_trigger(), "zxc zxc_1 zxc_2");
        assert_eq!(emb.inject_embedding_to_prompt("a [trigger] cat", true), "a zxc zxc_1 zxc_2 cat");
        assert_eq!(emb.inject_embedding_to_prompt("a cat", true), "zxc zxc_1 zxc_2 a cat");
        assert_eq!(emb.inject_embedding_to_prompt("a cat", false), "a cat");
        Ok(())
    }

    #[test]
    fn test_restore_keeps_only_trigger_rows() -> Result<()> {
        let device = Device::Cpu;
        let table = Var::from_tensor(&Tensor::zeros((4, 2), DType::F32, &device)?)?;
        let emb = TrainableEmbedding::new(table.clone(), "zxc", 1, &[1], None)?;

        // Simulated optimizer update on every row
        table.set(&Tensor::ones((4, 2), DType::F32, &device)?)?;
        emb.restore_embeddings()?;

        let rows: Vec<Vec<f32>> = table.as_tensor().to_vec2()?;
        assert_eq!(rows[0], vec![0.0, 0.0]);
        assert_eq!(rows[1], vec![1.0, 1.0]);
        assert_eq!(rows[3], vec![0.0, 0.0]);
        Ok(())
    }
}
