//! Encoded prompt embeddings and caption rewriting

use anyhow::Result;
use candle_core::{DType, Tensor};

/// Text encoder output for a batch of captions
#[derive(Debug, Clone)]
pub struct PromptEmbeds {
    /// `[batch, tokens, dim]`
    pub text_embeds: Tensor,
    /// `[batch, dim]`, present for encoders with a pooled projection
    pub pooled_embeds: Option<Tensor>,
}

impl PromptEmbeds {
    pub fn new(text_embeds: Tensor, pooled_embeds: Option<Tensor>) -> Self {
        Self { text_embeds, pooled_embeds }
    }

    pub fn batch_size(&self) -> usize {
        self.text_embeds.dims()[0]
    }

    pub fn num_tokens(&self) -> usize {
        self.text_embeds.dims().get(1).copied().unwrap_or(0)
    }

    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        Ok(Self {
            text_embeds: self.text_embeds.to_dtype(dtype)?,
            pooled_embeds: match &self.pooled_embeds {
                Some(p) => Some(p.to_dtype(dtype)?),
                None => None,
            },
        })
    }

    pub fn detach(&self) -> Self {
        Self {
            text_embeds: self.text_embeds.detach(),
            pooled_embeds: self.pooled_embeds.as_ref().map(|p| p.detach()),
        }
    }

    /// Drop the last `n` tokens, e.g. image tokens appended by a conditioning adapter
    pub fn strip_trailing_tokens(&self, n: usize) -> Result<Self> {
        if n == 0 {
            return Ok(self.clone());
        }
        let tokens = self.num_tokens();
        let keep = tokens.saturating_sub(n);
        Ok(Self {
            text_embeds: self.text_embeds.narrow(1, 0, keep)?,
            pooled_embeds: self.pooled_embeds.clone(),
        })
    }
}

/// Concatenate embeddings along the batch axis
pub fn concat_prompt_embeds(embeds: &[&PromptEmbeds]) -> Result<PromptEmbeds> {
    let text: Vec<&Tensor> = embeds.iter().map(|e| &e.text_embeds).collect();
    let text_embeds = Tensor::cat(&text, 0)?;
    let pooled_embeds = if embeds.iter().all(|e| e.pooled_embeds.is_some()) {
        let pooled: Vec<&Tensor> = embeds.iter().filter_map(|e| e.pooled_embeds.as_ref()).collect();
        Some(Tensor::cat(&pooled, 0)?)
    } else {
        None
    };
    Ok(PromptEmbeds { text_embeds, pooled_embeds })
}

/// Replace `[trigger]` with the trigger word and prepend it when absent
pub fn inject_trigger_into_prompt(prompt: &str, trigger: Option<&str>, add_if_not_present: bool) -> String {
    let trigger = match trigger {
        Some(t) if !t.is_empty() => t,
        _ => return prompt.replace("[trigger]", "").trim().to_string(),
    };
    let output = prompt.replace("[trigger]", trigger);
    if add_if_not_present && !output.contains(trigger) {
        if output.trim().is_empty() {
            return trigger.to_string();
        }
        return format!("{}, {}", trigger, output);
    }
    output
}

/// Swap every trigger form for the class name so the base model sees the plain concept
pub fn substitute_triggers(prompt: &str, triggers: &[&str], class_name: &str) -> String {
    let mut output = prompt.replace("[trigger]", class_name).replace("[name]", class_name);
    for trigger in triggers.iter().filter(|t| !t.is_empty()) {
        output = output.replace(trigger, class_name);
    }
    output
}

/// Remove the extra `trigger_i` tokens an embedding expands into
pub fn remove_embedding_tokens(prompt: &str, trigger: &str) -> String {
    let prefix = format!("{}_", trigger);
    prompt
        .split_whitespace()
        .filter(|word| {
            let bare = word.trim_end_matches(',');
            !(bare.starts_with(&prefix) && bare[prefix.len()..].chars().all(|c| c.is_ascii_digit()))
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_inject_trigger() {
        assert_eq!(inject_trigger_into_prompt("a photo of [trigger]", Some("sks"), true), "a photo of sks");
        assert_eq!(inject_trigger_into_prompt("a photo", Some("sks"), true), "sks, a photo");
        assert_eq!(inject_trigger_into_prompt("a photo", Some("sks"), false), "a photo");
        assert_eq!(inject_trigger_into_prompt("[trigger] dog", None, true), "dog");
    }

    #[test]
    fn test_substitute_and_remove() {
        let p = substitute_triggers("sks dog next to [name]", &["sks"], "dog");
        assert_eq!(p, "dog dog next to dog");
        assert_eq!(remove_embedding_tokens("emb emb_1 emb_2, a cat", "emb"), "emb a cat");
    }

    #[test]
    fn test_strip_and_concat() -> Result<()> {
        let device = Device::Cpu;
        let a = PromptEmbeds::new(Tensor::zeros((1, 6, 8), DType::F32, &device)?, None);
        let b = PromptEmbeds::new(Tensor::ones((1, 6, 8), DType::F32, &device)?, None);
        let both = concat_prompt_embeds(&[&a, &b])?;
        assert_eq!(both.text_embeds.dims(), &[2, 6, 8]);
        assert!(both.pooled_embeds.is_none());
        let stripped = both.strip_trailing_tokens(4)?;
        assert_eq!(stripped.num_tokens(), 2);
        Ok(())
    }
}
