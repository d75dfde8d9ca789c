//! Model-side collaborators of the trainer
//!
//! The denoising model boundary, prompt embeddings, the trainable network and its
//! activation state, conditioning adapters and token embeddings

pub mod adapters;
pub mod denoiser;
pub mod embedding;
pub mod linear_denoiser;
pub mod network;
pub mod prompt;

pub use adapters::{Adapter, AdapterActivation, AdapterKind};
pub use denoiser::{
    AssistantAdapter, AssistantKind, DenoisingModel, EncodeOptions, ForwardContext, PredictionKwargs, PredictionRequest,
};
pub use embedding::TrainableEmbedding;
pub use linear_denoiser::{ChannelResidualAssistant, LinearDenoiser, LinearDenoiserConfig};
pub use network::{LoRALinear, Multiplier, NetworkState, StateGuard};
pub use prompt::{concat_prompt_embeds, PromptEmbeds};
