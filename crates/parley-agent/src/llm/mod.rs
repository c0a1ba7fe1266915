//! LLM client contract and wire types.

pub mod client;
pub mod types;

pub use client::{HttpLlmClient, HttpLlmConfig, LlmClient};
pub use types::{Message, Role};
