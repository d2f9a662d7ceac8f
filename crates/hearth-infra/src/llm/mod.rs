//! LLM provider clients and embedding providers.

pub mod embedding;
pub mod openai_compat;
