//! Concrete infrastructure for Hearth.
//!
//! Implements the `hearth-core` traits: Postgres-backed stores (memories,
//! reminders, principals, households), the OpenAI-compatible LLM client,
//! local/remote embedding providers, and the HTTP client for the tool
//! service.

pub mod llm;
pub mod media;
pub mod postgres;
pub mod tools;
