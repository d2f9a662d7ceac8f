//! Shared domain types for Hearth.
//!
//! This crate has no I/O dependencies; everything here is plain data,
//! serde-serializable, and consumed by `hearth-core` (engine logic),
//! `hearth-infra` (persistence and HTTP clients), `hearth-tools` (the tool
//! service), and `hearth-api` (ingress).

pub mod analysis;
pub mod config;
pub mod error;
pub mod experiment;
pub mod household;
pub mod memory;
pub mod message;
pub mod principal;
pub mod prompt;
pub mod scope;
pub mod tool;
