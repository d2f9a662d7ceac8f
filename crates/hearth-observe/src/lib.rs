//! Tracing subscriber initialization shared by the Hearth binaries.

pub mod tracing_setup;
