//! Tool-service clients.

pub mod http;

pub use http::HttpToolClient;
