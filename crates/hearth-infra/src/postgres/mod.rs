//! Postgres-backed stores.

pub mod extract;
pub mod household;
pub mod memory;
pub mod pool;
pub mod principal;
pub mod reminder;

pub use pool::connect;
