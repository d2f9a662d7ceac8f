//! Tool service client trait.

use hearth_types::error::EngineError;
use hearth_types::tool::ToolSpec;
use serde_json::Value;

/// Client for the generic tool service.
///
/// `call` carries no timeout of its own; the executor wraps each step in
/// its per-tool budget. Implementations live in `hearth-infra::tools`.
pub trait ToolClient: Send + Sync {
    fn call(
        &self,
        tool: &str,
        args: Value,
    ) -> impl std::future::Future<Output = Result<Value, EngineError>> + Send;

    /// The live tool catalog. Implementations may cache this briefly.
    fn specs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<ToolSpec>, EngineError>> + Send;
}
