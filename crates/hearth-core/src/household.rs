//! Household directory trait.

use hearth_types::error::EngineError;
use hearth_types::household::HouseholdView;

/// Provides the household view the scope resolver and prompt payloads
/// consume. The production implementation in `hearth-infra` caches the view
/// per process with a short TTL (~60 s).
pub trait HouseholdDirectory: Send + Sync {
    fn view(
        &self,
    ) -> impl std::future::Future<Output = Result<HouseholdView, EngineError>> + Send;
}
