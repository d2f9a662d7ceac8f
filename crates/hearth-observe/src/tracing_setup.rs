//! Tracing subscriber initialization with structured logging.
//!
//! Both binaries (the ingress API and the tool service) call
//! [`init_tracing`] first thing in `main`. Log routing to an external
//! backend is a deployment concern; the process only emits structured
//! events on stdout.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize the global tracing subscriber.
///
/// - Structured `fmt` layer with target visibility and span close timing.
/// - Respects `RUST_LOG` via `EnvFilter::from_default_env()`; defaults to
///   `info` when unset.
///
/// # Errors
///
/// Returns an error if a global subscriber was already installed.
pub fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}
