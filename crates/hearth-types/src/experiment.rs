//! A/B experiment configuration and result records.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Paused,
    Completed,
    Terminated,
}

/// One treatment arm with its slice of the 0..100 hash space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    /// Variant label, e.g. "treatment_0".
    pub variant: String,
    /// Prompt version this variant routes to.
    pub prompt_version: String,
    /// Percentage points of traffic (bands are laid out in declaration
    /// order; the remainder goes to control).
    pub percent: u8,
}

/// Experiment definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub id: String,
    pub name: String,
    pub status: ExperimentStatus,

    /// Prompt version the control arm uses.
    pub control_version: String,

    #[serde(default)]
    pub treatments: Vec<Allocation>,

    /// Restrict the experiment to these channels; empty means all.
    #[serde(default)]
    pub target_channels: Vec<String>,

    /// Rolling-window error-rate guard.
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,

    #[serde(default = "default_error_window")]
    pub error_window: usize,

    #[serde(default = "default_min_sample_size")]
    pub min_sample_size: usize,
}

fn default_max_error_rate() -> f64 {
    0.05
}

fn default_error_window() -> usize {
    50
}

fn default_min_sample_size() -> usize {
    100
}

/// Outcome of one message under an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentResult {
    pub user_id: Uuid,
    pub experiment_id: String,
    pub variant: String,
    pub trace_id: Uuid,

    #[serde(default)]
    pub channel: Option<String>,

    pub response_time_ms: u64,
    pub success: bool,

    #[serde(default)]
    pub error_kind: Option<String>,

    #[serde(default)]
    pub need_clarification: bool,

    #[serde(default)]
    pub tool_calls_count: u32,

    #[serde(default)]
    pub response_length: u32,
}
