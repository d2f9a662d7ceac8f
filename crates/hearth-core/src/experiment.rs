//! A/B assignment: deterministic hash banding plus a rolling error-rate
//! guard that pauses a misbehaving treatment.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use hearth_types::experiment::{ExperimentConfig, ExperimentResult, ExperimentStatus};

/// The variant label used for the control arm.
pub const CONTROL: &str = "control";

/// One user's assignment for a message.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    /// `None` when no experiment applied (pure default routing).
    pub experiment_id: Option<String>,
    pub variant: String,
    pub prompt_version: String,
}

struct GuardState {
    window: VecDeque<bool>,
    total_seen: usize,
}

/// Assignment engine. Configs are immutable after construction; runtime
/// status changes (the pause guard) live in an overlay map so assignment
/// itself stays lock-free of shared mutable state.
pub struct ExperimentEngine {
    experiments: Vec<ExperimentConfig>,
    default_version: String,
    status_overlay: Mutex<HashMap<String, ExperimentStatus>>,
    guards: Mutex<HashMap<String, GuardState>>,
}

impl ExperimentEngine {
    pub fn new(experiments: Vec<ExperimentConfig>, default_version: String) -> Self {
        Self {
            experiments,
            default_version,
            status_overlay: Mutex::new(HashMap::new()),
            guards: Mutex::new(HashMap::new()),
        }
    }

    /// Deterministic bucket in `0..100` for `(user_id, experiment_id)`.
    pub fn bucket(user_id: Uuid, experiment_id: &str) -> u8 {
        let mut hasher = Sha256::new();
        hasher.update(user_id.as_bytes());
        hasher.update(experiment_id.as_bytes());
        let digest = hasher.finalize();
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(word) % 100) as u8
    }

    /// Assign a user to a prompt variant for this message.
    ///
    /// The first running, channel-eligible experiment applies; everything
    /// else routes to the default version.
    pub fn assign(&self, user_id: Uuid, channel: Option<&str>) -> Assignment {
        for experiment in &self.experiments {
            if self.effective_status(experiment) != ExperimentStatus::Running {
                continue;
            }
            if !experiment.target_channels.is_empty() {
                let Some(channel) = channel else { continue };
                if !experiment.target_channels.iter().any(|c| c == channel) {
                    continue;
                }
            }

            let bucket = Self::bucket(user_id, &experiment.id);
            let mut band_start = 0u16;
            for allocation in &experiment.treatments {
                let band_end = band_start + allocation.percent as u16;
                if (bucket as u16) >= band_start && (bucket as u16) < band_end {
                    return Assignment {
                        experiment_id: Some(experiment.id.clone()),
                        variant: allocation.variant.clone(),
                        prompt_version: allocation.prompt_version.clone(),
                    };
                }
                band_start = band_end;
            }
            return Assignment {
                experiment_id: Some(experiment.id.clone()),
                variant: CONTROL.to_string(),
                prompt_version: experiment.control_version.clone(),
            };
        }

        Assignment {
            experiment_id: None,
            variant: CONTROL.to_string(),
            prompt_version: self.default_version.clone(),
        }
    }

    /// Record a message outcome, feeding the error-rate guard. Control
    /// traffic does not count against the treatment window.
    pub fn record(&self, result: &ExperimentResult) {
        if result.variant == CONTROL {
            return;
        }
        let Some(experiment) = self.experiments.iter().find(|e| e.id == result.experiment_id)
        else {
            return;
        };

        let should_pause = {
            let mut guards = self.guards.lock().expect("guard mutex poisoned");
            let state = guards
                .entry(experiment.id.clone())
                .or_insert_with(|| GuardState {
                    window: VecDeque::with_capacity(experiment.error_window),
                    total_seen: 0,
                });
            state.total_seen += 1;
            if state.window.len() == experiment.error_window.max(1) {
                state.window.pop_front();
            }
            state.window.push_back(!result.success);

            let errors = state.window.iter().filter(|e| **e).count();
            let rate = errors as f64 / state.window.len().max(1) as f64;
            state.total_seen >= experiment.min_sample_size && rate > experiment.max_error_rate
        };

        if should_pause && self.effective_status(experiment) == ExperimentStatus::Running {
            warn!(
                experiment_id = %experiment.id,
                max_error_rate = experiment.max_error_rate,
                "experiment error rate above threshold, pausing"
            );
            self.status_overlay
                .lock()
                .expect("status mutex poisoned")
                .insert(experiment.id.clone(), ExperimentStatus::Paused);
        } else {
            info!(
                experiment_id = %result.experiment_id,
                variant = %result.variant,
                success = result.success,
                response_time_ms = result.response_time_ms,
                "experiment result recorded"
            );
        }
    }

    fn effective_status(&self, experiment: &ExperimentConfig) -> ExperimentStatus {
        self.status_overlay
            .lock()
            .expect("status mutex poisoned")
            .get(&experiment.id)
            .copied()
            .unwrap_or(experiment.status)
    }
}
