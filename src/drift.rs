//! Baseline tracking for context quality regression.
//!
//! One baseline per task, phase, and checkpoint, first observation wins.
//! State is in-memory and reset per orchestration run; nothing here
//! survives a restart. Regenerating a task forgets its baselines, since
//! the improved spec legitimately changes the context size.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::DriftConfig;
use crate::context::ContextMetrics;
use crate::error::{ConductorError, Result};
use crate::session::Phase;

/// Where in an attempt an observation was taken. Dispatch observes the
/// bundle alone; completion observes the whole transcript. The two are
/// baselined separately: a transcript is always larger than its bundle,
/// so comparing one against the other would read every normal reply as
/// growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    Dispatch,
    Completion,
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dispatch => write!(f, "dispatch"),
            Self::Completion => write!(f, "completion"),
        }
    }
}

pub struct DriftMonitor {
    config: DriftConfig,
    baselines: Mutex<HashMap<(Phase, Checkpoint, String), ContextMetrics>>,
}

impl DriftMonitor {
    pub fn new(config: DriftConfig) -> Self {
        Self {
            config,
            baselines: Mutex::new(HashMap::new()),
        }
    }

    /// Compares an observation against its baseline. The first observation
    /// for a (phase, checkpoint, task) triple establishes the baseline and
    /// always passes the growth check; content rules apply from the first
    /// observation.
    pub fn check_drift(
        &self,
        task_id: &str,
        phase: Phase,
        checkpoint: Checkpoint,
        metrics: &ContextMetrics,
    ) -> Result<()> {
        if phase == Phase::Implementation {
            if metrics.task_ids.len() > 1 {
                let others: Vec<String> = metrics
                    .task_ids
                    .iter()
                    .filter(|id| id.as_str() != task_id)
                    .cloned()
                    .collect();
                return Err(ConductorError::CrossTaskContamination {
                    task_id: task_id.to_string(),
                    others,
                });
            }
            if metrics.debris_count > 0 {
                return Err(ConductorError::PlanningDebrisDetected {
                    task_id: task_id.to_string(),
                    phase: phase.to_string(),
                    phrase: format!("{} debris phrase(s)", metrics.debris_count),
                });
            }
        }

        let key = (phase, checkpoint, task_id.to_string());
        let mut baselines = self.baselines.lock();
        match baselines.get(&key) {
            None => {
                debug!(task_id = %task_id, phase = %phase, checkpoint = %checkpoint, bytes = metrics.bytes, "Established drift baseline");
                baselines.insert(key, metrics.clone());
                Ok(())
            }
            Some(baseline) => {
                let limit = baseline.bytes as f64 * (1.0 + self.config.growth_threshold);
                if metrics.bytes as f64 > limit {
                    let growth_pct = if baseline.bytes == 0 {
                        u32::MAX
                    } else {
                        ((metrics.bytes as f64 / baseline.bytes as f64 - 1.0) * 100.0) as u32
                    };
                    return Err(ConductorError::ExcessiveGrowth {
                        task_id: task_id.to_string(),
                        phase: phase.to_string(),
                        growth_pct,
                        limit_pct: (self.config.growth_threshold * 100.0) as u32,
                    });
                }
                Ok(())
            }
        }
    }

    /// Drops every baseline for one task. Called when the task is
    /// regenerated from an improved spec.
    pub fn forget(&self, task_id: &str) {
        self.baselines.lock().retain(|(_, _, id), _| id != task_id);
    }

    /// Clears all baselines. Called at the start of each orchestration run.
    pub fn reset(&self) {
        self.baselines.lock().clear();
    }
}
