//! Checkpoint state and trait definitions.

use crate::backend::BackendState;
use crate::stats::TrainingStats;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tch::Tensor;

/// Where training resumes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeCursor {
    pub episode: usize,
    pub step: usize,
}

impl ResumeCursor {
    /// Start of training.
    pub fn fresh() -> Self {
        Self::default()
    }

    pub fn is_fresh(&self) -> bool {
        self.episode == 0 && self.step == 0
    }
}

/// LoRA settings of actor and critic at save time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoraFlags {
    pub lora_peft: bool,
    pub critic_lora_peft: bool,
}

/// Components whose training state can be checkpointed.
///
/// Tensor names are namespaced: `model.*` (actor), `critic.*` (critic
/// backbone and head) and `optimizer.*` (optimizer moments).
pub trait Checkpointable {
    /// Actor and critic weights.
    fn model_tensors(&self) -> Vec<(String, Tensor)>;

    /// Optimizer moments.
    fn optimizer_tensors(&self) -> Result<Vec<(String, Tensor)>>;

    fn lora_flags(&self) -> LoraFlags;

    fn training_stats(&self) -> TrainingStats;

    fn backend_state(&self) -> Result<BackendState>;

    /// Restore everything from a checkpoint. On error the component must be
    /// left as it was.
    fn restore(&mut self, state: &CheckpointState, tensors: &HashMap<String, Tensor>) -> Result<()>;
}

/// JSON part of a checkpoint.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CheckpointState {
    /// Next episode to run
    pub episode: usize,
    pub step: usize,
    pub lora_peft: bool,
    pub critic_lora_peft: bool,
    pub training_stats: TrainingStats,
    /// Optimizer scalars and scheduler
    pub backend: BackendState,
    pub version: String,
    /// Seconds since the Unix epoch
    pub timestamp: String,
}

impl CheckpointState {
    /// Snapshot `target` with resume cursor `cursor`.
    pub fn capture<T: Checkpointable + ?Sized>(target: &T, cursor: ResumeCursor) -> Result<Self> {
        let flags = target.lora_flags();
        Ok(Self {
            episode: cursor.episode,
            step: cursor.step,
            lora_peft: flags.lora_peft,
            critic_lora_peft: flags.critic_lora_peft,
            training_stats: target.training_stats(),
            backend: target.backend_state()?,
            version: crate::VERSION.to_string(),
            timestamp: unix_timestamp(),
        })
    }

    pub fn cursor(&self) -> ResumeCursor {
        ResumeCursor {
            episode: self.episode,
            step: self.step,
        }
    }

    pub fn lora_flags(&self) -> LoraFlags {
        LoraFlags {
            lora_peft: self.lora_peft,
            critic_lora_peft: self.critic_lora_peft,
        }
    }
}

fn unix_timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", duration.as_secs())
}
