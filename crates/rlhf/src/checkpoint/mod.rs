//! Checkpointing for resumable RL training.
//!
//! Provides:
//! - `Checkpointable` trait for the training state that can be saved/restored
//! - `CheckpointManager` for the checkpoint lifecycle (save, rotate, resume)
//! - `CheckpointState` for the JSON part of a checkpoint

mod manager;
mod state;

pub use manager::{CheckpointConfig, CheckpointManager};
pub use state::{CheckpointState, Checkpointable, LoraFlags, ResumeCursor};

use serde::{Deserialize, Serialize};

/// On-disk shape of a checkpoint. Names below use the default RL prefix;
/// `CheckpointConfig::prefix` and `step_in_name` change the stem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointLayout {
    /// `rl_checkpoint_episode_NNNNNN.pt` with a `.json` sidecar
    File,
    /// `rl_checkpoint_episode_NNNNNN/` holding `model.pt`, `optimizer.pt`
    /// and `client_state.json`
    Directory,
}
