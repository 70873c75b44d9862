//! # rlhf
//!
//! Actor-critic PPO training for reinforcement learning from human feedback.
//!
//! ## Overview
//!
//! The crate provides:
//! - Model wrappers for the three roles of an RLHF run (`ActorModel`,
//!   `CriticModel`, `RewardModel`) over opaque `CausalLm` / `Backbone` networks
//! - `ActorCritic`, which couples actor and critic and reconciles their tokenizers
//! - `ExperienceBuffer` / `ExperienceDataset` holding rollout `Memory` records
//! - PPO loss helpers and pluggable `TrainingBackend`s
//! - `CheckpointManager` for resumable (episode, step) training
//! - `RlTrainer`, the rollout + learning loop tying everything together
//! - `RewardTrainer`, a supervised fit of the reward model on scored
//!   completions
//!
//! ## Features
//!
//! - `default` - Core trainer with console metric logging
//! - `tensorboard` - TensorBoard metric logger
//! - `download-libtorch` - Let `tch` fetch libtorch at build time
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rlhf::prelude::*;
//!
//! let config = Config::from_file("config.json")?;
//! let mut trainer = RlTrainer::new(config, actor_critic, reward, sampler, Box::new(ConsoleLogger::new()))?;
//! trainer.train()?;
//! ```

pub mod actor_critic;
pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod conversation;
pub mod dataset;
pub mod experience;
pub mod family;
pub mod log;
pub mod models;
pub mod optim;
pub mod ppo;
pub mod reward_trainer;
pub mod stats;
pub mod tokenizer;
pub mod trainer;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::actor_critic::{ActorCritic, Generation};
    pub use crate::backend::{select_backend, BackendKind, TrainingBackend};
    pub use crate::checkpoint::{CheckpointConfig, CheckpointManager, Checkpointable, ResumeCursor};
    pub use crate::config::{Config, ModelConfig, ModelRole, RewardTrainingConfig, TrainerConfig};
    pub use crate::conversation::ConversationLog;
    pub use crate::dataset::{ExamplesSampler, RewardDataset};
    pub use crate::experience::{ExperienceBuffer, ExperienceDataset, Memory};
    pub use crate::family::check_model_family;
    pub use crate::models::{
        ActorModel, Backbone, CausalLm, CriticModel, RewardModel, ScoringModel, TinyBackbone,
        TinyCausalLm,
    };
    pub use crate::tokenizer::{ByteTokenizer, Encoding, HfTokenizer, Tokenizer};
    pub use crate::reward_trainer::RewardTrainer;
    pub use crate::trainer::RlTrainer;

    #[cfg(feature = "tensorboard")]
    pub use crate::log::TensorBoardLogger;
    pub use crate::log::{CompositeLogger, ConsoleLogger, MetricLogger, NoOpLogger};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum RlhfError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{which} loss is NaN")]
    NanLoss { which: &'static str },

    #[error("Output sequence is too long: {len} > {max}")]
    SequenceTooLong { len: i64, max: usize },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Batch error: {0}")]
    Batch(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Distributed error: {0}")]
    Distributed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tensor error: {0}")]
    Tensor(#[from] tch::TchError),
}

pub type Result<T> = std::result::Result<T, RlhfError>;
