//! Run configuration.

use crate::backend::BackendKind;
use crate::tokenizer::{ByteTokenizer, HfTokenizer, Tokenizer};
use crate::{Result, RlhfError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tch::Device;

/// Role a model plays in an RLHF run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    Actor,
    Critic,
    Reward,
    ActorCritic,
}

impl ModelRole {
    /// File name of the role's model artifact inside a model folder.
    pub fn artifact_name(self) -> &'static str {
        match self {
            ModelRole::Actor => "actor.pt",
            ModelRole::Critic => "critic.pt",
            ModelRole::Reward => "reward.pt",
            ModelRole::ActorCritic => "actor_rl.pt",
        }
    }

    /// Whether the role's artifact carries a scoring head.
    pub fn has_head(self) -> bool {
        matches!(self, ModelRole::Critic | ModelRole::Reward)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelRole::Actor => "actor",
            ModelRole::Critic => "critic",
            ModelRole::Reward => "reward",
            ModelRole::ActorCritic => "actor_critic",
        }
    }
}

/// Configuration of one model (actor, critic or reward).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model identifier, used for the family check
    pub model: String,
    /// Folder with pretrained artifacts
    pub model_folder: PathBuf,
    /// Folder for RL checkpoints and run logs
    pub checkpoint_folder: PathBuf,
    /// Longest sequence the model accepts
    pub max_sequence_length: usize,
    /// Generation budget (actor only)
    pub max_new_tokens: usize,
    /// Sampling temperature, 0 for greedy decoding (actor only)
    pub temperature: f64,
    /// Backbone hidden size
    pub hidden_size: i64,
    /// Hidden size of the scoring head (critic / reward)
    pub head_hidden_size: i64,
    /// Train LoRA adapters instead of the full backbone
    pub lora_enable: bool,
    /// LoRA rank
    pub lora_rank: i64,
    /// "cpu", "cuda" or "cuda:N"
    pub device: String,
    /// HuggingFace `tokenizer.json`; the byte-level tokenizer when unset
    pub tokenizer_path: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "tiny-local".to_string(),
            model_folder: PathBuf::from("models"),
            checkpoint_folder: PathBuf::from("checkpoints"),
            max_sequence_length: 256,
            max_new_tokens: 16,
            temperature: 1.0,
            hidden_size: 32,
            head_hidden_size: 16,
            lora_enable: false,
            lora_rank: 4,
            device: "cpu".to_string(),
            tokenizer_path: None,
        }
    }
}

impl ModelConfig {
    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_folders(mut self, model_folder: impl Into<PathBuf>, checkpoint_folder: impl Into<PathBuf>) -> Self {
        self.model_folder = model_folder.into();
        self.checkpoint_folder = checkpoint_folder.into();
        self
    }

    pub fn with_lora(mut self, enable: bool) -> Self {
        self.lora_enable = enable;
        self
    }

    pub fn with_max_sequence_length(mut self, len: usize) -> Self {
        self.max_sequence_length = len;
        self
    }

    pub fn with_max_new_tokens(mut self, tokens: usize) -> Self {
        self.max_new_tokens = tokens;
        self
    }

    pub fn with_tokenizer_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tokenizer_path = Some(path.into());
        self
    }

    /// The model's tokenizer, truncating to `max_sequence_length`.
    pub fn load_tokenizer(&self) -> Result<Arc<dyn Tokenizer>> {
        Ok(match &self.tokenizer_path {
            Some(path) => Arc::new(HfTokenizer::from_file(path, self.max_sequence_length)?),
            None => Arc::new(ByteTokenizer::new(self.max_sequence_length)),
        })
    }

    /// Parse the device string.
    pub fn device(&self) -> Result<Device> {
        match self.device.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            other => match other.strip_prefix("cuda:").map(str::parse::<usize>) {
                Some(Ok(index)) => Ok(Device::Cuda(index)),
                _ => Err(RlhfError::Config(format!("unknown device '{other}'"))),
            },
        }
    }

    fn validate(&self, role: ModelRole) -> Result<()> {
        if self.max_sequence_length == 0 {
            return Err(RlhfError::Config(format!(
                "{}: max_sequence_length must be positive",
                role.as_str()
            )));
        }
        if self.hidden_size <= 0 || self.head_hidden_size <= 0 {
            return Err(RlhfError::Config(format!(
                "{}: hidden sizes must be positive",
                role.as_str()
            )));
        }
        if self.lora_enable && self.lora_rank <= 0 {
            return Err(RlhfError::Config(format!(
                "{}: lora_rank must be positive when LoRA is enabled",
                role.as_str()
            )));
        }
        if self.temperature < 0.0 {
            return Err(RlhfError::Config(format!(
                "{}: temperature must not be negative",
                role.as_str()
            )));
        }
        if let Some(path) = &self.tokenizer_path {
            if !path.is_file() {
                return Err(RlhfError::Config(format!(
                    "{}: tokenizer file {} not found",
                    role.as_str(),
                    path.display()
                )));
            }
        }
        self.device()?;
        Ok(())
    }
}

/// Configuration of the PPO trainer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    // Loop
    pub num_episodes: usize,
    /// Timesteps per episode
    pub max_timesteps: usize,
    /// Timesteps between two learning phases
    pub update_timesteps: usize,
    /// Prompts sampled per timestep
    pub num_examples: usize,
    pub batch_size: usize,
    pub epochs: usize,

    // PPO hyperparameters
    pub actor_lr: f64,
    pub critic_lr: f64,
    pub actor_eps_clip: f64,
    pub critic_eps_clip: f64,
    /// Entropy coefficient
    pub beta_s: f64,
    /// Discount for the reward-to-go
    pub gamma_discounted: f64,

    // Checkpointing
    /// Checkpoint every N episodes
    pub checkpoint_steps: usize,
    /// Checkpoints kept on disk, 0 keeps all
    pub keep_last_checkpoints: usize,

    /// Prompt dataset (JSON array of `{ "user_input": ... }`)
    pub examples_path: PathBuf,
    pub seed: u64,

    // Backend
    pub accelerate_enable: bool,
    pub dual_optimizer_enable: bool,
    pub world_size: usize,
    pub gradient_accumulation_steps: usize,
    /// Global gradient norm clip, 0 disables clipping
    pub max_grad_norm: f64,

    pub debug: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            num_episodes: 10,
            max_timesteps: 4,
            update_timesteps: 4,
            num_examples: 2,
            batch_size: 2,
            epochs: 1,

            actor_lr: 5e-6,
            critic_lr: 9e-6,
            actor_eps_clip: 0.2,
            critic_eps_clip: 0.2,
            beta_s: 0.1,
            gamma_discounted: 0.99,

            checkpoint_steps: 5,
            keep_last_checkpoints: 3,

            examples_path: PathBuf::from("datasets/rlhf_training_data.json"),
            seed: 42,

            accelerate_enable: false,
            dual_optimizer_enable: false,
            world_size: 1,
            gradient_accumulation_steps: 1,
            max_grad_norm: 0.0,

            debug: false,
        }
    }
}

impl TrainerConfig {
    pub fn with_episodes(mut self, num_episodes: usize) -> Self {
        self.num_episodes = num_episodes;
        self
    }

    pub fn with_examples_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.examples_path = path.into();
        self
    }

    pub fn with_lr(mut self, actor_lr: f64, critic_lr: f64) -> Self {
        self.actor_lr = actor_lr;
        self.critic_lr = critic_lr;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Experience records collected between two learning phases.
    pub fn memories_per_learn(&self) -> usize {
        self.num_examples * self.update_timesteps
    }

    /// Mini-batches per learning epoch, the cosine schedule period.
    pub fn steps_per_cycle(&self) -> usize {
        (self.memories_per_learn() / self.batch_size.max(1)).max(1)
    }

    /// Backend implied by the flags. Call `validate` first.
    pub fn backend_kind(&self) -> BackendKind {
        if self.accelerate_enable {
            BackendKind::Accelerator
        } else if self.dual_optimizer_enable {
            BackendKind::DualOptimizer
        } else {
            BackendKind::Native
        }
    }

    pub fn validate(&self) -> Result<()> {
        let counts = [
            ("num_episodes", self.num_episodes),
            ("max_timesteps", self.max_timesteps),
            ("update_timesteps", self.update_timesteps),
            ("num_examples", self.num_examples),
            ("batch_size", self.batch_size),
            ("epochs", self.epochs),
            ("checkpoint_steps", self.checkpoint_steps),
            ("gradient_accumulation_steps", self.gradient_accumulation_steps),
            ("world_size", self.world_size),
        ];
        if let Some((name, _)) = counts.iter().find(|(_, v)| *v == 0) {
            return Err(RlhfError::Config(format!("{name} must be positive")));
        }

        if self.actor_lr <= 0.0 || self.critic_lr <= 0.0 {
            return Err(RlhfError::Config("learning rates must be positive".into()));
        }

        if self.accelerate_enable && self.dual_optimizer_enable {
            return Err(RlhfError::Config(
                "accelerate_enable and dual_optimizer_enable are mutually exclusive".into(),
            ));
        }
        if self.world_size > 1 && !self.accelerate_enable {
            return Err(RlhfError::Config(
                "world_size > 1 requires accelerate_enable".into(),
            ));
        }

        if self.memories_per_learn() % self.batch_size != 0 {
            return Err(RlhfError::Config(format!(
                "num_examples * update_timesteps ({}) must be a multiple of batch_size ({})",
                self.memories_per_learn(),
                self.batch_size
            )));
        }
        let total_timesteps = self.num_episodes * self.max_timesteps;
        if total_timesteps % self.update_timesteps != 0 {
            return Err(RlhfError::Config(format!(
                "num_episodes * max_timesteps ({}) must be a multiple of update_timesteps ({})",
                total_timesteps, self.update_timesteps
            )));
        }
        if self.num_examples % self.batch_size != 0 {
            return Err(RlhfError::Config(format!(
                "num_examples ({}) must be a multiple of batch_size ({})",
                self.num_examples, self.batch_size
            )));
        }

        if !self.examples_path.exists() {
            return Err(RlhfError::Config(format!(
                "examples_path {} does not exist",
                self.examples_path.display()
            )));
        }
        Ok(())
    }
}

/// Supervised fit of the reward model on scored completions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardTrainingConfig {
    /// JSON array of `{ "user_input", "completion", "score" }`
    pub train_dataset_path: PathBuf,
    pub validation_dataset_path: Option<PathBuf>,
    pub batch_size: usize,
    pub epochs: usize,
    pub lr: f64,
    /// Checkpoint every N optimization steps
    pub checkpoint_steps: usize,
    /// Checkpoints kept on disk, 0 keeps all
    pub keep_last_checkpoints: usize,
    /// Log the training loss every N steps
    pub iteration_per_print: usize,
    /// Global gradient norm clip, 0 disables clipping
    pub max_grad_norm: f64,
}

impl Default for RewardTrainingConfig {
    fn default() -> Self {
        Self {
            train_dataset_path: PathBuf::from("datasets/reward_training_data.json"),
            validation_dataset_path: None,
            batch_size: 2,
            epochs: 1,
            lr: 1e-5,
            checkpoint_steps: 100,
            keep_last_checkpoints: 3,
            iteration_per_print: 10,
            max_grad_norm: 0.0,
        }
    }
}

impl RewardTrainingConfig {
    pub fn with_datasets(mut self, train: impl Into<PathBuf>, validation: Option<PathBuf>) -> Self {
        self.train_dataset_path = train.into();
        self.validation_dataset_path = validation;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let counts = [
            ("batch_size", self.batch_size),
            ("epochs", self.epochs),
            ("checkpoint_steps", self.checkpoint_steps),
            ("iteration_per_print", self.iteration_per_print),
        ];
        if let Some((name, _)) = counts.iter().find(|(_, v)| *v == 0) {
            return Err(RlhfError::Config(format!("reward_training: {name} must be positive")));
        }
        if self.lr <= 0.0 {
            return Err(RlhfError::Config("reward_training: lr must be positive".into()));
        }

        let datasets = std::iter::once(&self.train_dataset_path).chain(&self.validation_dataset_path);
        for path in datasets {
            if !path.exists() {
                return Err(RlhfError::Config(format!(
                    "reward_training: dataset {} does not exist",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

/// Full run configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub actor: ModelConfig,
    pub critic: ModelConfig,
    pub reward: ModelConfig,
    pub trainer: TrainerConfig,
    pub reward_training: RewardTrainingConfig,
}

impl Config {
    /// Load a JSON config file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Write the config as pretty JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn model(&self, role: ModelRole) -> &ModelConfig {
        match role {
            ModelRole::Actor | ModelRole::ActorCritic => &self.actor,
            ModelRole::Critic => &self.critic,
            ModelRole::Reward => &self.reward,
        }
    }

    /// Run every fail-fast check of an RL run. `reward_training` is
    /// checked by the reward trainer.
    pub fn validate(&self) -> Result<()> {
        self.trainer.validate()?;
        for role in [ModelRole::Actor, ModelRole::Critic, ModelRole::Reward] {
            self.model(role).validate(role)?;
        }
        if self.actor.max_new_tokens == 0 {
            return Err(RlhfError::Config("actor: max_new_tokens must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn valid_trainer() -> (TrainerConfig, NamedTempFile) {
        let examples = NamedTempFile::new().unwrap();
        std::fs::write(examples.path(), r#"[{"user_input": "Hello"}]"#).unwrap();
        let config = TrainerConfig::default().with_examples_path(examples.path());
        (config, examples)
    }

    #[test]
    fn test_default_config_validates_with_examples() {
        let (trainer, _examples) = valid_trainer();
        let config = Config {
            trainer,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.trainer.backend_kind(), BackendKind::Native);
    }

    #[test]
    fn test_exclusive_backends() {
        let (mut trainer, _examples) = valid_trainer();
        trainer.accelerate_enable = true;
        trainer.dual_optimizer_enable = true;
        assert!(matches!(trainer.validate(), Err(RlhfError::Config(_))));

        trainer.dual_optimizer_enable = false;
        assert!(trainer.validate().is_ok());
        assert_eq!(trainer.backend_kind(), BackendKind::Accelerator);
    }

    #[test]
    fn test_memories_must_divide_into_batches() {
        let (mut trainer, _examples) = valid_trainer();
        trainer.num_examples = 3;
        trainer.update_timesteps = 1;
        trainer.max_timesteps = 1;
        trainer.batch_size = 2;
        let err = trainer.validate().unwrap_err();
        assert!(err.to_string().contains("multiple of batch_size"));
    }

    #[test]
    fn test_total_timesteps_must_divide_into_updates() {
        let (mut trainer, _examples) = valid_trainer();
        trainer.num_episodes = 3;
        trainer.max_timesteps = 1;
        trainer.update_timesteps = 2;
        let err = trainer.validate().unwrap_err();
        assert!(err.to_string().contains("update_timesteps"));
    }

    #[test]
    fn test_missing_examples_path() {
        let trainer = TrainerConfig::default().with_examples_path("/nonexistent/prompts.json");
        assert!(trainer.validate().is_err());
    }

    #[test]
    fn test_world_size_needs_accelerate() {
        let (mut trainer, _examples) = valid_trainer();
        trainer.world_size = 2;
        assert!(trainer.validate().is_err());
        trainer.accelerate_enable = true;
        assert!(trainer.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"trainer": {"batch_size": 4}, "actor": {"model": "gpt2"}}"#)
                .unwrap();
        assert_eq!(config.trainer.batch_size, 4);
        assert_eq!(config.trainer.epochs, 1);
        assert_eq!(config.actor.model, "gpt2");
        assert_eq!(config.critic.model, "tiny-local");
    }

    #[test]
    fn test_device_parsing() {
        let mut model = ModelConfig::default();
        assert_eq!(model.device().unwrap(), Device::Cpu);
        model.device = "cuda:1".into();
        assert_eq!(model.device().unwrap(), Device::Cuda(1));
        model.device = "tpu".into();
        assert!(model.device().is_err());
    }

    #[test]
    fn test_role_artifacts() {
        assert_eq!(ModelRole::ActorCritic.artifact_name(), "actor_rl.pt");
        assert!(ModelRole::Reward.has_head());
        assert!(!ModelRole::Actor.has_head());
    }

    #[test]
    fn test_tokenizer_selection() {
        let dir = tempfile::tempdir().unwrap();
        let byte = ModelConfig::default().with_max_sequence_length(8).load_tokenizer().unwrap();
        assert_eq!(byte.vocab_size(), 258);
        assert_eq!(byte.model_max_length(), 8);

        let path = crate::tokenizer::tests::word_level_file(dir.path(), true);
        let hf = ModelConfig::default().with_tokenizer_path(path).load_tokenizer().unwrap();
        assert_eq!(hf.vocab_size(), 9);
        assert_eq!(hf.pad_token(), "<pad>");
    }

    #[test]
    fn test_missing_tokenizer_file_rejected() {
        let (trainer, _examples) = valid_trainer();
        let config = Config {
            trainer,
            critic: ModelConfig::default().with_tokenizer_path("no/such/tokenizer.json"),
            ..Default::default()
        };
        match config.validate() {
            Err(RlhfError::Config(msg)) => assert!(msg.starts_with("critic:")),
            other => panic!("expected a config error, got {other:?}"),
        }
    }
}
