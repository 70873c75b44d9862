//! Backbone + scalar head, used as critic and as reward model.

use super::{check_variables, copy_variables, prefixed_variables, trainable, ArtifactMeta, Backbone, RoleModel};
use crate::config::{ModelConfig, ModelRole};
use crate::tokenizer::Tokenizer;
use crate::{Result, RlhfError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tch::{nn, nn::Module, Tensor};

/// Sequence scorer: `Linear(H, h) -> ReLU -> Linear(h, 1)` over backbone
/// hidden states, one scalar per position.
pub struct ScoringModel {
    role: ModelRole,
    backbone: Box<dyn Backbone>,
    head_vs: nn::VarStore,
    head: nn::Sequential,
    tokenizer: Arc<dyn Tokenizer>,
    config: ModelConfig,
    training: bool,
}

/// Value model of the actor-critic pair.
pub type CriticModel = ScoringModel;

/// Frozen scorer of completed sequences.
pub type RewardModel = ScoringModel;

impl ScoringModel {
    pub fn new(
        role: ModelRole,
        backbone: Box<dyn Backbone>,
        tokenizer: Arc<dyn Tokenizer>,
        config: ModelConfig,
    ) -> Result<Self> {
        if !role.has_head() {
            return Err(RlhfError::Config(format!(
                "{} models have no scoring head",
                role.as_str()
            )));
        }

        let head_vs = nn::VarStore::new(backbone.var_store().device());
        let root = head_vs.root();
        let hidden = backbone.hidden_size();
        let head = nn::seq()
            .add(nn::linear(&root / "layer_0", hidden, config.head_hidden_size, Default::default()))
            .add_fn(|x| x.relu())
            .add(nn::linear(&root / "layer_1", config.head_hidden_size, 1, Default::default()));

        Ok(Self {
            role,
            backbone,
            head_vs,
            head,
            tokenizer,
            config,
            training: false,
        })
    }

    pub fn critic(backbone: Box<dyn Backbone>, tokenizer: Arc<dyn Tokenizer>, config: ModelConfig) -> Result<Self> {
        Self::new(ModelRole::Critic, backbone, tokenizer, config)
    }

    pub fn reward(backbone: Box<dyn Backbone>, tokenizer: Arc<dyn Tokenizer>, config: ModelConfig) -> Result<Self> {
        Self::new(ModelRole::Reward, backbone, tokenizer, config)
    }

    /// Per-position scores [B, L]. No length check.
    pub fn forward(&self, sequences: &Tensor, mask: &Tensor) -> Tensor {
        let hidden = self.backbone.forward(sequences, mask, self.training);
        self.head.forward(&hidden).squeeze_dim(-1)
    }

    /// Per-position scores, rejecting inputs longer than
    /// `max_sequence_length` before running the network.
    pub fn score(&self, sequences: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let len = sequences.size()[1];
        if len as usize > self.config.max_sequence_length {
            return Err(RlhfError::SequenceTooLong {
                len,
                max: self.config.max_sequence_length,
            });
        }
        Ok(self.forward(sequences, mask))
    }

    /// Score of the final position of every sequence, [B].
    pub fn get_reward(&self, sequences: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let scores = self.score(sequences, mask)?;
        let last = scores.size()[1] - 1;
        Ok(scores.select(1, last))
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn lora_applied(&self) -> bool {
        self.config.lora_enable
    }

    /// Trainable tensors of backbone and head. Frozen LoRA base weights are
    /// not included.
    pub fn parameters(&self) -> Vec<Tensor> {
        let mut params = trainable(self.backbone.var_store());
        params.extend(trainable(&self.head_vs));
        params
    }

    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    /// Artifact path inside `model_folder`.
    pub fn artifact_path(&self) -> PathBuf {
        self.config.model_folder.join(self.role.artifact_name())
    }

    /// Load the role's pretrained artifact when one exists. Returns whether a
    /// file was loaded.
    pub fn load_pretrained(&mut self) -> Result<bool> {
        let path = self.artifact_path();
        if !path.exists() {
            tracing::info!(role = self.role.as_str(), path = %path.display(), "No pretrained artifact, using fresh weights");
            return Ok(false);
        }
        super::load_artifact(self, &path)?;
        Ok(true)
    }

    pub fn save(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        super::save_artifact(self, path)
    }

    pub(crate) fn check_prefixed(&self, prefix: &str, tensors: &HashMap<String, Tensor>) -> Result<()> {
        check_variables(self.backbone.var_store(), &format!("{prefix}model"), tensors)?;
        check_variables(&self.head_vs, &format!("{prefix}head"), tensors)
    }

    pub(crate) fn copy_prefixed(&mut self, prefix: &str, tensors: &HashMap<String, Tensor>) {
        copy_variables(self.backbone.var_store_mut(), &format!("{prefix}model"), tensors);
        copy_variables(&mut self.head_vs, &format!("{prefix}head"), tensors);
    }

    pub(crate) fn prefixed_state(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut named = prefixed_variables(self.backbone.var_store(), &format!("{prefix}model"));
        named.extend(prefixed_variables(&self.head_vs, &format!("{prefix}head")));
        named
    }
}

impl RoleModel for ScoringModel {
    fn role(&self) -> ModelRole {
        self.role
    }

    fn state_tensors(&self) -> Vec<(String, Tensor)> {
        self.prefixed_state("")
    }

    fn restore_tensors(&mut self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        self.check_prefixed("", tensors)?;
        self.copy_prefixed("", tensors);
        Ok(())
    }

    fn artifact_meta(&self) -> ArtifactMeta {
        ArtifactMeta {
            role: self.role,
            lora_peft: self.lora_applied(),
            critic_lora_peft: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TinyBackbone;
    use crate::tokenizer::ByteTokenizer;
    use tch::Device;
    use tempfile::tempdir;

    fn reward_model(max_len: usize, lora: bool) -> RewardModel {
        let config = ModelConfig::default()
            .with_max_sequence_length(max_len)
            .with_lora(lora);
        let rank = lora.then_some(config.lora_rank);
        let backbone = TinyBackbone::new(258, config.hidden_size, rank, Device::Cpu);
        ScoringModel::reward(Box::new(backbone), Arc::new(ByteTokenizer::default()), config).unwrap()
    }

    fn batch(len: i64) -> (Tensor, Tensor) {
        let tokens = Tensor::arange(2 * len, (tch::Kind::Int64, Device::Cpu)).reshape([2, len]);
        let mask = tokens.ones_like();
        (tokens, mask)
    }

    #[test]
    fn test_scores_every_position() {
        let model = reward_model(16, false);
        let (tokens, mask) = batch(5);
        assert_eq!(model.forward(&tokens, &mask).size(), [2, 5]);
        assert_eq!(model.get_reward(&tokens, &mask).unwrap().size(), [2]);
    }

    #[test]
    fn test_get_reward_is_last_position() {
        let model = reward_model(16, false);
        let (tokens, mask) = batch(4);
        let scores = model.forward(&tokens, &mask);
        let reward = model.get_reward(&tokens, &mask).unwrap();
        let diff = (scores.select(1, 3) - reward).abs().max().double_value(&[]);
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_too_long_input_rejected() {
        let model = reward_model(4, false);
        let (tokens, mask) = batch(5);
        let err = model.get_reward(&tokens, &mask).unwrap_err();
        assert!(matches!(err, RlhfError::SequenceTooLong { len: 5, max: 4 }));
    }

    #[test]
    fn test_actor_role_rejected() {
        let backbone = TinyBackbone::new(258, 8, None, Device::Cpu);
        let result = ScoringModel::new(
            ModelRole::Actor,
            Box::new(backbone),
            Arc::new(ByteTokenizer::default()),
            ModelConfig::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reward.pt");
        let source = reward_model(16, false);
        source.save(&path).unwrap();

        let mut target = reward_model(16, false);
        crate::models::load_artifact(&mut target, &path).unwrap();

        let (tokens, mask) = batch(3);
        let a = source.forward(&tokens, &mask);
        let b = target.forward(&tokens, &mask);
        assert!(a.equal(&b));
    }

    #[test]
    fn test_load_with_lora_mismatch_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reward.pt");
        reward_model(16, false).save(&path).unwrap();

        let mut target = reward_model(16, true);
        let err = crate::models::load_artifact(&mut target, &path).unwrap_err();
        assert!(matches!(err, RlhfError::Checkpoint(_)));
    }

    #[test]
    fn test_lora_parameters_exclude_frozen_backbone() {
        let full = reward_model(16, false);
        let lora = reward_model(16, true);
        // embed + proj (w, b) + head 2 x (w, b)
        assert_eq!(full.parameters().len(), 7);
        // adapters + head
        assert_eq!(lora.parameters().len(), 6);
    }
}
