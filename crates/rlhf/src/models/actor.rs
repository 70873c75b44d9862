//! Policy model.

use super::{
    check_variables, copy_variables, prefixed_variables, trainable, ArtifactMeta, CausalLm, GenerationParams,
    RoleModel,
};
use crate::config::{ModelConfig, ModelRole};
use crate::tokenizer::Tokenizer;
use crate::{Result, RlhfError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tch::Tensor;

/// Causal language model acting as the policy.
pub struct ActorModel {
    model: Box<dyn CausalLm>,
    tokenizer: Arc<dyn Tokenizer>,
    config: ModelConfig,
    training: bool,
}

impl ActorModel {
    pub fn new(model: Box<dyn CausalLm>, tokenizer: Arc<dyn Tokenizer>, config: ModelConfig) -> Self {
        Self {
            model,
            tokenizer,
            config,
            training: false,
        }
    }

    /// Logits [B, L, V].
    pub fn forward(&self, sequences: &Tensor, mask: &Tensor) -> Tensor {
        self.model.forward(sequences, mask, self.training)
    }

    /// Generate completions for `states` [B, L].
    ///
    /// The budget is `max_new_tokens`, reduced so the full sequence stays within
    /// `max_sequence_length`. Prompts that already fill the context are an
    /// error.
    pub fn generate(&self, states: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor)> {
        let prompt_len = states.size()[1];
        let max_len = self.config.max_sequence_length;
        if prompt_len as usize >= max_len {
            return Err(RlhfError::SequenceTooLong { len: prompt_len, max: max_len });
        }

        let params = GenerationParams {
            max_new_tokens: self.config.max_new_tokens.min(max_len - prompt_len as usize),
            temperature: self.config.temperature,
            eos_token_id: self.tokenizer.eos_token_id(),
            pad_token_id: self.tokenizer.pad_token_id(),
        };
        self.model.generate(states, mask, &params)
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

    pub fn parameters(&self) -> Vec<Tensor> {
        trainable(self.model.var_store())
    }

    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.config.model_folder.join(ModelRole::Actor.artifact_name())
    }

    /// Load `actor.pt` from the model folder when present.
    pub fn load_pretrained(&mut self) -> Result<bool> {
        let path = self.artifact_path();
        if !path.exists() {
            tracing::info!(role = "actor", path = %path.display(), "No pretrained artifact, using fresh weights");
            return Ok(false);
        }
        super::load_artifact(self, &path)?;
        Ok(true)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        super::save_artifact(self, path)
    }

    pub(crate) fn check_state(&self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        check_variables(self.model.var_store(), "model", tensors)
    }

    pub(crate) fn copy_state(&mut self, tensors: &HashMap<String, Tensor>) {
        copy_variables(self.model.var_store_mut(), "model", tensors);
    }
}

impl RoleModel for ActorModel {
    fn role(&self) -> ModelRole {
        ModelRole::Actor
    }

    fn state_tensors(&self) -> Vec<(String, Tensor)> {
        prefixed_variables(self.model.var_store(), "model")
    }

    fn restore_tensors(&mut self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        self.check_state(tensors)?;
        self.copy_state(tensors);
        Ok(())
    }

    fn artifact_meta(&self) -> ArtifactMeta {
        ArtifactMeta {
            role: ModelRole::Actor,
            lora_peft: self.lora_applied(),
            critic_lora_peft: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TinyCausalLm;
    use crate::tokenizer::ByteTokenizer;
    use tch::{Device, Kind};

    fn actor(max_len: usize, max_new: usize) -> ActorModel {
        let config = ModelConfig::default()
            .with_max_sequence_length(max_len)
            .with_max_new_tokens(max_new);
        let lm = TinyCausalLm::new(258, config.hidden_size, None, Device::Cpu);
        ActorModel::new(Box::new(lm), Arc::new(ByteTokenizer::default()), config)
    }

    #[test]
    fn test_generation_budget_respects_context() {
        tch::manual_seed(3);
        let model = actor(6, 10);
        let states = Tensor::from_slice(&[104i64, 105, 33, 104]).reshape([1, 4]);
        let mask = states.ones_like();
        let (actions, sequences) = model.generate(&states, &mask).unwrap();
        assert!(actions.size()[1] <= 2);
        assert!(sequences.size()[1] <= 6);
    }

    #[test]
    fn test_full_prompt_rejected() {
        let model = actor(4, 10);
        let states = Tensor::zeros([1, 4], (Kind::Int64, Device::Cpu));
        let mask = states.ones_like();
        assert!(matches!(
            model.generate(&states, &mask),
            Err(RlhfError::SequenceTooLong { len: 4, max: 4 })
        ));
    }

    #[test]
    fn test_state_tensor_names() {
        let model = actor(16, 4);
        let names: Vec<String> = model.state_tensors().into_iter().map(|(n, _)| n).collect();
        assert!(names.iter().all(|n| n.starts_with("model.")));
        assert!(names.contains(&"model.lm_head.weight".to_string()));
    }
}
