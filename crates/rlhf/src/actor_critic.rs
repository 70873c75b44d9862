//! Actor and critic coupled for PPO.
//!
//! The two models may use different tokenizers. When they belong to the same
//! family the actor's sequences are fed to the critic as they are; otherwise
//! every generated sequence is decoded and re-encoded for the critic.

use crate::config::ModelRole;
use crate::family::check_model_family;
use crate::models::{ActorModel, ArtifactMeta, CriticModel, RoleModel};
use crate::tokenizer::{decode_rows, transcode};
use crate::Result;
use std::collections::HashMap;
use std::path::Path;
use tch::{Kind, Tensor};

/// Output of [`ActorCritic::generate`].
#[derive(Debug)]
pub struct Generation {
    /// Generated tokens [B, A]
    pub actions: Tensor,
    /// Actor logits of the generated positions [B, A, V]
    pub action_logits: Tensor,
    /// Critic values of the generated positions [B, A_critic]
    pub values: Tensor,
    pub sequences_actor: Tensor,
    pub sequences_mask_actor: Tensor,
    pub sequences_critic: Tensor,
    pub sequences_mask_critic: Tensor,
    pub action_len_actor: i64,
    pub action_len_critic: i64,
}

pub struct ActorCritic {
    pub actor: ActorModel,
    pub critic: CriticModel,
    use_same_tokenizer: bool,
    debug: bool,
}

impl ActorCritic {
    pub fn new(actor: ActorModel, critic: CriticModel) -> Self {
        let use_same_tokenizer = check_model_family(&actor.config().model, &critic.config().model);
        tracing::info!(
            actor = %actor.config().model,
            critic = %critic.config().model,
            use_same_tokenizer,
            "Built actor-critic"
        );
        Self {
            actor,
            critic,
            use_same_tokenizer,
            debug: false,
        }
    }

    /// Trace tensor shapes on every forward call.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Whether actor sequences are fed to the critic without re-encoding.
    pub fn use_same_tokenizer(&self) -> bool {
        self.use_same_tokenizer
    }

    /// Load pretrained actor and critic artifacts.
    ///
    /// Without a critic artifact the critic starts from the reward model
    /// artifact in the critic's model folder, if there is one.
    pub fn load_pretrained(&mut self) -> Result<()> {
        self.actor.load_pretrained()?;
        if !self.critic.load_pretrained()? {
            let reward = self.critic.config().model_folder.join(ModelRole::Reward.artifact_name());
            if reward.exists() {
                tracing::info!(path = %reward.display(), "Initializing critic from reward model");
                crate::models::load_artifact(&mut self.critic, &reward)?;
            }
        }
        Ok(())
    }

    /// One actor pass and one critic pass over full sequences, sliced to the
    /// trailing action positions.
    ///
    /// Returns `(action_logits [B, A, V], values [B, A_critic])`.
    pub fn forward(
        &self,
        sequences_actor: &Tensor,
        sequences_mask_actor: &Tensor,
        sequences_critic: &Tensor,
        sequences_mask_critic: &Tensor,
        action_len_actor: i64,
        action_len_critic: i64,
    ) -> (Tensor, Tensor) {
        let logits = self.actor.forward(sequences_actor, sequences_mask_actor);
        let values = self.critic.forward(sequences_critic, sequences_mask_critic);

        let actor_len = logits.size()[1];
        let critic_len = values.size()[1];
        let action_logits = logits.narrow(1, actor_len - action_len_actor, action_len_actor);
        let values = values.narrow(1, critic_len - action_len_critic, action_len_critic);

        if self.debug {
            tracing::debug!(
                action_len_actor,
                action_len_critic,
                sequences_actor = ?sequences_actor.size(),
                sequences_critic = ?sequences_critic.size(),
                action_logits = ?action_logits.size(),
                values = ?values.size(),
                "ActorCritic.forward"
            );
        }
        (action_logits, values)
    }

    /// Sample completions and evaluate them, without tracking gradients.
    pub fn generate(&self, states_actor: &Tensor, states_mask_actor: &Tensor) -> Result<Generation> {
        tch::no_grad(|| {
            let (actions, sequences_actor) = self.actor.generate(states_actor, states_mask_actor)?;
            let actor_tokenizer = self.actor.tokenizer();
            let sequences_mask_actor = sequences_actor
                .ne(actor_tokenizer.pad_token_id())
                .to_kind(Kind::Int64)
                .detach();
            let action_len_actor = actions.size()[1];

            let (sequences_critic, sequences_mask_critic, action_len_critic) = if self.use_same_tokenizer {
                (
                    sequences_actor.shallow_clone(),
                    sequences_mask_actor.shallow_clone(),
                    action_len_actor,
                )
            } else {
                let critic_tokenizer = self.critic.tokenizer();
                let encoded = transcode(&sequences_actor, actor_tokenizer.as_ref(), critic_tokenizer.as_ref())?;

                // the completions' length under the critic vocabulary
                let mut completion_len = 0i64;
                for completion in decode_rows(&actions, actor_tokenizer.as_ref())? {
                    completion_len = completion_len.max(critic_tokenizer.encode(&completion)?.len() as i64);
                }
                let action_len_critic = completion_len.clamp(1, encoded.seq_len());
                (
                    encoded.input_ids,
                    encoded.attention_mask.to_kind(Kind::Int64),
                    action_len_critic,
                )
            };

            let (action_logits, values) = self.forward(
                &sequences_actor,
                &sequences_mask_actor,
                &sequences_critic,
                &sequences_mask_critic,
                action_len_actor,
                action_len_critic,
            );

            Ok(Generation {
                actions,
                action_logits,
                values,
                sequences_actor,
                sequences_mask_actor,
                sequences_critic,
                sequences_mask_critic,
                action_len_actor,
                action_len_critic,
            })
        })
    }

    pub fn train(&mut self) {
        self.actor.train();
        self.critic.train();
    }

    pub fn eval(&mut self) {
        self.actor.eval();
        self.critic.eval();
    }

    pub fn actor_parameters(&self) -> Vec<Tensor> {
        self.actor.parameters()
    }

    pub fn critic_parameters(&self) -> Vec<Tensor> {
        self.critic.parameters()
    }

    /// Write `actor_rl.pt` and the critic artifact into `folder`.
    pub fn save(&self, folder: impl AsRef<Path>) -> Result<()> {
        let folder = folder.as_ref();
        crate::models::save_artifact(&self.actor, folder.join(ModelRole::ActorCritic.artifact_name()))?;
        self.critic.save(folder.join(ModelRole::Critic.artifact_name()))
    }
}

impl RoleModel for ActorCritic {
    fn role(&self) -> ModelRole {
        ModelRole::ActorCritic
    }

    fn state_tensors(&self) -> Vec<(String, Tensor)> {
        let mut named = self.actor.state_tensors();
        named.extend(self.critic.prefixed_state("critic."));
        named
    }

    fn restore_tensors(&mut self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        self.actor.check_state(tensors)?;
        self.critic.check_prefixed("critic.", tensors)?;
        self.actor.copy_state(tensors);
        self.critic.copy_prefixed("critic.", tensors);
        Ok(())
    }

    fn artifact_meta(&self) -> ArtifactMeta {
        ArtifactMeta {
            role: ModelRole::ActorCritic,
            lora_peft: self.actor.lora_applied(),
            critic_lora_peft: Some(self.critic.lora_applied()),
        }
    }
}
