//! PPO trainer: rollouts with the actor-critic, scoring with the reward model,
//! clipped-surrogate updates and resumable checkpoints.

use crate::actor_critic::ActorCritic;
use crate::backend::{select_backend, BackendState, DistributedBackend, TrainingBackend};
use crate::checkpoint::{
    CheckpointConfig, CheckpointManager, CheckpointState, Checkpointable, LoraFlags, ResumeCursor,
};
use crate::config::Config;
use crate::conversation::ConversationLog;
use crate::dataset::ExamplesSampler;
use crate::experience::{mean_final_reward, ExperienceBuffer, ExperienceDataset, Memory, PadIds};
use crate::family::check_model_family;
use crate::log::MetricLogger;
use crate::models::{RewardModel, RoleModel};
use crate::ppo::{
    clipped_policy_loss, clipped_value_loss, discounted_rewards, entropy, ensure_not_nan,
    final_reward_advantages, importance_ratio, kl_penalty, max_prob_log_probs, normalize_advantages, EPS,
};
use crate::stats::TrainingStats;
use crate::tokenizer::{decode_rows, transcode};
use crate::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tch::{Device, Kind, Tensor};

/// Which tokenization the reward model scores.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RewardInput {
    /// Reward model shares the actor's tokenizer
    Actor,
    /// Reward model shares the critic's tokenizer
    Critic,
    /// Re-encode actor sequences with the reward tokenizer
    Transcode,
}

/// Result of one learning phase.
#[derive(Clone, Debug, PartialEq)]
pub struct LearnSummary {
    /// Optimization steps taken
    pub steps: usize,
    pub mean_loss: f64,
    pub mean_value_loss: f64,
}

/// Actor-critic PPO trainer.
pub struct RlTrainer {
    config: Config,
    actor_critic: ActorCritic,
    reward: RewardModel,
    sampler: ExamplesSampler,
    backend: Box<dyn TrainingBackend>,
    checkpoints: CheckpointManager,
    conversation_log: ConversationLog,
    training_stats: TrainingStats,
    logger: Box<dyn MetricLogger>,
    buffer: ExperienceBuffer,
    reward_input: RewardInput,
    device: Device,
}

impl RlTrainer {
    /// Single-process trainer.
    pub fn new(
        config: Config,
        actor_critic: ActorCritic,
        reward: RewardModel,
        sampler: ExamplesSampler,
        logger: Box<dyn MetricLogger>,
    ) -> Result<Self> {
        Self::with_distributed(config, actor_critic, reward, sampler, logger, None)
    }

    /// Trainer for one worker of a distributed run. `distributed` is required
    /// when `world_size > 1`.
    pub fn with_distributed(
        config: Config,
        actor_critic: ActorCritic,
        mut reward: RewardModel,
        sampler: ExamplesSampler,
        logger: Box<dyn MetricLogger>,
        distributed: Option<Box<dyn DistributedBackend>>,
    ) -> Result<Self> {
        config.validate()?;
        tch::manual_seed(config.trainer.seed as i64);

        let trainer = &config.trainer;
        let mut backend = select_backend(trainer, distributed)?;
        backend.prepare(
            actor_critic.actor_parameters(),
            actor_critic.critic_parameters(),
            trainer.steps_per_cycle(),
        )?;

        let reward_input = if check_model_family(&config.actor.model, &config.reward.model) {
            RewardInput::Actor
        } else if check_model_family(&config.critic.model, &config.reward.model) {
            RewardInput::Critic
        } else {
            RewardInput::Transcode
        };

        let checkpoint_folder = config.actor.checkpoint_folder.clone();
        let checkpoints = CheckpointManager::new(
            CheckpointConfig::new(&checkpoint_folder)
                .layout(backend.checkpoint_layout())
                .keep_last(trainer.keep_last_checkpoints),
        );
        let conversation_log = ConversationLog::open(checkpoint_folder.join("conversations_log.json"))?;

        reward.eval();
        let actor_critic = actor_critic.with_debug(trainer.debug);
        let buffer = ExperienceBuffer::new(trainer.memories_per_learn());
        let device = config.actor.device()?;

        tracing::info!(
            backend = backend.kind().as_str(),
            reward_input = ?reward_input,
            checkpoint_folder = %checkpoint_folder.display(),
            "Initialized RL trainer"
        );

        Ok(Self {
            config,
            actor_critic,
            reward,
            sampler,
            backend,
            checkpoints,
            conversation_log,
            training_stats: TrainingStats::new(),
            logger,
            buffer,
            reward_input,
            device,
        })
    }

    pub fn actor_critic(&self) -> &ActorCritic {
        &self.actor_critic
    }

    pub fn training_stats(&self) -> &TrainingStats {
        &self.training_stats
    }

    pub fn conversation_log(&self) -> &ConversationLog {
        &self.conversation_log
    }

    pub fn checkpoint_manager(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Run the full training loop, resuming from the latest checkpoint.
    pub fn train(&mut self) -> Result<()> {
        let cfg = self.config.trainer.clone();
        let is_master = self.backend.is_master();
        tracing::info!("Start RL Training");

        let start = self.load_checkpoint();
        // a fresh run starts a fresh conversation log
        if start.episode == 0 {
            self.conversation_log.clear()?;
        }

        let remaining = cfg.num_episodes.saturating_sub(start.episode) * cfg.max_timesteps;
        let progress = if is_master {
            let pb = ProgressBar::new(remaining as u64);
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
            ) {
                pb.set_style(style.progress_chars("#>-"));
            }
            pb
        } else {
            ProgressBar::hidden()
        };

        let started = Instant::now();
        let mut cnt_timesteps = 0;
        let mut learn_iteration = 0;
        self.actor_critic.eval();

        for episode in start.episode..cfg.num_episodes {
            for timestep in 0..cfg.max_timesteps {
                tracing::debug!(
                    episode = episode + 1,
                    num_episodes = cfg.num_episodes,
                    timestep = timestep + 1,
                    max_timesteps = cfg.max_timesteps,
                    learn_cnt = cnt_timesteps + 1,
                    "Rollout"
                );
                cnt_timesteps += 1;

                for memory in self.rollout_step(learn_iteration)? {
                    self.buffer.push(memory)?;
                }

                if cnt_timesteps % cfg.update_timesteps == 0 {
                    let memories = self.buffer.drain_all();
                    let mean_reward = mean_final_reward(memories.iter()).unwrap_or(0.0);
                    let summary = self.learn(memories)?;

                    self.training_stats.push_reward(mean_reward);
                    self.logger.log_scalar("reward/mean", mean_reward, learn_iteration as u64);
                    tracing::info!(
                        learn_iteration,
                        mean_reward,
                        steps = summary.steps,
                        loss = summary.mean_loss,
                        "Learning phase done"
                    );

                    if is_master && cfg.debug {
                        self.conversation_log.show(learn_iteration);
                    }
                    cnt_timesteps = 0;
                    learn_iteration += 1;
                    progress.set_message(format!("Loss: {:.4} Reward: {:.2}", summary.mean_loss, mean_reward));
                    if is_master {
                        self.conversation_log.save()?;
                    }
                }
                progress.inc(1);
            }

            if episode % cfg.checkpoint_steps == 0 && episode != 0 {
                self.save_checkpoint(episode)?;
                if is_master {
                    self.conversation_log.save()?;
                }
            }
        }

        progress.finish_with_message("Training complete");
        if is_master {
            self.actor_critic.save(&self.config.actor.model_folder)?;
            self.training_stats
                .save(self.config.actor.checkpoint_folder.join("training_stats.json"))?;
        }
        self.logger.close();
        tracing::info!(elapsed_secs = started.elapsed().as_secs_f64(), "End RL Training");
        Ok(())
    }

    /// Sample prompts, generate completions, score them and build one
    /// `Memory` per prompt. Every completion is appended to the conversation
    /// log under `learn_iteration`.
    pub fn rollout_step(&mut self, learn_iteration: usize) -> Result<Vec<Memory>> {
        let prompts = self.sampler.sample(self.config.trainer.num_examples)?;
        let actor_tokenizer = Arc::clone(self.actor_critic.actor.tokenizer());
        let states = actor_tokenizer.encode_batch(&prompts)?.to_device(self.device);

        let generation = self.actor_critic.generate(&states.input_ids, &states.attention_mask)?;
        let (_, action_log_probs) = max_prob_log_probs(&generation.action_logits, EPS);

        let (reward_sequences, reward_mask) = match self.reward_input {
            RewardInput::Actor => (
                generation.sequences_actor.shallow_clone(),
                generation.sequences_mask_actor.shallow_clone(),
            ),
            RewardInput::Critic => (
                generation.sequences_critic.shallow_clone(),
                generation.sequences_mask_critic.shallow_clone(),
            ),
            RewardInput::Transcode => {
                let encoded = transcode(
                    &generation.sequences_actor,
                    actor_tokenizer.as_ref(),
                    self.reward.tokenizer().as_ref(),
                )?;
                (encoded.input_ids, encoded.attention_mask)
            }
        };

        let scores = tch::no_grad(|| self.reward.score(&reward_sequences, &reward_mask))?;
        let rewards = trailing_positions(&scores, generation.action_len_critic);
        let final_rewards = rewards.select(1, generation.action_len_critic - 1);

        let completions = decode_rows(&generation.actions, actor_tokenizer.as_ref())?;
        let mut memories = Vec::with_capacity(prompts.len());
        for (i, (prompt, completion)) in prompts.iter().zip(&completions).enumerate() {
            let i = i as i64;
            memories.push(
                Memory {
                    states_actor: states.input_ids.get(i),
                    actions: generation.actions.get(i),
                    values: generation.values.get(i),
                    rewards: rewards.get(i),
                    action_log_probs: action_log_probs.get(i),
                    sequences_actor: generation.sequences_actor.get(i),
                    sequences_mask_actor: generation.sequences_mask_actor.get(i),
                    sequences_critic: generation.sequences_critic.get(i),
                    sequences_mask_critic: generation.sequences_mask_critic.get(i),
                    action_len_actor: generation.action_len_actor,
                    action_len_critic: generation.action_len_critic,
                }
                .into_cpu(),
            );
            self.conversation_log
                .append(prompt, completion, final_rewards.double_value(&[i]), learn_iteration);
        }
        Ok(memories)
    }

    /// PPO update over `memories` for `epochs` epochs of mini-batches.
    pub fn learn(&mut self, memories: Vec<Memory>) -> Result<LearnSummary> {
        let cfg = self.config.trainer.clone();
        let dataset = ExperienceDataset::new(memories);
        let ranges = dataset.batch_ranges(cfg.batch_size)?;
        let pads = PadIds {
            actor: self.actor_critic.actor.tokenizer().pad_token_id(),
            critic: self.actor_critic.critic.tokenizer().pad_token_id(),
        };
        let same_family = self.actor_critic.use_same_tokenizer();

        tracing::info!(memories = dataset.len(), batches = ranges.len(), "Start Learning");
        self.actor_critic.train();

        let mut losses = Vec::with_capacity(cfg.epochs * ranges.len());
        let mut value_losses = Vec::with_capacity(losses.capacity());
        for epoch in 0..cfg.epochs {
            for (k, range) in ranges.iter().enumerate() {
                let batch = dataset.batch(range.clone(), pads, self.device)?;
                if cfg.debug {
                    tracing::debug!(
                        batch = k,
                        sequences_actor = ?batch.sequences_actor.size(),
                        sequences_critic = ?batch.sequences_critic.size(),
                        rewards = ?batch.rewards.size(),
                        action_len_actor = batch.action_len_actor,
                        action_len_critic = batch.action_len_critic,
                        "Batch from memories"
                    );
                }

                let (action_logits, values) = self.actor_critic.forward(
                    &batch.sequences_actor,
                    &batch.sequences_mask_actor,
                    &batch.sequences_critic,
                    &batch.sequences_mask_critic,
                    batch.action_len_actor,
                    batch.action_len_critic,
                );

                let (probs, log_probs) = max_prob_log_probs(&action_logits, EPS);
                let entropies = entropy(&probs, &log_probs);
                let kl = kl_penalty(&probs, &batch.action_log_probs, &log_probs);
                let ratios = importance_ratio(&log_probs, &batch.action_log_probs);

                let advantages = if same_family {
                    let returns = discounted_rewards(&batch.rewards, cfg.gamma_discounted);
                    normalize_advantages(&(returns - &batch.values), EPS)
                } else {
                    final_reward_advantages(&batch.rewards, &batch.values)
                };

                let policy_loss = clipped_policy_loss(
                    &advantages,
                    &ratios,
                    &entropies,
                    cfg.actor_eps_clip,
                    cfg.beta_s,
                    &kl,
                );
                ensure_not_nan(&policy_loss, "policy")?;

                let value_loss = clipped_value_loss(&values, &batch.values, &batch.rewards, cfg.critic_eps_clip);
                ensure_not_nan(&value_loss, "value")?;

                let loss = &policy_loss + &value_loss;
                self.backend.backward_and_step(&loss)?;

                let loss_value = loss.double_value(&[]);
                let value_loss_value = value_loss.double_value(&[]);
                let policy_loss_value = policy_loss.double_value(&[]);
                let kl_value = kl.double_value(&[]);
                self.training_stats
                    .push_step(loss_value, value_loss_value, policy_loss_value, kl_value);

                let step = self.training_stats.steps() as u64;
                let metrics: HashMap<String, f64> = [
                    ("train/loss".to_string(), loss_value),
                    ("train/value_loss".to_string(), value_loss_value),
                    ("train/policy_loss".to_string(), policy_loss_value),
                    ("train/kl".to_string(), kl_value),
                    ("train/learning_rate".to_string(), self.backend.learning_rate()),
                ]
                .into();
                self.logger.log_metrics(&metrics, step);

                tracing::info!(
                    epoch = epoch + 1,
                    epochs = cfg.epochs,
                    step = k + 1,
                    steps = ranges.len(),
                    loss = loss_value,
                    value_loss = value_loss_value,
                    "Learning step"
                );
                losses.push(loss_value);
                value_losses.push(value_loss_value);
            }
        }
        self.backend.flush()?;
        self.actor_critic.eval();
        tracing::info!("End Learning");

        let mean = |v: &[f64]| if v.is_empty() { 0.0 } else { v.iter().sum::<f64>() / v.len() as f64 };
        Ok(LearnSummary {
            steps: losses.len(),
            mean_loss: mean(&losses),
            mean_value_loss: mean(&value_losses),
        })
    }

    /// Save a checkpoint after `episode`; training resumes at the next one.
    ///
    /// Only the master worker writes.
    pub fn save_checkpoint(&self, episode: usize) -> Result<Option<PathBuf>> {
        if !self.backend.is_master() {
            return Ok(None);
        }
        let cursor = ResumeCursor {
            episode: episode + 1,
            step: 0,
        };
        self.checkpoints.save(self, cursor).map(Some)
    }

    /// Restore the latest checkpoint. Falls back to a fresh start on any
    /// problem.
    pub fn load_checkpoint(&mut self) -> ResumeCursor {
        let checkpoints = self.checkpoints.clone();
        checkpoints.resume(self)
    }
}

/// Last `n` columns of `scores` [B, L], left padded with zeros when the
/// sequence is shorter.
fn trailing_positions(scores: &Tensor, n: i64) -> Tensor {
    let len = scores.size()[1];
    if len >= n {
        scores.narrow(1, len - n, n)
    } else {
        let pad = Tensor::zeros([scores.size()[0], n - len], (Kind::Float, scores.device()));
        Tensor::cat(&[&pad, &scores.to_kind(Kind::Float)], 1)
    }
}

impl Checkpointable for RlTrainer {
    fn model_tensors(&self) -> Vec<(String, Tensor)> {
        self.actor_critic.state_tensors()
    }

    fn optimizer_tensors(&self) -> Result<Vec<(String, Tensor)>> {
        self.backend.state_tensors()
    }

    fn lora_flags(&self) -> LoraFlags {
        LoraFlags {
            lora_peft: self.actor_critic.actor.lora_applied(),
            critic_lora_peft: self.actor_critic.critic.lora_applied(),
        }
    }

    fn training_stats(&self) -> TrainingStats {
        self.training_stats.clone()
    }

    fn backend_state(&self) -> Result<BackendState> {
        self.backend.state()
    }

    fn restore(&mut self, state: &CheckpointState, tensors: &HashMap<String, Tensor>) -> Result<()> {
        // validate the weights before touching the optimizer
        self.actor_critic.actor.check_state(tensors)?;
        self.actor_critic.critic.check_prefixed("critic.", tensors)?;
        self.backend.load_state(&state.backend, tensors)?;
        self.actor_critic.restore_tensors(tensors)?;
        self.training_stats = state.training_stats.clone();
        Ok(())
    }
}
