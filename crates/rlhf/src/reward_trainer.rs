//! Supervised reward-model training: regress the score of the final token
//! onto human scores with an MSE loss, checkpointing every few steps.

use crate::backend::{BackendKind, BackendState, OptimizerGroups};
use crate::checkpoint::{
    CheckpointConfig, CheckpointManager, CheckpointState, Checkpointable, LoraFlags, ResumeCursor,
};
use crate::config::RewardTrainingConfig;
use crate::dataset::{RewardDataset, RewardSample};
use crate::log::MetricLogger;
use crate::models::{RewardModel, RoleModel};
use crate::optim::AdamW;
use crate::ppo::ensure_not_nan;
use crate::stats::TrainingStats;
use crate::{Result, RlhfError};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;
use tch::{Device, Kind, Reduction, Tensor};

const CHECKPOINT_PREFIX: &str = "reward_checkpoint_epoch_";

/// Fits a `RewardModel` on a `RewardDataset`.
///
/// Checkpoints carry an (epoch, step) cursor: the epoch is stored where RL
/// checkpoints keep the episode, the step is the next mini-batch to run.
pub struct RewardTrainer {
    config: RewardTrainingConfig,
    model: RewardModel,
    train_dataset: RewardDataset,
    validation_dataset: Option<RewardDataset>,
    optim: OptimizerGroups,
    checkpoints: CheckpointManager,
    training_stats: TrainingStats,
    logger: Box<dyn MetricLogger>,
    device: Device,
}

impl RewardTrainer {
    pub fn new(config: RewardTrainingConfig, model: RewardModel, logger: Box<dyn MetricLogger>) -> Result<Self> {
        config.validate()?;

        let train_dataset = RewardDataset::from_path(&config.train_dataset_path)?;
        if train_dataset.len() < config.batch_size {
            return Err(RlhfError::Dataset(format!(
                "{} training samples do not fill one batch of {}",
                train_dataset.len(),
                config.batch_size
            )));
        }
        let validation_dataset = config
            .validation_dataset_path
            .as_ref()
            .map(RewardDataset::from_path)
            .transpose()?;

        let steps_per_epoch = train_dataset.len() / config.batch_size;
        let optim = OptimizerGroups::new(
            vec![("reward", AdamW::new(model.parameters(), config.lr))],
            steps_per_epoch,
            config.max_grad_norm,
        );

        let checkpoint_folder = model.config().checkpoint_folder.clone();
        let checkpoints = CheckpointManager::new(
            CheckpointConfig::new(&checkpoint_folder)
                .prefix(CHECKPOINT_PREFIX)
                .step_in_name(true)
                .keep_last(config.keep_last_checkpoints),
        );
        let device = model.config().device()?;

        tracing::info!(
            train_samples = train_dataset.len(),
            validation_samples = validation_dataset.as_ref().map_or(0, RewardDataset::len),
            steps_per_epoch,
            checkpoint_folder = %checkpoint_folder.display(),
            "Initialized reward trainer"
        );

        Ok(Self {
            config,
            model,
            train_dataset,
            validation_dataset,
            optim,
            checkpoints,
            training_stats: TrainingStats::new(),
            logger,
            device,
        })
    }

    pub fn model(&self) -> &RewardModel {
        &self.model
    }

    pub fn training_stats(&self) -> &TrainingStats {
        &self.training_stats
    }

    pub fn checkpoint_manager(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Full mini-batches per epoch. A trailing partial batch is dropped.
    pub fn steps_per_epoch(&self) -> usize {
        self.train_dataset.len() / self.config.batch_size
    }

    /// Run every epoch from the latest checkpoint, then save the reward
    /// artifact.
    pub fn train(&mut self) -> Result<()> {
        let cfg = self.config.clone();
        let steps_per_epoch = self.steps_per_epoch();
        tracing::info!("Start Reward Training");

        let start = self.load_checkpoint();
        let remaining = (cfg.epochs * steps_per_epoch).saturating_sub(start.episode * steps_per_epoch + start.step);
        let progress = ProgressBar::new(remaining as u64);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        ) {
            progress.set_style(style.progress_chars("#>-"));
        }

        let started = Instant::now();
        let mut since_checkpoint = 0;
        for epoch in start.episode..cfg.epochs {
            self.model.train();
            let first_step = if epoch == start.episode { start.step } else { 0 };

            for step in first_step..steps_per_epoch {
                let loss = self.train_step(step)?;
                self.training_stats.push_loss(loss);

                let global_step = self.training_stats.steps() as u64;
                self.logger.log_scalar("reward/train_loss", loss, global_step);
                self.logger
                    .log_scalar("reward/learning_rate", self.optim.learning_rate(), global_step);
                if step % cfg.iteration_per_print == 0 {
                    tracing::info!(
                        epoch = epoch + 1,
                        epochs = cfg.epochs,
                        step = step + 1,
                        steps = steps_per_epoch,
                        loss,
                        "Reward training step"
                    );
                }
                progress.set_message(format!("Loss: {loss:.4}"));
                progress.inc(1);

                since_checkpoint += 1;
                if since_checkpoint % cfg.checkpoint_steps == 0 {
                    self.save_checkpoint(next_cursor(epoch, step, steps_per_epoch))?;
                }
            }

            if let Some(loss) = self.validate()? {
                self.training_stats.push_validation(loss);
                self.logger.log_scalar("reward/validation_loss", loss, epoch as u64);
                tracing::info!(epoch = epoch + 1, loss, "Validation");
            }
        }

        progress.finish_with_message("Reward training complete");
        self.model.eval();
        self.model.save(self.model.artifact_path())?;
        self.training_stats
            .save(self.model.config().checkpoint_folder.join("reward_training_stats.json"))?;
        self.logger.close();
        tracing::info!(elapsed_secs = started.elapsed().as_secs_f64(), "End Reward Training");
        Ok(())
    }

    /// One optimization step on mini-batch `index` of the training set.
    pub fn train_step(&mut self, index: usize) -> Result<f64> {
        let start = index * self.config.batch_size;
        let samples: Vec<&RewardSample> = (start..start + self.config.batch_size)
            .filter_map(|i| self.train_dataset.get(i))
            .collect();
        if samples.len() != self.config.batch_size {
            return Err(RlhfError::Batch(format!("mini-batch {index} is out of range")));
        }

        let loss = self.batch_loss(&samples)?;
        ensure_not_nan(&loss, "reward")?;
        self.optim.zero_grad();
        loss.backward();
        self.optim.step();
        Ok(loss.double_value(&[]))
    }

    /// Mean MSE over the validation set, every sample included.
    pub fn validate(&mut self) -> Result<Option<f64>> {
        let dataset = match &self.validation_dataset {
            Some(d) if !d.is_empty() => d,
            _ => return Ok(None),
        };

        self.model.eval();
        let samples: Vec<&RewardSample> = dataset.iter().collect();
        let mut total = 0.0;
        for chunk in samples.chunks(self.config.batch_size) {
            let loss = tch::no_grad(|| self.batch_loss(chunk))?;
            total += loss.double_value(&[]) * chunk.len() as f64;
        }
        self.model.train();
        Ok(Some(total / samples.len() as f64))
    }

    fn batch_loss(&self, samples: &[&RewardSample]) -> Result<Tensor> {
        let texts: Vec<String> = samples.iter().map(|s| s.text.clone()).collect();
        let scores: Vec<f32> = samples.iter().map(|s| s.score as f32).collect();

        let encoding = self.model.tokenizer().encode_batch(&texts)?.to_device(self.device);
        let target = Tensor::from_slice(&scores).to_device(self.device);
        let estimate = self
            .model
            .get_reward(&encoding.input_ids, &encoding.attention_mask)?
            .to_kind(Kind::Float);
        Ok(estimate.mse_loss(&target, Reduction::Mean))
    }

    pub fn save_checkpoint(&self, cursor: ResumeCursor) -> Result<PathBuf> {
        self.checkpoints.save(self, cursor)
    }

    /// Restore the latest checkpoint. Falls back to a fresh start on any
    /// problem.
    pub fn load_checkpoint(&mut self) -> ResumeCursor {
        let checkpoints = self.checkpoints.clone();
        checkpoints.resume(self)
    }
}

/// Cursor of the step after `step`, rolling over into the next epoch.
fn next_cursor(epoch: usize, step: usize, steps_per_epoch: usize) -> ResumeCursor {
    if step + 1 >= steps_per_epoch {
        ResumeCursor {
            episode: epoch + 1,
            step: 0,
        }
    } else {
        ResumeCursor {
            episode: epoch,
            step: step + 1,
        }
    }
}

impl Checkpointable for RewardTrainer {
    fn model_tensors(&self) -> Vec<(String, Tensor)> {
        self.model.state_tensors()
    }

    fn optimizer_tensors(&self) -> Result<Vec<(String, Tensor)>> {
        Ok(self.optim.state_tensors())
    }

    fn lora_flags(&self) -> LoraFlags {
        LoraFlags {
            lora_peft: self.model.lora_applied(),
            critic_lora_peft: false,
        }
    }

    fn training_stats(&self) -> TrainingStats {
        self.training_stats.clone()
    }

    fn backend_state(&self) -> Result<BackendState> {
        Ok(self.optim.state(BackendKind::Native))
    }

    fn restore(&mut self, state: &CheckpointState, tensors: &HashMap<String, Tensor>) -> Result<()> {
        self.model.check_prefixed("", tensors)?;
        self.optim.load_state(BackendKind::Native, &state.backend, tensors)?;
        self.model.copy_prefixed("", tensors);
        self.training_stats = state.training_stats.clone();
        Ok(())
    }
}
