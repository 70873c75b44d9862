//! rlhf CLI
//!
//! Command-line interface for actor-critic RLHF training with tiny local
//! models, and for fitting the reward model beforehand. Each role uses the
//! HuggingFace tokenizer named by its `tokenizer_path`, or the byte-level
//! tokenizer.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing_subscriber::EnvFilter;

use rlhf::backend::{DistributedBackend, ThreadDistributedBackend};
use rlhf::checkpoint::CheckpointLayout;
use rlhf::prelude::*;
use rlhf::RlhfError;

#[derive(Parser)]
#[command(name = "rlhf")]
#[command(version, about = "RLHF - actor-critic PPO training", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the actor-critic against the reward model
    Train {
        /// JSON config file
        #[arg(long)]
        config: PathBuf,

        /// Override trainer.num_episodes
        #[arg(long)]
        episodes: Option<usize>,

        /// Also write TensorBoard event files to this directory (feature
        /// `tensorboard`)
        #[arg(long)]
        tensorboard: Option<PathBuf>,
    },

    /// Fit the reward model on scored completions
    TrainReward {
        /// JSON config file, read for `reward` and `reward_training`
        #[arg(long)]
        config: PathBuf,

        /// Override reward_training.epochs
        #[arg(long)]
        epochs: Option<usize>,

        /// Also write TensorBoard event files to this directory (feature
        /// `tensorboard`)
        #[arg(long)]
        tensorboard: Option<PathBuf>,
    },

    /// Write a default config file
    InitConfig {
        /// Output path
        path: PathBuf,

        /// Prompt dataset referenced by the config
        #[arg(long, default_value = "datasets/rlhf_training_data.json")]
        examples: PathBuf,
    },

    /// Check whether two models share a tokenizer family
    CheckFamily { a: String, b: String },

    /// Print the state of the latest checkpoint in a folder
    InspectCheckpoint {
        /// Checkpoint folder
        dir: PathBuf,

        /// Checkpoint layout, tried in order when omitted
        #[arg(long, value_enum)]
        layout: Option<LayoutArg>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LayoutArg {
    File,
    Directory,
}

impl From<LayoutArg> for CheckpointLayout {
    fn from(arg: LayoutArg) -> Self {
        match arg {
            LayoutArg::File => CheckpointLayout::File,
            LayoutArg::Directory => CheckpointLayout::Directory,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            config,
            episodes,
            tensorboard,
        } => {
            let mut config = Config::from_file(&config)
                .with_context(|| format!("reading config {}", config.display()))?;
            if let Some(episodes) = episodes {
                config.trainer.num_episodes = episodes;
            }
            train(config, TrainOptions { tensorboard })?;
        }

        Commands::TrainReward {
            config,
            epochs,
            tensorboard,
        } => {
            let mut config = Config::from_file(&config)
                .with_context(|| format!("reading config {}", config.display()))?;
            if let Some(epochs) = epochs {
                config.reward_training.epochs = epochs;
            }
            train_reward(config, TrainOptions { tensorboard })?;
        }

        Commands::InitConfig { path, examples } => {
            let config = Config {
                trainer: TrainerConfig::default().with_examples_path(examples),
                ..Config::default()
            };
            config.save(&path)?;
            println!("Wrote default config to {}", path.display());
        }

        Commands::CheckFamily { a, b } => {
            if check_model_family(&a, &b) {
                println!("same family");
            } else {
                println!("different family");
            }
        }

        Commands::InspectCheckpoint { dir, layout } => {
            inspect_checkpoint(&dir, layout)?;
        }
    }

    Ok(())
}

struct TrainOptions {
    tensorboard: Option<PathBuf>,
}

fn train(config: Config, options: TrainOptions) -> Result<()> {
    config.validate()?;
    let world_size = config.trainer.world_size;
    println!(
        "Training {} episodes with {} worker(s)",
        config.trainer.num_episodes, world_size
    );

    if world_size <= 1 {
        let mut trainer = build_trainer(config, &options, None)?;
        trainer.train()?;
    } else {
        let options = Arc::new(options);
        let handles: Vec<_> = ThreadDistributedBackend::group(world_size)
            .into_iter()
            .map(|worker| {
                let config = config.clone();
                let options = Arc::clone(&options);
                thread::spawn(move || -> Result<()> {
                    let rank = worker.rank();
                    let mut trainer = build_trainer(config, &options, Some(Box::new(worker)))?;
                    trainer
                        .train()
                        .with_context(|| format!("worker {rank} failed"))?;
                    Ok(())
                })
            })
            .collect();

        // a failing worker disconnects the others, so every join returns
        let mut failures = Vec::new();
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => failures.push(err),
                Err(_) => failures.push(anyhow!("training worker panicked")),
            }
        }
        if let Some(err) = root_failure(failures) {
            return Err(err);
        }
    }

    println!("Training complete");
    Ok(())
}

/// The failure that stopped the group: the first error that is not a peer
/// disconnect, else the first error.
fn root_failure(failures: Vec<anyhow::Error>) -> Option<anyhow::Error> {
    let is_disconnect = |err: &anyhow::Error| {
        err.chain()
            .any(|cause| matches!(cause.downcast_ref::<RlhfError>(), Some(RlhfError::Distributed(_))))
    };
    for err in &failures {
        if is_disconnect(err) {
            tracing::warn!(error = %format!("{err:#}"), "Worker stopped after a peer failed");
        }
    }
    let root = failures.iter().position(|err| !is_disconnect(err)).unwrap_or(0);
    failures.into_iter().nth(root)
}

/// Tiny models for every role, loading pretrained artifacts when present.
fn build_trainer(
    config: Config,
    options: &TrainOptions,
    distributed: Option<Box<dyn DistributedBackend>>,
) -> Result<RlTrainer> {
    let rank = distributed.as_ref().map_or(0, |d| d.rank());
    let lora = |cfg: &ModelConfig| cfg.lora_enable.then_some(cfg.lora_rank);

    // tiny models sized to each role's vocabulary
    let actor_tokenizer = config.actor.load_tokenizer()?;
    let actor = ActorModel::new(
        Box::new(TinyCausalLm::new(
            actor_tokenizer.vocab_size(),
            config.actor.hidden_size,
            lora(&config.actor),
            config.actor.device()?,
        )),
        actor_tokenizer,
        config.actor.clone(),
    );
    let critic_tokenizer = config.critic.load_tokenizer()?;
    let critic = ScoringModel::critic(
        Box::new(TinyBackbone::new(
            critic_tokenizer.vocab_size(),
            config.critic.hidden_size,
            lora(&config.critic),
            config.critic.device()?,
        )),
        critic_tokenizer,
        config.critic.clone(),
    )?;
    let reward_tokenizer = config.reward.load_tokenizer()?;
    let mut reward = ScoringModel::reward(
        Box::new(TinyBackbone::new(
            reward_tokenizer.vocab_size(),
            config.reward.hidden_size,
            lora(&config.reward),
            config.reward.device()?,
        )),
        reward_tokenizer,
        config.reward.clone(),
    )?;

    let mut actor_critic = ActorCritic::new(actor, critic);
    actor_critic.load_pretrained()?;
    reward.load_pretrained()?;

    // every worker draws its own prompts
    let sampler = ExamplesSampler::from_path(&config.trainer.examples_path, config.trainer.seed + rank as u64)?;

    // only the master reports metrics
    let mut logger = CompositeLogger::default();
    if rank == 0 {
        logger.add(Box::new(ConsoleLogger::new()));
        if let Some(dir) = &options.tensorboard {
            add_tensorboard(&mut logger, dir);
        }
    }

    Ok(RlTrainer::with_distributed(
        config,
        actor_critic,
        reward,
        sampler,
        Box::new(logger),
        distributed,
    )?)
}

fn train_reward(config: Config, options: TrainOptions) -> Result<()> {
    let lora = config.reward.lora_enable.then_some(config.reward.lora_rank);
    let tokenizer = config.reward.load_tokenizer()?;
    let reward = ScoringModel::reward(
        Box::new(TinyBackbone::new(
            tokenizer.vocab_size(),
            config.reward.hidden_size,
            lora,
            config.reward.device()?,
        )),
        tokenizer,
        config.reward.clone(),
    )?;

    let mut logger = CompositeLogger::default();
    logger.add(Box::new(ConsoleLogger::new()));
    if let Some(dir) = &options.tensorboard {
        add_tensorboard(&mut logger, dir);
    }

    println!("Training the reward model for {} epoch(s)", config.reward_training.epochs);
    let mut trainer = RewardTrainer::new(config.reward_training, reward, Box::new(logger))?;
    trainer.train()?;
    println!("Reward training complete");
    Ok(())
}

#[cfg(feature = "tensorboard")]
fn add_tensorboard(logger: &mut CompositeLogger, dir: &Path) {
    logger.add(Box::new(TensorBoardLogger::new(dir)));
}

#[cfg(not(feature = "tensorboard"))]
fn add_tensorboard(_logger: &mut CompositeLogger, dir: &Path) {
    tracing::warn!(dir = %dir.display(), "Built without the tensorboard feature, ignoring --tensorboard");
}

fn inspect_checkpoint(dir: &Path, layout: Option<LayoutArg>) -> Result<()> {
    let layouts = match layout {
        Some(layout) => vec![layout.into()],
        None => vec![CheckpointLayout::File, CheckpointLayout::Directory],
    };

    for layout in layouts {
        let manager = CheckpointManager::new(CheckpointConfig::new(dir).layout(layout));
        if let Some((path, state)) = manager.latest_state()? {
            println!("Checkpoint: {}", path.display());
            println!("{}", serde_json::to_string_pretty(&state)?);
            return Ok(());
        }
    }

    println!("No checkpoint found in {}", dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_failure_skips_disconnects() {
        let failures = vec![
            anyhow::Error::from(RlhfError::Distributed("rank 1 left the group".into())).context("worker 0 failed"),
            anyhow::Error::from(RlhfError::SequenceTooLong { len: 9, max: 4 }).context("worker 1 failed"),
        ];
        let root = root_failure(failures).unwrap();
        assert!(format!("{root:#}").contains("too long"));
    }

    #[test]
    fn test_root_failure_falls_back_to_first() {
        let failures = vec![anyhow::Error::from(RlhfError::Distributed("rank 0 left the group".into()))];
        assert!(root_failure(failures).is_some());
        assert!(root_failure(Vec::new()).is_none());
    }
}
