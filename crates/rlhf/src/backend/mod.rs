//! Training backends: how a loss turns into parameter updates.
//!
//! Exactly one backend is active per run, chosen from the trainer config:
//! - `NativeBackend` - one AdamW over actor and critic
//! - `DualOptimizerBackend` - separate AdamW groups with their own rates
//! - `AcceleratorBackend` - dual groups with gradient accumulation and
//!   all-reduce across workers

mod accelerator;
pub mod distributed;
mod dual;
mod native;

pub use accelerator::AcceleratorBackend;
pub use distributed::{DistributedBackend, LocalBackend, ThreadDistributedBackend};
pub use dual::DualOptimizerBackend;
pub use native::NativeBackend;

use crate::checkpoint::CheckpointLayout;
use crate::config::TrainerConfig;
use crate::optim::{clip_grad_norm, AdamW, AdamWState, CosineWarmRestarts};
use crate::{Result, RlhfError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tch::Tensor;

/// Backend selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Native,
    DualOptimizer,
    Accelerator,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Native => "native",
            BackendKind::DualOptimizer => "dual_optimizer",
            BackendKind::Accelerator => "accelerator",
        }
    }
}

/// Serializable optimizer and scheduler state of a backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendState {
    pub kind: BackendKind,
    pub optimizers: BTreeMap<String, AdamWState>,
    pub scheduler: CosineWarmRestarts,
}

/// Turns losses into parameter updates.
pub trait TrainingBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Build optimizers over the given parameters. `steps_per_cycle` is the
    /// cosine schedule period.
    fn prepare(&mut self, actor_params: Vec<Tensor>, critic_params: Vec<Tensor>, steps_per_cycle: usize) -> Result<()>;

    /// Backpropagate `loss` and update parameters.
    fn backward_and_step(&mut self, loss: &Tensor) -> Result<()>;

    /// Apply any pending accumulated gradients.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Learning rate of the scheduled group.
    fn learning_rate(&self) -> f64;

    fn state(&self) -> Result<BackendState>;

    /// Optimizer moment tensors, named `optimizer.<group>.<kind>.<i>`.
    fn state_tensors(&self) -> Result<Vec<(String, Tensor)>>;

    fn load_state(&mut self, state: &BackendState, tensors: &HashMap<String, Tensor>) -> Result<()>;

    fn checkpoint_layout(&self) -> CheckpointLayout;

    /// Only the master worker writes files.
    fn is_master(&self) -> bool {
        true
    }
}

/// Build the backend selected by `config`.
///
/// `distributed` is required when `world_size > 1`; otherwise the
/// accelerator runs with a single local worker.
pub fn select_backend(
    config: &TrainerConfig,
    distributed: Option<Box<dyn DistributedBackend>>,
) -> Result<Box<dyn TrainingBackend>> {
    if config.accelerate_enable && config.dual_optimizer_enable {
        return Err(RlhfError::Config(
            "accelerate_enable and dual_optimizer_enable are mutually exclusive".into(),
        ));
    }

    let backend: Box<dyn TrainingBackend> = match config.backend_kind() {
        BackendKind::Native => Box::new(NativeBackend::new(config)),
        BackendKind::DualOptimizer => Box::new(DualOptimizerBackend::new(config)),
        BackendKind::Accelerator => {
            let distributed = match distributed {
                Some(d) => d,
                None if config.world_size <= 1 => Box::new(LocalBackend),
                None => {
                    return Err(RlhfError::Config(format!(
                        "world_size {} needs a distributed group",
                        config.world_size
                    )))
                }
            };
            if distributed.world_size() != config.world_size {
                return Err(RlhfError::Config(format!(
                    "distributed group has {} workers, config expects {}",
                    distributed.world_size(),
                    config.world_size
                )));
            }
            Box::new(AcceleratorBackend::new(config, distributed))
        }
    };

    tracing::info!(backend = backend.kind().as_str(), "Selected training backend");
    Ok(backend)
}

/// Named AdamW groups sharing one cosine schedule on the first group.
pub(crate) struct OptimizerGroups {
    groups: Vec<(&'static str, AdamW)>,
    scheduler: CosineWarmRestarts,
    max_grad_norm: f64,
}

impl OptimizerGroups {
    pub(crate) fn new(groups: Vec<(&'static str, AdamW)>, steps_per_cycle: usize, max_grad_norm: f64) -> Self {
        let eta_max = groups.first().map(|(_, opt)| opt.lr()).unwrap_or(0.0);
        Self {
            groups,
            scheduler: CosineWarmRestarts::new(steps_per_cycle, eta_max),
            max_grad_norm,
        }
    }

    pub(crate) fn params(&self) -> Vec<Tensor> {
        self.groups
            .iter()
            .flat_map(|(_, opt)| opt.params().iter().map(Tensor::shallow_clone))
            .collect()
    }

    pub(crate) fn zero_grad(&mut self) {
        for (_, opt) in self.groups.iter_mut() {
            opt.zero_grad();
        }
    }

    /// Clip, update every group, then advance the schedule.
    pub(crate) fn step(&mut self) {
        if self.max_grad_norm > 0.0 {
            clip_grad_norm(&self.params(), self.max_grad_norm);
        }
        for (_, opt) in self.groups.iter_mut() {
            opt.step();
        }
        let lr = self.scheduler.step();
        if let Some((_, opt)) = self.groups.first_mut() {
            opt.set_lr(lr);
        }
    }

    pub(crate) fn learning_rate(&self) -> f64 {
        self.groups.first().map(|(_, opt)| opt.lr()).unwrap_or(0.0)
    }

    pub(crate) fn state(&self, kind: BackendKind) -> BackendState {
        BackendState {
            kind,
            optimizers: self
                .groups
                .iter()
                .map(|(name, opt)| (name.to_string(), opt.state()))
                .collect(),
            scheduler: self.scheduler.clone(),
        }
    }

    pub(crate) fn state_tensors(&self) -> Vec<(String, Tensor)> {
        self.groups
            .iter()
            .flat_map(|(name, opt)| opt.state_tensors(&format!("optimizer.{name}")))
            .collect()
    }

    pub(crate) fn load_state(&mut self, kind: BackendKind, state: &BackendState, tensors: &HashMap<String, Tensor>) -> Result<()> {
        if state.kind != kind {
            return Err(RlhfError::Checkpoint(format!(
                "checkpoint was written by the {} backend, current backend is {}",
                state.kind.as_str(),
                kind.as_str()
            )));
        }
        for (name, _) in &self.groups {
            if !state.optimizers.contains_key(*name) {
                return Err(RlhfError::Checkpoint(format!("missing optimizer group '{name}'")));
            }
        }

        // Restore into copies so a failure leaves the live optimizers untouched.
        let mut restored = Vec::with_capacity(self.groups.len());
        for (name, opt) in &self.groups {
            let mut copy = AdamW::new(opt.params().iter().map(Tensor::shallow_clone).collect(), opt.lr());
            copy.load_state(&format!("optimizer.{name}"), &state.optimizers[*name], tensors)?;
            restored.push((*name, copy));
        }
        self.groups = restored;
        self.scheduler = state.scheduler.clone();
        Ok(())
    }
}

/// Shared "not prepared" error.
pub(crate) fn unprepared(kind: BackendKind) -> RlhfError {
    RlhfError::Config(format!("{} backend used before prepare()", kind.as_str()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tch::Kind;

    /// Quadratic loss over fresh actor / critic parameters.
    pub(crate) fn toy_params() -> (Tensor, Tensor) {
        (
            Tensor::from_slice(&[1.0f32, -2.0]).set_requires_grad(true),
            Tensor::from_slice(&[3.0f32]).set_requires_grad(true),
        )
    }

    pub(crate) fn toy_loss(actor: &Tensor, critic: &Tensor) -> Tensor {
        (actor * actor).sum(Kind::Float) + (critic * critic).sum(Kind::Float)
    }

    fn config() -> TrainerConfig {
        TrainerConfig::default().with_lr(0.1, 0.01)
    }

    #[test]
    fn test_select_backend_by_flags() {
        let mut cfg = config();
        assert_eq!(select_backend(&cfg, None).unwrap().kind(), BackendKind::Native);

        cfg.dual_optimizer_enable = true;
        assert_eq!(select_backend(&cfg, None).unwrap().kind(), BackendKind::DualOptimizer);

        cfg.accelerate_enable = true;
        assert!(select_backend(&cfg, None).is_err());

        cfg.dual_optimizer_enable = false;
        let backend = select_backend(&cfg, None).unwrap();
        assert_eq!(backend.kind(), BackendKind::Accelerator);
        assert_eq!(backend.checkpoint_layout(), CheckpointLayout::Directory);
    }

    #[test]
    fn test_multi_worker_needs_group() {
        let mut cfg = config();
        cfg.accelerate_enable = true;
        cfg.world_size = 2;
        assert!(select_backend(&cfg, None).is_err());
        assert!(select_backend(&cfg, Some(Box::new(LocalBackend))).is_err());
    }

    #[test]
    fn test_every_backend_updates_both_networks() {
        for flags in [(false, false), (false, true), (true, false)] {
            let mut cfg = config();
            cfg.accelerate_enable = flags.0;
            cfg.dual_optimizer_enable = flags.1;

            let (actor, critic) = toy_params();
            let mut backend = select_backend(&cfg, None).unwrap();
            backend
                .prepare(vec![actor.shallow_clone()], vec![critic.shallow_clone()], 4)
                .unwrap();
            backend.backward_and_step(&toy_loss(&actor, &critic)).unwrap();
            backend.flush().unwrap();

            assert!(actor.double_value(&[0]) < 1.0, "{flags:?}");
            assert!(critic.double_value(&[0]) < 3.0, "{flags:?}");
        }
    }

    #[test]
    fn test_unprepared_backend_errors() {
        let backend = select_backend(&config(), None).unwrap();
        assert!(backend.state().is_err());
    }

    #[test]
    fn test_state_rejects_other_backend() {
        let (actor, critic) = toy_params();
        let mut native = NativeBackend::new(&config());
        native.prepare(vec![actor.shallow_clone()], vec![critic.shallow_clone()], 2).unwrap();
        let state = native.state().unwrap();
        let tensors: HashMap<String, Tensor> = native.state_tensors().unwrap().into_iter().collect();

        let mut dual = DualOptimizerBackend::new(&config());
        dual.prepare(vec![actor], vec![critic], 2).unwrap();
        assert!(matches!(dual.load_state(&state, &tensors), Err(RlhfError::Checkpoint(_))));
    }
}
