//! Independent AdamW groups for actor and critic.

use super::{unprepared, BackendKind, BackendState, OptimizerGroups, TrainingBackend};
use crate::checkpoint::CheckpointLayout;
use crate::config::TrainerConfig;
use crate::optim::AdamW;
use crate::Result;
use std::collections::HashMap;
use tch::Tensor;

/// Actor at `actor_lr` (cosine scheduled), critic at a constant `critic_lr`.
pub struct DualOptimizerBackend {
    actor_lr: f64,
    critic_lr: f64,
    max_grad_norm: f64,
    optim: Option<OptimizerGroups>,
}

impl DualOptimizerBackend {
    pub fn new(config: &TrainerConfig) -> Self {
        Self {
            actor_lr: config.actor_lr,
            critic_lr: config.critic_lr,
            max_grad_norm: config.max_grad_norm,
            optim: None,
        }
    }
}

/// Actor group first so the schedule drives it.
pub(super) fn dual_groups(
    actor_params: Vec<Tensor>,
    critic_params: Vec<Tensor>,
    actor_lr: f64,
    critic_lr: f64,
    steps_per_cycle: usize,
    max_grad_norm: f64,
) -> OptimizerGroups {
    OptimizerGroups::new(
        vec![
            ("actor", AdamW::new(actor_params, actor_lr)),
            ("critic", AdamW::new(critic_params, critic_lr)),
        ],
        steps_per_cycle,
        max_grad_norm,
    )
}

impl TrainingBackend for DualOptimizerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::DualOptimizer
    }

    fn prepare(&mut self, actor_params: Vec<Tensor>, critic_params: Vec<Tensor>, steps_per_cycle: usize) -> Result<()> {
        self.optim = Some(dual_groups(
            actor_params,
            critic_params,
            self.actor_lr,
            self.critic_lr,
            steps_per_cycle,
            self.max_grad_norm,
        ));
        Ok(())
    }

    fn backward_and_step(&mut self, loss: &Tensor) -> Result<()> {
        let optim = self.optim.as_mut().ok_or_else(|| unprepared(BackendKind::DualOptimizer))?;
        optim.zero_grad();
        loss.backward();
        optim.step();
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.optim.as_ref().map_or(self.actor_lr, OptimizerGroups::learning_rate)
    }

    fn state(&self) -> Result<BackendState> {
        let optim = self.optim.as_ref().ok_or_else(|| unprepared(self.kind()))?;
        Ok(optim.state(self.kind()))
    }

    fn state_tensors(&self) -> Result<Vec<(String, Tensor)>> {
        let optim = self.optim.as_ref().ok_or_else(|| unprepared(self.kind()))?;
        Ok(optim.state_tensors())
    }

    fn load_state(&mut self, state: &BackendState, tensors: &HashMap<String, Tensor>) -> Result<()> {
        let kind = self.kind();
        let optim = self.optim.as_mut().ok_or_else(|| unprepared(kind))?;
        optim.load_state(kind, state, tensors)
    }

    fn checkpoint_layout(&self) -> CheckpointLayout {
        CheckpointLayout::File
    }
}
