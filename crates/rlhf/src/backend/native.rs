//! Single AdamW over the union of actor and critic parameters.

use super::{unprepared, BackendKind, BackendState, OptimizerGroups, TrainingBackend};
use crate::checkpoint::CheckpointLayout;
use crate::config::TrainerConfig;
use crate::optim::AdamW;
use crate::Result;
use std::collections::HashMap;
use tch::Tensor;

pub struct NativeBackend {
    lr: f64,
    max_grad_norm: f64,
    optim: Option<OptimizerGroups>,
}

impl NativeBackend {
    pub fn new(config: &TrainerConfig) -> Self {
        Self {
            lr: config.actor_lr,
            max_grad_norm: config.max_grad_norm,
            optim: None,
        }
    }

    fn optim(&mut self) -> Result<&mut OptimizerGroups> {
        self.optim.as_mut().ok_or_else(|| unprepared(BackendKind::Native))
    }
}

impl TrainingBackend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn prepare(&mut self, mut actor_params: Vec<Tensor>, critic_params: Vec<Tensor>, steps_per_cycle: usize) -> Result<()> {
        actor_params.extend(critic_params);
        let opt = AdamW::new(actor_params, self.lr);
        self.optim = Some(OptimizerGroups::new(
            vec![("actor_critic", opt)],
            steps_per_cycle,
            self.max_grad_norm,
        ));
        Ok(())
    }

    fn backward_and_step(&mut self, loss: &Tensor) -> Result<()> {
        let optim = self.optim()?;
        optim.zero_grad();
        loss.backward();
        optim.step();
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.optim.as_ref().map_or(self.lr, OptimizerGroups::learning_rate)
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
        self.optim()?.load_state(kind, state, tensors)
    }

    fn checkpoint_layout(&self) -> CheckpointLayout {
        CheckpointLayout::File
    }
}
