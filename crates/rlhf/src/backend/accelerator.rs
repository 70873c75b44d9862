//! Dual AdamW with gradient accumulation and cross-worker gradient averaging.

use super::dual::dual_groups;
use super::{unprepared, BackendKind, BackendState, DistributedBackend, OptimizerGroups, TrainingBackend};
use crate::checkpoint::CheckpointLayout;
use crate::config::TrainerConfig;
use crate::Result;
use std::collections::HashMap;
use tch::Tensor;

pub struct AcceleratorBackend {
    actor_lr: f64,
    critic_lr: f64,
    max_grad_norm: f64,
    accumulation_steps: usize,
    micro_step: usize,
    distributed: Box<dyn DistributedBackend>,
    optim: Option<OptimizerGroups>,
}

impl AcceleratorBackend {
    pub fn new(config: &TrainerConfig, distributed: Box<dyn DistributedBackend>) -> Self {
        Self {
            actor_lr: config.actor_lr,
            critic_lr: config.critic_lr,
            max_grad_norm: config.max_grad_norm,
            accumulation_steps: config.gradient_accumulation_steps.max(1),
            micro_step: 0,
            distributed,
            optim: None,
        }
    }

    pub fn rank(&self) -> usize {
        self.distributed.rank()
    }

    /// Average gradients across workers, then step.
    fn sync_and_step(&mut self) -> Result<()> {
        let optim = self.optim.as_mut().ok_or_else(|| unprepared(BackendKind::Accelerator))?;
        if self.distributed.world_size() > 1 {
            for param in optim.params() {
                let mut grad = param.grad();
                if !grad.defined() {
                    continue;
                }
                let mut reduced = grad.shallow_clone();
                self.distributed.all_reduce(&mut reduced)?;
                tch::no_grad(|| {
                    grad.copy_(&reduced);
                });
            }
        }
        optim.step();
        optim.zero_grad();
        self.micro_step = 0;
        Ok(())
    }
}

impl TrainingBackend for AcceleratorBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Accelerator
    }

    fn prepare(&mut self, actor_params: Vec<Tensor>, critic_params: Vec<Tensor>, steps_per_cycle: usize) -> Result<()> {
        // every worker starts from rank 0's weights
        if self.distributed.world_size() > 1 {
            for param in actor_params.iter().chain(&critic_params) {
                let mut value = param.detach();
                self.distributed.broadcast(&mut value)?;
                tch::no_grad(|| {
                    param.detach().copy_(&value);
                });
            }
            self.distributed.barrier()?;
        }

        // one optimizer step per accumulated group of batches
        let steps = (steps_per_cycle / self.accumulation_steps).max(1);
        let mut optim = dual_groups(
            actor_params,
            critic_params,
            self.actor_lr,
            self.critic_lr,
            steps,
            self.max_grad_norm,
        );
        optim.zero_grad();
        self.optim = Some(optim);
        self.micro_step = 0;
        Ok(())
    }

    fn backward_and_step(&mut self, loss: &Tensor) -> Result<()> {
        if self.optim.is_none() {
            return Err(unprepared(self.kind()));
        }
        (loss / self.accumulation_steps as f64).backward();
        self.micro_step += 1;
        if self.micro_step >= self.accumulation_steps {
            self.sync_and_step()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.micro_step > 0 {
            self.sync_and_step()?;
        }
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
        CheckpointLayout::Directory
    }

    fn is_master(&self) -> bool {
        self.distributed.is_master()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::{toy_loss, toy_params};
    use crate::backend::{LocalBackend, ThreadDistributedBackend};
    use std::thread;
    use tch::Kind;

    fn config(accumulation: usize, world_size: usize) -> TrainerConfig {
        let mut config = TrainerConfig::default().with_lr(0.1, 0.1);
        config.accelerate_enable = true;
        config.gradient_accumulation_steps = accumulation;
        config.world_size = world_size;
        config
    }

    #[test]
    fn test_accumulates_before_stepping() {
        let (actor, critic) = toy_params();
        let mut backend = AcceleratorBackend::new(&config(2, 1), Box::new(LocalBackend));
        backend
            .prepare(vec![actor.shallow_clone()], vec![critic.shallow_clone()], 4)
            .unwrap();

        backend.backward_and_step(&toy_loss(&actor, &critic)).unwrap();
        assert_eq!(actor.double_value(&[0]), 1.0);

        backend.backward_and_step(&toy_loss(&actor, &critic)).unwrap();
        assert!(actor.double_value(&[0]) < 1.0);
    }

    #[test]
    fn test_flush_applies_pending_gradients() {
        let (actor, critic) = toy_params();
        let mut backend = AcceleratorBackend::new(&config(4, 1), Box::new(LocalBackend));
        backend
            .prepare(vec![actor.shallow_clone()], vec![critic.shallow_clone()], 4)
            .unwrap();

        backend.backward_and_step(&toy_loss(&actor, &critic)).unwrap();
        assert_eq!(critic.double_value(&[0]), 3.0);
        backend.flush().unwrap();
        assert!(critic.double_value(&[0]) < 3.0);
    }

    #[test]
    fn test_workers_stay_in_sync() {
        let handles: Vec<_> = ThreadDistributedBackend::group(2)
            .into_iter()
            .map(|worker| {
                thread::spawn(move || {
                    let rank = worker.rank() as f64;
                    // different initial weights and different data per worker
                    let actor = Tensor::from_slice(&[rank as f32 + 1.0]).set_requires_grad(true);
                    let critic = Tensor::from_slice(&[rank as f32 - 1.0]).set_requires_grad(true);
                    let mut backend = AcceleratorBackend::new(&config(1, 2), Box::new(worker));
                    backend
                        .prepare(vec![actor.shallow_clone()], vec![critic.shallow_clone()], 4)
                        .unwrap();

                    let loss = (&actor * (rank + 1.0)).sum(Kind::Float) + critic.sum(Kind::Float);
                    backend.backward_and_step(&loss).unwrap();
                    (actor.double_value(&[0]), critic.double_value(&[0]), backend.is_master())
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0].0, results[1].0);
        assert_eq!(results[0].1, results[1].1);
        assert!(results[0].2 && !results[1].2);
    }
}
