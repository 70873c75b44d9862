//! Optimizers and learning-rate schedules used by the training backends.

use crate::{Result, RlhfError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tch::{Kind, Tensor};

/// Scalar AdamW state persisted in checkpoint JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdamWState {
    pub step: u64,
    pub lr: f64,
}

/// AdamW with decoupled weight decay over a fixed parameter group.
pub struct AdamW {
    params: Vec<Tensor>,
    exp_avg: Vec<Tensor>,
    exp_avg_sq: Vec<Tensor>,
    step: u64,
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
}

impl AdamW {
    pub fn new(params: Vec<Tensor>, lr: f64) -> Self {
        let exp_avg = params.iter().map(|p| p.zeros_like().detach()).collect();
        let exp_avg_sq = params.iter().map(|p| p.zeros_like().detach()).collect();
        Self {
            params,
            exp_avg,
            exp_avg_sq,
            step: 0,
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }

    pub fn params(&self) -> &[Tensor] {
        &self.params
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    pub fn zero_grad(&mut self) {
        for p in self.params.iter_mut() {
            p.zero_grad();
        }
    }

    /// Apply one update to every parameter with a defined gradient.
    pub fn step(&mut self) {
        self.step += 1;
        let bias1 = 1.0 - self.beta1.powi(self.step as i32);
        let bias2 = 1.0 - self.beta2.powi(self.step as i32);
        let (lr, beta1, beta2, eps, wd) = (self.lr, self.beta1, self.beta2, self.eps, self.weight_decay);

        tch::no_grad(|| {
            for ((p, m), v) in self
                .params
                .iter_mut()
                .zip(self.exp_avg.iter_mut())
                .zip(self.exp_avg_sq.iter_mut())
            {
                let grad = p.grad();
                if !grad.defined() {
                    continue;
                }
                *m = &*m * beta1 + &grad * (1.0 - beta1);
                *v = &*v * beta2 + grad.square() * (1.0 - beta2);

                let denom = (&*v / bias2).sqrt() + eps;
                let update = (&*m / bias1) / denom * lr;
                let _ = p.g_mul_scalar_(1.0 - lr * wd);
                let _ = p.g_sub_(&update);
            }
        });
    }

    pub fn state(&self) -> AdamWState {
        AdamWState {
            step: self.step,
            lr: self.lr,
        }
    }

    /// Moment tensors named `<prefix>.exp_avg.<i>` / `<prefix>.exp_avg_sq.<i>`.
    pub fn state_tensors(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut named = Vec::with_capacity(self.params.len() * 2);
        for (i, (m, v)) in self.exp_avg.iter().zip(&self.exp_avg_sq).enumerate() {
            named.push((format!("{prefix}.exp_avg.{i}"), m.to_device(tch::Device::Cpu)));
            named.push((format!("{prefix}.exp_avg_sq.{i}"), v.to_device(tch::Device::Cpu)));
        }
        named
    }

    /// Restore moments and scalar state. Nothing changes if any tensor is
    /// missing or has the wrong shape.
    pub fn load_state(&mut self, prefix: &str, state: &AdamWState, tensors: &HashMap<String, Tensor>) -> Result<()> {
        let mut moments = Vec::with_capacity(self.params.len());
        for (i, p) in self.params.iter().enumerate() {
            let pair = ["exp_avg", "exp_avg_sq"].map(|kind| {
                let key = format!("{prefix}.{kind}.{i}");
                match tensors.get(&key) {
                    Some(t) if t.size() == p.size() => Ok(t.to_device(p.device()).to_kind(p.kind())),
                    Some(_) => Err(RlhfError::Checkpoint(format!("shape mismatch for '{key}'"))),
                    None => Err(RlhfError::Checkpoint(format!("missing optimizer tensor '{key}'"))),
                }
            });
            let [m, v] = pair;
            moments.push((m?, v?));
        }

        let (exp_avg, exp_avg_sq): (Vec<Tensor>, Vec<Tensor>) = moments.into_iter().unzip();
        self.exp_avg = exp_avg;
        self.exp_avg_sq = exp_avg_sq;
        self.step = state.step;
        self.lr = state.lr;
        Ok(())
    }
}

/// Cosine annealing with warm restarts.
///
/// `lr = eta_min + (eta_max - eta_min) · (1 + cos(π · t_cur / t_i)) / 2`,
/// restarting when `t_cur` reaches `t_i`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CosineWarmRestarts {
    pub t_0: usize,
    pub t_mult: usize,
    pub t_i: usize,
    pub t_cur: usize,
    pub eta_max: f64,
    pub eta_min: f64,
}

impl CosineWarmRestarts {
    /// Period `t_0` (at least 1), floor at a tenth of `eta_max`.
    pub fn new(t_0: usize, eta_max: f64) -> Self {
        let t_0 = t_0.max(1);
        Self {
            t_0,
            t_mult: 1,
            t_i: t_0,
            t_cur: 0,
            eta_max,
            eta_min: eta_max * 0.1,
        }
    }

    pub fn lr(&self) -> f64 {
        let progress = self.t_cur as f64 / self.t_i as f64;
        self.eta_min + (self.eta_max - self.eta_min) * (1.0 + (std::f64::consts::PI * progress).cos()) / 2.0
    }

    /// Advance one step and return the new learning rate.
    pub fn step(&mut self) -> f64 {
        self.t_cur += 1;
        if self.t_cur >= self.t_i {
            self.t_cur -= self.t_i;
            self.t_i *= self.t_mult;
        }
        self.lr()
    }
}

/// Scale gradients so their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(params: &[Tensor], max_norm: f64) -> f64 {
    let mut global_norm = 0.0f64;
    for var in params {
        let grad = var.grad();
        if grad.defined() {
            global_norm += grad.pow_tensor_scalar(2.0).sum(Kind::Float).double_value(&[]);
        }
    }
    global_norm = global_norm.sqrt();

    if global_norm > max_norm {
        let clip_coef = max_norm / (global_norm + 1e-6);
        for var in params {
            let mut grad = var.grad();
            if grad.defined() {
                let _ = grad.f_mul_scalar_(clip_coef);
            }
        }
    }
    global_norm
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(values: &[f32]) -> Tensor {
        Tensor::from_slice(values).set_requires_grad(true)
    }

    #[test]
    fn test_adamw_moves_against_gradient() {
        let p = param(&[1.0, -1.0]);
        let mut opt = AdamW::new(vec![p.shallow_clone()], 0.1);

        opt.zero_grad();
        (&p * &p).sum(Kind::Float).backward();
        opt.step();

        // first step of Adam moves each weight by ~lr towards zero
        assert!(p.double_value(&[0]) < 0.95);
        assert!(p.double_value(&[1]) > -0.95);
        assert_eq!(opt.state().step, 1);
    }

    #[test]
    fn test_adamw_skips_params_without_grad() {
        let p = param(&[2.0]);
        let mut opt = AdamW::new(vec![p.shallow_clone()], 0.1);
        opt.step();
        assert_eq!(p.double_value(&[0]), 2.0);
    }

    #[test]
    fn test_adamw_state_roundtrip() {
        let p = param(&[1.0, 2.0]);
        let mut opt = AdamW::new(vec![p.shallow_clone()], 0.01);
        opt.zero_grad();
        p.sum(Kind::Float).backward();
        opt.step();

        let tensors: HashMap<String, Tensor> = opt.state_tensors("actor").into_iter().collect();
        let mut restored = AdamW::new(vec![param(&[0.0, 0.0])], 0.5);
        restored.load_state("actor", &opt.state(), &tensors).unwrap();

        assert_eq!(restored.state(), opt.state());
        assert!(restored.exp_avg[0].equal(&opt.exp_avg[0]));
        assert!(restored.exp_avg_sq[0].equal(&opt.exp_avg_sq[0]));
    }

    #[test]
    fn test_adamw_load_rejects_missing_moments() {
        let mut opt = AdamW::new(vec![param(&[1.0])], 0.01);
        let state = opt.state();
        assert!(opt.load_state("actor", &state, &HashMap::new()).is_err());
    }

    #[test]
    fn test_cosine_restarts() {
        let mut sched = CosineWarmRestarts::new(4, 1.0);
        assert!((sched.lr() - 1.0).abs() < 1e-12);

        let lrs: Vec<f64> = (0..4).map(|_| sched.step()).collect();
        // halfway through the period the lr is the midpoint
        assert!((lrs[1] - 0.55).abs() < 1e-12);
        assert!(lrs[0] > lrs[1] && lrs[1] > lrs[2]);
        // restart after t_0 steps
        assert!((lrs[3] - 1.0).abs() < 1e-12);
        assert!(lrs.iter().all(|&lr| lr >= 0.1 - 1e-12));
    }

    #[test]
    fn test_cosine_zero_period_is_clamped() {
        let mut sched = CosineWarmRestarts::new(0, 1e-3);
        assert_eq!(sched.t_0, 1);
        assert!((sched.step() - 1e-3).abs() < 1e-15);
    }

    #[test]
    fn test_clip_grad_norm() {
        let p = param(&[3.0, 4.0]);
        (&p * 1.0).sum(Kind::Float).backward();
        // grad = [1, 1], norm sqrt(2)
        let norm = clip_grad_norm(&[p.shallow_clone()], 0.5);
        assert!((norm - 2f64.sqrt()).abs() < 1e-6);

        let clipped = p.grad().pow_tensor_scalar(2.0).sum(Kind::Float).sqrt().double_value(&[]);
        assert!((clipped - 0.5).abs() < 1e-4);
    }
}
