//! Loss and reward history of a training run.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Per-step losses, per-learning-phase mean rewards and, when fitting a
/// reward model, per-epoch validation losses.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingStats {
    pub training_loss: Vec<f64>,
    pub value_loss: Vec<f64>,
    pub policy_loss: Vec<f64>,
    pub kl: Vec<f64>,
    pub mean_reward: Vec<f64>,
    pub validation_loss: Vec<f64>,
}

impl TrainingStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one optimization step.
    pub fn push_step(&mut self, loss: f64, value_loss: f64, policy_loss: f64, kl: f64) {
        self.training_loss.push(loss);
        self.value_loss.push(value_loss);
        self.policy_loss.push(policy_loss);
        self.kl.push(kl);
    }

    /// Record the mean final reward of one learning phase.
    pub fn push_reward(&mut self, reward: f64) {
        self.mean_reward.push(reward);
    }

    /// Record a supervised step that has no policy or value split.
    pub fn push_loss(&mut self, loss: f64) {
        self.training_loss.push(loss);
    }

    pub fn push_validation(&mut self, loss: f64) {
        self.validation_loss.push(loss);
    }

    /// Number of recorded optimization steps.
    pub fn steps(&self) -> usize {
        self.training_loss.len()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_push_and_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stats").join("training_stats.json");

        let mut stats = TrainingStats::new();
        stats.push_step(1.5, 0.5, 1.0, 0.01);
        stats.push_step(1.2, 0.4, 0.8, 0.02);
        stats.push_reward(2.5);
        assert_eq!(stats.steps(), 2);

        stats.save(&path).unwrap();
        assert_eq!(TrainingStats::load(&path).unwrap(), stats);
    }
}
