//! PPO loss terms for token-level RLHF.
//!
//! Shapes: `B` records per batch, `A` generated positions per record.

use crate::{Result, RlhfError};
use tch::{Kind, Tensor};

/// Added inside the log and to the advantage std.
pub const EPS: f64 = 1e-8;

/// Probability and log-probability of the most likely token at every
/// position.
///
/// This is the max of the softmax, not the probability of the sampled
/// token. Rollout and learning both use it, so ratios stay consistent.
///
/// # Arguments
/// * `logits` - [B, A, V]
///
/// # Returns
/// `(probs, log_probs)`, both [B, A]
pub fn max_prob_log_probs(logits: &Tensor, eps: f64) -> (Tensor, Tensor) {
    let probs = logits.softmax(-1, Kind::Float).max_dim(-1, false).0;
    let log_probs = (&probs + eps).log();
    (probs, log_probs)
}

/// Σ p·log p over positions, [B].
pub fn entropy(probs: &Tensor, log_probs: &Tensor) -> Tensor {
    (probs * log_probs).sum_dim_intlist(Some(&[-1i64][..]), false, Kind::Float)
}

/// Batch mean of Σ p·(old_lp − new_lp), scalar.
pub fn kl_penalty(probs: &Tensor, old_log_probs: &Tensor, log_probs: &Tensor) -> Tensor {
    (probs * (old_log_probs - log_probs))
        .sum_dim_intlist(Some(&[-1i64][..]), false, Kind::Float)
        .mean(Kind::Float)
}

/// exp(new − old), [B, A].
pub fn importance_ratio(log_probs: &Tensor, old_log_probs: &Tensor) -> Tensor {
    (log_probs - old_log_probs).exp()
}

/// Discounted reward-to-go along the last dimension.
///
/// `out[:, i] = Σ_{j >= i} gamma^(j - i) · rewards[:, j]`
pub fn discounted_rewards(rewards: &Tensor, gamma: f64) -> Tensor {
    let steps = rewards.size()[1];
    let out = rewards.zeros_like().to_kind(Kind::Float);
    let mut running = rewards.select(1, 0).zeros_like().to_kind(Kind::Float);

    for t in (0..steps).rev() {
        running = rewards.select(1, t).to_kind(Kind::Float) + gamma * &running;
        out.select(1, t).copy_(&running);
    }

    out
}

/// Center each row on its own mean and scale by the batch std.
///
/// A single element, or a batch whose std is zero, yields zeros instead of
/// NaN.
pub fn normalize_advantages(advantages: &Tensor, eps: f64) -> Tensor {
    let centered = advantages - advantages.mean_dim(Some(&[-1i64][..]), true, Kind::Float);
    if advantages.numel() < 2 {
        return centered.zeros_like();
    }
    let std = advantages.std(true);
    centered / (std + eps)
}

/// Final reward minus the final old value, [B, 1].
pub fn final_reward_advantages(rewards: &Tensor, old_values: &Tensor) -> Tensor {
    let last = rewards.size()[1] - 1;
    let last_value = old_values.size()[1] - 1;
    (rewards.select(1, last) - old_values.select(1, last_value)).unsqueeze(-1)
}

/// mean(−min(A·r, A·clip(r, 1 ± ε)) − β·entropy) + kl
///
/// # Arguments
/// * `advantages` - [B, A] or [B, 1]
/// * `ratio` - [B, A]
/// * `entropy` - [B]
/// * `kl` - scalar
pub fn clipped_policy_loss(
    advantages: &Tensor,
    ratio: &Tensor,
    entropy: &Tensor,
    eps_clip: f64,
    beta_s: f64,
    kl: &Tensor,
) -> Tensor {
    let surr1 = advantages * ratio;
    let surr2 = ratio.clamp(1.0 - eps_clip, 1.0 + eps_clip) * advantages;
    let loss = -surr1.min_other(&surr2) - beta_s * entropy.unsqueeze(-1);
    loss.mean(Kind::Float) + kl
}

/// mean(max((clip(V, V_old ± ε) − R)², (V − R)²))
pub fn clipped_value_loss(values: &Tensor, old_values: &Tensor, targets: &Tensor, eps_clip: f64) -> Tensor {
    let clipped = old_values + (values - old_values).clamp(-eps_clip, eps_clip);
    let loss1 = (&clipped - targets).pow_tensor_scalar(2);
    let loss2 = (values - targets).pow_tensor_scalar(2);
    loss1.max_other(&loss2).mean(Kind::Float)
}

/// Fail with `NanLoss` if `loss` holds a NaN.
pub fn ensure_not_nan(loss: &Tensor, which: &'static str) -> Result<()> {
    if loss.isnan().any().int64_value(&[]) != 0 {
        return Err(RlhfError::NanLoss { which });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(values: &[f32], shape: &[i64]) -> Tensor {
        Tensor::from_slice(values).reshape(shape)
    }

    fn scalar(x: &Tensor) -> f64 {
        x.double_value(&[])
    }

    #[test]
    fn test_log_probs_use_max_softmax() {
        // softmax([0, ln 3]) = [0.25, 0.75]
        let logits = t(&[0.0, 3f32.ln()], &[1, 1, 2]);
        let (probs, log_probs) = max_prob_log_probs(&logits, EPS);
        assert!((probs.double_value(&[0, 0]) - 0.75).abs() < 1e-6);
        assert!((log_probs.double_value(&[0, 0]) - (0.75f64 + EPS).ln()).abs() < 1e-6);
    }

    #[test]
    fn test_entropy_and_kl() {
        let probs = t(&[0.5, 0.5], &[1, 2]);
        let old = t(&[-1.0, -1.0], &[1, 2]);
        let new = t(&[-2.0, -2.0], &[1, 2]);

        assert!((entropy(&probs, &old).double_value(&[0]) + 1.0).abs() < 1e-6);
        // 0.5 * 1 + 0.5 * 1
        assert!((scalar(&kl_penalty(&probs, &old, &new)) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_ratio_is_one_for_identical_log_probs() {
        let lp = t(&[-0.3, -1.2, -2.0], &[1, 3]);
        let ratio = importance_ratio(&lp, &lp);
        assert!((ratio - 1.0).abs().max().double_value(&[]) < 1e-6);
    }

    #[test]
    fn test_discounted_rewards() {
        let rewards = t(&[1.0, 2.0, 3.0], &[1, 3]);
        let out = discounted_rewards(&rewards, 0.5);
        // [1 + 0.5·2 + 0.25·3, 2 + 0.5·3, 3]
        let expected = [2.75, 3.5, 3.0];
        for (i, e) in expected.iter().enumerate() {
            assert!((out.double_value(&[0, i as i64]) - e).abs() < 1e-6);
        }
    }

    #[test]
    fn test_constant_advantages_normalize_to_finite() {
        let adv = t(&[1.0, 1.0, 1.0], &[1, 3]);
        let norm = normalize_advantages(&adv, EPS);
        assert_eq!(norm.isfinite().all().int64_value(&[]), 1);
        assert!(norm.abs().max().double_value(&[]) < 1e-6);

        let single = t(&[4.0], &[1, 1]);
        assert_eq!(normalize_advantages(&single, EPS).double_value(&[0, 0]), 0.0);
    }

    #[test]
    fn test_normalize_centers_each_row() {
        let adv = t(&[1.0, 3.0, 10.0, 14.0], &[2, 2]);
        let norm = normalize_advantages(&adv, EPS);
        let row_means = norm.mean_dim(Some(&[-1i64][..]), false, Kind::Float);
        assert!(row_means.abs().max().double_value(&[]) < 1e-6);
    }

    #[test]
    fn test_final_reward_advantages() {
        let rewards = t(&[0.0, 0.0, 3.0, 0.0, 0.0, -1.0], &[2, 3]);
        let values = t(&[0.5, 0.5, 1.0, 0.0, 0.0, 1.0], &[2, 3]);
        let adv = final_reward_advantages(&rewards, &values);
        assert_eq!(adv.size(), [2, 1]);
        assert!((adv.double_value(&[0, 0]) - 2.0).abs() < 1e-6);
        assert!((adv.double_value(&[1, 0]) + 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_policy_loss_clips_ratio() {
        let adv = t(&[1.0], &[1, 1]);
        let ratio = t(&[2.0], &[1, 1]);
        let entropy = t(&[0.0], &[1]);
        let kl = Tensor::from(0.0f32);
        // min(2, 1.2) = 1.2
        let loss = clipped_policy_loss(&adv, &ratio, &entropy, 0.2, 0.1, &kl);
        assert!((scalar(&loss) + 1.2).abs() < 1e-6);
    }

    #[test]
    fn test_policy_loss_broadcasts_entropy_and_adds_kl() {
        let adv = t(&[0.0, 0.0], &[2, 1]);
        let ratio = t(&[1.0, 1.0, 1.0, 1.0, 1.0, 1.0], &[2, 3]);
        let entropy = t(&[-1.0, -3.0], &[2]);
        let kl = Tensor::from(0.5f32);
        // mean(0.1·[1, 1, 1, 3, 3, 3]) + 0.5
        let loss = clipped_policy_loss(&adv, &ratio, &entropy, 0.2, 0.1, &kl);
        assert!((scalar(&loss) - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_value_loss_takes_clipped_branch() {
        let old = t(&[0.0], &[1, 1]);
        let new = t(&[5.0], &[1, 1]);
        let target = t(&[10.0], &[1, 1]);
        // clipped value 1: (1 - 10)² = 81 > (5 - 10)² = 25
        let loss = clipped_value_loss(&new, &old, &target, 1.0);
        assert!((scalar(&loss) - 81.0).abs() < 1e-6);
    }

    #[test]
    fn test_nan_loss_is_fatal() {
        let loss = Tensor::from(f32::NAN);
        assert!(matches!(
            ensure_not_nan(&loss, "Policy"),
            Err(RlhfError::NanLoss { which: "Policy" })
        ));
        assert!(ensure_not_nan(&Tensor::from(1.0f32), "Value").is_ok());
    }
}
