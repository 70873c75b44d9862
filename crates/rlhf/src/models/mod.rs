//! Model wrappers for the roles of an RLHF run.
//!
//! The networks themselves are opaque collaborators behind two traits:
//! - `CausalLm` - token sequence to next-token logits, plus generation
//! - `Backbone` - token sequence to per-position hidden states
//!
//! `ActorModel` wraps a `CausalLm`; `ScoringModel` puts a scalar head on a
//! `Backbone` and serves as both critic and reward model.

mod actor;
mod artifact;
mod scoring;
mod tiny;

pub use actor::ActorModel;
pub use artifact::{load_artifact, save_artifact, ArtifactMeta};
pub use scoring::{CriticModel, RewardModel, ScoringModel};
pub use tiny::{TinyBackbone, TinyCausalLm};

use crate::config::ModelRole;
use crate::{Result, RlhfError};
use std::collections::HashMap;
use tch::{nn, Tensor};

/// Decoding parameters for `CausalLm::generate`.
#[derive(Clone, Debug)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    /// Sampling temperature, 0 for greedy decoding
    pub temperature: f64,
    pub eos_token_id: i64,
    pub pad_token_id: i64,
}

/// Sequence model producing next-token logits.
pub trait CausalLm: Send {
    /// Logits [B, L, V] for every position of `tokens` [B, L].
    fn forward(&self, tokens: &Tensor, mask: &Tensor, train: bool) -> Tensor;

    /// Extend `tokens` with up to `max_new_tokens` tokens.
    ///
    /// Returns `(actions [B, A], sequences [B, L + A])`. Rows that emitted eos
    /// are padded with `pad_token_id` afterwards.
    fn generate(&self, tokens: &Tensor, mask: &Tensor, params: &GenerationParams) -> Result<(Tensor, Tensor)>;

    fn var_store(&self) -> &nn::VarStore;

    fn var_store_mut(&mut self) -> &mut nn::VarStore;
}

/// Sequence model producing hidden states.
pub trait Backbone: Send {
    /// Hidden states [B, L, H].
    fn forward(&self, tokens: &Tensor, mask: &Tensor, train: bool) -> Tensor;

    fn hidden_size(&self) -> i64;

    fn var_store(&self) -> &nn::VarStore;

    fn var_store_mut(&mut self) -> &mut nn::VarStore;
}

/// Uniform save/restore contract shared by every role.
pub trait RoleModel {
    fn role(&self) -> ModelRole;

    /// Named tensors making up the role's persisted state.
    fn state_tensors(&self) -> Vec<(String, Tensor)>;

    /// Copy `tensors` into the model. Either every tensor is restored or
    /// nothing is modified.
    fn restore_tensors(&mut self, tensors: &HashMap<String, Tensor>) -> Result<()>;

    /// LoRA flags written next to the tensors.
    fn artifact_meta(&self) -> ArtifactMeta;
}

/// Variables of `vs` that receive gradients.
///
/// Frozen variables stay in the store but are skipped, so LoRA runs only
/// expose their adapters.
pub fn trainable(vs: &nn::VarStore) -> Vec<Tensor> {
    vs.trainable_variables()
        .into_iter()
        .filter(|t| t.requires_grad())
        .collect()
}

/// Every variable of `vs`, named `<prefix>.<var>`, sorted by name.
pub(crate) fn prefixed_variables(vs: &nn::VarStore, prefix: &str) -> Vec<(String, Tensor)> {
    let mut named: Vec<(String, Tensor)> = vs
        .variables()
        .into_iter()
        .map(|(name, t)| (format!("{prefix}.{name}"), t.detach().to_device(tch::Device::Cpu)))
        .collect();
    named.sort_by(|a, b| a.0.cmp(&b.0));
    named
}

/// Check that `tensors` holds a shape-compatible entry for every variable
/// of `vs` under `prefix`.
pub(crate) fn check_variables(
    vs: &nn::VarStore,
    prefix: &str,
    tensors: &HashMap<String, Tensor>,
) -> Result<()> {
    for (name, var) in vs.variables() {
        let key = format!("{prefix}.{name}");
        let saved = tensors
            .get(&key)
            .ok_or_else(|| RlhfError::Checkpoint(format!("missing tensor '{key}'")))?;
        if saved.size() != var.size() {
            return Err(RlhfError::Checkpoint(format!(
                "shape mismatch for '{key}': saved {:?}, expected {:?}",
                saved.size(),
                var.size()
            )));
        }
    }
    Ok(())
}

/// Copy the `prefix` entries of `tensors` into `vs`. Run `check_variables`
/// first.
pub(crate) fn copy_variables(vs: &mut nn::VarStore, prefix: &str, tensors: &HashMap<String, Tensor>) {
    let device = vs.device();
    let mut variables = vs.variables();
    tch::no_grad(|| {
        for (name, var) in variables.iter_mut() {
            if let Some(saved) = tensors.get(&format!("{prefix}.{name}")) {
                var.copy_(&saved.to_device(device));
            }
        }
    });
}
