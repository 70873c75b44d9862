//! Model artifact files: tensors in a `.pt` file, flags in a JSON sidecar.

use super::RoleModel;
use crate::config::ModelRole;
use crate::{Result, RlhfError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tch::Tensor;

/// Metadata stored next to a model artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub role: ModelRole,
    pub lora_peft: bool,
    /// Only set for actor-critic artifacts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critic_lora_peft: Option<bool>,
}

fn sidecar(path: &Path) -> PathBuf {
    path.with_extension("json")
}

/// Write a model's tensors and metadata.
pub fn save_artifact<P: AsRef<Path>>(model: &dyn RoleModel, path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Tensor::save_multi(&model.state_tensors(), path)?;
    std::fs::write(sidecar(path), serde_json::to_string_pretty(&model.artifact_meta())?)?;
    tracing::info!(path = %path.display(), role = model.role().as_str(), "Saved model");
    Ok(())
}

/// Read an artifact and load it into `model`.
///
/// Unlike resuming from a checkpoint, a LoRA flag mismatch here is an error:
/// the weights cannot be used with the current adapter layout.
pub fn load_artifact<P: AsRef<Path>>(model: &mut dyn RoleModel, path: P) -> Result<()> {
    let path = path.as_ref();
    let meta: ArtifactMeta = serde_json::from_str(&std::fs::read_to_string(sidecar(path))?)?;
    let current = model.artifact_meta();
    if meta.lora_peft != current.lora_peft || meta.critic_lora_peft != current.critic_lora_peft {
        return Err(RlhfError::Checkpoint(format!(
            "{} was saved with lora_peft={} but the model has lora_peft={}",
            path.display(),
            meta.lora_peft,
            current.lora_peft
        )));
    }

    let tensors: HashMap<String, Tensor> = Tensor::load_multi(path)?.into_iter().collect();
    model.restore_tensors(&tensors)?;
    tracing::info!(path = %path.display(), role = model.role().as_str(), "Loaded model");
    Ok(())
}
