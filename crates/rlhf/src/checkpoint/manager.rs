//! Checkpoint manager: save with rotation, find the latest, resume.

use super::state::{CheckpointState, Checkpointable, ResumeCursor};
use super::CheckpointLayout;
use crate::{Result, RlhfError};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tch::Tensor;

/// Name prefix of RL training checkpoints.
const RL_PREFIX: &str = "rl_checkpoint_episode_";
const MODEL_FILE: &str = "model.pt";
const OPTIMIZER_FILE: &str = "optimizer.pt";
const CLIENT_STATE_FILE: &str = "client_state.json";

/// Configuration for checkpoint management.
#[derive(Clone, Debug)]
pub struct CheckpointConfig {
    /// Directory to store checkpoints
    pub checkpoint_dir: PathBuf,
    pub layout: CheckpointLayout,
    /// Keep only the last N checkpoints (0 = keep all)
    pub keep_last: usize,
    /// File name prefix, followed by the zero-padded episode
    pub prefix: String,
    /// Also encode the step (`<prefix>NNNNNN_step_NNNNNN`)
    pub step_in_name: bool,
}

impl CheckpointConfig {
    pub fn new(checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            layout: CheckpointLayout::File,
            keep_last: 0,
            prefix: RL_PREFIX.to_string(),
            step_in_name: false,
        }
    }

    pub fn layout(mut self, layout: CheckpointLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn keep_last(mut self, n: usize) -> Self {
        self.keep_last = n;
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn step_in_name(mut self, enabled: bool) -> Self {
        self.step_in_name = enabled;
        self
    }
}

/// Manages the checkpoint lifecycle.
///
/// # Example
///
/// ```ignore
/// let manager = CheckpointManager::new(CheckpointConfig::new("./checkpoints").keep_last(3));
///
/// // after finishing episode 4
/// manager.save(&state, ResumeCursor { episode: 5, step: 0 })?;
///
/// // on restart
/// let cursor = manager.resume(&mut state);
/// ```
#[derive(Clone, Debug)]
pub struct CheckpointManager {
    config: CheckpointConfig,
}

impl CheckpointManager {
    pub fn new(config: CheckpointConfig) -> Self {
        Self { config }
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.config.checkpoint_dir
    }

    pub fn layout(&self) -> CheckpointLayout {
        self.config.layout
    }

    /// Checkpoint path for a resume cursor. The step is part of the name
    /// only with `step_in_name`.
    pub fn path_for(&self, cursor: ResumeCursor) -> PathBuf {
        let mut stem = format!("{}{:06}", self.config.prefix, cursor.episode);
        if self.config.step_in_name {
            stem.push_str(&format!("_step_{:06}", cursor.step));
        }
        let name = match self.config.layout {
            CheckpointLayout::File => format!("{stem}.pt"),
            CheckpointLayout::Directory => stem,
        };
        self.config.checkpoint_dir.join(name)
    }

    /// Cursor encoded in a checkpoint path of this manager.
    pub fn cursor_from_path(&self, path: &Path) -> Result<ResumeCursor> {
        let not_ours = || RlhfError::Checkpoint(format!("not a checkpoint path: {}", path.display()));
        let name = match self.config.layout {
            CheckpointLayout::File => path.file_name().and_then(|n| n.to_str()).and_then(|n| n.strip_suffix(".pt")),
            CheckpointLayout::Directory => path.file_name().and_then(|n| n.to_str()),
        };
        let rest = name
            .and_then(|n| n.strip_prefix(self.config.prefix.as_str()))
            .ok_or_else(not_ours)?;

        let (episode, step) = match (self.config.step_in_name, rest.split_once("_step_")) {
            (true, Some((episode, step))) => (episode, Some(step)),
            (false, None) => (rest, None),
            _ => return Err(not_ours()),
        };
        let parse = |s: &str| s.parse::<usize>().map_err(|_| not_ours());
        Ok(ResumeCursor {
            episode: parse(episode)?,
            step: step.map(parse).transpose()?.unwrap_or(0),
        })
    }

    /// Write a checkpoint resuming at `cursor`, replacing any checkpoint at
    /// the same path, then rotate old ones away.
    pub fn save<T: Checkpointable + ?Sized>(&self, target: &T, cursor: ResumeCursor) -> Result<PathBuf> {
        fs::create_dir_all(&self.config.checkpoint_dir)?;
        let state = CheckpointState::capture(target, cursor)?;
        let path = self.path_for(cursor);

        match self.config.layout {
            CheckpointLayout::File => {
                let mut tensors = target.model_tensors();
                tensors.extend(target.optimizer_tensors()?);

                let tmp_tensors = path.with_extension("pt.tmp");
                let sidecar = path.with_extension("json");
                let tmp_sidecar = path.with_extension("json.tmp");
                Tensor::save_multi(&tensors, &tmp_tensors)?;
                fs::write(&tmp_sidecar, serde_json::to_string_pretty(&state)?)?;
                fs::rename(&tmp_tensors, &path)?;
                fs::rename(&tmp_sidecar, &sidecar)?;
            }
            CheckpointLayout::Directory => {
                if path.exists() {
                    fs::remove_dir_all(&path)?;
                }
                fs::create_dir_all(&path)?;
                Tensor::save_multi(&target.model_tensors(), path.join(MODEL_FILE))?;
                Tensor::save_multi(&target.optimizer_tensors()?, path.join(OPTIMIZER_FILE))?;
                fs::write(path.join(CLIENT_STATE_FILE), serde_json::to_string_pretty(&state)?)?;
            }
        }
        tracing::info!(path = %path.display(), episode = cursor.episode, step = cursor.step, "Saved checkpoint");

        if self.config.keep_last > 0 {
            self.cleanup_old_checkpoints()?;
        }
        Ok(path)
    }

    /// Resume from the latest checkpoint.
    ///
    /// Never fails: a missing, unreadable or incompatible checkpoint yields
    /// a fresh cursor and leaves `target` untouched.
    pub fn resume<T: Checkpointable + ?Sized>(&self, target: &mut T) -> ResumeCursor {
        tracing::info!(dir = %self.config.checkpoint_dir.display(), "Looking for checkpoints...");
        let path = match self.find_latest() {
            Some(path) => path,
            None => return ResumeCursor::fresh(),
        };

        let (state, tensors) = match self.read(&path) {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Checkpoint corrupted! Try to remove the last checkpoint. Now starting from episode 0, step 0"
                );
                return ResumeCursor::fresh();
            }
        };

        let current = target.lora_flags();
        if state.lora_peft != current.lora_peft || state.critic_lora_peft != current.critic_lora_peft {
            tracing::warn!(
                saved = ?state.lora_flags(),
                current = ?current,
                "Checkpoint is not compatible with the current lora_peft setting. Now starting from episode 0, step 0"
            );
            return ResumeCursor::fresh();
        }

        if let Err(e) = target.restore(&state, &tensors) {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Checkpoint could not be restored. Now starting from episode 0, step 0"
            );
            return ResumeCursor::fresh();
        }

        tracing::info!(path = %path.display(), episode = state.episode, "Loaded checkpoint");
        state.cursor()
    }

    /// Read a checkpoint without applying it.
    pub fn read(&self, path: &Path) -> Result<(CheckpointState, HashMap<String, Tensor>)> {
        let (state_file, tensor_files) = match self.config.layout {
            CheckpointLayout::File => (path.with_extension("json"), vec![path.to_path_buf()]),
            CheckpointLayout::Directory => (
                path.join(CLIENT_STATE_FILE),
                vec![path.join(MODEL_FILE), path.join(OPTIMIZER_FILE)],
            ),
        };

        let state: CheckpointState = serde_json::from_str(&fs::read_to_string(&state_file)?)?;
        let mut tensors = HashMap::new();
        for file in tensor_files {
            tensors.extend(Tensor::load_multi(&file)?);
        }
        Ok((state, tensors))
    }

    /// State of the latest checkpoint, if any.
    pub fn latest_state(&self) -> Result<Option<(PathBuf, CheckpointState)>> {
        match self.find_latest() {
            Some(path) => {
                let (state, _) = self.read(&path)?;
                Ok(Some((path, state)))
            }
            None => Ok(None),
        }
    }

    /// Most recent checkpoint of the configured layout.
    pub fn find_latest(&self) -> Option<PathBuf> {
        self.list().pop()
    }

    /// All checkpoints of the configured layout, oldest first.
    pub fn list(&self) -> Vec<PathBuf> {
        let entries = match fs::read_dir(&self.config.checkpoint_dir) {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };

        let layout = self.config.layout;
        let mut checkpoints: Vec<(ResumeCursor, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| match layout {
                CheckpointLayout::File => p.is_file(),
                CheckpointLayout::Directory => p.is_dir(),
            })
            .filter_map(|p| self.cursor_from_path(&p).ok().map(|cursor| (cursor, p)))
            .collect();

        checkpoints.sort_by_key(|(cursor, _)| (cursor.episode, cursor.step));
        checkpoints.into_iter().map(|(_, p)| p).collect()
    }

    /// Remove old checkpoints, keeping only the last N.
    fn cleanup_old_checkpoints(&self) -> Result<()> {
        let mut checkpoints = self.list();

        while checkpoints.len() > self.config.keep_last {
            let old = checkpoints.remove(0);
            let removed = match self.config.layout {
                CheckpointLayout::File => {
                    fs::remove_file(&old).and_then(|_| match fs::remove_file(old.with_extension("json")) {
                        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                        _ => Ok(()),
                    })
                }
                CheckpointLayout::Directory => fs::remove_dir_all(&old),
            };
            if let Err(e) = removed {
                tracing::warn!(path = %old.display(), "Failed to remove old checkpoint: {}", e);
            } else {
                tracing::debug!(path = %old.display(), "Removed old checkpoint");
            }
        }

        Ok(())
    }
}
