//! Persisted record of the prompts, completions and rewards seen during
//! training.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// One generated completion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub user_input: String,
    pub completion: String,
    pub reward: f64,
    /// Learning iteration the completion was generated in
    pub learn_counter: usize,
}

/// Append-only conversation log backed by a JSON file.
pub struct ConversationLog {
    path: PathBuf,
    entries: Vec<ConversationEntry>,
}

impl ConversationLog {
    /// Open the log at `path`, loading previous entries when the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => Vec::new(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, user_input: &str, completion: &str, reward: f64, learn_counter: usize) {
        self.entries.push(ConversationEntry {
            user_input: user_input.to_string(),
            completion: completion.to_string(),
            reward,
            learn_counter,
        });
    }

    /// Write all entries as pretty JSON, replacing the file atomically.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&self.entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Drop every entry and truncate the file.
    pub fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        if self.path.exists() {
            fs::write(&self.path, "")?;
        }
        Ok(())
    }

    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Trace the conversations of one learning iteration.
    pub fn show(&self, learn_counter: usize) {
        for (i, entry) in self
            .entries
            .iter()
            .filter(|e| e.learn_counter == learn_counter)
            .enumerate()
        {
            tracing::info!(
                learn_counter,
                index = i,
                reward = entry.reward,
                "\n##### user input #####\n{}\n##### completion #####\n{}",
                entry.user_input,
                entry.completion
            );
        }
    }
}
