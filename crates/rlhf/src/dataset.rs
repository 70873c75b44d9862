//! Prompt and reward datasets stored as JSON arrays.

use crate::{Result, RlhfError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;
use std::path::Path;

/// Score of reward samples without a human or model rating.
pub const DEFAULT_SCORE: f64 = 2.5;

#[derive(Deserialize)]
struct PromptRecord {
    user_input: String,
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| RlhfError::Dataset(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| RlhfError::Dataset(format!("malformed dataset {}: {e}", path.display())))
}

/// Uniform sampler over the prompts of a training run.
///
/// Each call draws distinct prompts; the same prompt may come back in a
/// later call.
pub struct ExamplesSampler {
    prompts: Vec<String>,
    rng: StdRng,
}

impl ExamplesSampler {
    /// Load `[{ "user_input": ... }, ...]`.
    pub fn from_path(path: impl AsRef<Path>, seed: u64) -> Result<Self> {
        let path = path.as_ref();
        let records: Vec<PromptRecord> = read_json(path)?;
        tracing::info!(path = %path.display(), prompts = records.len(), "Loaded prompt dataset");
        Self::from_prompts(records.into_iter().map(|r| r.user_input).collect(), seed)
    }

    pub fn from_prompts(prompts: Vec<String>, seed: u64) -> Result<Self> {
        if prompts.is_empty() {
            return Err(RlhfError::Dataset("prompt dataset is empty".into()));
        }
        Ok(Self {
            prompts,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    /// Draw `n` distinct prompts.
    pub fn sample(&mut self, n: usize) -> Result<Vec<String>> {
        if n > self.prompts.len() {
            return Err(RlhfError::Dataset(format!(
                "cannot sample {n} prompts from a dataset of {}",
                self.prompts.len()
            )));
        }
        Ok(self
            .prompts
            .choose_multiple(&mut self.rng, n)
            .cloned()
            .collect())
    }
}

#[derive(Deserialize)]
struct RewardRecord {
    user_input: String,
    completion: String,
    #[serde(default)]
    score: Option<f64>,
}

/// One scored completion.
#[derive(Clone, Debug, PartialEq)]
pub struct RewardSample {
    /// Prompt followed by completion
    pub text: String,
    pub score: f64,
}

/// `[{ "user_input", "completion", "score" }, ...]` used to fit reward models.
pub struct RewardDataset {
    samples: Vec<RewardSample>,
}

impl RewardDataset {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let records: Vec<RewardRecord> = read_json(path)?;
        let samples = records
            .into_iter()
            .map(|r| RewardSample {
                text: r.user_input + &r.completion,
                score: r.score.unwrap_or(DEFAULT_SCORE),
            })
            .collect::<Vec<_>>();
        tracing::info!(path = %path.display(), samples = samples.len(), "Loaded reward dataset");
        Ok(Self { samples })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&RewardSample> {
        self.samples.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RewardSample> {
        self.samples.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn json_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_sampling_is_deterministic_per_seed() {
        let prompts = vec!["Hello".to_string(), "World".to_string()];
        let mut a = ExamplesSampler::from_prompts(prompts.clone(), 7).unwrap();
        let mut b = ExamplesSampler::from_prompts(prompts, 7).unwrap();

        for _ in 0..5 {
            let sa = a.sample(2).unwrap();
            assert_eq!(sa, b.sample(2).unwrap());
            let mut sorted = sa.clone();
            sorted.sort();
            assert_eq!(sorted, vec!["Hello", "World"]);
        }
    }

    #[test]
    fn test_sample_more_than_pool_fails() {
        let mut sampler = ExamplesSampler::from_prompts(vec!["only".to_string()], 0).unwrap();
        assert!(matches!(sampler.sample(2), Err(RlhfError::Dataset(_))));
    }

    #[test]
    fn test_load_prompts() {
        let file = json_file(r#"[{"user_input": "Hi"}, {"user_input": "How are you?"}]"#);
        let sampler = ExamplesSampler::from_path(file.path(), 1).unwrap();
        assert_eq!(sampler.len(), 2);
    }

    #[test]
    fn test_empty_or_malformed_prompts_rejected() {
        assert!(ExamplesSampler::from_path(json_file("[]").path(), 0).is_err());
        assert!(ExamplesSampler::from_path(json_file("{").path(), 0).is_err());
    }

    #[test]
    fn test_reward_dataset_defaults_missing_scores() {
        let file = json_file(
            r#"[
                {"user_input": "Q: ", "completion": "A", "score": 4.0},
                {"user_input": "Q: ", "completion": "B", "score": null},
                {"user_input": "Q: ", "completion": "C"}
            ]"#,
        );
        let dataset = RewardDataset::from_path(file.path()).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(
            dataset.get(0),
            Some(&RewardSample {
                text: "Q: A".to_string(),
                score: 4.0
            })
        );
        assert_eq!(dataset.get(1).unwrap().score, DEFAULT_SCORE);
        assert_eq!(dataset.get(2).unwrap().score, DEFAULT_SCORE);
    }
}
