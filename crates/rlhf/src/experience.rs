//! Rollout experience: per-prompt records, the bounded buffer filled between
//! learning phases, and mini-batching for the PPO update.

use crate::{Result, RlhfError};
use std::collections::VecDeque;
use std::ops::Range;
use tch::{Device, Kind, Tensor};

/// Trajectory of one prompt from one generation call.
///
/// The trailing `action_len_*` positions of each sequence are the generated
/// tokens. Tensors are detached and live on the CPU.
#[derive(Debug)]
pub struct Memory {
    pub states_actor: Tensor,
    pub actions: Tensor,
    /// Critic values per generated position [action_len_critic]
    pub values: Tensor,
    /// Reward model scores per generated position [action_len_critic]
    pub rewards: Tensor,
    /// Log-probabilities of the sampled positions [action_len_actor]
    pub action_log_probs: Tensor,
    pub sequences_actor: Tensor,
    pub sequences_mask_actor: Tensor,
    pub sequences_critic: Tensor,
    pub sequences_mask_critic: Tensor,
    pub action_len_actor: i64,
    pub action_len_critic: i64,
}

impl Memory {
    /// Detach every tensor and move it to the CPU.
    pub fn into_cpu(self) -> Self {
        let cpu = |t: Tensor| t.detach().to_device(Device::Cpu);
        Self {
            states_actor: cpu(self.states_actor),
            actions: cpu(self.actions),
            values: cpu(self.values),
            rewards: cpu(self.rewards),
            action_log_probs: cpu(self.action_log_probs),
            sequences_actor: cpu(self.sequences_actor),
            sequences_mask_actor: cpu(self.sequences_mask_actor),
            sequences_critic: cpu(self.sequences_critic),
            sequences_mask_critic: cpu(self.sequences_mask_critic),
            ..self
        }
    }

    /// Reward of the last generated position.
    pub fn final_reward(&self) -> f64 {
        let n = self.rewards.size()[0];
        self.rewards.double_value(&[n - 1])
    }
}

/// Insertion-ordered experience collected between two learning phases.
pub struct ExperienceBuffer {
    memories: VecDeque<Memory>,
    capacity: usize,
}

impl ExperienceBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            memories: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, memory: Memory) -> Result<()> {
        if self.is_full() {
            return Err(RlhfError::Batch(format!(
                "experience buffer is full ({} records)",
                self.capacity
            )));
        }
        self.memories.push_back(memory);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.memories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.memories.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take every record, leaving the buffer empty.
    pub fn drain_all(&mut self) -> Vec<Memory> {
        self.memories.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Memory> {
        self.memories.iter()
    }

    /// Mean final-step reward, `None` when empty.
    pub fn mean_final_reward(&self) -> Option<f64> {
        mean_final_reward(self.memories.iter())
    }
}

pub(crate) fn mean_final_reward<'a>(memories: impl Iterator<Item = &'a Memory>) -> Option<f64> {
    let (sum, count) = memories.fold((0.0, 0usize), |(s, c), m| (s + m.final_reward(), c + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Random-access view over one learning phase's records.
pub struct ExperienceDataset {
    data: Vec<Memory>,
}

impl ExperienceDataset {
    pub fn new(data: Vec<Memory>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Memory> {
        self.data.get(index)
    }

    pub fn mean_final_reward(&self) -> Option<f64> {
        mean_final_reward(self.data.iter())
    }

    /// Sequential mini-batch index ranges. The length must be a multiple of
    /// `batch_size`.
    pub fn batch_ranges(&self, batch_size: usize) -> Result<Vec<Range<usize>>> {
        if batch_size == 0 || self.data.len() % batch_size != 0 {
            return Err(RlhfError::Batch(format!(
                "{} records do not split into batches of {}",
                self.data.len(),
                batch_size
            )));
        }
        Ok((0..self.data.len())
            .step_by(batch_size)
            .map(|start| start..start + batch_size)
            .collect())
    }

    /// Collate the records in `range` onto `device`.
    pub fn batch(&self, range: Range<usize>, pads: PadIds, device: Device) -> Result<MemoryBatch> {
        let records: Vec<&Memory> = self.data[range].iter().collect();
        Ok(MemoryBatch::collate(&records, pads)?.to_device(device))
    }

    /// Every mini-batch, in order.
    pub fn batches(&self, batch_size: usize, pads: PadIds, device: Device) -> Result<Vec<MemoryBatch>> {
        self.batch_ranges(batch_size)?
            .into_iter()
            .map(|range| self.batch(range, pads, device))
            .collect()
    }
}

/// Pad token ids used when collating actor and critic sequences.
#[derive(Clone, Copy, Debug)]
pub struct PadIds {
    pub actor: i64,
    pub critic: i64,
}

/// Stacked records ready for a joint actor-critic forward.
#[derive(Debug)]
pub struct MemoryBatch {
    pub actions: Tensor,
    pub values: Tensor,
    pub rewards: Tensor,
    pub action_log_probs: Tensor,
    pub sequences_actor: Tensor,
    pub sequences_mask_actor: Tensor,
    pub sequences_critic: Tensor,
    pub sequences_mask_critic: Tensor,
    pub action_len_actor: i64,
    pub action_len_critic: i64,
}

impl MemoryBatch {
    /// Stack records, left padding sequences to a common length.
    pub fn collate(records: &[&Memory], pads: PadIds) -> Result<Self> {
        let first = records
            .first()
            .ok_or_else(|| RlhfError::Batch("cannot collate an empty batch".into()))?;
        let (action_len_actor, action_len_critic) = (first.action_len_actor, first.action_len_critic);
        if records
            .iter()
            .any(|m| m.action_len_actor != action_len_actor || m.action_len_critic != action_len_critic)
        {
            return Err(RlhfError::Batch(
                "records in a batch must share action lengths".into(),
            ));
        }

        let stack = |f: fn(&Memory) -> &Tensor| {
            let rows: Vec<&Tensor> = records.iter().map(|m| f(m)).collect();
            Tensor::stack(&rows, 0)
        };

        Ok(Self {
            actions: stack(|m| &m.actions),
            values: stack(|m| &m.values),
            rewards: stack(|m| &m.rewards),
            action_log_probs: stack(|m| &m.action_log_probs),
            sequences_actor: left_pad(records.iter().map(|m| &m.sequences_actor), pads.actor),
            sequences_mask_actor: left_pad(records.iter().map(|m| &m.sequences_mask_actor), 0),
            sequences_critic: left_pad(records.iter().map(|m| &m.sequences_critic), pads.critic),
            sequences_mask_critic: left_pad(records.iter().map(|m| &m.sequences_mask_critic), 0),
            action_len_actor,
            action_len_critic,
        })
    }

    pub fn to_device(self, device: Device) -> Self {
        Self {
            actions: self.actions.to_device(device),
            values: self.values.to_device(device),
            rewards: self.rewards.to_device(device),
            action_log_probs: self.action_log_probs.to_device(device),
            sequences_actor: self.sequences_actor.to_device(device),
            sequences_mask_actor: self.sequences_mask_actor.to_device(device),
            sequences_critic: self.sequences_critic.to_device(device),
            sequences_mask_critic: self.sequences_mask_critic.to_device(device),
            ..self
        }
    }

    pub fn size(&self) -> i64 {
        self.actions.size()[0]
    }
}

/// Stack 1-D rows into [N, max_len], left padding shorter rows with `value`.
fn left_pad<'a>(rows: impl Iterator<Item = &'a Tensor>, value: i64) -> Tensor {
    let rows: Vec<&Tensor> = rows.collect();
    let width = rows.iter().map(|t| t.size()[0]).max().unwrap_or(0);
    let padded: Vec<Tensor> = rows
        .iter()
        .map(|t| {
            let missing = width - t.size()[0];
            if missing == 0 {
                t.shallow_clone()
            } else {
                let pad = Tensor::full([missing], value, (t.kind(), t.device()));
                Tensor::cat(&[&pad, *t], 0)
            }
        })
        .collect();
    Tensor::stack(&padded, 0).to_kind(Kind::Int64)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Record with sequence length `seq_len`, tagged by `id` in its values.
    pub(crate) fn memory(id: i64, seq_len: i64, action_len: i64) -> Memory {
        let seq = Tensor::arange(seq_len, (Kind::Int64, Device::Cpu));
        Memory {
            states_actor: seq.narrow(0, 0, seq_len - action_len),
            actions: seq.narrow(0, seq_len - action_len, action_len),
            values: Tensor::full([action_len], id as f64, (Kind::Float, Device::Cpu)),
            rewards: Tensor::arange(action_len, (Kind::Float, Device::Cpu)) + id as f64,
            action_log_probs: Tensor::zeros([action_len], (Kind::Float, Device::Cpu)),
            sequences_actor: seq.shallow_clone(),
            sequences_mask_actor: seq.ones_like(),
            sequences_critic: seq.shallow_clone(),
            sequences_mask_critic: seq.ones_like(),
            action_len_actor: action_len,
            action_len_critic: action_len,
        }
    }

    const PADS: PadIds = PadIds { actor: 99, critic: 98 };

    #[test]
    fn test_buffer_rejects_overflow_and_drains() {
        let mut buffer = ExperienceBuffer::new(2);
        buffer.push(memory(0, 4, 2)).unwrap();
        buffer.push(memory(1, 4, 2)).unwrap();
        assert!(buffer.is_full());
        assert!(buffer.push(memory(2, 4, 2)).is_err());

        let drained = buffer.drain_all();
        assert_eq!(drained.len(), 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_mean_final_reward() {
        let mut buffer = ExperienceBuffer::new(4);
        assert_eq!(buffer.mean_final_reward(), None);
        // final rewards: 0 + 2 = 2 and 2 + 2 = 4
        buffer.push(memory(0, 5, 3)).unwrap();
        buffer.push(memory(2, 5, 3)).unwrap();
        assert_eq!(buffer.mean_final_reward(), Some(3.0));
    }

    #[test]
    fn test_batches_cover_every_record_once() {
        let k = 3;
        let b = 4;
        let dataset = ExperienceDataset::new((0..k * b).map(|i| memory(i as i64, 5, 2)).collect());

        let batches = dataset.batches(b, PADS, Device::Cpu).unwrap();
        assert_eq!(batches.len(), k);

        let mut seen: Vec<i64> = batches
            .iter()
            .flat_map(|batch| Vec::<f64>::try_from(&batch.values.select(1, 0)).unwrap())
            .map(|v| v as i64)
            .collect();
        seen.sort();
        assert_eq!(seen, (0..(k * b) as i64).collect::<Vec<_>>());
    }

    #[test]
    fn test_uneven_dataset_rejected() {
        let dataset = ExperienceDataset::new((0..5).map(|i| memory(i, 4, 2)).collect());
        assert!(matches!(dataset.batch_ranges(2), Err(RlhfError::Batch(_))));
    }

    #[test]
    fn test_collate_left_pads_sequences() {
        let short = memory(0, 3, 2);
        let long = memory(1, 5, 2);
        let batch = MemoryBatch::collate(&[&short, &long], PADS).unwrap();

        assert_eq!(batch.sequences_actor.size(), [2, 5]);
        let first: Vec<i64> = Vec::try_from(&batch.sequences_actor.get(0)).unwrap();
        assert_eq!(first, vec![99, 99, 0, 1, 2]);
        let mask: Vec<i64> = Vec::try_from(&batch.sequences_mask_critic.get(0)).unwrap();
        assert_eq!(mask, vec![0, 0, 1, 1, 1]);
        let critic: Vec<i64> = Vec::try_from(&batch.sequences_critic.get(0)).unwrap();
        assert_eq!(critic[0], 98);
    }

    #[test]
    fn test_collate_requires_matching_action_lengths() {
        let a = memory(0, 5, 2);
        let b = memory(1, 5, 3);
        assert!(MemoryBatch::collate(&[&a, &b], PADS).is_err());
    }
}
