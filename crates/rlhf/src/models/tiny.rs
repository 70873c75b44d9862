//! Small self-contained networks.
//!
//! These let the trainer, CLI and tests run end to end without pretrained
//! weights. Context is a masked running mean of token embeddings, which keeps
//! every position causal without attention.

use super::{Backbone, CausalLm, GenerationParams};
use crate::Result;
use tch::{nn, nn::Module, Device, Kind, Tensor};

/// Low-rank adapter added on top of a frozen projection.
struct Lora {
    a: Tensor,
    b: Tensor,
}

impl Lora {
    fn new(path: &nn::Path, hidden: i64, rank: i64) -> Self {
        Self {
            a: path.randn("lora_a", &[hidden, rank], 0.0, 0.01),
            b: path.zeros("lora_b", &[rank, hidden]),
        }
    }

    fn forward(&self, x: &Tensor) -> Tensor {
        x.matmul(&self.a).matmul(&self.b)
    }
}

/// Embedding + causal running mean + tanh projection shared by both models.
struct Encoder {
    embed: nn::Embedding,
    proj: nn::Linear,
}

impl Encoder {
    fn new(path: &nn::Path, vocab_size: i64, hidden: i64) -> Self {
        Self {
            embed: nn::embedding(path / "embed", vocab_size, hidden, Default::default()),
            proj: nn::linear(path / "proj", hidden, hidden, Default::default()),
        }
    }

    /// Returns `(context, projected)`, both [B, L, H].
    fn forward(&self, tokens: &Tensor, mask: &Tensor) -> (Tensor, Tensor) {
        let m = mask.to_kind(Kind::Float).unsqueeze(-1);
        let x = self.embed.forward(tokens) * &m;
        let count = m.cumsum(1, Kind::Float).clamp_min(1.0);
        let context = x.cumsum(1, Kind::Float) / count;
        let projected = self.proj.forward(&context).tanh();
        (context, projected)
    }
}

/// Build the adapter after freezing everything created so far.
fn attach_lora(vs: &mut nn::VarStore, hidden: i64, rank: Option<i64>) -> Option<Lora> {
    let rank = rank?;
    vs.freeze();
    Some(Lora::new(&(vs.root() / "lora"), hidden, rank))
}

/// Tiny causal language model.
pub struct TinyCausalLm {
    vs: nn::VarStore,
    encoder: Encoder,
    lm_head: nn::Linear,
    lora: Option<Lora>,
}

impl TinyCausalLm {
    /// `lora_rank` freezes the base weights and trains a rank-r adapter.
    pub fn new(vocab_size: i64, hidden: i64, lora_rank: Option<i64>, device: Device) -> Self {
        let mut vs = nn::VarStore::new(device);
        let root = vs.root();
        let encoder = Encoder::new(&root, vocab_size, hidden);
        let lm_head = nn::linear(&root / "lm_head", hidden, vocab_size, Default::default());
        let lora = attach_lora(&mut vs, hidden, lora_rank);
        Self {
            vs,
            encoder,
            lm_head,
            lora,
        }
    }
}

impl CausalLm for TinyCausalLm {
    fn forward(&self, tokens: &Tensor, mask: &Tensor, _train: bool) -> Tensor {
        let (context, mut hidden) = self.encoder.forward(tokens, mask);
        if let Some(lora) = &self.lora {
            hidden = hidden + lora.forward(&context);
        }
        self.lm_head.forward(&hidden)
    }

    fn generate(&self, tokens: &Tensor, mask: &Tensor, params: &GenerationParams) -> Result<(Tensor, Tensor)> {
        tch::no_grad(|| {
            let batch = tokens.size()[0];
            let device = tokens.device();
            let mut sequences = tokens.shallow_clone();
            let mut seq_mask = mask.shallow_clone();
            let mut finished = Tensor::zeros([batch], (Kind::Bool, device));
            let mut actions = Vec::with_capacity(params.max_new_tokens);

            for _ in 0..params.max_new_tokens {
                let logits = self.forward(&sequences, &seq_mask, false);
                let last = logits.select(1, sequences.size()[1] - 1);
                let next = if params.temperature > 0.0 {
                    (last / params.temperature)
                        .softmax(-1, Kind::Float)
                        .multinomial(1, true)
                        .squeeze_dim(-1)
                } else {
                    last.argmax(-1, false)
                };
                let next = next.masked_fill(&finished, params.pad_token_id);
                finished = finished.logical_or(&next.eq(params.eos_token_id));

                let column = next.unsqueeze(1);
                seq_mask = Tensor::cat(&[&seq_mask, &column.ne(params.pad_token_id).to_kind(Kind::Int64)], 1);
                sequences = Tensor::cat(&[&sequences, &column], 1);
                actions.push(column);

                if finished.all().int64_value(&[]) != 0 {
                    break;
                }
            }

            Ok((Tensor::cat(&actions, 1), sequences))
        })
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }
}

/// Tiny backbone for critic and reward models.
pub struct TinyBackbone {
    vs: nn::VarStore,
    encoder: Encoder,
    hidden: i64,
    lora: Option<Lora>,
}

impl TinyBackbone {
    pub fn new(vocab_size: i64, hidden: i64, lora_rank: Option<i64>, device: Device) -> Self {
        let mut vs = nn::VarStore::new(device);
        let encoder = Encoder::new(&vs.root(), vocab_size, hidden);
        let lora = attach_lora(&mut vs, hidden, lora_rank);
        Self {
            vs,
            encoder,
            hidden,
            lora,
        }
    }
}

impl Backbone for TinyBackbone {
    fn forward(&self, tokens: &Tensor, mask: &Tensor, _train: bool) -> Tensor {
        let (context, hidden) = self.encoder.forward(tokens, mask);
        match &self.lora {
            Some(lora) => hidden + lora.forward(&context),
            None => hidden,
        }
    }

    fn hidden_size(&self) -> i64 {
        self.hidden
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }
}
