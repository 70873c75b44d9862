//! Tokenizer contract and cross-tokenizer transcoding.
//!
//! Tokenizers are external collaborators; the trainer only needs a text <->
//! token-id codec with known pad and eos markers. `HfTokenizer` wraps a
//! HuggingFace `tokenizer.json`; `ByteTokenizer` is a small byte-level codec
//! for tiny local models and tests.

mod byte;
mod hf;

pub use byte::ByteTokenizer;
pub use hf::HfTokenizer;

use crate::{Result, RlhfError};
use tch::{Device, Kind, Tensor};

/// A padded batch of token ids.
#[derive(Debug)]
pub struct Encoding {
    /// Token ids [B, L] (Int64), left padded
    pub input_ids: Tensor,
    /// Attention mask [B, L] (Int64), 0 on padding
    pub attention_mask: Tensor,
}

impl Encoding {
    /// Move both tensors to `device`.
    pub fn to_device(&self, device: Device) -> Self {
        Self {
            input_ids: self.input_ids.to_device(device),
            attention_mask: self.attention_mask.to_device(device),
        }
    }

    /// Sequence length (second dimension).
    pub fn seq_len(&self) -> i64 {
        self.input_ids.size()[1]
    }
}

/// Text <-> token-id codec.
pub trait Tokenizer: Send + Sync {
    /// Encode a single text without special tokens.
    fn encode(&self, text: &str) -> Result<Vec<i64>>;

    /// Decode ids, rendering pad/eos markers verbatim.
    fn decode(&self, ids: &[i64]) -> Result<String>;

    fn pad_token(&self) -> &str;
    fn pad_token_id(&self) -> i64;
    fn eos_token(&self) -> &str;
    fn eos_token_id(&self) -> i64;
    fn vocab_size(&self) -> i64;

    /// Longest sequence produced by `encode_batch`.
    fn model_max_length(&self) -> usize;

    /// Encode a batch with truncation to `model_max_length` and left padding
    /// to the longest row.
    fn encode_batch(&self, texts: &[String]) -> Result<Encoding> {
        if texts.is_empty() {
            return Err(RlhfError::Tokenizer("cannot encode an empty batch".into()));
        }

        let max_len = self.model_max_length();
        let rows = texts
            .iter()
            .map(|t| {
                let mut ids = self.encode(t)?;
                ids.truncate(max_len);
                Ok(ids)
            })
            .collect::<Result<Vec<_>>>()?;

        let width = rows.iter().map(Vec::len).max().unwrap_or(0).max(1);
        let mut ids = Vec::with_capacity(rows.len() * width);
        let mut mask = Vec::with_capacity(rows.len() * width);
        for row in &rows {
            let pad = width - row.len();
            ids.extend(std::iter::repeat(self.pad_token_id()).take(pad));
            ids.extend_from_slice(row);
            mask.extend(std::iter::repeat(0i64).take(pad));
            mask.extend(std::iter::repeat(1i64).take(row.len()));
        }

        let shape = [rows.len() as i64, width as i64];
        Ok(Encoding {
            input_ids: Tensor::from_slice(&ids).reshape(shape),
            attention_mask: Tensor::from_slice(&mask).reshape(shape),
        })
    }
}

/// Remove pad markers, then eos markers, from decoded text.
///
/// The order matters when one marker contains the other, so every caller
/// goes through this function.
pub fn strip_special(text: &str, tokenizer: &dyn Tokenizer) -> String {
    text.replace(tokenizer.pad_token(), "")
        .replace(tokenizer.eos_token(), "")
}

/// Decode every row of `tokens` and strip special markers.
pub fn decode_rows(tokens: &Tensor, tokenizer: &dyn Tokenizer) -> Result<Vec<String>> {
    let tokens = tokens.to_device(Device::Cpu).to_kind(Kind::Int64);
    let rows = tokens.size()[0];
    (0..rows)
        .map(|i| {
            let ids = Vec::<i64>::try_from(&tokens.get(i))?;
            Ok(strip_special(&tokenizer.decode(&ids)?, tokenizer))
        })
        .collect()
}

/// Re-encode a token batch produced by `from` under the vocabulary of `to`.
///
/// Each row is decoded, stripped of pad then eos markers, and the resulting
/// texts are encoded together with `to` (left padded, truncated).
pub fn transcode(tokens: &Tensor, from: &dyn Tokenizer, to: &dyn Tokenizer) -> Result<Encoding> {
    let device = tokens.device();
    let texts = decode_rows(tokens, from)?;
    Ok(to.encode_batch(&texts)?.to_device(device))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    /// Word-level `tokenizer.json` over a handful of words. `with_pad` adds a
    /// `<pad>` special token; without it the tokenizer pads with `</s>`.
    pub(crate) fn word_level_file(dir: &Path, with_pad: bool) -> PathBuf {
        let mut specials = vec!["</s>", "<unk>"];
        if with_pad {
            specials.insert(0, "<pad>");
        }
        let words = ["hi", "hello", "world", "how", "are", "you"];

        let vocab: serde_json::Map<String, serde_json::Value> = specials
            .iter()
            .chain(words.iter())
            .enumerate()
            .map(|(id, token)| (token.to_string(), serde_json::json!(id)))
            .collect();
        let added: Vec<serde_json::Value> = specials
            .iter()
            .enumerate()
            .map(|(id, token)| {
                serde_json::json!({
                    "id": id,
                    "content": token,
                    "single_word": false,
                    "lstrip": false,
                    "rstrip": false,
                    "normalized": false,
                    "special": true
                })
            })
            .collect();

        let json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": added,
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" }
        });

        let path = dir.join("tokenizer.json");
        std::fs::write(&path, json.to_string()).unwrap();
        path
    }

    fn ids(t: &Tensor) -> Vec<i64> {
        Vec::<i64>::try_from(&t.flatten(0, -1)).unwrap()
    }

    #[test]
    fn test_byte_roundtrip_with_markers() {
        let tok = ByteTokenizer::default();
        let mut encoded = tok.encode("hi").unwrap();
        encoded.push(ByteTokenizer::EOS_ID);
        encoded.push(ByteTokenizer::PAD_ID);
        assert_eq!(tok.decode(&encoded).unwrap(), "hi</s><pad>");
    }

    #[test]
    fn test_encode_batch_left_pads() {
        let tok = ByteTokenizer::default();
        let enc = tok
            .encode_batch(&["a".to_string(), "abc".to_string()])
            .unwrap();

        assert_eq!(enc.input_ids.size(), [2, 3]);
        assert_eq!(
            ids(&enc.input_ids),
            vec![256, 256, 97, 97, 98, 99]
        );
        assert_eq!(ids(&enc.attention_mask), vec![0, 0, 1, 1, 1, 1]);
    }

    #[test]
    fn test_encode_batch_truncates() {
        let tok = ByteTokenizer::new(2);
        let enc = tok.encode_batch(&["abcdef".to_string()]).unwrap();
        assert_eq!(ids(&enc.input_ids), vec![97, 98]);
    }

    #[test]
    fn test_empty_batch_is_rejected() {
        let tok = ByteTokenizer::default();
        assert!(tok.encode_batch(&[]).is_err());
    }

    #[test]
    fn test_strip_removes_pad_before_eos() {
        // The eos marker is spelled so that it only appears once the pad
        // marker embedded in it has been removed.
        let tok = ByteTokenizer::with_markers("<p>", "<e>", 64);
        assert_eq!(strip_special("x<e<p>>y<p>", &tok), "xy");
    }

    #[test]
    fn test_transcode_strips_and_reencodes() {
        let from = ByteTokenizer::default();
        let to = ByteTokenizer::with_markers("[PAD]", "[EOS]", 64);

        let tokens = Tensor::from_slice(&[256i64, 104, 105, 257, 104, 105, 33, 257])
            .reshape([2, 4]);
        let enc = transcode(&tokens, &from, &to).unwrap();

        // "hi" and "hi!" re-encoded and left padded to width 3
        assert_eq!(enc.input_ids.size(), [2, 3]);
        assert_eq!(ids(&enc.input_ids), vec![256, 104, 105, 104, 105, 33]);
        assert_eq!(ids(&enc.attention_mask), vec![0, 1, 1, 1, 1, 1]);
    }

    #[test]
    fn test_transcode_into_word_level_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        let from = ByteTokenizer::default();
        let to = HfTokenizer::from_file(word_level_file(dir.path(), true), 16).unwrap();

        let mut row = vec![ByteTokenizer::PAD_ID];
        row.extend(from.encode("hello world").unwrap());
        row.push(ByteTokenizer::EOS_ID);
        let tokens = Tensor::from_slice(&row).reshape([1, row.len() as i64]);

        let enc = transcode(&tokens, &from, &to).unwrap();
        assert_eq!(ids(&enc.input_ids), vec![4, 5]);
        assert_eq!(ids(&enc.attention_mask), vec![1, 1]);
    }
}
