use super::Tokenizer;
use crate::{Result, RlhfError};
use std::path::Path;

const EOS_CANDIDATES: [&str; 6] = [
    "</s>",
    "<|endoftext|>",
    "<|end_of_text|>",
    "<|im_end|>",
    "<|eot_id|>",
    "<eos>",
];
const PAD_CANDIDATES: [&str; 4] = ["<pad>", "<|pad|>", "[PAD]", "<|padding|>"];

fn tokenizer_error<E: std::fmt::Display>(context: &'static str) -> impl FnOnce(E) -> RlhfError {
    move |e| RlhfError::Tokenizer(format!("{context}: {e}"))
}

/// HuggingFace tokenizer loaded from a `tokenizer.json` file.
///
/// Pad and eos come from the tokenizer's special tokens. A tokenizer without
/// a pad token (GPT-2 and friends) pads with its eos token.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    pad_token: String,
    pad_token_id: u32,
    eos_token: String,
    eos_token_id: u32,
    model_max_length: usize,
}

impl HfTokenizer {
    pub fn from_file(path: impl AsRef<Path>, model_max_length: usize) -> Result<Self> {
        let path = path.as_ref();
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| RlhfError::Tokenizer(format!("cannot load {}: {e}", path.display())))?;

        let find = |candidates: &[&str]| {
            candidates
                .iter()
                .find_map(|c| inner.token_to_id(c).map(|id| (c.to_string(), id)))
        };

        let (eos_token, eos_token_id) = find(&EOS_CANDIDATES).ok_or_else(|| {
            RlhfError::Tokenizer(format!("{} has no end-of-sequence token", path.display()))
        })?;
        let (pad_token, pad_token_id) = inner
            .get_padding()
            .and_then(|p| inner.token_to_id(&p.pad_token).map(|id| (p.pad_token.clone(), id)))
            .or_else(|| find(&PAD_CANDIDATES))
            .unwrap_or_else(|| (eos_token.clone(), eos_token_id));

        tracing::info!(
            path = %path.display(),
            vocab = inner.get_vocab_size(false),
            pad = %pad_token,
            eos = %eos_token,
            "Loaded tokenizer"
        );

        Ok(Self {
            inner,
            pad_token,
            pad_token_id,
            eos_token,
            eos_token_id,
            model_max_length,
        })
    }

    /// Use explicit pad and eos tokens, which must be in the vocabulary.
    pub fn with_special_tokens(mut self, pad_token: &str, eos_token: &str) -> Result<Self> {
        let lookup = |token: &str| {
            self.inner
                .token_to_id(token)
                .ok_or_else(|| RlhfError::Tokenizer(format!("'{token}' is not in the vocabulary")))
        };
        let pad_token_id = lookup(pad_token)?;
        let eos_token_id = lookup(eos_token)?;
        self.pad_token = pad_token.to_string();
        self.pad_token_id = pad_token_id;
        self.eos_token = eos_token.to_string();
        self.eos_token_id = eos_token_id;
        Ok(self)
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<i64>> {
        let encoding = self.inner.encode(text, false).map_err(tokenizer_error("encoding failed"))?;
        Ok(encoding.get_ids().iter().map(|&id| i64::from(id)).collect())
    }

    fn decode(&self, ids: &[i64]) -> Result<String> {
        let ids = ids
            .iter()
            .map(|&id| u32::try_from(id).map_err(|_| RlhfError::Tokenizer(format!("invalid token id {id}"))))
            .collect::<Result<Vec<u32>>>()?;
        self.inner.decode(&ids, false).map_err(tokenizer_error("decoding failed"))
    }

    fn pad_token(&self) -> &str {
        &self.pad_token
    }

    fn pad_token_id(&self) -> i64 {
        i64::from(self.pad_token_id)
    }

    fn eos_token(&self) -> &str {
        &self.eos_token
    }

    fn eos_token_id(&self) -> i64 {
        i64::from(self.eos_token_id)
    }

    /// One past the largest id, added tokens included.
    fn vocab_size(&self) -> i64 {
        self.inner
            .get_vocab(true)
            .values()
            .max()
            .map_or(0, |&id| i64::from(id) + 1)
    }

    fn model_max_length(&self) -> usize {
        self.model_max_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::strip_special;
    use crate::tokenizer::tests::word_level_file;
    use tempfile::tempdir;

    #[test]
    fn test_special_tokens_from_vocabulary() {
        let dir = tempdir().unwrap();
        let tok = HfTokenizer::from_file(word_level_file(dir.path(), true), 32).unwrap();
        assert_eq!(tok.pad_token(), "<pad>");
        assert_eq!(tok.pad_token_id(), 0);
        assert_eq!(tok.eos_token(), "</s>");
        assert_eq!(tok.eos_token_id(), 1);
        assert_eq!(tok.vocab_size(), 9);
    }

    #[test]
    fn test_missing_pad_falls_back_to_eos() {
        let dir = tempdir().unwrap();
        let tok = HfTokenizer::from_file(word_level_file(dir.path(), false), 32).unwrap();
        assert_eq!(tok.pad_token(), "</s>");
        assert_eq!(tok.pad_token_id(), tok.eos_token_id());
    }

    #[test]
    fn test_encode_decode_keeps_markers() {
        let dir = tempdir().unwrap();
        let tok = HfTokenizer::from_file(word_level_file(dir.path(), true), 32).unwrap();

        let ids = tok.encode("hello world").unwrap();
        assert_eq!(ids, vec![4, 5]);

        let decoded = tok.decode(&[0, 4, 5, 1]).unwrap();
        assert!(decoded.contains("<pad>"));
        assert!(decoded.contains("</s>"));
        assert_eq!(strip_special(&decoded, &tok).trim(), "hello world");
    }

    #[test]
    fn test_batch_is_left_padded_with_pad_id() {
        let dir = tempdir().unwrap();
        let tok = HfTokenizer::from_file(word_level_file(dir.path(), true), 32).unwrap();
        let enc = tok
            .encode_batch(&["hi".to_string(), "how are you".to_string()])
            .unwrap();
        let ids = Vec::<i64>::try_from(&enc.input_ids.flatten(0, -1)).unwrap();
        assert_eq!(ids, vec![0, 0, 3, 6, 7, 8]);
    }

    #[test]
    fn test_explicit_special_tokens() {
        let dir = tempdir().unwrap();
        let tok = HfTokenizer::from_file(word_level_file(dir.path(), true), 32)
            .unwrap()
            .with_special_tokens("<unk>", "</s>")
            .unwrap();
        assert_eq!(tok.pad_token_id(), 2);
        assert!(HfTokenizer::from_file(word_level_file(dir.path(), true), 32)
            .unwrap()
            .with_special_tokens("[PAD]", "</s>")
            .is_err());
    }

    #[test]
    fn test_negative_ids_rejected() {
        let dir = tempdir().unwrap();
        let tok = HfTokenizer::from_file(word_level_file(dir.path(), true), 32).unwrap();
        assert!(matches!(tok.decode(&[-1]), Err(RlhfError::Tokenizer(_))));
    }

    #[test]
    fn test_missing_file_is_a_tokenizer_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent.json");
        assert!(matches!(HfTokenizer::from_file(missing, 32), Err(RlhfError::Tokenizer(_))));
    }
}
