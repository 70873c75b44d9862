use super::Tokenizer;
use crate::Result;

/// Byte-level tokenizer: ids 0..=255 are raw bytes, followed by pad and eos.
#[derive(Clone, Debug)]
pub struct ByteTokenizer {
    pad_token: String,
    eos_token: String,
    model_max_length: usize,
}

impl ByteTokenizer {
    pub const PAD_ID: i64 = 256;
    pub const EOS_ID: i64 = 257;

    pub fn new(model_max_length: usize) -> Self {
        Self::with_markers("<pad>", "</s>", model_max_length)
    }

    /// Byte tokenizer rendering its special ids with custom marker strings.
    pub fn with_markers(pad_token: &str, eos_token: &str, model_max_length: usize) -> Self {
        Self {
            pad_token: pad_token.to_string(),
            eos_token: eos_token.to_string(),
            model_max_length,
        }
    }
}

impl Default for ByteTokenizer {
    fn default() -> Self {
        Self::new(512)
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<i64>> {
        Ok(text.bytes().map(i64::from).collect())
    }

    fn decode(&self, ids: &[i64]) -> Result<String> {
        let mut bytes = Vec::with_capacity(ids.len());
        for &id in ids {
            match id {
                0..=255 => bytes.push(id as u8),
                Self::PAD_ID => bytes.extend_from_slice(self.pad_token.as_bytes()),
                Self::EOS_ID => bytes.extend_from_slice(self.eos_token.as_bytes()),
                _ => {}
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn pad_token(&self) -> &str {
        &self.pad_token
    }

    fn pad_token_id(&self) -> i64 {
        Self::PAD_ID
    }

    fn eos_token(&self) -> &str {
        &self.eos_token
    }

    fn eos_token_id(&self) -> i64 {
        Self::EOS_ID
    }

    fn vocab_size(&self) -> i64 {
        258
    }

    fn model_max_length(&self) -> usize {
        self.model_max_length
    }
}
