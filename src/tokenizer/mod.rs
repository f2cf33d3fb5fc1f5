// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tokenizer abstraction and left-padded batch encoding.
//!
//! [`TextTokenizer`] is the encode/decode contract the generation loop
//! needs. [`HfTokenizer`] implements it on top of the `HuggingFace`
//! `tokenizers` crate; tests and other hosts can plug in their own.

use crate::error::{Result, SteerError};

/// Token strings tried, in order, when the tokenizer has no explicit
/// end-of-sequence id.
const EOS_CANDIDATES: &[&str] = &["</s>", "<|endoftext|>", "<|im_end|>", "<|eot_id|>", "<eos>"];

/// Token strings tried for the beginning-of-sequence id.
const BOS_CANDIDATES: &[&str] = &["<s>", "<|begin_of_text|>", "<bos>"];

/// Token strings tried for the padding id.
const PAD_CANDIDATES: &[&str] = &["<pad>", "<|pad|>", "[PAD]"];

// ---------------------------------------------------------------------------
// TextTokenizer
// ---------------------------------------------------------------------------

/// Encode/decode contract used by generation.
pub trait TextTokenizer: Send + Sync {
    /// Encode `text`.
    ///
    /// `add_bos` adds the tokenizer's special prefix tokens.
    /// `encode_special_tokens` recognises special-token strings inside
    /// `text` as their special ids; otherwise they are encoded as plain text.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Tokenizer`] if encoding fails.
    fn encode(&self, text: &str, add_bos: bool, encode_special_tokens: bool) -> Result<Vec<u32>>;

    /// Decode ids back to text, keeping special tokens out of the output.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Tokenizer`] if decoding fails.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// End-of-sequence id, if known.
    fn eos_token_id(&self) -> Option<u32>;

    /// Padding id, if known.
    fn pad_token_id(&self) -> Option<u32> {
        None
    }
}

// ---------------------------------------------------------------------------
// HfTokenizer
// ---------------------------------------------------------------------------

/// `HuggingFace` tokenizer.
///
/// # Example
///
/// ```no_run
/// use candle_steer::{HfTokenizer, TextTokenizer};
///
/// # fn main() -> candle_steer::Result<()> {
/// let tok = HfTokenizer::from_file("tokenizer.json")?;
/// let ids = tok.encode("Hello", true, true)?;
/// let text = tok.decode(&ids)?;
/// assert!(text.contains("Hello"));
/// # Ok(())
/// # }
/// ```
pub struct HfTokenizer {
    /// Tokenizer recognising special-token strings.
    special: tokenizers::Tokenizer,
    /// Clone that splits special-token strings as plain text.
    literal: tokenizers::Tokenizer,
    /// End-of-sequence id.
    eos: Option<u32>,
    /// Beginning-of-sequence id.
    bos: Option<u32>,
    /// Padding id.
    pad: Option<u32>,
}

impl HfTokenizer {
    /// Load a `tokenizer.json` file.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Tokenizer`] if the file cannot be loaded or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let tok = tokenizers::Tokenizer::from_file(path.as_ref()).map_err(|e| {
            SteerError::Tokenizer(format!(
                "failed to load tokenizer from {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self::new(tok))
    }

    /// Wrap an already-loaded tokenizer, discovering its special ids.
    #[must_use]
    pub fn new(tokenizer: tokenizers::Tokenizer) -> Self {
        let lookup = |candidates: &[&str]| {
            candidates
                .iter()
                .find_map(|token| tokenizer.token_to_id(token))
        };
        let eos = lookup(EOS_CANDIDATES);
        let bos = lookup(BOS_CANDIDATES);
        let pad = tokenizer
            .get_padding()
            .map(|p| p.pad_id)
            .or_else(|| lookup(PAD_CANDIDATES));
        let mut literal = tokenizer.clone();
        literal.set_encode_special_tokens(true);
        Self {
            special: tokenizer,
            literal,
            eos,
            bos,
            pad,
        }
    }

    /// Override the end-of-sequence id (e.g. from `config.json`).
    #[must_use]
    pub const fn with_eos(mut self, eos: u32) -> Self {
        self.eos = Some(eos);
        self
    }

    /// Override the padding id.
    #[must_use]
    pub const fn with_pad(mut self, pad: u32) -> Self {
        self.pad = Some(pad);
        self
    }

    /// Beginning-of-sequence id, if known.
    #[must_use]
    pub const fn bos_token_id(&self) -> Option<u32> {
        self.bos
    }

    /// Vocabulary size including added tokens.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.special.get_vocab_size(true)
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str, add_bos: bool, encode_special_tokens: bool) -> Result<Vec<u32>> {
        let tok = if encode_special_tokens {
            &self.special
        } else {
            &self.literal
        };
        let encoding = tok
            .encode(text, add_bos)
            .map_err(|e| SteerError::Tokenizer(format!("encode failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.special
            .decode(ids, true)
            .map_err(|e| SteerError::Tokenizer(format!("decode failed: {e}")))
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.pad
    }
}

impl std::fmt::Debug for HfTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfTokenizer")
            .field("eos", &self.eos)
            .field("bos", &self.bos)
            .field("pad", &self.pad)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Batch encoding
// ---------------------------------------------------------------------------

/// A batch of prompts encoded to a common width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBatch {
    /// Row-major ids, `rows * width` long.
    ids: Vec<u32>,
    /// Number of rows.
    rows: usize,
    /// Common width after padding and truncation.
    width: usize,
    /// Left-padding length of each row.
    padding: Vec<usize>,
}

impl EncodedBatch {
    /// Row-major ids.
    #[must_use]
    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    /// Number of rows.
    #[must_use]
    pub const fn rows(&self) -> usize {
        self.rows
    }

    /// Common width.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Left-padding length of each row.
    #[must_use]
    pub fn padding(&self) -> &[usize] {
        &self.padding
    }

    /// Ids of one row, padding included.
    #[must_use]
    pub fn row(&self, index: usize) -> Option<&[u32]> {
        let start = index.checked_mul(self.width)?;
        self.ids.get(start..start + self.width)
    }
}

/// Encode every prompt, left-pad to the longest row with `pad_id`, then
/// drop leading columns until the width is at most `max_len`.
///
/// # Errors
///
/// Returns [`SteerError::Tokenizer`] if encoding fails or a prompt encodes
/// to nothing.
pub fn encode_batch(
    tokenizer: &dyn TextTokenizer,
    prompts: &[String],
    add_bos: bool,
    encode_special_tokens: bool,
    pad_id: u32,
    max_len: usize,
) -> Result<EncodedBatch> {
    let encoded = prompts
        .iter()
        .map(|p| tokenizer.encode(p, add_bos, encode_special_tokens))
        .collect::<Result<Vec<_>>>()?;
    if encoded.iter().any(Vec::is_empty) {
        return Err(SteerError::Tokenizer("prompt encoded to zero tokens".into()));
    }

    let longest = encoded.iter().map(Vec::len).max().unwrap_or(0);
    let width = longest.min(max_len.max(1));
    let dropped = longest - width;

    let mut ids = Vec::with_capacity(encoded.len() * width);
    let mut padding = Vec::with_capacity(encoded.len());
    for row in &encoded {
        let pad = longest - row.len();
        let mut full = vec![pad_id; pad];
        full.extend_from_slice(row);
        ids.extend(full.into_iter().skip(dropped));
        padding.push(pad.saturating_sub(dropped));
    }

    if dropped > 0 {
        tracing::debug!(dropped, width, "prompt batch truncated from the left");
    }

    Ok(EncodedBatch {
        ids,
        rows: encoded.len(),
        width,
        padding,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    /// One id per byte.
    struct Bytes;

    impl TextTokenizer for Bytes {
        fn encode(&self, text: &str, add_bos: bool, _special: bool) -> Result<Vec<u32>> {
            let mut ids: Vec<u32> = Vec::new();
            if add_bos {
                ids.push(1);
            }
            ids.extend(text.bytes().map(u32::from));
            Ok(ids)
        }

        fn decode(&self, ids: &[u32]) -> Result<String> {
            let bytes: Vec<u8> = ids.iter().filter_map(|&i| u8::try_from(i).ok()).collect();
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }

        fn eos_token_id(&self) -> Option<u32> {
            Some(2)
        }
    }

    #[test]
    fn rows_are_left_padded() {
        let prompts = vec!["ab".to_owned(), "abcd".to_owned()];
        let batch = encode_batch(&Bytes, &prompts, false, true, 0, 100).unwrap();
        assert_eq!(batch.width(), 4);
        assert_eq!(batch.padding(), &[2, 0]);
        assert_eq!(batch.row(0).unwrap(), &[0, 0, 97, 98]);
        assert_eq!(batch.row(1).unwrap(), &[97, 98, 99, 100]);
    }

    #[test]
    fn truncation_drops_leading_columns() {
        let prompts = vec!["ab".to_owned(), "abcde".to_owned()];
        let batch = encode_batch(&Bytes, &prompts, false, true, 0, 3).unwrap();
        assert_eq!(batch.width(), 3);
        assert_eq!(batch.padding(), &[1, 0]);
        assert_eq!(batch.row(0).unwrap(), &[0, 97, 98]);
        assert_eq!(batch.row(1).unwrap(), &[99, 100, 101]);
    }

    #[test]
    fn bos_is_added_per_row() {
        let prompts = vec!["a".to_owned()];
        let batch = encode_batch(&Bytes, &prompts, true, true, 0, 8).unwrap();
        assert_eq!(batch.row(0).unwrap(), &[1, 97]);
    }

    #[test]
    fn empty_prompt_rejected() {
        let prompts = vec![String::new()];
        assert!(encode_batch(&Bytes, &prompts, false, true, 0, 8).is_err());
    }
}
