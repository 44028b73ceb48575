//! Tokenizer contract for the ML runtime.
//!
//! Two implementations: `HfTokenizer` loads a HuggingFace `tokenizer.json`
//! from the model directory (feature `ml`), and `WhitespaceEncoder` is the
//! deterministic fallback used by mock and stub sessions.

use crate::error::{Error, Result};

/// Padding token id used for right-padding batches.
pub const PAD_ID: i64 = 0;
const DEFAULT_CLS_ID: i64 = 101;
const DEFAULT_SEP_ID: i64 = 102;

/// A single encoded text.
#[derive(Debug, Clone)]
pub struct Encoding {
    pub ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
    pub tokens: Vec<String>,
}

/// A right-padded batch: `input_ids` and `attention_mask` are row-major
/// `batch × seq_len`.
#[derive(Debug, Clone)]
pub struct PaddedBatch {
    pub input_ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
    pub batch: usize,
    pub seq_len: usize,
}

pub trait TextEncoder: Send + Sync {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Encoding>;

    /// Maximum sequence length this encoder truncates to.
    fn max_length(&self) -> usize;

    fn cls_id(&self) -> i64 {
        DEFAULT_CLS_ID
    }

    fn sep_id(&self) -> i64 {
        DEFAULT_SEP_ID
    }

    /// Encode a batch with right padding. `seq_len` is the smaller of the
    /// longest row and the configured maximum; shorter rows pad with
    /// `PAD_ID` and mask 0.
    fn encode_padded(&self, texts: &[&str], add_special_tokens: bool) -> Result<PaddedBatch> {
        let encodings: Vec<Encoding> = texts
            .iter()
            .map(|t| self.encode(t, add_special_tokens))
            .collect::<Result<_>>()?;

        let longest = encodings.iter().map(|e| e.ids.len()).max().unwrap_or(0);
        let seq_len = longest.min(self.max_length()).max(1);

        let batch = encodings.len();
        let mut input_ids = Vec::with_capacity(batch * seq_len);
        let mut attention_mask = Vec::with_capacity(batch * seq_len);
        for enc in &encodings {
            let row_len = enc.ids.len().min(seq_len);
            input_ids.extend_from_slice(&enc.ids[..row_len]);
            attention_mask.extend_from_slice(&enc.attention_mask[..row_len]);
            input_ids.extend(std::iter::repeat(PAD_ID).take(seq_len - row_len));
            attention_mask.extend(std::iter::repeat(0).take(seq_len - row_len));
        }

        Ok(PaddedBatch { input_ids, attention_mask, batch, seq_len })
    }

    /// Encode a `[CLS] a [SEP] b [SEP]` pair, truncating `b` first so `a`
    /// survives intact whenever it fits.
    fn encode_pair(&self, a: &str, b: &str) -> Result<Encoding> {
        let ea = self.encode(a, false)?;
        let eb = self.encode(b, false)?;
        let budget = self.max_length().saturating_sub(3);

        let a_len = ea.ids.len().min(budget);
        let b_len = eb.ids.len().min(budget - a_len);

        let mut ids = Vec::with_capacity(a_len + b_len + 3);
        ids.push(self.cls_id());
        ids.extend_from_slice(&ea.ids[..a_len]);
        ids.push(self.sep_id());
        ids.extend_from_slice(&eb.ids[..b_len]);
        ids.push(self.sep_id());

        let attention_mask = vec![1; ids.len()];
        Ok(Encoding { ids, attention_mask, tokens: Vec::new() })
    }
}

// ---------------------------------------------------------------------------
// HuggingFace tokenizer (feature `ml`)
// ---------------------------------------------------------------------------

#[cfg(feature = "ml")]
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    max_length: usize,
    cls: i64,
    sep: i64,
}

#[cfg(feature = "ml")]
impl HfTokenizer {
    pub fn from_file(path: &std::path::Path, max_length: usize) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| Error::Internal(format!("failed to load tokenizer: {e}")))?;
        let cls = inner.token_to_id("[CLS]").map(i64::from).unwrap_or(DEFAULT_CLS_ID);
        let sep = inner.token_to_id("[SEP]").map(i64::from).unwrap_or(DEFAULT_SEP_ID);
        Ok(HfTokenizer { inner, max_length, cls, sep })
    }
}

#[cfg(feature = "ml")]
impl TextEncoder for HfTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Encoding> {
        let enc = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| Error::Internal(format!("tokenization failed: {e}")))?;
        let mut ids: Vec<i64> = enc.get_ids().iter().map(|&i| i as i64).collect();
        let mut mask: Vec<i64> = enc.get_attention_mask().iter().map(|&m| m as i64).collect();
        let mut tokens = enc.get_tokens().to_vec();
        if ids.len() > self.max_length {
            ids.truncate(self.max_length);
            mask.truncate(self.max_length);
            tokens.truncate(self.max_length);
        }
        Ok(Encoding { ids, attention_mask: mask, tokens })
    }

    fn max_length(&self) -> usize {
        self.max_length
    }

    fn cls_id(&self) -> i64 {
        self.cls
    }

    fn sep_id(&self) -> i64 {
        self.sep
    }
}

// ---------------------------------------------------------------------------
// Deterministic fallback encoder
// ---------------------------------------------------------------------------

/// Whitespace tokenizer with stable hashed ids. Used by mock sessions so the
/// whole pipeline stays deterministic with no model files on disk.
pub struct WhitespaceEncoder {
    max_length: usize,
    vocab_size: u32,
}

impl WhitespaceEncoder {
    pub fn new(max_length: usize) -> Self {
        WhitespaceEncoder { max_length, vocab_size: 30_000 }
    }

    fn token_id(&self, token: &str) -> i64 {
        // FNV-1a, folded into [1000, vocab) so specials and PAD stay clear.
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for b in token.as_bytes() {
            h ^= u64::from(*b);
            h = h.wrapping_mul(0x1000_0000_01b3);
        }
        (1000 + (h % u64::from(self.vocab_size - 1000))) as i64
    }
}

impl TextEncoder for WhitespaceEncoder {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Encoding> {
        let mut ids = Vec::new();
        let mut tokens = Vec::new();
        if add_special_tokens {
            ids.push(self.cls_id());
            tokens.push("[CLS]".to_string());
        }
        for tok in text.split_whitespace() {
            ids.push(self.token_id(tok));
            tokens.push(tok.to_string());
        }
        if add_special_tokens {
            ids.push(self.sep_id());
            tokens.push("[SEP]".to_string());
        }
        if ids.len() > self.max_length {
            ids.truncate(self.max_length);
            tokens.truncate(self.max_length);
        }
        let attention_mask = vec![1; ids.len()];
        Ok(Encoding { ids, attention_mask, tokens })
    }

    fn max_length(&self) -> usize {
        self.max_length
    }
}
