//! Token counting for the prompt ceiling.
//!
//! [`TiktokenCounter`] counts real BPE tokens and is the default. The other
//! counters are cheap estimates for tests or for models with other tokenizers.

use std::sync::Arc;

use once_cell::sync::Lazy;
use tiktoken_rs::CoreBPE;

use crate::error::{RecordError, Result};

/// Encoding used when none is configured.
pub const DEFAULT_ENCODING: &str = "cl100k_base";

static CL100K_BASE: Lazy<Option<Arc<CoreBPE>>> =
    Lazy::new(|| tiktoken_rs::cl100k_base().ok().map(Arc::new));

/// Deterministic mapping from text to a token count.
pub trait TokenCounter: Send + Sync {
    fn count_text(&self, text: &str) -> usize;

    /// Total for a batch of prompts: the sum of the per-prompt counts.
    fn count_prompts(&self, prompts: &[String]) -> usize {
        prompts.iter().map(|p| self.count_text(p)).sum()
    }
}

impl<T: TokenCounter + ?Sized> TokenCounter for Arc<T> {
    fn count_text(&self, text: &str) -> usize {
        (**self).count_text(text)
    }
}

/// Simple token counter that estimates based on character count
#[derive(Debug, Clone)]
pub struct SimpleTokenCounter {
    chars_per_token: f32,
}

impl SimpleTokenCounter {
    pub fn new() -> Self {
        Self {
            chars_per_token: 4.0,
        }
    }

    pub fn with_chars_per_token(chars_per_token: f32) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1.0),
        }
    }
}

impl Default for SimpleTokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounter for SimpleTokenCounter {
    fn count_text(&self, text: &str) -> usize {
        let chars = text.chars().count();
        (chars as f32 / self.chars_per_token).ceil() as usize
    }
}

/// Counts whitespace-separated words.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenCounter;

impl TokenCounter for WhitespaceTokenCounter {
    fn count_text(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

/// Counts BPE tokens with a tiktoken encoding.
#[derive(Clone)]
pub struct TiktokenCounter {
    encoding: String,
    bpe: Arc<CoreBPE>,
}

impl TiktokenCounter {
    /// Load the named encoding (`cl100k_base`, `o200k_base`, `p50k_base`,
    /// `p50k_edit` or `r50k_base`).
    pub fn new(encoding: &str) -> Result<Self> {
        let bpe = match encoding {
            DEFAULT_ENCODING => return Self::cl100k_base(),
            "o200k_base" => tiktoken_rs::o200k_base(),
            "p50k_base" => tiktoken_rs::p50k_base(),
            "p50k_edit" => tiktoken_rs::p50k_edit(),
            "r50k_base" => tiktoken_rs::r50k_base(),
            other => {
                return Err(RecordError::Config(format!(
                    "unknown tiktoken encoding {other:?}"
                )))
            }
        }
        .map_err(|e| RecordError::Config(format!("loading {encoding}: {e}")))?;
        Ok(Self {
            encoding: encoding.to_string(),
            bpe: Arc::new(bpe),
        })
    }

    /// The `cl100k_base` encoding, loaded once per process.
    pub fn cl100k_base() -> Result<Self> {
        let bpe = CL100K_BASE
            .clone()
            .ok_or_else(|| RecordError::Config(format!("loading {DEFAULT_ENCODING} failed")))?;
        Ok(Self {
            encoding: DEFAULT_ENCODING.to_string(),
            bpe,
        })
    }

    pub fn encoding(&self) -> &str {
        &self.encoding
    }
}

impl std::fmt::Debug for TiktokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiktokenCounter")
            .field("encoding", &self.encoding)
            .finish_non_exhaustive()
    }
}

impl TokenCounter for TiktokenCounter {
    fn count_text(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}
