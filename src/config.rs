//! Configuration for call recording
//!
//! Options can be built in code, read from a TOML file, or overlaid from
//! `LLM_RECORD_*` environment variables.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::error::{RecordError, Result};
use crate::flow::FlowSink;
use crate::recorder::{RecordLlmCalls, RecordOptions};
use crate::tokens::{SimpleTokenCounter, TiktokenCounter, WhitespaceTokenCounter, DEFAULT_ENCODING};

fn default_chars_per_token() -> f32 {
    4.0
}

fn default_encoding() -> String {
    DEFAULT_ENCODING.to_string()
}

/// Which tokenizer enforces `max_prompt_tokens`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenCounterConfig {
    /// BPE tokens of a tiktoken encoding.
    Tiktoken {
        #[serde(default = "default_encoding")]
        encoding: String,
    },
    /// Character-count estimate.
    Simple {
        #[serde(default = "default_chars_per_token")]
        chars_per_token: f32,
    },
    /// Whitespace-separated words.
    Whitespace,
}

impl Default for TokenCounterConfig {
    fn default() -> Self {
        TokenCounterConfig::Tiktoken {
            encoding: default_encoding(),
        }
    }
}

/// Complete recording configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordConfig {
    #[serde(flatten)]
    pub options: RecordOptions,

    #[serde(default)]
    pub token_counter: TokenCounterConfig,
}

impl RecordConfig {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Build an observer from this configuration, reporting runs to `sink`.
    ///
    /// Fails if the configured tiktoken encoding is unknown.
    pub fn recorder(&self, sink: Arc<dyn FlowSink>) -> Result<RecordLlmCalls> {
        let recorder = RecordLlmCalls::new(self.options.clone()).with_sink(sink);
        Ok(match &self.token_counter {
            TokenCounterConfig::Tiktoken { encoding } => {
                recorder.with_token_counter(TiktokenCounter::new(encoding)?)
            }
            TokenCounterConfig::Simple { chars_per_token } => {
                recorder.with_token_counter(SimpleTokenCounter::with_chars_per_token(*chars_per_token))
            }
            TokenCounterConfig::Whitespace => recorder.with_token_counter(WhitespaceTokenCounter),
        })
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    config: RecordConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RecordConfig::default(),
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.config.options.tags.insert(tag.into());
        self
    }

    pub fn max_prompt_tokens(mut self, max: Option<usize>) -> Self {
        self.config.options.max_prompt_tokens = max;
        self
    }

    pub fn flow_name(mut self, name: impl Into<String>) -> Self {
        self.config.options.flow.name = name.into();
        self
    }

    pub fn log_prints(mut self, enabled: bool) -> Self {
        self.config.options.flow.log_prints = enabled;
        self
    }

    pub fn token_counter(mut self, counter: TokenCounterConfig) -> Self {
        self.config.token_counter = counter;
        self
    }

    pub fn build(self) -> RecordConfig {
        self.config
    }
}

/// Load configuration from `LLM_RECORD_*` environment variables
///
/// - `LLM_RECORD_TAGS`: comma-separated tags
/// - `LLM_RECORD_MAX_PROMPT_TOKENS`: a number, or `none` to disable the ceiling
/// - `LLM_RECORD_FLOW_NAME`
/// - `LLM_RECORD_LOG_PRINTS`: `true`/`1` or anything else for false
/// - `LLM_RECORD_TOKEN_COUNTER`: `tiktoken`, `simple` or `whitespace`
/// - `LLM_RECORD_TIKTOKEN_ENCODING`: encoding for `tiktoken`, `cl100k_base` by default
///
/// Unparsable values are logged and ignored.
pub fn from_env() -> RecordConfig {
    from_vars(|name| std::env::var(name).ok())
}

/// Same as [`from_env`], reading variables through `var`.
pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> RecordConfig {
    let mut config = RecordConfig::default();

    if let Some(tags) = var("LLM_RECORD_TAGS") {
        config.options.tags.extend(
            tags.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
        );
    }

    if let Some(max) = var("LLM_RECORD_MAX_PROMPT_TOKENS") {
        match max.trim().to_lowercase().as_str() {
            "none" | "off" | "" => config.options.max_prompt_tokens = None,
            value => match value.parse::<usize>() {
                Ok(max) => config.options.max_prompt_tokens = Some(max),
                Err(_) => warn!(value = %max, "Ignoring invalid LLM_RECORD_MAX_PROMPT_TOKENS"),
            },
        }
    }

    if let Some(name) = var("LLM_RECORD_FLOW_NAME") {
        config.options.flow.name = name;
    }

    if let Some(log_prints) = var("LLM_RECORD_LOG_PRINTS") {
        config.options.flow.log_prints = log_prints.to_lowercase() == "true" || log_prints == "1";
    }

    if let Some(counter) = var("LLM_RECORD_TOKEN_COUNTER") {
        match counter.trim().to_lowercase().as_str() {
            "tiktoken" => {
                config.token_counter = TokenCounterConfig::Tiktoken {
                    encoding: var("LLM_RECORD_TIKTOKEN_ENCODING").unwrap_or_else(default_encoding),
                }
            }
            "simple" => {
                config.token_counter = TokenCounterConfig::Simple {
                    chars_per_token: default_chars_per_token(),
                }
            }
            "whitespace" => config.token_counter = TokenCounterConfig::Whitespace,
            _ => warn!(value = %counter, "Ignoring unknown LLM_RECORD_TOKEN_COUNTER"),
        }
    }

    config
}

/// Load configuration from a TOML file
pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<RecordConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .map_err(|e| RecordError::Config(format!("{}: {e}", path.display())))?;
    from_toml_str(&contents)
}

/// Parse configuration from TOML text
pub fn from_toml_str(contents: &str) -> Result<RecordConfig> {
    toml::from_str(contents).map_err(|e| RecordError::Config(e.to_string()))
}
