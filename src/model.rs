//! The capability being observed: anything that turns prompts into generations.
//!
//! A [`LanguageModel`] exposes two entry points, a blocking [`generate`] and an
//! awaited [`agenerate`]. Both accept a [`GenerateRequest`] carrying one of the
//! supported prompt shapes and return an [`LlmResult`].
//!
//! [`generate`]: LanguageModel::generate
//! [`agenerate`]: LanguageModel::agenerate

use async_openai::types::ChatCompletionRequestMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tower::BoxError;

/// Names one of the two entry points of a [`LanguageModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryPoint {
    Generate,
    AGenerate,
}

impl EntryPoint {
    pub const ALL: [EntryPoint; 2] = [EntryPoint::Generate, EntryPoint::AGenerate];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryPoint::Generate => "generate",
            EntryPoint::AGenerate => "agenerate",
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, EntryPoint::AGenerate)
    }
}

impl std::fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The prompt shapes a generate call accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompts {
    /// A single plain-text prompt.
    Text(String),
    /// Several plain-text prompts.
    Texts(Vec<String>),
    /// Structured chat messages, one prompt per message.
    Messages(Vec<ChatCompletionRequestMessage>),
    /// Several conversations, flattened in order.
    Conversations(Vec<Vec<ChatCompletionRequestMessage>>),
}

impl From<&str> for Prompts {
    fn from(text: &str) -> Self {
        Prompts::Text(text.to_string())
    }
}

impl From<String> for Prompts {
    fn from(text: String) -> Self {
        Prompts::Text(text)
    }
}

impl From<Vec<String>> for Prompts {
    fn from(texts: Vec<String>) -> Self {
        Prompts::Texts(texts)
    }
}

impl From<Vec<ChatCompletionRequestMessage>> for Prompts {
    fn from(messages: Vec<ChatCompletionRequestMessage>) -> Self {
        Prompts::Messages(messages)
    }
}

impl From<Vec<Vec<ChatCompletionRequestMessage>>> for Prompts {
    fn from(conversations: Vec<Vec<ChatCompletionRequestMessage>>) -> Self {
        Prompts::Conversations(conversations)
    }
}

/// Arguments of a single generate call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompts: Prompts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    /// Provider-specific parameters, passed through untouched.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl GenerateRequest {
    pub fn new(prompts: impl Into<Prompts>) -> Self {
        Self {
            prompts: prompts.into(),
            stop: None,
            params: serde_json::Value::Null,
        }
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// One generated candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<serde_json::Value>,
}

impl Generation {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            info: None,
        }
    }
}

/// Result of a generate call: candidates per prompt plus provider metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResult {
    pub generations: Vec<Vec<Generation>>,
    /// Provider output such as `{"token_usage": {"prompt_tokens": 3, ...}}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_output: Option<serde_json::Value>,
}

/// Capability contract for text generation.
///
/// Implementations are observed by registering them in a
/// [`ModelRegistry`](crate::registry::ModelRegistry) and calling them through
/// the returned [`ModelHandle`](crate::registry::ModelHandle).
#[async_trait]
pub trait LanguageModel: Send + Sync + 'static {
    /// Blocking generation.
    fn generate(&self, request: GenerateRequest) -> Result<LlmResult, BoxError>;

    /// Awaited generation.
    async fn agenerate(&self, request: GenerateRequest) -> Result<LlmResult, BoxError>;

    /// Identifies the implementation in summaries and as a flow tag.
    ///
    /// Defaults to the module path of the implementing type.
    fn endpoint(&self) -> String {
        endpoint_of::<Self>()
    }
}

/// Module path of `T`, e.g. `my_app::llms::openai` for `my_app::llms::openai::OpenAi`.
pub fn endpoint_of<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    // generic arguments carry paths of their own
    let base = full.split('<').next().unwrap_or(full);
    match base.rsplit_once("::") {
        Some((module, _)) => module.to_string(),
        None => base.to_string(),
    }
}
