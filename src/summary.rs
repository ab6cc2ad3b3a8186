//! Human-readable summaries of intercepted calls.
//!
//! Nothing in here feeds back into the call itself: prompts are normalized and
//! truncated only for display and token counting.

use async_openai::types::ChatCompletionRequestMessage;
use serde::Serialize;

use crate::model::{EntryPoint, GenerateRequest, LlmResult, Prompts};

/// Default display length for prompt and output previews.
pub const DEFAULT_PREVIEW_LEN: usize = 300;

/// Shorten `text` to roughly `max_length` chars as `prefix...suffix`.
///
/// Texts of three chars or fewer, and texts shorter than `max_length`, are
/// returned unchanged.
pub fn truncate(text: &str, max_length: usize) -> String {
    let len = text.chars().count();
    if len > 3 && len >= max_length {
        let keep = max_length.saturating_sub(3) / 2;
        let prefix: String = text.chars().take(keep).collect();
        let suffix: String = text.chars().skip(len - keep).collect();
        return format!("{prefix}...{suffix}");
    }
    text.to_string()
}

/// Flatten any supported prompt shape into ordered prompt texts.
pub fn prompt_content(prompts: &Prompts) -> Vec<String> {
    match prompts {
        Prompts::Text(text) => vec![text.clone()],
        Prompts::Texts(texts) => texts.clone(),
        Prompts::Messages(messages) => messages.iter().map(message_text).collect(),
        Prompts::Conversations(conversations) => conversations
            .iter()
            .flat_map(|conversation| conversation.iter().map(message_text))
            .collect(),
    }
}

/// Text content of a chat message.
///
/// Array content contributes the concatenation of its text parts; images,
/// audio and other non-text parts contribute nothing.
pub fn message_text(message: &ChatCompletionRequestMessage) -> String {
    let Ok(value) = serde_json::to_value(message) else {
        return String::new();
    };
    match value.get("content") {
        Some(serde_json::Value::String(text)) => text.clone(),
        Some(serde_json::Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
            .collect(),
        _ => String::new(),
    }
}

/// Render a list the way the flow logs show it: `['a', 'b']`.
pub fn listrepr<S: AsRef<str>>(items: &[S]) -> String {
    let inner = items
        .iter()
        .map(|s| format!("'{}'", s.as_ref()))
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{inner}]")
}

/// Derived description of one intercepted call.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationSummary {
    pub endpoint: String,
    pub entry_point: EntryPoint,
    pub prompts: Vec<String>,
    pub stop: Option<Vec<String>>,
    pub params: serde_json::Value,
    pub summary: String,
}

impl InvocationSummary {
    pub fn new(endpoint: impl Into<String>, entry_point: EntryPoint, request: &GenerateRequest) -> Self {
        let endpoint = endpoint.into();
        let prompts = prompt_content(&request.prompts);
        let previews: Vec<String> = prompts
            .iter()
            .map(|p| truncate(p, DEFAULT_PREVIEW_LEN))
            .collect();
        let summary = format!(
            "Sending {} to {} via {}",
            listrepr(&previews),
            endpoint,
            entry_point
        );
        Self {
            endpoint,
            entry_point,
            prompts,
            stop: request.stop.clone(),
            params: request.params.clone(),
            summary,
        }
    }

    pub fn description(&self) -> String {
        format!("Query {} via {}", self.endpoint, self.entry_point)
    }
}

/// Token usage reported by the provider, when it reports any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

impl TokenUsage {
    fn from_output(output: &serde_json::Value) -> Option<Self> {
        let usage = output.get("token_usage")?;
        let field = |name: &str| usage.get(name).and_then(serde_json::Value::as_u64);
        Some(Self {
            prompt_tokens: field("prompt_tokens"),
            completion_tokens: field("completion_tokens"),
            total_tokens: field("total_tokens"),
        })
    }
}

/// Derived description of a call's result.
#[derive(Debug, Clone, Serialize)]
pub struct ResultSummary {
    /// First candidate per prompt, newlines trimmed and truncated.
    pub outputs: Vec<String>,
    pub token_usage: Option<TokenUsage>,
}

impl ResultSummary {
    pub fn new(result: &LlmResult) -> Self {
        let outputs = result
            .generations
            .iter()
            .filter_map(|candidates| candidates.first())
            .map(|g| truncate(g.text.trim_matches('\n'), DEFAULT_PREVIEW_LEN))
            .collect();
        let token_usage = result.llm_output.as_ref().and_then(TokenUsage::from_output);
        Self {
            outputs,
            token_usage,
        }
    }
}

impl std::fmt::Display for ResultSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Received: {}", listrepr(&self.outputs))?;
        if let Some(usage) = &self.token_usage {
            write!(f, " (token usage: {usage:?})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Generation;
    use async_openai::types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs,
    };

    fn user(text: &str) -> ChatCompletionRequestMessage {
        ChatCompletionRequestUserMessageArgs::default()
            .content(text)
            .build()
            .unwrap()
            .into()
    }

    fn system(text: &str) -> ChatCompletionRequestMessage {
        ChatCompletionRequestSystemMessageArgs::default()
            .content(text)
            .build()
            .unwrap()
            .into()
    }

    fn assistant(text: &str) -> ChatCompletionRequestMessage {
        ChatCompletionRequestAssistantMessageArgs::default()
            .content(text)
            .build()
            .unwrap()
            .into()
    }

    #[test]
    fn truncate_short_text_unchanged() {
        assert_eq!(truncate("123", 4), "123");
        assert_eq!(truncate("123", 3), "123");
        assert_eq!(truncate("", 0), "");
    }

    #[test]
    fn truncate_keeps_both_ends() {
        assert_eq!(truncate("ICE ICE BABY", 10), "ICE...ABY");
    }

    #[test]
    fn truncate_counts_chars_not_bytes() {
        assert_eq!(truncate("ééééééééé", 9), "ééé...ééé");
    }

    #[test]
    fn prompt_shapes_flatten_to_same_text() {
        let from_text = prompt_content(&Prompts::Text("hello".into()));
        let from_message = prompt_content(&Prompts::Messages(vec![user("hello")]));
        let from_conversation = prompt_content(&Prompts::Conversations(vec![vec![user("hello")]]));
        assert_eq!(from_text, vec!["hello"]);
        assert_eq!(from_message, from_text);
        assert_eq!(from_conversation, from_text);
    }

    #[test]
    fn conversations_flatten_in_order() {
        let prompts = Prompts::Conversations(vec![
            vec![system("be brief"), user("first")],
            vec![assistant("second"), user("third")],
        ]);
        assert_eq!(
            prompt_content(&prompts),
            vec!["be brief", "first", "second", "third"]
        );
    }

    #[test]
    fn invocation_summary_names_endpoint_and_entry_point() {
        let request = GenerateRequest::new(Prompts::Texts(vec!["a".into(), "b".into()]));
        let summary = InvocationSummary::new("fake::llm", EntryPoint::AGenerate, &request);
        assert_eq!(summary.summary, "Sending ['a', 'b'] to fake::llm via agenerate");
        assert_eq!(summary.description(), "Query fake::llm via agenerate");
        assert_eq!(summary.prompts, vec!["a", "b"]);
    }

    #[test]
    fn invocation_summary_truncates_previews_only() {
        let long = "x".repeat(1000);
        let request = GenerateRequest::new(long.as_str());
        let summary = InvocationSummary::new("fake", EntryPoint::Generate, &request);
        assert_eq!(summary.prompts[0].len(), 1000);
        assert!(summary.summary.len() < 400);
    }

    #[test]
    fn result_summary_reads_first_candidates_and_usage() {
        let result = LlmResult {
            generations: vec![
                vec![Generation::new("\n\nSockSplash\n"), Generation::new("ignored")],
                vec![Generation::new("Fizz")],
            ],
            llm_output: Some(serde_json::json!({
                "token_usage": {"prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16}
            })),
        };
        let summary = ResultSummary::new(&result);
        assert_eq!(summary.outputs, vec!["SockSplash", "Fizz"]);
        assert_eq!(
            summary.token_usage,
            Some(TokenUsage {
                prompt_tokens: Some(12),
                completion_tokens: Some(4),
                total_tokens: Some(16),
            })
        );
        assert!(summary.to_string().starts_with("Received: ['SockSplash', 'Fizz']"));
    }

    #[test]
    fn result_summary_without_usage() {
        let summary = ResultSummary::new(&LlmResult::default());
        assert!(summary.outputs.is_empty());
        assert!(summary.token_usage.is_none());
        assert_eq!(summary.to_string(), "Received: []");
    }
}
