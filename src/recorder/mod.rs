//! Scoped recording of language-model calls.
//!
//! [`RecordLlmCalls`] swaps every live model registered in a
//! [`ModelRegistry`] for a [`RecordedModel`] and hands back an
//! [`ActiveRecording`] guard. Until the guard is deactivated or dropped, every
//! call made through a [`ModelHandle`](crate::registry::ModelHandle):
//!
//! - is summarized (endpoint, prompt preview, entry point),
//! - is rejected with [`RecordError::PromptTooLarge`] if its prompts exceed
//!   `max_prompt_tokens`, without reaching the model,
//! - otherwise runs inside a [`Flow`](crate::flow::Flow) tagged with the
//!   endpoint and the configured tags, and its result is summarized.
//!
//! ```rust
//! use tower_llm_record::{GenerateRequest, LanguageModel, LlmResult, ModelRegistry, RecordLlmCalls, RecordOptions};
//! use tower::BoxError;
//!
//! struct Fixed;
//!
//! #[async_trait::async_trait]
//! impl LanguageModel for Fixed {
//!     fn generate(&self, _req: GenerateRequest) -> Result<LlmResult, BoxError> {
//!         Ok(LlmResult::default())
//!     }
//!     async fn agenerate(&self, req: GenerateRequest) -> Result<LlmResult, BoxError> {
//!         self.generate(req)
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let registry = ModelRegistry::new();
//! let llm = registry.register(Fixed);
//!
//! let recorder = RecordLlmCalls::new(RecordOptions::default().tag("a_custom_tag"));
//! recorder.scope(&registry, || llm.generate(GenerateRequest::new("Good name for a sock company?")))??;
//! # Ok(())
//! # }
//! ```
//!
//! Activations patch shared handles. Overlapping activations over the same
//! handles must be deactivated in reverse order; an out-of-order deactivation
//! leaves the newer wrapper in place and reports a restore failure.

mod wrapper;

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

pub use wrapper::RecordedModel;
pub(crate) use wrapper::{complete, RecordContext};

use crate::error::{RecordError, RestoreFailure, Result, ScopeError};
use crate::flow::{FlowOptions, FlowSink, LogSink};
use crate::model::{EntryPoint, LanguageModel};
use crate::registry::{ModelRegistry, PatchRecord};
use crate::tokens::{SimpleTokenCounter, TiktokenCounter, TokenCounter};

/// Ceiling applied when none is configured.
pub const DEFAULT_MAX_PROMPT_TOKENS: usize = 10_000;

fn default_max_prompt_tokens() -> Option<usize> {
    Some(DEFAULT_MAX_PROMPT_TOKENS)
}

/// What to attach to, and enforce on, every recorded call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOptions {
    /// Tags attached to every flow run, after the endpoint tag.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Reject calls whose prompts exceed this many tokens. `None` disables the check.
    #[serde(default = "default_max_prompt_tokens")]
    pub max_prompt_tokens: Option<usize>,
    /// Passed through to the flow each call runs in.
    #[serde(default)]
    pub flow: FlowOptions,
}

impl Default for RecordOptions {
    fn default() -> Self {
        Self {
            tags: BTreeSet::new(),
            max_prompt_tokens: default_max_prompt_tokens(),
            flow: FlowOptions::default(),
        }
    }
}

impl RecordOptions {
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn max_prompt_tokens(mut self, max: Option<usize>) -> Self {
        self.max_prompt_tokens = max;
        self
    }

    pub fn flow(mut self, flow: FlowOptions) -> Self {
        self.flow = flow;
        self
    }
}

fn default_counter() -> Arc<dyn TokenCounter> {
    match TiktokenCounter::cl100k_base() {
        Ok(counter) => Arc::new(counter),
        Err(e) => {
            warn!(error = %e, "Falling back to character-based token estimate");
            Arc::new(SimpleTokenCounter::new())
        }
    }
}

/// Observer that records calls to every registered model while active.
#[derive(Clone)]
pub struct RecordLlmCalls {
    options: RecordOptions,
    counter: Arc<dyn TokenCounter>,
    sink: Arc<dyn FlowSink>,
}

impl RecordLlmCalls {
    pub fn new(options: RecordOptions) -> Self {
        Self {
            options,
            counter: default_counter(),
            sink: Arc::new(LogSink),
        }
    }

    /// Tokenizer used for the prompt ceiling. Defaults to `cl100k_base` BPE.
    pub fn with_token_counter(mut self, counter: impl TokenCounter + 'static) -> Self {
        self.counter = Arc::new(counter);
        self
    }

    /// Where finished flow runs are reported.
    pub fn with_sink(mut self, sink: Arc<dyn FlowSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn options(&self) -> &RecordOptions {
        &self.options
    }

    pub(crate) fn context(&self) -> Arc<RecordContext> {
        Arc::new(RecordContext {
            options: self.options.clone(),
            counter: self.counter.clone(),
            sink: self.sink.clone(),
            activated_at: Utc::now(),
        })
    }

    /// Wrap a single model explicitly, without touching any registry.
    pub fn wrap(&self, model: Arc<dyn LanguageModel>) -> RecordedModel {
        RecordedModel {
            inner: model,
            context: self.context(),
        }
    }

    /// Patch both entry points of every live model in `registry`.
    ///
    /// Models registered after this returns are not covered. If any entry point
    /// refuses the patch, everything patched so far is restored before the
    /// error is returned.
    pub fn activate(&self, registry: &ModelRegistry) -> Result<ActiveRecording> {
        let context = self.context();
        let mut active = ActiveRecording {
            records: Vec::new(),
            activated_at: context.activated_at,
        };
        for handle in registry.live() {
            for entry_point in EntryPoint::ALL {
                let context = context.clone();
                // on error, dropping `active` reverts the records made so far
                let record = PatchRecord::apply(&handle, entry_point, move |original| {
                    Arc::new(RecordedModel {
                        inner: original,
                        context,
                    })
                })?;
                active.records.push(record);
            }
        }
        info!(
            patched = active.records.len(),
            tags = ?self.options.tags,
            max_prompt_tokens = ?self.options.max_prompt_tokens,
            "Recording LLM calls"
        );
        Ok(active)
    }

    /// Run `f` with recording active, then deactivate.
    ///
    /// If deactivation fails, the error carries `f`'s output.
    pub fn scope<T>(
        &self,
        registry: &ModelRegistry,
        f: impl FnOnce() -> T,
    ) -> std::result::Result<T, ScopeError<T>> {
        let active = self.activate(registry).map_err(ScopeError::before)?;
        let out = f();
        ScopeError::after(active.deactivate(), out)
    }

    /// Await `fut` with recording active, then deactivate.
    ///
    /// If deactivation fails, the error carries the future's output.
    pub async fn scope_async<F: Future>(
        &self,
        registry: &ModelRegistry,
        fut: F,
    ) -> std::result::Result<F::Output, ScopeError<F::Output>> {
        let active = self.activate(registry).map_err(ScopeError::before)?;
        let out = fut.await;
        ScopeError::after(active.deactivate(), out)
    }
}

impl<T> ScopeError<T> {
    fn before(error: RecordError) -> Self {
        Self {
            error,
            output: None,
        }
    }

    fn after(restored: Result<()>, output: T) -> std::result::Result<T, Self> {
        match restored {
            Ok(()) => Ok(output),
            Err(error) => Err(Self {
                error,
                output: Some(output),
            }),
        }
    }
}

impl std::fmt::Debug for RecordLlmCalls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordLlmCalls")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Guard for an activation. Restores every patched entry point when
/// deactivated or dropped.
#[derive(Debug)]
pub struct ActiveRecording {
    records: Vec<PatchRecord>,
    activated_at: DateTime<Utc>,
}

impl ActiveRecording {
    /// Entry points patched by this activation.
    pub fn records(&self) -> &[PatchRecord] {
        &self.records
    }

    pub fn activated_at(&self) -> DateTime<Utc> {
        self.activated_at
    }

    /// Restore every patched entry point.
    ///
    /// A failure on one entry point does not stop the others from being
    /// restored; all failures are returned together.
    pub fn deactivate(mut self) -> Result<()> {
        let failures = self.restore_all();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(RecordError::PatchRestore { failures })
        }
    }

    fn restore_all(&mut self) -> Vec<RestoreFailure> {
        let mut failures = Vec::new();
        while let Some(record) = self.records.pop() {
            if let Err(failure) = record.restore() {
                failures.push(failure);
            }
        }
        failures
    }
}

impl Drop for ActiveRecording {
    fn drop(&mut self) {
        for failure in self.restore_all() {
            error!(
                endpoint = %failure.endpoint,
                entry_point = %failure.entry_point,
                reason = %failure.reason,
                "Failed to restore entry point"
            );
        }
    }
}
