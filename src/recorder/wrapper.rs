//! The per-call wrapper installed while recording is active.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tower::BoxError;
use tracing::{warn, Instrument};

use super::RecordOptions;
use crate::error::RecordError;
use crate::flow::{Flow, FlowSink, RunGuard};
use crate::model::{EntryPoint, GenerateRequest, LanguageModel, LlmResult};
use crate::summary::{InvocationSummary, ResultSummary};
use crate::tokens::TokenCounter;

/// Read-only state shared by every wrapper of one activation.
pub(crate) struct RecordContext {
    pub(crate) options: RecordOptions,
    pub(crate) counter: Arc<dyn TokenCounter>,
    pub(crate) sink: Arc<dyn FlowSink>,
    pub(crate) activated_at: DateTime<Utc>,
}

impl RecordContext {
    /// Summarize the call and enforce the prompt ceiling.
    pub(crate) fn invocation(
        &self,
        endpoint: &str,
        entry_point: EntryPoint,
        request: &GenerateRequest,
    ) -> Result<InvocationSummary, RecordError> {
        let invocation = InvocationSummary::new(endpoint, entry_point, request);
        if let Some(max_prompt_tokens) = self.options.max_prompt_tokens {
            let tokens = self.counter.count_prompts(&invocation.prompts);
            if tokens > max_prompt_tokens {
                warn!(
                    endpoint = %endpoint,
                    entry_point = %entry_point,
                    tokens,
                    max_prompt_tokens,
                    "Prompt exceeds token ceiling; not calling model"
                );
                return Err(RecordError::PromptTooLarge {
                    tokens,
                    max_prompt_tokens,
                    endpoint: endpoint.to_string(),
                });
            }
        }
        Ok(invocation)
    }

    /// Flow for one call: endpoint tag first, then the configured tags.
    pub(crate) fn flow(&self, endpoint: &str) -> Flow {
        let run_name = format!(
            "Calling {} @ {}",
            endpoint,
            self.activated_at.to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        Flow::new(self.options.flow.clone())
            .with_run_name(run_name)
            .with_tags(std::iter::once(endpoint.to_string()).chain(self.options.tags.iter().cloned()))
            .with_sink(self.sink.clone())
    }

    pub(crate) fn call_sync<F>(
        &self,
        endpoint: &str,
        entry_point: EntryPoint,
        request: GenerateRequest,
        call: F,
    ) -> Result<LlmResult, BoxError>
    where
        F: FnOnce(GenerateRequest) -> Result<LlmResult, BoxError>,
    {
        let invocation = self.invocation(endpoint, entry_point, &request)?;
        self.flow(endpoint).run(|log| {
            log.print(invocation.summary);
            let result = call(request)?;
            log.print(ResultSummary::new(&result).to_string());
            Ok(result)
        })
    }

    pub(crate) async fn call_async<F, Fut>(
        &self,
        endpoint: &str,
        entry_point: EntryPoint,
        request: GenerateRequest,
        call: F,
    ) -> Result<LlmResult, BoxError>
    where
        F: FnOnce(GenerateRequest) -> Fut,
        Fut: Future<Output = Result<LlmResult, BoxError>>,
    {
        let invocation = self.invocation(endpoint, entry_point, &request)?;
        let run = self.begin(endpoint, invocation);
        let pending = run.span.in_scope(|| call(request));
        complete(run, pending).await
    }

    /// Open the flow run for one call and log its summary.
    ///
    /// Anything the delegate does, including work done while building its
    /// future, belongs after this.
    pub(crate) fn begin(&self, endpoint: &str, invocation: InvocationSummary) -> RunGuard {
        let run = self.flow(endpoint).start();
        run.span.in_scope(|| run.log.print(invocation.summary));
        run
    }
}

/// Await the delegate inside `run`, log the result summary and close the run.
///
/// Dropping the returned future first leaves the run `Cancelled`.
pub(crate) async fn complete<Fut>(run: RunGuard, pending: Fut) -> Result<LlmResult, BoxError>
where
    Fut: Future<Output = Result<LlmResult, BoxError>>,
{
    let span = run.span.clone();
    let out = pending.instrument(span).await;
    if let Ok(result) = &out {
        run.log.print(ResultSummary::new(result).to_string());
    }
    run.finish(&out);
    out
}

/// A [`LanguageModel`] that records every call to the model it wraps.
///
/// Installed into [`ModelHandle`](crate::registry::ModelHandle) entry points on
/// activation, or built directly with
/// [`RecordLlmCalls::wrap`](super::RecordLlmCalls::wrap).
#[derive(Clone)]
pub struct RecordedModel {
    pub(crate) inner: Arc<dyn LanguageModel>,
    pub(crate) context: Arc<RecordContext>,
}

impl RecordedModel {
    pub fn inner(&self) -> &Arc<dyn LanguageModel> {
        &self.inner
    }

    pub fn options(&self) -> &RecordOptions {
        &self.context.options
    }
}

#[async_trait]
impl LanguageModel for RecordedModel {
    fn generate(&self, request: GenerateRequest) -> Result<LlmResult, BoxError> {
        let endpoint = self.inner.endpoint();
        self.context
            .call_sync(&endpoint, EntryPoint::Generate, request, |req| {
                self.inner.generate(req)
            })
    }

    async fn agenerate(&self, request: GenerateRequest) -> Result<LlmResult, BoxError> {
        let endpoint = self.inner.endpoint();
        self.context
            .call_async(&endpoint, EntryPoint::AGenerate, request, |req| {
                self.inner.agenerate(req)
            })
            .await
    }

    fn endpoint(&self) -> String {
        self.inner.endpoint()
    }
}

impl std::fmt::Debug for RecordedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordedModel")
            .field("endpoint", &self.inner.endpoint())
            .field("options", &self.context.options)
            .finish()
    }
}
