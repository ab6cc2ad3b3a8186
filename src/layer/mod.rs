//! Tower layer that records calls made through a generation service.
//!
//! This is the call-site form of recording: instead of patching registered
//! models, wrap a `Service<GenerateRequest, Response = LlmResult>` explicitly.
//! The same summary, prompt ceiling and flow run apply.
//!
//! ```rust
//! use tower::{service_fn, BoxError, Layer, Service, ServiceExt};
//! use tower_llm_record::{GenerateRequest, LlmResult, RecordLayer, RecordLlmCalls, RecordOptions};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), BoxError> {
//! let recorder = RecordLlmCalls::new(RecordOptions::default().max_prompt_tokens(Some(100)));
//! let inner = service_fn(|_req: GenerateRequest| async move {
//!     Ok::<_, BoxError>(LlmResult::default())
//! });
//! let mut svc = RecordLayer::new("my_app::llm", &recorder).layer(inner);
//! let _ = svc.ready().await?.call(GenerateRequest::new("hello")).await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tower::{BoxError, Layer, Service};

use crate::model::{EntryPoint, GenerateRequest, LlmResult};
use crate::recorder::{complete, RecordContext, RecordLlmCalls};

/// Layer that records every request passing through the wrapped service.
#[derive(Clone)]
pub struct RecordLayer {
    endpoint: Arc<str>,
    context: Arc<RecordContext>,
}

impl RecordLayer {
    /// `endpoint` is used for summaries and as the first flow tag.
    pub fn new(endpoint: impl Into<String>, recorder: &RecordLlmCalls) -> Self {
        Self {
            endpoint: Arc::from(endpoint.into()),
            context: recorder.context(),
        }
    }
}

/// Service wrapper produced by [`RecordLayer`].
#[derive(Clone)]
pub struct Record<S> {
    inner: S,
    endpoint: Arc<str>,
    context: Arc<RecordContext>,
}

impl<S> Layer<S> for RecordLayer {
    type Service = Record<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Record {
            inner,
            endpoint: self.endpoint.clone(),
            context: self.context.clone(),
        }
    }
}

impl<S> Service<GenerateRequest> for Record<S>
where
    S: Service<GenerateRequest, Response = LlmResult, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = LlmResult;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: GenerateRequest) -> Self::Future {
        let invocation = match self
            .context
            .invocation(&self.endpoint, EntryPoint::AGenerate, &req)
        {
            Ok(invocation) => invocation,
            Err(err) => return Box::pin(async move { Err::<LlmResult, BoxError>(err.into()) }),
        };

        // the inner call may do work before its future is polled
        let run = self.context.begin(&self.endpoint, invocation);
        let fut = run.span.in_scope(|| self.inner.call(req));
        Box::pin(complete(run, fut))
    }
}
