//! Flow runs: the traced unit of work every recorded call executes in.
//!
//! A [`Flow`] is a named, tagged scope. Running work inside it produces a
//! [`FlowRun`] that starts as `Running` and ends as `Completed`, `Failed` or
//! `Cancelled`. Finished runs are handed to a [`FlowSink`]; the default
//! [`LogSink`] reports them through `tracing`, while [`InMemoryFlowStore`] keeps
//! them around for inspection.
//!
//! ```rust
//! use tower_llm_record::flow::{Flow, FlowOptions, InMemoryFlowStore};
//! use std::sync::Arc;
//!
//! let store = InMemoryFlowStore::default();
//! let flow = Flow::new(FlowOptions::default())
//!     .with_run_name("Calling my_app::llm")
//!     .with_tags(["my_app::llm"])
//!     .with_sink(Arc::new(store.clone()));
//!
//! let out: Result<u32, String> = flow.run(|log| {
//!     log.print("working");
//!     Ok(42)
//! });
//! assert_eq!(out, Ok(42));
//! assert_eq!(store.runs()[0].logs, vec!["working".to_string()]);
//! ```
//!
//! Tags can also be attached to every run started within a dynamic scope with
//! [`with_tags`] (async) or [`with_tags_sync`].

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

tokio::task_local! {
    static SCOPED_TAGS: Vec<String>;
}

fn default_flow_name() -> String {
    "Execute LLM Call".to_string()
}

fn default_log_prints() -> bool {
    true
}

/// Configuration of the flow each recorded call runs in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowOptions {
    /// Display name of the flow.
    #[serde(default = "default_flow_name")]
    pub name: String,
    /// Capture printed lines as run logs (at `info`) instead of only emitting them at `debug`.
    #[serde(default = "default_log_prints")]
    pub log_prints: bool,
}

impl Default for FlowOptions {
    fn default() -> Self {
        Self {
            name: default_flow_name(),
            log_prints: default_log_prints(),
        }
    }
}

/// Terminal (or current) state of a flow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum FlowState {
    Running,
    Completed,
    Failed { message: String },
    Cancelled,
}

/// One execution of a flow.
#[derive(Debug, Clone, Serialize)]
pub struct FlowRun {
    pub id: Uuid,
    pub flow_name: String,
    pub run_name: String,
    pub tags: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub state: FlowState,
    pub logs: Vec<String>,
}

impl FlowRun {
    /// Duration in milliseconds, once the run has ended.
    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Receives finished flow runs.
pub trait FlowSink: Send + Sync {
    fn record(&self, run: FlowRun);
}

/// Reports finished runs as `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl FlowSink for LogSink {
    fn record(&self, run: FlowRun) {
        let duration_ms = run.duration_ms().unwrap_or_default();
        match &run.state {
            FlowState::Completed => {
                info!(run_id = %run.id, run = %run.run_name, tags = ?run.tags, duration_ms, "Flow run completed")
            }
            FlowState::Failed { message } => {
                error!(run_id = %run.id, run = %run.run_name, tags = ?run.tags, duration_ms, error = %message, "Flow run failed")
            }
            FlowState::Cancelled => {
                warn!(run_id = %run.id, run = %run.run_name, tags = ?run.tags, duration_ms, "Flow run cancelled")
            }
            FlowState::Running => {
                debug!(run_id = %run.id, run = %run.run_name, "Flow run still running")
            }
        }
    }
}

/// Keeps finished runs in memory, in completion order.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFlowStore(Arc<Mutex<Vec<FlowRun>>>);

impl InMemoryFlowStore {
    pub fn runs(&self) -> Vec<FlowRun> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn runs_tagged(&self, tag: &str) -> Vec<FlowRun> {
        self.runs().into_iter().filter(|r| r.has_tag(tag)).collect()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FlowSink for InMemoryFlowStore {
    fn record(&self, run: FlowRun) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(run);
    }
}

/// Tags of the enclosing [`with_tags`] / [`with_tags_sync`] scopes.
pub fn current_tags() -> Vec<String> {
    SCOPED_TAGS.try_with(|tags| tags.clone()).unwrap_or_default()
}

fn merged_tags<I, T>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = T>,
    T: Into<String>,
{
    let mut merged = current_tags();
    push_unique(&mut merged, tags);
    merged
}

fn push_unique<I, T>(into: &mut Vec<String>, tags: I)
where
    I: IntoIterator<Item = T>,
    T: Into<String>,
{
    for tag in tags {
        let tag = tag.into();
        if !into.contains(&tag) {
            into.push(tag);
        }
    }
}

/// Attach `tags` to every flow run started while `fut` runs.
pub async fn with_tags<I, T, F>(tags: I, fut: F) -> F::Output
where
    I: IntoIterator<Item = T>,
    T: Into<String>,
    F: Future,
{
    SCOPED_TAGS.scope(merged_tags(tags), fut).await
}

/// Attach `tags` to every flow run started while `f` runs on this thread.
pub fn with_tags_sync<I, T, R>(tags: I, f: impl FnOnce() -> R) -> R
where
    I: IntoIterator<Item = T>,
    T: Into<String>,
{
    SCOPED_TAGS.sync_scope(merged_tags(tags), f)
}

/// Handle for printing into a running flow.
#[derive(Debug, Clone)]
pub struct FlowLog {
    run_name: Arc<str>,
    log_prints: bool,
    lines: Arc<Mutex<Vec<String>>>,
}

impl FlowLog {
    pub fn print(&self, line: impl Into<String>) {
        let line = line.into();
        if self.log_prints {
            info!(run = %self.run_name, "{line}");
            self.lines
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(line);
        } else {
            debug!(run = %self.run_name, "{line}");
        }
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// A named, tagged unit of work.
#[derive(Clone)]
pub struct Flow {
    options: FlowOptions,
    run_name: Option<String>,
    tags: Vec<String>,
    sink: Arc<dyn FlowSink>,
}

impl Flow {
    pub fn new(options: FlowOptions) -> Self {
        Self {
            options,
            run_name: None,
            tags: Vec::new(),
            sink: Arc::new(LogSink),
        }
    }

    /// Override the display name of runs; defaults to the flow name.
    pub fn with_run_name(mut self, run_name: impl Into<String>) -> Self {
        self.run_name = Some(run_name.into());
        self
    }

    /// Append tags, keeping first-seen order and dropping duplicates.
    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        push_unique(&mut self.tags, tags);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn FlowSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn options(&self) -> &FlowOptions {
        &self.options
    }

    /// Run `f` synchronously inside a new flow run.
    pub fn run<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&FlowLog) -> Result<T, E>,
        E: std::fmt::Display,
    {
        let guard = self.start();
        let span = guard.span.clone();
        let out = {
            let _entered = span.enter();
            f(&guard.log)
        };
        guard.finish(&out);
        out
    }

    /// Run the future produced by `f` inside a new flow run.
    ///
    /// Dropping the returned future before it completes records the run as
    /// `Cancelled`.
    pub async fn run_async<T, E, F, Fut>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(FlowLog) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let guard = self.start();
        let span = guard.span.clone();
        let out = f(guard.log.clone()).instrument(span).await;
        guard.finish(&out);
        out
    }

    /// Open a run without driving any work; the returned guard reports it.
    pub(crate) fn start(&self) -> RunGuard {
        let mut tags = self.tags.clone();
        push_unique(&mut tags, current_tags());
        let run_name = self
            .run_name
            .clone()
            .unwrap_or_else(|| self.options.name.clone());
        let run = FlowRun {
            id: Uuid::new_v4(),
            flow_name: self.options.name.clone(),
            run_name: run_name.clone(),
            tags,
            start_time: Utc::now(),
            end_time: None,
            state: FlowState::Running,
            logs: Vec::new(),
        };
        let span = info_span!(
            "flow_run",
            flow = %run.flow_name,
            run = %run.run_name,
            run_id = %run.id,
            tags = ?run.tags,
        );
        debug!(run_id = %run.id, run = %run.run_name, "Starting flow run");
        RunGuard {
            log: FlowLog {
                run_name: Arc::from(run_name),
                log_prints: self.options.log_prints,
                lines: Arc::new(Mutex::new(Vec::new())),
            },
            span,
            run: Some(run),
            sink: self.sink.clone(),
        }
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("options", &self.options)
            .field("run_name", &self.run_name)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

/// Reports the run exactly once: on `finish`, or on drop if never finished.
pub(crate) struct RunGuard {
    pub(crate) log: FlowLog,
    pub(crate) span: tracing::Span,
    run: Option<FlowRun>,
    sink: Arc<dyn FlowSink>,
}

impl RunGuard {
    pub(crate) fn finish<T, E: std::fmt::Display>(mut self, out: &Result<T, E>) {
        let state = match out {
            Ok(_) => FlowState::Completed,
            Err(e) => FlowState::Failed {
                message: e.to_string(),
            },
        };
        self.report(state);
    }

    fn report(&mut self, state: FlowState) {
        if let Some(mut run) = self.run.take() {
            run.state = state;
            run.end_time = Some(Utc::now());
            run.logs = self.log.take();
            self.sink.record(run);
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let state = if std::thread::panicking() {
            FlowState::Failed {
                message: "panicked".to_string(),
            }
        } else {
            FlowState::Cancelled
        };
        self.report(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(store: &InMemoryFlowStore) -> Flow {
        Flow::new(FlowOptions::default())
            .with_run_name("Calling fake")
            .with_tags(["fake", "extra", "fake"])
            .with_sink(Arc::new(store.clone()))
    }

    #[test]
    fn sync_run_completes_and_keeps_logs() {
        let store = InMemoryFlowStore::default();
        let out: Result<&str, String> = flow(&store).run(|log| {
            log.print("one");
            log.print("two");
            Ok("done")
        });
        assert_eq!(out, Ok("done"));

        let runs = store.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].state, FlowState::Completed);
        assert_eq!(runs[0].flow_name, "Execute LLM Call");
        assert_eq!(runs[0].run_name, "Calling fake");
        assert_eq!(runs[0].tags, vec!["fake", "extra"]);
        assert_eq!(runs[0].logs, vec!["one", "two"]);
        assert!(runs[0].end_time.is_some());
    }

    #[test]
    fn sync_run_failure_is_recorded_and_returned() {
        let store = InMemoryFlowStore::default();
        let out: Result<(), String> = flow(&store).run(|_| Err("boom".to_string()));
        assert_eq!(out, Err("boom".to_string()));
        assert_eq!(
            store.runs()[0].state,
            FlowState::Failed {
                message: "boom".into()
            }
        );
    }

    #[test]
    fn logs_not_captured_without_log_prints() {
        let store = InMemoryFlowStore::default();
        let quiet = Flow::new(FlowOptions {
            log_prints: false,
            ..Default::default()
        })
        .with_sink(Arc::new(store.clone()));
        let _: Result<(), String> = quiet.run(|log| {
            log.print("hidden");
            Ok(())
        });
        let runs = store.runs();
        assert!(runs[0].logs.is_empty());
        assert_eq!(runs[0].run_name, "Execute LLM Call");
    }

    #[tokio::test]
    async fn async_run_completes() {
        let store = InMemoryFlowStore::default();
        let out: Result<u8, String> = flow(&store)
            .run_async(|log| async move {
                tokio::task::yield_now().await;
                log.print("awaited");
                Ok(7)
            })
            .await;
        assert_eq!(out, Ok(7));
        assert_eq!(store.runs()[0].logs, vec!["awaited"]);
    }

    #[tokio::test]
    async fn dropped_async_run_is_cancelled() {
        let store = InMemoryFlowStore::default();
        let f = flow(&store);
        let fut = f.run_async(|_| async move {
            std::future::pending::<()>().await;
            Ok::<(), String>(())
        });
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(10), fut).await;
        assert!(timed_out.is_err());
        let runs = store.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].state, FlowState::Cancelled);
    }

    #[tokio::test]
    async fn scoped_tags_accumulate() {
        let store = InMemoryFlowStore::default();
        let f = flow(&store);
        with_tags(["outer"], async {
            with_tags(["inner", "outer"], async {
                assert_eq!(current_tags(), vec!["outer", "inner"]);
                let _: Result<(), String> = f.run(|_| Ok(()));
            })
            .await;
        })
        .await;
        assert!(current_tags().is_empty());
        assert_eq!(store.runs()[0].tags, vec!["fake", "extra", "outer", "inner"]);
    }

    #[test]
    fn sync_scoped_tags() {
        let store = InMemoryFlowStore::default();
        let f = flow(&store);
        with_tags_sync(["batch"], || {
            let _: Result<(), String> = f.run(|_| Ok(()));
        });
        assert_eq!(store.runs_tagged("batch").len(), 1);
        assert_eq!(store.runs_tagged("missing").len(), 0);
    }
}
