//! # tower-llm-record
//!
//! Record every call made to a language model as a tagged, traced flow run,
//! and refuse calls whose prompts are too large before they reach the model.
//!
//! ## Core Concepts
//!
//! - **LanguageModel**: the capability being observed, a blocking `generate` and an awaited `agenerate`
//! - **ModelRegistry / ModelHandle**: explicit registration of the models that may be observed
//! - **RecordLlmCalls**: activates recording over a registry and restores everything on exit
//! - **Flow**: the traced unit of work each recorded call runs in
//! - **RecordLayer**: the same recording as a Tower layer, applied at a call site
//!
//! ## Getting Started
//!
//! ```rust
//! use std::sync::Arc;
//! use tower::BoxError;
//! use tower_llm_record::flow::InMemoryFlowStore;
//! use tower_llm_record::{
//!     GenerateRequest, Generation, LanguageModel, LlmResult, ModelRegistry, RecordLlmCalls,
//!     RecordOptions,
//! };
//!
//! struct Shout;
//!
//! #[async_trait::async_trait]
//! impl LanguageModel for Shout {
//!     fn generate(&self, req: GenerateRequest) -> Result<LlmResult, BoxError> {
//!         let texts = tower_llm_record::summary::prompt_content(&req.prompts);
//!         Ok(LlmResult {
//!             generations: texts.iter().map(|t| vec![Generation::new(t.to_uppercase())]).collect(),
//!             llm_output: None,
//!         })
//!     }
//!
//!     async fn agenerate(&self, req: GenerateRequest) -> Result<LlmResult, BoxError> {
//!         self.generate(req)
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), BoxError> {
//! let registry = ModelRegistry::new();
//! let llm = registry.register(Shout);
//! let store = InMemoryFlowStore::default();
//!
//! let recorder = RecordLlmCalls::new(RecordOptions::default().tag("demo"))
//!     .with_sink(Arc::new(store.clone()));
//!
//! let active = recorder.activate(&registry)?;
//! let out = llm
//!     .agenerate(GenerateRequest::new(vec![
//!         "Good name for a company that makes colorful socks?".to_string(),
//!         "Good name for a company that sells carbonated water?".to_string(),
//!     ]))
//!     .await?;
//! active.deactivate()?;
//!
//! assert_eq!(out.generations.len(), 2);
//! assert_eq!(store.runs()[0].tags[1], "demo");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod flow;
pub mod layer;
pub mod model;
pub mod recorder;
pub mod registry;
pub mod summary;
pub mod tokens;

// Public re-exports for convenience
pub use error::{RecordError, RestoreFailure, Result, ScopeError};
pub use flow::{Flow, FlowOptions, FlowRun, FlowSink, FlowState};
pub use layer::{Record, RecordLayer};
pub use model::{EntryPoint, GenerateRequest, Generation, LanguageModel, LlmResult, Prompts};
pub use recorder::{ActiveRecording, RecordLlmCalls, RecordOptions, RecordedModel};
pub use registry::{ModelHandle, ModelRegistry, PatchRecord};
pub use summary::{truncate, InvocationSummary, ResultSummary};
pub use tokens::{SimpleTokenCounter, TiktokenCounter, TokenCounter, WhitespaceTokenCounter};

// Re-export the message type used for structured prompts
pub use async_openai::types::ChatCompletionRequestMessage;

// Re-export Tower traits that users need
pub use tower::{BoxError, Layer, Service, ServiceExt};
