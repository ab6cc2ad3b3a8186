//! Error types for call recording

use thiserror::Error;

use crate::model::EntryPoint;

/// Result type alias for call recording
pub type Result<T> = std::result::Result<T, RecordError>;

/// A single entry point that could not be put back during deactivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreFailure {
    pub endpoint: String,
    pub entry_point: EntryPoint,
    pub reason: String,
}

impl std::fmt::Display for RestoreFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}: {}", self.endpoint, self.entry_point, self.reason)
    }
}

/// Main error type for call recording
#[derive(Debug, Error)]
pub enum RecordError {
    /// The prompt exceeded the configured token ceiling; the model was not called.
    #[error(
        "Prompt is too long: it contains {tokens} tokens and max_prompt_tokens={max_prompt_tokens}. \
         Did not call {endpoint:?}. If desired, increase `max_prompt_tokens`."
    )]
    PromptTooLarge {
        tokens: usize,
        max_prompt_tokens: usize,
        endpoint: String,
    },

    /// An entry point refused substitution during activation
    #[error("Failed to patch {endpoint}::{entry_point}: {reason}")]
    PatchFailed {
        endpoint: String,
        entry_point: EntryPoint,
        reason: String,
    },

    /// One or more entry points could not be restored during deactivation
    #[error("Failed to restore {} entry point(s): {}", .failures.len(), join_failures(.failures))]
    PatchRestore { failures: Vec<RestoreFailure> },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RecordError {
    /// Returns the boxed error as a `RecordError` if that is what it holds.
    ///
    /// Wrapped entry points report ceiling violations through the `BoxError`
    /// channel, so callers use this to tell them apart from model errors.
    pub fn from_boxed(err: &tower::BoxError) -> Option<&RecordError> {
        err.downcast_ref::<RecordError>()
    }
}

/// Failure of a scoped activation.
///
/// `output` holds what the scoped work returned when it got to run, so a
/// restore failure does not cost the caller a completed result.
#[derive(Debug)]
pub struct ScopeError<T> {
    pub error: RecordError,
    pub output: Option<T>,
}

impl<T> ScopeError<T> {
    pub fn into_output(self) -> Option<T> {
        self.output
    }
}

impl<T> std::fmt::Display for ScopeError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

impl<T: std::fmt::Debug> std::error::Error for ScopeError<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl<T> From<ScopeError<T>> for RecordError {
    fn from(err: ScopeError<T>) -> Self {
        err.error
    }
}

fn join_failures(failures: &[RestoreFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
