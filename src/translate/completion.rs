//! The text-completion capability the orchestrator drives.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Rendered prompt: system instructions plus the user turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    /// Budget for one attempt. Implementations may pass it to their transport.
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub finish_reason: Option<String>,
    pub model: Option<String>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            finish_reason: None,
            model: None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompletionError {
    /// Network failures, rate limiting and server errors.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("request timed out")]
    Timeout,

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("quota exhausted: {0}")]
    Quota(String),

    /// The service refused the request itself.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl CompletionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CompletionError::Transient(_) | CompletionError::Timeout)
    }
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(
        &self,
        prompt: &Prompt,
        options: &CompletionOptions,
    ) -> Result<Completion, CompletionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CompletionError::Transient("502".into()).is_transient());
        assert!(CompletionError::Timeout.is_transient());
        assert!(!CompletionError::Authentication("bad key".into()).is_transient());
        assert!(!CompletionError::Quota("monthly".into()).is_transient());
        assert!(!CompletionError::Rejected("context too long".into()).is_transient());
    }
}
