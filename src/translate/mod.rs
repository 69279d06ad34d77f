//! Natural-language question to candidate statement.
//!
//! ```text
//! TranslationRequest
//!       ↓
//! prompt.rs         (system instructions, context, history, question)
//!       ↓
//! orchestrator.rs   (timeout, retry, deadline around CompletionService)
//!       ↓
//! extract.rs        (fenced block, trailing `;`, statement count)
//!       ↓
//! CandidateQuery    (untrusted until validated)
//! ```

mod completion;
mod extract;
mod http;
mod orchestrator;
mod prompt;

use serde::Serialize;

use crate::dialect::Dialect;

pub use completion::{Completion, CompletionError, CompletionOptions, CompletionService, Prompt};
pub use http::HttpCompletionClient;
pub use orchestrator::translate;

/// Model output reduced to one statement. Nothing downstream trusts it
/// before validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateQuery {
    pub raw: String,
    pub statement: String,
    /// Dialect the model was asked for.
    pub dialect: Dialect,
    pub finish_reason: Option<String>,
    pub model: Option<String>,
    /// 1-based attempt that produced it.
    pub attempt: u32,
}
