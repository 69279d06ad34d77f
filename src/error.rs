//! Error taxonomy for the translation pipeline.
//!
//! Each variant corresponds to the stage that produced it. Validation
//! rejections carry the rejected statement text so a caller can re-prompt
//! with corrective context; the pipeline itself never auto-corrects.

use thiserror::Error;

use crate::dialect::Dialect;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The connection handle could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// Metadata queries were rejected or returned malformed results.
    #[error("introspection error: {0}")]
    Introspection(String),

    /// The completion service failed permanently or retries were exhausted.
    #[error("completion service error: {0}")]
    CompletionService(String),

    /// The translation deadline elapsed before a usable response arrived.
    #[error("completion timed out after {attempts} attempt(s) ({elapsed_ms} ms)")]
    CompletionTimeout { attempts: u32, elapsed_ms: u64 },

    #[error("SQL syntax error: {message}")]
    Syntax { message: String, statement: String },

    #[error("unknown identifier `{identifier}`")]
    SchemaMismatch {
        identifier: String,
        statement: String,
    },

    #[error("unsafe statement: {reason}")]
    UnsafeStatement { reason: String, statement: String },

    #[error("{construct} is not supported by {dialect}")]
    UnsupportedConstruct { construct: String, dialect: Dialect },

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    pub(crate) fn unsafe_statement(reason: impl Into<String>, statement: &str) -> Self {
        PipelineError::UnsafeStatement {
            reason: reason.into(),
            statement: statement.to_string(),
        }
    }

    pub(crate) fn unsupported(construct: impl Into<String>, dialect: Dialect) -> Self {
        PipelineError::UnsupportedConstruct {
            construct: construct.into(),
            dialect,
        }
    }

    /// Statement text attached to validation rejections.
    pub fn rejected_statement(&self) -> Option<&str> {
        match self {
            PipelineError::Syntax { statement, .. }
            | PipelineError::SchemaMismatch { statement, .. }
            | PipelineError::UnsafeStatement { statement, .. } => Some(statement),
            _ => None,
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
