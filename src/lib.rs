pub mod ast;
pub mod config;
pub mod context;
pub mod db;
pub mod dialect;
pub mod error;
pub mod explain;
pub mod history;
pub mod pipeline;
pub mod schema;
pub mod translate;

mod advisor;
mod validate;

#[cfg(test)]
mod testing;

pub use advisor::{Recommendation, RecommendationKind, Severity};
pub use error::{PipelineError, PipelineResult};
pub use pipeline::{Pipeline, RunOptions, TranslationOutcome};
pub use validate::{ColumnRef, StatementKind, ValidatedQuery};
