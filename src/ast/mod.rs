/// Dialect-neutral statement tree and the passes over it.
///
/// ```text
/// SQL text (any dialect)
///       ↓
/// Parser                  (parser.rs, sqlparser frontend)
///       ↓
/// Statement tree          (types.rs)
///       ↓
/// Analysis                (analysis.rs)
///       ↓
/// Dialect-aware compiler  (compiler.rs)
/// ```
pub mod analysis;
pub mod compiler;
pub mod parser;
pub mod types;

pub use analysis::{analyze_query, Complexity, QueryAnalysis};
pub use compiler::{compile, compile_expr, compile_for};
pub use parser::{parse_single, parse_sql, parse_sql_with};
pub use types::*;
