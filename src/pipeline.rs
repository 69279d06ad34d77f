//! One question through every stage.
//!
//! ```text
//! refresh_schema ─→ ContextBuilder ─→ translate ─→ validate ─→ adapt
//!                                                      │
//!                                   EXPLAIN (read-only, relational)
//!                                                      ↓
//!                                                  advisor
//! ```

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::advisor::{self, Recommendation};
use crate::ast::{analyze_query, Complexity};
use crate::config::Config;
use crate::context::ContextBuilder;
use crate::db::ConnectionHandle;
use crate::dialect::{self, AdaptedQuery};
use crate::error::PipelineResult;
use crate::explain::{explain_statement, parse_plan_rows, ExecutionPlan};
use crate::history::HistoryTurn;
use crate::schema::{introspect, SchemaGraph};
use crate::translate::{self, CandidateQuery, CompletionService};
use crate::validate::{self, StatementKind, ValidatedQuery};

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Allow mutating and DDL statements through adaptation.
    pub confirmed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranslationOutcome {
    pub candidate: CandidateQuery,
    pub validated: ValidatedQuery,
    pub adapted: AdaptedQuery,
    pub plan: Option<ExecutionPlan>,
    pub recommendations: Vec<Recommendation>,
    pub complexity: Complexity,
}

/// Request-scoped runner. Cheap to clone; holds no mutable state.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<Config>,
    completion: Arc<dyn CompletionService>,
}

impl Pipeline {
    pub fn new(config: Arc<Config>, completion: Arc<dyn CompletionService>) -> Self {
        Self { config, completion }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn refresh_schema(&self, handle: &ConnectionHandle) -> PipelineResult<SchemaGraph> {
        introspect(handle, &self.config.introspection).await
    }

    /// Introspect `handle` and answer `question` against a fresh schema.
    pub async fn run_translation(
        &self,
        question: &str,
        handle: &ConnectionHandle,
        history: &[HistoryTurn],
        options: RunOptions,
    ) -> PipelineResult<TranslationOutcome> {
        let schema = Arc::new(self.refresh_schema(handle).await?);
        info!(tables = schema.len(), dialect = %schema.dialect(), "schema ready");
        self.run_with_schema(question, schema, handle, history, options)
            .await
    }

    /// Answer `question` against an already introspected schema.
    pub async fn run_with_schema(
        &self,
        question: &str,
        schema: Arc<SchemaGraph>,
        handle: &ConnectionHandle,
        history: &[HistoryTurn],
        options: RunOptions,
    ) -> PipelineResult<TranslationOutcome> {
        let target = handle.dialect();
        let request = ContextBuilder::new(self.config.context.clone()).build(
            question,
            Arc::clone(&schema),
            history,
            target,
        );
        debug!(
            tables = ?request.tables.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            context_chars = request.context.len(),
            "context built"
        );

        let candidate = translate::translate(&request, self.completion.as_ref(), &self.config).await?;
        info!(attempt = candidate.attempt, "candidate received");

        let validated = validate::validate(&candidate, &schema, &self.config.validator)?;
        info!(kind = %validated.kind(), tables = validated.tables().len(), "statement validated");

        let adapted = dialect::adapt(&validated, target, options.confirmed)?;

        let plan = self.fetch_plan(handle, &validated, &adapted).await;
        let recommendations =
            advisor::analyze(&validated, plan.as_ref(), &schema, &self.config.advisor);
        let complexity = analyze_query(validated.statement()).complexity_score();
        info!(
            recommendations = recommendations.len(),
            complexity = complexity.score,
            with_plan = plan.is_some(),
            "analysis complete"
        );

        Ok(TranslationOutcome {
            candidate,
            validated,
            adapted,
            plan,
            recommendations,
            complexity,
        })
    }

    /// Plan for a read-only relational statement, or `None`. Failures only
    /// cost the plan-based findings.
    async fn fetch_plan(
        &self,
        handle: &ConnectionHandle,
        validated: &ValidatedQuery,
        adapted: &AdaptedQuery,
    ) -> Option<ExecutionPlan> {
        if !self.config.advisor.fetch_plan || validated.kind() != StatementKind::ReadOnly {
            return None;
        }
        let ConnectionHandle::Relational(conn) = handle else {
            return None;
        };
        if validated.statements().len() != 1 {
            return None;
        }
        let explain = explain_statement(conn.backend(), adapted.as_sql()?)?;

        let limit = self.config.advisor.plan_timeout();
        match tokio::time::timeout(limit, conn.query(&explain)).await {
            Ok(Ok(rows)) => {
                let plan = parse_plan_rows(conn.backend(), &rows);
                if plan.is_none() {
                    debug!(rows = rows.len(), "plan output not understood");
                }
                plan
            }
            Ok(Err(err)) => {
                warn!(error = %err, "could not fetch execution plan");
                None
            }
            Err(_) => {
                warn!(timeout_ms = limit.as_millis() as u64, "execution plan timed out");
                None
            }
        }
    }
}
