//! Retry loop around the completion service.

use std::time::Instant;

use tracing::{debug, info, warn};

use super::completion::{CompletionError, CompletionOptions, CompletionService};
use super::extract::extract_statement;
use super::prompt;
use super::CandidateQuery;
use crate::config::Config;
use crate::context::TranslationRequest;
use crate::error::{PipelineError, PipelineResult};

/// Ask `service` for a statement answering `request`.
///
/// Each attempt is bounded by `completion.request_timeout_ms` and the
/// whole call by `retry.deadline_ms`; a timed-out attempt is dropped, which
/// aborts its request. Transient failures are retried with capped
/// exponential backoff; authentication, quota and rejection errors are not.
pub async fn translate(
    request: &TranslationRequest,
    service: &dyn CompletionService,
    config: &Config,
) -> PipelineResult<CandidateQuery> {
    let policy = &config.retry;
    let started = Instant::now();
    let deadline = started + policy.deadline();
    let prompt = prompt::render(request);
    let options = CompletionOptions {
        max_tokens: config.completion.max_tokens,
        temperature: config.completion.temperature,
        timeout: config.completion.request_timeout(),
    };
    let elapsed_ms = || started.elapsed().as_millis() as u64;

    let mut attempts = 0;
    let mut timeouts = 0;
    let mut last_error: Option<CompletionError> = None;

    while attempts < policy.max_attempts {
        if attempts > 0 {
            let delay = policy.backoff(attempts);
            if Instant::now() + delay >= deadline {
                break;
            }
            debug!(attempt = attempts + 1, delay_ms = delay.as_millis() as u64, "backing off");
            tokio::time::sleep(delay).await;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        attempts += 1;

        let call = service.complete(&prompt, &options);
        let result = match tokio::time::timeout(options.timeout.min(remaining), call).await {
            Ok(result) => result,
            Err(_) => Err(CompletionError::Timeout),
        };

        match result {
            Ok(completion) => {
                let statement = extract_statement(
                    &completion.text,
                    request.dialect,
                    config.validator.allow_multi_statement,
                )?;
                info!(
                    attempt = attempts,
                    model = completion.model.as_deref().unwrap_or("unknown"),
                    "completion accepted"
                );
                return Ok(CandidateQuery {
                    raw: completion.text,
                    statement,
                    dialect: request.dialect,
                    finish_reason: completion.finish_reason,
                    model: completion.model,
                    attempt: attempts,
                });
            }
            Err(err) if err.is_transient() => {
                if err == CompletionError::Timeout {
                    timeouts += 1;
                }
                warn!(attempt = attempts, error = %err, "completion attempt failed");
                last_error = Some(err);
            }
            Err(err) => {
                warn!(attempt = attempts, error = %err, "completion failed permanently");
                return Err(PipelineError::CompletionService(err.to_string()));
            }
        }
    }

    let out_of_time = Instant::now() >= deadline || attempts < policy.max_attempts;
    if (attempts > 0 && timeouts == attempts) || out_of_time {
        return Err(PipelineError::CompletionTimeout {
            attempts,
            elapsed_ms: elapsed_ms(),
        });
    }
    let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
    Err(PipelineError::CompletionService(format!(
        "giving up after {attempts} attempt(s): {reason}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompletionConfig, ContextConfig, RetryPolicy};
    use crate::context::ContextBuilder;
    use crate::dialect::Dialect;
    use crate::testing::{shop_schema, ScriptedCompletion, Step};
    use std::sync::Arc;
    use std::time::Duration;

    fn request() -> TranslationRequest {
        ContextBuilder::new(ContextConfig::default()).build(
            "how many orders",
            Arc::new(shop_schema()),
            &[],
            Dialect::Postgres,
        )
    }

    fn fast_config() -> Config {
        Config {
            completion: CompletionConfig {
                request_timeout_ms: 50,
                ..Default::default()
            },
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 5,
                max_delay_ms: 20,
                deadline_ms: 5_000,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_first_answer_wins() {
        let service = ScriptedCompletion::new(vec![Step::Respond(
            "```sql\nSELECT COUNT(*) FROM orders;\n```".into(),
        )]);
        let candidate = translate(&request(), &service, &fast_config()).await.unwrap();
        assert_eq!(candidate.statement, "SELECT COUNT(*) FROM orders");
        assert_eq!(candidate.attempt, 1);
        assert_eq!(candidate.dialect, Dialect::Postgres);
        assert!(candidate.raw.starts_with("```sql"));
    }

    #[tokio::test]
    async fn test_two_timeouts_then_success() {
        let service = ScriptedCompletion::new(vec![
            Step::Hang,
            Step::Hang,
            Step::Respond("SELECT 1".into()),
        ]);
        let candidate = translate(&request(), &service, &fast_config()).await.unwrap();
        assert_eq!(candidate.attempt, 3);
        assert_eq!(candidate.statement, "SELECT 1");
        assert_eq!(service.calls(), 3);
    }

    #[tokio::test]
    async fn test_every_attempt_timing_out() {
        let service = ScriptedCompletion::new(vec![Step::Hang, Step::Hang, Step::Hang]);
        let err = translate(&request(), &service, &fast_config()).await.unwrap_err();
        assert!(matches!(err, PipelineError::CompletionTimeout { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_deadline_cuts_retries_short() {
        let mut config = fast_config();
        config.retry.deadline_ms = 80;
        config.retry.max_attempts = 10;
        let service = ScriptedCompletion::new(vec![Step::Hang; 10]);
        let started = Instant::now();
        let err = translate(&request(), &service, &config).await.unwrap_err();
        assert!(matches!(err, PipelineError::CompletionTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(service.calls() < 10);
    }

    #[tokio::test]
    async fn test_transient_errors_exhaust_retries() {
        let service = ScriptedCompletion::new(vec![
            Step::Fail(CompletionError::Transient("503".into())),
            Step::Fail(CompletionError::Transient("503".into())),
            Step::Fail(CompletionError::Transient("503".into())),
        ]);
        let err = translate(&request(), &service, &fast_config()).await.unwrap_err();
        match err {
            PipelineError::CompletionService(msg) => assert!(msg.contains("3 attempt")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        for error in [
            CompletionError::Authentication("bad key".into()),
            CompletionError::Quota("exhausted".into()),
            CompletionError::Rejected("bad request".into()),
        ] {
            let service = ScriptedCompletion::new(vec![
                Step::Fail(error),
                Step::Respond("SELECT 1".into()),
            ]);
            let err = translate(&request(), &service, &fast_config()).await.unwrap_err();
            assert!(matches!(err, PipelineError::CompletionService(_)));
            assert_eq!(service.calls(), 1);
        }
    }

    #[tokio::test]
    async fn test_empty_response_is_not_retried() {
        let service = ScriptedCompletion::new(vec![
            Step::Respond("   ".into()),
            Step::Respond("SELECT 1".into()),
        ]);
        let err = translate(&request(), &service, &fast_config()).await.unwrap_err();
        assert!(matches!(err, PipelineError::CompletionService(_)));
        assert_eq!(service.calls(), 1);
    }

    #[tokio::test]
    async fn test_stacked_statements_rejected() {
        let service = ScriptedCompletion::new(vec![Step::Respond(
            "SELECT 1; DELETE FROM orders".into(),
        )]);
        let err = translate(&request(), &service, &fast_config()).await.unwrap_err();
        assert!(matches!(err, PipelineError::UnsafeStatement { .. }));
    }
}
