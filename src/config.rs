//! Process-wide configuration.
//!
//! Loaded once at startup from `<config_dir>/nlsql/config.toml` and shared
//! read-only (`Arc<Config>`) by every pipeline run. Every field has a
//! default, so an absent or partial file is valid.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub completion: CompletionConfig,
    pub retry: RetryPolicy,
    pub context: ContextConfig,
    pub validator: ValidatorConfig,
    pub advisor: AdvisorConfig,
    pub introspection: IntrospectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompletionConfig {
    /// OpenAI-compatible chat completions endpoint.
    pub endpoint: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Per-attempt timeout.
    pub request_timeout_ms: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.groq.com/openai/v1/chat/completions".into(),
            model: "llama3-70b-8192".into(),
            api_key_env: "NLSQL_API_KEY".into(),
            max_tokens: 1024,
            temperature: 0.0,
            request_timeout_ms: 20_000,
        }
    }
}

impl CompletionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Hard wall-clock deadline for one translation, retries included.
    pub deadline_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 4_000,
            deadline_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base doubled per retry, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        let delay = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContextConfig {
    /// Maximum serialized schema context, in characters.
    pub max_chars: usize,
    /// Number of prior turns carried into a request.
    pub history_window: usize,
    pub fk_depth: usize,
    pub fk_decay: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_chars: 6_000,
            history_window: 5,
            fk_depth: 2,
            fk_decay: 0.5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidatorConfig {
    pub allow_multi_statement: bool,
    pub allow_mutating: bool,
    pub allow_ddl: bool,
    /// Overrides the backend's identifier matching rule when set.
    pub case_insensitive: Option<bool>,
    /// Extra functions to reject in addition to the built-in denylist.
    pub denied_functions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdvisorConfig {
    /// Tables with fewer estimated rows are never flagged for indexes or scans.
    pub row_count_threshold: u64,
    /// Ask the backend for a plan before analysis (read-only statements only).
    pub fetch_plan: bool,
    /// Minimum selectivity ratio between two predicates to flag their order.
    pub filter_order_ratio: f64,
    /// Time allowed for the backend to return a plan.
    pub plan_timeout_ms: u64,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            row_count_threshold: 10_000,
            fetch_plan: true,
            filter_order_ratio: 10.0,
            plan_timeout_ms: 2_000,
        }
    }
}

impl AdvisorConfig {
    pub fn plan_timeout(&self) -> Duration {
        Duration::from_millis(self.plan_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IntrospectionConfig {
    /// Upper bound on concurrent per-table metadata queries.
    pub max_concurrency: usize,
    pub document_sample_size: usize,
    /// Schema (PostgreSQL) or database (MySQL) to introspect; backend default when empty.
    pub schema: String,
    /// Time allowed for each metadata query.
    pub query_timeout_ms: u64,
}

impl Default for IntrospectionConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            document_sample_size: 100,
            schema: String::new(),
            query_timeout_ms: 10_000,
        }
    }
}

impl IntrospectionConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl Config {
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nlsql")
            .join("config.toml")
    }

    /// Load from the default location, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("Invalid {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.introspection.max_concurrency == 0 {
            anyhow::bail!("introspection.max_concurrency must be at least 1");
        }
        if self.introspection.query_timeout_ms == 0 || self.advisor.plan_timeout_ms == 0 {
            anyhow::bail!("introspection.query_timeout_ms and advisor.plan_timeout_ms must be positive");
        }
        if !(0.0..=1.0).contains(&self.context.fk_decay) {
            anyhow::bail!("context.fk_decay must be within 0..=1");
        }
        Ok(())
    }
}
