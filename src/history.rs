use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::validate::ValidatedQuery;

/// Turns kept on disk.
const MAX_TURNS: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    Succeeded { rows: Option<u64> },
    Rejected { reason: String },
    Failed { message: String },
}

impl fmt::Display for TurnOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnOutcome::Succeeded { rows: Some(n) } => write!(f, "succeeded ({n} rows)"),
            TurnOutcome::Succeeded { rows: None } => f.write_str("succeeded"),
            TurnOutcome::Rejected { reason } => write!(f, "rejected: {reason}"),
            TurnOutcome::Failed { message } => write!(f, "failed: {message}"),
        }
    }
}

/// One question and what came of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub question: String,
    pub sql: Option<String>,
    pub outcome: TurnOutcome,
    /// Tables the validated statement referenced.
    #[serde(default)]
    pub tables: Vec<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HistoryTurn {
    pub fn succeeded(question: &str, validated: &ValidatedQuery, rows: Option<u64>) -> Self {
        Self {
            question: question.to_string(),
            sql: Some(validated.sql().to_string()),
            outcome: TurnOutcome::Succeeded { rows },
            tables: validated.tables().iter().cloned().collect(),
            timestamp: chrono::Utc::now(),
        }
    }

    /// Validation rejections keep the rejected text so the next prompt can show it.
    pub fn from_error(question: &str, err: &PipelineError) -> Self {
        let outcome = match err {
            PipelineError::Syntax { .. }
            | PipelineError::SchemaMismatch { .. }
            | PipelineError::UnsafeStatement { .. } => TurnOutcome::Rejected {
                reason: err.to_string(),
            },
            _ => TurnOutcome::Failed {
                message: err.to_string(),
            },
        };
        Self {
            question: question.to_string(),
            sql: err.rejected_statement().map(str::to_string),
            outcome,
            tables: Vec::new(),
            timestamp: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationHistory {
    turns: Vec<HistoryTurn>,
    max_turns: usize,
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self {
            turns: Vec::new(),
            max_turns: MAX_TURNS,
        }
    }

    pub fn add(&mut self, turn: HistoryTurn) {
        // Don't add duplicate consecutive turns
        if let Some(last) = self.turns.last() {
            if last.question.trim() == turn.question.trim() && last.sql == turn.sql {
                return;
            }
        }

        self.turns.push(turn);

        if self.turns.len() > self.max_turns {
            let excess = self.turns.len() - self.max_turns;
            self.turns.drain(..excess);
        }
    }

    pub fn turns(&self) -> &[HistoryTurn] {
        &self.turns
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn history_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nlsql")
            .join("history.json")
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::history_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)?;
        let mut history: ConversationHistory = serde_json::from_str(&content)?;
        history.max_turns = MAX_TURNS;
        Ok(history)
    }

    /// Append `turn` to the saved history. A file that cannot be read is
    /// left untouched.
    pub fn record(turn: HistoryTurn) -> Result<()> {
        Self::record_to(&Self::history_path(), turn)
    }

    pub fn record_to(path: &Path, turn: HistoryTurn) -> Result<()> {
        let mut history = Self::load_from(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        history.add(turn);
        history.save_to(path)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::history_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(question: &str) -> HistoryTurn {
        HistoryTurn {
            question: question.to_string(),
            sql: Some(format!("SELECT '{question}'")),
            outcome: TurnOutcome::Succeeded { rows: Some(1) },
            tables: vec!["orders".into()],
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_keeps_last_twenty() {
        let mut history = ConversationHistory::new();
        for i in 0..25 {
            history.add(turn(&format!("q{i}")));
        }
        assert_eq!(history.turns().len(), 20);
        assert_eq!(history.turns()[0].question, "q5");
        assert_eq!(history.turns()[19].question, "q24");
    }

    #[test]
    fn test_skips_consecutive_duplicates() {
        let mut history = ConversationHistory::new();
        let first = turn("same");
        let repeated = HistoryTurn {
            question: "same ".into(),
            ..first.clone()
        };
        history.add(first);
        history.add(repeated);
        assert_eq!(history.turns().len(), 1);

        // same question, different statement
        history.add(HistoryTurn {
            sql: Some("SELECT 2".into()),
            ..turn("same")
        });
        assert_eq!(history.turns().len(), 2);
    }

    #[test]
    fn test_error_outcomes() {
        let rejected = HistoryTurn::from_error(
            "q",
            &PipelineError::SchemaMismatch {
                identifier: "orders.total".into(),
                statement: "SELECT total FROM orders".into(),
            },
        );
        assert!(matches!(rejected.outcome, TurnOutcome::Rejected { .. }));
        assert_eq!(rejected.sql.as_deref(), Some("SELECT total FROM orders"));

        let failed = HistoryTurn::from_error("q", &PipelineError::CompletionService("down".into()));
        assert!(matches!(failed.outcome, TurnOutcome::Failed { .. }));
        assert!(failed.sql.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir()
            .join(format!("nlsql-history-{}", std::process::id()))
            .join("history.json");
        let mut history = ConversationHistory::new();
        history.add(turn("first"));
        history.save_to(&path).unwrap();

        let loaded = ConversationHistory::load_from(&path).unwrap();
        assert_eq!(loaded.turns(), history.turns());
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_record_appends_and_keeps_unreadable_file() {
        let dir = std::env::temp_dir().join(format!("nlsql-record-{}", std::process::id()));
        let path = dir.join("history.json");

        ConversationHistory::record_to(&path, turn("first")).unwrap();
        ConversationHistory::record_to(&path, turn("second")).unwrap();
        assert_eq!(ConversationHistory::load_from(&path).unwrap().turns().len(), 2);

        std::fs::write(&path, "{not json").unwrap();
        assert!(ConversationHistory::record_to(&path, turn("third")).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{not json");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(TurnOutcome::Succeeded { rows: Some(3) }.to_string(), "succeeded (3 rows)");
        assert_eq!(
            TurnOutcome::Rejected {
                reason: "no".into()
            }
            .to_string(),
            "rejected: no"
        );
    }
}
