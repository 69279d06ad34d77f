use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nlsql::config::Config;
use nlsql::db::{find_saved_connection, ConnectionConfig, ConnectionHandle, PgConnection};
use nlsql::dialect::AdaptedQuery;
use nlsql::history::{ConversationHistory, HistoryTurn};
use nlsql::translate::HttpCompletionClient;
use nlsql::{Pipeline, RunOptions, TranslationOutcome};

/// Ask questions of a database in plain language
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Log pipeline stages to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Translate a question into a validated statement
    Ask {
        question: String,
        /// Saved connection name
        #[arg(long = "connect")]
        connect: String,
        /// Allow mutating and DDL statements
        #[arg(long)]
        confirm: bool,
        /// Print the full outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the introspected schema
    Schema {
        #[arg(long = "connect")]
        connect: String,
    },
    /// Show or clear the conversation history
    History {
        #[arg(long)]
        clear: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Ask {
            question,
            connect,
            confirm,
            json,
        } => ask(&question, &connect, confirm, json).await,
        Command::Schema { connect } => schema(&connect).await,
        Command::History { clear } => history(clear),
    }
}

/// Resolve password: PGPASSWORD env var, then interactive prompt.
fn resolve_password(config: &mut ConnectionConfig) -> Result<()> {
    if !config.password.is_empty() {
        return Ok(());
    }
    if let Ok(pw) = std::env::var("PGPASSWORD") {
        config.password = pw;
    } else {
        let prompt = format!("Password for {}: ", config.display_string());
        config.password = rpassword::read_password_from_tty(Some(&prompt))?;
    }
    Ok(())
}

async fn open(name: &str) -> Result<ConnectionHandle> {
    let mut config = find_saved_connection(name)?;
    resolve_password(&mut config)?;
    let conn = PgConnection::connect(&config)
        .await
        .with_context(|| format!("Failed to connect to {}", config.display_string()))?;
    Ok(ConnectionHandle::Relational(Arc::new(conn)))
}

async fn ask(question: &str, connect: &str, confirm: bool, json: bool) -> Result<()> {
    let config = Arc::new(Config::load()?);
    let client = HttpCompletionClient::from_config(&config.completion)?;
    let pipeline = Pipeline::new(config, Arc::new(client));
    let handle = open(connect).await?;

    let history = match ConversationHistory::load() {
        Ok(history) => history.turns().to_vec(),
        Err(err) => {
            tracing::warn!(error = %err, "could not read history; continuing without it");
            Vec::new()
        }
    };
    let result = pipeline
        .run_translation(question, &handle, &history, RunOptions { confirmed: confirm })
        .await;

    let turn = match &result {
        Ok(outcome) => HistoryTurn::succeeded(question, &outcome.validated, None),
        Err(err) => HistoryTurn::from_error(question, err),
    };
    if let Err(err) = ConversationHistory::record(turn) {
        tracing::warn!(error = %err, "history not recorded");
    }

    let outcome = result?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome)?;
    }
    Ok(())
}

fn print_outcome(outcome: &TranslationOutcome) -> Result<()> {
    match &outcome.adapted {
        AdaptedQuery::Sql(sql) => println!("{sql};"),
        AdaptedQuery::Document(spec) => println!("{}", serde_json::to_string_pretty(spec)?),
    }
    println!(
        "\n-- {} statement, complexity {}/10",
        outcome.validated.kind(),
        outcome.complexity.score
    );
    for note in outcome.validated.notes() {
        println!("-- note: {note}");
    }
    for rec in &outcome.recommendations {
        println!("-- [{}] {}: {}", rec.severity, rec.kind, rec.message);
        if let Some(suggestion) = &rec.suggestion {
            println!("--     {suggestion}");
        }
    }
    Ok(())
}

async fn schema(connect: &str) -> Result<()> {
    let config = Arc::new(Config::load()?);
    let handle = open(connect).await?;
    let graph = nlsql::schema::introspect(&handle, &config.introspection).await?;

    for table in graph.tables() {
        let rows = table
            .row_count
            .map(|n| format!(", ~{n} rows"))
            .unwrap_or_default();
        println!("{} ({}{rows})", table.name, table.kind.label());
        for column in &table.columns {
            let key = if table.primary_key.contains(&column.name) {
                " PK"
            } else {
                ""
            };
            let null = if column.nullable { "" } else { " NOT NULL" };
            println!("  {} {}{key}{null}", column.name, column.data_type);
        }
        for fk in &table.foreign_keys {
            println!("  {} -> {}.{}", fk.column, fk.target_table, fk.target_column);
        }
    }
    Ok(())
}

fn history(clear: bool) -> Result<()> {
    let mut history = ConversationHistory::load()?;
    if clear {
        history.clear();
        history.save()?;
        println!("History cleared.");
        return Ok(());
    }
    for turn in history.turns() {
        println!(
            "{}  {}",
            turn.timestamp.format("%Y-%m-%d %H:%M"),
            turn.question
        );
        if let Some(sql) = &turn.sql {
            println!("    {sql}");
        }
        println!("    {}", turn.outcome);
    }
    Ok(())
}
