use std::fmt::Write as _;

use super::completion::Prompt;
use crate::context::TranslationRequest;
use crate::dialect::Dialect;

pub(super) fn render(request: &TranslationRequest) -> Prompt {
    let target = match request.dialect {
        Dialect::MongoDb => {
            "a single SQL SELECT statement over the collections below (it is translated into a \
             MongoDB query, so use one collection, no joins, and dotted paths for nested fields)"
                .to_string()
        }
        dialect => format!("a single {dialect} statement"),
    };
    let system = format!(
        "You are an expert SQL assistant. Convert the user's question into {target}. \
         Use only the tables and columns listed in the schema. \
         Answer with the statement in one ```sql fenced block and nothing else."
    );

    let mut user = String::new();
    let _ = writeln!(user, "Database schema:\n{}", request.context);
    if !request.history.is_empty() {
        user.push_str("\nEarlier in this conversation:\n");
        for turn in &request.history {
            let _ = writeln!(user, "- Question: {}", turn.question);
            if let Some(sql) = &turn.sql {
                let _ = writeln!(user, "  SQL: {sql}");
            }
            let _ = writeln!(user, "  Outcome: {}", turn.outcome);
        }
    }
    let _ = write!(user, "\nQuestion: {}", request.question);

    Prompt { system, user }
}
