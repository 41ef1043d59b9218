//! Keyword-based statement classification.
//!
//! Inspects the first keyword of the comment-stripped statement against two
//! fixed sets. Anything unrecognized is treated as projecting: asking for a
//! result set that never arrives is recoverable, while sending a
//! row-producing statement down the no-result path silently loses rows.

use super::lexer::{lex, Lexeme};
use super::{ClassificationResult, StatementKind};

/// Leading keywords of statements that return rows.
const PROJECTING_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "SHOW", "DESCRIBE", "DESC", "EXPLAIN", "FETCH", "VALUES", "TABLE",
];

/// Leading keywords of commands with no consumable result set.
const SIDE_EFFECTING_KEYWORDS: &[&str] = &[
    // DDL
    "CREATE", "ALTER", "DROP", "RENAME", "COMMENT", "TRUNCATE",
    // DML
    "INSERT", "UPDATE", "DELETE", "MERGE", "IMPORT", "EXPORT", "COPY",
    // Privileges
    "GRANT", "REVOKE",
    // Session and transaction control
    "OPEN", "CLOSE", "SET", "USE", "BEGIN", "START", "COMMIT", "ROLLBACK", "SAVEPOINT",
    "RELEASE", "DISCARD", "RESET", "LOCK",
    // Maintenance
    "ANALYZE", "VACUUM", "REINDEX", "RECOMPRESS", "PRELOAD", "FLUSH", "KILL", "REFRESH",
];

/// Statements a trailing `LIMIT n` can be appended to.
const LIMITABLE_KEYWORDS: &[&str] = &["SELECT", "WITH", "VALUES", "TABLE"];

/// Keywords that can start the main statement after a CTE list.
const MAIN_STATEMENT_KEYWORDS: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "MERGE", "VALUES", "TABLE",
];

const WRITING_MAIN_STATEMENTS: &[&str] = &["INSERT", "UPDATE", "DELETE", "MERGE"];

/// SQL classifier over comment-stripped lexemes.
#[derive(Debug, Default)]
pub struct SqlClassifier;

impl SqlClassifier {
    /// Creates a new SQL classifier.
    pub fn new() -> Self {
        Self
    }

    /// Classifies a SQL string.
    pub fn classify(&self, sql: &str) -> ClassificationResult {
        let lexed = lex(sql);
        let lexemes = statement_body(&lexed.lexemes);

        let Some(keyword) = lexemes.first().and_then(Lexeme::keyword) else {
            return ClassificationResult::unknown();
        };

        let kind = if SIDE_EFFECTING_KEYWORDS.contains(&keyword) {
            StatementKind::SideEffecting
        } else if PROJECTING_KEYWORDS.contains(&keyword) && writes_output(keyword, lexemes) {
            StatementKind::SideEffecting
        } else {
            StatementKind::Projecting
        };

        ClassificationResult {
            kind,
            leading_keyword: Some(keyword.to_string()),
            has_row_limit: declares_row_limit(lexemes),
            accepts_row_limit: LIMITABLE_KEYWORDS.contains(&keyword),
        }
    }
}

/// Convenience function to classify SQL without creating a classifier instance.
pub fn classify_sql(sql: &str) -> ClassificationResult {
    SqlClassifier::new().classify(sql)
}

/// Appends a row ceiling to a statement.
///
/// The ceiling goes on its own line when the text ends in a line comment,
/// which would otherwise swallow it.
pub fn append_row_limit(sql: &str, limit: usize) -> String {
    if lex(sql).ends_in_line_comment {
        format!("{sql}\nLIMIT {limit}")
    } else {
        format!("{sql} LIMIT {limit}")
    }
}

/// Returns the schema a session-control statement switches to, if any.
///
/// Recognizes `OPEN SCHEMA s`, `USE s`, `SET SCHEMA s`, and
/// `SET search_path TO s` / `SET search_path = s`.
pub fn schema_switch(sql: &str) -> Option<String> {
    let lexed = lex(sql);
    let lexemes = statement_body(&lexed.lexemes);

    let name = match lexemes {
        [open, schema, name, ..] if open.is_keyword("OPEN") && schema.is_keyword("SCHEMA") => {
            name
        }
        [use_kw, name, ..] if use_kw.is_keyword("USE") => name,
        [set, schema, rest @ ..] if set.is_keyword("SET") && schema.is_keyword("SCHEMA") => {
            skip_assignment(rest).first()?
        }
        [set, path, rest @ ..] if set.is_keyword("SET") && path.is_keyword("SEARCH_PATH") => {
            skip_assignment(rest).first()?
        }
        _ => return None,
    };

    name.name().map(String::from)
}

/// Drops leading separators and parentheses.
fn statement_body(lexemes: &[Lexeme]) -> &[Lexeme] {
    let start = lexemes
        .iter()
        .position(|l| !matches!(l, Lexeme::Open | Lexeme::Separator))
        .unwrap_or(lexemes.len());
    &lexemes[start..]
}

fn skip_assignment(lexemes: &[Lexeme]) -> &[Lexeme] {
    match lexemes.first() {
        Some(l) if l.is_keyword("TO") => &lexemes[1..],
        Some(Lexeme::Other(op)) if op == "=" => &lexemes[1..],
        _ => lexemes,
    }
}

/// Whether a read-led statement persists its output somewhere.
fn writes_output(keyword: &str, lexemes: &[Lexeme]) -> bool {
    match keyword {
        "SELECT" => contains_keyword(lexemes, "INTO"),
        "WITH" => match main_statement(lexemes) {
            Some(main) if WRITING_MAIN_STATEMENTS.contains(&main) => true,
            Some("SELECT") => contains_keyword(lexemes, "INTO"),
            _ => false,
        },
        _ => false,
    }
}

fn contains_keyword(lexemes: &[Lexeme], keyword: &str) -> bool {
    lexemes.iter().any(|l| l.is_keyword(keyword))
}

/// First statement keyword after a CTE list, at the depth of the `WITH`.
fn main_statement(lexemes: &[Lexeme]) -> Option<&str> {
    top_level(lexemes)
        .skip(1)
        .filter_map(Lexeme::keyword)
        .find(|k| MAIN_STATEMENT_KEYWORDS.contains(k))
}

/// Whether the statement already bounds its row count at top level.
fn declares_row_limit(lexemes: &[Lexeme]) -> bool {
    let top: Vec<&Lexeme> = top_level(lexemes).collect();

    let limit_or_fetch = top.windows(2).any(|pair| {
        pair[0].is_keyword("LIMIT")
            || (pair[0].is_keyword("FETCH")
                && (pair[1].is_keyword("FIRST") || pair[1].is_keyword("NEXT")))
    }) || top.last().is_some_and(|l| l.is_keyword("LIMIT"));

    let top_n = top.windows(2).any(|pair| {
        pair[0].is_keyword("SELECT") && pair[1].is_keyword("TOP")
    }) || top.windows(3).any(|w| {
        w[0].is_keyword("SELECT") && w[1].is_keyword("DISTINCT") && w[2].is_keyword("TOP")
    });

    limit_or_fetch || top_n
}

/// Lexemes at parenthesis depth zero.
fn top_level(lexemes: &[Lexeme]) -> impl Iterator<Item = &Lexeme> {
    let mut depth: i32 = 0;
    lexemes.iter().filter(move |l| match l {
        Lexeme::Open => {
            depth += 1;
            false
        }
        Lexeme::Close => {
            depth -= 1;
            false
        }
        _ => depth == 0,
    })
}
