//! Statement classification module.
//!
//! Decides from SQL text alone whether a statement is expected to return a
//! tabular result, which picks the driver call path and whether a row
//! ceiling applies.

mod lexer;
mod parser;

pub use parser::{append_row_limit, classify_sql, schema_switch, SqlClassifier};

use std::fmt;

/// Whether a statement is expected to produce a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    /// Reads or introspection that return rows (SELECT, SHOW, DESCRIBE, ...).
    Projecting,
    /// Commands with no consumable result set (DDL, DML, session control).
    SideEffecting,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Projecting => write!(f, "projecting"),
            Self::SideEffecting => write!(f, "side-effecting"),
        }
    }
}

/// Result of classifying a SQL statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationResult {
    /// The determined statement kind.
    pub kind: StatementKind,
    /// First keyword of the statement, upper-cased.
    pub leading_keyword: Option<String>,
    /// Whether the text already declares a row ceiling.
    pub has_row_limit: bool,
    /// Whether a trailing `LIMIT n` is valid for this statement.
    pub accepts_row_limit: bool,
}

impl ClassificationResult {
    /// The fail-open default for text that cannot be classified.
    pub fn unknown() -> Self {
        Self {
            kind: StatementKind::Projecting,
            leading_keyword: None,
            has_row_limit: false,
            accepts_row_limit: false,
        }
    }

    /// Returns true if the statement goes down the result-returning path.
    pub fn is_projecting(&self) -> bool {
        self.kind == StatementKind::Projecting
    }

    /// Returns true if a default row ceiling should be appended.
    pub fn needs_row_limit(&self) -> bool {
        self.is_projecting() && self.accepts_row_limit && !self.has_row_limit
    }
}
