//! Statement classification tests through the public API.

use db_conduit::classify::{append_row_limit, classify_sql, SqlClassifier, StatementKind};
use pretty_assertions::assert_eq;

#[test]
fn test_statement_kinds() {
    let cases = [
        ("SELECT 1", StatementKind::Projecting),
        ("WITH x AS (SELECT 1) SELECT * FROM x", StatementKind::Projecting),
        ("DESCRIBE RETAIL.SALES", StatementKind::Projecting),
        ("/* audit */ SHOW TABLES", StatementKind::Projecting),
        ("-- note\nINSERT INTO t VALUES (1)", StatementKind::SideEffecting),
        ("SELECT a INTO new_t FROM b", StatementKind::SideEffecting),
        (
            "WITH src AS (SELECT 1 AS a) INSERT INTO t SELECT a FROM src",
            StatementKind::SideEffecting,
        ),
        ("OPEN SCHEMA RETAIL", StatementKind::SideEffecting),
        ("FROBNICATE everything", StatementKind::Projecting),
    ];

    let classifier = SqlClassifier::new();
    for (sql, expected) in cases {
        assert_eq!(classifier.classify(sql).kind, expected, "{sql}");
    }
}

#[test]
fn test_appended_limit_is_recognized() {
    for sql in [
        "SELECT * FROM T",
        "SELECT * FROM T -- all of it",
        "WITH x AS (SELECT 1) SELECT * FROM x",
    ] {
        assert!(classify_sql(sql).needs_row_limit(), "{sql}");
        let limited = append_row_limit(sql, 10_000);
        assert!(classify_sql(&limited).has_row_limit, "{limited}");
        assert!(!classify_sql(&limited).needs_row_limit(), "{limited}");
    }
}

#[test]
fn test_limit_inside_literal_or_subquery_is_ignored() {
    assert!(classify_sql("SELECT 'LIMIT 5' AS s FROM T").needs_row_limit());
    assert!(classify_sql("SELECT * FROM (SELECT * FROM T LIMIT 5) s").needs_row_limit());
}
