//! PostgreSQL error code classification
//!
//! The only place that knows backend SQLSTATE codes. Everything else matches on
//! [`PgErrorKind`].

/// Backend error kinds the adapter reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgErrorKind {
    /// Table or relation does not exist
    RelationDoesNotExist,
    /// Table or index already exists
    DuplicateRelation,
    DuplicateColumn,
    MissingColumn,
    DuplicateObject,
    UniqueViolation,
}

/// SQLSTATE to kind table
const ERROR_CODES: &[(&str, PgErrorKind)] = &[
    ("42P01", PgErrorKind::RelationDoesNotExist),
    ("42P07", PgErrorKind::DuplicateRelation),
    ("42701", PgErrorKind::DuplicateColumn),
    ("42703", PgErrorKind::MissingColumn),
    ("42710", PgErrorKind::DuplicateObject),
    ("23505", PgErrorKind::UniqueViolation),
];

/// Map a SQLSTATE code to its kind
pub fn kind_for_code(code: &str) -> Option<PgErrorKind> {
    ERROR_CODES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, kind)| *kind)
}

/// Classify a sqlx error by its SQLSTATE code
pub fn classify(err: &sqlx::Error) -> Option<PgErrorKind> {
    match err {
        sqlx::Error::Database(db) => db.code().and_then(|code| kind_for_code(&code)),
        _ => None,
    }
}

/// Name of the constraint that caused a database error, if reported
pub fn constraint_name(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.constraint().map(str::to_string),
        _ => None,
    }
}
