//! Parameterized SQL building
//!
//! A [`SqlBuilder`] owns its parameter list and hands out positional
//! placeholders. Nested fragments are built by a child builder that starts where
//! the parent currently ends, and are folded back with [`SqlBuilder::absorb`].

use chrono::{DateTime, Utc};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::Postgres;

/// A value bound to a positional placeholder
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    TextArray(Vec<String>),
    Json(serde_json::Value),
    Timestamp(DateTime<Utc>),
}

impl SqlParam {
    /// Bind this value to the next placeholder of `query`
    pub fn bind<'q>(
        &'q self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> Query<'q, Postgres, PgArguments> {
        match self {
            SqlParam::Null => query.bind(None::<String>),
            SqlParam::Bool(v) => query.bind(*v),
            SqlParam::Int(v) => query.bind(*v),
            SqlParam::Float(v) => query.bind(*v),
            SqlParam::Text(v) => query.bind(v.as_str()),
            SqlParam::TextArray(v) => query.bind(v.as_slice()),
            SqlParam::Json(v) => query.bind(v),
            SqlParam::Timestamp(v) => query.bind(*v),
        }
    }
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        SqlParam::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        SqlParam::Text(value)
    }
}

impl From<f64> for SqlParam {
    fn from(value: f64) -> Self {
        SqlParam::Float(value)
    }
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        SqlParam::Int(value)
    }
}

impl From<bool> for SqlParam {
    fn from(value: bool) -> Self {
        SqlParam::Bool(value)
    }
}

/// Collects parameters and hands out their placeholders
#[derive(Debug, Clone, Default)]
pub struct SqlBuilder {
    /// Number of placeholders used before this builder's first one
    offset: usize,
    params: Vec<SqlParam>,
}

impl SqlBuilder {
    /// Builder whose first placeholder is `$start`
    pub fn starting_at(start: usize) -> Self {
        Self {
            offset: start.saturating_sub(1),
            params: Vec::new(),
        }
    }

    /// Add a parameter and return its placeholder (`$n`)
    pub fn push(&mut self, param: impl Into<SqlParam>) -> String {
        self.params.push(param.into());
        format!("${}", self.offset + self.params.len())
    }

    /// Index the next pushed parameter will get
    pub fn next_index(&self) -> usize {
        self.offset + self.params.len() + 1
    }

    /// Child builder continuing from the current position
    pub fn child(&self) -> SqlBuilder {
        SqlBuilder::starting_at(self.next_index())
    }

    /// Append a child's parameters; the child must come from [`Self::child`]
    pub fn absorb(&mut self, child: SqlBuilder) {
        debug_assert_eq!(child.offset, self.offset + self.params.len());
        self.params.extend(child.params);
    }

    pub fn params(&self) -> &[SqlParam] {
        &self.params
    }

    pub fn into_params(self) -> Vec<SqlParam> {
        self.params
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// A complete statement with its parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl SqlStatement {
    pub fn new(sql: impl Into<String>, params: Vec<SqlParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// Statement without parameters
    pub fn raw(sql: impl Into<String>) -> Self {
        Self::new(sql, Vec::new())
    }

    /// Wrap the statement so each row comes back as one `jsonb` column named `doc`
    pub fn into_json_rows(self) -> Self {
        Self {
            sql: format!(
                "WITH _rows AS ({}) SELECT to_jsonb(_rows) AS doc FROM _rows",
                self.sql
            ),
            params: self.params,
        }
    }

    /// sqlx query with all parameters bound
    pub fn query(&self) -> Query<'_, Postgres, PgArguments> {
        self.params
            .iter()
            .fold(sqlx::query(&self.sql), |query, param| param.bind(query))
    }
}

/// Distinct `$n` placeholders referenced by a SQL fragment
pub fn placeholders(sql: &str) -> std::collections::BTreeSet<usize> {
    let mut found = std::collections::BTreeSet::new();
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if end > start {
                if let Ok(n) = sql[start..end].parse() {
                    found.insert(n);
                }
            }
            i = end.max(i + 1);
        } else {
            i += 1;
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_returns_increasing_placeholders() {
        let mut builder = SqlBuilder::starting_at(1);
        assert_eq!(builder.push("a"), "$1");
        assert_eq!(builder.push(2.0), "$2");
        assert_eq!(builder.next_index(), 3);
    }

    #[test]
    fn test_starting_offset() {
        let mut builder = SqlBuilder::starting_at(5);
        assert_eq!(builder.push(true), "$5");
        assert_eq!(builder.len(), 1);
    }

    #[test]
    fn test_child_continues_numbering() {
        let mut parent = SqlBuilder::starting_at(2);
        parent.push("x");
        let mut child = parent.child();
        assert_eq!(child.push("y"), "$3");
        assert_eq!(child.push("z"), "$4");
        parent.absorb(child);
        assert_eq!(parent.push("w"), "$5");
        assert_eq!(
            parent.params(),
            &[
                SqlParam::from("x"),
                SqlParam::from("y"),
                SqlParam::from("z"),
                SqlParam::from("w")
            ]
        );
    }

    #[test]
    fn test_into_json_rows_keeps_params() {
        let statement = SqlStatement::new("SELECT * FROM \"T\" WHERE \"a\" = $1", vec![SqlParam::Int(1)])
            .into_json_rows();
        assert_eq!(
            statement.sql,
            "WITH _rows AS (SELECT * FROM \"T\" WHERE \"a\" = $1) SELECT to_jsonb(_rows) AS doc FROM _rows"
        );
        assert_eq!(statement.params, vec![SqlParam::Int(1)]);
    }

    #[test]
    fn test_placeholders() {
        let found = placeholders("\"a\" = $1 AND (\"b\" <> $2 OR \"b\" IS NULL) AND $10 > 0");
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec![1, 2, 10]);
        assert!(placeholders("SELECT 1").is_empty());
    }
}
