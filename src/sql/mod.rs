//! SQL generation for the storage adapter
//!
//! Pure compilers from documents, queries, updates and pipelines to
//! parameterized SQL, plus DDL generation and backend error classification.

pub mod aggregate;
pub mod builder;
pub mod codes;
pub mod ddl;
pub mod literal;
pub mod regex;
pub mod sanitize;
pub mod update;
pub mod where_clause;

pub use aggregate::{AggregateQuery, compile_pipeline, finish_aggregate_rows};
pub use builder::{SqlBuilder, SqlParam, SqlStatement};
pub use ddl::DdlGenerator;
pub use sanitize::{quote_identifier, transform_dot_field, validate_class_name};
pub use update::{compile_insert, compile_update};
pub use where_clause::{WhereClause, build_order_by_clause, build_where_clause};
