//! # postgres-storage-adapter
//!
//! PostgreSQL storage for a schemaless object backend.
//!
//! Every class is stored in its own table whose columns follow the class
//! schema; the schemas themselves live as JSON in a metadata table. Document
//! queries, updates and aggregation pipelines are compiled into parameterized
//! SQL.
//!
//! ## Features
//!
//! - **Class Schemas**: Create classes, add and delete fields, manage indexes and permissions at runtime
//! - **Document Queries**: Comparison, membership, regex, full-text and geo constraints with `$and`/`$or`/`$nor`
//! - **Atomic Updates**: Increment, Add, AddUnique, Remove, Delete and partial nested-object updates
//! - **Aggregation**: `$match`, `$group`, `$project`, `$sort`, `$skip` and `$limit` folded into one SELECT
//! - **Transactions**: Sessions batching several writes into one database transaction
//! - **Schema Change Hooks**: Cross-process cache invalidation over LISTEN/NOTIFY
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use postgres_storage_adapter::{
//!     AdapterConfig, ClassSchema, FieldDescriptor, FieldType, QueryOptions, StorageAdapter,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AdapterConfig::builder("postgres://localhost/mydb").build();
//!     let adapter = StorageAdapter::new(config).await?;
//!     adapter.perform_initialization(&[]).await?;
//!
//!     let schema = adapter
//!         .create_class(
//!             &ClassSchema::with_default_fields("GameScore")
//!                 .field("player", FieldDescriptor::new(FieldType::String))
//!                 .field("score", FieldDescriptor::new(FieldType::Number)),
//!         )
//!         .await?;
//!
//!     let object = json!({"objectId": "a1", "player": "ada", "score": 1337});
//!     adapter
//!         .create_object(&schema, object.as_object().unwrap(), None)
//!         .await?;
//!
//!     let top = adapter
//!         .find(
//!             &schema,
//!             &json!({"score": {"$gte": 1000}}),
//!             &QueryOptions::new().with_limit(10),
//!         )
//!         .await?;
//!     println!("{} high scores", top.len());
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```rust
//! use postgres_storage_adapter::AdapterConfig;
//!
//! let config = AdapterConfig::builder("postgres://localhost/mydb")
//!     .metadata_table("_SCHEMA")      // Default metadata table name
//!     .schema_channel("schema.change") // Default notification channel
//!     .enable_schema_hooks(true)      // Listen for schema changes from other processes
//!     .max_connections(10)
//!     .build();
//! ```

pub mod adapter;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod decode;
pub mod error;
pub mod indexes;
pub mod notifier;
pub mod query;
pub mod schema;
pub mod sql;
pub mod transaction;
pub mod types;

// Re-export main types for convenience
pub use adapter::StorageAdapter;
pub use cache::SchemaCache;
pub use catalog::SchemaCatalog;
pub use config::{AdapterConfig, AdapterConfigBuilder};
pub use decode::postgres_object_to_document;
pub use error::{AdapterError, Result};
pub use indexes::{IndexChanges, IndexInfo};
pub use notifier::{SchemaChangeMessage, SchemaChangeNotifier, WatchCallback};
pub use query::{Query, QueryOptions, SortDirection, decode_query};
pub use schema::{ClassLevelPermissions, ClassSchema, join_tables_for_schema};
pub use transaction::{StatementLog, TransactionalSession};
pub use types::{ColumnType, FieldDescriptor, FieldType};

// Re-export SQL utilities for advanced users
pub use sql::ddl::DdlGenerator;
pub use sql::sanitize::quote_identifier;
