//! Configuration for StorageAdapter
//!
//! Provides a builder pattern for configuring the adapter.

use std::time::Duration;

/// Configuration for the storage adapter
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// PostgreSQL database URL
    pub database_url: String,
    /// Name of the schema metadata table (default: "_SCHEMA")
    pub metadata_table: String,
    /// Notification channel for schema changes (default: "schema.change")
    pub schema_channel: String,
    /// Whether to listen for schema changes from other processes
    pub enable_schema_hooks: bool,
    /// Maximum pooled connections
    pub max_connections: u32,
    /// Default per-query execution time limit for reads
    pub max_query_time: Option<Duration>,
}

impl AdapterConfig {
    /// Create a new configuration builder
    pub fn builder(database_url: impl Into<String>) -> AdapterConfigBuilder {
        AdapterConfigBuilder::new(database_url)
    }
}

/// Builder for AdapterConfig
#[derive(Debug)]
pub struct AdapterConfigBuilder {
    database_url: String,
    metadata_table: String,
    schema_channel: String,
    enable_schema_hooks: bool,
    max_connections: u32,
    max_query_time: Option<Duration>,
}

impl AdapterConfigBuilder {
    /// Create a new builder with the database URL
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            metadata_table: "_SCHEMA".to_string(),
            schema_channel: "schema.change".to_string(),
            enable_schema_hooks: false,
            max_connections: 10,
            max_query_time: None,
        }
    }

    /// Set the metadata table name (default: "_SCHEMA")
    pub fn metadata_table(mut self, name: impl Into<String>) -> Self {
        self.metadata_table = name.into();
        self
    }

    /// Set the schema change channel (default: "schema.change")
    pub fn schema_channel(mut self, channel: impl Into<String>) -> Self {
        self.schema_channel = channel.into();
        self
    }

    /// Enable or disable cross-process schema change notifications (default: false)
    pub fn enable_schema_hooks(mut self, enabled: bool) -> Self {
        self.enable_schema_hooks = enabled;
        self
    }

    /// Set the connection pool size (default: 10)
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Set a default execution time limit for reads
    pub fn max_query_time(mut self, limit: Duration) -> Self {
        self.max_query_time = Some(limit);
        self
    }

    /// Build the configuration
    pub fn build(self) -> AdapterConfig {
        AdapterConfig {
            database_url: self.database_url,
            metadata_table: self.metadata_table,
            schema_channel: self.schema_channel,
            enable_schema_hooks: self.enable_schema_hooks,
            max_connections: self.max_connections,
            max_query_time: self.max_query_time,
        }
    }
}
