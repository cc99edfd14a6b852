//! StorageAdapter - entry point for class schemas and documents in PostgreSQL
//!
//! Each class lives in its own table; class schemas live in the metadata table.
//! Queries, updates and aggregation pipelines are compiled by the `sql` module
//! and run here, on the pool or on a [`TransactionalSession`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

use indexmap::IndexMap;
use regex::Regex;
use serde_json::{Map, Value};
use sqlx::postgres::{PgPoolOptions, PgQueryResult};
use sqlx::{PgConnection, PgExecutor, PgPool, Row};
use tracing::{debug, info, warn};

use crate::cache::SchemaCache;
use crate::catalog::SchemaCatalog;
use crate::config::AdapterConfig;
use crate::decode::postgres_object_to_document;
use crate::error::{AdapterError, Result};
use crate::indexes::{IndexChanges, IndexInfo, diff_indexes, index_key_from_definition};
use crate::notifier::{SchemaChangeNotifier, WatchCallback};
use crate::query::{Query, QueryOptions, decode_query};
use crate::schema::{ClassLevelPermissions, ClassSchema, IndexKey, is_join_table, join_table_name};
use crate::sql::aggregate::{compile_pipeline, finish_aggregate_rows};
use crate::sql::builder::{SqlBuilder, SqlParam, SqlStatement};
use crate::sql::codes::{PgErrorKind, classify, constraint_name};
use crate::sql::ddl::{DdlGenerator, default_index_name, unique_constraint_name};
use crate::sql::sanitize::{
    quote_identifier, transform_dot_field_to_components, validate_class_name,
};
use crate::sql::update::{compile_insert, compile_update};
use crate::sql::where_clause::{WhereClause, build_order_by_clause, build_where_clause};
use crate::transaction::TransactionalSession;
use crate::types::{FieldDescriptor, FieldType};

/// Internal tables dropped by [`StorageAdapter::delete_all_classes`]
const INTERNAL_TABLES: &[&str] = &[
    "_PushStatus",
    "_JobStatus",
    "_JobSchedule",
    "_Hooks",
    "_GlobalConfig",
    "_GraphQLConfig",
    "_Audience",
    "_Idempotency",
];

static DUPLICATED_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"unique_([a-zA-Z]+)").expect("valid regex"));

type Document = Map<String, Value>;

/// PostgreSQL storage adapter
///
/// Statements are compiled by the `sql` module; this type owns
/// the pool, the schema catalog and cache, and the schema change notifier.
pub struct StorageAdapter {
    pool: PgPool,
    config: AdapterConfig,
    catalog: SchemaCatalog,
    cache: SchemaCache,
    notifier: SchemaChangeNotifier,
    cache_watch_registered: AtomicBool,
}

impl StorageAdapter {
    /// Connect using the configuration
    ///
    /// This will:
    /// 1. Open a connection pool
    /// 2. Create the metadata table if it doesn't exist
    pub async fn new(config: AdapterConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await
            .map_err(|e| AdapterError::Connection(format!("Database connection failed: {}", e)))?;
        info!(max_connections = config.max_connections, "connected to database");
        Self::from_pool(pool, config).await
    }

    /// Create an adapter on an existing pool
    pub async fn from_pool(pool: PgPool, config: AdapterConfig) -> Result<Self> {
        let adapter = Self {
            catalog: SchemaCatalog::new(&config.metadata_table),
            cache: SchemaCache::new(),
            notifier: SchemaChangeNotifier::new(&config.schema_channel),
            cache_watch_registered: AtomicBool::new(false),
            pool,
            config,
        };
        adapter.ensure_metadata_table().await?;
        Ok(adapter)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn cache(&self) -> &SchemaCache {
        &self.cache
    }

    pub fn notifier(&self) -> &SchemaChangeNotifier {
        &self.notifier
    }

    /// Random id this instance publishes schema changes under
    pub fn sender_id(&self) -> &str {
        self.notifier.sender_id()
    }

    fn ddl(&self) -> DdlGenerator<'_> {
        DdlGenerator::new(&self.config)
    }

    async fn ensure_metadata_table(&self) -> Result<()> {
        run_ddl(&self.pool, &self.ddl().create_metadata_table()).await
    }

    async fn schema_changed(&self, class_name: &str) {
        self.cache.invalidate(class_name).await;
        self.notifier.publish(&self.pool).await;
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Prepare the database for use
    ///
    /// Creates the metadata table, installs the helper functions compiled
    /// statements rely on, creates the tables of `volatile_classes`, and starts
    /// listening for schema changes when hooks are enabled.
    pub async fn perform_initialization(&self, volatile_classes: &[ClassSchema]) -> Result<()> {
        self.ensure_metadata_table().await?;

        for schema in volatile_classes {
            for statement in self.ddl().create_class_table(schema)? {
                match run_ddl(&self.pool, &statement).await {
                    Ok(()) => {}
                    Err(err)
                        if matches!(
                            err.pg_kind(),
                            Some(PgErrorKind::DuplicateRelation | PgErrorKind::UniqueViolation)
                        ) =>
                    {
                        warn!(class = %schema.class_name, error = %err, "table created concurrently");
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        let mut tx = self.pool.begin().await?;
        for function in self.ddl().helper_functions() {
            run_ddl(&mut *tx, &function).await?;
        }
        tx.commit().await?;

        if self.config.enable_schema_hooks {
            if !self.cache_watch_registered.swap(true, Ordering::SeqCst) {
                let cache = self.cache.clone();
                self.notifier
                    .watch(Arc::new(move || {
                        let cache = cache.clone();
                        tokio::spawn(async move { cache.clear().await });
                    }))
                    .await;
            }
            self.notifier.listen(&self.pool).await?;
        }

        info!(
            volatile_classes = volatile_classes.len(),
            hooks = self.config.enable_schema_hooks,
            "storage adapter initialized"
        );
        Ok(())
    }

    /// Stop listening, drop cached schemas and close the pool
    pub async fn handle_shutdown(&self) {
        self.notifier.shutdown().await;
        self.cache.clear().await;
        self.pool.close().await;
        info!("storage adapter shut down");
    }

    /// Run `callback` whenever another instance changes a schema
    pub async fn watch(&self, callback: WatchCallback) {
        self.notifier.watch(callback).await;
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    pub async fn create_transactional_session(&self) -> Result<TransactionalSession> {
        TransactionalSession::begin(&self.pool).await
    }

    pub async fn commit_transactional_session(&self, session: TransactionalSession) -> Result<()> {
        session.commit().await
    }

    pub async fn abort_transactional_session(&self, session: TransactionalSession) -> Result<()> {
        session.abort().await
    }

    // =========================================================================
    // Schema Operations
    // =========================================================================

    /// Whether a table named `class_name` exists
    pub async fn class_exists(&self, class_name: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = $1) AS found",
        )
        .bind(class_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("found")?)
    }

    /// Create a class: its table, join tables, catalog row and indexes
    ///
    /// Runs in one transaction. Fails with [`AdapterError::DuplicateClass`] if
    /// the class is already registered.
    pub async fn create_class(&self, schema: &ClassSchema) -> Result<ClassSchema> {
        validate_class_name(&schema.class_name).map_err(AdapterError::InvalidQuery)?;
        let mut tx = self.pool.begin().await?;
        let created = self.create_class_in(&mut tx, schema).await?;
        tx.commit().await?;
        info!(class = %schema.class_name, "class created");
        self.schema_changed(&schema.class_name).await;
        Ok(created)
    }

    async fn create_class_in(
        &self,
        conn: &mut PgConnection,
        schema: &ClassSchema,
    ) -> Result<ClassSchema> {
        for statement in self.ddl().create_class_table(schema)? {
            run_ddl(&mut *conn, &statement).await?;
        }
        let mut created = self.catalog.create(&mut *conn, schema).await?;

        if let Some(indexes) = &schema.indexes {
            let submitted: Map<String, Value> = indexes
                .iter()
                .map(|(name, key)| (name.clone(), Value::Object(key.clone())))
                .collect();
            let changes = diff_indexes(&submitted, &IndexMap::new(), &schema.fields)?;
            self.apply_index_changes(conn, &schema.class_name, &changes)
                .await?;
            created.indexes = Some(changes.indexes);
        }
        Ok(created)
    }

    /// Make sure a field is materialized and recorded
    ///
    /// Safe to race with other processes: a missing table creates the class,
    /// and a field already recorded is left alone without announcing a change.
    pub async fn add_field_if_not_exists(
        &self,
        class_name: &str,
        field_name: &str,
        descriptor: &FieldDescriptor,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let added = self
            .add_field_in(&mut tx, class_name, field_name, descriptor)
            .await?;
        tx.commit().await?;
        if added {
            self.schema_changed(class_name).await;
        }
        Ok(())
    }

    async fn add_field_in(
        &self,
        conn: &mut PgConnection,
        class_name: &str,
        field_name: &str,
        descriptor: &FieldDescriptor,
    ) -> Result<bool> {
        let statement = self.ddl().add_field(class_name, field_name, descriptor)?;

        let mut savepoint = sqlx::Connection::begin(&mut *conn).await?;
        match run_ddl(&mut *savepoint, &statement).await {
            Ok(()) => savepoint.commit().await?,
            Err(err) => {
                savepoint.rollback().await?;
                match err.pg_kind() {
                    Some(PgErrorKind::RelationDoesNotExist) => {
                        debug!(class = class_name, "table missing, creating class");
                        let schema = ClassSchema::with_default_fields(class_name)
                            .field(field_name, descriptor.clone());
                        self.create_class_in(&mut *conn, &schema).await?;
                        return Ok(true);
                    }
                    Some(PgErrorKind::DuplicateColumn) => {
                        warn!(class = class_name, field = field_name, "column added concurrently");
                    }
                    _ => return Err(err),
                }
            }
        }

        if self
            .catalog
            .has_field(&mut *conn, class_name, field_name)
            .await?
        {
            return Ok(false);
        }
        self.catalog
            .add_field(&mut *conn, class_name, field_name, descriptor)
            .await?;
        Ok(true)
    }

    /// Overwrite the recorded options of an existing field
    pub async fn update_field_options(
        &self,
        class_name: &str,
        field_name: &str,
        descriptor: &FieldDescriptor,
    ) -> Result<()> {
        self.catalog
            .add_field(&self.pool, class_name, field_name, descriptor)
            .await?;
        self.schema_changed(class_name).await;
        Ok(())
    }

    /// Add a column for every schema field that has none yet
    pub async fn schema_upgrade(&self, schema: &ClassSchema) -> Result<()> {
        let rows = sqlx::query(
            "SELECT column_name FROM information_schema.columns WHERE table_name = $1",
        )
        .bind(&schema.class_name)
        .fetch_all(&self.pool)
        .await?;
        let columns = rows
            .iter()
            .map(|row| row.try_get::<String, _>("column_name"))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut tx = self.pool.begin().await?;
        for (name, descriptor) in &schema.fields {
            if columns.contains(name) {
                continue;
            }
            self.add_field_in(&mut tx, &schema.class_name, name, descriptor)
                .await?;
        }
        tx.commit().await?;
        self.schema_changed(&schema.class_name).await;
        Ok(())
    }

    /// Remove fields from a class schema and drop their columns
    ///
    /// Columns that never existed are ignored. Relation fields drop their join
    /// tables instead.
    pub async fn delete_fields(&self, class_name: &str, field_names: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut schema = self.catalog.get(&mut *tx, class_name).await?;

        let mut columns = Vec::new();
        let mut join_tables = Vec::new();
        for name in field_names {
            match schema.fields.shift_remove(name) {
                Some(descriptor) if descriptor.is_relation() => {
                    join_tables.push(join_table_name(name, class_name));
                }
                _ => columns.push(name.clone()),
            }
        }

        self.catalog.update(&mut *tx, &schema).await?;
        if let Some(statement) = self.ddl().drop_columns(class_name, &columns) {
            run_ddl(&mut *tx, &statement).await?;
        }
        for table in &join_tables {
            run_ddl(&mut *tx, &self.ddl().drop_table(table)).await?;
        }
        tx.commit().await?;

        self.schema_changed(class_name).await;
        Ok(())
    }

    /// Drop a class table and its catalog row
    ///
    /// Returns `true` for a class and `false` for an internal join table.
    pub async fn delete_class(&self, class_name: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        run_ddl(&mut *tx, &self.ddl().drop_table(class_name)).await?;
        self.catalog.delete(&mut *tx, class_name).await?;
        tx.commit().await?;
        info!(class = class_name, "class deleted");
        self.schema_changed(class_name).await;
        Ok(!is_join_table(class_name))
    }

    /// Drop every class, join table, internal table and the metadata table
    pub async fn delete_all_classes(&self) -> Result<()> {
        let schemas = match self.catalog.get_all(&self.pool).await {
            Ok(schemas) => schemas,
            Err(err) if err.pg_kind() == Some(PgErrorKind::RelationDoesNotExist) => {
                debug!("metadata table missing, nothing to delete");
                Vec::new()
            }
            Err(err) => return Err(err),
        };

        let mut tables: Vec<String> = INTERNAL_TABLES.iter().map(|t| t.to_string()).collect();
        for schema in &schemas {
            tables.push(schema.class_name.clone());
            tables.extend(schema.join_tables());
        }
        tables.push(self.config.metadata_table.clone());

        let mut tx = self.pool.begin().await?;
        for table in &tables {
            run_ddl(&mut *tx, &self.ddl().drop_table(table)).await?;
        }
        tx.commit().await?;

        self.cache.clear().await;
        info!(tables = tables.len(), "all classes deleted");
        Ok(())
    }

    /// Every class schema
    pub async fn get_all_classes(&self) -> Result<Vec<ClassSchema>> {
        if let Some(schemas) = self.cache.get_all().await {
            return Ok(schemas);
        }
        let generation = self.cache.generation().await;
        let schemas = self.catalog.get_all(&self.pool).await?;
        self.cache.load(generation, schemas.clone()).await;
        Ok(schemas)
    }

    /// One class schema, or [`AdapterError::ClassNotFound`]
    pub async fn get_class(&self, class_name: &str) -> Result<ClassSchema> {
        if let Some(schema) = self.cache.get(class_name).await {
            return Ok(schema);
        }
        self.catalog.get(&self.pool, class_name).await
    }

    pub async fn set_class_level_permissions(
        &self,
        class_name: &str,
        clp: &ClassLevelPermissions,
    ) -> Result<()> {
        self.catalog
            .set_permissions(&self.pool, class_name, clp)
            .await?;
        self.schema_changed(class_name).await;
        Ok(())
    }

    // =========================================================================
    // Index Operations
    // =========================================================================

    /// Apply submitted index changes in schema format
    ///
    /// `submitted` maps index names to `{field: direction}` keys, or to
    /// `{"__op": "Delete"}`. `existing` are the indexes currently recorded.
    pub async fn set_indexes_with_schema_format(
        &self,
        class_name: &str,
        submitted: &Map<String, Value>,
        existing: &IndexMap<String, IndexKey>,
        fields: &IndexMap<String, FieldDescriptor>,
    ) -> Result<()> {
        let changes = diff_indexes(submitted, existing, fields)?;
        let mut tx = self.pool.begin().await?;
        self.apply_index_changes(&mut tx, class_name, &changes)
            .await?;
        tx.commit().await?;
        self.schema_changed(class_name).await;
        Ok(())
    }

    async fn apply_index_changes(
        &self,
        conn: &mut PgConnection,
        class_name: &str,
        changes: &IndexChanges,
    ) -> Result<()> {
        for (name, columns) in &changes.created {
            let statement = self.ddl().create_index(class_name, name, columns, false);
            run_ddl(&mut *conn, &statement).await?;
        }
        for name in &changes.dropped {
            run_ddl(&mut *conn, &self.ddl().drop_index(name)).await?;
        }
        self.catalog
            .set_indexes(&mut *conn, class_name, &changes.indexes)
            .await
    }

    /// Indexes currently defined on a class table
    pub async fn get_indexes(&self, class_name: &str) -> Result<Vec<IndexInfo>> {
        let rows = sqlx::query("SELECT indexname, indexdef FROM pg_indexes WHERE tablename = $1")
            .bind(class_name)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(IndexInfo {
                    name: row.try_get("indexname")?,
                    definition: row.try_get("indexdef")?,
                })
            })
            .collect()
    }

    /// Record in the catalog every plain index found on class tables
    pub async fn update_schema_with_indexes(&self) -> Result<()> {
        for schema in self.catalog.get_all(&self.pool).await? {
            let mut recorded = schema.indexes.clone().unwrap_or_default();
            let mut changed = false;
            for index in self.get_indexes(&schema.class_name).await? {
                if recorded.contains_key(&index.name) {
                    continue;
                }
                if let Some(key) = index_key_from_definition(&index.definition) {
                    recorded.insert(index.name, key);
                    changed = true;
                }
            }
            if changed {
                self.catalog
                    .set_indexes(&self.pool, &schema.class_name, &recorded)
                    .await?;
            }
        }
        self.cache.clear().await;
        Ok(())
    }

    /// Add a unique constraint over `field_names`
    ///
    /// An existing constraint is left alone; existing duplicate values fail
    /// with [`AdapterError::DuplicateValue`].
    pub async fn ensure_uniqueness(&self, class_name: &str, field_names: &[String]) -> Result<()> {
        let constraint = unique_constraint_name(class_name, field_names);
        let statement = self.ddl().add_unique_constraint(class_name, field_names);
        match run_ddl(&self.pool, &statement).await {
            Ok(()) => Ok(()),
            Err(err) => match err.pg_kind() {
                Some(PgErrorKind::DuplicateRelation | PgErrorKind::DuplicateObject) => {
                    debug!(constraint = %constraint, "unique constraint already exists");
                    Ok(())
                }
                Some(PgErrorKind::UniqueViolation) => Err(AdapterError::duplicate_value(None)),
                _ => Err(err),
            },
        }
    }

    /// Create an index over `field_names`
    ///
    /// Named `<class>_default_<fields>` unless `index_name` is given. With
    /// `case_insensitive` the columns are indexed lowered.
    pub async fn ensure_index(
        &self,
        class_name: &str,
        field_names: &[String],
        index_name: Option<&str>,
        case_insensitive: bool,
    ) -> Result<()> {
        let name = index_name
            .map(str::to_string)
            .unwrap_or_else(|| default_index_name(class_name, field_names));
        let statement = self
            .ddl()
            .create_index(class_name, &name, field_names, case_insensitive);
        match run_ddl(&self.pool, &statement).await {
            Ok(()) => Ok(()),
            Err(err) => match err.pg_kind() {
                Some(PgErrorKind::DuplicateRelation) => {
                    debug!(index = %name, "index already exists");
                    Ok(())
                }
                Some(PgErrorKind::UniqueViolation) => Err(AdapterError::duplicate_value(None)),
                _ => Err(err),
            },
        }
    }

    /// Refresh planner statistics, including the `count` estimate
    pub async fn update_estimated_count(&self, class_name: &str) -> Result<()> {
        run_ddl(&self.pool, &format!("ANALYZE {}", quote_identifier(class_name))).await
    }

    // =========================================================================
    // Document Writes
    // =========================================================================

    /// Insert one document
    ///
    /// Unique violations become [`AdapterError::DuplicateValue`] naming the
    /// field when the constraint name reveals it.
    pub async fn create_object(
        &self,
        schema: &ClassSchema,
        object: &Document,
        session: Option<&mut TransactionalSession>,
    ) -> Result<Document> {
        let statement = compile_insert(schema, object)?;
        match self.execute_write(&statement, session).await? {
            Ok(_) => Ok(object.clone()),
            Err(err) if classify(&err) == Some(PgErrorKind::UniqueViolation) => {
                let field = constraint_name(&err).and_then(|name| {
                    DUPLICATED_FIELD
                        .captures(&name)
                        .and_then(|c| c.get(1))
                        .map(|m| m.as_str().to_string())
                });
                Err(AdapterError::duplicate_value(field))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Run a write on the pool, or inside a savepoint of `session`
    ///
    /// The outer `Result` carries savepoint failures. The statement's own
    /// outcome is returned inside it, after its savepoint was rolled back, so
    /// a failed write leaves the session usable.
    async fn execute_write(
        &self,
        statement: &SqlStatement,
        session: Option<&mut TransactionalSession>,
    ) -> Result<std::result::Result<PgQueryResult, sqlx::Error>> {
        let Some(session) = session else {
            return Ok(statement.query().execute(&self.pool).await);
        };
        let mut savepoint = sqlx::Connection::begin(session.connection()).await?;
        let result = statement.query().execute(&mut *savepoint).await;
        match result {
            Ok(_) => savepoint.commit().await?,
            Err(_) => savepoint.rollback().await?,
        }
        Ok(result)
    }

    /// Delete every document matching `query`
    ///
    /// Returns the number deleted; fails with [`AdapterError::ObjectNotFound`]
    /// when nothing matched. A missing table deletes nothing.
    pub async fn delete_objects_by_query(
        &self,
        schema: &ClassSchema,
        query: &Value,
        session: Option<&mut TransactionalSession>,
    ) -> Result<u64> {
        let query = decode_query(query)?;
        let clause = build_where_clause(schema, &query, 1, false)?;
        let statement = SqlStatement::new(
            format!(
                "DELETE FROM {} {}",
                quote_identifier(&schema.class_name),
                clause.to_sql()
            )
            .trim_end()
            .to_string(),
            clause.params,
        );

        match self.execute_write(&statement, session).await? {
            Ok(done) if done.rows_affected() == 0 => Err(AdapterError::ObjectNotFound),
            Ok(done) => Ok(done.rows_affected()),
            Err(err) if classify(&err) == Some(PgErrorKind::RelationDoesNotExist) => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    /// Apply `update` to every document matching `query`, returning the updated documents
    pub async fn update_objects_by_query(
        &self,
        schema: &ClassSchema,
        query: &Value,
        update: &Document,
        session: Option<&mut TransactionalSession>,
    ) -> Result<Vec<Document>> {
        let update = compile_update(schema, update)?;
        let query = decode_query(query)?;
        let clause = build_where_clause(schema, &query, update.next_index(), false)?;
        let table = quote_identifier(&schema.class_name);

        let sql = if update.assignments.is_empty() {
            format!("SELECT * FROM {} {}", table, clause.to_sql())
        } else {
            format!(
                "UPDATE {} SET {} {} RETURNING *",
                table,
                update.assignments.join(", "),
                clause.to_sql()
            )
        };
        let mut params = update.params;
        params.extend(clause.params);

        let rows = self
            .fetch_rows(SqlStatement::new(sql, params), session, None)
            .await?;
        rows.into_iter()
            .map(|row| postgres_object_to_document(row, schema))
            .collect()
    }

    /// Queue an update of every document matching `query` until `session` commits
    ///
    /// Queued statements run at commit in the order they were queued, after
    /// every write already issued on the session. A failing one fails the
    /// commit and rolls the whole session back.
    pub fn defer_update_objects_by_query(
        &self,
        schema: &ClassSchema,
        query: &Value,
        update: &Document,
        session: &mut TransactionalSession,
    ) -> Result<()> {
        let update = compile_update(schema, update)?;
        if update.assignments.is_empty() {
            return Ok(());
        }
        let query = decode_query(query)?;
        let clause = build_where_clause(schema, &query, update.next_index(), false)?;
        let sql = format!(
            "UPDATE {} SET {} {}",
            quote_identifier(&schema.class_name),
            update.assignments.join(", "),
            clause.to_sql()
        );
        let mut params = update.params;
        params.extend(clause.params);
        session.enqueue(SqlStatement::new(sql.trim_end(), params));
        Ok(())
    }

    /// Queue a delete of every document matching `query` until `session` commits
    pub fn defer_delete_objects_by_query(
        &self,
        schema: &ClassSchema,
        query: &Value,
        session: &mut TransactionalSession,
    ) -> Result<()> {
        let query = decode_query(query)?;
        let clause = build_where_clause(schema, &query, 1, false)?;
        let sql = format!(
            "DELETE FROM {} {}",
            quote_identifier(&schema.class_name),
            clause.to_sql()
        );
        session.enqueue(SqlStatement::new(sql.trim_end(), clause.params));
        Ok(())
    }

    /// Update matching documents and return the first one
    pub async fn find_one_and_update(
        &self,
        schema: &ClassSchema,
        query: &Value,
        update: &Document,
        session: Option<&mut TransactionalSession>,
    ) -> Result<Option<Document>> {
        let updated = self
            .update_objects_by_query(schema, query, update, session)
            .await?;
        Ok(updated.into_iter().next())
    }

    /// Insert `query` merged with `update`, or update the match if it already exists
    pub async fn upsert_one_object(
        &self,
        schema: &ClassSchema,
        query: &Value,
        update: &Document,
        mut session: Option<&mut TransactionalSession>,
    ) -> Result<()> {
        let mut created = query.as_object().cloned().unwrap_or_default();
        for (key, value) in update {
            created.insert(key.clone(), value.clone());
        }

        match self
            .create_object(schema, &created, session.as_deref_mut())
            .await
        {
            Ok(_) => Ok(()),
            Err(AdapterError::DuplicateValue { .. }) => {
                debug!(class = %schema.class_name, "upsert matched an existing document");
                self.find_one_and_update(schema, query, update, session)
                    .await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    // =========================================================================
    // Document Reads
    // =========================================================================

    /// Documents matching `query`
    ///
    /// A missing table yields no documents. With `options.explain` the query
    /// plan is returned instead.
    pub async fn find(
        &self,
        schema: &ClassSchema,
        query: &Value,
        options: &QueryOptions,
    ) -> Result<Vec<Document>> {
        let query = decode_query(query)?;
        let statement = compile_find(schema, &query, options)?;

        if options.explain {
            return self.explain(&statement).await;
        }

        let max_time = options.max_time.or(self.config.max_query_time);
        match self.fetch_rows(statement, None, max_time).await {
            Ok(rows) => rows
                .into_iter()
                .map(|row| postgres_object_to_document(row, schema))
                .collect(),
            Err(err) if err.pg_kind() == Some(PgErrorKind::RelationDoesNotExist) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// Number of documents matching `query`
    ///
    /// With `estimate` and no filter the planner's row estimate is used when
    /// one exists. A missing table counts as zero.
    pub async fn count(&self, schema: &ClassSchema, query: &Value, estimate: bool) -> Result<i64> {
        let query = decode_query(query)?;
        let clause = build_where_clause(schema, &query, 1, false)?;

        let result = if estimate && clause.pattern.is_empty() {
            match self.estimated_count(&schema.class_name).await {
                Ok(Some(count)) => Ok(count),
                Ok(None) => self.exact_count(&schema.class_name, clause).await,
                Err(err) => Err(err),
            }
        } else {
            self.exact_count(&schema.class_name, clause).await
        };

        match result {
            Err(err) if err.pg_kind() == Some(PgErrorKind::RelationDoesNotExist) => Ok(0),
            other => other,
        }
    }

    async fn estimated_count(&self, class_name: &str) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT reltuples::bigint AS estimate FROM pg_class WHERE relname = $1")
            .bind(class_name)
            .fetch_optional(&self.pool)
            .await?;
        let estimate = match row {
            Some(row) => row.try_get::<i64, _>("estimate")?,
            None => return Ok(None),
        };
        Ok((estimate >= 0).then_some(estimate))
    }

    async fn exact_count(&self, class_name: &str, clause: WhereClause) -> Result<i64> {
        let statement = SqlStatement::new(
            format!(
                "SELECT count(*) AS total FROM {} {}",
                quote_identifier(class_name),
                clause.to_sql()
            )
            .trim_end()
            .to_string(),
            clause.params,
        );
        let row = statement.query().fetch_one(&self.pool).await?;
        Ok(row.try_get("total")?)
    }

    /// Distinct values of `field_name` among documents matching `query`
    ///
    /// Array fields contribute their elements; dotted names read nested keys.
    pub async fn distinct(
        &self,
        schema: &ClassSchema,
        query: &Value,
        field_name: &str,
    ) -> Result<Vec<Value>> {
        let query = decode_query(query)?;
        let clause = build_where_clause(schema, &query, 1, false)?;
        let statement = compile_distinct(schema, field_name, clause);
        let nested = field_name.contains('.');

        let rows = match self.fetch_rows(statement, None, None).await {
            Ok(rows) => rows,
            Err(err)
                if matches!(
                    err.pg_kind(),
                    Some(PgErrorKind::RelationDoesNotExist | PgErrorKind::MissingColumn)
                ) =>
            {
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };

        let mut values = Vec::new();
        for mut row in rows {
            let value = row.remove("value").unwrap_or(Value::Null);
            if value.is_null() {
                continue;
            }
            if nested || schema.is_array_field(field_name) {
                values.push(value);
                continue;
            }
            let mut single = Map::new();
            single.insert(field_name.to_string(), value);
            let mut only = ClassSchema::new(&schema.class_name);
            if let Some(descriptor) = schema.fields.get(field_name) {
                only.fields.insert(field_name.to_string(), descriptor.clone());
            }
            let mut decoded = postgres_object_to_document(single, &only)?;
            if let Some(value) = decoded.remove(field_name) {
                values.push(value);
            }
        }
        Ok(values)
    }

    /// Run an aggregation pipeline
    pub async fn aggregate(
        &self,
        schema: &ClassSchema,
        pipeline: &[Value],
        explain: bool,
    ) -> Result<Vec<Document>> {
        let compiled = compile_pipeline(schema, pipeline)?;
        if explain {
            return self.explain(&compiled.statement).await;
        }

        let rows = self
            .fetch_rows(compiled.statement.clone(), None, self.config.max_query_time)
            .await?;
        let rows = rows
            .into_iter()
            .map(|row| postgres_object_to_document(row, schema))
            .collect::<Result<Vec<_>>>()?;
        Ok(finish_aggregate_rows(rows, &compiled))
    }

    async fn explain(&self, statement: &SqlStatement) -> Result<Vec<Document>> {
        let explained = SqlStatement::new(
            format!("EXPLAIN (ANALYZE, FORMAT JSON) {}", statement.sql),
            statement.params.clone(),
        );
        let row = explained.query().fetch_one(&self.pool).await?;
        let plan: Value = row.try_get(0)?;
        Ok(match plan {
            Value::Array(plans) => plans
                .into_iter()
                .filter_map(|p| match p {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect(),
            Value::Object(map) => vec![map],
            _ => Vec::new(),
        })
    }

    /// Run a row-returning statement and collect each row as a JSON object
    ///
    /// With `max_time` the statement runs in its own transaction under
    /// `SET LOCAL statement_timeout`.
    async fn fetch_rows(
        &self,
        statement: SqlStatement,
        session: Option<&mut TransactionalSession>,
        max_time: Option<std::time::Duration>,
    ) -> Result<Vec<Document>> {
        let statement = statement.into_json_rows();
        debug!(sql = %statement.sql, params = statement.params.len(), "fetching rows");

        let rows = match (session, max_time) {
            (Some(session), _) => statement.query().fetch_all(session.connection()).await?,
            (None, Some(limit)) => {
                let mut tx = self.pool.begin().await?;
                sqlx::query(&format!(
                    "SET LOCAL statement_timeout = {}",
                    limit.as_millis()
                ))
                .execute(&mut *tx)
                .await?;
                let rows = statement.query().fetch_all(&mut *tx).await?;
                tx.commit().await?;
                rows
            }
            (None, None) => statement.query().fetch_all(&self.pool).await?,
        };

        rows.iter()
            .map(|row| match row.try_get::<Value, _>("doc")? {
                Value::Object(map) => Ok(map),
                other => Err(AdapterError::invalid_json(format!(
                    "expected a row object, got {}",
                    other
                ))),
            })
            .collect()
    }
}

/// Execute one DDL statement
async fn run_ddl<'e, E: PgExecutor<'e>>(executor: E, sql: &str) -> Result<()> {
    debug!(sql, "executing DDL");
    sqlx::query(sql).execute(executor).await?;
    Ok(())
}

/// Selected columns for a projection
///
/// `ACL` expands to the permission columns, relation fields and `$` keys are
/// dropped, dotted keys select their top-level column, and the default columns
/// are always included.
fn projection(schema: &ClassSchema, keys: &[String]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    let mut push = |name: &str| {
        if !columns.iter().any(|c| c == name) {
            columns.push(name.to_string());
        }
    };
    for name in ["objectId", "createdAt", "updatedAt"] {
        push(name);
    }
    for key in keys {
        let key = key.split('.').next().unwrap_or_default();
        if key.is_empty() || key.starts_with('$') {
            continue;
        }
        if key == "ACL" {
            push("_rperm");
            push("_wperm");
            continue;
        }
        if schema.field_type(key) == Some(&FieldType::Relation) {
            continue;
        }
        push(key);
    }
    columns
}

/// Compile the SELECT of a `find`
fn compile_find(schema: &ClassSchema, query: &Query, options: &QueryOptions) -> Result<SqlStatement> {
    let clause = build_where_clause(schema, query, 1, options.case_insensitive)?;
    let mut builder = SqlBuilder::starting_at(clause.params.len() + 1);

    let columns = match &options.keys {
        Some(keys) => projection(schema, keys)
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", "),
        None => "*".to_string(),
    };

    let mut sql = format!(
        "SELECT {} FROM {}",
        columns,
        quote_identifier(&schema.class_name)
    );
    for part in [
        clause.to_sql(),
        build_order_by_clause(&options.sort, &clause.sorts),
    ] {
        if !part.is_empty() {
            sql.push(' ');
            sql.push_str(&part);
        }
    }
    if let Some(limit) = options.limit {
        sql.push_str(&format!(" LIMIT {}", builder.push(SqlParam::Int(limit))));
    }
    if let Some(skip) = options.skip {
        sql.push_str(&format!(" OFFSET {}", builder.push(SqlParam::Int(skip))));
    }

    let mut params = clause.params;
    params.extend(builder.into_params());
    Ok(SqlStatement::new(sql, params))
}

/// Compile the SELECT DISTINCT of a `distinct`, exposing the value as `"value"`
fn compile_distinct(schema: &ClassSchema, field_name: &str, clause: WhereClause) -> SqlStatement {
    let expression = if field_name.contains('.') {
        transform_dot_field_to_components(field_name).join("->")
    } else if schema.is_array_field(field_name) {
        let column = quote_identifier(field_name);
        match schema.fields.get(field_name) {
            Some(descriptor) if descriptor.is_string_array() => format!("unnest({})", column),
            _ => format!("jsonb_array_elements({})", column),
        }
    } else {
        quote_identifier(field_name)
    };

    let sql = format!(
        "SELECT DISTINCT {} AS \"value\" FROM {} {}",
        expression,
        quote_identifier(&schema.class_name),
        clause.to_sql()
    );
    SqlStatement::new(sql.trim_end().to_string(), clause.params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::SortDirection;
    use serde_json::json;

    fn schema() -> ClassSchema {
        ClassSchema::with_default_fields("Post")
            .field("title", FieldDescriptor::new(FieldType::String))
            .field("score", FieldDescriptor::new(FieldType::Number))
            .field("tags", FieldDescriptor::array_of(FieldType::String))
            .field("meta", FieldDescriptor::new(FieldType::Object))
            .field("likes", FieldDescriptor::relation("_User"))
    }

    // =========================================================================
    // Projection Tests
    // =========================================================================

    #[test]
    fn test_projection_defaults_and_acl() {
        let keys: Vec<String> = ["title", "ACL", "likes", "", "meta.author", "$score"]
            .iter()
            .map(|k| k.to_string())
            .collect();
        assert_eq!(
            projection(&schema(), &keys),
            vec!["objectId", "createdAt", "updatedAt", "title", "_rperm", "_wperm", "meta"]
        );
    }

    // =========================================================================
    // find Compilation Tests
    // =========================================================================

    #[test]
    fn test_compile_find_with_options() {
        let query = decode_query(&json!({"score": {"$gt": 5}})).unwrap();
        let options = QueryOptions::new()
            .with_keys(["title"])
            .sort_by("score", SortDirection::Descending)
            .with_limit(10)
            .with_skip(20);
        let statement = compile_find(&schema(), &query, &options).unwrap();
        assert_eq!(
            statement.sql,
            "SELECT \"objectId\", \"createdAt\", \"updatedAt\", \"title\" FROM \"Post\" WHERE \"score\" > $1 ORDER BY \"score\" DESC LIMIT $2 OFFSET $3"
        );
        assert_eq!(
            statement.params,
            vec![SqlParam::Float(5.0), SqlParam::Int(10), SqlParam::Int(20)]
        );
    }

    #[test]
    fn test_compile_find_everything() {
        let statement = compile_find(&schema(), &Query::all(), &QueryOptions::new()).unwrap();
        assert_eq!(statement.sql, "SELECT * FROM \"Post\"");
        assert!(statement.params.is_empty());
    }

    // =========================================================================
    // distinct Compilation Tests
    // =========================================================================

    #[test]
    fn test_compile_distinct_shapes() {
        let plain = compile_distinct(&schema(), "title", WhereClause::default());
        assert_eq!(
            plain.sql,
            "SELECT DISTINCT \"title\" AS \"value\" FROM \"Post\""
        );

        let array = compile_distinct(&schema(), "tags", WhereClause::default());
        assert_eq!(
            array.sql,
            "SELECT DISTINCT unnest(\"tags\") AS \"value\" FROM \"Post\""
        );

        let nested = compile_distinct(&schema(), "meta.author", WhereClause::default());
        assert_eq!(
            nested.sql,
            "SELECT DISTINCT \"meta\"->'author' AS \"value\" FROM \"Post\""
        );
    }

    #[test]
    fn test_duplicated_field_pattern() {
        let captured = DUPLICATED_FIELD
            .captures("Post_unique_slug")
            .and_then(|c| c.get(1))
            .map(|m| m.as_str());
        assert_eq!(captured, Some("slug"));
    }
}
