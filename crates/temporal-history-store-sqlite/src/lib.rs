//! SQLite host for temporal history.
//!
//! [`SqliteHost`] is both the schema registry and the lifecycle dispatcher
//! the core crate binds against: it introspects live tables, creates the
//! history tables, runs mutations inside transactions and fires the
//! subscribed hooks on the same connection.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use temporal_history_core::{
    bind, Filter, HistoryBinding, HistoryConfig, HistoryError, HistorySchema, HookPayload,
    HookRegistry, LifecycleEvent, LifecycleHook, LiveSchema, RecordState, RecordValues, Relation,
    RelationKind, SchemaRegistry, SnapshotFailureSink,
};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, info, warn};

mod ddl;
mod introspect;
mod tables;

pub use ddl::history_table_ddl;
pub use tables::{blob_value, SqliteHistoryTable, SqliteLiveTable, BLOB_TAG};

use tables::{
    quote_ident, select_rows, select_where, storage_error, to_sql_value, where_clause, EntityKind,
    TableMeta,
};

type HookTable =
    BTreeMap<String, BTreeMap<LifecycleEvent, Vec<Box<dyn LifecycleHook<Connection>>>>>;

/// Options of a bulk update or destroy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct BulkOptions {
    /// Also run the single-record path, and its events, for every matched row.
    pub individual_hooks: bool,
}

impl BulkOptions {
    #[must_use]
    pub fn individual_hooks() -> Self {
        Self {
            individual_hooks: true,
        }
    }
}

pub struct SqliteHost {
    conn: Connection,
    entities: BTreeMap<String, TableMeta>,
    hooks: HookTable,
    relations: Vec<Relation>,
}

impl SqliteHost {
    /// # Errors
    /// Returns [`HistoryError::Storage`] when the database cannot be opened
    /// or configured.
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        let conn = Connection::open(path).map_err(|err| {
            storage_error(
                &format!("failed to open sqlite database at {}", path.display()),
                &err,
            )
        })?;
        Self::configure(conn)
    }

    /// # Errors
    /// Returns [`HistoryError::Storage`] when the database cannot be opened.
    pub fn open_in_memory() -> Result<Self, HistoryError> {
        let conn = Connection::open_in_memory()
            .map_err(|err| storage_error("failed to open in-memory sqlite database", &err))?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> Result<Self, HistoryError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|err| storage_error("failed to configure sqlite pragmas", &err))?;

        Ok(Self {
            conn,
            entities: BTreeMap::new(),
            hooks: BTreeMap::new(),
            relations: Vec::new(),
        })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// # Errors
    /// Returns [`HistoryError::Storage`] when `sqlite_master` cannot be read.
    pub fn table_exists(&self, table_name: &str) -> Result<bool, HistoryError> {
        introspect::table_exists(&self.conn, table_name)
    }

    /// Live schema of an existing table, named after the table.
    ///
    /// # Errors
    /// Returns [`HistoryError::Storage`] when the table does not exist or
    /// its catalog entries cannot be read.
    pub fn introspect(&self, table_name: &str) -> Result<LiveSchema, HistoryError> {
        introspect::introspect_table(&self.conn, table_name)
    }

    /// Registers a live entity for mutation and hook dispatch.
    ///
    /// # Errors
    /// Returns [`HistoryError::Registration`] when the entity is already
    /// registered, its table is missing, or it has no single primary key.
    pub fn register_live(&mut self, schema: &LiveSchema) -> Result<SqliteLiveTable, HistoryError> {
        let entity = &schema.options.name;
        if self.entities.contains_key(entity) {
            return Err(HistoryError::Registration(format!(
                "entity {entity} is already registered"
            )));
        }
        if !self.table_exists(&schema.options.table_name)? {
            return Err(HistoryError::Registration(format!(
                "live table {} does not exist",
                schema.options.table_name
            )));
        }

        let rowid = introspect::has_rowid(&self.conn, &schema.options.table_name)?;
        let meta = TableMeta::live(schema, rowid)?;
        debug!(entity = %meta.entity, table = %meta.table, "registered live entity");
        self.entities.insert(entity.clone(), meta.clone());
        Ok(SqliteLiveTable { meta })
    }

    #[must_use]
    pub fn live_table(&self, entity: &str) -> Option<SqliteLiveTable> {
        self.entities
            .get(entity)
            .filter(|meta| meta.kind == EntityKind::Live)
            .map(|meta| SqliteLiveTable { meta: meta.clone() })
    }

    /// Registers `live` if needed, then installs its history binding.
    ///
    /// # Errors
    /// Returns any registration error and any error of [`bind`].
    pub fn bind_history(
        &mut self,
        live: &LiveSchema,
        config: HistoryConfig,
        sink: Arc<dyn SnapshotFailureSink>,
    ) -> Result<HistoryBinding, HistoryError> {
        let table = match self.live_table(&live.options.name) {
            Some(table) => table,
            None => self.register_live(live)?,
        };
        bind::<Connection, _, _>(self, live, config, table, sink)
    }

    #[must_use]
    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    /// Runs `work` in one transaction. It commits when `work` returns `Ok`
    /// and rolls back everything, captured snapshots included, otherwise.
    ///
    /// # Errors
    /// Returns the error of `work`, or [`HistoryError::Storage`] when the
    /// transaction cannot be opened or committed.
    pub fn transaction<T, F>(&mut self, work: F) -> Result<T, HistoryError>
    where
        F: FnOnce(&Scope<'_>) -> Result<T, HistoryError>,
    {
        let tx = self
            .conn
            .transaction()
            .map_err(|err| storage_error("failed to begin transaction", &err))?;
        let scope = Scope {
            conn: &tx,
            entities: &self.entities,
            hooks: &self.hooks,
            relations: &self.relations,
        };

        match work(&scope) {
            Ok(value) => {
                tx.commit()
                    .map_err(|err| storage_error("failed to commit transaction", &err))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback() {
                    warn!(error = %rollback, "failed to roll back transaction");
                }
                debug!(error = %err, "transaction rolled back");
                Err(err)
            }
        }
    }

    /// # Errors
    /// See [`Scope::create`].
    pub fn create(&mut self, entity: &str, values: RecordValues) -> Result<RecordValues, HistoryError> {
        self.transaction(|scope| scope.create(entity, values))
    }

    /// # Errors
    /// See [`Scope::update`].
    pub fn update(
        &mut self,
        entity: &str,
        id: &Value,
        changes: RecordValues,
    ) -> Result<RecordValues, HistoryError> {
        self.transaction(|scope| scope.update(entity, id, changes))
    }

    /// # Errors
    /// See [`Scope::destroy`].
    pub fn destroy(&mut self, entity: &str, id: &Value) -> Result<RecordValues, HistoryError> {
        self.transaction(|scope| scope.destroy(entity, id))
    }

    /// # Errors
    /// See [`Scope::restore`].
    pub fn restore(&mut self, entity: &str, id: &Value) -> Result<RecordValues, HistoryError> {
        self.transaction(|scope| scope.restore(entity, id))
    }

    /// # Errors
    /// See [`Scope::bulk_update`].
    pub fn bulk_update(
        &mut self,
        entity: &str,
        filter: &Filter,
        changes: RecordValues,
        options: BulkOptions,
    ) -> Result<usize, HistoryError> {
        self.transaction(|scope| scope.bulk_update(entity, filter, changes, options))
    }

    /// # Errors
    /// See [`Scope::bulk_destroy`].
    pub fn bulk_destroy(
        &mut self,
        entity: &str,
        filter: &Filter,
        options: BulkOptions,
    ) -> Result<usize, HistoryError> {
        self.transaction(|scope| scope.bulk_destroy(entity, filter, options))
    }

    /// # Errors
    /// See [`Scope::find_all`].
    pub fn find_all(&self, entity: &str, filter: &Filter) -> Result<Vec<RecordValues>, HistoryError> {
        self.read_scope().find_all(entity, filter)
    }

    /// # Errors
    /// See [`Scope::find_by_id`].
    pub fn find_by_id(&self, entity: &str, id: &Value) -> Result<Option<RecordValues>, HistoryError> {
        self.read_scope().find_by_id(entity, id)
    }

    /// # Errors
    /// See [`Scope::history_of`].
    pub fn history_of(&self, live_entity: &str, id: &Value) -> Result<Vec<RecordValues>, HistoryError> {
        self.read_scope().history_of(live_entity, id)
    }

    fn read_scope(&self) -> Scope<'_> {
        Scope {
            conn: &self.conn,
            entities: &self.entities,
            hooks: &self.hooks,
            relations: &self.relations,
        }
    }
}

impl SchemaRegistry for SqliteHost {
    type Handle = SqliteHistoryTable;

    fn define_history(&mut self, schema: &HistorySchema) -> Result<SqliteHistoryTable, HistoryError> {
        if self.entities.contains_key(schema.entity()) {
            return Err(HistoryError::Registration(format!(
                "entity {} is already registered",
                schema.entity()
            )));
        }
        schema.validate()?;

        self.conn
            .execute_batch(&history_table_ddl(schema))
            .map_err(|err| {
                storage_error(
                    &format!("failed to create history table {}", schema.table_name()),
                    &err,
                )
            })?;
        self.entities
            .insert(schema.entity().to_string(), TableMeta::history(schema));

        info!(
            entity = %schema.entity(),
            table = %schema.table_name(),
            "history table ready"
        );
        Ok(SqliteHistoryTable::new(schema))
    }

    fn declare_relation(&mut self, relation: &Relation) -> Result<(), HistoryError> {
        for entity in [&relation.source, &relation.target] {
            if !self.entities.contains_key(entity) {
                return Err(HistoryError::Registration(format!(
                    "relation refers to unregistered entity {entity}"
                )));
            }
        }
        self.relations.push(relation.clone());
        Ok(())
    }
}

impl HookRegistry<Connection> for SqliteHost {
    fn subscribe(
        &mut self,
        entity: &str,
        event: LifecycleEvent,
        hook: Box<dyn LifecycleHook<Connection>>,
    ) -> Result<(), HistoryError> {
        if !self.entities.contains_key(entity) {
            return Err(HistoryError::Registration(format!(
                "cannot subscribe {event} on unregistered entity {entity}"
            )));
        }
        self.hooks
            .entry(entity.to_string())
            .or_default()
            .entry(event)
            .or_default()
            .push(hook);
        Ok(())
    }
}

/// Mutations and reads bound to one connection state, usually an open
/// transaction. Hooks run on the same connection.
pub struct Scope<'a> {
    conn: &'a Connection,
    entities: &'a BTreeMap<String, TableMeta>,
    hooks: &'a HookTable,
    relations: &'a [Relation],
}

impl Scope<'_> {
    #[must_use]
    pub fn connection(&self) -> &Connection {
        self.conn
    }

    /// Inserts a record, stamping managed timestamps, then fires
    /// `afterCreate` with the stored row.
    ///
    /// # Errors
    /// Returns [`HistoryError::Registration`] for an unknown entity,
    /// [`HistoryError::Storage`] for unknown attributes or a failed insert,
    /// and any error raised by a hook.
    pub fn create(&self, entity: &str, mut values: RecordValues) -> Result<RecordValues, HistoryError> {
        let meta = self.meta(entity)?;
        if let Some((created, updated)) = &meta.timestamps {
            let now = Value::String(format_rfc3339(now_utc())?);
            values.insert(created.clone(), now.clone());
            values.insert(updated.clone(), now);
        }

        let (columns, params) = column_values(meta, &values)?;
        let sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", quote_ident(&meta.table))
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(&meta.table),
                columns.join(", "),
                vec!["?"; columns.len()].join(", ")
            )
        };
        self.execute(&sql, &params, &format!("failed to insert into {}", meta.table))?;

        let stored = if meta.rowid {
            let rowid = self.conn.last_insert_rowid();
            select_where(self.conn, meta, " WHERE rowid = ?", &[SqlValue::Integer(rowid)])?
                .into_iter()
                .next()
                .ok_or_else(|| {
                    HistoryError::Storage(format!("inserted {entity} row {rowid} is not readable"))
                })?
        } else {
            let key = values
                .get(&meta.primary_key)
                .filter(|value| !value.is_null())
                .ok_or_else(|| {
                    HistoryError::Storage(format!(
                        "{entity} has no rowid; create must supply {}",
                        meta.primary_key
                    ))
                })?;
            self.load(meta, key, true)?
        };

        let state = RecordState::loaded(stored);
        self.dispatch(entity, LifecycleEvent::AfterCreate, &HookPayload::Record(&state))?;
        Ok(state.current)
    }

    /// Applies `changes` to one record. `beforeUpdate` sees the stored
    /// values as `previous` and the pending ones as `current`.
    ///
    /// # Errors
    /// Returns [`HistoryError::Storage`] when the record does not exist,
    /// the primary key would change, or the write fails, and any error
    /// raised by a hook.
    pub fn update(&self, entity: &str, id: &Value, changes: RecordValues) -> Result<RecordValues, HistoryError> {
        let meta = self.meta(entity)?;
        let previous = self.load(meta, id, false)?;
        self.update_loaded(meta, previous, changes)
    }

    /// Removes one record, or stamps its deletion timestamp when the entity
    /// is paranoid.
    ///
    /// # Errors
    /// Returns [`HistoryError::Storage`] when the record does not exist or
    /// the write fails, and any error raised by a hook.
    pub fn destroy(&self, entity: &str, id: &Value) -> Result<RecordValues, HistoryError> {
        let meta = self.meta(entity)?;
        let previous = self.load(meta, id, false)?;
        self.destroy_loaded(meta, previous)
    }

    /// Clears the deletion timestamp of a soft-deleted record.
    ///
    /// # Errors
    /// Returns [`HistoryError::Storage`] when the entity is not paranoid,
    /// the record does not exist or is not deleted, or the write fails, and
    /// any error raised by a hook.
    pub fn restore(&self, entity: &str, id: &Value) -> Result<RecordValues, HistoryError> {
        let meta = self.meta(entity)?;
        let Some(deleted) = &meta.paranoid else {
            return Err(HistoryError::Storage(format!(
                "{entity} is not paranoid; nothing to restore"
            )));
        };
        let previous = self.load(meta, id, true)?;
        let key = key_of(meta, &previous);
        if previous.get(deleted).map_or(true, Value::is_null) {
            return Err(HistoryError::Storage(format!(
                "{entity} {key} is not deleted; nothing to restore"
            )));
        }

        self.execute(
            &format!(
                "UPDATE {} SET {} = NULL WHERE {} = ?",
                quote_ident(&meta.table),
                quote_ident(meta.field(deleted)?),
                quote_ident(meta.field(&meta.primary_key)?)
            ),
            &[to_sql_value(&key)],
            &format!("failed to restore {entity} {key}"),
        )?;

        let state = RecordState::changed(previous, self.load(meta, &key, true)?);
        self.dispatch(entity, LifecycleEvent::AfterRestore, &HookPayload::Record(&state))?;
        Ok(state.current)
    }

    /// Applies `changes` to every row matching `filter` and returns how many
    /// rows were affected.
    ///
    /// # Errors
    /// Returns [`HistoryError::Storage`] for unknown attributes, a primary
    /// key change, or a failed write, and any error raised by a hook.
    pub fn bulk_update(
        &self,
        entity: &str,
        filter: &Filter,
        mut changes: RecordValues,
        options: BulkOptions,
    ) -> Result<usize, HistoryError> {
        let meta = self.meta(entity)?;
        if changes.contains_key(&meta.primary_key) {
            return Err(HistoryError::Storage(format!(
                "bulk update cannot change the primary key of {entity}"
            )));
        }
        let (where_sql, where_params) = where_clause(meta, filter, false)?;
        column_values(meta, &changes)?;

        self.dispatch(
            entity,
            LifecycleEvent::BeforeBulkUpdate,
            &HookPayload::Bulk {
                filter,
                individual_hooks: options.individual_hooks,
            },
        )?;

        let affected = if options.individual_hooks {
            let rows = select_where(self.conn, meta, &where_sql, &where_params)?;
            for row in &rows {
                self.update_loaded(meta, row.clone(), changes.clone())?;
            }
            rows.len()
        } else {
            if let Some((_, updated)) = &meta.timestamps {
                changes.insert(updated.clone(), Value::String(format_rfc3339(now_utc())?));
            }
            if changes.is_empty() {
                select_where(self.conn, meta, &where_sql, &where_params)?.len()
            } else {
                let (assignments, mut params) = assignments(meta, &changes)?;
                params.extend(where_params);
                self.execute(
                    &format!(
                        "UPDATE {} SET {assignments}{where_sql}",
                        quote_ident(&meta.table)
                    ),
                    &params,
                    &format!("failed to bulk update {entity}"),
                )?
            }
        };

        debug!(entity, affected, individual_hooks = options.individual_hooks, "bulk update applied");
        Ok(affected)
    }

    /// Destroys every row matching `filter` and returns how many rows were
    /// affected.
    ///
    /// # Errors
    /// Returns [`HistoryError::Storage`] for unknown attributes or a failed
    /// write, and any error raised by a hook.
    pub fn bulk_destroy(&self, entity: &str, filter: &Filter, options: BulkOptions) -> Result<usize, HistoryError> {
        let meta = self.meta(entity)?;
        let (where_sql, where_params) = where_clause(meta, filter, false)?;

        self.dispatch(
            entity,
            LifecycleEvent::BeforeBulkDestroy,
            &HookPayload::Bulk {
                filter,
                individual_hooks: options.individual_hooks,
            },
        )?;

        let affected = if options.individual_hooks {
            let rows = select_where(self.conn, meta, &where_sql, &where_params)?;
            for row in &rows {
                self.destroy_loaded(meta, row.clone())?;
            }
            rows.len()
        } else if let Some(deleted) = &meta.paranoid {
            let mut params = vec![SqlValue::Text(format_rfc3339(now_utc())?)];
            params.extend(where_params);
            self.execute(
                &format!(
                    "UPDATE {} SET {} = ?{where_sql}",
                    quote_ident(&meta.table),
                    quote_ident(meta.field(deleted)?)
                ),
                &params,
                &format!("failed to bulk destroy {entity}"),
            )?
        } else {
            self.execute(
                &format!("DELETE FROM {}{where_sql}", quote_ident(&meta.table)),
                &where_params,
                &format!("failed to bulk destroy {entity}"),
            )?
        };

        debug!(entity, affected, individual_hooks = options.individual_hooks, "bulk destroy applied");
        Ok(affected)
    }

    /// Rows matching `filter`, ordered by primary key. Soft-deleted rows are
    /// skipped.
    ///
    /// # Errors
    /// Returns [`HistoryError::Registration`] for an unknown entity and
    /// [`HistoryError::Storage`] for unknown attributes or a failed query.
    pub fn find_all(&self, entity: &str, filter: &Filter) -> Result<Vec<RecordValues>, HistoryError> {
        select_rows(self.conn, self.meta(entity)?, filter, false)
    }

    /// # Errors
    /// See [`Scope::find_all`].
    pub fn find_by_id(&self, entity: &str, id: &Value) -> Result<Option<RecordValues>, HistoryError> {
        let meta = self.meta(entity)?;
        let filter = Filter::new().where_eq(&meta.primary_key, id.clone());
        Ok(select_rows(self.conn, meta, &filter, false)?.into_iter().next())
    }

    /// History rows of one live record, oldest first.
    ///
    /// # Errors
    /// Returns [`HistoryError::Registration`] when `live_entity` has no
    /// history binding and [`HistoryError::Storage`] when the query fails.
    pub fn history_of(&self, live_entity: &str, id: &Value) -> Result<Vec<RecordValues>, HistoryError> {
        let relation = self
            .relations
            .iter()
            .find(|relation| relation.kind == RelationKind::HasMany && relation.source == live_entity)
            .ok_or_else(|| {
                HistoryError::Registration(format!("{live_entity} has no history binding"))
            })?;
        let meta = self.meta(&relation.target)?;
        if meta.kind != EntityKind::History {
            return Err(HistoryError::Registration(format!(
                "{} is not a history entity",
                relation.target
            )));
        }

        let filter = Filter::new().where_eq(&relation.foreign_key, id.clone());
        select_rows(self.conn, meta, &filter, true)
    }

    fn meta(&self, entity: &str) -> Result<&TableMeta, HistoryError> {
        self.entities.get(entity).ok_or_else(|| {
            HistoryError::Registration(format!("entity {entity} is not registered"))
        })
    }

    fn load(&self, meta: &TableMeta, id: &Value, include_deleted: bool) -> Result<RecordValues, HistoryError> {
        let filter = Filter::new().where_eq(&meta.primary_key, id.clone());
        select_rows(self.conn, meta, &filter, include_deleted)?
            .into_iter()
            .next()
            .ok_or_else(|| HistoryError::Storage(format!("{} {id} not found", meta.entity)))
    }

    fn update_loaded(
        &self,
        meta: &TableMeta,
        previous: RecordValues,
        mut changes: RecordValues,
    ) -> Result<RecordValues, HistoryError> {
        let key = key_of(meta, &previous);
        if changes
            .get(&meta.primary_key)
            .is_some_and(|value| value != &key)
        {
            return Err(HistoryError::Storage(format!(
                "primary key of {} {key} cannot change",
                meta.entity
            )));
        }
        if let Some((_, updated)) = &meta.timestamps {
            changes.insert(updated.clone(), Value::String(format_rfc3339(now_utc())?));
        }
        let (assignments, mut params) = assignments(meta, &changes)?;

        let mut pending = previous.clone();
        pending.extend(changes);
        let before = RecordState::changed(previous, pending);
        self.dispatch(&meta.entity, LifecycleEvent::BeforeUpdate, &HookPayload::Record(&before))?;

        if !assignments.is_empty() {
            params.push(to_sql_value(&key));
            self.execute(
                &format!(
                    "UPDATE {} SET {assignments} WHERE {} = ?",
                    quote_ident(&meta.table),
                    quote_ident(meta.field(&meta.primary_key)?)
                ),
                &params,
                &format!("failed to update {} {key}", meta.entity),
            )?;
        }

        let previous = before.previous.unwrap_or_default();
        let after = RecordState::changed(previous, self.load(meta, &key, true)?);
        self.dispatch(&meta.entity, LifecycleEvent::AfterUpdate, &HookPayload::Record(&after))?;
        Ok(after.current)
    }

    fn destroy_loaded(&self, meta: &TableMeta, previous: RecordValues) -> Result<RecordValues, HistoryError> {
        let key = key_of(meta, &previous);
        let before = RecordState::loaded(previous);
        self.dispatch(&meta.entity, LifecycleEvent::BeforeDestroy, &HookPayload::Record(&before))?;

        let key_field = quote_ident(meta.field(&meta.primary_key)?);
        let after = if let Some(deleted) = &meta.paranoid {
            self.execute(
                &format!(
                    "UPDATE {} SET {} = ? WHERE {key_field} = ?",
                    quote_ident(&meta.table),
                    quote_ident(meta.field(deleted)?)
                ),
                &[SqlValue::Text(format_rfc3339(now_utc())?), to_sql_value(&key)],
                &format!("failed to destroy {} {key}", meta.entity),
            )?;
            RecordState::changed(before.current, self.load(meta, &key, true)?)
        } else {
            self.execute(
                &format!("DELETE FROM {} WHERE {key_field} = ?", quote_ident(&meta.table)),
                &[to_sql_value(&key)],
                &format!("failed to destroy {} {key}", meta.entity),
            )?;
            before
        };

        self.dispatch(&meta.entity, LifecycleEvent::AfterDestroy, &HookPayload::Record(&after))?;
        Ok(after.current)
    }

    fn dispatch(
        &self,
        entity: &str,
        event: LifecycleEvent,
        payload: &HookPayload<'_>,
    ) -> Result<(), HistoryError> {
        let Some(hooks) = self.hooks.get(entity).and_then(|by_event| by_event.get(&event)) else {
            return Ok(());
        };
        for hook in hooks {
            hook.on_event(self.conn, event, payload)?;
        }
        Ok(())
    }

    fn execute(&self, sql: &str, params: &[SqlValue], context: &str) -> Result<usize, HistoryError> {
        self.conn
            .execute(sql, params_from_iter(params.iter()))
            .map_err(|err| storage_error(context, &err))
    }
}

fn key_of(meta: &TableMeta, record: &RecordValues) -> Value {
    record.get(&meta.primary_key).cloned().unwrap_or(Value::Null)
}

/// Quoted columns and bound values of `values`, in attribute order.
fn column_values(
    meta: &TableMeta,
    values: &RecordValues,
) -> Result<(Vec<String>, Vec<SqlValue>), HistoryError> {
    let mut columns = Vec::with_capacity(values.len());
    let mut params = Vec::with_capacity(values.len());
    for (attribute, value) in values {
        columns.push(quote_ident(meta.field(attribute)?));
        params.push(to_sql_value(value));
    }
    Ok((columns, params))
}

fn assignments(meta: &TableMeta, changes: &RecordValues) -> Result<(String, Vec<SqlValue>), HistoryError> {
    let (columns, params) = column_values(meta, changes)?;
    let assignments = columns
        .iter()
        .map(|column| format!("{column} = ?"))
        .collect::<Vec<_>>()
        .join(", ");
    Ok((assignments, params))
}

fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

fn format_rfc3339(value: OffsetDateTime) -> Result<String, HistoryError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| HistoryError::Storage(format!("failed to format RFC3339 timestamp: {err}")))
}
