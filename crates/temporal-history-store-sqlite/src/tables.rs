use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{Map, Number, Value};
use temporal_history_core::{
    AttributeDescriptor, Filter, HistoryError, HistoryHandle, HistorySchema, LiveQuery,
    LiveSchema, RecordValues, Snapshot, SURROGATE_KEY,
};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntityKind {
    Live,
    History,
}

/// What the host needs to read and write one entity's table. Records are
/// keyed by attribute name; SQL uses the backing column.
#[derive(Debug, Clone)]
pub(crate) struct TableMeta {
    pub(crate) entity: String,
    pub(crate) table: String,
    pub(crate) kind: EntityKind,
    /// Attribute name of the row key.
    pub(crate) primary_key: String,
    /// `(attribute, column)` in declaration order.
    pub(crate) columns: Vec<(String, String)>,
    /// `(created, updated)` attributes stamped by the host.
    pub(crate) timestamps: Option<(String, String)>,
    /// Deletion timestamp attribute of a paranoid entity.
    pub(crate) paranoid: Option<String>,
    /// False for `WITHOUT ROWID` tables.
    pub(crate) rowid: bool,
}

impl TableMeta {
    pub(crate) fn live(schema: &LiveSchema, rowid: bool) -> Result<Self, HistoryError> {
        let identity = schema.identity().ok_or_else(|| {
            HistoryError::Registration(format!(
                "live entity {} needs exactly one primary key",
                schema.options.name
            ))
        })?;
        let find = |wanted: &str| {
            schema
                .attributes
                .iter()
                .find(|attribute| attribute.name == wanted || attribute.field == wanted)
                .map(|attribute| attribute.name.clone())
        };

        let (created, updated, deleted) = if schema.options.underscored {
            ("created_at", "updated_at", "deleted_at")
        } else {
            ("createdAt", "updatedAt", "deletedAt")
        };
        let timestamps = if schema.options.timestamps {
            find(created).zip(find(updated))
        } else {
            None
        };
        let paranoid = if schema.options.paranoid {
            find(deleted)
        } else {
            None
        };

        Ok(Self {
            entity: schema.options.name.clone(),
            table: schema.options.table_name.clone(),
            kind: EntityKind::Live,
            primary_key: identity.name.clone(),
            columns: column_pairs(&schema.attributes),
            timestamps,
            paranoid,
            rowid,
        })
    }

    pub(crate) fn history(schema: &HistorySchema) -> Self {
        Self {
            entity: schema.entity().to_string(),
            table: schema.table_name().to_string(),
            kind: EntityKind::History,
            primary_key: SURROGATE_KEY.to_string(),
            columns: column_pairs(&schema.attributes),
            timestamps: None,
            paranoid: None,
            rowid: true,
        }
    }

    /// Column backing `attribute`.
    pub(crate) fn field(&self, attribute: &str) -> Result<&str, HistoryError> {
        self.columns
            .iter()
            .find(|(name, _)| name == attribute)
            .map(|(_, field)| field.as_str())
            .ok_or_else(|| {
                HistoryError::Storage(format!("{} has no attribute {attribute}", self.entity))
            })
    }

    fn select_list(&self) -> String {
        self.columns
            .iter()
            .map(|(_, field)| quote_ident(field))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn column_pairs(attributes: &[AttributeDescriptor]) -> Vec<(String, String)> {
    attributes
        .iter()
        .map(|attribute| (attribute.name.clone(), attribute.field.clone()))
        .collect()
}

/// Read access to a live table, scoped to the caller's transaction.
#[derive(Debug, Clone)]
pub struct SqliteLiveTable {
    pub(crate) meta: TableMeta,
}

impl SqliteLiveTable {
    #[must_use]
    pub fn entity(&self) -> &str {
        &self.meta.entity
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.meta.table
    }
}

impl LiveQuery<Connection> for SqliteLiveTable {
    fn find_all(&self, cx: &Connection, filter: &Filter) -> Result<Vec<RecordValues>, HistoryError> {
        select_rows(cx, &self.meta, filter, false)
    }
}

/// Insert access to a history table, scoped to the caller's transaction.
#[derive(Debug, Clone)]
pub struct SqliteHistoryTable {
    entity: String,
    table: String,
    /// `(attribute, column)` of every copied attribute.
    columns: Vec<(String, String)>,
}

impl SqliteHistoryTable {
    pub(crate) fn new(schema: &HistorySchema) -> Self {
        Self {
            entity: schema.entity().to_string(),
            table: schema.table_name().to_string(),
            columns: schema
                .copied_attributes()
                .map(|attribute| (attribute.name.clone(), attribute.field.clone()))
                .collect(),
        }
    }

    #[must_use]
    pub fn entity(&self) -> &str {
        &self.entity
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    fn insert_sql(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|(_, column)| quote_ident(column))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=self.columns.len())
            .map(|idx| format!("?{idx}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({columns}) VALUES ({placeholders})",
            quote_ident(&self.table)
        )
    }

    fn insert_one(&self, cx: &Connection, sql: &str, snapshot: &Snapshot) -> Result<(), HistoryError> {
        let values: Vec<SqlValue> = self
            .columns
            .iter()
            .map(|(attribute, _)| snapshot.get(attribute).map_or(SqlValue::Null, to_sql_value))
            .collect();
        let mut stmt = cx.prepare_cached(sql).map_err(|err| {
            storage_error(&format!("failed to prepare insert into {}", self.table), &err)
        })?;
        stmt.execute(params_from_iter(values.iter()))
            .map_err(|err| storage_error(&format!("failed to insert into {}", self.table), &err))?;
        Ok(())
    }
}

impl HistoryHandle<Connection> for SqliteHistoryTable {
    fn insert(&self, cx: &Connection, snapshot: &Snapshot) -> Result<(), HistoryError> {
        self.insert_one(cx, &self.insert_sql(), snapshot)
    }

    fn bulk_insert(&self, cx: &Connection, snapshots: &[Snapshot]) -> Result<usize, HistoryError> {
        if snapshots.is_empty() {
            return Ok(0);
        }

        let sql = self.insert_sql();
        cx.execute_batch("SAVEPOINT history_bulk_insert")
            .map_err(|err| storage_error("failed to open bulk insert savepoint", &err))?;
        let result = snapshots
            .iter()
            .try_for_each(|snapshot| self.insert_one(cx, &sql, snapshot));

        match result {
            Ok(()) => {
                cx.execute_batch("RELEASE history_bulk_insert")
                    .map_err(|err| storage_error("failed to release bulk insert savepoint", &err))?;
                Ok(snapshots.len())
            }
            Err(err) => {
                if let Err(rollback) =
                    cx.execute_batch("ROLLBACK TO history_bulk_insert; RELEASE history_bulk_insert")
                {
                    warn!(table = %self.table, error = %rollback, "failed to roll back bulk insert savepoint");
                }
                Err(err)
            }
        }
    }
}

/// Rows of `meta` matching `filter`, ordered by key. Soft-deleted rows of a
/// paranoid entity are skipped unless `include_deleted` is set.
pub(crate) fn select_rows(
    conn: &Connection,
    meta: &TableMeta,
    filter: &Filter,
    include_deleted: bool,
) -> Result<Vec<RecordValues>, HistoryError> {
    let (where_sql, params) = where_clause(meta, filter, include_deleted)?;
    select_where(conn, meta, &where_sql, &params)
}

/// Rows of `meta` matching a prebuilt ` WHERE ...` fragment.
pub(crate) fn select_where(
    conn: &Connection,
    meta: &TableMeta,
    where_sql: &str,
    params: &[SqlValue],
) -> Result<Vec<RecordValues>, HistoryError> {
    let sql = format!(
        "SELECT {} FROM {}{where_sql} ORDER BY {} ASC",
        meta.select_list(),
        quote_ident(&meta.table),
        quote_ident(meta.field(&meta.primary_key)?)
    );

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|err| storage_error(&format!("failed to query {}", meta.table), &err))?;
    let rows = stmt
        .query_map(params_from_iter(params.iter()), |row| {
            let mut values = RecordValues::new();
            for (idx, (name, _)) in meta.columns.iter().enumerate() {
                values.insert(name.clone(), from_sql_value(row.get_ref(idx)?));
            }
            Ok(values)
        })
        .map_err(|err| storage_error(&format!("failed to query {}", meta.table), &err))?;

    collect_rows(rows)
}

/// ` WHERE ...` for the filter, or an empty string when nothing applies.
/// Placeholders are positional so callers can bind values ahead of them.
pub(crate) fn where_clause(
    meta: &TableMeta,
    filter: &Filter,
    include_deleted: bool,
) -> Result<(String, Vec<SqlValue>), HistoryError> {
    let mut conditions = Vec::new();
    let mut params = Vec::new();
    for (attribute, value) in filter.clauses() {
        let field = quote_ident(meta.field(attribute)?);
        if value.is_null() {
            conditions.push(format!("{field} IS NULL"));
        } else {
            params.push(to_sql_value(value));
            conditions.push(format!("{field} = ?"));
        }
    }
    if let Some(deleted) = meta.paranoid.as_deref().filter(|_| !include_deleted) {
        conditions.push(format!("{} IS NULL", quote_ident(meta.field(deleted)?)));
    }

    if conditions.is_empty() {
        Ok((String::new(), params))
    } else {
        Ok((format!(" WHERE {}", conditions.join(" AND ")), params))
    }
}

/// Key of the single-entry object that carries a BLOB as base64 text.
pub const BLOB_TAG: &str = "$blob";

/// JSON form of a BLOB value, as read back from a table.
#[must_use]
pub fn blob_value(bytes: &[u8]) -> Value {
    let mut tagged = Map::new();
    tagged.insert(BLOB_TAG.to_string(), Value::String(STANDARD.encode(bytes)));
    Value::Object(tagged)
}

fn blob_bytes(value: &Map<String, Value>) -> Option<Vec<u8>> {
    if value.len() != 1 {
        return None;
    }
    let encoded = value.get(BLOB_TAG)?.as_str()?;
    STANDARD.decode(encoded).ok()
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub(crate) fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => {
            if let Some(integer) = number.as_i64() {
                SqlValue::Integer(integer)
            } else if let Some(real) = number.as_f64() {
                SqlValue::Real(real)
            } else {
                SqlValue::Text(number.to_string())
            }
        }
        Value::String(text) => SqlValue::Text(text.clone()),
        Value::Object(map) => match blob_bytes(map) {
            Some(bytes) => SqlValue::Blob(bytes),
            None => SqlValue::Text(value.to_string()),
        },
        Value::Array(_) => SqlValue::Text(value.to_string()),
    }
}

pub(crate) fn from_sql_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(integer) => Value::from(integer),
        ValueRef::Real(real) => Number::from_f64(real).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => blob_value(bytes),
    }
}

pub(crate) fn storage_error(context: &str, err: &rusqlite::Error) -> HistoryError {
    HistoryError::Storage(format!("{context}: {err}"))
}

pub(crate) fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>, HistoryError> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.map_err(|err| storage_error("failed to read row", &err))?);
    }
    Ok(values)
}
