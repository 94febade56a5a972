use rusqlite::{params, Connection, OptionalExtension};
use temporal_history_core::{
    AttributeDescriptor, DefaultValue, HistoryError, IndexDefinition, LiveSchema, LogicalType,
    UniqueKey,
};
use tracing::debug;

use crate::tables::{collect_rows, quote_literal, storage_error};

struct ColumnInfo {
    name: String,
    declared_type: String,
    not_null: bool,
    default_value: Option<String>,
    pk_position: i64,
}

struct IndexInfo {
    name: String,
    unique: bool,
    origin: String,
}

pub(crate) fn table_exists(conn: &Connection, table_name: &str) -> Result<bool, HistoryError> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .map_err(|err| storage_error("failed to query sqlite_master", &err))?
        .is_some();

    Ok(exists)
}

/// Whether `table_name` keeps an implicit rowid, i.e. is not declared
/// `WITHOUT ROWID`.
pub(crate) fn has_rowid(conn: &Connection, table_name: &str) -> Result<bool, HistoryError> {
    let without_rowid = conn
        .query_row(
            "SELECT wr
             FROM pragma_table_list(?1)
             WHERE schema = 'main'",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map_err(|err| storage_error(&format!("failed to inspect table_list for {table_name}"), &err))?;

    Ok(without_rowid != Some(1))
}

/// Builds the live schema of an existing table. The entity is named after
/// the table.
pub(crate) fn introspect_table(conn: &Connection, table_name: &str) -> Result<LiveSchema, HistoryError> {
    if !table_exists(conn, table_name)? {
        return Err(HistoryError::Storage(format!("table {table_name} does not exist")));
    }

    let columns = table_columns(conn, table_name)?;
    let key_columns: Vec<&ColumnInfo> = columns.iter().filter(|column| column.pk_position > 0).collect();
    // A lone INTEGER PRIMARY KEY aliases the rowid and is assigned on insert.
    let rowid_alias = match key_columns.as_slice() {
        [key] if key.declared_type.eq_ignore_ascii_case("INTEGER") && has_rowid(conn, table_name)? => {
            Some(key.name.clone())
        }
        _ => None,
    };

    let mut attributes: Vec<AttributeDescriptor> = columns
        .iter()
        .map(|column| {
            let mut attribute = AttributeDescriptor::new(&column.name, logical_type(&column.declared_type));
            attribute.allow_null = !column.not_null;
            attribute.default_value = column.default_value.as_deref().map(default_value);
            if column.pk_position > 0 {
                attribute = attribute.primary_key();
            }
            if rowid_alias.as_deref() == Some(column.name.as_str()) {
                attribute = attribute.auto_increment();
            }
            attribute
        })
        .collect();

    let mut schema_indexes = Vec::new();
    let mut unique_keys = Vec::new();
    for index in table_indexes(conn, table_name)? {
        if index.origin == "pk" {
            continue;
        }
        let Some(fields) = index_columns(conn, &index.name)? else {
            debug!(table = table_name, index = %index.name, "skipping expression index");
            continue;
        };
        match (index.origin.as_str(), fields.as_slice()) {
            ("u", [field]) => {
                if let Some(attribute) = attributes.iter_mut().find(|attribute| &attribute.field == field) {
                    attribute.unique = true;
                }
            }
            ("u", _) => unique_keys.push(UniqueKey {
                name: index.name,
                fields,
            }),
            _ => schema_indexes.push(IndexDefinition {
                name: Some(index.name),
                fields,
                unique: index.unique,
                index_type: None,
            }),
        }
    }

    let has = |name: &str| columns.iter().any(|column| column.name == name);
    let underscored = ["created_at", "updated_at", "deleted_at"].into_iter().any(has);
    let (created, updated, deleted) = if underscored {
        ("created_at", "updated_at", "deleted_at")
    } else {
        ("createdAt", "updatedAt", "deletedAt")
    };

    let mut schema = LiveSchema::new(table_name, table_name, attributes);
    schema.options.underscored = underscored;
    schema.options.timestamps = has(created) && has(updated);
    schema.options.paranoid = has(deleted);
    schema.options.indexes = schema_indexes;
    schema.options.unique_keys = unique_keys;

    debug!(
        table = table_name,
        attributes = schema.attributes.len(),
        indexes = schema.options.indexes.len(),
        timestamps = schema.options.timestamps,
        paranoid = schema.options.paranoid,
        "introspected live table"
    );
    Ok(schema)
}

fn table_columns(conn: &Connection, table_name: &str) -> Result<Vec<ColumnInfo>, HistoryError> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", quote_literal(table_name)))
        .map_err(|err| storage_error(&format!("failed to inspect table_info for {table_name}"), &err))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ColumnInfo {
                name: row.get(1)?,
                declared_type: row.get(2)?,
                not_null: row.get::<_, i64>(3)? == 1,
                default_value: row.get(4)?,
                pk_position: row.get(5)?,
            })
        })
        .map_err(|err| storage_error(&format!("failed to inspect table_info for {table_name}"), &err))?;
    collect_rows(rows)
}

fn table_indexes(conn: &Connection, table_name: &str) -> Result<Vec<IndexInfo>, HistoryError> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_list({})", quote_literal(table_name)))
        .map_err(|err| storage_error(&format!("failed to inspect index_list for {table_name}"), &err))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(IndexInfo {
                name: row.get(1)?,
                unique: row.get::<_, i64>(2)? == 1,
                origin: row.get(3)?,
            })
        })
        .map_err(|err| storage_error(&format!("failed to inspect index_list for {table_name}"), &err))?;
    collect_rows(rows)
}

/// Columns of an index, or `None` when a part of it is an expression.
fn index_columns(conn: &Connection, index_name: &str) -> Result<Option<Vec<String>>, HistoryError> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_info({})", quote_literal(index_name)))
        .map_err(|err| storage_error(&format!("failed to inspect index_info for {index_name}"), &err))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, Option<String>>(2))
        .map_err(|err| storage_error(&format!("failed to inspect index_info for {index_name}"), &err))?;
    Ok(collect_rows(rows)?.into_iter().collect())
}

/// SQLite column affinity rules, refined for the common declared names.
fn logical_type(declared: &str) -> LogicalType {
    let upper = declared.trim().to_ascii_uppercase();
    if upper.is_empty() {
        LogicalType::Blob
    } else if upper.contains("BIGINT") {
        LogicalType::BigInt
    } else if upper.contains("INT") {
        LogicalType::Integer
    } else if upper.contains("BOOL") {
        LogicalType::Boolean
    } else if upper.contains("DATETIME") || upper.contains("TIMESTAMP") {
        LogicalType::DateTime
    } else if upper.contains("DATE") {
        LogicalType::Date
    } else if upper.contains("JSON") {
        LogicalType::Json
    } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
        LogicalType::Text
    } else if upper.contains("BLOB") {
        LogicalType::Blob
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        LogicalType::Real
    } else {
        LogicalType::Other(declared.trim().to_string())
    }
}

fn default_value(raw: &str) -> DefaultValue {
    if raw.eq_ignore_ascii_case("CURRENT_TIMESTAMP") {
        DefaultValue::Now
    } else {
        DefaultValue::Expression(raw.to_string())
    }
}
