use serde_json::Value;
use temporal_history_core::{AttributeDescriptor, DefaultValue, HistorySchema, LogicalType};
use tracing::debug;

use crate::tables::{quote_ident, quote_literal};

/// Millisecond UTC timestamp in the same shape the host stamps with.
pub(crate) const NOW_DEFAULT: &str = "(strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))";

/// `CREATE TABLE`, append-only triggers and non-unique indexes of a history
/// table. Every statement is idempotent.
#[must_use]
pub fn history_table_ddl(schema: &HistorySchema) -> String {
    let table = schema.table_name();
    let columns = schema
        .attributes
        .iter()
        .map(column_definition)
        .collect::<Vec<_>>()
        .join(",\n  ");

    let mut ddl = format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  {columns}\n);\n",
        quote_ident(table)
    );

    let message = quote_literal(&format!("{table} is append-only"));
    for (suffix, operation) in [("no_update", "UPDATE"), ("no_delete", "DELETE")] {
        ddl.push_str(&format!(
            "\nCREATE TRIGGER IF NOT EXISTS {trigger}\nBEFORE {operation} ON {table}\nBEGIN\n  SELECT RAISE(FAIL, {message});\nEND;\n",
            trigger = quote_ident(&format!("trg_{table}_{suffix}")),
            table = quote_ident(table),
        ));
    }

    for (idx, index) in schema.options.indexes.iter().enumerate() {
        if index.fields.is_empty() {
            continue;
        }
        if let Some(kind) = index.index_type.as_deref() {
            debug!(table, index_type = kind, "sqlite has no typed indexes; creating a plain index");
        }
        let fields = index
            .fields
            .iter()
            .map(|field| quote_ident(column_of(schema, field)))
            .collect::<Vec<_>>()
            .join(", ");
        ddl.push_str(&format!(
            "\nCREATE INDEX IF NOT EXISTS {} ON {}({fields});\n",
            quote_ident(&format!("idx_{table}_{idx}")),
            quote_ident(table)
        ));
    }

    ddl
}

fn column_of<'a>(schema: &'a HistorySchema, field: &'a str) -> &'a str {
    schema
        .attribute(field)
        .map_or(field, |attribute| attribute.field.as_str())
}

fn column_definition(attribute: &AttributeDescriptor) -> String {
    let name = quote_ident(&attribute.field);
    if attribute.primary_key && attribute.auto_increment {
        return format!("{name} INTEGER PRIMARY KEY AUTOINCREMENT");
    }

    let mut definition = format!("{name} {}", sql_type(&attribute.logical_type));
    if !attribute.allow_null {
        definition.push_str(" NOT NULL");
    }
    if let Some(default_value) = &attribute.default_value {
        definition.push_str(" DEFAULT ");
        definition.push_str(&default_sql(default_value));
    }
    definition
}

pub(crate) fn sql_type(logical_type: &LogicalType) -> &str {
    match logical_type {
        LogicalType::Integer | LogicalType::BigInt | LogicalType::Boolean => "INTEGER",
        LogicalType::Real => "REAL",
        LogicalType::Text | LogicalType::Date | LogicalType::DateTime | LogicalType::Json => "TEXT",
        LogicalType::Blob => "BLOB",
        LogicalType::Other(native) => native.as_str(),
    }
}

fn default_sql(default_value: &DefaultValue) -> String {
    match default_value {
        DefaultValue::Now => NOW_DEFAULT.to_string(),
        DefaultValue::Expression(expression) => format!("({expression})"),
        DefaultValue::Literal(value) => match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(flag) => i64::from(*flag).to_string(),
            Value::Number(number) => number.to_string(),
            Value::String(text) => quote_literal(text),
            nested => quote_literal(&nested.to_string()),
        },
    }
}
