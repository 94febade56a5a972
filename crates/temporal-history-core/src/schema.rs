use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::lifecycle::RecordValues;
use crate::{HistoryConfig, HistoryError};

/// Name of the auto-incrementing key every history entity carries.
pub const SURROGATE_KEY: &str = "hid";

const ARCHIVED_AT_CAMEL: &str = "archivedAt";
const ARCHIVED_AT_SNAKE: &str = "archived_at";
const HISTORY_ENTITY_SUFFIX: &str = "History";
const HISTORY_TABLE_SUFFIX_CAMEL: &str = "History";
const HISTORY_TABLE_SUFFIX_SNAKE: &str = "_histories";
const MANAGED_TIMESTAMPS: [&str; 4] = ["createdAt", "updatedAt", "created_at", "updated_at"];

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LogicalType {
    Integer,
    BigInt,
    Real,
    Boolean,
    Text,
    Date,
    DateTime,
    Json,
    Blob,
    Other(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DefaultValue {
    /// Current time at insert.
    Now,
    Literal(Value),
    /// Engine-native expression, passed through verbatim.
    Expression(String),
}

/// Storage-engine bookkeeping attached to a live attribute. Never copied
/// into a history schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct EngineBindings {
    /// Back-reference to the entity that owns the attribute.
    pub owner: Option<String>,
    /// Association that introduced the attribute, e.g. a foreign key.
    pub association: Option<String>,
    pub accessor: Option<String>,
    pub mutator: Option<String>,
}

impl EngineBindings {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.owner.is_none()
            && self.association.is_none()
            && self.accessor.is_none()
            && self.mutator.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AttributeDescriptor {
    pub name: String,
    /// Storage column backing the attribute.
    pub field: String,
    pub logical_type: LogicalType,
    pub allow_null: bool,
    pub default_value: Option<DefaultValue>,
    pub primary_key: bool,
    pub unique: bool,
    pub auto_increment: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "EngineBindings::is_empty")]
    pub bindings: EngineBindings,
}

impl AttributeDescriptor {
    /// A nullable attribute stored in a column of the same name.
    #[must_use]
    pub fn new(name: &str, logical_type: LogicalType) -> Self {
        Self {
            name: name.to_string(),
            field: name.to_string(),
            logical_type,
            allow_null: true,
            default_value: None,
            primary_key: false,
            unique: false,
            auto_increment: false,
            comment: None,
            bindings: EngineBindings::default(),
        }
    }

    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.allow_null = false;
        self
    }

    #[must_use]
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.allow_null = false;
        self
    }

    #[must_use]
    pub fn with_default(mut self, default_value: DefaultValue) -> Self {
        self.default_value = Some(default_value);
        self
    }

    #[must_use]
    pub fn with_field(mut self, field: &str) -> Self {
        self.field = field.to_string();
        self
    }

    #[must_use]
    pub fn with_bindings(mut self, bindings: EngineBindings) -> Self {
        self.bindings = bindings;
        self
    }

    /// Creation/update timestamps, in either naming convention.
    #[must_use]
    pub fn is_managed_timestamp(&self) -> bool {
        MANAGED_TIMESTAMPS.contains(&self.name.as_str())
            || MANAGED_TIMESTAMPS.contains(&self.field.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct IndexDefinition {
    pub name: Option<String>,
    pub fields: Vec<String>,
    pub unique: bool,
    /// Engine index type such as `UNIQUE`, `FULLTEXT` or `SPATIAL`.
    pub index_type: Option<String>,
}

impl IndexDefinition {
    #[must_use]
    pub fn on(fields: &[&str]) -> Self {
        Self {
            fields: fields.iter().map(|field| (*field).to_string()).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.unique
            || self
                .index_type
                .as_deref()
                .is_some_and(|kind| kind.eq_ignore_ascii_case("unique"))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct UniqueKey {
    pub name: String,
    pub fields: Vec<String>,
}

/// Table-level options of a live entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct TableOptions {
    /// Entity name.
    pub name: String,
    pub table_name: String,
    /// Store the entity is bound to.
    pub store: Option<String>,
    pub unique_keys: Vec<UniqueKey>,
    pub has_primary_key: bool,
    pub hooks: Vec<String>,
    pub scopes: BTreeMap<String, Value>,
    pub default_scope: Option<Value>,
    pub instance_methods: Vec<String>,
    /// Engine stamps `createdAt`/`updatedAt` itself.
    pub timestamps: bool,
    pub underscored: bool,
    /// Destroy sets a deletion timestamp instead of removing the row.
    pub paranoid: bool,
    pub indexes: Vec<IndexDefinition>,
    pub comment: Option<String>,
    /// Engine-specific options carried over untouched.
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LiveSchema {
    pub attributes: Vec<AttributeDescriptor>,
    pub options: TableOptions,
}

impl LiveSchema {
    #[must_use]
    pub fn new(name: &str, table_name: &str, attributes: Vec<AttributeDescriptor>) -> Self {
        let has_primary_key = attributes.iter().any(|attribute| attribute.primary_key);
        Self {
            attributes,
            options: TableOptions {
                name: name.to_string(),
                table_name: table_name.to_string(),
                has_primary_key,
                ..TableOptions::default()
            },
        }
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.attributes
            .iter()
            .find(|attribute| attribute.name == name)
    }

    /// The single primary-key attribute identifying a live record.
    #[must_use]
    pub fn identity(&self) -> Option<&AttributeDescriptor> {
        let mut keys = self.attributes.iter().filter(|attribute| attribute.primary_key);
        match (keys.next(), keys.next()) {
            (Some(key), None) => Some(key),
            _ => None,
        }
    }
}

/// Table-level options of a history entity. Identity, scope and hook
/// bookkeeping of the live options has no counterpart here.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryTableOptions {
    pub name: String,
    pub table_name: String,
    pub timestamps: bool,
    pub underscored: bool,
    pub indexes: Vec<IndexDefinition>,
    pub comment: Option<String>,
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistorySchema {
    /// Entity the history belongs to.
    pub live_entity: String,
    pub attributes: Vec<AttributeDescriptor>,
    pub options: HistoryTableOptions,
    /// Name of the archival timestamp attribute.
    pub archived_at: String,
}

impl HistorySchema {
    #[must_use]
    pub fn entity(&self) -> &str {
        &self.options.name
    }

    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.options.table_name
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.attributes
            .iter()
            .find(|attribute| attribute.name == name)
    }

    /// Attributes copied from the live schema, in live order.
    pub fn copied_attributes(&self) -> impl Iterator<Item = &AttributeDescriptor> + '_ {
        self.attributes
            .iter()
            .filter(move |attribute| !self.is_synthetic(&attribute.name))
    }

    #[must_use]
    pub fn is_synthetic(&self, name: &str) -> bool {
        name == SURROGATE_KEY || name == self.archived_at
    }

    /// Selects the copied attributes out of a full record. Attributes the
    /// record lacks materialize as null.
    #[must_use]
    pub fn project(&self, record: &RecordValues) -> Snapshot {
        let values = self
            .copied_attributes()
            .map(|attribute| {
                let value = record.get(&attribute.name).cloned().unwrap_or(Value::Null);
                (attribute.name.clone(), value)
            })
            .collect();
        Snapshot { values }
    }

    /// Re-checks the structural invariants of a derived schema.
    ///
    /// # Errors
    /// Returns [`HistoryError::SchemaDerivation`] naming the first violated
    /// invariant.
    pub fn validate(&self) -> Result<(), HistoryError> {
        let mut seen = BTreeSet::new();
        for attribute in &self.attributes {
            if !seen.insert(attribute.name.as_str()) {
                return Err(HistoryError::SchemaDerivation(format!(
                    "duplicate attribute {}",
                    attribute.name
                )));
            }
        }

        let keys: Vec<_> = self
            .attributes
            .iter()
            .filter(|attribute| attribute.primary_key || attribute.auto_increment)
            .collect();
        match keys.as_slice() {
            [key] if key.name == SURROGATE_KEY && key.primary_key && key.auto_increment => {}
            _ => {
                return Err(HistoryError::SchemaDerivation(format!(
                    "history schema MUST have exactly one auto-increment key named {SURROGATE_KEY}"
                )))
            }
        }

        if let Some(attribute) = self
            .attributes
            .iter()
            .find(|attribute| attribute.unique && attribute.name != SURROGATE_KEY)
        {
            return Err(HistoryError::SchemaDerivation(format!(
                "history attribute {} MUST NOT be unique",
                attribute.name
            )));
        }

        let archived = self.attribute(&self.archived_at).ok_or_else(|| {
            HistoryError::SchemaDerivation(format!(
                "history schema is missing archival attribute {}",
                self.archived_at
            ))
        })?;
        if archived.allow_null || archived.default_value != Some(DefaultValue::Now) {
            return Err(HistoryError::SchemaDerivation(format!(
                "{} MUST be non-null and default to the current time",
                self.archived_at
            )));
        }

        if self.options.indexes.iter().any(IndexDefinition::is_unique) {
            return Err(HistoryError::SchemaDerivation(
                "history schema MUST NOT carry unique indexes".to_string(),
            ));
        }

        Ok(())
    }
}

/// One history row's copied values, built by [`HistorySchema::project`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    values: RecordValues,
}

impl Snapshot {
    #[must_use]
    pub fn values(&self) -> &RecordValues {
        &self.values
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

/// Derives the history schema of a live entity.
///
/// # Errors
/// Returns [`HistoryError::SchemaDerivation`] when the live schema has no
/// usable entity or table name, has no attributes, or already uses one of
/// the history-only attribute names.
pub fn derive_history_schema(
    live: &LiveSchema,
    config: &HistoryConfig,
) -> Result<HistorySchema, HistoryError> {
    let live_name = live.options.name.trim();
    if live_name.is_empty() {
        return Err(HistoryError::SchemaDerivation(
            "live schema has no entity name".to_string(),
        ));
    }

    let live_table = live.options.table_name.trim();
    if live_table.is_empty() {
        return Err(HistoryError::SchemaDerivation(format!(
            "live schema {live_name} has no table name"
        )));
    }

    if live.attributes.is_empty() {
        return Err(HistoryError::SchemaDerivation(format!(
            "live schema {live_name} has no attributes"
        )));
    }

    let archived_at = if config.underscored {
        ARCHIVED_AT_SNAKE
    } else {
        ARCHIVED_AT_CAMEL
    };
    for reserved in [SURROGATE_KEY, archived_at] {
        if live
            .attributes
            .iter()
            .any(|attribute| attribute.name == reserved || attribute.field == reserved)
        {
            return Err(HistoryError::SchemaDerivation(format!(
                "live schema {live_name} already defines history attribute {reserved}"
            )));
        }
    }

    let mut attributes: Vec<_> = live.attributes.iter().map(history_attribute).collect();
    attributes.push(
        AttributeDescriptor::new(SURROGATE_KEY, LogicalType::BigInt)
            .primary_key()
            .auto_increment()
            .unique(),
    );
    attributes.push(
        AttributeDescriptor::new(archived_at, LogicalType::DateTime)
            .not_null()
            .with_default(DefaultValue::Now),
    );

    let table_suffix = if config.underscored {
        HISTORY_TABLE_SUFFIX_SNAKE
    } else {
        HISTORY_TABLE_SUFFIX_CAMEL
    };
    let options = HistoryTableOptions {
        name: format!("{live_name}{HISTORY_ENTITY_SUFFIX}"),
        table_name: format!("{live_table}{table_suffix}"),
        timestamps: false,
        underscored: config.underscored,
        indexes: live
            .options
            .indexes
            .iter()
            .filter(|index| !index.is_unique())
            .cloned()
            .collect(),
        comment: live.options.comment.clone(),
        extra: live.options.extra.clone(),
    };

    Ok(HistorySchema {
        live_entity: live_name.to_string(),
        attributes,
        options,
        archived_at: archived_at.to_string(),
    })
}

fn history_attribute(live: &AttributeDescriptor) -> AttributeDescriptor {
    let mut attribute = AttributeDescriptor {
        primary_key: false,
        unique: false,
        auto_increment: false,
        bindings: EngineBindings::default(),
        ..live.clone()
    };

    // History keeps the live record's stamp; it must never regenerate one.
    if attribute.is_managed_timestamp() {
        attribute.logical_type = LogicalType::DateTime;
        attribute.default_value = None;
    }

    attribute
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn user_schema() -> LiveSchema {
        let mut schema = LiveSchema::new(
            "User",
            "Users",
            vec![
                AttributeDescriptor::new("id", LogicalType::Integer)
                    .primary_key()
                    .auto_increment(),
                AttributeDescriptor::new("name", LogicalType::Text).not_null(),
                AttributeDescriptor::new("email", LogicalType::Text)
                    .unique()
                    .with_bindings(EngineBindings {
                        owner: Some("User".to_string()),
                        accessor: Some("getEmail".to_string()),
                        mutator: Some("setEmail".to_string()),
                        association: None,
                    }),
                AttributeDescriptor::new("createdAt", LogicalType::DateTime)
                    .not_null()
                    .with_default(DefaultValue::Now),
                AttributeDescriptor::new("updatedAt", LogicalType::Text).not_null(),
            ],
        );
        schema.options.timestamps = true;
        schema.options.paranoid = true;
        schema.options.unique_keys = vec![UniqueKey {
            name: "users_email_unique".to_string(),
            fields: vec!["email".to_string()],
        }];
        schema.options.hooks = vec!["beforeUpdate".to_string()];
        schema.options.scopes.insert("active".to_string(), json!({ "where": {} }));
        schema.options.instance_methods = vec!["greet".to_string()];
        schema.options.extra.insert("charset".to_string(), json!("utf8mb4"));
        schema.options.indexes = vec![
            IndexDefinition::on(&["name"]),
            IndexDefinition {
                unique: true,
                ..IndexDefinition::on(&["email"])
            },
            IndexDefinition {
                index_type: Some("UNIQUE".to_string()),
                ..IndexDefinition::on(&["name", "email"])
            },
            IndexDefinition {
                index_type: Some("FULLTEXT".to_string()),
                ..IndexDefinition::on(&["name"])
            },
        ];
        schema
    }

    #[test]
    fn derived_schema_appends_surrogate_key_and_archival_timestamp() {
        let history = must_ok(derive_history_schema(&user_schema(), &HistoryConfig::default()));

        let names: Vec<_> = history.attributes.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["id", "name", "email", "createdAt", "updatedAt", "hid", "archivedAt"]
        );

        let hid = must_some(history.attribute(SURROGATE_KEY));
        assert!(hid.primary_key && hid.auto_increment && hid.unique);
        assert_eq!(hid.logical_type, LogicalType::BigInt);

        let archived = must_some(history.attribute("archivedAt"));
        assert!(!archived.allow_null);
        assert_eq!(archived.default_value, Some(DefaultValue::Now));
        must_ok(history.validate());
    }

    #[test]
    fn copied_attributes_lose_key_flags_and_engine_bindings() {
        let history = must_ok(derive_history_schema(&user_schema(), &HistoryConfig::default()));

        let id = must_some(history.attribute("id"));
        assert!(!id.primary_key);
        assert!(!id.auto_increment);
        assert!(!id.allow_null);

        let email = must_some(history.attribute("email"));
        assert!(!email.unique);
        assert!(email.bindings.is_empty());
    }

    #[test]
    fn managed_timestamps_become_plain_datetimes_without_now_default() {
        let history = must_ok(derive_history_schema(&user_schema(), &HistoryConfig::default()));

        let created = must_some(history.attribute("createdAt"));
        assert_eq!(created.logical_type, LogicalType::DateTime);
        assert_eq!(created.default_value, None);

        let updated = must_some(history.attribute("updatedAt"));
        assert_eq!(updated.logical_type, LogicalType::DateTime);
    }

    #[test]
    fn snake_case_timestamps_are_recognized_by_field_name() {
        let live = LiveSchema::new(
            "Post",
            "posts",
            vec![
                AttributeDescriptor::new("id", LogicalType::Integer).primary_key(),
                AttributeDescriptor::new("createdOn", LogicalType::Text)
                    .with_field("created_at")
                    .with_default(DefaultValue::Now),
            ],
        );
        let history = must_ok(derive_history_schema(&live, &HistoryConfig::default()));
        let created = must_some(history.attribute("createdOn"));
        assert_eq!(created.logical_type, LogicalType::DateTime);
        assert_eq!(created.default_value, None);
    }

    #[test]
    fn managed_timestamps_drop_expression_defaults_too() {
        let live = LiveSchema::new(
            "Event",
            "events",
            vec![
                AttributeDescriptor::new("id", LogicalType::Integer).primary_key(),
                AttributeDescriptor::new("createdAt", LogicalType::Text)
                    .with_default(DefaultValue::Expression("datetime('now')".to_string())),
                AttributeDescriptor::new("updatedAt", LogicalType::Text)
                    .with_default(DefaultValue::Literal(json!("1970-01-01T00:00:00Z"))),
                AttributeDescriptor::new("kind", LogicalType::Text)
                    .with_default(DefaultValue::Expression("lower('A')".to_string())),
            ],
        );
        let history = must_ok(derive_history_schema(&live, &HistoryConfig::default()));

        assert_eq!(must_some(history.attribute("createdAt")).default_value, None);
        assert_eq!(must_some(history.attribute("updatedAt")).default_value, None);
        assert_eq!(
            must_some(history.attribute("kind")).default_value,
            Some(DefaultValue::Expression("lower('A')".to_string()))
        );
    }

    #[test]
    fn unique_indexes_are_dropped() {
        let history = must_ok(derive_history_schema(&user_schema(), &HistoryConfig::default()));
        assert_eq!(history.options.indexes.len(), 2);
        assert!(history.options.indexes.iter().all(|index| !index.is_unique()));
        assert_eq!(
            history.options.indexes[1].index_type.as_deref(),
            Some("FULLTEXT")
        );
    }

    #[test]
    fn table_options_keep_passthrough_and_override_naming() {
        let history = must_ok(derive_history_schema(&user_schema(), &HistoryConfig::default()));
        assert_eq!(history.entity(), "UserHistory");
        assert_eq!(history.table_name(), "UsersHistory");
        assert_eq!(history.live_entity, "User");
        assert!(!history.options.timestamps);
        assert!(!history.options.underscored);
        assert_eq!(history.options.extra.get("charset"), Some(&json!("utf8mb4")));
    }

    #[test]
    fn underscored_config_switches_generated_names() {
        let config = HistoryConfig {
            underscored: true,
            ..HistoryConfig::default()
        };
        let history = must_ok(derive_history_schema(&user_schema(), &config));
        assert_eq!(history.archived_at, "archived_at");
        assert!(history.attribute("archived_at").is_some());
        assert!(history.attribute("archivedAt").is_none());
        assert_eq!(history.table_name(), "Users_histories");
        assert_eq!(history.entity(), "UserHistory");
        assert!(history.options.underscored);
    }

    #[test]
    fn missing_table_name_fails_derivation() {
        let mut live = user_schema();
        live.options.table_name = "  ".to_string();
        let result = derive_history_schema(&live, &HistoryConfig::default());
        assert!(matches!(result, Err(HistoryError::SchemaDerivation(_))));
    }

    #[test]
    fn reserved_attribute_names_fail_derivation() {
        let mut live = user_schema();
        live.attributes
            .push(AttributeDescriptor::new("archivedAt", LogicalType::DateTime));
        let err = match derive_history_schema(&live, &HistoryConfig::default()) {
            Ok(_) => panic!("expected archivedAt collision to fail"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("archivedAt"));

        let mut live = user_schema();
        live.attributes
            .push(AttributeDescriptor::new("hid", LogicalType::Integer));
        assert!(derive_history_schema(&live, &HistoryConfig::default()).is_err());
    }

    #[test]
    fn projection_materializes_copied_attributes_only() {
        let history = must_ok(derive_history_schema(&user_schema(), &HistoryConfig::default()));
        let mut record = RecordValues::new();
        record.insert("id".to_string(), json!(1));
        record.insert("name".to_string(), json!("A"));
        record.insert("unrelated".to_string(), json!(true));

        let snapshot = history.project(&record);
        assert_eq!(snapshot.values().len(), 5);
        assert_eq!(snapshot.get("name"), Some(&json!("A")));
        assert_eq!(snapshot.get("email"), Some(&Value::Null));
        assert!(snapshot.get("unrelated").is_none());
        assert!(snapshot.get(SURROGATE_KEY).is_none());
        assert!(snapshot.get("archivedAt").is_none());
    }

    #[test]
    fn identity_requires_exactly_one_primary_key() {
        let live = user_schema();
        assert_eq!(must_some(live.identity()).name, "id");

        let composite = LiveSchema::new(
            "Pair",
            "pairs",
            vec![
                AttributeDescriptor::new("a", LogicalType::Integer).primary_key(),
                AttributeDescriptor::new("b", LogicalType::Integer).primary_key(),
            ],
        );
        assert!(composite.identity().is_none());
    }

    fn arb_attribute(idx: usize) -> impl Strategy<Value = AttributeDescriptor> {
        (any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
            move |(primary_key, unique, auto_increment, now_default)| {
                let mut attribute =
                    AttributeDescriptor::new(&format!("c{idx}"), LogicalType::Integer);
                attribute.primary_key = primary_key;
                attribute.unique = unique;
                attribute.auto_increment = auto_increment;
                if now_default {
                    attribute.default_value = Some(DefaultValue::Now);
                }
                attribute
            },
        )
    }

    fn arb_live_schema() -> impl Strategy<Value = LiveSchema> {
        (1usize..12)
            .prop_flat_map(|count| {
                let attributes: Vec<_> = (0..count).map(arb_attribute).collect();
                let indexes = prop::collection::vec(
                    (any::<bool>(), 0u8..3, 0..count),
                    0..6,
                );
                (attributes, indexes)
            })
            .prop_map(|(attributes, indexes)| {
                let mut schema = LiveSchema::new("Thing", "things", attributes);
                schema.options.indexes = indexes
                    .into_iter()
                    .map(|(unique, kind, column)| IndexDefinition {
                        name: None,
                        fields: vec![format!("c{column}")],
                        unique,
                        index_type: match kind {
                            0 => None,
                            1 => Some("unique".to_string()),
                            _ => Some("BTREE".to_string()),
                        },
                    })
                    .collect();
                schema
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_derived_schema_has_one_key_and_one_archival_timestamp(
            live in arb_live_schema(),
            underscored in any::<bool>(),
        ) {
            let config = HistoryConfig { underscored, ..HistoryConfig::default() };
            let history = must_ok(derive_history_schema(&live, &config));

            prop_assert!(history.validate().is_ok());
            let keys = history.attributes.iter().filter(|a| a.primary_key || a.auto_increment).count();
            prop_assert_eq!(keys, 1);
            let archival = history.attributes.iter().filter(|a| a.name == history.archived_at).count();
            prop_assert_eq!(archival, 1);
            prop_assert!(live.attribute(SURROGATE_KEY).is_none());
            prop_assert!(live.attribute(&history.archived_at).is_none());
            prop_assert_eq!(history.attributes.len(), live.attributes.len() + 2);
        }

        #[test]
        fn prop_unique_indexes_never_survive(live in arb_live_schema()) {
            let history = must_ok(derive_history_schema(&live, &HistoryConfig::default()));
            let kept = live.options.indexes.iter().filter(|index| !index.is_unique()).count();
            prop_assert_eq!(history.options.indexes.len(), kept);
            prop_assert!(history.options.indexes.iter().all(|index| !index.is_unique()));
        }
    }
}
