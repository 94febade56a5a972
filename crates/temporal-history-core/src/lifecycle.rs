use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::{HistorySchema, Snapshot};
use crate::{CaptureMode, HistoryError};

/// Field values of one record, keyed by attribute name.
pub type RecordValues = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleEvent {
    BeforeUpdate,
    BeforeDestroy,
    BeforeBulkUpdate,
    BeforeBulkDestroy,
    AfterCreate,
    AfterUpdate,
    AfterDestroy,
    AfterRestore,
}

impl LifecycleEvent {
    pub const ALL: [Self; 8] = [
        Self::BeforeUpdate,
        Self::BeforeDestroy,
        Self::BeforeBulkUpdate,
        Self::BeforeBulkDestroy,
        Self::AfterCreate,
        Self::AfterUpdate,
        Self::AfterDestroy,
        Self::AfterRestore,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BeforeUpdate => "beforeUpdate",
            Self::BeforeDestroy => "beforeDestroy",
            Self::BeforeBulkUpdate => "beforeBulkUpdate",
            Self::BeforeBulkDestroy => "beforeBulkDestroy",
            Self::AfterCreate => "afterCreate",
            Self::AfterUpdate => "afterUpdate",
            Self::AfterDestroy => "afterDestroy",
            Self::AfterRestore => "afterRestore",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|event| event.as_str() == value)
    }

    #[must_use]
    pub fn is_bulk(self) -> bool {
        matches!(self, Self::BeforeBulkUpdate | Self::BeforeBulkDestroy)
    }

    #[must_use]
    pub fn is_before(self) -> bool {
        matches!(
            self,
            Self::BeforeUpdate
                | Self::BeforeDestroy
                | Self::BeforeBulkUpdate
                | Self::BeforeBulkDestroy
        )
    }
}

impl Display for LifecycleEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A loaded record as seen by a lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordState {
    /// Values after the mutation, or the pending values in a `before` event.
    pub current: RecordValues,
    /// Values as last read from storage, when they differ from `current`.
    pub previous: Option<RecordValues>,
}

impl RecordState {
    #[must_use]
    pub fn loaded(current: RecordValues) -> Self {
        Self {
            current,
            previous: None,
        }
    }

    #[must_use]
    pub fn changed(previous: RecordValues, current: RecordValues) -> Self {
        Self {
            current,
            previous: Some(previous),
        }
    }

    /// Values a snapshot records under `mode`.
    #[must_use]
    pub fn values_for(&self, mode: CaptureMode) -> &RecordValues {
        match (mode, &self.previous) {
            (CaptureMode::Diff, Some(previous)) => previous,
            _ => &self.current,
        }
    }
}

/// Conjunction of equality predicates. The empty filter matches every row.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `field = value`; a null value means `field IS NULL`.
    #[must_use]
    pub fn where_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.clauses.push((field.to_string(), value.into()));
        self
    }

    #[must_use]
    pub fn clauses(&self) -> &[(String, Value)] {
        &self.clauses
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    #[must_use]
    pub fn matches(&self, record: &RecordValues) -> bool {
        self.clauses.iter().all(|(field, expected)| {
            record.get(field).unwrap_or(&Value::Null) == expected
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub enum HookPayload<'a> {
    Record(&'a RecordState),
    Bulk {
        filter: &'a Filter,
        /// The host will also dispatch per-row events for this operation.
        individual_hooks: bool,
    },
}

/// Callback subscribed to one entity's lifecycle events. `Cx` is the
/// transaction scope of the triggering mutation.
pub trait LifecycleHook<Cx: ?Sized> {
    /// Runs inside the triggering mutation. An error aborts that mutation.
    ///
    /// # Errors
    /// Implementation defined; the host propagates the error to its caller.
    fn on_event(
        &self,
        cx: &Cx,
        event: LifecycleEvent,
        payload: &HookPayload<'_>,
    ) -> Result<(), HistoryError>;
}

pub trait HookRegistry<Cx: ?Sized> {
    #[allow(clippy::missing_errors_doc)]
    fn subscribe(
        &mut self,
        entity: &str,
        event: LifecycleEvent,
        hook: Box<dyn LifecycleHook<Cx>>,
    ) -> Result<(), HistoryError>;
}

/// Write access to a registered history entity.
pub trait HistoryHandle<Cx: ?Sized> {
    #[allow(clippy::missing_errors_doc)]
    fn insert(&self, cx: &Cx, snapshot: &Snapshot) -> Result<(), HistoryError>;

    /// Inserts every snapshot or none of them.
    #[allow(clippy::missing_errors_doc)]
    fn bulk_insert(&self, cx: &Cx, snapshots: &[Snapshot]) -> Result<usize, HistoryError>;
}

pub trait LiveQuery<Cx: ?Sized> {
    #[allow(clippy::missing_errors_doc)]
    fn find_all(&self, cx: &Cx, filter: &Filter) -> Result<Vec<RecordValues>, HistoryError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    BelongsTo,
    HasMany,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Relation {
    pub kind: RelationKind,
    pub source: String,
    pub target: String,
    pub foreign_key: String,
    pub target_key: String,
}

pub trait SchemaRegistry {
    type Handle;

    /// Defines the history entity and returns its write handle. Defining the
    /// same entity twice is an error.
    #[allow(clippy::missing_errors_doc)]
    fn define_history(&mut self, schema: &HistorySchema) -> Result<Self::Handle, HistoryError>;

    #[allow(clippy::missing_errors_doc)]
    fn declare_relation(&mut self, relation: &Relation) -> Result<(), HistoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(pairs: &[(&str, Value)]) -> RecordValues {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn event_names_round_trip() {
        for event in LifecycleEvent::ALL {
            assert_eq!(LifecycleEvent::parse(event.as_str()), Some(event));
        }
        assert_eq!(LifecycleEvent::parse("beforeCreate"), None);
        assert_eq!(
            serde_json::to_value(LifecycleEvent::BeforeBulkDestroy).ok(),
            Some(json!("beforeBulkDestroy"))
        );
    }

    #[test]
    fn diff_mode_prefers_previous_values() {
        let state = RecordState::changed(
            record(&[("name", json!("A"))]),
            record(&[("name", json!("B"))]),
        );
        assert_eq!(state.values_for(CaptureMode::Diff)["name"], json!("A"));
        assert_eq!(state.values_for(CaptureMode::Full)["name"], json!("B"));

        let loaded = RecordState::loaded(record(&[("name", json!("C"))]));
        assert_eq!(loaded.values_for(CaptureMode::Diff)["name"], json!("C"));
    }

    #[test]
    fn filter_matches_equality_conjunction() {
        let row = record(&[("name", json!("temp")), ("age", json!(3))]);
        assert!(Filter::new().matches(&row));
        assert!(Filter::new().where_eq("name", "temp").matches(&row));
        assert!(!Filter::new().where_eq("name", "temp").where_eq("age", 4).matches(&row));
        assert!(Filter::new().where_eq("missing", Value::Null).matches(&row));
    }
}
