//! Append-only audit history for mutable record stores.
//!
//! A live entity is paired with a derived history entity:
//! - [`derive_history_schema`] turns a [`LiveSchema`] into a [`HistorySchema`].
//! - [`register_history`] defines that schema with a [`SchemaRegistry`] and
//!   declares the live/history ownership relations.
//! - [`MutationInterceptor`] captures a [`Snapshot`] on each relevant
//!   [`LifecycleEvent`] of the live entity.
//! - [`ReadOnlyGuard`] rejects every mutation attempted on the history entity.
//!
//! [`bind`] runs the whole setup once per live entity and returns a
//! [`HistoryBinding`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

mod interceptor;
mod lifecycle;
mod registrar;
mod schema;

pub use interceptor::{
    ChannelFailureSink, LogFailureSink, MutationInterceptor, ReadOnlyGuard, SnapshotFailure,
    SnapshotFailureSink, GUARDED_EVENTS,
};
pub use lifecycle::{
    Filter, HistoryHandle, HookPayload, HookRegistry, LifecycleEvent, LifecycleHook, LiveQuery,
    RecordState, RecordValues, Relation, RelationKind, SchemaRegistry,
};
pub use registrar::{bind, register_history, HistoryBinding};
pub use schema::{
    derive_history_schema, AttributeDescriptor, DefaultValue, EngineBindings,
    HistorySchema, HistoryTableOptions, IndexDefinition, LiveSchema, LogicalType, Snapshot,
    TableOptions, UniqueKey, SURROGATE_KEY,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum HistoryError {
    #[error("schema derivation error: {0}")]
    SchemaDerivation(String),
    #[error("registration error: {0}")]
    Registration(String),
    #[error("read-only violation: {0}")]
    ReadOnlyViolation(String),
    #[error("snapshot write failure: {0}")]
    SnapshotWrite(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Which side of a mutation a snapshot records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Pre-mutation values on update and destroy.
    Diff,
    /// Post-mutation values on create, update, destroy and restore.
    Full,
}

/// Per-binding options. Fixed once a binding exists.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HistoryConfig {
    /// Snapshot writes complete as part of the triggering mutation.
    pub blocking: bool,
    /// Capture post-state on every event instead of pre-state on update/destroy.
    pub full: bool,
    /// `archived_at` / `_histories` instead of `archivedAt` / `History`.
    pub underscored: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            blocking: true,
            full: false,
            underscored: false,
        }
    }
}

impl HistoryConfig {
    #[must_use]
    pub fn capture_mode(&self) -> CaptureMode {
        if self.full {
            CaptureMode::Full
        } else {
            CaptureMode::Diff
        }
    }

    /// Decodes a config from JSON. Missing keys take their defaults.
    ///
    /// # Errors
    /// Returns [`HistoryError::Configuration`] when the payload is not an
    /// object of known boolean options.
    pub fn from_json(value: &Value) -> Result<Self, HistoryError> {
        serde_json::from_value(value.clone()).map_err(|err| {
            HistoryError::Configuration(format!("invalid history config JSON payload: {err}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn default_config_is_blocking_diff_camel_case() {
        let config = HistoryConfig::default();
        assert!(config.blocking);
        assert!(!config.full);
        assert!(!config.underscored);
        assert_eq!(config.capture_mode(), CaptureMode::Diff);
    }

    #[test]
    fn config_json_fills_missing_keys_with_defaults() {
        let config = must_ok(HistoryConfig::from_json(&json!({ "full": true })));
        assert!(config.blocking);
        assert!(config.full);
        assert_eq!(config.capture_mode(), CaptureMode::Full);
    }

    #[test]
    fn config_json_rejects_unknown_keys() {
        let err = match HistoryConfig::from_json(&json!({ "blockng": false })) {
            Ok(_) => panic!("expected unknown key to be rejected"),
            Err(err) => err,
        };
        assert!(matches!(err, HistoryError::Configuration(_)));
        assert!(err.to_string().contains("blockng"));
    }

    #[test]
    fn config_json_rejects_non_boolean_values() {
        let result = HistoryConfig::from_json(&json!({ "blocking": "yes" }));
        assert!(matches!(result, Err(HistoryError::Configuration(_))));
    }
}
