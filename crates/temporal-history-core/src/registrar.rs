use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::interceptor::{MutationInterceptor, ReadOnlyGuard, SnapshotFailureSink, GUARDED_EVENTS};
use crate::lifecycle::{
    HistoryHandle, HookRegistry, LifecycleEvent, LiveQuery, Relation, RelationKind,
    SchemaRegistry,
};
use crate::schema::{derive_history_schema, HistorySchema, LiveSchema};
use crate::{HistoryConfig, HistoryError};

/// Setup result for one live entity.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryBinding {
    pub live_entity: String,
    pub history_entity: String,
    pub history_table: String,
    pub config: HistoryConfig,
    pub schema: Arc<HistorySchema>,
    /// Live events the interceptor listens to.
    pub captured_events: Vec<LifecycleEvent>,
    pub relations: Vec<Relation>,
}

/// Defines `schema` with the registry and declares history → live
/// (belongs-to) and live → history (has-many), both keyed by the live
/// identity attribute.
///
/// # Errors
/// Returns [`HistoryError::Registration`] when the live schema has no
/// single identity attribute, and any error raised by the registry.
pub fn register_history<R: SchemaRegistry>(
    registry: &mut R,
    live: &LiveSchema,
    schema: &HistorySchema,
) -> Result<(R::Handle, Vec<Relation>), HistoryError> {
    let identity = live.identity().ok_or_else(|| {
        HistoryError::Registration(format!(
            "live entity {} needs exactly one primary key to own a history",
            live.options.name
        ))
    })?;

    let relations = vec![
        Relation {
            kind: RelationKind::BelongsTo,
            source: schema.entity().to_string(),
            target: schema.live_entity.clone(),
            foreign_key: identity.name.clone(),
            target_key: identity.name.clone(),
        },
        Relation {
            kind: RelationKind::HasMany,
            source: schema.live_entity.clone(),
            target: schema.entity().to_string(),
            foreign_key: identity.name.clone(),
            target_key: identity.name.clone(),
        },
    ];

    let handle = registry.define_history(schema)?;
    for relation in &relations {
        registry.declare_relation(relation)?;
    }
    Ok((handle, relations))
}

/// Derives, registers, guards and intercepts the history of one live
/// entity. Derivation runs before anything is registered.
///
/// # Errors
/// Returns [`HistoryError::SchemaDerivation`] for a malformed live schema
/// and any registration or subscription error of the host.
pub fn bind<Cx, E, Q>(
    host: &mut E,
    live: &LiveSchema,
    config: HistoryConfig,
    live_query: Q,
    sink: Arc<dyn SnapshotFailureSink>,
) -> Result<HistoryBinding, HistoryError>
where
    Cx: ?Sized + 'static,
    E: SchemaRegistry + HookRegistry<Cx>,
    E::Handle: HistoryHandle<Cx> + Clone + 'static,
    Q: LiveQuery<Cx> + Clone + 'static,
{
    let schema = Arc::new(derive_history_schema(live, &config)?);
    let (handle, relations) = register_history(host, live, &schema)?;

    for event in GUARDED_EVENTS {
        host.subscribe(
            schema.entity(),
            event,
            Box::new(ReadOnlyGuard::new(schema.entity())),
        )?;
    }

    let captured_events = MutationInterceptor::<E::Handle, Q>::subscribed_events(&config).to_vec();
    let interceptor = MutationInterceptor::new(config, Arc::clone(&schema), handle, live_query, sink);
    for event in &captured_events {
        host.subscribe(&schema.live_entity, *event, Box::new(interceptor.clone()))?;
    }

    info!(
        live_entity = %schema.live_entity,
        history_entity = %schema.entity(),
        history_table = %schema.table_name(),
        blocking = config.blocking,
        full = config.full,
        "history binding installed"
    );

    Ok(HistoryBinding {
        live_entity: schema.live_entity.clone(),
        history_entity: schema.entity().to_string(),
        history_table: schema.table_name().to_string(),
        config,
        schema,
        captured_events,
        relations,
    })
}
