use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::lifecycle::{
    Filter, HistoryHandle, HookPayload, LifecycleEvent, LifecycleHook, LiveQuery, RecordState,
};
use crate::schema::HistorySchema;
use crate::{CaptureMode, HistoryConfig, HistoryError};

/// Events a history entity rejects outright.
pub const GUARDED_EVENTS: [LifecycleEvent; 4] = [
    LifecycleEvent::BeforeUpdate,
    LifecycleEvent::BeforeDestroy,
    LifecycleEvent::BeforeBulkUpdate,
    LifecycleEvent::BeforeBulkDestroy,
];

const DIFF_EVENTS: [LifecycleEvent; 4] = [
    LifecycleEvent::BeforeUpdate,
    LifecycleEvent::BeforeDestroy,
    LifecycleEvent::BeforeBulkUpdate,
    LifecycleEvent::BeforeBulkDestroy,
];

const FULL_EVENTS: [LifecycleEvent; 6] = [
    LifecycleEvent::AfterCreate,
    LifecycleEvent::AfterUpdate,
    LifecycleEvent::AfterDestroy,
    LifecycleEvent::AfterRestore,
    LifecycleEvent::BeforeBulkUpdate,
    LifecycleEvent::BeforeBulkDestroy,
];

/// A non-blocking snapshot write that failed. The triggering mutation
/// went ahead without it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SnapshotFailure {
    pub live_entity: String,
    pub history_entity: String,
    pub event: LifecycleEvent,
    /// Snapshots that were meant to be written.
    pub rows: usize,
    pub message: String,
}

/// Receives failures of non-blocking snapshot writes.
pub trait SnapshotFailureSink: Send + Sync {
    fn report(&self, failure: SnapshotFailure);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogFailureSink;

impl SnapshotFailureSink for LogFailureSink {
    fn report(&self, failure: SnapshotFailure) {
        error!(
            live_entity = %failure.live_entity,
            history_entity = %failure.history_entity,
            event = %failure.event,
            rows = failure.rows,
            message = %failure.message,
            "non-blocking snapshot write failed"
        );
    }
}

/// Forwards failures to a channel the host drains.
#[derive(Debug, Clone)]
pub struct ChannelFailureSink {
    sender: Sender<SnapshotFailure>,
}

impl ChannelFailureSink {
    #[must_use]
    pub fn channel() -> (Self, Receiver<SnapshotFailure>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, receiver)
    }
}

impl SnapshotFailureSink for ChannelFailureSink {
    fn report(&self, failure: SnapshotFailure) {
        LogFailureSink.report(failure.clone());
        if self.sender.send(failure).is_err() {
            warn!("snapshot failure receiver dropped; failure was only logged");
        }
    }
}

/// Writes a snapshot into the history entity for each captured event of
/// the live entity.
#[derive(Clone)]
pub struct MutationInterceptor<H, Q> {
    config: HistoryConfig,
    schema: Arc<HistorySchema>,
    history: H,
    live: Q,
    sink: Arc<dyn SnapshotFailureSink>,
}

impl<H, Q> MutationInterceptor<H, Q> {
    #[must_use]
    pub fn new(
        config: HistoryConfig,
        schema: Arc<HistorySchema>,
        history: H,
        live: Q,
        sink: Arc<dyn SnapshotFailureSink>,
    ) -> Self {
        Self {
            config,
            schema,
            history,
            live,
            sink,
        }
    }

    /// Events of the live entity the interceptor subscribes to.
    #[must_use]
    pub fn subscribed_events(config: &HistoryConfig) -> &'static [LifecycleEvent] {
        match config.capture_mode() {
            CaptureMode::Diff => &DIFF_EVENTS,
            CaptureMode::Full => &FULL_EVENTS,
        }
    }

    fn captures(&self, event: LifecycleEvent) -> bool {
        Self::subscribed_events(&self.config).contains(&event)
    }

    fn capture_record<Cx: ?Sized>(
        &self,
        cx: &Cx,
        event: LifecycleEvent,
        state: &RecordState,
    ) -> Result<(), HistoryError>
    where
        H: HistoryHandle<Cx>,
    {
        let snapshot = self
            .schema
            .project(state.values_for(self.config.capture_mode()));
        let result = self.history.insert(cx, &snapshot).map(|()| 1);
        self.settle(event, 1, result)
    }

    fn capture_bulk<Cx: ?Sized>(
        &self,
        cx: &Cx,
        event: LifecycleEvent,
        filter: &Filter,
    ) -> Result<(), HistoryError>
    where
        H: HistoryHandle<Cx>,
        Q: LiveQuery<Cx>,
    {
        let hits = match self.live.find_all(cx, filter) {
            Ok(hits) => hits,
            Err(err) => {
                let err = HistoryError::SnapshotWrite(format!(
                    "failed to read rows matched by {event}: {err}"
                ));
                return self.settle(event, 0, Err(err));
            }
        };
        if hits.is_empty() {
            debug!(entity = %self.schema.live_entity, %event, "bulk operation matched no rows");
            return Ok(());
        }

        let snapshots: Vec<_> = hits.iter().map(|row| self.schema.project(row)).collect();
        let result = self.history.bulk_insert(cx, &snapshots);
        self.settle(event, snapshots.len(), result)
    }

    fn settle(
        &self,
        event: LifecycleEvent,
        rows: usize,
        result: Result<usize, HistoryError>,
    ) -> Result<(), HistoryError> {
        let err = match result {
            Ok(written) => {
                debug!(
                    entity = %self.schema.live_entity,
                    history = %self.schema.entity(),
                    %event,
                    written,
                    "snapshot captured"
                );
                return Ok(());
            }
            Err(HistoryError::SnapshotWrite(message)) => HistoryError::SnapshotWrite(message),
            Err(other) => HistoryError::SnapshotWrite(format!(
                "{} insert on {event} failed: {other}",
                self.schema.entity()
            )),
        };

        if self.config.blocking {
            return Err(err);
        }

        self.sink.report(SnapshotFailure {
            live_entity: self.schema.live_entity.clone(),
            history_entity: self.schema.entity().to_string(),
            event,
            rows,
            message: err.to_string(),
        });
        Ok(())
    }
}

impl<Cx, H, Q> LifecycleHook<Cx> for MutationInterceptor<H, Q>
where
    Cx: ?Sized,
    H: HistoryHandle<Cx>,
    Q: LiveQuery<Cx>,
{
    fn on_event(
        &self,
        cx: &Cx,
        event: LifecycleEvent,
        payload: &HookPayload<'_>,
    ) -> Result<(), HistoryError> {
        if !self.captures(event) {
            return Ok(());
        }

        match *payload {
            HookPayload::Record(state) => self.capture_record(cx, event, state),
            // Per-row events follow; capturing here too would duplicate them.
            HookPayload::Bulk {
                individual_hooks: true,
                ..
            } => Ok(()),
            HookPayload::Bulk { filter, .. } => self.capture_bulk(cx, event, filter),
        }
    }
}

/// Rejects every mutation of a history entity.
#[derive(Debug, Clone)]
pub struct ReadOnlyGuard {
    entity: String,
}

impl ReadOnlyGuard {
    #[must_use]
    pub fn new(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
        }
    }
}

impl<Cx: ?Sized> LifecycleHook<Cx> for ReadOnlyGuard {
    fn on_event(
        &self,
        _cx: &Cx,
        event: LifecycleEvent,
        _payload: &HookPayload<'_>,
    ) -> Result<(), HistoryError> {
        warn!(entity = %self.entity, %event, "rejected mutation of history entity");
        Err(HistoryError::ReadOnlyViolation(format!(
            "{} is a read-only history entity; {event} is not allowed",
            self.entity
        )))
    }
}
