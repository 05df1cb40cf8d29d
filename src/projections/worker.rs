//! Per-event projection processing.
//!
//! The worker is the subscription handler of a projection. For each event,
//! strictly one at a time:
//!
//! 1. skip it if the filter rejects it
//! 2. select the document id, skipping events without one
//! 3. read the current document (absent reads as empty)
//! 4. apply the event
//! 5. write the new document
//! 6. record the event as the checkpoint
//!
//! A failure anywhere stops the projection. Write failures after a
//! successful apply are `PartialWriteFailure`s and, under the rewind
//! policy, are compensated on a best-effort basis before stopping.

use super::checkpoint::CheckpointStore;
use super::definition::ProjectionDefinition;
use crate::binders::Binder;
use crate::config::{FailurePolicy, FilteredEvents, ProjectionConfig};
use crate::document::Document;
use crate::error::{panic_message, EngineError, Result, WriteStage};
use crate::log::EventEnvelope;
use crate::subscriptions::EventHandler;
use crate::types::{DocumentId, Sequence};
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// Last durably applied event, observable while the worker runs.
#[derive(Default)]
pub(crate) struct Progress {
    last_applied: Mutex<Option<Sequence>>,
    advanced: Condvar,
}

impl Progress {
    pub(crate) fn get(&self) -> Option<Sequence> {
        *self.last_applied.lock()
    }

    pub(crate) fn set(&self, sequence: Option<Sequence>) {
        *self.last_applied.lock() = sequence;
        self.advanced.notify_all();
    }

    /// Wait up to `timeout` for progress to reach `sequence`.
    pub(crate) fn wait_for(&self, sequence: Sequence, timeout: Duration) -> bool {
        let mut last = self.last_applied.lock();
        if last.is_some_and(|s| s >= sequence) {
            return true;
        }
        let _ = self.advanced.wait_for(&mut last, timeout);
        last.is_some_and(|s| s >= sequence)
    }
}

pub(crate) struct ProjectionWorker {
    definition: Arc<ProjectionDefinition>,
    binder: Arc<dyn Binder>,
    checkpoints: CheckpointStore,
    config: ProjectionConfig,
    progress: Arc<Progress>,
}

impl ProjectionWorker {
    pub(crate) fn new(
        definition: Arc<ProjectionDefinition>,
        binder: Arc<dyn Binder>,
        checkpoints: CheckpointStore,
        config: ProjectionConfig,
        progress: Arc<Progress>,
    ) -> Self {
        Self {
            definition,
            binder,
            checkpoints,
            config,
            progress,
        }
    }

    fn process(&self, event: &EventEnvelope) -> Result<()> {
        let definition = &self.definition;

        let accepted = self.guard(event, None, || (definition.filter)(event))?;
        if !accepted {
            tracing::trace!(
                projection = %definition.name,
                sequence = event.sequence.0,
                "event filtered out"
            );
            return self.skip(event);
        }

        let Some(id) = self.guard(event, None, || (definition.id_selector)(event))? else {
            tracing::warn!(
                projection = %definition.name,
                channel = %definition.channel,
                sequence = event.sequence.0,
                "event has no document id, skipped"
            );
            return self.skip(event);
        };

        let previous = self.binder.get(&id).map_err(|e| {
            let e = e.unavailable();
            tracing::error!(
                projection = %definition.name,
                binder = %definition.binder,
                document_id = %id,
                sequence = event.sequence.0,
                error = %e,
                "reading document failed"
            );
            e
        })?;

        let current = previous.clone().unwrap_or_default();
        let updated = self
            .guard(event, Some(&id), || (definition.apply)(current, event))?
            .map_err(|e| self.apply_failure(event, Some(&id), e.to_string()))?;

        if let Err(e) = self.binder.put(&id, &updated) {
            return Err(self.write_failed(event, &id, previous.as_ref(), WriteStage::Document, e));
        }
        if let Err(e) = self.checkpoints.save(&definition.name, event.sequence) {
            return Err(self.write_failed(event, &id, previous.as_ref(), WriteStage::Checkpoint, e));
        }

        self.progress.set(Some(event.sequence));
        tracing::debug!(
            projection = %definition.name,
            binder = %definition.binder,
            document_id = %id,
            sequence = event.sequence.0,
            "applied event"
        );
        Ok(())
    }

    /// Handle an event the projection does not apply.
    fn skip(&self, event: &EventEnvelope) -> Result<()> {
        if self.config.filtered_events == FilteredEvents::Hold {
            return Ok(());
        }
        let definition = &self.definition;
        if let Err(e) = self.checkpoints.save(&definition.name, event.sequence) {
            tracing::error!(
                projection = %definition.name,
                sequence = event.sequence.0,
                error = %e,
                "recording skipped event failed"
            );
            return Err(EngineError::PartialWriteFailure {
                projection: definition.name.clone(),
                binder: definition.binder.clone(),
                sequence: event.sequence,
                document_id: None,
                stage: WriteStage::Checkpoint,
                message: e.to_string(),
            });
        }
        self.progress.set(Some(event.sequence));
        Ok(())
    }

    /// Run a user callback, turning a panic into `ApplyFailure`.
    fn guard<T>(
        &self,
        event: &EventEnvelope,
        id: Option<&DocumentId>,
        callback: impl FnOnce() -> T,
    ) -> Result<T> {
        catch_unwind(AssertUnwindSafe(callback)).map_err(|panic| {
            self.apply_failure(
                event,
                id,
                format!("callback panicked: {}", panic_message(panic.as_ref())),
            )
        })
    }

    fn apply_failure(
        &self,
        event: &EventEnvelope,
        id: Option<&DocumentId>,
        message: String,
    ) -> EngineError {
        let definition = &self.definition;
        tracing::error!(
            projection = %definition.name,
            binder = %definition.binder,
            document_id = id.map_or("-", DocumentId::as_str),
            sequence = event.sequence.0,
            error = %message,
            "apply failed, stopping projection"
        );
        EngineError::ApplyFailure {
            projection: definition.name.clone(),
            binder: definition.binder.clone(),
            sequence: event.sequence,
            document_id: id.map(|id| id.as_str().to_string()),
            message,
        }
    }

    fn write_failed(
        &self,
        event: &EventEnvelope,
        id: &DocumentId,
        previous: Option<&Document>,
        stage: WriteStage,
        error: EngineError,
    ) -> EngineError {
        let definition = &self.definition;
        tracing::error!(
            projection = %definition.name,
            binder = %definition.binder,
            document_id = %id,
            sequence = event.sequence.0,
            %stage,
            error = %error,
            "write failed after apply, stopping projection"
        );

        if self.config.failure_policy == FailurePolicy::Rewind {
            self.rewind(event, id, previous);
        }

        EngineError::PartialWriteFailure {
            projection: definition.name.clone(),
            binder: definition.binder.clone(),
            sequence: event.sequence,
            document_id: Some(id.as_str().to_string()),
            stage,
            message: error.to_string(),
        }
    }

    /// Restore the pre-apply document and move the checkpoint before the
    /// event so the next start reprocesses it. Best effort.
    fn rewind(&self, event: &EventEnvelope, id: &DocumentId, previous: Option<&Document>) {
        let definition = &self.definition;

        let restored = match previous {
            Some(document) => self.binder.put(id, document),
            None => self.binder.delete(id).map(|_| ()),
        };
        if let Err(e) = restored {
            tracing::warn!(
                projection = %definition.name,
                binder = %definition.binder,
                document_id = %id,
                error = %e,
                "could not restore document"
            );
        }

        match self.checkpoints.rewind(&definition.name, event.sequence) {
            Ok(()) => self.progress.set(event.sequence.prev()),
            Err(e) => tracing::warn!(
                projection = %definition.name,
                sequence = event.sequence.0,
                error = %e,
                "could not rewind checkpoint"
            ),
        }
    }
}

impl EventHandler for ProjectionWorker {
    fn handle(&mut self, event: EventEnvelope) -> Result<()> {
        self.process(&event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binders::{DocumentStore, MemoryDocumentStore};
    use crate::projections::ApplyError;
    use crate::types::{Checksum, Timestamp};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn envelope(sequence: u64, payload: Document) -> EventEnvelope {
        EventEnvelope {
            sequence: Sequence(sequence),
            timestamp: Timestamp::now(),
            checksum: Checksum::of(&payload.to_bytes().unwrap()),
            payload,
        }
    }

    fn order(sequence: u64, basket: &str, amount: u64) -> EventEnvelope {
        envelope(
            sequence,
            Document::new().with("basketId", basket).with("amount", amount),
        )
    }

    fn totals() -> ProjectionDefinition {
        ProjectionDefinition::builder("totals")
            .channel("orders")
            .binder("baskets")
            .id_selector(|ev| ev.payload.get_str("basketId").map(DocumentId::from))
            .apply(|doc, ev| doc.with("total", ev.payload.get_u64("amount").unwrap_or(0)))
            .build()
            .unwrap()
    }

    fn worker(
        documents: &MemoryDocumentStore,
        definition: ProjectionDefinition,
        config: ProjectionConfig,
    ) -> (ProjectionWorker, CheckpointStore) {
        let checkpoints = CheckpointStore::open(documents).unwrap();
        let binder = documents.open(&definition.binder).unwrap();
        let worker = ProjectionWorker::new(
            Arc::new(definition),
            binder,
            checkpoints.clone(),
            config,
            Arc::new(Progress::default()),
        );
        (worker, checkpoints)
    }

    #[test]
    fn test_applies_and_checkpoints() {
        let documents = MemoryDocumentStore::new();
        let (mut worker, checkpoints) = worker(&documents, totals(), ProjectionConfig::default());

        worker.handle(order(0, "b1", 10)).unwrap();
        worker.handle(order(1, "b1", 25)).unwrap();

        let doc = documents.open("baskets").unwrap().get(&"b1".into()).unwrap().unwrap();
        assert_eq!(doc.into_value(), serde_json::json!({ "total": 25 }));
        assert_eq!(checkpoints.load("totals").unwrap(), Some(Sequence(1)));
        assert_eq!(worker.progress.get(), Some(Sequence(1)));
    }

    #[test]
    fn test_filtered_event_never_reaches_selector() {
        let selected = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&selected);
        let definition = ProjectionDefinition::builder("p")
            .channel("orders")
            .binder("baskets")
            .filter(|ev| ev.payload.get_u64("amount").unwrap_or(0) > 0)
            .id_selector(move |ev| {
                counter.fetch_add(1, Ordering::SeqCst);
                ev.payload.get_str("basketId").map(DocumentId::from)
            })
            .apply(|doc, _| doc.with("seen", true))
            .build()
            .unwrap();

        let documents = MemoryDocumentStore::new();
        let (mut worker, checkpoints) = worker(&documents, definition, ProjectionConfig::default());

        worker.handle(order(0, "b1", 0)).unwrap();
        assert_eq!(selected.load(Ordering::SeqCst), 0);
        assert_eq!(documents.open("baskets").unwrap().count().unwrap(), 0);
        // Advance is the default.
        assert_eq!(checkpoints.load("p").unwrap(), Some(Sequence(0)));
    }

    #[test]
    fn test_hold_leaves_checkpoint_on_skip() {
        let documents = MemoryDocumentStore::new();
        let config = ProjectionConfig {
            filtered_events: FilteredEvents::Hold,
            ..Default::default()
        };
        let (mut worker, checkpoints) = worker(&documents, totals(), config);

        worker.handle(order(0, "b1", 10)).unwrap();
        // No basketId: skipped without a checkpoint write.
        worker.handle(envelope(1, Document::new().with("amount", 5))).unwrap();
        assert_eq!(checkpoints.load("totals").unwrap(), Some(Sequence(0)));
    }

    #[test]
    fn test_null_id_is_skipped() {
        let documents = MemoryDocumentStore::new();
        let (mut worker, checkpoints) = worker(&documents, totals(), ProjectionConfig::default());

        worker.handle(envelope(0, Document::new().with("amount", 5))).unwrap();
        assert_eq!(documents.open("baskets").unwrap().count().unwrap(), 0);
        assert_eq!(checkpoints.load("totals").unwrap(), Some(Sequence(0)));
    }

    #[test]
    fn test_rejected_event_is_apply_failure() {
        let definition = ProjectionDefinition::builder("strict")
            .channel("orders")
            .binder("baskets")
            .id_selector(|ev| ev.payload.get_str("basketId").map(DocumentId::from))
            .try_apply(|doc, ev| match ev.payload.get_u64("amount") {
                Some(amount) => Ok(doc.with("total", amount)),
                None => Err(ApplyError::from("amount missing")),
            })
            .build()
            .unwrap();

        let documents = MemoryDocumentStore::new();
        let (mut worker, checkpoints) = worker(&documents, definition, ProjectionConfig::default());

        let err = worker
            .handle(envelope(0, Document::new().with("basketId", "b1")))
            .unwrap_err();
        match err {
            EngineError::ApplyFailure {
                projection,
                binder,
                document_id,
                message,
                ..
            } => {
                assert_eq!(projection, "strict");
                assert_eq!(binder, "baskets");
                assert_eq!(document_id.as_deref(), Some("b1"));
                assert_eq!(message, "amount missing");
            }
            other => panic!("expected ApplyFailure, got {:?}", other),
        }
        assert_eq!(checkpoints.load("strict").unwrap(), None);
    }

    #[test]
    fn test_panicking_apply_is_apply_failure() {
        let definition = ProjectionDefinition::builder("p")
            .channel("orders")
            .binder("baskets")
            .id_selector(|_| Some(DocumentId::from("d")))
            .apply(|_, _| panic!("bad apply"))
            .build()
            .unwrap();

        let documents = MemoryDocumentStore::new();
        let (mut worker, _) = worker(&documents, definition, ProjectionConfig::default());

        let err = worker.handle(order(0, "d", 1)).unwrap_err();
        assert!(matches!(err, EngineError::ApplyFailure { message, .. } if message.contains("bad apply")));
        assert_eq!(documents.open("baskets").unwrap().count().unwrap(), 0);
    }
}
