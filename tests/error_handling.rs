//! Failure handling: store faults, partial writes and invalid definitions.

use eventide::{
    AppendOutcome, Binder, ChannelStore, Document, DocumentId, DocumentScan, DocumentStore,
    Engine, EngineConfig, EngineError, EventEnvelope, FailurePolicy, MemoryChannelStore,
    MemoryDocumentStore, ProjectionConfig, ProjectionDefinition, ProjectionState, Result,
    Sequence, StartPolicy, SubscriptionConfig, Timestamp, WriteStage,
};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

// --- Fault-injecting stores ---

type PutFault = Box<dyn Fn(&str, &DocumentId, &Document) -> bool + Send>;

/// Document store whose binders fail one matching `put`.
struct FaultyDocuments {
    inner: MemoryDocumentStore,
    fault: Arc<Mutex<Option<PutFault>>>,
}

impl FaultyDocuments {
    fn new() -> Self {
        Self {
            inner: MemoryDocumentStore::new(),
            fault: Arc::new(Mutex::new(None)),
        }
    }

    /// Fail the next `put` matching `predicate`.
    fn fail_put_once(
        &self,
        predicate: impl Fn(&str, &DocumentId, &Document) -> bool + Send + 'static,
    ) {
        *self.fault.lock().unwrap() = Some(Box::new(predicate));
    }
}

impl DocumentStore for FaultyDocuments {
    fn open(&self, name: &str) -> Result<Arc<dyn Binder>> {
        Ok(Arc::new(FaultyBinder {
            inner: self.inner.open(name)?,
            fault: Arc::clone(&self.fault),
        }))
    }

    fn binder_names(&self) -> Result<Vec<String>> {
        self.inner.binder_names()
    }
}

struct FaultyBinder {
    inner: Arc<dyn Binder>,
    fault: Arc<Mutex<Option<PutFault>>>,
}

impl Binder for FaultyBinder {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn get(&self, id: &DocumentId) -> Result<Option<Document>> {
        self.inner.get(id)
    }

    fn put(&self, id: &DocumentId, document: &Document) -> Result<()> {
        let mut fault = self.fault.lock().unwrap();
        if fault
            .as_ref()
            .is_some_and(|predicate| predicate(self.inner.name(), id, document))
        {
            fault.take();
            return Err(EngineError::StoreUnavailable("injected write failure".into()));
        }
        drop(fault);
        self.inner.put(id, document)
    }

    fn delete(&self, id: &DocumentId) -> Result<bool> {
        self.inner.delete(id)
    }

    fn scan(&self, predicate: eventide::binders::ScanPredicate) -> Result<DocumentScan> {
        self.inner.scan(predicate)
    }

    fn count(&self) -> Result<usize> {
        self.inner.count()
    }
}

/// Channel store that fails reads while `failing_reads` is positive and
/// reports itself unreachable while `down` is set.
#[derive(Default)]
struct FlakyChannels {
    inner: MemoryChannelStore,
    failing_reads: AtomicUsize,
    permanent: AtomicBool,
    down: AtomicBool,
}

impl FlakyChannels {
    fn check_up(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
        }
        Ok(())
    }
}

impl ChannelStore for FlakyChannels {
    fn append_at(
        &self,
        channel: &str,
        sequence: Sequence,
        timestamp: Timestamp,
        bytes: &[u8],
    ) -> Result<AppendOutcome> {
        self.check_up()?;
        self.inner.append_at(channel, sequence, timestamp, bytes)
    }

    fn read(&self, channel: &str, sequence: Sequence) -> Result<Option<Vec<u8>>> {
        if self.permanent.load(Ordering::SeqCst) {
            return Err(EngineError::Corruption("injected inconsistency".into()));
        }
        if self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(io::Error::from(io::ErrorKind::TimedOut).into());
        }
        self.inner.read(channel, sequence)
    }

    fn highest_sequence(&self, channel: &str) -> Result<Option<Sequence>> {
        self.check_up()?;
        self.inner.highest_sequence(channel)
    }

    fn scan_timestamps(&self, channel: &str) -> Result<Vec<(Sequence, Timestamp)>> {
        self.check_up()?;
        self.inner.scan_timestamps(channel)
    }

    fn channels(&self) -> Result<Vec<String>> {
        self.inner.channels()
    }

    fn wait_for(&self, channel: &str, sequence: Sequence, timeout: Duration) -> Result<bool> {
        self.inner.wait_for(channel, sequence, timeout)
    }
}

fn set_total(name: &str, channel: &str) -> ProjectionDefinition {
    ProjectionDefinition::builder(name)
        .channel(channel)
        .binder("docs")
        .id_selector(|ev| ev.payload.get_str("id").map(DocumentId::from))
        .apply(|doc, ev| doc.with("x", ev.payload.get_u64("x").unwrap_or(0)))
        .build()
        .unwrap()
}

fn event(id: &str, x: u64) -> Document {
    Document::new().with("id", id).with("x", x)
}

fn is_checkpoint(binder: &str, document: &Document, sequence: u64) -> bool {
    binder == eventide::projections::CHECKPOINT_BINDER
        && document.get_u64("lastApplied") == Some(sequence)
}

// --- Crash Consistency ---

#[test]
fn test_lost_checkpoint_write_reprocesses_event_once() {
    init_tracing();
    let documents = Arc::new(FaultyDocuments::new());
    let engine = Engine::with_stores(
        Arc::new(MemoryChannelStore::new()),
        Arc::clone(&documents) as Arc<dyn DocumentStore>,
        EngineConfig::default(),
    )
    .unwrap();

    let applied = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&applied);
    let definition = ProjectionDefinition::builder("p")
        .channel("C")
        .binder("docs")
        .id_selector(|ev| ev.payload.get_str("id").map(DocumentId::from))
        .apply(move |doc, ev| {
            if ev.sequence == Sequence(5) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            doc.with("x", ev.payload.get_u64("x").unwrap_or(0))
        })
        .build()
        .unwrap();

    // The checkpoint write for event 5 is lost, as if the process died
    // between the document write and the checkpoint write.
    documents.fail_put_once(|binder, _, doc| is_checkpoint(binder, doc, 5));

    let projection = engine.create_projection(definition).unwrap();
    for i in 0..6 {
        engine.publish("C", event("d1", i)).unwrap();
    }

    assert!(!projection.wait_for_checkpoint(Sequence(5), WAIT));
    assert_eq!(projection.state(), ProjectionState::Failed);
    match projection.failure().as_deref() {
        Some(EngineError::PartialWriteFailure {
            stage, sequence, ..
        }) => {
            assert_eq!(*stage, WriteStage::Checkpoint);
            assert_eq!(*sequence, Sequence(5));
        }
        other => panic!("expected PartialWriteFailure, got {:?}", other),
    }

    let docs = engine.binder("docs").unwrap();
    assert_eq!(docs.get(&"d1".into()).unwrap().unwrap().get_u64("x"), Some(5));
    assert_eq!(engine.projections().checkpoint("p").unwrap(), Some(Sequence(4)));

    engine.projections().restart("p").unwrap();
    assert!(projection.wait_for_checkpoint(Sequence(5), WAIT));
    assert_eq!(applied.load(Ordering::SeqCst), 2);
    assert_eq!(docs.get(&"d1".into()).unwrap().unwrap().get_u64("x"), Some(5));
}

#[test]
fn test_rewind_policy_restores_document() {
    init_tracing();
    let documents = Arc::new(FaultyDocuments::new());
    let config = EngineConfig {
        projection: ProjectionConfig {
            failure_policy: FailurePolicy::Rewind,
            ..Default::default()
        },
        ..Default::default()
    };
    let engine = Engine::with_stores(
        Arc::new(MemoryChannelStore::new()),
        Arc::clone(&documents) as Arc<dyn DocumentStore>,
        config,
    )
    .unwrap();

    documents.fail_put_once(|binder, _, doc| is_checkpoint(binder, doc, 2));
    let projection = engine.create_projection(set_total("p", "c")).unwrap();
    for i in 0..3 {
        engine.publish("c", event("d1", 10 + i)).unwrap();
    }

    assert!(!projection.wait_for_checkpoint(Sequence(2), WAIT));
    assert_eq!(projection.state(), ProjectionState::Failed);

    // Document restored to the value after event 1, checkpoint just before 2.
    let docs = engine.binder("docs").unwrap();
    assert_eq!(docs.get(&"d1".into()).unwrap().unwrap().get_u64("x"), Some(11));
    assert_eq!(engine.projections().checkpoint("p").unwrap(), Some(Sequence(1)));
    assert_eq!(projection.last_applied(), Some(Sequence(1)));

    engine.projections().restart("p").unwrap();
    assert!(projection.wait_for_checkpoint(Sequence(2), WAIT));
    assert_eq!(docs.get(&"d1".into()).unwrap().unwrap().get_u64("x"), Some(12));
}

#[test]
fn test_document_write_failure_stops_only_that_projection() {
    init_tracing();
    let documents = Arc::new(FaultyDocuments::new());
    let engine = Engine::with_stores(
        Arc::new(MemoryChannelStore::new()),
        Arc::clone(&documents) as Arc<dyn DocumentStore>,
        EngineConfig::default(),
    )
    .unwrap();

    documents.fail_put_once(|binder, id, _| binder == "docs" && id.as_str() == "bad");
    let failing = engine.create_projection(set_total("failing", "a")).unwrap();
    let healthy = engine.create_projection(set_total("healthy", "b")).unwrap();

    engine.publish("a", event("bad", 1)).unwrap();
    engine.publish("b", event("good", 1)).unwrap();

    assert!(healthy.wait_for_checkpoint(Sequence(0), WAIT));
    assert!(!failing.wait_for_checkpoint(Sequence(0), WAIT));
    assert!(matches!(
        failing.failure().as_deref(),
        Some(EngineError::PartialWriteFailure {
            stage: WriteStage::Document,
            ..
        })
    ));
    assert!(healthy.is_running());
    assert_eq!(engine.projections().checkpoint("failing").unwrap(), None);
}

// --- Callback Failures ---

#[test]
fn test_panicking_selector_stops_projection() {
    init_tracing();
    let engine = Engine::open(EngineConfig::default()).unwrap();
    let projection = engine
        .create_projection(
            ProjectionDefinition::builder("p")
                .channel("c")
                .binder("docs")
                .id_selector(|ev| {
                    if ev.payload.contains_key("poison") {
                        panic!("cannot select");
                    }
                    Some(DocumentId::from("d"))
                })
                .apply(|doc, _| doc)
                .build()
                .unwrap(),
        )
        .unwrap();

    engine.publish("c", Document::new()).unwrap();
    engine.publish("c", Document::new().with("poison", true)).unwrap();
    engine.publish("c", Document::new()).unwrap();

    assert!(!projection.wait_for_checkpoint(Sequence(2), WAIT));
    assert_eq!(projection.last_applied(), Some(Sequence(0)));
    let status = engine.projections().status("p").unwrap();
    assert_eq!(status.state, ProjectionState::Failed);
    assert!(status.failure.unwrap().contains("cannot select"));
}

// --- Definition Errors ---

#[test]
fn test_invalid_and_duplicate_definitions() {
    let engine = Engine::open(EngineConfig::default()).unwrap();

    let incomplete = ProjectionDefinition::builder("p").channel("c").build();
    assert!(matches!(incomplete, Err(EngineError::InvalidDefinition(_))));

    engine.create_projection(set_total("p", "c")).unwrap();
    assert!(matches!(
        engine.create_projection(set_total("p", "c")),
        Err(EngineError::DuplicateName(_))
    ));
    assert_eq!(engine.projections().list_names(), vec!["p".to_string()]);
}

// --- Channel Store Failures ---

#[test]
fn test_unreachable_store_at_resolve_time() {
    init_tracing();
    let channels = Arc::new(FlakyChannels::default());
    let engine = Engine::with_stores(
        Arc::clone(&channels) as Arc<dyn ChannelStore>,
        Arc::new(MemoryDocumentStore::new()),
        EngineConfig::default(),
    )
    .unwrap();

    channels.down.store(true, Ordering::SeqCst);
    let subscribed = engine.subscribe("c", StartPolicy::FromNow, |_: EventEnvelope| -> Result<()> {
        Ok(())
    });
    assert!(matches!(subscribed, Err(EngineError::StoreUnavailable(_))));

    assert!(matches!(
        engine.create_projection(set_total("p", "c")),
        Err(EngineError::StoreUnavailable(_))
    ));
    assert!(!engine.projections().is_projection_name("p"));
}

#[test]
fn test_transient_read_errors_are_retried() {
    init_tracing();
    let channels = Arc::new(FlakyChannels::default());
    let engine = Engine::with_stores(
        Arc::clone(&channels) as Arc<dyn ChannelStore>,
        Arc::new(MemoryDocumentStore::new()),
        EngineConfig::default(),
    )
    .unwrap();

    for i in 0..3 {
        engine.publish("c", event("d", i)).unwrap();
    }
    channels.failing_reads.store(3, Ordering::SeqCst);

    let (tx, rx) = crossbeam_channel::unbounded();
    let sub = engine
        .subscribe("c", StartPolicy::FromStart, move |ev: EventEnvelope| -> Result<()> {
            tx.send(ev.sequence).unwrap();
            Ok(())
        })
        .unwrap();

    for i in 0..3 {
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Sequence(i));
    }
    assert!(sub.failure().is_none());
    assert!(!sub.is_closed());
}

#[test]
fn test_exhausted_retries_close_subscription() {
    init_tracing();
    let channels = Arc::new(FlakyChannels::default());
    let config = EngineConfig {
        subscription: SubscriptionConfig {
            max_transient_retries: 2,
            poll_interval_ms: 1,
            max_poll_interval_ms: 2,
            ..Default::default()
        },
        ..Default::default()
    };
    let engine = Engine::with_stores(
        Arc::clone(&channels) as Arc<dyn ChannelStore>,
        Arc::new(MemoryDocumentStore::new()),
        config,
    )
    .unwrap();

    engine.publish("c", event("d", 0)).unwrap();
    channels.failing_reads.store(usize::MAX, Ordering::SeqCst);

    let sub = engine
        .subscribe("c", StartPolicy::FromStart, |_: EventEnvelope| -> Result<()> { Ok(()) })
        .unwrap();
    assert!(sub.wait_closed(WAIT));
    assert!(matches!(sub.failure().as_deref(), Some(EngineError::Io(_))));
}

#[test]
fn test_permanent_read_error_closes_subscription() {
    init_tracing();
    let channels = Arc::new(FlakyChannels::default());
    let engine = Engine::with_stores(
        Arc::clone(&channels) as Arc<dyn ChannelStore>,
        Arc::new(MemoryDocumentStore::new()),
        EngineConfig::default(),
    )
    .unwrap();

    engine.publish("c", event("d", 0)).unwrap();
    channels.permanent.store(true, Ordering::SeqCst);

    let sub = engine
        .subscribe("c", StartPolicy::FromStart, |_: EventEnvelope| -> Result<()> { Ok(()) })
        .unwrap();
    assert!(sub.wait_closed(WAIT));
    assert!(matches!(sub.failure().as_deref(), Some(EngineError::Corruption(_))));
    assert_eq!(sub.delivered(), 0);
}

#[test]
fn test_publish_surfaces_store_errors() {
    let channels = Arc::new(FlakyChannels::default());
    let engine = Engine::with_stores(
        Arc::clone(&channels) as Arc<dyn ChannelStore>,
        Arc::new(MemoryDocumentStore::new()),
        EngineConfig::default(),
    )
    .unwrap();

    channels.down.store(true, Ordering::SeqCst);
    assert!(engine.publish("c", Document::new()).is_err());

    channels.down.store(false, Ordering::SeqCst);
    assert_eq!(engine.publish("c", Document::new()).unwrap(), Sequence(0));
}
