//! Engine facade tying the event log, document store and projections
//! together.

use crate::binders::{Binder, DocumentStore, FileDocumentStore, MemoryDocumentStore};
use crate::channels::{ChannelStore, FileChannelStore, MemoryChannelStore};
use crate::config::{BackendConfig, EngineConfig};
use crate::document::Document;
use crate::error::{EngineError, Result};
use crate::log::{EventEnvelope, EventLog, VerifyReport};
use crate::projections::{Projection, ProjectionDefinition, ProjectionManager, CHECKPOINT_BINDER};
use crate::subscriptions::{EventHandler, Subscription};
use crate::types::{Sequence, StartPolicy};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An explicitly owned event log and projection engine.
///
/// Several engines can live in one process; file backends lock their root
/// directory, so two engines never share one.
pub struct Engine {
    config: EngineConfig,
    log: Arc<EventLog>,
    documents: Arc<dyn DocumentStore>,
    projections: ProjectionManager,
    closed: AtomicBool,
}

impl Engine {
    /// Open an engine with the backends selected in `config`.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let channels: Arc<dyn ChannelStore> = match &config.channels {
            BackendConfig::Memory => Arc::new(MemoryChannelStore::new()),
            BackendConfig::File {
                path,
                sync_interval,
                ..
            } => Arc::new(FileChannelStore::open_with_sync_interval(path, *sync_interval)?),
        };
        let documents: Arc<dyn DocumentStore> = match &config.documents {
            BackendConfig::Memory => Arc::new(MemoryDocumentStore::new()),
            BackendConfig::File {
                path, cache_size, ..
            } => Arc::new(FileDocumentStore::open_with_cache_size(path, *cache_size)?),
        };

        Self::with_stores(channels, documents, config)
    }

    /// Open an engine over caller-supplied stores.
    ///
    /// The backend selections in `config` are ignored.
    pub fn with_stores(
        channels: Arc<dyn ChannelStore>,
        documents: Arc<dyn DocumentStore>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;

        let log = Arc::new(EventLog::new(channels, config.log_config()));
        let projections = ProjectionManager::new(
            Arc::clone(&log),
            Arc::clone(&documents),
            config.projection.clone(),
            config.subscription.clone(),
        )?;

        tracing::info!(
            channels = ?config.channels,
            documents = ?config.documents,
            "engine opened"
        );

        Ok(Self {
            config,
            log,
            documents,
            projections,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::InvalidOperation("engine is closed".into()));
        }
        Ok(())
    }

    /// Append an event to `channel`, returning its sequence number.
    pub fn publish(&self, channel: &str, payload: Document) -> Result<Sequence> {
        self.check_open()?;
        self.log.publish(channel, payload)
    }

    /// Deliver `channel` to `handler` starting from `policy`, using the
    /// engine's subscription settings.
    pub fn subscribe(
        &self,
        channel: &str,
        policy: StartPolicy,
        handler: impl EventHandler,
    ) -> Result<Subscription> {
        self.check_open()?;
        self.log
            .subscribe(channel, policy, handler, self.config.subscription.clone())
    }

    pub fn resolve_start(&self, channel: &str, policy: StartPolicy) -> Result<Sequence> {
        self.log.resolve_start(channel, policy)
    }

    pub fn read_event(&self, channel: &str, sequence: Sequence) -> Result<Option<EventEnvelope>> {
        self.log.read(channel, sequence)
    }

    pub fn highest_sequence(&self, channel: &str) -> Result<Option<Sequence>> {
        self.log.highest_sequence(channel)
    }

    pub fn channels(&self) -> Result<Vec<String>> {
        self.log.channels()
    }

    /// Audit every stored envelope of `channel` against its checksum.
    pub fn verify_channel(&self, channel: &str) -> Result<VerifyReport> {
        self.log.verify_channel(channel)
    }

    /// Open a binder for reading projected documents.
    pub fn binder(&self, name: &str) -> Result<Arc<dyn Binder>> {
        if name == CHECKPOINT_BINDER {
            return Err(EngineError::InvalidOperation(format!(
                "binder {} is reserved for projection checkpoints",
                name
            )));
        }
        self.documents.open(name)
    }

    pub fn projections(&self) -> &ProjectionManager {
        &self.projections
    }

    pub fn create_projection(&self, definition: ProjectionDefinition) -> Result<Arc<Projection>> {
        self.check_open()?;
        self.projections.create_projection(definition)
    }

    /// Stop every projection. Idempotent; also run on drop.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.projections.stop_all();
        tracing::info!("engine closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DocumentId;
    use std::time::Duration;
    use tempfile::TempDir;

    fn totals() -> ProjectionDefinition {
        ProjectionDefinition::builder("totals")
            .channel("orders")
            .binder("baskets")
            .id_selector(|ev| ev.payload.get_str("basketId").map(DocumentId::from))
            .apply(|doc, ev| doc.with("total", ev.payload.get_u64("amount").unwrap_or(0)))
            .build()
            .unwrap()
    }

    #[test]
    fn test_memory_engine_end_to_end() {
        let engine = Engine::open(EngineConfig::default()).unwrap();
        let projection = engine.create_projection(totals()).unwrap();

        engine
            .publish("orders", Document::new().with("basketId", "b1").with("amount", 10))
            .unwrap();
        engine
            .publish("orders", Document::new().with("basketId", "b1").with("amount", 25))
            .unwrap();

        assert!(projection.wait_for_checkpoint(Sequence(1), Duration::from_secs(5)));
        let doc = engine.binder("baskets").unwrap().get(&"b1".into()).unwrap().unwrap();
        assert_eq!(doc.get_u64("total"), Some(25));
        assert_eq!(engine.projections().checkpoint("totals").unwrap(), Some(Sequence(1)));
    }

    #[test]
    fn test_file_engine_survives_reopen() {
        let dir = TempDir::new().unwrap();

        {
            let engine = Engine::open(EngineConfig::file(dir.path())).unwrap();
            let projection = engine.create_projection(totals()).unwrap();
            engine
                .publish("orders", Document::new().with("basketId", "b1").with("amount", 10))
                .unwrap();
            assert!(projection.wait_for_checkpoint(Sequence(0), Duration::from_secs(5)));
        }

        let engine = Engine::open(EngineConfig::file(dir.path())).unwrap();
        assert_eq!(engine.highest_sequence("orders").unwrap(), Some(Sequence(0)));
        assert_eq!(engine.projections().checkpoint("totals").unwrap(), Some(Sequence(0)));
        assert_eq!(engine.channels().unwrap(), vec!["orders".to_string()]);

        let projection = engine.create_projection(totals()).unwrap();
        assert_eq!(projection.last_applied(), Some(Sequence(0)));
    }

    #[test]
    fn test_close_is_idempotent_and_blocks_publish() {
        let engine = Engine::open(EngineConfig::default()).unwrap();
        let projection = engine.create_projection(totals()).unwrap();

        engine.close();
        engine.close();
        assert!(engine.is_closed());
        assert!(!projection.is_running());
        assert!(matches!(
            engine.publish("orders", Document::new()),
            Err(EngineError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_checkpoint_binder_is_not_exposed() {
        let engine = Engine::open(EngineConfig::default()).unwrap();
        assert!(engine.binder(CHECKPOINT_BINDER).is_err());
    }

    #[test]
    fn test_engines_coexist() {
        let first = Engine::open(EngineConfig::default()).unwrap();
        let second = Engine::open(EngineConfig::default()).unwrap();

        first.publish("c", Document::new()).unwrap();
        assert_eq!(first.highest_sequence("c").unwrap(), Some(Sequence(0)));
        assert_eq!(second.highest_sequence("c").unwrap(), None);
    }

    #[test]
    fn test_second_engine_on_same_root_is_locked() {
        let dir = TempDir::new().unwrap();
        let _engine = Engine::open(EngineConfig::file(dir.path())).unwrap();
        assert!(matches!(
            Engine::open(EngineConfig::file(dir.path())),
            Err(EngineError::Locked)
        ));
    }
}
