//! Projection registry and lifecycle.

use super::checkpoint::CheckpointStore;
use super::definition::ProjectionDefinition;
use super::worker::{Progress, ProjectionWorker};
use crate::binders::DocumentStore;
use crate::config::ProjectionConfig;
use crate::error::{EngineError, Result};
use crate::log::EventLog;
use crate::subscriptions::{Subscription, SubscriptionConfig};
use crate::types::{Sequence, StartPolicy};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Liveness of a projection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProjectionState {
    Running,
    /// Stopped on request; resumes with `restart`.
    Stopped,
    /// Stopped by an error; see `failure`.
    Failed,
}

/// Point-in-time view of a projection.
#[derive(Clone, Debug)]
pub struct ProjectionStatus {
    pub name: String,
    pub channel: String,
    pub binder: String,
    pub state: ProjectionState,
    pub last_applied: Option<Sequence>,
    pub failure: Option<String>,
}

/// Handle to a registered projection.
pub struct Projection {
    definition: Arc<ProjectionDefinition>,
    progress: Arc<Progress>,
    subscription: Mutex<Option<Arc<Subscription>>>,
    /// Serialises create/restart/remove so one worker runs at a time.
    lifecycle: Mutex<()>,
}

impl Projection {
    fn new(definition: ProjectionDefinition) -> Self {
        Self {
            definition: Arc::new(definition),
            progress: Arc::new(Progress::default()),
            subscription: Mutex::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &ProjectionDefinition {
        &self.definition
    }

    fn subscription(&self) -> Option<Arc<Subscription>> {
        self.subscription.lock().clone()
    }

    pub fn state(&self) -> ProjectionState {
        match self.subscription() {
            Some(sub) if !sub.is_closed() => ProjectionState::Running,
            Some(sub) if sub.failure().is_some() => ProjectionState::Failed,
            _ => ProjectionState::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProjectionState::Running
    }

    /// Last event recorded in the checkpoint by this projection.
    pub fn last_applied(&self) -> Option<Sequence> {
        self.progress.get()
    }

    /// The error that stopped the projection, if any.
    pub fn failure(&self) -> Option<Arc<EngineError>> {
        self.subscription().and_then(|sub| sub.failure())
    }

    /// Stop processing. Idempotent.
    ///
    /// An event already being applied finishes first, so the durable
    /// document and checkpoint are left as a committed pair.
    pub fn stop(&self) {
        if let Some(sub) = self.subscription() {
            if !sub.is_closed() {
                tracing::info!(projection = %self.definition.name, "stopping projection");
            }
            sub.close();
        }
    }

    /// Wait until the checkpoint reaches `sequence`.
    ///
    /// Returns false on timeout, or as soon as the projection is no longer
    /// running without having reached it.
    pub fn wait_for_checkpoint(&self, sequence: Sequence, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return self.progress.get().is_some_and(|s| s >= sequence);
            }
            let slice = (deadline - now).min(Duration::from_millis(20));
            if self.progress.wait_for(sequence, slice) {
                return true;
            }
            if !self.is_running() {
                return self.progress.get().is_some_and(|s| s >= sequence);
            }
        }
    }

    pub fn status(&self) -> ProjectionStatus {
        ProjectionStatus {
            name: self.definition.name.clone(),
            channel: self.definition.channel.clone(),
            binder: self.definition.binder.clone(),
            state: self.state(),
            last_applied: self.last_applied(),
            failure: self.failure().map(|e| e.to_string()),
        }
    }
}

impl std::fmt::Debug for Projection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projection")
            .field("name", &self.definition.name)
            .field("state", &self.state())
            .field("last_applied", &self.last_applied())
            .finish()
    }
}

/// Registry of named projections over one event log and document store.
pub struct ProjectionManager {
    log: Arc<EventLog>,
    documents: Arc<dyn DocumentStore>,
    checkpoints: CheckpointStore,
    config: ProjectionConfig,
    subscription: SubscriptionConfig,
    projections: RwLock<BTreeMap<String, Arc<Projection>>>,
}

impl ProjectionManager {
    pub fn new(
        log: Arc<EventLog>,
        documents: Arc<dyn DocumentStore>,
        config: ProjectionConfig,
        subscription: SubscriptionConfig,
    ) -> Result<Self> {
        let checkpoints = CheckpointStore::open(documents.as_ref())?;
        Ok(Self {
            log,
            documents,
            checkpoints,
            config,
            subscription,
            projections: RwLock::new(BTreeMap::new()),
        })
    }

    /// Register and start a projection.
    ///
    /// Processing resumes after the durable checkpoint, or from the start
    /// of the channel when there is none. Fails with `DuplicateName` if
    /// the name is registered, even by a stopped projection.
    pub fn create_projection(&self, definition: ProjectionDefinition) -> Result<Arc<Projection>> {
        let projection = Arc::new(Projection::new(definition));
        let lifecycle = projection.lifecycle.lock();

        {
            let mut projections = self.projections.write();
            if projections.contains_key(projection.name()) {
                return Err(EngineError::DuplicateName(projection.name().to_string()));
            }
            projections.insert(projection.name().to_string(), Arc::clone(&projection));
        }

        if let Err(e) = self.launch(&projection) {
            let mut projections = self.projections.write();
            if Self::holds(&projections, &projection) {
                projections.remove(projection.name());
            }
            return Err(e);
        }

        tracing::info!(
            projection = %projection.definition.name,
            channel = %projection.definition.channel,
            binder = %projection.definition.binder,
            last_applied = ?projection.last_applied(),
            "projection created"
        );
        drop(lifecycle);
        Ok(projection)
    }

    /// Start a worker for `projection` from its durable checkpoint.
    fn launch(&self, projection: &Projection) -> Result<()> {
        let definition = Arc::clone(&projection.definition);
        let binder = self.documents.open(&definition.binder)?;
        let checkpoint = self.checkpoints.load(&definition.name)?;

        let policy = match checkpoint {
            None => StartPolicy::FromStart,
            Some(last) => StartPolicy::FromNumber(i64::try_from(last.0 + 1).unwrap_or(i64::MAX)),
        };
        projection.progress.set(checkpoint);

        let worker = ProjectionWorker::new(
            Arc::clone(&definition),
            binder,
            self.checkpoints.clone(),
            self.config.clone(),
            Arc::clone(&projection.progress),
        );
        let subscription = self.log.subscribe_boxed(
            &definition.channel,
            policy,
            Box::new(worker),
            self.subscription.clone(),
        )?;

        *projection.subscription.lock() = Some(Arc::new(subscription));
        Ok(())
    }

    fn holds(
        projections: &BTreeMap<String, Arc<Projection>>,
        projection: &Arc<Projection>,
    ) -> bool {
        projections
            .get(projection.name())
            .is_some_and(|registered| Arc::ptr_eq(registered, projection))
    }

    pub fn get(&self, name: &str) -> Option<Arc<Projection>> {
        self.projections.read().get(name).cloned()
    }

    fn require(&self, name: &str) -> Result<Arc<Projection>> {
        self.get(name)
            .ok_or_else(|| EngineError::ProjectionNotFound(name.to_string()))
    }

    /// Stop a projection; it stays registered.
    pub fn stop(&self, name: &str) -> Result<()> {
        self.require(name)?.stop();
        Ok(())
    }

    pub fn stop_all(&self) {
        let projections: Vec<_> = self.projections.read().values().cloned().collect();
        for projection in projections {
            projection.stop();
        }
    }

    /// Stop a projection if needed and start it again from its checkpoint.
    ///
    /// The registry stays unlocked while the old worker drains, so callbacks
    /// may query it.
    pub fn restart(&self, name: &str) -> Result<Arc<Projection>> {
        let projection = self.require(name)?;
        let lifecycle = projection.lifecycle.lock();
        if !Self::holds(&self.projections.read(), &projection) {
            return Err(EngineError::ProjectionNotFound(name.to_string()));
        }

        projection.stop();
        self.launch(&projection)?;
        drop(lifecycle);

        tracing::info!(
            projection = name,
            last_applied = ?projection.last_applied(),
            "projection restarted"
        );
        Ok(projection)
    }

    /// Stop and unregister a projection. Its checkpoint is kept, so a
    /// projection created later under the same name resumes from it.
    pub fn remove(&self, name: &str) -> Result<Arc<Projection>> {
        let projection = self
            .projections
            .write()
            .remove(name)
            .ok_or_else(|| EngineError::ProjectionNotFound(name.to_string()))?;
        {
            let _lifecycle = projection.lifecycle.lock();
            projection.stop();
        }
        tracing::info!(projection = name, "projection removed");
        Ok(projection)
    }

    pub fn status(&self, name: &str) -> Result<ProjectionStatus> {
        Ok(self.require(name)?.status())
    }

    /// Durable checkpoint of `name`, registered or not.
    pub fn checkpoint(&self, name: &str) -> Result<Option<Sequence>> {
        self.checkpoints.load(name)
    }

    pub fn is_projection_name(&self, name: &str) -> bool {
        self.projections.read().contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn list_names(&self) -> Vec<String> {
        self.projections.read().keys().cloned().collect()
    }
}
