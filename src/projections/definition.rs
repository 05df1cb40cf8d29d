//! Projection definitions.

use super::checkpoint::CHECKPOINT_BINDER;
use crate::document::Document;
use crate::error::{EngineError, Result};
use crate::log::EventEnvelope;
use crate::types::DocumentId;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Decides whether an event concerns the projection.
pub type EventFilter = Arc<dyn Fn(&EventEnvelope) -> bool + Send + Sync>;

/// Picks the document an event applies to. `None` skips the event.
pub type IdSelector = Arc<dyn Fn(&EventEnvelope) -> Option<DocumentId> + Send + Sync>;

/// Folds an event into the current document.
pub type ApplyFn =
    Arc<dyn Fn(Document, &EventEnvelope) -> std::result::Result<Document, ApplyError> + Send + Sync>;

/// Error returned by a fallible apply function.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ApplyError(pub String);

impl ApplyError {
    pub fn new(message: impl Into<String>) -> Self {
        ApplyError(message.into())
    }
}

impl From<&str> for ApplyError {
    fn from(message: &str) -> Self {
        ApplyError(message.to_string())
    }
}

impl From<String> for ApplyError {
    fn from(message: String) -> Self {
        ApplyError(message)
    }
}

/// Everything needed to run a projection.
///
/// Built with [`ProjectionDefinition::builder`]; `filter` is optional and
/// accepts every event when omitted.
#[derive(Clone)]
pub struct ProjectionDefinition {
    pub name: String,
    pub channel: String,
    pub binder: String,
    pub filter: EventFilter,
    pub id_selector: IdSelector,
    pub apply: ApplyFn,
}

impl ProjectionDefinition {
    pub fn builder(name: impl Into<String>) -> ProjectionBuilder {
        ProjectionBuilder {
            name: name.into(),
            ..Default::default()
        }
    }
}

impl fmt::Debug for ProjectionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectionDefinition")
            .field("name", &self.name)
            .field("channel", &self.channel)
            .field("binder", &self.binder)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct ProjectionBuilder {
    name: String,
    channel: Option<String>,
    binder: Option<String>,
    filter: Option<EventFilter>,
    id_selector: Option<IdSelector>,
    apply: Option<ApplyFn>,
}

impl ProjectionBuilder {
    /// Channel the projection consumes.
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Binder the projected documents are written to.
    pub fn binder(mut self, binder: impl Into<String>) -> Self {
        self.binder = Some(binder.into());
        self
    }

    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&EventEnvelope) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn id_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(&EventEnvelope) -> Option<DocumentId> + Send + Sync + 'static,
    {
        self.id_selector = Some(Arc::new(selector));
        self
    }

    /// Infallible apply function.
    pub fn apply<F>(mut self, apply: F) -> Self
    where
        F: Fn(Document, &EventEnvelope) -> Document + Send + Sync + 'static,
    {
        self.apply = Some(Arc::new(move |doc: Document, event: &EventEnvelope| {
            Ok::<_, ApplyError>(apply(doc, event))
        }));
        self
    }

    /// Apply function that may reject an event.
    pub fn try_apply<F>(mut self, apply: F) -> Self
    where
        F: Fn(Document, &EventEnvelope) -> std::result::Result<Document, ApplyError>
            + Send
            + Sync
            + 'static,
    {
        self.apply = Some(Arc::new(apply));
        self
    }

    pub fn build(self) -> Result<ProjectionDefinition> {
        fn missing(name: &str, field: &str) -> EngineError {
            EngineError::InvalidDefinition(format!("projection {:?}: missing {}", name, field))
        }

        if self.name.is_empty() {
            return Err(EngineError::InvalidDefinition(
                "projection name must not be empty".into(),
            ));
        }
        let channel = self
            .channel
            .filter(|c| !c.is_empty())
            .ok_or_else(|| missing(&self.name, "channel"))?;
        let binder = self
            .binder
            .filter(|b| !b.is_empty())
            .ok_or_else(|| missing(&self.name, "binder"))?;
        if binder == CHECKPOINT_BINDER {
            return Err(EngineError::InvalidDefinition(format!(
                "projection {:?}: binder {} is reserved",
                self.name, CHECKPOINT_BINDER
            )));
        }
        let id_selector = self
            .id_selector
            .ok_or_else(|| missing(&self.name, "id selector"))?;
        let apply = self.apply.ok_or_else(|| missing(&self.name, "apply function"))?;
        let filter = self
            .filter
            .unwrap_or_else(|| Arc::new(|_: &EventEnvelope| true) as EventFilter);

        Ok(ProjectionDefinition {
            name: self.name,
            channel,
            binder,
            filter,
            id_selector,
            apply,
        })
    }
}
