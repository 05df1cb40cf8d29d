//! Durable projection progress.

use crate::binders::{Binder, DocumentStore};
use crate::document::Document;
use crate::error::{EngineError, Result};
use crate::types::{DocumentId, Sequence};
use std::sync::Arc;

/// Reserved binder holding one checkpoint document per projection.
pub const CHECKPOINT_BINDER: &str = "__projection_checkpoints";

const LAST_APPLIED: &str = "lastApplied";

/// Checkpoint documents `{ "lastApplied": n }` keyed by projection name.
#[derive(Clone)]
pub struct CheckpointStore {
    binder: Arc<dyn Binder>,
}

impl CheckpointStore {
    pub fn open(documents: &dyn DocumentStore) -> Result<Self> {
        Ok(Self {
            binder: documents.open(CHECKPOINT_BINDER)?,
        })
    }

    /// Last fully applied sequence number, `None` if nothing was applied.
    pub fn load(&self, projection: &str) -> Result<Option<Sequence>> {
        let Some(document) = self.binder.get(&DocumentId::from(projection))? else {
            return Ok(None);
        };
        document
            .get_u64(LAST_APPLIED)
            .map(|n| Some(Sequence(n)))
            .ok_or_else(|| {
                EngineError::Corruption(format!(
                    "checkpoint of projection {} has no {}",
                    projection, LAST_APPLIED
                ))
            })
    }

    pub fn save(&self, projection: &str, sequence: Sequence) -> Result<()> {
        let document = Document::new().with(LAST_APPLIED, sequence.0);
        self.binder.put(&DocumentId::from(projection), &document)
    }

    /// Move the checkpoint to just before `sequence`.
    ///
    /// Rewinding before event 0 removes the checkpoint, so the projection
    /// starts over from the beginning of its channel.
    pub fn rewind(&self, projection: &str, sequence: Sequence) -> Result<()> {
        match sequence.prev() {
            Some(previous) => self.save(projection, previous),
            None => self.clear(projection).map(|_| ()),
        }
    }

    /// Forget a projection's progress. Returns whether a checkpoint existed.
    pub fn clear(&self, projection: &str) -> Result<bool> {
        self.binder.delete(&DocumentId::from(projection))
    }
}
