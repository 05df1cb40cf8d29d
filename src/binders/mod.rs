//! Keyed document storage.
//!
//! A [`DocumentStore`] hands out named [`Binder`]s; each binder is a durable
//! map from [`DocumentId`] to [`Document`]. Projections write their output
//! through binders and keep their checkpoints in a reserved one. Writes are
//! full replaces with last-write-wins semantics.

mod file;
mod memory;

pub use file::FileDocumentStore;
pub use memory::MemoryDocumentStore;

use crate::document::Document;
use crate::error::Result;
use crate::types::DocumentId;
use std::sync::Arc;

/// Predicate deciding which documents a scan yields.
pub type ScanPredicate = Box<dyn Fn(&DocumentId, &Document) -> bool + Send>;

/// Lazy, finite sequence of scanned documents.
///
/// The key set is captured when the scan starts; documents are read as the
/// iterator advances.
pub type DocumentScan = Box<dyn Iterator<Item = Result<(DocumentId, Document)>> + Send>;

/// Storage backend handing out binders by name.
pub trait DocumentStore: Send + Sync {
    /// Open a binder, creating it if absent. Idempotent.
    fn open(&self, name: &str) -> Result<Arc<dyn Binder>>;

    /// Names of all binders created so far.
    fn binder_names(&self) -> Result<Vec<String>>;
}

/// A named collection of documents.
pub trait Binder: Send + Sync {
    fn name(&self) -> &str;

    fn get(&self, id: &DocumentId) -> Result<Option<Document>>;

    /// Store `document` under `id`, replacing any previous value.
    fn put(&self, id: &DocumentId, document: &Document) -> Result<()>;

    /// Remove a document. Returns whether it existed.
    fn delete(&self, id: &DocumentId) -> Result<bool>;

    fn scan(&self, predicate: ScanPredicate) -> Result<DocumentScan>;

    /// Scan every document.
    fn scan_all(&self) -> Result<DocumentScan> {
        self.scan(Box::new(|_, _| true))
    }

    fn count(&self) -> Result<usize>;
}

/// Validate a binder name before it reaches a backend.
pub(crate) fn check_binder_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(crate::error::EngineError::InvalidOperation(
            "binder name must not be empty".into(),
        ));
    }
    Ok(())
}
