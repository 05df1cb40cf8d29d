//! In-memory document store.

use super::{check_binder_name, Binder, DocumentScan, DocumentStore, ScanPredicate};
use crate::document::Document;
use crate::error::Result;
use crate::types::DocumentId;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Document store kept entirely in memory.
#[derive(Default)]
pub struct MemoryDocumentStore {
    binders: RwLock<HashMap<String, Arc<MemoryBinder>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn open(&self, name: &str) -> Result<Arc<dyn Binder>> {
        check_binder_name(name)?;
        let mut binders = self.binders.write();
        let binder = binders
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryBinder::new(name)));
        Ok(Arc::clone(binder) as Arc<dyn Binder>)
    }

    fn binder_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<_> = self.binders.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// One in-memory binder.
pub struct MemoryBinder {
    name: String,
    documents: Arc<RwLock<BTreeMap<DocumentId, Document>>>,
}

impl MemoryBinder {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            documents: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl Binder for MemoryBinder {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, id: &DocumentId) -> Result<Option<Document>> {
        Ok(self.documents.read().get(id).cloned())
    }

    fn put(&self, id: &DocumentId, document: &Document) -> Result<()> {
        self.documents.write().insert(id.clone(), document.clone());
        Ok(())
    }

    fn delete(&self, id: &DocumentId) -> Result<bool> {
        Ok(self.documents.write().remove(id).is_some())
    }

    fn scan(&self, predicate: ScanPredicate) -> Result<DocumentScan> {
        let keys: Vec<DocumentId> = self.documents.read().keys().cloned().collect();
        let documents = Arc::clone(&self.documents);

        Ok(Box::new(keys.into_iter().filter_map(move |id| {
            let document = documents.read().get(&id).cloned()?;
            predicate(&id, &document).then_some(Ok((id, document)))
        })))
    }

    fn count(&self) -> Result<usize> {
        Ok(self.documents.read().len())
    }
}
