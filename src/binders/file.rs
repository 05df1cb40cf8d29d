//! File-per-document binder storage.
//!
//! Layout under the store root:
//!
//! ```text
//! binders/<hex(binder name)>/<shard>/<sha256(id)>.doc
//! ```
//!
//! where `<shard>` is the first byte of the id digest. Documents are
//! replaced atomically (temp file + rename) and read through a per-binder
//! LRU cache.

use super::{check_binder_name, Binder, DocumentScan, DocumentStore, ScanPredicate};
use crate::document::Document;
use crate::error::{EngineError, Result};
use crate::lock::acquire_lock;
use crate::types::DocumentId;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Magic bytes for document files.
const DOC_MAGIC: &[u8; 4] = b"DOC\0";

/// Current document format version.
const DOC_VERSION: u8 = 1;

/// Document store keeping one file per document.
pub struct FileDocumentStore {
    root: PathBuf,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Documents cached per binder.
    cache_size: usize,

    /// Opened binders by name.
    binders: RwLock<HashMap<String, Arc<FileBinder>>>,
}

impl FileDocumentStore {
    pub const DEFAULT_CACHE_SIZE: usize = 1000;

    /// Open or create a store at `root` with the default cache size.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_cache_size(root, Self::DEFAULT_CACHE_SIZE)
    }

    pub fn open_with_cache_size(root: impl AsRef<Path>, cache_size: usize) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("binders"))?;
        let lock_file = acquire_lock(&root)?;

        tracing::debug!(root = %root.display(), cache_size, "opened file document store");

        Ok(Self {
            root,
            _lock_file: lock_file,
            cache_size,
            binders: RwLock::new(HashMap::new()),
        })
    }

    /// Root directory of the store.
    pub fn path(&self) -> &Path {
        &self.root
    }
}

impl DocumentStore for FileDocumentStore {
    fn open(&self, name: &str) -> Result<Arc<dyn Binder>> {
        check_binder_name(name)?;
        if let Some(existing) = self.binders.read().get(name) {
            return Ok(Arc::clone(existing) as Arc<dyn Binder>);
        }

        let mut binders = self.binders.write();
        if let Some(existing) = binders.get(name) {
            return Ok(Arc::clone(existing) as Arc<dyn Binder>);
        }

        let path = self
            .root
            .join("binders")
            .join(hex::encode(name.as_bytes()));
        fs::create_dir_all(&path)?;

        let binder = Arc::new(FileBinder::new(name, path, self.cache_size));
        binders.insert(name.to_string(), Arc::clone(&binder));
        Ok(binder as Arc<dyn Binder>)
    }

    fn binder_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.root.join("binders"))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let raw = entry.file_name();
            let Some(name) = raw
                .to_str()
                .and_then(|s| hex::decode(s).ok())
                .and_then(|bytes| String::from_utf8(bytes).ok())
            else {
                continue;
            };
            names.push(name);
        }
        names.sort();
        Ok(names)
    }
}

/// A binder stored as a directory of document files.
pub struct FileBinder {
    name: String,

    /// Binder directory.
    path: PathBuf,

    /// LRU cache for recently accessed documents.
    cache: Mutex<LruCache<DocumentId, Document>>,

    /// Serialises writers and cache fills.
    write_lock: Mutex<()>,
}

impl FileBinder {
    fn new(name: &str, path: PathBuf, cache_size: usize) -> Self {
        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            name: name.to_string(),
            path,
            cache: Mutex::new(LruCache::new(cache_size)),
            write_lock: Mutex::new(()),
        }
    }

    fn document_path(&self, id: &DocumentId) -> PathBuf {
        let digest = Sha256::digest(id.as_str().as_bytes());
        self.path
            .join(hex::encode(&digest[0..1]))
            .join(format!("{}.doc", hex::encode(digest)))
    }

    /// Every document file currently in the binder.
    fn document_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for shard in fs::read_dir(&self.path)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) == Some("doc") {
                    files.push(path);
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

impl Binder for FileBinder {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, id: &DocumentId) -> Result<Option<Document>> {
        if let Some(cached) = self.cache.lock().get(id).cloned() {
            return Ok(Some(cached));
        }

        // A put racing this read must not be overwritten in the cache by
        // the older file contents.
        let _guard = self.write_lock.lock();
        if let Some(cached) = self.cache.lock().get(id).cloned() {
            return Ok(Some(cached));
        }

        let Some((stored_id, document)) = read_document_file(&self.document_path(id))? else {
            return Ok(None);
        };
        if &stored_id != id {
            return Err(EngineError::Corruption(format!(
                "binder {}: file for {} holds document {}",
                self.name, id, stored_id
            )));
        }

        self.cache.lock().put(id.clone(), document.clone());
        Ok(Some(document))
    }

    fn put(&self, id: &DocumentId, document: &Document) -> Result<()> {
        let encoded = encode_document(id, document)?;
        let path = self.document_path(id);

        let _guard = self.write_lock.lock();
        if let Some(shard) = path.parent() {
            fs::create_dir_all(shard)?;
        }

        let tmp_path = path.with_extension("doc.tmp");
        let mut file = File::create(&tmp_path)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &path)?;

        self.cache.lock().put(id.clone(), document.clone());
        Ok(())
    }

    fn delete(&self, id: &DocumentId) -> Result<bool> {
        let _guard = self.write_lock.lock();
        self.cache.lock().pop(id);

        match fs::remove_file(self.document_path(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn scan(&self, predicate: ScanPredicate) -> Result<DocumentScan> {
        let files = self.document_files()?;

        Ok(Box::new(files.into_iter().filter_map(move |path| {
            match read_document_file(&path) {
                Ok(Some((id, document))) => predicate(&id, &document).then_some(Ok((id, document))),
                // Deleted since the scan started.
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            }
        })))
    }

    fn count(&self) -> Result<usize> {
        Ok(self.document_files()?.len())
    }
}

fn encode_document(id: &DocumentId, document: &Document) -> Result<Vec<u8>> {
    let id_bytes = id.as_str().as_bytes();
    let id_len = u16::try_from(id_bytes.len()).map_err(|_| {
        EngineError::InvalidOperation(format!("document id of {} bytes is too long", id_bytes.len()))
    })?;
    let body = document.to_bytes()?;

    let mut out = Vec::with_capacity(4 + 1 + 2 + id_bytes.len() + 4 + body.len() + 4);
    out.extend_from_slice(DOC_MAGIC);
    out.push(DOC_VERSION);
    out.extend_from_slice(&id_len.to_le_bytes());
    out.extend_from_slice(id_bytes);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(id_bytes);
    hasher.update(&body);
    out.extend_from_slice(&hasher.finalize().to_le_bytes());

    Ok(out)
}

/// Read a document file, returning `None` if it does not exist.
fn read_document_file(path: &Path) -> Result<Option<(DocumentId, Document)>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    // Read and verify magic
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != DOC_MAGIC {
        return Err(EngineError::InvalidFormat("Invalid document magic".into()));
    }

    // Read version
    let mut version = [0u8; 1];
    file.read_exact(&mut version)?;
    if version[0] != DOC_VERSION {
        return Err(EngineError::InvalidFormat(format!(
            "Unsupported document version: {}",
            version[0]
        )));
    }

    // Read id
    let mut id_len_bytes = [0u8; 2];
    file.read_exact(&mut id_len_bytes)?;
    let mut id_bytes = vec![0u8; u16::from_le_bytes(id_len_bytes) as usize];
    file.read_exact(&mut id_bytes)?;

    // Read body
    let mut body_len_bytes = [0u8; 4];
    file.read_exact(&mut body_len_bytes)?;
    let mut body = vec![0u8; u32::from_le_bytes(body_len_bytes) as usize];
    file.read_exact(&mut body)?;

    // Read and verify checksum
    let mut checksum_bytes = [0u8; 4];
    file.read_exact(&mut checksum_bytes)?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&id_bytes);
    hasher.update(&body);
    if u32::from_le_bytes(checksum_bytes) != hasher.finalize() {
        return Err(EngineError::Corruption(format!(
            "document checksum mismatch in {}",
            path.display()
        )));
    }

    let id = String::from_utf8(id_bytes)
        .map_err(|e| EngineError::Deserialization(e.to_string()))?;
    let document = Document::from_bytes(&body)?;

    Ok(Some((DocumentId(id), document)))
}
