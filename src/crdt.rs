//! Seam to the external CRDT document library.
//!
//! The engine never interprets update bytes: it transports them and
//! applies them through this trait. Merge semantics (commutative,
//! associative, idempotent for updates of the same document) are the
//! library's contract and are what replay correctness rests on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

use crate::core::NoteId;
use crate::error::Transience;

pub type DocResult<T> = Result<T, DocError>;

#[derive(Debug, Error)]
pub enum DocError {
    /// The note's document cannot be materialized yet (e.g. its
    /// creation update has not arrived through the sync layer).
    #[error("document for note {note_id} is not yet available")]
    NotYetAvailable { note_id: NoteId },
    #[error("update bytes rejected for note {note_id}: {reason}")]
    MalformedUpdate { note_id: NoteId, reason: String },
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DocError {
    pub fn transience(&self) -> Transience {
        match self {
            DocError::NotYetAvailable { .. } => Transience::Retryable,
            DocError::MalformedUpdate { .. } => Transience::Permanent,
            DocError::Io { .. } => Transience::Retryable,
        }
    }
}

/// One live CRDT document.
pub trait CrdtDocument: Send {
    fn apply_update(&mut self, update: &[u8]) -> DocResult<()>;
    fn encode_state_as_update(&self) -> Vec<u8>;
}

/// Loads documents from their on-disk representation inside a storage
/// directory (`notes/<noteId>/logs/`).
pub trait DocumentStore: Send + Sync {
    fn open(&self, sd_root: &Path, note_id: NoteId) -> DocResult<Box<dyn CrdtDocument>>;
}

type SharedDoc = Arc<Mutex<Box<dyn CrdtDocument>>>;

/// Owner of all live documents for one storage directory.
///
/// There is never more than one live document per note id: replay
/// loads-if-absent instead of constructing a second instance, so every
/// update funnels through the same in-memory document.
pub struct DocumentRegistry {
    store: Arc<dyn DocumentStore>,
    docs: Mutex<HashMap<NoteId, SharedDoc>>,
}

impl DocumentRegistry {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            docs: Mutex::new(HashMap::new()),
        }
    }

    /// The resident document for a note, loading it from disk when
    /// absent.
    pub fn open_or_load(&self, sd_root: &Path, note_id: NoteId) -> DocResult<SharedDoc> {
        let mut docs = self.docs.lock().expect("document registry poisoned");
        if let Some(doc) = docs.get(&note_id) {
            return Ok(Arc::clone(doc));
        }
        let doc: SharedDoc = Arc::new(Mutex::new(self.store.open(sd_root, note_id)?));
        docs.insert(note_id, Arc::clone(&doc));
        debug!(%note_id, "document loaded");
        Ok(doc)
    }

    pub fn apply_update(&self, sd_root: &Path, note_id: NoteId, update: &[u8]) -> DocResult<()> {
        let doc = self.open_or_load(sd_root, note_id)?;
        let mut doc = doc.lock().expect("document poisoned");
        doc.apply_update(update)
    }

    pub fn encode_state(&self, sd_root: &Path, note_id: NoteId) -> DocResult<Vec<u8>> {
        let doc = self.open_or_load(sd_root, note_id)?;
        let doc = doc.lock().expect("document poisoned");
        Ok(doc.encode_state_as_update())
    }

    /// Drop the resident document, if any. Deletion replay calls this
    /// before removing on-disk state so no stale handle survives.
    pub fn unload(&self, note_id: NoteId) -> bool {
        self.docs
            .lock()
            .expect("document registry poisoned")
            .remove(&note_id)
            .is_some()
    }

    pub fn resident(&self) -> Vec<NoteId> {
        let docs = self.docs.lock().expect("document registry poisoned");
        docs.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Update-set document: apply inserts, state is the sorted union.
    struct SetDoc {
        updates: HashSet<Vec<u8>>,
    }

    impl CrdtDocument for SetDoc {
        fn apply_update(&mut self, update: &[u8]) -> DocResult<()> {
            self.updates.insert(update.to_vec());
            Ok(())
        }

        fn encode_state_as_update(&self) -> Vec<u8> {
            let mut all: Vec<&Vec<u8>> = self.updates.iter().collect();
            all.sort();
            all.into_iter().flatten().copied().collect()
        }
    }

    struct CountingStore {
        opens: AtomicUsize,
    }

    impl DocumentStore for CountingStore {
        fn open(&self, _sd_root: &Path, _note_id: NoteId) -> DocResult<Box<dyn CrdtDocument>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(SetDoc {
                updates: HashSet::new(),
            }))
        }
    }

    #[test]
    fn open_or_load_returns_single_instance() {
        let store = Arc::new(CountingStore {
            opens: AtomicUsize::new(0),
        });
        let registry = DocumentRegistry::new(Arc::clone(&store) as Arc<dyn DocumentStore>);
        let root = Path::new("/sd");
        let note = NoteId::generate();

        registry.apply_update(root, note, b"a").unwrap();
        registry.apply_update(root, note, b"b").unwrap();
        assert_eq!(store.opens.load(Ordering::SeqCst), 1);

        assert!(registry.unload(note));
        registry.apply_update(root, note, b"c").unwrap();
        assert_eq!(store.opens.load(Ordering::SeqCst), 2);
    }
}
