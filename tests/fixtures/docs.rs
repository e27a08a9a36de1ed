#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use folio_sync::crdt::{CrdtDocument, DocError, DocResult, DocumentRegistry, DocumentStore};
use folio_sync::{NoteId, SdId};

/// Grow-only update-set document: applying an update inserts it,
/// state is the sorted union. Commutative and idempotent like the
/// real merge, and trivially comparable in assertions.
pub struct SetDoc {
    updates: HashSet<Vec<u8>>,
}

impl CrdtDocument for SetDoc {
    fn apply_update(&mut self, update: &[u8]) -> DocResult<()> {
        self.updates.insert(update.to_vec());
        Ok(())
    }

    fn encode_state_as_update(&self) -> Vec<u8> {
        let sorted: BTreeSet<&Vec<u8>> = self.updates.iter().collect();
        let mut out = Vec::new();
        for update in sorted {
            out.extend_from_slice(update);
            out.push(b'|');
        }
        out
    }
}

/// Document store whose per-note availability the test controls.
#[derive(Default)]
pub struct FakeStore {
    unavailable: Mutex<HashSet<NoteId>>,
    /// Snapshot updates applied at load, simulating state already on
    /// disk under `notes/<noteId>/logs/`.
    preloaded: Mutex<HashMap<NoteId, Vec<Vec<u8>>>>,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_unavailable(&self, note_id: NoteId) {
        self.unavailable.lock().unwrap().insert(note_id);
    }

    pub fn set_available(&self, note_id: NoteId) {
        self.unavailable.lock().unwrap().remove(&note_id);
    }

    pub fn preload(&self, note_id: NoteId, updates: Vec<Vec<u8>>) {
        self.preloaded.lock().unwrap().insert(note_id, updates);
    }
}

impl DocumentStore for FakeStore {
    fn open(&self, _sd_root: &Path, note_id: NoteId) -> DocResult<Box<dyn CrdtDocument>> {
        if self.unavailable.lock().unwrap().contains(&note_id) {
            return Err(DocError::NotYetAvailable { note_id });
        }
        let mut doc = SetDoc {
            updates: HashSet::new(),
        };
        if let Some(updates) = self.preloaded.lock().unwrap().get(&note_id) {
            for update in updates {
                doc.updates.insert(update.clone());
            }
        }
        Ok(Box::new(doc))
    }
}

/// The resident document's state, or empty if it was never loaded.
pub fn doc_state(registry: &DocumentRegistry, sd_root: &Path, note_id: NoteId) -> Vec<u8> {
    registry
        .encode_state(sd_root, note_id)
        .unwrap_or_default()
}

pub fn new_registry(store: &Arc<FakeStore>) -> Arc<DocumentRegistry> {
    Arc::new(DocumentRegistry::new(
        Arc::clone(store) as Arc<dyn DocumentStore>
    ))
}

/// Ids used by most replay tests.
pub struct Ids {
    pub sd: SdId,
    pub note: NoteId,
}

impl Ids {
    pub fn fresh() -> Self {
        Self {
            sd: SdId::generate(),
            note: NoteId::generate(),
        }
    }
}
