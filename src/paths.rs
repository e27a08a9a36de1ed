//! Path layout: synced storage-directory tree + local app data dir.
//!
//! Engine bookkeeping that must not travel through the folder-sync
//! client (the relational cache) lives under the local data dir;
//! everything else is laid out inside the storage directory itself.

use std::cell::RefCell;
use std::path::{Path, PathBuf};

use crate::core::{InstanceId, NoteId, SdId};

/// Marker file holding the storage directory's identity.
pub fn sd_marker_path(root: &Path) -> PathBuf {
    root.join("meta.json")
}

pub fn notes_dir(root: &Path) -> PathBuf {
    root.join("notes")
}

pub fn note_dir(root: &Path, note_id: NoteId) -> PathBuf {
    notes_dir(root).join(note_id.to_string())
}

/// The external CRDT library's own update log directory for a note.
pub fn note_logs_dir(root: &Path, note_id: NoteId) -> PathBuf {
    note_dir(root, note_id).join("logs")
}

pub fn activity_dir(root: &Path) -> PathBuf {
    root.join("activity")
}

pub fn activity_log_path(root: &Path, instance_id: InstanceId) -> PathBuf {
    activity_dir(root).join(format!("{instance_id}.log"))
}

pub fn deleted_dir(root: &Path) -> PathBuf {
    root.join("deleted")
}

pub fn deletion_log_path(root: &Path, instance_id: InstanceId) -> PathBuf {
    deleted_dir(root).join(format!("{instance_id}.log"))
}

pub fn moves_dir(root: &Path) -> PathBuf {
    root.join("moves")
}

pub fn move_log_path(root: &Path, instance_id: InstanceId) -> PathBuf {
    moves_dir(root).join(format!("{instance_id}.log"))
}

pub fn folders_logs_dir(root: &Path) -> PathBuf {
    root.join("folders").join("logs")
}

pub fn media_dir(root: &Path) -> PathBuf {
    root.join("media")
}

pub fn note_media_dir(root: &Path, note_id: NoteId) -> PathBuf {
    media_dir(root).join(note_id.to_string())
}

pub fn profiles_dir(root: &Path) -> PathBuf {
    root.join("profiles")
}

pub fn profile_path(root: &Path, instance_id: InstanceId) -> PathBuf {
    profiles_dir(root).join(format!("{instance_id}.json"))
}

/// Parse `<uuid>.log` file names; anything else is not an engine log.
pub fn log_file_writer(path: &Path) -> Option<InstanceId> {
    let stem = path.file_stem()?.to_str()?;
    if path.extension()?.to_str()? != "log" {
        return None;
    }
    InstanceId::parse_str(stem).ok()
}

/// Base directory for local persistent data (caches).
///
/// Uses `FOLIO_DATA_DIR` if set, otherwise `$XDG_DATA_HOME/folio-sync`
/// or `~/.local/share/folio-sync`.
pub(crate) fn data_dir() -> PathBuf {
    if let Some(dir) = thread_local_data_dir_override() {
        return dir;
    }

    if let Ok(dir) = std::env::var("FOLIO_DATA_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_DATA_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("share")
        })
        .join("folio-sync")
}

/// Local cache directories, one per storage directory.
pub fn sd_data_root() -> PathBuf {
    data_dir().join("sd")
}

pub fn sd_cache_dir(sd_id: SdId) -> PathBuf {
    sd_data_root().join(sd_id.to_string())
}

#[doc(hidden)]
pub struct DataDirOverride {
    prev: Option<PathBuf>,
}

impl DataDirOverride {
    pub fn new(path: Option<PathBuf>) -> Self {
        let prev = DATA_DIR_OVERRIDE.with(|cell| cell.replace(path));
        Self { prev }
    }
}

impl Drop for DataDirOverride {
    fn drop(&mut self) {
        let prev = self.prev.take();
        DATA_DIR_OVERRIDE.with(|cell| {
            cell.replace(prev);
        });
    }
}

/// Redirect the data dir for the current thread, restored on drop.
#[doc(hidden)]
pub fn override_data_dir_for_tests(path: Option<PathBuf>) -> DataDirOverride {
    DataDirOverride::new(path)
}

fn thread_local_data_dir_override() -> Option<PathBuf> {
    DATA_DIR_OVERRIDE.with(|cell| cell.borrow().clone())
}

thread_local! {
    static DATA_DIR_OVERRIDE: RefCell<Option<PathBuf>> = const { RefCell::new(None) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_writer_parses_engine_logs_only() {
        let id = InstanceId::generate();
        let path = PathBuf::from(format!("/sd/activity/{id}.log"));
        assert_eq!(log_file_writer(&path), Some(id));

        assert_eq!(log_file_writer(Path::new("/sd/activity/readme.txt")), None);
        assert_eq!(log_file_writer(Path::new("/sd/activity/junk.log")), None);
    }

    #[test]
    fn override_scopes_to_thread_and_restores() {
        let dir = PathBuf::from("/tmp/folio-test-data");
        {
            let _guard = override_data_dir_for_tests(Some(dir.clone()));
            assert_eq!(data_dir(), dir);
        }
        assert_ne!(data_dir(), dir);
    }
}
