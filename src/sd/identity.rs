//! Storage directory identity marker.
//!
//! The marker file pins a stable UUID to the directory tree. Two
//! instances can race to create it — locally (create_new loses the
//! race and adopts) or across machines, where the folder-sync client
//! later replaces the file with the other side's version. The rule is
//! the same everywhere: generate, then adopt whatever the file says.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::core::SdId;
use crate::error::Transience;
use crate::paths;

pub const SD_FORMAT_VERSION: u32 = 1;

pub type SdResult<T> = Result<T, SdError>;

#[derive(Debug, Error)]
pub enum SdError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("identity marker corrupted at {path:?}: {source}")]
    MarkerCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported storage directory format {got} at {path:?} (supported {supported})")]
    UnsupportedFormat {
        path: PathBuf,
        got: u32,
        supported: u32,
    },
    #[error("storage directory root is not a directory: {path:?}")]
    NotADirectory { path: PathBuf },
}

impl SdError {
    pub fn transience(&self) -> Transience {
        match self {
            SdError::Io { .. } => Transience::Retryable,
            _ => Transience::Permanent,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdMarker {
    pub sd_id: SdId,
    pub created_at_ms: u64,
    pub format_version: u32,
}

impl SdMarker {
    pub fn new(sd_id: SdId, created_at_ms: u64) -> Self {
        Self {
            sd_id,
            created_at_ms,
            format_version: SD_FORMAT_VERSION,
        }
    }
}

/// Open a storage directory, creating its identity if it has none.
///
/// When our freshly generated marker loses a local creation race the
/// existing file's identity is adopted instead.
pub fn open_or_create(root: &Path, now_ms: u64) -> SdResult<SdMarker> {
    match fs::metadata(root) {
        Ok(meta) if !meta.is_dir() => {
            return Err(SdError::NotADirectory {
                path: root.to_path_buf(),
            });
        }
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(root).map_err(|source| SdError::Io {
                path: root.to_path_buf(),
                source,
            })?;
        }
        Err(source) => {
            return Err(SdError::Io {
                path: root.to_path_buf(),
                source,
            });
        }
    }

    let path = paths::sd_marker_path(root);
    let marker = SdMarker::new(SdId::generate(), now_ms);
    match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(mut file) => {
            let bytes = serde_json::to_vec_pretty(&marker).map_err(|source| {
                SdError::MarkerCorrupt {
                    path: path.clone(),
                    source,
                }
            })?;
            file.write_all(&bytes).map_err(|source| SdError::Io {
                path: path.clone(),
                source,
            })?;
            file.sync_all().map_err(|source| SdError::Io {
                path: path.clone(),
                source,
            })?;
            info!(sd_id = %marker.sd_id, root = %root.display(), "storage directory created");
            Ok(marker)
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            let existing = read_marker(&path)?;
            info!(sd_id = %existing.sd_id, root = %root.display(),
                  "adopting existing storage directory identity");
            Ok(existing)
        }
        Err(source) => Err(SdError::Io { path, source }),
    }
}

/// Re-read the marker and report a changed identity.
///
/// The folder-sync client may replace the marker long after creation
/// (two machines created the directory near-simultaneously and the
/// other side's file won). The on-disk file is the truth; the caller
/// re-keys its bookkeeping to the returned id.
pub fn reconcile(root: &Path, current: SdId) -> SdResult<Option<SdId>> {
    let path = paths::sd_marker_path(root);
    let marker = match read_marker(&path) {
        Ok(marker) => marker,
        // Marker momentarily absent mid-replace: keep the current id.
        Err(SdError::Io { ref source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            return Ok(None);
        }
        Err(err) => return Err(err),
    };
    if marker.sd_id != current {
        info!(old = %current, new = %marker.sd_id, "storage directory identity changed on disk");
        return Ok(Some(marker.sd_id));
    }
    Ok(None)
}

pub fn read_marker(path: &Path) -> SdResult<SdMarker> {
    let bytes = fs::read(path).map_err(|source| SdError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let marker: SdMarker =
        serde_json::from_slice(&bytes).map_err(|source| SdError::MarkerCorrupt {
            path: path.to_path_buf(),
            source,
        })?;
    if marker.format_version > SD_FORMAT_VERSION {
        return Err(SdError::UnsupportedFormat {
            path: path.to_path_buf(),
            got: marker.format_version,
            supported: SD_FORMAT_VERSION,
        });
    }
    Ok(marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_then_reopen_keeps_identity() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("sd");

        let first = open_or_create(&root, 1).unwrap();
        let second = open_or_create(&root, 2).unwrap();
        assert_eq!(first.sd_id, second.sd_id);
        assert_eq!(second.created_at_ms, 1);
    }

    #[test]
    fn reconcile_reports_replaced_marker() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("sd");
        let marker = open_or_create(&root, 1).unwrap();

        assert_eq!(reconcile(&root, marker.sd_id).unwrap(), None);

        // Folder sync replaces the marker with the other machine's.
        let winner = SdMarker::new(SdId::generate(), 0);
        fs::write(
            paths::sd_marker_path(&root),
            serde_json::to_vec(&winner).unwrap(),
        )
        .unwrap();

        assert_eq!(
            reconcile(&root, marker.sd_id).unwrap(),
            Some(winner.sd_id)
        );
    }

    #[test]
    fn corrupt_marker_is_an_error() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("sd");
        let marker = open_or_create(&root, 1).unwrap();

        fs::write(paths::sd_marker_path(&root), b"{not json").unwrap();
        assert!(matches!(
            reconcile(&root, marker.sd_id).unwrap_err(),
            SdError::MarkerCorrupt { .. }
        ));
    }
}
