//! Storage directory identity, layout and instance manifests.

pub mod identity;

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::InstanceId;
use crate::paths;

pub use identity::{SD_FORMAT_VERSION, SdError, SdMarker, SdResult, open_or_create, reconcile};

/// Create the engine's subdirectories inside a storage directory.
/// Idempotent; the folder-sync client may have created any subset.
pub fn ensure_layout(root: &Path) -> SdResult<()> {
    for dir in [
        paths::notes_dir(root),
        paths::activity_dir(root),
        paths::deleted_dir(root),
        paths::moves_dir(root),
        paths::folders_logs_dir(root),
        paths::media_dir(root),
        paths::profiles_dir(root),
    ] {
        fs::create_dir_all(&dir).map_err(|source| SdError::Io { path: dir, source })?;
    }
    Ok(())
}

/// Presence manifest for an instance that joined a storage directory.
/// Orphan cleanup treats a writer without a manifest as departed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceProfile {
    pub instance_id: InstanceId,
    pub joined_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Write our manifest if it is not already present.
pub fn ensure_instance_profile(
    root: &Path,
    instance_id: InstanceId,
    now_ms: u64,
    display_name: Option<String>,
) -> SdResult<()> {
    let path = paths::profile_path(root, instance_id);
    match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(mut file) => {
            let profile = InstanceProfile {
                instance_id,
                joined_at_ms: now_ms,
                display_name,
            };
            let bytes =
                serde_json::to_vec_pretty(&profile).map_err(|source| SdError::MarkerCorrupt {
                    path: path.clone(),
                    source,
                })?;
            file.write_all(&bytes).map_err(|source| SdError::Io {
                path: path.clone(),
                source,
            })?;
            file.sync_all()
                .map_err(|source| SdError::Io { path, source })?;
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(source) => Err(SdError::Io { path, source }),
    }
}

pub fn read_instance_profile(root: &Path, instance_id: InstanceId) -> SdResult<InstanceProfile> {
    let path = paths::profile_path(root, instance_id);
    let bytes = fs::read(&path).map_err(|source| SdError::Io {
        path: path.clone(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| SdError::MarkerCorrupt { path, source })
}
