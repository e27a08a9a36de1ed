//! Per-storage-directory relational cache.
//!
//! Mirror of CRDT-derived note metadata for fast querying plus the
//! engine's durable bookkeeping: watermarks, tombstones and skipped
//! entries. Never the source of truth — everything here can be
//! rebuilt from the logs, which is also why watermark corruption
//! degrades to a full re-read instead of an error.
//!
//! Lives in the local app data dir, never inside the synced tree.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use crate::core::{FolderId, InstanceId, LogKind, NoteId, SdId, Tombstone, Watermark};
use crate::error::Transience;

const SCHEMA_VERSION: u32 = 1;
const BUSY_TIMEOUT_MS: u64 = 5_000;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache schema version mismatch: expected {expected}, got {got}")]
    SchemaVersionMismatch { expected: u32, got: u32 },
    #[error("missing meta key: {key}")]
    MetaMissing { key: &'static str },
    #[error("row decode failed: {0}")]
    RowDecode(String),
}

impl CacheError {
    pub fn transience(&self) -> Transience {
        match self {
            CacheError::Sqlite(_) | CacheError::Io { .. } => Transience::Retryable,
            _ => Transience::Permanent,
        }
    }
}

/// Cached note metadata (consumer-maintained mirror).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NoteRow {
    pub note_id: NoteId,
    pub title: Option<String>,
    pub folder_id: Option<FolderId>,
    pub updated_at_ms: u64,
}

/// Persisted replay cursor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatermarkRow {
    pub kind: LogKind,
    pub origin: InstanceId,
    pub watermark: Watermark,
    pub source_file: String,
}

/// A record replay could not apply, persisted so it is never dropped
/// silently and can be retried or explicitly skipped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippedEntry {
    pub kind: LogKind,
    pub origin: InstanceId,
    pub epoch: u64,
    /// Offset of the offending record's frame.
    pub offset: u64,
    /// Offset just past the frame, when it could be determined.
    /// `None` means the stream is desynced and skipping jumps to EOF.
    pub resume_offset: Option<u64>,
    pub seq: Option<u64>,
    pub note_id: Option<NoteId>,
    pub reason: String,
    pub first_seen_ms: u64,
    pub retry_count: u32,
}

pub struct NoteCache {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl NoteCache {
    /// Read the sd id out of a cache directory without keeping it
    /// open. Used to find the cache that belongs to an adopted
    /// identity, whose directory still carries the pre-adoption name.
    pub fn peek_sd_id(dir: &Path) -> CacheResult<Option<SdId>> {
        let path = dir.join("cache.sqlite");
        if !path.exists() {
            return Ok(None);
        }
        let conn = Connection::open_with_flags(
            &path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?;
        let raw = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'sd_id'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        raw.map(|raw| SdId::parse_str(&raw).map_err(|e| CacheError::RowDecode(e.to_string())))
            .transpose()
    }

    /// Open (creating if needed) the cache for one storage directory.
    pub fn open(dir: &Path, sd_id: SdId) -> CacheResult<Self> {
        std::fs::create_dir_all(dir).map_err(|source| CacheError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join("cache.sqlite");
        let conn = Connection::open(&path)?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let cache = Self {
            conn: Mutex::new(conn),
            path,
        };
        cache.init_schema(sd_id)?;
        Ok(cache)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_schema(&self, sd_id: SdId) -> CacheResult<()> {
        let conn = self.conn();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS notes (
                note_id TEXT PRIMARY KEY,
                title TEXT,
                folder_id TEXT,
                updated_at_ms INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS watermarks (
                kind TEXT NOT NULL,
                origin TEXT NOT NULL,
                epoch INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                offset INTEGER NOT NULL,
                source_file TEXT NOT NULL,
                PRIMARY KEY (kind, origin)
            );
            CREATE TABLE IF NOT EXISTS tombstones (
                note_id TEXT PRIMARY KEY,
                deleted_at_ms INTEGER NOT NULL,
                deleted_by TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS skipped (
                kind TEXT NOT NULL,
                origin TEXT NOT NULL,
                epoch INTEGER NOT NULL,
                offset INTEGER NOT NULL,
                resume_offset INTEGER,
                seq INTEGER,
                note_id TEXT,
                reason TEXT NOT NULL,
                first_seen_ms INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (kind, origin, epoch, offset)
            );",
        )?;

        match self.meta_get(&conn, "schema_version")? {
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
                    params![SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(raw) => {
                let got: u32 = raw
                    .parse()
                    .map_err(|_| CacheError::RowDecode(format!("schema_version `{raw}`")))?;
                if got != SCHEMA_VERSION {
                    return Err(CacheError::SchemaVersionMismatch {
                        expected: SCHEMA_VERSION,
                        got,
                    });
                }
            }
        }

        if self.meta_get(&conn, "sd_id")?.is_none() {
            conn.execute(
                "INSERT INTO meta (key, value) VALUES ('sd_id', ?1)",
                params![sd_id.to_string()],
            )?;
        }
        Ok(())
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("cache connection poisoned")
    }

    fn meta_get(&self, conn: &Connection, key: &str) -> CacheResult<Option<String>> {
        let value = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn sd_id(&self) -> CacheResult<SdId> {
        let conn = self.conn();
        let raw = self
            .meta_get(&conn, "sd_id")?
            .ok_or(CacheError::MetaMissing { key: "sd_id" })?;
        SdId::parse_str(&raw).map_err(|e| CacheError::RowDecode(e.to_string()))
    }

    /// Re-key after storage-directory identity adoption.
    pub fn set_sd_id(&self, sd_id: SdId) -> CacheResult<()> {
        self.conn().execute(
            "INSERT INTO meta (key, value) VALUES ('sd_id', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![sd_id.to_string()],
        )?;
        Ok(())
    }

    // ---- notes mirror ----

    pub fn upsert_note(&self, row: &NoteRow) -> CacheResult<()> {
        self.conn().execute(
            "INSERT INTO notes (note_id, title, folder_id, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(note_id) DO UPDATE SET
                 title = excluded.title,
                 folder_id = excluded.folder_id,
                 updated_at_ms = excluded.updated_at_ms",
            params![
                row.note_id.to_string(),
                row.title,
                row.folder_id.map(|f| f.to_string()),
                row.updated_at_ms as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get_note(&self, note_id: NoteId) -> CacheResult<Option<NoteRow>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT note_id, title, folder_id, updated_at_ms
                 FROM notes WHERE note_id = ?1",
                params![note_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(id, title, folder, updated)| {
            Ok(NoteRow {
                note_id: NoteId::parse_str(&id)
                    .map_err(|e| CacheError::RowDecode(e.to_string()))?,
                title,
                folder_id: folder
                    .map(|f| FolderId::parse_str(&f))
                    .transpose()
                    .map_err(|e| CacheError::RowDecode(e.to_string()))?,
                updated_at_ms: updated as u64,
            })
        })
        .transpose()
    }

    pub fn delete_note(&self, note_id: NoteId) -> CacheResult<()> {
        self.conn().execute(
            "DELETE FROM notes WHERE note_id = ?1",
            params![note_id.to_string()],
        )?;
        Ok(())
    }

    // ---- watermarks ----

    pub fn load_watermark(
        &self,
        kind: LogKind,
        origin: InstanceId,
    ) -> CacheResult<Option<WatermarkRow>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT epoch, seq, offset, source_file
                 FROM watermarks WHERE kind = ?1 AND origin = ?2",
                params![kind.as_str(), origin.to_string()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(|(epoch, seq, offset, source_file)| WatermarkRow {
            kind,
            origin,
            watermark: Watermark::new(epoch as u64, seq as u64, offset as u64),
            source_file,
        }))
    }

    pub fn store_watermark(
        &self,
        kind: LogKind,
        origin: InstanceId,
        watermark: Watermark,
        source_file: &str,
    ) -> CacheResult<()> {
        self.conn().execute(
            "INSERT INTO watermarks (kind, origin, epoch, seq, offset, source_file)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(kind, origin) DO UPDATE SET
                 epoch = excluded.epoch,
                 seq = excluded.seq,
                 offset = excluded.offset,
                 source_file = excluded.source_file",
            params![
                kind.as_str(),
                origin.to_string(),
                watermark.epoch() as i64,
                watermark.seq() as i64,
                watermark.offset() as i64,
                source_file,
            ],
        )?;
        Ok(())
    }

    pub fn delete_watermark(&self, kind: LogKind, origin: InstanceId) -> CacheResult<()> {
        self.conn().execute(
            "DELETE FROM watermarks WHERE kind = ?1 AND origin = ?2",
            params![kind.as_str(), origin.to_string()],
        )?;
        Ok(())
    }

    pub fn load_watermarks(&self) -> CacheResult<Vec<WatermarkRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT kind, origin, epoch, seq, offset, source_file
             FROM watermarks ORDER BY kind, origin",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (kind, origin, epoch, seq, offset, source_file) = row?;
            let kind = LogKind::parse(&kind)
                .ok_or_else(|| CacheError::RowDecode(format!("log kind `{kind}`")))?;
            let origin = InstanceId::parse_str(&origin)
                .map_err(|e| CacheError::RowDecode(e.to_string()))?;
            out.push(WatermarkRow {
                kind,
                origin,
                watermark: Watermark::new(epoch as u64, seq as u64, offset as u64),
                source_file,
            });
        }
        Ok(out)
    }

    // ---- tombstones ----

    /// Insert a tombstone, keeping the earliest deletion time on
    /// conflict.
    pub fn insert_tombstone(&self, tombstone: &Tombstone) -> CacheResult<()> {
        self.conn().execute(
            "INSERT INTO tombstones (note_id, deleted_at_ms, deleted_by)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(note_id) DO UPDATE SET
                 deleted_at_ms = excluded.deleted_at_ms,
                 deleted_by = excluded.deleted_by
             WHERE excluded.deleted_at_ms < tombstones.deleted_at_ms",
            params![
                tombstone.note_id.to_string(),
                tombstone.deleted_at_ms as i64,
                tombstone.deleted_by.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn is_tombstoned(&self, note_id: NoteId) -> CacheResult<bool> {
        let conn = self.conn();
        let found = conn
            .query_row(
                "SELECT 1 FROM tombstones WHERE note_id = ?1",
                params![note_id.to_string()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn load_tombstones(&self) -> CacheResult<Vec<Tombstone>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT note_id, deleted_at_ms, deleted_by FROM tombstones ORDER BY note_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (note_id, deleted_at_ms, deleted_by) = row?;
            out.push(Tombstone::new(
                NoteId::parse_str(&note_id).map_err(|e| CacheError::RowDecode(e.to_string()))?,
                deleted_at_ms as u64,
                InstanceId::parse_str(&deleted_by)
                    .map_err(|e| CacheError::RowDecode(e.to_string()))?,
            ));
        }
        Ok(out)
    }

    // ---- skipped entries ----

    /// Record a skip, bumping the retry count if it is already known.
    pub fn upsert_skipped(&self, entry: &SkippedEntry) -> CacheResult<()> {
        self.conn().execute(
            "INSERT INTO skipped
                 (kind, origin, epoch, offset, resume_offset, seq, note_id,
                  reason, first_seen_ms, retry_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)
             ON CONFLICT(kind, origin, epoch, offset) DO UPDATE SET
                 retry_count = skipped.retry_count + 1",
            params![
                entry.kind.as_str(),
                entry.origin.to_string(),
                entry.epoch as i64,
                entry.offset as i64,
                entry.resume_offset.map(|v| v as i64),
                entry.seq.map(|v| v as i64),
                entry.note_id.map(|n| n.to_string()),
                entry.reason,
                entry.first_seen_ms as i64,
            ],
        )?;
        Ok(())
    }

    pub fn find_skipped(
        &self,
        kind: LogKind,
        origin: InstanceId,
        epoch: u64,
        offset: u64,
    ) -> CacheResult<Option<SkippedEntry>> {
        Ok(self
            .list_skipped()?
            .into_iter()
            .find(|e| {
                e.kind == kind && e.origin == origin && e.epoch == epoch && e.offset == offset
            }))
    }

    pub fn list_skipped(&self) -> CacheResult<Vec<SkippedEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT kind, origin, epoch, offset, resume_offset, seq, note_id,
                    reason, first_seen_ms, retry_count
             FROM skipped ORDER BY first_seen_ms",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, Option<i64>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, i64>(8)?,
                row.get::<_, i64>(9)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (kind, origin, epoch, offset, resume, seq, note_id, reason, first_seen, retries) =
                row?;
            let kind = LogKind::parse(&kind)
                .ok_or_else(|| CacheError::RowDecode(format!("log kind `{kind}`")))?;
            let origin = InstanceId::parse_str(&origin)
                .map_err(|e| CacheError::RowDecode(e.to_string()))?;
            let note_id = note_id
                .map(|n| NoteId::parse_str(&n))
                .transpose()
                .map_err(|e| CacheError::RowDecode(e.to_string()))?;
            out.push(SkippedEntry {
                kind,
                origin,
                epoch: epoch as u64,
                offset: offset as u64,
                resume_offset: resume.map(|v| v as u64),
                seq: seq.map(|v| v as u64),
                note_id,
                reason,
                first_seen_ms: first_seen as u64,
                retry_count: retries as u32,
            });
        }
        Ok(out)
    }

    pub fn delete_skipped(
        &self,
        kind: LogKind,
        origin: InstanceId,
        epoch: u64,
        offset: u64,
    ) -> CacheResult<()> {
        self.conn().execute(
            "DELETE FROM skipped
             WHERE kind = ?1 AND origin = ?2 AND epoch = ?3 AND offset = ?4",
            params![
                kind.as_str(),
                origin.to_string(),
                epoch as i64,
                offset as i64
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_cache(temp: &TempDir) -> NoteCache {
        NoteCache::open(temp.path(), SdId::generate()).unwrap()
    }

    #[test]
    fn note_mirror_roundtrip() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(&temp);
        let row = NoteRow {
            note_id: NoteId::generate(),
            title: Some("groceries".to_string()),
            folder_id: Some(FolderId::generate()),
            updated_at_ms: 42,
        };
        cache.upsert_note(&row).unwrap();
        assert_eq!(cache.get_note(row.note_id).unwrap().unwrap(), row);

        cache.delete_note(row.note_id).unwrap();
        assert!(cache.get_note(row.note_id).unwrap().is_none());
    }

    #[test]
    fn watermark_upsert_and_load() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(&temp);
        let origin = InstanceId::generate();

        assert!(
            cache
                .load_watermark(LogKind::Activity, origin)
                .unwrap()
                .is_none()
        );

        let wm = Watermark::new(1, 9, 512);
        cache
            .store_watermark(LogKind::Activity, origin, wm, "a.log")
            .unwrap();
        let row = cache
            .load_watermark(LogKind::Activity, origin)
            .unwrap()
            .unwrap();
        assert_eq!(row.watermark, wm);
        assert_eq!(row.source_file, "a.log");

        // Deletion cursor is independent.
        assert!(
            cache
                .load_watermark(LogKind::Deletion, origin)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn tombstone_keeps_earliest_deletion() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(&temp);
        let note = NoteId::generate();
        let by = InstanceId::generate();

        cache
            .insert_tombstone(&Tombstone::new(note, 200, by))
            .unwrap();
        cache
            .insert_tombstone(&Tombstone::new(note, 100, by))
            .unwrap();
        cache
            .insert_tombstone(&Tombstone::new(note, 300, by))
            .unwrap();

        let stones = cache.load_tombstones().unwrap();
        assert_eq!(stones.len(), 1);
        assert_eq!(stones[0].deleted_at_ms, 100);
        assert!(cache.is_tombstoned(note).unwrap());
    }

    #[test]
    fn skipped_conflict_bumps_retry_count() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(&temp);
        let entry = SkippedEntry {
            kind: LogKind::Activity,
            origin: InstanceId::generate(),
            epoch: 0,
            offset: 77,
            resume_offset: Some(120),
            seq: Some(3),
            note_id: Some(NoteId::generate()),
            reason: "document not yet available".to_string(),
            first_seen_ms: 1,
            retry_count: 0,
        };
        cache.upsert_skipped(&entry).unwrap();
        cache.upsert_skipped(&entry).unwrap();
        cache.upsert_skipped(&entry).unwrap();

        let listed = cache.list_skipped().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].retry_count, 2);

        cache
            .delete_skipped(entry.kind, entry.origin, entry.epoch, entry.offset)
            .unwrap();
        assert!(cache.list_skipped().unwrap().is_empty());
    }

    #[test]
    fn sd_id_persists_and_rekeys() {
        let temp = TempDir::new().unwrap();
        let original = SdId::generate();
        let cache = NoteCache::open(temp.path(), original).unwrap();
        assert_eq!(cache.sd_id().unwrap(), original);

        let adopted = SdId::generate();
        cache.set_sd_id(adopted).unwrap();
        assert_eq!(cache.sd_id().unwrap(), adopted);

        // Reopen keeps the adopted id even with a different hint.
        drop(cache);
        let reopened = NoteCache::open(temp.path(), SdId::generate()).unwrap();
        assert_eq!(reopened.sd_id().unwrap(), adopted);
    }
}
