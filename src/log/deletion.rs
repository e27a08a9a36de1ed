//! Permanent-deletion log and replay.
//!
//! Permanent deletion removes the CRDT document entirely, so it
//! cannot be expressed as a document update: it gets its own log and
//! its own replay rule — a tombstone wins unconditionally over any
//! activity record for the same note, regardless of timestamps.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::NoteCache;
use crate::core::{InstanceId, Limits, LogKind, NoteId, SdId, Tombstone, Watermark};
use crate::crdt::DocumentRegistry;
use crate::paths;

use super::frame::FrameReader;
use super::header::LogHeader;
use super::record::DeletionRecord;
use super::{LogError, LogResult, encode_frame};

pub struct DeletionLogger {
    path: PathBuf,
    file: File,
    instance_id: InstanceId,
    next_seq: u64,
    max_record_bytes: usize,
}

impl DeletionLogger {
    /// Open or create `deleted/<instanceId>.log`.
    pub fn open(
        sd_root: &Path,
        sd_id: SdId,
        instance_id: InstanceId,
        limits: &Limits,
        now_ms: u64,
    ) -> LogResult<Self> {
        let dir = paths::deleted_dir(sd_root);
        fs::create_dir_all(&dir).map_err(|source| LogError::io(&dir, source))?;
        let path = paths::deletion_log_path(sd_root, instance_id);

        let (next_seq, durable_len, file_len) =
            scan_own_deletions(&path, sd_id, instance_id, limits.max_record_bytes, now_ms)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| LogError::io(&path, source))?;
        if durable_len < file_len {
            warn!(path = %path.display(), from = durable_len, to = file_len,
                  "truncating torn tail of own deletion log");
            file.set_len(durable_len)
                .map_err(|source| LogError::io(&path, source))?;
        }
        file.seek(SeekFrom::Start(durable_len))
            .map_err(|source| LogError::io(&path, source))?;

        Ok(Self {
            path,
            file,
            instance_id,
            next_seq,
            max_record_bytes: limits.max_record_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Append a tombstone for a note already removed locally, flushed
    /// durably before returning.
    pub fn record_deletion(&mut self, note_id: NoteId, now_ms: u64) -> LogResult<u64> {
        let seq = self.next_seq;
        let record = DeletionRecord {
            writer: self.instance_id,
            seq,
            timestamp_ms: now_ms,
            note_id,
        };
        let body = record.encode_body()?;
        let frame = encode_frame(&body, self.max_record_bytes)?;

        self.file
            .write_all(&frame)
            .map_err(|source| LogError::io(&self.path, source))?;
        self.file
            .sync_data()
            .map_err(|source| LogError::io(&self.path, source))?;
        self.next_seq += 1;
        Ok(seq)
    }
}

fn scan_own_deletions(
    path: &Path,
    sd_id: SdId,
    instance_id: InstanceId,
    max_record_bytes: usize,
    now_ms: u64,
) -> LogResult<(u64, u64, u64)> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            let header = LogHeader::new(sd_id, instance_id, 0, now_ms);
            file.write_all(&header.encode())
                .map_err(|source| LogError::io(path, source))?;
            file.sync_all()
                .map_err(|source| LogError::io(path, source))?;
            let len = LogHeader::encoded_len();
            return Ok((1, len, len));
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(source) => return Err(LogError::io(path, source)),
    }

    let mut file = File::open(path).map_err(|source| LogError::io(path, source))?;
    let file_len = file
        .metadata()
        .map_err(|source| LogError::io(path, source))?
        .len();
    let header = LogHeader::read_from(&mut file, path)?;
    if header.writer != instance_id {
        return Err(LogError::WriterMismatch {
            path: path.to_path_buf(),
            expected: instance_id,
            got: header.writer,
        });
    }

    let mut last_seq = 0u64;
    let mut reader = FrameReader::new(&mut file, max_record_bytes);
    loop {
        match reader.read_next() {
            Ok(Some(body)) => {
                last_seq = DeletionRecord::decode_body(&body)?.seq;
            }
            Ok(None) => break,
            Err(err) => {
                return Err(LogError::OwnLogCorrupt {
                    path: path.to_path_buf(),
                    offset: LogHeader::encoded_len() + reader.consumed(),
                    reason: err.to_string(),
                });
            }
        }
    }

    Ok((
        last_seq + 1,
        LogHeader::encoded_len() + reader.consumed(),
        file_len,
    ))
}

pub struct DeletionSync {
    sd_root: PathBuf,
    own_instance: InstanceId,
    cache: Arc<NoteCache>,
    registry: Arc<DocumentRegistry>,
    limits: Limits,
}

impl DeletionSync {
    pub fn new(
        sd_root: PathBuf,
        own_instance: InstanceId,
        cache: Arc<NoteCache>,
        registry: Arc<DocumentRegistry>,
        limits: Limits,
    ) -> Self {
        Self {
            sd_root,
            own_instance,
            cache,
            registry,
            limits,
        }
    }

    /// Replay new tombstones from every peer deletion log. For each:
    /// unload the in-memory document, delete the note's on-disk state,
    /// and mark it permanently gone in the cache. Runs before activity
    /// replay within a pass so a stale update can never outlive the
    /// tombstone that kills it.
    pub fn sync_from_other_instances(&self, now_ms: u64) -> LogResult<BTreeSet<NoteId>> {
        let mut affected = BTreeSet::new();
        let dir = paths::deleted_dir(&self.sd_root);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(affected),
            Err(source) => return Err(LogError::io(&dir, source)),
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(source) => return Err(LogError::io(&dir, source)),
            };
            let path = entry.path();
            let Some(origin) = paths::log_file_writer(&path) else {
                continue;
            };
            if origin == self.own_instance {
                continue;
            }

            if let Err(err) = self.replay_peer(origin, &path, now_ms, &mut affected) {
                warn!(%origin, path = %path.display(), error = %err,
                      "peer deletion replay interrupted; will retry");
            }
        }
        Ok(affected)
    }

    fn replay_peer(
        &self,
        origin: InstanceId,
        path: &Path,
        _now_ms: u64,
        affected: &mut BTreeSet<NoteId>,
    ) -> LogResult<()> {
        let source_file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let mut wm = match self.cache.load_watermark(LogKind::Deletion, origin) {
            Ok(Some(row)) => row.watermark,
            Ok(None) => Watermark::genesis(),
            Err(err) => {
                warn!(%origin, error = %err,
                      "deletion watermark unreadable; re-reading peer log from start");
                Watermark::genesis()
            }
        };

        let mut file = File::open(path).map_err(|source| LogError::io(path, source))?;
        let header = match LogHeader::read_from(&mut file, path) {
            Ok(header) => header,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "peer log header unreadable");
                return Ok(());
            }
        };
        if header.writer != origin {
            warn!(path = %path.display(), header_writer = %header.writer,
                  "peer log header writer does not match file name; ignoring file");
            return Ok(());
        }

        let header_len = LogHeader::encoded_len();
        if header.epoch != wm.epoch() {
            wm = Watermark::new(header.epoch, wm.seq(), header_len);
        }
        let start = wm.offset().max(header_len);
        file.seek(SeekFrom::Start(start))
            .map_err(|source| LogError::io(path, source))?;

        let mut reader = FrameReader::new(&mut file, self.limits.max_record_bytes);
        loop {
            match reader.read_next() {
                Ok(Some(body)) => {
                    let frame_end = start + reader.consumed();
                    let record = DeletionRecord::decode_body(&body)?;
                    if record.seq <= wm.seq() {
                        continue;
                    }

                    self.apply_tombstone(record)?;
                    affected.insert(record.note_id);
                    wm.advance(record.seq, frame_end)?;
                    self.cache
                        .store_watermark(LogKind::Deletion, origin, wm, &source_file)?;
                }
                Ok(None) => break,
                Err(LogError::Io { path: _, source }) => {
                    return Err(LogError::io(path, source));
                }
                Err(err) => {
                    // Undecodable bytes in a tombstone log: leave the
                    // cursor and retry; the next append often heals a
                    // half-copied tail.
                    warn!(%origin, error = %err, "deletion log frame undecodable; halting peer");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Idempotent local effect of one tombstone.
    fn apply_tombstone(&self, record: DeletionRecord) -> LogResult<()> {
        let note_id = record.note_id;
        info!(%note_id, deleted_by = %record.writer, "applying permanent deletion");

        self.registry.unload(note_id);

        let note_dir = paths::note_dir(&self.sd_root, note_id);
        remove_dir_if_present(&note_dir)?;
        let media_dir = paths::note_media_dir(&self.sd_root, note_id);
        remove_dir_if_present(&media_dir)?;

        self.cache.delete_note(note_id)?;
        self.cache.insert_tombstone(&Tombstone::new(
            note_id,
            record.timestamp_ms,
            record.writer,
        ))?;
        Ok(())
    }
}

fn remove_dir_if_present(dir: &Path) -> LogResult<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LogError::io(dir, source)),
    }
}
