//! Cross-instance activity replay.
//!
//! Tails every peer's activity log from the persisted watermark,
//! applies each record's bytes to the note's document, and advances
//! the watermark only after a successful apply. A crash between apply
//! and advance re-applies the same bytes on the next pass, which the
//! document merge absorbs (idempotent replay).
//!
//! Nothing here may drop an unapplied update silently: every failure
//! path either leaves the cursor where it was (retried next pass) or
//! persists a skipped entry for the operator.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::{NoteCache, SkippedEntry, WatermarkRow};
use crate::core::{InstanceId, Limits, LogKind, NoteId, Watermark};
use crate::crdt::DocumentRegistry;
use crate::paths;

use super::frame::{FRAME_HEADER_LEN, FrameReader};
use super::header::LogHeader;
use super::record::ActivityRecord;
use super::{LogError, LogResult};

pub struct ActivitySync {
    sd_root: PathBuf,
    own_instance: InstanceId,
    cache: Arc<NoteCache>,
    registry: Arc<DocumentRegistry>,
    limits: Limits,
}

/// What to do after a record could not be applied.
enum SkipOutcome {
    /// Leave the cursor; this peer's replay halts until the entry
    /// resolves, is expired, or is explicitly skipped.
    Halt,
    /// The entry outlived its retention and was stepped over; replay
    /// may continue from the new cursor.
    Expired(Watermark),
}

impl ActivitySync {
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

    /// Replay new records from every peer activity log, returning the
    /// set of notes that received at least one update.
    ///
    /// Transient per-file failures are logged and retried on the next
    /// pass; they never abort the pass or starve other peers.
    pub fn sync_from_other_instances(&self, now_ms: u64) -> LogResult<BTreeSet<NoteId>> {
        let mut affected = BTreeSet::new();
        let dir = paths::activity_dir(&self.sd_root);
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
                // Transient (file mid-copy, locked): next watch event
                // or poll retries from the same watermark.
                warn!(
                    %origin,
                    path = %path.display(),
                    error = %err,
                    "peer activity replay interrupted; will retry"
                );
            }
        }
        Ok(affected)
    }

    fn replay_peer(
        &self,
        origin: InstanceId,
        path: &Path,
        now_ms: u64,
        affected: &mut BTreeSet<NoteId>,
    ) -> LogResult<()> {
        let source_file = file_name(path);
        let mut wm = self.stored_watermark(origin);

        let mut file = File::open(path).map_err(|source| LogError::io(path, source))?;
        let file_len = file
            .metadata()
            .map_err(|source| LogError::io(path, source))?
            .len();

        let header = match LogHeader::read_from(&mut file, path) {
            Ok(header) => header,
            Err(err) => {
                // Possibly a peer file still being copied in by the
                // sync client; retried on the next pass either way.
                debug!(path = %path.display(), error = %err, "peer log header unreadable");
                return Ok(());
            }
        };
        if header.writer != origin {
            warn!(
                path = %path.display(),
                header_writer = %header.writer,
                "peer log header writer does not match file name; ignoring file"
            );
            return Ok(());
        }

        let header_len = LogHeader::encoded_len();
        if header.epoch != wm.epoch() {
            if header.epoch > wm.epoch() {
                // The writer compacted. Offsets are void; sequences
                // are not, so the rescan skips what we already have.
                info!(%origin, old_epoch = wm.epoch(), new_epoch = header.epoch,
                      "peer log epoch changed; re-anchoring");
                wm.rebase(header.epoch, header_len)?;
            } else {
                warn!(%origin, stored_epoch = wm.epoch(), file_epoch = header.epoch,
                      "peer log epoch regressed; treating log as unseen");
                wm = Watermark::new(header.epoch, wm.seq(), header_len);
            }
        }

        let mut start = wm.offset().max(header_len);
        if start > file_len {
            // Cursor beyond the file: the log shrank without an epoch
            // bump. Degrade to a full rescan; replay is idempotent.
            warn!(%origin, offset = start, file_len,
                  "stored offset beyond peer log; re-reading from header");
            start = header_len;
            wm = Watermark::new(wm.epoch(), wm.seq(), header_len);
        }
        file.seek(SeekFrom::Start(start))
            .map_err(|source| LogError::io(path, source))?;

        let known_skips: Vec<SkippedEntry> = self
            .cache
            .list_skipped()?
            .into_iter()
            .filter(|e| e.kind == LogKind::Activity && e.origin == origin)
            .collect();

        let mut reader = FrameReader::new(&mut file, self.limits.max_record_bytes);
        loop {
            let frame_start = start + reader.consumed();
            let body = match reader.read_next() {
                Ok(Some(body)) => body,
                Ok(None) => break,
                Err(LogError::Io { path: _, source }) => {
                    return Err(LogError::io(path, source));
                }
                Err(err) => {
                    let resume = frame_resume_offset(&err, frame_start, file_len);
                    if resume.is_none() && frame_touches_eof(&err, frame_start, file_len) {
                        // The bad bytes run to EOF: plausibly a write
                        // still landing. Leave the cursor alone.
                        debug!(%origin, offset = frame_start,
                               "undecodable tail frame; waiting for more bytes");
                        return Ok(());
                    }
                    match self.note_skip(
                        origin, header.epoch, frame_start, resume, None, None,
                        &err.to_string(), now_ms, file_len, &source_file,
                    )? {
                        SkipOutcome::Halt => return Ok(()),
                        SkipOutcome::Expired(_) => {
                            // Desynced stream: the persisted cursor
                            // already jumped; re-open from there.
                            return self.replay_peer(origin, path, now_ms, affected);
                        }
                    }
                }
            };
            let frame_end = start + reader.consumed();

            let record = match ActivityRecord::decode_body(&body) {
                Ok(record) => record,
                Err(err) => {
                    match self.note_skip(
                        origin, header.epoch, frame_start, Some(frame_end), None, None,
                        &err.to_string(), now_ms, file_len, &source_file,
                    )? {
                        SkipOutcome::Halt => return Ok(()),
                        SkipOutcome::Expired(new_wm) => {
                            wm = new_wm;
                            continue;
                        }
                    }
                }
            };

            if record.writer != origin {
                match self.note_skip(
                    origin, header.epoch, frame_start, Some(frame_end), Some(record.seq),
                    Some(record.note_id), "record writer does not match log file", now_ms,
                    file_len, &source_file,
                )? {
                    SkipOutcome::Halt => return Ok(()),
                    SkipOutcome::Expired(new_wm) => {
                        wm = new_wm;
                        continue;
                    }
                }
            }

            if record.seq <= wm.seq() {
                // Already applied before the writer compacted.
                continue;
            }

            if self.cache.is_tombstoned(record.note_id)? {
                // Tombstone wins unconditionally; the record is dead,
                // not lost, so the cursor moves past it.
                debug!(%origin, note_id = %record.note_id, seq = record.seq,
                       "dropping update for permanently deleted note");
                wm.advance(record.seq, frame_end)?;
                self.cache
                    .store_watermark(LogKind::Activity, origin, wm, &source_file)?;
                continue;
            }

            match self
                .registry
                .apply_update(&self.sd_root, record.note_id, &record.payload)
            {
                Ok(()) => {
                    wm.advance(record.seq, frame_end)?;
                    self.cache
                        .store_watermark(LogKind::Activity, origin, wm, &source_file)?;
                    if known_skips.iter().any(|e| {
                        e.epoch == header.epoch && e.offset == frame_start
                    }) {
                        self.cache.delete_skipped(
                            LogKind::Activity,
                            origin,
                            header.epoch,
                            frame_start,
                        )?;
                        info!(%origin, seq = record.seq, "skipped entry resolved on retry");
                    }
                    affected.insert(record.note_id);
                }
                Err(err) => {
                    match self.note_skip(
                        origin, header.epoch, frame_start, Some(frame_end),
                        Some(record.seq), Some(record.note_id), &err.to_string(), now_ms,
                        file_len, &source_file,
                    )? {
                        SkipOutcome::Halt => return Ok(()),
                        SkipOutcome::Expired(new_wm) => {
                            wm = new_wm;
                            continue;
                        }
                    }
                }
            }
        }

        // Persist offset-only progress (stale-sequence records walked
        // past after a compaction rescan, or a plain epoch re-anchor).
        let end = start + reader.consumed();
        let stored = self.stored_watermark(origin);
        if stored.epoch() != wm.epoch() || end > stored.offset() {
            let final_wm = Watermark::new(wm.epoch(), wm.seq(), end.max(wm.offset()));
            self.cache
                .store_watermark(LogKind::Activity, origin, final_wm, &source_file)?;
        }
        Ok(())
    }

    fn stored_watermark(&self, origin: InstanceId) -> Watermark {
        match self.cache.load_watermark(LogKind::Activity, origin) {
            Ok(Some(row)) => row.watermark,
            Ok(None) => Watermark::genesis(),
            Err(err) => {
                // Corrupt cursor row: treat the log as never seen and
                // re-read everything; replay is idempotent.
                warn!(%origin, error = %err,
                      "activity watermark unreadable; re-reading peer log from start");
                Watermark::genesis()
            }
        }
    }

    /// Persist (or age) a skipped entry for a record that could not be
    /// applied. The watermark never silently advances past it; on
    /// retention expiry the advanced cursor is persisted here, so a
    /// later failure in the same pass cannot resurrect the entry.
    #[allow(clippy::too_many_arguments)]
    fn note_skip(
        &self,
        origin: InstanceId,
        epoch: u64,
        offset: u64,
        resume_offset: Option<u64>,
        seq: Option<u64>,
        note_id: Option<NoteId>,
        reason: &str,
        now_ms: u64,
        file_len: u64,
        source_file: &str,
    ) -> LogResult<SkipOutcome> {
        if let Some(existing) = self
            .cache
            .find_skipped(LogKind::Activity, origin, epoch, offset)?
            && now_ms.saturating_sub(existing.first_seen_ms)
                > self.limits.skipped_entry_retention_ms
        {
            let resume = existing.resume_offset.or(resume_offset).unwrap_or(file_len);
            let wm = self.stored_watermark(origin);
            let expired = Watermark::new(epoch, existing.seq.unwrap_or(wm.seq()), resume);
            warn!(
                %origin, offset, reason = %existing.reason,
                retries = existing.retry_count,
                "skipped entry exceeded retention; stepping over record"
            );
            self.cache
                .store_watermark(LogKind::Activity, origin, expired, source_file)?;
            self.cache
                .delete_skipped(LogKind::Activity, origin, epoch, offset)?;
            return Ok(SkipOutcome::Expired(expired));
        }

        warn!(%origin, offset, %reason, "record not applied; persisting skipped entry");
        self.cache.upsert_skipped(&SkippedEntry {
            kind: LogKind::Activity,
            origin,
            epoch,
            offset,
            resume_offset,
            seq,
            note_id,
            reason: reason.to_string(),
            first_seen_ms: now_ms,
            retry_count: 0,
        })?;
        Ok(SkipOutcome::Halt)
    }

    /// Persisted skip state, with retention applied.
    pub fn load_skipped_entries(&self, now_ms: u64) -> LogResult<Vec<SkippedEntry>> {
        let mut out = Vec::new();
        for entry in self.cache.list_skipped()? {
            if now_ms.saturating_sub(entry.first_seen_ms) > self.limits.skipped_entry_retention_ms
            {
                // Expiry advances the cursor the same way replay does.
                self.expire_entry(&entry)?;
                continue;
            }
            out.push(entry);
        }
        Ok(out)
    }

    /// Explicit user action: abandon the record and move the cursor
    /// past it.
    pub fn skip_entry(&self, entry: &SkippedEntry) -> LogResult<()> {
        info!(origin = %entry.origin, offset = entry.offset, "explicitly skipping entry");
        self.expire_entry(entry)
    }

    fn expire_entry(&self, entry: &SkippedEntry) -> LogResult<()> {
        let wm = self.stored_watermark(entry.origin);
        let resume = match entry.resume_offset {
            Some(resume) => resume,
            None => {
                // Stream desync: nothing after the bad bytes can be
                // framed again, so the cursor jumps to end of file.
                let path = self.log_path_for(entry);
                fs::metadata(&path)
                    .map(|m| m.len())
                    .map_err(|source| LogError::io(&path, source))?
            }
        };
        let new_wm = Watermark::new(entry.epoch, entry.seq.unwrap_or(wm.seq()), resume);
        let source_file = file_name(&self.log_path_for(entry));
        self.cache
            .store_watermark(entry.kind, entry.origin, new_wm, &source_file)?;
        self.cache
            .delete_skipped(entry.kind, entry.origin, entry.epoch, entry.offset)?;
        Ok(())
    }

    fn log_path_for(&self, entry: &SkippedEntry) -> PathBuf {
        match entry.kind {
            LogKind::Activity => paths::activity_log_path(&self.sd_root, entry.origin),
            LogKind::Deletion => paths::deletion_log_path(&self.sd_root, entry.origin),
        }
    }

    /// Current cursor state for diagnostics.
    pub fn get_watermarks(&self) -> LogResult<Vec<WatermarkRow>> {
        Ok(self.cache.load_watermarks()?)
    }

    /// Drop bookkeeping for logs that no longer exist, and delete peer
    /// log files whose writer has left the storage directory and whose
    /// content is fully replayed locally.
    pub fn cleanup_orphaned_logs(&self) -> LogResult<()> {
        for row in self.cache.load_watermarks()? {
            let path = match row.kind {
                LogKind::Activity => paths::activity_log_path(&self.sd_root, row.origin),
                LogKind::Deletion => paths::deletion_log_path(&self.sd_root, row.origin),
            };
            if !path.exists() {
                info!(origin = %row.origin, kind = row.kind.as_str(),
                      "dropping watermark for vanished log");
                self.cache.delete_watermark(row.kind, row.origin)?;
            }
        }

        for kind in [LogKind::Activity, LogKind::Deletion] {
            let dir = match kind {
                LogKind::Activity => paths::activity_dir(&self.sd_root),
                LogKind::Deletion => paths::deleted_dir(&self.sd_root),
            };
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
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
                if origin == self.own_instance
                    || paths::profile_path(&self.sd_root, origin).exists()
                {
                    continue;
                }
                if let Err(err) = self.remove_if_consumed(kind, origin, &path) {
                    warn!(path = %path.display(), error = %err,
                          "orphaned log cleanup failed; will retry");
                }
            }
        }
        Ok(())
    }

    /// A departed writer's log may only be removed once every byte of
    /// it has been replayed here; freshness alone never justifies it.
    fn remove_if_consumed(
        &self,
        kind: LogKind,
        origin: InstanceId,
        path: &Path,
    ) -> LogResult<()> {
        let Some(row) = self.cache.load_watermark(kind, origin)? else {
            return Ok(());
        };
        let mut file = File::open(path).map_err(|source| LogError::io(path, source))?;
        let file_len = file
            .metadata()
            .map_err(|source| LogError::io(path, source))?
            .len();
        let header = LogHeader::read_from(&mut file, path)?;

        if row.watermark.epoch() == header.epoch && row.watermark.offset() >= file_len {
            info!(%origin, kind = kind.as_str(), path = %path.display(),
                  "removing fully replayed log of departed instance");
            fs::remove_file(path).map_err(|source| LogError::io(path, source))?;
            self.cache.delete_watermark(kind, origin)?;
        }
        Ok(())
    }
}

/// Where replay could resume after this frame error, when the frame's
/// extent is known and lies within the file.
fn frame_resume_offset(err: &LogError, frame_start: u64, file_len: u64) -> Option<u64> {
    match err {
        LogError::FrameCrcMismatch { length, .. } => {
            let resume = frame_start + (FRAME_HEADER_LEN + length) as u64;
            (resume < file_len).then_some(resume)
        }
        _ => None,
    }
}

/// Whether the undecodable bytes extend to end of file (possibly a
/// write still in flight rather than corruption).
fn frame_touches_eof(err: &LogError, frame_start: u64, file_len: u64) -> bool {
    match err {
        LogError::FrameCrcMismatch { length, .. } => {
            frame_start + (FRAME_HEADER_LEN + length) as u64 >= file_len
        }
        _ => false,
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
