//! This instance's own activity log.
//!
//! Append-only, flushed durably on every record: a local edit is not
//! durable until its update bytes are. The growing file length is
//! itself the signal peers' watchers react to.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{info, warn};

use crate::core::{InstanceId, Limits, NoteId, SdId};
use crate::paths;

use super::frame::FrameReader;
use super::header::LogHeader;
use super::record::ActivityRecord;
use super::{LogError, LogResult, encode_frame};

#[derive(Debug)]
pub struct ActivityLogger {
    path: PathBuf,
    file: File,
    sd_id: SdId,
    instance_id: InstanceId,
    epoch: u64,
    next_seq: u64,
    len: u64,
    max_record_bytes: usize,
}

impl ActivityLogger {
    /// Open or create `activity/<instanceId>.log`, recovering the next
    /// sequence number from the existing tail. A torn trailing frame
    /// (crash mid-append) is truncated away; corruption anywhere else
    /// in our own file fails the open.
    pub fn open(
        sd_root: &Path,
        sd_id: SdId,
        instance_id: InstanceId,
        limits: &Limits,
        now_ms: u64,
    ) -> LogResult<Self> {
        let dir = paths::activity_dir(sd_root);
        fs::create_dir_all(&dir).map_err(|source| LogError::io(&dir, source))?;
        let path = paths::activity_log_path(sd_root, instance_id);

        let scan = scan_own_log(&path, sd_id, instance_id, limits.max_record_bytes, now_ms)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| LogError::io(&path, source))?;

        if scan.durable_len < scan.file_len {
            warn!(
                path = %path.display(),
                from = scan.durable_len,
                to = scan.file_len,
                "truncating torn tail of own activity log"
            );
            file.set_len(scan.durable_len)
                .map_err(|source| LogError::io(&path, source))?;
        }
        file.seek(SeekFrom::Start(scan.durable_len))
            .map_err(|source| LogError::io(&path, source))?;

        Ok(Self {
            path,
            file,
            sd_id,
            instance_id,
            epoch: scan.epoch,
            next_seq: scan.last_seq + 1,
            len: scan.durable_len,
            max_record_bytes: limits.max_record_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len <= LogHeader::encoded_len()
    }

    /// Append one CRDT update and flush it to disk before returning.
    /// Returns the assigned sequence number.
    pub fn record_update(
        &mut self,
        note_id: NoteId,
        payload: Bytes,
        now_ms: u64,
    ) -> LogResult<u64> {
        self.append(note_id, payload, false, now_ms)
    }

    fn append(
        &mut self,
        note_id: NoteId,
        payload: Bytes,
        snapshot: bool,
        now_ms: u64,
    ) -> LogResult<u64> {
        let seq = self.next_seq;
        let record = ActivityRecord {
            writer: self.instance_id,
            seq,
            timestamp_ms: now_ms,
            note_id,
            snapshot,
            payload,
        };
        let body = record.encode_body()?;
        let frame = encode_frame(&body, self.max_record_bytes)?;

        self.file
            .write_all(&frame)
            .map_err(|source| LogError::io(&self.path, source))?;
        self.file
            .sync_data()
            .map_err(|source| LogError::io(&self.path, source))?;

        self.len += frame.len() as u64;
        self.next_seq += 1;
        Ok(seq)
    }

    /// Whether the file has outgrown the compaction threshold.
    pub fn needs_compaction(&self, limits: &Limits) -> bool {
        self.len > limits.activity_compact_threshold_bytes
    }

    /// Distinct notes referenced by records currently in the log.
    pub fn notes_in_log(&self) -> LogResult<BTreeSet<NoteId>> {
        let mut file = File::open(&self.path).map_err(|source| LogError::io(&self.path, source))?;
        LogHeader::read_from(&mut file, &self.path)?;

        let mut notes = BTreeSet::new();
        let mut reader = FrameReader::new(&mut file, self.max_record_bytes);
        while let Some(body) = reader.read_next()? {
            let record = ActivityRecord::decode_body(&body)?;
            notes.insert(record.note_id);
        }
        Ok(notes)
    }

    /// Fold the log into per-note snapshot records under a new epoch.
    ///
    /// Writes a replacement file beside the log and renames it into
    /// place, so a crash mid-compaction leaves the old log intact.
    /// Sequence numbers continue past the old tail; peers detect the
    /// epoch change and re-anchor their byte offsets. Only ever
    /// touches this instance's own file.
    pub fn compact(
        &mut self,
        snapshots: Vec<(NoteId, Bytes)>,
        now_ms: u64,
    ) -> LogResult<u64> {
        let new_epoch = self.epoch + 1;
        let tmp_path = self.path.with_extension("log.tmp");

        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|source| LogError::io(&tmp_path, source))?;

        let header = LogHeader::new(self.sd_id, self.instance_id, new_epoch, now_ms);
        tmp.write_all(&header.encode())
            .map_err(|source| LogError::io(&tmp_path, source))?;

        let mut len = LogHeader::encoded_len();
        let mut next_seq = self.next_seq;
        for (note_id, state) in snapshots {
            let record = ActivityRecord {
                writer: self.instance_id,
                seq: next_seq,
                timestamp_ms: now_ms,
                note_id,
                snapshot: true,
                payload: state,
            };
            let body = record.encode_body()?;
            let frame = encode_frame(&body, self.max_record_bytes)?;
            tmp.write_all(&frame)
                .map_err(|source| LogError::io(&tmp_path, source))?;
            len += frame.len() as u64;
            next_seq += 1;
        }
        tmp.sync_all()
            .map_err(|source| LogError::io(&tmp_path, source))?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path).map_err(|source| LogError::io(&self.path, source))?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|source| LogError::io(&self.path, source))?;
        file.seek(SeekFrom::End(0))
            .map_err(|source| LogError::io(&self.path, source))?;

        info!(
            path = %self.path.display(),
            epoch = new_epoch,
            bytes = len,
            "activity log compacted"
        );

        self.file = file;
        self.epoch = new_epoch;
        self.next_seq = next_seq;
        self.len = len;
        Ok(new_epoch)
    }
}

struct OwnLogScan {
    epoch: u64,
    last_seq: u64,
    durable_len: u64,
    file_len: u64,
}

/// Validate our own log and find the last durable record, creating the
/// file (header only) if it does not exist.
fn scan_own_log(
    path: &Path,
    sd_id: SdId,
    instance_id: InstanceId,
    max_record_bytes: usize,
    now_ms: u64,
) -> LogResult<OwnLogScan> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            let header = LogHeader::new(sd_id, instance_id, 0, now_ms);
            file.write_all(&header.encode())
                .map_err(|source| LogError::io(path, source))?;
            file.sync_all()
                .map_err(|source| LogError::io(path, source))?;
            let len = LogHeader::encoded_len();
            return Ok(OwnLogScan {
                epoch: 0,
                last_seq: 0,
                durable_len: len,
                file_len: len,
            });
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
    if header.sd_id != sd_id {
        // Advisory only: identity adoption changes the directory's id
        // after files were written, so provenance cannot be strict.
        warn!(
            path = %path.display(),
            header_sd = %header.sd_id,
            current_sd = %sd_id,
            "log header carries a different storage directory id"
        );
    }
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
                let record = ActivityRecord::decode_body(&body)?;
                if record.writer != instance_id {
                    return Err(LogError::WriterMismatch {
                        path: path.to_path_buf(),
                        expected: instance_id,
                        got: record.writer,
                    });
                }
                last_seq = record.seq;
            }
            Ok(None) => break,
            Err(err) => {
                // Our own file: anything but a clean torn tail means
                // the log is damaged and replay trust is gone.
                return Err(LogError::OwnLogCorrupt {
                    path: path.to_path_buf(),
                    offset: LogHeader::encoded_len() + reader.consumed(),
                    reason: err.to_string(),
                });
            }
        }
    }

    Ok(OwnLogScan {
        epoch: header.epoch,
        last_seq,
        durable_len: LogHeader::encoded_len() + reader.consumed(),
        file_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_logger(root: &Path, sd_id: SdId, instance: InstanceId) -> ActivityLogger {
        ActivityLogger::open(root, sd_id, instance, &Limits::default(), 1_000).unwrap()
    }

    #[test]
    fn open_assigns_sequences_across_restarts() {
        let temp = TempDir::new().unwrap();
        let sd_id = SdId::generate();
        let instance = InstanceId::generate();
        let note = NoteId::generate();

        let mut logger = open_logger(temp.path(), sd_id, instance);
        assert_eq!(logger.record_update(note, Bytes::from_static(b"a"), 1).unwrap(), 1);
        assert_eq!(logger.record_update(note, Bytes::from_static(b"b"), 2).unwrap(), 2);
        drop(logger);

        let mut logger = open_logger(temp.path(), sd_id, instance);
        assert_eq!(logger.next_seq(), 3);
        assert_eq!(logger.record_update(note, Bytes::from_static(b"c"), 3).unwrap(), 3);
    }

    #[test]
    fn open_truncates_torn_tail() {
        let temp = TempDir::new().unwrap();
        let sd_id = SdId::generate();
        let instance = InstanceId::generate();
        let note = NoteId::generate();

        let mut logger = open_logger(temp.path(), sd_id, instance);
        logger.record_update(note, Bytes::from_static(b"a"), 1).unwrap();
        let durable_len = logger.len();
        let path = logger.path().to_path_buf();
        drop(logger);

        // Simulate a crash mid-append.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0x31, 0x52, 0x4C, 0x46, 9, 0]).unwrap();
        drop(file);

        let logger = open_logger(temp.path(), sd_id, instance);
        assert_eq!(logger.len(), durable_len);
        assert_eq!(logger.next_seq(), 2);
    }

    #[test]
    fn open_rejects_foreign_writer() {
        let temp = TempDir::new().unwrap();
        let sd_id = SdId::generate();
        let instance = InstanceId::generate();

        let logger = open_logger(temp.path(), sd_id, instance);
        drop(logger);

        // A file named for us but written by another instance means
        // the tree was tampered with; refuse to append to it.
        let other = InstanceId::generate();
        let own_path = paths::activity_log_path(temp.path(), instance);
        let other_path = paths::activity_log_path(temp.path(), other);
        fs::copy(&own_path, &other_path).unwrap();
        let err = ActivityLogger::open(temp.path(), sd_id, other, &Limits::default(), 3_000)
            .unwrap_err();
        assert!(matches!(err, LogError::WriterMismatch { .. }));
    }

    #[test]
    fn compact_bumps_epoch_and_continues_sequences() {
        let temp = TempDir::new().unwrap();
        let sd_id = SdId::generate();
        let instance = InstanceId::generate();
        let note = NoteId::generate();

        let mut logger = open_logger(temp.path(), sd_id, instance);
        logger.record_update(note, Bytes::from_static(b"a"), 1).unwrap();
        logger.record_update(note, Bytes::from_static(b"ab"), 2).unwrap();

        let epoch = logger
            .compact(vec![(note, Bytes::from_static(b"ab-merged"))], 3)
            .unwrap();
        assert_eq!(epoch, 1);
        assert_eq!(logger.next_seq(), 4);

        // Post-compaction appends land after the snapshot.
        logger.record_update(note, Bytes::from_static(b"c"), 4).unwrap();
        drop(logger);

        let logger = open_logger(temp.path(), sd_id, instance);
        assert_eq!(logger.epoch(), 1);
        assert_eq!(logger.next_seq(), 5);
        assert_eq!(logger.notes_in_log().unwrap().len(), 1);
    }
}
