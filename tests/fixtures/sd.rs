#![allow(dead_code)]

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use folio_sync::cache::NoteCache;
use folio_sync::core::Limits;
use folio_sync::crdt::DocumentRegistry;
use folio_sync::log::{
    ActivityRecord, ActivitySync, DeletionRecord, DeletionSync, LogHeader, encode_frame,
};
use folio_sync::{InstanceId, NoteId, SdId, paths};

/// A storage directory tree plus this instance's cache, both under
/// one temp dir.
pub struct TempSd {
    _temp: TempDir,
    pub root: PathBuf,
    pub sd_id: SdId,
    pub own: InstanceId,
    pub cache: Arc<NoteCache>,
    pub limits: Limits,
}

impl TempSd {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        let temp = TempDir::new().expect("temp dir");
        let root = temp.path().join("sd");
        for dir in [
            paths::activity_dir(&root),
            paths::deleted_dir(&root),
            paths::moves_dir(&root),
            paths::notes_dir(&root),
            paths::media_dir(&root),
            paths::profiles_dir(&root),
        ] {
            fs::create_dir_all(dir).expect("sd layout");
        }

        let sd_id = SdId::generate();
        let cache =
            Arc::new(NoteCache::open(&temp.path().join("cache"), sd_id).expect("cache open"));

        Self {
            _temp: temp,
            root,
            sd_id,
            own: InstanceId::generate(),
            cache,
            limits,
        }
    }

    pub fn activity_sync(&self, registry: &Arc<DocumentRegistry>) -> ActivitySync {
        ActivitySync::new(
            self.root.clone(),
            self.own,
            Arc::clone(&self.cache),
            Arc::clone(registry),
            self.limits.clone(),
        )
    }

    pub fn deletion_sync(&self, registry: &Arc<DocumentRegistry>) -> DeletionSync {
        DeletionSync::new(
            self.root.clone(),
            self.own,
            Arc::clone(&self.cache),
            Arc::clone(registry),
            self.limits.clone(),
        )
    }

    /// A fake peer instance writing into this storage directory, the
    /// way its files would appear after the folder-sync client copied
    /// them in.
    pub fn peer(&self) -> PeerWriter {
        PeerWriter::new(&self.root, self.sd_id)
    }

    /// Create `notes/<id>/logs` and `media/<id>` content for a note.
    pub fn seed_note_files(&self, note_id: NoteId) {
        let logs = paths::note_logs_dir(&self.root, note_id);
        fs::create_dir_all(&logs).expect("note logs dir");
        fs::write(logs.join("0.crdtlog"), b"crdt-bytes").expect("crdt log");
        let media = paths::note_media_dir(&self.root, note_id);
        fs::create_dir_all(&media).expect("media dir");
        fs::write(media.join("sketch.png"), b"png-bytes").expect("media file");
    }
}

/// Writes peer log files byte-for-byte as a real peer would.
pub struct PeerWriter {
    pub instance: InstanceId,
    root: PathBuf,
    sd_id: SdId,
    epoch: u64,
    next_activity_seq: u64,
    next_deletion_seq: u64,
    max_record_bytes: usize,
}

impl PeerWriter {
    pub fn new(root: &Path, sd_id: SdId) -> Self {
        Self {
            instance: InstanceId::generate(),
            root: root.to_path_buf(),
            sd_id,
            epoch: 0,
            next_activity_seq: 1,
            next_deletion_seq: 1,
            max_record_bytes: Limits::default().max_record_bytes,
        }
    }

    pub fn activity_path(&self) -> PathBuf {
        paths::activity_log_path(&self.root, self.instance)
    }

    pub fn deletion_path(&self) -> PathBuf {
        paths::deletion_log_path(&self.root, self.instance)
    }

    pub fn write_profile(&self) {
        let path = paths::profile_path(&self.root, self.instance);
        fs::write(
            path,
            format!(
                "{{\"instance_id\":\"{}\",\"joined_at_ms\":1}}",
                self.instance
            ),
        )
        .expect("profile");
    }

    pub fn remove_profile(&self) {
        let _ = fs::remove_file(paths::profile_path(&self.root, self.instance));
    }

    pub fn append_update(&mut self, note_id: NoteId, payload: &[u8], timestamp_ms: u64) -> u64 {
        self.append_activity(note_id, payload, false, timestamp_ms)
    }

    pub fn append_snapshot(&mut self, note_id: NoteId, payload: &[u8], timestamp_ms: u64) -> u64 {
        self.append_activity(note_id, payload, true, timestamp_ms)
    }

    fn append_activity(
        &mut self,
        note_id: NoteId,
        payload: &[u8],
        snapshot: bool,
        timestamp_ms: u64,
    ) -> u64 {
        let seq = self.next_activity_seq;
        self.next_activity_seq += 1;
        let record = ActivityRecord {
            writer: self.instance,
            seq,
            timestamp_ms,
            note_id,
            snapshot,
            payload: payload.to_vec().into(),
        };
        let body = record.encode_body().expect("encode activity record");
        self.append_frame(&self.activity_path(), &body);
        seq
    }

    pub fn append_deletion(&mut self, note_id: NoteId, timestamp_ms: u64) -> u64 {
        let seq = self.next_deletion_seq;
        self.next_deletion_seq += 1;
        let record = DeletionRecord {
            writer: self.instance,
            seq,
            timestamp_ms,
            note_id,
        };
        let body = record.encode_body().expect("encode deletion record");
        self.append_frame(&self.deletion_path(), &body);
        seq
    }

    /// Raw bytes straight into the activity log (torn tails, garbage).
    pub fn append_raw_activity(&self, bytes: &[u8]) {
        let path = self.activity_path();
        self.ensure_header(&path);
        let mut file = OpenOptions::new().append(true).open(&path).expect("open log");
        file.write_all(bytes).expect("append raw");
    }

    /// A frame whose body fails its checksum.
    pub fn append_corrupt_frame(&mut self, payload_len: usize) {
        let record = ActivityRecord {
            writer: self.instance,
            seq: self.next_activity_seq,
            timestamp_ms: 0,
            note_id: NoteId::generate(),
            snapshot: false,
            payload: vec![0xAB; payload_len].into(),
        };
        self.next_activity_seq += 1;
        let body = record.encode_body().expect("encode");
        let mut frame = encode_frame(&body, self.max_record_bytes).expect("frame");
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        self.append_raw_activity(&frame);
    }

    /// Simulate this peer compacting: replace the activity log with a
    /// new-epoch header plus snapshot records, sequences continuing.
    pub fn compact_activity(&mut self, snapshots: &[(NoteId, &[u8])], timestamp_ms: u64) {
        self.epoch += 1;
        let path = self.activity_path();
        let header = LogHeader::new(self.sd_id, self.instance, self.epoch, timestamp_ms);
        let mut bytes = header.encode();
        for (note_id, payload) in snapshots {
            let seq = self.next_activity_seq;
            self.next_activity_seq += 1;
            let record = ActivityRecord {
                writer: self.instance,
                seq,
                timestamp_ms,
                note_id: *note_id,
                snapshot: true,
                payload: payload.to_vec().into(),
            };
            let body = record.encode_body().expect("encode snapshot");
            bytes.extend_from_slice(&encode_frame(&body, self.max_record_bytes).expect("frame"));
        }
        fs::write(&path, bytes).expect("rewrite compacted log");
    }

    fn append_frame(&self, path: &Path, body: &[u8]) {
        self.ensure_header(path);
        let frame = encode_frame(body, self.max_record_bytes).expect("frame");
        let mut file = OpenOptions::new().append(true).open(path).expect("open log");
        file.write_all(&frame).expect("append frame");
    }

    fn ensure_header(&self, path: &Path) {
        if path.exists() {
            return;
        }
        let header = LogHeader::new(self.sd_id, self.instance, self.epoch, 1);
        fs::write(path, header.encode()).expect("write log header");
    }
}
