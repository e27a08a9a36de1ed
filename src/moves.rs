//! Crash-safe cross-directory note moves.
//!
//! Moving a note between storage directories is not a rename: the two
//! trees may live on different machines' sync roots. The move runs as
//! image-copy, then CRDT-file copy, then commit (source removal),
//! with every completed step appended to the initiator's move log
//! before the next begins. A crash mid-move therefore leaves a
//! discoverable, resumable record instead of a half-copied note with
//! no owner.
//!
//! Move logs are per-instance append-only files like every other
//! engine log; the current state of a move is a fold over all
//! instances' logs. Whether the destination replaces an existing note
//! or keeps both is the caller's decision before `begin_move`.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::core::{FolderId, InstanceId, Limits, MoveId, NoteId, SdId};
use crate::error::Transience;
use crate::log::frame::FrameReader;
use crate::log::header::LogHeader;
use crate::log::record::{read_u16_le, read_u64_le, read_uuid};
use crate::log::{LogError, encode_frame};
use crate::paths;

const MOVE_RECORD_VERSION: u16 = 1;
const MOVE_RECORD_LEN: usize = 2 + 1 + 1 + 16 * 6 + 8 + 8;

pub type MoveResult<T> = Result<T, MoveError>;

#[derive(Debug, Error)]
pub enum MoveError {
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unknown move {move_id}")]
    UnknownMove { move_id: MoveId },
    #[error("move {move_id} already {status:?}")]
    AlreadyTerminal { move_id: MoveId, status: MoveStatus },
}

impl MoveError {
    pub fn transience(&self) -> Transience {
        match self {
            MoveError::Log(e) => e.transience(),
            MoveError::Io { .. } => Transience::Retryable,
            _ => Transience::Permanent,
        }
    }
}

/// Progress/terminal states, in step order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MoveStatus {
    Initiated,
    ImagesCopied,
    CrdtCopied,
    Committed,
    TakenOver,
    Cancelled,
}

impl MoveStatus {
    fn code(self) -> u8 {
        match self {
            MoveStatus::Initiated => 1,
            MoveStatus::ImagesCopied => 2,
            MoveStatus::CrdtCopied => 3,
            MoveStatus::Committed => 4,
            MoveStatus::TakenOver => 5,
            MoveStatus::Cancelled => 6,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(MoveStatus::Initiated),
            2 => Some(MoveStatus::ImagesCopied),
            3 => Some(MoveStatus::CrdtCopied),
            4 => Some(MoveStatus::Committed),
            5 => Some(MoveStatus::TakenOver),
            6 => Some(MoveStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MoveStatus::Committed | MoveStatus::Cancelled)
    }

    /// Copy progress this status attests (take-over markers attest
    /// nothing by themselves).
    fn progress(self) -> Option<u8> {
        match self {
            MoveStatus::Initiated => Some(1),
            MoveStatus::ImagesCopied => Some(2),
            MoveStatus::CrdtCopied => Some(3),
            MoveStatus::Committed => Some(4),
            MoveStatus::TakenOver | MoveStatus::Cancelled => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MoveRecord {
    pub move_id: MoveId,
    pub note_id: NoteId,
    pub source_sd: SdId,
    pub target_sd: SdId,
    pub target_folder: FolderId,
    pub writer: InstanceId,
    pub seq: u64,
    pub timestamp_ms: u64,
    pub status: MoveStatus,
}

impl MoveRecord {
    pub fn encode_body(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MOVE_RECORD_LEN);
        buf.extend_from_slice(&MOVE_RECORD_VERSION.to_le_bytes());
        buf.push(self.status.code());
        buf.push(0);
        buf.extend_from_slice(self.move_id.as_uuid().as_bytes());
        buf.extend_from_slice(self.note_id.as_uuid().as_bytes());
        buf.extend_from_slice(self.source_sd.as_uuid().as_bytes());
        buf.extend_from_slice(self.target_sd.as_uuid().as_bytes());
        buf.extend_from_slice(self.target_folder.as_uuid().as_bytes());
        buf.extend_from_slice(self.writer.as_uuid().as_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        buf
    }

    pub fn decode_body(body: &[u8]) -> Result<Self, LogError> {
        if body.len() != MOVE_RECORD_LEN {
            return Err(LogError::RecordHeaderInvalid {
                reason: format!("move record length {} invalid", body.len()),
            });
        }

        let mut offset = 0usize;
        let version = read_u16_le(body, &mut offset)?;
        if version != MOVE_RECORD_VERSION {
            return Err(LogError::RecordHeaderInvalid {
                reason: format!("unsupported move record version {version}"),
            });
        }
        let status_code = body[offset];
        offset += 2; // status + reserved
        let status = MoveStatus::from_code(status_code).ok_or_else(|| {
            LogError::RecordHeaderInvalid {
                reason: format!("unknown move status {status_code}"),
            }
        })?;

        let move_id = MoveId::new(read_uuid(body, &mut offset)?);
        let note_id = NoteId::new(read_uuid(body, &mut offset)?);
        let source_sd = SdId::new(read_uuid(body, &mut offset)?);
        let target_sd = SdId::new(read_uuid(body, &mut offset)?);
        let target_folder = FolderId::new(read_uuid(body, &mut offset)?);
        let writer = InstanceId::new(read_uuid(body, &mut offset)?);
        let seq = read_u64_le(body, &mut offset)?;
        let timestamp_ms = read_u64_le(body, &mut offset)?;

        Ok(Self {
            move_id,
            note_id,
            source_sd,
            target_sd,
            target_folder,
            writer,
            seq,
            timestamp_ms,
            status,
        })
    }
}

/// Folded view of one move across all instances' logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MoveState {
    pub move_id: MoveId,
    pub note_id: NoteId,
    pub source_sd: SdId,
    pub target_sd: SdId,
    pub target_folder: FolderId,
    pub initiated_by: InstanceId,
    /// Writer of the most recent record.
    pub owner: InstanceId,
    pub status: MoveStatus,
    pub started_at_ms: u64,
    pub last_update_ms: u64,
}

impl MoveState {
    /// A move is stale when nobody has advanced it within the timeout
    /// and it never reached a terminal state.
    pub fn is_stale(&self, now_ms: u64, stale_timeout_ms: u64) -> bool {
        !self.status.is_terminal()
            && now_ms.saturating_sub(self.last_update_ms) > stale_timeout_ms
    }
}

/// This instance's own move log inside one storage directory.
pub struct MoveLogger {
    path: PathBuf,
    file: File,
    instance_id: InstanceId,
    next_seq: u64,
    max_record_bytes: usize,
}

impl MoveLogger {
    pub fn open(
        sd_root: &Path,
        sd_id: SdId,
        instance_id: InstanceId,
        limits: &Limits,
        now_ms: u64,
    ) -> MoveResult<Self> {
        let dir = paths::moves_dir(sd_root);
        fs::create_dir_all(&dir).map_err(|source| MoveError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = paths::move_log_path(sd_root, instance_id);

        let (next_seq, durable_len, file_len) =
            scan_own_moves(&path, sd_id, instance_id, limits.max_record_bytes, now_ms)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| MoveError::Io {
                path: path.clone(),
                source,
            })?;
        if durable_len < file_len {
            warn!(path = %path.display(), "truncating torn tail of own move log");
            file.set_len(durable_len).map_err(|source| MoveError::Io {
                path: path.clone(),
                source,
            })?;
        }
        file.seek(SeekFrom::Start(durable_len))
            .map_err(|source| MoveError::Io {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            file,
            instance_id,
            next_seq,
            max_record_bytes: limits.max_record_bytes,
        })
    }

    fn append(&mut self, mut record: MoveRecord) -> MoveResult<u64> {
        record.writer = self.instance_id;
        record.seq = self.next_seq;
        let body = record.encode_body();
        let frame = encode_frame(&body, self.max_record_bytes)?;

        self.file.write_all(&frame).map_err(|source| MoveError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.file.sync_data().map_err(|source| MoveError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.next_seq += 1;
        Ok(record.seq)
    }
}

fn scan_own_moves(
    path: &Path,
    sd_id: SdId,
    instance_id: InstanceId,
    max_record_bytes: usize,
    now_ms: u64,
) -> MoveResult<(u64, u64, u64)> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            let header = LogHeader::new(sd_id, instance_id, 0, now_ms);
            file.write_all(&header.encode())
                .map_err(|source| MoveError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            file.sync_all().map_err(|source| MoveError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let len = LogHeader::encoded_len();
            return Ok((1, len, len));
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
        Err(source) => {
            return Err(MoveError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    }

    let mut file = File::open(path).map_err(|source| MoveError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file_len = file
        .metadata()
        .map_err(|source| MoveError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .len();
    LogHeader::read_from(&mut file, path)?;

    let mut last_seq = 0u64;
    let mut reader = FrameReader::new(&mut file, max_record_bytes);
    loop {
        match reader.read_next() {
            Ok(Some(body)) => last_seq = MoveRecord::decode_body(&body)?.seq,
            Ok(None) => break,
            Err(err) => {
                return Err(LogError::OwnLogCorrupt {
                    path: path.to_path_buf(),
                    offset: LogHeader::encoded_len() + reader.consumed(),
                    reason: err.to_string(),
                }
                .into());
            }
        }
    }

    Ok((
        last_seq + 1,
        LogHeader::encoded_len() + reader.consumed(),
        file_len,
    ))
}

/// Fold every instance's move log in a storage directory into the
/// current per-move state. Undecodable files are warned about and
/// skipped, never fatal.
pub fn scan_moves(sd_root: &Path, limits: &Limits) -> MoveResult<BTreeMap<MoveId, MoveState>> {
    let mut records: Vec<MoveRecord> = Vec::new();
    let dir = paths::moves_dir(sd_root);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(source) => return Err(MoveError::Io { path: dir, source }),
    };

    for entry in entries {
        let entry = entry.map_err(|source| MoveError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = entry.path();
        if paths::log_file_writer(&path).is_none() {
            continue;
        }
        if let Err(err) = read_move_log(&path, limits.max_record_bytes, &mut records) {
            warn!(path = %path.display(), error = %err, "move log unreadable; skipping");
        }
    }

    let mut moves: BTreeMap<MoveId, MoveState> = BTreeMap::new();
    records.sort_by_key(|r| (r.timestamp_ms, r.writer, r.seq));
    for record in records {
        let state = moves.entry(record.move_id).or_insert(MoveState {
            move_id: record.move_id,
            note_id: record.note_id,
            source_sd: record.source_sd,
            target_sd: record.target_sd,
            target_folder: record.target_folder,
            initiated_by: record.writer,
            owner: record.writer,
            // A lone take-over marker (its peer's earlier records not
            // yet synced in) attests no copy progress at all.
            status: if record.status == MoveStatus::TakenOver {
                MoveStatus::Initiated
            } else {
                record.status
            },
            started_at_ms: record.timestamp_ms,
            last_update_ms: record.timestamp_ms,
        });

        state.owner = record.writer;
        state.last_update_ms = record.timestamp_ms;
        if state.status.is_terminal() {
            continue;
        }
        match record.status {
            MoveStatus::Committed | MoveStatus::Cancelled => state.status = record.status,
            MoveStatus::TakenOver => {}
            status => {
                // Progress only moves forward; a late-arriving older
                // step from a slow log never rewinds it.
                if status.progress() > state.status.progress() {
                    state.status = status;
                }
            }
        }
    }
    Ok(moves)
}

fn read_move_log(
    path: &Path,
    max_record_bytes: usize,
    records: &mut Vec<MoveRecord>,
) -> MoveResult<()> {
    let mut file = File::open(path).map_err(|source| MoveError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    LogHeader::read_from(&mut file, path)?;
    let mut reader = FrameReader::new(&mut file, max_record_bytes);
    while let Some(body) = reader.read_next()? {
        records.push(MoveRecord::decode_body(&body)?);
    }
    Ok(())
}

/// Runs the move protocol for one instance.
pub struct MoveManager {
    instance_id: InstanceId,
    limits: Limits,
}

/// The two trees a move spans.
pub struct MoveEnds<'a> {
    pub source_root: &'a Path,
    pub source_sd: SdId,
    pub target_root: &'a Path,
    pub target_sd: SdId,
}

impl MoveManager {
    pub fn new(instance_id: InstanceId, limits: Limits) -> Self {
        Self {
            instance_id,
            limits,
        }
    }

    /// Run a move end to end, recording each step before starting the
    /// next.
    pub fn begin_move(
        &self,
        ends: &MoveEnds<'_>,
        note_id: NoteId,
        target_folder: FolderId,
        now_ms: u64,
    ) -> MoveResult<MoveId> {
        let move_id = MoveId::generate();
        let mut logger = self.open_logger(ends, now_ms)?;
        let template = MoveRecord {
            move_id,
            note_id,
            source_sd: ends.source_sd,
            target_sd: ends.target_sd,
            target_folder,
            writer: self.instance_id,
            seq: 0,
            timestamp_ms: now_ms,
            status: MoveStatus::Initiated,
        };

        info!(%move_id, %note_id, target_sd = %ends.target_sd, "move initiated");
        logger.append(template)?;
        self.run_steps(&mut logger, ends, template, MoveStatus::Initiated, now_ms)?;
        Ok(move_id)
    }

    /// Moves nobody is advancing, discoverable by any instance.
    pub fn get_stale_moves(&self, sd_root: &Path, now_ms: u64) -> MoveResult<Vec<MoveState>> {
        Ok(scan_moves(sd_root, &self.limits)?
            .into_values()
            .filter(|state| state.is_stale(now_ms, self.limits.stale_move_timeout_ms))
            .collect())
    }

    /// Adopt an abandoned move and finish it from its last completed
    /// step.
    pub fn take_over_move(
        &self,
        ends: &MoveEnds<'_>,
        move_id: MoveId,
        now_ms: u64,
    ) -> MoveResult<()> {
        let state = self.lookup(ends.source_root, move_id)?;
        if state.status.is_terminal() {
            return Err(MoveError::AlreadyTerminal {
                move_id,
                status: state.status,
            });
        }

        let mut logger = self.open_logger(ends, now_ms)?;
        let template = MoveRecord {
            move_id,
            note_id: state.note_id,
            source_sd: state.source_sd,
            target_sd: state.target_sd,
            target_folder: state.target_folder,
            writer: self.instance_id,
            seq: 0,
            timestamp_ms: now_ms,
            status: MoveStatus::TakenOver,
        };

        info!(%move_id, abandoned_by = %state.owner, "taking over stale move");
        logger.append(template)?;
        self.run_steps(&mut logger, ends, template, state.status, now_ms)?;
        Ok(())
    }

    /// Discard a move's partial target copies and mark it cancelled.
    pub fn cancel_move(
        &self,
        ends: &MoveEnds<'_>,
        move_id: MoveId,
        now_ms: u64,
    ) -> MoveResult<()> {
        let state = self.lookup(ends.source_root, move_id)?;
        if state.status.is_terminal() {
            return Err(MoveError::AlreadyTerminal {
                move_id,
                status: state.status,
            });
        }

        info!(%move_id, note_id = %state.note_id, "cancelling move; rolling back copies");
        remove_dir_if_present(&paths::note_dir(ends.target_root, state.note_id))?;
        remove_dir_if_present(&paths::note_media_dir(ends.target_root, state.note_id))?;

        let mut logger = self.open_logger(ends, now_ms)?;
        logger.append(MoveRecord {
            move_id,
            note_id: state.note_id,
            source_sd: state.source_sd,
            target_sd: state.target_sd,
            target_folder: state.target_folder,
            writer: self.instance_id,
            seq: 0,
            timestamp_ms: now_ms,
            status: MoveStatus::Cancelled,
        })?;
        Ok(())
    }

    /// Execute the copy/commit steps that come after `completed`,
    /// appending each step's record once its work is done.
    fn run_steps(
        &self,
        logger: &mut MoveLogger,
        ends: &MoveEnds<'_>,
        template: MoveRecord,
        completed: MoveStatus,
        now_ms: u64,
    ) -> MoveResult<()> {
        let note_id = template.note_id;
        let record = |status: MoveStatus| MoveRecord {
            status,
            timestamp_ms: now_ms,
            ..template
        };

        if completed < MoveStatus::ImagesCopied {
            copy_dir_recursive(
                &paths::note_media_dir(ends.source_root, note_id),
                &paths::note_media_dir(ends.target_root, note_id),
            )?;
            logger.append(record(MoveStatus::ImagesCopied))?;
        }
        if completed < MoveStatus::CrdtCopied {
            copy_dir_recursive(
                &paths::note_dir(ends.source_root, note_id),
                &paths::note_dir(ends.target_root, note_id),
            )?;
            logger.append(record(MoveStatus::CrdtCopied))?;
        }

        // Commit: the target now owns the note; tear out the source.
        remove_dir_if_present(&paths::note_dir(ends.source_root, note_id))?;
        remove_dir_if_present(&paths::note_media_dir(ends.source_root, note_id))?;
        logger.append(record(MoveStatus::Committed))?;
        info!(move_id = %template.move_id, %note_id, "move committed");
        Ok(())
    }

    fn lookup(&self, source_root: &Path, move_id: MoveId) -> MoveResult<MoveState> {
        scan_moves(source_root, &self.limits)?
            .remove(&move_id)
            .ok_or(MoveError::UnknownMove { move_id })
    }

    fn open_logger(&self, ends: &MoveEnds<'_>, now_ms: u64) -> MoveResult<MoveLogger> {
        MoveLogger::open(
            ends.source_root,
            ends.source_sd,
            self.instance_id,
            &self.limits,
            now_ms,
        )
    }
}

/// Copy a directory tree, overwriting files that already exist so a
/// resumed move can re-run a half-finished step. A missing source is
/// fine (note without images).
fn copy_dir_recursive(src: &Path, dst: &Path) -> MoveResult<()> {
    let entries = match fs::read_dir(src) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(MoveError::Io {
                path: src.to_path_buf(),
                source,
            });
        }
    };
    fs::create_dir_all(dst).map_err(|source| MoveError::Io {
        path: dst.to_path_buf(),
        source,
    })?;

    for entry in entries {
        let entry = entry.map_err(|source| MoveError::Io {
            path: src.to_path_buf(),
            source,
        })?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(|source| MoveError::Io {
            path: from.clone(),
            source,
        })?;
        if file_type.is_dir() {
            copy_dir_recursive(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(|source| MoveError::Io {
                path: from.clone(),
                source,
            })?;
        }
    }
    Ok(())
}

fn remove_dir_if_present(dir: &Path) -> MoveResult<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(MoveError::Io {
            path: dir.to_path_buf(),
            source,
        }),
    }
}
