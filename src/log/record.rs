//! Record body encoding/decoding.
//!
//! Activity records carry an opaque CRDT update payload behind a
//! versioned fixed header; deletion records are header-only
//! tombstones. Multi-byte fields are little-endian.

use bytes::Bytes;
use uuid::Uuid;

use crate::core::{InstanceId, NoteId};

use super::{LogError, LogResult};

const ACTIVITY_VERSION: u16 = 1;
const ACTIVITY_HEADER_LEN: usize = 2 + 2 + 2 + 2 + 16 + 8 + 8 + 16;

const DELETION_VERSION: u16 = 1;
const DELETION_LEN: usize = 2 + 2 + 16 + 8 + 8 + 16;

const FLAG_SNAPSHOT: u16 = 1 << 0;

/// One CRDT update appended by a writer instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivityRecord {
    pub writer: InstanceId,
    pub seq: u64,
    pub timestamp_ms: u64,
    pub note_id: NoteId,
    /// Compaction artifact: payload is the writer's full state for the
    /// note at compaction time rather than an incremental update.
    pub snapshot: bool,
    pub payload: Bytes,
}

impl ActivityRecord {
    pub fn encode_body(&self) -> LogResult<Vec<u8>> {
        let mut flags = 0u16;
        if self.snapshot {
            flags |= FLAG_SNAPSHOT;
        }

        let mut buf = Vec::with_capacity(ACTIVITY_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&ACTIVITY_VERSION.to_le_bytes());
        buf.extend_from_slice(&(ACTIVITY_HEADER_LEN as u16).to_le_bytes());
        buf.extend_from_slice(&flags.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(self.writer.as_uuid().as_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        buf.extend_from_slice(self.note_id.as_uuid().as_bytes());
        buf.extend_from_slice(self.payload.as_ref());
        Ok(buf)
    }

    pub fn decode_body(body: &[u8]) -> LogResult<Self> {
        let mut offset = 0usize;
        let version = read_u16_le(body, &mut offset)?;
        if version != ACTIVITY_VERSION {
            return Err(LogError::RecordHeaderInvalid {
                reason: format!("unsupported activity record version {version}"),
            });
        }
        let header_len = read_u16_le(body, &mut offset)? as usize;
        if header_len < ACTIVITY_HEADER_LEN || header_len > body.len() {
            return Err(LogError::RecordHeaderInvalid {
                reason: format!("activity header length {header_len} out of range"),
            });
        }
        let flags = read_u16_le(body, &mut offset)?;
        if flags & !FLAG_SNAPSHOT != 0 {
            return Err(LogError::RecordHeaderInvalid {
                reason: format!("unknown activity flags {flags:#x}"),
            });
        }
        let reserved = read_u16_le(body, &mut offset)?;
        if reserved != 0 {
            return Err(LogError::RecordHeaderInvalid {
                reason: format!("activity reserved field not zero ({reserved})"),
            });
        }

        let writer = InstanceId::new(read_uuid(body, &mut offset)?);
        let seq = read_u64_le(body, &mut offset)?;
        if seq == 0 {
            return Err(LogError::RecordHeaderInvalid {
                reason: "activity sequence cannot be zero".to_string(),
            });
        }
        let timestamp_ms = read_u64_le(body, &mut offset)?;
        let note_id = NoteId::new(read_uuid(body, &mut offset)?);

        // header_len may exceed what this version knows; payload
        // starts where the writer said the header ends.
        let payload = Bytes::copy_from_slice(&body[header_len..]);

        Ok(Self {
            writer,
            seq,
            timestamp_ms,
            note_id,
            snapshot: flags & FLAG_SNAPSHOT != 0,
            payload,
        })
    }
}

/// Permanent-deletion tombstone appended by a writer instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeletionRecord {
    pub writer: InstanceId,
    pub seq: u64,
    pub timestamp_ms: u64,
    pub note_id: NoteId,
}

impl DeletionRecord {
    pub fn encode_body(&self) -> LogResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(DELETION_LEN);
        buf.extend_from_slice(&DELETION_VERSION.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(self.writer.as_uuid().as_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        buf.extend_from_slice(self.note_id.as_uuid().as_bytes());
        Ok(buf)
    }

    pub fn decode_body(body: &[u8]) -> LogResult<Self> {
        if body.len() != DELETION_LEN {
            return Err(LogError::RecordHeaderInvalid {
                reason: format!("deletion record length {} invalid", body.len()),
            });
        }

        let mut offset = 0usize;
        let version = read_u16_le(body, &mut offset)?;
        if version != DELETION_VERSION {
            return Err(LogError::RecordHeaderInvalid {
                reason: format!("unsupported deletion record version {version}"),
            });
        }
        let reserved = read_u16_le(body, &mut offset)?;
        if reserved != 0 {
            return Err(LogError::RecordHeaderInvalid {
                reason: format!("deletion reserved field not zero ({reserved})"),
            });
        }

        let writer = InstanceId::new(read_uuid(body, &mut offset)?);
        let seq = read_u64_le(body, &mut offset)?;
        if seq == 0 {
            return Err(LogError::RecordHeaderInvalid {
                reason: "deletion sequence cannot be zero".to_string(),
            });
        }
        let timestamp_ms = read_u64_le(body, &mut offset)?;
        let note_id = NoteId::new(read_uuid(body, &mut offset)?);

        Ok(Self {
            writer,
            seq,
            timestamp_ms,
            note_id,
        })
    }
}

pub(crate) fn read_u16_le(bytes: &[u8], offset: &mut usize) -> LogResult<u16> {
    let slice = take(bytes, offset, 2)?;
    Ok(u16::from_le_bytes([slice[0], slice[1]]))
}

pub(crate) fn read_u64_le(bytes: &[u8], offset: &mut usize) -> LogResult<u64> {
    let slice = take(bytes, offset, 8)?;
    Ok(u64::from_le_bytes([
        slice[0], slice[1], slice[2], slice[3], slice[4], slice[5], slice[6], slice[7],
    ]))
}

pub(crate) fn read_uuid(bytes: &[u8], offset: &mut usize) -> LogResult<Uuid> {
    let slice = take(bytes, offset, 16)?;
    let mut out = [0u8; 16];
    out.copy_from_slice(slice);
    Ok(Uuid::from_bytes(out))
}

pub(crate) fn take<'a>(bytes: &'a [u8], offset: &mut usize, len: usize) -> LogResult<&'a [u8]> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| LogError::RecordHeaderInvalid {
            reason: "record header length overflow".to_string(),
        })?;
    if end > bytes.len() {
        return Err(LogError::RecordHeaderInvalid {
            reason: "record header truncated".to_string(),
        });
    }
    let slice = &bytes[*offset..end];
    *offset = end;
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_activity() -> ActivityRecord {
        ActivityRecord {
            writer: InstanceId::new(Uuid::from_bytes([1u8; 16])),
            seq: 7,
            timestamp_ms: 1_700_000_000_000,
            note_id: NoteId::new(Uuid::from_bytes([2u8; 16])),
            snapshot: false,
            payload: Bytes::from_static(b"crdt-update"),
        }
    }

    #[test]
    fn activity_roundtrip() {
        let record = sample_activity();
        let body = record.encode_body().unwrap();
        let decoded = ActivityRecord::decode_body(&body).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn activity_snapshot_flag_roundtrips() {
        let mut record = sample_activity();
        record.snapshot = true;
        let body = record.encode_body().unwrap();
        assert!(ActivityRecord::decode_body(&body).unwrap().snapshot);
    }

    #[test]
    fn activity_rejects_zero_seq() {
        let mut record = sample_activity();
        record.seq = 0;
        let body = record.encode_body().unwrap();
        let err = ActivityRecord::decode_body(&body).unwrap_err();
        assert!(matches!(err, LogError::RecordHeaderInvalid { .. }));
    }

    #[test]
    fn activity_rejects_unknown_flags() {
        let record = sample_activity();
        let mut body = record.encode_body().unwrap();
        body[4] |= 0x80;
        let err = ActivityRecord::decode_body(&body).unwrap_err();
        assert!(matches!(err, LogError::RecordHeaderInvalid { .. }));
    }

    #[test]
    fn deletion_roundtrip() {
        let record = DeletionRecord {
            writer: InstanceId::new(Uuid::from_bytes([3u8; 16])),
            seq: 1,
            timestamp_ms: 1_700_000_000_001,
            note_id: NoteId::new(Uuid::from_bytes([4u8; 16])),
        };
        let body = record.encode_body().unwrap();
        assert_eq!(DeletionRecord::decode_body(&body).unwrap(), record);
    }

    #[test]
    fn deletion_rejects_trailing_bytes() {
        let record = DeletionRecord {
            writer: InstanceId::new(Uuid::from_bytes([3u8; 16])),
            seq: 2,
            timestamp_ms: 5,
            note_id: NoteId::new(Uuid::from_bytes([4u8; 16])),
        };
        let mut body = record.encode_body().unwrap();
        body.push(0);
        assert!(DeletionRecord::decode_body(&body).is_err());
    }
}
