//! Log file header (identity + epoch).
//!
//! The header pins a log file to its storage directory and writer so
//! a file dropped in the wrong tree by a misbehaving sync client is
//! rejected instead of replayed. The epoch changes only when the
//! writer compacts, which is how readers know their byte offsets are
//! stale.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crc32c::crc32c;
use uuid::Uuid;

use crate::core::{InstanceId, SdId};

use super::{LogError, LogResult};

pub(crate) const LOG_MAGIC: &[u8; 5] = b"FOLOG";
pub const LOG_FORMAT_VERSION: u32 = 1;

// magic + version + header_len + sd + writer + epoch + created + flags + crc
pub(crate) const LOG_HEADER_LEN: usize = 5 + 4 + 4 + 16 + 16 + 8 + 8 + 4 + 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogHeader {
    pub sd_id: SdId,
    pub writer: InstanceId,
    pub epoch: u64,
    pub created_at_ms: u64,
    pub flags: u32,
}

impl LogHeader {
    pub fn new(sd_id: SdId, writer: InstanceId, epoch: u64, created_at_ms: u64) -> Self {
        Self {
            sd_id,
            writer,
            epoch,
            created_at_ms,
            flags: 0,
        }
    }

    pub fn encoded_len() -> u64 {
        LOG_HEADER_LEN as u64
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(LOG_HEADER_LEN);
        buf.extend_from_slice(LOG_MAGIC);
        buf.extend_from_slice(&LOG_FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&(LOG_HEADER_LEN as u32).to_le_bytes());
        buf.extend_from_slice(self.sd_id.as_uuid().as_bytes());
        buf.extend_from_slice(self.writer.as_uuid().as_bytes());
        buf.extend_from_slice(&self.epoch.to_le_bytes());
        buf.extend_from_slice(&self.created_at_ms.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        let crc = crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        debug_assert_eq!(buf.len(), LOG_HEADER_LEN);
        buf
    }

    pub fn decode(bytes: &[u8], path: &Path) -> LogResult<Self> {
        let invalid = |reason: &str| LogError::FileHeaderInvalid {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        if bytes.len() < LOG_HEADER_LEN {
            return Err(invalid("header truncated"));
        }
        if &bytes[..LOG_MAGIC.len()] != LOG_MAGIC {
            return Err(invalid("bad magic"));
        }

        let mut offset = LOG_MAGIC.len();
        let version = read_u32(bytes, &mut offset);
        if version != LOG_FORMAT_VERSION {
            return Err(invalid(&format!("unsupported format version {version}")));
        }
        let header_len = read_u32(bytes, &mut offset) as usize;
        if header_len != LOG_HEADER_LEN {
            return Err(invalid(&format!("unexpected header length {header_len}")));
        }

        let sd_id = SdId::new(read_uuid(bytes, &mut offset));
        let writer = InstanceId::new(read_uuid(bytes, &mut offset));
        let epoch = read_u64(bytes, &mut offset);
        let created_at_ms = read_u64(bytes, &mut offset);
        let flags = read_u32(bytes, &mut offset);

        let expected_crc = read_u32(bytes, &mut offset);
        let actual_crc = crc32c(&bytes[..LOG_HEADER_LEN - 4]);
        if actual_crc != expected_crc {
            return Err(invalid("header crc mismatch"));
        }

        Ok(Self {
            sd_id,
            writer,
            epoch,
            created_at_ms,
            flags,
        })
    }

    /// Read and validate the header of an open log file, leaving the
    /// read position just past it.
    pub fn read_from(file: &mut File, path: &Path) -> LogResult<Self> {
        let mut buf = [0u8; LOG_HEADER_LEN];
        let mut read = 0usize;
        while read < buf.len() {
            let n = file
                .read(&mut buf[read..])
                .map_err(|source| LogError::io(path, source))?;
            if n == 0 {
                return Err(LogError::FileHeaderInvalid {
                    path: path.to_path_buf(),
                    reason: "file shorter than header".to_string(),
                });
            }
            read += n;
        }
        Self::decode(&buf, path)
    }
}

fn read_u32(bytes: &[u8], offset: &mut usize) -> u32 {
    let v = u32::from_le_bytes(bytes[*offset..*offset + 4].try_into().expect("u32 slice"));
    *offset += 4;
    v
}

fn read_u64(bytes: &[u8], offset: &mut usize) -> u64 {
    let v = u64::from_le_bytes(bytes[*offset..*offset + 8].try_into().expect("u64 slice"));
    *offset += 8;
    v
}

fn read_uuid(bytes: &[u8], offset: &mut usize) -> Uuid {
    let v = Uuid::from_bytes(bytes[*offset..*offset + 16].try_into().expect("uuid slice"));
    *offset += 16;
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn header_roundtrip() {
        let header = LogHeader::new(
            SdId::new(Uuid::from_bytes([1u8; 16])),
            InstanceId::new(Uuid::from_bytes([2u8; 16])),
            3,
            1_700_000_000_000,
        );
        let bytes = header.encode();
        let decoded = LogHeader::decode(&bytes, &PathBuf::from("x.log")).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_crc_flip_rejected() {
        let header = LogHeader::new(SdId::generate(), InstanceId::generate(), 0, 1);
        let mut bytes = header.encode();
        bytes[20] ^= 0xFF;
        let err = LogHeader::decode(&bytes, &PathBuf::from("x.log")).unwrap_err();
        assert!(matches!(err, LogError::FileHeaderInvalid { .. }));
    }
}
