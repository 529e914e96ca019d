//! Redo record framing.
//!
//! Each record has the following on-disk format:
//!
//! ```text
//! +----------+----------+----------+----------+----------+----------+
//! | magic    | type     | flags    | reserved | length   | crc32c   |
//! | 4 bytes  | 1 byte   | 1 byte   | 2 bytes  | 4 bytes  | 4 bytes  |
//! +----------+----------+----------+----------+----------+----------+
//! | commit_ts           | payload                                   |
//! | 8 bytes             | length bytes                              |
//! +---------------------+-------------------------------------------+
//! ```
//!
//! Payloads are JSON. The header carries the commit timestamp so readers can
//! order records without decoding the payload.

use crate::error::RedoError;
use crate::model::{LogKind, RedoLog};
use crate::RECORD_HEADER_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes for redo records: "RDLG"
pub const REDO_MAGIC: [u8; 4] = *b"RDLG";

/// Maximum record payload size (16 MiB).
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Type of a framed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Row = 1,
    Ddl = 2,
    Meta = 3,
}

impl TryFrom<u8> for RecordType {
    type Error = RedoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RecordType::Row),
            2 => Ok(RecordType::Ddl),
            3 => Ok(RecordType::Meta),
            _ => Err(RedoError::InvalidHeader {
                offset: 0,
                reason: format!("unknown record type: {}", value),
            }),
        }
    }
}

impl From<LogKind> for RecordType {
    fn from(kind: LogKind) -> Self {
        match kind {
            LogKind::Row => RecordType::Row,
            LogKind::Ddl => RecordType::Ddl,
        }
    }
}

/// A parsed record header.
#[derive(Debug, Clone)]
pub struct RecordHeader {
    pub record_type: RecordType,
    pub flags: u8,
    pub payload_len: u32,
    pub crc32c: u32,
    pub commit_ts: u64,
}

/// A complete framed record (header + payload).
#[derive(Debug, Clone)]
pub struct RedoRecord {
    pub header: RecordHeader,
    pub payload: Bytes,
}

impl RedoRecord {
    /// Creates a new record.
    pub fn new(record_type: RecordType, commit_ts: u64, payload: Bytes) -> Self {
        let crc = crc32c::crc32c(&payload);
        Self {
            header: RecordHeader {
                record_type,
                flags: 0,
                payload_len: payload.len() as u32,
                crc32c: crc,
                commit_ts,
            },
            payload,
        }
    }

    /// Serializes a change event into a framed record.
    pub fn from_log(log: &RedoLog) -> Result<Self, RedoError> {
        let payload = serde_json::to_vec(log)?;
        Ok(Self::new(
            log.kind().into(),
            log.commit_ts(),
            Bytes::from(payload),
        ))
    }

    /// Deserializes the payload of a row or DDL record.
    pub fn to_log(&self) -> Result<RedoLog, RedoError> {
        let log: RedoLog = serde_json::from_slice(&self.payload)?;
        Ok(log)
    }

    pub fn commit_ts(&self) -> u64 {
        self.header.commit_ts
    }

    /// Encodes the record into bytes.
    pub fn encode(&self) -> Result<BytesMut, RedoError> {
        if self.payload.len() > MAX_RECORD_SIZE {
            return Err(RedoError::RecordTooLarge {
                size: self.payload.len(),
                max: MAX_RECORD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(self.disk_size());

        buf.put_slice(&REDO_MAGIC);
        buf.put_u8(self.header.record_type as u8);
        buf.put_u8(self.header.flags);
        buf.put_u16(0);
        buf.put_u32(self.header.payload_len);
        buf.put_u32(self.header.crc32c);
        buf.put_u64(self.header.commit_ts);
        buf.put_slice(&self.payload);

        Ok(buf)
    }

    /// Decodes a record from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` holds only part of a record; the caller
    /// decides whether that means "read more" or "torn tail".
    pub fn decode(buf: &mut BytesMut, offset: u64) -> Result<Option<Self>, RedoError> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Ok(None);
        }

        if buf[0..4] != REDO_MAGIC {
            return Err(RedoError::InvalidHeader {
                offset,
                reason: format!("invalid magic: {:?}", &buf[0..4]),
            });
        }

        let record_type = RecordType::try_from(buf[4]).map_err(|_| RedoError::InvalidHeader {
            offset,
            reason: format!("unknown record type: {}", buf[4]),
        })?;

        let flags = buf[5];
        // reserved: buf[6..8]
        let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        let crc_expected = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let commit_ts = u64::from_be_bytes([
            buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
        ]);

        if payload_len > MAX_RECORD_SIZE {
            return Err(RedoError::RecordTooLarge {
                size: payload_len,
                max: MAX_RECORD_SIZE,
            });
        }

        if buf.len() < RECORD_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(RECORD_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        let crc_actual = crc32c::crc32c(&payload);
        if crc_actual != crc_expected {
            return Err(RedoError::CorruptedRecord {
                offset,
                expected: crc_expected,
                actual: crc_actual,
            });
        }

        Ok(Some(Self {
            header: RecordHeader {
                record_type,
                flags,
                payload_len: payload_len as u32,
                crc32c: crc_expected,
                commit_ts,
            },
            payload,
        }))
    }

    /// Number of bytes the record at the front of `buf` needs, if the header
    /// is complete.
    pub fn needed_len(buf: &[u8]) -> usize {
        if buf.len() < RECORD_HEADER_SIZE {
            return RECORD_HEADER_SIZE;
        }
        RECORD_HEADER_SIZE + u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize
    }

    /// Returns the total size of this record on disk.
    pub fn disk_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DdlEvent, DdlType, RowChangedEvent, TableName};

    fn row_log(commit_ts: u64) -> RedoLog {
        RedoLog::Row(RowChangedEvent::new(
            TableName::new("test", "t1", 1),
            1,
            commit_ts - 1,
            commit_ts,
        ))
    }

    #[test]
    fn test_record_from_log() {
        let record = RedoRecord::from_log(&row_log(42)).unwrap();
        assert_eq!(record.header.record_type, RecordType::Row);
        assert_eq!(record.commit_ts(), 42);

        let mut buf = record.encode().unwrap();
        let decoded = RedoRecord::decode(&mut buf, 0).unwrap().unwrap();
        assert!(buf.is_empty());
        assert_eq!(decoded.commit_ts(), 42);
        assert_eq!(decoded.to_log().unwrap(), row_log(42));
    }

    #[test]
    fn test_ddl_record_type() {
        let ddl = RedoLog::Ddl(DdlEvent::new("DROP TABLE t1", DdlType::DropTable, 1, 2));
        let record = RedoRecord::from_log(&ddl).unwrap();
        assert_eq!(record.header.record_type, RecordType::Ddl);
    }

    #[test]
    fn test_corrupted_record_detection() {
        let record = RedoRecord::from_log(&row_log(5)).unwrap();
        let mut encoded = record.encode().unwrap();

        let len = encoded.len();
        encoded[len - 1] ^= 0xFF;

        let result = RedoRecord::decode(&mut encoded, 0);
        assert!(matches!(result, Err(RedoError::CorruptedRecord { .. })));
    }

    #[test]
    fn test_incomplete_record() {
        let record = RedoRecord::from_log(&row_log(5)).unwrap();
        let encoded = record.encode().unwrap();

        // Header only
        let mut buf = BytesMut::from(&encoded[..RECORD_HEADER_SIZE]);
        assert!(RedoRecord::decode(&mut buf, 0).unwrap().is_none());
        assert_eq!(RedoRecord::needed_len(&buf), encoded.len());

        // Partial header
        let mut buf = BytesMut::from(&b"RDLG"[..]);
        assert!(RedoRecord::decode(&mut buf, 0).unwrap().is_none());
    }

    #[test]
    fn test_invalid_magic() {
        let mut buf = BytesMut::from(&[0u8; 24][..]);
        let result = RedoRecord::decode(&mut buf, 0);
        assert!(matches!(result, Err(RedoError::InvalidHeader { .. })));
    }

    #[test]
    fn test_record_type_conversion() {
        assert_eq!(RecordType::try_from(1u8).unwrap(), RecordType::Row);
        assert_eq!(RecordType::try_from(2u8).unwrap(), RecordType::Ddl);
        assert_eq!(RecordType::try_from(3u8).unwrap(), RecordType::Meta);
        assert!(RecordType::try_from(100u8).is_err());
    }

    #[test]
    fn test_record_too_large() {
        let huge_payload = Bytes::from(vec![0u8; MAX_RECORD_SIZE + 1]);
        let record = RedoRecord::new(RecordType::Row, 1, huge_payload);
        assert!(matches!(
            record.encode(),
            Err(RedoError::RecordTooLarge { .. })
        ));
    }
}
