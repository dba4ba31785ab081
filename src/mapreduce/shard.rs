//! Intermediate shard codec.
//!
//! A shard is a sorted sequence of (key, value) records with a trailing
//! SHA-256 over the record bytes. Readers verify the digest before any
//! record is surfaced, so corruption is detected at the consumer and can
//! name the exact (mapTaskId, partition) pair that produced it.

use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};
use crate::model::JobId;

const DIGEST_LEN: usize = 32;

/// Encode records into shard bytes. Records must already be sorted by key;
/// the encoder asserts the order rather than fixing it, because the sort
/// boundary is the mapper's responsibility.
pub fn encode(records: &[(String, String)]) -> Vec<u8> {
    debug_assert!(records.windows(2).all(|w| w[0].0 <= w[1].0));
    let mut buf = Vec::with_capacity(16 + records.len() * 16);
    buf.extend_from_slice(&(records.len() as u32).to_le_bytes());
    for (key, value) in records {
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(key.as_bytes());
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.extend_from_slice(value.as_bytes());
    }
    let digest = Sha256::digest(&buf);
    buf.extend_from_slice(&digest);
    buf
}

/// Decode and verify shard bytes. `job`, `map_index` and `partition`
/// identify the shard for corruption reporting only.
pub fn decode(
    bytes: &[u8],
    job: JobId,
    map_index: u32,
    partition: u32,
) -> Result<Vec<(String, String)>> {
    let corrupt = || EngineError::ShardCorrupt {
        job_id: job,
        map_index,
        partition,
    };
    if bytes.len() < 4 + DIGEST_LEN {
        return Err(corrupt());
    }
    let (payload, trailer) = bytes.split_at(bytes.len() - DIGEST_LEN);
    let digest = Sha256::digest(payload);
    if digest.as_slice() != trailer {
        return Err(corrupt());
    }
    let mut count_raw = [0u8; 4];
    count_raw.copy_from_slice(&payload[..4]);
    let count = u32::from_le_bytes(count_raw) as usize;
    let mut reader = Reader { payload, cursor: 4 };
    let mut records = Vec::with_capacity(count.min(1 << 20));
    for _ in 0..count {
        let key = reader.read_string().ok_or_else(corrupt)?;
        let value = reader.read_string().ok_or_else(corrupt)?;
        records.push((key, value));
    }
    if reader.cursor != payload.len() {
        return Err(corrupt());
    }
    Ok(records)
}

struct Reader<'a> {
    payload: &'a [u8],
    cursor: usize,
}

impl Reader<'_> {
    fn read_u32(&mut self) -> Option<u32> {
        let end = self.cursor.checked_add(4)?;
        let raw: [u8; 4] = self.payload.get(self.cursor..end)?.try_into().ok()?;
        self.cursor = end;
        Some(u32::from_le_bytes(raw))
    }

    fn read_string(&mut self) -> Option<String> {
        let len = self.read_u32()? as usize;
        let end = self.cursor.checked_add(len)?;
        let raw = self.payload.get(self.cursor..end)?;
        self.cursor = end;
        std::str::from_utf8(raw).ok().map(str::to_string)
    }
}

/// Hex SHA-256 of object bytes, recorded in `TaskCompleted` entries so the
/// coordinator can audit outputs without re-reading producers.
pub fn object_checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<(String, String)> {
        vec![
            ("brown".to_string(), "1".to_string()),
            ("fox".to_string(), "1".to_string()),
            ("fox".to_string(), "1".to_string()),
            ("the".to_string(), "1".to_string()),
        ]
    }

    #[test]
    fn encode_decode_round_trip() {
        let job = JobId::new();
        let bytes = encode(&sample());
        let decoded = decode(&bytes, job, 0, 0).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn empty_shard_is_valid() {
        let job = JobId::new();
        let bytes = encode(&[]);
        assert!(decode(&bytes, job, 0, 0).unwrap().is_empty());
    }

    #[test]
    fn flipped_byte_is_detected() {
        let job = JobId::new();
        let mut bytes = encode(&sample());
        bytes[10] ^= 0xFF;
        let err = decode(&bytes, job, 1, 0).unwrap_err();
        match err {
            EngineError::ShardCorrupt {
                map_index,
                partition,
                ..
            } => {
                assert_eq!((map_index, partition), (1, 0));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn truncation_is_detected() {
        let job = JobId::new();
        let bytes = encode(&sample());
        let err = decode(&bytes[..bytes.len() - 3], job, 0, 1).unwrap_err();
        assert!(matches!(err, EngineError::ShardCorrupt { .. }));
    }

    #[test]
    fn trailing_garbage_is_detected() {
        let job = JobId::new();
        let mut bytes = encode(&sample());
        bytes.extend_from_slice(b"junk");
        assert!(decode(&bytes, job, 0, 0).is_err());
    }
}
