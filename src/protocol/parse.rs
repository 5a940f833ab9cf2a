//! Decoding of raw ring records into [`Message`] values.
//!
//! Record payloads arrive as copied out of the ring: sample payloads still
//! carry the kernel's 4-byte raw-size word, which is skipped here. Length
//! checks happen once per message, after which fixed offsets are read.

use thiserror::Error;

use super::message::{
    LostRecords, Message, MessageType, RmidAlloc, RmidFree, LOST_RECORD_SIZE,
    MESSAGE_HEADER_SIZE, PERF_MESSAGE_SIZE, RMID_ALLOC_MESSAGE_SIZE, RMID_FREE_MESSAGE_SIZE,
    TASK_COMM_LEN,
};
use crate::aggregate::Measurement;
use crate::perf::ring::{PERF_RECORD_LOST, PERF_RECORD_SAMPLE, SAMPLE_SIZE_PREFIX};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unsupported ring record type {record_type}")]
    UnsupportedRecord { record_type: u32 },

    #[error("reading {what}: {size} bytes, need {need}")]
    Truncated {
        what: &'static str,
        size: usize,
        need: usize,
    },

    #[error("unknown message type: {raw}")]
    UnknownMessageType { raw: u32 },
}

/// Decode one ring record given its type and full payload.
pub fn parse_record(record_type: u32, payload: &[u8]) -> Result<Message, DecodeError> {
    match record_type {
        PERF_RECORD_SAMPLE => {
            ensure_len(payload, SAMPLE_SIZE_PREFIX, "sample size prefix")?;
            parse_sample(&payload[SAMPLE_SIZE_PREFIX..])
        }
        PERF_RECORD_LOST => parse_lost(payload),
        other => Err(DecodeError::UnsupportedRecord {
            record_type: other,
        }),
    }
}

/// Decode sample data (the raw-size word already stripped).
pub fn parse_sample(data: &[u8]) -> Result<Message, DecodeError> {
    ensure_len(data, MESSAGE_HEADER_SIZE, "message header")?;

    let timestamp_ns = read_u64_le(data, 0);
    let raw_type = read_u32_le(data, 8);
    let kind =
        MessageType::from_u32(raw_type).ok_or(DecodeError::UnknownMessageType { raw: raw_type })?;

    match kind {
        MessageType::Perf => {
            ensure_len(data, PERF_MESSAGE_SIZE, "perf measurement")?;
            Ok(Message::Measurement(Measurement {
                entity_id: read_u32_le(data, 12),
                cycles: read_u64_le(data, 16),
                instructions: read_u64_le(data, 24),
                llc_misses: read_u64_le(data, 32),
                end_timestamp_ns: timestamp_ns,
                duration_ns: read_u64_le(data, 40),
            }))
        }
        MessageType::RmidAlloc => {
            ensure_len(data, RMID_ALLOC_MESSAGE_SIZE, "rmid alloc")?;
            Ok(Message::RmidAlloc(RmidAlloc {
                timestamp_ns,
                rmid: read_u32_le(data, 12),
                comm: read_fixed::<TASK_COMM_LEN>(data, 16),
                tgid: read_u32_le(data, 32),
            }))
        }
        MessageType::RmidFree => {
            ensure_len(data, RMID_FREE_MESSAGE_SIZE, "rmid free")?;
            Ok(Message::RmidFree(RmidFree {
                timestamp_ns,
                rmid: read_u32_le(data, 12),
            }))
        }
    }
}

fn parse_lost(payload: &[u8]) -> Result<Message, DecodeError> {
    ensure_len(payload, LOST_RECORD_SIZE, "lost record")?;
    Ok(Message::Lost(LostRecords {
        id: read_u64_le(payload, 0),
        lost: read_u64_le(payload, 8),
    }))
}

// ---------------------------------------------------------------------------
// Byte-reading helpers
// ---------------------------------------------------------------------------

#[inline]
fn ensure_len(data: &[u8], need: usize, what: &'static str) -> Result<(), DecodeError> {
    if data.len() < need {
        return Err(DecodeError::Truncated {
            what,
            size: data.len(),
            need,
        });
    }
    Ok(())
}

/// Reads `N` bytes at `offset`; out-of-range reads yield zeros.
#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    if let Some(src) = offset.checked_add(N).and_then(|end| data.get(offset..end)) {
        out.copy_from_slice(src);
    }
    out
}

#[inline(always)]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_fixed::<4>(data, offset))
}

#[inline(always)]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_fixed::<8>(data, offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::encode_measurement;

    fn with_prefix(data: &[u8]) -> Vec<u8> {
        let mut payload = (data.len() as u32).to_le_bytes().to_vec();
        payload.extend_from_slice(data);
        payload
    }

    #[test]
    fn test_parse_measurement() {
        let m = Measurement {
            entity_id: 12,
            cycles: 1_000_000,
            instructions: 2_500_000,
            llc_misses: 4_200,
            end_timestamp_ns: 987_654_321,
            duration_ns: 1_000_000,
        };
        let parsed = parse_record(PERF_RECORD_SAMPLE, &with_prefix(&encode_measurement(&m)))
            .expect("parse");
        assert_eq!(parsed, Message::Measurement(m));
    }

    #[test]
    fn test_parse_rmid_alloc_with_padding() {
        let mut comm = [0u8; TASK_COMM_LEN];
        comm[..5].copy_from_slice(b"nginx");
        let alloc = RmidAlloc {
            timestamp_ns: 55,
            rmid: 7,
            comm,
            tgid: 4321,
        };
        // The producer's struct is padded to 40 bytes.
        let mut data = alloc.to_bytes().to_vec();
        data.extend_from_slice(&[0; 4]);

        assert_eq!(parse_sample(&data), Ok(Message::RmidAlloc(alloc)));
    }

    #[test]
    fn test_parse_rmid_free() {
        let free = RmidFree {
            timestamp_ns: 99,
            rmid: 7,
        };
        assert_eq!(parse_sample(&free.to_bytes()), Ok(Message::RmidFree(free)));
    }

    #[test]
    fn test_parse_lost() {
        let lost = LostRecords { id: 1, lost: 250 };
        assert_eq!(
            parse_record(PERF_RECORD_LOST, &lost.to_bytes()),
            Ok(Message::Lost(lost))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            parse_record(17, &[0; 32]),
            Err(DecodeError::UnsupportedRecord { record_type: 17 })
        );
        assert!(matches!(
            parse_record(PERF_RECORD_SAMPLE, &[0; 2]),
            Err(DecodeError::Truncated { .. })
        ));
        assert!(matches!(
            parse_record(PERF_RECORD_LOST, &[0; 8]),
            Err(DecodeError::Truncated { size: 8, need: 16, .. })
        ));

        let mut unknown = [0u8; 16];
        unknown[8..12].copy_from_slice(&9u32.to_le_bytes());
        assert_eq!(
            parse_sample(&unknown),
            Err(DecodeError::UnknownMessageType { raw: 9 })
        );

        // Header says PERF but the body is cut short.
        let m = encode_measurement(&Measurement::default());
        let err = parse_sample(&m[..40]).expect_err("truncated");
        assert!(err.to_string().contains("perf measurement"));
    }

    #[test]
    fn test_read_fixed_out_of_range_is_zero() {
        assert_eq!(read_fixed::<4>(&[1, 2], 0), [0; 4]);
        assert_eq!(read_u32_le(&[1, 0, 0, 0], 0), 1);
        assert_eq!(read_u64_le(&[], usize::MAX), 0);
    }
}
