use std::borrow::Cow;
use std::fmt;

use crate::aggregate::Measurement;

pub const TASK_COMM_LEN: usize = 16;

/// Size of the common `timestamp:u64, type:u32` prefix.
pub const MESSAGE_HEADER_SIZE: usize = 12;
pub const PERF_MESSAGE_SIZE: usize = 48;
/// Wire size without the trailing struct padding the producer may add.
pub const RMID_ALLOC_MESSAGE_SIZE: usize = 36;
pub const RMID_FREE_MESSAGE_SIZE: usize = 16;
pub const LOST_RECORD_SIZE: usize = 16;

/// Sample message discriminant, the `u32` after the timestamp.
/// Values must match the producer's `enum msg_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    Perf = 0,
    RmidAlloc = 1,
    RmidFree = 2,
}

impl MessageType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Perf),
            1 => Some(Self::RmidAlloc),
            2 => Some(Self::RmidFree),
            _ => None,
        }
    }
}

/// A monitoring identifier was bound to a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmidAlloc {
    pub timestamp_ns: u64,
    pub rmid: u32,
    pub comm: [u8; TASK_COMM_LEN],
    pub tgid: u32,
}

impl RmidAlloc {
    /// Process name up to the first NUL.
    pub fn comm_str(&self) -> Cow<'_, str> {
        let end = self
            .comm
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(TASK_COMM_LEN);
        String::from_utf8_lossy(&self.comm[..end])
    }

    pub fn to_bytes(&self) -> [u8; RMID_ALLOC_MESSAGE_SIZE] {
        let mut raw = [0u8; RMID_ALLOC_MESSAGE_SIZE];
        write_header(&mut raw, self.timestamp_ns, MessageType::RmidAlloc);
        raw[12..16].copy_from_slice(&self.rmid.to_le_bytes());
        raw[16..32].copy_from_slice(&self.comm);
        raw[32..36].copy_from_slice(&self.tgid.to_le_bytes());
        raw
    }
}

/// A monitoring identifier was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmidFree {
    pub timestamp_ns: u64,
    pub rmid: u32,
}

impl RmidFree {
    pub fn to_bytes(&self) -> [u8; RMID_FREE_MESSAGE_SIZE] {
        let mut raw = [0u8; RMID_FREE_MESSAGE_SIZE];
        write_header(&mut raw, self.timestamp_ns, MessageType::RmidFree);
        raw[12..16].copy_from_slice(&self.rmid.to_le_bytes());
        raw
    }
}

/// Kernel notice that `lost` records were dropped on a full ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LostRecords {
    pub id: u64,
    pub lost: u64,
}

impl LostRecords {
    pub fn to_bytes(&self) -> [u8; LOST_RECORD_SIZE] {
        let mut raw = [0u8; LOST_RECORD_SIZE];
        raw[0..8].copy_from_slice(&self.id.to_le_bytes());
        raw[8..16].copy_from_slice(&self.lost.to_le_bytes());
        raw
    }
}

/// Encode a measurement the way the producer emits a PERF message.
pub fn encode_measurement(m: &Measurement) -> [u8; PERF_MESSAGE_SIZE] {
    let mut raw = [0u8; PERF_MESSAGE_SIZE];
    write_header(&mut raw, m.end_timestamp_ns, MessageType::Perf);
    raw[12..16].copy_from_slice(&m.entity_id.to_le_bytes());
    raw[16..24].copy_from_slice(&m.cycles.to_le_bytes());
    raw[24..32].copy_from_slice(&m.instructions.to_le_bytes());
    raw[32..40].copy_from_slice(&m.llc_misses.to_le_bytes());
    raw[40..48].copy_from_slice(&m.duration_ns.to_le_bytes());
    raw
}

fn write_header(raw: &mut [u8], timestamp_ns: u64, kind: MessageType) {
    raw[0..8].copy_from_slice(&timestamp_ns.to_le_bytes());
    raw[8..12].copy_from_slice(&(kind as u32).to_le_bytes());
}

/// A decoded ring record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    Measurement(Measurement),
    RmidAlloc(RmidAlloc),
    RmidFree(RmidFree),
    Lost(LostRecords),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Measurement(_) => MessageKind::Measurement,
            Self::RmidAlloc(_) => MessageKind::RmidAlloc,
            Self::RmidFree(_) => MessageKind::RmidFree,
            Self::Lost(_) => MessageKind::Lost,
        }
    }
}

/// Counting label for [`Message`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Measurement = 0,
    RmidAlloc = 1,
    RmidFree = 2,
    Lost = 3,
}

/// Number of [`MessageKind`] variants, used for array sizing.
pub const MESSAGE_KIND_COUNT: usize = 4;

impl MessageKind {
    pub const ALL: [MessageKind; MESSAGE_KIND_COUNT] = [
        Self::Measurement,
        Self::RmidAlloc,
        Self::RmidFree,
        Self::Lost,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Measurement => "measurement",
            Self::RmidAlloc => "rmid_alloc",
            Self::RmidFree => "rmid_free",
            Self::Lost => "lost",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
