//! Messages the kernel side writes into the per-CPU rings.

pub mod message;
pub mod parse;
pub mod rmid;
pub mod stats;

pub use message::{LostRecords, Message, MessageKind, MessageType, RmidAlloc, RmidFree};
pub use parse::{parse_record, parse_sample, DecodeError};
pub use rmid::{RmidMetadata, RmidTracker};
pub use stats::{MessageStats, StatsSnapshot};
