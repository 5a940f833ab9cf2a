use std::sync::atomic::{AtomicU64, Ordering};

use super::message::{MessageKind, MESSAGE_KIND_COUNT};

/// Lock-free per-message-kind counters shared between the poll loop and
/// the reporter.
///
/// `snapshot()` reads and resets every counter.
pub struct MessageStats {
    counts: [AtomicU64; MESSAGE_KIND_COUNT],
    lost_samples: AtomicU64,
    decode_errors: AtomicU64,
}

/// Counters drained by one [`MessageStats::snapshot`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Non-zero per-kind counts.
    pub messages: Vec<(MessageKind, u64)>,
    /// Records the kernel reported as dropped.
    pub lost_samples: u64,
    pub decode_errors: u64,
}

impl StatsSnapshot {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.lost_samples == 0 && self.decode_errors == 0
    }

    pub fn count(&self, kind: MessageKind) -> u64 {
        self.messages
            .iter()
            .find(|(k, _)| *k == kind)
            .map_or(0, |(_, v)| *v)
    }
}

impl MessageStats {
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            lost_samples: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
        }
    }

    pub fn record(&self, kind: MessageKind) {
        self.record_n(kind, 1);
    }

    pub fn record_n(&self, kind: MessageKind, n: u64) {
        if let Some(counter) = self.counts.get(kind as usize) {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn record_lost(&self, lost: u64) {
        self.lost_samples.fetch_add(lost, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let messages = MessageKind::ALL
            .iter()
            .filter_map(|&kind| {
                let v = self.counts[kind as usize].swap(0, Ordering::Relaxed);
                (v > 0).then_some((kind, v))
            })
            .collect();

        StatsSnapshot {
            messages,
            lost_samples: self.lost_samples.swap(0, Ordering::Relaxed),
            decode_errors: self.decode_errors.swap(0, Ordering::Relaxed),
        }
    }
}

impl Default for MessageStats {
    fn default() -> Self {
        Self::new()
    }
}
