use std::collections::{HashMap, VecDeque};

use super::message::{RmidAlloc, RmidFree};
use crate::aggregate::safe_subtract;

/// What is known about the process behind a monitoring identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RmidMetadata {
    pub comm: String,
    pub tgid: u32,
    /// False once the identifier has been freed. The rest of the metadata
    /// is kept so slots recorded before the free can still be labelled.
    pub valid: bool,
}

#[derive(Debug, Clone)]
enum RmidUpdate {
    Alloc { rmid: u32, meta: RmidMetadata },
    Free { rmid: u32 },
}

/// Tracks RMID allocations and frees, applying each one only once the
/// measurement stream has moved past its timestamp.
#[derive(Debug, Default)]
pub struct RmidTracker {
    rmids: HashMap<u32, RmidMetadata>,
    /// Queued updates, oldest first.
    pending: VecDeque<(u64, RmidUpdate)>,
}

impl RmidTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an allocation.
    pub fn alloc(&mut self, alloc: &RmidAlloc) {
        let meta = RmidMetadata {
            comm: alloc.comm_str().into_owned(),
            tgid: alloc.tgid,
            valid: true,
        };
        self.enqueue(
            alloc.timestamp_ns,
            RmidUpdate::Alloc {
                rmid: alloc.rmid,
                meta,
            },
        );
    }

    /// Queue a free.
    pub fn free(&mut self, free: &RmidFree) {
        self.enqueue(free.timestamp_ns, RmidUpdate::Free { rmid: free.rmid });
    }

    /// Apply every queued update stamped strictly before `timestamp`.
    /// Returns how many were applied.
    pub fn advance(&mut self, timestamp: u64) -> usize {
        let mut applied = 0;
        while let Some((at, _)) = self.pending.front() {
            if safe_subtract(*at, timestamp) >= 0 {
                break;
            }
            let Some((_, update)) = self.pending.pop_front() else {
                break;
            };
            match update {
                RmidUpdate::Alloc { rmid, meta } => {
                    self.rmids.insert(rmid, meta);
                }
                RmidUpdate::Free { rmid } => {
                    if let Some(meta) = self.rmids.get_mut(&rmid) {
                        meta.valid = false;
                    }
                }
            }
            applied += 1;
        }
        applied
    }

    pub fn get(&self, rmid: u32) -> Option<&RmidMetadata> {
        self.rmids.get(&rmid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &RmidMetadata)> {
        self.rmids.iter().map(|(id, meta)| (*id, meta))
    }

    /// Updates waiting for the stream to reach their timestamp.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Forget all metadata and queued updates.
    pub fn reset(&mut self) {
        self.rmids.clear();
        self.pending.clear();
    }

    // Rings are merged per poll, so a late CPU can hand over an update
    // older than the queue tail.
    fn enqueue(&mut self, timestamp: u64, update: RmidUpdate) {
        let at = self
            .pending
            .iter()
            .rposition(|(queued, _)| safe_subtract(*queued, timestamp) <= 0)
            .map_or(0, |i| i + 1);
        self.pending.insert(at, (timestamp, update));
    }
}
