use std::collections::HashMap;

use super::time::safe_subtract;

/// Counter deltas one entity accumulated over `[end - duration, end)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Measurement {
    pub entity_id: u32,
    pub cycles: u64,
    pub instructions: u64,
    pub llc_misses: u64,
    pub end_timestamp_ns: u64,
    pub duration_ns: u64,
}

impl Measurement {
    pub fn start_timestamp_ns(&self) -> u64 {
        self.end_timestamp_ns.wrapping_sub(self.duration_ns)
    }
}

/// Totals for one entity within one slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Aggregation {
    pub cycles: u64,
    pub instructions: u64,
    pub llc_misses: u64,
    /// Nanoseconds of measured time that fell inside the slot.
    pub duration: u64,
}

impl Aggregation {
    pub fn of(m: &Measurement) -> Self {
        Self {
            cycles: m.cycles,
            instructions: m.instructions,
            llc_misses: m.llc_misses,
            duration: m.duration_ns,
        }
    }

    pub fn add(&mut self, other: &Aggregation) {
        self.cycles = self.cycles.saturating_add(other.cycles);
        self.instructions = self.instructions.saturating_add(other.instructions);
        self.llc_misses = self.llc_misses.saturating_add(other.llc_misses);
        self.duration = self.duration.saturating_add(other.duration);
    }

    /// Detach the share covering `duration` nanoseconds.
    ///
    /// Counts are scaled by `duration / self.duration` and truncated; the
    /// share that covers everything left takes the exact remainder.
    pub fn split_off(&mut self, duration: u64) -> Aggregation {
        if duration >= self.duration {
            return std::mem::take(self);
        }

        let fraction = duration as f64 / self.duration as f64;
        let share = Aggregation {
            cycles: (self.cycles as f64 * fraction) as u64,
            instructions: (self.instructions as f64 * fraction) as u64,
            llc_misses: (self.llc_misses as f64 * fraction) as u64,
            duration,
        };
        self.cycles -= share.cycles.min(self.cycles);
        self.instructions -= share.instructions.min(self.instructions);
        self.llc_misses -= share.llc_misses.min(self.llc_misses);
        self.duration -= duration;
        share
    }

    /// Cycles per instruction, if any instructions retired.
    pub fn cpi(&self) -> Option<f64> {
        (self.instructions > 0).then(|| self.cycles as f64 / self.instructions as f64)
    }
}

/// One fixed-width bucket of the sliding window.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSlot {
    pub start_time: u64,
    pub end_time: u64,
    pub aggregations: HashMap<u32, Aggregation>,
}

impl TimeSlot {
    pub fn new(start_time: u64, slot_length: u64) -> Self {
        Self {
            start_time,
            end_time: start_time.wrapping_add(slot_length),
            aggregations: HashMap::new(),
        }
    }

    pub fn contains(&self, timestamp: u64) -> bool {
        safe_subtract(timestamp, self.start_time) >= 0 && safe_subtract(timestamp, self.end_time) < 0
    }

    /// The part of `[start, end)` inside this slot, if any.
    pub fn overlap(&self, start: u64, end: u64) -> Option<(u64, u64)> {
        let from = if safe_subtract(start, self.start_time) >= 0 {
            start
        } else {
            self.start_time
        };
        let to = if safe_subtract(end, self.end_time) >= 0 {
            self.end_time
        } else {
            end
        };
        (safe_subtract(to, from) > 0).then_some((from, to))
    }

    pub fn record(&mut self, entity_id: u32, share: &Aggregation) {
        self.aggregations.entry(entity_id).or_default().add(share);
    }

    pub fn is_empty(&self) -> bool {
        self.aggregations.is_empty()
    }
}
