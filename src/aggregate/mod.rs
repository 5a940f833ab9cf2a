//! Sliding-window, time-bucketed aggregation of per-entity counter deltas.
//!
//! The window is a fixed number of contiguous, phase-aligned slots. A
//! measurement is spread over the slots its interval overlaps in
//! proportion to the overlap; slots leave the window oldest first as
//! newer measurements push it forward.

pub mod slot;
pub mod time;

use std::collections::VecDeque;

use thiserror::Error;
use tracing::debug;

pub use slot::{Aggregation, Measurement, TimeSlot};
pub use time::{floor_align, safe_subtract};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateError {
    #[error("slot length must be greater than 0")]
    ZeroSlotLength,

    #[error("window size must be greater than 0")]
    ZeroWindowSize,

    #[error("slot offset {offset} must be less than slot length {slot_length}")]
    OffsetOutOfRange { offset: u64, slot_length: u64 },

    #[error("measurement duration {duration}ns exceeds the representable timeline distance")]
    DurationOutOfRange { duration: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorConfig {
    pub slot_length_ns: u64,
    pub window_size: u32,
    /// Slot boundaries sit at this offset modulo `slot_length_ns`.
    pub slot_offset_ns: u64,
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<(), AggregateError> {
        if self.slot_length_ns == 0 {
            return Err(AggregateError::ZeroSlotLength);
        }
        if self.window_size == 0 {
            return Err(AggregateError::ZeroWindowSize);
        }
        if self.slot_offset_ns >= self.slot_length_ns {
            return Err(AggregateError::OffsetOutOfRange {
                offset: self.slot_offset_ns,
                slot_length: self.slot_length_ns,
            });
        }
        Ok(())
    }
}

/// Single-threaded windowed aggregator. Measurements must arrive in
/// merged timestamp order.
#[derive(Debug)]
pub struct Aggregator {
    config: AggregatorConfig,
    window: VecDeque<TimeSlot>,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Result<Self, AggregateError> {
        config.validate()?;
        Ok(Self {
            config,
            window: VecDeque::with_capacity(config.window_size as usize),
        })
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Slots currently held, oldest first. Empty until the first measurement.
    pub fn slots(&self) -> impl ExactSizeIterator<Item = &TimeSlot> {
        self.window.iter()
    }

    /// Start of the slot containing `timestamp`.
    pub fn slot_start(&self, timestamp: u64) -> u64 {
        floor_align(
            timestamp,
            self.config.slot_length_ns,
            self.config.slot_offset_ns,
        )
    }

    /// Move the window so the slot containing `timestamp` is held, returning
    /// evicted slots oldest first.
    ///
    /// The window is positioned by the end timestamp alone; `_duration_ns`
    /// does not influence it.
    pub fn advance_window(&mut self, timestamp: u64, _duration_ns: u64) -> Vec<TimeSlot> {
        let target = self.slot_start(timestamp);
        let slot_length = self.config.slot_length_ns;
        let window_size = self.config.window_size as u64;

        let Some(newest) = self.window.back() else {
            self.fill_ending_at(target);
            return Vec::new();
        };

        let ahead = safe_subtract(target, newest.start_time);
        if ahead <= 0 {
            return Vec::new();
        }

        let steps = (ahead as u64).div_ceil(slot_length);
        if steps >= window_size {
            if steps > window_size {
                debug!(
                    skipped = steps - window_size,
                    "window jumped past slots that never held data"
                );
            }
            let evicted = self.window.drain(..).collect();
            self.fill_ending_at(target);
            return evicted;
        }

        let mut evicted = Vec::with_capacity(steps as usize);
        for _ in 0..steps {
            let next_start = self
                .window
                .back()
                .map_or(target, |slot| slot.end_time);
            if let Some(oldest) = self.window.pop_front() {
                evicted.push(oldest);
            }
            self.window.push_back(TimeSlot::new(next_start, slot_length));
        }
        evicted
    }

    /// Whether `m` can be placed on the timeline at all.
    pub fn check(m: &Measurement) -> Result<(), AggregateError> {
        if m.duration_ns > i64::MAX as u64 {
            return Err(AggregateError::DurationOutOfRange {
                duration: m.duration_ns,
            });
        }
        Ok(())
    }

    /// Spread a measurement over the slots it overlaps.
    ///
    /// Slots evicted by the implicit window advance are dropped; callers
    /// that export slots call [`advance_window`](Self::advance_window)
    /// first and keep what it returns.
    pub fn update(&mut self, m: &Measurement) -> Result<(), AggregateError> {
        Self::check(m)?;

        let dropped = self.advance_window(m.end_timestamp_ns, m.duration_ns);
        if !dropped.is_empty() {
            debug!(
                count = dropped.len(),
                entity = m.entity_id,
                "slots evicted inside update were discarded"
            );
        }

        if m.duration_ns == 0 {
            if let Some(slot) = self
                .window
                .iter_mut()
                .find(|slot| slot.contains(m.end_timestamp_ns))
            {
                slot.record(m.entity_id, &Aggregation::of(m));
            }
            return Ok(());
        }

        let end = m.end_timestamp_ns;
        let mut cursor = m.start_timestamp_ns();
        let mut remaining = Aggregation::of(m);

        for slot in self.window.iter_mut() {
            let Some((from, to)) = slot.overlap(cursor, end) else {
                continue;
            };
            let share = remaining.split_off(to.wrapping_sub(from));
            slot.record(m.entity_id, &share);
            cursor = to;
            if remaining.duration == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Hand back every held slot and forget the window.
    pub fn reset(&mut self) -> Vec<TimeSlot> {
        self.window.drain(..).collect()
    }

    fn fill_ending_at(&mut self, newest_start: u64) {
        let slot_length = self.config.slot_length_ns;
        let window_size = self.config.window_size as u64;
        for back in (0..window_size).rev() {
            let start = newest_start.wrapping_sub(back.wrapping_mul(slot_length));
            self.window.push_back(TimeSlot::new(start, slot_length));
        }
    }
}
