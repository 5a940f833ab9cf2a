//! One ingestion pass: merge the per-CPU rings, decode each record and
//! feed measurements to the aggregator in timestamp order.

use std::sync::Arc;

use thiserror::Error;

use crate::aggregate::{AggregateError, Aggregator, TimeSlot};
use crate::perf::{Merger, MergerError, PerfRing, RingError};
use crate::protocol::{parse_record, Message, MessageStats, RmidTracker};

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("merging rings: {0}")]
    Merger(#[from] MergerError),

    #[error("reading ring: {0}")]
    Ring(#[from] RingError),

    #[error("aggregating: {0}")]
    Aggregate(#[from] AggregateError),
}

/// What one [`Collector::poll`] did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollSummary {
    /// Records consumed from the rings, decodable or not.
    pub records: u64,
    pub measurements: u64,
    /// Records the kernel reported as dropped.
    pub lost_samples: u64,
    pub decode_errors: u64,
    pub slots_emitted: u64,
}

/// Owns the aggregator, the RMID metadata and the scratch buffer reused
/// across polls.
pub struct Collector {
    aggregator: Aggregator,
    rmids: RmidTracker,
    stats: Arc<MessageStats>,
    scratch: Vec<u8>,
}

impl Collector {
    pub fn new(aggregator: Aggregator) -> Self {
        Self::with_stats(aggregator, Arc::new(MessageStats::new()))
    }

    pub fn with_stats(aggregator: Aggregator, stats: Arc<MessageStats>) -> Self {
        Self {
            aggregator,
            rmids: RmidTracker::new(),
            stats,
            scratch: Vec::with_capacity(256),
        }
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Entity metadata as of the last measurement consumed.
    pub fn rmids(&self) -> &RmidTracker {
        &self.rmids
    }

    pub fn stats(&self) -> &Arc<MessageStats> {
        &self.stats
    }

    /// Drain every record currently published in `rings`.
    ///
    /// Slots that age out of the window are handed to `emit` oldest first,
    /// together with the RMID metadata in effect when they were closed.
    /// The read batch is closed on every ring even when an error is returned.
    pub fn poll<F>(&mut self, rings: &mut [PerfRing], mut emit: F) -> Result<PollSummary, CollectorError>
    where
        F: FnMut(TimeSlot, &RmidTracker),
    {
        let mut merger = Merger::with_capacity(rings.len());
        for ring in rings.iter_mut() {
            merger.add_ring(ring)?;
        }
        merger.start()?;

        let mut summary = PollSummary::default();
        let result = self.drain_merger(&mut merger, &mut summary, &mut emit);
        merger.finish();
        result.map(|()| summary)
    }

    /// Hand every held slot to `emit`, leaving the aggregator empty.
    pub fn drain<F>(&mut self, mut emit: F) -> usize
    where
        F: FnMut(TimeSlot, &RmidTracker),
    {
        let slots = self.aggregator.reset();
        let count = slots.len();
        for slot in slots {
            emit(slot, &self.rmids);
        }
        count
    }

    fn drain_merger<F>(
        &mut self,
        merger: &mut Merger<'_>,
        summary: &mut PollSummary,
        emit: &mut F,
    ) -> Result<(), CollectorError>
    where
        F: FnMut(TimeSlot, &RmidTracker),
    {
        while !merger.is_empty() {
            let (ring, cpu) = merger.current_ring()?;
            let record_type = ring.peek_type();
            let size = ring.peek_size()?;
            self.scratch.clear();
            self.scratch.resize(size, 0);
            ring.peek_copy(&mut self.scratch, 0)?;
            merger.pop()?;
            summary.records += 1;

            let message = match parse_record(record_type, &self.scratch) {
                Ok(message) => message,
                Err(e) => {
                    self.stats.record_decode_error();
                    summary.decode_errors += 1;
                    tracing::debug!(cpu, record_type, error = %e, "skipping undecodable record");
                    continue;
                }
            };
            if let Message::Measurement(m) = &message {
                if let Err(e) = Aggregator::check(m) {
                    self.stats.record_decode_error();
                    summary.decode_errors += 1;
                    tracing::debug!(cpu, entity = m.entity_id, error = %e, "skipping measurement");
                    continue;
                }
            }
            self.stats.record(message.kind());

            match message {
                Message::Measurement(m) => {
                    self.rmids.advance(m.end_timestamp_ns);
                    for slot in self.aggregator.advance_window(m.end_timestamp_ns, m.duration_ns) {
                        summary.slots_emitted += 1;
                        emit(slot, &self.rmids);
                    }
                    self.aggregator.update(&m)?;
                    summary.measurements += 1;
                }
                Message::Lost(lost) => {
                    self.stats.record_lost(lost.lost);
                    summary.lost_samples += lost.lost;
                    tracing::debug!(cpu, lost = lost.lost, "kernel dropped records");
                }
                Message::RmidAlloc(alloc) => {
                    tracing::debug!(
                        rmid = alloc.rmid,
                        tgid = alloc.tgid,
                        comm = %alloc.comm_str(),
                        "rmid allocated"
                    );
                    self.rmids.alloc(&alloc);
                }
                Message::RmidFree(free) => {
                    tracing::debug!(rmid = free.rmid, "rmid freed");
                    self.rmids.free(&free);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{AggregatorConfig, Measurement};
    use crate::perf::{MemoryRingStorage, RingStorage, PERF_RECORD_LOST, PERF_RECORD_SAMPLE};
    use crate::protocol::message::{encode_measurement, LostRecords, RmidAlloc, RmidFree, TASK_COMM_LEN};
    use crate::protocol::MessageKind;

    const MS: u64 = 1_000_000;

    fn collector(window_size: u32) -> Collector {
        let aggregator = Aggregator::new(AggregatorConfig {
            slot_length_ns: MS,
            window_size,
            slot_offset_ns: 0,
        })
        .expect("valid config");
        Collector::new(aggregator)
    }

    fn rings(count: usize) -> (Vec<PerfRing>, Vec<PerfRing>) {
        let mut producers = Vec::new();
        let mut consumers = Vec::new();
        for _ in 0..count {
            let storage: Arc<dyn RingStorage> =
                Arc::new(MemoryRingStorage::with_page_size(64, 64).expect("allocate"));
            producers.push(PerfRing::new(Arc::clone(&storage)).expect("producer"));
            consumers.push(PerfRing::new(storage).expect("consumer"));
        }
        (producers, consumers)
    }

    fn send(ring: &mut PerfRing, m: &Measurement) {
        ring.write(&encode_measurement(m), PERF_RECORD_SAMPLE)
            .expect("write");
        ring.finish_write_batch();
    }

    fn m(entity_id: u32, cycles: u64, end: u64) -> Measurement {
        Measurement {
            entity_id,
            cycles,
            instructions: cycles,
            llc_misses: 1,
            end_timestamp_ns: end,
            duration_ns: 500_000,
        }
    }

    #[test]
    fn test_poll_aggregates_across_rings() {
        let (mut producers, mut consumers) = rings(2);
        send(&mut producers[0], &m(1, 100, 2_600_000));
        send(&mut producers[1], &m(1, 50, 2_700_000));
        send(&mut producers[1], &m(2, 10, 2_800_000));

        let mut collector = collector(4);
        let mut emitted = Vec::new();
        let summary = collector
            .poll(&mut consumers, |slot, _| emitted.push(slot))
            .expect("poll");

        assert_eq!(summary.records, 3);
        assert_eq!(summary.measurements, 3);
        assert!(emitted.is_empty());

        let newest = collector.aggregator().slots().last().expect("window");
        assert_eq!(newest.start_time, 2 * MS);
        assert_eq!(newest.aggregations[&1].cycles, 150);
        assert_eq!(newest.aggregations[&2].cycles, 10);
    }

    #[test]
    fn test_poll_emits_evicted_slots_in_order() {
        let (mut producers, mut consumers) = rings(1);
        let mut collector = collector(2);

        send(&mut producers[0], &m(1, 100, 1_600_000));
        send(&mut producers[0], &m(1, 100, 4_600_000));

        let mut emitted = Vec::new();
        let summary = collector
            .poll(&mut consumers, |slot, _| emitted.push(slot))
            .expect("poll");

        assert_eq!(summary.slots_emitted, 2);
        let starts: Vec<u64> = emitted.iter().map(|s| s.start_time).collect();
        assert_eq!(starts, vec![0, MS]);
        assert_eq!(emitted[1].aggregations[&1].cycles, 100);

        let drained = collector.drain(|slot, _| emitted.push(slot));
        assert_eq!(drained, 2);
        assert_eq!(collector.aggregator().slots().len(), 0);
    }

    #[test]
    fn test_poll_counts_lost_and_bad_records() {
        let (mut producers, mut consumers) = rings(2);
        send(&mut producers[0], &m(1, 100, 5 * MS));
        producers[1]
            .write(&LostRecords { id: 0, lost: 12 }.to_bytes(), PERF_RECORD_LOST)
            .expect("lost");
        producers[1]
            .write(&[0xff; 12], PERF_RECORD_SAMPLE)
            .expect("garbage");
        producers[1]
            .write(
                &RmidFree {
                    timestamp_ns: 6 * MS,
                    rmid: 1,
                }
                .to_bytes(),
                PERF_RECORD_SAMPLE,
            )
            .expect("free");
        producers[1].finish_write_batch();

        let mut collector = collector(4);
        let summary = collector.poll(&mut consumers, |_, _| {}).expect("poll");

        assert_eq!(summary.records, 4);
        assert_eq!(summary.measurements, 1);
        assert_eq!(summary.lost_samples, 12);
        assert_eq!(summary.decode_errors, 1);

        let snap = collector.stats().snapshot();
        assert_eq!(snap.count(MessageKind::Lost), 1);
        assert_eq!(snap.count(MessageKind::RmidFree), 1);
        assert_eq!(snap.lost_samples, 12);
        assert_eq!(snap.decode_errors, 1);
    }

    #[test]
    fn test_poll_skips_unplaceable_measurement() {
        let (mut producers, mut consumers) = rings(1);
        let mut bad = m(1, 999, 2_600_000);
        bad.duration_ns = u64::MAX;
        send(&mut producers[0], &bad);
        send(&mut producers[0], &m(1, 100, 2_700_000));

        let mut collector = collector(4);
        let summary = collector.poll(&mut consumers, |_, _| {}).expect("poll");

        assert_eq!(summary.records, 2);
        assert_eq!(summary.measurements, 1);
        assert_eq!(summary.decode_errors, 1);

        let snap = collector.stats().snapshot();
        assert_eq!(snap.count(MessageKind::Measurement), 1);
        assert_eq!(snap.decode_errors, 1);

        let newest = collector.aggregator().slots().last().expect("window");
        assert_eq!(newest.start_time, 2 * MS);
        assert_eq!(newest.aggregations[&1].cycles, 100);
    }

    #[test]
    fn test_emitted_slots_see_rmid_metadata() {
        let (mut producers, mut consumers) = rings(1);
        let mut comm = [0u8; TASK_COMM_LEN];
        comm[..5].copy_from_slice(b"nginx");
        let alloc = |rmid: u32, timestamp_ns: u64| RmidAlloc {
            timestamp_ns,
            rmid,
            comm,
            tgid: 4242,
        };

        producers[0].write(&alloc(7, MS).to_bytes(), PERF_RECORD_SAMPLE).expect("alloc");
        send(&mut producers[0], &m(7, 100, 1_600_000));
        producers[0]
            .write(
                &RmidFree {
                    timestamp_ns: 2 * MS,
                    rmid: 7,
                }
                .to_bytes(),
                PERF_RECORD_SAMPLE,
            )
            .expect("free");
        send(&mut producers[0], &m(7, 100, 4_600_000));
        producers[0].write(&alloc(8, 10 * MS).to_bytes(), PERF_RECORD_SAMPLE).expect("alloc");
        producers[0].finish_write_batch();

        let mut collector = collector(2);
        let mut emitted = Vec::new();
        collector
            .poll(&mut consumers, |slot, rmids| {
                emitted.push((slot.start_time, rmids.get(7).cloned()))
            })
            .expect("poll");

        assert_eq!(emitted.len(), 2);
        let (start, meta) = &emitted[1];
        assert_eq!(*start, MS);
        let meta = meta.as_ref().expect("rmid 7 known when its slot closed");
        assert_eq!(meta.comm, "nginx");
        assert_eq!(meta.tgid, 4242);
        assert!(!meta.valid);

        // The alloc at 10ms lies past every measurement seen so far.
        assert!(collector.rmids().get(8).is_none());
        assert_eq!(collector.rmids().pending(), 1);
    }

    #[test]
    fn test_poll_releases_ring_space() {
        let (mut producers, mut consumers) = rings(1);
        let mut collector = collector(4);

        // Ring is 4 KiB; 64-byte records fill it in 64 writes.
        for round in 0..4u64 {
            producers[0].start_write_batch();
            for i in 0..64u64 {
                let end = (round * 64 + i) * 10_000 + MS;
                producers[0]
                    .write(&encode_measurement(&m(1, 1, end)), PERF_RECORD_SAMPLE)
                    .expect("space released by previous poll");
            }
            producers[0].finish_write_batch();
            let summary = collector.poll(&mut consumers, |_, _| {}).expect("poll");
            assert_eq!(summary.measurements, 64);
        }
    }

    #[test]
    fn test_poll_without_rings_fails() {
        let mut collector = collector(4);
        let err = collector.poll(&mut [], |_, _| {}).expect_err("no rings");
        assert!(matches!(err, CollectorError::Merger(MergerError::NoRings)));
    }
}
