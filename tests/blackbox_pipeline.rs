use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use llcwatch::aggregate::{Aggregator, AggregatorConfig, Measurement, TimeSlot};
use llcwatch::collector::Collector;
use llcwatch::perf::{
    MemoryRingStorage, Merger, PerfRing, RingError, RingStorage, PERF_RECORD_LOST,
    PERF_RECORD_SAMPLE,
};
use llcwatch::protocol::message::{encode_measurement, LostRecords, RmidAlloc, RmidFree};
use llcwatch::protocol::{parse_record, Message, MessageKind};

const MS: u64 = 1_000_000;

fn storage(page_size: u64, data_pages: u32) -> Arc<dyn RingStorage> {
    Arc::new(MemoryRingStorage::with_page_size(data_pages, page_size).expect("allocate ring"))
}

/// Producer and consumer views over fresh rings of 4 KiB each.
fn ring_pairs(count: usize) -> (Vec<PerfRing>, Vec<PerfRing>) {
    let mut producers = Vec::with_capacity(count);
    let mut consumers = Vec::with_capacity(count);
    for _ in 0..count {
        let shared = storage(4096, 1);
        producers.push(PerfRing::new(Arc::clone(&shared)).expect("producer"));
        consumers.push(PerfRing::new(shared).expect("consumer"));
    }
    (producers, consumers)
}

fn measurement(entity_id: u32, cycles: u64, end: u64, duration: u64) -> Measurement {
    Measurement {
        entity_id,
        cycles,
        instructions: cycles * 2,
        llc_misses: cycles / 10,
        end_timestamp_ns: end,
        duration_ns: duration,
    }
}

fn publish(ring: &mut PerfRing, batch: &[Measurement]) {
    ring.start_write_batch();
    for m in batch {
        ring.write(&encode_measurement(m), PERF_RECORD_SAMPLE)
            .expect("ring has space");
    }
    ring.finish_write_batch();
}

fn collector(slot_length_ns: u64, window_size: u32, slot_offset_ns: u64) -> Collector {
    let aggregator = Aggregator::new(AggregatorConfig {
        slot_length_ns,
        window_size,
        slot_offset_ns,
    })
    .expect("valid aggregator config");
    Collector::new(aggregator)
}

fn totals(slots: &[TimeSlot]) -> HashMap<u32, (u64, u64, u64)> {
    let mut out: HashMap<u32, (u64, u64, u64)> = HashMap::new();
    for slot in slots {
        for (entity, agg) in &slot.aggregations {
            let entry = out.entry(*entity).or_default();
            entry.0 += agg.cycles;
            entry.1 += agg.instructions;
            entry.2 += agg.llc_misses;
        }
    }
    out
}

#[test]
fn pipeline_conserves_counters_across_cpus() {
    let (mut producers, mut consumers) = ring_pairs(4);

    // Each CPU reports its own entities in increasing time order; spans
    // cross slot boundaries.
    for (cpu, producer) in producers.iter_mut().enumerate() {
        let cpu = cpu as u64;
        let batch: Vec<Measurement> = (0..10u64)
            .map(|i| {
                let end = MS + i * 700_000 + cpu * 50_000;
                measurement(cpu as u32 + 1, 1_000 + i, end, 600_000)
            })
            .collect();
        publish(producer, &batch);
    }

    let mut collector = collector(MS, 16, 0);
    let mut slots = Vec::new();
    let summary = collector
        .poll(&mut consumers, |slot, _| slots.push(slot))
        .expect("poll");
    assert_eq!(summary.records, 40);
    assert_eq!(summary.measurements, 40);
    assert_eq!(summary.decode_errors, 0);

    collector.drain(|slot, _| slots.push(slot));

    let totals = totals(&slots);
    for entity in 1..=4u32 {
        let expected_cycles: u64 = (0..10u64).map(|i| 1_000 + i).sum();
        let expected_llc: u64 = (0..10u64).map(|i| (1_000 + i) / 10).sum();
        assert_eq!(
            totals[&entity],
            (expected_cycles, expected_cycles * 2, expected_llc),
            "entity {entity}"
        );
    }

    // Emitted slots are contiguous and in time order.
    for pair in slots.windows(2) {
        assert_eq!(pair[0].end_time, pair[1].start_time);
    }
}

#[test]
fn pipeline_emits_slots_as_time_moves_on() {
    let (mut producers, mut consumers) = ring_pairs(2);
    let mut collector = collector(MS, 4, 0);
    let mut slots = Vec::new();

    // Window holds 7..=10ms.
    publish(&mut producers[0], &[measurement(7, 100, 10 * MS + 500_000, 1_000)]);
    collector
        .poll(&mut consumers, |slot, _| slots.push(slot))
        .expect("first poll");
    assert!(slots.is_empty());

    // Two steps forward: 7ms and 8ms age out.
    publish(&mut producers[1], &[measurement(7, 50, 12 * MS + 500_000, 1_000)]);
    collector
        .poll(&mut consumers, |slot, _| slots.push(slot))
        .expect("second poll");
    let starts: Vec<u64> = slots.iter().map(|s| s.start_time).collect();
    assert_eq!(starts, vec![7 * MS, 8 * MS]);
    assert!(slots.iter().all(TimeSlot::is_empty));

    // A jump past the whole window flushes everything held.
    slots.clear();
    publish(&mut producers[0], &[measurement(7, 1, 30 * MS + 500_000, 1_000)]);
    collector
        .poll(&mut consumers, |slot, _| slots.push(slot))
        .expect("third poll");
    let starts: Vec<u64> = slots.iter().map(|s| s.start_time).collect();
    assert_eq!(starts, vec![9 * MS, 10 * MS, 11 * MS, 12 * MS]);
    assert_eq!(slots[1].aggregations[&7].cycles, 100);
    assert_eq!(slots[3].aggregations[&7].cycles, 50);

    let newest = collector.aggregator().slots().last().expect("window");
    assert_eq!(newest.start_time, 30 * MS);
    assert_eq!(newest.aggregations[&7].cycles, 1);
}

#[test]
fn pipeline_applies_slot_offset() {
    let (mut producers, mut consumers) = ring_pairs(1);
    let mut collector = collector(MS, 4, 250_000);

    // 1.0ms..2.0ms straddles the slot boundary at 1.25ms.
    publish(&mut producers[0], &[measurement(3, 1_000, 2 * MS, MS)]);
    collector.poll(&mut consumers, |_, _| {}).expect("poll");

    let mut slots = Vec::new();
    collector.drain(|slot, _| slots.push(slot));
    let held: Vec<(u64, u64)> = slots
        .iter()
        .filter_map(|s| s.aggregations.get(&3).map(|a| (s.start_time, a.cycles)))
        .collect();
    assert_eq!(held, vec![(250_000, 250), (1_250_000, 750)]);
}

#[test]
fn pipeline_skips_undecodable_and_control_records() {
    let (mut producers, mut consumers) = ring_pairs(2);

    let mut comm = [0u8; 16];
    comm[..4].copy_from_slice(b"java");
    let alloc = RmidAlloc {
        timestamp_ns: MS,
        rmid: 5,
        comm,
        tgid: 4242,
    };

    producers[0].start_write_batch();
    producers[0]
        .write(&alloc.to_bytes(), PERF_RECORD_SAMPLE)
        .expect("alloc");
    producers[0]
        .write(&encode_measurement(&measurement(5, 90, 2 * MS, 10)), PERF_RECORD_SAMPLE)
        .expect("measurement");
    producers[0]
        .write(
            &RmidFree {
                timestamp_ns: 3 * MS,
                rmid: 5,
            }
            .to_bytes(),
            PERF_RECORD_SAMPLE,
        )
        .expect("free");
    producers[0].finish_write_batch();

    producers[1].start_write_batch();
    producers[1]
        .write(&LostRecords { id: 1, lost: 3 }.to_bytes(), PERF_RECORD_LOST)
        .expect("lost");
    producers[1].write(&[1, 2, 3], 17).expect("unknown type");
    producers[1].finish_write_batch();

    let mut collector = collector(MS, 8, 0);
    let summary = collector.poll(&mut consumers, |_, _| {}).expect("poll");
    assert_eq!(summary.records, 5);
    assert_eq!(summary.measurements, 1);
    assert_eq!(summary.lost_samples, 3);
    assert_eq!(summary.decode_errors, 1);

    let snapshot = collector.stats().snapshot();
    assert_eq!(snapshot.count(MessageKind::RmidAlloc), 1);
    assert_eq!(snapshot.count(MessageKind::RmidFree), 1);
    assert_eq!(snapshot.count(MessageKind::Measurement), 1);
    assert_eq!(snapshot.count(MessageKind::Lost), 1);
    assert!(consumers.iter().all(PerfRing::is_empty));
}

#[test]
fn merger_yields_global_timestamp_order() {
    let (mut producers, mut consumers) = ring_pairs(3);
    let ends = [
        vec![10, 40, 70, 100],
        vec![20, 30, 80],
        vec![5, 50, 60, 90, 110],
    ];
    for (producer, ends) in producers.iter_mut().zip(&ends) {
        let batch: Vec<Measurement> = ends
            .iter()
            .map(|&end| measurement(1, 1, end * 1_000, 0))
            .collect();
        publish(producer, &batch);
    }

    let mut merger = Merger::new();
    for ring in consumers.iter_mut() {
        merger.add_ring(ring).expect("add ring");
    }
    merger.start().expect("start");

    let mut seen = Vec::new();
    let mut buf = Vec::new();
    while !merger.is_empty() {
        let (ring, _) = merger.current_ring().expect("current");
        let record_type = ring.peek_type();
        buf.resize(ring.peek_size().expect("size"), 0);
        ring.peek_copy(&mut buf, 0).expect("copy");
        merger.pop().expect("pop");

        match parse_record(record_type, &buf).expect("decode") {
            Message::Measurement(m) => seen.push(m.end_timestamp_ns / 1_000),
            other => panic!("unexpected message {other:?}"),
        }
    }
    merger.finish();

    let mut expected: Vec<u64> = ends.iter().flatten().copied().collect();
    expected.sort_unstable();
    assert_eq!(seen, expected);
}

#[test]
fn concurrent_producers_deliver_every_record() {
    const PER_RING: u64 = 5_000;
    const RINGS: usize = 3;

    let shared: Vec<Arc<dyn RingStorage>> = (0..RINGS).map(|_| storage(4096, 1)).collect();
    let mut consumers: Vec<PerfRing> = shared
        .iter()
        .map(|s| PerfRing::new(Arc::clone(s)).expect("consumer"))
        .collect();

    let handles: Vec<_> = shared
        .iter()
        .enumerate()
        .map(|(cpu, s)| {
            let mut producer = PerfRing::new(Arc::clone(s)).expect("producer");
            thread::spawn(move || {
                let mut next = 0u64;
                while next < PER_RING {
                    producer.start_write_batch();
                    while next < PER_RING {
                        let m = measurement(cpu as u32, 1, MS + next * 1_000, 0);
                        match producer.write(&encode_measurement(&m), PERF_RECORD_SAMPLE) {
                            Ok(_) => next += 1,
                            Err(RingError::NoSpace) => break,
                            Err(e) => panic!("write failed: {e}"),
                        }
                    }
                    producer.finish_write_batch();
                    thread::yield_now();
                }
            })
        })
        .collect();

    // A window far wider than the run keeps every measurement in range.
    let mut collector = collector(MS, 64, 0);
    let mut consumed = 0u64;
    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    while consumed < PER_RING * RINGS as u64 {
        assert!(std::time::Instant::now() < deadline, "consumer stalled");
        let summary = collector.poll(&mut consumers, |_, _| {}).expect("poll");
        assert_eq!(summary.decode_errors, 0);
        consumed += summary.measurements;
        thread::yield_now();
    }

    for handle in handles {
        handle.join().expect("producer thread");
    }
    assert_eq!(consumed, PER_RING * RINGS as u64);
}
