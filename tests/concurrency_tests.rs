//! Concurrency tests: one writer, readers on separate mappings
//!
//! Each reader opens its own read-only handle, the way a reader process
//! would, so the seqlock is exercised across mappings rather than within
//! one.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Barrier,
    },
    thread,
    time::Duration,
};

use seqstore::{
    read_many, ChangeReader, OverrunPolicy, PollPolicy, RecordBatch, Segment, SegmentConfig, SpinPolicy,
    StoreError,
};
use tempfile::TempDir;

const VALUE_SIZE: usize = 256;

#[cfg(test)]
mod concurrency_tests {
    use super::*;

    /// Test: Alternating all-A / all-B writes are never observed mixed
    #[test]
    fn test_no_torn_reads_across_mappings() {
        let dir = TempDir::new().unwrap();
        let name = dir.path().join("torn.stg").to_string_lossy().into_owned();
        let writer = Segment::create(SegmentConfig::new(&name, 4, VALUE_SIZE)).unwrap();
        writer.write_record(0, &[0xAA; VALUE_SIZE]).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let barrier = Arc::new(Barrier::new(4));
        let successful = Arc::new(AtomicU64::new(0));

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let name = name.clone();
                let done = Arc::clone(&done);
                let barrier = Arc::clone(&barrier);
                let successful = Arc::clone(&successful);
                thread::spawn(move || {
                    let mut reader = Segment::open(&name).unwrap();
                    reader.set_spin_policy(SpinPolicy::unbounded());
                    let mut buf = [0u8; VALUE_SIZE];
                    let mut last = 0;
                    barrier.wait();

                    while !done.load(Ordering::Acquire) {
                        let read = reader.read_record(0, &mut buf).unwrap();
                        assert!(buf.iter().all(|&b| b == buf[0]), "torn read");
                        assert!(buf[0] == 0xAA || buf[0] == 0x55);
                        assert!(read.revision >= last, "revision went backwards");
                        last = read.revision;
                        successful.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        barrier.wait();
        for i in 0..50_000u32 {
            let fill = if i % 2 == 0 { 0x55 } else { 0xAA };
            writer.write_record(0, &[fill; VALUE_SIZE]).unwrap();
        }
        done.store(true, Ordering::Release);

        for reader in readers {
            reader.join().unwrap();
        }
        assert!(successful.load(Ordering::Relaxed) > 0);
    }

    /// Test: A tailing reader sees every change under normal load
    #[test]
    fn test_change_reader_follows_writer() {
        let dir = TempDir::new().unwrap();
        let name = dir.path().join("tail.stg").to_string_lossy().into_owned();
        let writer = Segment::create(SegmentConfig::new(&name, 1000, 8).with_queue_capacity(4096)).unwrap();
        let reader_segment = Segment::open(&name).unwrap();
        let ready = Arc::new(Barrier::new(2));

        let total = 2000u64;
        let tail = {
            let ready = Arc::clone(&ready);
            thread::spawn(move || {
                let policy = PollPolicy::new(Duration::from_micros(100), 100, Some(Duration::from_secs(5)));
                let mut reader = ChangeReader::new(&reader_segment)
                    .with_poll_policy(policy)
                    .with_overrun_policy(OverrunPolicy::Fail);
                let mut batch = RecordBatch::for_segment(&reader_segment);
                let mut seen = Vec::new();
                ready.wait();

                while (seen.len() as u64) < total {
                    if reader.poll(&mut batch, 0).unwrap() == 0 {
                        break;
                    }
                    seen.extend_from_slice(batch.ids());
                }
                seen
            })
        };

        ready.wait();
        for seq in 0..total {
            writer.write_record((seq % 1000) as i64, &seq.to_le_bytes()).unwrap();
        }

        let seen = tail.join().unwrap();
        let expected: Vec<i64> = (0..total).map(|seq| (seq % 1000) as i64).collect();
        assert_eq!(seen, expected);
    }

    /// Test: A reader that falls behind gets the newest entries and a loss count
    #[test]
    fn test_overrun_is_signalled() {
        let dir = TempDir::new().unwrap();
        let name = dir.path().join("overrun.stg").to_string_lossy().into_owned();
        let writer = Segment::create(SegmentConfig::new(&name, 100, 8).with_queue_capacity(4)).unwrap();
        let reader_segment = Segment::open(&name).unwrap();

        let mut strict = ChangeReader::new(&reader_segment)
            .with_poll_policy(PollPolicy::non_blocking())
            .with_overrun_policy(OverrunPolicy::Fail);
        let mut lenient = ChangeReader::new(&reader_segment).with_poll_policy(PollPolicy::non_blocking());

        for id in 10..20 {
            writer.write_record(id, &[id as u8; 8]).unwrap();
        }

        let mut batch = RecordBatch::for_segment(&reader_segment);
        let err = strict.poll(&mut batch, 0).unwrap_err();
        assert!(matches!(err, StoreError::Overrun { lost: 6, head: 10, capacity: 4 }));

        assert_eq!(lenient.poll(&mut batch, 0).unwrap(), 4);
        assert_eq!(batch.ids(), &[16, 17, 18, 19]);
        assert_eq!(batch.value(3).unwrap(), &[19u8; 8]);
        assert_eq!(lenient.lost(), 6);
        assert_eq!(lenient.overruns(), 1);
    }

    /// Test: Queue entries copied while the writer laps a tiny ring belong to their position
    #[test]
    fn test_lapped_queue_entries_match_position() {
        let dir = TempDir::new().unwrap();
        let name = dir.path().join("lapped.stg").to_string_lossy().into_owned();
        let writer = Segment::create(SegmentConfig::new(&name, 64, 8).with_queue_capacity(4)).unwrap();
        let reader = Segment::open(&name).unwrap();
        let done = AtomicBool::new(false);

        thread::scope(|s| {
            s.spawn(|| {
                // the timestamp doubles as the queue position
                for seq in 0..100_000i64 {
                    writer.write_record_at(seq % 64, &seq.to_le_bytes(), seq).unwrap();
                }
                done.store(true, Ordering::Release);
            });

            let queue = reader.queue();
            let mut changes = Vec::new();
            while !done.load(Ordering::Acquire) {
                let from = queue.head().saturating_sub(4);
                changes.clear();
                let read = queue.read_from(from, 0, &mut changes);

                assert_eq!(read.start, from + read.lost);
                for (k, change) in changes.iter().enumerate() {
                    assert_eq!(change.timestamp, (read.start + k as u64) as i64);
                    assert_eq!(change.id, change.timestamp % 64);
                }
            }
        });
    }

    /// Test: Batch reads stay per-record consistent while the writer runs
    #[test]
    fn test_read_many_under_writes() {
        let dir = TempDir::new().unwrap();
        let name = dir.path().join("many.stg").to_string_lossy().into_owned();
        let writer = Segment::create(SegmentConfig::new(&name, 16, 64)).unwrap();
        for id in 0..16 {
            writer.write_record(id, &[id as u8; 64]).unwrap();
        }
        let done = AtomicBool::new(false);

        thread::scope(|s| {
            s.spawn(|| {
                for round in 0..2000u32 {
                    let id = (round % 16) as i64;
                    writer.write_record(id, &[id as u8; 64]).unwrap();
                }
                done.store(true, Ordering::Release);
            });

            let reader = Segment::open(&name).unwrap();
            let ids: Vec<i64> = (0..16).collect();
            let mut batch = RecordBatch::for_segment(&reader);
            while !done.load(Ordering::Acquire) {
                read_many(&reader, &ids, &mut batch).unwrap();
                for record in batch.iter() {
                    assert!(record.value.iter().all(|&b| b == record.id as u8));
                    assert!(record.revision > 0);
                }
            }
        });
    }
}
