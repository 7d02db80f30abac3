//! Integration tests for segment lifecycle and single-record access
//!
//! Tests cover create/open/destroy, round trips, revision ordering,
//! validation errors, detach on recreate, stale lock recovery and
//! header corruption.

use std::{fs, os::unix::fs::FileExt, time::Duration};

use seqstore::{
    memory::SegmentName, ErrorCode, Segment, SegmentConfig, SpinPolicy, StoreError,
};
use tempfile::TempDir;

fn segment_path(dir: &TempDir, file: &str) -> String {
    dir.path().join(file).to_string_lossy().into_owned()
}

#[cfg(test)]
mod segment_tests {
    use super::*;

    /// Test: Written bytes come back unchanged with a newer revision
    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let name = segment_path(&dir, "round_trip.stg");
        let writer = Segment::create(SegmentConfig::new(&name, 100, 32).with_description("PRINTS")).unwrap();
        let reader = Segment::open(&name).unwrap();

        let mut previous = 0;
        for round in 0..5u8 {
            let value = [round; 32];
            let written = writer.write_record(42, &value).unwrap();

            let mut buf = [0u8; 32];
            let read = reader.read_record(42, &mut buf).unwrap();
            assert_eq!(buf, value);
            assert_eq!(read.revision, written);
            assert!(read.revision > previous);
            previous = read.revision;
        }

        assert_eq!(reader.description(), "PRINTS");
        assert_eq!(reader.max_id(), 100);
        assert_eq!(reader.owner_pid(), std::process::id());
    }

    /// Test: Sequential writes give strictly increasing revisions
    #[test]
    fn test_monotonic_revisions() {
        let dir = TempDir::new().unwrap();
        let segment = Segment::create(SegmentConfig::new(segment_path(&dir, "mono.stg"), 8, 8)).unwrap();

        let mut buf = [0u8; 8];
        let revisions: Vec<i64> = (0..50u64)
            .map(|i| {
                segment.write_record(3, &i.to_le_bytes()).unwrap();
                segment.read_record(3, &mut buf).unwrap().revision
            })
            .collect();

        assert!(revisions.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(u64::from_le_bytes(buf), 49);
    }

    /// Test: Every slot of a fresh segment is unwritten
    #[test]
    fn test_unwritten_slots() {
        let dir = TempDir::new().unwrap();
        let segment = Segment::create(SegmentConfig::new(segment_path(&dir, "fresh.stg"), 16, 8)).unwrap();

        let mut buf = [0u8; 8];
        for id in 0..16 {
            let err = segment.read_record(id, &mut buf).unwrap_err();
            assert!(matches!(err, StoreError::RecordNotFound { .. }));
            assert_eq!(err.code(), ErrorCode::NotFound);
        }
        assert_eq!(segment.used_ids().count(), 0);
    }

    /// Test: Ids outside [base_id, max_id) are rejected without side effects
    #[test]
    fn test_out_of_range() {
        let dir = TempDir::new().unwrap();
        let config = SegmentConfig::new(segment_path(&dir, "range.stg"), 20, 8).with_base_id(10);
        let segment = Segment::create(config).unwrap();

        let mut buf = [0u8; 8];
        for id in [9, 20, -1, i64::MAX] {
            assert_eq!(segment.read_record(id, &mut buf).unwrap_err().code(), ErrorCode::OutOfRange);
            assert_eq!(segment.write_record(id, &buf).unwrap_err().code(), ErrorCode::OutOfRange);
        }
        assert_eq!(segment.queue_head(), 0);

        segment.write_record(10, &buf).unwrap();
        segment.write_record(19, &buf).unwrap();
        assert_eq!(segment.used_ids().collect::<Vec<_>>(), vec![10, 19]);
    }

    /// Test: Bad geometry is rejected before anything is created
    #[test]
    fn test_invalid_geometry() {
        let dir = TempDir::new().unwrap();
        let name = segment_path(&dir, "invalid.stg");

        let bad = [
            SegmentConfig::new(&name, 0, 8),
            SegmentConfig::new(&name, 10, 0),
            SegmentConfig::new(&name, 10, 8).with_queue_capacity(0),
            SegmentConfig::new(&name, 10, 8).with_queue_capacity(1000),
        ];
        for config in bad {
            let err = Segment::create(config).unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidArgument);
        }
        assert!(!dir.path().join("invalid.stg").exists());
    }

    /// Test: Opening a missing segment is NotFound
    #[test]
    fn test_open_missing() {
        let dir = TempDir::new().unwrap();
        let err = Segment::open(&segment_path(&dir, "missing.stg")).unwrap_err();
        assert!(matches!(err, StoreError::SegmentNotFound { .. }));
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    /// Test: Destroyed segments cannot be reopened and detach their readers
    #[test]
    fn test_destroy_then_open() {
        let dir = TempDir::new().unwrap();
        let name = segment_path(&dir, "destroy.stg");
        let writer = Segment::create(SegmentConfig::new(&name, 4, 8)).unwrap();
        writer.write_record(1, &[1u8; 8]).unwrap();
        let reader = Segment::open(&name).unwrap();

        writer.destroy().unwrap();
        assert_eq!(Segment::open(&name).unwrap_err().code(), ErrorCode::NotFound);

        let mut buf = [0u8; 8];
        let err = reader.read_record(1, &mut buf).unwrap_err();
        assert!(matches!(err, StoreError::Detached { .. }));
        assert!(!reader.is_linked());

        // destroying a reader handle only unmaps
        reader.destroy().unwrap();
        assert!(!Segment::delete(&name).unwrap());
    }

    /// Test: Recreating a segment detaches readers of the old one
    #[test]
    fn test_recreate_detaches_old_readers() {
        let dir = TempDir::new().unwrap();
        let name = segment_path(&dir, "recreate.stg");
        let first = Segment::create(SegmentConfig::new(&name, 4, 8)).unwrap();
        first.write_record(2, &[7u8; 8]).unwrap();
        let old_reader = Segment::open(&name).unwrap();

        let second = Segment::create(SegmentConfig::new(&name, 4, 8).with_description("NEW")).unwrap();
        let new_reader = Segment::open(&name).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(old_reader.read_record(2, &mut buf).unwrap_err().code(), ErrorCode::NotFound);
        assert!(matches!(old_reader.check_attached(), Err(StoreError::Detached { .. })));

        // the new segment starts empty, never showing the old contents
        assert!(matches!(new_reader.read_record(2, &mut buf), Err(StoreError::RecordNotFound { .. })));
        assert_eq!(new_reader.description(), "NEW");
        assert!(new_reader.created_time() >= old_reader.created_time());
        drop(second);
    }

    /// Test: A lock bit left by a dead writer is cleared on writable reopen
    #[test]
    fn test_stale_lock_recovery() {
        let dir = TempDir::new().unwrap();
        let name = segment_path(&dir, "stale.stg");
        let writer = Segment::create(SegmentConfig::new(&name, 8, 8)).unwrap();
        let revision = writer.write_record(5, &[5u8; 8]).unwrap();
        let offset = writer.geometry().slot_offset(5).unwrap();
        drop(writer);

        // set the sign bit of the little-endian revision word
        let file = fs::OpenOptions::new().read(true).write(true).open(&name).unwrap();
        let mut top = [0u8; 1];
        file.read_at(&mut top, offset as u64 + 7).unwrap();
        file.write_at(&[top[0] | 0x80], offset as u64 + 7).unwrap();

        let quick = SpinPolicy::new(10, Duration::from_micros(50), Duration::from_millis(5));
        let reader = Segment::open_with(&name, false, quick).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(reader.read_record(5, &mut buf).unwrap_err().code(), ErrorCode::WouldBlock);

        let reopened = Segment::open_writable(&name).unwrap();
        assert_eq!(reopened.owner_pid(), std::process::id());
        let read = reader.read_record(5, &mut buf).unwrap();
        assert_eq!(read.revision, revision);
        assert_eq!(buf, [5u8; 8]);
    }

    /// Test: Files that are not segments are reported as corrupt
    #[test]
    fn test_corrupt_headers() {
        let dir = TempDir::new().unwrap();

        let garbage = segment_path(&dir, "garbage.stg");
        fs::write(&garbage, vec![0xEEu8; 8192]).unwrap();
        assert_eq!(Segment::open(&garbage).unwrap_err().code(), ErrorCode::Corrupt);

        let short = segment_path(&dir, "short.stg");
        fs::write(&short, b"seqstore").unwrap();
        assert_eq!(Segment::open(&short).unwrap_err().code(), ErrorCode::Corrupt);

        let empty = segment_path(&dir, "empty.stg");
        fs::write(&empty, b"").unwrap();
        assert_eq!(Segment::open(&empty).unwrap_err().code(), ErrorCode::Corrupt);
    }

    /// Test: Writer-only operations are refused through a reader
    #[test]
    fn test_reader_cannot_write() {
        let dir = TempDir::new().unwrap();
        let name = segment_path(&dir, "ro.stg");
        let _writer = Segment::create(SegmentConfig::new(&name, 4, 8)).unwrap();
        let reader = Segment::open(&name).unwrap();

        for err in [
            reader.write_record(0, &[0u8; 8]).unwrap_err(),
            reader.clear_record(0).unwrap_err(),
            reader.touch(1).unwrap_err(),
            reader.reset().unwrap_err(),
        ] {
            assert_eq!(err.code(), ErrorCode::ReadOnly);
        }
    }

    /// Test: Header snapshot serializes for tooling
    #[test]
    fn test_info_json() {
        let dir = TempDir::new().unwrap();
        let name = segment_path(&dir, "info.stg");
        let segment = Segment::create(SegmentConfig::new(&name, 64, 16).with_description("QUOTES")).unwrap();
        segment.write_record(1, &[0u8; 16]).unwrap();
        segment.sync().unwrap();

        let json = serde_json::to_value(segment.info()).unwrap();
        assert_eq!(json["description"], "QUOTES");
        assert_eq!(json["geometry"]["max_id"], 64);
        assert_eq!(json["queue_head"], 1);
        assert_eq!(json["owner_alive"], true);
    }

    /// Test: POSIX shared-memory names work end to end
    #[test]
    fn test_shm_segment() {
        let name = format!("shm:seqstore-test-{}", std::process::id());
        assert!(SegmentName::parse(&name).unwrap().is_shm());

        let writer = Segment::create(SegmentConfig::new(&name, 4, 8)).unwrap();
        writer.write_record(3, &[3u8; 8]).unwrap();

        let reader = Segment::open(&name).unwrap();
        let mut buf = [0u8; 8];
        reader.read_record(3, &mut buf).unwrap();
        assert_eq!(buf, [3u8; 8]);

        writer.destroy().unwrap();
        assert_eq!(Segment::open(&name).unwrap_err().code(), ErrorCode::NotFound);
    }
}
