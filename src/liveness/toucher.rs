//! Periodic touch thread shared by many writable segments

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::{
    clock::now_micros,
    config::DEFAULT_TOUCH_PERIOD,
    error::{Result, StoreError},
    segment::Segment,
};

lazy_static::lazy_static! {
    static ref GLOBAL_TOUCHER: Toucher = Toucher::new(DEFAULT_TOUCH_PERIOD);
}

struct Shared {
    segments: Mutex<Vec<Arc<Segment>>>,
    stop: AtomicBool,
}

impl Shared {
    fn segments(&self) -> MutexGuard<'_, Vec<Arc<Segment>>> {
        // a panic while holding the lock leaves the list itself intact
        self.segments.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Touch every segment; detached ones are dropped from the list
    fn touch_all(&self, now: i64) -> Result<usize> {
        let mut segments = self.segments();
        let mut failure = None;

        segments.retain(|segment| match segment.touch(now) {
            Ok(()) => true,
            Err(StoreError::Detached { name }) => {
                log::warn!("toucher: {} was destroyed, no longer touching it", name);
                false
            }
            Err(e) => {
                if failure.is_none() {
                    failure = Some(e);
                }
                true
            }
        });

        match failure {
            Some(e) => Err(e),
            None => Ok(segments.len()),
        }
    }
}

/// Background thread stamping `touch(now)` on registered segments
pub struct Toucher {
    period: Duration,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Toucher {
    /// Create a toucher without starting its thread
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            shared: Arc::new(Shared {
                segments: Mutex::new(Vec::new()),
                stop: AtomicBool::new(false),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Create a toucher and start its thread
    pub fn spawn(period: Duration) -> Result<Self> {
        let toucher = Self::new(period);
        toucher.start()?;
        Ok(toucher)
    }

    /// Process-wide toucher, started on first `add`
    pub fn global() -> &'static Toucher {
        &GLOBAL_TOUCHER
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    fn handle(&self) -> MutexGuard<'_, Option<JoinHandle<Result<()>>>> {
        self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start the thread if it is not running; a zero period never starts one
    pub fn start(&self) -> Result<()> {
        let mut handle = self.handle();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) || self.period.is_zero() {
            return Ok(());
        }

        self.shared.stop.store(false, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let period = self.period;

        let spawned = thread::Builder::new()
            .name("seqstore-toucher".to_string())
            .spawn(move || touch_loop(&shared, period))
            .map_err(|e| StoreError::from_io(e, "spawn toucher thread"))?;
        *handle = Some(spawned);

        log::debug!("toucher started with period {:?}", period);
        Ok(())
    }

    /// Register a writable segment and touch it immediately.
    ///
    /// Adding the same segment twice is a no-op.
    pub fn add(&self, segment: Arc<Segment>) -> Result<()> {
        segment.touch(now_micros())?;
        {
            let mut segments = self.shared.segments();
            if !segments.iter().any(|s| Arc::ptr_eq(s, &segment)) {
                segments.push(segment);
            }
        }
        self.start()
    }

    /// Unregister a segment
    pub fn remove(&self, segment: &Arc<Segment>) -> Result<()> {
        let mut segments = self.shared.segments();
        match segments.iter().position(|s| Arc::ptr_eq(s, segment)) {
            Some(index) => {
                segments.swap_remove(index);
                Ok(())
            }
            None => Err(StoreError::segment_not_found(segment.name())),
        }
    }

    /// Touch every registered segment now, returning how many were touched
    pub fn touch_all(&self) -> Result<usize> {
        self.shared.touch_all(now_micros())
    }

    pub fn len(&self) -> usize {
        self.shared.segments().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.handle().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop and join the thread, returning its final status
    pub fn stop(&self) -> Result<()> {
        let Some(handle) = self.handle().take() else {
            return Ok(());
        };

        self.shared.stop.store(true, Ordering::Release);
        handle.thread().unpark();

        match handle.join() {
            Ok(status) => status,
            Err(_) => Err(StoreError::Io {
                message: "toucher thread panicked".to_string(),
                source: None,
            }),
        }
    }
}

impl Drop for Toucher {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("toucher stopped with error: {}", e);
        }
    }
}

impl std::fmt::Debug for Toucher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toucher")
            .field("period", &self.period)
            .field("segments", &self.len())
            .field("running", &self.is_running())
            .finish()
    }
}

fn touch_loop(shared: &Shared, period: Duration) -> Result<()> {
    while !shared.stop.load(Ordering::Acquire) {
        if let Err(e) = shared.touch_all(now_micros()) {
            log::error!("toucher failed: {}", e);
            return Err(e);
        }
        thread::park_timeout(period);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::memory::SegmentConfig;
    use tempfile::TempDir;

    fn segment(dir: &TempDir, file: &str) -> Arc<Segment> {
        let name = dir.path().join(file).to_string_lossy().into_owned();
        Arc::new(Segment::create(SegmentConfig::new(name, 4, 8)).unwrap())
    }

    #[test]
    fn test_add_touches_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let toucher = Toucher::new(Duration::ZERO);
        let seg = segment(&dir, "t1.stg");

        toucher.add(Arc::clone(&seg)).unwrap();
        toucher.add(Arc::clone(&seg)).unwrap();
        assert_eq!(toucher.len(), 1);
        assert!(seg.touched_time().unwrap() > 0);
        assert!(!toucher.is_running());

        toucher.remove(&seg).unwrap();
        assert_eq!(toucher.remove(&seg).unwrap_err().code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_read_only_segment_rejected() {
        let dir = TempDir::new().unwrap();
        let writer = segment(&dir, "t2.stg");
        let reader = Arc::new(Segment::open(&writer.name()).unwrap());

        let toucher = Toucher::new(Duration::ZERO);
        assert_eq!(toucher.add(reader).unwrap_err().code(), ErrorCode::ReadOnly);
        assert!(toucher.is_empty());
    }

    #[test]
    fn test_thread_touches_periodically() {
        let dir = TempDir::new().unwrap();
        let seg = segment(&dir, "t3.stg");
        let toucher = Toucher::spawn(Duration::from_millis(5)).unwrap();
        toucher.add(Arc::clone(&seg)).unwrap();

        let first = seg.touched_time().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(seg.touched_time().unwrap() > first);
        assert!(toucher.is_running());

        toucher.stop().unwrap();
        assert!(!toucher.is_running());
    }
}
