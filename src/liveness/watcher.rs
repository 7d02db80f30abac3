//! Reader-side staleness watcher

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::{
    clock::{duration_micros, now_micros, Microsec},
    error::{Result, StoreError},
    segment::Segment,
};

struct WatchState {
    stop: AtomicBool,
    stale_count: AtomicU64,
}

/// Polls a segment's touch stamp and reports when it goes stale.
///
/// The callback fires once per staleness window: after firing it stays
/// quiet until the writer touches again and then lapses again.
pub struct LivenessWatcher {
    state: Arc<WatchState>,
    handle: Option<JoinHandle<()>>,
}

impl LivenessWatcher {
    pub fn spawn<F>(segment: Arc<Segment>, check_interval: Duration, threshold: Duration, on_stale: F) -> Result<Self>
    where
        F: FnMut(&Segment, Microsec) + Send + 'static,
    {
        if check_interval.is_zero() {
            return Err(StoreError::invalid_argument(
                "check_interval",
                "Check interval must be greater than 0",
            ));
        }

        let state = Arc::new(WatchState {
            stop: AtomicBool::new(false),
            stale_count: AtomicU64::new(0),
        });
        let thread_state = Arc::clone(&state);

        let handle = thread::Builder::new()
            .name("seqstore-watcher".to_string())
            .spawn(move || watch_loop(&segment, &thread_state, check_interval, threshold, on_stale))
            .map_err(|e| StoreError::from_io(e, "spawn liveness watcher"))?;

        Ok(Self {
            state,
            handle: Some(handle),
        })
    }

    /// Number of times the callback has fired
    pub fn stale_count(&self) -> u64 {
        self.state.stale_count.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.state.stop.store(true, Ordering::Release);
        handle.thread().unpark();
        if handle.join().is_err() {
            log::error!("liveness watcher panicked");
        }
    }
}

impl Drop for LivenessWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for LivenessWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessWatcher")
            .field("stale_count", &self.stale_count())
            .field("running", &self.is_running())
            .finish()
    }
}

fn watch_loop<F>(segment: &Segment, state: &WatchState, interval: Duration, threshold: Duration, mut on_stale: F)
where
    F: FnMut(&Segment, Microsec),
{
    let threshold = duration_micros(threshold);
    // touch value the callback last fired for
    let mut reported: Option<Microsec> = None;

    while !state.stop.load(Ordering::Acquire) {
        let last_touch = match segment.touched_time() {
            Ok(t) => t,
            Err(e) => {
                log::warn!("liveness watcher on {} stopping: {}", segment.name(), e);
                return;
            }
        };

        if now_micros() - last_touch >= threshold {
            if reported != Some(last_touch) {
                log::warn!(
                    "{}: writer pid {} has not touched for {}us",
                    segment.name(),
                    segment.owner_pid(),
                    now_micros() - last_touch
                );
                reported = Some(last_touch);
                state.stale_count.fetch_add(1, Ordering::AcqRel);
                on_stale(segment, last_touch);
            }
        } else {
            reported = None;
        }

        thread::park_timeout(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SegmentConfig;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[test]
    fn test_fires_once_per_window() {
        let dir = TempDir::new().unwrap();
        let name = dir.path().join("w.stg").to_string_lossy().into_owned();
        let writer = Segment::create(SegmentConfig::new(name.clone(), 4, 8)).unwrap();
        writer.touch(now_micros()).unwrap();

        let reader = Arc::new(Segment::open(&name).unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mut watcher = LivenessWatcher::spawn(
            reader,
            Duration::from_millis(2),
            Duration::from_millis(20),
            move |_, last| sink.lock().unwrap().push(last),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(100));
        assert_eq!(watcher.stale_count(), 1);

        // a fresh touch re-arms the watcher
        writer.touch(now_micros()).unwrap();
        thread::sleep(Duration::from_millis(100));
        watcher.stop();

        assert_eq!(watcher.stale_count(), 2);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let dir = TempDir::new().unwrap();
        let name = dir.path().join("z.stg").to_string_lossy().into_owned();
        let segment = Arc::new(Segment::create(SegmentConfig::new(name, 4, 8)).unwrap());
        assert!(LivenessWatcher::spawn(segment, Duration::ZERO, Duration::from_secs(1), |_, _| {}).is_err());
    }
}
