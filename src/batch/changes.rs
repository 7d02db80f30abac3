//! Change-queue tailing reader

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::{
    clock::now_micros,
    error::{Result, StoreError},
    queue::Change,
    segment::Segment,
};

use super::{
    latency::{Latency, LatencyStats},
    records::RecordBatch,
};

/// How a [`ChangeReader`] waits for the queue head to move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Sleep between checks once spinning is exhausted
    pub interval: Duration,
    /// Busy checks before the first sleep
    pub max_spins: u32,
    /// Give up and return zero records after this long; `None` waits forever
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1),
            max_spins: 1000,
            timeout: Some(Duration::from_millis(100)),
        }
    }
}

impl PollPolicy {
    pub fn new(interval: Duration, max_spins: u32, timeout: Option<Duration>) -> Self {
        Self {
            interval,
            max_spins,
            timeout,
        }
    }

    /// Check once and return immediately
    pub fn non_blocking() -> Self {
        Self::new(Duration::ZERO, 0, Some(Duration::ZERO))
    }
}

/// What a [`ChangeReader`] does after falling more than one capacity behind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverrunPolicy {
    /// Clamp to the oldest retained entry, count the loss and continue
    #[default]
    Resync,
    /// Return [`StoreError::Overrun`] and leave the position untouched
    Fail,
}

/// Tails a segment's change queue and re-reads the records it names
#[derive(Debug)]
pub struct ChangeReader<'a> {
    segment: &'a Segment,
    position: u64,
    poll: PollPolicy,
    on_overrun: OverrunPolicy,
    overruns: u64,
    lost: u64,
    latency: Latency,
    changes: Vec<Change>,
}

impl<'a> ChangeReader<'a> {
    /// Start at the current head: only changes from now on are seen
    pub fn new(segment: &'a Segment) -> Self {
        Self::from_position(segment, segment.queue_head())
    }

    /// Start at an explicit queue position
    pub fn from_position(segment: &'a Segment, position: u64) -> Self {
        Self {
            segment,
            position,
            poll: PollPolicy::default(),
            on_overrun: OverrunPolicy::default(),
            overruns: 0,
            lost: 0,
            latency: Latency::default(),
            changes: Vec::new(),
        }
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_overrun_policy(mut self, on_overrun: OverrunPolicy) -> Self {
        self.on_overrun = on_overrun;
        self
    }

    pub fn segment(&self) -> &'a Segment {
        self.segment
    }

    /// Next queue position to consume
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Number of reads that hit an overrun
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Total changes lost to overruns
    pub fn lost(&self) -> u64 {
        self.lost
    }

    /// Entries between the position and the head
    pub fn pending(&self) -> u64 {
        self.segment.queue_head().saturating_sub(self.position)
    }

    /// Queue-to-reader latency of the last completed window, in microseconds
    pub fn latency(&self) -> &LatencyStats {
        self.latency.current()
    }

    /// Close the current latency window and return it
    pub fn next_stats(&mut self) -> &LatencyStats {
        self.latency.roll()
    }

    /// Skip everything queued so far
    pub fn resync(&mut self) {
        self.position = self.segment.queue_head();
    }

    /// Wait for changes per the poll policy and read them into `batch`.
    ///
    /// Consumes at most `max` queue positions (0 = all available). Returns
    /// the number of records read, zero on timeout.
    pub fn poll(&mut self, batch: &mut RecordBatch, max: usize) -> Result<usize> {
        batch.clear();
        let started = Instant::now();
        let mut spins = 0u32;

        loop {
            let read = self.drain_available(batch, max)?;
            if read > 0 {
                return Ok(read);
            }

            if let Some(timeout) = self.poll.timeout {
                if started.elapsed() >= timeout {
                    return Ok(0);
                }
            }

            if spins < self.poll.max_spins {
                spins += 1;
                std::hint::spin_loop();
            } else if !self.poll.interval.is_zero() {
                std::thread::sleep(self.poll.interval);
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Append records for everything already queued, without waiting.
    ///
    /// Slots cleared since they were queued are skipped. If a record cannot
    /// be read the batch is left as it was and the position stays on the
    /// first undelivered entry, so the next call retries it.
    pub fn drain_available(&mut self, batch: &mut RecordBatch, max: usize) -> Result<usize> {
        self.segment.check_attached()?;
        if batch.value_size() != self.segment.value_size() {
            return Err(StoreError::short_buffer(self.segment.value_size(), batch.value_size()));
        }

        let queue = self.segment.queue();
        self.changes.clear();
        let result = queue.read_from(self.position, max, &mut self.changes);

        if result.is_overrun() {
            self.overruns += 1;
            self.lost += result.lost;
            match self.on_overrun {
                OverrunPolicy::Fail => {
                    return Err(StoreError::overrun(result.lost, queue.head(), queue.capacity()));
                }
                OverrunPolicy::Resync => {
                    log::warn!(
                        "{}: change queue overrun, {} changes lost (resuming at {})",
                        self.segment.name(),
                        result.lost,
                        result.start
                    );
                }
            }
        }
        // the lost range is accounted for; the rest is consumed only once delivered
        self.position = result.start;

        let delivered = batch.len();
        let window = self.latency.clone();
        let now = now_micros();
        let mut read = 0;
        for change in &self.changes {
            match batch.read_into(self.segment, change.id, false) {
                Ok(true) => {
                    read += 1;
                    self.latency.on_sample((now - change.timestamp) as f64);
                }
                Ok(false) => {}
                Err(e) => {
                    batch.truncate(delivered);
                    self.latency = window;
                    return Err(e);
                }
            }
        }

        self.position = result.position;
        Ok(read)
    }
}
