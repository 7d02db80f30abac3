//! Writer liveness
//!
//! Two independent signals tell a reader whether the writer behind a segment
//! is still producing:
//! - the touch stamp, refreshed periodically by a [`Toucher`] and polled by a
//!   [`LivenessWatcher`], catches a wedged writer even when its process lives;
//! - the owner pid probe catches a dead process even between touches.

use std::time::Duration;

use nix::{errno::Errno, sys::signal::kill, unistd::Pid};
use serde::Serialize;

use crate::{
    clock::{duration_micros, Microsec},
    error::Result,
    segment::Segment,
};

pub mod toucher;
pub mod watcher;

pub use toucher::Toucher;
pub use watcher::LivenessWatcher;

/// Probe `pid` with the null signal; permission denied still means alive
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Combined verdict of both liveness signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Liveness {
    /// Owner process exists and touched recently
    Alive,
    /// Owner process exists but has not touched within the threshold
    Stale { last_touch: Microsec },
    /// Owner process is gone
    Dead { pid: u32 },
}

impl Liveness {
    /// Classify `segment` at `now` against a staleness `threshold`
    pub fn probe(segment: &Segment, threshold: Duration, now: Microsec) -> Result<Self> {
        let last_touch = segment.touched_time()?;
        let pid = segment.owner_pid();

        if !process_alive(pid) {
            return Ok(Liveness::Dead { pid });
        }
        if now - last_touch >= duration_micros(threshold) {
            return Ok(Liveness::Stale { last_touch });
        }
        Ok(Liveness::Alive)
    }

    pub fn is_alive(&self) -> bool {
        matches!(self, Liveness::Alive)
    }
}
