//! Lock-free synchronization primitives for single-writer record slots
//!
//! Key features:
//! - Revision words with a sign-bit write lock and release/acquire publication
//! - Sequence-locked record slots: readers retry torn copies, never block writers
//! - Bounded spin-then-sleep waiting so a wedged writer surfaces as `WouldBlock`

pub mod seqlock;
pub mod sequence;
pub mod spin;

pub use seqlock::{RecordSlot, SlotRead};
pub use sequence::{AtomicRevision, Revision};
pub use spin::{Backoff, SpinPolicy};
