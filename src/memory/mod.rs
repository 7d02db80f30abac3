//! Named shared-memory backing objects and segment configuration

pub mod config;
pub mod mapping;

pub use config::{SegmentConfig, SegmentName, SHM_PREFIX};
pub use mapping::SharedMapping;
