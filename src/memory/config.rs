//! Configuration types for record store segments

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{
    config::{DEFAULT_PERMISSIONS, DEFAULT_QUEUE_CAPACITY, MAX_DESCRIPTION_LEN},
    error::{Result, StoreError},
    sync::SpinPolicy,
};

/// Prefix selecting a POSIX shared-memory object instead of a file path
pub const SHM_PREFIX: &str = "shm:";

/// Resolved backing object for a segment name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentName {
    /// POSIX shared-memory object, stored with its leading slash
    Shm(String),
    /// Regular file (typically on a tmpfs mount)
    File(PathBuf),
}

impl SegmentName {
    /// Map a logical name onto its backing object.
    ///
    /// `shm:NAME` selects `shm_open("/NAME")`; anything else is a path.
    pub fn parse(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(StoreError::invalid_argument("name", "Segment name cannot be empty"));
        }
        if name.contains('\0') {
            return Err(StoreError::invalid_argument("name", "Name contains null bytes"));
        }

        match name.strip_prefix(SHM_PREFIX) {
            Some(shm) => {
                let shm = shm.trim_start_matches('/');
                if shm.is_empty() || shm.contains('/') {
                    return Err(StoreError::invalid_argument(
                        "name",
                        format!("Invalid shared memory object name: {}", name),
                    ));
                }
                Ok(SegmentName::Shm(format!("/{}", shm)))
            }
            None => Ok(SegmentName::File(PathBuf::from(name))),
        }
    }

    /// Check if this name refers to a POSIX shared-memory object
    pub fn is_shm(&self) -> bool {
        matches!(self, SegmentName::Shm(_))
    }

    /// Path under which the object is visible in the filesystem, if known
    pub fn os_path(&self) -> PathBuf {
        match self {
            // glibc places POSIX shm objects under /dev/shm
            SegmentName::Shm(shm) => PathBuf::from(format!("/dev/shm{}", shm)),
            SegmentName::File(path) => path.clone(),
        }
    }
}

impl std::fmt::Display for SegmentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentName::Shm(shm) => write!(f, "{}{}", SHM_PREFIX, shm.trim_start_matches('/')),
            SegmentName::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Geometry and options for creating a segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Logical name (`shm:NAME` or a file path)
    pub name: String,
    /// Free-form label, e.g. the feed name
    pub description: String,
    /// First addressable identifier
    pub base_id: i64,
    /// Exclusive upper bound of addressable identifiers
    pub max_id: i64,
    /// Bytes of opaque value per record
    pub value_size: usize,
    /// Change queue capacity, a power of two
    pub queue_capacity: usize,
    /// Unix permissions of the backing object
    pub permissions: u32,
    /// Keep the backing object when the segment is dropped
    pub persist: bool,
    /// Bounded wait used by lock acquisition on this segment
    pub spin: SpinPolicy,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            base_id: 0,
            max_id: 0,
            value_size: 0,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            permissions: DEFAULT_PERMISSIONS,
            persist: true,
            spin: SpinPolicy::default(),
        }
    }
}

impl SegmentConfig {
    /// Create a configuration for ids `[0, max_id)`
    pub fn new(name: impl Into<String>, max_id: i64, value_size: usize) -> Self {
        Self {
            name: name.into(),
            max_id,
            value_size,
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Shift the id range to `[base_id, max_id)`
    pub fn with_base_id(mut self, base_id: i64) -> Self {
        self.base_id = base_id;
        self
    }

    pub fn with_max_id(mut self, max_id: i64) -> Self {
        self.max_id = max_id;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_permissions(mut self, permissions: u32) -> Self {
        self.permissions = permissions;
        self
    }

    /// Unlink the backing object when the writer drops the segment
    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn with_spin_policy(mut self, spin: SpinPolicy) -> Self {
        self.spin = spin;
        self
    }

    /// Number of record slots described by the id range
    pub fn record_count(&self) -> usize {
        self.max_id.saturating_sub(self.base_id).max(0) as usize
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        SegmentName::parse(&self.name)?;

        if self.max_id <= self.base_id {
            return Err(StoreError::invalid_argument(
                "max_id",
                format!("max_id {} must be greater than base_id {}", self.max_id, self.base_id),
            ));
        }

        if self.value_size == 0 {
            return Err(StoreError::invalid_argument(
                "value_size",
                "Value size must be greater than 0",
            ));
        }

        if self.queue_capacity == 0 || !self.queue_capacity.is_power_of_two() {
            return Err(StoreError::invalid_argument(
                "queue_capacity",
                format!("Queue capacity {} must be a non-zero power of 2", self.queue_capacity),
            ));
        }

        if self.description.len() >= MAX_DESCRIPTION_LEN {
            return Err(StoreError::invalid_argument(
                "description",
                format!("Description must be shorter than {} bytes", MAX_DESCRIPTION_LEN),
            ));
        }

        if self.description.contains('\0') {
            return Err(StoreError::invalid_argument("description", "Description contains null bytes"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_parse_names() {
        assert_eq!(
            SegmentName::parse("shm:quotes").unwrap(),
            SegmentName::Shm("/quotes".to_string())
        );
        assert_eq!(
            SegmentName::parse("/tmp/prints.stg").unwrap(),
            SegmentName::File(PathBuf::from("/tmp/prints.stg"))
        );
        assert!(SegmentName::parse("").is_err());
        assert!(SegmentName::parse("shm:").is_err());
        assert!(SegmentName::parse("shm:a/b").is_err());
        assert_eq!(SegmentName::parse("shm:/quotes").unwrap().to_string(), "shm:quotes");
    }

    #[test]
    fn test_validate_geometry() {
        let config = SegmentConfig::new("/tmp/x", 16, 32);
        assert!(config.validate().is_ok());
        assert_eq!(config.record_count(), 16);

        let bad = config.clone().with_queue_capacity(3);
        assert_eq!(bad.validate().unwrap_err().code(), ErrorCode::InvalidArgument);

        let bad = config.clone().with_queue_capacity(0);
        assert!(bad.validate().is_err());

        let bad = SegmentConfig::new("/tmp/x", 16, 0);
        assert!(bad.validate().is_err());

        let bad = config.clone().with_base_id(16);
        assert!(bad.validate().is_err());

        let bad = config.with_description("x".repeat(MAX_DESCRIPTION_LEN));
        assert!(bad.validate().is_err());
    }
}
