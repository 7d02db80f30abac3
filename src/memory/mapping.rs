//! Named backing objects and their memory mappings

use std::{
    fs::{File, OpenOptions},
    io::ErrorKind,
    os::unix::fs::{MetadataExt, OpenOptionsExt},
};

use memmap2::{Mmap, MmapMut, MmapOptions};
use nix::{
    errno::Errno,
    fcntl::OFlag,
    sys::{
        mman::{shm_open, shm_unlink},
        stat::Mode,
    },
};

use crate::error::{Result, StoreError};

use super::config::SegmentName;

enum Mapping {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

/// A mapped backing object (POSIX shm or file)
pub struct SharedMapping {
    name: SegmentName,
    mapping: Mapping,
    /// Kept open so the inode can be compared against the name later
    file: File,
    inode: u64,
}

impl std::fmt::Debug for SharedMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMapping")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("writable", &self.is_writable())
            .field("inode", &self.inode)
            .finish()
    }
}

impl SharedMapping {
    /// Create a new backing object of `size` bytes, failing if one exists
    pub fn create(name: &SegmentName, size: usize, permissions: u32) -> Result<Self> {
        if size == 0 {
            return Err(StoreError::invalid_argument("size", "Mapping size must be greater than 0"));
        }

        let file = match name {
            SegmentName::Shm(shm) => {
                let fd = shm_open(
                    shm.as_str(),
                    OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
                    Mode::from_bits_truncate(permissions as libc::mode_t),
                )
                .map_err(|e| StoreError::from_errno(e, "shm_open"))?;
                File::from(fd)
            }
            SegmentName::File(path) => OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .mode(permissions)
                .open(path)
                .map_err(|e| StoreError::from_io(e, "Failed to create backing file"))?,
        };

        file.set_len(size as u64)
            .map_err(|e| StoreError::from_io(e, "Failed to set backing object size"))?;

        let mapping = unsafe {
            MmapOptions::new()
                .len(size)
                .map_mut(&file)
                .map_err(|e| StoreError::from_io(e, "Failed to create memory mapping"))?
        };

        Self::finish(name.clone(), Mapping::ReadWrite(mapping), file)
    }

    /// Map an existing backing object in full
    pub fn open(name: &SegmentName, writable: bool) -> Result<Self> {
        let file = Self::open_file(name, writable)?;
        let len = file
            .metadata()
            .map_err(|e| StoreError::from_io(e, "fstat"))?
            .len() as usize;

        if len == 0 {
            return Err(StoreError::corrupt(name.to_string(), "backing object is empty"));
        }

        let mapping = unsafe {
            let mut options = MmapOptions::new();
            options.len(len);
            if writable {
                Mapping::ReadWrite(
                    options
                        .map_mut(&file)
                        .map_err(|e| StoreError::from_io(e, "Failed to create memory mapping"))?,
                )
            } else {
                Mapping::ReadOnly(
                    options
                        .map(&file)
                        .map_err(|e| StoreError::from_io(e, "Failed to create memory mapping"))?,
                )
            }
        };

        Self::finish(name.clone(), mapping, file)
    }

    fn open_file(name: &SegmentName, writable: bool) -> Result<File> {
        match name {
            SegmentName::Shm(shm) => {
                let flags = if writable { OFlag::O_RDWR } else { OFlag::O_RDONLY };
                match shm_open(shm.as_str(), flags, Mode::empty()) {
                    Ok(fd) => Ok(File::from(fd)),
                    Err(Errno::ENOENT) => Err(StoreError::segment_not_found(name.to_string())),
                    Err(e) => Err(StoreError::from_errno(e, "shm_open")),
                }
            }
            SegmentName::File(path) => {
                match OpenOptions::new().read(true).write(writable).open(path) {
                    Ok(file) => Ok(file),
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        Err(StoreError::segment_not_found(name.to_string()))
                    }
                    Err(e) => Err(StoreError::from_io(e, "Failed to open backing file")),
                }
            }
        }
    }

    fn finish(name: SegmentName, mapping: Mapping, file: File) -> Result<Self> {
        let inode = file
            .metadata()
            .map_err(|e| StoreError::from_io(e, "fstat"))?
            .ino();
        Ok(Self {
            name,
            mapping,
            file,
            inode,
        })
    }

    /// Remove a backing object by name.
    ///
    /// Returns `Ok(false)` if nothing by that name existed.
    pub fn unlink(name: &SegmentName) -> Result<bool> {
        match name {
            SegmentName::Shm(shm) => match shm_unlink(shm.as_str()) {
                Ok(()) => Ok(true),
                Err(Errno::ENOENT) => Ok(false),
                Err(e) => Err(StoreError::from_errno(e, "shm_unlink")),
            },
            SegmentName::File(path) => match std::fs::remove_file(path) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(StoreError::from_io(e, "unlink")),
            },
        }
    }

    /// Check whether the name still resolves to the object we mapped
    pub fn is_linked(&self) -> bool {
        match std::fs::metadata(self.name.os_path()) {
            Ok(meta) => meta.ino() == self.inode,
            // Can't see the object through the filesystem; trust the header
            Err(_) if self.name.is_shm() => true,
            Err(_) => false,
        }
    }

    pub fn name(&self) -> &SegmentName {
        &self.name
    }

    /// Base address of the mapping
    pub fn as_ptr(&self) -> *const u8 {
        match &self.mapping {
            Mapping::ReadOnly(map) => map.as_ptr(),
            Mapping::ReadWrite(map) => map.as_ptr(),
        }
    }

    /// Writable base address, `None` for read-only mappings
    pub fn as_mut_ptr(&self) -> Option<*mut u8> {
        match &self.mapping {
            Mapping::ReadOnly(_) => None,
            // Shared mapping: all mutation goes through atomics or the seqlock protocol
            Mapping::ReadWrite(map) => Some(map.as_ptr() as *mut u8),
        }
    }

    pub fn len(&self) -> usize {
        match &self.mapping {
            Mapping::ReadOnly(map) => map.len(),
            Mapping::ReadWrite(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.mapping, Mapping::ReadWrite(_))
    }

    /// Flush changes to the backing object
    pub fn flush(&self) -> Result<()> {
        match &self.mapping {
            Mapping::ReadOnly(_) => Err(StoreError::read_only("sync")),
            Mapping::ReadWrite(map) => map
                .flush()
                .map_err(|e| StoreError::from_io(e, "msync")),
        }
    }

    /// Size of the backing object as seen through the open descriptor
    pub fn object_len(&self) -> Result<u64> {
        Ok(self
            .file
            .metadata()
            .map_err(|e| StoreError::from_io(e, "fstat"))?
            .len())
    }
}
