//! File-backed shared memory mapping.
//!
//! [`ShmFile`] owns the backing file descriptor and the shared, read-write
//! mapping over it. The master creates the file exclusively and sizes it;
//! the slave opens the existing file, reads the configuration header before
//! mapping (via [`PendingMap`]) to learn the full region size, then maps.
//!
//! Dropping a `ShmFile` unmaps and closes, but never unlinks: removal of
//! the path is an explicit, master-only step ([`ShmFile::unlink`]), so the
//! slave can tear down without destroying the region.

use std::fmt;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::ptr::{null_mut, NonNull};

use rustix::fs::{ftruncate, open, unlink, Mode, OFlags};
use rustix::io::Errno;
use rustix::mm::{mmap, msync, munmap, MapFlags, MsyncFlags, ProtFlags};

use crate::layout::CONFIG_SIZE;

/// Errors from the mapping layer.
#[derive(Debug)]
pub enum MapError {
    /// An OS call failed with an errno.
    Posix {
        op: &'static str,
        path: PathBuf,
        source: Errno,
    },
    /// The backing file yielded fewer header bytes than the format requires.
    ShortHeader { path: PathBuf, got: usize },
}

impl MapError {
    fn posix(op: &'static str, path: &Path, source: Errno) -> Self {
        Self::Posix {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::Posix { op, path, source } => {
                write!(f, "{} failed for `{}`: {}", op, path.display(), source)
            }
            MapError::ShortHeader { path, got } => write!(
                f,
                "config header short read for `{}`: {} of {} bytes",
                path.display(),
                got,
                CONFIG_SIZE
            ),
        }
    }
}

impl std::error::Error for MapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MapError::Posix { source, .. } => Some(source),
            MapError::ShortHeader { .. } => None,
        }
    }
}

/// An open backing file with its shared read-write mapping.
#[derive(Debug)]
pub struct ShmFile {
    ptr: NonNull<u8>,
    len: usize,
    path: PathBuf,
    // Held for the lifetime of the mapping; closed on drop.
    _fd: OwnedFd,
}

// SAFETY: the mapping is process-shared memory, not tied to the creating
// thread. Moving the handle to another thread is sound; concurrent use is
// not offered (no Sync).
unsafe impl Send for ShmFile {}

impl ShmFile {
    /// Creates the backing file, sizes it to `len`, and maps it shared.
    ///
    /// The file is created with `O_CREAT | O_EXCL` and mode `0600`, so this
    /// fails if the path already exists. On any partial failure the file is
    /// unlinked again before the error is returned.
    pub fn create_exclusive(path: &Path, len: usize) -> Result<Self, MapError> {
        let fd = open(
            path,
            OFlags::CREATE | OFlags::EXCL | OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|e| MapError::posix("open", path, e))?;

        if let Err(e) = ftruncate(&fd, len as u64) {
            drop(fd);
            let _ = unlink(path);
            return Err(MapError::posix("ftruncate", path, e));
        }

        match Self::map_fd(fd, path, len) {
            Ok(file) => Ok(file),
            Err(e) => {
                let _ = unlink(path);
                Err(e)
            }
        }
    }

    /// Opens an existing backing file and reads its configuration header.
    ///
    /// The header is read through the file descriptor, unmapped, because the
    /// region size is not known until the header is decoded. Fails with
    /// [`MapError::ShortHeader`] if the file cannot supply all 16 header
    /// bytes. Call [`PendingMap::map`] to finish.
    pub fn open_existing(path: &Path) -> Result<PendingMap, MapError> {
        let fd = open(path, OFlags::RDWR, Mode::empty())
            .map_err(|e| MapError::posix("open", path, e))?;

        let mut header = [0u8; CONFIG_SIZE];
        let got = rustix::io::read(&fd, &mut header)
            .map_err(|e| MapError::posix("read", path, e))?;
        if got != CONFIG_SIZE {
            return Err(MapError::ShortHeader {
                path: path.to_path_buf(),
                got,
            });
        }

        Ok(PendingMap {
            fd,
            path: path.to_path_buf(),
            header,
        })
    }

    fn map_fd(fd: OwnedFd, path: &Path, len: usize) -> Result<Self, MapError> {
        // SAFETY: fresh mapping of `len` bytes from the kernel, not aliasing
        // any existing Rust object. The fd refers to a regular file of at
        // least `len` bytes (truncated by the creator). READ|WRITE + SHARED
        // so both processes observe each other's stores.
        let ptr = unsafe {
            mmap(
                null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }
        .map_err(|e| MapError::posix("mmap", path, e))?;

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(ptr as *mut u8) };

        Ok(Self {
            ptr,
            len,
            path: path.to_path_buf(),
            _fd: fd,
        })
    }

    /// Base address of the mapping.
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Byte length of the mapping.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Synchronously flushes the mapping to the backing file.
    ///
    /// The master calls this between ring initialization and publication of
    /// the initialized flag, so a slave that observes the flag also
    /// observes fully initialized ring headers.
    pub fn sync(&self) -> Result<(), MapError> {
        // SAFETY: ptr/len describe our own live mapping.
        unsafe { msync(self.ptr.as_ptr().cast(), self.len, MsyncFlags::SYNC) }
            .map_err(|e| MapError::posix("msync", &self.path, e))
    }

    /// Removes the backing file path. The mapping stays usable until drop.
    pub fn unlink(&self) -> Result<(), MapError> {
        unlink(&self.path).map_err(|e| MapError::posix("unlink", &self.path, e))
    }
}

impl Drop for ShmFile {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe the mapping created in map_fd; it is
        // unmapped exactly once, here.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

/// An opened backing file whose header has been read but which is not yet
/// mapped.
///
/// Dropping a `PendingMap` just closes the file descriptor, leaving no
/// mapping behind; this is the rollback path when header validation fails.
#[derive(Debug)]
pub struct PendingMap {
    fd: OwnedFd,
    path: PathBuf,
    header: [u8; CONFIG_SIZE],
}

impl PendingMap {
    /// The raw configuration header bytes read from the file.
    #[must_use]
    pub fn header(&self) -> &[u8; CONFIG_SIZE] {
        &self.header
    }

    /// Maps the full region of `len` bytes and returns the finished handle.
    pub fn map(self, len: usize) -> Result<ShmFile, MapError> {
        ShmFile::map_fd(self.fd, &self.path, len)
    }
}
