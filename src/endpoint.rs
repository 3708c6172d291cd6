//! Channel endpoints: attach, detach, and the packet read/write surface.
//!
//! An endpoint is one side of the channel. The [`Role::Master`] side creates
//! and initializes the backing file and removes it again on detach; the
//! [`Role::Slave`] side attaches to an existing, initialized region. After
//! attach the data path is symmetric: each side transmits on the ring the
//! other side receives on.
//!
//! ```text
//!              backing file
//! ┌──────────┬──────────────┬──────────────┐
//! │ config   │    ring A    │    ring B    │
//! │ header   │              │              │
//! └──────────┴──────────────┴──────────────┘
//!   Master:       rx             tx
//!   Slave:        tx             rx
//! ```
//!
//! Reads and writes never block: a write that does not fit is dropped and
//! counted, a read from an empty ring returns `Ok(0)`. There is no built-in
//! wake-up mechanism; callers poll or bring their own side channel.

use std::io;
use std::path::Path;
use std::sync::atomic::Ordering;

use thiserror::Error;

use crate::layout::{flags_atomic, load_le, store_le, Config, FLAG_INITIALIZED};
use crate::mmap::{MapError, ShmFile};
use crate::ring::{ReadResult, Ring, WriteResult};
use crate::trace::{debug, warn};

/// Which side of the channel an endpoint plays during attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates, initializes, and on detach unlinks the backing file.
    Master,
    /// Attaches to a backing file that a master has already initialized.
    Slave,
}

/// Snapshot of an endpoint's packet counters.
///
/// Values are the endpoint's own cached view: packets it read, packets it
/// wrote, and packets it dropped on write. All zero while detached.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub r_pkt_read: u32,
    pub w_pkt_wrote: u32,
    pub w_pkt_lost: u32,
}

/// Errors surfaced by endpoint operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Attach was called on an endpoint that is already attached.
    #[error("endpoint is already attached")]
    InUse,
    /// A data operation was called on a detached endpoint.
    #[error("endpoint is not attached")]
    NotAttached,
    /// The backing file speaks a protocol version this crate does not.
    #[error("unexpected protocol version {major}.{minor}")]
    UnexpectedVersion { major: u8, minor: u8 },
    /// The backing file exists but no master has finished initializing it.
    #[error("region is not initialized by a master")]
    NotInitialized,
    /// The payload exceeds [`SHMX_MAX_LEN`](crate::SHMX_MAX_LEN).
    #[error("payload of {len} bytes exceeds the maximum packet size")]
    TooBig { len: usize },
    /// The read buffer is smaller than the next pending packet.
    #[error("destination buffer of {len} bytes is smaller than the next packet of {needed} bytes")]
    ShortBuffer { needed: usize, len: usize },
    /// The mapping layer failed.
    #[error(transparent)]
    Map(#[from] MapError),
}

struct Attached {
    role: Role,
    rx: Ring,
    tx: Ring,
    // Dropped last; the rings point into its mapping.
    file: ShmFile,
}

/// One endpoint of the shared memory channel.
///
/// A fresh `Shmx` is detached. [`attach`](Shmx::attach) binds it to a
/// backing file as master or slave, [`detach`](Shmx::detach) releases it
/// (and runs automatically on drop). A process may hold several endpoints
/// with different paths.
///
/// All methods take `&mut self`: one endpoint is one producer and one
/// consumer, and concurrent use from several threads is not part of the
/// ring contract.
#[derive(Default)]
pub struct Shmx {
    inner: Option<Attached>,
}

// SAFETY: the endpoint owns its mapping and rings outright; nothing in it
// is tied to the creating thread. Moving it transfers both roles wholesale.
// No Sync: concurrent calls would break the single-producer/single-consumer
// contract.
unsafe impl Send for Shmx {}

impl Shmx {
    /// Creates a detached endpoint.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the endpoint is currently attached.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.inner.is_some()
    }

    /// Attaches to the backing file at `path` as `role`.
    ///
    /// As [`Role::Master`], the file is created exclusively (it must not
    /// exist), sized, and initialized; the initialized flag is published
    /// last, after a synchronous flush of the ring headers. As
    /// [`Role::Slave`], the existing file's header is validated and the
    /// attach fails if no master has published the initialized flag yet.
    ///
    /// On failure the endpoint is left cleanly detached; a failed master
    /// attach also removes any partially created file.
    pub fn attach(&mut self, role: Role, path: impl AsRef<Path>) -> Result<(), Error> {
        if self.inner.is_some() {
            return Err(Error::InUse);
        }

        let path = path.as_ref();
        let attached = match role {
            Role::Master => Self::attach_master(path)?,
            Role::Slave => Self::attach_slave(path)?,
        };
        self.inner = Some(attached);

        debug!(?role, path = %path.display(), "attached");
        Ok(())
    }

    fn attach_master(path: &Path) -> Result<Attached, Error> {
        let cfg = Config::for_master();
        let file = ShmFile::create_exclusive(path, cfg.total_size())?;

        match Self::init_master(&file, &cfg) {
            Ok((rx, tx)) => Ok(Attached {
                role: Role::Master,
                rx,
                tx,
                file,
            }),
            Err(e) => {
                // Do not leave a half-initialized file for a future slave.
                if let Err(_unlink_err) = file.unlink() {
                    warn!(error = %_unlink_err, "rollback unlink failed");
                }
                Err(e)
            }
        }
    }

    fn init_master(file: &ShmFile, cfg: &Config) -> Result<(Ring, Ring), Error> {
        let base = file.as_ptr();
        let header = cfg.encode();

        // SAFETY: the mapping spans cfg.total_size() bytes, which covers
        // the 16-byte header and both rings; no other process can observe
        // the region before the initialized flag is published below.
        let (rx, tx) = unsafe {
            std::ptr::copy_nonoverlapping(header.as_ptr(), base, header.len());

            let ring_a = base.add(cfg.ring_offset as usize);
            let ring_b = base.add(cfg.ring_offset as usize + cfg.ring_stride as usize);
            Ring::init_header(ring_a, cfg.ring_stride);
            Ring::init_header(ring_b, cfg.ring_stride);

            (
                Ring::attach(ring_a, cfg.ring_stride),
                Ring::attach(ring_b, cfg.ring_stride),
            )
        };

        // Flush the header and ring state before publication, then let the
        // release store pair with the slave's acquire load of the flag.
        file.sync()?;
        // SAFETY: the mapping covers the configuration header.
        let flags = unsafe { flags_atomic(base) };
        store_le(flags, FLAG_INITIALIZED, Ordering::Release);

        Ok((rx, tx))
    }

    fn attach_slave(path: &Path) -> Result<Attached, Error> {
        let pending = ShmFile::open_existing(path)?;
        let cfg = Config::decode(pending.header());

        debug!(
            major = cfg.major,
            minor = cfg.minor,
            ring_pairs = cfg.ring_pairs,
            ring_offset = cfg.ring_offset,
            ring_stride = cfg.ring_stride,
            flags = cfg.flags,
            "decoded config header"
        );

        if !cfg.version_supported() {
            return Err(Error::UnexpectedVersion {
                major: cfg.major,
                minor: cfg.minor,
            });
        }

        let file = pending.map(cfg.total_size())?;
        let base = file.as_ptr();

        // SAFETY: the mapping covers the configuration header.
        let flags = unsafe { flags_atomic(base) };
        if load_le(flags, Ordering::Acquire) != FLAG_INITIALIZED {
            // Dropping `file` unmaps and closes; the master owns the path.
            return Err(Error::NotInitialized);
        }

        // Direction swap relative to the master: the master transmits on
        // ring B and receives on ring A.
        // SAFETY: the mapping spans cfg.total_size() bytes, covering both
        // rings; the acquire load above ordered the master's ring header
        // initialization before these reads.
        let (tx, rx) = unsafe {
            let ring_a = base.add(cfg.ring_offset as usize);
            let ring_b = base.add(cfg.ring_offset as usize + cfg.ring_stride as usize);
            (
                Ring::attach(ring_a, cfg.ring_stride),
                Ring::attach(ring_b, cfg.ring_stride),
            )
        };

        Ok(Attached {
            role: Role::Slave,
            rx,
            tx,
            file,
        })
    }

    /// Detaches from the region. Safe to call repeatedly.
    ///
    /// A master unlinks the backing file; both roles unmap and close. Any
    /// packets still in flight are lost with the region.
    pub fn detach(&mut self) {
        let Some(at) = self.inner.take() else {
            return;
        };

        if at.role == Role::Master {
            if let Err(_e) = at.file.unlink() {
                warn!(error = %_e, "unlink on detach failed");
            }
        }
        debug!(role = ?at.role, path = %at.file.path().display(), "detached");
        // Dropping `at` unmaps and closes.
    }

    /// Writes `p` as one packet on the transmit ring.
    ///
    /// Returns `Ok(p.len())` on success and `Ok(0)` either for an empty
    /// input or when the ring has no room, in which case the packet is
    /// dropped and counted in [`Stats::w_pkt_lost`]. Never blocks; there is
    /// no notification to the peer beyond the shared indices.
    pub fn write(&mut self, p: &[u8]) -> Result<usize, Error> {
        let at = self.inner.as_mut().ok_or(Error::NotAttached)?;

        if p.is_empty() {
            return Ok(0);
        }

        match at.tx.write_packet(p) {
            WriteResult::Written => Ok(p.len()),
            WriteResult::Full => Ok(0),
            WriteResult::TooBig => Err(Error::TooBig { len: p.len() }),
        }
    }

    /// Reads the next packet from the receive ring into `buf`.
    ///
    /// Returns the packet's payload length, or `Ok(0)` when no packet is
    /// pending. `buf` must be at least as large as the next packet
    /// (`SHMX_MAX_LEN` always suffices); a shorter buffer fails with
    /// [`Error::ShortBuffer`] and consumes nothing. Never blocks.
    ///
    /// # Panics
    ///
    /// Panics if the frame header carries non-zero reserved fields. That
    /// only happens when the region bytes are corrupt, and no recovery is
    /// possible at that point.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let at = self.inner.as_mut().ok_or(Error::NotAttached)?;

        match at.rx.read_packet(buf) {
            ReadResult::Read(n) => Ok(n),
            ReadResult::Empty => Ok(0),
            ReadResult::ShortBuffer { needed } => Err(Error::ShortBuffer {
                needed,
                len: buf.len(),
            }),
        }
    }

    /// Returns the endpoint's packet counters; all zero while detached.
    #[must_use]
    pub fn stats(&self) -> Stats {
        match &self.inner {
            None => Stats::default(),
            Some(at) => Stats {
                r_pkt_read: at.rx.r_pkt_read,
                w_pkt_wrote: at.tx.w_pkt_wrote,
                w_pkt_lost: at.tx.w_pkt_lost,
            },
        }
    }

    /// The attached role, if any.
    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.inner.as_ref().map(|at| at.role)
    }

    /// The backing file path, if attached.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.inner.as_ref().map(|at| at.file.path())
    }
}

impl Drop for Shmx {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Byte-stream adapter over the packet surface.
///
/// A full transmit ring shows up as `Ok(0)`, which `write_all` turns into
/// [`io::ErrorKind::WriteZero`]; retry after the peer drains.
impl io::Write for Shmx {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Shmx::write(self, buf).map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Byte-stream adapter over the packet surface.
///
/// `Ok(0)` means the ring is currently empty, not end of stream.
impl io::Read for Shmx {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Shmx::read(self, buf).map_err(io::Error::other)
    }
}
