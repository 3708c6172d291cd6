//! Bidirectional SPSC packet channel over a file-backed shared memory
//! region.
//!
//! Two cooperating processes attach to the same backing file, one as
//! [`Role::Master`] (creates and initializes the region, unlinks it on
//! detach) and one as [`Role::Slave`] (attaches to the existing region).
//! They then exchange discrete, length-delimited packets over two
//! independent lock-free ring buffers, one per direction. The steady-state
//! data path is fully symmetric; only the lifecycle is asymmetric.
//!
//! # Basic Usage
//!
//! ```no_run
//! use shmx::{Role, Shmx};
//!
//! // Process A
//! let mut master = Shmx::new();
//! master.attach(Role::Master, "/tmp/chan.shmx")?;
//!
//! // Process B
//! let mut slave = Shmx::new();
//! slave.attach(Role::Slave, "/tmp/chan.shmx")?;
//!
//! slave.write(b"ping")?;
//!
//! let mut buf = [0u8; shmx::SHMX_MAX_LEN];
//! let n = master.read(&mut buf)?;
//! assert_eq!(&buf[..n], b"ping");
//! # Ok::<(), shmx::Error>(())
//! ```
//!
//! # Flow control
//!
//! Reads and writes are non-blocking and bounded-work. A write that does
//! not fit the transmit ring is dropped, counted in
//! [`Stats::w_pkt_lost`], and reported as `Ok(0)`; a read from an empty
//! ring returns `Ok(0)`. No wake-up mechanism is provided; callers poll or
//! interpose their own side channel (an eventfd, a socket) to sleep on.
//!
//! # Contract
//!
//! Each ring has exactly one producing process and one consuming process.
//! An endpoint is single-threaded; wrap it in your own mutual exclusion if
//! several threads must share one. Any process with filesystem access to
//! the backing path has full read/write access to the channel.

pub mod endpoint;
pub mod mmap;

mod layout;
mod ring;
mod trace;

pub use endpoint::{Error, Role, Shmx, Stats};
pub use layout::SHMX_MAX_LEN;
pub use trace::init_tracing;
