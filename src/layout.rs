//! On-disk layout of the shared region: configuration header, ring control
//! headers, and packet framing constants.
//!
//! Everything in the backing file is little-endian, regardless of host byte
//! order. The file starts with a 16-byte configuration header, followed by
//! two rings back to back:
//!
//! ```text
//! offset 0                : Config header (16 bytes)
//! offset 16               : ring A control header (32 bytes) + payload
//! offset 16 + ring_stride : ring B control header (32 bytes) + payload
//! ```
//!
//! Each ring's control header is split by ownership: the producer writes
//! only `w_index`, `w_pkt_wrote`, and `w_pkt_lost`; the consumer writes only
//! `r_index` and `r_pkt_read`. The remaining fields are written once by the
//! master during initialization and are read-only afterwards. Every shared
//! field has exactly one writer, which is what lets both sides make progress
//! without locks.

use std::sync::atomic::{AtomicU32, Ordering};

/// Maximum payload length of a single packet: one Ethernet frame plus a
/// VLAN tag.
pub const SHMX_MAX_LEN: usize = 65535 + 18;

/// Protocol major version.
pub(crate) const MAJOR_VERSION: u8 = 1;
/// Protocol minor version.
pub(crate) const MINOR_VERSION: u8 = 0;

/// Byte size of the configuration header at the start of the file.
pub(crate) const CONFIG_SIZE: usize = 16;
/// Byte offset of the `flags` word within the configuration header.
pub(crate) const CONFIG_FLAGS_OFFSET: usize = 12;
/// `flags` bit set by the master once both rings are initialized.
pub(crate) const FLAG_INITIALIZED: u32 = 1;

/// Byte size of a ring control header.
pub(crate) const RING_HDR_SIZE: u32 = 32;
/// Default byte size of one ring (control header plus payload area).
pub(crate) const RING_STRIDE: u32 = 12 * 1024 * 1024;
/// Number of ring pairs carried by the region.
pub(crate) const RING_PAIRS: u8 = 1;

/// Byte size of the packet frame header preceding each payload.
pub(crate) const PACKET_HDR_SIZE: u32 = 12;

/// Rounds `n` up to the next multiple of 4.
#[inline]
pub(crate) const fn round_up_4(n: u32) -> u32 {
    (n + 3) & !3
}

/// Loads a shared little-endian field.
#[inline]
pub(crate) fn load_le(field: &AtomicU32, order: Ordering) -> u32 {
    u32::from_le(field.load(order))
}

/// Stores a shared little-endian field.
#[inline]
pub(crate) fn store_le(field: &AtomicU32, value: u32, order: Ordering) {
    field.store(value.to_le(), order);
}

/// Decoded configuration header.
///
/// The master writes this once at offset 0; the slave reads it back before
/// mapping the full region to learn the geometry. `flags` is the only field
/// that changes after creation and is accessed through [`flags_atomic`]
/// rather than through this codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Config {
    pub major: u8,
    pub minor: u8,
    pub ring_pairs: u8,
    pub ring_offset: u32,
    pub ring_stride: u32,
    pub flags: u32,
}

impl Config {
    /// Configuration written by a master for a freshly created region.
    pub(crate) fn for_master() -> Self {
        Self {
            major: MAJOR_VERSION,
            minor: MINOR_VERSION,
            ring_pairs: RING_PAIRS,
            ring_offset: CONFIG_SIZE as u32,
            ring_stride: RING_STRIDE,
            flags: 0,
        }
    }

    /// Total byte size of the region described by this header.
    pub(crate) fn total_size(&self) -> usize {
        self.ring_offset as usize
            + self.ring_stride as usize * self.ring_pairs as usize * 2
    }

    /// Whether the header carries the protocol version this crate speaks.
    pub(crate) fn version_supported(&self) -> bool {
        self.major == MAJOR_VERSION && self.minor == MINOR_VERSION
    }

    pub(crate) fn encode(&self) -> [u8; CONFIG_SIZE] {
        let mut b = [0u8; CONFIG_SIZE];
        b[0] = self.major;
        b[1] = self.minor;
        b[2] = self.ring_pairs;
        // b[3] reserved, zero
        b[4..8].copy_from_slice(&self.ring_offset.to_le_bytes());
        b[8..12].copy_from_slice(&self.ring_stride.to_le_bytes());
        b[12..16].copy_from_slice(&self.flags.to_le_bytes());
        b
    }

    pub(crate) fn decode(b: &[u8; CONFIG_SIZE]) -> Self {
        Self {
            major: b[0],
            minor: b[1],
            ring_pairs: b[2],
            ring_offset: u32::from_le_bytes(b[4..8].try_into().unwrap()),
            ring_stride: u32::from_le_bytes(b[8..12].try_into().unwrap()),
            flags: u32::from_le_bytes(b[12..16].try_into().unwrap()),
        }
    }
}

/// Typed view of a ring control header inside the mapped region.
///
/// All cross-process fields are `AtomicU32` so that loads and stores are
/// single 32-bit accesses the compiler cannot tear or reorder past the
/// chosen `Ordering`. Values are kept little-endian in memory via
/// [`load_le`] / [`store_le`].
#[repr(C)]
pub(crate) struct RingHdr {
    /// Payload bytes available in this ring, `ring_stride - 32`. Written
    /// once by the master.
    pub const_size: AtomicU32,
    _reserved0: AtomicU32,
    /// Producer-owned byte offset within the payload area.
    pub w_index: AtomicU32,
    /// Producer-owned count of packets written.
    pub w_pkt_wrote: AtomicU32,
    /// Producer-owned count of packets dropped (overrun or oversize).
    pub w_pkt_lost: AtomicU32,
    _reserved1: AtomicU32,
    /// Consumer-owned byte offset within the payload area.
    pub r_index: AtomicU32,
    /// Consumer-owned count of packets read.
    pub r_pkt_read: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<RingHdr>() == RING_HDR_SIZE as usize);
const _: () = assert!(std::mem::align_of::<RingHdr>() == 4);

impl RingHdr {
    /// Resets the header to the empty state of a ring holding `const_size`
    /// payload bytes. Master-only, before the region is published.
    pub(crate) fn init(&self, const_size: u32) {
        store_le(&self.const_size, const_size, Ordering::Relaxed);
        store_le(&self._reserved0, 0, Ordering::Relaxed);
        store_le(&self.w_index, 0, Ordering::Relaxed);
        store_le(&self.w_pkt_wrote, 0, Ordering::Relaxed);
        store_le(&self.w_pkt_lost, 0, Ordering::Relaxed);
        store_le(&self._reserved1, 0, Ordering::Relaxed);
        store_le(&self.r_index, 0, Ordering::Relaxed);
        store_le(&self.r_pkt_read, 0, Ordering::Relaxed);
    }
}

/// Returns the `flags` word of the configuration header as an atomic.
///
/// The flag store is the publication point of master initialization: the
/// master stores [`FLAG_INITIALIZED`] with release ordering only after both
/// ring headers are in place, and the slave observes it with acquire
/// ordering before touching any ring state.
///
/// # Safety
///
/// `region` must point to a mapped region of at least [`CONFIG_SIZE`] bytes
/// that is 4-byte aligned and remains valid for the returned lifetime.
pub(crate) unsafe fn flags_atomic<'a>(region: *mut u8) -> &'a AtomicU32 {
    // SAFETY: caller guarantees the region covers the configuration header
    // and is aligned; offset 12 keeps 4-byte alignment.
    unsafe { &*(region.add(CONFIG_FLAGS_OFFSET) as *const AtomicU32) }
}
