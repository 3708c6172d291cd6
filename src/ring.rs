//! Core lock-free SPSC byte ring with packet framing.
//!
//! A [`Ring`] is one direction of the channel: a control header in shared
//! memory plus a payload area in which length-delimited packets are framed,
//! possibly wrapping around the end of the area. Each process holds its own
//! `Ring` view over the same bytes; one side only produces (packet writes),
//! the other only consumes (packet reads).
//!
//! The view caches the fields its role owns and refreshes the fields the
//! peer owns. Publication is a release store of the owned index/counter
//! after the payload bytes are in place, paired with an acquire load on the
//! observing side, so neither side ever reads bytes the other has not
//! finished writing, and the producer never reclaims bytes the consumer has
//! not finished copying out.
//!
//! # Safety
//!
//! Construction is unsafe: the caller guarantees region validity and the
//! SPSC contract (exactly one producer view and one consumer view per ring
//! across all attached processes). Once constructed, the methods are safe;
//! `&mut self` keeps a single view single-threaded.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use crate::layout::{
    load_le, round_up_4, store_le, RingHdr, PACKET_HDR_SIZE, RING_HDR_SIZE, SHMX_MAX_LEN,
};

/// Outcome of a producer-side packet write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteResult {
    /// The packet was framed and published.
    Written,
    /// Not enough free space; the packet was dropped and counted as lost.
    Full,
    /// The payload exceeds [`SHMX_MAX_LEN`]; dropped and counted as lost.
    TooBig,
}

/// Outcome of a consumer-side packet read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadResult {
    /// A packet of this many payload bytes was copied out.
    Read(usize),
    /// No unread packets.
    Empty,
    /// The destination buffer is smaller than the next packet. Nothing was
    /// consumed; the packet is still first in line.
    ShortBuffer { needed: usize },
}

/// One direction of the channel: a view over a ring in the mapped region.
pub(crate) struct Ring {
    hdr: NonNull<RingHdr>,
    /// Start of the payload area, `hdr + 32`.
    base: NonNull<u8>,
    /// Payload bytes in the ring; indices wrap at this value.
    pub(crate) const_size: u32,

    // Cached view of the control header. The fields of the role this view
    // plays are authoritative between publications; the peer's fields are
    // snapshots from the most recent refresh.
    pub(crate) w_index: u32,
    pub(crate) w_pkt_wrote: u32,
    pub(crate) w_pkt_lost: u32,
    pub(crate) r_index: u32,
    pub(crate) r_pkt_read: u32,
}

impl Ring {
    /// Writes a pristine control header for the ring starting at `cb`.
    ///
    /// Called by the master once per ring, before the initialized flag is
    /// published.
    ///
    /// # Safety
    ///
    /// `cb` must be 4-byte aligned and valid for writes of `ring_stride`
    /// bytes, with no other process observing the ring yet.
    pub(crate) unsafe fn init_header(cb: *mut u8, ring_stride: u32) {
        debug_assert!(ring_stride % 4 == 0);
        debug_assert!(ring_stride > RING_HDR_SIZE + PACKET_HDR_SIZE);

        // SAFETY: caller guarantees alignment and that `cb` covers at least
        // the 32-byte control header.
        let hdr = unsafe { &*(cb as *const RingHdr) };
        hdr.init(ring_stride - RING_HDR_SIZE);
    }

    /// Builds a view over the ring starting at `cb`, snapshotting the
    /// current control header.
    ///
    /// # Safety
    ///
    /// Caller must ensure:
    /// - `cb` is 4-byte aligned and valid for reads and writes of
    ///   `ring_stride` bytes for the lifetime of the returned `Ring`
    /// - the control header has been initialized by [`Ring::init_header`]
    /// - across all processes, at most one view plays the producer role and
    ///   at most one the consumer role for this ring
    pub(crate) unsafe fn attach(cb: *mut u8, ring_stride: u32) -> Self {
        debug_assert!(ring_stride % 4 == 0);
        debug_assert!(ring_stride > RING_HDR_SIZE + PACKET_HDR_SIZE);

        // SAFETY: caller guarantees alignment and validity for
        // `ring_stride` bytes.
        let hdr = unsafe { NonNull::new_unchecked(cb as *mut RingHdr) };
        let base = unsafe { NonNull::new_unchecked(cb.add(RING_HDR_SIZE as usize)) };

        let h = unsafe { hdr.as_ref() };
        Self {
            hdr,
            base,
            const_size: load_le(&h.const_size, Ordering::Relaxed),
            w_index: load_le(&h.w_index, Ordering::Relaxed),
            w_pkt_wrote: load_le(&h.w_pkt_wrote, Ordering::Relaxed),
            w_pkt_lost: load_le(&h.w_pkt_lost, Ordering::Relaxed),
            r_index: load_le(&h.r_index, Ordering::Relaxed),
            r_pkt_read: load_le(&h.r_pkt_read, Ordering::Relaxed),
        }
    }

    fn hdr(&self) -> &RingHdr {
        // SAFETY: the region outlives the view per the attach contract.
        unsafe { self.hdr.as_ref() }
    }

    // ---- producer side -------------------------------------------------

    /// Frames `p` as one packet and publishes it.
    ///
    /// `p` must be non-empty; the endpoint short-circuits empty writes.
    pub(crate) fn write_packet(&mut self, p: &[u8]) -> WriteResult {
        if p.len() > SHMX_MAX_LEN {
            self.w_pkt_lost = self.w_pkt_lost.wrapping_add(1);
            return WriteResult::TooBig;
        }

        self.refresh_consumer();

        let free = if self.w_index >= self.r_index {
            self.const_size - (self.w_index - self.r_index)
        } else {
            self.r_index - self.w_index
        };

        let need = PACKET_HDR_SIZE + round_up_4(p.len() as u32);

        // A packet never consumes the last free byte slot: `w == r` must
        // keep meaning empty, so usable capacity is `const_size - 1`.
        if need >= free {
            self.w_pkt_lost = self.w_pkt_lost.wrapping_add(1);
            self.publish_producer();
            return WriteResult::Full;
        }

        let mut hdr = [0u8; PACKET_HDR_SIZE as usize];
        hdr[0..4].copy_from_slice(&(p.len() as u32).to_le_bytes());
        // tag and rd stay zero.

        self.put(&hdr);
        self.put(p);

        self.w_index = round_up_4(self.w_index);
        if self.w_index >= self.const_size {
            self.w_index = 0;
        }
        self.w_pkt_wrote = self.w_pkt_wrote.wrapping_add(1);
        self.publish_producer();

        WriteResult::Written
    }

    /// Copies `b` into the payload area at `w_index`, wrapping at most once.
    ///
    /// The free-space check in [`write_packet`](Self::write_packet) keeps
    /// the copy inside bytes the consumer has already released.
    fn put(&mut self, b: &[u8]) {
        let until_wrap = (self.const_size - self.w_index) as usize;
        // SAFETY: w_index < const_size, so the destination ranges stay
        // within the payload area; the source is a live slice.
        unsafe {
            let dst = self.base.as_ptr().add(self.w_index as usize);
            if b.len() <= until_wrap {
                std::ptr::copy_nonoverlapping(b.as_ptr(), dst, b.len());
                self.w_index += b.len() as u32;
                if self.w_index == self.const_size {
                    self.w_index = 0;
                }
            } else {
                std::ptr::copy_nonoverlapping(b.as_ptr(), dst, until_wrap);
                let rest = b.len() - until_wrap;
                std::ptr::copy_nonoverlapping(
                    b.as_ptr().add(until_wrap),
                    self.base.as_ptr(),
                    rest,
                );
                self.w_index = rest as u32;
            }
        }
    }

    /// Refreshes the consumer-owned fields from shared memory.
    fn refresh_consumer(&mut self) {
        let h = self.hdr();
        // Acquire pairs with the consumer's release store of r_index, so
        // bytes counted as free really have been copied out.
        let r_index = load_le(&h.r_index, Ordering::Acquire);
        let r_pkt_read = load_le(&h.r_pkt_read, Ordering::Relaxed);
        self.r_index = r_index;
        self.r_pkt_read = r_pkt_read;
    }

    /// Publishes the producer-owned fields to shared memory.
    fn publish_producer(&self) {
        let h = self.hdr();
        store_le(&h.w_pkt_lost, self.w_pkt_lost, Ordering::Relaxed);
        store_le(&h.w_index, self.w_index, Ordering::Relaxed);
        // w_pkt_wrote is the consumer's not-empty signal; the release makes
        // the payload bytes and w_index visible before the count.
        store_le(&h.w_pkt_wrote, self.w_pkt_wrote, Ordering::Release);
    }

    // ---- consumer side -------------------------------------------------

    /// Reads the next packet into `buf`, if any.
    pub(crate) fn read_packet(&mut self, buf: &mut [u8]) -> ReadResult {
        self.refresh_producer();

        if self.w_pkt_wrote == self.r_pkt_read {
            return ReadResult::Empty;
        }

        // Peek the frame header without committing r_index, so a short
        // destination buffer leaves the packet intact.
        let length = self.peek_u32(0);
        let tag = self.peek_u32(4);
        let rd = self.peek_u32(8);

        if tag != 0 {
            panic!("corrupt ring: packet tag {tag:#x} is not zero");
        }
        if rd != 0 {
            panic!("corrupt ring: packet rd {rd:#x} is not zero");
        }

        if buf.len() < length as usize {
            return ReadResult::ShortBuffer {
                needed: length as usize,
            };
        }

        // Consume the frame header.
        self.r_index += PACKET_HDR_SIZE;
        if self.r_index >= self.const_size {
            self.r_index -= self.const_size;
        }

        self.get(&mut buf[..length as usize]);

        self.r_index = round_up_4(self.r_index);
        if self.r_index >= self.const_size {
            self.r_index = 0;
        }
        self.r_pkt_read = self.r_pkt_read.wrapping_add(1);
        self.publish_consumer();

        ReadResult::Read(length as usize)
    }

    /// Reads a little-endian u32 at `offset` bytes past `r_index` without
    /// advancing.
    ///
    /// `r_index` and `offset` are multiples of 4 and `const_size` is too,
    /// so the word never straddles the wrap boundary.
    fn peek_u32(&self, offset: u32) -> u32 {
        let mut idx = self.r_index + offset;
        if idx >= self.const_size {
            idx -= self.const_size;
        }
        let mut b = [0u8; 4];
        // SAFETY: idx < const_size and the word stays inside the payload
        // area (see alignment note above).
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.as_ptr().add(idx as usize),
                b.as_mut_ptr(),
                4,
            );
        }
        u32::from_le_bytes(b)
    }

    /// Copies `out.len()` payload bytes from `r_index`, wrapping at most
    /// once.
    fn get(&mut self, out: &mut [u8]) {
        let until_wrap = (self.const_size - self.r_index) as usize;
        // SAFETY: r_index < const_size; the producer only hands us packets
        // that fit the payload area, so both ranges are in bounds.
        unsafe {
            let src = self.base.as_ptr().add(self.r_index as usize);
            if out.len() <= until_wrap {
                std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len());
                self.r_index += out.len() as u32;
                if self.r_index == self.const_size {
                    self.r_index = 0;
                }
            } else {
                std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), until_wrap);
                let rest = out.len() - until_wrap;
                std::ptr::copy_nonoverlapping(
                    self.base.as_ptr(),
                    out.as_mut_ptr().add(until_wrap),
                    rest,
                );
                self.r_index = rest as u32;
            }
        }
    }

    /// Refreshes the producer-owned fields from shared memory.
    fn refresh_producer(&mut self) {
        let h = self.hdr();
        // Acquire pairs with the producer's release store of w_pkt_wrote,
        // so a packet counted as written is fully visible.
        let w_pkt_wrote = load_le(&h.w_pkt_wrote, Ordering::Acquire);
        let w_index = load_le(&h.w_index, Ordering::Relaxed);
        let w_pkt_lost = load_le(&h.w_pkt_lost, Ordering::Relaxed);
        self.w_pkt_wrote = w_pkt_wrote;
        self.w_index = w_index;
        self.w_pkt_lost = w_pkt_lost;
    }

    /// Publishes the consumer-owned fields to shared memory.
    fn publish_consumer(&self) {
        let h = self.hdr();
        store_le(&h.r_pkt_read, self.r_pkt_read, Ordering::Relaxed);
        // The release makes the copy-out complete before the producer sees
        // the bytes as free.
        store_le(&h.r_index, self.r_index, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Heap-backed stand-in for a mapped ring region. The u64 backing keeps
    /// the control header aligned.
    struct Region {
        mem: Box<[u64]>,
        stride: u32,
    }

    impl Region {
        fn new(stride: u32) -> Self {
            let words = stride as usize / 8 + 1;
            let mem = vec![0u64; words].into_boxed_slice();
            let mut region = Self { mem, stride };
            unsafe { Ring::init_header(region.cb(), stride) };
            region
        }

        fn cb(&mut self) -> *mut u8 {
            self.mem.as_mut_ptr() as *mut u8
        }

        /// Producer view and consumer view over the same ring, as the two
        /// processes would hold them.
        fn views(&mut self) -> (Ring, Ring) {
            let cb = self.cb();
            let producer = unsafe { Ring::attach(cb, self.stride) };
            let consumer = unsafe { Ring::attach(cb, self.stride) };
            (producer, consumer)
        }
    }

    // stride 96 gives a 64-byte payload area: small enough that wrap and
    // full conditions are easy to hit.
    const SMALL_STRIDE: u32 = 96;

    #[test]
    fn test_single_packet_roundtrip() {
        let mut region = Region::new(SMALL_STRIDE);
        let (mut tx, mut rx) = region.views();

        assert_eq!(tx.write_packet(b"hello"), WriteResult::Written);
        assert_eq!(tx.w_pkt_wrote, 1);
        assert_eq!(tx.w_index % 4, 0);

        let mut buf = [0u8; 64];
        assert_eq!(rx.read_packet(&mut buf), ReadResult::Read(5));
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(rx.r_pkt_read, 1);
        assert_eq!(rx.r_index % 4, 0);
    }

    #[test]
    fn test_read_empty() {
        let mut region = Region::new(SMALL_STRIDE);
        let (_tx, mut rx) = region.views();

        let mut buf = [0u8; 16];
        assert_eq!(rx.read_packet(&mut buf), ReadResult::Empty);
        assert_eq!(rx.r_pkt_read, 0);
    }

    #[test]
    fn test_fifo_order() {
        let mut region = Region::new(SMALL_STRIDE);
        let (mut tx, mut rx) = region.views();

        assert_eq!(tx.write_packet(b"one"), WriteResult::Written);
        assert_eq!(tx.write_packet(b"two"), WriteResult::Written);

        let mut buf = [0u8; 16];
        assert_eq!(rx.read_packet(&mut buf), ReadResult::Read(3));
        assert_eq!(&buf[..3], b"one");
        assert_eq!(rx.read_packet(&mut buf), ReadResult::Read(3));
        assert_eq!(&buf[..3], b"two");
        assert_eq!(rx.read_packet(&mut buf), ReadResult::Empty);
    }

    #[test]
    fn test_fill_until_full_then_drain() {
        let mut region = Region::new(SMALL_STRIDE);
        let (mut tx, mut rx) = region.views();

        // Payload 4 -> 16-byte footprint in a 64-byte area. The last slot
        // is unusable (w == r must mean empty), so 3 packets fit.
        let mut wrote = 0u32;
        loop {
            match tx.write_packet(&[wrote as u8; 4]) {
                WriteResult::Written => wrote += 1,
                WriteResult::Full => break,
                WriteResult::TooBig => unreachable!(),
            }
        }
        assert_eq!(wrote, 3);
        assert_eq!(tx.w_pkt_lost, 1);

        let mut buf = [0u8; 16];
        for i in 0..wrote {
            assert_eq!(rx.read_packet(&mut buf), ReadResult::Read(4));
            assert_eq!(buf[..4], [i as u8; 4]);
        }
        assert_eq!(rx.read_packet(&mut buf), ReadResult::Empty);

        // The drained space is reusable.
        assert_eq!(tx.write_packet(b"agai"), WriteResult::Written);
        assert_eq!(rx.read_packet(&mut buf), ReadResult::Read(4));
        assert_eq!(&buf[..4], b"agai");
    }

    #[test]
    fn test_wrap_around_fidelity() {
        let mut region = Region::new(SMALL_STRIDE);
        let (mut tx, mut rx) = region.views();

        // 24-byte payloads take 36-byte footprints, so successive packets
        // land at shifting offsets and regularly straddle the wrap.
        let mut buf = [0u8; 64];
        for round in 0u8..50 {
            let payload: Vec<u8> = (0..24).map(|i| round.wrapping_mul(31).wrapping_add(i)).collect();
            assert_eq!(tx.write_packet(&payload), WriteResult::Written);
            assert_eq!(rx.read_packet(&mut buf), ReadResult::Read(24));
            assert_eq!(&buf[..24], payload.as_slice());

            assert!(tx.w_index < tx.const_size);
            assert!(rx.r_index < rx.const_size);
            assert_eq!(tx.w_index % 4, 0);
            assert_eq!(rx.r_index % 4, 0);
        }
    }

    #[test]
    fn test_unaligned_payload_lengths() {
        let mut region = Region::new(SMALL_STRIDE);
        let (mut tx, mut rx) = region.views();

        let mut buf = [0u8; 64];
        for len in 1usize..=9 {
            let payload: Vec<u8> = (0..len as u8).collect();
            assert_eq!(tx.write_packet(&payload), WriteResult::Written);
            assert_eq!(rx.read_packet(&mut buf), ReadResult::Read(len));
            assert_eq!(&buf[..len], payload.as_slice());
            assert_eq!(tx.w_index % 4, 0);
            assert_eq!(rx.r_index % 4, 0);
        }
    }

    #[test]
    fn test_short_buffer_consumes_nothing() {
        let mut region = Region::new(SMALL_STRIDE);
        let (mut tx, mut rx) = region.views();

        assert_eq!(tx.write_packet(b"twenty byte payload!"), WriteResult::Written);

        let mut small = [0u8; 10];
        assert_eq!(
            rx.read_packet(&mut small),
            ReadResult::ShortBuffer { needed: 20 }
        );
        assert_eq!(rx.r_pkt_read, 0);

        // The packet is still first in line.
        let mut buf = [0u8; 32];
        assert_eq!(rx.read_packet(&mut buf), ReadResult::Read(20));
        assert_eq!(&buf[..20], b"twenty byte payload!");
    }

    #[test]
    fn test_oversize_payload_counted_lost() {
        let mut region = Region::new(SMALL_STRIDE);
        let (mut tx, mut rx) = region.views();

        let huge = vec![0u8; SHMX_MAX_LEN + 1];
        assert_eq!(tx.write_packet(&huge), WriteResult::TooBig);
        assert_eq!(tx.w_pkt_lost, 1);
        assert_eq!(tx.w_pkt_wrote, 0);

        let mut buf = [0u8; 16];
        assert_eq!(rx.read_packet(&mut buf), ReadResult::Empty);
    }

    #[test]
    fn test_counter_conservation() {
        let mut region = Region::new(SMALL_STRIDE);
        let (mut tx, mut rx) = region.views();

        let mut buf = [0u8; 16];
        let mut written = 0u32;
        let mut read = 0u32;
        for i in 0u8..40 {
            if tx.write_packet(&[i; 4]) == WriteResult::Written {
                written += 1;
            }
            if i % 3 == 0 {
                if let ReadResult::Read(_) = rx.read_packet(&mut buf) {
                    read += 1;
                }
            }
        }
        while let ReadResult::Read(_) = rx.read_packet(&mut buf) {
            read += 1;
        }

        assert_eq!(tx.w_pkt_wrote, written);
        assert_eq!(rx.r_pkt_read, read);
        assert_eq!(written, read);
        assert_eq!(tx.w_pkt_wrote, rx.r_pkt_read);
    }
}
