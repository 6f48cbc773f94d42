//! Byte-granular single-producer/multi-consumer ring over shared memory.
//!
//! The broker owns two of these: clients produce into the client→server ring
//! (multi-producer in practice, so reservation is a CAS), the broker produces
//! into the server→client ring and every client consumes it with its own
//! cursor. Readers never coordinate with each other or with producers:
//! producers advance a global reservation counter and overwrite the oldest
//! slots when the ring is full. Slow consumers lose frames; they never block
//! a producer.
//!
//! Each slot starts with a small header whose `seq` atomic is the visibility
//! word: `publish` release-stores the slot's sequence there, `read` acquires
//! it. A reader whose cursor has been lapped finds a sequence newer than its
//! own and resynchronizes at that slot, skipping everything it lost.

use crate::error::{Error, Result};
use crate::shm::SharedSegment;
use std::sync::atomic::{AtomicU64, Ordering};

const MAGIC: u64 = 0x77736d_75785f7251; // "wsmux_rQ"

/// Ring control block at the head of the segment.
#[repr(C)]
struct RingHeader {
    magic: u64,
    capacity: u64,
    /// Ever-increasing byte sequence; next free slot starts here.
    reserved: AtomicU64,
    _pad: [u8; 40],
}

const RING_HEADER_LEN: usize = 64;
const _: () = assert!(std::mem::size_of::<RingHeader>() == RING_HEADER_LEN);

/// Per-slot header preceding the payload.
#[repr(C)]
struct SlotHeader {
    /// Sequence-at-publish plus one; zero means never written.
    seq: AtomicU64,
    len: u32,
    flags: u32,
}

const SLOT_HEADER_LEN: usize = 16;
const _: () = assert!(std::mem::size_of::<SlotHeader>() == SLOT_HEADER_LEN);

/// Slot inserted at the wrap boundary when a reservation would not fit in
/// the tail of the ring; readers skip it transparently.
const FLAG_PAD: u32 = 1;

/// Smallest ring we will create.
const MIN_CAPACITY: u64 = 4096;

/// A named shared-memory ring queue.
pub struct RingQueue {
    seg: SharedSegment,
}

impl RingQueue {
    /// Create a fresh ring with at least `capacity` payload bytes, replacing
    /// any stale segment of the same name. Capacity is rounded up to a power
    /// of two.
    pub fn create(name: &str, capacity: u32) -> Result<Self> {
        let capacity = (capacity as u64).max(MIN_CAPACITY).next_power_of_two();
        let seg = SharedSegment::create(name, RING_HEADER_LEN + capacity as usize)?;
        unsafe {
            let hdr = seg.as_ptr() as *mut RingHeader;
            (*hdr).capacity = capacity;
            // Attachers key on the magic; it goes in last.
            (*hdr).magic = MAGIC;
        }
        Ok(Self { seg })
    }

    /// Attach to a ring the broker has already created. The window between
    /// segment creation and header initialization surfaces as
    /// [`Error::BadMagic`]; callers attaching at startup retry it like
    /// [`Error::SegmentMissing`].
    pub fn attach(name: &str) -> Result<Self> {
        let seg = SharedSegment::attach(name, RING_HEADER_LEN + MIN_CAPACITY as usize)?;
        let ring = Self { seg };
        {
            let hdr = ring.header();
            if hdr.magic != MAGIC || !hdr.capacity.is_power_of_two() {
                return Err(Error::BadMagic(name.to_string()));
            }
            let need = RING_HEADER_LEN + hdr.capacity as usize;
            if ring.seg.len() < need {
                return Err(Error::SegmentTruncated {
                    name: name.to_string(),
                    len: ring.seg.len(),
                    expected: need,
                });
            }
        }
        Ok(ring)
    }

    pub fn name(&self) -> &str {
        self.seg.name()
    }

    pub fn capacity(&self) -> u64 {
        self.header().capacity
    }

    /// Atomically allocate `size` contiguous payload bytes. Returns the slot
    /// sequence and a writable pointer to the payload area. Never fails:
    /// when the ring is full the oldest unconsumed slots are overwritten.
    ///
    /// Frames larger than the ring itself are a caller bug, not a runtime
    /// condition; the size caps in `wire` keep every frame far below it.
    pub fn reserve(&self, size: u32) -> (u64, *mut u8) {
        let total = slot_span(size);
        let cap = self.capacity();
        assert!(
            total <= cap,
            "frame of {size} bytes cannot fit a {cap}-byte ring"
        );
        let hdr = self.header();
        loop {
            let head = hdr.reserved.load(Ordering::Relaxed);
            let off = head & (cap - 1);
            if off + total <= cap {
                if hdr
                    .reserved
                    .compare_exchange_weak(head, head + total, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    let payload = unsafe { self.data_ptr().add(off as usize + SLOT_HEADER_LEN) };
                    return (head, payload);
                }
            } else {
                // Not enough room before the wrap point: burn the tail as a
                // pad slot and retry from the ring start.
                let pad = cap - off;
                if hdr
                    .reserved
                    .compare_exchange_weak(head, head + pad, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    let slot = self.slot(off as usize);
                    unsafe {
                        (*slot).len = (pad as usize - SLOT_HEADER_LEN) as u32;
                        (*slot).flags = FLAG_PAD;
                        (*slot).seq.store(head + 1, Ordering::Release);
                    }
                }
            }
        }
    }

    /// Make a reserved slot visible to readers. Pairs with the acquire load
    /// in [`read`](Self::read); the payload must be fully written first.
    pub fn publish(&self, index: u64, size: u32) {
        let off = (index & (self.capacity() - 1)) as usize;
        let slot = self.slot(off);
        unsafe {
            (*slot).len = size;
            (*slot).flags = 0;
            (*slot).seq.store(index + 1, Ordering::Release);
        }
    }

    /// Non-blocking read of the next message for `cursor`. Returns a pointer
    /// into the mapping and the payload length, or `None` when nothing newer
    /// than the cursor has been published. A lapped cursor skips forward to
    /// the oldest slot still live.
    pub fn read(&self, cursor: &mut u64) -> Option<(*mut u8, u32)> {
        let cap = self.capacity();
        loop {
            let c = *cursor;
            let off = (c & (cap - 1)) as usize;
            let slot = self.slot(off);
            let seq = unsafe { (*slot).seq.load(Ordering::Acquire) };
            if seq < c + 1 {
                return None;
            }
            if seq == c + 1 {
                let (len, flags) = unsafe { ((*slot).len, (*slot).flags) };
                if len as u64 > cap - off as u64 - SLOT_HEADER_LEN as u64 {
                    // Torn slot header: a producer lapped us mid-read. All
                    // intermediate slots are lost; restart at the head.
                    *cursor = self.header().reserved.load(Ordering::Acquire);
                    return None;
                }
                *cursor = c + slot_span(len);
                if flags & FLAG_PAD != 0 {
                    continue;
                }
                let payload = unsafe { self.data_ptr().add(off + SLOT_HEADER_LEN) };
                return Some((payload, len));
            }
            // seq > c + 1: this position was republished on a later lap.
            // Everything between the cursor and that sequence is gone.
            *cursor = seq - 1;
        }
    }

    /// A starting cursor that skips every message already in the ring.
    pub fn initial_reading_index(&self) -> u64 {
        self.header().reserved.load(Ordering::Acquire)
    }

    fn header(&self) -> &RingHeader {
        unsafe { &*(self.seg.as_ptr() as *const RingHeader) }
    }

    fn data_ptr(&self) -> *mut u8 {
        unsafe { self.seg.as_ptr().add(RING_HEADER_LEN) }
    }

    fn slot(&self, off: usize) -> *mut SlotHeader {
        unsafe { self.data_ptr().add(off) as *mut SlotHeader }
    }
}

/// Bytes a payload occupies in the ring including its slot header, kept
/// 16-aligned so slot headers always land on atomic-friendly addresses.
fn slot_span(size: u32) -> u64 {
    ((SLOT_HEADER_LEN + size as usize + 15) & !15) as u64
}
