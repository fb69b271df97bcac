//! Pre-allocated frame buffer pool with lock-free allocation.
//!
//! Backing storage is a static array in BSS; allocation and release are
//! O(1) pushes and pops on a Treiber stack whose head carries a version
//! tag to defeat ABA races.  Any context may allocate or release without
//! taking a lock, which keeps the pool usable from the receive path and
//! from timer callbacks alike.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};

/// Size of each buffer slot in bytes.
///
/// Covers a maximum Ethernet frame (1518) plus reserved headroom.
pub const BUF_SIZE: usize = 1664;

/// Number of pre-allocated buffer slots.
pub const POOL_SIZE: usize = 128;

/// Freelist terminator / pool-exhausted sentinel.
const SLOT_NONE: u16 = u16::MAX;

// =============================================================================
// Backing storage
// =============================================================================

/// Raw slot storage, 64-byte aligned.
///
/// Interior mutability is sound because the pool hands each slot to at
/// most one [`PacketBuf`](crate::packetbuf::PacketBuf) at a time and
/// `PacketBuf` is move-only.
#[repr(C, align(64))]
struct SlotStorage {
    bytes: UnsafeCell<[[u8; BUF_SIZE]; POOL_SIZE]>,
}

// SAFETY: slot access is serialized by pool ownership; a slot is touched
// only through the PacketBuf that owns it.
unsafe impl Sync for SlotStorage {}

static SLOT_STORAGE: SlotStorage = SlotStorage {
    bytes: UnsafeCell::new([[0u8; BUF_SIZE]; POOL_SIZE]),
};

// =============================================================================
// BufPool
// =============================================================================

/// Lock-free fixed buffer pool.
///
/// `head` packs `(version << 16) | slot_index`; the version increments on
/// every successful CAS so a slot popped and pushed back between an
/// observer's load and its CAS cannot be mistaken for an unchanged stack.
pub struct BufPool {
    head: AtomicU32,
    /// Intrusive freelist: for each free slot, the next free slot.
    next: [AtomicU16; POOL_SIZE],
    avail: AtomicUsize,
    initialized: AtomicBool,
}

// SAFETY: all fields are atomics.
unsafe impl Send for BufPool {}
unsafe impl Sync for BufPool {}

/// The global frame buffer pool.
///
/// [`BufPool::init`] must run once before any allocation;
/// [`ArpCore::new`](crate::arp::ArpCore::new) does so.
pub static BUF_POOL: BufPool = BufPool {
    head: AtomicU32::new(SLOT_NONE as u32),
    next: [const { AtomicU16::new(0) }; POOL_SIZE],
    avail: AtomicUsize::new(0),
    initialized: AtomicBool::new(false),
};

impl BufPool {
    /// Build the freelist chain `0 → 1 → … → POOL_SIZE-1 → ∅`.
    ///
    /// Idempotent; later calls are no-ops.
    pub fn init(&self) {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return;
        }
        for i in 0..POOL_SIZE {
            let next = if i + 1 < POOL_SIZE { (i + 1) as u16 } else { SLOT_NONE };
            self.next[i].store(next, Ordering::Relaxed);
        }
        // Release publishes the chain built above to whoever sees the head.
        self.head.store(0, Ordering::Release);
        self.avail.store(POOL_SIZE, Ordering::Release);
    }

    /// Pop a free slot.  Returns `None` when the pool is exhausted.
    pub fn alloc(&self) -> Option<u16> {
        loop {
            let old = self.head.load(Ordering::Acquire);
            let slot = (old & 0xffff) as u16;
            if slot == SLOT_NONE {
                return None;
            }
            let ver = old >> 16;
            let next = self.next[slot as usize].load(Ordering::Relaxed);
            let new = (ver.wrapping_add(1) << 16) | (next as u32);
            if self
                .head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.avail.fetch_sub(1, Ordering::Relaxed);
                return Some(slot);
            }
            core::hint::spin_loop();
        }
    }

    /// Push a slot back.  The caller must not touch the slot afterwards.
    pub fn release(&self, slot: u16) {
        debug_assert!((slot as usize) < POOL_SIZE, "release: slot {} out of range", slot);
        loop {
            let old = self.head.load(Ordering::Acquire);
            let old_slot = (old & 0xffff) as u16;
            let ver = old >> 16;
            self.next[slot as usize].store(old_slot, Ordering::Relaxed);
            let new = (ver.wrapping_add(1) << 16) | (slot as u32);
            if self
                .head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.avail.fetch_add(1, Ordering::Relaxed);
                return;
            }
            core::hint::spin_loop();
        }
    }

    /// Free slot count.  Racy under concurrency; diagnostic only.
    #[inline]
    pub fn available(&self) -> usize {
        self.avail.load(Ordering::Relaxed)
    }

    /// Raw pointer to the first byte of `slot`, valid for [`BUF_SIZE`] bytes.
    ///
    /// The caller must own the slot and must not create aliasing mutable
    /// references.
    #[inline]
    pub(crate) fn slot_ptr(&self, slot: u16) -> *mut u8 {
        debug_assert!((slot as usize) < POOL_SIZE);
        // SAFETY: in-bounds by the assert; UnsafeCell grants the mutable
        // pointer, exclusivity comes from slot ownership.
        unsafe { (SLOT_STORAGE.bytes.get() as *mut u8).add(slot as usize * BUF_SIZE) }
    }
}
