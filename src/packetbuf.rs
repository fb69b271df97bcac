//! Pool-backed packet buffer with header push/pull and resolution metadata.
//!
//! `PacketBuf` is the single currency exchanged between the driver
//! boundary and the resolution core.  Besides the frame bytes it carries
//! the metadata the core needs: the owning interface, the L2 header
//! offset, the offset of an ARP message identified by the demultiplexer,
//! whether the frame arrived via the link broadcast address, and, while
//! queued on an unresolved cache entry, the key of that entry.
//!
//! # Ownership
//!
//! `PacketBuf` is move-only (no `Clone`).  Dropping it returns the slot to
//! the global [`BufPool`](crate::pool::BufPool).
//!
//! # Layout
//!
//! ```text
//! |<-- headroom -->|<-- payload (head..tail) -->|<-- tailroom -->|
//! 0            head                          tail          BUF_SIZE
//! ```
//!
//! TX buffers start with `head = tail = HEADROOM` and grow backward
//! ([`push_header`](PacketBuf::push_header)) and forward
//! ([`append`](PacketBuf::append)); RX buffers start at `head = 0` so
//! recorded offsets match wire positions.

use core::fmt;

use crate::ETH_HEADER_LEN;
use crate::pool::{BUF_POOL, BUF_SIZE, BufPool};
use crate::stats::Counter;
use crate::types::{IfIndex, MacAddr, NetError};

/// Headroom reserved by [`PacketBuf::alloc`]: Ethernet (14) + the largest
/// header a caller may still prepend, rounded up.
pub const HEADROOM: u16 = 64;

// =============================================================================
// PacketBuf
// =============================================================================

/// A network frame buffer plus the header fields the resolution core uses.
pub struct PacketBuf {
    pool: &'static BufPool,
    slot: u16,
    /// Start of the active data region.
    head: u16,
    /// End of the active data region (exclusive).
    tail: u16,
    /// Absolute offset of the Ethernet header.
    l2_offset: u16,
    /// Absolute offset of the ARP message, recorded by the demultiplexer.
    arp_offset: u16,
    /// Frame was received via the link broadcast address.
    rx_broadcast: bool,
    /// Owning interface.
    iface: IfIndex,
    /// Key of the cache entry this buffer is queued on, if any.
    pending_key: Option<u32>,
}

impl Drop for PacketBuf {
    fn drop(&mut self) {
        self.pool.release(self.slot);
    }
}

impl fmt::Debug for PacketBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PacketBuf {{ slot={}, if={}, head={}, tail={}, l2={}, arp={}, bcast={} }}",
            self.slot,
            self.iface,
            self.head,
            self.tail,
            self.l2_offset,
            self.arp_offset,
            self.rx_broadcast
        )
    }
}

// =============================================================================
// Constructors
// =============================================================================

impl PacketBuf {
    /// Allocate an empty transmit buffer with [`HEADROOM`] reserved.
    ///
    /// Returns `None` if the pool is exhausted.
    pub fn alloc(iface: IfIndex) -> Option<Self> {
        let slot = BUF_POOL.alloc()?;
        Some(Self {
            pool: &BUF_POOL,
            slot,
            head: HEADROOM,
            tail: HEADROOM,
            l2_offset: 0,
            arp_offset: 0,
            rx_broadcast: false,
            iface,
            pending_key: None,
        })
    }

    /// Allocate a receive buffer and copy raw frame bytes into it.
    ///
    /// Data starts at offset 0 so layer offsets match wire positions.
    /// Returns `None` if the pool is exhausted or the frame is oversized.
    pub fn from_slice(iface: IfIndex, data: &[u8]) -> Option<Self> {
        if data.len() > BUF_SIZE {
            return None;
        }
        let slot = BUF_POOL.alloc()?;
        // SAFETY: the slot was just popped; this PacketBuf is its sole owner.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), BUF_POOL.slot_ptr(slot), data.len());
        }
        Some(Self {
            pool: &BUF_POOL,
            slot,
            head: 0,
            tail: data.len() as u16,
            l2_offset: 0,
            arp_offset: 0,
            rx_broadcast: false,
            iface,
            pending_key: None,
        })
    }
}

// =============================================================================
// Raw access
// =============================================================================

impl PacketBuf {
    #[inline]
    fn data(&self) -> &[u8] {
        // SAFETY: exclusive slot ownership (move-only, no Clone).
        unsafe { core::slice::from_raw_parts(self.pool.slot_ptr(self.slot), BUF_SIZE) }
    }

    #[inline]
    fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: exclusive slot ownership plus `&mut self`.
        unsafe { core::slice::from_raw_parts_mut(self.pool.slot_ptr(self.slot), BUF_SIZE) }
    }
}

// =============================================================================
// Active region
// =============================================================================

impl PacketBuf {
    /// Number of active payload bytes.
    #[inline]
    pub fn len(&self) -> usize {
        (self.tail - self.head) as usize
    }

    /// `true` if the active region is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Active data region `data[head..tail]`.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data()[self.head as usize..self.tail as usize]
    }

    /// Mutable active data region.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let (h, t) = (self.head as usize, self.tail as usize);
        &mut self.data_mut()[h..t]
    }

    /// Expose `len` header bytes by moving `head` backward into the
    /// headroom; the caller fills them in.
    pub fn push_header(&mut self, len: usize) -> Result<&mut [u8], NetError> {
        let len16 = len as u16;
        if self.head < len16 {
            return Err(NetError::NoBufferSpace);
        }
        self.head -= len16;
        let h = self.head as usize;
        Ok(&mut self.data_mut()[h..h + len])
    }

    /// Consume `len` bytes from the front of the active region.
    pub fn pull_header(&mut self, len: usize) -> Result<&[u8], NetError> {
        if len > self.len() {
            return Err(NetError::InvalidArgument);
        }
        let old = self.head as usize;
        self.head += len as u16;
        Ok(&self.data()[old..old + len])
    }

    /// Append bytes at the tail of the active region.
    pub fn append(&mut self, src: &[u8]) -> Result<(), NetError> {
        let new_tail = self.tail as usize + src.len();
        if new_tail > BUF_SIZE {
            return Err(NetError::NoBufferSpace);
        }
        let t = self.tail as usize;
        self.data_mut()[t..new_tail].copy_from_slice(src);
        self.tail = new_tail as u16;
        Ok(())
    }

    /// Shrink the active region so it ends at absolute offset `end`.
    ///
    /// No-op if the region already ends earlier.
    pub fn truncate_at(&mut self, end: u16) {
        if end < self.tail {
            self.tail = end.max(self.head);
        }
    }
}

// =============================================================================
// Resolution metadata
// =============================================================================

impl PacketBuf {
    /// Raw `head` value (absolute offset of the active region).
    #[inline]
    pub fn head(&self) -> u16 {
        self.head
    }

    /// Raw `tail` value.
    #[inline]
    pub fn tail(&self) -> u16 {
        self.tail
    }

    /// Record the absolute offset of the Ethernet header.
    #[inline]
    pub fn set_l2(&mut self, offset: u16) {
        self.l2_offset = offset;
    }

    #[inline]
    pub fn l2_offset(&self) -> u16 {
        self.l2_offset
    }

    /// Record the absolute offset of the ARP message.
    #[inline]
    pub fn set_arp_offset(&mut self, offset: u16) {
        self.arp_offset = offset;
    }

    #[inline]
    pub fn arp_offset(&self) -> u16 {
        self.arp_offset
    }

    /// The ARP message bytes: `data[arp_offset..tail]`.
    ///
    /// Empty if the recorded offset lies outside the active region.
    pub fn arp_msg(&self) -> &[u8] {
        let (start, end) = (self.arp_offset as usize, self.tail as usize);
        if start < self.head as usize || start >= end {
            return &[];
        }
        &self.data()[start..end]
    }

    /// Mark the frame as received via the link broadcast address.
    #[inline]
    pub fn set_rx_broadcast(&mut self, bcast: bool) {
        self.rx_broadcast = bcast;
    }

    #[inline]
    pub fn rx_broadcast(&self) -> bool {
        self.rx_broadcast
    }

    #[inline]
    pub fn iface(&self) -> IfIndex {
        self.iface
    }

    #[inline]
    pub fn set_iface(&mut self, iface: IfIndex) {
        self.iface = iface;
    }

    /// Overwrite the destination address in the Ethernet header.
    ///
    /// Used when a queued frame's next hop resolves.  The L2 offset must
    /// have been recorded when the header was built.
    pub fn set_eth_dst(&mut self, mac: MacAddr) {
        let l2 = self.l2_offset as usize;
        if l2 + ETH_HEADER_LEN > self.tail as usize {
            return;
        }
        self.data_mut()[l2..l2 + 6].copy_from_slice(&mac.0);
    }

    /// Destination address currently in the Ethernet header.
    pub fn eth_dst(&self) -> MacAddr {
        let l2 = self.l2_offset as usize;
        let mut mac = MacAddr::ZERO;
        if l2 + 6 <= self.tail as usize {
            mac.0.copy_from_slice(&self.data()[l2..l2 + 6]);
        }
        mac
    }

    /// Tag the buffer with the cache entry it is queued on.
    #[inline]
    pub(crate) fn set_pending_key(&mut self, key: Option<u32>) {
        self.pending_key = key;
    }

    /// Key of the cache entry this buffer waits on, if any.
    #[inline]
    pub fn pending_key(&self) -> Option<u32> {
        self.pending_key
    }

    /// Discard the buffer through the standard free path, bumping the
    /// given error counter.
    pub fn free(mut self, ctr: Option<&Counter>) {
        self.pending_key = None;
        if let Some(ctr) = ctr {
            ctr.inc();
        }
        // Drop returns the slot.
    }
}
