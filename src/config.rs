//! Runtime-tunable resolution parameters.
//!
//! Every knob is a single word read with one relaxed atomic load, so the
//! receive path, timer callbacks, and API callers never take a lock to
//! consult configuration.  Setters validate against the documented range
//! and reject out-of-range values without touching state.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::types::NetError;

/// Timer tick rate assumed by the second-based knobs (10 ms per tick).
pub const TICK_HZ: u64 = 100;

/// Resolved/renew cache timeout bounds and default, in seconds.
pub const CACHE_TIMEOUT_MIN_SECS: u32 = 60;
pub const CACHE_TIMEOUT_MAX_SECS: u32 = 600;
pub const CACHE_TIMEOUT_DFLT_SECS: u32 = 600;

/// Pending-state request retry interval bounds and default, in seconds.
pub const RETRY_TIMEOUT_MIN_SECS: u32 = 1;
pub const RETRY_TIMEOUT_MAX_SECS: u32 = 10;
pub const RETRY_TIMEOUT_DFLT_SECS: u32 = 5;

/// Pending-state retry count bounds and default.  The state machine counts
/// *attempts*; max attempts = max retries + 1.
pub const REQ_RETRY_MAX: u32 = 5;
pub const REQ_RETRY_DFLT: u32 = 3;

/// Renew-state retry default.  Not exposed as a knob.
pub const RENEW_RETRY_DFLT: u8 = 15;

/// MRU promotion threshold bounds and default, in successful lookups.
pub const ACCESSED_TH_MIN: u32 = 10;
pub const ACCESSED_TH_MAX: u32 = 65000;
pub const ACCESSED_TH_DFLT: u32 = 100;

/// Default per-entry pending transmit queue threshold, in buffers.
pub const TXQ_TH_DFLT: u32 = 2;

// =============================================================================
// ArpConfig
// =============================================================================

/// Tunable parameters of the resolution core.
///
/// One instance lives in each [`ArpCore`](crate::arp::ArpCore).  Reads are
/// wait-free; writes are rare (application configuration calls).
pub struct ArpConfig {
    /// Renew timer period, seconds.
    cache_timeout_secs: AtomicU32,
    /// Pending retry interval, seconds.
    retry_timeout_secs: AtomicU32,
    /// Maximum request attempts while Pending (retries + 1).
    max_attempts_pend: AtomicU32,
    /// Per-entry pending FIFO threshold, buffers.
    txq_threshold: AtomicU32,
    /// Lookups before an entry is promoted to the list head.
    accessed_threshold: AtomicU32,
    /// Discard resolution messages not directly addressed to this host.
    addr_filter: AtomicBool,
}

impl ArpConfig {
    pub const fn new() -> Self {
        Self {
            cache_timeout_secs: AtomicU32::new(CACHE_TIMEOUT_DFLT_SECS),
            retry_timeout_secs: AtomicU32::new(RETRY_TIMEOUT_DFLT_SECS),
            max_attempts_pend: AtomicU32::new(REQ_RETRY_DFLT + 1),
            txq_threshold: AtomicU32::new(TXQ_TH_DFLT),
            accessed_threshold: AtomicU32::new(ACCESSED_TH_DFLT),
            addr_filter: AtomicBool::new(true),
        }
    }

    // -- setters --------------------------------------------------------------

    /// Configure the resolved-entry renew period (60–600 s).
    pub fn set_cache_timeout(&self, secs: u32) -> Result<(), NetError> {
        if !(CACHE_TIMEOUT_MIN_SECS..=CACHE_TIMEOUT_MAX_SECS).contains(&secs) {
            return Err(NetError::InvalidArgument);
        }
        self.cache_timeout_secs.store(secs, Ordering::Relaxed);
        Ok(())
    }

    /// Configure the pending-state request retry interval (1–10 s).
    pub fn set_retry_timeout(&self, secs: u32) -> Result<(), NetError> {
        if !(RETRY_TIMEOUT_MIN_SECS..=RETRY_TIMEOUT_MAX_SECS).contains(&secs) {
            return Err(NetError::InvalidArgument);
        }
        self.retry_timeout_secs.store(secs, Ordering::Relaxed);
        Ok(())
    }

    /// Configure the number of request retries while Pending (0–5).
    pub fn set_max_retries(&self, retries: u32) -> Result<(), NetError> {
        if retries > REQ_RETRY_MAX {
            return Err(NetError::InvalidArgument);
        }
        self.max_attempts_pend.store(retries + 1, Ordering::Relaxed);
        Ok(())
    }

    /// Configure the per-entry pending FIFO threshold.
    ///
    /// The upper bound against the owning interface's transmit-buffer
    /// capacity is enforced at enqueue time, where the interface is known.
    pub fn set_txq_threshold(&self, buffers: u32) -> Result<(), NetError> {
        if buffers > u16::MAX as u32 {
            return Err(NetError::InvalidArgument);
        }
        self.txq_threshold.store(buffers, Ordering::Relaxed);
        Ok(())
    }

    /// Configure the MRU promotion threshold (10–65000 lookups).
    pub fn set_accessed_threshold(&self, lookups: u32) -> Result<(), NetError> {
        if !(ACCESSED_TH_MIN..=ACCESSED_TH_MAX).contains(&lookups) {
            return Err(NetError::InvalidArgument);
        }
        self.accessed_threshold.store(lookups, Ordering::Relaxed);
        Ok(())
    }

    /// Enable or disable the address filter.
    pub fn set_addr_filter(&self, en: bool) {
        self.addr_filter.store(en, Ordering::Relaxed);
    }

    // -- getters --------------------------------------------------------------

    #[inline]
    pub fn cache_timeout_ticks(&self) -> u64 {
        self.cache_timeout_secs.load(Ordering::Relaxed) as u64 * TICK_HZ
    }

    #[inline]
    pub fn retry_timeout_ticks(&self) -> u64 {
        self.retry_timeout_secs.load(Ordering::Relaxed) as u64 * TICK_HZ
    }

    #[inline]
    pub fn max_attempts_pend(&self) -> u8 {
        self.max_attempts_pend.load(Ordering::Relaxed) as u8
    }

    #[inline]
    pub fn max_attempts_renew(&self) -> u8 {
        RENEW_RETRY_DFLT + 1
    }

    #[inline]
    pub fn txq_threshold(&self) -> u16 {
        self.txq_threshold.load(Ordering::Relaxed) as u16
    }

    #[inline]
    pub fn accessed_threshold(&self) -> u16 {
        self.accessed_threshold.load(Ordering::Relaxed) as u16
    }

    #[inline]
    pub fn addr_filter(&self) -> bool {
        self.addr_filter.load(Ordering::Relaxed)
    }
}

impl Default for ArpConfig {
    fn default() -> Self {
        Self::new()
    }
}
