//! The block device interface `bcache` calls on a cache miss.
//!
//! A synchronous, possibly-blocking read/write of one block, otherwise
//! opaque to the cache. Modeled as a trait rather than a bare function
//! so the cache can be driven by a deterministic in-memory double in
//! tests, which need a way to count and inspect calls to assert things
//! like "exactly one disk read was issued for this block".

use crate::param::BSIZE;

/// A synchronous block device.
///
/// Implementors must not sleep or block in a way that could re-enter
/// the buffer cache. `disk_rw` is never called while holding a
/// spin-lock, but the trait itself has no opinion on that — it is
/// `bcache`'s job to only call it from the sleep-lock section of
/// `read`.
pub trait BlockDevice: Sync {
    /// The error a failed read or write reports.
    type Error;

    /// Reads or writes one block's worth of bytes.
    ///
    /// `write == false` reads `dev`'s `blockno` into `data`; `write ==
    /// true` persists `data` to `dev`'s `blockno`.
    fn disk_rw(&self, dev: u32, blockno: u32, data: &mut [u8; BSIZE], write: bool)
    -> Result<(), Self::Error>;
}
