//! Block buffer cache: a bounded, bucket-hashed pool of cached disk
//! blocks with reference-counted, mutually exclusive access.
//!
//! The pool is an index-based array rather than a pointer-linked list,
//! with a [`SpinLock`] over each bucket's metadata and a per-buffer
//! [`SleepLock`] over content. Buckets are independently lockable: each
//! bucket's chain (and every buffer installed in it) is protected by
//! that bucket's own [`SpinLock`], and a single [`eviction lock`](Self)
//! serializes the cross-bucket scans that install new mappings. That
//! bucket-to-bucket sharing of the metadata array is why `meta`/`heads`
//! below live behind [`UnsafeCell`] rather than inside a `SpinLock<T>`:
//! phase 2 must read a bucket's chain while holding only the eviction
//! lock, which a `SpinLock<T>::lock()` API covering that same data
//! cannot express.

use core::cell::UnsafeCell;
use core::mem::{self, MaybeUninit};

use crate::buf::{BufData, BufGuard};
use crate::disk::BlockDevice;
use crate::error::KernelCoreError;
use crate::param::{NBUF, NBUFMAP_BUCKET};
use crate::sleeplock::SleepLock;
use crate::spinlock::{SpinLock, SpinLockGuard};
use crate::ticks;

/// Sentinel "no next buffer" / "empty bucket" chain link.
const NIL: usize = usize::MAX;

fn bucket_of(blockno: u32) -> usize {
    blockno as usize % NBUFMAP_BUCKET
}

/// Per-buffer bookkeeping, shared across buckets; see the module doc
/// for why this lives behind `UnsafeCell` rather than a `SpinLock<T>`.
#[derive(Debug, Clone, Copy)]
struct BufMeta {
    dev: u32,
    blockno: u32,
    valid: bool,
    refcnt: u32,
    last_use: u64,
    /// Next buffer in this bucket's chain, or [`NIL`].
    next: usize,
}

impl BufMeta {
    const fn new() -> Self {
        Self {
            dev: 0,
            blockno: 0,
            valid: false,
            refcnt: 0,
            last_use: 0,
            next: NIL,
        }
    }
}

/// The block buffer cache.
///
/// Interface: call [`read`](Self::read) for a buffer holding the
/// indicated block's contents; call [`write`](Self::write) after
/// modifying it; call [`release`](Self::release) when done. Do not use
/// a [`BufGuard`] after releasing it — its lifetime already forbids
/// this at compile time.
#[derive(Debug)]
pub struct BCache {
    /// One lock per bucket, guarding that bucket's chain head, every
    /// buffer currently linked into it, and that buffer's `next`.
    bucket_locks: [SpinLock<()>; NBUFMAP_BUCKET],
    /// Serializes cross-bucket eviction/rehash (phases 2-3 of `get`).
    eviction_lock: SpinLock<()>,
    heads: UnsafeCell<[usize; NBUFMAP_BUCKET]>,
    meta: UnsafeCell<[BufMeta; NBUF]>,
    bufs: [SleepLock<BufData>; NBUF],
}

unsafe impl Sync for BCache {}

impl BCache {
    pub const fn new() -> Self {
        let bucket_locks = {
            let mut array: [MaybeUninit<SpinLock<()>>; NBUFMAP_BUCKET] =
                unsafe { MaybeUninit::uninit().assume_init() };
            let mut i = 0;
            while i < NBUFMAP_BUCKET {
                array[i] = MaybeUninit::new(SpinLock::new((), "bcache_bucket"));
                i += 1;
            }
            unsafe { mem::transmute(array) }
        };

        let bufs = {
            let mut array: [MaybeUninit<SleepLock<BufData>>; NBUF] =
                unsafe { MaybeUninit::uninit().assume_init() };
            let mut i = 0;
            while i < NBUF {
                array[i] = MaybeUninit::new(SleepLock::new(BufData::new(), "buffer"));
                i += 1;
            }
            unsafe { mem::transmute(array) }
        };

        Self {
            bucket_locks,
            eviction_lock: SpinLock::new((), "bcache_eviction"),
            heads: UnsafeCell::new([NIL; NBUFMAP_BUCKET]),
            meta: UnsafeCell::new([BufMeta::new(); NBUF]),
            bufs,
        }
    }

    /// # Safety
    /// Caller must hold a lock covering the bucket this index's buffer
    /// currently belongs to (its own bucket lock, or the eviction lock
    /// during phase 2/3, per the module doc).
    #[allow(clippy::mut_from_ref)]
    unsafe fn meta_mut(&self) -> &mut [BufMeta; NBUF] {
        unsafe { &mut *self.meta.get() }
    }

    unsafe fn meta(&self) -> &[BufMeta; NBUF] {
        unsafe { &*self.meta.get() }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn heads_mut(&self) -> &mut [usize; NBUFMAP_BUCKET] {
        unsafe { &mut *self.heads.get() }
    }

    unsafe fn heads(&self) -> &[usize; NBUFMAP_BUCKET] {
        unsafe { &*self.heads.get() }
    }

    /// Initializes the pool: every buffer starts on bucket 0, unlinked
    /// from any disk identity, refcnt 0.
    ///
    /// # Safety
    /// Must be called exactly once, before any other `BCache` method.
    pub unsafe fn init(&self) {
        let heads = unsafe { self.heads_mut() };
        let meta = unsafe { self.meta_mut() };
        *heads = [NIL; NBUFMAP_BUCKET];
        for i in 0..NBUF {
            meta[i] = BufMeta::new();
            meta[i].next = heads[0];
            heads[0] = i;
        }
        log::debug!("bcache: initialized {NBUF} buffers across {NBUFMAP_BUCKET} buckets");
    }

    /// Walks `bucket`'s chain for a buffer matching `(dev, blockno)`.
    ///
    /// # Safety
    /// Caller must hold a lock covering `bucket` (its own bucket lock,
    /// or the eviction lock).
    unsafe fn find_in_bucket(&self, bucket: usize, dev: u32, blockno: u32) -> Option<usize> {
        let meta = unsafe { self.meta() };
        let mut cur = unsafe { self.heads() }[bucket];
        while cur != NIL {
            if meta[cur].dev == dev && meta[cur].blockno == blockno {
                return Some(cur);
            }
            cur = meta[cur].next;
        }
        None
    }

    /// Looks up `(dev, blockno)` in the cache, installing it via
    /// eviction on a miss. Returns the content lock held.
    ///
    /// See the module doc for the three-phase protocol this implements.
    fn get(&self, dev: u32, blockno: u32) -> BufGuard<'_> {
        let key = bucket_of(blockno);

        // Phase 1 — fast lookup.
        {
            let _bucket = self.bucket_locks[key].lock();
            if let Some(index) = unsafe { self.find_in_bucket(key, dev, blockno) } {
                unsafe { self.meta_mut()[index].refcnt += 1 };
                log::trace!("bcache: hit dev={dev} blockno={blockno} index={index}");
                drop(_bucket);
                let guard = self.bufs[index].lock();
                return BufGuard { index, dev, blockno, guard };
            }
        }

        // Phase 2 — serialize misses behind the eviction lock and
        // re-scan, in case another hart installed this block while we
        // were waiting. Re-take the bucket lock before bumping refcnt:
        // bumping it under only the eviction lock would race a
        // concurrent `release` on the same bucket, which also takes
        // only the bucket lock.
        let eviction = self.eviction_lock.lock();
        if let Some(index) = unsafe { self.find_in_bucket(key, dev, blockno) } {
            {
                let _bucket = self.bucket_locks[key].lock();
                unsafe { self.meta_mut()[index].refcnt += 1 };
            }
            log::warn!("bcache: concurrent installer beat us to dev={dev} blockno={blockno}");
            drop(eviction);
            let guard = self.bufs[index].lock();
            return BufGuard { index, dev, blockno, guard };
        }

        // Phase 3 — select and rehash a victim.
        let index = self.evict_victim();
        {
            let _bucket = self.bucket_locks[key].lock();
            let heads = unsafe { self.heads_mut() };
            let meta = unsafe { self.meta_mut() };
            meta[index].next = heads[key];
            heads[key] = index;
            meta[index].dev = dev;
            meta[index].blockno = blockno;
            meta[index].valid = false;
            meta[index].refcnt = 1;
        }
        log::debug!("bcache: miss, evicted index={index} for dev={dev} blockno={blockno}");
        drop(eviction);
        let guard = self.bufs[index].lock();
        BufGuard { index, dev, blockno, guard }
    }

    /// Scans every bucket for the buffer with the smallest `last_use`
    /// among those with `refcnt == 0`, unlinks it from its bucket, and
    /// returns its index. Holds at most one bucket lock at a time.
    ///
    /// Caller must already hold the eviction lock.
    fn evict_victim(&self) -> usize {
        let mut held: Option<SpinLockGuard<'_, ()>> = None;
        let mut best: Option<(usize, Option<usize>, usize, u64)> = None; // (bucket, prev, index, last_use)

        for bucket in 0..NBUFMAP_BUCKET {
            let guard = self.bucket_locks[bucket].lock();
            let meta = unsafe { self.meta() };
            let heads = unsafe { self.heads() };

            let mut prev: Option<usize> = None;
            let mut cur = heads[bucket];
            let mut local: Option<(Option<usize>, usize, u64)> = None;
            while cur != NIL {
                if meta[cur].refcnt == 0 {
                    let better = match local {
                        None => true,
                        Some((_, _, last_use)) => meta[cur].last_use < last_use,
                    };
                    if better {
                        local = Some((prev, cur, meta[cur].last_use));
                    }
                }
                prev = Some(cur);
                cur = meta[cur].next;
            }

            match local {
                Some((prev, index, last_use)) => {
                    let better = match best {
                        None => true,
                        Some((_, _, _, best_use)) => last_use < best_use,
                    };
                    if better {
                        best = Some((bucket, prev, index, last_use));
                        held = Some(guard);
                    } else {
                        drop(guard);
                    }
                }
                None => drop(guard),
            }
        }

        let (bucket, prev, index, _) = match best {
            Some(b) => b,
            None => crate::fatal!("bget: no buffers"),
        };
        let _guard = held.expect("evict_victim: best bucket has no held lock");

        let meta = unsafe { self.meta_mut() };
        let next = meta[index].next;
        match prev {
            Some(p) => meta[p].next = next,
            None => unsafe { self.heads_mut()[bucket] = next },
        }
        index
    }

    /// Returns a buffer holding `(dev, blockno)`'s contents, reading it
    /// from `disk` on a cache miss.
    pub fn read<D: BlockDevice>(
        &self,
        disk: &D,
        dev: u32,
        blockno: u32,
    ) -> Result<BufGuard<'_>, KernelCoreError<D::Error>> {
        let mut buf = self.get(dev, blockno);
        let index = buf.index();

        if !unsafe { self.meta()[index].valid } {
            if let Err(err) = disk.disk_rw(dev, blockno, &mut buf.guard.bytes, false) {
                self.release(buf);
                return Err(KernelCoreError::Disk(err));
            }
            let _bucket = self.bucket_locks[bucket_of(blockno)].lock();
            unsafe { self.meta_mut()[index].valid = true };
        }

        Ok(buf)
    }

    /// Persists `buf`'s contents to `disk`. The caller statically holds
    /// `buf`'s content lock for the duration of this call.
    pub fn write<D: BlockDevice>(
        &self,
        disk: &D,
        buf: &mut BufGuard<'_>,
    ) -> Result<(), KernelCoreError<D::Error>> {
        disk.disk_rw(buf.dev, buf.blockno, &mut buf.guard.bytes, true)
            .map_err(KernelCoreError::Disk)
    }

    /// Releases a locked buffer. Stamps `last_use` if this was the last
    /// reference; the buffer is not unlinked and remains cached until
    /// some later `get` chooses it as an eviction victim.
    pub fn release(&self, buf: BufGuard<'_>) {
        let key = bucket_of(buf.blockno);
        let index = buf.index;
        drop(buf); // drops the content sleep-lock first

        let _bucket = self.bucket_locks[key].lock();
        let meta = unsafe { self.meta_mut() };
        meta[index].refcnt -= 1;
        if meta[index].refcnt == 0 {
            meta[index].last_use = ticks::now();
        }
    }

    /// Increments `buf`'s refcount without touching its content lock,
    /// keeping it resident across `release`/`read` cycles.
    pub fn pin(&self, buf: &BufGuard<'_>) {
        let key = bucket_of(buf.blockno);
        let _bucket = self.bucket_locks[key].lock();
        unsafe { self.meta_mut()[buf.index].refcnt += 1 };
    }

    /// Decrements `buf`'s refcount without touching its content lock.
    pub fn unpin(&self, buf: &BufGuard<'_>) {
        let key = bucket_of(buf.blockno);
        let _bucket = self.bucket_locks[key].lock();
        unsafe { self.meta_mut()[buf.index].refcnt -= 1 };
    }
}

impl Default for BCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::mock::MockDisk;

    fn cache() -> BCache {
        let c = BCache::new();
        unsafe { c.init() };
        c
    }

    #[test]
    fn cache_hit_reuses_identity_without_second_disk_rw() {
        let c = cache();
        let disk = MockDisk::new();

        let b = c.read(&disk, 1, 42).unwrap();
        let index = b.index();
        c.release(b);

        let b2 = c.read(&disk, 1, 42).unwrap();
        assert_eq!(b2.index(), index);
        assert!(b2.data().iter().all(|&b| b == 42));
        assert_eq!(disk.reads_of(1, 42), 1);
        c.release(b2);
    }

    #[test]
    fn eviction_picks_lru_and_issues_one_disk_rw() {
        let c = cache();
        let disk = MockDisk::new();

        // Give each block a distinct last_use, oldest to newest, so the
        // victim choice is unambiguous.
        for blockno in 0..NBUF as u32 {
            let b = c.read(&disk, 1, blockno).unwrap();
            c.release(b);
            ticks::advance();
        }

        let b = c.read(&disk, 1, NBUF as u32 + 7).unwrap();
        assert_eq!(disk.reads_of(1, NBUF as u32 + 7), 1);
        assert!(b.data().iter().all(|&byte| byte == (NBUF as u32 + 7) as u8));
        c.release(b);

        // Block 0 had the smallest last_use and must be the one evicted
        // to make room.
        let b0 = c.read(&disk, 1, 0).unwrap();
        assert_eq!(disk.reads_of(1, 0), 2);
        c.release(b0);

        // Block NBUF - 1 had the largest last_use and must still be
        // cached: no second disk_rw for it.
        let newest = NBUF as u32 - 1;
        let b_newest = c.read(&disk, 1, newest).unwrap();
        assert_eq!(disk.reads_of(1, newest), 1);
        c.release(b_newest);
    }

    #[test]
    fn pin_survives_release_under_cache_pressure() {
        let c = cache();
        let disk = MockDisk::new();

        let b = c.read(&disk, 1, 5).unwrap();
        c.pin(&b);
        c.release(b);

        // Fill the rest of the pool; the pinned block must never be
        // chosen as a victim.
        for blockno in 100..(100 + NBUF as u32) {
            let b = c.read(&disk, 1, blockno).unwrap();
            c.release(b);
        }

        let b = c.read(&disk, 1, 5).unwrap();
        // If it had been evicted, re-reading it would re-issue disk_rw.
        assert_eq!(disk.reads_of(1, 5), 1);
        c.unpin(&b);
        c.release(b);
    }

    #[test]
    fn failed_read_does_not_leak_the_slot() {
        let c = cache();
        let disk = MockDisk::new();
        disk.fail_reads_of(1, 9);

        assert!(c.read(&disk, 1, 9).is_err());

        // The slot a failed read installed for (1, 9) must be releasable
        // for other blocks, not stuck at refcnt 1 forever.
        for blockno in 0..NBUF as u32 {
            let b = c.read(&disk, 1, blockno).unwrap();
            c.release(b);
        }
    }

    #[test]
    #[should_panic(expected = "no buffers")]
    fn exhausting_pool_with_live_refs_is_fatal() {
        let c = cache();
        let disk = MockDisk::new();
        let mut held = Vec::new();
        for blockno in 0..NBUF as u32 + 1 {
            held.push(c.read(&disk, 1, blockno).unwrap());
        }
    }
}
