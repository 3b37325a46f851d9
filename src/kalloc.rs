//! Physical page allocator with per-frame reference counts.
//!
//! An intrusive, `NonNull`-linked free list over a fixed pool of
//! page-size frames, each with a signed reference count rather than a
//! simple free/used bit, so a page shared by a copy-on-write fork can
//! be freed by one owner without affecting the other's mapping. The
//! managed range is passed to `init` rather than assumed from a linker
//! symbol, so tests can back it with a plain byte array.
//!
//! Frame-index lookup is a real bounds and alignment check —
//! [`Inner::frame_index`] returns `None` outside the managed range or
//! off a page boundary, and every caller treats that as fatal — and the
//! free-list walk in [`PageAllocator::free_count`] is a guarded
//! `Option` chain that stops cleanly at an empty list.

use core::mem::size_of;
use core::ptr::NonNull;

use crate::param::{ALLOC_JUNK, FREE_JUNK};
use crate::spinlock::SpinLock;

/// An intrusive free-list node, overlaid on a free frame's own storage.
struct Run {
    next: Option<NonNull<Run>>,
}

struct Inner<const PAGE_SIZE: usize, const MAX_FRAMES: usize> {
    /// First managed address (`kernel_end`), fixed by `init`.
    base: usize,
    /// First address past the managed range (`PHYSTOP`).
    limit: usize,
    /// Signed per-frame reference count, indexed by `(pa - base) / PAGE_SIZE`.
    refcount: [i32; MAX_FRAMES],
    free_list: Option<NonNull<Run>>,
}

impl<const PAGE_SIZE: usize, const MAX_FRAMES: usize> Inner<PAGE_SIZE, MAX_FRAMES> {
    /// Maps a physical address to a frame index, or `None` if it is
    /// misaligned or outside `[base, limit)`.
    fn frame_index(&self, pa: usize) -> Option<usize> {
        if pa % PAGE_SIZE != 0 || pa < self.base || pa >= self.limit {
            None
        } else {
            Some((pa - self.base) / PAGE_SIZE)
        }
    }
}

/// A physical page allocator over `MAX_FRAMES` frames of `PAGE_SIZE`
/// bytes each.
///
/// `MAX_FRAMES` is a compile-time upper bound the caller picks; the
/// live frame count is whatever range `init` is given, which must fit
/// within it.
#[derive(Debug)]
pub struct PageAllocator<const PAGE_SIZE: usize, const MAX_FRAMES: usize> {
    inner: SpinLock<Inner<PAGE_SIZE, MAX_FRAMES>>,
}

// `Inner` is `!Send` only because it holds a `NonNull`; the pointer
// never aliases outside the frames this allocator itself owns.
unsafe impl<const PAGE_SIZE: usize, const MAX_FRAMES: usize> Send
    for Inner<PAGE_SIZE, MAX_FRAMES>
{
}

impl<const PAGE_SIZE: usize, const MAX_FRAMES: usize> PageAllocator<PAGE_SIZE, MAX_FRAMES> {
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(
                Inner {
                    base: 0,
                    limit: 0,
                    refcount: [0; MAX_FRAMES],
                    free_list: None,
                },
                "kmem",
            ),
        }
    }

    /// Brings every page-aligned frame in `[kernel_end, phys_top)` to
    /// refcount 0 and onto the free list.
    ///
    /// # Safety
    /// `[kernel_end, phys_top)` must be valid, unused physical memory,
    /// and this must be called exactly once before any other method.
    pub unsafe fn init(&self, kernel_end: usize, phys_top: usize) {
        assert!(
            size_of::<Run>() <= PAGE_SIZE,
            "kalloc: PAGE_SIZE too small to host a free-list node"
        );

        let base = kernel_end.next_multiple_of(PAGE_SIZE);
        let limit = phys_top - phys_top % PAGE_SIZE;
        let frame_count = (limit - base) / PAGE_SIZE;
        assert!(
            frame_count <= MAX_FRAMES,
            "kalloc: MAX_FRAMES ({MAX_FRAMES}) too small for {frame_count} frames"
        );

        {
            let mut inner = self.inner.lock();
            inner.base = base;
            inner.limit = limit;
            for i in 0..frame_count {
                inner.refcount[i] = 1;
            }
        }

        for i in 0..frame_count {
            self.free(base + i * PAGE_SIZE);
        }

        log::debug!("kalloc: initialized {frame_count} frames in [{base:#x}, {limit:#x})");
    }

    /// Pops a frame off the free list, junk-fills it, and sets its
    /// refcount to 1. Returns `None` if the pool is exhausted — a
    /// caller-handled resource limit, not a programmer error.
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        let mut inner = self.inner.lock();
        let run = inner.free_list?;
        inner.free_list = unsafe { run.as_ref().next };

        let ptr = run.cast::<u8>();
        let index = inner
            .frame_index(ptr.as_ptr() as usize)
            .expect("kalloc: free-list frame outside managed range");
        inner.refcount[index] = 1;
        drop(inner);

        unsafe { ptr.as_ptr().write_bytes(ALLOC_JUNK, PAGE_SIZE) };
        log::trace!("kalloc: alloc -> frame {index}");
        Some(ptr)
    }

    /// Decrements `pa`'s refcount. On reaching 0, junk-fills the frame
    /// and pushes it onto the free list.
    ///
    /// Fatal if `pa` is misaligned, out of range, or its refcount would
    /// go negative.
    pub fn free(&self, pa: usize) {
        let mut inner = self.inner.lock();
        let index = match inner.frame_index(pa) {
            Some(index) => index,
            None => crate::fatal!("kfree: misaligned or out of range: {pa:#x}"),
        };

        inner.refcount[index] -= 1;
        if inner.refcount[index] < 0 {
            crate::fatal!("kfree: negative refcount for frame {index}");
        }

        if inner.refcount[index] == 0 {
            unsafe {
                (pa as *mut u8).write_bytes(FREE_JUNK, PAGE_SIZE);
                let mut run = NonNull::new(pa as *mut u8).unwrap().cast::<Run>();
                run.as_mut().next = inner.free_list;
                inner.free_list = Some(run);
            }
            log::trace!("kalloc: free -> frame {index} now on free list");
        }
    }

    /// Increments `pa`'s refcount for an additional owner (e.g. a COW
    /// child taking a reference to a shared page).
    pub fn incr(&self, pa: usize) {
        let mut inner = self.inner.lock();
        match inner.frame_index(pa) {
            Some(index) => inner.refcount[index] += 1,
            None => crate::fatal!("kalloc: incr on misaligned or out of range: {pa:#x}"),
        }
    }

    /// True iff `pa`'s refcount is exactly 1 — the page-fault handler's
    /// signal that a COW page may be reused in place rather than copied.
    pub fn is_unique(&self, pa: usize) -> bool {
        let inner = self.inner.lock();
        match inner.frame_index(pa) {
            Some(index) => inner.refcount[index] == 1,
            None => crate::fatal!("kalloc: is_unique on misaligned or out of range: {pa:#x}"),
        }
    }

    /// Counts frames currently on the free list.
    pub fn free_count(&self) -> usize {
        let inner = self.inner.lock();
        let mut count = 0;
        let mut cur = inner.free_list;
        while let Some(run) = cur {
            count += 1;
            cur = unsafe { run.as_ref().next };
        }
        count
    }
}

impl<const PAGE_SIZE: usize, const MAX_FRAMES: usize> Default
    for PageAllocator<PAGE_SIZE, MAX_FRAMES>
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::UnsafeCell;

    const PAGE_SIZE: usize = 64;
    const FRAMES: usize = 16;

    #[repr(align(64))]
    struct Heap(UnsafeCell<[u8; PAGE_SIZE * FRAMES]>);
    unsafe impl Sync for Heap {}

    fn new_allocator() -> (PageAllocator<PAGE_SIZE, FRAMES>, Heap) {
        let heap = Heap(UnsafeCell::new([0; PAGE_SIZE * FRAMES]));
        let allocator = PageAllocator::new();
        let range = unsafe { (*heap.0.get()).as_mut_ptr_range() };
        unsafe { allocator.init(range.start as usize, range.end as usize) };
        (allocator, heap)
    }

    #[test]
    fn alloc_returns_junk_filled_page_aligned_frame() {
        let (allocator, _heap) = new_allocator();
        let page = allocator.alloc().unwrap();
        assert_eq!(page.as_ptr() as usize % PAGE_SIZE, 0);
        let bytes = unsafe { core::slice::from_raw_parts(page.as_ptr(), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0x05));
        assert!(allocator.is_unique(page.as_ptr() as usize));
    }

    #[test]
    fn cow_refcount_cycle() {
        let (allocator, _heap) = new_allocator();
        let page = allocator.alloc().unwrap();
        let pa = page.as_ptr() as usize;
        assert!(allocator.is_unique(pa));

        allocator.incr(pa);
        assert!(!allocator.is_unique(pa));

        allocator.free(pa); // back to 1, still live
        assert!(allocator.is_unique(pa));
        assert_eq!(allocator.free_count(), FRAMES - 1);

        allocator.free(pa); // -> 0, onto the free list
        assert_eq!(allocator.free_count(), FRAMES);
        let bytes = unsafe { core::slice::from_raw_parts(pa as *const u8, PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0x01));
    }

    #[test]
    fn exhaustion_then_free_returns_same_frame() {
        let (allocator, _heap) = new_allocator();
        let mut pages = Vec::new();
        for _ in 0..FRAMES {
            pages.push(allocator.alloc().unwrap());
        }
        assert!(allocator.alloc().is_none());

        let freed = pages.pop().unwrap();
        allocator.free(freed.as_ptr() as usize);

        let reused = allocator.alloc().unwrap();
        assert_eq!(reused, freed);
        let bytes = unsafe { core::slice::from_raw_parts(reused.as_ptr(), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0x05));
    }

    #[test]
    #[should_panic(expected = "misaligned or out of range")]
    fn free_of_misaligned_address_is_fatal() {
        let (allocator, _heap) = new_allocator();
        let page = allocator.alloc().unwrap();
        allocator.free(page.as_ptr() as usize + 1);
    }

    #[test]
    #[should_panic(expected = "negative refcount")]
    fn double_free_is_fatal() {
        let (allocator, _heap) = new_allocator();
        let page = allocator.alloc().unwrap();
        let pa = page.as_ptr() as usize;
        allocator.free(pa);
        allocator.free(pa);
    }
}
