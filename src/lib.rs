//! Block buffer cache and physical page allocator for a teaching-grade
//! kernel.
//!
//! This crate covers only the two hardest, concurrency-critical shared
//! resource managers of such a kernel: [`bcache`], a bounded cache of
//! fixed-size disk blocks shared by reference-counted, mutually
//! exclusive access; and [`kalloc`], a physical-page allocator with a
//! per-page reference count so pages can be shared (e.g. copy-on-write
//! fork). Everything else — the filesystem above `bcache`, the page
//! tables and scheduler above `kalloc`, the block driver below
//! `bcache` — is an external collaborator, represented here only by the
//! narrow interface this crate actually calls.
#![cfg_attr(not(test), no_std)]

pub mod disk;
pub mod error;
pub mod hart;
pub mod memlayout;
pub mod param;
pub mod ticks;

pub mod sleeplock;
pub mod spinlock;

pub mod bcache;
pub mod buf;
pub mod kalloc;

pub use bcache::BCache;
pub use buf::BufGuard;
pub use disk::BlockDevice;
pub use error::KernelCoreError;
pub use kalloc::PageAllocator;
