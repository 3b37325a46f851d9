//! Physical memory map constants.
//!
//! Laid out for a generic riscv64 "virt" machine with 128 MiB of RAM.
//! Only the two addresses [`kalloc`](crate::kalloc) actually needs are
//! kept.

/// Physical address where RAM starts.
pub const KERNBASE: usize = 0x8000_0000;

/// First address past the end of RAM.
pub const PHYSTOP: usize = KERNBASE + 128 * 1024 * 1024;
