/// number of buffers in the block cache pool
pub const NBUF: usize = 30;
/// number of hash buckets the block cache is sharded into; prime and
/// coprime with typical sequential blockno strides
pub const NBUFMAP_BUCKET: usize = 13;
/// size in bytes of a single cached disk block
pub const BSIZE: usize = 1024;
/// size in bytes of one physical page frame
pub const PGSIZE: usize = 4096;
/// junk byte written into a frame handed out by alloc
pub const ALLOC_JUNK: u8 = 0x05;
/// junk byte written into a frame returned to the free list by free
pub const FREE_JUNK: u8 = 0x01;
