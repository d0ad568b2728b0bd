/// Paging granularity: one 4MiB large page.
pub const PAGE_SIZE: usize = 0x40_0000;
pub const PAGE_SHIFT: u32 = 22;
pub const MIB: usize = 1024 * 1024;

/// Entries in a page directory, one per 4MiB of the 32-bit address space.
pub const DIRECTORY_ENTRIES: usize = 1024;

pub const BITMAP_WORDS: usize = 256;
pub const BITMAP_BITS: usize = 32;

/// Allocation granule inside a heap page (`alignof(max_align_t)` on i386).
pub const BLOCK_SIZE: usize = 16;
pub const BLOCKS_PER_PAGE: usize = PAGE_SIZE / BLOCK_SIZE;
pub const BLOCK_MAP_WORDS: usize = BLOCKS_PER_PAGE / BITMAP_BITS;

/// Largest size or alignment a single heap allocation may request.
pub const MAX_ALLOC: usize = MIB;
