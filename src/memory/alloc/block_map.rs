use log::trace;

use crate::memory::{
    addr::VirtAddr,
    align_up,
    consts::{BITMAP_BITS, BLOCKS_PER_PAGE, BLOCK_MAP_WORDS, BLOCK_SIZE, MAX_ALLOC, PAGE_SIZE},
    error::{halt, Fatal},
};

// Page layout:
// [allocated block count: u32][block bitmap: BLOCK_MAP_WORDS x u32][padding][blocks...]
const COUNT_OFFSET: usize = 0;
const BITMAP_OFFSET: usize = COUNT_OFFSET + 4;
const HEADER_BYTES: usize = BITMAP_OFFSET + BLOCK_MAP_WORDS * 4;

/// Written at the start of every size block in debug builds and checked on free.
const HEADER_MAGIC: u32 = 0xA9E7_B10C;

/// Carves one 4MiB heap page into fixed-size blocks.
///
/// The page describes itself: its first blocks hold the block count and bitmap,
/// and every allocation is preceded by a size block whose last four bytes hold the
/// allocation's length in blocks.
pub struct BlockMap<'p> {
    base: VirtAddr,
    page: &'p mut [u8],
}

impl<'p> BlockMap<'p> {
    /// Blocks taken up by the page header.
    pub const RESERVED_BLOCKS: usize = align_up(HEADER_BYTES, BLOCK_SIZE) / BLOCK_SIZE;

    /// Wraps a page that was already formatted. `base` is the page's virtual address.
    pub fn open(base: VirtAddr, page: &'p mut [u8]) -> Self {
        assert_eq!(page.len(), PAGE_SIZE, "Block map must cover a whole page");
        assert_eq!(base.page_offset(), 0, "Block map base is not page aligned");
        Self { base, page }
    }

    /// Formats `page` as an empty block map.
    pub fn format(base: VirtAddr, page: &'p mut [u8]) -> Self {
        let mut map = Self::open(base, page);
        map.init();
        map
    }

    /// Frees every block, then reserves the header's own blocks.
    pub fn init(&mut self) {
        self.page[..HEADER_BYTES].fill(0);
        for block in 0..Self::RESERVED_BLOCKS {
            self.alloc_block(block);
        }
    }

    /// Data blocks currently handed out.
    pub fn allocated_blocks(&self) -> usize {
        self.read_u32(COUNT_OFFSET) as usize
    }

    /// Allocates `size` bytes aligned to at least `align`, using the first fit.
    ///
    /// The alignment is raised to the largest power of two not above `size`.
    /// Returns `None` if the request is over [`MAX_ALLOC`] or nothing fits.
    pub fn malloc(&mut self, size: usize, align: usize) -> Option<VirtAddr> {
        if size > MAX_ALLOC || align > MAX_ALLOC {
            return None;
        }

        let (size_blocks, align_blocks) = Self::block_request(size, align);

        // Candidates are aligned block indices with room for a size block before them
        let mut block = align_up(Self::RESERVED_BLOCKS + 1, align_blocks);
        while block + size_blocks <= BLOCKS_PER_PAGE {
            if self.test_block(block - 1) {
                block += align_blocks;
                continue;
            }

            match self.first_used(block, size_blocks) {
                None => return Some(self.claim(block, size_blocks)),
                // Any candidate up to `used + 1` would overlap the used block
                Some(used) => block = align_up(used + 2, align_blocks).max(block + align_blocks),
            }
        }

        trace!(
            "Page {} has no room for {size} bytes aligned to {align}",
            self.base
        );
        None
    }

    /// Releases an allocation made by [`BlockMap::malloc`] on this page.
    ///
    /// Its length is read back from the size block in front of `ptr`. Freeing anything
    /// else is undefined; debug builds halt when the header does not check out.
    pub fn free(&mut self, ptr: VirtAddr) {
        let offset = ptr.as_usize() - self.base.as_usize();
        let block = offset / BLOCK_SIZE;

        if cfg!(debug_assertions) {
            self.check_header(ptr, offset, block);
        }

        let size = self.read_u32(offset - 4) as usize;
        self.free_block(block - 1);
        for i in 0..size {
            self.free_block(block + i);
        }

        if cfg!(debug_assertions) {
            self.write_u32((block - 1) * BLOCK_SIZE, 0);
        }
        let count = self.allocated_blocks() - size;
        self.write_u32(COUNT_OFFSET, count as u32);
        trace!("Freed {size} blocks at {ptr}");
    }

    pub fn test_block(&self, block: usize) -> bool {
        let (offset, bit) = Self::block_word(block);
        self.read_u32(offset) & (1 << bit) != 0
    }

    pub fn alloc_block(&mut self, block: usize) {
        let (offset, bit) = Self::block_word(block);
        let word = self.read_u32(offset) | (1 << bit);
        self.write_u32(offset, word);
    }

    pub fn free_block(&mut self, block: usize) {
        let (offset, bit) = Self::block_word(block);
        let word = self.read_u32(offset) & !(1 << bit);
        self.write_u32(offset, word);
    }

    /// Number of blocks currently marked in the bitmap, header blocks included.
    pub fn used_blocks(&self) -> usize {
        (0..BLOCK_MAP_WORDS)
            .map(|word| self.read_u32(BITMAP_OFFSET + word * 4).count_ones() as usize)
            .sum()
    }

    /// The raw block bitmap words.
    pub fn bitmap_words(&self) -> impl Iterator<Item = u32> + '_ {
        (0..BLOCK_MAP_WORDS).map(|word| self.read_u32(BITMAP_OFFSET + word * 4))
    }

    /// Returns (size_in_blocks, align_in_blocks)
    fn block_request(size: usize, align: usize) -> (usize, usize) {
        let size = size.max(1);
        let natural = 1 << size.ilog2();
        let align = align.max(natural).next_power_of_two();

        (
            align_up(size, BLOCK_SIZE) / BLOCK_SIZE,
            (align_up(align, BLOCK_SIZE) / BLOCK_SIZE).max(1),
        )
    }

    /// The first allocated block in `[start, start + len)`.
    fn first_used(&self, start: usize, len: usize) -> Option<usize> {
        (start..start + len).find(|block| self.test_block(*block))
    }

    fn claim(&mut self, block: usize, size: usize) -> VirtAddr {
        self.alloc_block(block - 1);
        for i in 0..size {
            self.alloc_block(block + i);
        }

        let header = (block - 1) * BLOCK_SIZE;
        if cfg!(debug_assertions) {
            self.write_u32(header, HEADER_MAGIC);
        }
        self.write_u32(block * BLOCK_SIZE - 4, size as u32);

        let count = self.allocated_blocks() + size;
        self.write_u32(COUNT_OFFSET, count as u32);

        let ptr = self.base.add(block * BLOCK_SIZE);
        trace!("Allocated {size} blocks at {ptr}");
        ptr
    }

    fn check_header(&self, ptr: VirtAddr, offset: usize, block: usize) {
        let valid = offset % BLOCK_SIZE == 0
            && block > Self::RESERVED_BLOCKS
            && block < BLOCKS_PER_PAGE
            && self.test_block(block - 1)
            && self.read_u32((block - 1) * BLOCK_SIZE) == HEADER_MAGIC;
        if !valid {
            halt(Fatal::CorruptHeader(ptr));
        }

        let size = self.read_u32(offset - 4) as usize;
        if block + size > BLOCKS_PER_PAGE || self.first_free(block, size).is_some() {
            halt(Fatal::CorruptHeader(ptr));
        }
    }

    fn first_free(&self, start: usize, len: usize) -> Option<usize> {
        (start..start + len).find(|block| !self.test_block(*block))
    }

    /// Returns (byte_offset_of_word, bit)
    const fn block_word(block: usize) -> (usize, usize) {
        (
            BITMAP_OFFSET + (block / BITMAP_BITS) * 4,
            block % BITMAP_BITS,
        )
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let mut bytes = [0; 4];
        bytes.copy_from_slice(&self.page[offset..offset + 4]);
        u32::from_ne_bytes(bytes)
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.page[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: VirtAddr = VirtAddr::new(0x0080_0000);

    fn page() -> Vec<u8> {
        vec![0xCC; PAGE_SIZE]
    }

    fn first_data_block() -> usize {
        BlockMap::RESERVED_BLOCKS + 1
    }

    fn offset_of(ptr: VirtAddr) -> usize {
        (ptr.as_usize() - BASE.as_usize()) / BLOCK_SIZE
    }

    #[test]
    fn init_reserves_header_blocks() {
        let mut memory = page();
        let map = BlockMap::format(BASE, &mut memory);

        assert_eq!(BlockMap::RESERVED_BLOCKS, 2049);
        assert_eq!(map.allocated_blocks(), 0);
        assert_eq!(map.used_blocks(), BlockMap::RESERVED_BLOCKS);
        assert!(map.test_block(BlockMap::RESERVED_BLOCKS - 1));
        assert!(!map.test_block(BlockMap::RESERVED_BLOCKS));
    }

    #[test]
    fn size_word_sits_right_before_payload() {
        let mut memory = page();
        let mut map = BlockMap::format(BASE, &mut memory);
        let ptr = map.malloc(100, 0).unwrap();
        let offset = ptr.as_usize() - BASE.as_usize();

        let size = u32::from_ne_bytes(memory[offset - 4..offset].try_into().unwrap());
        assert_eq!(size, 7);
    }

    #[test]
    fn first_fit_picks_lowest_hole() {
        let mut memory = page();
        let mut map = BlockMap::format(BASE, &mut memory);
        let start = first_data_block() + 16;

        // Everything used except [start + 10, start + 20) and [start + 50, start + 100)
        for block in BlockMap::RESERVED_BLOCKS..BLOCKS_PER_PAGE {
            map.alloc_block(block);
        }
        for block in (start + 10..start + 20).chain(start + 50..start + 100) {
            map.free_block(block);
        }

        let ptr = map.malloc(5 * BLOCK_SIZE, 1).unwrap();
        // 80 bytes align naturally to 64 bytes, so candidates are multiples of 4 blocks
        assert_eq!(offset_of(ptr), align_up(start + 11, 4));
        assert!(offset_of(ptr) + 5 <= start + 20);
    }

    #[test]
    fn first_fit_takes_lower_hole_when_both_fit() {
        let mut memory = page();
        let mut map = BlockMap::format(BASE, &mut memory);
        let lower = align_up(first_data_block() + 40, 8);
        let upper = lower + 200;

        for block in BlockMap::RESERVED_BLOCKS..BLOCKS_PER_PAGE {
            map.alloc_block(block);
        }
        for block in (lower - 1..lower + 10).chain(upper - 1..upper + 50) {
            map.free_block(block);
        }

        let ptr = map.malloc(BLOCK_SIZE * 5, BLOCK_SIZE).unwrap();
        assert_eq!(offset_of(ptr), lower);
    }

    #[test]
    fn malloc_then_free_restores_state() {
        let mut memory = page();
        let mut map = BlockMap::format(BASE, &mut memory);
        let keep = map.malloc(24, 8).unwrap();

        let before: Vec<u32> = map.bitmap_words().collect();
        let count = map.allocated_blocks();

        let ptr = map.malloc(3000, 256).unwrap();
        assert_ne!(map.allocated_blocks(), count);
        map.free(ptr);

        assert_eq!(map.bitmap_words().collect::<Vec<_>>(), before);
        assert_eq!(map.allocated_blocks(), count);
        assert!(map.test_block(offset_of(keep)));
    }

    #[test]
    fn natural_alignment_overrides_request() {
        let mut memory = page();
        let mut map = BlockMap::format(BASE, &mut memory);

        let small = map.malloc(16, 1).unwrap();
        assert!(small.is_aligned(16));

        let wide = map.malloc(16, 64).unwrap();
        assert!(wide.is_aligned(64));

        let big = map.malloc(4096, 0).unwrap();
        assert!(big.is_aligned(4096));
    }

    #[test]
    fn oversized_requests_return_none() {
        let mut memory = page();
        let mut map = BlockMap::format(BASE, &mut memory);

        assert_eq!(map.malloc(MAX_ALLOC + 1, 0), None);
        assert_eq!(map.malloc(8, MAX_ALLOC * 2), None);
        assert_eq!(map.used_blocks(), BlockMap::RESERVED_BLOCKS);
    }

    #[test]
    fn full_page_returns_none() {
        let mut memory = page();
        let mut map = BlockMap::format(BASE, &mut memory);

        let mut count = 0;
        while map.malloc(MAX_ALLOC, 0).is_some() {
            count += 1;
        }
        // Each 1MiB slot needs the block before it for its size, so only every other slot fits
        assert_eq!(count, 2);
        assert!(map.malloc(MAX_ALLOC, 0).is_none());
        assert!(map.malloc(16, 0).is_some());
    }

    #[test]
    fn zero_sized_request_gets_one_block() {
        let mut memory = page();
        let mut map = BlockMap::format(BASE, &mut memory);
        let before = map.used_blocks();

        let ptr = map.malloc(0, 0).unwrap();
        assert_eq!(map.used_blocks(), before + 2);
        map.free(ptr);
        assert_eq!(map.used_blocks(), before);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "corrupt allocation header")]
    fn double_free_is_caught_in_debug() {
        let mut memory = page();
        let mut map = BlockMap::format(BASE, &mut memory);
        let ptr = map.malloc(64, 0).unwrap();

        map.free(ptr);
        map.free(ptr);
    }
}
