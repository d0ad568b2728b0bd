use super::consts::{BITMAP_BITS, BITMAP_WORDS};

/// One bit per 4MiB page, 256 words of 32 bits.
#[derive(Clone, PartialEq, Eq)]
pub struct PageBitmap {
    words: [u32; BITMAP_WORDS],
}

impl PageBitmap {
    pub const fn empty() -> Self {
        Self {
            words: [0; BITMAP_WORDS],
        }
    }

    pub const fn full() -> Self {
        Self {
            words: [u32::MAX; BITMAP_WORDS],
        }
    }

    pub fn fill(&mut self, set: bool) {
        self.words.fill(if set { u32::MAX } else { 0 });
    }

    /// Returns (word_index, bit)
    const fn word_bit(index: usize) -> (usize, usize) {
        (index / BITMAP_BITS, index % BITMAP_BITS)
    }

    pub fn test(&self, index: usize) -> bool {
        let (word, bit) = Self::word_bit(index);
        self.words[word] & (1 << bit) != 0
    }

    pub fn set(&mut self, index: usize) {
        let (word, bit) = Self::word_bit(index);
        self.words[word] |= 1 << bit;
    }

    pub fn clear(&mut self, index: usize) {
        let (word, bit) = Self::word_bit(index);
        self.words[word] &= !(1 << bit);
    }

    /// Lowest clear bit among the first `limit` bits.
    ///
    /// Finds the first word that is not completely filled, then the first zero bit inside it.
    pub fn first_clear(&self, limit: usize) -> Option<usize> {
        let words = limit.div_ceil(BITMAP_BITS).min(BITMAP_WORDS);
        let (word, value) = self.words[..words]
            .iter()
            .enumerate()
            .find(|(_, w)| **w != u32::MAX)?;

        let index = word * BITMAP_BITS + value.trailing_ones() as usize;
        (index < limit).then_some(index)
    }

    /// Indices of every set bit, lowest first.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.words
            .iter()
            .enumerate()
            .filter(|(_, w)| **w != 0)
            .flat_map(|(word, w)| {
                (0..BITMAP_BITS)
                    .filter(move |&bit| *w & (1u32 << bit) != 0)
                    .map(move |bit| word * BITMAP_BITS + bit)
            })
    }

    pub fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn words(&self) -> &[u32; BITMAP_WORDS] {
        &self.words
    }

    pub fn words_mut(&mut self) -> &mut [u32; BITMAP_WORDS] {
        &mut self.words
    }
}

impl Default for PageBitmap {
    fn default() -> Self {
        Self::empty()
    }
}

impl core::fmt::Debug for PageBitmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageBitmap")
            .field("set", &self.count_set())
            .finish()
    }
}
