//! Word-packed bitmaps.
//!
//! Every buddy in the allocator is backed by one of these. A set bit marks
//! a reserved (or absorbed) block and a clear bit marks a free one.

use core::cmp;

/// The storage unit of a bitmap.
pub type Word = u32;

/// The number of bits in a [`Word`].
pub const WORD_BITS: usize = Word::BITS as usize;

const FULL: Word = Word::MAX;

/// The error type for out-of-range bitmap accesses.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BitmapError {
    /// The bit index lies past the end of the map.
    #[error("bit {bit} is out of range for a bitmap of {len} bits")]
    OutOfBounds {
        /// The offending bit index.
        bit: usize,
        /// The number of bits in the map.
        len: usize,
    },

    /// The start of an inclusive range lies after its end.
    #[error("inverted bit range {start}..={end}")]
    InvertedRange {
        /// First bit of the range.
        start: usize,
        /// Last bit of the range.
        end: usize,
    },
}

/// Returns the number of words needed to hold `num_bits` bits.
#[inline]
pub const fn words_for(num_bits: usize) -> usize {
    num_bits.div_ceil(WORD_BITS)
}

/// Returns a tuple of the index of the word containing `bit` and a mask
/// which extracts it.
#[inline]
const fn index_and_mask(bit: usize) -> (usize, Word) {
    (bit / WORD_BITS, 1 << (bit % WORD_BITS))
}

/// Mask selecting bits `lo..=hi` of a single word.
#[inline]
const fn span_mask(lo: usize, hi: usize) -> Word {
    (FULL >> (WORD_BITS - 1 - hi)) & (FULL << lo)
}

/// A bitmap over a borrowed or owned run of words.
///
/// `M` is anything that derefs to a word slice: `&mut [Word]` for maps living
/// in the metadata arena, `Vec<Word>` or arrays in tests.
#[derive(Clone, Debug)]
pub struct Bitmap<M> {
    map: M,
}

impl<M: AsRef<[Word]>> Bitmap<M> {
    /// Wraps `map`. The bitmap is as long as the storage.
    #[inline]
    pub fn new(map: M) -> Bitmap<M> {
        Bitmap { map }
    }

    /// Returns the backing words.
    #[inline]
    pub fn words(&self) -> &[Word] {
        self.map.as_ref()
    }

    /// Returns the number of addressable bits.
    #[inline]
    pub fn len(&self) -> usize {
        self.words().len() * WORD_BITS
    }

    /// Returns `true` if the map holds no words at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words().is_empty()
    }

    /// Unwraps the backing storage.
    pub fn into_inner(self) -> M {
        self.map
    }

    #[inline]
    fn check(&self, bit: usize) -> Result<(), BitmapError> {
        let len = self.len();
        if bit < len {
            Ok(())
        } else {
            Err(BitmapError::OutOfBounds { bit, len })
        }
    }

    fn check_range(&self, start: usize, end: usize) -> Result<(), BitmapError> {
        if start > end {
            return Err(BitmapError::InvertedRange { start, end });
        }

        self.check(end)
    }

    /// Gets the value of the indexed bit.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `bit` is out of range.
    #[inline]
    pub fn test(&self, bit: usize) -> Result<bool, BitmapError> {
        self.check(bit)?;

        let (idx, mask) = index_and_mask(bit);
        Ok(self.words()[idx] & mask != 0)
    }

    /// Returns the lowest clear bit in the whole map.
    ///
    /// Words with every bit set are skipped without inspecting their bits.
    pub fn find_first_clear(&self) -> Option<usize> {
        self.words()
            .iter()
            .enumerate()
            .find(|&(_, &word)| word != FULL)
            .map(|(idx, &word)| idx * WORD_BITS + (!word).trailing_zeros() as usize)
    }

    /// First-fit search for `run` consecutive clear bits below `limit`.
    ///
    /// Returns the index of the first bit of the lowest such run. Runs may
    /// span word boundaries. A zero-length run is never found.
    pub fn find_clear_run(&self, run: usize, limit: usize) -> Option<usize> {
        let limit = cmp::min(limit, self.len());
        if run == 0 || run > limit {
            return None;
        }

        let map = self.words();
        let mut bit = 0;

        while bit + run <= limit {
            let (idx, mask) = index_and_mask(bit);
            let word = map[idx];

            if word & mask != 0 {
                // Jump to the next clear bit in this word, or past the word
                // entirely if it has none left.
                let rest = !word & (FULL << (bit % WORD_BITS));
                bit = match rest {
                    0 => (idx + 1) * WORD_BITS,
                    r => idx * WORD_BITS + r.trailing_zeros() as usize,
                };
                continue;
            }

            let start = bit;
            while bit < start + run {
                let (idx, mask) = index_and_mask(bit);
                if map[idx] & mask != 0 {
                    break;
                }
                bit += 1;
            }

            if bit == start + run {
                return Some(start);
            }
        }

        None
    }

    /// Returns `true` if every bit in `start..=end` is set.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the range is inverted or reaches past the map.
    pub fn all_set(&self, start: usize, end: usize) -> Result<bool, BitmapError> {
        self.check_range(start, end)?;

        let map = self.words();
        let first = start / WORD_BITS;
        let last = end / WORD_BITS;

        if first == last {
            let mask = span_mask(start % WORD_BITS, end % WORD_BITS);
            return Ok(map[first] & mask == mask);
        }

        let head = span_mask(start % WORD_BITS, WORD_BITS - 1);
        let tail = span_mask(0, end % WORD_BITS);

        Ok(map[first] & head == head
            && map[first + 1..last].iter().all(|&w| w == FULL)
            && map[last] & tail == tail)
    }

    /// Counts the clear bits below `limit`.
    pub fn count_clear(&self, limit: usize) -> usize {
        let limit = cmp::min(limit, self.len());
        let map = self.words();
        let whole = limit / WORD_BITS;

        let mut count: usize = map[..whole]
            .iter()
            .map(|word| word.count_zeros() as usize)
            .sum();

        let rem = limit % WORD_BITS;
        if rem != 0 {
            let mask: Word = (1 << rem) - 1;
            count += (!map[whole] & mask).count_ones() as usize;
        }

        count
    }
}

impl<M: AsRef<[Word]> + AsMut<[Word]>> Bitmap<M> {
    /// Sets the indexed bit.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `bit` is out of range.
    #[inline]
    pub fn set(&mut self, bit: usize) -> Result<(), BitmapError> {
        self.check(bit)?;

        let (idx, mask) = index_and_mask(bit);
        self.map.as_mut()[idx] |= mask;
        Ok(())
    }

    /// Clears the indexed bit.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `bit` is out of range.
    #[inline]
    pub fn clear(&mut self, bit: usize) -> Result<(), BitmapError> {
        self.check(bit)?;

        let (idx, mask) = index_and_mask(bit);
        self.map.as_mut()[idx] &= !mask;
        Ok(())
    }

    /// Sets every bit in `start..=end`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the range is inverted or reaches past the map.
    #[inline]
    pub fn set_range(&mut self, start: usize, end: usize) -> Result<(), BitmapError> {
        self.write_range(start, end, true)
    }

    /// Clears every bit in `start..=end`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the range is inverted or reaches past the map.
    #[inline]
    pub fn clear_range(&mut self, start: usize, end: usize) -> Result<(), BitmapError> {
        self.write_range(start, end, false)
    }

    /// Sets (`reserved == true`) or clears every bit in the map.
    pub fn fill(&mut self, reserved: bool) {
        let value = if reserved { FULL } else { 0 };
        self.map.as_mut().fill(value);
    }

    fn write_range(&mut self, start: usize, end: usize, value: bool) -> Result<(), BitmapError> {
        self.check_range(start, end)?;

        let map = self.map.as_mut();
        let apply = |word: &mut Word, mask: Word| match value {
            true => *word |= mask,
            false => *word &= !mask,
        };

        let first = start / WORD_BITS;
        let last = end / WORD_BITS;

        if first == last {
            apply(&mut map[first], span_mask(start % WORD_BITS, end % WORD_BITS));
            return Ok(());
        }

        // Leading partial word, whole interior words, trailing partial word.
        apply(&mut map[first], span_mask(start % WORD_BITS, WORD_BITS - 1));
        map[first + 1..last].fill(if value { FULL } else { 0 });
        apply(&mut map[last], span_mask(0, end % WORD_BITS));

        Ok(())
    }
}
