//! The metadata arena.
//!
//! Before the manager exists there is nothing to allocate its bookkeeping
//! from, so every zone, pool and buddy is bump allocated out of a region the
//! kernel reserves directly behind its own image. Each claim is placed
//! immediately after the previous one.
//!
//! Headers are ordinary Rust values owned by the zone tables; the arena only
//! charges their packed size to the physical footprint. Bitmaps are stored in
//! the arena's words and handed out as [`MapHandle`]s.
//!
//! The physical addresses the arena reports describe that packed layout, in
//! which every header is immediately followed by its bitmap. They are
//! accounting addresses: the words themselves sit back to back at the front
//! of the region, so a bitmap's words are generally not stored at its
//! reported address.
//!
//! ## Characteristics
//!
//! | Operation                | Best-case | Worst-case |
//! |--------------------------|-----------|------------|
//! | Claim header             | O(1)      | O(1)       |
//! | Claim bitmap             | O(1)      | O(1)       |
//!
//! Nothing is ever released: the metadata lives as long as the manager.

use core::fmt;

use crate::{
    bitmap::{Bitmap, Word},
    PhysAddr,
};

const WORD_BYTES: u32 = Word::BITS / 8;

/// The error type for arena claims.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ArenaError {
    /// The region holds fewer free words than a bitmap needs.
    #[error("metadata region exhausted: {requested} words requested, {available} available")]
    Exhausted {
        /// Words requested.
        requested: usize,
        /// Words left in the region.
        available: usize,
    },

    /// The physical footprint would run past the 32-bit address space.
    #[error("metadata footprint overflows the physical address space")]
    AddressOverflow,
}

/// A bitmap stored in a [`MetadataArena`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MapHandle {
    first: usize,
    words: usize,
    phys: PhysAddr,
}

impl MapHandle {
    pub(crate) const EMPTY: MapHandle = MapHandle {
        first: 0,
        words: 0,
        phys: PhysAddr::new(0),
    };

    /// Returns the number of words in the bitmap.
    #[inline]
    pub fn words(self) -> usize {
        self.words
    }

    /// Returns the index of the bitmap's first word in the arena's region.
    #[inline]
    pub fn first(self) -> usize {
        self.first
    }

    /// Returns the bitmap's address in the packed metadata layout.
    ///
    /// This is an accounting address. The words live at index
    /// [`MapHandle::first`] of the arena's region.
    #[inline]
    pub fn phys(self) -> PhysAddr {
        self.phys
    }
}

/// A bump allocator over the pre-reserved metadata region.
pub struct MetadataArena<'a> {
    words: &'a mut [Word],
    low_mark: usize,
    base: PhysAddr,
    claimed: u32,
}

impl<'a> MetadataArena<'a> {
    /// Constructs an arena over `words`, whose first byte is physically
    /// located at `base`.
    pub fn new(base: PhysAddr, words: &'a mut [Word]) -> MetadataArena<'a> {
        MetadataArena {
            words,
            low_mark: 0,
            base,
            claimed: 0,
        }
    }

    /// Returns the physical address of the first metadata byte.
    #[inline]
    pub fn base(&self) -> PhysAddr {
        self.base
    }

    /// Returns the number of bytes claimed so far.
    #[inline]
    pub fn claimed(&self) -> u32 {
        self.claimed
    }

    /// Returns the number of words handed out to bitmaps.
    #[inline]
    pub fn words_used(&self) -> usize {
        self.low_mark
    }

    /// Returns the number of words still available for bitmaps.
    #[inline]
    pub fn words_available(&self) -> usize {
        self.words.len() - self.low_mark
    }

    /// Returns the physical address the next claim will be placed at.
    #[inline]
    pub fn cursor(&self) -> PhysAddr {
        // `claim` keeps `base + claimed` representable.
        PhysAddr::new(self.base.as_u32() + self.claimed)
    }

    fn claim(&mut self, bytes: u32) -> Result<PhysAddr, ArenaError> {
        let at = self.cursor();
        let claimed = self
            .claimed
            .checked_add(bytes)
            .ok_or(ArenaError::AddressOverflow)?;
        self.base
            .checked_add(claimed)
            .ok_or(ArenaError::AddressOverflow)?;

        self.claimed = claimed;
        Ok(at)
    }

    /// Charges a header of `bytes` bytes, returning its address in the
    /// packed metadata layout.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the footprint would overflow the address space.
    pub fn claim_header(&mut self, bytes: u32) -> Result<PhysAddr, ArenaError> {
        self.claim(bytes)
    }

    /// Claims a zeroed bitmap of `words` words.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the region is exhausted or the footprint would
    /// overflow the address space.
    pub fn claim_map(&mut self, words: usize) -> Result<MapHandle, ArenaError> {
        let available = self.words_available();
        if words > available {
            return Err(ArenaError::Exhausted {
                requested: words,
                available,
            });
        }

        let bytes = u32::try_from(words)
            .ok()
            .and_then(|w| w.checked_mul(WORD_BYTES))
            .ok_or(ArenaError::AddressOverflow)?;
        let phys = self.claim(bytes)?;

        let first = self.low_mark;
        self.low_mark += words;
        self.words[first..self.low_mark].fill(0);

        Ok(MapHandle { first, words, phys })
    }

    /// Returns a read-only view of the bitmap behind `handle`.
    ///
    /// `handle` must have been claimed from this arena.
    #[inline]
    pub fn map(&self, handle: MapHandle) -> Bitmap<&[Word]> {
        Bitmap::new(&self.words[handle.first..handle.first + handle.words])
    }

    /// Returns a mutable view of the bitmap behind `handle`.
    ///
    /// `handle` must have been claimed from this arena.
    #[inline]
    pub fn map_mut(&mut self, handle: MapHandle) -> Bitmap<&mut [Word]> {
        Bitmap::new(&mut self.words[handle.first..handle.first + handle.words])
    }
}

impl fmt::Debug for MetadataArena<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataArena")
            .field("base", &self.base)
            .field("claimed", &self.claimed)
            .field("words_used", &self.low_mark)
            .field("capacity", &self.words.len())
            .finish()
    }
}
