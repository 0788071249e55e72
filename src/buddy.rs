//! Buddy bitmaps and the ladders built from them.
//!
//! A [`Buddy`] is one order-level view of a pool: bit `i` of an order-`k`
//! buddy covers blocks `i * k .. (i + 1) * k` of the pool. A set bit is
//! reserved, a clear bit is free.
//!
//! DMA pools carry a full [`Ladder`] of orders `MAX_BLOCK_ORDER, ..., 2, 1`.
//! The top order starts out entirely free. Every lower order starts out
//! entirely reserved, since its blocks are already covered by a larger unit
//! above it, except for at most one leftover unit at the end of the pool
//! that no parent absorbs. Normal pools carry a single order-1 buddy.

use core::slice;

use crate::{
    arena::{MapHandle, MetadataArena},
    bitmap::{words_for, BitmapError},
    InitError, PhysAddr, BLOCK_SIZE, BUDDY_HEADER_SIZE, LADDER_DEPTH, MAX_BLOCK_ORDER,
};

/// One order-level bitmap of a pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Buddy {
    order: u32,
    free_blocks: u32,
    max_free_blocks: u32,
    map: MapHandle,
    /// Index of the next-higher order in the ladder.
    higher: Option<usize>,
    /// Index of the next-lower order in the ladder.
    lower: Option<usize>,
}

impl Buddy {
    const EMPTY: Buddy = Buddy {
        order: 0,
        free_blocks: 0,
        max_free_blocks: 0,
        map: MapHandle::EMPTY,
        higher: None,
        lower: None,
    };

    /// Returns the number of blocks covered by one bit.
    #[inline]
    pub fn order(&self) -> u32 {
        self.order
    }

    /// Returns the number of bytes covered by one bit.
    #[inline]
    pub fn unit_size(&self) -> u64 {
        u64::from(self.order) * u64::from(BLOCK_SIZE)
    }

    /// Returns the number of words in the bitmap.
    #[inline]
    pub fn word_count(&self) -> usize {
        self.map.words()
    }

    /// Returns the number of free units at this order.
    #[inline]
    pub fn free_blocks(&self) -> u32 {
        self.free_blocks
    }

    /// Returns the number of units of this order that fit in the pool.
    #[inline]
    pub fn max_free_blocks(&self) -> u32 {
        self.max_free_blocks
    }

    /// Returns the handle of the bitmap in the metadata arena.
    #[inline]
    pub fn map(&self) -> MapHandle {
        self.map
    }

    /// Returns the ladder index of the next-higher order, if any.
    #[inline]
    pub fn higher(&self) -> Option<usize> {
        self.higher
    }

    /// Returns the ladder index of the next-lower order, if any.
    #[inline]
    pub fn lower(&self) -> Option<usize> {
        self.lower
    }

    /// Returns the number of bytes this buddy adds to its pool's footprint.
    #[inline]
    pub fn physical_size(&self) -> u32 {
        // A map never exceeds the arena, whose footprint fits in a u32.
        BUDDY_HEADER_SIZE + self.map.words() as u32 * (u32::BITS / 8)
    }

    /// Marks `units` free units as reserved.
    #[inline]
    pub(crate) fn take(&mut self, units: u32) {
        debug_assert!(units <= self.free_blocks);
        self.free_blocks -= units;
    }

    /// Marks `units` reserved units as free.
    #[inline]
    pub(crate) fn give(&mut self, units: u32) {
        debug_assert!(self.free_blocks + units <= self.max_free_blocks);
        self.free_blocks += units;
    }
}

/// The buddies of one pool, from the highest order to the lowest.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Ladder {
    buddies: [Buddy; LADDER_DEPTH],
    len: usize,
}

impl Ladder {
    pub(crate) const EMPTY: Ladder = Ladder {
        buddies: [Buddy::EMPTY; LADDER_DEPTH],
        len: 0,
    };

    /// Returns the highest-order buddy.
    #[inline]
    pub fn top(&self) -> &Buddy {
        &self.buddies[0]
    }

    /// Returns the lowest-order (order 1) buddy.
    #[inline]
    pub fn bottom(&self) -> &Buddy {
        &self.buddies[self.len - 1]
    }

    #[inline]
    pub(crate) fn bottom_mut(&mut self) -> &mut Buddy {
        &mut self.buddies[self.len - 1]
    }

    /// Returns the buddy at ladder index `idx`.
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Buddy> {
        self.as_slice().get(idx)
    }

    /// Returns the number of orders in the ladder.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the ladder has no buddies.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the buddies from top to bottom.
    #[inline]
    pub fn as_slice(&self) -> &[Buddy] {
        &self.buddies[..self.len]
    }

    /// Iterates over the buddies from top to bottom.
    #[inline]
    pub fn iter(&self) -> slice::Iter<'_, Buddy> {
        self.as_slice().iter()
    }

    /// Returns the total number of free blocks described by the ladder.
    pub fn free_blocks(&self) -> u32 {
        self.iter().map(|b| b.free_blocks * b.order).sum()
    }

    /// Returns the number of bytes the ladder adds to its pool's footprint.
    pub fn physical_size(&self) -> u32 {
        self.iter().map(Buddy::physical_size).sum()
    }

    /// Reserves every block overlapping `lo..=hi` (byte offsets from the pool
    /// start), returning how many blocks stopped being free.
    ///
    /// A free unit only partly inside the span is split: it is reserved and
    /// its two halves are handed down to the next order, which reserves
    /// whichever half still overlaps. Orders are visited top to bottom, so
    /// only the overlapping blocks end up reserved.
    pub(crate) fn reserve_span(
        &mut self,
        arena: &mut MetadataArena<'_>,
        lo: u64,
        hi: u64,
    ) -> Result<u32, BitmapError> {
        let before = self.free_blocks();

        for idx in 0..self.len {
            let buddy = self.buddies[idx];
            if buddy.max_free_blocks == 0 {
                continue;
            }

            let unit = buddy.unit_size();
            let first = lo / unit;
            let last = (hi / unit).min(u64::from(buddy.max_free_blocks) - 1);

            for bit in first..=last {
                let unit_lo = bit * unit;
                // Below `max_free_blocks`, a u32.
                let bit = bit as usize;

                if arena.map(buddy.map).test(bit)? {
                    continue;
                }

                arena.map_mut(buddy.map).set(bit)?;
                self.buddies[idx].take(1);

                let inside = lo <= unit_lo && unit_lo + unit - 1 <= hi;
                if let (false, Some(lower)) = (inside, buddy.lower) {
                    // An order-`k` unit `i` is the order-`k/2` units `2i` and
                    // `2i + 1`, both below the lower order's `max_free_blocks`.
                    let halves = self.buddies[lower].map;
                    arena.map_mut(halves).clear_range(2 * bit, 2 * bit + 1)?;
                    self.buddies[lower].give(2);
                }
            }
        }

        Ok(before - self.free_blocks())
    }

    fn push(&mut self, mut buddy: Buddy) {
        let idx = self.len;
        if idx > 0 {
            buddy.higher = Some(idx - 1);
            self.buddies[idx - 1].lower = Some(idx);
        }

        self.buddies[idx] = buddy;
        self.len += 1;
    }
}

impl<'l> IntoIterator for &'l Ladder {
    type Item = &'l Buddy;
    type IntoIter = slice::Iter<'l, Buddy>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Claims and initializes one buddy of order `order`.
fn make_buddy(
    arena: &mut MetadataArena<'_>,
    order: u32,
    max_free_blocks: u32,
    free_blocks: u32,
) -> Result<Buddy, InitError> {
    arena.claim_header(BUDDY_HEADER_SIZE)?;
    let map = arena.claim_map(words_for(max_free_blocks as usize))?;

    let mut bits = arena.map_mut(map);
    let max = max_free_blocks as usize;

    if free_blocks == max_free_blocks {
        // Nothing above absorbs any unit: the whole order is free.
        bits.fill(false);
        if max < bits.len() {
            bits.set_range(max, bits.len() - 1)?;
        }
    } else {
        bits.fill(true);
        if free_blocks > 0 {
            bits.clear(max - free_blocks as usize)?;
        }
    }

    Ok(Buddy {
        order,
        free_blocks,
        max_free_blocks,
        map,
        higher: None,
        lower: None,
    })
}

/// Builds the full buddy ladder of a DMA pool spanning `block_count` blocks.
///
/// Orders are built from `MAX_BLOCK_ORDER` down to 1, halving each step,
/// each placed in the arena right after the previous one.
pub(crate) fn build_ladder(
    arena: &mut MetadataArena<'_>,
    block_count: u32,
) -> Result<Ladder, InitError> {
    let mut ladder = Ladder::EMPTY;
    let mut parent_max: Option<u32> = None;
    let mut order = MAX_BLOCK_ORDER;

    while order > 0 {
        let max_free_blocks = block_count / order;
        let free_blocks = match parent_max {
            None => max_free_blocks,
            // A parent unit covers exactly two units of this order.
            Some(parent) => max_free_blocks - 2 * parent,
        };

        ladder.push(make_buddy(arena, order, max_free_blocks, free_blocks)?);

        parent_max = Some(max_free_blocks);
        order >>= 1;
    }

    Ok(ladder)
}

/// Builds the single order-1 buddy of a Normal pool spanning `block_count`
/// blocks.
pub(crate) fn build_flat(
    arena: &mut MetadataArena<'_>,
    block_count: u32,
) -> Result<Ladder, InitError> {
    let mut ladder = Ladder::EMPTY;
    ladder.push(make_buddy(arena, 1, block_count, block_count)?);
    Ok(ladder)
}

/// Returns the number of bitmap words [`build_ladder`] claims.
pub(crate) fn ladder_words(block_count: u32) -> usize {
    let mut words = 0;
    let mut order = MAX_BLOCK_ORDER;
    while order > 0 {
        words += words_for((block_count / order) as usize);
        order >>= 1;
    }
    words
}

/// Returns the number of bitmap words [`build_flat`] claims.
pub(crate) fn flat_words(block_count: u32) -> usize {
    words_for(block_count as usize)
}

/// Returns the byte offset of `addr` from `start`.
#[inline]
pub(crate) fn offset_of(start: PhysAddr, addr: PhysAddr) -> u64 {
    addr.as_u64() - start.as_u64()
}
