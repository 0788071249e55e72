//! Zones and the pools they own.
//!
//! A zone is a fixed-capacity list of pools in discovery order. Each pool
//! owns one contiguous span of physical memory and the [`Ladder`] of buddy
//! bitmaps describing it.

use core::fmt;

use crate::{
    arena::{ArenaError, MetadataArena},
    bitmap::BitmapError,
    buddy::{self, Ladder},
    FreeError, InitError, PhysAddr, BLOCK_SIZE, POOL_HEADER_SIZE, ZONE_HEADER_SIZE,
};

/// The kind of a zone.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ZoneKind {
    /// Low memory below [`DMA_MAX_ADDRESS`](crate::DMA_MAX_ADDRESS), bounded
    /// by [`DMA_TOTAL_BLOCKS`](crate::DMA_TOTAL_BLOCKS).
    Dma = 0,
    /// Everything else.
    Normal = 1,
}

impl fmt::Display for ZoneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ZoneKind::Dma => "DMA",
            ZoneKind::Normal => "Normal",
        })
    }
}

/// A contiguous span of physical memory and its buddy bitmaps.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Pool {
    start: PhysAddr,
    block_count: u32,
    free_blocks: u32,
    physical_size: u32,
    header: PhysAddr,
    ladder: Ladder,
}

impl Pool {
    const EMPTY: Pool = Pool {
        start: PhysAddr::new(0),
        block_count: 0,
        free_blocks: 0,
        physical_size: 0,
        header: PhysAddr::new(0),
        ladder: Ladder::EMPTY,
    };

    /// Claims the pool header and builds the buddies for `block_count`
    /// blocks at `start`.
    pub(crate) fn new(
        arena: &mut MetadataArena<'_>,
        kind: ZoneKind,
        start: PhysAddr,
        block_count: u32,
    ) -> Result<Pool, InitError> {
        let header = arena.claim_header(POOL_HEADER_SIZE)?;
        let ladder = match kind {
            ZoneKind::Dma => buddy::build_ladder(arena, block_count)?,
            ZoneKind::Normal => buddy::build_flat(arena, block_count)?,
        };

        Ok(Pool {
            start,
            block_count,
            free_blocks: block_count,
            physical_size: POOL_HEADER_SIZE + ladder.physical_size(),
            header,
            ladder,
        })
    }

    /// Returns the first byte of the span.
    #[inline]
    pub fn start(&self) -> PhysAddr {
        self.start
    }

    /// Returns one past the last byte of the span.
    ///
    /// This is a `u64` since a pool may end exactly at 4 GiB.
    #[inline]
    pub fn end(&self) -> u64 {
        self.start.as_u64() + u64::from(self.block_count) * u64::from(BLOCK_SIZE)
    }

    /// Returns the span in blocks.
    #[inline]
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Returns the number of free blocks.
    #[inline]
    pub fn free_blocks(&self) -> u32 {
        self.free_blocks
    }

    /// Returns the bytes of metadata charged to this pool.
    #[inline]
    pub fn physical_size(&self) -> u32 {
        self.physical_size
    }

    /// Returns the address of the pool header in the packed metadata layout.
    #[inline]
    pub fn header(&self) -> PhysAddr {
        self.header
    }

    /// Returns the pool's buddies.
    #[inline]
    pub fn ladder(&self) -> &Ladder {
        &self.ladder
    }

    /// Returns `true` if `addr` lies inside the span.
    #[inline]
    pub fn contains(&self, addr: PhysAddr) -> bool {
        self.start <= addr && addr.as_u64() < self.end()
    }

    /// Returns `true` if the span intersects `lo..hi`.
    #[inline]
    pub fn intersects(&self, lo: u64, hi: u64) -> bool {
        lo < self.end() && self.start.as_u64() < hi
    }

    /// Reserves every block that overlaps `lo..=hi`, returning the number of
    /// blocks that stopped being free.
    pub(crate) fn reserve(
        &mut self,
        arena: &mut MetadataArena<'_>,
        lo: u64,
        hi: u64,
    ) -> Result<u32, BitmapError> {
        if !self.intersects(lo, hi + 1) {
            return Ok(0);
        }

        let start = self.start.as_u64();
        let lo = lo.max(start) - start;
        let hi = hi.min(self.end() - 1) - start;

        let blocks = self.ladder.reserve_span(arena, lo, hi)?;
        self.free_blocks -= blocks;
        Ok(blocks)
    }

    /// Reserves the lowest run of `blocks` free blocks in the order-1 map.
    ///
    /// Returns `Ok(None)` if the pool has no such run.
    pub(crate) fn take_run(
        &mut self,
        arena: &mut MetadataArena<'_>,
        blocks: u32,
    ) -> Result<Option<PhysAddr>, BitmapError> {
        let bottom = *self.ladder.bottom();
        let found = arena
            .map(bottom.map())
            .find_clear_run(blocks as usize, bottom.max_free_blocks() as usize);

        let Some(first) = found else {
            return Ok(None);
        };

        arena
            .map_mut(bottom.map())
            .set_range(first, first + blocks as usize - 1)?;
        self.ladder.bottom_mut().take(blocks);
        self.free_blocks -= blocks;

        // The run lies inside the span, which ends at or below 4 GiB.
        Ok(Some(PhysAddr::new(
            self.start.as_u32() + first as u32 * BLOCK_SIZE,
        )))
    }

    /// Releases `blocks` blocks starting at `addr` in the order-1 map.
    ///
    /// Nothing is modified unless every released block is reserved.
    pub(crate) fn release(
        &mut self,
        arena: &mut MetadataArena<'_>,
        addr: PhysAddr,
        blocks: u32,
    ) -> Result<(), FreeError> {
        let offset = buddy::offset_of(self.start, addr);
        if offset % u64::from(BLOCK_SIZE) != 0 {
            return Err(FreeError::Misaligned(addr));
        }

        let first = offset / u64::from(BLOCK_SIZE);
        if first + u64::from(blocks) > u64::from(self.block_count) {
            return Err(FreeError::OutOfBounds { addr, blocks });
        }

        // Bounded by `block_count` above.
        let first = first as usize;
        let last = first + blocks as usize - 1;

        let bottom = *self.ladder.bottom();
        if !arena.map(bottom.map()).all_set(first, last)? {
            return Err(FreeError::NotAllocated { addr, blocks });
        }

        arena.map_mut(bottom.map()).clear_range(first, last)?;
        self.ladder.bottom_mut().give(blocks);
        self.free_blocks += blocks;

        Ok(())
    }
}

/// A fixed-capacity list of pools of one kind.
pub struct Zone<const POOLS: usize> {
    kind: ZoneKind,
    free_blocks: u32,
    physical_size: u32,
    header: PhysAddr,
    pools: [Pool; POOLS],
    len: usize,
}

impl<const POOLS: usize> Zone<POOLS> {
    /// Claims the zone header and constructs an empty zone.
    pub(crate) fn new(
        arena: &mut MetadataArena<'_>,
        kind: ZoneKind,
    ) -> Result<Zone<POOLS>, ArenaError> {
        let header = arena.claim_header(ZONE_HEADER_SIZE)?;

        Ok(Zone {
            kind,
            free_blocks: 0,
            physical_size: ZONE_HEADER_SIZE,
            header,
            pools: [Pool::EMPTY; POOLS],
            len: 0,
        })
    }

    /// Returns the kind of the zone.
    #[inline]
    pub fn kind(&self) -> ZoneKind {
        self.kind
    }

    /// Returns the number of free blocks across all pools.
    #[inline]
    pub fn free_blocks(&self) -> u32 {
        self.free_blocks
    }

    /// Returns the bytes of metadata charged to the zone, pools included.
    #[inline]
    pub fn physical_size(&self) -> u32 {
        self.physical_size
    }

    /// Returns the address of the zone header in the packed metadata layout.
    #[inline]
    pub fn header(&self) -> PhysAddr {
        self.header
    }

    /// Returns the pools in discovery order.
    #[inline]
    pub fn pools(&self) -> &[Pool] {
        &self.pools[..self.len]
    }

    #[inline]
    pub(crate) fn pools_mut(&mut self) -> &mut [Pool] {
        &mut self.pools[..self.len]
    }

    /// Returns the number of blocks spanned by all pools.
    pub fn total_blocks(&self) -> u32 {
        self.pools().iter().map(Pool::block_count).sum()
    }

    /// Returns the index of the pool containing `addr`.
    pub fn find_pool(&self, addr: PhysAddr) -> Option<usize> {
        self.pools().iter().position(|p| p.contains(addr))
    }

    /// Returns the first pool intersecting `lo..hi`.
    pub fn find_overlap(&self, lo: u64, hi: u64) -> Option<&Pool> {
        self.pools().iter().find(|p| p.intersects(lo, hi))
    }

    /// Appends `pool`, charging its free blocks and metadata to the zone.
    pub(crate) fn push(&mut self, pool: Pool) -> Result<(), InitError> {
        let slot = self.pools.get_mut(self.len).ok_or(InitError::TooManyPools {
            kind: self.kind,
            capacity: POOLS,
        })?;

        *slot = pool;
        self.len += 1;
        self.free_blocks += pool.free_blocks;
        self.physical_size += pool.physical_size;
        Ok(())
    }

    #[inline]
    pub(crate) fn debit(&mut self, blocks: u32) {
        debug_assert!(blocks <= self.free_blocks);
        self.free_blocks -= blocks;
    }

    #[inline]
    pub(crate) fn credit(&mut self, blocks: u32) {
        self.free_blocks += blocks;
    }
}

impl<const POOLS: usize> fmt::Debug for Zone<POOLS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Zone")
            .field("kind", &self.kind)
            .field("free_blocks", &self.free_blocks)
            .field("physical_size", &self.physical_size)
            .field("header", &self.header)
            .field("pools", &self.pools())
            .finish()
    }
}

/// Number of leading bitmap words printed per buddy.
const DUMP_WORDS: usize = 4;

/// A printable walk over a zone's pools, buddies and bitmaps.
///
/// Header and bitmap addresses are printed as laid out in the packed
/// metadata footprint (see [`crate::arena`]).
pub struct ZoneDump<'z, 'a, const POOLS: usize> {
    zone: &'z Zone<POOLS>,
    arena: &'z MetadataArena<'a>,
}

impl<'z, 'a, const POOLS: usize> ZoneDump<'z, 'a, POOLS> {
    pub(crate) fn new(zone: &'z Zone<POOLS>, arena: &'z MetadataArena<'a>) -> Self {
        ZoneDump { zone, arena }
    }
}

impl<const POOLS: usize> fmt::Debug for ZoneDump<'_, '_, POOLS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZoneDump")
            .field("kind", &self.zone.kind)
            .finish_non_exhaustive()
    }
}

impl<const POOLS: usize> fmt::Display for ZoneDump<'_, '_, POOLS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let zone = self.zone;
        writeln!(
            f,
            "{} zone @ {}: {} free blocks, {} bytes of metadata",
            zone.kind,
            zone.header,
            zone.free_blocks,
            zone.physical_size
        )?;

        for (idx, pool) in zone.pools().iter().enumerate() {
            writeln!(
                f,
                "  pool {idx} @ {}: {}..{:#010x}, {}/{} blocks free",
                pool.header,
                pool.start,
                pool.end(),
                pool.free_blocks,
                pool.block_count
            )?;

            for buddy in pool.ladder() {
                write!(
                    f,
                    "    order {:>3}: {}/{} free, {} words @ {}:",
                    buddy.order(),
                    buddy.free_blocks(),
                    buddy.max_free_blocks(),
                    buddy.word_count(),
                    buddy.map().phys()
                )?;

                let map = self.arena.map(buddy.map());
                for word in map.words().iter().take(DUMP_WORDS) {
                    write!(f, " {word:08x}")?;
                }
                if buddy.word_count() > DUMP_WORDS {
                    write!(f, " ...")?;
                }
                writeln!(f)?;
            }
        }

        Ok(())
    }
}
