//! The physical memory manager.
//!
//! [`Pmm::init`] walks the boot memory map once, carving DMA pools out of low
//! memory until the DMA budget is spent and turning everything else into
//! Normal pools. It then reserves the kernel image and the manager's own
//! metadata. Afterwards [`Pmm::alloc`] and [`Pmm::free`] serve block runs
//! from the Normal zone.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation | Best-case | Worst-case                      |
//! |-----------|-----------|---------------------------------|
//! | Allocate  | O(1)      | O(pools × blocks per pool)      |
//! | Free      | O(pools)  | O(pools + blocks freed)         |
//!
//! #### Fragmentation
//!
//! Normal pools are searched first-fit, so long-lived small allocations near
//! the start of a pool can fragment it. Pools are never merged or split
//! after initialization.

use core::{fmt, iter, ops::Range};

use log::{debug, info, trace, warn};

use crate::{
    arena::MetadataArena,
    bitmap::Word,
    buddy,
    mmap::{BootInfo, MemoryMapCursor, MemoryMapEntry},
    zone::{Pool, Zone, ZoneDump, ZoneKind},
    AllocError, FreeError, InitError, InvariantViolation, KernelImage, PhysAddr, BLOCK_SIZE,
    DEFAULT_POOLS, DMA_MAX_ADDRESS, DMA_TOTAL_BLOCKS,
};

/// What to do with the memory map record under the cursor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Carve {
    /// Not usable RAM, or empty.
    Skip,
    /// The whole record becomes one Normal pool.
    Normal { base: u32, blocks: u32 },
    /// The front of the record becomes one DMA pool. `consumed` is `None`
    /// when the whole record is used up, else the number of bytes to cut off
    /// the record before looking at it again, counted from the record's own
    /// base.
    Dma {
        base: u32,
        blocks: u32,
        consumed: Option<u32>,
    },
}

/// Decides how the next pool is cut from `entry` given the blocks the DMA
/// zone already holds.
///
/// Pools start on a block boundary. The bytes in front of the first boundary
/// are dropped.
fn plan(entry: &MemoryMapEntry, dma_blocks: u32) -> Carve {
    if !entry.is_usable() {
        return Carve::Skip;
    }

    let length = entry.clamped_length();
    if length == 0 {
        return Carve::Skip;
    }

    let block_size = u64::from(BLOCK_SIZE);
    let raw = u64::from(entry.base_low);
    let pad = raw.next_multiple_of(block_size) - raw;
    if pad >= length {
        // No boundary inside the record, which may reach 4 GiB.
        return Carve::Normal {
            base: entry.base_low,
            blocks: 0,
        };
    }

    // A boundary inside the record lies below 4 GiB.
    let base = (raw + pad) as u32;
    let length = length - pad;
    // `pad` is below a block.
    let pad = pad as u32;
    // At most 2^20 blocks fit in the 32-bit space.
    let blocks = (length / block_size) as u32;

    if dma_blocks >= DMA_TOTAL_BLOCKS || base > DMA_MAX_ADDRESS {
        return Carve::Normal { base, blocks };
    }

    let remaining = DMA_TOTAL_BLOCKS - dma_blocks;
    let last = u64::from(base) + length - 1;
    let ceiling = u64::from(DMA_MAX_ADDRESS);

    if blocks <= remaining && last <= ceiling {
        return Carve::Dma {
            base,
            blocks,
            consumed: None,
        };
    }

    // `base <= DMA_MAX_ADDRESS`, so this fits in a u32.
    let below = (ceiling + 1 - u64::from(base)) as u32;
    let below_blocks = below / BLOCK_SIZE;

    if last > ceiling && below_blocks < remaining {
        Carve::Dma {
            base,
            blocks: below_blocks,
            consumed: Some(pad + below),
        }
    } else {
        Carve::Dma {
            base,
            blocks: remaining,
            consumed: Some(pad + remaining * BLOCK_SIZE),
        }
    }
}

/// A summary of one zone.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ZoneStats {
    /// The zone described.
    pub kind: ZoneKind,
    /// Number of pools.
    pub pools: usize,
    /// Blocks spanned by all pools.
    pub total_blocks: u32,
    /// Blocks currently free.
    pub free_blocks: u32,
    /// Bytes of metadata charged to the zone.
    pub metadata_bytes: u32,
}

impl ZoneStats {
    fn of<const POOLS: usize>(zone: &Zone<POOLS>) -> ZoneStats {
        ZoneStats {
            kind: zone.kind(),
            pools: zone.pools().len(),
            total_blocks: zone.total_blocks(),
            free_blocks: zone.free_blocks(),
            metadata_bytes: zone.physical_size(),
        }
    }
}

impl fmt::Display for ZoneStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<7} {:>3} pools, {:#8x} blocks, {:#8x} free, {} metadata bytes",
            self.kind, self.pools, self.total_blocks, self.free_blocks, self.metadata_bytes
        )
    }
}

/// A summary of the whole manager.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PmmStats {
    /// The DMA zone.
    pub dma: ZoneStats,
    /// The Normal zone, if any memory was assigned to it.
    pub normal: Option<ZoneStats>,
    /// Bytes of metadata placed behind the kernel image.
    pub metadata_bytes: u32,
}

impl fmt::Display for PmmStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const TITLE: &str = "Physical memory";

        writeln!(f, "{TITLE}")?;
        TITLE.chars().try_for_each(|_| write!(f, "~"))?;
        writeln!(f)?;
        writeln!(f, "{}", self.dma)?;
        match &self.normal {
            Some(normal) => writeln!(f, "{normal}")?,
            None => writeln!(f, "{:<7} none", ZoneKind::Normal)?,
        }
        writeln!(f, "Metadata bytes: {}", self.metadata_bytes)?;
        TITLE.chars().try_for_each(|_| write!(f, "~"))?;
        writeln!(f)
    }
}

/// A zoned physical memory manager.
///
/// `POOLS` is the pool capacity of each zone.
#[derive(Debug)]
pub struct Pmm<'a, const POOLS: usize = DEFAULT_POOLS> {
    arena: MetadataArena<'a>,
    dma: Zone<POOLS>,
    normal: Option<Zone<POOLS>>,
    kernel: KernelImage,
    reserved: Range<u64>,
}

impl<'a> Pmm<'a> {
    /// Builds the zones described by `boot` and reserves the kernel image.
    ///
    /// `metadata` is the region directly behind the kernel image. Every zone,
    /// pool and buddy bitmap is laid out in it, and the bytes used are
    /// reserved together with the image. Records of the memory map that feed
    /// DMA pools are shrunk in place.
    ///
    /// Use [`Pmm::metadata_words_required`] to size `metadata`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the flags advertise no memory map, if the kernel image
    /// bounds are invalid or not inside any pool, if a record overlaps memory
    /// already assigned, if a zone runs out of pool slots, or if `metadata` is
    /// too small.
    pub fn init(
        boot: BootInfo<'_>,
        kernel: KernelImage,
        metadata: &'a mut [Word],
    ) -> Result<Pmm<'a>, InitError> {
        Pmm::init_with_capacity(boot, kernel, metadata)
    }

    /// Returns the number of metadata words [`Pmm::init`] will claim for
    /// `entries`.
    ///
    /// `entries` is not modified.
    pub fn metadata_words_required(entries: &[MemoryMapEntry]) -> usize {
        let mut words = 0;
        let mut dma_blocks = 0;

        for entry in entries {
            let mut entry = *entry;
            loop {
                match plan(&entry, dma_blocks) {
                    Carve::Skip => break,
                    Carve::Normal { blocks, .. } => {
                        words += buddy::flat_words(blocks);
                        break;
                    }
                    Carve::Dma {
                        blocks, consumed, ..
                    } => {
                        words += buddy::ladder_words(blocks);
                        dma_blocks += blocks;
                        match consumed {
                            Some(bytes) => entry.consume_front(bytes),
                            None => break,
                        }
                    }
                }
            }
        }

        words
    }
}

impl<'a, const POOLS: usize> Pmm<'a, POOLS> {
    /// Like [`Pmm::init`], with a pool capacity of `POOLS` per zone.
    ///
    /// # Errors
    ///
    /// See [`Pmm::init`].
    pub fn init_with_capacity(
        boot: BootInfo<'_>,
        kernel: KernelImage,
        metadata: &'a mut [Word],
    ) -> Result<Pmm<'a, POOLS>, InitError> {
        if !boot.has_memory_map() {
            return Err(InitError::NoMemoryMap);
        }

        let mut arena = MetadataArena::new(kernel.physical_end()?, metadata);
        let dma = Zone::new(&mut arena, ZoneKind::Dma)?;

        let mut pmm = Pmm {
            arena,
            dma,
            normal: None,
            kernel,
            reserved: 0..0,
        };

        pmm.carve(MemoryMapCursor::new(boot.memory_map))?;
        pmm.reserve_kernel()?;

        info!(
            "pmm: dma {}/{} blocks free, normal {}/{} blocks free, {} metadata bytes",
            pmm.dma.free_blocks(),
            pmm.dma.total_blocks(),
            pmm.normal.as_ref().map_or(0, Zone::free_blocks),
            pmm.normal.as_ref().map_or(0, Zone::total_blocks),
            pmm.metadata_bytes()
        );
        trace!("{}", pmm.dump_zone(&pmm.dma));
        if let Some(normal) = &pmm.normal {
            trace!("{}", pmm.dump_zone(normal));
        }

        Ok(pmm)
    }

    fn carve(&mut self, mut cursor: MemoryMapCursor<'_>) -> Result<(), InitError> {
        while let Some(entry) = cursor.current().copied() {
            match plan(&entry, self.dma.total_blocks()) {
                Carve::Skip => {
                    debug!("mmap[{}]: skipping {:?}", cursor.index(), entry);
                    cursor.advance();
                }

                Carve::Normal { base, blocks } => {
                    self.add_pool(ZoneKind::Normal, base, blocks)?;
                    cursor.advance();
                }

                Carve::Dma {
                    base,
                    blocks,
                    consumed,
                } => {
                    self.add_pool(ZoneKind::Dma, base, blocks)?;
                    match consumed {
                        Some(bytes) => cursor.consume_front(bytes),
                        None => cursor.advance(),
                    }
                }
            }
        }

        Ok(())
    }

    fn add_pool(&mut self, kind: ZoneKind, base: u32, blocks: u32) -> Result<(), InitError> {
        if blocks == 0 {
            warn!("pmm: dropping fragment at {base:#010x} shorter than a block");
            return Ok(());
        }

        let lo = u64::from(base);
        let hi = lo + u64::from(blocks) * u64::from(BLOCK_SIZE);
        if self.zones().any(|zone| zone.find_overlap(lo, hi).is_some()) {
            return Err(InitError::OverlappingRecord {
                base: PhysAddr::new(base),
                blocks,
            });
        }

        let zone = match kind {
            ZoneKind::Dma => &mut self.dma,
            ZoneKind::Normal => match &mut self.normal {
                Some(zone) => zone,
                empty => empty.insert(Zone::new(&mut self.arena, ZoneKind::Normal)?),
            },
        };

        let pool = Pool::new(&mut self.arena, kind, PhysAddr::new(base), blocks)?;
        zone.push(pool)?;

        debug!("pmm: {kind} pool at {base:#010x}, {blocks} blocks");
        Ok(())
    }

    /// Reserves the kernel image and the metadata behind it.
    fn reserve_kernel(&mut self) -> Result<(), InitError> {
        let start = self.kernel.physical_start()?;
        let end = self.kernel.physical_end()?;

        let owner = self
            .normal
            .as_ref()
            .and_then(|zone| zone.find_pool(start))
            .or_else(|| self.dma.find_pool(start));
        if owner.is_none() {
            return Err(InitError::KernelNotFound { start });
        }

        // The DMA zone header is always claimed, so the range is never empty.
        let lo = start.as_u64();
        let hi = end.as_u64() + u64::from(self.metadata_bytes()) - 1;

        let mut reserved = 0;
        for zone in iter::once(&mut self.dma).chain(self.normal.as_mut()) {
            let mut taken = 0;
            for pool in zone.pools_mut() {
                taken += pool.reserve(&mut self.arena, lo, hi)?;
            }
            zone.debit(taken);
            reserved += taken;
        }

        self.reserved = lo..hi + 1;
        debug!("pmm: reserved {reserved} blocks for the kernel at {lo:#010x}..={hi:#010x}");
        Ok(())
    }

    fn zones(&self) -> impl Iterator<Item = &Zone<POOLS>> {
        iter::once(&self.dma).chain(self.normal.as_ref())
    }

    fn dump_zone<'z>(&'z self, zone: &'z Zone<POOLS>) -> ZoneDump<'z, 'a, POOLS> {
        ZoneDump::new(zone, &self.arena)
    }

    /// Allocates `bytes` bytes, rounded up to whole blocks, from the Normal
    /// zone.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `bytes` is zero, if the Normal zone holds fewer free
    /// blocks than requested, or if no pool has a long enough run of free
    /// blocks. No state is modified on error.
    pub fn alloc(&mut self, bytes: u32) -> Result<PhysAddr, AllocError> {
        if bytes == 0 {
            return Err(AllocError::ZeroSize);
        }

        let requested = bytes.div_ceil(BLOCK_SIZE);
        let Some(normal) = self.normal.as_mut() else {
            return Err(AllocError::InsufficientBlocks {
                requested,
                available: 0,
            });
        };

        if normal.free_blocks() < requested {
            return Err(AllocError::InsufficientBlocks {
                requested,
                available: normal.free_blocks(),
            });
        }

        let mut found = None;
        for pool in normal.pools_mut() {
            if pool.free_blocks() < requested {
                continue;
            }

            if let Some(addr) = pool.take_run(&mut self.arena, requested)? {
                found = Some(addr);
                break;
            }
        }

        let addr = found.ok_or(AllocError::NoContiguousRun { requested })?;
        normal.debit(requested);

        trace!("pmm: alloc {requested} blocks at {addr}");
        Ok(addr)
    }

    /// Returns `bytes` bytes, rounded up to whole blocks, at `addr` to the
    /// Normal zone.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `bytes` is zero, if `addr` is not a block of a Normal
    /// pool, if the range runs past its pool, if it touches the kernel image
    /// or the metadata behind it, or if any block in it is not allocated. No
    /// state is modified on error.
    pub fn free(&mut self, addr: PhysAddr, bytes: u32) -> Result<(), FreeError> {
        if bytes == 0 {
            return Err(FreeError::ZeroSize);
        }

        let blocks = bytes.div_ceil(BLOCK_SIZE);
        let normal = self
            .normal
            .as_mut()
            .ok_or(FreeError::UnknownAddress(addr))?;
        let idx = normal
            .find_pool(addr)
            .ok_or(FreeError::UnknownAddress(addr))?;

        let lo = addr.as_u64();
        let hi = lo + u64::from(blocks) * u64::from(BLOCK_SIZE);
        if lo < self.reserved.end && self.reserved.start < hi {
            return Err(FreeError::Reserved { addr, blocks });
        }

        normal.pools_mut()[idx].release(&mut self.arena, addr, blocks)?;
        normal.credit(blocks);

        trace!("pmm: free {blocks} blocks at {addr}");
        Ok(())
    }

    /// Returns the zone of the given kind, if it exists.
    pub fn zone(&self, kind: ZoneKind) -> Option<&Zone<POOLS>> {
        match kind {
            ZoneKind::Dma => Some(&self.dma),
            ZoneKind::Normal => self.normal.as_ref(),
        }
    }

    /// Returns a printable walk over the zone of the given kind.
    pub fn dump(&self, kind: ZoneKind) -> Option<ZoneDump<'_, 'a, POOLS>> {
        self.zone(kind).map(|zone| self.dump_zone(zone))
    }

    /// Returns the kernel image the manager was initialized with.
    pub fn kernel(&self) -> KernelImage {
        self.kernel
    }

    /// Returns the physical span of the kernel image and the metadata behind
    /// it. No block touching it is ever handed out or released.
    pub fn reserved(&self) -> Range<u64> {
        self.reserved.clone()
    }

    /// Returns the bytes of metadata placed behind the kernel image.
    pub fn metadata_bytes(&self) -> u32 {
        self.zones().map(Zone::physical_size).sum()
    }

    /// Returns the number of metadata words claimed for bitmaps.
    pub fn metadata_words_used(&self) -> usize {
        self.arena.words_used()
    }

    /// Returns a summary of both zones.
    pub fn stats(&self) -> PmmStats {
        PmmStats {
            dma: ZoneStats::of(&self.dma),
            normal: self.normal.as_ref().map(ZoneStats::of),
            metadata_bytes: self.metadata_bytes(),
        }
    }

    /// Recomputes every counter from the bitmaps and checks the layout of
    /// the pools.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        for zone in self.zones() {
            let mut computed = 0;

            for pool in zone.pools() {
                let start = pool.start();
                let mut pool_free = 0;

                for buddy in pool.ladder() {
                    let map = self.arena.map(buddy.map());
                    let counted = map.count_clear(buddy.max_free_blocks() as usize);
                    let all = map.count_clear(map.len());

                    // At most `max_free_blocks`, a u32.
                    let counted = counted as u32;
                    if counted != buddy.free_blocks() {
                        return Err(InvariantViolation::BuddyFreeBlocks {
                            start,
                            order: buddy.order(),
                            recorded: buddy.free_blocks(),
                            counted,
                        });
                    }
                    if all as u32 != counted {
                        return Err(InvariantViolation::PaddingClear {
                            start,
                            order: buddy.order(),
                        });
                    }

                    pool_free += buddy.free_blocks() * buddy.order();
                }

                if pool_free != pool.free_blocks() {
                    return Err(InvariantViolation::PoolFreeBlocks {
                        start,
                        recorded: pool.free_blocks(),
                        computed: pool_free,
                    });
                }

                computed += pool.free_blocks();
            }

            if computed != zone.free_blocks() {
                return Err(InvariantViolation::ZoneFreeBlocks {
                    kind: zone.kind(),
                    recorded: zone.free_blocks(),
                    computed,
                });
            }
        }

        let pools = || self.zones().flat_map(Zone::pools);
        for (idx, first) in pools().enumerate() {
            if let Some(second) = pools()
                .skip(idx + 1)
                .find(|p| first.intersects(p.start().as_u64(), p.end()))
            {
                return Err(InvariantViolation::Overlap {
                    first: first.start(),
                    second: second.start(),
                });
            }
        }

        for pool in self.dma.pools() {
            if pool.end() > u64::from(DMA_MAX_ADDRESS) + 1 {
                return Err(InvariantViolation::DmaCeiling {
                    start: pool.start(),
                });
            }
        }

        let blocks = self.dma.total_blocks();
        if blocks > DMA_TOTAL_BLOCKS {
            return Err(InvariantViolation::DmaBudget { blocks });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::prelude::rust_2021::*;

    use super::*;
    use crate::MemoryMapEntry;

    const KERNEL_OFFSET: u32 = 0xC000_0000;

    fn higher_half(start: u32, end: u32) -> KernelImage {
        KernelImage::new(start + KERNEL_OFFSET, end + KERNEL_OFFSET, KERNEL_OFFSET)
    }

    fn starts(zone: &Zone<DEFAULT_POOLS>) -> Vec<(u32, u32)> {
        zone.pools()
            .iter()
            .map(|p| (p.start().as_u32(), p.block_count()))
            .collect()
    }

    #[test]
    fn plan_covers_every_case() {
        // Unusable.
        let reserved = MemoryMapEntry::new(0x10_0000, 0x1000, 2);
        assert_eq!(plan(&reserved, 0), Carve::Skip);
        let high = MemoryMapEntry::usable(0x1_0000_0000, 0x1000);
        assert_eq!(plan(&high, 0), Carve::Skip);
        assert_eq!(plan(&MemoryMapEntry::usable(0x1000, 0), 0), Carve::Skip);

        // Above the ceiling, or budget spent.
        let entry = MemoryMapEntry::usable(0x100_0000, 0x4000);
        assert_eq!(
            plan(&entry, 0),
            Carve::Normal {
                base: 0x100_0000,
                blocks: 4
            }
        );
        let entry = MemoryMapEntry::usable(0x1000, 0x4000);
        assert_eq!(
            plan(&entry, DMA_TOTAL_BLOCKS),
            Carve::Normal {
                base: 0x1000,
                blocks: 4
            }
        );

        // Fits.
        assert_eq!(
            plan(&entry, 60),
            Carve::Dma {
                base: 0x1000,
                blocks: 4,
                consumed: None
            }
        );

        // Crosses the ceiling with less below it than the budget.
        let entry = MemoryMapEntry::usable(0xFF_0000, 0x10_0000);
        assert_eq!(
            plan(&entry, 0),
            Carve::Dma {
                base: 0xFF_0000,
                blocks: 16,
                consumed: Some(0x1_0000)
            }
        );

        // Larger than the budget.
        let entry = MemoryMapEntry::usable(0x10_0000, 0x10_0000);
        assert_eq!(
            plan(&entry, 16),
            Carve::Dma {
                base: 0x10_0000,
                blocks: 48,
                consumed: Some(0x3_0000)
            }
        );

        // Ends exactly at the ceiling.
        let entry = MemoryMapEntry::usable(0xFF_C000, 0x4000);
        assert_eq!(
            plan(&entry, 0),
            Carve::Dma {
                base: 0xFF_C000,
                blocks: 4,
                consumed: None
            }
        );

        // Crosses the ceiling inside its last block.
        let entry = MemoryMapEntry::usable(0xFF_F000, 0x2000);
        assert_eq!(
            plan(&entry, 0),
            Carve::Dma {
                base: 0xFF_F000,
                blocks: 1,
                consumed: Some(0x1000)
            }
        );
    }

    #[test]
    fn plan_aligns_pool_bases() {
        // The boundary is past the ceiling, so everything goes to Normal.
        let entry = MemoryMapEntry::usable(0xFF_F800, 0x2800);
        assert_eq!(
            plan(&entry, 0),
            Carve::Normal {
                base: 0x100_0000,
                blocks: 2
            }
        );

        // The bytes dropped in front count towards what is consumed.
        let entry = MemoryMapEntry::usable(0x10_0800, 0x10_0000);
        assert_eq!(
            plan(&entry, 16),
            Carve::Dma {
                base: 0x10_1000,
                blocks: 48,
                consumed: Some(0x800 + 0x3_0000)
            }
        );

        // No boundary inside the record at all.
        let entry = MemoryMapEntry::usable(0x10_0001, 0xFFE);
        assert_eq!(
            plan(&entry, 0),
            Carve::Normal {
                base: 0x10_0001,
                blocks: 0
            }
        );
        let entry = MemoryMapEntry::usable(0xFFFF_F001, 0x1000);
        assert_eq!(
            plan(&entry, 0),
            Carve::Normal {
                base: 0xFFFF_F001,
                blocks: 0
            }
        );
    }

    #[test]
    fn unaligned_records_yield_aligned_blocks() {
        let mut map = [
            MemoryMapEntry::usable(0x10_0800, 0x4_0000),
            MemoryMapEntry::usable(0x100_0123, 0x10_0000),
        ];
        let mut metadata = vec![0; Pmm::metadata_words_required(&map)];
        assert_eq!(metadata.len(), 5 + 8);

        let mut pmm = Pmm::init(
            BootInfo::new(&mut map),
            KernelImage::new(0x100_1000, 0x100_2000, 0),
            &mut metadata,
        )
        .unwrap();

        let dma = pmm.zone(ZoneKind::Dma).unwrap();
        let normal = pmm.zone(ZoneKind::Normal).unwrap();
        assert_eq!(starts(dma), [(0x10_1000, 63)]);
        assert_eq!(starts(normal), [(0x100_1000, 255)]);

        // The kernel and 251 metadata bytes take blocks 0 and 1.
        assert_eq!(pmm.metadata_bytes(), 13 + 144 + 13 + 81);
        assert_eq!(pmm.alloc(1).unwrap(), PhysAddr::new(0x100_3000));
        pmm.check_invariants().unwrap();
    }

    #[test]
    fn single_record_is_split_between_zones() {
        let mut map = [MemoryMapEntry::usable(0x10_0000, 0x200_0000)];
        let mut metadata = vec![0; Pmm::metadata_words_required(&map)];
        assert_eq!(metadata.len(), 5 + 254);

        let pmm = Pmm::init(
            BootInfo::new(&mut map),
            higher_half(0x20_0000, 0x30_0000),
            &mut metadata,
        )
        .unwrap();

        let dma = pmm.zone(ZoneKind::Dma).unwrap();
        assert_eq!(starts(dma), [(0x10_0000, 64)]);
        assert_eq!(dma.free_blocks(), 64);
        let top = dma.pools()[0].ladder().top();
        assert_eq!((top.order(), top.free_blocks(), top.max_free_blocks()), (8, 8, 8));

        let normal = pmm.zone(ZoneKind::Normal).unwrap();
        assert_eq!(starts(normal), [(0x14_0000, 8128)]);
        assert_eq!(normal.total_blocks() + dma.total_blocks(), 8192);

        assert_eq!(dma.physical_size(), 157);
        assert_eq!(normal.physical_size(), 1078);
        assert_eq!(pmm.metadata_bytes(), 1235);
        assert_eq!(pmm.metadata_words_used(), metadata_len(&pmm));

        // Kernel at 0x200000..0x300000 plus 1235 metadata bytes: blocks
        // 192..=448 of the Normal pool.
        assert_eq!(normal.free_blocks(), 8128 - 257);
        pmm.check_invariants().unwrap();
    }

    fn metadata_len<const P: usize>(pmm: &Pmm<'_, P>) -> usize {
        pmm.zones()
            .flat_map(Zone::pools)
            .flat_map(|p| p.ladder().iter())
            .map(|b| b.word_count())
            .sum()
    }

    #[test]
    fn dma_pools_follow_the_ceiling_and_budget() {
        let mut map = [
            MemoryMapEntry::usable(0xFF_0000, 0x10_0000),
            MemoryMapEntry::usable(0x10_0000, 0x10_0000),
        ];
        let mut metadata = vec![0; 64];
        assert_eq!(Pmm::metadata_words_required(&map), 24);

        let pmm = Pmm::init(
            BootInfo::new(&mut map),
            KernelImage::new(0x14_0000, 0x15_0000, 0),
            &mut metadata,
        )
        .unwrap();

        let dma = pmm.zone(ZoneKind::Dma).unwrap();
        let normal = pmm.zone(ZoneKind::Normal).unwrap();
        assert_eq!(starts(dma), [(0xFF_0000, 16), (0x10_0000, 48)]);
        assert_eq!(starts(normal), [(0x100_0000, 240), (0x13_0000, 208)]);

        // DMA pools were cut off the front of the records.
        assert_eq!((map[0].base(), map[0].length()), (0x100_0000, 0xF_0000));
        assert_eq!((map[1].base(), map[1].length()), (0x13_0000, 0xD_0000));

        assert_eq!(pmm.metadata_bytes(), 297 + 171);
        // Blocks 16..=32 of the second Normal pool.
        assert_eq!(normal.free_blocks(), 240 + 208 - 17);
        assert_eq!(dma.free_blocks(), 64);
        pmm.check_invariants().unwrap();
    }

    #[test]
    fn unusable_records_are_skipped() {
        let mut map = [
            MemoryMapEntry::new(0, 0x9_FC00, 2),
            MemoryMapEntry::usable(0x1_0000_0000, 0x1000_0000),
            MemoryMapEntry::usable(0x10_0000, 0x80_0000),
            MemoryMapEntry::new(0xFFFC_0000, 0x4_0000, 3),
        ];
        let mut metadata = vec![0; 128];

        let pmm = Pmm::init(
            BootInfo::new(&mut map),
            KernelImage::new(0x20_0000, 0x21_0000, 0),
            &mut metadata,
        )
        .unwrap();

        assert_eq!(pmm.zone(ZoneKind::Dma).unwrap().pools().len(), 1);
        assert_eq!(pmm.zone(ZoneKind::Normal).unwrap().pools().len(), 1);
        assert_eq!(map[0].base(), 0);
        assert_eq!(map[3].length(), 0x4_0000);
    }

    #[test]
    fn kernel_may_live_in_dma_memory() {
        let mut map = [
            MemoryMapEntry::usable(0x10_0000, 0x4_0000),
            MemoryMapEntry::usable(0x100_0000, 0x100_0000),
        ];
        let mut metadata = vec![0; 256];

        let pmm = Pmm::init(
            BootInfo::new(&mut map),
            KernelImage::new(0x10_0000, 0x12_0000, 0),
            &mut metadata,
        )
        .unwrap();

        assert_eq!(pmm.metadata_bytes(), 157 + 574);

        // 0x100000..=0x1202DA covers blocks 0..=32. Order-8 unit 4 is split
        // so blocks 33..=39 stay free at orders 1, 2 and 4.
        let dma = pmm.zone(ZoneKind::Dma).unwrap();
        let pool = &dma.pools()[0];
        let frees: Vec<u32> = pool.ladder().iter().map(|b| b.free_blocks()).collect();
        assert_eq!(frees, [3, 1, 1, 1]);
        assert_eq!(pool.free_blocks(), 64 - 33);
        assert_eq!(dma.free_blocks(), 31);

        let normal = pmm.zone(ZoneKind::Normal).unwrap();
        assert_eq!(normal.free_blocks(), 4096);
        pmm.check_invariants().unwrap();
    }

    #[test]
    fn missing_memory_map_is_fatal() {
        let mut map = [MemoryMapEntry::usable(0x10_0000, 0x100_0000)];
        let mut metadata = vec![0; 256];

        let err = Pmm::init(
            BootInfo::with_flags(0, &mut map),
            KernelImage::new(0x10_0000, 0x11_0000, 0),
            &mut metadata,
        )
        .unwrap_err();
        assert_eq!(err, InitError::NoMemoryMap);
    }

    #[test]
    fn kernel_outside_every_pool_is_fatal() {
        let mut map = [MemoryMapEntry::usable(0x10_0000, 0x100_0000)];
        let mut metadata = vec![0; 256];

        let err = Pmm::init(
            BootInfo::new(&mut map),
            KernelImage::new(0x500_0000, 0x510_0000, 0),
            &mut metadata,
        )
        .unwrap_err();
        assert_eq!(
            err,
            InitError::KernelNotFound {
                start: PhysAddr::new(0x500_0000)
            }
        );
    }

    #[test]
    fn invalid_kernel_image_is_fatal() {
        let mut map = [MemoryMapEntry::usable(0x10_0000, 0x100_0000)];
        let mut metadata = vec![0; 256];

        let err = Pmm::init(
            BootInfo::new(&mut map),
            KernelImage::new(0x1000, 0x2000, KERNEL_OFFSET),
            &mut metadata,
        )
        .unwrap_err();
        assert!(matches!(err, InitError::InvalidKernelImage { .. }));
    }

    #[test]
    fn overlapping_records_are_fatal() {
        let mut map = [
            MemoryMapEntry::usable(0x100_0000, 0x10_0000),
            MemoryMapEntry::usable(0x108_0000, 0x10_0000),
        ];
        let mut metadata = vec![0; 256];

        let err = Pmm::init(
            BootInfo::new(&mut map),
            KernelImage::new(0x100_0000, 0x101_0000, 0),
            &mut metadata,
        )
        .unwrap_err();
        assert_eq!(
            err,
            InitError::OverlappingRecord {
                base: PhysAddr::new(0x108_0000),
                blocks: 256
            }
        );
    }

    #[test]
    fn pool_capacity_is_fatal() {
        let mut map = [
            MemoryMapEntry::usable(0x100_0000, 0x1_0000),
            MemoryMapEntry::usable(0x200_0000, 0x1_0000),
            MemoryMapEntry::usable(0x300_0000, 0x1_0000),
        ];
        let mut metadata = vec![0; 256];

        let err = Pmm::<2>::init_with_capacity(
            BootInfo::new(&mut map),
            KernelImage::new(0x100_0000, 0x100_1000, 0),
            &mut metadata,
        )
        .unwrap_err();
        assert_eq!(
            err,
            InitError::TooManyPools {
                kind: ZoneKind::Normal,
                capacity: 2
            }
        );
    }

    #[test]
    fn small_metadata_region_is_fatal() {
        let mut map = [MemoryMapEntry::usable(0x10_0000, 0x200_0000)];
        let mut metadata = vec![0; 100];

        let err = Pmm::init(
            BootInfo::new(&mut map),
            KernelImage::new(0x20_0000, 0x30_0000, 0),
            &mut metadata,
        )
        .unwrap_err();
        assert!(matches!(err, InitError::Metadata(_)));
    }

    #[test]
    fn sub_block_fragments_are_dropped() {
        let mut map = [
            MemoryMapEntry::usable(0x10_0000, 0x800),
            MemoryMapEntry::usable(0x100_0000, 0x10_0000),
        ];
        let mut metadata = vec![0; 64];

        let pmm = Pmm::init(
            BootInfo::new(&mut map),
            KernelImage::new(0x100_0000, 0x100_1000, 0),
            &mut metadata,
        )
        .unwrap();

        assert!(pmm.zone(ZoneKind::Dma).unwrap().pools().is_empty());
        assert_eq!(pmm.zone(ZoneKind::Normal).unwrap().pools().len(), 1);
        pmm.check_invariants().unwrap();
    }

    fn alloc_fixture(metadata: &mut [Word]) -> Pmm<'_> {
        let mut map = [
            MemoryMapEntry::usable(0x10_0000, 0x4_0000),
            MemoryMapEntry::usable(0x100_0000, 0x100_0000),
        ];
        Pmm::init(
            BootInfo::new(&mut map),
            KernelImage::new(0x10_0000, 0x12_0000, 0),
            metadata,
        )
        .unwrap()
    }

    #[test]
    fn alloc_is_first_fit() {
        let mut metadata = vec![0; 256];
        let mut pmm = alloc_fixture(&mut metadata);

        let a = pmm.alloc(BLOCK_SIZE).unwrap();
        let b = pmm.alloc(1).unwrap();
        assert_eq!(a, PhysAddr::new(0x100_0000));
        assert_eq!(b, PhysAddr::new(0x100_1000));

        pmm.free(a, BLOCK_SIZE).unwrap();
        assert_eq!(pmm.alloc(BLOCK_SIZE).unwrap(), a);

        // Two blocks do not fit in the hole left by one.
        pmm.free(a, BLOCK_SIZE).unwrap();
        assert_eq!(pmm.alloc(2 * BLOCK_SIZE).unwrap(), PhysAddr::new(0x100_2000));
        pmm.check_invariants().unwrap();
    }

    #[test]
    fn alloc_and_free_update_counters() {
        let mut metadata = vec![0; 256];
        let mut pmm = alloc_fixture(&mut metadata);
        let before = pmm.stats();

        let addr = pmm.alloc(3 * BLOCK_SIZE + 1).unwrap();
        let normal = pmm.stats().normal.unwrap();
        assert_eq!(normal.free_blocks, 4096 - 4);

        pmm.free(addr, 4 * BLOCK_SIZE).unwrap();
        assert_eq!(pmm.stats(), before);
        pmm.check_invariants().unwrap();
    }

    #[test]
    fn alloc_rejects_bad_requests() {
        let mut metadata = vec![0; 256];
        let mut pmm = alloc_fixture(&mut metadata);
        let before = pmm.stats();

        assert_eq!(pmm.alloc(0), Err(AllocError::ZeroSize));
        assert_eq!(
            pmm.alloc(4097 * BLOCK_SIZE),
            Err(AllocError::InsufficientBlocks {
                requested: 4097,
                available: 4096
            })
        );

        pmm.alloc(BLOCK_SIZE).unwrap();
        assert_eq!(
            pmm.alloc(4095 * BLOCK_SIZE),
            Ok(PhysAddr::new(0x100_1000))
        );

        // Two free blocks, but not adjacent.
        pmm.free(PhysAddr::new(0x100_0000), BLOCK_SIZE).unwrap();
        pmm.free(PhysAddr::new(0x100_2000), BLOCK_SIZE).unwrap();
        assert_eq!(
            pmm.alloc(2 * BLOCK_SIZE),
            Err(AllocError::NoContiguousRun { requested: 2 })
        );

        pmm.free(PhysAddr::new(0x100_1000), BLOCK_SIZE).unwrap();
        pmm.free(PhysAddr::new(0x100_3000), 4093 * BLOCK_SIZE)
            .unwrap();
        assert!(pmm.free(PhysAddr::new(0x100_3000), BLOCK_SIZE).is_err());
        assert_eq!(pmm.stats(), before);
        pmm.check_invariants().unwrap();
    }

    #[test]
    fn free_rejects_bad_requests() {
        let mut metadata = vec![0; 256];
        let mut pmm = alloc_fixture(&mut metadata);
        let addr = pmm.alloc(2 * BLOCK_SIZE).unwrap();
        let before = pmm.stats();

        assert_eq!(pmm.free(addr, 0), Err(FreeError::ZeroSize));
        assert_eq!(
            pmm.free(PhysAddr::new(0x10_0000), BLOCK_SIZE),
            Err(FreeError::UnknownAddress(PhysAddr::new(0x10_0000)))
        );
        assert_eq!(
            pmm.free(PhysAddr::new(0x100_0010), BLOCK_SIZE),
            Err(FreeError::Misaligned(PhysAddr::new(0x100_0010)))
        );
        assert_eq!(
            pmm.free(PhysAddr::new(0x1FF_F000), 2 * BLOCK_SIZE),
            Err(FreeError::OutOfBounds {
                addr: PhysAddr::new(0x1FF_F000),
                blocks: 2
            })
        );
        assert_eq!(
            pmm.free(addr, 3 * BLOCK_SIZE),
            Err(FreeError::NotAllocated { addr, blocks: 3 })
        );
        assert_eq!(pmm.stats(), before);

        pmm.free(addr, 2 * BLOCK_SIZE).unwrap();
        assert_eq!(
            pmm.free(addr, 2 * BLOCK_SIZE),
            Err(FreeError::NotAllocated { addr, blocks: 2 })
        );
    }

    #[test]
    fn free_never_releases_the_kernel() {
        let mut map = [MemoryMapEntry::usable(0x100_0000, 0x100_0000)];
        let mut metadata = vec![0; 256];
        let mut pmm = Pmm::init(
            BootInfo::new(&mut map),
            KernelImage::new(0x100_0000, 0x101_0000, 0),
            &mut metadata,
        )
        .unwrap();

        // Two zone headers and one pool of 4096 blocks.
        assert_eq!(pmm.metadata_bytes(), 13 + 13 + 24 + 25 + 512);
        assert_eq!(pmm.reserved(), 0x100_0000..0x101_0000 + 587);
        let before = pmm.stats();

        // The image itself.
        assert_eq!(
            pmm.free(PhysAddr::new(0x100_0000), 0x1_0000),
            Err(FreeError::Reserved {
                addr: PhysAddr::new(0x100_0000),
                blocks: 16
            })
        );
        // The block holding the metadata.
        assert_eq!(
            pmm.free(PhysAddr::new(0x101_0000), BLOCK_SIZE),
            Err(FreeError::Reserved {
                addr: PhysAddr::new(0x101_0000),
                blocks: 1
            })
        );

        // A real allocation released together with the metadata block.
        let addr = pmm.alloc(BLOCK_SIZE).unwrap();
        assert_eq!(addr, PhysAddr::new(0x101_1000));
        assert_eq!(
            pmm.free(PhysAddr::new(0x101_0000), 2 * BLOCK_SIZE),
            Err(FreeError::Reserved {
                addr: PhysAddr::new(0x101_0000),
                blocks: 2
            })
        );

        pmm.free(addr, BLOCK_SIZE).unwrap();
        assert_eq!(pmm.stats(), before);

        // Nothing inside the image is ever handed out.
        let next = pmm.alloc(BLOCK_SIZE).unwrap();
        assert!(!pmm.reserved().contains(&next.as_u64()));
        pmm.check_invariants().unwrap();
    }

    #[test]
    fn alloc_without_normal_zone() {
        let mut map = [MemoryMapEntry::usable(0x10_0000, 0x4_0000)];
        let mut metadata = vec![0; 64];
        let mut pmm = Pmm::init(
            BootInfo::new(&mut map),
            KernelImage::new(0x10_0000, 0x11_0000, 0),
            &mut metadata,
        )
        .unwrap();

        assert!(pmm.zone(ZoneKind::Normal).is_none());
        assert_eq!(
            pmm.alloc(BLOCK_SIZE),
            Err(AllocError::InsufficientBlocks {
                requested: 1,
                available: 0
            })
        );
        assert_eq!(
            pmm.free(PhysAddr::new(0x10_0000), BLOCK_SIZE),
            Err(FreeError::UnknownAddress(PhysAddr::new(0x10_0000)))
        );
    }

    #[test]
    fn alloc_skips_pools_without_room() {
        let mut map = [
            MemoryMapEntry::usable(0x100_0000, 0x2000),
            MemoryMapEntry::usable(0x200_0000, 0x10_0000),
        ];
        let mut metadata = vec![0; 64];
        let mut pmm = Pmm::init(
            BootInfo::new(&mut map),
            KernelImage::new(0x200_0000, 0x200_1000, 0),
            &mut metadata,
        )
        .unwrap();

        // The first pool only has two blocks. The kernel and 160 metadata
        // bytes take the first two blocks of the second.
        assert_eq!(pmm.alloc(2 * BLOCK_SIZE).unwrap(), PhysAddr::new(0x100_0000));
        assert_eq!(pmm.alloc(BLOCK_SIZE).unwrap(), PhysAddr::new(0x200_2000));
        pmm.check_invariants().unwrap();
    }

    #[test]
    fn stats_and_dump_render() {
        let mut metadata = vec![0; 256];
        let pmm = alloc_fixture(&mut metadata);

        let stats = pmm.stats();
        assert_eq!(stats.dma.pools, 1);
        assert_eq!(stats.dma.total_blocks, 64);
        assert_eq!(stats.dma.free_blocks, 31);
        assert_eq!(stats.metadata_bytes, 731);

        let text = stats.to_string();
        assert!(text.starts_with("Physical memory\n~~~~~~~~~~~~~~~\n"));
        assert!(text.contains("Metadata bytes: 731"));

        let dump = pmm.dump(ZoneKind::Normal).unwrap().to_string();
        assert!(dump.starts_with("Normal zone"));
        assert_eq!(dump.matches("order").count(), 1);
    }
}
