//! A zoned physical memory manager for early kernel boot.
//!
//! The manager partitions the physical address space reported by the boot
//! loader into two zones:
//!
//! - the **DMA** zone, at most [`DMA_TOTAL_BLOCKS`] blocks below
//!   [`DMA_MAX_ADDRESS`], where every pool carries a ladder of buddy bitmaps
//!   (orders [`MAX_BLOCK_ORDER`] down to 1);
//! - the **Normal** zone, holding everything else, where every pool carries a
//!   single order-1 bitmap that is searched first-fit by [`Pmm::alloc`].
//!
//! All metadata lives in a caller-supplied region directly behind the kernel
//! image and is laid out by the manager itself; no general-purpose allocator
//! is needed.
//!
//! ```
//! use zoned_pmm::{BootInfo, KernelImage, MemoryMapEntry, Pmm, BLOCK_SIZE};
//!
//! let mut map = [
//!     MemoryMapEntry::usable(0x10_0000, 0x40000),
//!     MemoryMapEntry::usable(0x100_0000, 0x100_0000),
//! ];
//! let kernel = KernelImage::new(0x10_0000, 0x12_0000, 0);
//!
//! let mut metadata = [0; 1024];
//! let mut pmm = Pmm::init(BootInfo::new(&mut map), kernel, &mut metadata).unwrap();
//!
//! let block = pmm.alloc(BLOCK_SIZE).unwrap();
//! assert_eq!(block.as_u32(), 0x100_0000);
//! pmm.free(block, BLOCK_SIZE).unwrap();
//! ```

#![doc(html_root_url = "https://docs.rs/zoned_pmm/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_code)]
#![no_std]

#[cfg(test)]
#[macro_use]
extern crate alloc;

pub mod arena;
pub mod bitmap;
pub mod buddy;
pub mod mmap;
mod pmm;
#[cfg(feature = "spin")]
mod sync;
pub mod zone;


use core::fmt;

pub use crate::{
    arena::{ArenaError, MetadataArena},
    bitmap::{Bitmap, BitmapError, Word, WORD_BITS},
    mmap::{BootInfo, MemoryMapEntry},
    pmm::{Pmm, PmmStats, ZoneStats},
    zone::{Pool, Zone, ZoneKind},
};

#[cfg(feature = "spin")]
pub use crate::sync::LockedPmm;

/// The size of a block, the smallest allocation unit, in bytes.
pub const BLOCK_SIZE: u32 = 4096;

/// The largest buddy order. An order-`k` unit spans `k` blocks.
///
/// Must be a power of two.
pub const MAX_BLOCK_ORDER: u32 = 8;

/// The number of orders in a DMA pool's buddy ladder.
pub const LADDER_DEPTH: usize = MAX_BLOCK_ORDER.trailing_zeros() as usize + 1;

/// The highest address (inclusive) a DMA pool may cover.
pub const DMA_MAX_ADDRESS: u32 = 0x00FF_FFFF;

/// The DMA zone budget in bytes.
pub const DMA_TOTAL_BYTES: u32 = 0x40000;

/// The DMA zone budget in blocks.
pub const DMA_TOTAL_BLOCKS: u32 = DMA_TOTAL_BYTES / BLOCK_SIZE;

/// Boot flag bit signalling that the memory map fields are valid.
pub const MBT_FLAG_IS_MMAP: u32 = 0x40;

/// Memory map record type of usable RAM.
pub const MMAP_TYPE_USABLE: u32 = 1;

/// Default pool capacity of each zone.
pub const DEFAULT_POOLS: usize = 32;

// Packed on-media header sizes. The physical footprint of the metadata is
// accounted as if each header were stored with these exact widths:
//
// zone:  type u8, free u32, size u32, first pool u32
// pool:  free u32, start u32, size u32, top u32, bottom u32, next u32
// buddy: order u8, words u32, free u32, max free u32, map u32, next u32, prev u32

/// Bytes charged for a zone header.
pub const ZONE_HEADER_SIZE: u32 = 13;
/// Bytes charged for a pool header.
pub const POOL_HEADER_SIZE: u32 = 24;
/// Bytes charged for a buddy header.
pub const BUDDY_HEADER_SIZE: u32 = 25;

const _: () = assert!(MAX_BLOCK_ORDER.is_power_of_two());
const _: () = assert!(DMA_TOTAL_BYTES % BLOCK_SIZE == 0);

/// A 32-bit physical address.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u32);

impl PhysAddr {
    /// Wraps a raw address.
    #[inline]
    pub const fn new(addr: u32) -> PhysAddr {
        PhysAddr(addr)
    }

    /// Returns the raw address.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the address widened to 64 bits.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }

    /// Adds `bytes`, returning `None` on overflow.
    #[inline]
    pub fn checked_add(self, bytes: u32) -> Option<PhysAddr> {
        self.0.checked_add(bytes).map(PhysAddr)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Linker-provided bounds of the kernel image.
///
/// `start` and `end` are virtual addresses; `virtual_offset` is subtracted
/// from both to obtain physical addresses. The metadata region handed to
/// [`Pmm::init`] is assumed to start at the physical end of the image.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KernelImage {
    /// First byte of the image.
    pub start: u32,
    /// One past the last byte of the image.
    pub end: u32,
    /// Virtual-to-physical offset applied to early addresses.
    pub virtual_offset: u32,
}

impl KernelImage {
    /// Constructs the bounds of a kernel image.
    pub const fn new(start: u32, end: u32, virtual_offset: u32) -> KernelImage {
        KernelImage {
            start,
            end,
            virtual_offset,
        }
    }

    fn invalid(self) -> InitError {
        InitError::InvalidKernelImage {
            start: self.start,
            end: self.end,
            offset: self.virtual_offset,
        }
    }

    /// Returns the physical address of the first byte of the image.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the bounds are inverted or lie below the offset.
    pub fn physical_start(self) -> Result<PhysAddr, InitError> {
        if self.start > self.end {
            return Err(self.invalid());
        }

        self.start
            .checked_sub(self.virtual_offset)
            .map(PhysAddr)
            .ok_or_else(|| self.invalid())
    }

    /// Returns the physical address one past the image, where the metadata
    /// region begins.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the bounds are inverted or lie below the offset.
    pub fn physical_end(self) -> Result<PhysAddr, InitError> {
        self.physical_start()?;

        self.end
            .checked_sub(self.virtual_offset)
            .map(PhysAddr)
            .ok_or_else(|| self.invalid())
    }
}

/// The error type for [`Pmm::init`].
///
/// Every variant is fatal: the caller is expected to halt the boot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InitError {
    /// The boot flags do not advertise a memory map.
    #[error("no memory map available")]
    NoMemoryMap,

    /// The kernel image bounds cannot be translated to physical addresses.
    #[error("invalid kernel image {start:#x}..{end:#x} with virtual offset {offset:#x}")]
    InvalidKernelImage {
        /// Virtual start of the image.
        start: u32,
        /// Virtual end of the image.
        end: u32,
        /// Virtual-to-physical offset.
        offset: u32,
    },

    /// No pool contains the physical start of the kernel image.
    #[error("no pool contains the kernel image at {start}")]
    KernelNotFound {
        /// Physical start of the kernel image.
        start: PhysAddr,
    },

    /// A memory map record overlaps memory already owned by a pool.
    #[error("memory map record at {base} ({blocks} blocks) overlaps an existing pool")]
    OverlappingRecord {
        /// Base of the rejected span.
        base: PhysAddr,
        /// Length of the rejected span in blocks.
        blocks: u32,
    },

    /// A zone ran out of pool slots.
    #[error("{kind:?} zone cannot hold more than {capacity} pools")]
    TooManyPools {
        /// The full zone.
        kind: ZoneKind,
        /// The pool capacity of the zone.
        capacity: usize,
    },

    /// The allocator has already been initialized.
    #[error("physical memory manager is already initialized")]
    AlreadyInitialized,

    /// The metadata region is too small or too high in memory.
    #[error(transparent)]
    Metadata(#[from] ArenaError),

    /// A bitmap operation was out of range.
    #[error(transparent)]
    Bitmap(#[from] BitmapError),
}

/// The error type for [`Pmm::alloc`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// Zero-byte requests are rejected.
    #[error("zero-sized allocation request")]
    ZeroSize,

    /// The Normal zone holds fewer free blocks than requested.
    #[error("requested {requested} blocks but only {available} are free")]
    InsufficientBlocks {
        /// Requested blocks.
        requested: u32,
        /// Free blocks in the Normal zone.
        available: u32,
    },

    /// Enough blocks are free, but no pool has a long enough run.
    #[error("no run of {requested} contiguous free blocks")]
    NoContiguousRun {
        /// Requested blocks.
        requested: u32,
    },

    /// The allocator has not been initialized.
    #[error("physical memory manager is not initialized")]
    Uninitialized,

    /// A bitmap operation was out of range.
    #[error(transparent)]
    Bitmap(#[from] BitmapError),
}

/// The error type for [`Pmm::free`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FreeError {
    /// Zero-byte releases are rejected.
    #[error("zero-sized free request")]
    ZeroSize,

    /// The address is not inside any Normal pool.
    #[error("{0} is not inside any normal pool")]
    UnknownAddress(PhysAddr),

    /// The address is not on a block boundary of its pool.
    #[error("{0} is not aligned to a block of its pool")]
    Misaligned(PhysAddr),

    /// The released range runs past the end of the pool.
    #[error("releasing {blocks} blocks at {addr} runs past the end of its pool")]
    OutOfBounds {
        /// Start of the released range.
        addr: PhysAddr,
        /// Released blocks.
        blocks: u32,
    },

    /// The released range touches the kernel image or the manager's own
    /// metadata.
    #[error("releasing {blocks} blocks at {addr} touches the kernel image or its metadata")]
    Reserved {
        /// Start of the released range.
        addr: PhysAddr,
        /// Released blocks.
        blocks: u32,
    },

    /// Part of the released range is not currently allocated.
    #[error("releasing {blocks} blocks at {addr} covers blocks that are not allocated")]
    NotAllocated {
        /// Start of the released range.
        addr: PhysAddr,
        /// Released blocks.
        blocks: u32,
    },

    /// The allocator has not been initialized.
    #[error("physical memory manager is not initialized")]
    Uninitialized,

    /// A bitmap operation was out of range.
    #[error(transparent)]
    Bitmap(#[from] BitmapError),
}

/// A broken zone, pool or buddy invariant, reported by
/// [`Pmm::check_invariants`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    /// A zone's free count differs from the sum of its pools'.
    #[error("{kind:?} zone records {recorded} free blocks, its pools hold {computed}")]
    ZoneFreeBlocks {
        /// The zone.
        kind: ZoneKind,
        /// The zone's counter.
        recorded: u32,
        /// The sum over its pools.
        computed: u32,
    },

    /// A pool's free count differs from what its buddies describe.
    #[error("pool at {start} records {recorded} free blocks, its buddies hold {computed}")]
    PoolFreeBlocks {
        /// Start of the pool.
        start: PhysAddr,
        /// The pool's counter.
        recorded: u32,
        /// The sum over its buddies of free units times order.
        computed: u32,
    },

    /// A buddy's free count differs from the clear bits in its map.
    #[error("order-{order} buddy of pool {start} records {recorded} free units, its map has {counted}")]
    BuddyFreeBlocks {
        /// Start of the pool.
        start: PhysAddr,
        /// Order of the buddy.
        order: u32,
        /// The buddy's counter.
        recorded: u32,
        /// Clear bits below the buddy's maximum.
        counted: u32,
    },

    /// A bit past a buddy's maximum is clear.
    #[error("order-{order} buddy of pool {start} has a clear padding bit")]
    PaddingClear {
        /// Start of the pool.
        start: PhysAddr,
        /// Order of the buddy.
        order: u32,
    },

    /// Two pools cover the same memory.
    #[error("pools at {first} and {second} overlap")]
    Overlap {
        /// Start of the earlier pool.
        first: PhysAddr,
        /// Start of the later pool.
        second: PhysAddr,
    },

    /// A DMA pool reaches past the DMA ceiling.
    #[error("dma pool at {start} crosses the dma ceiling")]
    DmaCeiling {
        /// Start of the pool.
        start: PhysAddr,
    },

    /// The DMA zone manages more blocks than its budget.
    #[error("dma zone manages {blocks} blocks, above its budget")]
    DmaBudget {
        /// Blocks managed by the DMA zone.
        blocks: u32,
    },
}
