//! Boot loader memory map records.
//!
//! The layout of [`MemoryMapEntry`] matches the records a Multiboot loader
//! places in memory, so a kernel can hand the loader's buffer over as is.

use core::fmt;

use crate::{MBT_FLAG_IS_MMAP, MMAP_TYPE_USABLE};

/// The size of a record excluding its own `size` field.
pub const ENTRY_SIZE: u32 = 20;

const ADDRESS_SPACE: u64 = 1 << 32;

/// One record of the boot memory map.
#[repr(C)]
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct MemoryMapEntry {
    /// Size of the rest of the record.
    pub size: u32,
    /// Low half of the base address.
    pub base_low: u32,
    /// High half of the base address.
    pub base_high: u32,
    /// Low half of the length in bytes.
    pub length_low: u32,
    /// High half of the length in bytes.
    pub length_high: u32,
    /// Record type; `1` is usable RAM.
    pub entry_type: u32,
}

impl MemoryMapEntry {
    /// Constructs a record from 64-bit base and length values.
    pub const fn new(base: u64, length: u64, entry_type: u32) -> MemoryMapEntry {
        MemoryMapEntry {
            size: ENTRY_SIZE,
            base_low: base as u32,
            base_high: (base >> 32) as u32,
            length_low: length as u32,
            length_high: (length >> 32) as u32,
            entry_type,
        }
    }

    /// Constructs a record of usable RAM.
    pub const fn usable(base: u64, length: u64) -> MemoryMapEntry {
        MemoryMapEntry::new(base, length, MMAP_TYPE_USABLE)
    }

    /// Returns the full base address.
    #[inline]
    pub fn base(&self) -> u64 {
        u64::from(self.base_high) << 32 | u64::from(self.base_low)
    }

    /// Returns the full length in bytes.
    #[inline]
    pub fn length(&self) -> u64 {
        u64::from(self.length_high) << 32 | u64::from(self.length_low)
    }

    /// Returns the length in bytes, cut off at the end of the 32-bit
    /// address space.
    #[inline]
    pub fn clamped_length(&self) -> u64 {
        if !self.is_addressable() {
            return 0;
        }

        self.length().min(ADDRESS_SPACE - u64::from(self.base_low))
    }

    /// Returns `true` if the record lies in the 32-bit address space.
    #[inline]
    pub fn is_addressable(&self) -> bool {
        self.base_high == 0
    }

    /// Returns `true` if the record describes addressable usable RAM.
    #[inline]
    pub fn is_usable(&self) -> bool {
        self.is_addressable() && self.entry_type == MMAP_TYPE_USABLE
    }

    /// Cuts `bytes` off the front of the record.
    ///
    /// `bytes` must not exceed the clamped length.
    pub(crate) fn consume_front(&mut self, bytes: u32) {
        debug_assert!(u64::from(bytes) <= self.clamped_length());

        let length = self.length() - u64::from(bytes);
        self.base_low += bytes;
        self.length_low = length as u32;
        self.length_high = (length >> 32) as u32;
    }
}

impl fmt::Debug for MemoryMapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryMapEntry")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("length", &format_args!("{:#x}", self.length()))
            .field("type", &self.entry_type)
            .finish()
    }
}

/// The parts of the boot information the memory manager consumes.
#[derive(Debug)]
pub struct BootInfo<'m> {
    /// Boot flags. [`MBT_FLAG_IS_MMAP`] must be set for `memory_map` to be
    /// read.
    pub flags: u32,
    /// The memory map. Records are shrunk in place while DMA pools are
    /// carved out of them.
    pub memory_map: &'m mut [MemoryMapEntry],
}

impl<'m> BootInfo<'m> {
    /// Constructs boot information advertising `memory_map`.
    pub fn new(memory_map: &'m mut [MemoryMapEntry]) -> BootInfo<'m> {
        BootInfo::with_flags(MBT_FLAG_IS_MMAP, memory_map)
    }

    /// Constructs boot information with explicit flags.
    pub fn with_flags(flags: u32, memory_map: &'m mut [MemoryMapEntry]) -> BootInfo<'m> {
        BootInfo { flags, memory_map }
    }

    /// Returns `true` if the flags mark the memory map as valid.
    #[inline]
    pub fn has_memory_map(&self) -> bool {
        self.flags & MBT_FLAG_IS_MMAP != 0
    }
}

/// A forward cursor over the memory map.
///
/// The record under the cursor may be shrunk before the cursor moves on, so
/// one record can feed several pools.
#[derive(Debug)]
pub(crate) struct MemoryMapCursor<'m> {
    entries: &'m mut [MemoryMapEntry],
    index: usize,
}

impl<'m> MemoryMapCursor<'m> {
    pub(crate) fn new(entries: &'m mut [MemoryMapEntry]) -> MemoryMapCursor<'m> {
        MemoryMapCursor { entries, index: 0 }
    }

    /// Returns the record under the cursor, or `None` at the end of the map.
    #[inline]
    pub(crate) fn current(&self) -> Option<&MemoryMapEntry> {
        self.entries.get(self.index)
    }

    #[inline]
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub(crate) fn advance(&mut self) {
        self.index += 1;
    }

    /// Cuts `bytes` off the front of the current record without advancing.
    pub(crate) fn consume_front(&mut self, bytes: u32) {
        if let Some(entry) = self.entries.get_mut(self.index) {
            entry.consume_front(bytes);
        }
    }
}
