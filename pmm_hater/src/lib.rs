//! Fuzzing glue between `zoned_pmm` and `alloc_hater`.

use alloc_hater::Subject;
use arbitrary::{Arbitrary, Unstructured};
use zoned_pmm::{
    BootInfo, FreeError, InitError, KernelImage, MemoryMapEntry, PhysAddr, Pmm, BLOCK_SIZE,
    MMAP_TYPE_USABLE, Word,
};

/// Physical base of the generated kernel image.
pub const KERNEL_BASE: u32 = 0x4000_0000;

/// Length of the usable record holding the kernel image.
pub const KERNEL_RECORD_LEN: u64 = 0x100_0000;

/// Maximum number of records besides the kernel's.
pub const MAX_RECORDS: usize = 16;

const SLOTS: u64 = 64;
const SLOT_SIZE: u64 = KERNEL_BASE as u64 / SLOTS;

/// A boot memory map together with the kernel image it describes.
///
/// Usable records never overlap each other. Records of other types and
/// records that cross the 32-bit boundary are generated too, since the
/// manager must skip them.
#[derive(Clone, Debug)]
pub struct MapArgs {
    pub records: Vec<MemoryMapEntry>,
    pub kernel: KernelImage,
}

impl MapArgs {
    /// Returns the number of metadata words needed to initialize a manager
    /// from this map.
    pub fn metadata_words(&self) -> usize {
        Pmm::metadata_words_required(&self.records)
    }

    /// Initializes a manager from this map, using `metadata` for its
    /// bookkeeping. The records are shrunk in place.
    pub fn init<'a>(&mut self, metadata: &'a mut [Word]) -> Result<Pmm<'a>, InitError> {
        Pmm::init(BootInfo::new(&mut self.records), self.kernel, metadata)
    }
}

impl Arbitrary<'_> for MapArgs {
    fn arbitrary(un: &mut Unstructured<'_>) -> arbitrary::Result<MapArgs> {
        let count = usize::arbitrary(un)? % (MAX_RECORDS + 1);
        let mut records = Vec::with_capacity(count + 1);

        // Every usable record gets its own slot below the kernel, so none of
        // them overlap.
        let mut slots: Vec<u64> = (0..SLOTS).collect();
        for _ in 0..count {
            if slots.is_empty() {
                break;
            }

            let slot = slots.swap_remove(usize::arbitrary(un)? % slots.len());
            let offset = u64::arbitrary(un)? % SLOT_SIZE;
            let len = u64::arbitrary(un)? % (SLOT_SIZE - offset + 1);
            let entry_type = match u8::arbitrary(un)? % 4 {
                0 => 2,
                _ => MMAP_TYPE_USABLE,
            };

            records.push(MemoryMapEntry::new(
                slot * SLOT_SIZE + offset,
                len,
                entry_type,
            ));
        }

        if bool::arbitrary(un)? {
            records.push(MemoryMapEntry::usable(
                0x1_0000_0000 - u64::from(BLOCK_SIZE),
                u64::from(BLOCK_SIZE) * 4,
            ));
        }

        let pos = usize::arbitrary(un)? % (records.len() + 1);
        records.insert(
            pos,
            MemoryMapEntry::usable(KERNEL_BASE.into(), KERNEL_RECORD_LEN),
        );

        let offset = u32::arbitrary(un)? % 0x10_0000;
        let len = 1 + u32::arbitrary(un)? % 0x10_0000;
        let kernel = KernelImage::new(KERNEL_BASE + offset, KERNEL_BASE + offset + len, 0);

        Ok(MapArgs { records, kernel })
    }
}

/// A [`Pmm`] evaluated through its Normal zone.
pub struct PmmSubject<'a>(Pmm<'a>);

impl<'a> PmmSubject<'a> {
    pub fn new(pmm: Pmm<'a>) -> PmmSubject<'a> {
        PmmSubject(pmm)
    }

    pub fn pmm(&self) -> &Pmm<'a> {
        &self.0
    }
}

impl Subject for PmmSubject<'_> {
    type Op = ();
    type AllocError = zoned_pmm::AllocError;
    type DeallocError = FreeError;

    fn granularity(&self) -> u32 {
        BLOCK_SIZE
    }

    fn allocate(&mut self, bytes: u32) -> Result<u64, Self::AllocError> {
        self.0.alloc(bytes).map(PhysAddr::as_u64)
    }

    fn deallocate(&mut self, addr: u64, bytes: u32) -> Result<(), Self::DeallocError> {
        let addr = u32::try_from(addr).map_err(|_| FreeError::UnknownAddress(PhysAddr::new(0)))?;
        self.0.free(PhysAddr::new(addr), bytes)
    }

    fn is_consistent(&self) -> bool {
        self.0.check_invariants().is_ok()
    }

    fn handle_custom_op(&mut self, (): ()) {}
}
