use spin::Mutex;

use crate::{
    bitmap::Word, AllocError, BootInfo, FreeError, InitError, KernelImage, PhysAddr, Pmm,
    PmmStats, DEFAULT_POOLS,
};

/// A [`Pmm`] behind a [`spin::Mutex`], initialized at most once.
///
/// `LockedPmm::new` is a `const fn`, so the manager can be placed in a
/// `static` and initialized during boot:
///
/// ```
/// use zoned_pmm::{BootInfo, KernelImage, LockedPmm, MemoryMapEntry, BLOCK_SIZE};
///
/// static PMM: LockedPmm<'static> = LockedPmm::new();
///
/// let map = Box::leak(Box::new([MemoryMapEntry::usable(0x100_0000, 0x100_0000)]));
/// let metadata = Box::leak(Box::new([0; 256]));
/// PMM.init(
///     BootInfo::new(map),
///     KernelImage::new(0x100_0000, 0x101_0000, 0),
///     metadata,
/// )
/// .unwrap();
///
/// let block = PMM.alloc(BLOCK_SIZE).unwrap();
/// PMM.free(block, BLOCK_SIZE).unwrap();
/// ```
#[cfg_attr(docs_rs, doc(cfg(feature = "spin")))]
pub struct LockedPmm<'a, const POOLS: usize = DEFAULT_POOLS> {
    inner: Mutex<Option<Pmm<'a, POOLS>>>,
}

impl<'a, const POOLS: usize> LockedPmm<'a, POOLS> {
    /// Constructs an uninitialized manager.
    pub const fn new() -> LockedPmm<'a, POOLS> {
        LockedPmm {
            inner: Mutex::new(None),
        }
    }

    /// Initializes the manager. See [`Pmm::init`].
    ///
    /// # Errors
    ///
    /// Returns `Err` if the manager is already initialized or if
    /// initialization fails. A failed initialization leaves the manager
    /// uninitialized.
    pub fn init(
        &self,
        boot: BootInfo<'_>,
        kernel: KernelImage,
        metadata: &'a mut [Word],
    ) -> Result<(), InitError> {
        let mut inner = self.inner.lock();
        if inner.is_some() {
            return Err(InitError::AlreadyInitialized);
        }

        *inner = Some(Pmm::init_with_capacity(boot, kernel, metadata)?);
        Ok(())
    }

    /// Returns `true` if [`LockedPmm::init`] has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Allocates memory. See [`Pmm::alloc`].
    ///
    /// # Errors
    ///
    /// Returns `Err` if the manager is uninitialized or the allocation fails.
    pub fn alloc(&self, bytes: u32) -> Result<PhysAddr, AllocError> {
        self.inner
            .lock()
            .as_mut()
            .ok_or(AllocError::Uninitialized)?
            .alloc(bytes)
    }

    /// Frees memory. See [`Pmm::free`].
    ///
    /// # Errors
    ///
    /// Returns `Err` if the manager is uninitialized or the release is
    /// rejected.
    pub fn free(&self, addr: PhysAddr, bytes: u32) -> Result<(), FreeError> {
        self.inner
            .lock()
            .as_mut()
            .ok_or(FreeError::Uninitialized)?
            .free(addr, bytes)
    }

    /// Returns a summary of both zones, or `None` before initialization.
    pub fn stats(&self) -> Option<PmmStats> {
        self.inner.lock().as_ref().map(Pmm::stats)
    }

    /// Runs `f` with exclusive access to the manager, or returns `None`
    /// before initialization.
    pub fn with<R>(&self, f: impl FnOnce(&mut Pmm<'a, POOLS>) -> R) -> Option<R> {
        self.inner.lock().as_mut().map(f)
    }
}

impl<const POOLS: usize> Default for LockedPmm<'_, POOLS> {
    fn default() -> Self {
        LockedPmm::new()
    }
}

impl<const POOLS: usize> core::fmt::Debug for LockedPmm<'_, POOLS> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LockedPmm")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
