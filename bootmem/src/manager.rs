//! Memory manager: page/pool gateway, allocation tracking and lifecycle.
//!
//! ```text
//! startup ──► tracker storage (untracked, below the ceiling)
//!        └──► map buffer (tracked) ─► GetMemoryMap ─► E820 translate ─► free buffer
//!
//! allocate_pages_* ─► firmware ─► tracker.record
//! free_pages       ─► tracker.release ─► firmware
//!
//! shutdown ─► free every tracked range ─► free tracker storage
//! ```
//!
//! Failures never abort: they are logged, and the affected piece (tracker or
//! legacy map) stays empty.

use core::ptr::NonNull;

use log::{debug, error, trace, warn};

use crate::config::MemConfig;
use crate::e820::{E820Map, MmarDescriptor};
use crate::error::{FirmwareError, MemError};
use crate::firmware::{classify, AllocateType, BootServices, MemoryType, EFI_OUT_OF_RESOURCES};
use crate::mmap::{get_memory_map, MapRead};
use crate::tracker::{AllocatedRange, AllocationTable};

/// Boot-time memory manager over firmware `F`.
///
/// Created by [`MemoryManager::startup`], torn down by
/// [`MemoryManager::shutdown`]. Dropping it without `shutdown` leaves every
/// tracked range allocated.
pub struct MemoryManager<F: BootServices> {
    firmware: F,
    config: MemConfig,
    tracker: Option<AllocationTable<'static>>,
    map: E820Map,
}

impl<F: BootServices> MemoryManager<F> {
    // ═══════════════════════════════════════════════════════════════════════
    // LIFECYCLE
    // ═══════════════════════════════════════════════════════════════════════

    pub fn startup(firmware: F) -> Self {
        Self::startup_with(firmware, MemConfig::default())
    }

    /// Set up tracking and build the legacy map once.
    pub fn startup_with(firmware: F, config: MemConfig) -> Self {
        let config = config.normalized();
        let mut mm = Self {
            firmware,
            config,
            tracker: None,
            map: E820Map::new(),
        };

        let request = AllocateType::MaxAddress(config.any_address_ceiling);
        match mm.place(request, config.tracker_pages()) {
            Ok(base) => {
                let ptr = mm.firmware.physical_ptr(base);
                // SAFETY: freshly allocated, page aligned, owned by the
                // manager until shutdown frees it.
                let table =
                    unsafe { AllocationTable::from_raw(ptr, config.tracker_storage_size, base) };
                debug!("tracker at {:#x}, {} slots", base, table.capacity());
                mm.tracker = Some(table);
            }
            Err(err) => error!("cannot allocate memory for the allocation tracker: {}", err),
        }

        mm.refresh_legacy_map();
        mm
    }

    /// Free everything still tracked, then the tracker itself. Hands the
    /// firmware back.
    pub fn shutdown(mut self) -> F {
        let Some(mut tracker) = self.tracker.take() else {
            return self.firmware;
        };

        let mut freed = 0;
        for index in 0..tracker.capacity() {
            let Some(range) = tracker.slot(index).filter(|r| !r.is_free()) else {
                continue;
            };
            tracker.release(range.addr);
            self.firmware_free(range.addr, range.num_pages as usize);
            freed += 1;
        }

        let base = tracker.storage_base();
        drop(tracker);
        self.firmware_free(base, self.config.tracker_pages());
        debug!("shutdown: released {} tracked ranges", freed);

        self.firmware
    }

    // ═══════════════════════════════════════════════════════════════════════
    // POOL
    // ═══════════════════════════════════════════════════════════════════════

    /// Loader-data pool buffer of `size` bytes. Not tracked.
    pub fn allocate_pool(&self, size: usize) -> Option<NonNull<u8>> {
        self.try_allocate_pool(size)
            .map_err(|err| debug!("allocate_pool({:#x}): {}", size, err))
            .ok()
    }

    pub fn try_allocate_pool(&self, size: usize) -> Result<NonNull<u8>, MemError> {
        let mut buffer = core::ptr::null_mut();
        classify(self.firmware.allocate_pool(MemoryType::LoaderData, size, &mut buffer))?;
        NonNull::new(buffer).ok_or(MemError::Firmware(FirmwareError::Failed(EFI_OUT_OF_RESOURCES)))
    }

    /// Give a pool buffer back.
    ///
    /// # Safety
    /// `buffer` must come from [`MemoryManager::allocate_pool`] and must not be
    /// used afterwards.
    pub unsafe fn free_pool(&self, buffer: NonNull<u8>) {
        if let Err(err) = classify(self.firmware.free_pool(buffer.as_ptr())) {
            warn!("free_pool({:p}): {}", buffer, err);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PAGES
    // ═══════════════════════════════════════════════════════════════════════

    /// `pages` pages wherever the firmware likes.
    pub fn allocate_pages_anywhere(&mut self, pages: usize) -> Option<u64> {
        self.try_allocate_pages_anywhere(pages)
            .map_err(|err| debug!("allocate_pages_anywhere({}): {}", pages, err))
            .ok()
    }

    pub fn try_allocate_pages_anywhere(&mut self, pages: usize) -> Result<u64, MemError> {
        let base = self.place(AllocateType::AnyPages, pages)?;
        self.track(base, pages);
        Ok(base)
    }

    /// `pages` pages at `address`, or anywhere at or below the ceiling when
    /// `address` is 0. Never returns 0.
    pub fn allocate_pages_at(&mut self, address: u64, pages: usize) -> Option<u64> {
        match self.try_allocate_pages_at(address, pages) {
            Ok(base) => Some(base),
            Err(err @ MemError::AddressOutOfRange { .. }) => {
                warn!("{}", err);
                None
            }
            Err(err) => {
                debug!("allocate_pages_at({:#x}, {}): {}", address, pages, err);
                None
            }
        }
    }

    pub fn try_allocate_pages_at(&mut self, address: u64, pages: usize) -> Result<u64, MemError> {
        let ceiling = self.config.any_address_ceiling;
        if address > ceiling {
            return Err(MemError::AddressOutOfRange { address, ceiling });
        }

        let request = if address == 0 {
            AllocateType::MaxAddress(ceiling)
        } else {
            AllocateType::Address(address)
        };
        let base = self.place(request, pages)?;
        self.track(base, pages);
        Ok(base)
    }

    /// Stop tracking `address` and give `pages` pages there back to the
    /// firmware.
    ///
    /// The tracker's own storage is refused outright rather than released
    /// with its slot left alone: the manager keeps writing to it until
    /// [`MemoryManager::shutdown`], which is the only place it is freed.
    ///
    /// # Safety
    /// Nothing may use the range afterwards.
    pub unsafe fn free_pages(&mut self, address: u64, pages: usize) {
        if self.tracker.as_ref().is_some_and(|t| t.storage_base() == address) {
            warn!("refusing to free tracker storage at {:#x}", address);
            return;
        }
        self.release(address, pages);
    }

    /// Live tracked ranges.
    pub fn tracked(&self) -> impl Iterator<Item = &AllocatedRange> + '_ {
        self.tracker.iter().flat_map(|t| t.live())
    }

    /// Slot count, 0 when tracker storage could not be allocated.
    pub fn tracker_capacity(&self) -> usize {
        self.tracker.as_ref().map_or(0, |t| t.capacity())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LEGACY MAP
    // ═══════════════════════════════════════════════════════════════════════

    pub fn legacy_map(&self) -> &E820Map {
        &self.map
    }

    /// See [`E820Map::next_region`].
    pub fn next_region(&self, desc: &mut MmarDescriptor, cont: i32) -> i32 {
        self.map.next_region(desc, cont)
    }

    /// Re-read the firmware memory map and rebuild the legacy map. On any
    /// failure the legacy map is left empty.
    pub fn refresh_legacy_map(&mut self) {
        self.map.clear();

        let pages = self.config.map_buffer_pages();
        let size = self.config.map_buffer_size;
        let base = match self.try_allocate_pages_at(0, pages) {
            Ok(base) => base,
            Err(err) => {
                error!("cannot allocate memory for the memory map: {}", err);
                return;
            }
        };

        // SAFETY: `size` bytes at `base` were just allocated and nothing else
        // refers to them until they are released below.
        let buffer =
            unsafe { core::slice::from_raw_parts_mut(self.firmware.physical_ptr(base), size) };

        let mut map_key = 0usize;
        let mut version = 0u32;
        match get_memory_map(&self.firmware, buffer, Some(&mut map_key), Some(&mut version)) {
            MapRead::Complete(layout) => match layout.descriptors(buffer) {
                Ok(descriptors) => {
                    debug!(
                        "memory map: {} descriptors, stride {}, version {}, key {:#x}",
                        layout.descriptor_count(),
                        layout.descriptor_size,
                        version,
                        map_key
                    );
                    let dropped = self.map.translate(descriptors);
                    if dropped > 0 {
                        warn!("{} memory regions left out of the legacy map", dropped);
                    }
                }
                Err(err) => error!("cannot get memory map: {}", err),
            },
            MapRead::Insufficient { required } => error!(
                "cannot get memory map: needs {:#x} bytes, buffer holds {:#x}",
                required, size
            ),
            MapRead::Error(err) => error!("cannot get memory map: {}", err),
        }

        self.release(base, pages);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ACCESSORS
    // ═══════════════════════════════════════════════════════════════════════

    pub fn config(&self) -> &MemConfig {
        &self.config
    }

    pub fn firmware(&self) -> &F {
        &self.firmware
    }

    // ─────────────────────────────────────────────────────────────────────
    // internals
    // ─────────────────────────────────────────────────────────────────────

    fn firmware_allocate(&self, request: AllocateType, pages: usize) -> Result<u64, MemError> {
        let mut base = 0;
        classify(
            self.firmware
                .allocate_pages(request, MemoryType::LoaderData, pages, &mut base),
        )?;
        Ok(base)
    }

    fn firmware_free(&self, address: u64, pages: usize) {
        if let Err(err) = classify(self.firmware.free_pages(address, pages)) {
            warn!("free_pages({:#x}, {}): {}", address, pages, err);
        }
    }

    /// Allocate without tracking. Address 0 is the tracker's free-slot
    /// marker, so a block at 0 is held while a second one is taken, then
    /// released. A second answer of 0 is given back too and fails the call.
    fn place(&self, request: AllocateType, pages: usize) -> Result<u64, MemError> {
        let base = self.firmware_allocate(request, pages)?;
        if base != 0 {
            trace!("allocated {} pages at {:#x} ({:?})", pages, base, request);
            return Ok(base);
        }

        debug!("firmware returned page 0, allocating again");
        let retry = self.firmware_allocate(request, pages);
        self.firmware_free(0, pages);
        let base = retry?;
        if base == 0 {
            self.firmware_free(0, pages);
            return Err(MemError::Firmware(FirmwareError::Failed(EFI_OUT_OF_RESOURCES)));
        }
        trace!("allocated {} pages at {:#x} ({:?})", pages, base, request);
        Ok(base)
    }

    fn track(&mut self, base: u64, pages: usize) {
        let Some(tracker) = self.tracker.as_mut() else {
            return;
        };
        if let Err(err) = tracker.record(base, pages as u64) {
            warn!("{}: {:#x} ({} pages) is not tracked", err, base, pages);
        }
    }

    fn release(&mut self, address: u64, pages: usize) {
        if let Some(tracker) = self.tracker.as_mut() {
            if tracker.storage_base() != address {
                tracker.release(address);
            }
        }
        self.firmware_free(address, pages);
    }
}
