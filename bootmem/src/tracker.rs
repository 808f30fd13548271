//! Allocation tracker.
//!
//! Remembers every page range handed out through the gateway so shutdown can
//! give all of it back. Slots live in one page of firmware memory that is not
//! itself tracked.

use core::mem::size_of;

use crate::config::ALLOCATED_PAGES_SIZE;
use crate::error::MemError;

/// Slot count with the default storage size.
pub const MAX_ALLOCATED_PAGES: usize = ALLOCATED_PAGES_SIZE / size_of::<AllocatedRange>();

/// One outstanding page allocation. `addr == 0` marks an unused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct AllocatedRange {
    pub addr: u64,
    pub num_pages: u64,
}

impl AllocatedRange {
    pub const EMPTY: Self = Self {
        addr: 0,
        num_pages: 0,
    };

    pub const fn new(addr: u64, num_pages: u64) -> Self {
        Self { addr, num_pages }
    }

    pub const fn is_free(&self) -> bool {
        self.addr == 0
    }
}

/// Fixed-capacity slot table over borrowed storage.
pub struct AllocationTable<'a> {
    slots: &'a mut [AllocatedRange],
    storage_base: u64,
}

impl<'a> AllocationTable<'a> {
    /// Build a table over `slots`, clearing all of them. `storage_base` is the
    /// physical address of the storage, which is never tracked.
    pub fn new(slots: &'a mut [AllocatedRange], storage_base: u64) -> Self {
        slots.fill(AllocatedRange::EMPTY);
        Self {
            slots,
            storage_base,
        }
    }

    /// Build a table over raw storage, zero-filling `bytes` bytes first.
    ///
    /// # Safety
    /// `ptr` must be valid for writes of `bytes` bytes, aligned for
    /// `AllocatedRange`, and exclusively owned by the table for `'a`.
    pub unsafe fn from_raw(ptr: *mut u8, bytes: usize, storage_base: u64) -> Self {
        core::ptr::write_bytes(ptr, 0, bytes);
        let slots = core::slice::from_raw_parts_mut(
            ptr.cast::<AllocatedRange>(),
            bytes / size_of::<AllocatedRange>(),
        );
        Self {
            slots,
            storage_base,
        }
    }

    /// Physical address of the slot storage.
    pub fn storage_base(&self) -> u64 {
        self.storage_base
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Remember `addr`. A live slot for the same address is updated in place,
    /// otherwise the first unused slot is taken.
    pub fn record(&mut self, addr: u64, num_pages: u64) -> Result<(), MemError> {
        debug_assert_ne!(addr, 0, "address 0 is the unused-slot marker");

        if let Some(slot) = self.slots.iter_mut().find(|s| !s.is_free() && s.addr == addr) {
            slot.num_pages = num_pages;
            return Ok(());
        }

        let capacity = self.slots.len();
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.is_free())
            .ok_or(MemError::TrackerExhausted { capacity })?;
        *slot = AllocatedRange::new(addr, num_pages);
        Ok(())
    }

    /// Forget `addr`, returning what was recorded for it.
    pub fn release(&mut self, addr: u64) -> Option<AllocatedRange> {
        if addr == 0 {
            return None;
        }
        let slot = self.slots.iter_mut().find(|s| s.addr == addr)?;
        let range = *slot;
        *slot = AllocatedRange::EMPTY;
        Some(range)
    }

    pub fn find(&self, addr: u64) -> Option<&AllocatedRange> {
        if addr == 0 {
            return None;
        }
        self.slots.iter().find(|s| s.addr == addr)
    }

    /// Slot at `index`, used or not.
    pub fn slot(&self, index: usize) -> Option<AllocatedRange> {
        self.slots.get(index).copied()
    }

    pub fn live(&self) -> impl Iterator<Item = &AllocatedRange> + '_ {
        self.slots.iter().filter(|s| !s.is_free())
    }

    pub fn live_count(&self) -> usize {
        self.live().count()
    }
}
