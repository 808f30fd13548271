//! Memory manager constants and runtime knobs.
//!
//! The constants are part of the handoff contract with later boot stages and
//! must stay bit-exact. `MemConfig` lets a caller shrink or move things for
//! bring-up experiments without touching the defaults.

// ═══════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════

/// Page size (4KB, same as UEFI)
pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// Size of the buffer the firmware memory map is read into. Must be a
/// multiple of the page size.
pub const MEMORY_MAP_SIZE: usize = 0x2000;

/// Bytes reserved for the allocation tracker's slot table.
pub const ALLOCATED_PAGES_SIZE: usize = 0x1000;

/// Highest address handed out by "any address" page requests. Later boot
/// stages run with 32-bit pointers.
pub const ANY_ADDRESS_CEILING: u64 = 0x7fff_ffff;

/// Maximum number of entries in the legacy (E820) map.
pub const E820_MAX: usize = 128;

/// Legacy video memory / option ROM window, never reported as RAM.
pub const VIDEO_HOLE_START: u64 = 0xA_0000;
pub const VIDEO_HOLE_END: u64 = 0x10_0000;

/// Convert bytes to pages (rounded up).
#[inline]
pub const fn bytes_to_pages(bytes: usize) -> usize {
    (bytes + PAGE_SIZE as usize - 1) >> PAGE_SHIFT
}

/// Convert pages to bytes, `None` on overflow.
#[inline]
pub const fn pages_to_bytes(pages: u64) -> Option<u64> {
    pages.checked_mul(PAGE_SIZE)
}

// ═══════════════════════════════════════════════════════════════════════════
// RUNTIME CONFIG
// ═══════════════════════════════════════════════════════════════════════════

/// Tunables for a [`MemoryManager`](crate::MemoryManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemConfig {
    /// Upper bound for `allocate_pages_at(0, _)`; explicit addresses above it
    /// are rejected.
    pub any_address_ceiling: u64,
    /// Bytes of scratch used to read the firmware memory map.
    pub map_buffer_size: usize,
    /// Bytes backing the allocation tracker.
    pub tracker_storage_size: usize,
}

impl MemConfig {
    pub const fn new() -> Self {
        Self {
            any_address_ceiling: ANY_ADDRESS_CEILING,
            map_buffer_size: MEMORY_MAP_SIZE,
            tracker_storage_size: ALLOCATED_PAGES_SIZE,
        }
    }

    /// Page count of the memory map scratch buffer.
    pub const fn map_buffer_pages(&self) -> usize {
        bytes_to_pages(self.map_buffer_size)
    }

    /// Page count of the tracker storage.
    pub const fn tracker_pages(&self) -> usize {
        bytes_to_pages(self.tracker_storage_size)
    }

    /// Sizes rounded up to whole pages (at least one), ceiling raised to at
    /// least one page.
    pub const fn normalized(self) -> Self {
        let ceiling = if self.any_address_ceiling < PAGE_SIZE {
            PAGE_SIZE
        } else {
            self.any_address_ceiling
        };
        Self {
            any_address_ceiling: ceiling,
            map_buffer_size: whole_pages(self.map_buffer_size),
            tracker_storage_size: whole_pages(self.tracker_storage_size),
        }
    }
}

const fn whole_pages(bytes: usize) -> usize {
    let pages = bytes_to_pages(bytes);
    let pages = if pages == 0 { 1 } else { pages };
    pages << PAGE_SHIFT
}

impl Default for MemConfig {
    fn default() -> Self {
        Self::new()
    }
}
