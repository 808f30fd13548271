//! Legacy (E820) memory map.
//!
//! Firmware descriptors are folded into at most [`E820_MAX`] typed regions:
//! adjacent regions of the same type merge, usable RAM is cut around the
//! video/ROM hole, and types with no legacy meaning are dropped. The result
//! is served one entry at a time through the continuation protocol of the
//! BIOS `INT 15h, AX=E820h` call.
//!
//! Descriptors are taken in firmware order. Firmware returns them sorted by
//! address in practice, and merging only looks at the previous entry, so an
//! unsorted map yields more entries than necessary. That is left visible
//! rather than sorted away.

use log::{debug, info, warn};

use crate::config::{E820_MAX, VIDEO_HOLE_END, VIDEO_HOLE_START};
use crate::error::MemError;
use crate::firmware::MemoryType;
use crate::mmap::FirmwareMemoryDescriptor;

// ═══════════════════════════════════════════════════════════════════════════
// E820 TYPES
// ═══════════════════════════════════════════════════════════════════════════

/// E820 region type, numbered as the BIOS call reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum E820Type {
    Ram = 1,
    Reserved = 2,
    Acpi = 3,
    Nvs = 4,
}

impl E820Type {
    /// Legacy type for a firmware memory type, `None` for types the legacy
    /// map does not describe.
    pub const fn from_memory_type(ty: MemoryType) -> Option<Self> {
        match ty {
            MemoryType::AcpiReclaim => Some(E820Type::Acpi),
            MemoryType::RuntimeServicesCode
            | MemoryType::RuntimeServicesData
            | MemoryType::Reserved
            | MemoryType::Mmio
            | MemoryType::MmioPortSpace
            | MemoryType::Unusable
            | MemoryType::PalCode => Some(E820Type::Reserved),
            MemoryType::LoaderCode
            | MemoryType::LoaderData
            | MemoryType::BootServicesCode
            | MemoryType::BootServicesData
            | MemoryType::Conventional => Some(E820Type::Ram),
            MemoryType::AcpiNvs => Some(E820Type::Nvs),
            MemoryType::Persistent | MemoryType::Unaccepted => None,
        }
    }
}

/// One region of the legacy map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct E820Entry {
    pub addr: u64,
    pub size: u64,
    pub entry_type: E820Type,
}

impl E820Entry {
    const EMPTY: Self = Self {
        addr: 0,
        size: 0,
        entry_type: E820Type::Reserved,
    };

    pub const fn new(addr: u64, size: u64, entry_type: E820Type) -> Self {
        Self {
            addr,
            size,
            entry_type,
        }
    }

    /// Exclusive end address.
    pub const fn end(&self) -> u64 {
        self.addr.wrapping_add(self.size)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// BIOS DESCRIPTOR (continuation protocol)
// ═══════════════════════════════════════════════════════════════════════════

/// Payload length reported in `desc_len` for a filled descriptor.
pub const MMAR_DESC_LENGTH: u32 = 20;

/// Descriptor filled by [`E820Map::next_region`]: a length word followed by
/// the 20-byte BIOS payload (base, length, type).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct MmarDescriptor {
    desc_len: u32,
    addr: u64,
    length: u64,
    ty: u32,
}

impl MmarDescriptor {
    pub const EMPTY: Self = Self {
        desc_len: 0,
        addr: 0,
        length: 0,
        ty: 0,
    };

    /// 0 when no entry was produced.
    pub const fn desc_len(&self) -> u32 {
        self.desc_len
    }

    pub const fn addr(&self) -> u64 {
        self.addr
    }

    pub const fn length(&self) -> u64 {
        self.length
    }

    pub const fn entry_type(&self) -> u32 {
        self.ty
    }

    /// The 20 bytes a BIOS caller receives.
    pub fn payload_bytes(&self) -> [u8; MMAR_DESC_LENGTH as usize] {
        let mut out = [0u8; MMAR_DESC_LENGTH as usize];
        out[0..8].copy_from_slice(&{ self.addr }.to_ne_bytes());
        out[8..16].copy_from_slice(&{ self.length }.to_ne_bytes());
        out[16..20].copy_from_slice(&{ self.ty }.to_ne_bytes());
        out
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// E820 MAP
// ═══════════════════════════════════════════════════════════════════════════

/// Fixed-capacity legacy map, in the order regions were added.
#[derive(Clone)]
pub struct E820Map {
    entries: [E820Entry; E820_MAX],
    count: usize,
}

impl E820Map {
    pub const fn new() -> Self {
        Self {
            entries: [E820Entry::EMPTY; E820_MAX],
            count: 0,
        }
    }

    pub fn entries(&self) -> &[E820Entry] {
        &self.entries[..self.count]
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn clear(&mut self) {
        self.count = 0;
    }

    /// Bytes covered by regions of `ty`.
    pub fn total_bytes(&self, ty: E820Type) -> u64 {
        self.entries()
            .iter()
            .filter(|e| e.entry_type == ty)
            .fold(0u64, |acc, e| acc.saturating_add(e.size))
    }

    /// Append a region, growing the last entry instead when it has the same
    /// type and ends exactly at `addr`. Zero-length regions are ignored. A
    /// full table refuses every region, mergeable or not.
    pub fn add_region(&mut self, addr: u64, size: u64, ty: E820Type) -> Result<(), MemError> {
        if size == 0 {
            return Ok(());
        }

        if self.count == E820_MAX {
            return Err(MemError::RegionTableExhausted { capacity: E820_MAX });
        }

        if let Some(last) = self.entries[..self.count].last_mut() {
            if last.entry_type == ty && last.addr.checked_add(last.size) == Some(addr) {
                last.size += size;
                return Ok(());
            }
        }

        self.entries[self.count] = E820Entry::new(addr, size, ty);
        self.count += 1;
        Ok(())
    }

    /// Rebuild the map from firmware descriptors. Returns how many regions
    /// were dropped because the map was full or the descriptor was malformed.
    pub fn translate<I>(&mut self, descriptors: I) -> usize
    where
        I: IntoIterator<Item = FirmwareMemoryDescriptor>,
    {
        self.clear();
        let mut dropped = 0;

        for desc in descriptors {
            let Some(ty) = desc.memory_type().and_then(E820Type::from_memory_type) else {
                debug!("skipping descriptor type {:#x} at {:#x}", desc.ty, desc.physical_start);
                continue;
            };

            let start = desc.physical_start;
            let Some((size, end)) = desc
                .size()
                .and_then(|size| start.checked_add(size).map(|end| (size, end)))
            else {
                warn!(
                    "descriptor at {:#x} with {:#x} pages overflows, dropped",
                    start, desc.number_of_pages
                );
                dropped += 1;
                continue;
            };

            let result = if ty == E820Type::Ram {
                self.add_ram(start, size, end)
            } else {
                self.add_region(start, size, ty)
            };

            if let Err(err) = result {
                warn!("{}: region {:#x}+{:#x} dropped", err, start, size);
                dropped += 1;
            }
        }

        info!(
            "legacy map: {} entries, {:#x} bytes RAM",
            self.count,
            self.total_bytes(E820Type::Ram)
        );
        for e in self.entries() {
            debug!("  {:#012x}-{:#012x} {:?}", e.addr, e.end(), e.entry_type);
        }

        dropped
    }

    /// RAM, minus whatever falls in the video/ROM hole.
    fn add_ram(&mut self, mut start: u64, mut size: u64, end: u64) -> Result<(), MemError> {
        if start < VIDEO_HOLE_END && end > VIDEO_HOLE_START {
            if start < VIDEO_HOLE_START {
                self.add_region(start, VIDEO_HOLE_START - start, E820Type::Ram)?;
            }
            if end <= VIDEO_HOLE_END {
                return Ok(());
            }
            start = VIDEO_HOLE_END;
            size = end - start;
        }
        self.add_region(start, size, E820Type::Ram)
    }

    // ─────────────────────────────────────────────────────────────────────
    // CONTINUATION PROTOCOL
    // ─────────────────────────────────────────────────────────────────────

    /// Copy entry `cont` into `desc` and return the continuation for the next
    /// call, 0 after the last entry.
    ///
    /// An out-of-range `cont` (including any `cont` on an empty map) leaves a
    /// zero-length descriptor and returns 0. Callers start at 0 and stop when
    /// 0 comes back; a zero `desc_len` on the first call means there is no map.
    pub fn next_region(&self, desc: &mut MmarDescriptor, cont: i32) -> i32 {
        let index = match usize::try_from(cont) {
            Ok(index) if index < self.count => index,
            _ => {
                *desc = MmarDescriptor::EMPTY;
                return 0;
            }
        };

        let entry = &self.entries[index];
        *desc = MmarDescriptor {
            desc_len: MMAR_DESC_LENGTH,
            addr: entry.addr,
            length: entry.size,
            ty: entry.entry_type as u32,
        };

        let next = index + 1;
        if next < self.count {
            i32::try_from(next).unwrap_or(0)
        } else {
            0
        }
    }

    /// Iterate through [`E820Map::next_region`] the way a BIOS caller would.
    pub fn walk(&self) -> E820Walker<'_> {
        E820Walker {
            map: self,
            cont: 0,
            done: false,
        }
    }
}

impl Default for E820Map {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller-side loop over the continuation protocol.
pub struct E820Walker<'a> {
    map: &'a E820Map,
    cont: i32,
    done: bool,
}

impl Iterator for E820Walker<'_> {
    type Item = MmarDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut desc = MmarDescriptor::EMPTY;
        let next = self.map.next_region(&mut desc, self.cont);
        if desc.desc_len() == 0 {
            self.done = true;
            return None;
        }

        if next == 0 {
            self.done = true;
        }
        self.cont = next;
        Some(desc)
    }
}
