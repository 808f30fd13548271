//! Firmware memory map reader.
//!
//! Reads `GetMemoryMap` into a caller buffer and walks the descriptors it
//! returns. Descriptors are `descriptor_size` bytes apart, which newer
//! firmware makes larger than the structure below; always step by the
//! reported size.

use core::mem::size_of;

use crate::config::pages_to_bytes;
use crate::error::{FirmwareError, MemError};
use crate::firmware::{classify, BootServices, MemoryType};

/// Bytes of a version-1 `EFI_MEMORY_DESCRIPTOR`.
pub const EFI_MEMORY_DESCRIPTOR_SIZE: usize = 40;

/// `EFI_MEMORY_DESCRIPTOR` (v1):
///
/// ```text
/// offset 0:  u32 Type
/// offset 4:  u32 Padding
/// offset 8:  u64 PhysicalStart
/// offset 16: u64 VirtualStart
/// offset 24: u64 NumberOfPages
/// offset 32: u64 Attribute
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct FirmwareMemoryDescriptor {
    pub ty: u32,
    _pad: u32,
    pub physical_start: u64,
    pub virtual_start: u64,
    pub number_of_pages: u64,
    pub attribute: u64,
}

const _: () = assert!(size_of::<FirmwareMemoryDescriptor>() == EFI_MEMORY_DESCRIPTOR_SIZE);

impl FirmwareMemoryDescriptor {
    pub const fn new(ty: MemoryType, physical_start: u64, number_of_pages: u64) -> Self {
        Self::with_raw_type(ty.raw(), physical_start, number_of_pages)
    }

    /// Descriptor with a type value that may not be a known [`MemoryType`].
    pub const fn with_raw_type(ty: u32, physical_start: u64, number_of_pages: u64) -> Self {
        Self {
            ty,
            _pad: 0,
            physical_start,
            virtual_start: 0,
            number_of_pages,
            attribute: 0,
        }
    }

    pub const fn memory_type(&self) -> Option<MemoryType> {
        MemoryType::from_raw(self.ty)
    }

    /// Size in bytes, `None` if the page count overflows.
    pub const fn size(&self) -> Option<u64> {
        pages_to_bytes(self.number_of_pages)
    }

    /// Decode the first [`EFI_MEMORY_DESCRIPTOR_SIZE`] bytes of `bytes`.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..EFI_MEMORY_DESCRIPTOR_SIZE)?;
        let u64_at = |off: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[off..off + 8]);
            u64::from_ne_bytes(raw)
        };
        let mut ty = [0u8; 4];
        ty.copy_from_slice(&bytes[0..4]);

        Some(Self {
            ty: u32::from_ne_bytes(ty),
            _pad: 0,
            physical_start: u64_at(8),
            virtual_start: u64_at(16),
            number_of_pages: u64_at(24),
            attribute: u64_at(32),
        })
    }

    /// Encode into the first [`EFI_MEMORY_DESCRIPTOR_SIZE`] bytes of `out`.
    /// Returns `false` if `out` is too short.
    pub fn write_to(&self, out: &mut [u8]) -> bool {
        let Some(out) = out.get_mut(..EFI_MEMORY_DESCRIPTOR_SIZE) else {
            return false;
        };
        out[0..4].copy_from_slice(&self.ty.to_ne_bytes());
        out[4..8].copy_from_slice(&self._pad.to_ne_bytes());
        out[8..16].copy_from_slice(&self.physical_start.to_ne_bytes());
        out[16..24].copy_from_slice(&self.virtual_start.to_ne_bytes());
        out[24..32].copy_from_slice(&self.number_of_pages.to_ne_bytes());
        out[32..40].copy_from_slice(&self.attribute.to_ne_bytes());
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DESCRIPTOR WALK
// ═══════════════════════════════════════════════════════════════════════════

/// Descriptors of a map buffer, in firmware order.
pub struct DescriptorIter<'a> {
    remaining: &'a [u8],
    descriptor_size: usize,
}

impl<'a> DescriptorIter<'a> {
    /// Walk `map` (exactly the bytes the firmware filled) with the reported
    /// stride.
    pub fn new(map: &'a [u8], descriptor_size: usize) -> Result<Self, MemError> {
        if descriptor_size < EFI_MEMORY_DESCRIPTOR_SIZE {
            return Err(MemError::InvalidDescriptorSize(descriptor_size));
        }
        Ok(Self {
            remaining: map,
            descriptor_size,
        })
    }
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = FirmwareMemoryDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        let desc = FirmwareMemoryDescriptor::parse(self.remaining)?;
        let step = self.descriptor_size.min(self.remaining.len());
        self.remaining = &self.remaining[step..];
        Some(desc)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// READER
// ═══════════════════════════════════════════════════════════════════════════

/// Shape of a successfully read map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapLayout {
    /// Bytes of the buffer holding descriptors.
    pub map_size: usize,
    /// Distance between descriptors.
    pub descriptor_size: usize,
}

impl MapLayout {
    pub fn descriptors<'a>(&self, buffer: &'a [u8]) -> Result<DescriptorIter<'a>, MemError> {
        let used = self.map_size.min(buffer.len());
        DescriptorIter::new(&buffer[..used], self.descriptor_size)
    }

    pub fn descriptor_count(&self) -> usize {
        self.map_size.checked_div(self.descriptor_size).unwrap_or(0)
    }
}

/// Outcome of [`get_memory_map`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapRead {
    /// The whole map is in the buffer.
    Complete(MapLayout),
    /// The buffer is too small; firmware asked for `required` bytes.
    Insufficient { required: usize },
    /// Unrecoverable firmware error.
    Error(FirmwareError),
}

impl MapRead {
    pub fn layout(self) -> Option<MapLayout> {
        match self {
            MapRead::Complete(layout) => Some(layout),
            _ => None,
        }
    }
}

/// Ask the firmware for its memory map.
///
/// `map_key` and `descriptor_version` may be omitted; scratch values are
/// handed to the firmware instead.
pub fn get_memory_map<F: BootServices + ?Sized>(
    firmware: &F,
    buffer: &mut [u8],
    map_key: Option<&mut usize>,
    descriptor_version: Option<&mut u32>,
) -> MapRead {
    let mut key = 0usize;
    let mut version = 0u32;
    let map_key = map_key.unwrap_or(&mut key);
    let descriptor_version = descriptor_version.unwrap_or(&mut version);

    let mut map_size = buffer.len();
    let mut descriptor_size = 0usize;
    let status = firmware.get_memory_map(
        buffer,
        &mut map_size,
        map_key,
        &mut descriptor_size,
        descriptor_version,
    );

    match classify(status) {
        Ok(()) => MapRead::Complete(MapLayout {
            map_size: map_size.min(buffer.len()),
            descriptor_size,
        }),
        Err(FirmwareError::BufferTooSmall) => MapRead::Insufficient { required: map_size },
        Err(err) => MapRead::Error(err),
    }
}
