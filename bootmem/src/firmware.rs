//! Firmware boot services boundary.
//!
//! [`BootServices`] is the only way this crate talks to firmware. Every call
//! returns a raw UEFI status and every status goes through [`classify`];
//! nothing above this module branches on status values.
//!
//! [`RawBootServices`] is the real thing: the memory-services prefix of the
//! UEFI `EFI_BOOT_SERVICES` table, called through its function pointers.

use crate::error::FirmwareError;

// ═══════════════════════════════════════════════════════════════════════════
// STATUS CODES
// ═══════════════════════════════════════════════════════════════════════════

/// Raw `EFI_STATUS`.
pub type Status = usize;

pub const EFI_SUCCESS: Status = 0;
const EFI_ERROR_BIT: Status = 1usize << (usize::BITS - 1);
pub const EFI_INVALID_PARAMETER: Status = EFI_ERROR_BIT | 2;
pub const EFI_BUFFER_TOO_SMALL: Status = EFI_ERROR_BIT | 5;
pub const EFI_OUT_OF_RESOURCES: Status = EFI_ERROR_BIT | 9;
pub const EFI_NOT_FOUND: Status = EFI_ERROR_BIT | 14;

/// Collapse a status into success / retryable / fatal.
///
/// `Ok(())` is success, [`FirmwareError::BufferTooSmall`] is the retryable
/// case and [`FirmwareError::Failed`] carries everything else.
#[inline]
pub const fn classify(status: Status) -> Result<(), FirmwareError> {
    match status {
        EFI_SUCCESS => Ok(()),
        EFI_BUFFER_TOO_SMALL => Err(FirmwareError::BufferTooSmall),
        other => Err(FirmwareError::Failed(other)),
    }
}

impl FirmwareError {
    /// Would the same call succeed with a bigger buffer?
    pub const fn is_retryable(&self) -> bool {
        matches!(self, FirmwareError::BufferTooSmall)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// MEMORY TYPES (EFI_MEMORY_TYPE)
// ═══════════════════════════════════════════════════════════════════════════

/// Firmware memory type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MemoryType {
    Reserved = 0,
    LoaderCode = 1,
    LoaderData = 2,
    BootServicesCode = 3,
    BootServicesData = 4,
    RuntimeServicesCode = 5,
    RuntimeServicesData = 6,
    Conventional = 7,
    Unusable = 8,
    AcpiReclaim = 9,
    AcpiNvs = 10,
    Mmio = 11,
    MmioPortSpace = 12,
    PalCode = 13,
    Persistent = 14,
    Unaccepted = 15,
}

impl MemoryType {
    /// Decode a raw descriptor type. Unknown and OEM/OS-defined values give
    /// `None`.
    pub const fn from_raw(value: u32) -> Option<Self> {
        Some(match value {
            0 => MemoryType::Reserved,
            1 => MemoryType::LoaderCode,
            2 => MemoryType::LoaderData,
            3 => MemoryType::BootServicesCode,
            4 => MemoryType::BootServicesData,
            5 => MemoryType::RuntimeServicesCode,
            6 => MemoryType::RuntimeServicesData,
            7 => MemoryType::Conventional,
            8 => MemoryType::Unusable,
            9 => MemoryType::AcpiReclaim,
            10 => MemoryType::AcpiNvs,
            11 => MemoryType::Mmio,
            12 => MemoryType::MmioPortSpace,
            13 => MemoryType::PalCode,
            14 => MemoryType::Persistent,
            15 => MemoryType::Unaccepted,
            _ => return None,
        })
    }

    pub const fn raw(self) -> u32 {
        self as u32
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ALLOCATION TYPE (EFI_ALLOCATE_TYPE)
// ═══════════════════════════════════════════════════════════════════════════

/// How the firmware should choose the address of a page allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocateType {
    /// Anywhere.
    AnyPages,
    /// Anywhere with the whole range at or below this address.
    MaxAddress(u64),
    /// Exactly this address.
    Address(u64),
}

impl AllocateType {
    /// Raw `EFI_ALLOCATE_TYPE` and the initial value of the in/out address.
    pub const fn raw(self) -> (usize, u64) {
        match self {
            AllocateType::AnyPages => (0, 0),
            AllocateType::MaxAddress(max) => (1, max),
            AllocateType::Address(addr) => (2, addr),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SERVICES TRAIT
// ═══════════════════════════════════════════════════════════════════════════

/// The firmware memory services this crate consumes.
///
/// Calls are blocking and never reentered; implementations need no
/// synchronisation.
pub trait BootServices {
    /// `AllocatePool`. On success `buffer` holds the allocation.
    fn allocate_pool(&self, pool_type: MemoryType, size: usize, buffer: &mut *mut u8) -> Status;

    /// `FreePool`.
    ///
    /// # Safety
    /// `buffer` must come from [`BootServices::allocate_pool`] and must not be
    /// used afterwards.
    unsafe fn free_pool(&self, buffer: *mut u8) -> Status;

    /// `AllocatePages`. On success `memory` holds the base address.
    fn allocate_pages(
        &self,
        request: AllocateType,
        memory_type: MemoryType,
        pages: usize,
        memory: &mut u64,
    ) -> Status;

    /// `FreePages`.
    fn free_pages(&self, memory: u64, pages: usize) -> Status;

    /// `GetMemoryMap` into `buffer`. `map_size` receives the bytes written, or
    /// the bytes required when the buffer is too small.
    fn get_memory_map(
        &self,
        buffer: &mut [u8],
        map_size: &mut usize,
        map_key: &mut usize,
        descriptor_size: &mut usize,
        descriptor_version: &mut u32,
    ) -> Status;

    /// Pointer through which the loader reaches physical `address`.
    ///
    /// Boot services run identity mapped, so the default is the address.
    fn physical_ptr(&self, address: u64) -> *mut u8 {
        address as usize as *mut u8
    }
}

impl<T: BootServices + ?Sized> BootServices for &T {
    fn allocate_pool(&self, pool_type: MemoryType, size: usize, buffer: &mut *mut u8) -> Status {
        (**self).allocate_pool(pool_type, size, buffer)
    }

    unsafe fn free_pool(&self, buffer: *mut u8) -> Status {
        (**self).free_pool(buffer)
    }

    fn allocate_pages(
        &self,
        request: AllocateType,
        memory_type: MemoryType,
        pages: usize,
        memory: &mut u64,
    ) -> Status {
        (**self).allocate_pages(request, memory_type, pages, memory)
    }

    fn free_pages(&self, memory: u64, pages: usize) -> Status {
        (**self).free_pages(memory, pages)
    }

    fn get_memory_map(
        &self,
        buffer: &mut [u8],
        map_size: &mut usize,
        map_key: &mut usize,
        descriptor_size: &mut usize,
        descriptor_version: &mut u32,
    ) -> Status {
        (**self).get_memory_map(buffer, map_size, map_key, descriptor_size, descriptor_version)
    }

    fn physical_ptr(&self, address: u64) -> *mut u8 {
        (**self).physical_ptr(address)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RAW UEFI TABLE
// ═══════════════════════════════════════════════════════════════════════════

/// Leading part of `EFI_BOOT_SERVICES`, up to the pool services.
///
/// Only ever used behind a reference handed over by firmware; the rest of
/// the table follows in memory and is not described here.
#[repr(C)]
pub struct RawBootServices {
    _header: [u8; 24],
    // Task Priority Services
    _raise_tpl: usize,
    _restore_tpl: usize,
    // Memory Services (table order)
    pub allocate_pages: extern "efiapi" fn(
        allocate_type: usize,
        memory_type: usize,
        pages: usize,
        memory: *mut u64,
    ) -> usize,
    pub free_pages: extern "efiapi" fn(memory: u64, pages: usize) -> usize,
    pub get_memory_map: extern "efiapi" fn(
        memory_map_size: *mut usize,
        memory_map: *mut u8,
        map_key: *mut usize,
        descriptor_size: *mut usize,
        descriptor_version: *mut u32,
    ) -> usize,
    pub allocate_pool:
        extern "efiapi" fn(pool_type: usize, size: usize, buffer: *mut *mut u8) -> usize,
    pub free_pool: extern "efiapi" fn(buffer: *mut u8) -> usize,
}

impl BootServices for RawBootServices {
    fn allocate_pool(&self, pool_type: MemoryType, size: usize, buffer: &mut *mut u8) -> Status {
        (self.allocate_pool)(pool_type.raw() as usize, size, buffer)
    }

    unsafe fn free_pool(&self, buffer: *mut u8) -> Status {
        (self.free_pool)(buffer)
    }

    fn allocate_pages(
        &self,
        request: AllocateType,
        memory_type: MemoryType,
        pages: usize,
        memory: &mut u64,
    ) -> Status {
        let (allocate_type, address) = request.raw();
        *memory = address;
        (self.allocate_pages)(allocate_type, memory_type.raw() as usize, pages, memory)
    }

    fn free_pages(&self, memory: u64, pages: usize) -> Status {
        (self.free_pages)(memory, pages)
    }

    fn get_memory_map(
        &self,
        buffer: &mut [u8],
        map_size: &mut usize,
        map_key: &mut usize,
        descriptor_size: &mut usize,
        descriptor_version: &mut u32,
    ) -> Status {
        *map_size = buffer.len();
        (self.get_memory_map)(
            map_size,
            buffer.as_mut_ptr(),
            map_key,
            descriptor_size,
            descriptor_version,
        )
    }
}
