//! In-memory firmware for host tests.
//!
//! Physical addresses `[0, ARENA_PAGES * PAGE_SIZE)` are backed by one
//! page-aligned host allocation, so code that writes through
//! [`BootServices::physical_ptr`] works unchanged. The arena is leaked: a
//! manager's tracker table points into it and may outlive the mock. Page 0
//! is never chosen unless a test asks for it.

use core::cell::{Cell, RefCell};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::vec::Vec;

use crate::config::PAGE_SIZE;
use crate::firmware::{
    AllocateType, BootServices, MemoryType, Status, EFI_BUFFER_TOO_SMALL, EFI_INVALID_PARAMETER,
    EFI_NOT_FOUND, EFI_OUT_OF_RESOURCES, EFI_SUCCESS,
};
use crate::mmap::FirmwareMemoryDescriptor;

/// Pages of backing memory.
pub const ARENA_PAGES: usize = 512;

const ARENA_BYTES: usize = ARENA_PAGES * PAGE_SIZE as usize;

/// A firmware call as the mock saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    AllocatePages { request: AllocateType, pages: usize },
    FreePages { memory: u64, pages: usize },
    AllocatePool { size: usize },
    FreePool,
    GetMemoryMap,
}

pub struct MockFirmware {
    arena: *mut u8,
    used: RefCell<Vec<bool>>,
    live: RefCell<Vec<(u64, usize)>>,
    pools: RefCell<Vec<(*mut u8, Layout)>>,
    calls: RefCell<Vec<Call>>,
    page_allocations: Cell<usize>,
    fail_allocation: Cell<Option<usize>>,
    zero_next: Cell<bool>,
    map: RefCell<(Vec<FirmwareMemoryDescriptor>, usize)>,
    map_status: Cell<Status>,
    map_key: Cell<usize>,
}

fn arena_layout() -> Layout {
    // Both values are non-zero and the alignment is a power of two.
    match Layout::from_size_align(ARENA_BYTES, PAGE_SIZE as usize) {
        Ok(layout) => layout,
        Err(_) => unreachable!(),
    }
}

impl MockFirmware {
    /// Empty arena and a small PC-like memory map (48-byte stride).
    pub fn new() -> Self {
        let arena = unsafe { alloc_zeroed(arena_layout()) };
        assert!(!arena.is_null(), "mock arena allocation failed");

        let fw = Self {
            arena,
            used: RefCell::new(std::vec![false; ARENA_PAGES]),
            live: RefCell::new(Vec::new()),
            pools: RefCell::new(Vec::new()),
            calls: RefCell::new(Vec::new()),
            page_allocations: Cell::new(0),
            fail_allocation: Cell::new(None),
            zero_next: Cell::new(false),
            map: RefCell::new((Vec::new(), 48)),
            map_status: Cell::new(EFI_SUCCESS),
            map_key: Cell::new(0x1000),
        };
        fw.set_memory_map(&Self::pc_memory_map(), 48);
        fw
    }

    /// The map served by default.
    pub fn pc_memory_map() -> [FirmwareMemoryDescriptor; 6] {
        [
            FirmwareMemoryDescriptor::new(MemoryType::Conventional, 0, 0x9f),
            FirmwareMemoryDescriptor::new(MemoryType::Reserved, 0x9_f000, 1),
            FirmwareMemoryDescriptor::new(MemoryType::Reserved, 0xA_0000, 0x60),
            FirmwareMemoryDescriptor::new(MemoryType::LoaderData, 0x10_0000, 0x100),
            FirmwareMemoryDescriptor::new(MemoryType::Conventional, 0x20_0000, 0x7f00),
            FirmwareMemoryDescriptor::new(MemoryType::AcpiNvs, 0x7ff0_0000, 0x10),
        ]
    }

    // ─────────────────────────────────────────────────────────────────────
    // SCRIPTING
    // ─────────────────────────────────────────────────────────────────────

    /// Serve `descriptors` from `GetMemoryMap`, `stride` bytes apart.
    pub fn set_memory_map(&self, descriptors: &[FirmwareMemoryDescriptor], stride: usize) {
        *self.map.borrow_mut() = (descriptors.to_vec(), stride);
    }

    /// Make every `GetMemoryMap` call return `status`.
    pub fn fail_memory_map(&self, status: Status) {
        self.map_status.set(status);
    }

    /// Fail the `n`-th page allocation from now (1 = the next one).
    pub fn fail_page_allocation(&self, n: usize) {
        self.fail_allocation.set(Some(self.page_allocations.get() + n));
    }

    /// Hand out address 0 for the next any-address page allocation.
    pub fn return_zero_next(&self) {
        self.zero_next.set(true);
    }

    // ─────────────────────────────────────────────────────────────────────
    // INSPECTION
    // ─────────────────────────────────────────────────────────────────────

    pub fn map_key(&self) -> usize {
        self.map_key.get()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.borrow().len()
    }

    /// Outstanding page allocations, in allocation order.
    pub fn live_pages(&self) -> Vec<(u64, usize)> {
        self.live.borrow().clone()
    }

    pub fn live_pools(&self) -> usize {
        self.pools.borrow().len()
    }

    /// Bytes at `address` in the arena.
    pub fn read(&self, address: u64, len: usize) -> Vec<u8> {
        assert!(address as usize + len <= ARENA_BYTES);
        unsafe { core::slice::from_raw_parts(self.arena.add(address as usize), len).to_vec() }
    }

    // ─────────────────────────────────────────────────────────────────────

    fn log(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }

    fn range_free(used: &[bool], first: usize, pages: usize) -> bool {
        first + pages <= used.len() && used[first..first + pages].iter().all(|u| !u)
    }

    /// Lowest free run of `pages` pages starting at page 1 whose last byte
    /// is at or below `max`.
    fn first_fit(used: &[bool], pages: usize, max: u64) -> Option<usize> {
        (1..used.len()).find(|&first| {
            let last_byte = ((first + pages) as u64 * PAGE_SIZE).saturating_sub(1);
            last_byte <= max && Self::range_free(used, first, pages)
        })
    }
}

impl Default for MockFirmware {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MockFirmware {
    fn drop(&mut self) {
        for (ptr, layout) in self.pools.borrow_mut().drain(..) {
            unsafe { dealloc(ptr, layout) };
        }
    }
}

impl BootServices for MockFirmware {
    fn allocate_pool(&self, _pool_type: MemoryType, size: usize, buffer: &mut *mut u8) -> Status {
        self.log(Call::AllocatePool { size });
        let Ok(layout) = Layout::from_size_align(size.max(1), 8) else {
            return EFI_INVALID_PARAMETER;
        };
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return EFI_OUT_OF_RESOURCES;
        }
        self.pools.borrow_mut().push((ptr, layout));
        *buffer = ptr;
        EFI_SUCCESS
    }

    unsafe fn free_pool(&self, buffer: *mut u8) -> Status {
        self.log(Call::FreePool);
        let mut pools = self.pools.borrow_mut();
        let Some(index) = pools.iter().position(|(ptr, _)| *ptr == buffer) else {
            return EFI_INVALID_PARAMETER;
        };
        let (ptr, layout) = pools.swap_remove(index);
        dealloc(ptr, layout);
        EFI_SUCCESS
    }

    fn allocate_pages(
        &self,
        request: AllocateType,
        _memory_type: MemoryType,
        pages: usize,
        memory: &mut u64,
    ) -> Status {
        self.log(Call::AllocatePages { request, pages });
        let n = self.page_allocations.get() + 1;
        self.page_allocations.set(n);
        if self.fail_allocation.get() == Some(n) {
            return EFI_OUT_OF_RESOURCES;
        }
        if pages == 0 {
            return EFI_INVALID_PARAMETER;
        }

        let mut used = self.used.borrow_mut();
        let first = match request {
            AllocateType::Address(addr) => {
                if addr % PAGE_SIZE != 0 {
                    return EFI_INVALID_PARAMETER;
                }
                let first = (addr / PAGE_SIZE) as usize;
                if !Self::range_free(&used, first, pages) {
                    return EFI_NOT_FOUND;
                }
                first
            }
            AllocateType::AnyPages | AllocateType::MaxAddress(_) if self.zero_next.get() => {
                self.zero_next.set(false);
                if !Self::range_free(&used, 0, pages) {
                    return EFI_OUT_OF_RESOURCES;
                }
                0
            }
            AllocateType::AnyPages => match Self::first_fit(&used, pages, u64::MAX) {
                Some(first) => first,
                None => return EFI_OUT_OF_RESOURCES,
            },
            AllocateType::MaxAddress(max) => match Self::first_fit(&used, pages, max) {
                Some(first) => first,
                None => return EFI_NOT_FOUND,
            },
        };

        used[first..first + pages].fill(true);
        let addr = first as u64 * PAGE_SIZE;
        self.live.borrow_mut().push((addr, pages));
        self.map_key.set(self.map_key.get() + 1);
        *memory = addr;
        EFI_SUCCESS
    }

    fn free_pages(&self, memory: u64, pages: usize) -> Status {
        self.log(Call::FreePages { memory, pages });
        let mut live = self.live.borrow_mut();
        let Some(index) = live.iter().position(|&entry| entry == (memory, pages)) else {
            return EFI_NOT_FOUND;
        };
        live.remove(index);

        let first = (memory / PAGE_SIZE) as usize;
        self.used.borrow_mut()[first..first + pages].fill(false);
        self.map_key.set(self.map_key.get() + 1);
        EFI_SUCCESS
    }

    fn get_memory_map(
        &self,
        buffer: &mut [u8],
        map_size: &mut usize,
        map_key: &mut usize,
        descriptor_size: &mut usize,
        descriptor_version: &mut u32,
    ) -> Status {
        self.log(Call::GetMemoryMap);
        let status = self.map_status.get();
        if status != EFI_SUCCESS {
            return status;
        }

        let map = self.map.borrow();
        let (descriptors, stride) = (&map.0, map.1);
        let required = descriptors.len() * stride;
        *descriptor_size = stride;
        if buffer.len() < required {
            *map_size = required;
            return EFI_BUFFER_TOO_SMALL;
        }

        buffer[..required].fill(0);
        for (i, desc) in descriptors.iter().enumerate() {
            desc.write_to(&mut buffer[i * stride..]);
        }
        *map_size = required;
        *map_key = self.map_key.get();
        *descriptor_version = 1;
        EFI_SUCCESS
    }

    fn physical_ptr(&self, address: u64) -> *mut u8 {
        assert!((address as usize) < ARENA_BYTES, "{:#x} is outside the mock arena", address);
        unsafe { self.arena.add(address as usize) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any_page(fw: &MockFirmware, addr: &mut u64) -> Status {
        fw.allocate_pages(AllocateType::AnyPages, MemoryType::LoaderData, 1, addr)
    }

    #[test]
    fn test_page_zero_only_on_request() {
        let fw = MockFirmware::new();
        let mut addr = u64::MAX;
        assert_eq!(any_page(&fw, &mut addr), EFI_SUCCESS);
        assert_eq!(addr, PAGE_SIZE);

        fw.return_zero_next();
        let request = AllocateType::MaxAddress(0x7fff_ffff);
        assert_eq!(
            fw.allocate_pages(request, MemoryType::LoaderData, 1, &mut addr),
            EFI_SUCCESS
        );
        assert_eq!(addr, 0);
        assert_eq!(fw.free_pages(0, 1), EFI_SUCCESS);
        assert_eq!(fw.live_pages(), [(PAGE_SIZE, 1)]);
    }

    #[test]
    fn test_scripted_allocation_failure() {
        let fw = MockFirmware::new();
        fw.fail_page_allocation(2);
        let mut addr = 0;
        assert_eq!(any_page(&fw, &mut addr), EFI_SUCCESS);
        assert_eq!(any_page(&fw, &mut addr), EFI_OUT_OF_RESOURCES);
        assert_eq!(any_page(&fw, &mut addr), EFI_SUCCESS);
    }

    #[test]
    fn test_fixed_address_collision() {
        let fw = MockFirmware::new();
        let mut addr = 0;
        assert_eq!(
            fw.allocate_pages(AllocateType::Address(0x4000), MemoryType::LoaderData, 2, &mut addr),
            EFI_SUCCESS
        );
        assert_eq!(addr, 0x4000);
        assert_eq!(
            fw.allocate_pages(AllocateType::Address(0x5000), MemoryType::LoaderData, 1, &mut addr),
            EFI_NOT_FOUND
        );
        assert_eq!(fw.free_pages(0x4000, 1), EFI_NOT_FOUND);
        assert_eq!(fw.free_pages(0x4000, 2), EFI_SUCCESS);
    }
}
