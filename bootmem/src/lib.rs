//! Boot-time Memory Manager
//!
//! Thin layer over the UEFI memory services for the loader stage: every
//! page range handed out is remembered so it can be returned in one sweep,
//! and the firmware memory map is re-expressed as a legacy E820 table for
//! payloads that still ask `INT 15h, AX=E820h`.
//!
//! # Architecture
//!
//! ```text
//! firmware (BootServices)
//!   ├─ AllocatePages/FreePages ──► MemoryManager ──► AllocationTable (256 slots)
//!   ├─ AllocatePool/FreePool  ──► MemoryManager (untracked)
//!   └─ GetMemoryMap ──► mmap reader ──► E820Map (128 entries) ──► next_region
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use morpheus_bootmem::{MemoryManager, MmarDescriptor};
//!
//! let mut mm = MemoryManager::startup(boot_services);
//!
//! // Loader scratch below 2GB
//! let buf = mm.allocate_pages_at(0, 16).ok_or(LoadError::NoMemory)?;
//!
//! // BIOS-style map walk
//! let mut desc = MmarDescriptor::EMPTY;
//! let mut cont = 0;
//! loop {
//!     cont = mm.next_region(&mut desc, cont);
//!     if desc.desc_len() == 0 {
//!         break;
//!     }
//!     report(desc.addr(), desc.length(), desc.entry_type());
//!     if cont == 0 {
//!         break;
//!     }
//! }
//!
//! // Everything still tracked goes back to firmware
//! mm.shutdown();
//! ```
//!
//! # What This Crate Does NOT Do
//!
//! - Any allocation after ExitBootServices
//! - Heap/`GlobalAlloc` integration
//! - Sorting or deduplicating firmware maps

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod e820;
pub mod error;
pub mod firmware;
pub mod manager;
pub mod mmap;
pub mod tracker;

#[cfg(all(feature = "serial-log", target_arch = "x86_64"))]
pub mod logger;
#[cfg(all(feature = "serial-log", target_arch = "x86_64"))]
pub mod serial;

#[cfg(test)]
mod mock;

// ═══════════════════════════════════════════════════════════════════════════
// RE-EXPORTS
// ═══════════════════════════════════════════════════════════════════════════

pub use config::{MemConfig, E820_MAX, PAGE_SIZE};
pub use e820::{E820Entry, E820Map, E820Type, E820Walker, MmarDescriptor, MMAR_DESC_LENGTH};
pub use error::{FirmwareError, MemError};
pub use firmware::{AllocateType, BootServices, MemoryType, RawBootServices, Status};
pub use manager::MemoryManager;
pub use mmap::{get_memory_map, FirmwareMemoryDescriptor, MapLayout, MapRead};
pub use tracker::{AllocatedRange, AllocationTable, MAX_ALLOCATED_PAGES};
