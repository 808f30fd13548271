//! Error types.
//!
//! Firmware status codes stop at [`crate::firmware::classify`]; everything
//! above it sees [`FirmwareError`] or [`MemError`].

use thiserror::Error;

use crate::firmware::Status;

/// A firmware call that did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FirmwareError {
    /// Caller buffer too small (only meaningful for GetMemoryMap).
    #[error("firmware buffer too small")]
    BufferTooSmall,
    /// Any other non-success status.
    #[error("firmware call failed with status {0:#x}")]
    Failed(Status),
}

/// Memory manager errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemError {
    #[error(transparent)]
    Firmware(#[from] FirmwareError),

    /// Explicit page address above the allocation ceiling.
    #[error("address {address:#x} is above the allocation ceiling {ceiling:#x}")]
    AddressOutOfRange { address: u64, ceiling: u64 },

    /// Every tracker slot is live.
    #[error("too many page allocations (capacity {capacity})")]
    TrackerExhausted { capacity: usize },

    /// The legacy map is full.
    #[error("too many entries in the memory map (capacity {capacity})")]
    RegionTableExhausted { capacity: usize },

    /// Firmware reported a descriptor stride smaller than a descriptor.
    #[error("invalid memory descriptor size {0}")]
    InvalidDescriptorSize(usize),
}
