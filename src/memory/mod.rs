//! Guest memory: allocation, registration bookkeeping and the
//! private/shared attribute controller.

pub mod alloc;
pub mod attributes;
mod guest;

pub use alloc::{allocate, AllocError, MappedRegion};
pub use attributes::{AttributeController, MemoryFault};
pub use guest::{GuestMemoryRegion, MemoryKind};

/// Granule used for all guest-physical bookkeeping.
pub const PAGE_SIZE: u64 = 0x1000;

/// Round `addr` down to a multiple of `align` (a power of two).
pub const fn align_down(addr: u64, align: u64) -> u64 {
    addr & !(align - 1)
}

/// Round `addr` up to a multiple of `align` (a power of two).
pub const fn align_up(addr: u64, align: u64) -> u64 {
    (addr + align - 1) & !(align - 1)
}

/// Standard guest physical memory layout for ARM64 guests.
pub mod layout {
    /// PCI memory window.
    pub const AXI_AREA: u64 = 0x4000_0000;

    /// Size of the shared pvtime steal-time region.
    pub const PVTIME_SIZE: u64 = 0x1_0000;

    /// pvtime region, directly below the PCI memory window.
    pub const PVTIME_BASE: u64 = AXI_AREA - PVTIME_SIZE;

    /// Size of one VCPU's steal-time structure inside the pvtime region.
    pub const PVTIME_STRUCT_SIZE: u64 = 64;

    /// Guest RAM starts at 2GB.
    pub const RAM_BASE: u64 = 0x8000_0000;

    /// Host alignment of the guest RAM mapping.
    pub const RAM_ALIGN: u64 = 0x20_0000;
}
