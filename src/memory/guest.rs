//! Guest memory region bookkeeping.

/// What a guest memory region is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Guest RAM.
    Ram,
    /// Memory shared between the monitor and every VCPU (pvtime).
    Shared,
}

/// Represents a region of guest physical memory backed by host memory.
#[derive(Debug, Clone)]
pub struct GuestMemoryRegion {
    /// Guest physical address
    pub guest_addr: u64,
    /// Size in bytes
    pub size: u64,
    /// Host virtual address of the backing mapping
    pub host_addr: u64,
    /// Offset of the region in its backing memory object
    pub offset: u64,
    /// What the region is used for
    pub kind: MemoryKind,
}

impl GuestMemoryRegion {
    /// Create a new memory region.
    pub fn new(guest_addr: u64, size: u64, host_addr: u64, offset: u64, kind: MemoryKind) -> Self {
        Self {
            guest_addr,
            size,
            host_addr,
            offset,
            kind,
        }
    }

    /// First guest physical address past the region.
    pub fn end(&self) -> u64 {
        self.guest_addr + self.size
    }

    /// Check if an address falls within this region.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.guest_addr && addr < self.end()
    }

    /// Check if `[addr, addr + size)` lies entirely within this region.
    pub fn contains_range(&self, addr: u64, size: u64) -> bool {
        self.contains(addr) && addr.checked_add(size).is_some_and(|end| end <= self.end())
    }

    /// Check if `[addr, addr + size)` overlaps this region.
    pub fn overlaps(&self, addr: u64, size: u64) -> bool {
        addr < self.end() && addr.saturating_add(size) > self.guest_addr
    }

    /// Get the offset of an address within this region.
    pub fn offset_of(&self, addr: u64) -> Option<u64> {
        if self.contains(addr) {
            Some(addr - self.guest_addr)
        } else {
            None
        }
    }

    /// Host virtual address backing guest address `addr`.
    pub fn host_addr_of(&self, addr: u64) -> Option<u64> {
        self.offset_of(addr).map(|off| self.host_addr + off)
    }
}
