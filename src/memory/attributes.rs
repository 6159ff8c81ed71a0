//! Private/shared transitions of protected guest memory.
//!
//! A protected guest's pages are private by default. The guest asks for a
//! page to be shared with the monitor through a hypercall, and the
//! hypervisor reports accesses that disagree with a page's current attribute
//! as memory faults. Both end up here.

use tracing::{trace, warn};

use super::{align_down, PAGE_SIZE};
use crate::backend::{GuestMemoryRegistry, MemoryAttributes};
use crate::error::{Fatal, FatalContext};

/// SMCCC return codes written back to the guest.
pub mod smccc {
    pub const SUCCESS: i64 = 0;
}

/// Memory fault flag: the faulting access wants the range private.
pub const MEMORY_FAULT_PRIVATE: u64 = 1 << 3;

/// A guest access to memory whose attribute did not match the access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryFault {
    pub flags: u64,
    pub gpa: u64,
    pub size: u64,
}

impl MemoryFault {
    /// Whether the range must become private to satisfy the access.
    pub fn needs_private(&self) -> bool {
        self.flags & MEMORY_FAULT_PRIVATE != 0
    }
}

/// Flips guest pages between private and shared.
///
/// The controller holds no state of its own: the registry is the source of
/// truth for attributes. It can be used from every VCPU thread at once.
pub struct AttributeController<'a, R: ?Sized> {
    registry: &'a R,
    protected: bool,
}

impl<'a, R: GuestMemoryRegistry + ?Sized> AttributeController<'a, R> {
    /// Create a controller for a guest. `protected` is false for ordinary
    /// guests, whose memory is always shared.
    pub fn new(registry: &'a R, protected: bool) -> Self {
        Self {
            registry,
            protected,
        }
    }

    /// Handle a guest request to share the page containing `gpa`.
    ///
    /// Returns the SMCCC code to hand back to the guest.
    pub fn share(&self, gpa: u64) -> Result<i64, Fatal> {
        if !self.protected {
            warn!("share request from unprotected guest for {gpa:#x}");
            return Ok(smccc::SUCCESS);
        }
        let page = align_down(gpa, PAGE_SIZE);
        trace!(target: "armvmm::memory", "share page {page:#x}");
        self.make_shared(page, PAGE_SIZE)?;
        Ok(smccc::SUCCESS)
    }

    /// Handle a guest request to take back the page containing `gpa`.
    ///
    /// Returns the SMCCC code to hand back to the guest.
    pub fn unshare(&self, gpa: u64) -> Result<i64, Fatal> {
        if !self.protected {
            warn!("unshare request from unprotected guest for {gpa:#x}");
            return Ok(smccc::SUCCESS);
        }
        let page = align_down(gpa, PAGE_SIZE);
        trace!(target: "armvmm::memory", "unshare page {page:#x}");
        self.make_private(page, PAGE_SIZE)?;
        Ok(smccc::SUCCESS)
    }

    /// Resolve a memory fault by converting the faulting range.
    pub fn memory_fault(&self, fault: &MemoryFault) -> Result<(), Fatal> {
        trace!(
            target: "armvmm::memory",
            "memory fault {:#x}+{:#x} private={}",
            fault.gpa,
            fault.size,
            fault.needs_private()
        );
        if fault.needs_private() {
            self.make_private(fault.gpa, fault.size)
        } else {
            self.make_shared(fault.gpa, fault.size)
        }
    }

    // The attribute changes before the monitor gains access and after it
    // loses it, so the monitor never maps a private page.
    fn make_shared(&self, gpa: u64, size: u64) -> Result<(), Fatal> {
        self.registry
            .set_attributes(gpa, size, MemoryAttributes::SHARED)
            .or_fatal(|| format!("clear private attribute on {gpa:#x}+{size:#x}"))?;
        self.registry
            .map_range(gpa, size)
            .or_fatal(|| format!("map shared range {gpa:#x}+{size:#x}"))
    }

    fn make_private(&self, gpa: u64, size: u64) -> Result<(), Fatal> {
        self.registry
            .unmap_range(gpa, size)
            .or_fatal(|| format!("unmap range {gpa:#x}+{size:#x}"))?;
        self.registry
            .set_attributes(gpa, size, MemoryAttributes::PRIVATE)
            .or_fatal(|| format!("set private attribute on {gpa:#x}+{size:#x}"))
    }
}
