//! Hypervisor interface abstraction.
//!
//! This module defines the privileged calls the core issues, split by the
//! object they act on. The core never reaches the hypervisor any other way,
//! so every sequence of calls it makes can be recorded and checked. The KVM
//! implementation lives in `kvm`, built on arm64 hosts only.

use std::os::fd::BorrowedFd;

use crate::config::{MeasurementAlgo, REALM_PERSONALIZATION_SIZE};
use crate::error::Result;
use crate::memory::MemoryKind;
use crate::vcpu::VcpuExit;

#[cfg(target_arch = "aarch64")]
pub mod kvm;

#[cfg(test)]
pub(crate) mod mock;

/// Hypervisor capability numbers.
pub mod cap {
    pub const COALESCED_MMIO: u32 = 15;
    pub const ARM_PSCI_0_2: u32 = 102;
    pub const ARM_PMU_V3: u32 = 126;
    pub const ARM_VM_IPA_SIZE: u32 = 165;
    pub const STEAL_TIME: u32 = 224;
    pub const ARM_RME: u32 = 300;
}

/// Bit numbers in the VCPU init feature set.
pub mod feature {
    pub const POWER_OFF: u32 = 0;
    pub const EL1_32BIT: u32 = 1;
    pub const PSCI_0_2: u32 = 2;
    pub const PMU_V3: u32 = 3;
}

/// Number of 32-bit words in a VCPU feature set.
pub const VCPU_FEATURE_WORDS: usize = 7;

/// Feature bitset passed to VCPU initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VcpuFeatures([u32; VCPU_FEATURE_WORDS]);

impl VcpuFeatures {
    /// Set feature `bit`.
    pub fn set(&mut self, bit: u32) {
        self.0[(bit / 32) as usize] |= 1 << (bit % 32);
    }

    /// Whether feature `bit` is set.
    pub fn contains(&self, bit: u32) -> bool {
        self.0[(bit / 32) as usize] & (1 << (bit % 32)) != 0
    }

    /// The raw feature words.
    pub fn words(&self) -> [u32; VCPU_FEATURE_WORDS] {
        self.0
    }
}

/// A VCPU initialization request: target CPU type plus features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VcpuInit {
    pub target: u32,
    pub features: VcpuFeatures,
}

/// A VCPU device attribute (group, attribute).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAttr {
    pub group: u32,
    pub attr: u64,
}

impl DeviceAttr {
    /// PMUv3 overflow interrupt number.
    pub const PMU_IRQ: DeviceAttr = DeviceAttr { group: 0, attr: 0 };
    /// PMUv3 initialization.
    pub const PMU_INIT: DeviceAttr = DeviceAttr { group: 0, attr: 1 };
    /// Guest physical address of the VCPU's steal-time structure.
    pub const PVTIME_IPA: DeviceAttr = DeviceAttr { group: 2, attr: 0 };
}

/// One realm configuration parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealmConfigItem {
    /// Realm personalization value, zero padded.
    Personalization([u8; REALM_PERSONALIZATION_SIZE]),
    /// Measurement hash algorithm.
    HashAlgorithm(MeasurementAlgo),
}

impl RealmConfigItem {
    /// The parameter-set discriminator tag.
    pub fn discriminator(&self) -> u32 {
        match self {
            RealmConfigItem::Personalization(_) => 0,
            RealmConfigItem::HashAlgorithm(_) => 1,
        }
    }
}

/// Per-page memory attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryAttributes(u64);

impl MemoryAttributes {
    /// The page is private to the guest.
    pub const PRIVATE: MemoryAttributes = MemoryAttributes(1 << 3);
    /// No attributes: the page is shared.
    pub const SHARED: MemoryAttributes = MemoryAttributes(0);

    /// The raw attribute bits.
    pub fn bits(self) -> u64 {
        self.0
    }

    /// Whether the private attribute is set.
    pub fn is_private(self) -> bool {
        self.0 & Self::PRIVATE.0 != 0
    }
}

/// Host memory handed to the guest memory registry.
#[derive(Debug, Clone, Copy)]
pub struct MemoryBinding<'a> {
    /// Guest physical base address.
    pub gpa: u64,
    /// Size in bytes.
    pub size: u64,
    /// Host mapping of the memory.
    pub host: *mut u8,
    /// Memory object backing the mapping.
    pub fd: BorrowedFd<'a>,
    /// Offset of the mapping within `fd`.
    pub offset: u64,
    /// What the memory is used for.
    pub kind: MemoryKind,
}

/// VM-scoped privileged calls.
pub trait VmControl {
    /// The per-VCPU control handle.
    type Vcpu: VcpuControl;

    /// Query a capability. 0 means unsupported; some capabilities return a
    /// meaningful positive value.
    fn check_extension(&self, cap: u32) -> u32;

    /// The hypervisor's preferred VCPU target, or `None` if the hypervisor
    /// cannot report one.
    fn preferred_target(&self) -> Option<u32>;

    /// Create VCPU `cpu_id` and map its shared run structure.
    fn create_vcpu(&self, cpu_id: u32) -> Result<Self::Vcpu>;
}

/// VCPU-scoped privileged calls.
pub trait VcpuControl {
    /// Initialize the VCPU against a target CPU type.
    fn init(&self, init: &VcpuInit) -> Result<()>;

    /// Check that the VCPU supports a device attribute.
    fn has_device_attr(&self, attr: DeviceAttr) -> Result<()>;

    /// Set a device attribute. `value` is passed by address when present.
    fn set_device_attr(&self, attr: DeviceAttr, value: Option<u64>) -> Result<()>;

    /// Make an external data abort pending for the guest.
    fn inject_external_abort(&self) -> Result<()>;

    /// Base of the shared run structure mapping.
    fn run_mapping(&self) -> *mut u8;

    /// Decode the exit recorded in the run structure.
    fn exit(&self) -> VcpuExit;

    /// Write the return value of the hypercall being handled.
    fn set_hypercall_return(&self, ret: u64);
}

/// Realm (confidential guest) privileged calls.
pub trait RealmControl {
    /// Set one realm parameter. Must precede descriptor creation.
    fn configure_realm(&self, item: RealmConfigItem) -> Result<()>;

    /// Create the realm descriptor, sealing its configuration.
    fn create_realm_descriptor(&self) -> Result<()>;

    /// Declare `[base, base + size)` as unmeasured realm RAM.
    fn init_ipa_range(&self, base: u64, size: u64) -> Result<()>;

    /// Populate `[base, base + size)` from the host mapping, adding it to the
    /// realm measurement when `measure` is set.
    fn populate_realm(&self, base: u64, size: u64, measure: bool) -> Result<()>;
}

/// The guest memory registration facility.
///
/// Implementations are shared between VCPU threads.
pub trait GuestMemoryRegistry: Send + Sync {
    /// Make host memory visible to the guest at `binding.gpa`.
    fn register(&self, binding: MemoryBinding<'_>) -> Result<()>;

    /// Remove a region previously registered at `gpa`.
    fn destroy(&self, gpa: u64, size: u64, host: *mut u8) -> Result<()>;

    /// Set the attributes of every page in `[gpa, gpa + size)`.
    fn set_attributes(&self, gpa: u64, size: u64, attributes: MemoryAttributes) -> Result<()>;

    /// Make `[gpa, gpa + size)` accessible through the monitor's mapping.
    fn map_range(&self, gpa: u64, size: u64) -> Result<()>;

    /// Remove the monitor's access to `[gpa, gpa + size)`.
    fn unmap_range(&self, gpa: u64, size: u64) -> Result<()>;
}

/// Check if the hypervisor is available on this platform.
pub fn is_available() -> bool {
    #[cfg(target_arch = "aarch64")]
    {
        kvm::is_available()
    }

    #[cfg(not(target_arch = "aarch64"))]
    {
        false
    }
}

/// Get the name of the backend for this platform.
pub fn name() -> Option<&'static str> {
    #[cfg(target_arch = "aarch64")]
    {
        Some("kvm")
    }

    #[cfg(not(target_arch = "aarch64"))]
    {
        None
    }
}
