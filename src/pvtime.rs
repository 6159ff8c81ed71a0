//! Paravirtualized stolen-time region.
//!
//! One 64K region at [`layout::PVTIME_BASE`] is shared by every VCPU, each
//! owning a 64-byte slot the hypervisor updates with the time it was not
//! scheduled.

use tracing::{debug, info, warn};

use crate::backend::{cap, DeviceAttr, GuestMemoryRegistry, MemoryBinding, VcpuControl, VmControl};
use crate::error::{Error, Fatal, Result};
use crate::memory::{allocate, layout, MappedRegion, MemoryKind};

/// Stolen-time support for one VM.
#[derive(Debug)]
pub struct PvTime {
    disabled: bool,
    region: Option<MappedRegion>,
    /// VCPUs already pointed at their slot.
    configured: u32,
}

impl PvTime {
    /// `disabled` turns the feature off from the start.
    pub fn new(disabled: bool) -> Self {
        Self {
            disabled,
            region: None,
            configured: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.disabled
    }

    /// Turn the feature off for the rest of the VM's life.
    pub fn disable(&mut self) {
        self.disabled = true;
    }

    /// The shared region, once allocated.
    pub fn region(&self) -> Option<&MappedRegion> {
        self.region.as_ref()
    }

    /// Guest address of the stolen-time slot of `cpu_id`.
    pub fn slot_address(cpu_id: u32) -> u64 {
        layout::PVTIME_BASE + u64::from(cpu_id) * layout::PVTIME_STRUCT_SIZE
    }

    /// Point `vcpu` at its stolen-time slot, creating the region on first
    /// use.
    ///
    /// A hypervisor without stolen-time support disables the feature and
    /// succeeds. A failure on the first VCPU leaves the region torn down.
    /// Once a VCPU uses the region it can no longer be withdrawn, so later
    /// failures are [`Error::Fatal`].
    pub fn setup<H, R, V>(&mut self, vm: &H, registry: &R, vcpu: &V, cpu_id: u32) -> Result<()>
    where
        H: VmControl + ?Sized,
        R: GuestMemoryRegistry + ?Sized,
        V: VcpuControl + ?Sized,
    {
        if self.disabled {
            return Ok(());
        }
        if vm.check_extension(cap::STEAL_TIME) == 0 {
            info!(target: "armvmm::pvtime", "stolen time not supported, disabling pvtime");
            self.disabled = true;
            return Ok(());
        }

        if let Err(e) = vcpu.has_device_attr(DeviceAttr::PVTIME_IPA) {
            return Err(self.partial_failure(cpu_id, e));
        }

        if self.region.is_none() {
            self.region = Some(Self::alloc_region(registry)?);
        }

        let slot = Self::slot_address(cpu_id);
        if let Err(e) = vcpu.set_device_attr(DeviceAttr::PVTIME_IPA, Some(slot)) {
            if self.configured == 0 {
                if let Err(teardown) = self.teardown(registry) {
                    warn!(target: "armvmm::pvtime", "pvtime teardown failed: {teardown}");
                }
            }
            return Err(self.partial_failure(cpu_id, e));
        }
        self.configured += 1;
        debug!(target: "armvmm::pvtime", "vcpu {cpu_id} stolen time at {slot:#x}");
        Ok(())
    }

    fn partial_failure(&self, cpu_id: u32, e: Error) -> Error {
        if self.configured == 0 {
            return e;
        }
        Error::Fatal(Fatal::with_source(
            format!(
                "pvtime setup of vcpu {cpu_id} after {} vcpus already use it",
                self.configured
            ),
            e,
        ))
    }

    fn alloc_region<R: GuestMemoryRegistry + ?Sized>(registry: &R) -> Result<MappedRegion> {
        let region = allocate(layout::PVTIME_SIZE, 0, None)?;
        registry.register(MemoryBinding {
            gpa: layout::PVTIME_BASE,
            size: layout::PVTIME_SIZE,
            host: region.as_ptr(),
            fd: region.fd(),
            offset: 0,
            kind: MemoryKind::Shared,
        })?;
        debug!(
            target: "armvmm::pvtime",
            "pvtime region at {:#x}",
            layout::PVTIME_BASE
        );
        Ok(region)
    }

    /// Remove the region from the guest and release it.
    ///
    /// The mapping is kept if the hypervisor still holds it.
    pub fn teardown<R: GuestMemoryRegistry + ?Sized>(&mut self, registry: &R) -> Result<()> {
        let Some(region) = &self.region else {
            return Ok(());
        };
        debug!(target: "armvmm::pvtime", "tearing down pvtime region");
        registry.destroy(layout::PVTIME_BASE, layout::PVTIME_SIZE, region.as_ptr())?;
        self.region = None;
        self.configured = 0;
        Ok(())
    }
}
