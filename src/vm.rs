//! VM construction: guest RAM, VCPUs, pvtime and realm finalization.

use tracing::{info, warn};

#[cfg(target_arch = "aarch64")]
use crate::backend::kvm::{KvmHypervisor, KvmMemoryRegistry};
use crate::backend::{GuestMemoryRegistry, MemoryAttributes, MemoryBinding, RealmControl, VmControl};
use crate::config::VmConfig;
use crate::error::{Error, Fatal, Result};
use crate::memory::{allocate, layout, AttributeController, MappedRegion, MemoryKind};
use crate::pvtime::PvTime;
use crate::realm::{self, RealmState, RealmSupport};
use crate::vcpu::{self, ExitOutcome, FeatureRequest, TargetRegistry, VcpuHandle};

/// The construction stage of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// VM has been created, nothing is allocated yet.
    Created,
    /// Guest RAM is allocated and registered; images can be loaded.
    RamReady,
    /// Every VCPU is created and initialized.
    VcpusCreated,
    /// Realm setup is done; VCPUs may run.
    Finalized,
    /// Everything has been released.
    TornDown,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Created => write!(f, "created"),
            VmState::RamReady => write!(f, "ram-ready"),
            VmState::VcpusCreated => write!(f, "vcpus-created"),
            VmState::Finalized => write!(f, "finalized"),
            VmState::TornDown => write!(f, "torn-down"),
        }
    }
}

/// An ARM64 virtual machine under construction.
///
/// Owns the hypervisor handle, the guest memory registry, guest RAM, the
/// CPU target registry, realm state, pvtime and the VCPUs.
///
/// # Example
///
/// ```rust,ignore
/// use armvmm::{Vm, VmBuilder};
///
/// let config = VmBuilder::new().memory_mb(256).vcpus(2).realm(true).build()?;
/// let mut vm = Vm::create(config)?;
/// vm.setup_ram()?;
/// vm.load_image(0x8008_0000, &[0u8; 4096], 0x10_0000)?;
/// vm.create_vcpus()?;
/// vm.finalize()?;
/// # Ok::<(), armvmm::Error>(())
/// ```
pub struct Vm<H, R>
where
    H: VmControl + RealmControl,
    R: GuestMemoryRegistry,
{
    config: VmConfig,
    hypervisor: H,
    registry: R,
    targets: TargetRegistry,
    realm: Box<dyn RealmSupport>,
    ram: Option<MappedRegion>,
    pvtime: PvTime,
    vcpus: Vec<VcpuHandle<H::Vcpu>>,
    state: VmState,
}

#[cfg(target_arch = "aarch64")]
impl Vm<KvmHypervisor, KvmMemoryRegistry> {
    /// Create a KVM VM for `config`.
    pub fn create(config: VmConfig) -> Result<Self> {
        let hypervisor = KvmHypervisor::new(&config)?;
        let registry = hypervisor.memory_registry();
        Self::new(config, hypervisor, registry)
    }
}

impl<H, R> Vm<H, R>
where
    H: VmControl + RealmControl,
    R: GuestMemoryRegistry,
{
    /// Assemble a VM from its parts, with the built-in CPU targets.
    ///
    /// Fails if the realm configuration cannot be used.
    pub fn new(config: VmConfig, hypervisor: H, registry: R) -> Result<Self> {
        let realm = realm::select(&config)?;
        let pvtime = PvTime::new(config.realm.no_pvtime);
        Ok(Self {
            config,
            hypervisor,
            registry,
            targets: TargetRegistry::with_default_targets(),
            realm,
            ram: None,
            pvtime,
            vcpus: Vec::new(),
            state: VmState::Created,
        })
    }

    /// Replace the CPU target registry. Only possible before VCPUs exist.
    pub fn with_targets(mut self, targets: TargetRegistry) -> Self {
        self.targets = targets;
        self
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn hypervisor(&self) -> &H {
        &self.hypervisor
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Guest RAM, once allocated.
    pub fn ram(&self) -> Option<&MappedRegion> {
        self.ram.as_ref()
    }

    pub fn vcpus(&self) -> &[VcpuHandle<H::Vcpu>] {
        &self.vcpus
    }

    pub fn realm_state(&self) -> RealmState {
        self.realm.state()
    }

    pub fn is_realm(&self) -> bool {
        self.realm.is_realm()
    }

    pub fn pvtime_enabled(&self) -> bool {
        self.pvtime.is_enabled()
    }

    fn expect_state(&self, expected: VmState) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidState {
                expected: expected.to_string(),
                actual: self.state.to_string(),
            });
        }
        Ok(())
    }

    /// Allocate guest RAM at [`layout::RAM_BASE`] and register it.
    ///
    /// RAM of protected guests and realms starts out private.
    pub fn setup_ram(&mut self) -> Result<()> {
        self.expect_state(VmState::Created)?;

        let size = self.config.memory_size();
        let ram = allocate(size, layout::RAM_ALIGN, self.config.hugetlbfs.as_deref()).map_err(
            |e| {
                if e.is_fatal() {
                    Error::Fatal(Fatal::with_source("allocate guest RAM", e))
                } else {
                    Error::MemoryAllocationFailed(e)
                }
            },
        )?;

        self.registry.register(MemoryBinding {
            gpa: layout::RAM_BASE,
            size: ram.size(),
            host: ram.as_ptr(),
            fd: ram.fd(),
            offset: 0,
            kind: MemoryKind::Ram,
        })?;
        if self.config.protected || self.config.is_realm() {
            self.registry
                .set_attributes(layout::RAM_BASE, ram.size(), MemoryAttributes::PRIVATE)?;
        }

        info!(
            "guest RAM: {:#x}+{:#x} ({} KiB pages)",
            layout::RAM_BASE,
            ram.size(),
            ram.page_size() >> 10
        );
        self.ram = Some(ram);
        self.state = VmState::RamReady;
        Ok(())
    }

    /// Copy `image` to guest address `gpa`, reserving `mem_size` bytes for
    /// it in total.
    ///
    /// For realms the region is measured at [`Vm::finalize`].
    pub fn load_image(&mut self, gpa: u64, image: &[u8], mem_size: u64) -> Result<()> {
        self.expect_state(VmState::RamReady)?;
        let ram = self.ram.as_mut().ok_or(Error::InvalidState {
            expected: VmState::RamReady.to_string(),
            actual: "no RAM".to_string(),
        })?;

        let offset = gpa
            .checked_sub(layout::RAM_BASE)
            .ok_or(Error::InvalidGuestAddress(gpa))?;
        let reserved = mem_size.max(image.len() as u64);
        if offset
            .checked_add(reserved)
            .map_or(true, |end| end > ram.size())
        {
            return Err(Error::InvalidGuestAddress(gpa));
        }
        ram.write(offset, image)?;

        self.realm
            .register_ram_region(gpa, image.len() as u64, mem_size)?;
        info!("loaded {} bytes at {gpa:#x}", image.len());
        Ok(())
    }

    /// Create and initialize every VCPU.
    ///
    /// A pvtime failure on the first VCPU switches the feature off and VCPU
    /// creation continues. Once a VCPU uses pvtime, a failure is fatal.
    pub fn create_vcpus(&mut self) -> Result<()> {
        self.expect_state(VmState::RamReady)?;
        let request = FeatureRequest::from_config(&self.config);

        for cpu_id in 0..self.config.vcpus {
            let handle = vcpu::create_vcpu(&self.hypervisor, &self.targets, cpu_id, &request)?;
            match self
                .pvtime
                .setup(&self.hypervisor, &self.registry, handle.control(), cpu_id)
            {
                Ok(()) => {}
                Err(e @ Error::Fatal(_)) => return Err(e),
                Err(e) => {
                    warn!("pvtime setup failed on vcpu {cpu_id}, disabling pvtime: {e}");
                    if let Err(e) = self.pvtime.teardown(&self.registry) {
                        warn!("pvtime teardown failed: {e}");
                    }
                    self.pvtime.disable();
                }
            }
            self.vcpus.push(handle);
        }

        self.state = VmState::VcpusCreated;
        Ok(())
    }

    /// Finish realm setup. Must run once, after every image is loaded and
    /// before any VCPU runs.
    pub fn finalize(&mut self) -> Result<()> {
        self.expect_state(VmState::VcpusCreated)?;
        self.realm.finalize(&self.hypervisor)?;
        self.state = VmState::Finalized;
        info!("VM ready");
        Ok(())
    }

    /// The private/shared controller for this VM's memory.
    pub fn attribute_controller(&self) -> AttributeController<'_, R> {
        AttributeController::new(&self.registry, self.config.protected)
    }

    fn vcpu(&self, cpu_id: u32) -> Result<&VcpuHandle<H::Vcpu>> {
        self.vcpus
            .iter()
            .find(|vcpu| vcpu.cpu_id() == cpu_id)
            .ok_or(Error::UnknownVcpu(cpu_id))
    }

    /// Service the current exit of VCPU `cpu_id`.
    pub fn handle_exit(&self, cpu_id: u32) -> Result<ExitOutcome> {
        let vcpu = self.vcpu(cpu_id)?;
        Ok(vcpu::handle_exit(vcpu.control(), &self.attribute_controller())?)
    }

    /// React to an MMIO access of VCPU `cpu_id` that no device handled.
    pub fn handle_unhandled_mmio(&self, cpu_id: u32) -> Result<()> {
        let vcpu = self.vcpu(cpu_id)?;
        Ok(vcpu::handle_unhandled_mmio(vcpu.control(), self.is_realm())?)
    }

    /// Release VCPUs, pvtime and guest RAM, in that order.
    pub fn teardown(&mut self) -> Result<()> {
        if self.state == VmState::TornDown {
            return Ok(());
        }
        self.state = VmState::TornDown;
        self.vcpus.clear();

        let pvtime = self.pvtime.teardown(&self.registry);
        if let Some(ram) = &self.ram {
            // On failure the mapping stays alive until the VM itself is gone.
            self.registry
                .destroy(layout::RAM_BASE, ram.size(), ram.as_ptr())?;
            self.ram = None;
        }
        pvtime
    }
}

impl<H, R> Drop for Vm<H, R>
where
    H: VmControl + RealmControl,
    R: GuestMemoryRegistry,
{
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!("VM teardown failed: {e}");
        }
    }
}
