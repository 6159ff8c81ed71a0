//! Linux KVM backend.
//!
//! This module drives `/dev/kvm` for arm64 guests, including protected
//! (pKVM) guests and Arm CCA realms.
//!
//! ## Requirements
//!
//! - Linux kernel with KVM support
//! - Access to /dev/kvm
//! - For realms, a host kernel with the RME extension to `KVM_ENABLE_CAP`

mod bindings;
mod memory;
mod vcpu;

pub use memory::KvmMemoryRegistry;
pub use vcpu::KvmVcpu;

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Arc;

use tracing::{debug, info};

use self::bindings::ioctl;
use super::{cap, RealmConfigItem, RealmControl, VmControl};
use crate::config::VmConfig;
use crate::error::{Error, Result};

const KVM_PATH: &str = "/dev/kvm";

/// Check if KVM is available on this system.
pub fn is_available() -> bool {
    std::path::Path::new(KVM_PATH).exists()
}

/// An open KVM VM.
#[derive(Debug)]
pub struct KvmHypervisor {
    vm: Arc<OwnedFd>,
    /// Size of each VCPU's run structure.
    run_size: usize,
}

impl KvmHypervisor {
    /// Create a VM of the type `config` asks for.
    pub fn new(config: &VmConfig) -> Result<Self> {
        if !is_available() {
            return Err(Error::HypervisorNotAvailable);
        }
        let sys = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(KVM_PATH)?;

        let vm_type = Self::vm_type(&sys, config)?;
        debug!("creating VM of type {vm_type:#x}");
        // SAFETY: `sys` is an open /dev/kvm descriptor.
        let vm = unsafe { ioctl::kvm_create_vm(sys.as_raw_fd(), vm_type) }
            .map_err(|e| Error::kvm("KVM_CREATE_VM", e))?;
        // SAFETY: KVM_CREATE_VM returned a new descriptor we now own.
        let vm = Arc::new(unsafe { OwnedFd::from_raw_fd(vm) });

        // SAFETY: KVM_GET_VCPU_MMAP_SIZE takes no argument.
        let run_size = unsafe { ioctl::kvm_get_vcpu_mmap_size(sys.as_raw_fd(), 0) }
            .map_err(|e| Error::kvm("KVM_GET_VCPU_MMAP_SIZE", e))?;

        info!(
            realm = config.is_realm(),
            protected = config.protected,
            "KVM VM created"
        );
        Ok(Self {
            vm,
            run_size: run_size as usize,
        })
    }

    fn vm_type(sys: &File, config: &VmConfig) -> Result<u64> {
        let mut vm_type = 0;

        // SAFETY: KVM_CHECK_EXTENSION takes the capability by value.
        let max_ipa = unsafe { ioctl::kvm_check_extension(sys.as_raw_fd(), cap::ARM_VM_IPA_SIZE as i32) }
            .unwrap_or(0);
        if max_ipa > 0 {
            let ipa_bits = (max_ipa as u32).min(bindings::MAX_GUEST_IPA_BITS);
            vm_type |= u64::from(ipa_bits) & bindings::KVM_VM_TYPE_ARM_IPA_SIZE_MASK;
        }

        if config.is_realm() {
            // SAFETY: as above.
            let rme = unsafe { ioctl::kvm_check_extension(sys.as_raw_fd(), cap::ARM_RME as i32) }
                .unwrap_or(0);
            if rme <= 0 {
                return Err(Error::NotSupported("realm guests (KVM_CAP_ARM_RME)".into()));
            }
            vm_type |= bindings::KVM_VM_TYPE_ARM_REALM;
        }
        if config.protected {
            vm_type |= bindings::KVM_VM_TYPE_ARM_PROTECTED;
        }
        Ok(vm_type)
    }

    /// The memory registry of this VM.
    pub fn memory_registry(&self) -> KvmMemoryRegistry {
        KvmMemoryRegistry::new(self.vm.clone())
    }

    fn enable_rme(&self, op: &'static str, subop: u64, arg: u64) -> Result<()> {
        let raw = bindings::kvm_enable_cap {
            cap: cap::ARM_RME,
            args: [subop, arg, 0, 0],
            ..Default::default()
        };
        debug!(target: "armvmm::realm", "{op}");
        // SAFETY: `raw` and whatever `arg` points at outlive the call.
        unsafe { ioctl::kvm_enable_cap(self.vm.as_raw_fd(), &raw) }
            .map_err(|e| Error::kvm(op, e))?;
        Ok(())
    }
}

impl VmControl for KvmHypervisor {
    type Vcpu = KvmVcpu;

    fn check_extension(&self, cap: u32) -> u32 {
        // SAFETY: KVM_CHECK_EXTENSION takes the capability by value.
        let ret = unsafe { ioctl::kvm_check_extension(self.vm.as_raw_fd(), cap as i32) };
        ret.map_or(0, |value| value.max(0) as u32)
    }

    fn preferred_target(&self) -> Option<u32> {
        let mut init = bindings::kvm_vcpu_init::default();
        // SAFETY: `init` is writable for the duration of the call.
        unsafe { ioctl::kvm_arm_preferred_target(self.vm.as_raw_fd(), &mut init) }
            .ok()
            .map(|_| init.target)
    }

    fn create_vcpu(&self, cpu_id: u32) -> Result<KvmVcpu> {
        // SAFETY: KVM_CREATE_VCPU takes the VCPU id by value.
        let fd = unsafe { ioctl::kvm_create_vcpu(self.vm.as_raw_fd(), cpu_id as i32) }
            .map_err(|e| Error::kvm("KVM_CREATE_VCPU", e))?;
        // SAFETY: KVM_CREATE_VCPU returned a new descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        KvmVcpu::new(cpu_id, fd, self.run_size)
    }
}

impl RealmControl for KvmHypervisor {
    fn configure_realm(&self, item: RealmConfigItem) -> Result<()> {
        let mut raw = bindings::kvm_cap_arm_rme_config_item {
            cfg: item.discriminator(),
            data: [0; 256],
        };
        match item {
            RealmConfigItem::Personalization(rpv) => raw.data[..rpv.len()].copy_from_slice(&rpv),
            RealmConfigItem::HashAlgorithm(algo) => {
                raw.data[..4].copy_from_slice(&algo.as_raw().to_ne_bytes())
            }
        }
        self.enable_rme(
            "KVM_CAP_ARM_RME_CONFIG_REALM",
            bindings::KVM_CAP_ARM_RME_CONFIG_REALM,
            &raw as *const _ as u64,
        )
    }

    fn create_realm_descriptor(&self) -> Result<()> {
        self.enable_rme(
            "KVM_CAP_ARM_RME_CREATE_RD",
            bindings::KVM_CAP_ARM_RME_CREATE_RD,
            0,
        )
    }

    fn init_ipa_range(&self, base: u64, size: u64) -> Result<()> {
        let raw = bindings::kvm_cap_arm_rme_init_ipa_args {
            init_ipa_base: base,
            init_ipa_size: size,
            ..Default::default()
        };
        self.enable_rme(
            "KVM_CAP_ARM_RME_INIT_IPA_REALM",
            bindings::KVM_CAP_ARM_RME_INIT_IPA_REALM,
            &raw as *const _ as u64,
        )
    }

    fn populate_realm(&self, base: u64, size: u64, measure: bool) -> Result<()> {
        let raw = bindings::kvm_cap_arm_rme_populate_realm_args {
            populate_ipa_base: base,
            populate_ipa_size: size,
            flags: if measure {
                bindings::KVM_ARM_RME_POPULATE_FLAGS_MEASURE
            } else {
                0
            },
            ..Default::default()
        };
        self.enable_rme(
            "KVM_CAP_ARM_RME_POPULATE_REALM",
            bindings::KVM_CAP_ARM_RME_POPULATE_REALM,
            &raw as *const _ as u64,
        )
    }
}
