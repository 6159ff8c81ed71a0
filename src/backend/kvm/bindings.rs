//! KVM definitions the `kvm-bindings` crate does not carry.
//!
//! The generic UAPI structures come from `kvm_bindings`. What is declared
//! here is the Arm CCA (RME) extension to `KVM_ENABLE_CAP`, the arm64 VM
//! type bits and the ioctl wrappers.

#![allow(non_camel_case_types)]

pub use kvm_bindings::{
    kvm_device_attr, kvm_enable_cap, kvm_memory_attributes, kvm_run, kvm_userspace_memory_region,
    kvm_vcpu_events, kvm_vcpu_init, KVM_EXIT_HYPERCALL, KVM_EXIT_MEMORY_FAULT, KVM_EXIT_MMIO,
};

/// `KVM_CAP_ARM_RME` sub-operations, passed in `kvm_enable_cap::args[0]`.
pub const KVM_CAP_ARM_RME_CONFIG_REALM: u64 = 0;
pub const KVM_CAP_ARM_RME_CREATE_RD: u64 = 1;
pub const KVM_CAP_ARM_RME_INIT_IPA_REALM: u64 = 2;
pub const KVM_CAP_ARM_RME_POPULATE_REALM: u64 = 3;

/// Populate flag: extend the realm measurement with the populated data.
pub const KVM_ARM_RME_POPULATE_FLAGS_MEASURE: u32 = 1 << 0;

/// Realm VM type bit.
pub const KVM_VM_TYPE_ARM_REALM: u64 = 1 << 8;
/// Protected (pKVM) VM type bit.
pub const KVM_VM_TYPE_ARM_PROTECTED: u64 = 1 << 31;
/// Mask of the IPA size field of the VM type.
pub const KVM_VM_TYPE_ARM_IPA_SIZE_MASK: u64 = 0xff;
/// Largest IPA size requested for a guest.
pub const MAX_GUEST_IPA_BITS: u32 = 40;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct kvm_cap_arm_rme_config_item {
    pub cfg: u32,
    /// `rpv[64]` or `hash_algo: u32`, depending on `cfg`.
    pub data: [u8; 256],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct kvm_cap_arm_rme_populate_realm_args {
    pub populate_ipa_base: u64,
    pub populate_ipa_size: u64,
    pub flags: u32,
    pub reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct kvm_cap_arm_rme_init_ipa_args {
    pub init_ipa_base: u64,
    pub init_ipa_size: u64,
    pub reserved: [u32; 4],
}

pub mod ioctl {
    use kvm_bindings::*;
    use nix::{ioctl_read, ioctl_write_int_bad, ioctl_write_ptr, request_code_none};

    const KVMIO: u8 = 0xae;

    /// KVM_CREATE_VM. The VM type is an unsigned long whose top bits carry
    /// flags, so it cannot go through the `c_int` the nix helpers take.
    ///
    /// # Safety
    ///
    /// `fd` must be an open `/dev/kvm` descriptor.
    pub unsafe fn kvm_create_vm(fd: libc::c_int, vm_type: u64) -> nix::Result<libc::c_int> {
        let ret = libc::ioctl(
            fd,
            request_code_none!(KVMIO, 0x01) as nix::sys::ioctl::ioctl_num_type,
            vm_type as libc::c_ulong,
        );
        nix::errno::Errno::result(ret)
    }

    ioctl_write_int_bad!(kvm_check_extension, request_code_none!(KVMIO, 0x03));
    ioctl_write_int_bad!(kvm_get_vcpu_mmap_size, request_code_none!(KVMIO, 0x04));
    ioctl_write_int_bad!(kvm_create_vcpu, request_code_none!(KVMIO, 0x41));
    ioctl_write_ptr!(
        kvm_set_user_memory_region,
        KVMIO,
        0x46,
        kvm_userspace_memory_region
    );
    ioctl_write_ptr!(kvm_set_vcpu_events, KVMIO, 0xa0, kvm_vcpu_events);
    ioctl_write_ptr!(kvm_enable_cap, KVMIO, 0xa3, kvm_enable_cap);
    ioctl_write_ptr!(kvm_arm_vcpu_init, KVMIO, 0xae, kvm_vcpu_init);
    ioctl_read!(kvm_arm_preferred_target, KVMIO, 0xaf, kvm_vcpu_init);
    ioctl_write_ptr!(kvm_set_memory_attributes, KVMIO, 0xd2, kvm_memory_attributes);
    ioctl_write_ptr!(kvm_set_device_attr, KVMIO, 0xe1, kvm_device_attr);
    ioctl_write_ptr!(kvm_has_device_attr, KVMIO, 0xe3, kvm_device_attr);
}
