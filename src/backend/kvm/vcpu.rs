//! KVM VCPU file descriptor and its shared run structure.

use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr::NonNull;

use super::bindings::{self, ioctl};
use crate::backend::{DeviceAttr, VcpuControl, VcpuInit};
use crate::error::{Error, Result};
use crate::memory::MemoryFault;
use crate::vcpu::{HypercallExit, MmioExit, VcpuExit};

/// A KVM VCPU.
///
/// Dropping it unmaps the run structure and closes the VCPU descriptor.
#[derive(Debug)]
pub struct KvmVcpu {
    id: u32,
    fd: OwnedFd,
    run: NonNull<bindings::kvm_run>,
    run_size: usize,
}

// SAFETY: the run mapping belongs to this VCPU; KVM only writes it while
// the owning thread is inside KVM_RUN.
unsafe impl Send for KvmVcpu {}

impl KvmVcpu {
    /// Map the run structure of a freshly created VCPU descriptor.
    pub(super) fn new(id: u32, fd: OwnedFd, run_size: usize) -> Result<Self> {
        // SAFETY: mapping the VCPU's run structure, which KVM sizes at
        // `run_size` bytes.
        let run = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                run_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if run == libc::MAP_FAILED {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let run = NonNull::new(run.cast::<bindings::kvm_run>()).ok_or_else(|| {
            Error::HypervisorError(format!("vcpu {id} run structure mapped at null"))
        })?;
        Ok(Self {
            id,
            fd,
            run,
            run_size,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    fn run(&self) -> &bindings::kvm_run {
        // SAFETY: the mapping is at least `run_size` bytes, which covers a
        // kvm_run, and KVM does not write it while this thread is outside
        // KVM_RUN.
        unsafe { self.run.as_ref() }
    }

    fn attr(attr: DeviceAttr, addr: u64) -> bindings::kvm_device_attr {
        bindings::kvm_device_attr {
            flags: 0,
            group: attr.group,
            attr: attr.attr,
            addr,
        }
    }
}

impl VcpuControl for KvmVcpu {
    fn init(&self, init: &VcpuInit) -> Result<()> {
        let raw = bindings::kvm_vcpu_init {
            target: init.target,
            features: init.features.words(),
        };
        // SAFETY: `raw` is a valid kvm_vcpu_init for the duration of the call.
        unsafe { ioctl::kvm_arm_vcpu_init(self.fd.as_raw_fd(), &raw) }
            .map_err(|e| Error::kvm("KVM_ARM_VCPU_INIT", e))?;
        Ok(())
    }

    fn has_device_attr(&self, attr: DeviceAttr) -> Result<()> {
        let raw = Self::attr(attr, 0);
        // SAFETY: `raw` is a valid kvm_device_attr for the duration of the call.
        unsafe { ioctl::kvm_has_device_attr(self.fd.as_raw_fd(), &raw) }
            .map_err(|e| Error::kvm("KVM_HAS_DEVICE_ATTR", e))?;
        Ok(())
    }

    fn set_device_attr(&self, attr: DeviceAttr, value: Option<u64>) -> Result<()> {
        let addr = value
            .as_ref()
            .map_or(0, |value| value as *const u64 as u64);
        let raw = Self::attr(attr, addr);
        // SAFETY: `raw` and the value it points at outlive the call.
        unsafe { ioctl::kvm_set_device_attr(self.fd.as_raw_fd(), &raw) }
            .map_err(|e| Error::kvm("KVM_SET_DEVICE_ATTR", e))?;
        Ok(())
    }

    fn inject_external_abort(&self) -> Result<()> {
        let mut events = bindings::kvm_vcpu_events::default();
        events.exception.ext_dabt_pending = 1;
        // SAFETY: `events` is a valid kvm_vcpu_events for the duration of
        // the call.
        unsafe { ioctl::kvm_set_vcpu_events(self.fd.as_raw_fd(), &events) }
            .map_err(|e| Error::kvm("KVM_SET_VCPU_EVENTS", e))?;
        Ok(())
    }

    fn run_mapping(&self) -> *mut u8 {
        self.run.as_ptr().cast()
    }

    fn exit(&self) -> VcpuExit {
        let run = self.run();
        match run.exit_reason {
            bindings::KVM_EXIT_HYPERCALL => {
                // SAFETY: the exit reason selects the hypercall record.
                let hypercall = unsafe { &run.__bindgen_anon_1.hypercall };
                VcpuExit::Hypercall(HypercallExit {
                    nr: hypercall.nr,
                    args: hypercall.args,
                })
            }
            bindings::KVM_EXIT_MEMORY_FAULT => {
                // SAFETY: the exit reason selects the memory fault record.
                let fault = unsafe { &run.__bindgen_anon_1.memory_fault };
                VcpuExit::MemoryFault(MemoryFault {
                    flags: fault.flags,
                    gpa: fault.gpa,
                    size: fault.size,
                })
            }
            bindings::KVM_EXIT_MMIO => {
                // SAFETY: the exit reason selects the MMIO record.
                let mmio = unsafe { &run.__bindgen_anon_1.mmio };
                VcpuExit::Mmio(MmioExit {
                    addr: mmio.phys_addr,
                    data: mmio.data,
                    len: mmio.len,
                    is_write: mmio.is_write != 0,
                })
            }
            reason => VcpuExit::Other(reason),
        }
    }

    fn set_hypercall_return(&self, ret: u64) {
        let run = self.run.as_ptr();
        // SAFETY: `run` points at this VCPU's mapped kvm_run; only the
        // hypercall record's return field is written.
        unsafe {
            std::ptr::addr_of_mut!((*run).__bindgen_anon_1.hypercall.ret).write_volatile(ret)
        }
    }
}

impl Drop for KvmVcpu {
    fn drop(&mut self) {
        // SAFETY: unmapping the run structure this VCPU owns; the
        // descriptor closes afterwards when `fd` drops.
        unsafe {
            libc::munmap(self.run.as_ptr().cast(), self.run_size);
        }
    }
}
