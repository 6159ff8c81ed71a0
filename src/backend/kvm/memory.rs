//! Guest memory slots and attributes of a KVM VM.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use super::bindings::{self, ioctl};
use crate::backend::{GuestMemoryRegistry, MemoryAttributes, MemoryBinding};
use crate::error::{Error, Result};
use crate::memory::GuestMemoryRegion;

#[derive(Debug)]
struct Slot {
    id: u32,
    region: GuestMemoryRegion,
    /// Memory object behind the region, for remapping shared ranges.
    fd: OwnedFd,
}

/// Memory slots of one VM.
///
/// The slot table is shared by every VCPU thread and guarded by a mutex.
#[derive(Debug)]
pub struct KvmMemoryRegistry {
    vm: Arc<OwnedFd>,
    slots: Mutex<Vec<Slot>>,
}

impl KvmMemoryRegistry {
    pub(super) fn new(vm: Arc<OwnedFd>) -> Self {
        Self {
            vm,
            slots: Mutex::new(Vec::new()),
        }
    }

    fn slots(&self) -> Result<MutexGuard<'_, Vec<Slot>>> {
        self.slots
            .lock()
            .map_err(|_| Error::HypervisorError("memory slot table poisoned".into()))
    }

    fn set_region(&self, slot: u32, gpa: u64, size: u64, host: u64) -> Result<()> {
        let region = bindings::kvm_userspace_memory_region {
            slot,
            flags: 0,
            guest_phys_addr: gpa,
            memory_size: size,
            userspace_addr: host,
        };
        // SAFETY: `region` is valid for the duration of the call.
        unsafe { ioctl::kvm_set_user_memory_region(self.vm.as_raw_fd(), &region) }
            .map_err(|e| Error::kvm("KVM_SET_USER_MEMORY_REGION", e))?;
        Ok(())
    }

    /// Find the slot covering `[gpa, gpa + size)` and run `f` on its host
    /// address, memory object and offset for `gpa`.
    fn with_range<T>(
        &self,
        gpa: u64,
        size: u64,
        f: impl FnOnce(u64, BorrowedFd<'_>, u64) -> Result<T>,
    ) -> Result<T> {
        let slots = self.slots()?;
        let slot = slots
            .iter()
            .find(|slot| slot.region.contains_range(gpa, size))
            .ok_or(Error::UnmappedGuestRange { gpa, size })?;
        let host = slot
            .region
            .host_addr_of(gpa)
            .ok_or(Error::InvalidGuestAddress(gpa))?;
        let offset = slot.region.offset + (gpa - slot.region.guest_addr);
        f(host, slot.fd.as_fd(), offset)
    }
}

fn mmap_fixed(host: u64, size: u64, prot: i32, flags: i32, fd: i32, offset: u64) -> Result<()> {
    // SAFETY: `host..host + size` lies inside a mapping registered with the
    // VM, which this registry owns the layout of.
    let addr = unsafe {
        libc::mmap(
            host as *mut libc::c_void,
            size as usize,
            prot,
            flags | libc::MAP_FIXED,
            fd,
            offset as libc::off_t,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

impl GuestMemoryRegistry for KvmMemoryRegistry {
    fn register(&self, binding: MemoryBinding<'_>) -> Result<()> {
        let mut slots = self.slots()?;
        if slots
            .iter()
            .any(|slot| slot.region.overlaps(binding.gpa, binding.size))
        {
            return Err(Error::InvalidGuestAddress(binding.gpa));
        }
        let id = (0..)
            .find(|id| slots.iter().all(|slot| slot.id != *id))
            .unwrap_or(0);
        let fd = binding.fd.try_clone_to_owned()?;

        self.set_region(id, binding.gpa, binding.size, binding.host as u64)?;
        trace!(
            target: "armvmm::memory",
            "slot {id}: {:#x}+{:#x} ({:?})",
            binding.gpa,
            binding.size,
            binding.kind
        );
        slots.push(Slot {
            id,
            region: GuestMemoryRegion::new(
                binding.gpa,
                binding.size,
                binding.host as u64,
                binding.offset,
                binding.kind,
            ),
            fd,
        });
        Ok(())
    }

    fn destroy(&self, gpa: u64, size: u64, host: *mut u8) -> Result<()> {
        let mut slots = self.slots()?;
        let index = slots
            .iter()
            .position(|slot| {
                slot.region.guest_addr == gpa
                    && slot.region.size == size
                    && slot.region.host_addr == host as u64
            })
            .ok_or(Error::UnmappedGuestRange { gpa, size })?;
        // A zero-sized region deletes the slot.
        self.set_region(slots[index].id, gpa, 0, host as u64)?;
        slots.remove(index);
        trace!(target: "armvmm::memory", "removed {gpa:#x}+{size:#x}");
        Ok(())
    }

    fn set_attributes(&self, gpa: u64, size: u64, attributes: MemoryAttributes) -> Result<()> {
        let raw = bindings::kvm_memory_attributes {
            address: gpa,
            size,
            attributes: attributes.bits(),
            flags: 0,
        };
        // SAFETY: `raw` is valid for the duration of the call.
        unsafe { ioctl::kvm_set_memory_attributes(self.vm.as_raw_fd(), &raw) }
            .map_err(|e| Error::kvm("KVM_SET_MEMORY_ATTRIBUTES", e))?;
        Ok(())
    }

    fn map_range(&self, gpa: u64, size: u64) -> Result<()> {
        self.with_range(gpa, size, |host, fd, offset| {
            mmap_fixed(
                host,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                offset,
            )
        })
    }

    fn unmap_range(&self, gpa: u64, size: u64) -> Result<()> {
        self.with_range(gpa, size, |host, _, _| {
            mmap_fixed(
                host,
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        })
    }
}
