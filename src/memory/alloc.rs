//! Aligned guest memory allocation.
//!
//! Every guest memory region is backed by a memfd so the same pages can be
//! handed to the hypervisor and re-mapped by the monitor. Allocation reserves
//! `size + align` bytes of address space with no access rights, maps the
//! memfd over the aligned part of the reservation and releases the rest, so
//! the aligned address can never be taken by another mapping in between.

use std::ffi::{CStr, CString};
use std::io;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

use super::align_up;

const HUGETLBFS_MAGIC: u32 = 0x9584_58f6;
const MFD_HUGE_SHIFT: u32 = 26;
const MEMFD_NAME: &CStr = c"armvmm";

/// Errors returned by [`allocate`].
#[derive(Error, Debug)]
pub enum AllocError {
    #[error("can't stat {path}")]
    Statfs {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0} is not hugetlbfs")]
    NotHugetlbfs(PathBuf),

    #[error("can't use hugetlbfs page size {block_size} for memory size {size}")]
    UnusableHugePageSize { block_size: u64, size: u64 },

    #[error("huge page size {0} is not a power of 2")]
    HugePageSizeNotPowerOfTwo(u64),

    #[error("alignment 0x{0:x} is not a power of 2")]
    InvalidAlignment(u64),

    #[error("allocation size must be greater than 0")]
    ZeroSize,

    #[error("failed to reserve 0x{size:x} bytes of address space")]
    Reserve {
        size: u64,
        #[source]
        source: io::Error,
    },

    #[error("memfd_create failed")]
    Memfd(#[source] io::Error),

    #[error("can't ftruncate memory object to 0x{size:x} bytes")]
    Truncate {
        size: u64,
        #[source]
        source: io::Error,
    },

    #[error("failed to map 0x{size:x} bytes at the aligned address")]
    Map {
        size: u64,
        #[source]
        source: io::Error,
    },
}

impl AllocError {
    /// Whether the error reflects a misconfiguration the VM cannot continue
    /// past, as opposed to resource exhaustion the caller may degrade from.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AllocError::Statfs { .. }
                | AllocError::NotHugetlbfs(_)
                | AllocError::UnusableHugePageSize { .. }
                | AllocError::HugePageSizeNotPowerOfTwo(_)
                | AllocError::InvalidAlignment(_)
        )
    }
}

/// The host's base page size.
pub fn base_page_size() -> u64 {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
    let s = PAGE_SIZE.load(Ordering::Relaxed);
    if s != 0 {
        s as u64
    } else {
        // SAFETY: sysconf has no memory safety requirements.
        let s = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        PAGE_SIZE.store(s, Ordering::Relaxed);
        s as u64
    }
}

/// A process-local mapping of a memfd, usable as guest memory.
///
/// Dropping the region unmaps it and then closes the memfd.
#[derive(Debug)]
pub struct MappedRegion {
    /// Start of the mapping, aligned as requested.
    ptr: NonNull<u8>,
    /// Size of the mapping in bytes.
    size: usize,
    /// Page granularity backing the mapping (base or huge page size).
    page_size: u64,
    /// The memory object behind the mapping.
    fd: OwnedFd,
}

// SAFETY: MappedRegion owns its mapping; the pointer is valid for the
// region's lifetime on any thread. Concurrent guest/monitor access to the
// contents is the guest's responsibility.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Get a raw pointer to the memory region.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Get the size of the memory region in bytes.
    pub fn size(&self) -> u64 {
        self.size as u64
    }

    /// Page granularity the region was allocated with.
    ///
    /// This is the huge page size when backed by hugetlbfs, and decides how
    /// the region must be described to the hypervisor.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// The memfd backing the mapping.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Get a slice view of the memory region.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is readable and `size` bytes long.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    /// Get a mutable slice view of the memory region.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the mapping is writable and `size` bytes long.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    /// Copy `data` into the region at `offset`.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> crate::Result<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= self.size())
            .ok_or(crate::Error::InvalidGuestAddress(offset))?;
        self.as_mut_slice()[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    /// Copy bytes at `offset` out of the region.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> crate::Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|&end| end <= self.size())
            .ok_or(crate::Error::InvalidGuestAddress(offset))?;
        buf.copy_from_slice(&self.as_slice()[offset as usize..end as usize]);
        Ok(())
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: unmapping the range this region owns. The memfd is closed
        // afterwards when `fd` is dropped.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.size);
        }
    }
}

/// Allocate `size` bytes of guest memory aligned to `align`.
///
/// With `hugetlbfs`, the region is backed by huge pages of that mount's block
/// size and `size` must be at least one huge page. `align` of 0 (or anything
/// up to the base page size) means page alignment.
pub fn allocate(
    size: u64,
    align: u64,
    hugetlbfs: Option<&Path>,
) -> Result<MappedRegion, AllocError> {
    if size == 0 {
        return Err(AllocError::ZeroSize);
    }
    if align != 0 && !align.is_power_of_two() {
        return Err(AllocError::InvalidAlignment(align));
    }

    let base_page = base_page_size();
    let page_size = match hugetlbfs {
        Some(path) => {
            let block_size = hugepage_block_size(path)?;
            if block_size == 0 || block_size > size {
                return Err(AllocError::UnusableHugePageSize { block_size, size });
            }
            if !block_size.is_power_of_two() {
                return Err(AllocError::HugePageSizeNotPowerOfTwo(block_size));
            }
            Some(block_size)
        }
        None => None,
    };

    let granule = page_size.unwrap_or(base_page);
    let size = align_up(size, granule);
    let align = align.max(granule);
    // mmap already returns base-page aligned addresses.
    let slack = if align > base_page { align } else { 0 };
    let total = size + slack;

    // SAFETY: reserving fresh address space; nothing else refers to it.
    let reservation = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            total as usize,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if reservation == libc::MAP_FAILED {
        return Err(AllocError::Reserve {
            size: total,
            source: io::Error::last_os_error(),
        });
    }
    let release = |start: u64, len: u64| {
        if len != 0 {
            // SAFETY: releasing part of the reservation made above.
            unsafe { libc::munmap(start as *mut libc::c_void, len as usize) };
        }
    };

    let fd = match memfd_alloc(size, page_size) {
        Ok(fd) => fd,
        Err(err) => {
            release(reservation as u64, total);
            return Err(err);
        }
    };

    let aligned = align_up(reservation as u64, align);
    // SAFETY: [aligned, aligned + size) lies inside the reservation we own.
    let mapped = unsafe {
        libc::mmap(
            aligned as *mut libc::c_void,
            size as usize,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            std::os::fd::AsRawFd::as_raw_fd(&fd),
            0,
        )
    };
    if mapped == libc::MAP_FAILED {
        let source = io::Error::last_os_error();
        release(reservation as u64, total);
        return Err(AllocError::Map { size, source });
    }

    let prefix = aligned - reservation as u64;
    release(reservation as u64, prefix);
    release(aligned + size, slack - prefix);

    tracing::debug!(
        page_size = granule,
        "allocated guest memory {:#x}+{:#x} (align {:#x})",
        aligned,
        size,
        align
    );

    Ok(MappedRegion {
        // SAFETY: a successful MAP_FIXED mmap returns the non-null `aligned`.
        ptr: unsafe { NonNull::new_unchecked(mapped.cast()) },
        size: size as usize,
        page_size: granule,
        fd,
    })
}

fn hugepage_block_size(path: &Path) -> Result<u64, AllocError> {
    let statfs_err = |source| AllocError::Statfs {
        path: path.to_path_buf(),
        source,
    };
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| statfs_err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

    // SAFETY: statfs only writes into the zeroed buffer we pass.
    let mut sfs: libc::statfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statfs(c_path.as_ptr(), &mut sfs) } < 0 {
        return Err(statfs_err(io::Error::last_os_error()));
    }

    if sfs.f_type as u32 != HUGETLBFS_MAGIC {
        return Err(AllocError::NotHugetlbfs(path.to_path_buf()));
    }
    Ok(sfs.f_bsize as u64)
}

/// Create a memfd of `size` bytes, huge-page backed when `huge_page_size` is set.
fn memfd_alloc(size: u64, huge_page_size: Option<u64>) -> Result<OwnedFd, AllocError> {
    let mut flags = libc::MFD_CLOEXEC;
    if let Some(block_size) = huge_page_size {
        flags |= libc::MFD_HUGETLB | (block_size.trailing_zeros() << MFD_HUGE_SHIFT);
    }

    // SAFETY: MEMFD_NAME is a valid C string.
    let raw = unsafe { libc::memfd_create(MEMFD_NAME.as_ptr(), flags) };
    if raw < 0 {
        return Err(AllocError::Memfd(io::Error::last_os_error()));
    }
    // SAFETY: memfd_create returned a new descriptor we now own.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    // SAFETY: ftruncate on a descriptor we own.
    if unsafe { libc::ftruncate(raw, size as libc::off_t) } < 0 {
        return Err(AllocError::Truncate {
            size,
            source: io::Error::last_os_error(),
        });
    }
    Ok(fd)
}
