//! Decoding and dispatch of the VCPU exits this crate handles.

use tracing::{trace, warn};

use crate::backend::{GuestMemoryRegistry, VcpuControl};
use crate::error::{Fatal, FatalContext};
use crate::memory::{AttributeController, MemoryFault};

/// Guest hypercall: share a page with the host.
pub const HYPERCALL_MEM_SHARE: u64 = 3;
/// Guest hypercall: stop sharing a page with the host.
pub const HYPERCALL_MEM_UNSHARE: u64 = 4;

/// A hypercall forwarded to the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HypercallExit {
    pub nr: u64,
    pub args: [u64; 6],
}

/// An MMIO access no device claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioExit {
    pub addr: u64,
    pub data: [u8; 8],
    pub len: u32,
    pub is_write: bool,
}

/// Why a VCPU stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuExit {
    Hypercall(HypercallExit),
    MemoryFault(MemoryFault),
    Mmio(MmioExit),
    /// Any other exit reason, left to the generic run loop.
    Other(u32),
}

/// Hypercalls the monitor services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestHypercall {
    MemShare { gpa: u64 },
    MemUnshare { gpa: u64 },
    Unrecognized(u64),
}

impl From<&HypercallExit> for GuestHypercall {
    fn from(call: &HypercallExit) -> Self {
        match call.nr {
            HYPERCALL_MEM_SHARE => GuestHypercall::MemShare { gpa: call.args[0] },
            HYPERCALL_MEM_UNSHARE => GuestHypercall::MemUnshare { gpa: call.args[0] },
            nr => GuestHypercall::Unrecognized(nr),
        }
    }
}

/// Whether [`handle_exit`] consumed the exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Handled,
    Unhandled,
}

/// Handle the exit currently recorded for `vcpu`.
///
/// Hypercalls and memory faults are serviced through `attributes`; any
/// other exit is left to the caller.
pub fn handle_exit<V, R>(
    vcpu: &V,
    attributes: &AttributeController<'_, R>,
) -> Result<ExitOutcome, Fatal>
where
    V: VcpuControl + ?Sized,
    R: GuestMemoryRegistry + ?Sized,
{
    match vcpu.exit() {
        VcpuExit::Hypercall(call) => {
            match GuestHypercall::from(&call) {
                GuestHypercall::MemShare { gpa } => {
                    let ret = attributes.share(gpa)?;
                    vcpu.set_hypercall_return(ret as u64);
                }
                GuestHypercall::MemUnshare { gpa } => {
                    let ret = attributes.unshare(gpa)?;
                    vcpu.set_hypercall_return(ret as u64);
                }
                GuestHypercall::Unrecognized(nr) => {
                    warn!(
                        "unhandled hypercall {nr:#x} args {:#x} {:#x}",
                        call.args[0], call.args[1]
                    );
                }
            }
            Ok(ExitOutcome::Handled)
        }
        VcpuExit::MemoryFault(fault) => {
            attributes.memory_fault(&fault)?;
            Ok(ExitOutcome::Handled)
        }
        VcpuExit::Mmio(_) | VcpuExit::Other(_) => Ok(ExitOutcome::Unhandled),
    }
}

/// React to an MMIO access that no device handled.
///
/// A realm cannot be emulated around, so it gets an external abort.
pub fn handle_unhandled_mmio<V: VcpuControl + ?Sized>(vcpu: &V, is_realm: bool) -> Result<(), Fatal> {
    if !is_realm {
        return Ok(());
    }
    trace!(target: "armvmm::vcpu", "injecting external abort for unhandled MMIO");
    vcpu.inject_external_abort()
        .or_fatal(|| "inject external data abort".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{Call, LogCapture, MockHypervisor};
    use crate::backend::{MemoryAttributes, VmControl};
    use crate::memory::attributes::MEMORY_FAULT_PRIVATE;
    use crate::memory::PAGE_SIZE;

    fn hypercall(nr: u64, gpa: u64) -> VcpuExit {
        VcpuExit::Hypercall(HypercallExit {
            nr,
            args: [gpa, 0, 0, 0, 0, 0],
        })
    }

    #[test]
    fn test_decode_hypercalls() {
        let call = HypercallExit {
            nr: HYPERCALL_MEM_SHARE,
            args: [0x1000, 0, 0, 0, 0, 0],
        };
        assert_eq!(
            GuestHypercall::from(&call),
            GuestHypercall::MemShare { gpa: 0x1000 }
        );
        let call = HypercallExit { nr: 0x99, ..call };
        assert_eq!(GuestHypercall::from(&call), GuestHypercall::Unrecognized(0x99));
    }

    #[test]
    fn test_share_hypercall_sets_success() {
        let mock = MockHypervisor::new();
        let vcpu = mock.create_vcpu(0).unwrap();
        mock.clear_calls();
        let attributes = AttributeController::new(&mock, true);

        vcpu.set_exit(hypercall(HYPERCALL_MEM_SHARE, 0x8000_0000));
        assert_eq!(handle_exit(&vcpu, &attributes).unwrap(), ExitOutcome::Handled);
        assert_eq!(vcpu.hypercall_ret(), Some(0));
        assert_eq!(mock.calls().len(), 2);

        vcpu.set_exit(hypercall(HYPERCALL_MEM_UNSHARE, 0x8000_0000));
        assert_eq!(handle_exit(&vcpu, &attributes).unwrap(), ExitOutcome::Handled);
        assert_eq!(mock.page_attributes(0x8000_0000), MemoryAttributes::PRIVATE);
    }

    #[test]
    fn test_unrecognized_hypercall_is_ignored() {
        let mock = MockHypervisor::new();
        let vcpu = mock.create_vcpu(0).unwrap();
        mock.clear_calls();
        let attributes = AttributeController::new(&mock, true);
        let capture = LogCapture::new();

        vcpu.set_exit(hypercall(0x42, 0));
        let outcome = capture.run(|| handle_exit(&vcpu, &attributes).unwrap());
        assert_eq!(outcome, ExitOutcome::Handled);
        assert_eq!(vcpu.hypercall_ret(), None);
        assert!(mock.calls().is_empty());
        assert_eq!(capture.warnings().len(), 1);
    }

    #[test]
    fn test_memory_fault_exit() {
        let mock = MockHypervisor::new();
        let vcpu = mock.create_vcpu(0).unwrap();
        mock.clear_calls();
        let attributes = AttributeController::new(&mock, true);

        vcpu.set_exit(VcpuExit::MemoryFault(MemoryFault {
            flags: MEMORY_FAULT_PRIVATE,
            gpa: 0x8000_0000,
            size: PAGE_SIZE,
        }));
        assert_eq!(handle_exit(&vcpu, &attributes).unwrap(), ExitOutcome::Handled);
        assert_eq!(
            mock.calls()[0],
            Call::UnmapRange {
                gpa: 0x8000_0000,
                size: PAGE_SIZE,
            }
        );
    }

    #[test]
    fn test_other_exits_are_unhandled() {
        let mock = MockHypervisor::new();
        let vcpu = mock.create_vcpu(0).unwrap();
        let attributes = AttributeController::new(&mock, true);

        vcpu.set_exit(VcpuExit::Other(17));
        assert_eq!(handle_exit(&vcpu, &attributes).unwrap(), ExitOutcome::Unhandled);
        vcpu.set_exit(VcpuExit::Mmio(MmioExit {
            addr: 0x1000,
            data: [0; 8],
            len: 4,
            is_write: false,
        }));
        assert_eq!(handle_exit(&vcpu, &attributes).unwrap(), ExitOutcome::Unhandled);
    }

    #[test]
    fn test_unhandled_mmio_aborts_realm_only() {
        let mock = MockHypervisor::new();
        let vcpu = mock.create_vcpu(2).unwrap();
        mock.clear_calls();

        handle_unhandled_mmio(&vcpu, false).unwrap();
        assert!(mock.calls().is_empty());

        handle_unhandled_mmio(&vcpu, true).unwrap();
        assert_eq!(mock.calls(), vec![Call::InjectAbort { cpu: 2 }]);
    }
}
