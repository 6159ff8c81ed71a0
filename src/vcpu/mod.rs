//! VCPU creation: target resolution, initialization and feature setup.

mod exit;
mod features;
pub mod target;

pub use exit::{
    handle_exit, handle_unhandled_mmio, ExitOutcome, GuestHypercall, HypercallExit, MmioExit,
    VcpuExit, HYPERCALL_MEM_SHARE, HYPERCALL_MEM_UNSHARE,
};
pub use features::{configure_features, select_features, FeatureRequest, PMU_PPI};
pub use target::{CpuTarget, TargetInitContext, TargetRegistry};

use tracing::{debug, info};

use crate::backend::{cap, feature, VcpuControl, VcpuFeatures, VcpuInit, VmControl};
use crate::error::{Fatal, FatalContext};
use crate::memory::PAGE_SIZE;

/// An initialized VCPU.
///
/// Dropping the handle drops the control handle, which releases the run
/// structure mapping and the VCPU descriptor.
#[derive(Debug)]
pub struct VcpuHandle<V> {
    cpu_id: u32,
    control: V,
    cpu_type: u32,
    compatible: &'static str,
    is_running: bool,
    ring_offset: Option<u64>,
    features: VcpuFeatures,
}

impl<V: VcpuControl> VcpuHandle<V> {
    pub fn cpu_id(&self) -> u32 {
        self.cpu_id
    }

    /// The hypervisor-side VCPU.
    pub fn control(&self) -> &V {
        &self.control
    }

    /// CPU type the VCPU was initialized with. When the hypervisor's
    /// preferred type is unknown this is that type, not the fallback's id.
    pub fn cpu_type(&self) -> u32 {
        self.cpu_type
    }

    /// Compatible string of the selected target.
    pub fn compatible(&self) -> &'static str {
        self.compatible
    }

    pub fn is_running(&self) -> bool {
        self.is_running
    }

    pub fn features(&self) -> VcpuFeatures {
        self.features
    }

    /// Offset of the coalesced MMIO ring inside the run mapping.
    pub fn coalesced_ring_offset(&self) -> Option<u64> {
        self.ring_offset
    }

    /// Address of the coalesced MMIO ring, if the hypervisor has one.
    pub fn coalesced_ring(&self) -> Option<*mut u8> {
        self.ring_offset
            .map(|offset| self.control.run_mapping().wrapping_add(offset as usize))
    }
}

/// Create and initialize VCPU `cpu_id`.
///
/// When the hypervisor can name its preferred CPU type, that type is used
/// directly (with the registry's generic target standing in if the type is
/// unknown). Otherwise every registered target is tried in registration
/// order until one is accepted.
///
/// Any failure leaves the VCPU unusable and is fatal.
pub fn create_vcpu<H: VmControl + ?Sized>(
    vm: &H,
    targets: &TargetRegistry,
    cpu_id: u32,
    request: &FeatureRequest,
) -> Result<VcpuHandle<H::Vcpu>, Fatal> {
    let control = vm
        .create_vcpu(cpu_id)
        .or_fatal(|| format!("create vcpu {cpu_id}"))?;

    let mut init = VcpuInit::default();
    // VCPU 0 is the boot CPU, the others start powered off.
    if cpu_id > 0 {
        init.features.set(feature::POWER_OFF);
    }
    if vm.check_extension(cap::ARM_PSCI_0_2) != 0 {
        init.features.set(feature::PSCI_0_2);
    }
    select_features(vm, request, &mut init);

    let target = match vm.preferred_target() {
        Some(preferred) => {
            let target = match targets.find(preferred) {
                Some(target) => target,
                None => targets.generic().ok_or_else(|| {
                    Fatal::new(format!(
                        "no target for preferred CPU type {preferred} and no generic target"
                    ))
                })?,
            };
            init.target = preferred;
            control
                .init(&init)
                .or_fatal(|| format!("initialize vcpu {cpu_id} as type {preferred}"))?;
            target
        }
        None => probe_targets(&control, targets, &mut init)
            .ok_or_else(|| Fatal::new(format!("no matching target for vcpu {cpu_id}")))?,
    };

    let handle = VcpuHandle {
        cpu_id,
        cpu_type: init.target,
        compatible: target.compatible(),
        is_running: true,
        ring_offset: None,
        features: init.features,
        control,
    };

    target
        .init(&TargetInitContext {
            cpu_id,
            cpu_type: handle.cpu_type,
            compatible: handle.compatible,
            vcpu: &handle.control,
        })
        .or_fatal(|| format!("initialize vcpu {cpu_id}"))?;

    configure_features(&handle.control, &init)
        .or_fatal(|| format!("configure features of vcpu {cpu_id}"))?;

    let ring_pages = vm.check_extension(cap::COALESCED_MMIO);
    let handle = VcpuHandle {
        ring_offset: (ring_pages != 0).then(|| u64::from(ring_pages) * PAGE_SIZE),
        ..handle
    };

    info!(
        target: "armvmm::vcpu",
        "vcpu {} ready: {} (type {})",
        cpu_id,
        handle.compatible,
        handle.cpu_type
    );
    Ok(handle)
}

fn probe_targets<'t, V: VcpuControl>(
    vcpu: &V,
    targets: &'t TargetRegistry,
    init: &mut VcpuInit,
) -> Option<&'t CpuTarget> {
    for target in targets.iter() {
        init.target = target.id();
        match vcpu.init(init) {
            Ok(()) => return Some(target),
            Err(e) => debug!(
                target: "armvmm::vcpu",
                "target {} ({}) rejected: {e}",
                target.id(),
                target.compatible()
            ),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{Call, MockHypervisor};
    use crate::backend::DeviceAttr;
    use crate::error::Result;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    const A: u32 = 10;
    const B: u32 = 11;

    fn noop(_: &TargetInitContext<'_>) -> Result<()> {
        Ok(())
    }

    fn registry_ab() -> TargetRegistry {
        let mut registry = TargetRegistry::new();
        registry.register(CpuTarget::new(A, "test,a", noop)).unwrap();
        registry.register(CpuTarget::new(B, "test,b", noop)).unwrap();
        registry.set_generic(CpuTarget::new(99, "test,generic", noop));
        registry
    }

    fn init_targets(mock: &MockHypervisor) -> Vec<u32> {
        mock.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::VcpuInit { target, .. } => Some(target),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_preferred_target_skips_others() {
        let mock = MockHypervisor::new().with_preferred_target(B);
        let vcpu = create_vcpu(&mock, &registry_ab(), 0, &FeatureRequest::default()).unwrap();

        assert_eq!(init_targets(&mock), vec![B]);
        assert_eq!(vcpu.cpu_type(), B);
        assert_eq!(vcpu.compatible(), "test,b");
        assert!(vcpu.is_running());
    }

    #[test]
    fn test_unknown_preferred_target_uses_generic() {
        let mock = MockHypervisor::new().with_preferred_target(42);
        let vcpu = create_vcpu(&mock, &registry_ab(), 0, &FeatureRequest::default()).unwrap();

        assert_eq!(init_targets(&mock), vec![42]);
        assert_eq!(vcpu.cpu_type(), 42);
        assert_eq!(vcpu.compatible(), "test,generic");
    }

    #[test]
    fn test_unknown_preferred_target_without_generic_is_fatal() {
        let mut registry = TargetRegistry::new();
        registry.register(CpuTarget::new(A, "test,a", noop)).unwrap();
        let mock = MockHypervisor::new().with_preferred_target(42);

        let err = create_vcpu(&mock, &registry, 0, &FeatureRequest::default()).unwrap_err();
        assert!(err.context().contains("generic"));
        assert!(init_targets(&mock).is_empty());
    }

    #[test]
    fn test_probe_in_registration_order() {
        let mock = MockHypervisor::new().accepting_targets(&[B]);
        let vcpu = create_vcpu(&mock, &registry_ab(), 0, &FeatureRequest::default()).unwrap();

        assert_eq!(init_targets(&mock), vec![A, B]);
        assert_eq!(vcpu.cpu_type(), B);
    }

    #[test]
    fn test_probe_stops_at_first_success() {
        let mock = MockHypervisor::new();
        let vcpu = create_vcpu(&mock, &registry_ab(), 0, &FeatureRequest::default()).unwrap();

        assert_eq!(init_targets(&mock), vec![A]);
        assert_eq!(vcpu.compatible(), "test,a");
    }

    #[test]
    fn test_probe_without_match_is_fatal() {
        let mock = MockHypervisor::new().accepting_targets(&[]);
        let err = create_vcpu(&mock, &registry_ab(), 3, &FeatureRequest::default()).unwrap_err();

        assert!(err.context().contains("vcpu 3"));
        assert_eq!(init_targets(&mock), vec![A, B]);
    }

    #[test]
    fn test_secondary_vcpus_start_powered_off() {
        let mock = MockHypervisor::new()
            .with_preferred_target(A)
            .with_extension(cap::ARM_PSCI_0_2, 1);
        let registry = registry_ab();

        let boot = create_vcpu(&mock, &registry, 0, &FeatureRequest::default()).unwrap();
        let secondary = create_vcpu(&mock, &registry, 1, &FeatureRequest::default()).unwrap();

        assert!(!boot.features().contains(feature::POWER_OFF));
        assert!(boot.features().contains(feature::PSCI_0_2));
        assert!(secondary.features().contains(feature::POWER_OFF));
        assert!(secondary.features().contains(feature::PSCI_0_2));
    }

    #[test]
    fn test_init_hook_runs_before_feature_setup() {
        let seen = Arc::new(AtomicU32::new(u32::MAX));
        let hook_seen = seen.clone();
        let mut registry = TargetRegistry::new();
        registry
            .register(CpuTarget::new(A, "test,a", move |ctx| {
                hook_seen.store(ctx.cpu_type, Ordering::SeqCst);
                ctx.vcpu.has_device_attr(DeviceAttr::PVTIME_IPA)
            }))
            .unwrap();
        let mock = MockHypervisor::new()
            .with_preferred_target(A)
            .with_extension(cap::ARM_PMU_V3, 1);
        let request = FeatureRequest {
            pmu: true,
            aarch32: false,
        };

        create_vcpu(&mock, &registry, 0, &request).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), A);

        let calls = mock.calls();
        let hook = calls
            .iter()
            .position(|c| matches!(c, Call::HasDeviceAttr { attr, .. } if *attr == DeviceAttr::PVTIME_IPA))
            .unwrap();
        let pmu = calls
            .iter()
            .position(|c| matches!(c, Call::SetDeviceAttr { attr, .. } if *attr == DeviceAttr::PMU_INIT))
            .unwrap();
        assert!(hook < pmu);
    }

    #[test]
    fn test_init_hook_failure_is_fatal() {
        let mut registry = TargetRegistry::new();
        registry
            .register(CpuTarget::new(A, "test,a", |_| {
                Err(crate::Error::NotSupported("test".into()))
            }))
            .unwrap();
        let mock = MockHypervisor::new().with_preferred_target(A);
        assert!(create_vcpu(&mock, &registry, 0, &FeatureRequest::default()).is_err());
    }

    #[test]
    fn test_coalesced_ring_offset() {
        let mock = MockHypervisor::new()
            .with_preferred_target(A)
            .with_extension(cap::COALESCED_MMIO, 2);
        let vcpu = create_vcpu(&mock, &registry_ab(), 0, &FeatureRequest::default()).unwrap();

        assert_eq!(vcpu.coalesced_ring_offset(), Some(2 * PAGE_SIZE));
        let base = vcpu.control().run_mapping();
        assert_eq!(
            vcpu.coalesced_ring(),
            Some(base.wrapping_add(2 * PAGE_SIZE as usize))
        );

        let mock = MockHypervisor::new().with_preferred_target(A);
        let vcpu = create_vcpu(&mock, &registry_ab(), 0, &FeatureRequest::default()).unwrap();
        assert_eq!(vcpu.coalesced_ring(), None);
    }

    #[test]
    fn test_create_failure_is_fatal() {
        let mock = MockHypervisor::new();
        mock.fail_when(|call| matches!(call, Call::CreateVcpu(_)));
        let err = create_vcpu(&mock, &registry_ab(), 0, &FeatureRequest::default()).unwrap_err();
        assert_eq!(err.context(), "create vcpu 0");
    }
}
