//! Optional VCPU features negotiated at init time.

use tracing::debug;

use crate::backend::{cap, feature, DeviceAttr, VcpuControl, VcpuInit, VmControl};
use crate::config::{GuestArch, VmConfig};
use crate::error::Result;

/// GIC interrupt ID of the PMUv3 overflow interrupt.
///
/// A PPI, so every VCPU uses the same number.
pub const PMU_PPI: u64 = 23;

/// Optional features requested for every VCPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureRequest {
    /// Expose PMUv3 when the host has it.
    pub pmu: bool,
    /// Run EL1 in AArch32 state.
    pub aarch32: bool,
}

impl FeatureRequest {
    pub fn from_config(config: &VmConfig) -> Self {
        Self {
            pmu: config.pmu,
            aarch32: config.arch == GuestArch::Aarch32,
        }
    }
}

/// Add the requested optional features to `init`.
///
/// The PMU is only requested when the hypervisor supports it.
pub fn select_features<H: VmControl + ?Sized>(
    vm: &H,
    request: &FeatureRequest,
    init: &mut VcpuInit,
) {
    if request.aarch32 {
        init.features.set(feature::EL1_32BIT);
    }
    if request.pmu {
        if vm.check_extension(cap::ARM_PMU_V3) != 0 {
            init.features.set(feature::PMU_V3);
        } else {
            debug!(target: "armvmm::vcpu", "PMUv3 requested but not supported");
        }
    }
}

/// Finish setting up features negotiated in `init` on an initialized VCPU.
pub fn configure_features<V: VcpuControl + ?Sized>(vcpu: &V, init: &VcpuInit) -> Result<()> {
    if init.features.contains(feature::PMU_V3) {
        vcpu.has_device_attr(DeviceAttr::PMU_IRQ)?;
        vcpu.set_device_attr(DeviceAttr::PMU_IRQ, Some(PMU_PPI))?;
        vcpu.set_device_attr(DeviceAttr::PMU_INIT, None)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{Call, MockHypervisor};

    #[test]
    fn test_pmu_only_when_supported() {
        let request = FeatureRequest {
            pmu: true,
            aarch32: false,
        };

        let mut init = VcpuInit::default();
        select_features(&MockHypervisor::new(), &request, &mut init);
        assert!(!init.features.contains(feature::PMU_V3));

        let mock = MockHypervisor::new().with_extension(cap::ARM_PMU_V3, 1);
        let mut init = VcpuInit::default();
        select_features(&mock, &request, &mut init);
        assert!(init.features.contains(feature::PMU_V3));
        assert!(!init.features.contains(feature::EL1_32BIT));
    }

    #[test]
    fn test_aarch32_from_config() {
        let config = VmConfig {
            arch: GuestArch::Aarch32,
            ..VmConfig::default()
        };
        let request = FeatureRequest::from_config(&config);
        assert!(request.aarch32);

        let mut init = VcpuInit::default();
        select_features(&MockHypervisor::new(), &request, &mut init);
        assert!(init.features.contains(feature::EL1_32BIT));
    }

    #[test]
    fn test_configure_pmu_sets_irq_then_init() {
        let mock = MockHypervisor::new();
        let vcpu = mock.create_vcpu(0).unwrap();
        let mut init = VcpuInit::default();
        init.features.set(feature::PMU_V3);
        mock.clear_calls();

        configure_features(&vcpu, &init).unwrap();
        assert_eq!(
            mock.calls(),
            vec![
                Call::HasDeviceAttr {
                    cpu: 0,
                    attr: DeviceAttr::PMU_IRQ,
                },
                Call::SetDeviceAttr {
                    cpu: 0,
                    attr: DeviceAttr::PMU_IRQ,
                    value: Some(23),
                },
                Call::SetDeviceAttr {
                    cpu: 0,
                    attr: DeviceAttr::PMU_INIT,
                    value: None,
                },
            ]
        );
    }

    #[test]
    fn test_pmu_irq_is_a_ppi_shared_by_all_vcpus() {
        let mock = MockHypervisor::new();
        let mut init = VcpuInit::default();
        init.features.set(feature::PMU_V3);
        for cpu in 0..2 {
            let vcpu = mock.create_vcpu(cpu).unwrap();
            configure_features(&vcpu, &init).unwrap();
        }

        let irqs: Vec<_> = mock
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::SetDeviceAttr {
                    cpu,
                    attr: DeviceAttr::PMU_IRQ,
                    value,
                } => Some((cpu, value)),
                _ => None,
            })
            .collect();
        assert_eq!(irqs, vec![(0, Some(PMU_PPI)), (1, Some(PMU_PPI))]);
        assert!((16..32).contains(&PMU_PPI));
    }

    #[test]
    fn test_configure_without_features_is_noop() {
        let mock = MockHypervisor::new();
        let vcpu = mock.create_vcpu(1).unwrap();
        mock.clear_calls();
        configure_features(&vcpu, &VcpuInit::default()).unwrap();
        assert!(mock.calls().is_empty());
    }
}
