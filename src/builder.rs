//! VM builder for producing a validated [`VmConfig`].

use std::path::PathBuf;

use crate::config::{GuestArch, MeasurementAlgo, RealmConfig, VmConfig};
use crate::error::{Error, Result};

/// Builder for a [`VmConfig`].
///
/// # Example
///
/// ```rust,no_run
/// use armvmm::{MeasurementAlgo, VmBuilder};
///
/// let config = VmBuilder::new()
///     .memory_mb(256)
///     .vcpus(2)
///     .realm(true)
///     .measurement_algo(MeasurementAlgo::Sha512)
///     .personalization(b"tenant-42".to_vec())
///     .build()?;
/// # Ok::<(), armvmm::Error>(())
/// ```
#[derive(Default)]
pub struct VmBuilder {
    memory_mb: Option<u32>,
    vcpus: Option<u32>,
    hugetlbfs: Option<PathBuf>,
    aarch32: bool,
    protected: bool,
    pmu: bool,
    realm: RealmConfig,
}

impl VmBuilder {
    /// Create a new VM builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the amount of guest memory in megabytes.
    ///
    /// Default: 128 MB
    pub fn memory_mb(mut self, mb: u32) -> Self {
        self.memory_mb = Some(mb);
        self
    }

    /// Set the number of virtual CPUs.
    ///
    /// Default: 1
    pub fn vcpus(mut self, count: u32) -> Self {
        self.vcpus = Some(count);
        self
    }

    /// Back guest RAM with huge pages from the given hugetlbfs mount.
    pub fn hugetlbfs(mut self, path: impl Into<PathBuf>) -> Self {
        self.hugetlbfs = Some(path.into());
        self
    }

    /// Run the guest's VCPUs in 32-bit EL1.
    pub fn aarch32(mut self, enable: bool) -> Self {
        self.aarch32 = enable;
        self
    }

    /// Create a protected (pKVM) guest.
    pub fn protected(mut self, enable: bool) -> Self {
        self.protected = enable;
        self
    }

    /// Request a PMUv3 for every VCPU.
    pub fn pmu(mut self, enable: bool) -> Self {
        self.pmu = enable;
        self
    }

    /// Create the guest as a realm.
    pub fn realm(mut self, enable: bool) -> Self {
        self.realm.enabled = enable;
        self
    }

    /// Set the realm measurement algorithm.
    ///
    /// Default: SHA-256
    pub fn measurement_algo(mut self, algo: MeasurementAlgo) -> Self {
        self.realm.measurement_algo = algo;
        self
    }

    /// Set the realm personalization value.
    pub fn personalization(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.realm.personalization = Some(value.into());
        self
    }

    /// Do not expose pvtime steal-time accounting to the guest.
    pub fn no_pvtime(mut self, disable: bool) -> Self {
        self.realm.no_pvtime = disable;
        self
    }

    /// Validate the settings and produce the VM configuration.
    pub fn build(self) -> Result<VmConfig> {
        let memory_mb = self.memory_mb.unwrap_or(128);
        if memory_mb == 0 {
            return Err(Error::InvalidMemorySize(memory_mb));
        }

        let vcpus = self.vcpus.unwrap_or(1);
        if vcpus == 0 {
            return Err(Error::InvalidVcpuCount(vcpus));
        }

        if let Some(ref path) = self.hugetlbfs {
            if !path.exists() {
                return Err(Error::HugetlbfsNotFound(path.clone()));
            }
        }

        self.realm.validate()?;
        if self.realm.enabled && self.protected {
            return Err(Error::ConflictingConfig(
                "a guest cannot be both a realm and a protected guest",
            ));
        }
        if self.realm.enabled && self.aarch32 {
            return Err(Error::ConflictingConfig("realm guests must be 64-bit"));
        }

        Ok(VmConfig {
            memory_mb,
            vcpus,
            hugetlbfs: self.hugetlbfs,
            arch: if self.aarch32 {
                GuestArch::Aarch32
            } else {
                GuestArch::Aarch64
            },
            protected: self.protected,
            pmu: self.pmu,
            realm: self.realm,
        })
    }
}
