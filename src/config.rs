//! Static VM configuration consumed by the core.
//!
//! Everything here is fixed once [`crate::VmBuilder::build`] returns.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Size of the realm personalization value field.
pub const REALM_PERSONALIZATION_SIZE: usize = 64;

/// Hash algorithm used for the realm's initial measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MeasurementAlgo {
    #[default]
    Sha256,
    Sha512,
}

impl MeasurementAlgo {
    /// The value passed to the hypervisor's hash-algorithm parameter.
    pub fn as_raw(self) -> u32 {
        match self {
            MeasurementAlgo::Sha256 => 0,
            MeasurementAlgo::Sha512 => 1,
        }
    }
}

impl FromStr for MeasurementAlgo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(MeasurementAlgo::Sha256),
            "sha512" => Ok(MeasurementAlgo::Sha512),
            _ => Err(Error::UnknownMeasurementAlgo(s.to_string())),
        }
    }
}

impl fmt::Display for MeasurementAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementAlgo::Sha256 => write!(f, "sha256"),
            MeasurementAlgo::Sha512 => write!(f, "sha512"),
        }
    }
}

/// Realm (confidential guest) configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RealmConfig {
    /// Whether the guest is a realm.
    pub enabled: bool,
    /// Measurement hash algorithm.
    pub measurement_algo: MeasurementAlgo,
    /// Realm personalization value, at most [`REALM_PERSONALIZATION_SIZE`] bytes.
    pub personalization: Option<Vec<u8>>,
    /// Do not expose the pvtime steal-time structure to the guest.
    pub no_pvtime: bool,
}

impl RealmConfig {
    /// The personalization value zero-padded to the fixed field size.
    pub fn padded_personalization(&self) -> Result<Option<[u8; REALM_PERSONALIZATION_SIZE]>> {
        let Some(value) = &self.personalization else {
            return Ok(None);
        };
        if value.len() > REALM_PERSONALIZATION_SIZE {
            return Err(Error::PersonalizationTooLong {
                len: value.len(),
                max: REALM_PERSONALIZATION_SIZE,
            });
        }
        let mut rpv = [0u8; REALM_PERSONALIZATION_SIZE];
        rpv[..value.len()].copy_from_slice(value);
        Ok(Some(rpv))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.padded_personalization().map(|_| ())
    }
}

/// Execution state of the guest's VCPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GuestArch {
    #[default]
    Aarch64,
    /// 32-bit EL1 guest on a 64-bit host.
    Aarch32,
}

/// Configuration for creating a VM.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Memory size in megabytes.
    pub memory_mb: u32,
    /// Number of vCPUs.
    pub vcpus: u32,
    /// Back guest RAM with huge pages from this hugetlbfs mount.
    pub hugetlbfs: Option<PathBuf>,
    /// Guest VCPU execution state.
    pub arch: GuestArch,
    /// Protected (pKVM) guest: memory is private unless the guest shares it.
    pub protected: bool,
    /// Expose a PMUv3 to the guest when the host supports it.
    pub pmu: bool,
    /// Realm configuration.
    pub realm: RealmConfig,
}

impl VmConfig {
    /// Guest RAM size in bytes.
    pub fn memory_size(&self) -> u64 {
        u64::from(self.memory_mb) << 20
    }

    /// Whether the guest is a realm.
    pub fn is_realm(&self) -> bool {
        self.arch == GuestArch::Aarch64 && self.realm.enabled
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            memory_mb: 128,
            vcpus: 1,
            hugetlbfs: None,
            arch: GuestArch::Aarch64,
            protected: false,
            pmu: false,
            realm: RealmConfig::default(),
        }
    }
}
