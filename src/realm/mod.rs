//! Realm (Arm CCA) guest setup.
//!
//! A realm's initial memory contents are measured by the hypervisor, so RAM
//! cannot be handed over piecemeal while images are loaded. Regions are
//! buffered in a [`RamLedger`] and handed over in one pass by
//! [`RealmSupport::finalize`], after the realm's configuration is fixed.

mod ledger;

pub use ledger::{RamLedger, RamRegion};

use tracing::{debug, info};

use crate::backend::{RealmConfigItem, RealmControl};
use crate::config::{RealmConfig, VmConfig};
use crate::error::{Error, Fatal, FatalContext, Result};

/// Progress of realm creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealmState {
    /// Parameters may still be set and RAM regions added.
    Unconfigured,
    /// The realm descriptor exists; its configuration is sealed.
    DescriptorCreated,
    /// Every buffered RAM region has been handed to the realm.
    Populated,
}

impl std::fmt::Display for RealmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RealmState::Unconfigured => write!(f, "Unconfigured"),
            RealmState::DescriptorCreated => write!(f, "DescriptorCreated"),
            RealmState::Populated => write!(f, "Populated"),
        }
    }
}

/// Realm handling for one VM.
pub trait RealmSupport: Send {
    /// Whether the guest is a realm.
    fn is_realm(&self) -> bool;

    /// Buffer a loaded RAM region. `file_size` bytes from `start` hold the
    /// loaded content, `mem_size` bytes are reserved for it in total.
    fn register_ram_region(&mut self, start: u64, file_size: u64, mem_size: u64) -> Result<()>;

    /// Configure the realm, create its descriptor and hand over every
    /// buffered RAM region. Must run exactly once, before any VCPU runs.
    fn finalize(&mut self, control: &dyn RealmControl) -> std::result::Result<(), Fatal>;

    fn state(&self) -> RealmState;
}

/// Realm support for guests that are not realms.
#[derive(Debug, Default)]
pub struct NoRealm;

impl RealmSupport for NoRealm {
    fn is_realm(&self) -> bool {
        false
    }

    fn register_ram_region(&mut self, _start: u64, _file_size: u64, _mem_size: u64) -> Result<()> {
        Ok(())
    }

    fn finalize(&mut self, _control: &dyn RealmControl) -> std::result::Result<(), Fatal> {
        Ok(())
    }

    fn state(&self) -> RealmState {
        RealmState::Unconfigured
    }
}

/// An Arm CCA realm.
#[derive(Debug)]
pub struct ArmRealm {
    config: RealmConfig,
    ledger: RamLedger,
    state: RealmState,
    /// Set once finalize has started, successful or not.
    sealed: bool,
}

impl ArmRealm {
    /// Rejects a configuration the realm could not be created with.
    pub fn new(config: RealmConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ledger: RamLedger::new(),
            state: RealmState::Unconfigured,
            sealed: false,
        })
    }

    /// Regions buffered so far.
    pub fn ledger(&self) -> &RamLedger {
        &self.ledger
    }

    fn configure(&self, control: &dyn RealmControl) -> std::result::Result<(), Fatal> {
        let algo = self.config.measurement_algo;
        debug!(target: "armvmm::realm", "measurement algorithm {algo}");
        control
            .configure_realm(RealmConfigItem::HashAlgorithm(algo))
            .or_fatal(|| format!("configure realm hash algorithm {algo}"))?;

        let rpv = self
            .config
            .padded_personalization()
            .or_fatal(|| "realm personalization value".to_string())?;
        if let Some(rpv) = rpv {
            debug!(target: "armvmm::realm", "personalization value set");
            control
                .configure_realm(RealmConfigItem::Personalization(rpv))
                .or_fatal(|| "configure realm personalization value".to_string())?;
        }
        Ok(())
    }

    fn populate(&mut self, control: &dyn RealmControl) -> std::result::Result<(), Fatal> {
        for region in self.ledger.drain() {
            if region.file_size() > 0 {
                debug!(
                    target: "armvmm::realm",
                    "populate {:#x}..{:#x}",
                    region.start,
                    region.file_end
                );
                control
                    .populate_realm(region.start, region.file_size(), true)
                    .or_fatal(|| {
                        format!("populate realm {:#x}..{:#x}", region.start, region.file_end)
                    })?;
            }
            if region.tail_size() > 0 {
                debug!(
                    target: "armvmm::realm",
                    "init IPA {:#x}..{:#x}",
                    region.file_end,
                    region.mem_end
                );
                control
                    .init_ipa_range(region.file_end, region.tail_size())
                    .or_fatal(|| {
                        format!("init realm IPA {:#x}..{:#x}", region.file_end, region.mem_end)
                    })?;
            }
        }
        Ok(())
    }
}

impl RealmSupport for ArmRealm {
    fn is_realm(&self) -> bool {
        true
    }

    fn register_ram_region(&mut self, start: u64, file_size: u64, mem_size: u64) -> Result<()> {
        if self.sealed {
            return Err(Error::RealmSealed);
        }
        let region = self.ledger.register(start, file_size, mem_size);
        debug!(target: "armvmm::realm", "buffered RAM region {region:x?}");
        Ok(())
    }

    fn finalize(&mut self, control: &dyn RealmControl) -> std::result::Result<(), Fatal> {
        if self.sealed {
            return Err(Fatal::new(format!(
                "realm finalize called twice (state {})",
                self.state
            )));
        }
        self.sealed = true;

        self.configure(control)?;
        control
            .create_realm_descriptor()
            .or_fatal(|| "create realm descriptor".to_string())?;
        self.state = RealmState::DescriptorCreated;

        let regions = self.ledger.len();
        self.populate(control)?;
        self.state = RealmState::Populated;
        info!(target: "armvmm::realm", "realm populated from {regions} RAM regions");
        Ok(())
    }

    fn state(&self) -> RealmState {
        self.state
    }
}

/// Pick the realm implementation for a VM.
pub fn select(config: &VmConfig) -> Result<Box<dyn RealmSupport>> {
    if config.is_realm() {
        Ok(Box::new(ArmRealm::new(config.realm.clone())?))
    } else {
        Ok(Box::new(NoRealm))
    }
}
