//! # armvmm
//!
//! The ARM64 core of a KVM virtual machine monitor: VCPU target resolution
//! and initialization, Arm CCA realm memory setup, and private/shared memory
//! conversion for protected guests.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use armvmm::{Result, Vm, VmBuilder};
//!
//! fn main() -> Result<()> {
//!     armvmm::debug::init_logging()?;
//!
//!     let config = VmBuilder::new().memory_mb(128).vcpus(2).build()?;
//!     let mut vm = Vm::create(config)?;
//!     vm.setup_ram()?;
//!     vm.create_vcpus()?;
//!     vm.finalize()?;
//!
//!     // VCPUs are ready to run
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Support
//!
//! - **Linux**: KVM on arm64 hosts. Realm guests need a host kernel with
//!   the Arm RME extensions.
//! - Other Linux hosts build the core and its tests, without a backend.

#![cfg(target_os = "linux")]

mod builder;
mod config;
pub mod debug;
mod error;
mod vm;

pub mod backend;
pub mod memory;
pub mod pvtime;
pub mod realm;
pub mod vcpu;

// Re-exports
pub use builder::VmBuilder;
pub use config::{GuestArch, MeasurementAlgo, RealmConfig, VmConfig, REALM_PERSONALIZATION_SIZE};
pub use error::{Error, Fatal, Result};
pub use vm::{Vm, VmState};

/// Check if the current platform supports hardware virtualization.
///
/// Returns `true` if the hypervisor is available and can be used.
pub fn is_supported() -> bool {
    backend::is_available()
}

/// Get the name of the hypervisor backend, if this platform has one.
pub fn backend_name() -> Option<&'static str> {
    backend::name()
}
