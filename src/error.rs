//! Error types for armvmm.

use std::path::PathBuf;
use thiserror::Error;

use crate::memory::alloc::AllocError;

/// Result type alias using armvmm's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Recoverable errors that can occur while building or running a VM.
///
/// Anything that leaves privileged hypervisor state half-applied is reported
/// as [`Fatal`] instead.
#[derive(Error, Debug)]
pub enum Error {
    // Platform/hypervisor errors
    #[error("hypervisor not available on this platform")]
    HypervisorNotAvailable,

    #[error("hypervisor error: {0}")]
    HypervisorError(String),

    #[error("{op} failed")]
    Kvm {
        op: &'static str,
        #[source]
        source: nix::Error,
    },

    // Configuration errors
    #[error("invalid memory size: {0} MB (must be > 0)")]
    InvalidMemorySize(u32),

    #[error("invalid vCPU count: {0} (must be > 0)")]
    InvalidVcpuCount(u32),

    #[error("realm personalization value is {len} bytes (max {max})")]
    PersonalizationTooLong { len: usize, max: usize },

    #[error("unknown measurement algorithm: {0}")]
    UnknownMeasurementAlgo(String),

    #[error("conflicting configuration: {0}")]
    ConflictingConfig(&'static str),

    #[error("hugetlbfs path not found: {0}")]
    HugetlbfsNotFound(PathBuf),

    // VCPU target registry errors
    #[error("CPU target registry is full ({0} targets)")]
    TargetRegistryFull(usize),

    #[error("CPU target {0} is already registered")]
    DuplicateTarget(u32),

    #[error("no vCPU with id {0}")]
    UnknownVcpu(u32),

    // Runtime errors
    #[error("VM not in expected state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("realm RAM regions cannot be added after finalize")]
    RealmSealed,

    // Memory errors
    #[error("memory allocation failed: {0}")]
    MemoryAllocationFailed(#[from] AllocError),

    #[error("invalid guest address: 0x{0:x}")]
    InvalidGuestAddress(u64),

    #[error("no guest memory region covers 0x{gpa:x}+0x{size:x}")]
    UnmappedGuestRange { gpa: u64, size: u64 },

    // Logging
    #[error("failed to initialize logging: {0}")]
    Logging(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("feature not supported: {0}")]
    NotSupported(String),

    #[error(transparent)]
    Fatal(#[from] Fatal),
}

impl Error {
    /// Create an error for a failed KVM ioctl.
    pub fn kvm(op: &'static str, source: nix::Error) -> Self {
        Error::Kvm { op, source }
    }
}

/// An unrecoverable failure.
///
/// The VM holding the state that produced this must be terminated: the
/// privileged call that failed cannot be retried or unwound (a realm whose
/// measurement is already wrong, a VCPU that is half initialized). Callers
/// propagate it to the top of VM construction and call
/// [`Fatal::terminate`].
#[derive(Error, Debug)]
#[error("{context}")]
pub struct Fatal {
    context: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Fatal {
    /// Create a fatal error with only a description.
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            source: None,
        }
    }

    /// Create a fatal error caused by `source`.
    pub fn with_source(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            context: context.into(),
            source: Some(source.into()),
        }
    }

    /// The description of what failed.
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Log the failure and terminate the process.
    pub fn terminate(self) -> ! {
        match &self.source {
            Some(source) => tracing::error!(error = %source, "fatal: {}", self.context),
            None => tracing::error!("fatal: {}", self.context),
        }
        std::process::exit(1)
    }
}

/// Attach fatal context to a result from a privileged call.
pub(crate) trait FatalContext<T> {
    fn or_fatal(self, context: impl FnOnce() -> String) -> std::result::Result<T, Fatal>;
}

impl<T, E> FatalContext<T> for std::result::Result<T, E>
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn or_fatal(self, context: impl FnOnce() -> String) -> std::result::Result<T, Fatal> {
        self.map_err(|e| Fatal::with_source(context(), e))
    }
}
