//! Logging setup for armvmm.
//!
//! All diagnostics go through `tracing`. Set the `ARMVMM_DEBUG` environment
//! variable to enable verbose logging:
//! - `ARMVMM_DEBUG=1` - Enable all debug output
//! - `ARMVMM_DEBUG=realm` - Enable only realm lifecycle logs
//! - `ARMVMM_DEBUG=vcpu` - Enable only VCPU target resolution and exit logs
//! - `ARMVMM_DEBUG=realm,memory` - Enable multiple categories
//!
//! Without the variable only warnings and errors are printed.

use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Name of the environment variable read by [`init_logging`].
pub const DEBUG_ENV: &str = "ARMVMM_DEBUG";

/// Debug categories that can be enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCategory {
    Realm,
    Vcpu,
    Memory,
    Pvtime,
    All,
}

impl DebugCategory {
    /// The tracing target the category maps to.
    pub fn target(self) -> &'static str {
        match self {
            DebugCategory::Realm => "armvmm::realm",
            DebugCategory::Vcpu => "armvmm::vcpu",
            DebugCategory::Memory => "armvmm::memory",
            DebugCategory::Pvtime => "armvmm::pvtime",
            DebugCategory::All => "armvmm",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "1" | "all" => Some(DebugCategory::All),
            "realm" => Some(DebugCategory::Realm),
            "vcpu" => Some(DebugCategory::Vcpu),
            "memory" | "mem" => Some(DebugCategory::Memory),
            "pvtime" => Some(DebugCategory::Pvtime),
            _ => None,
        }
    }
}

/// Build the `EnvFilter` directive string for a `ARMVMM_DEBUG` value.
pub fn filter_directives(value: Option<&str>) -> String {
    let mut directives = vec!["warn".to_string()];
    if let Some(value) = value {
        let value = value.to_lowercase();
        for category in value.split(',').filter_map(DebugCategory::parse) {
            directives.push(format!("{}=debug", category.target()));
        }
    }
    directives.join(",")
}

/// Install a stderr `tracing` subscriber filtered by `ARMVMM_DEBUG`.
///
/// Calling this more than once returns an error and leaves the first
/// subscriber in place.
pub fn init_logging() -> Result<()> {
    let value = std::env::var(DEBUG_ENV).ok();
    let filter = EnvFilter::try_new(filter_directives(value.as_deref()))
        .map_err(|e| Error::Logging(e.to_string()))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_warn_only() {
        assert_eq!(filter_directives(None), "warn");
    }

    #[test]
    fn test_all_categories() {
        assert_eq!(filter_directives(Some("1")), "warn,armvmm=debug");
        assert_eq!(filter_directives(Some("ALL")), "warn,armvmm=debug");
    }

    #[test]
    fn test_multiple_categories_ignore_unknown() {
        assert_eq!(
            filter_directives(Some("realm, vcpu,bogus")),
            "warn,armvmm::realm=debug,armvmm::vcpu=debug"
        );
    }

    #[test]
    fn test_directives_parse() {
        assert!(EnvFilter::try_new(filter_directives(Some("memory,pvtime"))).is_ok());
    }
}
