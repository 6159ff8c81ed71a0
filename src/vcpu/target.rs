//! Registry of the CPU types a VCPU can be initialized as.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::backend::VcpuControl;
use crate::error::{Error, Result};

/// Maximum number of registered (non-generic) targets.
pub const MAX_TARGETS: usize = 8;

/// ARMv8 Architecture Envelope Model.
pub const TARGET_AEM_V8: u32 = 0;
/// ARMv8 Foundation Model.
pub const TARGET_FOUNDATION_V8: u32 = 1;
/// Cortex-A57.
pub const TARGET_CORTEX_A57: u32 = 2;
/// Cortex-A53.
pub const TARGET_CORTEX_A53: u32 = 4;
/// Id of the generic ARMv8 fallback. No hypervisor reports it.
pub const TARGET_GENERIC_V8: u32 = u32::MAX;

/// What a target's init hook gets to see of the new VCPU.
pub struct TargetInitContext<'a> {
    pub cpu_id: u32,
    /// The CPU type the VCPU was initialized with.
    pub cpu_type: u32,
    pub compatible: &'static str,
    pub vcpu: &'a dyn VcpuControl,
}

type InitFn = dyn Fn(&TargetInitContext<'_>) -> Result<()> + Send + Sync;

/// A CPU type the hypervisor may accept for VCPU initialization.
#[derive(Clone)]
pub struct CpuTarget {
    id: u32,
    compatible: &'static str,
    init: Arc<InitFn>,
}

impl CpuTarget {
    /// Create a target with a per-VCPU init hook.
    pub fn new<F>(id: u32, compatible: &'static str, init: F) -> Self
    where
        F: Fn(&TargetInitContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            id,
            compatible,
            init: Arc::new(init),
        }
    }

    /// Target identifier understood by the hypervisor.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Device tree compatible string for this CPU type.
    pub fn compatible(&self) -> &'static str {
        self.compatible
    }

    /// Run the target's init hook for a freshly initialized VCPU.
    pub fn init(&self, ctx: &TargetInitContext<'_>) -> Result<()> {
        (self.init)(ctx)
    }
}

impl fmt::Debug for CpuTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuTarget")
            .field("id", &self.id)
            .field("compatible", &self.compatible)
            .finish_non_exhaustive()
    }
}

/// Known CPU targets, in registration order, plus an optional generic
/// fallback used when the hypervisor prefers a CPU type we don't know.
///
/// Built once before the first VCPU is created; read-only afterwards.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: Vec<CpuTarget>,
    generic: Option<CpuTarget>,
}

impl TargetRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in ARMv8 targets: the AEM and Foundation models,
    /// Cortex-A57 and Cortex-A53, plus the generic ARMv8 fallback.
    pub fn with_default_targets() -> Self {
        let targets = [
            (TARGET_AEM_V8, "arm,arm-v8"),
            (TARGET_FOUNDATION_V8, "arm,arm-v8"),
            (TARGET_CORTEX_A57, "arm,cortex-a57"),
            (TARGET_CORTEX_A53, "arm,cortex-a53"),
        ]
        .into_iter()
        .map(|(id, compatible)| CpuTarget::new(id, compatible, log_target_init))
        .collect();
        Self {
            targets,
            generic: Some(CpuTarget::new(
                TARGET_GENERIC_V8,
                "arm,arm-v8",
                log_target_init,
            )),
        }
    }

    /// Add a target. Fails when the registry is full or the id is taken.
    pub fn register(&mut self, target: CpuTarget) -> Result<()> {
        if self.targets.len() >= MAX_TARGETS {
            return Err(Error::TargetRegistryFull(MAX_TARGETS));
        }
        if self.find(target.id).is_some() {
            return Err(Error::DuplicateTarget(target.id));
        }
        self.targets.push(target);
        Ok(())
    }

    /// Set the fallback target, replacing any previous one.
    pub fn set_generic(&mut self, target: CpuTarget) {
        self.generic = Some(target);
    }

    /// The fallback target.
    pub fn generic(&self) -> Option<&CpuTarget> {
        self.generic.as_ref()
    }

    /// Look up a registered target by id.
    pub fn find(&self, id: u32) -> Option<&CpuTarget> {
        self.targets.iter().find(|t| t.id == id)
    }

    /// Registered targets in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &CpuTarget> {
        self.targets.iter()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

fn log_target_init(ctx: &TargetInitContext<'_>) -> Result<()> {
    debug!(
        target: "armvmm::vcpu",
        "vcpu {} is {} (type {})",
        ctx.cpu_id,
        ctx.compatible,
        ctx.cpu_type
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &TargetInitContext<'_>) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_default_targets() {
        let registry = TargetRegistry::with_default_targets();
        let ids: Vec<u32> = registry.iter().map(CpuTarget::id).collect();
        assert_eq!(
            ids,
            vec![
                TARGET_AEM_V8,
                TARGET_FOUNDATION_V8,
                TARGET_CORTEX_A57,
                TARGET_CORTEX_A53
            ]
        );
        assert!(registry.len() <= MAX_TARGETS);
        assert_eq!(
            registry.find(TARGET_CORTEX_A53).unwrap().compatible(),
            "arm,cortex-a53"
        );
        let generic = registry.generic().unwrap();
        assert_eq!(generic.id(), TARGET_GENERIC_V8);
        assert_eq!(generic.compatible(), "arm,arm-v8");
        assert!(registry.find(TARGET_GENERIC_V8).is_none());
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = TargetRegistry::new();
        registry.register(CpuTarget::new(7, "a", noop)).unwrap();
        let err = registry.register(CpuTarget::new(7, "b", noop)).unwrap_err();
        assert!(matches!(err, Error::DuplicateTarget(7)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_rejects_when_full() {
        let mut registry = TargetRegistry::new();
        for id in 0..MAX_TARGETS as u32 {
            registry.register(CpuTarget::new(id, "cpu", noop)).unwrap();
        }
        let err = registry
            .register(CpuTarget::new(100, "cpu", noop))
            .unwrap_err();
        assert!(matches!(err, Error::TargetRegistryFull(MAX_TARGETS)));
    }

    #[test]
    fn test_generic_is_not_registered() {
        let mut registry = TargetRegistry::new();
        assert!(registry.is_empty());
        registry.set_generic(CpuTarget::new(TARGET_GENERIC_V8, "arm,arm-v8", noop));
        assert!(registry.is_empty());
        assert!(registry.find(TARGET_GENERIC_V8).is_none());
    }
}
