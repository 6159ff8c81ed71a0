//! Recording hypervisor double for unit tests.
//!
//! Every privileged call is appended to an ordered log so tests can assert
//! on exact call sequences. Capabilities, the preferred target, accepted
//! targets and failures are all configurable.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use super::{
    DeviceAttr, GuestMemoryRegistry, MemoryAttributes, MemoryBinding, RealmConfigItem,
    RealmControl, VcpuControl, VcpuFeatures, VcpuInit, VmControl,
};
use crate::error::{Error, Result};
use crate::memory::{MemoryKind, PAGE_SIZE};
use crate::vcpu::VcpuExit;

/// One recorded privileged call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    CheckExtension(u32),
    PreferredTarget,
    CreateVcpu(u32),
    VcpuInit {
        cpu: u32,
        target: u32,
        features: VcpuFeatures,
    },
    HasDeviceAttr {
        cpu: u32,
        attr: DeviceAttr,
    },
    SetDeviceAttr {
        cpu: u32,
        attr: DeviceAttr,
        value: Option<u64>,
    },
    InjectAbort {
        cpu: u32,
    },
    ConfigureRealm(RealmConfigItem),
    CreateRealmDescriptor,
    InitIpaRange {
        base: u64,
        size: u64,
    },
    PopulateRealm {
        base: u64,
        size: u64,
        measure: bool,
    },
    Register {
        gpa: u64,
        size: u64,
        kind: MemoryKind,
    },
    Destroy {
        gpa: u64,
        size: u64,
    },
    SetAttributes {
        gpa: u64,
        size: u64,
        attributes: MemoryAttributes,
    },
    MapRange {
        gpa: u64,
        size: u64,
    },
    UnmapRange {
        gpa: u64,
        size: u64,
    },
}

impl Call {
    /// Whether the call only queries the hypervisor.
    pub(crate) fn is_query(&self) -> bool {
        matches!(
            self,
            Call::CheckExtension(_) | Call::PreferredTarget | Call::HasDeviceAttr { .. }
        )
    }
}

#[derive(Default)]
struct MockState {
    calls: Vec<Call>,
    extensions: HashMap<u32, u32>,
    preferred_target: Option<u32>,
    accepted_targets: Option<Vec<u32>>,
    fail_when: Option<fn(&Call) -> bool>,
    pages: HashMap<u64, MemoryAttributes>,
}

/// A hypervisor that records calls instead of making them.
#[derive(Clone, Default)]
pub(crate) struct MockHypervisor {
    state: Arc<Mutex<MockState>>,
}

impl MockHypervisor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Report `value` for capability `cap`.
    pub(crate) fn with_extension(self, cap: u32, value: u32) -> Self {
        self.state().extensions.insert(cap, value);
        self
    }

    /// Support the preferred-target probe and report `target`.
    pub(crate) fn with_preferred_target(self, target: u32) -> Self {
        self.state().preferred_target = Some(target);
        self
    }

    /// Only accept VCPU init for these targets.
    pub(crate) fn accepting_targets(self, targets: &[u32]) -> Self {
        self.state().accepted_targets = Some(targets.to_vec());
        self
    }

    /// Fail every call matching `pred` after recording it.
    pub(crate) fn fail_when(&self, pred: fn(&Call) -> bool) {
        self.state().fail_when = Some(pred);
    }

    /// All calls made so far, in order.
    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Calls made so far, without capability and attribute queries.
    pub(crate) fn mutating_calls(&self) -> Vec<Call> {
        self.state()
            .calls
            .iter()
            .filter(|call| !call.is_query())
            .cloned()
            .collect()
    }

    pub(crate) fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub(crate) fn set_page_attributes(&self, gpa: u64, attributes: MemoryAttributes) {
        self.state().pages.insert(gpa, attributes);
    }

    pub(crate) fn page_attributes(&self, gpa: u64) -> MemoryAttributes {
        self.state().pages.get(&gpa).copied().unwrap_or_default()
    }

    fn record(&self, call: Call) -> Result<()> {
        let mut state = self.state();
        let fail = state.fail_when.is_some_and(|pred| pred(&call));
        state.calls.push(call);
        if fail {
            return Err(Error::kvm("mock", nix::Error::EINVAL));
        }
        Ok(())
    }
}

impl VmControl for MockHypervisor {
    type Vcpu = MockVcpu;

    fn check_extension(&self, cap: u32) -> u32 {
        let mut state = self.state();
        state.calls.push(Call::CheckExtension(cap));
        state.extensions.get(&cap).copied().unwrap_or(0)
    }

    fn preferred_target(&self) -> Option<u32> {
        let mut state = self.state();
        state.calls.push(Call::PreferredTarget);
        state.preferred_target
    }

    fn create_vcpu(&self, cpu_id: u32) -> Result<MockVcpu> {
        self.record(Call::CreateVcpu(cpu_id))?;
        Ok(MockVcpu {
            cpu: cpu_id,
            hv: self.clone(),
            run: Mutex::new(vec![0; 4 * PAGE_SIZE as usize]),
            exit: Mutex::new(VcpuExit::Other(0)),
            hypercall_ret: Mutex::new(None),
        })
    }
}

impl RealmControl for MockHypervisor {
    fn configure_realm(&self, item: RealmConfigItem) -> Result<()> {
        self.record(Call::ConfigureRealm(item))
    }

    fn create_realm_descriptor(&self) -> Result<()> {
        self.record(Call::CreateRealmDescriptor)
    }

    fn init_ipa_range(&self, base: u64, size: u64) -> Result<()> {
        self.record(Call::InitIpaRange { base, size })
    }

    fn populate_realm(&self, base: u64, size: u64, measure: bool) -> Result<()> {
        self.record(Call::PopulateRealm {
            base,
            size,
            measure,
        })
    }
}

impl GuestMemoryRegistry for MockHypervisor {
    fn register(&self, binding: MemoryBinding<'_>) -> Result<()> {
        self.record(Call::Register {
            gpa: binding.gpa,
            size: binding.size,
            kind: binding.kind,
        })
    }

    fn destroy(&self, gpa: u64, size: u64, _host: *mut u8) -> Result<()> {
        self.record(Call::Destroy { gpa, size })
    }

    fn set_attributes(&self, gpa: u64, size: u64, attributes: MemoryAttributes) -> Result<()> {
        self.record(Call::SetAttributes {
            gpa,
            size,
            attributes,
        })?;
        let mut state = self.state();
        for page in (gpa..gpa + size).step_by(PAGE_SIZE as usize) {
            state.pages.insert(page, attributes);
        }
        Ok(())
    }

    fn map_range(&self, gpa: u64, size: u64) -> Result<()> {
        self.record(Call::MapRange { gpa, size })
    }

    fn unmap_range(&self, gpa: u64, size: u64) -> Result<()> {
        self.record(Call::UnmapRange { gpa, size })
    }
}

/// A VCPU of [`MockHypervisor`].
pub(crate) struct MockVcpu {
    cpu: u32,
    hv: MockHypervisor,
    run: Mutex<Vec<u8>>,
    exit: Mutex<VcpuExit>,
    hypercall_ret: Mutex<Option<u64>>,
}

impl fmt::Debug for MockVcpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockVcpu").field("cpu", &self.cpu).finish()
    }
}

impl MockVcpu {
    /// Make the next decoded exit `exit`.
    pub(crate) fn set_exit(&self, exit: VcpuExit) {
        *self.exit.lock().unwrap() = exit;
    }

    /// The last hypercall return value written.
    pub(crate) fn hypercall_ret(&self) -> Option<u64> {
        *self.hypercall_ret.lock().unwrap()
    }
}

impl VcpuControl for MockVcpu {
    fn init(&self, init: &VcpuInit) -> Result<()> {
        self.hv.record(Call::VcpuInit {
            cpu: self.cpu,
            target: init.target,
            features: init.features,
        })?;
        let accepted = self
            .hv
            .state()
            .accepted_targets
            .as_ref()
            .map_or(true, |targets| targets.contains(&init.target));
        if !accepted {
            return Err(Error::kvm("KVM_ARM_VCPU_INIT", nix::Error::EINVAL));
        }
        Ok(())
    }

    fn has_device_attr(&self, attr: DeviceAttr) -> Result<()> {
        self.hv.record(Call::HasDeviceAttr {
            cpu: self.cpu,
            attr,
        })
    }

    fn set_device_attr(&self, attr: DeviceAttr, value: Option<u64>) -> Result<()> {
        self.hv.record(Call::SetDeviceAttr {
            cpu: self.cpu,
            attr,
            value,
        })
    }

    fn inject_external_abort(&self) -> Result<()> {
        self.hv.record(Call::InjectAbort { cpu: self.cpu })
    }

    fn run_mapping(&self) -> *mut u8 {
        self.run.lock().unwrap().as_mut_ptr()
    }

    fn exit(&self) -> VcpuExit {
        *self.exit.lock().unwrap()
    }

    fn set_hypercall_return(&self, ret: u64) {
        *self.hypercall_ret.lock().unwrap() = Some(ret);
    }
}

/// Collects warning messages emitted while a closure runs.
#[derive(Clone, Default)]
pub(crate) struct LogCapture {
    warnings: Arc<Mutex<Vec<String>>>,
}

impl LogCapture {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Run `f` with this capture installed as the thread's subscriber.
    pub(crate) fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let subscriber = tracing_subscriber::registry().with(self.clone());
        tracing::subscriber::with_default(subscriber, f)
    }

    pub(crate) fn warnings(&self) -> Vec<String> {
        self.warnings.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::WARN {
            let mut visitor = MessageVisitor::default();
            event.record(&mut visitor);
            self.warnings.lock().unwrap().push(visitor.0);
        }
    }
}
