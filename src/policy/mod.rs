pub mod command_rate;
pub mod device_time;
pub mod device_time_hp;
pub mod script;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::transport::CommandHeader;
use crate::vm::{AppInfo, VmId};

pub use command_rate::{CommandRatePolicy, RateSnapshot, RateVmSnapshot};
pub use device_time::{DeviceTimePolicy, DeviceTimeSnapshot, DeviceTimeVmSnapshot};
pub use device_time_hp::DeviceTimeHpPolicy;
pub use script::{ScriptError, ScriptOp, ScriptPolicy, ScriptPolicySpec, ScriptVerdict};

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Admitted,
    Denied,
}

/// The built-in resource policies. Capabilities a policy does not expose
/// (the rate policy has no app hooks, the device-time policies no VM hooks)
/// are no-op arms here, so dispatch can fan out unconditionally.
pub enum KernelPolicy {
    CommandRate(CommandRatePolicy),
    DeviceTime(DeviceTimePolicy),
    DeviceTimeHp(DeviceTimeHpPolicy),
}

impl KernelPolicy {
    pub fn kind(&self) -> &'static str {
        match self {
            KernelPolicy::CommandRate(_) => "command_rate",
            KernelPolicy::DeviceTime(_) => "device_time",
            KernelPolicy::DeviceTimeHp(_) => "device_time_hp",
        }
    }

    fn engine_init(&self) {
        match self {
            KernelPolicy::CommandRate(p) => p.engine_init(),
            KernelPolicy::DeviceTime(p) => p.engine_init(),
            KernelPolicy::DeviceTimeHp(p) => p.engine_init(),
        }
    }

    fn engine_release(&self) {
        match self {
            KernelPolicy::CommandRate(p) => p.engine_release(),
            KernelPolicy::DeviceTime(_) | KernelPolicy::DeviceTimeHp(_) => {}
        }
    }

    fn vm_init(&self, vm_id: VmId) {
        if let KernelPolicy::CommandRate(p) = self {
            p.vm_init(vm_id);
        }
    }

    fn vm_release(&self, vm_id: VmId) {
        if let KernelPolicy::CommandRate(p) = self {
            p.vm_release(vm_id);
        }
    }

    async fn check(
        &self,
        vm_id: VmId,
        command: &CommandHeader,
        cancel: &watch::Receiver<bool>,
    ) -> CheckOutcome {
        match self {
            KernelPolicy::CommandRate(p) => p.check(vm_id, command, cancel).await,
            KernelPolicy::DeviceTime(p) => p.check(vm_id).await,
            KernelPolicy::DeviceTimeHp(p) => p.check(vm_id).await,
        }
    }

    fn app_init(&self, app: &AppInfo) {
        match self {
            KernelPolicy::DeviceTime(p) => p.app_init(app.vm_id),
            KernelPolicy::DeviceTimeHp(p) => p.app_init(app.vm_id),
            KernelPolicy::CommandRate(_) => {}
        }
    }

    fn app_release(&self, app: &AppInfo) {
        match self {
            KernelPolicy::DeviceTime(p) => p.app_release(app.vm_id),
            KernelPolicy::DeviceTimeHp(p) => p.app_release(app.vm_id),
            KernelPolicy::CommandRate(_) => {}
        }
    }

    fn consume_command_rate(&self, vm_id: VmId, consumed: i32) {
        if let KernelPolicy::CommandRate(p) = self {
            p.consume(vm_id, consumed);
        }
    }

    fn consume_device_time(&self, vm_id: VmId, micros: i64) {
        match self {
            KernelPolicy::DeviceTime(p) => p.consume(vm_id, micros),
            KernelPolicy::DeviceTimeHp(p) => p.consume(vm_id, micros),
            KernelPolicy::CommandRate(_) => {}
        }
    }
}

pub struct KernelEntry {
    pub id: i32,
    pub policy: KernelPolicy,
}

pub struct ScriptEntry {
    pub id: i32,
    pub policy: ScriptPolicy,
}

/// Per-policy state for observability.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyStateSnapshot {
    CommandRate { id: i32, state: RateSnapshot },
    DeviceTime { id: i32, state: DeviceTimeSnapshot },
    DeviceTimeHp { id: i32, state: DeviceTimeSnapshot },
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub kernel: Vec<PolicyStateSnapshot>,
    pub script_ids: Vec<i32>,
}

/// Ordered collections of installed policies with fan-out dispatch.
///
/// Dispatch iterates a copy-on-write snapshot: readers clone an `Arc` under
/// a short lock and walk it lock-free, so the per-packet path takes no lock
/// for the duration of a blocking check and allocates nothing.
/// Installation and removal rebuild the list.
pub struct PolicyRegistry {
    kernel: RwLock<Arc<Vec<Arc<KernelEntry>>>>,
    scripts: RwLock<Arc<Vec<Arc<ScriptEntry>>>>,
    next_kernel_id: AtomicI32,
    next_script_id: AtomicI32,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self {
            kernel: RwLock::new(Arc::new(Vec::new())),
            scripts: RwLock::new(Arc::new(Vec::new())),
            next_kernel_id: AtomicI32::new(1),
            next_script_id: AtomicI32::new(1),
        }
    }

    fn kernel_snapshot(&self) -> Arc<Vec<Arc<KernelEntry>>> {
        self.kernel.read().clone()
    }

    fn script_snapshot(&self) -> Arc<Vec<Arc<ScriptEntry>>> {
        self.scripts.read().clone()
    }

    /// Install a kernel policy, running its engine hook, and return its id.
    /// Must run inside a tokio runtime (periodic policies arm timers here).
    pub fn install_kernel(&self, policy: KernelPolicy) -> i32 {
        policy.engine_init();
        let id = self.next_kernel_id.fetch_add(1, Ordering::Relaxed);
        let kind = policy.kind();
        let entry = Arc::new(KernelEntry { id, policy });
        let mut list = self.kernel.write();
        let mut next = (**list).clone();
        next.push(entry);
        *list = Arc::new(next);
        info!(id, kind, "kernel policy installed");
        id
    }

    /// Remove the kernel policy with the given id; a non-positive id
    /// removes all. Each removed policy's engine-release hook runs exactly
    /// once before its state is freed.
    pub fn remove_kernel(&self, id: i32) {
        let removed: Vec<Arc<KernelEntry>> = {
            let mut list = self.kernel.write();
            let (removed, retained): (Vec<_>, Vec<_>) =
                (**list).clone().into_iter().partition(|e| id <= 0 || e.id == id);
            *list = Arc::new(retained);
            removed
        };
        for entry in removed {
            entry.policy.engine_release();
            info!(id = entry.id, kind = entry.policy.kind(), "kernel policy removed");
        }
    }

    /// Verify and install a scripted policy; returns its id.
    pub fn install_script(&self, policy: ScriptPolicy) -> i32 {
        let id = self.next_script_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(ScriptEntry { id, policy });
        let mut list = self.scripts.write();
        let mut next = (**list).clone();
        next.push(entry);
        *list = Arc::new(next);
        info!(id, "scripted policy installed");
        id
    }

    /// Detach the scripted policy with the given id; non-positive removes
    /// all.
    pub fn detach_script(&self, id: i32) {
        let mut list = self.scripts.write();
        let retained: Vec<_> = (**list)
            .iter()
            .filter(|e| id > 0 && e.id != id)
            .cloned()
            .collect();
        if retained.len() != list.len() {
            info!(id, "scripted policy removed");
        }
        *list = Arc::new(retained);
    }

    pub fn kernel_entry(&self, id: i32) -> Option<Arc<KernelEntry>> {
        self.kernel.read().iter().find(|e| e.id == id).cloned()
    }

    pub fn script_entry(&self, id: i32) -> Option<Arc<ScriptEntry>> {
        self.scripts.read().iter().find(|e| e.id == id).cloned()
    }

    /// Run every policy's engine-release hook without uninstalling, for
    /// mediator shutdown. Release hooks are idempotent.
    pub fn engine_release_all(&self) {
        for entry in self.kernel_snapshot().iter() {
            entry.policy.engine_release();
        }
    }

    /// VM-attach fan-out, in installation order.
    pub fn vm_init(&self, vm_id: VmId) {
        for entry in self.kernel_snapshot().iter() {
            entry.policy.vm_init(vm_id);
        }
        for entry in self.script_snapshot().iter() {
            entry.policy.vm_init(vm_id);
        }
    }

    pub fn vm_release(&self, vm_id: VmId) {
        for entry in self.kernel_snapshot().iter() {
            entry.policy.vm_release(vm_id);
        }
        for entry in self.script_snapshot().iter() {
            entry.policy.vm_fini(vm_id);
        }
    }

    pub fn app_init(&self, app: &AppInfo) {
        for entry in self.kernel_snapshot().iter() {
            entry.policy.app_init(app);
        }
    }

    pub fn app_release(&self, app: &AppInfo) {
        for entry in self.kernel_snapshot().iter() {
            entry.policy.app_release(app);
        }
    }

    /// Admission fan-out for one command packet: kernel policies first, in
    /// insertion order, then every scripted schedule loop. A blocking
    /// policy blocks the whole check; a denial short-circuits it.
    pub async fn check(
        &self,
        vm_id: VmId,
        command: &CommandHeader,
        cancel: &watch::Receiver<bool>,
    ) -> CheckOutcome {
        let kernel = self.kernel_snapshot();
        for entry in kernel.iter() {
            if entry.policy.check(vm_id, command, cancel).await == CheckOutcome::Denied {
                return CheckOutcome::Denied;
            }
        }
        let scripts = self.script_snapshot();
        for entry in scripts.iter() {
            entry.policy.schedule(vm_id, command.command_id).await;
        }
        CheckOutcome::Admitted
    }

    /// Command-rate consumption: the kernel rate policy plus every scripted
    /// consume program, in order.
    pub fn consume_command_rate(&self, vm_id: VmId, consumed: i32) {
        for entry in self.kernel_snapshot().iter() {
            entry.policy.consume_command_rate(vm_id, consumed);
        }
        for entry in self.script_snapshot().iter() {
            entry.policy.consume(vm_id, consumed as i64);
        }
    }

    /// Device-time consumption, routed to every installed device-time
    /// variant plus the scripted consume programs.
    pub fn consume_device_time(&self, vm_id: VmId, micros: i64) {
        for entry in self.kernel_snapshot().iter() {
            entry.policy.consume_device_time(vm_id, micros);
        }
        for entry in self.script_snapshot().iter() {
            entry.policy.consume(vm_id, micros);
        }
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let kernel = self
            .kernel_snapshot()
            .iter()
            .map(|entry| match &entry.policy {
                KernelPolicy::CommandRate(p) => PolicyStateSnapshot::CommandRate {
                    id: entry.id,
                    state: p.snapshot(),
                },
                KernelPolicy::DeviceTime(p) => PolicyStateSnapshot::DeviceTime {
                    id: entry.id,
                    state: p.snapshot(),
                },
                KernelPolicy::DeviceTimeHp(p) => PolicyStateSnapshot::DeviceTimeHp {
                    id: entry.id,
                    state: p.snapshot(),
                },
            })
            .collect();
        let script_ids = self.script_snapshot().iter().map(|e| e.id).collect();
        RegistrySnapshot { kernel, script_ids }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediatorConfig;
    use crate::transport::CommandHeader;

    fn config() -> MediatorConfig {
        MediatorConfig::default()
    }

    fn cancel_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    fn app(vm_id: VmId) -> AppInfo {
        AppInfo {
            vm_id,
            guest_cid: 3,
            app_port: 100,
            worker_port: 9100,
            worker_pid: None,
        }
    }

    #[tokio::test]
    async fn install_assigns_increasing_ids() {
        let registry = PolicyRegistry::new();
        let cfg = config();
        let a = registry.install_kernel(KernelPolicy::CommandRate(CommandRatePolicy::new(&cfg)));
        let b = registry.install_kernel(KernelPolicy::DeviceTime(DeviceTimePolicy::new(&cfg)));
        assert!(b > a);
        assert!(registry.kernel_entry(a).is_some());
        assert!(registry.kernel_entry(b).is_some());
    }

    #[tokio::test]
    async fn remove_by_id_leaves_others_installed() {
        let registry = PolicyRegistry::new();
        let cfg = config();
        let a = registry.install_kernel(KernelPolicy::CommandRate(CommandRatePolicy::new(&cfg)));
        let b = registry.install_kernel(KernelPolicy::DeviceTime(DeviceTimePolicy::new(&cfg)));

        registry.remove_kernel(a);
        assert!(registry.kernel_entry(a).is_none());
        assert!(registry.kernel_entry(b).is_some());
    }

    #[tokio::test]
    async fn nonpositive_id_removes_everything() {
        let registry = PolicyRegistry::new();
        let cfg = config();
        registry.install_kernel(KernelPolicy::CommandRate(CommandRatePolicy::new(&cfg)));
        registry.install_kernel(KernelPolicy::DeviceTimeHp(DeviceTimeHpPolicy::new(&cfg)));

        registry.remove_kernel(0);
        assert!(registry.snapshot().kernel.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn removal_stops_the_refill_timer() {
        let registry = PolicyRegistry::new();
        let cfg = config();
        let id = registry.install_kernel(KernelPolicy::CommandRate(CommandRatePolicy::new(&cfg)));

        let entry = registry.kernel_entry(id).unwrap();
        let KernelPolicy::CommandRate(rate) = &entry.policy else {
            panic!("wrong policy kind");
        };
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        let ticks_before = rate.ticks();
        assert!(ticks_before >= 2);

        registry.remove_kernel(id);
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        assert_eq!(rate.ticks(), ticks_before);
    }

    #[tokio::test]
    async fn app_lifecycle_fans_out_to_device_time() {
        let registry = PolicyRegistry::new();
        let cfg = config();
        let id = registry.install_kernel(KernelPolicy::DeviceTime(DeviceTimePolicy::new(&cfg)));

        registry.app_init(&app(1));
        let entry = registry.kernel_entry(id).unwrap();
        let KernelPolicy::DeviceTime(dt) = &entry.policy else {
            panic!("wrong policy kind");
        };
        assert_eq!(dt.total_priority(), 1);

        registry.app_release(&app(1));
        assert_eq!(dt.total_priority(), 0);
    }

    #[tokio::test]
    async fn consume_routes_by_resource_kind() {
        let registry = PolicyRegistry::new();
        let cfg = config();
        let rate_id =
            registry.install_kernel(KernelPolicy::CommandRate(CommandRatePolicy::new(&cfg)));
        let dt_id = registry.install_kernel(KernelPolicy::DeviceTime(DeviceTimePolicy::new(&cfg)));
        registry.vm_init(1);
        registry.app_init(&app(1));

        registry.consume_command_rate(1, 2);
        registry.consume_device_time(1, 1_500);

        let rate_entry = registry.kernel_entry(rate_id).unwrap();
        let KernelPolicy::CommandRate(rate) = &rate_entry.policy else {
            panic!("wrong policy kind");
        };
        let dt_entry = registry.kernel_entry(dt_id).unwrap();
        let KernelPolicy::DeviceTime(dt) = &dt_entry.policy else {
            panic!("wrong policy kind");
        };
        assert_eq!(rate.balance(1), rate.refill_budget(1) - 2);
        assert_eq!(dt.used_time(1), 1_500);
    }

    #[tokio::test]
    async fn scripted_consume_sees_both_report_kinds() {
        let registry = PolicyRegistry::new();
        let cfg = config();
        let script = ScriptPolicy::new(
            ScriptPolicySpec {
                map_count: 1,
                vm_consume: Some(vec![
                    ScriptOp::PushVmId,
                    ScriptOp::PushAmount,
                    ScriptOp::MapAdd(0),
                    ScriptOp::PushConst(0),
                    ScriptOp::Return,
                ]),
                ..Default::default()
            },
            &cfg,
        )
        .unwrap();
        let id = registry.install_script(script);

        registry.consume_command_rate(2, 3);
        registry.consume_device_time(2, 40);
        let entry = registry.script_entry(id).unwrap();
        assert_eq!(entry.policy.map_load(0, 2), Some(43));
    }

    #[tokio::test]
    async fn check_fans_out_and_admits() {
        let registry = PolicyRegistry::new();
        let cfg = config();
        registry.install_kernel(KernelPolicy::CommandRate(CommandRatePolicy::new(&cfg)));
        registry.vm_init(1);

        let (_tx, rx) = cancel_pair();
        let cmd = CommandHeader::new(1, 5, 1);
        let outcome = registry.check(1, &cmd, &rx).await;
        assert_eq!(outcome, CheckOutcome::Admitted);
    }

    #[tokio::test]
    async fn cancelled_check_denies() {
        let registry = PolicyRegistry::new();
        let cfg = config();
        let id = registry.install_kernel(KernelPolicy::CommandRate(CommandRatePolicy::new(&cfg)));
        registry.vm_init(1);

        // Exhaust the balance so the check parks, then cancel.
        let entry = registry.kernel_entry(id).unwrap();
        let KernelPolicy::CommandRate(rate) = &entry.policy else {
            panic!("wrong policy kind");
        };
        rate.consume(1, rate.balance(1) + 1);

        let (tx, rx) = watch::channel(false);
        let cmd = CommandHeader::new(1, 5, 1);
        let check = registry.check(1, &cmd, &rx);
        tokio::pin!(check);
        tokio::select! {
            biased;
            _ = &mut check => panic!("check should be parked"),
            _ = tokio::task::yield_now() => {}
        }
        tx.send(true).unwrap();
        assert_eq!(check.await, CheckOutcome::Denied);
    }

    #[tokio::test]
    async fn detach_script_by_id_and_all() {
        let registry = PolicyRegistry::new();
        let cfg = config();
        let spec = ScriptPolicySpec {
            vm_schedule: Some(vec![ScriptOp::PushConst(0), ScriptOp::Return]),
            ..Default::default()
        };
        let a = registry.install_script(ScriptPolicy::new(spec.clone(), &cfg).unwrap());
        let b = registry.install_script(ScriptPolicy::new(spec, &cfg).unwrap());

        registry.detach_script(a);
        assert!(registry.script_entry(a).is_none());
        assert!(registry.script_entry(b).is_some());

        registry.detach_script(-1);
        assert!(registry.snapshot().script_ids.is_empty());
    }
}
