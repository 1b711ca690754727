//! Hypervisor-side mediation core for accelerator sharing.
//!
//! Guests submit accelerator commands over a virtio-vsock transport; this
//! crate interposes on that traffic and throttles it through an ordered set
//! of resource policies (command-rate token buckets, proportional-share
//! device-time scheduling, user-supplied scripted policies) so that VMs
//! sharing one physical device get their configured share. Workers report
//! consumption back over an out-of-band channel, closing the loop.
//!
//! The transport, worker lifecycle and control plane are external
//! collaborators: the embedding host calls [`Mediator::on_guest_packet`],
//! [`Mediator::on_worker_report`] and the attach/detach entry points, and
//! drains per-VM send rings via [`Mediator::poll_outbound`].

pub mod accounting;
pub mod config;
pub mod interpose;
pub mod policy;
pub mod transport;
pub mod vm;

#[cfg(test)]
mod invariant_tests;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

pub use config::MediatorConfig;
pub use interpose::{PacketDisposition, WorkerReport};
pub use policy::{
    CheckOutcome, CommandRatePolicy, DeviceTimeHpPolicy, DeviceTimePolicy, KernelPolicy,
    PolicyRegistry, RegistrySnapshot, ScriptError, ScriptOp, ScriptPolicy, ScriptPolicySpec,
};
pub use transport::{CommandHeader, GuestPacket, NotifyFn, PacketHeader, PacketOp, SendRing};
pub use vm::{AppInfo, VmId, VmTable, MAX_VM};

/// The mediation core: VM/app tables, the policy registry, and the
/// cancellation signal blocking checks listen on.
///
/// One `Mediator` serves one physical device. The host wraps it in an `Arc`
/// and calls into it from however many transport and report tasks it runs;
/// everything inside is designed for that concurrency.
pub struct Mediator {
    pub(crate) config: MediatorConfig,
    pub(crate) vms: VmTable,
    pub(crate) registry: PolicyRegistry,
    pub(crate) cancel_tx: watch::Sender<bool>,
    pub(crate) cancel_rx: watch::Receiver<bool>,
}

/// Point-in-time view of the whole core.
#[derive(Debug, Clone, Serialize)]
pub struct MediatorSnapshot {
    pub live_vms: Vec<VmId>,
    pub policies: RegistrySnapshot,
}

impl Mediator {
    /// A core with no policies installed.
    pub fn new(config: MediatorConfig) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            config,
            vms: VmTable::new(),
            registry: PolicyRegistry::new(),
            cancel_tx,
            cancel_rx,
        }
    }

    /// A core with the stock policy set installed: the command-rate
    /// throttle and the cooperative device-time scheduler. Must run inside
    /// a tokio runtime (the rate policy arms its refill timer here).
    pub fn with_default_policies(config: MediatorConfig) -> Self {
        let mediator = Self::new(config);
        mediator.install_kernel_policy(KernelPolicy::CommandRate(CommandRatePolicy::new(
            &mediator.config,
        )));
        mediator.install_kernel_policy(KernelPolicy::DeviceTime(DeviceTimePolicy::new(
            &mediator.config,
        )));
        mediator
    }

    pub fn config(&self) -> &MediatorConfig {
        &self.config
    }

    pub fn vms(&self) -> &VmTable {
        &self.vms
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    // ── Control surface ──

    pub fn install_kernel_policy(&self, policy: KernelPolicy) -> i32 {
        self.registry.install_kernel(policy)
    }

    /// Remove a kernel policy by id; a non-positive id removes all.
    pub fn remove_kernel_policy(&self, id: i32) {
        self.registry.remove_kernel(id);
    }

    /// Verify and install a scripted policy; refuses programs that fail
    /// verification.
    pub fn install_script_policy(&self, spec: ScriptPolicySpec) -> Result<i32, ScriptError> {
        let policy = ScriptPolicy::new(spec, &self.config)?;
        Ok(self.registry.install_script(policy))
    }

    /// Detach a scripted policy by id; a non-positive id removes all.
    pub fn detach_script_policy(&self, id: i32) {
        self.registry.detach_script(id);
    }

    // ── VM lifecycle ──

    /// Attach a VM: build its outbound ring and run every policy's VM-init
    /// hook. `notify` is the transport's signal callback for ring
    /// sentinels.
    pub fn on_vm_attach(&self, vm_id: VmId, guest_cid: u64, notify: NotifyFn) -> bool {
        let ring = Arc::new(SendRing::new(self.config.send_ring_capacity, notify));
        if !self.vms.attach_vm(vm_id, guest_cid, ring) {
            return false;
        }
        self.registry.vm_init(vm_id);
        true
    }

    /// Detach a VM. Apps still attached are released first (the backstop
    /// for guests that vanished without shutdown handshakes), then the
    /// policies' VM-release hooks restore the share totals.
    pub fn on_vm_detach(&self, vm_id: VmId) {
        let orphans = self.vms.detach_vm(vm_id);
        for app in &orphans {
            self.registry.app_release(app);
        }
        self.registry.vm_release(vm_id);
        info!(vm = vm_id, orphans = orphans.len(), "vm detached");
    }

    /// Cancel all blocked admission checks and stop policy timers. Policy
    /// state stays readable; install/remove still works afterwards.
    pub fn shutdown(&self) {
        let _ = self.cancel_tx.send(true);
        self.registry.engine_release_all();
        info!("mediator shut down");
    }

    pub fn snapshot(&self) -> MediatorSnapshot {
        MediatorSnapshot {
            live_vms: self.vms.live_vms(),
            policies: self.registry.snapshot(),
        }
    }
}
