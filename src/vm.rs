use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::transport::SendRing;

/// Highest valid VM id. Id 0 is reserved as the aggregate bucket used by
/// fleet-wide accounting.
pub const MAX_VM: usize = 16;

/// VM identity: a small integer in `[1, MAX_VM]`.
pub type VmId = usize;

/// Validate a wire-carried VM id into the table range.
pub fn checked_vm_id(raw: i64) -> Option<VmId> {
    if (1..=MAX_VM as i64).contains(&raw) {
        Some(raw as VmId)
    } else {
        None
    }
}

/// A single guest application backed by a host worker. Cross-references are
/// id keys resolved through the table, not pointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub vm_id: VmId,
    pub guest_cid: u64,
    pub app_port: u32,
    pub worker_port: u32,
    pub worker_pid: Option<u32>,
}

#[derive(Debug)]
struct VmEntry {
    guest_cid: u64,
    apps: Vec<AppInfo>,
    ring: Arc<SendRing>,
}

/// An app waiting for its worker to announce itself on the report channel.
#[derive(Debug, Clone, Copy)]
struct PendingBind {
    worker_port: u32,
    vm_id: VmId,
}

/// A worker that announced itself before any app claimed its port.
#[derive(Debug, Clone, Copy)]
struct UnboundWorker {
    worker_port: u32,
    worker_pid: u32,
}

#[derive(Default)]
struct TableInner {
    vms: HashMap<VmId, VmEntry>,
    cid_to_vm: HashMap<u64, VmId>,
    pid_to_vm: HashMap<u32, VmId>,
    pending: Vec<PendingBind>,
    unbound_workers: Vec<UnboundWorker>,
}

/// Liveness table for VMs and their apps, plus the worker-pid map used to
/// attribute consumption reports. All lookups take one short table lock.
#[derive(Default)]
pub struct VmTable {
    inner: Mutex<TableInner>,
}

impl VmTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a VM and its outbound ring. Fails on an occupied slot or an
    /// out-of-range id.
    pub fn attach_vm(&self, vm_id: VmId, guest_cid: u64, ring: Arc<SendRing>) -> bool {
        if vm_id == 0 || vm_id > MAX_VM {
            warn!(vm = vm_id, "refusing to attach out-of-range vm id");
            return false;
        }
        let mut inner = self.inner.lock();
        if inner.vms.contains_key(&vm_id) {
            warn!(vm = vm_id, "vm already attached");
            return false;
        }
        inner.cid_to_vm.insert(guest_cid, vm_id);
        inner.vms.insert(
            vm_id,
            VmEntry {
                guest_cid,
                apps: Vec::new(),
                ring,
            },
        );
        debug!(vm = vm_id, cid = guest_cid, "vm attached");
        true
    }

    /// Remove a VM, close its ring, and return the apps that were still
    /// attached so the caller can run their release cascade.
    pub fn detach_vm(&self, vm_id: VmId) -> Vec<AppInfo> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.vms.remove(&vm_id) else {
            debug!(vm = vm_id, "detach of unknown vm ignored");
            return Vec::new();
        };
        entry.ring.close();
        inner.cid_to_vm.remove(&entry.guest_cid);
        inner.pid_to_vm.retain(|_, v| *v != vm_id);
        inner.pending.retain(|p| p.vm_id != vm_id);
        debug!(vm = vm_id, apps = entry.apps.len(), "vm detached");
        entry.apps
    }

    pub fn vm_by_cid(&self, guest_cid: u64) -> Option<VmId> {
        self.inner.lock().cid_to_vm.get(&guest_cid).copied()
    }

    pub fn vm_by_pid(&self, worker_pid: u32) -> Option<VmId> {
        self.inner.lock().pid_to_vm.get(&worker_pid).copied()
    }

    pub fn ring(&self, vm_id: VmId) -> Option<Arc<SendRing>> {
        self.inner.lock().vms.get(&vm_id).map(|e| e.ring.clone())
    }

    pub fn live_vms(&self) -> Vec<VmId> {
        let mut ids: Vec<VmId> = self.inner.lock().vms.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn app_count(&self, vm_id: VmId) -> usize {
        self.inner
            .lock()
            .vms
            .get(&vm_id)
            .map_or(0, |e| e.apps.len())
    }

    /// Register a new app. If its worker already announced itself the pid
    /// binding completes here; otherwise the worker port goes on the pending
    /// list for `bind_worker` to cross-reference later.
    pub fn add_app(&self, mut app: AppInfo) -> Option<AppInfo> {
        let mut inner = self.inner.lock();
        if !inner.vms.contains_key(&app.vm_id) {
            warn!(vm = app.vm_id, "app attach for unknown vm");
            return None;
        }

        if let Some(idx) = inner
            .unbound_workers
            .iter()
            .position(|w| w.worker_port == app.worker_port)
        {
            let worker = inner.unbound_workers.swap_remove(idx);
            app.worker_pid = Some(worker.worker_pid);
            inner.pid_to_vm.insert(worker.worker_pid, app.vm_id);
            debug!(
                vm = app.vm_id,
                port = app.worker_port,
                pid = worker.worker_pid,
                "app bound to already-announced worker"
            );
        } else {
            inner.pending.push(PendingBind {
                worker_port: app.worker_port,
                vm_id: app.vm_id,
            });
        }

        let vm_id = app.vm_id;
        if let Some(entry) = inner.vms.get_mut(&vm_id) {
            entry.apps.push(app.clone());
        }
        Some(app)
    }

    /// Remove the app matching `(guest_cid, app_port, worker_port)`.
    pub fn remove_app(&self, guest_cid: u64, app_port: u32, worker_port: u32) -> Option<AppInfo> {
        let mut inner = self.inner.lock();
        let vm_id = inner.cid_to_vm.get(&guest_cid).copied()?;
        let entry = inner.vms.get_mut(&vm_id)?;
        let idx = entry.apps.iter().position(|a| {
            a.guest_cid == guest_cid && a.app_port == app_port && a.worker_port == worker_port
        })?;
        let app = entry.apps.remove(idx);
        if let Some(pid) = app.worker_pid {
            inner.pid_to_vm.remove(&pid);
        }
        inner
            .pending
            .retain(|p| !(p.vm_id == vm_id && p.worker_port == worker_port));
        Some(app)
    }

    /// Establish the pid↔vm mapping for a newly announced worker by
    /// cross-referencing the pending worker-port list. Workers that arrive
    /// before their app are parked until `add_app` claims the port.
    pub fn bind_worker(&self, worker_port: u32, worker_pid: u32) -> Option<VmId> {
        let mut inner = self.inner.lock();
        let Some(idx) = inner
            .pending
            .iter()
            .position(|p| p.worker_port == worker_port)
        else {
            debug!(port = worker_port, pid = worker_pid, "worker parked, no app yet");
            inner.unbound_workers.push(UnboundWorker {
                worker_port,
                worker_pid,
            });
            return None;
        };
        let pending = inner.pending.swap_remove(idx);
        inner.pid_to_vm.insert(worker_pid, pending.vm_id);
        if let Some(entry) = inner.vms.get_mut(&pending.vm_id) {
            if let Some(app) = entry
                .apps
                .iter_mut()
                .find(|a| a.worker_port == worker_port && a.worker_pid.is_none())
            {
                app.worker_pid = Some(worker_pid);
            }
        }
        debug!(
            vm = pending.vm_id,
            port = worker_port,
            pid = worker_pid,
            "worker bound"
        );
        Some(pending.vm_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SendRing;

    fn test_ring() -> Arc<SendRing> {
        Arc::new(SendRing::new(4, Box::new(|_| {})))
    }

    fn app(vm_id: VmId, cid: u64, app_port: u32, worker_port: u32) -> AppInfo {
        AppInfo {
            vm_id,
            guest_cid: cid,
            app_port,
            worker_port,
            worker_pid: None,
        }
    }

    #[test]
    fn attach_detach_roundtrip() {
        let table = VmTable::new();
        assert!(table.attach_vm(1, 3, test_ring()));
        assert_eq!(table.vm_by_cid(3), Some(1));
        assert_eq!(table.live_vms(), vec![1]);

        let released = table.detach_vm(1);
        assert!(released.is_empty());
        assert_eq!(table.vm_by_cid(3), None);
        assert!(table.live_vms().is_empty());
    }

    #[test]
    fn attach_rejects_duplicates_and_bad_ids() {
        let table = VmTable::new();
        assert!(table.attach_vm(1, 3, test_ring()));
        assert!(!table.attach_vm(1, 4, test_ring()));
        assert!(!table.attach_vm(0, 5, test_ring()));
        assert!(!table.attach_vm(MAX_VM + 1, 6, test_ring()));
    }

    #[test]
    fn app_then_worker_binds_via_pending_list() {
        let table = VmTable::new();
        table.attach_vm(1, 3, test_ring());
        table.add_app(app(1, 3, 100, 9100)).unwrap();

        assert_eq!(table.vm_by_pid(555), None);
        assert_eq!(table.bind_worker(9100, 555), Some(1));
        assert_eq!(table.vm_by_pid(555), Some(1));
    }

    #[test]
    fn worker_then_app_binds_immediately() {
        let table = VmTable::new();
        table.attach_vm(2, 4, test_ring());

        // Worker announces first; it parks until the app claims the port.
        assert_eq!(table.bind_worker(9200, 777), None);
        let bound = table.add_app(app(2, 4, 101, 9200)).unwrap();
        assert_eq!(bound.worker_pid, Some(777));
        assert_eq!(table.vm_by_pid(777), Some(2));
    }

    #[test]
    fn remove_app_clears_pid_mapping() {
        let table = VmTable::new();
        table.attach_vm(1, 3, test_ring());
        table.add_app(app(1, 3, 100, 9100)).unwrap();
        table.bind_worker(9100, 555);

        let removed = table.remove_app(3, 100, 9100).unwrap();
        assert_eq!(removed.worker_pid, Some(555));
        assert_eq!(table.vm_by_pid(555), None);
        assert_eq!(table.app_count(1), 0);
    }

    #[test]
    fn remove_app_not_found_is_noop() {
        let table = VmTable::new();
        table.attach_vm(1, 3, test_ring());
        assert!(table.remove_app(3, 1, 2).is_none());
        assert!(table.remove_app(99, 1, 2).is_none());
    }

    #[test]
    fn detach_returns_live_apps_and_scrubs_maps() {
        let table = VmTable::new();
        table.attach_vm(1, 3, test_ring());
        table.add_app(app(1, 3, 100, 9100)).unwrap();
        table.add_app(app(1, 3, 101, 9101)).unwrap();
        table.bind_worker(9100, 555);

        let released = table.detach_vm(1);
        assert_eq!(released.len(), 2);
        assert_eq!(table.vm_by_pid(555), None);
        // A worker announcing after detach parks instead of binding.
        assert_eq!(table.bind_worker(9101, 556), None);
    }

    #[test]
    fn checked_vm_id_bounds() {
        assert_eq!(checked_vm_id(0), None);
        assert_eq!(checked_vm_id(1), Some(1));
        assert_eq!(checked_vm_id(MAX_VM as i64), Some(MAX_VM));
        assert_eq!(checked_vm_id(MAX_VM as i64 + 1), None);
        assert_eq!(checked_vm_id(-3), None);
    }
}
