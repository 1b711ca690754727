use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::accounting::{SampleWindow, WINDOW_SLOTS};
use crate::config::MediatorConfig;
use crate::policy::CheckOutcome;
use crate::vm::{VmId, MAX_VM};

/// Shortest and longest micro-sleep the cooperative wait loop takes.
const MIN_SLEEP_US: i64 = 500;
const MAX_SLEEP_US: i64 = 10_000;

/// Per-VM device-time accounting shared by both device-time policy
/// variants: app refcounts, priorities, used-time counters and the
/// delay-hint moving average. Everything on the consume path is a single
/// atomic update.
pub(crate) struct TimeLedger {
    priority_table: [i32; MAX_VM + 1],
    schedule_period_us: i64,

    live_apps: [AtomicI32; MAX_VM + 1],
    priority: [AtomicI32; MAX_VM + 1],
    total_priority: AtomicI32,

    used_time: [AtomicI64; MAX_VM + 1],
    total_used_time: AtomicI64,

    /// Sleep-grain steering hint, microseconds.
    delay_us: [AtomicI64; MAX_VM + 1],
    windows: [SampleWindow; MAX_VM + 1],
}

impl TimeLedger {
    pub(crate) fn new(config: &MediatorConfig) -> Self {
        Self {
            priority_table: config.priorities,
            schedule_period_us: config.schedule_period_us(),
            live_apps: std::array::from_fn(|_| AtomicI32::new(0)),
            priority: std::array::from_fn(|_| AtomicI32::new(0)),
            total_priority: AtomicI32::new(0),
            used_time: std::array::from_fn(|_| AtomicI64::new(0)),
            total_used_time: AtomicI64::new(0),
            delay_us: std::array::from_fn(|_| AtomicI64::new(0)),
            windows: std::array::from_fn(|_| SampleWindow::new()),
        }
    }

    pub(crate) fn engine_init(&self) {
        self.total_used_time.store(0, Ordering::Relaxed);
        for vm in 1..=MAX_VM {
            self.live_apps[vm].store(0, Ordering::Relaxed);
        }
    }

    /// First app of a VM activates its accounting: install the predefined
    /// priority, zero the used time, and seed the delay hint at one
    /// scheduling period.
    pub(crate) fn app_init(&self, vm_id: VmId) {
        if self.live_apps[vm_id].fetch_add(1, Ordering::Relaxed) + 1 == 1 {
            let priority = self.priority_table[vm_id];
            self.priority[vm_id].store(priority, Ordering::Relaxed);
            self.total_priority.fetch_add(priority, Ordering::Relaxed);
            self.used_time[vm_id].store(0, Ordering::Relaxed);
            self.windows[vm_id]
                .seed(self.schedule_period_us / WINDOW_SLOTS as i64);
            self.delay_us[vm_id].store(self.schedule_period_us, Ordering::Relaxed);
        }
    }

    /// Last app of a VM deactivates it: its priority and used time leave
    /// the totals, and reads of both return zero afterwards.
    pub(crate) fn app_release(&self, vm_id: VmId) {
        if self.live_apps[vm_id].load(Ordering::Relaxed) == 0 {
            debug!(vm = vm_id, "device-time release without live app ignored");
            return;
        }
        if self.live_apps[vm_id].fetch_sub(1, Ordering::Relaxed) - 1 == 0 {
            let priority = self.priority[vm_id].swap(0, Ordering::Relaxed);
            self.total_priority.fetch_sub(priority, Ordering::Relaxed);
            let used = self.used_time[vm_id].swap(0, Ordering::Relaxed);
            self.total_used_time.fetch_sub(used, Ordering::Relaxed);
            debug!(
                vm = vm_id,
                total_priority = self.total_priority.load(Ordering::Relaxed),
                "vm frees device-time budget"
            );
        }
    }

    /// The proportional-share admission predicate, cross-multiplied so no
    /// division is involved:
    /// `used_time[vm] * total_priority <= total_used_time * priority[vm]`.
    pub(crate) fn admitted(&self, vm_id: VmId) -> bool {
        let total_used = self.total_used_time.load(Ordering::Relaxed);
        let vm_used = self.used_time[vm_id].load(Ordering::Relaxed);
        let total_priority = self.total_priority.load(Ordering::Relaxed) as i64;
        let priority = self.priority[vm_id].load(Ordering::Relaxed) as i64;
        vm_used * total_priority <= total_used * priority
    }

    /// Account consumed device time and steer the delay hint toward one
    /// window-slot's worth of the observed per-call time.
    pub(crate) fn consume(&self, vm_id: VmId, micros: i64) {
        self.used_time[vm_id].fetch_add(micros, Ordering::Relaxed);
        self.total_used_time.fetch_add(micros, Ordering::Relaxed);

        let delta = self.windows[vm_id].shift(micros / WINDOW_SLOTS as i64);
        self.delay_us[vm_id].fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn delay_us(&self, vm_id: VmId) -> i64 {
        self.delay_us[vm_id].load(Ordering::Relaxed)
    }

    pub(crate) fn used_time(&self, vm_id: VmId) -> i64 {
        self.used_time[vm_id].load(Ordering::Relaxed)
    }

    pub(crate) fn total_used_time(&self) -> i64 {
        self.total_used_time.load(Ordering::Relaxed)
    }

    pub(crate) fn priority(&self, vm_id: VmId) -> i32 {
        self.priority[vm_id].load(Ordering::Relaxed)
    }

    pub(crate) fn total_priority(&self) -> i32 {
        self.total_priority.load(Ordering::Relaxed)
    }

    pub(crate) fn live_apps(&self, vm_id: VmId) -> i32 {
        self.live_apps[vm_id].load(Ordering::Relaxed)
    }

    pub(crate) fn snapshot(&self) -> DeviceTimeSnapshot {
        let vms = (1..=MAX_VM)
            .filter(|vm| self.live_apps[*vm].load(Ordering::Relaxed) > 0)
            .map(|vm| DeviceTimeVmSnapshot {
                vm_id: vm,
                live_apps: self.live_apps[vm].load(Ordering::Relaxed),
                priority: self.priority[vm].load(Ordering::Relaxed),
                used_time_us: self.used_time[vm].load(Ordering::Relaxed),
                delay_hint_us: self.delay_us[vm].load(Ordering::Relaxed),
            })
            .collect();
        DeviceTimeSnapshot {
            total_priority: self.total_priority.load(Ordering::Relaxed),
            total_used_time_us: self.total_used_time.load(Ordering::Relaxed),
            vms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceTimeVmSnapshot {
    pub vm_id: VmId,
    pub live_apps: i32,
    pub priority: i32,
    pub used_time_us: i64,
    pub delay_hint_us: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceTimeSnapshot {
    pub total_priority: i32,
    pub total_used_time_us: i64,
    pub vms: Vec<DeviceTimeVmSnapshot>,
}

/// Cooperative proportional-share scheduler over accumulated device time.
/// Checks sleep in bounded micro-intervals until the VM is back under its
/// share, giving up best-effort after the configured timeout.
pub struct DeviceTimePolicy {
    ledger: TimeLedger,
    max_tries: u32,
}

impl DeviceTimePolicy {
    pub fn new(config: &MediatorConfig) -> Self {
        Self {
            ledger: TimeLedger::new(config),
            max_tries: config.schedule_max_tries(),
        }
    }

    pub fn engine_init(&self) {
        self.ledger.engine_init();
    }

    pub fn app_init(&self, vm_id: VmId) {
        self.ledger.app_init(vm_id);
    }

    pub fn app_release(&self, vm_id: VmId) {
        self.ledger.app_release(vm_id);
    }

    /// Sleep until the VM's consumption is back within its proportional
    /// share. Starvation is bounded: after `max_tries` sleeps the check
    /// admits anyway.
    pub async fn check(&self, vm_id: VmId) -> CheckOutcome {
        let mut tries = 0u32;
        loop {
            if self.ledger.admitted(vm_id) {
                return CheckOutcome::Admitted;
            }
            if tries >= self.max_tries {
                debug!(vm = vm_id, "device-time wait bound reached, admitting");
                return CheckOutcome::Admitted;
            }
            let delay = (self.ledger.delay_us(vm_id) / 2).clamp(MIN_SLEEP_US, MAX_SLEEP_US);
            tokio::time::sleep(Duration::from_micros(delay as u64)).await;
            tries += 1;
        }
    }

    pub fn consume(&self, vm_id: VmId, micros: i64) {
        self.ledger.consume(vm_id, micros);
    }

    pub fn used_time(&self, vm_id: VmId) -> i64 {
        self.ledger.used_time(vm_id)
    }

    pub fn total_used_time(&self) -> i64 {
        self.ledger.total_used_time()
    }

    pub fn priority(&self, vm_id: VmId) -> i32 {
        self.ledger.priority(vm_id)
    }

    pub fn total_priority(&self) -> i32 {
        self.ledger.total_priority()
    }

    pub fn delay_hint_us(&self, vm_id: VmId) -> i64 {
        self.ledger.delay_us(vm_id)
    }

    pub fn snapshot(&self) -> DeviceTimeSnapshot {
        self.ledger.snapshot()
    }
}
