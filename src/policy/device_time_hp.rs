use std::time::Duration;

use crate::config::MediatorConfig;
use crate::policy::device_time::{DeviceTimeSnapshot, TimeLedger};
use crate::policy::CheckOutcome;
use crate::vm::VmId;

/// Ceiling on the delay hint before halving, microseconds. Keeps the loop
/// turning at sub-millisecond grain.
const HP_DELAY_CAP_US: i64 = 100;

/// High-precision variant of the device-time policy: identical accounting,
/// but the wait loop spins on a much finer sleep grain and is not bounded.
/// Callers are expected to hold a deadline around the check.
pub struct DeviceTimeHpPolicy {
    ledger: TimeLedger,
}

impl DeviceTimeHpPolicy {
    pub fn new(config: &MediatorConfig) -> Self {
        Self {
            ledger: TimeLedger::new(config),
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

    pub async fn check(&self, vm_id: VmId) -> CheckOutcome {
        loop {
            if self.ledger.admitted(vm_id) {
                return CheckOutcome::Admitted;
            }
            let mut delay = self.ledger.delay_us(vm_id);
            if delay > HP_DELAY_CAP_US {
                delay = HP_DELAY_CAP_US;
            }
            let delay = (delay / 2).max(0);
            tokio::time::sleep(Duration::from_micros(delay as u64)).await;
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

    pub fn total_priority(&self) -> i32 {
        self.ledger.total_priority()
    }

    pub fn snapshot(&self) -> DeviceTimeSnapshot {
        self.ledger.snapshot()
    }
}
