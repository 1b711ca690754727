use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use crate::accounting::SampleWindow;
use crate::config::MediatorConfig;
use crate::policy::CheckOutcome;
use crate::transport::CommandHeader;
use crate::vm::{VmId, MAX_VM};

/// Mutable refill state, touched only by the timer tick and VM lifecycle.
/// The admission and consume paths never take this lock.
struct RateState {
    live: [bool; MAX_VM + 1],
    refill_budget: [i32; MAX_VM + 1],
    tot_shares: i32,
}

struct RateShared {
    limit_base: i32,
    budget_base: i32,
    period_ms: u32,
    shares: [i32; MAX_VM + 1],

    /// Admission tokens; positive admits, non-positive blocks.
    balance: [AtomicI32; MAX_VM + 1],
    /// Consumption accumulator since the last tick.
    sample_count: [AtomicI32; MAX_VM + 1],
    /// Moving-average window over per-tick consumption.
    windows: [SampleWindow; MAX_VM + 1],

    state: Mutex<RateState>,

    /// Single waiter queue shared across VMs: every tick wakes everyone and
    /// each waiter re-checks its own balance.
    refill_wakeup: Notify,

    ticks: AtomicU64,
}

/// Per-VM command-rate throttle: a token bucket refilled by a periodic
/// timer, with a budget that adapts toward the configured share split under
/// contention.
pub struct CommandRatePolicy {
    shared: Arc<RateShared>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Point-in-time view of one VM's rate state (for observability).
#[derive(Debug, Clone, Serialize)]
pub struct RateVmSnapshot {
    pub vm_id: VmId,
    pub balance: i32,
    pub refill_budget: i32,
    pub recent_sum: i64,
    pub share: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateSnapshot {
    pub tot_shares: i32,
    pub ticks: u64,
    pub vms: Vec<RateVmSnapshot>,
}

impl CommandRatePolicy {
    pub fn new(config: &MediatorConfig) -> Self {
        Self {
            shared: Arc::new(RateShared {
                limit_base: config.rate_limit_base,
                budget_base: config.rate_budget_base,
                period_ms: config.rate_period_ms,
                shares: config.rate_shares,
                balance: std::array::from_fn(|_| AtomicI32::new(0)),
                sample_count: std::array::from_fn(|_| AtomicI32::new(0)),
                windows: std::array::from_fn(|_| SampleWindow::new()),
                state: Mutex::new(RateState {
                    live: [false; MAX_VM + 1],
                    refill_budget: [0; MAX_VM + 1],
                    tot_shares: 0,
                }),
                refill_wakeup: Notify::new(),
                ticks: AtomicU64::new(0),
            }),
            timer: Mutex::new(None),
        }
    }

    /// Zero all balances and arm the refill timer. Must run inside a tokio
    /// runtime.
    pub fn engine_init(&self) {
        for vm in 1..=MAX_VM {
            self.shared.balance[vm].store(0, Ordering::Relaxed);
        }
        {
            let mut state = self.shared.state.lock();
            state.live = [false; MAX_VM + 1];
            state.refill_budget = [0; MAX_VM + 1];
            state.tot_shares = 0;
        }

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(shared.period_ms as u64));
            // Absolute-time basis; missed ticks do not accumulate.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await; // completes immediately; first refill is one period out
            loop {
                ticker.tick().await;
                shared.refill_tick();
            }
        });
        *self.timer.lock() = Some(handle);
    }

    /// Stop the refill timer. Waiters stay parked until the host cancels
    /// their checks.
    pub fn engine_release(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
            debug!("command-rate refill timer stopped");
        }
    }

    /// Account the new VM's share and rescale every live VM's refill budget
    /// to the grown total.
    pub fn vm_init(&self, vm_id: VmId) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        state.live[vm_id] = true;
        state.tot_shares += shared.shares[vm_id];
        for vm in 1..=MAX_VM {
            if state.live[vm] {
                state.refill_budget[vm] = shared.budget_base * state.tot_shares;
            }
        }
        shared.balance[vm_id].store(state.refill_budget[vm_id], Ordering::Relaxed);
        shared.sample_count[vm_id].store(0, Ordering::Relaxed);
        shared.windows[vm_id].reset();
        debug!(
            vm = vm_id,
            tot_shares = state.tot_shares,
            budget = state.refill_budget[vm_id],
            "command-rate vm attached"
        );
    }

    pub fn vm_release(&self, vm_id: VmId) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if !state.live[vm_id] {
            debug!(vm = vm_id, "command-rate release of unattached vm ignored");
            return;
        }
        state.live[vm_id] = false;
        state.tot_shares -= shared.shares[vm_id];
        debug_assert!(state.tot_shares >= 0, "tot_shares went negative");
        if state.tot_shares < 0 {
            error!(tot_shares = state.tot_shares, "tot_shares went negative");
        }
        for vm in 1..=MAX_VM {
            if state.live[vm] {
                state.refill_budget[vm] = shared.budget_base * state.tot_shares;
            }
        }
    }

    /// Block until the VM has a positive balance, or until `cancel` fires.
    /// Cancellation returns without admission; the caller drops the packet.
    pub async fn check(
        &self,
        vm_id: VmId,
        _command: &CommandHeader,
        cancel: &watch::Receiver<bool>,
    ) -> CheckOutcome {
        let shared = &self.shared;
        if shared.balance[vm_id].load(Ordering::Relaxed) > 0 {
            return CheckOutcome::Admitted;
        }
        debug!(
            vm = vm_id,
            balance = shared.balance[vm_id].load(Ordering::Relaxed),
            "command-rate budget exhausted, waiting for refill"
        );

        let mut cancel = cancel.clone();
        loop {
            let notified = shared.refill_wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Re-check after registering so a refill between the first check
            // and here is not missed.
            if shared.balance[vm_id].load(Ordering::Relaxed) > 0 {
                return CheckOutcome::Admitted;
            }
            if *cancel.borrow() {
                return CheckOutcome::Denied;
            }

            tokio::select! {
                _ = &mut notified => {}
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return CheckOutcome::Denied;
                    }
                }
            }
        }
    }

    /// Account consumed commands. Lock-free: both updates are single
    /// atomics.
    pub fn consume(&self, vm_id: VmId, consumed: i32) {
        self.shared.balance[vm_id].fetch_sub(consumed, Ordering::Relaxed);
        self.shared.sample_count[vm_id].fetch_add(consumed, Ordering::Relaxed);
    }

    pub fn balance(&self, vm_id: VmId) -> i32 {
        self.shared.balance[vm_id].load(Ordering::Relaxed)
    }

    pub fn refill_budget(&self, vm_id: VmId) -> i32 {
        self.shared.state.lock().refill_budget[vm_id]
    }

    pub fn tot_shares(&self) -> i32 {
        self.shared.state.lock().tot_shares
    }

    pub fn ticks(&self) -> u64 {
        self.shared.ticks.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> RateSnapshot {
        let shared = &self.shared;
        let state = shared.state.lock();
        let vms = (1..=MAX_VM)
            .filter(|vm| state.live[*vm])
            .map(|vm| RateVmSnapshot {
                vm_id: vm,
                balance: shared.balance[vm].load(Ordering::Relaxed),
                refill_budget: state.refill_budget[vm],
                recent_sum: shared.windows[vm].sum(),
                share: shared.shares[vm],
            })
            .collect();
        RateSnapshot {
            tot_shares: state.tot_shares,
            ticks: shared.ticks.load(Ordering::Relaxed),
            vms,
        }
    }

    #[cfg(test)]
    pub(crate) fn force_tick(&self) {
        self.shared.refill_tick();
    }
}

impl Drop for CommandRatePolicy {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }
}

impl RateShared {
    /// One refill period: rotate the consumption windows, adapt each live
    /// VM's budget, replenish balances, wake every waiter.
    fn refill_tick(&self) {
        let period = self.period_ms as i64;
        let mut state = self.state.lock();

        // Rotate the moving averages and collect this tick's total.
        let mut tot_counts: i64 = 0;
        for vm in 1..=MAX_VM {
            if !state.live[vm] {
                continue;
            }
            let taken = self.sample_count[vm].swap(0, Ordering::Relaxed) as i64;
            self.windows[vm].rotate(taken);
            tot_counts += taken;
        }

        for vm in 1..=MAX_VM {
            if !state.live[vm] {
                continue;
            }

            // Scale with tot_shares while there is spare capacity; fall back
            // to the per-VM share split once the aggregate rate passes 0.9x
            // of the fleet limit.
            let (limit, budget): (i64, i64) = if tot_counts * 10_000 / period
                < (self.limit_base * state.tot_shares * 9) as i64
            {
                (
                    (self.limit_base * state.tot_shares) as i64,
                    (self.budget_base * state.tot_shares) as i64,
                )
            } else {
                (
                    (self.limit_base * self.shares[vm]) as i64,
                    (self.budget_base * self.shares[vm]) as i64,
                )
            };

            let current = state.refill_budget[vm] as i64;
            if (current - budget).abs() > (self.budget_base >> 1) as i64 {
                state.refill_budget[vm] = budget as i32;
            }

            // Adaptive nudge, active only once the recent rate clears the
            // activity gate. The asymmetric band (dec above target, inc up
            // to target+3) keeps the budget from oscillating at steady
            // state.
            let recent = self.windows[vm].sum();
            if recent * 1_000 / period > limit * 4 {
                let current = state.refill_budget[vm] as i64;
                if recent * 200 / period > limit && current > budget {
                    state.refill_budget[vm] -= 1;
                } else if recent * 200 / period < limit && current <= budget + 3 {
                    state.refill_budget[vm] += 1;
                }
            }

            // Waiters absorb the addition when the balance went negative.
            let balance = &self.balance[vm];
            if balance.load(Ordering::Relaxed) > 0 {
                balance.store(state.refill_budget[vm], Ordering::Relaxed);
            } else {
                balance.fetch_add(state.refill_budget[vm], Ordering::Relaxed);
            }
        }

        drop(state);
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.refill_wakeup.notify_waiters();
    }
}
