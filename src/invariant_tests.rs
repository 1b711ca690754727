//! Property tests over random attach/detach/consume schedules: the share
//! and used-time totals must equal the sum of their parts at every
//! quiescent instant, and detached VMs must leave nothing behind.

use proptest::prelude::*;

use crate::config::MediatorConfig;
use crate::policy::command_rate::CommandRatePolicy;
use crate::policy::device_time::DeviceTimePolicy;
use crate::vm::MAX_VM;

/// Exercise at most this many VMs so schedules collide often.
const VMS: usize = 6;

#[derive(Debug, Clone)]
enum RateOp {
    Attach(usize),
    Detach(usize),
    Consume(usize, i32),
    Tick,
}

fn arb_rate_op() -> impl Strategy<Value = RateOp> {
    prop_oneof![
        (1..=VMS).prop_map(RateOp::Attach),
        (1..=VMS).prop_map(RateOp::Detach),
        ((1..=VMS), (1..=40i32)).prop_map(|(vm, n)| RateOp::Consume(vm, n)),
        Just(RateOp::Tick),
    ]
}

#[derive(Debug, Clone)]
enum TimeOp {
    AppInit(usize),
    AppRelease(usize),
    Consume(usize, i64),
}

fn arb_time_op() -> impl Strategy<Value = TimeOp> {
    prop_oneof![
        (1..=VMS).prop_map(TimeOp::AppInit),
        (1..=VMS).prop_map(TimeOp::AppRelease),
        ((1..=VMS), (1..=10_000i64)).prop_map(|(vm, us)| TimeOp::Consume(vm, us)),
    ]
}

fn shares_config() -> MediatorConfig {
    let mut config = MediatorConfig::default();
    for vm in 1..=VMS {
        config.rate_shares[vm] = vm as i32; // distinct weights
        config.priorities[vm] = ((vm - 1) % 3 + 1) as i32;
    }
    config
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// tot_shares equals the share sum over currently attached VMs after
    /// every operation in any schedule.
    #[test]
    fn total_shares_matches_attached_sum(ops in prop::collection::vec(arb_rate_op(), 1..120)) {
        let config = shares_config();
        let policy = CommandRatePolicy::new(&config);
        let mut attached = [false; MAX_VM + 1];

        for op in ops {
            match op {
                RateOp::Attach(vm) if !attached[vm] => {
                    attached[vm] = true;
                    policy.vm_init(vm);
                }
                RateOp::Detach(vm) if attached[vm] => {
                    attached[vm] = false;
                    policy.vm_release(vm);
                }
                RateOp::Consume(vm, n) if attached[vm] => policy.consume(vm, n),
                RateOp::Tick => policy.force_tick(),
                _ => {}
            }

            let expected: i32 = (1..=VMS)
                .filter(|vm| attached[*vm])
                .map(|vm| config.rate_shares[vm])
                .sum();
            prop_assert_eq!(policy.tot_shares(), expected);
        }
    }

    /// The refill budget stays within the configured envelope: never
    /// negative, never past the fleet-wide ceiling (plus the +-base/2
    /// adaptation band around it).
    #[test]
    fn refill_budget_stays_bounded(ops in prop::collection::vec(arb_rate_op(), 1..120)) {
        let config = shares_config();
        let max_total: i32 = (1..=VMS).map(|vm| config.rate_shares[vm]).sum();
        let ceiling = config.rate_budget_base * max_total + config.rate_budget_base / 2;
        let policy = CommandRatePolicy::new(&config);
        let mut attached = [false; MAX_VM + 1];

        for op in ops {
            match op {
                RateOp::Attach(vm) if !attached[vm] => {
                    attached[vm] = true;
                    policy.vm_init(vm);
                }
                RateOp::Detach(vm) if attached[vm] => {
                    attached[vm] = false;
                    policy.vm_release(vm);
                }
                RateOp::Consume(vm, n) if attached[vm] => policy.consume(vm, n),
                RateOp::Tick => policy.force_tick(),
                _ => {}
            }

            for vm in 1..=VMS {
                if attached[vm] {
                    let budget = policy.refill_budget(vm);
                    prop_assert!((0..=ceiling).contains(&budget), "budget {} escaped", budget);
                }
            }
        }
    }

    /// total_used_time and total_priority equal the sums over live VMs for
    /// every schedule, and a released VM reads back as zero.
    #[test]
    fn device_time_totals_match_parts(ops in prop::collection::vec(arb_time_op(), 1..150)) {
        let config = shares_config();
        let policy = DeviceTimePolicy::new(&config);
        policy.engine_init();
        let mut live_apps = [0i32; MAX_VM + 1];

        for op in ops {
            match op {
                TimeOp::AppInit(vm) => {
                    live_apps[vm] += 1;
                    policy.app_init(vm);
                }
                TimeOp::AppRelease(vm) if live_apps[vm] > 0 => {
                    live_apps[vm] -= 1;
                    policy.app_release(vm);
                    if live_apps[vm] == 0 {
                        prop_assert_eq!(policy.priority(vm), 0);
                        prop_assert_eq!(policy.used_time(vm), 0);
                    }
                }
                TimeOp::Consume(vm, us) if live_apps[vm] > 0 => policy.consume(vm, us),
                _ => {}
            }

            let used_sum: i64 = (1..=VMS).map(|vm| policy.used_time(vm)).sum();
            prop_assert_eq!(policy.total_used_time(), used_sum);

            let priority_sum: i32 = (1..=VMS)
                .filter(|vm| live_apps[*vm] > 0)
                .map(|vm| config.priorities[vm])
                .sum();
            prop_assert_eq!(policy.total_priority(), priority_sum);
        }
    }
}
