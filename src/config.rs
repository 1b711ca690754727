use anyhow::{bail, Result};

use crate::vm::MAX_VM;

/// Tunables for the mediation core.
///
/// Loaded from the environment with compile-time defaults as fallback; the
/// per-VM share and priority tables parse from comma-separated lists indexed
/// from VM id 1.
#[derive(Debug, Clone)]
pub struct MediatorConfig {
    /// Per-share command-rate limit, in commands per refill period.
    pub rate_limit_base: i32,

    /// Per-share nominal refill budget added each tick.
    pub rate_budget_base: i32,

    /// Refill timer period in milliseconds.
    pub rate_period_ms: u32,

    /// Per-VM share weights for the command-rate policy (index = VM id).
    pub rate_shares: [i32; MAX_VM + 1],

    /// Per-VM priority weights for the device-time policies (index = VM id).
    pub priorities: [i32; MAX_VM + 1],

    /// Device-time scheduling grain in milliseconds; also the scripted
    /// schedule loop's retry sleep.
    pub schedule_period_ms: u32,

    /// Upper bound on time spent in a blocking schedule loop before the
    /// check returns best-effort. The loop iterates at most
    /// `schedule_timeout_ms / schedule_period_ms` times.
    pub schedule_timeout_ms: u32,

    /// Per-VM outbound ring capacity; rounded up to a power of two.
    pub send_ring_capacity: usize,

    /// Well-known admin port; traffic to it bypasses interposition.
    pub control_port: u32,

    /// Step budget for one scripted-policy program run.
    pub script_max_steps: u32,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            rate_limit_base: 100,
            rate_budget_base: 10,
            rate_period_ms: 10,
            rate_shares: default_table(),
            priorities: default_table(),
            schedule_period_ms: 5,
            schedule_timeout_ms: 5_000,
            send_ring_capacity: 64,
            control_port: 4000,
            script_max_steps: 4_096,
        }
    }
}

/// All VMs weighted 1; index 0 (the aggregate bucket) carries no weight.
fn default_table() -> [i32; MAX_VM + 1] {
    let mut table = [1; MAX_VM + 1];
    table[0] = 0;
    table
}

/// Parse a comma-separated weight list into a table indexed from VM id 1.
/// Unparseable or negative entries keep the default weight of 1.
fn parse_table(raw: &str) -> [i32; MAX_VM + 1] {
    let mut table = default_table();
    for (slot, item) in table.iter_mut().skip(1).zip(raw.split(',')) {
        if let Ok(value) = item.trim().parse::<i32>() {
            if value >= 0 {
                *slot = value;
            }
        }
    }
    table
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl MediatorConfig {
    pub fn from_env() -> Result<Self> {
        // Load .env if present (not required)
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            rate_limit_base: env_parse("MEDIATOR_RATE_LIMIT_BASE", defaults.rate_limit_base),
            rate_budget_base: env_parse("MEDIATOR_RATE_BUDGET_BASE", defaults.rate_budget_base),
            rate_period_ms: env_parse("MEDIATOR_RATE_PERIOD_MS", defaults.rate_period_ms),
            rate_shares: std::env::var("MEDIATOR_RATE_SHARES")
                .map(|v| parse_table(&v))
                .unwrap_or(defaults.rate_shares),
            priorities: std::env::var("MEDIATOR_PRIORITIES")
                .map(|v| parse_table(&v))
                .unwrap_or(defaults.priorities),
            schedule_period_ms: env_parse(
                "MEDIATOR_SCHEDULE_PERIOD_MS",
                defaults.schedule_period_ms,
            ),
            schedule_timeout_ms: env_parse(
                "MEDIATOR_SCHEDULE_TIMEOUT_MS",
                defaults.schedule_timeout_ms,
            ),
            send_ring_capacity: env_parse("MEDIATOR_SEND_RING_CAPACITY", defaults.send_ring_capacity),
            control_port: env_parse("MEDIATOR_CONTROL_PORT", defaults.control_port),
            script_max_steps: env_parse("MEDIATOR_SCRIPT_MAX_STEPS", defaults.script_max_steps),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rate_period_ms == 0 {
            bail!("MEDIATOR_RATE_PERIOD_MS must be positive");
        }
        if self.schedule_period_ms == 0 {
            bail!("MEDIATOR_SCHEDULE_PERIOD_MS must be positive");
        }
        if self.rate_budget_base <= 0 || self.rate_limit_base <= 0 {
            bail!("rate limit and budget bases must be positive");
        }
        if self.send_ring_capacity == 0 {
            bail!("MEDIATOR_SEND_RING_CAPACITY must be positive");
        }
        Ok(())
    }

    /// Scheduling grain in microseconds.
    pub fn schedule_period_us(&self) -> i64 {
        self.schedule_period_ms as i64 * 1_000
    }

    /// Iteration bound for blocking schedule loops.
    pub fn schedule_max_tries(&self) -> u32 {
        (self.schedule_timeout_ms / self.schedule_period_ms.max(1)).max(1)
    }
}
