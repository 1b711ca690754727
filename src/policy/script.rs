use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::config::MediatorConfig;
use crate::vm::{VmId, MAX_VM};

/// Verdict codes a `vm_schedule` program returns.
pub const VERDICT_CONTINUE: i64 = 0;
pub const VERDICT_DELAY: i64 = 1;
pub const VERDICT_ERROR: i64 = 2;

pub const MAX_SCRIPT_MAPS: usize = 8;
pub const MAX_PROGRAM_OPS: usize = 256;

const STACK_LIMIT: usize = 64;

/// One instruction of a user-supplied policy program. Programs run on a
/// small stack machine with read access to the per-packet context and
/// read/write access to the policy's maps, nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOp {
    PushConst(i64),
    PushVmId,
    PushCmdId,
    PushAmount,
    /// Pops a key, pushes `map[key]`.
    MapGet(u8),
    /// Pops a value, then a key; stores into `map[key]`.
    MapSet(u8),
    /// Pops a delta, then a key; atomically adds to `map[key]`.
    MapAdd(u8),
    Add,
    Sub,
    Mul,
    Div,
    Dup,
    Jump(u16),
    /// Pops; jumps when zero.
    JumpIfZero(u16),
    /// Pops; jumps when negative.
    JumpIfNeg(u16),
    /// Pops the program's return code.
    Return,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptVerdict {
    Continue,
    Delay,
    Error,
}

impl ScriptVerdict {
    pub fn from_code(code: i64) -> Self {
        match code {
            VERDICT_CONTINUE => ScriptVerdict::Continue,
            VERDICT_DELAY => ScriptVerdict::Delay,
            _ => ScriptVerdict::Error,
        }
    }
}

/// Why a program was refused at install time.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("{entry}: empty program")]
    Empty { entry: &'static str },
    #[error("{entry}: program exceeds {MAX_PROGRAM_OPS} ops")]
    TooLong { entry: &'static str },
    #[error("{entry}: jump target {target} out of bounds at op {at}")]
    BadJump {
        entry: &'static str,
        at: usize,
        target: usize,
    },
    #[error("{entry}: map #{map} out of range at op {at}")]
    BadMap {
        entry: &'static str,
        at: usize,
        map: usize,
    },
    #[error("{entry}: program can fall off the end")]
    NotTerminated { entry: &'static str },
    #[error("too many maps: {0} (max {MAX_SCRIPT_MAPS})")]
    TooManyMaps(usize),
}

/// Why a program run was aborted. Faults surface as an `Error` verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecFault {
    StackOverflow,
    StackUnderflow,
    StepBudget,
    DivByZero,
    BadKey,
    BadMap,
    PcOverrun,
}

/// Per-packet context a program may read.
#[derive(Debug, Clone, Copy)]
pub struct ScriptContext {
    pub vm_id: i64,
    pub cmd_id: i64,
    pub amount: i64,
}

/// Programs to install, keyed by the four fixed entry points. Any entry may
/// be absent.
#[derive(Debug, Default, Clone)]
pub struct ScriptPolicySpec {
    pub map_count: usize,
    pub vm_init: Option<Vec<ScriptOp>>,
    pub vm_fini: Option<Vec<ScriptOp>>,
    pub vm_schedule: Option<Vec<ScriptOp>>,
    pub vm_consume: Option<Vec<ScriptOp>>,
}

/// An `i64` array map keyed by VM id; slot 0 is the aggregate bucket.
struct ScriptMap {
    slots: [AtomicI64; MAX_VM + 1],
}

impl ScriptMap {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicI64::new(0)),
        }
    }
}

/// A verified, installable scripted policy: up to four programs sharing a
/// set of bounded maps, executed under a step budget on every invocation.
pub struct ScriptPolicy {
    maps: Vec<ScriptMap>,
    vm_init: Option<Box<[ScriptOp]>>,
    vm_fini: Option<Box<[ScriptOp]>>,
    vm_schedule: Option<Box<[ScriptOp]>>,
    vm_consume: Option<Box<[ScriptOp]>>,
    max_steps: u32,
    period_ms: u32,
    max_tries: u32,
}

/// Structural verification: every jump lands inside the program, every map
/// reference exists, and control flow cannot fall off the end. Semantic
/// safety comes from the interpreter's step and stack bounds.
fn verify(entry: &'static str, ops: &[ScriptOp], map_count: usize) -> Result<(), ScriptError> {
    if ops.is_empty() {
        return Err(ScriptError::Empty { entry });
    }
    if ops.len() > MAX_PROGRAM_OPS {
        return Err(ScriptError::TooLong { entry });
    }
    for (at, op) in ops.iter().enumerate() {
        match *op {
            ScriptOp::Jump(target) | ScriptOp::JumpIfZero(target) | ScriptOp::JumpIfNeg(target) => {
                if target as usize >= ops.len() {
                    return Err(ScriptError::BadJump {
                        entry,
                        at,
                        target: target as usize,
                    });
                }
            }
            ScriptOp::MapGet(map) | ScriptOp::MapSet(map) | ScriptOp::MapAdd(map) => {
                if map as usize >= map_count {
                    return Err(ScriptError::BadMap {
                        entry,
                        at,
                        map: map as usize,
                    });
                }
            }
            _ => {}
        }
    }
    match ops[ops.len() - 1] {
        ScriptOp::Return | ScriptOp::Jump(_) => Ok(()),
        _ => Err(ScriptError::NotTerminated { entry }),
    }
}

fn push(stack: &mut [i64; STACK_LIMIT], sp: &mut usize, value: i64) -> Result<(), ExecFault> {
    if *sp >= STACK_LIMIT {
        return Err(ExecFault::StackOverflow);
    }
    stack[*sp] = value;
    *sp += 1;
    Ok(())
}

fn pop(stack: &[i64; STACK_LIMIT], sp: &mut usize) -> Result<i64, ExecFault> {
    if *sp == 0 {
        return Err(ExecFault::StackUnderflow);
    }
    *sp -= 1;
    Ok(stack[*sp])
}

impl ScriptPolicy {
    /// Verify and assemble a scripted policy. Refuses programs that fail
    /// the structural check.
    pub fn new(spec: ScriptPolicySpec, config: &MediatorConfig) -> Result<Self, ScriptError> {
        if spec.map_count > MAX_SCRIPT_MAPS {
            return Err(ScriptError::TooManyMaps(spec.map_count));
        }
        let compile = |entry: &'static str,
                       ops: Option<Vec<ScriptOp>>|
         -> Result<Option<Box<[ScriptOp]>>, ScriptError> {
            match ops {
                Some(ops) => {
                    verify(entry, &ops, spec.map_count)?;
                    Ok(Some(ops.into_boxed_slice()))
                }
                None => Ok(None),
            }
        };
        Ok(Self {
            maps: (0..spec.map_count).map(|_| ScriptMap::new()).collect(),
            vm_init: compile("vm_init", spec.vm_init)?,
            vm_fini: compile("vm_fini", spec.vm_fini)?,
            vm_schedule: compile("vm_schedule", spec.vm_schedule)?,
            vm_consume: compile("vm_consume", spec.vm_consume)?,
            max_steps: config.script_max_steps,
            period_ms: config.schedule_period_ms,
            max_tries: config.schedule_max_tries(),
        })
    }

    fn run(&self, ops: &[ScriptOp], ctx: &ScriptContext) -> Result<i64, ExecFault> {
        let mut stack = [0i64; STACK_LIMIT];
        let mut sp = 0usize;
        let mut pc = 0usize;
        let mut steps = 0u32;

        loop {
            if steps >= self.max_steps {
                return Err(ExecFault::StepBudget);
            }
            steps += 1;
            let Some(op) = ops.get(pc) else {
                return Err(ExecFault::PcOverrun);
            };
            pc += 1;

            match *op {
                ScriptOp::PushConst(value) => push(&mut stack, &mut sp, value)?,
                ScriptOp::PushVmId => push(&mut stack, &mut sp, ctx.vm_id)?,
                ScriptOp::PushCmdId => push(&mut stack, &mut sp, ctx.cmd_id)?,
                ScriptOp::PushAmount => push(&mut stack, &mut sp, ctx.amount)?,
                ScriptOp::MapGet(map) => {
                    let key = pop(&stack, &mut sp)?;
                    let value = self.slot(map, key)?.load(Ordering::Relaxed);
                    push(&mut stack, &mut sp, value)?;
                }
                ScriptOp::MapSet(map) => {
                    let value = pop(&stack, &mut sp)?;
                    let key = pop(&stack, &mut sp)?;
                    self.slot(map, key)?.store(value, Ordering::Relaxed);
                }
                ScriptOp::MapAdd(map) => {
                    let delta = pop(&stack, &mut sp)?;
                    let key = pop(&stack, &mut sp)?;
                    self.slot(map, key)?.fetch_add(delta, Ordering::Relaxed);
                }
                ScriptOp::Add => {
                    let rhs = pop(&stack, &mut sp)?;
                    let lhs = pop(&stack, &mut sp)?;
                    push(&mut stack, &mut sp, lhs.wrapping_add(rhs))?;
                }
                ScriptOp::Sub => {
                    let rhs = pop(&stack, &mut sp)?;
                    let lhs = pop(&stack, &mut sp)?;
                    push(&mut stack, &mut sp, lhs.wrapping_sub(rhs))?;
                }
                ScriptOp::Mul => {
                    let rhs = pop(&stack, &mut sp)?;
                    let lhs = pop(&stack, &mut sp)?;
                    push(&mut stack, &mut sp, lhs.wrapping_mul(rhs))?;
                }
                ScriptOp::Div => {
                    let rhs = pop(&stack, &mut sp)?;
                    let lhs = pop(&stack, &mut sp)?;
                    if rhs == 0 {
                        return Err(ExecFault::DivByZero);
                    }
                    push(&mut stack, &mut sp, lhs.wrapping_div(rhs))?;
                }
                ScriptOp::Dup => {
                    let top = pop(&stack, &mut sp)?;
                    push(&mut stack, &mut sp, top)?;
                    push(&mut stack, &mut sp, top)?;
                }
                ScriptOp::Jump(target) => pc = target as usize,
                ScriptOp::JumpIfZero(target) => {
                    if pop(&stack, &mut sp)? == 0 {
                        pc = target as usize;
                    }
                }
                ScriptOp::JumpIfNeg(target) => {
                    if pop(&stack, &mut sp)? < 0 {
                        pc = target as usize;
                    }
                }
                ScriptOp::Return => return pop(&stack, &mut sp),
            }
        }
    }

    fn slot(&self, map: u8, key: i64) -> Result<&AtomicI64, ExecFault> {
        let map = self.maps.get(map as usize).ok_or(ExecFault::BadMap)?;
        if !(0..=MAX_VM as i64).contains(&key) {
            return Err(ExecFault::BadKey);
        }
        Ok(&map.slots[key as usize])
    }

    pub fn vm_init(&self, vm_id: VmId) {
        self.fire("vm_init", &self.vm_init, vm_id, 0, 0);
    }

    pub fn vm_fini(&self, vm_id: VmId) {
        self.fire("vm_fini", &self.vm_fini, vm_id, 0, 0);
    }

    /// Fire a consume report at the `vm_consume` program.
    pub fn consume(&self, vm_id: VmId, amount: i64) {
        self.fire("vm_consume", &self.vm_consume, vm_id, 0, amount);
    }

    fn fire(
        &self,
        entry: &'static str,
        program: &Option<Box<[ScriptOp]>>,
        vm_id: VmId,
        cmd_id: i64,
        amount: i64,
    ) {
        let Some(ops) = program else { return };
        let ctx = ScriptContext {
            vm_id: vm_id as i64,
            cmd_id,
            amount,
        };
        match self.run(ops, &ctx) {
            Ok(0) => {}
            Ok(status) => debug!(vm = vm_id, entry, status, "script returned nonzero status"),
            Err(fault) => debug!(vm = vm_id, entry, ?fault, "script faulted"),
        }
    }

    /// Run the `vm_schedule` program until it stops asking for delay. The
    /// iteration bound holds regardless of what the program returns; a
    /// faulting or `Error`-returning program admits fail-open.
    pub async fn schedule(&self, vm_id: VmId, cmd_id: i64) {
        let Some(ops) = &self.vm_schedule else { return };
        let ctx = ScriptContext {
            vm_id: vm_id as i64,
            cmd_id,
            amount: 0,
        };
        let mut tries = 0u32;
        loop {
            let verdict = match self.run(ops, &ctx) {
                Ok(code) => ScriptVerdict::from_code(code),
                Err(fault) => {
                    debug!(vm = vm_id, ?fault, "vm_schedule faulted, admitting");
                    return;
                }
            };
            match verdict {
                ScriptVerdict::Continue => return,
                ScriptVerdict::Error => {
                    debug!(vm = vm_id, "vm_schedule returned error verdict, admitting");
                    return;
                }
                ScriptVerdict::Delay => {
                    if tries >= self.max_tries {
                        debug!(vm = vm_id, "vm_schedule delay bound reached, admitting");
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(self.period_ms as u64)).await;
                    tries += 1;
                }
            }
        }
    }

    /// Host-side map read (observability, tests).
    pub fn map_load(&self, map: usize, key: usize) -> Option<i64> {
        let map = self.maps.get(map)?;
        let slot = map.slots.get(key)?;
        Some(slot.load(Ordering::Relaxed))
    }

    /// Host-side map write; how the control plane seeds weights before
    /// attaching VMs, the way the userspace loaders prime array maps.
    pub fn map_store(&self, map: usize, key: usize, value: i64) -> bool {
        let Some(map) = self.maps.get(map) else {
            return false;
        };
        let Some(slot) = map.slots.get(key) else {
            return false;
        };
        slot.store(value, Ordering::Relaxed);
        true
    }
}
