//! Breakpoints and stepping policy, layered on top of the machine.
//!
//! The controller is what an interactive client talks to: it owns the
//! breakpoint set, knows how to resume past the breakpoint the machine is
//! currently stopped at, and expresses step-into/step-over in terms of
//! plain [`Machine::step`] and call-stack depth.


use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::codec::Instruction;
use crate::machine::{Machine, RunOptions, RunResult, Status, StepResult, StopReason};

/// Addresses at which execution pauses before the instruction there runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointSet {
    addrs: FxHashSet<u32>,
}

impl BreakpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent; returns whether the set changed.
    pub fn add(&mut self, addr: u32) -> bool {
        self.addrs.insert(addr)
    }

    /// Idempotent; returns whether the set changed.
    pub fn remove(&mut self, addr: u32) -> bool {
        self.addrs.remove(&addr)
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.addrs.contains(&addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.addrs.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn clear(&mut self) {
        self.addrs.clear()
    }
}

/// Caller-imposed limits on a resume or step-over; the machine itself has
/// no intrinsic timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StepLimits<'a> {
    pub max_steps: Option<usize>,
    pub cancel: Option<&'a AtomicBool>,
}

/// Drives one [`Machine`] on behalf of an interactive client.
#[derive(Debug)]
pub struct DebugController {
    machine: Machine,
    breakpoints: BreakpointSet,
}

impl DebugController {
    pub fn new(machine: Machine) -> Self {
        Self {
            machine,
            breakpoints: BreakpointSet::new(),
        }
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// Mutable access, e.g. to preset memory before a run.
    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    pub fn breakpoints(&self) -> &BreakpointSet {
        &self.breakpoints
    }

    pub fn add_breakpoint(&mut self, addr: u32) -> bool {
        tracing::debug!(addr = format!("0x{addr:05X}"), "add breakpoint");
        self.breakpoints.add(addr)
    }

    pub fn remove_breakpoint(&mut self, addr: u32) -> bool {
        tracing::debug!(addr = format!("0x{addr:05X}"), "remove breakpoint");
        self.breakpoints.remove(addr)
    }

    /// Run until the next breakpoint or stop condition. If the machine is
    /// paused on a breakpoint, that one is stepped over first so the run
    /// actually leaves it.
    pub fn resume(&mut self, limits: &StepLimits<'_>) -> RunResult {
        let resume_from = (self.machine.status() == Status::Paused
            && self.breakpoints.contains(self.machine.pc()))
        .then(|| self.machine.pc());

        let options = RunOptions {
            breakpoints: Some(&self.breakpoints),
            resume_from,
            max_steps: limits.max_steps,
            cancel: limits.cancel,
        };
        self.machine.run(&options)
    }

    /// Execute exactly one instruction, entering calls.
    pub fn step_into(&mut self) -> StepResult {
        self.machine.step()
    }

    /// Execute one instruction, but treat a call as one unit: run the
    /// callee until the call stack is back at its pre-call depth, or until
    /// halt, fault, or one of `limits` stops it early.
    pub fn step_over(&mut self, limits: &StepLimits<'_>) -> StepResult {
        let span = tracing::debug_span!("step_over", pc = format!("0x{:05X}", self.machine.pc()));
        let _guard = span.enter();

        let old_pc = self.machine.pc();
        let old_accu = self.machine.accu();
        let old_status = self.machine.status();

        if !matches!(self.machine.next_instruction(), Some(Instruction::Call(_))) {
            return self.machine.step();
        }

        let depth = self.machine.call_depth();
        let mut result = self.machine.step();
        let mut steps = 1usize;

        while !self.machine.status().is_terminal() && self.machine.call_depth() > depth {
            if limits
                .cancel
                .is_some_and(|cancel| cancel.load(Ordering::Relaxed))
            {
                tracing::debug!(steps, "step_over cancelled inside callee");
                break;
            }
            if limits.max_steps.is_some_and(|max| steps >= max) {
                tracing::debug!(steps, "step_over budget exhausted inside callee");
                break;
            }
            result = self.machine.step();
            steps += 1;
        }

        StepResult {
            old_pc,
            new_pc: self.machine.pc(),
            old_accu,
            new_accu: self.machine.accu(),
            executed: result.executed,
            transition: (self.machine.status() != old_status).then(|| self.machine.status()),
        }
    }

    /// Reset the machine; breakpoints survive a reset.
    pub fn reset(&mut self) {
        self.machine.reset();
    }

    /// True when the machine stopped because of a breakpoint at its
    /// current address.
    pub fn paused_at_breakpoint(&self) -> bool {
        self.machine.status() == Status::Paused && self.breakpoints.contains(self.machine.pc())
    }
}

/// Convenience: whether a run result means the program is finished rather
/// than merely suspended.
pub fn is_final(result: &RunResult) -> bool {
    matches!(result.stop, StopReason::Halted | StopReason::Faulted)
}
