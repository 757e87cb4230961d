//! The interpreter: owns the loaded image and the mutable execution state,
//! and performs the fetch-decode-execute cycle one tick at a time.
//!
//! Nothing here blocks or spawns: `run` executes ticks until a stop
//! condition holds and returns. A long-running program is interrupted
//! between instructions through the cooperative cancel flag in
//! [`RunOptions`]; there is no preemption and no internal timeout.


use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

use crate::codec::{decode, Instruction};
use crate::debug::BreakpointSet;
use crate::image::MemoryImage;
use crate::word::{Word, ADDRESS_MASK, ADDRESS_RANGE};

/// Where the machine currently stands.
///
/// `Halted` and `Faulted` are terminal: once entered, only [`Machine::reset`]
/// leaves them. `Paused` covers every suspension that is not terminal —
/// a breakpoint hit, an exhausted step budget, a cancellation, or simply
/// having completed a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ready,
    Running,
    Paused,
    Halted,
    Faulted,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Halted | Status::Faulted)
    }
}

/// What went wrong during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum FaultKind {
    #[error("reserved opcode")]
    ReservedOpcode,
    #[error("address 0x{addr:05X} is outside the configured memory")]
    AddressOutOfRange { addr: u32 },
    #[error("return with an empty call stack")]
    CallStackUnderflow,
    #[error("call stack exceeded the configured depth limit")]
    CallStackOverflow,
}

/// A fault, tied to the address of the instruction that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("fault at 0x{at:05X}: {kind}")]
pub struct Fault {
    pub kind: FaultKind,
    pub at: u32,
}

/// Sizing knobs for a machine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Number of addressable words. Accesses at or past this fault.
    pub memory_size: u32,
    /// Upper bound on call nesting; `None` means unbounded.
    pub max_call_depth: Option<usize>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            memory_size: ADDRESS_RANGE,
            max_call_depth: None,
        }
    }
}

/// Outcome of a single [`Machine::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub old_pc: u32,
    pub new_pc: u32,
    pub old_accu: Word,
    pub new_accu: Word,
    /// The instruction that ran, `None` if the machine was already stopped
    /// or the fetch itself faulted.
    pub executed: Option<Instruction>,
    /// The status the machine moved to, if it changed.
    pub transition: Option<Status>,
}

/// Why [`Machine::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    Halted,
    Faulted,
    /// Paused at a breakpoint, before executing the instruction there.
    Breakpoint,
    /// The cancel flag was observed set.
    Cancelled,
    /// The step budget ran out.
    StepBudget,
}

/// Outcome of a [`Machine::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub stop: StopReason,
    /// Ticks executed during this call.
    pub steps: usize,
    /// Program counter when the loop stopped.
    pub pc: u32,
}

/// Stop conditions for [`Machine::run`], all optional.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunOptions<'a> {
    /// Pause before executing any address in this set.
    pub breakpoints: Option<&'a BreakpointSet>,
    /// Address the machine is currently paused at; a breakpoint there is
    /// ignored for the very first tick so the run can leave it behind.
    pub resume_from: Option<u32>,
    /// Execute at most this many ticks.
    pub max_steps: Option<usize>,
    /// Checked once per tick; set from another thread to interrupt.
    pub cancel: Option<&'a AtomicBool>,
}

/// Read-only copy of the observable machine state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub pc: u32,
    pub accu: Word,
    pub status: Status,
    pub fault: Option<Fault>,
    pub call_stack: Vec<u32>,
    /// First address of the dumped range.
    pub memory_base: u32,
    /// The dumped words, clamped to the configured memory.
    pub memory: Vec<Word>,
}

/// The virtual machine.
#[derive(Debug, Clone)]
pub struct Machine {
    memory: Vec<Word>,
    image: MemoryImage,
    config: MachineConfig,
    pc: u32,
    accu: Word,
    call_stack: Vec<u32>,
    status: Status,
    fault: Option<Fault>,
}

impl Machine {
    /// Load an image with the default configuration. Always succeeds;
    /// the machine takes sole ownership of its memory.
    pub fn load(image: MemoryImage) -> Machine {
        Self::load_with(image, MachineConfig::default())
    }

    pub fn load_with(image: MemoryImage, config: MachineConfig) -> Machine {
        let span = tracing::info_span!(
            "load",
            cells = image.len(),
            entry = format!("0x{:05X}", image.entry)
        );
        let _guard = span.enter();

        let mut machine = Machine {
            memory: vec![Word::ZERO; config.memory_size as usize],
            pc: image.entry & ADDRESS_MASK,
            accu: Word::ZERO,
            call_stack: Vec::new(),
            status: Status::Ready,
            fault: None,
            image,
            config,
        };
        machine.flash();
        machine
    }

    /// Copy the image into memory. Cells past the configured memory cannot
    /// be represented and are dropped with a log message.
    fn flash(&mut self) {
        for (addr, word) in self.image.iter() {
            if addr >= self.config.memory_size {
                tracing::error!(
                    addr = format!("0x{addr:05X}"),
                    "image cell is out of memory bounds, dropping"
                );
                continue;
            }
            tracing::trace!("memory[0x{:05X}] = {}", addr, word);
            self.memory[addr as usize] = word;
        }
    }

    /// Discard all execution state and reload the original image.
    pub fn reset(&mut self) {
        let span = tracing::info_span!("reset");
        let _guard = span.enter();

        self.memory.fill(Word::ZERO);
        self.flash();
        self.pc = self.image.entry & ADDRESS_MASK;
        self.accu = Word::ZERO;
        self.call_stack.clear();
        self.status = Status::Ready;
        self.fault = None;
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn accu(&self) -> Word {
        self.accu
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn fault(&self) -> Option<Fault> {
        self.fault
    }

    pub fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    pub fn image(&self) -> &MemoryImage {
        &self.image
    }

    /// Read a memory cell without touching execution state.
    pub fn peek(&self, addr: u32) -> Option<Word> {
        self.memory.get(addr as usize).copied()
    }

    /// Overwrite a memory cell, e.g. to preset test inputs before a run.
    /// Returns false if the address is outside the configured memory.
    pub fn poke(&mut self, addr: u32, word: Word) -> bool {
        match self.memory.get_mut(addr as usize) {
            Some(cell) => {
                *cell = word;
                true
            }
            None => false,
        }
    }

    pub fn set_accu(&mut self, word: Word) {
        self.accu = word;
    }

    /// Decode the instruction the program counter points at, if it points
    /// into memory. Does not mutate anything.
    pub fn next_instruction(&self) -> Option<Instruction> {
        self.peek(self.pc).map(decode)
    }

    /// Execute exactly one tick. On a machine that is already halted or
    /// faulted this is a no-op and the result says so.
    pub fn step(&mut self) -> StepResult {
        let span = tracing::debug_span!("step", pc = format!("0x{:05X}", self.pc));
        let _guard = span.enter();

        let old_status = self.status;
        let old_pc = self.pc;
        let old_accu = self.accu;

        if old_status.is_terminal() {
            tracing::debug!(status = ?old_status, "step on a stopped machine is a no-op");
            return StepResult {
                old_pc,
                new_pc: old_pc,
                old_accu,
                new_accu: old_accu,
                executed: None,
                transition: None,
            };
        }

        let executed = self.tick();
        if !self.status.is_terminal() {
            self.status = Status::Paused;
        }

        StepResult {
            old_pc,
            new_pc: self.pc,
            old_accu,
            new_accu: self.accu,
            executed,
            transition: (self.status != old_status).then_some(self.status),
        }
    }

    /// Tick until halted, faulted, a breakpoint is reached, the cancel flag
    /// fires or the step budget runs out. Returns immediately on a machine
    /// that is already stopped; it never runs past a terminal state.
    pub fn run(&mut self, options: &RunOptions<'_>) -> RunResult {
        let span = tracing::info_span!("run", pc = format!("0x{:05X}", self.pc));
        let _guard = span.enter();

        match self.status {
            Status::Halted => {
                return RunResult {
                    stop: StopReason::Halted,
                    steps: 0,
                    pc: self.pc,
                }
            }
            Status::Faulted => {
                return RunResult {
                    stop: StopReason::Faulted,
                    steps: 0,
                    pc: self.pc,
                }
            }
            _ => {}
        }

        self.status = Status::Running;
        let mut steps = 0usize;
        let mut first = true;

        loop {
            if let Some(cancel) = options.cancel {
                if cancel.load(Ordering::Relaxed) {
                    tracing::info!(steps, "cancelled between instructions");
                    self.status = Status::Paused;
                    return RunResult {
                        stop: StopReason::Cancelled,
                        steps,
                        pc: self.pc,
                    };
                }
            }

            if let Some(breakpoints) = options.breakpoints {
                let skip = first && options.resume_from == Some(self.pc);
                if breakpoints.contains(self.pc) && !skip {
                    tracing::info!(pc = format!("0x{:05X}", self.pc), "breakpoint");
                    self.status = Status::Paused;
                    return RunResult {
                        stop: StopReason::Breakpoint,
                        steps,
                        pc: self.pc,
                    };
                }
            }

            if let Some(max) = options.max_steps {
                if steps >= max {
                    tracing::info!(max, "step budget exhausted");
                    self.status = Status::Paused;
                    return RunResult {
                        stop: StopReason::StepBudget,
                        steps,
                        pc: self.pc,
                    };
                }
            }

            self.tick();
            steps += 1;
            first = false;

            match self.status {
                Status::Halted => {
                    tracing::info!(steps, "program halted");
                    return RunResult {
                        stop: StopReason::Halted,
                        steps,
                        pc: self.pc,
                    };
                }
                Status::Faulted => {
                    tracing::warn!(steps, fault = ?self.fault, "program faulted");
                    return RunResult {
                        stop: StopReason::Faulted,
                        steps,
                        pc: self.pc,
                    };
                }
                _ => {}
            }
        }
    }

    /// Read-only snapshot of registers, call stack and the given memory
    /// range. Never mutates; safe to call from an observer thread while the
    /// machine is not ticking.
    pub fn inspect(&self, memory_range: Range<u32>) -> Snapshot {
        let base = memory_range.start.min(self.config.memory_size);
        let end = memory_range.end.clamp(base, self.config.memory_size);
        Snapshot {
            pc: self.pc,
            accu: self.accu,
            status: self.status,
            fault: self.fault,
            call_stack: self.call_stack.clone(),
            memory_base: base,
            memory: self.memory[base as usize..end as usize].to_vec(),
        }
    }

    fn raise(&mut self, kind: FaultKind, at: u32) {
        tracing::warn!(?kind, at = format!("0x{at:05X}"), "execution fault");
        self.fault = Some(Fault { kind, at });
        self.status = Status::Faulted;
    }

    /// Load `addr` during the tick of the instruction at `at`, faulting on
    /// an out-of-range access.
    fn read(&mut self, addr: u32, at: u32) -> Option<Word> {
        match self.memory.get(addr as usize) {
            Some(&word) => Some(word),
            None => {
                self.raise(FaultKind::AddressOutOfRange { addr }, at);
                None
            }
        }
    }

    fn store(&mut self, addr: u32, word: Word, at: u32) {
        match self.memory.get_mut(addr as usize) {
            Some(cell) => {
                tracing::trace!("memory[0x{:05X}] = {}", addr, word);
                *cell = word;
            }
            None => self.raise(FaultKind::AddressOutOfRange { addr }, at),
        }
    }

    /// Combine the accumulator with a memory operand.
    fn binary_op(&mut self, addr: u32, at: u32, op: impl Fn(Word, Word) -> Word) {
        if let Some(operand) = self.read(addr, at) {
            self.accu = op(self.accu, operand);
        }
    }

    /// One fetch-decode-execute cycle. Returns the decoded instruction, or
    /// `None` if the fetch itself faulted.
    fn tick(&mut self) -> Option<Instruction> {
        let at = self.pc;
        let word = self.read(at, at)?;
        let instruction = decode(word);
        tracing::trace!(pc = format!("0x{at:05X}"), %instruction, "executing");

        // Uniform one-word instructions: advance before the effect, so call
        // pushes and fall-throughs see the next address.
        self.pc = (at + 1) & ADDRESS_MASK;

        match instruction {
            Instruction::Ldc(constant) => self.accu = Word::new(constant),
            Instruction::Ldv(addr) => {
                if let Some(word) = self.read(addr, at) {
                    self.accu = word;
                }
            }
            Instruction::Stv(addr) => self.store(addr, self.accu, at),
            Instruction::Add(addr) => self.binary_op(addr, at, |a, b| a.wrapping_add(b)),
            Instruction::And(addr) => {
                self.binary_op(addr, at, |a, b| Word::new(a.get() & b.get()))
            }
            Instruction::Or(addr) => self.binary_op(addr, at, |a, b| Word::new(a.get() | b.get())),
            Instruction::Xor(addr) => {
                self.binary_op(addr, at, |a, b| Word::new(a.get() ^ b.get()))
            }
            Instruction::Eql(addr) => self.binary_op(addr, at, |a, b| {
                if a == b {
                    Word::ALL_ONES
                } else {
                    Word::ZERO
                }
            }),
            Instruction::Jmp(addr) => self.pc = addr,
            Instruction::Jmn(addr) => {
                if self.accu.is_negative() {
                    self.pc = addr;
                }
            }
            Instruction::Ldiv(addr) => {
                if let Some(pointer) = self.read(addr, at) {
                    if let Some(word) = self.read(pointer.address(), at) {
                        self.accu = word;
                    }
                }
            }
            Instruction::Stiv(addr) => {
                if let Some(pointer) = self.read(addr, at) {
                    self.store(pointer.address(), self.accu, at);
                }
            }
            Instruction::Call(addr) => {
                if self
                    .config
                    .max_call_depth
                    .is_some_and(|max| self.call_stack.len() >= max)
                {
                    self.raise(FaultKind::CallStackOverflow, at);
                } else {
                    self.call_stack.push(self.pc);
                    self.pc = addr;
                }
            }
            Instruction::Ret => match self.call_stack.pop() {
                Some(return_pc) => self.pc = return_pc,
                None => self.raise(FaultKind::CallStackUnderflow, at),
            },
            Instruction::Halt => {
                tracing::debug!(pc = format!("0x{at:05X}"), "halt");
                self.status = Status::Halted;
            }
            Instruction::Not => self.accu = self.accu.complement(),
            Instruction::Rar => self.accu = self.accu.rotate_right(),
            Instruction::Reserved(_) => self.raise(FaultKind::ReservedOpcode, at),
        }

        Some(instruction)
    }
}
