#![warn(clippy::all, rust_2018_idioms)]
#![allow(clippy::unusual_byte_groupings)] // literals are grouped by instruction fields

//! Assembler and virtual machine for the 24-bit accumulator teaching
//! architecture: two-pass symbol resolution, fixed-width instruction
//! encoding, and a steppable, inspectable interpreter that a debugger
//! front end can drive.

pub mod assembler;
pub mod ast;
pub mod codec;
pub mod debug;
pub mod image;
pub mod machine;
pub mod symbols;
pub mod word;

pub use assembler::{assemble, assemble_with, AssemblerConfig, AssemblyError, Diagnostic};
pub use codec::{decode, encode, Instruction};
pub use debug::{BreakpointSet, DebugController, StepLimits};
pub use image::MemoryImage;
pub use machine::{
    Fault, FaultKind, Machine, MachineConfig, RunOptions, RunResult, Snapshot, Status, StepResult,
    StopReason,
};
pub use word::Word;
