//! # stepwise-core
//!
//! Execution control for native processes: a per-thread stepping engine,
//! the event loop that coordinates every thread of a target, and the
//! breakpoint table shared between them.
//!
//! This crate provides:
//! - Launching, attaching to and opening snapshots of processes
//!   ([`process::Process`])
//! - Instruction and source-line stepping, `finish` and run-until
//!   ([`process::Thread`])
//! - Breakpoints with predicates, hit counts, thread filters and groups
//! - Backtraces, register and memory access
//! - Function calls injected into the target
//!
//! ## Platform Support
//!
//! - **Linux x86-64**: live targets through `ptrace`
//! - **Anywhere**: read-only snapshots and custom [`inferior::Inferior`]
//!   implementations
//!
//! ## Why unsafe code is needed
//!
//! Spawning a traced child has to run `ptrace(PTRACE_TRACEME)` between
//! `fork` and `exec`, which `std::process::Command` only allows through an
//! `unsafe` hook, and stopping a single thread needs the raw `tgkill`
//! system call. Everything else goes through the safe wrappers of `nix`.
//! Unsafe code is denied crate-wide and allowed on those two functions.

pub mod arch;
pub mod breakpoints;
pub mod config;
pub mod disasm;
pub mod engine;
pub mod error;
pub mod events;
pub mod inferior;
pub mod manager;
pub mod prelude;
pub mod process;
pub mod symbols;
pub mod types;

// Re-export commonly used types
pub use error::{Result, StepwiseError};
pub use process::{Process, ProcessBuilder, Thread};
pub use types::{Address, ProcessId, Registers, ThreadId};
