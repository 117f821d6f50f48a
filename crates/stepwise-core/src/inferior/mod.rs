//! # Inferior
//!
//! The process-control layer: one [`Inferior`] per traced thread, plus one
//! [`EventSource`] per process that produces raw wait events.
//!
//! ## Split between the two traits
//!
//! The OS wait primitive is process-wide, so waiting is separated from the
//! per-thread handle: the event loop owns the [`EventSource`] and is the only
//! caller of [`EventSource::wait`]. Each raw event is routed by thread id to
//! the owning engine, which asks its own inferior to interpret it with
//! [`Inferior::process_event`]. Interpretation has side effects (rewinding
//! the pc over a trap, finishing an injected call), so it happens exactly
//! once per event.
//!
//! ## Implementations
//!
//! - `PtraceInferior` (Linux x86-64): a live thread under `ptrace`.
//! - [`SnapshotInferior`]: a read-only stopped image, the shape produced by a
//!   core-file loader.

pub mod call;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod ptrace;
pub mod snapshot;
pub mod traps;

use std::fmt;
use std::time::Duration;

pub use call::{setup_call_frame, CallArgument, CallFrame, InjectedCall};
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use ptrace::{PtraceEvents, PtraceInferior};
pub use snapshot::{SnapshotBuilder, SnapshotEvents, SnapshotInferior};
pub use traps::{RawMemory, SharedTraps, TrapId, TrapTable};

use crate::arch::MemoryAccess;
use crate::error::Result;
use crate::types::{Address, MemoryRegion, ProcessId, Registers, TargetState, ThreadId};

/// `SIGKILL`; a killed target reports exit code `128 + SIGKILL`.
pub const SIGKILL: i32 = 9;
/// `SIGTRAP`
pub const SIGTRAP: i32 = 5;
/// `SIGSTOP`
pub const SIGSTOP: i32 = 19;

/// Wait status as the OS reports it, before interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawStatus
{
    /// The thread exited with a code.
    Exited(i32),
    /// The thread was terminated by a signal.
    Signaled(i32),
    /// The thread stopped with a signal.
    Stopped(i32),
    /// The thread created a new thread (which starts stopped).
    Cloned(ThreadId),
}

/// A raw status with the thread it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent
{
    /// Reporting thread.
    pub tid: ThreadId,
    /// What happened.
    pub status: RawStatus,
}

/// Interpreted stop of one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEvent
{
    /// Stopped with a signal. `0` means "no signal": a completed single
    /// step.
    Stopped(i32),
    /// Stopped by the stop request issued through [`Inferior::stop`].
    Interrupted,
    /// Exited normally.
    Exited(i32),
    /// Killed by a signal.
    Signaled(i32),
    /// Hit a trap. `Some(address)` for a trap from the trap table (the pc
    /// has been rewound to `address`); `None` for a trap instruction that is
    /// part of the program's own code.
    HitBreakpoint(Option<Address>),
    /// An injected call returned; the registers are restored.
    Callback
    {
        /// Id passed to [`Inferior::call_function`].
        id: u64,
        /// Primary return register.
        data1: u64,
        /// Secondary return register.
        data2: u64,
    },
    /// The thread created a new thread.
    ThreadCreated(ThreadId),
}

impl ChildEvent
{
    /// `true` for events after which the thread is gone.
    #[must_use]
    pub fn is_terminal(self) -> bool
    {
        matches!(self, Self::Exited(_) | Self::Signaled(_))
    }
}

/// Producer of raw wait events for one process.
pub trait EventSource: Send
{
    /// Wait for the next event.
    ///
    /// `thread` restricts the wait to one thread (used while stopping
    /// threads for the global lock); `timeout` of `None` blocks.
    /// `Ok(None)` means the timeout expired.
    ///
    /// ## Errors
    ///
    /// `NoTarget` when there is nothing left to wait for.
    fn wait(&mut self, thread: Option<ThreadId>, timeout: Option<Duration>) -> Result<Option<RawEvent>>;
}

/// Handle on one traced thread.
///
/// All register, memory and breakpoint calls require the thread to be
/// stopped and fail with `NotStopped` otherwise. Execution-control calls are
/// fire-and-forget: their outcome is observed through the event source.
pub trait Inferior: MemoryAccess + Send + fmt::Debug
{
    /// Process id.
    fn pid(&self) -> ProcessId;

    /// Thread id.
    fn tid(&self) -> ThreadId;

    /// Execution state as far as this handle knows.
    fn state(&self) -> TargetState;

    /// Continue until the next event.
    fn resume(&mut self) -> Result<()>;

    /// Execute one instruction.
    fn single_step(&mut self) -> Result<()>;

    /// Ask a running thread to stop. Returns `false` (and does nothing) if
    /// the thread is already stopped; otherwise an
    /// [`ChildEvent::Interrupted`] will follow.
    fn stop(&mut self) -> Result<bool>;

    /// Kill the whole process.
    fn kill(&mut self) -> Result<()>;

    /// Ask the whole process to terminate.
    fn terminate(&mut self) -> Result<()>;

    /// Remove all traps and release the thread.
    fn detach(&mut self) -> Result<()>;

    /// Interpret a raw status reported for this thread.
    fn process_event(&mut self, status: RawStatus) -> Result<ChildEvent>;

    /// Full register file.
    fn registers(&self) -> Result<Registers>;

    /// Replace the register file. Invalid slots are left unchanged.
    fn set_registers(&mut self, registers: &Registers) -> Result<()>;

    /// Write memory. Installed traps inside the range are preserved.
    fn write_memory(&mut self, address: Address, data: &[u8]) -> Result<()>;

    /// Insert a trap.
    fn insert_breakpoint(&mut self, address: Address) -> Result<TrapId>;

    /// Remove a trap.
    fn remove_breakpoint(&mut self, id: TrapId) -> Result<()>;

    /// Re-enable a trap.
    fn enable_breakpoint(&mut self, id: TrapId) -> Result<()>;

    /// Disable a trap, keeping it in the table.
    fn disable_breakpoint(&mut self, id: TrapId) -> Result<()>;

    /// Temporarily take every trap at `address` out of memory (or put them
    /// back).
    fn suspend_breakpoints_at(&mut self, address: Address, suspended: bool) -> Result<()>;

    /// `true` if a trap instruction is installed at `address`.
    fn has_breakpoint_at(&self, address: Address) -> bool;

    /// Start an injected call; completion is reported as
    /// [`ChildEvent::Callback`] with `callback` as id after the next resume.
    fn call_function(&mut self, function: Address, args: &[CallArgument], callback: u64) -> Result<()>;

    /// Handle on a thread that was just created in the same process. Shares
    /// the trap table.
    fn new_thread(&self, tid: ThreadId) -> Result<Box<dyn Inferior>>;

    /// Memory map of the process.
    fn memory_maps(&self) -> Result<Vec<MemoryRegion>>;
}
