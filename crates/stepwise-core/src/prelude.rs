//! Common module for library exports

pub use crate::breakpoints::{BreakpointAction, BreakpointBuilder, BreakpointHandle};
pub use crate::config::{DebuggerOptions, LaunchOptions};
pub use crate::engine::{CallMethodData, Operation, OperationKind, OperationResult, StepFrame, StepMode};
pub use crate::error::{Result, StepwiseError};
pub use crate::events::{TargetEvent, TargetEventReceiver};
pub use crate::process::{Completion, GlobalLockGuard, Process, ProcessBuilder, Thread};
pub use crate::types::{Address, Backtrace, MemoryRegion, ProcessId, Registers, StackFrame, TargetState, ThreadId};
