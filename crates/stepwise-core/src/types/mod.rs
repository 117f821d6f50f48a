//! # Types
//!
//! Value types shared by every layer of the debugger: addresses, process
//! and thread identifiers, register files, stack frames and source
//! positions. None of them depend on a particular operating system.

pub mod address;
pub mod process;
pub mod registers;
pub mod stack;
pub mod symbols;

pub use address::Address;
pub use process::{MemoryRegion, ProcessId, TargetState, ThreadId};
pub use registers::{Register, Registers, X86_64Register};
pub use stack::{Backtrace, FrameStatus, StackFrame};
pub use symbols::{SourceAddress, SymbolLanguage, SymbolName};
