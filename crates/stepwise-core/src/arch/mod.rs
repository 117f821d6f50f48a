//! # Architecture abstraction
//!
//! Everything the stepping engine needs to know about one instruction set:
//! how to recognise calls, jumps, returns and system calls, how to spot a
//! runtime's call trampoline, and how to unwind one stack frame.
//!
//! Implementations are stateless. Every method receives the memory accessor
//! (and, where the answer depends on live state, the register file) it
//! needs, so one [`Architecture`] instance is shared by all engines of a
//! process and is chosen once when the process is started or attached.
//!
//! ## Failure policy
//!
//! Decoding an encoding this module does not understand is reported as
//! [`StepwiseError::InternalError`](crate::error::StepwiseError). Callers
//! degrade instead of failing: the stepping engine treats such an
//! instruction as "not a call" and single-steps it, and the backtrace
//! builder stops at the last frame it could recover.

pub mod x86_64;

use std::fmt;
use std::sync::Arc;

pub use x86_64::X86_64;

use crate::error::{Result, StepwiseError};
use crate::types::{Address, Registers};

/// Read access to target memory, as needed by decoding and unwinding.
pub trait MemoryAccess
{
    /// Read `len` bytes starting at `address`.
    ///
    /// ## Errors
    ///
    /// `TargetMemoryError` if any byte of the range is not mapped,
    /// `NotStopped` if the target is running.
    fn read_bytes(&self, address: Address, len: usize) -> Result<Vec<u8>>;

    /// Read one byte.
    fn read_u8(&self, address: Address) -> Result<u8>
    {
        let bytes = self.read_bytes(address, 1)?;
        bytes
            .first()
            .copied()
            .ok_or_else(|| StepwiseError::memory(address, "short read"))
    }

    /// Read a little-endian `u32`.
    fn read_u32(&self, address: Address) -> Result<u32>
    {
        let bytes = self.read_bytes(address, 4)?;
        let array: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StepwiseError::memory(address, "short read"))?;
        Ok(u32::from_le_bytes(array))
    }

    /// Read a little-endian `u64` (one target word).
    fn read_u64(&self, address: Address) -> Result<u64>
    {
        let bytes = self.read_bytes(address, 8)?;
        let array: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StepwiseError::memory(address, "short read"))?;
        Ok(u64::from_le_bytes(array))
    }

    /// Read a target pointer.
    fn read_address(&self, address: Address) -> Result<Address>
    {
        self.read_u64(address).map(Address::new)
    }
}

/// A decoded call instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTarget
{
    /// Address the call transfers control to, resolved against the live
    /// register and memory state for indirect forms.
    pub target: Address,
    /// Encoded length of the call; `pc + instruction_size` is the return
    /// address.
    pub instruction_size: usize,
}

/// Per-ISA decoding and unwinding rules.
pub trait Architecture: Send + Sync + fmt::Debug
{
    /// Short ISA name (`x86_64`).
    fn name(&self) -> &'static str;

    /// Number of slots in this ISA's register file.
    fn register_count(&self) -> usize;

    /// Register index of the program counter.
    fn pc_register(&self) -> usize;

    /// Register index of the stack pointer.
    fn sp_register(&self) -> usize;

    /// Register index of the frame pointer.
    fn fp_register(&self) -> usize;

    /// Encoding of the software breakpoint instruction.
    fn breakpoint_instruction(&self) -> &'static [u8];

    /// How far the pc has advanced past a breakpoint address when the trap
    /// is reported.
    fn breakpoint_pc_adjustment(&self) -> u64;

    /// Upper bound on the prologue bytes the unwinder inspects.
    fn max_prologue_size(&self) -> usize;

    /// Decode the instruction at `pc` and report its target if it is a
    /// call. Indirect forms read `registers` and target memory.
    ///
    /// ## Errors
    ///
    /// `InternalError` for a call encoding with an unsupported addressing
    /// mode; memory errors while reading the instruction or an indirect
    /// slot.
    fn get_call_target(&self, memory: &dyn MemoryAccess, registers: &Registers, pc: Address) -> Result<Option<CallTarget>>;

    /// Decode the instruction at `pc` and report its target if it is an
    /// unconditional jump.
    fn get_jump_target(&self, memory: &dyn MemoryAccess, registers: &Registers, pc: Address) -> Result<Option<Address>>;

    /// `true` if the instruction at `pc` returns from the current function.
    fn is_return_instruction(&self, memory: &dyn MemoryAccess, pc: Address) -> Result<bool>;

    /// `true` if the instruction that ends right before `pc` is a system
    /// call (used after a stop to recognise an interrupted syscall).
    fn is_syscall_instruction(&self, memory: &dyn MemoryAccess, pc: Address) -> Result<bool>;

    /// Recognise a runtime trampoline stub at `location` that dispatches to
    /// the generic trampoline at `generic_trampoline`. Returns the method
    /// descriptor the stub passes along.
    fn get_trampoline(
        &self,
        memory: &dyn MemoryAccess,
        location: Address,
        generic_trampoline: Address,
    ) -> Result<Option<Address>>;

    /// Compute the caller's registers.
    ///
    /// `code` holds the first bytes of the current method and `offset` the
    /// number of those bytes already executed (`pc - method.start`); with
    /// them the unwinder knows how much of the prologue has run. Without
    /// them (or when the prologue is not recognised) the frame-pointer
    /// chain is followed.
    fn unwind_one_frame(
        &self,
        memory: &dyn MemoryAccess,
        registers: &Registers,
        code: Option<&[u8]>,
        offset: usize,
    ) -> Result<Option<Registers>>;

    /// Recognise a kernel signal-return trampoline at the frame's pc and
    /// restore the interrupted register set from the signal frame.
    fn try_unwind_signal_frame(&self, memory: &dyn MemoryAccess, registers: &Registers) -> Result<Option<Registers>>;

    /// Registers that survive a call unchanged: the callee-saved subset of
    /// `registers`, everything else invalid.
    fn callee_saved(&self, registers: &Registers) -> Registers;
}

/// Supported instruction sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchKind
{
    /// AMD64 / Intel 64.
    X86_64,
}

impl ArchKind
{
    /// The ISA this binary was compiled for, if supported.
    #[must_use]
    pub fn host() -> Option<Self>
    {
        cfg!(target_arch = "x86_64").then_some(Self::X86_64)
    }

    /// Instantiate the backend.
    #[must_use]
    pub fn backend(self) -> Arc<dyn Architecture>
    {
        match self {
            Self::X86_64 => Arc::new(X86_64),
        }
    }
}
