//! Backtrace construction.
//!
//! Frames are recovered one at a time, innermost first. For each frame the
//! unwinder first checks for a kernel signal-return trampoline, then walks
//! the method's prologue when the method is known, and finally follows the
//! saved frame-pointer chain. The walk stops at the requested depth, at a
//! zero pc, at the return address of `main`, when the stack pointer fails
//! to grow, or when a step fails.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::arch::{Architecture, MemoryAccess};
use crate::symbols::{Method, SymbolTable};
use crate::types::{Address, Backtrace, FrameStatus, Registers, StackFrame, SymbolName, ThreadId};

/// Inputs of one backtrace walk.
pub(crate) struct Unwinder<'a>
{
    pub(crate) arch: &'a dyn Architecture,
    pub(crate) memory: &'a dyn MemoryAccess,
    pub(crate) symbols: &'a SymbolTable,
    pub(crate) thread: ThreadId,
    pub(crate) sigreturn: bool,
    /// Return address whose frame is not shown: the caller of `main`.
    pub(crate) outermost: Option<Address>,
}

impl Unwinder<'_>
{
    /// Frame for `registers` at depth `level`.
    ///
    /// Outer frames hold a return address, which may lie one past the end
    /// of a call that never returns; their method is looked up at `pc - 1`.
    pub(crate) fn frame(&self, registers: Registers, level: usize, status: FrameStatus) -> StackFrame
    {
        let pc = Address::new(registers.get(self.arch.pc_register()).unwrap_or(0));
        let sp = Address::new(registers.get(self.arch.sp_register()).unwrap_or(0));
        let fp = Address::new(registers.get(self.arch.fp_register()).unwrap_or(0));
        let lookup = if level == 0 { pc } else { pc.checked_sub(1).unwrap_or(pc) };

        let method = self.symbols.lookup(lookup);
        let source = method.as_ref().and_then(|method| method.source_lookup(lookup));
        let name = (status == FrameStatus::SignalTrampoline).then(|| SymbolName::plain("<signal handler called>"));
        StackFrame {
            thread: self.thread,
            level,
            pc,
            sp,
            fp,
            registers,
            method,
            source,
            name,
            status,
        }
    }

    /// Walk up to `max` frames starting from `innermost`.
    pub(crate) fn backtrace(&self, innermost: StackFrame, max: usize) -> Backtrace
    {
        let mut frames = vec![innermost];
        while frames.len() < max {
            let Some(current) = frames.last() else {
                break;
            };
            let Some((registers, status)) = self.caller(current) else {
                break;
            };

            let caller = self.frame(registers, current.level + 1, status);
            if caller.pc == Address::ZERO || Some(caller.pc) == self.outermost {
                break;
            }
            if caller.sp <= current.sp {
                warn!(
                    thread = %self.thread,
                    level = caller.level,
                    sp = %caller.sp,
                    previous = %current.sp,
                    "stack pointer did not grow, stopping backtrace"
                );
                break;
            }
            frames.push(caller);
        }
        debug!(thread = %self.thread, frames = frames.len(), "backtrace complete");
        Backtrace::new(frames)
    }

    fn caller(&self, frame: &StackFrame) -> Option<(Registers, FrameStatus)>
    {
        if self.sigreturn {
            match self.arch.try_unwind_signal_frame(self.memory, &frame.registers) {
                Ok(Some(registers)) => return Some((registers, FrameStatus::SignalTrampoline)),
                Ok(None) => {}
                Err(e) => debug!(pc = %frame.pc, error = %e, "signal frame check failed"),
            }
        }

        let code = frame.method.as_ref().and_then(|method| self.prologue_bytes(method));
        let offset = frame
            .method
            .as_ref()
            .and_then(|method| frame.pc.offset_from(method.start()))
            .map_or(0, |offset| usize::try_from(offset).unwrap_or(usize::MAX));
        let status = if code.is_some() { FrameStatus::Prologue } else { FrameStatus::FramePointer };

        match self.arch.unwind_one_frame(self.memory, &frame.registers, code.as_deref(), offset) {
            Ok(Some(registers)) => Some((registers, status)),
            Ok(None) => None,
            Err(e) => {
                warn!(thread = %self.thread, level = frame.level, pc = %frame.pc, error = %e, "unwinding failed");
                None
            }
        }
    }

    fn prologue_bytes(&self, method: &Arc<Method>) -> Option<Vec<u8>>
    {
        let size = method
            .end()
            .offset_from(method.start())
            .and_then(|size| usize::try_from(size).ok())?
            .min(self.arch.max_prologue_size());
        self.memory.read_bytes(method.start(), size).ok()
    }
}
