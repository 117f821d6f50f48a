//! Stack frame and backtrace types.

use std::fmt;
use std::sync::Arc;

use super::symbols::{SourceAddress, SymbolName};
use super::{Address, Registers, ThreadId};
use crate::symbols::Method;

/// How a frame's registers were recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus
{
    /// Innermost frame: registers come straight from the stopped thread.
    Exact,
    /// Recovered by walking the callee's prologue bytes.
    Prologue,
    /// Recovered by chasing the saved frame-pointer chain.
    FramePointer,
    /// Restored from a kernel signal frame.
    SignalTrampoline,
}

/// One frame of a thread's stack.
#[derive(Debug, Clone)]
pub struct StackFrame
{
    /// Owning thread.
    pub thread: ThreadId,
    /// Depth, 0 for the innermost frame.
    pub level: usize,
    /// Program counter (for outer frames: the return address).
    pub pc: Address,
    /// Stack pointer.
    pub sp: Address,
    /// Frame pointer; zero when the register is unknown at this depth.
    pub fp: Address,
    /// Register file for this frame. Outer frames only carry the registers
    /// the unwinder could recover.
    pub registers: Registers,
    /// Method containing `pc`, if the symbol provider knows it.
    pub method: Option<Arc<Method>>,
    /// Source position of `pc`.
    pub source: Option<SourceAddress>,
    /// Display name; set for frames without a method (signal trampolines).
    pub name: Option<SymbolName>,
    /// Recovery method.
    pub status: FrameStatus,
}

impl StackFrame
{
    /// Name to show for this frame.
    #[must_use]
    pub fn display_name(&self) -> String
    {
        if let Some(method) = &self.method {
            return method.name().display_name().to_string();
        }
        self.name
            .as_ref()
            .map_or_else(|| String::from("??"), |name| name.display_name().to_string())
    }

    /// `true` if `address` falls inside this frame's method.
    #[must_use]
    pub fn method_contains(&self, address: Address) -> bool
    {
        self.method.as_ref().is_some_and(|method| method.contains(address))
    }
}

impl fmt::Display for StackFrame
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "#{:<2} {} in {}", self.level, self.pc, self.display_name())?;
        if let Some(source) = &self.source {
            write!(f, " at {source}")?;
        }
        Ok(())
    }
}

/// Ordered list of frames, innermost first.
#[derive(Debug, Clone, Default)]
pub struct Backtrace
{
    frames: Vec<StackFrame>,
}

impl Backtrace
{
    /// Wrap a frame list.
    #[must_use]
    pub fn new(frames: Vec<StackFrame>) -> Self
    {
        Self { frames }
    }

    /// All frames.
    #[must_use]
    pub fn frames(&self) -> &[StackFrame]
    {
        &self.frames
    }

    /// Number of frames.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.frames.len()
    }

    /// `true` when no frame could be computed.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.frames.is_empty()
    }

    /// Innermost frame.
    #[must_use]
    pub fn innermost(&self) -> Option<&StackFrame>
    {
        self.frames.first()
    }

    /// Iterate over the frames.
    pub fn iter(&self) -> impl Iterator<Item = &StackFrame>
    {
        self.frames.iter()
    }
}

impl fmt::Display for Backtrace
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        for frame in &self.frames {
            writeln!(f, "{frame}")?;
        }
        Ok(())
    }
}
