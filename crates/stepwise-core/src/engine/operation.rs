//! Stepping operations and step frames.
//!
//! An [`Operation`] is the immutable description of one user-level request
//! ("next line", "finish", "call this function"). Source-level and bounded
//! operations carry a [`StepFrame`]: the address range the engine keeps
//! stepping inside, how it treats calls while doing so, and the trampoline
//! resolver of the language being stepped.

use std::fmt;
use std::sync::Arc;

use crate::error::{Result, StepwiseError};
use crate::events::TargetEvent;
use crate::inferior::CallArgument;
use crate::symbols::TrampolineResolver;
use crate::types::Address;

/// How calls are treated inside a [`StepFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode
{
    /// Step into every call, source or not.
    SingleInstruction,
    /// Stay inside the range; step into calls that have usable source.
    StepFrame,
    /// Stay inside the range; always step over calls.
    Finish,
}

/// Address range plus stepping mode.
///
/// A frame without a range has no source-level bound: the engine performs
/// one instruction step (following trampolines) and stops.
#[derive(Clone)]
pub struct StepFrame
{
    range: Option<(Address, Address)>,
    mode: StepMode,
    resolver: Option<Arc<dyn TrampolineResolver>>,
}

impl fmt::Debug for StepFrame
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("StepFrame")
            .field("range", &self.range)
            .field("mode", &self.mode)
            .field("resolver", &self.resolver.as_ref().map(|resolver| resolver.name().to_string()))
            .finish()
    }
}

impl StepFrame
{
    /// Frame covering `[start, end)`.
    ///
    /// ## Errors
    ///
    /// `InternalError` unless `end > start`.
    pub fn new(
        start: Address,
        end: Address,
        mode: StepMode,
        resolver: Option<Arc<dyn TrampolineResolver>>,
    ) -> Result<Self>
    {
        if end <= start {
            return Err(StepwiseError::internal(format!("empty step frame [{start}, {end})")));
        }
        Ok(Self {
            range: Some((start, end)),
            mode,
            resolver,
        })
    }

    /// Frame without a range.
    #[must_use]
    pub fn unbounded(mode: StepMode, resolver: Option<Arc<dyn TrampolineResolver>>) -> Self
    {
        Self {
            range: None,
            mode,
            resolver,
        }
    }

    /// Start of the range.
    #[must_use]
    pub fn start(&self) -> Option<Address>
    {
        self.range.map(|(start, _)| start)
    }

    /// End of the range (exclusive).
    #[must_use]
    pub fn end(&self) -> Option<Address>
    {
        self.range.map(|(_, end)| end)
    }

    /// Mode.
    #[must_use]
    pub fn mode(&self) -> StepMode
    {
        self.mode
    }

    /// Trampoline resolver of the stepped language.
    #[must_use]
    pub fn resolver(&self) -> Option<&Arc<dyn TrampolineResolver>>
    {
        self.resolver.as_ref()
    }

    /// `true` if `address` lies in the range. Always `false` for an
    /// unbounded frame.
    #[must_use]
    pub fn contains(&self, address: Address) -> bool
    {
        self.range.is_some_and(|(start, end)| address.within(start, end))
    }
}

/// Arguments of a function call injected into the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallMethodData
{
    /// `method(argument1, argument2)`
    LongLong
    {
        /// Function address.
        method: Address,
        /// First argument.
        argument1: u64,
        /// Second argument.
        argument2: u64,
    },
    /// `method(argument, "string")`
    LongString
    {
        /// Function address.
        method: Address,
        /// First argument.
        argument: u64,
        /// String copied into the target.
        string: String,
    },
    /// `method(pointer)`
    Pointer
    {
        /// Function address.
        method: Address,
        /// Pointer argument.
        pointer: Address,
    },
}

impl CallMethodData
{
    /// Function address.
    #[must_use]
    pub fn method(&self) -> Address
    {
        match self {
            Self::LongLong { method, .. } | Self::LongString { method, .. } | Self::Pointer { method, .. } => *method,
        }
    }

    pub(crate) fn arguments(&self) -> Vec<CallArgument>
    {
        match self {
            Self::LongLong {
                argument1, argument2, ..
            } => vec![CallArgument::Word(*argument1), CallArgument::Word(*argument2)],
            Self::LongString { argument, string, .. } => {
                vec![CallArgument::Word(*argument), CallArgument::string(string)]
            }
            Self::Pointer { pointer, .. } => vec![CallArgument::Word(pointer.value())],
        }
    }
}

/// A managed-runtime method invocation.
#[derive(Debug, Clone)]
pub struct RuntimeInvokeData
{
    /// Runtime providing the compile and invoke entry points.
    pub resolver: Arc<dyn TrampolineResolver>,
    /// Method descriptor.
    pub method: Address,
    /// `this` object, zero for static methods.
    pub object: Address,
    /// Boxed parameter objects.
    pub params: Vec<Address>,
}

/// Kind of a stepping operation.
#[derive(Debug, Clone)]
pub enum OperationKind
{
    /// Resume until a breakpoint, a signal or `until`.
    Run
    {
        /// Stop address, if any.
        until: Option<Address>,
    },
    /// Like `Run`; used for threads nobody is waiting on.
    RunInBackground
    {
        /// Stop address, if any.
        until: Option<Address>,
    },
    /// One instruction, following runtime trampolines.
    StepInstruction,
    /// Exactly one machine instruction.
    StepNativeInstruction,
    /// One instruction, stepping over calls.
    NextInstruction,
    /// To the next source line, entering calls with source.
    StepLine,
    /// To the next source line, stepping over calls.
    NextLine,
    /// Until the current method returns.
    Finish,
    /// Internal: stay inside the operation's step frame.
    StepFrame,
    /// Invoke a managed method through the runtime.
    RuntimeInvoke(RuntimeInvokeData),
    /// Call a function in the target.
    CallMethod(CallMethodData),
}

/// A requested stepping operation.
#[derive(Debug, Clone)]
pub struct Operation
{
    kind: OperationKind,
    step_frame: Option<StepFrame>,
    via_wrapper: bool,
}

impl Operation
{
    /// Operation without a step frame.
    #[must_use]
    pub fn new(kind: OperationKind) -> Self
    {
        Self {
            kind,
            step_frame: None,
            via_wrapper: false,
        }
    }

    /// Internal bounded operation.
    #[must_use]
    pub fn step_frame(frame: StepFrame) -> Self
    {
        Self {
            kind: OperationKind::StepFrame,
            step_frame: Some(frame),
            via_wrapper: false,
        }
    }

    /// Resume until `until` (or until something happens).
    #[must_use]
    pub fn run(until: Option<Address>) -> Self
    {
        Self::new(OperationKind::Run { until })
    }

    /// Run into the function a wrapper forwards to. Never chains into a
    /// second wrapper.
    #[must_use]
    pub(crate) fn run_into_wrapped(target: Address) -> Self
    {
        Self {
            kind: OperationKind::Run { until: Some(target) },
            step_frame: None,
            via_wrapper: true,
        }
    }

    /// Attach a step frame.
    #[must_use]
    pub fn with_step_frame(mut self, frame: StepFrame) -> Self
    {
        self.step_frame = Some(frame);
        self
    }

    /// Kind.
    #[must_use]
    pub fn kind(&self) -> &OperationKind
    {
        &self.kind
    }

    /// Step frame, if any.
    #[must_use]
    pub fn frame(&self) -> Option<&StepFrame>
    {
        self.step_frame.as_ref()
    }

    /// `true` for operations that must stop on exactly one machine
    /// instruction and skip all source-level adjustments.
    #[must_use]
    pub fn is_native(&self) -> bool
    {
        matches!(self.kind, OperationKind::StepNativeInstruction)
    }

    /// `true` for operations whose stop position is adjusted to a line
    /// boundary past the method prologue.
    #[must_use]
    pub fn is_source_operation(&self) -> bool
    {
        matches!(
            self.kind,
            OperationKind::StepLine
                | OperationKind::NextLine
                | OperationKind::Run { .. }
                | OperationKind::RunInBackground { .. }
                | OperationKind::RuntimeInvoke(_)
        )
    }

    /// `true` for `Run`/`RunInBackground`.
    #[must_use]
    pub fn is_run(&self) -> bool
    {
        matches!(self.kind, OperationKind::Run { .. } | OperationKind::RunInBackground { .. })
    }

    /// Stop address of a run operation.
    #[must_use]
    pub fn until(&self) -> Option<Address>
    {
        match self.kind {
            OperationKind::Run { until } | OperationKind::RunInBackground { until } => until,
            _ => None,
        }
    }

    pub(crate) fn via_wrapper(&self) -> bool
    {
        self.via_wrapper
    }

    /// Short name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str
    {
        match self.kind {
            OperationKind::Run { .. } => "run",
            OperationKind::RunInBackground { .. } => "run-in-background",
            OperationKind::StepInstruction => "step-instruction",
            OperationKind::StepNativeInstruction => "step-native-instruction",
            OperationKind::NextInstruction => "next-instruction",
            OperationKind::StepLine => "step-line",
            OperationKind::NextLine => "next-line",
            OperationKind::Finish => "finish",
            OperationKind::StepFrame => "step-frame",
            OperationKind::RuntimeInvoke(_) => "runtime-invoke",
            OperationKind::CallMethod(_) => "call-method",
        }
    }
}

impl fmt::Display for Operation
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.name())?;
        if let Some(until) = self.until() {
            write!(f, " until {until}")?;
        }
        if let (Some(start), Some(end)) = (self.frame().and_then(StepFrame::start), self.frame().and_then(StepFrame::end)) {
            write!(f, " [{start}, {end})")?;
        }
        Ok(())
    }
}

/// What a completed operation produced.
#[derive(Debug, Clone)]
pub enum OperationResult
{
    /// The thread stopped, hit a breakpoint or died.
    Event(TargetEvent),
    /// An injected call returned.
    Call
    {
        /// Primary return register.
        data1: u64,
        /// Secondary return register.
        data2: u64,
    },
    /// A runtime invocation returned.
    Invoke
    {
        /// Returned object.
        result: Address,
        /// Thrown exception, if any.
        exception: Option<Address>,
    },
}

impl OperationResult
{
    /// The event, for stepping operations.
    #[must_use]
    pub fn event(&self) -> Option<&TargetEvent>
    {
        match self {
            Self::Event(event) => Some(event),
            _ => None,
        }
    }
}
