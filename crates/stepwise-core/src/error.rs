//! # Error Types
//!
//! General error handling for the debugger.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and nice error messages.

use thiserror::Error;

use crate::types::Address;

/// Main error type for stepwise operations
///
/// Every fallible call in the core returns this type. The first group of
/// variants is the execution-control taxonomy callers are expected to match
/// on; the rest wrap failures from the operating system and from symbol
/// readers.
///
/// ## Error Categories
///
/// 1. **Target state**: NoTarget, NotStopped, AlreadyRunning
/// 2. **Target setup**: CannotStartTarget
/// 3. **Breakpoints**: NoSuchBreakpoint
/// 4. **Stepping**: NoMethod
/// 5. **Memory**: TargetMemoryError, NoPermission
/// 6. **Invariants**: InternalError
/// 7. **Ambient**: InvalidArgument, Symbols, Io, Os
#[derive(Error, Debug)]
pub enum StepwiseError
{
    /// There is no live target behind this handle
    ///
    /// Raised by every engine call once the traced thread has exited, was
    /// killed or was detached.
    #[error("No target process")]
    NoTarget,

    /// Operation requires the target to be stopped
    ///
    /// Commands are never queued behind a running stepping operation: a
    /// second command against a busy engine fails immediately with this
    /// error.
    #[error("Target must be stopped for this operation")]
    NotStopped,

    /// A command was issued re-entrantly
    ///
    /// This happens when a command is sent from inside the event loop (for
    /// example from a breakpoint predicate) or when the global thread lock
    /// is acquired twice by the same caller.
    #[error("Target is already running an operation")]
    AlreadyRunning,

    /// Spawning or attaching to the target failed
    #[error("Cannot start target: {0}")]
    CannotStartTarget(String),

    /// No breakpoint exists for the given handle
    #[error("No breakpoint with handle {0}")]
    NoSuchBreakpoint(u32),

    /// `finish` was requested but the current method is unknown
    #[error("No method at the current location")]
    NoMethod,

    /// Memory access outside the mapped address space
    #[error("Cannot access target memory at {address}: {reason}")]
    TargetMemoryError
    {
        /// First address of the failed access.
        address: Address,
        /// What the operating system (or snapshot) reported.
        reason: String,
    },

    /// Write or execution request against a read-only target
    ///
    /// Snapshot targets (the shape produced by core-file loaders) can be
    /// inspected but never modified or resumed.
    #[error("Permission denied: {0}")]
    NoPermission(String),

    /// An internal invariant was violated
    ///
    /// Examples: an address-mode byte pattern the unwinder does not know, a
    /// trampoline callback that arrives for an unknown request, a step range
    /// whose end does not follow its start.
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Invalid argument passed to a debugger function
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Symbol or debug-information reader failure
    #[error("Symbol error: {0}")]
    Symbols(String),

    /// I/O error (for file operations, `/proc` access, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Linux system call failure reported through `nix`
    ///
    /// `ESRCH` from a ptrace request usually means the thread died between
    /// the wait and the request; the engine turns that into an exit event.
    #[cfg(target_os = "linux")]
    #[error("System call failed: {0}")]
    Os(#[from] nix::errno::Errno),
}

impl StepwiseError
{
    /// Build a [`StepwiseError::TargetMemoryError`] for `address`.
    pub fn memory(address: Address, reason: impl Into<String>) -> Self
    {
        Self::TargetMemoryError {
            address,
            reason: reason.into(),
        }
    }

    /// Build a [`StepwiseError::InternalError`].
    pub fn internal(message: impl Into<String>) -> Self
    {
        Self::InternalError(message.into())
    }
}

/// Convenience type alias for `Result<T, StepwiseError>`
///
/// ```rust
/// use stepwise_core::error::Result;
/// fn foo() -> Result<()>
/// {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, StepwiseError>;
