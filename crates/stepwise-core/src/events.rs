//! Target event types and helpers.
//!
//! Front ends subscribe to these events to follow asynchronous state
//! changes without polling each thread. The event loop publishes one event
//! per completed operation (stop, breakpoint hit, exit) plus resume, frame
//! and thread-creation notifications.

use std::sync::mpsc;

use crate::breakpoints::BreakpointHandle;
use crate::types::{StackFrame, ThreadId};

/// Event emitted by the thread manager.
#[derive(Debug, Clone)]
pub enum TargetEvent
{
    /// A stepping operation was started.
    TargetRunning
    {
        /// Thread that resumed.
        thread: ThreadId,
    },
    /// The thread stopped. `signal` is `0` for a completed step.
    TargetStopped
    {
        /// Stopped thread.
        thread: ThreadId,
        /// Signal that stopped it, `0` for none.
        signal: i32,
        /// Innermost frame, if it could be computed.
        frame: Option<StackFrame>,
    },
    /// The thread stopped at a breakpoint.
    TargetHitBreakpoint
    {
        /// Stopped thread.
        thread: ThreadId,
        /// Owning breakpoint; `None` for a trap instruction that is part of
        /// the program.
        handle: Option<BreakpointHandle>,
        /// Innermost frame, if it could be computed.
        frame: Option<StackFrame>,
    },
    /// The thread exited.
    TargetExited
    {
        /// Exited thread.
        thread: ThreadId,
        /// Exit code; `128 + signal` for a killed target.
        code: i32,
    },
    /// The thread was terminated by a signal.
    TargetSignaled
    {
        /// Terminated thread.
        thread: ThreadId,
        /// Terminating signal.
        signal: i32,
    },
    /// The innermost frame changed without a stop event (registers were
    /// written).
    FrameChanged
    {
        /// Affected thread.
        thread: ThreadId,
        /// New innermost frame.
        frame: Option<StackFrame>,
    },
    /// A new thread appeared in the target.
    ThreadCreated
    {
        /// The new thread.
        thread: ThreadId,
    },
}

impl TargetEvent
{
    /// Thread the event refers to.
    #[must_use]
    pub fn thread(&self) -> ThreadId
    {
        match self {
            Self::TargetRunning { thread }
            | Self::TargetStopped { thread, .. }
            | Self::TargetHitBreakpoint { thread, .. }
            | Self::TargetExited { thread, .. }
            | Self::TargetSignaled { thread, .. }
            | Self::FrameChanged { thread, .. }
            | Self::ThreadCreated { thread } => *thread,
        }
    }

    /// Frame attached to the event, if any.
    #[must_use]
    pub fn frame(&self) -> Option<&StackFrame>
    {
        match self {
            Self::TargetStopped { frame, .. }
            | Self::TargetHitBreakpoint { frame, .. }
            | Self::FrameChanged { frame, .. } => frame.as_ref(),
            _ => None,
        }
    }

    /// `true` if the event ends the life of its thread.
    #[must_use]
    pub fn is_terminal(&self) -> bool
    {
        matches!(self, Self::TargetExited { .. } | Self::TargetSignaled { .. })
    }

    /// Human-readable description of the event.
    #[must_use]
    pub fn describe(&self) -> String
    {
        let at = |frame: &Option<StackFrame>| match frame {
            Some(frame) => format!(" at {} ({})", frame.pc, frame.display_name()),
            None => String::new(),
        };
        match self {
            Self::TargetRunning { thread } => format!("Thread {thread} running"),
            Self::TargetStopped { thread, signal: 0, frame } => {
                format!("Thread {thread} stopped{}", at(frame))
            }
            Self::TargetStopped { thread, signal, frame } => {
                format!("Thread {thread} stopped by signal {signal}{}", at(frame))
            }
            Self::TargetHitBreakpoint {
                thread,
                handle: Some(handle),
                frame,
            } => format!("Thread {thread} hit breakpoint {handle}{}", at(frame)),
            Self::TargetHitBreakpoint {
                thread,
                handle: None,
                frame,
            } => format!("Thread {thread} hit a trap instruction{}", at(frame)),
            Self::TargetExited { thread, code } => format!("Thread {thread} exited with code {code}"),
            Self::TargetSignaled { thread, signal } => format!("Thread {thread} killed by signal {signal}"),
            Self::FrameChanged { thread, frame } => format!("Thread {thread} frame changed{}", at(frame)),
            Self::ThreadCreated { thread } => format!("Thread {thread} created"),
        }
    }
}

/// Sender side of the target event channel.
pub type TargetEventSender = mpsc::Sender<TargetEvent>;
/// Receiver side of the target event channel.
pub type TargetEventReceiver = mpsc::Receiver<TargetEvent>;

/// Create a new target event channel.
#[must_use]
pub fn event_channel() -> (TargetEventSender, TargetEventReceiver)
{
    mpsc::channel()
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_describe_exit()
    {
        let event = TargetEvent::TargetExited {
            thread: ThreadId(7),
            code: 137,
        };
        assert_eq!(event.describe(), "Thread 7 exited with code 137");
        assert!(event.is_terminal());
        assert_eq!(event.thread(), ThreadId(7));
    }

    #[test]
    fn test_describe_foreign_trap()
    {
        let event = TargetEvent::TargetHitBreakpoint {
            thread: ThreadId(1),
            handle: None,
            frame: None,
        };
        assert_eq!(event.describe(), "Thread 1 hit a trap instruction");
        assert!(event.frame().is_none());
    }
}
