//! # Breakpoint Builder
//!
//! Builder pattern for configuring breakpoints before insertion.
//!
//! This module provides a fluent API for conditional breakpoints, hit-count
//! thresholds, thread-specific breakpoints, non-stopping (counting)
//! breakpoints and group tags for bulk enable/disable.

use std::fmt;
use std::sync::Arc;

use super::{Breakpoint, BreakpointAction, BreakpointContext, BreakpointHandle, Predicate};
use crate::types::{Address, ThreadId};

/// Builder for configuring breakpoints before insertion.
///
/// ## Example
///
/// ```rust,no_run
/// use stepwise_core::breakpoints::BreakpointBuilder;
/// use stepwise_core::types::{Address, ThreadId};
///
/// let builder = BreakpointBuilder::new(Address::new(0x40_1000))
///     .with_hit_count(5) // stop on the 5th hit
///     .for_thread(ThreadId(4242))
///     .with_condition(|ctx| ctx.hit_count % 2 == 1)
///     .group("loop");
/// # let _ = builder;
/// ```
pub struct BreakpointBuilder
{
    address: Address,
    enabled: bool,
    hit_count: Option<u64>,
    condition: Option<Predicate>,
    needs_frame: bool,
    thread_id: Option<ThreadId>,
    action: BreakpointAction,
    group: Option<String>,
}

impl fmt::Debug for BreakpointBuilder
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("BreakpointBuilder")
            .field("address", &self.address)
            .field("enabled", &self.enabled)
            .field("hit_count", &self.hit_count)
            .field("condition", &self.condition.is_some())
            .field("needs_frame", &self.needs_frame)
            .field("thread_id", &self.thread_id)
            .field("action", &self.action)
            .field("group", &self.group)
            .finish()
    }
}

impl BreakpointBuilder
{
    /// Create a builder for a breakpoint at `address`.
    ///
    /// ## Parameters
    ///
    /// - `address`: The code address where the trap should be installed.
    #[must_use]
    pub fn new(address: Address) -> Self
    {
        Self {
            address,
            enabled: true,
            hit_count: None,
            condition: None,
            needs_frame: false,
            thread_id: None,
            action: BreakpointAction::Report,
            group: None,
        }
    }

    /// Set the hit count threshold.
    ///
    /// The breakpoint only triggers once it has been hit `count` times.
    /// Earlier hits are counted and the thread resumes silently.
    ///
    /// ## Example
    ///
    /// ```rust,no_run
    /// use stepwise_core::breakpoints::BreakpointBuilder;
    /// use stepwise_core::types::Address;
    ///
    /// let builder = BreakpointBuilder::new(Address::new(0x1000)).with_hit_count(10); // Break on the 10th hit
    /// # let _ = builder;
    /// ```
    #[must_use]
    pub fn with_hit_count(mut self, count: u64) -> Self
    {
        self.hit_count = Some(count);
        self
    }

    /// Set a condition that must be true for the breakpoint to trigger.
    ///
    /// The condition runs on the event-loop thread every time the breakpoint
    /// is hit past its hit-count threshold. It must not call back into the
    /// debugger. When it returns `false` execution continues with no
    /// user-visible event.
    #[must_use]
    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&BreakpointContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    /// Ask for the innermost stack frame in the condition's context.
    ///
    /// Computing a frame means a symbol lookup, so it is only done for
    /// conditions that request it.
    #[must_use]
    pub fn needs_frame(mut self) -> Self
    {
        self.needs_frame = true;
        self
    }

    /// Make the breakpoint thread-specific.
    ///
    /// Other threads pass through the address without stopping.
    #[must_use]
    pub fn for_thread(mut self, thread_id: ThreadId) -> Self
    {
        self.thread_id = Some(thread_id);
        self
    }

    /// Choose what happens on an accepted hit.
    #[must_use]
    pub fn action(mut self, action: BreakpointAction) -> Self
    {
        self.action = action;
        self
    }

    /// Tag the breakpoint for bulk enable/disable.
    #[must_use]
    pub fn group(mut self, group: impl Into<String>) -> Self
    {
        self.group = Some(group.into());
        self
    }

    /// Insert the breakpoint disabled.
    #[must_use]
    pub fn disabled(mut self) -> Self
    {
        self.enabled = false;
        self
    }

    /// Get the configured address.
    #[must_use]
    pub fn address(&self) -> Address
    {
        self.address
    }

    /// Get the configured hit count threshold, if any.
    #[must_use]
    pub fn hit_count(&self) -> Option<u64>
    {
        self.hit_count
    }

    /// Get the configured thread ID, if any.
    #[must_use]
    pub fn thread_id(&self) -> Option<ThreadId>
    {
        self.thread_id
    }

    pub(crate) fn into_breakpoint(self, handle: BreakpointHandle) -> Breakpoint
    {
        Breakpoint {
            handle,
            address: self.address,
            enabled: self.enabled,
            predicate: self.condition,
            needs_frame: self.needs_frame,
            thread: self.thread_id,
            ignore_count: self.hit_count.map_or(0, |count| count.saturating_sub(1)),
            action: self.action,
            group: self.group,
            hits: 0,
        }
    }
}
