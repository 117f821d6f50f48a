//! # Breakpoint Manager
//!
//! Process-wide registry of logical breakpoints.
//!
//! Each logical breakpoint has a small integer [`BreakpointHandle`] and lives
//! in an arena slot. A side index maps every address to the OS-level trap
//! placed there and to the handles that own it: the trap is installed once
//! per address no matter how many breakpoints share it, disabled when every
//! owner is disabled and removed together with its last owner.
//!
//! ## Hit resolution
//!
//! When a thread traps at an address the stepping engine asks
//! [`BreakpointManager::resolve_hit`] which breakpoint (if any) wants the
//! stop. Owners are filtered by thread and enabled state, their hit counts
//! are bumped, and predicates run with the current frame only when a
//! predicate declared that it needs one
//! ([`BreakpointManager::hit_needs_frame`]).
//!
//! The engine's own temporary breakpoints never go through this manager;
//! they live directly in the inferior's trap table.

pub mod builder;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::debug;

pub use builder::BreakpointBuilder;

use crate::error::{Result, StepwiseError};
use crate::inferior::{Inferior, TrapId};
use crate::types::{Address, StackFrame, ThreadId};

/// Handle of a logical breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointHandle(pub u32);

impl BreakpointHandle
{
    /// Raw numeric value.
    #[must_use]
    pub const fn raw(self) -> u32
    {
        self.0
    }
}

impl fmt::Display for BreakpointHandle
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "#{}", self.0)
    }
}

/// What happens when a breakpoint's predicate accepts a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BreakpointAction
{
    /// Stop and report the hit.
    #[default]
    Report,
    /// Count the hit and keep running.
    Continue,
}

/// What a predicate sees when its breakpoint is hit.
#[derive(Debug, Clone, Copy)]
pub struct BreakpointContext<'a>
{
    /// Thread that hit the breakpoint.
    pub thread: ThreadId,
    /// Breakpoint address.
    pub address: Address,
    /// Innermost frame; only computed for breakpoints that asked for it.
    pub frame: Option<&'a StackFrame>,
    /// Hits so far, this one included.
    pub hit_count: u64,
}

/// Breakpoint predicate.
pub type Predicate = Arc<dyn Fn(&BreakpointContext<'_>) -> bool + Send + Sync>;

/// A logical breakpoint.
#[derive(Clone)]
pub struct Breakpoint
{
    handle: BreakpointHandle,
    address: Address,
    enabled: bool,
    predicate: Option<Predicate>,
    needs_frame: bool,
    thread: Option<ThreadId>,
    ignore_count: u64,
    action: BreakpointAction,
    group: Option<String>,
    hits: u64,
}

impl fmt::Debug for Breakpoint
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Breakpoint")
            .field("handle", &self.handle)
            .field("address", &self.address)
            .field("enabled", &self.enabled)
            .field("predicate", &self.predicate.is_some())
            .field("needs_frame", &self.needs_frame)
            .field("thread", &self.thread)
            .field("ignore_count", &self.ignore_count)
            .field("action", &self.action)
            .field("group", &self.group)
            .field("hits", &self.hits)
            .finish()
    }
}

impl Breakpoint
{
    /// Handle.
    #[must_use]
    pub fn handle(&self) -> BreakpointHandle
    {
        self.handle
    }

    /// Address.
    #[must_use]
    pub fn address(&self) -> Address
    {
        self.address
    }

    /// Whether the breakpoint is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool
    {
        self.enabled
    }

    /// Whether the predicate needs the current frame.
    #[must_use]
    pub fn needs_frame(&self) -> bool
    {
        self.needs_frame && self.predicate.is_some()
    }

    /// Thread filter.
    #[must_use]
    pub fn thread(&self) -> Option<ThreadId>
    {
        self.thread
    }

    /// Action on an accepted hit.
    #[must_use]
    pub fn action(&self) -> BreakpointAction
    {
        self.action
    }

    /// Group tag.
    #[must_use]
    pub fn group(&self) -> Option<&str>
    {
        self.group.as_deref()
    }

    /// Number of recorded hits.
    #[must_use]
    pub fn hit_count(&self) -> u64
    {
        self.hits
    }

    fn applies_to(&self, thread: ThreadId) -> bool
    {
        self.enabled && self.thread.map_or(true, |owner| owner == thread)
    }

    /// Count the hit and decide whether it should stop the thread.
    fn accept(&mut self, thread: ThreadId, frame: Option<&StackFrame>) -> bool
    {
        self.hits += 1;
        if self.hits <= self.ignore_count {
            return false;
        }
        match &self.predicate {
            Some(predicate) => predicate(&BreakpointContext {
                thread,
                address: self.address,
                frame,
                hit_count: self.hits,
            }),
            None => true,
        }
    }
}

/// Outcome of [`BreakpointManager::resolve_hit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitResolution
{
    /// Stop and report this breakpoint.
    Report(BreakpointHandle),
    /// Owners exist but none wants the stop: resume silently.
    Ignore,
    /// No enabled breakpoint of this manager applies to the thread.
    NoOwner,
}

#[derive(Debug)]
struct Site
{
    trap: TrapId,
    owners: SmallVec<[BreakpointHandle; 2]>,
}

/// The registry.
#[derive(Debug, Default)]
pub struct BreakpointManager
{
    slots: Vec<Option<Breakpoint>>,
    sites: BTreeMap<Address, Site>,
}

impl BreakpointManager
{
    /// Empty manager.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Insert a breakpoint through `inferior` (any stopped thread of the
    /// process).
    ///
    /// ## Errors
    ///
    /// Propagates trap installation failures; nothing is registered then.
    pub fn insert(&mut self, inferior: &mut dyn Inferior, builder: BreakpointBuilder) -> Result<BreakpointHandle>
    {
        let address = builder.address();
        let handle = BreakpointHandle(self.slots.len() as u32 + 1);
        let breakpoint = builder.into_breakpoint(handle);
        let enabled = breakpoint.enabled;

        match self.sites.get_mut(&address) {
            Some(site) => {
                if enabled {
                    inferior.enable_breakpoint(site.trap)?;
                }
                site.owners.push(handle);
            }
            None => {
                let trap = inferior.insert_breakpoint(address)?;
                if !enabled {
                    inferior.disable_breakpoint(trap)?;
                }
                let mut owners = SmallVec::new();
                owners.push(handle);
                self.sites.insert(address, Site { trap, owners });
            }
        }
        self.slots.push(Some(breakpoint));
        debug!(%handle, %address, enabled, "breakpoint inserted");
        Ok(handle)
    }

    /// Remove a breakpoint. The trap goes away with the last owner of its
    /// address.
    ///
    /// ## Errors
    ///
    /// `NoSuchBreakpoint` for an unknown handle. If the trap cannot be
    /// taken out of the target the breakpoint stays registered.
    pub fn remove(&mut self, inferior: &mut dyn Inferior, handle: BreakpointHandle) -> Result<()>
    {
        let address = self.get(handle)?.address;
        let Some(site) = self.sites.get_mut(&address) else {
            return Err(StepwiseError::internal(format!("breakpoint {handle} has no site")));
        };
        // The trap goes first so a failure leaves the breakpoint intact.
        if site.owners.iter().all(|owner| *owner == handle) {
            inferior.remove_breakpoint(site.trap)?;
            self.sites.remove(&address);
        } else {
            site.owners.retain(|owner| *owner != handle);
        }
        if let Some(slot) = self.slots.get_mut(Self::index(handle)) {
            *slot = None;
        }
        self.sync_site(inferior, address)?;
        debug!(%handle, %address, "breakpoint removed");
        Ok(())
    }

    /// First breakpoint registered at `address`.
    #[must_use]
    pub fn lookup(&self, address: Address) -> Option<&Breakpoint>
    {
        let site = self.sites.get(&address)?;
        site.owners.iter().find_map(|handle| self.get(*handle).ok())
    }

    /// All breakpoints at `address`.
    pub fn lookup_all(&self, address: Address) -> impl Iterator<Item = &Breakpoint>
    {
        self.sites
            .get(&address)
            .into_iter()
            .flat_map(|site| site.owners.iter())
            .filter_map(|handle| self.get(*handle).ok())
    }

    /// Breakpoint by handle.
    #[must_use]
    pub fn lookup_by_handle(&self, handle: BreakpointHandle) -> Option<&Breakpoint>
    {
        self.get(handle).ok()
    }

    /// All live breakpoints in handle order.
    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint>
    {
        self.slots.iter().flatten()
    }

    /// Enable one breakpoint.
    ///
    /// ## Errors
    ///
    /// `NoSuchBreakpoint` for an unknown handle.
    pub fn enable(&mut self, inferior: &mut dyn Inferior, handle: BreakpointHandle) -> Result<()>
    {
        self.set_enabled(inferior, handle, true)
    }

    /// Disable one breakpoint; the original bytes come back once every owner
    /// of its address is disabled.
    ///
    /// ## Errors
    ///
    /// `NoSuchBreakpoint` for an unknown handle.
    pub fn disable(&mut self, inferior: &mut dyn Inferior, handle: BreakpointHandle) -> Result<()>
    {
        self.set_enabled(inferior, handle, false)
    }

    /// Enable every breakpoint of `group`. Returns how many were affected.
    pub fn enable_group(&mut self, inferior: &mut dyn Inferior, group: &str) -> Result<usize>
    {
        self.set_group_enabled(inferior, group, true)
    }

    /// Disable every breakpoint of `group`. Returns how many were affected.
    pub fn disable_group(&mut self, inferior: &mut dyn Inferior, group: &str) -> Result<usize>
    {
        self.set_group_enabled(inferior, group, false)
    }

    /// `true` if any breakpoint that applies to `thread` at `address` has a
    /// predicate that wants the frame.
    #[must_use]
    pub fn hit_needs_frame(&self, address: Address, thread: ThreadId) -> bool
    {
        self.lookup_all(address)
            .any(|breakpoint| breakpoint.applies_to(thread) && breakpoint.needs_frame())
    }

    /// Decide what a trap at `address` on `thread` means. Every applicable
    /// owner records the hit; the first one whose predicate accepts and
    /// whose action is [`BreakpointAction::Report`] wins.
    pub fn resolve_hit(&mut self, address: Address, thread: ThreadId, frame: Option<&StackFrame>) -> HitResolution
    {
        let Some(site) = self.sites.get(&address) else {
            return HitResolution::NoOwner;
        };
        let owners = site.owners.clone();

        let mut applicable = false;
        let mut report = None;
        for handle in owners {
            let Some(Some(breakpoint)) = self.slots.get_mut(Self::index(handle)) else {
                continue;
            };
            if !breakpoint.applies_to(thread) {
                continue;
            }
            applicable = true;
            if breakpoint.accept(thread, frame)
                && breakpoint.action == BreakpointAction::Report
                && report.is_none()
            {
                report = Some(handle);
            }
        }

        match (applicable, report) {
            (_, Some(handle)) => HitResolution::Report(handle),
            (true, None) => HitResolution::Ignore,
            (false, None) => HitResolution::NoOwner,
        }
    }

    /// Forget everything without touching memory (the process is gone or
    /// its trap table was already cleared).
    pub fn clear(&mut self)
    {
        self.slots.clear();
        self.sites.clear();
    }

    fn index(handle: BreakpointHandle) -> usize
    {
        (handle.0 as usize).wrapping_sub(1)
    }

    fn get(&self, handle: BreakpointHandle) -> Result<&Breakpoint>
    {
        self.slots
            .get(Self::index(handle))
            .and_then(Option::as_ref)
            .ok_or(StepwiseError::NoSuchBreakpoint(handle.0))
    }

    fn set_enabled(&mut self, inferior: &mut dyn Inferior, handle: BreakpointHandle, enabled: bool) -> Result<()>
    {
        let address = self.get(handle)?.address;
        if let Some(Some(breakpoint)) = self.slots.get_mut(Self::index(handle)) {
            breakpoint.enabled = enabled;
        }
        self.sync_site(inferior, address)?;
        debug!(%handle, %address, enabled, "breakpoint state changed");
        Ok(())
    }

    fn set_group_enabled(&mut self, inferior: &mut dyn Inferior, group: &str, enabled: bool) -> Result<usize>
    {
        let mut addresses = Vec::new();
        for breakpoint in self.slots.iter_mut().flatten() {
            if breakpoint.group.as_deref() == Some(group) {
                breakpoint.enabled = enabled;
                addresses.push(breakpoint.address);
            }
        }
        addresses.sort();
        addresses.dedup();
        for address in &addresses {
            self.sync_site(inferior, *address)?;
        }
        debug!(group, enabled, sites = addresses.len(), "group state changed");
        Ok(addresses.len())
    }

    /// Keep the trap's enabled state equal to "any owner enabled".
    fn sync_site(&self, inferior: &mut dyn Inferior, address: Address) -> Result<()>
    {
        let Some(site) = self.sites.get(&address) else {
            return Ok(());
        };
        let any_enabled = site
            .owners
            .iter()
            .filter_map(|handle| self.get(*handle).ok())
            .any(|breakpoint| breakpoint.enabled);
        if any_enabled {
            inferior.enable_breakpoint(site.trap)
        } else {
            inferior.disable_breakpoint(site.trap)
        }
    }
}
