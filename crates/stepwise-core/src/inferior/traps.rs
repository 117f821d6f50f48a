//! Process-wide software breakpoint table.
//!
//! Several logical traps may share one address (a user breakpoint and an
//! engine's temporary breakpoint, or two user breakpoints). The table keeps
//! one *site* per address holding the original bytes, and one *entry* per
//! inserted trap. A site carries the trap instruction while at least one of
//! its entries is enabled and the site is not suspended for a step-over.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::error::{Result, StepwiseError};
use crate::types::Address;

/// Identity of one inserted trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrapId(pub u32);

impl fmt::Display for TrapId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "trap#{}", self.0)
    }
}

/// Unfiltered target memory, trap bytes included.
pub trait RawMemory
{
    /// Read exactly what is in memory.
    fn read_raw(&self, address: Address, len: usize) -> Result<Vec<u8>>;

    /// Write bytes without consulting the trap table.
    fn write_raw(&mut self, address: Address, data: &[u8]) -> Result<()>;
}

#[derive(Debug)]
struct Site
{
    original: Vec<u8>,
    installed: bool,
    suspended: bool,
    refs: usize,
    enabled: usize,
}

#[derive(Debug, Clone, Copy)]
struct Entry
{
    address: Address,
    enabled: bool,
}

/// The table. Shared by every thread of a process through [`SharedTraps`].
#[derive(Debug)]
pub struct TrapTable
{
    instruction: &'static [u8],
    sites: BTreeMap<Address, Site>,
    entries: HashMap<TrapId, Entry>,
    next_id: u32,
}

/// Handle shared by all thread inferiors of one process.
pub type SharedTraps = Arc<Mutex<TrapTable>>;

impl TrapTable
{
    /// Empty table for the given trap encoding.
    #[must_use]
    pub fn new(instruction: &'static [u8]) -> Self
    {
        Self {
            instruction,
            sites: BTreeMap::new(),
            entries: HashMap::new(),
            next_id: 1,
        }
    }

    /// Empty table behind a mutex.
    #[must_use]
    pub fn shared(instruction: &'static [u8]) -> SharedTraps
    {
        Arc::new(Mutex::new(Self::new(instruction)))
    }

    /// Insert an enabled trap at `address`.
    pub fn insert(&mut self, memory: &mut dyn RawMemory, address: Address) -> Result<TrapId>
    {
        if !self.sites.contains_key(&address) {
            let original = memory.read_raw(address, self.instruction.len())?;
            self.sites.insert(
                address,
                Site {
                    original,
                    installed: false,
                    suspended: false,
                    refs: 0,
                    enabled: 0,
                },
            );
        }
        if let Some(site) = self.sites.get_mut(&address) {
            site.refs += 1;
            site.enabled += 1;
        }

        let id = TrapId(self.next_id);
        self.next_id += 1;
        self.entries.insert(id, Entry { address, enabled: true });
        self.sync(memory, address)?;
        trace!(%id, %address, "trap inserted");
        Ok(id)
    }

    /// Remove a trap. The original bytes come back once the last trap at
    /// the address is gone.
    pub fn remove(&mut self, memory: &mut dyn RawMemory, id: TrapId) -> Result<()>
    {
        let entry = self.entries.remove(&id).ok_or(StepwiseError::NoSuchBreakpoint(id.0))?;
        let mut drop_site = false;
        if let Some(site) = self.sites.get_mut(&entry.address) {
            site.refs -= 1;
            if entry.enabled {
                site.enabled -= 1;
            }
            drop_site = site.refs == 0;
        }
        self.sync(memory, entry.address)?;
        if drop_site {
            self.sites.remove(&entry.address);
        }
        trace!(%id, address = %entry.address, "trap removed");
        Ok(())
    }

    /// Enable or disable one trap.
    pub fn set_enabled(&mut self, memory: &mut dyn RawMemory, id: TrapId, enabled: bool) -> Result<()>
    {
        let entry = self.entries.get_mut(&id).ok_or(StepwiseError::NoSuchBreakpoint(id.0))?;
        if entry.enabled == enabled {
            return Ok(());
        }
        entry.enabled = enabled;
        let address = entry.address;
        if let Some(site) = self.sites.get_mut(&address) {
            if enabled {
                site.enabled += 1;
            } else {
                site.enabled -= 1;
            }
        }
        self.sync(memory, address)
    }

    /// Take the trap instruction out of (or put it back into) memory at
    /// `address` regardless of the entries there. Used to step one thread
    /// over a breakpoint.
    pub fn suspend(&mut self, memory: &mut dyn RawMemory, address: Address, suspended: bool) -> Result<()>
    {
        let Some(site) = self.sites.get_mut(&address) else {
            return Ok(());
        };
        site.suspended = suspended;
        self.sync(memory, address)
    }

    /// `true` if memory at `address` currently holds a trap instruction
    /// placed by this table.
    #[must_use]
    pub fn is_installed(&self, address: Address) -> bool
    {
        self.sites.get(&address).is_some_and(|site| site.installed)
    }

    /// `true` if `address` has a site, installed or not.
    #[must_use]
    pub fn has_site(&self, address: Address) -> bool
    {
        self.sites.contains_key(&address)
    }

    /// Address of a trap.
    #[must_use]
    pub fn address_of(&self, id: TrapId) -> Option<Address>
    {
        self.entries.get(&id).map(|entry| entry.address)
    }

    /// Whether a trap is enabled.
    #[must_use]
    pub fn is_enabled(&self, id: TrapId) -> bool
    {
        self.entries.get(&id).is_some_and(|entry| entry.enabled)
    }

    /// Replace trap bytes inside `bytes` (read from `address`) with the
    /// original code.
    pub fn shadow(&self, address: Address, bytes: &mut [u8])
    {
        let end = address + bytes.len() as u64;
        let start = address
            .checked_sub(self.instruction.len() as u64 - 1)
            .unwrap_or(Address::ZERO);
        for (site_address, site) in self.sites.range(start..end) {
            if !site.installed {
                continue;
            }
            for (i, original) in site.original.iter().enumerate() {
                let Some(index) = (*site_address + i as u64).offset_from(address) else {
                    continue;
                };
                if let Some(byte) = bytes.get_mut(index as usize) {
                    *byte = *original;
                }
            }
        }
    }

    /// Adjust a write of `bytes` at `address` so installed traps survive it:
    /// overlapping original bytes are updated and the trap instruction is
    /// kept in the buffer.
    pub fn shadow_write(&mut self, address: Address, bytes: &mut [u8])
    {
        let instruction = self.instruction;
        let end = address + bytes.len() as u64;
        let start = address.checked_sub(instruction.len() as u64 - 1).unwrap_or(Address::ZERO);
        for (site_address, site) in self.sites.range_mut(start..end) {
            for (i, original) in site.original.iter_mut().enumerate() {
                let byte_address = *site_address + i as u64;
                let Some(index) = byte_address.offset_from(address) else {
                    continue;
                };
                let Some(byte) = bytes.get_mut(index as usize) else {
                    continue;
                };
                *original = *byte;
                if site.installed {
                    *byte = instruction[i];
                }
            }
        }
    }

    /// Restore every site's original bytes and forget all traps.
    pub fn clear(&mut self, memory: &mut dyn RawMemory) -> Result<()>
    {
        for (address, site) in &self.sites {
            if site.installed {
                memory.write_raw(*address, &site.original)?;
            }
        }
        self.sites.clear();
        self.entries.clear();
        Ok(())
    }

    fn sync(&mut self, memory: &mut dyn RawMemory, address: Address) -> Result<()>
    {
        let instruction = self.instruction;
        let Some(site) = self.sites.get_mut(&address) else {
            return Ok(());
        };
        let wanted = site.enabled > 0 && !site.suspended;
        if wanted && !site.installed {
            memory.write_raw(address, instruction)?;
            site.installed = true;
        } else if !wanted && site.installed {
            memory.write_raw(address, &site.original)?;
            site.installed = false;
        }
        Ok(())
    }
}
