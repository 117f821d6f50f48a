//! Process, thread, target-state and memory region types.

use std::fmt;

use super::Address;

/// Process identifier (PID)
///
/// ## Example
///
/// ```rust
/// use stepwise_core::types::ProcessId;
///
/// let pid = ProcessId::from(4242);
/// assert_eq!(u32::from(pid), 4242);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

impl fmt::Display for ProcessId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Kernel thread identifier
///
/// On Linux this is the TID reported by `waitpid`; the main thread's TID
/// equals the PID. Every traced thread gets its own stepping engine, and
/// the thread manager routes wait events by this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

impl ThreadId
{
    /// Get the raw `u64` representation of the thread identifier
    ///
    /// ```rust
    /// use stepwise_core::types::ThreadId;
    ///
    /// let thread = ThreadId::from(12345);
    /// assert_eq!(thread.raw(), 12345);
    /// ```
    #[must_use]
    pub fn raw(&self) -> u64
    {
        self.0
    }
}

impl From<u64> for ThreadId
{
    fn from(value: u64) -> Self
    {
        Self(value)
    }
}

impl fmt::Display for ThreadId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Observable state of one traced thread
///
/// ## State Transitions
///
/// - `Stopped` → `Running`: a stepping operation was started
/// - `Running` → `Stopped`: the operation completed (or was interrupted)
/// - `Running`/`Stopped` → `Exited` / `Signaled`: the thread died
/// - `Exited`/`Signaled`/`NoTarget` are terminal
/// - `CoreFile` targets never leave that state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetState
{
    /// No process behind the handle (detached or never started).
    NoTarget,
    /// A stepping operation is in flight.
    Running,
    /// Stopped and ready for commands.
    Stopped,
    /// Exited normally with the given code.
    Exited(i32),
    /// Terminated by the given signal.
    Signaled(i32),
    /// Read-only snapshot (post-mortem image).
    CoreFile,
}

impl TargetState
{
    /// `true` once the thread can no longer be controlled.
    #[must_use]
    pub const fn is_dead(self) -> bool
    {
        matches!(self, Self::NoTarget | Self::Exited(_) | Self::Signaled(_))
    }
}

impl fmt::Display for TargetState
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::NoTarget => write!(f, "no target"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Exited(code) => write!(f, "exited ({code})"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal}"),
            Self::CoreFile => write!(f, "core file"),
        }
    }
}

/// Memory region in a process
///
/// One line of `/proc/<pid>/maps`, or one segment of a snapshot target.
///
/// ```
/// use stepwise_core::types::{Address, MemoryRegion};
///
/// let region = MemoryRegion::parse_maps_line(
///     "00400000-00452000 r-xp 00000000 08:02 173521      /usr/bin/dbus-daemon",
/// )
/// .unwrap();
/// assert_eq!(region.start, Address::new(0x40_0000));
/// assert!(region.is_executable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion
{
    /// Start address of the memory region (inclusive)
    pub start: Address,
    /// End address of the memory region (exclusive)
    pub end: Address,
    /// Permission string as printed by the kernel (`r-xp`, `rw-p`, ...)
    pub permissions: String,
    /// File offset of the mapping.
    pub offset: u64,
    /// Backing file or pseudo-name (`[stack]`, `[heap]`, `[vdso]`)
    pub name: Option<String>,
}

impl MemoryRegion
{
    /// Create a new region.
    #[must_use]
    pub fn new(start: Address, end: Address, permissions: impl Into<String>, name: Option<String>) -> Self
    {
        Self {
            start,
            end,
            permissions: permissions.into(),
            offset: 0,
            name,
        }
    }

    /// Parse one line of `/proc/<pid>/maps`.
    ///
    /// Returns `None` for malformed lines rather than failing the whole
    /// listing.
    #[must_use]
    pub fn parse_maps_line(line: &str) -> Option<Self>
    {
        let mut fields = line.split_whitespace();
        let range = fields.next()?;
        let permissions = fields.next()?;
        let offset = u64::from_str_radix(fields.next()?, 16).ok()?;
        let _device = fields.next()?;
        let _inode = fields.next()?;
        let name = fields.collect::<Vec<_>>().join(" ");

        let (start, end) = range.split_once('-')?;
        let start = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;

        Some(Self {
            start: Address::new(start),
            end: Address::new(end),
            permissions: permissions.to_string(),
            offset,
            name: (!name.is_empty()).then_some(name),
        })
    }

    /// Size of the region in bytes.
    #[must_use]
    pub fn size(&self) -> u64
    {
        self.end.value().saturating_sub(self.start.value())
    }

    /// `true` if `address` falls inside the region.
    #[must_use]
    pub fn contains(&self, address: Address) -> bool
    {
        address.within(self.start, self.end)
    }

    /// `true` if the mapping is readable.
    #[must_use]
    pub fn is_readable(&self) -> bool
    {
        self.permissions.starts_with('r')
    }

    /// `true` if the mapping is executable.
    #[must_use]
    pub fn is_executable(&self) -> bool
    {
        self.permissions.chars().nth(2) == Some('x')
    }
}
