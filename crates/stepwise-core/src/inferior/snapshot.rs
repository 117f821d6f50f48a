//! Read-only stopped target.
//!
//! A snapshot is a set of memory segments plus one register file per
//! thread, exactly what a core-file loader produces. It can be inspected
//! (registers, memory, backtraces) but never modified or resumed.

use std::sync::Arc;
use std::time::Duration;

use super::{CallArgument, ChildEvent, EventSource, Inferior, RawEvent, RawStatus, TrapId};
use crate::arch::MemoryAccess;
use crate::error::{Result, StepwiseError};
use crate::types::{Address, MemoryRegion, ProcessId, Registers, TargetState, ThreadId};

/// One contiguous memory segment.
#[derive(Debug, Clone)]
struct Segment
{
    start: Address,
    data: Vec<u8>,
    name: Option<String>,
}

impl Segment
{
    fn end(&self) -> Address
    {
        self.start + self.data.len() as u64
    }
}

#[derive(Debug)]
struct Image
{
    pid: ProcessId,
    segments: Vec<Segment>,
    threads: Vec<(ThreadId, Registers)>,
}

/// A thread of a snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotInferior
{
    image: Arc<Image>,
    tid: ThreadId,
    registers: Registers,
}

/// Builder-style construction of a snapshot.
#[derive(Debug, Default)]
pub struct SnapshotBuilder
{
    pid: u32,
    segments: Vec<Segment>,
    threads: Vec<(ThreadId, Registers)>,
}

impl SnapshotBuilder
{
    /// Add a memory segment.
    #[must_use]
    pub fn segment(mut self, start: Address, data: Vec<u8>, name: Option<String>) -> Self
    {
        self.segments.push(Segment { start, data, name });
        self
    }

    /// Add a thread with its register file.
    #[must_use]
    pub fn thread(mut self, tid: ThreadId, registers: Registers) -> Self
    {
        self.threads.push((tid, registers));
        self
    }

    /// Finish the snapshot; returns one inferior per thread, in the order
    /// they were added.
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` when no thread was added.
    pub fn build(mut self) -> Result<Vec<SnapshotInferior>>
    {
        if self.threads.is_empty() {
            return Err(StepwiseError::InvalidArgument("snapshot has no threads".to_string()));
        }
        self.segments.sort_by_key(|segment| segment.start);
        let image = Arc::new(Image {
            pid: ProcessId(self.pid),
            segments: self.segments,
            threads: self.threads,
        });
        Ok(image
            .threads
            .iter()
            .map(|(tid, registers)| SnapshotInferior {
                image: Arc::clone(&image),
                tid: *tid,
                registers: registers.clone(),
            })
            .collect())
    }
}

impl SnapshotInferior
{
    /// Start describing a snapshot of process `pid`.
    #[must_use]
    pub fn builder(pid: u32) -> SnapshotBuilder
    {
        SnapshotBuilder {
            pid,
            ..SnapshotBuilder::default()
        }
    }

    fn read_only(what: &str) -> StepwiseError
    {
        StepwiseError::NoPermission(format!("cannot {what} a snapshot target"))
    }
}

impl MemoryAccess for SnapshotInferior
{
    fn read_bytes(&self, address: Address, len: usize) -> Result<Vec<u8>>
    {
        let end = address
            .checked_add(len as u64)
            .ok_or_else(|| StepwiseError::memory(address, "range wraps around"))?;
        let segment = self
            .image
            .segments
            .iter()
            .find(|segment| address >= segment.start && end <= segment.end())
            .ok_or_else(|| StepwiseError::memory(address, "not in snapshot"))?;
        let offset = (address.value() - segment.start.value()) as usize;
        Ok(segment.data[offset..offset + len].to_vec())
    }
}

impl Inferior for SnapshotInferior
{
    fn pid(&self) -> ProcessId
    {
        self.image.pid
    }

    fn tid(&self) -> ThreadId
    {
        self.tid
    }

    fn state(&self) -> TargetState
    {
        TargetState::CoreFile
    }

    fn resume(&mut self) -> Result<()>
    {
        Err(Self::read_only("resume"))
    }

    fn single_step(&mut self) -> Result<()>
    {
        Err(Self::read_only("step"))
    }

    fn stop(&mut self) -> Result<bool>
    {
        Ok(false)
    }

    fn kill(&mut self) -> Result<()>
    {
        Err(Self::read_only("kill"))
    }

    fn terminate(&mut self) -> Result<()>
    {
        Err(Self::read_only("terminate"))
    }

    fn detach(&mut self) -> Result<()>
    {
        Ok(())
    }

    fn process_event(&mut self, status: RawStatus) -> Result<ChildEvent>
    {
        Err(StepwiseError::internal(format!("snapshot received event {status:?}")))
    }

    fn registers(&self) -> Result<Registers>
    {
        Ok(self.registers.clone())
    }

    fn set_registers(&mut self, _registers: &Registers) -> Result<()>
    {
        Err(Self::read_only("write registers of"))
    }

    fn write_memory(&mut self, _address: Address, _data: &[u8]) -> Result<()>
    {
        Err(Self::read_only("write memory of"))
    }

    fn insert_breakpoint(&mut self, _address: Address) -> Result<TrapId>
    {
        Err(Self::read_only("insert breakpoints into"))
    }

    fn remove_breakpoint(&mut self, id: TrapId) -> Result<()>
    {
        Err(StepwiseError::NoSuchBreakpoint(id.0))
    }

    fn enable_breakpoint(&mut self, id: TrapId) -> Result<()>
    {
        Err(StepwiseError::NoSuchBreakpoint(id.0))
    }

    fn disable_breakpoint(&mut self, id: TrapId) -> Result<()>
    {
        Err(StepwiseError::NoSuchBreakpoint(id.0))
    }

    fn suspend_breakpoints_at(&mut self, _address: Address, _suspended: bool) -> Result<()>
    {
        Ok(())
    }

    fn has_breakpoint_at(&self, _address: Address) -> bool
    {
        false
    }

    fn call_function(&mut self, _function: Address, _args: &[CallArgument], _callback: u64) -> Result<()>
    {
        Err(Self::read_only("call functions in"))
    }

    fn new_thread(&self, tid: ThreadId) -> Result<Box<dyn Inferior>>
    {
        let registers = self
            .image
            .threads
            .iter()
            .find(|(id, _)| *id == tid)
            .map(|(_, registers)| registers.clone())
            .ok_or_else(|| StepwiseError::InvalidArgument(format!("snapshot has no thread {tid}")))?;
        Ok(Box::new(Self {
            image: Arc::clone(&self.image),
            tid,
            registers,
        }))
    }

    fn memory_maps(&self) -> Result<Vec<MemoryRegion>>
    {
        Ok(self
            .image
            .segments
            .iter()
            .map(|segment| MemoryRegion::new(segment.start, segment.end(), "r--p", segment.name.clone()))
            .collect())
    }
}

/// Event source of a snapshot: nothing ever happens.
#[derive(Debug, Default)]
pub struct SnapshotEvents;

impl EventSource for SnapshotEvents
{
    fn wait(&mut self, _thread: Option<ThreadId>, timeout: Option<Duration>) -> Result<Option<RawEvent>>
    {
        match timeout {
            Some(timeout) => {
                std::thread::sleep(timeout);
                Ok(None)
            }
            None => Err(StepwiseError::NoTarget),
        }
    }
}
