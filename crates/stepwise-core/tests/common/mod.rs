//! A small simulated x86-64 target.
//!
//! The machine interprets a handful of instructions over flat memory and
//! reports stops the way `waitpid` does, so the event loop, the stepping
//! engine and the breakpoint manager can be exercised without a real
//! process. Supported instructions:
//!
//! | bytes            | instruction                        |
//! |------------------|------------------------------------|
//! | `90`             | `nop`                              |
//! | `cc`             | `int3`                             |
//! | `55` / `5d`      | `push rbp` / `pop rbp`             |
//! | `48 89 e5`       | `mov rbp, rsp`                     |
//! | `b8+r imm32`     | `mov r32, imm32`                   |
//! | `e8 rel32`       | `call rel32`                       |
//! | `ff d0+r`        | `call reg`                         |
//! | `c3`             | `ret`                              |
//! | `e9` / `eb`      | `jmp rel32` / `jmp rel8`           |
//! | `0f 05`          | `syscall` (`rax == 56` is `clone`) |
//! | `f4`             | `hlt`, exits the process with `rdi`|

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use stepwise_core::arch::{MemoryAccess, X86_64};
use stepwise_core::config::DebuggerOptions;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::events::{TargetEvent, TargetEventReceiver};
use stepwise_core::inferior::{
    setup_call_frame, CallArgument, ChildEvent, EventSource, Inferior, InjectedCall, RawEvent, RawMemory, RawStatus,
    SharedTraps, TrapId, TrapTable, SIGKILL, SIGSTOP, SIGTRAP,
};
use stepwise_core::symbols::{LineRow, LineTable, Method, Module, SourceFiles, StaticSymbols, SymbolTable};
use stepwise_core::types::{
    Address, MemoryRegion, ProcessId, Registers, SymbolName, TargetState, ThreadId, X86_64Register as Reg,
};
use stepwise_core::{Process, ProcessBuilder};

/// Process id of the simulated target; also the id of its first thread.
pub const PID: u32 = 4242;
/// First code address.
pub const CODE_BASE: u64 = 0x1000;
/// End of the code segment.
pub const CODE_END: u64 = 0x5000;
/// Where injected calls return to.
pub const CALL_RETURN: u64 = 0x4f00;
/// Lowest stack address.
pub const STACK_BASE: u64 = 0x7_0000;
/// One past the highest stack address.
pub const STACK_TOP: u64 = 0x8_0000;
/// Stack space given to each initial thread.
pub const STACK_SIZE: u64 = 0x1000;

const SIGILL: i32 = 4;
const SIGSEGV: i32 = 11;
const SIGTERM: i32 = 15;
const SYS_CLONE: u64 = 56;
const ENOSYS: u64 = (-38i64) as u64;
const ROUNDS_PER_WAIT: usize = 64;
const BLOCKING_WAIT_LIMIT: Duration = Duration::from_secs(5);

/// `modrm` register numbering.
const GPR: [Reg; 8] = [Reg::Rax, Reg::Rcx, Reg::Rdx, Reg::Rbx, Reg::Rsp, Reg::Rbp, Reg::Rsi, Reg::Rdi];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T>
{
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Run
{
    Stopped,
    Continue,
    Step,
}

#[derive(Debug)]
struct Slot
{
    registers: Registers,
    run: Run,
    held: bool,
    alive: bool,
    stop_queued: bool,
    last_trap: Option<Address>,
    trace: Vec<Address>,
}

impl Slot
{
    fn new(pc: u64, sp: u64) -> Self
    {
        let mut registers = Registers::from_values(&[0; Reg::COUNT]);
        registers.set_x86(Reg::Rip, pc);
        registers.set_x86(Reg::Rsp, sp);
        Self {
            registers,
            run: Run::Stopped,
            held: false,
            alive: true,
            stop_queued: false,
            last_trap: None,
            trace: Vec::new(),
        }
    }

    fn get(&self, register: Reg) -> u64
    {
        self.registers.x86(register).unwrap_or(0)
    }

    fn set(&mut self, register: Reg, value: u64)
    {
        self.registers.set_x86(register, value);
    }

    fn runnable(&self) -> bool
    {
        self.alive && !self.held && self.run != Run::Stopped
    }
}

/// Machine state shared by every thread handle and the event source.
pub struct Machine
{
    segments: Vec<(u64, Vec<u8>, String)>,
    threads: BTreeMap<ThreadId, Slot>,
    events: VecDeque<RawEvent>,
    next_tid: u64,
    traps: SharedTraps,
    suspended_runs: Vec<(ThreadId, Address)>,
    release_on_suspend: Option<(Address, ThreadId)>,
    /// Trap removal fails, as if the code page had been unmapped.
    pin_traps: bool,
}

impl fmt::Debug for Machine
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Machine")
            .field("threads", &self.threads.keys().collect::<Vec<_>>())
            .field("events", &self.events.len())
            .finish()
    }
}

impl RawMemory for Machine
{
    fn read_raw(&self, address: Address, len: usize) -> Result<Vec<u8>>
    {
        let start = address.value();
        for (base, data, _) in &self.segments {
            let end = base + data.len() as u64;
            if start >= *base && start + len as u64 <= end {
                let offset = (start - base) as usize;
                return Ok(data[offset..offset + len].to_vec());
            }
        }
        Err(StepwiseError::memory(address, "unmapped"))
    }

    fn write_raw(&mut self, address: Address, data: &[u8]) -> Result<()>
    {
        let start = address.value();
        let segment = self
            .segments
            .iter_mut()
            .find(|(base, bytes, _)| start >= *base && start + data.len() as u64 <= base + bytes.len() as u64)
            .ok_or_else(|| StepwiseError::memory(address, "unmapped"))?;
        let offset = (start - segment.0) as usize;
        segment.1[offset..offset + data.len()].copy_from_slice(data);

        if let Some((site, tid)) = self.release_on_suspend {
            if site == address && data != X86_64::BREAKPOINT {
                if let Some(slot) = self.threads.get_mut(&tid) {
                    slot.held = false;
                }
                self.release_on_suspend = None;
            }
        }
        Ok(())
    }
}

impl Machine
{
    fn slot(&mut self, tid: ThreadId) -> Result<&mut Slot>
    {
        self.threads
            .get_mut(&tid)
            .filter(|slot| slot.alive)
            .ok_or(StepwiseError::NoTarget)
    }

    fn push(&mut self, tid: ThreadId, status: RawStatus)
    {
        self.events.push_back(RawEvent { tid, status });
    }

    fn stop(&mut self, tid: ThreadId, status: RawStatus)
    {
        if let Some(slot) = self.threads.get_mut(&tid) {
            slot.run = Run::Stopped;
        }
        self.push(tid, status);
    }

    fn take_event(&mut self, filter: Option<ThreadId>) -> Option<RawEvent>
    {
        let index = self
            .events
            .iter()
            .position(|event| filter.map_or(true, |tid| event.tid == tid))?;
        self.events.remove(index)
    }

    fn runnable(&self, filter: Option<ThreadId>) -> Vec<ThreadId>
    {
        self.threads
            .iter()
            .filter(|(tid, slot)| slot.runnable() && filter.map_or(true, |wanted| **tid == wanted))
            .map(|(tid, _)| *tid)
            .collect()
    }

    fn any_alive(&self, filter: Option<ThreadId>) -> bool
    {
        self.threads
            .iter()
            .any(|(tid, slot)| slot.alive && filter.map_or(true, |wanted| *tid == wanted))
    }

    fn has_event(&self, filter: Option<ThreadId>) -> bool
    {
        self.events
            .iter()
            .any(|event| filter.map_or(true, |tid| event.tid == tid))
    }

    fn push_word(&mut self, tid: ThreadId, value: u64) -> Result<()>
    {
        let sp = self.slot(tid)?.get(Reg::Rsp) - 8;
        self.write_raw(Address::new(sp), &value.to_le_bytes())?;
        self.slot(tid)?.set(Reg::Rsp, sp);
        Ok(())
    }

    fn read_word(&self, address: u64) -> Result<u64>
    {
        let bytes = self.read_raw(Address::new(address), 8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(word))
    }

    fn pop_word(&mut self, tid: ThreadId) -> Result<u64>
    {
        let sp = self.slot(tid)?.get(Reg::Rsp);
        let word = self.read_word(sp)?;
        self.slot(tid)?.set(Reg::Rsp, sp + 8);
        Ok(word)
    }

    fn exit_all(&mut self, code: i32)
    {
        let tids: Vec<ThreadId> = self
            .threads
            .iter()
            .filter(|(_, slot)| slot.alive)
            .map(|(tid, _)| *tid)
            .collect();
        for tid in tids {
            if let Some(slot) = self.threads.get_mut(&tid) {
                slot.alive = false;
                slot.run = Run::Stopped;
            }
            self.push(tid, RawStatus::Exited(code));
        }
    }

    fn signal_all(&mut self, signal: i32)
    {
        self.events.clear();
        let tids: Vec<ThreadId> = self
            .threads
            .iter()
            .filter(|(_, slot)| slot.alive)
            .map(|(tid, _)| *tid)
            .collect();
        for tid in tids {
            if let Some(slot) = self.threads.get_mut(&tid) {
                slot.alive = false;
                slot.run = Run::Stopped;
            }
            self.push(tid, RawStatus::Signaled(signal));
        }
    }

    fn clone_thread(&mut self, parent: ThreadId) -> Result<ThreadId>
    {
        let tid = ThreadId(self.next_tid);
        self.next_tid += 1;
        let slot = self.slot(parent)?;
        let mut child = Slot::new(slot.get(Reg::Rdi), slot.get(Reg::Rsi));
        child.set(Reg::Rbp, 0);
        slot.set(Reg::Rax, tid.raw());
        self.threads.insert(tid, child);
        // The child's initial stop is reported before the parent learns
        // about it, as the kernel may do.
        self.push(tid, RawStatus::Stopped(SIGSTOP));
        Ok(tid)
    }

    /// Run one instruction of `tid`.
    fn execute(&mut self, tid: ThreadId) -> Result<()>
    {
        let slot = self.slot(tid)?;
        let pc = slot.get(Reg::Rip);
        let stepping = slot.run == Run::Step;
        slot.trace.push(Address::new(pc));

        {
            let traps = lock(&self.traps);
            if traps.has_site(Address::new(pc)) && !traps.is_installed(Address::new(pc)) {
                self.suspended_runs.push((tid, Address::new(pc)));
            }
        }

        let Ok(code) = self.read_raw(Address::new(pc), 8) else {
            self.stop(tid, RawStatus::Stopped(SIGSEGV));
            return Ok(());
        };
        let rel32 = |at: usize| i64::from(i32::from_le_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]]));

        let next = match code[0] {
            0x90 => pc + 1,
            0xcc => {
                let slot = self.slot(tid)?;
                slot.set(Reg::Rip, pc + 1);
                slot.last_trap = Some(Address::new(pc));
                self.stop(tid, RawStatus::Stopped(SIGTRAP));
                return Ok(());
            }
            0x55 => {
                let rbp = self.slot(tid)?.get(Reg::Rbp);
                self.push_word(tid, rbp)?;
                pc + 1
            }
            0x5d => {
                let rbp = self.pop_word(tid)?;
                self.slot(tid)?.set(Reg::Rbp, rbp);
                pc + 1
            }
            0x48 if code[1] == 0x89 && code[2] == 0xe5 => {
                let slot = self.slot(tid)?;
                let sp = slot.get(Reg::Rsp);
                slot.set(Reg::Rbp, sp);
                pc + 3
            }
            op @ 0xb8..=0xbf => {
                let value = u64::from(u32::from_le_bytes([code[1], code[2], code[3], code[4]]));
                self.slot(tid)?.set(GPR[usize::from(op - 0xb8)], value);
                pc + 5
            }
            0xe8 => {
                let ret = pc + 5;
                self.push_word(tid, ret)?;
                ret.wrapping_add_signed(rel32(1))
            }
            0xff if code[1] & 0xf8 == 0xd0 => {
                let target = self.slot(tid)?.get(GPR[usize::from(code[1] & 7)]);
                self.push_word(tid, pc + 2)?;
                target
            }
            // call *(%base,%index,8)
            0xff if code[1] == 0x14 && code[2] & 7 != 5 => {
                let sib = code[2];
                let slot = self.slot(tid)?;
                let index = match (sib >> 3) & 7 {
                    4 => 0,
                    index => slot.get(GPR[usize::from(index)]),
                };
                let entry = slot.get(GPR[usize::from(sib & 7)]).wrapping_add(index << (sib >> 6));
                let target = self.read_word(entry)?;
                self.push_word(tid, pc + 3)?;
                target
            }
            // call *%fs:disp8(%reg); the fs base is zero
            0x64 if code[1] == 0xff && code[2] & 0xf8 == 0x50 && code[2] & 7 != 4 => {
                let base = self.slot(tid)?.get(GPR[usize::from(code[2] & 7)]);
                let target = self.read_word(base.wrapping_add_signed(i64::from(code[3] as i8)))?;
                self.push_word(tid, pc + 4)?;
                target
            }
            0xc3 => self.pop_word(tid)?,
            0xe9 => (pc + 5).wrapping_add_signed(rel32(1)),
            0xeb => (pc + 2).wrapping_add_signed(i64::from(code[1] as i8)),
            0x0f if code[1] == 0x05 => {
                if self.slot(tid)?.get(Reg::Rax) == SYS_CLONE {
                    let child = self.clone_thread(tid)?;
                    self.slot(tid)?.set(Reg::Rip, pc + 2);
                    self.stop(tid, RawStatus::Cloned(child));
                    return Ok(());
                }
                self.slot(tid)?.set(Reg::Rax, ENOSYS);
                pc + 2
            }
            0xf4 => {
                let code = (self.slot(tid)?.get(Reg::Rdi) & 0xff) as i32;
                self.exit_all(code);
                return Ok(());
            }
            _ => {
                self.stop(tid, RawStatus::Stopped(SIGILL));
                return Ok(());
            }
        };

        self.slot(tid)?.set(Reg::Rip, next);
        if stepping {
            self.stop(tid, RawStatus::Stopped(SIGTRAP));
        }
        Ok(())
    }
}

/// Test-side handle on a simulated target.
#[derive(Debug, Clone)]
pub struct SimTarget
{
    machine: Arc<Mutex<Machine>>,
}

impl Default for SimTarget
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl SimTarget
{
    /// Empty machine with a zeroed code segment and a stack.
    pub fn new() -> Self
    {
        let mut code = vec![0u8; (CODE_END - CODE_BASE) as usize];
        code[(CALL_RETURN - CODE_BASE) as usize] = 0x90;
        let stack = vec![0u8; (STACK_TOP - STACK_BASE) as usize];
        let machine = Machine {
            segments: vec![(CODE_BASE, code, "sim".to_string()), (STACK_BASE, stack, "[stack]".to_string())],
            threads: BTreeMap::new(),
            events: VecDeque::new(),
            next_tid: u64::from(PID),
            traps: TrapTable::shared(X86_64::BREAKPOINT),
            suspended_runs: Vec::new(),
            release_on_suspend: None,
            pin_traps: false,
        };
        Self {
            machine: Arc::new(Mutex::new(machine)),
        }
    }

    /// Copy `code` to `address`.
    pub fn load(&self, address: u64, code: &[u8]) -> &Self
    {
        lock(&self.machine)
            .write_raw(Address::new(address), code)
            .unwrap_or_else(|e| panic!("cannot load code at {address:#x}: {e}"));
        self
    }

    /// Add a stopped thread starting at `pc`. Its stack holds a zero
    /// return address, which ends backtraces.
    pub fn add_thread(&self, pc: u64) -> ThreadId
    {
        let mut machine = lock(&self.machine);
        let tid = ThreadId(machine.next_tid);
        machine.next_tid += 1;
        let index = machine.threads.len() as u64;
        let sp = STACK_TOP - index * STACK_SIZE - 8;
        machine.threads.insert(tid, Slot::new(pc, sp));
        tid
    }

    /// Keep `tid` from executing even when it is resumed.
    pub fn hold(&self, tid: ThreadId)
    {
        if let Some(slot) = lock(&self.machine).threads.get_mut(&tid) {
            slot.held = true;
        }
    }

    /// Undo [`SimTarget::hold`].
    pub fn release(&self, tid: ThreadId)
    {
        if let Some(slot) = lock(&self.machine).threads.get_mut(&tid) {
            slot.held = false;
        }
    }

    /// Make every trap removal fail until called again with `false`.
    pub fn pin_traps(&self, pinned: bool)
    {
        lock(&self.machine).pin_traps = pinned;
    }

    /// Hold `tid` until the trap at `address` is lifted, so the thread is
    /// eligible to run exactly while another thread steps over the site.
    pub fn release_when_lifted(&self, tid: ThreadId, address: u64)
    {
        self.hold(tid);
        lock(&self.machine).release_on_suspend = Some((Address::new(address), tid));
    }

    /// Memory as the hardware sees it, trap bytes included.
    pub fn raw_bytes(&self, address: u64, len: usize) -> Vec<u8>
    {
        lock(&self.machine)
            .read_raw(Address::new(address), len)
            .unwrap_or_else(|e| panic!("cannot read {address:#x}: {e}"))
    }

    /// Addresses `tid` executed, in order.
    pub fn trace(&self, tid: ThreadId) -> Vec<Address>
    {
        lock(&self.machine)
            .threads
            .get(&tid)
            .map(|slot| slot.trace.clone())
            .unwrap_or_default()
    }

    /// Current pc of `tid`.
    pub fn pc(&self, tid: ThreadId) -> Address
    {
        lock(&self.machine)
            .threads
            .get(&tid)
            .map_or(Address::ZERO, |slot| Address::new(slot.get(Reg::Rip)))
    }

    /// Every time a thread executed the original instruction at a
    /// temporarily lifted trap.
    pub fn suspended_runs(&self) -> Vec<(ThreadId, Address)>
    {
        lock(&self.machine).suspended_runs.clone()
    }

    /// Number of threads the machine knows about.
    pub fn thread_count(&self) -> usize
    {
        lock(&self.machine).threads.len()
    }

    /// Inferiors and event source, in the shape [`ProcessBuilder::start`]
    /// expects.
    pub fn factory(&self) -> impl FnOnce() -> Result<(Vec<Box<dyn Inferior>>, Box<dyn EventSource>)> + Send + 'static
    {
        let machine = Arc::clone(&self.machine);
        move || {
            let (tids, traps) = {
                let machine = lock(&machine);
                (machine.threads.keys().copied().collect::<Vec<_>>(), Arc::clone(&machine.traps))
            };
            let inferiors = tids
                .into_iter()
                .map(|tid| {
                    Box::new(SimInferior::new(Arc::clone(&machine), Arc::clone(&traps), tid, TargetState::Stopped))
                        as Box<dyn Inferior>
                })
                .collect();
            let events = SimEvents {
                machine: Arc::clone(&machine),
            };
            Ok((inferiors, Box::new(events) as Box<dyn EventSource>))
        }
    }
}

/// One thread of the simulated target.
#[derive(Debug)]
pub struct SimInferior
{
    machine: Arc<Mutex<Machine>>,
    traps: SharedTraps,
    tid: ThreadId,
    state: TargetState,
    stepping: bool,
    sigstop_pending: bool,
    calls: Vec<InjectedCall>,
}

impl SimInferior
{
    fn new(machine: Arc<Mutex<Machine>>, traps: SharedTraps, tid: ThreadId, state: TargetState) -> Self
    {
        Self {
            machine,
            traps,
            tid,
            state,
            stepping: false,
            sigstop_pending: false,
            calls: Vec::new(),
        }
    }

    fn ensure_stopped(&self) -> Result<()>
    {
        match self.state {
            TargetState::Stopped => Ok(()),
            state if state.is_dead() => Err(StepwiseError::NoTarget),
            _ => Err(StepwiseError::NotStopped),
        }
    }

    fn set_run(&mut self, run: Run) -> Result<()>
    {
        let mut machine = lock(&self.machine);
        let slot = machine.slot(self.tid)?;
        slot.last_trap = None;
        if slot.stop_queued {
            slot.stop_queued = false;
            machine.stop(self.tid, RawStatus::Stopped(SIGSTOP));
        } else {
            slot.run = run;
        }
        Ok(())
    }

    fn finish_call(&mut self, last_trap: Option<Address>, sp: u64) -> Result<Option<ChildEvent>>
    {
        let Some(call) = self.calls.last() else {
            return Ok(None);
        };
        if last_trap != Some(call.return_address) || Address::new(sp) != call.return_sp {
            return Ok(None);
        }
        let Some(call) = self.calls.pop() else {
            return Ok(None);
        };
        let (data1, data2) = {
            let mut machine = lock(&self.machine);
            let slot = machine.slot(self.tid)?;
            let result = (slot.get(Reg::Rax), slot.get(Reg::Rdx));
            slot.registers = call.saved.clone();
            result
        };
        let mut traps = lock(&self.traps);
        traps.remove(&mut *lock(&self.machine), call.trap)?;
        Ok(Some(ChildEvent::Callback {
            id: call.callback,
            data1,
            data2,
        }))
    }

    fn interpret_trap(&mut self) -> Result<ChildEvent>
    {
        let (last_trap, sp) = {
            let mut machine = lock(&self.machine);
            let slot = machine.slot(self.tid)?;
            (slot.last_trap.take(), slot.get(Reg::Rsp))
        };
        if let Some(event) = self.finish_call(last_trap, sp)? {
            return Ok(event);
        }
        match last_trap {
            Some(address) if lock(&self.traps).is_installed(address) => {
                lock(&self.machine).slot(self.tid)?.set(Reg::Rip, address.value());
                Ok(ChildEvent::HitBreakpoint(Some(address)))
            }
            Some(_) => Ok(ChildEvent::HitBreakpoint(None)),
            None if self.stepping => Ok(ChildEvent::Stopped(0)),
            None => Ok(ChildEvent::Stopped(SIGTRAP)),
        }
    }

    fn with_traps<T>(&self, f: impl FnOnce(&mut TrapTable, &mut Machine) -> Result<T>) -> Result<T>
    {
        self.ensure_stopped()?;
        let mut traps = lock(&self.traps);
        let mut machine = lock(&self.machine);
        f(&mut traps, &mut machine)
    }
}

impl MemoryAccess for SimInferior
{
    fn read_bytes(&self, address: Address, len: usize) -> Result<Vec<u8>>
    {
        self.ensure_stopped()?;
        let mut bytes = lock(&self.machine).read_raw(address, len)?;
        lock(&self.traps).shadow(address, &mut bytes);
        Ok(bytes)
    }
}

impl Inferior for SimInferior
{
    fn pid(&self) -> ProcessId
    {
        ProcessId(PID)
    }

    fn tid(&self) -> ThreadId
    {
        self.tid
    }

    fn state(&self) -> TargetState
    {
        self.state
    }

    fn resume(&mut self) -> Result<()>
    {
        self.ensure_stopped()?;
        self.set_run(Run::Continue)?;
        self.stepping = false;
        self.state = TargetState::Running;
        Ok(())
    }

    fn single_step(&mut self) -> Result<()>
    {
        self.ensure_stopped()?;
        self.set_run(Run::Step)?;
        self.stepping = true;
        self.state = TargetState::Running;
        Ok(())
    }

    fn stop(&mut self) -> Result<bool>
    {
        if self.state != TargetState::Running {
            return Ok(false);
        }
        if self.sigstop_pending {
            return Ok(true);
        }
        let mut machine = lock(&self.machine);
        let slot = machine.slot(self.tid)?;
        if slot.run == Run::Stopped {
            // Already stopped with an unreported event; the stop request
            // surfaces after the next resume.
            slot.stop_queued = true;
        } else {
            machine.stop(self.tid, RawStatus::Stopped(SIGSTOP));
        }
        self.sigstop_pending = true;
        Ok(true)
    }

    fn kill(&mut self) -> Result<()>
    {
        lock(&self.machine).signal_all(SIGKILL);
        Ok(())
    }

    fn terminate(&mut self) -> Result<()>
    {
        lock(&self.machine).signal_all(SIGTERM);
        Ok(())
    }

    fn detach(&mut self) -> Result<()>
    {
        self.with_traps(|traps, machine| traps.clear(machine))?;
        let mut machine = lock(&self.machine);
        let slot = machine.slot(self.tid)?;
        slot.alive = false;
        slot.run = Run::Stopped;
        self.state = TargetState::NoTarget;
        Ok(())
    }

    fn process_event(&mut self, status: RawStatus) -> Result<ChildEvent>
    {
        let event = match status {
            RawStatus::Exited(code) => {
                self.state = TargetState::Exited(code);
                return Ok(ChildEvent::Exited(code));
            }
            RawStatus::Signaled(signal) => {
                self.state = TargetState::Signaled(signal);
                return Ok(ChildEvent::Signaled(signal));
            }
            RawStatus::Cloned(tid) => {
                self.state = TargetState::Stopped;
                ChildEvent::ThreadCreated(tid)
            }
            RawStatus::Stopped(SIGSTOP) if self.sigstop_pending => {
                self.state = TargetState::Stopped;
                self.sigstop_pending = false;
                ChildEvent::Interrupted
            }
            RawStatus::Stopped(SIGTRAP) => {
                self.state = TargetState::Stopped;
                self.interpret_trap()?
            }
            RawStatus::Stopped(signal) => {
                self.state = TargetState::Stopped;
                ChildEvent::Stopped(signal)
            }
        };
        self.stepping = false;
        Ok(event)
    }

    fn registers(&self) -> Result<Registers>
    {
        self.ensure_stopped()?;
        Ok(lock(&self.machine).slot(self.tid)?.registers.clone())
    }

    fn set_registers(&mut self, registers: &Registers) -> Result<()>
    {
        self.ensure_stopped()?;
        let mut machine = lock(&self.machine);
        let slot = machine.slot(self.tid)?;
        for (index, register) in registers.iter() {
            if let Some(value) = register.value() {
                slot.registers.set(index, value);
            }
        }
        Ok(())
    }

    fn write_memory(&mut self, address: Address, data: &[u8]) -> Result<()>
    {
        self.with_traps(|traps, machine| {
            let mut bytes = data.to_vec();
            traps.shadow_write(address, &mut bytes);
            machine.write_raw(address, &bytes)
        })
    }

    fn insert_breakpoint(&mut self, address: Address) -> Result<TrapId>
    {
        self.with_traps(|traps, machine| traps.insert(machine, address))
    }

    fn remove_breakpoint(&mut self, id: TrapId) -> Result<()>
    {
        self.with_traps(|traps, machine| {
            if machine.pin_traps {
                return Err(StepwiseError::memory(Address::new(CODE_BASE), "code page is gone"));
            }
            traps.remove(machine, id)
        })
    }

    fn enable_breakpoint(&mut self, id: TrapId) -> Result<()>
    {
        self.with_traps(|traps, machine| traps.set_enabled(machine, id, true))
    }

    fn disable_breakpoint(&mut self, id: TrapId) -> Result<()>
    {
        self.with_traps(|traps, machine| traps.set_enabled(machine, id, false))
    }

    fn suspend_breakpoints_at(&mut self, address: Address, suspended: bool) -> Result<()>
    {
        self.with_traps(|traps, machine| traps.suspend(machine, address, suspended))
    }

    fn has_breakpoint_at(&self, address: Address) -> bool
    {
        lock(&self.traps).is_installed(address)
    }

    fn call_function(&mut self, function: Address, args: &[CallArgument], callback: u64) -> Result<()>
    {
        self.ensure_stopped()?;
        let saved = self.registers()?;
        let return_address = Address::new(CALL_RETURN);
        let frame = setup_call_frame(&saved, function, args, return_address)?;
        for (address, bytes) in &frame.writes {
            self.write_memory(*address, bytes)?;
        }
        let trap = self.insert_breakpoint(return_address)?;
        self.set_registers(&frame.registers)?;
        self.calls.push(InjectedCall {
            callback,
            saved,
            return_address,
            return_sp: frame.return_sp,
            trap,
        });
        Ok(())
    }

    fn new_thread(&self, tid: ThreadId) -> Result<Box<dyn Inferior>>
    {
        let mut thread = Self::new(Arc::clone(&self.machine), Arc::clone(&self.traps), tid, TargetState::Running);
        thread.sigstop_pending = true;
        Ok(Box::new(thread))
    }

    fn memory_maps(&self) -> Result<Vec<MemoryRegion>>
    {
        let machine = lock(&self.machine);
        Ok(machine
            .segments
            .iter()
            .map(|(base, data, name)| {
                let permissions = if name == "[stack]" { "rw-p" } else { "r-xp" };
                MemoryRegion::new(
                    Address::new(*base),
                    Address::new(base + data.len() as u64),
                    permissions,
                    Some(name.clone()),
                )
            })
            .collect())
    }
}

/// Event source of the simulated target. Runs the machine while waiting.
#[derive(Debug)]
pub struct SimEvents
{
    machine: Arc<Mutex<Machine>>,
}

impl EventSource for SimEvents
{
    fn wait(&mut self, thread: Option<ThreadId>, timeout: Option<Duration>) -> Result<Option<RawEvent>>
    {
        let started = Instant::now();
        loop {
            {
                let mut machine = lock(&self.machine);
                for _ in 0..ROUNDS_PER_WAIT {
                    if let Some(event) = machine.take_event(thread) {
                        return Ok(Some(event));
                    }
                    let runnable = machine.runnable(thread);
                    if runnable.is_empty() {
                        break;
                    }
                    for tid in runnable {
                        if !machine.threads.get(&tid).is_some_and(Slot::runnable) {
                            continue;
                        }
                        if machine.execute(tid).is_err() {
                            machine.stop(tid, RawStatus::Stopped(SIGSEGV));
                        }
                        if machine.has_event(thread) {
                            break;
                        }
                    }
                }
                if let Some(event) = machine.take_event(thread) {
                    return Ok(Some(event));
                }
                if !machine.any_alive(thread) {
                    return Err(StepwiseError::NoTarget);
                }
                if timeout.is_some() && !machine.runnable(thread).is_empty() {
                    return Ok(None);
                }
            }

            match timeout {
                Some(timeout) => {
                    thread::sleep(timeout.min(Duration::from_millis(1)));
                    return Ok(None);
                }
                None if started.elapsed() > BLOCKING_WAIT_LIMIT => {
                    return Err(StepwiseError::internal("simulated target would block forever"));
                }
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
    }
}

/// Every source file exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllSources;

impl SourceFiles for AllSources
{
    fn exists(&self, _path: &Path) -> bool
    {
        true
    }
}

/// Tiny assembler for the instruction subset the machine runs.
#[derive(Debug, Clone)]
pub struct Asm
{
    base: u64,
    bytes: Vec<u8>,
}

impl Asm
{
    pub fn new(base: u64) -> Self
    {
        Self { base, bytes: Vec::new() }
    }

    /// Address of the next instruction.
    pub fn here(&self) -> u64
    {
        self.base + self.bytes.len() as u64
    }

    pub fn nop(&mut self) -> &mut Self
    {
        self.bytes.push(0x90);
        self
    }

    pub fn int3(&mut self) -> &mut Self
    {
        self.bytes.push(0xcc);
        self
    }

    pub fn push_rbp(&mut self) -> &mut Self
    {
        self.bytes.push(0x55);
        self
    }

    pub fn mov_rbp_rsp(&mut self) -> &mut Self
    {
        self.bytes.extend_from_slice(&[0x48, 0x89, 0xe5]);
        self
    }

    pub fn pop_rbp(&mut self) -> &mut Self
    {
        self.bytes.push(0x5d);
        self
    }

    /// `push rbp; mov rbp, rsp`
    pub fn prologue(&mut self) -> &mut Self
    {
        self.push_rbp().mov_rbp_rsp()
    }

    pub fn ret(&mut self) -> &mut Self
    {
        self.bytes.push(0xc3);
        self
    }

    pub fn hlt(&mut self) -> &mut Self
    {
        self.bytes.push(0xf4);
        self
    }

    pub fn syscall(&mut self) -> &mut Self
    {
        self.bytes.extend_from_slice(&[0x0f, 0x05]);
        self
    }

    /// `mov r32, imm32`; `register` uses `modrm` numbering (0 = `eax`,
    /// 7 = `edi`).
    pub fn mov_imm(&mut self, register: u8, value: u32) -> &mut Self
    {
        self.bytes.push(0xb8 + register);
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn call(&mut self, target: u64) -> &mut Self
    {
        let rel = target.wrapping_sub(self.here() + 5) as i64;
        self.bytes.push(0xe8);
        self.bytes.extend_from_slice(&(rel as i32).to_le_bytes());
        self
    }

    pub fn call_reg(&mut self, register: u8) -> &mut Self
    {
        self.bytes.extend_from_slice(&[0xff, 0xd0 + register]);
        self
    }

    /// `call *(%base,%index,8)`
    pub fn call_table(&mut self, base: u8, index: u8) -> &mut Self
    {
        self.bytes.extend_from_slice(&[0xff, 0x14, 0xc0 | index << 3 | base]);
        self
    }

    /// `call *%fs:disp(%register)`
    pub fn call_fs(&mut self, register: u8, disp: i8) -> &mut Self
    {
        self.bytes.extend_from_slice(&[0x64, 0xff, 0x50 | register, disp as u8]);
        self
    }

    pub fn jmp(&mut self, target: u64) -> &mut Self
    {
        let rel = target.wrapping_sub(self.here() + 5) as i64;
        self.bytes.push(0xe9);
        self.bytes.extend_from_slice(&(rel as i32).to_le_bytes());
        self
    }

    pub fn jmp_short(&mut self, target: u64) -> &mut Self
    {
        let rel = target.wrapping_sub(self.here() + 2) as i64;
        self.bytes.push(0xeb);
        self.bytes.push(rel as i8 as u8);
        self
    }

    /// Load the code into `target`; returns the end address.
    pub fn load(&self, target: &SimTarget) -> u64
    {
        target.load(self.base, &self.bytes);
        self.here()
    }
}

/// Method `[start, end)` in the `sim` module.
pub fn function(name: &str, start: u64, end: u64) -> Method
{
    Method::new(SymbolName::plain(name), Address::new(start), Address::new(end), Module::new("sim"))
}

/// Attach a line table to `method`. `rows` are `(address, line)` pairs.
pub fn with_lines(method: Method, rows: &[(u64, u32)]) -> Method
{
    let rows = rows
        .iter()
        .map(|&(address, line)| LineRow {
            address: Address::new(address),
            line,
        })
        .collect();
    let table = LineTable::new("sim.c", rows, method.end());
    method.with_source(Arc::new(table))
}

/// Symbol table serving `methods`.
pub fn symbols(methods: Vec<Method>) -> Arc<SymbolTable>
{
    let mut provider = StaticSymbols::new();
    for method in methods {
        provider.add(method);
    }
    let table = SymbolTable::new();
    table.add_provider(Arc::new(provider));
    table
}

/// Options tuned for the simulator.
pub fn options() -> DebuggerOptions
{
    DebuggerOptions {
        poll_interval: Duration::from_millis(1),
        ..DebuggerOptions::default()
    }
}

/// Start a debugger session over `target`.
pub fn start(target: &SimTarget, symbols: Arc<SymbolTable>) -> Process
{
    ProcessBuilder::new(options())
        .symbols(symbols)
        .sources(Arc::new(AllSources))
        .architecture(Arc::new(X86_64))
        .without_elf_symbols()
        .start(target.factory())
        .unwrap_or_else(|e| panic!("cannot start simulated target: {e}"))
}

/// Events received so far.
pub fn drain(events: &TargetEventReceiver) -> Vec<TargetEvent>
{
    events.try_iter().collect()
}

/// pc of the frame carried by a stop event.
pub fn stop_pc(event: &TargetEvent) -> Option<Address>
{
    match event {
        TargetEvent::TargetStopped { frame, .. } | TargetEvent::TargetHitBreakpoint { frame, .. } => {
            frame.as_ref().map(|frame| frame.pc)
        }
        _ => None,
    }
}
