//! # Linux `ptrace` backend
//!
//! One [`PtraceInferior`] per traced thread of a process plus one
//! [`PtraceEvents`] wrapping `waitpid(__WALL)`.
//!
//! ## Trap interpretation
//!
//! A `SIGTRAP` stop is classified in this order:
//!
//! 1. return from an injected call (pc just past the return trap and the
//!    stack pointer back where the callee left it),
//! 2. a trap from the shared trap table at `pc - 1` (the pc is rewound),
//! 3. an `int3` of the program itself, told apart from a step by its
//!    `si_code` even while single-stepping,
//! 4. a completed single step,
//! 5. otherwise, a trap byte at `pc - 1` still counts as a program trap.
//!
//! ## Thread creation
//!
//! Targets are traced with `PTRACE_O_TRACECLONE`: the parent reports a
//! clone event carrying the new thread id, and the new thread starts with a
//! `SIGSTOP` that its own handle reports as [`ChildEvent::Interrupted`].

use std::ffi::c_void;
use std::fs;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::personality::{self, Persona};
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, trace, warn};

use super::call::{setup_call_frame, CallArgument, InjectedCall};
use super::traps::{RawMemory, SharedTraps, TrapId, TrapTable};
use super::{ChildEvent, EventSource, Inferior, RawEvent, RawStatus, SIGSTOP, SIGTRAP};
use crate::arch::{MemoryAccess, X86_64};
use crate::config::LaunchOptions;
use crate::error::{Result, StepwiseError};
use crate::types::{Address, MemoryRegion, ProcessId, Registers, TargetState, ThreadId, X86_64Register as Reg};

const WORD: u64 = 8;
/// `si_code` of a trap raised by an `int3` instruction.
const SI_KERNEL: i32 = 0x80;
/// `AT_ENTRY` auxiliary vector key: the program entry point.
const AT_ENTRY: u64 = 9;
/// Longest wait slice while polling with a deadline.
const POLL_SLICE: Duration = Duration::from_millis(1);

/// Source of a `SIGTRAP` that is not the return from an injected call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrapKind
{
    /// A trap-table entry at `pc - 1`.
    Table,
    /// An `int3` that is part of the program.
    Program,
    /// A finished single step.
    Step,
    /// No `si_code` evidence either way.
    Unknown,
}

/// Classify a trap from the kernel's `si_code` and whether the trap table
/// has an entry just below the pc.
fn classify_trap(stepping: bool, si_code: i32, in_table: bool) -> TrapKind
{
    let from_trap = si_code == SI_KERNEL;
    if in_table && (from_trap || !stepping) {
        TrapKind::Table
    } else if from_trap {
        TrapKind::Program
    } else if stepping {
        TrapKind::Step
    } else {
        TrapKind::Unknown
    }
}

fn to_pid(tid: ThreadId) -> Pid
{
    Pid::from_raw(tid.0 as i32)
}

fn lock(traps: &SharedTraps) -> Result<MutexGuard<'_, TrapTable>>
{
    traps.lock().map_err(|_| StepwiseError::internal("trap table lock poisoned"))
}

/// State shared by all threads of one traced process.
#[derive(Debug)]
struct ProcessShared
{
    pid: Pid,
    traps: SharedTraps,
    /// Address injected calls return to; a trap is placed there per call.
    call_return: Address,
    spawned: bool,
}

impl Drop for ProcessShared
{
    fn drop(&mut self)
    {
        if self.spawned {
            // Best effort: the process may already be gone.
            let _ = signal::kill(self.pid, Signal::SIGKILL);
        }
    }
}

/// Word-granular raw memory of a stopped thread.
struct ThreadMemory(Pid);

impl RawMemory for ThreadMemory
{
    fn read_raw(&self, address: Address, len: usize) -> Result<Vec<u8>>
    {
        let mut out = Vec::with_capacity(len);
        let end = address
            .checked_add(len as u64)
            .ok_or_else(|| StepwiseError::memory(address, "range wraps around"))?;
        let mut word_address = address.value() & !(WORD - 1);
        while word_address < end.value() {
            let word = ptrace::read(self.0, word_address as *mut c_void)
                .map_err(|errno| StepwiseError::memory(Address::new(word_address), errno.desc()))?;
            for (i, byte) in (word as u64).to_le_bytes().iter().enumerate() {
                let byte_address = word_address + i as u64;
                if byte_address >= address.value() && byte_address < end.value() {
                    out.push(*byte);
                }
            }
            word_address += WORD;
        }
        Ok(out)
    }

    fn write_raw(&mut self, address: Address, data: &[u8]) -> Result<()>
    {
        let mut offset = 0usize;
        while offset < data.len() {
            let target = address.value() + offset as u64;
            let word_address = target & !(WORD - 1);
            let skip = (target - word_address) as usize;
            let take = (WORD as usize - skip).min(data.len() - offset);

            let mut bytes = if skip == 0 && take == WORD as usize {
                [0u8; 8]
            } else {
                let current = ptrace::read(self.0, word_address as *mut c_void)
                    .map_err(|errno| StepwiseError::memory(Address::new(word_address), errno.desc()))?;
                (current as u64).to_le_bytes()
            };
            bytes[skip..skip + take].copy_from_slice(&data[offset..offset + take]);

            ptrace::write(self.0, word_address as *mut c_void, u64::from_le_bytes(bytes) as libc::c_long)
                .map_err(|errno| StepwiseError::memory(Address::new(word_address), errno.desc()))?;
            offset += take;
        }
        Ok(())
    }
}

fn user_regs_to_registers(regs: &libc::user_regs_struct) -> Registers
{
    Registers::from_values(&[
        regs.r15,
        regs.r14,
        regs.r13,
        regs.r12,
        regs.rbp,
        regs.rbx,
        regs.r11,
        regs.r10,
        regs.r9,
        regs.r8,
        regs.rax,
        regs.rcx,
        regs.rdx,
        regs.rsi,
        regs.rdi,
        regs.orig_rax,
        regs.rip,
        regs.cs,
        regs.eflags,
        regs.rsp,
        regs.ss,
        regs.fs_base,
        regs.gs_base,
        regs.ds,
        regs.es,
        regs.fs,
        regs.gs,
    ])
}

fn apply_registers(regs: &mut libc::user_regs_struct, registers: &Registers)
{
    let slots: [&mut u64; 27] = [
        &mut regs.r15,
        &mut regs.r14,
        &mut regs.r13,
        &mut regs.r12,
        &mut regs.rbp,
        &mut regs.rbx,
        &mut regs.r11,
        &mut regs.r10,
        &mut regs.r9,
        &mut regs.r8,
        &mut regs.rax,
        &mut regs.rcx,
        &mut regs.rdx,
        &mut regs.rsi,
        &mut regs.rdi,
        &mut regs.orig_rax,
        &mut regs.rip,
        &mut regs.cs,
        &mut regs.eflags,
        &mut regs.rsp,
        &mut regs.ss,
        &mut regs.fs_base,
        &mut regs.gs_base,
        &mut regs.ds,
        &mut regs.es,
        &mut regs.fs,
        &mut regs.gs,
    ];
    for (index, slot) in slots.into_iter().enumerate() {
        if let Some(value) = registers.get(index) {
            *slot = value;
        }
    }
}

/// Entry point of the program from `/proc/<pid>/auxv`.
fn read_entry_point(pid: Pid) -> Result<Address>
{
    let auxv = fs::read(format!("/proc/{pid}/auxv"))?;
    for pair in auxv.chunks_exact(16) {
        let mut key = [0u8; 8];
        let mut value = [0u8; 8];
        key.copy_from_slice(&pair[..8]);
        value.copy_from_slice(&pair[8..]);
        if u64::from_ne_bytes(key) == AT_ENTRY {
            return Ok(Address::new(u64::from_ne_bytes(value)));
        }
    }
    Err(StepwiseError::CannotStartTarget(format!("no entry point in auxv of {pid}")))
}

fn trace_options(pid: Pid) -> Result<()>
{
    ptrace::setoptions(pid, ptrace::Options::PTRACE_O_TRACECLONE | ptrace::Options::PTRACE_O_EXITKILL)?;
    Ok(())
}

/// A live thread under `ptrace`.
#[derive(Debug)]
pub struct PtraceInferior
{
    process: Arc<ProcessShared>,
    tid: Pid,
    state: TargetState,
    stepping: bool,
    sigstop_pending: bool,
    pending_signal: Option<Signal>,
    calls: Vec<InjectedCall>,
}

impl PtraceInferior
{
    fn with_process(process: Arc<ProcessShared>, tid: Pid, state: TargetState) -> Self
    {
        Self {
            process,
            tid,
            state,
            stepping: false,
            sigstop_pending: false,
            pending_signal: None,
            calls: Vec::new(),
        }
    }

    /// Spawn `launch` stopped at its first instruction.
    ///
    /// ## Errors
    ///
    /// `CannotStartTarget` if the program cannot be executed or does not
    /// stop under the tracer.
    #[allow(unsafe_code)] // Required for the pre-exec hook
    pub fn spawn(launch: &LaunchOptions, disable_aslr: bool) -> Result<(Self, PtraceEvents)>
    {
        let mut command = Command::new(&launch.program);
        command.args(&launch.args);
        command.envs(launch.env.iter().map(|(key, value)| (key, value)));
        if let Some(cwd) = &launch.cwd {
            command.current_dir(cwd);
        }

        // SAFETY: the closure runs between fork and exec and only issues
        // the personality and ptrace system calls.
        unsafe {
            command.pre_exec(move || {
                if disable_aslr {
                    let persona = personality::get().map_err(std::io::Error::from)?;
                    personality::set(persona | Persona::ADDR_NO_RANDOMIZE).map_err(std::io::Error::from)?;
                }
                ptrace::traceme().map_err(std::io::Error::from)
            });
        }

        let child = command.spawn().map_err(|error| {
            StepwiseError::CannotStartTarget(format!("{}: {error}", launch.program.display()))
        })?;
        let pid = Pid::from_raw(child.id() as i32);

        match waitpid(pid, Some(WaitPidFlag::__WALL))? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
            status => {
                return Err(StepwiseError::CannotStartTarget(format!(
                    "unexpected initial status {status:?}"
                )))
            }
        }
        trace_options(pid)?;

        let call_return = read_entry_point(pid)?;
        let process = Arc::new(ProcessShared {
            pid,
            traps: TrapTable::shared(X86_64::BREAKPOINT),
            call_return,
            spawned: true,
        });
        debug!(%pid, program = %launch.program.display(), aslr = !disable_aslr, "spawned target");

        Ok((Self::with_process(process, pid, TargetState::Stopped), PtraceEvents::new(pid)))
    }

    /// Attach to every thread of a running process. Returns the main
    /// thread, the other threads and the event source; all are stopped.
    ///
    /// ## Errors
    ///
    /// `CannotStartTarget` if the process does not exist or cannot be
    /// traced.
    pub fn attach(pid: ProcessId) -> Result<(Self, Vec<Self>, PtraceEvents)>
    {
        let pid = Pid::from_raw(pid.0 as i32);
        let tasks = fs::read_dir(format!("/proc/{pid}/task"))
            .map_err(|error| StepwiseError::CannotStartTarget(format!("process {pid}: {error}")))?;

        let mut tids = Vec::new();
        for entry in tasks {
            let entry = entry?;
            if let Some(tid) = entry.file_name().to_str().and_then(|name| name.parse::<i32>().ok()) {
                tids.push(Pid::from_raw(tid));
            }
        }
        tids.sort_by_key(|tid| (*tid != pid, tid.as_raw()));

        for tid in &tids {
            ptrace::attach(*tid).map_err(|errno| match errno {
                Errno::EPERM => StepwiseError::NoPermission(format!("cannot trace thread {tid}")),
                errno => StepwiseError::CannotStartTarget(format!("attach to {tid}: {errno}")),
            })?;
            loop {
                match waitpid(*tid, Some(WaitPidFlag::__WALL))? {
                    WaitStatus::Stopped(_, Signal::SIGSTOP) => break,
                    WaitStatus::Stopped(_, other) => {
                        trace!(%tid, signal = %other, "re-delivering signal during attach");
                        ptrace::cont(*tid, other)?;
                    }
                    WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                        return Err(StepwiseError::CannotStartTarget(format!("thread {tid} exited during attach")))
                    }
                    _ => {}
                }
            }
            trace_options(*tid)?;
        }

        let call_return = read_entry_point(pid)?;
        let process = Arc::new(ProcessShared {
            pid,
            traps: TrapTable::shared(X86_64::BREAKPOINT),
            call_return,
            spawned: false,
        });
        debug!(%pid, threads = tids.len(), "attached to process");

        let mut inferiors = tids
            .into_iter()
            .map(|tid| Self::with_process(Arc::clone(&process), tid, TargetState::Stopped));
        let main = inferiors
            .next()
            .ok_or_else(|| StepwiseError::CannotStartTarget(format!("process {pid} has no threads")))?;
        Ok((main, inferiors.collect(), PtraceEvents::new(pid)))
    }

    fn ensure_stopped(&self) -> Result<()>
    {
        match self.state {
            TargetState::Stopped => Ok(()),
            state if state.is_dead() => Err(StepwiseError::NoTarget),
            _ => Err(StepwiseError::NotStopped),
        }
    }

    fn memory(&self) -> ThreadMemory
    {
        ThreadMemory(self.tid)
    }

    fn raw_registers(&self) -> Result<libc::user_regs_struct>
    {
        Ok(ptrace::getregs(self.tid)?)
    }

    fn set_pc(&self, pc: Address) -> Result<()>
    {
        let mut regs = self.raw_registers()?;
        regs.rip = pc.value();
        ptrace::setregs(self.tid, regs)?;
        Ok(())
    }

    fn finish_call(&mut self, regs: &libc::user_regs_struct) -> Result<Option<ChildEvent>>
    {
        let Some(call) = self.calls.last() else {
            return Ok(None);
        };
        let returned_to = Address::new(regs.rip.wrapping_sub(1));
        if returned_to != call.return_address || Address::new(regs.rsp) != call.return_sp {
            return Ok(None);
        }
        let Some(call) = self.calls.pop() else {
            return Ok(None);
        };
        let (data1, data2) = (regs.rax, regs.rdx);
        self.set_registers(&call.saved)?;
        lock(&self.process.traps)?.remove(&mut self.memory(), call.trap)?;
        trace!(tid = %self.tid, callback = call.callback, data1, "injected call returned");
        Ok(Some(ChildEvent::Callback {
            id: call.callback,
            data1,
            data2,
        }))
    }

    fn interpret_trap(&mut self) -> Result<ChildEvent>
    {
        let regs = self.raw_registers()?;
        if let Some(event) = self.finish_call(&regs)? {
            return Ok(event);
        }

        let candidate = Address::new(regs.rip.wrapping_sub(1));
        let si_code = ptrace::getsiginfo(self.tid).map(|info| info.si_code).unwrap_or(0);
        let in_table = lock(&self.process.traps)?.is_installed(candidate);

        match classify_trap(self.stepping, si_code, in_table) {
            TrapKind::Table => {
                self.set_pc(candidate)?;
                Ok(ChildEvent::HitBreakpoint(Some(candidate)))
            }
            TrapKind::Program => {
                trace!(thread = %self.tid, pc = %candidate, stepping = self.stepping, "program trap");
                Ok(ChildEvent::HitBreakpoint(None))
            }
            TrapKind::Step => Ok(ChildEvent::Stopped(0)),
            TrapKind::Unknown => {
                let byte = self.memory().read_raw(candidate, 1)?;
                if byte.first() == Some(&X86_64::BREAKPOINT[0]) {
                    return Ok(ChildEvent::HitBreakpoint(None));
                }
                Ok(ChildEvent::Stopped(SIGTRAP))
            }
        }
    }
}

impl MemoryAccess for PtraceInferior
{
    fn read_bytes(&self, address: Address, len: usize) -> Result<Vec<u8>>
    {
        self.ensure_stopped()?;
        let mut bytes = self.memory().read_raw(address, len)?;
        lock(&self.process.traps)?.shadow(address, &mut bytes);
        Ok(bytes)
    }
}

impl Inferior for PtraceInferior
{
    fn pid(&self) -> ProcessId
    {
        ProcessId(self.process.pid.as_raw() as u32)
    }

    fn tid(&self) -> ThreadId
    {
        ThreadId(self.tid.as_raw() as u64)
    }

    fn state(&self) -> TargetState
    {
        self.state
    }

    fn resume(&mut self) -> Result<()>
    {
        self.ensure_stopped()?;
        ptrace::cont(self.tid, self.pending_signal.take())?;
        self.stepping = false;
        self.state = TargetState::Running;
        Ok(())
    }

    fn single_step(&mut self) -> Result<()>
    {
        self.ensure_stopped()?;
        ptrace::step(self.tid, self.pending_signal.take())?;
        self.stepping = true;
        self.state = TargetState::Running;
        Ok(())
    }

    #[allow(unsafe_code)] // Required for tgkill
    fn stop(&mut self) -> Result<bool>
    {
        if self.state != TargetState::Running {
            return Ok(false);
        }
        if self.sigstop_pending {
            return Ok(true);
        }
        // SAFETY: tgkill only takes integer arguments.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_tgkill,
                self.process.pid.as_raw(),
                self.tid.as_raw(),
                SIGSTOP,
            )
        };
        Errno::result(rc)?;
        self.sigstop_pending = true;
        Ok(true)
    }

    fn kill(&mut self) -> Result<()>
    {
        signal::kill(self.process.pid, Signal::SIGKILL)?;
        Ok(())
    }

    fn terminate(&mut self) -> Result<()>
    {
        signal::kill(self.process.pid, Signal::SIGTERM)?;
        Ok(())
    }

    fn detach(&mut self) -> Result<()>
    {
        self.ensure_stopped()?;
        lock(&self.process.traps)?.clear(&mut self.memory())?;
        ptrace::detach(self.tid, self.pending_signal.take())?;
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
            RawStatus::Signaled(sig) => {
                self.state = TargetState::Signaled(sig);
                return Ok(ChildEvent::Signaled(sig));
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
            RawStatus::Stopped(sig) => {
                self.state = TargetState::Stopped;
                self.pending_signal = Signal::try_from(sig).ok();
                ChildEvent::Stopped(sig)
            }
        };
        self.stepping = false;
        trace!(tid = %self.tid, ?event, "interpreted stop");
        Ok(event)
    }

    fn registers(&self) -> Result<Registers>
    {
        self.ensure_stopped()?;
        Ok(user_regs_to_registers(&self.raw_registers()?))
    }

    fn set_registers(&mut self, registers: &Registers) -> Result<()>
    {
        self.ensure_stopped()?;
        let mut regs = self.raw_registers()?;
        apply_registers(&mut regs, registers);
        ptrace::setregs(self.tid, regs)?;
        Ok(())
    }

    fn write_memory(&mut self, address: Address, data: &[u8]) -> Result<()>
    {
        self.ensure_stopped()?;
        let mut bytes = data.to_vec();
        lock(&self.process.traps)?.shadow_write(address, &mut bytes);
        self.memory().write_raw(address, &bytes)
    }

    fn insert_breakpoint(&mut self, address: Address) -> Result<TrapId>
    {
        self.ensure_stopped()?;
        lock(&self.process.traps)?.insert(&mut self.memory(), address)
    }

    fn remove_breakpoint(&mut self, id: TrapId) -> Result<()>
    {
        self.ensure_stopped()?;
        lock(&self.process.traps)?.remove(&mut self.memory(), id)
    }

    fn enable_breakpoint(&mut self, id: TrapId) -> Result<()>
    {
        self.ensure_stopped()?;
        lock(&self.process.traps)?.set_enabled(&mut self.memory(), id, true)
    }

    fn disable_breakpoint(&mut self, id: TrapId) -> Result<()>
    {
        self.ensure_stopped()?;
        lock(&self.process.traps)?.set_enabled(&mut self.memory(), id, false)
    }

    fn suspend_breakpoints_at(&mut self, address: Address, suspended: bool) -> Result<()>
    {
        self.ensure_stopped()?;
        lock(&self.process.traps)?.suspend(&mut self.memory(), address, suspended)
    }

    fn has_breakpoint_at(&self, address: Address) -> bool
    {
        self.process
            .traps
            .lock()
            .map(|traps| traps.is_installed(address))
            .unwrap_or(false)
    }

    fn call_function(&mut self, function: Address, args: &[CallArgument], callback: u64) -> Result<()>
    {
        self.ensure_stopped()?;
        let saved = self.registers()?;
        let return_address = self.process.call_return;
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
        debug!(tid = %self.tid, %function, callback, "injected call prepared");
        Ok(())
    }

    fn new_thread(&self, tid: ThreadId) -> Result<Box<dyn Inferior>>
    {
        let mut thread = Self::with_process(Arc::clone(&self.process), to_pid(tid), TargetState::Running);
        // A cloned thread starts with a SIGSTOP queued by the kernel.
        thread.sigstop_pending = true;
        Ok(Box::new(thread))
    }

    fn memory_maps(&self) -> Result<Vec<MemoryRegion>>
    {
        let maps = fs::read_to_string(format!("/proc/{}/maps", self.process.pid))?;
        Ok(maps.lines().filter_map(MemoryRegion::parse_maps_line).collect())
    }
}

/// `waitpid` over all threads of a process.
#[derive(Debug)]
pub struct PtraceEvents
{
    pid: Pid,
}

impl PtraceEvents
{
    fn new(pid: Pid) -> Self
    {
        Self { pid }
    }

    fn translate(status: WaitStatus) -> Result<Option<RawEvent>>
    {
        let (pid, status) = match status {
            WaitStatus::Exited(pid, code) => (pid, RawStatus::Exited(code)),
            WaitStatus::Signaled(pid, sig, _) => (pid, RawStatus::Signaled(sig as i32)),
            WaitStatus::Stopped(pid, sig) => (pid, RawStatus::Stopped(sig as i32)),
            WaitStatus::PtraceEvent(pid, _, event) if event == libc::PTRACE_EVENT_CLONE => {
                let new_tid = ptrace::getevent(pid)?;
                (pid, RawStatus::Cloned(ThreadId(new_tid as u64)))
            }
            WaitStatus::PtraceEvent(pid, _, _) | WaitStatus::PtraceSyscall(pid) => (pid, RawStatus::Stopped(SIGTRAP)),
            WaitStatus::Continued(_) | WaitStatus::StillAlive => return Ok(None),
        };
        Ok(Some(RawEvent {
            tid: ThreadId(pid.as_raw() as u64),
            status,
        }))
    }

    fn wait_once(target: Option<Pid>, nohang: bool) -> Result<Option<WaitStatus>>
    {
        let mut flags = WaitPidFlag::__WALL;
        if nohang {
            flags |= WaitPidFlag::WNOHANG;
        }
        loop {
            match waitpid(target, Some(flags)) {
                Ok(WaitStatus::StillAlive) => return Ok(None),
                Ok(status) => return Ok(Some(status)),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Err(StepwiseError::NoTarget),
                Err(errno) => return Err(errno.into()),
            }
        }
    }
}

impl EventSource for PtraceEvents
{
    fn wait(&mut self, thread: Option<ThreadId>, timeout: Option<Duration>) -> Result<Option<RawEvent>>
    {
        let target = thread.map(to_pid);
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let status = Self::wait_once(target, deadline.is_some())?;
            if let Some(status) = status {
                if let Some(event) = Self::translate(status)? {
                    trace!(pid = %self.pid, ?event, "wait event");
                    return Ok(Some(event));
                }
                continue;
            }
            let Some(deadline) = deadline else {
                warn!(pid = %self.pid, "blocking wait returned without a status");
                continue;
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(POLL_SLICE.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    /// `si_code` of a trap raised by the trap flag.
    const TRAP_TRACE: i32 = 2;

    #[test]
    fn test_table_trap_wins()
    {
        assert_eq!(classify_trap(false, SI_KERNEL, true), TrapKind::Table);
        assert_eq!(classify_trap(true, SI_KERNEL, true), TrapKind::Table);
        assert_eq!(classify_trap(false, 0, true), TrapKind::Table);
    }

    #[test]
    fn test_program_trap_while_stepping()
    {
        // Stepping onto an int3 of the program reports it, not a step.
        assert_eq!(classify_trap(true, SI_KERNEL, false), TrapKind::Program);
        assert_eq!(classify_trap(false, SI_KERNEL, false), TrapKind::Program);
    }

    #[test]
    fn test_step_completion()
    {
        assert_eq!(classify_trap(true, TRAP_TRACE, false), TrapKind::Step);
        // A step that lands just past a table entry did not execute it.
        assert_eq!(classify_trap(true, TRAP_TRACE, true), TrapKind::Step);
        assert_eq!(classify_trap(false, TRAP_TRACE, false), TrapKind::Unknown);
    }
}
