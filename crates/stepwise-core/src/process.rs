//! # Process and thread handles
//!
//! The public face of the debugger. A [`Process`] owns the event loop of
//! one target; a [`Thread`] is a cheap, cloneable handle on one of its
//! threads. Every method may be called from any client thread.
//!
//! ## Blocking and non-blocking commands
//!
//! Inspection and breakpoint calls block until the event loop has answered.
//! Stepping commands return a [`Completion`] as soon as the thread is
//! running: call [`Completion::wait`] to block until the operation
//! finishes, or poll [`Completion::try_result`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use stepwise_core::config::{DebuggerOptions, LaunchOptions};
//! use stepwise_core::process::Process;
//!
//! # fn main() -> stepwise_core::error::Result<()> {
//! let process = Process::launch(&LaunchOptions::new("/bin/true"), DebuggerOptions::default())?;
//! let thread = process.main_thread()?;
//! let event = thread.step_instruction()?.wait()?;
//! println!("{}", event.describe());
//! process.kill()?;
//! # Ok(())
//! # }
//! ```

use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::arch::{ArchKind, Architecture};
use crate::breakpoints::{BreakpointBuilder, BreakpointHandle};
use crate::config::{DebuggerOptions, LaunchOptions};
use crate::disasm::{Disassembler, IcedDisassembler};
use crate::engine::{
    CallMethodData, EngineContext, EngineId, EngineShared, Operation, OperationKind, OperationResult, RuntimeInvokeData,
};
use crate::error::{Result, StepwiseError};
use crate::events::{event_channel, TargetEvent, TargetEventReceiver};
use crate::inferior::{EventSource, Inferior, SnapshotEvents, SnapshotInferior};
use crate::manager::ThreadManager;
use crate::symbols::{ElfSymbolProvider, FileSystem, SourceFiles, SymbolTable, TrampolineResolver};
use crate::types::{Address, Backtrace, MemoryRegion, ProcessId, Registers, StackFrame, TargetState, ThreadId};

// -------------------------------------------------------------------------
// Completion
// -------------------------------------------------------------------------

/// Pending result of an asynchronous operation.
///
/// The result can be taken once: after [`Completion::try_result`] returned
/// `Some`, later calls report `NoTarget`.
#[derive(Debug)]
pub struct Completion<T>
{
    receiver: Receiver<Result<OperationResult>>,
    extract: fn(OperationResult) -> Result<T>,
    _result: PhantomData<fn() -> T>,
}

impl<T> Completion<T>
{
    fn new(receiver: Receiver<Result<OperationResult>>, extract: fn(OperationResult) -> Result<T>) -> Self
    {
        Self {
            receiver,
            extract,
            _result: PhantomData,
        }
    }

    /// Block until the operation finishes.
    ///
    /// ## Errors
    ///
    /// The error the operation failed with; `NoTarget` if the process went
    /// away before the operation reported.
    pub fn wait(self) -> Result<T>
    {
        let result = self.receiver.recv().map_err(|_| StepwiseError::NoTarget)??;
        (self.extract)(result)
    }

    /// Block for at most `timeout`. `Ok(None)` if the operation is still
    /// running.
    ///
    /// ## Errors
    ///
    /// As [`Completion::wait`].
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<T>>
    {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => result.and_then(self.extract).map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(StepwiseError::NoTarget),
        }
    }

    /// The result, if the operation has finished.
    pub fn try_result(&self) -> Option<Result<T>>
    {
        match self.receiver.try_recv() {
            Ok(result) => Some(result.and_then(self.extract)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(StepwiseError::NoTarget)),
        }
    }
}

fn into_event(result: OperationResult) -> Result<TargetEvent>
{
    match result {
        OperationResult::Event(event) => Ok(event),
        other => Err(StepwiseError::internal(format!("stepping operation produced {other:?}"))),
    }
}

#[allow(clippy::unnecessary_wraps)]
fn into_result(result: OperationResult) -> Result<OperationResult>
{
    Ok(result)
}

// -------------------------------------------------------------------------
// Process
// -------------------------------------------------------------------------

/// Configures the collaborators of a [`Process`] before starting it.
#[derive(Debug)]
pub struct ProcessBuilder
{
    options: DebuggerOptions,
    symbols: Arc<SymbolTable>,
    sources: Arc<dyn SourceFiles>,
    disassembler: Arc<dyn Disassembler>,
    arch: Option<Arc<dyn Architecture>>,
    resolver: Option<Arc<dyn TrampolineResolver>>,
    load_symbols: bool,
}

impl ProcessBuilder
{
    /// Builder with the host architecture, the `iced-x86` disassembler and
    /// an empty symbol table.
    #[must_use]
    pub fn new(options: DebuggerOptions) -> Self
    {
        Self {
            options,
            symbols: SymbolTable::new(),
            sources: Arc::new(FileSystem),
            disassembler: Arc::new(IcedDisassembler),
            arch: None,
            resolver: None,
            load_symbols: true,
        }
    }

    /// Use `symbols` instead of an empty table.
    #[must_use]
    pub fn symbols(mut self, symbols: Arc<SymbolTable>) -> Self
    {
        self.symbols = symbols;
        self
    }

    /// Where source files are checked for existence.
    #[must_use]
    pub fn sources(mut self, sources: Arc<dyn SourceFiles>) -> Self
    {
        self.sources = sources;
        self
    }

    /// Instruction decoder.
    #[must_use]
    pub fn disassembler(mut self, disassembler: Arc<dyn Disassembler>) -> Self
    {
        self.disassembler = disassembler;
        self
    }

    /// Override the host architecture.
    #[must_use]
    pub fn architecture(mut self, arch: Arc<dyn Architecture>) -> Self
    {
        self.arch = Some(arch);
        self
    }

    /// Trampoline resolver of a managed runtime in the target.
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn TrampolineResolver>) -> Self
    {
        self.resolver = Some(resolver);
        self
    }

    /// Skip reading the executable's ELF symbols after start-up.
    #[must_use]
    pub fn without_elf_symbols(mut self) -> Self
    {
        self.load_symbols = false;
        self
    }

    fn context(&self) -> Result<EngineContext>
    {
        let arch = match &self.arch {
            Some(arch) => Arc::clone(arch),
            None => ArchKind::host()
                .ok_or_else(|| StepwiseError::CannotStartTarget("unsupported host architecture".to_string()))?
                .backend(),
        };
        Ok(EngineContext {
            arch,
            symbols: Arc::clone(&self.symbols),
            sources: Arc::clone(&self.sources),
            disassembler: Arc::clone(&self.disassembler),
            resolver: self.resolver.clone(),
            options: self.options.clone(),
        })
    }

    /// Start the event loop over a custom target. `factory` runs on the
    /// event-loop thread and creates the inferiors and their event source.
    ///
    /// ## Errors
    ///
    /// Whatever `factory` fails with; `CannotStartTarget` if it produced
    /// no threads.
    pub fn start<F>(self, factory: F) -> Result<Process>
    where
        F: FnOnce() -> Result<(Vec<Box<dyn Inferior>>, Box<dyn EventSource>)> + Send + 'static,
    {
        let context = self.context()?;
        let manager = ThreadManager::start(Box::new(factory), context)?;
        Ok(Process {
            manager: Arc::new(manager),
            symbols: self.symbols,
        })
    }

    /// Spawn `launch` under the tracer, stopped before its first
    /// instruction.
    ///
    /// ## Errors
    ///
    /// `CannotStartTarget` if the program cannot be executed.
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    pub fn launch(self, launch: &LaunchOptions) -> Result<Process>
    {
        use crate::inferior::PtraceInferior;

        let spawn = launch.clone();
        let disable_aslr = self.options.disable_aslr;
        let load_symbols = self.load_symbols;
        let process = self.start(move || {
            let (inferior, events) = PtraceInferior::spawn(&spawn, disable_aslr)?;
            Ok((vec![Box::new(inferior) as Box<dyn Inferior>], Box::new(events) as Box<dyn EventSource>))
        })?;
        info!(pid = %process.pid(), program = %launch.program.display(), "launched");
        if load_symbols {
            process.load_elf_symbols(launch.program.clone());
        }
        Ok(process)
    }

    /// Attach to every thread of the running process `pid`.
    ///
    /// ## Errors
    ///
    /// `CannotStartTarget` or `NoPermission` if the process cannot be
    /// traced.
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    pub fn attach(self, pid: ProcessId) -> Result<Process>
    {
        use crate::inferior::PtraceInferior;

        let load_symbols = self.load_symbols;
        let process = self.start(move || {
            let (main, others, events) = PtraceInferior::attach(pid)?;
            let mut inferiors: Vec<Box<dyn Inferior>> = vec![Box::new(main)];
            inferiors.extend(others.into_iter().map(|inferior| Box::new(inferior) as Box<dyn Inferior>));
            Ok((inferiors, Box::new(events) as Box<dyn EventSource>))
        })?;
        info!(%pid, threads = process.threads().len(), "attached");
        if load_symbols {
            process.load_elf_symbols(PathBuf::from(format!("/proc/{pid}/exe")));
        }
        Ok(process)
    }

    /// Open a read-only snapshot.
    ///
    /// ## Errors
    ///
    /// `CannotStartTarget` if `threads` is empty.
    pub fn snapshot(self, threads: Vec<SnapshotInferior>) -> Result<Process>
    {
        self.start(move || {
            let inferiors = threads
                .into_iter()
                .map(|inferior| Box::new(inferior) as Box<dyn Inferior>)
                .collect();
            Ok((inferiors, Box::new(SnapshotEvents) as Box<dyn EventSource>))
        })
    }
}

/// A debugged process.
#[derive(Debug)]
pub struct Process
{
    manager: Arc<ThreadManager>,
    symbols: Arc<SymbolTable>,
}

impl Process
{
    /// Spawn `launch` with the default collaborators.
    ///
    /// ## Errors
    ///
    /// See [`ProcessBuilder::launch`].
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    pub fn launch(launch: &LaunchOptions, options: DebuggerOptions) -> Result<Self>
    {
        ProcessBuilder::new(options).launch(launch)
    }

    /// Attach to `pid` with the default collaborators.
    ///
    /// ## Errors
    ///
    /// See [`ProcessBuilder::attach`].
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    pub fn attach(pid: ProcessId, options: DebuggerOptions) -> Result<Self>
    {
        ProcessBuilder::new(options).attach(pid)
    }

    /// Open a read-only snapshot with the default collaborators.
    ///
    /// ## Errors
    ///
    /// See [`ProcessBuilder::snapshot`].
    pub fn snapshot(threads: Vec<SnapshotInferior>, options: DebuggerOptions) -> Result<Self>
    {
        ProcessBuilder::new(options).snapshot(threads)
    }

    fn load_elf_symbols(&self, path: PathBuf)
    {
        let regions = match self.memory_maps() {
            Ok(regions) => regions,
            Err(e) => {
                warn!(error = %e, "cannot read memory map, symbols not loaded");
                return;
            }
        };
        match ElfSymbolProvider::for_process(&path, &regions) {
            Ok(provider) => {
                debug!(path = %path.display(), bias = provider.bias(), "loaded ELF symbols");
                self.symbols.add_provider(Arc::new(provider));
            }
            Err(e) => warn!(path = %path.display(), error = %e, "cannot load ELF symbols"),
        }
    }

    /// Process id.
    #[must_use]
    pub fn pid(&self) -> ProcessId
    {
        self.manager.pid()
    }

    /// Symbol table shared by every thread.
    #[must_use]
    pub fn symbols(&self) -> &Arc<SymbolTable>
    {
        &self.symbols
    }

    /// Every thread seen so far, dead ones included, in creation order.
    #[must_use]
    pub fn threads(&self) -> Vec<Thread>
    {
        self.manager
            .registry()
            .all()
            .into_iter()
            .map(|(id, shared)| Thread::new(id, shared, Arc::clone(&self.manager)))
            .collect()
    }

    /// The thread the process was started or attached through.
    ///
    /// ## Errors
    ///
    /// `NoTarget` if the process has no threads.
    pub fn main_thread(&self) -> Result<Thread>
    {
        let id = EngineId(0);
        let shared = self.manager.registry().get(id)?;
        Ok(Thread::new(id, shared, Arc::clone(&self.manager)))
    }

    /// Handle on thread `tid`.
    #[must_use]
    pub fn thread(&self, tid: ThreadId) -> Option<Thread>
    {
        let registry = self.manager.registry();
        let id = registry.find(tid)?;
        let shared = registry.get(id).ok()?;
        Some(Thread::new(id, shared, Arc::clone(&self.manager)))
    }

    /// Receive every [`TargetEvent`] from now on.
    ///
    /// ## Errors
    ///
    /// `NoTarget` if the event loop has stopped.
    pub fn subscribe(&self) -> Result<TargetEventReceiver>
    {
        let (sender, receiver) = event_channel();
        self.manager.execute(move |event_loop| {
            event_loop.subscribe(sender);
            Ok(())
        })?;
        Ok(receiver)
    }

    /// Memory map of the target.
    ///
    /// ## Errors
    ///
    /// `NoTarget` once every thread is gone.
    pub fn memory_maps(&self) -> Result<Vec<MemoryRegion>>
    {
        for thread in self.threads() {
            match thread.memory_maps() {
                Err(StepwiseError::NoTarget) => continue,
                result => return result,
            }
        }
        Err(StepwiseError::NoTarget)
    }

    /// Kill the target with `SIGKILL`. Each live thread reports one
    /// `TargetExited` event; later calls on the threads fail with
    /// `NoTarget`.
    ///
    /// ## Errors
    ///
    /// Whatever the kill system call reports.
    pub fn kill(&self) -> Result<()>
    {
        self.manager.execute(|event_loop| event_loop.kill())
    }

    /// Ask the target to terminate with `SIGTERM` and wait for it to exit,
    /// killing it after a grace period.
    ///
    /// ## Errors
    ///
    /// Whatever the signal delivery reports.
    pub fn shutdown(&self) -> Result<()>
    {
        self.manager.execute(|event_loop| event_loop.shutdown())
    }

    /// Remove every breakpoint and let the target run on untraced.
    ///
    /// ## Errors
    ///
    /// `NoTarget` if nothing is attached.
    pub fn detach(&self) -> Result<()>
    {
        self.manager.execute(|event_loop| event_loop.detach())
    }

    /// Stop every thread until the returned guard is dropped.
    ///
    /// Operations already in flight are paused and resume afterwards; new
    /// stepping commands fail with `AlreadyRunning` while the lock is held.
    ///
    /// ## Errors
    ///
    /// `AlreadyRunning` if this process's lock is already held by a client.
    pub fn acquire_global_lock(&self) -> Result<GlobalLockGuard>
    {
        self.manager.acquire_global_lock()?;
        Ok(GlobalLockGuard {
            manager: Some(Arc::clone(&self.manager)),
        })
    }
}

/// Held global thread lock; released on drop.
#[derive(Debug)]
#[must_use = "the lock is released when the guard is dropped"]
pub struct GlobalLockGuard
{
    manager: Option<Arc<ThreadManager>>,
}

impl GlobalLockGuard
{
    /// Release the lock now, reporting failures.
    ///
    /// ## Errors
    ///
    /// `NoTarget` if the process went away.
    pub fn release(mut self) -> Result<()>
    {
        match self.manager.take() {
            Some(manager) => manager.release_global_lock(),
            None => Ok(()),
        }
    }
}

impl Drop for GlobalLockGuard
{
    fn drop(&mut self)
    {
        if let Some(manager) = self.manager.take() {
            if let Err(e) = manager.release_global_lock() {
                warn!(error = %e, "cannot release global thread lock");
            }
        }
    }
}

// -------------------------------------------------------------------------
// Thread
// -------------------------------------------------------------------------

/// Handle on one thread of a [`Process`].
#[derive(Debug, Clone)]
pub struct Thread
{
    id: EngineId,
    shared: Arc<EngineShared>,
    manager: Arc<ThreadManager>,
}

impl Thread
{
    fn new(id: EngineId, shared: Arc<EngineShared>, manager: Arc<ThreadManager>) -> Self
    {
        Self { id, shared, manager }
    }

    /// OS thread id.
    #[must_use]
    pub fn tid(&self) -> ThreadId
    {
        self.shared.tid()
    }

    /// Execution state as of the last event.
    #[must_use]
    pub fn state(&self) -> TargetState
    {
        self.shared.state()
    }

    /// `true` while an operation is in flight.
    #[must_use]
    pub fn is_running(&self) -> bool
    {
        self.shared.is_busy()
    }

    /// Start `operation`.
    ///
    /// ## Errors
    ///
    /// - `NotStopped` if another operation is in flight on this thread.
    /// - `AlreadyRunning` while the global thread lock is held.
    /// - `NoTarget` once the thread has exited.
    pub fn start(&self, operation: Operation) -> Result<Completion<TargetEvent>>
    {
        debug!(thread = %self.tid(), %operation, "starting operation");
        let receiver = self.manager.start_operation(self.id, operation)?;
        Ok(Completion::new(receiver, into_event))
    }

    fn start_kind(&self, kind: OperationKind) -> Result<Completion<TargetEvent>>
    {
        self.start(Operation::new(kind))
    }

    /// One instruction, following runtime trampolines into their target.
    ///
    /// ## Errors
    ///
    /// See [`Thread::start`].
    pub fn step_instruction(&self) -> Result<Completion<TargetEvent>>
    {
        self.start_kind(OperationKind::StepInstruction)
    }

    /// Exactly one machine instruction.
    ///
    /// ## Errors
    ///
    /// See [`Thread::start`].
    pub fn step_native_instruction(&self) -> Result<Completion<TargetEvent>>
    {
        self.start_kind(OperationKind::StepNativeInstruction)
    }

    /// One instruction, stepping over calls.
    ///
    /// ## Errors
    ///
    /// See [`Thread::start`].
    pub fn next_instruction(&self) -> Result<Completion<TargetEvent>>
    {
        self.start_kind(OperationKind::NextInstruction)
    }

    /// To the next source line, entering calls that have source.
    ///
    /// ## Errors
    ///
    /// See [`Thread::start`].
    pub fn step_line(&self) -> Result<Completion<TargetEvent>>
    {
        self.start_kind(OperationKind::StepLine)
    }

    /// To the next source line, stepping over calls.
    ///
    /// ## Errors
    ///
    /// See [`Thread::start`].
    pub fn next_line(&self) -> Result<Completion<TargetEvent>>
    {
        self.start_kind(OperationKind::NextLine)
    }

    /// Until the current method returns to its caller.
    ///
    /// ## Errors
    ///
    /// See [`Thread::start`]; the completion fails with `NoMethod` outside
    /// a known method.
    pub fn finish(&self) -> Result<Completion<TargetEvent>>
    {
        self.start_kind(OperationKind::Finish)
    }

    /// Resume until a breakpoint, a signal or exit.
    ///
    /// ## Errors
    ///
    /// See [`Thread::start`].
    pub fn continue_execution(&self) -> Result<Completion<TargetEvent>>
    {
        self.start(Operation::run(None))
    }

    /// Resume until `address` is reached.
    ///
    /// ## Errors
    ///
    /// See [`Thread::start`].
    pub fn run_until(&self, address: Address) -> Result<Completion<TargetEvent>>
    {
        self.start(Operation::run(Some(address)))
    }

    /// Resume without anybody waiting; the outcome is only published as an
    /// event.
    ///
    /// ## Errors
    ///
    /// See [`Thread::start`].
    pub fn run_in_background(&self) -> Result<()>
    {
        self.start_kind(OperationKind::RunInBackground { until: None })
            .map(drop)
    }

    /// Call a function in the target on this thread.
    ///
    /// ## Errors
    ///
    /// See [`Thread::start`].
    pub fn call_method(&self, data: CallMethodData) -> Result<Completion<OperationResult>>
    {
        let receiver = self
            .manager
            .start_operation(self.id, Operation::new(OperationKind::CallMethod(data)))?;
        Ok(Completion::new(receiver, into_result))
    }

    /// Invoke a managed method through its runtime, compiling it first if
    /// the runtime requires it.
    ///
    /// ## Errors
    ///
    /// See [`Thread::start`]; the completion fails with `InvalidArgument`
    /// if the runtime has no invoke entry point.
    pub fn runtime_invoke(&self, data: RuntimeInvokeData) -> Result<Completion<OperationResult>>
    {
        let receiver = self
            .manager
            .start_operation(self.id, Operation::new(OperationKind::RuntimeInvoke(data)))?;
        Ok(Completion::new(receiver, into_result))
    }

    /// Request a stop. Returns `false` if the thread was not running.
    /// The pending operation completes with `TargetStopped`.
    ///
    /// ## Errors
    ///
    /// `NoTarget` once the thread has exited.
    pub fn stop(&self) -> Result<bool>
    {
        self.manager.stop(self.id)
    }

    /// Stop the thread and wait until its operation has completed.
    ///
    /// ## Errors
    ///
    /// As [`Thread::stop`].
    pub fn interrupt(&self) -> Result<bool>
    {
        let stopped = self.stop()?;
        if stopped {
            let _ = self.wait(None);
        }
        Ok(stopped)
    }

    /// Block until no operation is in flight on this thread, for at most
    /// `timeout`. Returns `true` if the thread is idle.
    #[must_use = "a `false` result means the thread is still running"]
    pub fn wait(&self, timeout: Option<Duration>) -> bool
    {
        self.shared.wait_idle(timeout)
    }

    /// Kill the whole process.
    ///
    /// ## Errors
    ///
    /// See [`Process::kill`].
    pub fn kill(&self) -> Result<()>
    {
        self.manager.execute(|event_loop| event_loop.kill())
    }

    // ---------------------------------------------------------------------
    // Breakpoints
    // ---------------------------------------------------------------------

    /// Install a breakpoint through this thread. Breakpoints are process
    /// wide; the thread only has to be stopped.
    ///
    /// ## Errors
    ///
    /// `NotStopped` while the thread runs; `TargetMemoryError` if the
    /// address is not writable.
    pub fn insert_breakpoint(&self, builder: BreakpointBuilder) -> Result<BreakpointHandle>
    {
        self.manager
            .with_engine(self.id, move |engine, host| engine.insert_breakpoint(host, builder))
    }

    /// Remove a breakpoint.
    ///
    /// ## Errors
    ///
    /// `NoSuchBreakpoint` for an unknown handle.
    pub fn remove_breakpoint(&self, handle: BreakpointHandle) -> Result<()>
    {
        self.manager
            .with_engine(self.id, move |engine, host| engine.remove_breakpoint(host, handle))
    }

    /// Re-enable a disabled breakpoint.
    ///
    /// ## Errors
    ///
    /// `NoSuchBreakpoint` for an unknown handle.
    pub fn enable_breakpoint(&self, handle: BreakpointHandle) -> Result<()>
    {
        self.manager
            .with_engine(self.id, move |engine, host| engine.set_breakpoint_enabled(host, handle, true))
    }

    /// Disable a breakpoint without forgetting it.
    ///
    /// ## Errors
    ///
    /// `NoSuchBreakpoint` for an unknown handle.
    pub fn disable_breakpoint(&self, handle: BreakpointHandle) -> Result<()>
    {
        self.manager
            .with_engine(self.id, move |engine, host| engine.set_breakpoint_enabled(host, handle, false))
    }

    /// Enable every breakpoint tagged `group`. Returns how many changed.
    ///
    /// ## Errors
    ///
    /// `NotStopped` while the thread runs.
    pub fn enable_group(&self, group: &str) -> Result<usize>
    {
        let group = group.to_string();
        self.manager
            .with_engine(self.id, move |engine, host| engine.set_group_enabled(host, &group, true))
    }

    /// Disable every breakpoint tagged `group`. Returns how many changed.
    ///
    /// ## Errors
    ///
    /// `NotStopped` while the thread runs.
    pub fn disable_group(&self, group: &str) -> Result<usize>
    {
        let group = group.to_string();
        self.manager
            .with_engine(self.id, move |engine, host| engine.set_group_enabled(host, &group, false))
    }

    // ---------------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------------

    /// Innermost stack frame.
    ///
    /// ## Errors
    ///
    /// `NotStopped` while the thread runs; `NoTarget` after it exited.
    pub fn current_frame(&self) -> Result<StackFrame>
    {
        self.manager.with_engine(self.id, |engine, _| engine.compute_frame())
    }

    /// Up to `max` frames, innermost first.
    ///
    /// ## Errors
    ///
    /// As [`Thread::current_frame`].
    pub fn get_backtrace(&self, max: usize) -> Result<Backtrace>
    {
        self.manager.with_engine(self.id, move |engine, _| engine.backtrace(max))
    }

    /// Register file.
    ///
    /// ## Errors
    ///
    /// As [`Thread::current_frame`].
    pub fn get_registers(&self) -> Result<Registers>
    {
        self.manager.with_engine(self.id, |engine, _| engine.registers())
    }

    /// Write the valid registers of `registers` back. Publishes
    /// `FrameChanged`.
    ///
    /// ## Errors
    ///
    /// As [`Thread::current_frame`]; `NoPermission` on a snapshot.
    pub fn set_registers(&self, registers: Registers) -> Result<()>
    {
        self.manager
            .with_engine(self.id, move |engine, host| engine.set_registers(host, &registers))
    }

    /// Read `len` bytes at `address`. Installed traps are hidden.
    ///
    /// ## Errors
    ///
    /// `TargetMemoryError` for unmapped memory.
    pub fn read_memory(&self, address: Address, len: usize) -> Result<Vec<u8>>
    {
        self.manager
            .with_engine(self.id, move |engine, _| engine.read_memory(address, len))
    }

    /// Write `data` at `address`.
    ///
    /// ## Errors
    ///
    /// `TargetMemoryError` for unmapped memory; `NoPermission` on a
    /// snapshot.
    pub fn write_memory(&self, address: Address, data: &[u8]) -> Result<()>
    {
        let data = data.to_vec();
        self.manager
            .with_engine(self.id, move |engine, _| engine.write_memory(address, &data))
    }

    /// Encoded length of the instruction at `address`.
    ///
    /// ## Errors
    ///
    /// `InternalError` if the bytes do not decode.
    pub fn instruction_size(&self, address: Address) -> Result<usize>
    {
        self.manager
            .with_engine(self.id, move |engine, _| engine.instruction_size(address))
    }

    /// Memory map of the process, read through this thread.
    ///
    /// ## Errors
    ///
    /// `NoTarget` after the thread exited.
    pub fn memory_maps(&self) -> Result<Vec<MemoryRegion>>
    {
        self.manager.with_engine(self.id, |engine, _| engine.memory_maps())
    }
}
