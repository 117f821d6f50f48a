//! # Stepping engine
//!
//! One [`SteppingEngine`] per traced thread. The engine turns a high-level
//! [`Operation`] into a sequence of atomic resumes (single step or continue)
//! and decides after every stop whether the operation is finished.
//!
//! ## Event flow
//!
//! Engines never wait on the OS themselves. The event loop routes each raw
//! wait event to the owning engine's inferior for interpretation and then
//! hands the resulting [`ChildEvent`] to [`SteppingEngine::process_event`].
//! Everything that reaches beyond one thread (the breakpoint table, the
//! global thread lock, event subscribers, adopting new threads) goes through
//! the [`EngineHost`] passed into every call.
//!
//! ## Stepping rules
//!
//! - A stop inside the step frame leads to another atomic step; leaving the
//!   frame finishes the operation.
//! - Calls are stepped into only when the frame's mode allows it and the
//!   callee has usable source. Runtime trampolines are resolved first, with
//!   an injected compile call when the runtime needs one.
//! - Source-level operations never stop in the middle of a line or inside a
//!   method prologue: such a stop starts a follow-up step frame.
//! - Resuming from an address with an installed trap steps over it with the
//!   trap lifted and every other thread paused.

mod backtrace;
pub mod operation;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

pub use operation::{
    CallMethodData, Operation, OperationKind, OperationResult, RuntimeInvokeData, StepFrame, StepMode,
};

use self::backtrace::Unwinder;
use crate::arch::{Architecture, CallTarget, MemoryAccess};
use crate::breakpoints::{BreakpointBuilder, BreakpointHandle, BreakpointManager, HitResolution};
use crate::config::DebuggerOptions;
use crate::disasm::Disassembler;
use crate::error::{Result, StepwiseError};
use crate::events::TargetEvent;
use crate::inferior::{CallArgument, ChildEvent, EventSource, Inferior, RawStatus, TrapId, SIGKILL};
use crate::symbols::{Method, SourceFiles, SymbolTable, TrampolineResolver};
use crate::types::{Address, Backtrace, FrameStatus, MemoryRegion, Registers, StackFrame, TargetState, ThreadId};

/// Channel an operation's result is delivered on.
pub(crate) type Reply = mpsc::SyncSender<Result<OperationResult>>;

/// Index of an engine in the event loop's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct EngineId(pub(crate) usize);

/// Services the event loop provides to the engine it is dispatching to.
pub(crate) trait EngineHost
{
    /// The process-wide breakpoint table.
    fn breakpoints(&mut self) -> &mut BreakpointManager;

    /// Stop every other thread. Pairs with
    /// [`EngineHost::release_global_thread_lock`].
    fn acquire_global_thread_lock(&mut self, owner: EngineId) -> Result<()>;

    /// Let the threads stopped by the lock go again.
    fn release_global_thread_lock(&mut self, owner: EngineId) -> Result<()>;

    /// Deliver an event to subscribers.
    fn publish(&mut self, event: TargetEvent);

    /// Take ownership of a thread the target just created.
    fn adopt_thread(&mut self, inferior: Box<dyn Inferior>);
}

/// Engine state visible to client threads without a round trip through
/// the event loop.
#[derive(Debug)]
pub(crate) struct EngineShared
{
    tid: ThreadId,
    busy: AtomicBool,
    state: Mutex<TargetState>,
    idle: Condvar,
}

impl EngineShared
{
    fn new(tid: ThreadId, state: TargetState) -> Arc<Self>
    {
        Arc::new(Self {
            tid,
            busy: AtomicBool::new(false),
            state: Mutex::new(state),
            idle: Condvar::new(),
        })
    }

    pub(crate) fn tid(&self) -> ThreadId
    {
        self.tid
    }

    /// Claim the engine for an asynchronous operation. Fails if one is
    /// already in flight.
    pub(crate) fn try_begin(&self) -> bool
    {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end(&self)
    {
        // Flip under the state mutex so a concurrent `wait_idle` cannot miss
        // the notification.
        let state = self.state.lock();
        self.busy.store(false, Ordering::Release);
        drop(state);
        self.idle.notify_all();
    }

    /// Block until no operation is in flight or `timeout` expires. Returns
    /// `true` if the engine is idle.
    pub(crate) fn wait_idle(&self, timeout: Option<Duration>) -> bool
    {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let Ok(mut state) = self.state.lock() else {
            return !self.is_busy();
        };
        while self.is_busy() {
            state = match deadline {
                None => match self.idle.wait(state) {
                    Ok(state) => state,
                    Err(_) => return !self.is_busy(),
                },
                Some(deadline) => {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        return false;
                    };
                    match self.idle.wait_timeout(state, remaining) {
                        Ok((state, _)) => state,
                        Err(_) => return !self.is_busy(),
                    }
                }
            };
        }
        true
    }

    pub(crate) fn is_busy(&self) -> bool
    {
        self.busy.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> TargetState
    {
        self.state.lock().map_or(TargetState::NoTarget, |state| *state)
    }

    fn set_state(&self, value: TargetState)
    {
        if let Ok(mut state) = self.state.lock() {
            *state = value;
        }
    }
}

/// Process-wide collaborators shared by all engines.
#[derive(Debug)]
pub(crate) struct EngineContext
{
    pub(crate) arch: Arc<dyn Architecture>,
    pub(crate) symbols: Arc<SymbolTable>,
    pub(crate) sources: Arc<dyn SourceFiles>,
    pub(crate) disassembler: Arc<dyn Disassembler>,
    pub(crate) resolver: Option<Arc<dyn TrampolineResolver>>,
    pub(crate) options: DebuggerOptions,
}

/// Kind of atomic resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resume
{
    Step,
    Continue,
}

/// What to do when an injected call returns.
#[derive(Debug)]
enum CallbackKind
{
    MethodCompiled,
    RuntimeInvokeCompiled(RuntimeInvokeData),
    RuntimeInvokeDone,
    CallMethodDone,
}

#[derive(Debug)]
struct PendingCallback
{
    id: u64,
    kind: CallbackKind,
}

#[derive(Debug, Clone, Copy)]
struct TemporaryBreakpoint
{
    trap: TrapId,
    address: Address,
}

#[derive(Debug, Clone, Copy)]
struct StepOver
{
    address: Address,
    resume: Resume,
}

/// A call instruction; `target` is unknown when the operand could not be
/// resolved.
#[derive(Debug, Clone, Copy)]
struct CallSite
{
    target: Option<Address>,
    instruction_size: usize,
}

impl From<CallTarget> for CallSite
{
    fn from(call: CallTarget) -> Self
    {
        Self {
            target: Some(call.target),
            instruction_size: call.instruction_size,
        }
    }
}

#[derive(Debug)]
struct Active
{
    name: &'static str,
    reply: Option<Reply>,
}

/// Target memory through an inferior handle.
struct InferiorMemory<'a>(&'a dyn Inferior);

impl MemoryAccess for InferiorMemory<'_>
{
    fn read_bytes(&self, address: Address, len: usize) -> Result<Vec<u8>>
    {
        self.0.read_bytes(address, len)
    }
}

/// Execution control for one thread.
pub(crate) struct SteppingEngine
{
    id: EngineId,
    tid: ThreadId,
    inferior: Option<Box<dyn Inferior>>,
    context: Arc<EngineContext>,
    shared: Arc<EngineShared>,

    active: Option<Active>,
    step: Option<Operation>,
    temporary: Option<TemporaryBreakpoint>,
    stepping_over: Option<StepOver>,
    callback: Option<PendingCallback>,
    next_callback: u64,
    last_resume: Resume,
    stop_requested: bool,
    starting: bool,
    frame: Option<StackFrame>,
    /// Where `main` returns to, once the initial thread has stopped in it.
    main_return: Option<Address>,

    lock_count: usize,
    paused: bool,
    queued: VecDeque<ChildEvent>,
}

impl SteppingEngine
{
    /// Engine for a stopped thread.
    pub(crate) fn new(id: EngineId, inferior: Box<dyn Inferior>, context: Arc<EngineContext>) -> Self
    {
        let tid = inferior.tid();
        let state = match inferior.state() {
            TargetState::CoreFile => TargetState::CoreFile,
            _ => TargetState::Stopped,
        };
        Self {
            id,
            tid,
            inferior: Some(inferior),
            context,
            shared: EngineShared::new(tid, state),
            active: None,
            step: None,
            temporary: None,
            stepping_over: None,
            callback: None,
            next_callback: 0,
            last_resume: Resume::Continue,
            stop_requested: false,
            starting: false,
            frame: None,
            main_return: None,
            lock_count: 0,
            paused: false,
            queued: VecDeque::new(),
        }
    }

    /// Engine for a thread the target just created. The thread runs in the
    /// background until something stops it.
    pub(crate) fn new_background(id: EngineId, inferior: Box<dyn Inferior>, context: Arc<EngineContext>) -> Self
    {
        let mut engine = Self::new(id, inferior, context);
        engine.starting = true;
        engine.step = Some(Operation::new(OperationKind::RunInBackground { until: None }));
        engine.active = Some(Active {
            name: "run-in-background",
            reply: None,
        });
        engine.shared.busy.store(true, Ordering::Release);
        engine.shared.set_state(TargetState::Running);
        engine
    }

    pub(crate) fn id(&self) -> EngineId
    {
        self.id
    }

    pub(crate) fn tid(&self) -> ThreadId
    {
        self.tid
    }

    pub(crate) fn shared(&self) -> &Arc<EngineShared>
    {
        &self.shared
    }

    pub(crate) fn is_alive(&self) -> bool
    {
        self.inferior.is_some()
    }

    /// `true` while an operation is in flight.
    pub(crate) fn has_operation(&self) -> bool
    {
        self.active.is_some()
    }

    /// `true` if the thread may produce wait events: an operation is in
    /// flight and the global lock is not holding the thread.
    pub(crate) fn is_running(&self) -> bool
    {
        self.inferior.is_some() && self.active.is_some() && self.lock_count == 0 && self.queued.is_empty()
    }

    /// Interpret a raw wait status. `None` for a thread that already died.
    pub(crate) fn interpret(&mut self, status: RawStatus) -> Result<Option<ChildEvent>>
    {
        match self.inferior.as_deref_mut() {
            Some(inferior) => inferior.process_event(status).map(Some),
            None => Ok(None),
        }
    }

    /// Hand an interpreted event to the engine, or keep it while the
    /// global lock holds the thread.
    pub(crate) fn deliver(&mut self, host: &mut dyn EngineHost, event: ChildEvent)
    {
        if self.lock_count > 0 {
            trace!(thread = %self.tid, ?event, "event deferred by global lock");
            self.queued.push_back(event);
        } else {
            self.process_event(host, event);
        }
    }

    /// Interpret and deliver a raw wait status.
    pub(crate) fn handle_raw(&mut self, host: &mut dyn EngineHost, status: RawStatus)
    {
        match self.interpret(status) {
            Ok(Some(event)) => self.deliver(host, event),
            Ok(None) => trace!(thread = %self.tid, ?status, "wait status for a dead thread ignored"),
            Err(e) => self.abort(host, e),
        }
    }

    /// Keep an event that was routed before the global lock was taken.
    pub(crate) fn defer_event(&mut self, event: ChildEvent)
    {
        self.queued.push_back(event);
    }

    fn inferior(&self) -> Result<&dyn Inferior>
    {
        self.inferior.as_deref().ok_or(StepwiseError::NoTarget)
    }

    fn inferior_mut(&mut self) -> Result<&mut (dyn Inferior + 'static)>
    {
        self.inferior.as_deref_mut().ok_or(StepwiseError::NoTarget)
    }

    fn pc(&self) -> Result<Address>
    {
        let registers = self.inferior()?.registers()?;
        registers
            .get(self.context.arch.pc_register())
            .map(Address::new)
            .ok_or_else(|| StepwiseError::internal("program counter unavailable"))
    }

    // ---------------------------------------------------------------------
    // Operations
    // ---------------------------------------------------------------------

    /// Start `operation`. The result arrives on `reply` once the thread
    /// stops for good.
    ///
    /// ## Errors
    ///
    /// - `NoTarget` if the thread is gone.
    /// - `NotStopped` if an operation is already in flight.
    /// - `NoPermission` for a read-only snapshot.
    /// - `AlreadyRunning` while the global thread lock is held.
    /// - Anything the first atomic resume reports (`NoMethod` for `finish`
    ///   outside a known method, ...).
    pub(crate) fn start_operation(
        &mut self,
        host: &mut dyn EngineHost,
        operation: Operation,
        reply: Option<Reply>,
    ) -> Result<()>
    {
        let result = self.try_start(host, operation, reply);
        if result.is_err() {
            self.reset_operation();
            self.shared.set_state(self.idle_state());
            self.shared.end();
        }
        result
    }

    fn try_start(&mut self, host: &mut dyn EngineHost, operation: Operation, reply: Option<Reply>) -> Result<()>
    {
        match self.inferior()?.state() {
            TargetState::CoreFile => {
                return Err(StepwiseError::NoPermission("snapshot targets cannot be resumed".to_string()))
            }
            TargetState::Stopped if self.active.is_none() => {}
            _ => return Err(StepwiseError::NotStopped),
        }
        if self.lock_count > 0 {
            return Err(StepwiseError::AlreadyRunning);
        }

        self.stop_requested = false;
        self.active = Some(Active {
            name: operation.name(),
            reply,
        });
        self.shared.set_state(TargetState::Running);
        self.process_command(host, operation)?;
        host.publish(TargetEvent::TargetRunning { thread: self.tid });
        Ok(())
    }

    fn process_command(&mut self, host: &mut dyn EngineHost, operation: Operation) -> Result<()>
    {
        debug!(thread = %self.tid, operation = %operation, "starting operation");
        self.frame = None;
        self.step = None;

        match operation.kind().clone() {
            OperationKind::Run { .. } | OperationKind::RunInBackground { .. } | OperationKind::StepFrame => {
                self.begin_step(host, operation)
            }
            OperationKind::StepNativeInstruction => self.resume(host, Resume::Step),
            OperationKind::NextInstruction => self.do_next(host),
            OperationKind::StepInstruction => match self.context.resolver.clone() {
                Some(resolver) => {
                    let frame = StepFrame::unbounded(StepMode::SingleInstruction, Some(resolver));
                    self.begin_step(host, operation.with_step_frame(frame))
                }
                None => self.resume(host, Resume::Step),
            },
            OperationKind::StepLine => match self.line_frame(StepMode::StepFrame)? {
                Some(frame) => self.begin_step(host, operation.with_step_frame(frame)),
                None => self.resume(host, Resume::Step),
            },
            OperationKind::NextLine => match self.line_frame(StepMode::Finish)? {
                Some(frame) => self.begin_step(host, operation.with_step_frame(frame)),
                None => self.do_next(host),
            },
            OperationKind::Finish => {
                let frame = self.compute_frame()?;
                let method = frame.method.ok_or(StepwiseError::NoMethod)?;
                let frame = StepFrame::new(method.start(), method.end(), StepMode::Finish, None)?;
                self.begin_step(host, operation.with_step_frame(frame))
            }
            OperationKind::RuntimeInvoke(data) => match data.resolver.compile_method_function() {
                Some(compile) => {
                    let args = [CallArgument::Word(data.method.value())];
                    self.start_callback(host, CallbackKind::RuntimeInvokeCompiled(data), compile, &args)
                }
                None => self.start_invoke(host, &data),
            },
            OperationKind::CallMethod(data) => {
                self.start_callback(host, CallbackKind::CallMethodDone, data.method(), &data.arguments())
            }
        }
    }

    fn begin_step(&mut self, host: &mut dyn EngineHost, operation: Operation) -> Result<()>
    {
        self.step = Some(operation);
        if self.do_step(host, true)? {
            self.step = None;
            let frame = self.compute_frame().ok();
            self.complete_event(host, TargetEvent::TargetStopped {
                thread: self.tid,
                signal: 0,
                frame,
            });
        }
        Ok(())
    }

    /// Step frame covering the current source line.
    fn line_frame(&mut self, mode: StepMode) -> Result<Option<StepFrame>>
    {
        let frame = self.compute_frame()?;
        let Some(source) = &frame.source else {
            return Ok(None);
        };
        let (start, end) = (source.line_start(), source.line_end());
        if end <= start {
            return Ok(None);
        }
        let resolver = frame.method.as_ref().and(self.context.resolver.clone());
        StepFrame::new(start, end, mode, resolver).map(Some)
    }

    /// Decide whether the step operation needs another atomic resume.
    ///
    /// `first` is set for the resume that starts the operation; later calls
    /// run after a stop. Returns `true` when the operation is complete and
    /// the thread is still stopped.
    fn do_step(&mut self, host: &mut dyn EngineHost, first: bool) -> Result<bool>
    {
        let Some(operation) = self.step.clone() else {
            return Ok(true);
        };

        if operation.is_run() {
            if let Some(until) = operation.until() {
                if !first && self.pc()? == until {
                    return Ok(true);
                }
                if self.temporary.is_none() {
                    self.insert_temporary(until)?;
                }
            }
            self.resume(host, Resume::Continue)?;
            return Ok(false);
        }

        let Some(frame) = operation.frame().cloned() else {
            return Ok(true);
        };
        let pc = self.pc()?;
        if !first && !frame.contains(pc) {
            return Ok(true);
        }

        let Some(call) = self.call_site(pc) else {
            self.resume(host, Resume::Step)?;
            return Ok(false);
        };
        let Some(target) = call.target else {
            // A call whose callee cannot be resolved is only entered one
            // instruction at a time.
            if frame.mode() == StepMode::SingleInstruction {
                self.resume(host, Resume::Step)?;
            } else {
                self.do_next(host)?;
            }
            return Ok(false);
        };

        if frame.mode() != StepMode::Finish {
            if let Some(resolver) = frame.resolver() {
                if let Some(trampoline) = self.trampoline(resolver.as_ref(), target) {
                    self.do_trampoline(host, Arc::clone(resolver), trampoline)?;
                    return Ok(false);
                }
                if frame.mode() != StepMode::SingleInstruction
                    && !self.method_has_source(self.context.symbols.lookup(target).as_ref())
                {
                    self.do_next(host)?;
                    return Ok(false);
                }
            }
        }

        match frame.mode() {
            StepMode::SingleInstruction => {
                self.resume(host, Resume::Step)?;
                return Ok(false);
            }
            StepMode::Finish => {
                self.do_next(host)?;
                return Ok(false);
            }
            StepMode::StepFrame => {}
        }

        let method = self.context.symbols.lookup(target);
        let Some(method) = method.filter(|method| self.method_has_source(Some(method))) else {
            self.do_next(host)?;
            return Ok(false);
        };

        if let Some(wrapped) = method.wrapper_target() {
            trace!(thread = %self.tid, wrapper = %method.name(), %wrapped, "call goes through a wrapper");
            if self.method_has_source(self.context.symbols.lookup(wrapped).as_ref()) {
                self.continue_until(host, wrapped)?;
            } else {
                self.do_next(host)?;
            }
            return Ok(false);
        }

        self.resume(host, Resume::Step)?;
        Ok(false)
    }

    /// Step over the call at pc, or single-step any other instruction.
    fn do_next(&mut self, host: &mut dyn EngineHost) -> Result<()>
    {
        let pc = self.pc()?;
        match self.call_site(pc) {
            Some(call) => {
                self.insert_temporary(pc + call.instruction_size as u64)?;
                self.resume(host, Resume::Continue)
            }
            None => self.resume(host, Resume::Step),
        }
    }

    fn continue_until(&mut self, host: &mut dyn EngineHost, address: Address) -> Result<()>
    {
        self.insert_temporary(address)?;
        self.resume(host, Resume::Continue)
    }

    fn do_trampoline(
        &mut self,
        host: &mut dyn EngineHost,
        resolver: Arc<dyn TrampolineResolver>,
        trampoline: Address,
    ) -> Result<()>
    {
        debug!(thread = %self.tid, runtime = resolver.name(), %trampoline, "call goes through a trampoline");
        match resolver.compile_method_function() {
            Some(compile) => {
                let args = [CallArgument::Word(trampoline.value())];
                self.start_callback(host, CallbackKind::MethodCompiled, compile, &args)
            }
            None => self.enter_if_source(host, trampoline),
        }
    }

    /// Run to `target` if it has source, otherwise step over the call.
    fn enter_if_source(&mut self, host: &mut dyn EngineHost, target: Address) -> Result<()>
    {
        if self.method_has_source(self.context.symbols.lookup(target).as_ref()) {
            self.continue_until(host, target)
        } else {
            self.do_next(host)
        }
    }

    fn start_invoke(&mut self, host: &mut dyn EngineHost, data: &RuntimeInvokeData) -> Result<()>
    {
        let function = data.resolver.runtime_invoke_function().ok_or_else(|| {
            StepwiseError::InvalidArgument(format!("runtime {} has no invoke function", data.resolver.name()))
        })?;
        let params = data
            .params
            .iter()
            .flat_map(|param| param.value().to_le_bytes())
            .collect();
        let args = [
            CallArgument::Word(data.method.value()),
            CallArgument::Word(data.object.value()),
            CallArgument::Bytes(params),
        ];
        self.start_callback(host, CallbackKind::RuntimeInvokeDone, function, &args)
    }

    fn start_callback(
        &mut self,
        host: &mut dyn EngineHost,
        kind: CallbackKind,
        function: Address,
        args: &[CallArgument],
    ) -> Result<()>
    {
        self.next_callback += 1;
        let id = self.next_callback;
        trace!(thread = %self.tid, id, %function, ?kind, "injecting call");
        self.inferior_mut()?.call_function(function, args, id)?;
        self.callback = Some(PendingCallback { id, kind });
        self.resume(host, Resume::Continue)
    }

    fn callback_done(&mut self, host: &mut dyn EngineHost, kind: CallbackKind, data1: u64, data2: u64) -> Result<()>
    {
        trace!(thread = %self.tid, ?kind, data1, data2, "injected call returned");
        match kind {
            CallbackKind::MethodCompiled => self.enter_if_source(host, Address::new(data1)),
            CallbackKind::RuntimeInvokeCompiled(data) => self.start_invoke(host, &data),
            CallbackKind::RuntimeInvokeDone => {
                let result = OperationResult::Invoke {
                    result: Address::new(data1),
                    exception: (data2 != 0).then(|| Address::new(data2)),
                };
                self.complete_with_frame_change(host, result);
                Ok(())
            }
            CallbackKind::CallMethodDone => {
                self.complete_with_frame_change(host, OperationResult::Call { data1, data2 });
                Ok(())
            }
        }
    }

    // ---------------------------------------------------------------------
    // Event processing
    // ---------------------------------------------------------------------

    /// Handle one interpreted stop of this thread.
    pub(crate) fn process_event(&mut self, host: &mut dyn EngineHost, event: ChildEvent)
    {
        if self.inferior.is_none() {
            trace!(thread = %self.tid, ?event, "event for a dead thread ignored");
            return;
        }
        trace!(thread = %self.tid, ?event, "processing event");
        if let Err(e) = self.handle_event(host, event) {
            self.abort(host, e);
        }
    }

    fn handle_event(&mut self, host: &mut dyn EngineHost, event: ChildEvent) -> Result<()>
    {
        self.frame = None;

        if event.is_terminal() {
            return self.report_exit(host, event);
        }

        if let Some(step_over) = self.stepping_over.take() {
            self.inferior_mut()?.suspend_breakpoints_at(step_over.address, false)?;
            host.release_global_thread_lock(self.id)?;
            if step_over.resume == Resume::Continue && event == ChildEvent::Stopped(0) && !self.stop_requested {
                return self.resume(host, Resume::Continue);
            }
        }

        if std::mem::take(&mut self.starting) && event == ChildEvent::Interrupted && !self.stop_requested {
            debug!(thread = %self.tid, "new thread started");
            return self.resume(host, Resume::Continue);
        }

        let mut event = event;
        if let ChildEvent::Callback { id, data1, data2 } = event {
            return match self.callback.take() {
                Some(callback) if callback.id == id => self.callback_done(host, callback.kind, data1, data2),
                other => {
                    self.callback = other;
                    Err(StepwiseError::internal(format!("callback {id} does not match any pending request")))
                }
            };
        }

        if let (Some(temporary), ChildEvent::HitBreakpoint(Some(address))) = (self.temporary, event) {
            if temporary.address == address {
                trace!(thread = %self.tid, %address, "temporary breakpoint reached");
                self.remove_temporary();
                event = ChildEvent::Stopped(0);
            }
        }

        match event {
            ChildEvent::HitBreakpoint(None) => {
                info!(thread = %self.tid, "trap instruction in the program");
                let frame = self.compute_frame().ok();
                self.complete_event(host, TargetEvent::TargetHitBreakpoint {
                    thread: self.tid,
                    handle: None,
                    frame,
                });
                return Ok(());
            }
            ChildEvent::HitBreakpoint(Some(address)) => return self.breakpoint_hit(host, address),
            ChildEvent::Stopped(signal) if signal != 0 => {
                debug!(thread = %self.tid, signal, "stopped by signal");
                self.report_stop(host, signal);
                return Ok(());
            }
            ChildEvent::Interrupted => {
                if self.stop_requested {
                    self.report_stop(host, 0);
                    return Ok(());
                }
                if self.active.is_none() {
                    return Ok(());
                }
                trace!(thread = %self.tid, "late stop request, resuming");
                return self.resume(host, self.last_resume);
            }
            ChildEvent::ThreadCreated(tid) => {
                debug!(thread = %self.tid, new_thread = %tid, "thread created");
                let inferior = self.inferior()?.new_thread(tid)?;
                host.adopt_thread(inferior);
                if self.active.is_none() {
                    return Ok(());
                }
                return self.resume(host, self.last_resume);
            }
            _ => {}
        }

        if self.stop_requested {
            self.report_stop(host, 0);
            return Ok(());
        }

        if self.temporary.is_some() {
            return self.resume(host, Resume::Continue);
        }

        if self.step.is_some() && !self.do_step(host, false)? {
            return Ok(());
        }

        let finished = self.step.take();
        let frame = self.compute_frame()?;
        if let Some(operation) = finished {
            if let Some(next) = self.method_entry_operation(&operation, &frame)? {
                debug!(thread = %self.tid, pc = %frame.pc, next = %next, "adjusting stop position");
                return self.process_command(host, next);
            }
        }

        // Nothing after main is worth stopping in; run to the end.
        if self.main_return == Some(frame.pc) {
            debug!(thread = %self.tid, pc = %frame.pc, "main returned, running to exit");
            self.step = Some(Operation::new(OperationKind::Run { until: None }));
            return self.resume(host, Resume::Continue);
        }

        self.complete_event(host, TargetEvent::TargetStopped {
            thread: self.tid,
            signal: 0,
            frame: Some(frame),
        });
        Ok(())
    }

    fn breakpoint_hit(&mut self, host: &mut dyn EngineHost, address: Address) -> Result<()>
    {
        let frame = if host.breakpoints().hit_needs_frame(address, self.tid) {
            Some(self.compute_frame()?)
        } else {
            None
        };

        match host.breakpoints().resolve_hit(address, self.tid, frame.as_ref()) {
            HitResolution::Report(handle) => {
                info!(thread = %self.tid, breakpoint = %handle, %address, "breakpoint hit");
                let frame = self.compute_frame().ok();
                self.complete_event(host, TargetEvent::TargetHitBreakpoint {
                    thread: self.tid,
                    handle: Some(handle),
                    frame,
                });
                Ok(())
            }
            _ if self.stop_requested => {
                self.report_stop(host, 0);
                Ok(())
            }
            HitResolution::Ignore => {
                trace!(thread = %self.tid, %address, "breakpoint declined, resuming");
                self.resume(host, self.last_resume)
            }
            HitResolution::NoOwner => {
                trace!(thread = %self.tid, %address, "trap is not for this thread, resuming");
                self.resume(host, self.last_resume)
            }
        }
    }

    /// Follow-up operation that moves a source-level stop to a line
    /// boundary outside the method prologue.
    fn method_entry_operation(&self, operation: &Operation, frame: &StackFrame) -> Result<Option<Operation>>
    {
        if operation.is_native() {
            return Ok(None);
        }
        let Some(method) = &frame.method else {
            return Ok(None);
        };
        let address = frame.pc;

        if let Some(wrapped) = method.wrapper_target() {
            if address == method.start() && !operation.via_wrapper() {
                return Ok(Some(Operation::run_into_wrapped(wrapped)));
            }
        }

        let Some(source) = &frame.source else {
            return Ok(None);
        };
        if !operation.is_source_operation() {
            return Ok(None);
        }

        if source.offset > 0 && source.range > 0 {
            let mode = match operation.kind() {
                OperationKind::StepLine => StepMode::StepFrame,
                _ => StepMode::Finish,
            };
            let frame = StepFrame::new(
                address - source.offset,
                address + source.range,
                mode,
                self.context.resolver.clone(),
            )?;
            return Ok(Some(Operation::step_frame(frame)));
        }

        if method.has_prologue() && address < method.body_start() {
            let frame = StepFrame::new(method.start(), method.body_start(), StepMode::Finish, None)?;
            return Ok(Some(Operation::step_frame(frame)));
        }

        Ok(None)
    }

    /// Usable source for stepping into `method`.
    fn method_has_source(&self, method: Option<&Arc<Method>>) -> bool
    {
        let Some(method) = method else {
            return false;
        };
        if self.context.options.step_into_without_source {
            return true;
        }
        if !method.has_source() || !method.module().step_into() {
            return false;
        }
        let Some(source) = method.source() else {
            return false;
        };
        if source.is_dynamic() || !self.context.sources.exists(source.file()) {
            return false;
        }
        source.lookup(method.start()).is_some()
    }

    /// The call instruction at `pc`, if any.
    ///
    /// When the architecture sees a call it cannot resolve, the disassembler
    /// still provides its length so the call can be stepped over.
    fn call_site(&self, pc: Address) -> Option<CallSite>
    {
        let inferior = self.inferior().ok()?;
        let registers = inferior.registers().ok()?;
        let memory = InferiorMemory(inferior);
        let e = match self.context.arch.get_call_target(&memory, &registers, pc) {
            Ok(call) => return call.map(CallSite::from),
            Err(e) => e,
        };
        match self.context.disassembler.call_size(&memory, pc) {
            Ok(Some(instruction_size)) => {
                debug!(thread = %self.tid, %pc, error = %e, "call target unknown");
                Some(CallSite {
                    target: None,
                    instruction_size,
                })
            }
            Ok(None) => None,
            Err(disasm) => {
                warn!(thread = %self.tid, %pc, error = %e, disasm = %disasm, "cannot decode instruction, treating it as no call");
                None
            }
        }
    }

    fn trampoline(&self, resolver: &dyn TrampolineResolver, target: Address) -> Option<Address>
    {
        let inferior = self.inferior().ok()?;
        match resolver.get_trampoline(&InferiorMemory(inferior), self.context.arch.as_ref(), target) {
            Ok(trampoline) => trampoline,
            Err(e) => {
                warn!(thread = %self.tid, %target, error = %e, "trampoline check failed");
                None
            }
        }
    }

    // ---------------------------------------------------------------------
    // Atomic resumes
    // ---------------------------------------------------------------------

    /// Single-step or continue. A trap at the current pc is stepped over
    /// first, with the trap lifted and every other thread stopped.
    fn resume(&mut self, host: &mut dyn EngineHost, kind: Resume) -> Result<()>
    {
        self.frame = None;
        self.last_resume = kind;
        let pc = self.pc()?;

        if self.inferior()?.has_breakpoint_at(pc) {
            trace!(thread = %self.tid, %pc, "stepping over breakpoint");
            host.acquire_global_thread_lock(self.id)?;
            if let Err(e) = self.lift_and_step(pc) {
                if let Ok(inferior) = self.inferior_mut() {
                    if let Err(restore) = inferior.suspend_breakpoints_at(pc, false) {
                        warn!(thread = %self.tid, %pc, error = %restore, "cannot restore breakpoint");
                    }
                }
                host.release_global_thread_lock(self.id)?;
                return Err(e);
            }
            self.stepping_over = Some(StepOver { address: pc, resume: kind });
            return Ok(());
        }

        let inferior = self.inferior_mut()?;
        match kind {
            Resume::Step => inferior.single_step(),
            Resume::Continue => inferior.resume(),
        }
    }

    fn lift_and_step(&mut self, pc: Address) -> Result<()>
    {
        let inferior = self.inferior_mut()?;
        inferior.suspend_breakpoints_at(pc, true)?;
        inferior.single_step()
    }

    fn insert_temporary(&mut self, address: Address) -> Result<()>
    {
        self.remove_temporary();
        let trap = self.inferior_mut()?.insert_breakpoint(address)?;
        trace!(thread = %self.tid, %address, "temporary breakpoint inserted");
        self.temporary = Some(TemporaryBreakpoint { trap, address });
        Ok(())
    }

    fn remove_temporary(&mut self)
    {
        let Some(temporary) = self.temporary.take() else {
            return;
        };
        if let Some(inferior) = self.inferior.as_deref_mut() {
            if let Err(e) = inferior.remove_breakpoint(temporary.trap) {
                warn!(thread = %self.tid, address = %temporary.address, error = %e, "cannot remove temporary breakpoint");
            }
        }
    }

    // ---------------------------------------------------------------------
    // Completion
    // ---------------------------------------------------------------------

    fn idle_state(&self) -> TargetState
    {
        match self.inferior.as_deref() {
            None => TargetState::NoTarget,
            Some(inferior) if inferior.state() == TargetState::CoreFile => TargetState::CoreFile,
            Some(_) => TargetState::Stopped,
        }
    }

    fn reset_operation(&mut self)
    {
        self.remove_temporary();
        self.step = None;
        self.callback = None;
        self.stop_requested = false;
        self.starting = false;
        self.active = None;
    }

    fn report_stop(&mut self, host: &mut dyn EngineHost, signal: i32)
    {
        let frame = self.compute_frame().ok();
        self.complete_event(host, TargetEvent::TargetStopped {
            thread: self.tid,
            signal,
            frame,
        });
    }

    fn complete_event(&mut self, host: &mut dyn EngineHost, event: TargetEvent)
    {
        if let TargetEvent::TargetStopped { frame: Some(frame), .. }
        | TargetEvent::TargetHitBreakpoint { frame: Some(frame), .. } = &event
        {
            self.note_main_return(frame);
        }
        self.complete(host, OperationResult::Event(event.clone()), event);
    }

    /// Remember the return address of `main` the first time the initial
    /// thread stops inside it.
    fn note_main_return(&mut self, frame: &StackFrame)
    {
        if self.id != EngineId(0) || self.main_return.is_some() {
            return;
        }
        if frame.method.as_ref().map(|method| method.name().display_name()) != Some("main") {
            return;
        }
        let caller = match self.backtrace(2) {
            Ok(backtrace) => backtrace.frames().get(1).map(|caller| caller.pc),
            Err(e) => {
                debug!(thread = %self.tid, error = %e, "cannot unwind out of main");
                None
            }
        };
        if let Some(address) = caller {
            debug!(thread = %self.tid, %address, "main returns here");
            self.main_return = Some(address);
        }
    }

    fn complete_with_frame_change(&mut self, host: &mut dyn EngineHost, result: OperationResult)
    {
        self.frame = None;
        let frame = self.compute_frame().ok();
        self.complete(host, result, TargetEvent::FrameChanged { thread: self.tid, frame });
    }

    /// Finish the operation in flight: clean up, notify subscribers and
    /// then wake the waiter. Anyone woken by the completion can already
    /// see the event.
    fn complete(&mut self, host: &mut dyn EngineHost, result: OperationResult, event: TargetEvent)
    {
        let active = self.active.take();
        self.reset_operation();

        let state = match event {
            TargetEvent::TargetExited { code, .. } => TargetState::Exited(code),
            TargetEvent::TargetSignaled { signal, .. } => TargetState::Signaled(signal),
            _ => self.idle_state(),
        };
        self.shared.set_state(state);
        if let Some(active) = &active {
            debug!(thread = %self.tid, operation = active.name, event = %event.describe(), "operation complete");
        }
        host.publish(event);

        self.shared.end();
        if let Some(reply) = active.and_then(|active| active.reply) {
            let _ = reply.send(Ok(result));
        }
    }

    /// Fail the operation in flight. The thread is left where it stopped.
    fn abort(&mut self, host: &mut dyn EngineHost, error: StepwiseError)
    {
        warn!(thread = %self.tid, error = %error, "operation failed");
        if self.stepping_over.take().is_some() {
            if let Err(e) = host.release_global_thread_lock(self.id) {
                warn!(thread = %self.tid, error = %e, "cannot release global thread lock");
            }
        }
        let active = self.active.take();
        self.reset_operation();
        self.shared.set_state(self.idle_state());
        self.shared.end();
        if let Some(reply) = active.and_then(|active| active.reply) {
            let _ = reply.send(Err(error));
        }
    }

    fn report_exit(&mut self, host: &mut dyn EngineHost, event: ChildEvent) -> Result<()>
    {
        let target_event = match event {
            ChildEvent::Exited(code) => TargetEvent::TargetExited { thread: self.tid, code },
            ChildEvent::Signaled(signal) => TargetEvent::TargetSignaled { thread: self.tid, signal },
            other => return Err(StepwiseError::internal(format!("{other:?} is not an exit"))),
        };
        info!(thread = %self.tid, event = %target_event.describe(), "thread exited");

        self.temporary = None;
        if self.stepping_over.take().is_some() {
            host.release_global_thread_lock(self.id)?;
        }
        self.inferior = None;
        self.frame = None;
        self.complete_event(host, target_event);
        Ok(())
    }

    /// Report the thread killed. Completes the pending operation, if any,
    /// with the exit event. No-op for a thread that already died.
    pub(crate) fn report_killed(&mut self, host: &mut dyn EngineHost)
    {
        if self.inferior.is_none() {
            return;
        }
        self.temporary = None;
        self.stepping_over = None;
        self.inferior = None;
        self.frame = None;
        self.complete_event(host, TargetEvent::TargetExited {
            thread: self.tid,
            code: 128 + SIGKILL,
        });
    }

    /// Ask the thread to stop. Returns `false` if nothing was running.
    pub(crate) fn request_stop(&mut self, host: &mut dyn EngineHost) -> Result<bool>
    {
        self.inferior()?;
        if self.active.is_none() {
            return Ok(false);
        }
        debug!(thread = %self.tid, "stop requested");
        self.stop_requested = true;
        if self.lock_count > 0 {
            return Ok(true);
        }
        if !self.inferior_mut()?.stop()? {
            self.report_stop(host, 0);
        }
        Ok(true)
    }

    /// Remove every trap and let the thread go.
    pub(crate) fn detach(&mut self) -> Result<()>
    {
        self.remove_temporary();
        let mut inferior = self.inferior.take().ok_or(StepwiseError::NoTarget)?;
        inferior.detach()?;
        let active = self.active.take();
        self.reset_operation();
        self.shared.set_state(TargetState::NoTarget);
        self.shared.end();
        if let Some(reply) = active.and_then(|active| active.reply) {
            let _ = reply.send(Err(StepwiseError::NoTarget));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Global thread lock
    // ---------------------------------------------------------------------

    /// Stop this thread on behalf of the global lock. An event that arrives
    /// instead of the stop is kept for [`SteppingEngine::unlock`].
    pub(crate) fn lock(&mut self, source: &mut dyn EventSource) -> Result<()>
    {
        self.lock_count += 1;
        if self.lock_count > 1 || !self.queued.is_empty() {
            return Ok(());
        }
        let tid = self.tid;
        let Some(inferior) = self.inferior.as_deref_mut() else {
            return Ok(());
        };
        if !inferior.stop()? {
            return Ok(());
        }

        loop {
            let Some(raw) = source.wait(Some(tid), None)? else {
                continue;
            };
            if raw.tid != tid {
                return Err(StepwiseError::internal(format!("waited for {tid}, got an event for {}", raw.tid)));
            }
            let event = inferior.process_event(raw.status)?;
            trace!(thread = %tid, ?event, "stopped for global lock");
            if event == ChildEvent::Interrupted {
                self.paused = true;
            } else {
                self.queued.push_back(event);
            }
            return Ok(());
        }
    }

    /// Undo one [`SteppingEngine::lock`]. Returns the events that arrived
    /// while the thread was held, for normal processing; otherwise the
    /// thread resumes what it was doing.
    pub(crate) fn unlock(&mut self) -> Result<Vec<ChildEvent>>
    {
        self.lock_count = self.lock_count.saturating_sub(1);
        if self.lock_count > 0 {
            return Ok(Vec::new());
        }
        let paused = std::mem::take(&mut self.paused);
        if !self.queued.is_empty() {
            return Ok(self.queued.drain(..).collect());
        }
        if !paused {
            return Ok(Vec::new());
        }
        if self.stop_requested {
            return Ok(vec![ChildEvent::Interrupted]);
        }
        let kind = self.last_resume;
        let Some(inferior) = self.inferior.as_deref_mut() else {
            return Ok(Vec::new());
        };
        trace!(thread = %self.tid, ?kind, "resuming after global lock");
        match kind {
            Resume::Step => inferior.single_step()?,
            Resume::Continue => inferior.resume()?,
        }
        Ok(Vec::new())
    }

    // ---------------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------------

    /// Innermost frame of the stopped thread.
    pub(crate) fn compute_frame(&mut self) -> Result<StackFrame>
    {
        if let Some(frame) = &self.frame {
            return Ok(frame.clone());
        }
        let frame = {
            let inferior = self.inferior()?;
            let registers = inferior.registers()?;
            let memory = InferiorMemory(inferior);
            self.unwinder(&memory).frame(registers, 0, FrameStatus::Exact)
        };
        self.frame = Some(frame.clone());
        Ok(frame)
    }

    /// Up to `max` frames, innermost first.
    pub(crate) fn backtrace(&mut self, max: usize) -> Result<Backtrace>
    {
        let innermost = self.compute_frame()?;
        let max = max.min(self.context.options.max_backtrace_frames).max(1);
        let inferior = self.inferior()?;
        let memory = InferiorMemory(inferior);
        Ok(self.unwinder(&memory).backtrace(innermost, max))
    }

    fn unwinder<'a>(&'a self, memory: &'a dyn MemoryAccess) -> Unwinder<'a>
    {
        Unwinder {
            arch: self.context.arch.as_ref(),
            memory,
            symbols: &self.context.symbols,
            thread: self.tid,
            sigreturn: self.context.options.sigreturn_unwinding,
            outermost: self.main_return,
        }
    }

    pub(crate) fn registers(&self) -> Result<Registers>
    {
        self.inferior()?.registers()
    }

    /// Write registers and notify subscribers of the new frame.
    pub(crate) fn set_registers(&mut self, host: &mut dyn EngineHost, registers: &Registers) -> Result<()>
    {
        self.inferior_mut()?.set_registers(registers)?;
        self.frame = None;
        let frame = self.compute_frame().ok();
        host.publish(TargetEvent::FrameChanged { thread: self.tid, frame });
        Ok(())
    }

    pub(crate) fn read_memory(&self, address: Address, len: usize) -> Result<Vec<u8>>
    {
        self.inferior()?.read_bytes(address, len)
    }

    pub(crate) fn write_memory(&mut self, address: Address, data: &[u8]) -> Result<()>
    {
        self.inferior_mut()?.write_memory(address, data)?;
        self.frame = None;
        Ok(())
    }

    pub(crate) fn instruction_size(&self, address: Address) -> Result<usize>
    {
        let inferior = self.inferior()?;
        self.context
            .disassembler
            .instruction_size(&InferiorMemory(inferior), address)
    }

    pub(crate) fn memory_maps(&self) -> Result<Vec<MemoryRegion>>
    {
        self.inferior()?.memory_maps()
    }

    pub(crate) fn insert_breakpoint(
        &mut self,
        host: &mut dyn EngineHost,
        builder: BreakpointBuilder,
    ) -> Result<BreakpointHandle>
    {
        host.breakpoints().insert(self.inferior_mut()?, builder)
    }

    pub(crate) fn remove_breakpoint(&mut self, host: &mut dyn EngineHost, handle: BreakpointHandle) -> Result<()>
    {
        host.breakpoints().remove(self.inferior_mut()?, handle)
    }

    pub(crate) fn set_breakpoint_enabled(
        &mut self,
        host: &mut dyn EngineHost,
        handle: BreakpointHandle,
        enabled: bool,
    ) -> Result<()>
    {
        let inferior = self.inferior_mut()?;
        if enabled {
            host.breakpoints().enable(inferior, handle)
        } else {
            host.breakpoints().disable(inferior, handle)
        }
    }

    pub(crate) fn set_group_enabled(&mut self, host: &mut dyn EngineHost, group: &str, enabled: bool) -> Result<usize>
    {
        let inferior = self.inferior_mut()?;
        if enabled {
            host.breakpoints().enable_group(inferior, group)
        } else {
            host.breakpoints().disable_group(inferior, group)
        }
    }

    /// Kill the whole process through this thread's handle.
    pub(crate) fn kill_process(&mut self) -> Result<()>
    {
        self.inferior_mut()?.kill()
    }

    /// Ask the whole process to terminate.
    pub(crate) fn terminate_process(&mut self) -> Result<()>
    {
        self.inferior_mut()?.terminate()
    }
}

impl std::fmt::Debug for SteppingEngine
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("SteppingEngine")
            .field("id", &self.id)
            .field("tid", &self.tid)
            .field("alive", &self.inferior.is_some())
            .field("operation", &self.active.as_ref().map(|active| active.name))
            .field("lock_count", &self.lock_count)
            .finish_non_exhaustive()
    }
}
