//! # Thread manager
//!
//! Owns every [`SteppingEngine`] of one process and the single event-loop
//! thread that drives them.
//!
//! ## Threading model
//!
//! The event loop is the only thread that talks to the target: it creates
//! the inferiors (ptrace binds a tracee to the thread that attached it), it
//! is the only caller of [`EventSource::wait`], and it runs every engine
//! call. Client threads reach it through a request channel:
//!
//! - Synchronous commands (registers, memory, breakpoints) travel as jobs
//!   and block on a one-shot reply.
//! - Stepping operations are acknowledged as soon as the first atomic
//!   resume is issued; the result arrives later on the operation's own
//!   one-shot channel.
//!
//! A process-wide command mutex serialises clients, so at most one command
//! is being handed to the loop at any time. While no engine runs, the loop
//! blocks on the request channel; otherwise it alternates between draining
//! requests and a short wait on the target.
//!
//! ## Global thread lock
//!
//! Either an engine (stepping over a breakpoint) or a client (through
//! `Process::acquire_global_lock`) can stop every other thread. Threads that
//! reported some other event while being stopped keep that event until the
//! lock is released; the rest resume the atomic operation they were
//! performing.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TryRecvError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::breakpoints::BreakpointManager;
use crate::engine::{EngineContext, EngineHost, EngineId, EngineShared, Operation, OperationKind, OperationResult, SteppingEngine};
use crate::error::{Result, StepwiseError};
use crate::events::{TargetEvent, TargetEventSender};
use crate::inferior::{ChildEvent, EventSource, Inferior, RawEvent, RawStatus};
use crate::types::{ProcessId, ThreadId};

/// How long `shutdown` waits for the target to exit before killing it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on stale wait events drained after a kill.
const KILL_DRAIN_LIMIT: usize = 1024;

/// Creates the inferiors and the event source on the event-loop thread.
pub(crate) type Bootstrap = Box<dyn FnOnce() -> Result<(Vec<Box<dyn Inferior>>, Box<dyn EventSource>)> + Send>;

/// Work executed on the event-loop thread.
pub(crate) type Job = Box<dyn FnOnce(&mut EventLoop) + Send>;

/// Messages from clients to the event loop.
pub(crate) enum Request
{
    /// Run a closure against the loop.
    Job(Job),
    /// Stop every thread for a client.
    AcquireLock(SyncSender<Result<()>>),
    /// Undo `AcquireLock`.
    ReleaseLock(SyncSender<Result<()>>),
    /// Leave the loop.
    Exit,
}

/// Who holds the global thread lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockOwner
{
    Engine(EngineId),
    Client,
}

// -------------------------------------------------------------------------
// Command mutex
// -------------------------------------------------------------------------

/// Process-wide token serialising client commands.
#[derive(Debug, Default)]
pub(crate) struct CommandMutex
{
    owner: Mutex<Option<thread::ThreadId>>,
    released: Condvar,
}

/// Held command mutex; released on drop.
#[derive(Debug)]
pub(crate) struct CommandGuard<'a>
{
    mutex: &'a CommandMutex,
}

impl CommandMutex
{
    fn owner(&self) -> Result<MutexGuard<'_, Option<thread::ThreadId>>>
    {
        self.owner
            .lock()
            .map_err(|_| StepwiseError::internal("command mutex poisoned"))
    }

    /// Block until the mutex is free and take it.
    ///
    /// ## Errors
    ///
    /// `AlreadyRunning` if the calling thread already holds it.
    pub(crate) fn lock(&self) -> Result<CommandGuard<'_>>
    {
        let me = thread::current().id();
        let mut owner = self.owner()?;
        while let Some(holder) = *owner {
            if holder == me {
                return Err(StepwiseError::AlreadyRunning);
            }
            owner = self
                .released
                .wait(owner)
                .map_err(|_| StepwiseError::internal("command mutex poisoned"))?;
        }
        *owner = Some(me);
        Ok(CommandGuard { mutex: self })
    }
}

impl Drop for CommandGuard<'_>
{
    fn drop(&mut self)
    {
        if let Ok(mut owner) = self.mutex.owner.lock() {
            *owner = None;
        }
        self.mutex.released.notify_one();
    }
}

// -------------------------------------------------------------------------
// Thread registry
// -------------------------------------------------------------------------

/// Client-visible list of engines, indexed by [`EngineId`].
#[derive(Debug, Default)]
pub(crate) struct ThreadRegistry
{
    engines: RwLock<Vec<Arc<EngineShared>>>,
}

impl ThreadRegistry
{
    fn register(&self, shared: Arc<EngineShared>)
    {
        if let Ok(mut engines) = self.engines.write() {
            engines.push(shared);
        }
    }

    pub(crate) fn get(&self, id: EngineId) -> Result<Arc<EngineShared>>
    {
        let engines = self
            .engines
            .read()
            .map_err(|_| StepwiseError::internal("thread registry poisoned"))?;
        engines.get(id.0).cloned().ok_or(StepwiseError::NoTarget)
    }

    pub(crate) fn all(&self) -> Vec<(EngineId, Arc<EngineShared>)>
    {
        self.engines.read().map_or_else(
            |_| Vec::new(),
            |engines| {
                engines
                    .iter()
                    .enumerate()
                    .map(|(index, shared)| (EngineId(index), Arc::clone(shared)))
                    .collect()
            },
        )
    }

    pub(crate) fn find(&self, tid: ThreadId) -> Option<EngineId>
    {
        let engines = self.engines.read().ok()?;
        engines.iter().position(|shared| shared.tid() == tid).map(EngineId)
    }
}

// -------------------------------------------------------------------------
// Client side
// -------------------------------------------------------------------------

/// Client handle on the event loop of one process.
#[derive(Debug)]
pub struct ThreadManager
{
    pid: ProcessId,
    requests: Sender<Request>,
    registry: Arc<ThreadRegistry>,
    command_mutex: CommandMutex,
    loop_thread: Mutex<Option<JoinHandle<()>>>,
    loop_id: thread::ThreadId,
}

impl ThreadManager
{
    /// Start the event-loop thread, create the target on it and register
    /// one engine per initial thread.
    pub(crate) fn start(bootstrap: Bootstrap, context: EngineContext) -> Result<Self>
    {
        let (requests, receiver) = mpsc::channel();
        let registry = Arc::new(ThreadRegistry::default());
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let loop_registry = Arc::clone(&registry);
        let handle = thread::Builder::new()
            .name("stepwise-events".to_string())
            .spawn(move || {
                let (inferiors, source) = match bootstrap() {
                    Ok(target) => target,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let Some(pid) = inferiors.first().map(|inferior| inferior.pid()) else {
                    let _ = ready_tx.send(Err(StepwiseError::CannotStartTarget("target has no threads".to_string())));
                    return;
                };
                let event_loop = EventLoop::new(inferiors, source, Arc::new(context), loop_registry, receiver);
                let _ = ready_tx.send(Ok(pid));
                event_loop.run();
            })?;

        let loop_id = handle.thread().id();
        let pid = ready_rx
            .recv()
            .map_err(|_| StepwiseError::CannotStartTarget("event loop terminated during start-up".to_string()))??;
        info!(%pid, threads = registry.all().len(), "target ready");

        Ok(Self {
            pid,
            requests,
            registry,
            command_mutex: CommandMutex::default(),
            loop_thread: Mutex::new(Some(handle)),
            loop_id,
        })
    }

    /// Process id of the target.
    #[must_use]
    pub fn pid(&self) -> ProcessId
    {
        self.pid
    }

    pub(crate) fn registry(&self) -> &Arc<ThreadRegistry>
    {
        &self.registry
    }

    /// Take the command mutex. Commands issued from the event-loop thread
    /// itself (a breakpoint predicate, for example) are re-entrant and
    /// rejected.
    pub(crate) fn acquire_command_mutex(&self) -> Result<CommandGuard<'_>>
    {
        if thread::current().id() == self.loop_id {
            return Err(StepwiseError::AlreadyRunning);
        }
        self.command_mutex.lock()
    }

    fn send(&self, request: Request) -> Result<()>
    {
        self.requests.send(request).map_err(|_| StepwiseError::NoTarget)
    }

    /// Run `job` on the event loop and wait for its result.
    pub(crate) fn execute<R, F>(&self, job: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut EventLoop) -> Result<R> + Send + 'static,
    {
        let _guard = self.acquire_command_mutex()?;
        let (reply, result) = mpsc::sync_channel(1);
        self.send(Request::Job(Box::new(move |event_loop| {
            let _ = reply.send(job(event_loop));
        })))?;
        result.recv().map_err(|_| StepwiseError::NoTarget)?
    }

    /// Run `job` against one engine on the event loop.
    pub(crate) fn with_engine<R, F>(&self, id: EngineId, job: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut SteppingEngine, &mut dyn EngineHost) -> Result<R> + Send + 'static,
    {
        self.execute(move |event_loop| event_loop.with_engine(id, job))
    }

    /// Claim `id` for an asynchronous operation and start it.
    ///
    /// Returns the channel the operation's result arrives on.
    ///
    /// ## Errors
    ///
    /// `NotStopped` if an operation is already in flight on the thread;
    /// whatever the engine reports while starting the operation.
    pub(crate) fn start_operation(
        &self,
        id: EngineId,
        operation: Operation,
    ) -> Result<Receiver<Result<OperationResult>>>
    {
        let shared = self.registry.get(id)?;
        let _guard = self.acquire_command_mutex()?;
        if !shared.try_begin() {
            return Err(StepwiseError::NotStopped);
        }

        let (done, completion) = mpsc::sync_channel(1);
        let (ack, started) = mpsc::sync_channel(1);
        let sent = self.send(Request::Job(Box::new(move |event_loop| {
            let result = event_loop.with_engine(id, move |engine, host| {
                engine.start_operation(host, operation, Some(done))
            });
            let _ = ack.send(result);
        })));

        let result = sent.and_then(|()| started.recv().map_err(|_| StepwiseError::NoTarget)?);
        if let Err(e) = result {
            shared.end();
            return Err(e);
        }
        Ok(completion)
    }

    /// Request a stop of `id`. Returns `false` if the thread was idle.
    pub(crate) fn stop(&self, id: EngineId) -> Result<bool>
    {
        self.with_engine(id, |engine, host| engine.request_stop(host))
    }

    /// Stop every thread of the process.
    pub(crate) fn acquire_global_lock(&self) -> Result<()>
    {
        let _guard = self.acquire_command_mutex()?;
        let (reply, result) = mpsc::sync_channel(1);
        self.send(Request::AcquireLock(reply))?;
        result.recv().map_err(|_| StepwiseError::NoTarget)?
    }

    /// Undo [`ThreadManager::acquire_global_lock`].
    pub(crate) fn release_global_lock(&self) -> Result<()>
    {
        let _guard = self.acquire_command_mutex()?;
        let (reply, result) = mpsc::sync_channel(1);
        self.send(Request::ReleaseLock(reply))?;
        result.recv().map_err(|_| StepwiseError::NoTarget)?
    }
}

impl Drop for ThreadManager
{
    fn drop(&mut self)
    {
        let _ = self.requests.send(Request::Exit);
        if thread::current().id() == self.loop_id {
            return;
        }
        let handle = self.loop_thread.lock().ok().and_then(|mut handle| handle.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("event loop panicked");
            }
        }
    }
}

// -------------------------------------------------------------------------
// Event loop
// -------------------------------------------------------------------------

/// Everything the loop owns except the engines themselves, so an engine
/// taken out of its slot can borrow the rest as its host.
struct LoopCore
{
    by_tid: HashMap<ThreadId, EngineId>,
    breakpoints: BreakpointManager,
    source: Box<dyn EventSource>,
    context: Arc<EngineContext>,
    pending: VecDeque<(EngineId, ChildEvent)>,
    stashed: HashMap<ThreadId, Vec<RawStatus>>,
    lock: Option<LockOwner>,
    deferred_locks: VecDeque<SyncSender<Result<()>>>,
    subscribers: Vec<TargetEventSender>,
    registry: Arc<ThreadRegistry>,
    requests: Receiver<Request>,
    exit: bool,
}

/// State owned by the event-loop thread.
pub(crate) struct EventLoop
{
    engines: Vec<Option<SteppingEngine>>,
    core: LoopCore,
}

struct Host<'a>
{
    engines: &'a mut Vec<Option<SteppingEngine>>,
    core: &'a mut LoopCore,
}

impl EngineHost for Host<'_>
{
    fn breakpoints(&mut self) -> &mut BreakpointManager
    {
        &mut self.core.breakpoints
    }

    fn acquire_global_thread_lock(&mut self, owner: EngineId) -> Result<()>
    {
        self.core.acquire_lock(self.engines, LockOwner::Engine(owner))
    }

    fn release_global_thread_lock(&mut self, owner: EngineId) -> Result<()>
    {
        self.core.release_lock(self.engines, LockOwner::Engine(owner))
    }

    fn publish(&mut self, event: TargetEvent)
    {
        self.core.publish(event);
    }

    fn adopt_thread(&mut self, inferior: Box<dyn Inferior>)
    {
        self.core.adopt(self.engines, inferior);
    }
}

impl LoopCore
{
    fn publish(&mut self, event: TargetEvent)
    {
        trace!(event = %event.describe(), "publishing event");
        self.subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn acquire_lock(&mut self, engines: &mut [Option<SteppingEngine>], owner: LockOwner) -> Result<()>
    {
        match self.lock {
            Some(holder) if holder == owner => return Err(StepwiseError::AlreadyRunning),
            Some(holder) => {
                return Err(StepwiseError::internal(format!(
                    "global thread lock requested by {owner:?} while held by {holder:?}"
                )))
            }
            None => {}
        }
        debug!(?owner, "acquiring global thread lock");

        // Events already routed to a thread that is about to be held stay
        // with that thread until the lock is released.
        for (id, event) in std::mem::take(&mut self.pending) {
            match engines.get_mut(id.0) {
                Some(Some(engine)) if LockOwner::Engine(id) != owner => engine.defer_event(event),
                _ => self.pending.push_back((id, event)),
            }
        }

        for engine in engines.iter_mut().flatten() {
            if LockOwner::Engine(engine.id()) == owner {
                continue;
            }
            if let Err(e) = engine.lock(self.source.as_mut()) {
                warn!(thread = %engine.tid(), error = %e, "cannot stop thread for global lock");
            }
        }
        self.lock = Some(owner);
        Ok(())
    }

    fn release_lock(&mut self, engines: &mut [Option<SteppingEngine>], owner: LockOwner) -> Result<()>
    {
        if self.lock != Some(owner) {
            return Err(StepwiseError::internal(format!(
                "global thread lock released by {owner:?} but held by {:?}",
                self.lock
            )));
        }
        debug!(?owner, "releasing global thread lock");
        self.lock = None;

        for engine in engines.iter_mut().flatten() {
            if LockOwner::Engine(engine.id()) == owner {
                continue;
            }
            match engine.unlock() {
                Ok(events) => {
                    let id = engine.id();
                    self.pending.extend(events.into_iter().map(|event| (id, event)));
                }
                Err(e) => warn!(thread = %engine.tid(), error = %e, "cannot resume thread after global lock"),
            }
        }
        Ok(())
    }

    /// Create the engine for a thread the target just created.
    fn adopt(&mut self, engines: &mut Vec<Option<SteppingEngine>>, inferior: Box<dyn Inferior>)
    {
        let tid = inferior.tid();
        if self.by_tid.contains_key(&tid) {
            warn!(thread = %tid, "thread announced twice");
            return;
        }
        let id = EngineId(engines.len());
        let mut engine = SteppingEngine::new_background(id, inferior, Arc::clone(&self.context));
        info!(thread = %tid, engine = id.0, "new thread");

        // Stashed statuses are consumed first: the thread may already sit
        // in its initial stop, and holding it must not wait for another.
        let held = self.lock.is_some();
        for status in self.stashed.remove(&tid).unwrap_or_default() {
            match engine.interpret(status) {
                Ok(Some(event)) if held => engine.defer_event(event),
                Ok(Some(event)) => self.pending.push_back((id, event)),
                Ok(None) => {}
                Err(e) => warn!(thread = %tid, error = %e, "cannot interpret stashed event"),
            }
        }

        if held {
            if let Err(e) = engine.lock(self.source.as_mut()) {
                warn!(thread = %tid, error = %e, "cannot hold new thread for global lock");
            }
        }

        self.registry.register(Arc::clone(engine.shared()));
        self.by_tid.insert(tid, id);
        engines.push(Some(engine));
        self.publish(TargetEvent::ThreadCreated { thread: tid });
    }
}

impl EventLoop
{
    fn new(
        inferiors: Vec<Box<dyn Inferior>>,
        source: Box<dyn EventSource>,
        context: Arc<EngineContext>,
        registry: Arc<ThreadRegistry>,
        requests: Receiver<Request>,
    ) -> Self
    {
        let mut engines = Vec::with_capacity(inferiors.len());
        let mut by_tid = HashMap::new();
        for inferior in inferiors {
            let id = EngineId(engines.len());
            let engine = SteppingEngine::new(id, inferior, Arc::clone(&context));
            registry.register(Arc::clone(engine.shared()));
            by_tid.insert(engine.tid(), id);
            engines.push(Some(engine));
        }

        Self {
            engines,
            core: LoopCore {
                by_tid,
                breakpoints: BreakpointManager::new(),
                source,
                context,
                pending: VecDeque::new(),
                stashed: HashMap::new(),
                lock: None,
                deferred_locks: VecDeque::new(),
                subscribers: Vec::new(),
                registry,
                requests,
                exit: false,
            },
        }
    }

    /// Take engine `id` out of its slot and run `job` with the rest of the
    /// loop as host.
    pub(crate) fn with_engine<R>(
        &mut self,
        id: EngineId,
        job: impl FnOnce(&mut SteppingEngine, &mut dyn EngineHost) -> Result<R>,
    ) -> Result<R>
    {
        let mut engine = self
            .engines
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or(StepwiseError::NoTarget)?;
        let result = {
            let mut host = Host {
                engines: &mut self.engines,
                core: &mut self.core,
            };
            job(&mut engine, &mut host)
        };
        self.engines[id.0] = Some(engine);
        result
    }

    fn engine_ids(&self) -> Vec<EngineId>
    {
        (0..self.engines.len()).map(EngineId).collect()
    }

    fn any_running(&self) -> bool
    {
        self.engines.iter().flatten().any(SteppingEngine::is_running)
    }

    fn any_alive(&self) -> bool
    {
        self.engines.iter().flatten().any(SteppingEngine::is_alive)
    }

    /// Subscribe to target events.
    pub(crate) fn subscribe(&mut self, subscriber: TargetEventSender)
    {
        self.core.subscribers.push(subscriber);
    }

    fn run(mut self)
    {
        info!(threads = self.engines.len(), "event loop started");
        while !self.core.exit {
            if let Some((id, event)) = self.core.pending.pop_front() {
                self.dispatch(id, event);
                continue;
            }

            if self.core.lock.is_none() {
                if let Some(reply) = self.core.deferred_locks.pop_front() {
                    let result = self.acquire_client_lock();
                    let _ = reply.send(result);
                    continue;
                }
            }

            if self.any_running() {
                match self.core.requests.try_recv() {
                    Ok(request) => {
                        self.handle(request);
                        continue;
                    }
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => break,
                }
                let poll = self.core.context.options.poll_interval;
                self.wait_once(Some(poll));
            } else {
                match self.core.requests.recv() {
                    Ok(request) => self.handle(request),
                    Err(_) => break,
                }
            }
        }
        self.release_target();
        info!("event loop stopped");
    }

    fn handle(&mut self, request: Request)
    {
        match request {
            Request::Job(job) => job(self),
            Request::AcquireLock(reply) => {
                if matches!(self.core.lock, Some(LockOwner::Engine(_))) {
                    trace!("client lock request deferred until step-over completes");
                    self.core.deferred_locks.push_back(reply);
                } else {
                    let result = self.acquire_client_lock();
                    let _ = reply.send(result);
                }
            }
            Request::ReleaseLock(reply) => {
                let result = self.core.release_lock(&mut self.engines, LockOwner::Client);
                let _ = reply.send(result);
            }
            Request::Exit => self.core.exit = true,
        }
    }

    fn acquire_client_lock(&mut self) -> Result<()>
    {
        self.core.acquire_lock(&mut self.engines, LockOwner::Client)
    }

    /// Wait once for a target event and route it.
    fn wait_once(&mut self, timeout: Option<Duration>) -> bool
    {
        match self.core.source.wait(None, timeout) {
            Ok(Some(raw)) => {
                self.route(raw);
                true
            }
            Ok(None) => false,
            Err(StepwiseError::NoTarget) => {
                debug!("no traced threads left");
                self.forget_running();
                false
            }
            Err(e) => {
                error!(error = %e, "waiting for target events failed");
                false
            }
        }
    }

    fn route(&mut self, raw: RawEvent)
    {
        trace!(thread = %raw.tid, status = ?raw.status, "wait event");
        let Some(&id) = self.core.by_tid.get(&raw.tid) else {
            debug!(thread = %raw.tid, status = ?raw.status, "event for an unannounced thread stashed");
            self.core.stashed.entry(raw.tid).or_default().push(raw.status);
            return;
        };
        let routed = self.with_engine(id, |engine, host| {
            engine.handle_raw(host, raw.status);
            Ok(())
        });
        if let Err(e) = routed {
            warn!(thread = %raw.tid, error = %e, "cannot route wait event");
        }
    }

    fn dispatch(&mut self, id: EngineId, event: ChildEvent)
    {
        let dispatched = self.with_engine(id, |engine, host| {
            engine.deliver(host, event);
            Ok(())
        });
        if let Err(e) = dispatched {
            warn!(engine = id.0, error = %e, "cannot dispatch queued event");
        }
    }

    /// The OS reports nothing left to wait for: every engine still running
    /// lost its target.
    fn forget_running(&mut self)
    {
        for id in self.engine_ids() {
            let _ = self.with_engine(id, |engine, host| {
                if engine.is_running() {
                    engine.report_killed(host);
                }
                Ok(())
            });
        }
    }

    /// Kill the process. Every engine still alive reports one
    /// `TargetExited` event.
    pub(crate) fn kill(&mut self) -> Result<()>
    {
        let Some(id) = self.first_alive() else {
            return Ok(());
        };
        info!("killing target");
        self.with_engine(id, |engine, _| engine.kill_process())?;
        self.mark_killed();
        Ok(())
    }

    fn mark_killed(&mut self)
    {
        self.core.lock = None;
        for reply in self.core.deferred_locks.drain(..) {
            let _ = reply.send(Err(StepwiseError::NoTarget));
        }
        for id in self.engine_ids() {
            let _ = self.with_engine(id, |engine, host| {
                engine.report_killed(host);
                Ok(())
            });
        }
        self.core.pending.clear();
        self.core.stashed.clear();
        self.core.breakpoints.clear();

        let poll = self.core.context.options.poll_interval;
        for _ in 0..KILL_DRAIN_LIMIT {
            match self.core.source.wait(None, Some(poll)) {
                Ok(Some(raw)) => trace!(thread = %raw.tid, status = ?raw.status, "discarding event of killed target"),
                Ok(None) | Err(_) => break,
            }
        }
    }

    /// Ask the process to terminate and wait for it to go away, killing it
    /// if it does not within the grace period.
    pub(crate) fn shutdown(&mut self) -> Result<()>
    {
        let Some(id) = self.first_alive() else {
            return Ok(());
        };
        info!("terminating target");
        self.with_engine(id, |engine, _| engine.terminate_process())?;
        if self.core.lock == Some(LockOwner::Client) {
            self.core.release_lock(&mut self.engines, LockOwner::Client)?;
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while self.any_alive() && Instant::now() < deadline {
            self.keep_threads_running();
            if let Some((id, event)) = self.core.pending.pop_front() {
                self.dispatch(id, event);
                continue;
            }
            let poll = self.core.context.options.poll_interval;
            self.wait_once(Some(poll));
        }

        if self.any_alive() {
            warn!("target ignored the termination request");
            return self.kill();
        }
        Ok(())
    }

    /// Resume idle threads in the background so a pending signal reaches
    /// them.
    fn keep_threads_running(&mut self)
    {
        for id in self.engine_ids() {
            let _ = self.with_engine(id, |engine, host| {
                if engine.is_alive() && !engine.has_operation() && engine.shared().try_begin() {
                    let operation = Operation::new(OperationKind::RunInBackground { until: None });
                    if let Err(e) = engine.start_operation(host, operation, None) {
                        debug!(thread = %engine.tid(), error = %e, "cannot resume thread");
                    }
                }
                Ok(())
            });
        }
    }

    /// Remove every breakpoint and release all threads.
    pub(crate) fn detach(&mut self) -> Result<()>
    {
        if self.first_alive().is_none() {
            return Err(StepwiseError::NoTarget);
        }
        info!("detaching from target");
        self.release_target();
        Ok(())
    }

    fn release_target(&mut self)
    {
        if self.first_alive().is_none() {
            return;
        }
        if self.core.lock.is_none() {
            if let Err(e) = self.acquire_client_lock() {
                warn!(error = %e, "cannot stop threads before detaching");
            }
        }
        for id in self.engine_ids() {
            let _ = self.with_engine(id, |engine, _| {
                if engine.is_alive() {
                    if let Err(e) = engine.detach() {
                        warn!(thread = %engine.tid(), error = %e, "detach failed");
                    }
                }
                Ok(())
            });
        }
        self.core.lock = None;
        for reply in self.core.deferred_locks.drain(..) {
            let _ = reply.send(Err(StepwiseError::NoTarget));
        }
        self.core.pending.clear();
        self.core.breakpoints.clear();
    }

    fn first_alive(&self) -> Option<EngineId>
    {
        self.engines
            .iter()
            .flatten()
            .find(|engine| engine.is_alive())
            .map(SteppingEngine::id)
    }
}
