//! Multi-threaded targets: stepping over shared traps, the global thread
//! lock and thread creation

mod common;

use std::thread;
use std::time::Duration;

use common::{drain, start, stop_pc, symbols, Asm, SimTarget, STACK_TOP};
use stepwise_core::breakpoints::BreakpointBuilder;
use stepwise_core::error::StepwiseError;
use stepwise_core::events::TargetEvent;
use stepwise_core::types::{Address, TargetState, ThreadId};

const ENTRY: u64 = 0x1000;
const SITE: u64 = 0x1001;
const CHILD: u64 = 0x1300;

/// `nop; nop; jmp 1000`
fn load_loop(target: &SimTarget)
{
    Asm::new(ENTRY).nop().nop().jmp_short(ENTRY).load(target);
}

#[test]
fn test_step_over_keeps_other_threads_off_the_lifted_site()
{
    let target = SimTarget::new();
    load_loop(&target);
    let stepper = target.add_thread(SITE);
    let runner = target.add_thread(ENTRY);
    // The runner becomes eligible exactly when the trap is lifted.
    target.release_when_lifted(runner, SITE);

    let process = start(&target, symbols(Vec::new()));
    let a = process.thread(stepper).unwrap();
    let b = process.thread(runner).unwrap();
    let handle = a.insert_breakpoint(BreakpointBuilder::new(Address::new(SITE))).unwrap();

    let running = b.continue_execution().unwrap();
    let event = a.step_instruction().unwrap().wait().unwrap();
    assert_eq!(stop_pc(&event), Some(Address::new(SITE + 1)));

    let event = running.wait().unwrap();
    match event {
        TargetEvent::TargetHitBreakpoint { thread, handle: hit, frame } => {
            assert_eq!(thread, runner);
            assert_eq!(hit, Some(handle));
            assert_eq!(frame.map(|frame| frame.pc), Some(Address::new(SITE)));
        }
        other => panic!("unexpected {other:?}"),
    }

    // Only the stepping thread ever executed the original instruction.
    assert_eq!(target.suspended_runs(), vec![(stepper, Address::new(SITE))]);
}

#[test]
fn test_global_lock_holds_every_thread()
{
    let target = SimTarget::new();
    load_loop(&target);
    let first = target.add_thread(ENTRY);
    let second = target.add_thread(ENTRY);
    let process = start(&target, symbols(Vec::new()));
    let a = process.thread(first).unwrap();
    let b = process.thread(second).unwrap();

    b.run_in_background().unwrap();
    thread::sleep(Duration::from_millis(10));

    let guard = process.acquire_global_lock().unwrap();
    assert!(matches!(process.acquire_global_lock(), Err(StepwiseError::AlreadyRunning)));
    assert!(matches!(a.step_instruction(), Err(StepwiseError::AlreadyRunning)));

    let held = target.trace(second).len();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(target.trace(second).len(), held);
    // The operation is still in flight; the thread is only held.
    assert!(b.is_running());

    guard.release().unwrap();
    a.step_instruction().unwrap().wait().unwrap();
    thread::sleep(Duration::from_millis(20));
    assert!(target.trace(second).len() > held);

    assert!(b.interrupt().unwrap());
    assert_eq!(b.state(), TargetState::Stopped);
}

#[test]
fn test_dropping_lock_guard_releases_threads()
{
    let target = SimTarget::new();
    load_loop(&target);
    target.add_thread(ENTRY);
    let process = start(&target, symbols(Vec::new()));
    let thread = process.main_thread().unwrap();

    {
        let _guard = process.acquire_global_lock().unwrap();
        assert!(thread.step_instruction().is_err());
    }
    thread.step_instruction().unwrap().wait().unwrap();
}

#[test]
fn test_cloned_thread_is_adopted()
{
    let target = SimTarget::new();
    let child_stack = STACK_TOP - 0x8000;
    let mut main = Asm::new(ENTRY);
    main.mov_imm(0, 56)
        .mov_imm(7, CHILD as u32)
        .mov_imm(6, child_stack as u32)
        .syscall()
        .int3();
    let spin = main.here();
    main.jmp_short(spin);
    main.load(&target);
    Asm::new(CHILD).jmp_short(CHILD).load(&target);

    let parent = target.add_thread(ENTRY);
    let process = start(&target, symbols(Vec::new()));
    let events = process.subscribe().unwrap();
    let main_thread = process.main_thread().unwrap();

    let event = main_thread.continue_execution().unwrap().wait().unwrap();
    assert!(matches!(event, TargetEvent::TargetHitBreakpoint { handle: None, .. }));
    assert_eq!(stop_pc(&event), Some(Address::new(spin)));

    let child = ThreadId(parent.raw() + 1);
    assert_eq!(target.thread_count(), 2);
    assert_eq!(process.threads().len(), 2);
    let created: Vec<ThreadId> = drain(&events)
        .into_iter()
        .filter_map(|event| match event {
            TargetEvent::ThreadCreated { thread } => Some(thread),
            _ => None,
        })
        .collect();
    assert_eq!(created, vec![child]);

    // The new thread runs in the background until stopped.
    let child_thread = process.thread(child).unwrap();
    assert!(child_thread.is_running());
    assert!(child_thread.interrupt().unwrap());
    assert_eq!(child_thread.current_frame().unwrap().pc, Address::new(CHILD));
    assert_eq!(
        child_thread.get_registers().unwrap().x86(stepwise_core::types::X86_64Register::Rsp),
        Some(child_stack)
    );

    process.kill().unwrap();
    let exits = drain(&events)
        .into_iter()
        .filter(|event| matches!(event, TargetEvent::TargetExited { code: 137, .. }))
        .count();
    assert_eq!(exits, 2);
}

#[test]
fn test_exit_reported_for_every_thread()
{
    let target = SimTarget::new();
    Asm::new(ENTRY).nop().hlt().load(&target);
    Asm::new(CHILD).jmp_short(CHILD).load(&target);
    let first = target.add_thread(ENTRY);
    let second = target.add_thread(CHILD);
    let process = start(&target, symbols(Vec::new()));
    let events = process.subscribe().unwrap();

    process.thread(second).unwrap().run_in_background().unwrap();
    let event = process.thread(first).unwrap().continue_execution().unwrap().wait().unwrap();
    assert!(matches!(event, TargetEvent::TargetExited { code: 0, .. }));

    let second_thread = process.thread(second).unwrap();
    assert!(second_thread.wait(Some(Duration::from_secs(2))));
    assert_eq!(second_thread.state(), TargetState::Exited(0));

    let mut exited: Vec<ThreadId> = drain(&events)
        .into_iter()
        .filter_map(|event| match event {
            TargetEvent::TargetExited { thread, .. } => Some(thread),
            _ => None,
        })
        .collect();
    exited.sort();
    assert_eq!(exited, vec![first, second]);
}
