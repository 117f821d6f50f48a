//! Inspection, injected calls, snapshots and process-level operations

mod common;

use std::sync::Arc;

use common::{drain, options, start, symbols, Asm, SimTarget, CALL_RETURN};
use stepwise_core::arch::X86_64;
use stepwise_core::breakpoints::BreakpointBuilder;
use stepwise_core::engine::{CallMethodData, OperationResult, RuntimeInvokeData};
use stepwise_core::error::StepwiseError;
use stepwise_core::events::TargetEvent;
use stepwise_core::inferior::SnapshotInferior;
use stepwise_core::symbols::JitTrampolineResolver;
use stepwise_core::types::{Address, Registers, TargetState, ThreadId, X86_64Register};
use stepwise_core::ProcessBuilder;

const ENTRY: u64 = 0x1000;
const ANSWER: u64 = 0x1300;
const COMPILE: u64 = 0x1400;
const COMPILED: u64 = 0x1480;
const INVOKE: u64 = 0x1500;
const THROWING_INVOKE: u64 = 0x1580;
const LOOP: u64 = 0x1600;

fn setup(pc: u64) -> (SimTarget, stepwise_core::Process)
{
    let target = SimTarget::new();
    Asm::new(ENTRY).prologue().nop().hlt().load(&target);
    // answer(): returns 42 in rax and 7 in rdx.
    Asm::new(ANSWER).mov_imm(0, 42).mov_imm(2, 7).ret().load(&target);
    // compile(method): returns the compiled code address.
    Asm::new(COMPILE).mov_imm(0, COMPILED as u32).ret().load(&target);
    // invoke(method, object, params): returns an object, no exception.
    Asm::new(INVOKE).mov_imm(0, 0x99).mov_imm(2, 0).ret().load(&target);
    Asm::new(THROWING_INVOKE).mov_imm(0, 0).mov_imm(2, 0x2000).ret().load(&target);
    Asm::new(LOOP).jmp_short(LOOP).load(&target);
    target.add_thread(pc);
    let process = start(&target, symbols(Vec::new()));
    (target, process)
}

fn invoke_data(resolver: JitTrampolineResolver) -> RuntimeInvokeData
{
    RuntimeInvokeData {
        resolver: Arc::new(resolver),
        method: Address::new(0x5000_0000),
        object: Address::ZERO,
        params: vec![Address::new(0x6000_0000)],
    }
}

#[test]
fn test_call_method_returns_registers_and_restores_state()
{
    let (target, process) = setup(ENTRY);
    let thread = process.main_thread().unwrap();
    let before = thread.get_registers().unwrap();
    let events = process.subscribe().unwrap();

    let data = CallMethodData::LongLong {
        method: Address::new(ANSWER),
        argument1: 1,
        argument2: 2,
    };
    match thread.call_method(data).unwrap().wait().unwrap() {
        OperationResult::Call { data1, data2 } => {
            assert_eq!(data1, 42);
            assert_eq!(data2, 7);
        }
        other => panic!("unexpected {other:?}"),
    }

    let after = thread.get_registers().unwrap();
    assert_eq!(after.x86(X86_64Register::Rip), before.x86(X86_64Register::Rip));
    assert_eq!(after.x86(X86_64Register::Rsp), before.x86(X86_64Register::Rsp));
    // The return trap is gone.
    assert_eq!(target.raw_bytes(CALL_RETURN, 1), vec![0x90]);
    assert!(drain(&events)
        .iter()
        .any(|event| matches!(event, TargetEvent::FrameChanged { .. })));

    // The thread can still step normally.
    thread.step_instruction().unwrap().wait().unwrap();
    assert_eq!(target.pc(thread.tid()), Address::new(ENTRY + 1));
}

#[test]
fn test_call_method_copies_string_argument()
{
    let (_target, process) = setup(ENTRY);
    let thread = process.main_thread().unwrap();

    let data = CallMethodData::LongString {
        method: Address::new(ANSWER),
        argument: 5,
        string: "hello".to_string(),
    };
    let result = thread.call_method(data).unwrap().wait().unwrap();
    assert!(matches!(result, OperationResult::Call { data1: 42, .. }));
}

#[test]
fn test_runtime_invoke_compiles_then_invokes()
{
    let (_target, process) = setup(ENTRY);
    let thread = process.main_thread().unwrap();
    let resolver = JitTrampolineResolver::new("jit", Address::new(0x4000))
        .with_compile_method(Address::new(COMPILE))
        .with_runtime_invoke(Address::new(INVOKE));

    match thread.runtime_invoke(invoke_data(resolver)).unwrap().wait().unwrap() {
        OperationResult::Invoke { result, exception } => {
            assert_eq!(result, Address::new(0x99));
            assert_eq!(exception, None);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(thread.current_frame().unwrap().pc, Address::new(ENTRY));
}

#[test]
fn test_runtime_invoke_reports_exception()
{
    let (_target, process) = setup(ENTRY);
    let thread = process.main_thread().unwrap();
    let resolver =
        JitTrampolineResolver::new("jit", Address::new(0x4000)).with_runtime_invoke(Address::new(THROWING_INVOKE));

    let result = thread.runtime_invoke(invoke_data(resolver)).unwrap().wait().unwrap();
    assert!(matches!(
        result,
        OperationResult::Invoke {
            exception: Some(address),
            ..
        } if address == Address::new(0x2000)
    ));
}

#[test]
fn test_runtime_invoke_without_entry_point_fails()
{
    let (_target, process) = setup(ENTRY);
    let thread = process.main_thread().unwrap();
    let resolver = JitTrampolineResolver::new("jit", Address::new(0x4000));

    let error = thread.runtime_invoke(invoke_data(resolver)).unwrap_err();
    assert!(matches!(error, StepwiseError::InvalidArgument(_)));
    assert_eq!(thread.state(), TargetState::Stopped);
}

#[test]
fn test_set_registers_changes_frame()
{
    let (_target, process) = setup(ENTRY);
    let thread = process.main_thread().unwrap();
    let events = process.subscribe().unwrap();

    let mut registers = Registers::x86_64();
    registers.set_x86(X86_64Register::Rip, ENTRY + 4);
    thread.set_registers(registers).unwrap();

    assert_eq!(thread.current_frame().unwrap().pc, Address::new(ENTRY + 4));
    // Untouched registers keep their values.
    assert!(thread.get_registers().unwrap().x86(X86_64Register::Rsp).is_some_and(|sp| sp != 0));
    let changed = drain(&events).into_iter().find_map(|event| match event {
        TargetEvent::FrameChanged { frame, .. } => frame.map(|frame| frame.pc),
        _ => None,
    });
    assert_eq!(changed, Some(Address::new(ENTRY + 4)));
}

#[test]
fn test_instruction_size_and_memory_maps()
{
    let (_target, process) = setup(ENTRY);
    let thread = process.main_thread().unwrap();

    assert_eq!(thread.instruction_size(Address::new(ENTRY)).unwrap(), 1);
    assert_eq!(thread.instruction_size(Address::new(ENTRY + 1)).unwrap(), 3);

    let maps = process.memory_maps().unwrap();
    assert_eq!(maps.len(), 2);
    assert!(maps.iter().any(|region| region.contains(Address::new(ENTRY)) && region.is_executable()));
    assert!(matches!(
        thread.read_memory(Address::new(0x10), 1),
        Err(StepwiseError::TargetMemoryError { .. })
    ));
}

#[test]
fn test_detach_removes_traps()
{
    let (target, process) = setup(ENTRY);
    let thread = process.main_thread().unwrap();
    thread.insert_breakpoint(BreakpointBuilder::new(Address::new(ENTRY + 4))).unwrap();
    assert_eq!(target.raw_bytes(ENTRY + 4, 1), vec![0xcc]);

    process.detach().unwrap();
    assert_eq!(target.raw_bytes(ENTRY + 4, 1), vec![0x90]);
    assert_eq!(thread.state(), TargetState::NoTarget);
    assert!(matches!(process.detach(), Err(StepwiseError::NoTarget)));
}

#[test]
fn test_shutdown_terminates_running_target()
{
    let (_target, process) = setup(LOOP);
    let thread = process.main_thread().unwrap();
    let events = process.subscribe().unwrap();
    thread.run_in_background().unwrap();

    process.shutdown().unwrap();
    assert_eq!(thread.state(), TargetState::Signaled(15));
    assert!(drain(&events)
        .iter()
        .any(|event| matches!(event, TargetEvent::TargetSignaled { signal: 15, .. })));
}

#[test]
fn test_snapshot_is_read_only()
{
    let mut registers = Registers::from_values(&[0; X86_64Register::COUNT]);
    registers.set_x86(X86_64Register::Rip, ENTRY);
    registers.set_x86(X86_64Register::Rsp, 0x2008);
    let threads = SnapshotInferior::builder(77)
        .segment(Address::new(ENTRY), vec![0x55, 0x48, 0x89, 0xe5, 0x90, 0xc3, 0, 0, 0, 0, 0, 0], None)
        .segment(Address::new(0x2000), vec![0; 32], Some("[stack]".to_string()))
        .thread(ThreadId(77), registers)
        .build()
        .unwrap();
    let process = ProcessBuilder::new(options())
        .symbols(symbols(Vec::new()))
        .architecture(Arc::new(X86_64))
        .without_elf_symbols()
        .snapshot(threads)
        .unwrap();
    let thread = process.main_thread().unwrap();

    assert_eq!(thread.state(), TargetState::CoreFile);
    assert_eq!(thread.read_memory(Address::new(ENTRY), 1).unwrap(), vec![0x55]);
    assert_eq!(thread.current_frame().unwrap().pc, Address::new(ENTRY));
    assert!(matches!(thread.step_instruction(), Err(StepwiseError::NoPermission(_))));
    assert!(matches!(thread.continue_execution(), Err(StepwiseError::NoPermission(_))));
    assert!(matches!(
        thread.write_memory(Address::new(ENTRY), &[0x90]),
        Err(StepwiseError::NoPermission(_))
    ));
    assert!(thread
        .insert_breakpoint(BreakpointBuilder::new(Address::new(ENTRY)))
        .is_err());
    assert_eq!(thread.get_registers().unwrap().x86(X86_64Register::Rip), Some(ENTRY));
}
