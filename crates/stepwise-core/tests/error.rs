//! Tests for error handling

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::types::Address;

#[test]
fn test_io_error_conversion()
{
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "maps file missing");
    let error: StepwiseError = io_err.into();

    match error {
        StepwiseError::Io(inner) => assert_eq!(inner.kind(), std::io::ErrorKind::NotFound),
        other => panic!("Expected Io variant, got {other:?}"),
    }
}

#[cfg(target_os = "linux")]
#[test]
fn test_errno_conversion()
{
    let error: StepwiseError = nix::errno::Errno::ESRCH.into();
    assert!(matches!(error, StepwiseError::Os(nix::errno::Errno::ESRCH)));
    assert!(error.to_string().contains("System call failed"));
}

#[test]
fn test_memory_error_display()
{
    let error = StepwiseError::memory(Address::new(0xdead_0000), "unmapped");
    let message = error.to_string();
    assert!(message.contains("0x00000000dead0000"), "{message}");
    assert!(message.contains("unmapped"));
}

#[test]
fn test_no_such_breakpoint_display()
{
    let message = StepwiseError::NoSuchBreakpoint(7).to_string();
    assert!(message.contains("handle 7"));
}

#[test]
fn test_state_errors_are_distinct()
{
    assert_ne!(StepwiseError::NotStopped.to_string(), StepwiseError::AlreadyRunning.to_string());
    assert!(StepwiseError::NoTarget.to_string().contains("No target"));
    assert!(StepwiseError::NoMethod.to_string().contains("method"));
}

#[test]
fn test_permission_and_argument_messages()
{
    let message = StepwiseError::NoPermission("core file".to_string()).to_string();
    assert!(message.contains("Permission denied"));
    assert!(message.contains("core file"));

    let message = StepwiseError::InvalidArgument("empty group".to_string()).to_string();
    assert!(message.contains("Invalid argument"));
    assert!(message.contains("empty group"));
}

#[test]
fn test_internal_helper()
{
    let error = StepwiseError::internal("unknown address mode");
    assert!(matches!(error, StepwiseError::InternalError(ref reason) if reason == "unknown address mode"));
}

#[test]
fn test_result_type()
{
    let _result: Result<()> = Ok(());
    let _error_result: Result<()> = Err(StepwiseError::CannotStartTarget("no such file".to_string()));
}
