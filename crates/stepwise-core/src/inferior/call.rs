//! Injected function calls.
//!
//! To run a function inside the target (a runtime's compile or invoke
//! entry point, or any method the user asks for) the thread's registers
//! are saved, a System V call frame is built on its stack and the return
//! address is pointed at a trap owned by the inferior. When that trap fires
//! the result registers are captured and the saved registers restored, and
//! the inferior reports a callback event instead of a breakpoint.

use super::traps::TrapId;
use crate::error::{Result, StepwiseError};
use crate::types::{Address, Registers, X86_64Register as Reg};

/// Size of the area below the stack pointer a leaf function may use
/// without adjusting it.
const RED_ZONE: u64 = 128;

const ARGUMENT_REGISTERS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

/// One argument of an injected call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallArgument
{
    /// Passed in a register as is.
    Word(u64),
    /// Copied onto the target's stack; the register receives its address.
    Bytes(Vec<u8>),
}

impl CallArgument
{
    /// A NUL-terminated string argument.
    pub fn string(value: &str) -> Self
    {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        Self::Bytes(bytes)
    }
}

/// An injected call that has not returned yet.
#[derive(Debug, Clone)]
pub struct InjectedCall
{
    /// Caller-chosen id reported back with the result.
    pub callback: u64,
    /// Registers to restore when the call returns.
    pub saved: Registers,
    /// Where the callee returns to.
    pub return_address: Address,
    /// Stack pointer the callee returns with.
    pub return_sp: Address,
    /// Trap at `return_address`.
    pub trap: TrapId,
}

/// Registers and stack writes that set up one call.
#[derive(Debug, Clone)]
pub struct CallFrame
{
    /// Register file to install before resuming.
    pub registers: Registers,
    /// Memory writes (address, bytes) to perform first.
    pub writes: Vec<(Address, Vec<u8>)>,
    /// Stack pointer after the callee's `ret`.
    pub return_sp: Address,
}

/// Build a System V call of `function` with up to six integer arguments.
///
/// ## Errors
///
/// `InvalidArgument` for more than six arguments, `InternalError` if the
/// stack pointer is unknown.
pub fn setup_call_frame(
    registers: &Registers,
    function: Address,
    args: &[CallArgument],
    return_address: Address,
) -> Result<CallFrame>
{
    if args.len() > ARGUMENT_REGISTERS.len() {
        return Err(StepwiseError::InvalidArgument(format!(
            "injected calls take at most {} arguments, got {}",
            ARGUMENT_REGISTERS.len(),
            args.len()
        )));
    }
    let sp = registers
        .x86(Reg::Rsp)
        .ok_or_else(|| StepwiseError::internal("stack pointer unknown"))?;

    let mut frame = registers.clone();
    let mut writes = Vec::new();
    let mut sp = Address::new(sp) - RED_ZONE;

    for (arg, register) in args.iter().zip(ARGUMENT_REGISTERS) {
        let value = match arg {
            CallArgument::Word(value) => *value,
            CallArgument::Bytes(bytes) => {
                let size = (bytes.len() as u64 + 7) & !7;
                sp = sp - size;
                writes.push((sp, bytes.clone()));
                sp.value()
            }
        };
        frame.set_x86(register, value);
    }

    // Entry convention: rsp + 8 is 16-byte aligned.
    sp = Address::new(sp.value() & !0xf) - 8;
    writes.push((sp, return_address.value().to_le_bytes().to_vec()));

    frame.set_x86(Reg::Rsp, sp.value());
    frame.set_x86(Reg::Rip, function.value());
    frame.set_x86(Reg::Rax, 0);
    // Keeps the kernel from restarting an interrupted system call on resume.
    frame.set_x86(Reg::OrigRax, u64::MAX);

    Ok(CallFrame {
        registers: frame,
        writes,
        return_sp: sp + 8,
    })
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_call_frame_layout()
    {
        let mut registers = Registers::x86_64();
        registers.set_x86(Reg::Rsp, 0x7ffe_1008);
        registers.set_x86(Reg::Rip, 0x40_1000);

        let frame = setup_call_frame(
            &registers,
            Address::new(0x40_2000),
            &[CallArgument::Word(7), CallArgument::string("hi")],
            Address::new(0x40_0000),
        )
        .unwrap();

        let sp = frame.registers.x86(Reg::Rsp).unwrap();
        assert_eq!((sp + 8) % 16, 0);
        assert_eq!(frame.return_sp, Address::new(sp + 8));
        assert_eq!(frame.registers.x86(Reg::Rip), Some(0x40_2000));
        assert_eq!(frame.registers.x86(Reg::Rdi), Some(7));

        let string_at = frame.registers.x86(Reg::Rsi).unwrap();
        assert!(string_at < 0x7ffe_1008 - RED_ZONE);
        assert_eq!(frame.writes[0], (Address::new(string_at), b"hi\0".to_vec()));
        assert_eq!(frame.writes[1], (Address::new(sp), 0x40_0000u64.to_le_bytes().to_vec()));
    }

    #[test]
    fn test_too_many_arguments()
    {
        let mut registers = Registers::x86_64();
        registers.set_x86(Reg::Rsp, 0x1000);
        let args = vec![CallArgument::Word(0); 7];
        assert!(matches!(
            setup_call_frame(&registers, Address::new(1), &args, Address::new(2)),
            Err(StepwiseError::InvalidArgument(_))
        ));
    }
}
