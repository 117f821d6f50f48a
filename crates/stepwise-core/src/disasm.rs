//! Instruction lengths.
//!
//! The stepping engine decodes calls itself; the disassembler answers how
//! long an arbitrary instruction is, and whether it is a call at all when
//! the architecture cannot work out where the call goes.

use std::fmt;

use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction};

use crate::arch::MemoryAccess;
use crate::error::{Result, StepwiseError};
use crate::types::Address;

/// Longest x86 instruction.
const MAX_INSTRUCTION_SIZE: usize = 15;

/// Instruction-length oracle.
pub trait Disassembler: Send + Sync + fmt::Debug
{
    /// Encoded length of the instruction at `address`.
    fn instruction_size(&self, memory: &dyn MemoryAccess, address: Address) -> Result<usize>;

    /// Length of the instruction at `address` if it is a call of any kind,
    /// `None` otherwise.
    ///
    /// ## Errors
    ///
    /// Returns an error if the code cannot be read or decoded.
    fn call_size(&self, memory: &dyn MemoryAccess, address: Address) -> Result<Option<usize>>;
}

/// x86-64 decoder backed by `iced-x86`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IcedDisassembler;

impl IcedDisassembler
{
    /// Read as many code bytes as are mapped, up to one instruction.
    fn fetch(memory: &dyn MemoryAccess, address: Address) -> Result<Vec<u8>>
    {
        let mut len = MAX_INSTRUCTION_SIZE;
        loop {
            match memory.read_bytes(address, len) {
                Ok(bytes) => return Ok(bytes),
                Err(err) if len == 1 => return Err(err),
                Err(_) => len -= 1,
            }
        }
    }

    fn decode(memory: &dyn MemoryAccess, address: Address) -> Result<Instruction>
    {
        let bytes = Self::fetch(memory, address)?;
        let mut decoder = Decoder::with_ip(64, &bytes, address.value(), DecoderOptions::NONE);
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(StepwiseError::internal(format!("cannot decode instruction at {address}")));
        }
        Ok(instruction)
    }
}

impl Disassembler for IcedDisassembler
{
    fn instruction_size(&self, memory: &dyn MemoryAccess, address: Address) -> Result<usize>
    {
        Ok(Self::decode(memory, address)?.len())
    }

    fn call_size(&self, memory: &dyn MemoryAccess, address: Address) -> Result<Option<usize>>
    {
        let instruction = Self::decode(memory, address)?;
        Ok(match instruction.flow_control() {
            FlowControl::Call | FlowControl::IndirectCall => Some(instruction.len()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    struct Code(Vec<u8>);

    impl MemoryAccess for Code
    {
        fn read_bytes(&self, address: Address, len: usize) -> Result<Vec<u8>>
        {
            let start = address.value() as usize;
            self.0
                .get(start..start + len)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| StepwiseError::memory(address, "out of range"))
        }
    }

    #[test]
    fn test_instruction_sizes()
    {
        // push rbp; mov rbp,rsp; call rel32; ret
        let code = Code(vec![0x55, 0x48, 0x89, 0xe5, 0xe8, 0, 0, 0, 0, 0xc3]);
        let disasm = IcedDisassembler;
        assert_eq!(disasm.instruction_size(&code, Address::new(0)).unwrap(), 1);
        assert_eq!(disasm.instruction_size(&code, Address::new(1)).unwrap(), 3);
        assert_eq!(disasm.instruction_size(&code, Address::new(4)).unwrap(), 5);
        assert_eq!(disasm.instruction_size(&code, Address::new(9)).unwrap(), 1);
    }

    #[test]
    fn test_call_size()
    {
        // call *%fs:0x10(%rax); call *(%rax,%rbx,8); jmp *%rax; nop
        let code = Code(vec![0x64, 0xff, 0x50, 0x10, 0xff, 0x14, 0xd8, 0xff, 0xe0, 0x90]);
        let disasm = IcedDisassembler;
        assert_eq!(disasm.call_size(&code, Address::new(0)).unwrap(), Some(4));
        assert_eq!(disasm.call_size(&code, Address::new(4)).unwrap(), Some(3));
        assert_eq!(disasm.call_size(&code, Address::new(7)).unwrap(), None);
        assert_eq!(disasm.call_size(&code, Address::new(9)).unwrap(), None);
    }
}
