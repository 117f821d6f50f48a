//! x86-64 backend.
//!
//! Instruction recognition here is deliberately narrow: only the encodings
//! that matter for stepping decisions are decoded by hand (calls, jumps,
//! returns, `syscall`, the push/mov prologue). Instruction lengths for
//! everything else come from the disassembler collaborator.

use tracing::{trace, warn};

use super::{Architecture, CallTarget, MemoryAccess};
use crate::error::{Result, StepwiseError};
use crate::types::{Address, Registers, X86_64Register as Reg};

/// `mov $15, %rax; syscall` (`rt_sigreturn`), the body of `__restore_rt`.
const SIGRETURN_CODE: [u8; 9] = [0x48, 0xc7, 0xc0, 0x0f, 0x00, 0x00, 0x00, 0x0f, 0x05];

/// Offset of `uc_mcontext` from the stack pointer inside the signal
/// trampoline (`uc_flags`, `uc_link` and `uc_stack` precede it).
const SIGCONTEXT_OFFSET: u64 = 0x28;

/// Layout of the general-purpose part of `struct sigcontext`.
const SIGCONTEXT_LAYOUT: [Reg; 18] = [
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
    Reg::Rdi,
    Reg::Rsi,
    Reg::Rbp,
    Reg::Rbx,
    Reg::Rdx,
    Reg::Rax,
    Reg::Rcx,
    Reg::Rsp,
    Reg::Rip,
    Reg::Eflags,
];

/// Registers preserved across calls by the System V ABI.
const CALLEE_SAVED: [Reg; 6] = [Reg::Rbx, Reg::Rbp, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

const MAX_PROLOGUE_SIZE: usize = 50;

/// Longest branch decoded here: two prefixes, REX, opcode, ModRM, SIB and
/// disp32, rounded up.
const MAX_BRANCH_SIZE: usize = 16;

/// Length of a runtime trampoline stub: 9 bytes of preamble, `push imm32`
/// carrying the method descriptor and `jmp rel32` to the generic
/// trampoline.
const TRAMPOLINE_STUB_SIZE: usize = 19;

/// The x86-64 instruction set.
#[derive(Debug, Clone, Copy, Default)]
pub struct X86_64;

fn le_i32(bytes: &[u8], at: usize) -> Option<i32>
{
    let slice = bytes.get(at..at + 4)?;
    Some(i32::from_le_bytes(slice.try_into().ok()?))
}

fn le_u32(bytes: &[u8], at: usize) -> Option<u32>
{
    let slice = bytes.get(at..at + 4)?;
    Some(u32::from_le_bytes(slice.try_into().ok()?))
}

/// Register named by a ModRM `rm` field, with or without `REX.B`.
fn modrm_register(rm: u8, rex_b: bool) -> Option<Reg>
{
    let reg = match (rex_b, rm & 7) {
        (false, 0) => Reg::Rax,
        (false, 1) => Reg::Rcx,
        (false, 2) => Reg::Rdx,
        (false, 3) => Reg::Rbx,
        (false, 4) => Reg::Rsp,
        (false, 5) => Reg::Rbp,
        (false, 6) => Reg::Rsi,
        (false, 7) => Reg::Rdi,
        (true, 0) => Reg::R8,
        (true, 1) => Reg::R9,
        (true, 2) => Reg::R10,
        (true, 3) => Reg::R11,
        (true, 4) => Reg::R12,
        (true, 5) => Reg::R13,
        (true, 6) => Reg::R14,
        (true, 7) => Reg::R15,
        _ => return None,
    };
    Some(reg)
}

/// Register pushed by `push` opcode `0x50 + n`.
fn push_register(opcode: u8, rex_b: bool) -> Option<Reg>
{
    if !(0x50..=0x57).contains(&opcode) {
        return None;
    }
    modrm_register(opcode - 0x50, rex_b)
}

/// Prefixes in front of a branch opcode.
#[derive(Debug, Clone, Copy, Default)]
struct Prefixes
{
    /// Bytes taken by the prefixes; the opcode follows.
    len: usize,
    /// `REX.B` extends the `rm` or SIB base field.
    rex_b: bool,
    /// `REX.X` extends the SIB index field.
    rex_x: bool,
    /// `fs`/`gs` override. The segment base is not in the register file.
    segment: bool,
}

/// Operand of a `0xff /2` (call) or `0xff /4` (jmp) group instruction.
struct IndirectOperand
{
    /// Register plus displacement, or the slot address for RIP-relative.
    location: Address,
    /// Whether `location` must be dereferenced to get the target.
    deref: bool,
    /// Total instruction length, prefix included.
    size: usize,
}

impl X86_64
{
    /// `int3`
    pub const BREAKPOINT: &'static [u8] = &[0xcc];

    /// Decode the ModRM operand of an `0xff` group instruction whose opcode
    /// byte sits at `code[pos]`.
    fn decode_indirect(
        code: &[u8],
        pos: usize,
        prefixes: Prefixes,
        registers: &Registers,
        pc: Address,
    ) -> Result<IndirectOperand>
    {
        let short = || StepwiseError::internal(format!("truncated indirect branch at {pc}"));
        let modrm = *code.get(pos + 1).ok_or_else(short)?;
        let mode = modrm >> 6;
        let rm = modrm & 7;

        let value = |field: u8, extended: bool| -> Result<u64> {
            let register = modrm_register(field, extended)
                .ok_or_else(|| StepwiseError::internal(format!("unknown register in modrm 0x{modrm:02x}")))?;
            registers.x86(register).ok_or_else(|| {
                StepwiseError::internal(format!("register {} unknown while decoding {pc}", register.name()))
            })
        };

        if mode == 3 {
            return Ok(IndirectOperand {
                location: Address::new(value(rm, prefixes.rex_b)?),
                deref: false,
                size: pos + 2,
            });
        }
        if prefixes.segment {
            return Err(StepwiseError::internal(format!("segment-relative indirect branch at {pc}")));
        }

        // RIP-relative: `ff 15 disp32` / `ff 25 disp32`
        if mode == 0 && rm == 5 {
            let disp = le_i32(code, pos + 2).ok_or_else(short)?;
            let size = pos + 6;
            return Ok(IndirectOperand {
                location: (pc + size as u64).offset_by(i64::from(disp)),
                deref: true,
                size,
            });
        }

        let (base, mut next) = if rm == 4 {
            let sib = *code.get(pos + 2).ok_or_else(short)?;
            let index = (sib >> 3) & 7;
            let scaled = if index == 4 && !prefixes.rex_x {
                0
            } else {
                value(index, prefixes.rex_x)?.wrapping_mul(1 << (sib >> 6))
            };

            // `mod == 0` with base 5 has no base register, only disp32.
            if mode == 0 && sib & 7 == 5 {
                let disp = le_i32(code, pos + 3).ok_or_else(short)?;
                return Ok(IndirectOperand {
                    location: Address::new(scaled).offset_by(i64::from(disp)),
                    deref: true,
                    size: pos + 7,
                });
            }
            (value(sib & 7, prefixes.rex_b)?.wrapping_add(scaled), pos + 3)
        } else {
            (value(rm, prefixes.rex_b)?, pos + 2)
        };

        let disp = match mode {
            1 => {
                let disp = i8::from_le_bytes([*code.get(next).ok_or_else(short)?]);
                next += 1;
                i64::from(disp)
            }
            2 => {
                let disp = le_i32(code, next).ok_or_else(short)?;
                next += 4;
                i64::from(disp)
            }
            _ => 0,
        };

        Ok(IndirectOperand {
            location: Address::new(base).offset_by(disp),
            deref: true,
            size: next,
        })
    }

    /// Skip branch hints, segment overrides and a trailing REX prefix.
    fn prefixes(code: &[u8]) -> Prefixes
    {
        let mut prefixes = Prefixes::default();
        while let Some(&byte) = code.get(prefixes.len) {
            match byte {
                // `notrack` and branch hints
                0x2e | 0x3e => {}
                0x64 | 0x65 => prefixes.segment = true,
                0x40..=0x4f => {
                    prefixes.rex_b = byte & 1 != 0;
                    prefixes.rex_x = byte & 2 != 0;
                    prefixes.len += 1;
                    break;
                }
                _ => break,
            }
            prefixes.len += 1;
        }
        prefixes
    }

    /// Code bytes at `pc`: enough for a prefixed SIB branch, or fewer near
    /// the end of a mapping.
    fn fetch(memory: &dyn MemoryAccess, pc: Address) -> Result<Vec<u8>>
    {
        memory
            .read_bytes(pc, MAX_BRANCH_SIZE)
            .or_else(|_| memory.read_bytes(pc, 8))
    }

    /// Caller frame for a method whose `push %rbp; mov %rsp,%rbp` has run.
    ///
    /// Restores rbp/rip/rsp from the frame record, then walks the pushes
    /// that follow the prologue (up to `offset`) and recovers every
    /// register already spilled below the saved rbp.
    fn unwind_method(
        &self,
        memory: &dyn MemoryAccess,
        registers: &Registers,
        code: &[u8],
        mut pos: usize,
        offset: usize,
    ) -> Result<Option<Registers>>
    {
        let Some(rbp) = registers.x86(Reg::Rbp).map(Address::new) else {
            return Ok(None);
        };
        if rbp.is_zero() {
            return Ok(None);
        }

        let mut caller = self.callee_saved(registers);
        caller.set_saved(Reg::Rbp.index(), memory.read_u64(rbp)?, rbp);
        caller.set_saved(Reg::Rip.index(), memory.read_u64(rbp + 8)?, rbp + 8);
        caller.set_x86(Reg::Rsp, (rbp + 16).value());

        let mut slot = rbp - 8;
        while pos < offset && pos < code.len() {
            let (rex_b, opcode, width) = match code[pos] {
                0x41 => match code.get(pos + 1) {
                    Some(&opcode) => (true, opcode, 2),
                    None => break,
                },
                opcode => (false, opcode, 1),
            };
            let Some(register) = push_register(opcode, rex_b) else {
                break;
            };
            caller.set_saved(register.index(), memory.read_u64(slot)?, slot);
            slot = slot - 8;
            pos += width;
        }

        Ok(Some(caller))
    }

    /// Prologue-aware unwinding.
    ///
    /// Knows three points in the canonical prologue: before `push %rbp`
    /// (return address on top of the stack), between the push and the
    /// `mov` (saved rbp on top, return address above it), and after the
    /// `mov` (full frame record at rbp).
    fn read_prologue(
        &self,
        memory: &dyn MemoryAccess,
        registers: &Registers,
        code: &[u8],
        offset: usize,
    ) -> Result<Option<Registers>>
    {
        let length = code.len();
        if length < 4 {
            return Ok(None);
        }

        let mut pos = 0;
        while pos < length && (code[pos] == 0x90 || code[pos] == 0xcc) {
            pos += 1;
        }
        if pos + 5 >= length {
            return Ok(None);
        }

        let Some(sp) = registers.x86(Reg::Rsp).map(Address::new) else {
            return Ok(None);
        };

        if offset <= pos {
            let mut caller = self.callee_saved(registers);
            caller.set_saved(Reg::Rip.index(), memory.read_u64(sp)?, sp);
            caller.set_x86(Reg::Rsp, (sp + 8).value());
            return Ok(Some(caller));
        }

        if code[pos] != 0x55 {
            return Ok(None);
        }
        pos += 1;

        if offset <= pos {
            let mut caller = self.callee_saved(registers);
            caller.set_saved(Reg::Rbp.index(), memory.read_u64(sp)?, sp);
            caller.set_saved(Reg::Rip.index(), memory.read_u64(sp + 8)?, sp + 8);
            caller.set_x86(Reg::Rsp, (sp + 16).value());
            return Ok(Some(caller));
        }

        let is_mov_rsp_rbp = code[pos] == 0x48
            && matches!((code.get(pos + 1), code.get(pos + 2)), (Some(0x8b), Some(0xec)) | (Some(0x89), Some(0xe5)));
        if !is_mov_rsp_rbp {
            return Ok(None);
        }
        pos += 3;

        self.unwind_method(memory, registers, code, pos, offset)
    }

    /// Plain frame-pointer chain: `[rbp]` is the caller's rbp, `[rbp+8]`
    /// the return address.
    fn unwind_frame_pointer(&self, memory: &dyn MemoryAccess, registers: &Registers) -> Result<Option<Registers>>
    {
        let Some(rbp) = registers.x86(Reg::Rbp).map(Address::new) else {
            return Ok(None);
        };
        if rbp.is_zero() {
            return Ok(None);
        }

        let mut caller = self.callee_saved(registers);
        caller.set_saved(Reg::Rbp.index(), memory.read_u64(rbp)?, rbp);
        caller.set_saved(Reg::Rip.index(), memory.read_u64(rbp + 8)?, rbp + 8);
        caller.set_x86(Reg::Rsp, (rbp + 16).value());
        Ok(Some(caller))
    }
}

impl Architecture for X86_64
{
    fn name(&self) -> &'static str
    {
        "x86_64"
    }

    fn register_count(&self) -> usize
    {
        Reg::COUNT
    }

    fn pc_register(&self) -> usize
    {
        Reg::Rip.index()
    }

    fn sp_register(&self) -> usize
    {
        Reg::Rsp.index()
    }

    fn fp_register(&self) -> usize
    {
        Reg::Rbp.index()
    }

    fn breakpoint_instruction(&self) -> &'static [u8]
    {
        Self::BREAKPOINT
    }

    fn breakpoint_pc_adjustment(&self) -> u64
    {
        1
    }

    fn max_prologue_size(&self) -> usize
    {
        MAX_PROLOGUE_SIZE
    }

    fn get_call_target(&self, memory: &dyn MemoryAccess, registers: &Registers, pc: Address) -> Result<Option<CallTarget>>
    {
        let code = Self::fetch(memory, pc)?;
        let prefixes = Self::prefixes(&code);
        let pos = prefixes.len;

        match code.get(pos) {
            Some(0xe8) => {
                let Some(disp) = le_i32(&code, pos + 1) else {
                    return Ok(None);
                };
                let size = pos + 5;
                let target = (pc + size as u64).offset_by(i64::from(disp));
                Ok(Some(CallTarget {
                    target,
                    instruction_size: size,
                }))
            }
            Some(0xff) => {
                let Some(&modrm) = code.get(pos + 1) else {
                    return Ok(None);
                };
                if modrm & 0x38 != 0x10 {
                    return Ok(None);
                }

                let operand = Self::decode_indirect(&code, pos, prefixes, registers, pc)?;
                let target = if operand.deref {
                    memory.read_address(operand.location)?
                } else {
                    operand.location
                };
                trace!(%pc, %target, "decoded indirect call");
                Ok(Some(CallTarget {
                    target,
                    instruction_size: operand.size,
                }))
            }
            _ => Ok(None),
        }
    }

    fn get_jump_target(&self, memory: &dyn MemoryAccess, registers: &Registers, pc: Address) -> Result<Option<Address>>
    {
        let code = Self::fetch(memory, pc)?;
        let prefixes = Self::prefixes(&code);
        let pos = prefixes.len;

        match code.get(pos) {
            Some(0xe9) => {
                let Some(disp) = le_i32(&code, pos + 1) else {
                    return Ok(None);
                };
                Ok(Some((pc + (pos + 5) as u64).offset_by(i64::from(disp))))
            }
            Some(0xeb) => {
                let Some(&disp) = code.get(pos + 1) else {
                    return Ok(None);
                };
                Ok(Some((pc + (pos + 2) as u64).offset_by(i64::from(disp as i8))))
            }
            Some(0xff) => {
                let Some(&modrm) = code.get(pos + 1) else {
                    return Ok(None);
                };
                if modrm & 0x38 != 0x20 {
                    return Ok(None);
                }
                let operand = Self::decode_indirect(&code, pos, prefixes, registers, pc)?;
                if operand.deref {
                    memory.read_address(operand.location).map(Some)
                } else {
                    Ok(Some(operand.location))
                }
            }
            _ => Ok(None),
        }
    }

    fn is_return_instruction(&self, memory: &dyn MemoryAccess, pc: Address) -> Result<bool>
    {
        Ok(matches!(memory.read_u8(pc)?, 0xc3 | 0xc2))
    }

    fn is_syscall_instruction(&self, memory: &dyn MemoryAccess, pc: Address) -> Result<bool>
    {
        let Some(start) = pc.checked_sub(2) else {
            return Ok(false);
        };
        Ok(memory.read_bytes(start, 2)? == [0x0f, 0x05])
    }

    fn get_trampoline(
        &self,
        memory: &dyn MemoryAccess,
        location: Address,
        generic_trampoline: Address,
    ) -> Result<Option<Address>>
    {
        let Ok(code) = memory.read_bytes(location, TRAMPOLINE_STUB_SIZE) else {
            return Ok(None);
        };

        if code.get(9) != Some(&0x68) || code.get(14) != Some(&0xe9) {
            return Ok(None);
        }
        let (Some(method_info), Some(disp)) = (le_u32(&code, 10), le_i32(&code, 15)) else {
            return Ok(None);
        };

        let destination = (location + TRAMPOLINE_STUB_SIZE as u64).offset_by(i64::from(disp));
        if destination != generic_trampoline {
            return Ok(None);
        }
        Ok(Some(Address::new(u64::from(method_info))))
    }

    fn unwind_one_frame(
        &self,
        memory: &dyn MemoryAccess,
        registers: &Registers,
        code: Option<&[u8]>,
        offset: usize,
    ) -> Result<Option<Registers>>
    {
        if let Some(code) = code {
            match self.read_prologue(memory, registers, code, offset) {
                Ok(Some(caller)) => return Ok(Some(caller)),
                Ok(None) => trace!("prologue not recognised, following frame pointer"),
                Err(err) => warn!(error = %err, "prologue walk failed, following frame pointer"),
            }
        }
        self.unwind_frame_pointer(memory, registers)
    }

    fn try_unwind_signal_frame(&self, memory: &dyn MemoryAccess, registers: &Registers) -> Result<Option<Registers>>
    {
        let (Some(pc), Some(sp)) = (registers.x86(Reg::Rip), registers.x86(Reg::Rsp)) else {
            return Ok(None);
        };
        let Ok(code) = memory.read_bytes(Address::new(pc), SIGRETURN_CODE.len()) else {
            return Ok(None);
        };
        if code != SIGRETURN_CODE {
            return Ok(None);
        }

        let base = Address::new(sp) + SIGCONTEXT_OFFSET;
        let mut interrupted = Registers::x86_64();
        for (slot, register) in SIGCONTEXT_LAYOUT.iter().enumerate() {
            let location = base + (slot as u64) * 8;
            interrupted.set_saved(register.index(), memory.read_u64(location)?, location);
        }
        Ok(Some(interrupted))
    }

    fn callee_saved(&self, registers: &Registers) -> Registers
    {
        let mut saved = Registers::new(registers.len());
        for register in CALLEE_SAVED {
            if let Some(value) = registers.x86(register) {
                saved.set_x86(register, value);
            }
        }
        saved
    }
}

#[cfg(test)]
mod tests
{
    use std::collections::BTreeMap;

    use super::*;

    /// Sparse byte-addressed memory.
    #[derive(Default)]
    struct Memory
    {
        bytes: BTreeMap<u64, u8>,
    }

    impl Memory
    {
        fn write(&mut self, address: u64, data: &[u8])
        {
            for (i, byte) in data.iter().enumerate() {
                self.bytes.insert(address + i as u64, *byte);
            }
        }

        fn write_u64(&mut self, address: u64, value: u64)
        {
            self.write(address, &value.to_le_bytes());
        }
    }

    impl MemoryAccess for Memory
    {
        fn read_bytes(&self, address: Address, len: usize) -> Result<Vec<u8>>
        {
            (0..len as u64)
                .map(|i| {
                    self.bytes
                        .get(&(address.value() + i))
                        .copied()
                        .ok_or_else(|| StepwiseError::memory(address + i, "unmapped"))
                })
                .collect()
        }
    }

    fn regs(values: &[(Reg, u64)]) -> Registers
    {
        let mut registers = Registers::x86_64();
        for (reg, value) in values {
            registers.set_x86(*reg, *value);
        }
        registers
    }

    #[test]
    fn test_direct_call_target()
    {
        let mut memory = Memory::default();
        // call +0x10
        memory.write(0x1000, &[0xe8, 0x10, 0x00, 0x00, 0x00, 0x90, 0x90, 0x90]);
        let call = X86_64
            .get_call_target(&memory, &Registers::x86_64(), Address::new(0x1000))
            .unwrap()
            .unwrap();
        assert_eq!(call.instruction_size, 5);
        assert_eq!(call.target, Address::new(0x1015));
    }

    #[test]
    fn test_backward_call_target()
    {
        let mut memory = Memory::default();
        // call -0x20
        memory.write(0x2000, &[0xe8, 0xe0, 0xff, 0xff, 0xff, 0x90, 0x90, 0x90]);
        let call = X86_64
            .get_call_target(&memory, &Registers::x86_64(), Address::new(0x2000))
            .unwrap()
            .unwrap();
        assert_eq!(call.target, Address::new(0x2005 - 0x20));
    }

    #[test]
    fn test_call_through_register()
    {
        let mut memory = Memory::default();
        // call *%rax
        memory.write(0x1000, &[0xff, 0xd0, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90]);
        let call = X86_64
            .get_call_target(&memory, &regs(&[(Reg::Rax, 0x4000)]), Address::new(0x1000))
            .unwrap()
            .unwrap();
        assert_eq!(call.instruction_size, 2);
        assert_eq!(call.target, Address::new(0x4000));
    }

    #[test]
    fn test_call_through_vtable_slot()
    {
        let mut memory = Memory::default();
        // call *0x18(%rbx)
        memory.write(0x1000, &[0xff, 0x53, 0x18, 0x90, 0x90, 0x90, 0x90, 0x90]);
        memory.write_u64(0x8018, 0x5000);
        let call = X86_64
            .get_call_target(&memory, &regs(&[(Reg::Rbx, 0x8000)]), Address::new(0x1000))
            .unwrap()
            .unwrap();
        assert_eq!(call.instruction_size, 3);
        assert_eq!(call.target, Address::new(0x5000));
    }

    #[test]
    fn test_call_through_extended_register_with_disp32()
    {
        let mut memory = Memory::default();
        // call *0x100(%r9)
        memory.write(0x1000, &[0x49, 0xff, 0x91, 0x00, 0x01, 0x00, 0x00, 0x90]);
        memory.write_u64(0x9100, 0x6000);
        let call = X86_64
            .get_call_target(&memory, &regs(&[(Reg::R9, 0x9000)]), Address::new(0x1000))
            .unwrap()
            .unwrap();
        assert_eq!(call.instruction_size, 7);
        assert_eq!(call.target, Address::new(0x6000));
    }

    #[test]
    fn test_call_through_got_slot()
    {
        let mut memory = Memory::default();
        // call *0x100(%rip)
        memory.write(0x1000, &[0xff, 0x15, 0x00, 0x01, 0x00, 0x00, 0x90, 0x90]);
        memory.write_u64(0x1106, 0x7000);
        let call = X86_64
            .get_call_target(&memory, &Registers::x86_64(), Address::new(0x1000))
            .unwrap()
            .unwrap();
        assert_eq!(call.instruction_size, 6);
        assert_eq!(call.target, Address::new(0x7000));
    }

    #[test]
    fn test_call_through_scaled_index()
    {
        let mut memory = Memory::default();
        // call *(%rax,%rbx,8)
        memory.write(0x1000, &[0xff, 0x14, 0xd8, 0x90, 0x90, 0x90, 0x90, 0x90]);
        memory.write_u64(0xa018, 0x5100);
        let call = X86_64
            .get_call_target(&memory, &regs(&[(Reg::Rax, 0xa000), (Reg::Rbx, 3)]), Address::new(0x1000))
            .unwrap()
            .unwrap();
        assert_eq!(call.instruction_size, 3);
        assert_eq!(call.target, Address::new(0x5100));
    }

    #[test]
    fn test_call_through_extended_index_with_disp8()
    {
        let mut memory = Memory::default();
        // call *-0x8(%r12,%r13,4) with a notrack prefix
        memory.write(0x1000, &[0x3e, 0x43, 0xff, 0x54, 0xac, 0xf8, 0x90, 0x90]);
        memory.write_u64(0xb008, 0x5200);
        let call = X86_64
            .get_call_target(&memory, &regs(&[(Reg::R12, 0xb000), (Reg::R13, 4)]), Address::new(0x1000))
            .unwrap()
            .unwrap();
        assert_eq!(call.instruction_size, 6);
        assert_eq!(call.target, Address::new(0x5200));
    }

    #[test]
    fn test_call_through_stack_slot_and_table()
    {
        let mut memory = Memory::default();
        // call *0x10(%rsp): SIB with no index
        memory.write(0x1000, &[0xff, 0x54, 0x24, 0x10, 0x90, 0x90, 0x90, 0x90]);
        // call *0x6000(,%rcx,8): SIB with no base
        memory.write(0x2000, &[0xff, 0x14, 0xcd, 0x00, 0x60, 0x00, 0x00, 0x90]);
        memory.write_u64(0xc010, 0x5300);
        memory.write_u64(0x6010, 0x5400);
        let registers = regs(&[(Reg::Rsp, 0xc000), (Reg::Rcx, 2)]);

        let call = X86_64.get_call_target(&memory, &registers, Address::new(0x1000)).unwrap().unwrap();
        assert_eq!(call.instruction_size, 4);
        assert_eq!(call.target, Address::new(0x5300));

        let call = X86_64.get_call_target(&memory, &registers, Address::new(0x2000)).unwrap().unwrap();
        assert_eq!(call.instruction_size, 7);
        assert_eq!(call.target, Address::new(0x5400));
    }

    #[test]
    fn test_segment_relative_call_is_internal_error()
    {
        let mut memory = Memory::default();
        // call *%fs:0x10(%rax)
        memory.write(0x1000, &[0x64, 0xff, 0x50, 0x10, 0x90, 0x90, 0x90, 0x90]);
        let err = X86_64
            .get_call_target(&memory, &regs(&[(Reg::Rax, 0)]), Address::new(0x1000))
            .unwrap_err();
        assert!(matches!(err, StepwiseError::InternalError(_)));
    }

    #[test]
    fn test_non_call_instructions()
    {
        let mut memory = Memory::default();
        // jmp *%rax is group 4, not a call
        memory.write(0x1000, &[0xff, 0xe0, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90]);
        memory.write(0x2000, &[0x90; 8]);
        let registers = regs(&[(Reg::Rax, 0x4000)]);
        assert!(X86_64
            .get_call_target(&memory, &registers, Address::new(0x1000))
            .unwrap()
            .is_none());
        assert!(X86_64
            .get_call_target(&memory, &registers, Address::new(0x2000))
            .unwrap()
            .is_none());
        assert_eq!(
            X86_64.get_jump_target(&memory, &registers, Address::new(0x1000)).unwrap(),
            Some(Address::new(0x4000))
        );
    }

    #[test]
    fn test_plt_jump_target()
    {
        let mut memory = Memory::default();
        // jmp *0x2000(%rip)
        memory.write(0x1000, &[0xff, 0x25, 0x00, 0x20, 0x00, 0x00, 0x68, 0x00]);
        memory.write_u64(0x3006, 0xdead_0000);
        assert_eq!(
            X86_64
                .get_jump_target(&memory, &Registers::x86_64(), Address::new(0x1000))
                .unwrap(),
            Some(Address::new(0xdead_0000))
        );
    }

    #[test]
    fn test_return_and_syscall()
    {
        let mut memory = Memory::default();
        memory.write(0x1000, &[0xc3, 0x0f, 0x05, 0x90]);
        assert!(X86_64.is_return_instruction(&memory, Address::new(0x1000)).unwrap());
        assert!(!X86_64.is_return_instruction(&memory, Address::new(0x1003)).unwrap());
        assert!(X86_64.is_syscall_instruction(&memory, Address::new(0x1003)).unwrap());
        assert!(!X86_64.is_syscall_instruction(&memory, Address::new(0x1002)).unwrap());
    }

    #[test]
    fn test_trampoline_stub()
    {
        let mut memory = Memory::default();
        let stub = 0x1000u64;
        let generic = 0x5000u64;
        let mut code = vec![0x90; 9];
        code.push(0x68);
        code.extend_from_slice(&0x0abc_def0u32.to_le_bytes());
        code.push(0xe9);
        let disp = (generic as i64 - (stub as i64 + 19)) as i32;
        code.extend_from_slice(&disp.to_le_bytes());
        memory.write(stub, &code);

        assert_eq!(
            X86_64
                .get_trampoline(&memory, Address::new(stub), Address::new(generic))
                .unwrap(),
            Some(Address::new(0x0abc_def0))
        );
        assert_eq!(
            X86_64
                .get_trampoline(&memory, Address::new(stub), Address::new(generic + 1))
                .unwrap(),
            None
        );
    }

    const PROLOGUE: [u8; 12] = [
        0x55, // push %rbp
        0x48, 0x89, 0xe5, // mov %rsp,%rbp
        0x53, // push %rbx
        0x41, 0x54, // push %r12
        0x90, 0x90, 0x90, 0x90, 0xc3,
    ];

    #[test]
    fn test_unwind_at_entry()
    {
        let mut memory = Memory::default();
        memory.write_u64(0x7000, 0x40_1234);
        let registers = regs(&[(Reg::Rsp, 0x7000), (Reg::Rbp, 0x7100), (Reg::Rip, 0x40_0000)]);

        let caller = X86_64
            .unwind_one_frame(&memory, &registers, Some(&PROLOGUE), 0)
            .unwrap()
            .unwrap();
        assert_eq!(caller.x86(Reg::Rip), Some(0x40_1234));
        assert_eq!(caller.x86(Reg::Rsp), Some(0x7008));
        assert_eq!(caller.x86(Reg::Rbp), Some(0x7100));
        assert!(!caller.is_valid(Reg::Rax.index()));
    }

    #[test]
    fn test_unwind_after_push_rbp()
    {
        let mut memory = Memory::default();
        memory.write_u64(0x6ff8, 0x7100);
        memory.write_u64(0x7000, 0x40_1234);
        let registers = regs(&[(Reg::Rsp, 0x6ff8), (Reg::Rbp, 0x9999), (Reg::Rip, 0x40_0001)]);

        let caller = X86_64
            .unwind_one_frame(&memory, &registers, Some(&PROLOGUE), 1)
            .unwrap()
            .unwrap();
        assert_eq!(caller.x86(Reg::Rip), Some(0x40_1234));
        assert_eq!(caller.x86(Reg::Rbp), Some(0x7100));
        assert_eq!(caller.x86(Reg::Rsp), Some(0x7008));
    }

    #[test]
    fn test_unwind_recovers_spilled_registers()
    {
        let mut memory = Memory::default();
        // frame record at rbp = 0x6ff0
        memory.write_u64(0x6ff0, 0x7100);
        memory.write_u64(0x6ff8, 0x40_1234);
        memory.write_u64(0x6fe8, 0xb0b0);
        memory.write_u64(0x6fe0, 0x1212);
        let registers = regs(&[
            (Reg::Rsp, 0x6fe0),
            (Reg::Rbp, 0x6ff0),
            (Reg::Rbx, 0x1),
            (Reg::R12, 0x2),
            (Reg::R13, 0x3),
            (Reg::Rip, 0x40_0007),
        ]);

        let caller = X86_64
            .unwind_one_frame(&memory, &registers, Some(&PROLOGUE), 7)
            .unwrap()
            .unwrap();
        assert_eq!(caller.x86(Reg::Rip), Some(0x40_1234));
        assert_eq!(caller.x86(Reg::Rbp), Some(0x7100));
        assert_eq!(caller.x86(Reg::Rsp), Some(0x7000));
        assert_eq!(caller.x86(Reg::Rbx), Some(0xb0b0));
        assert_eq!(caller.x86(Reg::R12), Some(0x1212));
        assert_eq!(caller.register(Reg::R12.index()).unwrap().saved_at(), Some(Address::new(0x6fe0)));
        // untouched callee-saved register survives, caller-saved do not
        assert_eq!(caller.x86(Reg::R13), Some(0x3));
        assert_eq!(caller.x86(Reg::Rax), None);
    }

    #[test]
    fn test_unwind_only_counts_executed_pushes()
    {
        let mut memory = Memory::default();
        memory.write_u64(0x6ff0, 0x7100);
        memory.write_u64(0x6ff8, 0x40_1234);
        memory.write_u64(0x6fe8, 0xb0b0);
        let registers = regs(&[(Reg::Rsp, 0x6fe8), (Reg::Rbp, 0x6ff0), (Reg::Rbx, 0x1), (Reg::R12, 0x2)]);

        // only `push %rbx` has run
        let caller = X86_64
            .unwind_one_frame(&memory, &registers, Some(&PROLOGUE), 5)
            .unwrap()
            .unwrap();
        assert_eq!(caller.x86(Reg::Rbx), Some(0xb0b0));
        assert_eq!(caller.x86(Reg::R12), Some(0x2));
    }

    #[test]
    fn test_frame_pointer_fallback()
    {
        let mut memory = Memory::default();
        memory.write_u64(0x6ff0, 0x7100);
        memory.write_u64(0x6ff8, 0x40_5678);
        let registers = regs(&[(Reg::Rsp, 0x6f00), (Reg::Rbp, 0x6ff0)]);

        let caller = X86_64.unwind_one_frame(&memory, &registers, None, 0).unwrap().unwrap();
        assert_eq!(caller.x86(Reg::Rip), Some(0x40_5678));
        assert_eq!(caller.x86(Reg::Rbp), Some(0x7100));
        assert_eq!(caller.x86(Reg::Rsp), Some(0x7000));

        let unknown_fp = regs(&[(Reg::Rsp, 0x6f00)]);
        assert!(X86_64.unwind_one_frame(&memory, &unknown_fp, None, 0).unwrap().is_none());
    }

    #[test]
    fn test_signal_frame()
    {
        let mut memory = Memory::default();
        memory.write(0x40_0000, &SIGRETURN_CODE);
        let sp = 0x8000u64;
        for (slot, _) in SIGCONTEXT_LAYOUT.iter().enumerate() {
            memory.write_u64(sp + SIGCONTEXT_OFFSET + slot as u64 * 8, 0x100 + slot as u64);
        }
        let registers = regs(&[(Reg::Rip, 0x40_0000), (Reg::Rsp, sp)]);

        let interrupted = X86_64.try_unwind_signal_frame(&memory, &registers).unwrap().unwrap();
        assert_eq!(interrupted.x86(Reg::R8), Some(0x100));
        assert_eq!(interrupted.x86(Reg::Rsp), Some(0x10f));
        assert_eq!(interrupted.x86(Reg::Rip), Some(0x110));
        assert_eq!(interrupted.x86(Reg::Eflags), Some(0x111));

        let elsewhere = regs(&[(Reg::Rip, 0x40_0001), (Reg::Rsp, sp)]);
        assert!(X86_64.try_unwind_signal_frame(&memory, &elsewhere).unwrap().is_none());
    }
}
