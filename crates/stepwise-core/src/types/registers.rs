//! Register file types.
//!
//! A [`Registers`] value is a fixed-size, architecture-indexed array of
//! [`Register`] slots. Each slot carries a validity bit: the innermost frame
//! of a stopped thread has every slot valid, but older frames produced by
//! the unwinder only know the registers the callee saved (or never
//! touched). Readers must go through [`Registers::get`], which refuses to
//! hand out an invalid slot, so an unknown register is never mistaken for
//! zero.

use std::fmt;

use smallvec::SmallVec;

use super::Address;

/// x86-64 register indices
///
/// The order mirrors the kernel's `user_regs_struct`, which keeps
/// conversion to and from `PTRACE_GETREGS` a straight copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum X86_64Register
{
    R15,
    R14,
    R13,
    R12,
    Rbp,
    Rbx,
    R11,
    R10,
    R9,
    R8,
    Rax,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    OrigRax,
    Rip,
    Cs,
    Eflags,
    Rsp,
    Ss,
    FsBase,
    GsBase,
    Ds,
    Es,
    Fs,
    Gs,
}

impl X86_64Register
{
    /// Number of slots in an x86-64 register file.
    pub const COUNT: usize = 27;

    /// Every register, in index order.
    pub const ALL: [X86_64Register; Self::COUNT] = [
        Self::R15,
        Self::R14,
        Self::R13,
        Self::R12,
        Self::Rbp,
        Self::Rbx,
        Self::R11,
        Self::R10,
        Self::R9,
        Self::R8,
        Self::Rax,
        Self::Rcx,
        Self::Rdx,
        Self::Rsi,
        Self::Rdi,
        Self::OrigRax,
        Self::Rip,
        Self::Cs,
        Self::Eflags,
        Self::Rsp,
        Self::Ss,
        Self::FsBase,
        Self::GsBase,
        Self::Ds,
        Self::Es,
        Self::Fs,
        Self::Gs,
    ];

    /// Slot index inside a [`Registers`] value.
    #[must_use]
    pub const fn index(self) -> usize
    {
        self as usize
    }

    /// Assembler name of the register.
    #[must_use]
    pub const fn name(self) -> &'static str
    {
        match self {
            Self::R15 => "r15",
            Self::R14 => "r14",
            Self::R13 => "r13",
            Self::R12 => "r12",
            Self::Rbp => "rbp",
            Self::Rbx => "rbx",
            Self::R11 => "r11",
            Self::R10 => "r10",
            Self::R9 => "r9",
            Self::R8 => "r8",
            Self::Rax => "rax",
            Self::Rcx => "rcx",
            Self::Rdx => "rdx",
            Self::Rsi => "rsi",
            Self::Rdi => "rdi",
            Self::OrigRax => "orig_rax",
            Self::Rip => "rip",
            Self::Cs => "cs",
            Self::Eflags => "eflags",
            Self::Rsp => "rsp",
            Self::Ss => "ss",
            Self::FsBase => "fs_base",
            Self::GsBase => "gs_base",
            Self::Ds => "ds",
            Self::Es => "es",
            Self::Fs => "fs",
            Self::Gs => "gs",
        }
    }

    /// Look a register up by its assembler name (case-insensitive).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self>
    {
        let lower = name.trim_start_matches('$').to_ascii_lowercase();
        Self::ALL.iter().copied().find(|reg| reg.name() == lower)
    }
}

/// One register slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Register
{
    value: u64,
    valid: bool,
    saved_at: Option<Address>,
}

impl Register
{
    /// Value, if the slot is valid.
    #[must_use]
    pub fn value(&self) -> Option<u64>
    {
        self.valid.then_some(self.value)
    }

    /// Whether the slot holds a known value.
    #[must_use]
    pub fn is_valid(&self) -> bool
    {
        self.valid
    }

    /// Stack slot the value was recovered from, for registers restored by
    /// the unwinder.
    #[must_use]
    pub fn saved_at(&self) -> Option<Address>
    {
        self.saved_at
    }
}

/// Architecture-indexed register file with per-slot validity.
#[derive(Clone, PartialEq, Eq)]
pub struct Registers
{
    slots: SmallVec<[Register; 32]>,
}

impl Registers
{
    /// A register file of `count` slots, all invalid.
    #[must_use]
    pub fn new(count: usize) -> Self
    {
        Self {
            slots: SmallVec::from_elem(Register::default(), count),
        }
    }

    /// An x86-64 register file with every slot invalid.
    #[must_use]
    pub fn x86_64() -> Self
    {
        Self::new(X86_64Register::COUNT)
    }

    /// Build a fully valid register file from raw values.
    #[must_use]
    pub fn from_values(values: &[u64]) -> Self
    {
        Self {
            slots: values
                .iter()
                .map(|&value| Register {
                    value,
                    valid: true,
                    saved_at: None,
                })
                .collect(),
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.slots.len()
    }

    /// `true` for a zero-slot register file.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.slots.is_empty()
    }

    /// Value of slot `index`, or `None` if the slot is invalid or out of
    /// range.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<u64>
    {
        self.slots.get(index).and_then(Register::value)
    }

    /// Raw slot access.
    #[must_use]
    pub fn register(&self, index: usize) -> Option<&Register>
    {
        self.slots.get(index)
    }

    /// Set slot `index` to a known value.
    pub fn set(&mut self, index: usize, value: u64)
    {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Register {
                value,
                valid: true,
                saved_at: None,
            };
        }
    }

    /// Set slot `index` to a value recovered from the stack slot `location`.
    pub fn set_saved(&mut self, index: usize, value: u64, location: Address)
    {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Register {
                value,
                valid: true,
                saved_at: Some(location),
            };
        }
    }

    /// Mark slot `index` as unknown.
    pub fn invalidate(&mut self, index: usize)
    {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Register::default();
        }
    }

    /// `true` if slot `index` holds a known value.
    #[must_use]
    pub fn is_valid(&self, index: usize) -> bool
    {
        self.slots.get(index).is_some_and(Register::is_valid)
    }

    /// Iterate over `(index, slot)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Register)>
    {
        self.slots.iter().enumerate()
    }

    /// Convenience accessor for x86-64 register files.
    #[must_use]
    pub fn x86(&self, register: X86_64Register) -> Option<u64>
    {
        self.get(register.index())
    }

    /// Convenience setter for x86-64 register files.
    pub fn set_x86(&mut self, register: X86_64Register, value: u64)
    {
        self.set(register.index(), value);
    }
}

impl fmt::Debug for Registers
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let mut map = f.debug_map();
        for (index, slot) in self.iter() {
            let name = X86_64Register::ALL
                .get(index)
                .map_or_else(|| format!("r{index}"), |reg| reg.name().to_string());
            match slot.value() {
                Some(value) => map.entry(&name, &format_args!("0x{value:x}")),
                None => map.entry(&name, &"<invalid>"),
            };
        }
        map.finish()
    }
}
