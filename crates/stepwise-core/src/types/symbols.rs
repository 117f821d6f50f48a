//! Symbol names and source positions.

use std::fmt;
use std::path::{Path, PathBuf};

use super::Address;

/// Programming language guessed from a symbol's mangling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolLanguage
{
    /// Rust (legacy `_ZN...E` with hash suffix, or v0 `_R`).
    Rust,
    /// C++ (Itanium `_Z`).
    Cpp,
    /// Plain C or any other unmangled name.
    C,
}

impl fmt::Display for SymbolLanguage
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(match self {
            SymbolLanguage::Rust => "rust",
            SymbolLanguage::Cpp => "c++",
            SymbolLanguage::C => "c",
        })
    }
}

/// Linkage name plus its demangled form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolName
{
    raw: String,
    demangled: Option<String>,
    language: SymbolLanguage,
}

impl SymbolName
{
    /// Construct from the parts.
    #[must_use]
    pub fn new(raw: impl Into<String>, demangled: Option<String>, language: SymbolLanguage) -> Self
    {
        Self {
            raw: raw.into(),
            demangled,
            language,
        }
    }

    /// Name for a symbol that is known not to be mangled.
    #[must_use]
    pub fn plain(raw: impl Into<String>) -> Self
    {
        Self::new(raw, None, SymbolLanguage::C)
    }

    /// Linkage name as stored in the object file.
    #[must_use]
    pub fn raw(&self) -> &str
    {
        &self.raw
    }

    /// Demangled name, if the raw name was mangled.
    #[must_use]
    pub fn demangled(&self) -> Option<&str>
    {
        self.demangled.as_deref()
    }

    /// Preferred presentation (demangled, falling back to raw).
    #[must_use]
    pub fn display_name(&self) -> &str
    {
        self.demangled.as_deref().unwrap_or(&self.raw)
    }

    /// Language classification.
    #[must_use]
    pub fn language(&self) -> SymbolLanguage
    {
        self.language
    }
}

impl fmt::Display for SymbolName
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.display_name())
    }
}

/// Position of an address inside a source line
///
/// `offset` counts the bytes of the line that were already executed before
/// `address`; `range` counts the bytes left until the next line starts. A
/// stop exactly on the first instruction of a line therefore has
/// `offset == 0`, and `[address - offset, address + range)` is the whole
/// line's code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAddress
{
    /// Source file the line belongs to.
    pub file: PathBuf,
    /// 1-based line number.
    pub line: u32,
    /// The address that was looked up.
    pub address: Address,
    /// Bytes between the start of the line and `address`.
    pub offset: u64,
    /// Bytes between `address` and the end of the line.
    pub range: u64,
}

impl SourceAddress
{
    /// First address of the line.
    #[must_use]
    pub fn line_start(&self) -> Address
    {
        self.address - self.offset
    }

    /// End (exclusive) of the line.
    #[must_use]
    pub fn line_end(&self) -> Address
    {
        self.address + self.range
    }

    /// File path as a `Path`.
    #[must_use]
    pub fn path(&self) -> &Path
    {
        &self.file
    }
}

impl fmt::Display for SourceAddress
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}:{}", self.file.display(), self.line)?;
        if self.offset != 0 {
            write!(f, "+0x{:x}", self.offset)?;
        }
        Ok(())
    }
}
