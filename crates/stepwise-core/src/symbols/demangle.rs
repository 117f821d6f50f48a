//! Symbol demangling.
//!
//! Linkage names read from object files are mangled. Rust names go through
//! `rustc_demangle` (legacy `_ZN...E` and v0 `_R`); anything else starting
//! with `_Z` is classified as Itanium C++ and kept raw.

use rustc_demangle::try_demangle;

use crate::types::{SymbolLanguage, SymbolName};

/// Build a [`SymbolName`] from a raw linkage name.
///
/// The demangled form drops the legacy hash suffix (`::h0123...`), which is
/// what users type when they set a breakpoint by name.
pub(crate) fn make_symbol_name(raw: &str) -> SymbolName
{
    let demangled = try_demangle(raw).ok().map(|d| format!("{d:#}"));
    let language = if raw.starts_with("_R") || (raw.starts_with("_ZN") && demangled.is_some()) {
        SymbolLanguage::Rust
    } else if raw.starts_with("_Z") {
        SymbolLanguage::Cpp
    } else {
        SymbolLanguage::C
    };

    SymbolName::new(raw, demangled, language)
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_plain_c_symbol()
    {
        let name = make_symbol_name("main");
        assert_eq!(name.language(), SymbolLanguage::C);
        assert_eq!(name.display_name(), "main");
        assert!(name.demangled().is_none());
    }

    #[test]
    fn test_legacy_rust_symbol_drops_hash()
    {
        let name = make_symbol_name("_ZN4core3fmt5write17h0123456789abcdefE");
        assert_eq!(name.language(), SymbolLanguage::Rust);
        assert_eq!(name.display_name(), "core::fmt::write");
    }

    #[test]
    fn test_cpp_symbol_is_not_rust()
    {
        let name = make_symbol_name("_Z3fooi");
        assert_eq!(name.language(), SymbolLanguage::Cpp);
        assert_eq!(name.raw(), "_Z3fooi");
    }
}
