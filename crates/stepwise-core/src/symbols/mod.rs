//! # Symbols
//!
//! The stepping engine consumes symbol information through a narrow
//! interface: given an address, which [`Method`] contains it, where does the
//! method body start after the prologue, and which source line does an
//! address belong to. How that information is read out of a binary is the
//! business of a [`SymbolProvider`].
//!
//! ## Layers
//!
//! - [`Method`] / [`Module`]: what the engine reasons about.
//! - [`MethodSource`] / [`LineTable`]: per-method line information.
//! - [`SymbolProvider`]: one symbol file (or any other source of methods).
//!   [`StaticSymbols`] is an in-memory provider, [`ElfSymbolProvider`]
//!   reads ELF symbol tables and DWARF line programs.
//! - [`SymbolTable`]: the process-wide collection of providers plus an
//!   address-range cache, shared by every engine of a process.
//! - [`TrampolineResolver`]: per-runtime knowledge about call trampolines.

mod demangle;
pub mod elf;
pub mod trampoline;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

pub use elf::ElfSymbolProvider;
pub use trampoline::{JitTrampolineResolver, TrampolineResolver};
use tracing::trace;

use crate::types::{Address, SourceAddress, SymbolName};

pub(crate) use demangle::make_symbol_name;

/// A loaded object (executable or shared library).
#[derive(Debug)]
pub struct Module
{
    name: String,
    step_into: AtomicBool,
}

impl Module
{
    /// New module with step-into enabled.
    pub fn new(name: impl Into<String>) -> Arc<Self>
    {
        Arc::new(Self {
            name: name.into(),
            step_into: AtomicBool::new(true),
        })
    }

    /// Module name (usually the file name of the object).
    #[must_use]
    pub fn name(&self) -> &str
    {
        &self.name
    }

    /// Whether stepping may descend into this module's methods.
    #[must_use]
    pub fn step_into(&self) -> bool
    {
        self.step_into.load(Ordering::Relaxed)
    }

    /// Allow or forbid stepping into this module.
    pub fn set_step_into(&self, enabled: bool)
    {
        self.step_into.store(enabled, Ordering::Relaxed);
    }
}

/// Line information for one method.
pub trait MethodSource: Send + Sync + fmt::Debug
{
    /// Primary source file of the method.
    fn file(&self) -> &Path;

    /// `true` for generated code whose "source" does not exist on disk.
    fn is_dynamic(&self) -> bool;

    /// Source line containing `address`, with the line's byte extent around
    /// it.
    fn lookup(&self, address: Address) -> Option<SourceAddress>;
}

/// One row of a [`LineTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRow
{
    /// First address of the row.
    pub address: Address,
    /// 1-based line number.
    pub line: u32,
}

/// Sorted address → line table covering `[start, end)`.
///
/// Consecutive rows for the same line are merged when the table is built,
/// so every row is the start of a distinct line.
#[derive(Debug, Clone)]
pub struct LineTable
{
    file: PathBuf,
    rows: Vec<LineRow>,
    end: Address,
    dynamic: bool,
}

impl LineTable
{
    /// Build a table. `rows` need not be sorted; duplicates and adjacent
    /// rows of the same line are folded.
    pub fn new(file: impl Into<PathBuf>, mut rows: Vec<LineRow>, end: Address) -> Self
    {
        rows.sort_by_key(|row| row.address);
        rows.dedup_by_key(|row| row.address);
        rows.dedup_by_key(|row| row.line);
        rows.retain(|row| row.address < end);
        Self {
            file: file.into(),
            rows,
            end,
            dynamic: false,
        }
    }

    /// Mark the table as describing generated code.
    #[must_use]
    pub fn dynamic(mut self) -> Self
    {
        self.dynamic = true;
        self
    }

    /// Rows in address order.
    #[must_use]
    pub fn rows(&self) -> &[LineRow]
    {
        &self.rows
    }
}

impl MethodSource for LineTable
{
    fn file(&self) -> &Path
    {
        &self.file
    }

    fn is_dynamic(&self) -> bool
    {
        self.dynamic
    }

    fn lookup(&self, address: Address) -> Option<SourceAddress>
    {
        if address >= self.end {
            return None;
        }
        let index = self.rows.partition_point(|row| row.address <= address).checked_sub(1)?;
        let row = &self.rows[index];
        let next = self.rows.get(index + 1).map_or(self.end, |next| next.address);
        Some(SourceAddress {
            file: self.file.clone(),
            line: row.line,
            address,
            offset: address.value() - row.address.value(),
            range: next.value() - address.value(),
        })
    }
}

/// A function known to the symbol layer.
#[derive(Debug, Clone)]
pub struct Method
{
    name: SymbolName,
    start: Address,
    end: Address,
    body_start: Option<Address>,
    wrapper_target: Option<Address>,
    module: Arc<Module>,
    source: Option<Arc<dyn MethodSource>>,
}

impl Method
{
    /// A method spanning `[start, end)` without line information.
    pub fn new(name: SymbolName, start: Address, end: Address, module: Arc<Module>) -> Self
    {
        Self {
            name,
            start,
            end,
            body_start: None,
            wrapper_target: None,
            module,
            source: None,
        }
    }

    /// Set the first instruction after the prologue.
    #[must_use]
    pub fn with_body_start(mut self, body_start: Address) -> Self
    {
        self.body_start = Some(body_start);
        self
    }

    /// Attach line information.
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn MethodSource>) -> Self
    {
        self.source = Some(source);
        self
    }

    /// Mark the method as a wrapper that forwards to `target`.
    #[must_use]
    pub fn with_wrapper_target(mut self, target: Address) -> Self
    {
        self.wrapper_target = Some(target);
        self
    }

    /// Method name.
    #[must_use]
    pub fn name(&self) -> &SymbolName
    {
        &self.name
    }

    /// Entry address.
    #[must_use]
    pub fn start(&self) -> Address
    {
        self.start
    }

    /// End address (exclusive).
    #[must_use]
    pub fn end(&self) -> Address
    {
        self.end
    }

    /// First post-prologue instruction; the entry if unknown.
    #[must_use]
    pub fn body_start(&self) -> Address
    {
        self.body_start.unwrap_or(self.start)
    }

    /// `true` when the prologue end is known and lies past the entry.
    #[must_use]
    pub fn has_prologue(&self) -> bool
    {
        self.body_start.is_some_and(|body| body > self.start)
    }

    /// Forwarding target if this method is a wrapper.
    #[must_use]
    pub fn wrapper_target(&self) -> Option<Address>
    {
        self.wrapper_target
    }

    /// Owning module.
    #[must_use]
    pub fn module(&self) -> &Arc<Module>
    {
        &self.module
    }

    /// `true` if `address` is inside the method.
    #[must_use]
    pub fn contains(&self, address: Address) -> bool
    {
        address.within(self.start, self.end)
    }

    /// Whether line information is attached.
    #[must_use]
    pub fn has_source(&self) -> bool
    {
        self.source.is_some()
    }

    /// Line information, if any.
    #[must_use]
    pub fn source(&self) -> Option<&Arc<dyn MethodSource>>
    {
        self.source.as_ref()
    }

    /// Source line of `address`.
    #[must_use]
    pub fn source_lookup(&self, address: Address) -> Option<SourceAddress>
    {
        if !self.contains(address) {
            return None;
        }
        self.source.as_ref()?.lookup(address)
    }
}

impl fmt::Display for Method
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{} [{}, {})", self.name, self.start, self.end)
    }
}

/// Source of methods: one symbol file, or a runtime's method table.
pub trait SymbolProvider: Send + Sync
{
    /// Method containing `address`.
    fn lookup(&self, address: Address) -> Option<Arc<Method>>;

    /// Method with the given raw or demangled name.
    fn lookup_by_name(&self, name: &str) -> Option<Arc<Method>>;
}

/// In-memory provider over a fixed method list.
#[derive(Debug, Default)]
pub struct StaticSymbols
{
    methods: BTreeMap<Address, Arc<Method>>,
}

impl StaticSymbols
{
    /// Empty provider.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Add a method; replaces any method with the same entry address.
    pub fn add(&mut self, method: Method) -> Arc<Method>
    {
        let method = Arc::new(method);
        self.methods.insert(method.start(), Arc::clone(&method));
        method
    }
}

impl SymbolProvider for StaticSymbols
{
    fn lookup(&self, address: Address) -> Option<Arc<Method>>
    {
        let (_, method) = self.methods.range(..=address).next_back()?;
        method.contains(address).then(|| Arc::clone(method))
    }

    fn lookup_by_name(&self, name: &str) -> Option<Arc<Method>>
    {
        self.methods
            .values()
            .find(|method| method.name().raw() == name || method.name().display_name() == name)
            .cloned()
    }
}

/// Process-wide symbol lookup with a method-range cache.
#[derive(Default)]
pub struct SymbolTable
{
    providers: RwLock<Vec<Arc<dyn SymbolProvider>>>,
    cache: RwLock<BTreeMap<Address, Arc<Method>>>,
}

impl fmt::Debug for SymbolTable
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let providers = self.providers.read().map_or(0, |p| p.len());
        let cached = self.cache.read().map_or(0, |c| c.len());
        f.debug_struct("SymbolTable")
            .field("providers", &providers)
            .field("cached_methods", &cached)
            .finish()
    }
}

impl SymbolTable
{
    /// Empty table.
    #[must_use]
    pub fn new() -> Arc<Self>
    {
        Arc::new(Self::default())
    }

    /// Register a provider. Later providers are consulted after earlier
    /// ones.
    pub fn add_provider(&self, provider: Arc<dyn SymbolProvider>)
    {
        if let Ok(mut providers) = self.providers.write() {
            providers.push(provider);
        }
        self.invalidate();
    }

    /// Drop every cached method.
    pub fn invalidate(&self)
    {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }

    /// Method containing `address`.
    #[must_use]
    pub fn lookup(&self, address: Address) -> Option<Arc<Method>>
    {
        if let Ok(cache) = self.cache.read() {
            if let Some((_, method)) = cache.range(..=address).next_back() {
                if method.contains(address) {
                    return Some(Arc::clone(method));
                }
            }
        }

        let providers = self.providers.read().ok()?;
        let method = providers.iter().find_map(|provider| provider.lookup(address))?;
        trace!(%address, method = %method.name(), "symbol cache miss");
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(method.start(), Arc::clone(&method));
        }
        Some(method)
    }

    /// Method by name.
    #[must_use]
    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<Method>>
    {
        let providers = self.providers.read().ok()?;
        providers.iter().find_map(|provider| provider.lookup_by_name(name))
    }
}

/// Where source files are looked up when deciding whether to step into a
/// method.
pub trait SourceFiles: Send + Sync + fmt::Debug
{
    /// `true` if the file can be shown to the user.
    fn exists(&self, path: &Path) -> bool;
}

/// The local file system.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSystem;

impl SourceFiles for FileSystem
{
    fn exists(&self, path: &Path) -> bool
    {
        path.is_file()
    }
}
