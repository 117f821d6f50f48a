//! ELF symbol tables and DWARF line programs.
//!
//! Function symbols (`STT_FUNC` with a non-zero size) become [`Method`]s.
//! Line information is attached lazily: the DWARF sections are copied out
//! of the file once, and an `addr2line` context is built the first time a
//! method's lines are needed.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use addr2line::Context;
use gimli::{Dwarf, EndianArcSlice, RunTimeEndian, SectionId};
use object::{Object, ObjectSection, ObjectSegment, ObjectSymbol, SymbolKind};
use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use super::{make_symbol_name, LineRow, LineTable, Method, Module, SymbolProvider};
use crate::error::{Result, StepwiseError};
use crate::types::{Address, MemoryRegion};

type OwnedReader = EndianArcSlice<RunTimeEndian>;

const DWARF_SECTIONS: &[SectionId] = &[
    SectionId::DebugAbbrev,
    SectionId::DebugAddr,
    SectionId::DebugInfo,
    SectionId::DebugLine,
    SectionId::DebugLineStr,
    SectionId::DebugRanges,
    SectionId::DebugRngLists,
    SectionId::DebugStr,
    SectionId::DebugStrOffsets,
];

fn load_section(file: &object::File<'_>, id: SectionId) -> Result<Option<Arc<[u8]>>>
{
    let Some(section) = file.section_by_name(id.name()) else {
        return Ok(None);
    };
    let data = section
        .uncompressed_data()
        .map_err(|err| StepwiseError::Symbols(format!("failed to read {}: {err}", id.name())))?;
    Ok(Some(match data {
        Cow::Borrowed(bytes) => Arc::from(bytes),
        Cow::Owned(vec) => vec.into(),
    }))
}

/// A function symbol before line information is attached.
#[derive(Debug, Clone)]
struct FunctionSymbol
{
    raw_name: String,
    start: u64,
    size: u64,
}

/// [`SymbolProvider`] for one ELF object.
pub struct ElfSymbolProvider
{
    path: PathBuf,
    module: Arc<Module>,
    bias: u64,
    endian: RunTimeEndian,
    functions: BTreeMap<u64, FunctionSymbol>,
    debug_sections: HashMap<SectionId, Arc<[u8]>>,
    context: OnceCell<Option<Mutex<Context<OwnedReader>>>>,
    methods: RwLock<HashMap<u64, Arc<Method>>>,
}

impl std::fmt::Debug for ElfSymbolProvider
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("ElfSymbolProvider")
            .field("path", &self.path)
            .field("bias", &format_args!("0x{:x}", self.bias))
            .field("functions", &self.functions.len())
            .finish()
    }
}

impl ElfSymbolProvider
{
    /// Parse the symbol table of the ELF file at `path`.
    ///
    /// `bias` is added to every file address to get the runtime address
    /// (zero for non-PIE executables).
    ///
    /// ## Errors
    ///
    /// `Io` if the file cannot be read, `Symbols` if it is not a parsable
    /// object file.
    pub fn open(path: impl AsRef<Path>, bias: u64) -> Result<Self>
    {
        let path = path.as_ref().to_path_buf();
        let bytes = fs::read(&path)?;
        let file = object::File::parse(&*bytes)
            .map_err(|err| StepwiseError::Symbols(format!("failed to parse {}: {err}", path.display())))?;

        let endian = if file.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let mut functions = BTreeMap::new();
        for symbol in file.symbols().chain(file.dynamic_symbols()) {
            if symbol.kind() != SymbolKind::Text || symbol.size() == 0 || symbol.address() == 0 {
                continue;
            }
            let Ok(name) = symbol.name() else {
                continue;
            };
            functions.entry(symbol.address()).or_insert_with(|| FunctionSymbol {
                raw_name: name.to_string(),
                start: symbol.address(),
                size: symbol.size(),
            });
        }

        let mut debug_sections = HashMap::new();
        for id in DWARF_SECTIONS {
            if let Some(data) = load_section(&file, *id)? {
                debug_sections.insert(*id, data);
            }
        }

        let module_name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned());
        debug!(
            path = %path.display(),
            functions = functions.len(),
            has_dwarf = debug_sections.contains_key(&SectionId::DebugLine),
            "loaded ELF symbols"
        );

        Ok(Self {
            path,
            module: Module::new(module_name),
            bias,
            endian,
            functions,
            debug_sections,
            context: OnceCell::new(),
            methods: RwLock::new(HashMap::new()),
        })
    }

    /// Open the symbols of a running process's executable, computing the
    /// load bias from its memory map.
    ///
    /// Position-independent executables are relocated by the kernel; the
    /// bias is the start of the first mapping of `path` minus the lowest
    /// `PT_LOAD` address.
    pub fn for_process(path: impl AsRef<Path>, regions: &[MemoryRegion]) -> Result<Self>
    {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let file = object::File::parse(&*bytes)
            .map_err(|err| StepwiseError::Symbols(format!("failed to parse {}: {err}", path.display())))?;

        let bias = if file.kind() == object::ObjectKind::Dynamic {
            let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
            let lowest = file.segments().map(|segment| segment.address()).min().unwrap_or(0);
            regions
                .iter()
                .filter(|region| region.offset == 0)
                .find(|region| region.name.as_deref().is_some_and(|name| Path::new(name) == canonical))
                .map_or(0, |region| region.start.value().saturating_sub(lowest))
        } else {
            0
        };
        drop(file);
        Self::open(path, bias)
    }

    /// Module all methods of this file belong to.
    #[must_use]
    pub fn module(&self) -> &Arc<Module>
    {
        &self.module
    }

    /// Load bias.
    #[must_use]
    pub fn bias(&self) -> u64
    {
        self.bias
    }

    fn context(&self) -> Option<&Mutex<Context<OwnedReader>>>
    {
        self.context
            .get_or_init(|| {
                if !self.debug_sections.contains_key(&SectionId::DebugLine) {
                    return None;
                }
                let dwarf = Dwarf::load(|id| {
                    let data = self
                        .debug_sections
                        .get(&id)
                        .cloned()
                        .unwrap_or_else(|| Arc::<[u8]>::from(Vec::new()));
                    Ok::<_, gimli::Error>(EndianArcSlice::new(data, self.endian))
                });
                match dwarf.and_then(Context::from_dwarf) {
                    Ok(context) => Some(Mutex::new(context)),
                    Err(err) => {
                        warn!(path = %self.path.display(), error = %err, "cannot build line tables");
                        None
                    }
                }
            })
            .as_ref()
    }

    /// Line rows of `[start, end)` in file addresses, plus the file the
    /// first row belongs to.
    fn line_rows(&self, start: u64, end: u64) -> Option<(PathBuf, Vec<(u64, u32)>)>
    {
        let context = self.context()?.lock().ok()?;
        let ranges = context.find_location_range(start, end).ok()?;

        let mut file = None;
        let mut rows = Vec::new();
        for (address, _size, location) in ranges {
            let (Some(path), Some(line)) = (location.file, location.line) else {
                continue;
            };
            let path = PathBuf::from(path);
            match &file {
                None => file = Some(path),
                Some(first) if *first != path => continue,
                Some(_) => {}
            }
            rows.push((address, line));
        }
        Some((file?, rows))
    }

    fn build_method(&self, function: &FunctionSymbol) -> Method
    {
        let start = Address::new(function.start + self.bias);
        let end = start + function.size;
        let mut method = Method::new(make_symbol_name(&function.raw_name), start, end, Arc::clone(&self.module));

        if let Some((file, rows)) = self.line_rows(function.start, function.start + function.size) {
            let rows: Vec<LineRow> = rows
                .into_iter()
                .map(|(address, line)| LineRow {
                    address: Address::new(address + self.bias),
                    line,
                })
                .collect();
            let table = LineTable::new(file, rows, end);
            // The second row is the first line of the body.
            if let Some(body) = table.rows().get(1) {
                method = method.with_body_start(body.address);
            }
            if !table.rows().is_empty() {
                method = method.with_source(Arc::new(table));
            }
        }
        method
    }

    fn method_for(&self, function: &FunctionSymbol) -> Arc<Method>
    {
        if let Ok(methods) = self.methods.read() {
            if let Some(method) = methods.get(&function.start) {
                return Arc::clone(method);
            }
        }
        let method = Arc::new(self.build_method(function));
        if let Ok(mut methods) = self.methods.write() {
            methods.insert(function.start, Arc::clone(&method));
        }
        method
    }
}

impl SymbolProvider for ElfSymbolProvider
{
    fn lookup(&self, address: Address) -> Option<Arc<Method>>
    {
        let file_address = address.value().checked_sub(self.bias)?;
        let (_, function) = self.functions.range(..=file_address).next_back()?;
        if file_address >= function.start + function.size {
            return None;
        }
        Some(self.method_for(function))
    }

    fn lookup_by_name(&self, name: &str) -> Option<Arc<Method>>
    {
        let function = self.functions.values().find(|function| {
            function.raw_name == name || make_symbol_name(&function.raw_name).display_name() == name
        })?;
        Some(self.method_for(function))
    }
}
