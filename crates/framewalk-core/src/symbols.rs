//! # Symbolization
//!
//! Maps an instruction pointer inside a loaded library to the closest
//! preceding ELF symbol, demangled with `rustc-demangle`, and renders it as
//! `name+0xoffset`. Symbol tables are read once per library path and cached.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use object::{Object, ObjectSegment};
use rustc_demangle::try_demangle;
use tracing::debug;

use crate::library::LibraryImage;
use crate::types::Address;

/// A resolved symbol and the offset of the address into it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol
{
    pub name: String,
    pub offset: u64,
}

impl fmt::Display for Symbol
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}+{:#x}", self.name, self.offset)
    }
}

/// Demangle a Rust symbol name; other names are returned unchanged.
pub fn demangle(raw: &str) -> String
{
    try_demangle(raw).map_or_else(|_| raw.to_string(), |demangled| format!("{demangled:#}"))
}

/// Defined symbols of one object, sorted by address
#[derive(Debug, Default)]
struct SymbolTable
{
    vaddr_base: u64,
    symbols: Vec<(u64, String)>,
}

impl SymbolTable
{
    fn parse(bytes: &[u8]) -> Option<Self>
    {
        let file = object::File::parse(bytes).ok()?;
        let vaddr_base = file.segments().map(|segment| segment.address()).min().unwrap_or(0);
        let map = file.symbol_map();
        let mut symbols: Vec<(u64, String)> = map
            .symbols()
            .iter()
            .filter(|symbol| !symbol.name().is_empty())
            .map(|symbol| (symbol.address(), demangle(symbol.name())))
            .collect();
        symbols.sort_by_key(|(address, _)| *address);
        Some(Self { vaddr_base, symbols })
    }

    fn lookup(&self, address: u64) -> Option<Symbol>
    {
        let index = self.symbols.partition_point(|(start, _)| *start <= address);
        let (start, name) = self.symbols.get(index.checked_sub(1)?)?;
        Some(Symbol {
            name: name.clone(),
            offset: address - start,
        })
    }
}

/// Caching symbolizer shared by frame walks
#[derive(Debug, Default)]
pub struct Symbolizer
{
    tables: RwLock<HashMap<PathBuf, Option<Arc<SymbolTable>>>>,
}

impl Symbolizer
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Symbol containing `ip`, which must lie inside `library`.
    pub fn symbolize(&self, library: &LibraryImage, ip: Address) -> Option<Symbol>
    {
        let table = self.table(library.path())?;
        let offset = ip.offset_from(library.base())?;
        table.lookup(offset.wrapping_add(table.vaddr_base))
    }

    fn table(&self, path: &Path) -> Option<Arc<SymbolTable>>
    {
        if let Ok(tables) = self.tables.read() {
            if let Some(table) = tables.get(path) {
                return table.clone();
            }
        }

        let table = match fs::read(path) {
            Ok(bytes) => SymbolTable::parse(&bytes).map(Arc::new),
            Err(err) => {
                debug!("could not read symbols from {}: {err}", path.display());
                None
            }
        };
        if let Ok(mut tables) = self.tables.write() {
            tables.insert(path.to_path_buf(), table.clone());
        }
        table
    }
}
