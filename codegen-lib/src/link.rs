//! The linker-facing symbol interface.
//!
//! The backend never resolves addresses itself; it either reads a GOT
//! entry address from the output file's symbol table (ELF, COFF, Plan 9)
//! or defers to relocation pseudo-instructions carrying `{atom, symbol}`
//! pairs (Mach-O). Writes to these tables are serialized by the caller.

use air::AtomIndex;
use std::collections::HashMap;

pub type SymbolIndex = u32;

/// Global-offset-table shape shared by the address-resolving formats.
#[derive(Debug, Clone)]
pub struct GotTable {
    got_base: u64,
    entry_size: u64,
}

impl GotTable {
    pub fn new(got_base: u64) -> GotTable {
        GotTable { got_base, entry_size: 8 }
    }

    /// Absolute address of the GOT entry for `atom`.
    pub fn entry_address(&self, atom: AtomIndex) -> u64 {
        self.got_base + u64::from(atom) * self.entry_size
    }
}

/// String table of a Mach-O output file, giving extern functions stable
/// indices for `call_extern` relocations.
#[derive(Debug, Default)]
pub struct MachOFile {
    strtab: Vec<String>,
    by_name: HashMap<String, SymbolIndex>,
}

impl MachOFile {
    pub fn new() -> MachOFile {
        MachOFile::default()
    }

    /// Index of the extern function named `name`, registering it on first
    /// use.
    pub fn extern_fn_index(&mut self, name: &str) -> SymbolIndex {
        if let Some(index) = self.by_name.get(name) {
            return *index;
        }
        let index = self.strtab.len() as SymbolIndex;
        self.strtab.push(name.to_string());
        self.by_name.insert(name.to_string(), index);
        log::debug!("registered extern function {} as symbol {}", name, index);
        index
    }

    pub fn symbol_name(&self, index: SymbolIndex) -> Option<&str> {
        self.strtab.get(index as usize).map(String::as_str)
    }
}

/// The output file the generated function will land in.
#[derive(Debug)]
pub enum LinkFile {
    Elf(GotTable),
    Coff(GotTable),
    Plan9(GotTable),
    MachO(MachOFile),
}

impl LinkFile {
    /// The GOT of an address-resolving format, if this is one.
    pub fn got(&self) -> Option<&GotTable> {
        match self {
            LinkFile::Elf(got) | LinkFile::Coff(got) | LinkFile::Plan9(got) => Some(got),
            LinkFile::MachO(_) => None,
        }
    }

    pub fn format_name(&self) -> &'static str {
        match self {
            LinkFile::Elf(_) => "elf",
            LinkFile::Coff(_) => "coff",
            LinkFile::Plan9(_) => "plan9",
            LinkFile::MachO(_) => "mach-o",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn got_entries_are_pointer_strided() {
        let got = GotTable::new(0x1000);
        assert_eq!(got.entry_address(0), 0x1000);
        assert_eq!(got.entry_address(3), 0x1018);
    }

    #[test]
    fn extern_functions_are_registered_once() {
        let mut macho = MachOFile::new();
        let puts = macho.extern_fn_index("puts");
        let write = macho.extern_fn_index("write");
        assert_eq!(puts, macho.extern_fn_index("puts"));
        assert_ne!(puts, write);
        assert_eq!(macho.symbol_name(puts), Some("puts"));
    }
}
