//! Symbolication.
//!
//! Turns raw addresses into `module + offset (function + offset)` hits by
//! combining three sources, best first:
//!
//! 1. The OS debug-symbol session (PDBs, exports), when one is live.
//! 2. Sideband address tables shipped next to the game: plain-text
//!    `<demangled-name> - <hex-offset>` files keyed relative to a module base.
//! 3. A backwards prologue scan that at least recovers the function entry.
//!
//! Every step degrades to the next; `resolve` always produces a hit and
//! `render` always produces a non-empty string.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::memory::MemoryProbe;
use crate::modules::ModuleRegistry;
use crate::{CrashError, Result};

/// A resolved address.
///
/// `module` is empty when the address lies outside every known module (JITed
/// code, thunks, virtual calls). `function` is empty when the module is known
/// but no symbol could be recovered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolHit {
    /// Owning module file name, or empty.
    pub module: String,
    /// Address relative to the module base; the absolute address when the
    /// module is unknown.
    pub address: usize,
    /// Function name, or empty.
    pub function: String,
    /// Offset of the address inside the function.
    pub function_offset: usize,
    /// Source file, or empty.
    pub file: String,
    /// Source line, 0 when unknown.
    pub line: u32,
}

impl SymbolHit {
    /// Renders the hit using the fixed display forms.
    pub fn render(&self) -> String {
        if self.module.is_empty() && self.address == 0 {
            return format!("0x{:08X}", self.function_offset);
        }
        if self.module.is_empty() {
            return format!("0x{:08X}+0x{:X}", self.address, self.function_offset);
        }
        if self.function.is_empty() {
            return format!("{}+0x{:X}", self.module, self.address);
        }
        format!(
            "{}+0x{:X} ({}+0x{:x})",
            self.module, self.address, self.function, self.function_offset
        )
    }
}

/// Turns an MSVC RTTI type-descriptor name (e.g. `.?AVPlayLayer@@`) into a
/// readable class name.
///
/// Type descriptors are not directly demanglable, but wrapping them in an
/// `??_R0` RTTI symbol is. Falls back to unpicking the name by hand if the
/// demangler refuses.
pub fn demangle_type_descriptor(raw: &str) -> String {
    use msvc_demangler::DemangleFlags;

    if raw.starts_with('.') {
        let wrapped = format!("??_R0{}@8", &raw[1..]);
        let flags = DemangleFlags::NAME_ONLY | DemangleFlags::NO_CLASS_TYPE;
        if let Ok(demangled) = msvc_demangler::demangle(&wrapped, flags) {
            return demangled
                .trim_start_matches("class ")
                .trim_start_matches("struct ")
                .trim_end_matches("`RTTI Type Descriptor'")
                .trim_end()
                .to_string();
        }
    }

    // `.?AVCCNode@cocos2d@@` - inner-to-outer name parts separated by `@`.
    let stripped = raw
        .trim_start_matches(".?AV")
        .trim_start_matches(".?AU")
        .trim_end_matches("@@");
    let mut parts: Vec<&str> = stripped.split('@').collect();
    parts.reverse();
    parts.join("::")
}

/// A symbol recovered from the OS debug-symbol API.
#[derive(Debug, Clone)]
pub struct OsSymbol {
    pub name: String,
    /// Displacement of the queried address from the symbol start.
    pub offset: usize,
}

/// Access to the platform debug-symbol session.
///
/// The live implementation wraps a DbgHelp session; tests substitute a map.
pub trait DebugSymbolSource {
    /// The symbol covering `addr`, if the session knows one.
    fn symbol_at(&self, addr: usize) -> Option<OsSymbol>;

    /// Source file and line for `addr`, if line info is loaded.
    fn line_at(&self, addr: usize) -> Option<(String, u32)>;
}

/// A sideband address→name table.
///
/// One entry per line, `<demangled-name> - <hex-offset>`, offsets relative to
/// the owning module's base, no `0x` prefix. Malformed lines are skipped so a
/// truncated download still yields a usable table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolTable {
    /// Entries sorted by offset for binary search.
    entries: Vec<(usize, String)>,
}

impl SymbolTable {
    /// Parses table text, skipping lines that don't match the shape.
    pub fn parse(text: &str) -> Self {
        let mut entries: Vec<(usize, String)> = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            // The name itself may contain " - "; the offset is the last field.
            let Some((name, offset)) = line.rsplit_once(" - ") else {
                continue;
            };
            let Ok(offset) = usize::from_str_radix(offset.trim(), 16) else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            entries.push((offset, name.to_string()));
        }
        entries.sort_by_key(|(offset, _)| *offset);
        entries.dedup_by_key(|(offset, _)| *offset);
        Self { entries }
    }

    /// Loads and parses a table file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CrashError::SymbolTable(format!("{}: {e}", path.display())))?;
        let table = Self::parse(&text);
        debug!("Loaded {} symbols from {}", table.len(), path.display());
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Name registered exactly at `offset`.
    pub fn exact(&self, offset: usize) -> Option<&str> {
        self.entries
            .binary_search_by_key(&offset, |(o, _)| *o)
            .ok()
            .map(|idx| self.entries[idx].1.as_str())
    }

    /// Largest entry with `lower_bound <= entry offset <= offset`.
    pub fn nearest_below(&self, offset: usize, lower_bound: usize) -> Option<(usize, &str)> {
        let idx = match self.entries.binary_search_by_key(&offset, |(o, _)| *o) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let (entry_offset, name) = &self.entries[idx];
        (*entry_offset >= lower_bound).then_some((*entry_offset, name.as_str()))
    }
}

/// Sideband tables known to the analyzer, keyed by the module they describe.
#[derive(Debug, Default)]
pub struct SidebandTables {
    /// Table for the main module (the host executable).
    main: Option<SymbolTable>,
    /// Tables for named modules (e.g. the framework DLL).
    per_module: Vec<(String, SymbolTable)>,
}

impl SidebandTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the table for the main module.
    pub fn set_main_table(&mut self, table: SymbolTable) {
        self.main = Some(table);
    }

    /// Installs a table for the module with the given file name.
    pub fn add_module_table(&mut self, module_name: impl Into<String>, table: SymbolTable) {
        self.per_module.push((module_name.into(), table));
    }

    /// The table covering `module_name`, if any.
    pub fn table_for(&self, module_name: &str, is_main: bool) -> Option<&SymbolTable> {
        if is_main && self.main.is_some() {
            return self.main.as_ref();
        }
        self.per_module
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(module_name))
            .map(|(_, table)| table)
    }

    pub fn clear(&mut self) {
        self.main = None;
        self.per_module.clear();
    }
}

/// Address resolver over the captured snapshot.
pub struct SymbolResolver<'a> {
    probe: &'a MemoryProbe,
    modules: &'a ModuleRegistry,
    sideband: &'a SidebandTables,
    os_symbols: Option<&'a dyn DebugSymbolSource>,
}

impl<'a> SymbolResolver<'a> {
    pub fn new(
        probe: &'a MemoryProbe,
        modules: &'a ModuleRegistry,
        sideband: &'a SidebandTables,
        os_symbols: Option<&'a dyn DebugSymbolSource>,
    ) -> Self {
        Self {
            probe,
            modules,
            sideband,
            os_symbols,
        }
    }

    /// Resolves `addr` to the best hit available. Total; never fails.
    pub fn resolve(&self, addr: usize) -> SymbolHit {
        let Some(module) = self.modules.by_address(addr) else {
            // Outside every known module; report the raw address.
            return SymbolHit {
                address: addr,
                ..SymbolHit::default()
            };
        };

        let offset = addr - module.base;
        let mut hit = SymbolHit {
            module: module.name.clone(),
            address: offset,
            ..SymbolHit::default()
        };

        // OS debug symbols win when present.
        if let Some(os) = self.os_symbols
            && let Some(symbol) = os.symbol_at(addr)
        {
            hit.function = symbol.name;
            hit.function_offset = symbol.offset;
            if let Some((file, line)) = os.line_at(addr) {
                hit.file = file;
                hit.line = line;
            }
            return hit;
        }

        let is_main = self
            .modules
            .main_module()
            .is_some_and(|main| main.base == module.base);
        if let Some(table) = self.sideband.table_for(&module.name, is_main) {
            if let Some(name) = table.exact(offset) {
                hit.function = name.to_string();
                return hit;
            }
            // Not on an entry boundary: anchor the search at the function
            // entry so we don't pick up the previous function's name.
            if let Some(entry) = self.probe.find_method_start(addr) {
                let entry_offset = entry.saturating_sub(module.base);
                if let Some((found_offset, name)) = table.nearest_below(offset, entry_offset) {
                    hit.function = name.to_string();
                    hit.function_offset = offset - found_offset;
                    return hit;
                }
            }
        }

        // Last resort: recover at least the function entry.
        if let Some(entry) = self.probe.find_method_start(addr) {
            hit.function = format!("<0x{:X}>", entry.saturating_sub(module.base));
            hit.function_offset = addr - entry;
        }
        hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::fake::{SparseMemory, probe_over};
    use crate::memory::PROLOGUE_PATTERNS;
    use crate::modules::ModuleInfo;

    fn module(name: &str, base: usize, size: usize) -> ModuleInfo {
        ModuleInfo {
            handle: base,
            name: name.to_string(),
            path: format!("C:\\Game\\{name}"),
            base,
            size,
        }
    }

    struct FakeOsSymbols;

    impl DebugSymbolSource for FakeOsSymbols {
        fn symbol_at(&self, addr: usize) -> Option<OsSymbol> {
            (addr == 0x7F000123).then(|| OsSymbol {
                name: "MessageBoxW".to_string(),
                offset: 0x23,
            })
        }

        fn line_at(&self, addr: usize) -> Option<(String, u32)> {
            (addr == 0x7F000123).then(|| ("user32.c".to_string(), 42))
        }
    }

    #[test]
    fn render_raw_address() {
        let hit = SymbolHit {
            address: 0x823F10,
            ..SymbolHit::default()
        };
        assert_eq!(hit.render(), "0x00823F10+0x0");
    }

    #[test]
    fn render_zero() {
        let hit = SymbolHit::default();
        assert_eq!(hit.render(), "0x00000000");
    }

    #[test]
    fn render_module_only() {
        let hit = SymbolHit {
            module: "game.exe".to_string(),
            address: 0x1F2E,
            ..SymbolHit::default()
        };
        assert_eq!(hit.render(), "game.exe+0x1F2E");
    }

    #[test]
    fn render_full() {
        let hit = SymbolHit {
            module: "game.exe".to_string(),
            address: 0x1F2E,
            function: "PlayLayer::update".to_string(),
            function_offset: 0x2E,
            ..SymbolHit::default()
        };
        assert_eq!(hit.render(), "game.exe+0x1F2E (PlayLayer::update+0x2e)");
    }

    #[test]
    fn render_is_never_empty() {
        assert!(!SymbolHit::default().render().is_empty());
    }

    #[test]
    fn table_parses_and_skips_malformed() {
        let table = SymbolTable::parse(
            "PlayLayer::init - 1000\n\
             garbage line\n\
             PlayLayer::update - 1a40\n\
             NoOffset - xyz\n\
             operator- - 2000\n\
             \n",
        );
        assert_eq!(table.len(), 3);
        assert_eq!(table.exact(0x1000), Some("PlayLayer::init"));
        assert_eq!(table.exact(0x1A40), Some("PlayLayer::update"));
        assert_eq!(table.exact(0x2000), Some("operator-"));
        assert_eq!(table.exact(0x1234), None);
    }

    #[test]
    fn table_loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Windows-2.206.txt");
        std::fs::write(&path, "MenuLayer::init - 19fb50\n").unwrap();
        let table = SymbolTable::load(&path).unwrap();
        assert_eq!(table.exact(0x19FB50), Some("MenuLayer::init"));

        let missing = SymbolTable::load(&dir.path().join("nope.txt"));
        assert!(missing.is_err());
    }

    #[test]
    fn table_nearest_below_honors_lower_bound() {
        let table = SymbolTable::parse("a - 100\nb - 200\nc - 300\n");
        assert_eq!(table.nearest_below(0x250, 0x200), Some((0x200, "b")));
        assert_eq!(table.nearest_below(0x250, 0x210), None);
        assert_eq!(table.nearest_below(0x50, 0), None);
    }

    #[test]
    fn type_descriptor_demangles() {
        let simple = demangle_type_descriptor(".?AVPlayLayer@@");
        assert!(simple.contains("PlayLayer"), "{simple}");
        assert!(!simple.contains('@'), "{simple}");

        let nested = demangle_type_descriptor(".?AVCCNode@cocos2d@@");
        assert!(nested.contains("CCNode"), "{nested}");
        assert!(!nested.contains('@'), "{nested}");

        // Not a type descriptor at all: hand-unpicked, worst case verbatim.
        assert_eq!(demangle_type_descriptor("plain"), "plain");
    }

    #[test]
    fn resolve_outside_modules_is_raw() {
        let probe = probe_over(SparseMemory::new());
        let modules = ModuleRegistry::new();
        let sideband = SidebandTables::new();
        let resolver = SymbolResolver::new(&probe, &modules, &sideband, None);
        let hit = resolver.resolve(0xDEAD0000);
        assert!(hit.module.is_empty());
        assert_eq!(hit.address, 0xDEAD0000);
        assert!(hit.function.is_empty());
    }

    #[test]
    fn resolve_prefers_os_symbols() {
        let probe = probe_over(SparseMemory::new());
        let modules =
            ModuleRegistry::from_modules(vec![module("user32.dll", 0x7F000000, 0x10000)]);
        let sideband = SidebandTables::new();
        let os = FakeOsSymbols;
        let resolver = SymbolResolver::new(&probe, &modules, &sideband, Some(&os));
        let hit = resolver.resolve(0x7F000123);
        assert_eq!(hit.module, "user32.dll");
        assert_eq!(hit.address, 0x123);
        assert_eq!(hit.function, "MessageBoxW");
        assert_eq!(hit.function_offset, 0x23);
        assert_eq!(hit.file, "user32.c");
        assert_eq!(hit.line, 42);
    }

    #[test]
    fn resolve_main_module_exact_sideband_hit() {
        let probe = probe_over(SparseMemory::new());
        let modules = ModuleRegistry::from_modules(vec![module("game.exe", 0x400000, 0x100000)]);
        let mut sideband = SidebandTables::new();
        sideband.set_main_table(SymbolTable::parse("GameManager::update - 1a40\n"));
        let resolver = SymbolResolver::new(&probe, &modules, &sideband, None);
        let hit = resolver.resolve(0x401A40);
        assert_eq!(hit.function, "GameManager::update");
        assert_eq!(hit.function_offset, 0);
    }

    #[test]
    fn resolve_sideband_prologue_gated_fallback() {
        // Entry at base+0x1001 (behind CC padding); the table entry sits a
        // few bytes past the prologue, still within [entry, addr].
        let mut mem = SparseMemory::new();
        let mut code = vec![0x90u8; 0x100];
        code[0] = 0xCC;
        code[1] = PROLOGUE_PATTERNS[0].to_le_bytes()[1];
        mem.map_code(0x401000, code);
        let probe = probe_over(mem);
        let modules = ModuleRegistry::from_modules(vec![module("game.exe", 0x400000, 0x100000)]);
        let mut sideband = SidebandTables::new();
        sideband.set_main_table(SymbolTable::parse("EditorUI::onSave - 1004\n"));
        let resolver = SymbolResolver::new(&probe, &modules, &sideband, None);

        let hit = resolver.resolve(0x401050);
        assert_eq!(hit.function, "EditorUI::onSave");
        assert_eq!(hit.function_offset, 0x50 - 0x04);
    }

    #[test]
    fn resolve_framework_module_table_by_name() {
        let probe = probe_over(SparseMemory::new());
        let modules = ModuleRegistry::from_modules(vec![
            module("game.exe", 0x400000, 0x100000),
            module("libcocos2d.dll", 0x10000000, 0x200000),
        ]);
        let mut sideband = SidebandTables::new();
        sideband.add_module_table("libcocos2d.dll", SymbolTable::parse("CCNode::addChild - 2000"));
        let resolver = SymbolResolver::new(&probe, &modules, &sideband, None);
        let hit = resolver.resolve(0x10002000);
        assert_eq!(hit.module, "libcocos2d.dll");
        assert_eq!(hit.function, "CCNode::addChild");
    }

    #[test]
    fn resolve_synthetic_entry_name() {
        let mut mem = SparseMemory::new();
        let mut code = vec![0x90u8; 0x100];
        code[0x10] = 0xCC;
        code[0x11] = PROLOGUE_PATTERNS[0].to_le_bytes()[1];
        mem.map_code(0x10001000, code);
        let probe = probe_over(mem);
        let modules =
            ModuleRegistry::from_modules(vec![module("render.dll", 0x10000000, 0x100000)]);
        let sideband = SidebandTables::new();
        let resolver = SymbolResolver::new(&probe, &modules, &sideband, None);

        let hit = resolver.resolve(0x10001050);
        assert_eq!(hit.function, "<0x1011>");
        assert_eq!(hit.function_offset, 0x50 - 0x11);
        assert_eq!(hit.render(), "render.dll+0x1050 (<0x1011>+0x3f)");
    }

    #[test]
    fn resolve_module_without_symbols_degrades_to_offset() {
        let probe = probe_over(SparseMemory::new());
        let modules =
            ModuleRegistry::from_modules(vec![module("render.dll", 0x10000000, 0x100000)]);
        let sideband = SidebandTables::new();
        let resolver = SymbolResolver::new(&probe, &modules, &sideband, None);
        let hit = resolver.resolve(0x10001050);
        assert!(hit.function.is_empty());
        assert_eq!(hit.render(), "render.dll+0x1050");
    }
}
