//! Loaded-module inventory.
//!
//! Snapshotted once per analysis pass and never mutated afterwards; every
//! later lookup resolves against the same frozen list, so the report stays
//! consistent even if the host keeps loading libraries.

use serde::{Deserialize, Serialize};

/// A mapped image (executable or shared library).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// Opaque OS handle value, 0 when synthesized.
    pub handle: usize,
    /// File name without directory (e.g. "GeometryDash.exe").
    pub name: String,
    /// Full on-disk path.
    pub path: String,
    /// Image base address.
    pub base: usize,
    /// Image size in bytes.
    pub size: usize,
}

impl ModuleInfo {
    /// True iff `base <= addr < base + size`.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size
    }
}

/// Insertion-ordered snapshot of the process's loaded modules.
///
/// The first entry is the main module (the host executable), matching the
/// enumeration order of the OS.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ModuleRegistry {
    modules: Vec<ModuleInfo>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from an already-collected module list.
    pub fn from_modules(modules: Vec<ModuleInfo>) -> Self {
        Self { modules }
    }

    /// Snapshots the modules of the current process.
    ///
    /// Outside Windows there is nothing to enumerate and the registry stays
    /// empty; every address then resolves as "outside any known module".
    pub fn snapshot_current_process() -> Self {
        #[cfg(windows)]
        {
            Self::from_modules(crate::platform::enumerate_modules())
        }
        #[cfg(not(windows))]
        {
            Self::new()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleInfo> {
        self.modules.iter()
    }

    /// The main module (the host executable).
    pub fn main_module(&self) -> Option<&ModuleInfo> {
        self.modules.first()
    }

    /// The module whose image covers `addr`. Linear scan; the list is small.
    pub fn by_address(&self, addr: usize) -> Option<&ModuleInfo> {
        self.modules.iter().find(|m| m.contains(addr))
    }

    /// Looks a module up by file name, ignoring case.
    pub fn by_name(&self, name: &str) -> Option<&ModuleInfo> {
        self.modules
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(name))
    }
}
