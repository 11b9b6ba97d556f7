//! Core library for the in-process crash analyzer.
//!
//! This crate implements the analysis engine that runs inside a process that
//! has just taken a hardware or structured exception:
//! - Fault-safe memory probing and value classification
//! - Exception code classification with per-code enrichment
//! - Symbolication (OS debug symbols, sideband address tables, prologue scan)
//! - Stack walking and raw stack dumps
//! - A memoized disassembler and the final text crash report
//!
//! Everything here is best-effort by contract: the one thing the analyzer
//! must never do is crash while analyzing a crash. Probes that touch
//! arbitrary memory go through [`memory::MemorySource`], which recovers from
//! faults instead of raising them.

pub mod analyzer;
pub mod context;
pub mod disasm;
pub mod exceptions;
pub mod memory;
pub mod modules;
pub mod report;
pub mod stack;
pub mod symbols;
pub mod values;
pub mod walker;

#[cfg(windows)]
pub mod platform;

use thiserror::Error;

pub use analyzer::Analyzer;
pub use context::{CpuContext, ExceptionSnapshot, ThreadIdentity};
pub use memory::{MemoryProbe, MemorySource};
pub use modules::{ModuleInfo, ModuleRegistry};
pub use symbols::{SymbolHit, SymbolTable};
pub use values::ValueType;

/// Error type for the analyzer's fallible edges.
///
/// Analysis itself never returns errors; these only show up at I/O seams
/// (loading sideband symbol tables) and platform session setup.
#[derive(Error, Debug)]
pub enum CrashError {
    /// Failed to read or parse a sideband symbol table.
    #[error("Symbol table error: {0}")]
    SymbolTable(String),

    /// The debug symbol session could not be initialized.
    #[error("Debug symbol session error: {0}")]
    SymbolSession(String),

    /// An underlying I/O operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A specialized Result type for analyzer operations.
pub type Result<T> = std::result::Result<T, CrashError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_symbol_table() {
        let err = CrashError::SymbolTable("bad offset".to_string());
        assert_eq!(err.to_string(), "Symbol table error: bad offset");
    }

    #[test]
    fn error_display_symbol_session() {
        let err = CrashError::SymbolSession("init failed".to_string());
        assert_eq!(err.to_string(), "Debug symbol session error: init failed");
    }
}
