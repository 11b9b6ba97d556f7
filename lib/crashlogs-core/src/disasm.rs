//! Memoized instruction decoding.
//!
//! One instruction per lookup, keyed by start address, decoded with an
//! Intel-syntax decoder at the compile-time target width. Undecodable or
//! unreadable addresses produce a zero-length record with empty text, which
//! is also what stops a range decode from spinning.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Mutex, OnceLock};

use iced_x86::{Decoder, DecoderOptions, Formatter, IntelFormatter};
use serde::{Deserialize, Serialize};

use crate::memory::MemoryProbe;

/// Longest x86 instruction.
pub const MAX_INSTRUCTION_LEN: usize = 16;

/// One decoded instruction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    /// Start address.
    pub address: usize,
    /// Raw bytes as uppercase hex, space separated.
    pub bytes: String,
    /// Intel-syntax text; empty when the address could not be decoded.
    pub text: String,
    /// Instruction length in bytes; 0 when undecodable.
    pub len: usize,
}

/// Address-keyed instruction cache.
///
/// The process-global instance is what the analyzer uses; tests build their
/// own so fixtures at the same fake address can't bleed into each other.
#[derive(Default)]
pub struct DisasmCache {
    cache: Mutex<HashMap<usize, Instruction>>,
}

impl DisasmCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes the instruction at `addr`, memoized.
    pub fn decode(&self, addr: usize, probe: &MemoryProbe) -> Instruction {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .entry(addr)
            .or_insert_with(|| decode_uncached(addr, probe))
            .clone()
    }

    /// Decodes `[start, end]` as a sequence, advancing by decoded lengths.
    ///
    /// The final instruction may start past `end - 1` when that's what it
    /// takes to cover `end`.
    pub fn decode_range(&self, start: usize, end: usize, probe: &MemoryProbe) -> Vec<Instruction> {
        let mut instructions = Vec::new();
        let mut addr = start;
        while addr <= end {
            let instruction = self.decode(addr, probe);
            let len = instruction.len;
            instructions.push(instruction);
            if len == 0 {
                break;
            }
            addr += len;
        }
        instructions
    }
}

/// The process-wide cache.
pub fn global() -> &'static DisasmCache {
    static CACHE: OnceLock<DisasmCache> = OnceLock::new();
    CACHE.get_or_init(DisasmCache::new)
}

fn decode_uncached(addr: usize, probe: &MemoryProbe) -> Instruction {
    let empty = Instruction {
        address: addr,
        ..Instruction::default()
    };

    let bytes = probe.read_bytes_partial(addr, MAX_INSTRUCTION_LEN);
    if bytes.is_empty() {
        return empty;
    }

    let bitness = if cfg!(target_pointer_width = "64") {
        64
    } else {
        32
    };
    let mut decoder = Decoder::with_ip(bitness, &bytes, addr as u64, DecoderOptions::NONE);
    let decoded = decoder.decode();
    if decoded.is_invalid() || decoded.len() > bytes.len() {
        return empty;
    }

    let mut text = String::new();
    IntelFormatter::new().format(&decoded, &mut text);

    let mut raw = String::new();
    for byte in &bytes[..decoded.len()] {
        if !raw.is_empty() {
            raw.push(' ');
        }
        let _ = write!(raw, "{byte:02X}");
    }

    Instruction {
        address: addr,
        bytes: raw,
        text,
        len: decoded.len(),
    }
}
