//! Value typing heuristics.
//!
//! Given a word plucked out of a register or the stack, guess what it is and
//! render a human description. The guesses are ordered: a readable NUL-
//! terminated string beats executable memory beats a recognizable framework
//! object beats a bare pointer; anything unreadable is rendered as its
//! signed/unsigned decimal interpretations.

use serde::{Deserialize, Serialize};

use crate::memory::MemoryProbe;
use crate::symbols::SymbolResolver;

/// Deref chains stop after this many arrows.
pub const MAX_DEREF_DEPTH: usize = 10;

/// What a word of memory appears to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Unknown,
    Pointer,
    Function,
    String,
    FrameworkObject,
}

/// A general register with its classified contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterSlot {
    pub name: String,
    pub value: usize,
    pub value_type: ValueType,
    pub description: String,
}

/// Classifies and describes raw words.
pub struct ValueClassifier<'a> {
    probe: &'a MemoryProbe,
    resolver: SymbolResolver<'a>,
}

impl<'a> ValueClassifier<'a> {
    pub fn new(probe: &'a MemoryProbe, resolver: SymbolResolver<'a>) -> Self {
        Self { probe, resolver }
    }

    /// Classifies `addr`. `Unknown` exactly when the address is unreadable.
    pub fn classify(&self, addr: usize) -> ValueType {
        if !self.probe.is_readable(addr) {
            return ValueType::Unknown;
        }
        if self.probe.is_c_string(addr) {
            return ValueType::String;
        }
        if self.probe.is_code(addr) {
            return ValueType::Function;
        }
        if self.framework_object_name(addr).is_some() {
            return ValueType::FrameworkObject;
        }
        ValueType::Pointer
    }

    /// Classifies `addr` and renders a description of what it points at.
    pub fn describe(&self, addr: usize) -> (ValueType, String) {
        match self.classify(addr) {
            ValueType::Function => (ValueType::Function, self.resolver.resolve(addr).render()),
            ValueType::String => {
                let text = self.probe.read_c_string(addr).unwrap_or_default();
                (ValueType::String, format!("&\"{text}\""))
            }
            ValueType::FrameworkObject => {
                let name = self.framework_object_name(addr).unwrap_or_default();
                (ValueType::FrameworkObject, format!("{name}*"))
            }
            ValueType::Pointer => (ValueType::Pointer, self.follow_pointer(addr, 0)),
            ValueType::Unknown => (
                ValueType::Unknown,
                format!("{}i | {}u", addr as isize, addr),
            ),
        }
    }

    /// Renders the chain behind a pointer, one `->` per hop.
    fn follow_pointer(&self, addr: usize, depth: usize) -> String {
        let Some(value) = self.probe.read_word(addr) else {
            return "-> <unreadable>".to_string();
        };
        if depth >= MAX_DEREF_DEPTH - 1 {
            return format!("-> 0x{value:X} [...]");
        }
        match self.classify(value) {
            ValueType::Function => {
                format!("-> 0x{value:X} -> {}", self.resolver.resolve(value).render())
            }
            ValueType::String => {
                let text = self.probe.read_c_string(value).unwrap_or_default();
                format!("-> 0x{value:X} -> &\"{text}\"")
            }
            ValueType::FrameworkObject => {
                let name = self.framework_object_name(value).unwrap_or_default();
                format!("-> 0x{value:X} -> {name}*")
            }
            ValueType::Pointer => {
                format!("-> 0x{value:X} {}", self.follow_pointer(value, depth + 1))
            }
            ValueType::Unknown => format!("-> 0x{value:X}"),
        }
    }

    /// Dynamic type name of a framework object, or `None` if `addr` doesn't
    /// look like one.
    ///
    /// The candidate must carry a readable vtable whose first method is
    /// executable, and MSVC RTTI metadata behind the vtable must name a
    /// class type.
    #[cfg(feature = "rtti")]
    fn framework_object_name(&self, addr: usize) -> Option<String> {
        let vptr = self.probe.read_word(addr)?;
        if !self.probe.is_readable(vptr) {
            return None;
        }
        let first_method = self.probe.read_word(vptr)?;
        if !self.probe.is_code(first_method) {
            return None;
        }
        let raw = self.rtti_type_name(vptr)?;
        if !raw.starts_with(".?AV") {
            return None;
        }
        Some(crate::symbols::demangle_type_descriptor(&raw))
    }

    #[cfg(not(feature = "rtti"))]
    fn framework_object_name(&self, _addr: usize) -> Option<String> {
        None
    }

    /// Reads the RTTI type-descriptor name reachable from a vtable pointer.
    ///
    /// The complete object locator sits one word before the vtable. On
    /// 64-bit its fields are image-relative and must be rebased through the
    /// locator's self-RVA; on 32-bit they are absolute pointers.
    #[cfg(feature = "rtti")]
    fn rtti_type_name(&self, vptr: usize) -> Option<String> {
        let word = size_of::<usize>();
        let locator = self.probe.read_word(vptr.checked_sub(word)?)?;

        let type_descriptor = if cfg!(target_pointer_width = "64") {
            let signature = self.probe.read_u32(locator)?;
            if signature != 1 {
                return None;
            }
            let self_rva = self.probe.read_u32(locator + 0x14)? as usize;
            let image_base = locator.checked_sub(self_rva)?;
            image_base + self.probe.read_u32(locator + 0x0C)? as usize
        } else {
            self.probe.read_u32(locator + 0x0C)? as usize
        };

        // TypeDescriptor: vftable pointer, spare pointer, then the name.
        self.probe.read_c_string(type_descriptor + 2 * word)
    }
}
