//! Exception code classification and per-code enrichment.
//!
//! Maps platform exception codes to names, renders the parameter words, and
//! digs out code-specific details: the touched page for access violations,
//! the opcode for illegal instructions, the thrown type for C++ exceptions,
//! and the reason strings the host attaches to its own trap codes.

use crate::context::ExceptionSnapshot;
use crate::memory::{self, MemoryProbe, PageInfo};
use crate::symbols::{SymbolResolver, demangle_type_descriptor};

pub const EXCEPTION_GUARD_PAGE: u32 = 0x8000_0001;
pub const EXCEPTION_DATATYPE_MISALIGNMENT: u32 = 0x8000_0002;
pub const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;
pub const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;
pub const EXCEPTION_ACCESS_VIOLATION: u32 = 0xC000_0005;
pub const EXCEPTION_IN_PAGE_ERROR: u32 = 0xC000_0006;
pub const EXCEPTION_INVALID_HANDLE: u32 = 0xC000_0008;
pub const EXCEPTION_ILLEGAL_INSTRUCTION: u32 = 0xC000_001D;
pub const EXCEPTION_NONCONTINUABLE_EXCEPTION: u32 = 0xC000_0025;
pub const EXCEPTION_INVALID_DISPOSITION: u32 = 0xC000_0026;
pub const EXCEPTION_ARRAY_BOUNDS_EXCEEDED: u32 = 0xC000_008C;
pub const EXCEPTION_FLT_DENORMAL_OPERAND: u32 = 0xC000_008D;
pub const EXCEPTION_FLT_DIVIDE_BY_ZERO: u32 = 0xC000_008E;
pub const EXCEPTION_FLT_INEXACT_RESULT: u32 = 0xC000_008F;
pub const EXCEPTION_FLT_INVALID_OPERATION: u32 = 0xC000_0090;
pub const EXCEPTION_FLT_OVERFLOW: u32 = 0xC000_0091;
pub const EXCEPTION_FLT_STACK_CHECK: u32 = 0xC000_0092;
pub const EXCEPTION_FLT_UNDERFLOW: u32 = 0xC000_0093;
pub const EXCEPTION_INT_DIVIDE_BY_ZERO: u32 = 0xC000_0094;
pub const EXCEPTION_INT_OVERFLOW: u32 = 0xC000_0095;
pub const EXCEPTION_PRIV_INSTRUCTION: u32 = 0xC000_0096;
pub const EXCEPTION_STACK_OVERFLOW: u32 = 0xC000_00FD;

/// The MSVC C++ `throw` pseudo-exception.
pub const CPP_EXCEPTION: u32 = 0xE06D_7363;
/// Magic carried in parameter 0 of [`CPP_EXCEPTION`] records.
pub const CPP_EXCEPTION_MAGIC: usize = 0x1993_0520;

// Host-defined trap codes raised by the mod loader.
pub const GEODE_UNREACHABLE: u32 = 0x4000_001E;
pub const GEODE_TERMINATE: u32 = 0x4000_001F;
pub const GEODE_MISSING_IMPORT: u32 = 0x4000_0021;

/// Human name for a platform exception code.
pub fn name(code: u32) -> &'static str {
    match code {
        EXCEPTION_GUARD_PAGE => "EXCEPTION_GUARD_PAGE",
        EXCEPTION_DATATYPE_MISALIGNMENT => "EXCEPTION_DATATYPE_MISALIGNMENT",
        EXCEPTION_BREAKPOINT => "EXCEPTION_BREAKPOINT",
        EXCEPTION_SINGLE_STEP => "EXCEPTION_SINGLE_STEP",
        EXCEPTION_ACCESS_VIOLATION => "EXCEPTION_ACCESS_VIOLATION",
        EXCEPTION_IN_PAGE_ERROR => "EXCEPTION_IN_PAGE_ERROR",
        EXCEPTION_INVALID_HANDLE => "EXCEPTION_INVALID_HANDLE",
        EXCEPTION_ILLEGAL_INSTRUCTION => "EXCEPTION_ILLEGAL_INSTRUCTION",
        EXCEPTION_NONCONTINUABLE_EXCEPTION => "EXCEPTION_NONCONTINUABLE_EXCEPTION",
        EXCEPTION_INVALID_DISPOSITION => "EXCEPTION_INVALID_DISPOSITION",
        EXCEPTION_ARRAY_BOUNDS_EXCEEDED => "EXCEPTION_ARRAY_BOUNDS_EXCEEDED",
        EXCEPTION_FLT_DENORMAL_OPERAND => "EXCEPTION_FLT_DENORMAL_OPERAND",
        EXCEPTION_FLT_DIVIDE_BY_ZERO => "EXCEPTION_FLT_DIVIDE_BY_ZERO",
        EXCEPTION_FLT_INEXACT_RESULT => "EXCEPTION_FLT_INEXACT_RESULT",
        EXCEPTION_FLT_INVALID_OPERATION => "EXCEPTION_FLT_INVALID_OPERATION",
        EXCEPTION_FLT_OVERFLOW => "EXCEPTION_FLT_OVERFLOW",
        EXCEPTION_FLT_STACK_CHECK => "EXCEPTION_FLT_STACK_CHECK",
        EXCEPTION_FLT_UNDERFLOW => "EXCEPTION_FLT_UNDERFLOW",
        EXCEPTION_INT_DIVIDE_BY_ZERO => "EXCEPTION_INT_DIVIDE_BY_ZERO",
        EXCEPTION_INT_OVERFLOW => "EXCEPTION_INT_OVERFLOW",
        EXCEPTION_PRIV_INSTRUCTION => "EXCEPTION_PRIV_INSTRUCTION",
        EXCEPTION_STACK_OVERFLOW => "EXCEPTION_STACK_OVERFLOW",
        CPP_EXCEPTION => "C++ Exception",
        GEODE_UNREACHABLE => "GEODE_UNREACHABLE",
        GEODE_TERMINATE => "GEODE_TERMINATE",
        GEODE_MISSING_IMPORT => "GEODE_MISSING_IMPORT",
        _ => "Unknown exception",
    }
}

/// Hex-comma-joined exception parameter words.
pub fn parameters(snapshot: &ExceptionSnapshot) -> String {
    snapshot
        .parameters
        .iter()
        .map(|p| format!("0x{p:X}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Code-specific detail block, or empty when the code has none.
pub fn extra(snapshot: &ExceptionSnapshot, probe: &MemoryProbe) -> String {
    match snapshot.code {
        EXCEPTION_ACCESS_VIOLATION => access_violation_extra(snapshot, probe),
        EXCEPTION_ILLEGAL_INSTRUCTION => illegal_instruction_extra(snapshot, probe),
        CPP_EXCEPTION => cpp_exception_extra(snapshot, probe),
        GEODE_MISSING_IMPORT => missing_import_extra(snapshot, probe),
        GEODE_TERMINATE | GEODE_UNREACHABLE => host_trap_extra(snapshot, probe),
        _ => String::new(),
    }
}

/// The fixed exception header shown at the top of the report.
pub fn header(
    snapshot: &ExceptionSnapshot,
    probe: &MemoryProbe,
    resolver: &SymbolResolver<'_>,
) -> String {
    let start = if snapshot.thread.start_address == 0 {
        "0x0".to_string()
    } else {
        resolver.resolve(snapshot.thread.start_address).render()
    };
    let extra = extra(snapshot, probe);
    format!(
        "- Thread Information: {}\n\
         - Thread Start: {}\n\
         - Exception Code: {} (0x{:X})\n\
         - Exception Address: 0x{:08X} ({})\n\
         - Exception Flags: 0x{:X}\n\
         - Exception Parameters: {}{}",
        snapshot.thread.describe(),
        start,
        name(snapshot.code),
        snapshot.code,
        snapshot.address,
        resolver.resolve(snapshot.address).render(),
        snapshot.flags,
        parameters(snapshot),
        if extra.is_empty() {
            String::new()
        } else {
            format!("\n{extra}")
        },
    )
}

fn access_violation_extra(snapshot: &ExceptionSnapshot, probe: &MemoryProbe) -> String {
    let operation = snapshot.parameters.first().copied().unwrap_or(0);
    let target = snapshot.parameters.get(1).copied().unwrap_or(0);

    let operation_name = match operation {
        0 => "Read",
        1 => "Write",
        8 => "DEP",
        _ => "Unknown",
    };

    if operation == 8 {
        return format!(
            "- Access Violation Type: DEP\n- Access Violation Address: 0x{target:X}"
        );
    }

    let page = probe.page_info(target).unwrap_or(PageInfo {
        protect: 0,
        state: 0,
        kind: 0,
    });
    format!(
        "- Access Violation Type: {}\n\
         - Access Violation Address: 0x{:08X}\n\
         - Protect: {} (0x{:X})\n\
         - State: {} (0x{:X})\n\
         - Type: {} (0x{:X})",
        operation_name,
        target,
        memory::protect_to_string(page.protect),
        page.protect,
        memory::state_to_string(page.state),
        page.state,
        memory::kind_to_string(page.kind),
        page.kind,
    )
}

fn illegal_instruction_extra(snapshot: &ExceptionSnapshot, probe: &MemoryProbe) -> String {
    let opcode = match probe.read_u16(snapshot.address) {
        Some(opcode) => format!("0x{opcode:X}"),
        None => "<unreadable>".to_string(),
    };
    format!(
        "- Illegal Instruction Address: 0x{:X}\n- Illegal Instruction Code: {}",
        snapshot.address, opcode
    )
}

fn missing_import_extra(snapshot: &ExceptionSnapshot, probe: &MemoryProbe) -> String {
    let module = snapshot
        .parameters
        .first()
        .and_then(|&p| probe.read_c_string(p))
        .unwrap_or_else(|| "<unknown>".to_string());
    let symbol = snapshot
        .parameters
        .get(1)
        .and_then(|&p| probe.read_c_string(p))
        .unwrap_or_else(|| "<unknown>".to_string());
    format!("- Missing Module: {module}\n- Missing Symbol: {symbol}")
}

fn host_trap_extra(snapshot: &ExceptionSnapshot, probe: &MemoryProbe) -> String {
    let reason = snapshot
        .parameters
        .first()
        .and_then(|&p| probe.read_c_string(p))
        .unwrap_or_else(|| "<unknown>".to_string());
    let mod_id = snapshot
        .parameters
        .get(1)
        .and_then(|&p| probe.read_c_string(p))
        .unwrap_or_else(|| "<unknown>".to_string());
    format!("- Reason: {reason}\n- Mod: {mod_id}")
}

/// The MSVC type descriptor name of `class std::exception`.
const STD_EXCEPTION_DESCRIPTOR: &str = ".?AVexception@std@@";

/// Reconstructs the thrown type from the throw-info chain.
///
/// Parameter layout of the C++ throw pseudo-exception: magic, object,
/// throw-info, and (64-bit only) the image base every RVA in the chain is
/// relative to. On 32-bit the same fields hold absolute pointers, which the
/// zero image base leaves untouched.
fn cpp_exception_extra(snapshot: &ExceptionSnapshot, probe: &MemoryProbe) -> String {
    const NO_DATA: &str = "- C++ Exception: <no SEH data available>";

    let object = snapshot.parameters.get(1).copied().unwrap_or(0);
    let throw_info = snapshot.parameters.get(2).copied().unwrap_or(0);
    let image_base = snapshot.parameters.get(3).copied().unwrap_or(0);
    if throw_info == 0 {
        return NO_DATA.to_string();
    }
    let rebase = |rva: u32| -> Option<usize> {
        (rva != 0).then(|| image_base.wrapping_add(rva as usize))
    };

    // ThrowInfo: attributes, unwind, forward-compat, catchable-type-array.
    let Some(cta) = probe.read_u32(throw_info + 0x0C).and_then(rebase) else {
        return NO_DATA.to_string();
    };
    let Some(count) = probe.read_u32(cta) else {
        return NO_DATA.to_string();
    };

    let word = size_of::<usize>();
    let mut names = Vec::new();
    for i in 0..count.min(16) as usize {
        // CatchableType: properties, then the type-descriptor reference.
        let Some(catchable) = probe.read_u32(cta + 4 + 4 * i).and_then(rebase) else {
            continue;
        };
        let Some(descriptor) = probe.read_u32(catchable + 4).and_then(rebase) else {
            continue;
        };
        if let Some(name) = probe.read_c_string(descriptor + 2 * word) {
            names.push(name);
        }
    }

    let Some(first) = names.first() else {
        return NO_DATA.to_string();
    };
    let type_name = demangle_type_descriptor(first);

    // Standard exceptions carry their message right behind the vtable
    // pointer; read it from there instead of calling into the dying process.
    if names.iter().any(|n| n.as_str() == STD_EXCEPTION_DESCRIPTOR)
        && let Some(what_ptr) = probe.read_word(object + word)
        && let Some(what) = probe.read_c_string(what_ptr)
    {
        return format!("- C++ Exception: {type_name}(\"{what}\")");
    }
    format!("- C++ Exception: type '{type_name}'")
}
