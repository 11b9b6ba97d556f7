//! Crash report rendering.
//!
//! Deterministic text rendering of everything the analyzer produced, plus
//! the sections external collaborators hand in (loader metadata, installed
//! mods, hardware info). Section order and line formats are fixed; the only
//! nondeterminism is the timestamp and the quip at the top.

use std::fmt::Write as _;

use time::OffsetDateTime;
use time::macros::format_description;

use crate::context::{FlagBit, XmmRegister};
use crate::stack::StackWord;
use crate::values::RegisterSlot;
use crate::walker::Frame;

/// Report sections produced outside the analyzer core.
#[derive(Debug, Clone, Default)]
pub struct ExternalSections {
    /// Loader metadata (version, mod counts, load problems).
    pub geode_info: String,
    /// The installed-mod inventory.
    pub installed_mods: String,
    /// Hardware summary.
    pub hardware: String,
}

const QUIPS: &[&str] = &[
    "Everything was fine until it wasn't.",
    "Who needs valid pointers anyway?",
    "The game took an unscheduled break.",
    "Well, that's one way to exit the level.",
    "This crash has been brought to you by undefined behavior.",
    "Another null pointer bites the dust.",
    "At least it's not a BSOD.",
    "Practice makes perfect. This was practice.",
    "The stack trace below knows what it did.",
    "Have you tried turning it off and on again?",
    "Someone divided by zero, didn't they?",
    "A wild access violation appeared!",
    "Geometry Dash has left the chat.",
    "It worked on the developer's machine.",
    "Blame the mod with the longest name.",
    "The RAM is fine. Probably.",
];

/// Picks the quip shown at the top of the report.
pub fn pick_quip() -> &'static str {
    let seed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as usize)
        .unwrap_or(0);
    QUIPS[seed % QUIPS.len()]
}

/// Timestamp for the report header.
pub fn timestamp() -> String {
    let format = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    now().format(&format).unwrap_or_default()
}

/// Timestamp usable as a file name: `YYYY-MM-DD_HH-MM-SS`.
pub fn file_timestamp() -> String {
    let format = format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]");
    now().format(&format).unwrap_or_default()
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// Renders one stack-trace line (plus the source line, when known).
pub fn frame_line(frame: &Frame) -> String {
    let hit = &frame.symbol;
    let mut line = if hit.module.is_empty() && hit.function.is_empty() {
        format!("- 0x{:08X}", hit.address)
    } else if hit.module.is_empty() {
        format!("- 0x{:08X}+0x{:x}", hit.address, hit.function_offset)
    } else if hit.function.is_empty() {
        format!("- {}+0x{:X}", hit.module, hit.address)
    } else {
        format!(
            "- {}+0x{:X} ({}+0x{:x})",
            hit.module, hit.address, hit.function, hit.function_offset
        )
    };
    if !hit.file.is_empty() {
        let _ = write!(line, "\n  └ {}:{}", hit.file, hit.line);
    }
    line
}

/// Renders the whole stack trace.
pub fn trace_message(frames: &[Frame]) -> String {
    frames
        .iter()
        .map(frame_line)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Renders the register dump with the flag bits packed three per line and
/// the vector registers appended when present.
pub fn registers_message(
    registers: &[RegisterSlot],
    flags: &[FlagBit],
    vectors: &[XmmRegister],
) -> String {
    let mut message = String::new();
    for slot in registers {
        let _ = writeln!(
            message,
            "- {}: {:08X} ({})",
            slot.name, slot.value, slot.description
        );
    }
    for chunk in flags.chunks(3) {
        let rendered: Vec<String> = chunk
            .iter()
            .map(|flag| format!("{}: {}", flag.name, if flag.set { "1" } else { "0" }))
            .collect();
        let _ = writeln!(message, "- {}", rendered.join(" | "));
    }
    if !vectors.is_empty() {
        message.push_str(&vectors_message(vectors));
        message.push('\n');
    }
    message.pop();
    message
}

/// Renders the vector registers, one per line.
pub fn vectors_message(vectors: &[XmmRegister]) -> String {
    vectors
        .iter()
        .map(|reg| {
            let [l0, l1, l2, l3] = reg.lanes();
            format!("- {}: {} ({l0}, {l1}, {l2}, {l3})", reg.name, reg.hex())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Renders the raw stack window.
pub fn stack_message(words: &[StackWord]) -> String {
    words
        .iter()
        .map(|word| {
            format!(
                "- 0x{:X}: {:08X} ({})",
                word.address, word.value, word.description
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Assembles the final report text in the fixed section order.
pub fn assemble(
    external: &ExternalSections,
    exception_message: &str,
    trace: &str,
    registers: &str,
    stack: &str,
) -> String {
    format!(
        "{}\n{}\n\n\
         == Geode Information ==\n{}\n\n\
         == Exception Information ==\n{}\n\n\
         == Stack Trace ==\n{}\n\n\
         == Register States ==\n{}\n\n\
         == Installed Mods ==\n{}\n\n\
         == Stack Allocations ==\n{}\n\n\
         == Hardware Information ==\n{}",
        timestamp(),
        pick_quip(),
        external.geode_info,
        exception_message,
        trace,
        registers,
        external.installed_mods,
        stack,
        external.hardware,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::SymbolHit;
    use crate::values::ValueType;

    fn frame(hit: SymbolHit) -> Frame {
        Frame {
            address: 0,
            module: None,
            module_offset: hit.address,
            symbol: hit,
            frame_pointer: 0,
        }
    }

    #[test]
    fn frame_line_forms() {
        let bare = frame(SymbolHit {
            address: 0x77001234,
            ..SymbolHit::default()
        });
        assert_eq!(frame_line(&bare), "- 0x77001234");

        let module_only = frame(SymbolHit {
            module: "game.exe".to_string(),
            address: 0x1F2E,
            ..SymbolHit::default()
        });
        assert_eq!(frame_line(&module_only), "- game.exe+0x1F2E");

        let full = frame(SymbolHit {
            module: "game.exe".to_string(),
            address: 0x1F2E,
            function: "PlayLayer::update".to_string(),
            function_offset: 0x2E,
            ..SymbolHit::default()
        });
        assert_eq!(
            frame_line(&full),
            "- game.exe+0x1F2E (PlayLayer::update+0x2e)"
        );
    }

    #[test]
    fn frame_line_attaches_source() {
        let with_source = frame(SymbolHit {
            module: "geode.dll".to_string(),
            address: 0x100,
            function: "hook_entry".to_string(),
            function_offset: 4,
            file: "src/hooks.cpp".to_string(),
            line: 88,
        });
        assert_eq!(
            frame_line(&with_source),
            "- geode.dll+0x100 (hook_entry+0x4)\n  └ src/hooks.cpp:88"
        );
    }

    #[test]
    fn registers_message_format() {
        let slots = vec![RegisterSlot {
            name: "EAX".to_string(),
            value: 0x10020000,
            value_type: ValueType::String,
            description: "&\"hello\"".to_string(),
        }];
        let flags = crate::context::cpu_flags(0x40);
        let message = registers_message(&slots, &flags, &[]);
        assert!(message.contains("- EAX: 10020000 (&\"hello\")"), "{message}");
        assert!(message.contains("ZF: 1"), "{message}");
        // Three flags per line: 9 flags on 3 lines, plus the register line.
        assert_eq!(message.lines().count(), 4);
        let flag_line = message.lines().nth(1).unwrap();
        assert_eq!(flag_line, "- CF: 0 | PF: 0 | AF: 0");
    }

    #[test]
    fn stack_message_format() {
        let words = vec![StackWord {
            address: 0x19F8A0,
            value: 0x401000,
            value_type: ValueType::Unknown,
            description: "4198400i | 4198400u".to_string(),
        }];
        assert_eq!(
            stack_message(&words),
            "- 0x19F8A0: 00401000 (4198400i | 4198400u)"
        );
    }

    #[test]
    fn assembled_report_has_fixed_section_order() {
        let external = ExternalSections {
            geode_info: "- Loader Version: 4.3.1".to_string(),
            installed_mods: "x | [1.0.0] someone.testmod".to_string(),
            hardware: "- CPU: TestCPU".to_string(),
        };
        let report = assemble(&external, "EXC", "TRACE", "REGS", "STACK");

        let sections = [
            "== Geode Information ==",
            "== Exception Information ==",
            "== Stack Trace ==",
            "== Register States ==",
            "== Installed Mods ==",
            "== Stack Allocations ==",
            "== Hardware Information ==",
        ];
        let mut last = 0;
        for section in sections {
            let pos = report.find(section).unwrap_or_else(|| panic!("{section} missing"));
            assert!(pos > last, "{section} out of order");
            last = pos;
        }
        assert!(report.contains("- Loader Version: 4.3.1"));
        assert!(report.contains("TRACE"));
        assert!(QUIPS.iter().any(|quip| report.contains(quip)));
    }

    #[test]
    fn timestamps_are_well_formed() {
        let iso = timestamp();
        assert_eq!(iso.len(), 19, "{iso}");
        assert!(iso.contains('T'));
        let file = file_timestamp();
        assert_eq!(file.len(), 19, "{file}");
        assert!(!file.contains(':'));
    }
}
