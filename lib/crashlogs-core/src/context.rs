//! Architecture-normalized thread context.
//!
//! The platform hands us a raw thread-context record at fault time; this
//! module snapshots it into plain values (register list, instruction/stack/
//! frame pointers, flags word, vector registers) so the rest of the analyzer
//! never touches the live record again.

use serde::{Deserialize, Serialize};

/// CPU flag bits in display order: name and bit position in the flags word.
pub const FLAG_BITS: &[(&str, u32)] = &[
    ("CF", 0),
    ("PF", 2),
    ("AF", 4),
    ("ZF", 6),
    ("SF", 7),
    ("TF", 8),
    ("IF", 9),
    ("DF", 10),
    ("OF", 11),
];

/// One CPU flag and whether it was set at fault time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlagBit {
    pub name: &'static str,
    pub set: bool,
}

/// Extracts the fixed flag set from a flags word.
pub fn cpu_flags(flags: u32) -> Vec<FlagBit> {
    FLAG_BITS
        .iter()
        .map(|&(name, bit)| FlagBit {
            name,
            set: flags & (1 << bit) != 0,
        })
        .collect()
}

/// A 128-bit vector register, exposed as halves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct XmmRegister {
    pub name: String,
    pub lo: u64,
    pub hi: u64,
}

impl XmmRegister {
    /// The four IEEE-754 single-precision lanes, low lane first.
    pub fn lanes(&self) -> [f32; 4] {
        [
            f32::from_bits(self.lo as u32),
            f32::from_bits((self.lo >> 32) as u32),
            f32::from_bits(self.hi as u32),
            f32::from_bits((self.hi >> 32) as u32),
        ]
    }

    /// `"hi lo"` hex rendering of the halves.
    pub fn hex(&self) -> String {
        format!("{:016X} {:016X}", self.hi, self.lo)
    }
}

/// Snapshot of a thread's register state, normalized across architectures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuContext {
    /// General registers in display order.
    pub registers: Vec<(String, usize)>,
    /// Instruction pointer.
    pub ip: usize,
    /// Stack pointer.
    pub sp: usize,
    /// Frame pointer.
    pub fp: usize,
    /// Raw flags word.
    pub flags: u32,
    /// XMM0..XMM7; empty on 32-bit targets.
    pub xmm: Vec<XmmRegister>,
}

impl CpuContext {
    /// Value of a general register by name.
    pub fn register(&self, name: &str) -> Option<usize> {
        self.registers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }
}

/// Identity of the thread that raised the exception.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadIdentity {
    /// OS thread id.
    pub id: u32,
    /// OS-level thread name, if one was set.
    pub name: Option<String>,
    /// Thread start address; 0 when the OS query is unavailable.
    pub start_address: usize,
}

impl ThreadIdentity {
    /// The host names its designated main thread "Main".
    pub fn is_main(&self) -> bool {
        self.name.as_deref() == Some("Main")
    }

    /// `"name" (ID: id)` or `(ID: id)` when unnamed.
    pub fn describe(&self) -> String {
        match &self.name {
            Some(name) => format!("\"{name}\" (ID: {})", self.id),
            None => format!("(ID: {})", self.id),
        }
    }
}

/// Value-typed capture of a platform exception record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExceptionSnapshot {
    /// Platform exception code.
    pub code: u32,
    /// Exception flags word.
    pub flags: u32,
    /// Faulting instruction address.
    pub address: usize,
    /// Exception parameter words.
    pub parameters: Vec<usize>,
    /// Thread context at the fault.
    pub context: CpuContext,
    /// The faulting thread.
    pub thread: ThreadIdentity,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_word_0x40_sets_only_zf() {
        let flags = cpu_flags(0x0000_0040);
        for flag in &flags {
            if flag.name == "ZF" {
                assert!(flag.set);
            } else {
                assert!(!flag.set, "{} unexpectedly set", flag.name);
            }
        }
    }

    #[test]
    fn flag_bits_match_documented_positions() {
        for &(name, bit) in FLAG_BITS {
            let flags = cpu_flags(1 << bit);
            let hit = flags.iter().find(|f| f.name == name).unwrap();
            assert!(hit.set);
            assert_eq!(flags.iter().filter(|f| f.set).count(), 1);
        }
    }

    #[test]
    fn flag_order_is_fixed() {
        let names: Vec<&str> = cpu_flags(0).iter().map(|f| f.name).collect();
        assert_eq!(
            names,
            ["CF", "PF", "AF", "ZF", "SF", "TF", "IF", "DF", "OF"]
        );
    }

    #[test]
    fn xmm_lanes_split_the_halves() {
        let reg = XmmRegister {
            name: "XMM0".to_string(),
            lo: ((2.0f32.to_bits() as u64) << 32) | 1.0f32.to_bits() as u64,
            hi: ((4.0f32.to_bits() as u64) << 32) | 3.0f32.to_bits() as u64,
        };
        assert_eq!(reg.lanes(), [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn xmm_hex_is_hi_then_lo() {
        let reg = XmmRegister {
            name: "XMM1".to_string(),
            lo: 0x1122334455667788,
            hi: 0x99AABBCCDDEEFF00,
        };
        assert_eq!(reg.hex(), "99AABBCCDDEEFF00 1122334455667788");
    }

    #[test]
    fn register_lookup_by_name() {
        let ctx = CpuContext {
            registers: vec![("EAX".to_string(), 0x1234), ("EBX".to_string(), 0x5678)],
            ..CpuContext::default()
        };
        assert_eq!(ctx.register("EAX"), Some(0x1234));
        assert_eq!(ctx.register("ECX"), None);
    }

    #[test]
    fn main_thread_is_named_main() {
        let main = ThreadIdentity {
            id: 1,
            name: Some("Main".to_string()),
            start_address: 0,
        };
        let worker = ThreadIdentity {
            id: 2,
            name: Some("AudioWorker".to_string()),
            start_address: 0,
        };
        let unnamed = ThreadIdentity::default();
        assert!(main.is_main());
        assert!(!worker.is_main());
        assert!(!unnamed.is_main());
    }

    #[test]
    fn thread_describe_forms() {
        let named = ThreadIdentity {
            id: 7,
            name: Some("Main".to_string()),
            start_address: 0,
        };
        let unnamed = ThreadIdentity {
            id: 9,
            name: None,
            start_address: 0,
        };
        assert_eq!(named.describe(), "\"Main\" (ID: 7)");
        assert_eq!(unnamed.describe(), "(ID: 9)");
    }
}
