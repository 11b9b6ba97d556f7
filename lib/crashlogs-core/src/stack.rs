//! Raw stack window.
//!
//! A fixed-size dump of the words sitting at the stack pointer, each run
//! through the value classifier. Forensic display only; the stack trace comes
//! from the frame walker, never from here.

use serde::{Deserialize, Serialize};

use crate::memory::MemoryProbe;
use crate::values::{ValueClassifier, ValueType};

/// Number of words the stack window shows.
pub const STACK_WINDOW: usize = 32;

/// One word of the stack window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackWord {
    /// Address of the slot.
    pub address: usize,
    /// Word stored there (0 when unreadable).
    pub value: usize,
    pub value_type: ValueType,
    pub description: String,
}

/// Dumps `count` words starting at `sp`.
pub fn scan(
    sp: usize,
    count: usize,
    probe: &MemoryProbe,
    classifier: &ValueClassifier<'_>,
) -> Vec<StackWord> {
    let word = size_of::<usize>();
    (0..count)
        .map(|i| {
            let address = sp + i * word;
            match probe.read_word(address) {
                Some(value) => {
                    let (value_type, description) = classifier.describe(value);
                    StackWord {
                        address,
                        value,
                        value_type,
                        description,
                    }
                }
                None => StackWord {
                    address,
                    value: 0,
                    value_type: ValueType::Unknown,
                    description: "<unreadable>".to_string(),
                },
            }
        })
        .collect()
}
