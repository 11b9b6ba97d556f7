//! Hardware summary for the crash report.

use std::fmt::Write as _;

/// Renders the `Hardware Information` section.
pub fn message() -> String {
    let mut out = String::new();
    let _ = writeln!(out, "- CPU: {}", cpu_brand());
    let _ = writeln!(out, "- Threads: {}", thread_count());
    if let Some(total_mb) = total_memory_mb() {
        let _ = writeln!(out, "- Physical Memory: {} MB", total_mb);
    }
    let _ = write!(out, "- OS: {} {}", std::env::consts::OS, std::env::consts::ARCH);
    out
}

fn thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// CPU brand string from the extended cpuid leaves.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn cpu_brand() -> String {
    #[cfg(target_arch = "x86")]
    use core::arch::x86::__cpuid;
    #[cfg(target_arch = "x86_64")]
    use core::arch::x86_64::__cpuid;

    let max_leaf = unsafe { __cpuid(0x8000_0000) }.eax;
    if max_leaf < 0x8000_0004 {
        return "Unknown".to_string();
    }

    let mut bytes = Vec::with_capacity(48);
    for leaf in 0x8000_0002u32..=0x8000_0004 {
        let regs = unsafe { __cpuid(leaf) };
        for value in [regs.eax, regs.ebx, regs.ecx, regs.edx] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
pub fn cpu_brand() -> String {
    "Unknown".to_string()
}

#[cfg(windows)]
fn total_memory_mb() -> Option<u64> {
    use windows::Win32::System::SystemInformation::{GlobalMemoryStatusEx, MEMORYSTATUSEX};

    let mut status = MEMORYSTATUSEX {
        dwLength: size_of::<MEMORYSTATUSEX>() as u32,
        ..MEMORYSTATUSEX::default()
    };
    unsafe { GlobalMemoryStatusEx(&mut status) }.ok()?;
    Some(status.ullTotalPhys / (1024 * 1024))
}

#[cfg(not(windows))]
fn total_memory_mb() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_has_cpu_and_os_lines() {
        let message = message();
        assert!(message.contains("- CPU: "), "{message}");
        assert!(message.contains("- OS: "), "{message}");
        assert!(!message.ends_with('\n'));
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    #[test]
    fn brand_string_is_reasonable() {
        let brand = cpu_brand();
        assert!(!brand.is_empty());
        assert!(brand.len() <= 48);
    }
}
