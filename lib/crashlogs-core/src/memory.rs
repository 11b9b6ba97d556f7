//! Fault-safe memory probing.
//!
//! Everything the analyzer knows about the crashed process it learns by
//! reading memory that may be unmapped, guarded, or freed. All of those reads
//! go through [`MemorySource`], whose contract is "evaluate this read and on
//! fault report a short count" - never raise. The live implementation backs
//! this with `VirtualQuery` + `ReadProcessMemory` on the current process;
//! tests back it with a sparse in-memory address space.

use serde::{Deserialize, Serialize};

/// Longest C string the probe will recognize.
pub const MAX_STRING_LEN: usize = 1024;

/// How far back the prologue scan walks before giving up.
pub const MAX_PROLOGUE_SCAN: usize = 0x1000;

// Page protection bits, as reported by the OS for a queried page.
pub const PAGE_NOACCESS: u32 = 0x01;
pub const PAGE_READONLY: u32 = 0x02;
pub const PAGE_READWRITE: u32 = 0x04;
pub const PAGE_WRITECOPY: u32 = 0x08;
pub const PAGE_EXECUTE: u32 = 0x10;
pub const PAGE_EXECUTE_READ: u32 = 0x20;
pub const PAGE_EXECUTE_READWRITE: u32 = 0x40;
pub const PAGE_EXECUTE_WRITECOPY: u32 = 0x80;
pub const PAGE_GUARD: u32 = 0x100;
pub const PAGE_NOCACHE: u32 = 0x200;
pub const PAGE_WRITECOMBINE: u32 = 0x400;

pub const MEM_COMMIT: u32 = 0x1000;
pub const MEM_RESERVE: u32 = 0x2000;
pub const MEM_FREE: u32 = 0x10000;

pub const MEM_PRIVATE: u32 = 0x20000;
pub const MEM_MAPPED: u32 = 0x40000;
pub const MEM_IMAGE: u32 = 0x1000000;

const PAGE_EXECUTE_ANY: u32 =
    PAGE_EXECUTE | PAGE_EXECUTE_READ | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY;

/// Metadata of the page covering a queried address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    /// PAGE_* protection flags.
    pub protect: u32,
    /// MEM_COMMIT / MEM_RESERVE / MEM_FREE.
    pub state: u32,
    /// MEM_IMAGE / MEM_MAPPED / MEM_PRIVATE.
    pub kind: u32,
}

impl PageInfo {
    /// True if the page is committed (backed by actual storage).
    pub fn is_committed(&self) -> bool {
        self.state & MEM_COMMIT != 0
    }

    /// True if the page has any execute permission.
    pub fn is_executable(&self) -> bool {
        self.protect & PAGE_EXECUTE_ANY != 0
    }
}

/// Source of raw memory for the analysis pass.
///
/// Implementations must be safe to call with arbitrary untrusted addresses.
pub trait MemorySource {
    /// Page metadata for the page covering `addr`, if the OS can answer.
    fn page_info(&self, addr: usize) -> Option<PageInfo>;

    /// Copies up to `buf.len()` bytes starting at `addr` into `buf`.
    ///
    /// Returns the number of bytes actually copied. A fault mid-copy yields a
    /// short count (possibly zero), never a crash.
    fn read(&self, addr: usize, buf: &mut [u8]) -> usize;
}

/// A memory source with no backing address space. Every probe answers "no".
///
/// Used on hosts where the live process cannot be inspected.
#[derive(Debug, Default)]
pub struct DeadMemory;

impl MemorySource for DeadMemory {
    fn page_info(&self, _addr: usize) -> Option<PageInfo> {
        None
    }

    fn read(&self, _addr: usize, _buf: &mut [u8]) -> usize {
        0
    }
}

/// Renders PAGE_* protection flags symbolically, e.g. `PAGE_READONLY | PAGE_GUARD`.
pub fn protect_to_string(protect: u32) -> String {
    let mut names = Vec::new();
    if protect & PAGE_NOACCESS != 0 {
        names.push("PAGE_NOACCESS");
    }
    if protect & PAGE_READONLY != 0 {
        names.push("PAGE_READONLY");
    }
    if protect & PAGE_READWRITE != 0 {
        names.push("PAGE_READWRITE");
    }
    if protect & PAGE_WRITECOPY != 0 {
        names.push("PAGE_WRITECOPY");
    }
    if protect & PAGE_EXECUTE != 0 {
        names.push("PAGE_EXECUTE");
    }
    if protect & PAGE_EXECUTE_READ != 0 {
        names.push("PAGE_EXECUTE_READ");
    }
    if protect & PAGE_EXECUTE_READWRITE != 0 {
        names.push("PAGE_EXECUTE_READWRITE");
    }
    if protect & PAGE_EXECUTE_WRITECOPY != 0 {
        names.push("PAGE_EXECUTE_WRITECOPY");
    }
    if protect & PAGE_GUARD != 0 {
        names.push("PAGE_GUARD");
    }
    if protect & PAGE_NOCACHE != 0 {
        names.push("PAGE_NOCACHE");
    }
    if protect & PAGE_WRITECOMBINE != 0 {
        names.push("PAGE_WRITECOMBINE");
    }
    names.join(" | ")
}

/// Renders MEM_COMMIT / MEM_RESERVE / MEM_FREE symbolically.
pub fn state_to_string(state: u32) -> String {
    let mut names = Vec::new();
    if state & MEM_COMMIT != 0 {
        names.push("MEM_COMMIT");
    }
    if state & MEM_RESERVE != 0 {
        names.push("MEM_RESERVE");
    }
    if state & MEM_FREE != 0 {
        names.push("MEM_FREE");
    }
    names.join(" | ")
}

/// Renders MEM_IMAGE / MEM_MAPPED / MEM_PRIVATE symbolically.
pub fn kind_to_string(kind: u32) -> String {
    let mut names = Vec::new();
    if kind & MEM_IMAGE != 0 {
        names.push("MEM_IMAGE");
    }
    if kind & MEM_MAPPED != 0 {
        names.push("MEM_MAPPED");
    }
    if kind & MEM_PRIVATE != 0 {
        names.push("MEM_PRIVATE");
    }
    if names.is_empty() {
        return "Unknown".to_string();
    }
    names.join(" | ")
}

/// Function-entry byte patterns for the prologue scan, as little-endian
/// `(int3, first-prologue-byte)` pairs.
///
/// `CC E9` covers functions whose entry was replaced by a hook jump.
#[cfg(target_pointer_width = "64")]
pub const PROLOGUE_PATTERNS: &[u16] = &[0x40CC, 0x48CC, 0xE9CC];
#[cfg(not(target_pointer_width = "64"))]
pub const PROLOGUE_PATTERNS: &[u16] = &[0x55CC, 0xE9CC];

/// Safe, high-level probes over a [`MemorySource`].
pub struct MemoryProbe {
    source: Box<dyn MemorySource>,
}

impl MemoryProbe {
    pub fn new(source: Box<dyn MemorySource>) -> Self {
        Self { source }
    }

    /// Page metadata for `addr`.
    pub fn page_info(&self, addr: usize) -> Option<PageInfo> {
        self.source.page_info(addr)
    }

    /// True iff the page covering `addr` is committed.
    pub fn is_readable(&self, addr: usize) -> bool {
        self.source
            .page_info(addr)
            .is_some_and(|page| page.is_committed())
    }

    /// True iff `addr` lies in committed memory with execute permission.
    pub fn is_code(&self, addr: usize) -> bool {
        self.source
            .page_info(addr)
            .is_some_and(|page| page.is_committed() && page.is_executable())
    }

    /// Reads raw bytes; `None` unless all `len` bytes could be read.
    pub fn read_bytes(&self, addr: usize, len: usize) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; len];
        (self.source.read(addr, &mut buf) == len).then_some(buf)
    }

    /// Reads as many bytes as the source can provide, up to `len`.
    pub fn read_bytes_partial(&self, addr: usize, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let got = self.source.read(addr, &mut buf);
        buf.truncate(got);
        buf
    }

    /// Reads one pointer-sized word.
    pub fn read_word(&self, addr: usize) -> Option<usize> {
        let mut buf = [0u8; size_of::<usize>()];
        (self.source.read(addr, &mut buf) == buf.len()).then(|| usize::from_le_bytes(buf))
    }

    pub fn read_u16(&self, addr: usize) -> Option<u16> {
        let mut buf = [0u8; 2];
        (self.source.read(addr, &mut buf) == 2).then(|| u16::from_le_bytes(buf))
    }

    pub fn read_u32(&self, addr: usize) -> Option<u32> {
        let mut buf = [0u8; 4];
        (self.source.read(addr, &mut buf) == 4).then(|| u32::from_le_bytes(buf))
    }

    /// Recovers a NUL-terminated string at `addr`, applying the probe rules:
    /// length in `[1, 1024)` and every byte printable ASCII, `\n` or `\r`.
    pub fn read_c_string(&self, addr: usize) -> Option<String> {
        if !self.is_readable(addr) {
            return None;
        }

        let mut bytes = Vec::new();
        let mut pos = 0usize;
        while pos < MAX_STRING_LEN {
            let chunk_len = (MAX_STRING_LEN - pos).min(256);
            let chunk = self.read_bytes_partial(addr + pos, chunk_len);
            if chunk.is_empty() {
                // Ran into unreadable memory before a terminator.
                return None;
            }
            for &b in &chunk {
                if b == 0 {
                    if bytes.is_empty() {
                        return None;
                    }
                    return String::from_utf8(bytes).ok();
                }
                if !(32..127).contains(&b) && b != b'\n' && b != b'\r' {
                    return None;
                }
                bytes.push(b);
            }
            pos += chunk.len();
        }
        // No terminator within the limit.
        None
    }

    /// True iff `addr` points at a string [`read_c_string`] accepts.
    ///
    /// [`read_c_string`]: Self::read_c_string
    pub fn is_c_string(&self, addr: usize) -> bool {
        self.read_c_string(addr).is_some()
    }

    /// Prologue scan: walk backwards from `addr` looking for a function entry
    /// pattern directly behind `0xCC` padding.
    ///
    /// Returns the address of the first prologue byte, or `None` after
    /// `max_offset` bytes. Uses the patterns for the compile-time target.
    pub fn find_method_start(&self, addr: usize) -> Option<usize> {
        self.find_method_start_with(PROLOGUE_PATTERNS, addr, MAX_PROLOGUE_SCAN)
    }

    /// Prologue scan against an explicit pattern set.
    pub fn find_method_start_with(
        &self,
        patterns: &[u16],
        addr: usize,
        max_offset: usize,
    ) -> Option<usize> {
        for offset in 0..max_offset {
            let probe_at = addr.checked_sub(offset)?;
            let Some(pair) = self.read_u16(probe_at) else {
                return None;
            };
            if patterns.contains(&pair) {
                return Some(probe_at + 1);
            }
        }
        None
    }
}

/// Sparse in-memory address space used by tests across the crate.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;

    struct Region {
        base: usize,
        bytes: Vec<u8>,
        protect: u32,
        kind: u32,
    }

    /// A fake process address space: a handful of mapped regions, everything
    /// else unreadable.
    #[derive(Default)]
    pub(crate) struct SparseMemory {
        regions: Vec<Region>,
    }

    impl SparseMemory {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Maps `bytes` at `base` with read-write protection.
        pub(crate) fn map(&mut self, base: usize, bytes: Vec<u8>) -> &mut Self {
            self.map_with(base, bytes, PAGE_READWRITE, MEM_PRIVATE)
        }

        /// Maps `bytes` at `base` with execute-read protection.
        pub(crate) fn map_code(&mut self, base: usize, bytes: Vec<u8>) -> &mut Self {
            self.map_with(base, bytes, PAGE_EXECUTE_READ, MEM_IMAGE)
        }

        pub(crate) fn map_with(
            &mut self,
            base: usize,
            bytes: Vec<u8>,
            protect: u32,
            kind: u32,
        ) -> &mut Self {
            self.regions.push(Region {
                base,
                bytes,
                protect,
                kind,
            });
            self
        }

        /// Writes a pointer-sized little-endian word at `addr` inside an
        /// already-mapped region.
        pub(crate) fn put_word(&mut self, addr: usize, value: usize) -> &mut Self {
            let bytes = value.to_le_bytes();
            let region = self
                .regions
                .iter_mut()
                .find(|r| addr >= r.base && addr + bytes.len() <= r.base + r.bytes.len())
                .expect("put_word outside mapped regions");
            let start = addr - region.base;
            region.bytes[start..start + bytes.len()].copy_from_slice(&bytes);
            self
        }

        fn region_at(&self, addr: usize) -> Option<&Region> {
            self.regions
                .iter()
                .find(|r| addr >= r.base && addr < r.base + r.bytes.len())
        }
    }

    impl MemorySource for SparseMemory {
        fn page_info(&self, addr: usize) -> Option<PageInfo> {
            self.region_at(addr).map(|r| PageInfo {
                protect: r.protect,
                state: MEM_COMMIT,
                kind: r.kind,
            })
        }

        fn read(&self, addr: usize, buf: &mut [u8]) -> usize {
            let Some(region) = self.region_at(addr) else {
                return 0;
            };
            let start = addr - region.base;
            let avail = region.bytes.len() - start;
            let count = buf.len().min(avail);
            buf[..count].copy_from_slice(&region.bytes[start..start + count]);
            count
        }
    }

    pub(crate) fn probe_over(memory: SparseMemory) -> MemoryProbe {
        MemoryProbe::new(Box::new(memory))
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{SparseMemory, probe_over};
    use super::*;

    #[test]
    fn unmapped_memory_is_not_readable() {
        let probe = probe_over(SparseMemory::new());
        assert!(!probe.is_readable(0x1000));
        assert!(probe.read_word(0x1000).is_none());
        assert!(probe.read_bytes(0x1000, 4).is_none());
    }

    #[test]
    fn mapped_memory_reads_back() {
        let mut mem = SparseMemory::new();
        mem.map(0x1000, vec![1, 2, 3, 4]);
        let probe = probe_over(mem);
        assert!(probe.is_readable(0x1002));
        assert_eq!(probe.read_bytes(0x1000, 4), Some(vec![1, 2, 3, 4]));
        assert_eq!(probe.read_u16(0x1000), Some(0x0201));
    }

    #[test]
    fn read_stops_at_region_end() {
        let mut mem = SparseMemory::new();
        mem.map(0x1000, vec![0xAA; 8]);
        let probe = probe_over(mem);
        assert_eq!(probe.read_bytes_partial(0x1006, 16).len(), 2);
        assert!(probe.read_bytes(0x1006, 16).is_none());
    }

    #[test]
    fn code_pages_are_recognized() {
        let mut mem = SparseMemory::new();
        mem.map(0x1000, vec![0; 16]);
        mem.map_code(0x2000, vec![0x90; 16]);
        let probe = probe_over(mem);
        assert!(!probe.is_code(0x1000));
        assert!(probe.is_code(0x2000));
    }

    #[test]
    fn c_string_accepts_printable() {
        let mut mem = SparseMemory::new();
        mem.map(0x1000, b"hello\0".to_vec());
        let probe = probe_over(mem);
        assert_eq!(probe.read_c_string(0x1000), Some("hello".to_string()));
        assert!(probe.is_c_string(0x1000));
    }

    #[test]
    fn c_string_allows_newlines() {
        let mut mem = SparseMemory::new();
        mem.map(0x1000, b"line one\r\nline two\0".to_vec());
        let probe = probe_over(mem);
        assert!(probe.is_c_string(0x1000));
    }

    #[test]
    fn c_string_rejects_empty_control_and_unterminated() {
        let mut mem = SparseMemory::new();
        mem.map(0x1000, b"\0".to_vec());
        mem.map(0x2000, vec![0x01, b'a', 0]);
        mem.map(0x3000, b"no terminator".to_vec());
        let probe = probe_over(mem);
        assert!(!probe.is_c_string(0x1000));
        assert!(!probe.is_c_string(0x2000));
        assert!(!probe.is_c_string(0x3000));
        assert!(!probe.is_c_string(0x4000));
    }

    #[test]
    fn c_string_rejects_over_limit() {
        let mut mem = SparseMemory::new();
        let mut long = vec![b'a'; MAX_STRING_LEN];
        long.push(0);
        mem.map(0x1000, long);
        let probe = probe_over(mem);
        assert!(!probe.is_c_string(0x1000));
    }

    #[test]
    fn prologue_scan_finds_entry_behind_padding() {
        // CC 55 at 0x411000; the entry is the push at 0x411001.
        let mut bytes = vec![0xCC, 0x55, 0x89, 0xE5];
        bytes.resize(0x60, 0x90);
        let mut mem = SparseMemory::new();
        mem.map_code(0x411000, bytes);
        let probe = probe_over(mem);
        let found = probe.find_method_start_with(&[0x55CC, 0xE9CC], 0x411050, MAX_PROLOGUE_SCAN);
        assert_eq!(found, Some(0x411001));
    }

    #[test]
    fn prologue_scan_soundness() {
        let mut bytes = vec![0x90; 0x80];
        bytes[0x10] = 0xCC;
        bytes[0x11] = 0x48;
        let mut mem = SparseMemory::new();
        mem.map_code(0x500000, bytes);
        let probe = probe_over(mem);
        let addr = 0x500070;
        let start = probe
            .find_method_start_with(&[0x40CC, 0x48CC, 0xE9CC], addr, MAX_PROLOGUE_SCAN)
            .unwrap();
        assert!(addr - start <= MAX_PROLOGUE_SCAN);
        assert_eq!(probe.read_bytes(start - 1, 1), Some(vec![0xCC]));
    }

    #[test]
    fn prologue_scan_gives_up_on_exhaust() {
        let mut mem = SparseMemory::new();
        mem.map_code(0x10000, vec![0x90; 0x2000]);
        let probe = probe_over(mem);
        assert_eq!(probe.find_method_start(0x11800), None);
    }

    #[test]
    fn protection_rendering() {
        assert_eq!(
            protect_to_string(PAGE_READONLY | PAGE_GUARD),
            "PAGE_READONLY | PAGE_GUARD"
        );
        assert_eq!(protect_to_string(0), "");
        assert_eq!(state_to_string(MEM_COMMIT), "MEM_COMMIT");
        assert_eq!(kind_to_string(0), "Unknown");
        assert_eq!(kind_to_string(MEM_IMAGE), "MEM_IMAGE");
    }
}
