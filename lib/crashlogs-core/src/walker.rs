//! Frame unwinding.
//!
//! Walks activation records starting from the faulted context and attaches
//! symbol information to each. The platform walker (DbgHelp) is used when
//! available; the frame-pointer-chain walker backs tests and hosts without
//! one. Both stop instead of erroring: a torn stack yields the frames
//! collected so far.

use serde::{Deserialize, Serialize};

use crate::context::CpuContext;
use crate::memory::MemoryProbe;
use crate::modules::{ModuleInfo, ModuleRegistry};
use crate::symbols::{SymbolHit, SymbolResolver};

/// A raw unwound frame: program counter, stack pointer, frame pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame {
    pub pc: usize,
    pub sp: usize,
    pub fp: usize,
}

/// One fully-annotated stack frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Absolute program-counter address.
    pub address: usize,
    /// Owning module, when the address lies inside one.
    pub module: Option<ModuleInfo>,
    /// Offset from the owning module's base.
    pub module_offset: usize,
    /// Best symbol recovered for the address.
    pub symbol: SymbolHit,
    /// The frame pointer the walker reported for this frame.
    pub frame_pointer: usize,
}

/// Strategy for unwinding raw frames out of a captured context.
pub trait StackUnwinder {
    /// Unwinds up to `max_frames` frames. Never fails; a walker error just
    /// ends the list.
    fn walk(&self, ctx: &CpuContext, probe: &MemoryProbe, max_frames: usize) -> Vec<RawFrame>;
}

/// Augmented unwind information for dynamically generated code.
///
/// A hook engine that emits trampolines can register one of these so the
/// walker can traverse its ranges; it is consulted before the OS defaults.
pub trait UnwindTables: Send {
    /// Unwind function-table entry covering `addr`, if the hook owns it.
    fn function_table_entry(&self, addr: u64) -> Option<*mut core::ffi::c_void>;

    /// Module base for `addr`, if the hook owns the range.
    fn module_base(&self, addr: u64) -> Option<u64>;
}

/// Frame-pointer-chain unwinder.
///
/// Assumes the conventional prologue layout: `[fp]` holds the caller's frame
/// pointer and `[fp + word]` the return address. Stops on the first frame
/// that breaks the chain or fails to move the frame pointer strictly upward.
#[derive(Debug, Default)]
pub struct FramePointerUnwinder;

impl StackUnwinder for FramePointerUnwinder {
    fn walk(&self, ctx: &CpuContext, probe: &MemoryProbe, max_frames: usize) -> Vec<RawFrame> {
        let word = size_of::<usize>();
        let mut frames = Vec::new();
        if ctx.ip == 0 {
            return frames;
        }
        frames.push(RawFrame {
            pc: ctx.ip,
            sp: ctx.sp,
            fp: ctx.fp,
        });

        let mut fp = ctx.fp;
        while frames.len() < max_frames {
            let Some(saved_fp) = probe.read_word(fp) else {
                break;
            };
            let Some(ret) = probe.read_word(fp + word) else {
                break;
            };
            if ret == 0 {
                break;
            }
            // A chain that stops climbing is broken or hand-forged.
            if saved_fp <= fp {
                break;
            }
            frames.push(RawFrame {
                pc: ret,
                sp: fp + 2 * word,
                fp: saved_fp,
            });
            fp = saved_fp;
        }
        frames
    }
}

/// Annotates raw frames with modules and symbols.
pub fn collect_frames(
    raw: &[RawFrame],
    modules: &ModuleRegistry,
    resolver: &SymbolResolver<'_>,
) -> Vec<Frame> {
    raw.iter()
        .map(|frame| {
            let module = modules.by_address(frame.pc).cloned();
            let module_offset = module
                .as_ref()
                .map(|m| frame.pc - m.base)
                .unwrap_or(frame.pc);
            Frame {
                address: frame.pc,
                module,
                module_offset,
                symbol: resolver.resolve(frame.pc),
                frame_pointer: frame.fp,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::fake::{SparseMemory, probe_over};
    use crate::symbols::SidebandTables;

    fn context(ip: usize, sp: usize, fp: usize) -> CpuContext {
        CpuContext {
            ip,
            sp,
            fp,
            ..CpuContext::default()
        }
    }

    /// Builds a classic frame chain: each frame stores (saved fp, ret addr).
    fn chain(frames: &[(usize, usize)], top_fp: usize) -> SparseMemory {
        let word = size_of::<usize>();
        let mut mem = SparseMemory::new();
        mem.map(0x100000, vec![0u8; 0x10000]);
        let mut fp = top_fp;
        for &(saved_fp, ret) in frames {
            mem.put_word(fp, saved_fp);
            mem.put_word(fp + word, ret);
            fp = saved_fp;
        }
        mem
    }

    #[test]
    fn walks_a_frame_chain() {
        let mem = chain(
            &[(0x100100, 0x401000), (0x100200, 0x402000), (0, 0)],
            0x100000,
        );
        let probe = probe_over(mem);
        let ctx = context(0x400500, 0x0FFF00, 0x100000);
        let frames = FramePointerUnwinder.walk(&ctx, &probe, 64);
        let pcs: Vec<usize> = frames.iter().map(|f| f.pc).collect();
        assert_eq!(pcs, vec![0x400500, 0x401000, 0x402000]);
    }

    #[test]
    fn stops_on_zero_pc() {
        let mem = chain(&[(0x100100, 0)], 0x100000);
        let probe = probe_over(mem);
        let ctx = context(0x400500, 0x0FFF00, 0x100000);
        let frames = FramePointerUnwinder.walk(&ctx, &probe, 64);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn stops_when_frame_pointer_does_not_climb() {
        // Self-referential frame: saved fp == fp.
        let mem = chain(&[(0x100000, 0x401000)], 0x100000);
        let probe = probe_over(mem);
        let ctx = context(0x400500, 0x0FFF00, 0x100000);
        let frames = FramePointerUnwinder.walk(&ctx, &probe, 64);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn frame_pointers_strictly_increase() {
        let mem = chain(
            &[(0x100100, 0x401000), (0x100200, 0x402000), (0, 0)],
            0x100000,
        );
        let probe = probe_over(mem);
        let ctx = context(0x400500, 0x0FFF00, 0x100000);
        let frames = FramePointerUnwinder.walk(&ctx, &probe, 64);
        for pair in frames.windows(2) {
            assert!(pair[1].fp > pair[0].fp);
        }
    }

    #[test]
    fn stops_on_unreadable_frame() {
        let probe = probe_over(SparseMemory::new());
        let ctx = context(0x400500, 0x0FFF00, 0xDEAD0000);
        let frames = FramePointerUnwinder.walk(&ctx, &probe, 64);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn empty_context_yields_no_frames() {
        let probe = probe_over(SparseMemory::new());
        let frames = FramePointerUnwinder.walk(&CpuContext::default(), &probe, 64);
        assert!(frames.is_empty());
    }

    #[test]
    fn respects_frame_cap() {
        let word = size_of::<usize>();
        let mut mem = SparseMemory::new();
        mem.map(0x100000, vec![0u8; 0x10000]);
        let mut fp = 0x100000;
        for _ in 0..100 {
            mem.put_word(fp, fp + 0x20);
            mem.put_word(fp + word, 0x401000);
            fp += 0x20;
        }
        let probe = probe_over(mem);
        let ctx = context(0x400500, 0x0FFF00, 0x100000);
        let frames = FramePointerUnwinder.walk(&ctx, &probe, 16);
        assert_eq!(frames.len(), 16);
    }

    #[test]
    fn collect_attaches_modules_and_symbols() {
        let probe = probe_over(SparseMemory::new());
        let modules = ModuleRegistry::from_modules(vec![ModuleInfo {
            handle: 0x400000,
            name: "game.exe".to_string(),
            path: "C:\\Game\\game.exe".to_string(),
            base: 0x400000,
            size: 0x100000,
        }]);
        let sideband = SidebandTables::new();
        let resolver = SymbolResolver::new(&probe, &modules, &sideband, None);
        let raw = [
            RawFrame {
                pc: 0x401234,
                sp: 0,
                fp: 0x100000,
            },
            RawFrame {
                pc: 0x77000000,
                sp: 0,
                fp: 0x100100,
            },
        ];
        let frames = collect_frames(&raw, &modules, &resolver);
        assert_eq!(frames[0].module.as_ref().unwrap().name, "game.exe");
        assert_eq!(frames[0].module_offset, 0x1234);
        assert_eq!(frames[0].symbol.render(), "game.exe+0x1234");
        assert!(frames[1].module.is_none());
        assert_eq!(frames[1].module_offset, 0x77000000);
    }
}
