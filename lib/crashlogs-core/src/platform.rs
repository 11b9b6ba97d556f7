//! Live Windows implementations of the analyzer's seams: fault-safe process
//! memory, module enumeration, the DbgHelp symbol session, the DbgHelp stack
//! walker, and exception-record capture.
//!
//! Everything here runs on the thread that took the exception, with all
//! other threads suspended by the dispatcher.

use std::ffi::c_void;
use std::sync::Mutex;

use windows::Win32::Foundation::{CloseHandle, FALSE, HANDLE, HMODULE, TRUE};
use windows::Win32::System::Diagnostics::Debug::{
    AddrModeFlat, CONTEXT, EXCEPTION_POINTERS, IMAGEHLP_LINEW64, ReadProcessMemory, STACKFRAME64,
    SYMBOL_INFOW, SYMOPT_DEFERRED_LOADS, SYMOPT_LOAD_LINES, SYMOPT_UNDNAME, StackWalk64,
    SymCleanup, SymFromAddrW, SymFunctionTableAccess64, SymGetLineFromAddrW64, SymGetModuleBase64,
    SymInitializeW, SymSetOptions,
};
use windows::Win32::System::LibraryLoader::{
    GetModuleFileNameW, GetModuleHandleW, GetProcAddress,
};
use windows::Win32::System::Memory::{
    LocalFree, MEMORY_BASIC_INFORMATION, VirtualQuery,
};
use windows::Win32::System::ProcessStatus::{
    EnumProcessModules, GetModuleInformation, MODULEINFO,
};
use windows::Win32::System::Threading::{
    GetCurrentProcess, GetCurrentThread, GetCurrentThreadId, GetThreadDescription, OpenThread,
    THREAD_QUERY_INFORMATION, THREAD_QUERY_LIMITED_INFORMATION,
};
use windows::core::{PCWSTR, s, w};

use crate::context::{CpuContext, ExceptionSnapshot, ThreadIdentity, XmmRegister};
use crate::memory::{MemorySource, PageInfo};
use crate::modules::ModuleInfo;
use crate::symbols::{DebugSymbolSource, OsSymbol};
use crate::walker::{RawFrame, StackUnwinder, UnwindTables};
use crate::{CrashError, Result};

/// Memory source backed by the current process's address space.
///
/// Reads go through `ReadProcessMemory` on our own handle: slower than a
/// plain dereference, but it reports a short count on fault instead of
/// raising a nested exception inside the crash handler.
pub struct ProcessMemory;

impl MemorySource for ProcessMemory {
    fn page_info(&self, addr: usize) -> Option<PageInfo> {
        let mut info = MEMORY_BASIC_INFORMATION::default();
        let len = unsafe {
            VirtualQuery(
                Some(addr as *const c_void),
                &mut info,
                size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        (len != 0).then(|| PageInfo {
            protect: info.Protect.0,
            state: info.State.0,
            kind: info.Type.0,
        })
    }

    fn read(&self, addr: usize, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let mut copied = 0usize;
        let result = unsafe {
            ReadProcessMemory(
                GetCurrentProcess(),
                addr as *const c_void,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                Some(&mut copied),
            )
        };
        if result.is_ok() { buf.len() } else { copied.min(buf.len()) }
    }
}

/// Snapshots the loaded modules of the current process in enumeration order.
pub fn enumerate_modules() -> Vec<ModuleInfo> {
    let process = unsafe { GetCurrentProcess() };
    let mut handles = [HMODULE::default(); 1024];
    let mut needed = 0u32;
    let result = unsafe {
        EnumProcessModules(
            process,
            handles.as_mut_ptr(),
            size_of_val(&handles) as u32,
            &mut needed,
        )
    };
    if result.is_err() {
        return Vec::new();
    }

    let count = (needed as usize / size_of::<HMODULE>()).min(handles.len());
    let mut modules = Vec::with_capacity(count);
    for &handle in &handles[..count] {
        let mut path_buf = [0u16; 260];
        let len = unsafe { GetModuleFileNameW(handle, &mut path_buf) } as usize;
        let path = String::from_utf16_lossy(&path_buf[..len]);
        let name = match path.rsplit('\\').next() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("<Unknown: 0x{:X}>", handle.0 as usize),
        };

        let mut info = MODULEINFO::default();
        let ok = unsafe {
            GetModuleInformation(process, handle, &mut info, size_of::<MODULEINFO>() as u32)
        };
        if ok.is_err() {
            continue;
        }
        modules.push(ModuleInfo {
            handle: handle.0 as usize,
            name,
            path,
            base: info.lpBaseOfDll as usize,
            size: info.SizeOfImage as usize,
        });
    }
    modules
}

/// A live DbgHelp symbol session for the current process.
///
/// Process-global by OS contract and single-threaded by ours: only the
/// analysis thread touches it.
pub struct DbgHelpSession {
    process: HANDLE,
}

impl DbgHelpSession {
    /// Initializes DbgHelp with deferred loads, line numbers, and
    /// undecorated names.
    pub fn initialize() -> Result<Self> {
        unsafe {
            SymSetOptions(SYMOPT_DEFERRED_LOADS | SYMOPT_LOAD_LINES | SYMOPT_UNDNAME);
            let process = GetCurrentProcess();
            SymInitializeW(process, PCWSTR::null(), TRUE)
                .map_err(|e| CrashError::SymbolSession(e.to_string()))?;
            Ok(Self { process })
        }
    }
}

impl Drop for DbgHelpSession {
    fn drop(&mut self) {
        unsafe {
            let _ = SymCleanup(self.process);
        }
    }
}

const MAX_SYM_NAME: usize = 2000;

impl DebugSymbolSource for DbgHelpSession {
    fn symbol_at(&self, addr: usize) -> Option<OsSymbol> {
        let mut buffer = vec![0u8; size_of::<SYMBOL_INFOW>() + MAX_SYM_NAME * 2];
        let info = buffer.as_mut_ptr() as *mut SYMBOL_INFOW;
        unsafe {
            (*info).SizeOfStruct = size_of::<SYMBOL_INFOW>() as u32;
            (*info).MaxNameLen = MAX_SYM_NAME as u32;
            let mut displacement = 0u64;
            SymFromAddrW(self.process, addr as u64, Some(&mut displacement), info).ok()?;
            let len = ((*info).NameLen as usize).min(MAX_SYM_NAME);
            let name =
                String::from_utf16_lossy(std::slice::from_raw_parts((*info).Name.as_ptr(), len));
            Some(OsSymbol {
                name,
                offset: displacement as usize,
            })
        }
    }

    fn line_at(&self, addr: usize) -> Option<(String, u32)> {
        let mut line = IMAGEHLP_LINEW64 {
            SizeOfStruct: size_of::<IMAGEHLP_LINEW64>() as u32,
            ..IMAGEHLP_LINEW64::default()
        };
        let mut displacement = 0u32;
        unsafe {
            SymGetLineFromAddrW64(self.process, addr as u64, &mut displacement, &mut line).ok()?;
            if line.FileName.is_null() {
                return None;
            }
            Some((line.FileName.to_string().ok()?, line.LineNumber))
        }
    }
}

static UNWIND_TABLES: Mutex<Option<Box<dyn UnwindTables>>> = Mutex::new(None);

/// Registers (or clears) augmented unwind tables for dynamically generated
/// code. The walker consults these before the DbgHelp defaults.
pub fn set_unwind_tables(tables: Option<Box<dyn UnwindTables>>) {
    if let Ok(mut guard) = UNWIND_TABLES.lock() {
        *guard = tables;
    }
}

unsafe extern "system" fn function_table_access(process: HANDLE, addr_base: u64) -> *mut c_void {
    if let Ok(guard) = UNWIND_TABLES.lock()
        && let Some(tables) = guard.as_ref()
        && let Some(entry) = tables.function_table_entry(addr_base)
    {
        return entry;
    }
    unsafe { SymFunctionTableAccess64(process, addr_base) }
}

unsafe extern "system" fn get_module_base(process: HANDLE, addr: u64) -> u64 {
    if let Ok(guard) = UNWIND_TABLES.lock()
        && let Some(tables) = guard.as_ref()
        && let Some(base) = tables.module_base(addr)
    {
        return base;
    }
    unsafe { SymGetModuleBase64(process, addr) }
}

/// Frame walker driving `StackWalk64` from the captured context.
pub struct DbgHelpUnwinder;

impl StackUnwinder for DbgHelpUnwinder {
    fn walk(
        &self,
        ctx: &CpuContext,
        _probe: &crate::memory::MemoryProbe,
        max_frames: usize,
    ) -> Vec<RawFrame> {
        #[cfg(target_arch = "x86_64")]
        const MACHINE: u32 = 0x8664; // IMAGE_FILE_MACHINE_AMD64
        #[cfg(target_arch = "x86")]
        const MACHINE: u32 = 0x014C; // IMAGE_FILE_MACHINE_I386

        let mut context = rebuild_context(ctx);
        let mut frame = STACKFRAME64::default();
        frame.AddrPC.Offset = ctx.ip as u64;
        frame.AddrPC.Mode = AddrModeFlat;
        frame.AddrFrame.Offset = ctx.fp as u64;
        frame.AddrFrame.Mode = AddrModeFlat;
        frame.AddrStack.Offset = ctx.sp as u64;
        frame.AddrStack.Mode = AddrModeFlat;

        let process = unsafe { GetCurrentProcess() };
        let thread = unsafe { GetCurrentThread() };

        let mut frames = Vec::new();
        while frames.len() < max_frames {
            let ok = unsafe {
                StackWalk64(
                    MACHINE,
                    process,
                    thread,
                    &mut frame,
                    std::ptr::addr_of_mut!(context).cast(),
                    None,
                    Some(function_table_access),
                    Some(get_module_base),
                    None,
                )
            };
            if !ok.as_bool() || frame.AddrPC.Offset == 0 {
                break;
            }
            frames.push(RawFrame {
                pc: frame.AddrPC.Offset as usize,
                sp: frame.AddrStack.Offset as usize,
                fp: frame.AddrFrame.Offset as usize,
            });
        }
        frames
    }
}

/// Rebuilds a platform CONTEXT from the normalized snapshot, enough for the
/// walker's unwind computations.
fn rebuild_context(ctx: &CpuContext) -> CONTEXT {
    let mut context = CONTEXT::default();

    #[cfg(target_arch = "x86_64")]
    {
        use windows::Win32::System::Diagnostics::Debug::CONTEXT_FULL_AMD64;
        context.ContextFlags = CONTEXT_FULL_AMD64;
        for (name, value) in &ctx.registers {
            let value = *value as u64;
            match name.as_str() {
                "RAX" => context.Rax = value,
                "RBX" => context.Rbx = value,
                "RCX" => context.Rcx = value,
                "RDX" => context.Rdx = value,
                "RBP" => context.Rbp = value,
                "RSP" => context.Rsp = value,
                "RDI" => context.Rdi = value,
                "RSI" => context.Rsi = value,
                "R8" => context.R8 = value,
                "R9" => context.R9 = value,
                "R10" => context.R10 = value,
                "R11" => context.R11 = value,
                "R12" => context.R12 = value,
                "R13" => context.R13 = value,
                "R14" => context.R14 = value,
                "R15" => context.R15 = value,
                _ => {}
            }
        }
        context.Rip = ctx.ip as u64;
        context.Rsp = ctx.sp as u64;
        context.Rbp = ctx.fp as u64;
        context.EFlags = ctx.flags;
    }

    #[cfg(target_arch = "x86")]
    {
        use windows::Win32::System::Diagnostics::Debug::CONTEXT_FULL_X86;
        context.ContextFlags = CONTEXT_FULL_X86;
        for (name, value) in &ctx.registers {
            let value = *value as u32;
            match name.as_str() {
                "EAX" => context.Eax = value,
                "EBX" => context.Ebx = value,
                "ECX" => context.Ecx = value,
                "EDX" => context.Edx = value,
                "ESI" => context.Esi = value,
                "EDI" => context.Edi = value,
                _ => {}
            }
        }
        context.Eip = ctx.ip as u32;
        context.Esp = ctx.sp as u32;
        context.Ebp = ctx.fp as u32;
        context.EFlags = ctx.flags;
    }

    context
}

/// Normalizes a platform CONTEXT into the portable snapshot form.
pub fn normalize_context(context: &CONTEXT) -> CpuContext {
    #[cfg(target_arch = "x86_64")]
    {
        let registers = vec![
            ("RAX".to_string(), context.Rax as usize),
            ("RBX".to_string(), context.Rbx as usize),
            ("RCX".to_string(), context.Rcx as usize),
            ("RDX".to_string(), context.Rdx as usize),
            ("RBP".to_string(), context.Rbp as usize),
            ("RSP".to_string(), context.Rsp as usize),
            ("RDI".to_string(), context.Rdi as usize),
            ("RSI".to_string(), context.Rsi as usize),
            ("R8".to_string(), context.R8 as usize),
            ("R9".to_string(), context.R9 as usize),
            ("R10".to_string(), context.R10 as usize),
            ("R11".to_string(), context.R11 as usize),
            ("R12".to_string(), context.R12 as usize),
            ("R13".to_string(), context.R13 as usize),
            ("R14".to_string(), context.R14 as usize),
            ("R15".to_string(), context.R15 as usize),
            ("RIP".to_string(), context.Rip as usize),
        ];
        let xmm = unsafe {
            context.Anonymous.FltSave.XmmRegisters[..8]
                .iter()
                .enumerate()
                .map(|(i, reg)| XmmRegister {
                    name: format!("XMM{i}"),
                    lo: reg.Low,
                    hi: reg.High as u64,
                })
                .collect()
        };
        CpuContext {
            registers,
            ip: context.Rip as usize,
            sp: context.Rsp as usize,
            fp: context.Rbp as usize,
            flags: context.EFlags,
            xmm,
        }
    }

    #[cfg(target_arch = "x86")]
    {
        let registers = vec![
            ("EAX".to_string(), context.Eax as usize),
            ("EBX".to_string(), context.Ebx as usize),
            ("ECX".to_string(), context.Ecx as usize),
            ("EDX".to_string(), context.Edx as usize),
            ("ESI".to_string(), context.Esi as usize),
            ("EDI".to_string(), context.Edi as usize),
            ("EBP".to_string(), context.Ebp as usize),
            ("ESP".to_string(), context.Esp as usize),
            ("EIP".to_string(), context.Eip as usize),
        ];
        CpuContext {
            registers,
            ip: context.Eip as usize,
            sp: context.Esp as usize,
            fp: context.Ebp as usize,
            flags: context.EFlags,
            xmm: Vec::new(),
        }
    }
}

/// Captures the exception record the dispatcher handed us into plain values.
///
/// # Safety
///
/// `info` must be the pointer received from the OS exception dispatcher and
/// stay valid for the duration of the call.
pub unsafe fn capture_snapshot(info: *const EXCEPTION_POINTERS) -> Option<ExceptionSnapshot> {
    let info = unsafe { info.as_ref()? };
    let record = unsafe { info.ExceptionRecord.as_ref()? };
    let context = unsafe { info.ContextRecord.as_ref() };

    let count = (record.NumberParameters as usize).min(record.ExceptionInformation.len());
    let parameters = record.ExceptionInformation[..count].to_vec();

    Some(ExceptionSnapshot {
        code: record.ExceptionCode.0 as u32,
        flags: record.ExceptionFlags,
        address: record.ExceptionAddress as usize,
        parameters,
        context: context.map(normalize_context).unwrap_or_default(),
        thread: current_thread_identity(),
    })
}

/// Identity of the calling thread: id, optional description, start address.
pub fn current_thread_identity() -> ThreadIdentity {
    let id = unsafe { GetCurrentThreadId() };
    let mut name = None;
    unsafe {
        if let Ok(handle) = OpenThread(THREAD_QUERY_LIMITED_INFORMATION, FALSE, id) {
            if let Ok(description) = GetThreadDescription(handle) {
                if !description.is_null() {
                    let text = description.to_string().unwrap_or_default();
                    if !text.is_empty() {
                        name = Some(text);
                    }
                    let _ = LocalFree(windows::Win32::Foundation::HLOCAL(description.0.cast()));
                }
            }
            let _ = CloseHandle(handle);
        }
    }
    ThreadIdentity {
        id,
        name,
        start_address: thread_start_address(id),
    }
}

/// Thread start address through the NT thread-information query.
///
/// The query is undocumented; any failure reports 0 and the header shows
/// `0x0` for the start function.
fn thread_start_address(thread_id: u32) -> usize {
    const THREAD_QUERY_SET_WIN32_START_ADDRESS: u32 = 9;
    type NtQueryInformationThreadFn =
        unsafe extern "system" fn(HANDLE, u32, *mut c_void, u32, *mut u32) -> i32;

    unsafe {
        let Ok(ntdll) = GetModuleHandleW(w!("ntdll.dll")) else {
            return 0;
        };
        let Some(query) = GetProcAddress(ntdll, s!("NtQueryInformationThread")) else {
            return 0;
        };
        let query: NtQueryInformationThreadFn = std::mem::transmute(query);

        let Ok(handle) = OpenThread(THREAD_QUERY_INFORMATION, FALSE, thread_id) else {
            return 0;
        };
        let mut start: usize = 0;
        let status = query(
            handle,
            THREAD_QUERY_SET_WIN32_START_ADDRESS,
            std::ptr::addr_of_mut!(start).cast(),
            size_of::<usize>() as u32,
            std::ptr::null_mut(),
        );
        let _ = CloseHandle(handle);
        if status == 0 { start } else { 0 }
    }
}
