//! Top-level exception filter and crash handling.
//!
//! The vectored filter screens exception codes first: debug chatter,
//! thread-rename pseudo-events, and RPC server-unavailable codes pass
//! through untouched; breakpoints and stack overflows are handled on the
//! spot (the unhandled filter never sees a stack overflow); everything else
//! arms the unhandled-exception filter so the game's own SEH gets a chance
//! first. A separate continue handler routes uncaught C++ throws back
//! through the analyzer.
//!
//! Reentry is guarded process-wide: a second faulting thread sets a
//! should-close flag that the first analysis polls while its report surface
//! is up — the first tears down and lets the second proceed. A fault inside
//! our own analysis falls through to the OS instead of recursing.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crashlogs_core::exceptions;
use crashlogs_core::report::{ExternalSections, file_timestamp};
use tracing::info;

use crate::config::Config;
use crate::{HostEnv, HostError, Result, bindings, hwinfo};

/// Thread-rename pseudo-exception raised by debuggers and runtimes.
pub const SET_THREAD_NAME: u32 = 0x406D_1388;
pub const DBG_CONTROL_C: u32 = 0x4001_0005;
pub const DBG_PRINTEXCEPTION_C: u32 = 0x4001_0006;
pub const DBG_CONTROL_BREAK: u32 = 0x4001_0008;
pub const DBG_PRINTEXCEPTION_WIDE_C: u32 = 0x4001_000A;
pub const RPC_SERVER_UNAVAILABLE: u32 = 0x0000_06BA;
pub const RPC_SERVER_TOO_BUSY: u32 = 0x0000_06BB;
pub const RPC_SERVER_UNAVAILABLE_HRESULT: u32 = 0x8007_06BA;

/// What the vectored filter does with an exception code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    /// Not a crash; let the next handler have it.
    PassThrough,
    /// Analyze immediately.
    HandleNow,
    /// Arm the unhandled filter and keep searching.
    ArmUnhandledFilter,
}

/// Screens an exception code per the entry contract.
pub fn screen(code: u32) -> FilterAction {
    match code {
        SET_THREAD_NAME
        | DBG_CONTROL_C
        | DBG_PRINTEXCEPTION_C
        | DBG_CONTROL_BREAK
        | DBG_PRINTEXCEPTION_WIDE_C
        | RPC_SERVER_UNAVAILABLE
        | RPC_SERVER_TOO_BUSY
        | RPC_SERVER_UNAVAILABLE_HRESULT => FilterAction::PassThrough,
        exceptions::EXCEPTION_BREAKPOINT | exceptions::EXCEPTION_STACK_OVERFLOW => {
            FilterAction::HandleNow
        }
        _ => FilterAction::ArmUnhandledFilter,
    }
}

/// The report sections the host contributes.
pub fn external_sections(env: &HostEnv) -> ExternalSections {
    ExternalSections {
        geode_info: env.loader_metadata.clone(),
        installed_mods: env.mod_list.clone(),
        hardware: hwinfo::message(),
    }
}

/// Writes the crash report and the `last-crashed` marker the next startup
/// checks for.
pub fn write_report(crashlogs_dir: &Path, report: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(crashlogs_dir)?;
    let path = crashlogs_dir.join(format!("{}.txt", file_timestamp()));
    std::fs::write(&path, report)?;
    std::fs::write(crashlogs_dir.join("last-crashed"), "")?;
    Ok(path)
}

/// Process-wide reentry state for the crash handler.
///
/// One analysis runs at a time. A second thread faulting while the first is
/// still displaying sets the should-close flag and blocks; the running
/// analysis polls the flag through the closure it receives, tears down, and
/// lets the waiter take its turn. A nested fault on the analyzing thread
/// itself is refused outright so the handler never deadlocks on its own
/// lock.
pub struct ReentryGuard {
    running_thread: AtomicU32,
    should_close: AtomicBool,
    lock: Mutex<()>,
}

impl ReentryGuard {
    pub const fn new() -> Self {
        Self {
            running_thread: AtomicU32::new(0),
            should_close: AtomicBool::new(false),
            lock: Mutex::new(()),
        }
    }

    /// Runs `analysis` under the guard.
    ///
    /// `analysis` receives a should-close poll and must return promptly once
    /// it reads true. Returns `None` for a nested fault on the thread that
    /// is already analyzing.
    pub fn run<T>(
        &self,
        thread_id: u32,
        analysis: impl FnOnce(&dyn Fn() -> bool) -> T,
    ) -> Option<T> {
        if self.running_thread.load(Ordering::SeqCst) == thread_id {
            return None;
        }
        if self.running_thread.load(Ordering::SeqCst) != 0 {
            self.should_close.store(true, Ordering::SeqCst);
        }

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.running_thread.store(thread_id, Ordering::SeqCst);
        self.should_close.store(false, Ordering::SeqCst);
        let result = analysis(&|| self.should_close.load(Ordering::SeqCst));
        self.running_thread.store(0, Ordering::SeqCst);
        Some(result)
    }
}

impl Default for ReentryGuard {
    fn default() -> Self {
        Self::new()
    }
}

static HOST: std::sync::OnceLock<HostEnv> = std::sync::OnceLock::new();

/// Installs the crash handler for the process.
///
/// Loads the config, synchronizes the sideband symbol tables (refreshing the
/// main-module table when stale), and registers the exception filters.
pub fn install(env: HostEnv) -> Result<()> {
    let mut config = Config::load(&env.config_dir);
    bindings::sync_tables(&env.config_dir, &env.game_version, &mut config);

    HOST.set(env)
        .map_err(|_| HostError::Install("crash handler already installed".to_string()))?;

    platform::install_filters()?;
    info!("crash handler installed");
    Ok(())
}

#[cfg(windows)]
mod platform {
    use std::ffi::CString;
    use std::sync::Arc;
    use std::time::Duration;

    use crashlogs_core::Analyzer;
    use crashlogs_core::platform::capture_snapshot;
    use tracing::error;
    use windows::Win32::System::Diagnostics::Debug::{
        AddVectoredContinueHandler, AddVectoredExceptionHandler, CONTEXT,
        EXCEPTION_CONTINUE_EXECUTION, EXCEPTION_CONTINUE_SEARCH, EXCEPTION_POINTERS,
        SetUnhandledExceptionFilter,
    };
    use windows::Win32::System::Threading::{ExitThread, GetCurrentThreadId};
    use windows::Win32::UI::WindowsAndMessaging::{
        MB_ICONERROR, MB_OK, MessageBeep, MessageBoxA,
    };
    use windows::core::PCSTR;

    use super::*;

    pub(super) fn install_filters() -> Result<()> {
        unsafe {
            let cookie = AddVectoredExceptionHandler(0, Some(vectored_filter));
            if cookie.is_null() {
                return Err(HostError::Install(
                    "AddVectoredExceptionHandler returned null".to_string(),
                ));
            }
            AddVectoredContinueHandler(1, Some(continue_filter));
            SetUnhandledExceptionFilter(Some(handle_crash));
        }
        Ok(())
    }

    unsafe extern "system" fn vectored_filter(info: *mut EXCEPTION_POINTERS) -> i32 {
        let code = match unsafe { info.as_ref().and_then(|i| i.ExceptionRecord.as_ref()) } {
            Some(record) => record.ExceptionCode.0 as u32,
            None => return EXCEPTION_CONTINUE_SEARCH.0,
        };
        match screen(code) {
            FilterAction::PassThrough => EXCEPTION_CONTINUE_SEARCH.0,
            FilterAction::HandleNow => unsafe { handle_crash(info) },
            FilterAction::ArmUnhandledFilter => {
                unsafe { SetUnhandledExceptionFilter(Some(handle_crash)) };
                EXCEPTION_CONTINUE_SEARCH.0
            }
        }
    }

    /// C++ throws are continuable; when one reaches the continue chain no
    /// handler wanted it, and the user should still see it.
    unsafe extern "system" fn continue_filter(info: *mut EXCEPTION_POINTERS) -> i32 {
        let code = match unsafe { info.as_ref().and_then(|i| i.ExceptionRecord.as_ref()) } {
            Some(record) => record.ExceptionCode.0 as u32,
            None => return EXCEPTION_CONTINUE_SEARCH.0,
        };
        if code == exceptions::CPP_EXCEPTION {
            return unsafe { handle_crash(info) };
        }
        EXCEPTION_CONTINUE_SEARCH.0
    }

    static REENTRY: ReentryGuard = ReentryGuard::new();

    /// The crash entry point handed to the exception dispatcher.
    pub unsafe extern "system" fn handle_crash(info: *mut EXCEPTION_POINTERS) -> i32 {
        let thread_id = unsafe { GetCurrentThreadId() };
        REENTRY
            .run(thread_id, |should_close| unsafe {
                run_analysis(info, should_close)
            })
            .unwrap_or(EXCEPTION_CONTINUE_SEARCH.0)
    }

    unsafe fn run_analysis(info: *mut EXCEPTION_POINTERS, should_close: &dyn Fn() -> bool) -> i32 {
        let _ = unsafe { MessageBeep(MB_ICONERROR) };

        let Some(snapshot) = (unsafe { capture_snapshot(info) }) else {
            return EXCEPTION_CONTINUE_SEARCH.0;
        };

        let env = HOST.get().cloned().unwrap_or_default();
        let mut analyzer = Analyzer::new();
        let (main_table, framework_table) =
            bindings::load_tables(&env.config_dir, &env.game_version);
        if let Some(table) = main_table {
            analyzer.set_main_symbol_table(table);
        }
        if let Some(table) = framework_table {
            analyzer.add_module_symbol_table("libcocos2d.dll", table);
        }

        analyzer.analyze(snapshot);
        let external = external_sections(&env);
        let report = analyzer.crash_report(&external).to_string();

        match write_report(&env.crashlogs_dir, &report) {
            Ok(path) => error!("crash report saved to {}", path.display()),
            Err(err) => error!("failed to save crash report: {err}"),
        }

        // On a graphics-driver crash any in-process rendering is suspect;
        // the modal box is the one surface that still works.
        show_report(&report, analyzer.is_graphics_driver_crash(), should_close);
        analyzer.cleanup();

        EXCEPTION_CONTINUE_SEARCH.0
    }

    /// Shows the report in a modal box on a helper thread, polling the
    /// should-close flag so a second crash can force this analysis to wind
    /// up while the box is still on screen. A forced teardown leaves the box
    /// thread to its own dismissal.
    fn show_report(report: &str, fallback_mode: bool, should_close: &dyn Fn() -> bool) {
        let title = if fallback_mode {
            "Something went wrong! (fallback mode)"
        } else {
            "Something went wrong!"
        };
        let mut body = report.as_bytes().to_vec();
        body.truncate(32 * 1024);
        let Ok(text) = CString::new(body) else {
            return;
        };
        let Ok(title) = CString::new(title) else {
            return;
        };

        let dismissed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let spawned = {
            let dismissed = Arc::clone(&dismissed);
            let text = text.clone();
            let title = title.clone();
            std::thread::Builder::new()
                .name("crash-report-box".to_string())
                .spawn(move || {
                    show_message_box(&text, &title);
                    dismissed.store(true, Ordering::SeqCst);
                })
        };

        match spawned {
            Ok(_) => {
                while !dismissed.load(Ordering::SeqCst) && !should_close() {
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
            // No thread to be had in this process state; block right here.
            Err(_) => show_message_box(&text, &title),
        }
    }

    fn show_message_box(text: &CString, title: &CString) {
        unsafe {
            MessageBoxA(
                None,
                PCSTR(text.as_ptr().cast()),
                PCSTR(title.as_ptr().cast()),
                MB_ICONERROR | MB_OK,
            );
        }
    }

    fn set_program_counter(context: &mut CONTEXT, address: usize) {
        #[cfg(target_arch = "x86_64")]
        {
            context.Rip = address as u64;
        }
        #[cfg(target_arch = "x86")]
        {
            context.Eip = address as u32;
        }
    }

    unsafe extern "system" fn thread_exit_trampoline() -> ! {
        unsafe { ExitThread(0) }
    }

    /// "Step Over": advance the program counter past the faulting
    /// instruction and resume. Usually crashes again, but the user asked.
    pub unsafe fn step_over(info: *mut EXCEPTION_POINTERS, analyzer: &Analyzer) -> i32 {
        let Some(context) = (unsafe { info.as_mut().and_then(|i| i.ContextRecord.as_mut()) })
        else {
            return EXCEPTION_CONTINUE_SEARCH.0;
        };
        #[cfg(target_arch = "x86_64")]
        let ip = context.Rip as usize;
        #[cfg(target_arch = "x86")]
        let ip = context.Eip as usize;

        let instruction = analyzer.disassemble(ip);
        if instruction.len == 0 {
            return EXCEPTION_CONTINUE_SEARCH.0;
        }
        set_program_counter(context, ip + instruction.len);
        EXCEPTION_CONTINUE_EXECUTION.0
    }

    /// "Terminate Thread": point the faulting thread at `ExitThread` and
    /// resume it. Only offered for non-main threads.
    pub unsafe fn terminate_faulting_thread(info: *mut EXCEPTION_POINTERS) -> i32 {
        let Some(context) = (unsafe { info.as_mut().and_then(|i| i.ContextRecord.as_mut()) })
        else {
            return EXCEPTION_CONTINUE_SEARCH.0;
        };
        set_program_counter(context, thread_exit_trampoline as usize);
        EXCEPTION_CONTINUE_EXECUTION.0
    }

    /// Stub that unwinds one conventional frame and returns into the caller.
    #[cfg(target_arch = "x86")]
    #[unsafe(naked)]
    extern "C" fn step_out_trampoline() {
        core::arch::naked_asm!("mov esp, ebp", "pop ebp", "ret");
    }

    /// "Step Out": resume in the caller of the faulting function.
    ///
    /// Sets both SP and FP to the caller's frame pointer and trampolines
    /// through one more epilogue; only sound for plain frame-pointer frames,
    /// and only available on x86.
    #[cfg(target_arch = "x86")]
    pub unsafe fn step_out(info: *mut EXCEPTION_POINTERS, caller_frame_pointer: usize) -> i32 {
        let Some(context) = (unsafe { info.as_mut().and_then(|i| i.ContextRecord.as_mut()) })
        else {
            return EXCEPTION_CONTINUE_SEARCH.0;
        };
        context.Eip = step_out_trampoline as usize as u32;
        context.Esp = caller_frame_pointer as u32;
        context.Ebp = caller_frame_pointer as u32;
        EXCEPTION_CONTINUE_EXECUTION.0
    }

    /// Whether the "Step Out" action exists on this target.
    pub fn step_out_supported() -> bool {
        cfg!(target_arch = "x86")
    }
}

#[cfg(not(windows))]
mod platform {
    use super::*;

    pub(super) fn install_filters() -> Result<()> {
        tracing::warn!("crash handler is only functional on Windows");
        Ok(())
    }
}

#[cfg(windows)]
pub use platform::{handle_crash, step_out_supported, step_over, terminate_faulting_thread};
#[cfg(all(windows, target_arch = "x86"))]
pub use platform::step_out;
