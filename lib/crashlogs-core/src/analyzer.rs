//! The analyzer facade.
//!
//! One stateful object owning the whole analysis pass: the captured
//! exception snapshot, the module registry, the symbol session, and every
//! memoized product derived from them. Lifecycle is `analyze` → read
//! accessors → `cleanup`, with `reload` = `cleanup` + `analyze` of the same
//! snapshot. Accessors are total: with nothing captured they return empty
//! products, never errors.

use tracing::debug;
#[cfg(windows)]
use tracing::warn;

use crate::context::{ExceptionSnapshot, FlagBit, ThreadIdentity, XmmRegister, cpu_flags};
use crate::disasm::{self, Instruction};
use crate::exceptions;
use crate::memory::{MemoryProbe, MemorySource};
use crate::modules::ModuleRegistry;
use crate::report::{self, ExternalSections};
use crate::stack::{self, STACK_WINDOW, StackWord};
use crate::symbols::{DebugSymbolSource, SidebandTables, SymbolResolver, SymbolTable};
use crate::values::{RegisterSlot, ValueClassifier};
use crate::walker::{Frame, StackUnwinder, collect_frames};

/// Cap on unwound frames.
const MAX_FRAMES: usize = 64;

/// Vendor OpenGL drivers; a top-of-stack hit in one of these means the
/// machine's rendering path is probably broken too.
const GRAPHICS_DRIVER_MODULES: &[&str] = &[
    "nvoglv32.dll",
    "nvoglv64.dll",
    "atioglxx.dll",
    "atig6pxx.dll",
    "atio6axx.dll",
    "ig9icd32.dll",
    "ig9icd64.dll",
];

/// The crash analyzer.
pub struct Analyzer {
    probe: MemoryProbe,
    unwinder: Box<dyn StackUnwinder>,
    modules: ModuleRegistry,
    sideband: SidebandTables,
    #[cfg(windows)]
    session: Option<crate::platform::DbgHelpSession>,
    snapshot: Option<ExceptionSnapshot>,

    // Memoized products, cleared by `cleanup`.
    exception_message: Option<String>,
    registers: Option<Vec<RegisterSlot>>,
    register_message: Option<String>,
    flags: Option<Vec<FlagBit>>,
    vector_message: Option<String>,
    stack: Option<Vec<StackWord>>,
    stack_message: Option<String>,
    frames: Option<Vec<Frame>>,
    trace_message: Option<String>,
    report: Option<String>,
}

impl Analyzer {
    /// Analyzer over the live process.
    pub fn new() -> Self {
        #[cfg(windows)]
        {
            Self::with_environment(
                Box::new(crate::platform::ProcessMemory),
                Box::new(crate::platform::DbgHelpUnwinder),
                ModuleRegistry::new(),
            )
        }
        #[cfg(not(windows))]
        {
            Self::with_environment(
                Box::new(crate::memory::DeadMemory),
                Box::new(crate::walker::FramePointerUnwinder),
                ModuleRegistry::new(),
            )
        }
    }

    /// Analyzer over an explicit environment (memory source, unwinder,
    /// module registry). The registry may be empty; `analyze` then snapshots
    /// the current process.
    pub fn with_environment(
        source: Box<dyn MemorySource>,
        unwinder: Box<dyn StackUnwinder>,
        modules: ModuleRegistry,
    ) -> Self {
        Self {
            probe: MemoryProbe::new(source),
            unwinder,
            modules,
            sideband: SidebandTables::new(),
            #[cfg(windows)]
            session: None,
            snapshot: None,
            exception_message: None,
            registers: None,
            register_message: None,
            flags: None,
            vector_message: None,
            stack: None,
            stack_message: None,
            frames: None,
            trace_message: None,
            report: None,
        }
    }

    /// Captures an exception snapshot and prepares the pass.
    ///
    /// Idempotent: calling again replaces the snapshot but neither
    /// re-enumerates modules nor re-initializes the symbol session.
    pub fn analyze(&mut self, snapshot: ExceptionSnapshot) {
        debug!(
            "analyzing exception 0x{:08X} at 0x{:X}",
            snapshot.code, snapshot.address
        );
        self.snapshot = Some(snapshot);

        if self.modules.is_empty() {
            self.modules = ModuleRegistry::snapshot_current_process();
            debug!("captured {} modules", self.modules.len());
        }

        #[cfg(windows)]
        if self.session.is_none() {
            match crate::platform::DbgHelpSession::initialize() {
                Ok(session) => self.session = Some(session),
                Err(err) => warn!("debug symbols unavailable: {err}"),
            }
        }
    }

    /// Closes the symbol session and drops every cached product.
    ///
    /// Safe to call repeatedly; the captured snapshot is kept so `reload`
    /// can restart from it.
    pub fn cleanup(&mut self) {
        #[cfg(windows)]
        {
            self.session = None;
        }
        self.modules = ModuleRegistry::new();
        self.exception_message = None;
        self.registers = None;
        self.register_message = None;
        self.flags = None;
        self.vector_message = None;
        self.stack = None;
        self.stack_message = None;
        self.frames = None;
        self.trace_message = None;
        self.report = None;
    }

    /// `cleanup` followed by re-analysis of the captured snapshot.
    pub fn reload(&mut self) {
        let snapshot = self.snapshot.clone();
        self.cleanup();
        if let Some(snapshot) = snapshot {
            self.analyze(snapshot);
        }
    }

    /// Installs the sideband table for the main module.
    pub fn set_main_symbol_table(&mut self, table: SymbolTable) {
        self.sideband.set_main_table(table);
    }

    /// Installs a sideband table for a named module.
    pub fn add_module_symbol_table(&mut self, module_name: impl Into<String>, table: SymbolTable) {
        self.sideband.add_module_table(module_name, table);
    }

    /// The captured thread, if a snapshot is loaded.
    pub fn thread(&self) -> Option<&ThreadIdentity> {
        self.snapshot.as_ref().map(|s| &s.thread)
    }

    /// True iff the faulting thread is the host's designated main thread.
    pub fn is_main_thread(&self) -> bool {
        self.thread().is_some_and(ThreadIdentity::is_main)
    }

    /// The frozen module list of this pass.
    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    /// Decodes one instruction, for the UI's disassembly view and the
    /// "step over" action.
    pub fn disassemble(&self, addr: usize) -> Instruction {
        disasm::global().decode(addr, &self.probe)
    }

    /// Decodes a byte range as a sequence of instructions.
    pub fn disassemble_range(&self, start: usize, end: usize) -> Vec<Instruction> {
        disasm::global().decode_range(start, end, &self.probe)
    }

    /// The rendered exception header.
    pub fn exception_message(&mut self) -> &str {
        if self.exception_message.is_none() {
            let message = match &self.snapshot {
                Some(snapshot) => {
                    let resolver = self.resolver();
                    exceptions::header(snapshot, &self.probe, &resolver)
                }
                None => String::new(),
            };
            self.exception_message = Some(message);
        }
        self.exception_message.as_deref().unwrap()
    }

    /// General registers with classified contents.
    pub fn register_states(&mut self) -> &[RegisterSlot] {
        if self.registers.is_none() {
            let slots = match &self.snapshot {
                Some(snapshot) => {
                    let classifier = ValueClassifier::new(&self.probe, self.resolver());
                    snapshot
                        .context
                        .registers
                        .iter()
                        .map(|(name, value)| {
                            let (value_type, description) = classifier.describe(*value);
                            RegisterSlot {
                                name: name.clone(),
                                value: *value,
                                value_type,
                                description,
                            }
                        })
                        .collect()
                }
                None => Vec::new(),
            };
            self.registers = Some(slots);
        }
        self.registers.as_deref().unwrap()
    }

    /// CPU flag bits of the captured flags word.
    pub fn cpu_flags(&mut self) -> &[FlagBit] {
        if self.flags.is_none() {
            let flags = self
                .snapshot
                .as_ref()
                .map(|s| cpu_flags(s.context.flags))
                .unwrap_or_default();
            self.flags = Some(flags);
        }
        self.flags.as_deref().unwrap()
    }

    /// Vector registers captured with the context (64-bit only).
    pub fn vector_registers(&self) -> &[XmmRegister] {
        self.snapshot
            .as_ref()
            .map(|s| s.context.xmm.as_slice())
            .unwrap_or_default()
    }

    /// The rendered vector-register dump; empty on 32-bit captures.
    pub fn vector_message(&mut self) -> &str {
        if self.vector_message.is_none() {
            let message = report::vectors_message(self.vector_registers());
            self.vector_message = Some(message);
        }
        self.vector_message.as_deref().unwrap()
    }

    /// The rendered register dump (registers, flags, vectors).
    pub fn register_state_message(&mut self) -> &str {
        if self.register_message.is_none() {
            self.register_states();
            self.cpu_flags();
            let vectors = self.vector_registers().to_vec();
            let message = report::registers_message(
                self.registers.as_deref().unwrap(),
                self.flags.as_deref().unwrap(),
                &vectors,
            );
            self.register_message = Some(message);
        }
        self.register_message.as_deref().unwrap()
    }

    /// The annotated stack window at the stack pointer.
    pub fn stack_data(&mut self) -> &[StackWord] {
        if self.stack.is_none() {
            let words = match &self.snapshot {
                Some(snapshot) => {
                    let classifier = ValueClassifier::new(&self.probe, self.resolver());
                    stack::scan(snapshot.context.sp, STACK_WINDOW, &self.probe, &classifier)
                }
                None => Vec::new(),
            };
            self.stack = Some(words);
        }
        self.stack.as_deref().unwrap()
    }

    /// The rendered stack window.
    pub fn stack_allocations_message(&mut self) -> &str {
        if self.stack_message.is_none() {
            self.stack_data();
            let message = report::stack_message(self.stack.as_deref().unwrap());
            self.stack_message = Some(message);
        }
        self.stack_message.as_deref().unwrap()
    }

    /// The unwound, symbolicated stack trace.
    pub fn stack_trace(&mut self) -> &[Frame] {
        if self.frames.is_none() {
            let frames = match &self.snapshot {
                Some(snapshot) => {
                    let raw = self
                        .unwinder
                        .walk(&snapshot.context, &self.probe, MAX_FRAMES);
                    collect_frames(&raw, &self.modules, &self.resolver())
                }
                None => Vec::new(),
            };
            self.frames = Some(frames);
        }
        self.frames.as_deref().unwrap()
    }

    /// The rendered stack trace.
    pub fn stack_trace_message(&mut self) -> &str {
        if self.trace_message.is_none() {
            self.stack_trace();
            let message = report::trace_message(self.frames.as_deref().unwrap());
            self.trace_message = Some(message);
        }
        self.trace_message.as_deref().unwrap()
    }

    /// True when one of the top three frames lives in a vendor OpenGL
    /// driver; the host then avoids on-screen rendering.
    pub fn is_graphics_driver_crash(&mut self) -> bool {
        self.stack_trace()
            .iter()
            .take(3)
            .filter_map(|frame| frame.module.as_ref())
            .any(|module| {
                GRAPHICS_DRIVER_MODULES
                    .iter()
                    .any(|driver| module.name.eq_ignore_ascii_case(driver))
            })
    }

    /// Assembles (and caches) the full crash report.
    pub fn crash_report(&mut self, external: &ExternalSections) -> &str {
        if self.report.is_none() {
            self.exception_message();
            self.stack_trace_message();
            self.register_state_message();
            self.stack_allocations_message();
            let report = report::assemble(
                external,
                self.exception_message.as_deref().unwrap(),
                self.trace_message.as_deref().unwrap(),
                self.register_message.as_deref().unwrap(),
                self.stack_message.as_deref().unwrap(),
            );
            self.report = Some(report);
        }
        self.report.as_deref().unwrap()
    }

    fn resolver(&self) -> SymbolResolver<'_> {
        SymbolResolver::new(&self.probe, &self.modules, &self.sideband, self.os_symbols())
    }

    fn os_symbols(&self) -> Option<&dyn DebugSymbolSource> {
        #[cfg(windows)]
        {
            self.session
                .as_ref()
                .map(|session| session as &dyn DebugSymbolSource)
        }
        #[cfg(not(windows))]
        {
            None
        }
    }
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Analyzer {
    fn drop(&mut self) {
        self.cleanup();
    }
}
