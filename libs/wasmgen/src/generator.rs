// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Drives compilation of a whole module.
//!
//! Generation happens in two phases. First every module-level entity is
//! declared, which fills in the [`ModuleEnv`] and lays out global data. The
//! environment is then frozen and function bodies are handed to
//! [`ModuleGenerator::start_func_def`]/[`ModuleGenerator::finish_func_def`],
//! which compile them serially or on the engine's compile threads. Compiled
//! functions are appended to one code buffer in completion order.
//!
//! Direct calls are encoded with a bounded relative displacement. Call sites
//! stay pending until a thunk pass runs, which happens before the code between
//! the oldest pending call site and the end of the buffer could grow out of
//! range. A pass patches calls to already placed callees in range directly and
//! routes all others through a far-jump thunk appended to the buffer, one per
//! callee and pass.

use core::mem;
use std::sync::{Arc, mpsc};

use cranelift_entity::{EntityRef, PrimaryMap, SecondaryMap};
use hashbrown::HashMap;
use hashbrown::hash_map::Entry;

use crate::codegen::isa::{UNLINKED, write_u32};
use crate::codegen::{Backend, CompiledCode, StubKind};
use crate::compile::compile_function;
use crate::decoder::FuncDecoder;
use crate::env::{
    EXIT_RECORD_SIZE, FuncImport, GlobalDesc, GlobalInit, MemoryDesc, ModuleEnv, SIG_TOKEN_SIZE,
    TABLE_HANDLE_SIZE, TableDesc,
};
use crate::indices::{DefinedFuncIndex, EntityIndex, ExportIndex, FuncIndex, GlobalIndex, ImportIndex, SigIndex, TableIndex};
use crate::link::{CallSiteDesc, CodeRange, CodeRangeKind, FuncPtrTable, InternalLink, LinkData, TrapSite};
use crate::module::{
    DataSegment, ElemSegment, Export, ExportItem, Exports, Import, Metadata, Module, ModuleParts,
    StubOffsets,
};
use crate::trap::Trap;
use crate::types::{GlobalType, InitExpr, MemoryType, Sig, TableType};
use crate::{Engine, Error, Result, wasm_unsupported};

pub struct ModuleGenerator {
    engine: Engine,
    backend: Arc<dyn Backend>,
    env: Arc<ModuleEnv>,
    /// Set once function definitions start, the environment is read-only afterwards.
    frozen: bool,
    num_imports: usize,

    exports: Exports,
    export_of_func: HashMap<FuncIndex, ExportIndex>,
    start: Option<FuncIndex>,
    elem_segments: Vec<ElemSegment>,
    data_segments: Vec<DataSegment>,
    name: Option<String>,
    func_names: Vec<(FuncIndex, String)>,
    bytecode: Option<Box<[u8]>>,

    scheduler: Scheduler,
    free_tasks: Vec<CompileTask>,
    compiled: SecondaryMap<DefinedFuncIndex, bool>,

    code: Vec<u8>,
    code_ranges: Vec<CodeRange>,
    trap_sites: Vec<TrapSite>,
    call_sites: Vec<CallSiteDesc>,
    link: LinkData,
    indirect_sigs: Vec<SigIndex>,
    /// Code offset every function is entered at, imports at their interpreter exit.
    func_entries: SecondaryMap<FuncIndex, Option<u32>>,
    pending_calls: Vec<PendingCall>,
    pending_stub_refs: Vec<(u32, StubKind)>,
    /// Target operands of emitted thunks, linked once every function is placed.
    thunk_targets: Vec<(u32, FuncIndex)>,
    /// End of the code buffer at the last thunk pass.
    last_patched: u32,
    import_exits: PrimaryMap<ImportIndex, (u32, u32)>,
    stubs: Option<StubOffsets>,
}

/// A direct call whose displacement has not been written yet.
#[derive(Debug, Clone, Copy)]
struct PendingCall {
    offset: u32,
    patch_at: u32,
    callee: FuncIndex,
}

/// How function bodies are compiled, decided once when definitions start.
enum Scheduler {
    Serial,
    Parallel {
        in_flight: usize,
        tx: mpsc::Sender<CompileTask>,
        rx: mpsc::Receiver<CompileTask>,
    },
}

/// One compile slot. Slots are reused, so the body buffer is allocated only
/// once per slot.
struct CompileTask {
    env: Arc<ModuleEnv>,
    backend: Arc<dyn Backend>,
    func_index: FuncIndex,
    body: Vec<u8>,
    body_offset: usize,
    output: Option<Result<CompiledCode>>,
}

/// The bytecode of one function definition, handed out by
/// [`ModuleGenerator::start_func_def`].
pub struct FunctionGenerator {
    task: CompileTask,
}

// ===== impl ModuleGenerator =====

impl ModuleGenerator {
    pub fn new(engine: &Engine) -> Self {
        let config = engine.config();
        Self {
            engine: engine.clone(),
            backend: engine.backend().clone(),
            env: Arc::new(ModuleEnv::new(config.interrupt_mode, config.limits)),
            frozen: false,
            num_imports: 0,
            exports: Exports::default(),
            export_of_func: HashMap::new(),
            start: None,
            elem_segments: Vec::new(),
            data_segments: Vec::new(),
            name: None,
            func_names: Vec::new(),
            bytecode: None,
            scheduler: Scheduler::Serial,
            free_tasks: Vec::new(),
            compiled: SecondaryMap::new(),
            code: Vec::new(),
            code_ranges: Vec::new(),
            trap_sites: Vec::new(),
            call_sites: Vec::new(),
            link: LinkData::new(),
            indirect_sigs: Vec::new(),
            func_entries: SecondaryMap::new(),
            pending_calls: Vec::new(),
            pending_stub_refs: Vec::new(),
            thunk_targets: Vec::new(),
            last_patched: 0,
            import_exits: PrimaryMap::new(),
            stubs: None,
        }
    }

    pub fn env(&self) -> &ModuleEnv {
        &self.env
    }

    fn env_mut(&mut self) -> Result<&mut ModuleEnv> {
        if self.frozen {
            return Err(Error::internal(
                "module declarations after function definitions started",
            ));
        }
        Arc::get_mut(&mut self.env).ok_or_else(|| Error::internal("module environment is shared"))
    }

    fn check_codegen_pending(&self) -> Result<()> {
        if self.stubs.is_some() {
            Err(Error::internal("module declarations after code generation finished"))
        } else {
            Ok(())
        }
    }

    fn invalid(message: impl Into<String>) -> Error {
        Error::InvalidWebAssembly {
            message: message.into(),
            offset: 0,
        }
    }

    // --- declarations ---

    pub fn declare_sig(&mut self, sig: Sig) -> Result<SigIndex> {
        let env = self.env_mut()?;
        ModuleEnv::check_limit("types", env.sigs.len(), env.limits.max_types)?;
        if sig.params().len() > env.limits.max_params as usize {
            return Err(Error::LimitExceeded {
                what: "function parameters",
                max: u64::from(env.limits.max_params),
            });
        }
        let token_offset = env.alloc_global_data(SIG_TOKEN_SIZE, SIG_TOKEN_SIZE)?;
        let index = env.sigs.push(sig);
        env.sig_data_offsets[index] = token_offset;
        Ok(index)
    }

    pub fn declare_func_import(&mut self, module: &str, name: &str, sig: SigIndex) -> Result<FuncIndex> {
        let num_imports = self.num_imports;
        let env = self.env_mut()?;
        ModuleEnv::check_limit("imports", num_imports, env.limits.max_imports)?;
        env.check_sig(sig)?;
        if env.funcs.len() != env.func_imports.len() {
            return Err(Error::internal("function imports after function declarations"));
        }

        let global_data_offset = env.alloc_global_data(EXIT_RECORD_SIZE, 8)?;
        env.func_imports.push(FuncImport {
            module: module.to_string(),
            name: name.to_string(),
            sig,
            global_data_offset,
        });
        let index = env.funcs.push(sig);
        self.num_imports += 1;
        Ok(index)
    }

    pub fn declare_table_import(&mut self, module: &str, name: &str, ty: TableType) -> Result<TableIndex> {
        self.declare_table_inner(ty, Some((module.to_string(), name.to_string())))
    }

    pub fn declare_table(&mut self, ty: TableType) -> Result<TableIndex> {
        self.declare_table_inner(ty, None)
    }

    fn declare_table_inner(&mut self, ty: TableType, import: Option<(String, String)>) -> Result<TableIndex> {
        let num_imports = self.num_imports;
        let is_import = import.is_some();
        let env = self.env_mut()?;
        if is_import {
            ModuleEnv::check_limit("imports", num_imports, env.limits.max_imports)?;
        }
        let max_elems = env.limits.max_table_elems;
        if ty.initial > max_elems || ty.maximum.is_some_and(|max| max > max_elems) {
            return Err(Error::LimitExceeded {
                what: "table elements",
                max: u64::from(max_elems),
            });
        }

        let global_data_offset = env.alloc_global_data(TABLE_HANDLE_SIZE, 8)?;
        let index = env.tables.push(TableDesc {
            ty,
            import,
            global_data_offset,
        });
        self.num_imports += usize::from(is_import);
        Ok(index)
    }

    pub fn declare_memory_import(&mut self, module: &str, name: &str, ty: MemoryType) -> Result<()> {
        self.declare_memory_inner(ty, Some((module.to_string(), name.to_string())))
    }

    pub fn declare_memory(&mut self, ty: MemoryType) -> Result<()> {
        self.declare_memory_inner(ty, None)
    }

    fn declare_memory_inner(&mut self, ty: MemoryType, import: Option<(String, String)>) -> Result<()> {
        let num_imports = self.num_imports;
        let is_import = import.is_some();
        let env = self.env_mut()?;
        if env.memory.is_some() {
            return Err(wasm_unsupported!("multiple memories"));
        }
        if is_import {
            ModuleEnv::check_limit("imports", num_imports, env.limits.max_imports)?;
        }
        let max_pages = env.limits.max_memory_pages;
        if ty.initial > max_pages || ty.maximum.is_some_and(|max| max > max_pages) {
            return Err(Error::LimitExceeded {
                what: "memory pages",
                max: u64::from(max_pages),
            });
        }
        env.memory = Some(MemoryDesc { ty, import });
        self.num_imports += usize::from(is_import);
        Ok(())
    }

    pub fn declare_global_import(&mut self, module: &str, name: &str, ty: GlobalType) -> Result<GlobalIndex> {
        let init = GlobalInit::Import {
            module: module.to_string(),
            name: name.to_string(),
        };
        let num_imports = self.num_imports;
        ModuleEnv::check_limit("imports", num_imports, self.env.limits.max_imports)?;
        let index = self.declare_global_inner(ty, init)?;
        self.num_imports += 1;
        Ok(index)
    }

    pub fn declare_global(&mut self, ty: GlobalType, init: InitExpr) -> Result<GlobalIndex> {
        if let InitExpr::GlobalGet(global) = init {
            let referenced = self
                .env
                .globals
                .get(global)
                .ok_or_else(|| Self::invalid(format!("unknown global {}", global.as_u32())))?;
            if referenced.ty.content != ty.content {
                return Err(Self::invalid("type mismatch in global initializer"));
            }
        } else if init.ty() != Some(ty.content) {
            return Err(Self::invalid("type mismatch in global initializer"));
        }
        self.declare_global_inner(ty, GlobalInit::Const(init))
    }

    fn declare_global_inner(&mut self, ty: GlobalType, init: GlobalInit) -> Result<GlobalIndex> {
        let env = self.env_mut()?;
        ModuleEnv::check_limit("globals", env.globals.len(), env.limits.max_globals)?;
        let size = ty.content.byte_size();
        let global_data_offset = env.alloc_global_data(size, size)?;
        Ok(env.globals.push(GlobalDesc {
            ty,
            init,
            global_data_offset,
        }))
    }

    pub fn declare_func(&mut self, sig: SigIndex) -> Result<FuncIndex> {
        let env = self.env_mut()?;
        ModuleEnv::check_limit("functions", env.funcs.len(), env.limits.max_funcs)?;
        env.check_sig(sig)?;
        let index = env.funcs.push(sig);
        if let Some(def) = env.defined_func_index(index) {
            self.compiled[def] = false;
        }
        Ok(index)
    }

    /// Exports `entity` under `name`. Exporting one function under several
    /// names shares a single entry stub.
    pub fn declare_export(&mut self, name: &str, entity: EntityIndex) -> Result<()> {
        self.check_codegen_pending()?;
        ModuleEnv::check_limit("exports", self.exports.names.len(), self.env.limits.max_exports)?;
        if self.exports.names.iter().any(|(export, _)| export == name) {
            return Err(Self::invalid(format!("duplicate export name `{name}`")));
        }

        let item = match entity {
            EntityIndex::Function(func) => {
                let sig = *self
                    .env
                    .funcs
                    .get(func)
                    .ok_or_else(|| Self::invalid(format!("unknown function {}", func.as_u32())))?;
                let index = match self.export_of_func.entry(func) {
                    Entry::Occupied(entry) => *entry.get(),
                    Entry::Vacant(entry) => *entry.insert(self.exports.funcs.push(Export {
                        func_index: func,
                        sig,
                        entry_offset: UNLINKED,
                    })),
                };
                ExportItem::Function(index)
            }
            EntityIndex::Table(table) => {
                if table.index() >= self.env.tables.len() {
                    return Err(Self::invalid(format!("unknown table {}", table.as_u32())));
                }
                ExportItem::Table(table)
            }
            EntityIndex::Memory => {
                if self.env.memory.is_none() {
                    return Err(Self::invalid("unknown memory 0"));
                }
                ExportItem::Memory
            }
            EntityIndex::Global(global) => {
                if global.index() >= self.env.globals.len() {
                    return Err(Self::invalid(format!("unknown global {}", global.as_u32())));
                }
                ExportItem::Global(global)
            }
        };
        self.exports.names.push((name.to_string(), item));
        Ok(())
    }

    pub fn declare_start(&mut self, func: FuncIndex) -> Result<()> {
        let sig = self
            .env
            .funcs
            .get(func)
            .map(|sig| &self.env.sigs[*sig])
            .ok_or_else(|| Self::invalid(format!("unknown function {}", func.as_u32())))?;
        if !sig.params().is_empty() || sig.result().is_some() {
            return Err(Self::invalid("start function must not take or return values"));
        }
        self.start = Some(func);
        Ok(())
    }

    pub fn declare_elem_segment(
        &mut self,
        table: TableIndex,
        offset: InitExpr,
        funcs: Vec<Option<FuncIndex>>,
    ) -> Result<()> {
        self.check_codegen_pending()?;
        let limits = &self.env.limits;
        ModuleEnv::check_limit("element segments", self.elem_segments.len(), limits.max_elem_segments)?;
        if funcs.len() > limits.max_table_elems as usize {
            return Err(Error::LimitExceeded {
                what: "table elements",
                max: u64::from(limits.max_table_elems),
            });
        }
        if table.index() >= self.env.tables.len() {
            return Err(Self::invalid(format!("unknown table {}", table.as_u32())));
        }
        if let Some(func) = funcs.iter().flatten().find(|func| func.index() >= self.env.funcs.len()) {
            return Err(Self::invalid(format!("unknown function {}", func.as_u32())));
        }
        self.elem_segments.push(ElemSegment { table, offset, funcs });
        Ok(())
    }

    /// Data segments may be declared until [`finish`](Self::finish), the data
    /// section follows the code section.
    pub fn declare_data_segment(&mut self, offset: InitExpr, bytes: &[u8]) -> Result<()> {
        ModuleEnv::check_limit(
            "data segments",
            self.data_segments.len(),
            self.env.limits.max_data_segments,
        )?;
        if self.env.memory.is_none() {
            return Err(Self::invalid("data segment without a memory"));
        }
        let mut owned = Vec::new();
        owned.try_reserve_exact(bytes.len())?;
        owned.extend_from_slice(bytes);
        self.data_segments.push(DataSegment {
            offset,
            bytes: owned,
        });
        Ok(())
    }

    pub fn declare_module_name(&mut self, name: &str) {
        self.name = Some(name.to_string());
    }

    pub fn declare_func_name(&mut self, func: FuncIndex, name: &str) {
        self.func_names.push((func, name.to_string()));
    }

    /// Keeps a copy of the module bytecode if the engine retains bytecode.
    pub fn set_bytecode(&mut self, bytes: &[u8]) {
        if self.engine.config().retain_bytecode {
            self.bytecode = Some(bytes.into());
        }
    }

    // --- function definitions ---

    fn freeze(&mut self) {
        if !self.frozen {
            self.frozen = true;
            tracing::debug!(
                funcs = self.env.funcs.len(),
                imports = self.env.func_imports.len(),
                global_data = self.env.global_data_len,
                "module declarations complete"
            );
        }
    }

    /// Freezes the declarations and picks how function bodies are compiled.
    ///
    /// Called implicitly by the first [`start_func_def`](Self::start_func_def).
    pub fn start_func_defs(&mut self) -> Result<()> {
        if self.frozen {
            return Ok(());
        }
        self.freeze();

        let config = self.engine.config();
        let pool = if !config.parallel_compilation {
            tracing::debug!("parallel compilation disabled, compiling serially");
            None
        } else if rayon::current_thread_index().is_some() {
            tracing::debug!("already running on a worker thread, compiling serially");
            None
        } else {
            self.engine.compile_pool()
        };

        let slots = match pool {
            Some(pool) if pool.current_num_threads() > 1 => {
                let (tx, rx) = mpsc::channel();
                self.scheduler = Scheduler::Parallel {
                    in_flight: 0,
                    tx,
                    rx,
                };
                tracing::debug!("compiling in parallel on {} threads", pool.current_num_threads());
                pool.current_num_threads()
            }
            _ => {
                self.scheduler = Scheduler::Serial;
                tracing::debug!("compiling serially");
                1
            }
        };

        self.free_tasks.try_reserve_exact(slots)?;
        for _ in 0..slots {
            self.free_tasks.push(CompileTask {
                env: self.env.clone(),
                backend: self.backend.clone(),
                func_index: FuncIndex::new(0),
                body: Vec::new(),
                body_offset: 0,
                output: None,
            });
        }
        Ok(())
    }

    /// Returns a free compile slot, waiting for an outstanding task to
    /// complete if all slots are busy.
    ///
    /// # Errors
    ///
    /// Fails if a task that completed while waiting failed to compile.
    pub fn start_func_def(&mut self) -> Result<FunctionGenerator> {
        self.start_func_defs()?;
        loop {
            if let Some(task) = self.free_tasks.pop() {
                return Ok(FunctionGenerator { task });
            }
            let task = self
                .recv_task()?
                .ok_or_else(|| Error::internal("no compile slot available"))?;
            self.finish_task(task)?;
        }
    }

    /// Compiles the body set on `fg` as the definition of `func_index`.
    ///
    /// # Errors
    ///
    /// Fails if `func_index` is not a defined function, was already compiled,
    /// or its body exceeds the size limit. With serial compilation this also
    /// reports compile errors of the body, with parallel compilation those are
    /// reported by a later call.
    pub fn finish_func_def(&mut self, func_index: FuncIndex, fg: FunctionGenerator) -> Result<()> {
        let mut task = fg.task;
        let def = self
            .env
            .defined_func_index(func_index)
            .filter(|def| def.as_u32() < self.env.num_defined_funcs())
            .ok_or_else(|| Error::internal(format!("function {} is not defined", func_index.as_u32())))?;
        if mem::replace(&mut self.compiled[def], true) {
            self.free_tasks.push(task);
            return Err(Error::internal(format!(
                "function {} compiled twice",
                func_index.as_u32()
            )));
        }
        let max_size = self.env.limits.max_function_size;
        if task.body.len() > max_size as usize {
            self.free_tasks.push(task);
            return Err(Error::LimitExceeded {
                what: "function body bytes",
                max: u64::from(max_size),
            });
        }
        task.func_index = func_index;

        let engine = self.engine.clone();
        match (&mut self.scheduler, engine.compile_pool()) {
            (Scheduler::Parallel { in_flight, tx, .. }, Some(pool)) => {
                let tx = tx.clone();
                *in_flight += 1;
                pool.spawn(move || {
                    task.run();
                    // the generator is gone if this fails and nobody needs the result
                    tx.send(task).ok();
                });
                Ok(())
            }
            _ => {
                task.run();
                self.finish_task(task)
            }
        }
    }

    /// Waits for every outstanding compile task.
    ///
    /// # Errors
    ///
    /// Returns the first error of any task, after all tasks have completed.
    pub fn finish_func_defs(&mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(task) = self.recv_task()? {
            if let Err(err) = self.finish_task(task) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn recv_task(&mut self) -> Result<Option<CompileTask>> {
        match &mut self.scheduler {
            Scheduler::Parallel { in_flight, rx, .. } if *in_flight > 0 => {
                let task = rx
                    .recv()
                    .map_err(|_| Error::internal("compile thread disconnected"))?;
                *in_flight -= 1;
                Ok(Some(task))
            }
            _ => Ok(None),
        }
    }

    /// Merges the code of a completed task into the module.
    fn finish_task(&mut self, mut task: CompileTask) -> Result<()> {
        let output = task.output.take();
        let (func_index, body_offset) = (task.func_index, task.body_offset);
        self.free_tasks.push(task);

        let compiled = output.ok_or_else(|| Error::internal("compile task finished without output"))??;
        let bytecode_offset = u32::try_from(body_offset).unwrap_or(u32::MAX);
        let entry_offset = compiled.entry;
        let begin = self.append(
            compiled,
            CodeRangeKind::Function {
                func_index,
                bytecode_offset,
                entry: 0,
            },
        )?;
        // a thunk pass may have moved the function, so the entry is only known now
        let entry = begin + entry_offset;
        if let Some(CodeRange {
            kind: CodeRangeKind::Function { entry: slot, .. },
            ..
        }) = self.code_ranges.last_mut()
        {
            *slot = entry;
        }
        // calls, thunks and table elements all start out at the regular entry
        self.func_entries[func_index] = Some(entry);
        Ok(())
    }

    // --- code layout ---

    fn code_len(&self) -> Result<u32> {
        u32::try_from(self.code.len()).map_err(|_| Error::CodeTooLarge("module".into()))
    }

    /// Appends one function or stub and records everything that needs patching.
    fn append(&mut self, compiled: CompiledCode, kind: CodeRangeKind) -> Result<u32> {
        self.reserve_branch_range(kind, compiled.code.len(), compiled.call_sites.len())?;

        let begin = self.code_len()?;
        self.code.try_reserve(compiled.code.len())?;
        self.code.extend_from_slice(&compiled.code);
        let end = self.code_len()?;

        for site in compiled.call_sites {
            self.pending_calls.push(PendingCall {
                offset: begin + site.offset,
                patch_at: begin + site.patch_at,
                callee: site.callee,
            });
            self.call_sites.push(CallSiteDesc {
                return_offset: begin + site.return_offset,
                bytecode_offset: site.bytecode_offset,
            });
        }
        self.pending_stub_refs.extend(
            compiled
                .stub_refs
                .iter()
                .map(|stub| (begin + stub.patch_at, stub.kind)),
        );
        for symbolic in compiled.symbolic_refs {
            self.link
                .add_symbolic_link(symbolic.symbol, begin + symbolic.patch_at);
        }
        self.trap_sites
            .extend(compiled.trap_sites.iter().map(|site| TrapSite {
                code_offset: begin + site.code_offset,
                bytecode_offset: site.bytecode_offset,
            }));
        self.indirect_sigs.extend(compiled.indirect_sigs);

        self.code_ranges.push(CodeRange { kind, begin, end });
        Ok(begin)
    }

    /// Runs a thunk pass first if appending `len` bytes with `num_sites` call
    /// sites could leave a pending call site unable to reach the thunks the
    /// next pass appends.
    fn reserve_branch_range(&mut self, kind: CodeRangeKind, len: usize, num_sites: usize) -> Result<()> {
        let range = u64::from(self.backend.max_branch_range());
        let thunk_size = u64::from(self.backend.thunk_size());

        let incoming = len as u64 + num_sites as u64 * thunk_size;
        if incoming > range {
            return Err(Error::CodeTooLarge(format!("{kind:?}")));
        }

        let since_patched = self.code.len() as u64 - u64::from(self.last_patched);
        let pending_thunks = self.pending_calls.len() as u64 * thunk_size;
        if since_patched + pending_thunks + incoming > range {
            self.thunk_pass()?;
        }
        Ok(())
    }

    /// Resolves every pending call site, directly or through a thunk.
    fn thunk_pass(&mut self) -> Result<()> {
        let range = i64::from(self.backend.max_branch_range());
        let mut thunks: HashMap<FuncIndex, u32> = HashMap::new();
        let mut direct = 0_usize;

        for call in mem::take(&mut self.pending_calls) {
            let in_range = self.func_entries[call.callee]
                .filter(|entry| (i64::from(*entry) - i64::from(call.offset)).abs() <= range);
            let target = match in_range {
                Some(entry) => {
                    direct += 1;
                    entry
                }
                None => match thunks.entry(call.callee) {
                    Entry::Occupied(entry) => *entry.get(),
                    Entry::Vacant(entry) => *entry.insert(self.emit_thunk(call.callee)?),
                },
            };

            let rel = i32::try_from(i64::from(target) - i64::from(call.offset))
                .map_err(|_| Error::internal("call displacement overflows"))?;
            write_u32(&mut self.code, call.patch_at, rel as u32)?;
        }

        self.last_patched = self.code_len()?;
        tracing::trace!(
            direct,
            thunks = thunks.len(),
            "thunk pass done at {:#x}",
            self.last_patched
        );
        Ok(())
    }

    fn emit_thunk(&mut self, target: FuncIndex) -> Result<u32> {
        let begin = self.code_len()?;
        let patch_at = self.backend.emit_thunk(&mut self.code);
        let end = self.code_len()?;
        self.code_ranges.push(CodeRange {
            kind: CodeRangeKind::CallThunk { target },
            begin,
            end,
        });
        self.thunk_targets.push((patch_at, target));
        Ok(begin)
    }

    /// Emits the shared stubs and resolves every remaining reference.
    ///
    /// # Errors
    ///
    /// Fails if an outstanding compile task failed or a declared function was
    /// never defined.
    pub fn finish_codegen(&mut self) -> Result<()> {
        if self.stubs.is_some() {
            return Ok(());
        }
        self.freeze();
        self.finish_func_defs()?;

        let num_defined = self.env.num_defined_funcs();
        if let Some(def) = (0..num_defined)
            .map(DefinedFuncIndex::from_u32)
            .find(|def| !self.compiled[*def])
        {
            return Err(Self::invalid(format!(
                "function {} has no body",
                self.env.func_index(def).as_u32()
            )));
        }

        let env = self.env.clone();
        let backend = self.backend.clone();

        let exports: Vec<(ExportIndex, Export)> =
            self.exports.funcs.iter().map(|(index, export)| (index, *export)).collect();
        for (index, export) in exports {
            let stub = backend.emit_entry_stub(index, export.func_index, &env.sigs[export.sig]);
            let begin = self.append(stub, CodeRangeKind::Entry { export: index })?;
            self.exports.funcs[index].entry_offset = begin;
        }

        for (import, desc) in &env.func_imports {
            let sig = &env.sigs[desc.sig];
            let interp = self.append(
                backend.emit_interp_exit(import, sig),
                CodeRangeKind::ImportInterpExit { import },
            )?;
            let jit = self.append(
                backend.emit_jit_exit(import, sig),
                CodeRangeKind::ImportJitExit { import },
            )?;
            self.import_exits.push((interp, jit));
            self.func_entries[FuncIndex::from_u32(import.as_u32())] = Some(interp);
        }

        let out_of_bounds = self.append(backend.emit_trap_stub(Trap::MemoryOutOfBounds), CodeRangeKind::Inline)?;
        let interrupt = self.append(backend.emit_trap_stub(Trap::Interrupted), CodeRangeKind::Inline)?;
        let stack_overflow = self.append(backend.emit_trap_stub(Trap::StackOverflow), CodeRangeKind::Inline)?;
        let throw = self.append(backend.emit_throw_stub(), CodeRangeKind::ErrorExit)?;
        let stubs = StubOffsets {
            out_of_bounds,
            interrupt,
            stack_overflow,
            throw,
        };

        // nothing is appended after this, so every remaining call is resolved here
        self.thunk_pass()?;

        for (patch_at, kind) in mem::take(&mut self.pending_stub_refs) {
            let target = match kind {
                StubKind::OutOfBounds => stubs.out_of_bounds,
                StubKind::Interrupt => stubs.interrupt,
                StubKind::StackOverflow => stubs.stack_overflow,
                StubKind::Throw => stubs.throw,
            };
            self.link.internal_links.push(InternalLink { patch_at, target });
        }
        for (patch_at, func) in mem::take(&mut self.thunk_targets) {
            let target = self.func_entries[func]
                .ok_or_else(|| Error::internal(format!("thunk to unplaced function {}", func.as_u32())))?;
            self.link.internal_links.push(InternalLink { patch_at, target });
        }

        for segment in &self.elem_segments {
            let elems = segment
                .funcs
                .iter()
                .map(|func| {
                    func.map(|func| {
                        self.func_entries[func].ok_or_else(|| {
                            Error::internal(format!("table element {} was never placed", func.as_u32()))
                        })
                    })
                    .transpose()
                })
                .collect::<Result<Vec<_>>>()?;
            self.link.func_ptr_tables.push(FuncPtrTable {
                table: segment.table,
                global_data_offset: env.tables[segment.table].global_data_offset,
                elems,
            });
        }

        self.indirect_sigs.sort_unstable();
        self.indirect_sigs.dedup();
        self.stubs = Some(stubs);

        tracing::debug!(
            code = self.code.len(),
            ranges = self.code_ranges.len(),
            internal_links = self.link.internal_links.len(),
            "code generation finished"
        );
        Ok(())
    }

    /// Assembles the immutable [`Module`].
    ///
    /// # Errors
    ///
    /// Fails if code generation fails, see [`finish_codegen`](Self::finish_codegen).
    pub fn finish(mut self) -> Result<Module> {
        self.finish_codegen()?;
        let stubs = self
            .stubs
            .ok_or_else(|| Error::internal("code generation did not finish"))?;

        let start_offset = self.start.and_then(|func| self.func_entries[func]);
        // release the slots' references so the environment can be moved out
        self.free_tasks.clear();
        let env = Arc::unwrap_or_clone(self.env);

        let imports = env
            .func_imports
            .iter()
            .zip(self.import_exits.values())
            .map(|((_, import), &(interp_exit_offset, jit_exit_offset))| Import {
                module: import.module.clone(),
                name: import.name.clone(),
                sig: import.sig,
                global_data_offset: import.global_data_offset,
                interp_exit_offset,
                jit_exit_offset,
            })
            .collect();

        let mut func_names = self.func_names;
        func_names.sort_by_key(|(func, _)| *func);
        func_names.dedup_by_key(|(func, _)| *func);

        let parts = ModuleParts {
            metadata: Metadata {
                env,
                code_ranges: self.code_ranges,
                trap_sites: self.trap_sites,
                call_sites: self.call_sites,
                start: self.start,
                start_offset,
                elem_segments: self.elem_segments,
                stubs,
                indirect_sigs: self.indirect_sigs,
                name: self.name,
                func_names,
            },
            code: self.code.into_boxed_slice(),
            link: self.link,
            imports,
            exports: self.exports,
            data_segments: self.data_segments,
            bytecode: self.bytecode,
        };
        Ok(Module::from_parts(&self.engine, parts))
    }
}

// ===== impl FunctionGenerator =====

impl FunctionGenerator {
    /// Copies the body of the function, which starts at `offset` in the module bytecode.
    pub fn set_body(&mut self, bytes: &[u8], offset: usize) -> Result<()> {
        self.task.body.clear();
        self.task.body.try_reserve(bytes.len())?;
        self.task.body.extend_from_slice(bytes);
        self.task.body_offset = offset;
        Ok(())
    }
}

// ===== impl CompileTask =====

impl CompileTask {
    fn run(&mut self) {
        let output = self.compile();
        if let Err(err) = &output {
            tracing::debug!("failed to compile function {}: {err}", self.func_index.as_u32());
        }
        self.output = Some(output);
    }

    fn compile(&self) -> Result<CompiledCode> {
        let mut decoder = FuncDecoder::new(&self.body, self.body_offset);
        let func = compile_function(&self.env, self.func_index, &mut decoder)?;
        self.backend.compile_function(self.func_index, &func)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, InterruptMode, Limits};
    use crate::types::ValType;

    fn engine(range: u32) -> Engine {
        let mut config = Config::new();
        config
            .parallel_compilation(false)
            .interrupt_mode(InterruptMode::Signal)
            .max_branch_range(range);
        Engine::new(&config)
    }

    /// Bodies of every function defined in `wat`, with their offsets.
    fn bodies(wat: &str) -> (Vec<u8>, Vec<core::ops::Range<usize>>) {
        let wasm = wat::parse_str(wat).unwrap();
        let mut ranges = Vec::new();
        for payload in wasmparser::Parser::new(0).parse_all(&wasm) {
            if let wasmparser::Payload::CodeSectionEntry(body) = payload.unwrap() {
                ranges.push(body.range());
            }
        }
        (wasm, ranges)
    }

    fn i32_sig() -> Sig {
        Sig::new([], Some(ValType::I32))
    }

    fn define_all(generator: &mut ModuleGenerator, wasm: &[u8], ranges: &[core::ops::Range<usize>], order: &[u32]) {
        for &i in order {
            let mut fg = generator.start_func_def().unwrap();
            let range = ranges[i as usize].clone();
            fg.set_body(&wasm[range.clone()], range.start).unwrap();
            generator.finish_func_def(FuncIndex::from_u32(i), fg).unwrap();
        }
    }

    #[test]
    fn declarations_are_limited() {
        let mut config = Config::new();
        config.limits(Limits {
            max_types: 1,
            ..Limits::default()
        });
        let mut generator = ModuleGenerator::new(&Engine::new(&config));
        generator.declare_sig(i32_sig()).unwrap();
        assert!(matches!(
            generator.declare_sig(i32_sig()),
            Err(Error::LimitExceeded { what: "types", .. })
        ));
    }

    #[test]
    fn declarations_are_frozen_by_definitions() {
        let mut generator = ModuleGenerator::new(&engine(1 << 20));
        let sig = generator.declare_sig(i32_sig()).unwrap();
        generator.declare_func(sig).unwrap();
        let _fg = generator.start_func_def().unwrap();
        assert!(matches!(generator.declare_func(sig), Err(Error::Internal(_))));
    }

    #[test]
    fn global_data_layout() {
        let mut generator = ModuleGenerator::new(&engine(1 << 20));
        let sig = generator.declare_sig(i32_sig()).unwrap();
        generator.declare_func_import("env", "f", sig).unwrap();
        generator
            .declare_global(
                GlobalType {
                    content: ValType::F64,
                    mutable: true,
                },
                InitExpr::F64(0),
            )
            .unwrap();
        let env = generator.env();
        assert_eq!(env.sig_data_offsets[sig], 0);
        assert_eq!(env.func_imports[ImportIndex::from_u32(0)].global_data_offset, 8);
        assert_eq!(env.globals[GlobalIndex::from_u32(0)].global_data_offset, 24);
        assert_eq!(env.global_data_len, 32);
    }

    #[test]
    fn functions_compile_once() {
        let (wasm, ranges) = bodies("(module (func (result i32) i32.const 1))");
        let mut generator = ModuleGenerator::new(&engine(1 << 20));
        let sig = generator.declare_sig(i32_sig()).unwrap();
        generator.declare_func(sig).unwrap();
        define_all(&mut generator, &wasm, &ranges, &[0]);

        let mut fg = generator.start_func_def().unwrap();
        fg.set_body(&wasm[ranges[0].clone()], ranges[0].start).unwrap();
        assert!(matches!(
            generator.finish_func_def(FuncIndex::from_u32(0), fg),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn missing_bodies_fail_codegen() {
        let mut generator = ModuleGenerator::new(&engine(1 << 20));
        let sig = generator.declare_sig(i32_sig()).unwrap();
        generator.declare_func(sig).unwrap();
        assert!(matches!(
            generator.finish_codegen(),
            Err(Error::InvalidWebAssembly { .. })
        ));
    }

    const FAR_CALLS: &str = r#"(module
        (func $caller (result i32) (i32.add (call $callee) (call $callee)))
        (func $pad (result i32)
            (drop (i32.const 1)) (drop (i32.const 2)) (drop (i32.const 3)) (drop (i32.const 4))
            (drop (i32.const 5)) (drop (i32.const 6)) (drop (i32.const 7)) (drop (i32.const 8))
            (drop (i32.const 9)) (drop (i32.const 10)) (drop (i32.const 11)) (drop (i32.const 12))
            (drop (i32.const 13)) (drop (i32.const 14)) (drop (i32.const 15)) (drop (i32.const 16))
            (drop (i32.const 17)) (drop (i32.const 18)) (drop (i32.const 19)) (drop (i32.const 20))
            (drop (i32.const 21))
            (i32.const 22))
        (func $callee (result i32) (i32.const 21)))"#;

    fn far_call_module(range: u32) -> Module {
        let (wasm, ranges) = bodies(FAR_CALLS);
        let mut generator = ModuleGenerator::new(&engine(range));
        let sig = generator.declare_sig(i32_sig()).unwrap();
        for _ in 0..3 {
            generator.declare_func(sig).unwrap();
        }
        generator
            .declare_export("caller", EntityIndex::Function(FuncIndex::from_u32(0)))
            .unwrap();
        define_all(&mut generator, &wasm, &ranges, &[0, 1, 2]);
        generator.finish().unwrap()
    }

    #[test]
    fn distant_calls_share_one_thunk() {
        let module = far_call_module(512);
        let thunks: Vec<_> = module
            .code_ranges()
            .iter()
            .filter_map(|range| match range.kind {
                CodeRangeKind::CallThunk { target } if target == FuncIndex::from_u32(2) => {
                    Some(range.begin)
                }
                _ => None,
            })
            .collect();
        assert_eq!(thunks.len(), 1);
        // the thunk directly follows the caller, ahead of the padding
        assert_eq!(thunks[0], module.code_ranges()[0].end);
    }

    #[test]
    fn close_calls_are_patched_directly() {
        let module = far_call_module(1 << 20);
        assert!(
            module
                .code_ranges()
                .iter()
                .all(|range| !matches!(range.kind, CodeRangeKind::CallThunk { .. }))
        );
        // ranges are sorted and non-overlapping
        assert!(module.code_ranges().windows(2).all(|w| w[0].end <= w[1].begin));
    }

    #[test]
    fn oversized_functions_are_rejected() {
        let (wasm, ranges) = bodies(FAR_CALLS);
        let mut generator = ModuleGenerator::new(&engine(128));
        let sig = generator.declare_sig(i32_sig()).unwrap();
        for _ in 0..3 {
            generator.declare_func(sig).unwrap();
        }
        let mut fg = generator.start_func_def().unwrap();
        fg.set_body(&wasm[ranges[1].clone()], ranges[1].start).unwrap();
        assert!(matches!(
            generator.finish_func_def(FuncIndex::from_u32(1), fg),
            Err(Error::CodeTooLarge(_))
        ));
    }
}
