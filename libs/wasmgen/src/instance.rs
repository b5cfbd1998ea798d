// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cranelift_entity::{EntityRef, PrimaryMap, SecondaryMap};
use smallvec::SmallVec;

use crate::env::{EXIT_RECORD_STATE_OFFSET, GlobalInit};
use crate::errors::TrapInfo;
use crate::host::{HostFunc, Imports};
use crate::indices::{ExportIndex, FuncIndex, GlobalIndex, ImportIndex, TableIndex};
use crate::memory::Memory;
use crate::module::{ExportItem, Module};
use crate::signature_registry::{RegisteredSig, SigToken};
use crate::table::{FuncRef, Table};
use crate::trap::Trap;
use crate::types::{InitExpr, Sig, ValType};
use crate::values::{HostObject, RawVal, Val};
use crate::{Error, Result, vm};

/// An instantiated module.
///
/// Cloning an `Instance` yields another handle to the same instance.
#[derive(Clone)]
pub struct Instance(Arc<InstanceInner>);

pub(crate) struct InstanceInner {
    pub(crate) module: Module,
    /// The module's linked code.
    pub(crate) code: Arc<[u8]>,
    global_data: spin::Mutex<Box<[u8]>>,
    pub(crate) memory: Option<Memory>,
    pub(crate) tables: Vec<Table>,
    host_funcs: PrimaryMap<ImportIndex, HostFunc>,
    /// Keeps the signatures expected at `call_indirect` sites registered.
    _sig_tokens: Vec<RegisteredSig>,
    pub(crate) interrupt: InterruptHandle,
    profiling: AtomicBool,
    /// Number of calls that entered each function through its profiling entry.
    profile: spin::Mutex<SecondaryMap<FuncIndex, u64>>,
}

/// Which exit an import call currently takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImportExitState {
    /// Calls box their arguments and take the host function's generic path.
    Interpreted,
    /// Calls pass raw arguments to the host function's optimized code.
    Optimized,
    /// The optimized code was invalidated and calls went back to the generic path.
    Reverted,
}

/// Requests that running wasm code of an instance stops with
/// [`Trap::Interrupted`].
///
/// The request is consumed by the first interrupt check that observes it.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

// ===== impl Instance =====

impl Instance {
    pub(crate) fn new(module: &Module, imports: &Imports) -> Result<Self> {
        let env = module.env();
        let engine = module.engine();

        if imports.funcs.len() != env.func_imports.len() {
            return Err(Error::Instantiation(format!(
                "module imports {} functions but {} were provided",
                env.func_imports.len(),
                imports.funcs.len()
            )));
        }
        let host_funcs: PrimaryMap<ImportIndex, HostFunc> = imports.funcs.iter().cloned().collect();

        let tables = resolve_tables(module, imports)?;
        let memory = resolve_memory(module, imports)?;
        let globals = resolve_globals(module, imports)?;

        let mut global_data = Vec::new();
        global_data.try_reserve_exact(env.global_data_len as usize)?;
        global_data.resize(env.global_data_len as usize, 0);

        let mut sig_tokens = Vec::with_capacity(module.metadata().indirect_sigs.len());
        for &sig in &module.metadata().indirect_sigs {
            let registered = engine.signatures().register(&env.sigs[sig]);
            write_bytes(
                &mut global_data,
                env.sig_data_offsets[sig],
                &registered.token().as_u64().to_le_bytes(),
            )?;
            sig_tokens.push(registered);
        }
        for import in module.import_map().values() {
            write_exit_record(
                &mut global_data,
                import.global_data_offset,
                import.interp_exit_offset,
                ImportExitState::Interpreted,
            )?;
        }
        for (index, desc) in &env.tables {
            write_bytes(
                &mut global_data,
                desc.global_data_offset,
                &index.as_u32().to_le_bytes(),
            )?;
        }
        for (index, desc) in &env.globals {
            let ty = desc.ty.content;
            let bytes = RawVal::from(globals[index]).bits().to_le_bytes();
            write_bytes(
                &mut global_data,
                desc.global_data_offset,
                &bytes[..ty.byte_size() as usize],
            )?;
        }

        let (elem_offsets, data_offsets) = check_segments(module, &tables, memory.as_ref(), &globals)?;

        let inner = Arc::new(InstanceInner {
            module: module.clone(),
            code: module.linked_code()?.clone(),
            global_data: spin::Mutex::new(global_data.into_boxed_slice()),
            memory,
            tables,
            host_funcs,
            _sig_tokens: sig_tokens,
            interrupt: InterruptHandle::default(),
            profiling: AtomicBool::new(false),
            profile: spin::Mutex::new(SecondaryMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        let metadata = module.metadata();
        for ((segment, ptrs), offset) in metadata
            .elem_segments
            .iter()
            .zip(&module.link_data().func_ptr_tables)
            .zip(elem_offsets)
        {
            let elems = segment
                .funcs
                .iter()
                .zip(&ptrs.elems)
                .map(|(func, code_offset)| match (func, code_offset) {
                    (Some(func), Some(code_offset)) => Some(FuncRef {
                        sig: engine.signatures().register(env.func_sig(*func)),
                        code_offset: *code_offset,
                        instance: weak.clone(),
                    }),
                    _ => None,
                })
                .collect();
            inner.tables[segment.table.index()]
                .init(offset, elems)
                .map_err(segment_trap)?;
        }
        if let Some(memory) = &inner.memory {
            for (segment, offset) in module.data_segments().iter().zip(data_offsets) {
                memory
                    .write(offset as usize, &segment.bytes)
                    .map_err(|_| segment_trap(Trap::MemoryOutOfBounds))?;
            }
        }

        tracing::debug!(
            name = module.name(),
            imports = inner.host_funcs.len(),
            tables = inner.tables.len(),
            "instantiated module"
        );

        if let Some(entry) = metadata.start_offset {
            tracing::trace!("running start function");
            vm::invoke(&inner, entry, &mut [RawVal::ZERO])?;
        }

        Ok(Self(inner))
    }

    pub fn module(&self) -> &Module {
        &self.0.module
    }

    pub fn same(lhs: &Instance, rhs: &Instance) -> bool {
        Arc::ptr_eq(&lhs.0, &rhs.0)
    }

    /// Calls the exported function `name`.
    ///
    /// Arguments are converted to the function's parameter types the way
    /// [`Val::coerce_to`] does. Missing arguments default to NaN for float
    /// parameters and zero otherwise, extra arguments are ignored.
    ///
    /// # Errors
    ///
    /// Fails if there is no such function export, an argument cannot be
    /// converted, or the call traps or a host function fails.
    pub fn call_export(&self, name: &str, args: &[Val]) -> Result<Option<Val>> {
        let index = self
            .0
            .module
            .get_export(name)
            .and_then(|item| item.get_func())
            .ok_or_else(|| Error::UnknownExport(name.to_string()))?;
        self.call_export_index(index, args)
    }

    /// Calls the function export `index`, see [`Instance::call_export`].
    ///
    /// # Errors
    ///
    /// See [`Instance::call_export`].
    pub fn call_export_index(&self, index: ExportIndex, args: &[Val]) -> Result<Option<Val>> {
        let module = &self.0.module;
        let export = module
            .export_func(index)
            .ok_or_else(|| Error::UnknownExport(format!("function export {}", index.as_u32())))?;
        let sig = module
            .sig(export.sig)
            .ok_or_else(|| Error::internal("export with unknown signature"))?;

        let mut slots: SmallVec<[RawVal; 8]> =
            SmallVec::from_elem(RawVal::ZERO, sig.params().len().max(1));
        for (i, (slot, ty)) in slots.iter_mut().zip(sig.params()).enumerate() {
            *slot = match args.get(i) {
                Some(arg) => RawVal::from(arg.coerce_to(*ty)?),
                None => RawVal::absent(*ty),
            };
        }

        tracing::trace!(export = index.as_u32(), %sig, "calling export");
        vm::invoke(&self.0, export.entry_offset, &mut slots)?;
        Ok(sig.result().map(|ty| slots[0].to_val(ty)))
    }

    /// Calls the exported function `name` as a constructor.
    ///
    /// The function runs for its effects, the caller always receives a fresh
    /// empty object.
    ///
    /// # Errors
    ///
    /// See [`Instance::call_export`].
    pub fn construct(&self, name: &str, args: &[Val]) -> Result<HostObject> {
        self.call_export(name, args)?;
        Ok(HostObject::new())
    }

    /// Returns the instance's exports.
    pub fn exports(&self) -> impl ExactSizeIterator<Item = (&str, ExportItem)> + '_ {
        self.0.module.exports()
    }

    pub fn get_memory(&self, name: &str) -> Option<Memory> {
        match self.0.module.get_export(name)? {
            ExportItem::Memory => self.0.memory.clone(),
            _ => None,
        }
    }

    pub fn get_table(&self, name: &str) -> Option<Table> {
        let index = self.0.module.get_export(name)?.get_table()?;
        self.0.tables.get(index.index()).cloned()
    }

    /// Returns the current value of the exported global `name`.
    pub fn get_global(&self, name: &str) -> Option<Val> {
        let index = self.0.module.get_export(name)?.get_global()?;
        self.0.global_value(index).ok()
    }

    pub fn memory(&self) -> Option<&Memory> {
        self.0.memory.as_ref()
    }

    pub fn table(&self, index: TableIndex) -> Option<&Table> {
        self.0.tables.get(index.index())
    }

    /// Returns which exit calls to the function import `import` take.
    pub fn import_state(&self, import: ImportIndex) -> Option<ImportExitState> {
        let import = self.0.module.import(import)?;
        self.0
            .exit_record(import.global_data_offset)
            .ok()
            .map(|(_, state)| state)
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.0.interrupt.clone()
    }

    /// Switches the instance in or out of profiling mode.
    ///
    /// While profiling, every call into one of the instance's functions goes
    /// through the function's profiling entry and is counted, see
    /// [`Instance::profile`]. Table elements referring to the instance's
    /// functions are re-pointed to the matching entry, in every table the
    /// instance uses.
    pub fn set_profiling(&self, enabled: bool) {
        if self.0.profiling.swap(enabled, Ordering::AcqRel) == enabled {
            return;
        }
        tracing::debug!(enabled, "toggling profiling mode");

        let owner = Arc::as_ptr(&self.0);
        let module = &self.0.module;
        for table in &self.0.tables {
            table.repoint_elems(owner, |offset| {
                let Some((profiling, regular)) =
                    module.lookup_code_range(offset).and_then(|range| range.func_entries())
                else {
                    return offset;
                };
                if enabled && offset == regular {
                    profiling
                } else if !enabled && offset == profiling {
                    regular
                } else {
                    offset
                }
            });
        }
    }

    pub fn is_profiling(&self) -> bool {
        self.0.is_profiling()
    }

    /// Returns how often each function was entered while profiling, in
    /// function index order. Functions that were never entered are omitted.
    pub fn profile(&self) -> Vec<(FuncIndex, u64)> {
        self.0
            .profile
            .lock()
            .iter()
            .filter(|&(_, &count)| count > 0)
            .map(|(func, &count)| (func, count))
            .collect()
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("module", &self.0.module)
            .field("memory", &self.0.memory)
            .field("tables", &self.0.tables)
            .finish_non_exhaustive()
    }
}

// ===== impl InstanceInner =====

impl InstanceInner {
    pub(crate) fn is_profiling(&self) -> bool {
        self.profiling.load(Ordering::Acquire)
    }

    pub(crate) fn record_profiling_entry(&self, func: FuncIndex) {
        self.profile.lock()[func] += 1;
    }

    fn read_bytes<const N: usize>(&self, offset: u32) -> Result<[u8; N]> {
        let data = self.global_data.lock();
        let start = offset as usize;
        data.get(start..start + N)
            .and_then(|bytes| <[u8; N]>::try_from(bytes).ok())
            .ok_or_else(|| Error::internal(format!("global data read at {offset:#x} out of bounds")))
    }

    pub(crate) fn read_global(&self, offset: u32, ty: ValType) -> Result<RawVal> {
        let data = self.global_data.lock();
        let start = offset as usize;
        let src = data
            .get(start..start + ty.byte_size() as usize)
            .ok_or_else(|| Error::internal(format!("global read at {offset:#x} out of bounds")))?;
        let mut bytes = [0; 16];
        bytes[..src.len()].copy_from_slice(src);
        Ok(RawVal::from_bits(u128::from_le_bytes(bytes)))
    }

    pub(crate) fn write_global(&self, offset: u32, ty: ValType, value: RawVal) -> Result<()> {
        let bytes = value.bits().to_le_bytes();
        write_bytes(
            &mut self.global_data.lock(),
            offset,
            &bytes[..ty.byte_size() as usize],
        )
    }

    fn global_value(&self, index: GlobalIndex) -> Result<Val> {
        let desc = self
            .module
            .env()
            .globals
            .get(index)
            .ok_or_else(|| Error::internal("unknown global"))?;
        let ty = desc.ty.content;
        Ok(self.read_global(desc.global_data_offset, ty)?.to_val(ty))
    }

    fn exit_record(&self, offset: u32) -> Result<(u32, ImportExitState)> {
        let code_offset = u32::from_le_bytes(self.read_bytes(offset)?);
        let state = u32::from_le_bytes(self.read_bytes(offset + EXIT_RECORD_STATE_OFFSET)?);
        let state = ImportExitState::from_u32(state)
            .ok_or_else(|| Error::internal(format!("corrupt exit record at {offset:#x}")))?;
        Ok((code_offset, state))
    }

    /// The code offset a call through the exit record at `offset` continues at.
    pub(crate) fn exit_target(&self, offset: u32) -> Result<u32> {
        self.read_bytes(offset).map(u32::from_le_bytes)
    }

    /// Resolves the table handle at `offset`.
    pub(crate) fn table_at(&self, offset: u32) -> Result<&Table> {
        let index = u32::from_le_bytes(self.read_bytes(offset)?);
        self.tables
            .get(index as usize)
            .ok_or_else(|| Error::internal(format!("corrupt table handle at {offset:#x}")))
    }

    /// The signature token an indirect call site with signature data at `offset` expects.
    pub(crate) fn sig_token_at(&self, offset: u32) -> Result<SigToken> {
        self.read_bytes(offset)
            .map(|bytes| SigToken::from_u64(u64::from_le_bytes(bytes)))
    }

    fn host_func(&self, import: ImportIndex) -> Result<&HostFunc> {
        self.host_funcs
            .get(import)
            .ok_or_else(|| Error::internal(format!("unknown import {}", import.as_u32())))
    }

    fn import_sig(&self, import: ImportIndex) -> Result<&Sig> {
        let desc = self
            .module
            .import(import)
            .ok_or_else(|| Error::internal(format!("unknown import {}", import.as_u32())))?;
        self.module
            .sig(desc.sig)
            .ok_or_else(|| Error::internal("import with unknown signature"))
    }

    /// Calls a function import through the host function's generic path.
    pub(crate) fn call_import_interp(self: &Arc<Self>, import: ImportIndex, args: &[RawVal]) -> Result<RawVal> {
        let host = self.host_func(import)?;
        let sig = self.import_sig(import)?;

        let vals: SmallVec<[Val; 8]> = sig
            .params()
            .iter()
            .zip(args)
            .map(|(ty, raw)| raw.to_val(*ty))
            .collect();
        let result = host.invoke(&vals).map_err(Error::Host)?;
        let raw = match (sig.result(), result) {
            (Some(ty), Some(value)) => RawVal::from(value.coerce_to(ty)?),
            (Some(ty), None) => {
                return Err(Error::TypeMismatch(format!(
                    "host function returned nothing, expected {ty}"
                )));
            }
            (None, _) => RawVal::ZERO,
        };

        self.maybe_optimize_import(import, host, sig)?;
        Ok(raw)
    }

    /// Calls a function import through the host function's optimized code,
    /// reverting to the generic path if that code is gone.
    pub(crate) fn call_import_jit(self: &Arc<Self>, import: ImportIndex, args: &[RawVal]) -> Result<RawVal> {
        let host = self.host_func(import)?;
        let Some(code) = host.optimized() else {
            self.deoptimize_import(import);
            return self.call_import_interp(import, args);
        };

        let sig = self.import_sig(import)?;
        let nargs = sig.params().len().min(args.len());
        let result = code.call(&args[..nargs]).map_err(Error::Host)?;
        // normalize so narrower results stay zero-extended in their slot
        Ok(sig
            .result()
            .map_or(RawVal::ZERO, |ty| RawVal::from(result.to_val(ty))))
    }

    /// Switches an import to its optimized exit once the host function has
    /// optimized code compatible with the import's signature.
    fn maybe_optimize_import(self: &Arc<Self>, import: ImportIndex, host: &HostFunc, sig: &Sig) -> Result<()> {
        if !self.module.engine().config().optimize_imports || sig.has_i64() {
            return Ok(());
        }
        let Some(code) = host.optimized() else {
            return Ok(());
        };
        if !code.accepts(sig) {
            return Ok(());
        }

        let desc = self
            .module
            .import(import)
            .ok_or_else(|| Error::internal("unknown import"))?;
        let (_, state) = self.exit_record(desc.global_data_offset)?;
        if state == ImportExitState::Optimized {
            return Ok(());
        }
        write_exit_record(
            &mut self.global_data.lock(),
            desc.global_data_offset,
            desc.jit_exit_offset,
            ImportExitState::Optimized,
        )?;
        host.add_dependent(Arc::downgrade(self), import);
        tracing::debug!(
            import = import.as_u32(),
            module = %desc.module,
            name = %desc.name,
            "import switched to optimized exit"
        );
        Ok(())
    }

    /// Reverts an optimized import to the generic exit.
    pub(crate) fn deoptimize_import(&self, import: ImportIndex) {
        let Some(desc) = self.module.import(import) else {
            return;
        };
        if !matches!(
            self.exit_record(desc.global_data_offset),
            Ok((_, ImportExitState::Optimized))
        ) {
            return;
        }
        if let Err(err) = write_exit_record(
            &mut self.global_data.lock(),
            desc.global_data_offset,
            desc.interp_exit_offset,
            ImportExitState::Reverted,
        ) {
            tracing::error!("failed to revert import {}: {err}", import.as_u32());
            return;
        }
        tracing::debug!(import = import.as_u32(), "import reverted to generic exit");
    }
}

impl Drop for InstanceInner {
    fn drop(&mut self) {
        let this = core::ptr::from_ref::<Self>(self);
        for host in self.host_funcs.values() {
            host.remove_dependent(this);
        }
    }
}

// ===== impl ImportExitState =====

impl ImportExitState {
    fn to_u32(self) -> u32 {
        match self {
            ImportExitState::Interpreted => 0,
            ImportExitState::Optimized => 1,
            ImportExitState::Reverted => 2,
        }
    }

    fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(ImportExitState::Interpreted),
            1 => Some(ImportExitState::Optimized),
            2 => Some(ImportExitState::Reverted),
            _ => None,
        }
    }
}

// ===== impl InterruptHandle =====

impl InterruptHandle {
    /// Requests an interrupt. Safe to call from any thread.
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Consumes a pending request.
    pub(crate) fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

// ===== instantiation helpers =====

fn write_bytes(data: &mut [u8], offset: u32, bytes: &[u8]) -> Result<()> {
    let start = offset as usize;
    let dst = data
        .get_mut(start..start + bytes.len())
        .ok_or_else(|| Error::internal(format!("global data write at {offset:#x} out of bounds")))?;
    dst.copy_from_slice(bytes);
    Ok(())
}

/// Writes the code offset and state of an exit record in one step.
fn write_exit_record(data: &mut [u8], offset: u32, code_offset: u32, state: ImportExitState) -> Result<()> {
    let mut record = [0; 8];
    record[..4].copy_from_slice(&code_offset.to_le_bytes());
    record[EXIT_RECORD_STATE_OFFSET as usize..].copy_from_slice(&state.to_u32().to_le_bytes());
    write_bytes(data, offset, &record)
}

fn segment_trap(trap: Trap) -> Error {
    Error::Trap(TrapInfo {
        trap,
        func_index: None,
        bytecode_offset: None,
    })
}

fn resolve_tables(module: &Module, imports: &Imports) -> Result<Vec<Table>> {
    let env = module.env();
    let registry = module.engine().signatures();
    let mut provided = imports.tables.iter();
    let mut tables = Vec::with_capacity(env.tables.len());

    for desc in env.tables.values() {
        let table = if let Some((from, name)) = &desc.import {
            let table = provided.next().ok_or_else(|| {
                Error::Instantiation(format!("missing table import {from}.{name}"))
            })?;
            let ty = table.ty();
            let max_fits = match (desc.ty.maximum, ty.maximum) {
                (None, _) => true,
                (Some(expected), Some(actual)) => actual <= expected,
                (Some(_), None) => false,
            };
            if table.size() < desc.ty.initial || !max_fits {
                return Err(Error::Instantiation(format!(
                    "table import {from}.{name} is incompatible, expected {:?} got {ty:?}",
                    desc.ty
                )));
            }
            if !table.bind_registry(registry) {
                return Err(Error::Instantiation(format!(
                    "table import {from}.{name} belongs to a different engine"
                )));
            }
            table.clone()
        } else {
            let table = Table::new(desc.ty);
            table.bind_registry(registry);
            table
        };
        tables.push(table);
    }

    if provided.next().is_some() {
        return Err(Error::Instantiation("too many table imports provided".into()));
    }
    Ok(tables)
}

fn resolve_memory(module: &Module, imports: &Imports) -> Result<Option<Memory>> {
    match (&module.env().memory, &imports.memory) {
        (Some(desc), Some(memory)) if desc.import.is_some() => {
            let ty = memory.ty();
            let max_fits = match (desc.ty.maximum, ty.maximum) {
                (None, _) => true,
                (Some(expected), Some(actual)) => actual <= expected,
                (Some(_), None) => false,
            };
            if memory.size() < desc.ty.initial || !max_fits {
                return Err(Error::Instantiation(format!(
                    "memory import is incompatible, expected {:?} got {ty:?}",
                    desc.ty
                )));
            }
            Ok(Some(memory.clone()))
        }
        (Some(desc), None) if desc.import.is_some() => {
            Err(Error::Instantiation("missing memory import".into()))
        }
        (Some(desc), None) => Memory::new(desc.ty).map(Some),
        (_, Some(_)) => Err(Error::Instantiation(
            "a memory was provided but the module does not import one".into(),
        )),
        (None, None) => Ok(None),
    }
}

/// Computes the initial value of every global. Imported globals are copied.
fn resolve_globals(module: &Module, imports: &Imports) -> Result<PrimaryMap<GlobalIndex, Val>> {
    let mut provided = imports.globals.iter();
    let mut values = PrimaryMap::with_capacity(module.env().globals.len());

    for desc in module.env().globals.values() {
        let ty = desc.ty.content;
        let value = match &desc.init {
            GlobalInit::Import { module, name } => {
                let value = provided.next().ok_or_else(|| {
                    Error::Instantiation(format!("missing global import {module}.{name}"))
                })?;
                if value.ty() != ty {
                    return Err(Error::Instantiation(format!(
                        "global import {module}.{name} has type {}, expected {ty}",
                        value.ty()
                    )));
                }
                *value
            }
            GlobalInit::Const(expr) => eval_init(expr, &values)?,
        };
        values.push(value);
    }

    if provided.next().is_some() {
        return Err(Error::Instantiation("too many global imports provided".into()));
    }
    Ok(values)
}

fn eval_init(expr: &InitExpr, globals: &PrimaryMap<GlobalIndex, Val>) -> Result<Val> {
    Ok(match *expr {
        InitExpr::I32(value) => Val::I32(value),
        InitExpr::I64(value) => Val::I64(value),
        InitExpr::F32(bits) => Val::F32(bits),
        InitExpr::F64(bits) => Val::F64(bits),
        InitExpr::V128(bits) => Val::V128(bits),
        InitExpr::GlobalGet(index) => *globals
            .get(index)
            .ok_or_else(|| Error::internal(format!("initializer reads global {}", index.as_u32())))?,
    })
}

fn segment_offset(expr: &InitExpr, globals: &PrimaryMap<GlobalIndex, Val>) -> Result<u32> {
    match eval_init(expr, globals)? {
        Val::I32(offset) => Ok(offset as u32),
        other => Err(Error::internal(format!(
            "segment offset of type {}",
            other.ty()
        ))),
    }
}

/// Evaluates segment offsets and checks that every segment fits before any
/// of them is written.
fn check_segments(
    module: &Module,
    tables: &[Table],
    memory: Option<&Memory>,
    globals: &PrimaryMap<GlobalIndex, Val>,
) -> Result<(Vec<u32>, Vec<u32>)> {
    let mut elem_offsets = Vec::with_capacity(module.metadata().elem_segments.len());
    for segment in &module.metadata().elem_segments {
        let offset = segment_offset(&segment.offset, globals)?;
        let table = tables
            .get(segment.table.index())
            .ok_or_else(|| Error::internal("element segment for unknown table"))?;
        if !table.fits(offset, segment.funcs.len()) {
            return Err(segment_trap(Trap::TableOutOfBounds));
        }
        elem_offsets.push(offset);
    }

    let mut data_offsets = Vec::with_capacity(module.data_segments().len());
    for segment in module.data_segments() {
        let offset = segment_offset(&segment.offset, globals)?;
        let size = memory.map_or(0, Memory::data_size);
        let fits = (offset as usize)
            .checked_add(segment.bytes.len())
            .is_some_and(|end| end <= size);
        if !fits {
            return Err(segment_trap(Trap::MemoryOutOfBounds));
        }
        data_offsets.push(offset);
    }

    Ok((elem_offsets, data_offsets))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Engine;

    fn instantiate(wat: &str, imports: &Imports) -> Result<Instance> {
        let engine = Engine::default();
        let module = Module::from_bytes(&engine, &wat::parse_str(wat).unwrap())?;
        module.instantiate(imports)
    }

    #[test]
    fn exit_records_start_interpreted() {
        let imports = {
            let mut imports = Imports::new();
            imports.func(HostFunc::new(|_| Ok(None)));
            imports
        };
        let instance = instantiate(
            r#"(module (import "env" "f" (func)) (func (export "g") (call 0)))"#,
            &imports,
        )
        .unwrap();
        let import = ImportIndex::from_u32(0);
        assert_eq!(instance.import_state(import), Some(ImportExitState::Interpreted));
        instance.call_export("g", &[]).unwrap();
        assert_eq!(instance.import_state(import), Some(ImportExitState::Interpreted));
    }

    #[test]
    fn missing_imports_are_rejected() {
        let err = instantiate(
            r#"(module (import "env" "f" (func)))"#,
            &Imports::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Instantiation(_)), "{err}");

        let err = instantiate(
            r#"(module (import "env" "g" (global i32)))"#,
            Imports::new().global(Val::I64(1)),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Instantiation(_)), "{err}");
    }

    #[test]
    fn globals_are_initialized_in_order() {
        let instance = instantiate(
            r#"(module
                (import "env" "base" (global i32))
                (global (export "copy") i32 (global.get 0))
                (global (export "wide") (mut f64) (f64.const 2.5)))"#,
            Imports::new().global(Val::I32(7)),
        )
        .unwrap();
        assert_eq!(instance.get_global("copy"), Some(Val::I32(7)));
        assert_eq!(instance.get_global("wide"), Some(Val::from(2.5f64)));
        assert_eq!(instance.get_global("missing"), None);
    }

    #[test]
    fn segments_are_checked_before_any_is_written() {
        let memory = Memory::new(crate::types::MemoryType {
            initial: 1,
            maximum: None,
        })
        .unwrap();
        let err = instantiate(
            r#"(module
                (import "env" "mem" (memory 1))
                (data (i32.const 0) "\01")
                (data (i32.const 65535) "\02\03"))"#,
            Imports::new().memory(memory.clone()),
        )
        .unwrap_err();
        assert_eq!(err.trap(), Some(Trap::MemoryOutOfBounds));

        let mut byte = [0xff];
        memory.read(0, &mut byte).unwrap();
        assert_eq!(byte, [0]);
    }

    #[test]
    fn interrupt_requests_are_consumed_once() {
        let handle = InterruptHandle::default();
        assert!(!handle.take());
        handle.interrupt();
        handle.clone().interrupt();
        assert!(handle.take());
        assert!(!handle.take());
    }
}
