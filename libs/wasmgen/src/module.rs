// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::sync::Arc;

use cranelift_entity::PrimaryMap;
use serde::{Deserialize, Serialize};

use crate::env::ModuleEnv;
use crate::errors::TrapInfo;
use crate::host::Imports;
use crate::indices::{ExportIndex, FuncIndex, GlobalIndex, ImportIndex, SigIndex, TableIndex};
use crate::instance::Instance;
use crate::link::{CallSiteDesc, CodeRange, CodeRangeKind, LinkData, TrapSite, lookup_code_range, lookup_trap_site};
use crate::translate::ModuleTranslator;
use crate::trap::Trap;
use crate::types::{InitExpr, Sig};
use crate::utils::enum_accessors;
use crate::{Engine, Result};

/// A compiled WebAssembly module, ready to be instantiated.
///
/// The module is immutable: it holds the generated code, the relocations
/// needed to make it runnable and the metadata used to map code offsets back
/// to functions and bytecode offsets. The code is linked once, on first
/// instantiation, and the linked copy is shared by all instances.
#[derive(Clone)]
pub struct Module(Arc<ModuleInner>);

struct ModuleInner {
    engine: Engine,
    metadata: Metadata,
    code: Box<[u8]>,
    link: LinkData,
    imports: PrimaryMap<ImportIndex, Import>,
    exports: Exports,
    data_segments: Vec<DataSegment>,
    bytecode: Option<Box<[u8]>>,
    linked: spin::Once<Arc<[u8]>>,
}

/// A function import and the code generated to call it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Import {
    pub module: String,
    pub name: String,
    pub sig: SigIndex,
    /// Offset of the import's call-exit record in global data.
    pub global_data_offset: u32,
    pub interp_exit_offset: u32,
    pub jit_exit_offset: u32,
}

/// An exported function and the entry stub calling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Export {
    pub func_index: FuncIndex,
    pub sig: SigIndex,
    pub entry_offset: u32,
}

/// What an export name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExportItem {
    Function(ExportIndex),
    Table(TableIndex),
    /// The module's linear memory.
    Memory,
    Global(GlobalIndex),
}

/// Exported functions and the names every export is reachable under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Exports {
    pub funcs: PrimaryMap<ExportIndex, Export>,
    /// Export names in declaration order. Several names may map to the same item.
    pub names: Vec<(String, ExportItem)>,
}

/// An active data segment, copied into linear memory at instantiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSegment {
    pub offset: InitExpr,
    pub bytes: Vec<u8>,
}

/// An active element segment, written into a table at instantiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElemSegment {
    pub table: TableIndex,
    pub offset: InitExpr,
    pub funcs: Vec<Option<FuncIndex>>,
}

/// Code offsets of the shared stubs every function body may jump to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StubOffsets {
    pub out_of_bounds: u32,
    pub interrupt: u32,
    pub stack_overflow: u32,
    pub throw: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Metadata {
    pub env: ModuleEnv,
    /// Sorted by address, non-overlapping.
    pub code_ranges: Vec<CodeRange>,
    /// Sorted by code offset.
    pub trap_sites: Vec<TrapSite>,
    pub call_sites: Vec<CallSiteDesc>,
    pub start: Option<FuncIndex>,
    /// Code offset the start function is entered at.
    pub start_offset: Option<u32>,
    pub elem_segments: Vec<ElemSegment>,
    pub stubs: StubOffsets,
    /// Signatures expected at `call_indirect` sites, sorted.
    pub indirect_sigs: Vec<SigIndex>,
    pub name: Option<String>,
    /// Sorted by function index.
    pub func_names: Vec<(FuncIndex, String)>,
}

/// Everything a [`Module`] is assembled from.
pub(crate) struct ModuleParts {
    pub metadata: Metadata,
    pub code: Box<[u8]>,
    pub link: LinkData,
    pub imports: PrimaryMap<ImportIndex, Import>,
    pub exports: Exports,
    pub data_segments: Vec<DataSegment>,
    pub bytecode: Option<Box<[u8]>>,
}

// ===== impl Module =====

impl Module {
    /// Creates a new module from the given WebAssembly bytes.
    ///
    /// This will validate, translate and compile the module and is the first
    /// step in Wasm execution.
    ///
    /// # Errors
    ///
    /// Returns an error if the WebAssembly module is malformed, exceeds the
    /// engine's limits, uses an unsupported feature, or compilation fails.
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self> {
        ModuleTranslator::new(engine).translate(bytes)
    }

    pub(crate) fn from_parts(engine: &Engine, parts: ModuleParts) -> Self {
        Self(Arc::new(ModuleInner {
            engine: engine.clone(),
            metadata: parts.metadata,
            code: parts.code,
            link: parts.link,
            imports: parts.imports,
            exports: parts.exports,
            data_segments: parts.data_segments,
            bytecode: parts.bytecode,
            linked: spin::Once::new(),
        }))
    }

    /// Instantiates this module with the given imports.
    ///
    /// # Errors
    ///
    /// Fails if the imports do not match the module's declarations, a segment
    /// does not fit into its memory or table, or the start function traps.
    pub fn instantiate(&self, imports: &Imports) -> Result<Instance> {
        Instance::new(self, imports)
    }

    pub fn engine(&self) -> &Engine {
        &self.0.engine
    }

    pub fn same(lhs: &Module, rhs: &Module) -> bool {
        Arc::ptr_eq(&lhs.0, &rhs.0)
    }

    /// Returns the module name from the name section, if present.
    pub fn name(&self) -> Option<&str> {
        self.0.metadata.name.as_deref()
    }

    /// Returns the debug name of a function from the name section, if present.
    pub fn func_name(&self, func: FuncIndex) -> Option<&str> {
        let names = &self.0.metadata.func_names;
        let index = names.binary_search_by_key(&func, |(func, _)| *func).ok()?;
        Some(&names[index].1)
    }

    /// Returns the modules function imports.
    pub fn imports(&self) -> impl ExactSizeIterator<Item = &Import> {
        self.0.imports.values()
    }

    /// Returns the modules exports.
    pub fn exports(&self) -> impl ExactSizeIterator<Item = (&str, ExportItem)> + '_ {
        self.0
            .exports
            .names
            .iter()
            .map(|(name, item)| (name.as_str(), *item))
    }

    pub fn get_export(&self, name: &str) -> Option<ExportItem> {
        self.0
            .exports
            .names
            .iter()
            .find_map(|(export, item)| (export == name).then_some(*item))
    }

    pub fn export_func(&self, index: ExportIndex) -> Option<&Export> {
        self.0.exports.funcs.get(index)
    }

    pub fn sig(&self, index: SigIndex) -> Option<&Sig> {
        self.0.metadata.env.sigs.get(index)
    }

    /// The unlinked generated code.
    pub fn code(&self) -> &[u8] {
        &self.0.code
    }

    pub fn code_ranges(&self) -> &[CodeRange] {
        &self.0.metadata.code_ranges
    }

    /// Finds the code range containing the code offset `pc`.
    pub fn lookup_code_range(&self, pc: u32) -> Option<&CodeRange> {
        lookup_code_range(&self.0.metadata.code_ranges, pc)
    }

    pub fn link_data(&self) -> &LinkData {
        &self.0.link
    }

    pub fn data_segments(&self) -> &[DataSegment] {
        &self.0.data_segments
    }

    /// The original bytecode, if the engine was configured to retain it.
    pub fn bytecode(&self) -> Option<&[u8]> {
        self.0.bytecode.as_deref()
    }

    pub(crate) fn metadata(&self) -> &Metadata {
        &self.0.metadata
    }

    pub(crate) fn env(&self) -> &ModuleEnv {
        &self.0.metadata.env
    }

    pub(crate) fn import(&self, index: ImportIndex) -> Option<&Import> {
        self.0.imports.get(index)
    }

    pub(crate) fn import_map(&self) -> &PrimaryMap<ImportIndex, Import> {
        &self.0.imports
    }

    pub(crate) fn export_data(&self) -> &Exports {
        &self.0.exports
    }

    /// Returns the statically linked code, linking it on first use.
    pub(crate) fn linked_code(&self) -> Result<&Arc<[u8]>> {
        self.0
            .linked
            .try_call_once(|| self.0.link.link(&self.0.code).map(Arc::from))
    }

    /// Describes a trap raised by the instruction at code offset `pc`.
    pub(crate) fn trap_info(&self, trap: Trap, pc: u32) -> TrapInfo {
        let range = self.lookup_code_range(pc);
        let func_index = range.and_then(CodeRange::func_index);
        let bytecode_offset = lookup_trap_site(&self.0.metadata.trap_sites, pc).or_else(|| {
            match range?.kind {
                CodeRangeKind::Function {
                    bytecode_offset, ..
                } => Some(bytecode_offset),
                _ => None,
            }
        });
        TrapInfo {
            trap,
            func_index,
            bytecode_offset,
        }
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name())
            .field("code_len", &self.0.code.len())
            .field("imports", &self.0.imports.len())
            .field("exports", &self.0.exports.names)
            .finish_non_exhaustive()
    }
}

// ===== impl ExportItem =====

impl ExportItem {
    enum_accessors! {
        e
        (Function(ExportIndex) is_func get_func unwrap_func *e)
        (Table(TableIndex) is_table get_table unwrap_table *e)
        (Global(GlobalIndex) is_global get_global unwrap_global *e)
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, Self::Memory)
    }
}
