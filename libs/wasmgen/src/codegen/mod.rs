// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

pub mod isa;
mod lower;
mod stubs;

use smallvec::SmallVec;

use crate::indices::{ExportIndex, FuncIndex, ImportIndex, SigIndex};
use crate::ir::Function;
use crate::link::{SymbolicAddress, TrapSite};
use crate::trap::Trap;
use crate::types::Sig;
use crate::Result;

pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Maximum displacement of a direct relative call, in bytes.
    fn max_branch_range(&self) -> u32;

    /// Size of one far-jump thunk emitted by [`Backend::emit_thunk`].
    fn thunk_size(&self) -> u32;

    /// Emits code for the function `func_index`. The code begins with its
    /// profiling entry, [`CompiledCode::entry`] is the regular entry.
    fn compile_function(&self, func_index: FuncIndex, func: &Function) -> Result<CompiledCode>;

    /// Emits the trampoline the embedder enters to call `callee`.
    fn emit_entry_stub(&self, export: ExportIndex, callee: FuncIndex, sig: &Sig) -> CompiledCode;

    /// Emits the exit taking the generic invoke path for an import.
    fn emit_interp_exit(&self, import: ImportIndex, sig: &Sig) -> CompiledCode;

    /// Emits the exit calling an import's optimized entry point.
    fn emit_jit_exit(&self, import: ImportIndex, sig: &Sig) -> CompiledCode;

    /// Emits a shared trap target.
    fn emit_trap_stub(&self, trap: Trap) -> CompiledCode;

    /// Emits the target generated code jumps to when a host call failed.
    fn emit_throw_stub(&self) -> CompiledCode;

    /// Appends a far-jump thunk to `code` and returns the offset of its
    /// (absolute, unlinked) target operand.
    fn emit_thunk(&self, code: &mut Vec<u8>) -> u32;
}

/// Machine code for one function or stub, with every offset relative to its start.
#[derive(Debug, Default)]
pub struct CompiledCode {
    pub code: Vec<u8>,
    /// Offset of the regular entry, zero for stubs.
    pub entry: u32,
    pub call_sites: Vec<CallSite>,
    pub stub_refs: Vec<StubRef>,
    pub symbolic_refs: Vec<SymbolicRef>,
    pub trap_sites: Vec<TrapSite>,
    /// Signatures this code expects at `call_indirect` sites.
    pub indirect_sigs: SmallVec<[SigIndex; 2]>,
}

/// A direct call whose displacement is patched once the callee is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    /// Start of the call instruction, which displacements are relative to.
    pub offset: u32,
    pub patch_at: u32,
    pub return_offset: u32,
    pub bytecode_offset: u32,
    pub callee: FuncIndex,
}

/// A reference to one of the shared stubs generated after all functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubRef {
    pub patch_at: u32,
    pub kind: StubKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StubKind {
    OutOfBounds,
    Interrupt,
    StackOverflow,
    Throw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolicRef {
    pub patch_at: u32,
    pub symbol: SymbolicAddress,
}

/// A backend emitting the crate's own interpretable instruction encoding.
#[derive(Debug, Clone, Copy)]
pub struct PortableBackend {
    max_branch_range: u32,
}

impl PortableBackend {
    pub fn new(max_branch_range: u32) -> Self {
        Self { max_branch_range }
    }
}

impl Backend for PortableBackend {
    fn name(&self) -> &'static str {
        "portable"
    }

    fn max_branch_range(&self) -> u32 {
        self.max_branch_range
    }

    fn thunk_size(&self) -> u32 {
        isa::THUNK_SIZE
    }

    fn compile_function(&self, func_index: FuncIndex, func: &Function) -> Result<CompiledCode> {
        lower::lower_function(func_index, func)
    }

    fn emit_entry_stub(&self, export: ExportIndex, callee: FuncIndex, sig: &Sig) -> CompiledCode {
        stubs::entry_stub(export, callee, sig)
    }

    fn emit_interp_exit(&self, import: ImportIndex, sig: &Sig) -> CompiledCode {
        stubs::interp_exit(import, sig)
    }

    fn emit_jit_exit(&self, import: ImportIndex, sig: &Sig) -> CompiledCode {
        stubs::jit_exit(import, sig)
    }

    fn emit_trap_stub(&self, trap: Trap) -> CompiledCode {
        stubs::trap_stub(trap)
    }

    fn emit_throw_stub(&self) -> CompiledCode {
        stubs::throw_stub()
    }

    fn emit_thunk(&self, code: &mut Vec<u8>) -> u32 {
        code.push(isa::Opcode::JumpFar.to_u8());
        let patch_at = u32::try_from(code.len()).unwrap_or(u32::MAX);
        code.extend_from_slice(&isa::UNLINKED.to_le_bytes());
        patch_at
    }
}
