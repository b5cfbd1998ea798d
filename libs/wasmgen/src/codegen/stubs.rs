// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Shared stubs emitted once per module after all functions.

use crate::codegen::isa::{CodeBuffer, NONE, Opcode};
use crate::codegen::{CallSite, CompiledCode, StubKind, StubRef, SymbolicRef};
use crate::indices::{ExportIndex, FuncIndex, ImportIndex};
use crate::link::SymbolicAddress;
use crate::trap::Trap;
use crate::types::{Sig, ValType};

fn nargs(sig: &Sig) -> u32 {
    sig.params().len() as u32
}

fn result_slot(sig: &Sig) -> u32 {
    if sig.result().is_some() { 0 } else { NONE }
}

/// Copies the embedder's argument array into a frame, calls `callee` and
/// writes the result back into the first argument slot.
pub(super) fn entry_stub(_export: ExportIndex, callee: FuncIndex, sig: &Sig) -> CompiledCode {
    let mut buf = CodeBuffer::new();
    let mut out = CompiledCode::default();

    buf.op(Opcode::EntryPrologue);
    buf.u32(nargs(sig));

    let offset = buf.offset();
    buf.op(Opcode::Call);
    let patch_at = buf.placeholder();
    buf.u32(nargs(sig));
    for slot in 0..nargs(sig) {
        buf.u32(slot);
    }
    buf.u32(result_slot(sig));
    out.call_sites.push(CallSite {
        offset,
        patch_at,
        return_offset: buf.offset(),
        bytecode_offset: 0,
        callee,
    });

    buf.op(Opcode::EntryReturn);
    buf.u32(result_slot(sig));

    out.code = buf.finish();
    out
}

/// Calls an import through the generic path, boxing every argument.
pub(super) fn interp_exit(import: ImportIndex, sig: &Sig) -> CompiledCode {
    let symbol = match sig.result() {
        None => SymbolicAddress::CallImportVoid,
        Some(ValType::I32) => SymbolicAddress::CallImportI32,
        Some(ValType::I64) => SymbolicAddress::CallImportI64,
        Some(ValType::F32) => SymbolicAddress::CallImportF32,
        Some(ValType::F64) => SymbolicAddress::CallImportF64,
        Some(ValType::V128) => SymbolicAddress::CallImportV128,
    };
    import_exit(Opcode::ExitInterp, symbol, import, sig)
}

/// Calls an import's optimized entry point with raw arguments.
pub(super) fn jit_exit(import: ImportIndex, sig: &Sig) -> CompiledCode {
    import_exit(Opcode::ExitJit, SymbolicAddress::CallImportJit, import, sig)
}

fn import_exit(op: Opcode, symbol: SymbolicAddress, import: ImportIndex, sig: &Sig) -> CompiledCode {
    let mut buf = CodeBuffer::new();
    let mut out = CompiledCode::default();

    buf.op(Opcode::Prologue);
    buf.u32(nargs(sig).max(1));
    out.stub_refs.push(StubRef {
        patch_at: buf.placeholder(),
        kind: StubKind::StackOverflow,
    });

    buf.op(op);
    out.symbolic_refs.push(SymbolicRef {
        patch_at: buf.placeholder(),
        symbol,
    });
    buf.u32(import.as_u32());
    buf.u32(nargs(sig));
    out.stub_refs.push(StubRef {
        patch_at: buf.placeholder(),
        kind: StubKind::Throw,
    });

    buf.op(Opcode::Return);
    buf.u32(result_slot(sig));

    out.code = buf.finish();
    out
}

pub(super) fn trap_stub(trap: Trap) -> CompiledCode {
    let mut buf = CodeBuffer::new();
    buf.op(Opcode::TrapExit);
    buf.u8(u8::from(trap));
    CompiledCode {
        code: buf.finish(),
        ..CompiledCode::default()
    }
}

pub(super) fn throw_stub() -> CompiledCode {
    let mut buf = CodeBuffer::new();
    buf.op(Opcode::Unwind);
    CompiledCode {
        code: buf.finish(),
        ..CompiledCode::default()
    }
}
