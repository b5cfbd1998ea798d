// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use cranelift_entity::SecondaryMap;

use crate::codegen::isa::{CodeBuffer, NONE, Opcode};
use crate::indices::FuncIndex;
use crate::codegen::{CallSite, CompiledCode, StubKind, StubRef, SymbolicRef};
use crate::ir::{Block, BlockCall, Function, Inst, InstKind, Value};
use crate::link::{SymbolicAddress, TrapSite};
use crate::trap::Trap;
use crate::{Error, Result};

/// Lowers `func`, the body of `func_index`, into the portable encoding.
///
/// Every SSA value gets its own frame slot, numbered like the value itself.
/// Block parameters are assigned by the moves attached to each branch edge.
/// The code starts with the profiling entry, which falls through into the
/// regular entry.
pub(super) fn lower_function(func_index: FuncIndex, func: &Function) -> Result<CompiledCode> {
    let frame_size = u32::try_from(func.values.len())
        .map_err(|_| Error::CodeTooLarge("function frame".into()))?;

    let mut lower = Lower {
        func,
        buf: CodeBuffer::new(),
        out: CompiledCode::default(),
        block_offsets: SecondaryMap::new(),
        fixups: Vec::new(),
    };

    lower.buf.op(Opcode::ProfilingEnter);
    lower.buf.u32(func_index.as_u32());
    lower.out.entry = lower.buf.offset();

    lower.trap_site(lower.out.entry, func.srcloc);
    lower.buf.op(Opcode::Prologue);
    lower.buf.u32(frame_size);
    lower.stub_ref(StubKind::StackOverflow);

    for (block, data) in &func.blocks {
        lower.block_offsets[block] = lower.buf.offset();
        for &inst in &data.insts {
            lower.lower_inst(inst)?;
        }
        // blocks that were created but never filled are unreachable
        if func.terminator(block).is_none() {
            let at = lower.buf.offset();
            lower.trap_site(at, func.srcloc);
            lower.buf.op(Opcode::Trap);
            lower.buf.u8(u8::from(Trap::UnreachableCodeReached));
        }
    }

    for fixup in core::mem::take(&mut lower.fixups) {
        let target = i64::from(lower.block_offsets[fixup.block]);
        let rel = i32::try_from(target - i64::from(fixup.base))
            .map_err(|_| Error::CodeTooLarge("branch displacement".into()))?;
        lower.buf.patch_i32(fixup.patch_at, rel);
    }

    let mut out = lower.out;
    out.code = lower.buf.finish();
    Ok(out)
}

struct Lower<'a> {
    func: &'a Function,
    buf: CodeBuffer,
    out: CompiledCode,
    block_offsets: SecondaryMap<Block, u32>,
    fixups: Vec<Fixup>,
}

struct Fixup {
    patch_at: u32,
    /// Start of the branch instruction.
    base: u32,
    block: Block,
}

impl Lower<'_> {
    fn slot(&self, value: Value) -> u32 {
        self.func.resolve(value).as_u32()
    }

    fn dst(&self, inst: Inst) -> u32 {
        self.func.insts[inst]
            .result
            .map_or(NONE, |value| self.slot(value))
    }

    fn trap_site(&mut self, code_offset: u32, bytecode_offset: u32) {
        self.out.trap_sites.push(TrapSite {
            code_offset,
            bytecode_offset,
        });
    }

    fn stub_ref(&mut self, kind: StubKind) {
        let patch_at = self.buf.placeholder();
        self.out.stub_refs.push(StubRef { patch_at, kind });
    }

    fn symbolic_ref(&mut self, symbol: SymbolicAddress) {
        let patch_at = self.buf.placeholder();
        self.out.symbolic_refs.push(SymbolicRef { patch_at, symbol });
    }

    fn args(&mut self, args: &[Value]) {
        self.buf.u32(args.len() as u32);
        for &arg in args {
            self.buf.u32(self.slot(arg));
        }
    }

    /// Emits a displacement to `dest` followed by the moves into its parameters.
    fn edge(&mut self, base: u32, dest: &BlockCall) -> Result<()> {
        if dest.is_placeholder() {
            return Err(Error::internal("branch to an unbound destination"));
        }
        let patch_at = self.buf.placeholder();
        self.fixups.push(Fixup {
            patch_at,
            base,
            block: dest.block,
        });

        let params = self.func.block_params(dest.block);
        if params.len() != dest.args.len() {
            return Err(Error::internal(format!(
                "{} expects {} arguments, got {}",
                dest.block,
                params.len(),
                dest.args.len()
            )));
        }
        let moves: Vec<(u32, u32)> = params
            .iter()
            .zip(&dest.args)
            .map(|(&param, &arg)| (self.slot(param), self.slot(arg)))
            .filter(|(dst, src)| dst != src)
            .collect();
        self.buf.u32(moves.len() as u32);
        for (dst, src) in moves {
            self.buf.u32(dst);
            self.buf.u32(src);
        }
        Ok(())
    }

    #[expect(clippy::too_many_lines, reason = "big match statement")]
    fn lower_inst(&mut self, inst: Inst) -> Result<()> {
        let data = &self.func.insts[inst];
        let start = self.buf.offset();
        let dst = self.dst(inst);

        match &data.kind {
            InstKind::Const(bits) => {
                self.buf.op(Opcode::Const);
                self.buf.u32(dst);
                self.buf.u128(*bits);
            }
            InstKind::Unary(op, a) => {
                self.buf.op(Opcode::Unary);
                self.buf.u8(op.to_u8());
                self.buf.u32(dst);
                self.buf.u32(self.slot(*a));
            }
            InstKind::Binary(op, a, b) => {
                if op.can_trap() {
                    self.trap_site(start, data.srcloc);
                }
                self.buf.op(Opcode::Binary);
                self.buf.u8(op.to_u8());
                self.buf.u32(dst);
                self.buf.u32(self.slot(*a));
                self.buf.u32(self.slot(*b));
            }
            InstKind::Convert(op, a) => {
                if op.can_trap() {
                    self.trap_site(start, data.srcloc);
                }
                self.buf.op(Opcode::Convert);
                self.buf.u8(op.to_u8());
                self.buf.u32(dst);
                self.buf.u32(self.slot(*a));
            }
            InstKind::Select {
                cond,
                if_true,
                if_false,
            } => {
                self.buf.op(Opcode::Select);
                self.buf.u32(dst);
                self.buf.u32(self.slot(*cond));
                self.buf.u32(self.slot(*if_true));
                self.buf.u32(self.slot(*if_false));
            }
            InstKind::Load { kind, addr, offset } => {
                self.trap_site(start, data.srcloc);
                self.buf.op(Opcode::Load);
                self.buf.u8(kind.to_u8());
                self.buf.u32(dst);
                self.buf.u32(self.slot(*addr));
                self.buf.u32(*offset);
                self.stub_ref(StubKind::OutOfBounds);
            }
            InstKind::Store {
                kind,
                addr,
                value,
                offset,
            } => {
                self.trap_site(start, data.srcloc);
                self.buf.op(Opcode::Store);
                self.buf.u8(kind.to_u8());
                self.buf.u32(self.slot(*addr));
                self.buf.u32(self.slot(*value));
                self.buf.u32(*offset);
                self.stub_ref(StubKind::OutOfBounds);
            }
            InstKind::GlobalGet {
                ty,
                global_data_offset,
            } => {
                self.buf.op(Opcode::GlobalGet);
                self.buf.u8(ty.to_u8());
                self.buf.u32(dst);
                self.buf.u32(*global_data_offset);
            }
            InstKind::GlobalSet {
                ty,
                global_data_offset,
                value,
            } => {
                self.buf.op(Opcode::GlobalSet);
                self.buf.u8(ty.to_u8());
                self.buf.u32(*global_data_offset);
                self.buf.u32(self.slot(*value));
            }
            InstKind::MemorySize => {
                self.buf.op(Opcode::MemorySize);
                self.symbolic_ref(SymbolicAddress::CurrentMemory);
                self.buf.u32(dst);
            }
            InstKind::MemoryGrow(delta) => {
                self.buf.op(Opcode::MemoryGrow);
                self.symbolic_ref(SymbolicAddress::GrowMemory);
                self.buf.u32(dst);
                self.buf.u32(self.slot(*delta));
            }
            InstKind::Splat(shape, a) => {
                self.buf.op(Opcode::Splat);
                self.buf.u8(shape.to_u8());
                self.buf.u32(dst);
                self.buf.u32(self.slot(*a));
            }
            InstKind::ExtractLane {
                shape,
                signed,
                lane,
                vector,
            } => {
                self.buf.op(Opcode::ExtractLane);
                self.buf.u8(shape.to_u8());
                self.buf.u8(u8::from(*signed));
                self.buf.u8(*lane);
                self.buf.u32(dst);
                self.buf.u32(self.slot(*vector));
            }
            InstKind::ReplaceLane {
                shape,
                lane,
                vector,
                value,
            } => {
                self.buf.op(Opcode::ReplaceLane);
                self.buf.u8(shape.to_u8());
                self.buf.u8(*lane);
                self.buf.u32(dst);
                self.buf.u32(self.slot(*vector));
                self.buf.u32(self.slot(*value));
            }
            InstKind::Shuffle { a, b, lanes } => {
                self.buf.op(Opcode::Shuffle);
                self.buf.u32(dst);
                self.buf.u32(self.slot(*a));
                self.buf.u32(self.slot(*b));
                self.buf.bytes(lanes);
            }
            InstKind::Call { callee, args } => {
                self.buf.op(Opcode::Call);
                let patch_at = self.buf.placeholder();
                self.args(args);
                self.buf.u32(dst);
                self.out.call_sites.push(CallSite {
                    offset: start,
                    patch_at,
                    return_offset: self.buf.offset(),
                    bytecode_offset: data.srcloc,
                    callee: *callee,
                });
            }
            InstKind::CallImport {
                global_data_offset,
                args,
                ..
            } => {
                self.buf.op(Opcode::CallImport);
                self.buf.u32(*global_data_offset);
                self.args(args);
                self.buf.u32(dst);
            }
            InstKind::CallIndirect {
                sig,
                table_data_offset,
                sig_data_offset,
                index,
                args,
            } => {
                self.trap_site(start, data.srcloc);
                if !self.out.indirect_sigs.contains(sig) {
                    self.out.indirect_sigs.push(*sig);
                }
                self.buf.op(Opcode::CallIndirect);
                self.buf.u32(*table_data_offset);
                self.buf.u32(*sig_data_offset);
                self.buf.u32(self.slot(*index));
                self.args(args);
                self.buf.u32(dst);
            }
            InstKind::InterruptCheck => {
                self.trap_site(start, data.srcloc);
                self.buf.op(Opcode::CheckInterrupt);
                self.symbolic_ref(SymbolicAddress::HandleInterrupt);
                self.stub_ref(StubKind::Interrupt);
            }
            InstKind::Jump(dest) => {
                self.buf.op(Opcode::Jump);
                self.edge(start, dest)?;
            }
            InstKind::Branch {
                cond,
                then_dest,
                else_dest,
            } => {
                self.buf.op(Opcode::BrIf);
                self.buf.u32(self.slot(*cond));
                self.edge(start, then_dest)?;
                self.edge(start, else_dest)?;
            }
            InstKind::BrTable { index, targets } => {
                let (default, targets) = targets
                    .split_last()
                    .ok_or_else(|| Error::internal("br_table without default"))?;
                self.buf.op(Opcode::BrTable);
                self.buf.u32(self.slot(*index));
                self.buf.u32(targets.len() as u32);
                for target in targets {
                    self.edge(start, target)?;
                }
                self.edge(start, default)?;
            }
            InstKind::Return(value) => {
                self.buf.op(Opcode::Return);
                self.buf.u32(value.map_or(NONE, |value| self.slot(value)));
            }
            InstKind::Trap(trap) => {
                self.trap_site(start, data.srcloc);
                self.buf.op(Opcode::Trap);
                self.buf.u8(u8::from(*trap));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use smallvec::SmallVec;

    use super::*;
    use crate::codegen::isa::CodeReader;
    use crate::ir::FunctionBuilder;
    use crate::ir::ops::BinaryOp;
    use crate::types::{Sig, ValType};

    #[test]
    fn prologue_and_return() {
        let mut builder = FunctionBuilder::new(Sig::new([ValType::I32], Some(ValType::I32)));
        let param = builder.func().block_params(builder.func().entry)[0];
        let one = builder.value(InstKind::Const(1), ValType::I32).unwrap();
        let sum = builder
            .value(InstKind::Binary(BinaryOp::I32Add, param, one), ValType::I32)
            .unwrap();
        builder.terminate(InstKind::Return(Some(sum)));

        let compiled = lower_function(FuncIndex::from_u32(4), &builder.finish()).unwrap();
        let mut reader = CodeReader::new(&compiled.code, 0);
        assert_eq!(reader.opcode().unwrap(), Opcode::ProfilingEnter);
        assert_eq!(reader.u32().unwrap(), 4);
        assert_eq!(reader.pos(), compiled.entry as usize);
        assert_eq!(reader.opcode().unwrap(), Opcode::Prologue);
        assert_eq!(reader.u32().unwrap(), 3);
        assert_eq!(compiled.stub_refs.len(), 1);
        assert_eq!(compiled.stub_refs[0].kind, StubKind::StackOverflow);
        // only the prologue can trap here
        assert_eq!(compiled.trap_sites.len(), 1);
    }

    #[test]
    fn calls_are_recorded_for_patching() {
        let mut builder = FunctionBuilder::new(Sig::new([], None));
        builder.ins(InstKind::Call {
            callee: FuncIndex::from_u32(2),
            args: SmallVec::new(),
        });
        builder.terminate(InstKind::Return(None));

        let compiled = lower_function(FuncIndex::from_u32(0), &builder.finish()).unwrap();
        let [site] = compiled.call_sites.as_slice() else {
            panic!("expected one call site");
        };
        assert_eq!(site.callee, FuncIndex::from_u32(2));
        assert_eq!(site.patch_at, site.offset + 1);
        assert_eq!(compiled.code[site.offset as usize], Opcode::Call.to_u8());
    }

    #[test]
    fn unbound_branches_are_rejected() {
        let mut builder = FunctionBuilder::new(Sig::new([], None));
        builder.terminate(InstKind::Jump(BlockCall::placeholder()));
        assert!(matches!(
            lower_function(FuncIndex::from_u32(0), &builder.finish()),
            Err(Error::Internal(_))
        ));
    }
}
