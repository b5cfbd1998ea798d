// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Translation of one function body into the SSA IR.
//!
//! Locals live in SSA values: `local.set` just rebinds the local, and control
//! flow joins turn locals that differ between predecessors into block
//! parameters. Translation is a single pass over the operators; once the
//! current block has ended in an unconditional transfer, only the structure of
//! the following dead code is tracked until a join point brings a live block
//! back (see [`FunctionBuilder`]).

mod control;

use smallvec::SmallVec;
use wasmparser::{BlockType, Operator};

use crate::config::InterruptMode;
use crate::decoder::Decoder;
use crate::env::{GlobalDesc, ModuleEnv};
use crate::indices::{FuncIndex, GlobalIndex, SigIndex, TableIndex};
use crate::ir::ops::{BinaryOp, ConvertOp, LaneShape, LoadKind, StoreKind, UnaryOp};
use crate::ir::{Function, FunctionBuilder, InstKind, Value};
use crate::trap::Trap;
use crate::types::ValType;
use crate::{Error, Result, wasm_unsupported};
use control::{ControlFrame, FrameKind};

/// Compiles the body of the defined function `func_index`, read from `decoder`.
///
/// # Errors
///
/// Fails if the body is malformed, uses an unsupported feature or exceeds the
/// configured limits. A body with bytes left after its final `end` is invalid.
pub fn compile_function<'a>(
    env: &ModuleEnv,
    func_index: FuncIndex,
    decoder: &mut impl Decoder<'a>,
) -> Result<Function> {
    let sig = env.func_sig(func_index).clone();
    let result = sig.result();
    let mut compiler = FuncCompiler {
        env,
        builder: FunctionBuilder::new(sig),
        locals: Vec::new(),
        local_types: Vec::new(),
        stack: Vec::new(),
        control: Vec::new(),
    };

    let body_offset = decoder.offset() as u32;
    compiler.builder.func_mut().srcloc = body_offset;
    compiler.builder.set_srcloc(body_offset);

    let decls = decoder.read_local_decls()?;
    compiler.declare_locals(&decls)?;
    compiler.interrupt_check();
    compiler
        .control
        .push(ControlFrame::new(FrameKind::Function, result, 0));

    while !compiler.control.is_empty() {
        let offset = decoder.offset();
        let op = decoder.read_op()?;
        compiler.builder.set_srcloc(offset as u32);
        compiler.translate_operator(&op)?;
    }

    if !decoder.done() {
        return Err(Error::InvalidWebAssembly {
            message: "operators remaining after end of function".into(),
            offset: decoder.offset(),
        });
    }

    let func = compiler.builder.finish();
    tracing::trace!("compiled function {}:\n{}", func_index.as_u32(), func.display());
    Ok(func)
}

pub(crate) struct FuncCompiler<'env> {
    env: &'env ModuleEnv,
    builder: FunctionBuilder,
    /// Current SSA value of every local, parameters first.
    locals: Vec<Value>,
    local_types: Vec<ValType>,
    stack: Vec<Value>,
    control: Vec<ControlFrame>,
}

impl FuncCompiler<'_> {
    fn declare_locals(&mut self, decls: &[(u32, ValType)]) -> Result<()> {
        let func = self.builder.func();
        self.locals = func.block_params(func.entry).to_vec();
        self.local_types = func.sig.params().to_vec();

        let total = decls
            .iter()
            .fold(self.locals.len() as u64, |total, (count, _)| total + u64::from(*count));
        let max = self.env.limits.max_locals;
        if total > u64::from(max) {
            return Err(Error::LimitExceeded {
                what: "locals",
                max: u64::from(max),
            });
        }

        // all locals of one type start out as the same zero constant
        let mut zeros: [Option<Value>; 5] = [None; 5];
        for &(count, ty) in decls {
            let zero = match zeros[usize::from(ty.to_u8())] {
                Some(zero) => zero,
                None => {
                    let zero = self.value(InstKind::Const(0), ty)?;
                    zeros[usize::from(ty.to_u8())] = Some(zero);
                    zero
                }
            };
            for _ in 0..count {
                self.locals.push(zero);
                self.local_types.push(ty);
            }
        }
        Ok(())
    }

    fn invalid(&self, message: impl Into<String>) -> Error {
        Error::InvalidWebAssembly {
            message: message.into(),
            offset: self.builder.srcloc() as usize,
        }
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack
            .pop()
            .ok_or_else(|| Error::internal("value stack underflow"))
    }

    fn peek(&self) -> Result<Value> {
        self.stack
            .last()
            .copied()
            .ok_or_else(|| Error::internal("value stack underflow"))
    }

    fn pop_n(&mut self, n: usize) -> Result<SmallVec<[Value; 4]>> {
        let at = self
            .stack
            .len()
            .checked_sub(n)
            .ok_or_else(|| Error::internal("value stack underflow"))?;
        Ok(self.stack.drain(at..).collect())
    }

    fn value(&mut self, kind: InstKind, ty: ValType) -> Result<Value> {
        self.builder
            .value(kind, ty)
            .ok_or_else(|| Error::internal("value built in dead code"))
    }

    fn push_value(&mut self, kind: InstKind, ty: ValType) -> Result<()> {
        let value = self.value(kind, ty)?;
        self.stack.push(value);
        Ok(())
    }

    /// Emits an instruction with an optional result, pushing the result.
    fn emit(&mut self, kind: InstKind, ty: Option<ValType>) -> Result<()> {
        match ty {
            Some(ty) => self.push_value(kind, ty),
            None => {
                self.builder.ins(kind);
                Ok(())
            }
        }
    }

    fn emit_return(&mut self) -> Result<()> {
        let value = match self.builder.func().sig.result() {
            Some(_) => Some(self.pop()?),
            None => None,
        };
        self.builder.terminate(InstKind::Return(value));
        Ok(())
    }

    fn interrupt_check(&mut self) {
        if self.env.interrupt_mode == InterruptMode::Polling {
            self.builder.ins(InstKind::InterruptCheck);
        }
    }

    fn block_result(&self, ty: BlockType) -> Result<Option<ValType>> {
        match ty {
            BlockType::Empty => Ok(None),
            BlockType::Type(ty) => Ok(Some(ValType::try_from(ty)?)),
            BlockType::FuncType(_) => Err(wasm_unsupported!("blocks with parameters or multiple results")),
        }
    }

    fn check_lane(&self, shape: LaneShape, lane: u8) -> Result<u8> {
        if lane < shape.lanes() {
            Ok(lane)
        } else {
            Err(self.invalid(format!("lane index {lane} out of range for {shape:?}")))
        }
    }

    fn memory_offset(&self, offset: u64) -> Result<u32> {
        if self.env.memory.is_none() {
            return Err(self.invalid("memory access without a memory"));
        }
        u32::try_from(offset).map_err(|_| wasm_unsupported!("memory offset {offset:#x}"))
    }

    /// Only tracks nesting while the current position is unreachable.
    fn translate_unreachable_operator(&mut self, op: &Operator<'_>) -> Result<()> {
        let base = self.stack.len();
        match op {
            Operator::Block { .. } => {
                self.control
                    .push(ControlFrame::unreachable(FrameKind::Block, base));
            }
            Operator::Loop { .. } => {
                self.control
                    .push(ControlFrame::unreachable(FrameKind::Loop(None), base));
            }
            Operator::If { .. } => {
                self.control.push(ControlFrame::unreachable(
                    FrameKind::If {
                        else_edge: None,
                        entry_locals: Vec::new(),
                    },
                    base,
                ));
            }
            Operator::Else => self.translate_else()?,
            Operator::End => self.translate_end()?,
            _ => {}
        }
        Ok(())
    }

    #[expect(clippy::too_many_lines, reason = "big match statement")]
    fn translate_operator(&mut self, op: &Operator<'_>) -> Result<()> {
        if self.builder.is_unreachable() {
            return self.translate_unreachable_operator(op);
        }

        if let Some(op) = UnaryOp::from_wasm(op) {
            let a = self.pop()?;
            return self.push_value(InstKind::Unary(op, a), op.result_ty());
        }
        if let Some(op) = BinaryOp::from_wasm(op) {
            let b = self.pop()?;
            let a = self.pop()?;
            return self.push_value(InstKind::Binary(op, a, b), op.result_ty());
        }
        if let Some(op) = ConvertOp::from_wasm(op) {
            let a = self.pop()?;
            return self.push_value(InstKind::Convert(op, a), op.result_ty());
        }
        if let Some((kind, offset)) = LoadKind::from_wasm(op) {
            let offset = self.memory_offset(offset)?;
            let addr = self.pop()?;
            return self.push_value(InstKind::Load { kind, addr, offset }, kind.result_ty());
        }
        if let Some((kind, offset)) = StoreKind::from_wasm(op) {
            let offset = self.memory_offset(offset)?;
            let value = self.pop()?;
            let addr = self.pop()?;
            self.builder.ins(InstKind::Store {
                kind,
                addr,
                value,
                offset,
            });
            return Ok(());
        }

        match *op {
            Operator::Unreachable => {
                self.builder
                    .terminate(InstKind::Trap(Trap::UnreachableCodeReached));
            }
            Operator::Nop => {}

            Operator::Block { blockty } => {
                let result = self.block_result(blockty)?;
                self.control.push(ControlFrame::new(
                    FrameKind::Block,
                    result,
                    self.stack.len(),
                ));
            }
            Operator::Loop { blockty } => {
                let result = self.block_result(blockty)?;
                self.enter_loop(result)?;
            }
            Operator::If { blockty } => {
                let result = self.block_result(blockty)?;
                self.enter_if(result)?;
            }
            Operator::Else => self.translate_else()?,
            Operator::End => self.translate_end()?,
            Operator::Br { relative_depth } => self.branch(relative_depth)?,
            Operator::BrIf { relative_depth } => self.branch_if(relative_depth)?,
            Operator::BrTable { ref targets } => {
                let depths = targets.targets().collect::<Result<Vec<_>, _>>()?;
                self.branch_table(&depths, targets.default())?;
            }
            Operator::Return => self.emit_return()?,

            Operator::Call { function_index } => self.translate_call(FuncIndex::from_u32(function_index))?,
            Operator::CallIndirect {
                type_index,
                table_index,
            } => self.translate_call_indirect(
                SigIndex::from_u32(type_index),
                TableIndex::from_u32(table_index),
            )?,

            Operator::Drop => {
                self.pop()?;
            }
            Operator::Select | Operator::TypedSelect { .. } => {
                let cond = self.pop()?;
                let if_false = self.pop()?;
                let if_true = self.pop()?;
                let ty = self.builder.func().value_type(if_true);
                self.push_value(
                    InstKind::Select {
                        cond,
                        if_true,
                        if_false,
                    },
                    ty,
                )?;
            }

            Operator::LocalGet { local_index } => {
                let value = *self
                    .locals
                    .get(local_index as usize)
                    .ok_or_else(|| self.invalid(format!("unknown local {local_index}")))?;
                self.stack.push(value);
            }
            Operator::LocalSet { local_index } => {
                let value = self.pop()?;
                self.set_local(local_index, value)?;
            }
            Operator::LocalTee { local_index } => {
                let value = self.peek()?;
                self.set_local(local_index, value)?;
            }
            Operator::GlobalGet { global_index } => {
                let global = self.global(global_index)?;
                let (ty, global_data_offset) = (global.ty.content, global.global_data_offset);
                self.push_value(
                    InstKind::GlobalGet {
                        ty,
                        global_data_offset,
                    },
                    ty,
                )?;
            }
            Operator::GlobalSet { global_index } => {
                let global = self.global(global_index)?;
                let (ty, global_data_offset) = (global.ty.content, global.global_data_offset);
                let value = self.pop()?;
                self.builder.ins(InstKind::GlobalSet {
                    ty,
                    global_data_offset,
                    value,
                });
            }

            Operator::MemorySize { mem } => {
                self.check_memory(mem)?;
                self.push_value(InstKind::MemorySize, ValType::I32)?;
            }
            Operator::MemoryGrow { mem } => {
                self.check_memory(mem)?;
                let delta = self.pop()?;
                self.push_value(InstKind::MemoryGrow(delta), ValType::I32)?;
            }

            Operator::I32Const { value } => {
                self.push_value(InstKind::Const(u128::from(value as u32)), ValType::I32)?;
            }
            Operator::I64Const { value } => {
                self.push_value(InstKind::Const(u128::from(value as u64)), ValType::I64)?;
            }
            Operator::F32Const { value } => {
                self.push_value(InstKind::Const(u128::from(value.bits())), ValType::F32)?;
            }
            Operator::F64Const { value } => {
                self.push_value(InstKind::Const(u128::from(value.bits())), ValType::F64)?;
            }
            Operator::V128Const { value } => {
                self.push_value(
                    InstKind::Const(u128::from_le_bytes(*value.bytes())),
                    ValType::V128,
                )?;
            }

            Operator::I8x16Splat => self.splat(LaneShape::I8x16)?,
            Operator::I16x8Splat => self.splat(LaneShape::I16x8)?,
            Operator::I32x4Splat => self.splat(LaneShape::I32x4)?,
            Operator::I64x2Splat => self.splat(LaneShape::I64x2)?,
            Operator::F32x4Splat => self.splat(LaneShape::F32x4)?,
            Operator::F64x2Splat => self.splat(LaneShape::F64x2)?,

            Operator::I8x16ExtractLaneS { lane } => self.extract_lane(LaneShape::I8x16, true, lane)?,
            Operator::I8x16ExtractLaneU { lane } => self.extract_lane(LaneShape::I8x16, false, lane)?,
            Operator::I16x8ExtractLaneS { lane } => self.extract_lane(LaneShape::I16x8, true, lane)?,
            Operator::I16x8ExtractLaneU { lane } => self.extract_lane(LaneShape::I16x8, false, lane)?,
            Operator::I32x4ExtractLane { lane } => self.extract_lane(LaneShape::I32x4, false, lane)?,
            Operator::I64x2ExtractLane { lane } => self.extract_lane(LaneShape::I64x2, false, lane)?,
            Operator::F32x4ExtractLane { lane } => self.extract_lane(LaneShape::F32x4, false, lane)?,
            Operator::F64x2ExtractLane { lane } => self.extract_lane(LaneShape::F64x2, false, lane)?,

            Operator::I8x16ReplaceLane { lane } => self.replace_lane(LaneShape::I8x16, lane)?,
            Operator::I16x8ReplaceLane { lane } => self.replace_lane(LaneShape::I16x8, lane)?,
            Operator::I32x4ReplaceLane { lane } => self.replace_lane(LaneShape::I32x4, lane)?,
            Operator::I64x2ReplaceLane { lane } => self.replace_lane(LaneShape::I64x2, lane)?,
            Operator::F32x4ReplaceLane { lane } => self.replace_lane(LaneShape::F32x4, lane)?,
            Operator::F64x2ReplaceLane { lane } => self.replace_lane(LaneShape::F64x2, lane)?,

            Operator::I8x16Shuffle { lanes } => {
                if let Some(lane) = lanes.iter().find(|lane| **lane >= 32) {
                    return Err(self.invalid(format!("shuffle lane index {lane} out of range")));
                }
                let b = self.pop()?;
                let a = self.pop()?;
                self.push_value(InstKind::Shuffle { a, b, lanes }, ValType::V128)?;
            }

            ref op => return Err(wasm_unsupported!("operator {op:?}")),
        }

        Ok(())
    }

    fn set_local(&mut self, local_index: u32, value: Value) -> Result<()> {
        let slot = self
            .locals
            .get_mut(local_index as usize)
            .ok_or_else(|| Error::internal(format!("unknown local {local_index}")))?;
        *slot = value;
        Ok(())
    }

    fn global(&self, index: u32) -> Result<&GlobalDesc> {
        self.env
            .globals
            .get(GlobalIndex::from_u32(index))
            .ok_or_else(|| self.invalid(format!("unknown global {index}")))
    }

    fn check_memory(&self, mem: u32) -> Result<()> {
        if mem != 0 {
            return Err(wasm_unsupported!("multiple memories"));
        }
        if self.env.memory.is_none() {
            return Err(self.invalid("memory instruction without a memory"));
        }
        Ok(())
    }

    fn splat(&mut self, shape: LaneShape) -> Result<()> {
        let a = self.pop()?;
        self.push_value(InstKind::Splat(shape, a), ValType::V128)
    }

    fn extract_lane(&mut self, shape: LaneShape, signed: bool, lane: u8) -> Result<()> {
        let lane = self.check_lane(shape, lane)?;
        let vector = self.pop()?;
        self.push_value(
            InstKind::ExtractLane {
                shape,
                signed,
                lane,
                vector,
            },
            shape.scalar_ty(),
        )
    }

    fn replace_lane(&mut self, shape: LaneShape, lane: u8) -> Result<()> {
        let lane = self.check_lane(shape, lane)?;
        let value = self.pop()?;
        let vector = self.pop()?;
        self.push_value(
            InstKind::ReplaceLane {
                shape,
                lane,
                vector,
                value,
            },
            ValType::V128,
        )
    }

    fn translate_call(&mut self, callee: FuncIndex) -> Result<()> {
        let sig_index = *self
            .env
            .funcs
            .get(callee)
            .ok_or_else(|| self.invalid(format!("unknown function {}", callee.as_u32())))?;
        let sig = &self.env.sigs[sig_index];
        let (nparams, result) = (sig.params().len(), sig.result());
        let args = self.pop_n(nparams)?;

        let kind = match self.env.import_index(callee) {
            Some(import) => InstKind::CallImport {
                import,
                global_data_offset: self.env.func_imports[import].global_data_offset,
                args,
            },
            None => InstKind::Call { callee, args },
        };
        self.emit(kind, result)
    }

    fn translate_call_indirect(&mut self, sig: SigIndex, table: TableIndex) -> Result<()> {
        let ty = self
            .env
            .sigs
            .get(sig)
            .ok_or_else(|| self.invalid(format!("unknown type {}", sig.as_u32())))?;
        let (nparams, result) = (ty.params().len(), ty.result());
        let table = self
            .env
            .tables
            .get(table)
            .ok_or_else(|| self.invalid(format!("unknown table {}", table.as_u32())))?;
        let (always_traps, table_data_offset) = (
            table.import.is_none() && table.ty.initial == 0,
            table.global_data_offset,
        );

        let index = self.pop()?;
        let args = self.pop_n(nparams)?;

        if always_traps {
            // tables cannot grow, so every index is out of bounds
            self.builder
                .terminate(InstKind::Trap(Trap::TableOutOfBounds));
            return Ok(());
        }

        self.emit(
            InstKind::CallIndirect {
                sig,
                table_data_offset,
                sig_data_offset: self.env.sig_data_offsets[sig],
                index,
                args,
            },
            result,
        )
    }
}
