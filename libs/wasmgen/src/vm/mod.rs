// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Executor for code emitted by the portable backend.
//!
//! Calls between wasm functions never recurse on the native stack: every
//! activation is a [`Frame`] over a window of one shared slot stack, so the
//! configured maximum call depth is the only limit on wasm recursion.

mod eval;

use core::mem;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::codegen::isa::{CodeReader, NONE, Opcode};
use crate::config::InterruptMode;
use crate::indices::{FuncIndex, ImportIndex};
use crate::instance::InstanceInner;
use crate::ir::ops::{BinaryOp, ConvertOp, LaneShape, LoadKind, StoreKind, UnaryOp};
use crate::link::{CodeRangeKind, SymbolicAddress};
use crate::trap::Trap;
use crate::types::ValType;
use crate::values::RawVal;
use crate::{Error, Result};

type Moves = SmallVec<[(u32, u32); 8]>;
type Args = SmallVec<[u32; 8]>;

struct Frame {
    /// Index of the frame's slot 0 in the slot stack.
    base: usize,
    return_pc: usize,
    /// Caller slot receiving the result.
    dst: u32,
    /// The caller's instance, if the call entered a different instance.
    caller: Option<Arc<InstanceInner>>,
}

enum Flow {
    Next(usize),
    Done(Option<RawVal>),
}

struct Vm {
    ctx: Arc<InstanceInner>,
    code: Arc<[u8]>,
    slots: Vec<RawVal>,
    frames: Vec<Frame>,
    /// Base of the innermost frame.
    base: usize,
    max_call_depth: usize,
    signal_interrupts: bool,
    /// Instruction that branched to a trap stub.
    fault_pc: usize,
    /// Host error being propagated through the throw stub.
    pending: Option<Error>,
}

/// Runs the code at `entry` in `instance`.
///
/// `args` is the argument array of an entry stub and receives the result in
/// its first slot, so it must hold at least one slot.
pub(crate) fn invoke(instance: &Arc<InstanceInner>, entry: u32, args: &mut [RawVal]) -> Result<()> {
    let config = instance.module.engine().config();
    let mut slots = Vec::new();
    slots.try_reserve(args.len())?;
    slots.extend_from_slice(args);

    let mut vm = Vm {
        ctx: instance.clone(),
        code: instance.code.clone(),
        slots,
        frames: vec![Frame {
            base: 0,
            return_pc: 0,
            dst: NONE,
            caller: None,
        }],
        base: 0,
        max_call_depth: config.max_call_depth,
        signal_interrupts: config.interrupt_mode == InterruptMode::Signal,
        fault_pc: 0,
        pending: None,
    };

    let result = vm.run(entry as usize)?;
    if let (Some(value), Some(slot)) = (result, args.first_mut()) {
        *slot = value;
    }
    Ok(())
}

fn read_moves(reader: &mut CodeReader<'_>) -> Result<Moves> {
    let count = reader.u32()?;
    (0..count)
        .map(|_| Ok((reader.u32()?, reader.u32()?)))
        .collect()
}

fn read_args(reader: &mut CodeReader<'_>) -> Result<Args> {
    let count = reader.u32()?;
    (0..count).map(|_| reader.u32()).collect()
}

fn relative(pc: usize, rel: i32) -> Result<usize> {
    pc.checked_add_signed(rel as isize)
        .ok_or_else(|| Error::internal(format!("branch at {pc:#x} leaves the code")))
}

fn decode<T>(value: Option<T>, what: &str, pc: usize) -> Result<T> {
    value.ok_or_else(|| Error::internal(format!("invalid {what} operand at {pc:#x}")))
}

impl Vm {
    fn run(&mut self, mut pc: usize) -> Result<Option<RawVal>> {
        loop {
            match self.step(pc)? {
                Flow::Next(next) => pc = next,
                Flow::Done(value) => return Ok(value),
            }
        }
    }

    fn get(&self, slot: u32) -> Result<RawVal> {
        self.slots
            .get(self.base + slot as usize)
            .copied()
            .ok_or_else(|| Error::internal(format!("read of slot {slot} outside the frame")))
    }

    fn set(&mut self, slot: u32, value: RawVal) -> Result<()> {
        if slot == NONE {
            return Ok(());
        }
        let dst = self
            .slots
            .get_mut(self.base + slot as usize)
            .ok_or_else(|| Error::internal(format!("write of slot {slot} outside the frame")))?;
        *dst = value;
        Ok(())
    }

    /// Performs the moves of a control-flow edge as one parallel copy.
    fn apply_moves(&mut self, moves: &Moves) -> Result<()> {
        let values = moves
            .iter()
            .map(|&(_, src)| self.get(src))
            .collect::<Result<SmallVec<[RawVal; 8]>>>()?;
        for (&(dst, _), value) in moves.iter().zip(values) {
            self.set(dst, value)?;
        }
        Ok(())
    }

    fn trap(&self, trap: Trap, pc: usize) -> Error {
        let info = self.ctx.module.trap_info(trap, pc as u32);
        tracing::debug!("wasm trap: {info}");
        Error::Trap(info)
    }

    /// In signal mode, consumes a pending interrupt request at a call or
    /// backward branch and returns the interrupt stub to continue at.
    fn poll_signal(&mut self, pc: usize) -> Option<usize> {
        if self.signal_interrupts && self.ctx.interrupt.take() {
            self.fault_pc = pc;
            Some(self.ctx.module.metadata().stubs.interrupt as usize)
        } else {
            None
        }
    }

    /// Maps the target of a direct call to the callee's profiling entry.
    ///
    /// Code is shared between instances and never patched, so profiling
    /// instances redirect direct calls here, following a thunk if the call
    /// lands on one.
    fn profiling_entry(&self, target: usize) -> Result<usize> {
        let mut r = CodeReader::new(&self.code, target);
        let target = if r.opcode()? == Opcode::JumpFar {
            r.abs()?
        } else {
            target
        };
        let range = self.ctx.module.lookup_code_range(target as u32);
        Ok(match range.map(|range| (range.begin, range.kind)) {
            Some((begin, CodeRangeKind::Function { entry, .. })) if entry as usize == target => {
                begin as usize
            }
            _ => target,
        })
    }

    /// Takes a control-flow edge from the instruction at `pc`.
    fn branch(&mut self, pc: usize, rel: i32, moves: &Moves) -> Result<Flow> {
        let target = relative(pc, rel)?;
        if target <= pc {
            if let Some(stub) = self.poll_signal(pc) {
                return Ok(Flow::Next(stub));
            }
        }
        self.apply_moves(moves)?;
        Ok(Flow::Next(target))
    }

    /// Pushes a frame for a call whose arguments are `args` of the current frame.
    fn push_frame(
        &mut self,
        args: &Args,
        dst: u32,
        return_pc: usize,
        callee: Option<Arc<InstanceInner>>,
    ) -> Result<()> {
        let base = self.slots.len();
        self.slots.try_reserve(args.len())?;
        for &arg in args {
            let value = self.get(arg)?;
            self.slots.push(value);
        }

        let caller = callee.map(|callee| {
            self.code = callee.code.clone();
            mem::replace(&mut self.ctx, callee)
        });
        self.frames.push(Frame {
            base,
            return_pc,
            dst,
            caller,
        });
        self.base = base;
        Ok(())
    }

    fn pop_frame(&mut self, value: Option<RawVal>) -> Result<Flow> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| Error::internal("return without a frame"))?;
        let Some(caller_base) = self.frames.last().map(|caller| caller.base) else {
            return Ok(Flow::Done(value));
        };

        self.slots.truncate(frame.base);
        self.base = caller_base;
        if let Some(caller) = frame.caller {
            self.code = caller.code.clone();
            self.ctx = caller;
        }
        if frame.dst != NONE {
            let value = value.ok_or_else(|| Error::internal("missing return value"))?;
            self.set(frame.dst, value)?;
        }
        Ok(Flow::Next(frame.return_pc))
    }

    /// Calls an import through its exit stub, routing failures to the throw stub.
    fn exit(
        &mut self,
        optimized: bool,
        import: u32,
        nargs: u32,
        throw: usize,
        next: usize,
    ) -> Result<Flow> {
        let start = self.base;
        let end = start + nargs as usize;
        let args = self
            .slots
            .get(start..end)
            .ok_or_else(|| Error::internal("import arguments outside the frame"))?;
        let args = SmallVec::<[RawVal; 8]>::from_slice(args);

        let import = ImportIndex::from_u32(import);
        let result = if optimized {
            self.ctx.call_import_jit(import, &args)
        } else {
            self.ctx.call_import_interp(import, &args)
        };
        match result {
            Ok(value) => {
                self.set(0, value)?;
                Ok(Flow::Next(next))
            }
            Err(err) => {
                self.pending = Some(err);
                Ok(Flow::Next(throw))
            }
        }
    }

    #[expect(clippy::too_many_lines, reason = "big match statement")]
    fn step(&mut self, pc: usize) -> Result<Flow> {
        let mut r = CodeReader::new(&self.code, pc);
        let op = r.opcode()?;
        let flow = match op {
            Opcode::Prologue => {
                let frame_size = r.u32()? as usize;
                let overflow = r.abs()?;
                let next = r.pos();
                if self.frames.len() > self.max_call_depth {
                    self.fault_pc = pc;
                    return Ok(Flow::Next(overflow));
                }
                let end = self.base + frame_size;
                if self.slots.len() < end {
                    self.slots.try_reserve(end - self.slots.len())?;
                    self.slots.resize(end, RawVal::ZERO);
                }
                Flow::Next(next)
            }
            Opcode::CheckInterrupt => {
                let _symbol = r.abs()?;
                let stub = r.abs()?;
                let next = r.pos();
                if self.ctx.interrupt.take() {
                    self.fault_pc = pc;
                    Flow::Next(stub)
                } else {
                    Flow::Next(next)
                }
            }
            Opcode::Const => {
                let dst = r.u32()?;
                let bits = r.u128()?;
                let next = r.pos();
                self.set(dst, RawVal::from_bits(bits))?;
                Flow::Next(next)
            }
            Opcode::Unary => {
                let op = decode(UnaryOp::from_u8(r.u8()?), "unary op", pc)?;
                let (dst, a) = (r.u32()?, r.u32()?);
                let next = r.pos();
                self.set(dst, eval::unary(op, self.get(a)?))?;
                Flow::Next(next)
            }
            Opcode::Binary => {
                let op = decode(BinaryOp::from_u8(r.u8()?), "binary op", pc)?;
                let (dst, a, b) = (r.u32()?, r.u32()?, r.u32()?);
                let next = r.pos();
                let value = eval::binary(op, self.get(a)?, self.get(b)?)
                    .map_err(|trap| self.trap(trap, pc))?;
                self.set(dst, value)?;
                Flow::Next(next)
            }
            Opcode::Convert => {
                let op = decode(ConvertOp::from_u8(r.u8()?), "conversion", pc)?;
                let (dst, a) = (r.u32()?, r.u32()?);
                let next = r.pos();
                let value = eval::convert(op, self.get(a)?).map_err(|trap| self.trap(trap, pc))?;
                self.set(dst, value)?;
                Flow::Next(next)
            }
            Opcode::Select => {
                let (dst, cond, if_true, if_false) = (r.u32()?, r.u32()?, r.u32()?, r.u32()?);
                let next = r.pos();
                let value = eval::select(self.get(cond)?, self.get(if_true)?, self.get(if_false)?);
                self.set(dst, value)?;
                Flow::Next(next)
            }
            Opcode::Load => {
                let kind = decode(LoadKind::from_u8(r.u8()?), "load kind", pc)?;
                let (dst, addr, offset) = (r.u32()?, r.u32()?, r.u32()?);
                let oob = r.abs()?;
                let next = r.pos();
                let ea = u64::from(self.get(addr)?.get_i32() as u32) + u64::from(offset);
                let memory = self.ctx.memory.as_ref().ok_or_else(|| Error::internal("load without memory"))?;
                match eval::load(memory, kind, ea) {
                    Some(value) => {
                        self.set(dst, value)?;
                        Flow::Next(next)
                    }
                    None => {
                        self.fault_pc = pc;
                        Flow::Next(oob)
                    }
                }
            }
            Opcode::Store => {
                let kind = decode(StoreKind::from_u8(r.u8()?), "store kind", pc)?;
                let (addr, src, offset) = (r.u32()?, r.u32()?, r.u32()?);
                let oob = r.abs()?;
                let next = r.pos();
                let ea = u64::from(self.get(addr)?.get_i32() as u32) + u64::from(offset);
                let memory = self.ctx.memory.as_ref().ok_or_else(|| Error::internal("store without memory"))?;
                if eval::store(memory, kind, ea, self.get(src)?) {
                    Flow::Next(next)
                } else {
                    self.fault_pc = pc;
                    Flow::Next(oob)
                }
            }
            Opcode::GlobalGet => {
                let ty = decode(ValType::from_u8(r.u8()?), "global type", pc)?;
                let (dst, offset) = (r.u32()?, r.u32()?);
                let next = r.pos();
                let value = self.ctx.read_global(offset, ty)?;
                self.set(dst, value)?;
                Flow::Next(next)
            }
            Opcode::GlobalSet => {
                let ty = decode(ValType::from_u8(r.u8()?), "global type", pc)?;
                let (offset, src) = (r.u32()?, r.u32()?);
                let next = r.pos();
                self.ctx.write_global(offset, ty, self.get(src)?)?;
                Flow::Next(next)
            }
            Opcode::MemorySize => {
                let _symbol = r.abs()?;
                let dst = r.u32()?;
                let next = r.pos();
                let pages = self.ctx.memory.as_ref().map_or(0, crate::memory::Memory::size);
                self.set(dst, RawVal::i32(pages as i32))?;
                Flow::Next(next)
            }
            Opcode::MemoryGrow => {
                let _symbol = r.abs()?;
                let (dst, delta) = (r.u32()?, r.u32()?);
                let next = r.pos();
                let delta = self.get(delta)?.get_i32() as u32;
                let old = self
                    .ctx
                    .memory
                    .as_ref()
                    .and_then(|memory| memory.grow(delta))
                    .map_or(-1, |old| old as i32);
                self.set(dst, RawVal::i32(old))?;
                Flow::Next(next)
            }
            Opcode::Splat => {
                let shape = decode(LaneShape::from_u8(r.u8()?), "lane shape", pc)?;
                let (dst, a) = (r.u32()?, r.u32()?);
                let next = r.pos();
                self.set(dst, eval::splat(shape, self.get(a)?))?;
                Flow::Next(next)
            }
            Opcode::ExtractLane => {
                let shape = decode(LaneShape::from_u8(r.u8()?), "lane shape", pc)?;
                let signed = r.u8()? != 0;
                let lane = r.u8()?;
                let (dst, vector) = (r.u32()?, r.u32()?);
                let next = r.pos();
                self.set(dst, eval::extract_lane(shape, signed, lane, self.get(vector)?))?;
                Flow::Next(next)
            }
            Opcode::ReplaceLane => {
                let shape = decode(LaneShape::from_u8(r.u8()?), "lane shape", pc)?;
                let lane = r.u8()?;
                let (dst, vector, value) = (r.u32()?, r.u32()?, r.u32()?);
                let next = r.pos();
                let result = eval::replace_lane(shape, lane, self.get(vector)?, self.get(value)?);
                self.set(dst, result)?;
                Flow::Next(next)
            }
            Opcode::Shuffle => {
                let (dst, a, b) = (r.u32()?, r.u32()?, r.u32()?);
                let lanes = r.lanes()?;
                let next = r.pos();
                self.set(dst, eval::shuffle(self.get(a)?, self.get(b)?, lanes))?;
                Flow::Next(next)
            }
            Opcode::Jump => {
                let rel = r.i32()?;
                let moves = read_moves(&mut r)?;
                self.branch(pc, rel, &moves)?
            }
            Opcode::BrIf => {
                let cond = r.u32()?;
                let then_rel = r.i32()?;
                let then_moves = read_moves(&mut r)?;
                let else_rel = r.i32()?;
                let else_moves = read_moves(&mut r)?;
                if self.get(cond)?.get_i32() != 0 {
                    self.branch(pc, then_rel, &then_moves)?
                } else {
                    self.branch(pc, else_rel, &else_moves)?
                }
            }
            Opcode::BrTable => {
                let index = self.get(r.u32()?)?.get_i32() as u32;
                let count = r.u32()?;
                // out of range indices take the default edge after the targets
                for _ in 0..index.min(count) {
                    r.i32()?;
                    r.skip_moves()?;
                }
                let rel = r.i32()?;
                let moves = read_moves(&mut r)?;
                self.branch(pc, rel, &moves)?
            }
            Opcode::Return => {
                let src = r.u32()?;
                let value = if src == NONE { None } else { Some(self.get(src)?) };
                self.pop_frame(value)?
            }
            Opcode::Trap => {
                let code = r.u8()?;
                let trap = decode(Trap::try_from(code).ok(), "trap code", pc)?;
                return Err(self.trap(trap, pc));
            }
            Opcode::Call => {
                let rel = r.i32()?;
                let args = read_args(&mut r)?;
                let dst = r.u32()?;
                let next = r.pos();
                if let Some(stub) = self.poll_signal(pc) {
                    return Ok(Flow::Next(stub));
                }
                let mut target = relative(pc, rel)?;
                if self.ctx.is_profiling() {
                    target = self.profiling_entry(target)?;
                }
                self.push_frame(&args, dst, next, None)?;
                Flow::Next(target)
            }
            Opcode::CallImport => {
                let exit_record = r.u32()?;
                let args = read_args(&mut r)?;
                let dst = r.u32()?;
                let next = r.pos();
                if let Some(stub) = self.poll_signal(pc) {
                    return Ok(Flow::Next(stub));
                }
                let target = self.ctx.exit_target(exit_record)?;
                self.push_frame(&args, dst, next, None)?;
                Flow::Next(target as usize)
            }
            Opcode::CallIndirect => {
                let (table_data, sig_data, index) = (r.u32()?, r.u32()?, r.u32()?);
                let args = read_args(&mut r)?;
                let dst = r.u32()?;
                let next = r.pos();
                if let Some(stub) = self.poll_signal(pc) {
                    return Ok(Flow::Next(stub));
                }

                let index = self.get(index)?.get_i32() as u32;
                let table = self.ctx.table_at(table_data)?;
                let target = table.call_target(index).map_err(|trap| self.trap(trap, pc))?;
                if target.token != self.ctx.sig_token_at(sig_data)? {
                    return Err(self.trap(Trap::BadSignature, pc));
                }

                let callee = if core::ptr::eq(target.instance.as_ptr(), Arc::as_ptr(&self.ctx)) {
                    None
                } else {
                    let instance = target
                        .instance
                        .upgrade()
                        .ok_or_else(|| self.trap(Trap::IndirectCallToNull, pc))?;
                    Some(instance)
                };
                self.push_frame(&args, dst, next, callee)?;
                Flow::Next(target.code_offset as usize)
            }
            Opcode::JumpFar => Flow::Next(r.abs()?),
            Opcode::ProfilingEnter => {
                let func = FuncIndex::from_u32(r.u32()?);
                self.ctx.record_profiling_entry(func);
                Flow::Next(r.pos())
            }
            Opcode::EntryPrologue => {
                let nargs = r.u32()? as usize;
                if self.slots.len() < nargs {
                    return Err(Error::internal("entry called with too few arguments"));
                }
                Flow::Next(r.pos())
            }
            Opcode::EntryReturn => {
                let src = r.u32()?;
                let value = if src == NONE { None } else { Some(self.get(src)?) };
                Flow::Done(value)
            }
            Opcode::ExitInterp | Opcode::ExitJit => {
                let optimized = op == Opcode::ExitJit;
                let symbol = r.abs()?;
                let import = r.u32()?;
                let nargs = r.u32()?;
                let throw = r.abs()?;
                let next = r.pos();
                let expected_jit = symbol == usize::from(SymbolicAddress::CallImportJit.to_u8());
                if optimized != expected_jit {
                    return Err(Error::internal(format!(
                        "import exit at {pc:#x} linked to the wrong symbol"
                    )));
                }
                self.exit(optimized, import, nargs, throw, next)?
            }
            Opcode::TrapExit => {
                let code = r.u8()?;
                let trap = decode(Trap::try_from(code).ok(), "trap code", pc)?;
                return Err(self.trap(trap, self.fault_pc));
            }
            Opcode::Unwind => {
                return Err(self
                    .pending
                    .take()
                    .unwrap_or_else(|| Error::internal("unwind without a pending error")));
            }
        };
        Ok(flow)
    }
}
