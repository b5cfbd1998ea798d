// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Structured control flow.
//!
//! Every enclosing `block`, `loop` and `if` has a [`ControlFrame`] on the
//! control stack. Forward branches cannot name their destination yet, so they
//! are emitted with a placeholder [`BlockCall`] and recorded as a
//! [`PendingEdge`] on the frame they target. When the frame ends all of its
//! pending edges are bound to a single join block. Branches to a `loop` go
//! backwards to the loop header, which exists from the start.

use core::iter;

use smallvec::SmallVec;

use crate::compile::FuncCompiler;
use crate::ir::{Block, BlockCall, EdgeRef, Inst, InstKind, Value};
use crate::types::ValType;
use crate::{Error, Result};

pub(super) struct ControlFrame {
    pub kind: FrameKind,
    pub result: Option<ValType>,
    /// Height of the value stack when the frame was entered.
    pub stack_base: usize,
    /// Forward edges waiting for the join block of this frame.
    pub pending: Vec<PendingEdge>,
}

pub(super) enum FrameKind {
    Function,
    Block,
    Loop(Option<LoopHeader>),
    If {
        /// The not-taken edge of the conditional branch, until an `else` binds it.
        else_edge: Option<EdgeRef>,
        /// Local values on entry, restored for the `else` arm.
        entry_locals: Vec<Value>,
    },
}

pub(super) struct LoopHeader {
    pub block: Block,
    pub entry: EdgeRef,
    pub back_edges: Vec<EdgeRef>,
}

pub(super) struct PendingEdge {
    pub at: EdgeRef,
    /// Values of all locals along this edge.
    pub locals: Vec<Value>,
    /// The block result carried by this edge, if any.
    pub result: Option<Value>,
}

/// Where a branch edge leads, decided before the terminator exists.
pub(super) enum EdgeTarget {
    /// Returns from the function.
    Return,
    /// Back edge to the header of the loop frame at the given control depth.
    Header(usize),
    /// Forward edge to the join of the frame at the given control depth.
    Pending(usize, Option<Value>),
}

impl ControlFrame {
    pub fn new(kind: FrameKind, result: Option<ValType>, stack_base: usize) -> Self {
        Self {
            kind,
            result,
            stack_base,
            pending: Vec::new(),
        }
    }

    /// A placeholder frame pushed while translating dead code, keeping the
    /// nesting depth correct.
    pub fn unreachable(kind: FrameKind, stack_base: usize) -> Self {
        Self::new(kind, None, stack_base)
    }
}

impl FuncCompiler<'_> {
    /// Resolves a relative branch depth to an index into the control stack.
    pub(super) fn frame_index(&self, relative_depth: u32) -> Result<usize> {
        self.control
            .len()
            .checked_sub(1 + relative_depth as usize)
            .ok_or_else(|| self.invalid(format!("invalid branch depth {relative_depth}")))
    }

    /// Builds the destination of an edge to the frame at `index`.
    ///
    /// Edges returning from the function go through `ret_block`, which is
    /// created on first use.
    pub(super) fn edge_to(
        &mut self,
        index: usize,
        ret_block: &mut Option<Block>,
    ) -> Result<(BlockCall, EdgeTarget)> {
        match &self.control[index].kind {
            FrameKind::Function => {
                let block = *ret_block.get_or_insert_with(|| self.builder.create_block());
                Ok((BlockCall::new(block, &[]), EdgeTarget::Return))
            }
            FrameKind::Loop(Some(header)) => Ok((
                BlockCall::new(header.block, &self.locals),
                EdgeTarget::Header(index),
            )),
            FrameKind::Loop(None) => Err(Error::internal("branch to a loop entered in dead code")),
            FrameKind::Block | FrameKind::If { .. } => {
                let result = match self.control[index].result {
                    Some(_) => Some(self.peek()?),
                    None => None,
                };
                Ok((BlockCall::placeholder(), EdgeTarget::Pending(index, result)))
            }
        }
    }

    /// Records the edges of a freshly emitted terminator on the frames they target.
    pub(super) fn record_edges(&mut self, inst: Inst, targets: Vec<EdgeTarget>) {
        for (edge, target) in (0u32..).zip(targets) {
            let at = EdgeRef { inst, edge };
            match target {
                EdgeTarget::Return => {}
                EdgeTarget::Header(index) => {
                    if let FrameKind::Loop(Some(header)) = &mut self.control[index].kind {
                        header.back_edges.push(at);
                    }
                }
                EdgeTarget::Pending(index, result) => {
                    self.control[index].pending.push(PendingEdge {
                        at,
                        locals: self.locals.clone(),
                        result,
                    });
                }
            }
        }
    }

    /// Fills the return block created by [`edge_to`](Self::edge_to), if any,
    /// and continues in `continuation`.
    pub(super) fn finish_branch(&mut self, ret_block: Option<Block>, continuation: Option<Block>) -> Result<()> {
        if let Some(ret) = ret_block {
            let value = match self.builder.func().sig.result() {
                Some(_) => Some(self.peek()?),
                None => None,
            };
            self.builder.switch_to_block(ret);
            self.builder.terminate(InstKind::Return(value));
        }
        if let Some(block) = continuation {
            self.builder.switch_to_block(block);
        }
        Ok(())
    }

    /// `br`: an unconditional branch.
    pub(super) fn branch(&mut self, relative_depth: u32) -> Result<()> {
        let index = self.frame_index(relative_depth)?;
        if matches!(self.control[index].kind, FrameKind::Function) {
            return self.emit_return();
        }
        let mut ret_block = None;
        let (dest, target) = self.edge_to(index, &mut ret_block)?;
        let inst = self
            .builder
            .terminate(InstKind::Jump(dest))
            .ok_or_else(|| Error::internal("branch in dead code"))?;
        self.record_edges(inst, vec![target]);
        Ok(())
    }

    /// `br_if`: the branch value, if any, stays on the stack for the fallthrough.
    pub(super) fn branch_if(&mut self, relative_depth: u32) -> Result<()> {
        let cond = self.pop()?;
        let index = self.frame_index(relative_depth)?;
        let mut ret_block = None;
        let (then_dest, target) = self.edge_to(index, &mut ret_block)?;
        let continuation = self.builder.create_block();
        let inst = self
            .builder
            .terminate(InstKind::Branch {
                cond,
                then_dest,
                else_dest: BlockCall::new(continuation, &[]),
            })
            .ok_or_else(|| Error::internal("branch in dead code"))?;
        self.record_edges(inst, vec![target]);
        self.finish_branch(ret_block, Some(continuation))
    }

    pub(super) fn branch_table(&mut self, depths: &[u32], default: u32) -> Result<()> {
        let index = self.pop()?;
        let mut ret_block = None;
        let mut dests = Vec::with_capacity(depths.len() + 1);
        let mut targets = Vec::with_capacity(depths.len() + 1);
        for &depth in depths.iter().chain(iter::once(&default)) {
            let frame = self.frame_index(depth)?;
            let (dest, target) = self.edge_to(frame, &mut ret_block)?;
            dests.push(dest);
            targets.push(target);
        }
        let inst = self
            .builder
            .terminate(InstKind::BrTable {
                index,
                targets: dests.into_boxed_slice(),
            })
            .ok_or_else(|| Error::internal("branch in dead code"))?;
        self.record_edges(inst, targets);
        self.finish_branch(ret_block, None)
    }

    pub(super) fn enter_loop(&mut self, result: Option<ValType>) -> Result<()> {
        let header = self.builder.create_block();
        let params: Vec<Value> = self
            .local_types
            .iter()
            .map(|ty| self.builder.append_block_param(header, *ty))
            .collect();
        let entry = self
            .builder
            .terminate(InstKind::Jump(BlockCall::new(header, &self.locals)))
            .ok_or_else(|| Error::internal("loop entered in dead code"))?;
        self.builder.switch_to_block(header);
        self.locals = params;
        self.interrupt_check();

        self.control.push(ControlFrame::new(
            FrameKind::Loop(Some(LoopHeader {
                block: header,
                entry: EdgeRef { inst: entry, edge: 0 },
                back_edges: Vec::new(),
            })),
            result,
            self.stack.len(),
        ));
        Ok(())
    }

    pub(super) fn enter_if(&mut self, result: Option<ValType>) -> Result<()> {
        let cond = self.pop()?;
        let then_block = self.builder.create_block();
        let inst = self
            .builder
            .terminate(InstKind::Branch {
                cond,
                then_dest: BlockCall::new(then_block, &[]),
                else_dest: BlockCall::placeholder(),
            })
            .ok_or_else(|| Error::internal("if entered in dead code"))?;
        self.builder.switch_to_block(then_block);

        self.control.push(ControlFrame::new(
            FrameKind::If {
                else_edge: Some(EdgeRef { inst, edge: 1 }),
                entry_locals: self.locals.clone(),
            },
            result,
            self.stack.len(),
        ));
        Ok(())
    }

    pub(super) fn translate_else(&mut self) -> Result<()> {
        let index = self.control.len().checked_sub(1).ok_or_else(|| self.invalid("else outside of if"))?;
        let (result, stack_base) = (self.control[index].result, self.control[index].stack_base);

        if !self.builder.is_unreachable() {
            let value = match result {
                Some(_) => Some(self.pop()?),
                None => None,
            };
            let inst = self
                .builder
                .terminate(InstKind::Jump(BlockCall::placeholder()))
                .ok_or_else(|| Error::internal("reachable code without a block"))?;
            self.control[index].pending.push(PendingEdge {
                at: EdgeRef { inst, edge: 0 },
                locals: self.locals.clone(),
                result: value,
            });
        }
        self.stack.truncate(stack_base);

        let FrameKind::If {
            else_edge,
            entry_locals,
        } = &mut self.control[index].kind
        else {
            return Err(Error::internal("else outside of if"));
        };
        // an `if` entered in dead code has no else edge and the else arm stays dead
        if let Some(edge) = else_edge.take() {
            let locals = entry_locals.clone();
            let else_block = self.builder.create_block();
            *self.edge_mut(edge)? = BlockCall::new(else_block, &[]);
            self.builder.switch_to_block(else_block);
            self.locals = locals;
        }
        Ok(())
    }

    pub(super) fn translate_end(&mut self) -> Result<()> {
        let frame = self
            .control
            .pop()
            .ok_or_else(|| self.invalid("end without matching block"))?;

        match frame.kind {
            FrameKind::Function => {
                if !self.builder.is_unreachable() {
                    self.emit_return()?;
                }
                Ok(())
            }
            FrameKind::Loop(header) => {
                if let Some(header) = header {
                    self.prune_loop_params(&header)?;
                }
                let value = match frame.result {
                    Some(_) if !self.builder.is_unreachable() => Some(self.pop()?),
                    _ => None,
                };
                self.stack.truncate(frame.stack_base);
                self.stack.extend(value);
                Ok(())
            }
            FrameKind::Block | FrameKind::If { .. } => self.bind_join(frame),
        }
    }

    /// Binds every edge to `frame`'s end to one join block and continues there.
    ///
    /// A local whose value differs between edges becomes a block parameter.
    /// The block result is merged only if every edge carries a value of the
    /// frame's result type, otherwise it is dropped.
    fn bind_join(&mut self, frame: ControlFrame) -> Result<()> {
        let mut pending = frame.pending;
        if let FrameKind::If {
            else_edge: Some(edge),
            entry_locals,
        } = frame.kind
        {
            pending.push(PendingEdge {
                at: edge,
                locals: entry_locals,
                result: None,
            });
        }

        let fallthrough = if self.builder.is_unreachable() {
            None
        } else {
            let value = match frame.result {
                Some(_) => Some(self.pop()?),
                None => None,
            };
            Some(value)
        };
        self.stack.truncate(frame.stack_base);

        if pending.is_empty() {
            // only the fallthrough (if any) reaches the end, keep going in the current block
            self.stack.extend(fallthrough.flatten());
            return Ok(());
        }

        if let Some(value) = fallthrough {
            let inst = self
                .builder
                .terminate(InstKind::Jump(BlockCall::placeholder()))
                .ok_or_else(|| Error::internal("reachable code without a block"))?;
            pending.push(PendingEdge {
                at: EdgeRef { inst, edge: 0 },
                locals: self.locals.clone(),
                result: value,
            });
        }

        let join = self.builder.create_block();
        let mut args: Vec<SmallVec<[Value; 4]>> = vec![SmallVec::new(); pending.len()];

        let mut merged = Vec::with_capacity(self.local_types.len());
        for (local, ty) in self.local_types.clone().into_iter().enumerate() {
            let func = self.builder.func();
            let first = func.resolve(pending[0].locals[local]);
            if pending
                .iter()
                .all(|edge| func.resolve(edge.locals[local]) == first)
            {
                merged.push(first);
            } else {
                let param = self.builder.append_block_param(join, ty);
                for (edge, args) in pending.iter().zip(&mut args) {
                    args.push(edge.locals[local]);
                }
                merged.push(param);
            }
        }

        let result = match frame.result {
            Some(ty) => self.merge_result(join, ty, &pending, &mut args),
            None => None,
        };

        for (edge, args) in pending.iter().zip(args) {
            *self.edge_mut(edge.at)? = BlockCall { block: join, args };
        }

        self.builder.switch_to_block(join);
        self.locals = merged;
        self.stack.extend(result);
        Ok(())
    }

    fn merge_result(
        &mut self,
        join: Block,
        ty: ValType,
        pending: &[PendingEdge],
        args: &mut [SmallVec<[Value; 4]>],
    ) -> Option<Value> {
        let func = self.builder.func();
        let values: Vec<Value> = pending
            .iter()
            .filter_map(|edge| edge.result)
            .filter(|value| func.value_type(*value) == ty)
            .map(|value| func.resolve(value))
            .collect();
        if values.len() != pending.len() {
            tracing::trace!("dropping mismatched block result at {join}");
            return None;
        }
        if values.iter().all(|value| *value == values[0]) {
            return Some(values[0]);
        }
        let param = self.builder.append_block_param(join, ty);
        for (value, args) in values.into_iter().zip(args) {
            args.push(value);
        }
        Some(param)
    }

    /// Removes loop header parameters whose incoming values are all the same
    /// value (or the parameter itself), repeating until nothing changes.
    fn prune_loop_params(&mut self, header: &LoopHeader) -> Result<()> {
        let edges: Vec<EdgeRef> = iter::once(header.entry)
            .chain(header.back_edges.iter().copied())
            .collect();

        loop {
            let mut changed = false;
            let params: Vec<Value> = self.builder.func().block_params(header.block).to_vec();

            for (index, param) in params.into_iter().enumerate().rev() {
                let mut incoming = None;
                let mut redundant = true;
                for edge in &edges {
                    let func = self.builder.func();
                    let dest = func
                        .edge(*edge)
                        .ok_or_else(|| Error::internal("dangling loop edge"))?;
                    let arg = func.resolve(dest.args[index]);
                    if arg == param {
                        continue;
                    }
                    match incoming {
                        None => incoming = Some(arg),
                        Some(value) if value == arg => {}
                        Some(_) => {
                            redundant = false;
                            break;
                        }
                    }
                }

                if let (true, Some(value)) = (redundant, incoming) {
                    self.builder.alias_value(param, value);
                    self.builder.func_mut().blocks[header.block].params.remove(index);
                    for edge in &edges {
                        self.edge_mut(*edge)?.args.remove(index);
                    }
                    changed = true;
                }
            }

            if !changed {
                return Ok(());
            }
        }
    }

    fn edge_mut(&mut self, edge: EdgeRef) -> Result<&mut BlockCall> {
        self.builder
            .func_mut()
            .edge_mut(edge)
            .ok_or_else(|| Error::internal("edge does not exist"))
    }
}
