// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A small SSA control-flow-graph IR.
//!
//! Functions are made of basic blocks with block parameters instead of phi
//! instructions. Every block ends in exactly one terminator and the edges of a
//! terminator are addressed by [`EdgeRef`]s so branches can be emitted before
//! their destination exists and patched once it does.

mod builder;
pub mod ops;

use core::fmt;

use cranelift_entity::packed_option::ReservedValue;
use cranelift_entity::{PrimaryMap, entity_impl};
use smallvec::SmallVec;

pub use builder::FunctionBuilder;
use ops::{BinaryOp, ConvertOp, LaneShape, LoadKind, StoreKind, UnaryOp};

use crate::indices::{FuncIndex, ImportIndex, SigIndex};
use crate::trap::Trap;
use crate::types::{Sig, ValType};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(u32);
entity_impl!(Value, "v");

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inst(u32);
entity_impl!(Inst, "inst");

/// A function in SSA form.
#[derive(Debug, Clone)]
pub struct Function {
    pub sig: Sig,
    pub blocks: PrimaryMap<Block, BlockData>,
    pub insts: PrimaryMap<Inst, InstData>,
    pub values: PrimaryMap<Value, ValueData>,
    pub entry: Block,
    /// Bytecode offset of the function body.
    pub srcloc: u32,
}

#[derive(Debug, Clone, Default)]
pub struct BlockData {
    pub params: SmallVec<[Value; 4]>,
    pub insts: Vec<Inst>,
}

#[derive(Debug, Clone)]
pub struct InstData {
    pub kind: InstKind,
    pub result: Option<Value>,
    /// Bytecode offset of the operator this instruction was translated from.
    pub srcloc: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ValueData {
    pub ty: ValType,
    pub def: ValueDef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDef {
    /// The result of an instruction.
    Result(Inst),
    /// A parameter of a block.
    Param(Block),
    /// Replaced by another value, e.g. a pruned loop phi.
    Alias(Value),
}

/// A branch destination together with the arguments passed to its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockCall {
    pub block: Block,
    pub args: SmallVec<[Value; 4]>,
}

/// Identifies one outgoing edge of a terminator.
///
/// `Jump` has edge 0, `Branch` has edge 0 (taken) and 1 (not taken) and
/// `BrTable` numbers its targets in order with the default last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeRef {
    pub inst: Inst,
    pub edge: u32,
}

#[derive(Debug, Clone)]
pub enum InstKind {
    /// A constant given by its raw bits.
    Const(u128),
    Unary(UnaryOp, Value),
    Binary(BinaryOp, Value, Value),
    Convert(ConvertOp, Value),
    Select {
        cond: Value,
        if_true: Value,
        if_false: Value,
    },
    Load {
        kind: LoadKind,
        addr: Value,
        offset: u32,
    },
    Store {
        kind: StoreKind,
        addr: Value,
        value: Value,
        offset: u32,
    },
    /// Reads a global from the instance's global data.
    GlobalGet {
        ty: ValType,
        global_data_offset: u32,
    },
    GlobalSet {
        ty: ValType,
        global_data_offset: u32,
        value: Value,
    },
    MemorySize,
    MemoryGrow(Value),
    Splat(LaneShape, Value),
    ExtractLane {
        shape: LaneShape,
        signed: bool,
        lane: u8,
        vector: Value,
    },
    ReplaceLane {
        shape: LaneShape,
        lane: u8,
        vector: Value,
        value: Value,
    },
    Shuffle {
        a: Value,
        b: Value,
        lanes: [u8; 16],
    },
    /// A direct call to a function defined in this module.
    Call {
        callee: FuncIndex,
        args: SmallVec<[Value; 4]>,
    },
    /// A call through the import's call-exit record.
    CallImport {
        import: ImportIndex,
        global_data_offset: u32,
        args: SmallVec<[Value; 4]>,
    },
    CallIndirect {
        sig: SigIndex,
        table_data_offset: u32,
        sig_data_offset: u32,
        index: Value,
        args: SmallVec<[Value; 4]>,
    },
    /// Cooperative preemption point.
    InterruptCheck,

    Jump(BlockCall),
    Branch {
        cond: Value,
        then_dest: BlockCall,
        else_dest: BlockCall,
    },
    BrTable {
        index: Value,
        /// Table targets followed by the default target.
        targets: Box<[BlockCall]>,
    },
    Return(Option<Value>),
    Trap(Trap),
}

// ===== impl Function =====

impl Function {
    pub fn new(sig: Sig) -> Self {
        let mut func = Self {
            sig,
            blocks: PrimaryMap::new(),
            insts: PrimaryMap::new(),
            values: PrimaryMap::new(),
            entry: Block::reserved_value(),
            srcloc: 0,
        };
        func.entry = func.blocks.push(BlockData::default());
        func
    }

    /// Follows alias chains to the value that is actually defined.
    pub fn resolve(&self, mut value: Value) -> Value {
        while let ValueDef::Alias(original) = self.values[value].def {
            value = original;
        }
        value
    }

    pub fn value_type(&self, value: Value) -> ValType {
        self.values[value].ty
    }

    pub fn block_params(&self, block: Block) -> &[Value] {
        &self.blocks[block].params
    }

    /// Returns the last instruction of `block` if it is a terminator.
    pub fn terminator(&self, block: Block) -> Option<Inst> {
        let inst = *self.blocks[block].insts.last()?;
        self.insts[inst].kind.is_terminator().then_some(inst)
    }

    pub fn edge(&self, edge: EdgeRef) -> Option<&BlockCall> {
        match &self.insts[edge.inst].kind {
            InstKind::Jump(call) if edge.edge == 0 => Some(call),
            InstKind::Branch { then_dest, .. } if edge.edge == 0 => Some(then_dest),
            InstKind::Branch { else_dest, .. } if edge.edge == 1 => Some(else_dest),
            InstKind::BrTable { targets, .. } => targets.get(edge.edge as usize),
            _ => None,
        }
    }

    pub fn edge_mut(&mut self, edge: EdgeRef) -> Option<&mut BlockCall> {
        match &mut self.insts[edge.inst].kind {
            InstKind::Jump(call) if edge.edge == 0 => Some(call),
            InstKind::Branch { then_dest, .. } if edge.edge == 0 => Some(then_dest),
            InstKind::Branch { else_dest, .. } if edge.edge == 1 => Some(else_dest),
            InstKind::BrTable { targets, .. } => targets.get_mut(edge.edge as usize),
            _ => None,
        }
    }

    pub fn display(&self) -> DisplayFunction<'_> {
        DisplayFunction(self)
    }
}

// ===== impl InstKind =====

impl InstKind {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Jump(_)
                | InstKind::Branch { .. }
                | InstKind::BrTable { .. }
                | InstKind::Return(_)
                | InstKind::Trap(_)
        )
    }
}

// ===== impl BlockCall =====

impl BlockCall {
    pub fn new(block: Block, args: &[Value]) -> Self {
        Self {
            block,
            args: SmallVec::from_slice(args),
        }
    }

    /// A destination that is filled in once the target block is known.
    pub fn placeholder() -> Self {
        Self {
            block: Block::reserved_value(),
            args: SmallVec::new(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.block.is_reserved_value()
    }
}

// ===== Display =====

pub struct DisplayFunction<'a>(&'a Function);

impl fmt::Display for DisplayFunction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let func = self.0;
        writeln!(f, "function {} {{", func.sig)?;
        for (block, data) in &func.blocks {
            write!(f, "{block}(")?;
            for (i, param) in data.params.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{param}: {}", func.values[*param].ty)?;
            }
            writeln!(f, "):")?;
            for inst in &data.insts {
                let inst = &func.insts[*inst];
                f.write_str("    ")?;
                if let Some(result) = inst.result {
                    write!(f, "{result} = ")?;
                }
                writeln!(f, "{}", DisplayInst(func, &inst.kind))?;
            }
        }
        f.write_str("}")
    }
}

struct DisplayInst<'a>(&'a Function, &'a InstKind);

impl fmt::Display for DisplayInst<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let func = self.0;
        let v = |value: Value| func.resolve(value);
        let call = |f: &mut fmt::Formatter<'_>, call: &BlockCall| -> fmt::Result {
            write!(f, "{}(", call.block)?;
            for (i, arg) in call.args.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", v(*arg))?;
            }
            f.write_str(")")
        };

        match self.1 {
            InstKind::Const(bits) => write!(f, "const {bits:#x}"),
            InstKind::Unary(op, a) => write!(f, "{op:?} {}", v(*a)),
            InstKind::Binary(op, a, b) => write!(f, "{op:?} {}, {}", v(*a), v(*b)),
            InstKind::Convert(op, a) => write!(f, "{op:?} {}", v(*a)),
            InstKind::Select {
                cond,
                if_true,
                if_false,
            } => write!(f, "select {}, {}, {}", v(*cond), v(*if_true), v(*if_false)),
            InstKind::Load { kind, addr, offset } => {
                write!(f, "load.{kind:?} {}+{offset}", v(*addr))
            }
            InstKind::Store {
                kind,
                addr,
                value,
                offset,
            } => write!(f, "store.{kind:?} {}+{offset}, {}", v(*addr), v(*value)),
            InstKind::GlobalGet {
                ty,
                global_data_offset,
            } => write!(f, "global_get.{ty} gd[{global_data_offset}]"),
            InstKind::GlobalSet {
                ty,
                global_data_offset,
                value,
            } => write!(f, "global_set.{ty} gd[{global_data_offset}], {}", v(*value)),
            InstKind::MemorySize => f.write_str("memory_size"),
            InstKind::MemoryGrow(delta) => write!(f, "memory_grow {}", v(*delta)),
            InstKind::Splat(shape, a) => write!(f, "splat.{shape:?} {}", v(*a)),
            InstKind::ExtractLane {
                shape,
                signed,
                lane,
                vector,
            } => write!(
                f,
                "extract_lane.{shape:?}{} {}[{lane}]",
                if *signed { "_s" } else { "" },
                v(*vector)
            ),
            InstKind::ReplaceLane {
                shape,
                lane,
                vector,
                value,
            } => write!(f, "replace_lane.{shape:?} {}[{lane}], {}", v(*vector), v(*value)),
            InstKind::Shuffle { a, b, lanes } => {
                write!(f, "shuffle {}, {}, {lanes:?}", v(*a), v(*b))
            }
            InstKind::Call { callee, args } => {
                write!(f, "call func{}(", callee.as_u32())?;
                write_args(f, func, args)
            }
            InstKind::CallImport { import, args, .. } => {
                write!(f, "call_import import{}(", import.as_u32())?;
                write_args(f, func, args)
            }
            InstKind::CallIndirect {
                sig, index, args, ..
            } => {
                write!(f, "call_indirect sig{} {}(", sig.as_u32(), v(*index))?;
                write_args(f, func, args)
            }
            InstKind::InterruptCheck => f.write_str("interrupt_check"),
            InstKind::Jump(dest) => {
                f.write_str("jump ")?;
                call(f, dest)
            }
            InstKind::Branch {
                cond,
                then_dest,
                else_dest,
            } => {
                write!(f, "brif {}, ", v(*cond))?;
                call(f, then_dest)?;
                f.write_str(", ")?;
                call(f, else_dest)
            }
            InstKind::BrTable { index, targets } => {
                write!(f, "br_table {} [", v(*index))?;
                for (i, target) in targets.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    call(f, target)?;
                }
                f.write_str("]")
            }
            InstKind::Return(Some(value)) => write!(f, "return {}", v(*value)),
            InstKind::Return(None) => f.write_str("return"),
            InstKind::Trap(trap) => write!(f, "trap {trap:?}"),
        }
    }
}

fn write_args(f: &mut fmt::Formatter<'_>, func: &Function, args: &[Value]) -> fmt::Result {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", func.resolve(*arg))?;
    }
    f.write_str(")")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entities_print_their_display_names() {
        assert_eq!(format!("{:?}", Block::from_u32(3)), "block3");
        assert_eq!(format!("{}", Value::from_u32(7)), "v7");
        assert_eq!(format!("{:?}", Inst::from_u32(0)), "inst0");
    }
}
