// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::ir::{Block, BlockData, Function, Inst, InstData, InstKind, Value, ValueData, ValueDef};
use crate::types::{Sig, ValType};

/// Appends instructions to a [`Function`].
///
/// The builder tracks the block currently being filled as an `Option<Block>`.
/// After a terminator has been added there is no current block and every
/// instruction-building method becomes a no-op returning `None` until
/// [`switch_to_block`](Self::switch_to_block) makes a block current again.
pub struct FunctionBuilder {
    func: Function,
    current: Option<Block>,
    srcloc: u32,
}

impl FunctionBuilder {
    /// Creates a builder for a function of signature `sig`, positioned in the
    /// entry block. The entry block parameters are the function parameters and
    /// are always the first values of the function.
    pub fn new(sig: Sig) -> Self {
        let mut func = Function::new(sig);
        let entry = func.entry;
        for ty in func.sig.params().to_vec() {
            let value = func.values.push(ValueData {
                ty,
                def: ValueDef::Param(entry),
            });
            func.blocks[entry].params.push(value);
        }

        Self {
            func,
            current: Some(entry),
            srcloc: 0,
        }
    }

    pub fn func(&self) -> &Function {
        &self.func
    }

    pub fn func_mut(&mut self) -> &mut Function {
        &mut self.func
    }

    pub fn set_srcloc(&mut self, srcloc: u32) {
        self.srcloc = srcloc;
    }

    pub fn srcloc(&self) -> u32 {
        self.srcloc
    }

    /// Whether the code being built is unreachable.
    pub fn is_unreachable(&self) -> bool {
        self.current.is_none()
    }

    pub fn create_block(&mut self) -> Block {
        self.func.blocks.push(BlockData::default())
    }

    pub fn append_block_param(&mut self, block: Block, ty: ValType) -> Value {
        let value = self.func.values.push(ValueData {
            ty,
            def: ValueDef::Param(block),
        });
        self.func.blocks[block].params.push(value);
        value
    }

    pub fn switch_to_block(&mut self, block: Block) {
        debug_assert!(
            self.func.terminator(block).is_none(),
            "{block} is already terminated"
        );
        self.current = Some(block);
    }

    /// Appends an instruction without a result to the current block.
    pub fn ins(&mut self, kind: InstKind) -> Option<Inst> {
        debug_assert!(!kind.is_terminator());
        self.append(kind, None).map(|(inst, _)| inst)
    }

    /// Appends an instruction producing a value of type `ty`.
    pub fn value(&mut self, kind: InstKind, ty: ValType) -> Option<Value> {
        debug_assert!(!kind.is_terminator());
        self.append(kind, Some(ty)).and_then(|(_, value)| value)
    }

    /// Appends a terminator and leaves the builder without a current block.
    pub fn terminate(&mut self, kind: InstKind) -> Option<Inst> {
        debug_assert!(kind.is_terminator());
        let (inst, _) = self.append(kind, None)?;
        self.current = None;
        Some(inst)
    }

    /// Makes `value` an alias of `original`, every later use of `value`
    /// resolves to `original`.
    pub fn alias_value(&mut self, value: Value, original: Value) {
        debug_assert_ne!(self.func.resolve(original), value, "alias cycle");
        self.func.values[value].def = ValueDef::Alias(original);
    }

    pub fn finish(self) -> Function {
        self.func
    }

    fn append(&mut self, kind: InstKind, ty: Option<ValType>) -> Option<(Inst, Option<Value>)> {
        let block = self.current?;
        let inst = self.func.insts.push(InstData {
            kind,
            result: None,
            srcloc: self.srcloc,
        });
        let result = ty.map(|ty| {
            self.func.values.push(ValueData {
                ty,
                def: ValueDef::Result(inst),
            })
        });
        self.func.insts[inst].result = result;
        self.func.blocks[block].insts.push(inst);
        Some((inst, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::BlockCall;
    use crate::ir::ops::BinaryOp;
    use crate::trap::Trap;

    fn i32_sig() -> Sig {
        Sig::new([ValType::I32], Some(ValType::I32))
    }

    #[test]
    fn entry_params_are_the_first_values() {
        let builder = FunctionBuilder::new(Sig::new([ValType::I32, ValType::F64], None));
        let func = builder.func();
        assert_eq!(func.block_params(func.entry).len(), 2);
        assert_eq!(func.block_params(func.entry)[1], Value::from_u32(1));
        assert_eq!(func.value_type(Value::from_u32(1)), ValType::F64);
    }

    fn placed_insts(func: &Function) -> usize {
        func.blocks.values().map(|block| block.insts.len()).sum()
    }

    #[test]
    fn dead_code_emits_nothing() {
        let mut builder = FunctionBuilder::new(i32_sig());
        let param = builder.func().block_params(builder.func().entry)[0];
        builder.terminate(InstKind::Trap(Trap::UnreachableCodeReached));
        let insts = placed_insts(builder.func());
        let values = builder.func().values.len();

        assert!(builder.is_unreachable());
        assert!(builder.value(InstKind::Const(1), ValType::I32).is_none());
        assert!(
            builder
                .value(InstKind::Binary(BinaryOp::I32Add, param, param), ValType::I32)
                .is_none()
        );
        assert!(builder.terminate(InstKind::Return(Some(param))).is_none());

        assert_eq!(placed_insts(builder.func()), insts);
        assert_eq!(builder.func().values.len(), values);
    }

    #[test]
    fn resurrecting_yields_identical_code() {
        let build = |dead_ops: usize| {
            let mut builder = FunctionBuilder::new(i32_sig());
            let param = builder.func().block_params(builder.func().entry)[0];
            let join = builder.create_block();
            builder.terminate(InstKind::Jump(BlockCall::new(join, &[])));
            for _ in 0..dead_ops {
                builder.value(InstKind::Const(7), ValType::I32);
                builder.ins(InstKind::InterruptCheck);
                builder.terminate(InstKind::Return(None));
            }
            builder.switch_to_block(join);
            builder.terminate(InstKind::Return(Some(param)));
            builder.finish().display().to_string()
        };

        let reference = build(0);
        assert_eq!(build(1), reference);
        assert_eq!(build(5), reference);
    }

    #[test]
    fn aliases_resolve_transitively() {
        let mut builder = FunctionBuilder::new(i32_sig());
        let a = builder.value(InstKind::Const(1), ValType::I32).unwrap();
        let header = builder.create_block();
        let p = builder.append_block_param(header, ValType::I32);
        let q = builder.append_block_param(header, ValType::I32);
        builder.alias_value(q, p);
        builder.alias_value(p, a);
        assert_eq!(builder.func().resolve(q), a);
    }
}
