// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use smallvec::SmallVec;
use wasmparser::Operator;

use crate::indices::{FuncIndex, GlobalIndex};
use crate::types::InitExpr;
use crate::{Result, wasm_unsupported};

/// Reads the operators of a constant expression, without the final `end`.
fn read_ops<'a>(expr: &wasmparser::ConstExpr<'a>) -> Result<SmallVec<[(Operator<'a>, usize); 2]>> {
    let mut iter = expr
        .get_operators_reader()
        .into_iter_with_offsets()
        .peekable();

    let mut ops = SmallVec::new();
    while let Some(res) = iter.next() {
        let (op, offset) = res?;
        if matches!(op, Operator::End) && iter.peek().is_none() {
            break;
        }
        ops.push((op, offset));
    }
    Ok(ops)
}

/// Converts a single-operator constant expression, as used by global
/// initializers and segment offsets.
pub(crate) fn init_expr(expr: &wasmparser::ConstExpr<'_>) -> Result<InitExpr> {
    let ops = read_ops(expr)?;
    let [(op, offset)] = ops.as_slice() else {
        return Err(wasm_unsupported!("extended constant expressions"));
    };

    Ok(match op {
        Operator::I32Const { value } => InitExpr::I32(*value),
        Operator::I64Const { value } => InitExpr::I64(*value),
        Operator::F32Const { value } => InitExpr::F32(value.bits()),
        Operator::F64Const { value } => InitExpr::F64(value.bits()),
        Operator::V128Const { value } => InitExpr::V128(u128::from_le_bytes(*value.bytes())),
        Operator::GlobalGet { global_index } => InitExpr::GlobalGet(GlobalIndex::from_u32(*global_index)),
        op => {
            return Err(wasm_unsupported!(
                "opcode in constant expression at offset {offset:#x}: {op:?}"
            ));
        }
    })
}

/// Converts an element expression to the function it references.
pub(crate) fn elem_expr(expr: &wasmparser::ConstExpr<'_>) -> Result<Option<FuncIndex>> {
    let ops = read_ops(expr)?;
    match ops.as_slice() {
        [(Operator::RefFunc { function_index }, _)] => Ok(Some(FuncIndex::from_u32(*function_index))),
        [(Operator::RefNull { .. }, _)] => Ok(None),
        _ => Err(wasm_unsupported!("element expression {ops:?}")),
    }
}

#[cfg(test)]
mod tests {
    use wasmparser::{Parser, Payload};

    use super::*;

    fn global_inits(wat: &str) -> Vec<Result<InitExpr>> {
        let bytes = wat::parse_str(wat).unwrap();
        let mut inits = Vec::new();
        for payload in Parser::new(0).parse_all(&bytes) {
            if let Payload::GlobalSection(globals) = payload.unwrap() {
                for global in globals {
                    inits.push(init_expr(&global.unwrap().init_expr));
                }
            }
        }
        inits
    }

    #[test]
    fn constant_initializers() {
        let inits = global_inits(
            r#"(module
                (global i32 (i32.const -5))
                (global f64 (f64.const 1.5))
                (global i32 (global.get 0)))"#,
        );
        assert_eq!(inits[0].as_ref().unwrap(), &InitExpr::I32(-5));
        assert_eq!(inits[1].as_ref().unwrap(), &InitExpr::F64(1.5f64.to_bits()));
        assert_eq!(
            inits[2].as_ref().unwrap(),
            &InitExpr::GlobalGet(GlobalIndex::from_u32(0))
        );
    }

    #[test]
    fn extended_constants_are_unsupported() {
        let inits = global_inits(
            r#"(module (global i32 (i32.add (i32.const 1) (i32.const 2))))"#,
        );
        assert!(matches!(inits[0], Err(crate::Error::Unsupported(_))));
    }
}
