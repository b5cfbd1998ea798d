// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use smallvec::SmallVec;
use wasmparser::{BinaryReader, FunctionBody, Operator, OperatorsReader};

use crate::types::ValType;
use crate::{Error, Result};

/// A cursor over the pre-validated bytecode of one function body.
///
/// The function compiler never re-validates structure, it only pulls
/// declarations and operators in order.
pub trait Decoder<'a> {
    /// Reads the local declarations as `(count, type)` runs. Must be called
    /// exactly once, before the first [`read_op`](Self::read_op).
    fn read_local_decls(&mut self) -> Result<SmallVec<[(u32, ValType); 4]>>;

    fn read_op(&mut self) -> Result<Operator<'a>>;

    /// Whether all bytes of the body have been consumed.
    fn done(&self) -> bool;

    /// Bytecode offset of the next operator, relative to the start of the module.
    fn offset(&self) -> usize;
}

/// [`Decoder`] implementation on top of `wasmparser`'s function body readers.
pub struct FuncDecoder<'a> {
    body: FunctionBody<'a>,
    operators: Option<OperatorsReader<'a>>,
}

impl<'a> FuncDecoder<'a> {
    /// Creates a decoder for the function body `bytes` which start at
    /// `offset` in the module bytecode.
    pub fn new(bytes: &'a [u8], offset: usize) -> Self {
        Self {
            body: FunctionBody::new(BinaryReader::new(bytes, offset)),
            operators: None,
        }
    }
}

impl<'a> Decoder<'a> for FuncDecoder<'a> {
    fn read_local_decls(&mut self) -> Result<SmallVec<[(u32, ValType); 4]>> {
        let mut reader = self.body.get_locals_reader()?;
        let mut decls = SmallVec::new();
        for _ in 0..reader.get_count() {
            let (count, ty) = reader.read()?;
            decls.push((count, ValType::try_from(ty)?));
        }
        self.operators = Some(self.body.get_operators_reader()?);
        Ok(decls)
    }

    fn read_op(&mut self) -> Result<Operator<'a>> {
        let reader = self
            .operators
            .as_mut()
            .ok_or_else(|| Error::internal("operators read before local declarations"))?;
        Ok(reader.read()?)
    }

    fn done(&self) -> bool {
        self.operators.as_ref().is_some_and(OperatorsReader::eof)
    }

    fn offset(&self) -> usize {
        match &self.operators {
            Some(reader) => reader.original_position(),
            None => self.body.range().start,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_locals_then_operators() {
        // (local i32 i32 f64) i32.const 1 drop end
        let body = [0x02, 0x02, 0x7f, 0x01, 0x7c, 0x41, 0x01, 0x1a, 0x0b];
        let mut decoder = FuncDecoder::new(&body, 100);

        let locals = decoder.read_local_decls().unwrap();
        assert_eq!(locals.as_slice(), &[(2, ValType::I32), (1, ValType::F64)]);
        assert_eq!(decoder.offset(), 105);

        assert!(matches!(decoder.read_op().unwrap(), Operator::I32Const { value: 1 }));
        assert!(matches!(decoder.read_op().unwrap(), Operator::Drop));
        assert!(!decoder.done());
        assert!(matches!(decoder.read_op().unwrap(), Operator::End));
        assert!(decoder.done());
    }

    #[test]
    fn operators_require_locals_first() {
        let body = [0x00, 0x0b];
        let mut decoder = FuncDecoder::new(&body, 0);
        assert!(matches!(decoder.read_op(), Err(Error::Internal(_))));
    }
}
