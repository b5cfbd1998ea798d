// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::indices::GlobalIndex;
use crate::utils::byte_enum;
use crate::{Error, wasm_unsupported};

byte_enum! {
    /// The type of a WebAssembly value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    pub enum ValType {
        I32,
        I64,
        F32,
        F64,
        /// A 128-bit SIMD vector.
        V128,
    }
}

impl ValType {
    /// Number of bytes a value of this type occupies in memory and global data.
    pub fn byte_size(self) -> u32 {
        match self {
            ValType::I32 | ValType::F32 => 4,
            ValType::I64 | ValType::F64 => 8,
            ValType::V128 => 16,
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::I32 => f.write_str("i32"),
            ValType::I64 => f.write_str("i64"),
            ValType::F32 => f.write_str("f32"),
            ValType::F64 => f.write_str("f64"),
            ValType::V128 => f.write_str("v128"),
        }
    }
}

impl TryFrom<wasmparser::ValType> for ValType {
    type Error = Error;

    fn try_from(ty: wasmparser::ValType) -> Result<Self, Self::Error> {
        match ty {
            wasmparser::ValType::I32 => Ok(ValType::I32),
            wasmparser::ValType::I64 => Ok(ValType::I64),
            wasmparser::ValType::F32 => Ok(ValType::F32),
            wasmparser::ValType::F64 => Ok(ValType::F64),
            wasmparser::ValType::V128 => Ok(ValType::V128),
            wasmparser::ValType::Ref(ty) => Err(wasm_unsupported!("reference type {ty:?}")),
        }
    }
}

/// A function signature: parameter types plus an optional return type.
///
/// Signatures are compared structurally. Process-wide identity for indirect calls is
/// handed out by the [`SignatureRegistry`](crate::SignatureRegistry).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sig {
    params: Box<[ValType]>,
    result: Option<ValType>,
}

impl Sig {
    pub fn new(params: impl IntoIterator<Item = ValType>, result: Option<ValType>) -> Self {
        Self {
            params: params.into_iter().collect(),
            result,
        }
    }

    pub fn params(&self) -> &[ValType] {
        &self.params
    }

    pub fn result(&self) -> Option<ValType> {
        self.result
    }

    /// Whether any parameter or the result is a 64-bit integer.
    pub fn has_i64(&self) -> bool {
        self.params.contains(&ValType::I64) || self.result == Some(ValType::I64)
    }
}

impl fmt::Display for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{param}")?;
        }
        f.write_str(")")?;
        if let Some(result) = self.result {
            write!(f, " -> {result}")?;
        }
        Ok(())
    }
}

impl TryFrom<&wasmparser::FuncType> for Sig {
    type Error = Error;

    fn try_from(ty: &wasmparser::FuncType) -> Result<Self, Self::Error> {
        let params = ty
            .params()
            .iter()
            .map(|ty| ValType::try_from(*ty))
            .collect::<Result<Box<[_]>, _>>()?;
        let result = match ty.results() {
            [] => None,
            [ty] => Some(ValType::try_from(*ty)?),
            _ => return Err(wasm_unsupported!("multi-value results in {ty:?}")),
        };
        Ok(Self { params, result })
    }
}

/// Limits of a funcref table, in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableType {
    pub initial: u32,
    pub maximum: Option<u32>,
}

/// Limits of a linear memory, in 64 KiB pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryType {
    pub initial: u32,
    pub maximum: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalType {
    pub content: ValType,
    pub mutable: bool,
}

/// A constant initializer expression for globals and segment offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitExpr {
    I32(i32),
    I64(i64),
    /// Raw bits of an `f32`.
    F32(u32),
    /// Raw bits of an `f64`.
    F64(u64),
    V128(u128),
    /// The value of an (imported) global.
    GlobalGet(GlobalIndex),
}

impl InitExpr {
    /// The type of the value this expression produces, `None` for `global.get`
    /// whose type depends on the referenced global.
    pub fn ty(&self) -> Option<ValType> {
        match self {
            InitExpr::I32(_) => Some(ValType::I32),
            InitExpr::I64(_) => Some(ValType::I64),
            InitExpr::F32(_) => Some(ValType::F32),
            InitExpr::F64(_) => Some(ValType::F64),
            InitExpr::V128(_) => Some(ValType::V128),
            InitExpr::GlobalGet(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sig_display() {
        let sig = Sig::new([ValType::I32, ValType::F64], Some(ValType::I64));
        assert_eq!(sig.to_string(), "(i32, f64) -> i64");
        assert!(sig.has_i64());
        assert_eq!(Sig::new([], None).to_string(), "()");
    }

    #[test]
    fn structurally_equal_sigs_compare_equal() {
        let a = Sig::new([ValType::I32], Some(ValType::I32));
        let b = Sig::new(vec![ValType::I32], Some(ValType::I32));
        assert_eq!(a, b);
        assert_ne!(a, Sig::new([ValType::I32], None));
    }
}
