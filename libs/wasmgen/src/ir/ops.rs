// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Operation codes shared by the IR and the encoded instruction stream.
//!
//! Every operation is a single byte so the backend can embed it directly in
//! emitted code and the executor can decode it again with `from_u8`.

use crate::types::ValType;
use crate::utils::byte_enum;

byte_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum UnaryOp {
        I32Eqz,
        I32Clz,
        I32Ctz,
        I32Popcnt,
        I64Eqz,
        I64Clz,
        I64Ctz,
        I64Popcnt,
        F32Abs,
        F32Neg,
        F32Ceil,
        F32Floor,
        F32Trunc,
        F32Nearest,
        F32Sqrt,
        F64Abs,
        F64Neg,
        F64Ceil,
        F64Floor,
        F64Trunc,
        F64Nearest,
        F64Sqrt,
        I32Extend8S,
        I32Extend16S,
        I64Extend8S,
        I64Extend16S,
        I64Extend32S,
        V128Not,
        V128AnyTrue,
        I8x16Neg,
        I32x4Neg,
        F32x4Neg,
        F64x2Neg,
    }
}

impl UnaryOp {
    pub fn result_ty(self) -> ValType {
        use UnaryOp::*;
        match self {
            I32Eqz | I32Clz | I32Ctz | I32Popcnt | I64Eqz | I32Extend8S | I32Extend16S
            | V128AnyTrue => ValType::I32,
            I64Clz | I64Ctz | I64Popcnt | I64Extend8S | I64Extend16S | I64Extend32S => {
                ValType::I64
            }
            F32Abs | F32Neg | F32Ceil | F32Floor | F32Trunc | F32Nearest | F32Sqrt => ValType::F32,
            F64Abs | F64Neg | F64Ceil | F64Floor | F64Trunc | F64Nearest | F64Sqrt => ValType::F64,
            V128Not | I8x16Neg | I32x4Neg | F32x4Neg | F64x2Neg => ValType::V128,
        }
    }

    pub fn from_wasm(op: &wasmparser::Operator<'_>) -> Option<Self> {
        use wasmparser::Operator as O;
        Some(match op {
            O::I32Eqz => Self::I32Eqz,
            O::I32Clz => Self::I32Clz,
            O::I32Ctz => Self::I32Ctz,
            O::I32Popcnt => Self::I32Popcnt,
            O::I64Eqz => Self::I64Eqz,
            O::I64Clz => Self::I64Clz,
            O::I64Ctz => Self::I64Ctz,
            O::I64Popcnt => Self::I64Popcnt,
            O::F32Abs => Self::F32Abs,
            O::F32Neg => Self::F32Neg,
            O::F32Ceil => Self::F32Ceil,
            O::F32Floor => Self::F32Floor,
            O::F32Trunc => Self::F32Trunc,
            O::F32Nearest => Self::F32Nearest,
            O::F32Sqrt => Self::F32Sqrt,
            O::F64Abs => Self::F64Abs,
            O::F64Neg => Self::F64Neg,
            O::F64Ceil => Self::F64Ceil,
            O::F64Floor => Self::F64Floor,
            O::F64Trunc => Self::F64Trunc,
            O::F64Nearest => Self::F64Nearest,
            O::F64Sqrt => Self::F64Sqrt,
            O::I32Extend8S => Self::I32Extend8S,
            O::I32Extend16S => Self::I32Extend16S,
            O::I64Extend8S => Self::I64Extend8S,
            O::I64Extend16S => Self::I64Extend16S,
            O::I64Extend32S => Self::I64Extend32S,
            O::V128Not => Self::V128Not,
            O::V128AnyTrue => Self::V128AnyTrue,
            O::I8x16Neg => Self::I8x16Neg,
            O::I32x4Neg => Self::I32x4Neg,
            O::F32x4Neg => Self::F32x4Neg,
            O::F64x2Neg => Self::F64x2Neg,
            _ => return None,
        })
    }
}

byte_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum BinaryOp {
        I32Eq,
        I32Ne,
        I32LtS,
        I32LtU,
        I32GtS,
        I32GtU,
        I32LeS,
        I32LeU,
        I32GeS,
        I32GeU,
        I64Eq,
        I64Ne,
        I64LtS,
        I64LtU,
        I64GtS,
        I64GtU,
        I64LeS,
        I64LeU,
        I64GeS,
        I64GeU,
        F32Eq,
        F32Ne,
        F32Lt,
        F32Gt,
        F32Le,
        F32Ge,
        F64Eq,
        F64Ne,
        F64Lt,
        F64Gt,
        F64Le,
        F64Ge,
        I32Add,
        I32Sub,
        I32Mul,
        I32DivS,
        I32DivU,
        I32RemS,
        I32RemU,
        I32And,
        I32Or,
        I32Xor,
        I32Shl,
        I32ShrS,
        I32ShrU,
        I32Rotl,
        I32Rotr,
        I64Add,
        I64Sub,
        I64Mul,
        I64DivS,
        I64DivU,
        I64RemS,
        I64RemU,
        I64And,
        I64Or,
        I64Xor,
        I64Shl,
        I64ShrS,
        I64ShrU,
        I64Rotl,
        I64Rotr,
        F32Add,
        F32Sub,
        F32Mul,
        F32Div,
        F32Min,
        F32Max,
        F32Copysign,
        F64Add,
        F64Sub,
        F64Mul,
        F64Div,
        F64Min,
        F64Max,
        F64Copysign,
        V128And,
        V128Or,
        V128Xor,
        V128AndNot,
        I8x16Add,
        I8x16Sub,
        I8x16Eq,
        I16x8Add,
        I16x8Sub,
        I16x8Mul,
        I32x4Add,
        I32x4Sub,
        I32x4Mul,
        I32x4Eq,
        I64x2Add,
        I64x2Sub,
        I64x2Mul,
        F32x4Add,
        F32x4Sub,
        F32x4Mul,
        F32x4Div,
        F64x2Add,
        F64x2Sub,
        F64x2Mul,
        F64x2Div,
        /// Byte-granular lane selection with a runtime index vector.
        I8x16Swizzle,
    }
}

impl BinaryOp {
    pub fn result_ty(self) -> ValType {
        use BinaryOp::*;
        match self {
            I32Eq | I32Ne | I32LtS | I32LtU | I32GtS | I32GtU | I32LeS | I32LeU | I32GeS
            | I32GeU | I64Eq | I64Ne | I64LtS | I64LtU | I64GtS | I64GtU | I64LeS | I64LeU
            | I64GeS | I64GeU | F32Eq | F32Ne | F32Lt | F32Gt | F32Le | F32Ge | F64Eq | F64Ne
            | F64Lt | F64Gt | F64Le | F64Ge => ValType::I32,
            I32Add | I32Sub | I32Mul | I32DivS | I32DivU | I32RemS | I32RemU | I32And | I32Or
            | I32Xor | I32Shl | I32ShrS | I32ShrU | I32Rotl | I32Rotr => ValType::I32,
            I64Add | I64Sub | I64Mul | I64DivS | I64DivU | I64RemS | I64RemU | I64And | I64Or
            | I64Xor | I64Shl | I64ShrS | I64ShrU | I64Rotl | I64Rotr => ValType::I64,
            F32Add | F32Sub | F32Mul | F32Div | F32Min | F32Max | F32Copysign => ValType::F32,
            F64Add | F64Sub | F64Mul | F64Div | F64Min | F64Max | F64Copysign => ValType::F64,
            V128And | V128Or | V128Xor | V128AndNot | I8x16Add | I8x16Sub | I8x16Eq
            | I16x8Add | I16x8Sub | I16x8Mul | I32x4Add | I32x4Sub | I32x4Mul | I32x4Eq
            | I64x2Add | I64x2Sub | I64x2Mul | F32x4Add | F32x4Sub | F32x4Mul | F32x4Div
            | F64x2Add | F64x2Sub | F64x2Mul | F64x2Div | I8x16Swizzle => ValType::V128,
        }
    }

    /// Whether evaluating this operation may trap.
    pub fn can_trap(self) -> bool {
        use BinaryOp::*;
        matches!(
            self,
            I32DivS | I32DivU | I32RemS | I32RemU | I64DivS | I64DivU | I64RemS | I64RemU
        )
    }

    pub fn from_wasm(op: &wasmparser::Operator<'_>) -> Option<Self> {
        use wasmparser::Operator as O;
        Some(match op {
            O::I32Eq => Self::I32Eq,
            O::I32Ne => Self::I32Ne,
            O::I32LtS => Self::I32LtS,
            O::I32LtU => Self::I32LtU,
            O::I32GtS => Self::I32GtS,
            O::I32GtU => Self::I32GtU,
            O::I32LeS => Self::I32LeS,
            O::I32LeU => Self::I32LeU,
            O::I32GeS => Self::I32GeS,
            O::I32GeU => Self::I32GeU,
            O::I64Eq => Self::I64Eq,
            O::I64Ne => Self::I64Ne,
            O::I64LtS => Self::I64LtS,
            O::I64LtU => Self::I64LtU,
            O::I64GtS => Self::I64GtS,
            O::I64GtU => Self::I64GtU,
            O::I64LeS => Self::I64LeS,
            O::I64LeU => Self::I64LeU,
            O::I64GeS => Self::I64GeS,
            O::I64GeU => Self::I64GeU,
            O::F32Eq => Self::F32Eq,
            O::F32Ne => Self::F32Ne,
            O::F32Lt => Self::F32Lt,
            O::F32Gt => Self::F32Gt,
            O::F32Le => Self::F32Le,
            O::F32Ge => Self::F32Ge,
            O::F64Eq => Self::F64Eq,
            O::F64Ne => Self::F64Ne,
            O::F64Lt => Self::F64Lt,
            O::F64Gt => Self::F64Gt,
            O::F64Le => Self::F64Le,
            O::F64Ge => Self::F64Ge,
            O::I32Add => Self::I32Add,
            O::I32Sub => Self::I32Sub,
            O::I32Mul => Self::I32Mul,
            O::I32DivS => Self::I32DivS,
            O::I32DivU => Self::I32DivU,
            O::I32RemS => Self::I32RemS,
            O::I32RemU => Self::I32RemU,
            O::I32And => Self::I32And,
            O::I32Or => Self::I32Or,
            O::I32Xor => Self::I32Xor,
            O::I32Shl => Self::I32Shl,
            O::I32ShrS => Self::I32ShrS,
            O::I32ShrU => Self::I32ShrU,
            O::I32Rotl => Self::I32Rotl,
            O::I32Rotr => Self::I32Rotr,
            O::I64Add => Self::I64Add,
            O::I64Sub => Self::I64Sub,
            O::I64Mul => Self::I64Mul,
            O::I64DivS => Self::I64DivS,
            O::I64DivU => Self::I64DivU,
            O::I64RemS => Self::I64RemS,
            O::I64RemU => Self::I64RemU,
            O::I64And => Self::I64And,
            O::I64Or => Self::I64Or,
            O::I64Xor => Self::I64Xor,
            O::I64Shl => Self::I64Shl,
            O::I64ShrS => Self::I64ShrS,
            O::I64ShrU => Self::I64ShrU,
            O::I64Rotl => Self::I64Rotl,
            O::I64Rotr => Self::I64Rotr,
            O::F32Add => Self::F32Add,
            O::F32Sub => Self::F32Sub,
            O::F32Mul => Self::F32Mul,
            O::F32Div => Self::F32Div,
            O::F32Min => Self::F32Min,
            O::F32Max => Self::F32Max,
            O::F32Copysign => Self::F32Copysign,
            O::F64Add => Self::F64Add,
            O::F64Sub => Self::F64Sub,
            O::F64Mul => Self::F64Mul,
            O::F64Div => Self::F64Div,
            O::F64Min => Self::F64Min,
            O::F64Max => Self::F64Max,
            O::F64Copysign => Self::F64Copysign,
            O::V128And => Self::V128And,
            O::V128Or => Self::V128Or,
            O::V128Xor => Self::V128Xor,
            O::V128AndNot => Self::V128AndNot,
            O::I8x16Add => Self::I8x16Add,
            O::I8x16Sub => Self::I8x16Sub,
            O::I8x16Eq => Self::I8x16Eq,
            O::I16x8Add => Self::I16x8Add,
            O::I16x8Sub => Self::I16x8Sub,
            O::I16x8Mul => Self::I16x8Mul,
            O::I32x4Add => Self::I32x4Add,
            O::I32x4Sub => Self::I32x4Sub,
            O::I32x4Mul => Self::I32x4Mul,
            O::I32x4Eq => Self::I32x4Eq,
            O::I64x2Add => Self::I64x2Add,
            O::I64x2Sub => Self::I64x2Sub,
            O::I64x2Mul => Self::I64x2Mul,
            O::F32x4Add => Self::F32x4Add,
            O::F32x4Sub => Self::F32x4Sub,
            O::F32x4Mul => Self::F32x4Mul,
            O::F32x4Div => Self::F32x4Div,
            O::F64x2Add => Self::F64x2Add,
            O::F64x2Sub => Self::F64x2Sub,
            O::F64x2Mul => Self::F64x2Mul,
            O::F64x2Div => Self::F64x2Div,
            O::I8x16Swizzle => Self::I8x16Swizzle,
            _ => return None,
        })
    }
}

byte_enum! {
    /// Conversions between numeric types.
    ///
    /// Truncations name both the source width and the signedness of the result;
    /// the `Sat` forms clamp instead of trapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum ConvertOp {
        I32WrapI64,
        I64ExtendI32S,
        I64ExtendI32U,
        I32TruncF32S,
        I32TruncF32U,
        I32TruncF64S,
        I32TruncF64U,
        I64TruncF32S,
        I64TruncF32U,
        I64TruncF64S,
        I64TruncF64U,
        I32TruncSatF32S,
        I32TruncSatF32U,
        I32TruncSatF64S,
        I32TruncSatF64U,
        I64TruncSatF32S,
        I64TruncSatF32U,
        I64TruncSatF64S,
        I64TruncSatF64U,
        F32ConvertI32S,
        F32ConvertI32U,
        F32ConvertI64S,
        F32ConvertI64U,
        F64ConvertI32S,
        F64ConvertI32U,
        F64ConvertI64S,
        F64ConvertI64U,
        F32DemoteF64,
        F64PromoteF32,
        I32ReinterpretF32,
        I64ReinterpretF64,
        F32ReinterpretI32,
        F64ReinterpretI64,
    }
}

impl ConvertOp {
    pub fn result_ty(self) -> ValType {
        use ConvertOp::*;
        match self {
            I32WrapI64 | I32TruncF32S | I32TruncF32U | I32TruncF64S | I32TruncF64U
            | I32TruncSatF32S | I32TruncSatF32U | I32TruncSatF64S | I32TruncSatF64U
            | I32ReinterpretF32 => ValType::I32,
            I64ExtendI32S | I64ExtendI32U | I64TruncF32S | I64TruncF32U | I64TruncF64S
            | I64TruncF64U | I64TruncSatF32S | I64TruncSatF32U | I64TruncSatF64S
            | I64TruncSatF64U | I64ReinterpretF64 => ValType::I64,
            F32ConvertI32S | F32ConvertI32U | F32ConvertI64S | F32ConvertI64U | F32DemoteF64
            | F32ReinterpretI32 => ValType::F32,
            F64ConvertI32S | F64ConvertI32U | F64ConvertI64S | F64ConvertI64U | F64PromoteF32
            | F64ReinterpretI64 => ValType::F64,
        }
    }

    pub fn can_trap(self) -> bool {
        use ConvertOp::*;
        matches!(
            self,
            I32TruncF32S
                | I32TruncF32U
                | I32TruncF64S
                | I32TruncF64U
                | I64TruncF32S
                | I64TruncF32U
                | I64TruncF64S
                | I64TruncF64U
        )
    }

    pub fn from_wasm(op: &wasmparser::Operator<'_>) -> Option<Self> {
        use wasmparser::Operator as O;
        Some(match op {
            O::I32WrapI64 => Self::I32WrapI64,
            O::I64ExtendI32S => Self::I64ExtendI32S,
            O::I64ExtendI32U => Self::I64ExtendI32U,
            O::I32TruncF32S => Self::I32TruncF32S,
            O::I32TruncF32U => Self::I32TruncF32U,
            O::I32TruncF64S => Self::I32TruncF64S,
            O::I32TruncF64U => Self::I32TruncF64U,
            O::I64TruncF32S => Self::I64TruncF32S,
            O::I64TruncF32U => Self::I64TruncF32U,
            O::I64TruncF64S => Self::I64TruncF64S,
            O::I64TruncF64U => Self::I64TruncF64U,
            O::I32TruncSatF32S => Self::I32TruncSatF32S,
            O::I32TruncSatF32U => Self::I32TruncSatF32U,
            O::I32TruncSatF64S => Self::I32TruncSatF64S,
            O::I32TruncSatF64U => Self::I32TruncSatF64U,
            O::I64TruncSatF32S => Self::I64TruncSatF32S,
            O::I64TruncSatF32U => Self::I64TruncSatF32U,
            O::I64TruncSatF64S => Self::I64TruncSatF64S,
            O::I64TruncSatF64U => Self::I64TruncSatF64U,
            O::F32ConvertI32S => Self::F32ConvertI32S,
            O::F32ConvertI32U => Self::F32ConvertI32U,
            O::F32ConvertI64S => Self::F32ConvertI64S,
            O::F32ConvertI64U => Self::F32ConvertI64U,
            O::F64ConvertI32S => Self::F64ConvertI32S,
            O::F64ConvertI32U => Self::F64ConvertI32U,
            O::F64ConvertI64S => Self::F64ConvertI64S,
            O::F64ConvertI64U => Self::F64ConvertI64U,
            O::F32DemoteF64 => Self::F32DemoteF64,
            O::F64PromoteF32 => Self::F64PromoteF32,
            O::I32ReinterpretF32 => Self::I32ReinterpretF32,
            O::I64ReinterpretF64 => Self::I64ReinterpretF64,
            O::F32ReinterpretI32 => Self::F32ReinterpretI32,
            O::F64ReinterpretI64 => Self::F64ReinterpretI64,
            _ => return None,
        })
    }
}

byte_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum LoadKind {
        I32,
        I64,
        F32,
        F64,
        I32S8,
        I32U8,
        I32S16,
        I32U16,
        I64S8,
        I64U8,
        I64S16,
        I64U16,
        I64S32,
        I64U32,
        V128,
    }
}

impl LoadKind {
    pub fn result_ty(self) -> ValType {
        use LoadKind::*;
        match self {
            I32 | I32S8 | I32U8 | I32S16 | I32U16 => ValType::I32,
            I64 | I64S8 | I64U8 | I64S16 | I64U16 | I64S32 | I64U32 => ValType::I64,
            F32 => ValType::F32,
            F64 => ValType::F64,
            V128 => ValType::V128,
        }
    }

    /// Returns the load kind and the static offset of a wasm load operator.
    pub fn from_wasm(op: &wasmparser::Operator<'_>) -> Option<(Self, u64)> {
        use wasmparser::Operator as O;
        Some(match op {
            O::I32Load { memarg } => (Self::I32, memarg.offset),
            O::I64Load { memarg } => (Self::I64, memarg.offset),
            O::F32Load { memarg } => (Self::F32, memarg.offset),
            O::F64Load { memarg } => (Self::F64, memarg.offset),
            O::I32Load8S { memarg } => (Self::I32S8, memarg.offset),
            O::I32Load8U { memarg } => (Self::I32U8, memarg.offset),
            O::I32Load16S { memarg } => (Self::I32S16, memarg.offset),
            O::I32Load16U { memarg } => (Self::I32U16, memarg.offset),
            O::I64Load8S { memarg } => (Self::I64S8, memarg.offset),
            O::I64Load8U { memarg } => (Self::I64U8, memarg.offset),
            O::I64Load16S { memarg } => (Self::I64S16, memarg.offset),
            O::I64Load16U { memarg } => (Self::I64U16, memarg.offset),
            O::I64Load32S { memarg } => (Self::I64S32, memarg.offset),
            O::I64Load32U { memarg } => (Self::I64U32, memarg.offset),
            O::V128Load { memarg } => (Self::V128, memarg.offset),
            _ => return None,
        })
    }
}

byte_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum StoreKind {
        I32,
        I64,
        F32,
        F64,
        I32As8,
        I32As16,
        I64As8,
        I64As16,
        I64As32,
        V128,
    }
}

impl StoreKind {
    /// Number of bytes written to memory.
    pub fn width(self) -> u32 {
        use StoreKind::*;
        match self {
            I32As8 | I64As8 => 1,
            I32As16 | I64As16 => 2,
            I32 | F32 | I64As32 => 4,
            I64 | F64 => 8,
            V128 => 16,
        }
    }

    pub fn from_wasm(op: &wasmparser::Operator<'_>) -> Option<(Self, u64)> {
        use wasmparser::Operator as O;
        Some(match op {
            O::I32Store { memarg } => (Self::I32, memarg.offset),
            O::I64Store { memarg } => (Self::I64, memarg.offset),
            O::F32Store { memarg } => (Self::F32, memarg.offset),
            O::F64Store { memarg } => (Self::F64, memarg.offset),
            O::I32Store8 { memarg } => (Self::I32As8, memarg.offset),
            O::I32Store16 { memarg } => (Self::I32As16, memarg.offset),
            O::I64Store8 { memarg } => (Self::I64As8, memarg.offset),
            O::I64Store16 { memarg } => (Self::I64As16, memarg.offset),
            O::I64Store32 { memarg } => (Self::I64As32, memarg.offset),
            O::V128Store { memarg } => (Self::V128, memarg.offset),
            _ => return None,
        })
    }
}

byte_enum! {
    /// Lane interpretation of a `v128` value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum LaneShape {
        I8x16,
        I16x8,
        I32x4,
        I64x2,
        F32x4,
        F64x2,
    }
}

impl LaneShape {
    pub fn lanes(self) -> u8 {
        match self {
            LaneShape::I8x16 => 16,
            LaneShape::I16x8 => 8,
            LaneShape::I32x4 | LaneShape::F32x4 => 4,
            LaneShape::I64x2 | LaneShape::F64x2 => 2,
        }
    }

    pub fn lane_bits(self) -> u32 {
        128 / u32::from(self.lanes())
    }

    /// The scalar type a single lane is extracted to.
    pub fn scalar_ty(self) -> ValType {
        match self {
            LaneShape::I8x16 | LaneShape::I16x8 | LaneShape::I32x4 => ValType::I32,
            LaneShape::I64x2 => ValType::I64,
            LaneShape::F32x4 => ValType::F32,
            LaneShape::F64x2 => ValType::F64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_encoding_is_stable() {
        for byte in 0..=u8::MAX {
            if let Some(op) = BinaryOp::from_u8(byte) {
                assert_eq!(op.to_u8(), byte);
            }
        }
        assert_eq!(UnaryOp::from_u8(0), Some(UnaryOp::I32Eqz));
        assert_eq!(ConvertOp::from_u8(ConvertOp::F64ReinterpretI64.to_u8()), Some(ConvertOp::F64ReinterpretI64));
    }

    #[test]
    fn only_division_and_trapping_truncation_can_trap() {
        assert!(BinaryOp::I32DivU.can_trap());
        assert!(!BinaryOp::I32Add.can_trap());
        assert!(ConvertOp::I64TruncF64S.can_trap());
        assert!(!ConvertOp::I64TruncSatF64S.can_trap());
    }

    #[test]
    fn lane_shapes() {
        assert_eq!(LaneShape::I16x8.lanes(), 8);
        assert_eq!(LaneShape::F64x2.lane_bits(), 64);
        assert_eq!(LaneShape::I8x16.scalar_ty(), ValType::I32);
    }
}
