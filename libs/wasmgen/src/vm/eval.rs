// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Numeric semantics of the portable instruction set.
//!
//! All operations work on raw slots: narrower values live zero-extended in the
//! low bits, floats as their bit patterns.

use crate::ir::ops::{BinaryOp, ConvertOp, LaneShape, LoadKind, StoreKind, UnaryOp};
use crate::memory::Memory;
use crate::trap::Trap;
use crate::values::RawVal;

const F32_SIGN: u32 = 0x8000_0000;
const F64_SIGN: u64 = 0x8000_0000_0000_0000;

fn bool_val(cond: bool) -> RawVal {
    RawVal::i32(i32::from(cond))
}

fn f32_val(value: f32) -> RawVal {
    RawVal::from_bits(u128::from(value.to_bits()))
}

fn f64_val(value: f64) -> RawVal {
    RawVal::from_bits(u128::from(value.to_bits()))
}

fn lane_mask(bits: u32) -> u64 {
    if bits == 64 { u64::MAX } else { (1 << bits) - 1 }
}

/// Applies `f` to every `bits`-wide lane of `a`.
fn map_lanes(a: u128, bits: u32, f: impl Fn(u64) -> u64) -> u128 {
    let mask = lane_mask(bits);
    (0..128 / bits).fold(0, |out, lane| {
        let shift = lane * bits;
        let x = (a >> shift) as u64 & mask;
        out | (u128::from(f(x) & mask) << shift)
    })
}

/// Applies `f` to every pair of `bits`-wide lanes of `a` and `b`.
fn zip_lanes(a: u128, b: u128, bits: u32, f: impl Fn(u64, u64) -> u64) -> u128 {
    let mask = lane_mask(bits);
    (0..128 / bits).fold(0, |out, lane| {
        let shift = lane * bits;
        let x = (a >> shift) as u64 & mask;
        let y = (b >> shift) as u64 & mask;
        out | (u128::from(f(x, y) & mask) << shift)
    })
}

fn all_ones(cond: bool) -> u64 {
    if cond { u64::MAX } else { 0 }
}

fn f32_lanes(a: u128, b: u128, f: impl Fn(f32, f32) -> f32) -> u128 {
    zip_lanes(a, b, 32, |x, y| {
        u64::from(f(f32::from_bits(x as u32), f32::from_bits(y as u32)).to_bits())
    })
}

fn f64_lanes(a: u128, b: u128, f: impl Fn(f64, f64) -> f64) -> u128 {
    zip_lanes(a, b, 64, |x, y| f(f64::from_bits(x), f64::from_bits(y)).to_bits())
}

fn fmin32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else if a == b {
        // picks -0 over +0
        f32::from_bits(a.to_bits() | b.to_bits())
    } else {
        a.min(b)
    }
}

fn fmax32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else if a == b {
        f32::from_bits(a.to_bits() & b.to_bits())
    } else {
        a.max(b)
    }
}

fn fmin64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == b {
        f64::from_bits(a.to_bits() | b.to_bits())
    } else {
        a.min(b)
    }
}

fn fmax64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == b {
        f64::from_bits(a.to_bits() & b.to_bits())
    } else {
        a.max(b)
    }
}

pub(crate) fn unary(op: UnaryOp, a: RawVal) -> RawVal {
    use UnaryOp::*;

    let (x32, x64) = (a.get_i32(), a.get_i64());
    let (f32_bits, f64_bits) = (x32 as u32, x64 as u64);
    match op {
        I32Eqz => bool_val(x32 == 0),
        I32Clz => RawVal::i32(x32.leading_zeros() as i32),
        I32Ctz => RawVal::i32(x32.trailing_zeros() as i32),
        I32Popcnt => RawVal::i32(x32.count_ones() as i32),
        I64Eqz => bool_val(x64 == 0),
        I64Clz => RawVal::i64(i64::from(x64.leading_zeros())),
        I64Ctz => RawVal::i64(i64::from(x64.trailing_zeros())),
        I64Popcnt => RawVal::i64(i64::from(x64.count_ones())),

        F32Abs => RawVal::from_bits(u128::from(f32_bits & !F32_SIGN)),
        F32Neg => RawVal::from_bits(u128::from(f32_bits ^ F32_SIGN)),
        F32Ceil => f32_val(a.get_f32().ceil()),
        F32Floor => f32_val(a.get_f32().floor()),
        F32Trunc => f32_val(a.get_f32().trunc()),
        F32Nearest => f32_val(a.get_f32().round_ties_even()),
        F32Sqrt => f32_val(a.get_f32().sqrt()),
        F64Abs => RawVal::from_bits(u128::from(f64_bits & !F64_SIGN)),
        F64Neg => RawVal::from_bits(u128::from(f64_bits ^ F64_SIGN)),
        F64Ceil => f64_val(a.get_f64().ceil()),
        F64Floor => f64_val(a.get_f64().floor()),
        F64Trunc => f64_val(a.get_f64().trunc()),
        F64Nearest => f64_val(a.get_f64().round_ties_even()),
        F64Sqrt => f64_val(a.get_f64().sqrt()),

        I32Extend8S => RawVal::i32(i32::from(x32 as i8)),
        I32Extend16S => RawVal::i32(i32::from(x32 as i16)),
        I64Extend8S => RawVal::i64(i64::from(x64 as i8)),
        I64Extend16S => RawVal::i64(i64::from(x64 as i16)),
        I64Extend32S => RawVal::i64(i64::from(x64 as i32)),

        V128Not => RawVal::from_bits(!a.bits()),
        V128AnyTrue => bool_val(a.bits() != 0),
        I8x16Neg => RawVal::from_bits(map_lanes(a.bits(), 8, u64::wrapping_neg)),
        I32x4Neg => RawVal::from_bits(map_lanes(a.bits(), 32, u64::wrapping_neg)),
        F32x4Neg => RawVal::from_bits(map_lanes(a.bits(), 32, |x| x ^ u64::from(F32_SIGN))),
        F64x2Neg => RawVal::from_bits(map_lanes(a.bits(), 64, |x| x ^ F64_SIGN)),
    }
}

#[expect(clippy::too_many_lines, reason = "big match statement")]
pub(crate) fn binary(op: BinaryOp, a: RawVal, b: RawVal) -> Result<RawVal, Trap> {
    use BinaryOp::*;

    let (a32, b32) = (a.get_i32(), b.get_i32());
    let (a64, b64) = (a.get_i64(), b.get_i64());
    let (u32a, u32b) = (a32 as u32, b32 as u32);
    let (u64a, u64b) = (a64 as u64, b64 as u64);
    let (fa, fb) = (a.get_f32(), b.get_f32());
    let (da, db) = (a.get_f64(), b.get_f64());
    let (va, vb) = (a.bits(), b.bits());

    let result = match op {
        I32Eq => bool_val(a32 == b32),
        I32Ne => bool_val(a32 != b32),
        I32LtS => bool_val(a32 < b32),
        I32LtU => bool_val(u32a < u32b),
        I32GtS => bool_val(a32 > b32),
        I32GtU => bool_val(u32a > u32b),
        I32LeS => bool_val(a32 <= b32),
        I32LeU => bool_val(u32a <= u32b),
        I32GeS => bool_val(a32 >= b32),
        I32GeU => bool_val(u32a >= u32b),
        I64Eq => bool_val(a64 == b64),
        I64Ne => bool_val(a64 != b64),
        I64LtS => bool_val(a64 < b64),
        I64LtU => bool_val(u64a < u64b),
        I64GtS => bool_val(a64 > b64),
        I64GtU => bool_val(u64a > u64b),
        I64LeS => bool_val(a64 <= b64),
        I64LeU => bool_val(u64a <= u64b),
        I64GeS => bool_val(a64 >= b64),
        I64GeU => bool_val(u64a >= u64b),
        F32Eq => bool_val(fa == fb),
        F32Ne => bool_val(fa != fb),
        F32Lt => bool_val(fa < fb),
        F32Gt => bool_val(fa > fb),
        F32Le => bool_val(fa <= fb),
        F32Ge => bool_val(fa >= fb),
        F64Eq => bool_val(da == db),
        F64Ne => bool_val(da != db),
        F64Lt => bool_val(da < db),
        F64Gt => bool_val(da > db),
        F64Le => bool_val(da <= db),
        F64Ge => bool_val(da >= db),

        I32Add => RawVal::i32(a32.wrapping_add(b32)),
        I32Sub => RawVal::i32(a32.wrapping_sub(b32)),
        I32Mul => RawVal::i32(a32.wrapping_mul(b32)),
        I32DivS => {
            if b32 == 0 {
                return Err(Trap::IntegerDivisionByZero);
            }
            RawVal::i32(a32.checked_div(b32).ok_or(Trap::IntegerOverflow)?)
        }
        I32DivU => RawVal::i32(u32a.checked_div(u32b).ok_or(Trap::IntegerDivisionByZero)? as i32),
        I32RemS => {
            if b32 == 0 {
                return Err(Trap::IntegerDivisionByZero);
            }
            RawVal::i32(a32.wrapping_rem(b32))
        }
        I32RemU => RawVal::i32(u32a.checked_rem(u32b).ok_or(Trap::IntegerDivisionByZero)? as i32),
        I32And => RawVal::i32(a32 & b32),
        I32Or => RawVal::i32(a32 | b32),
        I32Xor => RawVal::i32(a32 ^ b32),
        I32Shl => RawVal::i32(a32.wrapping_shl(u32b)),
        I32ShrS => RawVal::i32(a32.wrapping_shr(u32b)),
        I32ShrU => RawVal::i32(u32a.wrapping_shr(u32b) as i32),
        I32Rotl => RawVal::i32(a32.rotate_left(u32b % 32)),
        I32Rotr => RawVal::i32(a32.rotate_right(u32b % 32)),

        I64Add => RawVal::i64(a64.wrapping_add(b64)),
        I64Sub => RawVal::i64(a64.wrapping_sub(b64)),
        I64Mul => RawVal::i64(a64.wrapping_mul(b64)),
        I64DivS => {
            if b64 == 0 {
                return Err(Trap::IntegerDivisionByZero);
            }
            RawVal::i64(a64.checked_div(b64).ok_or(Trap::IntegerOverflow)?)
        }
        I64DivU => RawVal::i64(u64a.checked_div(u64b).ok_or(Trap::IntegerDivisionByZero)? as i64),
        I64RemS => {
            if b64 == 0 {
                return Err(Trap::IntegerDivisionByZero);
            }
            RawVal::i64(a64.wrapping_rem(b64))
        }
        I64RemU => RawVal::i64(u64a.checked_rem(u64b).ok_or(Trap::IntegerDivisionByZero)? as i64),
        I64And => RawVal::i64(a64 & b64),
        I64Or => RawVal::i64(a64 | b64),
        I64Xor => RawVal::i64(a64 ^ b64),
        I64Shl => RawVal::i64(a64.wrapping_shl(u64b as u32)),
        I64ShrS => RawVal::i64(a64.wrapping_shr(u64b as u32)),
        I64ShrU => RawVal::i64(u64a.wrapping_shr(u64b as u32) as i64),
        I64Rotl => RawVal::i64(a64.rotate_left((u64b % 64) as u32)),
        I64Rotr => RawVal::i64(a64.rotate_right((u64b % 64) as u32)),

        F32Add => f32_val(fa + fb),
        F32Sub => f32_val(fa - fb),
        F32Mul => f32_val(fa * fb),
        F32Div => f32_val(fa / fb),
        F32Min => f32_val(fmin32(fa, fb)),
        F32Max => f32_val(fmax32(fa, fb)),
        F32Copysign => RawVal::from_bits(u128::from((u32a & !F32_SIGN) | (u32b & F32_SIGN))),
        F64Add => f64_val(da + db),
        F64Sub => f64_val(da - db),
        F64Mul => f64_val(da * db),
        F64Div => f64_val(da / db),
        F64Min => f64_val(fmin64(da, db)),
        F64Max => f64_val(fmax64(da, db)),
        F64Copysign => RawVal::from_bits(u128::from((u64a & !F64_SIGN) | (u64b & F64_SIGN))),

        V128And => RawVal::from_bits(va & vb),
        V128Or => RawVal::from_bits(va | vb),
        V128Xor => RawVal::from_bits(va ^ vb),
        V128AndNot => RawVal::from_bits(va & !vb),
        I8x16Add => RawVal::from_bits(zip_lanes(va, vb, 8, u64::wrapping_add)),
        I8x16Sub => RawVal::from_bits(zip_lanes(va, vb, 8, u64::wrapping_sub)),
        I8x16Eq => RawVal::from_bits(zip_lanes(va, vb, 8, |x, y| all_ones(x == y))),
        I16x8Add => RawVal::from_bits(zip_lanes(va, vb, 16, u64::wrapping_add)),
        I16x8Sub => RawVal::from_bits(zip_lanes(va, vb, 16, u64::wrapping_sub)),
        I16x8Mul => RawVal::from_bits(zip_lanes(va, vb, 16, u64::wrapping_mul)),
        I32x4Add => RawVal::from_bits(zip_lanes(va, vb, 32, u64::wrapping_add)),
        I32x4Sub => RawVal::from_bits(zip_lanes(va, vb, 32, u64::wrapping_sub)),
        I32x4Mul => RawVal::from_bits(zip_lanes(va, vb, 32, u64::wrapping_mul)),
        I32x4Eq => RawVal::from_bits(zip_lanes(va, vb, 32, |x, y| all_ones(x == y))),
        I64x2Add => RawVal::from_bits(zip_lanes(va, vb, 64, u64::wrapping_add)),
        I64x2Sub => RawVal::from_bits(zip_lanes(va, vb, 64, u64::wrapping_sub)),
        I64x2Mul => RawVal::from_bits(zip_lanes(va, vb, 64, u64::wrapping_mul)),
        F32x4Add => RawVal::from_bits(f32_lanes(va, vb, |x, y| x + y)),
        F32x4Sub => RawVal::from_bits(f32_lanes(va, vb, |x, y| x - y)),
        F32x4Mul => RawVal::from_bits(f32_lanes(va, vb, |x, y| x * y)),
        F32x4Div => RawVal::from_bits(f32_lanes(va, vb, |x, y| x / y)),
        F64x2Add => RawVal::from_bits(f64_lanes(va, vb, |x, y| x + y)),
        F64x2Sub => RawVal::from_bits(f64_lanes(va, vb, |x, y| x - y)),
        F64x2Mul => RawVal::from_bits(f64_lanes(va, vb, |x, y| x * y)),
        F64x2Div => RawVal::from_bits(f64_lanes(va, vb, |x, y| x / y)),
        I8x16Swizzle => {
            let (bytes, indices) = (va.to_le_bytes(), vb.to_le_bytes());
            let out = indices.map(|i| bytes.get(usize::from(i)).copied().unwrap_or(0));
            RawVal::from_bits(u128::from_le_bytes(out))
        }
    };
    Ok(result)
}

/// Truncates `value` towards zero if the result lies in `(min, max)`, which are
/// the exclusive bounds of the target type widened to `f64`.
fn trunc_checked(value: f64, min: f64, max: f64) -> Result<f64, Trap> {
    if value.is_nan() {
        Err(Trap::BadConversionToInteger)
    } else if value <= min || value >= max {
        Err(Trap::IntegerOverflow)
    } else {
        Ok(value.trunc())
    }
}

const I32_MIN_EXCL: f64 = -2_147_483_649.0;
const I32_MAX_EXCL: f64 = 2_147_483_648.0;
const U32_MAX_EXCL: f64 = 4_294_967_296.0;
const I64_MIN_EXCL: f64 = -9_223_372_036_854_777_856.0;
const I64_MAX_EXCL: f64 = 9_223_372_036_854_775_808.0;
const U64_MAX_EXCL: f64 = 18_446_744_073_709_551_616.0;

pub(crate) fn convert(op: ConvertOp, a: RawVal) -> Result<RawVal, Trap> {
    use ConvertOp::*;

    let f = f64::from(a.get_f32());
    let d = a.get_f64();
    let result = match op {
        I32WrapI64 => RawVal::i32(a.get_i64() as i32),
        I64ExtendI32S => RawVal::i64(i64::from(a.get_i32())),
        I64ExtendI32U => RawVal::i64(i64::from(a.get_i32() as u32)),

        I32TruncF32S => RawVal::i32(trunc_checked(f, I32_MIN_EXCL, I32_MAX_EXCL)? as i32),
        I32TruncF32U => RawVal::i32(trunc_checked(f, -1.0, U32_MAX_EXCL)? as u32 as i32),
        I32TruncF64S => RawVal::i32(trunc_checked(d, I32_MIN_EXCL, I32_MAX_EXCL)? as i32),
        I32TruncF64U => RawVal::i32(trunc_checked(d, -1.0, U32_MAX_EXCL)? as u32 as i32),
        I64TruncF32S => RawVal::i64(trunc_checked(f, I64_MIN_EXCL, I64_MAX_EXCL)? as i64),
        I64TruncF32U => RawVal::i64(trunc_checked(f, -1.0, U64_MAX_EXCL)? as u64 as i64),
        I64TruncF64S => RawVal::i64(trunc_checked(d, I64_MIN_EXCL, I64_MAX_EXCL)? as i64),
        I64TruncF64U => RawVal::i64(trunc_checked(d, -1.0, U64_MAX_EXCL)? as u64 as i64),

        // `as` saturates and maps NaN to zero
        I32TruncSatF32S => RawVal::i32(a.get_f32() as i32),
        I32TruncSatF32U => RawVal::i32(a.get_f32() as u32 as i32),
        I32TruncSatF64S => RawVal::i32(d as i32),
        I32TruncSatF64U => RawVal::i32(d as u32 as i32),
        I64TruncSatF32S => RawVal::i64(a.get_f32() as i64),
        I64TruncSatF32U => RawVal::i64(a.get_f32() as u64 as i64),
        I64TruncSatF64S => RawVal::i64(d as i64),
        I64TruncSatF64U => RawVal::i64(d as u64 as i64),

        F32ConvertI32S => f32_val(a.get_i32() as f32),
        F32ConvertI32U => f32_val(a.get_i32() as u32 as f32),
        F32ConvertI64S => f32_val(a.get_i64() as f32),
        F32ConvertI64U => f32_val(a.get_i64() as u64 as f32),
        F64ConvertI32S => f64_val(f64::from(a.get_i32())),
        F64ConvertI32U => f64_val(f64::from(a.get_i32() as u32)),
        F64ConvertI64S => f64_val(a.get_i64() as f64),
        F64ConvertI64U => f64_val(a.get_i64() as u64 as f64),
        F32DemoteF64 => f32_val(d as f32),
        F64PromoteF32 => f64_val(f),

        I32ReinterpretF32 | F32ReinterpretI32 => RawVal::from_bits(a.bits() & u128::from(u32::MAX)),
        I64ReinterpretF64 | F64ReinterpretI64 => RawVal::from_bits(a.bits() & u128::from(u64::MAX)),
    };
    Ok(result)
}

pub(crate) fn select(cond: RawVal, if_true: RawVal, if_false: RawVal) -> RawVal {
    if cond.get_i32() != 0 { if_true } else { if_false }
}

/// Loads a value, `None` if the access is out of bounds.
pub(crate) fn load(memory: &Memory, kind: LoadKind, addr: u64) -> Option<RawVal> {
    use LoadKind::*;

    let value = match kind {
        I32 => RawVal::i32(i32::from_le_bytes(memory.load(addr)?)),
        I64 => RawVal::i64(i64::from_le_bytes(memory.load(addr)?)),
        F32 => RawVal::from_bits(u128::from(u32::from_le_bytes(memory.load(addr)?))),
        F64 => RawVal::from_bits(u128::from(u64::from_le_bytes(memory.load(addr)?))),
        I32S8 => RawVal::i32(i32::from(i8::from_le_bytes(memory.load(addr)?))),
        I32U8 => RawVal::i32(i32::from(u8::from_le_bytes(memory.load(addr)?))),
        I32S16 => RawVal::i32(i32::from(i16::from_le_bytes(memory.load(addr)?))),
        I32U16 => RawVal::i32(i32::from(u16::from_le_bytes(memory.load(addr)?))),
        I64S8 => RawVal::i64(i64::from(i8::from_le_bytes(memory.load(addr)?))),
        I64U8 => RawVal::i64(i64::from(u8::from_le_bytes(memory.load(addr)?))),
        I64S16 => RawVal::i64(i64::from(i16::from_le_bytes(memory.load(addr)?))),
        I64U16 => RawVal::i64(i64::from(u16::from_le_bytes(memory.load(addr)?))),
        I64S32 => RawVal::i64(i64::from(i32::from_le_bytes(memory.load(addr)?))),
        I64U32 => RawVal::i64(i64::from(u32::from_le_bytes(memory.load(addr)?))),
        V128 => RawVal::from_bits(u128::from_le_bytes(memory.load(addr)?)),
    };
    Some(value)
}

/// Stores the low bytes of `value`, returning `false` if the access is out of bounds.
pub(crate) fn store(memory: &Memory, kind: StoreKind, addr: u64, value: RawVal) -> bool {
    let bytes = value.bits().to_le_bytes();
    memory.store(addr, &bytes[..kind.width() as usize])
}

pub(crate) fn splat(shape: LaneShape, a: RawVal) -> RawVal {
    let bits = shape.lane_bits();
    let lane = a.bits() as u64 & lane_mask(bits);
    RawVal::from_bits(map_lanes(0, bits, |_| lane))
}

pub(crate) fn extract_lane(shape: LaneShape, signed: bool, lane: u8, vector: RawVal) -> RawVal {
    let bits = shape.lane_bits();
    let raw = (vector.bits() >> (u32::from(lane) * bits)) as u64 & lane_mask(bits);
    match (shape, signed) {
        (LaneShape::I8x16, true) => RawVal::i32(i32::from(raw as u8 as i8)),
        (LaneShape::I16x8, true) => RawVal::i32(i32::from(raw as u16 as i16)),
        _ => RawVal::from_bits(u128::from(raw)),
    }
}

pub(crate) fn replace_lane(shape: LaneShape, lane: u8, vector: RawVal, value: RawVal) -> RawVal {
    let bits = shape.lane_bits();
    let shift = u32::from(lane) * bits;
    let mask = u128::from(lane_mask(bits)) << shift;
    let lane_value = (value.bits() << shift) & mask;
    RawVal::from_bits((vector.bits() & !mask) | lane_value)
}

pub(crate) fn shuffle(a: RawVal, b: RawVal, lanes: [u8; 16]) -> RawVal {
    let (a, b) = (a.bits().to_le_bytes(), b.bits().to_le_bytes());
    let out = lanes.map(|lane| {
        let lane = usize::from(lane);
        if lane < 16 {
            a[lane]
        } else {
            b.get(lane - 16).copied().unwrap_or(0)
        }
    });
    RawVal::from_bits(u128::from_le_bytes(out))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn i32s(a: i32, b: i32, op: BinaryOp) -> Result<i32, Trap> {
        binary(op, RawVal::i32(a), RawVal::i32(b)).map(RawVal::get_i32)
    }

    #[test]
    fn division_traps() {
        assert_eq!(i32s(1, 0, BinaryOp::I32DivS), Err(Trap::IntegerDivisionByZero));
        assert_eq!(i32s(i32::MIN, -1, BinaryOp::I32DivS), Err(Trap::IntegerOverflow));
        assert_eq!(i32s(i32::MIN, -1, BinaryOp::I32RemS), Ok(0));
        assert_eq!(i32s(-7, 2, BinaryOp::I32DivU), Ok(((-7i32 as u32) / 2) as i32));
        assert_eq!(i32s(1, 0, BinaryOp::I32RemU), Err(Trap::IntegerDivisionByZero));
    }

    #[test]
    fn float_min_max_follow_wasm() {
        let min = binary(BinaryOp::F32Min, f32_val(0.0), f32_val(-0.0)).unwrap();
        assert_eq!(min.get_f32().to_bits(), (-0.0f32).to_bits());
        let max = binary(BinaryOp::F64Max, f64_val(-0.0), f64_val(0.0)).unwrap();
        assert_eq!(max.get_f64().to_bits(), 0.0f64.to_bits());
        assert!(binary(BinaryOp::F64Min, f64_val(f64::NAN), f64_val(1.0)).unwrap().get_f64().is_nan());
    }

    #[test]
    fn trapping_truncation() {
        let trunc = |op, v: f64| convert(op, f64_val(v)).map(RawVal::get_i32);
        assert_eq!(trunc(ConvertOp::I32TruncF64S, -2_147_483_648.9), Ok(i32::MIN));
        assert_eq!(trunc(ConvertOp::I32TruncF64S, 2_147_483_648.0), Err(Trap::IntegerOverflow));
        assert_eq!(trunc(ConvertOp::I32TruncF64U, -0.9), Ok(0));
        assert_eq!(trunc(ConvertOp::I32TruncF64U, -1.0), Err(Trap::IntegerOverflow));
        assert_eq!(trunc(ConvertOp::I32TruncF64S, f64::NAN), Err(Trap::BadConversionToInteger));

        let f = convert(ConvertOp::I64TruncF32S, f32_val(-9_223_372_036_854_775_808.0)).unwrap();
        assert_eq!(f.get_i64(), i64::MIN);
    }

    #[test]
    fn lanes() {
        let v = splat(LaneShape::I16x8, RawVal::i32(-1));
        assert_eq!(v.bits(), u128::MAX);
        let v = replace_lane(LaneShape::I32x4, 2, RawVal::ZERO, RawVal::i32(7));
        assert_eq!(extract_lane(LaneShape::I32x4, false, 2, v).get_i32(), 7);
        assert_eq!(extract_lane(LaneShape::I8x16, true, 8, v).get_i32(), 7);
        let v = splat(LaneShape::I8x16, RawVal::i32(0x80));
        assert_eq!(extract_lane(LaneShape::I8x16, true, 3, v).get_i32(), -128);
        assert_eq!(extract_lane(LaneShape::I8x16, false, 3, v).get_i32(), 128);

        let a = RawVal::from_bits(u128::from_le_bytes(core::array::from_fn(|i| i as u8)));
        let b = RawVal::from_bits(u128::from_le_bytes(core::array::from_fn(|i| 16 + i as u8)));
        let reversed = shuffle(a, b, core::array::from_fn(|i| 31 - i as u8));
        assert_eq!(reversed.bits().to_le_bytes()[0], 31);
        assert_eq!(reversed.bits().to_le_bytes()[15], 16);
    }

    proptest! {
        #[test]
        fn i32_arithmetic_wraps(a: i32, b: i32) {
            prop_assert_eq!(i32s(a, b, BinaryOp::I32Add), Ok(a.wrapping_add(b)));
            prop_assert_eq!(i32s(a, b, BinaryOp::I32Mul), Ok(a.wrapping_mul(b)));
            prop_assert_eq!(i32s(a, b, BinaryOp::I32Shl), Ok(a << (b & 31)));
            prop_assert_eq!(i32s(a, b, BinaryOp::I32Rotl), Ok(a.rotate_left(b as u32 & 31)));
        }

        #[test]
        fn saturating_truncation_never_traps(bits: u64) {
            let value = RawVal::from_bits(u128::from(bits));
            let sat = convert(ConvertOp::I64TruncSatF64S, value).unwrap();
            prop_assert_eq!(sat.get_i64(), f64::from_bits(bits) as i64);
            if let Ok(exact) = convert(ConvertOp::I64TruncF64S, value) {
                prop_assert_eq!(exact, sat);
            }
        }

        #[test]
        fn lane_arithmetic_matches_scalar(a: [i32; 4], b: [i32; 4]) {
            let pack = |v: [i32; 4]| RawVal::from_bits(v.iter().rev().fold(0u128, |acc, x| (acc << 32) | u128::from(*x as u32)));
            let sum = binary(BinaryOp::I32x4Add, pack(a), pack(b)).unwrap();
            for lane in 0..4 {
                let got = extract_lane(LaneShape::I32x4, false, lane, sum).get_i32();
                prop_assert_eq!(got, a[lane as usize].wrapping_add(b[lane as usize]));
            }
        }

        #[test]
        fn slots_stay_zero_extended(a: i32, b: i32) {
            let result = binary(BinaryOp::I32Sub, RawVal::i32(a), RawVal::i32(b)).unwrap();
            prop_assert_eq!(result.bits() >> 32, 0);
        }
    }
}
