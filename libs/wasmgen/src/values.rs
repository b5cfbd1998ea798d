// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use static_assertions::const_assert_eq;

use crate::types::ValType;
use crate::utils::enum_accessors;
use crate::{Error, Result};

/// Possible runtime values that a WebAssembly module can either consume or
/// produce.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Val {
    /// A 32-bit integer.
    I32(i32),

    /// A 64-bit integer.
    I64(i64),

    /// A 32-bit float.
    ///
    /// Note that the raw bits of the float are stored here, and you can use
    /// `f32::from_bits` to create an `f32` value.
    F32(u32),

    /// A 64-bit float.
    ///
    /// Note that the raw bits of the float are stored here, and you can use
    /// `f64::from_bits` to create an `f64` value.
    F64(u64),

    /// A 128-bit vector.
    V128(u128),
}

/// One fixed-width argument slot of the generated code's calling convention.
///
/// Every value, regardless of type, occupies exactly 16 bytes. Narrower values
/// live in the low bytes and the rest of the slot is zero.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(C, align(16))]
pub struct RawVal(u128);

const_assert_eq!(size_of::<RawVal>(), 16);

/// The object produced by calling an export as a constructor.
///
/// Constructor calls discard the primitive result of the function, so this is
/// always a fresh object without properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostObject {
    properties: Vec<(String, Val)>,
}

// ===== impl Val =====

impl Val {
    enum_accessors! {
        e
        (I32(i32) is_i32 get_i32 unwrap_i32 *e)
        (I64(i64) is_i64 get_i64 unwrap_i64 *e)
        (F32(f32) is_f32 get_f32 unwrap_f32 f32::from_bits(*e))
        (F64(f64) is_f64 get_f64 unwrap_f64 f64::from_bits(*e))
        (V128(u128) is_v128 get_v128 unwrap_v128 *e)
    }

    /// Returns the default value for the given type.
    pub fn default_for_ty(ty: ValType) -> Val {
        match ty {
            ValType::I32 => Val::I32(0),
            ValType::I64 => Val::I64(0),
            ValType::F32 => Val::F32(0),
            ValType::F64 => Val::F64(0),
            ValType::V128 => Val::V128(0),
        }
    }

    /// Returns the corresponding [`ValType`] for this `Val`.
    pub fn ty(&self) -> ValType {
        match self {
            Val::I32(_) => ValType::I32,
            Val::I64(_) => ValType::I64,
            Val::F32(_) => ValType::F32,
            Val::F64(_) => ValType::F64,
            Val::V128(_) => ValType::V128,
        }
    }

    /// Converts this value to the declared type `ty` the way an embedder argument
    /// is converted at the module boundary.
    ///
    /// Numbers convert freely between `i32`, `f32` and `f64` (with `ToInt32`
    /// semantics for the integer direction). `i64` and `v128` values are only
    /// accepted as themselves.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeMismatch`] when no conversion exists.
    pub fn coerce_to(self, ty: ValType) -> Result<Val> {
        let coerced = match (ty, self) {
            (ValType::I32, Val::I32(_))
            | (ValType::I64, Val::I64(_))
            | (ValType::F32, Val::F32(_))
            | (ValType::F64, Val::F64(_))
            | (ValType::V128, Val::V128(_)) => self,

            (ValType::I32, Val::F32(bits)) => Val::I32(to_int32(f64::from(f32::from_bits(bits)))),
            (ValType::I32, Val::F64(bits)) => Val::I32(to_int32(f64::from_bits(bits))),

            (ValType::F32, Val::I32(v)) => Val::F32((v as f32).to_bits()),
            (ValType::F32, Val::F64(bits)) => Val::F32((f64::from_bits(bits) as f32).to_bits()),
            (ValType::F64, Val::I32(v)) => Val::F64(f64::from(v).to_bits()),
            (ValType::F64, Val::F32(bits)) => Val::F64(f64::from(f32::from_bits(bits)).to_bits()),

            (ty, val) => {
                return Err(Error::TypeMismatch(format!(
                    "cannot convert {} value to {ty}",
                    val.ty()
                )));
            }
        };
        Ok(coerced)
    }
}

/// The ECMAScript `ToInt32` conversion: truncate, wrap modulo 2^32, map NaN and
/// infinities to zero.
fn to_int32(value: f64) -> i32 {
    if !value.is_finite() {
        return 0;
    }
    let wrapped = value.trunc().rem_euclid(4_294_967_296.0);
    // `wrapped` lies in [0, 2^32) so the conversion is exact
    (wrapped as u64 as u32) as i32
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::I32(v) => write!(f, "{v}"),
            Val::I64(v) => write!(f, "{v}"),
            Val::F32(bits) => write!(f, "{}", f32::from_bits(*bits)),
            Val::F64(bits) => write!(f, "{}", f64::from_bits(*bits)),
            Val::V128(v) => write!(f, "{v:#034x}"),
        }
    }
}

impl From<i32> for Val {
    #[inline]
    fn from(val: i32) -> Val {
        Val::I32(val)
    }
}

impl From<i64> for Val {
    #[inline]
    fn from(val: i64) -> Val {
        Val::I64(val)
    }
}

impl From<f32> for Val {
    #[inline]
    fn from(val: f32) -> Val {
        Val::F32(val.to_bits())
    }
}

impl From<f64> for Val {
    #[inline]
    fn from(val: f64) -> Val {
        Val::F64(val.to_bits())
    }
}

impl From<u128> for Val {
    #[inline]
    fn from(val: u128) -> Val {
        Val::V128(val)
    }
}

// ===== impl RawVal =====

impl RawVal {
    pub const ZERO: RawVal = RawVal(0);

    /// The value an absent embedder argument of type `ty` converts to: NaN for
    /// floats, zero for everything else.
    pub fn absent(ty: ValType) -> Self {
        match ty {
            ValType::F32 => Self::f32(f32::NAN),
            ValType::F64 => Self::f64(f64::NAN),
            ValType::I32 | ValType::I64 | ValType::V128 => Self::ZERO,
        }
    }

    #[inline]
    pub fn from_bits(bits: u128) -> Self {
        Self(bits)
    }

    #[inline]
    pub fn bits(self) -> u128 {
        self.0
    }

    #[inline]
    pub fn i32(value: i32) -> Self {
        Self(u128::from(value as u32))
    }

    #[inline]
    pub fn i64(value: i64) -> Self {
        Self(u128::from(value as u64))
    }

    #[inline]
    pub fn f32(value: f32) -> Self {
        Self(u128::from(value.to_bits()))
    }

    #[inline]
    pub fn f64(value: f64) -> Self {
        Self(u128::from(value.to_bits()))
    }

    #[inline]
    pub fn get_i32(self) -> i32 {
        self.0 as u32 as i32
    }

    #[inline]
    pub fn get_i64(self) -> i64 {
        self.0 as u64 as i64
    }

    #[inline]
    pub fn get_f32(self) -> f32 {
        f32::from_bits(self.0 as u32)
    }

    #[inline]
    pub fn get_f64(self) -> f64 {
        f64::from_bits(self.0 as u64)
    }

    /// Reads the slot as a value of type `ty`.
    pub fn to_val(self, ty: ValType) -> Val {
        match ty {
            ValType::I32 => Val::I32(self.get_i32()),
            ValType::I64 => Val::I64(self.get_i64()),
            ValType::F32 => Val::F32(self.0 as u32),
            ValType::F64 => Val::F64(self.0 as u64),
            ValType::V128 => Val::V128(self.0),
        }
    }
}

impl From<Val> for RawVal {
    fn from(val: Val) -> Self {
        match val {
            Val::I32(v) => RawVal::i32(v),
            Val::I64(v) => RawVal::i64(v),
            Val::F32(bits) => RawVal(u128::from(bits)),
            Val::F64(bits) => RawVal(u128::from(bits)),
            Val::V128(v) => RawVal(v),
        }
    }
}

impl fmt::Debug for RawVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawVal({:#x})", self.0)
    }
}

// ===== impl HostObject =====

impl HostObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Val> {
        self.properties
            .iter()
            .find_map(|(key, val)| (key == name).then_some(*val))
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_coerce_to_int32() {
        assert_eq!(Val::from(3.9f64).coerce_to(ValType::I32).unwrap(), Val::I32(3));
        assert_eq!(Val::from(-3.9f32).coerce_to(ValType::I32).unwrap(), Val::I32(-3));
        assert_eq!(
            Val::from(4_294_967_297.0f64).coerce_to(ValType::I32).unwrap(),
            Val::I32(1)
        );
        assert_eq!(Val::from(2_147_483_648.0f64).coerce_to(ValType::I32).unwrap(), Val::I32(i32::MIN));
        assert_eq!(Val::from(f64::NAN).coerce_to(ValType::I32).unwrap(), Val::I32(0));
        assert_eq!(Val::from(f64::INFINITY).coerce_to(ValType::I32).unwrap(), Val::I32(0));
    }

    #[test]
    fn numbers_coerce_to_floats() {
        assert_eq!(Val::I32(7).coerce_to(ValType::F64).unwrap(), Val::from(7.0f64));
        assert_eq!(Val::from(1.5f64).coerce_to(ValType::F32).unwrap(), Val::from(1.5f32));
    }

    #[test]
    fn i64_and_v128_only_accept_themselves() {
        assert!(matches!(
            Val::I32(1).coerce_to(ValType::I64),
            Err(Error::TypeMismatch(_))
        ));
        assert!(Val::I64(1).coerce_to(ValType::F64).is_err());
        assert!(Val::from(1.0f64).coerce_to(ValType::V128).is_err());
        assert_eq!(Val::I64(-1).coerce_to(ValType::I64).unwrap(), Val::I64(-1));
    }

    #[test]
    fn raw_slots_zero_extend() {
        let raw = RawVal::from(Val::I32(-1));
        assert_eq!(raw.bits(), 0xffff_ffff);
        assert_eq!(raw.to_val(ValType::I32), Val::I32(-1));
        assert_eq!(RawVal::from(Val::I64(-2)).to_val(ValType::I64), Val::I64(-2));
        assert_eq!(RawVal::f64(0.5).get_f64(), 0.5);
    }

    #[test]
    fn constructed_objects_are_empty() {
        let obj = HostObject::new();
        assert!(obj.is_empty());
        assert!(obj.get("x").is_none());
    }
}
