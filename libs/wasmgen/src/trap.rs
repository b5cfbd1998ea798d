// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Trap {
    /// The current stack space was exhausted.
    StackOverflow,
    /// An out-of-bounds memory access.
    MemoryOutOfBounds,
    /// Out-of-bounds access to a table.
    TableOutOfBounds,
    /// Indirect call to a null table entry.
    IndirectCallToNull,
    /// Signature mismatch on indirect call.
    BadSignature,
    /// An integer arithmetic operation caused an overflow.
    IntegerOverflow,
    /// An integer division by zero.
    IntegerDivisionByZero,
    /// Failed float-to-int conversion.
    BadConversionToInteger,
    /// Code that was supposed to have been unreachable was reached.
    UnreachableCodeReached,
    /// Execution was interrupted through an [`InterruptHandle`](crate::InterruptHandle).
    Interrupted,
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trap::StackOverflow => f.write_str("call stack exhausted"),
            Trap::MemoryOutOfBounds => f.write_str("out of bounds memory access"),
            Trap::TableOutOfBounds => f.write_str("out of bounds table access"),
            Trap::IndirectCallToNull => f.write_str("accessed uninitialized table element"),
            Trap::BadSignature => f.write_str("indirect call signature mismatch"),
            Trap::IntegerOverflow => f.write_str("integer overflow"),
            Trap::IntegerDivisionByZero => f.write_str("integer divide by zero"),
            Trap::BadConversionToInteger => f.write_str("invalid conversion to integer"),
            Trap::UnreachableCodeReached => f.write_str("unreachable code executed"),
            Trap::Interrupted => f.write_str("interrupted"),
        }
    }
}

impl core::error::Error for Trap {}

impl From<Trap> for u8 {
    fn from(value: Trap) -> Self {
        match value {
            Trap::StackOverflow => 0,
            Trap::MemoryOutOfBounds => 1,
            Trap::TableOutOfBounds => 2,
            Trap::IndirectCallToNull => 3,
            Trap::BadSignature => 4,
            Trap::IntegerOverflow => 5,
            Trap::IntegerDivisionByZero => 6,
            Trap::BadConversionToInteger => 7,
            Trap::UnreachableCodeReached => 8,
            Trap::Interrupted => 9,
        }
    }
}

impl TryFrom<u8> for Trap {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::StackOverflow),
            1 => Ok(Self::MemoryOutOfBounds),
            2 => Ok(Self::TableOutOfBounds),
            3 => Ok(Self::IndirectCallToNull),
            4 => Ok(Self::BadSignature),
            5 => Ok(Self::IntegerOverflow),
            6 => Ok(Self::IntegerDivisionByZero),
            7 => Ok(Self::BadConversionToInteger),
            8 => Ok(Self::UnreachableCodeReached),
            9 => Ok(Self::Interrupted),
            _ => Err(()),
        }
    }
}
