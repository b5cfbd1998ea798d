// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::collections::TryReserveError;

use crate::indices::FuncIndex;
use crate::trap::Trap;

/// Convenience macro for creating an `Error::Unsupported` variant.
#[macro_export]
macro_rules! wasm_unsupported {
    ($($arg:tt)*) => { $crate::Error::Unsupported(::std::format!($($arg)*)) }
}

/// Error type for the crate
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The input WebAssembly code is invalid.
    #[error("invalid WASM input at {offset}: {message}")]
    InvalidWebAssembly {
        /// A string describing the validation error.
        message: String,
        /// The bytecode offset where the error occurred.
        offset: usize,
    },
    /// A declaration pushed the module past one of the configured [`Limits`](crate::Limits).
    #[error("too many {what} (the limit is {max})")]
    LimitExceeded { what: &'static str, max: u64 },
    /// The WebAssembly code used an unsupported feature.
    #[error("Feature used by the WebAssembly code is not supported: {0}")]
    Unsupported(String),
    /// An allocation failed.
    #[error("out of memory")]
    OutOfMemory,
    /// A piece of generated code is larger than the backend's relative branch range.
    #[error("code for {0} does not fit into the branch range of the backend")]
    CodeTooLarge(String),
    /// A WebAssembly trap occurred.
    #[error("{0}")]
    Trap(TrapInfo),
    /// A host function called through an import failed.
    #[error("host function failed: {0:#}")]
    Host(anyhow::Error),
    /// The module could not be instantiated with the provided imports.
    #[error("instantiation failed: {0}")]
    Instantiation(String),
    /// A value could not be coerced to the declared WebAssembly type.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    /// There is no export with the given name.
    #[error("unknown export `{0}`")]
    UnknownExport(String),
    /// A serialized module was malformed.
    #[error("failed to deserialize module: {0}")]
    Deserialize(String),
    /// A module could not be serialized.
    #[error("failed to serialize module")]
    Serialize(#[from] bincode::Error),
    /// An invariant of generated code was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Describes where a trap happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrapInfo {
    /// The trap that occurred.
    pub trap: Trap,
    /// The function containing the faulting instruction, if the trap came from a function body.
    pub func_index: Option<FuncIndex>,
    /// Offset of the faulting instruction in the module bytecode.
    pub bytecode_offset: Option<u32>,
}

// ===== impl Error =====

impl Error {
    /// Returns the trap kind if this error is a WebAssembly trap.
    pub fn trap(&self) -> Option<Trap> {
        match self {
            Error::Trap(info) => Some(info.trap),
            _ => None,
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }
}

impl From<wasmparser::BinaryReaderError> for Error {
    fn from(e: wasmparser::BinaryReaderError) -> Self {
        Self::InvalidWebAssembly {
            message: e.message().into(),
            offset: e.offset(),
        }
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

// ===== impl TrapInfo =====

impl fmt::Display for TrapInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wasm trap: {}", self.trap)?;
        if let Some(func_index) = self.func_index {
            write!(f, " in function {}", func_index.as_u32())?;
        }
        if let Some(offset) = self.bytecode_offset {
            write!(f, " at bytecode offset {offset:#x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_display_mentions_location() {
        let err = Error::Trap(TrapInfo {
            trap: Trap::IntegerDivisionByZero,
            func_index: Some(FuncIndex::from_u32(3)),
            bytecode_offset: Some(0x2a),
        });
        assert_eq!(
            err.to_string(),
            "wasm trap: integer divide by zero in function 3 at bytecode offset 0x2a"
        );
        assert_eq!(err.trap(), Some(Trap::IntegerDivisionByZero));
    }

    #[test]
    fn host_errors_are_not_traps() {
        let err = Error::Host(anyhow::anyhow!("boom"));
        assert!(err.trap().is_none());
        assert_eq!(err.to_string(), "host function failed: boom");
    }
}
