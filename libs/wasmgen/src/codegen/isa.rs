// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Instruction encoding of the portable backend.
//!
//! Every instruction is an [`Opcode`] byte followed by fixed little-endian
//! operands. Operands naming a value are frame slot indices. Branch and call
//! displacements are signed and relative to the first byte of the instruction,
//! stub and thunk targets are absolute code offsets filled in by the linker.
//!
//! ```text
//! ProfilingEnter func:u32
//! Prologue       frame_size:u32 overflow_stub:abs
//! CheckInterrupt symbol:sym interrupt_stub:abs
//! Const          dst bits:u128
//! Unary          op:u8 dst src
//! Binary         op:u8 dst a b
//! Convert        op:u8 dst src
//! Select         dst cond if_true if_false
//! Load           kind:u8 dst addr offset:u32 oob_stub:abs
//! Store          kind:u8 addr src offset:u32 oob_stub:abs
//! GlobalGet      ty:u8 dst global_data_offset:u32
//! GlobalSet      ty:u8 global_data_offset:u32 src
//! MemorySize     symbol:sym dst
//! MemoryGrow     symbol:sym dst delta
//! Splat          shape:u8 dst src
//! ExtractLane    shape:u8 signed:u8 lane:u8 dst src
//! ReplaceLane    shape:u8 lane:u8 dst vector value
//! Shuffle        dst a b lanes:[u8; 16]
//! Jump           rel:i32 moves
//! BrIf           cond rel:i32 moves rel:i32 moves
//! BrTable        index count:u32 (rel:i32 moves)*count default_rel:i32 moves
//! Return         src|NONE
//! Trap           code:u8
//! Call           rel:i32 args dst|NONE
//! CallImport     exit_record:u32 args dst|NONE
//! CallIndirect   table_data:u32 sig_data:u32 index args dst|NONE
//! JumpFar        target:abs
//! EntryPrologue  nargs:u32
//! EntryReturn    src|NONE
//! ExitInterp     symbol:sym import:u32 nargs:u32 throw_stub:abs
//! ExitJit        symbol:sym import:u32 nargs:u32 throw_stub:abs
//! TrapExit       code:u8
//! Unwind
//!
//! moves := count:u32 (dst src)*count
//! args  := count:u32 src*count
//! ```

use crate::utils::byte_enum;
use crate::{Error, Result};

/// Marks an absent slot operand, e.g. the destination of a call without result.
pub const NONE: u32 = u32::MAX;
/// Value of an absolute or symbolic operand that has not been linked yet.
pub const UNLINKED: u32 = u32::MAX;

byte_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Opcode {
        Prologue,
        CheckInterrupt,
        Const,
        Unary,
        Binary,
        Convert,
        Select,
        Load,
        Store,
        GlobalGet,
        GlobalSet,
        MemorySize,
        MemoryGrow,
        Splat,
        ExtractLane,
        ReplaceLane,
        Shuffle,
        Jump,
        BrIf,
        BrTable,
        Return,
        Trap,
        Call,
        CallImport,
        CallIndirect,
        JumpFar,
        EntryPrologue,
        EntryReturn,
        ExitInterp,
        ExitJit,
        TrapExit,
        Unwind,
        ProfilingEnter,
    }
}

/// Size in bytes of the profiling entry preceding every function's regular entry.
pub const PROFILING_ENTRY_SIZE: u32 = 5;

/// Size in bytes of a far-jump thunk.
pub const THUNK_SIZE: u32 = 5;

/// Append-only code emitter.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset of the next byte to be emitted.
    pub fn offset(&self) -> u32 {
        // chunks are bounded by the backend's branch range which fits in u32
        self.bytes.len() as u32
    }

    pub fn op(&mut self, op: Opcode) {
        self.bytes.push(op.to_u8());
    }

    pub fn u8(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    pub fn u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn u128(&mut self, value: u128) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Emits a placeholder operand and returns its offset for later patching.
    pub fn placeholder(&mut self) -> u32 {
        let at = self.offset();
        self.u32(UNLINKED);
        at
    }

    pub fn patch_i32(&mut self, at: u32, value: i32) {
        let at = at as usize;
        self.bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

/// Writes a little-endian `u32` into already emitted code.
pub fn write_u32(code: &mut [u8], at: u32, value: u32) -> Result<()> {
    let at = at as usize;
    let slot = code
        .get_mut(at..at + 4)
        .ok_or_else(|| Error::internal(format!("patch site {at:#x} out of bounds")))?;
    slot.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Decoding cursor used by the executor.
pub struct CodeReader<'a> {
    code: &'a [u8],
    pos: usize,
}

impl<'a> CodeReader<'a> {
    pub fn new(code: &'a [u8], pos: usize) -> Self {
        Self { code, pos }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self
            .code
            .get(self.pos..self.pos + N)
            .and_then(|bytes| <[u8; N]>::try_from(bytes).ok())
            .ok_or_else(|| Error::internal(format!("truncated instruction at {:#x}", self.pos)))?;
        self.pos += N;
        Ok(bytes)
    }

    pub fn opcode(&mut self) -> Result<Opcode> {
        let at = self.pos;
        let [byte] = self.take::<1>()?;
        Opcode::from_u8(byte)
            .ok_or_else(|| Error::internal(format!("invalid opcode {byte:#x} at {at:#x}")))
    }

    pub fn u8(&mut self) -> Result<u8> {
        let [byte] = self.take::<1>()?;
        Ok(byte)
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    pub fn i32(&mut self) -> Result<i32> {
        self.take::<4>().map(i32::from_le_bytes)
    }

    pub fn u128(&mut self) -> Result<u128> {
        self.take::<16>().map(u128::from_le_bytes)
    }

    pub fn lanes(&mut self) -> Result<[u8; 16]> {
        self.take::<16>()
    }

    /// Reads an absolute operand, failing if it was never linked.
    pub fn abs(&mut self) -> Result<usize> {
        let at = self.pos;
        match self.u32()? {
            UNLINKED => Err(Error::internal(format!("unlinked operand at {at:#x}"))),
            target => Ok(target as usize),
        }
    }

    /// Skips a move list, returning its position so it can be read later.
    pub fn skip_moves(&mut self) -> Result<usize> {
        let start = self.pos;
        let count = self.u32()? as usize;
        self.pos += count * 8;
        Ok(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_operands() {
        let mut buf = CodeBuffer::new();
        buf.op(Opcode::Const);
        buf.u32(3);
        buf.u128(0xdead_beef);
        let at = buf.placeholder();
        buf.patch_i32(at, -16);

        let code = buf.finish();
        let mut reader = CodeReader::new(&code, 0);
        assert_eq!(reader.opcode().unwrap(), Opcode::Const);
        assert_eq!(reader.u32().unwrap(), 3);
        assert_eq!(reader.u128().unwrap(), 0xdead_beef);
        assert_eq!(reader.i32().unwrap(), -16);
        assert!(reader.u8().is_err());
    }

    #[test]
    fn unlinked_operands_are_rejected() {
        let mut buf = CodeBuffer::new();
        buf.placeholder();
        let mut code = buf.finish();
        assert!(CodeReader::new(&code, 0).abs().is_err());

        write_u32(&mut code, 0, 42).unwrap();
        assert_eq!(CodeReader::new(&code, 0).abs().unwrap(), 42);
        assert!(write_u32(&mut code, 2, 0).is_err());
    }
}
