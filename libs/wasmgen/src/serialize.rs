// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Persisted form of a [`Module`].
//!
//! ```text
//! header := magic:[u8; 4] version:u32 max_branch_range:u32
//! block  := tag:u8 len:u64 payload:[u8; len]
//! module := header Metadata Code LinkData Imports Exports DataSegments Bytecode
//! ```
//!
//! Integers are little-endian. The code block holds the raw unlinked code, all
//! other payloads are `bincode` encoded.

use bincode::Options;
use cranelift_entity::EntityRef;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::module::{Metadata, Module, ModuleParts};
use crate::utils::byte_enum;
use crate::{Engine, Error, Result};

const MAGIC: [u8; 4] = *b"\0wgm";
const FORMAT_VERSION: u32 = 2;

byte_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum BlockTag {
        Metadata,
        Code,
        LinkData,
        Imports,
        Exports,
        DataSegments,
        Bytecode,
    }
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
}

struct Writer {
    out: Vec<u8>,
}

impl Writer {
    fn raw_block(&mut self, tag: BlockTag, payload: &[u8]) -> Result<()> {
        self.out.try_reserve(1 + 8 + payload.len())?;
        self.out.push(tag.to_u8());
        self.out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        self.out.extend_from_slice(payload);
        Ok(())
    }

    fn block<T: Serialize>(&mut self, tag: BlockTag, value: &T) -> Result<()> {
        let payload = options().serialize(value)?;
        self.raw_block(tag, &payload)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.bytes.len() {
            return Err(Error::Deserialize(format!(
                "unexpected end of input, {len} bytes needed but only {} left",
                self.bytes.len()
            )));
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32> {
        let mut bytes = [0; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(bytes))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut bytes = [0; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(bytes))
    }

    fn raw_block(&mut self, tag: BlockTag) -> Result<&'a [u8]> {
        let found = self.take(1)?[0];
        if found != tag.to_u8() {
            let found = BlockTag::from_u8(found)
                .map_or_else(|| format!("unknown tag {found}"), |found| format!("{found:?}"));
            return Err(Error::Deserialize(format!(
                "expected {tag:?} block, found {found}"
            )));
        }
        let len = usize::try_from(self.u64()?)
            .map_err(|_| Error::Deserialize(format!("{tag:?} block too large")))?;
        self.take(len)
    }

    fn block<T: DeserializeOwned>(&mut self, tag: BlockTag) -> Result<T> {
        let payload = self.raw_block(tag)?;
        options()
            .deserialize(payload)
            .map_err(|err| Error::Deserialize(format!("malformed {tag:?} block: {err}")))
    }
}

/// Checks that every index stored in `metadata` refers to a declared entity,
/// instantiation indexes with them unchecked.
fn check_indices(metadata: &Metadata) -> Result<()> {
    let env = &metadata.env;
    let bad = |what: &str, index: u32| {
        Err(Error::Deserialize(format!("{what} index {index} is out of range")))
    };

    for sig in env.funcs.values().chain(&metadata.indirect_sigs) {
        if sig.index() >= env.sigs.len() {
            return bad("signature", sig.as_u32());
        }
    }
    let funcs = metadata
        .elem_segments
        .iter()
        .flat_map(|segment| segment.funcs.iter().flatten())
        .chain(&metadata.start);
    for func in funcs {
        if func.index() >= env.funcs.len() {
            return bad("function", func.as_u32());
        }
    }
    Ok(())
}

// ===== impl Module =====

impl Module {
    /// Serializes the module into a self-contained byte buffer.
    ///
    /// # Errors
    ///
    /// Fails if an allocation fails or a part of the module cannot be encoded.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut writer = Writer { out: Vec::new() };
        writer.out.extend_from_slice(&MAGIC);
        writer.out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        writer
            .out
            .extend_from_slice(&self.engine().backend().max_branch_range().to_le_bytes());

        writer.block(BlockTag::Metadata, self.metadata())?;
        writer.raw_block(BlockTag::Code, self.code())?;
        writer.block(BlockTag::LinkData, self.link_data())?;
        writer.block(BlockTag::Imports, self.import_map())?;
        writer.block(BlockTag::Exports, self.export_data())?;
        writer.block(BlockTag::DataSegments, &self.data_segments())?;
        writer.block(BlockTag::Bytecode, &self.bytecode())?;

        tracing::debug!("serialized module into {} bytes", writer.out.len());
        Ok(writer.out)
    }

    /// Restores a module produced by [`Module::serialize`] for use with `engine`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Deserialize`] if the input is truncated, its blocks are
    /// out of order, it carries trailing bytes, or it was produced for a backend
    /// with a different branch range or interrupt mode.
    pub fn deserialize(engine: &Engine, bytes: &[u8]) -> Result<Module> {
        let mut reader = Reader { bytes };

        if reader.take(MAGIC.len())? != MAGIC {
            return Err(Error::Deserialize("not a serialized module".into()));
        }
        let version = reader.u32()?;
        if version != FORMAT_VERSION {
            return Err(Error::Deserialize(format!(
                "unsupported format version {version}"
            )));
        }
        let range = reader.u32()?;
        let expected = engine.backend().max_branch_range();
        if range != expected {
            return Err(Error::Deserialize(format!(
                "module was compiled for a branch range of {range} bytes, the engine uses {expected}"
            )));
        }

        let metadata: Metadata = reader.block(BlockTag::Metadata)?;
        let code = reader.raw_block(BlockTag::Code)?;
        let link = reader.block(BlockTag::LinkData)?;
        let imports = reader.block(BlockTag::Imports)?;
        let exports = reader.block(BlockTag::Exports)?;
        let data_segments = reader.block(BlockTag::DataSegments)?;
        let bytecode: Option<Box<[u8]>> = reader.block(BlockTag::Bytecode)?;

        if !reader.bytes.is_empty() {
            return Err(Error::Deserialize(format!(
                "{} trailing bytes",
                reader.bytes.len()
            )));
        }
        if metadata.env.interrupt_mode != engine.config().interrupt_mode {
            return Err(Error::Deserialize(format!(
                "module was compiled for {:?} interrupts",
                metadata.env.interrupt_mode
            )));
        }
        if metadata
            .code_ranges
            .last()
            .is_some_and(|range| range.end as usize > code.len())
        {
            return Err(Error::Deserialize("code ranges exceed the code".into()));
        }
        check_indices(&metadata)?;

        tracing::debug!("deserialized module with {} bytes of code", code.len());
        Ok(Module::from_parts(
            engine,
            ModuleParts {
                metadata,
                code: code.into(),
                link,
                imports,
                exports,
                data_segments,
                bytecode,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, InterruptMode};
    use crate::indices::{FuncIndex, SigIndex};

    const WAT: &str = r#"(module
        (memory 1)
        (data (i32.const 8) "hello")
        (func $f (param i32) (result i32) (i32.add (local.get 0) (i32.const 1)))
        (func (export "g") (param i32) (result i32) (i32.mul (call $f (local.get 0)) (i32.const 2))))"#;

    fn module(engine: &Engine) -> Module {
        Module::from_bytes(engine, &wat::parse_str(WAT).unwrap()).unwrap()
    }

    /// Splits a serialized module into its header and blocks.
    fn split(bytes: &[u8]) -> (&[u8], Vec<&[u8]>) {
        let (header, mut rest) = bytes.split_at(12);
        let mut blocks = Vec::new();
        while !rest.is_empty() {
            let len = u64::from_le_bytes(rest[1..9].try_into().unwrap()) as usize;
            let (block, tail) = rest.split_at(9 + len);
            blocks.push(block);
            rest = tail;
        }
        (header, blocks)
    }

    #[test]
    fn round_trip_is_byte_identical() {
        let engine = Engine::default();
        let module = module(&engine);
        let bytes = module.serialize().unwrap();
        let restored = Module::deserialize(&engine, &bytes).unwrap();

        assert_eq!(restored.code(), module.code());
        assert_eq!(restored.code_ranges(), module.code_ranges());
        assert_eq!(restored.link_data(), module.link_data());
        assert_eq!(restored.data_segments(), module.data_segments());
        assert!(restored.imports().eq(module.imports()));
        assert!(restored.exports().eq(module.exports()));
        assert_eq!(restored.serialize().unwrap(), bytes);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let engine = Engine::default();
        let bytes = module(&engine).serialize().unwrap();
        for len in [0, 3, 11, 12, 20, bytes.len() / 2, bytes.len() - 1] {
            assert!(
                matches!(Module::deserialize(&engine, &bytes[..len]), Err(Error::Deserialize(_))),
                "prefix of {len} bytes was accepted"
            );
        }
    }

    #[test]
    fn reordered_blocks_are_rejected() {
        let engine = Engine::default();
        let bytes = module(&engine).serialize().unwrap();
        let (header, mut blocks) = split(&bytes);
        assert_eq!(blocks.len(), 7);
        blocks.swap(1, 2);

        let reordered = [header].into_iter().chain(blocks).collect::<Vec<_>>().concat();
        let err = Module::deserialize(&engine, &reordered).unwrap_err();
        assert!(err.to_string().contains("expected Code block"), "{err}");
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let engine = Engine::default();
        let mut bytes = module(&engine).serialize().unwrap();
        bytes.push(0);
        assert!(matches!(
            Module::deserialize(&engine, &bytes),
            Err(Error::Deserialize(_))
        ));
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        let engine = Engine::default();
        let module = Module::from_bytes(
            &engine,
            &wat::parse_str(
                r#"(module
                    (type $t (func (param i32) (result i32)))
                    (table 1 funcref)
                    (elem (i32.const 0) $f)
                    (func $f (type $t) (local.get 0))
                    (func (export "call") (param i32) (result i32)
                        (call_indirect (type $t) (local.get 0) (i32.const 0))))"#,
            )
            .unwrap(),
        )
        .unwrap();
        let bytes = module.serialize().unwrap();
        assert!(Module::deserialize(&engine, &bytes).is_ok());

        let (header, blocks) = split(&bytes);
        let reencode = |metadata: &Metadata| {
            let payload = options().serialize(metadata).unwrap();
            let mut writer = Writer {
                out: header.to_vec(),
            };
            writer.raw_block(BlockTag::Metadata, &payload).unwrap();
            for block in &blocks[1..] {
                writer.out.extend_from_slice(block);
            }
            writer.out
        };

        let mut metadata = module.metadata().clone();
        metadata.indirect_sigs.push(SigIndex::from_u32(7));
        let err = Module::deserialize(&engine, &reencode(&metadata)).unwrap_err();
        assert!(err.to_string().contains("signature index 7"), "{err}");

        let mut metadata = module.metadata().clone();
        metadata.elem_segments[0].funcs.push(Some(FuncIndex::from_u32(9)));
        let err = Module::deserialize(&engine, &reencode(&metadata)).unwrap_err();
        assert!(err.to_string().contains("function index 9"), "{err}");
    }

    #[test]
    fn engine_mismatch_is_rejected() {
        let bytes = module(&Engine::default()).serialize().unwrap();

        let mut config = Config::new();
        config.max_branch_range(1024);
        assert!(matches!(
            Module::deserialize(&Engine::new(&config), &bytes),
            Err(Error::Deserialize(_))
        ));

        let mut config = Config::new();
        config.interrupt_mode(InterruptMode::Signal);
        assert!(matches!(
            Module::deserialize(&Engine::new(&config), &bytes),
            Err(Error::Deserialize(_))
        ));
    }
}
