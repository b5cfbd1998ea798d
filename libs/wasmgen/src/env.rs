// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The module-level declarations function compilation reads from.
//!
//! A [`ModuleEnv`] is filled in by the generator's declaration API and then
//! frozen behind an `Arc` before the first function body is compiled, so every
//! compile task (possibly on a helper thread) sees the same read-only view.

use cranelift_entity::{EntityRef, PrimaryMap, SecondaryMap};
use serde::{Deserialize, Serialize};

use crate::config::{InterruptMode, Limits};
use crate::indices::{DefinedFuncIndex, FuncIndex, GlobalIndex, ImportIndex, SigIndex, TableIndex};
use crate::types::{GlobalType, InitExpr, MemoryType, Sig, TableType};
use crate::utils::align_up;
use crate::{Error, Result};

/// Size of an import call-exit record in global data.
///
/// The record holds the code offset of the exit currently in use (`u32` at
/// offset 0) followed by its [`ImportExitState`](crate::ImportExitState) (`u32`
/// at offset 4). The rest is reserved.
pub const EXIT_RECORD_SIZE: u32 = 16;
pub const EXIT_RECORD_STATE_OFFSET: u32 = 4;
/// Size of a table handle in global data: the index of the instance's table (`u32`).
pub const TABLE_HANDLE_SIZE: u32 = 8;
/// Size of an interned signature token in global data (`u64`).
pub const SIG_TOKEN_SIZE: u32 = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuncImport {
    pub module: String,
    pub name: String,
    pub sig: SigIndex,
    /// Offset of the call-exit record.
    pub global_data_offset: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDesc {
    pub ty: TableType,
    /// `(module, name)` if the table is imported.
    pub import: Option<(String, String)>,
    /// Offset of the table handle.
    pub global_data_offset: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryDesc {
    pub ty: MemoryType,
    pub import: Option<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GlobalInit {
    Const(InitExpr),
    Import { module: String, name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalDesc {
    pub ty: GlobalType,
    pub init: GlobalInit,
    pub global_data_offset: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleEnv {
    pub sigs: PrimaryMap<SigIndex, Sig>,
    /// Signature of every function, imported functions first.
    pub funcs: PrimaryMap<FuncIndex, SigIndex>,
    pub func_imports: PrimaryMap<ImportIndex, FuncImport>,
    pub tables: PrimaryMap<TableIndex, TableDesc>,
    pub memory: Option<MemoryDesc>,
    pub globals: PrimaryMap<GlobalIndex, GlobalDesc>,
    /// Offset of the signature token slot of every declared signature.
    pub sig_data_offsets: SecondaryMap<SigIndex, u32>,
    /// Total size of the global data segment.
    pub global_data_len: u32,
    pub interrupt_mode: InterruptMode,
    pub limits: Limits,
}

impl ModuleEnv {
    pub fn new(interrupt_mode: InterruptMode, limits: Limits) -> Self {
        Self {
            interrupt_mode,
            limits,
            ..Self::default()
        }
    }

    pub fn num_imported_funcs(&self) -> u32 {
        self.func_imports.len() as u32
    }

    pub fn num_defined_funcs(&self) -> u32 {
        self.funcs.len() as u32 - self.num_imported_funcs()
    }

    pub fn import_index(&self, func: FuncIndex) -> Option<ImportIndex> {
        (func.as_u32() < self.num_imported_funcs()).then(|| ImportIndex::from_u32(func.as_u32()))
    }

    pub fn defined_func_index(&self, func: FuncIndex) -> Option<DefinedFuncIndex> {
        func.as_u32()
            .checked_sub(self.num_imported_funcs())
            .map(DefinedFuncIndex::from_u32)
    }

    pub fn func_index(&self, def: DefinedFuncIndex) -> FuncIndex {
        FuncIndex::from_u32(self.num_imported_funcs() + def.as_u32())
    }

    pub fn func_sig(&self, func: FuncIndex) -> &Sig {
        &self.sigs[self.funcs[func]]
    }

    /// Reserves `size` bytes of global data aligned to `align` and returns their offset.
    pub(crate) fn alloc_global_data(&mut self, size: u32, align: u32) -> Result<u32> {
        let offset = align_up(self.global_data_len, align);
        self.global_data_len = offset
            .checked_add(size)
            .ok_or_else(|| Error::LimitExceeded {
                what: "global data bytes",
                max: u64::from(u32::MAX),
            })?;
        Ok(offset)
    }

    /// Fails with [`Error::LimitExceeded`] if declaring one more entity would
    /// exceed `max`.
    pub(crate) fn check_limit(what: &'static str, current: usize, max: u32) -> Result<()> {
        if current >= max as usize {
            Err(Error::LimitExceeded {
                what,
                max: u64::from(max),
            })
        } else {
            Ok(())
        }
    }

    /// Whether `index` refers to a valid signature.
    pub(crate) fn check_sig(&self, index: SigIndex) -> Result<()> {
        if index.index() < self.sigs.len() {
            Ok(())
        } else {
            Err(Error::InvalidWebAssembly {
                message: format!("unknown type {}", index.as_u32()),
                offset: 0,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValType;

    #[test]
    fn function_index_spaces() {
        let mut env = ModuleEnv::default();
        let sig = env.sigs.push(Sig::new([ValType::I32], None));
        env.func_imports.push(FuncImport {
            module: "env".into(),
            name: "f".into(),
            sig,
            global_data_offset: 0,
        });
        env.funcs.push(sig);
        env.funcs.push(sig);
        env.funcs.push(sig);

        assert_eq!(env.num_defined_funcs(), 2);
        assert_eq!(env.import_index(FuncIndex::from_u32(0)), Some(ImportIndex::from_u32(0)));
        assert_eq!(env.import_index(FuncIndex::from_u32(1)), None);
        assert_eq!(
            env.defined_func_index(FuncIndex::from_u32(2)),
            Some(DefinedFuncIndex::from_u32(1))
        );
        assert_eq!(env.func_index(DefinedFuncIndex::from_u32(0)), FuncIndex::from_u32(1));
    }

    #[test]
    fn global_data_is_aligned() {
        let mut env = ModuleEnv::default();
        assert_eq!(env.alloc_global_data(4, 4).unwrap(), 0);
        assert_eq!(env.alloc_global_data(EXIT_RECORD_SIZE, 8).unwrap(), 8);
        assert_eq!(env.alloc_global_data(16, 16).unwrap(), 32);
        assert_eq!(env.global_data_len, 48);
    }
}
