// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A WebAssembly module compiler and runtime.
//!
//! A binary module is validated and translated by [`Module::from_bytes`]. Its
//! function bodies are lowered to SSA form, compiled by the engine's
//! backend into one code buffer and statically linked against a small set
//! of stubs. [`Module::instantiate`] binds the imports, lays out global data
//! and runs the start function, after which exports are called through
//! [`Instance::call_export`].

mod codegen;
mod compile;
mod config;
mod decoder;
mod engine;
mod env;
mod errors;
mod generator;
mod host;
mod indices;
mod instance;
mod ir;
mod link;
mod memory;
mod module;
mod serialize;
mod signature_registry;
mod table;
mod trap;
mod translate;
mod types;
mod utils;
mod values;
mod vm;

pub use config::{Config, DEFAULT_MAX_BRANCH_RANGE, DEFAULT_MAX_CALL_DEPTH, InterruptMode, Limits};
pub use decoder::{Decoder, FuncDecoder};
pub use engine::Engine;
pub use errors::{Error, TrapInfo};
pub use generator::{FunctionGenerator, ModuleGenerator};
pub use host::{HostFunc, Imports, OptimizedCode};
pub use indices::{
    DefinedFuncIndex, EntityIndex, ExportIndex, FuncIndex, GlobalIndex, ImportIndex, SigIndex,
    TableIndex,
};
pub use instance::{ImportExitState, Instance, InterruptHandle};
pub use link::{CodeRange, CodeRangeKind, FuncPtrTable, LinkData};
pub use memory::{Memory, MemoryAccessError};
pub use module::{DataSegment, Export, ExportItem, Import, Module};
pub use signature_registry::{RegisteredSig, SigToken, SignatureRegistry};
pub use table::Table;
pub use trap::Trap;
pub use translate::ModuleTranslator;
pub use types::{GlobalType, InitExpr, MemoryType, Sig, TableType, ValType};
pub use values::{HostObject, RawVal, Val};

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// The size of a WebAssembly page in bytes.
pub const WASM_PAGE_SIZE: u32 = 0x10000;
