// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::thread;

use serde::{Deserialize, Serialize};

/// Default relative-call range of the portable backend.
pub const DEFAULT_MAX_BRANCH_RANGE: u32 = 32 * 1024 * 1024;
/// Default number of nested wasm frames before a call traps with stack overflow.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 10_000;

/// How running code observes [`InterruptHandle::interrupt`](crate::InterruptHandle::interrupt).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InterruptMode {
    /// Generated code polls the interrupt flag at function entry and at every loop header.
    #[default]
    Polling,
    /// No checks are compiled in. The executor is redirected to the interrupt trap
    /// out-of-band, at the next call or backward branch.
    Signal,
}

/// Implementation limits enforced while a module is declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub max_types: u32,
    pub max_funcs: u32,
    pub max_imports: u32,
    pub max_exports: u32,
    pub max_globals: u32,
    pub max_data_segments: u32,
    pub max_elem_segments: u32,
    pub max_table_elems: u32,
    pub max_memory_pages: u32,
    pub max_params: u32,
    pub max_locals: u32,
    pub max_function_size: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_types: 1_000_000,
            max_funcs: 1_000_000,
            max_imports: 100_000,
            max_exports: 100_000,
            max_globals: 1_000_000,
            max_data_segments: 100_000,
            max_elem_segments: 10_000_000,
            max_table_elems: 10_000_000,
            max_memory_pages: 65_536,
            max_params: 1_000,
            max_locals: 50_000,
            max_function_size: 7_654_321,
        }
    }
}

/// Global configuration options used to create an [`Engine`](crate::Engine).
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) parallel_compilation: bool,
    pub(crate) compile_threads: Option<usize>,
    pub(crate) interrupt_mode: InterruptMode,
    pub(crate) max_branch_range: u32,
    pub(crate) max_call_depth: usize,
    pub(crate) retain_bytecode: bool,
    pub(crate) optimize_imports: bool,
    pub(crate) limits: Limits,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            parallel_compilation: true,
            compile_threads: None,
            interrupt_mode: InterruptMode::default(),
            max_branch_range: DEFAULT_MAX_BRANCH_RANGE,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            retain_bytecode: false,
            optimize_imports: true,
            limits: Limits::default(),
        }
    }

    /// Compile function bodies on a pool of helper threads.
    ///
    /// When the pool cannot be started, compilation silently falls back to the
    /// calling thread.
    pub fn parallel_compilation(&mut self, enable: bool) -> &mut Self {
        self.parallel_compilation = enable;
        self
    }

    /// Number of helper threads used for parallel compilation. Defaults to the
    /// available parallelism of the machine.
    pub fn compile_threads(&mut self, threads: usize) -> &mut Self {
        self.compile_threads = Some(threads.max(1));
        self
    }

    pub fn interrupt_mode(&mut self, mode: InterruptMode) -> &mut Self {
        self.interrupt_mode = mode;
        self
    }

    /// Maximum distance in bytes a relative call may span. Calls further away go
    /// through a thunk.
    pub fn max_branch_range(&mut self, range: u32) -> &mut Self {
        self.max_branch_range = range;
        self
    }

    pub fn max_call_depth(&mut self, depth: usize) -> &mut Self {
        self.max_call_depth = depth;
        self
    }

    /// Keep a copy of the module bytecode in compiled modules.
    pub fn retain_bytecode(&mut self, enable: bool) -> &mut Self {
        self.retain_bytecode = enable;
        self
    }

    /// Allow import calls to be switched to the callee's optimized entry point.
    pub fn optimize_imports(&mut self, enable: bool) -> &mut Self {
        self.optimize_imports = enable;
        self
    }

    pub fn limits(&mut self, limits: Limits) -> &mut Self {
        self.limits = limits;
        self
    }

    pub(crate) fn effective_compile_threads(&self) -> usize {
        self.compile_threads.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1)
        })
    }
}
