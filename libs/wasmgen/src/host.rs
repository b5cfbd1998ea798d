// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Embedder-provided imports.

use core::fmt;
use core::mem;
use std::sync::{Arc, Weak};

use crate::indices::ImportIndex;
use crate::instance::InstanceInner;
use crate::memory::Memory;
use crate::table::Table;
use crate::types::{Sig, ValType};
use crate::values::{RawVal, Val};

type InvokeFn = dyn Fn(&[Val]) -> anyhow::Result<Option<Val>> + Send + Sync;
type EntryFn = dyn Fn(&[RawVal]) -> anyhow::Result<RawVal> + Send + Sync;

/// A function provided by the embedder.
///
/// Every host function has a generic invoke path taking boxed [`Val`]s. It may
/// additionally have [`OptimizedCode`] installed, which import calls are
/// switched to once it is known to be compatible with the import's signature.
#[derive(Clone)]
pub struct HostFunc(Arc<HostFuncInner>);

struct HostFuncInner {
    invoke: Box<InvokeFn>,
    optimized: spin::Mutex<Option<Arc<OptimizedCode>>>,
    /// Instances whose import calls were switched to the optimized code.
    dependents: spin::Mutex<Vec<(Weak<InstanceInner>, ImportIndex)>>,
}

/// An optimized entry point of a host function taking raw argument slots.
pub struct OptimizedCode {
    arity: usize,
    param_feedback: Vec<ValType>,
    result_feedback: Option<ValType>,
    pending_recompile: bool,
    entry: Box<EntryFn>,
}

/// The values a module is instantiated with.
///
/// Imports are matched by position: the n-th function import of the module
/// receives the n-th function added here, and likewise for tables and globals.
#[derive(Clone, Default)]
pub struct Imports {
    pub(crate) funcs: Vec<HostFunc>,
    pub(crate) tables: Vec<Table>,
    pub(crate) memory: Option<Memory>,
    pub(crate) globals: Vec<Val>,
}

// ===== impl HostFunc =====

impl HostFunc {
    pub fn new<F>(invoke: F) -> Self
    where
        F: Fn(&[Val]) -> anyhow::Result<Option<Val>> + Send + Sync + 'static,
    {
        Self(Arc::new(HostFuncInner {
            invoke: Box::new(invoke),
            optimized: spin::Mutex::new(None),
            dependents: spin::Mutex::new(Vec::new()),
        }))
    }

    pub fn same(lhs: &HostFunc, rhs: &HostFunc) -> bool {
        Arc::ptr_eq(&lhs.0, &rhs.0)
    }

    /// Installs optimized code, replacing (and invalidating) any previous code.
    pub fn set_optimized(&self, code: OptimizedCode) {
        self.invalidate_optimized();
        *self.0.optimized.lock() = Some(Arc::new(code));
    }

    /// Discards the optimized code. Every import call that was switched to it
    /// reverts to the generic invoke path.
    pub fn invalidate_optimized(&self) {
        let discarded = self.0.optimized.lock().take();
        // the lock must not be held while instances are notified, dropping the
        // last handle to an instance detaches it from this function
        let dependents = mem::take(&mut *self.0.dependents.lock());
        if discarded.is_some() || !dependents.is_empty() {
            tracing::debug!(
                dependents = dependents.len(),
                "invalidating optimized host code"
            );
        }
        for (instance, import) in dependents {
            if let Some(instance) = instance.upgrade() {
                instance.deoptimize_import(import);
            }
        }
    }

    pub fn has_optimized(&self) -> bool {
        self.0.optimized.lock().is_some()
    }

    /// Number of live instances calling the optimized code directly.
    pub fn num_dependents(&self) -> usize {
        self.0
            .dependents
            .lock()
            .iter()
            .filter(|(instance, _)| instance.strong_count() > 0)
            .count()
    }

    pub(crate) fn invoke(&self, args: &[Val]) -> anyhow::Result<Option<Val>> {
        (self.0.invoke)(args)
    }

    pub(crate) fn optimized(&self) -> Option<Arc<OptimizedCode>> {
        self.0.optimized.lock().clone()
    }

    pub(crate) fn add_dependent(&self, instance: Weak<InstanceInner>, import: ImportIndex) {
        let mut dependents = self.0.dependents.lock();
        if !dependents
            .iter()
            .any(|(dep, index)| Weak::ptr_eq(dep, &instance) && *index == import)
        {
            dependents.push((instance, import));
        }
    }

    /// Forgets every registration of the instance at `instance`, along with
    /// registrations of instances that are gone.
    pub(crate) fn remove_dependent(&self, instance: *const InstanceInner) {
        self.0
            .dependents
            .lock()
            .retain(|(dep, _)| dep.as_ptr() != instance && dep.strong_count() > 0);
    }
}

impl fmt::Debug for HostFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunc")
            .field("optimized", &self.has_optimized())
            .finish_non_exhaustive()
    }
}

// ===== impl OptimizedCode =====

impl OptimizedCode {
    /// Creates optimized code accepting `arity` arguments.
    ///
    /// The entry receives one raw slot per argument and returns the result
    /// slot, which is ignored for imports without a result.
    pub fn new<F>(arity: usize, entry: F) -> Self
    where
        F: Fn(&[RawVal]) -> anyhow::Result<RawVal> + Send + Sync + 'static,
    {
        Self {
            arity,
            param_feedback: Vec::new(),
            result_feedback: None,
            pending_recompile: false,
            entry: Box::new(entry),
        }
    }

    /// The argument types the code was specialized for.
    #[must_use]
    pub fn with_param_feedback(mut self, types: impl IntoIterator<Item = ValType>) -> Self {
        self.param_feedback = types.into_iter().collect();
        self
    }

    /// The result type the code was specialized for.
    #[must_use]
    pub fn with_result_feedback(mut self, ty: ValType) -> Self {
        self.result_feedback = Some(ty);
        self
    }

    /// Marks the code as about to be replaced by a background recompile.
    #[must_use]
    pub fn with_pending_recompile(mut self, pending: bool) -> Self {
        self.pending_recompile = pending;
        self
    }

    /// Whether an import of signature `sig` may call this code directly.
    pub(crate) fn accepts(&self, sig: &Sig) -> bool {
        let params_match = self.param_feedback.len() >= sig.params().len()
            && self
                .param_feedback
                .iter()
                .zip(sig.params())
                .all(|(observed, declared)| observed == declared);
        let result_matches = sig.result().is_none() || self.result_feedback == sig.result();

        !self.pending_recompile && self.arity >= sig.params().len() && params_match && result_matches
    }

    pub(crate) fn call(&self, args: &[RawVal]) -> anyhow::Result<RawVal> {
        (self.entry)(args)
    }
}

impl fmt::Debug for OptimizedCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimizedCode")
            .field("arity", &self.arity)
            .field("param_feedback", &self.param_feedback)
            .field("result_feedback", &self.result_feedback)
            .field("pending_recompile", &self.pending_recompile)
            .finish_non_exhaustive()
    }
}

// ===== impl Imports =====

impl Imports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn func(&mut self, func: HostFunc) -> &mut Self {
        self.funcs.push(func);
        self
    }

    pub fn table(&mut self, table: Table) -> &mut Self {
        self.tables.push(table);
        self
    }

    pub fn memory(&mut self, memory: Memory) -> &mut Self {
        self.memory = Some(memory);
        self
    }

    pub fn global(&mut self, value: Val) -> &mut Self {
        self.globals.push(value);
        self
    }
}

impl fmt::Debug for Imports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Imports")
            .field("funcs", &self.funcs.len())
            .field("tables", &self.tables)
            .field("memory", &self.memory)
            .field("globals", &self.globals)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i32_sig() -> Sig {
        Sig::new([ValType::I32, ValType::I32], Some(ValType::I32))
    }

    fn code() -> OptimizedCode {
        OptimizedCode::new(2, |args| Ok(RawVal::i32(args[0].get_i32() + args[1].get_i32())))
    }

    #[test]
    fn compatible_feedback_is_accepted() {
        let code = code()
            .with_param_feedback([ValType::I32, ValType::I32])
            .with_result_feedback(ValType::I32);
        assert!(code.accepts(&i32_sig()));
        assert_eq!(code.call(&[RawVal::i32(2), RawVal::i32(3)]).unwrap().get_i32(), 5);
    }

    #[test]
    fn incompatible_code_is_rejected() {
        // no feedback yet
        assert!(!code().accepts(&i32_sig()));

        let mismatched = code()
            .with_param_feedback([ValType::I32, ValType::F64])
            .with_result_feedback(ValType::I32);
        assert!(!mismatched.accepts(&i32_sig()));

        let short = OptimizedCode::new(1, |_| Ok(RawVal::ZERO))
            .with_param_feedback([ValType::I32, ValType::I32])
            .with_result_feedback(ValType::I32);
        assert!(!short.accepts(&i32_sig()));

        let recompiling = code()
            .with_param_feedback([ValType::I32, ValType::I32])
            .with_result_feedback(ValType::I32)
            .with_pending_recompile(true);
        assert!(!recompiling.accepts(&i32_sig()));
    }

    #[test]
    fn invalidation_clears_optimized_code() {
        let func = HostFunc::new(|_| Ok(None));
        assert!(!func.has_optimized());
        func.set_optimized(code());
        assert!(func.has_optimized());
        func.invalidate_optimized();
        assert!(!func.has_optimized());
        assert_eq!(func.num_dependents(), 0);
    }
}
