// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::sync::{Arc, Weak};

use crate::instance::InstanceInner;
use crate::signature_registry::{RegisteredSig, SigToken, SignatureRegistry};
use crate::trap::Trap;
use crate::types::{Sig, TableType};

/// A funcref table.
///
/// Tables can be shared between instances by exporting them from one module
/// and importing them into another. Elements remember the instance that
/// defined them, so an indirect call through a shared table always runs the
/// callee in its own instance.
///
/// Element signatures are compared by registry token, so a table is bound to
/// the signature registry of the first engine that instantiates a module with
/// it and cannot be used by instances of any other engine.
#[derive(Clone)]
pub struct Table(Arc<spin::RwLock<TableInner>>);

struct TableInner {
    ty: TableType,
    elems: Vec<Option<FuncRef>>,
    registry: Option<SignatureRegistry>,
}

/// A table element.
#[derive(Clone)]
pub(crate) struct FuncRef {
    pub sig: RegisteredSig,
    /// Code offset the function is entered at, in the defining instance's code.
    pub code_offset: u32,
    pub instance: Weak<InstanceInner>,
}

/// What an indirect call needs to know about a table element.
pub(crate) struct CallTarget {
    pub token: SigToken,
    pub code_offset: u32,
    pub instance: Weak<InstanceInner>,
}

// ===== impl Table =====

impl Table {
    /// Creates a table of `ty.initial` null elements.
    pub fn new(ty: TableType) -> Self {
        Self(Arc::new(spin::RwLock::new(TableInner {
            ty,
            elems: vec![None; ty.initial as usize],
            registry: None,
        })))
    }

    pub fn same(lhs: &Table, rhs: &Table) -> bool {
        Arc::ptr_eq(&lhs.0, &rhs.0)
    }

    pub fn ty(&self) -> TableType {
        self.0.read().ty
    }

    pub fn size(&self) -> u32 {
        // tables are created from a u32 element count and never grow
        self.0.read().elems.len() as u32
    }

    /// Returns the signature of the function at `index`, `None` if the index is
    /// out of bounds and `Some(None)` for a null element.
    pub fn sig(&self, index: u32) -> Option<Option<Sig>> {
        let inner = self.0.read();
        let elem = inner.elems.get(index as usize)?;
        Some(elem.as_ref().map(|elem| elem.sig.sig().clone()))
    }

    /// Binds the table to `registry`, returning `false` if it is already bound
    /// to a different one.
    pub(crate) fn bind_registry(&self, registry: &SignatureRegistry) -> bool {
        let mut inner = self.0.write();
        match &inner.registry {
            Some(bound) => SignatureRegistry::same(bound, registry),
            None => {
                inner.registry = Some(registry.clone());
                true
            }
        }
    }

    /// Replaces the code offset of every element defined by `owner` with
    /// `f(offset)`.
    pub(crate) fn repoint_elems(&self, owner: *const InstanceInner, f: impl Fn(u32) -> u32) {
        let mut inner = self.0.write();
        for elem in inner.elems.iter_mut().flatten() {
            if core::ptr::eq(elem.instance.as_ptr(), owner) {
                elem.code_offset = f(elem.code_offset);
            }
        }
    }

    /// Resolves the element an indirect call at `index` dispatches to.
    pub(crate) fn call_target(&self, index: u32) -> Result<CallTarget, Trap> {
        let inner = self.0.read();
        let elem = inner
            .elems
            .get(index as usize)
            .ok_or(Trap::TableOutOfBounds)?
            .as_ref()
            .ok_or(Trap::IndirectCallToNull)?;
        Ok(CallTarget {
            token: elem.sig.token(),
            code_offset: elem.code_offset,
            instance: elem.instance.clone(),
        })
    }

    /// Whether `len` elements starting at `offset` are in bounds.
    pub(crate) fn fits(&self, offset: u32, len: usize) -> bool {
        (offset as usize)
            .checked_add(len)
            .is_some_and(|end| end <= self.0.read().elems.len())
    }

    /// Writes a segment, failing without any effect if it does not fit.
    pub(crate) fn init(&self, offset: u32, elems: Vec<Option<FuncRef>>) -> Result<(), Trap> {
        let mut inner = self.0.write();
        let start = offset as usize;
        let dst = start
            .checked_add(elems.len())
            .and_then(|end| inner.elems.get_mut(start..end))
            .ok_or(Trap::TableOutOfBounds)?;
        for (slot, elem) in dst.iter_mut().zip(elems) {
            *slot = elem;
        }
        Ok(())
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.read();
        f.debug_struct("Table")
            .field("ty", &inner.ty)
            .field("len", &inner.elems.len())
            .finish_non_exhaustive()
    }
}
