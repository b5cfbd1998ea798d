// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Reference-counted interning of function signatures.
//!
//! Indirect calls compare the token stored next to a table element with the token
//! the caller expects, so two structurally equal signatures must map to the same
//! token for as long as anyone holds it. Every [`Instance`](crate::Instance) holds a
//! [`RegisteredSig`] for each signature it uses indirectly and releases it on drop.

use core::fmt;
use core::hash::{Hash, Hasher};
use std::sync::Arc;

use hashbrown::HashMap;
use spin::Mutex;
use wasmtime_slab::{Id, Slab};

use crate::types::Sig;

/// Process-wide identity of a registered signature.
///
/// Tokens are never zero, zero marks an empty table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct SigToken(u64);

impl SigToken {
    /// The token of an empty table slot. Never handed out by the registry.
    pub const NULL: SigToken = SigToken(0);

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub(crate) fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    fn from_slab_id(id: Id) -> Self {
        Self(u64::from(id.into_raw()) + 1)
    }

    fn slab_id(self) -> Id {
        debug_assert_ne!(self, Self::NULL);
        // tokens are only ever created from slab ids
        Id::from_raw((self.0 - 1) as u32)
    }
}

/// The registry service object, shared by every instance created from one
/// [`Engine`](crate::Engine).
#[derive(Clone, Default)]
pub struct SignatureRegistry(Arc<Mutex<RegistryInner>>);

#[derive(Default)]
struct RegistryInner {
    map: HashMap<Arc<Sig>, SigToken>,
    entries: Slab<Entry>,
}

struct Entry {
    sig: Arc<Sig>,
    registrations: usize,
}

/// A signature kept alive in a [`SignatureRegistry`]. Dropping the last handle
/// frees the token.
pub struct RegisteredSig {
    registry: SignatureRegistry,
    token: SigToken,
    sig: Arc<Sig>,
}

// ===== impl SignatureRegistry =====

impl SignatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether both handles refer to the same registry. Tokens from different
    /// registries are unrelated.
    pub fn same(lhs: &SignatureRegistry, rhs: &SignatureRegistry) -> bool {
        Arc::ptr_eq(&lhs.0, &rhs.0)
    }

    /// Interns `sig`, incrementing its registration count.
    pub fn register(&self, sig: &Sig) -> RegisteredSig {
        let mut inner = self.0.lock();

        let (token, sig) = if let Some(&token) = inner.map.get(sig) {
            let entry = &mut inner.entries[token.slab_id()];
            entry.registrations += 1;
            (token, entry.sig.clone())
        } else {
            let sig = Arc::new(sig.clone());
            let token = SigToken::from_slab_id(inner.entries.alloc(Entry {
                sig: sig.clone(),
                registrations: 1,
            }));
            inner.map.insert(sig.clone(), token);
            tracing::trace!("registered new signature {sig} as {token:?}");
            (token, sig)
        };

        RegisteredSig {
            registry: self.clone(),
            token,
            sig,
        }
    }

    /// Looks up the signature behind a token.
    ///
    /// This does *NOT* keep the token registered, use a [`RegisteredSig`] for that.
    pub fn lookup(&self, token: SigToken) -> Option<Arc<Sig>> {
        if token == SigToken::NULL {
            return None;
        }
        let inner = self.0.lock();
        inner
            .entries
            .get(token.slab_id())
            .map(|entry| entry.sig.clone())
    }

    /// Number of distinct signatures currently registered.
    pub fn len(&self) -> usize {
        self.0.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn add_ref(&self, token: SigToken) {
        let mut inner = self.0.lock();
        inner.entries[token.slab_id()].registrations += 1;
    }

    fn release(&self, token: SigToken) {
        let mut inner = self.0.lock();
        let id = token.slab_id();
        let entry = &mut inner.entries[id];
        debug_assert!(entry.registrations > 0);
        entry.registrations -= 1;

        if entry.registrations == 0 {
            let entry = inner.entries.dealloc(id);
            inner.map.remove(&*entry.sig);
            tracing::trace!("unregistered signature {} ({token:?})", entry.sig);
        }
    }
}

impl fmt::Debug for SignatureRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureRegistry")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

// ===== impl RegisteredSig =====

impl RegisteredSig {
    pub fn token(&self) -> SigToken {
        self.token
    }

    pub fn sig(&self) -> &Sig {
        &self.sig
    }
}

impl Clone for RegisteredSig {
    fn clone(&self) -> Self {
        self.registry.add_ref(self.token);
        Self {
            registry: self.registry.clone(),
            token: self.token,
            sig: self.sig.clone(),
        }
    }
}

impl Drop for RegisteredSig {
    fn drop(&mut self) {
        self.registry.release(self.token);
    }
}

impl PartialEq for RegisteredSig {
    fn eq(&self, other: &Self) -> bool {
        let eq = self.token == other.token && SignatureRegistry::same(&self.registry, &other.registry);

        if cfg!(debug_assertions) && eq {
            assert_eq!(self.sig, other.sig);
        }

        eq
    }
}

impl Eq for RegisteredSig {}

impl Hash for RegisteredSig {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.token.hash(state);
    }
}

impl fmt::Debug for RegisteredSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredSig")
            .field("token", &self.token)
            .field("sig", &self.sig)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::types::ValType;

    fn i32_to_i32() -> Sig {
        Sig::new([ValType::I32], Some(ValType::I32))
    }

    #[test]
    fn identical_signatures_share_a_token() {
        let registry = SignatureRegistry::new();
        let a = registry.register(&i32_to_i32());
        let b = registry.register(&i32_to_i32());
        let c = registry.register(&Sig::new([ValType::F64], None));

        assert_eq!(a.token(), b.token());
        assert_eq!(a, b);
        assert_ne!(a.token(), c.token());
        assert_ne!(a.token(), SigToken::NULL);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn token_is_freed_with_last_registration() {
        let registry = SignatureRegistry::new();
        let a = registry.register(&i32_to_i32());
        let token = a.token();
        let b = a.clone();

        drop(a);
        assert_eq!(registry.lookup(token).as_deref(), Some(&i32_to_i32()));
        drop(b);
        assert!(registry.lookup(token).is_none());
        assert!(registry.is_empty());
    }

    proptest! {
        #[test]
        fn registration_is_balanced(params in proptest::collection::vec(0u8..5, 0..6), copies in 1usize..8) {
            let registry = SignatureRegistry::new();
            let sig = Sig::new(params.into_iter().filter_map(ValType::from_u8), None);

            let handles: Vec<_> = (0..copies).map(|_| registry.register(&sig)).collect();
            prop_assert_eq!(registry.len(), 1);
            prop_assert!(handles.windows(2).all(|w| w[0] == w[1]));

            drop(handles);
            prop_assert!(registry.is_empty());
        }
    }
}
