// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::sync::Arc;

use crate::codegen::{Backend, PortableBackend};
use crate::config::Config;
use crate::signature_registry::SignatureRegistry;

/// Global context for code generation and execution.
///
/// An engine can be safely shared across threads and is a cheap cloneable
/// handle to the actual engine. The engine itself will be deallocated once all
/// references to it have gone away.
#[derive(Clone)]
pub struct Engine(Arc<EngineInner>);

struct EngineInner {
    config: Config,
    signatures: SignatureRegistry,
    backend: Arc<dyn Backend>,
    /// Built on first use, `None` if the threads could not be started.
    compile_pool: spin::Once<Option<rayon::ThreadPool>>,
}

// ===== impl Engine =====

impl Default for Engine {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

impl Engine {
    pub fn new(config: &Config) -> Engine {
        let backend = PortableBackend::new(config.max_branch_range);
        tracing::debug!(
            backend = backend.name(),
            max_branch_range = config.max_branch_range,
            "creating engine"
        );

        Engine(Arc::new(EngineInner {
            config: config.clone(),
            signatures: SignatureRegistry::new(),
            backend: Arc::new(backend),
            compile_pool: spin::Once::new(),
        }))
    }

    pub fn same(lhs: &Engine, rhs: &Engine) -> bool {
        Arc::ptr_eq(&lhs.0, &rhs.0)
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    /// Returns the signature registry shared by every instance of this engine.
    pub fn signatures(&self) -> &SignatureRegistry {
        &self.0.signatures
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.0.backend
    }

    /// The thread pool parallel compilation runs on, if it could be started.
    pub(crate) fn compile_pool(&self) -> Option<&rayon::ThreadPool> {
        self.0
            .compile_pool
            .call_once(|| {
                let threads = self.0.config.effective_compile_threads();
                match rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("wasmgen-compile-{i}"))
                    .build()
                {
                    Ok(pool) => {
                        tracing::debug!("started {threads} compile threads");
                        Some(pool)
                    }
                    Err(err) => {
                        tracing::warn!("failed to start compile threads: {err}");
                        None
                    }
                }
            })
            .as_ref()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.0.config)
            .field("signatures", &self.0.signatures)
            .field("backend", &self.0.backend.name())
            .finish_non_exhaustive()
    }
}
