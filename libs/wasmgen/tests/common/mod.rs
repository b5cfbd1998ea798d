// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![allow(dead_code, reason = "not used by all tests")]

use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;
use wasmgen::{Config, Engine, Imports, Instance, Module};

pub fn setup_logging() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .set_default()
}

pub fn serial_engine() -> Engine {
    Engine::new(Config::new().parallel_compilation(false))
}

pub fn compile(engine: &Engine, wat: &str) -> Module {
    let bytes = wat::parse_str(wat).unwrap();
    Module::from_bytes(engine, &bytes).unwrap()
}

pub fn instantiate(engine: &Engine, wat: &str) -> Instance {
    compile(engine, wat).instantiate(&Imports::new()).unwrap()
}
