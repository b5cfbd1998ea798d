// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use common::{compile, instantiate, serial_engine, setup_logging};
use wasmgen::{FuncIndex, Imports, Val};

const CALLS: &str = r#"
    (module
        (type $t (func (param i32) (result i32)))
        (table (export "tab") 1 funcref)
        (elem (i32.const 0) $double)
        (func $double (type $t)
            local.get 0
            i32.const 2
            i32.mul)
        (func $helper (param i32) (result i32)
            local.get 0
            call $double)
        (func (export "direct") (param i32) (result i32)
            local.get 0
            call $helper)
        (func (export "indirect") (param i32) (result i32)
            local.get 0
            i32.const 0
            call_indirect (type $t)))
"#;

fn counts(pairs: &[(u32, u64)]) -> Vec<(FuncIndex, u64)> {
    pairs
        .iter()
        .map(|&(func, count)| (FuncIndex::from_u32(func), count))
        .collect()
}

#[test]
fn profiling_counts_function_entries() {
    let _guard = setup_logging();
    let instance = instantiate(&serial_engine(), CALLS);

    assert!(!instance.is_profiling());
    assert_eq!(instance.call_export("direct", &[Val::I32(5)]).unwrap(), Some(Val::I32(10)));
    assert!(instance.profile().is_empty());

    instance.set_profiling(true);
    assert!(instance.is_profiling());
    assert_eq!(instance.call_export("direct", &[Val::I32(5)]).unwrap(), Some(Val::I32(10)));
    assert_eq!(instance.profile(), counts(&[(0, 1), (1, 1), (2, 1)]));

    // the table element now points at the profiling entry
    assert_eq!(instance.call_export("indirect", &[Val::I32(4)]).unwrap(), Some(Val::I32(8)));
    assert_eq!(instance.profile(), counts(&[(0, 2), (1, 1), (2, 1), (3, 1)]));

    instance.set_profiling(false);
    assert_eq!(instance.call_export("direct", &[Val::I32(1)]).unwrap(), Some(Val::I32(2)));
    assert_eq!(instance.call_export("indirect", &[Val::I32(1)]).unwrap(), Some(Val::I32(2)));
    assert_eq!(instance.profile(), counts(&[(0, 2), (1, 1), (2, 1), (3, 1)]));
}

#[test]
fn toggling_twice_is_harmless() {
    let _guard = setup_logging();
    let instance = instantiate(&serial_engine(), CALLS);
    instance.set_profiling(true);
    instance.set_profiling(true);
    assert_eq!(instance.call_export("indirect", &[Val::I32(3)]).unwrap(), Some(Val::I32(6)));
    instance.set_profiling(false);
    instance.set_profiling(false);
    assert_eq!(instance.call_export("indirect", &[Val::I32(3)]).unwrap(), Some(Val::I32(6)));
    assert_eq!(instance.profile(), counts(&[(0, 1), (3, 1)]));
}

#[test]
fn shared_tables_count_in_the_defining_instance() {
    let _guard = setup_logging();
    let engine = serial_engine();
    let owner = compile(&engine, CALLS).instantiate(&Imports::new()).unwrap();
    owner.set_profiling(true);

    let mut imports = Imports::new();
    imports.table(owner.get_table("tab").unwrap());
    let user = compile(
        &engine,
        r#"(module
            (type $t (func (param i32) (result i32)))
            (import "a" "tab" (table 1 funcref))
            (func (export "call") (param i32) (result i32)
                local.get 0
                i32.const 0
                call_indirect (type $t)))"#,
    )
    .instantiate(&imports)
    .unwrap();

    assert_eq!(user.call_export("call", &[Val::I32(21)]).unwrap(), Some(Val::I32(42)));
    assert_eq!(owner.profile(), counts(&[(0, 1)]));
    assert!(user.profile().is_empty());
}
