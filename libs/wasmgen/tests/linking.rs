// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use std::fmt::Write;

use common::{compile, serial_engine, setup_logging};
use wasmgen::{CodeRangeKind, Config, Engine, Error, FuncIndex, Imports, Module, Trap, Val};

/// `g` and `sum` sit at the start of the module, their callees at the end,
/// separated by `padding` filler functions.
fn padded_module(padding: usize) -> String {
    let mut wat = String::from(
        r#"(module
        (func $g (export "g") (param i32) (result i32)
            local.get 0
            call $f
            i32.const 2
            i32.mul)
        (func (export "sum") (param i32) (result i32)
            local.get 0
            call $filler0
            call $last
            local.get 0
            call $f
            i32.add)
"#,
    );
    for i in 0..padding {
        writeln!(
            wat,
            "(func $filler{i} (param i32) (result i32) local.get 0 i32.const {i} i32.add i32.const 3 i32.mul)"
        )
        .unwrap();
    }
    wat.push_str(
        r#"
        (func $last (param i32) (result i32)
            local.get 0
            i32.const 7
            i32.xor)
        (func $f (param i32) (result i32)
            local.get 0
            i32.const 1
            i32.add))"#,
    );
    wat
}

fn has_thunks(module: &Module) -> bool {
    module
        .code_ranges()
        .iter()
        .any(|range| matches!(range.kind, CodeRangeKind::CallThunk { .. }))
}

#[test]
fn far_calls_match_close_calls() {
    let _guard = setup_logging();
    let wat = padded_module(64);

    let close = compile(&serial_engine(), &wat);
    let far_engine = Engine::new(Config::new().parallel_compilation(false).max_branch_range(512));
    let far = compile(&far_engine, &wat);
    assert!(!has_thunks(&close));
    assert!(has_thunks(&far));

    let close = close.instantiate(&Imports::new()).unwrap();
    let far = far.instantiate(&Imports::new()).unwrap();
    for x in [-3, 0, 20, 1000] {
        for name in ["g", "sum"] {
            assert_eq!(
                close.call_export(name, &[Val::I32(x)]).unwrap(),
                far.call_export(name, &[Val::I32(x)]).unwrap(),
                "{name}({x})"
            );
        }
    }
    assert_eq!(far.call_export("g", &[Val::I32(20)]).unwrap(), Some(Val::I32(42)));
}

#[test]
fn profiled_far_calls_go_through_thunks() {
    let _guard = setup_logging();
    let padding = 64;
    let far_engine = Engine::new(Config::new().parallel_compilation(false).max_branch_range(512));
    let far = compile(&far_engine, &padded_module(padding));
    assert!(has_thunks(&far));

    let instance = far.instantiate(&Imports::new()).unwrap();
    instance.set_profiling(true);
    assert_eq!(instance.call_export("g", &[Val::I32(20)]).unwrap(), Some(Val::I32(42)));

    // $f is the last function, after g, sum, the fillers and $last
    let f = FuncIndex::from_u32(padding as u32 + 3);
    assert_eq!(
        instance.profile(),
        [(FuncIndex::from_u32(0), 1), (f, 1)]
    );
}

#[test]
fn code_ranges_are_sorted_and_disjoint() {
    let _guard = setup_logging();
    let far_engine = Engine::new(Config::new().parallel_compilation(false).max_branch_range(512));
    let module = compile(&far_engine, &padded_module(32));

    let ranges = module.code_ranges();
    assert!(ranges.windows(2).all(|w| w[0].end <= w[1].begin));
    for range in ranges {
        assert_eq!(module.lookup_code_range(range.begin), Some(range));
    }
}

#[test]
fn parallel_compilation_matches_serial() {
    let _guard = setup_logging();
    let wat = padded_module(128);

    let serial = compile(&serial_engine(), &wat);
    let parallel_engine = Engine::new(Config::new().parallel_compilation(true).compile_threads(4));
    let parallel = compile(&parallel_engine, &wat);
    assert_eq!(serial.code().len(), parallel.code().len());

    let serial = serial.instantiate(&Imports::new()).unwrap();
    let parallel = parallel.instantiate(&Imports::new()).unwrap();
    for x in [0, 1, 99] {
        assert_eq!(
            serial.call_export("sum", &[Val::I32(x)]).unwrap(),
            parallel.call_export("sum", &[Val::I32(x)]).unwrap()
        );
    }
}

#[test]
fn one_failing_function_fails_the_module() {
    let _guard = setup_logging();
    let mut wat = padded_module(16);
    // memory.fill is valid but not supported by the compiler
    wat.truncate(wat.len() - 1);
    wat.push_str(
        r#"
        (memory 1)
        (func (param i32)
            local.get 0
            i32.const 0
            i32.const 1
            memory.fill))"#,
    );
    let bytes = wat::parse_str(&wat).unwrap();

    let parallel_engine = Engine::new(Config::new().compile_threads(4));
    for engine in [serial_engine(), parallel_engine] {
        let err = Module::from_bytes(&engine, &bytes).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)), "{err}");
    }
}

const TABLE_OWNER: &str = r#"
    (module
        (type $t (func (param i32) (result i32)))
        (table (export "tab") 2 funcref)
        (elem (i32.const 0) $triple)
        (func $triple (type $t)
            local.get 0
            i32.const 3
            i32.mul))
"#;

const TABLE_USER: &str = r#"
    (module
        (type $t (func (param i32) (result i32)))
        (type $u (func (param f64) (result i32)))
        (import "a" "tab" (table 2 funcref))
        (elem (i32.const 1) $neg)
        (func $neg (type $t)
            i32.const 0
            local.get 0
            i32.sub)
        (func (export "call") (param i32 i32) (result i32)
            local.get 1
            local.get 0
            call_indirect (type $t))
        (func (export "wrong") (param i32) (result i32)
            f64.const 1
            local.get 0
            call_indirect (type $u)))
"#;

#[test]
fn calls_through_shared_tables_cross_instances() {
    let _guard = setup_logging();
    let engine = serial_engine();
    let owner = compile(&engine, TABLE_OWNER)
        .instantiate(&Imports::new())
        .unwrap();

    let mut imports = Imports::new();
    imports.table(owner.get_table("tab").unwrap());
    let user = compile(&engine, TABLE_USER).instantiate(&imports).unwrap();

    // slot 0 belongs to the owner, slot 1 to the user
    assert_eq!(
        user.call_export("call", &[Val::I32(0), Val::I32(14)]).unwrap(),
        Some(Val::I32(42))
    );
    assert_eq!(
        user.call_export("call", &[Val::I32(1), Val::I32(5)]).unwrap(),
        Some(Val::I32(-5))
    );
    assert_eq!(
        user.call_export("wrong", &[Val::I32(0)]).unwrap_err().trap(),
        Some(Trap::BadSignature)
    );
}

#[test]
fn calls_into_dropped_instances_trap() {
    let _guard = setup_logging();
    let engine = serial_engine();
    let owner = compile(&engine, TABLE_OWNER)
        .instantiate(&Imports::new())
        .unwrap();
    let table = owner.get_table("tab").unwrap();
    let mut imports = Imports::new();
    imports.table(table);
    let user = compile(&engine, TABLE_USER).instantiate(&imports).unwrap();

    drop(owner);
    assert_eq!(
        user.call_export("call", &[Val::I32(0), Val::I32(1)])
            .unwrap_err()
            .trap(),
        Some(Trap::IndirectCallToNull)
    );
}

#[test]
fn tables_do_not_cross_engines() {
    let _guard = setup_logging();
    let owner = compile(&serial_engine(), TABLE_OWNER)
        .instantiate(&Imports::new())
        .unwrap();
    let table = owner.get_table("tab").unwrap();

    // the other engine interns signatures on its own, its tokens may collide
    let other = serial_engine();
    let mismatched = compile(
        &other,
        r#"(module
            (type $t (func (param f64) (result f64)))
            (import "a" "tab" (table 2 funcref))
            (func (export "call") (param f64) (result f64)
                local.get 0
                i32.const 0
                call_indirect (type $t)))"#,
    );
    let mut imports = Imports::new();
    imports.table(table.clone());
    assert!(matches!(
        mismatched.instantiate(&imports),
        Err(Error::Instantiation(_))
    ));

    // instances of the owning engine can still share it
    let mut imports = Imports::new();
    imports.table(table);
    let user = compile(owner.module().engine(), TABLE_USER)
        .instantiate(&imports)
        .unwrap();
    assert_eq!(
        user.call_export("call", &[Val::I32(0), Val::I32(2)]).unwrap(),
        Some(Val::I32(6))
    );
}
