// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{compile, serial_engine, setup_logging};
use wasmgen::{
    Config, Engine, HostFunc, ImportExitState, ImportIndex, Imports, OptimizedCode, RawVal, Val,
    ValType,
};

const ADD_IMPORT: &str = r#"
    (module
        (import "env" "add" (func $add (param i32 i32) (result i32)))
        (func (export "run") (param i32) (result i32)
            local.get 0
            i32.const 1
            call $add))
"#;

/// A host `add` counting how often each path was taken.
fn counting_add(generic: &Arc<AtomicUsize>, optimized: &Arc<AtomicUsize>) -> HostFunc {
    let calls = generic.clone();
    let func = HostFunc::new(move |args| {
        calls.fetch_add(1, Ordering::Relaxed);
        Ok(Some(Val::I32(args[0].unwrap_i32() + args[1].unwrap_i32())))
    });
    let calls = optimized.clone();
    func.set_optimized(
        OptimizedCode::new(2, move |args| {
            calls.fetch_add(1, Ordering::Relaxed);
            Ok(RawVal::i32(args[0].get_i32() + args[1].get_i32()))
        })
        .with_param_feedback([ValType::I32, ValType::I32])
        .with_result_feedback(ValType::I32),
    );
    func
}

fn first_import() -> ImportIndex {
    ImportIndex::from_u32(0)
}

#[test]
fn compatible_imports_are_promoted() {
    let _guard = setup_logging();
    let (generic, optimized) = (Arc::default(), Arc::default());
    let add = counting_add(&generic, &optimized);

    let module = compile(&serial_engine(), ADD_IMPORT);
    let mut imports = Imports::new();
    imports.func(add.clone());
    let instance = module.instantiate(&imports).unwrap();
    assert_eq!(instance.import_state(first_import()), Some(ImportExitState::Interpreted));

    // the first call takes the generic path and switches the exit
    assert_eq!(instance.call_export("run", &[Val::I32(1)]).unwrap(), Some(Val::I32(2)));
    assert_eq!(instance.import_state(first_import()), Some(ImportExitState::Optimized));
    assert_eq!(add.num_dependents(), 1);

    assert_eq!(instance.call_export("run", &[Val::I32(2)]).unwrap(), Some(Val::I32(3)));
    assert_eq!(generic.load(Ordering::Relaxed), 1);
    assert_eq!(optimized.load(Ordering::Relaxed), 1);
}

#[test]
fn invalidation_reverts_promoted_imports() {
    let _guard = setup_logging();
    let (generic, optimized) = (Arc::default(), Arc::default());
    let add = counting_add(&generic, &optimized);

    let module = compile(&serial_engine(), ADD_IMPORT);
    let mut imports = Imports::new();
    imports.func(add.clone());
    let instance = module.instantiate(&imports).unwrap();
    instance.call_export("run", &[Val::I32(1)]).unwrap();
    assert_eq!(instance.import_state(first_import()), Some(ImportExitState::Optimized));

    add.invalidate_optimized();
    assert_eq!(instance.import_state(first_import()), Some(ImportExitState::Reverted));
    assert_eq!(add.num_dependents(), 0);

    // still correct, through the generic path
    assert_eq!(instance.call_export("run", &[Val::I32(5)]).unwrap(), Some(Val::I32(6)));
    assert_eq!(generic.load(Ordering::Relaxed), 2);
    assert_eq!(optimized.load(Ordering::Relaxed), 0);
}

#[test]
fn i64_signatures_stay_generic() {
    let _guard = setup_logging();
    let module = compile(
        &serial_engine(),
        r#"(module
            (import "env" "wide" (func $wide (param i64) (result i64)))
            (func (export "run") (param i64) (result i64)
                local.get 0
                call $wide))"#,
    );
    let wide = HostFunc::new(|args| Ok(Some(Val::I64(args[0].unwrap_i64() * 2))));
    wide.set_optimized(
        OptimizedCode::new(1, |args| Ok(RawVal::i64(args[0].get_i64() * 2)))
            .with_param_feedback([ValType::I64])
            .with_result_feedback(ValType::I64),
    );
    let mut imports = Imports::new();
    imports.func(wide.clone());
    let instance = module.instantiate(&imports).unwrap();

    for _ in 0..3 {
        assert_eq!(
            instance.call_export("run", &[Val::I64(1 << 40)]).unwrap(),
            Some(Val::I64(1 << 41))
        );
    }
    assert_eq!(instance.import_state(first_import()), Some(ImportExitState::Interpreted));
    assert_eq!(wide.num_dependents(), 0);
}

#[test]
fn promotion_can_be_disabled() {
    let _guard = setup_logging();
    let engine = Engine::new(Config::new().parallel_compilation(false).optimize_imports(false));
    let (generic, optimized) = (Arc::default(), Arc::default());
    let module = compile(&engine, ADD_IMPORT);
    let mut imports = Imports::new();
    imports.func(counting_add(&generic, &optimized));
    let instance = module.instantiate(&imports).unwrap();

    instance.call_export("run", &[Val::I32(1)]).unwrap();
    instance.call_export("run", &[Val::I32(1)]).unwrap();
    assert_eq!(instance.import_state(first_import()), Some(ImportExitState::Interpreted));
    assert_eq!(optimized.load(Ordering::Relaxed), 0);
}

#[test]
fn dropped_instances_detach_from_host_functions() {
    let _guard = setup_logging();
    let (generic, optimized) = (Arc::default(), Arc::default());
    let add = counting_add(&generic, &optimized);
    let module = compile(&serial_engine(), ADD_IMPORT);

    let mut imports = Imports::new();
    imports.func(add.clone());
    let first = module.instantiate(&imports).unwrap();
    let second = module.instantiate(&imports).unwrap();
    first.call_export("run", &[Val::I32(1)]).unwrap();
    second.call_export("run", &[Val::I32(1)]).unwrap();
    assert_eq!(add.num_dependents(), 2);

    drop(first);
    assert_eq!(add.num_dependents(), 1);
    drop(second);
    assert_eq!(add.num_dependents(), 0);

    // nothing left to revert
    add.invalidate_optimized();
}

#[test]
fn host_results_are_type_checked() {
    let _guard = setup_logging();
    let module = compile(&serial_engine(), ADD_IMPORT);
    let mut imports = Imports::new();
    imports.func(HostFunc::new(|_| Ok(None)));
    let instance = module.instantiate(&imports).unwrap();

    assert!(matches!(
        instance.call_export("run", &[Val::I32(1)]),
        Err(wasmgen::Error::TypeMismatch(_))
    ));
}

#[test]
fn imported_globals_initialize_defined_ones() {
    let _guard = setup_logging();
    let module = compile(
        &serial_engine(),
        r#"(module
            (import "env" "base" (global $base i32))
            (global $copy (export "copy") i32 (global.get $base))
            (func (export "base") (result i32)
                global.get $base))"#,
    );
    let mut imports = Imports::new();
    imports.global(Val::I32(7));
    let instance = module.instantiate(&imports).unwrap();

    assert_eq!(instance.get_global("copy"), Some(Val::I32(7)));
    assert_eq!(instance.call_export("base", &[]).unwrap(), Some(Val::I32(7)));
}

#[test]
fn missing_imports_fail_instantiation() {
    let _guard = setup_logging();
    let module = compile(&serial_engine(), ADD_IMPORT);
    assert!(matches!(
        module.instantiate(&Imports::new()),
        Err(wasmgen::Error::Instantiation(_))
    ));
}
