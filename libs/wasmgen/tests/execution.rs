// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use common::{compile, instantiate, serial_engine, setup_logging};
use wasmgen::{Error, HostFunc, Imports, Module, Trap, Val};

const DOUBLE_INC: &str = r#"
    (module
        (func $f (param i32) (result i32)
            local.get 0
            i32.const 1
            i32.add)
        (func $g (export "g") (param i32) (result i32)
            local.get 0
            call $f
            i32.const 2
            i32.mul))
"#;

#[test]
fn direct_calls() {
    let _guard = setup_logging();
    let instance = instantiate(&serial_engine(), DOUBLE_INC);
    assert_eq!(instance.call_export("g", &[Val::I32(20)]).unwrap(), Some(Val::I32(42)));
}

#[test]
fn serialized_modules_run_the_same() {
    let _guard = setup_logging();
    let engine = serial_engine();
    let module = compile(&engine, DOUBLE_INC);

    let bytes = module.serialize().unwrap();
    let restored = Module::deserialize(&engine, &bytes).unwrap();
    let instance = restored.instantiate(&Imports::new()).unwrap();

    assert_eq!(instance.call_export("g", &[Val::I32(20)]).unwrap(), Some(Val::I32(42)));
    assert_eq!(restored.code(), module.code());
}

#[test]
fn arguments_are_coerced() {
    let _guard = setup_logging();
    let instance = instantiate(&serial_engine(), DOUBLE_INC);
    // 19.9 truncates to 19
    assert_eq!(
        instance.call_export("g", &[Val::from(19.9_f64)]).unwrap(),
        Some(Val::I32(40))
    );
    // missing arguments are zero
    assert_eq!(instance.call_export("g", &[]).unwrap(), Some(Val::I32(2)));
    assert!(matches!(
        instance.call_export("g", &[Val::I64(1)]),
        Err(Error::TypeMismatch(_))
    ));
    assert!(matches!(
        instance.call_export("nope", &[]),
        Err(Error::UnknownExport(_))
    ));
}

#[test]
fn missing_float_arguments_are_nan() {
    let _guard = setup_logging();
    let instance = instantiate(
        &serial_engine(),
        r#"(module
            (func (export "is_nan") (param i32 f32 f64) (result i32)
                local.get 1
                local.get 1
                f32.ne
                local.get 2
                local.get 2
                f64.ne
                i32.and
                local.get 0
                i32.eqz
                i32.and))"#,
    );
    assert_eq!(instance.call_export("is_nan", &[]).unwrap(), Some(Val::I32(1)));
    assert_eq!(
        instance
            .call_export("is_nan", &[Val::I32(0), Val::from(1.5_f32)])
            .unwrap(),
        Some(Val::I32(0))
    );
}

#[test]
fn loops_and_locals() {
    let _guard = setup_logging();
    let instance = instantiate(
        &serial_engine(),
        r#"(module
            (func (export "fib") (param $n i32) (result i32)
                (local $a i32) (local $b i32) (local $t i32)
                i32.const 1
                local.set $b
                block $done
                    loop $next
                        local.get $n
                        i32.eqz
                        br_if $done
                        local.get $a
                        local.get $b
                        i32.add
                        local.set $t
                        local.get $b
                        local.set $a
                        local.get $t
                        local.set $b
                        local.get $n
                        i32.const 1
                        i32.sub
                        local.set $n
                        br $next
                    end
                end
                local.get $a))"#,
    );
    assert_eq!(instance.call_export("fib", &[Val::I32(8)]).unwrap(), Some(Val::I32(21)));
    assert_eq!(instance.call_export("fib", &[Val::I32(0)]).unwrap(), Some(Val::I32(0)));
}

#[test]
fn recursion() {
    let _guard = setup_logging();
    let instance = instantiate(
        &serial_engine(),
        r#"(module
            (func $fac (export "fac") (param i64) (result i64)
                local.get 0
                i64.eqz
                if (result i64)
                    i64.const 1
                else
                    local.get 0
                    local.get 0
                    i64.const 1
                    i64.sub
                    call $fac
                    i64.mul
                end))"#,
    );
    assert_eq!(
        instance.call_export("fac", &[Val::I64(20)]).unwrap(),
        Some(Val::I64(2_432_902_008_176_640_000))
    );
}

#[test]
fn memory_globals_and_start() {
    let _guard = setup_logging();
    let instance = instantiate(
        &serial_engine(),
        r#"(module
            (memory (export "mem") 1)
            (global $counter (export "counter") (mut i32) (i32.const 10))
            (data (i32.const 16) "\2a\00\00\00")
            (func $start
                global.get $counter
                i32.const 1
                i32.add
                global.set $counter)
            (start $start)
            (func (export "load") (param i32) (result i32)
                local.get 0
                i32.load)
            (func (export "store") (param i32 i32)
                local.get 0
                local.get 1
                i32.store)
            (func (export "grow") (param i32) (result i32)
                local.get 0
                memory.grow))"#,
    );

    assert_eq!(instance.get_global("counter"), Some(Val::I32(11)));
    assert_eq!(instance.call_export("load", &[Val::I32(16)]).unwrap(), Some(Val::I32(42)));

    instance.call_export("store", &[Val::I32(100), Val::I32(-7)]).unwrap();
    let mut buf = [0; 4];
    instance.get_memory("mem").unwrap().read(100, &mut buf).unwrap();
    assert_eq!(i32::from_le_bytes(buf), -7);

    assert_eq!(instance.call_export("grow", &[Val::I32(2)]).unwrap(), Some(Val::I32(1)));
    assert_eq!(instance.memory().unwrap().size(), 3);
}

#[test]
fn traps_are_reported() {
    let _guard = setup_logging();
    let instance = instantiate(
        &serial_engine(),
        r#"(module
            (memory 1)
            (func (export "div") (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.div_s)
            (func (export "unreachable")
                unreachable)
            (func (export "oob") (result i32)
                i32.const 65536
                i32.load)
            (func (export "trunc") (param f64) (result i32)
                local.get 0
                i32.trunc_f64_s)
            (func $spin (export "recurse")
                call $spin))"#,
    );

    let trap = |name: &str, args: &[Val]| instance.call_export(name, args).unwrap_err().trap();

    assert_eq!(
        trap("div", &[Val::I32(1), Val::I32(0)]),
        Some(Trap::IntegerDivisionByZero)
    );
    assert_eq!(
        trap("div", &[Val::I32(i32::MIN), Val::I32(-1)]),
        Some(Trap::IntegerOverflow)
    );
    assert_eq!(trap("unreachable", &[]), Some(Trap::UnreachableCodeReached));
    assert_eq!(trap("oob", &[]), Some(Trap::MemoryOutOfBounds));
    assert_eq!(
        trap("trunc", &[Val::from(f64::NAN)]),
        Some(Trap::BadConversionToInteger)
    );
    assert_eq!(trap("recurse", &[]), Some(Trap::StackOverflow));

    // the instance stays usable after a trap
    assert_eq!(
        instance.call_export("div", &[Val::I32(9), Val::I32(3)]).unwrap(),
        Some(Val::I32(3))
    );
}

#[test]
fn trap_info_points_into_the_function() {
    let _guard = setup_logging();
    let instance = instantiate(
        &serial_engine(),
        r#"(module
            (func $helper)
            (func (export "boom")
                nop
                unreachable))"#,
    );
    let Err(Error::Trap(info)) = instance.call_export("boom", &[]) else {
        panic!("expected a trap");
    };
    assert_eq!(info.trap, Trap::UnreachableCodeReached);
    assert_eq!(info.func_index.map(|f| f.as_u32()), Some(1));
    assert!(info.bytecode_offset.is_some());
}

#[test]
fn indirect_call_out_of_table_bounds() {
    let _guard = setup_logging();
    let instance = instantiate(
        &serial_engine(),
        r#"(module
            (type $t (func (param i32) (result i32)))
            (table 1 funcref)
            (elem (i32.const 0) $inc)
            (func $inc (type $t)
                local.get 0
                i32.const 1
                i32.add)
            (func (export "call") (param i32 i32) (result i32)
                local.get 1
                local.get 0
                call_indirect (type $t)))"#,
    );

    assert_eq!(
        instance.call_export("call", &[Val::I32(0), Val::I32(41)]).unwrap(),
        Some(Val::I32(42))
    );
    assert_eq!(
        instance
            .call_export("call", &[Val::I32(5), Val::I32(41)])
            .unwrap_err()
            .trap(),
        Some(Trap::TableOutOfBounds)
    );
}

#[test]
fn indirect_call_checks() {
    let _guard = setup_logging();
    let instance = instantiate(
        &serial_engine(),
        r#"(module
            (type $unary (func (param i32) (result i32)))
            (type $nullary (func (result i32)))
            (table 2 funcref)
            (elem (i32.const 0) $one)
            (func $one (type $nullary)
                i32.const 1)
            (func (export "unary") (param i32) (result i32)
                i32.const 0
                local.get 0
                call_indirect (type $unary))
            (func (export "nullary") (param i32) (result i32)
                local.get 0
                call_indirect (type $nullary)))"#,
    );

    assert_eq!(
        instance.call_export("nullary", &[Val::I32(0)]).unwrap(),
        Some(Val::I32(1))
    );
    assert_eq!(
        instance.call_export("unary", &[Val::I32(0)]).unwrap_err().trap(),
        Some(Trap::BadSignature)
    );
    assert_eq!(
        instance.call_export("nullary", &[Val::I32(1)]).unwrap_err().trap(),
        Some(Trap::IndirectCallToNull)
    );
}

#[test]
fn host_errors_are_not_traps() {
    let _guard = setup_logging();
    let module = compile(
        &serial_engine(),
        r#"(module
            (import "env" "fail" (func $fail))
            (func (export "run")
                call $fail))"#,
    );
    let mut imports = Imports::new();
    imports.func(HostFunc::new(|_| Err(anyhow::anyhow!("host said no"))));
    let instance = module.instantiate(&imports).unwrap();

    let err = instance.call_export("run", &[]).unwrap_err();
    assert!(err.trap().is_none());
    assert!(matches!(&err, Error::Host(e) if e.to_string() == "host said no"), "{err}");
}

#[test]
fn constructing_discards_the_result() {
    let _guard = setup_logging();
    let instance = instantiate(&serial_engine(), DOUBLE_INC);
    let object = instance.construct("g", &[Val::I32(1)]).unwrap();
    assert!(object.is_empty());
    assert_eq!(object.get("result"), None);
}

#[test]
fn segments_that_do_not_fit_fail_instantiation() {
    let _guard = setup_logging();
    let module = compile(
        &serial_engine(),
        r#"(module
            (memory 1)
            (data (i32.const 0) "ok")
            (data (i32.const 65535) "too long"))"#,
    );
    let err = module.instantiate(&Imports::new()).unwrap_err();
    assert_eq!(err.trap(), Some(Trap::MemoryOutOfBounds));
}
