// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use std::thread;
use std::time::Duration;

use common::{instantiate, setup_logging};
use wasmgen::{Config, Engine, InterruptMode, Trap, Val};

const SPIN: &str = r#"
    (module
        (func (export "spin")
            loop $again
                br $again
            end)
        (func (export "id") (param i32) (result i32)
            local.get 0))
"#;

fn engine(mode: InterruptMode) -> Engine {
    Engine::new(Config::new().parallel_compilation(false).interrupt_mode(mode))
}

#[test]
fn pending_interrupts_stop_the_next_call() {
    let _guard = setup_logging();
    for mode in [InterruptMode::Polling, InterruptMode::Signal] {
        let instance = instantiate(&engine(mode), SPIN);
        instance.interrupt_handle().interrupt();
        assert_eq!(
            instance.call_export("spin", &[]).unwrap_err().trap(),
            Some(Trap::Interrupted),
            "{mode:?}"
        );
        // the request was consumed
        assert_eq!(
            instance.call_export("id", &[Val::I32(3)]).unwrap(),
            Some(Val::I32(3))
        );
    }
}

#[test]
fn running_code_can_be_interrupted_from_another_thread() {
    let _guard = setup_logging();
    for mode in [InterruptMode::Polling, InterruptMode::Signal] {
        let instance = instantiate(&engine(mode), SPIN);
        let handle = instance.interrupt_handle();

        let result = thread::scope(|s| {
            s.spawn(move || {
                thread::sleep(Duration::from_millis(20));
                handle.interrupt();
            });
            instance.call_export("spin", &[])
        });
        assert_eq!(result.unwrap_err().trap(), Some(Trap::Interrupted), "{mode:?}");
    }
}
