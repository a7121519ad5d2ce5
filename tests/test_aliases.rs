//! Integration tests for template, callable and nested aliases

#[path = "common/mod.rs"]
mod common;
use common::{eval, evaluator, Value};
use duosh::{Alias, AliasError};
use std::io::{BufRead, BufReader, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn test_template_alias_prepends_words() {
    let mut ev = evaluator();
    ev.eval("alias('say', 'echo said')").unwrap();
    assert_eq!(ev.eval("say hi").unwrap().output, "said hi\n");
}

#[test]
fn test_self_referencing_template_expands_once() {
    let mut ev = evaluator();
    ev.eval("alias('echo', 'echo -n')").unwrap();
    assert_eq!(ev.eval("$(echo x)").unwrap().value, Value::from("x"));
}

#[test]
fn test_alias_cycle_is_reported() {
    let mut ev = evaluator();
    ev.eval("alias('a1', 'b1')\nalias('b1', 'a1')").unwrap();
    assert_eq!(ev.eval("a1").unwrap().exit_code, 1);
}

#[test]
fn test_callable_alias_reads_stdin_in_pipeline() {
    let mut ev = evaluator();
    ev.session().aliases().set(
        "shout",
        Alias::callable("shout", |call| {
            for line in BufReader::new(&mut call.stdin).lines() {
                writeln!(call.stdout, "{}", line?.to_uppercase())?;
            }
            Ok(Value::None)
        }),
    );
    assert_eq!(ev.eval("$(printf 'a\\nb\\n' | shout)").unwrap().value, Value::from("A\nB"));
}

#[test]
fn test_callable_return_value_is_status() {
    let mut ev = evaluator();
    ev.session()
        .aliases()
        .set("fail4", Alias::callable("fail4", |_| Ok(Value::Int(4))));
    ev.session().aliases().set(
        "boom",
        Alias::callable("boom", |_| Err(AliasError::Failed("boom".to_string()))),
    );
    assert_eq!(ev.eval("fail4").unwrap().exit_code, 4);
    assert_eq!(ev.eval("boom").unwrap().exit_code, 1);
}

#[test]
fn test_callable_sees_session_env_and_cwd() {
    let dir = tempfile::tempdir().unwrap();
    let mut ev = evaluator();
    ev.session().set_cwd(dir.path().to_path_buf());
    ev.session().aliases().set(
        "where",
        Alias::callable("where", |call| {
            writeln!(call.stdout, "{} {}", call.cwd.display(), call.env["DUOSH_ALIAS_T"])?;
            Ok(Value::None)
        }),
    );
    ev.eval("$DUOSH_ALIAS_T = 'set'").unwrap();
    let out = ev.eval("$(where)").unwrap().value;
    assert_eq!(out.to_str(), format!("{} set", dir.path().display()));
}

#[test]
fn test_interruptible_callable_stops() {
    let mut ev = evaluator();
    let started = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&started);
    ev.session().aliases().set(
        "spin",
        Alias::callable("spin", move |call| {
            flag.store(true, Ordering::SeqCst);
            loop {
                call.check_interrupt()?;
                std::thread::sleep(Duration::from_millis(5));
            }
        }),
    );
    ev.eval("p = !(spin)").unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !started.load(Ordering::SeqCst) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    ev.eval("p.interrupt()").unwrap();
    // The interrupt is re-raised once on the waiting thread
    let err = ev.eval("p.returncode").unwrap_err();
    assert!(err.is_interrupt());
    assert_eq!(ev.eval("p.returncode").unwrap().value, Value::Int(-2));
}

#[test]
fn test_streamed_callable_stops_on_session_interrupt() {
    for line in ["spin", "$[spin]"] {
        let mut ev = evaluator();
        let started = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&started);
        ev.session().aliases().set(
            "spin",
            Alias::callable("spin", move |call| {
                flag.store(true, Ordering::SeqCst);
                loop {
                    call.check_interrupt()?;
                    std::thread::sleep(Duration::from_millis(5));
                }
            }),
        );
        let interrupt = ev.session().interrupt().clone();
        let raiser = std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !started.load(Ordering::SeqCst) && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            interrupt.raise();
        });
        let begun = Instant::now();
        let err = ev.eval(line).unwrap_err();
        raiser.join().unwrap();
        assert!(err.is_interrupt(), "{}: {:?}", line, err);
        assert!(begun.elapsed() < Duration::from_secs(5));
    }
}

#[test]
fn test_callable_receives_call_stack() {
    let mut ev = evaluator();
    ev.session().aliases().set(
        "whereami",
        Alias::callable("whereami", |call| {
            let stack = call.stack.clone().unwrap_or_default();
            writeln!(call.stdout, "{}", stack.join(">"))?;
            Ok(Value::None)
        })
        .with_stack()
        .unthreadable(),
    );
    let src = "def inner() {\n  whereami\n}\ndef outer() {\n  inner()\n}\nouter()";
    assert_eq!(ev.eval(src).unwrap().output, "outer>inner\n");
}

#[test]
fn test_source_alias_binds_args() {
    let mut ev = evaluator();
    ev.eval("alias('greet', 'print(\"hello\", args[0]) ; echo done')").unwrap();
    let out = ev.eval("greet world").unwrap().output;
    assert_eq!(out, "hello world\ndone\n");
}

#[test]
fn test_function_alias_output_feeds_pipe() {
    let mut ev = evaluator();
    // A function alias gets its arguments as parameters
    ev.eval("def mk(x) {\n  print(x)\n  print('a')\n}\nalias('mk', mk)").unwrap();
    assert_eq!(ev.eval("$(mk z | sort)").unwrap().value, Value::from("a\nz"));
}

#[test]
fn test_function_alias_return_sets_status() {
    let mut ev = evaluator();
    ev.eval("def check(x) {\n  return int(x)\n}\nalias('check', check)").unwrap();
    assert_eq!(ev.eval("check 0").unwrap().exit_code, 0);
    assert_eq!(ev.eval("check 7").unwrap().exit_code, 7);
}

#[test]
fn test_unalias_command() {
    assert_eq!(eval("alias('gone', 'echo x')\nunalias gone\n$(which gone)").unwrap(), "");
}
