//! Integration tests for choosing host or subprocess mode per statement

#[path = "common/mod.rs"]
mod common;
use common::{eval, eval_value, evaluator, EvalError, Value};

#[test]
fn test_unbound_name_runs_command() {
    assert_eq!(eval("echo hi").unwrap(), "hi\n");
}

#[test]
fn test_binding_a_name_switches_to_host() {
    let mut ev = evaluator();
    let before = ev.eval("ls -d /").unwrap();
    assert_eq!(before.output, "/\n");

    // Once `ls` and `l` are bound, `ls -l` is arithmetic
    let after = ev.eval("ls = 10\nl = 3\nls -l").unwrap();
    assert_eq!(after.value, Value::Int(7));
    assert_eq!(after.output, "");
}

#[test]
fn test_host_only_statement() {
    assert_eq!(eval_value("x = [1, 2]\nlen(x)"), Value::Int(2));
}

#[test]
fn test_command_only_statement() {
    // Not valid host code at all
    assert_eq!(eval("echo a | tr a b").unwrap(), "b\n");
}

#[test]
fn test_function_params_are_bound_inside_body() {
    let src = "def f(echo) {\n  return echo + 1\n}\nf(1)";
    assert_eq!(eval_value(src), Value::Int(2));
}

#[test]
fn test_name_bound_later_in_unit() {
    // `greet` is bound by the def before the call line
    let src = "def greet(who) {\n  print('hi', who)\n}\ngreet('you')";
    assert_eq!(eval(src).unwrap(), "hi you\n");
}

#[test]
fn test_syntax_error_stops_whole_unit() {
    let mut ev = evaluator();
    let err = ev.eval("echo first\nx = (1 +)").unwrap_err();
    assert!(matches!(err, EvalError::Parse(_)));
}

#[test]
fn test_prefix_operator_keeps_host_mode() {
    // `not` and unary minus are not call targets, so the line stays host code
    let err = evaluator().eval("not false").unwrap_err();
    assert!(matches!(err, EvalError::Name(ref name) if name == "false"));
    assert_eq!(eval_value("-len([1, 2])"), Value::Int(-2));
}
