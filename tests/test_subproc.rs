//! Integration tests for subprocess operators, expansion and redirection

#[path = "common/mod.rs"]
mod common;
use common::{eval, eval_exit_code, eval_value, evaluator, EvalError, Value};
use duosh::ProcError;
use std::fs;

#[test]
fn test_captured_stdout_strips_one_newline() {
    assert_eq!(eval_value("$(printf 'a\\n\\n')"), Value::from("a\n"));
}

#[test]
fn test_uncaptured_returns_none() {
    let mut ev = evaluator();
    let result = ev.eval("$[echo streamed]").unwrap();
    assert_eq!(result.value, Value::None);
    assert_eq!(result.output, "streamed\n");
}

#[test]
fn test_object_capture_attributes() {
    let mut ev = evaluator();
    ev.eval("p = !(sh -c 'echo one; echo two; exit 2')").unwrap();
    assert_eq!(ev.eval("p.returncode").unwrap().value, Value::Int(2));
    assert_eq!(
        ev.eval("p.lines").unwrap().value,
        Value::List(vec![Value::from("one"), Value::from("two")])
    );
    assert_eq!(ev.eval("p.executed_cmd").unwrap().value, Value::from("sh -c echo one; echo two; exit 2"));
    assert_eq!(ev.eval("bool(p)").unwrap().value, Value::Bool(false));
}

#[test]
fn test_iterating_a_pipeline_yields_lines() {
    let src = "n = 0\nfor line in !(printf 'x\\ny\\nz\\n') {\n  n = n + 1\n}\nn";
    assert_eq!(eval_value(src), Value::Int(3));
}

#[test]
fn test_pipeline_return_code_is_last_stage() {
    assert_eq!(eval_exit_code("false | true"), 0);
    assert_eq!(eval_exit_code("true | false"), 1);
}

#[test]
fn test_not_inverts_status() {
    // Bare `not false` is host code; the operator forces command mode
    assert_eq!(eval_exit_code("![not false]"), 0);
    assert_eq!(eval_exit_code("![not true]"), 1);
    assert_eq!(eval_value("not False"), Value::Bool(true));
}

#[test]
fn test_splice_list_and_adjacent_text() {
    let out = eval_value("exts = ['rs', 'md']\n$(echo file.@(exts))");
    assert_eq!(out, Value::from("file.rs file.md"));
}

#[test]
fn test_nested_capture_is_one_argument() {
    let out = eval_value("$(printf '<%s>' $(echo a b))");
    assert_eq!(out, Value::from("<a b>"));
    let split = eval_value("$(printf '<%s>' @$(echo a b))");
    assert_eq!(split, Value::from("<a><b>"));
}

#[test]
fn test_redirect_write_and_append() {
    let dir = tempfile::tempdir().unwrap();
    let mut ev = evaluator();
    ev.session().set_cwd(dir.path().to_path_buf());
    ev.eval("echo first > out.txt\necho second >> out.txt").unwrap();
    let contents = fs::read_to_string(dir.path().join("out.txt")).unwrap();
    assert_eq!(contents, "first\nsecond\n");
}

#[test]
fn test_redirect_stdin_from_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("in.txt"), "b\na\n").unwrap();
    let mut ev = evaluator();
    ev.session().set_cwd(dir.path().to_path_buf());
    assert_eq!(ev.eval("$(sort < in.txt)").unwrap().value, Value::from("a\nb"));
}

#[test]
fn test_stderr_merged_into_capture() {
    let out = eval_value("$(sh -c 'echo oops >&2' 2>&1)");
    assert_eq!(out, Value::from("oops"));
}

#[test]
fn test_glob_expands_in_session_cwd() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("b.log"), "").unwrap();
    fs::write(dir.path().join("a.log"), "").unwrap();
    let mut ev = evaluator();
    ev.session().set_cwd(dir.path().to_path_buf());
    assert_eq!(ev.eval("$(echo *.log)").unwrap().value, Value::from("a.log b.log"));
    assert_eq!(ev.eval("$(echo '*.log')").unwrap().value, Value::from("*.log"));
}

#[test]
fn test_not_found_and_not_executable() {
    assert_eq!(eval_exit_code("duosh-missing-command-abc"), 127);

    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("plain"), "").unwrap();
    let mut ev = evaluator();
    ev.session().set_cwd(dir.path().to_path_buf());
    assert_eq!(ev.eval("./plain").unwrap().exit_code, 126);
}

#[test]
fn test_object_capture_of_missing_command_raises() {
    let err = evaluator().eval("!(duosh-missing-command-abc)").unwrap_err();
    assert!(matches!(err, EvalError::Proc(ProcError::NotFound(_))));
}

#[test]
fn test_signal_death_reports_negative_code() {
    let mut ev = evaluator();
    ev.eval("p = !(sh -c 'kill -TERM $$')").unwrap();
    assert_eq!(ev.eval("p.returncode").unwrap().value, Value::Int(-15));
    assert_eq!(
        ev.eval("p.signal").unwrap().value,
        Value::List(vec![Value::from("SIGTERM"), Value::Bool(false)])
    );
}

#[test]
fn test_signal_death_upstream_of_silent_stage() {
    // Same code whatever the capture mode or the last command
    assert_eq!(eval_exit_code("sh -c 'kill -TERM $$' | cat"), -15);
    assert_eq!(eval_exit_code("$[sh -c 'kill -TERM $$' | cat]"), -15);
    assert_eq!(eval_exit_code("sh -c 'kill -TERM $$' | grep x"), -15);
    assert_eq!(eval_value("!(sh -c 'kill -TERM $$' | cat).returncode"), Value::Int(-15));
}

#[test]
fn test_environment_is_passed_to_children() {
    let out = eval_value("$DUOSH_CHILD_VAR = 'visible'\n$(sh -c 'echo $DUOSH_CHILD_VAR')");
    assert_eq!(out, Value::from("visible"));
}
