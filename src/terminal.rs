use duosh::{EvalError, Evaluator};

/// Execute one unit of input. In the REPL, the value of a trailing
/// expression is echoed.
pub(crate) fn execute_line(eval: &mut Evaluator, input: &str, print_value: bool) -> Result<i32, EvalError> {
    // Empty input is OK
    if input.trim().is_empty() {
        return Ok(eval.last_returncode());
    }

    let result = eval.eval(input)?;
    if print_value && !result.value.is_none() {
        println!("{}", result.value.repr());
    }
    Ok(result.exit_code)
}

/// Run a whole script or `-c` command; returns the process exit status.
///
/// Errors end the run: `exit(n)` yields `n`, anything else is reported on
/// stderr with its conventional status.
pub(crate) fn run_unit(eval: &mut Evaluator, input: &str) -> i32 {
    match execute_line(eval, input, false) {
        Ok(code) => code,
        Err(EvalError::Exit(code)) => code,
        Err(e) => {
            report_error(&e);
            e.exit_code()
        }
    }
}

/// One-line `duosh: ...` message for an error that reached the top level.
pub(crate) fn report_error(e: &EvalError) {
    tracing::debug!(error = ?e, "unit failed");
    eprintln!("duosh: {}", e);
}
