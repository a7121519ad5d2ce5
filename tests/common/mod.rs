//! Common test utilities for duosh integration tests

pub use duosh::{EvalError, EvalResult, Evaluator, Session, Value};

/// Fresh non-interactive evaluator with captured output
#[allow(dead_code)]
pub fn evaluator() -> Evaluator {
    Evaluator::capturing(Session::new(false))
}

/// Helper to evaluate duosh input and return output
#[allow(dead_code)]
pub fn eval(input: &str) -> Result<String, String> {
    let result = evaluator().eval(input).map_err(|e| e.to_string())?;
    Ok(result.output)
}

/// Helper to evaluate and get the value of the trailing expression
#[allow(dead_code)]
pub fn eval_value(input: &str) -> Value {
    evaluator().eval(input).unwrap().value
}

/// Helper to evaluate and get exit code
#[allow(dead_code)]
pub fn eval_exit_code(input: &str) -> i32 {
    match evaluator().eval(input) {
        Ok(result) => result.exit_code,
        Err(e) => e.exit_code(),
    }
}
