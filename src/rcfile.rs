use crate::terminal::{execute_line, report_error};
use duosh::{EvalError, Evaluator};
use std::env;
use std::fs;
use std::path::PathBuf;

/// Get home directory
pub(crate) fn dirs_home() -> Option<PathBuf> {
    env::var_os("HOME").map(PathBuf::from)
}

/// Load and execute ~/.duoshrc if it exists.
///
/// The file runs as one unit, so a syntax error anywhere skips all of it.
/// An `exit` inside the rc file is returned to the caller.
pub(crate) fn load_duoshrc(eval: &mut Evaluator) -> Option<i32> {
    let rc_path = dirs_home()?.join(".duoshrc");

    let content = match fs::read_to_string(&rc_path) {
        Ok(c) => c,
        Err(_) => return None,
    };
    tracing::debug!(path = %rc_path.display(), "loading rc file");

    match execute_line(eval, &content, false) {
        Ok(_) => None,
        Err(EvalError::Exit(code)) => Some(code),
        Err(e) => {
            eprint!("~/.duoshrc: ");
            report_error(&e);
            None
        }
    }
}
