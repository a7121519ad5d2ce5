use crate::rcfile::{dirs_home, load_duoshrc};
use crate::terminal::{execute_line, report_error};
use duosh::signals::setup_signal_handlers;
use duosh::{parse_unit, EvalError, Evaluator, Session};
use rustyline::error::ReadlineError;
use rustyline::{DefaultEditor, Result as RlResult};

const CONTINUATION_PROMPT: &str = "... ";

/// `~/src/duosh $ `, with the last status when it was nonzero.
fn prompt(session: &Session, last_code: i32) -> String {
    let cwd = session.cwd();
    let shown = match dirs_home() {
        Some(home) if cwd.starts_with(&home) => match cwd.strip_prefix(&home) {
            Ok(rest) if rest.as_os_str().is_empty() => "~".to_string(),
            Ok(rest) => format!("~/{}", rest.display()),
            Err(_) => cwd.display().to_string(),
        },
        _ => cwd.display().to_string(),
    };
    if last_code == 0 {
        format!("{} $ ", shown)
    } else {
        format!("[{}] {} $ ", last_code, shown)
    }
}

/// Print one line per background job that finished since the last prompt.
fn report_finished_jobs(session: &Session) {
    for info in session.jobs().reap() {
        eprintln!("{}", info.posix());
    }
}

/// Whether the shell may exit now. With unfinished jobs the first attempt
/// only lists them; a second attempt in a row exits and terminates them.
fn confirm_exit(session: &Session, warned: &mut bool) -> bool {
    let live = session.jobs().unfinished();
    if live.is_empty() || *warned {
        return true;
    }
    eprintln!("duosh: there are unfinished jobs");
    for info in &live {
        eprintln!("{}", info.posix());
    }
    eprintln!("duosh: exit again to terminate them");
    *warned = true;
    false
}

/// True when `input` parses or fails for a reason more lines cannot fix.
fn is_complete(input: &str) -> bool {
    match parse_unit(input) {
        Ok(_) => true,
        Err(e) => !e.is_incomplete(),
    }
}

/// Run the interactive loop; returns the shell's exit status.
pub(crate) fn run_repl(no_rc: bool) -> RlResult<i32> {
    let session = Session::new(true);
    setup_signal_handlers(session.interrupt().clone(), session.jobs().enabled());
    let mut eval = Evaluator::new(session.clone());

    if !no_rc {
        if let Some(code) = load_duoshrc(&mut eval) {
            return Ok(code);
        }
    }

    let mut rl = DefaultEditor::new()?;

    // Try to load history
    let history_path = dirs_home().map(|h| h.join(".duosh_history"));
    if let Some(ref path) = history_path {
        let _ = rl.load_history(path);
    }

    let mut buffer = String::new();
    let mut warned = false;
    let code = loop {
        if buffer.is_empty() {
            report_finished_jobs(&session);
        }
        let prompt = if buffer.is_empty() {
            prompt(&session, eval.last_returncode())
        } else {
            CONTINUATION_PROMPT.to_string()
        };

        match rl.readline(&prompt) {
            Ok(line) => {
                if !buffer.is_empty() {
                    buffer.push('\n');
                }
                buffer.push_str(&line);
                if !is_complete(&buffer) {
                    continue;
                }

                let input = std::mem::take(&mut buffer);
                if !input.trim().is_empty() {
                    let _ = rl.add_history_entry(input.as_str());
                }
                // A Ctrl+C typed at the prompt must not cancel the next command
                session.interrupt().take();

                match execute_line(&mut eval, &input, true) {
                    Err(EvalError::Exit(code)) => {
                        if confirm_exit(&session, &mut warned) {
                            break code;
                        }
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) if e.is_interrupt() => eprintln!("^C"),
                    Err(e) => report_error(&e),
                }
                if !input.trim().is_empty() {
                    warned = false;
                }
            }
            Err(ReadlineError::Interrupted) => {
                buffer.clear();
                continue;
            }
            Err(ReadlineError::Eof) => {
                if !buffer.is_empty() {
                    buffer.clear();
                    continue;
                }
                if confirm_exit(&session, &mut warned) {
                    break eval.last_returncode();
                }
            }
            Err(e) => {
                eprintln!("duosh: {}", e);
                break 1;
            }
        }
    };

    session.jobs().hangup_all();

    // Save history
    if let Some(ref path) = history_path {
        let _ = rl.save_history(path);
    }

    Ok(code)
}
