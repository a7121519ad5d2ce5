//! Subprocess mode: word expansion, command chains and capture modes.

use super::{EvalError, Evaluator};
use crate::ast::{Capture, CmdChain, CmdWord, CommandAst, PipelineAst, Redirect, SubprocExpr, WordPart};
use crate::procs::{
    assemble, ArgPiece, ArgWord, CommandPipeline, ExpandedCall, ExpandedRedirect, ProcError, SpecBuilder,
};
use crate::value::Value;
use std::sync::Arc;

/// Drop one trailing newline, as command substitution does.
fn strip_newline(mut text: String) -> String {
    if text.ends_with('\n') {
        text.pop();
        if text.ends_with('\r') {
            text.pop();
        }
    }
    text
}

impl Evaluator {
    /// Evaluate a subprocess expression in its capture mode.
    pub(crate) fn eval_subproc(&mut self, sp: &SubprocExpr) -> Result<Value, EvalError> {
        if let (Capture::Object, CmdChain::Pipeline(pipeline)) = (sp.capture, &sp.chain) {
            let handle = self.start_pipeline(pipeline, Capture::Object, false)?;
            if pipeline.background {
                self.register_background(&handle);
            }
            return Ok(Value::Pipeline(handle));
        }

        let mut ran = Vec::new();
        let code = self.run_chain(&sp.chain, sp.capture, false, &mut ran)?;
        self.last_returncode = code;

        if sp.capture != Capture::Object && code != 0 && self.session.settings().raise_subproc_error {
            if let Some(last) = ran.last() {
                last.check()?;
                return Err(ProcError::CalledProcess {
                    cmd: last.executed_cmd(),
                    code,
                }
                .into());
            }
        }

        match sp.capture {
            Capture::Stdout => Ok(Value::Str(self.chain_output(&ran)?)),
            Capture::Object => Ok(ran.pop().map(Value::Pipeline).unwrap_or(Value::None)),
            Capture::Uncaptured | Capture::Hidden => Ok(Value::None),
        }
    }

    fn chain_output(&self, ran: &[Arc<CommandPipeline>]) -> Result<String, EvalError> {
        let mut text = String::new();
        for pipeline in ran {
            text.push_str(&pipeline.output()?);
        }
        Ok(strip_newline(text))
    }

    /// Run `&&`/`||`/`not` chains with shell short-circuiting.
    pub(crate) fn run_chain(
        &mut self,
        chain: &CmdChain,
        capture: Capture,
        negated: bool,
        ran: &mut Vec<Arc<CommandPipeline>>,
    ) -> Result<i32, EvalError> {
        match chain {
            CmdChain::Pipeline(pipeline) => self.run_pipeline(pipeline, capture, negated, ran),
            CmdChain::And(lhs, rhs) => {
                let code = self.run_chain(lhs, capture, negated, ran)?;
                if code == 0 {
                    self.run_chain(rhs, capture, negated, ran)
                } else {
                    Ok(code)
                }
            }
            CmdChain::Or(lhs, rhs) => {
                let code = self.run_chain(lhs, capture, negated, ran)?;
                if code != 0 {
                    self.run_chain(rhs, capture, negated, ran)
                } else {
                    Ok(code)
                }
            }
            CmdChain::Not(inner) => {
                let code = self.run_chain(inner, capture, !negated, ran)?;
                Ok(if code == 0 { 1 } else { 0 })
            }
        }
    }

    fn run_pipeline(
        &mut self,
        pipeline: &PipelineAst,
        capture: Capture,
        negated: bool,
        ran: &mut Vec<Arc<CommandPipeline>>,
    ) -> Result<i32, EvalError> {
        let handle = match self.start_pipeline(pipeline, capture, negated) {
            Ok(handle) => handle,
            Err(EvalError::Proc(e))
                if !matches!(e, ProcError::Interrupted)
                    && capture != Capture::Object
                    && !self.session.settings().raise_subproc_error =>
            {
                eprintln!("duosh: {}", e);
                self.last_returncode = e.exit_code();
                return Ok(self.last_returncode);
            }
            Err(e) => return Err(e),
        };

        let code = if pipeline.background {
            self.register_background(&handle);
            0
        } else {
            self.session.jobs().wait_foreground(&handle)?
        };
        ran.push(handle);
        self.last_returncode = code;
        Ok(code)
    }

    fn register_background(&self, handle: &Arc<CommandPipeline>) {
        if let Some(id) = self.session.jobs().add_background(Arc::clone(handle)) {
            if self.session.interactive() {
                match handle.pid() {
                    Some(pid) => eprintln!("[{}] {}", id, pid),
                    None => eprintln!("[{}]", id),
                }
            }
        }
    }

    /// Expand, build and start one pipe-chain.
    fn start_pipeline(
        &mut self,
        pipeline: &PipelineAst,
        capture: Capture,
        negated: bool,
    ) -> Result<Arc<CommandPipeline>, EvalError> {
        let builder = SpecBuilder::new(&self.session, capture, pipeline.background, negated);
        let mut specs = Vec::with_capacity(pipeline.commands.len());
        for (index, command) in pipeline.commands.iter().enumerate() {
            let call = self.expand_command(command)?;
            specs.push(builder.build(call, index)?);
        }
        tracing::debug!(
            stages = specs.len(),
            capture = ?capture,
            background = pipeline.background,
            "starting pipeline"
        );
        let settings = builder.settings().clone();
        let host = self.host_io()?;
        let session = self.session.clone();
        Ok(assemble(specs, &settings, &session, &host, self)?)
    }

    /// Evaluate the host-level parts of a command: splices, substitutions
    /// and environment variables.
    pub(crate) fn expand_command(&mut self, command: &CommandAst) -> Result<ExpandedCall, EvalError> {
        let mut words = Vec::with_capacity(command.words.len());
        for word in &command.words {
            words.push(self.expand_word(word)?);
        }
        let mut redirects = Vec::with_capacity(command.redirects.len());
        for redirect in &command.redirects {
            redirects.push(match redirect {
                Redirect::File { stream, mode, target } => ExpandedRedirect::File {
                    stream: *stream,
                    mode: *mode,
                    target: self.expand_word(target)?,
                },
                Redirect::ErrToOut => ExpandedRedirect::ErrToOut,
                Redirect::OutToErr => ExpandedRedirect::OutToErr,
            });
        }
        Ok(ExpandedCall { words, redirects })
    }

    fn expand_word(&mut self, word: &CmdWord) -> Result<ArgWord, EvalError> {
        let mut pieces = Vec::with_capacity(word.parts.len());
        for part in &word.parts {
            pieces.push(match part {
                WordPart::Literal { text, quoted } => ArgPiece::Text {
                    text: text.clone(),
                    glob: !quoted,
                },
                WordPart::Env(name) => ArgPiece::Text {
                    text: self
                        .session
                        .get_env(name)
                        .unwrap_or_else(|| format!("${}", name)),
                    glob: false,
                },
                WordPart::Splice(expr) => ArgPiece::Items(self.eval_expr(expr)?.splice_args()),
                WordPart::Captured(chain) => ArgPiece::Text {
                    text: self.capture_chain(chain)?,
                    glob: false,
                },
                WordPart::SplitCaptured(chain) => ArgPiece::Items(
                    self.capture_chain(chain)?
                        .split_whitespace()
                        .map(String::from)
                        .collect(),
                ),
                WordPart::Tilde => ArgPiece::Tilde,
            });
        }
        Ok(ArgWord { pieces })
    }

    /// Stdout of a nested `$(...)` inside a command.
    fn capture_chain(&mut self, chain: &CmdChain) -> Result<String, EvalError> {
        let mut ran = Vec::new();
        let code = self.run_chain(chain, Capture::Stdout, false, &mut ran)?;
        self.last_returncode = code;
        self.chain_output(&ran)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;

    fn eval(src: &str) -> Value {
        let mut ev = Evaluator::capturing(Session::new(false));
        ev.eval(src).unwrap().value
    }

    #[test]
    fn test_strip_newline() {
        assert_eq!(strip_newline("a\n\n".to_string()), "a\n");
        assert_eq!(strip_newline("a\r\n".to_string()), "a");
        assert_eq!(strip_newline("a".to_string()), "a");
    }

    #[test]
    fn test_stdout_capture() {
        assert_eq!(eval("$(echo hello)"), Value::from("hello"));
    }

    #[test]
    fn test_chain_short_circuits() {
        assert_eq!(eval("$(false && echo no)"), Value::from(""));
        assert_eq!(eval("$(false || echo yes)"), Value::from("yes"));
        assert_eq!(eval("$(echo a && echo b)"), Value::from("a\nb"));
    }

    #[test]
    fn test_splice_and_env_expansion() {
        let mut ev = Evaluator::capturing(Session::new(false));
        ev.eval("xs = ['one', 'two words']").unwrap();
        ev.eval("$DUOSH_SUBPROC_T = 'e'").unwrap();
        let result = ev.eval("$(printf '%s|' @(xs) $DUOSH_SUBPROC_T $DUOSH_MISSING_T)").unwrap();
        assert_eq!(result.value, Value::from("one|two words|e|$DUOSH_MISSING_T|"));
    }

    #[test]
    fn test_object_capture_is_lazy_handle() {
        match eval("!(sh -c 'echo out; echo err >&2; exit 3')") {
            Value::Pipeline(p) => {
                assert_eq!(p.wait().unwrap(), 3);
                assert_eq!(p.output().unwrap(), "out\n");
                assert_eq!(p.errors().unwrap(), "err\n");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_command_sets_127() {
        let mut ev = Evaluator::capturing(Session::new(false));
        let result = ev.eval("$[duosh-no-such-command-xyz]").unwrap();
        assert_eq!(result.exit_code, 127);
    }

    #[test]
    fn test_raise_setting_turns_failure_into_error() {
        let mut ev = Evaluator::capturing(Session::new(false));
        ev.eval("$DUOSH_RAISE_SUBPROC_ERROR = '1'").unwrap();
        let err = ev.eval("$[false]").unwrap_err();
        assert!(matches!(err, EvalError::Proc(ProcError::CalledProcess { code: 1, .. })));
        assert_eq!(err.exit_code(), 1);
    }
}
