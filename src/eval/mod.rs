//! Evaluator for duosh programs.
//!
//! Source text goes through three steps before anything runs:
//! - `parse_unit` produces statements, simple ones still ambiguous
//! - the disambiguator picks host or subprocess mode for each, using the
//!   names bound in the current scope
//! - the resolved unit executes statement by statement
//!
//! The evaluator is split across submodules by concern:
//! - `expr`: host expressions, operators, attributes and methods
//! - `subproc`: subprocess chains, word expansion, capture modes
//! - `builtins`: host builtin functions (`print`, `len`, `alias`, ...)
//! - `aliases`: the default alias table (`cd`, `jobs`, `fg`, ...)

mod aliases;
mod builtins;
mod expr;
mod subproc;

use crate::aliases::NestedAlias;
use crate::ast::{FunctionDef, Stmt, Target};
use crate::disambiguate::{disambiguate, ScopeSnapshot};
use crate::parser::{parse_unit, ParseError};
use crate::procs::pipe::StreamBuffer;
use crate::procs::{HostIo, JobError, NestedRunner, ProcError};
use crate::session::Session;
use crate::value::Value;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::sync::Arc;
use thiserror::Error;

pub(crate) use builtins::{BUILTINS, COMMAND_WORDS};

#[derive(Error, Debug)]
pub enum EvalError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Proc(#[from] ProcError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("name '{0}' is not defined")]
    Name(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("index error: {0}")]
    Index(String),
    #[error("value error: {0}")]
    Value(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("maximum recursion depth exceeded")]
    Recursion,
    /// Internal: unwinds to the enclosing function call
    #[error("'return' outside function")]
    Return(Value),
    /// Internal: unwinds to the enclosing loop
    #[error("'break' outside loop")]
    Break,
    /// Internal: unwinds to the enclosing loop
    #[error("'continue' outside loop")]
    Continue,
    #[error("exit {0}")]
    Exit(i32),
}

impl EvalError {
    /// Process exit status for an error that ends a non-interactive run.
    pub fn exit_code(&self) -> i32 {
        match self {
            EvalError::Proc(e) => e.exit_code(),
            EvalError::Job(JobError::Proc(e)) => e.exit_code(),
            EvalError::Exit(code) => *code,
            _ => 1,
        }
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(
            self,
            EvalError::Proc(ProcError::Interrupted) | EvalError::Job(JobError::Proc(ProcError::Interrupted))
        )
    }
}

/// Result of evaluating one compilation unit.
#[derive(Debug, Clone)]
pub struct EvalResult {
    /// Value of the last expression statement, `None` otherwise
    pub value: Value,
    /// Host output written since the previous call, when capturing
    pub output: String,
    /// Return code of the last foreground pipeline
    pub exit_code: i32,
}

/// Local variables of one function or source-alias call.
#[derive(Debug)]
pub(crate) struct Frame {
    name: String,
    locals: HashMap<String, Value>,
}

/// The host interpreter.
pub struct Evaluator {
    pub(crate) session: Session,
    globals: HashMap<String, Value>,
    pub(crate) frames: Vec<Frame>,
    pub(crate) last_returncode: i32,
    /// Where host output goes instead of the terminal
    pub(crate) out_override: Option<Arc<StreamBuffer>>,
    /// Default stdin for pipelines started from nested aliases
    pub(crate) in_override: Option<File>,
    /// Read position in the capture buffer of a capturing evaluator
    captured_pos: usize,
    capture: Option<Arc<StreamBuffer>>,
}

impl Evaluator {
    /// Evaluator writing to the terminal, with the default aliases installed.
    pub fn new(session: Session) -> Self {
        aliases::install_defaults(&session);
        Evaluator {
            session,
            globals: HashMap::new(),
            frames: Vec::new(),
            last_returncode: 0,
            out_override: None,
            in_override: None,
            captured_pos: 0,
            capture: None,
        }
    }

    /// Evaluator whose host output and uncaptured command output are
    /// collected into [`EvalResult::output`] instead of the terminal.
    pub fn capturing(session: Session) -> Self {
        let mut evaluator = Evaluator::new(session);
        let buf = StreamBuffer::new();
        evaluator.out_override = Some(Arc::clone(&buf));
        evaluator.capture = Some(buf);
        evaluator
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn last_returncode(&self) -> i32 {
        self.last_returncode
    }

    /// Parse, disambiguate and run `src`.
    pub fn eval(&mut self, src: &str) -> Result<EvalResult, EvalError> {
        let value = self.eval_source(src)?;
        Ok(EvalResult {
            value,
            output: self.take_output(),
            exit_code: self.last_returncode,
        })
    }

    fn take_output(&mut self) -> String {
        let Some(buf) = &self.capture else {
            return String::new();
        };
        let bytes = buf.contents();
        let start = self.captured_pos.min(bytes.len());
        self.captured_pos = bytes.len();
        String::from_utf8_lossy(&bytes[start..]).into_owned()
    }

    pub(crate) fn eval_source(&mut self, src: &str) -> Result<Value, EvalError> {
        let stmts = parse_unit(src)?;
        let stmts = disambiguate(stmts, self.scope_snapshot())?;
        tracing::trace!(statements = stmts.len(), "unit resolved");
        self.exec_unit(&stmts)
    }

    /// Run a resolved unit, returning the value of a trailing expression.
    fn exec_unit(&mut self, stmts: &[Stmt]) -> Result<Value, EvalError> {
        let mut last = Value::None;
        for stmt in stmts {
            last = match stmt {
                Stmt::Expr(expr) => self.eval_expr(expr)?,
                other => {
                    self.exec_stmt(other)?;
                    Value::None
                }
            };
            self.check_signals()?;
        }
        Ok(last)
    }

    /// Names visible to the disambiguator right now.
    pub fn scope_snapshot(&self) -> ScopeSnapshot {
        let mut names: Vec<&str> = BUILTINS
            .iter()
            .copied()
            .filter(|b| !COMMAND_WORDS.contains(b))
            .collect();
        names.extend(self.globals.keys().map(String::as_str));
        if let Some(frame) = self.frames.last() {
            names.extend(frame.locals.keys().map(String::as_str));
        }
        ScopeSnapshot::new(names)
    }

    pub fn get_var(&self, name: &str) -> Option<Value> {
        self.frames
            .last()
            .and_then(|f| f.locals.get(name))
            .or_else(|| self.globals.get(name))
            .cloned()
    }

    pub fn set_var(&mut self, name: &str, value: Value) {
        match self.frames.last_mut() {
            Some(frame) => frame.locals.insert(name.to_string(), value),
            None => self.globals.insert(name.to_string(), value),
        };
    }

    /// Pending Ctrl+C or `exit` request.
    fn check_signals(&mut self) -> Result<(), EvalError> {
        if let Some(code) = self.session.take_exit_request() {
            return Err(EvalError::Exit(code));
        }
        if self.session.interrupt().take() {
            return Err(ProcError::Interrupted.into());
        }
        Ok(())
    }

    pub(crate) fn exec_block(&mut self, stmts: &[Stmt]) -> Result<(), EvalError> {
        for stmt in stmts {
            self.exec_stmt(stmt)?;
            self.check_signals()?;
        }
        Ok(())
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Result<(), EvalError> {
        match stmt {
            Stmt::Expr(expr) => {
                self.eval_expr(expr)?;
            }
            Stmt::Assign(target, expr) => {
                let value = self.eval_expr(expr)?;
                self.assign(target, value)?;
            }
            Stmt::If { branches, orelse } => {
                for (cond, body) in branches {
                    if self.eval_expr(cond)?.truthy() {
                        return self.exec_block(body);
                    }
                }
                if let Some(body) = orelse {
                    self.exec_block(body)?;
                }
            }
            Stmt::While(cond, body) => {
                while self.eval_expr(cond)?.truthy() {
                    match self.exec_block(body) {
                        Ok(()) | Err(EvalError::Continue) => {}
                        Err(EvalError::Break) => break,
                        Err(e) => return Err(e),
                    }
                }
            }
            Stmt::For(var, iter, body) => {
                let value = self.eval_expr(iter)?;
                let items = self.iterate(value)?;
                for item in items {
                    self.set_var(var, item);
                    match self.exec_block(body) {
                        Ok(()) | Err(EvalError::Continue) => {}
                        Err(EvalError::Break) => break,
                        Err(e) => return Err(e),
                    }
                }
            }
            Stmt::Def(def) => {
                self.set_var(&def.name, Value::Function(Arc::clone(def)));
            }
            Stmt::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.eval_expr(expr)?,
                    None => Value::None,
                };
                return Err(EvalError::Return(value));
            }
            Stmt::Break => return Err(EvalError::Break),
            Stmt::Continue => return Err(EvalError::Continue),
            Stmt::Pass => {}
            Stmt::Ambiguous(_) => {
                let resolved = disambiguate(vec![stmt.clone()], self.scope_snapshot())?;
                return self.exec_block(&resolved);
            }
        }
        Ok(())
    }

    fn assign(&mut self, target: &Target, value: Value) -> Result<(), EvalError> {
        match target {
            Target::Name(name) => self.set_var(name, value),
            Target::Env(name) => match value {
                Value::None => self.session.unset_env(name),
                other => self.session.set_env(name, &other.to_str()),
            },
            Target::Index(base, index) => {
                let crate::ast::Expr::Name(name) = base else {
                    return Err(EvalError::Type("only named lists support item assignment".into()));
                };
                let name = name.clone();
                let index = self.eval_expr(index)?;
                let mut list = match self.get_var(&name) {
                    Some(Value::List(items)) => items,
                    Some(other) => {
                        return Err(EvalError::Type(format!(
                            "'{}' object does not support item assignment",
                            other.type_name()
                        )))
                    }
                    None => return Err(EvalError::Name(name)),
                };
                let slot = expr::list_index(list.len(), &index)?;
                list[slot] = value;
                self.set_var(&name, Value::List(list));
            }
        }
        Ok(())
    }

    /// Items produced by a `for` loop over `value`.
    pub(crate) fn iterate(&self, value: Value) -> Result<Vec<Value>, EvalError> {
        match value {
            Value::List(items) => Ok(items),
            Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
            Value::Pipeline(p) => Ok(p.lines().map(Value::Str).collect()),
            other => Err(EvalError::Type(format!(
                "'{}' object is not iterable",
                other.type_name()
            ))),
        }
    }

    /// Call a user-defined function.
    pub(crate) fn call_function(&mut self, def: &FunctionDef, args: Vec<Value>) -> Result<Value, EvalError> {
        if args.len() != def.params.len() {
            return Err(EvalError::Type(format!(
                "{}() takes {} arguments but {} were given",
                def.name,
                def.params.len(),
                args.len()
            )));
        }
        let locals = def.params.iter().cloned().zip(args).collect();
        self.with_frame(&def.name, locals, |ev| match ev.exec_block(&def.body) {
            Ok(()) => Ok(Value::None),
            Err(EvalError::Return(value)) => Ok(value),
            Err(e) => Err(e),
        })
    }

    fn with_frame<F>(&mut self, name: &str, locals: HashMap<String, Value>, body: F) -> Result<Value, EvalError>
    where
        F: FnOnce(&mut Self) -> Result<Value, EvalError>,
    {
        if self.frames.len() >= self.session.settings().max_recursion {
            return Err(EvalError::Recursion);
        }
        self.frames.push(Frame {
            name: name.to_string(),
            locals,
        });
        let result = body(self);
        self.frames.pop();
        result
    }

    /// Run alias source text with `args` and `arg0`..`argN` bound.
    fn run_source_alias(&mut self, text: &str, argv: &[String]) -> Result<Value, EvalError> {
        let mut locals = HashMap::new();
        let args: Vec<Value> = argv[1..].iter().cloned().map(Value::Str).collect();
        locals.insert("args".to_string(), Value::List(args));
        for (i, arg) in argv.iter().enumerate() {
            locals.insert(format!("arg{}", i), Value::Str(arg.clone()));
        }
        self.with_frame(&argv[0], locals, |ev| {
            ev.eval_source(text)?;
            Ok(Value::Int(ev.last_returncode as i64))
        })
    }

    /// Write host output (from `print` and friends).
    pub(crate) fn write_out(&mut self, text: &str) -> Result<(), EvalError> {
        match &self.out_override {
            Some(buf) => buf.push(text.as_bytes()),
            None => {
                let mut stdout = io::stdout().lock();
                stdout.write_all(text.as_bytes())?;
                stdout.flush()?;
            }
        }
        Ok(())
    }

    pub(crate) fn host_io(&self) -> Result<HostIo, EvalError> {
        Ok(HostIo {
            stdin: self.in_override.as_ref().map(File::try_clone).transpose()?,
            stdout: self.out_override.clone(),
        })
    }
}

impl NestedRunner for Evaluator {
    fn run_nested(&mut self, alias: &NestedAlias, argv: &[String], io: HostIo) -> Result<i32, ProcError> {
        let saved_out = std::mem::replace(&mut self.out_override, io.stdout);
        let saved_in = std::mem::replace(&mut self.in_override, io.stdin);
        let saved_rc = self.last_returncode;
        let result = match alias {
            NestedAlias::Source(text) => self.run_source_alias(text, argv),
            NestedAlias::Function(def) => {
                let args = argv[1..].iter().cloned().map(Value::Str).collect();
                self.call_function(def, args)
            }
        };
        self.out_override = saved_out;
        self.in_override = saved_in;
        self.last_returncode = saved_rc;
        match result {
            Ok(value) => Ok(value.exit_code()),
            Err(EvalError::Proc(ProcError::Interrupted)) => Err(ProcError::Interrupted),
            Err(EvalError::Exit(code)) => {
                self.session.request_exit(code);
                Ok(code)
            }
            Err(e) => {
                eprintln!("duosh: {}: {}", argv[0], e);
                Ok(e.exit_code().max(1))
            }
        }
    }

    fn call_stack(&self) -> Vec<String> {
        self.frames.iter().map(|f| f.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator() -> Evaluator {
        Evaluator::capturing(Session::new(false))
    }

    #[test]
    fn test_host_statements_run() {
        let mut ev = evaluator();
        let result = ev.eval("x = 2\ny = x * 3\nprint(y)").unwrap();
        assert_eq!(result.output, "6\n");
    }

    #[test]
    fn test_trailing_expression_is_value() {
        let mut ev = evaluator();
        assert_eq!(ev.eval("1 + 2").unwrap().value, Value::Int(3));
    }

    #[test]
    fn test_functions_and_recursion() {
        let mut ev = evaluator();
        let src = "def fact(n) {\n if n <= 1 { return 1 }\n return n * fact(n - 1)\n}\nfact(5)";
        assert_eq!(ev.eval(src).unwrap().value, Value::Int(120));
    }

    #[test]
    fn test_loops_with_break_and_continue() {
        let mut ev = evaluator();
        let src = "total = 0\nfor i in range(10) {\n if i == 3 { continue }\n if i == 6 { break }\n total = total + i\n}\ntotal";
        assert_eq!(ev.eval(src).unwrap().value, Value::Int(12));
    }

    #[test]
    fn test_unbounded_recursion_is_an_error() {
        let mut ev = evaluator();
        let err = ev.eval("def f() { return f() }\nf()").unwrap_err();
        assert!(matches!(err, EvalError::Recursion));
    }

    #[test]
    fn test_recursion_limit_from_session() {
        let mut ev = evaluator();
        let src = "def down(n) {\n  if n == 0 {\n    return 0\n  }\n  return down(n - 1)\n}";
        ev.eval(src).unwrap();
        assert_eq!(ev.eval("down(40)").unwrap().value, Value::Int(0));
        ev.eval("$DUOSH_MAX_RECURSION = '10'").unwrap();
        assert!(matches!(ev.eval("down(40)").unwrap_err(), EvalError::Recursion));
        assert_eq!(ev.eval("down(5)").unwrap().value, Value::Int(0));
    }

    #[test]
    fn test_env_assignment_is_session_local() {
        let mut ev = evaluator();
        ev.eval("$DUOSH_EVAL_TEST = 'on'").unwrap();
        assert_eq!(ev.session().get_env("DUOSH_EVAL_TEST").as_deref(), Some("on"));
        assert!(std::env::var("DUOSH_EVAL_TEST").is_err());
    }

    #[test]
    fn test_item_assignment() {
        let mut ev = evaluator();
        assert_eq!(
            ev.eval("xs = [1, 2, 3]\nxs[-1] = 9\nxs").unwrap().value,
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(9)])
        );
    }

    #[test]
    fn test_syntax_error_blocks_whole_unit() {
        let mut ev = evaluator();
        let err = ev.eval("x = 1\ny = (").unwrap_err();
        assert!(matches!(err, EvalError::Parse(_)));
        assert!(ev.get_var("x").is_none());
    }
}
