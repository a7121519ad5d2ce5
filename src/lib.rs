//! duosh - a shell whose grammar is a small scripting language extended
//! with subprocess pipelines.
//!
//! # Overview
//!
//! Every line is either host code or a command line, and the shell decides
//! which. A statement whose leading name is unbound in the current scope
//! runs as a command:
//!
//! ```text
//! ls -l                   # `ls` is unbound: a command
//! ls = 3
//! ls -l                   # now `ls - l`: host arithmetic
//! ```
//!
//! # Subprocess operators
//!
//! ```text
//! $[make -j4]             # stream to the terminal, value None
//! x = $(git rev-parse HEAD)   # stdout as a string, trailing newline stripped
//! p = !(grep -r todo .)   # pipeline handle: p.returncode, p.output, p.lines
//! ![ls | wc -l]           # like an implicit command line
//! echo @(names) $HOME     # splice host values and environment variables
//! sleep 100 &             # background job; see `jobs`, `fg`, `bg`
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use duosh::{Evaluator, Session};
//!
//! let mut ev = Evaluator::capturing(Session::new(false));
//! let result = ev.eval("name = $(echo world)\nprint('hello', name)").unwrap();
//! assert_eq!(result.output, "hello world\n");
//! ```

#[cfg(not(unix))]
compile_error!("duosh needs a unix platform (process groups, waitpid, terminal control)");

pub mod aliases;
pub mod ast;
pub mod cmdline;
pub mod config;
pub mod disambiguate;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod procs;
pub mod resolver;
pub mod session;
pub mod signals;
pub mod value;

// Re-export commonly used items
pub use aliases::{Alias, AliasCall, AliasError, AliasRegistry, NestedAlias};
pub use ast::{Capture, Expr, Stmt};
pub use config::Settings;
pub use disambiguate::{disambiguate, ScopeSnapshot};
pub use eval::{EvalError, EvalResult, Evaluator};
pub use parser::{parse_expression, parse_unit, ParseError};
pub use procs::{CommandPipeline, JobControl, ProcError};
pub use session::Session;
pub use value::Value;

/// Evaluate `input` in a fresh non-interactive session with captured output.
pub fn eval(input: &str) -> Result<EvalResult, EvalError> {
    Evaluator::capturing(Session::new(false)).eval(input)
}
