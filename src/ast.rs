//! Syntax tree for duosh programs.
//!
//! Host statements and expressions live next to the subprocess-mode nodes
//! (`SubprocExpr` and friends). Statements the parser could not classify on
//! its own are stored as [`Stmt::Ambiguous`] until the disambiguation pass
//! picks one of the two candidate parses.

use crate::parser::ParseError;
use std::sync::Arc;

/// Byte range of a statement in its source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    None,
    Name(String),
    /// `$NAME`
    EnvVar(String),
    List(Vec<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Logic(LogicOp, Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Attr(Box<Expr>, String),
    Subproc(SubprocExpr),
}

impl Expr {
    /// Leftmost name an expression would call or load first, if any.
    ///
    /// `ls -l` parses as `ls - l` and yields `ls`; `f(x).y` yields `f`;
    /// literals and prefix operators (`not x`, `-x`) yield nothing.
    pub fn leftmost_name(&self) -> Option<&str> {
        match self {
            Expr::Name(name) => Some(name),
            Expr::Call(func, _) => func.leftmost_name(),
            Expr::Index(base, _) | Expr::Attr(base, _) => base.leftmost_name(),
            Expr::Binary(_, lhs, _) | Expr::Logic(_, lhs, _) => lhs.leftmost_name(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Name(String),
    Env(String),
    Index(Expr, Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    Assign(Target, Expr),
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        orelse: Option<Vec<Stmt>>,
    },
    While(Expr, Vec<Stmt>),
    For(String, Expr, Vec<Stmt>),
    Def(Arc<FunctionDef>),
    Return(Option<Expr>),
    Break,
    Continue,
    Pass,
    /// Undecided statement carrying both interpretations
    Ambiguous(Box<Candidates>),
}

/// The two parses of one statement, kept until disambiguation.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidates {
    pub host: Result<Stmt, ParseError>,
    pub subproc: Result<Stmt, ParseError>,
    pub span: Span,
}

/// How the result of a subprocess expression is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capture {
    /// `$[...]`: streamed straight to the terminal, nothing returned
    Uncaptured,
    /// `$(...)`: stdout returned as a string
    Stdout,
    /// `!(...)`: full pipeline handle returned
    Object,
    /// `![...]` and implicit command lines: streamed, value dropped
    Hidden,
}

impl Capture {
    pub fn captures_stdout(self) -> bool {
        matches!(self, Capture::Stdout | Capture::Object)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubprocExpr {
    pub capture: Capture,
    pub chain: CmdChain,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CmdChain {
    Pipeline(PipelineAst),
    And(Box<CmdChain>, Box<CmdChain>),
    Or(Box<CmdChain>, Box<CmdChain>),
    Not(Box<CmdChain>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineAst {
    pub commands: Vec<CommandAst>,
    pub background: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandAst {
    pub words: Vec<CmdWord>,
    pub redirects: Vec<Redirect>,
}

/// One shell word: adjacent parts with no whitespace between them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CmdWord {
    pub parts: Vec<WordPart>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WordPart {
    Literal { text: String, quoted: bool },
    Env(String),
    /// `@(expr)`
    Splice(Expr),
    /// `$(cmds)` inside a command, one argument
    Captured(Box<CmdChain>),
    /// `@$(cmds)`, output split on whitespace
    SplitCaptured(Box<CmdChain>),
    /// Leading `~`
    Tilde,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdin,
    Stdout,
    Stderr,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
    Append,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Redirect {
    File {
        stream: Stream,
        mode: FileMode,
        target: CmdWord,
    },
    ErrToOut,
    OutToErr,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(n: &str) -> Box<Expr> {
        Box::new(Expr::Name(n.to_string()))
    }

    #[test]
    fn leftmost_name_of_binary_is_lhs() {
        let expr = Expr::Binary(BinOp::Sub, name("ls"), name("l"));
        assert_eq!(expr.leftmost_name(), Some("ls"));
    }

    #[test]
    fn leftmost_name_through_calls_and_attrs() {
        let expr = Expr::Attr(Box::new(Expr::Call(name("f"), vec![])), "y".into());
        assert_eq!(expr.leftmost_name(), Some("f"));
        assert_eq!(Expr::Int(3).leftmost_name(), None);
        let not = Expr::Not(Box::new(Expr::Name("false".to_string())));
        assert_eq!(not.leftmost_name(), None);
    }
}
