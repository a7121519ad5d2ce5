//! Parser for duosh host code.
//!
//! A recursive-descent parser over lexer tokens. Keyword statements
//! (`if`, `while`, `for`, `def`, ...) are host-only. Every other statement is
//! parsed twice, once as host code and once as a subprocess command line,
//! and both results are kept in a [`Stmt::Ambiguous`] node for the
//! disambiguation pass.

use crate::ast::{
    BinOp, Candidates, Capture, Expr, FunctionDef, LogicOp, Span, Stmt, SubprocExpr, Target,
};
use crate::cmdline;
use crate::lexer::{lex, LexError, Punct, Token, TokenKind};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("syntax error on line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("syntax error: unexpected end of input")]
    UnexpectedEof,
    #[error(transparent)]
    Lex(#[from] LexError),
}

impl ParseError {
    pub(crate) fn syntax(line: usize, message: impl Into<String>) -> Self {
        ParseError::Syntax {
            line,
            message: message.into(),
        }
    }

    /// True when the text may become valid with more input.
    pub fn is_incomplete(&self) -> bool {
        match self {
            ParseError::UnexpectedEof => true,
            ParseError::Lex(e) => e.is_incomplete(),
            ParseError::Syntax { .. } => false,
        }
    }
}

const KEYWORDS: &[&str] = &[
    "if", "elif", "else", "while", "for", "in", "def", "return", "break", "continue", "pass",
    "and", "or", "not", "True", "False", "None",
];

fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    limit: usize,
}

type PResult<T> = Result<T, ParseError>;

impl<'a> Parser<'a> {
    fn new(src: &'a str, tokens: Vec<Token>) -> Self {
        let limit = tokens.len();
        Parser {
            src,
            tokens,
            pos: 0,
            limit,
        }
    }

    fn peek(&self) -> Option<&TokenKind> {
        if self.pos < self.limit {
            Some(&self.tokens[self.pos].kind)
        } else {
            None
        }
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos.min(self.tokens.len().saturating_sub(1)))
            .map(|t| t.span.line)
            .unwrap_or(1)
    }

    fn next(&mut self) -> Option<TokenKind> {
        let kind = self.peek().cloned();
        if kind.is_some() {
            self.pos += 1;
        }
        kind
    }

    fn at_punct(&self, p: Punct) -> bool {
        matches!(self.peek(), Some(TokenKind::Punct(q)) if *q == p)
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(TokenKind::Name(n)) if n == kw)
    }

    fn eat_punct(&mut self, p: Punct) -> bool {
        if self.at_punct(p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.at_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn unexpected(&self) -> ParseError {
        match self.peek() {
            None => ParseError::UnexpectedEof,
            Some(kind) => ParseError::syntax(self.line(), format!("unexpected {}", describe(kind))),
        }
    }

    fn expect_punct(&mut self, p: Punct) -> PResult<()> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn expect_name(&mut self) -> PResult<String> {
        match self.peek() {
            Some(TokenKind::Name(n)) if !is_keyword(n) => {
                let n = n.clone();
                self.pos += 1;
                Ok(n)
            }
            _ => Err(self.unexpected()),
        }
    }

    fn skip_separators(&mut self) {
        while matches!(
            self.peek(),
            Some(TokenKind::Newline) | Some(TokenKind::Punct(Punct::Semi))
        ) {
            self.pos += 1;
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), Some(TokenKind::Newline)) {
            self.pos += 1;
        }
    }

    // ---------------------------------------------------------------
    // Statements
    // ---------------------------------------------------------------

    fn statements(&mut self, in_block: bool) -> PResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            self.skip_separators();
            match self.peek() {
                None if in_block => return Err(ParseError::UnexpectedEof),
                None => break,
                Some(TokenKind::Punct(Punct::RBrace)) if in_block => break,
                Some(TokenKind::Punct(Punct::RBrace)) => return Err(self.unexpected()),
                Some(_) => stmts.push(self.statement()?),
            }
        }
        Ok(stmts)
    }

    fn block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect_punct(Punct::LBrace)?;
        let body = self.statements(true)?;
        self.expect_punct(Punct::RBrace)?;
        Ok(body)
    }

    fn statement(&mut self) -> PResult<Stmt> {
        let keyword = match self.peek() {
            Some(TokenKind::Name(n)) => n.clone(),
            _ => String::new(),
        };
        match keyword.as_str() {
            "if" => self.if_stmt(),
            "while" => {
                self.pos += 1;
                let cond = self.expr()?;
                let body = self.block()?;
                Ok(Stmt::While(cond, body))
            }
            "for" => {
                self.pos += 1;
                let var = self.expect_name()?;
                if !self.eat_keyword("in") {
                    return Err(self.unexpected());
                }
                let iter = self.expr()?;
                let body = self.block()?;
                Ok(Stmt::For(var, iter, body))
            }
            "def" => {
                self.pos += 1;
                let name = self.expect_name()?;
                self.expect_punct(Punct::LParen)?;
                let mut params = Vec::new();
                while !self.at_punct(Punct::RParen) {
                    params.push(self.expect_name()?);
                    if !self.eat_punct(Punct::Comma) {
                        break;
                    }
                }
                self.expect_punct(Punct::RParen)?;
                let body = self.block()?;
                Ok(Stmt::Def(Arc::new(FunctionDef { name, params, body })))
            }
            "return" => {
                self.pos += 1;
                if self.at_statement_end() {
                    Ok(Stmt::Return(None))
                } else {
                    Ok(Stmt::Return(Some(self.expr()?)))
                }
            }
            "break" => self.bare_keyword(Stmt::Break),
            "continue" => self.bare_keyword(Stmt::Continue),
            "pass" => self.bare_keyword(Stmt::Pass),
            _ => self.simple_statement(),
        }
    }

    fn bare_keyword(&mut self, stmt: Stmt) -> PResult<Stmt> {
        self.pos += 1;
        if self.at_statement_end() {
            Ok(stmt)
        } else {
            Err(self.unexpected())
        }
    }

    fn at_statement_end(&self) -> bool {
        matches!(
            self.peek(),
            None | Some(TokenKind::Newline)
                | Some(TokenKind::Punct(Punct::Semi))
                | Some(TokenKind::Punct(Punct::RBrace))
        )
    }

    fn if_stmt(&mut self) -> PResult<Stmt> {
        self.pos += 1;
        let mut branches = vec![(self.expr()?, self.block()?)];
        let mut orelse = None;
        loop {
            let save = self.pos;
            self.skip_newlines();
            if self.eat_keyword("elif") {
                branches.push((self.expr()?, self.block()?));
            } else if self.eat_keyword("else") {
                orelse = Some(self.block()?);
                break;
            } else {
                self.pos = save;
                break;
            }
        }
        Ok(Stmt::If { branches, orelse })
    }

    /// Index one past the last token of the statement starting at `pos`.
    fn statement_end(&self) -> usize {
        let mut depth = 0i32;
        let mut i = self.pos;
        while i < self.limit {
            match &self.tokens[i].kind {
                TokenKind::Punct(Punct::LParen | Punct::LBracket | Punct::LBrace) => depth += 1,
                TokenKind::Punct(Punct::RParen | Punct::RBracket) => depth -= 1,
                TokenKind::Punct(Punct::RBrace) => {
                    if depth <= 0 {
                        break;
                    }
                    depth -= 1;
                }
                TokenKind::Newline | TokenKind::Punct(Punct::Semi) if depth <= 0 => break,
                _ => {}
            }
            i += 1;
        }
        i
    }

    fn simple_statement(&mut self) -> PResult<Stmt> {
        let start = self.pos;
        let end = self.statement_end();
        let span = Span {
            start: self.tokens[start].span.start,
            end: self.tokens[end - 1].span.end,
            line: self.tokens[start].span.line,
        };

        let outer_limit = self.limit;
        self.limit = end;
        let host = self.host_simple().and_then(|stmt| {
            if self.pos == end {
                Ok(stmt)
            } else {
                Err(self.unexpected())
            }
        });
        self.limit = outer_limit;
        self.pos = end;

        let subproc = cmdline::parse_chain(&self.src[span.start..span.end])
            .map(|chain| {
                Stmt::Expr(Expr::Subproc(SubprocExpr {
                    capture: Capture::Hidden,
                    chain,
                }))
            })
            .map_err(|e| relocate(e, span.line));

        Ok(Stmt::Ambiguous(Box::new(Candidates {
            host,
            subproc,
            span,
        })))
    }

    fn host_simple(&mut self) -> PResult<Stmt> {
        let line = self.line();
        let lhs = self.expr()?;
        if !self.eat_punct(Punct::Assign) {
            return Ok(Stmt::Expr(lhs));
        }
        let target = match lhs {
            Expr::Name(n) => Target::Name(n),
            Expr::EnvVar(n) => Target::Env(n),
            Expr::Index(base, index) => Target::Index(*base, *index),
            _ => return Err(ParseError::syntax(line, "cannot assign to expression")),
        };
        let value = self.expr()?;
        Ok(Stmt::Assign(target, value))
    }

    // ---------------------------------------------------------------
    // Expressions
    // ---------------------------------------------------------------

    fn expr(&mut self) -> PResult<Expr> {
        let mut lhs = self.and_expr()?;
        while self.eat_keyword("or") {
            let rhs = self.and_expr()?;
            lhs = Expr::Logic(LogicOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> PResult<Expr> {
        let mut lhs = self.not_expr()?;
        while self.eat_keyword("and") {
            let rhs = self.not_expr()?;
            lhs = Expr::Logic(LogicOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> PResult<Expr> {
        if self.eat_keyword("not") {
            return Ok(Expr::Not(Box::new(self.not_expr()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let lhs = self.sum()?;
        let op = match self.peek() {
            Some(TokenKind::Punct(Punct::Eq)) => BinOp::Eq,
            Some(TokenKind::Punct(Punct::Ne)) => BinOp::Ne,
            Some(TokenKind::Punct(Punct::Lt)) => BinOp::Lt,
            Some(TokenKind::Punct(Punct::Le)) => BinOp::Le,
            Some(TokenKind::Punct(Punct::Gt)) => BinOp::Gt,
            Some(TokenKind::Punct(Punct::Ge)) => BinOp::Ge,
            Some(TokenKind::Name(n)) if n == "in" => BinOp::In,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.sum()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn sum(&mut self) -> PResult<Expr> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Punct(Punct::Plus)) => BinOp::Add,
                Some(TokenKind::Punct(Punct::Minus)) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> PResult<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Punct(Punct::Star)) => BinOp::Mul,
                Some(TokenKind::Punct(Punct::Slash)) => BinOp::Div,
                Some(TokenKind::Punct(Punct::SlashSlash)) => BinOp::FloorDiv,
                Some(TokenKind::Punct(Punct::Percent)) => BinOp::Mod,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> PResult<Expr> {
        if self.eat_punct(Punct::Minus) {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.atom()?;
        loop {
            if self.eat_punct(Punct::LParen) {
                let args = self.comma_list(Punct::RParen)?;
                expr = Expr::Call(Box::new(expr), args);
            } else if self.eat_punct(Punct::LBracket) {
                let index = self.expr()?;
                self.expect_punct(Punct::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if self.eat_punct(Punct::Dot) {
                let attr = self.expect_name()?;
                expr = Expr::Attr(Box::new(expr), attr);
            } else {
                return Ok(expr);
            }
        }
    }

    fn comma_list(&mut self, close: Punct) -> PResult<Vec<Expr>> {
        let mut items = Vec::new();
        while !self.at_punct(close) {
            items.push(self.expr()?);
            if !self.eat_punct(Punct::Comma) {
                break;
            }
        }
        self.expect_punct(close)?;
        Ok(items)
    }

    fn atom(&mut self) -> PResult<Expr> {
        let line = self.line();
        let Some(kind) = self.next() else {
            return Err(ParseError::UnexpectedEof);
        };
        match kind {
            TokenKind::Int(i) => Ok(Expr::Int(i)),
            TokenKind::Float(f) => Ok(Expr::Float(f)),
            TokenKind::Str(s) => Ok(Expr::Str(s)),
            TokenKind::Env(n) => Ok(Expr::EnvVar(n)),
            TokenKind::Name(n) => match n.as_str() {
                "True" => Ok(Expr::Bool(true)),
                "False" => Ok(Expr::Bool(false)),
                "None" => Ok(Expr::None),
                kw if is_keyword(kw) => {
                    self.pos -= 1;
                    Err(self.unexpected())
                }
                _ => Ok(Expr::Name(n)),
            },
            TokenKind::Punct(Punct::LParen) => {
                let inner = self.expr()?;
                self.expect_punct(Punct::RParen)?;
                Ok(inner)
            }
            TokenKind::Punct(Punct::LBracket) => Ok(Expr::List(self.comma_list(Punct::RBracket)?)),
            TokenKind::Subproc(capture, body) => {
                let chain = cmdline::parse_chain(&body).map_err(|e| relocate(e, line))?;
                Ok(Expr::Subproc(SubprocExpr { capture, chain }))
            }
            _ => {
                self.pos -= 1;
                Err(self.unexpected())
            }
        }
    }
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Int(i) => format!("number {}", i),
        TokenKind::Float(f) => format!("number {}", f),
        TokenKind::Str(_) => "string".to_string(),
        TokenKind::Name(n) => format!("name '{}'", n),
        TokenKind::Env(n) => format!("'${}'", n),
        TokenKind::Punct(p) => format!("'{}'", punct_text(*p)),
        TokenKind::Subproc(..) => "subprocess expression".to_string(),
        TokenKind::Newline => "newline".to_string(),
        TokenKind::Unknown(c) => format!("character '{}'", c),
    }
}

fn punct_text(p: Punct) -> &'static str {
    match p {
        Punct::LParen => "(",
        Punct::RParen => ")",
        Punct::LBracket => "[",
        Punct::RBracket => "]",
        Punct::LBrace => "{",
        Punct::RBrace => "}",
        Punct::Comma => ",",
        Punct::Dot => ".",
        Punct::Semi => ";",
        Punct::Assign => "=",
        Punct::Eq => "==",
        Punct::Ne => "!=",
        Punct::Lt => "<",
        Punct::Le => "<=",
        Punct::Gt => ">",
        Punct::Ge => ">=",
        Punct::Plus => "+",
        Punct::Minus => "-",
        Punct::Star => "*",
        Punct::Slash => "/",
        Punct::SlashSlash => "//",
        Punct::Percent => "%",
    }
}

/// Shift a nested parse error onto the line of its enclosing statement.
fn relocate(err: ParseError, base_line: usize) -> ParseError {
    match err {
        ParseError::Syntax { line, message } => ParseError::Syntax {
            line: base_line + line - 1,
            message,
        },
        other => other,
    }
}

/// Parse a compilation unit.
///
/// Simple statements come back as [`Stmt::Ambiguous`]; run the
/// disambiguation pass before executing the result.
pub fn parse_unit(src: &str) -> Result<Vec<Stmt>, ParseError> {
    let tokens = lex(src)?;
    let mut parser = Parser::new(src, tokens);
    parser.statements(false)
}

/// Parse a single host expression, as used by `@(...)` splices.
pub fn parse_expression(src: &str) -> Result<Expr, ParseError> {
    let tokens: Vec<Token> = lex(src)?
        .into_iter()
        .filter(|t| t.kind != TokenKind::Newline)
        .collect();
    let mut parser = Parser::new(src, tokens);
    let expr = parser.expr()?;
    if parser.peek().is_some() {
        return Err(parser.unexpected());
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::CmdChain;

    fn single(src: &str) -> Candidates {
        let mut stmts = parse_unit(src).unwrap();
        assert_eq!(stmts.len(), 1);
        match stmts.remove(0) {
            Stmt::Ambiguous(c) => *c,
            other => panic!("expected ambiguous statement, got {:?}", other),
        }
    }

    #[test]
    fn test_command_line_has_only_subproc_candidate() {
        let c = single("echo hi there");
        assert!(c.host.is_err());
        assert!(c.subproc.is_ok());
    }

    #[test]
    fn test_ls_minus_l_has_both_candidates() {
        let c = single("ls -l");
        assert!(matches!(c.host, Ok(Stmt::Expr(Expr::Binary(BinOp::Sub, _, _)))));
        assert!(c.subproc.is_ok());
    }

    #[test]
    fn test_assignment_parses_as_host() {
        let c = single("x = 1 + 2 * 3");
        match c.host.unwrap() {
            Stmt::Assign(Target::Name(n), Expr::Binary(BinOp::Add, _, _)) => assert_eq!(n, "x"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_statement_spans() {
        let stmts = parse_unit("a = 1; echo hi\nb = 2").unwrap();
        assert_eq!(stmts.len(), 3);
        match &stmts[1] {
            Stmt::Ambiguous(c) => {
                assert_eq!(c.span.start, 7);
                assert_eq!(c.span.end, 14);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_compound_statements() {
        let src = "def f(a, b) {\n  return a + b\n}\nfor i in [1, 2] { echo @(i) }\nif x { pass } elif y { pass } else { pass }";
        let stmts = parse_unit(src).unwrap();
        assert!(matches!(&stmts[0], Stmt::Def(d) if d.params == vec!["a", "b"]));
        assert!(matches!(&stmts[1], Stmt::For(v, _, body) if v == "i" && body.len() == 1));
        assert!(matches!(&stmts[2], Stmt::If { branches, orelse: Some(_) } if branches.len() == 2));
    }

    #[test]
    fn test_subproc_expression_atom() {
        let c = single("x = $(echo hi)");
        match c.host.unwrap() {
            Stmt::Assign(_, Expr::Subproc(sp)) => {
                assert_eq!(sp.capture, Capture::Stdout);
                assert!(matches!(sp.chain, CmdChain::Pipeline(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unclosed_block_is_incomplete() {
        let err = parse_unit("if x {\n echo hi").unwrap_err();
        assert!(err.is_incomplete());
    }

    #[test]
    fn test_parse_expression() {
        assert_eq!(
            parse_expression("[1, 'a']").unwrap(),
            Expr::List(vec![Expr::Int(1), Expr::Str("a".into())])
        );
        assert!(parse_expression("1 2").is_err());
    }
}
