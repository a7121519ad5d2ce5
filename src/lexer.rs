//! Tokenization for duosh host code.
//!
//! The lexer never rejects text it does not understand: characters outside
//! the host grammar become [`TokenKind::Unknown`] so a line such as
//! `ls -la | grep x` still lexes and can later be reparsed in subprocess
//! mode. Only unterminated strings and subprocess bodies are errors.

use crate::ast::{Capture, Span};
use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{alpha1, alphanumeric1, char, digit1},
    combinator::{map, opt, recognize, value},
    multi::many0_count,
    sequence::{delimited, pair, preceded},
    IResult,
};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Punct {
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Semi,
    Assign,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    SlashSlash,
    Percent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Int(i64),
    Float(f64),
    Str(String),
    Name(String),
    /// `$NAME` or `${NAME}`
    Env(String),
    Punct(Punct),
    /// `$( )`, `!( )`, `$[ ]`, `![ ]` with the raw body text
    Subproc(Capture, String),
    Newline,
    Unknown(char),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LexError {
    #[error("line {0}: unterminated string")]
    UnterminatedString(usize),
    #[error("line {0}: unterminated {1} expression")]
    UnterminatedSubproc(usize, &'static str),
    #[error("line {0}: number out of range: {1}")]
    BadNumber(usize, String),
}

impl LexError {
    /// True when more input could complete the text.
    pub fn is_incomplete(&self) -> bool {
        !matches!(self, LexError::BadNumber(..))
    }
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0_count(alt((alphanumeric1, tag("_")))),
    ))(input)
}

fn number(input: &str) -> IResult<&str, &str> {
    recognize(pair(digit1, opt(pair(char('.'), digit1))))(input)
}

fn env_var(input: &str) -> IResult<&str, &str> {
    preceded(
        char('$'),
        alt((delimited(char('{'), identifier, char('}')), identifier)),
    )(input)
}

fn compound_punct(input: &str) -> IResult<&str, Punct> {
    alt((
        value(Punct::SlashSlash, tag("//")),
        value(Punct::Eq, tag("==")),
        value(Punct::Ne, tag("!=")),
        value(Punct::Le, tag("<=")),
        value(Punct::Ge, tag(">=")),
    ))(input)
}

fn single_punct(input: &str) -> IResult<&str, Punct> {
    alt((
        alt((
            value(Punct::LParen, char('(')),
            value(Punct::RParen, char(')')),
            value(Punct::LBracket, char('[')),
            value(Punct::RBracket, char(']')),
            value(Punct::LBrace, char('{')),
            value(Punct::RBrace, char('}')),
            value(Punct::Comma, char(',')),
            value(Punct::Dot, char('.')),
            value(Punct::Semi, char(';')),
        )),
        alt((
            value(Punct::Assign, char('=')),
            value(Punct::Lt, char('<')),
            value(Punct::Gt, char('>')),
            value(Punct::Plus, char('+')),
            value(Punct::Minus, char('-')),
            value(Punct::Star, char('*')),
            value(Punct::Slash, char('/')),
            value(Punct::Percent, char('%')),
        )),
    ))(input)
}

fn punct(input: &str) -> IResult<&str, Punct> {
    alt((compound_punct, single_punct))(input)
}

fn subproc_opener(input: &str) -> IResult<&str, Capture> {
    alt((
        value(Capture::Stdout, tag("$(")),
        value(Capture::Object, tag("!(")),
        value(Capture::Uncaptured, tag("$[")),
        value(Capture::Hidden, tag("![")),
    ))(input)
}

/// Length of a balanced body up to (not including) the closing bracket.
///
/// Quotes are skipped so brackets inside strings do not count.
pub(crate) fn balanced_body_len(body: &str, open: char, close: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut chars = body.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '\'' => loop {
                match chars.next() {
                    Some((_, '\'')) => break,
                    Some(_) => {}
                    None => return None,
                }
            },
            '"' => loop {
                match chars.next() {
                    Some((_, '\\')) => {
                        chars.next();
                    }
                    Some((_, '"')) => break,
                    Some(_) => {}
                    None => return None,
                }
            },
            c if c == open => depth += 1,
            c if c == close => {
                if depth == 0 {
                    return Some(i);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

/// Decode a quoted host string starting at its opening quote.
///
/// Returns the decoded text and the number of bytes consumed.
fn quoted_string(input: &str) -> Option<(String, usize)> {
    let mut chars = input.char_indices();
    let (_, quote) = chars.next()?;
    let mut out = String::new();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                let (_, esc) = chars.next()?;
                match esc {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    '0' => out.push('\0'),
                    '\\' | '\'' | '"' => out.push(esc),
                    '\n' => {}
                    other => {
                        out.push('\\');
                        out.push(other);
                    }
                }
            }
            c if c == quote => return Some((out, i + 1)),
            c => out.push(c),
        }
    }
    None
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    line: usize,
    depth: i32,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn bump(&mut self, n: usize) {
        self.line += self.src[self.pos..self.pos + n].matches('\n').count();
        self.pos += n;
    }

    fn push(&mut self, kind: TokenKind, start: usize, line: usize) {
        self.tokens.push(Token {
            kind,
            span: Span {
                start,
                end: self.pos,
                line,
            },
        });
    }

    fn skip_blank(&mut self) {
        loop {
            let rest = self.rest();
            if rest.starts_with(' ') || rest.starts_with('\t') || rest.starts_with('\r') {
                self.bump(1);
            } else if rest.starts_with("\\\n") {
                self.bump(2);
            } else if rest.starts_with('#') {
                let len = rest.find('\n').unwrap_or(rest.len());
                self.bump(len);
            } else {
                return;
            }
        }
    }

    fn run(mut self) -> Result<Vec<Token>, LexError> {
        loop {
            self.skip_blank();
            let rest = self.rest();
            let Some(first) = rest.chars().next() else {
                break;
            };
            let start = self.pos;
            let line = self.line;

            if first == '\n' {
                self.bump(1);
                if self.depth == 0 {
                    self.push(TokenKind::Newline, start, line);
                }
                continue;
            }

            if first == '"' || first == '\'' {
                let (text, len) =
                    quoted_string(rest).ok_or(LexError::UnterminatedString(line))?;
                self.bump(len);
                self.push(TokenKind::Str(text), start, line);
                continue;
            }

            if let Ok((body, capture)) = subproc_opener(rest) {
                let (open, close, label) = if rest.as_bytes()[1] == b'(' {
                    ('(', ')', if first == '$' { "$(" } else { "!(" })
                } else {
                    ('[', ']', if first == '$' { "$[" } else { "![" })
                };
                let len = balanced_body_len(body, open, close)
                    .ok_or(LexError::UnterminatedSubproc(line, label))?;
                let text = body[..len].to_string();
                self.bump(2 + len + 1);
                self.push(TokenKind::Subproc(capture, text), start, line);
                continue;
            }

            if let Ok((after, digits)) = number(rest) {
                let kind = if digits.contains('.') {
                    digits
                        .parse::<f64>()
                        .map(TokenKind::Float)
                        .map_err(|_| LexError::BadNumber(line, digits.to_string()))?
                } else {
                    digits
                        .parse::<i64>()
                        .map(TokenKind::Int)
                        .map_err(|_| LexError::BadNumber(line, digits.to_string()))?
                };
                self.bump(rest.len() - after.len());
                self.push(kind, start, line);
                continue;
            }

            let word = alt((
                map(identifier, |s: &str| TokenKind::Name(s.to_string())),
                map(env_var, |s: &str| TokenKind::Env(s.to_string())),
                map(punct, TokenKind::Punct),
            ))(rest);
            match word {
                Ok((after, kind)) => {
                    match kind {
                        TokenKind::Punct(Punct::LParen) | TokenKind::Punct(Punct::LBracket) => {
                            self.depth += 1
                        }
                        TokenKind::Punct(Punct::RParen) | TokenKind::Punct(Punct::RBracket) => {
                            self.depth = (self.depth - 1).max(0)
                        }
                        _ => {}
                    }
                    self.bump(rest.len() - after.len());
                    self.push(kind, start, line);
                }
                Err(_) => {
                    self.bump(first.len_utf8());
                    self.push(TokenKind::Unknown(first), start, line);
                }
            }
        }
        Ok(self.tokens)
    }
}

/// Tokenize host source text.
pub fn lex(src: &str) -> Result<Vec<Token>, LexError> {
    Lexer {
        src,
        pos: 0,
        line: 1,
        depth: 0,
        tokens: Vec::new(),
    }
    .run()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        lex(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_names_and_numbers() {
        assert_eq!(
            kinds("x = 42 + 1.5"),
            vec![
                TokenKind::Name("x".into()),
                TokenKind::Punct(Punct::Assign),
                TokenKind::Int(42),
                TokenKind::Punct(Punct::Plus),
                TokenKind::Float(1.5),
            ]
        );
    }

    #[test]
    fn test_shell_text_lexes_with_unknowns() {
        let toks = kinds("ls -la | wc");
        assert!(toks.contains(&TokenKind::Unknown('|')));
        assert_eq!(toks[0], TokenKind::Name("ls".into()));
    }

    #[test]
    fn test_subproc_body_is_one_token() {
        assert_eq!(
            kinds("x = $(echo (a) ')')"),
            vec![
                TokenKind::Name("x".into()),
                TokenKind::Punct(Punct::Assign),
                TokenKind::Subproc(Capture::Stdout, "echo (a) ')'".into()),
            ]
        );
        assert_eq!(
            kinds("![ls]"),
            vec![TokenKind::Subproc(Capture::Hidden, "ls".into())]
        );
    }

    #[test]
    fn test_strings_and_escapes() {
        assert_eq!(kinds(r#""a\tb""#), vec![TokenKind::Str("a\tb".into())]);
        assert_eq!(kinds("'it'"), vec![TokenKind::Str("it".into())]);
        assert_eq!(
            lex("'open").unwrap_err(),
            LexError::UnterminatedString(1)
        );
    }

    #[test]
    fn test_env_vars() {
        assert_eq!(
            kinds("$HOME ${PATH}"),
            vec![TokenKind::Env("HOME".into()), TokenKind::Env("PATH".into())]
        );
    }

    #[test]
    fn test_newlines_suppressed_inside_parens() {
        let toks = kinds("f(1,\n2)\nx");
        assert_eq!(
            toks.iter().filter(|k| **k == TokenKind::Newline).count(),
            1
        );
    }

    #[test]
    fn test_comments_and_spans() {
        let toks = lex("a # note\nbb").unwrap();
        assert_eq!(toks.len(), 3);
        assert_eq!(toks[2].span, Span { start: 9, end: 11, line: 2 });
    }

    #[test]
    fn test_unterminated_subproc() {
        let err = lex("$(echo").unwrap_err();
        assert!(err.is_incomplete());
    }
}
