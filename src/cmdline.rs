//! Subprocess-mode parser.
//!
//! Turns command text (`ls -l *.rs | wc -l > out.txt && echo done`) into a
//! [`CmdChain`]. Used for implicit command lines and for the bodies of
//! `$( )`, `!( )`, `$[ ]` and `![ ]`.

use crate::ast::{
    CmdChain, CmdWord, CommandAst, FileMode, PipelineAst, Redirect, Stream, WordPart,
};
use crate::lexer::balanced_body_len;
use crate::parser::{parse_expression, ParseError};

#[derive(Debug)]
enum CmdToken {
    Word { word: CmdWord, bare: Option<String> },
    Redirect(Redirect),
    Pipe,
    And,
    Or,
    Amp,
}

/// Redirect source prefixes, longest first.
const REDIRECT_SOURCES: &[&str] = &["err", "out", "all", "e", "o", "a", "1", "2", "&", ""];

fn is_boundary(c: char) -> bool {
    c.is_whitespace() || "|&;<>()".contains(c)
}

fn at_boundary(rest: &str) -> bool {
    rest.chars().next().map_or(true, is_boundary)
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

struct Scanner<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn line(&self) -> usize {
        self.src[..self.pos].matches('\n').count() + 1
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::syntax(self.line(), message)
    }

    fn skip_space(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else if self.rest().starts_with("\\\n") {
                self.pos += 2;
            } else {
                break;
            }
        }
    }

    fn tokens(mut self) -> Result<Vec<CmdToken>, ParseError> {
        let mut out = Vec::new();
        loop {
            self.skip_space();
            let rest = self.rest();
            let Some(c) = rest.chars().next() else {
                break;
            };
            if rest.starts_with("||") {
                self.pos += 2;
                out.push(CmdToken::Or);
            } else if rest.starts_with('|') {
                self.pos += 1;
                out.push(CmdToken::Pipe);
            } else if rest.starts_with("&&") {
                self.pos += 2;
                out.push(CmdToken::And);
            } else if let Some(redirect) = self.redirect()? {
                out.push(CmdToken::Redirect(redirect));
            } else if c == '&' {
                self.pos += 1;
                out.push(CmdToken::Amp);
            } else if matches!(c, ';' | '(' | ')') {
                return Err(self.error(format!("unexpected '{}'", c)));
            } else {
                let word = self.word()?;
                let bare = match word.parts.as_slice() {
                    [WordPart::Literal {
                        text,
                        quoted: false,
                    }] => Some(text.clone()),
                    _ => None,
                };
                out.push(CmdToken::Word { word, bare });
            }
        }
        Ok(out)
    }

    /// Try to read a redirection at the current position.
    fn redirect(&mut self) -> Result<Option<Redirect>, ParseError> {
        let rest = self.rest();
        for source in REDIRECT_SOURCES {
            let Some(after) = rest.strip_prefix(source) else {
                continue;
            };
            let (mode, op_len) = if after.starts_with(">>") {
                (FileMode::Append, 2)
            } else if after.starts_with('>') {
                (FileMode::Write, 1)
            } else if source.is_empty() && after.starts_with('<') {
                (FileMode::Read, 1)
            } else {
                continue;
            };
            let stream = match (*source, mode) {
                (_, FileMode::Read) => Stream::Stdin,
                ("" | "1" | "o" | "out", _) => Stream::Stdout,
                ("2" | "e" | "err", _) => Stream::Stderr,
                _ => Stream::All,
            };
            let target_text = &after[op_len..];
            let lettered = source.chars().next().map_or(false, |c| c.is_ascii_alphabetic());
            if mode == FileMode::Write {
                if let Some(len) = dup_target(target_text, stream, lettered) {
                    self.pos += source.len() + op_len + len;
                    return Ok(Some(if stream == Stream::Stderr {
                        Redirect::ErrToOut
                    } else {
                        Redirect::OutToErr
                    }));
                }
            }
            self.pos += source.len() + op_len;
            self.skip_space();
            match self.peek() {
                Some(c) if !is_boundary(c) => {}
                _ => return Err(self.error("missing redirection target")),
            }
            let target = self.word()?;
            return Ok(Some(Redirect::File {
                stream,
                mode,
                target,
            }));
        }
        Ok(None)
    }

    fn word(&mut self) -> Result<CmdWord, ParseError> {
        let mut parts: Vec<WordPart> = Vec::new();
        let mut buf = String::new();

        fn flush(parts: &mut Vec<WordPart>, buf: &mut String) {
            if !buf.is_empty() {
                parts.push(WordPart::Literal {
                    text: std::mem::take(buf),
                    quoted: false,
                });
            }
        }

        while let Some(c) = self.peek() {
            if is_boundary(c) {
                break;
            }
            let rest = self.rest();
            match c {
                '\'' => {
                    flush(&mut parts, &mut buf);
                    let body = &rest[1..];
                    let end = body.find('\'').ok_or_else(|| self.error("unterminated string"))?;
                    parts.push(WordPart::Literal {
                        text: body[..end].to_string(),
                        quoted: true,
                    });
                    self.pos += end + 2;
                }
                '"' => {
                    flush(&mut parts, &mut buf);
                    self.pos += 1;
                    self.double_quoted(&mut parts)?;
                }
                '\\' => {
                    flush(&mut parts, &mut buf);
                    self.pos += 1;
                    if let Some(escaped) = self.peek() {
                        self.pos += escaped.len_utf8();
                        parts.push(WordPart::Literal {
                            text: escaped.to_string(),
                            quoted: true,
                        });
                    }
                }
                '$' if rest.starts_with("$(") => {
                    flush(&mut parts, &mut buf);
                    let body = self.balanced(2, '(', ')', "$(")?;
                    parts.push(WordPart::Captured(Box::new(parse_chain(body)?)));
                }
                '$' => {
                    if let Some(name) = self.env_name() {
                        flush(&mut parts, &mut buf);
                        parts.push(WordPart::Env(name));
                    } else {
                        buf.push('$');
                        self.pos += 1;
                    }
                }
                '@' if rest.starts_with("@$(") => {
                    flush(&mut parts, &mut buf);
                    let body = self.balanced(3, '(', ')', "@$(")?;
                    parts.push(WordPart::SplitCaptured(Box::new(parse_chain(body)?)));
                }
                '@' if rest.starts_with("@(") => {
                    flush(&mut parts, &mut buf);
                    let body = self.balanced(2, '(', ')', "@(")?;
                    parts.push(WordPart::Splice(parse_expression(body)?));
                }
                '~' if parts.is_empty()
                    && buf.is_empty()
                    && (at_boundary(&rest[1..]) || rest[1..].starts_with('/')) =>
                {
                    parts.push(WordPart::Tilde);
                    self.pos += 1;
                }
                _ => {
                    buf.push(c);
                    self.pos += c.len_utf8();
                }
            }
        }
        flush(&mut parts, &mut buf);
        Ok(CmdWord { parts })
    }

    fn double_quoted(&mut self, parts: &mut Vec<WordPart>) -> Result<(), ParseError> {
        let mut text = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(self.error("unterminated string"));
            };
            match c {
                '"' => {
                    self.pos += 1;
                    break;
                }
                '\\' => {
                    self.pos += 1;
                    match self.peek() {
                        Some(e @ ('"' | '\\' | '$' | '`')) => {
                            text.push(e);
                            self.pos += 1;
                        }
                        Some('\n') => self.pos += 1,
                        _ => text.push('\\'),
                    }
                }
                '$' => match self.env_name() {
                    Some(name) => {
                        if !text.is_empty() {
                            parts.push(WordPart::Literal {
                                text: std::mem::take(&mut text),
                                quoted: true,
                            });
                        }
                        parts.push(WordPart::Env(name));
                    }
                    None => {
                        text.push('$');
                        self.pos += 1;
                    }
                },
                _ => {
                    text.push(c);
                    self.pos += c.len_utf8();
                }
            }
        }
        // "" still yields one (empty) argument
        if !text.is_empty() || parts.is_empty() {
            parts.push(WordPart::Literal { text, quoted: true });
        }
        Ok(())
    }

    /// Read `$NAME` or `${NAME}` and advance past it.
    fn env_name(&mut self) -> Option<String> {
        let rest = self.rest().strip_prefix('$')?;
        if let Some(braced) = rest.strip_prefix('{') {
            let end = braced.find('}')?;
            let name = &braced[..end];
            if name.is_empty() || !name.chars().all(is_name_char) {
                return None;
            }
            self.pos += end + 3;
            return Some(name.to_string());
        }
        let len = rest.find(|c: char| !is_name_char(c)).unwrap_or(rest.len());
        if len == 0 || rest.starts_with(|c: char| c.is_ascii_digit()) {
            return None;
        }
        self.pos += len + 1;
        Some(rest[..len].to_string())
    }

    /// Consume an opener of `skip` bytes plus a balanced body and its closer.
    fn balanced(
        &mut self,
        skip: usize,
        open: char,
        close: char,
        label: &str,
    ) -> Result<&'a str, ParseError> {
        let src = self.src;
        let body = &src[self.pos + skip..];
        let len = balanced_body_len(body, open, close)
            .ok_or_else(|| self.error(format!("unterminated {} expression", label)))?;
        self.pos += skip + len + 1;
        Ok(&body[..len])
    }
}

/// Length of a `&1`/`o`/`out`-style duplication target, if `text` starts with one.
fn dup_target(text: &str, stream: Stream, lettered: bool) -> Option<usize> {
    let candidates: &[&str] = match (stream, lettered) {
        (Stream::Stderr, false) => &["&1"],
        (Stream::Stderr, true) => &["&1", "out", "o"],
        (Stream::Stdout, false) => &["&2"],
        (Stream::Stdout, true) => &["&2", "err", "e"],
        _ => &[],
    };
    candidates
        .iter()
        .find(|c| text.starts_with(*c) && at_boundary(&text[c.len()..]))
        .map(|c| c.len())
}

struct ChainParser {
    tokens: std::iter::Peekable<std::vec::IntoIter<CmdToken>>,
}

impl ChainParser {
    fn at_word(&mut self, bare_text: &str) -> bool {
        matches!(self.tokens.peek(), Some(CmdToken::Word { bare: Some(b), .. }) if b == bare_text)
    }

    fn chain(&mut self) -> Result<CmdChain, ParseError> {
        let mut lhs = self.negation()?;
        loop {
            let is_and = matches!(self.tokens.peek(), Some(CmdToken::And)) || self.at_word("and");
            let is_or = matches!(self.tokens.peek(), Some(CmdToken::Or)) || self.at_word("or");
            if !is_and && !is_or {
                break;
            }
            self.tokens.next();
            let rhs = self.negation()?;
            lhs = if is_and {
                CmdChain::And(Box::new(lhs), Box::new(rhs))
            } else {
                CmdChain::Or(Box::new(lhs), Box::new(rhs))
            };
        }
        if matches!(self.tokens.peek(), Some(CmdToken::Amp)) {
            self.tokens.next();
            match &mut lhs {
                CmdChain::Pipeline(p) => p.background = true,
                _ => {
                    return Err(ParseError::syntax(
                        1,
                        "'&' may only follow a single pipeline",
                    ))
                }
            }
        }
        if let Some(tok) = self.tokens.next() {
            return Err(ParseError::syntax(1, format!("unexpected {}", describe(&tok))));
        }
        Ok(lhs)
    }

    fn negation(&mut self) -> Result<CmdChain, ParseError> {
        if self.at_word("not") || self.at_word("!") {
            self.tokens.next();
            return Ok(CmdChain::Not(Box::new(self.negation()?)));
        }
        self.pipeline()
    }

    fn pipeline(&mut self) -> Result<CmdChain, ParseError> {
        let mut commands = vec![self.command()?];
        while matches!(self.tokens.peek(), Some(CmdToken::Pipe)) {
            self.tokens.next();
            commands.push(self.command()?);
        }
        Ok(CmdChain::Pipeline(PipelineAst {
            commands,
            background: false,
        }))
    }

    fn command(&mut self) -> Result<CommandAst, ParseError> {
        let mut cmd = CommandAst {
            words: Vec::new(),
            redirects: Vec::new(),
        };
        loop {
            if !cmd.words.is_empty() && (self.at_word("and") || self.at_word("or")) {
                break;
            }
            match self.tokens.peek() {
                Some(CmdToken::Word { .. }) => {
                    if let Some(CmdToken::Word { word, .. }) = self.tokens.next() {
                        cmd.words.push(word);
                    }
                }
                Some(CmdToken::Redirect(_)) => {
                    if let Some(CmdToken::Redirect(r)) = self.tokens.next() {
                        cmd.redirects.push(r);
                    }
                }
                _ => break,
            }
        }
        if cmd.words.is_empty() {
            return Err(match self.tokens.peek() {
                Some(tok) => ParseError::syntax(1, format!("unexpected {}", describe(tok))),
                None => ParseError::syntax(1, "empty command"),
            });
        }
        Ok(cmd)
    }
}

fn describe(tok: &CmdToken) -> &'static str {
    match tok {
        CmdToken::Word { .. } => "word",
        CmdToken::Redirect(_) => "redirection",
        CmdToken::Pipe => "'|'",
        CmdToken::And => "'&&'",
        CmdToken::Or => "'||'",
        CmdToken::Amp => "'&'",
    }
}

/// Parse command text into a chain of pipelines.
pub fn parse_chain(src: &str) -> Result<CmdChain, ParseError> {
    let tokens = Scanner { src, pos: 0 }.tokens()?;
    ChainParser {
        tokens: tokens.into_iter().peekable(),
    }
    .chain()
}

/// Split alias text into words, honouring simple quoting.
pub fn split_words(src: &str) -> Result<Vec<String>, ParseError> {
    let tokens = Scanner { src, pos: 0 }.tokens()?;
    let mut words = Vec::new();
    for tok in tokens {
        match tok {
            CmdToken::Word { word, .. } => {
                let mut text = String::new();
                for part in word.parts {
                    match part {
                        WordPart::Literal { text: t, .. } => text.push_str(&t),
                        WordPart::Env(name) => {
                            text.push('$');
                            text.push_str(&name);
                        }
                        WordPart::Tilde => text.push('~'),
                        _ => return Err(ParseError::syntax(1, "unsupported expansion in alias")),
                    }
                }
                words.push(text);
            }
            other => {
                return Err(ParseError::syntax(1, format!("unexpected {}", describe(&other))))
            }
        }
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Expr;

    fn pipeline(src: &str) -> PipelineAst {
        match parse_chain(src).unwrap() {
            CmdChain::Pipeline(p) => p,
            other => panic!("expected pipeline, got {:?}", other),
        }
    }

    fn lit(text: &str, quoted: bool) -> WordPart {
        WordPart::Literal {
            text: text.to_string(),
            quoted,
        }
    }

    #[test]
    fn test_simple_pipeline() {
        let p = pipeline("ls -l | wc -l");
        assert_eq!(p.commands.len(), 2);
        assert_eq!(p.commands[0].words.len(), 2);
        assert!(!p.background);
    }

    #[test]
    fn test_quoting_and_env() {
        let p = pipeline(r#"echo 'a b' "x $HOME y" $USER"#);
        let words = &p.commands[0].words;
        assert_eq!(words[1].parts, vec![lit("a b", true)]);
        assert_eq!(
            words[2].parts,
            vec![lit("x ", true), WordPart::Env("HOME".into()), lit(" y", true)]
        );
        assert_eq!(words[3].parts, vec![WordPart::Env("USER".into())]);
    }

    #[test]
    fn test_splice_and_captures() {
        let p = pipeline("echo a@(['b', 'c']) $(pwd) @$(ls)");
        let words = &p.commands[0].words;
        assert!(matches!(&words[1].parts[1], WordPart::Splice(Expr::List(items)) if items.len() == 2));
        assert!(matches!(words[2].parts[0], WordPart::Captured(_)));
        assert!(matches!(words[3].parts[0], WordPart::SplitCaptured(_)));
    }

    #[test]
    fn test_redirect_forms() {
        let p = pipeline("cmd > out.txt 2>&1 e>>log < in.txt");
        let r = &p.commands[0].redirects;
        assert!(matches!(&r[0], Redirect::File { stream: Stream::Stdout, mode: FileMode::Write, .. }));
        assert_eq!(r[1], Redirect::ErrToOut);
        assert!(matches!(&r[2], Redirect::File { stream: Stream::Stderr, mode: FileMode::Append, .. }));
        assert!(matches!(&r[3], Redirect::File { stream: Stream::Stdin, mode: FileMode::Read, .. }));

        let p = pipeline("cmd err>out o>e &>all.log");
        let r = &p.commands[0].redirects;
        assert_eq!(r[0], Redirect::ErrToOut);
        assert_eq!(r[1], Redirect::OutToErr);
        assert!(matches!(&r[2], Redirect::File { stream: Stream::All, .. }));
    }

    #[test]
    fn test_words_starting_like_streams_are_words() {
        let p = pipeline("echo error output");
        assert_eq!(p.commands[0].words.len(), 3);
        assert!(p.commands[0].redirects.is_empty());
    }

    #[test]
    fn test_boolean_chains_are_left_associative() {
        let chain = parse_chain("a && b || c").unwrap();
        match chain {
            CmdChain::Or(lhs, _) => assert!(matches!(*lhs, CmdChain::And(_, _))),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(parse_chain("a and b").unwrap(), CmdChain::And(_, _)));
        assert!(matches!(parse_chain("not false").unwrap(), CmdChain::Not(_)));
    }

    #[test]
    fn test_background_only_on_single_pipeline() {
        assert!(pipeline("sleep 100 &").background);
        assert!(parse_chain("a && b &").is_err());
        assert!(parse_chain("a & b").is_err());
    }

    #[test]
    fn test_errors() {
        assert!(parse_chain("").is_err());
        assert!(parse_chain("| wc").is_err());
        assert!(parse_chain("echo >").is_err());
        assert!(parse_chain("print('x')").is_err());
    }

    #[test]
    fn test_tilde_only_at_word_start() {
        let p = pipeline("ls ~/src a~b");
        assert_eq!(p.commands[0].words[1].parts[0], WordPart::Tilde);
        assert_eq!(p.commands[0].words[2].parts, vec![lit("a~b", false)]);
    }

    #[test]
    fn test_split_words() {
        assert_eq!(
            split_words("ls --color=auto 'a b'").unwrap(),
            vec!["ls", "--color=auto", "a b"]
        );
    }
}
