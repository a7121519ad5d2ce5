//! Subprocess specifications.
//!
//! The evaluator expands the dynamic parts of a command (splices, captured
//! substitutions, environment variables) into an [`ExpandedCall`]. The
//! [`SpecBuilder`] then does everything that touches the filesystem or the
//! alias table: word combination, globbing, tilde expansion, redirect
//! targets and command resolution. The resulting [`SubprocSpec`] does not
//! change once its pipeline starts.

use crate::aliases::AliasSnapshot;
use crate::ast::{Capture, FileMode, Stream};
use crate::config::{GlobPolicy, Settings};
use crate::procs::ProcError;
use crate::resolver::{predict_threadable, ResolvedCommand};
use crate::session::Session;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// One expanded fragment of a command word.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgPiece {
    /// Literal text; `glob` is false for quoted or substituted text
    Text { text: String, glob: bool },
    /// Spliced sequence, one argument per item
    Items(Vec<String>),
    Tilde,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ArgWord {
    pub pieces: Vec<ArgPiece>,
}

impl ArgWord {
    pub fn text(text: &str) -> Self {
        ArgWord {
            pieces: vec![ArgPiece::Text {
                text: text.to_string(),
                glob: true,
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpandedRedirect {
    File {
        stream: Stream,
        mode: FileMode,
        target: ArgWord,
    },
    ErrToOut,
    OutToErr,
}

/// A command with every host-level expansion already evaluated.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExpandedCall {
    pub words: Vec<ArgWord>,
    pub redirects: Vec<ExpandedRedirect>,
}

/// Where a stage's stdout or stderr goes, as requested by redirections.
#[derive(Debug)]
pub enum StreamTarget {
    /// Decided by the pipeline assembler
    Default,
    File(File),
    /// Follow the other output stream (`2>&1` / `1>&2`)
    Merge,
}

#[derive(Debug)]
pub struct SubprocSpec {
    pub argv: Vec<String>,
    pub command: ResolvedCommand,
    pub alias: Option<String>,
    pub stdin: Option<File>,
    pub stdout: StreamTarget,
    pub stderr: StreamTarget,
    pub captured: Capture,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub pipeline_index: usize,
    pub background: bool,
    pub negated: bool,
    /// Last-stage output may be read through a tee worker
    pub threadable: bool,
}

fn has_glob_chars(text: &str) -> bool {
    text.contains(&['*', '?', '['][..])
}

/// Builds the specs of one pipeline from a consistent snapshot of the
/// session taken when the builder is created.
pub struct SpecBuilder {
    session: Session,
    settings: Settings,
    aliases: AliasSnapshot,
    env: BTreeMap<String, String>,
    cwd: PathBuf,
    captured: Capture,
    background: bool,
    negated: bool,
}

impl SpecBuilder {
    pub fn new(session: &Session, captured: Capture, background: bool, negated: bool) -> Self {
        let env = session.env_snapshot();
        SpecBuilder {
            settings: Settings::from_env(&env),
            aliases: session.aliases().snapshot(),
            cwd: session.cwd(),
            session: session.clone(),
            env,
            captured,
            background,
            negated,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn build(&self, call: ExpandedCall, index: usize) -> Result<SubprocSpec, ProcError> {
        let mut argv = Vec::new();
        for word in &call.words {
            argv.extend(self.expand_word(word)?);
        }
        if argv.is_empty() {
            return Err(ProcError::SpecBuild("empty command".to_string()));
        }

        let mut stdin = None;
        let mut stdout = StreamTarget::Default;
        let mut stderr = StreamTarget::Default;
        for redirect in &call.redirects {
            match redirect {
                ExpandedRedirect::ErrToOut => stderr = StreamTarget::Merge,
                ExpandedRedirect::OutToErr => stdout = StreamTarget::Merge,
                ExpandedRedirect::File {
                    stream,
                    mode,
                    target,
                } => {
                    let file = self.open_target(target, *mode)?;
                    match stream {
                        Stream::Stdin => stdin = Some(file),
                        Stream::Stdout => stdout = StreamTarget::File(file),
                        Stream::Stderr => stderr = StreamTarget::File(file),
                        Stream::All => {
                            let copy = file
                                .try_clone()
                                .map_err(|e| ProcError::SpecBuild(format!("redirect failed: {}", e)))?;
                            stdout = StreamTarget::File(file);
                            stderr = StreamTarget::File(copy);
                        }
                    }
                }
            }
        }

        let resolution = self.session.resolve(argv, &self.aliases, &self.env, &self.cwd)?;
        let threadable = match &resolution.command {
            ResolvedCommand::External(_) => {
                self.settings.thread_subprocs && predict_threadable(&resolution.argv)
            }
            ResolvedCommand::Callable(c) => c.threadable && !c.main_thread,
            ResolvedCommand::Nested(_) => false,
        };

        Ok(SubprocSpec {
            argv: resolution.argv,
            command: resolution.command,
            alias: resolution.alias,
            stdin,
            stdout,
            stderr,
            captured: self.captured,
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            pipeline_index: index,
            background: self.background,
            negated: self.negated,
            threadable,
        })
    }

    fn home(&self) -> String {
        self.env.get("HOME").cloned().unwrap_or_else(|| "~".to_string())
    }

    /// Expand one word into zero or more arguments.
    pub fn expand_word(&self, word: &ArgWord) -> Result<Vec<String>, ProcError> {
        if let [ArgPiece::Items(items)] = word.pieces.as_slice() {
            return Ok(items.clone());
        }

        // (text, glob pattern, has live wildcard)
        let mut combos: Vec<(String, String, bool)> = vec![(String::new(), String::new(), false)];
        for piece in &word.pieces {
            match piece {
                ArgPiece::Text { text, glob } => {
                    let wild = *glob && has_glob_chars(text);
                    let pat = if *glob {
                        text.clone()
                    } else {
                        glob::Pattern::escape(text)
                    };
                    for combo in &mut combos {
                        combo.0.push_str(text);
                        combo.1.push_str(&pat);
                        combo.2 |= wild;
                    }
                }
                ArgPiece::Tilde => {
                    let home = self.home();
                    let pat = glob::Pattern::escape(&home);
                    for combo in &mut combos {
                        combo.0.push_str(&home);
                        combo.1.push_str(&pat);
                    }
                }
                ArgPiece::Items(items) => {
                    let mut next = Vec::with_capacity(combos.len() * items.len());
                    for combo in &combos {
                        for item in items {
                            next.push((
                                format!("{}{}", combo.0, item),
                                format!("{}{}", combo.1, glob::Pattern::escape(item)),
                                combo.2,
                            ));
                        }
                    }
                    combos = next;
                }
            }
        }

        let mut out = Vec::new();
        for (text, pattern, wild) in combos {
            if wild {
                out.extend(self.glob(&text, &pattern)?);
            } else {
                out.push(text);
            }
        }
        Ok(out)
    }

    fn glob(&self, text: &str, pattern: &str) -> Result<Vec<String>, ProcError> {
        let relative = !Path::new(pattern).is_absolute();
        let full = if relative {
            format!(
                "{}/{}",
                glob::Pattern::escape(&self.cwd.to_string_lossy()),
                pattern
            )
        } else {
            pattern.to_string()
        };
        let paths = glob::glob(&full)
            .map_err(|e| ProcError::SpecBuild(format!("invalid glob pattern '{}': {}", text, e)))?;
        let mut matches: Vec<String> = paths
            .filter_map(Result::ok)
            .map(|p| {
                if relative {
                    p.strip_prefix(&self.cwd).map(Path::to_path_buf).unwrap_or(p)
                } else {
                    p
                }
            })
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        if matches.is_empty() {
            tracing::debug!(pattern = text, "glob matched nothing");
            return Ok(match self.settings.glob_no_match {
                GlobPolicy::Literal => vec![text.to_string()],
                GlobPolicy::Drop => Vec::new(),
            });
        }
        matches.sort();
        Ok(matches)
    }

    fn open_target(&self, target: &ArgWord, mode: FileMode) -> Result<File, ProcError> {
        let mut name = String::new();
        for piece in &target.pieces {
            match piece {
                ArgPiece::Text { text, .. } => name.push_str(text),
                ArgPiece::Tilde => name.push_str(&self.home()),
                ArgPiece::Items(items) if items.len() == 1 => name.push_str(&items[0]),
                ArgPiece::Items(_) => {
                    return Err(ProcError::SpecBuild("ambiguous redirect".to_string()))
                }
            }
        }
        if name.is_empty() {
            return Err(ProcError::SpecBuild("redirect target is empty".to_string()));
        }
        let path = self.cwd.join(&name);
        let result = match mode {
            FileMode::Read => File::open(&path),
            FileMode::Write => OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path),
            FileMode::Append => OpenOptions::new().append(true).create(true).open(&path),
        };
        result.map_err(|e| ProcError::SpecBuild(format!("{}: {}", name, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use std::fs;

    fn builder_in(dir: &Path) -> SpecBuilder {
        let session = Session::new(false);
        session.set_cwd(dir.to_path_buf());
        SpecBuilder::new(&session, Capture::Hidden, false, false)
    }

    fn text(t: &str, glob: bool) -> ArgPiece {
        ArgPiece::Text {
            text: t.to_string(),
            glob,
        }
    }

    #[test]
    fn test_spliced_list_yields_separate_args() {
        let dir = tempfile::tempdir().unwrap();
        let b = builder_in(dir.path());
        let word = ArgWord {
            pieces: vec![ArgPiece::Items(vec!["a".into(), "b".into()])],
        };
        assert_eq!(b.expand_word(&word).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_adjacent_splice_is_outer_product() {
        let dir = tempfile::tempdir().unwrap();
        let b = builder_in(dir.path());
        let word = ArgWord {
            pieces: vec![
                text("x", false),
                ArgPiece::Items(vec!["1".into(), "2".into()]),
                text(".txt", false),
            ],
        };
        assert_eq!(b.expand_word(&word).unwrap(), vec!["x1.txt", "x2.txt"]);
    }

    #[test]
    fn test_glob_expands_relative_to_cwd() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.rs"), "").unwrap();
        fs::write(dir.path().join("a.rs"), "").unwrap();
        fs::write(dir.path().join("c.txt"), "").unwrap();
        let b = builder_in(dir.path());
        assert_eq!(b.expand_word(&ArgWord::text("*.rs")).unwrap(), vec!["a.rs", "b.rs"]);
    }

    #[test]
    fn test_quoted_glob_is_literal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.rs"), "").unwrap();
        let b = builder_in(dir.path());
        let word = ArgWord {
            pieces: vec![text("*.rs", false)],
        };
        assert_eq!(b.expand_word(&word).unwrap(), vec!["*.rs"]);
    }

    #[test]
    fn test_zero_match_policy() {
        let dir = tempfile::tempdir().unwrap();
        let b = builder_in(dir.path());
        assert_eq!(b.expand_word(&ArgWord::text("*.none")).unwrap(), vec!["*.none"]);

        let session = Session::new(false);
        session.set_cwd(dir.path().to_path_buf());
        session.set_env(crate::config::GLOB_NO_MATCH, "drop");
        let b = SpecBuilder::new(&session, Capture::Hidden, false, false);
        assert!(b.expand_word(&ArgWord::text("*.none")).unwrap().is_empty());
    }

    #[test]
    fn test_bad_redirect_target_is_spec_error() {
        let dir = tempfile::tempdir().unwrap();
        let b = builder_in(dir.path());
        let call = ExpandedCall {
            words: vec![ArgWord::text("true")],
            redirects: vec![ExpandedRedirect::File {
                stream: Stream::Stdin,
                mode: FileMode::Read,
                target: ArgWord::text("missing.txt"),
            }],
        };
        assert!(matches!(b.build(call, 0), Err(ProcError::SpecBuild(_))));
    }

    #[test]
    fn test_build_resolves_and_opens_redirects() {
        let dir = tempfile::tempdir().unwrap();
        let b = builder_in(dir.path());
        let call = ExpandedCall {
            words: vec![ArgWord::text("echo"), ArgWord::text("hi")],
            redirects: vec![
                ExpandedRedirect::File {
                    stream: Stream::Stdout,
                    mode: FileMode::Write,
                    target: ArgWord::text("out.txt"),
                },
                ExpandedRedirect::ErrToOut,
            ],
        };
        let spec = b.build(call, 0).unwrap();
        assert_eq!(spec.argv, vec!["echo", "hi"]);
        assert!(matches!(spec.command, ResolvedCommand::External(_)));
        assert!(matches!(spec.stdout, StreamTarget::File(_)));
        assert!(matches!(spec.stderr, StreamTarget::Merge));
        assert!(dir.path().join("out.txt").exists());
    }
}
