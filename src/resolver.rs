//! Command resolution: alias table first, then the search path.
//!
//! Provides:
//! 1. Iterative alias expansion with cycle detection
//! 2. PATH lookup with a cache keyed on the PATH value
//! 3. A prediction table for commands that need direct terminal access

use crate::aliases::{Alias, AliasSnapshot, CallableAlias, NestedAlias};
use crate::procs::ProcError;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// What a command name resolved to.
#[derive(Debug, Clone)]
pub enum ResolvedCommand {
    External(PathBuf),
    Callable(CallableAlias),
    Nested(NestedAlias),
}

/// Outcome of resolving one command line.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Arguments after template aliases were applied
    pub argv: Vec<String>,
    pub command: ResolvedCommand,
    /// First alias applied, if any
    pub alias: Option<String>,
}

#[derive(Debug, Clone)]
enum Lookup {
    Found(PathBuf),
    NotExecutable(PathBuf),
    Missing,
}

/// Resolves command names to aliases or executables
#[derive(Debug, Default)]
pub struct CommandResolver {
    /// PATH value the cache was built from
    path_key: Option<String>,
    /// Parsed PATH directories
    path_dirs: Vec<PathBuf>,
    /// Cached PATH lookup results
    cache: HashMap<String, Lookup>,
}

fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

impl CommandResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every cached lookup.
    pub fn flush(&mut self) {
        self.cache.clear();
        self.path_key = None;
    }

    /// Number of cached names.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Apply aliases to `argv` and resolve the resulting command.
    pub fn resolve(
        &mut self,
        argv: Vec<String>,
        aliases: &AliasSnapshot,
        path: Option<&str>,
        cwd: &Path,
    ) -> Result<Resolution, ProcError> {
        let mut argv = argv;
        let mut visited: HashSet<String> = HashSet::new();
        let mut first_alias: Option<String> = None;

        loop {
            let Some(head) = argv.first().cloned() else {
                return Err(ProcError::SpecBuild("empty command".to_string()));
            };
            if visited.contains(&head) {
                return Err(ProcError::AliasCycle(head));
            }
            let alias = match aliases.get(&head) {
                Some(alias) => alias,
                None => break,
            };
            first_alias.get_or_insert_with(|| head.clone());
            match alias {
                Alias::Template(words) => {
                    if words.is_empty() {
                        return Err(ProcError::SpecBuild(format!("alias '{}' is empty", head)));
                    }
                    visited.insert(head.clone());
                    let mut expanded = words.clone();
                    expanded.extend(argv.drain(1..));
                    argv = expanded;
                    // `ls = ls --color` expands once and then names the binary
                    if argv[0] == head {
                        break;
                    }
                }
                Alias::Callable(c) => {
                    return Ok(Resolution {
                        argv,
                        command: ResolvedCommand::Callable(c.clone()),
                        alias: first_alias,
                    })
                }
                Alias::Nested(n) => {
                    return Ok(Resolution {
                        argv,
                        command: ResolvedCommand::Nested(n.clone()),
                        alias: first_alias,
                    })
                }
            }
        }

        let path = self.locate(&argv[0], path, cwd)?;
        tracing::trace!(command = %argv[0], path = %path.display(), "resolved executable");
        Ok(Resolution {
            argv,
            command: ResolvedCommand::External(path),
            alias: first_alias,
        })
    }

    /// Find an executable by name or path.
    pub fn locate(&mut self, name: &str, path: Option<&str>, cwd: &Path) -> Result<PathBuf, ProcError> {
        if name.contains('/') {
            let candidate = cwd.join(name);
            return if !candidate.exists() {
                Err(ProcError::NotFound(name.to_string()))
            } else if is_executable_file(&candidate) {
                Ok(candidate)
            } else {
                Err(ProcError::NotExecutable(name.to_string()))
            };
        }

        let path = path.unwrap_or("");
        if self.path_key.as_deref() != Some(path) {
            tracing::debug!("search path changed; flushing command cache");
            self.cache.clear();
            self.path_dirs = path
                .split(':')
                .filter(|d| !d.is_empty())
                .map(PathBuf::from)
                .collect();
            self.path_key = Some(path.to_string());
        }

        let lookup = match self.cache.get(name) {
            Some(hit) => hit.clone(),
            None => {
                let found = self.scan(name);
                self.cache.insert(name.to_string(), found.clone());
                found
            }
        };
        match lookup {
            Lookup::Found(p) => Ok(p),
            Lookup::NotExecutable(_) => Err(ProcError::NotExecutable(name.to_string())),
            Lookup::Missing => Err(ProcError::NotFound(name.to_string())),
        }
    }

    fn scan(&self, name: &str) -> Lookup {
        let mut fallback = Lookup::Missing;
        for dir in &self.path_dirs {
            let candidate = dir.join(name);
            if is_executable_file(&candidate) {
                return Lookup::Found(candidate);
            }
            if candidate.is_file() && matches!(fallback, Lookup::Missing) {
                fallback = Lookup::NotExecutable(candidate);
            }
        }
        fallback
    }
}

/// Commands that take over the terminal and must not run behind a tee.
const UNTHREADABLE: &[&str] = &[
    "cat", "clear", "cls", "cmd", "cryptop", "ed", "emacs", "emacsclient", "ex", "fzf", "htop",
    "mc", "mutt", "nano", "nvim", "percol", "pv", "psql", "rview", "rvim", "scp", "screen", "ssh",
    "startx", "tmux", "telnet", "top", "tput", "view", "vi", "vim", "xdg-open", "yes",
];

/// Interpreters that are interactive unless given a script or `-c`.
const SHELLS: &[&str] = &[
    "bash", "csh", "duosh", "elvish", "fish", "ipython", "julia", "ksh", "node", "python",
    "python2", "python3", "sh", "tcsh", "zsh",
];

/// Interactive tools that only print and exit for help/version flags.
const HELP_VERSION: &[&str] = &[
    "gvim", "less", "man", "more", "mvim", "sudo", "vimpager", "xo",
];

/// Whether a command can safely run with its stdout behind a tee worker.
pub fn predict_threadable(argv: &[String]) -> bool {
    let Some(first) = argv.first() else {
        return true;
    };
    let name = Path::new(first)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(first);
    let args = &argv[1..];

    if name == "env" {
        // env [-i] [NAME=value ...] cmd ...
        let rest: Vec<String> = args
            .iter()
            .skip_while(|a| a.starts_with('-') || a.contains('='))
            .cloned()
            .collect();
        return predict_threadable(&rest);
    }
    if UNTHREADABLE.contains(&name) {
        return false;
    }
    if SHELLS.contains(&name) {
        return args.iter().any(|a| a == "-c" || !a.starts_with('-'));
    }
    if HELP_VERSION.contains(&name) {
        return args
            .iter()
            .any(|a| matches!(a.as_str(), "-h" | "--help" | "-v" | "-V" | "--version"));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aliases::AliasRegistry;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn argv(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn bin_dir() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("tool");
        fs::write(&tool, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        let plain = dir.path().join("plain");
        fs::write(&plain, "data").unwrap();
        let path = dir.path().display().to_string();
        (dir, path)
    }

    #[test]
    fn test_path_lookup_and_cache() {
        let (dir, path) = bin_dir();
        let mut resolver = CommandResolver::new();
        let found = resolver.locate("tool", Some(&path), dir.path()).unwrap();
        assert_eq!(found, dir.path().join("tool"));
        assert_eq!(resolver.cached(), 1);
        assert!(matches!(
            resolver.locate("plain", Some(&path), dir.path()),
            Err(ProcError::NotExecutable(_))
        ));
        assert!(matches!(
            resolver.locate("nonexistent_cmd_xyz", Some(&path), dir.path()),
            Err(ProcError::NotFound(_))
        ));
    }

    #[test]
    fn test_path_change_invalidates_cache() {
        let (dir, path) = bin_dir();
        let mut resolver = CommandResolver::new();
        resolver.locate("tool", Some(&path), dir.path()).unwrap();
        assert!(resolver.locate("tool", Some("/nonexistent"), dir.path()).is_err());
        assert_eq!(resolver.cached(), 1);
    }

    #[test]
    fn test_relative_paths_use_cwd() {
        let (dir, _) = bin_dir();
        let mut resolver = CommandResolver::new();
        assert!(resolver.locate("./tool", Some(""), dir.path()).is_ok());
        assert!(matches!(
            resolver.locate("./plain", Some(""), dir.path()),
            Err(ProcError::NotExecutable(_))
        ));
    }

    #[test]
    fn test_template_alias_expands_once_for_self_reference() {
        let (dir, path) = bin_dir();
        let registry = AliasRegistry::new();
        registry.set("tool", Alias::Template(argv(&["tool", "--flag"])));
        registry.set("t", Alias::Template(argv(&["tool", "-x"])));
        let mut resolver = CommandResolver::new();
        let res = resolver
            .resolve(argv(&["t", "arg"]), &registry.snapshot(), Some(&path), dir.path())
            .unwrap();
        assert_eq!(res.argv, argv(&["tool", "--flag", "-x", "arg"]));
        assert_eq!(res.alias.as_deref(), Some("t"));
        assert!(matches!(res.command, ResolvedCommand::External(_)));
    }

    #[test]
    fn test_alias_cycle_is_an_error() {
        let registry = AliasRegistry::new();
        registry.set("a", Alias::Template(argv(&["b"])));
        registry.set("b", Alias::Template(argv(&["a"])));
        let mut resolver = CommandResolver::new();
        let err = resolver
            .resolve(argv(&["a"]), &registry.snapshot(), Some(""), Path::new("/"))
            .unwrap_err();
        assert!(matches!(err, ProcError::AliasCycle(_)));
    }

    #[test]
    fn test_threadable_predictions() {
        assert!(predict_threadable(&argv(&["ls", "-l"])));
        assert!(!predict_threadable(&argv(&["vim", "x"])));
        assert!(!predict_threadable(&argv(&["/usr/bin/ssh", "host"])));
        assert!(!predict_threadable(&argv(&["bash"])));
        assert!(predict_threadable(&argv(&["bash", "-c", "echo"])));
        assert!(predict_threadable(&argv(&["python3", "script.py"])));
        assert!(!predict_threadable(&argv(&["less", "file"])));
        assert!(predict_threadable(&argv(&["less", "--version"])));
        assert!(!predict_threadable(&argv(&["env", "A=1", "vim"])));
        assert!(predict_threadable(&argv(&["env", "A=1", "ls"])));
    }
}
