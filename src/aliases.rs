//! Alias registry.
//!
//! An alias is one of three things: an argument template (`ll` →
//! `ls -l`), an in-process callable, or a nested alias that needs the
//! interpreter (a block of source text or a host function). The table is
//! copy-on-write so a pipeline can hold a consistent snapshot while the
//! primary thread keeps editing aliases.

use crate::ast::FunctionDef;
use crate::cmdline::split_words;
use crate::parser::ParseError;
use crate::session::Session;
use crate::signals::InterruptFlag;
use crate::value::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AliasError {
    /// The stage should be reported as killed by SIGINT
    #[error("interrupted")]
    Interrupted,
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Everything a callable alias gets to see while it runs.
pub struct AliasCall {
    pub name: String,
    pub args: Vec<String>,
    pub stdin: Box<dyn Read + Send>,
    pub stdout: Box<dyn Write + Send>,
    pub stderr: Box<dyn Write + Send>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub session: Session,
    /// Caller's function stack, present when the alias asked for it
    pub stack: Option<Vec<String>>,
    pub(crate) interrupt: InterruptFlag,
}

impl AliasCall {
    /// Fail with [`AliasError::Interrupted`] once the pipeline was interrupted.
    pub fn check_interrupt(&self) -> Result<(), AliasError> {
        if self.interrupt.is_raised() {
            Err(AliasError::Interrupted)
        } else {
            Ok(())
        }
    }

    pub fn interrupted(&self) -> bool {
        self.interrupt.is_raised()
    }
}

pub type AliasFn = dyn Fn(&mut AliasCall) -> Result<Value, AliasError> + Send + Sync;

#[derive(Clone)]
pub struct CallableAlias {
    pub name: String,
    pub func: Arc<AliasFn>,
    /// Safe to run on a worker with captured output
    pub threadable: bool,
    /// Must run on the primary thread
    pub main_thread: bool,
    pub wants_stack: bool,
}

impl fmt::Debug for CallableAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallableAlias")
            .field("name", &self.name)
            .field("threadable", &self.threadable)
            .field("main_thread", &self.main_thread)
            .finish()
    }
}

/// Alias evaluated by the interpreter on the primary thread.
#[derive(Debug, Clone)]
pub enum NestedAlias {
    /// Source text run with `args` bound
    Source(String),
    Function(Arc<FunctionDef>),
}

#[derive(Debug, Clone)]
pub enum Alias {
    Template(Vec<String>),
    Callable(CallableAlias),
    Nested(NestedAlias),
}

/// Substrings that make string alias text run as source instead of a template.
const SOURCE_MARKERS: &[&str] = &[
    "@(", "$(", "!(", "$[", "![", "&&", "||", " and ", " or ", "|", ">", "<", ";", "\n",
];

impl Alias {
    /// Build a callable alias.
    pub fn callable<F>(name: &str, func: F) -> Self
    where
        F: Fn(&mut AliasCall) -> Result<Value, AliasError> + Send + Sync + 'static,
    {
        Alias::Callable(CallableAlias {
            name: name.to_string(),
            func: Arc::new(func),
            threadable: true,
            main_thread: false,
            wants_stack: false,
        })
    }

    /// Mark a callable as needing direct terminal access.
    pub fn unthreadable(mut self) -> Self {
        if let Alias::Callable(c) = &mut self {
            c.threadable = false;
        }
        self
    }

    /// Mark a callable as needing the primary thread.
    pub fn main_thread(mut self) -> Self {
        if let Alias::Callable(c) = &mut self {
            c.main_thread = true;
            c.threadable = false;
        }
        self
    }

    /// Ask for the caller's function stack.
    pub fn with_stack(mut self) -> Self {
        if let Alias::Callable(c) = &mut self {
            c.wants_stack = true;
        }
        self
    }

    /// Interpret alias text: plain words become a template, text using
    /// operators or substitutions runs as source.
    pub fn from_text(text: &str) -> Result<Self, ParseError> {
        if SOURCE_MARKERS.iter().any(|m| text.contains(m)) {
            return Ok(Alias::Nested(NestedAlias::Source(text.to_string())));
        }
        let words = split_words(text)?;
        if words.is_empty() {
            return Err(ParseError::syntax(1, "empty alias"));
        }
        Ok(Alias::Template(words))
    }

    /// Short human-readable description, as printed by `which`.
    pub fn describe(&self) -> String {
        match self {
            Alias::Template(words) => words.join(" "),
            Alias::Callable(c) => format!("<callable {}>", c.name),
            Alias::Nested(NestedAlias::Source(text)) => format!("<source {:?}>", text),
            Alias::Nested(NestedAlias::Function(def)) => format!("<function {}>", def.name),
        }
    }
}

/// Point-in-time view of the alias table.
#[derive(Debug, Clone, Default)]
pub struct AliasSnapshot(Arc<HashMap<String, Alias>>);

impl AliasSnapshot {
    pub fn get(&self, name: &str) -> Option<&Alias> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }
}

#[derive(Default)]
pub struct AliasRegistry {
    table: RwLock<Arc<HashMap<String, Alias>>>,
}

impl AliasRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> AliasSnapshot {
        let guard = self.table.read().unwrap_or_else(|e| e.into_inner());
        AliasSnapshot(Arc::clone(&*guard))
    }

    pub fn get(&self, name: &str) -> Option<Alias> {
        self.snapshot().get(name).cloned()
    }

    pub fn set(&self, name: &str, alias: Alias) {
        let mut guard = self.table.write().unwrap_or_else(|e| e.into_inner());
        let mut table = HashMap::clone(&**guard);
        table.insert(name.to_string(), alias);
        *guard = Arc::new(table);
    }

    /// Remove an alias, returning whether it existed.
    pub fn remove(&self, name: &str) -> bool {
        let mut guard = self.table.write().unwrap_or_else(|e| e.into_inner());
        if !guard.contains_key(name) {
            return false;
        }
        let mut table = HashMap::clone(&**guard);
        table.remove(name);
        *guard = Arc::new(table);
        true
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot().0.keys().cloned().collect();
        names.sort();
        names
    }
}
