//! Shared shell state.
//!
//! A [`Session`] is a cheap handle to everything that outlives one
//! evaluation: working directory, environment, aliases, the command cache,
//! the job table and the interrupt flag. Worker threads and callable aliases
//! get a clone of the handle instead of touching process globals.

use crate::aliases::{AliasRegistry, AliasSnapshot};
use crate::config::Settings;
use crate::procs::{JobControl, ProcError};
use crate::resolver::{CommandResolver, Resolution};
use crate::signals::InterruptFlag;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone)]
struct ShellState {
    cwd: PathBuf,
    env: BTreeMap<String, String>,
    exit_request: Option<i32>,
}

/// Called with the command name whenever resolution ends in "not found".
pub type NotFoundHook = Arc<dyn Fn(&str) + Send + Sync>;

struct SessionInner {
    state: RwLock<ShellState>,
    not_found_hook: RwLock<Option<NotFoundHook>>,
    aliases: AliasRegistry,
    resolver: Mutex<CommandResolver>,
    jobs: JobControl,
    interrupt: InterruptFlag,
    interactive: bool,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("cwd", &self.cwd())
            .field("interactive", &self.inner.interactive)
            .finish()
    }
}

fn stdin_is_tty() -> bool {
    unsafe { libc::isatty(libc::STDIN_FILENO) == 1 }
}

impl Session {
    /// New session seeded from the process environment and working directory.
    ///
    /// Job control is enabled only for interactive sessions on a terminal.
    pub fn new(interactive: bool) -> Self {
        let env: BTreeMap<String, String> = std::env::vars().collect();
        let cwd = std::env::current_dir()
            .ok()
            .or_else(|| env.get("PWD").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("/"));
        let job_control = interactive && stdin_is_tty();
        Session {
            inner: Arc::new(SessionInner {
                state: RwLock::new(ShellState {
                    cwd,
                    env,
                    exit_request: None,
                }),
                not_found_hook: RwLock::new(None),
                aliases: AliasRegistry::new(),
                resolver: Mutex::new(CommandResolver::new()),
                jobs: JobControl::new(job_control),
                interrupt: InterruptFlag::new(),
                interactive,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ShellState> {
        self.inner.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ShellState> {
        self.inner.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn interactive(&self) -> bool {
        self.inner.interactive
    }

    pub fn cwd(&self) -> PathBuf {
        self.read().cwd.clone()
    }

    /// Change directory, keeping `$PWD` and `$OLDPWD` in step.
    pub fn set_cwd(&self, cwd: PathBuf) {
        let mut state = self.write();
        let old = std::mem::replace(&mut state.cwd, cwd);
        let pwd = state.cwd.display().to_string();
        state.env.insert("OLDPWD".to_string(), old.display().to_string());
        state.env.insert("PWD".to_string(), pwd);
    }

    pub fn env_snapshot(&self) -> BTreeMap<String, String> {
        self.read().env.clone()
    }

    pub fn get_env(&self, key: &str) -> Option<String> {
        self.read().env.get(key).cloned()
    }

    pub fn set_env(&self, key: &str, value: &str) {
        self.write().env.insert(key.to_string(), value.to_string());
    }

    pub fn unset_env(&self, key: &str) {
        self.write().env.remove(key);
    }

    pub fn settings(&self) -> Settings {
        Settings::from_env(&self.read().env)
    }

    pub fn aliases(&self) -> &AliasRegistry {
        &self.inner.aliases
    }

    pub fn jobs(&self) -> &JobControl {
        &self.inner.jobs
    }

    pub fn interrupt(&self) -> &InterruptFlag {
        &self.inner.interrupt
    }

    /// Resolve a command line against an alias snapshot and environment.
    pub fn resolve(
        &self,
        argv: Vec<String>,
        aliases: &AliasSnapshot,
        env: &BTreeMap<String, String>,
        cwd: &Path,
    ) -> Result<Resolution, ProcError> {
        let result = {
            let mut resolver = self.inner.resolver.lock().unwrap_or_else(|e| e.into_inner());
            resolver.resolve(argv, aliases, env.get("PATH").map(String::as_str), cwd)
        };
        if let Err(ProcError::NotFound(name)) = &result {
            let hook = self.inner.not_found_hook.read().unwrap_or_else(|e| e.into_inner()).clone();
            if let Some(hook) = hook {
                hook(name);
            }
        }
        result
    }

    /// Install the command-not-found hook, replacing any previous one.
    pub fn set_not_found_hook(&self, hook: Option<NotFoundHook>) {
        *self.inner.not_found_hook.write().unwrap_or_else(|e| e.into_inner()) = hook;
    }

    /// Resolve a command using the current session state.
    pub fn resolve_now(&self, argv: Vec<String>) -> Result<Resolution, ProcError> {
        let env = self.env_snapshot();
        let cwd = self.cwd();
        self.resolve(argv, &self.aliases().snapshot(), &env, &cwd)
    }

    pub fn flush_command_cache(&self) {
        self.inner
            .resolver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .flush();
    }

    /// Ask the interpreter to exit after the current statement.
    pub fn request_exit(&self, code: i32) {
        self.write().exit_request = Some(code);
    }

    pub fn take_exit_request(&self) -> Option<i32> {
        self.write().exit_request.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_cwd_updates_pwd() {
        let session = Session::new(false);
        let before = session.cwd();
        session.set_cwd(PathBuf::from("/"));
        assert_eq!(session.get_env("PWD").as_deref(), Some("/"));
        assert_eq!(
            session.get_env("OLDPWD"),
            Some(before.display().to_string())
        );
    }

    #[test]
    fn test_env_is_per_session() {
        let a = Session::new(false);
        let b = Session::new(false);
        a.set_env("DUOSH_TEST_ONLY", "1");
        assert!(b.get_env("DUOSH_TEST_ONLY").is_none());
        assert!(std::env::var("DUOSH_TEST_ONLY").is_err());
    }

    #[test]
    fn test_not_found_hook_sees_name() {
        let session = Session::new(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        session.set_not_found_hook(Some(Arc::new(move |name: &str| {
            sink.lock().unwrap().push(name.to_string());
        })));
        let err = session
            .resolve_now(vec!["duosh-hook-missing".to_string()])
            .unwrap_err();
        assert!(matches!(err, ProcError::NotFound(_)));
        assert_eq!(*seen.lock().unwrap(), vec!["duosh-hook-missing"]);
    }

    #[test]
    fn test_exit_request_is_taken_once() {
        let session = Session::new(false);
        session.request_exit(3);
        assert_eq!(session.take_exit_request(), Some(3));
        assert_eq!(session.take_exit_request(), None);
    }
}
