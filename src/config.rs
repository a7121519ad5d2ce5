//! Runtime settings read from the session environment.
//!
//! Settings are parsed on demand from the session's variables, so changing
//! `$DUOSH_RAISE_SUBPROC_ERROR` inside a script takes effect on the next
//! pipeline.

use std::collections::BTreeMap;
use std::time::Duration;

pub const RAISE_SUBPROC_ERROR: &str = "DUOSH_RAISE_SUBPROC_ERROR";
pub const THREAD_SUBPROCS: &str = "DUOSH_THREAD_SUBPROCS";
pub const STORE_STDOUT: &str = "DUOSH_STORE_STDOUT";
pub const POLL_INTERVAL_MS: &str = "DUOSH_POLL_INTERVAL_MS";
pub const GLOB_NO_MATCH: &str = "DUOSH_GLOB_NO_MATCH";
pub const MAX_RECURSION: &str = "DUOSH_MAX_RECURSION";
pub const LOG_FILTER: &str = "DUOSH_LOG";

const DEFAULT_POLL_MS: u64 = 10;
/// Host call depth that fits a 2 MiB thread stack in debug builds.
const DEFAULT_MAX_RECURSION: usize = 64;

/// What a glob pattern with no matches expands to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobPolicy {
    /// Pass the pattern through unchanged
    Literal,
    /// Drop the argument
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub raise_subproc_error: bool,
    pub thread_subprocs: bool,
    pub store_stdout: bool,
    pub poll_interval: Duration,
    pub glob_no_match: GlobPolicy,
    pub max_recursion: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            raise_subproc_error: false,
            thread_subprocs: true,
            store_stdout: false,
            poll_interval: Duration::from_millis(DEFAULT_POLL_MS),
            glob_no_match: GlobPolicy::Literal,
            max_recursion: DEFAULT_MAX_RECURSION,
        }
    }
}

fn flag(env: &BTreeMap<String, String>, key: &str, default: bool) -> bool {
    match env.get(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => default,
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" | "" => false,
            _ => {
                tracing::warn!(key, value = %v, "unrecognised boolean setting");
                default
            }
        },
    }
}

impl Settings {
    pub fn from_env(env: &BTreeMap<String, String>) -> Self {
        let defaults = Settings::default();
        let poll_interval = env
            .get(POLL_INTERVAL_MS)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);
        let glob_no_match = match env.get(GLOB_NO_MATCH).map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "drop" => GlobPolicy::Drop,
            _ => GlobPolicy::Literal,
        };
        let max_recursion = env
            .get(MAX_RECURSION)
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.max_recursion);
        Settings {
            raise_subproc_error: flag(env, RAISE_SUBPROC_ERROR, defaults.raise_subproc_error),
            thread_subprocs: flag(env, THREAD_SUBPROCS, defaults.thread_subprocs),
            store_stdout: flag(env, STORE_STDOUT, defaults.store_stdout),
            poll_interval,
            glob_no_match,
            max_recursion,
        }
    }
}

/// Tracing filter directive: `DUOSH_LOG`, then `RUST_LOG`, then `warn`.
pub fn log_filter() -> String {
    std::env::var(LOG_FILTER)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "warn".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        assert_eq!(Settings::from_env(&BTreeMap::new()), Settings::default());
    }

    #[test]
    fn test_overrides() {
        let s = Settings::from_env(&env(&[
            (RAISE_SUBPROC_ERROR, "1"),
            (THREAD_SUBPROCS, "false"),
            (POLL_INTERVAL_MS, "25"),
            (GLOB_NO_MATCH, "drop"),
            (MAX_RECURSION, "200"),
        ]));
        assert!(s.raise_subproc_error);
        assert!(!s.thread_subprocs);
        assert_eq!(s.poll_interval, Duration::from_millis(25));
        assert_eq!(s.glob_no_match, GlobPolicy::Drop);
        assert_eq!(s.max_recursion, 200);
    }

    #[test]
    fn test_bad_values_fall_back() {
        let s = Settings::from_env(&env(&[(STORE_STDOUT, "maybe"), (POLL_INTERVAL_MS, "0")]));
        assert!(!s.store_stdout);
        assert_eq!(s.poll_interval, Duration::from_millis(DEFAULT_POLL_MS));
    }
}
