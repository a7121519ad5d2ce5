//! Context-sensitive disambiguation.
//!
//! Each simple statement arrives with a host parse and a subprocess parse.
//! This pass picks one per statement from the names in scope, for a whole
//! compilation unit, before anything runs. It is a pure function of the
//! tree and the starting [`ScopeSnapshot`].

use crate::ast::{Stmt, Target};
use crate::parser::ParseError;
use std::collections::HashSet;

/// Names bound when a statement starts.
#[derive(Debug, Clone, Default)]
pub struct ScopeSnapshot {
    names: HashSet<String>,
}

impl ScopeSnapshot {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ScopeSnapshot {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn bind(&mut self, name: &str) {
        self.names.insert(name.to_string());
    }
}

pub struct Disambiguator {
    scope: ScopeSnapshot,
}

impl Disambiguator {
    pub fn new(scope: ScopeSnapshot) -> Self {
        Disambiguator { scope }
    }

    /// Resolve every ambiguous statement in `stmts`.
    ///
    /// Fails with the host parse error of the first statement that has no
    /// valid interpretation; in that case nothing in the unit may run.
    pub fn resolve(mut self, stmts: Vec<Stmt>) -> Result<Vec<Stmt>, ParseError> {
        self.block(stmts)
    }

    fn block(&mut self, stmts: Vec<Stmt>) -> Result<Vec<Stmt>, ParseError> {
        stmts.into_iter().map(|s| self.stmt(s)).collect()
    }

    fn stmt(&mut self, stmt: Stmt) -> Result<Stmt, ParseError> {
        let resolved = match stmt {
            Stmt::Ambiguous(candidates) => {
                let chosen = self.choose(candidates.host, candidates.subproc)?;
                return self.stmt(chosen);
            }
            Stmt::Assign(target, value) => {
                if let Target::Name(name) = &target {
                    self.scope.bind(name);
                }
                Stmt::Assign(target, value)
            }
            Stmt::If { branches, orelse } => {
                let branches = branches
                    .into_iter()
                    .map(|(cond, body)| Ok((cond, self.block(body)?)))
                    .collect::<Result<Vec<_>, ParseError>>()?;
                let orelse = orelse.map(|body| self.block(body)).transpose()?;
                Stmt::If { branches, orelse }
            }
            Stmt::While(cond, body) => Stmt::While(cond, self.block(body)?),
            Stmt::For(var, iter, body) => {
                self.scope.bind(&var);
                Stmt::For(var, iter, self.block(body)?)
            }
            Stmt::Def(def) => {
                self.scope.bind(&def.name);
                let mut inner = Disambiguator {
                    scope: self.scope.clone(),
                };
                for param in &def.params {
                    inner.scope.bind(param);
                }
                let body = inner.block(def.body.clone())?;
                let mut def = (*def).clone();
                def.body = body;
                Stmt::Def(def.into())
            }
            other => other,
        };
        Ok(resolved)
    }

    fn choose(
        &self,
        host: Result<Stmt, ParseError>,
        subproc: Result<Stmt, ParseError>,
    ) -> Result<Stmt, ParseError> {
        match (host, subproc) {
            (Ok(host), Ok(subproc)) => {
                let unbound = match &host {
                    Stmt::Expr(expr) => expr
                        .leftmost_name()
                        .map_or(false, |name| !self.scope.contains(name)),
                    _ => false,
                };
                Ok(if unbound { subproc } else { host })
            }
            (Ok(host), Err(_)) => Ok(host),
            (Err(_), Ok(subproc)) => Ok(subproc),
            (Err(err), Err(_)) => Err(err),
        }
    }
}

/// Convenience wrapper over [`Disambiguator::resolve`].
pub fn disambiguate(stmts: Vec<Stmt>, scope: ScopeSnapshot) -> Result<Vec<Stmt>, ParseError> {
    Disambiguator::new(scope).resolve(stmts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Capture, Expr};
    use crate::parser::parse_unit;

    fn resolve(src: &str, names: &[&str]) -> Vec<Stmt> {
        disambiguate(parse_unit(src).unwrap(), ScopeSnapshot::new(names.iter().copied())).unwrap()
    }

    fn is_command(stmt: &Stmt) -> bool {
        matches!(stmt, Stmt::Expr(Expr::Subproc(sp)) if sp.capture == Capture::Hidden)
    }

    #[test]
    fn test_bound_name_keeps_host() {
        let stmts = resolve("ls - 1", &["ls"]);
        assert!(!is_command(&stmts[0]));
    }

    #[test]
    fn test_unbound_name_becomes_command() {
        let stmts = resolve("ls -l", &[]);
        assert!(is_command(&stmts[0]));
    }

    #[test]
    fn test_earlier_assignment_binds_name() {
        let stmts = resolve("ls = 5\nls - 1", &[]);
        assert!(matches!(stmts[0], Stmt::Assign(..)));
        assert!(!is_command(&stmts[1]));
    }

    #[test]
    fn test_host_only_parse_is_kept() {
        let stmts = resolve("print(1)", &[]);
        assert!(matches!(stmts[0], Stmt::Expr(Expr::Call(..))));
    }

    #[test]
    fn test_both_fail_surfaces_host_error() {
        let err = disambiguate(parse_unit("x = (").unwrap(), ScopeSnapshot::default());
        assert!(err.is_err());
    }

    #[test]
    fn test_function_params_are_scoped() {
        let stmts = resolve("def f(ls) {\n ls - 1\n}\nls - 1", &[]);
        match &stmts[0] {
            Stmt::Def(def) => assert!(!is_command(&def.body[0])),
            other => panic!("unexpected {:?}", other),
        }
        assert!(is_command(&stmts[1]));
    }

    #[test]
    fn test_idempotent() {
        let once = resolve("x = 1\necho hi\nx + 1\nfor i in [1] { ls -l }", &[]);
        let twice = disambiguate(once.clone(), ScopeSnapshot::default()).unwrap();
        assert_eq!(once, twice);
    }
}
