//! Default aliases installed in every session.

use crate::aliases::{Alias, AliasCall, AliasError, NestedAlias};
use crate::procs::{JobError, ProcError};
use crate::resolver::ResolvedCommand;
use crate::session::Session;
use crate::value::Value;
use std::io::Write;
use std::path::PathBuf;

fn job_error(e: JobError) -> AliasError {
    match e {
        JobError::Proc(ProcError::Interrupted) => AliasError::Interrupted,
        other => AliasError::Failed(other.to_string()),
    }
}

fn cd(call: &mut AliasCall) -> Result<Value, AliasError> {
    let target = match call.args.first().map(String::as_str) {
        None => call
            .env
            .get("HOME")
            .map(PathBuf::from)
            .ok_or_else(|| AliasError::Failed("HOME not set".to_string()))?,
        Some("-") => {
            let old = call
                .env
                .get("OLDPWD")
                .ok_or_else(|| AliasError::Failed("OLDPWD not set".to_string()))?;
            writeln!(call.stdout, "{}", old)?;
            PathBuf::from(old)
        }
        Some(dir) => call.cwd.join(dir),
    };
    if !target.is_dir() {
        return Err(AliasError::Failed(format!("no such directory: {}", target.display())));
    }
    let target = target.canonicalize()?;
    tracing::debug!(cwd = %target.display(), "changing directory");
    call.session.set_cwd(target);
    Ok(Value::Int(0))
}

fn exit(call: &mut AliasCall) -> Result<Value, AliasError> {
    let code = match call.args.first() {
        None => 0,
        Some(text) => text
            .parse()
            .map_err(|_| AliasError::Failed(format!("numeric argument required: {}", text)))?,
    };
    call.session.request_exit(code);
    Ok(Value::Int(code as i64))
}

fn jobs(call: &mut AliasCall) -> Result<Value, AliasError> {
    let listing = call.session.jobs().list();
    if call.args.iter().any(|a| a == "--json") {
        let json = serde_json::to_string_pretty(&listing)
            .map_err(|e| AliasError::Failed(e.to_string()))?;
        writeln!(call.stdout, "{}", json)?;
    } else {
        for info in &listing {
            writeln!(call.stdout, "{}", info.posix())?;
        }
    }
    Ok(Value::Int(0))
}

fn fg(call: &mut AliasCall) -> Result<Value, AliasError> {
    let spec = call.args.first().map(String::as_str);
    let code = call.session.jobs().fg(spec).map_err(job_error)?;
    Ok(Value::Int(code as i64))
}

fn bg(call: &mut AliasCall) -> Result<Value, AliasError> {
    let spec = call.args.first().map(String::as_str);
    call.session.jobs().bg(spec).map_err(job_error)?;
    Ok(Value::Int(0))
}

fn disown(call: &mut AliasCall) -> Result<Value, AliasError> {
    let spec = call.args.first().map(String::as_str);
    call.session.jobs().disown(spec).map_err(job_error)?;
    Ok(Value::Int(0))
}

fn which(call: &mut AliasCall) -> Result<Value, AliasError> {
    let mut status = 0;
    for name in call.args.clone() {
        call.check_interrupt()?;
        if let Some(alias) = call.session.aliases().get(&name) {
            writeln!(call.stdout, "{}: aliased to {}", name, alias.describe())?;
            continue;
        }
        match call.session.resolve_now(vec![name.clone()]) {
            Ok(resolution) => match resolution.command {
                ResolvedCommand::External(path) => writeln!(call.stdout, "{}", path.display())?,
                _ => writeln!(call.stdout, "{}", name)?,
            },
            Err(e) => {
                writeln!(call.stderr, "which: {}", e)?;
                status = 1;
            }
        }
    }
    Ok(Value::Int(status))
}

fn unalias(call: &mut AliasCall) -> Result<Value, AliasError> {
    let mut status = 0;
    for name in &call.args {
        if !call.session.aliases().remove(name) {
            writeln!(call.stderr, "unalias: {}: not found", name)?;
            status = 1;
        }
    }
    Ok(Value::Int(status))
}

fn rehash(call: &mut AliasCall) -> Result<Value, AliasError> {
    call.session.flush_command_cache();
    Ok(Value::Int(0))
}

/// Install the default alias table. Existing entries are replaced.
pub(crate) fn install_defaults(session: &Session) {
    let aliases = session.aliases();
    aliases.set("cd", Alias::callable("cd", cd).main_thread());
    aliases.set("exit", Alias::callable("exit", exit).main_thread());
    aliases.set("jobs", Alias::callable("jobs", jobs).main_thread());
    aliases.set("fg", Alias::callable("fg", fg).main_thread());
    aliases.set("bg", Alias::callable("bg", bg).main_thread());
    aliases.set("disown", Alias::callable("disown", disown).main_thread());
    aliases.set("unalias", Alias::callable("unalias", unalias).main_thread());
    aliases.set("rehash", Alias::callable("rehash", rehash).main_thread());
    aliases.set("which", Alias::callable("which", which));
    aliases.set(
        "source",
        Alias::Nested(NestedAlias::Source("source(args[0])".to_string())),
    );
}

#[cfg(test)]
mod tests {
    use crate::eval::Evaluator;
    use crate::session::Session;

    #[test]
    fn test_cd_changes_session_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let mut ev = Evaluator::capturing(Session::new(false));
        let before = ev.session().cwd();
        ev.eval(&format!("cd {}", dir.path().display())).unwrap();
        assert_eq!(ev.session().cwd(), dir.path().canonicalize().unwrap());
        ev.eval("cd -").unwrap();
        assert_eq!(ev.session().cwd(), before);
    }

    #[test]
    fn test_cd_to_missing_dir_fails() {
        let mut ev = Evaluator::capturing(Session::new(false));
        let result = ev.eval("cd /duosh/definitely/missing").unwrap();
        assert_eq!(result.exit_code, 1);
    }

    #[test]
    fn test_exit_alias_stops_unit() {
        let mut ev = Evaluator::capturing(Session::new(false));
        let err = ev.eval("exit 5\nprint('after')").unwrap_err();
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn test_jobs_json_empty() {
        let mut ev = Evaluator::capturing(Session::new(false));
        let result = ev.eval("jobs --json").unwrap();
        assert_eq!(result.output.trim(), "[]");
    }

    #[test]
    fn test_which_reports_alias() {
        let mut ev = Evaluator::capturing(Session::new(false));
        let out = ev.eval("$(which cd)").unwrap().value;
        assert_eq!(out.to_str(), "cd: aliased to <callable cd>");
    }
}
