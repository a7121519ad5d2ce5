//! Host builtin functions.

use super::{EvalError, Evaluator};
use crate::aliases::{Alias, NestedAlias};
use crate::value::Value;
use std::fs;

pub(crate) const BUILTINS: &[&str] = &[
    "print", "len", "str", "int", "float", "bool", "repr", "range", "type", "list", "exit", "source",
    "alias", "unalias", "env",
];

/// Builtins left unbound for the disambiguator, so the bare word runs the
/// alias of the same name.
pub(crate) const COMMAND_WORDS: &[&str] = &["exit"];

fn expect_args(name: &str, args: &[Value], count: usize) -> Result<(), EvalError> {
    if args.len() == count {
        Ok(())
    } else {
        Err(EvalError::Type(format!(
            "{}() takes {} argument{} ({} given)",
            name,
            count,
            if count == 1 { "" } else { "s" },
            args.len()
        )))
    }
}

fn as_int(name: &str, value: &Value) -> Result<i64, EvalError> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::Bool(b) => Ok(*b as i64),
        other => Err(EvalError::Type(format!(
            "{}() expects int, not {}",
            name,
            other.type_name()
        ))),
    }
}

impl Evaluator {
    pub(crate) fn call_builtin(&mut self, name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        match name {
            "print" => {
                let parts: Vec<String> = args.iter().map(Value::to_str).collect();
                self.write_out(&format!("{}\n", parts.join(" ")))?;
                Ok(Value::None)
            }
            "len" => {
                expect_args(name, &args, 1)?;
                let len = match &args[0] {
                    Value::Str(s) => s.chars().count(),
                    Value::List(items) => items.len(),
                    other => {
                        return Err(EvalError::Type(format!(
                            "object of type '{}' has no len()",
                            other.type_name()
                        )))
                    }
                };
                Ok(Value::Int(len as i64))
            }
            "str" => {
                expect_args(name, &args, 1)?;
                Ok(Value::Str(args[0].to_str()))
            }
            "repr" => {
                expect_args(name, &args, 1)?;
                Ok(Value::Str(args[0].repr()))
            }
            "bool" => {
                expect_args(name, &args, 1)?;
                Ok(Value::Bool(args[0].truthy()))
            }
            "type" => {
                expect_args(name, &args, 1)?;
                Ok(Value::from(args[0].type_name()))
            }
            "int" => {
                expect_args(name, &args, 1)?;
                match &args[0] {
                    Value::Int(i) => Ok(Value::Int(*i)),
                    Value::Bool(b) => Ok(Value::Int(*b as i64)),
                    Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
                    Value::Str(s) => s.trim().parse().map(Value::Int).map_err(|_| {
                        EvalError::Value(format!("invalid literal for int(): {}", Value::from(s.as_str()).repr()))
                    }),
                    other => Err(EvalError::Type(format!(
                        "int() argument must be a string or a number, not '{}'",
                        other.type_name()
                    ))),
                }
            }
            "float" => {
                expect_args(name, &args, 1)?;
                match &args[0] {
                    Value::Int(i) => Ok(Value::Float(*i as f64)),
                    Value::Float(f) => Ok(Value::Float(*f)),
                    Value::Str(s) => s.trim().parse().map(Value::Float).map_err(|_| {
                        EvalError::Value(format!("could not convert string to float: {}", Value::from(s.as_str()).repr()))
                    }),
                    other => Err(EvalError::Type(format!(
                        "float() argument must be a string or a number, not '{}'",
                        other.type_name()
                    ))),
                }
            }
            "list" => {
                expect_args(name, &args, 1)?;
                let items = self.iterate(args[0].clone())?;
                Ok(Value::List(items))
            }
            "range" => {
                let (start, stop, step) = match args.as_slice() {
                    [stop] => (0, as_int(name, stop)?, 1),
                    [start, stop] => (as_int(name, start)?, as_int(name, stop)?, 1),
                    [start, stop, step] => (as_int(name, start)?, as_int(name, stop)?, as_int(name, step)?),
                    _ => return Err(EvalError::Type("range expected 1 to 3 arguments".to_string())),
                };
                if step == 0 {
                    return Err(EvalError::Value("range() arg 3 must not be zero".to_string()));
                }
                let mut items = Vec::new();
                let mut i = start;
                while (step > 0 && i < stop) || (step < 0 && i > stop) {
                    items.push(Value::Int(i));
                    i += step;
                }
                Ok(Value::List(items))
            }
            "env" => {
                expect_args(name, &args, 1)?;
                let key = args[0].to_str();
                Ok(self.session.get_env(&key).map(Value::Str).unwrap_or(Value::None))
            }
            "exit" => {
                let code = match args.first() {
                    None => 0,
                    Some(v) => as_int(name, v)? as i32,
                };
                Err(EvalError::Exit(code))
            }
            "source" => {
                expect_args(name, &args, 1)?;
                let path = self.session.cwd().join(args[0].to_str());
                let text = fs::read_to_string(&path)?;
                tracing::debug!(path = %path.display(), "sourcing file");
                // sourced files define globals, even from inside an alias call
                let frames = std::mem::take(&mut self.frames);
                let result = self.eval_source(&text);
                self.frames = frames;
                result
            }
            "alias" => {
                expect_args(name, &args, 2)?;
                let alias_name = args[0].to_str();
                let alias = match &args[1] {
                    Value::Str(text) => Alias::from_text(text)?,
                    Value::List(words) => Alias::Template(words.iter().map(Value::to_str).collect()),
                    Value::Function(def) => Alias::Nested(NestedAlias::Function(def.clone())),
                    other => {
                        return Err(EvalError::Type(format!(
                            "cannot make an alias from '{}'",
                            other.type_name()
                        )))
                    }
                };
                tracing::debug!(alias = %alias_name, value = %alias.describe(), "alias set");
                self.session.aliases().set(&alias_name, alias);
                Ok(Value::None)
            }
            "unalias" => {
                expect_args(name, &args, 1)?;
                Ok(Value::Bool(self.session.aliases().remove(&args[0].to_str())))
            }
            other => Err(EvalError::Name(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;

    fn eval(src: &str) -> Value {
        Evaluator::capturing(Session::new(false)).eval(src).unwrap().value
    }

    #[test]
    fn test_conversions() {
        assert_eq!(eval("int('42')"), Value::Int(42));
        assert_eq!(eval("float(2)"), Value::Float(2.0));
        assert_eq!(eval("str(1.5)"), Value::from("1.5"));
        assert_eq!(eval("repr('a')"), Value::from("'a'"));
        assert_eq!(eval("type([])"), Value::from("list"));
    }

    #[test]
    fn test_range() {
        assert_eq!(
            eval("range(5, 0, -2)"),
            Value::List(vec![Value::Int(5), Value::Int(3), Value::Int(1)])
        );
        assert_eq!(eval("len(range(3))"), Value::Int(3));
    }

    #[test]
    fn test_bad_int_literal() {
        let err = Evaluator::capturing(Session::new(false)).eval("int('x')").unwrap_err();
        assert!(matches!(err, EvalError::Value(_)));
    }

    #[test]
    fn test_exit_unwinds() {
        let err = Evaluator::capturing(Session::new(false)).eval("exit(4)\nprint('no')").unwrap_err();
        assert!(matches!(err, EvalError::Exit(4)));
    }

    #[test]
    fn test_alias_builtin_registers_template() {
        let mut ev = Evaluator::capturing(Session::new(false));
        ev.eval("alias('greet', 'echo hello')").unwrap();
        assert!(matches!(
            ev.session().aliases().get("greet"),
            Some(Alias::Template(_))
        ));
        assert_eq!(ev.eval("unalias('greet')").unwrap().value, Value::Bool(true));
    }

    #[test]
    fn test_source_runs_file_in_current_scope() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lib.dsh"), "answer = 42\n").unwrap();
        let mut ev = Evaluator::capturing(Session::new(false));
        ev.session().set_cwd(dir.path().to_path_buf());
        ev.eval("source('lib.dsh')").unwrap();
        assert_eq!(ev.get_var("answer"), Some(Value::Int(42)));
    }
}
