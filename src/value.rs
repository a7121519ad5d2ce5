//! Runtime values of the host language.

use crate::ast::FunctionDef;
use crate::procs::CommandPipeline;
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    /// Handle returned by `!(...)`
    Pipeline(Arc<CommandPipeline>),
    Function(Arc<FunctionDef>),
    Builtin(&'static str),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Pipeline(_) => "CommandPipeline",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin_function",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Truthiness; a pipeline is true when it exited with status 0.
    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Pipeline(p) => p.succeeded(),
            Value::Function(_) | Value::Builtin(_) => true,
        }
    }

    /// Exit status for a value returned by an alias or function.
    ///
    /// Integers are the status itself, falsy values succeed and anything
    /// else truthy maps to 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            Value::Int(i) => *i as i32,
            Value::Bool(true) => 1,
            v if !v.truthy() => 0,
            _ => 1,
        }
    }

    /// Arguments produced when the value is spliced into a command.
    pub fn splice_args(&self) -> Vec<String> {
        match self {
            Value::None => Vec::new(),
            Value::List(items) => items.iter().map(Value::to_str).collect(),
            other => vec![other.to_str()],
        }
    }

    /// `str()` conversion
    pub fn to_str(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Pipeline(p) => p.output().unwrap_or_default(),
            other => other.repr(),
        }
    }

    /// `repr()` conversion
    pub fn repr(&self) -> String {
        match self {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'").replace('\n', "\\n")),
            Value::List(items) => {
                let inner: Vec<String> = items.iter().map(Value::repr).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Pipeline(p) => format!("CommandPipeline(args={:?})", p.args()),
            Value::Function(f) => format!("<function {}>", f.name),
            Value::Builtin(name) => format!("<built-in function {}>", name),
        }
    }
}

fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        f.to_string()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => *a as f64 == *b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Pipeline(a), Value::Pipeline(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_str())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(Value::None.exit_code(), 0);
        assert_eq!(Value::Int(0).exit_code(), 0);
        assert_eq!(Value::Int(3).exit_code(), 3);
        assert_eq!(Value::Str(String::new()).exit_code(), 0);
        assert_eq!(Value::Str("oops".into()).exit_code(), 1);
        assert_eq!(Value::Bool(false).exit_code(), 0);
        assert_eq!(Value::List(vec![Value::Int(1)]).exit_code(), 1);
    }

    #[test]
    fn test_splice_args() {
        let list = Value::List(vec![Value::from("a"), Value::Int(2)]);
        assert_eq!(list.splice_args(), vec!["a", "2"]);
        assert!(Value::None.splice_args().is_empty());
        assert_eq!(Value::from("x y").splice_args(), vec!["x y"]);
    }

    #[test]
    fn test_repr() {
        assert_eq!(Value::Float(2.0).repr(), "2.0");
        assert_eq!(
            Value::List(vec![Value::from("a"), Value::None]).repr(),
            "['a', None]"
        );
    }
}
