//! Host expressions: operators, names, calls, attributes and methods.

use super::{EvalError, Evaluator, BUILTINS};
use crate::ast::{BinOp, Expr, LogicOp};
use crate::procs::CommandPipeline;
use crate::value::Value;
use std::cmp::Ordering;
use std::sync::Arc;

impl Evaluator {
    pub(crate) fn eval_expr(&mut self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Int(i) => Ok(Value::Int(*i)),
            Expr::Float(f) => Ok(Value::Float(*f)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::None => Ok(Value::None),
            Expr::Name(name) => self.lookup(name),
            Expr::EnvVar(name) => Ok(self.session.get_env(name).map(Value::Str).unwrap_or(Value::None)),
            Expr::List(items) => {
                let values = items
                    .iter()
                    .map(|item| self.eval_expr(item))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::List(values))
            }
            Expr::Neg(inner) => match self.eval_expr(inner)? {
                Value::Int(i) => Ok(Value::Int(-i)),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(EvalError::Type(format!(
                    "bad operand type for unary -: '{}'",
                    other.type_name()
                ))),
            },
            Expr::Not(inner) => Ok(Value::Bool(!self.eval_expr(inner)?.truthy())),
            Expr::Logic(op, lhs, rhs) => {
                let left = self.eval_expr(lhs)?;
                match (op, left.truthy()) {
                    (LogicOp::And, false) | (LogicOp::Or, true) => Ok(left),
                    _ => self.eval_expr(rhs),
                }
            }
            Expr::Binary(op, lhs, rhs) => {
                let left = self.eval_expr(lhs)?;
                let right = self.eval_expr(rhs)?;
                binary(*op, left, right)
            }
            Expr::Call(func, args) => self.eval_call(func, args),
            Expr::Index(base, index) => {
                let base = self.eval_expr(base)?;
                let index = self.eval_expr(index)?;
                subscript(base, &index)
            }
            Expr::Attr(base, name) => {
                let base = self.eval_expr(base)?;
                match base {
                    Value::Pipeline(p) => pipeline_attr(&p, name),
                    other => Err(EvalError::Type(format!(
                        "'{}' object has no attribute '{}'",
                        other.type_name(),
                        name
                    ))),
                }
            }
            Expr::Subproc(sp) => self.eval_subproc(sp),
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, EvalError> {
        if let Some(value) = self.get_var(name) {
            return Ok(value);
        }
        BUILTINS
            .iter()
            .find(|b| **b == name)
            .map(|b| Value::Builtin(*b))
            .ok_or_else(|| EvalError::Name(name.to_string()))
    }

    fn eval_call(&mut self, func: &Expr, args: &[Expr]) -> Result<Value, EvalError> {
        if let Expr::Attr(base, method) = func {
            let receiver = self.eval_expr(base)?;
            let args = self.eval_args(args)?;
            return call_method(receiver, method, args);
        }
        let callee = self.eval_expr(func)?;
        let args = self.eval_args(args)?;
        match callee {
            Value::Function(def) => self.call_function(&def, args),
            Value::Builtin(name) => self.call_builtin(name, args),
            other => Err(EvalError::Type(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn eval_args(&mut self, args: &[Expr]) -> Result<Vec<Value>, EvalError> {
        args.iter().map(|a| self.eval_expr(a)).collect()
    }
}

fn type_error(op: &str, left: &Value, right: &Value) -> EvalError {
    EvalError::Type(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op,
        left.type_name(),
        right.type_name()
    ))
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::Bool(b) => Some(*b as i64 as f64),
        _ => None,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::List(a), Value::List(b)) => {
            for (x, y) in a.iter().zip(b) {
                match compare(x, y)? {
                    Ordering::Equal => continue,
                    other => return Some(other),
                }
            }
            Some(a.len().cmp(&b.len()))
        }
        (a, b) => as_float(a)?.partial_cmp(&as_float(b)?),
    }
}

fn arith(op: BinOp, symbol: &str, left: Value, right: Value) -> Result<Value, EvalError> {
    if let (Value::Int(a), Value::Int(b)) = (&left, &right) {
        let (a, b) = (*a, *b);
        let zero = || EvalError::Value("division by zero".to_string());
        let result = match op {
            BinOp::Add => a.checked_add(b),
            BinOp::Sub => a.checked_sub(b),
            BinOp::Mul => a.checked_mul(b),
            BinOp::Div => {
                if b == 0 {
                    return Err(zero());
                }
                return Ok(Value::Float(a as f64 / b as f64));
            }
            BinOp::FloorDiv => {
                if b == 0 {
                    return Err(zero());
                }
                a.checked_div_euclid(b)
                    .map(|q| if b < 0 && a.rem_euclid(b) != 0 { q - 1 } else { q })
            }
            BinOp::Mod => {
                if b == 0 {
                    return Err(zero());
                }
                a.checked_rem(b)
                    .map(|r| if r != 0 && (r < 0) != (b < 0) { r + b } else { r })
            }
            _ => None,
        };
        return result
            .map(Value::Int)
            .ok_or_else(|| EvalError::Value("integer overflow".to_string()));
    }
    let (Some(a), Some(b)) = (as_float(&left), as_float(&right)) else {
        return Err(type_error(symbol, &left, &right));
    };
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div | BinOp::FloorDiv | BinOp::Mod if b == 0.0 => {
            return Err(EvalError::Value("float division by zero".to_string()))
        }
        BinOp::Div => a / b,
        BinOp::FloorDiv => (a / b).floor(),
        BinOp::Mod => a - b * (a / b).floor(),
        _ => return Err(type_error(symbol, &left, &right)),
    };
    Ok(Value::Float(result))
}

pub(crate) fn binary(op: BinOp, left: Value, right: Value) -> Result<Value, EvalError> {
    match op {
        BinOp::Eq => return Ok(Value::Bool(left == right)),
        BinOp::Ne => return Ok(Value::Bool(left != right)),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let symbol = match op {
                BinOp::Lt => "<",
                BinOp::Le => "<=",
                BinOp::Gt => ">",
                _ => ">=",
            };
            let ord = compare(&left, &right).ok_or_else(|| type_error(symbol, &left, &right))?;
            let result = match op {
                BinOp::Lt => ord == Ordering::Less,
                BinOp::Le => ord != Ordering::Greater,
                BinOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            };
            return Ok(Value::Bool(result));
        }
        BinOp::In => {
            return match &right {
                Value::Str(hay) => match &left {
                    Value::Str(needle) => Ok(Value::Bool(hay.contains(needle.as_str()))),
                    other => Err(EvalError::Type(format!(
                        "'in <string>' requires string as left operand, not {}",
                        other.type_name()
                    ))),
                },
                Value::List(items) => Ok(Value::Bool(items.contains(&left))),
                other => Err(EvalError::Type(format!(
                    "argument of type '{}' is not iterable",
                    other.type_name()
                ))),
            };
        }
        _ => {}
    }

    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
        (BinOp::Add, Value::List(mut a), Value::List(b)) => {
            a.extend(b);
            Ok(Value::List(a))
        }
        (BinOp::Mul, Value::Str(s), Value::Int(n)) | (BinOp::Mul, Value::Int(n), Value::Str(s)) => {
            Ok(Value::Str(s.repeat(n.max(0) as usize)))
        }
        (BinOp::Mul, Value::List(items), Value::Int(n)) => {
            let mut out = Vec::new();
            for _ in 0..n.max(0) {
                out.extend(items.iter().cloned());
            }
            Ok(Value::List(out))
        }
        (op, left, right) => {
            let symbol = match op {
                BinOp::Add => "+",
                BinOp::Sub => "-",
                BinOp::Mul => "*",
                BinOp::Div => "/",
                BinOp::FloorDiv => "//",
                _ => "%",
            };
            arith(op, symbol, left, right)
        }
    }
}

/// Position of `index` in a sequence of `len` items; negative counts from the end.
pub(crate) fn list_index(len: usize, index: &Value) -> Result<usize, EvalError> {
    let Value::Int(i) = index else {
        return Err(EvalError::Type(format!(
            "indices must be integers, not {}",
            index.type_name()
        )));
    };
    let resolved = if *i < 0 { len as i64 + i } else { *i };
    if resolved < 0 || resolved >= len as i64 {
        return Err(EvalError::Index("index out of range".to_string()));
    }
    Ok(resolved as usize)
}

fn subscript(base: Value, index: &Value) -> Result<Value, EvalError> {
    match base {
        Value::List(items) => {
            let i = list_index(items.len(), index)?;
            Ok(items[i].clone())
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let i = list_index(chars.len(), index)?;
            Ok(Value::Str(chars[i].to_string()))
        }
        other => Err(EvalError::Type(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn time_value(time: Option<chrono::DateTime<chrono::Local>>) -> Value {
    time.map(|t| Value::Str(t.to_rfc3339())).unwrap_or(Value::None)
}

/// Attribute access on a pipeline handle. Anything that needs the final
/// status waits for the pipeline first.
pub(crate) fn pipeline_attr(p: &Arc<CommandPipeline>, name: &str) -> Result<Value, EvalError> {
    let value = match name {
        "returncode" | "rtn" => Value::Int(p.returncode()? as i64),
        "output" | "out" => Value::Str(p.output()?),
        "errors" | "err" => Value::Str(p.errors()?),
        "lines" => Value::List(p.lines().map(Value::Str).collect()),
        "pid" => p.pid().map(|pid| Value::Int(pid as i64)).unwrap_or(Value::None),
        "pids" => Value::List(p.pids().into_iter().map(|pid| Value::Int(pid as i64)).collect()),
        "args" => Value::List(
            p.args()
                .iter()
                .map(|argv| Value::List(argv.iter().cloned().map(Value::Str).collect()))
                .collect(),
        ),
        "alias" => p.alias().map(Value::from).unwrap_or(Value::None),
        "signal" => {
            p.wait()?;
            match p.signal() {
                Some((name, core)) => Value::List(vec![Value::Str(name), Value::Bool(core)]),
                None => Value::None,
            }
        }
        "starttime" => Value::Str(p.starttime().to_rfc3339()),
        "endtime" => {
            p.wait()?;
            time_value(p.endtime())
        }
        "executed_cmd" => Value::Str(p.executed_cmd()),
        other => {
            return Err(EvalError::Type(format!(
                "'CommandPipeline' object has no attribute '{}'",
                other
            )))
        }
    };
    Ok(value)
}

fn expect_str<'a>(method: &str, value: &'a Value) -> Result<&'a str, EvalError> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(EvalError::Type(format!(
            "{}() argument must be str, not {}",
            method,
            other.type_name()
        ))),
    }
}

fn arity(method: &str, args: &[Value], range: std::ops::RangeInclusive<usize>) -> Result<(), EvalError> {
    if range.contains(&args.len()) {
        Ok(())
    } else {
        Err(EvalError::Type(format!(
            "{}() got {} arguments",
            method,
            args.len()
        )))
    }
}

fn strs(items: Vec<String>) -> Value {
    Value::List(items.into_iter().map(Value::Str).collect())
}

pub(crate) fn call_method(receiver: Value, method: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    match receiver {
        Value::Str(s) => str_method(&s, method, args),
        Value::List(items) => match method {
            "index" => {
                arity(method, &args, 1..=1)?;
                items
                    .iter()
                    .position(|v| *v == args[0])
                    .map(|i| Value::Int(i as i64))
                    .ok_or_else(|| EvalError::Value(format!("{} is not in list", args[0].repr())))
            }
            "count" => {
                arity(method, &args, 1..=1)?;
                Ok(Value::Int(items.iter().filter(|v| **v == args[0]).count() as i64))
            }
            _ => Err(EvalError::Type(format!("'list' object has no method '{}'", method))),
        },
        Value::Pipeline(p) => match method {
            "wait" => Ok(Value::Int(p.wait()? as i64)),
            "poll" => Ok(Value::Bool(p.poll())),
            "check" => {
                p.wait()?;
                p.check()?;
                Ok(Value::None)
            }
            "interrupt" => {
                p.interrupt();
                Ok(Value::None)
            }
            "terminate" => {
                p.terminate();
                Ok(Value::None)
            }
            _ => pipeline_attr(&p, method),
        },
        other => Err(EvalError::Type(format!(
            "'{}' object has no method '{}'",
            other.type_name(),
            method
        ))),
    }
}

fn str_method(s: &str, method: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    match method {
        "strip" => Ok(Value::from(s.trim())),
        "lstrip" => Ok(Value::from(s.trim_start())),
        "rstrip" => Ok(Value::from(s.trim_end())),
        "upper" => Ok(Value::Str(s.to_uppercase())),
        "lower" => Ok(Value::Str(s.to_lowercase())),
        "split" => {
            arity(method, &args, 0..=1)?;
            match args.first() {
                None | Some(Value::None) => Ok(strs(s.split_whitespace().map(String::from).collect())),
                Some(sep) => {
                    let sep = expect_str(method, sep)?;
                    if sep.is_empty() {
                        return Err(EvalError::Value("empty separator".to_string()));
                    }
                    Ok(strs(s.split(sep).map(String::from).collect()))
                }
            }
        }
        "splitlines" => Ok(strs(s.lines().map(String::from).collect())),
        "startswith" => {
            arity(method, &args, 1..=1)?;
            Ok(Value::Bool(s.starts_with(expect_str(method, &args[0])?)))
        }
        "endswith" => {
            arity(method, &args, 1..=1)?;
            Ok(Value::Bool(s.ends_with(expect_str(method, &args[0])?)))
        }
        "replace" => {
            arity(method, &args, 2..=2)?;
            let from = expect_str(method, &args[0])?;
            let to = expect_str(method, &args[1])?;
            Ok(Value::Str(s.replace(from, to)))
        }
        "join" => {
            arity(method, &args, 1..=1)?;
            let Value::List(items) = &args[0] else {
                return Err(EvalError::Type("join() expects a list".to_string()));
            };
            let parts: Vec<String> = items.iter().map(Value::to_str).collect();
            Ok(Value::Str(parts.join(s)))
        }
        "format" => {
            let mut out = String::new();
            let mut rest = s;
            let mut next = args.iter();
            while let Some(i) = rest.find("{}") {
                out.push_str(&rest[..i]);
                let arg = next
                    .next()
                    .ok_or_else(|| EvalError::Index("not enough arguments for format string".to_string()))?;
                out.push_str(&arg.to_str());
                rest = &rest[i + 2..];
            }
            out.push_str(rest);
            Ok(Value::Str(out))
        }
        _ => Err(EvalError::Type(format!("'str' object has no method '{}'", method))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(i: i64) -> Value {
        Value::Int(i)
    }

    #[test]
    fn test_integer_arithmetic() {
        assert_eq!(binary(BinOp::Add, int(2), int(3)).unwrap(), int(5));
        assert_eq!(binary(BinOp::FloorDiv, int(-7), int(2)).unwrap(), int(-4));
        assert_eq!(binary(BinOp::Mod, int(-7), int(3)).unwrap(), int(2));
        assert_eq!(binary(BinOp::Div, int(7), int(2)).unwrap(), Value::Float(3.5));
    }

    #[test]
    fn test_division_by_zero() {
        assert!(matches!(binary(BinOp::Div, int(1), int(0)), Err(EvalError::Value(_))));
        assert!(matches!(binary(BinOp::Mod, int(1), int(0)), Err(EvalError::Value(_))));
    }

    #[test]
    fn test_string_operators() {
        assert_eq!(
            binary(BinOp::Add, Value::from("ab"), Value::from("cd")).unwrap(),
            Value::from("abcd")
        );
        assert_eq!(binary(BinOp::Mul, Value::from("ab"), int(2)).unwrap(), Value::from("abab"));
        assert_eq!(
            binary(BinOp::In, Value::from("b"), Value::from("abc")).unwrap(),
            Value::Bool(true)
        );
        assert!(binary(BinOp::Sub, Value::from("a"), int(1)).is_err());
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(binary(BinOp::Lt, int(1), Value::Float(1.5)).unwrap(), Value::Bool(true));
        assert_eq!(
            binary(BinOp::Ge, Value::from("b"), Value::from("a")).unwrap(),
            Value::Bool(true)
        );
        assert!(binary(BinOp::Lt, Value::from("a"), int(1)).is_err());
    }

    #[test]
    fn test_negative_index() {
        assert_eq!(list_index(3, &int(-1)).unwrap(), 2);
        assert!(matches!(list_index(3, &int(3)), Err(EvalError::Index(_))));
    }

    #[test]
    fn test_str_methods() {
        let split = str_method("a b  c", "split", vec![]).unwrap();
        assert_eq!(split, strs(vec!["a".into(), "b".into(), "c".into()]));
        assert_eq!(
            str_method(",", "join", vec![strs(vec!["x".into(), "y".into()])]).unwrap(),
            Value::from("x,y")
        );
        assert_eq!(
            str_method("{}-{}", "format", vec![int(1), Value::from("z")]).unwrap(),
            Value::from("1-z")
        );
    }
}
