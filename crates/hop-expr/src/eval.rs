use std::collections::BTreeMap;

use crate::parser::{Ast, BinOp};
use crate::value::Value;

/// Read-only name lookup for evaluation.
pub trait Scope {
    fn lookup(&self, name: &str) -> Option<Value>;
}

impl Scope for BTreeMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

impl Scope for std::collections::HashMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

pub fn eval(ast: &Ast, scope: &dyn Scope) -> Value {
    match ast {
        Ast::Literal(v) => v.clone(),
        Ast::Ident(name) => scope.lookup(name).unwrap_or(Value::Undefined),
        Ast::Member(base, name) => match eval(base, scope) {
            Value::Map(map) => map.get(name).cloned().unwrap_or(Value::Undefined),
            _ => Value::Undefined,
        },
        Ast::Not(inner) => Value::Bool(!eval(inner, scope).truthy()),
        Ast::Binary(op, lhs, rhs) => match op {
            BinOp::And => {
                let l = eval(lhs, scope);
                if !l.truthy() {
                    Value::Bool(false)
                } else {
                    Value::Bool(eval(rhs, scope).truthy())
                }
            }
            BinOp::Or => {
                let l = eval(lhs, scope);
                if l.truthy() {
                    Value::Bool(true)
                } else {
                    Value::Bool(eval(rhs, scope).truthy())
                }
            }
            BinOp::Eq => Value::Bool(eval(lhs, scope).loose_eq(&eval(rhs, scope))),
            BinOp::Ne => {
                let l = eval(lhs, scope);
                let r = eval(rhs, scope);
                if l.is_undefined() || r.is_undefined() {
                    Value::Bool(false)
                } else {
                    Value::Bool(!l.loose_eq(&r))
                }
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let l = eval(lhs, scope);
                let r = eval(rhs, scope);
                compare(*op, &l, &r)
            }
        },
        Ast::Call(name, args) => {
            let vals: Vec<Value> = args.iter().map(|a| eval(a, scope)).collect();
            call(name, &vals)
        }
    }
}

fn compare(op: BinOp, l: &Value, r: &Value) -> Value {
    let ordering = match (l, r) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Str(a), Value::Number(b)) => {
            a.parse::<f64>().ok().and_then(|a| a.partial_cmp(b))
        }
        (Value::Number(a), Value::Str(b)) => {
            b.parse::<f64>().ok().and_then(|b| a.partial_cmp(&b))
        }
        _ => None,
    };
    let Some(ord) = ordering else {
        return Value::Bool(false);
    };
    let result = match op {
        BinOp::Lt => ord.is_lt(),
        BinOp::Le => ord.is_le(),
        BinOp::Gt => ord.is_gt(),
        BinOp::Ge => ord.is_ge(),
        _ => false,
    };
    Value::Bool(result)
}

fn call(name: &str, args: &[Value]) -> Value {
    match name {
        "includes" => match (args.first(), args.get(1)) {
            (Some(Value::Str(haystack)), Some(Value::Str(needle))) => {
                Value::Bool(haystack.contains(needle.as_str()))
            }
            (Some(Value::List(items)), Some(needle)) => {
                Value::Bool(items.iter().any(|i| i.loose_eq(needle)))
            }
            _ => Value::Bool(false),
        },
        "startsWith" => match (args.first(), args.get(1)) {
            (Some(Value::Str(s)), Some(Value::Str(prefix))) => {
                Value::Bool(s.starts_with(prefix.as_str()))
            }
            _ => Value::Bool(false),
        },
        "trim" => match args.first() {
            Some(Value::Str(s)) => Value::Str(s.trim().to_string()),
            Some(other) => other.clone(),
            None => Value::Undefined,
        },
        "length" => match args.first() {
            Some(Value::Str(s)) => Value::Number(s.chars().count() as f64),
            Some(Value::List(items)) => Value::Number(items.len() as f64),
            Some(Value::Map(map)) => Value::Number(map.len() as f64),
            _ => Value::Undefined,
        },
        "default" => match args.first() {
            Some(v) if !matches!(v, Value::Undefined | Value::Null) => v.clone(),
            _ => args.get(1).cloned().unwrap_or(Value::Undefined),
        },
        _ => Value::Undefined,
    }
}
