//! The result-expression DSL: a small deferred AST evaluated against a
//! finished trial's `{config, return, metrics}` context, used by
//! `ParallelSearchRunner::target` and `ParallelSearchRunner::stop_condition`
//! to pick which field of a run's outcome the algorithm optimizes against
//! and when the search should stop early.

use crate::error::ExprError;
use crate::template::ConfigValue;
use std::collections::BTreeMap;

/// Which root of the trial context an expression reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Root {
    Config,
    Return,
    Metrics,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Neg,
    Not,
    Abs,
    Len,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    Is,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Const(ConfigValue),
    Root(Root),
    Attr(Box<Expr>, String),
    Index(Box<Expr>, usize),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

impl Expr {
    pub fn config() -> Expr {
        Expr::Root(Root::Config)
    }
    pub fn ret() -> Expr {
        Expr::Root(Root::Return)
    }
    pub fn metrics() -> Expr {
        Expr::Root(Root::Metrics)
    }
    pub fn attr(self, name: impl Into<String>) -> Expr {
        Expr::Attr(Box::new(self), name.into())
    }
    pub fn index(self, i: usize) -> Expr {
        Expr::Index(Box::new(self), i)
    }
    pub fn neg(self) -> Expr {
        Expr::Unary(UnaryOp::Neg, Box::new(self))
    }

    pub fn add(self, rhs: Expr) -> Expr {
        Expr::Binary(BinOp::Add, Box::new(self), Box::new(rhs))
    }
    pub fn lt(self, rhs: Expr) -> Expr {
        Expr::Binary(BinOp::Lt, Box::new(self), Box::new(rhs))
    }
    pub fn gt(self, rhs: Expr) -> Expr {
        Expr::Binary(BinOp::Gt, Box::new(self), Box::new(rhs))
    }
}

/// The `{config, return, metrics}` context a trial's expressions are
/// evaluated against.
pub struct EvalContext<'a> {
    pub config: &'a ConfigValue,
    pub ret: &'a ConfigValue,
    pub metrics: &'a ConfigValue,
}

impl Expr {
    pub fn eval(&self, ctx: &EvalContext<'_>) -> Result<ConfigValue, ExprError> {
        match self {
            Expr::Const(v) => Ok(v.clone()),
            Expr::Root(Root::Config) => Ok(ctx.config.clone()),
            Expr::Root(Root::Return) => Ok(ctx.ret.clone()),
            Expr::Root(Root::Metrics) => Ok(ctx.metrics.clone()),
            Expr::Attr(base, name) => {
                let v = base.eval(ctx)?;
                v.get(name).cloned().ok_or_else(|| ExprError::UnknownField(name.clone()))
            }
            Expr::Index(base, i) => {
                let v = base.eval(ctx)?;
                let ConfigValue::List(items) = &v else {
                    return Err(ExprError::TypeMismatch { expected: "list", actual: type_name(&v) });
                };
                items.get(*i).cloned().ok_or_else(|| ExprError::IndexOutOfRange(*i, items.len()))
            }
            Expr::Unary(op, inner) => eval_unary(*op, inner.eval(ctx)?),
            Expr::Binary(BinOp::And, lhs, rhs) => {
                let l = truthy(&lhs.eval(ctx)?)?;
                if !l {
                    return Ok(ConfigValue::Bool(false));
                }
                Ok(ConfigValue::Bool(truthy(&rhs.eval(ctx)?)?))
            }
            Expr::Binary(BinOp::Or, lhs, rhs) => {
                let l = truthy(&lhs.eval(ctx)?)?;
                if l {
                    return Ok(ConfigValue::Bool(true));
                }
                Ok(ConfigValue::Bool(truthy(&rhs.eval(ctx)?)?))
            }
            Expr::Binary(op, lhs, rhs) => eval_binary(*op, lhs.eval(ctx)?, rhs.eval(ctx)?),
            Expr::Call(name, args) => {
                let vals: Result<Vec<_>, _> = args.iter().map(|a| a.eval(ctx)).collect();
                eval_call(name, vals?)
            }
        }
    }
}

fn type_name(v: &ConfigValue) -> &'static str {
    match v {
        ConfigValue::Null => "null",
        ConfigValue::Bool(_) => "bool",
        ConfigValue::Int(_) => "int",
        ConfigValue::Float(_) => "float",
        ConfigValue::Str(_) => "str",
        ConfigValue::List(_) => "list",
        ConfigValue::Map(_) => "map",
    }
}

fn truthy(v: &ConfigValue) -> Result<bool, ExprError> {
    Ok(match v {
        ConfigValue::Bool(b) => *b,
        ConfigValue::Null => false,
        ConfigValue::Int(i) => *i != 0,
        ConfigValue::Float(f) => *f != 0.0,
        ConfigValue::Str(s) => !s.is_empty(),
        ConfigValue::List(l) => !l.is_empty(),
        ConfigValue::Map(m) => !m.is_empty(),
    })
}

fn eval_unary(op: UnaryOp, v: ConfigValue) -> Result<ConfigValue, ExprError> {
    match op {
        UnaryOp::Not => Ok(ConfigValue::Bool(!truthy(&v)?)),
        UnaryOp::Neg => match v {
            ConfigValue::Int(i) => Ok(ConfigValue::Int(-i)),
            ConfigValue::Float(f) => Ok(ConfigValue::Float(-f)),
            other => Err(ExprError::TypeMismatch { expected: "number", actual: type_name(&other) }),
        },
        UnaryOp::Abs => match v {
            ConfigValue::Int(i) => Ok(ConfigValue::Int(i.abs())),
            ConfigValue::Float(f) => Ok(ConfigValue::Float(f.abs())),
            other => Err(ExprError::TypeMismatch { expected: "number", actual: type_name(&other) }),
        },
        UnaryOp::Len => match v {
            ConfigValue::List(l) => Ok(ConfigValue::Int(l.len() as i64)),
            ConfigValue::Map(m) => Ok(ConfigValue::Int(m.len() as i64)),
            ConfigValue::Str(s) => Ok(ConfigValue::Int(s.chars().count() as i64)),
            other => Err(ExprError::TypeMismatch { expected: "sized", actual: type_name(&other) }),
        },
    }
}

fn eval_binary(op: BinOp, l: ConfigValue, r: ConfigValue) -> Result<ConfigValue, ExprError> {
    if op == BinOp::Eq {
        return Ok(ConfigValue::Bool(l == r));
    }
    if op == BinOp::Ne {
        return Ok(ConfigValue::Bool(l != r));
    }
    if op == BinOp::Is {
        return Ok(ConfigValue::Bool(type_name(&l) == type_name(&r) && l == r));
    }
    let (Some(lf), Some(rf)) = (l.as_f64(), r.as_f64()) else {
        return Err(ExprError::TypeMismatch { expected: "number", actual: type_name(&l) });
    };
    Ok(match op {
        BinOp::Add => ConfigValue::Float(lf + rf),
        BinOp::Sub => ConfigValue::Float(lf - rf),
        BinOp::Mul => ConfigValue::Float(lf * rf),
        BinOp::Div => {
            if rf == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            ConfigValue::Float(lf / rf)
        }
        BinOp::Lt => ConfigValue::Bool(lf < rf),
        BinOp::Le => ConfigValue::Bool(lf <= rf),
        BinOp::Gt => ConfigValue::Bool(lf > rf),
        BinOp::Ge => ConfigValue::Bool(lf >= rf),
        BinOp::Eq | BinOp::Ne | BinOp::And | BinOp::Or | BinOp::Is => unreachable!(),
    })
}

fn eval_call(name: &str, args: Vec<ConfigValue>) -> Result<ConfigValue, ExprError> {
    let numbers = |v: &ConfigValue| -> Result<Vec<f64>, ExprError> {
        let ConfigValue::List(items) = v else {
            return Err(ExprError::TypeMismatch { expected: "list", actual: type_name(v) });
        };
        items
            .iter()
            .map(|x| x.as_f64().ok_or(ExprError::TypeMismatch { expected: "number", actual: type_name(x) }))
            .collect()
    };

    match name {
        "sum" => {
            let xs = numbers(&args[0])?;
            Ok(ConfigValue::Float(xs.iter().sum()))
        }
        "mean" => {
            let xs = numbers(&args[0])?;
            if xs.is_empty() {
                return Err(ExprError::DivisionByZero);
            }
            Ok(ConfigValue::Float(xs.iter().sum::<f64>() / xs.len() as f64))
        }
        "stdev" => {
            let xs = numbers(&args[0])?;
            if xs.len() < 2 {
                return Err(ExprError::DivisionByZero);
            }
            let mean = xs.iter().sum::<f64>() / xs.len() as f64;
            let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (xs.len() - 1) as f64;
            Ok(ConfigValue::Float(var.sqrt()))
        }
        "isinstance_" => {
            let kind = match &args[1] {
                ConfigValue::Str(s) => s.as_str(),
                other => return Err(ExprError::TypeMismatch { expected: "str", actual: type_name(other) }),
            };
            Ok(ConfigValue::Bool(type_name(&args[0]) == kind))
        }
        other => Err(ExprError::UnknownCall(other.to_string())),
    }
}

/// Convenience for tests and call sites that build a context from plain maps.
pub fn map_of(entries: Vec<(&str, ConfigValue)>) -> ConfigValue {
    let mut m = BTreeMap::new();
    for (k, v) in entries {
        m.insert(k.to_string(), v);
    }
    ConfigValue::Map(m)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_and_comparison_chain() {
        let cfg = map_of(vec![("lr", ConfigValue::Float(0.1))]);
        let ret = ConfigValue::Float(0.95);
        let metrics = map_of(vec![]);
        let ctx = EvalContext { config: &cfg, ret: &ret, metrics: &metrics };

        let expr = Expr::ret().gt(Expr::Const(ConfigValue::Float(0.9)));
        assert_eq!(expr.eval(&ctx).unwrap(), ConfigValue::Bool(true));

        let expr = Expr::config().attr("lr");
        assert_eq!(expr.eval(&ctx).unwrap(), ConfigValue::Float(0.1));
    }

    #[test]
    fn unknown_field_is_an_error() {
        let cfg = map_of(vec![]);
        let ret = ConfigValue::Null;
        let metrics = ConfigValue::Null;
        let ctx = EvalContext { config: &cfg, ret: &ret, metrics: &metrics };
        let expr = Expr::config().attr("missing");
        assert!(matches!(expr.eval(&ctx), Err(ExprError::UnknownField(_))));
    }

    #[test]
    fn aggregate_calls() {
        let cfg = ConfigValue::Null;
        let ret = ConfigValue::List(vec![ConfigValue::Int(1), ConfigValue::Int(2), ConfigValue::Int(3)]);
        let metrics = ConfigValue::Null;
        let ctx = EvalContext { config: &cfg, ret: &ret, metrics: &metrics };
        let expr = Expr::Call("mean".to_string(), vec![Expr::ret()]);
        assert_eq!(expr.eval(&ctx).unwrap(), ConfigValue::Float(2.0));
    }
}
