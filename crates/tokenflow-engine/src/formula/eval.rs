use super::parser::{BinaryOp, Expr, UnaryOp};
use super::{EvalContext, EvalHooks};
use crate::{Error, Result};
use serde_json::Value;

pub struct Evaluator<'a, 'b> {
    formula: &'a str,
    ctx: &'a EvalContext<'a>,
    hooks: &'b mut dyn EvalHooks,
}

impl<'a, 'b> Evaluator<'a, 'b> {
    pub fn new(formula: &'a str, ctx: &'a EvalContext<'a>, hooks: &'b mut dyn EvalHooks) -> Self {
        Self {
            formula,
            ctx,
            hooks,
        }
    }

    fn err(&self, message: impl Into<String>) -> Error {
        Error::FormulaEval {
            formula: self.formula.to_string(),
            message: message.into(),
        }
    }

    pub fn eval(&mut self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Number(n) => num_value(*n).ok_or_else(|| self.err("non-finite literal")),
            Expr::Str(s) => Ok(Value::String(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Null => Ok(Value::Null),
            Expr::Ident(name) => self.resolve(name),
            Expr::Member(base, name) => {
                let base = self.eval(base)?;
                Ok(member(&base, name))
            }
            Expr::Index(base, index) => {
                let base = self.eval(base)?;
                let index = self.eval(index)?;
                Ok(indexed(&base, &index))
            }
            Expr::Call(path, args) => self.call(path, args),
            Expr::Unary(op, operand) => {
                let v = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!is_truthy(&v))),
                    UnaryOp::Neg => {
                        let n = self.number(&v)?;
                        num_value(-n).ok_or_else(|| self.err("non-finite result"))
                    }
                }
            }
            Expr::Binary(op, lhs, rhs) => self.binary(*op, lhs, rhs),
            Expr::Ternary(cond, then, otherwise) => {
                let cond = self.eval(cond)?;
                if is_truthy(&cond) {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
        }
    }

    /// Bare identifiers resolve inputs, then variables, then state. The
    /// context roots themselves are addressable for explicit paths.
    fn resolve(&self, name: &str) -> Result<Value> {
        match name {
            "inputs" => return Ok(map_to_value(self.ctx.inputs)),
            "variables" => return Ok(map_to_value(self.ctx.variables)),
            "state" => return Ok(map_to_value(self.ctx.state)),
            "message" => return Ok(self.ctx.message.cloned().unwrap_or(Value::Null)),
            "buffers" => return Ok(self.ctx.buffers.cloned().unwrap_or(Value::Null)),
            _ => {}
        }
        if let Some(v) = self.ctx.inputs.get(name) {
            return Ok(v.clone());
        }
        if let Some(v) = self.ctx.variables.get(name) {
            return Ok(v.clone());
        }
        if let Some(v) = self.ctx.state.get(name) {
            return Ok(v.clone());
        }
        Err(self.err(format!("unknown identifier `{}`", name)))
    }

    fn call(&mut self, path: &[String], args: &[Expr]) -> Result<Value> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg)?);
        }

        let path_refs: Vec<&str> = path.iter().map(|s| s.as_str()).collect();
        match path_refs.as_slice() {
            ["now"] => {
                self.arity(&values, 0, "now")?;
                Ok(Value::from(self.ctx.now))
            }
            ["random"] => {
                self.arity(&values, 0, "random")?;
                let draw = self
                    .hooks
                    .random()
                    .ok_or_else(|| self.err("random() is not available in this context"))?;
                num_value(draw).ok_or_else(|| self.err("non-finite result"))
            }
            ["uuid"] => {
                self.arity(&values, 0, "uuid")?;
                let id = self
                    .hooks
                    .uuid()
                    .ok_or_else(|| self.err("uuid() is not available in this context"))?;
                Ok(Value::String(id))
            }
            ["Math", name] => self.math(name, &values),
            _ => Err(self.err(format!("unknown function `{}`", path.join(".")))),
        }
    }

    fn math(&self, name: &str, args: &[Value]) -> Result<Value> {
        let unary = |this: &Self, f: fn(f64) -> f64| -> Result<Value> {
            this.arity(args, 1, name)?;
            let n = this.number(&args[0])?;
            num_value(f(n)).ok_or_else(|| this.err("non-finite result"))
        };
        match name {
            "abs" => unary(self, f64::abs),
            "floor" => unary(self, f64::floor),
            "ceil" => unary(self, f64::ceil),
            "round" => unary(self, f64::round),
            "sqrt" => unary(self, f64::sqrt),
            "pow" => {
                self.arity(args, 2, name)?;
                let base = self.number(&args[0])?;
                let exp = self.number(&args[1])?;
                num_value(base.powf(exp)).ok_or_else(|| self.err("non-finite result"))
            }
            "min" | "max" => {
                if args.is_empty() {
                    return Err(self.err(format!("Math.{} needs at least one argument", name)));
                }
                let mut best = self.number(&args[0])?;
                for arg in &args[1..] {
                    let n = self.number(arg)?;
                    best = if name == "min" { best.min(n) } else { best.max(n) };
                }
                num_value(best).ok_or_else(|| self.err("non-finite result"))
            }
            _ => Err(self.err(format!("unknown function `Math.{}`", name))),
        }
    }

    fn binary(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<Value> {
        // Short-circuit before evaluating the right side.
        match op {
            BinaryOp::And => {
                let l = self.eval(lhs)?;
                if !is_truthy(&l) {
                    return Ok(Value::Bool(false));
                }
                let r = self.eval(rhs)?;
                return Ok(Value::Bool(is_truthy(&r)));
            }
            BinaryOp::Or => {
                let l = self.eval(lhs)?;
                if is_truthy(&l) {
                    return Ok(Value::Bool(true));
                }
                let r = self.eval(rhs)?;
                return Ok(Value::Bool(is_truthy(&r)));
            }
            _ => {}
        }

        let l = self.eval(lhs)?;
        let r = self.eval(rhs)?;

        match op {
            BinaryOp::Add => {
                if l.is_string() || r.is_string() {
                    return Ok(Value::String(format!(
                        "{}{}",
                        tokenflow_types::format_value(&l),
                        tokenflow_types::format_value(&r)
                    )));
                }
                self.arith(&l, &r, |a, b| a + b)
            }
            BinaryOp::Sub => self.arith(&l, &r, |a, b| a - b),
            BinaryOp::Mul => self.arith(&l, &r, |a, b| a * b),
            BinaryOp::Div => self.arith(&l, &r, |a, b| a / b),
            BinaryOp::Rem => self.arith(&l, &r, |a, b| a % b),
            BinaryOp::Eq => Ok(Value::Bool(l == r)),
            BinaryOp::Ne => Ok(Value::Bool(l != r)),
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let ordering = self.compare(&l, &r)?;
                let holds = match op {
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::Le => ordering.is_le(),
                    BinaryOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                };
                Ok(Value::Bool(holds))
            }
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        }
    }

    fn arith(&self, l: &Value, r: &Value, f: fn(f64, f64) -> f64) -> Result<Value> {
        let a = self.number(l)?;
        let b = self.number(r)?;
        num_value(f(a, b)).ok_or_else(|| self.err("non-finite result"))
    }

    fn compare(&self, l: &Value, r: &Value) -> Result<std::cmp::Ordering> {
        match (l, r) {
            (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
            _ => {
                let a = self.number(l)?;
                let b = self.number(r)?;
                a.partial_cmp(&b)
                    .ok_or_else(|| self.err("values are not comparable"))
            }
        }
    }

    fn number(&self, value: &Value) -> Result<f64> {
        match value {
            Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| self.err("number out of f64 range")),
            other => Err(self.err(format!(
                "expected a number, found {}",
                tokenflow_types::truncate_string(&other.to_string(), 40)
            ))),
        }
    }

    fn arity(&self, args: &[Value], expected: usize, name: &str) -> Result<()> {
        if args.len() != expected {
            return Err(self.err(format!(
                "{}() takes {} argument(s), got {}",
                name,
                expected,
                args.len()
            )));
        }
        Ok(())
    }
}

/// JS-flavoured truthiness, used by guards and action conditions.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn num_value(n: f64) -> Option<Value> {
    serde_json::Number::from_f64(n).map(Value::Number)
}

fn member(base: &Value, name: &str) -> Value {
    match base {
        Value::Object(map) => map.get(name).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn indexed(base: &Value, index: &Value) -> Value {
    match (base, index) {
        (Value::Array(items), Value::Number(n)) => n
            .as_u64()
            .and_then(|i| items.get(i as usize))
            .cloned()
            .unwrap_or(Value::Null),
        (Value::Object(map), Value::String(key)) => {
            map.get(key).cloned().unwrap_or(Value::Null)
        }
        _ => Value::Null,
    }
}

fn map_to_value(map: &std::collections::BTreeMap<String, Value>) -> Value {
    Value::Object(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}
