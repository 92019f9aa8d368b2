//! Pure expression evaluation over a read-only context.
//!
//! Formulas are parsed into a small expression tree and walked directly.
//! There is no host-language escape hatch: the callable surface is the
//! closed intrinsic set (`now`, `random`, `uuid`, `Math.*`), assignment is
//! a lex error, and every lookup goes through the context. `random` and
//! `uuid` are supplied by the caller so the kernel can keep them on its
//! seeded stream.

mod eval;
mod lexer;
mod parser;

pub use eval::is_truthy;
pub use parser::Expr;

use crate::Result;
use serde_json::Value;
use std::collections::BTreeMap;

/// Read-only view a formula evaluates against.
pub struct EvalContext<'a> {
    pub inputs: &'a BTreeMap<String, Value>,
    pub variables: &'a BTreeMap<String, Value>,
    pub state: &'a BTreeMap<String, Value>,
    /// The message under consideration, for transition guards.
    pub message: Option<&'a Value>,
    /// Buffer occupancy object (`{input_name: len}`), for guards.
    pub buffers: Option<&'a Value>,
    /// Current simulation tick, exposed as `now()`.
    pub now: u64,
}

/// Shared empty map for contexts that leave a root unpopulated.
pub static EMPTY_MAP: once_cell::sync::Lazy<BTreeMap<String, Value>> =
    once_cell::sync::Lazy::new(BTreeMap::new);

impl<'a> EvalContext<'a> {
    pub fn empty(now: u64) -> Self {
        Self {
            inputs: &EMPTY_MAP,
            variables: &EMPTY_MAP,
            state: &EMPTY_MAP,
            message: None,
            buffers: None,
            now,
        }
    }

    pub fn with_inputs(inputs: &'a BTreeMap<String, Value>, now: u64) -> Self {
        Self {
            inputs,
            ..Self::empty(now)
        }
    }
}

/// Host services a formula may consult. `None` means the capability is not
/// available where the formula runs, which surfaces as an evaluation error.
pub trait EvalHooks {
    fn random(&mut self) -> Option<f64>;
    fn uuid(&mut self) -> Option<String>;
}

/// Hooks for contexts with no randomness, e.g. pure guard evaluation in
/// tests.
pub struct NoHooks;

impl EvalHooks for NoHooks {
    fn random(&mut self) -> Option<f64> {
        None
    }

    fn uuid(&mut self) -> Option<String> {
        None
    }
}

pub fn parse(formula: &str) -> Result<Expr> {
    let tokens = lexer::lex(formula)?;
    parser::Parser::new(formula, tokens).parse()
}

/// Parse and evaluate `formula` in one step.
pub fn evaluate(formula: &str, ctx: &EvalContext, hooks: &mut dyn EvalHooks) -> Result<Value> {
    let expr = parse(formula)?;
    eval::Evaluator::new(formula, ctx, hooks).eval(&expr)
}

/// Evaluate a formula used as a predicate (guards, action conditions).
pub fn evaluate_bool(formula: &str, ctx: &EvalContext, hooks: &mut dyn EvalHooks) -> Result<bool> {
    Ok(is_truthy(&evaluate(formula, ctx, hooks)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_arithmetic_over_inputs() {
        let inputs = inputs(&[("temp", json!(25.8)), ("hum", json!(59.45))]);
        let ctx = EvalContext::with_inputs(&inputs, 300);
        let result = evaluate("0.7 * temp + 0.3 * hum", &ctx, &mut NoHooks).unwrap();
        let expected = 0.7 * 25.8 + 0.3 * 59.45;
        assert!((result.as_f64().unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_string_concat() {
        let inputs = inputs(&[("level", json!("high")), ("count", json!(3))]);
        let ctx = EvalContext::with_inputs(&inputs, 0);
        let result = evaluate("'risk:' + level + '/' + count", &ctx, &mut NoHooks).unwrap();
        assert_eq!(result, json!("risk:high/3"));
    }

    #[test]
    fn test_comparisons_and_logic() {
        let inputs = inputs(&[("t", json!(30.0)), ("h", json!(80.0))]);
        let ctx = EvalContext::with_inputs(&inputs, 0);
        assert_eq!(
            evaluate("t > 28 && h >= 80", &ctx, &mut NoHooks).unwrap(),
            json!(true)
        );
        assert_eq!(
            evaluate("t > 28 ? 'hot' : 'ok'", &ctx, &mut NoHooks).unwrap(),
            json!("hot")
        );
    }

    #[test]
    fn test_math_intrinsics() {
        let ctx = EvalContext::empty(0);
        assert_eq!(
            evaluate("Math.max(1, 2, 3)", &ctx, &mut NoHooks).unwrap(),
            json!(3.0)
        );
        assert_eq!(
            evaluate("Math.round(2.6)", &ctx, &mut NoHooks).unwrap(),
            json!(3.0)
        );
        assert_eq!(
            evaluate("Math.pow(2, 10)", &ctx, &mut NoHooks).unwrap(),
            json!(1024.0)
        );
    }

    #[test]
    fn test_now_reads_the_tick() {
        let ctx = EvalContext::empty(450);
        assert_eq!(evaluate("now()", &ctx, &mut NoHooks).unwrap(), json!(450));
    }

    #[test]
    fn test_dotted_paths() {
        let inputs = inputs(&[("reading", json!({"value": 25.5, "meta": {"unit": "C"}}))]);
        let ctx = EvalContext::with_inputs(&inputs, 0);
        assert_eq!(
            evaluate("reading.meta.unit", &ctx, &mut NoHooks).unwrap(),
            json!("C")
        );
        assert_eq!(
            evaluate("reading['value']", &ctx, &mut NoHooks).unwrap(),
            json!(25.5)
        );
        assert_eq!(
            evaluate("reading.missing", &ctx, &mut NoHooks).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_unknown_identifier_is_an_error() {
        let ctx = EvalContext::empty(0);
        assert!(evaluate("no_such_thing + 1", &ctx, &mut NoHooks).is_err());
    }

    #[test]
    fn test_division_by_zero_is_an_error() {
        let ctx = EvalContext::empty(0);
        assert!(evaluate("1 / 0", &ctx, &mut NoHooks).is_err());
    }

    #[test]
    fn test_random_requires_hooks() {
        let ctx = EvalContext::empty(0);
        assert!(evaluate("random()", &ctx, &mut NoHooks).is_err());

        struct Fixed;
        impl EvalHooks for Fixed {
            fn random(&mut self) -> Option<f64> {
                Some(0.5)
            }
            fn uuid(&mut self) -> Option<String> {
                Some("fixed".to_string())
            }
        }
        assert_eq!(
            evaluate("random()", &ctx, &mut Fixed).unwrap(),
            json!(0.5)
        );
        assert_eq!(evaluate("uuid()", &ctx, &mut Fixed).unwrap(), json!("fixed"));
    }

    #[test]
    fn test_side_effects_unrepresentable() {
        let ctx = EvalContext::empty(0);
        assert!(evaluate("x = 5", &ctx, &mut NoHooks).is_err());
        assert!(evaluate("inputs.push(1)", &ctx, &mut NoHooks).is_err());
        assert!(evaluate("process.exit()", &ctx, &mut NoHooks).is_err());
    }
}
