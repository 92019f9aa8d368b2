use super::{ExternalCall, FsmEffect, FsmMessage, FsmRuntime, RawEvent};
use crate::formula::{self, EvalContext, EvalHooks};
use crate::template::substitute;
use serde_json::Value;
use tokenflow_types::{ActionOutput, VariableOp, VariableScope};

/// Execute one action output against the runtime.
///
/// Variable outputs mutate the runtime directly; everything else becomes an
/// [`FsmEffect`] the kernel applies (routing, feedback admission, logging,
/// external dispatch). Errors come back as strings for the caller's
/// `on_error` policy.
pub(super) fn run_output(
    output: &ActionOutput,
    rt: &mut FsmRuntime,
    node_id: &str,
    now: u64,
    depth: u32,
    execution_id: &str,
    hooks: &mut dyn EvalHooks,
) -> Result<Option<FsmEffect>, String> {
    let root = template_root(rt, now);

    match output {
        ActionOutput::Token {
            output_name,
            formula,
            ..
        } => {
            let state = rt.current_state_variables();
            let ctx = EvalContext {
                inputs: &crate::formula::EMPTY_MAP,
                variables: &rt.variables,
                state: &state,
                message: None,
                buffers: None,
                now,
            };
            let value = formula::evaluate(formula, &ctx, hooks).map_err(|e| e.to_string())?;
            Ok(Some(FsmEffect::EmitToken {
                output_name: output_name.clone(),
                value,
            }))
        }

        ActionOutput::Event {
            event_type,
            target,
            payload,
            ..
        } => {
            let event = RawEvent {
                id: rt.next_id("evt", node_id),
                event_type: substitute(event_type, &root),
                source_node: Some(node_id.to_string()),
                source_kind: Some("fsm_process".to_string()),
                payload: substitute_value(payload, &root),
                depth: depth + 1,
                execution_id: execution_id.to_string(),
                created_at: now,
            };
            Ok(Some(FsmEffect::EmitEvent {
                target: target.clone(),
                event,
            }))
        }

        ActionOutput::Message {
            message_type,
            target,
            payload,
            ..
        } => {
            let message = FsmMessage {
                id: rt.next_id("msg", node_id),
                message_type: substitute(message_type, &root),
                payload: substitute_value(payload, &root),
                rule_id: None,
                event_id: None,
                depth: depth + 1,
                execution_id: execution_id.to_string(),
                created_at: now,
            };
            Ok(Some(FsmEffect::EmitMessage {
                target: target.clone(),
                message,
            }))
        }

        ActionOutput::ApiCall {
            url, method, body, ..
        } => Ok(Some(FsmEffect::External(ExternalCall::Api {
            url: substitute(url, &root),
            method: method.clone(),
            body: body.as_ref().map(|b| substitute_value(b, &root)),
        }))),

        ActionOutput::Log { level, message, .. } => Ok(Some(FsmEffect::Log {
            level: *level,
            message: substitute(message, &root),
        })),

        ActionOutput::Email {
            to, subject, body, ..
        } => Ok(Some(FsmEffect::External(ExternalCall::Email {
            to: substitute(to, &root),
            subject: substitute(subject, &root),
            body: substitute(body, &root),
        }))),

        ActionOutput::Variable {
            scope,
            name,
            operation,
            value,
            ..
        } => {
            let value = substitute_value(value, &root);
            let current_state = rt.current_state.clone();
            let store = match scope {
                VariableScope::Global => &mut rt.variables,
                VariableScope::State => {
                    rt.state_variables.entry(current_state).or_default()
                }
            };
            apply_variable_op(store, name, *operation, value)?;
            Ok(None)
        }
    }
}

fn apply_variable_op(
    store: &mut std::collections::BTreeMap<String, Value>,
    name: &str,
    operation: VariableOp,
    value: Value,
) -> Result<(), String> {
    match operation {
        VariableOp::Set => {
            store.insert(name.to_string(), value);
        }
        VariableOp::Increment => {
            let delta = value
                .as_f64()
                .ok_or_else(|| format!("increment of `{}` needs a numeric value", name))?;
            let current = store.get(name).and_then(|v| v.as_f64()).unwrap_or(0.0);
            let next = serde_json::Number::from_f64(current + delta)
                .ok_or_else(|| format!("increment of `{}` produced a non-finite value", name))?;
            store.insert(name.to_string(), Value::Number(next));
        }
        VariableOp::Append => match store.get_mut(name) {
            Some(Value::Array(items)) => items.push(value),
            Some(Value::String(s)) => {
                s.push_str(&tokenflow_types::format_value(&value));
            }
            _ => {
                store.insert(name.to_string(), Value::Array(vec![value]));
            }
        },
    }
    Ok(())
}

/// Root object `{{path}}` templates resolve against.
pub(super) fn template_root(rt: &FsmRuntime, now: u64) -> Value {
    serde_json::json!({
        "variables": rt.variables,
        "state": rt.current_state_variables(),
        "currentState": rt.current_state,
        "now": now,
    })
}

/// Recursively substitute templates inside every string of a payload value.
fn substitute_value(value: &Value, root: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(substitute(s, root)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| substitute_value(v, root)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_value(v, root)))
                .collect(),
        ),
        other => other.clone(),
    }
}
