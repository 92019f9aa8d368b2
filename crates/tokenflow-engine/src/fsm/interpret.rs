use super::{AiInterpreter, AiRequest, FsmMessage, FsmRuntime, RawEvent};
use crate::formula::{self, EvalContext, EvalHooks};
use crate::template;
use serde_json::Value;
use std::collections::BTreeMap;
use tokenflow_types::{InterpretationMethod, InterpretationRule};

/// Run one raw event through the node's interpretation rules.
///
/// Rules are tried in descending priority; the first rule whose filters all
/// hold produces the messages. An event no rule matches is dropped.
pub(super) fn interpret_event(
    rules: &[InterpretationRule],
    event: &RawEvent,
    node_id: &str,
    now: u64,
    rt: &mut FsmRuntime,
    hooks: &mut dyn EvalHooks,
    ai: &mut dyn AiInterpreter,
) -> Result<Vec<FsmMessage>, String> {
    let mut ordered: Vec<&InterpretationRule> = rules.iter().collect();
    ordered.sort_by_key(|r| std::cmp::Reverse(r.priority));

    for rule in ordered {
        match rule_matches(rule, event) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(message) => return Err(format!("rule `{}`: {}", rule.id, message)),
        }

        let payloads = apply_method(rule, event, now, hooks, ai)
            .map_err(|message| format!("rule `{}`: {}", rule.id, message))?;

        let messages = payloads
            .into_iter()
            .map(|(message_type, payload)| FsmMessage {
                id: rt.next_id("msg", node_id),
                message_type,
                payload,
                rule_id: Some(rule.id.clone()),
                event_id: Some(event.id.clone()),
                depth: event.depth,
                execution_id: event.execution_id.clone(),
                created_at: now,
            })
            .collect();
        return Ok(messages);
    }

    Ok(Vec::new())
}

fn rule_matches(rule: &InterpretationRule, event: &RawEvent) -> Result<bool, String> {
    if let Some(event_type) = &rule.event_type {
        if event_type != &event.event_type {
            return Ok(false);
        }
    }
    if let Some(source_kind) = &rule.source_kind {
        if event.source_kind.as_deref() != Some(source_kind.as_str()) {
            return Ok(false);
        }
    }
    if let Some(pattern) = &rule.pattern {
        let re = regex::Regex::new(pattern)
            .map_err(|e| format!("invalid pattern `{}`: {}", pattern, e))?;
        if !re.is_match(&event.projection()) {
            return Ok(false);
        }
    }
    for (path, expected) in &rule.metadata_conditions {
        match template::lookup(&event.payload, path) {
            Some(actual) if &actual == expected => {}
            _ => return Ok(false),
        }
    }
    Ok(true)
}

/// Produce `(message_type, payload)` pairs via the rule's method.
fn apply_method(
    rule: &InterpretationRule,
    event: &RawEvent,
    now: u64,
    hooks: &mut dyn EvalHooks,
    ai: &mut dyn AiInterpreter,
) -> Result<Vec<(String, Value)>, String> {
    match &rule.method {
        InterpretationMethod::Pattern {
            message_type,
            pattern,
            capture_mapping,
        } => {
            let re = regex::Regex::new(pattern)
                .map_err(|e| format!("invalid pattern `{}`: {}", pattern, e))?;
            let projection = event.projection();
            let Some(caps) = re.captures(&projection) else {
                return Ok(Vec::new());
            };

            let mut payload = serde_json::Map::new();
            if capture_mapping.is_empty() {
                for name in re.capture_names().flatten() {
                    if let Some(m) = caps.name(name) {
                        payload.insert(name.to_string(), coerce(m.as_str()));
                    }
                }
            } else {
                for (field, group) in capture_mapping {
                    let matched = match group.parse::<usize>() {
                        Ok(index) => caps.get(index),
                        Err(_) => caps.name(group),
                    };
                    if let Some(m) = matched {
                        payload.insert(field.clone(), coerce(m.as_str()));
                    }
                }
            }
            Ok(vec![(message_type.clone(), Value::Object(payload))])
        }

        InterpretationMethod::Formula {
            message_type,
            formula,
        } => {
            let inputs = event_inputs(event);
            let ctx = EvalContext::with_inputs(&inputs, now);
            let payload =
                formula::evaluate(formula, &ctx, hooks).map_err(|e| e.to_string())?;
            Ok(vec![(message_type.clone(), payload)])
        }

        InterpretationMethod::Ai {
            prompt,
            candidate_message_types,
            confidence_threshold,
        } => {
            let ranked = ai.interpret(AiRequest {
                prompt,
                event,
                candidate_message_types,
            });
            Ok(ranked
                .into_iter()
                .find(|r| r.confidence >= *confidence_threshold)
                .map(|r| vec![(r.message_type, r.payload)])
                .unwrap_or_default())
        }

        InterpretationMethod::Script { script } => {
            let inputs = event_inputs(event);
            let ctx = EvalContext::with_inputs(&inputs, now);
            let result = formula::evaluate(script, &ctx, hooks).map_err(|e| e.to_string())?;
            let Value::Object(map) = &result else {
                return Err("script must return an object".to_string());
            };
            let message_type = map
                .get("message_type")
                .or_else(|| map.get("messageType"))
                .and_then(|v| v.as_str())
                .ok_or_else(|| "script result is missing `message_type`".to_string())?;
            let payload = map.get("payload").cloned().unwrap_or(Value::Null);
            Ok(vec![(message_type.to_string(), payload)])
        }

        InterpretationMethod::Passthrough {
            message_type,
            field_mapping,
        } => {
            let payload = if field_mapping.is_empty() {
                event.payload.clone()
            } else {
                let mut mapped = serde_json::Map::new();
                for (target, source_path) in field_mapping {
                    if let Some(value) = template::lookup(&event.payload, source_path) {
                        mapped.insert(target.clone(), value);
                    }
                }
                Value::Object(mapped)
            };
            Ok(vec![(message_type.clone(), payload)])
        }
    }
}

fn event_inputs(event: &RawEvent) -> BTreeMap<String, Value> {
    BTreeMap::from([
        ("event_type".to_string(), Value::String(event.event_type.clone())),
        ("payload".to_string(), event.payload.clone()),
        (
            "source".to_string(),
            event
                .source_node
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
        ),
    ])
}

/// Captured text becomes a number when it parses as one.
fn coerce(text: &str) -> Value {
    match text.parse::<f64>() {
        Ok(n) => serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(text.to_string())),
        Err(_) => Value::String(text.to_string()),
    }
}
