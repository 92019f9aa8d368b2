use super::{
    actions, interpret, ActionPhase, AiInterpreter, FsmEffect, FsmRuntime, PendingAction,
    PendingRetry, RawEvent,
};
use crate::formula::{self, EvalContext, EvalHooks};
use serde_json::Value;
use std::collections::BTreeMap;
use tokenflow_types::{FsmDefinition, OnErrorPolicy, Token, TransitionTrigger};

/// Everything one FSM step needs from the kernel.
pub struct StepCtx<'a> {
    pub node_id: &'a str,
    pub now: u64,
    /// Tokens the kernel popped off this node's inputs this tick.
    pub arrived_tokens: Vec<(String, Token)>,
    pub buffer_sizes: BTreeMap<String, usize>,
    pub hooks: &'a mut dyn EvalHooks,
    pub ai: &'a mut dyn AiInterpreter,
}

/// What happened during the step. Effects are applied by the kernel;
/// errors become `ERROR` log entries there.
#[derive(Debug, Default)]
pub struct StepOutcome {
    pub effects: Vec<FsmEffect>,
    pub errors: Vec<String>,
    pub transition: Option<TransitionFired>,
}

#[derive(Debug, Clone)]
pub struct TransitionFired {
    pub from: String,
    pub to: String,
    pub trigger: TriggerKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Message,
    Condition,
    Timer,
}

/// Advance one FSM node by one tick.
///
/// Order per the dual-stream design: interpret buffered events into
/// messages, adapt newly arrived tokens into `token_received` events (they
/// interpret next tick), fire at most one transition, then run due actions
/// and retries.
pub fn step(def: &FsmDefinition, rt: &mut FsmRuntime, ctx: &mut StepCtx<'_>) -> StepOutcome {
    let mut outcome = StepOutcome::default();

    // 1. Event interpretation.
    let events: Vec<RawEvent> = rt.event_buffer.drain(..).collect();
    for event in &events {
        match interpret::interpret_event(
            &def.interpretation_rules,
            event,
            ctx.node_id,
            ctx.now,
            rt,
            ctx.hooks,
            ctx.ai,
        ) {
            Ok(messages) => {
                for message in messages {
                    rt.push_message(message);
                }
            }
            Err(message) => outcome.errors.push(message),
        }
    }

    // 2. Token -> event adaptation.
    for (input_name, token) in ctx.arrived_tokens.drain(..) {
        let id = rt.next_id("evt", ctx.node_id);
        let execution_id = rt.next_id("exec", ctx.node_id);
        rt.push_event(RawEvent {
            id,
            event_type: "token_received".to_string(),
            source_node: Some(token.origin_node_id.clone()),
            source_kind: None,
            payload: serde_json::json!({
                "input": input_name,
                "token_id": token.id,
                "value": token.value,
            }),
            depth: 0,
            execution_id,
            created_at: ctx.now,
        });
    }

    // 3. At most one transition per tick.
    match fire_transition(def, rt, ctx) {
        Ok(transition) => outcome.transition = transition,
        Err(message) => outcome.errors.push(message),
    }

    // 4. Due retries, then due actions.
    run_retries(rt, ctx, &mut outcome);
    run_actions(rt, ctx, &mut outcome);

    outcome
}

fn fire_transition(
    def: &FsmDefinition,
    rt: &mut FsmRuntime,
    ctx: &mut StepCtx<'_>,
) -> Result<Option<TransitionFired>, String> {
    let buffers = buffers_value(&ctx.buffer_sizes);

    // Message-triggered transitions first, consuming the earliest message
    // that qualifies. Messages that trigger nothing stay buffered.
    for idx in 0..rt.message_buffer.len() {
        let message = rt.message_buffer[idx].clone();
        let message_value = serde_json::json!({
            "id": message.id,
            "type": message.message_type,
            "payload": message.payload,
        });

        for transition in &def.transitions {
            if transition.from != rt.current_state {
                continue;
            }
            let TransitionTrigger::Message { message_type } = &transition.trigger else {
                continue;
            };
            if message_type != &message.message_type {
                continue;
            }
            if !guard_passes(
                transition.guard.as_deref(),
                rt,
                Some(&message_value),
                &buffers,
                ctx,
            )? {
                continue;
            }

            let _ = rt.message_buffer.remove(idx);
            return Ok(Some(take_transition(
                def,
                rt,
                ctx,
                &transition.from.clone(),
                &transition.to.clone(),
                TriggerKind::Message,
                message.depth,
                &message.execution_id,
            )));
        }
    }

    // Condition transitions.
    for transition in &def.transitions {
        if transition.from != rt.current_state {
            continue;
        }
        let TransitionTrigger::Condition { formula } = &transition.trigger else {
            continue;
        };
        if !guard_passes(Some(formula.as_str()), rt, None, &buffers, ctx)? {
            continue;
        }
        if !guard_passes(transition.guard.as_deref(), rt, None, &buffers, ctx)? {
            continue;
        }
        let execution_id = rt.next_id("exec", ctx.node_id);
        return Ok(Some(take_transition(
            def,
            rt,
            ctx,
            &transition.from.clone(),
            &transition.to.clone(),
            TriggerKind::Condition,
            0,
            &execution_id,
        )));
    }

    // Timer transitions.
    for transition in &def.transitions {
        if transition.from != rt.current_state {
            continue;
        }
        let TransitionTrigger::Timer { timeout } = &transition.trigger else {
            continue;
        };
        if ctx.now.saturating_sub(rt.state_changed_at) < *timeout {
            continue;
        }
        if !guard_passes(transition.guard.as_deref(), rt, None, &buffers, ctx)? {
            continue;
        }
        let execution_id = rt.next_id("exec", ctx.node_id);
        return Ok(Some(take_transition(
            def,
            rt,
            ctx,
            &transition.from.clone(),
            &transition.to.clone(),
            TriggerKind::Timer,
            0,
            &execution_id,
        )));
    }

    Ok(None)
}

#[allow(clippy::too_many_arguments)]
fn take_transition(
    def: &FsmDefinition,
    rt: &mut FsmRuntime,
    ctx: &StepCtx<'_>,
    from: &str,
    to: &str,
    trigger: TriggerKind,
    depth: u32,
    execution_id: &str,
) -> TransitionFired {
    rt.schedule_actions(def, from, ActionPhase::Exit, ctx.now, depth, execution_id);
    rt.current_state = to.to_string();
    rt.state_changed_at = ctx.now;
    rt.schedule_actions(def, to, ActionPhase::Entry, ctx.now, depth, execution_id);
    TransitionFired {
        from: from.to_string(),
        to: to.to_string(),
        trigger,
    }
}

fn guard_passes(
    guard: Option<&str>,
    rt: &FsmRuntime,
    message: Option<&Value>,
    buffers: &Value,
    ctx: &mut StepCtx<'_>,
) -> Result<bool, String> {
    let Some(guard) = guard else {
        return Ok(true);
    };
    let state = rt.current_state_variables();
    let eval_ctx = EvalContext {
        inputs: &formula::EMPTY_MAP,
        variables: &rt.variables,
        state: &state,
        message,
        buffers: Some(buffers),
        now: ctx.now,
    };
    formula::evaluate_bool(guard, &eval_ctx, ctx.hooks).map_err(|e| e.to_string())
}

fn run_retries(rt: &mut FsmRuntime, ctx: &mut StepCtx<'_>, outcome: &mut StepOutcome) {
    let due: Vec<PendingRetry> = {
        let (due, rest): (Vec<_>, Vec<_>) = rt
            .pending_retries
            .drain(..)
            .partition(|r| r.execute_at <= ctx.now);
        rt.pending_retries = rest;
        due
    };

    for retry in due {
        match actions::run_output(
            &retry.output,
            rt,
            ctx.node_id,
            ctx.now,
            retry.depth,
            &retry.execution_id,
            ctx.hooks,
        ) {
            Ok(Some(effect)) => outcome.effects.push(effect),
            Ok(None) => {}
            Err(message) => {
                if retry.attempts_left > 0 {
                    let backoff = retry.backoff.saturating_mul(2);
                    rt.pending_retries.push(PendingRetry {
                        execute_at: ctx.now + backoff,
                        attempts_left: retry.attempts_left - 1,
                        backoff,
                        ..retry
                    });
                } else {
                    outcome.errors.push(format!("retry exhausted: {}", message));
                }
            }
        }
    }
}

fn run_actions(rt: &mut FsmRuntime, ctx: &mut StepCtx<'_>, outcome: &mut StepOutcome) {
    let due: Vec<PendingAction> = {
        let (due, rest): (Vec<_>, Vec<_>) = rt
            .pending_actions
            .drain(..)
            .partition(|a| a.execute_at <= ctx.now);
        rt.pending_actions = rest;
        due
    };

    for pending in due {
        if let Some(condition) = pending.action.condition.as_deref() {
            match guard_passes(Some(condition), rt, None, &Value::Null, ctx) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(message) => {
                    outcome
                        .errors
                        .push(format!("action `{}`: {}", pending.action.name, message));
                    continue;
                }
            }
        }

        for output in &pending.action.outputs {
            if let Some(condition) = output.condition() {
                match guard_passes(Some(condition), rt, None, &Value::Null, ctx) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(message) => {
                        outcome
                            .errors
                            .push(format!("action `{}`: {}", pending.action.name, message));
                        continue;
                    }
                }
            }

            match actions::run_output(
                output,
                rt,
                ctx.node_id,
                ctx.now,
                pending.depth,
                &pending.execution_id,
                ctx.hooks,
            ) {
                Ok(Some(effect)) => outcome.effects.push(effect),
                Ok(None) => {}
                Err(message) => match pending.action.on_error {
                    OnErrorPolicy::Continue => {
                        outcome
                            .errors
                            .push(format!("action `{}`: {}", pending.action.name, message));
                    }
                    OnErrorPolicy::Stop => {
                        outcome.errors.push(format!(
                            "action `{}` stopped: {}",
                            pending.action.name, message
                        ));
                        break;
                    }
                    OnErrorPolicy::Retry => {
                        rt.pending_retries.push(PendingRetry {
                            output: output.clone(),
                            state: pending.state.clone(),
                            execute_at: ctx.now + 1,
                            attempts_left: pending.action.retry_count,
                            backoff: 1,
                            on_error: pending.action.on_error,
                            depth: pending.depth,
                            execution_id: pending.execution_id.clone(),
                        });
                    }
                },
            }
        }
    }
}

fn buffers_value(buffer_sizes: &BTreeMap<String, usize>) -> Value {
    Value::Object(
        buffer_sizes
            .iter()
            .map(|(name, len)| (name.clone(), Value::from(*len as u64)))
            .collect(),
    )
}
