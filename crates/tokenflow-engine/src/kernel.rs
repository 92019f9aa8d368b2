use crate::diagnostics::{self, ValidatorOptions};
use crate::formula::{self, EvalContext, EvalHooks};
use crate::fsm::{
    self, AiInterpreter, ExternalDispatcher, FeedbackLimits, FeedbackManager, FeedbackState,
    FsmEffect, FsmMessage, FsmRuntime, NullAiInterpreter, NullDispatcher, RawEvent, StepCtx,
    TriggerKind,
};
use crate::log::{ActivityLog, EntryDraft};
use crate::rng::SimRng;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use tokenflow_types::{
    format_number, format_value, AggregationMethod, ControlAction, DataSourceNode,
    FsmProcessNode, LogAction, Node, OperationDetails, Output, ProcessNode, QueueNode, Scenario,
    SinkNode, SourceContribution, SourceSummary, Token,
};

/// Kernel tunables. This is the central home of their defaults; the runtime
/// configuration layer starts from here.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct KernelConfig {
    /// How many consumed tokens a sink keeps, most recent first.
    pub sink_retention: usize,
    pub feedback: FeedbackLimits,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            sink_retention: 10,
            feedback: FeedbackLimits {
                max_depth: 5,
                breaker_window: 50,
                breaker_threshold: 20,
                breaker_cooldown: 100,
            },
        }
    }
}

/// Mutable per-node simulation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NodeRuntime {
    pub op_state: String,
    pub input_buffers: BTreeMap<String, VecDeque<Token>>,
    pub last_emission: u64,
    pub last_aggregation: u64,
    /// Queue aggregation window.
    pub window: Vec<Token>,
    pub emitted: u64,
    pub consumed: u64,
    /// Sink retention, newest last.
    pub retained: VecDeque<Token>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fsm: Option<FsmRuntime>,
}

impl NodeRuntime {
    fn new(node: &Node) -> Self {
        let input_buffers = node
            .inputs()
            .iter()
            .map(|input| (input.name.clone(), VecDeque::new()))
            .collect();
        let fsm = match node {
            Node::FsmProcessNode(f) => Some(FsmRuntime::new(&f.fsm)),
            _ => None,
        };
        Self {
            op_state: format!("{}_idle", state_prefix(node)),
            input_buffers,
            last_emission: 0,
            last_aggregation: 0,
            window: Vec::new(),
            emitted: 0,
            consumed: 0,
            retained: VecDeque::new(),
            fsm,
        }
    }

    fn buffer_sizes(&self) -> BTreeMap<String, usize> {
        self.input_buffers
            .iter()
            .map(|(name, buffer)| (name.clone(), buffer.len()))
            .collect()
    }

    fn drain_inputs(&mut self) -> Vec<(String, Token)> {
        let mut drained = Vec::new();
        for (name, buffer) in self.input_buffers.iter_mut() {
            while let Some(token) = buffer.pop_front() {
                drained.push((name.clone(), token));
            }
        }
        drained
    }
}

fn state_prefix(node: &Node) -> &'static str {
    match node {
        Node::DataSource(_) => "source",
        Node::Queue(_) => "queue",
        Node::ProcessNode(_) => "process",
        Node::FsmProcessNode(_) => "process",
        Node::Sink(_) => "sink",
    }
}

/// Lineage bookkeeping the kernel keeps per live token id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenMeta {
    pub generation_level: u32,
    pub ultimate_sources: Vec<String>,
}

/// The full serializable kernel state: what a snapshot stores and a replay
/// restores. Byte-identical state means byte-identical continuation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct KernelState {
    pub config: KernelConfig,
    pub scenario: Scenario,
    pub sim_time: u64,
    pub rng: SimRng,
    pub nodes: BTreeMap<String, NodeRuntime>,
    pub token_meta: BTreeMap<String, TokenMeta>,
    pub feedback: FeedbackState,
    pub log: ActivityLog,
}

/// Deliveries staged during a tick and committed at its end, so no node
/// sees another node's same-tick output.
#[derive(Debug)]
enum Staged {
    Token {
        to_node: String,
        to_input: String,
        token: Token,
    },
    Event {
        to_node: String,
        event: RawEvent,
    },
    Message {
        to_node: String,
        message: FsmMessage,
    },
}

/// Formula host services backed by the kernel's seeded stream.
struct KernelHooks<'a> {
    rng: &'a mut SimRng,
    seq: u64,
}

impl EvalHooks for KernelHooks<'_> {
    fn random(&mut self) -> Option<f64> {
        Some(self.rng.next_f64())
    }

    fn uuid(&mut self) -> Option<String> {
        let id = self.rng.deterministic_uuid(self.seq);
        self.seq += 1;
        Some(id)
    }
}

/// The single-threaded cooperative simulation kernel.
///
/// Owns the scenario, all node state and the activity log. Advances in
/// indivisible ticks; external effects leave through the dispatcher and
/// never block the tick.
pub struct SimulationKernel {
    config: KernelConfig,
    scenario: Scenario,
    sim_time: u64,
    rng: SimRng,
    log: ActivityLog,
    nodes: BTreeMap<String, NodeRuntime>,
    token_meta: BTreeMap<String, TokenMeta>,
    feedback: FeedbackManager,
    external: Box<dyn ExternalDispatcher>,
    ai: Box<dyn AiInterpreter>,
}

impl SimulationKernel {
    pub fn new(scenario: Scenario, config: KernelConfig, epoch_base: i64) -> Result<Self> {
        Self::with_collaborators(
            scenario,
            config,
            epoch_base,
            Box::new(NullDispatcher),
            Box::new(NullAiInterpreter),
        )
    }

    pub fn with_collaborators(
        scenario: Scenario,
        config: KernelConfig,
        epoch_base: i64,
        external: Box<dyn ExternalDispatcher>,
        ai: Box<dyn AiInterpreter>,
    ) -> Result<Self> {
        let issues = diagnostics::validate(&scenario, &ValidatorOptions::default());
        if !diagnostics::is_valid(&issues) {
            return Err(Error::Validation(issues));
        }

        let nodes = scenario
            .nodes
            .iter()
            .map(|node| (node.id().to_string(), NodeRuntime::new(node)))
            .collect();

        Ok(Self {
            rng: SimRng::from_seed(scenario.seed),
            feedback: FeedbackManager::new(config.feedback),
            log: ActivityLog::new(epoch_base),
            nodes,
            token_meta: BTreeMap::new(),
            sim_time: 0,
            config,
            scenario,
            external,
            ai,
        })
    }

    /// Rebuild a kernel from snapshot state. Collaborators are supplied
    /// fresh; they are not part of simulation state.
    pub fn from_state(
        state: KernelState,
        external: Box<dyn ExternalDispatcher>,
        ai: Box<dyn AiInterpreter>,
    ) -> Self {
        Self {
            feedback: FeedbackManager::from_state(state.config.feedback, state.feedback),
            config: state.config,
            scenario: state.scenario,
            sim_time: state.sim_time,
            rng: state.rng,
            log: state.log,
            nodes: state.nodes,
            token_meta: state.token_meta,
            external,
            ai,
        }
    }

    pub fn state(&self) -> KernelState {
        KernelState {
            config: self.config,
            scenario: self.scenario.clone(),
            sim_time: self.sim_time,
            rng: self.rng.clone(),
            nodes: self.nodes.clone(),
            token_meta: self.token_meta.clone(),
            feedback: self.feedback.state().clone(),
            log: self.log.clone(),
        }
    }

    pub fn sim_time(&self) -> u64 {
        self.sim_time
    }

    pub fn log(&self) -> &[tokenflow_types::LogEntry] {
        self.log.entries()
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    pub fn node_runtime(&self, node_id: &str) -> Option<&NodeRuntime> {
        self.nodes.get(node_id)
    }

    /// Advance simulation time by one tick, processing every node in
    /// declaration order and committing routed tokens at the end.
    pub fn tick(&mut self) {
        self.sim_time += 1;
        let mut staged = Vec::new();

        let defs = self.scenario.nodes.clone();
        for def in &defs {
            match def {
                Node::DataSource(ds) => self.tick_source(ds, &mut staged),
                Node::Queue(q) => self.tick_queue(q, &mut staged),
                Node::ProcessNode(p) => self.tick_process(p, &mut staged),
                Node::FsmProcessNode(f) => self.tick_fsm(f, &mut staged),
                Node::Sink(s) => self.tick_sink(s),
            }
        }

        self.commit(staged);
    }

    // ------------------------------------------------------------------
    // Per-kind processing
    // ------------------------------------------------------------------

    fn tick_source(&mut self, def: &DataSourceNode, staged: &mut Vec<Staged>) {
        let node_id = def.base.node_id.as_str();
        let now = self.sim_time;

        let due = {
            let rt = &self.nodes[node_id];
            now.saturating_sub(rt.last_emission) >= def.emission_interval.max(1)
        };
        if !due {
            return;
        }

        let value = self.rng.range(def.value_min, def.value_max);
        let value = Value::from(value);

        let token_id = format!("tok_{}", self.log.next_sequence());
        self.token_meta.insert(
            token_id.clone(),
            TokenMeta {
                generation_level: 0,
                ultimate_sources: vec![token_id.clone()],
            },
        );

        let mut token = Token::new(token_id, value.clone(), now, node_id);
        let seq = self.log.append(
            EntryDraft::new(now, node_id, LogAction::Created, value, "source_generating")
                .token(token.id.clone()),
        );
        token.history.push(seq);

        for output in &def.outputs {
            self.route_token(node_id, "source_emitting", output, &token, staged);
        }

        let rt = self.nodes.get_mut(node_id).expect("runtime exists");
        rt.last_emission = now;
        rt.emitted += 1;
        rt.op_state = "source_waiting".to_string();
    }

    fn tick_queue(&mut self, def: &QueueNode, staged: &mut Vec<Staged>) {
        let node_id = def.base.node_id.as_str();
        let now = self.sim_time;

        // Pull arrivals into the window, enforcing capacity.
        let (arrived, buffer_sizes) = {
            let rt = self.nodes.get_mut(node_id).expect("runtime exists");
            let sizes = rt.buffer_sizes();
            (rt.drain_inputs(), sizes)
        };
        let mut dropped = Vec::new();
        {
            let rt = self.nodes.get_mut(node_id).expect("runtime exists");
            for (_, token) in arrived {
                match def.capacity {
                    Some(capacity) if rt.window.len() >= capacity => dropped.push(token),
                    _ => rt.window.push(token),
                }
            }
            if !rt.window.is_empty() {
                rt.op_state = "queue_accumulating".to_string();
            }
        }
        for token in dropped {
            let summary = self.summarize(&token);
            self.log.append(
                EntryDraft::new(
                    now,
                    node_id,
                    LogAction::Dropped,
                    token.value.clone(),
                    "queue_accumulating",
                )
                .token(token.id.clone())
                .sources(vec![summary])
                .details(OperationDetails::Drop {
                    capacity: def.capacity.unwrap_or(0),
                })
                .buffers(buffer_sizes.clone()),
            );
        }

        let due = {
            let rt = &self.nodes[node_id];
            !rt.window.is_empty()
                && now.saturating_sub(rt.last_aggregation) >= def.aggregation.trigger_window
        };
        if !due {
            return;
        }

        let window: Vec<Token> = {
            let rt = self.nodes.get_mut(node_id).expect("runtime exists");
            rt.last_aggregation = now;
            rt.op_state = "queue_processing".to_string();
            std::mem::take(&mut rt.window)
        };

        let aggregated = match aggregate(def.aggregation.method, &window) {
            Ok(aggregated) => aggregated,
            Err(message) => {
                self.record_error(node_id, "queue_processing", &message);
                self.idle(node_id, "queue_idle");
                return;
            }
        };

        // An optional post-aggregation formula reshapes the result.
        let result = match &def.aggregation.formula {
            Some(formula_src) => {
                let inputs = BTreeMap::from([
                    ("result".to_string(), aggregated.value.clone()),
                    ("count".to_string(), Value::from(window.len() as u64)),
                ]);
                let ctx = EvalContext::with_inputs(&inputs, now);
                let mut hooks = KernelHooks {
                    rng: &mut self.rng,
                    seq: self.log.next_sequence(),
                };
                match formula::evaluate(formula_src, &ctx, &mut hooks) {
                    Ok(result) => result,
                    Err(err) => {
                        let message = err.to_string();
                        self.record_error(node_id, "queue_processing", &message);
                        self.idle(node_id, "queue_idle");
                        return;
                    }
                }
            }
            None => aggregated.value.clone(),
        };

        let sources: Vec<SourceSummary> = window.iter().map(|t| self.summarize(t)).collect();
        let token_id = format!("tok_{}", self.log.next_sequence());
        self.track_derived(&token_id, &window);

        let mut token = Token::new(token_id, result.clone(), now, node_id);
        let seq = self.log.append(
            EntryDraft::new(
                now,
                node_id,
                LogAction::Aggregated(def.aggregation.method),
                result,
                "queue_processing",
            )
            .token(token.id.clone())
            .sources(sources)
            .details(OperationDetails::Aggregation {
                method: def.aggregation.method,
                contributions: aggregated.contributions,
                calculation: aggregated.calculation,
            })
            .buffers(buffer_sizes),
        );
        token.history.push(seq);

        for output in &def.outputs {
            self.route_token(node_id, "queue_emitting", output, &token, staged);
        }

        let rt = self.nodes.get_mut(node_id).expect("runtime exists");
        rt.emitted += 1;
        rt.op_state = "queue_idle".to_string();
    }

    fn tick_process(&mut self, def: &ProcessNode, staged: &mut Vec<Staged>) {
        let node_id = def.base.node_id.as_str();
        let now = self.sim_time;

        let ready = {
            let rt = &self.nodes[node_id];
            def.inputs
                .iter()
                .all(|input| rt.input_buffers.get(&input.name).is_some_and(|b| !b.is_empty()))
        };
        if !ready {
            let rt = self.nodes.get_mut(node_id).expect("runtime exists");
            let waiting = rt.input_buffers.values().any(|b| !b.is_empty());
            rt.op_state = if waiting {
                "process_collecting".to_string()
            } else {
                "process_idle".to_string()
            };
            return;
        }

        // One token per declared input, in declaration order.
        let (popped, buffer_sizes) = {
            let rt = self.nodes.get_mut(node_id).expect("runtime exists");
            rt.op_state = "process_evaluating".to_string();
            let mut popped = Vec::new();
            for input in &def.inputs {
                let token = rt
                    .input_buffers
                    .get_mut(&input.name)
                    .and_then(|b| b.pop_front())
                    .expect("readiness checked");
                popped.push((input.name.clone(), token));
            }
            (popped, rt.buffer_sizes())
        };

        let input_mapping: BTreeMap<String, Value> = popped
            .iter()
            .map(|(name, token)| (name.clone(), token.value.clone()))
            .collect();
        let source_tokens: Vec<Token> = popped.into_iter().map(|(_, t)| t).collect();
        let sources: Vec<SourceSummary> =
            source_tokens.iter().map(|t| self.summarize(t)).collect();

        for output in &def.outputs {
            let Some(formula_src) = output.formula.as_deref() else {
                self.record_error(
                    node_id,
                    "process_evaluating",
                    &format!("output `{}` has no formula", output.name),
                );
                self.idle(node_id, "process_idle");
                return;
            };

            let ctx = EvalContext::with_inputs(&input_mapping, now);
            let mut hooks = KernelHooks {
                rng: &mut self.rng,
                seq: self.log.next_sequence(),
            };
            let result = match formula::evaluate(formula_src, &ctx, &mut hooks) {
                Ok(result) => result,
                Err(err) => {
                    // The offending tokens are dropped and the node idles;
                    // the simulation itself carries on.
                    let message = err.to_string();
                    self.record_error(node_id, "process_evaluating", &message);
                    self.idle(node_id, "process_idle");
                    return;
                }
            };

            let calculation = render_calculation(formula_src, &input_mapping, &result);
            let token_id = format!("tok_{}", self.log.next_sequence());
            self.track_derived(&token_id, &source_tokens);

            let mut token = Token::new(token_id, result.clone(), now, node_id);
            let seq = self.log.append(
                EntryDraft::new(
                    now,
                    node_id,
                    LogAction::Created,
                    result,
                    "process_evaluating",
                )
                .token(token.id.clone())
                .sources(sources.clone())
                .details(OperationDetails::Transformation {
                    formula: formula_src.to_string(),
                    input_mapping: input_mapping.clone(),
                    calculation,
                })
                .buffers(buffer_sizes.clone()),
            );
            token.history.push(seq);

            self.route_token(node_id, "process_outputting", output, &token, staged);
        }

        let rt = self.nodes.get_mut(node_id).expect("runtime exists");
        rt.emitted += def.outputs.len() as u64;
        rt.op_state = "process_idle".to_string();
    }

    fn tick_fsm(&mut self, def: &FsmProcessNode, staged: &mut Vec<Staged>) {
        let node_id = def.base.node_id.as_str();
        let now = self.sim_time;

        let (arrived_tokens, buffer_sizes, mut fsm_rt) = {
            let rt = self.nodes.get_mut(node_id).expect("runtime exists");
            let sizes = rt.buffer_sizes();
            let arrived = rt.drain_inputs();
            let fsm_rt = rt.fsm.take().unwrap_or_else(|| FsmRuntime::new(&def.fsm));
            (arrived, sizes, fsm_rt)
        };

        let outcome = {
            let mut hooks = KernelHooks {
                rng: &mut self.rng,
                seq: self.log.next_sequence(),
            };
            let mut ctx = StepCtx {
                node_id,
                now,
                arrived_tokens,
                buffer_sizes: buffer_sizes.clone(),
                hooks: &mut hooks,
                ai: self.ai.as_mut(),
            };
            fsm::step(&def.fsm, &mut fsm_rt, &mut ctx)
        };

        let fsm_state = fsm_rt.current_state.clone();

        if let Some(transition) = &outcome.transition {
            if transition.trigger == TriggerKind::Timer {
                self.log.append(
                    EntryDraft::new(
                        now,
                        node_id,
                        LogAction::TimerTick,
                        serde_json::json!({"from": transition.from, "to": transition.to}),
                        &fsm_state,
                    )
                    .buffers(buffer_sizes.clone()),
                );
            }
        }

        for message in &outcome.errors {
            self.record_error(node_id, &fsm_state, message);
        }

        for effect in outcome.effects {
            self.apply_fsm_effect(def, &fsm_state, effect, &buffer_sizes, staged);
        }

        let rt = self.nodes.get_mut(node_id).expect("runtime exists");
        rt.op_state = fsm_state;
        rt.fsm = Some(fsm_rt);
    }

    fn apply_fsm_effect(
        &mut self,
        def: &FsmProcessNode,
        fsm_state: &str,
        effect: FsmEffect,
        buffer_sizes: &BTreeMap<String, usize>,
        staged: &mut Vec<Staged>,
    ) {
        let node_id = def.base.node_id.as_str();
        let now = self.sim_time;

        match effect {
            FsmEffect::EmitToken { output_name, value } => {
                let Some(output) = def.fsm.outputs.iter().find(|o| o.name == output_name)
                else {
                    self.record_error(
                        node_id,
                        fsm_state,
                        &format!("token action references unknown output `{}`", output_name),
                    );
                    return;
                };

                let token_id = format!("tok_{}", self.log.next_sequence());
                self.token_meta.insert(
                    token_id.clone(),
                    TokenMeta {
                        generation_level: 0,
                        ultimate_sources: vec![token_id.clone()],
                    },
                );
                let mut token = Token::new(token_id, value.clone(), now, node_id);
                let seq = self.log.append(
                    EntryDraft::new(now, node_id, LogAction::Created, value, fsm_state)
                        .token(token.id.clone())
                        .buffers(buffer_sizes.clone()),
                );
                token.history.push(seq);

                let output = output.clone();
                self.route_token(node_id, fsm_state, &output, &token, staged);
                let rt = self.nodes.get_mut(node_id).expect("runtime exists");
                rt.emitted += 1;
            }

            FsmEffect::EmitEvent { target, event } => {
                let to_node = target.unwrap_or_else(|| node_id.to_string());
                if self.admit_feedback(node_id, fsm_state, &to_node, event.depth) {
                    staged.push(Staged::Event { to_node, event });
                }
            }

            FsmEffect::EmitMessage { target, message } => {
                let to_node = target.unwrap_or_else(|| node_id.to_string());
                if self.admit_feedback(node_id, fsm_state, &to_node, message.depth) {
                    staged.push(Staged::Message { to_node, message });
                }
            }

            FsmEffect::External(call) => {
                self.external.submit(node_id, call);
            }

            FsmEffect::Log { level, message } => {
                self.log.append(
                    EntryDraft::new(
                        now,
                        node_id,
                        LogAction::Logged,
                        serde_json::json!({"level": level, "message": message}),
                        fsm_state,
                    )
                    .buffers(buffer_sizes.clone()),
                );
            }
        }
    }

    /// Feedback admission; a refusal becomes a `FEEDBACK_BLOCKED` entry.
    fn admit_feedback(
        &mut self,
        from_node: &str,
        fsm_state: &str,
        to_node: &str,
        depth: u32,
    ) -> bool {
        let target_is_fsm = matches!(self.scenario.node(to_node), Some(Node::FsmProcessNode(_)));
        if !target_is_fsm {
            self.log.append(
                EntryDraft::new(
                    self.sim_time,
                    from_node,
                    LogAction::RoutingError,
                    Value::Null,
                    fsm_state,
                )
                .details(OperationDetails::RoutingFailure {
                    destination: to_node.to_string(),
                }),
            );
            return false;
        }

        match self.feedback.admit(to_node, depth, self.sim_time) {
            Ok(()) => true,
            Err(rejection) => {
                self.log.append(
                    EntryDraft::new(
                        self.sim_time,
                        from_node,
                        LogAction::FeedbackBlocked,
                        Value::Null,
                        fsm_state,
                    )
                    .details(OperationDetails::Feedback {
                        depth,
                        reason: rejection.to_string(),
                    }),
                );
                false
            }
        }
    }

    fn tick_sink(&mut self, def: &SinkNode) {
        let node_id = def.base.node_id.as_str();
        let now = self.sim_time;

        let (arrived, buffer_sizes) = {
            let rt = self.nodes.get_mut(node_id).expect("runtime exists");
            let sizes = rt.buffer_sizes();
            (rt.drain_inputs(), sizes)
        };
        if arrived.is_empty() {
            return;
        }

        for (_, mut token) in arrived {
            let summary = self.summarize(&token);
            let seq = self.log.append(
                EntryDraft::new(
                    now,
                    node_id,
                    LogAction::ConsumedBySinkNode,
                    token.value.clone(),
                    "sink_processing",
                )
                .token(token.id.clone())
                .sources(vec![summary])
                .buffers(buffer_sizes.clone()),
            );
            token.history.push(seq);

            let rt = self.nodes.get_mut(node_id).expect("runtime exists");
            rt.consumed += 1;
            rt.retained.push_back(token);
            while rt.retained.len() > self.config.sink_retention {
                rt.retained.pop_front();
            }
        }

        let rt = self.nodes.get_mut(node_id).expect("runtime exists");
        rt.op_state = "sink_idle".to_string();
    }

    // ------------------------------------------------------------------
    // Routing and commit
    // ------------------------------------------------------------------

    fn route_token(
        &mut self,
        from_node: &str,
        from_state: &str,
        output: &Output,
        token: &Token,
        staged: &mut Vec<Staged>,
    ) {
        let destination = output.destination();
        let resolved = destination.and_then(|(dest_node, dest_input)| {
            self.scenario.node(dest_node).and_then(|node| {
                node.inputs()
                    .iter()
                    .find(|i| i.name == dest_input)
                    .map(|_| (dest_node.to_string(), dest_input.to_string()))
            })
        });

        match resolved {
            Some((to_node, to_input)) => staged.push(Staged::Token {
                to_node,
                to_input,
                token: token.clone(),
            }),
            None => {
                let destination = destination
                    .map(|(n, i)| format!("{}/{}", n, i))
                    .unwrap_or_else(|| format!("<unrouted output `{}`>", output.name));
                self.log.append(
                    EntryDraft::new(
                        self.sim_time,
                        from_node,
                        LogAction::RoutingError,
                        token.value.clone(),
                        from_state,
                    )
                    .details(OperationDetails::RoutingFailure { destination }),
                );
            }
        }
    }

    fn commit(&mut self, staged: Vec<Staged>) {
        for item in staged {
            match item {
                Staged::Token {
                    to_node,
                    to_input,
                    mut token,
                } => {
                    let Some(rt) = self.nodes.get_mut(&to_node) else {
                        continue;
                    };
                    let Some(buffer) = rt.input_buffers.get_mut(&to_input) else {
                        continue;
                    };
                    buffer.push_back(token.clone());
                    let sizes = rt.buffer_sizes();
                    let op_state = rt.op_state.clone();
                    let seq = self.log.append(
                        EntryDraft::new(
                            self.sim_time,
                            &to_node,
                            LogAction::Arrived,
                            token.value.clone(),
                            op_state,
                        )
                        .token(token.id.clone())
                        .buffers(sizes),
                    );
                    token.history.push(seq);
                    if let Some(rt) = self.nodes.get_mut(&to_node) {
                        if let Some(buffer) = rt.input_buffers.get_mut(&to_input) {
                            if let Some(stored) = buffer.back_mut() {
                                *stored = token;
                            }
                        }
                    }
                }
                Staged::Event { to_node, event } => {
                    if let Some(fsm_rt) =
                        self.nodes.get_mut(&to_node).and_then(|rt| rt.fsm.as_mut())
                    {
                        fsm_rt.push_event(event);
                    }
                }
                Staged::Message { to_node, message } => {
                    if let Some(fsm_rt) =
                        self.nodes.get_mut(&to_node).and_then(|rt| rt.fsm.as_mut())
                    {
                        fsm_rt.push_message(message);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Capture-protocol entry points (called between ticks)
    // ------------------------------------------------------------------

    /// Materialize a token owned by node `user` and deliver it to the named
    /// node, on `input` or its first declared input.
    pub fn inject_token(
        &mut self,
        node_id: &str,
        input: Option<&str>,
        value: Value,
    ) -> Result<String> {
        let node = self
            .scenario
            .node(node_id)
            .ok_or_else(|| Error::UnknownReference(format!("node `{}`", node_id)))?;
        let input_name = match input {
            Some(name) => node
                .inputs()
                .iter()
                .find(|i| i.name == name)
                .map(|i| i.name.clone())
                .ok_or_else(|| {
                    Error::UnknownReference(format!("input `{}` on node `{}`", name, node_id))
                })?,
            None => node
                .inputs()
                .first()
                .map(|i| i.name.clone())
                .ok_or_else(|| {
                    Error::UnknownReference(format!("node `{}` has no inputs", node_id))
                })?,
        };

        let token_id = format!("tok_{}", self.log.next_sequence());
        self.token_meta.insert(
            token_id.clone(),
            TokenMeta {
                generation_level: 0,
                ultimate_sources: vec![token_id.clone()],
            },
        );

        let mut token = Token::new(token_id.clone(), value.clone(), self.sim_time, "user");
        let seq = self.log.append(
            EntryDraft::new(self.sim_time, "user", LogAction::Created, value.clone(), "user")
                .token(token_id.clone()),
        );
        token.history.push(seq);

        let rt = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| Error::UnknownReference(format!("node `{}`", node_id)))?;
        let buffer = rt
            .input_buffers
            .get_mut(&input_name)
            .ok_or_else(|| Error::UnknownReference(format!("input `{}`", input_name)))?;
        buffer.push_back(token);
        let sizes = rt.buffer_sizes();

        self.log.append(
            EntryDraft::new(
                self.sim_time,
                node_id,
                LogAction::Transferred,
                value,
                "user",
            )
            .token(token_id.clone())
            .buffers(sizes),
        );
        Ok(token_id)
    }

    /// Replace node definitions atomically at the tick boundary. Runtime
    /// state survives for nodes that keep their id and kind.
    pub fn upgrade_model(&mut self, new_scenario: Scenario) -> Result<()> {
        let issues = diagnostics::validate(&new_scenario, &ValidatorOptions::default());
        if !diagnostics::is_valid(&issues) {
            return Err(Error::Validation(issues));
        }

        let mut nodes = BTreeMap::new();
        for node in &new_scenario.nodes {
            let runtime = match self.nodes.remove(node.id()) {
                Some(mut existing)
                    if self.scenario.node(node.id()).map(|n| n.kind()) == Some(node.kind()) =>
                {
                    // Keep buffers and counters; resync declared inputs and
                    // make sure the FSM state still exists.
                    let mut buffers: BTreeMap<String, VecDeque<Token>> = node
                        .inputs()
                        .iter()
                        .map(|i| (i.name.clone(), VecDeque::new()))
                        .collect();
                    for (name, buffer) in std::mem::take(&mut existing.input_buffers) {
                        if let Some(slot) = buffers.get_mut(&name) {
                            *slot = buffer;
                        }
                    }
                    existing.input_buffers = buffers;
                    if let (Node::FsmProcessNode(f), Some(fsm_rt)) =
                        (node, existing.fsm.as_mut())
                    {
                        if !f.fsm.states.contains(&fsm_rt.current_state) {
                            *fsm_rt = FsmRuntime::new(&f.fsm);
                        }
                    }
                    existing
                }
                _ => NodeRuntime::new(node),
            };
            nodes.insert(node.id().to_string(), runtime);
        }

        self.nodes = nodes;
        self.scenario = new_scenario;
        Ok(())
    }

    pub fn record_control(&mut self, action: ControlAction) {
        self.log.append(EntryDraft::new(
            self.sim_time,
            "system",
            LogAction::Control(action),
            Value::Null,
            "control",
        ));
    }

    pub fn record_user_interaction(&mut self, category: &str, payload: Value) {
        self.log.append(EntryDraft::new(
            self.sim_time,
            "system",
            LogAction::UserInteraction,
            serde_json::json!({"category": category, "payload": payload}),
            "control",
        ));
    }

    /// An external data feed arriving at a node: FSM nodes receive it as a
    /// raw event; other nodes as an injected token carrying the payload.
    pub fn external_data(&mut self, node_id: &str, payload: Value) -> Result<()> {
        match self.scenario.node(node_id) {
            Some(Node::FsmProcessNode(_)) => {
                let fsm_rt = self
                    .nodes
                    .get_mut(node_id)
                    .and_then(|rt| rt.fsm.as_mut())
                    .ok_or_else(|| Error::UnknownReference(format!("node `{}`", node_id)))?;
                let id = fsm_rt.next_id("evt", node_id);
                let execution_id = fsm_rt.next_id("exec", node_id);
                fsm_rt.push_event(RawEvent {
                    id,
                    event_type: "external_data".to_string(),
                    source_node: None,
                    source_kind: None,
                    payload,
                    depth: 0,
                    execution_id,
                    created_at: self.sim_time,
                });
                Ok(())
            }
            Some(_) => {
                self.inject_token(node_id, None, payload)?;
                Ok(())
            }
            None => Err(Error::UnknownReference(format!("node `{}`", node_id))),
        }
    }

    // ------------------------------------------------------------------
    // Lineage bookkeeping
    // ------------------------------------------------------------------

    fn summarize(&self, token: &Token) -> SourceSummary {
        let meta = self.token_meta.get(&token.id);
        SourceSummary {
            id: token.id.clone(),
            origin_node_id: token.origin_node_id.clone(),
            original_value: token.value.clone(),
            created_at: token.created_at,
            generation_level: meta.map(|m| m.generation_level).unwrap_or(0),
            ultimate_sources: meta
                .map(|m| m.ultimate_sources.clone())
                .unwrap_or_else(|| vec![token.id.clone()]),
        }
    }

    /// Record generation level and ultimate sources for a derived token.
    fn track_derived(&mut self, token_id: &str, sources: &[Token]) {
        let mut level = 0;
        let mut ultimate: Vec<String> = Vec::new();
        for source in sources {
            match self.token_meta.get(&source.id) {
                Some(meta) => {
                    level = level.max(meta.generation_level);
                    ultimate.extend(meta.ultimate_sources.iter().cloned());
                }
                None => {
                    level = level.max(0);
                    ultimate.push(source.id.clone());
                }
            }
        }
        ultimate.sort();
        ultimate.dedup();
        self.token_meta.insert(
            token_id.to_string(),
            TokenMeta {
                generation_level: level + 1,
                ultimate_sources: ultimate,
            },
        );
    }

    fn record_error(&mut self, node_id: &str, node_state: &str, message: &str) {
        self.log.append(
            EntryDraft::new(
                self.sim_time,
                node_id,
                LogAction::Error,
                Value::Null,
                node_state,
            )
            .details(OperationDetails::Failure {
                message: message.to_string(),
            }),
        );
    }

    fn idle(&mut self, node_id: &str, idle_state: &str) {
        if let Some(rt) = self.nodes.get_mut(node_id) {
            rt.op_state = idle_state.to_string();
        }
    }
}

/// Result of a window aggregation before any post-formula.
struct Aggregated {
    value: Value,
    contributions: Vec<SourceContribution>,
    calculation: String,
}

fn aggregate(method: AggregationMethod, window: &[Token]) -> std::result::Result<Aggregated, String> {
    let rendered: Vec<String> = window.iter().map(|t| format_value(&t.value)).collect();
    let args = rendered.join(", ");
    let n = window.len();

    let numbers = || -> std::result::Result<Vec<f64>, String> {
        window
            .iter()
            .map(|t| {
                t.as_number()
                    .ok_or_else(|| format!("token `{}` is not numeric", t.id))
            })
            .collect()
    };

    match method {
        AggregationMethod::Sum => {
            let values = numbers()?;
            let total: f64 = values.iter().sum();
            let contributions = window
                .iter()
                .zip(&values)
                .map(|(t, v)| SourceContribution {
                    token_id: t.id.clone(),
                    value: t.value.clone(),
                    weight: if total != 0.0 { v / total } else { 0.0 },
                })
                .collect();
            Ok(Aggregated {
                value: Value::from(total),
                contributions,
                calculation: format!("sum({}) = {}", args, format_number(total)),
            })
        }
        AggregationMethod::Average => {
            let values = numbers()?;
            let total: f64 = values.iter().sum();
            let mean = total / n as f64;
            let contributions = window
                .iter()
                .map(|t| SourceContribution {
                    token_id: t.id.clone(),
                    value: t.value.clone(),
                    weight: 1.0 / n as f64,
                })
                .collect();
            Ok(Aggregated {
                value: Value::from(mean),
                contributions,
                calculation: format!(
                    "avg({}) = ({}) / {} = {}",
                    args,
                    rendered.join(" + "),
                    n,
                    format_number(mean)
                ),
            })
        }
        AggregationMethod::Count => {
            let contributions = window
                .iter()
                .map(|t| SourceContribution {
                    token_id: t.id.clone(),
                    value: t.value.clone(),
                    weight: 1.0,
                })
                .collect();
            Ok(Aggregated {
                value: Value::from(n as u64),
                contributions,
                calculation: format!("count({}) = {}", args, n),
            })
        }
        AggregationMethod::First => {
            let chosen = window.first().ok_or("empty window")?;
            let contributions = window
                .iter()
                .enumerate()
                .map(|(i, t)| SourceContribution {
                    token_id: t.id.clone(),
                    value: t.value.clone(),
                    weight: if i == 0 { 1.0 } else { 0.0 },
                })
                .collect();
            Ok(Aggregated {
                value: chosen.value.clone(),
                contributions,
                calculation: format!("first({}) = {}", args, format_value(&chosen.value)),
            })
        }
        AggregationMethod::Last => {
            let chosen = window.last().ok_or("empty window")?;
            let last_index = n - 1;
            let contributions = window
                .iter()
                .enumerate()
                .map(|(i, t)| SourceContribution {
                    token_id: t.id.clone(),
                    value: t.value.clone(),
                    weight: if i == last_index { 1.0 } else { 0.0 },
                })
                .collect();
            Ok(Aggregated {
                value: chosen.value.clone(),
                contributions,
                calculation: format!("last({}) = {}", args, format_value(&chosen.value)),
            })
        }
    }
}

/// Substitute input names with their values inside the formula text, e.g.
/// `0.7 * temp + 0.3 * hum` -> `0.7 * 25.8 + 0.3 * 59.45 = 35.9`.
fn render_calculation(
    formula_src: &str,
    input_mapping: &BTreeMap<String, Value>,
    result: &Value,
) -> String {
    let mut rendered = formula_src.to_string();
    for (name, value) in input_mapping {
        let pattern = format!(r"\b{}\b", regex::escape(name));
        if let Ok(re) = regex::Regex::new(&pattern) {
            rendered = re
                .replace_all(&rendered, format_value(value).as_str())
                .into_owned();
        }
    }
    format!("{} = {}", rendered, format_value(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokenflow_types::{
        AggregationSpec, Input, NodeBase, PortInterface, Position,
    };

    fn base(id: &str) -> NodeBase {
        NodeBase {
            node_id: id.to_string(),
            display_name: id.to_string(),
            position: Position { x: 0.0, y: 0.0 },
        }
    }

    fn port() -> PortInterface {
        PortInterface {
            kind: "number".to_string(),
            required_fields: vec![],
        }
    }

    fn input(name: &str) -> Input {
        Input {
            name: name.to_string(),
            interface: port(),
        }
    }

    fn output_to(name: &str, node: &str, dest_input: &str) -> Output {
        Output {
            name: name.to_string(),
            interface: port(),
            destination_node_id: Some(node.to_string()),
            destination_input_name: Some(dest_input.to_string()),
            formula: None,
        }
    }

    fn pipeline_scenario() -> Scenario {
        Scenario::new(
            42,
            vec![
                Node::DataSource(DataSourceNode {
                    base: base("src"),
                    emission_interval: 5,
                    value_min: 1.0,
                    value_max: 9.0,
                    outputs: vec![output_to("out", "q", "in")],
                }),
                Node::Queue(QueueNode {
                    base: base("q"),
                    inputs: vec![input("in")],
                    outputs: vec![output_to("out", "sink", "in")],
                    aggregation: AggregationSpec {
                        method: AggregationMethod::Average,
                        trigger_window: 10,
                        formula: None,
                    },
                    capacity: None,
                }),
                Node::Sink(SinkNode {
                    base: base("sink"),
                    inputs: vec![input("in")],
                }),
            ],
        )
    }

    fn run(scenario: Scenario, ticks: u64) -> SimulationKernel {
        let mut kernel =
            SimulationKernel::new(scenario, KernelConfig::default(), 1_000_000).unwrap();
        for _ in 0..ticks {
            kernel.tick();
        }
        kernel
    }

    #[test]
    fn test_source_emits_on_interval() {
        let kernel = run(pipeline_scenario(), 11);
        let created: Vec<_> = kernel
            .log()
            .iter()
            .filter(|e| e.node_id == "src" && e.action == LogAction::Created)
            .collect();
        // interval 5 over 11 ticks: emissions at 5 and 10.
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].sim_time, 5);
        assert_eq!(created[1].sim_time, 10);
        for entry in created {
            let v = entry.value.as_f64().unwrap();
            assert!((1.0..=9.0).contains(&v));
        }
    }

    #[test]
    fn test_tokens_stage_to_next_tick() {
        let kernel = run(pipeline_scenario(), 5);
        // The tick-5 emission arrived at the queue but the queue has not
        // yet seen it in its window (arrivals commit after processing).
        let rt = kernel.node_runtime("q").unwrap();
        assert_eq!(rt.input_buffers["in"].len(), 1);
        assert!(rt.window.is_empty());
    }

    #[test]
    fn test_queue_aggregates_and_routes() {
        let kernel = run(pipeline_scenario(), 21);
        let aggregated: Vec<_> = kernel
            .log()
            .iter()
            .filter(|e| e.action == LogAction::Aggregated(AggregationMethod::Average))
            .collect();
        assert!(!aggregated.is_empty());
        let entry = aggregated[0];
        assert!(!entry.source_tokens.is_empty());
        match entry.details.as_ref().unwrap() {
            OperationDetails::Aggregation {
                method,
                contributions,
                calculation,
            } => {
                assert_eq!(*method, AggregationMethod::Average);
                assert!(calculation.starts_with("avg("));
                let total: f64 = contributions.iter().map(|c| c.weight).sum();
                assert!((total - 1.0).abs() < 1e-9);
            }
            other => panic!("unexpected details: {:?}", other),
        }

        // Sink consumed the aggregate eventually.
        let consumed = kernel
            .log()
            .iter()
            .any(|e| e.node_id == "sink" && e.action == LogAction::ConsumedBySinkNode);
        assert!(consumed);
    }

    #[test]
    fn test_generation_levels_follow_sources() {
        let kernel = run(pipeline_scenario(), 21);
        let aggregated = kernel
            .log()
            .iter()
            .find(|e| e.action == LogAction::Aggregated(AggregationMethod::Average))
            .unwrap();
        for source in &aggregated.source_tokens {
            assert_eq!(source.generation_level, 0);
            assert_eq!(source.ultimate_sources, vec![source.id.clone()]);
        }
    }

    #[test]
    fn test_determinism_same_seed() {
        let a = run(pipeline_scenario(), 40);
        let b = run(pipeline_scenario(), 40);
        let log_a = serde_json::to_string(a.log()).unwrap();
        let log_b = serde_json::to_string(b.log()).unwrap();
        assert_eq!(log_a, log_b);
    }

    #[test]
    fn test_different_seed_changes_values() {
        let mut scenario_b = pipeline_scenario();
        scenario_b.seed = 43;
        let a = run(pipeline_scenario(), 40);
        let b = run(scenario_b, 40);
        let values_a: Vec<String> = a
            .log()
            .iter()
            .filter(|e| e.action == LogAction::Created)
            .map(|e| e.value.to_string())
            .collect();
        let values_b: Vec<String> = b
            .log()
            .iter()
            .filter(|e| e.action == LogAction::Created)
            .map(|e| e.value.to_string())
            .collect();
        assert_ne!(values_a, values_b);
    }

    #[test]
    fn test_process_node_transformation() {
        let scenario = Scenario::new(
            7,
            vec![
                Node::DataSource(DataSourceNode {
                    base: base("s1"),
                    emission_interval: 3,
                    value_min: 10.0,
                    value_max: 10.0,
                    outputs: vec![output_to("out", "proc", "a")],
                }),
                Node::DataSource(DataSourceNode {
                    base: base("s2"),
                    emission_interval: 3,
                    value_min: 20.0,
                    value_max: 20.0,
                    outputs: vec![output_to("out", "proc", "b")],
                }),
                Node::ProcessNode(ProcessNode {
                    base: base("proc"),
                    inputs: vec![input("a"), input("b")],
                    outputs: vec![Output {
                        formula: Some("a + b".to_string()),
                        ..output_to("sum", "sink", "in")
                    }],
                }),
                Node::Sink(SinkNode {
                    base: base("sink"),
                    inputs: vec![input("in")],
                }),
            ],
        );

        let kernel = run(scenario, 6);
        let transformed = kernel
            .log()
            .iter()
            .find(|e| e.node_id == "proc" && e.action == LogAction::Created)
            .expect("process node should emit");
        assert_eq!(transformed.value.as_f64().unwrap(), 30.0);
        match transformed.details.as_ref().unwrap() {
            OperationDetails::Transformation {
                formula,
                input_mapping,
                calculation,
            } => {
                assert_eq!(formula, "a + b");
                assert_eq!(input_mapping["a"], json!(10.0));
                assert_eq!(calculation, "10 + 20 = 30");
            }
            other => panic!("unexpected details: {:?}", other),
        }
        assert_eq!(transformed.source_tokens.len(), 2);
    }

    #[test]
    fn test_process_error_recorded_not_fatal() {
        let scenario = Scenario::new(
            7,
            vec![
                Node::DataSource(DataSourceNode {
                    base: base("s1"),
                    emission_interval: 3,
                    value_min: 1.0,
                    value_max: 1.0,
                    outputs: vec![output_to("out", "proc", "a")],
                }),
                Node::ProcessNode(ProcessNode {
                    base: base("proc"),
                    inputs: vec![input("a")],
                    outputs: vec![Output {
                        formula: Some("a / 0".to_string()),
                        ..output_to("bad", "sink", "in")
                    }],
                }),
                Node::Sink(SinkNode {
                    base: base("sink"),
                    inputs: vec![input("in")],
                }),
            ],
        );

        let kernel = run(scenario, 10);
        let errors: Vec<_> = kernel
            .log()
            .iter()
            .filter(|e| e.node_id == "proc" && e.action == LogAction::Error)
            .collect();
        assert!(!errors.is_empty());
        // The run kept going: the source kept emitting after the error.
        assert!(kernel.sim_time() == 10);
        let rt = kernel.node_runtime("proc").unwrap();
        assert_eq!(rt.op_state, "process_idle");
    }

    #[test]
    fn test_queue_capacity_drops() {
        let scenario = Scenario::new(
            7,
            vec![
                Node::DataSource(DataSourceNode {
                    base: base("s1"),
                    emission_interval: 1,
                    value_min: 1.0,
                    value_max: 1.0,
                    outputs: vec![
                        output_to("o1", "q", "in"),
                        output_to("o2", "q", "in"),
                        output_to("o3", "q", "in"),
                    ],
                }),
                Node::Queue(QueueNode {
                    base: base("q"),
                    inputs: vec![input("in")],
                    outputs: vec![],
                    aggregation: AggregationSpec {
                        method: AggregationMethod::Sum,
                        trigger_window: 100,
                        formula: None,
                    },
                    capacity: Some(2),
                }),
            ],
        );

        let mut kernel =
            SimulationKernel::new(scenario, KernelConfig::default(), 0).unwrap();
        kernel.tick(); // source emits 3 copies into q's buffer
        kernel.tick(); // queue pulls them; capacity 2 -> 1 drop

        let drops: Vec<_> = kernel
            .log()
            .iter()
            .filter(|e| e.action == LogAction::Dropped)
            .collect();
        assert_eq!(drops.len(), 1);
        match drops[0].details.as_ref().unwrap() {
            OperationDetails::Drop { capacity } => assert_eq!(*capacity, 2),
            other => panic!("unexpected details: {:?}", other),
        }
    }

    #[test]
    fn test_routing_error_for_missing_destination() {
        let mut scenario = pipeline_scenario();
        // Point the queue output at a node that does not exist; build the
        // kernel first (construction validates), then upgrade around it by
        // mutating post-hoc through a fresh kernel from state.
        let mut kernel =
            SimulationKernel::new(scenario.clone(), KernelConfig::default(), 0).unwrap();
        if let Node::Queue(q) = &mut scenario.nodes[1] {
            q.outputs[0].destination_node_id = Some("ghost".to_string());
        }
        let mut state = kernel.state();
        state.scenario = scenario;
        kernel = SimulationKernel::from_state(
            state,
            Box::new(NullDispatcher),
            Box::new(NullAiInterpreter),
        );

        for _ in 0..21 {
            kernel.tick();
        }
        assert!(kernel
            .log()
            .iter()
            .any(|e| e.action == LogAction::RoutingError && e.node_id == "q"));
    }

    #[test]
    fn test_inject_token() {
        let mut kernel =
            SimulationKernel::new(pipeline_scenario(), KernelConfig::default(), 0).unwrap();
        let token_id = kernel.inject_token("q", None, json!(99.0)).unwrap();
        assert!(token_id.starts_with("tok_"));

        let created = kernel
            .log()
            .iter()
            .find(|e| e.action == LogAction::Created && e.node_id == "user")
            .unwrap();
        assert_eq!(created.value, json!(99.0));
        assert!(kernel
            .log()
            .iter()
            .any(|e| e.action == LogAction::Transferred && e.node_id == "q"));
        assert_eq!(
            kernel.node_runtime("q").unwrap().input_buffers["in"].len(),
            1
        );
    }

    #[test]
    fn test_inject_into_unknown_node_fails() {
        let mut kernel =
            SimulationKernel::new(pipeline_scenario(), KernelConfig::default(), 0).unwrap();
        assert!(kernel.inject_token("ghost", None, json!(1)).is_err());
    }

    #[test]
    fn test_upgrade_model_preserves_surviving_state() {
        let mut kernel =
            SimulationKernel::new(pipeline_scenario(), KernelConfig::default(), 0).unwrap();
        for _ in 0..6 {
            kernel.tick();
        }
        // The tick-5 emission was pulled into the queue window at tick 6.
        let window_before = kernel.node_runtime("q").unwrap().window.len();
        assert!(window_before > 0);

        let mut upgraded = pipeline_scenario();
        if let Node::Queue(q) = &mut upgraded.nodes[1] {
            q.aggregation.method = AggregationMethod::Sum;
        }
        kernel.upgrade_model(upgraded).unwrap();

        assert_eq!(
            kernel.node_runtime("q").unwrap().window.len(),
            window_before
        );
        match kernel.scenario().node("q").unwrap() {
            Node::Queue(q) => assert_eq!(q.aggregation.method, AggregationMethod::Sum),
            other => panic!("unexpected node: {}", other.kind()),
        }
    }

    #[test]
    fn test_state_round_trip_continues_identically() {
        let scenario = pipeline_scenario();
        let mut a = SimulationKernel::new(scenario.clone(), KernelConfig::default(), 0).unwrap();
        for _ in 0..13 {
            a.tick();
        }

        let mut b = SimulationKernel::from_state(
            a.state(),
            Box::new(NullDispatcher),
            Box::new(NullAiInterpreter),
        );
        for kernel in [&mut a, &mut b] {
            for _ in 0..13 {
                kernel.tick();
            }
        }
        assert_eq!(
            serde_json::to_string(a.log()).unwrap(),
            serde_json::to_string(b.log()).unwrap()
        );
    }

    #[test]
    fn test_render_calculation() {
        let mapping = BTreeMap::from([
            ("temp".to_string(), json!(25.8)),
            ("hum".to_string(), json!(59.45)),
        ]);
        let rendered =
            render_calculation("0.7 * temp + 0.3 * hum", &mapping, &json!(35.895));
        assert_eq!(rendered, "0.7 * 25.8 + 0.3 * 59.45 = 35.895");
    }
}
