use std::collections::{HashMap, HashSet};
use tokenflow_types::{Node, Scenario};

/// Options for structural validation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatorOptions {
    /// Also require every declared input to be fed by some output's
    /// destination. Off by default; unconnected inputs then only mean the
    /// node never fires.
    pub strict_input_reachability: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub code: IssueCode,
    pub node_id: Option<String>,
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IssueCode {
    DuplicateNodeId,
    DanglingReference,
    InvalidValueRange,
    UnknownInitialState,
    UnknownTransitionState,
    DuplicateInputName,
    EmptyInputName,
    MissingFormula,
    InvalidPattern,
    UnreachableInput,
}

impl std::fmt::Display for IssueCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            IssueCode::DuplicateNodeId => "duplicate_node_id",
            IssueCode::DanglingReference => "dangling_reference",
            IssueCode::InvalidValueRange => "invalid_value_range",
            IssueCode::UnknownInitialState => "unknown_initial_state",
            IssueCode::UnknownTransitionState => "unknown_transition_state",
            IssueCode::DuplicateInputName => "duplicate_input_name",
            IssueCode::EmptyInputName => "empty_input_name",
            IssueCode::MissingFormula => "missing_formula",
            IssueCode::InvalidPattern => "invalid_pattern",
            IssueCode::UnreachableInput => "unreachable_input",
        };
        write!(f, "{}", code)
    }
}

/// A scenario with no `Error`-severity issues is accepted by the kernel.
pub fn is_valid(issues: &[ValidationIssue]) -> bool {
    !issues.iter().any(|i| i.severity == Severity::Error)
}

pub fn validate(scenario: &Scenario, options: &ValidatorOptions) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    // Node id uniqueness, and the input table used for reference checks.
    let mut inputs_by_node: HashMap<&str, HashSet<&str>> = HashMap::new();
    let mut seen_ids: HashSet<&str> = HashSet::new();
    for node in &scenario.nodes {
        if !seen_ids.insert(node.id()) {
            issues.push(ValidationIssue {
                code: IssueCode::DuplicateNodeId,
                node_id: Some(node.id().to_string()),
                message: format!("node id `{}` is declared more than once", node.id()),
                severity: Severity::Error,
            });
        }
        inputs_by_node.insert(node.id(), node.inputs().iter().map(|i| i.name.as_str()).collect());
    }

    for node in &scenario.nodes {
        check_inputs(node, &mut issues);
        check_outputs(node, &inputs_by_node, &mut issues);

        match node {
            Node::DataSource(ds) => {
                if ds.value_min > ds.value_max {
                    issues.push(ValidationIssue {
                        code: IssueCode::InvalidValueRange,
                        node_id: Some(ds.base.node_id.clone()),
                        message: format!(
                            "valueMin {} exceeds valueMax {}",
                            ds.value_min, ds.value_max
                        ),
                        severity: Severity::Error,
                    });
                }
            }
            Node::ProcessNode(p) => {
                for output in &p.outputs {
                    if output.formula.is_none() {
                        issues.push(ValidationIssue {
                            code: IssueCode::MissingFormula,
                            node_id: Some(p.base.node_id.clone()),
                            message: format!("output `{}` has no formula", output.name),
                            severity: Severity::Error,
                        });
                    }
                }
            }
            Node::FsmProcessNode(f) => check_fsm(f, &mut issues),
            Node::Queue(_) | Node::Sink(_) => {}
        }
    }

    if options.strict_input_reachability {
        check_reachability(scenario, &mut issues);
    }

    issues
}

fn check_inputs(node: &Node, issues: &mut Vec<ValidationIssue>) {
    let mut seen: HashSet<&str> = HashSet::new();
    for input in node.inputs() {
        if input.name.is_empty() {
            issues.push(ValidationIssue {
                code: IssueCode::EmptyInputName,
                node_id: Some(node.id().to_string()),
                message: "input with empty name".to_string(),
                severity: Severity::Error,
            });
            continue;
        }
        if !seen.insert(input.name.as_str()) {
            issues.push(ValidationIssue {
                code: IssueCode::DuplicateInputName,
                node_id: Some(node.id().to_string()),
                message: format!("input name `{}` is duplicated", input.name),
                severity: Severity::Error,
            });
        }
    }
}

fn check_outputs(
    node: &Node,
    inputs_by_node: &HashMap<&str, HashSet<&str>>,
    issues: &mut Vec<ValidationIssue>,
) {
    for output in node.outputs() {
        let Some((dest_node, dest_input)) = output.destination() else {
            continue;
        };
        match inputs_by_node.get(dest_node) {
            None => issues.push(ValidationIssue {
                code: IssueCode::DanglingReference,
                node_id: Some(node.id().to_string()),
                message: format!(
                    "output `{}` targets unknown node `{}`",
                    output.name, dest_node
                ),
                severity: Severity::Error,
            }),
            Some(inputs) if !inputs.contains(dest_input) => issues.push(ValidationIssue {
                code: IssueCode::DanglingReference,
                node_id: Some(node.id().to_string()),
                message: format!(
                    "output `{}` targets unknown input `{}` on node `{}`",
                    output.name, dest_input, dest_node
                ),
                severity: Severity::Error,
            }),
            Some(_) => {}
        }
    }
}

fn check_fsm(node: &tokenflow_types::FsmProcessNode, issues: &mut Vec<ValidationIssue>) {
    let states: HashSet<&str> = node.fsm.states.iter().map(|s| s.as_str()).collect();
    let node_id = node.base.node_id.clone();

    if !states.contains(node.fsm.initial_state.as_str()) {
        issues.push(ValidationIssue {
            code: IssueCode::UnknownInitialState,
            node_id: Some(node_id.clone()),
            message: format!("initial state `{}` is not declared", node.fsm.initial_state),
            severity: Severity::Error,
        });
    }

    for transition in &node.fsm.transitions {
        for state in [&transition.from, &transition.to] {
            if !states.contains(state.as_str()) {
                issues.push(ValidationIssue {
                    code: IssueCode::UnknownTransitionState,
                    node_id: Some(node_id.clone()),
                    message: format!("transition references unknown state `{}`", state),
                    severity: Severity::Error,
                });
            }
        }
    }

    for rule in &node.fsm.interpretation_rules {
        if let Some(pattern) = &rule.pattern {
            if let Err(err) = regex::Regex::new(pattern) {
                issues.push(ValidationIssue {
                    code: IssueCode::InvalidPattern,
                    node_id: Some(node_id.clone()),
                    message: format!("rule `{}` pattern does not compile: {}", rule.id, err),
                    severity: Severity::Error,
                });
            }
        }
    }
}

fn check_reachability(scenario: &Scenario, issues: &mut Vec<ValidationIssue>) {
    let mut fed: HashSet<(String, String)> = HashSet::new();
    for node in &scenario.nodes {
        for output in node.outputs() {
            if let Some((dest_node, dest_input)) = output.destination() {
                fed.insert((dest_node.to_string(), dest_input.to_string()));
            }
        }
    }

    for node in &scenario.nodes {
        for input in node.inputs() {
            let key = (node.id().to_string(), input.name.clone());
            if !fed.contains(&key) {
                issues.push(ValidationIssue {
                    code: IssueCode::UnreachableInput,
                    node_id: Some(node.id().to_string()),
                    message: format!(
                        "input `{}` is not fed by any output destination",
                        input.name
                    ),
                    severity: Severity::Error,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokenflow_types::{
        AggregationMethod, AggregationSpec, DataSourceNode, Input, Node, NodeBase, Output,
        PortInterface, Position, QueueNode, Scenario,
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

    fn output_to(name: &str, node: &str, input: &str) -> Output {
        Output {
            name: name.to_string(),
            interface: port(),
            destination_node_id: Some(node.to_string()),
            destination_input_name: Some(input.to_string()),
            formula: None,
        }
    }

    fn source(id: &str, min: f64, max: f64, outputs: Vec<Output>) -> Node {
        Node::DataSource(DataSourceNode {
            base: base(id),
            emission_interval: 10,
            value_min: min,
            value_max: max,
            outputs,
        })
    }

    fn queue(id: &str, inputs: Vec<&str>) -> Node {
        Node::Queue(QueueNode {
            base: base(id),
            inputs: inputs
                .into_iter()
                .map(|n| Input {
                    name: n.to_string(),
                    interface: port(),
                })
                .collect(),
            outputs: vec![],
            aggregation: AggregationSpec {
                method: AggregationMethod::Average,
                trigger_window: 100,
                formula: None,
            },
            capacity: None,
        })
    }

    #[test]
    fn test_valid_scenario_has_no_issues() {
        let scenario = Scenario::new(
            1,
            vec![
                source("src", 0.0, 10.0, vec![output_to("out", "q", "in")]),
                queue("q", vec!["in"]),
            ],
        );
        let issues = validate(&scenario, &ValidatorOptions::default());
        assert!(issues.is_empty(), "unexpected issues: {:?}", issues);
    }

    #[test]
    fn test_dangling_destination_rejected() {
        let scenario = Scenario::new(
            1,
            vec![source("src", 0.0, 10.0, vec![output_to("out", "ghost", "in")])],
        );
        let issues = validate(&scenario, &ValidatorOptions::default());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, IssueCode::DanglingReference);
        assert!(!is_valid(&issues));
    }

    #[test]
    fn test_dangling_input_name_rejected() {
        let scenario = Scenario::new(
            1,
            vec![
                source("src", 0.0, 10.0, vec![output_to("out", "q", "wrong")]),
                queue("q", vec!["in"]),
            ],
        );
        let issues = validate(&scenario, &ValidatorOptions::default());
        assert_eq!(issues[0].code, IssueCode::DanglingReference);
    }

    #[test]
    fn test_inverted_value_range_rejected() {
        let scenario = Scenario::new(1, vec![source("src", 10.0, 0.0, vec![])]);
        let issues = validate(&scenario, &ValidatorOptions::default());
        assert_eq!(issues[0].code, IssueCode::InvalidValueRange);
    }

    #[test]
    fn test_duplicate_node_and_input_names_rejected() {
        let scenario = Scenario::new(
            1,
            vec![
                queue("q", vec!["in", "in"]),
                queue("q", vec!["other"]),
            ],
        );
        let issues = validate(&scenario, &ValidatorOptions::default());
        let codes: Vec<&IssueCode> = issues.iter().map(|i| &i.code).collect();
        assert!(codes.contains(&&IssueCode::DuplicateNodeId));
        assert!(codes.contains(&&IssueCode::DuplicateInputName));
    }

    #[test]
    fn test_unreachable_input_behind_flag() {
        let scenario = Scenario::new(1, vec![queue("q", vec!["in"])]);

        let relaxed = validate(&scenario, &ValidatorOptions::default());
        assert!(relaxed.is_empty());

        let strict = validate(
            &scenario,
            &ValidatorOptions {
                strict_input_reachability: true,
            },
        );
        assert_eq!(strict[0].code, IssueCode::UnreachableInput);
    }
}
