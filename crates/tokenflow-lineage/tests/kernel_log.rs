//! Lineage derived from a real kernel run, and the cache sitting on top.

use tokenflow_engine::{KernelConfig, SimulationKernel};
use tokenflow_lineage::{
    CacheConfig, EvictionStrategy, LineageCache, LineageEngine, LineageIssueKind,
};
use tokenflow_types::{
    AggregationMethod, AggregationSpec, DataSourceNode, Input, LogAction, Node, NodeBase,
    Output, PortInterface, Position, ProcessNode, QueueNode, Scenario, SinkNode,
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

fn pipeline() -> Scenario {
    Scenario::new(
        17,
        vec![
            Node::DataSource(DataSourceNode {
                base: base("s1"),
                emission_interval: 5,
                value_min: 4.0,
                value_max: 4.0,
                outputs: vec![output_to("out", "q", "in")],
            }),
            Node::DataSource(DataSourceNode {
                base: base("s2"),
                emission_interval: 5,
                value_min: 8.0,
                value_max: 8.0,
                outputs: vec![output_to("out", "q", "in")],
            }),
            Node::Queue(QueueNode {
                base: base("q"),
                inputs: vec![input("in")],
                outputs: vec![output_to("out", "double", "x")],
                aggregation: AggregationSpec {
                    method: AggregationMethod::Sum,
                    trigger_window: 10,
                    formula: None,
                },
                capacity: None,
            }),
            Node::ProcessNode(ProcessNode {
                base: base("double"),
                inputs: vec![input("x")],
                outputs: vec![Output {
                    formula: Some("x * 2".to_string()),
                    ..output_to("out", "sink", "in")
                }],
            }),
            Node::Sink(SinkNode {
                base: base("sink"),
                inputs: vec![input("in")],
            }),
        ],
    )
}

fn run(ticks: u64) -> SimulationKernel {
    let mut kernel = SimulationKernel::new(pipeline(), KernelConfig::default(), 0).unwrap();
    for _ in 0..ticks {
        kernel.tick();
    }
    kernel
}

#[test]
fn test_engine_agrees_with_kernel_bookkeeping() {
    let kernel = run(25);
    let engine = LineageEngine::from_log(kernel.log());

    // Every creation entry's recorded source metadata matches the graph.
    for entry in kernel.log() {
        if !entry.action.is_creation() {
            continue;
        }
        let token_id = entry.token_id.as_deref().unwrap();
        let lineage = engine.lineage(token_id).expect("token is in the graph");

        if entry.source_tokens.is_empty() {
            assert_eq!(lineage.generation_level, 0);
            assert_eq!(lineage.ultimate_sources, vec![token_id.to_string()]);
        } else {
            let mut expected: Vec<String> = entry
                .source_tokens
                .iter()
                .flat_map(|s| s.ultimate_sources.iter().cloned())
                .collect();
            expected.sort();
            expected.dedup();
            assert_eq!(lineage.ultimate_sources, expected);

            let max_source = entry
                .source_tokens
                .iter()
                .map(|s| s.generation_level)
                .max()
                .unwrap();
            assert_eq!(lineage.generation_level, max_source + 1);
        }
    }
}

#[test]
fn test_transformed_token_traces_to_both_sensors() {
    let kernel = run(25);
    let engine = LineageEngine::from_log(kernel.log());

    let doubled = kernel
        .log()
        .iter()
        .find(|e| e.node_id == "double" && e.action == LogAction::Created)
        .expect("transformation happened");
    let lineage = engine.lineage(doubled.token_id.as_deref().unwrap()).unwrap();
    assert_eq!(lineage.ultimate_sources.len(), 2);
    assert_eq!(lineage.generation_level, 2);

    let report = engine.validate(&lineage.token_id);
    assert!(report.is_ok());
    assert!(!report.has_warning(LineageIssueKind::PerformanceLimit));
}

#[test]
fn test_cache_over_live_log() {
    let kernel = run(25);
    let engine = LineageEngine::from_log(kernel.log());
    let cache = LineageCache::new(CacheConfig {
        max_entries: 16,
        max_bytes: usize::MAX,
        ttl_ms: 60_000,
        strategy: EvictionStrategy::Lru,
    });

    let doubled_id = kernel
        .log()
        .iter()
        .find(|e| e.node_id == "double" && e.action == LogAction::Created)
        .and_then(|e| e.token_id.clone())
        .unwrap();

    let lineage = engine.lineage(&doubled_id).unwrap();
    cache.set_at(&doubled_id, lineage, 2, 0);
    assert!(cache.get_at(&doubled_id, 10).is_some());

    // A later entry touching one of its ancestors invalidates it.
    let ancestor = engine
        .ancestors(&doubled_id)
        .first()
        .map(|a| a.token_id.clone())
        .unwrap();
    let touching: Vec<_> = kernel
        .log()
        .iter()
        .filter(|e| e.token_id.as_deref() == Some(ancestor.as_str()))
        .cloned()
        .collect();
    let dropped = cache.invalidate_by_history_changes(&touching);
    assert!(dropped >= 1);
    assert!(cache.get_at(&doubled_id, 20).is_none());
}
