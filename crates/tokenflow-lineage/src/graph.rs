use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tokenflow_types::{LogEntry, OperationDetails};

/// One token in the dependency graph: a creation entry from the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GraphNode {
    pub token_id: String,
    /// Scenario node that produced the token.
    pub node_id: String,
    pub value: Value,
    pub created_at: u64,
    pub sequence: u64,
    /// Action label of the creation entry (`CREATED`, `AGGREGATED_SUM`...).
    pub action: String,
    pub sources: Vec<String>,
    /// Edge weight per source, as recorded by the producing operation.
    pub source_weights: BTreeMap<String, f64>,
}

/// The token dependency graph, keyed entirely by identifiers so ownership
/// stays flat and the whole structure serializes losslessly.
///
/// Built in a single pass over the log: every creation entry (`CREATED` or
/// `AGGREGATED_*`) contributes one node, and one edge per referenced
/// source. Edges are only materialized between tokens present in the log;
/// references to absent tokens are kept aside for lineage validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TokenGraph {
    nodes: BTreeMap<String, GraphNode>,
    /// source token -> tokens derived from it, in log order.
    edges_out: BTreeMap<String, Vec<String>>,
    /// derived token -> its sources, in declaration order.
    edges_in: BTreeMap<String, Vec<String>>,
    /// Source ids referenced by some entry but never created in the log.
    missing: BTreeSet<String>,
}

impl TokenGraph {
    pub fn from_log(entries: &[LogEntry]) -> Self {
        let mut graph = TokenGraph::default();

        // Nodes first so forward references resolve regardless of order.
        for entry in entries {
            if !entry.action.is_creation() {
                continue;
            }
            let Some(token_id) = entry.token_id.clone() else {
                continue;
            };
            let sources: Vec<String> = entry.source_ids().map(String::from).collect();
            graph.nodes.insert(
                token_id.clone(),
                GraphNode {
                    token_id,
                    node_id: entry.node_id.clone(),
                    value: entry.value.clone(),
                    created_at: entry.sim_time,
                    sequence: entry.sequence,
                    action: entry.action.label(),
                    source_weights: source_weights(entry),
                    sources,
                },
            );
        }

        let derived_ids: Vec<String> = graph.nodes.keys().cloned().collect();
        for derived in derived_ids {
            let sources = graph.nodes[&derived].sources.clone();
            for source in sources {
                if graph.nodes.contains_key(&source) {
                    graph.edges_out.entry(source.clone()).or_default().push(derived.clone());
                    graph.edges_in.entry(derived.clone()).or_default().push(source);
                } else {
                    graph.missing.insert(source);
                }
            }
        }

        graph
    }

    pub fn node(&self, token_id: &str) -> Option<&GraphNode> {
        self.nodes.get(token_id)
    }

    pub fn contains(&self, token_id: &str) -> bool {
        self.nodes.contains_key(token_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn token_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(|s| s.as_str())
    }

    /// Sources this token was derived from (empty for roots).
    pub fn sources_of(&self, token_id: &str) -> &[String] {
        self.edges_in.get(token_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Tokens directly derived from this one (empty for leaves).
    pub fn derived_from(&self, token_id: &str) -> &[String] {
        self.edges_out.get(token_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Weight of the edge `source -> derived`, defined by the derived
    /// side's operation.
    pub fn edge_weight(&self, source: &str, derived: &str) -> f64 {
        self.nodes
            .get(derived)
            .and_then(|n| n.source_weights.get(source).copied())
            .unwrap_or(0.0)
    }

    pub fn edge_count(&self) -> usize {
        self.edges_in.values().map(Vec::len).sum()
    }

    pub fn roots(&self) -> Vec<&str> {
        self.nodes
            .keys()
            .filter(|id| self.sources_of(id).is_empty())
            .map(|s| s.as_str())
            .collect()
    }

    pub fn leaves(&self) -> Vec<&str> {
        self.nodes
            .keys()
            .filter(|id| self.derived_from(id).is_empty())
            .map(|s| s.as_str())
            .collect()
    }

    pub fn is_root(&self, token_id: &str) -> bool {
        self.contains(token_id) && self.sources_of(token_id).is_empty()
    }

    /// Referenced-but-absent source ids, for incomplete-lineage reporting.
    pub fn missing_sources(&self) -> &BTreeSet<String> {
        &self.missing
    }
}

/// Edge weights from the producing operation: the logged contribution
/// vector for aggregations, `v_in / v_out` for transformations.
fn source_weights(entry: &LogEntry) -> BTreeMap<String, f64> {
    match &entry.details {
        Some(OperationDetails::Aggregation { contributions, .. }) => contributions
            .iter()
            .map(|c| (c.token_id.clone(), c.weight))
            .collect(),
        Some(OperationDetails::Transformation { .. }) => {
            let out = entry.value.as_f64().unwrap_or(0.0);
            entry
                .source_tokens
                .iter()
                .map(|s| {
                    let v_in = s.original_value.as_f64().unwrap_or(0.0);
                    let weight = if out != 0.0 { v_in / out } else { 0.0 };
                    (s.id.clone(), weight)
                })
                .collect()
        }
        _ => entry
            .source_tokens
            .iter()
            .map(|s| (s.id.clone(), 1.0))
            .collect(),
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::creation;
    use super::*;

    #[test]
    fn test_builds_nodes_and_edges() {
        let log = vec![
            creation("tok_0", "src", 100, 0, 10.0, &[]),
            creation("tok_1", "q", 200, 1, 10.0, &[("tok_0", 10.0, 1.0)]),
        ];
        let graph = TokenGraph::from_log(&log);
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.sources_of("tok_1"), &["tok_0".to_string()]);
        assert_eq!(graph.derived_from("tok_0"), &["tok_1".to_string()]);
        assert_eq!(graph.roots(), vec!["tok_0"]);
        assert_eq!(graph.leaves(), vec!["tok_1"]);
        assert!(graph.missing_sources().is_empty());
    }

    #[test]
    fn test_non_creation_entries_ignored() {
        let mut arrival = creation("tok_0", "src", 100, 0, 1.0, &[]);
        arrival.action = tokenflow_types::LogAction::Arrived;
        let graph = TokenGraph::from_log(&[arrival]);
        assert!(graph.is_empty());
    }

    #[test]
    fn test_missing_source_is_not_an_edge() {
        let log = vec![creation("tok_1", "q", 200, 1, 5.0, &[("ghost", 5.0, 1.0)])];
        let graph = TokenGraph::from_log(&log);
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.missing_sources().contains("ghost"));
        // No dangling edge endpoints.
        assert!(graph.sources_of("tok_1").is_empty());
    }

    #[test]
    fn test_forward_references_resolve() {
        // Derived entry appears before its source in the log.
        let log = vec![
            creation("tok_1", "q", 200, 1, 5.0, &[("tok_0", 5.0, 1.0)]),
            creation("tok_0", "src", 100, 0, 5.0, &[]),
        ];
        let graph = TokenGraph::from_log(&log);
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.sources_of("tok_1"), &["tok_0".to_string()]);
    }

    #[test]
    fn test_serialization_round_trip_preserves_queries() {
        let log = vec![
            creation("tok_0", "src", 100, 0, 10.0, &[]),
            creation("tok_1", "q", 200, 1, 10.0, &[("tok_0", 10.0, 1.0)]),
            creation("tok_2", "q2", 300, 2, 20.0, &[("tok_0", 10.0, 0.5)]),
        ];
        let graph = TokenGraph::from_log(&log);
        let json = serde_json::to_string(&graph).unwrap();
        let rebuilt: TokenGraph = serde_json::from_str(&json).unwrap();

        assert_eq!(rebuilt.len(), graph.len());
        assert_eq!(rebuilt.edge_count(), graph.edge_count());
        assert_eq!(rebuilt.derived_from("tok_0"), graph.derived_from("tok_0"));
        assert_eq!(
            rebuilt.edge_weight("tok_0", "tok_2"),
            graph.edge_weight("tok_0", "tok_2")
        );
    }

    #[test]
    fn test_transformation_weights_are_value_ratios() {
        use tokenflow_types::{LogAction, OperationDetails};
        let mut entry = creation("tok_2", "proc", 300, 2, 40.0, &[("tok_0", 10.0, 0.0)]);
        entry.action = LogAction::Created;
        entry.details = Some(OperationDetails::Transformation {
            formula: "a * 4".to_string(),
            input_mapping: Default::default(),
            calculation: "10 * 4 = 40".to_string(),
        });

        let log = vec![creation("tok_0", "src", 100, 0, 10.0, &[]), entry];
        let graph = TokenGraph::from_log(&log);
        assert!((graph.edge_weight("tok_0", "tok_2") - 0.25).abs() < 1e-12);
    }
}
