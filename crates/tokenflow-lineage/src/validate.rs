use crate::graph::TokenGraph;
use crate::query;
use serde::{Deserialize, Serialize};

/// Structured result of a lineage validation; errors and warnings are both
/// data, never panics or Err returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LineageReport {
    pub token_id: String,
    pub errors: Vec<LineageIssue>,
    pub warnings: Vec<LineageIssue>,
}

impl LineageReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_error(&self, kind: LineageIssueKind) -> bool {
        self.errors.iter().any(|i| i.kind == kind)
    }

    pub fn has_warning(&self, kind: LineageIssueKind) -> bool {
        self.warnings.iter().any(|i| i.kind == kind)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LineageIssue {
    pub kind: LineageIssueKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineageIssueKind {
    MissingToken,
    CircularReference,
    IncompleteLineage,
    PerformanceLimit,
}

/// Depth thresholds: past `warn` generations is a warning, past `hard` an
/// error.
#[derive(Debug, Clone, Copy)]
pub struct DepthLimits {
    pub warn: u32,
    pub hard: u32,
}

impl Default for DepthLimits {
    fn default() -> Self {
        Self {
            warn: 20,
            hard: 100,
        }
    }
}

pub fn validate(graph: &TokenGraph, token_id: &str, limits: DepthLimits) -> LineageReport {
    let mut report = LineageReport {
        token_id: token_id.to_string(),
        errors: Vec::new(),
        warnings: Vec::new(),
    };

    if !graph.contains(token_id) {
        report.errors.push(LineageIssue {
            kind: LineageIssueKind::MissingToken,
            message: format!("token `{}` does not appear in the log", token_id),
        });
        return report;
    }

    let ancestors = query::ancestors(graph, token_id);

    // Cycles anywhere in the ancestry (or at the token itself).
    let in_scope: std::collections::HashSet<&str> = ancestors
        .iter()
        .map(|a| a.token_id.as_str())
        .chain(std::iter::once(token_id))
        .collect();
    for cycle in query::find_cycles(graph) {
        if cycle.iter().any(|t| in_scope.contains(t.as_str())) {
            report.errors.push(LineageIssue {
                kind: LineageIssueKind::CircularReference,
                message: format!("circular reference: {}", cycle.join(" -> ")),
            });
        }
    }

    // Sources referenced by the ancestry but absent from the log.
    for ancestor in ancestors.iter().map(|a| a.token_id.as_str()).chain([token_id]) {
        if let Some(node) = graph.node(ancestor) {
            for source in &node.sources {
                if graph.missing_sources().contains(source) {
                    report.errors.push(LineageIssue {
                        kind: LineageIssueKind::IncompleteLineage,
                        message: format!(
                            "token `{}` references source `{}` that is absent from the log",
                            ancestor, source
                        ),
                    });
                }
            }
        }
    }

    let depth = ancestors.iter().map(|a| a.generation_level).max().unwrap_or(0);
    if depth > limits.hard {
        report.errors.push(LineageIssue {
            kind: LineageIssueKind::PerformanceLimit,
            message: format!(
                "lineage depth {} exceeds the hard limit {}",
                depth, limits.hard
            ),
        });
    } else if depth > limits.warn {
        report.warnings.push(LineageIssue {
            kind: LineageIssueKind::PerformanceLimit,
            message: format!("deep lineage: {} generations", depth),
        });
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testutil::creation;

    #[test]
    fn test_clean_lineage_is_ok() {
        let graph = TokenGraph::from_log(&[
            creation("tok_0", "src", 100, 0, 1.0, &[]),
            creation("tok_1", "q", 200, 1, 1.0, &[("tok_0", 1.0, 1.0)]),
        ]);
        let report = validate(&graph, "tok_1", DepthLimits::default());
        assert!(report.is_ok());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_missing_token() {
        let graph = TokenGraph::from_log(&[]);
        let report = validate(&graph, "ghost", DepthLimits::default());
        assert!(report.has_error(LineageIssueKind::MissingToken));
    }

    #[test]
    fn test_circular_reference_reported() {
        let graph = TokenGraph::from_log(&[
            creation("A", "n1", 100, 0, 1.0, &[("B", 1.0, 1.0)]),
            creation("B", "n2", 200, 1, 1.0, &[("A", 1.0, 1.0)]),
        ]);
        let report = validate(&graph, "A", DepthLimits::default());
        assert!(report.has_error(LineageIssueKind::CircularReference));
    }

    #[test]
    fn test_incomplete_lineage_reported() {
        let graph = TokenGraph::from_log(&[creation(
            "tok_1",
            "q",
            200,
            1,
            1.0,
            &[("never_logged", 1.0, 1.0)],
        )]);
        let report = validate(&graph, "tok_1", DepthLimits::default());
        assert!(report.has_error(LineageIssueKind::IncompleteLineage));
    }

    #[test]
    fn test_deep_chain_warns_but_resolves() {
        // 25 generations: tok_0 -> tok_1 -> ... -> tok_25.
        let mut log = vec![creation("tok_0", "src", 100, 0, 1.0, &[])];
        for i in 1..=25u64 {
            let parent = format!("tok_{}", i - 1);
            log.push(creation(
                &format!("tok_{}", i),
                "q",
                100 + i,
                i,
                1.0,
                &[(parent.as_str(), 1.0, 1.0)],
            ));
        }
        let graph = TokenGraph::from_log(&log);
        let report = validate(&graph, "tok_25", DepthLimits::default());
        assert!(report.is_ok());
        assert!(report.has_warning(LineageIssueKind::PerformanceLimit));

        // Still answers correctly.
        let ancestors = crate::query::ancestors(&graph, "tok_25");
        assert_eq!(ancestors.len(), 25);
    }

    #[test]
    fn test_hard_depth_limit_is_an_error() {
        let mut log = vec![creation("tok_0", "src", 100, 0, 1.0, &[])];
        for i in 1..=12u64 {
            let parent = format!("tok_{}", i - 1);
            log.push(creation(
                &format!("tok_{}", i),
                "q",
                100 + i,
                i,
                1.0,
                &[(parent.as_str(), 1.0, 1.0)],
            ));
        }
        let graph = TokenGraph::from_log(&log);
        let report = validate(&graph, "tok_12", DepthLimits { warn: 5, hard: 10 });
        assert!(report.has_error(LineageIssueKind::PerformanceLimit));
    }
}
