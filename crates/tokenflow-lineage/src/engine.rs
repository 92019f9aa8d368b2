use crate::graph::TokenGraph;
use crate::query::{self, AncestorInfo, GraphStats};
use crate::validate::{self, DepthLimits, LineageReport};
use crate::contributions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokenflow_types::LogEntry;

/// Everything known about one token's place in the flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Lineage {
    pub token_id: String,
    /// Longest chain back to a root.
    pub generation_level: u32,
    pub ultimate_sources: Vec<String>,
    pub ancestors: Vec<AncestorInfo>,
    pub descendants: Vec<AncestorInfo>,
    /// Ancestors by distance; level 0 is the token itself.
    pub generations: BTreeMap<u32, Vec<String>>,
    /// Root token id -> proportional contribution, clipped to [0, 1].
    pub source_contributions: BTreeMap<String, f64>,
}

impl Lineage {
    /// Every token id this lineage depends on, used as the cache
    /// invalidation set.
    pub fn dependency_ids(&self) -> impl Iterator<Item = &str> {
        self.ancestors
            .iter()
            .chain(self.descendants.iter())
            .map(|info| info.token_id.as_str())
            .chain(std::iter::once(self.token_id.as_str()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LineageConfig {
    pub depth_limits: DepthLimits,
    /// Bound for path enumeration during contribution analysis.
    pub max_path_depth: usize,
}

impl Default for LineageConfig {
    fn default() -> Self {
        Self {
            depth_limits: DepthLimits::default(),
            max_path_depth: 64,
        }
    }
}

/// Pure query facade over one immutable graph snapshot. Rebuild from a
/// fresh log snapshot to observe later ticks; never mutated in place.
#[derive(Debug, Clone)]
pub struct LineageEngine {
    graph: TokenGraph,
    config: LineageConfig,
}

impl LineageEngine {
    pub fn from_log(entries: &[LogEntry]) -> Self {
        Self::with_config(entries, LineageConfig::default())
    }

    pub fn with_config(entries: &[LogEntry], config: LineageConfig) -> Self {
        Self {
            graph: TokenGraph::from_log(entries),
            config,
        }
    }

    pub fn graph(&self) -> &TokenGraph {
        &self.graph
    }

    /// The complete lineage of a token, or `None` when it never appeared
    /// in the log.
    pub fn lineage(&self, token_id: &str) -> Option<Lineage> {
        if !self.graph.contains(token_id) {
            return None;
        }

        let ancestors = query::ancestors(&self.graph, token_id);
        let generation_level = query::generation_depth(&self.graph, token_id);
        let mut ultimate_sources: Vec<String> = ancestors
            .iter()
            .filter(|a| a.is_root)
            .map(|a| a.token_id.clone())
            .collect();
        if ultimate_sources.is_empty() && self.graph.is_root(token_id) {
            ultimate_sources.push(token_id.to_string());
        }
        ultimate_sources.sort();

        Some(Lineage {
            token_id: token_id.to_string(),
            generation_level,
            ultimate_sources,
            descendants: query::descendants(&self.graph, token_id),
            generations: query::generations(&self.graph, token_id),
            source_contributions: contributions::contributions(
                &self.graph,
                token_id,
                self.config.max_path_depth,
            ),
            ancestors,
        })
    }

    pub fn ancestors(&self, token_id: &str) -> Vec<AncestorInfo> {
        query::ancestors(&self.graph, token_id)
    }

    pub fn descendants(&self, token_id: &str) -> Vec<AncestorInfo> {
        query::descendants(&self.graph, token_id)
    }

    pub fn contributions(&self, token_id: &str) -> BTreeMap<String, f64> {
        contributions::contributions(&self.graph, token_id, self.config.max_path_depth)
    }

    pub fn validate(&self, token_id: &str) -> LineageReport {
        validate::validate(&self.graph, token_id, self.config.depth_limits)
    }

    pub fn stats(&self) -> GraphStats {
        query::stats(&self.graph)
    }
}
