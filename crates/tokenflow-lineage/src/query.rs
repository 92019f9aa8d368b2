use crate::graph::TokenGraph;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};

/// One ancestor (or descendant) reached from the target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AncestorInfo {
    pub token_id: String,
    /// Fewest edges between the target and this token.
    pub generation_level: u32,
    pub is_root: bool,
    /// One shortest path from the target to this token, inclusive.
    pub path: Vec<String>,
}

/// All ancestors of `target`, breadth-first so each token is visited once
/// at its minimum generation level. Cycles terminate through the visited
/// set; recursion stops at roots.
pub fn ancestors(graph: &TokenGraph, target: &str) -> Vec<AncestorInfo> {
    walk(graph, target, |g, id| g.sources_of(id), |g, id| g.is_root(id))
}

/// All descendants of `target`; symmetric to [`ancestors`], leaves are
/// reported as terminal.
pub fn descendants(graph: &TokenGraph, target: &str) -> Vec<AncestorInfo> {
    walk(
        graph,
        target,
        |g, id| g.derived_from(id),
        |g, id| g.contains(id) && g.derived_from(id).is_empty(),
    )
}

fn walk<'g>(
    graph: &'g TokenGraph,
    target: &str,
    next: impl Fn(&'g TokenGraph, &str) -> &'g [String],
    is_terminal: impl Fn(&TokenGraph, &str) -> bool,
) -> Vec<AncestorInfo> {
    let mut found = Vec::new();
    if !graph.contains(target) {
        return found;
    }

    let mut visited: HashSet<String> = HashSet::from([target.to_string()]);
    let mut queue: VecDeque<(String, u32, Vec<String>)> =
        VecDeque::from([(target.to_string(), 0, vec![target.to_string()])]);

    while let Some((current, level, path)) = queue.pop_front() {
        for neighbor in next(graph, &current) {
            if !visited.insert(neighbor.clone()) {
                continue;
            }
            let mut neighbor_path = path.clone();
            neighbor_path.push(neighbor.clone());
            found.push(AncestorInfo {
                token_id: neighbor.clone(),
                generation_level: level + 1,
                is_root: is_terminal(graph, neighbor),
                path: neighbor_path.clone(),
            });
            queue.push_back((neighbor.clone(), level + 1, neighbor_path));
        }
    }

    found
}

/// Ancestors grouped by generation distance; level 0 is the target itself.
pub fn generations(graph: &TokenGraph, target: &str) -> BTreeMap<u32, Vec<String>> {
    let mut by_level: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    if !graph.contains(target) {
        return by_level;
    }
    by_level.insert(0, vec![target.to_string()]);
    for info in ancestors(graph, target) {
        by_level
            .entry(info.generation_level)
            .or_default()
            .push(info.token_id);
    }
    by_level
}

/// Every simple path from `from` down to `to`, bounded by `max_depth`
/// edges. Paths are returned in discovery order, each inclusive of both
/// endpoints.
pub fn paths(graph: &TokenGraph, from: &str, to: &str, max_depth: usize) -> Vec<Vec<String>> {
    let mut results = Vec::new();
    if !graph.contains(from) || !graph.contains(to) {
        return results;
    }

    let mut current = vec![from.to_string()];
    let mut on_path: HashSet<String> = HashSet::from([from.to_string()]);
    dfs_paths(graph, from, to, max_depth, &mut current, &mut on_path, &mut results);
    results
}

fn dfs_paths(
    graph: &TokenGraph,
    current: &str,
    to: &str,
    max_depth: usize,
    path: &mut Vec<String>,
    on_path: &mut HashSet<String>,
    results: &mut Vec<Vec<String>>,
) {
    if current == to {
        results.push(path.clone());
        return;
    }
    if path.len() > max_depth {
        return;
    }
    for next in graph.derived_from(current) {
        if on_path.contains(next) {
            continue;
        }
        path.push(next.clone());
        on_path.insert(next.clone());
        dfs_paths(graph, next, to, max_depth, path, on_path, results);
        on_path.remove(next);
        path.pop();
    }
}

/// Tri-colour DFS over the whole graph; returns each cycle found as the
/// token sequence closing back on its first element.
pub fn find_cycles(graph: &TokenGraph) -> Vec<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Colour {
        White,
        Grey,
        Black,
    }

    let mut colour: BTreeMap<&str, Colour> =
        graph.token_ids().map(|id| (id, Colour::White)).collect();
    let mut cycles = Vec::new();

    fn visit<'g>(
        graph: &'g TokenGraph,
        id: &'g str,
        colour: &mut BTreeMap<&'g str, Colour>,
        stack: &mut Vec<String>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        colour.insert(id, Colour::Grey);
        stack.push(id.to_string());

        for next in graph.derived_from(id) {
            match colour.get(next.as_str()).copied().unwrap_or(Colour::Black) {
                Colour::White => visit(graph, next, colour, stack, cycles),
                Colour::Grey => {
                    // Back edge: the cycle is the stack suffix from `next`.
                    if let Some(start) = stack.iter().position(|t| t == next) {
                        let mut cycle = stack[start..].to_vec();
                        cycle.push(next.clone());
                        cycles.push(cycle);
                    }
                }
                Colour::Black => {}
            }
        }

        stack.pop();
        colour.insert(id, Colour::Black);
    }

    let ids: Vec<&str> = graph.token_ids().collect();
    let mut stack = Vec::new();
    for id in ids {
        if colour.get(id).copied() == Some(Colour::White) {
            visit(graph, id, &mut colour, &mut stack, &mut cycles);
        }
    }

    cycles
}

/// Longest chain from `target` back to a root, the token's generation
/// level. Cycle-safe: an edge back onto the current path is skipped.
pub fn generation_depth(graph: &TokenGraph, target: &str) -> u32 {
    fn depth(
        graph: &TokenGraph,
        id: &str,
        on_path: &mut HashSet<String>,
        memo: &mut BTreeMap<String, u32>,
    ) -> u32 {
        if let Some(&known) = memo.get(id) {
            return known;
        }
        let mut best = 0;
        for source in graph.sources_of(id) {
            if on_path.contains(source) {
                continue;
            }
            on_path.insert(source.clone());
            best = best.max(1 + depth(graph, source, on_path, memo));
            on_path.remove(source);
        }
        memo.insert(id.to_string(), best);
        best
    }

    if !graph.contains(target) {
        return 0;
    }
    let mut on_path = HashSet::from([target.to_string()]);
    depth(graph, target, &mut on_path, &mut BTreeMap::new())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GraphStats {
    pub tokens: usize,
    pub edges: usize,
    pub roots: usize,
    pub leaves: usize,
    /// Longest ancestor chain found from any leaf.
    pub max_generation: u32,
}

pub fn stats(graph: &TokenGraph) -> GraphStats {
    let max_generation = graph
        .leaves()
        .iter()
        .flat_map(|leaf| ancestors(graph, leaf))
        .map(|a| a.generation_level)
        .max()
        .unwrap_or(0);

    GraphStats {
        tokens: graph.len(),
        edges: graph.edge_count(),
        roots: graph.roots().len(),
        leaves: graph.leaves().len(),
        max_generation,
    }
}
