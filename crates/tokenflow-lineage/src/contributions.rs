use crate::graph::TokenGraph;
use std::collections::{BTreeMap, HashSet};

/// Proportional contribution of every root ancestor to `target`.
///
/// For each root, every simple path from the root down to the target is
/// enumerated; the path's weight is the product of its edge weights (each
/// defined by the downstream operation: `1/n` for averages, `v_in/v_out`
/// for sums and transformations, 1 on the chosen branch of first/last).
/// Path weights are summed per root and the total clipped to `[0, 1]`.
pub fn contributions(
    graph: &TokenGraph,
    target: &str,
    max_depth: usize,
) -> BTreeMap<String, f64> {
    let mut totals: BTreeMap<String, f64> = BTreeMap::new();
    if !graph.contains(target) {
        return totals;
    }

    if graph.is_root(target) {
        totals.insert(target.to_string(), 1.0);
        return totals;
    }

    let mut on_path = HashSet::from([target.to_string()]);
    accumulate(graph, target, 1.0, max_depth, &mut on_path, &mut totals);

    for total in totals.values_mut() {
        *total = total.clamp(0.0, 1.0);
    }
    totals
}

/// Walk upward from `current`, multiplying edge weights, adding the product
/// into the root's bucket whenever a root is reached.
fn accumulate(
    graph: &TokenGraph,
    current: &str,
    weight_so_far: f64,
    depth_left: usize,
    on_path: &mut HashSet<String>,
    totals: &mut BTreeMap<String, f64>,
) {
    if depth_left == 0 {
        return;
    }
    for source in graph.sources_of(current) {
        if on_path.contains(source) {
            continue;
        }
        let edge = graph.edge_weight(source, current);
        let weight = weight_so_far * edge;
        if graph.is_root(source) {
            *totals.entry(source.clone()).or_insert(0.0) += weight;
            continue;
        }
        on_path.insert(source.clone());
        accumulate(graph, source, weight, depth_left - 1, on_path, totals);
        on_path.remove(source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testutil::creation;

    #[test]
    fn test_diamond_converges_to_one() {
        // root feeds two averaging branches that an averaging combinator
        // merges: 0.5 + 0.5 = 1.0 back to the single root.
        let graph = TokenGraph::from_log(&[
            creation("root", "src", 100, 0, 10.0, &[]),
            creation("a", "q1", 200, 1, 10.0, &[("root", 10.0, 1.0)]),
            creation("b", "q2", 200, 2, 10.0, &[("root", 10.0, 1.0)]),
            creation(
                "final",
                "proc",
                300,
                3,
                10.0,
                &[("a", 10.0, 0.5), ("b", 10.0, 0.5)],
            ),
        ]);

        let totals = contributions(&graph, "final", 32);
        assert_eq!(totals.len(), 1);
        assert!((totals["root"] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_average_splits_equally() {
        let graph = TokenGraph::from_log(&[
            creation("r1", "s1", 100, 0, 20.0, &[]),
            creation("r2", "s2", 100, 1, 30.0, &[]),
            creation(
                "avg",
                "q",
                200,
                2,
                25.0,
                &[("r1", 20.0, 0.5), ("r2", 30.0, 0.5)],
            ),
        ]);
        let totals = contributions(&graph, "avg", 32);
        assert_eq!(totals.len(), 2);
        assert!((totals["r1"] - 0.5).abs() < 1e-12);
        assert!((totals["r2"] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_weights_multiply_along_paths() {
        // r -> mid (weight 0.5) -> top (weight 0.5): contribution 0.25.
        let graph = TokenGraph::from_log(&[
            creation("r", "s1", 100, 0, 10.0, &[]),
            creation("other", "s2", 100, 1, 10.0, &[]),
            creation(
                "mid",
                "q1",
                200,
                2,
                10.0,
                &[("r", 10.0, 0.5), ("other", 10.0, 0.5)],
            ),
            creation(
                "top",
                "q2",
                300,
                3,
                10.0,
                &[("mid", 10.0, 0.5), ("other", 10.0, 0.5)],
            ),
        ]);
        let totals = contributions(&graph, "top", 32);
        assert!((totals["r"] - 0.25).abs() < 1e-12);
        // `other` contributes directly (0.5) and through mid (0.25).
        assert!((totals["other"] - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_root_target_contributes_itself() {
        let graph = TokenGraph::from_log(&[creation("r", "s1", 100, 0, 1.0, &[])]);
        let totals = contributions(&graph, "r", 32);
        assert_eq!(totals["r"], 1.0);
    }

    #[test]
    fn test_totals_clip_to_unit_interval() {
        // A count-style weight of 1 per source on both branches would sum
        // to 2 without clipping.
        let graph = TokenGraph::from_log(&[
            creation("r", "s1", 100, 0, 1.0, &[]),
            creation("a", "q1", 200, 1, 1.0, &[("r", 1.0, 1.0)]),
            creation("b", "q2", 200, 2, 1.0, &[("r", 1.0, 1.0)]),
            creation(
                "top",
                "q3",
                300,
                3,
                2.0,
                &[("a", 1.0, 1.0), ("b", 1.0, 1.0)],
            ),
        ]);
        let totals = contributions(&graph, "top", 32);
        assert_eq!(totals["r"], 1.0);
    }

    #[test]
    fn test_cycle_terminates() {
        let graph = TokenGraph::from_log(&[
            creation("A", "n1", 100, 0, 1.0, &[("B", 1.0, 1.0)]),
            creation("B", "n2", 200, 1, 1.0, &[("A", 1.0, 1.0)]),
        ]);
        // Neither is a root; traversal must terminate with no totals.
        let totals = contributions(&graph, "A", 32);
        assert!(totals.is_empty());
    }
}
