// Lineage crate - derives token ancestry from the activity log
// This layer sits between the kernel's log and anything that asks "where
// did this value come from": pure queries over a graph snapshot, plus a
// cache for repeated lookups

pub mod cache;
mod contributions;
mod engine;
mod graph;
mod query;
mod validate;

pub use cache::{CacheConfig, CacheStats, EvictionStrategy, LineageCache};
pub use contributions::contributions;
pub use engine::{Lineage, LineageConfig, LineageEngine};
pub use graph::{GraphNode, TokenGraph};
pub use query::{
    ancestors, descendants, find_cycles, generation_depth, generations, paths, stats,
    AncestorInfo, GraphStats,
};
pub use validate::{validate, DepthLimits, LineageIssue, LineageIssueKind, LineageReport};
