//! Overlap analysis for resource claims.
//!
//! The lock table arbitrates claims by exact string, so `src/**` and
//! `src/lib.rs` are independent locks. [`ResourceMatcher`] recognises such
//! pairs through glob matching and path ancestry, letting `plan` flag nodes
//! that may run side by side and later collide at merge time.

use crate::graph::DependencyGraph;
use droidforge_core::{ExecutionPlan, NodeId};
use glob::Pattern;
use serde::{Deserialize, Serialize};

const GLOB_CHARS: [char; 4] = ['*', '?', '[', '{'];

/// Two concurrently runnable nodes whose claims cover common paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimOverlap {
    pub first: NodeId,
    pub first_claim: String,
    pub second: NodeId,
    pub second_claim: String,
}

/// Glob and hierarchy aware comparison of claims
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceMatcher;

impl ResourceMatcher {
    /// Whether two claims can name a common path.
    pub fn overlaps(self, first: &str, second: &str) -> bool {
        let left = normalize(first);
        let right = normalize(second);
        if left == right {
            return true;
        }

        for (pattern, path) in [(&left, &right), (&right, &left)] {
            if is_glob(pattern)
                && (Pattern::new(pattern).is_ok_and(|glob| glob.matches(path))
                    || self.is_ancestor(&base_directory(pattern), path))
            {
                return true;
            }
        }

        if self.is_ancestor(&left, &right) || self.is_ancestor(&right, &left) {
            return true;
        }

        if is_glob(&left) && is_glob(&right) {
            let left_base = base_directory(&left);
            let right_base = base_directory(&right);
            return self.is_ancestor(&left_base, &right_base)
                || self.is_ancestor(&right_base, &left_base);
        }
        false
    }

    /// Whether `descendant` equals `ancestor` or lies below it. Glob suffixes are ignored.
    pub fn is_ancestor(self, ancestor: &str, descendant: &str) -> bool {
        let ancestor = normalize(&strip_globs(ancestor));
        let descendant = normalize(&strip_globs(descendant));

        if ancestor.is_empty() || ancestor == "." || ancestor == "/" {
            return true;
        }
        if descendant == ancestor {
            return true;
        }
        descendant
            .strip_prefix(ancestor.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Overlapping claims between nodes that may run at the same time.
    ///
    /// Pairs where neither node writes are compatible and skipped, as are
    /// nodes ordered by the dependency graph and claims that are the same
    /// string (those already contend for one lock).
    pub fn plan_overlaps(self, plan: &ExecutionPlan, graph: &DependencyGraph) -> Vec<ClaimOverlap> {
        let mut overlaps = Vec::new();
        for (position, first) in plan.nodes.iter().enumerate() {
            for second in plan.nodes.iter().skip(position + 1) {
                let exclusive = first.lock_mode().is_exclusive() || second.lock_mode().is_exclusive();
                if !exclusive || graph.is_ordered(&first.node_id, &second.node_id) {
                    continue;
                }
                for first_claim in &first.resource_claims {
                    for second_claim in &second.resource_claims {
                        if first_claim != second_claim && self.overlaps(first_claim, second_claim) {
                            overlaps.push(ClaimOverlap {
                                first: first.node_id.clone(),
                                first_claim: first_claim.clone(),
                                second: second.node_id.clone(),
                                second_claim: second_claim.clone(),
                            });
                        }
                    }
                }
            }
        }
        overlaps
    }
}

fn is_glob(claim: &str) -> bool {
    claim.contains(GLOB_CHARS)
}

/// Drop everything from the first glob character on, and any trailing separators.
fn strip_globs(claim: &str) -> String {
    let literal = claim.find(GLOB_CHARS).map_or(claim, |index| &claim[..index]);
    literal.trim_end_matches(['/', '\\']).to_owned()
}

fn base_directory(pattern: &str) -> String {
    let base = strip_globs(pattern);
    if base.is_empty() { ".".to_owned() } else { base }
}

/// Forward slashes, no leading `./`, `.` and `..` segments folded lexically.
fn normalize(claim: &str) -> String {
    let unified = claim.replace('\\', "/");
    let absolute = unified.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|last| *last != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_owned(),
        (false, false) => joined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use droidforge_core::{LockMode, PlanNode};

    #[test]
    fn test_globs_overlap_the_paths_they_cover() {
        let matcher = ResourceMatcher;
        assert!(matcher.overlaps("src/**", "src/api/server.rs"));
        assert!(matcher.overlaps("src/api/server.rs", "src/**"));
        assert!(matcher.overlaps("src/*.rs", "src/lib.rs"));
        assert!(matcher.overlaps("src/**", "src/**/*.rs"));
        assert!(matcher.overlaps("src/api/**", "src/**"));
    }

    #[test]
    fn test_hierarchy_and_normalization() {
        let matcher = ResourceMatcher;
        assert!(matcher.overlaps("src", "src/api/server.rs"));
        assert!(matcher.overlaps("src/api", "src"));
        assert!(matcher.overlaps("./src/lib.rs", "src/lib.rs"));
        assert!(matcher.overlaps("src/api/../lib.rs", "src/lib.rs"));
        assert!(matcher.is_ancestor(".", "anything/at/all"));
        assert!(!matcher.is_ancestor("src/api", "src/apis/mod.rs"));
    }

    #[test]
    fn test_disjoint_claims() {
        let matcher = ResourceMatcher;
        assert!(!matcher.overlaps("src/**", "tests/**"));
        assert!(!matcher.overlaps("src/api", "src/lib"));
        assert!(!matcher.overlaps("src/a.rs", "src/b.rs"));
    }

    #[test]
    fn test_plan_overlaps_skip_ordered_and_shared_nodes() {
        let plan = ExecutionPlan::new(vec![
            PlanNode::new("wide", "droid").with_claims(["src/**"]),
            PlanNode::new("narrow", "droid").with_claims(["src/lib.rs"]),
            PlanNode::new("after", "droid").with_claims(["src/main.rs"]),
            PlanNode::new("reader", "droid")
                .with_mode(LockMode::Read)
                .with_claims(["src/lib.rs"]),
            PlanNode::new("auditor", "droid")
                .with_mode(LockMode::Analysis)
                .with_claims(["src/**"]),
        ])
        .with_edge("wide", "after");
        let graph = DependencyGraph::from_plan(&plan);

        let found = ResourceMatcher.plan_overlaps(&plan, &graph);
        let pairs: Vec<(&str, &str)> = found
            .iter()
            .map(|overlap| (overlap.first.as_str(), overlap.second.as_str()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("wide", "narrow"),
                ("wide", "reader"),
                ("narrow", "auditor"),
                ("after", "auditor"),
            ]
        );
    }
}
