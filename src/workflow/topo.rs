//! Stable Topological Ordering
//!
//! Kahn's algorithm with a name-sorted ready set: whenever several nodes are
//! ready at once, the smallest name goes first. Step numbering and graph
//! construction both use this one traversal, so they always agree on order.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

/// Result of a successful sort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopoOrder {
    /// Nodes, parents before children
    pub order: Vec<String>,
    /// Longest path from any source, sources at 0
    pub levels: BTreeMap<String, usize>,
}

/// Sorts `nodes` along `edges` (`(from, to)` pairs).
///
/// Edges touching unknown nodes are ignored. On a cycle, returns the sorted
/// names of every node that could not be ordered.
pub fn stable_order<'a, N, E>(nodes: N, edges: E) -> Result<TopoOrder, Vec<String>>
where
    N: IntoIterator<Item = &'a str>,
    E: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut in_degree: BTreeMap<&str, usize> = nodes.into_iter().map(|n| (n, 0)).collect();
    let mut successors: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

    for (from, to) in edges {
        if !in_degree.contains_key(from) || !in_degree.contains_key(to) {
            continue;
        }
        if successors.entry(from).or_default().insert(to) {
            if let Some(degree) = in_degree.get_mut(to) {
                *degree += 1;
            }
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();

    let mut order = Vec::with_capacity(in_degree.len());
    let mut levels: BTreeMap<String, usize> = BTreeMap::new();

    while let Some(current) = ready.pop_first() {
        let level = levels.get(current).copied().unwrap_or(0);
        levels.insert(current.to_string(), level);
        order.push(current.to_string());

        for next in successors.get(current).into_iter().flatten() {
            let entry = levels.entry(next.to_string()).or_insert(0);
            *entry = (*entry).max(level + 1);

            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(*next);
                }
            }
        }
    }

    if order.len() != in_degree.len() {
        let remaining: Vec<String> = in_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(name, _)| name.to_string())
            .collect();
        return Err(remaining);
    }

    debug!("Topological order: {:?}", order);
    Ok(TopoOrder { order, levels })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sort(nodes: &[&str], edges: &[(&str, &str)]) -> Result<TopoOrder, Vec<String>> {
        stable_order(nodes.iter().copied(), edges.iter().copied())
    }

    #[test]
    fn test_ties_broken_by_name() {
        let result = sort(&["c", "a", "b"], &[]).unwrap();
        assert_eq!(result.order, vec!["a", "b", "c"]);
        assert!(result.levels.values().all(|l| *l == 0));
    }

    #[test]
    fn test_parents_before_children() {
        let edges = [("a", "c"), ("b", "c"), ("c", "d"), ("a", "d")];
        let result = sort(&["d", "c", "b", "a"], &edges).unwrap();
        assert_eq!(result.order, vec!["a", "b", "c", "d"]);

        let position = |n: &str| result.order.iter().position(|x| x == n).unwrap();
        for (from, to) in edges {
            assert!(position(from) < position(to));
        }
    }

    #[test]
    fn test_levels_use_longest_path() {
        // a -> b -> c and a -> c: c sits at level 2, not 1
        let result = sort(&["a", "b", "c"], &[("a", "b"), ("b", "c"), ("a", "c")]).unwrap();
        assert_eq!(result.levels["a"], 0);
        assert_eq!(result.levels["b"], 1);
        assert_eq!(result.levels["c"], 2);
    }

    #[test]
    fn test_ready_set_order_is_global() {
        // z is ready first; once done, a becomes ready and still sorts before y
        let result = sort(&["z", "y", "a"], &[("z", "a"), ("y", "a")]).unwrap();
        assert_eq!(result.order, vec!["y", "z", "a"]);
    }

    #[test]
    fn test_cycle_detected() {
        let err = sort(&["a", "b", "c"], &[("a", "b"), ("b", "a"), ("b", "c")]).unwrap_err();
        assert_eq!(err, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let err = sort(&["a", "b"], &[("a", "a")]).unwrap_err();
        assert_eq!(err, vec!["a"]);
    }

    #[test]
    fn test_duplicate_and_unknown_edges_ignored() {
        let result = sort(&["a", "b"], &[("a", "b"), ("a", "b"), ("x", "b")]).unwrap();
        assert_eq!(result.order, vec!["a", "b"]);
    }
}
