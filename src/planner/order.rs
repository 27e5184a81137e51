//! Topological ordering.
//!
//! Kahn's algorithm over index-based dependency sets. When several nodes are
//! ready at once the one with the smallest key runs first, which makes every
//! order deterministic. Nodes left over once no node is ready form at least
//! one cycle; [`find_cycle`] walks them to report a concrete path.

use std::collections::BTreeSet;

use crate::error::PlanError;
use crate::model::ResourceAddress;

use super::graph::DependencyGraph;

/// Orders nodes so every node comes after all of its dependencies.
///
/// `dependencies[i]` holds the nodes `i` depends on. Returns the cycle path
/// (first node repeated at the end) if no complete order exists.
pub(crate) fn kahn<K, F>(dependencies: &[BTreeSet<usize>], key: F) -> Result<Vec<usize>, Vec<usize>>
where
    K: Ord,
    F: Fn(usize) -> K,
{
    let count = dependencies.len();
    let mut indegree: Vec<usize> = dependencies.iter().map(BTreeSet::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
    for (node, deps) in dependencies.iter().enumerate() {
        for &dep in deps {
            dependents[dep].push(node);
        }
    }

    let mut ready: BTreeSet<(K, usize)> = (0..count)
        .filter(|&node| indegree[node] == 0)
        .map(|node| (key(node), node))
        .collect();

    let mut order = Vec::with_capacity(count);
    while let Some((_, next)) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.insert((key(dependent), dependent));
            }
        }
    }

    if order.len() == count {
        return Ok(order);
    }

    let emitted: BTreeSet<usize> = order.into_iter().collect();
    Err(find_cycle(dependencies, &emitted, &key))
}

/// Follows unemitted dependencies from the lowest-keyed leftover node until a
/// node repeats. Every leftover node has at least one leftover dependency, so
/// the walk always closes a cycle.
fn find_cycle<K, F>(dependencies: &[BTreeSet<usize>], emitted: &BTreeSet<usize>, key: &F) -> Vec<usize>
where
    K: Ord,
    F: Fn(usize) -> K,
{
    let leftover = |node: &usize| !emitted.contains(node);

    let Some(start) = (0..dependencies.len()).filter(leftover).min_by_key(|&n| key(n)) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut current = start;
    loop {
        let Some(next) = dependencies[current]
            .iter()
            .copied()
            .filter(leftover)
            .min_by_key(|&n| key(n))
        else {
            return path;
        };

        if let Some(pos) = path.iter().position(|&n| n == next) {
            let mut cycle = path.split_off(pos);
            cycle.push(next);
            return cycle;
        }
        path.push(next);
        current = next;
    }
}

impl DependencyGraph {
    /// Returns nodes with dependencies first, ties broken by node order.
    ///
    /// # Errors
    ///
    /// Returns `CyclicDependency` with the full cycle path.
    pub fn creation_order(&self) -> Result<Vec<ResourceAddress>, PlanError> {
        let order = kahn(self.dependency_sets(), |node| node).map_err(|cycle| {
            PlanError::CyclicDependency {
                cycle: cycle.into_iter().map(|n| self.node(n).to_string()).collect(),
            }
        })?;
        Ok(order.into_iter().map(|n| self.node(n).clone()).collect())
    }

    /// Returns the exact reverse of [`Self::creation_order`]: dependents
    /// before the resources they depend on.
    ///
    /// # Errors
    ///
    /// Returns `CyclicDependency` with the full cycle path.
    pub fn deletion_order(&self) -> Result<Vec<ResourceAddress>, PlanError> {
        let mut order = self.creation_order()?;
        order.reverse();
        Ok(order)
    }

    /// Groups nodes into waves. Every node in a wave depends only on nodes
    /// of earlier waves, so a wave may run concurrently.
    ///
    /// # Errors
    ///
    /// Returns `CyclicDependency` with the full cycle path.
    pub fn levels(&self) -> Result<Vec<Vec<ResourceAddress>>, PlanError> {
        let order = self.creation_order()?;
        let mut depth = vec![0usize; self.len()];
        let mut levels: Vec<Vec<usize>> = Vec::new();

        for address in &order {
            let Some(node) = self.index_of(address) else {
                continue;
            };
            let level = self.dependency_sets()[node]
                .iter()
                .map(|&dep| depth[dep] + 1)
                .max()
                .unwrap_or(0);
            depth[node] = level;
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(node);
        }

        Ok(levels
            .into_iter()
            .map(|mut wave| {
                wave.sort_unstable();
                wave.into_iter().map(|n| self.node(n).clone()).collect()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttributeValue, Resource, ResourceModel};

    fn addr(text: &str) -> ResourceAddress {
        ResourceAddress::parse(text).unwrap()
    }

    fn rendered(order: &[ResourceAddress]) -> Vec<String> {
        order.iter().map(ToString::to_string).collect()
    }

    fn sets(edges: &[&[usize]]) -> Vec<BTreeSet<usize>> {
        edges.iter().map(|deps| deps.iter().copied().collect()).collect()
    }

    #[test]
    fn test_kahn_prefers_smallest_key() {
        // 2 depends on 0; 1 and 0 are free.
        let deps = sets(&[&[], &[], &[0]]);
        assert_eq!(kahn(&deps, |n| n), Ok(vec![0, 1, 2]));
        assert_eq!(kahn(&deps, |n| std::cmp::Reverse(n)), Ok(vec![1, 0, 2]));
    }

    #[test]
    fn test_kahn_reports_cycle_path() {
        // 0 -> 1 -> 2 -> 0, and 3 hangs off the cycle.
        let deps = sets(&[&[1], &[2], &[0], &[0]]);
        assert_eq!(kahn(&deps, |n| n), Err(vec![0, 1, 2, 0]));
    }

    #[test]
    fn test_kahn_reports_self_loop() {
        let deps = sets(&[&[], &[1]]);
        assert_eq!(kahn(&deps, |n| n), Err(vec![1, 1]));
    }

    fn network_model() -> ResourceModel {
        let vpc = addr("aws_vpc.main");
        ResourceModel::from_resources([
            Resource::new("aws_vpc", "main")
                .with_attribute("cidr_block", AttributeValue::string("10.0.0.0/16")),
            Resource::new("aws_subnet", "b")
                .with_attribute("vpc_id", AttributeValue::reference(vpc.clone(), "id")),
            Resource::new("aws_internet_gateway", "gw")
                .with_attribute("vpc_id", AttributeValue::reference(vpc.clone(), "id")),
            Resource::new("aws_subnet", "a")
                .with_attribute("vpc_id", AttributeValue::reference(vpc, "id")),
            Resource::new("aws_route_table_association", "a")
                .with_attribute(
                    "subnet_id",
                    AttributeValue::reference(addr("aws_subnet.a"), "id"),
                ),
        ])
        .unwrap()
    }

    #[test]
    fn test_creation_order_respects_edges_and_declaration() {
        let graph = DependencyGraph::build(&network_model()).unwrap();
        let order = graph.creation_order().unwrap();

        assert_eq!(
            rendered(&order),
            [
                "aws_vpc.main",
                "aws_subnet.b",
                "aws_internet_gateway.gw",
                "aws_subnet.a",
                "aws_route_table_association.a",
            ]
        );

        for edge in graph.edges() {
            let from = order.iter().position(|a| *a == edge.from).unwrap();
            let to = order.iter().position(|a| *a == edge.to).unwrap();
            assert!(to < from, "{} must come before {}", edge.to, edge.from);
        }
    }

    #[test]
    fn test_deletion_order_is_exact_reverse() {
        let graph = DependencyGraph::build(&network_model()).unwrap();
        let mut forward = graph.creation_order().unwrap();
        forward.reverse();
        assert_eq!(graph.deletion_order().unwrap(), forward);
    }

    #[test]
    fn test_levels_group_independent_nodes() {
        let graph = DependencyGraph::build(&network_model()).unwrap();
        let levels: Vec<Vec<String>> = graph
            .levels()
            .unwrap()
            .iter()
            .map(|wave| rendered(wave))
            .collect();

        assert_eq!(
            levels,
            vec![
                vec![String::from("aws_vpc.main")],
                vec![
                    String::from("aws_subnet.b"),
                    String::from("aws_internet_gateway.gw"),
                    String::from("aws_subnet.a"),
                ],
                vec![String::from("aws_route_table_association.a")],
            ]
        );
    }
}
