//! Dependency graph construction.
//!
//! Edges point from a consumer to the resource it needs: a subnet whose
//! `vpc_id` references `aws_vpc.main` yields the edge
//! `aws_subnet.a -> aws_vpc.main`. Edges are built once, as data, and every
//! later stage reads them from here.

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::error::PlanError;
use crate::model::{ResourceAddress, ResourceModel};
use crate::state::ObservedState;

/// Why an edge exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// An attribute references an output of the target.
    Reference,
    /// Declared with `depends_on`.
    Explicit,
    /// Recorded in state by an earlier apply.
    Recorded,
}

/// A directed dependency edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// Dependent resource.
    pub from: ResourceAddress,
    /// Resource depended upon.
    pub to: ResourceAddress,
    /// Origin of the edge.
    pub kind: EdgeKind,
}

/// Directed dependency graph over resource addresses.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<ResourceAddress>,
    index: HashMap<ResourceAddress, usize>,
    edges: Vec<Edge>,
    dependencies: Vec<BTreeSet<usize>>,
}

impl DependencyGraph {
    /// Builds the graph of the declared resources.
    ///
    /// Nodes keep declaration order. Fails before returning if any reference
    /// points at an undeclared address or the edges form a cycle.
    ///
    /// # Errors
    ///
    /// Returns `UnknownReference` or `CyclicDependency`.
    pub fn build(model: &ResourceModel) -> Result<Self, PlanError> {
        let mut graph = Self::with_nodes(model.iter().map(|r| r.address.clone()));

        for resource in model.iter() {
            let references = resource
                .attributes
                .values()
                .flat_map(|value| value.references())
                .map(|reference| (&reference.address, EdgeKind::Reference));
            let explicit = resource
                .depends_on
                .iter()
                .map(|address| (address, EdgeKind::Explicit));

            for (target, kind) in references.chain(explicit) {
                if !model.contains(target) {
                    return Err(PlanError::UnknownReference {
                        from: resource.address.to_string(),
                        to: target.to_string(),
                    });
                }
                graph.add_edge(&resource.address, target, kind);
            }
        }

        // Surface cycles here so no later stage sees a cyclic graph.
        graph.creation_order()?;

        debug!(
            nodes = graph.len(),
            edges = graph.edges.len(),
            "Built dependency graph"
        );
        Ok(graph)
    }

    /// Builds the graph of the observed state from recorded dependencies.
    ///
    /// Nodes are ordered by the declaration index recorded at apply time,
    /// then by address. Dependencies on addresses that are no longer in the
    /// state are ignored.
    #[must_use]
    pub fn from_observed(state: &ObservedState) -> Self {
        let mut entries: Vec<_> = state.iter().collect();
        entries.sort_by(|a, b| a.ordinal.cmp(&b.ordinal).then_with(|| a.address.cmp(&b.address)));

        let mut graph = Self::with_nodes(entries.iter().map(|e| e.address.clone()));
        for entry in entries {
            for dependency in &entry.dependencies {
                if graph.contains(dependency) {
                    graph.add_edge(&entry.address, dependency, EdgeKind::Recorded);
                } else {
                    debug!("Ignoring recorded dependency {} -> {dependency}", entry.address);
                }
            }
        }
        graph
    }

    fn with_nodes(nodes: impl Iterator<Item = ResourceAddress>) -> Self {
        let nodes: Vec<ResourceAddress> = nodes.collect();
        let index = nodes.iter().enumerate().map(|(i, a)| (a.clone(), i)).collect();
        let dependencies = vec![BTreeSet::new(); nodes.len()];
        Self {
            nodes,
            index,
            edges: Vec::new(),
            dependencies,
        }
    }

    fn add_edge(&mut self, from: &ResourceAddress, to: &ResourceAddress, kind: EdgeKind) {
        let (Some(&f), Some(&t)) = (self.index.get(from), self.index.get(to)) else {
            return;
        };
        if self.dependencies[f].insert(t) {
            self.edges.push(Edge {
                from: from.clone(),
                to: to.clone(),
                kind,
            });
        }
    }

    /// Returns all edges, one per dependent/dependency pair.
    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Returns the nodes in graph order.
    #[must_use]
    pub fn nodes(&self) -> &[ResourceAddress] {
        &self.nodes
    }

    /// Returns true if the address is a node.
    #[must_use]
    pub fn contains(&self, address: &ResourceAddress) -> bool {
        self.index.contains_key(address)
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direct dependencies of an address.
    #[must_use]
    pub fn dependencies_of(&self, address: &ResourceAddress) -> Vec<&ResourceAddress> {
        self.index_of(address)
            .map(|i| self.dependencies[i].iter().map(|&d| &self.nodes[d]).collect())
            .unwrap_or_default()
    }

    /// Direct dependents of an address.
    #[must_use]
    pub fn dependents_of(&self, address: &ResourceAddress) -> Vec<&ResourceAddress> {
        let Some(target) = self.index_of(address) else {
            return Vec::new();
        };
        self.dependencies
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.contains(&target))
            .map(|(i, _)| &self.nodes[i])
            .collect()
    }

    pub(crate) fn index_of(&self, address: &ResourceAddress) -> Option<usize> {
        self.index.get(address).copied()
    }

    pub(crate) fn node(&self, index: usize) -> &ResourceAddress {
        &self.nodes[index]
    }

    pub(crate) fn dependency_sets(&self) -> &[BTreeSet<usize>] {
        &self.dependencies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttributeValue, Resource};
    use crate::state::ResourceState;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn addr(text: &str) -> ResourceAddress {
        ResourceAddress::parse(text).unwrap()
    }

    fn reference(target: &str) -> AttributeValue {
        AttributeValue::reference(addr(target), "id")
    }

    #[test]
    fn test_edges_from_references_and_depends_on() {
        let model = ResourceModel::from_resources([
            Resource::new("aws_vpc", "main"),
            Resource::new("aws_security_group", "web")
                .with_attribute("vpc_id", reference("aws_vpc.main")),
            Resource::new("aws_security_group_rule", "ingress")
                .with_attribute("security_group_id", reference("aws_security_group.web"))
                .with_attribute(
                    "cidr_blocks",
                    AttributeValue::List(vec![AttributeValue::string("10.0.0.0/8")]),
                ),
            Resource::new("aws_eip", "nat").depends_on(addr("aws_internet_gateway.gw")),
            Resource::new("aws_internet_gateway", "gw").with_attribute("vpc_id", reference("aws_vpc.main")),
        ])
        .unwrap();

        let graph = DependencyGraph::build(&model).unwrap();
        assert_eq!(graph.edges().len(), 4);
        assert!(graph.edges().contains(&Edge {
            from: addr("aws_eip.nat"),
            to: addr("aws_internet_gateway.gw"),
            kind: EdgeKind::Explicit,
        }));
        assert_eq!(
            graph.dependents_of(&addr("aws_vpc.main")),
            vec![&addr("aws_security_group.web"), &addr("aws_internet_gateway.gw")]
        );
    }

    #[test]
    fn test_nested_references_are_found() {
        let model = ResourceModel::from_resources([
            Resource::new("aws_security_group", "db"),
            Resource::new("aws_security_group", "app"),
            Resource::new("aws_instance", "web").with_attribute(
                "vpc_security_group_ids",
                AttributeValue::List(vec![
                    reference("aws_security_group.db"),
                    reference("aws_security_group.app"),
                ]),
            ),
        ])
        .unwrap();

        let graph = DependencyGraph::build(&model).unwrap();
        assert_eq!(graph.dependencies_of(&addr("aws_instance.web")).len(), 2);
    }

    #[test]
    fn test_unknown_reference() {
        let model = ResourceModel::from_resources([Resource::new("aws_subnet", "a")
            .with_attribute("vpc_id", reference("aws_vpc.missing"))])
        .unwrap();

        let err = DependencyGraph::build(&model).unwrap_err();
        assert!(matches!(
            err,
            PlanError::UnknownReference { ref from, ref to }
                if from == "aws_subnet.a" && to == "aws_vpc.missing"
        ));
    }

    #[test]
    fn test_cycle_reports_full_path() {
        let model = ResourceModel::from_resources([
            Resource::new("aws_security_group", "a")
                .with_attribute("peer", reference("aws_security_group.b")),
            Resource::new("aws_security_group", "b")
                .with_attribute("peer", reference("aws_security_group.c")),
            Resource::new("aws_security_group", "c").depends_on(addr("aws_security_group.a")),
        ])
        .unwrap();

        let err = DependencyGraph::build(&model).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cyclic dependency: aws_security_group.a -> aws_security_group.b -> aws_security_group.c -> aws_security_group.a"
        );
    }

    #[test]
    fn test_from_observed_ignores_missing_addresses() {
        let mut state = ObservedState::new();
        for (address, ordinal, deps) in [
            ("aws_vpc.main", 0, vec![]),
            ("aws_subnet.a", 1, vec!["aws_vpc.main", "aws_vpc.gone"]),
        ] {
            state.set(ResourceState {
                address: addr(address),
                id: String::from("x"),
                attributes: BTreeMap::new(),
                outputs: BTreeMap::new(),
                dependencies: deps.into_iter().map(addr).collect(),
                ordinal,
                fingerprint: String::new(),
                physical_name: None,
                deposed: Vec::new(),
                updated_at: Utc::now(),
            });
        }

        let graph = DependencyGraph::from_observed(&state);
        assert_eq!(graph.nodes(), &[addr("aws_vpc.main"), addr("aws_subnet.a")]);
        assert_eq!(graph.edges().len(), 1);
        assert_eq!(
            graph.deletion_order().unwrap(),
            vec![addr("aws_subnet.a"), addr("aws_vpc.main")]
        );
    }
}
