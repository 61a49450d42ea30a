//! Dependency ordering and configuration diffing
//!
//! Handles:
//! - Building the interface dependency graph (dependency -> dependent)
//! - Topological ordering with cycle detection
//! - Turning (active, candidate) into an ordered list of operations

use crate::error::{Error, Result};
use crate::netconfig::{InterfaceConfig, NetworkConfiguration};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Interface dependency graph of one configuration
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    nodes: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Build the graph; references to undeclared interfaces are skipped
    pub fn build(config: &NetworkConfiguration) -> Self {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();

        for name in config.interfaces.keys() {
            let idx = graph.add_node(name.clone());
            nodes.insert(name.clone(), idx);
        }

        for name in config.interfaces.keys() {
            let to = nodes[name];
            for dep in config.dependencies_of(name) {
                if let Some(from) = nodes.get(&dep) {
                    graph.add_edge(*from, to, ());
                }
            }
        }

        Self { graph, nodes }
    }

    /// Interfaces in dependency order (dependencies first)
    pub fn order(&self) -> Result<Vec<String>> {
        toposort(&self.graph, None)
            .map(|nodes| nodes.iter().map(|n| self.graph[*n].clone()).collect())
            .map_err(|cycle| Error::CyclicDependency(self.graph[cycle.node_id()].clone()))
    }

    /// Reverse dependency order (dependents first)
    pub fn teardown_order(&self) -> Result<Vec<String>> {
        let mut order = self.order()?;
        order.reverse();
        Ok(order)
    }

    /// Every interface that transitively depends on `name`
    pub fn dependents_of(&self, name: &str) -> BTreeSet<String> {
        let Some(start) = self.nodes.get(name) else {
            return BTreeSet::new();
        };

        let mut found = BTreeSet::new();
        let mut dfs = Dfs::new(&self.graph, *start);
        while let Some(idx) = dfs.next(&self.graph) {
            if idx != *start {
                found.insert(self.graph[idx].clone());
            }
        }
        found
    }
}

/// What a pass does to one interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    /// Flush the old instance, then create the new one
    Update,
    Destroy,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Update => write!(f, "update"),
            Operation::Destroy => write!(f, "destroy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStep {
    pub interface: String,
    pub operation: Operation,
}

impl PlannedStep {
    fn new(interface: &str, operation: Operation) -> Self {
        Self {
            interface: interface.to_string(),
            operation,
        }
    }
}

/// Configuration of an interface as its plugin sees it
fn effective<'a>(config: &'a NetworkConfiguration, name: &str) -> Option<(&'a InterfaceConfig, Option<&'a str>)> {
    config.get(name).map(|intf| (intf, config.master_of(name)))
}

/// Ordered operations turning `active` into `candidate`
///
/// Destroys come first, dependents before their dependencies. Creates and
/// updates follow in dependency order. Interfaces whose definition (or
/// bridge membership) is unchanged are left alone, unless something they
/// depend on is recreated.
pub fn diff(active: Option<&NetworkConfiguration>, candidate: &NetworkConfiguration) -> Result<Vec<PlannedStep>> {
    let empty = NetworkConfiguration::default();
    let active = active.unwrap_or(&empty);

    let active_graph = DependencyGraph::build(active);
    let candidate_graph = DependencyGraph::build(candidate);
    let mut steps = Vec::new();

    for name in active_graph.teardown_order()? {
        if candidate.get(&name).is_none() {
            steps.push(PlannedStep::new(&name, Operation::Destroy));
        }
    }

    let mut changed: BTreeSet<String> = BTreeSet::new();
    for name in candidate.interfaces.keys() {
        if let Some(previous) = effective(active, name)
            && Some(previous) != effective(candidate, name)
        {
            changed.insert(name.clone());
        }
    }

    // Recreating a link invalidates whatever was stacked on it
    let mut cascaded = changed.clone();
    for name in &changed {
        cascaded.extend(
            candidate_graph
                .dependents_of(name)
                .into_iter()
                .filter(|d| active.get(d).is_some()),
        );
    }

    for name in candidate_graph.order()? {
        if active.get(&name).is_none() {
            steps.push(PlannedStep::new(&name, Operation::Create));
        } else if cascaded.contains(&name) {
            steps.push(PlannedStep::new(&name, Operation::Update));
        }
    }

    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(json: &str) -> NetworkConfiguration {
        NetworkConfiguration::from_json(json).unwrap()
    }

    fn ops(steps: &[PlannedStep]) -> Vec<String> {
        steps
            .iter()
            .map(|s| format!("{} {}", s.operation, s.interface))
            .collect()
    }

    #[test]
    fn test_order_respects_dependencies() {
        let cfg = config(
            r#"{
                "wg0": {"kind": "wireguard", "privateKey": "k", "dependsOn": ["br0"]},
                "br0": {"kind": "bridge", "members": ["eth1"]},
                "eth1": {"kind": "physical"}
            }"#,
        );
        let order = DependencyGraph::build(&cfg).order().unwrap();
        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
        assert!(pos("br0") < pos("eth1"));
        assert!(pos("br0") < pos("wg0"));
    }

    #[test]
    fn test_cycle_detected() {
        let cfg = config(
            r#"{
                "a": {"kind": "physical", "dependsOn": ["b"]},
                "b": {"kind": "physical", "dependsOn": ["c"]},
                "c": {"kind": "physical", "dependsOn": ["a"]}
            }"#,
        );
        let err = DependencyGraph::build(&cfg).order().unwrap_err();
        assert!(matches!(err, Error::CyclicDependency(_)));
    }

    #[test]
    fn test_dependents_are_transitive() {
        let cfg = config(
            r#"{
                "eth0": {"kind": "physical"},
                "eth0.10": {"kind": "vlan", "parent": "eth0", "vid": 10},
                "wg0": {"kind": "wireguard", "privateKey": "k", "dependsOn": ["eth0.10"]},
                "eth1": {"kind": "physical"}
            }"#,
        );
        let graph = DependencyGraph::build(&cfg);
        let dependents: Vec<String> = graph.dependents_of("eth0").into_iter().collect();
        assert_eq!(dependents, vec!["eth0.10", "wg0"]);
        assert!(graph.dependents_of("eth1").is_empty());
    }

    #[test]
    fn test_diff_from_nothing() {
        let cfg = config(r#"{"eth0": {"kind": "physical"}, "wg0": {"kind": "wireguard", "privateKey": "k"}}"#);
        let steps = diff(None, &cfg).unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|s| s.operation == Operation::Create));
    }

    #[test]
    fn test_diff_unchanged_is_empty() {
        let cfg = config(r#"{"eth0": {"kind": "physical", "role": "wan"}}"#);
        assert!(diff(Some(&cfg), &cfg).unwrap().is_empty());
    }

    #[test]
    fn test_diff_create_update_destroy() {
        let active = config(
            r#"{
                "eth0": {"kind": "physical"},
                "wg0": {"kind": "wireguard", "privateKey": "k", "listenPort": 51820},
                "wg9": {"kind": "wireguard", "privateKey": "k"}
            }"#,
        );
        let candidate = config(
            r#"{
                "eth0": {"kind": "physical"},
                "wg0": {"kind": "wireguard", "privateKey": "k", "listenPort": 51821},
                "wg1": {"kind": "wireguard", "privateKey": "k"}
            }"#,
        );
        let steps = ops(&diff(Some(&active), &candidate).unwrap());
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0], "destroy wg9");
        assert!(steps.contains(&"create wg1".to_string()));
        assert!(steps.contains(&"update wg0".to_string()));
    }

    #[test]
    fn test_diff_cascades_to_dependents() {
        let active = config(
            r#"{
                "eth1": {"kind": "physical"},
                "br0": {"kind": "bridge", "members": ["eth1"]}
            }"#,
        );
        let candidate = config(
            r#"{
                "eth1": {"kind": "physical"},
                "br0": {"kind": "bridge", "members": ["eth1"], "mtu": 9000}
            }"#,
        );
        let steps = diff(Some(&active), &candidate).unwrap();
        assert_eq!(ops(&steps), vec!["update br0", "update eth1"]);
    }

    #[test]
    fn test_diff_membership_change_updates_member() {
        let active = config(r#"{"eth1": {"kind": "physical"}, "br0": {"kind": "bridge"}}"#);
        let candidate = config(r#"{"eth1": {"kind": "physical"}, "br0": {"kind": "bridge", "members": ["eth1"]}}"#);
        let steps = diff(Some(&active), &candidate).unwrap();
        assert_eq!(ops(&steps), vec!["update br0", "update eth1"]);
    }

    #[test]
    fn test_destroy_order_dependents_first() {
        let active = config(
            r#"{
                "eth0": {"kind": "physical"},
                "eth0.10": {"kind": "vlan", "parent": "eth0", "vid": 10}
            }"#,
        );
        let steps = diff(Some(&active), &NetworkConfiguration::default()).unwrap();
        assert_eq!(ops(&steps), vec!["destroy eth0.10", "destroy eth0"]);
    }
}
