// src/plan/graph.rs

//! Package dependency graph
//!
//! Nodes are the bundle's declared packages; an edge `a -> b` means `a`
//! depends on `b`. Sorting is Kahn's algorithm with a ready set ordered by
//! declaration index, so packages with no ordering constraint between them
//! keep their manifest order.

use crate::bundle::Package;
use crate::error::{Error, Result};
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug)]
pub struct DependencyGraph {
    /// Package ids in declaration order
    nodes: Vec<String>,
    index: HashMap<String, usize>,
    /// node -> nodes it depends on
    edges: Vec<Vec<usize>>,
    /// node -> nodes that depend on it
    reverse_edges: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build from packages; every dependency must name a package in the set
    pub fn build<'a>(packages: impl IntoIterator<Item = &'a Package>) -> Result<Self> {
        let packages: Vec<&Package> = packages.into_iter().collect();
        let nodes: Vec<String> = packages.iter().map(|p| p.id.clone()).collect();
        let index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        let mut edges = vec![Vec::new(); nodes.len()];
        let mut reverse_edges = vec![Vec::new(); nodes.len()];

        for (from, package) in packages.iter().enumerate() {
            for dep in &package.depends_on {
                let to = *index.get(dep).ok_or_else(|| Error::UnknownDependency {
                    package: package.id.clone(),
                    dependency: dep.clone(),
                })?;
                edges[from].push(to);
                reverse_edges[to].push(from);
            }
        }

        Ok(Self {
            nodes,
            index,
            edges,
            reverse_edges,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direct dependencies of a package
    pub fn dependencies(&self, id: &str) -> Vec<&str> {
        self.index
            .get(id)
            .map(|&i| self.edges[i].iter().map(|&d| self.nodes[d].as_str()).collect())
            .unwrap_or_default()
    }

    /// Installation order: dependencies before dependents
    pub fn install_order(&self) -> Result<Vec<String>> {
        let mut remaining: Vec<usize> = self.edges.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = remaining
            .iter()
            .enumerate()
            .filter(|&(_, &deps)| deps == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node) = ready.pop_first() {
            order.push(self.nodes[node].clone());
            for &dependent in &self.reverse_edges[node] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != self.nodes.len() {
            let cycle = self
                .detect_cycle()
                .unwrap_or_else(|| self.nodes.clone());
            return Err(Error::DependencyCycle(cycle));
        }
        Ok(order)
    }

    /// Removal order: dependents before dependencies
    pub fn uninstall_order(&self) -> Result<Vec<String>> {
        let mut order = self.install_order()?;
        order.reverse();
        Ok(order)
    }

    /// A dependency cycle as a closed path (`a -> b -> a`), if one exists
    pub fn detect_cycle(&self) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut stack = Vec::new();

        for start in 0..self.nodes.len() {
            if !visited.contains(&start)
                && let Some(cycle) = self.dfs_cycle(start, &mut visited, &mut stack)
            {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        node: usize,
        visited: &mut HashSet<usize>,
        stack: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        visited.insert(node);
        stack.push(node);

        for &next in &self.edges[node] {
            if let Some(pos) = stack.iter().position(|&n| n == next) {
                let mut cycle: Vec<String> =
                    stack[pos..].iter().map(|&n| self.nodes[n].clone()).collect();
                cycle.push(self.nodes[next].clone());
                return Some(cycle);
            }
            if !visited.contains(&next)
                && let Some(cycle) = self.dfs_cycle(next, visited, stack)
            {
                return Some(cycle);
            }
        }

        stack.pop();
        None
    }
}
