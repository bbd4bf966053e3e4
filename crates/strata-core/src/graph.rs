//! Module dependency graph and wave planning.
//!
//! Nodes are manifest modules keyed case-insensitively. An edge
//! `provider → consumer` means the consumer needs the provider's outputs, so
//! the provider must finish first. Cycles are rejected when an edge is added;
//! the graph never holds one.
//!
//! Waves are computed with Kahn's algorithm and level tracking over a
//! restricted node set, so that every module in one wave can build in
//! parallel.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::config::FetchMode;
use crate::error::{ConfigError, Result};
use crate::manifest::{DependencyNode, ModuleManifest};

fn key(name: &str) -> String {
    name.to_lowercase()
}

/// Directed provider/consumer graph over [`DependencyNode`]s.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashMap<String, DependencyNode>,
    /// `provider → {consumer, ...}`
    downstream: HashMap<String, BTreeSet<String>>,
    /// `consumer → {provider, ...}`
    upstream: HashMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph for every module and edge in `manifest`.
    ///
    /// Self-references are dropped. A dependency on an undeclared module and
    /// any cycle are configuration errors.
    pub fn build(manifest: &ModuleManifest) -> Result<Self> {
        let mut graph = Self::new();
        for module in &manifest.modules {
            graph.add_node(module.clone());
        }
        for edge in manifest.edges() {
            if !graph.contains(&edge.provider) {
                return Err(ConfigError::UnknownDependency {
                    module: edge.consumer,
                    dependency: edge.provider,
                }
                .into());
            }
            graph.add_dependency(&edge.provider, &edge.consumer)?;
        }
        Ok(graph)
    }

    /// Register a node. Re-registering a name updates its metadata.
    pub fn add_node(&mut self, node: DependencyNode) {
        let id = node.key();
        self.nodes.insert(id.clone(), node);
        self.downstream.entry(id.clone()).or_default();
        self.upstream.entry(id).or_default();
    }

    /// `consumer` depends on `provider`.
    ///
    /// Self-edges are ignored. Returns [`ConfigError::DependencyCycle`] and
    /// leaves the graph unchanged if the edge would close a cycle.
    pub fn add_dependency(&mut self, provider: &str, consumer: &str) -> Result<()> {
        let (p, c) = (key(provider), key(consumer));
        for id in [&p, &c] {
            if !self.nodes.contains_key(id) {
                return Err(ConfigError::ModuleNotInManifest { module: id.clone() }.into());
            }
        }
        if p == c {
            return Ok(());
        }

        self.downstream.entry(p.clone()).or_default().insert(c.clone());
        self.upstream.entry(c.clone()).or_default().insert(p.clone());

        if let Some(cycle) = self.find_cycle_through(&c) {
            if let Some(set) = self.downstream.get_mut(&p) {
                set.remove(&c);
            }
            if let Some(set) = self.upstream.get_mut(&c) {
                set.remove(&p);
            }
            let modules = cycle.iter().map(|id| self.display_name(id)).collect();
            return Err(ConfigError::DependencyCycle { modules }.into());
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(&key(name))
    }

    pub fn node(&self, name: &str) -> Option<&DependencyNode> {
        self.nodes.get(&key(name))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn display_name(&self, id: &str) -> String {
        self.nodes
            .get(id)
            .map(|n| n.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    fn require(&self, name: &str) -> Result<String> {
        let id = key(name);
        if self.nodes.contains_key(&id) {
            Ok(id)
        } else {
            Err(ConfigError::ModuleNotInManifest {
                module: name.to_string(),
            }
            .into())
        }
    }

    fn collect_nodes<'a>(&self, ids: impl Iterator<Item = &'a String>) -> Vec<&DependencyNode> {
        ids.filter_map(|id| self.nodes.get(id)).collect()
    }

    /// Modules `name` consumes directly.
    pub fn dependencies_of(&self, name: &str) -> Result<Vec<&DependencyNode>> {
        let id = self.require(name)?;
        Ok(self.collect_nodes(self.upstream.get(&id).into_iter().flatten()))
    }

    /// Modules consuming `name` directly.
    pub fn dependents_of(&self, name: &str) -> Result<Vec<&DependencyNode>> {
        let id = self.require(name)?;
        Ok(self.collect_nodes(self.downstream.get(&id).into_iter().flatten()))
    }

    fn closure(&self, start: &str, edges: &HashMap<String, BTreeSet<String>>) -> BTreeSet<String> {
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([start.to_string()]);
        while let Some(current) = queue.pop_front() {
            for next in edges.get(&current).into_iter().flatten() {
                if visited.insert(next.clone()) {
                    queue.push_back(next.clone());
                }
            }
        }
        visited
    }

    /// Every module `name` needs, directly or indirectly.
    pub fn transitive_dependencies_of(&self, name: &str) -> Result<Vec<&DependencyNode>> {
        let id = self.require(name)?;
        let ids = self.closure(&id, &self.upstream);
        Ok(self.collect_nodes(ids.iter()))
    }

    /// Every module that needs `name`, directly or indirectly.
    pub fn transitive_dependents_of(&self, name: &str) -> Result<Vec<&DependencyNode>> {
        let id = self.require(name)?;
        let ids = self.closure(&id, &self.downstream);
        Ok(self.collect_nodes(ids.iter()))
    }

    /// External modules to fetch so that `modules` can build.
    ///
    /// `Direct` takes each module's immediate providers; `Transitive` takes the
    /// full closure. Providers that are themselves in `modules_in_build` are
    /// produced locally and skipped. Third-party providers anywhere in the
    /// closure are always included since they are never rebuilt here.
    /// The result is deduplicated case-insensitively and sorted by name.
    pub fn dependencies_required_for_build(
        &self,
        modules: &[String],
        modules_in_build: &[String],
        mode: FetchMode,
    ) -> Result<Vec<DependencyNode>> {
        let in_build: HashSet<String> = modules_in_build.iter().map(|m| key(m)).collect();
        let mut required: BTreeSet<String> = BTreeSet::new();

        for module in modules {
            let id = self.require(module)?;
            let transitive = self.closure(&id, &self.upstream);
            let direct: BTreeSet<String> = self
                .upstream
                .get(&id)
                .cloned()
                .unwrap_or_default();

            for dep in &transitive {
                if *dep == id {
                    continue;
                }
                let Some(node) = self.nodes.get(dep) else {
                    continue;
                };
                let wanted = node.is_third_party()
                    || (!in_build.contains(dep)
                        && (mode == FetchMode::Transitive || direct.contains(dep)));
                if wanted {
                    required.insert(dep.clone());
                }
            }
        }

        let mut out: Vec<DependencyNode> = required
            .iter()
            .filter_map(|id| self.nodes.get(id).cloned())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// All modules with providers before consumers.
    pub fn topological_order(&self) -> Result<Vec<DependencyNode>> {
        let all: Vec<String> = self.nodes.values().map(|n| n.name.clone()).collect();
        Ok(self
            .waves(&all)?
            .into_iter()
            .flatten()
            .filter_map(|name| self.node(&name).cloned())
            .collect())
    }

    /// Partition `members` into waves.
    ///
    /// A module enters wave N once every member it depends on sits in a wave
    /// below N. Dependencies that pass through modules outside `members`
    /// still count, so a member never shares a wave with a member it reaches
    /// through a cached module. Names inside a wave are sorted, so the result
    /// is deterministic.
    pub fn waves(&self, members: &[String]) -> Result<Vec<Vec<String>>> {
        let mut ids: BTreeSet<String> = BTreeSet::new();
        for m in members {
            ids.insert(self.require(m)?);
        }

        let providers: HashMap<&str, BTreeSet<String>> = ids
            .iter()
            .map(|id| (id.as_str(), self.member_providers(id, &ids)))
            .collect();
        let mut consumers: HashMap<&str, Vec<&str>> = HashMap::new();
        for (&id, found) in &providers {
            for p in found {
                consumers.entry(p.as_str()).or_default().push(id);
            }
        }

        let mut in_degree: HashMap<&str, usize> =
            providers.iter().map(|(&id, found)| (id, found.len())).collect();

        let mut current: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut waves: Vec<Vec<String>> = Vec::new();
        let mut placed = 0usize;

        while !current.is_empty() {
            current.sort_unstable();
            let mut next: Vec<&str> = Vec::new();
            for id in &current {
                for &consumer in consumers.get(id).into_iter().flatten() {
                    if let Some(deg) = in_degree.get_mut(consumer) {
                        *deg -= 1;
                        if *deg == 0 {
                            next.push(consumer);
                        }
                    }
                }
            }
            placed += current.len();
            let mut wave: Vec<String> = current.iter().map(|id| self.display_name(id)).collect();
            wave.sort();
            waves.push(wave);
            current = next;
        }

        if placed != ids.len() {
            let stuck: Vec<String> = in_degree
                .iter()
                .filter(|(_, &deg)| deg > 0)
                .map(|(id, _)| self.display_name(id))
                .collect();
            return Err(ConfigError::DependencyCycle { modules: stuck }.into());
        }
        Ok(waves)
    }

    /// Members `id` depends on, walking through non-members but stopping at
    /// the first member on each path.
    fn member_providers(&self, id: &str, members: &BTreeSet<String>) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<&String> = self.upstream.get(id).into_iter().flatten().collect();
        while let Some(p) = stack.pop() {
            if !visited.insert(p.as_str()) {
                continue;
            }
            if members.contains(p) {
                found.insert(p.clone());
            } else {
                stack.extend(self.upstream.get(p).into_iter().flatten());
            }
        }
        found
    }

    /// DFS from `start` to detect cycles. Returns the cycle path if found.
    fn find_cycle_through(&self, start: &str) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        if self.dfs_cycle(start, start, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs_cycle(
        &self,
        origin: &str,
        node: &str,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> bool {
        path.push(node.to_string());
        if !visited.insert(node.to_string()) {
            path.pop();
            return false;
        }
        for next in self.downstream.get(node).into_iter().flatten() {
            if next == origin {
                path.push(next.clone());
                return true;
            }
            if self.dfs_cycle(origin, next, visited, path) {
                return true;
            }
        }
        path.pop();
        false
    }
}
