//! Patch dependency graph and deterministic ordering.
//!
//! Nodes are patch names, edges point from a patch to the patches it depends
//! on. The graph is rebuilt from the manifest whenever it is needed.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::errors::GraphError;
use crate::manifest::Manifest;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    nodes: BTreeSet<String>,
    edges: BTreeMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Graph over `names` with each name's dependencies from the manifest.
    pub fn build<S: AsRef<str>>(names: &[S], manifest: &Manifest) -> Self {
        Self::from_edges(
            names
                .iter()
                .map(|n| (n.as_ref().to_string(), manifest.dependencies(n.as_ref()).to_vec())),
        )
    }

    /// Graph from explicit `(node, dependencies)` pairs.
    pub fn from_edges<I>(edges: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<String>)>,
    {
        let mut graph = Self::default();
        for (node, deps) in edges {
            let entry = graph.edges.entry(node.clone()).or_default();
            for dep in deps {
                if !entry.contains(&dep) {
                    entry.push(dep);
                }
            }
            graph.nodes.insert(node);
        }
        graph
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Dependencies of `name`, empty for unknown names.
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.edges.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Order the nodes so that every patch comes after its dependencies.
    ///
    /// Ties are broken alphabetically: the initial ready set is sorted, and
    /// each batch of nodes released by one dequeue is sorted before being
    /// appended to the queue.
    pub fn topological_sort(&self) -> Result<Vec<String>, GraphError> {
        for node in &self.nodes {
            for dep in self.dependencies(node) {
                if !self.nodes.contains(dep) {
                    return Err(GraphError::MissingDependency {
                        patch: node.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in &self.nodes {
            let deps = self.dependencies(node);
            in_degree.insert(node.as_str(), deps.len());
            for dep in deps {
                dependents.entry(dep.as_str()).or_default().push(node.as_str());
            }
        }

        // `nodes` is a BTreeSet, so this seed is already alphabetical.
        let mut queue: VecDeque<&str> = self
            .nodes
            .iter()
            .map(String::as_str)
            .filter(|n| in_degree.get(n).copied() == Some(0))
            .collect();

        let mut order: Vec<String> = Vec::with_capacity(self.nodes.len());
        while let Some(node) = queue.pop_front() {
            order.push(node.to_string());

            let mut ready = Vec::new();
            for dependent in dependents.get(node).map(Vec::as_slice).unwrap_or(&[]) {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(*dependent);
                    }
                }
            }
            ready.sort_unstable();
            queue.extend(ready);
        }

        if order.len() == self.nodes.len() {
            return Ok(order);
        }

        let sorted: BTreeSet<&str> = order.iter().map(String::as_str).collect();
        let remaining: BTreeSet<&str> = self
            .nodes
            .iter()
            .map(String::as_str)
            .filter(|n| !sorted.contains(n))
            .collect();
        Err(GraphError::CyclicDependency {
            cycle: self.find_cycle(&remaining),
        })
    }

    /// Depth-first walk over the unsorted remainder. Every node left over
    /// by the sort has a dependency inside the remainder, so a walk from any
    /// of them closes a cycle.
    fn find_cycle(&self, remaining: &BTreeSet<&str>) -> Vec<String> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            OnPath,
            Done,
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();

        for &start in remaining {
            if marks.contains_key(start) {
                continue;
            }

            let mut path: Vec<&str> = Vec::new();
            // (node, index of the next dependency to visit)
            let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
            marks.insert(start, Mark::OnPath);
            path.push(start);

            while let Some(top) = stack.last_mut() {
                let (node, next) = *top;
                let mut deps: Vec<&str> = self
                    .dependencies(node)
                    .iter()
                    .map(String::as_str)
                    .filter(|d| remaining.contains(d))
                    .collect();
                deps.sort_unstable();

                match deps.get(next) {
                    Some(&dep) => {
                        top.1 += 1;
                        match marks.get(dep) {
                            Some(Mark::OnPath) => {
                                let pos = path.iter().position(|n| *n == dep).unwrap_or(0);
                                let mut cycle: Vec<String> =
                                    path[pos..].iter().map(|n| n.to_string()).collect();
                                cycle.push(dep.to_string());
                                return cycle;
                            }
                            Some(Mark::Done) => {}
                            None => {
                                marks.insert(dep, Mark::OnPath);
                                path.push(dep);
                                stack.push((dep, 0));
                            }
                        }
                    }
                    None => {
                        marks.insert(node, Mark::Done);
                        path.pop();
                        stack.pop();
                    }
                }
            }
        }

        unreachable!("topological sort left nodes unsorted but no cycle was found")
    }
}
