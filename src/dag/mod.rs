//! Dependency graph over a phase catalog.
//!
//! The graph validates the catalog (known dependencies, no cycles) and
//! answers the two scheduling questions: which phases are ready given the
//! persisted outputs, and how close each dependency sits to a phase (BFS
//! distance, used by the compactor's proximity ordering).

use anyhow::{Result, bail};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::phases::PhaseSpec;

pub type PhaseIndex = usize;

/// A validated directed acyclic graph over one mode's phase catalog.
#[derive(Debug)]
pub struct PhaseGraph {
    phases: Vec<PhaseSpec>,
    index_map: HashMap<&'static str, PhaseIndex>,
    /// index -> phases that depend on it
    forward_edges: Vec<Vec<PhaseIndex>>,
    /// index -> phases it depends on
    reverse_edges: Vec<Vec<PhaseIndex>>,
}

impl PhaseGraph {
    /// Build and validate a graph from a catalog. Fails on duplicate names,
    /// unknown dependencies, or cycles.
    pub fn build(catalog: &[PhaseSpec]) -> Result<Self> {
        let mut index_map = HashMap::new();
        for (i, spec) in catalog.iter().enumerate() {
            if index_map.insert(spec.name, i).is_some() {
                bail!("Duplicate phase name: {}", spec.name);
            }
        }

        let mut forward_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); catalog.len()];
        let mut reverse_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); catalog.len()];
        for (to_idx, spec) in catalog.iter().enumerate() {
            for dep in spec.depends_on {
                let from_idx = *index_map.get(dep).ok_or_else(|| {
                    anyhow::anyhow!("Unknown dependency '{}' in phase '{}'", dep, spec.name)
                })?;
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = Self {
            phases: catalog.to_vec(),
            index_map,
            forward_edges,
            reverse_edges,
        };
        graph.validate_no_cycles()?;
        Ok(graph)
    }

    /// Kahn's algorithm; any unprocessed node after the sweep is on a cycle.
    fn validate_no_cycles(&self) -> Result<()> {
        let mut in_degree: Vec<usize> = self.reverse_edges.iter().map(|deps| deps.len()).collect();
        let mut queue: Vec<PhaseIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;
        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in &self.forward_edges[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != self.phases.len() {
            let cycle_phases: Vec<&str> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| self.phases[i].name)
                .collect();
            bail!("Cycle detected in phase dependencies: {:?}", cycle_phases);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn phases(&self) -> &[PhaseSpec] {
        &self.phases
    }

    pub fn get(&self, name: &str) -> Option<&PhaseSpec> {
        self.index_map.get(name).map(|&i| &self.phases[i])
    }

    /// Phases whose dependencies are all completed and which have no output
    /// of their own yet. This is the wavefront the orchestrator schedules.
    pub fn ready_phases(&self, completed: &HashSet<String>) -> Vec<&PhaseSpec> {
        self.phases
            .iter()
            .filter(|spec| !completed.contains(spec.name))
            .filter(|spec| spec.depends_on.iter().all(|dep| completed.contains(*dep)))
            .collect()
    }

    pub fn all_complete(&self, completed: &HashSet<String>) -> bool {
        self.phases.iter().all(|spec| completed.contains(spec.name))
    }

    /// Completion percentage over the whole catalog, clamped to 0..=100.
    pub fn progress(&self, completed: &HashSet<String>) -> u8 {
        if self.phases.is_empty() {
            return 100;
        }
        let done = self
            .phases
            .iter()
            .filter(|spec| completed.contains(spec.name))
            .count();
        ((done * 100) / self.phases.len()).min(100) as u8
    }

    /// BFS distance from `phase` to each transitive dependency, following
    /// dependency edges upstream. Distance 1 is a direct dependency. Phases
    /// unreachable from `phase` are absent from the map.
    pub fn dependency_distances(&self, phase: &str) -> HashMap<&'static str, usize> {
        let mut distances = HashMap::new();
        let Some(&start) = self.index_map.get(phase) else {
            return distances;
        };

        let mut queue = VecDeque::from([(start, 0usize)]);
        let mut seen = HashSet::from([start]);
        while let Some((node, dist)) = queue.pop_front() {
            for &dep in &self.reverse_edges[node] {
                if seen.insert(dep) {
                    distances.insert(self.phases[dep].name, dist + 1);
                    queue.push_back((dep, dist + 1));
                }
            }
        }
        distances
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunMode;
    use crate::phases::catalog;

    fn completed(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_all_catalogs_build() {
        for mode in [RunMode::Standard, RunMode::Discovery, RunMode::DueDiligence] {
            let graph = PhaseGraph::build(catalog(mode)).unwrap();
            assert!(!graph.is_empty());
        }
    }

    #[test]
    fn test_ready_phases_wavefront() {
        let graph = PhaseGraph::build(catalog(RunMode::Standard)).unwrap();

        let ready: Vec<&str> = graph
            .ready_phases(&HashSet::new())
            .iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(ready, vec!["framing"]);

        // After framing, teaching and precedents unlock in parallel.
        let ready: Vec<&str> = graph
            .ready_phases(&completed(&["framing"]))
            .iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(ready, vec!["teaching", "precedents"]);

        // Concepts needs both branches.
        assert!(
            graph
                .ready_phases(&completed(&["framing", "teaching"]))
                .iter()
                .all(|s| s.name != "concepts")
        );
    }

    #[test]
    fn test_progress_and_completion() {
        let graph = PhaseGraph::build(catalog(RunMode::Discovery)).unwrap();
        assert_eq!(graph.progress(&HashSet::new()), 0);
        assert_eq!(graph.progress(&completed(&["framing", "scan"])), 50);

        let all = completed(&["framing", "scan", "concepts", "report"]);
        assert_eq!(graph.progress(&all), 100);
        assert!(graph.all_complete(&all));
    }

    #[test]
    fn test_dependency_distances_for_proximity() {
        let graph = PhaseGraph::build(catalog(RunMode::Standard)).unwrap();
        let distances = graph.dependency_distances("report");

        // Direct dependencies sit at distance 1.
        assert_eq!(distances["evaluation"], 1);
        assert_eq!(distances["concepts"], 1);
        assert_eq!(distances["framing"], 1);
        // Teaching is only reachable through concepts.
        assert_eq!(distances["teaching"], 2);
        // Report itself is not a dependency of report.
        assert!(!distances.contains_key("report"));
    }

    #[test]
    fn test_cycle_detection() {
        let mut phases = catalog(RunMode::Discovery).to_vec();
        // Point scan at report to close a loop.
        phases[1].depends_on = &["report"];
        let result = PhaseGraph::build(&phases);
        assert!(result.unwrap_err().to_string().contains("Cycle"));
    }

    #[test]
    fn test_unknown_dependency() {
        let mut phases = catalog(RunMode::Discovery).to_vec();
        phases[1].depends_on = &["nonexistent"];
        let result = PhaseGraph::build(&phases);
        assert!(result.unwrap_err().to_string().contains("nonexistent"));
    }
}
