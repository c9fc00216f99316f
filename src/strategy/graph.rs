//! Dependency graph over work units.
//!
//! Edges run from a dependency to its dependents. The graph is built once per
//! run; `UnitGraph::build` rejects duplicate ids, unknown dependencies and
//! cycles.

use std::collections::{HashMap, HashSet};

use porter_common::WorkUnit;

use crate::errors::OrchestratorError;
use porter_common::ConfigError;

/// Index into the unit list, which is declaration order.
pub type UnitIndex = usize;

#[derive(Debug)]
pub struct UnitGraph {
    units: Vec<WorkUnit>,
    index_map: HashMap<String, UnitIndex>,
    /// index -> units that depend on it
    forward_edges: Vec<Vec<UnitIndex>>,
    /// index -> units it depends on
    reverse_edges: Vec<Vec<UnitIndex>>,
}

impl UnitGraph {
    pub fn build(units: Vec<WorkUnit>) -> Result<Self, OrchestratorError> {
        let mut index_map = HashMap::new();
        for (i, unit) in units.iter().enumerate() {
            if index_map.insert(unit.id.clone(), i).is_some() {
                return Err(ConfigError::DuplicateUnit {
                    id: unit.id.clone(),
                }
                .into());
            }
        }

        let mut forward_edges: Vec<Vec<UnitIndex>> = vec![Vec::new(); units.len()];
        let mut reverse_edges: Vec<Vec<UnitIndex>> = vec![Vec::new(); units.len()];

        for (to_idx, unit) in units.iter().enumerate() {
            for dep in &unit.depends_on {
                let from_idx =
                    *index_map
                        .get(dep)
                        .ok_or_else(|| ConfigError::UnknownDependency {
                            unit: unit.id.clone(),
                            dependency: dep.clone(),
                        })?;
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }
        // Keep edge lists in declaration order regardless of set iteration.
        for edges in forward_edges.iter_mut().chain(reverse_edges.iter_mut()) {
            edges.sort_unstable();
        }

        let graph = Self {
            units,
            index_map,
            forward_edges,
            reverse_edges,
        };
        graph.validate_no_cycles()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn units(&self) -> &[WorkUnit] {
        &self.units
    }

    /// Statuses may change; ids and dependencies must not.
    pub(crate) fn units_mut(&mut self) -> &mut [WorkUnit] {
        &mut self.units
    }

    pub fn into_units(self) -> Vec<WorkUnit> {
        self.units
    }

    pub fn get_index(&self, id: &str) -> Option<UnitIndex> {
        self.index_map.get(id).copied()
    }

    pub fn dependents(&self, index: UnitIndex) -> &[UnitIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    pub fn dependencies(&self, index: UnitIndex) -> &[UnitIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Longest dependency chain below each unit; roots are depth 0.
    pub fn depths(&self) -> Vec<usize> {
        let mut depth = vec![0usize; self.len()];
        for index in self.kahn_order() {
            for &dependent in self.dependents(index) {
                depth[dependent] = depth[dependent].max(depth[index] + 1);
            }
        }
        depth
    }

    /// Kahn's algorithm, always releasing the earliest-declared ready unit.
    fn kahn_order(&self) -> Vec<UnitIndex> {
        let mut in_degree: Vec<usize> = self.reverse_edges.iter().map(|d| d.len()).collect();
        let mut ready: std::collections::BTreeSet<UnitIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(node) = ready.pop_first() {
            order.push(node);
            for &dependent in self.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }
        order
    }

    fn validate_no_cycles(&self) -> Result<(), OrchestratorError> {
        let order = self.kahn_order();
        if order.len() == self.len() {
            return Ok(());
        }

        let placed: HashSet<UnitIndex> = order.into_iter().collect();
        let stuck: Vec<UnitIndex> = (0..self.len()).filter(|i| !placed.contains(i)).collect();
        Err(OrchestratorError::CyclicDependency {
            cycle: self.find_cycle(&stuck),
        })
    }

    /// Walk dependency edges among unplaced units until a node repeats.
    /// Every unplaced unit has at least one unplaced dependency, so the walk
    /// always closes a loop.
    fn find_cycle(&self, stuck: &[UnitIndex]) -> Vec<String> {
        let stuck_set: HashSet<UnitIndex> = stuck.iter().copied().collect();
        let Some(&start) = stuck.first() else {
            return Vec::new();
        };

        let mut path = vec![start];
        let mut position: HashMap<UnitIndex, usize> = HashMap::from([(start, 0)]);
        let mut current = start;
        loop {
            let Some(&next) = self
                .dependencies(current)
                .iter()
                .find(|d| stuck_set.contains(d))
            else {
                break;
            };
            if let Some(&pos) = position.get(&next) {
                let mut cycle: Vec<UnitIndex> = path[pos..].to_vec();
                cycle.reverse();
                cycle.insert(0, next);
                return cycle.iter().map(|&i| self.units[i].id.clone()).collect();
            }
            position.insert(next, path.len());
            path.push(next);
            current = next;
        }

        stuck.iter().map(|&i| self.units[i].id.clone()).collect()
    }
}
