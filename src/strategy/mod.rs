//! Strategy engine: turns a project into an ordered list of work units.
//!
//! Ordering is a pure function of the project and the strategy. Units are
//! sorted by dependency depth; units at equal depth keep their declaration
//! order, so an unchanged project always yields the same sequence.

pub mod graph;

pub use graph::{UnitGraph, UnitIndex};

use porter_common::{ConfigError, Project, Strategy, UnitKind, WorkUnit};

use crate::errors::OrchestratorError;

/// Work units for `project` under `strategy`, in declaration order and
/// without ordering applied.
pub fn units_for(project: &Project, strategy: Strategy) -> Result<Vec<WorkUnit>, OrchestratorError> {
    match strategy {
        Strategy::ModuleByModule => Ok(module_units(project)),
        Strategy::FeatureByFeature => feature_units(project),
    }
}

fn module_units(project: &Project) -> Vec<WorkUnit> {
    project
        .modules
        .iter()
        .map(|module| {
            let mut unit = WorkUnit::new(module.id(), UnitKind::Module)
                .with_deps(module.depends_on.iter().cloned())
                .with_sources(vec![module.source.clone()]);
            unit.description = module.description.clone();
            unit
        })
        .collect()
}

fn feature_units(project: &Project) -> Result<Vec<WorkUnit>, OrchestratorError> {
    if !project.has_features() {
        return Err(ConfigError::NoFeatures {
            project: project.name.clone(),
        }
        .into());
    }

    Ok(project
        .features
        .iter()
        .map(|feature| {
            let mut sources: Vec<String> = Vec::new();
            for touched in &feature.touches {
                let source = project
                    .find_module(touched)
                    .map(|m| m.source.clone())
                    .unwrap_or_else(|| touched.clone());
                if !sources.contains(&source) {
                    sources.push(source);
                }
            }
            let mut unit = WorkUnit::new(feature.id(), UnitKind::Feature)
                .with_deps(feature.depends_on.iter().cloned())
                .with_sources(sources);
            unit.description = feature.description.clone();
            unit
        })
        .collect())
}

/// Build the dependency graph for a strategy, units in declaration order.
pub fn graph_for(project: &Project, strategy: Strategy) -> Result<UnitGraph, OrchestratorError> {
    UnitGraph::build(units_for(project, strategy)?)
}

/// Order a project's units so every dependency precedes its dependents.
///
/// Fails with `CyclicDependency` when no such order exists; no partial order
/// is ever returned.
pub fn order(project: &Project, strategy: Strategy) -> Result<Vec<WorkUnit>, OrchestratorError> {
    let graph = graph_for(project, strategy)?;
    Ok(order_graph(graph))
}

/// Unit indices in execution order: a stable sort by dependency depth.
pub fn execution_order(graph: &UnitGraph) -> Vec<UnitIndex> {
    let depths = graph.depths();
    let mut indices: Vec<UnitIndex> = (0..graph.len()).collect();
    indices.sort_by_key(|&i| depths[i]);
    indices
}

/// The graph's units in execution order.
pub fn order_graph(graph: UnitGraph) -> Vec<WorkUnit> {
    let order = execution_order(&graph);
    let mut slots: Vec<Option<WorkUnit>> = graph.into_units().into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|i| slots.get_mut(i).and_then(Option::take))
        .collect()
}
