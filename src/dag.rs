//! DAG resolution.
//!
//! Turns a pipeline's steps into a deterministic execution order. Edges
//! run from dependency to dependent. Cycles are detected with a
//! three-colour depth-first traversal (unseen, active, done); layering
//! comes from a Kahn-style peel that sorts each layer by step id so every
//! run of the same pipeline produces the same trace.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::WaveError;
use crate::pipeline::Step;

/// Deterministic execution plan for one pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    /// Flat topological sequence; the executor walks this.
    pub order: Vec<String>,
    /// Steps grouped by dependency depth; the dry-run plan and the
    /// dashboard DAG view render these.
    pub layers: Vec<Vec<String>>,
}

impl ExecutionPlan {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Colour {
    Unseen,
    Active,
    Done,
}

/// Resolve the execution plan, rejecting unknown edges and cycles before
/// any step runs.
pub fn resolve(pipeline_name: &str, steps: &[Step]) -> Result<ExecutionPlan, WaveError> {
    let invalid = |message: String| WaveError::InvalidPipeline {
        pipeline: pipeline_name.to_string(),
        message,
    };

    let mut ids = BTreeSet::new();
    for step in steps {
        if !ids.insert(step.id.as_str()) {
            return Err(invalid(format!("duplicate step id '{}'", step.id)));
        }
    }

    // dependency -> dependents
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut dependencies: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for step in steps {
        dependencies.entry(step.id.as_str()).or_default();
        dependents.entry(step.id.as_str()).or_default();
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(invalid(format!(
                    "step '{}' depends on unknown step '{dep}'",
                    step.id
                )));
            }
            dependencies
                .entry(step.id.as_str())
                .or_default()
                .push(dep.as_str());
            dependents.entry(dep.as_str()).or_default().push(step.id.as_str());
        }
    }

    // Cycle detection: three-colour DFS over every component.
    let mut colours: BTreeMap<&str, Colour> = ids.iter().map(|id| (*id, Colour::Unseen)).collect();
    let mut stack: Vec<(&str, usize)> = Vec::new();
    for &root in &ids {
        if colours[root] != Colour::Unseen {
            continue;
        }
        stack.push((root, 0));
        colours.insert(root, Colour::Active);
        while let Some((node, next_child)) = stack.pop() {
            let children = &dependents[node];
            if next_child < children.len() {
                stack.push((node, next_child + 1));
                let child = children[next_child];
                match colours[child] {
                    Colour::Active => {
                        return Err(invalid(format!(
                            "cycle detected through steps '{child}' and '{node}'"
                        )));
                    }
                    Colour::Unseen => {
                        colours.insert(child, Colour::Active);
                        stack.push((child, 0));
                    }
                    Colour::Done => {}
                }
            } else {
                colours.insert(node, Colour::Done);
            }
        }
    }

    // Layered Kahn peel, each layer sorted by id for reproducible traces.
    let mut remaining_deps: BTreeMap<&str, BTreeSet<&str>> = dependencies
        .iter()
        .map(|(id, deps)| (*id, deps.iter().copied().collect()))
        .collect();
    let mut layers: Vec<Vec<String>> = Vec::new();
    let mut order: Vec<String> = Vec::new();

    while !remaining_deps.is_empty() {
        let mut layer: Vec<&str> = remaining_deps
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| *id)
            .collect();
        if layer.is_empty() {
            // Unreachable after DFS cycle detection; defensive equivalent
            // of an inconsistent graph.
            return Err(invalid("cycle detected".to_string()));
        }
        layer.sort_unstable();

        for id in &layer {
            remaining_deps.remove(id);
        }
        for deps in remaining_deps.values_mut() {
            for id in &layer {
                deps.remove(id);
            }
        }

        order.extend(layer.iter().map(|s| s.to_string()));
        layers.push(layer.into_iter().map(String::from).collect());
    }

    Ok(ExecutionPlan { order, layers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{MemoryConfig, WorkspaceConfig};

    fn step(id: &str, deps: &[&str]) -> Step {
        Step {
            id: id.to_string(),
            persona: "navigator".to_string(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            memory: MemoryConfig::default(),
            workspace: WorkspaceConfig::default(),
            prompt: Some("x".to_string()),
            command: None,
            outputs: vec![],
            handover: None,
            matrix: None,
            pre_validate: vec![],
            timeout_secs: None,
            max_retries: None,
        }
    }

    #[test]
    fn linear_chain_resolves_in_order() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])];
        let plan = resolve("p", &steps).unwrap();
        assert_eq!(plan.order, vec!["a", "b", "c"]);
        assert_eq!(plan.layers, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn diamond_layers_are_sorted_by_id() {
        let steps = vec![
            step("root", &[]),
            step("right", &["root"]),
            step("left", &["root"]),
            step("join", &["left", "right"]),
        ];
        let plan = resolve("p", &steps).unwrap();
        assert_eq!(plan.order, vec!["root", "left", "right", "join"]);
        assert_eq!(plan.layers[1], vec!["left", "right"]);
    }

    #[test]
    fn order_length_equals_step_count() {
        let steps = vec![
            step("a", &[]),
            step("b", &[]),
            step("c", &["a", "b"]),
            step("d", &["c"]),
            step("e", &["a"]),
        ];
        let plan = resolve("p", &steps).unwrap();
        assert_eq!(plan.len(), steps.len());
    }

    #[test]
    fn declaration_order_does_not_matter() {
        let forward = vec![step("a", &[]), step("b", &["a"])];
        let reversed = vec![step("b", &["a"]), step("a", &[])];
        assert_eq!(
            resolve("p", &forward).unwrap(),
            resolve("p", &reversed).unwrap()
        );
    }

    #[test]
    fn rejects_self_cycle() {
        let steps = vec![step("a", &["a"])];
        let err = resolve("p", &steps).unwrap_err();
        assert!(matches!(err, WaveError::InvalidPipeline { .. }));
    }

    #[test]
    fn rejects_two_step_cycle() {
        let steps = vec![step("a", &["b"]), step("b", &["a"])];
        let err = resolve("p", &steps).unwrap_err();
        match err {
            WaveError::InvalidPipeline { message, .. } => {
                assert!(message.contains("cycle"), "{message}")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_long_cycle_behind_valid_prefix() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a", "d"]),
            step("c", &["b"]),
            step("d", &["c"]),
        ];
        assert!(resolve("p", &steps).is_err());
    }

    #[test]
    fn rejects_unknown_dependency() {
        let steps = vec![step("a", &["ghost"])];
        match resolve("p", &steps).unwrap_err() {
            WaveError::InvalidPipeline { message, .. } => {
                assert!(message.contains("ghost"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_duplicate_ids() {
        let steps = vec![step("a", &[]), step("a", &[])];
        assert!(resolve("p", &steps).is_err());
    }

    #[test]
    fn empty_pipeline_resolves_empty() {
        let plan = resolve("p", &[]).unwrap();
        assert!(plan.is_empty());
        assert!(plan.layers.is_empty());
    }
}
