//! Dependency-ordered launch groups for the Runtime (spec §4.2 "instances
//! launch only once every instance they depend on — within the same
//! phase — has reached a terminal status").
//!
//! Kahn's algorithm over the instance graph, grouped into waves the same
//! way the stage DAG grouped independent stages: each wave is the set of
//! instances whose dependencies are already satisfied, so the Runtime can
//! `tokio::spawn` a whole wave at once instead of one instance at a time.

use crate::error::{OrchestratorError, Result};
use iac_storage::InstanceId;
use std::collections::{HashMap, HashSet};

/// Groups `node_ids` into waves such that every dependency of a node (as
/// given by `edges`, node -> its dependencies) appears in an earlier wave.
/// Dependencies outside `node_ids` are ignored — they belong to a
/// different phase and are assumed already resolved.
pub fn topological_waves(
    node_ids: &[InstanceId],
    edges: &HashMap<InstanceId, Vec<InstanceId>>,
) -> Result<Vec<Vec<InstanceId>>> {
    let members: HashSet<&InstanceId> = node_ids.iter().collect();

    let mut in_degree: HashMap<InstanceId, usize> =
        node_ids.iter().map(|id| (id.clone(), 0)).collect();
    let mut dependents: HashMap<InstanceId, Vec<InstanceId>> = HashMap::new();

    for id in node_ids {
        let deps = edges.get(id).map(|v| v.as_slice()).unwrap_or(&[]);
        for dep in deps {
            if !members.contains(dep) {
                continue;
            }
            *in_degree.get_mut(id).unwrap() += 1;
            dependents.entry(dep.clone()).or_default().push(id.clone());
        }
    }

    let mut waves = Vec::new();
    let mut processed = HashSet::new();

    while processed.len() < node_ids.len() {
        let ready: Vec<InstanceId> = in_degree
            .iter()
            .filter(|(id, degree)| **degree == 0 && !processed.contains(*id))
            .map(|(id, _)| id.clone())
            .collect();

        if ready.is_empty() {
            let stuck: Vec<String> = node_ids
                .iter()
                .filter(|id| !processed.contains(*id))
                .map(|id| id.to_string())
                .collect();
            return Err(OrchestratorError::CycleDetected(stuck));
        }

        for id in &ready {
            processed.insert(id.clone());
            in_degree.remove(id);
            if let Some(deps) = dependents.get(id) {
                for dependent in deps {
                    if let Some(d) = in_degree.get_mut(dependent) {
                        *d -= 1;
                    }
                }
            }
        }

        waves.push(ready);
    }

    Ok(waves)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> InstanceId {
        InstanceId::from(s)
    }

    #[test]
    fn independent_instances_share_a_wave() {
        let nodes = vec![id("unit:a"), id("unit:b")];
        let edges = HashMap::new();
        let waves = topological_waves(&nodes, &edges).unwrap();
        assert_eq!(waves.len(), 1);
        assert_eq!(waves[0].len(), 2);
    }

    #[test]
    fn chain_produces_one_wave_per_link() {
        let nodes = vec![id("unit:a"), id("unit:b"), id("unit:c")];
        let mut edges = HashMap::new();
        edges.insert(id("unit:b"), vec![id("unit:a")]);
        edges.insert(id("unit:c"), vec![id("unit:b")]);

        let waves = topological_waves(&nodes, &edges).unwrap();
        assert_eq!(waves, vec![vec![id("unit:a")], vec![id("unit:b")], vec![id("unit:c")]]);
    }

    #[test]
    fn cycle_is_rejected() {
        let nodes = vec![id("unit:a"), id("unit:b")];
        let mut edges = HashMap::new();
        edges.insert(id("unit:a"), vec![id("unit:b")]);
        edges.insert(id("unit:b"), vec![id("unit:a")]);

        assert!(topological_waves(&nodes, &edges).is_err());
    }

    #[test]
    fn dependency_outside_the_set_is_ignored() {
        let nodes = vec![id("unit:b")];
        let mut edges = HashMap::new();
        edges.insert(id("unit:b"), vec![id("unit:a")]); // a belongs to an earlier phase

        let waves = topological_waves(&nodes, &edges).unwrap();
        assert_eq!(waves, vec![vec![id("unit:b")]]);
    }
}
