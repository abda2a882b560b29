//! Reverse dependency index and cascade propagation for the Planner's
//! `DependentCascade` inclusion reason (spec §4.1): when a unit is
//! destroyed or recreated, every instance that consumes one of its
//! outputs — transitively — is pulled into the plan unless
//! `ignore_dependencies` is set.

use iac_storage::InstanceId;
use std::collections::{HashMap, HashSet, VecDeque};

/// Maps a producer instance to the instances that declare a (possibly
/// hub-mediated) input referencing it.
pub struct ReverseDependencyIndex {
    dependents_of: HashMap<InstanceId, Vec<InstanceId>>,
}

impl ReverseDependencyIndex {
    pub fn new() -> Self {
        Self {
            dependents_of: HashMap::new(),
        }
    }

    /// Build the index from resolved edges: `consumer -> [producers it
    /// depends on]` (the Input Resolver's output, post hub-expansion).
    pub fn from_edges(edges: &HashMap<InstanceId, Vec<InstanceId>>) -> Self {
        let mut index = Self::new();
        for (consumer, producers) in edges {
            for producer in producers {
                index
                    .dependents_of
                    .entry(producer.clone())
                    .or_default()
                    .push(consumer.clone());
            }
        }
        index
    }

    pub fn direct_dependents(&self, producer: &InstanceId) -> &[InstanceId] {
        self.dependents_of
            .get(producer)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// BFS over the reverse-dependency edges, starting from `seeds`.
    /// Returns every transitively dependent instance, seeds excluded.
    pub fn transitive_dependents(&self, seeds: &HashSet<InstanceId>) -> HashSet<InstanceId> {
        let mut seen: HashSet<InstanceId> = seeds.clone();
        let mut affected = HashSet::new();
        let mut queue: VecDeque<InstanceId> = seeds.iter().cloned().collect();

        while let Some(current) = queue.pop_front() {
            for dependent in self.direct_dependents(&current) {
                if seen.insert(dependent.clone()) {
                    affected.insert(dependent.clone());
                    queue.push_back(dependent.clone());
                }
            }
        }

        affected
    }
}

impl Default for ReverseDependencyIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> InstanceId {
        InstanceId::from(s)
    }

    #[test]
    fn direct_dependent_is_found() {
        let mut edges = HashMap::new();
        edges.insert(id("unit:b"), vec![id("unit:a")]); // b depends on a
        let index = ReverseDependencyIndex::from_edges(&edges);

        assert_eq!(index.direct_dependents(&id("unit:a")), &[id("unit:b")]);
    }

    #[test]
    fn transitive_cascade_follows_chain() {
        let mut edges = HashMap::new();
        edges.insert(id("unit:b"), vec![id("unit:a")]);
        edges.insert(id("unit:c"), vec![id("unit:b")]);
        let index = ReverseDependencyIndex::from_edges(&edges);

        let seeds = HashSet::from([id("unit:a")]);
        let affected = index.transitive_dependents(&seeds);

        assert_eq!(affected, HashSet::from([id("unit:b"), id("unit:c")]));
    }

    #[test]
    fn diamond_cascade_visits_each_instance_once() {
        let mut edges = HashMap::new();
        edges.insert(id("unit:b"), vec![id("unit:a")]);
        edges.insert(id("unit:c"), vec![id("unit:a")]);
        edges.insert(id("unit:d"), vec![id("unit:b"), id("unit:c")]);
        let index = ReverseDependencyIndex::from_edges(&edges);

        let seeds = HashSet::from([id("unit:a")]);
        let affected = index.transitive_dependents(&seeds);

        assert_eq!(
            affected,
            HashSet::from([id("unit:b"), id("unit:c"), id("unit:d")])
        );
    }

    #[test]
    fn unrelated_instance_is_not_affected() {
        let mut edges = HashMap::new();
        edges.insert(id("unit:b"), vec![id("unit:a")]);
        let index = ReverseDependencyIndex::from_edges(&edges);

        let seeds = HashSet::from([id("unit:a")]);
        let affected = index.transitive_dependents(&seeds);
        assert!(!affected.contains(&id("unit:x")));
    }
}
