//! Component B: input/output hash computation (spec §4, Glossary
//! "input hash", "output hash", "self hash").
//!
//! `selfHash` folds an instance's type and declared args; `dependencyOutputHash`
//! folds the output hashes of everything it resolves inputs from;
//! `inputHash` folds both. An instance is up to date for `update` when its
//! freshly computed `inputHash` matches the value recorded on its last
//! successful state.

use dashmap::DashMap;
use iac_storage::{Instance, InstanceId};
use sha2::{Digest, Sha256};
use std::hash::Hasher;

fn digest_to_u64(bytes: &[u8]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    hasher.write(bytes);
    hasher.finish()
}

pub fn compute_self_hash(instance: &Instance) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(instance.r#type.as_bytes());
    hasher.update(instance.args.to_string().as_bytes());
    digest_to_u64(&hasher.finalize())
}

/// `None` when any upstream producer's output hash is not yet known —
/// that instance has not completed at least one successful operation, so
/// the dependent cannot be considered up to date either.
pub fn compute_dependency_output_hash(producer_output_hashes: &[Option<u64>]) -> Option<u64> {
    let mut hasher = Sha256::new();
    for h in producer_output_hashes {
        hasher.update((*h)?.to_le_bytes());
    }
    Some(digest_to_u64(&hasher.finalize()))
}

pub fn compute_input_hash(self_hash: u64, dependency_output_hash: Option<u64>) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(self_hash.to_le_bytes());
    hasher.update(dependency_output_hash.unwrap_or(0).to_le_bytes());
    hasher.update([dependency_output_hash.is_some() as u8]);
    digest_to_u64(&hasher.finalize())
}

/// Per-operation memo of computed `dependencyOutputHash` values, keyed by
/// instance id. The Planner recomputes these while walking the graph in
/// dependency order; a `DashMap` lets concurrent branches of the fixed
/// point loop share results without recomputation.
#[derive(Default)]
pub struct DependencyHashCache {
    dependency_output_hash: DashMap<InstanceId, Option<u64>>,
}

impl DependencyHashCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, instance_id: &InstanceId) -> Option<Option<u64>> {
        self.dependency_output_hash.get(instance_id).map(|v| *v)
    }

    pub fn set(&self, instance_id: InstanceId, value: Option<u64>) {
        self.dependency_output_hash.insert(instance_id, value);
    }

    pub fn get_or_compute(
        &self,
        instance_id: &InstanceId,
        compute: impl FnOnce() -> Option<u64>,
    ) -> Option<u64> {
        *self
            .dependency_output_hash
            .entry(instance_id.clone())
            .or_insert_with(compute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_hash_is_deterministic() {
        let instance = Instance::new_unit("unit:a", "aws:bucket");
        assert_eq!(compute_self_hash(&instance), compute_self_hash(&instance));
    }

    #[test]
    fn self_hash_changes_with_args() {
        let mut a = Instance::new_unit("unit:a", "aws:bucket");
        let mut b = a.clone();
        a.args = serde_json::json!({"name": "one"});
        b.args = serde_json::json!({"name": "two"});
        assert_ne!(compute_self_hash(&a), compute_self_hash(&b));
    }

    #[test]
    fn dependency_output_hash_is_none_when_a_producer_is_unresolved() {
        assert_eq!(compute_dependency_output_hash(&[Some(1), None]), None);
        assert!(compute_dependency_output_hash(&[Some(1), Some(2)]).is_some());
    }

    #[test]
    fn input_hash_distinguishes_missing_from_present_dependency_hash() {
        let with_deps = compute_input_hash(7, Some(0));
        let without_deps = compute_input_hash(7, None);
        assert_ne!(with_deps, without_deps);
    }

    #[test]
    fn cache_computes_once_per_key() {
        let cache = DependencyHashCache::new();
        let id = InstanceId::from("unit:a");
        let mut calls = 0;
        cache.get_or_compute(&id, || {
            calls += 1;
            Some(1)
        });
        cache.get_or_compute(&id, || {
            calls += 1;
            Some(2)
        });
        assert_eq!(calls, 1);
        assert_eq!(cache.get(&id), Some(Some(1)));
    }
}
