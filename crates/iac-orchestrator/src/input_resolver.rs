//! Component A: the Input Resolver (spec §4, Glossary "resolved input").
//!
//! Every instance declares its inputs as `(instanceId, output)` pairs,
//! but `instanceId` may name a hub rather than a producing unit. A hub
//! re-exposes a set of named outputs, each itself an ordered list of
//! references that may point at other hubs. Resolving an instance's
//! inputs means expanding every hub reference, in declaration order,
//! until only direct unit/composite references remain.

use crate::error::{OrchestratorError, Result};
use iac_storage::{Hub, Instance, InstanceId, RawInputRef, ResolvedInput};
use std::collections::{HashMap, HashSet};

pub struct InputResolver {
    hubs: HashMap<InstanceId, Hub>,
}

impl InputResolver {
    pub fn new(hubs: &[Hub]) -> Self {
        Self {
            hubs: hubs.iter().map(|h| (h.id.clone(), h.clone())).collect(),
        }
    }

    /// Resolves every declared input on `instance` into its flattened,
    /// hub-free form.
    pub fn resolve_instance_inputs(
        &self,
        instance: &Instance,
    ) -> Result<HashMap<String, Vec<ResolvedInput>>> {
        let mut resolved = HashMap::with_capacity(instance.inputs.len());
        for (name, refs) in &instance.inputs {
            let mut visiting = HashSet::new();
            visiting.insert(instance.id.clone());
            resolved.insert(name.clone(), self.resolve_refs(refs, &mut visiting)?);
        }
        Ok(resolved)
    }

    /// The distinct set of producer instance ids an instance's resolved
    /// inputs depend on — the edge list `dependents.rs` indexes.
    pub fn dependency_producers(&self, instance: &Instance) -> Result<Vec<InstanceId>> {
        let resolved = self.resolve_instance_inputs(instance)?;
        let mut seen = HashSet::new();
        let mut producers = Vec::new();
        for refs in resolved.values() {
            for r in refs {
                if seen.insert(r.producer_instance_id.clone()) {
                    producers.push(r.producer_instance_id.clone());
                }
            }
        }
        Ok(producers)
    }

    fn resolve_refs(
        &self,
        refs: &[RawInputRef],
        visiting: &mut HashSet<InstanceId>,
    ) -> Result<Vec<ResolvedInput>> {
        let mut out = Vec::new();
        for r in refs {
            match self.hubs.get(&r.instance_id) {
                None => out.push(ResolvedInput {
                    producer_instance_id: r.instance_id.clone(),
                    output: r.output.clone(),
                }),
                Some(hub) => {
                    if !visiting.insert(hub.id.clone()) {
                        return Err(OrchestratorError::config(format!(
                            "hub cycle detected at {}",
                            hub.id
                        )));
                    }
                    let inner = hub.inputs.get(&r.output).map(|v| v.as_slice()).unwrap_or(&[]);
                    out.extend(self.resolve_refs(inner, visiting)?);
                    visiting.remove(&hub.id);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn raw(instance: &str, output: &str) -> RawInputRef {
        RawInputRef {
            instance_id: InstanceId::from(instance),
            output: output.to_string(),
        }
    }

    #[test]
    fn direct_reference_passes_through() {
        let resolver = InputResolver::new(&[]);
        let mut instance = Instance::new_unit("unit:consumer", "aws:lambda");
        instance.inputs.insert("bucket".into(), vec![raw("unit:producer", "arn")]);

        let resolved = resolver.resolve_instance_inputs(&instance).unwrap();
        assert_eq!(
            resolved["bucket"],
            vec![ResolvedInput {
                producer_instance_id: InstanceId::from("unit:producer"),
                output: "arn".to_string(),
            }]
        );
    }

    #[test]
    fn hub_reference_splices_in_its_inputs() {
        let mut hub_inputs = Map::new();
        hub_inputs.insert("arn".to_string(), vec![raw("unit:producer", "arn")]);
        let hub = Hub {
            id: InstanceId::from("hub:network"),
            inputs: hub_inputs,
        };
        let resolver = InputResolver::new(&[hub]);

        let mut instance = Instance::new_unit("unit:consumer", "aws:lambda");
        instance
            .inputs
            .insert("bucket".into(), vec![raw("hub:network", "arn")]);

        let resolved = resolver.resolve_instance_inputs(&instance).unwrap();
        assert_eq!(
            resolved["bucket"],
            vec![ResolvedInput {
                producer_instance_id: InstanceId::from("unit:producer"),
                output: "arn".to_string(),
            }]
        );
    }

    #[test]
    fn nested_hubs_resolve_transitively() {
        let mut inner_inputs = Map::new();
        inner_inputs.insert("x".to_string(), vec![raw("unit:root", "out")]);
        let inner = Hub {
            id: InstanceId::from("hub:inner"),
            inputs: inner_inputs,
        };

        let mut outer_inputs = Map::new();
        outer_inputs.insert("x".to_string(), vec![raw("hub:inner", "x")]);
        let outer = Hub {
            id: InstanceId::from("hub:outer"),
            inputs: outer_inputs,
        };

        let resolver = InputResolver::new(&[inner, outer]);
        let mut instance = Instance::new_unit("unit:consumer", "aws:lambda");
        instance.inputs.insert("in".into(), vec![raw("hub:outer", "x")]);

        let resolved = resolver.resolve_instance_inputs(&instance).unwrap();
        assert_eq!(
            resolved["in"],
            vec![ResolvedInput {
                producer_instance_id: InstanceId::from("unit:root"),
                output: "out".to_string(),
            }]
        );
    }

    #[test]
    fn hub_cycle_is_rejected() {
        let mut a_inputs = Map::new();
        a_inputs.insert("x".to_string(), vec![raw("hub:b", "x")]);
        let a = Hub {
            id: InstanceId::from("hub:a"),
            inputs: a_inputs,
        };
        let mut b_inputs = Map::new();
        b_inputs.insert("x".to_string(), vec![raw("hub:a", "x")]);
        let b = Hub {
            id: InstanceId::from("hub:b"),
            inputs: b_inputs,
        };

        let resolver = InputResolver::new(&[a, b]);
        let mut instance = Instance::new_unit("unit:consumer", "aws:lambda");
        instance.inputs.insert("in".into(), vec![raw("hub:a", "x")]);

        assert!(resolver.resolve_instance_inputs(&instance).is_err());
    }

    #[test]
    fn dependency_producers_dedupes_across_inputs() {
        let resolver = InputResolver::new(&[]);
        let mut instance = Instance::new_unit("unit:consumer", "aws:lambda");
        instance
            .inputs
            .insert("a".into(), vec![raw("unit:producer", "x")]);
        instance
            .inputs
            .insert("b".into(), vec![raw("unit:producer", "y")]);

        let producers = resolver.dependency_producers(&instance).unwrap();
        assert_eq!(producers, vec![InstanceId::from("unit:producer")]);
    }
}
