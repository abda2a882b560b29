//! Operation options (spec §4.1 "Options (enumerated)").

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationOptions {
    /// Cascade destroy to dependents. Default true.
    pub destroy_dependent_instances: bool,
    /// Include all dependencies even when up-to-date.
    pub force_update_dependencies: bool,
    /// Do not include any dependencies. Mutually exclusive with
    /// `force_update_dependencies`.
    pub ignore_dependencies: bool,
    /// Include all children of substantive composites even when up-to-date.
    pub force_update_children: bool,
    /// Do not auto-include up-to-date/outdated siblings when a composite
    /// becomes substantive via external dependency.
    pub allow_partial_composite_instance_update: bool,
    /// Same as above, for destroy.
    pub allow_partial_composite_instance_destruction: bool,
    /// Passed through to the Runtime; does not affect inclusion.
    pub invoke_destroy_triggers: bool,
    pub delete_unreachable_resources: bool,
    pub force_delete_state: bool,
    pub refresh: bool,
    pub debug: bool,
}

impl Default for OperationOptions {
    fn default() -> Self {
        Self {
            destroy_dependent_instances: true,
            force_update_dependencies: false,
            ignore_dependencies: false,
            force_update_children: false,
            allow_partial_composite_instance_update: false,
            allow_partial_composite_instance_destruction: false,
            invoke_destroy_triggers: false,
            delete_unreachable_resources: false,
            force_delete_state: false,
            refresh: false,
            debug: false,
        }
    }
}

impl OperationOptions {
    /// Spec §4.1: `forceUpdateDependencies` + `ignoreDependencies` together
    /// is a caller error.
    pub fn is_valid(&self) -> bool {
        !(self.force_update_dependencies && self.ignore_dependencies)
    }
}
